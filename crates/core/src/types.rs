use serde::{Deserialize, Serialize};

/// Which external catalogue owns a library file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Episode,
    Movie,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Episode => "episode",
            Self::Movie => "movie",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "episode" => Some(Self::Episode),
            "movie" => Some(Self::Movie),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job state machine.
///
/// ```text
/// Discovered → Reserved → Transcoding → Validating → Replacing → SyncingMetadata → Completed
///                  ↑
///                  └──────────── Failed ──→ PermanentlyFailed
/// ```
///
/// `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Discovered,
    Reserved,
    Transcoding,
    Validating,
    Replacing,
    SyncingMetadata,
    Completed,
    Failed,
    PermanentlyFailed,
}

impl JobState {
    pub const ALL: [JobState; 9] = [
        Self::Discovered,
        Self::Reserved,
        Self::Transcoding,
        Self::Validating,
        Self::Replacing,
        Self::SyncingMetadata,
        Self::Completed,
        Self::Failed,
        Self::PermanentlyFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Reserved => "reserved",
            Self::Transcoding => "transcoding",
            Self::Validating => "validating",
            Self::Replacing => "replacing",
            Self::SyncingMetadata => "syncing_metadata",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::PermanentlyFailed)
    }

    /// Non-terminal states hold the fingerprint's reservation.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// States in which a worker owns the job and is touching the disk.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Transcoding | Self::Validating | Self::Replacing | Self::SyncingMetadata
        )
    }

    /// Next state on the happy path, if any.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Discovered => Some(Self::Reserved),
            Self::Reserved => Some(Self::Transcoding),
            Self::Transcoding => Some(Self::Validating),
            Self::Validating => Some(Self::Replacing),
            Self::Replacing => Some(Self::SyncingMetadata),
            Self::SyncingMetadata => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::PermanentlyFailed => None,
        }
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Self::Failed, Self::Reserved | Self::PermanentlyFailed) => true,
            (Self::Failed, _) => false,
            (_, Self::Failed) => true,
            (from, to) => from.successor() == Some(to),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified reason a job attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    HardwareUnavailable,
    EncodeError,
    Timeout,
    ValidationFailed,
    InsufficientSpace,
    SourceMissing,
    Io,
    /// Reclaimed after the owning worker stopped heart-beating.
    Stale,
    /// Replacement could not be rolled forward after a crash.
    Interrupted,
    /// Another file already occupies the replacement's library path.
    TargetExists,
}

impl FailureReason {
    pub const ALL: [FailureReason; 10] = [
        Self::HardwareUnavailable,
        Self::EncodeError,
        Self::Timeout,
        Self::ValidationFailed,
        Self::InsufficientSpace,
        Self::SourceMissing,
        Self::Io,
        Self::Stale,
        Self::Interrupted,
        Self::TargetExists,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HardwareUnavailable => "hardware_unavailable",
            Self::EncodeError => "encode_error",
            Self::Timeout => "timeout",
            Self::ValidationFailed => "validation_failed",
            Self::InsufficientSpace => "insufficient_space",
            Self::SourceMissing => "source_missing",
            Self::Io => "io",
            Self::Stale => "stale",
            Self::Interrupted => "interrupted",
            Self::TargetExists => "target_exists",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|reason| reason.as_str() == s)
    }

    /// A reproducible encoder error, a vanished source or an occupied target
    /// path will fail the same way again.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::EncodeError | Self::SourceMissing | Self::TargetExists
        )
    }

    /// Free space can come back independently of the file, so running out of
    /// it does not count against the retry budget.
    pub fn consumes_attempt(self) -> bool {
        !matches!(self, Self::InsufficientSpace)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
