pub mod error;
pub mod job;
pub mod media;
pub mod retry;
pub mod types;

pub use error::StageError;
pub use job::{Job, NewJob};
pub use retry::{Disposition, RetryBudget};
pub use media::{Fingerprint, MediaFile, TranscodePlan};
pub use types::{FailureReason, JobState, MediaKind};
