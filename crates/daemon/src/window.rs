use chrono::{NaiveTime, Timelike};

/// Time of day during which new work may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingWindow {
    bounds: Option<(NaiveTime, NaiveTime)>,
}

impl ProcessingWindow {
    pub fn always() -> Self {
        Self { bounds: None }
    }

    pub fn between(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            bounds: Some((start, end)),
        }
    }

    /// Parse `HH:MM` bounds. Equal bounds are rejected as ambiguous.
    pub fn parse(start: &str, end: &str) -> Result<Self, String> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M")
                .map_err(|_| format!("invalid window time {s:?}, expected HH:MM"))
        };
        let (start, end) = (parse(start)?, parse(end)?);
        if start == end {
            return Err(format!("window start and end are both {start}"));
        }
        Ok(Self::between(start, end))
    }

    /// Start inclusive, end exclusive. A window whose end is before its start
    /// wraps past midnight.
    pub fn contains(&self, at: NaiveTime) -> bool {
        let Some((start, end)) = self.bounds else {
            return true;
        };
        let at = at.with_nanosecond(0).unwrap_or(at);
        if start < end {
            start <= at && at < end
        } else {
            at >= start || at < end
        }
    }

    pub fn is_open_now(&self) -> bool {
        self.contains(chrono::Local::now().time())
    }
}

impl std::fmt::Display for ProcessingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.bounds {
            None => f.write_str("always"),
            Some((start, end)) => write!(f, "{}-{}", start.format("%H:%M"), end.format("%H:%M")),
        }
    }
}
