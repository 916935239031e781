use chrono::{DateTime, Utc};

/// Returns the current wall-clock time in UTC.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
