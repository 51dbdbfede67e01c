use chrono::{DateTime, Utc};

/// Wall-clock source.  Rate windows and verdict lifetimes are wall-clock
/// aligned, so everything time-dependent in the relay reads through this.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
