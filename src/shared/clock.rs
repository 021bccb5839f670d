use chrono::{DateTime, Utc};

/// Time source for everything that makes temporal decisions, so scenario
/// tests can step time instead of sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
