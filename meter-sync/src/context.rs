use time::{Date, OffsetDateTime};

/// Who is acting and when. Passed explicitly into every engine, billing and
/// sync call instead of living in process-wide state.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub actor: String,
    pub now: OffsetDateTime,
}

impl ExecutionContext {
    pub fn new(actor: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            actor: actor.into(),
            now,
        }
    }

    /// Context for background work such as timer-driven sync.
    pub fn system() -> Self {
        Self::new("system", OffsetDateTime::now_utc())
    }

    pub fn today(&self) -> Date {
        self.now.date()
    }
}
