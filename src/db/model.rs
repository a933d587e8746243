//! Row views returned by the repository; domain types live in `crate::model`.

/// A claimed queue job. `payload` is the full tagged JSON (kind + payload) so
/// redeliveries deserialize exactly what was enqueued.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub attempt: i32,
}

/// Outcome of recording a category-completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryOutcome {
    /// Signal already recorded for this (tenant, category), or the cycle has
    /// already closed; nothing was decremented.
    Duplicate,
    /// Counter decremented; this many categories are still in flight.
    Remaining(i64),
    /// This signal was the last one: the analytics job is enqueued and the
    /// tenant's sync state is cleared.
    CycleComplete,
}

/// Customer fields the mail worker needs.
#[derive(Debug, Clone)]
pub struct MailTarget {
    pub email: Option<String>,
    pub segment: Option<String>,
}
