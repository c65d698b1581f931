use crate::application::promote::Promotion;
use crate::infra::output::OutputHandle;

/// Notifications a builder broadcasts to its observers.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    Started { builder: u64 },
    /// One page write completed.
    Page { id: String },
    /// Caught up with no writes in flight; the output is complete.
    Deploy(OutputHandle),
    Promoted(Promotion),
    Stopped { reason: Option<String> },
    /// Final event; `error` is set when the builder died of a failure.
    Died { error: Option<String> },
}

impl BuildEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BuildEvent::Started { .. } => "started",
            BuildEvent::Page { .. } => "page",
            BuildEvent::Deploy(_) => "deploy",
            BuildEvent::Promoted(_) => "promoted",
            BuildEvent::Stopped { .. } => "stopped",
            BuildEvent::Died { .. } => "died",
        }
    }
}
