use super::document::Document;

/// One row of the store's change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub seq: u64,
    pub id: String,
    pub deleted: bool,
    /// Present when the feed was asked to include documents.
    pub document: Option<Document>,
}

/// What the feed consumer hands to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(ChangeEvent),
    /// The backlog is exhausted; carries the last sequence seen.
    CaughtUp(u64),
}

impl ChangeEvent {
    pub fn is_design(&self) -> bool {
        self.id.starts_with(super::document::DESIGN_PREFIX)
    }
}
