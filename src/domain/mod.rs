pub mod document;
pub mod error;
pub mod events;
pub mod types;

pub use document::{
    Attachment, AttachmentBody, CompiledTemplate, DESIGN_PREFIX, Document, logical_name,
};
pub use error::DocumentError;
pub use events::{ChangeEvent, FeedEvent};
pub use types::{DeletedPolicy, QueueRule, RenderFailurePolicy};
