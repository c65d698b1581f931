//! Page rendering: templates compiled from attachments, rendered against a
//! layered scope of documents with a small set of HTML helpers.

mod engine;
mod helpers;
mod scope;

use thiserror::Error;

pub use engine::TemplateEngine;
pub use helpers::{HELPER_NAMES, boxed};
pub use scope::Scope;

/// Content type of the page substituted for a failed render.
pub const DIAGNOSTIC_CONTENT_TYPE: &str = "text/plain";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("template `{name}` failed to compile: {message}")]
    Compile { name: String, message: String },
    #[error("template `{name}` not found")]
    Missing { name: String },
    #[error("template `{name}` failed: {message}")]
    Execute { name: String, message: String },
}

impl RenderError {
    /// Body of the plain-text page that replaces a failed render.
    pub fn diagnostic(&self) -> String {
        format!("{self}\n")
    }
}
