use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document JSON must be an object")]
    NotAnObject,
    #[error("document is missing its `{field}` member")]
    MissingField { field: &'static str },
    #[error("attachment `{name}` is malformed: {message}")]
    Attachment { name: String, message: String },
}

impl DocumentError {
    pub fn missing(field: &'static str) -> Self {
        Self::MissingField { field }
    }

    pub fn attachment(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Attachment {
            name: name.into(),
            message: message.into(),
        }
    }
}
