use std::{error::Error as StdError, path::PathBuf};

use thiserror::Error;

use crate::{
    application::{build::TransitionError, feed::FeedError, render::RenderError},
    infra::{
        error::InfraError,
        output::OutputError,
        store::{StoreError, TxnError},
    },
};

/// Coarse classification used for logging and exit reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Validation,
    Conflict,
    Render,
    Authorization,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Render => "render",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("store request failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("document update failed: {0}")]
    Txn(#[from] TxnError<StoreError>),
    #[error("render failed for page `{page}`: {source}")]
    Render {
        page: String,
        #[source]
        source: RenderError,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file watch failed: {0}")]
    Watch(#[from] notify::Error),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl BuildError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Validation(_) => ErrorKind::Validation,
            BuildError::Authorization(_) => ErrorKind::Authorization,
            BuildError::Store(err) => store_kind(err),
            BuildError::Feed(FeedError::Store(err)) => store_kind(err),
            BuildError::Feed(FeedError::Inactivity(_)) => ErrorKind::Transport,
            BuildError::Txn(TxnError::ConflictExhausted { .. }) => ErrorKind::Conflict,
            BuildError::Txn(TxnError::Failed(err)) => store_kind(err),
            BuildError::Render { .. } => ErrorKind::Render,
            BuildError::Io { .. } | BuildError::Watch(_) => ErrorKind::Io,
            BuildError::Infra(_) | BuildError::Transition(_) => ErrorKind::Internal,
        }
    }
}

fn store_kind(err: &StoreError) -> ErrorKind {
    match err {
        StoreError::Conflict { .. } => ErrorKind::Conflict,
        StoreError::InvalidUrl(_) | StoreError::Rejected(_) => ErrorKind::Validation,
        StoreError::Transport(_)
        | StoreError::Status { .. }
        | StoreError::NotFound { .. }
        | StoreError::Decode(_) => ErrorKind::Transport,
    }
}

impl From<OutputError> for BuildError {
    fn from(err: OutputError) -> Self {
        match err {
            OutputError::Validation(message) => BuildError::Validation(message),
            OutputError::Io { path, source } => BuildError::Io { path, source },
            OutputError::Store(err) => BuildError::Store(err),
            OutputError::Txn(err) => BuildError::Txn(err),
        }
    }
}

/// An error and its chain of causes, flattened for logging.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(error: &BuildError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            kind: error.kind(),
            messages,
        }
    }

    pub fn causes(&self) -> String {
        self.messages.join(": ")
    }
}
