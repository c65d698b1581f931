//! Where rendered pages go.

pub mod directory;
pub mod memory;
pub mod remote;

use std::{fmt, num::NonZeroU32, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::infra::store::{StoreConnector, StoreError, TxnError};

pub use directory::DirectoryWriter;
pub use memory::{MemoryOutput, MemoryWriter};
pub use remote::{RemoteSpec, RemoteWriter, SUFFIX};

/// One rendered page ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTask {
    pub id: String,
    /// Template the page was rendered with; `None` for raw or manual pages.
    pub template_name: Option<String>,
    pub body: Vec<u8>,
    pub content_type: String,
}

impl PageTask {
    pub fn html(id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            template_name: None,
            body: body.into(),
            content_type: "text/html".into(),
        }
    }
}

/// Output kind, fixed when a builder is constructed.
#[derive(Clone)]
pub enum Target {
    InMemory(MemoryOutput),
    Directory(PathBuf),
    RemoteDocument(RemoteSpec),
    /// An embedder-supplied writer, used as is.
    Writer(Arc<dyn PageWriter>),
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::InMemory(output) => f.debug_tuple("InMemory").field(output).finish(),
            Target::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
            Target::RemoteDocument(spec) => f.debug_tuple("RemoteDocument").field(spec).finish(),
            Target::Writer(writer) => f.debug_tuple("Writer").field(&writer.handle()).finish(),
        }
    }
}

impl Target {
    /// `http(s)://` locations are remote documents; anything else is a
    /// directory path.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Target::RemoteDocument(RemoteSpec::url(raw))
        } else {
            Target::Directory(PathBuf::from(raw))
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Target::InMemory(_) => "memory",
            Target::Directory(_) => "directory",
            Target::RemoteDocument(_) => "remote",
            Target::Writer(_) => "custom",
        }
    }
}

/// What a deploy hands to listeners.
#[derive(Debug, Clone)]
pub enum OutputHandle {
    Memory(MemoryOutput),
    Directory(PathBuf),
    Remote { url: String, document: String },
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("{0}")]
    Validation(String),
    #[error("output io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Txn(#[from] TxnError<StoreError>),
}

impl OutputError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[async_trait]
pub trait PageWriter: Send + Sync {
    async fn write(&self, page: &PageTask) -> Result<(), OutputError>;

    async fn remove(&self, id: &str) -> Result<(), OutputError>;

    fn handle(&self) -> OutputHandle;
}

/// Validates `target` and readies it for writes. Nothing is written when
/// validation fails.
pub async fn prepare(
    target: &Target,
    connector: &dyn StoreConnector,
    max_attempts: NonZeroU32,
) -> Result<Arc<dyn PageWriter>, OutputError> {
    match target {
        Target::InMemory(output) => Ok(Arc::new(MemoryWriter::new(output.clone()))),
        Target::Directory(path) => Ok(Arc::new(DirectoryWriter::prepare(path).await?)),
        Target::RemoteDocument(spec) => Ok(Arc::new(
            RemoteWriter::prepare(spec, connector, max_attempts).await?,
        )),
        Target::Writer(writer) => Ok(Arc::clone(writer)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_distinguishes_urls_from_paths() {
        assert_eq!(Target::parse("http://host:5984/db/doc").kind(), "remote");
        assert_eq!(Target::parse("https://host/db/doc").kind(), "remote");
        assert_eq!(Target::parse("./public").kind(), "directory");
    }

    #[tokio::test]
    async fn supplied_writers_are_used_as_is() {
        let output = MemoryOutput::new();
        let writer: Arc<dyn PageWriter> = Arc::new(MemoryWriter::new(output.clone()));
        let target = Target::Writer(Arc::clone(&writer));
        assert_eq!(target.kind(), "custom");

        let prepared = prepare(
            &target,
            &crate::infra::store::MemoryServer::new(),
            NonZeroU32::MIN,
        )
        .await
        .expect("prepare");
        assert!(Arc::ptr_eq(&prepared, &writer));
        prepared
            .write(&PageTask::html("foo", "hi"))
            .await
            .expect("write");
        assert_eq!(output.get("foo").as_deref(), Some("hi"));
    }
}
