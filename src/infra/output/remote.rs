//! Pages stored as attachments of one document in the store.

use std::num::NonZeroU32;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::Attachment;
use crate::infra::store::{
    Mutator, Probe, StoreConnector, StoreLocation, UpdateMode,
};

use super::{OutputError, OutputHandle, PageTask, PageWriter};

/// Appended to the addressed document id so the builder never overwrites
/// the document it was pointed at.
pub const SUFFIX: &str = "-staticplus";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    location: String,
    exact: Option<ExactDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExactDocument {
    document: String,
    namespace: Option<String>,
}

impl RemoteSpec {
    /// A document URL, resolved by probing when the builder prepares.
    pub fn url(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            exact: None,
        }
    }

    /// A known document inside `database_url`; pages are keyed under
    /// `namespace/` and also reachable with a trailing slash.
    pub fn site(
        database_url: impl Into<String>,
        document: impl Into<String>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            location: database_url.into(),
            exact: Some(ExactDocument {
                document: document.into(),
                namespace,
            }),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

pub struct RemoteWriter {
    mutator: Mutator,
    document: String,
    namespace: Option<String>,
    url: String,
    writes: Mutex<()>,
}

impl std::fmt::Debug for RemoteWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWriter")
            .field("url", &self.url)
            .field("document", &self.document)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl RemoteWriter {
    pub async fn prepare(
        spec: &RemoteSpec,
        connector: &dyn StoreConnector,
        max_attempts: NonZeroU32,
    ) -> Result<Self, OutputError> {
        let location = StoreLocation::parse(&spec.location)
            .map_err(|err| OutputError::validation(err.to_string()))?;
        let Some(database) = location.database().map(str::to_string) else {
            return Err(OutputError::validation(format!(
                "Need a database URL, not a server URL: {}",
                spec.location
            )));
        };

        if let Some(exact) = &spec.exact {
            let server = connector.connect(&location.server)?;
            let store = server.database(&database);
            return Ok(Self {
                url: store.url().to_string(),
                mutator: Mutator::new(store, max_attempts),
                document: exact.document.clone(),
                namespace: exact.namespace.clone(),
                writes: Mutex::new(()),
            });
        }

        let document = resolve_document(&location, connector, &spec.location).await?;
        let server = connector.connect(&location.server)?;
        let store = server.database(&database);
        info!(
            target = "staticplus::infra::output::remote",
            url = %spec.location,
            document = %document,
            "remote output resolved"
        );
        Ok(Self {
            url: store.url().to_string(),
            mutator: Mutator::new(store, max_attempts),
            document,
            namespace: None,
            writes: Mutex::new(()),
        })
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    fn keys(&self, id: &str) -> Vec<String> {
        match &self.namespace {
            Some(namespace) => {
                let key = format!("{namespace}/{id}").trim_end_matches('/').to_string();
                let slashed = format!("{key}/");
                vec![key, slashed]
            }
            None if id.is_empty() => vec!["index".to_string()],
            None => vec![id.to_string()],
        }
    }
}

/// Works out which document pages should land in, without writing.
async fn resolve_document(
    location: &StoreLocation,
    connector: &dyn StoreConnector,
    raw: &str,
) -> Result<String, OutputError> {
    let Some(document) = location.document_id() else {
        return Err(OutputError::validation(if location.segments.len() == 1 {
            format!("Need a document URL inside the database, not the database itself: {raw}")
        } else {
            format!("Target URL nests too deeply to name a document: {raw}")
        }));
    };

    let server = connector.connect(&location.server)?;
    match server.probe(&location.segments).await? {
        Probe::Document { .. } => Ok(format!("{document}{SUFFIX}")),
        Probe::Missing => {
            let parent = location.segments[..1].to_vec();
            match server.probe(&parent).await? {
                Probe::Database(_) => Ok(format!("{document}{SUFFIX}")),
                Probe::Server => Err(OutputError::validation(format!(
                    "Need a database URL, not a server URL: {raw}"
                ))),
                Probe::Missing => Err(OutputError::validation(format!(
                    "Database for target URL does not exist: {raw}"
                ))),
                other => Err(OutputError::validation(format!(
                    "Unknown response for the target database: {other:?}"
                ))),
            }
        }
        Probe::Server => Err(OutputError::validation(format!(
            "Need a database URL, not a server URL: {raw}"
        ))),
        Probe::Database(_) => Err(OutputError::validation(format!(
            "Need a document URL inside the database, not the database itself: {raw}"
        ))),
        Probe::Other(body) => Err(OutputError::validation(format!(
            "Unknown response for target URL {raw}: {body}"
        ))),
    }
}

#[async_trait]
impl PageWriter for RemoteWriter {
    async fn write(&self, page: &PageTask) -> Result<(), OutputError> {
        let keys = self.keys(&page.id);
        let _guard = self.writes.lock().await;
        let committed = self
            .mutator
            .update(&self.document, UpdateMode::CreateIfMissing, |doc| {
                for key in &keys {
                    doc.attachments.insert(
                        key.clone(),
                        Attachment::inline(page.content_type.clone(), page.body.clone()),
                    );
                }
                Ok(())
            })
            .await?;
        debug!(
            target = "staticplus::infra::output::remote",
            page = %page.id,
            document = %self.document,
            attempts = committed.attempts,
            "page attached"
        );
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), OutputError> {
        let keys = self.keys(id);
        let _guard = self.writes.lock().await;
        self.mutator
            .update(&self.document, UpdateMode::CreateIfMissing, |doc| {
                for key in &keys {
                    doc.attachments.remove(key);
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    fn handle(&self) -> OutputHandle {
        OutputHandle::Remote {
            url: self.url.clone(),
            document: self.document.clone(),
        }
    }
}
