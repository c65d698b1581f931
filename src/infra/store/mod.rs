//! Document store contract shared by the CouchDB client and the in-memory
//! store used in tests and local runs.

pub mod couch;
pub mod memory;
pub mod txn;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::domain::{ChangeEvent, DESIGN_PREFIX, Document};

pub use couch::{CouchConnector, CouchServer, Credentials};
pub use memory::MemoryServer;
pub use txn::{
    Attempt, Committed, DEFAULT_MAX_ATTEMPTS, Mutator, TxnError, UpdateMode, transact,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("document update conflict on `{id}`")]
    Conflict { id: String },
    #[error("`{what}` not found")]
    NotFound { what: String },
    #[error("failed to decode store response: {0}")]
    Decode(String),
    #[error("invalid store URL: {0}")]
    InvalidUrl(String),
    #[error("update rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<url::ParseError> for StoreError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

/// Server greeting returned by `GET /`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub couchdb: String,
    pub version: Option<String>,
}

impl Welcome {
    pub fn is_couchdb(&self) -> bool {
        self.couchdb == "Welcome"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Session {
    pub ok: bool,
    pub name: Option<String>,
    pub roles: Vec<String>,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == "_admin")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub db_name: String,
    pub update_seq: u64,
    pub doc_count: u64,
}

/// Classification of whatever lives at a URL on the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    Server,
    Database(DatabaseInfo),
    Document { id: String, rev: String },
    Missing,
    Other(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// Return what is already in the log and finish.
    Normal,
    /// Hold the request open until a change arrives or `timeout` passes.
    LongPoll { timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesQuery {
    pub since: u64,
    /// Opaque sequence the server handed out, sent back verbatim in place
    /// of `since`. Clustered servers cannot resume from a bare number.
    pub resume: Option<String>,
    pub limit: Option<u64>,
    pub mode: FeedMode,
    pub filter: Option<String>,
    pub include_docs: bool,
}

impl ChangesQuery {
    pub fn normal(since: u64) -> Self {
        Self {
            since,
            resume: None,
            limit: None,
            mode: FeedMode::Normal,
            filter: None,
            include_docs: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangesBatch {
    pub results: Vec<ChangeEvent>,
    pub last_seq: u64,
    /// `last_seq` as the server spelled it, when that was not a plain number.
    pub resume: Option<String>,
}

/// One database on a store server.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &str;

    /// Absolute URL of the database.
    fn url(&self) -> &Url;

    async fn info(&self) -> Result<DatabaseInfo, StoreError>;

    /// Creates the database; returns `false` when it already existed.
    async fn create(&self) -> Result<bool, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError>;

    /// Writes `doc` at its current revision and returns the new revision.
    async fn put(&self, doc: &Document) -> Result<String, StoreError>;

    /// Current revision of `id`, without the body.
    async fn head(&self, id: &str) -> Result<Option<String>, StoreError>;

    /// Server-side copy of `source` at `source_rev` onto `dest`, which must
    /// be at `dest_rev` (or absent when `None`).
    async fn copy(
        &self,
        source: &str,
        source_rev: &str,
        dest: &str,
        dest_rev: Option<&str>,
    ) -> Result<String, StoreError>;

    async fn attachment(&self, id: &str, name: &str) -> Result<Vec<u8>, StoreError>;

    async fn changes(&self, query: &ChangesQuery) -> Result<ChangesBatch, StoreError>;

    fn document_url(&self, id: &str) -> Url {
        let mut url = self.url().clone();
        push_segments(&mut url, id_segments(id));
        url
    }

    fn attachment_url(&self, id: &str, name: &str) -> Url {
        let mut url = self.document_url(id);
        push_segments(&mut url, name.split('/'));
        url
    }
}

/// Server-level operations: greeting, session, configuration and probing.
#[async_trait]
pub trait StoreServer: Send + Sync {
    fn url(&self) -> &Url;

    async fn welcome(&self) -> Result<Welcome, StoreError>;

    async fn session(&self) -> Result<Session, StoreError>;

    async fn put_config(&self, section: &str, key: &str, value: &str) -> Result<(), StoreError>;

    /// Classifies the resource at the given decoded path segments.
    async fn probe(&self, segments: &[String]) -> Result<Probe, StoreError>;

    fn database(&self, name: &str) -> Arc<dyn DocumentStore>;
}

/// Builds server handles from URLs; the seam that lets tests swap CouchDB
/// for the in-memory store.
pub trait StoreConnector: Send + Sync {
    fn connect(&self, server: &Url) -> Result<Arc<dyn StoreServer>, StoreError>;
}

/// An http(s) URL split into its server root and decoded path segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocation {
    pub original: String,
    pub server: Url,
    pub segments: Vec<String>,
}

impl StoreLocation {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let url = Url::parse(raw)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StoreError::InvalidUrl(format!(
                "`{raw}` is not an http(s) URL"
            )));
        }

        let segments = url
            .path_segments()
            .map(|parts| {
                parts
                    .filter(|part| !part.is_empty())
                    .map(decode_segment)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut server = url.clone();
        server.set_path("/");
        server.set_query(None);
        server.set_fragment(None);

        Ok(Self {
            original: raw.to_string(),
            server,
            segments,
        })
    }

    pub fn database(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Document id addressed by the segments after the database, with
    /// design documents spanning two segments.
    pub fn document_id(&self) -> Option<String> {
        match self.segments.as_slice() {
            [_, design, name] if design == "_design" => Some(format!("{DESIGN_PREFIX}{name}")),
            [_, id] => Some(id.clone()),
            _ => None,
        }
    }
}

pub(crate) fn id_segments(id: &str) -> Vec<&str> {
    match id.strip_prefix(DESIGN_PREFIX) {
        Some(name) => vec!["_design", name],
        None => vec![id],
    }
}

pub(crate) fn push_segments<'a>(url: &mut Url, segments: impl IntoIterator<Item = &'a str>) {
    // http(s) URLs always have a path to extend.
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty();
        path.extend(segments);
    }
}

fn decode_segment(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}
