//! In-process document store with revision checks and a live change log.
//!
//! Behaves like a single CouchDB node closely enough for the build pipeline:
//! revisions are checked on every write, attachments come back as stubs,
//! and long-poll change requests park until a write lands.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::{sync::Notify, time::Instant};
use url::Url;

use crate::domain::{Attachment, AttachmentBody, ChangeEvent, Document};
use crate::util::lock::mutex_lock;

use super::{
    ChangesBatch, ChangesQuery, DatabaseInfo, DocumentStore, FeedMode, Probe, Session,
    StoreConnector, StoreError, StoreServer, Welcome,
};

const LOCK_TARGET: &str = "staticplus::infra::store::memory";
const DEFAULT_URL: &str = "http://memory.invalid/";

#[derive(Clone)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    url: Url,
    state: Mutex<ServerState>,
    changed: Notify,
}

struct ServerState {
    greeting: String,
    roles: Vec<String>,
    config: BTreeMap<(String, String), String>,
    databases: BTreeMap<String, DbState>,
    forced_conflicts: HashMap<(String, String), u32>,
    stalled: bool,
}

#[derive(Default)]
struct DbState {
    seq: u64,
    docs: BTreeMap<String, StoredDoc>,
}

struct StoredDoc {
    seq: u64,
    generation: u64,
    current: Document,
    history: BTreeMap<String, Document>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        let url = Url::parse(DEFAULT_URL)
            .unwrap_or_else(|err| unreachable!("static URL failed to parse: {err}"));
        Self::with_url(url)
    }

    pub fn with_url(url: Url) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                url,
                state: Mutex::new(ServerState {
                    greeting: "Welcome".into(),
                    roles: vec!["_admin".into()],
                    config: BTreeMap::new(),
                    databases: BTreeMap::new(),
                    forced_conflicts: HashMap::new(),
                    stalled: false,
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Replaces the greeting returned by `welcome`.
    pub fn set_greeting(&self, greeting: impl Into<String>) {
        self.state("set_greeting").greeting = greeting.into();
    }

    pub fn set_roles(&self, roles: &[&str]) {
        self.state("set_roles").roles = roles.iter().map(|role| role.to_string()).collect();
    }

    /// The next `count` writes to `db/id` fail with a conflict.
    pub fn force_conflicts(&self, db: &str, id: &str, count: u32) {
        self.state("force_conflicts")
            .forced_conflicts
            .insert((db.to_string(), id.to_string()), count);
    }

    /// While stalled, change requests never answer.
    pub fn set_stalled(&self, stalled: bool) {
        self.state("set_stalled").stalled = stalled;
    }

    pub fn config_value(&self, section: &str, key: &str) -> Option<String> {
        self.state("config_value")
            .config
            .get(&(section.to_string(), key.to_string()))
            .cloned()
    }

    pub fn update_seq(&self, db: &str) -> Option<u64> {
        self.state("update_seq").databases.get(db).map(|db| db.seq)
    }

    /// Current version of a document with attachment bodies inline.
    pub fn document(&self, db: &str, id: &str) -> Option<Document> {
        self.state("document")
            .databases
            .get(db)
            .and_then(|db| db.docs.get(id))
            .filter(|stored| !stored.current.deleted)
            .map(|stored| stored.current.clone())
    }

    /// Writes `doc` over whatever is stored, creating the database if needed.
    pub fn put_document(&self, db: &str, mut doc: Document) -> Result<String, StoreError> {
        let result = {
            let mut state = self.state("put_document");
            let database = state.databases.entry(db.to_string()).or_default();
            doc.rev = database
                .docs
                .get(&doc.id)
                .filter(|stored| !stored.current.deleted)
                .and_then(|stored| stored.current.rev.clone());
            write(database, doc)
        };
        self.inner.changed.notify_waiters();
        result
    }

    pub fn delete_document(&self, db: &str, id: &str) -> Result<String, StoreError> {
        let result = {
            let mut state = self.state("delete_document");
            let database = state
                .databases
                .get_mut(db)
                .ok_or_else(|| StoreError::not_found(db))?;
            let rev = database
                .docs
                .get(id)
                .filter(|stored| !stored.current.deleted)
                .and_then(|stored| stored.current.rev.clone())
                .ok_or_else(|| StoreError::not_found(id))?;
            let mut tombstone = Document::new(id);
            tombstone.rev = Some(rev);
            tombstone.deleted = true;
            write(database, tombstone)
        };
        self.inner.changed.notify_waiters();
        result
    }

    fn state(&self, op: &'static str) -> std::sync::MutexGuard<'_, ServerState> {
        mutex_lock(&self.inner.state, LOCK_TARGET, op)
    }

    fn is_stalled(&self) -> bool {
        self.state("is_stalled").stalled
    }
}

/// Stores `doc` as the next revision, resolving attachment stubs against
/// the previous revision.
fn write(database: &mut DbState, mut doc: Document) -> Result<String, StoreError> {
    let previous = database.docs.get(&doc.id);
    let generation = previous.map_or(0, |stored| stored.generation) + 1;

    for (name, attachment) in doc.attachments.iter_mut() {
        attachment.url = None;
        attachment.template = None;
        if attachment.is_stub() {
            let body = previous
                .and_then(|stored| stored.current.attachments.get(name))
                .and_then(|prior| prior.bytes())
                .ok_or_else(|| {
                    StoreError::Rejected(format!("attachment stub `{name}` has no stored body"))
                })?;
            attachment.body = AttachmentBody::Inline(body.to_vec());
        }
    }

    database.seq += 1;
    let rev = format!("{generation}-{:08x}", database.seq);
    doc.rev = Some(rev.clone());

    let seq = database.seq;
    let entry = database
        .docs
        .entry(doc.id.clone())
        .or_insert_with(|| StoredDoc {
            seq,
            generation: 0,
            current: doc.clone(),
            history: BTreeMap::new(),
        });
    entry.seq = seq;
    entry.generation = generation;
    entry.history.insert(rev.clone(), doc.clone());
    entry.current = doc;
    Ok(rev)
}

fn stubbed(doc: &Document) -> Document {
    let mut doc = doc.clone();
    for attachment in doc.attachments.values_mut() {
        *attachment = Attachment::stub(attachment.content_type.clone());
    }
    doc
}

fn check_rev(
    database: &DbState,
    id: &str,
    rev: Option<&str>,
) -> Result<(), StoreError> {
    let current = database
        .docs
        .get(id)
        .filter(|stored| !stored.current.deleted)
        .and_then(|stored| stored.current.rev.as_deref());
    if current == rev {
        Ok(())
    } else {
        Err(StoreError::conflict(id))
    }
}

#[async_trait]
impl StoreServer for MemoryServer {
    fn url(&self) -> &Url {
        &self.inner.url
    }

    async fn welcome(&self) -> Result<Welcome, StoreError> {
        Ok(Welcome {
            couchdb: self.state("welcome").greeting.clone(),
            version: Some("memory".into()),
        })
    }

    async fn session(&self) -> Result<Session, StoreError> {
        Ok(Session {
            ok: true,
            name: Some("memory".into()),
            roles: self.state("session").roles.clone(),
        })
    }

    async fn put_config(&self, section: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.state("put_config")
            .config
            .insert((section.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn probe(&self, segments: &[String]) -> Result<Probe, StoreError> {
        let state = self.state("probe");
        let Some((db, rest)) = segments.split_first() else {
            return Ok(Probe::Server);
        };
        let Some(database) = state.databases.get(db) else {
            return Ok(Probe::Missing);
        };
        if rest.is_empty() {
            return Ok(Probe::Database(info(db, database)));
        }
        let id = rest.join("/");
        Ok(database
            .docs
            .get(&id)
            .filter(|stored| !stored.current.deleted)
            .and_then(|stored| stored.current.rev.clone())
            .map_or(Probe::Missing, |rev| Probe::Document { id, rev }))
    }

    fn database(&self, name: &str) -> Arc<dyn DocumentStore> {
        let mut url = self.inner.url.clone();
        super::push_segments(&mut url, [name]);
        Arc::new(MemoryDatabase {
            server: self.clone(),
            name: name.to_string(),
            url,
        })
    }
}

/// Every URL connects to the same in-process server.
impl StoreConnector for MemoryServer {
    fn connect(&self, _server: &Url) -> Result<Arc<dyn StoreServer>, StoreError> {
        Ok(Arc::new(self.clone()))
    }
}

fn info(name: &str, database: &DbState) -> DatabaseInfo {
    DatabaseInfo {
        db_name: name.to_string(),
        update_seq: database.seq,
        doc_count: database
            .docs
            .values()
            .filter(|stored| !stored.current.deleted)
            .count() as u64,
    }
}

pub struct MemoryDatabase {
    server: MemoryServer,
    name: String,
    url: Url,
}

impl MemoryDatabase {
    fn with_db<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut DbState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.server.state(op);
        let database = state
            .databases
            .get_mut(&self.name)
            .ok_or_else(|| StoreError::not_found(&self.name))?;
        f(database)
    }

    fn take_forced_conflict(&self, id: &str) -> bool {
        let mut state = self.server.state("take_forced_conflict");
        match state
            .forced_conflicts
            .get_mut(&(self.name.clone(), id.to_string()))
        {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn collect(&self, query: &ChangesQuery) -> Result<ChangesBatch, StoreError> {
        self.with_db("changes", |database| {
            let mut rows = database
                .docs
                .iter()
                .filter(|(_, stored)| stored.seq > query.since)
                .map(|(id, stored)| (stored.seq, id, stored))
                .collect::<Vec<_>>();
            rows.sort_by_key(|(seq, _, _)| *seq);
            if let Some(limit) = query.limit {
                rows.truncate(limit as usize);
            }
            let results = rows
                .into_iter()
                .map(|(seq, id, stored)| ChangeEvent {
                    seq,
                    id: id.clone(),
                    deleted: stored.current.deleted,
                    document: query.include_docs.then(|| stubbed(&stored.current)),
                })
                .collect::<Vec<_>>();
            let last_seq = results.last().map_or(query.since, |change| change.seq);
            Ok(ChangesBatch {
                results,
                last_seq,
                resume: None,
            })
        })
    }
}

#[async_trait]
impl DocumentStore for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &Url {
        &self.url
    }

    async fn info(&self) -> Result<DatabaseInfo, StoreError> {
        self.with_db("info", |database| Ok(info(&self.name, database)))
    }

    async fn create(&self) -> Result<bool, StoreError> {
        let mut state = self.server.state("create");
        if state.databases.contains_key(&self.name) {
            return Ok(false);
        }
        state.databases.insert(self.name.clone(), DbState::default());
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        self.with_db("get", |database| {
            Ok(database
                .docs
                .get(id)
                .filter(|stored| !stored.current.deleted)
                .map(|stored| stubbed(&stored.current)))
        })
    }

    async fn put(&self, doc: &Document) -> Result<String, StoreError> {
        if self.take_forced_conflict(&doc.id) {
            return Err(StoreError::conflict(&doc.id));
        }
        let rev = self.with_db("put", |database| {
            check_rev(database, &doc.id, doc.rev.as_deref())?;
            write(database, doc.clone())
        })?;
        self.server.inner.changed.notify_waiters();
        Ok(rev)
    }

    async fn head(&self, id: &str) -> Result<Option<String>, StoreError> {
        self.with_db("head", |database| {
            Ok(database
                .docs
                .get(id)
                .filter(|stored| !stored.current.deleted)
                .and_then(|stored| stored.current.rev.clone()))
        })
    }

    async fn copy(
        &self,
        source: &str,
        source_rev: &str,
        dest: &str,
        dest_rev: Option<&str>,
    ) -> Result<String, StoreError> {
        if self.take_forced_conflict(dest) {
            return Err(StoreError::conflict(dest));
        }
        let rev = self.with_db("copy", |database| {
            let mut copy = database
                .docs
                .get(source)
                .and_then(|stored| stored.history.get(source_rev))
                .cloned()
                .ok_or_else(|| StoreError::not_found(format!("{source}?rev={source_rev}")))?;
            check_rev(database, dest, dest_rev)?;
            copy.id = dest.to_string();
            write(database, copy)
        })?;
        self.server.inner.changed.notify_waiters();
        Ok(rev)
    }

    async fn attachment(&self, id: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        self.with_db("attachment", |database| {
            database
                .docs
                .get(id)
                .filter(|stored| !stored.current.deleted)
                .and_then(|stored| stored.current.attachments.get(name))
                .and_then(|attachment| attachment.bytes())
                .map(<[u8]>::to_vec)
                .ok_or_else(|| StoreError::not_found(format!("{id}/{name}")))
        })
    }

    async fn changes(&self, query: &ChangesQuery) -> Result<ChangesBatch, StoreError> {
        if self.server.is_stalled() {
            std::future::pending::<()>().await;
        }

        let deadline = match query.mode {
            FeedMode::Normal => return self.collect(query),
            FeedMode::LongPoll { timeout } => Instant::now() + timeout,
        };

        loop {
            let notified = self.server.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.collect(query)?;
            if !batch.results.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(batch);
            }
        }
    }
}
