//! Ordered, resumable consumption of a database change log.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::domain::{ChangeEvent, FeedEvent};
use crate::infra::store::{ChangesBatch, ChangesQuery, DocumentStore, FeedMode, StoreError};
use crate::util::lock::mutex_lock;

const LOCK_TARGET: &str = "staticplus::application::feed";

/// A feed that stays silent this long is considered dead.
pub const DEFAULT_INACTIVITY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("change feed inactive for {0:?}")]
    Inactivity(Duration),
    #[error("change feed request failed: {0}")]
    Store(#[from] StoreError),
}

pub type FeedItem = Result<FeedEvent, FeedError>;

#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Resume point; only changes after this sequence are delivered.
    pub since: u64,
    /// Page size for backlog requests.
    pub limit: Option<u64>,
    pub inactivity: Duration,
    pub filter: Option<String>,
    /// Capacity of the delivery channel.
    pub buffer: usize,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            since: 0,
            limit: Some(200),
            inactivity: DEFAULT_INACTIVITY,
            filter: None,
            buffer: 64,
        }
    }
}

/// Delivers changes in sequence order, then one `CaughtUp`, then live
/// changes until stopped or the feed fails.
pub struct ChangeFeedConsumer {
    store: Arc<dyn DocumentStore>,
    options: FeedOptions,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ChangeFeedConsumer {
    pub fn new(store: Arc<dyn DocumentStore>, options: FeedOptions) -> Self {
        Self {
            store,
            options,
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Spawns the feed task. After `stop` the returned channel is already
    /// closed.
    pub fn start(&self) -> mpsc::Receiver<FeedItem> {
        let (tx, rx) = mpsc::channel(self.options.buffer.max(1));
        if self.stopped.load(Ordering::SeqCst) {
            return rx;
        }
        let handle = tokio::spawn(follow(
            Arc::clone(&self.store),
            self.options.clone(),
            tx,
        ));
        if let Some(previous) = mutex_lock(&self.task, LOCK_TARGET, "start").replace(handle) {
            previous.abort();
        }
        rx
    }

    /// Ends delivery. Safe to call repeatedly and before `start`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = mutex_lock(&self.task, LOCK_TARGET, "stop").take() {
            handle.abort();
            debug!(target = "staticplus::application::feed", db = %self.store.name(), "feed stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for ChangeFeedConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn follow(store: Arc<dyn DocumentStore>, options: FeedOptions, tx: mpsc::Sender<FeedItem>) {
    if let Err(err) = consume(store.as_ref(), &options, &tx).await {
        warn!(
            target = "staticplus::application::feed",
            db = %store.name(),
            error = %err,
            "change feed failed"
        );
        let _ = tx.send(Err(err)).await;
    }
}

/// Where the next request resumes: the highest sequence delivered and, for
/// servers with opaque sequences, the token that names it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Cursor {
    seq: u64,
    token: Option<String>,
}

impl Cursor {
    fn query(&self, limit: Option<u64>, mode: FeedMode, filter: Option<String>) -> ChangesQuery {
        ChangesQuery {
            since: self.seq,
            resume: self.token.clone(),
            limit,
            mode,
            filter,
            include_docs: true,
        }
    }

    /// Moves to the end of a batch. A batch that ends behind the cursor
    /// leaves it alone.
    fn finish_batch(&mut self, last_seq: u64, token: Option<String>) {
        if last_seq >= self.seq {
            self.seq = last_seq;
            self.token = token;
        }
    }
}

async fn consume(
    store: &dyn DocumentStore,
    options: &FeedOptions,
    tx: &mpsc::Sender<FeedItem>,
) -> Result<(), FeedError> {
    let mut cursor = Cursor {
        seq: options.since,
        token: None,
    };

    loop {
        let query = cursor.query(options.limit, FeedMode::Normal, options.filter.clone());
        let batch = request(store, &query, options.inactivity).await?;
        let count = batch.results.len() as u64;
        if !forward_batch(batch, &mut cursor, tx).await {
            return Ok(());
        }
        if options.limit.is_none_or(|limit| count < limit) {
            break;
        }
    }

    info!(
        target = "staticplus::application::feed",
        db = %store.name(),
        seq = cursor.seq,
        "change feed caught up"
    );
    if tx.send(Ok(FeedEvent::CaughtUp(cursor.seq))).await.is_err() {
        return Ok(());
    }

    let poll = (options.inactivity / 2).max(Duration::from_millis(1));
    loop {
        let query = cursor.query(
            None,
            FeedMode::LongPoll { timeout: poll },
            options.filter.clone(),
        );
        let batch = request(store, &query, options.inactivity).await?;
        if !forward_batch(batch, &mut cursor, tx).await {
            return Ok(());
        }
    }
}

async fn forward_batch(
    batch: ChangesBatch,
    cursor: &mut Cursor,
    tx: &mpsc::Sender<FeedItem>,
) -> bool {
    let ChangesBatch {
        results,
        last_seq,
        resume,
    } = batch;
    if !forward(results, &mut cursor.seq, tx).await {
        return false;
    }
    cursor.finish_batch(last_seq, resume);
    true
}

async fn request(
    store: &dyn DocumentStore,
    query: &ChangesQuery,
    inactivity: Duration,
) -> Result<ChangesBatch, FeedError> {
    tokio::time::timeout(inactivity, store.changes(query))
        .await
        .map_err(|_| FeedError::Inactivity(inactivity))?
        .map_err(FeedError::from)
}

/// Sends changes newer than `last`; `false` once the receiver is gone.
async fn forward(
    changes: Vec<ChangeEvent>,
    last: &mut u64,
    tx: &mpsc::Sender<FeedItem>,
) -> bool {
    for change in changes {
        if change.seq <= *last {
            debug!(
                target = "staticplus::application::feed",
                seq = change.seq,
                id = %change.id,
                "skipping already delivered change"
            );
            continue;
        }
        *last = change.seq;
        if tx.send(Ok(FeedEvent::Change(change))).await.is_err() {
            return false;
        }
    }
    true
}
