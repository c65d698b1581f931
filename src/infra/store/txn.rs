//! Optimistic read-modify-write against a revisioned store.

use std::{future::Future, num::NonZeroU32, sync::Arc};

use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::Document;

use super::{DocumentStore, StoreError};

pub const DEFAULT_MAX_ATTEMPTS: NonZeroU32 = match NonZeroU32::new(10) {
    Some(value) => value,
    None => unreachable!(),
};

/// Outcome of one commit attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Committed(T),
    /// The stored revision moved; reload and reapply.
    Conflict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum TxnError<E> {
    #[error("gave up after {attempts} conflicting attempts")]
    ConflictExhausted { attempts: u32 },
    #[error(transparent)]
    Failed(E),
}

/// Runs load, mutate, commit until a commit lands or `max_attempts` commits
/// have conflicted. `mutate` always sees freshly loaded state, so it must not
/// depend on anything it changed during an earlier attempt.
pub async fn transact<S, T, E, Load, LoadFut, Mutate, Commit, CommitFut>(
    max_attempts: NonZeroU32,
    mut load: Load,
    mut mutate: Mutate,
    mut commit: Commit,
) -> Result<Committed<T>, TxnError<E>>
where
    Load: FnMut() -> LoadFut,
    LoadFut: Future<Output = Result<S, E>>,
    Mutate: FnMut(&mut S) -> Result<(), E>,
    Commit: FnMut(S) -> CommitFut,
    CommitFut: Future<Output = Result<Attempt<T>, E>>,
{
    for attempt in 1..=max_attempts.get() {
        let mut state = load().await.map_err(TxnError::Failed)?;
        mutate(&mut state).map_err(TxnError::Failed)?;
        match commit(state).await.map_err(TxnError::Failed)? {
            Attempt::Committed(value) => {
                return Ok(Committed {
                    value,
                    attempts: attempt,
                });
            }
            Attempt::Conflict => {
                counter!("staticplus_txn_conflicts_total").increment(1);
                debug!(
                    target = "staticplus::infra::store::txn",
                    attempt,
                    max_attempts = max_attempts.get(),
                    "commit conflicted; retrying"
                );
            }
        }
    }

    Err(TxnError::ConflictExhausted {
        attempts: max_attempts.get(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Start from an empty document when the id does not exist yet.
    CreateIfMissing,
    /// Fail with `NotFound` when the id does not exist.
    Existing,
}

/// Document-level transactions over one database.
#[derive(Clone)]
pub struct Mutator {
    store: Arc<dyn DocumentStore>,
    max_attempts: NonZeroU32,
}

impl Mutator {
    pub fn new(store: Arc<dyn DocumentStore>, max_attempts: NonZeroU32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn update<F>(
        &self,
        id: &str,
        mode: UpdateMode,
        mutate: F,
    ) -> Result<Committed<Document>, TxnError<StoreError>>
    where
        F: FnMut(&mut Document) -> Result<(), StoreError>,
    {
        let store = &self.store;
        let result = transact(
            self.max_attempts,
            || async move {
                match store.get(id).await? {
                    Some(doc) if !doc.deleted => Ok(doc),
                    Some(_) | None => match mode {
                        UpdateMode::CreateIfMissing => Ok(Document::new(id)),
                        UpdateMode::Existing => Err(StoreError::not_found(id)),
                    },
                }
            },
            mutate,
            |mut doc: Document| async move {
                match store.put(&doc).await {
                    Ok(rev) => {
                        doc.rev = Some(rev);
                        Ok(Attempt::Committed(doc))
                    }
                    Err(err) if err.is_conflict() => Ok(Attempt::Conflict),
                    Err(err) => Err(err),
                }
            },
        )
        .await;

        match &result {
            Ok(committed) if committed.attempts > 1 => warn!(
                target = "staticplus::infra::store::txn",
                doc_id = id,
                attempts = committed.attempts,
                "document update needed retries"
            ),
            Err(TxnError::ConflictExhausted { attempts }) => warn!(
                target = "staticplus::infra::store::txn",
                doc_id = id,
                attempts,
                "document update abandoned after repeated conflicts"
            ),
            _ => {}
        }

        result
    }
}
