//! Staging to production promotion of the site design document.

use std::{num::NonZeroU32, sync::Arc};

use serde_json::{Map, Value};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, info, instrument};

use crate::application::error::BuildError;
use crate::domain::Document;
use crate::infra::store::{
    Attempt, Committed, DocumentStore, Mutator, StoreError, StoreServer, TxnError, UpdateMode,
    couch::document_path, transact,
};

/// Field of the staging document holding site metadata and the flag.
pub const METADATA_FIELD: &str = "static_plus";

/// Where promotion copies to and which routing rule it rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionSettings {
    pub staging: String,
    pub production: String,
    /// Virtual host (`<bounce prefix><hostname>`) pointed at production's
    /// bounce show after a promotion.
    pub bounce_host: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionState {
    Unflagged,
    PromotionRequested,
    Promoted,
}

/// What a completed promotion produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub staging_rev: String,
    pub production_rev: String,
    pub promoted_at: String,
    pub attempts: u32,
}

pub struct PromotionController {
    server: Arc<dyn StoreServer>,
    mutator: Mutator,
    settings: PromotionSettings,
    max_attempts: NonZeroU32,
}

impl PromotionController {
    pub fn new(
        server: Arc<dyn StoreServer>,
        store: Arc<dyn DocumentStore>,
        settings: PromotionSettings,
        max_attempts: NonZeroU32,
    ) -> Self {
        Self {
            server,
            mutator: Mutator::new(store, max_attempts),
            settings,
            max_attempts,
        }
    }

    pub fn settings(&self) -> &PromotionSettings {
        &self.settings
    }

    pub fn state(document: &Document) -> PromotionState {
        let metadata = document.get(METADATA_FIELD);
        let flag = metadata
            .and_then(|meta| meta.get("promote"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if flag {
            PromotionState::PromotionRequested
        } else if metadata.is_some_and(|meta| meta.get("promoted_at").is_some()) {
            PromotionState::Promoted
        } else {
            PromotionState::Unflagged
        }
    }

    /// True when `document` is the staging document and carries the flag.
    pub fn is_request(&self, document: &Document) -> bool {
        document.id == self.settings.staging
            && Self::state(document) == PromotionState::PromotionRequested
    }

    /// Operator side: flags the staging document for promotion.
    pub async fn request(&self) -> Result<Committed<Document>, TxnError<StoreError>> {
        self.mutator
            .update(&self.settings.staging, UpdateMode::Existing, |doc| {
                update_metadata(doc, |metadata| {
                    metadata.insert("promote".into(), Value::Bool(true));
                });
                Ok(())
            })
            .await
    }

    /// Clears the flag, stamps the time, copies the staging revision over
    /// production and rewrites the bounce route. Concurrent promotions are
    /// not excluded: whichever copy lands last is what production serves.
    #[instrument(level = "debug", skip_all, fields(staging = %self.settings.staging))]
    pub async fn promote(&self) -> Result<Promotion, BuildError> {
        let promoted_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| BuildError::validation(format!("cannot format timestamp: {err}")))?;

        let marked = self
            .mutator
            .update(&self.settings.staging, UpdateMode::Existing, |doc| {
                update_metadata(doc, |metadata| {
                    metadata.remove("promote");
                    metadata.insert("promoted_at".into(), Value::String(promoted_at.clone()));
                });
                Ok(())
            })
            .await?;
        let staging_rev = marked
            .value
            .rev
            .clone()
            .ok_or_else(|| StoreError::decode("committed document has no revision"))?;
        debug!(
            target = "staticplus::application::promote",
            rev = %staging_rev,
            promoted_at = %promoted_at,
            "promotion marked on staging"
        );

        let store = self.mutator.store();
        let staging = self.settings.staging.as_str();
        let production = self.settings.production.as_str();
        let staging_rev_ref = staging_rev.as_str();
        let copied = transact(
            self.max_attempts,
            || async move { store.head(production).await },
            |_: &mut Option<String>| Ok(()),
            |production_rev: Option<String>| async move {
                match store
                    .copy(staging, staging_rev_ref, production, production_rev.as_deref())
                    .await
                {
                    Ok(rev) => Ok(Attempt::Committed(rev)),
                    Err(err) if err.is_conflict() => Ok(Attempt::Conflict),
                    Err(err) => Err(err),
                }
            },
        )
        .await?;

        info!(
            target = "staticplus::application::promote",
            staging_rev = %staging_rev,
            production_rev = %copied.value,
            attempts = marked.attempts + copied.attempts - 1,
            "promoted staging to production"
        );

        self.configure_bounce().await?;

        Ok(Promotion {
            staging_rev,
            production_rev: copied.value,
            promoted_at,
            attempts: marked.attempts + copied.attempts - 1,
        })
    }

    async fn configure_bounce(&self) -> Result<(), StoreError> {
        let Some(host) = &self.settings.bounce_host else {
            debug!(
                target = "staticplus::application::promote",
                "no bounce host to configure"
            );
            return Ok(());
        };
        let route = bounce_route(self.mutator.store().name(), &self.settings.production);
        self.server.put_config("vhosts", host, &route).await?;
        debug!(
            target = "staticplus::application::promote",
            host = %host,
            route = %route,
            "bounce route configured"
        );
        Ok(())
    }
}

/// Path of production's bounce show inside `database`.
pub fn bounce_route(database: &str, production: &str) -> String {
    format!("{}/_show/bounce", document_path(database, production))
}

/// Runs `edit` on the metadata object, replacing a missing or malformed one.
fn update_metadata(doc: &mut Document, edit: impl FnOnce(&mut Map<String, Value>)) {
    let mut metadata = match doc.fields.remove(METADATA_FIELD) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    edit(&mut metadata);
    doc.fields.insert(METADATA_FIELD.to_string(), Value::Object(metadata));
}
