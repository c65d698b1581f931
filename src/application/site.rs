//! The staged site workflow: server checks, virtual host routing, the
//! staging design document, resource directories and the builder that
//! publishes pages into staging.

use std::{num::NonZeroU32, path::Path, sync::Arc, time::Duration};

use serde_json::{Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::application::{
    build::{BuilderConfig, TemplateSpec},
    error::{BuildError, ErrorKind},
    feed::FeedOptions,
    promote::{METADATA_FIELD, PromotionController, PromotionSettings},
};
use crate::domain::{DESIGN_PREFIX, DeletedPolicy, Document, QueueRule, RenderFailurePolicy};
use crate::infra::{
    output::{RemoteSpec, Target},
    store::{
        Committed, DEFAULT_MAX_ATTEMPTS, DocumentStore, Mutator, StoreConnector, StoreError,
        StoreServer, UpdateMode, couch::document_path,
    },
    watch::{self, AttachmentMap, DEFAULT_DEBOUNCE_MS, DirectoryWatcher},
};

/// Document receiving `--seed` resources.
pub const SEED_DOCUMENT: &str = "seed";

const BOUNCE_HOST_PLACEHOLDER: &str = "__PRODUCTION_HOST__";

const BOUNCE_SHOW: &str = r#"function(doc, req) {
  var production_domain = __PRODUCTION_HOST__
    , path = req.requested_path.join('/')
    , loc = 'https://' + production_domain + '/' + path

  log('Bounce to ' + loc)
  return { 'code': 301
         , 'headers': {'location': loc}
         , 'body': 'Moved to: ' + loc + '\r\n'
         }
}"#;

const READ_ONLY_VALIDATE: &str = r#"function(newDoc, oldDoc, userCtx, secObj) {
  if(~userCtx.roles.indexOf('_admin') || ~userCtx.roles.indexOf('editor'))
    return log('Allow change from ' + userCtx.name)
  throw {'forbidden': 'This Static+ database is read-only'}
}"#;

#[derive(Debug, Clone)]
pub struct SiteSettings {
    /// Server root, e.g. `http://127.0.0.1:5984/`.
    pub server: Url,
    pub database: String,
    pub hostname: String,
    /// Attachment prefix for pages and published resources.
    pub namespace: String,
    /// Design document names, without the `_design/` prefix.
    pub staging: String,
    pub production: String,
    pub production_prefix: String,
    pub staging_prefix: String,
    pub bounce_prefix: Option<String>,
    /// Template used for documents without a `template` field.
    pub template: String,
    pub push_cycle: Duration,
    /// Install a `validate_doc_update` that only admins and editors pass.
    pub read_only: bool,
    pub max_attempts: NonZeroU32,
    pub render_failure: RenderFailurePolicy,
    pub deleted: DeletedPolicy,
    pub feed: FeedOptions,
}

impl SiteSettings {
    pub fn new(server: Url, database: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            server,
            database: database.into(),
            hostname: hostname.into(),
            namespace: "SP".into(),
            staging: "SP-staging".into(),
            production: "SP-production".into(),
            production_prefix: "www.".into(),
            staging_prefix: "staging.".into(),
            bounce_prefix: None,
            template: "page".into(),
            push_cycle: Duration::from_millis(500),
            read_only: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            render_failure: RenderFailurePolicy::default(),
            deleted: DeletedPolicy::default(),
            feed: FeedOptions::default(),
        }
    }

    pub fn staging_id(&self) -> String {
        format!("{DESIGN_PREFIX}{}", self.staging)
    }

    pub fn production_id(&self) -> String {
        format!("{DESIGN_PREFIX}{}", self.production)
    }

    pub fn staging_host(&self) -> String {
        format!("{}{}", self.staging_prefix, self.hostname)
    }

    pub fn production_host(&self) -> String {
        format!("{}{}", self.production_prefix, self.hostname)
    }

    pub fn bounce_host(&self) -> Option<String> {
        self.bounce_prefix
            .as_ref()
            .map(|prefix| format!("{prefix}{}", self.hostname))
    }

    fn promotion(&self) -> PromotionSettings {
        PromotionSettings {
            staging: self.staging_id(),
            production: self.production_id(),
            bounce_host: self.bounce_host(),
        }
    }
}

/// A site on one store server.
pub struct Site {
    settings: SiteSettings,
    server: Arc<dyn StoreServer>,
    store: Arc<dyn DocumentStore>,
    mutator: Mutator,
}

impl Site {
    pub fn connect(
        settings: SiteSettings,
        connector: &dyn StoreConnector,
    ) -> Result<Self, BuildError> {
        if settings.database.is_empty() {
            return Err(BuildError::validation("Need a database name"));
        }
        if settings.hostname.is_empty() {
            return Err(BuildError::validation("Need a hostname"));
        }
        let server = connector.connect(&settings.server)?;
        let store = server.database(&settings.database);
        let mutator = Mutator::new(Arc::clone(&store), settings.max_attempts);
        Ok(Self {
            settings,
            server,
            store,
            mutator,
        })
    }

    pub fn settings(&self) -> &SiteSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Everything a site needs before its builder starts: a CouchDB server,
    /// an admin session, routing, the database and the staging document.
    #[instrument(level = "debug", skip_all, fields(db = %self.settings.database))]
    pub async fn prepare(&self) -> Result<(), BuildError> {
        self.check_server().await?;
        self.configure_routing().await?;
        self.ensure_database().await?;
        self.ensure_staging_document().await?;
        info!(
            target = "staticplus::application::site",
            db = %self.settings.database,
            staging = %self.settings.staging_host(),
            production = %self.settings.production_host(),
            "site prepared"
        );
        Ok(())
    }

    async fn check_server(&self) -> Result<(), BuildError> {
        let welcome = self.server.welcome().await?;
        if !welcome.is_couchdb() {
            return Err(BuildError::validation(format!(
                "Bad CouchDB url: {}",
                self.settings.server
            )));
        }
        let session = self.server.session().await?;
        if !session.ok {
            return Err(BuildError::validation("Bad session response"));
        }
        if !session.is_admin() {
            return Err(BuildError::authorization("Not admin"));
        }
        debug!(
            target = "staticplus::application::site",
            user = ?session.name,
            "confirmed admin access"
        );
        Ok(())
    }

    /// Disables secure rewrites and points the staging and production hosts
    /// at their design documents' rewrite handlers.
    pub async fn configure_routing(&self) -> Result<(), BuildError> {
        let database = self.settings.database.as_str();
        let rewrite = |id: &str| format!("{}/_rewrite", document_path(database, id));
        let entries = [
            ("httpd", "secure_rewrites".to_string(), "false".to_string()),
            (
                "vhosts",
                self.settings.staging_host(),
                rewrite(&self.settings.staging_id()),
            ),
            (
                "vhosts",
                self.settings.production_host(),
                rewrite(&self.settings.production_id()),
            ),
        ];

        let server = &self.server;
        let results = futures::future::join_all(entries.iter().map(
            |(section, key, value)| async move {
                server.put_config(section, key, value).await?;
                debug!(
                    target = "staticplus::application::site",
                    section = %section,
                    key = %key,
                    value = %value,
                    "config set"
                );
                Ok::<_, StoreError>(())
            },
        ))
        .await;
        results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    /// Creates the database; an existing one is fine.
    pub async fn ensure_database(&self) -> Result<bool, BuildError> {
        let created = self.store.create().await?;
        debug!(
            target = "staticplus::application::site",
            db = %self.settings.database,
            created,
            "database ready"
        );
        Ok(created)
    }

    /// Writes the site metadata, rewrites, bounce show and (for read-only
    /// sites) the validation function into the staging document. Existing
    /// attachments are kept.
    pub async fn ensure_staging_document(&self) -> Result<Committed<Document>, BuildError> {
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| BuildError::validation(format!("cannot format timestamp: {err}")))?;
        let settings = &self.settings;
        let production_host = Value::String(settings.production_host()).to_string();
        let bounce = BOUNCE_SHOW.replace(BOUNCE_HOST_PLACEHOLDER, &production_host);
        let namespace = settings.namespace.as_str();

        let committed = self
            .mutator
            .update(&settings.staging_id(), UpdateMode::CreateIfMissing, |doc| {
                doc.fields.insert(
                    METADATA_FIELD.into(),
                    json!({
                        "version": env!("CARGO_PKG_VERSION"),
                        "created_at": created_at,
                        "namespace": namespace,
                        "production_prefix": settings.production_prefix,
                        "staging_prefix": settings.staging_prefix,
                        "bounce_prefix": settings.bounce_prefix,
                        "hostname": settings.hostname,
                    }),
                );
                doc.fields.insert("rewrites".into(), rewrites(namespace));
                doc.fields
                    .insert("shows".into(), json!({ "bounce": bounce.as_str() }));
                if settings.read_only {
                    doc.fields.insert(
                        "validate_doc_update".into(),
                        Value::String(READ_ONLY_VALIDATE.into()),
                    );
                } else {
                    doc.fields.remove("validate_doc_update");
                }
                Ok(())
            })
            .await?;
        debug!(
            target = "staticplus::application::site",
            id = %committed.value.id,
            rev = ?committed.value.rev,
            "staging document ready"
        );
        Ok(committed)
    }

    /// Replaces every attachment of the seed document with the files in
    /// `dir`.
    #[instrument(level = "debug", skip(self))]
    pub async fn seed(&self, dir: &Path) -> Result<usize, BuildError> {
        let attachments = watch::scan(dir, None)
            .await
            .map_err(|err| BuildError::io(dir, err))?;
        let count = attachments.len();
        self.attach(SEED_DOCUMENT, attachments, true).await?;
        info!(
            target = "staticplus::application::site",
            dir = %dir.display(),
            count,
            "seed complete"
        );
        Ok(count)
    }

    /// Merges the files in `dir`, under the namespace prefix, into the
    /// staging document.
    #[instrument(level = "debug", skip(self))]
    pub async fn publish_dir(&self, dir: &Path) -> Result<usize, BuildError> {
        let attachments = watch::scan(dir, Some(&self.settings.namespace))
            .await
            .map_err(|err| BuildError::io(dir, err))?;
        let count = attachments.len();
        self.publish(attachments).await?;
        info!(
            target = "staticplus::application::site",
            dir = %dir.display(),
            count,
            "resources published"
        );
        Ok(count)
    }

    pub async fn publish(&self, attachments: AttachmentMap) -> Result<(), BuildError> {
        self.attach(&self.settings.staging_id(), attachments, false)
            .await?;
        Ok(())
    }

    /// Watches `dir` and yields single changed files for [`Site::publish`].
    pub fn watch(&self, dir: &Path) -> Result<DirectoryWatcher, BuildError> {
        let watcher = DirectoryWatcher::start(
            dir,
            Some(self.settings.namespace.clone()),
            Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        )?;
        info!(
            target = "staticplus::application::site",
            dir = %dir.display(),
            "watching resources"
        );
        Ok(watcher)
    }

    /// Publishes watcher updates until the watcher shuts down.
    pub async fn follow(&self, watcher: &mut DirectoryWatcher) -> Result<(), BuildError> {
        while let Some(update) = watcher.next().await {
            let names: Vec<String> = update.keys().cloned().collect();
            match self.publish(update).await {
                Ok(()) => debug!(
                    target = "staticplus::application::site",
                    files = ?names,
                    "resource update published"
                ),
                Err(err) if err.kind() == ErrorKind::Conflict => {
                    warn!(
                        target = "staticplus::application::site",
                        files = ?names,
                        error = %err,
                        "resource update dropped"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Operator side of promotion: flags the staging document; the running
    /// builder notices and promotes.
    pub async fn request_promotion(&self) -> Result<(), BuildError> {
        let controller = PromotionController::new(
            Arc::clone(&self.server),
            Arc::clone(&self.store),
            self.settings.promotion(),
            self.settings.max_attempts,
        );
        let committed = controller.request().await?;
        info!(
            target = "staticplus::application::site",
            rev = ?committed.value.rev,
            "promotion requested"
        );
        Ok(())
    }

    /// A builder that follows the database and writes pages into the
    /// staging document under the namespace.
    pub fn builder_config(&self) -> BuilderConfig {
        let settings = &self.settings;
        let database_url = self.store.url().to_string();
        let target = Target::RemoteDocument(RemoteSpec::site(
            database_url.clone(),
            settings.staging_id(),
            Some(settings.namespace.clone()),
        ));
        let mut config = BuilderConfig::new(
            target,
            TemplateSpec::Stored {
                default_name: settings.template.clone(),
            },
        )
        .with_source(database_url);
        config.queue_rule = QueueRule::WithPath;
        config.render_failure = settings.render_failure;
        config.deleted = settings.deleted;
        config.feed = settings.feed.clone();
        config.max_attempts = settings.max_attempts;
        config.push_cycle = settings.push_cycle;
        config.promotion = Some(settings.promotion());
        config
    }

    async fn attach(
        &self,
        id: &str,
        attachments: AttachmentMap,
        replace: bool,
    ) -> Result<Committed<Document>, BuildError> {
        let committed = self
            .mutator
            .update(id, UpdateMode::CreateIfMissing, |doc| {
                if replace {
                    doc.attachments.clear();
                }
                doc.attachments
                    .extend(attachments.iter().map(|(name, att)| (name.clone(), att.clone())));
                Ok(())
            })
            .await?;
        Ok(committed)
    }
}

fn rewrites(namespace: &str) -> Value {
    json!([
        { "from": "_db", "to": "../.." },
        { "from": "_db/*", "to": "../../*" },
        { "from": "_couchdb", "to": "../../.." },
        { "from": "_couchdb/*", "to": "../../../*" },
        { "from": "", "to": namespace },
        { "from": "*", "to": format!("{namespace}/*") },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Attachment;
    use crate::infra::store::MemoryServer;

    fn site(server: &MemoryServer) -> Site {
        let settings = SiteSettings::new(server.url().clone(), "blog", "example.com");
        Site::connect(settings, server).expect("connect")
    }

    #[tokio::test]
    async fn prepare_configures_routing_and_staging_document() {
        let server = MemoryServer::new();
        server.set_roles(&["_admin"]);
        let site = site(&server);

        site.prepare().await.expect("prepare");

        assert_eq!(
            server.config_value("httpd", "secure_rewrites").as_deref(),
            Some("false")
        );
        assert_eq!(
            server.config_value("vhosts", "staging.example.com").as_deref(),
            Some("/blog/_design/SP-staging/_rewrite")
        );
        assert_eq!(
            server.config_value("vhosts", "www.example.com").as_deref(),
            Some("/blog/_design/SP-production/_rewrite")
        );

        let staging = server.document("blog", "_design/SP-staging").expect("staging");
        let meta = staging.get(METADATA_FIELD).expect("metadata");
        assert_eq!(meta["namespace"], "SP");
        assert_eq!(meta["hostname"], "example.com");
        assert_eq!(staging.get("rewrites").and_then(Value::as_array).map(Vec::len), Some(6));
        let bounce = staging.get("shows").and_then(|shows| shows["bounce"].as_str());
        assert!(bounce.is_some_and(|show| show.contains(r#""www.example.com""#)));
        assert!(staging.get("validate_doc_update").is_none());

        // Preparing twice is harmless.
        site.prepare().await.expect("prepare again");
    }

    #[tokio::test]
    async fn prepare_requires_admin() {
        let server = MemoryServer::new();
        server.set_roles(&["editor"]);
        let err = site(&server).prepare().await.expect_err("not admin");
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert!(err.to_string().contains("Not admin"));
    }

    #[tokio::test]
    async fn prepare_rejects_non_couchdb_servers() {
        let server = MemoryServer::new();
        server.set_roles(&["_admin"]);
        server.set_greeting("Hello");
        let err = site(&server).prepare().await.expect_err("bad greeting");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn read_only_sites_get_a_validation_function() {
        let server = MemoryServer::new();
        server.set_roles(&["_admin"]);
        let mut settings = SiteSettings::new(server.url().clone(), "blog", "example.com");
        settings.read_only = true;
        let site = Site::connect(settings, &server).expect("connect");
        site.prepare().await.expect("prepare");

        let staging = server.document("blog", "_design/SP-staging").expect("staging");
        assert!(
            staging
                .str_field("validate_doc_update")
                .is_some_and(|body| body.contains("read-only"))
        );
    }

    #[tokio::test]
    async fn publish_merges_while_seed_replaces() {
        let server = MemoryServer::new();
        let site = site(&server);
        site.ensure_database().await.expect("db");

        let first = AttachmentMap::from([(
            "SP/a.css".to_string(),
            Attachment::inline("text/css", "a{}"),
        )]);
        let second = AttachmentMap::from([(
            "SP/b.js".to_string(),
            Attachment::inline("application/javascript", "b()"),
        )]);
        site.publish(first.clone()).await.expect("first");
        site.publish(second.clone()).await.expect("second");
        let staging = server.document("blog", "_design/SP-staging").expect("staging");
        assert_eq!(staging.attachments.len(), 2);

        site.attach(SEED_DOCUMENT, first, true).await.expect("seed");
        site.attach(SEED_DOCUMENT, second, true).await.expect("reseed");
        let seed = server.document("blog", SEED_DOCUMENT).expect("seed");
        assert_eq!(
            seed.attachments.keys().collect::<Vec<_>>(),
            vec!["SP/b.js"]
        );
    }

    #[test]
    fn builder_config_targets_the_staging_document() {
        let server = MemoryServer::new();
        let config = site(&server).builder_config();
        assert_eq!(config.queue_rule, QueueRule::WithPath);
        assert_eq!(config.push_cycle, Duration::from_millis(500));
        assert_eq!(
            config.template,
            TemplateSpec::Stored {
                default_name: "page".into()
            }
        );
        let promotion = config.promotion.expect("promotion");
        assert_eq!(promotion.staging, "_design/SP-staging");
        assert_eq!(promotion.production, "_design/SP-production");
        assert!(promotion.bounce_host.is_none());
        assert!(
            config
                .source
                .as_deref()
                .is_some_and(|source| source.ends_with("/blog"))
        );
    }
}
