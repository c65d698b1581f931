//! The builder: follows a database, renders queued pages and writes them
//! to the output target, announcing a deploy whenever the output is
//! complete.

mod events;
mod state;

use std::{
    future::Future,
    num::NonZeroU32,
    path::PathBuf,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt, stream::FuturesUnordered};
use metrics::counter;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, instrument, warn};

use crate::application::{
    cache::{Applied, DocumentCache},
    error::BuildError,
    feed::{ChangeFeedConsumer, FeedItem, FeedOptions},
    promote::{PromotionController, PromotionSettings},
    render::{DIAGNOSTIC_CONTENT_TYPE, RenderError, Scope, TemplateEngine},
    stubs::{StubResolver, register_templates},
};
use crate::domain::{
    DeletedPolicy, Document, FeedEvent, QueueRule, RenderFailurePolicy, logical_name,
};
use crate::infra::{
    error::InfraError,
    output::{self, OutputError, PageTask, PageWriter, Target},
    store::{DEFAULT_MAX_ATTEMPTS, DocumentStore, StoreConnector, StoreError, StoreLocation},
};

pub use events::BuildEvent;
pub use state::{BuildPhase, BuildState, Signal, TransitionError};

/// File name a fixed template is registered under. Store attachment names
/// cannot start with `_`, so it never collides with a partial.
pub const FIXED_TEMPLATE_FILE: &str = "_page.html";

/// Field holding the body of a manually inserted page document.
pub const CONTENT_FIELD: &str = "content";

const EVENT_CAPACITY: usize = 256;

/// Hands out builder identities.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SequentialIds(AtomicU64);

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Where page templates come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSpec {
    /// One template for every page, given as source.
    Inline(String),
    /// One template for every page, read from disk when the builder starts.
    File(PathBuf),
    /// `<name>.html` attachments of cached documents, picked per page by its
    /// `template` field.
    Stored { default_name: String },
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Database URL to follow; a builder without one only writes manual
    /// pages.
    pub source: Option<String>,
    pub target: Target,
    pub template: TemplateSpec,
    pub queue_rule: QueueRule,
    pub render_failure: RenderFailurePolicy,
    pub deleted: DeletedPolicy,
    pub feed: FeedOptions,
    pub max_attempts: NonZeroU32,
    /// Stop after the first deploy.
    pub autostop: bool,
    /// How long live changes are collected before a render pass.
    pub push_cycle: Duration,
    pub promotion: Option<PromotionSettings>,
}

impl BuilderConfig {
    pub fn new(target: Target, template: TemplateSpec) -> Self {
        Self {
            source: None,
            target,
            template,
            queue_rule: QueueRule::default(),
            render_failure: RenderFailurePolicy::default(),
            deleted: DeletedPolicy::default(),
            feed: FeedOptions::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            autostop: false,
            push_cycle: Duration::ZERO,
            promotion: None,
        }
    }

    pub fn with_source(mut self, url: impl Into<String>) -> Self {
        self.source = Some(url.into());
        self
    }
}

/// A configured builder that has not started yet.
pub struct Builder {
    id: u64,
    config: BuilderConfig,
    source: Option<StoreLocation>,
    connector: Arc<dyn StoreConnector>,
    events: broadcast::Sender<BuildEvent>,
}

impl Builder {
    /// Checks the configuration without touching the network or disk.
    pub fn new(
        config: BuilderConfig,
        connector: Arc<dyn StoreConnector>,
        ids: &dyn IdSource,
    ) -> Result<Self, BuildError> {
        let source = config.source.as_deref().map(parse_source).transpose()?;
        if let Target::Directory(path) = &config.target
            && path.as_os_str().is_empty()
        {
            return Err(BuildError::validation("Need a target directory"));
        }
        if let TemplateSpec::Stored { default_name } = &config.template
            && default_name.is_empty()
        {
            return Err(BuildError::validation("Need a default template name"));
        }
        if config.promotion.is_some() && source.is_none() {
            return Err(BuildError::validation("Promotion needs a source database"));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            id: ids.next_id(),
            config,
            source,
            connector,
            events,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subscribing before `start` guarantees the `Started` event is seen.
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }

    pub fn start(self) -> BuilderHandle {
        let (control, commands) = mpsc::unbounded_channel();
        let id = self.id;
        let events = self.events.clone();
        let task = tokio::spawn(Runner::new(self, commands).run());
        BuilderHandle {
            id,
            control: BuilderControl { control },
            events,
            task,
        }
    }
}

fn parse_source(raw: &str) -> Result<StoreLocation, BuildError> {
    let location = StoreLocation::parse(raw)
        .map_err(|err| BuildError::validation(format!("Bad source URL {raw}: {err}")))?;
    match (location.database(), location.segments.len()) {
        (None, _) => Err(BuildError::validation(format!(
            "Need a database URL, not a server URL: {raw}"
        ))),
        (Some(_), 1) => Ok(location),
        (Some(_), _) => Err(BuildError::validation(format!(
            "Need a database URL, not a document URL: {raw}"
        ))),
    }
}

#[derive(Debug)]
enum Command {
    Page(PageTask),
    Stop(Option<String>),
}

/// Cloneable control side of a running builder.
#[derive(Debug, Clone)]
pub struct BuilderControl {
    control: mpsc::UnboundedSender<Command>,
}

impl BuilderControl {
    /// Writes a pre-rendered page. Returns `false` once the builder is dead.
    pub fn page(&self, id: impl Into<String>, body: impl Into<String>) -> bool {
        let body: String = body.into();
        self.control
            .send(Command::Page(PageTask::html(id, body)))
            .is_ok()
    }

    /// Writes a document's `content` field as its page.
    pub fn page_document(&self, document: &Document) -> bool {
        let body = document.str_field(CONTENT_FIELD).unwrap_or_default();
        self.page(document.id.clone(), body)
    }

    /// Asks the builder to stop. Safe to call any number of times.
    pub fn stop(&self, reason: Option<String>) {
        let _ = self.control.send(Command::Stop(reason));
    }
}

/// A running builder. Dropping every control handle stops it.
pub struct BuilderHandle {
    id: u64,
    control: BuilderControl,
    events: broadcast::Sender<BuildEvent>,
    task: JoinHandle<Result<(), BuildError>>,
}

impl BuilderHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn control(&self) -> BuilderControl {
        self.control.clone()
    }

    pub fn page(&self, id: impl Into<String>, body: impl Into<String>) -> bool {
        self.control.page(id, body)
    }

    pub fn page_document(&self, document: &Document) -> bool {
        self.control.page_document(document)
    }

    pub fn stop(&self) {
        self.control.stop(None);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the builder to stop or die.
    pub async fn wait(self) -> Result<(), BuildError> {
        let Self { control, task, .. } = self;
        let result = task.await;
        drop(control);
        result.map_err(|err| BuildError::Infra(InfraError::task(err.to_string())))?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Page,
    Removal,
}

type WriteFuture =
    Pin<Box<dyn Future<Output = (WriteKind, String, Result<(), OutputError>)> + Send>>;

struct Runner {
    id: u64,
    config: BuilderConfig,
    source: Option<StoreLocation>,
    connector: Arc<dyn StoreConnector>,
    events: broadcast::Sender<BuildEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    phase: BuildPhase,
    state: BuildState,
    cache: DocumentCache,
    engine: TemplateEngine,
    resolver: Option<StubResolver>,
    promoter: Option<PromotionController>,
    writer: Option<Arc<dyn PageWriter>>,
    feed: Option<ChangeFeedConsumer>,
    feed_rx: Option<mpsc::Receiver<FeedItem>>,
    writes: FuturesUnordered<WriteFuture>,
    push_due: Option<Instant>,
    deploys: u64,
    /// Writes finished since the last deploy.
    dirty: bool,
    stop_reason: Option<String>,
}

impl Runner {
    fn new(builder: Builder, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let rule = builder.config.queue_rule;
        Self {
            id: builder.id,
            config: builder.config,
            source: builder.source,
            connector: builder.connector,
            events: builder.events,
            commands,
            phase: BuildPhase::Idle,
            state: BuildState::default(),
            cache: DocumentCache::new(None, rule),
            engine: TemplateEngine::new(),
            resolver: None,
            promoter: None,
            writer: None,
            feed: None,
            feed_rx: None,
            writes: FuturesUnordered::new(),
            push_due: None,
            deploys: 0,
            dirty: false,
            stop_reason: None,
        }
    }

    #[instrument(level = "debug", skip_all, fields(builder = self.id))]
    async fn run(mut self) -> Result<(), BuildError> {
        self.emit(BuildEvent::Started { builder: self.id });
        info!(
            target = "staticplus::application::build",
            builder = self.id,
            output = self.config.target.kind(),
            source = ?self.config.source,
            "builder started"
        );

        match self.drive().await {
            Ok(reason) => {
                info!(
                    target = "staticplus::application::build",
                    builder = self.id,
                    reason = ?reason,
                    "builder stopping"
                );
                self.emit(BuildEvent::Stopped { reason });
                self.die(None);
                Ok(())
            }
            Err(err) => {
                self.die(Some(&err));
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<Option<String>, BuildError> {
        self.advance(Signal::Prepare)?;
        self.prepare().await?;
        self.advance(Signal::Prepared)?;

        loop {
            if let Some(reason) = self.stop_reason.take() {
                return Ok(Some(reason));
            }
            let due = self.push_due;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Page(task)) => {
                        self.advance(Signal::WriteStarted)?;
                        self.spawn_write(task)?;
                    }
                    Some(Command::Stop(reason)) => return Ok(reason),
                    None => return Ok(Some("control handles dropped".to_string())),
                },
                Some((kind, page, result)) = self.writes.next(), if !self.writes.is_empty() => {
                    self.finish_write(kind, page, result)?;
                }
                item = next_feed_item(&mut self.feed_rx) => match item {
                    Some(Ok(event)) => self.on_feed(event).await?,
                    Some(Err(err)) => return Err(err.into()),
                    None => {
                        warn!(
                            target = "staticplus::application::build",
                            builder = self.id,
                            "change feed closed"
                        );
                        self.feed_rx = None;
                    }
                },
                () = wait_until(due) => {
                    self.push_due = None;
                    self.push().await?;
                }
            }
        }
    }

    async fn prepare(&mut self) -> Result<(), BuildError> {
        match self.config.template.clone() {
            TemplateSpec::Inline(source) => self.compile_fixed(&source)?,
            TemplateSpec::File(path) => {
                let source = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|err| BuildError::io(&path, err))?;
                self.compile_fixed(&source)?;
            }
            TemplateSpec::Stored { .. } => {}
        }

        let mut feed_store = None;
        if let Some(location) = &self.source {
            let server = self.connector.connect(&location.server)?;
            let database = location.database().unwrap_or_default();
            let store = server.database(database);
            match store.info().await {
                Ok(info) => debug!(
                    target = "staticplus::application::build",
                    builder = self.id,
                    db = %info.db_name,
                    update_seq = info.update_seq,
                    docs = info.doc_count,
                    "source database found"
                ),
                Err(StoreError::NotFound { .. }) => {
                    return Err(BuildError::validation(format!(
                        "Source database does not exist: {}",
                        location.original
                    )));
                }
                Err(err) => return Err(err.into()),
            }

            self.cache = DocumentCache::new(Some(Arc::clone(&store)), self.config.queue_rule);
            self.resolver = Some(StubResolver::new(Arc::clone(&store)));
            if let Some(settings) = self.config.promotion.clone() {
                self.promoter = Some(PromotionController::new(
                    Arc::clone(&server),
                    Arc::clone(&store),
                    settings,
                    self.config.max_attempts,
                ));
            }
            feed_store = Some(store);
        }

        let writer = output::prepare(
            &self.config.target,
            self.connector.as_ref(),
            self.config.max_attempts,
        )
        .await?;
        self.writer = Some(writer);

        if let Some(store) = feed_store {
            self.follow(store);
        }
        Ok(())
    }

    fn compile_fixed(&mut self, source: &str) -> Result<(), BuildError> {
        self.engine
            .compile(FIXED_TEMPLATE_FILE, source)
            .map(|_| ())
            .map_err(|err| BuildError::validation(format!("Bad template: {err}")))
    }

    fn follow(&mut self, store: Arc<dyn DocumentStore>) {
        let feed = ChangeFeedConsumer::new(store, self.config.feed.clone());
        self.feed_rx = Some(feed.start());
        self.feed = Some(feed);
    }

    async fn on_feed(&mut self, event: FeedEvent) -> Result<(), BuildError> {
        match event {
            FeedEvent::CaughtUp(seq) => {
                if self.state.catch_up(seq) {
                    info!(
                        target = "staticplus::application::build",
                        builder = self.id,
                        seq,
                        queued = self.cache.queue_len(),
                        "caught up; building"
                    );
                }
                self.push().await
            }
            FeedEvent::Change(change) => {
                debug!(
                    target = "staticplus::application::build",
                    builder = self.id,
                    seq = change.seq,
                    id = %change.id,
                    "change"
                );
                let is_design = change.is_design();
                match self.cache.apply(change) {
                    Applied::Updated { .. } | Applied::Ignored => {}
                    Applied::Deleted { id, page } => self.on_deleted(id, page)?,
                    Applied::Design(document) => self.on_design(document).await?,
                }
                if self.state.is_caught_up() && !is_design {
                    self.schedule_push().await?;
                }
                Ok(())
            }
        }
    }

    fn on_deleted(&mut self, id: String, page: Option<String>) -> Result<(), BuildError> {
        match self.config.deleted {
            DeletedPolicy::Ignore => {
                debug!(
                    target = "staticplus::application::build",
                    builder = self.id,
                    id = %id,
                    "deleted document ignored"
                );
                Ok(())
            }
            DeletedPolicy::Retract => {
                let Some(page) = page else {
                    return Ok(());
                };
                let writer = self.writer()?;
                self.advance(Signal::WriteStarted)?;
                self.state.begin(&page);
                self.writes.push(Box::pin(async move {
                    let result = writer.remove(&page).await;
                    (WriteKind::Removal, page, result)
                }));
                Ok(())
            }
            DeletedPolicy::Fail => Err(BuildError::validation(format!(
                "Document {id} was deleted"
            ))),
        }
    }

    async fn on_design(&mut self, document: Document) -> Result<(), BuildError> {
        let Some(promoter) = &self.promoter else {
            return Ok(());
        };
        if !promoter.is_request(&document) {
            debug!(
                target = "staticplus::application::build",
                builder = self.id,
                id = %document.id,
                "design document ignored"
            );
            return Ok(());
        }
        let promotion = promoter.promote().await?;
        self.emit(BuildEvent::Promoted(promotion));
        Ok(())
    }

    async fn schedule_push(&mut self) -> Result<(), BuildError> {
        if self.config.push_cycle.is_zero() {
            return self.push().await;
        }
        if self.push_due.is_none() {
            self.push_due = Some(Instant::now() + self.config.push_cycle);
        }
        Ok(())
    }

    /// One render pass: complete stubs, render the queue, start the writes.
    async fn push(&mut self) -> Result<(), BuildError> {
        self.push_due = None;
        self.advance(Signal::Push)?;

        match &self.resolver {
            Some(resolver) => {
                let fetched = resolver.resolve(&mut self.cache, &mut self.engine).await?;
                if fetched > 0 {
                    debug!(
                        target = "staticplus::application::build",
                        builder = self.id,
                        fetched,
                        "stubs resolved"
                    );
                }
            }
            None => register_templates(&mut self.cache, &mut self.engine),
        }
        self.advance(Signal::StubsResolved)?;

        let queue = self.cache.take_queue();
        let mut tasks = Vec::with_capacity(queue.len());
        for (page, document) in queue {
            if let Some(task) = self.render_page(page, &document)? {
                tasks.push(task);
            }
        }
        self.advance(Signal::Rendered)?;

        debug!(
            target = "staticplus::application::build",
            builder = self.id,
            pages = tasks.len(),
            "publishing"
        );
        for task in tasks {
            self.spawn_write(task)?;
        }
        self.check_drained()
    }

    fn render_page(
        &self,
        page: String,
        document: &Document,
    ) -> Result<Option<PageTask>, BuildError> {
        let (template, content_type) = match &self.config.template {
            TemplateSpec::Stored { default_name } => {
                let name = document.template().unwrap_or(default_name.as_str());
                let file = format!("{name}.html");
                let Some(attachment) = self.cache.attachment(&file) else {
                    warn!(
                        target = "staticplus::application::build",
                        builder = self.id,
                        page = %page,
                        id = %document.id,
                        template = %file,
                        "no attachment for template"
                    );
                    return Ok(None);
                };
                if !attachment.is_html() {
                    // Non-template attachments are published as they are.
                    return Ok(attachment.bytes().map(|body| PageTask {
                        id: page,
                        template_name: None,
                        body: body.to_vec(),
                        content_type: attachment.content_type.clone(),
                    }));
                }
                (logical_name(&file).to_string(), attachment.content_type.clone())
            }
            TemplateSpec::Inline(_) | TemplateSpec::File(_) => (
                logical_name(FIXED_TEMPLATE_FILE).to_string(),
                "text/html".to_string(),
            ),
        };

        let scope = Scope::build(self.cache.documents(), document);
        match self.engine.render(&template, &scope) {
            Ok(html) => Ok(Some(PageTask {
                id: page,
                template_name: Some(template),
                body: html.into_bytes(),
                content_type,
            })),
            Err(err) => self.render_failed(page, template, err),
        }
    }

    fn render_failed(
        &self,
        page: String,
        template: String,
        err: RenderError,
    ) -> Result<Option<PageTask>, BuildError> {
        match self.config.render_failure {
            RenderFailurePolicy::Abort => Err(BuildError::Render { page, source: err }),
            RenderFailurePolicy::DiagnosticPage => {
                warn!(
                    target = "staticplus::application::build",
                    builder = self.id,
                    page = %page,
                    error = %err,
                    "render failed; publishing diagnostic page"
                );
                Ok(Some(PageTask {
                    id: page,
                    template_name: Some(template),
                    body: err.diagnostic().into_bytes(),
                    content_type: DIAGNOSTIC_CONTENT_TYPE.to_string(),
                }))
            }
        }
    }

    fn writer(&self) -> Result<Arc<dyn PageWriter>, BuildError> {
        self.writer
            .clone()
            .ok_or_else(|| BuildError::Infra(InfraError::configuration("output is not prepared")))
    }

    fn spawn_write(&mut self, task: PageTask) -> Result<(), BuildError> {
        let writer = self.writer()?;
        self.state.begin(&task.id);
        self.writes.push(Box::pin(async move {
            let result = writer.write(&task).await;
            (WriteKind::Page, task.id, result)
        }));
        Ok(())
    }

    fn finish_write(
        &mut self,
        kind: WriteKind,
        page: String,
        result: Result<(), OutputError>,
    ) -> Result<(), BuildError> {
        self.state.finish(&page);
        result?;
        self.dirty = true;
        match kind {
            WriteKind::Page => {
                counter!("staticplus_pages_written_total").increment(1);
                debug!(
                    target = "staticplus::application::build",
                    builder = self.id,
                    page = %page,
                    pending = self.state.pending(),
                    "page written"
                );
                self.emit(BuildEvent::Page { id: page });
            }
            WriteKind::Removal => debug!(
                target = "staticplus::application::build",
                builder = self.id,
                page = %page,
                "page retracted"
            ),
        }
        self.check_drained()
    }

    /// Settles the phase once nothing is in flight and deploys when the
    /// output changed since the last deploy (or was never deployed).
    fn check_drained(&mut self) -> Result<(), BuildError> {
        if !self.state.is_drained() {
            return Ok(());
        }
        if self.phase == BuildPhase::Publishing {
            self.advance(Signal::Drained {
                caught_up: self.state.is_caught_up(),
            })?;
        }
        if self.phase == BuildPhase::Deployed && (self.deploys == 0 || self.dirty) {
            self.deploy()?;
        }
        Ok(())
    }

    fn deploy(&mut self) -> Result<(), BuildError> {
        let handle = self.writer()?.handle();
        self.deploys += 1;
        self.dirty = false;
        counter!("staticplus_deploys_total").increment(1);
        info!(
            target = "staticplus::application::build",
            builder = self.id,
            deploys = self.deploys,
            caught_up_at = ?self.state.caught_up_at(),
            "deploy"
        );
        self.emit(BuildEvent::Deploy(handle));
        if self.config.autostop && self.stop_reason.is_none() {
            self.stop_reason = Some("autostop after deploy".to_string());
        }
        Ok(())
    }

    fn advance(&mut self, signal: Signal) -> Result<(), TransitionError> {
        let next = self.phase.next(signal)?;
        if next != self.phase {
            debug!(
                target = "staticplus::application::build",
                builder = self.id,
                from = %self.phase,
                to = %next,
                signal = ?signal,
                "phase change"
            );
        }
        self.phase = next;
        Ok(())
    }

    /// The single teardown path; runs once per builder.
    fn die(&mut self, error: Option<&BuildError>) {
        if self.phase == BuildPhase::Dead {
            return;
        }
        let signal = if error.is_some() { Signal::Fail } else { Signal::Stop };
        self.phase = BuildPhase::Dead;
        if let Some(feed) = self.feed.take() {
            feed.stop();
        }
        self.feed_rx = None;
        self.writes = FuturesUnordered::new();
        self.push_due = None;

        match error {
            Some(err) => warn!(
                target = "staticplus::application::build",
                builder = self.id,
                signal = ?signal,
                error_kind = err.kind().as_str(),
                error = %err,
                "builder died"
            ),
            None => debug!(
                target = "staticplus::application::build",
                builder = self.id,
                signal = ?signal,
                "builder stopped"
            ),
        }
        self.emit(BuildEvent::Died {
            error: error.map(ToString::to_string),
        });
    }

    fn emit(&self, event: BuildEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

async fn next_feed_item(rx: &mut Option<mpsc::Receiver<FeedItem>>) -> Option<FeedItem> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::output::MemoryOutput;
    use crate::infra::store::MemoryServer;

    fn memory_config(output: &MemoryOutput) -> BuilderConfig {
        BuilderConfig::new(
            Target::InMemory(output.clone()),
            TemplateSpec::Inline("{{ _id }}".into()),
        )
    }

    #[test]
    fn sequential_ids_start_at_one() {
        let ids = SequentialIds::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn source_must_address_a_database() {
        let connector: Arc<dyn StoreConnector> = Arc::new(MemoryServer::new());
        let ids = SequentialIds::new();
        let output = MemoryOutput::new();

        for (url, fragment) in [
            ("http://127.0.0.1:5984/", "server URL"),
            ("http://127.0.0.1:5984/db/doc", "document URL"),
            ("not a url", "Bad source URL"),
        ] {
            let config = memory_config(&output).with_source(url);
            let err = Builder::new(config, Arc::clone(&connector), &ids)
                .err()
                .expect("rejected");
            assert!(err.to_string().contains(fragment), "{url}: {err}");
        }
    }

    #[test]
    fn empty_directory_target_is_rejected() {
        let connector: Arc<dyn StoreConnector> = Arc::new(MemoryServer::new());
        let config = BuilderConfig::new(
            Target::Directory(PathBuf::new()),
            TemplateSpec::Inline(String::new()),
        );
        let err = Builder::new(config, connector, &SequentialIds::new())
            .err()
            .expect("rejected");
        assert_eq!(err.kind(), crate::application::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn stop_emits_stopped_then_died_once() {
        let connector: Arc<dyn StoreConnector> = Arc::new(MemoryServer::new());
        let output = MemoryOutput::new();
        let builder =
            Builder::new(memory_config(&output), connector, &SequentialIds::new()).expect("new");
        let mut events = builder.subscribe();
        let handle = builder.start();
        handle.stop();
        handle.stop();
        handle.wait().await.expect("clean stop");

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["started", "stopped", "died"]);
    }
}
