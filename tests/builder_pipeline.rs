use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use staticplus::{
    application::{
        build::{BuildEvent, Builder, BuilderConfig, SequentialIds, TemplateSpec},
        error::BuildError,
        promote::{PromotionController, PromotionSettings, PromotionState},
    },
    domain::{DeletedPolicy, Document, RenderFailurePolicy},
    infra::{
        output::{
            MemoryOutput, MemoryWriter, OutputError, OutputHandle, PageTask, PageWriter, Target,
        },
        store::{MemoryServer, StoreConnector, StoreServer},
    },
};
use tokio::{
    sync::{Semaphore, broadcast, mpsc},
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

async fn next_named(events: &mut broadcast::Receiver<BuildEvent>, name: &str) -> BuildEvent {
    let wanted = async {
        loop {
            match events.recv().await {
                Ok(event) if event.name() == name => return event,
                Ok(_) => {}
                Err(err) => panic!("event stream ended before `{name}`: {err}"),
            }
        }
    };
    timeout(WAIT, wanted)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for `{name}`"))
}

async fn assert_no_deploy(events: &mut broadcast::Receiver<BuildEvent>, window: Duration) {
    let deployed = async {
        loop {
            match events.recv().await {
                Ok(BuildEvent::Deploy(_)) => return,
                Ok(_) => {}
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    };
    assert!(
        timeout(window, deployed).await.is_err(),
        "deploy arrived within {window:?}"
    );
}

/// Holds every write until the test hands out a permit for it.
struct GatedWriter {
    gate: Semaphore,
    arrivals: mpsc::UnboundedSender<String>,
    inner: MemoryWriter,
}

#[async_trait]
impl PageWriter for GatedWriter {
    async fn write(&self, page: &PageTask) -> Result<(), OutputError> {
        let _ = self.arrivals.send(page.id.clone());
        self.gate
            .acquire()
            .await
            .map_err(|_| OutputError::validation("gate closed"))?
            .forget();
        self.inner.write(page).await
    }

    async fn remove(&self, id: &str) -> Result<(), OutputError> {
        self.inner.remove(id).await
    }

    fn handle(&self) -> OutputHandle {
        self.inner.handle()
    }
}

fn source_url(server: &MemoryServer, db: &str) -> String {
    format!("{}{db}", server.url())
}

fn connector(server: &MemoryServer) -> Arc<dyn StoreConnector> {
    Arc::new(server.clone())
}

fn memory_config(server: &MemoryServer, output: &MemoryOutput, template: &str) -> BuilderConfig {
    BuilderConfig::new(
        Target::InMemory(output.clone()),
        TemplateSpec::Inline(template.to_string()),
    )
    .with_source(source_url(server, "db"))
}

#[tokio::test]
async fn renders_source_documents_and_deploys_once_caught_up() {
    let server = MemoryServer::new();
    server
        .put_document("db", Document::new("foo").with_field("value", "tball"))
        .expect("seed foo");
    let output = MemoryOutput::new();

    let builder = Builder::new(
        memory_config(&server, &output, "{{ _id }} says {{ value }}"),
        connector(&server),
        &SequentialIds::new(),
    )
    .expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();

    match next_named(&mut events, "deploy").await {
        BuildEvent::Deploy(OutputHandle::Memory(deployed)) => {
            assert_eq!(
                deployed.snapshot().into_iter().collect::<Vec<_>>(),
                vec![("foo".to_string(), "foo says tball".to_string())]
            );
        }
        other => panic!("unexpected deploy handle: {other:?}"),
    }

    handle.stop();
    handle.wait().await.expect("clean stop");
}

#[tokio::test]
async fn live_changes_render_and_redeploy() {
    let server = MemoryServer::new();
    server
        .put_document("db", Document::new("foo").with_field("value", "tball"))
        .expect("seed foo");
    let output = MemoryOutput::new();

    let builder = Builder::new(
        memory_config(&server, &output, "{{ _id }}: {{ value }}"),
        connector(&server),
        &SequentialIds::new(),
    )
    .expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();
    next_named(&mut events, "deploy").await;

    server
        .put_document("db", Document::new("baz").with_field("value", "later"))
        .expect("live write");

    match next_named(&mut events, "page").await {
        BuildEvent::Page { id } => assert_eq!(id, "baz"),
        other => panic!("unexpected event: {other:?}"),
    }
    next_named(&mut events, "deploy").await;
    assert_eq!(output.get("baz").as_deref(), Some("baz: later"));
    assert_eq!(output.len(), 2);

    handle.stop();
    handle.wait().await.expect("clean stop");
}

#[tokio::test]
async fn deploy_waits_for_every_outstanding_write() {
    let server = MemoryServer::new();
    for id in ["alpha", "beta"] {
        server
            .put_document("db", Document::new(id).with_field("value", id))
            .expect("seed");
    }
    let output = MemoryOutput::new();
    let (arrivals_tx, mut arrivals) = mpsc::unbounded_channel();
    let writer = Arc::new(GatedWriter {
        gate: Semaphore::new(0),
        arrivals: arrivals_tx,
        inner: MemoryWriter::new(output.clone()),
    });

    let config = BuilderConfig::new(
        Target::Writer(writer.clone()),
        TemplateSpec::Inline("{{ value }}".to_string()),
    )
    .with_source(source_url(&server, "db"));
    let builder = Builder::new(config, connector(&server), &SequentialIds::new()).expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();

    let window = Duration::from_millis(200);
    for released in 0..2 {
        timeout(WAIT, arrivals.recv())
            .await
            .expect("write reached the output")
            .expect("writer alive");
        assert_no_deploy(&mut events, window).await;
        assert_eq!(output.len(), released);
        writer.gate.add_permits(1);
    }

    match next_named(&mut events, "deploy").await {
        BuildEvent::Deploy(OutputHandle::Memory(deployed)) => {
            assert_eq!(deployed.get("alpha").as_deref(), Some("alpha"));
            assert_eq!(deployed.get("beta").as_deref(), Some("beta"));
        }
        other => panic!("unexpected deploy handle: {other:?}"),
    }
    assert_no_deploy(&mut events, window).await;

    handle.stop();
    timeout(WAIT, handle.wait())
        .await
        .expect("builder finishes")
        .expect("clean stop");
}

#[tokio::test]
async fn manual_pages_publish_without_a_source() {
    let output = MemoryOutput::new();
    let config = BuilderConfig::new(
        Target::InMemory(output.clone()),
        TemplateSpec::Inline("unused".to_string()),
    );
    let builder = Builder::new(
        config,
        connector(&MemoryServer::new()),
        &SequentialIds::new(),
    )
    .expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();

    assert!(handle.page("", "Blank page"));
    let stuff = Document::new("stuff").with_field("content", "A page with stuff");
    assert!(handle.page_document(&stuff));

    let mut written = Vec::new();
    for _ in 0..2 {
        match next_named(&mut events, "page").await {
            BuildEvent::Page { id } => written.push(id),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    written.sort();
    assert_eq!(written, vec!["".to_string(), "stuff".to_string()]);
    assert_eq!(output.get("").as_deref(), Some("Blank page"));
    assert_eq!(output.get("stuff").as_deref(), Some("A page with stuff"));

    handle.stop();
    handle.wait().await.expect("clean stop");
}

#[tokio::test]
async fn remote_target_at_server_root_fails_without_deploying() {
    let server = MemoryServer::new();
    let config = BuilderConfig::new(
        Target::parse(server.url().as_str()),
        TemplateSpec::Inline("{{ _id }}".to_string()),
    );
    let builder =
        Builder::new(config, connector(&server), &SequentialIds::new()).expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();

    let err = timeout(WAIT, handle.wait())
        .await
        .expect("builder finishes")
        .expect_err("server URL target");
    assert!(err.to_string().contains("server URL"), "{err}");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.name());
    }
    assert!(!seen.contains(&"deploy"));
    assert_eq!(seen.last(), Some(&"died"));
}

#[tokio::test]
async fn flagged_staging_document_is_promoted() {
    let server = MemoryServer::new();
    let staging = Document::new("_design/SP-staging")
        .with_field("static_plus", json!({ "promote": true, "hostname": "example.com" }))
        .with_field("rewrites", json!([{ "from": "", "to": "SP/" }]));
    server.put_document("db", staging).expect("seed staging");
    server
        .put_document("db", Document::new("foo").with_field("value", "tball"))
        .expect("seed foo");

    let output = MemoryOutput::new();
    let mut config = memory_config(&server, &output, "{{ value }}");
    config.promotion = Some(PromotionSettings {
        staging: "_design/SP-staging".into(),
        production: "_design/SP-production".into(),
        bounce_host: Some("www.example.com".into()),
    });
    let builder =
        Builder::new(config, connector(&server), &SequentialIds::new()).expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();

    let promotion = match next_named(&mut events, "promoted").await {
        BuildEvent::Promoted(promotion) => promotion,
        other => panic!("unexpected event: {other:?}"),
    };

    let staging = server
        .document("db", "_design/SP-staging")
        .expect("staging document");
    let production = server
        .document("db", "_design/SP-production")
        .expect("production document");
    assert_eq!(
        PromotionController::state(&staging),
        PromotionState::Promoted
    );
    assert_eq!(staging.fields, production.fields);
    assert_eq!(staging.rev.as_deref(), Some(promotion.staging_rev.as_str()));
    assert_eq!(
        production.rev.as_deref(),
        Some(promotion.production_rev.as_str())
    );
    assert_eq!(
        staging.fields["static_plus"]["promoted_at"],
        json!(promotion.promoted_at)
    );
    assert_eq!(
        server.config_value("vhosts", "www.example.com").as_deref(),
        Some("/db/_design/SP-production/_show/bounce")
    );

    handle.stop();
    handle.wait().await.expect("clean stop");
}

#[tokio::test]
async fn render_failures_publish_a_diagnostic_page_by_default() {
    let server = MemoryServer::new();
    server
        .put_document("db", Document::new("foo"))
        .expect("seed foo");
    let output = MemoryOutput::new();

    let builder = Builder::new(
        memory_config(&server, &output, r#"{% include "nowhere" %}"#),
        connector(&server),
        &SequentialIds::new(),
    )
    .expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();
    next_named(&mut events, "deploy").await;

    let body = output.get("foo").expect("diagnostic page");
    assert!(body.contains("_page"), "{body}");

    handle.stop();
    handle.wait().await.expect("clean stop");
}

#[tokio::test]
async fn render_failures_abort_when_configured() {
    let server = MemoryServer::new();
    server
        .put_document("db", Document::new("foo"))
        .expect("seed foo");
    let output = MemoryOutput::new();

    let mut config = memory_config(&server, &output, r#"{% include "nowhere" %}"#);
    config.render_failure = RenderFailurePolicy::Abort;
    let builder =
        Builder::new(config, connector(&server), &SequentialIds::new()).expect("builder");
    let handle = builder.start();

    let err = timeout(WAIT, handle.wait())
        .await
        .expect("builder finishes")
        .expect_err("render abort");
    assert!(matches!(err, BuildError::Render { ref page, .. } if page == "foo"));
    assert!(output.is_empty());
}

#[tokio::test]
async fn deleted_documents_are_retracted_when_configured() {
    let server = MemoryServer::new();
    server
        .put_document("db", Document::new("foo").with_field("value", "tball"))
        .expect("seed foo");
    server
        .put_document("db", Document::new("bar").with_field("value", "camp"))
        .expect("seed bar");
    let output = MemoryOutput::new();

    let mut config = memory_config(&server, &output, "{{ value }}");
    config.deleted = DeletedPolicy::Retract;
    let builder =
        Builder::new(config, connector(&server), &SequentialIds::new()).expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();
    next_named(&mut events, "deploy").await;
    assert_eq!(output.len(), 2);

    server.delete_document("db", "foo").expect("delete foo");
    next_named(&mut events, "deploy").await;
    assert_eq!(output.get("foo"), None);
    assert_eq!(output.get("bar").as_deref(), Some("camp"));

    handle.stop();
    handle.wait().await.expect("clean stop");
}

#[tokio::test]
async fn deleted_documents_fail_the_build_when_configured() {
    let server = MemoryServer::new();
    server
        .put_document("db", Document::new("foo"))
        .expect("seed foo");
    server.delete_document("db", "foo").expect("delete foo");
    let output = MemoryOutput::new();

    let mut config = memory_config(&server, &output, "{{ _id }}");
    config.deleted = DeletedPolicy::Fail;
    let builder =
        Builder::new(config, connector(&server), &SequentialIds::new()).expect("builder");
    let handle = builder.start();

    let err = timeout(WAIT, handle.wait())
        .await
        .expect("builder finishes")
        .expect_err("deleted document");
    assert!(err.to_string().contains("foo"), "{err}");
}

#[tokio::test]
async fn autostop_ends_the_builder_after_the_first_deploy() {
    let server = MemoryServer::new();
    server
        .put_document("db", Document::new("foo").with_field("value", "tball"))
        .expect("seed foo");
    let output = MemoryOutput::new();

    let mut config = memory_config(&server, &output, "{{ value }}");
    config.autostop = true;
    let builder =
        Builder::new(config, connector(&server), &SequentialIds::new()).expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();

    timeout(WAIT, handle.wait())
        .await
        .expect("builder finishes")
        .expect("autostop is a clean stop");
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.name());
    }
    assert_eq!(seen.first(), Some(&"started"));
    assert_eq!(&seen[seen.len() - 3..], &["deploy", "stopped", "died"]);
    assert_eq!(output.get("foo").as_deref(), Some("tball"));
}

#[tokio::test]
async fn missing_source_database_is_rejected() {
    let server = MemoryServer::new();
    let output = MemoryOutput::new();
    let builder = Builder::new(
        memory_config(&server, &output, "{{ _id }}"),
        connector(&server),
        &SequentialIds::new(),
    )
    .expect("builder");
    let handle = builder.start();

    let err = timeout(WAIT, handle.wait())
        .await
        .expect("builder finishes")
        .expect_err("missing database");
    assert!(err.to_string().contains("does not exist"), "{err}");
}
