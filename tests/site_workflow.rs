use std::{sync::Arc, time::Duration};

use staticplus::{
    application::{
        build::{BuildEvent, Builder, SequentialIds},
        promote::{PromotionController, PromotionState},
        site::{Site, SiteSettings},
    },
    domain::Document,
    infra::store::{MemoryServer, StoreConnector, StoreServer},
};
use tempfile::TempDir;
use tokio::{sync::broadcast, time::timeout};

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

fn write_files(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    for (name, body) in files {
        std::fs::write(dir.path().join(name), body).expect("write resource");
    }
    dir
}

async fn prepared_site(server: &MemoryServer) -> Site {
    let mut settings = SiteSettings::new(server.url().clone(), "blog", "example.com");
    settings.push_cycle = Duration::ZERO;
    settings.bounce_prefix = Some("bounce.".into());
    let site = Site::connect(settings, server).expect("site");
    site.prepare().await.expect("prepare");
    site
}

#[tokio::test]
async fn stored_templates_render_into_the_staging_document() {
    let server = MemoryServer::new();
    let site = prepared_site(&server).await;

    let seed = write_files(&[("page.html", "<h1>{{ title }}</h1>")]);
    let resources = write_files(&[("style.css", "body { color: red }")]);
    assert_eq!(site.seed(seed.path()).await.expect("seed"), 1);
    assert_eq!(
        site.publish_dir(resources.path()).await.expect("publish"),
        1
    );
    server
        .put_document(
            "blog",
            Document::new("hello")
                .with_field("path", "hello")
                .with_field("title", "Hi"),
        )
        .expect("content document");

    let connector: Arc<dyn StoreConnector> = Arc::new(server.clone());
    let builder =
        Builder::new(site.builder_config(), connector, &SequentialIds::new()).expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();
    next_named(&mut events, "deploy").await;

    let staging = server
        .document("blog", "_design/SP-staging")
        .expect("staging document");
    for key in ["SP/hello", "SP/hello/"] {
        let page = staging.attachments.get(key).expect("page attachment");
        assert_eq!(page.text(), Some("<h1>Hi</h1>"));
        assert!(page.is_html());
    }
    assert_eq!(
        staging
            .attachments
            .get("SP/style.css")
            .and_then(|css| css.text()),
        Some("body { color: red }")
    );

    site.request_promotion().await.expect("request promotion");
    next_named(&mut events, "promoted").await;

    let staging = server
        .document("blog", "_design/SP-staging")
        .expect("staging document");
    let production = server
        .document("blog", "_design/SP-production")
        .expect("production document");
    assert_eq!(
        PromotionController::state(&staging),
        PromotionState::Promoted
    );
    assert_eq!(
        production
            .attachments
            .get("SP/hello")
            .and_then(|page| page.text()),
        Some("<h1>Hi</h1>")
    );
    assert_eq!(
        server.config_value("vhosts", "bounce.example.com").as_deref(),
        Some("/blog/_design/SP-production/_show/bounce")
    );

    handle.stop();
    timeout(WAIT, handle.wait())
        .await
        .expect("builder finishes")
        .expect("clean stop");
}

#[tokio::test]
async fn documents_without_a_path_are_not_published() {
    let server = MemoryServer::new();
    let site = prepared_site(&server).await;
    let seed = write_files(&[("page.html", "{{ title }}")]);
    site.seed(seed.path()).await.expect("seed");
    server
        .put_document("blog", Document::new("draft").with_field("title", "Draft"))
        .expect("draft");
    server
        .put_document(
            "blog",
            Document::new("about")
                .with_field("path", "about")
                .with_field("title", "About"),
        )
        .expect("about");

    let connector: Arc<dyn StoreConnector> = Arc::new(server.clone());
    let builder =
        Builder::new(site.builder_config(), connector, &SequentialIds::new()).expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();
    next_named(&mut events, "deploy").await;

    let staging = server
        .document("blog", "_design/SP-staging")
        .expect("staging document");
    assert!(staging.attachments.contains_key("SP/about"));
    assert!(!staging.attachments.keys().any(|key| key.contains("draft")));

    handle.stop();
    timeout(WAIT, handle.wait())
        .await
        .expect("builder finishes")
        .expect("clean stop");
}

#[tokio::test]
async fn reseeding_replaces_the_seed_attachments() {
    let server = MemoryServer::new();
    let site = prepared_site(&server).await;

    let first = write_files(&[("page.html", "one"), ("old.html", "old")]);
    site.seed(first.path()).await.expect("first seed");
    let second = write_files(&[("page.html", "two")]);
    site.seed(second.path()).await.expect("second seed");

    let seed = server.document("blog", "seed").expect("seed document");
    let names: Vec<&str> = seed.attachments.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["page.html"]);
    assert_eq!(seed.attachments["page.html"].text(), Some("two"));
}
