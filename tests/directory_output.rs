use std::{sync::Arc, time::Duration};

use staticplus::{
    application::build::{BuildEvent, Builder, BuilderConfig, SequentialIds, TemplateSpec},
    domain::Document,
    infra::{
        output::{OutputHandle, Target},
        store::{MemoryServer, StoreConnector, StoreServer},
    },
};
use tempfile::TempDir;
use tokio::{sync::broadcast, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

async fn deploy(events: &mut broadcast::Receiver<BuildEvent>) -> OutputHandle {
    let deployed = async {
        loop {
            match events.recv().await {
                Ok(BuildEvent::Deploy(handle)) => return handle,
                Ok(_) => {}
                Err(err) => panic!("event stream ended before deploy: {err}"),
            }
        }
    };
    timeout(WAIT, deployed).await.expect("deploy in time")
}

fn template_file(dir: &TempDir, source: &str) -> std::path::PathBuf {
    let path = dir.path().join("page.html");
    std::fs::write(&path, source).expect("write template");
    path
}

async fn build_once(server: &MemoryServer, out: &std::path::Path, template: TemplateSpec) {
    let mut config = BuilderConfig::new(Target::Directory(out.to_path_buf()), template)
        .with_source(format!("{}db", server.url()));
    config.autostop = true;
    let connector: Arc<dyn StoreConnector> = Arc::new(server.clone());
    let builder = Builder::new(config, connector, &SequentialIds::new()).expect("builder");
    let mut events = builder.subscribe();
    let handle = builder.start();

    match deploy(&mut events).await {
        OutputHandle::Directory(path) => assert_eq!(path, out),
        other => panic!("unexpected handle: {other:?}"),
    }
    timeout(WAIT, handle.wait())
        .await
        .expect("builder finishes")
        .expect("clean stop");
}

#[tokio::test]
async fn pages_land_as_html_files() {
    let server = MemoryServer::new();
    server
        .put_document("db", Document::new("bar").with_field("value", "camp"))
        .expect("seed bar");
    let work = TempDir::new().expect("tempdir");
    let out = work.path().join("out");
    let template = template_file(&work, "{{ _id }}: {{ value }}");

    build_once(&server, &out, TemplateSpec::File(template)).await;

    let page = std::fs::read_to_string(out.join("bar.html")).expect("bar.html");
    assert!(page.contains("bar: camp"), "{page}");
}

#[tokio::test]
async fn rebuilding_replaces_stale_output() {
    let server = MemoryServer::new();
    server
        .put_document("db", Document::new("bar").with_field("value", "camp"))
        .expect("seed bar");
    let work = TempDir::new().expect("tempdir");
    let out = work.path().join("out");
    std::fs::create_dir_all(&out).expect("out dir");
    std::fs::write(out.join("stale.html"), "left over").expect("stale file");

    let template = TemplateSpec::Inline("{{ value }}".to_string());
    build_once(&server, &out, template.clone()).await;
    build_once(&server, &out, template).await;

    let mut files: Vec<String> = std::fs::read_dir(&out)
        .expect("read out")
        .map(|entry| {
            entry
                .expect("entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    files.sort();
    assert_eq!(files, vec!["bar.html".to_string()]);
    assert_eq!(
        std::fs::read_to_string(out.join("bar.html")).expect("bar.html"),
        "camp"
    );
}

#[tokio::test]
async fn output_path_that_is_a_file_is_rejected() {
    let server = MemoryServer::new();
    server
        .put_document("db", Document::new("bar"))
        .expect("seed bar");
    let work = TempDir::new().expect("tempdir");
    let out = work.path().join("taken");
    std::fs::write(&out, "not a directory").expect("file");

    let config = BuilderConfig::new(
        Target::Directory(out.clone()),
        TemplateSpec::Inline("{{ _id }}".to_string()),
    )
    .with_source(format!("{}db", server.url()));
    let connector: Arc<dyn StoreConnector> = Arc::new(server.clone());
    let handle = Builder::new(config, connector, &SequentialIds::new())
        .expect("builder")
        .start();

    let err = timeout(WAIT, handle.wait())
        .await
        .expect("builder finishes")
        .expect_err("file in the way");
    assert!(err.to_string().contains("not a directory"), "{err}");
    assert_eq!(
        std::fs::read_to_string(&out).expect("untouched"),
        "not a directory"
    );
}
