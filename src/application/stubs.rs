//! Completes stub attachments before a render pass.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, instrument};

use crate::application::{cache::DocumentCache, render::TemplateEngine};
use crate::infra::store::{DocumentStore, StoreError};

pub struct StubResolver {
    store: Arc<dyn DocumentStore>,
}

impl StubResolver {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Fetches every stub in the cache, round after round until none are
    /// left, then hands new bodies to the template engine. Fetches within a
    /// round run concurrently; the first failure fails the resolution once
    /// the round has settled. Returns the number of bodies fetched.
    #[instrument(level = "debug", skip_all, fields(db = %self.store.name()))]
    pub async fn resolve(
        &self,
        cache: &mut DocumentCache,
        engine: &mut TemplateEngine,
    ) -> Result<usize, StoreError> {
        let mut fetched = 0;
        loop {
            let stubs = cache.stubs();
            if stubs.is_empty() {
                break;
            }
            debug!(
                target = "staticplus::application::stubs",
                count = stubs.len(),
                "fetching stub attachments"
            );

            let store = &self.store;
            let results = join_all(stubs.into_iter().map(|stub| async move {
                let body = store.attachment(&stub.owner, &stub.name).await;
                (stub, body)
            }))
            .await;

            let mut failure = None;
            for (stub, body) in results {
                match body {
                    Ok(body) => {
                        if cache.fill(&stub, body) {
                            fetched += 1;
                        }
                    }
                    Err(err) => {
                        failure.get_or_insert(err);
                    }
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }

        register_templates(cache, engine);
        Ok(fetched)
    }
}

/// Compiles HTML bodies not yet seen by the engine and registers other
/// text bodies as literal partials. Compile failures stay recorded in the
/// engine and surface when a page renders with that template.
pub fn register_templates(cache: &mut DocumentCache, engine: &mut TemplateEngine) {
    for (name, indexed) in cache.attachments_mut() {
        if indexed.registered {
            continue;
        }
        let Some(bytes) = indexed.attachment.bytes() else {
            continue;
        };
        if indexed.attachment.is_html() {
            let source = String::from_utf8_lossy(bytes);
            indexed.attachment.template = engine.compile(name, &source).ok();
        } else if let Ok(text) = std::str::from_utf8(bytes) {
            engine.literal(name, text);
        }
        indexed.registered = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::render::Scope;
    use crate::domain::{Attachment, ChangeEvent, Document, QueueRule};
    use crate::infra::store::{MemoryServer, StoreServer};

    async fn seeded(server: &MemoryServer) -> DocumentCache {
        let mut seed = Document::new("seed");
        seed.attachments.insert(
            "page.html".into(),
            Attachment::inline("text/html", "<main>{% include 'nav' %}{{ title }}</main>"),
        );
        seed.attachments
            .insert("nav.html".into(), Attachment::inline("text/html", "<nav></nav>"));
        server.put_document("site", seed).expect("seed");

        let store = server.database("site");
        let stubbed = store.get("seed").await.expect("get").expect("exists");
        assert!(stubbed.attachments.values().all(Attachment::is_stub));

        let mut cache = DocumentCache::new(Some(store), QueueRule::WithPath);
        cache.apply(ChangeEvent {
            seq: 1,
            id: "seed".into(),
            deleted: false,
            document: Some(stubbed),
        });
        cache
    }

    #[tokio::test]
    async fn resolves_stubs_and_compiles_templates() {
        let server = MemoryServer::new();
        let mut cache = seeded(&server).await;
        let mut engine = TemplateEngine::new();

        let resolver = StubResolver::new(server.database("site"));
        let fetched = resolver
            .resolve(&mut cache, &mut engine)
            .await
            .expect("resolve");
        assert_eq!(fetched, 2);
        assert!(cache.stubs().is_empty());
        assert_eq!(
            cache
                .attachment("page.html")
                .and_then(|att| att.template.as_ref())
                .map(|template| template.name()),
            Some("page")
        );

        let page = Document::new("home").with_field("title", "Hi");
        let html = engine
            .render("page", &Scope::build(cache.documents(), &page))
            .expect("render");
        assert_eq!(html, "<main><nav></nav>Hi</main>");

        let again = resolver
            .resolve(&mut cache, &mut engine)
            .await
            .expect("nothing left");
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn failed_fetch_fails_the_whole_resolution() {
        let server = MemoryServer::new();
        let mut cache = seeded(&server).await;
        server.delete_document("site", "seed").expect("delete");

        let resolver = StubResolver::new(server.database("site"));
        let mut engine = TemplateEngine::new();
        assert!(resolver.resolve(&mut cache, &mut engine).await.is_err());
        assert_eq!(cache.stubs().len(), 2);
    }
}
