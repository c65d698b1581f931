//! Current document and attachment state, materialized from the feed.

use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, warn};

use crate::domain::{Attachment, AttachmentBody, ChangeEvent, Document, QueueRule};
use crate::infra::store::DocumentStore;

/// An attachment together with the document that carries it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedAttachment {
    pub owner: String,
    pub attachment: Attachment,
    /// Set once the body has been handed to the template engine.
    pub registered: bool,
}

/// Identifies one attachment body that still has to be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubRef {
    pub owner: String,
    pub name: String,
}

/// What applying one change did to the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Updated { id: String, queued: Option<String> },
    /// The document is gone; `page` is the page it used to produce.
    Deleted { id: String, page: Option<String> },
    /// Design documents are never cached; the caller decides what to do.
    Design(Document),
    Ignored,
}

pub struct DocumentCache {
    store: Option<Arc<dyn DocumentStore>>,
    rule: QueueRule,
    documents: BTreeMap<String, Document>,
    attachments: BTreeMap<String, IndexedAttachment>,
    queue: BTreeMap<String, Document>,
}

impl DocumentCache {
    /// `store` supplies attachment URLs; without it attachments stay
    /// unaddressed.
    pub fn new(store: Option<Arc<dyn DocumentStore>>, rule: QueueRule) -> Self {
        Self {
            store,
            rule,
            documents: BTreeMap::new(),
            attachments: BTreeMap::new(),
            queue: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, change: ChangeEvent) -> Applied {
        let deleted = change.deleted || change.document.as_ref().is_some_and(|doc| doc.deleted);
        if deleted {
            return self.remove(&change.id);
        }
        let Some(document) = change.document else {
            debug!(
                target = "staticplus::application::cache",
                id = %change.id,
                "change carries no document; ignored"
            );
            return Applied::Ignored;
        };
        if document.is_design() {
            return Applied::Design(document);
        }
        let id = document.id.clone();
        let queued = self.insert(document);
        Applied::Updated { id, queued }
    }

    /// Replaces the cached document and queues its page when the queue rule
    /// accepts it. Returns the page id it was queued under.
    pub fn insert(&mut self, mut document: Document) -> Option<String> {
        let id = document.id.clone();
        self.attachments
            .retain(|name, indexed| indexed.owner != id || document.attachments.contains_key(name));

        for (name, attachment) in document.attachments.iter_mut() {
            if let Some(store) = &self.store {
                attachment.url = Some(store.attachment_url(&id, name).to_string());
            }
            let previous = self.attachments.insert(
                name.clone(),
                IndexedAttachment {
                    owner: id.clone(),
                    attachment: attachment.clone(),
                    registered: false,
                },
            );
            if let Some(previous) = previous.filter(|previous| previous.owner != id) {
                debug!(
                    target = "staticplus::application::cache",
                    attachment = %name,
                    previous = %previous.owner,
                    owner = %id,
                    "attachment name now served from another document"
                );
            }
        }

        if let Some(previous) = self.documents.get(&id).and_then(|doc| self.page_id(doc)) {
            self.queue.remove(&previous);
        }
        let page = self.page_id(&document);
        if let Some(page) = &page {
            self.queue.insert(page.clone(), document.clone());
        }
        self.documents.insert(id, document);
        page
    }

    fn remove(&mut self, id: &str) -> Applied {
        let Some(previous) = self.documents.remove(id) else {
            debug!(
                target = "staticplus::application::cache",
                id,
                "deleted document was never cached"
            );
            return Applied::Deleted {
                id: id.to_string(),
                page: None,
            };
        };
        self.attachments.retain(|_, indexed| indexed.owner != id);
        let page = self.page_id(&previous);
        if let Some(page) = &page {
            self.queue.remove(page);
        }
        warn!(
            target = "staticplus::application::cache",
            id,
            page = ?page,
            "document deleted"
        );
        Applied::Deleted {
            id: id.to_string(),
            page,
        }
    }

    /// The page a document produces under the queue rule, if any.
    pub fn page_id(&self, document: &Document) -> Option<String> {
        if document.is_design() {
            return None;
        }
        let path = || document.path().map(|path| path.trim_start_matches('/').to_string());
        match self.rule {
            QueueRule::EveryDocument => Some(document.id.clone()),
            QueueRule::WithPath => path(),
            QueueRule::WithPathAndTemplate => document.template().and_then(|_| path()),
        }
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn document(&self, id: &str) -> Option<&Document> {
        self.documents.get(id)
    }

    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.attachments.get(name).map(|indexed| &indexed.attachment)
    }

    pub fn attachments_mut(&mut self) -> impl Iterator<Item = (&String, &mut IndexedAttachment)> {
        self.attachments.iter_mut()
    }

    pub fn stubs(&self) -> Vec<StubRef> {
        self.attachments
            .iter()
            .filter(|(_, indexed)| indexed.attachment.is_stub())
            .map(|(name, indexed)| StubRef {
                owner: indexed.owner.clone(),
                name: name.clone(),
            })
            .collect()
    }

    /// Stores a fetched body. Ignored when the entry has since moved to a
    /// different document or is no longer a stub.
    pub fn fill(&mut self, stub: &StubRef, body: Vec<u8>) -> bool {
        match self.attachments.get_mut(&stub.name) {
            Some(indexed) if indexed.owner == stub.owner && indexed.attachment.is_stub() => {
                indexed.attachment.body = AttachmentBody::Inline(body);
                indexed.attachment.template = None;
                indexed.registered = false;
                true
            }
            _ => false,
        }
    }

    /// Drains the page queue in page-id order.
    pub fn take_queue(&mut self) -> BTreeMap<String, Document> {
        std::mem::take(&mut self.queue)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::store::{MemoryServer, StoreServer};

    fn change(seq: u64, document: Document) -> ChangeEvent {
        ChangeEvent {
            seq,
            id: document.id.clone(),
            deleted: document.deleted,
            document: Some(document),
        }
    }

    fn page_doc(id: &str, path: &str) -> Document {
        Document::new(id).with_field("path", path)
    }

    #[test]
    fn with_path_rule_strips_leading_slashes() {
        let mut cache = DocumentCache::new(None, QueueRule::WithPath);
        assert_eq!(
            cache.apply(change(1, page_doc("about", "//about/team"))),
            Applied::Updated {
                id: "about".into(),
                queued: Some("about/team".into())
            }
        );
        assert_eq!(
            cache.apply(change(2, Document::new("nav"))),
            Applied::Updated {
                id: "nav".into(),
                queued: None
            }
        );
        let queue = cache.take_queue();
        assert_eq!(queue.keys().collect::<Vec<_>>(), vec!["about/team"]);
        assert_eq!(cache.queue_len(), 0);
        assert_eq!(cache.documents().count(), 2);
    }

    #[test]
    fn strict_rule_requires_template() {
        let mut cache = DocumentCache::new(None, QueueRule::WithPathAndTemplate);
        cache.apply(change(1, page_doc("a", "a")));
        cache.apply(change(2, page_doc("b", "b").with_field("template", "post")));
        assert_eq!(cache.take_queue().keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn design_documents_bypass_the_cache() {
        let mut cache = DocumentCache::new(None, QueueRule::EveryDocument);
        let applied = cache.apply(change(1, Document::new("_design/SP-staging")));
        assert!(matches!(applied, Applied::Design(ref doc) if doc.id == "_design/SP-staging"));
        assert_eq!(cache.documents().count(), 0);
        assert_eq!(cache.queue_len(), 0);
    }

    #[test]
    fn deletion_drops_document_queue_entry_and_attachments() {
        let mut cache = DocumentCache::new(None, QueueRule::WithPath);
        let mut doc = page_doc("home", "/");
        doc.attachments
            .insert("page.html".into(), Attachment::stub("text/html"));
        cache.apply(change(1, doc.clone()));

        doc.deleted = true;
        assert_eq!(
            cache.apply(change(2, doc)),
            Applied::Deleted {
                id: "home".into(),
                page: Some(String::new())
            }
        );
        assert!(cache.document("home").is_none());
        assert!(cache.attachment("page.html").is_none());
        assert_eq!(cache.queue_len(), 0);
    }

    #[test]
    fn stubs_get_urls_and_can_be_filled() {
        let server = MemoryServer::new();
        let mut cache =
            DocumentCache::new(Some(server.database("site")), QueueRule::EveryDocument);
        let mut doc = Document::new("seed");
        doc.attachments
            .insert("page.html".into(), Attachment::stub("text/html"));
        cache.apply(change(1, doc));

        let url = cache
            .attachment("page.html")
            .and_then(|att| att.url.clone())
            .expect("url");
        assert_eq!(url, "http://memory.invalid/site/seed/page.html");

        let stubs = cache.stubs();
        assert_eq!(
            stubs,
            vec![StubRef {
                owner: "seed".into(),
                name: "page.html".into()
            }]
        );
        assert!(cache.fill(&stubs[0], b"<p></p>".to_vec()));
        assert!(cache.stubs().is_empty());
        assert!(!cache.fill(&stubs[0], b"again".to_vec()));
    }

    #[test]
    fn dropped_attachments_leave_the_index() {
        let mut cache = DocumentCache::new(None, QueueRule::EveryDocument);
        let mut doc = Document::new("seed");
        doc.attachments
            .insert("old.css".into(), Attachment::inline("text/css", "a{}"));
        cache.apply(change(1, doc));

        let mut doc = Document::new("seed");
        doc.attachments
            .insert("new.css".into(), Attachment::inline("text/css", "b{}"));
        cache.apply(change(2, doc));

        assert!(cache.attachment("old.css").is_none());
        assert!(cache.attachment("new.css").is_some());
    }
}
