use std::sync::Arc;

use minijinja::Value;
use serde_json::Map;

use crate::domain::Document;

use super::helpers::HELPER_NAMES;

/// Variables visible to one page render.
///
/// Layered lowest to highest: every cached document by id, then the page's
/// own fields with `_id` and `_rev`. Helper names are removed last so they
/// always resolve to the helper.
#[derive(Debug, Clone)]
pub struct Scope {
    id: Arc<str>,
    fields: Arc<Map<String, serde_json::Value>>,
    value: Value,
}

impl Scope {
    pub fn build<'a>(documents: impl IntoIterator<Item = &'a Document>, page: &Document) -> Self {
        let mut fields = Map::new();
        for document in documents {
            fields.insert(document.id.clone(), document_value(document));
        }
        if let serde_json::Value::Object(own) = document_value(page) {
            fields.extend(own);
        }
        for name in HELPER_NAMES {
            fields.remove(*name);
        }

        let value = Value::from_serialize(&fields);
        Self {
            id: Arc::from(page.id.as_str()),
            fields: Arc::new(fields),
            value,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// A string member, or `None` when absent or not a string.
    pub fn str_value(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    }
}

fn document_value(document: &Document) -> serde_json::Value {
    let mut object = document.fields.clone();
    object.insert("_id".into(), document.id.clone().into());
    if let Some(rev) = &document.rev {
        object.insert("_rev".into(), rev.clone().into());
    }
    serde_json::Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_fields_override_documents_and_helpers_win() {
        let other = Document::new("title").with_field("text", "from other");
        let page = Document::new("home")
            .with_field("title", "Home")
            .with_field("markdown", "shadowed");

        let scope = Scope::build([&other], &page);
        assert_eq!(scope.str_value("title").as_deref(), Some("Home"));
        assert_eq!(scope.str_value("_id").as_deref(), Some("home"));
        assert!(scope.get("markdown").is_none());
        assert_eq!(scope.id(), "home");
    }

    #[test]
    fn other_documents_are_reachable_by_id() {
        let nav = Document::new("nav").with_field("label", "Menu");
        let page = Document::new("home");
        let scope = Scope::build([&nav, &page], &page);
        let label = scope.get("nav").and_then(|nav| nav.get("label"));
        assert_eq!(label, Some(&serde_json::Value::from("Menu")));
        assert_eq!(scope.str_value("nav"), None);
    }
}
