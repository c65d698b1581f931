//! Store documents and their named attachments.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Map, Value};

use super::error::DocumentError;

/// Id prefix of design documents; these never become pages.
pub const DESIGN_PREFIX: &str = "_design/";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A JSON document as held by the store, split into its reserved members
/// and the user-facing fields that templates see.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub rev: Option<String>,
    pub deleted: bool,
    /// Every non-reserved member, in the order the store returned them.
    pub fields: Map<String, Value>,
    pub attachments: BTreeMap<String, Attachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub content_type: String,
    pub body: AttachmentBody,
    /// Where a stub can be fetched from, once the owning document is known.
    pub url: Option<String>,
    /// Set once an HTML body has been compiled into the template engine.
    pub template: Option<CompiledTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentBody {
    Inline(Vec<u8>),
    /// Metadata only; the body still lives in the store.
    Stub,
}

/// Handle to a template registered with the engine under a logical name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTemplate {
    name: String,
}

impl CompiledTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Attachment name with its final extension removed (`page.html` -> `page`).
pub fn logical_name(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() => stem,
        _ => name,
    }
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            deleted: false,
            fields: Map::new(),
            attachments: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn is_design(&self) -> bool {
        self.id.starts_with(DESIGN_PREFIX)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn path(&self) -> Option<&str> {
        self.str_field("path")
    }

    pub fn template(&self) -> Option<&str> {
        self.str_field("template")
    }

    /// Parses the store's JSON shape. Attachments carrying `data` become
    /// inline bodies; everything else is a stub.
    pub fn from_json(value: Value) -> Result<Self, DocumentError> {
        let Value::Object(mut object) = value else {
            return Err(DocumentError::NotAnObject);
        };

        let id = match object.remove("_id") {
            Some(Value::String(id)) => id,
            _ => return Err(DocumentError::missing("_id")),
        };
        let rev = match object.remove("_rev") {
            Some(Value::String(rev)) => Some(rev),
            _ => None,
        };
        let deleted = matches!(object.remove("_deleted"), Some(Value::Bool(true)));

        let mut attachments = BTreeMap::new();
        if let Some(raw) = object.remove("_attachments") {
            let Value::Object(entries) = raw else {
                return Err(DocumentError::attachment("*", "`_attachments` is not an object"));
            };
            for (name, entry) in entries {
                let attachment = Attachment::from_json(&name, entry)?;
                attachments.insert(name, attachment);
            }
        }

        // Remaining reserved members (`_conflicts`, `_revisions`, ...) are
        // store bookkeeping and cannot be written back.
        object.retain(|key, _| !key.starts_with('_'));

        Ok(Self {
            id,
            rev,
            deleted,
            fields: object,
            attachments,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("_id".into(), Value::String(self.id.clone()));
        if let Some(rev) = &self.rev {
            object.insert("_rev".into(), Value::String(rev.clone()));
        }
        if self.deleted {
            object.insert("_deleted".into(), Value::Bool(true));
        }
        if !self.attachments.is_empty() {
            let entries = self
                .attachments
                .iter()
                .map(|(name, attachment)| (name.clone(), attachment.to_json()))
                .collect::<Map<_, _>>();
            object.insert("_attachments".into(), Value::Object(entries));
        }
        Value::Object(object)
    }
}

impl Attachment {
    pub fn inline(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            body: AttachmentBody::Inline(body.into()),
            url: None,
            template: None,
        }
    }

    pub fn stub(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            body: AttachmentBody::Stub,
            url: None,
            template: None,
        }
    }

    pub fn is_stub(&self) -> bool {
        matches!(self.body, AttachmentBody::Stub)
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.body {
            AttachmentBody::Inline(bytes) => Some(bytes),
            AttachmentBody::Stub => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    fn from_json(name: &str, value: Value) -> Result<Self, DocumentError> {
        let Value::Object(entry) = value else {
            return Err(DocumentError::attachment(name, "entry is not an object"));
        };
        let content_type = entry
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        match entry.get("data").and_then(Value::as_str) {
            Some(data) => {
                let body = STANDARD
                    .decode(data)
                    .map_err(|err| DocumentError::attachment(name, err.to_string()))?;
                Ok(Self::inline(content_type, body))
            }
            None => Ok(Self::stub(content_type)),
        }
    }

    fn to_json(&self) -> Value {
        let mut entry = Map::new();
        entry.insert(
            "content_type".into(),
            Value::String(self.content_type.clone()),
        );
        match &self.body {
            AttachmentBody::Inline(bytes) => {
                entry.insert("data".into(), Value::String(STANDARD.encode(bytes)));
            }
            AttachmentBody::Stub => {
                entry.insert("stub".into(), Value::Bool(true));
            }
        }
        Value::Object(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_splits_reserved_members() {
        let doc = Document::from_json(json!({
            "_id": "about",
            "_rev": "3-abc",
            "_conflicts": ["2-x"],
            "title": "About",
            "_attachments": {
                "page.html": {"content_type": "text/html", "stub": true, "length": 12},
                "logo.svg": {"content_type": "image/svg+xml", "data": "PHN2Zy8+"}
            }
        }))
        .expect("parse");

        assert_eq!(doc.id, "about");
        assert_eq!(doc.rev.as_deref(), Some("3-abc"));
        assert_eq!(doc.fields.len(), 1);
        assert!(doc.attachments["page.html"].is_stub());
        assert!(doc.attachments["page.html"].is_html());
        assert_eq!(doc.attachments["logo.svg"].text(), Some("<svg/>"));
    }

    #[test]
    fn to_json_encodes_inline_bodies_and_keeps_stubs() {
        let mut doc = Document::new("_design/SP-staging").with_field("title", "x");
        doc.rev = Some("1-a".into());
        doc.attachments
            .insert("SP/index".into(), Attachment::inline("text/html", "<p>hi</p>"));
        doc.attachments.insert("page.html".into(), Attachment::stub("text/html"));

        let value = doc.to_json();
        assert_eq!(value["_id"], "_design/SP-staging");
        assert_eq!(value["_attachments"]["SP/index"]["data"], "PHA+aGk8L3A+");
        assert_eq!(value["_attachments"]["page.html"]["stub"], true);
        assert!(doc.is_design());

        let back = Document::from_json(value).expect("round trip");
        assert_eq!(back.attachments["SP/index"].text(), Some("<p>hi</p>"));
    }

    #[test]
    fn rejects_documents_without_ids() {
        assert_eq!(
            Document::from_json(json!({"title": "x"})),
            Err(DocumentError::missing("_id"))
        );
        assert_eq!(Document::from_json(json!([1])), Err(DocumentError::NotAnObject));
    }

    #[test]
    fn logical_name_drops_final_extension() {
        assert_eq!(logical_name("page.html"), "page");
        assert_eq!(logical_name("site.min.css"), "site.min");
        assert_eq!(logical_name("README"), "README");
    }
}
