//! CouchDB over HTTP.

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::domain::{ChangeEvent, Document};

use super::{
    ChangesBatch, ChangesQuery, DatabaseInfo, DocumentStore, FeedMode, Probe, Session,
    StoreConnector, StoreError, StoreServer, Welcome, id_segments, push_segments,
};

/// `user:password` pair sent as HTTP basic auth.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl FromStr for Credentials {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((username, password)) if !username.is_empty() => Ok(Self {
                username: username.to_string(),
                password: password.to_string(),
            }),
            _ => Err("credentials must look like `user:password`".to_string()),
        }
    }
}

impl Credentials {
    fn from_url(url: &Url) -> Option<Self> {
        (!url.username().is_empty()).then(|| Self {
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
        })
    }
}

/// Connects to CouchDB servers with one shared HTTP client.
#[derive(Clone, Debug)]
pub struct CouchConnector {
    client: Client,
    credentials: Option<Credentials>,
}

impl CouchConnector {
    pub fn new(credentials: Option<Credentials>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .build()
            .map_err(StoreError::transport)?;
        Ok(Self {
            client,
            credentials,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("staticplus/", env!("CARGO_PKG_VERSION"))
    }
}

impl StoreConnector for CouchConnector {
    fn connect(&self, server: &Url) -> Result<Arc<dyn StoreServer>, StoreError> {
        let credentials = self
            .credentials
            .clone()
            .or_else(|| Credentials::from_url(server));
        let mut base = server.clone();
        base.set_path("/");
        base.set_query(None);
        base.set_fragment(None);
        // Credentials travel in the Authorization header, never in logged URLs.
        let _ = base.set_username("");
        let _ = base.set_password(None);
        Ok(Arc::new(CouchServer::new(self.client.clone(), base, credentials)))
    }
}

#[derive(Clone, Debug)]
pub struct CouchServer {
    client: Client,
    base: Url,
    credentials: Option<Credentials>,
}

impl CouchServer {
    pub fn new(client: Client, base: Url, credentials: Option<Credentials>) -> Self {
        Self {
            client,
            base,
            credentials,
        }
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.credentials {
            Some(creds) => builder.basic_auth(&creds.username, Some(&creds.password)),
            None => builder,
        }
    }

    fn path_url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base.clone();
        push_segments(&mut url, segments);
        url
    }
}

async fn send(builder: RequestBuilder) -> Result<Response, StoreError> {
    builder.send().await.map_err(StoreError::transport)
}

async fn status_error(resp: Response) -> StoreError {
    let status = resp.status().as_u16();
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    StoreError::Status { url, status, body }
}

async fn json_body<T: for<'de> Deserialize<'de>>(resp: Response) -> Result<T, StoreError> {
    let bytes = resp.bytes().await.map_err(StoreError::transport)?;
    serde_json::from_slice(&bytes).map_err(StoreError::decode)
}

#[derive(Deserialize)]
struct WelcomeBody {
    couchdb: Option<String>,
    version: Option<String>,
}

#[derive(Deserialize)]
struct SessionBody {
    #[serde(default)]
    ok: bool,
    #[serde(rename = "userCtx", default)]
    user_ctx: UserCtx,
}

#[derive(Deserialize, Default)]
struct UserCtx {
    name: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Deserialize)]
struct WriteBody {
    rev: String,
}

#[derive(Deserialize)]
struct InfoBody {
    db_name: String,
    update_seq: Value,
    #[serde(default)]
    doc_count: u64,
}

#[derive(Deserialize)]
struct ChangesBody {
    results: Vec<ChangeRow>,
    last_seq: Value,
}

#[derive(Deserialize)]
struct ChangeRow {
    seq: Value,
    id: String,
    #[serde(default)]
    deleted: bool,
    doc: Option<Value>,
}

/// Sequence numbers are integers on 1.x servers and `N-opaque` strings later;
/// the numeric part only orders events, see [`opaque_seq`] for resuming.
fn parse_seq(value: &Value) -> Result<u64, StoreError> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| StoreError::decode(format!("sequence `{number}` is not unsigned"))),
        Value::String(text) => text
            .split('-')
            .next()
            .and_then(|head| head.parse().ok())
            .ok_or_else(|| StoreError::decode(format!("sequence `{text}` has no numeric prefix"))),
        other => Err(StoreError::decode(format!("unexpected sequence `{other}`"))),
    }
}

/// The server's own spelling of a string sequence, kept for resuming.
fn opaque_seq(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn info_from(body: InfoBody) -> Result<DatabaseInfo, StoreError> {
    Ok(DatabaseInfo {
        update_seq: parse_seq(&body.update_seq)?,
        db_name: body.db_name,
        doc_count: body.doc_count,
    })
}

#[async_trait]
impl StoreServer for CouchServer {
    fn url(&self) -> &Url {
        &self.base
    }

    async fn welcome(&self) -> Result<Welcome, StoreError> {
        let resp = send(self.request(Method::GET, self.base.clone())).await?;
        if resp.status() != StatusCode::OK {
            return Err(status_error(resp).await);
        }
        let body: WelcomeBody = json_body(resp).await?;
        Ok(Welcome {
            couchdb: body.couchdb.unwrap_or_default(),
            version: body.version,
        })
    }

    async fn session(&self) -> Result<Session, StoreError> {
        let url = self.path_url(["_session"]);
        let resp = send(self.request(Method::GET, url)).await?;
        if resp.status() != StatusCode::OK {
            return Err(status_error(resp).await);
        }
        let body: SessionBody = json_body(resp).await?;
        Ok(Session {
            ok: body.ok,
            name: body.user_ctx.name,
            roles: body.user_ctx.roles,
        })
    }

    async fn put_config(&self, section: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let url = self.path_url(["_config", section, key]);
        debug!(
            target = "staticplus::infra::store::couch",
            section, key, value, "setting server configuration"
        );
        let resp = send(self.request(Method::PUT, url).json(&value)).await?;
        if resp.status() != StatusCode::OK {
            return Err(status_error(resp).await);
        }
        Ok(())
    }

    async fn probe(&self, segments: &[String]) -> Result<Probe, StoreError> {
        let url = self.path_url(segments.iter().map(String::as_str));
        let resp = send(self.request(Method::GET, url)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(Probe::Missing),
            StatusCode::OK => {
                let body: Value = json_body(resp).await?;
                if body.get("couchdb").is_some() {
                    return Ok(Probe::Server);
                }
                if body.get("db_name").is_some() {
                    let info = serde_json::from_value(body).map_err(StoreError::decode)?;
                    return Ok(Probe::Database(info_from(info)?));
                }
                match (
                    body.get("_id").and_then(Value::as_str),
                    body.get("_rev").and_then(Value::as_str),
                ) {
                    (Some(id), Some(rev)) => Ok(Probe::Document {
                        id: id.to_string(),
                        rev: rev.to_string(),
                    }),
                    _ => Ok(Probe::Other(body)),
                }
            }
            _ => Err(status_error(resp).await),
        }
    }

    fn database(&self, name: &str) -> Arc<dyn DocumentStore> {
        Arc::new(CouchDatabase {
            url: self.path_url([name]),
            name: name.to_string(),
            server: self.clone(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct CouchDatabase {
    server: CouchServer,
    name: String,
    url: Url,
}

#[async_trait]
impl DocumentStore for CouchDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &Url {
        &self.url
    }

    async fn info(&self) -> Result<DatabaseInfo, StoreError> {
        let resp = send(self.server.request(Method::GET, self.url.clone())).await?;
        match resp.status() {
            StatusCode::OK => info_from(json_body(resp).await?),
            StatusCode::NOT_FOUND => Err(StoreError::not_found(&self.name)),
            _ => Err(status_error(resp).await),
        }
    }

    async fn create(&self) -> Result<bool, StoreError> {
        let resp = send(self.server.request(Method::PUT, self.url.clone())).await?;
        match resp.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::PRECONDITION_FAILED => Ok(false),
            _ => Err(status_error(resp).await),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let resp = send(self.server.request(Method::GET, self.document_url(id))).await?;
        match resp.status() {
            StatusCode::OK => {
                let body: Value = json_body(resp).await?;
                Document::from_json(body)
                    .map(Some)
                    .map_err(StoreError::decode)
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_error(resp).await),
        }
    }

    async fn put(&self, doc: &Document) -> Result<String, StoreError> {
        let request = self
            .server
            .request(Method::PUT, self.document_url(&doc.id))
            .json(&doc.to_json());
        let resp = send(request).await?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => {
                let body: WriteBody = json_body(resp).await?;
                Ok(body.rev)
            }
            StatusCode::CONFLICT => Err(StoreError::conflict(&doc.id)),
            _ => Err(status_error(resp).await),
        }
    }

    async fn head(&self, id: &str) -> Result<Option<String>, StoreError> {
        let resp = send(self.server.request(Method::HEAD, self.document_url(id))).await?;
        match resp.status() {
            StatusCode::OK => resp
                .headers()
                .get(header::ETAG)
                .and_then(|value| value.to_str().ok())
                .map(|etag| Some(etag.trim_matches('"').to_string()))
                .ok_or_else(|| StoreError::decode(format!("HEAD {id} returned no ETag"))),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_error(resp).await),
        }
    }

    async fn copy(
        &self,
        source: &str,
        source_rev: &str,
        dest: &str,
        dest_rev: Option<&str>,
    ) -> Result<String, StoreError> {
        let method = Method::from_bytes(b"COPY").map_err(StoreError::transport)?;
        let mut url = self.document_url(source);
        url.query_pairs_mut().append_pair("rev", source_rev);
        let destination = match dest_rev {
            Some(rev) => format!("{dest}?rev={rev}"),
            None => dest.to_string(),
        };
        let request = self
            .server
            .request(method, url)
            .header("Destination", destination);
        let resp = send(request).await?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => {
                let body: WriteBody = json_body(resp).await?;
                Ok(body.rev)
            }
            StatusCode::CONFLICT => Err(StoreError::conflict(dest)),
            _ => Err(status_error(resp).await),
        }
    }

    async fn attachment(&self, id: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        let url = self.attachment_url(id, name);
        let resp = send(self.server.request(Method::GET, url)).await?;
        match resp.status() {
            StatusCode::OK => {
                let bytes = resp.bytes().await.map_err(StoreError::transport)?;
                Ok(bytes.to_vec())
            }
            StatusCode::NOT_FOUND => Err(StoreError::not_found(format!("{id}/{name}"))),
            _ => Err(status_error(resp).await),
        }
    }

    async fn changes(&self, query: &ChangesQuery) -> Result<ChangesBatch, StoreError> {
        let mut url = self.url.clone();
        push_segments(&mut url, ["_changes"]);
        {
            let mut pairs = url.query_pairs_mut();
            match &query.resume {
                Some(token) => pairs.append_pair("since", token),
                None => pairs.append_pair("since", &query.since.to_string()),
            };
            if query.include_docs {
                pairs.append_pair("include_docs", "true");
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if let Some(filter) = &query.filter {
                pairs.append_pair("filter", filter);
            }
            match query.mode {
                FeedMode::Normal => {
                    pairs.append_pair("feed", "normal");
                }
                FeedMode::LongPoll { timeout } => {
                    pairs.append_pair("feed", "longpoll");
                    pairs.append_pair("timeout", &timeout.as_millis().to_string());
                }
            }
        }

        let resp = send(self.server.request(Method::GET, url)).await?;
        if resp.status() != StatusCode::OK {
            return Err(status_error(resp).await);
        }
        let body: ChangesBody = json_body(resp).await?;
        let mut results = Vec::with_capacity(body.results.len());
        for row in body.results {
            let document = row
                .doc
                .map(Document::from_json)
                .transpose()
                .map_err(StoreError::decode)?;
            results.push(ChangeEvent {
                seq: parse_seq(&row.seq)?,
                id: row.id,
                deleted: row.deleted,
                document,
            });
        }
        Ok(ChangesBatch {
            results,
            last_seq: parse_seq(&body.last_seq)?,
            resume: opaque_seq(&body.last_seq),
        })
    }
}

/// Document URL relative to the server, as used in `Destination` headers
/// and stub URLs.
pub fn document_path(database: &str, id: &str) -> String {
    let mut url = match Url::parse("http://localhost/") {
        Ok(url) => url,
        Err(_) => return format!("/{database}/{id}"),
    };
    push_segments(&mut url, [database]);
    push_segments(&mut url, id_segments(id));
    url.path().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_parse_and_redact() {
        let creds: Credentials = "admin:s3cret:x".parse().expect("creds");
        assert_eq!(creds.username, "admin");
        assert_eq!(creds.password, "s3cret:x");
        assert!(!format!("{creds:?}").contains("s3cret"));
        assert!("nocolon".parse::<Credentials>().is_err());
    }

    #[test]
    fn parse_seq_accepts_both_generations() {
        assert_eq!(parse_seq(&serde_json::json!(42)).expect("number"), 42);
        assert_eq!(parse_seq(&serde_json::json!("17-g1AAAA")).expect("string"), 17);
        assert!(parse_seq(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn only_string_sequences_are_kept_for_resuming() {
        assert_eq!(opaque_seq(&serde_json::json!(42)), None);
        assert_eq!(
            opaque_seq(&serde_json::json!("17-g1AAAA")).as_deref(),
            Some("17-g1AAAA")
        );
    }

    #[test]
    fn document_path_escapes_ids() {
        assert_eq!(
            document_path("site", "_design/SP-staging"),
            "/site/_design/SP-staging"
        );
        assert_eq!(document_path("site", "a b"), "/site/a%20b");
    }
}
