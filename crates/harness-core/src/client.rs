use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    },
}

/// One request issued by a simulated user. `name` is the label statistics are grouped by.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub name: String,
    pub body: Body,
}

impl Request {
    pub fn get(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Method::Get, path, name)
    }

    pub fn post(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Method::Post, path, name)
    }

    fn new(method: Method, path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            name: name.into(),
            body: Body::Empty,
        }
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn multipart(mut self, fields: Vec<(String, String)>, files: Vec<FilePart>) -> Self {
        self.body = Body::Multipart { fields, files };
        self
    }

    /// Whether the transport picks the content type itself for this body.
    fn sets_own_content_type(&self) -> bool {
        matches!(self.body, Body::Multipart { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: String,
    pub latency_ms: u64,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.body)
    }
}

/// Per-user request context: cookies and default headers applied to every request.
#[derive(Debug, Clone, Default)]
pub struct Session {
    cookies: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn cookie_count(&self) -> usize {
        self.cookies.len()
    }

    /// `Cookie` header value, or `None` when the session carries no cookies.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        Some(pairs.join("; "))
    }

    /// Default headers to send with `request`, leaving out the content type when
    /// the body encoding chooses its own.
    fn headers_for<'a>(&'a self, request: &'a Request) -> impl Iterator<Item = (&'a str, &'a str)> {
        let skip_content_type = request.sets_own_content_type();
        self.headers
            .iter()
            .filter(move |(k, _)| !(skip_content_type && k.as_str() == "content-type"))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

pub type ResponseFuture<'a> = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;

/// Transport seam for simulated users. Any HTTP status is an `Ok` response;
/// `Err` means the request never produced one.
pub trait HttpClient: Send + Sync {
    fn name(&self) -> &'static str;

    fn send<'a>(&'a self, session: &'a Session, request: &'a Request) -> ResponseFuture<'a>;
}

/// reqwest-backed client resolving request paths against the target base URL.
pub struct ReqwestClient {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestClient {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn build(&self, session: &Session, request: &Request) -> Result<reqwest::RequestBuilder> {
        let url = self.url(&request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };

        for (key, value) in session.headers_for(request) {
            builder = builder.header(key, value);
        }
        if let Some(cookies) = session.cookie_header() {
            builder = builder.header(reqwest::header::COOKIE, cookies);
        }

        builder = match &request.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(value),
            Body::Multipart { fields, files } => {
                let mut form = reqwest::multipart::Form::new();
                for (key, value) in fields {
                    form = form.text(key.clone(), value.clone());
                }
                for file in files {
                    let part = reqwest::multipart::Part::bytes(file.bytes.clone())
                        .file_name(file.file_name.clone())
                        .mime_str(&file.mime)
                        .with_context(|| format!("Invalid mime type: {}", file.mime))?;
                    form = form.part(file.field.clone(), part);
                }
                builder.multipart(form)
            }
        };

        Ok(builder)
    }
}

impl HttpClient for ReqwestClient {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send<'a>(&'a self, session: &'a Session, request: &'a Request) -> ResponseFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            let response = self.build(session, request)?.send().await?;
            let status = response.status().as_u16();
            // A body that fails mid-stream still counts as a response with this status.
            let body = response.text().await.unwrap_or_default();

            Ok(Response {
                status,
                body,
                latency_ms: start.elapsed().as_millis() as u64,
            })
        })
    }
}

#[derive(Debug, Clone)]
pub enum MockReply {
    Status { status: u16, body: String },
    TransportError(String),
}

impl MockReply {
    pub fn ok(body: impl Into<String>) -> Self {
        MockReply::Status {
            status: 200,
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        MockReply::Status {
            status,
            body: String::new(),
        }
    }
}

struct MockRoute {
    prefix: String,
    scripted: VecDeque<MockReply>,
    fallback: MockReply,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub cookie_header: Option<String>,
}

/// In-process client with scripted replies per path prefix. The longest matching
/// prefix wins; unmatched paths get an empty 200.
pub struct MockClient {
    delay_ms: u64,
    routes: Mutex<Vec<MockRoute>>,
    recorded: Mutex<Vec<RecordedRequest>>,
}

impl MockClient {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            routes: Mutex::new(Vec::new()),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Mock target serving small campaign and round listings, used by `--mode mock`.
    pub fn with_canned_listings(delay_ms: u64) -> Self {
        let campaigns = serde_json::json!({
            "campaigns": [
                {"id": 1, "slug": "clean-water-kenya"},
                {"id": 2, "slug": "school-garden-berlin"},
                {"id": 3, "slug": "solar-for-clinics"}
            ]
        });
        let rounds = serde_json::json!({"data": [{"id": 1}, {"id": 2}]});
        Self::new(delay_ms)
            .route("/api/campaigns?", MockReply::ok(campaigns.to_string()))
            .route("/api/rounds?page=1", MockReply::ok(rounds.to_string()))
    }

    /// Always answer requests under `prefix` with `reply`.
    pub fn route(self, prefix: impl Into<String>, reply: MockReply) -> Self {
        self.script(prefix, Vec::new(), reply)
    }

    /// Answer with `scripted` replies in order, then `fallback` for every later request.
    pub fn script(self, prefix: impl Into<String>, scripted: Vec<MockReply>, fallback: MockReply) -> Self {
        if let Ok(mut routes) = self.routes.lock() {
            routes.push(MockRoute {
                prefix: prefix.into(),
                scripted: scripted.into(),
                fallback,
            });
        }
        self
    }

    /// Number of recorded requests whose path starts with `prefix`.
    pub fn calls(&self, prefix: &str) -> usize {
        self.recorded()
            .iter()
            .filter(|r| r.path.starts_with(prefix))
            .count()
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.recorded
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn reply_for(&self, path: &str) -> MockReply {
        let Ok(mut routes) = self.routes.lock() else {
            return MockReply::ok("");
        };
        let route = routes
            .iter_mut()
            .filter(|r| path.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len());
        match route {
            Some(route) => route
                .scripted
                .pop_front()
                .unwrap_or_else(|| route.fallback.clone()),
            None => MockReply::ok(""),
        }
    }
}

impl HttpClient for MockClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn send<'a>(&'a self, session: &'a Session, request: &'a Request) -> ResponseFuture<'a> {
        Box::pin(async move {
            if let Ok(mut recorded) = self.recorded.lock() {
                recorded.push(RecordedRequest {
                    method: request.method,
                    path: request.path.clone(),
                    cookie_header: session.cookie_header(),
                });
            }
            let reply = self.reply_for(&request.path);

            sleep(Duration::from_millis(self.delay_ms)).await;

            match reply {
                MockReply::Status { status, body } => Ok(Response {
                    status,
                    body,
                    latency_ms: self.delay_ms,
                }),
                MockReply::TransportError(message) => anyhow::bail!(message),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_header() {
        let mut session = Session::new();
        assert_eq!(session.cookie_header(), None);

        session.set_cookie("session", "abc123");
        session.set_cookie("csrf", "xyz");
        assert_eq!(
            session.cookie_header().as_deref(),
            Some("csrf=xyz; session=abc123")
        );
    }

    #[test]
    fn test_multipart_skips_json_content_type() {
        let mut session = Session::new();
        session.set_header("Content-Type", "application/json");
        session.set_header("Accept", "*/*");

        let json = Request::post("/api/pledges/register", "pledge").json(serde_json::json!({}));
        assert_eq!(session.headers_for(&json).count(), 2);

        let multipart = Request::post("/api/campaigns", "create").multipart(Vec::new(), Vec::new());
        let headers: Vec<_> = session.headers_for(&multipart).collect();
        assert_eq!(headers, vec![("accept", "*/*")]);
    }

    #[test]
    fn test_reqwest_client_joins_base_url() {
        let client = ReqwestClient::new("http://localhost:3000/", 1000).unwrap();
        assert_eq!(client.url("/api/rounds"), "http://localhost:3000/api/rounds");
    }

    #[test]
    fn test_json_request_keeps_session_headers() {
        let client = ReqwestClient::new("http://localhost:3000", 1000).unwrap();
        let mut session = Session::new();
        session.set_cookie("session", "abc123");
        session.set_header("Content-Type", "application/json");

        let request = Request::post("/api/pledges/register", "pledge")
            .json(serde_json::json!({"pledgeId": "0x01"}));
        let built = client.build(&session, &request).unwrap().build().unwrap();

        assert_eq!(built.url().as_str(), "http://localhost:3000/api/pledges/register");
        assert_eq!(built.headers()[reqwest::header::CONTENT_TYPE], "application/json");
        assert_eq!(built.headers()[reqwest::header::COOKIE], "session=abc123");
        assert!(!request.sets_own_content_type());
    }

    #[tokio::test]
    async fn test_mock_client_scripted_replies() {
        let client = MockClient::new(0).script(
            "/api/rounds",
            vec![MockReply::status(500)],
            MockReply::ok("[]"),
        );
        let session = Session::new();
        let request = Request::get("/api/rounds?page=1", "rounds");

        let first = client.send(&session, &request).await.unwrap();
        let second = client.send(&session, &request).await.unwrap();
        assert_eq!(first.status, 500);
        assert_eq!(second.status, 200);
        assert_eq!(client.calls("/api/rounds"), 2);

        let other = client.send(&session, &Request::get("/", "home")).await.unwrap();
        assert!(other.is_success());
    }

    #[tokio::test]
    async fn test_mock_client_transport_error() {
        let client = MockClient::new(0).route("/", MockReply::TransportError("refused".into()));
        let result = client.send(&Session::new(), &Request::get("/", "home")).await;
        assert!(result.is_err());
    }
}
