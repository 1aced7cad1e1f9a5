//! Request executor
//!
//! Every call made to an uplink goes through [`RequestExecutor`]: it fills in
//! default and loop-prevention headers, encodes JSON bodies, issues the call
//! and reports the transport outcome to the uplink's [`HealthTracker`] before
//! the caller sees the result.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use reqwest::header::{
    ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT, VIA,
};
use reqwest::{Body, Client, Method, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::UplinkError;
use crate::health::HealthTracker;

/// Product token appended to `Via` headers
pub const VIA_PRODUCT: &str = "npm-relay";

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Where a request is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Path segments appended to the uplink base URL, each percent-encoded
    Path(Vec<String>),
    /// A complete URL, used as is
    Absolute(String),
}

impl Target {
    pub fn path<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Target::Path(segments.into_iter().map(Into::into).collect())
    }
}

/// How a non-JSON response body is handed back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseEncoding {
    /// Decoded as UTF-8 text
    #[default]
    Text,
    /// Raw bytes, untouched
    Binary,
}

/// The inbound client request an uplink call is made on behalf of
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Inbound `Via` chain
    pub via: Option<String>,
    /// Inbound `X-Forwarded-For` chain
    pub forwarded_for: Option<String>,
    /// Address of the immediate peer
    pub remote_addr: Option<IpAddr>,
}

impl RequestContext {
    /// Capture the loop-prevention headers of an inbound request
    pub fn from_headers(headers: &HeaderMap, remote_addr: Option<IpAddr>) -> Self {
        let get = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            via: get(&VIA),
            forwarded_for: get(&X_FORWARDED_FOR),
            remote_addr,
        }
    }

    fn via_chain(&self, own: &str) -> String {
        match &self.via {
            Some(via) => format!("{}, {}", via, own),
            None => own.to_string(),
        }
    }

    fn forwarded_for_chain(&self) -> Option<String> {
        let peer = self.remote_addr?;
        Some(match &self.forwarded_for {
            Some(chain) => format!("{}, {}", chain, peer),
            None => peer.to_string(),
        })
    }
}

/// A single call to make against an uplink
#[derive(Debug)]
pub struct UplinkRequest {
    pub method: Method,
    pub target: Target,
    pub headers: HeaderMap,
    /// Document sent as the JSON request body
    pub json: Option<Value>,
    /// Parse a successful response body as JSON
    pub expect_json: bool,
    pub encoding: ResponseEncoding,
    pub context: Option<RequestContext>,
    body: Option<Body>,
}

impl UplinkRequest {
    pub fn new(method: Method, target: Target) -> Self {
        Self {
            method,
            target,
            headers: HeaderMap::new(),
            json: None,
            expect_json: false,
            encoding: ResponseEncoding::default(),
            context: None,
            body: None,
        }
    }

    pub fn get(target: Target) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn put(target: Target) -> Self {
        Self::new(Method::PUT, target)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json(mut self, document: Value) -> Self {
        self.json = Some(document);
        self
    }

    pub fn expect_json(mut self) -> Self {
        self.expect_json = true;
        self
    }

    pub fn encoding(mut self, encoding: ResponseEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn context(mut self, context: Option<RequestContext>) -> Self {
        self.context = context;
        self
    }

    pub(crate) fn body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    fn wants_json(&self) -> bool {
        self.expect_json || self.json.is_some()
    }
}

/// Body of a completed call
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    Json(Value),
    Text(String),
    Binary(Bytes),
}

/// A completed, fully buffered call
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ReplyBody,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Marks a call as cancelled by its caller
///
/// Once set, the outcome of the call no longer touches uplink health.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag, returning true on the first call only
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A call that reached the transport, kept for its completion log record
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub method: Method,
    pub url: Url,
    pub bytes_in: u64,
}

impl Attempt {
    /// Emit the single record describing a finished attempt
    pub(crate) fn log(&self, status: Option<StatusCode>, bytes_out: u64, error: Option<&str>) {
        let status = status
            .map(|s| s.as_u16().to_string())
            .unwrap_or_else(|| "ERR".to_string());

        match error {
            Some(error) => warn!(
                method = %self.method,
                url = %self.url,
                status = %status,
                bytes_in = self.bytes_in,
                bytes_out,
                error,
                "{}, req: '{} {}', error: {}",
                status, self.method, self.url, error
            ),
            None => info!(
                method = %self.method,
                url = %self.url,
                status = %status,
                bytes_in = self.bytes_in,
                bytes_out,
                "{}, req: '{} {}', bytes: {}/{}",
                status, self.method, self.url, self.bytes_in, bytes_out
            ),
        }
    }
}

/// Issues calls against one uplink
#[derive(Clone)]
pub struct RequestExecutor {
    client: Client,
    base_url: Url,
    user_agent: HeaderValue,
    via: String,
    health: Arc<HealthTracker>,
}

impl RequestExecutor {
    pub(crate) fn new(
        client: Client,
        base_url: Url,
        user_agent: HeaderValue,
        server_id: &str,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            client,
            base_url,
            user_agent,
            via: format!("1.1 {} ({})", server_id, VIA_PRODUCT),
            health,
        }
    }

    /// Make a call and buffer its response
    ///
    /// Non-2xx responses are returned as replies; classifying them is up to
    /// the caller. A 2xx reply to a JSON call whose body cannot be parsed, or
    /// whose body carries an `error` field, fails.
    pub async fn execute(&self, request: UplinkRequest) -> Result<Reply, UplinkError> {
        let wants_json = request.wants_json();
        let encoding = request.encoding;

        let (attempt, response) = self.send(request, &AbortFlag::new()).await?;
        let status = response.status();
        let headers = response.headers().clone();

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.health.report_outcome(false);
                attempt.log(Some(status), 0, Some(&err.to_string()));
                return Err(UplinkError::Transport(err));
            }
        };
        let bytes_out = bytes.len() as u64;

        match decode_body(bytes, status, wants_json, encoding) {
            Ok(body) => {
                attempt.log(Some(status), bytes_out, None);
                Ok(Reply {
                    status,
                    headers,
                    body,
                })
            }
            Err(err) => {
                attempt.log(Some(status), bytes_out, Some(&err.to_string()));
                Err(err)
            }
        }
    }

    /// Issue a call and hand back the live response
    ///
    /// Health is updated here, before the caller sees the outcome, unless
    /// `abort` was set by then. Transport failures are logged here; callers
    /// log completed responses once the body is consumed.
    pub(crate) async fn send(
        &self,
        mut request: UplinkRequest,
        abort: &AbortFlag,
    ) -> Result<(Attempt, Response), UplinkError> {
        if !self.health.is_available() {
            return Err(UplinkError::Offline);
        }

        let url = self.resolve(&request.target)?;
        self.apply_default_headers(&mut request.headers, request.context.as_ref())?;

        let mut bytes_in = 0;
        let body = match request.json.take() {
            Some(document) => {
                let encoded = document.to_string().into_bytes();
                bytes_in = encoded.len() as u64;
                request
                    .headers
                    .entry(CONTENT_TYPE)
                    .or_insert(HeaderValue::from_static("application/json"));
                Some(Body::from(encoded))
            }
            None => request.body.take(),
        };

        debug!(
            method = %request.method,
            url = %url,
            headers = ?request.headers,
            "making request: '{} {}'",
            request.method,
            url
        );

        let attempt = Attempt {
            method: request.method.clone(),
            url: url.clone(),
            bytes_in,
        };

        let mut builder = self
            .client
            .request(request.method, url)
            .headers(request.headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        match builder.send().await {
            Ok(response) => {
                if !abort.is_set() {
                    self.health.report_outcome(true);
                }
                Ok((attempt, response))
            }
            Err(err) => {
                if abort.is_set() {
                    return Err(UplinkError::Transport(err));
                }
                self.health.report_outcome(false);
                attempt.log(None, 0, Some(&err.to_string()));
                Err(UplinkError::Transport(err))
            }
        }
    }

    pub(crate) fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Turn a target into the URL to call
    pub fn resolve(&self, target: &Target) -> Result<Url, UplinkError> {
        match target {
            Target::Path(segments) => {
                let mut url = self.base_url.clone();
                if let Ok(mut path) = url.path_segments_mut() {
                    path.pop_if_empty().extend(segments);
                }
                Ok(url)
            }
            Target::Absolute(raw) => Url::parse(raw).map_err(|source| UplinkError::InvalidUrl {
                url: raw.clone(),
                source,
            }),
        }
    }

    fn apply_default_headers(
        &self,
        headers: &mut HeaderMap,
        context: Option<&RequestContext>,
    ) -> Result<(), UplinkError> {
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("application/json"));
        headers
            .entry(USER_AGENT)
            .or_insert_with(|| self.user_agent.clone());

        let context = context.cloned().unwrap_or_default();
        headers.insert(VIA, HeaderValue::from_str(&context.via_chain(&self.via))?);
        if let Some(chain) = context.forwarded_for_chain() {
            headers.insert(X_FORWARDED_FOR.clone(), HeaderValue::from_str(&chain)?);
        }

        Ok(())
    }
}

fn decode_body(
    bytes: Bytes,
    status: StatusCode,
    wants_json: bool,
    encoding: ResponseEncoding,
) -> Result<ReplyBody, UplinkError> {
    if wants_json && status.is_success() {
        let document: Value = if bytes.iter().all(u8::is_ascii_whitespace) {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(&bytes)?
        };

        if let Some(message) = error_field(&document) {
            return Err(UplinkError::Upstream(message));
        }
        return Ok(ReplyBody::Json(document));
    }

    Ok(match encoding {
        ResponseEncoding::Binary => ReplyBody::Binary(bytes),
        ResponseEncoding::Text => ReplyBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
    })
}

/// The `error` member of a JSON object, when it holds a truthy value
fn error_field(document: &Value) -> Option<String> {
    let error = document.as_object()?.get("error")?;
    match error {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
