//! Core types for ONTAP connections and requests.

use crate::error::{Error, Result};
use declarative::Completion;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

/// HTTP method of a REST request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read.
    Get,
    /// Create.
    Post,
    /// Modify.
    Patch,
    /// Delete.
    Delete,
}

impl Method {
    /// Whether the method writes to the cluster.
    #[must_use]
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

/// A REST request relative to `/api/`.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    /// HTTP method.
    pub method: Method,
    /// Path below `/api/`, e.g. `storage/volumes`.
    pub path: String,
    /// Query parameters, passed through in ONTAP filter syntax.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Value>,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
}

impl RestRequest {
    /// Create a request.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
        }
    }

    /// A GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// A GET of an href returned by ONTAP, e.g. `/api/storage/volumes?start.uuid=u1`.
    pub fn from_href(href: &str) -> Self {
        let (path, query) = href.split_once('?').unwrap_or((href, ""));
        let path = path.trim_start_matches('/');
        let mut request = Self::get(path.strip_prefix("api/").unwrap_or(path));
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            request = request.query(decode(key), decode(value));
        }
        request
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add several query parameters.
    pub fn queries<'a>(mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        self.query
            .extend(pairs.into_iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    /// Set the JSON body.
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Look up a query parameter.
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Structured REST error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestError {
    /// ONTAP error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Error message.
    #[serde(default)]
    pub message: String,
    /// Field the error refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// The `(status, body, error)` triple returned for every REST call.
#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed JSON body, if any.
    pub body: Option<Value>,
    /// Structured error, for non-2xx responses.
    pub error: Option<RestError>,
}

impl RestResponse {
    /// Build a response from status and raw body text.
    pub fn from_text(status: u16, text: &str) -> Self {
        let body = if text.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<Value>(text).ok()
        };
        let error = if (200..300).contains(&status) {
            None
        } else {
            Some(
                body.as_ref()
                    .and_then(|b| b.get("error"))
                    .and_then(|e| serde_json::from_value::<RestError>(e.clone()).ok())
                    .unwrap_or_else(|| RestError {
                        code: None,
                        message: if text.trim().is_empty() {
                            format!("HTTP {status}")
                        } else {
                            text.trim().to_string()
                        },
                        target: None,
                    }),
            )
        };
        Self { status, body, error }
    }

    /// A 200 response with a JSON body.
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body: Some(body),
            error: None,
        }
    }

    /// A 200 response listing `records`.
    pub fn records(records: Vec<Value>) -> Self {
        let count = records.len();
        Self::ok(serde_json::json!({ "records": records, "num_records": count }))
    }

    /// A 202 response carrying a job.
    pub fn job(uuid: &str) -> Self {
        Self {
            status: 202,
            body: Some(serde_json::json!({
                "job": {
                    "uuid": uuid,
                    "_links": { "self": { "href": format!("/api/cluster/jobs/{uuid}") } }
                }
            })),
            error: None,
        }
    }

    /// An error response.
    pub fn error(status: u16, code: &str, message: &str) -> Self {
        Self {
            status,
            body: Some(serde_json::json!({ "error": { "code": code, "message": message } })),
            error: Some(RestError {
                code: Some(code.to_string()),
                message: message.to_string(),
                target: None,
            }),
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.error.is_none()
    }

    /// Turn a failed response into an [`Error`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let err = self.error.unwrap_or_else(|| RestError {
            code: None,
            message: format!("HTTP {}", self.status),
            target: None,
        });
        Err(Error::rest(self.status, err.code, err.message, err.target))
    }

    /// The job carried by a 202 response.
    #[must_use]
    pub fn job_handle(&self) -> Option<declarative::JobHandle> {
        let job = self.body.as_ref()?.get("job")?;
        let uuid = job.get("uuid")?.as_str()?;
        let handle = declarative::JobHandle::new(uuid);
        Some(
            match job.pointer("/_links/self/href").and_then(Value::as_str) {
                Some(href) => handle.with_link(href),
                None => handle,
            },
        )
    }

    /// The `_links.next` href of a paged collection response.
    #[must_use]
    pub fn next_link(&self) -> Option<&str> {
        self.body
            .as_ref()?
            .pointer("/_links/next/href")
            .and_then(Value::as_str)
            .filter(|href| !href.is_empty())
    }

    /// Records of a collection response.
    #[must_use]
    pub fn record_list(&self) -> Vec<Value> {
        self.body
            .as_ref()
            .and_then(|b| b.get("records"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

/// Wire protocol used for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// JSON over HTTPS.
    Rest,
    /// Legacy XML API.
    Zapi,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rest => write!(f, "REST"),
            Self::Zapi => write!(f, "ZAPI"),
        }
    }
}

/// User preference for the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UseRest {
    /// REST only; reject the run if REST cannot serve it.
    Always,
    /// ZAPI only.
    Never,
    /// REST when possible, ZAPI otherwise.
    #[default]
    Auto,
}

fn decode(text: &str) -> String {
    urlencoding::decode(text).map_or_else(|_| text.to_string(), std::borrow::Cow::into_owned)
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    5
}

/// Connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Cluster or SVM management address.
    pub hostname: String,
    /// Basic auth user.
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Client certificate (PEM).
    #[serde(default)]
    pub cert_filepath: Option<PathBuf>,
    /// Client private key (PEM).
    #[serde(default)]
    pub key_filepath: Option<PathBuf>,
    /// Use HTTPS for ZAPI. REST is always HTTPS.
    #[serde(default)]
    pub https: bool,
    /// Verify the cluster certificate.
    #[serde(default = "default_true")]
    pub validate_certs: bool,
    /// Override the port.
    #[serde(default)]
    pub http_port: Option<u16>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub connection_timeout: u64,
    /// HTTP proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,
}

impl ConnectionConfig {
    /// Minimal config for `hostname` with basic auth.
    pub fn new(hostname: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: Some(username.into()),
            password: Some(password.into()),
            cert_filepath: None,
            key_filepath: None,
            https: false,
            validate_certs: true,
            http_port: None,
            connection_timeout: default_timeout(),
            proxy: None,
        }
    }

    /// Check the parameters are usable.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(Error::Config("hostname is required".into()));
        }
        if self.key_filepath.is_some() && self.cert_filepath.is_none() {
            return Err(Error::Config("key_filepath requires cert_filepath".into()));
        }
        let has_basic = self.username.is_some() && self.password.is_some();
        if !has_basic && self.cert_filepath.is_none() {
            return Err(Error::Config(
                "username and password, or cert_filepath, are required".into(),
            ));
        }
        if self.username.is_some() != self.password.is_some() && self.cert_filepath.is_none() {
            return Err(Error::Config("username and password must be set together".into()));
        }
        Ok(())
    }

    /// Whether a client certificate is used instead of basic auth.
    #[must_use]
    pub fn uses_cert_auth(&self) -> bool {
        self.cert_filepath.is_some() && self.username.is_none()
    }

    /// Port for the given protocol.
    #[must_use]
    pub fn port(&self, protocol: Protocol) -> u16 {
        self.http_port.unwrap_or(match protocol {
            Protocol::Rest => 443,
            Protocol::Zapi if self.https => 443,
            Protocol::Zapi => 80,
        })
    }

    /// URL scheme for the given protocol.
    #[must_use]
    pub fn scheme(&self, protocol: Protocol) -> &'static str {
        match protocol {
            Protocol::Rest => "https",
            Protocol::Zapi if self.https => "https",
            Protocol::Zapi => "http",
        }
    }

    /// `host:port` authority, bracketing IPv6 literals.
    #[must_use]
    pub fn authority(&self, protocol: Protocol) -> String {
        let host = self.hostname.trim();
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        format!("{host}:{}", self.port(protocol))
    }
}

/// Engine-tunable toggles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Log every request and response at trace level.
    #[serde(default)]
    pub trace_apis: bool,
    /// Treat a job that stays missing until the timeout as successful, with a warning.
    #[serde(default = "default_true")]
    pub ignore_job_404: bool,
    /// Report a job timeout as a warning instead of a failure.
    #[serde(default)]
    pub job_timeout_is_warning: bool,
    /// Seconds between job polls.
    #[serde(default = "default_poll_interval")]
    pub job_poll_interval: u64,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            trace_apis: false,
            ignore_job_404: true,
            job_timeout_is_warning: false,
            job_poll_interval: default_poll_interval(),
        }
    }
}

/// Per-resource policy for idempotent error codes.
///
/// Some resources treat "already exists" on create as success because the
/// cluster already matches; others must fail because the existing object
/// was not the one the run fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Idempotency {
    /// Fold a conflict on create into success.
    pub create_conflict_is_success: bool,
    /// Fold a missing object on delete into success.
    pub delete_missing_is_success: bool,
}

impl Idempotency {
    /// Conflicts on create fail; missing objects on delete succeed.
    pub const STRICT_CREATE: Self = Self {
        create_conflict_is_success: false,
        delete_missing_is_success: true,
    };

    /// Both cases are folded into success.
    pub const LENIENT: Self = Self {
        create_conflict_is_success: true,
        delete_missing_is_success: true,
    };

    /// Apply the create policy to a result.
    pub fn on_create(&self, result: Result<Completion>) -> Result<Completion> {
        match result {
            Err(e) if self.create_conflict_is_success && e.is_conflict() => {
                log::debug!("Treating conflict as converged: {e}");
                Ok(Completion::AlreadyConverged)
            }
            other => other,
        }
    }

    /// Apply the delete policy to a result.
    pub fn on_delete(&self, result: Result<Completion>) -> Result<Completion> {
        match result {
            Err(e) if self.delete_missing_is_success && e.is_not_found() => {
                log::debug!("Treating missing object as deleted: {e}");
                Ok(Completion::AlreadyConverged)
            }
            other => other,
        }
    }
}

impl Default for Idempotency {
    fn default() -> Self {
        Self::STRICT_CREATE
    }
}
