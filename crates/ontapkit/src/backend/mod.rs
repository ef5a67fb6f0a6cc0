//! Transport trait and implementations.
//!
//! This module provides the [`Transport`] trait, the blocking HTTP
//! implementation in [`http::HttpTransport`], and [`MockTransport`] for
//! testing without a cluster.
//!
//! # Testing
//!
//! ```
//! use ontapkit::backend::{MockTransport, Transport};
//! use ontapkit::{RestRequest, RestResponse};
//! use serde_json::json;
//!
//! let mock = MockTransport::new();
//! mock.on_rest_get("storage/volumes", RestResponse::records(vec![json!({"name": "vol1"})]));
//!
//! let response = mock.send_rest(&RestRequest::get("storage/volumes")).unwrap();
//! assert_eq!(response.record_list().len(), 1);
//! assert_eq!(mock.calls().len(), 1);
//! ```

pub mod http;

use crate::error::{Error, Result};
use crate::types::{Method, RestRequest, RestResponse};
use crate::zapi::{ZapiElement, ZapiResponse};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Issues requests against one cluster.
///
/// Both operations return protocol-level failures inside the response and
/// reserve `Err` for connection-level failures ([`Error::Unreachable`]).
pub trait Transport: Send + Sync {
    /// Send a REST request.
    fn send_rest(&self, request: &RestRequest) -> Result<RestResponse>;

    /// Send a ZAPI request, tunnelled to `vserver` when given.
    fn send_zapi(&self, vserver: Option<&str>, request: &ZapiElement) -> Result<ZapiResponse>;

    /// Host name used in error messages.
    fn host(&self) -> &str;
}

/// One request observed by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// A REST request.
    Rest(RestRequest),
    /// A ZAPI request.
    Zapi {
        /// Tunnelled vserver.
        vserver: Option<String>,
        /// The request tree.
        request: ZapiElement,
    },
}

impl Call {
    /// Whether the call is write-shaped.
    ///
    /// REST writes are POST, PATCH and DELETE. ZAPI calls are writes unless
    /// the API name ends in `-get`, `-get-iter` or `-get-version`.
    #[must_use]
    pub fn is_write(&self) -> bool {
        match self {
            Self::Rest(request) => request.method.is_write(),
            Self::Zapi { request, .. } => !is_read_api(&request.name),
        }
    }

    /// `METHOD path` for REST, the API name for ZAPI.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Rest(request) => format!("{} {}", request.method, request.path),
            Self::Zapi { request, .. } => request.name.clone(),
        }
    }
}

fn is_read_api(api: &str) -> bool {
    api.ends_with("-get") || api.ends_with("-get-iter") || api.ends_with("-get-version")
}

#[derive(Debug, Clone)]
enum Reply<T> {
    Response(T),
    Unreachable(String),
}

#[derive(Debug, Default)]
struct MockState {
    rest: HashMap<(Method, String), VecDeque<Reply<RestResponse>>>,
    zapi: HashMap<String, VecDeque<Reply<ZapiResponse>>>,
    calls: Vec<Call>,
}

/// Scripted transport for tests.
///
/// Responses are queued per `(method, path)` for REST and per API name for
/// ZAPI. Each queue hands out its entries in order and then keeps repeating
/// the last one. Unscripted REST reads return an empty collection and
/// unscripted writes return `200`; unscripted ZAPI calls pass with no
/// records. Clones share state, so a test can keep a handle after passing
/// the transport to a session.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a new empty mock transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a REST response.
    pub fn on_rest(&self, method: Method, path: &str, response: RestResponse) -> &Self {
        self.lock()
            .rest
            .entry((method, path.to_string()))
            .or_default()
            .push_back(Reply::Response(response));
        self
    }

    /// Queue a REST GET response.
    pub fn on_rest_get(&self, path: &str, response: RestResponse) -> &Self {
        self.on_rest(Method::Get, path, response)
    }

    /// Queue a connection failure for a REST request.
    pub fn rest_unreachable(&self, method: Method, path: &str, message: &str) -> &Self {
        self.lock()
            .rest
            .entry((method, path.to_string()))
            .or_default()
            .push_back(Reply::Unreachable(message.to_string()));
        self
    }

    /// Queue a ZAPI response.
    pub fn on_zapi(&self, api: &str, response: ZapiResponse) -> &Self {
        self.lock()
            .zapi
            .entry(api.to_string())
            .or_default()
            .push_back(Reply::Response(response));
        self
    }

    /// Queue a ZAPI failure.
    pub fn on_zapi_error(&self, api: &str, code: &str, reason: &str) -> &Self {
        self.on_zapi(api, ZapiResponse::failed(code, reason))
    }

    /// Script the version probe for both protocols.
    pub fn with_cluster_version(self, generation: u16, major: u16, minor: u16) -> Self {
        self.on_rest_get(
            "cluster",
            RestResponse::ok(json!({
                "version": {
                    "full": format!("NetApp Release {generation}.{major}.{minor}: Mon Jan 01 00:00:00 UTC 2024"),
                    "generation": generation,
                    "major": major,
                    "minor": minor,
                },
                "san_optimized": false,
                "disaggregated": false,
            })),
        );
        self.on_zapi(
            "system-get-version",
            ZapiResponse::passed(vec![
                ZapiElement::leaf(
                    "version",
                    format!("NetApp Release {generation}.{major}.{minor}: Mon Jan 01 00:00:00 UTC 2024"),
                ),
                ZapiElement::new("version-tuple").child(
                    ZapiElement::new("system-version-tuple")
                        .child_text("generation", generation)
                        .child_text("major", major)
                        .child_text("minor", minor),
                ),
            ]),
        );
        self
    }

    /// Script a cluster that only speaks ZAPI.
    pub fn zapi_only(self, generation: u16, major: u16, minor: u16) -> Self {
        let this = self.with_cluster_version(generation, major, minor);
        this.lock().rest.remove(&(Method::Get, "cluster".to_string()));
        this.on_rest_get("cluster", RestResponse::error(404, "", "Not Found"));
        this
    }

    /// Every request observed so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Write-shaped requests observed so far.
    #[must_use]
    pub fn writes(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_write).collect()
    }

    /// Labels of the write-shaped requests observed so far.
    #[must_use]
    pub fn write_labels(&self) -> Vec<String> {
        self.writes().iter().map(Call::label).collect()
    }

    /// Number of REST requests to `path` with `method`.
    #[must_use]
    pub fn count_rest(&self, method: Method, path: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Rest(r) if r.method == method && r.path == path))
            .count()
    }

    /// Number of ZAPI requests for `api`.
    #[must_use]
    pub fn count_zapi(&self, api: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Zapi { request, .. } if request.name == api))
            .count()
    }

    /// Forget recorded calls, keeping the script.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

fn next_reply<T: Clone>(queue: Option<&mut VecDeque<Reply<T>>>) -> Option<Reply<T>> {
    let queue = queue?;
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl Transport for MockTransport {
    fn send_rest(&self, request: &RestRequest) -> Result<RestResponse> {
        let mut state = self.lock();
        state.calls.push(Call::Rest(request.clone()));
        let key = (request.method, request.path.clone());
        match next_reply(state.rest.get_mut(&key)) {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Unreachable(message)) => Err(Error::unreachable("mock", message)),
            None if request.method == Method::Get => Ok(RestResponse::records(Vec::new())),
            None => Ok(RestResponse::ok(json!({}))),
        }
    }

    fn send_zapi(&self, vserver: Option<&str>, request: &ZapiElement) -> Result<ZapiResponse> {
        let mut state = self.lock();
        state.calls.push(Call::Zapi {
            vserver: vserver.map(str::to_string),
            request: request.clone(),
        });
        match next_reply(state.zapi.get_mut(&request.name)) {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Unreachable(message)) => Err(Error::unreachable("mock", message)),
            None if request.name.ends_with("-get-iter") => Ok(ZapiResponse::records(Vec::new())),
            None => Ok(ZapiResponse::passed(Vec::new())),
        }
    }

    fn host(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_then_sticky() {
        let mock = MockTransport::new();
        mock.on_rest_get("cluster/jobs/j1", RestResponse::ok(json!({"state": "running"})))
            .on_rest_get("cluster/jobs/j1", RestResponse::ok(json!({"state": "success"})));

        let request = RestRequest::get("cluster/jobs/j1");
        let states: Vec<_> = (0..3)
            .map(|_| mock.send_rest(&request).unwrap().body.unwrap()["state"].clone())
            .collect();
        assert_eq!(states, vec!["running", "success", "success"]);
        assert_eq!(mock.count_rest(Method::Get, "cluster/jobs/j1"), 3);
    }

    #[test]
    fn test_unscripted_defaults() {
        let mock = MockTransport::new();
        let response = mock.send_rest(&RestRequest::get("storage/volumes")).unwrap();
        assert!(response.record_list().is_empty());

        let response = mock
            .send_zapi(None, &ZapiElement::new("volume-get-iter"))
            .unwrap();
        assert_eq!(response.results.text("num-records"), Some("0"));
    }

    #[test]
    fn test_writes_classification() {
        let mock = MockTransport::new();
        mock.send_rest(&RestRequest::get("a")).unwrap();
        mock.send_rest(&RestRequest::new(Method::Post, "a")).unwrap();
        mock.send_zapi(Some("vs1"), &ZapiElement::new("igroup-get-iter")).unwrap();
        mock.send_zapi(Some("vs1"), &ZapiElement::new("igroup-create")).unwrap();
        mock.send_zapi(None, &ZapiElement::new("system-get-version")).unwrap();

        assert_eq!(mock.write_labels(), vec!["POST a", "igroup-create"]);
        assert_eq!(mock.calls().len(), 5);
    }

    #[test]
    fn test_unreachable_reply() {
        let mock = MockTransport::new();
        mock.rest_unreachable(Method::Get, "cluster", "connection refused");
        let err = mock.send_rest(&RestRequest::get("cluster")).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_clones_share_state() {
        let mock = MockTransport::new().with_cluster_version(9, 12, 1);
        let handle = mock.clone();
        mock.send_rest(&RestRequest::get("cluster")).unwrap();
        assert_eq!(handle.calls().len(), 1);
        handle.clear_calls();
        assert!(mock.calls().is_empty());
    }
}
