//! Connection session for one run.
//!
//! A [`Session`] owns the transport, caches the cluster probe, remembers the
//! protocol chosen for the run and collects warnings. Resources issue all of
//! their calls through it, and the reconcile loop uses it to wait on jobs.

use crate::backend::Transport;
use crate::error::{Error, Result};
use crate::job::{
    REST_JOB_FIELDS, WaitConfig, rest_job_path, rest_job_status, wait_for_job, zapi_job_request, zapi_job_status,
};
use crate::selector::{self, ProtocolRequirements};
use crate::types::{FeatureFlags, Method, Protocol, RestRequest, RestResponse, UseRest};
use crate::version::{self, ClusterInfo};
use crate::zapi::{ZapiElement, get_iter, iter_records};
use declarative::{CancelToken, Clock, Completion, EngineSession, JobHandle, JobOutcome, SystemClock};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Records requested per `*-get-iter` page.
const ZAPI_PAGE_SIZE: u32 = 100;

/// Connection state shared by the calls of one run.
pub struct Session {
    transport: Arc<dyn Transport>,
    flags: FeatureFlags,
    cluster: Option<ClusterInfo>,
    protocol: Protocol,
    warnings: Vec<String>,
    cancel: CancelToken,
    clock: Arc<dyn Clock>,
    wait: WaitConfig,
}

impl Session {
    /// Create a session over `transport`.
    pub fn new(transport: Arc<dyn Transport>, flags: FeatureFlags) -> Self {
        let wait = WaitConfig::from_flags(&flags);
        Self {
            transport,
            flags,
            cluster: None,
            protocol: Protocol::Rest,
            warnings: Vec::new(),
            cancel: CancelToken::new(),
            clock: Arc::new(SystemClock),
            wait,
        }
    }

    /// Use `clock` for job polling.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share `cancel` with other runs.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the job polling behaviour.
    #[must_use]
    pub fn with_wait_config(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    /// Probe the cluster (once) and choose the protocol for the run.
    pub fn connect(&mut self, preference: UseRest, requirements: &ProtocolRequirements) -> Result<Protocol> {
        selector::preflight(preference, requirements)?;
        let cluster = match &self.cluster {
            Some(cluster) => cluster.clone(),
            None => {
                let cluster = version::probe(self.transport.as_ref(), preference)?;
                self.cluster = Some(cluster.clone());
                cluster
            }
        };
        let selection = selector::select(preference, requirements, &cluster)?;
        log::debug!(
            "Using {} against {} (ONTAP {})",
            selection.protocol,
            self.transport.host(),
            cluster.version
        );
        self.protocol = selection.protocol;
        self.warnings.extend(selection.warnings);
        Ok(self.protocol)
    }

    /// Protocol chosen by [`connect`](Self::connect).
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether calls go over REST.
    #[must_use]
    pub fn use_rest(&self) -> bool {
        self.protocol == Protocol::Rest
    }

    /// Probe result, once connected.
    #[must_use]
    pub fn cluster(&self) -> Option<&ClusterInfo> {
        self.cluster.as_ref()
    }

    /// Feature flags of the run.
    #[must_use]
    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    /// Warnings recorded so far.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn trace(&self, line: impl FnOnce() -> String) {
        if self.flags.trace_apis {
            log::debug!("{}", line());
        } else if log::log_enabled!(log::Level::Trace) {
            log::trace!("{}", line());
        }
    }

    /// Send a REST request and fail on non-2xx responses.
    pub fn rest(&mut self, request: &RestRequest) -> Result<RestResponse> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.trace(|| match &request.body {
            Some(body) => format!("{} {} {:?} {body}", request.method, request.path, request.query),
            None => format!("{} {} {:?}", request.method, request.path, request.query),
        });
        let response = self.transport.send_rest(request)?;
        self.trace(|| {
            format!(
                "-> {} {}",
                response.status,
                response.body.as_ref().map(Value::to_string).unwrap_or_default()
            )
        });
        response.into_result()
    }

    /// Records of a collection GET, following `_links.next` across pages.
    pub fn rest_get_records(&mut self, path: &str, query: &[(&str, &str)]) -> Result<Vec<Value>> {
        let mut request = RestRequest::get(path).queries(query.iter().copied());
        let mut records = Vec::new();
        loop {
            let response = self.rest(&request)?;
            records.extend(response.record_list());
            match response.next_link() {
                Some(href) => {
                    let next = RestRequest::from_href(href);
                    if next == request {
                        break;
                    }
                    request = next;
                }
                None => break,
            }
        }
        Ok(records)
    }

    /// The single record matching a collection GET, if any.
    pub fn rest_get_one(&mut self, path: &str, query: &[(&str, &str)]) -> Result<Option<Value>> {
        let mut records = self.rest_get_records(path, query)?;
        match records.len() {
            0 => Ok(None),
            1 => Ok(records.pop()),
            n => Err(Error::InvalidResponse(format!("expected at most one record from {path}, got {n}"))),
        }
    }

    /// POST `body` to `path`.
    pub fn rest_post(&mut self, path: &str, body: Value) -> Result<Completion> {
        let response = self.rest(&RestRequest::new(Method::Post, path).body(body))?;
        Ok(completion(&response))
    }

    /// PATCH `body` onto `path`.
    pub fn rest_patch(&mut self, path: &str, body: Value) -> Result<Completion> {
        let response = self.rest(&RestRequest::new(Method::Patch, path).body(body))?;
        Ok(completion(&response))
    }

    /// DELETE `path`.
    pub fn rest_delete(&mut self, path: &str) -> Result<Completion> {
        let response = self.rest(&RestRequest::new(Method::Delete, path))?;
        Ok(completion(&response))
    }

    /// Send a ZAPI request and return its `<results>`.
    pub fn zapi(&mut self, vserver: Option<&str>, request: &ZapiElement) -> Result<ZapiElement> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.trace(|| format!("ZAPI {} {}", vserver.unwrap_or("-"), request.to_xml()));
        let response = self.transport.send_zapi(vserver, request)?;
        self.trace(|| format!("-> {}", response.results.to_xml()));
        response.into_result(&request.name)
    }

    /// Records of a `*-get-iter` call filtered by `query`, following `next-tag` across pages.
    pub fn zapi_get_iter(&mut self, vserver: Option<&str>, api: &str, query: ZapiElement) -> Result<Vec<ZapiElement>> {
        let mut records = Vec::new();
        let mut tag: Option<String> = None;
        loop {
            let request = get_iter(api, query.clone())
                .child_text("max-records", ZAPI_PAGE_SIZE)
                .child_opt("tag", tag.as_deref());
            let results = self.zapi(vserver, &request)?;
            records.extend(iter_records(&results));
            match results.text("next-tag").filter(|next| !next.is_empty()) {
                Some(next) if tag.as_deref() != Some(next) => tag = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(records)
    }

    /// Send a ZAPI write; a returned `result-jobid` becomes a pending job.
    pub fn zapi_write(&mut self, vserver: Option<&str>, request: &ZapiElement) -> Result<Completion> {
        let results = self.zapi(vserver, request)?;
        Ok(match results.text("result-jobid") {
            Some(id) if results.text("result-status") != Some("succeeded") => {
                Completion::Pending(JobHandle::new(id))
            }
            _ => Completion::Done,
        })
    }
}

fn completion(response: &RestResponse) -> Completion {
    match response.job_handle() {
        Some(job) if response.status == 202 => Completion::Pending(job),
        _ => Completion::Done,
    }
}

impl EngineSession for Session {
    type Error = Error;

    fn warn(&mut self, message: String) {
        log::warn!("{message}");
        self.warnings.push(message);
    }

    fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn await_job(&mut self, job: &JobHandle, timeout: Duration) -> Result<JobOutcome> {
        let transport = Arc::clone(&self.transport);
        let rest = job.link.is_some() || self.use_rest();
        log::debug!("Waiting up to {}s for job {}", timeout.as_secs(), job.id);

        wait_for_job(&self.wait, self.clock.as_ref(), &self.cancel, job, timeout, |job| {
            if rest {
                let request = RestRequest::get(rest_job_path(job)).query("fields", REST_JOB_FIELDS);
                rest_job_status(transport.send_rest(&request)?)
            } else {
                zapi_job_status(transport.send_zapi(None, &zapi_job_request(job))?)
            }
        })
    }
}
