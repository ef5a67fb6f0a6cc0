//! One invocation: build the resource, connect, reconcile

use declarative::{CancelToken, Clock, EngineSession, Error, Failure, Report, StepError, SystemClock};
use ontapkit::backend::http::HttpTransport;
use ontapkit::{ClusterInfo, Protocol, ProtocolRequirements, Session, Transport};
use serde::Serialize;
use std::sync::Arc;

use crate::config::{ConnectionParams, Params};
use crate::resource::AnyResource;

fn setup_failure(step: &str, error: impl Into<StepError>, warnings: Vec<String>) -> Failure {
    Failure {
        error: Error::step(step, error),
        changed: false,
        warnings,
        decision: None,
    }
}

/// Reconcile the resource described by `params` over `transport`
pub fn execute(
    params: &Params,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    cancel: &CancelToken,
) -> Result<Report, Failure> {
    let resource = AnyResource::build(params.kind, params.state, &params.attributes)
        .map_err(|e| setup_failure("parse parameters", e, Vec::new()))?;
    let identity = resource.identity();

    let mut session = Session::new(transport, params.feature_flags.clone())
        .with_clock(clock)
        .with_cancel(cancel.clone());
    if let Err(e) = session.connect(params.use_rest, &resource.requirements()) {
        let warnings = session.take_warnings();
        return Err(setup_failure("connect", e, warnings));
    }
    log::info!("{identity}: using {}", session.protocol());

    let outcome = resource.reconcile(&mut session, &params.apply_options());
    match &outcome {
        Ok(report) => log::info!("{identity}: {} (changed: {})", report.decision.action, report.changed),
        Err(failure) => log::error!("{identity}: {failure}"),
    }
    outcome
}

/// Reconcile against the cluster named in `params`
pub fn run(params: &Params, cancel: &CancelToken) -> Result<Report, Failure> {
    let transport = HttpTransport::new(&params.connection).map_err(|e| setup_failure("connect", e, Vec::new()))?;
    execute(params, Arc::new(transport), Arc::new(SystemClock), cancel)
}

/// What the probe found out about a cluster
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub host: String,
    pub protocol: Protocol,
    pub cluster: ClusterInfo,
    pub rest: bool,
    pub asa_r2: bool,
    pub ontap: bool,
    pub warnings: Vec<String>,
}

pub fn probe(params: &ConnectionParams, transport: Arc<dyn Transport>) -> ontapkit::Result<ProbeReport> {
    let mut session = Session::new(transport, params.feature_flags.clone());
    let protocol = session.connect(params.use_rest, &ProtocolRequirements::new())?;
    let cluster = session
        .cluster()
        .cloned()
        .ok_or_else(|| ontapkit::Error::Other("probe returned no cluster information".into()))?;
    Ok(ProbeReport {
        host: params.connection.hostname.clone(),
        protocol,
        rest: cluster.is_rest_available(),
        asa_r2: cluster.is_asa_r2_system(),
        ontap: cluster.is_ontap_system(),
        cluster,
        warnings: session.take_warnings(),
    })
}

pub fn probe_cluster(params: &ConnectionParams) -> ontapkit::Result<ProbeReport> {
    let transport = HttpTransport::new(&params.connection)?;
    probe(params, Arc::new(transport))
}
