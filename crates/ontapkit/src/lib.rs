//! # ontapkit
//!
//! Client plumbing for NetApp ONTAP clusters over REST and the legacy
//! XML API (ZAPI).
//!
//! This crate provides:
//! - A [`Transport`](backend::Transport) with a blocking HTTP implementation
//!   and a scripted mock
//! - A version and capability probe
//! - Protocol selection with REST-to-ZAPI fallback
//! - A job waiter driven by an abstract clock and a cancellation token
//! - A [`Session`] implementing the reconcile engine's session contract
//!
//! ## Example
//!
//! ```no_run
//! use ontapkit::{ConnectionConfig, FeatureFlags, ProtocolRequirements, UseRest};
//!
//! let config = ConnectionConfig::new("cluster1.example.com", "admin", "secret");
//! let mut session = ontapkit::open(&config, FeatureFlags::default()).unwrap();
//! let protocol = session.connect(UseRest::Auto, &ProtocolRequirements::new()).unwrap();
//! println!("Talking {protocol} to ONTAP {}", session.cluster().unwrap().version);
//!
//! let volumes = session.rest_get_records("storage/volumes", &[("svm.name", "vs1")]).unwrap();
//! println!("{} volumes", volumes.len());
//! ```
//!
//! ## Testing
//!
//! [`MockTransport`] replays scripted responses and records every call, so
//! resources can be exercised without a cluster:
//!
//! ```
//! use ontapkit::{FeatureFlags, MockTransport, ProtocolRequirements, Session, UseRest, Protocol};
//! use std::sync::Arc;
//!
//! let mock = MockTransport::new().zapi_only(9, 5, 0);
//! let mut session = Session::new(Arc::new(mock.clone()), FeatureFlags::default());
//! let protocol = session.connect(UseRest::Auto, &ProtocolRequirements::new()).unwrap();
//! assert_eq!(protocol, Protocol::Zapi);
//! assert!(mock.writes().is_empty());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod error;
pub mod job;
pub mod selector;
pub mod session;
pub mod types;
pub mod version;
pub mod zapi;

pub use backend::{Call, MockTransport, Transport};
pub use error::{Error, ErrorCategory, Result};
pub use job::{JobPoll, WaitConfig, wait_for_job};
pub use selector::{ProtocolRequirements, Selection};
pub use session::Session;
pub use types::{
    ConnectionConfig, FeatureFlags, Idempotency, Method, Protocol, RestError, RestRequest, RestResponse, UseRest,
};
pub use version::{ClusterInfo, OntapVersion};
pub use zapi::{ZapiElement, ZapiResponse};

use backend::http::HttpTransport;
use std::sync::Arc;

/// Open a session against the cluster described by `config`.
///
/// No request is sent until [`Session::connect`] runs the probe.
pub fn open(config: &ConnectionConfig, flags: FeatureFlags) -> Result<Session> {
    let transport = HttpTransport::new(config)?;
    Ok(Session::new(Arc::new(transport), flags))
}
