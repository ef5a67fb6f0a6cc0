//! Invocation engine for ontap-converge
//!
//! The engine orchestrates:
//! 1. Building - Parse a parameter envelope into a typed resource
//! 2. Connecting - Probe the cluster and pick REST or ZAPI
//! 3. Reconciling - Diff and apply through the declarative crate
//! 4. Reporting - Fold the outcome into a result envelope

pub mod envelope;
pub mod executor;
pub mod planner;

pub use envelope::ResultEnvelope;
pub use executor::{ProbeReport, probe_cluster, run};
pub use planner::{PlaybookOptions, PlaybookSummary, matches_filter, parse_target, run_playbook};
