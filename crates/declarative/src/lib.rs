//! # Declarative
//!
//! A reconciliation engine for declaratively managed remote resources.
//!
//! Given the desired state of a named resource and the state observed on the
//! managed system, the engine decides on exactly one of create, delete,
//! modify, rename or nothing, computes the minimal set of attributes to
//! write, and drives the resulting calls (and any asynchronous jobs they
//! start) to completion.
//!
//! ## Core Concepts
//!
//! - **Attributes**: a sorted map of attribute names to [`Attr`] values
//! - **Schema**: how each attribute of a kind is compared
//! - **Decision**: the single action chosen by the differ
//! - **Resource**: reads one object and turns a decision into [`Step`]s
//! - **EngineSession**: the connection steps run against; also collects warnings
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{reconcile, ApplyOptions};
//!
//! let report = reconcile(&volume, &mut session, &ApplyOptions::default())?;
//! println!("changed: {}", report.changed);
//! ```
//!
//! The differ and planner are pure functions and can be used on their own:
//!
//! ```
//! use declarative::{decide, AttrSpec, Attr, Attributes, Decision, Desired, Schema};
//!
//! const SCHEMA: Schema = Schema::new("share", &[AttrSpec::new("comment")]);
//!
//! let mut current = Attributes::new();
//! current.insert("comment".into(), Attr::from("Old"));
//! let mut wanted = Attributes::new();
//! wanted.insert("comment".into(), Attr::from("old"));
//!
//! let desired = Desired::present("docs", wanted);
//! assert_eq!(decide(Some(&current), &desired, &SCHEMA), Decision::None);
//! ```

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod planner;
pub mod resource;
pub mod schema;
pub mod types;
pub mod value;

// Re-export main types at crate root
pub use context::{CancelToken, Clock, ManualClock, NoProgress, ProgressCallback, SystemClock};
pub use diff::{decide, list_delta, modified_attributes};
pub use error::{Error, Result, StepError};
pub use executor::{Failure, reconcile};
pub use planner::{Plan, plan, rename_source};
pub use resource::{EngineSession, Resource, Step, Steps};
pub use schema::{AttrSpec, CaseRule, ListDiff, Schema};
pub use types::{
    Action, ApplyOptions, Completion, Decision, DecisionSummary, Desired, Identity, Intent, JobHandle, JobOutcome,
    Record, Report, Scope, ValidatePolicy,
};
pub use value::{Attr, Attributes, attributes_from_json, attributes_of, to_json_map};
