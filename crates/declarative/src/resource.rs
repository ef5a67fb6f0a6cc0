//! Resource trait for declarative state management
//!
//! A Resource knows how to read one object from the managed system and how
//! to turn a [`Decision`](crate::types::Decision) into an ordered list of
//! [`Step`]s. It never decides what to do: that is the differ's job.

use crate::context::CancelToken;
use crate::schema::Schema;
use crate::types::{Completion, Desired, Identity, JobHandle, JobOutcome, Record};
use crate::value::Attributes;
use std::fmt;
use std::time::Duration;

/// The connection a resource runs against
///
/// A session is also the single sink for warnings raised while a run is in
/// progress (protocol fallbacks, ignored job errors).
pub trait EngineSession {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Record a warning for the current run
    fn warn(&mut self, message: String);

    /// Drain the warnings recorded so far
    fn take_warnings(&mut self) -> Vec<String>;

    fn cancel_token(&self) -> CancelToken;

    /// Poll a job until it reaches a terminal state or `timeout` elapses
    fn await_job(&mut self, job: &JobHandle, timeout: Duration) -> Result<JobOutcome, Self::Error>;
}

/// Body of a step
pub type StepFn<'a, S, E> = Box<dyn FnOnce(&mut S) -> Result<Completion, E> + 'a>;

/// One named call against the managed system
///
/// Steps run in order; the first failure stops the run and the error names
/// the step.
pub struct Step<'a, S, E> {
    pub name: String,
    run: StepFn<'a, S, E>,
}

impl<'a, S, E> Step<'a, S, E> {
    pub fn new(name: impl Into<String>, run: impl FnOnce(&mut S) -> Result<Completion, E> + 'a) -> Self {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn run(self, session: &mut S) -> Result<Completion, E> {
        (self.run)(session)
    }
}

impl<S, E> fmt::Debug for Step<'_, S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Shorthand for the step list of a resource
pub type Steps<'a, R> = Vec<Step<'a, <R as Resource>::Session, <R as Resource>::Error>>;

/// Core trait for managed resources
pub trait Resource {
    type Session: EngineSession<Error = Self::Error>;
    type Error: std::error::Error + Send + Sync + 'static;

    fn identity(&self) -> Identity;

    /// Declared attributes and how each one is compared
    fn schema(&self) -> Schema;

    fn desired(&self) -> &Desired;

    /// Read the resource called `name`; `Ok(None)` when it does not exist
    fn fetch(&self, session: &mut Self::Session, name: &str) -> Result<Option<Record>, Self::Error>;

    fn create_steps<'a>(&'a self, session: &Self::Session) -> Steps<'a, Self>;

    fn delete_steps<'a>(&'a self, session: &Self::Session, current: &'a Record) -> Steps<'a, Self>;

    /// Steps that write `modify` onto `current`
    ///
    /// `modify` only ever holds attributes the user supplied.
    fn modify_steps<'a>(&'a self, session: &Self::Session, current: &'a Record, modify: &'a Attributes)
    -> Steps<'a, Self>;

    /// Whether `from_name` is meaningful for this kind
    fn supports_rename(&self) -> bool {
        false
    }

    /// Steps that rename `current` to `to`
    fn rename_steps<'a>(&'a self, _session: &Self::Session, _current: &'a Record, _to: &'a str) -> Steps<'a, Self> {
        Vec::new()
    }

    /// Whether modify and delete address the resource by its uuid
    ///
    /// When true, a fetched record without a uuid is an engine error.
    fn requires_uuid(&self, _session: &Self::Session) -> bool {
        false
    }
}
