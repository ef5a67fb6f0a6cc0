//! Engine-level errors
//!
//! Resource steps fail with their own error type; the engine wraps those in
//! [`Error::Step`] together with the name of the step that failed, so a
//! partial failure always says how far it got.

use thiserror::Error;

/// Boxed resource error carried by [`Error::Step`]
pub type StepError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    /// Rename requested but neither name exists
    #[error("cannot rename {kind} '{from}' to '{to}': source does not exist")]
    RenameSourceMissing {
        kind: &'static str,
        from: String,
        to: String,
    },

    /// Rename requested but the new name is taken
    #[error("cannot rename {kind} '{from}' to '{to}': target name already in use")]
    RenameTargetInUse {
        kind: &'static str,
        from: String,
        to: String,
    },

    /// Rename requested on a kind that cannot be renamed
    #[error("{kind} does not support rename (from_name '{from}')")]
    RenameUnsupported { kind: &'static str, from: String },

    /// Terminal job state `failure`
    #[error("{step}: job failed: {message}")]
    JobFailed { step: String, message: String },

    /// Job polling exceeded its timeout
    #[error("{step}: job {job} did not finish within {seconds}s")]
    JobTimeout {
        step: String,
        job: String,
        seconds: u64,
    },

    /// Post-apply re-fetch still shows a difference
    #[error("{resource} still differs after apply ({action}): {keys}")]
    ValidationFailed {
        resource: String,
        action: String,
        keys: String,
    },

    /// A resource step failed
    #[error("{step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: StepError,
    },

    /// The cancellation signal was raised
    #[error("cancelled before {step}")]
    Cancelled { step: String },

    /// An engine precondition was violated
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn step(step: impl Into<String>, source: impl Into<StepError>) -> Self {
        Self::Step {
            step: step.into(),
            source: source.into(),
        }
    }

    /// Name of the step this error is attached to, if any
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::JobFailed { step, .. }
            | Self::JobTimeout { step, .. }
            | Self::Step { step, .. }
            | Self::Cancelled { step } => Some(step),
            _ => None,
        }
    }

    /// Downcast the wrapped resource error
    pub fn source_as<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Step { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_step_error_display_names_step() {
        let err = Error::step("create igroup", io::Error::other("boom"));
        assert_eq!(err.to_string(), "create igroup failed: boom");
        assert_eq!(err.step_name(), Some("create igroup"));
    }

    #[test]
    fn test_source_downcast() {
        let err = Error::step("fetch", io::Error::new(io::ErrorKind::TimedOut, "slow"));
        let io_err = err.source_as::<io::Error>().unwrap();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
        assert!(Error::Internal("x".into()).source_as::<io::Error>().is_none());
    }

    #[test]
    fn test_rename_messages() {
        let err = Error::RenameSourceMissing {
            kind: "volume",
            from: "old".into(),
            to: "new".into(),
        };
        assert!(err.to_string().contains("source does not exist"));
        let err = Error::RenameTargetInUse {
            kind: "volume",
            from: "old".into(),
            to: "new".into(),
        };
        assert!(err.to_string().contains("target name already in use"));
    }
}
