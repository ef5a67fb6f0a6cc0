//! Error types for ONTAP operations.
//!
//! Errors are categorized so callers can tell connection problems from
//! application errors, and so idempotent cases (a missing object on delete,
//! an existing object on create) can be recognized without string matching
//! at every call site.

use std::fmt;

/// Result type alias for ONTAP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// REST error code for "entry doesn't exist".
pub const REST_NOT_FOUND: &str = "4";

/// REST error code for an unexpected argument in the request body.
pub const REST_UNEXPECTED_ARGUMENT: &str = "262179";

/// ZAPI errno for a duplicate entry.
pub const ZAPI_DUPLICATE: &str = "13001";

/// ZAPI errno for insufficient privileges.
pub const ZAPI_NO_PRIVILEGE: &str = "13003";

/// ZAPI errno for "entry doesn't exist".
pub const ZAPI_NOT_FOUND: &str = "15661";

/// Categories of ONTAP errors.
///
/// Categories drive retry decisions in the job waiter and the idempotency
/// policies of individual resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection, DNS, TLS or socket timeout.
    Network,
    /// Credentials were rejected.
    Auth,
    /// The addressed object does not exist.
    NotFound,
    /// The object already exists.
    Conflict,
    /// The option is not supported on this cluster or protocol.
    Unsupported,
    /// The cluster returned an application error.
    Api,
    /// An asynchronous job failed or did not finish.
    Job,
    /// The response could not be understood.
    Format,
    /// Connection parameters are invalid.
    Config,
    /// The run was cancelled.
    Cancelled,
    /// Other/unknown errors.
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network)
    }

    /// Get a user-friendly description of this error category.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Network => "Cluster unreachable",
            Self::Auth => "Authentication failed",
            Self::NotFound => "Object not found",
            Self::Conflict => "Object already exists",
            Self::Unsupported => "Option not supported",
            Self::Api => "ONTAP API error",
            Self::Job => "Job did not succeed",
            Self::Format => "Invalid response",
            Self::Config => "Invalid connection parameters",
            Self::Cancelled => "Cancelled",
            Self::Other => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    #[must_use]
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Network => "Check hostname, port and https settings, and that the cluster is reachable",
            Self::Auth => "Check username and password, or the client certificate and key",
            Self::NotFound => "Verify the name and vserver are correct",
            Self::Conflict => "Use a different name or manage the existing object",
            Self::Unsupported => "Upgrade ONTAP, remove the option, or set use_rest to never",
            Self::Api => "Check the error details returned by the cluster",
            Self::Job => "Inspect the job on the cluster with 'job show'",
            Self::Format => "The cluster returned an unexpected payload; enable trace_apis to inspect it",
            Self::Config => "Fix the connection parameters",
            Self::Cancelled => "Run again to finish converging",
            Self::Other => "Check the error details for more information",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur while talking to a cluster.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection-level failure.
    #[error("cannot reach {host}: {message}")]
    Unreachable {
        /// Host that was contacted.
        host: String,
        /// Transport error message.
        message: String,
    },

    /// Credential rejection.
    #[error("authentication failed (HTTP {status}): {message}")]
    AuthFailed {
        /// HTTP status code.
        status: u16,
        /// Message returned by the cluster.
        message: String,
    },

    /// REST application error.
    #[error("{}", rest_message(*status, code.as_deref(), message, target.as_deref()))]
    Rest {
        /// HTTP status code.
        status: u16,
        /// ONTAP error code, if any.
        code: Option<String>,
        /// Error message.
        message: String,
        /// Field the error refers to, if any.
        target: Option<String>,
    },

    /// ZAPI application error.
    #[error("{api} failed: errno {code}: {reason}")]
    Zapi {
        /// API that was called.
        api: String,
        /// ZAPI errno.
        code: String,
        /// Reason text.
        reason: String,
    },

    /// Option not supported on this cluster or protocol.
    #[error("{option} requires ONTAP {required} or later")]
    Unsupported {
        /// Option name.
        option: String,
        /// Minimum version, e.g. "9.8".
        required: String,
    },

    /// The protocol preference cannot be honored.
    #[error("{0}")]
    ProtocolRejected(String),

    /// Terminal job state `failure`.
    #[error("job {job} failed: {message}")]
    JobFailed {
        /// Job identifier.
        job: String,
        /// Failure message reported by the job.
        message: String,
    },

    /// Job polling exceeded its timeout.
    #[error("job {job} did not finish within {seconds}s")]
    JobTimeout {
        /// Job identifier.
        job: String,
        /// Timeout that elapsed.
        seconds: u64,
    },

    /// Invalid response from the cluster.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Invalid connection parameters.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The cancellation signal was raised.
    #[error("cancelled")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

fn rest_message(status: u16, code: Option<&str>, message: &str, target: Option<&str>) -> String {
    let mut out = format!("REST error (HTTP {status})");
    if let Some(code) = code {
        out.push_str(&format!(" code {code}"));
    }
    out.push_str(&format!(": {message}"));
    if let Some(target) = target {
        out.push_str(&format!(" (target: {target})"));
    }
    out
}

impl Error {
    /// Create an unreachable error.
    pub fn unreachable(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Build the error for a failed REST response.
    pub fn rest(status: u16, code: Option<String>, message: impl Into<String>, target: Option<String>) -> Self {
        let message = message.into();
        if status == 401 || status == 403 {
            return Self::AuthFailed { status, message };
        }
        Self::Rest {
            status,
            code,
            message,
            target,
        }
    }

    /// Build the error for a failed ZAPI call.
    pub fn zapi(api: impl Into<String>, code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Zapi {
            api: api.into(),
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// Get the error category.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unreachable { .. } => ErrorCategory::Network,
            Self::AuthFailed { .. } => ErrorCategory::Auth,
            Self::Rest {
                status, code, message, ..
            } => {
                let lower = message.to_lowercase();
                if *status == 404 || code.as_deref() == Some(REST_NOT_FOUND) {
                    ErrorCategory::NotFound
                } else if *status == 409 || lower.contains("already exists") || lower.contains("duplicate entry") {
                    ErrorCategory::Conflict
                } else if code.as_deref() == Some(REST_UNEXPECTED_ARGUMENT) || lower.contains("unexpected argument") {
                    ErrorCategory::Unsupported
                } else {
                    ErrorCategory::Api
                }
            }
            Self::Zapi { code, reason, .. } => {
                let lower = reason.to_lowercase();
                match code.as_str() {
                    ZAPI_NOT_FOUND => ErrorCategory::NotFound,
                    ZAPI_DUPLICATE => ErrorCategory::Conflict,
                    ZAPI_NO_PRIVILEGE => ErrorCategory::Auth,
                    _ if lower.contains("already exists") || lower.contains("duplicate entry") => {
                        ErrorCategory::Conflict
                    }
                    _ if lower.contains("does not exist") || lower.contains("not found") => ErrorCategory::NotFound,
                    _ if lower.contains("unexpected argument") => ErrorCategory::Unsupported,
                    _ => ErrorCategory::Api,
                }
            }
            Self::Unsupported { .. } | Self::ProtocolRejected(_) => ErrorCategory::Unsupported,
            Self::JobFailed { .. } | Self::JobTimeout { .. } => ErrorCategory::Job,
            Self::InvalidResponse(_) => ErrorCategory::Format,
            Self::Config(_) => ErrorCategory::Config,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Whether the addressed object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    /// Whether the object already exists.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.category() == ErrorCategory::Conflict
    }

    /// Actionable advice for this error.
    #[must_use]
    pub fn advice(&self) -> &'static str {
        self.category().advice()
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::rest(code, None, format!("HTTP {code}"), None),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}

impl From<roxmltree::Error> for Error {
    fn from(err: roxmltree::Error) -> Self {
        Self::InvalidResponse(format!("malformed ZAPI response: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retryable() {
        assert!(ErrorCategory::Network.is_retryable());
        assert!(!ErrorCategory::Auth.is_retryable());
        assert!(!ErrorCategory::NotFound.is_retryable());
        assert!(!ErrorCategory::Conflict.is_retryable());
        assert!(!ErrorCategory::Job.is_retryable());
    }

    #[test]
    fn test_error_category_description_and_advice() {
        for category in [
            ErrorCategory::Network,
            ErrorCategory::Auth,
            ErrorCategory::NotFound,
            ErrorCategory::Conflict,
            ErrorCategory::Unsupported,
            ErrorCategory::Format,
        ] {
            assert!(!category.description().is_empty());
            assert!(!category.advice().is_empty());
        }
        assert!(ErrorCategory::Network.advice().contains("hostname"));
    }

    #[test]
    fn test_rest_auth_statuses() {
        assert_eq!(Error::rest(401, None, "bad", None).category(), ErrorCategory::Auth);
        assert!(matches!(Error::rest(403, None, "no", None), Error::AuthFailed { status: 403, .. }));
    }

    #[test]
    fn test_rest_not_found() {
        assert!(Error::rest(404, None, "gone", None).is_not_found());
        assert!(Error::rest(400, Some(REST_NOT_FOUND.into()), "entry doesn't exist", None).is_not_found());
    }

    #[test]
    fn test_rest_conflict() {
        assert!(Error::rest(409, None, "x", None).is_conflict());
        assert!(Error::rest(400, Some("1".into()), "Share already exists", None).is_conflict());
    }

    #[test]
    fn test_rest_unexpected_argument() {
        let err = Error::rest(400, Some(REST_UNEXPECTED_ARGUMENT.into()), "Unexpected argument \"x\".", None);
        assert_eq!(err.category(), ErrorCategory::Unsupported);
    }

    #[test]
    fn test_zapi_codes() {
        assert!(Error::zapi("volume-destroy", ZAPI_NOT_FOUND, "entry doesn't exist").is_not_found());
        assert!(Error::zapi("export-policy-create", ZAPI_DUPLICATE, "duplicate entry").is_conflict());
        assert_eq!(
            Error::zapi("igroup-create", "13003", "Insufficient privileges").category(),
            ErrorCategory::Auth
        );
        assert_eq!(Error::zapi("x", "13115", "Invalid value").category(), ErrorCategory::Api);
    }

    #[test]
    fn test_unsupported_message() {
        let err = Error::Unsupported {
            option: "tiering_minimum_cooling_days".into(),
            required: "9.8".into(),
        };
        assert_eq!(err.to_string(), "tiering_minimum_cooling_days requires ONTAP 9.8 or later");
    }

    #[test]
    fn test_rest_display() {
        let err = Error::rest(400, Some("917927".into()), "Field is invalid", Some("size".into()));
        let text = err.to_string();
        assert!(text.contains("HTTP 400"));
        assert!(text.contains("917927"));
        assert!(text.contains("target: size"));
    }

    #[test]
    fn test_unreachable_is_network() {
        let err = Error::unreachable("cluster1", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("cluster1"));
    }
}
