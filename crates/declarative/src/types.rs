//! Core types for declarative reconciliation

use crate::value::{Attributes, to_json_map};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Existence intent selected by the `state` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    #[default]
    Present,
    Absent,
}

/// Where a resource name is unique
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Cluster,
    Vserver(String),
}

impl Scope {
    pub fn vserver(&self) -> Option<&str> {
        match self {
            Self::Cluster => None,
            Self::Vserver(name) => Some(name),
        }
    }
}

/// Composite identity of a managed resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub kind: &'static str,
    pub scope: Scope,
    pub name: String,
}

impl Identity {
    pub fn cluster(kind: &'static str, name: impl Into<String>) -> Self {
        Self {
            kind,
            scope: Scope::Cluster,
            name: name.into(),
        }
    }

    pub fn vserver(kind: &'static str, vserver: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            scope: Scope::Vserver(vserver.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Scope::Cluster => write!(f, "{} '{}'", self.kind, self.name),
            Scope::Vserver(vs) => write!(f, "{} '{}' on vserver '{}'", self.kind, self.name, vs),
        }
    }
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq)]
pub struct Desired {
    pub intent: Intent,
    pub name: String,
    pub from_name: Option<String>,
    pub attributes: Attributes,
}

impl Desired {
    pub fn present(name: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            intent: Intent::Present,
            name: name.into(),
            from_name: None,
            attributes,
        }
    }

    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            intent: Intent::Absent,
            name: name.into(),
            from_name: None,
            attributes: Attributes::new(),
        }
    }

    pub fn with_from_name(mut self, from_name: impl Into<String>) -> Self {
        self.from_name = Some(from_name.into());
        self
    }
}

/// An observed resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub attributes: Attributes,
}

impl Record {
    pub fn new(name: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            attributes,
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }
}

/// The single action chosen for an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    None,
    Create,
    Delete,
    Modify,
    Rename,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Modify => "modify",
            Self::Rename => "rename",
        };
        write!(f, "{s}")
    }
}

/// Differ output
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    None,
    Create,
    Delete,
    Modify(Attributes),
    /// Rename `from` to the desired name, then apply `modify`
    Rename { from: String, modify: Attributes },
}

impl Decision {
    pub fn action(&self) -> Action {
        match self {
            Self::None => Action::None,
            Self::Create => Action::Create,
            Self::Delete => Action::Delete,
            Self::Modify(_) => Action::Modify,
            Self::Rename { .. } => Action::Rename,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Attributes that would be written by a modify or a rename
    pub fn modify_set(&self) -> Option<&Attributes> {
        match self {
            Self::Modify(m) | Self::Rename { modify: m, .. } => Some(m),
            _ => None,
        }
    }
}

/// How a single step finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The step changed the cluster
    Done,
    /// The step was accepted and runs as a cluster job
    Pending(JobHandle),
    /// The cluster already matched; nothing was changed
    AlreadyConverged,
}

/// Handle on an asynchronous cluster job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            link: None,
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }
}

/// Terminal outcome of a job wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success { warnings: Vec<String> },
    Failure { message: String },
    Timeout,
}

/// Post-apply validation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatePolicy {
    #[default]
    Ignore,
    Warn,
    Error,
}

/// Options for one reconcile run
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Read and diff only
    pub check_mode: bool,
    /// Poll jobs until they finish
    pub wait_for_completion: bool,
    /// Upper bound for each job wait
    pub job_timeout: Duration,
    /// Report a job timeout as a warning instead of a failure
    pub job_timeout_is_warning: bool,
    pub validate: ValidatePolicy,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            check_mode: false,
            wait_for_completion: true,
            job_timeout: Duration::from_secs(180),
            job_timeout_is_warning: false,
            validate: ValidatePolicy::Ignore,
        }
    }
}

/// Serializable view of a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub action: Action,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub modify: serde_json::Map<String, serde_json::Value>,
}

impl DecisionSummary {
    pub fn new(decision: &Decision, desired: &Desired) -> Self {
        let modify = decision
            .modify_set()
            .and_then(|m| match to_json_map(m) {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        let from_name = match decision {
            Decision::Rename { from, .. } => Some(from.clone()),
            _ => None,
        };
        Self {
            action: decision.action(),
            name: desired.name.clone(),
            from_name,
            modify,
        }
    }
}

/// Outcome of a successful reconcile run
#[derive(Debug, Clone)]
pub struct Report {
    pub changed: bool,
    pub decision: DecisionSummary,
    pub warnings: Vec<String>,
    /// Latest observed state of the resource, if it exists
    pub record: Option<Record>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Attr;

    #[test]
    fn test_intent_default_is_present() {
        assert_eq!(Intent::default(), Intent::Present);
        let intent: Intent = serde_json::from_str("\"absent\"").unwrap();
        assert_eq!(intent, Intent::Absent);
    }

    #[test]
    fn test_identity_display() {
        let id = Identity::vserver("volume", "vs1", "vol1");
        assert_eq!(id.to_string(), "volume 'vol1' on vserver 'vs1'");
        assert_eq!(id.scope.vserver(), Some("vs1"));
        assert_eq!(Identity::cluster("route", "r").scope.vserver(), None);
    }

    #[test]
    fn test_decision_action_and_modify_set() {
        let mut m = Attributes::new();
        m.insert("size".into(), Attr::Int(10));
        let rename = Decision::Rename {
            from: "old".into(),
            modify: m.clone(),
        };
        assert_eq!(rename.action(), Action::Rename);
        assert_eq!(rename.modify_set(), Some(&m));
        assert!(Decision::None.is_none());
        assert!(Decision::Create.modify_set().is_none());
    }

    #[test]
    fn test_summary_serialization() {
        let mut m = Attributes::new();
        m.insert("comment".into(), Attr::from("x"));
        let desired = Desired::present("vol1", Attributes::new());
        let summary = DecisionSummary::new(&Decision::Modify(m), &desired);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["action"], "modify");
        assert_eq!(json["modify"]["comment"], "x");
        assert!(json.get("from_name").is_none());
    }
}
