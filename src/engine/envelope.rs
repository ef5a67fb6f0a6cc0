//! The result envelope printed for every invocation

use declarative::{DecisionSummary, Failure, Report};
use serde::Serialize;
use serde_json::Value;

/// Outcome of one invocation as the caller sees it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEnvelope {
    pub changed: bool,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionSummary>,
    /// Latest observed state of the resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ontap_info: Option<Value>,
    /// Playbook task label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl ResultEnvelope {
    pub fn from_report(report: Report) -> Self {
        let ontap_info = report.record.and_then(|record| serde_json::to_value(record).ok());
        Self {
            changed: report.changed,
            failed: false,
            msg: None,
            warnings: report.warnings,
            decision: Some(report.decision),
            ontap_info,
            task: None,
        }
    }

    pub fn from_failure(failure: Failure) -> Self {
        let msg = match failure.error.source_as::<ontapkit::Error>() {
            Some(cause) => format!("{} ({})", failure.error, cause.advice()),
            None => failure.error.to_string(),
        };
        Self {
            changed: failure.changed,
            failed: true,
            msg: Some(msg),
            warnings: failure.warnings,
            decision: failure.decision,
            ontap_info: None,
            task: None,
        }
    }

    #[must_use]
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }
}

impl From<Result<Report, Failure>> for ResultEnvelope {
    fn from(outcome: Result<Report, Failure>) -> Self {
        match outcome {
            Ok(report) => Self::from_report(report),
            Err(failure) => Self::from_failure(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{Action, Attributes, Error, Record};
    use serde_json::json;

    fn summary(action: Action) -> DecisionSummary {
        DecisionSummary {
            action,
            name: "vol1".into(),
            from_name: None,
            modify: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_report_envelope() {
        let report = Report {
            changed: true,
            decision: summary(Action::Create),
            warnings: vec!["w1".into()],
            record: Some(Record::new("vol1", Attributes::new()).with_uuid("u1")),
        };
        let envelope = ResultEnvelope::from_report(report).with_task("volume vol1");
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "changed": true,
                "failed": false,
                "warnings": ["w1"],
                "decision": {"action": "create", "name": "vol1"},
                "ontap_info": {"name": "vol1", "uuid": "u1", "attributes": {}},
                "task": "volume vol1",
            })
        );
    }

    #[test]
    fn test_failure_envelope_keeps_changed_and_warnings() {
        let failure = Failure {
            error: Error::step("move volume", ontapkit::Error::zapi("volume-move-start", "13115", "busy")),
            changed: true,
            warnings: vec!["earlier".into()],
            decision: Some(summary(Action::Modify)),
        };
        let envelope = ResultEnvelope::from(Err(failure));
        assert!(envelope.failed);
        assert!(envelope.changed);
        assert_eq!(envelope.warnings, vec!["earlier"]);
        let msg = envelope.msg.unwrap();
        assert!(msg.starts_with("move volume failed"));
        assert!(msg.contains("busy"));
    }

    #[test]
    fn test_engine_error_has_no_advice() {
        let failure = Failure {
            error: Error::Cancelled { step: "create share".into() },
            changed: false,
            warnings: Vec::new(),
            decision: None,
        };
        let envelope = ResultEnvelope::from_failure(failure);
        assert_eq!(envelope.msg.as_deref(), Some("cancelled before create share"));
        assert!(envelope.decision.is_none());
    }
}
