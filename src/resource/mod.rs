//! Managed ONTAP resource kinds
//!
//! Every kind is a typed parameter struct plus an implementation of
//! [`declarative::Resource`]:
//! - fetch the current record over REST or ZAPI
//! - declare the attribute schema the differ compares with
//! - turn create, delete, modify and rename into ordered steps
//! - list the supplied options REST cannot honor

use anyhow::{Context, Result};
use declarative::{ApplyOptions, Attr, Attributes, Desired, Failure, Identity, Intent, Record, Report, reconcile};
use ontapkit::{ProtocolRequirements, Session};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;

pub mod cifs_share;
pub mod export_policy_rule;
pub mod igroup;
pub mod volume;

pub use cifs_share::CifsShare;
pub use export_policy_rule::ExportPolicyRule;
pub use igroup::Igroup;
pub use volume::Volume;

/// Resource kind selected by the `kind` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Volume,
    Igroup,
    CifsShare,
    ExportPolicyRule,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Volume => "volume",
            Self::Igroup => "igroup",
            Self::CifsShare => "cifs_share",
            Self::ExportPolicyRule => "export_policy_rule",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A resource of any kind, ready to reconcile
#[derive(Debug)]
pub enum AnyResource {
    Volume(Volume),
    Igroup(Igroup),
    CifsShare(CifsShare),
    ExportPolicyRule(ExportPolicyRule),
}

impl AnyResource {
    /// Parse the resource parameters of `kind`; unknown options are rejected
    pub fn build(kind: Kind, intent: Intent, attributes: &Map<String, Value>) -> Result<Self> {
        Ok(match kind {
            Kind::Volume => Self::Volume(Volume::new(parse_params(kind, attributes)?, intent)?),
            Kind::Igroup => Self::Igroup(Igroup::new(parse_params(kind, attributes)?, intent)),
            Kind::CifsShare => Self::CifsShare(CifsShare::new(parse_params(kind, attributes)?, intent)),
            Kind::ExportPolicyRule => {
                Self::ExportPolicyRule(ExportPolicyRule::new(parse_params(kind, attributes)?, intent)?)
            }
        })
    }

    pub fn identity(&self) -> Identity {
        use declarative::Resource as _;
        match self {
            Self::Volume(r) => r.identity(),
            Self::Igroup(r) => r.identity(),
            Self::CifsShare(r) => r.identity(),
            Self::ExportPolicyRule(r) => r.identity(),
        }
    }

    /// REST support of the options supplied for this run
    pub fn requirements(&self) -> ProtocolRequirements {
        match self {
            Self::Volume(r) => r.requirements(),
            Self::Igroup(_) | Self::ExportPolicyRule(_) => ProtocolRequirements::new(),
            Self::CifsShare(r) => r.requirements(),
        }
    }

    pub fn reconcile(&self, session: &mut Session, opts: &ApplyOptions) -> std::result::Result<Report, Failure> {
        match self {
            Self::Volume(r) => reconcile(r, session, opts),
            Self::Igroup(r) => reconcile(r, session, opts),
            Self::CifsShare(r) => reconcile(r, session, opts),
            Self::ExportPolicyRule(r) => reconcile(r, session, opts),
        }
    }
}

fn parse_params<T: DeserializeOwned>(kind: Kind, attributes: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(attributes.clone())).with_context(|| format!("Invalid {kind} parameters"))
}

/// Build the desired state of a named resource
pub(crate) fn desired(intent: Intent, name: &str, from_name: Option<&str>, attributes: Attributes) -> Desired {
    let desired = match intent {
        Intent::Present => Desired::present(name, attributes),
        Intent::Absent => Desired::absent(name),
    };
    match from_name {
        Some(from) => desired.with_from_name(from),
        None => desired,
    }
}

/// Insert `value` under `key` when it is set
pub(crate) fn put<T: Into<Attr>>(attributes: &mut Attributes, key: &str, value: Option<T>) {
    if let Some(value) = value {
        attributes.insert(key.to_string(), value.into());
    }
}

/// String at a JSON pointer
pub(crate) fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

/// `field` of every object in the array at `pointer`
pub(crate) fn names_at(value: &Value, pointer: &str, field: &str) -> Option<Vec<String>> {
    let items = value.pointer(pointer)?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| item.get(field).and_then(Value::as_str).map(str::to_string))
            .collect(),
    )
}

/// Strings of the array at `pointer`
pub(crate) fn strings_at(value: &Value, pointer: &str) -> Option<Vec<String>> {
    let items = value.pointer(pointer)?.as_array()?;
    Some(items.iter().filter_map(Value::as_str).map(str::to_string).collect())
}

/// Set a dotted path inside a JSON object, creating intermediate objects
pub(crate) fn insert_at(body: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            body.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = body
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_at(map, rest, value);
            }
        }
    }
}

/// The uuid a REST call addresses the record by
pub(crate) fn uuid_of(record: &Record) -> ontapkit::Result<&str> {
    record
        .uuid
        .as_deref()
        .ok_or_else(|| ontapkit::Error::InvalidResponse(format!("'{}' has no uuid", record.name)))
}

#[cfg(test)]
pub(crate) mod testing {
    use declarative::ManualClock;
    use ontapkit::{FeatureFlags, MockTransport, ProtocolRequirements, Session, UseRest};
    use serde_json::Value;
    use std::sync::Arc;

    /// A session over `mock` with an instant clock, already connected
    pub fn connected(mock: &MockTransport, preference: UseRest, requirements: &ProtocolRequirements) -> Session {
        let mut session =
            Session::new(Arc::new(mock.clone()), FeatureFlags::default()).with_clock(Arc::new(ManualClock::new()));
        session.connect(preference, requirements).unwrap();
        mock.clear_calls();
        session
    }

    /// Body of the `n`th write call
    pub fn write_body(mock: &MockTransport, n: usize) -> Value {
        match &mock.writes()[n] {
            ontapkit::Call::Rest(request) => request.body.clone().unwrap_or(Value::Null),
            other => panic!("expected a REST write, got {}", other.label()),
        }
    }

    /// The `n`th ZAPI write request
    pub fn zapi_write(mock: &MockTransport, n: usize) -> ontapkit::ZapiElement {
        match &mock.writes()[n] {
            ontapkit::Call::Zapi { request, .. } => request.clone(),
            other => panic!("expected a ZAPI write, got {}", other.label()),
        }
    }
}
