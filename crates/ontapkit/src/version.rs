//! Cluster version and capability probe.
//!
//! The probe runs once per session. REST is tried first unless the user
//! asked for ZAPI only; any REST failure short of a connection or
//! credential problem falls back to `system-get-version`.

use crate::backend::Transport;
use crate::error::{Error, Result};
use crate::types::{RestRequest, UseRest};
use crate::zapi::ZapiElement;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

static RELEASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"NetApp Release (\d+)\.(\d+)(?:\.(\d+))?").expect("release regex is valid")
});

/// ONTAP software version.
#[derive(Debug, Clone, Eq, Serialize)]
pub struct OntapVersion {
    /// Generation, e.g. 9.
    pub generation: u16,
    /// Major release, e.g. 12.
    pub major: u16,
    /// Minor release, e.g. 1.
    pub minor: u16,
    /// Full version string as reported by the cluster.
    pub full: String,
}

impl OntapVersion {
    /// Create a version without a full string.
    pub fn new(generation: u16, major: u16, minor: u16) -> Self {
        Self {
            generation,
            major,
            minor,
            full: format!("{generation}.{major}.{minor}"),
        }
    }

    /// Parse `NetApp Release 9.8P4: ...` style strings.
    #[must_use]
    pub fn parse(full: &str) -> Option<Self> {
        let caps = RELEASE_RE.captures(full)?;
        let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok());
        Some(Self {
            generation: num(1)?,
            major: num(2)?,
            minor: num(3).unwrap_or(0),
            full: full.to_string(),
        })
    }

    /// Version as a comparable tuple.
    #[must_use]
    pub fn tuple(&self) -> (u16, u16, u16) {
        (self.generation, self.major, self.minor)
    }

    /// Whether this version is at least `generation.major.minor`.
    #[must_use]
    pub fn meets_minimum(&self, generation: u16, major: u16, minor: u16) -> bool {
        self.tuple() >= (generation, major, minor)
    }
}

impl PartialEq for OntapVersion {
    fn eq(&self, other: &Self) -> bool {
        self.tuple() == other.tuple()
    }
}

impl PartialOrd for OntapVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OntapVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tuple().cmp(&other.tuple())
    }
}

impl fmt::Display for OntapVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.generation, self.major, self.minor)
    }
}

/// Result of the version and capability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    /// Software version.
    pub version: OntapVersion,
    /// Whether the REST probe succeeded.
    pub rest_available: bool,
    /// Cluster reports `san_optimized`.
    pub san_optimized: bool,
    /// Cluster reports `disaggregated`.
    pub disaggregated: bool,
}

impl ClusterInfo {
    /// Whether the cluster version is at least `generation.major.minor`.
    #[must_use]
    pub fn meets_minimum(&self, generation: u16, major: u16, minor: u16) -> bool {
        self.version.meets_minimum(generation, major, minor)
    }

    /// Whether REST can be used.
    #[must_use]
    pub fn is_rest_available(&self) -> bool {
        self.rest_available
    }

    /// ASA r2 platforms are SAN optimized and disaggregated.
    #[must_use]
    pub fn is_asa_r2_system(&self) -> bool {
        self.san_optimized && self.disaggregated
    }

    /// Any platform other than ASA r2.
    #[must_use]
    pub fn is_ontap_system(&self) -> bool {
        !self.is_asa_r2_system()
    }
}

/// Probe the cluster.
///
/// With `UseRest::Never` only ZAPI is tried.
pub fn probe(transport: &dyn Transport, preference: UseRest) -> Result<ClusterInfo> {
    if preference != UseRest::Never {
        match probe_rest(transport) {
            Ok(info) => return Ok(info),
            Err(e @ (Error::Unreachable { .. } | Error::AuthFailed { .. })) => return Err(e),
            Err(e) => log::debug!("REST probe failed, trying ZAPI: {e}"),
        }
    }
    let version = probe_zapi(transport)?;
    Ok(ClusterInfo {
        version,
        rest_available: false,
        san_optimized: false,
        disaggregated: false,
    })
}

fn probe_rest(transport: &dyn Transport) -> Result<ClusterInfo> {
    let response = transport
        .send_rest(&RestRequest::get("cluster").query("fields", "version"))?
        .into_result()?;
    let body = response
        .body
        .ok_or_else(|| Error::InvalidResponse("empty cluster response".into()))?;
    let version = version_from_rest(&body)?;

    // Older releases reject unknown fields; treat that as a plain ONTAP system.
    let platform = transport
        .send_rest(&RestRequest::get("cluster").query("fields", "san_optimized,disaggregated"))
        .ok()
        .filter(|r| r.is_success())
        .and_then(|r| r.body);
    let flag = |name: &str| {
        platform
            .as_ref()
            .and_then(|b| b.get(name))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    };

    log::debug!("Cluster runs ONTAP {version} (REST available)");
    Ok(ClusterInfo {
        version,
        rest_available: true,
        san_optimized: flag("san_optimized"),
        disaggregated: flag("disaggregated"),
    })
}

fn version_from_rest(body: &Value) -> Result<OntapVersion> {
    let version = body
        .get("version")
        .ok_or_else(|| Error::InvalidResponse("cluster response has no version".into()))?;
    let full = version.get("full").and_then(Value::as_str).unwrap_or_default();
    let part = |name: &str| version.get(name).and_then(Value::as_u64).map(|v| v as u16);
    match (part("generation"), part("major"), part("minor")) {
        (Some(generation), Some(major), minor) => Ok(OntapVersion {
            generation,
            major,
            minor: minor.unwrap_or(0),
            full: full.to_string(),
        }),
        _ => OntapVersion::parse(full)
            .ok_or_else(|| Error::InvalidResponse(format!("cannot parse version '{full}'"))),
    }
}

fn probe_zapi(transport: &dyn Transport) -> Result<OntapVersion> {
    let results = transport
        .send_zapi(None, &ZapiElement::new("system-get-version"))?
        .into_result("system-get-version")?;
    let full = results.text("version").unwrap_or_default();
    let tuple = ["generation", "major", "minor"]
        .map(|name| results.path_i64(&["version-tuple", "system-version-tuple", name]));
    let version = match tuple {
        [Some(generation), Some(major), minor] => OntapVersion {
            generation: generation as u16,
            major: major as u16,
            minor: minor.unwrap_or(0) as u16,
            full: full.to_string(),
        },
        _ => OntapVersion::parse(full)
            .ok_or_else(|| Error::InvalidResponse(format!("cannot parse version '{full}'")))?,
    };
    log::debug!("Cluster runs ONTAP {version} (ZAPI)");
    Ok(version)
}
