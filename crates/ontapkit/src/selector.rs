//! Protocol selection.
//!
//! Each resource declares which of the options the user supplied REST
//! cannot honor, or only honors from a given release. The selector turns
//! that and the user's `use_rest` preference into a protocol for the run.

use crate::error::{Error, Result};
use crate::types::{Protocol, UseRest};
use crate::version::ClusterInfo;

/// REST support of the options supplied for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolRequirements {
    /// The resource has no ZAPI implementation.
    pub rest_only: bool,
    /// Supplied options REST cannot honor at all.
    pub unsupported_rest: Vec<String>,
    /// Supplied options REST honors from `(generation, major, minor)` on.
    pub partially_supported: Vec<(String, (u16, u16, u16))>,
}

impl ProtocolRequirements {
    /// Requirements of a resource with no restrictions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the resource as REST only.
    #[must_use]
    pub fn rest_only(mut self) -> Self {
        self.rest_only = true;
        self
    }

    /// Record a supplied option REST cannot honor.
    #[must_use]
    pub fn unsupported(mut self, option: impl Into<String>) -> Self {
        self.unsupported_rest.push(option.into());
        self
    }

    /// Record a supplied option REST honors from the given release.
    #[must_use]
    pub fn requires(mut self, option: impl Into<String>, version: (u16, u16, u16)) -> Self {
        self.partially_supported.push((option.into(), version));
        self
    }

    fn under_versioned(&self, cluster: &ClusterInfo) -> Vec<(&str, (u16, u16, u16))> {
        self.partially_supported
            .iter()
            .filter(|(_, (g, ma, mi))| !cluster.meets_minimum(*g, *ma, *mi))
            .map(|(option, version)| (option.as_str(), *version))
            .collect()
    }
}

/// Chosen protocol and the warnings raised while choosing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Protocol for the rest of the run.
    pub protocol: Protocol,
    /// Warnings to surface to the user.
    pub warnings: Vec<String>,
}

/// Reject combinations that cannot work before contacting the cluster.
pub fn preflight(preference: UseRest, requirements: &ProtocolRequirements) -> Result<()> {
    match preference {
        UseRest::Always if !requirements.unsupported_rest.is_empty() => Err(Error::ProtocolRejected(format!(
            "use_rest is always but {} not supported with REST",
            describe(&requirements.unsupported_rest)
        ))),
        UseRest::Never if requirements.rest_only => Err(Error::ProtocolRejected(
            "use_rest is never but this resource only supports REST".into(),
        )),
        _ => Ok(()),
    }
}

/// Pick the protocol for a run.
pub fn select(preference: UseRest, requirements: &ProtocolRequirements, cluster: &ClusterInfo) -> Result<Selection> {
    preflight(preference, requirements)?;
    let under = requirements.under_versioned(cluster);

    match preference {
        UseRest::Never => Ok(zapi(Vec::new())),
        UseRest::Always => {
            if !cluster.is_rest_available() {
                return Err(Error::ProtocolRejected(
                    "use_rest is always but the REST API is not available on this cluster".into(),
                ));
            }
            if let Some((option, version)) = under.first() {
                return Err(Error::Unsupported {
                    option: (*option).to_string(),
                    required: format_version(*version),
                });
            }
            Ok(rest())
        }
        UseRest::Auto => {
            if !cluster.is_rest_available() {
                if requirements.rest_only {
                    return Err(Error::ProtocolRejected(
                        "this resource only supports REST and the REST API is not available".into(),
                    ));
                }
                log::debug!("REST not available, using ZAPI");
                return Ok(zapi(Vec::new()));
            }
            if requirements.rest_only {
                return Ok(rest());
            }

            let mut reasons = Vec::new();
            if !requirements.unsupported_rest.is_empty() {
                reasons.push(format!(
                    "{} not supported with REST",
                    describe(&requirements.unsupported_rest)
                ));
            }
            for (option, version) in &under {
                reasons.push(format!(
                    "{option} requires ONTAP {} or later with REST",
                    format_version(*version)
                ));
            }
            if reasons.is_empty() {
                Ok(rest())
            } else {
                let warning = format!("falling back to ZAPI: {}", reasons.join("; "));
                log::warn!("{warning}");
                Ok(zapi(vec![warning]))
            }
        }
    }
}

fn rest() -> Selection {
    Selection {
        protocol: Protocol::Rest,
        warnings: Vec::new(),
    }
}

fn zapi(warnings: Vec<String>) -> Selection {
    Selection {
        protocol: Protocol::Zapi,
        warnings,
    }
}

fn describe(options: &[String]) -> String {
    match options {
        [one] => format!("{one} is"),
        many => format!("{} are", many.join(", ")),
    }
}

/// `9.8` for `(9, 8, 0)`, `9.10.1` otherwise.
#[must_use]
pub fn format_version((generation, major, minor): (u16, u16, u16)) -> String {
    if minor == 0 {
        format!("{generation}.{major}")
    } else {
        format!("{generation}.{major}.{minor}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::OntapVersion;

    fn cluster(rest: bool, version: (u16, u16, u16)) -> ClusterInfo {
        ClusterInfo {
            version: OntapVersion::new(version.0, version.1, version.2),
            rest_available: rest,
            san_optimized: false,
            disaggregated: false,
        }
    }

    #[test]
    fn test_auto_prefers_rest() {
        let s = select(UseRest::Auto, &ProtocolRequirements::new(), &cluster(true, (9, 12, 1))).unwrap();
        assert_eq!(s.protocol, Protocol::Rest);
        assert!(s.warnings.is_empty());
    }

    #[test]
    fn test_auto_falls_back_with_one_warning() {
        let req = ProtocolRequirements::new().unsupported("atime_update");
        let s = select(UseRest::Auto, &req, &cluster(true, (9, 12, 1))).unwrap();
        assert_eq!(s.protocol, Protocol::Zapi);
        assert_eq!(s.warnings.len(), 1);
        assert!(s.warnings[0].starts_with("falling back to ZAPI: atime_update"));
    }

    #[test]
    fn test_auto_warning_names_all_reasons_once() {
        let req = ProtocolRequirements::new()
            .unsupported("atime_update")
            .unsupported("nvfail_enabled")
            .requires("tiering_minimum_cooling_days", (9, 8, 0));
        let s = select(UseRest::Auto, &req, &cluster(true, (9, 7, 0))).unwrap();
        assert_eq!(s.warnings.len(), 1);
        assert!(s.warnings[0].contains("atime_update, nvfail_enabled are not supported"));
        assert!(s.warnings[0].contains("requires ONTAP 9.8 or later"));
    }

    #[test]
    fn test_auto_partial_support_met() {
        let req = ProtocolRequirements::new().requires("tiering_minimum_cooling_days", (9, 8, 0));
        let s = select(UseRest::Auto, &req, &cluster(true, (9, 8, 0))).unwrap();
        assert_eq!(s.protocol, Protocol::Rest);
    }

    #[test]
    fn test_auto_without_rest_uses_zapi_quietly() {
        let s = select(UseRest::Auto, &ProtocolRequirements::new(), &cluster(false, (9, 5, 0))).unwrap();
        assert_eq!(s.protocol, Protocol::Zapi);
        assert!(s.warnings.is_empty());
    }

    #[test]
    fn test_always_rejects_unsupported_in_preflight() {
        let req = ProtocolRequirements::new().unsupported("atime_update");
        let err = preflight(UseRest::Always, &req).unwrap_err();
        assert!(err.to_string().contains("atime_update"));
    }

    #[test]
    fn test_always_rejects_under_versioned() {
        let req = ProtocolRequirements::new().requires("tiering_minimum_cooling_days", (9, 8, 0));
        let err = select(UseRest::Always, &req, &cluster(true, (9, 6, 0))).unwrap_err();
        assert_eq!(err.to_string(), "tiering_minimum_cooling_days requires ONTAP 9.8 or later");
    }

    #[test]
    fn test_always_requires_rest() {
        let err = select(UseRest::Always, &ProtocolRequirements::new(), &cluster(false, (9, 5, 0))).unwrap_err();
        assert!(matches!(err, Error::ProtocolRejected(_)));
    }

    #[test]
    fn test_never_and_rest_only() {
        let req = ProtocolRequirements::new().rest_only();
        assert!(preflight(UseRest::Never, &req).is_err());
        let s = select(UseRest::Never, &ProtocolRequirements::new(), &cluster(true, (9, 12, 1))).unwrap();
        assert_eq!(s.protocol, Protocol::Zapi);
    }

    #[test]
    fn test_format_version() {
        assert_eq!(format_version((9, 8, 0)), "9.8");
        assert_eq!(format_version((9, 10, 1)), "9.10.1");
    }
}
