//! Planner - turns fetched state into a single decision
//!
//! Rename requests need two lookups. The planner maps the four possible
//! outcomes onto one [`Decision`] and remembers which record the decision
//! acts on.

use crate::diff::{decide, modified_attributes};
use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::types::{Decision, Desired, Intent, Record};

/// A decision together with the record it applies to
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub decision: Decision,
    /// The existing record the decision acts on; `None` for create and no-op
    /// on a missing resource
    pub target: Option<Record>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.decision.is_none()
    }
}

/// Build a plan from the records fetched by `name` and, for renames, by
/// `from_name`
///
/// `from` is only consulted when the desired state is present and carries a
/// `from_name` distinct from `name`.
pub fn plan(desired: &Desired, schema: &Schema, current: Option<Record>, from: Option<Record>) -> Result<Plan> {
    let Some(from_name) = rename_source(desired) else {
        return Ok(simple(desired, schema, current));
    };

    match (current, from) {
        (None, None) => Err(Error::RenameSourceMissing {
            kind: schema.kind,
            from: from_name.to_string(),
            to: desired.name.clone(),
        }),
        (Some(current), None) => Ok(simple(desired, schema, Some(current))),
        (None, Some(source)) => {
            let modify = modified_attributes(&source.attributes, &desired.attributes, schema);
            Ok(Plan {
                decision: Decision::Rename {
                    from: from_name.to_string(),
                    modify,
                },
                target: Some(source),
            })
        }
        (Some(_), Some(_)) => Err(Error::RenameTargetInUse {
            kind: schema.kind,
            from: from_name.to_string(),
            to: desired.name.clone(),
        }),
    }
}

/// The name to rename from, if this run is a rename request
pub fn rename_source(desired: &Desired) -> Option<&str> {
    match (&desired.from_name, desired.intent) {
        (Some(from), Intent::Present) if *from != desired.name => Some(from),
        _ => None,
    }
}

fn simple(desired: &Desired, schema: &Schema, current: Option<Record>) -> Plan {
    let decision = decide(current.as_ref().map(|r| &r.attributes), desired, schema);
    Plan {
        decision,
        target: current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AttrSpec;
    use crate::value::{Attr, Attributes};

    const SCHEMA: Schema = Schema::new("volume", &[AttrSpec::new("comment")]);

    fn record(name: &str, comment: &str) -> Record {
        let mut attrs = Attributes::new();
        attrs.insert("comment".into(), Attr::from(comment));
        Record::new(name, attrs)
    }

    fn desired(comment: &str) -> Desired {
        let mut attrs = Attributes::new();
        attrs.insert("comment".into(), Attr::from(comment));
        Desired::present("new", attrs).with_from_name("old")
    }

    #[test]
    fn test_rename_neither_exists() {
        let err = plan(&desired("c"), &SCHEMA, None, None).unwrap_err();
        assert!(matches!(err, Error::RenameSourceMissing { .. }));
        assert!(err.to_string().contains("source does not exist"));
    }

    #[test]
    fn test_rename_only_target_exists() {
        let p = plan(&desired("c"), &SCHEMA, Some(record("new", "c")), None).unwrap();
        assert!(p.is_noop());

        let p = plan(&desired("d"), &SCHEMA, Some(record("new", "c")), None).unwrap();
        assert!(matches!(p.decision, Decision::Modify(_)));
    }

    #[test]
    fn test_rename_only_source_exists() {
        let p = plan(&desired("d"), &SCHEMA, None, Some(record("old", "c"))).unwrap();
        let Decision::Rename { from, modify } = &p.decision else {
            panic!("expected rename, got {:?}", p.decision);
        };
        assert_eq!(from, "old");
        assert_eq!(modify["comment"], Attr::from("d"));
        assert_eq!(p.target.unwrap().name, "old");
    }

    #[test]
    fn test_rename_both_exist() {
        let err = plan(&desired("c"), &SCHEMA, Some(record("new", "c")), Some(record("old", "c"))).unwrap_err();
        assert!(err.to_string().contains("target name already in use"));
    }

    #[test]
    fn test_from_name_ignored_when_absent() {
        let d = Desired::absent("new").with_from_name("old");
        assert!(rename_source(&d).is_none());
        let p = plan(&d, &SCHEMA, None, None).unwrap();
        assert!(p.is_noop());
    }

    #[test]
    fn test_from_name_equal_to_name_is_plain_diff() {
        let d = Desired::present("same", Attributes::new()).with_from_name("same");
        assert!(rename_source(&d).is_none());
        let p = plan(&d, &SCHEMA, None, None).unwrap();
        assert_eq!(p.decision, Decision::Create);
    }

    #[test]
    fn test_never_rename_and_create() {
        for (current, from) in [
            (None, None),
            (Some(record("new", "c")), None),
            (None, Some(record("old", "c"))),
            (Some(record("new", "c")), Some(record("old", "c"))),
        ] {
            if let Ok(p) = plan(&desired("c"), &SCHEMA, current, from) {
                assert_ne!(p.decision, Decision::Create);
            }
        }
    }
}
