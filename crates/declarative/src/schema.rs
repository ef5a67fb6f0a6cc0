//! Attribute schemas
//!
//! Every resource kind declares the attributes it manages and how each one
//! is compared. List attributes must say whether a change is submitted as
//! the whole desired list or as the additions only, because callers on the
//! cluster side disagree about which one they accept.

use crate::error::{Error, Result};
use crate::value::Attributes;
use serde::{Deserialize, Serialize};

/// How a changed list attribute is reported in the modify set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListDiff {
    /// Submit the full desired list
    #[default]
    Full,
    /// Submit only the elements missing from the current list
    Additions,
}

/// String comparison rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseRule {
    #[default]
    Insensitive,
    Sensitive,
}

/// Comparison contract for one attribute
///
/// Nested map members are declared with a dotted name, e.g. `"qos.policy"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrSpec {
    pub name: &'static str,
    pub list_diff: ListDiff,
    pub case: CaseRule,
}

impl AttrSpec {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            list_diff: ListDiff::Full,
            case: CaseRule::Insensitive,
        }
    }

    /// A list attribute whose changes are submitted as additions only
    pub const fn additions(mut self) -> Self {
        self.list_diff = ListDiff::Additions;
        self
    }

    pub const fn case_sensitive(mut self) -> Self {
        self.case = CaseRule::Sensitive;
        self
    }
}

/// The declared attributes of a resource kind
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub kind: &'static str,
    pub attrs: &'static [AttrSpec],
}

impl Schema {
    pub const fn new(kind: &'static str, attrs: &'static [AttrSpec]) -> Self {
        Self { kind, attrs }
    }

    /// Look up the spec for an attribute path
    ///
    /// Undeclared nested members inherit the case rule of their closest
    /// declared parent.
    pub fn spec(&self, path: &str) -> Option<AttrSpec> {
        if let Some(spec) = self.attrs.iter().find(|a| a.name == path) {
            return Some(*spec);
        }
        let (parent, _) = path.rsplit_once('.')?;
        self.spec(parent).map(|p| AttrSpec {
            name: p.name,
            list_diff: ListDiff::Full,
            case: p.case,
        })
    }

    pub fn declares(&self, name: &str) -> bool {
        self.attrs.iter().any(|a| a.name == name)
    }

    /// Reject desired attributes the kind never declared
    pub fn validate(&self, desired: &Attributes) -> Result<()> {
        let undeclared: Vec<&str> = desired
            .keys()
            .filter(|k| !self.declares(k))
            .map(String::as_str)
            .collect();
        if undeclared.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "{} schema does not declare attribute(s): {}",
                self.kind,
                undeclared.join(", ")
            )))
        }
    }
}
