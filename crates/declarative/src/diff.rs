//! The state differ
//!
//! Pure functions from (current, desired) to a [`Decision`]. Only keys the
//! user supplied are ever compared, and only keys present on both sides can
//! end up in the modify set.

use crate::schema::{AttrSpec, CaseRule, ListDiff, Schema};
use crate::types::{Decision, Desired, Intent};
use crate::value::{Attr, Attributes};
use std::collections::BTreeMap;

/// Decide the action for one resource
pub fn decide(current: Option<&Attributes>, desired: &Desired, schema: &Schema) -> Decision {
    match (current, desired.intent) {
        (None, Intent::Absent) => Decision::None,
        (None, Intent::Present) => Decision::Create,
        (Some(_), Intent::Absent) => Decision::Delete,
        (Some(current), Intent::Present) => {
            let modify = modified_attributes(current, &desired.attributes, schema);
            if modify.is_empty() {
                Decision::None
            } else {
                Decision::Modify(modify)
            }
        }
    }
}

/// Minimal set of attributes to write so that current matches desired
pub fn modified_attributes(current: &Attributes, desired: &Attributes, schema: &Schema) -> Attributes {
    diff_maps(current, desired, schema, None)
}

fn diff_maps(current: &Attributes, desired: &Attributes, schema: &Schema, prefix: Option<&str>) -> Attributes {
    let mut modify = Attributes::new();
    for (key, current_value) in current {
        let Some(desired_value) = desired.get(key) else {
            continue;
        };
        let path = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        let spec = schema.spec(&path).unwrap_or(AttrSpec::new(""));
        if let Some(change) = compare(current_value, desired_value, schema, &path, spec) {
            modify.insert(key.clone(), change);
        }
    }
    modify
}

fn compare(current: &Attr, desired: &Attr, schema: &Schema, path: &str, spec: AttrSpec) -> Option<Attr> {
    match (current, desired) {
        (Attr::List(c), Attr::List(d)) => compare_lists(c, d, spec),
        (Attr::Map(c), Attr::Map(d)) => {
            let nested = diff_maps(c, d, schema, Some(path));
            (!nested.is_empty()).then_some(Attr::Map(nested))
        }
        _ => (!scalars_equal(current, desired, spec.case)).then(|| desired.clone()),
    }
}

/// Scalar equality: strings per case rule, numbers numerically
///
/// A string that parses as a number or a boolean compares equal to that
/// number or boolean, since the XML protocol reports everything as text.
pub fn scalars_equal(current: &Attr, desired: &Attr, case: CaseRule) -> bool {
    match (current, desired) {
        (Attr::Str(a), Attr::Str(b)) => match case {
            CaseRule::Insensitive => a.to_lowercase() == b.to_lowercase(),
            CaseRule::Sensitive => a == b,
        },
        (Attr::Bool(a), Attr::Bool(b)) => a == b,
        (Attr::Int(a), Attr::Int(b)) => a == b,
        (Attr::Bool(b), Attr::Str(_)) | (Attr::Str(_), Attr::Bool(b)) => {
            let other = if matches!(current, Attr::Bool(_)) { desired } else { current };
            other.as_bool() == Some(*b)
        }
        (a, b) => match (exact_int(a), exact_int(b)) {
            (Some(x), Some(y)) => x == y,
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
                _ => false,
            },
        },
    }
}

fn exact_int(attr: &Attr) -> Option<i64> {
    match attr {
        Attr::Int(i) => Some(*i),
        Attr::Str(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Compare two lists as multisets
///
/// Returns `None` when they hold the same elements. Otherwise returns
/// the full desired list, or only the additions, as the attribute declares.
pub fn compare_lists(current: &[Attr], desired: &[Attr], spec: AttrSpec) -> Option<Attr> {
    let (additions, removals) = list_delta(current, desired, spec.case);
    if additions.is_empty() && removals.is_empty() {
        return None;
    }
    Some(match spec.list_diff {
        ListDiff::Full => Attr::List(desired.to_vec()),
        ListDiff::Additions => Attr::List(additions),
    })
}

/// Elements of desired missing from current, and of current missing from desired
pub fn list_delta(current: &[Attr], desired: &[Attr], case: CaseRule) -> (Vec<Attr>, Vec<Attr>) {
    let mut remaining = counts(current, case);
    let mut additions = Vec::new();
    for item in desired {
        let key = element_key(item, case);
        match remaining.get_mut(&key) {
            Some(n) if *n > 0 => *n -= 1,
            _ => additions.push(item.clone()),
        }
    }

    let mut wanted = counts(desired, case);
    let mut removals = Vec::new();
    for item in current {
        let key = element_key(item, case);
        match wanted.get_mut(&key) {
            Some(n) if *n > 0 => *n -= 1,
            _ => removals.push(item.clone()),
        }
    }
    (additions, removals)
}

fn counts(items: &[Attr], case: CaseRule) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(element_key(item, case)).or_insert(0) += 1;
    }
    counts
}

fn element_key(item: &Attr, case: CaseRule) -> String {
    match (item, case) {
        (Attr::Str(s), CaseRule::Insensitive) => format!("s:{}", s.to_lowercase()),
        (Attr::Str(s), CaseRule::Sensitive) => format!("s:{s}"),
        (other, _) => format!("j:{}", other.to_json()),
    }
}
