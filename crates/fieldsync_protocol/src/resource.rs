//! Resources as seen by the system of record.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// A domain record: field name to JSON value.
///
/// In an Update payload a `null` value clears the field.
pub type Record = BTreeMap<String, Value>;

/// Authoritative version of a resource, assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// Returns the version that follows this one.
    #[must_use]
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifies a resource: `resource_type:resource_id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Logical collection, e.g. `farmer-record`.
    pub resource_type: String,
    /// Identifier within the collection.
    pub resource_id: String,
}

impl ResourceKey {
    /// Creates a key.
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.resource_id)
    }
}

impl FromStr for ResourceKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((t, id)) if !t.is_empty() && !id.is_empty() => Ok(Self::new(t, id)),
            _ => Err(ProtocolError::InvalidKey(s.to_string())),
        }
    }
}

/// Returns true if `resource_type` is a non-empty slug of ASCII letters,
/// digits, `-`, `_` and `.`, so it can appear as one URL path segment.
#[must_use]
pub fn is_valid_resource_type(resource_type: &str) -> bool {
    !resource_type.is_empty()
        && resource_type
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && resource_type != "."
        && resource_type != ".."
}

/// The server's current state of a live resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resource identity.
    pub key: ResourceKey,
    /// Current authoritative version.
    pub version: Version,
    /// Current field values.
    pub payload: Record,
    /// When the server last changed the resource.
    pub updated_at: Timestamp,
}

/// Applies an Update patch to a record.
///
/// Fields with a `null` value are removed; every other field is set.
#[must_use]
pub fn apply_patch(base: &Record, patch: &Record) -> Record {
    let mut out = base.clone();
    for (field, value) in patch {
        if value.is_null() {
            out.remove(field);
        } else {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}

/// Returns the fields whose value differs between `before` and `after`,
/// including fields present on only one side.
#[must_use]
pub fn changed_fields(before: &Record, after: &Record) -> BTreeSet<String> {
    before
        .keys()
        .chain(after.keys())
        .filter(|field| before.get(*field) != after.get(*field))
        .cloned()
        .collect()
}

/// Builds a patch that turns `current` into exactly `target`.
#[must_use]
pub fn replacement_patch(current: &Record, target: &Record) -> Record {
    let mut patch = target.clone();
    for field in current.keys() {
        if !target.contains_key(field) {
            patch.insert(field.clone(), Value::Null);
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn key_display_and_parse() {
        let key = ResourceKey::new("farm-plot", "plot-17");
        assert_eq!(key.to_string(), "farm-plot:plot-17");
        assert_eq!("farm-plot:plot-17".parse::<ResourceKey>().unwrap(), key);
        assert!("no-separator".parse::<ResourceKey>().is_err());
        assert!(":missing-type".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn patch_sets_and_clears_fields() {
        let base = record(json!({"name": "Amina", "district": "Kisumu", "acres": 4}));
        let patch = record(json!({"acres": 6, "district": null}));

        let out = apply_patch(&base, &patch);
        assert_eq!(out, record(json!({"name": "Amina", "acres": 6})));
    }

    #[test]
    fn changed_fields_covers_added_removed_and_modified() {
        let before = record(json!({"a": 1, "b": 2, "c": 3}));
        let after = record(json!({"a": 1, "b": 5, "d": 4}));

        let changed: Vec<_> = changed_fields(&before, &after).into_iter().collect();
        assert_eq!(changed, vec!["b", "c", "d"]);
    }

    #[test]
    fn replacement_patch_reaches_target() {
        let current = record(json!({"status": "draft", "notes": "x", "lat": 1.5}));
        let target = record(json!({"status": "final", "lat": 1.5}));

        let patch = replacement_patch(&current, &target);
        assert_eq!(patch.get("notes"), Some(&Value::Null));
        assert_eq!(apply_patch(&current, &patch), target);
    }

    #[test]
    fn resource_types_are_path_safe_slugs() {
        for ok in ["farmer-record", "farm_plot", "gps.coordinate", "v2"] {
            assert!(is_valid_resource_type(ok), "{ok}");
        }
        for bad in ["", "a/b", "a?b", "farm plot", "a:b", "..", "caf\u{e9}"] {
            assert!(!is_valid_resource_type(bad), "{bad}");
        }
    }

    #[test]
    fn version_ordering() {
        assert!(Version(5) < Version(6));
        assert_eq!(Version(5).next(), Version(6));
        assert_eq!(Version(6).to_string(), "v6");
    }

    fn arb_record() -> impl Strategy<Value = Record> {
        proptest::collection::btree_map("[a-e]", any::<i32>(), 0..5)
            .prop_map(|m| m.into_iter().map(|(k, v)| (k, json!(v))).collect())
    }

    proptest! {
        #[test]
        fn replacement_patch_always_reaches_target(current in arb_record(), target in arb_record()) {
            let patch = replacement_patch(&current, &target);
            prop_assert_eq!(apply_patch(&current, &patch), target.clone());
            prop_assert!(changed_fields(&target, &apply_patch(&current, &patch)).is_empty());
        }
    }
}
