//! Tag sets stamped on cloud resources.
//!
//! Tags double as ownership markers: every resource the reconciler creates
//! carries the owning ingress's name and namespace so a provider listing can
//! be matched back to its ingress without relying on the resource name.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Tag key carrying the owning ingress name.
pub const INGRESS_NAME_TAG: &str = "IngressName";
/// Tag key carrying the owning ingress namespace.
pub const NAMESPACE_TAG: &str = "Namespace";
/// Tag key carrying the cluster identifier.
pub const CLUSTER_TAG: &str = "kubernetes.io/cluster-name";
/// Tag key carrying the backend service name on target groups.
pub const SERVICE_NAME_TAG: &str = "ServiceName";
/// Tag key carrying the backend service port on target groups.
pub const SERVICE_PORT_TAG: &str = "ServicePort";

/// A single key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Ordered tags with unique keys. Equality ignores order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Tag>", into = "Vec<Tag>")]
pub struct TagSet(Vec<Tag>);

impl TagSet {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }

    /// Insert or overwrite a tag. An overwritten tag keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|tag| tag.key == key) {
            Some(existing) => existing.value = value,
            None => self.0.push(Tag { key, value }),
        }
    }

    /// Remove a tag, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let position = self.0.iter().position(|tag| tag.key == key)?;
        Some(self.0.remove(position).value)
    }

    /// Merge `other` into a copy of `self`; `other` wins on key collisions.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for tag in &other.0 {
            merged.insert(tag.key.clone(), tag.value.clone());
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|tag| tag.key.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tags to add or overwrite and keys to remove so that `current`
    /// becomes `self`.
    #[must_use]
    pub fn changes_from(&self, current: &Self) -> TagChanges {
        let upserts = self
            .0
            .iter()
            .filter(|tag| current.get(&tag.key) != Some(tag.value.as_str()))
            .cloned()
            .collect_vec();
        let removals = current
            .keys()
            .filter(|key| self.get(key).is_none())
            .map(str::to_owned)
            .collect_vec();
        TagChanges { upserts, removals }
    }

    fn sorted(&self) -> Vec<&Tag> {
        self.0.iter().sorted().collect()
    }
}

impl PartialEq for TagSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.sorted() == other.sorted()
    }
}

impl Eq for TagSet {}

impl From<Vec<Tag>> for TagSet {
    fn from(tags: Vec<Tag>) -> Self {
        let mut set = Self::new();
        for tag in tags {
            set.insert(tag.key, tag.value);
        }
        set
    }
}

impl From<TagSet> for Vec<Tag> {
    fn from(set: TagSet) -> Self {
        set.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (key, value) in iter {
            set.insert(key, value);
        }
        set
    }
}

/// Result of [`TagSet::changes_from`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagChanges {
    pub upserts: Vec<Tag>,
    pub removals: Vec<String>,
}

impl TagChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn tags() -> TagSet {
        [("tag1", "value1"), ("tag2", "value2")].into_iter().collect()
    }

    #[test]
    fn test_get_existing_and_missing() {
        let tags = tags();
        assert_eq!(tags.get("tag1"), Some("value1"));
        assert_eq!(tags.get("missing"), None);
    }

    #[test]
    fn test_equality_ignores_order() {
        let reversed: TagSet = [("tag2", "value2"), ("tag1", "value1")].into_iter().collect();
        assert_eq!(tags(), reversed);
    }

    #[test]
    fn test_equality_sees_value_changes() {
        let changed: TagSet = [("tag1", "value1"), ("tag2", "other")].into_iter().collect();
        assert_ne!(tags(), changed);
    }

    #[test]
    fn test_insert_overwrites_in_place() {
        let mut tags = tags();
        tags.insert("tag1", "new");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.keys().next(), Some("tag1"));
        assert_eq!(tags.get("tag1"), Some("new"));
    }

    #[test]
    fn test_merge_prefers_other() {
        let other: TagSet = [("tag2", "override"), ("tag3", "value3")].into_iter().collect();
        let merged = tags().merge(&other);
        assert_eq!(merged.get("tag1"), Some("value1"));
        assert_eq!(merged.get("tag2"), Some("override"));
        assert_eq!(merged.get("tag3"), Some("value3"));
    }

    #[test]
    fn test_duplicate_keys_collapse_on_deserialize() {
        let json = r#"[{"key":"a","value":"1"},{"key":"a","value":"2"}]"#;
        let tags: TagSet = serde_json::from_str(json).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.get("a"), Some("2"));
    }

    #[test]
    fn test_changes_from() {
        let current: TagSet = [("tag1", "old"), ("stale", "x")].into_iter().collect();
        let changes = tags().changes_from(&current);
        assert_eq!(changes.upserts.len(), 2);
        assert_eq!(changes.removals, vec!["stale".to_string()]);
        assert!(tags().changes_from(&tags()).is_empty());
    }
}
