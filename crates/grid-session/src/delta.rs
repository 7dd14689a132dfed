//! Per-attribute change tracking between saves.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::record::AttributeValue;

/// A pending change to one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaEntry {
    /// The attribute was written with this value.
    Set(AttributeValue),
    /// The attribute was removed.
    Removed,
}

/// The attributes changed on a session since it was last saved.
///
/// Removals are kept as [`DeltaEntry::Removed`] tombstones so they reach the
/// store as well. Writing a key twice keeps only the latest change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeDelta {
    changes: HashMap<String, DeltaEntry>,
}

impl AttributeDelta {
    /// An empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` now holds `value`.
    pub fn record_set(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.changes.insert(key.into(), DeltaEntry::Set(value));
    }

    /// Record that `key` was removed.
    pub fn record_removal(&mut self, key: impl Into<String>) {
        self.changes.insert(key.into(), DeltaEntry::Removed);
    }

    /// The pending change of `key`.
    pub fn get(&self, key: &str) -> Option<&DeltaEntry> {
        self.changes.get(key)
    }

    /// Whether `key` has a pending change.
    pub fn contains(&self, key: &str) -> bool {
        self.changes.contains_key(key)
    }

    /// Number of changed keys.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Names of the changed attributes, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.changes.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Iterate over the pending changes.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &DeltaEntry)> {
        self.changes.iter()
    }

    /// Apply the changes to an attribute map.
    pub fn apply_to(&self, attributes: &mut HashMap<String, AttributeValue>) {
        for (key, entry) in &self.changes {
            match entry {
                DeltaEntry::Set(value) => {
                    attributes.insert(key.clone(), value.clone());
                }
                DeltaEntry::Removed => {
                    attributes.remove(key);
                }
            }
        }
    }

    /// Forget all pending changes.
    pub fn clear(&mut self) {
        self.changes.clear();
    }

    /// A delta that writes every attribute in `attributes`.
    pub fn from_attributes(attributes: &HashMap<String, AttributeValue>) -> Self {
        Self {
            changes: attributes
                .iter()
                .map(|(k, v)| (k.clone(), DeltaEntry::Set(v.clone())))
                .collect(),
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Set(String, i64),
        Remove(String),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let key = "[a-d]";
        prop_oneof![
            (key, any::<i64>()).prop_map(|(k, v)| Op::Set(k, v)),
            key.prop_map(Op::Remove),
        ]
    }

    proptest! {
        /// Replaying the delta on the old attributes gives the same result as
        /// applying the writes directly.
        #[test]
        fn delta_replays_writes(
            base in proptest::collection::hash_map("[a-d]", any::<i64>(), 0..4),
            ops in proptest::collection::vec(op_strategy(), 0..16),
        ) {
            let old: HashMap<String, AttributeValue> =
                base.into_iter().map(|(k, v)| (k, AttributeValue::from(v))).collect();
            let mut direct = old.clone();
            let mut delta = AttributeDelta::new();

            for op in ops {
                match op {
                    Op::Set(k, v) => {
                        direct.insert(k.clone(), AttributeValue::from(v));
                        delta.record_set(k, AttributeValue::from(v));
                    }
                    Op::Remove(k) => {
                        direct.remove(&k);
                        delta.record_removal(k);
                    }
                }
            }

            let mut replayed = old;
            delta.apply_to(&mut replayed);
            prop_assert_eq!(replayed, direct);
        }
    }
}
