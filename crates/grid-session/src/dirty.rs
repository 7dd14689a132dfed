//! Strategies deciding whether an attribute write makes a session dirty.
//!
//! Every `set_attribute`/`remove_attribute` call on a [`SessionRecord`]
//! consults the configured [`DirtyPredicate`] with the previous and the new
//! value. Only writes judged dirty are recorded in the attribute delta and
//! shipped to the store on the next save.
//!
//! [`SessionRecord`]: crate::record::SessionRecord

use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::record::AttributeValue;

/// Decides whether replacing `old` with `new` must be persisted.
///
/// `None` stands for an absent attribute on either side.
pub trait DirtyPredicate: Debug + Send + Sync {
    fn is_dirty(&self, old: Option<&AttributeValue>, new: Option<&AttributeValue>) -> bool;
}

/// Dirty iff the new value is not equal to the old one.
///
/// A removal is dirty only when there was a value to remove.
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualsDirtyPredicate;

impl DirtyPredicate for EqualsDirtyPredicate {
    fn is_dirty(&self, old: Option<&AttributeValue>, new: Option<&AttributeValue>) -> bool {
        match new {
            Some(new) => old != Some(new),
            None => old.is_some(),
        }
    }
}

/// Treats every write as a new value, whatever it compares equal to.
///
/// Use this for attribute values mutated in place by the application, where
/// equality against the stored copy says nothing about staleness.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityDirtyPredicate;

impl DirtyPredicate for IdentityDirtyPredicate {
    fn is_dirty(&self, _old: Option<&AttributeValue>, _new: Option<&AttributeValue>) -> bool {
        true
    }
}

/// Never marks anything dirty; attribute changes are kept local to the instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverDirtyPredicate;

impl DirtyPredicate for NeverDirtyPredicate {
    fn is_dirty(&self, _old: Option<&AttributeValue>, _new: Option<&AttributeValue>) -> bool {
        false
    }
}

/// Built-in predicate selector used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirtyPredicateKind {
    #[default]
    Equals,
    Identity,
    Never,
}

impl DirtyPredicateKind {
    /// Instantiate the selected predicate.
    pub fn build(self) -> Arc<dyn DirtyPredicate> {
        match self {
            DirtyPredicateKind::Equals => Arc::new(EqualsDirtyPredicate),
            DirtyPredicateKind::Identity => Arc::new(IdentityDirtyPredicate),
            DirtyPredicateKind::Never => Arc::new(NeverDirtyPredicate),
        }
    }
}

impl std::fmt::Display for DirtyPredicateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirtyPredicateKind::Equals => write!(f, "equals"),
            DirtyPredicateKind::Identity => write!(f, "identity"),
            DirtyPredicateKind::Never => write!(f, "never"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equals_predicate() {
        let p = EqualsDirtyPredicate;
        let a = json!("a");
        let b = json!("b");

        assert!(!p.is_dirty(Some(&a), Some(&a.clone())));
        assert!(p.is_dirty(Some(&a), Some(&b)));
        assert!(p.is_dirty(None, Some(&a)));
        assert!(p.is_dirty(Some(&a), None));
        assert!(!p.is_dirty(None, None));
    }

    #[test]
    fn test_identity_and_never() {
        let v = json!({"count": 1});
        assert!(IdentityDirtyPredicate.is_dirty(Some(&v), Some(&v)));
        assert!(!NeverDirtyPredicate.is_dirty(None, Some(&v)));
    }

    #[test]
    fn test_kind_parses_lowercase() {
        let kind: DirtyPredicateKind = serde_json::from_str("\"identity\"").unwrap();
        assert_eq!(kind, DirtyPredicateKind::Identity);
        assert_eq!(kind.to_string(), "identity");
    }
}
