//! idcache core types: numeric identities, label arrays and the identity cache view.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod allocator;
pub mod config;
pub mod reserved;

pub use allocator::{
    AllocatorError, AllocatorEvent, AllocatorKey, EventKind, EventReceiver, EventSender, IdentityAllocator,
    LocalIdentityStore,
};
pub use reserved::{
    lookup_reserved_identity, lookup_reserved_identity_by_labels, reserved_identities, unknown_identity,
};

/// Compact numeric stand-in for a full label set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NumericIdentity(pub u32);

/// Sentinel for an identity that could not be resolved.
pub const IDENTITY_UNKNOWN: NumericIdentity = NumericIdentity(0);
/// First identity handed out by the cluster-wide allocator; everything below is reserved.
pub const MINIMAL_ALLOCATION_IDENTITY: NumericIdentity = NumericIdentity(256);
pub const MAXIMAL_ALLOCATION_IDENTITY: NumericIdentity = NumericIdentity(65_535);
/// Bit marking identities that only have meaning on the local node.
pub const LOCAL_IDENTITY_FLAG: u32 = 1 << 24;

impl NumericIdentity {
    pub const fn get(self) -> u32 { self.0 }

    pub fn is_reserved(self) -> bool { self.0 < MINIMAL_ALLOCATION_IDENTITY.0 }

    pub fn has_local_scope(self) -> bool { self.0 & LOCAL_IDENTITY_FLAG != 0 }
}

impl From<u32> for NumericIdentity {
    fn from(v: u32) -> Self { Self(v) }
}

impl fmt::Display for NumericIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid numeric identity '{input}'")]
pub struct ParseIdentityError {
    input: String,
}

impl FromStr for NumericIdentity {
    type Err = ParseIdentityError;

    /// Accepts decimal or `0x`-prefixed hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => t.parse::<u32>(),
        };
        parsed.map(Self).map_err(|_| ParseIdentityError { input: s.to_string() })
    }
}

/// Well-known label sources.
pub mod source {
    pub const RESERVED: &str = "reserved";
    pub const K8S: &str = "k8s";
    pub const CIDR: &str = "cidr";
    pub const UNSPEC: &str = "unspec";
}

/// A single provenance-tagged label. Field order drives the derived ordering: key, then source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub key: String,
    pub source: String,
    #[serde(default)]
    pub value: String,
}

impl Label {
    pub fn new(source: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), source: source.into(), value: value.into() }
    }

    pub fn reserved(key: impl Into<String>) -> Self { Self::new(source::RESERVED, key, "") }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.key)?;
        if !self.value.is_empty() {
            write!(f, "={}", self.value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid label '{0}': expected [source:]key[=value]")]
pub struct ParseLabelError(String);

impl FromStr for Label {
    type Err = ParseLabelError;

    /// Minimal `[source:]key[=value]` form; a missing source becomes `unspec`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, value) = match s.split_once('=') {
            Some((h, v)) => (h, v),
            None => (s, ""),
        };
        let (src, key) = match head.split_once(':') {
            Some(("", _)) => return Err(ParseLabelError(s.to_string())),
            Some((src, key)) => (src, key),
            None => (source::UNSPEC, head),
        };
        if key.is_empty() {
            return Err(ParseLabelError(s.to_string()));
        }
        Ok(Label::new(src, key, value))
    }
}

/// Ordered label sequence. Construction sorts and dedups so equal content compares and hashes equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Label>", into = "Vec<Label>")]
pub struct LabelArray(SmallVec<[Label; 4]>);

impl LabelArray {
    pub fn new(labels: impl IntoIterator<Item = Label>) -> Self {
        let mut v: SmallVec<[Label; 4]> = labels.into_iter().collect();
        v.sort_unstable();
        v.dedup();
        Self(v)
    }

    pub fn empty() -> Self { Self(SmallVec::new()) }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &Label> { self.0.iter() }

    /// Rendered `source:key=value` strings in array order.
    pub fn to_strings(&self) -> Vec<String> { self.iter().map(|l| l.to_string()).collect() }
}

impl FromIterator<Label> for LabelArray {
    fn from_iter<I: IntoIterator<Item = Label>>(iter: I) -> Self { Self::new(iter) }
}

impl From<Vec<Label>> for LabelArray {
    fn from(v: Vec<Label>) -> Self { Self::new(v) }
}

impl From<LabelArray> for Vec<Label> {
    fn from(a: LabelArray) -> Self { a.0.into_vec() }
}

impl fmt::Display for LabelArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, l) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", l)?;
        }
        Ok(())
    }
}

/// Numeric identity paired with its labels. Plain value; clone freely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: NumericIdentity,
    pub labels: LabelArray,
}

impl Identity {
    pub fn new(id: NumericIdentity, labels: LabelArray) -> Self { Self { id, labels } }

    pub fn model(&self) -> IdentityModel {
        IdentityModel { id: self.id.get(), labels: self.labels.to_strings() }
    }
}

/// Presentation record for listing identities to users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityModel {
    pub id: u32,
    pub labels: Vec<String>,
}

/// Materialized view of identity → labels. Never the source of truth.
pub type IdentityCache = FxHashMap<NumericIdentity, LabelArray>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_array_is_canonical() {
        let a = LabelArray::new([Label::new("k8s", "b", "2"), Label::new("k8s", "a", "1")]);
        let b = LabelArray::new([Label::new("k8s", "a", "1"), Label::new("k8s", "b", "2"), Label::new("k8s", "a", "1")]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.to_strings(), vec!["k8s:a=1".to_string(), "k8s:b=2".to_string()]);
    }

    #[test]
    fn parse_labels() {
        assert_eq!("k8s:app=foo".parse::<Label>().unwrap(), Label::new("k8s", "app", "foo"));
        assert_eq!("app=foo".parse::<Label>().unwrap(), Label::new(source::UNSPEC, "app", "foo"));
        assert_eq!("reserved:world".parse::<Label>().unwrap(), Label::reserved("world"));
        assert!("k8s:=x".parse::<Label>().is_err());
        assert!("".parse::<Label>().is_err());
        assert!(":foo".parse::<Label>().is_err());
        assert!(":foo=bar".parse::<Label>().is_err());
    }

    #[test]
    fn parse_numeric_identity() {
        assert_eq!("42".parse::<NumericIdentity>().unwrap(), NumericIdentity(42));
        assert_eq!("0x100".parse::<NumericIdentity>().unwrap(), NumericIdentity(256));
        assert!("-1".parse::<NumericIdentity>().is_err());
        assert!("abc".parse::<NumericIdentity>().is_err());
    }

    #[test]
    fn identity_scopes() {
        assert!(NumericIdentity(2).is_reserved());
        assert!(!MINIMAL_ALLOCATION_IDENTITY.is_reserved());
        assert!(NumericIdentity(LOCAL_IDENTITY_FLAG | 1).has_local_scope());
        assert!(!NumericIdentity(300).has_local_scope());
    }

    #[test]
    fn label_array_serde_sorts() {
        let a: LabelArray = serde_json::from_str(
            r#"[{"key":"z","source":"k8s","value":"1"},{"key":"a","source":"k8s"}]"#,
        )
        .unwrap();
        assert_eq!(a.to_string(), "k8s:a,k8s:z=1");
    }
}
