//! Compiled-in reserved identities. Built once on first use and never mutated.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::{Identity, Label, LabelArray, NumericIdentity, IDENTITY_UNKNOWN};

pub const RESERVED_HOST: NumericIdentity = NumericIdentity(1);
pub const RESERVED_WORLD: NumericIdentity = NumericIdentity(2);
pub const RESERVED_UNMANAGED: NumericIdentity = NumericIdentity(3);
pub const RESERVED_HEALTH: NumericIdentity = NumericIdentity(4);
pub const RESERVED_INIT: NumericIdentity = NumericIdentity(5);
pub const RESERVED_REMOTE_NODE: NumericIdentity = NumericIdentity(6);

const RESERVED_NAMES: &[(NumericIdentity, &str)] = &[
    (RESERVED_HOST, "host"),
    (RESERVED_WORLD, "world"),
    (RESERVED_UNMANAGED, "unmanaged"),
    (RESERVED_HEALTH, "health"),
    (RESERVED_INIT, "init"),
    (RESERVED_REMOTE_NODE, "remote-node"),
];

struct ReservedTable {
    by_id: FxHashMap<NumericIdentity, Identity>,
    by_labels: FxHashMap<LabelArray, NumericIdentity>,
}

static RESERVED: Lazy<ReservedTable> = Lazy::new(|| {
    let mut by_id = FxHashMap::default();
    let mut by_labels = FxHashMap::default();
    for (id, name) in RESERVED_NAMES {
        let labels = LabelArray::new([Label::reserved(*name)]);
        by_labels.insert(labels.clone(), *id);
        by_id.insert(*id, Identity::new(*id, labels));
    }
    ReservedTable { by_id, by_labels }
});

static UNKNOWN: Lazy<Identity> =
    Lazy::new(|| Identity::new(IDENTITY_UNKNOWN, LabelArray::new([Label::reserved("unknown")])));

pub fn lookup_reserved_identity(id: NumericIdentity) -> Option<&'static Identity> { RESERVED.by_id.get(&id) }

pub fn lookup_reserved_identity_by_labels(labels: &LabelArray) -> Option<&'static Identity> {
    RESERVED.by_labels.get(labels).and_then(|id| RESERVED.by_id.get(id))
}

pub fn reserved_identities() -> impl Iterator<Item = &'static Identity> { RESERVED.by_id.values() }

/// Fixed record returned for `IDENTITY_UNKNOWN`.
pub fn unknown_identity() -> &'static Identity { &UNKNOWN }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_agree() {
        let world = lookup_reserved_identity(RESERVED_WORLD).unwrap();
        assert_eq!(world.labels.to_strings(), vec!["reserved:world".to_string()]);
        let by_labels = lookup_reserved_identity_by_labels(&world.labels).unwrap();
        assert_eq!(by_labels.id, RESERVED_WORLD);
        assert_eq!(reserved_identities().count(), RESERVED_NAMES.len());
        let host = lookup_reserved_identity(RESERVED_HOST).unwrap();
        assert_eq!(host.labels.to_strings(), vec!["reserved:host".to_string()]);
    }

    #[test]
    fn unknown_is_not_in_table() {
        assert!(lookup_reserved_identity(IDENTITY_UNKNOWN).is_none());
        assert_eq!(unknown_identity().id, IDENTITY_UNKNOWN);
        assert!(lookup_reserved_identity_by_labels(&unknown_identity().labels).is_none());
    }
}
