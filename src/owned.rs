//! The authoritative, version-generating store.
//!
//! The owned store is the only component that assigns versions. Every
//! mutating call bumps the version exactly once, no matter how many entities
//! it touches:
//!
//! ```text
//! put(a)            → v1   a@1
//! put_many([b, c])  → v2   b@2 c@2
//! delete(a)         → v3   tombstone a@3
//! get_changes(2)    → { version: 3, update: [b@2, c@2], delete: [a@3] }
//! ```
//!
//! # Tombstones
//!
//! Removals are kept as tombstones so replicas that missed them still learn
//! about them on catch-up. There is one tombstone per key (the latest
//! removal). Re-putting a key clears its tombstone, otherwise a replica
//! catching up from before both events would apply the update and then the
//! stale delete. Tombstones are never compacted.
//!
//! # Concurrency
//!
//! Methods take `&mut self`; callers serialize access (the coordinator holds
//! the store behind a single mutex together with its broadcast step).

use crate::metrics;
use crate::protocol::ChangeSet;
use crate::reference::{EntityKey, Reference, Version};
use std::collections::BTreeMap;
use tracing::trace;

/// A retained removal record.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone<R> {
    /// Version of the delete call that produced this tombstone.
    pub version: Version,
    /// The removed reference, stamped with `version`.
    pub reference: R,
}

/// In-memory authoritative store.
#[derive(Debug, Clone)]
pub struct OwnedStore<R: Reference> {
    version: Version,
    entities: BTreeMap<EntityKey, R>,
    tombstones: BTreeMap<EntityKey, Tombstone<R>>,
}

impl<R: Reference> Default for OwnedStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Reference> OwnedStore<R> {
    /// Empty store at version 0.
    pub fn new() -> Self {
        Self {
            version: 0,
            entities: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    /// Current high-water mark.
    pub fn get_version(&self) -> Version {
        self.version
    }

    fn increment_version(&mut self) -> Version {
        self.version += 1;
        metrics::set_owned_version(self.version);
        self.version
    }

    /// Store one reference under a new version. Returns the stamped copy.
    pub fn put(&mut self, reference: R) -> R {
        let version = self.increment_version();
        metrics::record_mutation("put", 1);
        self.insert_stamped(reference, version)
    }

    /// Store a batch under a single new version.
    pub fn put_many(&mut self, references: impl IntoIterator<Item = R>) -> Vec<R> {
        let version = self.increment_version();
        let stamped: Vec<R> = references
            .into_iter()
            .map(|reference| self.insert_stamped(reference, version))
            .collect();
        metrics::record_mutation("put", stamped.len());
        stamped
    }

    fn insert_stamped(&mut self, reference: R, version: Version) -> R {
        let stamped = reference.stamped(version);
        let key = stamped.key();
        trace!(key = %key, version, "put");
        self.tombstones.remove(&key);
        self.entities.insert(key, stamped.clone());
        stamped
    }

    /// Remove one reference under a new version.
    ///
    /// Absent keys still bump the version and still get a tombstone: the
    /// removal is itself an event catch-up consumers observe.
    pub fn delete(&mut self, reference: &R) -> Tombstone<R> {
        let version = self.increment_version();
        metrics::record_mutation("delete", 1);
        self.remove_stamped(reference, version)
    }

    /// Remove a batch under a single new version.
    pub fn delete_many<'a>(&mut self, references: impl IntoIterator<Item = &'a R>) -> Vec<Tombstone<R>> {
        let version = self.increment_version();
        let tombstones: Vec<Tombstone<R>> = references
            .into_iter()
            .map(|reference| self.remove_stamped(reference, version))
            .collect();
        metrics::record_mutation("delete", tombstones.len());
        tombstones
    }

    fn remove_stamped(&mut self, reference: &R, version: Version) -> Tombstone<R> {
        let key = reference.key();
        let existed = self.entities.remove(&key).is_some();
        trace!(key = %key, version, existed, "delete");

        let tombstone = Tombstone {
            version,
            reference: reference.stamped(version),
        };
        self.tombstones.insert(key, tombstone.clone());
        tombstone
    }

    /// Live entities with `version >= from_version`. `0` returns everything.
    pub fn get_all(&self, from_version: Version) -> Vec<R> {
        self.entities
            .values()
            .filter(|entity| entity.version() >= from_version)
            .cloned()
            .collect()
    }

    /// Look up a live entity. Absence is not an error.
    pub fn get_one(&self, key: &EntityKey) -> Option<&R> {
        self.entities.get(key)
    }

    /// Tombstones with `version >= from_version`.
    pub fn get_deletes(&self, from_version: Version) -> Vec<Tombstone<R>> {
        self.tombstones
            .values()
            .filter(|tombstone| tombstone.version >= from_version)
            .cloned()
            .collect()
    }

    /// Delta from `from_version` to the current version.
    pub fn get_changes(&self, from_version: Version) -> ChangeSet<R> {
        ChangeSet {
            version: self.version,
            update: self.get_all(from_version),
            delete: self
                .get_deletes(from_version)
                .into_iter()
                .map(|tombstone| tombstone.reference)
                .collect(),
        }
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Number of retained tombstones.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }
}
