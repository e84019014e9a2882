//! Identity and versioning shared by every replicated entity.
//!
//! An entity is identified by `(type, id)`. Its `version` records the owned
//! store version at which it was last written. Two references are the same
//! entity iff their [`EntityKey`]s match; they may differ in version and
//! payload.
//!
//! Entities are immutable values: stores stamp a *copy* with the new version,
//! they never edit the caller's value in place.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical clock scoped to one owned store. `0` means "nothing applied".
pub type Version = u64;

/// Identity of an entity: `(type, id)`.
///
/// Ordered by type, then id, so store iteration is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.entity_type, self.id)
    }
}

/// Contract implemented by every replicated entity.
///
/// The serde bounds let entities travel inside wire messages and the durable
/// replica backend without extra plumbing.
pub trait Reference:
    Clone + fmt::Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn entity_type(&self) -> &str;

    fn id(&self) -> &str;

    /// Version at which this entity was last written by the owned store.
    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type(), self.id())
    }

    /// Copy of this reference stamped with `version`.
    fn stamped(&self, version: Version) -> Self {
        let mut copy = self.clone();
        copy.set_version(version);
        copy
    }
}

/// Ready-made reference: identity fields plus an open JSON payload.
///
/// On the wire the payload fields sit alongside `type`, `id` and `version`:
///
/// ```json
/// { "type": "user", "id": "1", "version": 2, "name": "Ada", "age": 36 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
    #[serde(default)]
    pub version: Version,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    /// A record with an empty payload at version 0.
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            version: 0,
            payload: serde_json::Map::new(),
        }
    }

    /// Builder-style payload field.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.payload.get(field)
    }
}

impl Reference for Record {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("user", "42");
        assert_eq!(key.to_string(), "user::42");
    }

    #[test]
    fn test_entity_key_ordering() {
        let mut keys = vec![
            EntityKey::new("user", "2"),
            EntityKey::new("post", "9"),
            EntityKey::new("user", "1"),
        ];
        keys.sort();
        assert_eq!(keys[0], EntityKey::new("post", "9"));
        assert_eq!(keys[1], EntityKey::new("user", "1"));
        assert_eq!(keys[2], EntityKey::new("user", "2"));
    }

    #[test]
    fn test_same_entity_ignores_version_and_payload() {
        let a = Record::new("user", "1").with("name", "Ada");
        let b = Record::new("user", "1").with("name", "Grace").stamped(7);
        assert_eq!(a.key(), b.key());
        assert_ne!(a, b);
    }

    #[test]
    fn test_stamped_leaves_original_untouched() {
        let original = Record::new("user", "1");
        let stamped = original.stamped(3);
        assert_eq!(original.version, 0);
        assert_eq!(stamped.version, 3);
    }

    #[test]
    fn test_record_wire_shape_is_flat() {
        let record = Record::new("user", "1").with("name", "Ada").with("age", 36).stamped(2);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({ "type": "user", "id": "1", "version": 2, "name": "Ada", "age": 36 })
        );
    }

    #[test]
    fn test_record_version_defaults_to_zero() {
        let record: Record = serde_json::from_value(json!({ "type": "post", "id": "p1", "content": "hi" })).unwrap();
        assert_eq!(record.version, 0);
        assert_eq!(record.get("content"), Some(&json!("hi")));
    }

    #[test]
    fn test_record_requires_identity() {
        let missing_id = serde_json::from_value::<Record>(json!({ "type": "post" }));
        assert!(missing_id.is_err());
    }
}
