//! Identity map: one entity instance per (type, primary key).
//!
//! Every row the store hands out goes through this map, so loading the same
//! row twice, or reaching it through two different relations, yields the
//! same [`EntityRef`]. Entities known only by key are kept as uninitialized
//! stubs until their row is merged.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let stub = map.get_or_stub("Author", &PrimaryKey::from(1_i64));
//! let again = map.get_or_stub("Author", &PrimaryKey::from(1_i64));
//! assert!(stub.ptr_eq(&again));
//! assert!(!stub.is_initialized());
//! ```

use relfill_core::{Entity, EntityRef, PrimaryKey};
use std::collections::HashMap;

/// Key identifying an entity instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub entity_type: String,
    pub primary_key: PrimaryKey,
}

impl ObjectKey {
    pub fn new(entity_type: impl Into<String>, primary_key: PrimaryKey) -> Self {
        Self {
            entity_type: entity_type.into(),
            primary_key,
        }
    }

    /// Key of an existing entity.
    pub fn of(entity: &EntityRef) -> Self {
        let guard = entity.read();
        Self::new(guard.entity_type(), guard.primary_key().clone())
    }
}

/// Identity map holding strong references to every known entity.
#[derive(Debug, Default)]
pub struct IdentityMap {
    objects: HashMap<ObjectKey, EntityRef>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The instance for `entity_type` / `primary_key`, if known.
    pub fn get(&self, entity_type: &str, primary_key: &PrimaryKey) -> Option<EntityRef> {
        self.objects
            .get(&ObjectKey::new(entity_type, primary_key.clone()))
            .cloned()
    }

    /// The known instance, or a new uninitialized stub registered under the key.
    pub fn get_or_stub(&mut self, entity_type: &str, primary_key: &PrimaryKey) -> EntityRef {
        self.objects
            .entry(ObjectKey::new(entity_type, primary_key.clone()))
            .or_insert_with(|| EntityRef::new(Entity::new(entity_type, primary_key.clone())))
            .clone()
    }

    /// Register an instance, replacing any previous one under the same key.
    pub fn insert(&mut self, entity: EntityRef) -> Option<EntityRef> {
        self.objects.insert(ObjectKey::of(&entity), entity)
    }

    pub fn remove(&mut self, entity_type: &str, primary_key: &PrimaryKey) -> Option<EntityRef> {
        self.objects
            .remove(&ObjectKey::new(entity_type, primary_key.clone()))
    }

    pub fn contains(&self, entity_type: &str, primary_key: &PrimaryKey) -> bool {
        self.objects
            .contains_key(&ObjectKey::new(entity_type, primary_key.clone()))
    }

    /// All tracked instances.
    pub fn entities(&self) -> impl Iterator<Item = &EntityRef> {
        self.objects.values()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_is_shared() {
        let mut map = IdentityMap::new();
        let pk = PrimaryKey::from(1_i64);

        let stub = map.get_or_stub("Author", &pk);
        let again = map.get_or_stub("Author", &pk);
        assert!(stub.ptr_eq(&again));
        assert!(!stub.is_initialized());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_keys_are_per_type() {
        let mut map = IdentityMap::new();
        let pk = PrimaryKey::from(1_i64);

        let author = map.get_or_stub("Author", &pk);
        let book = map.get_or_stub("Book", &pk);
        assert!(!author.ptr_eq(&book));
        assert!(map.contains("Book", &pk));
        assert!(!map.contains("Review", &pk));
    }

    #[test]
    fn test_modifications_visible() {
        let mut map = IdentityMap::new();
        let pk = PrimaryKey::from(1_i64);

        let first = map.get_or_stub("Author", &pk);
        first.write().set("name", "Ann");
        let second = map.get("Author", &pk).unwrap();
        assert_eq!(second.get("name"), Some(relfill_core::Value::from("Ann")));
    }

    #[test]
    fn test_insert_and_remove() {
        let mut map = IdentityMap::new();
        let pk = PrimaryKey::from(7_i64);
        let entity = EntityRef::new(Entity::new("Tag", pk.clone()));

        assert!(map.insert(entity.clone()).is_none());
        assert!(map.get("Tag", &pk).unwrap().ptr_eq(&entity));
        assert!(map.remove("Tag", &pk).is_some());
        assert!(map.is_empty());
    }
}
