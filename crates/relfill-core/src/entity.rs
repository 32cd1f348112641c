//! Entity instances and shared handles.
//!
//! An entity is a typed bag of scalar values plus one relationship slot per
//! relation property. Entities are shared through [`EntityRef`], an
//! `Arc<RwLock<Entity>>` compared by identity: the identity map hands out one
//! handle per primary key, so two handles to the same row are the same
//! pointer.

use crate::relation::{Collection, RelationValue};
use crate::value::{PrimaryKey, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// A single entity instance.
#[derive(Debug)]
pub struct Entity {
    entity_type: String,
    primary_key: PrimaryKey,
    scalars: BTreeMap<String, Value>,
    relations: BTreeMap<String, RelationValue>,
    initialized: bool,
    populated: bool,
}

impl Entity {
    /// Create an uninitialized entity (a stub known only by its key).
    pub fn new(entity_type: impl Into<String>, primary_key: PrimaryKey) -> Self {
        Self {
            entity_type: entity_type.into(),
            primary_key,
            scalars: BTreeMap::new(),
            relations: BTreeMap::new(),
            initialized: false,
            populated: false,
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    /// A scalar property value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.scalars.get(name)
    }

    /// Set a scalar property value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.scalars.insert(name.into(), value.into());
    }

    pub fn scalars(&self) -> &BTreeMap<String, Value> {
        &self.scalars
    }

    /// The relationship slot for a property (`Unset` if never assigned).
    pub fn relation(&self, name: &str) -> &RelationValue {
        static UNSET: RelationValue = RelationValue::Unset;
        self.relations.get(name).unwrap_or(&UNSET)
    }

    pub fn relation_mut(&mut self, name: &str) -> Option<&mut RelationValue> {
        self.relations.get_mut(name)
    }

    pub fn set_relation(&mut self, name: impl Into<String>, value: RelationValue) {
        self.relations.insert(name.into(), value);
    }

    /// The collection stored under `name`, if the slot holds one.
    pub fn collection(&self, name: &str) -> Option<&Collection> {
        match self.relations.get(name) {
            Some(RelationValue::Collection(c)) => Some(c),
            _ => None,
        }
    }

    pub fn collection_mut(&mut self, name: &str) -> Option<&mut Collection> {
        match self.relations.get_mut(name) {
            Some(RelationValue::Collection(c)) => Some(c),
            _ => None,
        }
    }

    /// Drop every relationship slot.
    pub fn clear_relations(&mut self) {
        self.relations.clear();
    }

    /// Whether the entity's own data has been loaded.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }

    /// Whether this entity was reached through a populate request.
    pub fn is_populated(&self) -> bool {
        self.populated
    }

    pub fn set_populated(&mut self, populated: bool) {
        self.populated = populated;
    }
}

/// Shared handle to an entity, compared and hashed by identity.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Read access. A poisoned lock is recovered: entity state is plain data.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakEntityRef {
        WeakEntityRef(Arc::downgrade(&self.0))
    }

    pub fn entity_type(&self) -> String {
        self.read().entity_type.clone()
    }

    pub fn primary_key(&self) -> PrimaryKey {
        self.read().primary_key.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Scalar value by name, cloned.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.read().scalars.get(name).cloned()
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Relations may cycle back to this entity, so only print the key.
        match self.0.try_read() {
            Ok(entity) => write!(f, "EntityRef({}#{})", entity.entity_type, entity.primary_key),
            Err(_) => write!(f, "EntityRef(<locked>)"),
        }
    }
}

/// Non-owning handle, used for collection back-references.
#[derive(Clone, Default)]
pub struct WeakEntityRef(Weak<RwLock<Entity>>);

impl WeakEntityRef {
    pub fn upgrade(&self) -> Option<EntityRef> {
        self.0.upgrade().map(EntityRef)
    }

    /// Does this handle point at `entity`?
    pub fn points_to(&self, entity: &EntityRef) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&entity.0))
    }
}

impl fmt::Debug for WeakEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(entity) => write!(f, "Weak({entity:?})"),
            None => write!(f, "Weak(<dropped>)"),
        }
    }
}

/// Insertion-ordered set of entities, deduplicated by identity.
#[derive(Debug, Clone, Default)]
pub struct EntitySet {
    items: Vec<EntityRef>,
    seen: HashSet<EntityRef>,
}

impl EntitySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity; returns false if it was already present.
    pub fn insert(&mut self, entity: EntityRef) -> bool {
        if self.seen.insert(entity.clone()) {
            self.items.push(entity);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.seen.contains(entity)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EntityRef> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<EntityRef> {
        self.items
    }
}

impl Extend<EntityRef> for EntitySet {
    fn extend<I: IntoIterator<Item = EntityRef>>(&mut self, iter: I) {
        for entity in iter {
            self.insert(entity);
        }
    }
}

impl FromIterator<EntityRef> for EntitySet {
    fn from_iter<I: IntoIterator<Item = EntityRef>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality() {
        let a = EntityRef::new(Entity::new("Author", PrimaryKey::from(1_i64)));
        let b = EntityRef::new(Entity::new("Author", PrimaryKey::from(1_i64)));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_entity_set_dedups_and_keeps_order() {
        let a = EntityRef::new(Entity::new("Tag", PrimaryKey::from(1_i64)));
        let b = EntityRef::new(Entity::new("Tag", PrimaryKey::from(2_i64)));
        let set: EntitySet = vec![b.clone(), a.clone(), b.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(set.into_vec(), vec![b, a]);
    }

    #[test]
    fn test_weak_points_to() {
        let a = EntityRef::new(Entity::new("Author", PrimaryKey::from(1_i64)));
        let weak = a.downgrade();
        assert!(weak.points_to(&a));
        assert_eq!(weak.upgrade(), Some(a.clone()));
        drop(a);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_scalars_and_flags() {
        let entity = EntityRef::new(Entity::new("Book", PrimaryKey::from(5_i64)));
        {
            let mut book = entity.write();
            book.set("title", "Dune");
            book.set_initialized(true);
        }
        assert_eq!(entity.get("title"), Some(Value::from("Dune")));
        assert!(entity.is_initialized());
        assert_eq!(format!("{entity:?}"), "EntityRef(Book#5)");
        assert!(entity.read().relation("author").is_unset());
    }
}
