//! Relationship containers: references, collections and the per-field slot.

use crate::entity::{EntityRef, WeakEntityRef};
use crate::value::PrimaryKey;

/// The value of one relationship field on an entity.
#[derive(Debug, Clone, Default)]
pub enum RelationValue {
    /// Nothing known about the relation (never loaded or not applicable).
    #[default]
    Unset,
    /// Known to be empty: a NULL foreign key or no owning row.
    Empty,
    /// To-one relation held inline. The entity may be an uninitialized stub.
    Entity(EntityRef),
    /// To-one relation held in a wrapper.
    Reference(Reference),
    /// To-many relation.
    Collection(Collection),
}

/// Owned copy of what a to-one slot points at, taken so callers can drop
/// the owner's lock before comparing against other entities.
#[derive(Debug, Clone)]
pub enum RelationTarget {
    Entity(EntityRef),
    Identifier(PrimaryKey),
}

impl RelationTarget {
    /// Does this target designate `entity` (whose key is `key`)?
    pub fn designates(&self, entity: &EntityRef, key: &PrimaryKey) -> bool {
        match self {
            RelationTarget::Entity(target) => target.ptr_eq(entity),
            RelationTarget::Identifier(pk) => pk == key,
        }
    }

    /// The key of the designated entity.
    pub fn key(&self) -> PrimaryKey {
        match self {
            RelationTarget::Entity(target) => target.primary_key(),
            RelationTarget::Identifier(pk) => pk.clone(),
        }
    }
}

impl RelationValue {
    pub fn is_unset(&self) -> bool {
        matches!(self, RelationValue::Unset)
    }

    /// Whether the slot holds anything (a refresh reloads only set slots).
    pub fn is_set(&self) -> bool {
        !matches!(self, RelationValue::Unset | RelationValue::Empty)
    }

    /// The to-one target of this slot, unwrapping references.
    pub fn to_one_target(&self) -> Option<RelationTarget> {
        match self {
            RelationValue::Entity(entity) => Some(RelationTarget::Entity(entity.clone())),
            RelationValue::Reference(reference) => Some(reference.target()),
            _ => None,
        }
    }

    /// The entities currently linked through this slot, without loading.
    pub fn linked_entities(&self) -> Vec<EntityRef> {
        match self {
            RelationValue::Entity(entity) => vec![entity.clone()],
            RelationValue::Reference(reference) => reference.unwrap().into_iter().collect(),
            RelationValue::Collection(collection) => collection.items().to_vec(),
            RelationValue::Unset | RelationValue::Empty => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
enum ReferenceTarget {
    Entity(EntityRef),
    Identifier {
        entity_type: String,
        primary_key: PrimaryKey,
    },
}

/// A wrapper around a to-one relation.
///
/// Holds either a resolved entity or just its identifier. The reference is
/// initialized once it holds an entity whose data is loaded.
#[derive(Debug, Clone)]
pub struct Reference {
    target: ReferenceTarget,
    populated: bool,
}

impl Reference {
    /// Reference to a known entity instance.
    pub fn to_entity(entity: EntityRef) -> Self {
        Self {
            target: ReferenceTarget::Entity(entity),
            populated: false,
        }
    }

    /// Reference known only by type and key.
    pub fn to_identifier(entity_type: impl Into<String>, primary_key: PrimaryKey) -> Self {
        Self {
            target: ReferenceTarget::Identifier {
                entity_type: entity_type.into(),
                primary_key,
            },
            populated: false,
        }
    }

    /// Whether the target entity is present and loaded.
    pub fn is_initialized(&self) -> bool {
        match &self.target {
            ReferenceTarget::Entity(entity) => entity.is_initialized(),
            ReferenceTarget::Identifier { .. } => false,
        }
    }

    /// The resolved entity, if any.
    pub fn unwrap(&self) -> Option<EntityRef> {
        match &self.target {
            ReferenceTarget::Entity(entity) => Some(entity.clone()),
            ReferenceTarget::Identifier { .. } => None,
        }
    }

    /// Key of the referenced entity.
    pub fn identifier(&self) -> PrimaryKey {
        match &self.target {
            ReferenceTarget::Entity(entity) => entity.primary_key(),
            ReferenceTarget::Identifier { primary_key, .. } => primary_key.clone(),
        }
    }

    pub fn target(&self) -> RelationTarget {
        match &self.target {
            ReferenceTarget::Entity(entity) => RelationTarget::Entity(entity.clone()),
            ReferenceTarget::Identifier { primary_key, .. } => {
                RelationTarget::Identifier(primary_key.clone())
            }
        }
    }

    /// Type name of the referenced entity, when only the identifier is held.
    pub fn identifier_type(&self) -> Option<&str> {
        match &self.target {
            ReferenceTarget::Entity(_) => None,
            ReferenceTarget::Identifier { entity_type, .. } => Some(entity_type),
        }
    }

    /// Point the reference at a resolved entity, keeping the populated marker.
    pub fn set(&mut self, entity: EntityRef) {
        self.target = ReferenceTarget::Entity(entity);
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }

    pub fn set_populated(&mut self, populated: bool) {
        self.populated = populated;
    }
}

/// A to-many relation owned by one entity.
///
/// Items are kept in insertion order without duplicates (by identity). A
/// collection only becomes initialized through [`hydrate`](Self::hydrate);
/// [`set_references`](Self::set_references) records members known by key
/// without marking the collection loaded.
#[derive(Debug, Clone)]
pub struct Collection {
    owner: WeakEntityRef,
    property: String,
    items: Vec<EntityRef>,
    initialized: bool,
    populated: bool,
}

impl Collection {
    /// Empty, uninitialized collection for `owner.property`.
    pub fn new(owner: &EntityRef, property: impl Into<String>) -> Self {
        Self::with_owner(owner.downgrade(), property)
    }

    /// Same as [`new`](Self::new) when only a weak owner handle is at hand.
    pub fn with_owner(owner: WeakEntityRef, property: impl Into<String>) -> Self {
        Self {
            owner,
            property: property.into(),
            items: Vec::new(),
            initialized: false,
            populated: false,
        }
    }

    pub fn owner(&self) -> Option<EntityRef> {
        self.owner.upgrade()
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn items(&self) -> &[EntityRef] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Identity membership test.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.items.iter().any(|item| item.ptr_eq(entity))
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }

    pub fn set_populated(&mut self, populated: bool) {
        self.populated = populated;
    }

    /// Replace the contents with loaded items and mark the collection
    /// initialized.
    pub fn hydrate(&mut self, items: impl IntoIterator<Item = EntityRef>) {
        self.items.clear();
        self.push_unique(items);
        self.initialized = true;
    }

    /// Record members known only by reference. Leaves the initialized flag
    /// untouched.
    pub fn set_references(&mut self, items: impl IntoIterator<Item = EntityRef>) {
        self.items.clear();
        self.push_unique(items);
    }

    /// Append an item unless already present.
    pub fn add(&mut self, item: EntityRef) -> bool {
        if self.contains(&item) {
            return false;
        }
        self.items.push(item);
        true
    }

    fn push_unique(&mut self, items: impl IntoIterator<Item = EntityRef>) {
        for item in items {
            self.add(item);
        }
    }
}
