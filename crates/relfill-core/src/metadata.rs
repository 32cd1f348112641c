//! Entity metadata: properties, relation kinds and the registry that owns them.
//!
//! Metadata is immutable once registered. Which side of a relation owns the
//! join (`JoinSide`) is fixed at declaration time and checked when the entity
//! is registered, so the loader never has to infer it per call.

use crate::error::{Error, MetadataError, MetadataErrorKind, Result};
use crate::filter::OrderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// The kind of a property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Plain column value.
    #[default]
    Scalar,
    /// Many-to-one: many `Book`s belong to one `Author`.
    ManyToOne,
    /// One-to-one: `User` has one `Profile`.
    OneToOne,
    /// One-to-many: one `Author` has many `Book`s.
    OneToMany,
    /// Many-to-many: `Post`s have many `Tag`s via a join table.
    ManyToMany,
}

impl ReferenceKind {
    pub const fn is_scalar(self) -> bool {
        matches!(self, ReferenceKind::Scalar)
    }

    /// Relations holding at most one entity.
    pub const fn is_to_one(self) -> bool {
        matches!(self, ReferenceKind::ManyToOne | ReferenceKind::OneToOne)
    }

    /// Relations holding a collection.
    pub const fn is_to_many(self) -> bool {
        matches!(self, ReferenceKind::OneToMany | ReferenceKind::ManyToMany)
    }
}

/// How a populate node is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// One batched select per relation per level.
    #[default]
    SelectIn,
    /// The relation was (or will be) joined into the parent query.
    Joined,
}

/// Which side of a relation stores the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinSide {
    /// This side holds the foreign key or the join-table rows.
    Owner,
    /// The other side owns the link; `mapped_by` names its property.
    Inverse { mapped_by: String },
}

/// A single property of an entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityProperty {
    pub name: String,
    pub kind: ReferenceKind,
    /// Related entity type (relations only)
    pub target_type: Option<String>,
    /// Property on the owning side that this inverse side mirrors
    pub mapped_by: Option<String>,
    /// Property on the inverse side that mirrors this owning side
    pub inversed_by: Option<String>,
    /// Always populated, whatever the request
    pub eager: bool,
    /// Scalar excluded from default loads
    pub lazy: bool,
    /// Default ordering for the related entities
    pub order_by: OrderMap,
    /// To-one value is held inside a `Reference` wrapper
    pub wrapped_reference: bool,
    /// Join table for an owning many-to-many relation
    pub pivot_table: Option<String>,
    /// Preferred load strategy for this relation
    pub strategy: Option<LoadStrategy>,
    join_side: JoinSide,
}

impl EntityProperty {
    fn relation(name: &str, kind: ReferenceKind, target: &str, join_side: JoinSide) -> Self {
        let mapped_by = match &join_side {
            JoinSide::Owner => None,
            JoinSide::Inverse { mapped_by } => Some(mapped_by.clone()),
        };
        Self {
            name: name.to_string(),
            kind,
            target_type: Some(target.to_string()),
            mapped_by,
            inversed_by: None,
            eager: false,
            lazy: false,
            order_by: OrderMap::new(),
            wrapped_reference: false,
            pivot_table: None,
            strategy: None,
            join_side,
        }
    }

    /// A plain value property.
    #[must_use]
    pub fn scalar(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ReferenceKind::Scalar,
            target_type: None,
            mapped_by: None,
            inversed_by: None,
            eager: false,
            lazy: false,
            order_by: OrderMap::new(),
            wrapped_reference: false,
            pivot_table: None,
            strategy: None,
            join_side: JoinSide::Owner,
        }
    }

    /// Owning to-one relation holding the foreign key.
    #[must_use]
    pub fn many_to_one(name: &str, target: &str) -> Self {
        Self::relation(name, ReferenceKind::ManyToOne, target, JoinSide::Owner)
    }

    /// Inverse to-many relation; `mapped_by` is the child's many-to-one.
    #[must_use]
    pub fn one_to_many(name: &str, target: &str, mapped_by: &str) -> Self {
        Self::relation(
            name,
            ReferenceKind::OneToMany,
            target,
            JoinSide::Inverse {
                mapped_by: mapped_by.to_string(),
            },
        )
    }

    /// Owning one-to-one relation holding the foreign key.
    #[must_use]
    pub fn one_to_one(name: &str, target: &str) -> Self {
        Self::relation(name, ReferenceKind::OneToOne, target, JoinSide::Owner)
    }

    /// Owning many-to-many relation backed by a join table.
    #[must_use]
    pub fn many_to_many(name: &str, target: &str, pivot_table: &str) -> Self {
        let mut prop = Self::relation(name, ReferenceKind::ManyToMany, target, JoinSide::Owner);
        prop.pivot_table = Some(pivot_table.to_string());
        prop
    }

    /// Turn this relation into the inverse side of `mapped_by`.
    #[must_use]
    pub fn mapped_by(mut self, mapped_by: &str) -> Self {
        self.mapped_by = Some(mapped_by.to_string());
        self.join_side = JoinSide::Inverse {
            mapped_by: mapped_by.to_string(),
        };
        self.pivot_table = None;
        self
    }

    /// Name the inverse property mirroring this owning relation.
    #[must_use]
    pub fn inversed_by(mut self, inversed_by: &str) -> Self {
        self.inversed_by = Some(inversed_by.to_string());
        self
    }

    #[must_use]
    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Default ordering applied when fetching this relation.
    #[must_use]
    pub fn order_by(mut self, order: OrderMap) -> Self {
        self.order_by = order;
        self
    }

    /// Hold the to-one value in a `Reference` wrapper.
    #[must_use]
    pub fn wrapped(mut self) -> Self {
        self.wrapped_reference = true;
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: LoadStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Which side of the relation stores the link.
    pub fn join_side(&self) -> &JoinSide {
        &self.join_side
    }

    /// Does this side own the link?
    pub fn is_owner(&self) -> bool {
        matches!(self.join_side, JoinSide::Owner)
    }

    /// Property on the owning side, for an inverse relation.
    pub fn inverse_field(&self) -> Option<&str> {
        match &self.join_side {
            JoinSide::Owner => None,
            JoinSide::Inverse { mapped_by } => Some(mapped_by),
        }
    }

    /// The target entity type, or an error naming this property.
    pub fn target(&self) -> Result<&str> {
        self.target_type.as_deref().ok_or_else(|| {
            Error::Custom(format!("property '{}' has no target type", self.name))
        })
    }

    fn check(&self, entity_type: &str) -> std::result::Result<(), MetadataError> {
        if self.kind.is_scalar() {
            return Ok(());
        }
        let fail = |kind, message: &str| {
            Err(MetadataError::new(
                kind,
                entity_type,
                Some(&self.name),
                message,
            ))
        };
        if self.target_type.is_none() {
            return fail(MetadataErrorKind::Incomplete, "relation has no target type");
        }
        let side_matches = match &self.join_side {
            JoinSide::Owner => self.mapped_by.is_none(),
            JoinSide::Inverse { mapped_by } => self.mapped_by.as_deref() == Some(mapped_by),
        };
        if !side_matches {
            return fail(
                MetadataErrorKind::AmbiguousSide,
                "relation must be either owner or mapped_by",
            );
        }
        match (self.kind, self.is_owner()) {
            (ReferenceKind::ManyToOne, false) => fail(
                MetadataErrorKind::AmbiguousSide,
                "many-to-one relations always own the foreign key",
            ),
            (ReferenceKind::OneToMany, true) => fail(
                MetadataErrorKind::Incomplete,
                "one-to-many relations need mapped_by",
            ),
            (ReferenceKind::ManyToMany, true) if self.pivot_table.is_none() => fail(
                MetadataErrorKind::Incomplete,
                "owning many-to-many relations need a pivot table",
            ),
            _ => Ok(()),
        }
    }
}

/// Metadata for one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMetadata {
    pub name: String,
    pub primary_keys: Vec<String>,
    properties: Vec<EntityProperty>,
}

impl EntityMetadata {
    /// Create metadata for `name` with a single `id` primary key.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            primary_keys: vec!["id".to_string()],
            properties: vec![EntityProperty::scalar("id")],
        }
    }

    /// Replace the primary key properties.
    #[must_use]
    pub fn primary_keys(mut self, keys: &[&str]) -> Self {
        self.properties
            .retain(|p| !(p.kind.is_scalar() && self.primary_keys.contains(&p.name)));
        self.primary_keys = keys.iter().map(|k| (*k).to_string()).collect();
        for (idx, key) in keys.iter().enumerate() {
            self.properties.insert(idx, EntityProperty::scalar(key));
        }
        self
    }

    /// Declare a property. Redeclaring a name replaces it.
    #[must_use]
    pub fn property(mut self, prop: EntityProperty) -> Self {
        if let Some(existing) = self.properties.iter_mut().find(|p| p.name == prop.name) {
            *existing = prop;
        } else {
            self.properties.push(prop);
        }
        self
    }

    /// Look up a property by name.
    pub fn get(&self, name: &str) -> Option<&EntityProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// All properties in declaration order.
    pub fn properties(&self) -> &[EntityProperty] {
        &self.properties
    }

    /// Non-scalar properties in declaration order.
    pub fn relations(&self) -> impl Iterator<Item = &EntityProperty> {
        self.properties.iter().filter(|p| !p.kind.is_scalar())
    }
}

/// Source of entity metadata.
pub trait MetadataRegistry: Send + Sync {
    /// Metadata for an entity type, if registered.
    fn get_metadata(&self, entity_type: &str) -> Option<Arc<EntityMetadata>>;
}

impl<T: MetadataRegistry + ?Sized> MetadataRegistry for Arc<T> {
    fn get_metadata(&self, entity_type: &str) -> Option<Arc<EntityMetadata>> {
        (**self).get_metadata(entity_type)
    }
}

impl<T: MetadataRegistry + ?Sized> MetadataRegistry for &T {
    fn get_metadata(&self, entity_type: &str) -> Option<Arc<EntityMetadata>> {
        (**self).get_metadata(entity_type)
    }
}

/// Default in-process metadata registry.
#[derive(Debug, Default)]
pub struct MetadataStorage {
    entities: HashMap<String, Arc<EntityMetadata>>,
}

impl MetadataStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and validate a whole set of mutually-referencing entities.
    pub fn build(entities: impl IntoIterator<Item = EntityMetadata>) -> Result<Self> {
        let mut storage = Self::new();
        for meta in entities {
            storage.register(meta)?;
        }
        storage.validate()?;
        Ok(storage)
    }

    /// Register one entity type, checking each relation's declaration.
    pub fn register(&mut self, meta: EntityMetadata) -> Result<()> {
        if self.entities.contains_key(&meta.name) {
            return Err(MetadataError::new(
                MetadataErrorKind::Duplicate,
                &meta.name,
                None,
                "entity already registered",
            )
            .into());
        }
        for prop in &meta.properties {
            prop.check(&meta.name)?;
        }
        tracing::debug!(
            entity = %meta.name,
            relations = meta.relations().count(),
            "Registered entity metadata"
        );
        self.entities.insert(meta.name.clone(), Arc::new(meta));
        Ok(())
    }

    /// Check cross-entity references: targets exist and `mapped_by` names a
    /// relation on the target that points back.
    pub fn validate(&self) -> Result<()> {
        for meta in self.entities.values() {
            for prop in meta.relations() {
                let target = prop.target()?;
                let Some(target_meta) = self.entities.get(target) else {
                    return Err(MetadataError::new(
                        MetadataErrorKind::UnknownTarget,
                        &meta.name,
                        Some(&prop.name),
                        format!("target entity '{target}' is not registered"),
                    )
                    .into());
                };
                if let JoinSide::Inverse { mapped_by } = prop.join_side() {
                    let back = target_meta.get(mapped_by);
                    let valid = back.is_some_and(|b| {
                        b.is_owner() && b.target_type.as_deref() == Some(meta.name.as_str())
                    });
                    if !valid {
                        return Err(MetadataError::new(
                            MetadataErrorKind::Incomplete,
                            &meta.name,
                            Some(&prop.name),
                            format!("'{target}.{mapped_by}' is not an owning relation to '{}'", meta.name),
                        )
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl MetadataRegistry for MetadataStorage {
    fn get_metadata(&self, entity_type: &str) -> Option<Arc<EntityMetadata>> {
        self.entities.get(entity_type).cloned()
    }
}
