//! Collaborators the population engine depends on.
//!
//! The engine never talks to storage directly. It asks an [`EntityFinder`]
//! for entities matching a filter, a [`PivotLoader`] for many-to-many rows
//! routed through a join table, and an [`EntityMerger`] to turn raw rows into
//! identity-mapped instances. A [`Driver`] bundles all three with its
//! capabilities.

use crate::config::TransactionContext;
use crate::entity::EntityRef;
use crate::error::{Error, Result};
use crate::filter::{FilterQuery, OrderMap};
use crate::metadata::{EntityProperty, MetadataRegistry};
use crate::populate::{POPULATE_ALL, PopulateNode};
use crate::value::{PrimaryKey, Value};
use asupersync::{Cx, Outcome};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

/// Options accompanying a fetch.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub order_by: OrderMap,
    /// Overwrite already-loaded entity data with the fetched rows.
    pub force_refresh: bool,
    /// Relations the caller will populate on the results next. Drivers may
    /// use this to join them in; they are not required to.
    pub populate: Vec<PopulateNode>,
    pub transaction: Option<TransactionContext>,
}

/// Raw data for one entity as returned by storage.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityData {
    pub primary_key: PrimaryKey,
    pub scalars: BTreeMap<String, Value>,
    pub relations: BTreeMap<String, RelationData>,
}

/// Raw value of a relation column.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationData {
    /// Foreign key of a to-one relation
    One(PrimaryKey),
    /// Explicit NULL foreign key
    Null,
    /// Keys of the members of a to-many relation
    Many(Vec<PrimaryKey>),
}

impl EntityData {
    pub fn new(primary_key: impl Into<PrimaryKey>) -> Self {
        Self {
            primary_key: primary_key.into(),
            scalars: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Set a scalar column (builder pattern).
    #[must_use]
    pub fn scalar(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.scalars.insert(name.to_string(), value.into());
        self
    }

    /// Set a to-one foreign key (builder pattern).
    #[must_use]
    pub fn one(mut self, name: &str, key: impl Into<PrimaryKey>) -> Self {
        self.relations
            .insert(name.to_string(), RelationData::One(key.into()));
        self
    }

    /// Set a NULL to-one foreign key (builder pattern).
    #[must_use]
    pub fn null(mut self, name: &str) -> Self {
        self.relations.insert(name.to_string(), RelationData::Null);
        self
    }

    /// Set the members of a to-many relation (builder pattern).
    #[must_use]
    pub fn many<K: Into<PrimaryKey>>(mut self, name: &str, keys: impl IntoIterator<Item = K>) -> Self {
        self.relations.insert(
            name.to_string(),
            RelationData::Many(keys.into_iter().map(Into::into).collect()),
        );
        self
    }
}

/// What a driver can do beyond plain finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Many-to-many relations are stored in join tables and can be loaded
    /// through [`PivotLoader`].
    pub pivot_tables: bool,
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        Self { pivot_tables: true }
    }
}

/// Finds entities by filter.
pub trait EntityFinder: Send + Sync {
    /// Fetch entities of `entity_type` matching `filter`, already merged into
    /// the identity map, in the requested order.
    fn find(
        &self,
        cx: &Cx,
        entity_type: &str,
        filter: &FilterQuery,
        options: &FindOptions,
    ) -> impl Future<Output = Outcome<Vec<EntityRef>, Error>> + Send;
}

/// Loads many-to-many rows through a join table.
pub trait PivotLoader: Send + Sync {
    /// For each owner key of `entity_type`, the related rows of `property`
    /// that satisfy `filter`, keyed by [`PrimaryKey::serialize`] of the owner.
    fn load_from_pivot_table(
        &self,
        cx: &Cx,
        entity_type: &str,
        property: &EntityProperty,
        owners: &[PrimaryKey],
        filter: &FilterQuery,
        options: &FindOptions,
    ) -> impl Future<Output = Outcome<HashMap<String, Vec<EntityData>>, Error>> + Send;
}

/// Turns raw rows into identity-mapped entities.
pub trait EntityMerger: Send + Sync {
    /// Return the unique instance for `data`, creating it or updating the
    /// existing one. Loaded data is only overwritten with `force_refresh`.
    fn merge(&self, entity_type: &str, data: EntityData, force_refresh: bool) -> Result<EntityRef>;
}

/// A complete persistence backend.
pub trait Driver: EntityFinder + PivotLoader + EntityMerger {
    fn capabilities(&self) -> DriverCapabilities;
}

impl<T: EntityFinder> EntityFinder for Arc<T> {
    fn find(
        &self,
        cx: &Cx,
        entity_type: &str,
        filter: &FilterQuery,
        options: &FindOptions,
    ) -> impl Future<Output = Outcome<Vec<EntityRef>, Error>> + Send {
        (**self).find(cx, entity_type, filter, options)
    }
}

impl<T: PivotLoader> PivotLoader for Arc<T> {
    fn load_from_pivot_table(
        &self,
        cx: &Cx,
        entity_type: &str,
        property: &EntityProperty,
        owners: &[PrimaryKey],
        filter: &FilterQuery,
        options: &FindOptions,
    ) -> impl Future<Output = Outcome<HashMap<String, Vec<EntityData>>, Error>> + Send {
        (**self).load_from_pivot_table(cx, entity_type, property, owners, filter, options)
    }
}

impl<T: EntityMerger> EntityMerger for Arc<T> {
    fn merge(&self, entity_type: &str, data: EntityData, force_refresh: bool) -> Result<EntityRef> {
        (**self).merge(entity_type, data, force_refresh)
    }
}

impl<T: Driver> Driver for Arc<T> {
    fn capabilities(&self) -> DriverCapabilities {
        (**self).capabilities()
    }
}

/// Decides whether a field path may be populated on an entity type.
pub trait PopulatePolicy: Send + Sync {
    fn can_populate(&self, registry: &dyn MetadataRegistry, entity_type: &str, path: &str) -> bool;
}

/// Allows any path whose segments name declared properties.
///
/// The wildcard is always allowed, and so is anything on an entity type the
/// registry does not know (there is nothing to check against).
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataPolicy;

impl PopulatePolicy for MetadataPolicy {
    fn can_populate(&self, registry: &dyn MetadataRegistry, entity_type: &str, path: &str) -> bool {
        if path == POPULATE_ALL {
            return true;
        }
        let Some(meta) = registry.get_metadata(entity_type) else {
            return true;
        };
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let Some(prop) = meta.get(head) else {
            return false;
        };
        match (rest, prop.target_type.as_deref()) {
            (None, _) => true,
            (Some(rest), Some(target)) => self.can_populate(registry, target, rest),
            (Some(_), None) => false,
        }
    }
}

impl<F> PopulatePolicy for F
where
    F: Fn(&dyn MetadataRegistry, &str, &str) -> bool + Send + Sync,
{
    fn can_populate(&self, registry: &dyn MetadataRegistry, entity_type: &str, path: &str) -> bool {
        self(registry, entity_type, path)
    }
}
