//! Batch loading of one populate node over a set of parents.
//!
//! For a relation and a batch of parents this decides which parents still
//! need the relation loaded, gathers their keys, issues a single fetch (a
//! direct find or a join-table load) and hands the result to the linker.

use crate::EntityLoader;
use crate::fetch_tracker::FetchKind;
use crate::link;
use relfill_core::{
    Condition, Cx, Driver, EntityProperty, EntityRef, Error, FilterKey, FilterQuery, FindOptions,
    LoadStrategy, MetadataError, MetadataErrorKind, MetadataRegistry, OrderMap, Outcome,
    PopulateNode, PopulateOptions, PrimaryKey, ReferenceKind, RelationTarget, RelationValue,
    TransactionContext, Value,
};
use std::collections::HashSet;

/// Filter, ordering and bookkeeping for one level of a populate call.
#[derive(Debug, Clone)]
pub(crate) struct LoadScope {
    pub filter: FilterQuery,
    pub order_by: OrderMap,
    pub force_refresh: bool,
    pub transaction: Option<TransactionContext>,
    /// Populate path of the parents, rooted at the entity type
    pub path: String,
    /// Fetch tracker call id
    pub call: u64,
}

impl LoadScope {
    pub(crate) fn root(entity_type: &str, options: &PopulateOptions, call: u64) -> Self {
        Self {
            filter: options.filter.clone(),
            order_by: options.order_by.clone(),
            force_refresh: options.force_refresh,
            transaction: options.transaction.clone(),
            path: entity_type.to_string(),
            call,
        }
    }

    /// Scope for the entities reached through `field`.
    pub(crate) fn descend(&self, field: &str) -> Self {
        Self {
            filter: self.filter.nested_for(field),
            order_by: self.order_by.nested_for(field),
            force_refresh: self.force_refresh,
            transaction: self.transaction.clone(),
            path: self.field_path(field),
            call: self.call,
        }
    }

    pub(crate) fn field_path(&self, field: &str) -> String {
        format!("{}.{}", self.path, field)
    }
}

/// How fetched children are keyed and linked back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkMode<'p> {
    /// Children point back at the parent through `mapped_by`.
    OneToMany { mapped_by: &'p str },
    /// Children's owning collection `mapped_by` contains the parent.
    InverseManyToMany { mapped_by: &'p str },
    /// The parent's collection already names its members.
    OwnedManyToMany,
    /// The parent's slot holds the child's key.
    ToOne,
    /// The owning side is looked up by the parent's key.
    InverseOneToOne { mapped_by: &'p str },
}

/// Owned snapshot of a relation slot, taken so no lock is held while the
/// target is inspected.
#[derive(Debug)]
enum Slot {
    Unset,
    Empty,
    Collection { initialized: bool },
    ToOne(RelationTarget),
}

impl Slot {
    fn read(parent: &EntityRef, field: &str) -> Self {
        let entity = parent.read();
        match entity.relation(field) {
            RelationValue::Unset => Slot::Unset,
            RelationValue::Empty => Slot::Empty,
            RelationValue::Collection(collection) => Slot::Collection {
                initialized: collection.is_initialized(),
            },
            value => value.to_one_target().map_or(Slot::Unset, Slot::ToOne),
        }
    }
}

fn target_initialized(target: &RelationTarget) -> bool {
    match target {
        RelationTarget::Entity(entity) => entity.is_initialized(),
        RelationTarget::Identifier(_) => false,
    }
}

fn needs_load(mode: LinkMode<'_>, slot: &Slot, refresh: bool) -> bool {
    match (mode, slot) {
        (_, Slot::Collection { initialized }) => refresh || !initialized,
        (
            LinkMode::OneToMany { .. }
            | LinkMode::InverseManyToMany { .. }
            | LinkMode::OwnedManyToMany,
            Slot::Unset | Slot::Empty,
        ) => true,
        (LinkMode::InverseOneToOne { .. }, Slot::Unset) => true,
        (LinkMode::InverseOneToOne { .. }, Slot::Empty) => refresh,
        (_, Slot::ToOne(target)) => refresh || !target_initialized(target),
        (LinkMode::ToOne, Slot::Unset | Slot::Empty) => false,
    }
}

fn missing_inverse(entity_type: &str, prop: &EntityProperty) -> Error {
    Error::Metadata(MetadataError {
        kind: MetadataErrorKind::Incomplete,
        entity_type: entity_type.to_string(),
        property: Some(prop.name.clone()),
        message: "inverse relation has no mapped_by".to_string(),
    })
}

/// Distinct, non-null keys as filter values.
fn key_values(keys: impl IntoIterator<Item = PrimaryKey>) -> Vec<Value> {
    let mut seen = HashSet::new();
    keys.into_iter()
        .filter(|key| !key.has_null())
        .filter(|key| seen.insert(key.clone()))
        .map(|key| key.to_value())
        .collect()
}

impl<R: MetadataRegistry, D: Driver> EntityLoader<R, D> {
    fn link_mode<'p>(
        &self,
        entity_type: &str,
        prop: &'p EntityProperty,
        node: &PopulateNode,
    ) -> Result<LinkMode<'p>, Error> {
        let inverse = || {
            prop.inverse_field()
                .ok_or_else(|| missing_inverse(entity_type, prop))
        };
        let strategy = node.strategy.unwrap_or(self.config.default_strategy);
        let mode = match prop.kind {
            ReferenceKind::OneToMany => LinkMode::OneToMany {
                mapped_by: inverse()?,
            },
            ReferenceKind::ManyToMany if prop.is_owner() => LinkMode::OwnedManyToMany,
            ReferenceKind::ManyToMany => LinkMode::InverseManyToMany {
                mapped_by: inverse()?,
            },
            ReferenceKind::OneToOne
                if !prop.is_owner()
                    && !self.config.auto_join_one_to_one_owner
                    && strategy != LoadStrategy::Joined =>
            {
                LinkMode::InverseOneToOne {
                    mapped_by: inverse()?,
                }
            }
            _ => LinkMode::ToOne,
        };
        Ok(mode)
    }

    /// Ordering for a child fetch: the caller's, else the relation's default,
    /// else the join key followed by the target's primary key.
    fn fetch_order(
        &self,
        prop: &EntityProperty,
        target: &str,
        key: &FilterKey,
        scope: &LoadScope,
    ) -> OrderMap {
        let requested = scope.order_by.nested_for(&prop.name);
        if !requested.is_empty() {
            return requested;
        }
        if !prop.order_by.is_empty() {
            return prop.order_by.clone();
        }
        let mut order = OrderMap::new();
        if let FilterKey::Field(field) = key {
            order = order.asc(field.as_str());
        }
        if let Some(meta) = self.registry.get_metadata(target) {
            for pk in &meta.primary_keys {
                order = order.asc(pk.as_str());
            }
        }
        order
    }

    fn record_fetch(&self, scope: &LoadScope, path: &str, target: &str, kind: FetchKind, keys: usize) {
        self.tracker().record(scope.call, path, target, kind, keys);
    }

    /// Load `prop` for every parent that still needs it and link the results.
    pub(crate) async fn populate_many(
        &self,
        cx: &Cx,
        entity_type: &str,
        parents: &[EntityRef],
        prop: &EntityProperty,
        node: &PopulateNode,
        scope: &LoadScope,
    ) -> Outcome<(), Error> {
        if prop.kind.is_scalar() {
            return Outcome::Ok(());
        }
        let field = prop.name.as_str();
        let path = scope.field_path(field);

        link::mark_populated(parents, field);

        let mode = match self.link_mode(entity_type, prop, node) {
            Ok(mode) => mode,
            Err(e) => return Outcome::Err(e),
        };
        let pending: Vec<EntityRef> = parents
            .iter()
            .filter(|parent| needs_load(mode, &Slot::read(parent, field), scope.force_refresh))
            .cloned()
            .collect();

        if pending.is_empty() {
            tracing::debug!(
                path = %path,
                parent_count = parents.len(),
                "Relation already loaded, skipping fetch"
            );
            return Outcome::Ok(());
        }

        let target = match prop.target() {
            Ok(target) => target,
            Err(e) => return Outcome::Err(e),
        };

        let outcome = if prop.kind == ReferenceKind::ManyToMany
            && self.driver.capabilities().pivot_tables
        {
            self.load_from_pivot(cx, entity_type, &pending, prop, target, node, scope, &path)
                .await
        } else {
            self.find_children(cx, entity_type, &pending, prop, target, node, mode, scope, &path)
                .await
        };

        if matches!(outcome, Outcome::Ok(())) {
            // Containers created while linking
            link::mark_populated(&pending, field);
        }
        outcome
    }

    /// Many-to-many through a join table: one load for all pending owners,
    /// rows merged through the identity map.
    #[allow(clippy::too_many_arguments)]
    async fn load_from_pivot(
        &self,
        cx: &Cx,
        entity_type: &str,
        pending: &[EntityRef],
        prop: &EntityProperty,
        target: &str,
        node: &PopulateNode,
        scope: &LoadScope,
        path: &str,
    ) -> Outcome<(), Error> {
        let mut seen = HashSet::new();
        let owners: Vec<PrimaryKey> = pending
            .iter()
            .map(EntityRef::primary_key)
            .filter(|pk| seen.insert(pk.clone()))
            .collect();

        let filter = scope.filter.child_condition(&prop.name);
        let options = FindOptions {
            order_by: self.fetch_order(prop, target, &FilterKey::PrimaryKey, scope),
            force_refresh: scope.force_refresh,
            populate: node.children.clone(),
            transaction: scope.transaction.clone(),
        };

        tracing::info!(
            parent_entity = entity_type,
            related_entity = target,
            parent_count = pending.len(),
            owner_count = owners.len(),
            path = %path,
            "Batch loading many-to-many relation through join table"
        );
        self.record_fetch(scope, path, target, FetchKind::Pivot, owners.len());

        let rows = match self
            .driver
            .load_from_pivot_table(cx, entity_type, prop, &owners, &filter, &options)
            .await
        {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut loaded = 0;
        for parent in pending {
            let key = parent.primary_key().serialize();
            let mut items = Vec::new();
            // Don't `remove()` here: the same owner can appear more than once.
            for data in rows.get(&key).into_iter().flatten() {
                match self.driver.merge(target, data.clone(), scope.force_refresh) {
                    Ok(entity) => items.push(entity),
                    Err(e) => return Outcome::Err(e),
                }
            }
            loaded += items.len();
            link::hydrate_collection(parent, &prop.name, items);
        }

        tracing::debug!(path = %path, loaded_count = loaded, "Join table load complete");
        Outcome::Ok(())
    }

    /// Everything that is not a join-table load: one find keyed by an IN
    /// condition, then relink according to `mode`.
    #[allow(clippy::too_many_arguments)]
    async fn find_children(
        &self,
        cx: &Cx,
        entity_type: &str,
        pending: &[EntityRef],
        prop: &EntityProperty,
        target: &str,
        node: &PopulateNode,
        mode: LinkMode<'_>,
        scope: &LoadScope,
        path: &str,
    ) -> Outcome<(), Error> {
        let field = prop.name.as_str();
        let (key, keys) = match mode {
            LinkMode::OneToMany { mapped_by }
            | LinkMode::InverseManyToMany { mapped_by }
            | LinkMode::InverseOneToOne { mapped_by } => (
                FilterKey::field(mapped_by),
                key_values(pending.iter().map(EntityRef::primary_key)),
            ),
            LinkMode::OwnedManyToMany => (
                FilterKey::PrimaryKey,
                key_values(
                    link::collect_children(pending, field)
                        .iter()
                        .map(EntityRef::primary_key),
                ),
            ),
            LinkMode::ToOne => (
                FilterKey::PrimaryKey,
                key_values(
                    pending
                        .iter()
                        .filter_map(|parent| link::to_one_target(parent, field))
                        .map(|target| target.key()),
                ),
            ),
        };

        tracing::info!(
            parent_entity = entity_type,
            related_entity = target,
            parent_count = pending.len(),
            key_count = keys.len(),
            path = %path,
            "Batch loading relation"
        );

        let children = if keys.is_empty() {
            Vec::new()
        } else {
            let filter = FilterQuery::new()
                .with(key.clone(), Condition::In(keys.clone()))
                .merged(scope.filter.child_condition(field));
            let mut populate = node.children.clone();
            if let LinkMode::InverseManyToMany { mapped_by } = mode {
                if !populate.iter().any(|n| n.field == mapped_by) {
                    populate.push(PopulateNode::new(mapped_by));
                }
            }
            let options = FindOptions {
                order_by: self.fetch_order(prop, target, &key, scope),
                force_refresh: scope.force_refresh,
                populate,
                transaction: scope.transaction.clone(),
            };

            self.record_fetch(scope, path, target, FetchKind::Find, keys.len());
            match self.driver.find(cx, target, &filter, &options).await {
                Outcome::Ok(children) => children,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        let wrapped = prop.wrapped_reference;
        let linked = match mode {
            LinkMode::OneToMany { mapped_by } => {
                link::link_one_to_many(pending, field, mapped_by, &children)
            }
            LinkMode::InverseManyToMany { mapped_by } => {
                link::link_inverse_many_to_many(pending, field, mapped_by, &children)
            }
            LinkMode::OwnedManyToMany => link::link_owned_many_to_many(pending, field, &children),
            LinkMode::ToOne => link::link_to_one(pending, field, &children, wrapped),
            LinkMode::InverseOneToOne { mapped_by } => {
                link::link_inverse_one_to_one(pending, field, mapped_by, &children, wrapped)
            }
        };

        tracing::debug!(
            path = %path,
            fetched_count = children.len(),
            linked_count = linked,
            "Batch load complete"
        );
        Outcome::Ok(())
    }
}
