//! In-memory driver for relfill.
//!
//! `MemoryStore` keeps raw rows per entity type and implements every
//! collaborator the population engine needs:
//!
//! - `find` evaluates a [`FilterQuery`] against the rows (relation
//!   conditions follow foreign keys in both directions) and sorts by the
//!   requested [`OrderMap`]
//! - `load_from_pivot_table` resolves many-to-many links from the keys the
//!   owning rows carry
//! - `merge` turns rows into identity-mapped [`EntityRef`]s, leaving
//!   to-one relations as stubs and to-many relations uninitialized
//!
//! Every `find` and join-table load is recorded, so tests can assert on the
//! exact number and shape of fetches a populate call issues.
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new(registry.clone());
//! store.insert("Author", EntityData::new(1_i64).scalar("name", "Ann"));
//! store.insert("Book", EntityData::new(10_i64).one("author", 1_i64));
//! let authors = store.find_now("Author", &FilterQuery::new(), &FindOptions::default())?;
//! ```

pub mod identity_map;

pub use identity_map::{IdentityMap, ObjectKey};

use relfill_core::{
    Collection, Condition, Cx, Driver, DriverCapabilities, EntityData, EntityFinder,
    EntityMerger, EntityMetadata, EntityProperty, EntityRef, Error, FilterKey, FilterQuery,
    FindOptions, MetadataRegistry, OrderDirection, OrderMap, Outcome, PivotLoader,
    PopulateConfig, PopulateNode, PrimaryKey, QueryErrorKind, Reference, ReferenceKind,
    RelationData, RelationValue, Result, TransactionContext, Value,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

/// Which collaborator call a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchLogKind {
    Find,
    Pivot,
}

/// One recorded fetch.
#[derive(Debug, Clone)]
pub struct FetchLogEntry {
    pub kind: FetchLogKind,
    /// Entity type of the returned rows
    pub entity_type: String,
    /// Relation loaded, for join-table loads
    pub property: Option<String>,
    pub filter: FilterQuery,
    pub order_by: OrderMap,
    pub populate: Vec<PopulateNode>,
    pub transaction: Option<TransactionContext>,
    /// Owner keys, for join-table loads
    pub owners: Vec<PrimaryKey>,
    /// Rows returned
    pub rows: usize,
}

type Tables = HashMap<String, Vec<EntityData>>;

/// In-memory rows plus an identity map.
pub struct MemoryStore<R> {
    registry: R,
    tables: RwLock<Tables>,
    identity_map: Mutex<IdentityMap>,
    capabilities: DriverCapabilities,
    auto_join_one_to_one_owner: bool,
    log: Mutex<Vec<FetchLogEntry>>,
    failures: Mutex<Vec<String>>,
}

impl<R> std::fmt::Debug for MemoryStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("capabilities", &self.capabilities)
            .field("auto_join_one_to_one_owner", &self.auto_join_one_to_one_owner)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Value of `name` on a row: a primary key column, a scalar, or the foreign
/// key of an owning to-one relation.
fn field_value(meta: &EntityMetadata, row: &EntityData, name: &str) -> Option<Value> {
    if let Some(idx) = meta.primary_keys.iter().position(|pk| pk == name) {
        return row.primary_key.values().get(idx).cloned();
    }
    if let Some(value) = row.scalars.get(name) {
        return Some(value.clone());
    }
    match row.relations.get(name) {
        Some(RelationData::One(key)) => Some(key.to_value()),
        Some(RelationData::Null) => Some(Value::Null),
        _ => None,
    }
}

fn compare_rows(meta: &EntityMetadata, order: &OrderMap, a: &EntityData, b: &EntityData) -> Ordering {
    for (field, direction) in order.directions() {
        let left = field_value(meta, a, field).unwrap_or(Value::Null);
        let right = field_value(meta, b, field).unwrap_or(Value::Null);
        let ordering = match direction {
            OrderDirection::Asc => left.compare(&right),
            OrderDirection::Desc => right.compare(&left),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn value_matches(value: &Value, condition: &Condition) -> bool {
    match condition {
        Condition::Eq(expected) => value == expected,
        Condition::In(values) => values.contains(value),
        Condition::Nested(_) => false,
    }
}

fn links_to(data: Option<&RelationData>, key: &PrimaryKey) -> bool {
    match data {
        Some(RelationData::One(target)) => target == key,
        Some(RelationData::Many(targets)) => targets.contains(key),
        Some(RelationData::Null) | None => false,
    }
}

fn same_target(entity: &EntityRef, field: &str, value: &RelationValue) -> bool {
    let current = entity.read().relation(field).to_one_target();
    match (current, value.to_one_target()) {
        (Some(current), Some(next)) => current.key() == next.key(),
        _ => false,
    }
}

impl<R: MetadataRegistry> MemoryStore<R> {
    /// Create an empty store with join-table support.
    pub fn new(registry: R) -> Self {
        Self {
            registry,
            tables: RwLock::new(HashMap::new()),
            identity_map: Mutex::new(IdentityMap::new()),
            capabilities: DriverCapabilities::default(),
            auto_join_one_to_one_owner: false,
            log: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Set the reported capabilities (builder pattern).
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DriverCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Follow the loader configuration. With `auto_join_one_to_one_owner`
    /// the owner of an inverse one-to-one is joined in when a row is merged.
    #[must_use]
    pub fn with_config(mut self, config: &PopulateConfig) -> Self {
        self.auto_join_one_to_one_owner = config.auto_join_one_to_one_owner;
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Store a row, replacing any row with the same key.
    pub fn insert(&self, entity_type: &str, data: EntityData) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let rows = tables.entry(entity_type.to_string()).or_default();
        match rows.iter_mut().find(|row| row.primary_key == data.primary_key) {
            Some(existing) => *existing = data,
            None => rows.push(data),
        }
    }

    /// The identity-mapped instance, if it was ever loaded or referenced.
    pub fn get(&self, entity_type: &str, primary_key: &PrimaryKey) -> Option<EntityRef> {
        lock(&self.identity_map).get(entity_type, primary_key)
    }

    /// Make the next fetch of `entity_type` fail with a query error.
    pub fn fail_next(&self, entity_type: &str) {
        lock(&self.failures).push(entity_type.to_string());
    }

    pub fn fetches(&self) -> Vec<FetchLogEntry> {
        lock(&self.log).clone()
    }

    pub fn fetch_count(&self) -> usize {
        lock(&self.log).len()
    }

    /// Recorded fetches returning `entity_type`.
    pub fn fetches_for(&self, entity_type: &str) -> Vec<FetchLogEntry> {
        lock(&self.log)
            .iter()
            .filter(|entry| entry.entity_type == entity_type)
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        lock(&self.log).clear();
    }

    /// Drop every loaded instance. Relations are detached first so entity
    /// graphs do not keep each other alive.
    pub fn clear(&self) {
        let mut map = lock(&self.identity_map);
        for entity in map.entities() {
            entity.write().clear_relations();
        }
        map.clear();
    }

    fn metadata(&self, entity_type: &str) -> Result<std::sync::Arc<EntityMetadata>> {
        self.registry
            .get_metadata(entity_type)
            .ok_or_else(|| Error::unknown_entity(entity_type))
    }

    fn check_failure(&self, kind: QueryErrorKind, entity_type: &str) -> Result<()> {
        let mut failures = lock(&self.failures);
        match failures.iter().position(|t| t == entity_type) {
            Some(idx) => {
                failures.remove(idx);
                Err(Error::query(kind, Some(entity_type), "injected failure"))
            }
            None => Ok(()),
        }
    }

    fn stub(&self, entity_type: &str, primary_key: &PrimaryKey) -> EntityRef {
        lock(&self.identity_map).get_or_stub(entity_type, primary_key)
    }

    /// Keys of the rows `row.prop` points at.
    fn related_keys(
        &self,
        tables: &Tables,
        row: &EntityData,
        prop: &EntityProperty,
    ) -> Vec<PrimaryKey> {
        if prop.is_owner() {
            return match row.relations.get(&prop.name) {
                Some(RelationData::One(key)) => vec![key.clone()],
                Some(RelationData::Many(keys)) => keys.clone(),
                Some(RelationData::Null) | None => Vec::new(),
            };
        }
        let (Some(target), Some(mapped_by)) = (prop.target_type.as_deref(), prop.inverse_field())
        else {
            return Vec::new();
        };
        tables
            .get(target)
            .map(|rows| {
                rows.iter()
                    .filter(|other| links_to(other.relations.get(mapped_by), &row.primary_key))
                    .map(|other| other.primary_key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn matches(&self, tables: &Tables, entity_type: &str, row: &EntityData, filter: &FilterQuery) -> bool {
        let Some(meta) = self.registry.get_metadata(entity_type) else {
            return false;
        };
        filter
            .conditions()
            .iter()
            .all(|(key, condition)| self.matches_condition(tables, &meta, row, key, condition))
    }

    fn matches_condition(
        &self,
        tables: &Tables,
        meta: &EntityMetadata,
        row: &EntityData,
        key: &FilterKey,
        condition: &Condition,
    ) -> bool {
        let name = match key {
            FilterKey::PrimaryKey => {
                return match condition {
                    Condition::Nested(inner) => self.matches(tables, &meta.name, row, inner),
                    _ => value_matches(&row.primary_key.to_value(), condition),
                };
            }
            FilterKey::Field(name) => name,
        };

        match meta.get(name) {
            Some(prop) if !prop.kind.is_scalar() => {
                let keys = self.related_keys(tables, row, prop);
                match condition {
                    Condition::Nested(inner) => {
                        let Some(target) = prop.target_type.as_deref() else {
                            return false;
                        };
                        let rows = tables.get(target).map(Vec::as_slice).unwrap_or_default();
                        rows.iter()
                            .filter(|other| keys.contains(&other.primary_key))
                            .any(|other| self.matches(tables, target, other, inner))
                    }
                    _ => keys
                        .iter()
                        .any(|key| value_matches(&key.to_value(), condition)),
                }
            }
            _ => field_value(meta, row, name)
                .is_some_and(|value| value_matches(&value, condition)),
        }
    }

    fn select(
        &self,
        tables: &Tables,
        entity_type: &str,
        candidates: impl Iterator<Item = EntityData>,
        filter: &FilterQuery,
        order_by: &OrderMap,
    ) -> Result<Vec<EntityData>> {
        let meta = self.metadata(entity_type)?;
        let mut rows: Vec<EntityData> = candidates
            .filter(|row| self.matches(tables, entity_type, row, filter))
            .collect();
        rows.sort_by(|a, b| compare_rows(&meta, order_by, a, b));
        Ok(rows)
    }

    fn record(&self, entry: FetchLogEntry) {
        tracing::debug!(
            kind = ?entry.kind,
            entity = %entry.entity_type,
            rows = entry.rows,
            "Memory store fetch"
        );
        lock(&self.log).push(entry);
    }

    /// Synchronous [`find`](EntityFinder::find).
    pub fn find_now(
        &self,
        entity_type: &str,
        filter: &FilterQuery,
        options: &FindOptions,
    ) -> Result<Vec<EntityRef>> {
        self.check_failure(QueryErrorKind::Find, entity_type)?;
        let rows = {
            let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
            let candidates = tables.get(entity_type).cloned().unwrap_or_default();
            self.select(&tables, entity_type, candidates.into_iter(), filter, &options.order_by)?
        };
        self.record(FetchLogEntry {
            kind: FetchLogKind::Find,
            entity_type: entity_type.to_string(),
            property: None,
            filter: filter.clone(),
            order_by: options.order_by.clone(),
            populate: options.populate.clone(),
            transaction: options.transaction.clone(),
            owners: Vec::new(),
            rows: rows.len(),
        });
        rows.into_iter()
            .map(|row| self.merge_row(entity_type, row, options.force_refresh))
            .collect()
    }

    /// Synchronous [`load_from_pivot_table`](PivotLoader::load_from_pivot_table).
    pub fn pivot_now(
        &self,
        entity_type: &str,
        prop: &EntityProperty,
        owners: &[PrimaryKey],
        filter: &FilterQuery,
        options: &FindOptions,
    ) -> Result<HashMap<String, Vec<EntityData>>> {
        let target = prop.target()?;
        self.check_failure(QueryErrorKind::PivotLoad, target)?;

        let mut result = HashMap::new();
        let mut total = 0;
        {
            let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
            let owner_rows = tables.get(entity_type).map(Vec::as_slice).unwrap_or_default();
            let target_rows = tables.get(target).map(Vec::as_slice).unwrap_or_default();
            for owner in owners {
                let Some(row) = owner_rows.iter().find(|row| &row.primary_key == owner) else {
                    continue;
                };
                let keys = self.related_keys(&tables, row, prop);
                let candidates = target_rows
                    .iter()
                    .filter(|candidate| keys.contains(&candidate.primary_key))
                    .cloned();
                let rows = self.select(&tables, target, candidates, filter, &options.order_by)?;
                total += rows.len();
                result.insert(owner.serialize(), rows);
            }
        }

        self.record(FetchLogEntry {
            kind: FetchLogKind::Pivot,
            entity_type: target.to_string(),
            property: Some(prop.name.clone()),
            filter: filter.clone(),
            order_by: options.order_by.clone(),
            populate: options.populate.clone(),
            transaction: options.transaction.clone(),
            owners: owners.to_vec(),
            rows: total,
        });
        Ok(result)
    }

    /// Key of the row owning the inverse one-to-one `prop` of `primary_key`.
    fn one_to_one_owner(&self, prop: &EntityProperty, primary_key: &PrimaryKey) -> Option<PrimaryKey> {
        let target = prop.target_type.as_deref()?;
        let mapped_by = prop.inverse_field()?;
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(target)?
            .iter()
            .find(|row| links_to(row.relations.get(mapped_by), primary_key))
            .map(|row| row.primary_key.clone())
    }

    fn to_one_value(&self, prop: &EntityProperty, target: &str, key: &PrimaryKey) -> RelationValue {
        let stub = self.stub(target, key);
        if prop.wrapped_reference {
            RelationValue::Reference(Reference::to_entity(stub))
        } else {
            RelationValue::Entity(stub)
        }
    }

    fn merge_row(&self, entity_type: &str, data: EntityData, force_refresh: bool) -> Result<EntityRef> {
        let meta = self.metadata(entity_type)?;
        let entity = self.stub(entity_type, &data.primary_key);
        if entity.is_initialized() && !force_refresh {
            return Ok(entity);
        }

        // Resolve stubs before taking the entity lock.
        let mut to_one = Vec::new();
        let mut members = Vec::new();
        let mut collections = Vec::new();
        for prop in meta.relations() {
            let target = prop.target()?;
            match prop.kind {
                ReferenceKind::ManyToOne | ReferenceKind::OneToOne if prop.is_owner() => {
                    match data.relations.get(&prop.name) {
                        Some(RelationData::One(key)) => {
                            to_one.push((prop.name.clone(), self.to_one_value(prop, target, key)));
                        }
                        Some(RelationData::Null) => {
                            to_one.push((prop.name.clone(), RelationValue::Empty));
                        }
                        _ => {}
                    }
                }
                ReferenceKind::OneToOne if self.auto_join_one_to_one_owner => {
                    let value = match self.one_to_one_owner(prop, &data.primary_key) {
                        Some(key) => self.to_one_value(prop, target, &key),
                        None => RelationValue::Empty,
                    };
                    to_one.push((prop.name.clone(), value));
                }
                ReferenceKind::ManyToMany if prop.is_owner() && !self.capabilities.pivot_tables => {
                    if let Some(RelationData::Many(keys)) = data.relations.get(&prop.name) {
                        let stubs: Vec<EntityRef> =
                            keys.iter().map(|key| self.stub(target, key)).collect();
                        members.push((prop.name.clone(), stubs));
                    } else {
                        collections.push(prop.name.clone());
                    }
                }
                ReferenceKind::OneToMany | ReferenceKind::ManyToMany => {
                    collections.push(prop.name.clone());
                }
                _ => {}
            }
        }

        // A wrapper already pointing at the same row keeps its populated marker.
        to_one.retain(|(name, value)| !same_target(&entity, name, value));

        {
            let mut guard = entity.write();
            for (name, value) in data.scalars {
                guard.set(name, value);
            }
            for (name, value) in to_one {
                guard.set_relation(name, value);
            }
            for name in collections {
                if guard.collection(&name).is_none() {
                    guard.set_relation(name.clone(), RelationValue::Collection(Collection::new(&entity, name)));
                }
            }
            for (name, stubs) in members {
                match guard.collection_mut(&name) {
                    Some(collection) => collection.set_references(stubs),
                    None => {
                        let mut collection = Collection::new(&entity, name.clone());
                        collection.set_references(stubs);
                        guard.set_relation(name, RelationValue::Collection(collection));
                    }
                }
            }
            guard.set_initialized(true);
        }
        Ok(entity)
    }
}

impl<R: MetadataRegistry> EntityFinder for MemoryStore<R> {
    fn find(
        &self,
        cx: &Cx,
        entity_type: &str,
        filter: &FilterQuery,
        options: &FindOptions,
    ) -> impl Future<Output = Outcome<Vec<EntityRef>, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            match self.find_now(entity_type, filter, options) {
                Ok(entities) => Outcome::Ok(entities),
                Err(e) => Outcome::Err(e),
            }
        }
    }
}

impl<R: MetadataRegistry> PivotLoader for MemoryStore<R> {
    fn load_from_pivot_table(
        &self,
        cx: &Cx,
        entity_type: &str,
        property: &EntityProperty,
        owners: &[PrimaryKey],
        filter: &FilterQuery,
        options: &FindOptions,
    ) -> impl Future<Output = Outcome<HashMap<String, Vec<EntityData>>, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            match self.pivot_now(entity_type, property, owners, filter, options) {
                Ok(rows) => Outcome::Ok(rows),
                Err(e) => Outcome::Err(e),
            }
        }
    }
}

impl<R: MetadataRegistry> EntityMerger for MemoryStore<R> {
    fn merge(&self, entity_type: &str, data: EntityData, force_refresh: bool) -> Result<EntityRef> {
        self.merge_row(entity_type, data, force_refresh)
    }
}

impl<R: MetadataRegistry> Driver for MemoryStore<R> {
    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relfill_core::MetadataStorage;

    fn registry() -> MetadataStorage {
        MetadataStorage::build(vec![
            EntityMetadata::new("Author")
                .property(EntityProperty::scalar("name"))
                .property(EntityProperty::one_to_many("books", "Book", "author")),
            EntityMetadata::new("Book")
                .property(EntityProperty::scalar("title"))
                .property(EntityProperty::many_to_one("author", "Author").inversed_by("books"))
                .property(EntityProperty::many_to_many("tags", "Tag", "book_tags").inversed_by("books")),
            EntityMetadata::new("Tag")
                .property(EntityProperty::scalar("label"))
                .property(EntityProperty::many_to_many("books", "Book", "book_tags").mapped_by("tags")),
        ])
        .unwrap()
    }

    fn store() -> MemoryStore<MetadataStorage> {
        let store = MemoryStore::new(registry());
        store.insert("Author", EntityData::new(1_i64).scalar("name", "Ann"));
        store.insert("Author", EntityData::new(2_i64).scalar("name", "Bob"));
        store.insert(
            "Book",
            EntityData::new(10_i64).scalar("title", "B").one("author", 1_i64).many("tags", [100_i64]),
        );
        store.insert(
            "Book",
            EntityData::new(11_i64).scalar("title", "A").one("author", 1_i64).many("tags", [100_i64, 101]),
        );
        store.insert("Book", EntityData::new(20_i64).scalar("title", "C").null("author"));
        store.insert("Tag", EntityData::new(100_i64).scalar("label", "x"));
        store.insert("Tag", EntityData::new(101_i64).scalar("label", "y"));
        store
    }

    fn keys(entities: &[EntityRef]) -> Vec<PrimaryKey> {
        entities.iter().map(EntityRef::primary_key).collect()
    }

    #[test]
    fn test_find_by_foreign_key_in() {
        let store = store();
        let filter = FilterQuery::new().with(
            FilterKey::field("author"),
            Condition::In(vec![Value::from(1_i64), Value::from(2_i64)]),
        );
        let books = store.find_now("Book", &filter, &FindOptions::default()).unwrap();
        assert_eq!(keys(&books), vec![PrimaryKey::from(10_i64), PrimaryKey::from(11_i64)]);
        assert_eq!(store.fetch_count(), 1);
        assert_eq!(store.fetches()[0].rows, 2);
    }

    #[test]
    fn test_find_sorted() {
        let store = store();
        let options = FindOptions {
            order_by: OrderMap::new().asc("title"),
            ..FindOptions::default()
        };
        let books = store.find_now("Book", &FilterQuery::new(), &options).unwrap();
        assert_eq!(
            keys(&books),
            vec![PrimaryKey::from(11_i64), PrimaryKey::from(10_i64), PrimaryKey::from(20_i64)]
        );

        let options = FindOptions {
            order_by: OrderMap::new().desc("id"),
            ..FindOptions::default()
        };
        let books = store.find_now("Book", &FilterQuery::new(), &options).unwrap();
        assert_eq!(books[0].primary_key(), PrimaryKey::from(20_i64));
    }

    #[test]
    fn test_find_nested_and_inverse_conditions() {
        let store = store();
        let filter = FilterQuery::new().nested("author", FilterQuery::new().eq("name", "Ann"));
        let books = store.find_now("Book", &filter, &FindOptions::default()).unwrap();
        assert_eq!(books.len(), 2);

        // Inverse side: authors having book 20 (none) or 10 (Ann)
        let filter = FilterQuery::new().with(FilterKey::field("books"), Condition::Eq(Value::from(10_i64)));
        let authors = store.find_now("Author", &filter, &FindOptions::default()).unwrap();
        assert_eq!(keys(&authors), vec![PrimaryKey::from(1_i64)]);
    }

    #[test]
    fn test_merge_uses_identity_map() {
        let store = store();
        let first = store.find_now("Book", &FilterQuery::new().eq("id", 10_i64), &FindOptions::default()).unwrap();
        let second = store.find_now("Book", &FilterQuery::new().eq("id", 10_i64), &FindOptions::default()).unwrap();
        assert!(first[0].ptr_eq(&second[0]));
        assert!(first[0].is_initialized());

        // The author is a stub until loaded
        let author = store.get("Author", &PrimaryKey::from(1_i64)).unwrap();
        assert!(!author.is_initialized());
        match first[0].read().relation("author") {
            RelationValue::Entity(e) => assert!(e.ptr_eq(&author)),
            other => panic!("expected inline author, got {other:?}"),
        }
        let guard = first[0].read();
        let tags = guard.collection("tags").unwrap();
        assert!(!tags.is_initialized());
    }

    #[test]
    fn test_merge_null_foreign_key_is_empty() {
        let store = store();
        let books = store.find_now("Book", &FilterQuery::new().eq("id", 20_i64), &FindOptions::default()).unwrap();
        assert!(matches!(books[0].read().relation("author"), RelationValue::Empty));
    }

    #[test]
    fn test_pivot_both_sides() {
        let store = store();
        let registry = registry();
        let tags = registry.get_metadata("Book").unwrap().get("tags").unwrap().clone();
        let rows = store
            .pivot_now(
                "Book",
                &tags,
                &[PrimaryKey::from(10_i64), PrimaryKey::from(11_i64)],
                &FilterQuery::new(),
                &FindOptions::default(),
            )
            .unwrap();
        assert_eq!(rows["10"].len(), 1);
        assert_eq!(rows["11"].len(), 2);

        let books = registry.get_metadata("Tag").unwrap().get("books").unwrap().clone();
        let rows = store
            .pivot_now("Tag", &books, &[PrimaryKey::from(100_i64)], &FilterQuery::new(), &FindOptions::default())
            .unwrap();
        assert_eq!(rows["100"].len(), 2);
        assert_eq!(store.fetches_for("Book")[0].kind, FetchLogKind::Pivot);
    }

    #[test]
    fn test_without_pivot_tables_owning_collection_has_references() {
        let store = store().with_capabilities(DriverCapabilities { pivot_tables: false });
        let books = store.find_now("Book", &FilterQuery::new().eq("id", 11_i64), &FindOptions::default()).unwrap();
        let guard = books[0].read();
        let tags = guard.collection("tags").unwrap();
        assert_eq!(tags.len(), 2);
        assert!(!tags.is_initialized());
    }

    #[test]
    fn test_fail_next() {
        let store = store();
        store.fail_next("Book");
        let err = store
            .find_now("Book", &FilterQuery::new(), &FindOptions::default())
            .unwrap_err();
        assert!(err.is_query_error());
        assert!(store.find_now("Book", &FilterQuery::new(), &FindOptions::default()).is_ok());
    }

    #[test]
    fn test_clear_detaches() {
        let store = store();
        let books = store.find_now("Book", &FilterQuery::new(), &FindOptions::default()).unwrap();
        store.clear();
        assert!(books[0].read().relation("author").is_unset());
        assert!(store.get("Book", &PrimaryKey::from(10_i64)).is_none());
    }

    #[test]
    fn test_async_find() {
        use asupersync::runtime::RuntimeBuilder;

        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store();

        rt.block_on(async {
            let outcome = store.find(&cx, "Author", &FilterQuery::new(), &FindOptions::default()).await;
            match outcome {
                Outcome::Ok(authors) => assert_eq!(authors.len(), 2),
                other => panic!("unexpected outcome: {other:?}"),
            }
        });
    }
}
