//! relfill - batched relationship population for entity graphs.
//!
//! Given entities that were already loaded and a declarative populate
//! request, relfill fills in their relations (to-one references, to-many
//! collections, many-to-many links through join tables) with one fetch per
//! relation and level, however many entities are involved.
//!
//! - Requests can be dotted paths (`"books.reviews"`), node trees, or `"*"`
//!   for everything reachable
//! - Relations declared eager are always included
//! - Relations that are already loaded are not fetched again unless
//!   `force_refresh` is set
//! - Storage is reached through the [`Driver`] traits; [`MemoryStore`] is an
//!   in-memory implementation
//!
//! # Quick Start
//!
//! ```ignore
//! use relfill::prelude::*;
//!
//! let registry = Arc::new(MetadataStorage::build(vec![
//!     EntityMetadata::new("Author")
//!         .property(EntityProperty::scalar("name"))
//!         .property(EntityProperty::one_to_many("books", "Book", "author")),
//!     EntityMetadata::new("Book")
//!         .property(EntityProperty::scalar("title"))
//!         .property(EntityProperty::many_to_one("author", "Author")),
//! ])?);
//! let (store, loader) = relfill::memory_loader(registry, PopulateConfig::default());
//!
//! let authors = store.find_now("Author", &FilterQuery::new(), &FindOptions::default())?;
//! loader
//!     .populate(&cx, "Author", &authors, ["books"], &PopulateOptions::default())
//!     .await;
//! ```

pub use relfill_core::{
    Collection, Condition, ConfigError, Cx, Driver, DriverCapabilities, Entity, EntityData,
    EntityFinder, EntityMerger, EntityMetadata, EntityProperty, EntityRef, EntitySet, Error,
    FilterKey, FilterQuery, FindOptions, JoinSide, LoadStrategy, MetadataError,
    MetadataErrorKind, MetadataPolicy, MetadataRegistry, MetadataStorage, OrderDirection,
    OrderEntry, OrderMap, Outcome, POPULATE_ALL, PivotLoader, PopulateConfig, PopulateError,
    PopulateErrorKind, PopulateNode, PopulateOptions, PopulatePolicy, PopulateRequest, PrimaryKey,
    QueryError, QueryErrorKind, Reference, ReferenceKind, RelationData, RelationTarget,
    RelationValue, Result, TransactionContext, Value, WeakEntityRef,
};
pub use relfill_loader::{EntityLoader, FetchKind, FetchRecord, FetchStats, FetchTracker, normalize};
pub use relfill_memory::{FetchLogEntry, FetchLogKind, IdentityMap, MemoryStore, ObjectKey};

use std::sync::Arc;

/// Loader wired to a shared in-memory store.
pub type MemoryLoader<R> = EntityLoader<R, Arc<MemoryStore<R>>>;

/// Build an in-memory store and a loader sharing it, both following `config`.
pub fn memory_loader<R>(registry: R, config: PopulateConfig) -> (Arc<MemoryStore<R>>, MemoryLoader<R>)
where
    R: MetadataRegistry + Clone,
{
    let store = Arc::new(MemoryStore::new(registry.clone()).with_config(&config));
    tracing::debug!(config = ?config, "Created in-memory loader");
    let loader = EntityLoader::with_config(registry, Arc::clone(&store), config);
    (store, loader)
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        // Entities and relations
        Collection,
        // asupersync
        Cx,
        Driver,
        DriverCapabilities,
        EntityData,
        // Engine
        EntityLoader,
        // Metadata
        EntityMetadata,
        EntityProperty,
        EntityRef,
        Error,
        FilterKey,
        // Fetch options
        FilterQuery,
        FindOptions,
        LoadStrategy,
        MemoryStore,
        MetadataRegistry,
        MetadataStorage,
        OrderMap,
        Outcome,
        PopulateConfig,
        PopulateNode,
        PopulateOptions,
        PopulateRequest,
        PrimaryKey,
        Reference,
        RelationValue,
        Result,
        Value,
        memory_loader,
    };
}
