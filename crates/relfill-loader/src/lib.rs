//! Batched relationship population for relfill.
//!
//! [`EntityLoader::populate`] takes a set of already-loaded root entities and
//! a populate request and fills in the requested relations:
//!
//! 1. the request is normalized into a tree of [`PopulateNode`]s
//!    ([`normalize`](normalize::normalize)),
//! 2. every node is loaded for the whole parent set with one fetch,
//! 3. fetched children are linked back onto their parents,
//! 4. the loader recurses into child nodes with the children just linked.
//!
//! Nodes are processed one at a time. A failed fetch aborts the call;
//! relations hydrated before the failure stay hydrated.
//!
//! # Example
//!
//! ```ignore
//! let loader = EntityLoader::new(registry, driver);
//! let authors = driver.find(&cx, "Author", &FilterQuery::new(), &FindOptions::default()).await;
//! loader
//!     .populate(&cx, "Author", &authors, ["books.reviews"], &PopulateOptions::default())
//!     .await;
//! ```

pub mod fetch_tracker;
pub mod normalize;

mod batch;
mod link;

pub use fetch_tracker::{FetchKind, FetchRecord, FetchStats, FetchTracker};
pub use normalize::normalize;

use batch::LoadScope;
use relfill_core::{
    Cx, Driver, EntityRef, Error, MetadataPolicy, MetadataRegistry, Outcome, PopulateConfig,
    PopulateNode, PopulateOptions, PopulatePolicy, PopulateRequest,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

type PopulateFuture<'a> = Pin<Box<dyn Future<Output = Outcome<(), Error>> + Send + 'a>>;

/// The population engine.
///
/// Owns everything a populate call needs: the metadata registry, the driver
/// that fetches and merges entities, the populate policy and configuration.
pub struct EntityLoader<R, D> {
    pub(crate) registry: R,
    pub(crate) driver: D,
    pub(crate) policy: Box<dyn PopulatePolicy>,
    pub(crate) config: PopulateConfig,
    tracker: Mutex<FetchTracker>,
}

impl<R, D> std::fmt::Debug for EntityLoader<R, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityLoader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: MetadataRegistry, D: Driver> EntityLoader<R, D> {
    /// Create a loader with the default configuration.
    pub fn new(registry: R, driver: D) -> Self {
        Self::with_config(registry, driver, PopulateConfig::default())
    }

    /// Create a loader with custom configuration.
    pub fn with_config(registry: R, driver: D, config: PopulateConfig) -> Self {
        let tracker = FetchTracker::new().with_enabled(config.track_fetches);
        Self {
            registry,
            driver,
            policy: Box::new(MetadataPolicy),
            config,
            tracker: Mutex::new(tracker),
        }
    }

    /// Replace the populate policy (builder pattern).
    #[must_use]
    pub fn policy(mut self, policy: impl PopulatePolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> &PopulateConfig {
        &self.config
    }

    /// Statistics about the fetches issued so far.
    pub fn fetch_stats(&self) -> FetchStats {
        self.tracker().stats()
    }

    pub fn reset_fetch_stats(&self) {
        self.tracker().reset();
    }

    pub(crate) fn tracker(&self) -> MutexGuard<'_, FetchTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Populate `request` on `entities`, all of type `entity_type`.
    ///
    /// Does nothing for an empty entity set or an empty request. With
    /// `options.validate`, every requested field is checked against the
    /// populate policy before anything is fetched.
    #[tracing::instrument(
        level = "debug",
        skip(self, cx, entities, request, options),
        fields(count = entities.len())
    )]
    pub async fn populate(
        &self,
        cx: &Cx,
        entity_type: &str,
        entities: &[EntityRef],
        request: impl Into<PopulateRequest>,
        options: &PopulateOptions,
    ) -> Outcome<(), Error> {
        let request = request.into();
        if entities.is_empty() || request.is_nothing() {
            tracing::trace!("Nothing to populate");
            return Outcome::Ok(());
        }

        let nodes = match normalize(
            &self.registry,
            entity_type,
            &request,
            self.config.default_strategy,
            options.expand_eager,
        ) {
            Ok(nodes) => nodes,
            Err(e) => return Outcome::Err(e),
        };

        if options.validate {
            let invalid = nodes
                .iter()
                .find(|node| !self.policy.can_populate(&self.registry, entity_type, &node.field));
            if let Some(node) = invalid {
                tracing::debug!(field = %node.field, "Rejected populate field");
                return Outcome::Err(Error::invalid_populate_field(entity_type, &node.field));
            }
        }

        let call = self.tracker().begin_call();
        let scope = LoadScope::root(entity_type, options, call);
        let outcome = self
            .populate_nodes(cx, entity_type, entities, &nodes, &scope)
            .await;
        self.tracker().end_call(call);
        outcome
    }

    /// Process `nodes` in order over the same parent set.
    fn populate_nodes<'a>(
        &'a self,
        cx: &'a Cx,
        entity_type: &'a str,
        parents: &'a [EntityRef],
        nodes: &'a [PopulateNode],
        scope: &'a LoadScope,
    ) -> PopulateFuture<'a> {
        Box::pin(async move {
            for node in nodes {
                if let Some(reason) = cx.cancel_reason() {
                    return Outcome::Cancelled(reason);
                }
                match self
                    .populate_field(cx, entity_type, parents, node, scope)
                    .await
                {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            Outcome::Ok(())
        })
    }

    async fn populate_field(
        &self,
        cx: &Cx,
        entity_type: &str,
        parents: &[EntityRef],
        node: &PopulateNode,
        scope: &LoadScope,
    ) -> Outcome<(), Error> {
        let Some(meta) = self.registry.get_metadata(entity_type) else {
            return Outcome::Err(Error::unknown_entity(entity_type));
        };
        let Some(prop) = meta.get(&node.field) else {
            tracing::debug!(
                entity = entity_type,
                field = %node.field,
                "Skipping unknown populate field"
            );
            return Outcome::Ok(());
        };
        if prop.kind.is_scalar() {
            tracing::trace!(field = %node.field, "Scalar field, nothing to batch");
            return Outcome::Ok(());
        }

        match self
            .populate_many(cx, entity_type, parents, prop, node, scope)
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        if node.children.is_empty() {
            return Outcome::Ok(());
        }
        let Some(target) = prop.target_type.as_deref() else {
            return Outcome::Ok(());
        };
        let children = link::collect_children(parents, &prop.name).into_vec();
        if children.is_empty() {
            return Outcome::Ok(());
        }

        tracing::trace!(
            field = %node.field,
            child_count = children.len(),
            "Descending into nested populate"
        );
        let child_scope = scope.descend(&prop.name);
        self.populate_nodes(cx, target, &children, &node.children, &child_scope)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use relfill_core::{
        Condition, EntityData, EntityMetadata, EntityProperty, FilterKey, FilterQuery,
        FindOptions, MetadataStorage, Value,
    };
    use relfill_memory::MemoryStore;
    use std::sync::Arc;

    type Store = Arc<MemoryStore<Arc<MetadataStorage>>>;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn setup(config: PopulateConfig) -> (Store, EntityLoader<Arc<MetadataStorage>, Store>) {
        let registry = Arc::new(
            MetadataStorage::build(vec![
                EntityMetadata::new("Author")
                    .property(EntityProperty::scalar("name"))
                    .property(EntityProperty::one_to_many("books", "Book", "author")),
                EntityMetadata::new("Book")
                    .property(EntityProperty::scalar("title"))
                    .property(EntityProperty::many_to_one("author", "Author").inversed_by("books")),
            ])
            .expect("valid metadata"),
        );
        let store = Arc::new(MemoryStore::new(Arc::clone(&registry)));
        store.insert("Author", EntityData::new(1_i64).scalar("name", "Ann"));
        store.insert(
            "Book",
            EntityData::new(10_i64).scalar("title", "Dune").one("author", 1_i64),
        );
        let loader = EntityLoader::with_config(registry, Arc::clone(&store), config);
        (store, loader)
    }

    fn authors(store: &Store) -> Vec<EntityRef> {
        let authors = store
            .find_now("Author", &FilterQuery::new(), &FindOptions::default())
            .expect("load authors");
        store.clear_log();
        authors
    }

    #[test]
    fn test_populated_markers_set() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, loader) = setup(PopulateConfig::default());

        rt.block_on(async {
            let authors = authors(&store);
            unwrap_outcome(
                loader
                    .populate(&cx, "Author", &authors, ["books"], &PopulateOptions::default())
                    .await,
            );
            let guard = authors[0].read();
            assert!(guard.is_populated());
            let books = guard.collection("books").expect("books");
            assert!(books.is_populated());
            assert!(books.is_initialized());
        });
    }

    #[test]
    fn test_duplicate_parents_share_one_key() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, loader) = setup(PopulateConfig::default());

        rt.block_on(async {
            let mut parents = authors(&store);
            parents.push(parents[0].clone());
            unwrap_outcome(
                loader
                    .populate(&cx, "Author", &parents, ["books"], &PopulateOptions::default())
                    .await,
            );
            let fetches = store.fetches();
            assert_eq!(fetches.len(), 1);
            assert_eq!(
                fetches[0].filter,
                FilterQuery::new().with(
                    FilterKey::field("author"),
                    Condition::In(vec![Value::from(1_i64)]),
                )
            );
            let guard = parents[0].read();
            assert_eq!(guard.collection("books").map(|c| c.len()), Some(1));
        });
    }

    #[test]
    fn test_scalar_field_fetches_nothing() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, loader) = setup(PopulateConfig::default());

        rt.block_on(async {
            let authors = authors(&store);
            unwrap_outcome(
                loader
                    .populate(&cx, "Author", &authors, ["name"], &PopulateOptions::default())
                    .await,
            );
            assert_eq!(store.fetch_count(), 0);
        });
    }

    #[test]
    fn test_tracking_can_be_disabled() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, loader) = setup(PopulateConfig::new().track_fetches(false));

        rt.block_on(async {
            let authors = authors(&store);
            unwrap_outcome(
                loader
                    .populate(&cx, "Author", &authors, ["books"], &PopulateOptions::default())
                    .await,
            );
            assert_eq!(store.fetch_count(), 1);
            assert_eq!(loader.fetch_stats().total_fetches, 0);
        });
    }
}
