//! Core types and traits for relfill.
//!
//! This crate provides the building blocks the population engine works on:
//!
//! - `EntityMetadata` / `EntityProperty` describing entity types and relations
//! - `EntityRef`, `Collection` and `Reference` holding loaded entity graphs
//! - `FilterQuery` and `OrderMap` passed to the persistence layer
//! - `Driver` and friends, the collaborator traits a backend implements
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod config;
pub mod driver;
pub mod entity;
pub mod error;
pub mod filter;
pub mod metadata;
pub mod populate;
pub mod relation;
pub mod value;

pub use config::{PopulateConfig, PopulateOptions, TransactionContext};
pub use driver::{
    Driver, DriverCapabilities, EntityData, EntityFinder, EntityMerger, FindOptions,
    MetadataPolicy, PivotLoader, PopulatePolicy, RelationData,
};
pub use entity::{Entity, EntityRef, EntitySet, WeakEntityRef};
pub use error::{
    ConfigError, Error, MetadataError, MetadataErrorKind, PopulateError, PopulateErrorKind,
    QueryError, QueryErrorKind, Result,
};
pub use filter::{Condition, FilterKey, FilterQuery, OrderDirection, OrderEntry, OrderMap};
pub use metadata::{
    EntityMetadata, EntityProperty, JoinSide, LoadStrategy, MetadataRegistry, MetadataStorage,
    ReferenceKind,
};
pub use populate::{POPULATE_ALL, PopulateNode, PopulateRequest};
pub use relation::{Collection, Reference, RelationTarget, RelationValue};
pub use value::{PrimaryKey, Value};
