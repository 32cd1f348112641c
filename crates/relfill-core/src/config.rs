//! Loader configuration and per-call populate options.

use crate::error::{ConfigError, Error, Result};
use crate::filter::{FilterQuery, OrderMap};
use crate::metadata::LoadStrategy;
use serde::{Deserialize, Serialize};

/// Engine-wide populate configuration.
///
/// Can be built in code or deserialized from JSON:
///
/// ```ignore
/// let config = PopulateConfig::from_json(r#"{"auto_join_one_to_one_owner": true}"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PopulateConfig {
    /// When loading the inverse side of a one-to-one, the owning side was
    /// joined into the parent query and already left a reference behind.
    /// When false, the owners are looked up by the parents' keys instead.
    pub auto_join_one_to_one_owner: bool,
    /// Strategy given to nodes that do not name one.
    pub default_strategy: LoadStrategy,
    /// Record every fetch and warn when a relation is fetched twice in one call.
    pub track_fetches: bool,
}

impl Default for PopulateConfig {
    fn default() -> Self {
        Self {
            auto_join_one_to_one_owner: false,
            default_strategy: LoadStrategy::SelectIn,
            track_fetches: true,
        }
    }
}

impl PopulateConfig {
    /// Create new default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from JSON. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid populate configuration: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }

    /// Set `auto_join_one_to_one_owner` (builder pattern).
    #[must_use]
    pub fn auto_join_one_to_one_owner(mut self, value: bool) -> Self {
        self.auto_join_one_to_one_owner = value;
        self
    }

    /// Set the default load strategy (builder pattern).
    #[must_use]
    pub fn default_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Enable or disable fetch tracking (builder pattern).
    #[must_use]
    pub fn track_fetches(mut self, value: bool) -> Self {
        self.track_fetches = value;
        self
    }
}

/// Opaque transaction handle passed through to the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionContext(String);

impl TransactionContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn label(&self) -> &str {
        &self.0
    }
}

/// Options for a single `populate` call.
#[derive(Debug, Clone)]
pub struct PopulateOptions {
    /// Conditions on the root entities' relations, keyed by relation name.
    pub filter: FilterQuery,
    /// Ordering for populated relations, keyed by relation name.
    pub order_by: OrderMap,
    /// Reload relations that are already initialized.
    pub force_refresh: bool,
    /// Reject fields the entity type does not allow.
    pub validate: bool,
    /// Merge relations declared eager into the request.
    pub expand_eager: bool,
    pub transaction: Option<TransactionContext>,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            filter: FilterQuery::new(),
            order_by: OrderMap::new(),
            force_refresh: false,
            validate: true,
            expand_eager: true,
            transaction: None,
        }
    }
}

impl PopulateOptions {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, filter: FilterQuery) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: OrderMap) -> Self {
        self.order_by = order;
        self
    }

    /// Set the `force_refresh` option (builder pattern).
    #[must_use]
    pub fn force_refresh(mut self, value: bool) -> Self {
        self.force_refresh = value;
        self
    }

    /// Set the `validate` option (builder pattern).
    #[must_use]
    pub fn validate(mut self, value: bool) -> Self {
        self.validate = value;
        self
    }

    /// Set the `expand_eager` option (builder pattern).
    #[must_use]
    pub fn expand_eager(mut self, value: bool) -> Self {
        self.expand_eager = value;
        self
    }

    #[must_use]
    pub fn transaction(mut self, tx: TransactionContext) -> Self {
        self.transaction = Some(tx);
        self
    }
}
