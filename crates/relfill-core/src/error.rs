//! Error types for relfill operations.

use std::fmt;

/// The primary error type for all relfill operations.
#[derive(Debug)]
pub enum Error {
    /// Populate request errors (unknown field, malformed path)
    Populate(PopulateError),
    /// Metadata registration errors
    Metadata(MetadataError),
    /// Fetch errors reported by the persistence layer
    Query(QueryError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct PopulateError {
    pub kind: PopulateErrorKind,
    /// Entity type the request was made against
    pub entity_type: String,
    /// The offending field or path
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateErrorKind {
    /// The field is not populatable on the entity type
    InvalidField,
    /// A dotted path segment does not resolve, or the path is not well formed
    MalformedPath,
    /// No metadata is registered for the entity type
    UnknownEntity,
}

#[derive(Debug)]
pub struct MetadataError {
    pub kind: MetadataErrorKind,
    pub entity_type: String,
    pub property: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataErrorKind {
    /// Relation declares both or neither of owner / mapped_by
    AmbiguousSide,
    /// Relation points at a type that is not registered
    UnknownTarget,
    /// Relation is missing a required attribute (target, mapped_by, ...)
    Incomplete,
    /// Entity type registered twice
    Duplicate,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Entity type being fetched, when known
    pub entity_type: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Direct find by filter failed
    Find,
    /// Join-table load failed
    PivotLoad,
    /// Merging fetched data into the identity map failed
    Merge,
    /// Other backend failure
    Database,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Error for a populate field the entity type does not allow.
    pub fn invalid_populate_field(entity_type: impl Into<String>, field: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let field = field.into();
        Error::Populate(PopulateError {
            kind: PopulateErrorKind::InvalidField,
            message: format!("Entity '{entity_type}' does not have property '{field}'"),
            entity_type,
            field,
        })
    }

    /// Error for a populate path that cannot be resolved.
    pub fn malformed_path(
        entity_type: impl Into<String>,
        path: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        let entity_type = entity_type.into();
        let field = path.into();
        Error::Populate(PopulateError {
            kind: PopulateErrorKind::MalformedPath,
            message: format!("Cannot populate '{field}' on '{entity_type}': {reason}"),
            entity_type,
            field,
        })
    }

    /// Error for an entity type with no registered metadata.
    pub fn unknown_entity(entity_type: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        Error::Populate(PopulateError {
            kind: PopulateErrorKind::UnknownEntity,
            message: format!("No metadata registered for entity '{entity_type}'"),
            field: String::new(),
            entity_type,
        })
    }

    /// Error raised by a driver while fetching.
    pub fn query(kind: QueryErrorKind, entity_type: Option<&str>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            entity_type: entity_type.map(str::to_string),
            message: message.into(),
            source: None,
        })
    }

    /// The populate error kind, if this is a populate error.
    pub fn populate_kind(&self) -> Option<PopulateErrorKind> {
        match self {
            Error::Populate(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Is this an error reported by the persistence layer?
    pub fn is_query_error(&self) -> bool {
        matches!(self, Error::Query(_))
    }
}

impl MetadataError {
    pub(crate) fn new(
        kind: MetadataErrorKind,
        entity_type: &str,
        property: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity_type: entity_type.to_string(),
            property: property.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Populate(e) => write!(f, "Populate error: {}", e.message),
            Error::Metadata(e) => match &e.property {
                Some(prop) => write!(
                    f,
                    "Metadata error on '{}.{}': {}",
                    e.entity_type, prop, e.message
                ),
                None => write!(f, "Metadata error on '{}': {}", e.entity_type, e.message),
            },
            Error::Query(e) => match &e.entity_type {
                Some(entity) => write!(f, "Query error ({}): {}", entity, e.message),
                None => write!(f, "Query error: {}", e.message),
            },
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for PopulateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<PopulateError> for Error {
    fn from(err: PopulateError) -> Self {
        Error::Populate(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relfill operations.
pub type Result<T> = std::result::Result<T, Error>;
