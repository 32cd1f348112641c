//! Populate requests and the normalized node tree.

use crate::metadata::LoadStrategy;
use serde::{Deserialize, Serialize};

/// Wildcard path meaning "every relation, recursively".
pub const POPULATE_ALL: &str = "*";

/// One relation to load, with the relations to load below it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulateNode {
    /// Relation name. May contain dots before normalization.
    pub field: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PopulateNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<LoadStrategy>,
    /// Request every relation; consumed by normalization.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub all: bool,
}

impl PopulateNode {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ..Self::default()
        }
    }

    /// Node requesting everything.
    pub fn all() -> Self {
        Self {
            field: POPULATE_ALL.to_string(),
            all: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn child(mut self, child: PopulateNode) -> Self {
        self.children.push(child);
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: LoadStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Render the subtree as dotted leaf paths, e.g. `books.reviews`.
    pub fn paths(&self) -> Vec<String> {
        if self.children.is_empty() {
            return vec![self.field.clone()];
        }
        self.children
            .iter()
            .flat_map(PopulateNode::paths)
            .map(|rest| format!("{}.{}", self.field, rest))
            .collect()
    }
}

/// A populate request as supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PopulateRequest {
    /// Populate nothing.
    #[default]
    Nothing,
    /// Populate every relation, recursively.
    All,
    /// Dotted relation paths.
    Paths(Vec<String>),
    /// Pre-built node trees.
    Tree(Vec<PopulateNode>),
}

impl PopulateRequest {
    /// Build from dotted paths. An empty list populates nothing and `"*"`
    /// populates everything.
    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths: Vec<String> = paths.into_iter().map(Into::into).collect();
        if paths.is_empty() {
            PopulateRequest::Nothing
        } else if paths.iter().any(|p| p == POPULATE_ALL) {
            PopulateRequest::All
        } else {
            PopulateRequest::Paths(paths)
        }
    }

    /// Build from node trees.
    pub fn tree(nodes: Vec<PopulateNode>) -> Self {
        if nodes.is_empty() {
            PopulateRequest::Nothing
        } else if nodes.iter().any(|n| n.all || n.field == POPULATE_ALL) {
            PopulateRequest::All
        } else {
            PopulateRequest::Tree(nodes)
        }
    }

    pub fn is_nothing(&self) -> bool {
        match self {
            PopulateRequest::Nothing => true,
            PopulateRequest::Paths(paths) => paths.is_empty(),
            PopulateRequest::Tree(nodes) => nodes.is_empty(),
            PopulateRequest::All => false,
        }
    }
}

impl From<bool> for PopulateRequest {
    fn from(all: bool) -> Self {
        if all {
            PopulateRequest::All
        } else {
            PopulateRequest::Nothing
        }
    }
}

impl From<&str> for PopulateRequest {
    fn from(path: &str) -> Self {
        Self::paths([path])
    }
}

impl From<Vec<&str>> for PopulateRequest {
    fn from(paths: Vec<&str>) -> Self {
        Self::paths(paths)
    }
}

impl From<&[&str]> for PopulateRequest {
    fn from(paths: &[&str]) -> Self {
        Self::paths(paths.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for PopulateRequest {
    fn from(paths: [&str; N]) -> Self {
        Self::paths(paths)
    }
}

impl From<Vec<String>> for PopulateRequest {
    fn from(paths: Vec<String>) -> Self {
        Self::paths(paths)
    }
}

impl From<Vec<PopulateNode>> for PopulateRequest {
    fn from(nodes: Vec<PopulateNode>) -> Self {
        Self::tree(nodes)
    }
}

impl From<PopulateNode> for PopulateRequest {
    fn from(node: PopulateNode) -> Self {
        Self::tree(vec![node])
    }
}
