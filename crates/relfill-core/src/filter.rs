//! Filter conditions and ordering maps passed to the persistence layer.
//!
//! Both structures are keyed by property name and may nest: a condition or
//! ordering stored under a relationship name applies to the related entity.

use crate::value::Value;

/// The left-hand side of a filter condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterKey {
    /// The entity's primary key (composite keys compare as arrays)
    PrimaryKey,
    /// A named property. For to-one relations the value is the target's key.
    Field(String),
}

impl FilterKey {
    /// Key for a named property.
    pub fn field(name: impl Into<String>) -> Self {
        FilterKey::Field(name.into())
    }
}

/// A condition on one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Equal to the value
    Eq(Value),
    /// Member of the list
    In(Vec<Value>),
    /// Sub-filter applied to the related entity
    Nested(FilterQuery),
}

/// An AND-combined list of conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterQuery {
    conditions: Vec<(FilterKey, Condition)>,
}

impl FilterQuery {
    /// Create an empty filter (matches everything).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition.
    #[must_use]
    pub fn with(mut self, key: FilterKey, condition: Condition) -> Self {
        self.conditions.push((key, condition));
        self
    }

    /// Add an equality condition on a property.
    #[must_use]
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(FilterKey::field(field), Condition::Eq(value.into()))
    }

    /// Add a nested condition for a relation.
    #[must_use]
    pub fn nested(self, field: impl Into<String>, filter: FilterQuery) -> Self {
        self.with(FilterKey::field(field), Condition::Nested(filter))
    }

    /// Append all conditions from `other`.
    #[must_use]
    pub fn merged(mut self, other: FilterQuery) -> Self {
        self.conditions.extend(other.conditions);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[(FilterKey, Condition)] {
        &self.conditions
    }

    /// The sub-filter stored under a relation name, used when descending
    /// into that relation. Non-nested conditions yield an empty filter.
    pub fn nested_for(&self, field: &str) -> FilterQuery {
        let mut out = FilterQuery::new();
        for (key, condition) in &self.conditions {
            if let (FilterKey::Field(name), Condition::Nested(inner)) = (key, condition) {
                if name == field {
                    out = out.merged(inner.clone());
                }
            }
        }
        out
    }

    /// The condition to apply to the children fetched for a relation.
    ///
    /// A nested filter under the relation name is used as is. A bare
    /// operator under the relation name (`tags: In([..])`) applies to the
    /// child's primary key.
    pub fn child_condition(&self, field: &str) -> FilterQuery {
        let mut out = FilterQuery::new();
        for (key, condition) in &self.conditions {
            let FilterKey::Field(name) = key else {
                continue;
            };
            if name != field {
                continue;
            }
            match condition {
                Condition::Nested(inner) => out = out.merged(inner.clone()),
                bare => out = out.with(FilterKey::PrimaryKey, bare.clone()),
            }
        }
        out
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// One ordering entry: a direction for a property, or a nested ordering
/// for a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEntry {
    Direction(OrderDirection),
    Nested(OrderMap),
}

/// Ordered list of sort keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderMap {
    entries: Vec<(String, OrderEntry)>,
}

impl OrderMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort ascending by a property.
    #[must_use]
    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.entries
            .push((field.into(), OrderEntry::Direction(OrderDirection::Asc)));
        self
    }

    /// Sort descending by a property.
    #[must_use]
    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.entries
            .push((field.into(), OrderEntry::Direction(OrderDirection::Desc)));
        self
    }

    /// Ordering for the entities of a relation.
    #[must_use]
    pub fn nested(mut self, field: impl Into<String>, order: OrderMap) -> Self {
        self.entries.push((field.into(), OrderEntry::Nested(order)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, OrderEntry)] {
        &self.entries
    }

    /// The direct sort keys, skipping nested relation orderings.
    pub fn directions(&self) -> impl Iterator<Item = (&str, OrderDirection)> {
        self.entries.iter().filter_map(|(field, entry)| match entry {
            OrderEntry::Direction(dir) => Some((field.as_str(), *dir)),
            OrderEntry::Nested(_) => None,
        })
    }

    /// The ordering stored under a relation name.
    pub fn nested_for(&self, field: &str) -> OrderMap {
        let mut out = OrderMap::new();
        for (name, entry) in &self.entries {
            if let OrderEntry::Nested(inner) = entry {
                if name == field {
                    out.entries.extend(inner.entries.iter().cloned());
                }
            }
        }
        out
    }
}
