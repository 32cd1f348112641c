//! Populate request normalization.
//!
//! Turns whatever the caller asked for (everything, dotted paths, node
//! trees) into one canonical tree of [`PopulateNode`]s:
//!
//! - the wildcard expands to every relation reachable from the root type,
//!   with a visited-type guard so cyclic entity graphs terminate
//! - dotted paths are split into nested child nodes, checking each segment
//!   against metadata
//! - siblings naming the same relation are merged
//! - relations declared eager are added where they are not already requested
//!
//! # Example
//!
//! ```ignore
//! let nodes = normalize(&registry, "Author", &["books.reviews"].into(), LoadStrategy::SelectIn, true)?;
//! assert_eq!(nodes[0].field, "books");
//! assert_eq!(nodes[0].children[0].field, "reviews");
//! ```

use regex::Regex;
use relfill_core::{
    EntityProperty, Error, LoadStrategy, MetadataRegistry, POPULATE_ALL, PopulateNode,
    PopulateRequest, Result,
};
use std::sync::OnceLock;

/// Dot-separated identifiers, optionally ending in the wildcard:
/// `books`, `books.reviews`, `owner_profile.avatar`, `books.*`.
fn path_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*(\.\*)?$").ok()
        })
        .as_ref()
}

fn is_wildcard(node: &PopulateNode) -> bool {
    node.all || node.field == POPULATE_ALL
}

fn check_syntax(entity_type: &str, path: &str) -> Result<()> {
    match path_pattern() {
        Some(pattern) if !pattern.is_match(path) => Err(Error::malformed_path(
            entity_type,
            path,
            "expected dot-separated property names",
        )),
        _ => Ok(()),
    }
}

/// Normalize a populate request against the metadata of `entity_type`.
///
/// An unknown *first* segment is kept as a childless node so that the caller
/// can report it as an invalid field (or skip it when validation is off).
/// Unknown deeper segments and paths descending through a scalar are
/// malformed path errors.
pub fn normalize<R: MetadataRegistry + ?Sized>(
    registry: &R,
    entity_type: &str,
    request: &PopulateRequest,
    default_strategy: LoadStrategy,
    expand_eager: bool,
) -> Result<Vec<PopulateNode>> {
    if registry.get_metadata(entity_type).is_none() {
        return Err(Error::unknown_entity(entity_type));
    }

    let requested = match request {
        PopulateRequest::Nothing => return Ok(Vec::new()),
        PopulateRequest::All => lookup_all(registry, entity_type, default_strategy),
        PopulateRequest::Paths(paths) if paths.iter().any(|p| p == POPULATE_ALL) => {
            lookup_all(registry, entity_type, default_strategy)
        }
        PopulateRequest::Paths(paths) => paths.iter().map(PopulateNode::new).collect(),
        PopulateRequest::Tree(nodes) if nodes.iter().any(|n| n.all || n.field == POPULATE_ALL) => {
            lookup_all(registry, entity_type, default_strategy)
        }
        PopulateRequest::Tree(nodes) => nodes.clone(),
    };
    if requested.is_empty() {
        return Ok(Vec::new());
    }

    let mut expanded = Vec::with_capacity(requested.len());
    for node in requested {
        expanded.push(expand_node(
            registry,
            entity_type,
            "",
            node,
            default_strategy,
            false,
            &[],
        )?);
    }
    let mut nodes = merge_siblings(expanded);

    if expand_eager {
        let mut visited = Vec::new();
        merge_eager(registry, entity_type, &mut nodes, &mut visited, default_strategy);
    }

    tracing::debug!(
        entity = entity_type,
        nodes = nodes.len(),
        paths = ?nodes.iter().flat_map(PopulateNode::paths).collect::<Vec<_>>(),
        "Normalized populate request"
    );
    Ok(nodes)
}

/// Every relation reachable from `entity_type`, as dotted leaf paths.
///
/// One visited list is shared across the whole walk: a type reached a second
/// time expands to nothing, which leaves the relation pointing at it as a
/// leaf.
pub fn lookup_all<R: MetadataRegistry + ?Sized>(
    registry: &R,
    entity_type: &str,
    default_strategy: LoadStrategy,
) -> Vec<PopulateNode> {
    let mut visited = Vec::new();
    let nodes = collect_all(registry, entity_type, "", &mut visited, default_strategy);
    tracing::trace!(
        entity = entity_type,
        leaves = nodes.len(),
        visited = visited.len(),
        "Expanded populate wildcard"
    );
    nodes
}

fn collect_all<R: MetadataRegistry + ?Sized>(
    registry: &R,
    entity_type: &str,
    prefix: &str,
    visited: &mut Vec<String>,
    default_strategy: LoadStrategy,
) -> Vec<PopulateNode> {
    let Some(meta) = registry.get_metadata(entity_type) else {
        return Vec::new();
    };
    if visited.iter().any(|v| v == entity_type) {
        return Vec::new();
    }
    visited.push(entity_type.to_string());

    let mut out = Vec::new();
    for prop in meta.relations() {
        let path = if prefix.is_empty() {
            prop.name.clone()
        } else {
            format!("{prefix}.{}", prop.name)
        };
        let nested = match prop.target_type.as_deref() {
            Some(target) => collect_all(registry, target, &path, visited, default_strategy),
            None => Vec::new(),
        };
        if nested.is_empty() {
            let mut leaf = PopulateNode::new(path);
            leaf.strategy = Some(prop.strategy.unwrap_or(default_strategy));
            out.push(leaf);
        } else {
            out.extend(nested);
        }
    }
    out
}

/// Every relation reachable below `target`, for a wildcard under a relation.
///
/// `ancestors` are the types already on the path; they count as visited, so
/// `books.*` from `Author` stops at `books.author` the way `*` does.
fn lookup_below<R: MetadataRegistry + ?Sized>(
    registry: &R,
    ancestors: &[String],
    target: &str,
    default_strategy: LoadStrategy,
) -> Vec<PopulateNode> {
    let mut visited: Vec<String> = ancestors.iter().filter(|a| *a != target).cloned().collect();
    collect_all(registry, target, "", &mut visited, default_strategy)
}

/// Split a (possibly dotted) node into a chain of single-segment nodes and
/// resolve its explicit children against the leaf's target type. A trailing
/// `*` segment or a wildcard child expands to everything below the target.
fn expand_node<R: MetadataRegistry + ?Sized>(
    registry: &R,
    entity_type: &str,
    prefix: &str,
    node: PopulateNode,
    default_strategy: LoadStrategy,
    nested: bool,
    ancestors: &[String],
) -> Result<PopulateNode> {
    let full_path = if prefix.is_empty() {
        node.field.clone()
    } else {
        format!("{prefix}.{}", node.field)
    };
    check_syntax(entity_type, &node.field)?;

    let (head, rest) = match node.field.split_once('.') {
        Some((head, rest)) => (head.to_string(), Some(rest.to_string())),
        None => (node.field.clone(), None),
    };
    let head_path = if prefix.is_empty() {
        head.clone()
    } else {
        format!("{prefix}.{head}")
    };

    let prop: Option<EntityProperty> = registry
        .get_metadata(entity_type)
        .and_then(|meta| meta.get(&head).cloned());
    let Some(prop) = prop else {
        if nested {
            return Err(Error::malformed_path(
                entity_type,
                full_path,
                format!("'{head}' is not a property of '{entity_type}'"),
            ));
        }
        tracing::trace!(entity = entity_type, field = %head, "Keeping unknown populate field");
        return Ok(PopulateNode {
            field: head,
            children: Vec::new(),
            strategy: node.strategy.or(Some(default_strategy)),
            all: false,
        });
    };

    let strategy = node
        .strategy
        .or(prop.strategy)
        .or(Some(default_strategy));

    let needs_target = rest.is_some() || !node.children.is_empty();
    let target = match prop.target_type.as_deref() {
        Some(target) => target,
        None if needs_target => {
            return Err(Error::malformed_path(
                entity_type,
                full_path,
                format!("'{head}' is a scalar property and has no relations below it"),
            ));
        }
        None => {
            return Ok(PopulateNode {
                field: head,
                children: Vec::new(),
                strategy,
                all: false,
            });
        }
    };

    let wildcard = rest.as_deref() == Some(POPULATE_ALL) || node.children.iter().any(is_wildcard);
    let explicit: Vec<PopulateNode> = node
        .children
        .into_iter()
        .filter(|child| !is_wildcard(child))
        .collect();
    let mut requested = match rest.filter(|rest| rest != POPULATE_ALL) {
        Some(rest) => vec![PopulateNode {
            field: rest,
            children: explicit,
            strategy: node.strategy,
            all: false,
        }],
        None => explicit,
    };

    let mut chain = ancestors.to_vec();
    chain.push(entity_type.to_string());
    if wildcard {
        tracing::trace!(entity = target, path = %head_path, "Expanding nested wildcard");
        requested.extend(lookup_below(registry, &chain, target, default_strategy));
    }

    let mut children = Vec::with_capacity(requested.len());
    for child in requested {
        children.push(expand_node(
            registry,
            target,
            &head_path,
            child,
            default_strategy,
            true,
            &chain,
        )?);
    }
    let children = merge_siblings(children);

    Ok(PopulateNode {
        field: head,
        children,
        strategy,
        all: false,
    })
}

/// Merge nodes naming the same relation so each appears once per level.
pub fn merge_siblings(nodes: Vec<PopulateNode>) -> Vec<PopulateNode> {
    let mut out: Vec<PopulateNode> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if let Some(existing) = out.iter_mut().find(|n| n.field == node.field) {
            existing.children.extend(node.children);
            existing.children = merge_siblings(std::mem::take(&mut existing.children));
            if existing.strategy.is_none() {
                existing.strategy = node.strategy;
            }
        } else {
            out.push(node);
        }
    }
    out
}

/// Add eager relations below every requested node, walking requested nodes
/// too so eager relations of requested children are found.
///
/// One visited list is shared by the whole walk, as in [`lookup_all`]: a type
/// reached a second time is not expanded again.
fn merge_eager<R: MetadataRegistry + ?Sized>(
    registry: &R,
    entity_type: &str,
    nodes: &mut Vec<PopulateNode>,
    visited: &mut Vec<String>,
    default_strategy: LoadStrategy,
) {
    let Some(meta) = registry.get_metadata(entity_type) else {
        return;
    };
    if visited.iter().any(|v| v == entity_type) {
        return;
    }
    visited.push(entity_type.to_string());

    for prop in meta.relations() {
        let Some(target) = prop.target_type.as_deref() else {
            continue;
        };
        if let Some(node) = nodes.iter_mut().find(|n| n.field == prop.name) {
            merge_eager(registry, target, &mut node.children, visited, default_strategy);
        } else if prop.eager {
            let mut node = PopulateNode::new(prop.name.clone());
            node.strategy = Some(prop.strategy.unwrap_or(default_strategy));
            merge_eager(registry, target, &mut node.children, visited, default_strategy);
            tracing::trace!(entity = entity_type, field = %prop.name, "Adding eager relation");
            nodes.push(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relfill_core::{EntityMetadata, MetadataStorage, PopulateErrorKind};

    fn registry() -> MetadataStorage {
        MetadataStorage::build(vec![
            EntityMetadata::new("Author")
                .property(EntityProperty::scalar("name"))
                .property(EntityProperty::one_to_many("books", "Book", "author")),
            EntityMetadata::new("Book")
                .property(EntityProperty::scalar("title"))
                .property(EntityProperty::many_to_one("author", "Author"))
                .property(EntityProperty::one_to_many("reviews", "Review", "book"))
                .property(EntityProperty::many_to_one("publisher", "Publisher").eager()),
            EntityMetadata::new("Review")
                .property(EntityProperty::scalar("stars"))
                .property(EntityProperty::many_to_one("book", "Book")),
            EntityMetadata::new("Publisher").property(EntityProperty::scalar("name")),
            EntityMetadata::new("Category")
                .property(EntityProperty::many_to_one("parent", "Category").eager())
                .property(EntityProperty::one_to_many("children", "Category", "parent")),
        ])
        .unwrap()
    }

    fn fields(nodes: &[PopulateNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.field.as_str()).collect()
    }

    fn run(entity: &str, request: impl Into<PopulateRequest>, eager: bool) -> Result<Vec<PopulateNode>> {
        normalize(
            &registry(),
            entity,
            &request.into(),
            LoadStrategy::SelectIn,
            eager,
        )
    }

    #[test]
    fn test_nothing_is_empty() {
        assert!(run("Author", false, true).unwrap().is_empty());
        assert!(run("Author", Vec::<&str>::new(), true).unwrap().is_empty());
    }

    #[test]
    fn test_dotted_path_becomes_nested_node() {
        let nodes = run("Author", ["books.reviews"], false).unwrap();
        assert_eq!(fields(&nodes), vec!["books"]);
        assert_eq!(fields(&nodes[0].children), vec!["reviews"]);
        assert!(nodes[0].children[0].children.is_empty());
        assert_eq!(nodes[0].strategy, Some(LoadStrategy::SelectIn));
    }

    #[test]
    fn test_siblings_merge() {
        let nodes = run("Author", ["books.reviews", "books.author", "books"], false).unwrap();
        assert_eq!(fields(&nodes), vec!["books"]);
        assert_eq!(fields(&nodes[0].children), vec!["reviews", "author"]);
    }

    #[test]
    fn test_unknown_first_segment_is_kept() {
        let nodes = run("Author", ["nope", "books"], false).unwrap();
        assert_eq!(fields(&nodes), vec!["nope", "books"]);
        assert!(nodes[0].children.is_empty());
    }

    #[test]
    fn test_unknown_nested_segment_is_malformed() {
        let err = run("Author", ["books.missing"], false).unwrap_err();
        assert_eq!(err.populate_kind(), Some(PopulateErrorKind::MalformedPath));
        assert!(err.to_string().contains("books.missing"));
    }

    #[test]
    fn test_path_through_scalar_is_malformed() {
        let err = run("Author", ["name.first"], false).unwrap_err();
        assert_eq!(err.populate_kind(), Some(PopulateErrorKind::MalformedPath));
    }

    #[test]
    fn test_bad_syntax_is_malformed() {
        for path in ["books..reviews", "books.", " books", "books-reviews"] {
            let err = run("Author", [path], false).unwrap_err();
            assert_eq!(err.populate_kind(), Some(PopulateErrorKind::MalformedPath), "{path}");
        }
    }

    #[test]
    fn test_unknown_root_entity() {
        let err = run("Ghost", ["books"], false).unwrap_err();
        assert_eq!(err.populate_kind(), Some(PopulateErrorKind::UnknownEntity));
    }

    #[test]
    fn test_wildcard_expands_with_cycle_guard() {
        let nodes = run("Author", true, false).unwrap();
        assert_eq!(fields(&nodes), vec!["books"]);
        let mut paths = nodes[0].paths();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "books.author".to_string(),
                "books.publisher".to_string(),
                "books.reviews.book".to_string(),
            ]
        );
    }

    #[test]
    fn test_wildcard_on_self_referencing_type_terminates() {
        let nodes = run("Category", ["*"], false).unwrap();
        assert_eq!(fields(&nodes), vec!["parent", "children"]);
        assert!(nodes.iter().all(|n| n.children.is_empty()));
    }

    #[test]
    fn test_wildcard_child_expands_below_relation() {
        let request = PopulateRequest::from(vec![PopulateNode::new("books").child(PopulateNode::all())]);
        let nodes = run("Author", request, false).unwrap();
        assert_eq!(fields(&nodes), vec!["books"]);
        let mut paths = nodes[0].paths();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "books.author".to_string(),
                "books.publisher".to_string(),
                "books.reviews.book".to_string(),
            ]
        );
    }

    #[test]
    fn test_dotted_wildcard_matches_wildcard_child() {
        let dotted = run("Author", ["books.*"], false).unwrap();
        let tree = run(
            "Author",
            vec![PopulateNode::new("books").child(PopulateNode::all())],
            false,
        )
        .unwrap();
        assert_eq!(dotted, tree);

        let nodes = run("Author", ["books.reviews.*"], false).unwrap();
        assert_eq!(fields(&nodes[0].children), vec!["reviews"]);
        assert_eq!(fields(&nodes[0].children[0].children), vec!["book"]);

        let err = run("Author", ["books.*.reviews"], false).unwrap_err();
        assert_eq!(err.populate_kind(), Some(PopulateErrorKind::MalformedPath));
    }

    #[test]
    fn test_wildcard_child_keeps_explicit_siblings() {
        let request = PopulateRequest::from(vec![
            PopulateNode::new("books")
                .child(PopulateNode::new("reviews.book.publisher"))
                .child(PopulateNode::all()),
        ]);
        let nodes = run("Author", request, false).unwrap();
        let mut paths = nodes[0].paths();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "books.author".to_string(),
                "books.publisher".to_string(),
                "books.reviews.book.publisher".to_string(),
            ]
        );
    }

    #[test]
    fn test_wildcard_below_self_reference_terminates() {
        let nodes = run("Category", ["children.*"], false).unwrap();
        assert_eq!(fields(&nodes), vec!["children"]);
        assert_eq!(fields(&nodes[0].children), vec!["parent", "children"]);
        assert!(nodes[0].children.iter().all(|n| n.children.is_empty()));
    }

    #[test]
    fn test_eager_walk_expands_each_type_once() {
        let registry = MetadataStorage::build(vec![
            EntityMetadata::new("Author")
                .property(EntityProperty::one_to_many("books", "Book", "author").eager())
                .property(EntityProperty::one_to_many("magazines", "Magazine", "author").eager()),
            EntityMetadata::new("Book")
                .property(EntityProperty::many_to_one("author", "Author"))
                .property(EntityProperty::many_to_one("publisher", "Publisher").eager()),
            EntityMetadata::new("Magazine")
                .property(EntityProperty::many_to_one("author", "Author"))
                .property(EntityProperty::many_to_one("publisher", "Publisher").eager()),
            EntityMetadata::new("Publisher")
                .property(EntityProperty::many_to_one("country", "Country").eager()),
            EntityMetadata::new("Country").property(EntityProperty::scalar("name")),
        ])
        .unwrap();

        let nodes = normalize(
            &registry,
            "Author",
            &PopulateRequest::from(["books"]),
            LoadStrategy::SelectIn,
            true,
        )
        .unwrap();
        let paths: Vec<String> = nodes.iter().flat_map(PopulateNode::paths).collect();
        assert_eq!(
            paths,
            vec![
                "books.publisher.country".to_string(),
                "magazines.publisher".to_string(),
            ]
        );
    }

    #[test]
    fn test_eager_relations_merged_below_requested_nodes() {
        let nodes = run("Author", ["books"], true).unwrap();
        assert_eq!(fields(&nodes[0].children), vec!["publisher"]);

        let nodes = run("Author", ["books"], false).unwrap();
        assert!(nodes[0].children.is_empty());
    }

    #[test]
    fn test_eager_not_duplicated_when_requested() {
        let nodes = run("Book", ["publisher", "reviews"], true).unwrap();
        assert_eq!(fields(&nodes), vec!["publisher", "reviews"]);
    }

    #[test]
    fn test_eager_self_reference_terminates() {
        let nodes = run("Category", ["children"], true).unwrap();
        assert_eq!(fields(&nodes), vec!["children", "parent"]);
        assert!(nodes[1].children.is_empty());
        assert_eq!(fields(&nodes[0].children), Vec::<&str>::new());
    }

    #[test]
    fn test_tree_request_children_resolved() {
        let request = PopulateRequest::from(vec![
            PopulateNode::new("books")
                .strategy(LoadStrategy::Joined)
                .child(PopulateNode::new("reviews.book")),
        ]);
        let nodes = run("Author", request, false).unwrap();
        assert_eq!(nodes[0].strategy, Some(LoadStrategy::Joined));
        assert_eq!(fields(&nodes[0].children), vec!["reviews"]);
        assert_eq!(fields(&nodes[0].children[0].children), vec!["book"]);
    }

    #[test]
    fn test_tree_with_unknown_child_is_malformed() {
        let request = PopulateRequest::from(vec![
            PopulateNode::new("books").child(PopulateNode::new("ghost")),
        ]);
        let err = run("Author", request, false).unwrap_err();
        assert_eq!(err.populate_kind(), Some(PopulateErrorKind::MalformedPath));
    }
}
