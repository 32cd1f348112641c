//! Relinking fetched children onto their parents.
//!
//! Everything here is synchronous and in-memory. Entity locks are taken one
//! at a time: a slot is read into an owned [`RelationTarget`] and the lock is
//! released before any other entity is touched.

use relfill_core::{
    Collection, EntityRef, EntitySet, PrimaryKey, Reference, RelationTarget, RelationValue,
};
use std::collections::HashMap;

/// Replace the contents of `parent.field` with `items` and mark it
/// initialized, creating the collection when the slot is empty.
pub(crate) fn hydrate_collection(parent: &EntityRef, field: &str, items: Vec<EntityRef>) {
    let mut entity = parent.write();
    if let Some(collection) = entity.collection_mut(field) {
        collection.hydrate(items);
        return;
    }
    let mut collection = Collection::new(parent, field);
    collection.hydrate(items);
    entity.set_relation(field, RelationValue::Collection(collection));
}

/// The to-one target held in `entity.field`, if any.
pub(crate) fn to_one_target(entity: &EntityRef, field: &str) -> Option<RelationTarget> {
    entity.read().relation(field).to_one_target()
}

/// Group `children` by the parent their `mapped_by` side points at.
fn group_by_back_reference(
    children: &[EntityRef],
    mapped_by: &str,
) -> HashMap<PrimaryKey, Vec<(RelationTarget, EntityRef)>> {
    let mut by_parent: HashMap<PrimaryKey, Vec<(RelationTarget, EntityRef)>> = HashMap::new();
    for child in children {
        let Some(target) = to_one_target(child, mapped_by) else {
            continue;
        };
        by_parent
            .entry(target.key())
            .or_default()
            .push((target, child.clone()));
    }
    by_parent
}

/// One-to-many: each parent gets the children whose `mapped_by` designates
/// it, in fetch order.
pub(crate) fn link_one_to_many(
    parents: &[EntityRef],
    field: &str,
    mapped_by: &str,
    children: &[EntityRef],
) -> usize {
    let by_parent = group_by_back_reference(children, mapped_by);

    let mut linked = 0;
    for parent in parents {
        let pk = parent.primary_key();
        let items: Vec<EntityRef> = by_parent
            .get(&pk)
            .map(|candidates| {
                candidates
                    .iter()
                    .filter(|(target, _)| target.designates(parent, &pk))
                    .map(|(_, child)| child.clone())
                    .collect()
            })
            .unwrap_or_default();
        linked += items.len();
        hydrate_collection(parent, field, items);
    }
    linked
}

/// Inverse many-to-many: each parent gets the children whose owning
/// collection contains it.
pub(crate) fn link_inverse_many_to_many(
    parents: &[EntityRef],
    field: &str,
    mapped_by: &str,
    children: &[EntityRef],
) -> usize {
    let mut linked = 0;
    for parent in parents {
        let items: Vec<EntityRef> = children
            .iter()
            .filter(|child| {
                child
                    .read()
                    .collection(mapped_by)
                    .is_some_and(|owning| owning.contains(parent))
            })
            .cloned()
            .collect();
        linked += items.len();
        hydrate_collection(parent, field, items);
    }
    linked
}

/// Owning many-to-many without a join table: the parent's collection already
/// names its members; swap in the fetched instances and initialize.
pub(crate) fn link_owned_many_to_many(
    parents: &[EntityRef],
    field: &str,
    children: &[EntityRef],
) -> usize {
    let fetched: HashMap<PrimaryKey, EntityRef> = children
        .iter()
        .map(|child| (child.primary_key(), child.clone()))
        .collect();

    let mut linked = 0;
    for parent in parents {
        let referenced: Vec<EntityRef> = parent
            .read()
            .collection(field)
            .map(|c| c.items().to_vec())
            .unwrap_or_default();
        let items: Vec<EntityRef> = referenced
            .into_iter()
            .filter_map(|item| fetched.get(&item.primary_key()).cloned())
            .collect();
        linked += items.len();
        hydrate_collection(parent, field, items);
    }
    linked
}

/// Owning to-one: resolve each parent's slot against the fetched children.
pub(crate) fn link_to_one(
    parents: &[EntityRef],
    field: &str,
    children: &[EntityRef],
    wrapped: bool,
) -> usize {
    let fetched: HashMap<PrimaryKey, EntityRef> = children
        .iter()
        .map(|child| (child.primary_key(), child.clone()))
        .collect();

    let mut linked = 0;
    for parent in parents {
        let Some(target) = to_one_target(parent, field) else {
            continue;
        };
        if let Some(child) = fetched.get(&target.key()) {
            assign_to_one(parent, field, child.clone(), wrapped);
            linked += 1;
        }
    }
    linked
}

/// Inverse one-to-one looked up by the parents' keys: each parent gets the
/// owner pointing back at it, or is marked empty when there is none.
pub(crate) fn link_inverse_one_to_one(
    parents: &[EntityRef],
    field: &str,
    mapped_by: &str,
    children: &[EntityRef],
    wrapped: bool,
) -> usize {
    let by_parent = group_by_back_reference(children, mapped_by);

    let mut linked = 0;
    for parent in parents {
        let pk = parent.primary_key();
        let owner = by_parent.get(&pk).and_then(|candidates| {
            candidates
                .iter()
                .find(|(target, _)| target.designates(parent, &pk))
                .map(|(_, child)| child.clone())
        });
        match owner {
            Some(child) => {
                assign_to_one(parent, field, child, wrapped);
                linked += 1;
            }
            None => parent.write().set_relation(field, RelationValue::Empty),
        }
    }
    linked
}

/// Put `child` into `parent.field`, reusing an existing wrapper so its
/// populated marker survives.
pub(crate) fn assign_to_one(parent: &EntityRef, field: &str, child: EntityRef, wrapped: bool) {
    let mut entity = parent.write();
    if let Some(RelationValue::Reference(reference)) = entity.relation_mut(field) {
        reference.set(child);
        return;
    }
    let value = if wrapped {
        RelationValue::Reference(Reference::to_entity(child))
    } else {
        RelationValue::Entity(child)
    };
    entity.set_relation(field, value);
}

/// Flag the relation containers of `parents.field` as populated.
pub(crate) fn mark_populated(parents: &[EntityRef], field: &str) {
    let mut inline = Vec::new();
    for parent in parents {
        let mut entity = parent.write();
        entity.set_populated(true);
        match entity.relation_mut(field) {
            Some(RelationValue::Collection(collection)) => collection.set_populated(true),
            Some(RelationValue::Reference(reference)) => reference.set_populated(true),
            Some(RelationValue::Entity(target)) => inline.push(target.clone()),
            Some(RelationValue::Unset | RelationValue::Empty) | None => {}
        }
    }
    // Inline targets may be one of the parents; their locks are free by now.
    for target in inline {
        target.write().set_populated(true);
    }
}

/// Every entity currently linked through `parents.field`, deduplicated.
pub(crate) fn collect_children(parents: &[EntityRef], field: &str) -> EntitySet {
    let mut children = EntitySet::new();
    for parent in parents {
        let linked = parent.read().relation(field).linked_entities();
        children.extend(linked);
    }
    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use relfill_core::Entity;

    fn entity(entity_type: &str, id: i64) -> EntityRef {
        let mut e = Entity::new(entity_type, PrimaryKey::from(id));
        e.set_initialized(true);
        EntityRef::new(e)
    }

    fn book_of(id: i64, author: &EntityRef) -> EntityRef {
        let book = entity("Book", id);
        book.write()
            .set_relation("author", RelationValue::Entity(author.clone()));
        book
    }

    fn ids(parent: &EntityRef, field: &str) -> Vec<PrimaryKey> {
        parent
            .read()
            .collection(field)
            .map(|c| c.items().iter().map(EntityRef::primary_key).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_one_to_many_groups_by_parent() {
        let a1 = entity("Author", 1);
        let a2 = entity("Author", 2);
        let books = vec![book_of(10, &a1), book_of(20, &a2), book_of(11, &a1)];

        let linked = link_one_to_many(&[a1.clone(), a2.clone()], "books", "author", &books);
        assert_eq!(linked, 3);
        assert_eq!(ids(&a1, "books"), vec![PrimaryKey::from(10_i64), PrimaryKey::from(11_i64)]);
        assert_eq!(ids(&a2, "books"), vec![PrimaryKey::from(20_i64)]);
        assert!(a1.read().collection("books").unwrap().is_initialized());
    }

    #[test]
    fn test_one_to_many_empty_parent_is_initialized() {
        let a1 = entity("Author", 1);
        link_one_to_many(std::slice::from_ref(&a1), "books", "author", &[]);
        let guard = a1.read();
        let books = guard.collection("books").unwrap();
        assert!(books.is_initialized());
        assert!(books.is_empty());
        assert!(books.owner().unwrap().ptr_eq(&a1));
    }

    #[test]
    fn test_one_to_many_matches_identifier_references() {
        let a1 = entity("Author", 1);
        let book = entity("Book", 10);
        book.write().set_relation(
            "author",
            RelationValue::Reference(Reference::to_identifier("Author", PrimaryKey::from(1_i64))),
        );
        link_one_to_many(std::slice::from_ref(&a1), "books", "author", &[book]);
        assert_eq!(ids(&a1, "books"), vec![PrimaryKey::from(10_i64)]);
    }

    #[test]
    fn test_inverse_many_to_many_by_membership() {
        let t1 = entity("Tag", 1);
        let t2 = entity("Tag", 2);
        let b1 = entity("Book", 10);
        let mut tags = Collection::new(&b1, "tags");
        tags.hydrate(vec![t1.clone(), t2.clone()]);
        b1.write().set_relation("tags", RelationValue::Collection(tags));
        let b2 = entity("Book", 20);
        let mut tags = Collection::new(&b2, "tags");
        tags.hydrate(vec![t2.clone()]);
        b2.write().set_relation("tags", RelationValue::Collection(tags));

        link_inverse_many_to_many(&[t1.clone(), t2.clone()], "books", "tags", &[b1, b2]);
        assert_eq!(ids(&t1, "books"), vec![PrimaryKey::from(10_i64)]);
        assert_eq!(
            ids(&t2, "books"),
            vec![PrimaryKey::from(10_i64), PrimaryKey::from(20_i64)]
        );
    }

    #[test]
    fn test_owned_many_to_many_initializes_referenced_items() {
        let book = entity("Book", 10);
        let stub = EntityRef::new(Entity::new("Tag", PrimaryKey::from(1_i64)));
        let mut tags = Collection::new(&book, "tags");
        tags.set_references(vec![stub.clone()]);
        book.write().set_relation("tags", RelationValue::Collection(tags));

        link_owned_many_to_many(std::slice::from_ref(&book), "tags", std::slice::from_ref(&stub));
        let guard = book.read();
        let tags = guard.collection("tags").unwrap();
        assert!(tags.is_initialized());
        assert!(tags.contains(&stub));
    }

    #[test]
    fn test_to_one_assigns_inline_or_wrapped() {
        let author = entity("Author", 1);
        let inline = entity("Book", 10);
        inline.write().set_relation(
            "author",
            RelationValue::Entity(EntityRef::new(Entity::new("Author", PrimaryKey::from(1_i64)))),
        );
        let wrapped = entity("Book", 11);
        let mut reference = Reference::to_identifier("Author", PrimaryKey::from(1_i64));
        reference.set_populated(true);
        wrapped
            .write()
            .set_relation("author", RelationValue::Reference(reference));

        let linked = link_to_one(
            &[inline.clone(), wrapped.clone()],
            "author",
            std::slice::from_ref(&author),
            false,
        );
        assert_eq!(linked, 2);
        assert!(matches!(
            inline.read().relation("author"),
            RelationValue::Entity(e) if e.ptr_eq(&author)
        ));
        match wrapped.read().relation("author") {
            RelationValue::Reference(r) => {
                assert!(r.unwrap().unwrap().ptr_eq(&author));
                assert!(r.is_populated());
            }
            other => panic!("expected reference, got {other:?}"),
        }
    }

    #[test]
    fn test_inverse_one_to_one_marks_missing_empty() {
        let u1 = entity("User", 1);
        let u2 = entity("User", 2);
        let profile = entity("Profile", 100);
        profile
            .write()
            .set_relation("user", RelationValue::Entity(u1.clone()));

        link_inverse_one_to_one(&[u1.clone(), u2.clone()], "profile", "user", &[profile.clone()], true);
        match u1.read().relation("profile") {
            RelationValue::Reference(r) => assert!(r.unwrap().unwrap().ptr_eq(&profile)),
            other => panic!("expected reference, got {other:?}"),
        }
        assert!(matches!(u2.read().relation("profile"), RelationValue::Empty));
    }

    #[test]
    fn test_mark_populated_and_collect_children() {
        let a1 = entity("Author", 1);
        let a2 = entity("Author", 2);
        let shared = book_of(10, &a1);
        link_one_to_many(&[a1.clone(), a2.clone()], "books", "author", &[shared.clone()]);
        mark_populated(&[a1.clone(), a2.clone()], "books");
        assert!(a1.read().collection("books").unwrap().is_populated());
        assert!(a1.read().is_populated());

        let b2 = book_of(20, &a2);
        mark_populated(std::slice::from_ref(&b2), "author");
        assert!(b2.read().is_populated());
        assert!(a2.read().is_populated());

        let children = collect_children(&[a1, a2], "books");
        assert_eq!(children.len(), 1);
        assert!(children.contains(&shared));
    }
}
