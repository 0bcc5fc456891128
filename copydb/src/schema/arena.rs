use std::collections::HashMap;

use crate::catalog::{SourceIndex, SourceSequence, SourceTable};
use crate::types::Oid;

/// An object of the source schema addressable by oid and by qualified name.
pub trait SchemaEntity {
    fn oid(&self) -> Oid;

    fn qname(&self) -> &str;
}

impl SchemaEntity for SourceTable {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn qname(&self) -> &str {
        &self.qname
    }
}

impl SchemaEntity for SourceIndex {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn qname(&self) -> &str {
        &self.qname
    }
}

impl SchemaEntity for SourceSequence {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn qname(&self) -> &str {
        &self.qname
    }
}

/// Position of an entity in its [`SchemaArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

/// Entities stored once and indexed both by oid and by qualified name.
///
/// Inserting an entity whose oid is already present replaces it in place, so handles stay
/// valid for the lifetime of the arena.
#[derive(Debug, Clone)]
pub struct SchemaArena<T> {
    entities: Vec<T>,
    by_oid: HashMap<Oid, Handle>,
    by_qname: HashMap<String, Handle>,
}

impl<T: SchemaEntity> SchemaArena<T> {
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            by_oid: HashMap::new(),
            by_qname: HashMap::new(),
        }
    }

    pub fn insert(&mut self, entity: T) -> Handle {
        let qname = entity.qname().to_owned();

        let handle = match self.handle_by_oid(entity.oid()) {
            Some(handle) => {
                let previous = std::mem::replace(&mut self.entities[handle.0], entity);
                if previous.qname() != qname {
                    self.by_qname.remove(previous.qname());
                }
                handle
            }
            None => {
                let handle = Handle(self.entities.len());
                self.by_oid.insert(entity.oid(), handle);
                self.entities.push(entity);
                handle
            }
        };

        self.by_qname.insert(qname, handle);

        handle
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.entities.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.entities.get_mut(handle.0)
    }

    pub fn handle_by_oid(&self, oid: Oid) -> Option<Handle> {
        self.by_oid.get(&oid).copied()
    }

    pub fn by_oid(&self, oid: Oid) -> Option<&T> {
        self.handle_by_oid(oid).and_then(|handle| self.get(handle))
    }

    pub fn by_qname(&self, qname: &str) -> Option<&T> {
        self.by_qname
            .get(qname)
            .and_then(|&handle| self.get(handle))
    }

    pub fn contains_oid(&self, oid: Oid) -> bool {
        self.by_oid.contains_key(&oid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl<T: SchemaEntity> Default for SchemaArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SchemaEntity> FromIterator<T> for SchemaArena<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut arena = Self::new();
        for entity in iter {
            arena.insert(entity);
        }
        arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(oid: u32, qname: &str) -> SourceTable {
        SourceTable {
            oid: Oid(oid),
            qname: qname.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn entities_are_found_by_oid_and_name() {
        let arena: SchemaArena<SourceTable> =
            [table(1, "public.a"), table(2, "public.b")].into_iter().collect();

        assert_eq!(arena.len(), 2);
        assert_eq!(arena.by_oid(Oid(2)).unwrap().qname, "public.b");
        assert_eq!(arena.by_qname("public.a").unwrap().oid, Oid(1));
        assert!(arena.by_oid(Oid(3)).is_none());
    }

    #[test]
    fn reinserting_an_oid_replaces_the_entity_in_place() {
        let mut arena = SchemaArena::new();
        let handle = arena.insert(table(1, "public.a"));

        let renamed = arena.insert(table(1, "public.renamed"));

        assert_eq!(handle, renamed);
        assert_eq!(arena.len(), 1);
        assert!(arena.by_qname("public.a").is_none());
        assert_eq!(arena.get(handle).unwrap().qname, "public.renamed");
    }
}
