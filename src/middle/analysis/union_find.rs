//! Union-find over primitive variable names. Alias classes are small
//! (bounded by proc size), so a path-compressed parent map is plenty. Roots
//! are arbitrary but stable within one analysis iteration; canonicalisation
//! rebuilds everything keyed on roots before maps are compared.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::middle::prim::PrimVarName;

/// An equivalence relation over variable names. Two names are in the same
/// class when the analysis cannot rule out that they refer to the same
/// heap value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AliasMap {
    /// Parent links; a missing key is its own singleton root.
    parents: BTreeMap<PrimVarName, PrimVarName>,
}

// Persisted as a list of parent links rather than a map: the keys are
// structured values, which JSON maps cannot carry.

impl Serialize for AliasMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.parents
            .iter()
            .collect::<Vec<_>>()
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AliasMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(PrimVarName, PrimVarName)>::deserialize(deserializer)?;
        Ok(AliasMap {
            parents: pairs.into_iter().collect(),
        })
    }
}

impl AliasMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// The representative of a name's class, with path compression.
    pub fn find(&mut self, name: PrimVarName) -> PrimVarName {
        let mut root = name;
        while let Some(parent) = self.parents.get(&root) {
            root = *parent;
        }

        // Compress the walked path onto the root.
        let mut cursor = name;
        while cursor != root {
            let parent = self.parents[&cursor];
            self.parents.insert(cursor, root);
            cursor = parent;
        }

        root
    }

    /// The representative without mutating the structure.
    pub fn find_ref(&self, name: PrimVarName) -> PrimVarName {
        let mut root = name;
        while let Some(parent) = self.parents.get(&root) {
            root = *parent;
        }
        root
    }

    /// Merges the classes of two names.
    pub fn unite(&mut self, a: PrimVarName, b: PrimVarName) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            self.parents.insert(root_b, root_a);
        }
    }

    pub fn aliased(&self, a: PrimVarName, b: PrimVarName) -> bool {
        self.find_ref(a) == self.find_ref(b)
    }

    /// Every name the map knows about, whether root or not.
    pub fn members(&self) -> impl Iterator<Item = PrimVarName> + '_ {
        self.parents.keys().copied()
    }

    /// True when no other known name shares this name's class.
    pub fn is_singleton(&self, name: PrimVarName) -> bool {
        let root = self.find_ref(name);
        !self
            .known_names()
            .iter()
            .any(|other| *other != name && self.find_ref(*other) == root)
    }

    fn known_names(&self) -> Vec<PrimVarName> {
        let mut names: Vec<PrimVarName> = self.parents.keys().copied().collect();
        names.extend(self.parents.values().copied());
        names.sort();
        names.dedup();
        names
    }

    /// Removes a name, redirecting any class it rooted onto a surviving
    /// member. Classes reduced to one member simply drop the link.
    pub fn remove(&mut self, name: PrimVarName) {
        let replacement = self
            .parents
            .iter()
            .find(|(child, parent)| **parent == name && **child != name)
            .map(|(child, _)| *child);

        match self.parents.remove(&name) {
            // The name was a child; repoint any of its children at its old
            // parent.
            Some(old_parent) => {
                let parent = if old_parent == name {
                    replacement
                } else {
                    Some(old_parent)
                };
                self.repoint_children(name, parent);
            }
            // The name was a root (or unknown); promote one child to root
            // and hang the rest off it.
            None => self.repoint_children(name, replacement),
        }
    }

    fn repoint_children(&mut self, removed: PrimVarName, target: Option<PrimVarName>) {
        let children: Vec<PrimVarName> = self
            .parents
            .iter()
            .filter(|(_, parent)| **parent == removed)
            .map(|(child, _)| *child)
            .collect();

        for child in children {
            match target {
                Some(target) if target != child => {
                    self.parents.insert(child, target);
                }
                _ => {
                    self.parents.remove(&child);
                }
            }
        }
    }

    /// Restricts the relation to the given names, preserving whether each
    /// pair was aliased.
    pub fn restricted_to(&self, keep: &[PrimVarName]) -> AliasMap {
        let mut result = AliasMap::new();
        for (i, a) in keep.iter().enumerate() {
            for b in &keep[i + 1..] {
                if self.aliased(*a, *b) {
                    result.unite(*a, *b);
                }
            }
        }
        result
    }

    /// Folds another relation's unifications into this one.
    pub fn absorb(&mut self, other: &AliasMap) {
        for (a, b) in other.canonical_pairs() {
            self.unite(a, b);
        }
    }

    /// A canonical, sorted, duplicate-free list of (member, member) pairs
    /// describing the relation. Two maps describe the same relation iff
    /// their canonical pair lists are equal.
    pub fn canonical_pairs(&self) -> Vec<(PrimVarName, PrimVarName)> {
        let mut classes: BTreeMap<PrimVarName, Vec<PrimVarName>> = BTreeMap::new();
        for name in self.known_names() {
            let root = self.find_ref(name);
            classes.entry(root).or_default().push(name);
        }

        let mut pairs = Vec::new();
        for members in classes.values() {
            let mut members = members.clone();
            members.sort();
            members.dedup();
            let first = members[0];
            for other in &members[1..] {
                pairs.push((first, *other));
            }
        }
        pairs.sort();
        pairs.dedup();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::intern::InternedSymbol;

    fn v(name: &str) -> PrimVarName {
        PrimVarName::first(InternedSymbol::new(name))
    }

    #[test]
    fn unknown_names_are_singletons() {
        let map = AliasMap::new();
        assert!(map.is_singleton(v("a")));
        assert!(!map.aliased(v("a"), v("b")));
    }

    #[test]
    fn unite_makes_names_aliased() {
        let mut map = AliasMap::new();
        map.unite(v("a"), v("b"));
        map.unite(v("b"), v("c"));

        assert!(map.aliased(v("a"), v("c")));
        assert!(!map.is_singleton(v("a")));
        assert!(map.is_singleton(v("d")));
    }

    #[test]
    fn remove_redirects_rooted_classes() {
        let mut map = AliasMap::new();
        map.unite(v("a"), v("b"));
        map.unite(v("a"), v("c"));

        // Whatever the internal root is, removing "a" must keep b ~ c.
        map.remove(v("a"));
        assert!(map.aliased(v("b"), v("c")));
        assert!(map.is_singleton(v("a")));
    }

    #[test]
    fn remove_of_two_member_class_leaves_singleton() {
        let mut map = AliasMap::new();
        map.unite(v("a"), v("b"));

        map.remove(v("b"));
        assert!(map.is_singleton(v("a")));
        assert!(map.is_singleton(v("b")));
    }

    #[test]
    fn canonical_pairs_are_representation_independent() {
        let mut left = AliasMap::new();
        left.unite(v("a"), v("b"));
        left.unite(v("b"), v("c"));

        let mut right = AliasMap::new();
        right.unite(v("c"), v("b"));
        right.unite(v("b"), v("a"));

        assert_eq!(left.canonical_pairs(), right.canonical_pairs());
        assert!(!left.canonical_pairs().is_empty());
    }

    #[test]
    fn restriction_projects_the_relation() {
        let mut map = AliasMap::new();
        map.unite(v("p"), v("t"));
        map.unite(v("t"), v("q"));
        map.unite(v("x"), v("y"));

        let restricted = map.restricted_to(&[v("p"), v("q")]);
        assert!(restricted.aliased(v("p"), v("q")));
        assert!(!restricted.aliased(v("p"), v("x")));
    }

    #[test]
    fn absorb_unions_two_relations() {
        let mut left = AliasMap::new();
        left.unite(v("a"), v("b"));

        let mut right = AliasMap::new();
        right.unite(v("b"), v("c"));

        left.absorb(&right);
        assert!(left.aliased(v("a"), v("c")));
    }
}
