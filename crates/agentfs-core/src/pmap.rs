// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Persistent `u64 -> V` map (hash array mapped trie keyed by the raw id)
//!
//! Cloning a map is O(1). Mutating a clone copies only the trie nodes on the
//! path to the touched key (`Arc::make_mut`); every other node stays shared
//! with the maps it was cloned from.

use std::sync::Arc;

const BITS: u32 = 5;
const MASK: u64 = (1 << BITS) - 1;

#[derive(Clone)]
enum Trie<V> {
    Inner {
        bitmap: u32,
        children: Vec<Arc<Trie<V>>>,
    },
    Leaf {
        key: u64,
        value: V,
    },
}

fn slot(key: u64, shift: u32) -> (u32, u32) {
    let idx = ((key >> shift) & MASK) as u32;
    (idx, 1u32 << idx)
}

fn position(bitmap: u32, bit: u32) -> usize {
    (bitmap & (bit - 1)).count_ones() as usize
}

impl<V: Clone> Trie<V> {
    fn empty() -> Self {
        Trie::Inner {
            bitmap: 0,
            children: Vec::new(),
        }
    }

    fn get(&self, key: u64) -> Option<&V> {
        let mut node = self;
        let mut shift = 0;
        loop {
            match node {
                Trie::Leaf { key: k, value } => return (*k == key).then_some(value),
                Trie::Inner { bitmap, children } => {
                    let (_, bit) = slot(key, shift);
                    if bitmap & bit == 0 {
                        return None;
                    }
                    node = &children[position(*bitmap, bit)];
                    shift += BITS;
                }
            }
        }
    }

    /// Returns the previous value when `key` was present.
    fn insert(node: &mut Arc<Self>, key: u64, value: V, shift: u32) -> Option<V> {
        enum Step {
            Replace,
            Split(u64),
            Descend,
        }
        let step = match node.as_ref() {
            Trie::Leaf { key: k, .. } if *k == key => Step::Replace,
            Trie::Leaf { key: k, .. } => Step::Split(*k),
            Trie::Inner { .. } => Step::Descend,
        };
        match step {
            Step::Replace => match Arc::make_mut(node) {
                Trie::Leaf { value: v, .. } => Some(std::mem::replace(v, value)),
                Trie::Inner { .. } => unreachable!("classified as leaf"),
            },
            Step::Split(existing) => {
                // Push the resident leaf one level down, then retry.
                let leaf = std::mem::replace(node, Arc::new(Self::empty()));
                let (_, bit) = slot(existing, shift);
                *node = Arc::new(Trie::Inner {
                    bitmap: bit,
                    children: vec![leaf],
                });
                Self::insert(node, key, value, shift)
            }
            Step::Descend => match Arc::make_mut(node) {
                Trie::Inner { bitmap, children } => {
                    let (_, bit) = slot(key, shift);
                    let pos = position(*bitmap, bit);
                    if *bitmap & bit == 0 {
                        *bitmap |= bit;
                        children.insert(pos, Arc::new(Trie::Leaf { key, value }));
                        None
                    } else {
                        Self::insert(&mut children[pos], key, value, shift + BITS)
                    }
                }
                Trie::Leaf { .. } => unreachable!("classified as inner"),
            },
        }
    }

    /// Returns the removed value. A node left without entries is replaced by
    /// an empty inner node; one left with a single leaf collapses into it.
    fn remove(node: &mut Arc<Self>, key: u64, shift: u32) -> Option<V> {
        let bit = match node.as_ref() {
            Trie::Leaf { key: k, value } => {
                if *k != key {
                    return None;
                }
                let value = value.clone();
                *node = Arc::new(Self::empty());
                return Some(value);
            }
            Trie::Inner { bitmap, .. } => {
                let (_, bit) = slot(key, shift);
                if bitmap & bit == 0 {
                    return None;
                }
                bit
            }
        };

        let Trie::Inner { bitmap, children } = Arc::make_mut(node) else {
            unreachable!("classified as inner");
        };
        let pos = position(*bitmap, bit);
        let removed = Self::remove(&mut children[pos], key, shift + BITS)?;
        if children[pos].is_empty() {
            children.remove(pos);
            *bitmap &= !bit;
        }
        if children.len() == 1 && matches!(children[0].as_ref(), Trie::Leaf { .. }) {
            if let Some(only) = children.pop() {
                *node = only;
            }
        }
        Some(removed)
    }

    fn is_empty(&self) -> bool {
        matches!(self, Trie::Inner { bitmap: 0, .. })
    }

    fn collect<'a>(&'a self, out: &mut Vec<(u64, &'a V)>) {
        match self {
            Trie::Leaf { key, value } => out.push((*key, value)),
            Trie::Inner { children, .. } => children.iter().for_each(|c| c.collect(out)),
        }
    }
}

#[derive(Clone)]
pub(crate) struct PersistentMap<V> {
    root: Arc<Trie<V>>,
    len: usize,
}

impl<V: Clone> Default for PersistentMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> PersistentMap<V> {
    pub(crate) fn new() -> Self {
        Self {
            root: Arc::new(Trie::empty()),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn get(&self, key: u64) -> Option<&V> {
        self.root.get(key)
    }

    pub(crate) fn insert(&mut self, key: u64, value: V) -> Option<V> {
        let previous = Trie::insert(&mut self.root, key, value, 0);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    pub(crate) fn remove(&mut self, key: u64) -> Option<V> {
        let removed = Trie::remove(&mut self.root, key, 0);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// All entries, in trie order.
    pub(crate) fn entries(&self) -> Vec<(u64, &V)> {
        let mut out = Vec::with_capacity(self.len);
        self.root.collect(&mut out);
        out
    }

    /// True when both maps are the same version (share a root).
    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut map = PersistentMap::new();
        for key in 0..2000u64 {
            assert!(map.insert(key * 7919, key).is_none());
        }
        assert_eq!(map.len(), 2000);
        assert_eq!(map.get(7919 * 42), Some(&42));
        assert_eq!(map.insert(7919 * 42, 4242), Some(42));
        assert_eq!(map.len(), 2000);

        for key in (0..2000u64).step_by(2) {
            let expected = if key == 42 { 4242 } else { key };
            assert_eq!(map.remove(key * 7919), Some(expected));
        }
        assert_eq!(map.len(), 1000);
        assert!(map.get(0).is_none());
        assert_eq!(map.get(7919), Some(&1));
        assert!(map.remove(0).is_none());
        assert_eq!(map.entries().len(), 1000);
    }

    #[test]
    fn keys_sharing_low_bits_split_deep() {
        let mut map = PersistentMap::new();
        let a = 1u64;
        let b = 1u64 | (1 << 60);
        map.insert(a, "a");
        map.insert(b, "b");
        assert_eq!(map.get(a), Some(&"a"));
        assert_eq!(map.get(b), Some(&"b"));
        map.remove(a);
        assert_eq!(map.get(b), Some(&"b"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn clones_are_isolated_versions() {
        let mut base = PersistentMap::new();
        for key in 0..100u64 {
            base.insert(key, key);
        }
        let frozen = base.clone();
        assert!(frozen.ptr_eq(&base));

        base.insert(5, 500);
        base.remove(6);
        base.insert(1000, 1000);

        assert!(!frozen.ptr_eq(&base));
        assert_eq!(frozen.get(5), Some(&5));
        assert_eq!(frozen.get(6), Some(&6));
        assert!(frozen.get(1000).is_none());
        assert_eq!(frozen.len(), 100);
        assert_eq!(base.get(5), Some(&500));
        assert!(base.get(6).is_none());
        assert_eq!(base.len(), 100);
    }

    #[test]
    fn removing_everything_leaves_an_empty_map() {
        let mut map = PersistentMap::new();
        for key in 0..64u64 {
            map.insert(key, ());
        }
        for key in 0..64u64 {
            map.remove(key);
        }
        assert_eq!(map.len(), 0);
        assert!(map.entries().is_empty());
        map.insert(3, ());
        assert_eq!(map.get(3), Some(&()));
    }
}
