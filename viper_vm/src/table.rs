//! Open-addressing hash table with linear probing and tombstones.
//!
//! The same table backs globals, class methods, instance fields, the string
//! intern table and user maps. Keys supply their own hash through
//! [`TableKey`], so string keys reuse the hash cached on the string object.

use crate::{heap::Trace, object::ObjRef};
use std::mem;

const MAX_LOAD_NUMERATOR: usize = 3;
const MAX_LOAD_DENOMINATOR: usize = 4;
const MIN_CAPACITY: usize = 8;

pub trait TableKey: Copy + PartialEq {
    fn hash(&self) -> u32;
}

/// FNV-1a, 32 bit
pub fn hash_str(s: &str) -> u32 {
    s.bytes().fold(2166136261u32, |hash, b| {
        (hash ^ b as u32).wrapping_mul(16777619)
    })
}

/// An interned string used as a key. Interning makes handle equality
/// equivalent to content equality.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StrKey {
    pub obj: ObjRef,
    pub hash: u32,
}

impl TableKey for StrKey {
    fn hash(&self) -> u32 {
        self.hash
    }
}

/// Key of a user map: numbers or strings
#[derive(Copy, Clone, Debug)]
pub enum MapKey {
    Number(f64),
    Str(StrKey),
}

impl MapKey {
    pub fn number(n: f64) -> Self {
        // -0.0 and 0.0 compare equal, so they must share a key
        Self::Number(if n == 0.0 { 0.0 } else { n })
    }
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl TableKey for MapKey {
    fn hash(&self) -> u32 {
        match self {
            Self::Number(n) => {
                let bits = n.to_bits();
                (bits ^ (bits >> 32)) as u32
            }
            Self::Str(key) => key.hash,
        }
    }
}

#[derive(Clone, Debug)]
enum Entry<K, V> {
    Empty,
    Tombstone,
    Occupied(K, V),
}

#[derive(Clone, Debug)]
pub struct Table<K, V> {
    entries: Vec<Entry<K, V>>,
    // Occupied entries plus tombstones, which is what the load factor counts
    count: usize,
    live: usize,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            entries: Vec::default(),
            count: 0,
            live: 0,
        }
    }
}

impl<K: TableKey, V> Table<K, V> {
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.entries.capacity() * mem::size_of::<Entry<K, V>>()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        if self.live == 0 {
            return None;
        }
        match &self.entries[find_slot(&self.entries, key)] {
            Entry::Occupied(_, v) => Some(v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.live == 0 {
            return None;
        }
        let idx = find_slot(&self.entries, key);
        match &mut self.entries[idx] {
            Entry::Occupied(_, v) => Some(v),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or overwrites. Returns `true` when the key was not present.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if (self.count + 1) * MAX_LOAD_DENOMINATOR > self.capacity() * MAX_LOAD_NUMERATOR {
            let capacity = if self.capacity() < MIN_CAPACITY {
                MIN_CAPACITY
            } else {
                self.capacity() * 2
            };
            self.resize(capacity);
        }

        let idx = find_slot(&self.entries, &key);
        let is_new = match self.entries[idx] {
            Entry::Empty => {
                self.count += 1;
                true
            }
            // Reusing a tombstone leaves the load count unchanged
            Entry::Tombstone => true,
            Entry::Occupied(..) => false,
        };
        if is_new {
            self.live += 1;
        }
        self.entries[idx] = Entry::Occupied(key, value);
        is_new
    }

    /// Removes the key, leaving a tombstone so later lookups keep scanning
    pub fn remove(&mut self, key: &K) -> Option<V> {
        if self.live == 0 {
            return None;
        }
        let idx = find_slot(&self.entries, key);
        if !matches!(self.entries[idx], Entry::Occupied(..)) {
            return None;
        }
        self.live -= 1;
        match mem::replace(&mut self.entries[idx], Entry::Tombstone) {
            Entry::Occupied(_, v) => Some(v),
            _ => None,
        }
    }

    /// Finds a key by hash and an arbitrary predicate, used by interning
    /// to look strings up by content before they exist as objects
    pub fn find_key<F>(&self, hash: u32, mut matches: F) -> Option<K>
    where
        F: FnMut(&K) -> bool,
    {
        if self.capacity() == 0 {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match &self.entries[idx] {
                Entry::Empty => return None,
                Entry::Occupied(k, _) if k.hash() == hash && matches(k) => return Some(*k),
                _ => (),
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Drops every entry the predicate rejects
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for entry in self.entries.iter_mut() {
            if let Entry::Occupied(k, v) = entry {
                if !keep(k, v) {
                    *entry = Entry::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().filter_map(|e| match e {
            Entry::Occupied(k, v) => Some((k, v)),
            _ => None,
        })
    }

    fn resize(&mut self, capacity: usize) {
        let old = mem::replace(
            &mut self.entries,
            (0..capacity).map(|_| Entry::Empty).collect(),
        );
        // Tombstones are not carried over
        self.count = 0;
        for entry in old {
            if let Entry::Occupied(k, v) = entry {
                let idx = find_slot(&self.entries, &k);
                self.entries[idx] = Entry::Occupied(k, v);
                self.count += 1;
            }
        }
    }
}

impl<K: TableKey, V: Clone> Table<K, V> {
    /// Copies every entry of `other` into `self`, overwriting on conflict
    pub fn extend_from(&mut self, other: &Table<K, V>) {
        for (k, v) in other.iter() {
            self.insert(*k, v.clone());
        }
    }
}

/// Returns the slot holding `key`, or the slot where it should be inserted:
/// the first tombstone seen on the scan path, else the empty slot ending it.
fn find_slot<K: TableKey, V>(entries: &[Entry<K, V>], key: &K) -> usize {
    let mask = entries.len() - 1;
    let mut idx = key.hash() as usize & mask;
    let mut tombstone = None;
    loop {
        match &entries[idx] {
            Entry::Empty => return tombstone.unwrap_or(idx),
            Entry::Tombstone => {
                tombstone.get_or_insert(idx);
            }
            Entry::Occupied(k, _) if k == key => return idx,
            Entry::Occupied(..) => (),
        }
        idx = (idx + 1) & mask;
    }
}

impl Trace for StrKey {
    fn trace(&self, gray: &mut Vec<ObjRef>) {
        gray.push(self.obj);
    }
}

impl Trace for MapKey {
    fn trace(&self, gray: &mut Vec<ObjRef>) {
        if let Self::Str(key) = self {
            key.trace(gray);
        }
    }
}

impl<K: TableKey + Trace, V: Trace> Trace for Table<K, V> {
    fn trace(&self, gray: &mut Vec<ObjRef>) {
        for (k, v) in self.iter() {
            k.trace(gray);
            v.trace(gray);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// A key whose hash collides often, to exercise probing
    #[derive(Copy, Clone, Debug, PartialEq)]
    struct Clashing(u32);

    impl TableKey for Clashing {
        fn hash(&self) -> u32 {
            self.0 % 5
        }
    }

    #[derive(Clone, Debug)]
    enum TableOp {
        Insert(u32, i32),
        Remove(u32),
    }

    fn table_op() -> impl Strategy<Value = TableOp> {
        prop_oneof![
            (0u32..64, any::<i32>()).prop_map(|(k, v)| TableOp::Insert(k, v)),
            (0u32..64).prop_map(TableOp::Remove),
        ]
    }

    #[test]
    fn insert_get_remove() {
        let mut table: Table<Clashing, &str> = Table::default();
        assert!(table.insert(Clashing(1), "one"));
        assert!(table.insert(Clashing(6), "six"));
        assert!(!table.insert(Clashing(1), "uno"));
        assert_eq!(table.get(&Clashing(1)), Some(&"uno"));
        assert_eq!(table.remove(&Clashing(1)), Some("uno"));
        // 6 sits past the tombstone left by 1
        assert_eq!(table.get(&Clashing(6)), Some(&"six"));
        assert_eq!(table.get(&Clashing(1)), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn grows_with_floor_of_eight() {
        let mut table: Table<Clashing, u32> = Table::default();
        assert_eq!(table.capacity(), 0);
        table.insert(Clashing(0), 0);
        assert_eq!(table.capacity(), 8);
        for i in 1..7 {
            table.insert(Clashing(i), i);
        }
        assert_eq!(table.capacity(), 16);
        for i in 0..7 {
            assert_eq!(table.get(&Clashing(i)), Some(&i));
        }
    }

    #[test]
    fn tombstone_is_reused() {
        let mut table: Table<Clashing, u32> = Table::default();
        for i in 0..4 {
            table.insert(Clashing(i), i);
        }
        let capacity = table.capacity();
        for _ in 0..100 {
            table.remove(&Clashing(3));
            table.insert(Clashing(3), 3);
        }
        assert_eq!(table.capacity(), capacity);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn map_keys_normalise_negative_zero() {
        assert_eq!(MapKey::number(-0.0), MapKey::number(0.0));
        assert_eq!(MapKey::number(-0.0).hash(), MapKey::number(0.0).hash());
        assert_ne!(MapKey::number(1.0), MapKey::number(2.0));
    }

    #[test]
    fn fnv1a() {
        assert_eq!(hash_str(""), 2166136261);
        assert_eq!(hash_str("a"), 0xe40c292c);
    }

    proptest! {
        #[test]
        fn behaves_like_hashmap(ops in proptest::collection::vec(table_op(), 0..200)) {
            let mut table: Table<Clashing, i32> = Table::default();
            let mut model: HashMap<u32, i32> = HashMap::new();
            for op in ops {
                match op {
                    TableOp::Insert(k, v) => {
                        let is_new = table.insert(Clashing(k), v);
                        prop_assert_eq!(is_new, model.insert(k, v).is_none());
                    }
                    TableOp::Remove(k) => {
                        prop_assert_eq!(table.remove(&Clashing(k)), model.remove(&k));
                    }
                }
                prop_assert!(table.count * 4 <= table.capacity() * 3);
            }
            prop_assert_eq!(table.len(), model.len());
            for (k, v) in &model {
                prop_assert_eq!(table.get(&Clashing(*k)), Some(v));
            }
        }
    }
}
