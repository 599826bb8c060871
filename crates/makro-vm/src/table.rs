use std::mem;

use crate::gc::{Gc, ObjectRef, Trace};
use crate::value::Value;

/// A string key. Keys are interned, so they compare by identity; the hash
/// is carried alongside to avoid a trip to the heap while probing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StrKey {
    pub object: ObjectRef,
    pub hash: u32,
}

/// An empty entry has no key and a `null` value. A tombstone has no key and
/// a `true` value, and keeps lookup chains intact after a delete.
#[derive(Clone, Copy, Debug)]
struct Entry {
    key: Option<StrKey>,
    value: Value,
}

impl Entry {
    const EMPTY: Self = Self { key: None, value: Value::Null };
    const TOMBSTONE: Self = Self { key: None, value: Value::TRUE };

    fn is_empty(&self) -> bool {
        self.key.is_none() && self.value == Value::Null
    }
}

/// Open-addressing hash table with linear probing, keyed by interned strings.
/// Used for globals, instance fields and the string intern set.
#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn get(&self, key: StrKey) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[find_entry(&self.entries, key)];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or overwrites `key`. Returns `true` if the key was not
    /// present before.
    pub fn set(&mut self, key: StrKey, value: Value) -> bool {
        // Grow once the load factor would exceed 3/4.
        if (self.count + 1) * 4 > self.entries.len() * 3 {
            let capacity = if self.entries.len() < 8 { 8 } else { self.entries.len() * 2 };
            self.adjust_capacity(capacity);
        }

        let idx = find_entry(&self.entries, key);
        let entry = &mut self.entries[idx];
        let is_new_key = entry.key.is_none();
        if entry.is_empty() {
            self.count += 1;
        }
        *entry = Entry { key: Some(key), value };
        is_new_key
    }

    /// Removes `key`, leaving a tombstone. Returns `true` if it was present.
    pub fn delete(&mut self, key: StrKey) -> bool {
        if self.count == 0 {
            return false;
        }
        let idx = find_entry(&self.entries, key);
        let entry = &mut self.entries[idx];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry::TOMBSTONE;
        true
    }

    /// Copies every live entry of `self` into `to`.
    pub fn copy_all(&self, to: &mut Table) {
        for (key, value) in self.iter() {
            to.set(key, value);
        }
    }

    /// Finds a key by content rather than identity. This is how strings
    /// are interned: `resolve` maps a key to its characters.
    pub fn find_interned<'a>(
        &self,
        chars: &str,
        hash: u32,
        resolve: impl Fn(ObjectRef) -> &'a str,
    ) -> Option<ObjectRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut idx = hash as usize % capacity;
        loop {
            let entry = &self.entries[idx];
            match entry.key {
                None if entry.is_empty() => return None,
                Some(key) if key.hash == hash && resolve(key.object) == chars => {
                    return Some(key.object);
                }
                _ => {}
            }
            idx = (idx + 1) % capacity;
        }
    }

    /// Tombstones every entry whose key is not marked. Run before a sweep
    /// so that the table never refers to a freed string.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(ObjectRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !is_marked(key.object) {
                    tracing::trace!(?key, "remove unmarked key");
                    *entry = Entry::TOMBSTONE;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (StrKey, Value)> + '_ {
        self.entries.iter().filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Bytes owned by the entry array.
    pub fn size(&self) -> usize {
        self.entries.len() * mem::size_of::<Entry>()
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let old = mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let idx = find_entry(&self.entries, key);
                self.entries[idx] = entry;
                self.count += 1;
            }
        }
    }
}

impl Trace for Table {
    fn trace(&self, gc: &mut Gc) {
        for (key, value) in self.iter() {
            gc.mark(key.object);
            value.trace(gc);
        }
    }
}

/// Returns the slot holding `key`, or the slot it should be inserted in:
/// the first tombstone on the lookup chain if there is one, otherwise the
/// empty slot that ended the search.
fn find_entry(entries: &[Entry], key: StrKey) -> usize {
    let capacity = entries.len();
    let mut idx = key.hash as usize % capacity;
    let mut tombstone = None;
    loop {
        let entry = &entries[idx];
        match entry.key {
            None if entry.is_empty() => return tombstone.unwrap_or(idx),
            None => {
                tombstone.get_or_insert(idx);
            }
            Some(other) if other.object == key.object => return idx,
            Some(_) => {}
        }
        idx = (idx + 1) % capacity;
    }
}

#[cfg(test)]
mod tests {
    use std::hash::BuildHasherDefault;

    use hashbrown::HashMap;
    use pretty_assertions::assert_eq;
    use rustc_hash::FxHasher;

    use super::*;

    fn keys(gc: &mut Gc, count: usize) -> Vec<StrKey> {
        (0..count)
            .map(|i| {
                let object = gc.intern(&format!("key{i}"));
                gc.str_key(object)
            })
            .collect()
    }

    #[test]
    fn empty_table() {
        let mut gc = Gc::default();
        let key = keys(&mut gc, 1)[0];
        let mut table = Table::default();

        assert_eq!(table.capacity(), 0);
        assert_eq!(table.get(key), None);
        assert!(!table.delete(key));
        assert_eq!(table.find_interned("key0", key.hash, |_| "key0"), None);
    }

    #[test]
    fn set_get_delete() {
        let mut gc = Gc::default();
        let keys = keys(&mut gc, 2);
        let (a, b) = (keys[0], keys[1]);
        let mut table = Table::default();

        assert!(table.set(a, Value::Number(1.0)));
        assert!(!table.set(a, Value::Number(2.0)));
        assert!(table.set(b, Value::Null));
        assert_eq!(table.capacity(), 8);
        assert_eq!(table.get(a), Some(Value::Number(2.0)));
        assert_eq!(table.get(b), Some(Value::Null));

        assert!(table.delete(a));
        assert!(!table.delete(a));
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(b), Some(Value::Null));
        assert_eq!(table.len(), 1);

        // Reinsertion reuses the tombstone.
        assert!(table.set(a, Value::FALSE));
        assert_eq!(table.count, 2);
    }

    #[test]
    fn matches_reference_map() {
        let mut gc = Gc::default();
        let keys = keys(&mut gc, 200);
        let mut table = Table::default();
        let mut reference = HashMap::<_, _, BuildHasherDefault<FxHasher>>::default();

        for (i, &key) in keys.iter().enumerate() {
            let value = Value::Number(i as f64);
            assert_eq!(table.set(key, value), reference.insert(key.object, value).is_none());
            if i % 3 == 0 {
                let victim = keys[i / 2];
                assert_eq!(table.delete(victim), reference.remove(&victim.object).is_some());
            }
        }

        assert_eq!(table.len(), reference.len());
        for key in &keys {
            assert_eq!(table.get(*key), reference.get(&key.object).copied());
        }
        // Load factor never exceeds 3/4, tombstones included.
        assert!(table.count * 4 <= table.capacity() * 3);
    }

    #[test]
    fn copy_all_overwrites() {
        let mut gc = Gc::default();
        let keys = keys(&mut gc, 3);
        let (a, b, c) = (keys[0], keys[1], keys[2]);
        let mut from = Table::default();
        let mut to = Table::default();
        from.set(a, Value::Number(1.0));
        from.set(b, Value::Number(2.0));
        from.delete(b);
        to.set(a, Value::Number(0.0));
        to.set(c, Value::Number(3.0));

        from.copy_all(&mut to);

        assert_eq!(to.get(a), Some(Value::Number(1.0)));
        assert_eq!(to.get(b), None);
        assert_eq!(to.get(c), Some(Value::Number(3.0)));
    }

    #[test]
    fn remove_unmarked_leaves_tombstones() {
        let mut gc = Gc::default();
        let keys = keys(&mut gc, 2);
        let (a, b) = (keys[0], keys[1]);
        let mut table = Table::default();
        table.set(a, Value::Null);
        table.set(b, Value::Null);

        table.remove_unmarked(|object| object == a.object);

        assert_eq!(table.get(a), Some(Value::Null));
        assert_eq!(table.get(b), None);
        assert_eq!(table.count, 2);
    }
}
