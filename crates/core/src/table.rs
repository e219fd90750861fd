//! Open-addressed hash table keyed by interned strings
//!
//! Globals, instance fields, class method tables, and the intern set all use
//! this table. Keys carry their cached FNV-1a hash alongside the string
//! handle, so probing and resizing never need to consult the heap, and key
//! comparison is handle identity (interning guarantees canonical handles).
//!
//! Layout follows the classic open-addressing scheme: power-of-two capacity,
//! linear probing masked by `capacity - 1`, a 0.75 maximum load factor, and
//! tombstones (`key = None, value = true`) distinguishing deleted entries
//! from empty ones (`key = None, value = nil`).

use crate::heap::ObjRef;
use crate::value::Value;

const MAX_LOAD_NUMERATOR: usize = 3;
const MAX_LOAD_DENOMINATOR: usize = 4;

/// An interned-string key with its cached hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringKey {
    pub string: ObjRef,
    pub hash: u32,
}

#[derive(Debug, Clone)]
struct Entry {
    key: Option<StringKey>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: None,
            value: Value::Nil,
        }
    }

    #[cfg(test)]
    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value != Value::Nil
    }
}

/// Open-addressed table from interned strings to values.
#[derive(Debug, Clone, Default)]
pub struct Table {
    /// Live entries plus tombstones; reset only on resize.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Index of the entry for `key`: the matching slot, the first reusable
    /// tombstone, or the terminating empty slot.
    fn find_entry(entries: &[Entry], key: StringKey) -> usize {
        let mask = entries.len() - 1;
        let mut index = key.hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.value == Value::Nil {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(existing) if existing.string == key.string => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry::empty(); capacity];
        self.count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let dest = Self::find_entry(&entries, key);
                entries[dest] = entry.clone();
                self.count += 1;
            }
        }
        self.entries = entries;
    }

    pub fn get(&self, key: StringKey) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Insert or overwrite. Returns true when `key` was not present before.
    pub fn set(&mut self, key: StringKey, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DENOMINATOR > self.capacity() * MAX_LOAD_NUMERATOR {
            let capacity = if self.capacity() < 8 {
                8
            } else {
                self.capacity() * 2
            };
            self.adjust_capacity(capacity);
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && entry.value == Value::Nil {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    /// Replace the entry with a tombstone. Returns true when `key` was live.
    pub fn delete(&mut self, key: StringKey) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Probe for a key with the given hash whose string satisfies
    /// `matches`. This is the intern-set lookup: it must compare bytes
    /// because no canonical handle exists yet for the probe string.
    pub fn find_key(&self, hash: u32, mut matches: impl FnMut(ObjRef) -> bool) -> Option<StringKey> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.value == Value::Nil {
                        return None;
                    }
                }
                Some(key) if key.hash == hash && matches(key.string) => return Some(key),
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// Live entries, in probe order.
    pub fn iter(&self) -> impl Iterator<Item = (StringKey, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn tombstone_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_tombstone()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u32) -> StringKey {
        // Fabricated handles are fine here: the table never dereferences
        // them, identity and the carried hash are all it needs.
        StringKey {
            string: ObjRef::from_raw(id),
            hash: id.wrapping_mul(2654435761),
        }
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut table = Table::new();
        assert!(table.set(key(1), Value::Number(10.0)));
        assert!(table.set(key(2), Value::Bool(true)));
        assert_eq!(table.get(key(1)), Some(Value::Number(10.0)));
        assert_eq!(table.get(key(2)), Some(Value::Bool(true)));
        assert_eq!(table.get(key(3)), None);
    }

    #[test]
    fn test_overwrite_is_not_new() {
        let mut table = Table::new();
        assert!(table.set(key(7), Value::Number(1.0)));
        assert!(!table.set(key(7), Value::Number(2.0)));
        assert_eq!(table.get(key(7)), Some(Value::Number(2.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_plants_tombstone() {
        let mut table = Table::new();
        table.set(key(1), Value::Nil);
        table.set(key(2), Value::Number(2.0));
        assert!(table.delete(key(1)));
        assert!(!table.delete(key(1)));
        assert_eq!(table.get(key(1)), None);
        assert_eq!(table.get(key(2)), Some(Value::Number(2.0)));
        assert_eq!(table.tombstone_count(), 1);
    }

    #[test]
    fn test_tombstone_slot_is_reused() {
        let mut table = Table::new();
        table.set(key(1), Value::Number(1.0));
        table.delete(key(1));
        table.set(key(1), Value::Number(9.0));
        assert_eq!(table.get(key(1)), Some(Value::Number(9.0)));
        assert_eq!(table.tombstone_count(), 0);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut table = Table::new();
        for i in 0..100 {
            table.set(key(i), Value::Number(f64::from(i)));
        }
        for i in 0..100 {
            assert_eq!(table.get(key(i)), Some(Value::Number(f64::from(i))));
        }
        assert_eq!(table.len(), 100);
        // Capacity stays a power of two.
        assert!(table.capacity().is_power_of_two());
    }

    #[test]
    fn test_resize_drops_tombstones() {
        let mut table = Table::new();
        for i in 0..6 {
            table.set(key(i), Value::Number(f64::from(i)));
        }
        for i in 0..3 {
            table.delete(key(i));
        }
        for i in 100..110 {
            table.set(key(i), Value::Number(f64::from(i)));
        }
        assert_eq!(table.tombstone_count(), 0);
        for i in 3..6 {
            assert!(table.get(key(i)).is_some());
        }
    }

    #[test]
    fn test_colliding_hashes_still_distinct() {
        let mut table = Table::new();
        let a = StringKey {
            string: ObjRef::from_raw(1),
            hash: 42,
        };
        let b = StringKey {
            string: ObjRef::from_raw(2),
            hash: 42,
        };
        table.set(a, Value::Number(1.0));
        table.set(b, Value::Number(2.0));
        assert_eq!(table.get(a), Some(Value::Number(1.0)));
        assert_eq!(table.get(b), Some(Value::Number(2.0)));
    }
}
