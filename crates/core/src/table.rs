//! Open-addressing hash map keyed by values.
//!
//! Used for the globals environment and the string intern pool. Linear
//! probing with tombstones so that deleting an entry never breaks another
//! key's probe chain. String keys hash with their cached FNV-1a hash; other
//! values hash by payload or identity.

use std::rc::Rc;

use crate::memory::fnv1a;
use crate::object::Obj;
use crate::value::Value;

// Load factor 3/4, from the usual open-addressing folklore.
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Debug, Clone)]
struct Entry {
    // None + Null value = never used; None + Num(1) value = tombstone
    key: Option<Value>,
    value: Value,
}

impl Entry {
    fn vacant() -> Entry {
        Entry {
            key: None,
            value: Value::Null,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && !matches!(self.value, Value::Null)
    }
}

/// A value-keyed hash map.
#[derive(Debug, Default)]
pub struct Table {
    // live entries plus tombstones; bounds the probe sequence length
    count: usize,
    entries: Vec<Entry>,
}

fn hash_value(value: &Value) -> u32 {
    match value {
        Value::Obj(obj) => match &**obj {
            Obj::Str(s) => s.hash,
            // non-string objects hash by identity
            _ => fnv1a(&(Rc::as_ptr(obj) as usize).to_ne_bytes()),
        },
        Value::Num(n) => fnv1a(&n.to_bits().to_ne_bytes()),
        Value::Null => 0,
    }
}

fn find_slot(entries: &[Entry], key: &Value) -> usize {
    let mut index = hash_value(key) as usize % entries.len();
    let mut tombstone = None;
    loop {
        let entry = &entries[index];
        match &entry.key {
            None => {
                if entry.is_tombstone() {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                } else {
                    return tombstone.unwrap_or(index);
                }
            }
            Some(existing) if existing == key => return index,
            Some(_) => {}
        }
        index = (index + 1) % entries.len();
    }
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    /// Insert or overwrite. Returns true when the key was not present.
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        if MAX_LOAD_DEN * (self.count + 1) > MAX_LOAD_NUM * self.entries.len() {
            let capacity = if self.entries.len() < 8 {
                8
            } else {
                self.entries.len() * 2
            };
            self.adjust_capacity(capacity);
        }

        let index = find_slot(&self.entries, &key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // a reused tombstone was already counted
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = find_slot(&self.entries, key);
        let entry = &self.entries[index];
        entry.key.as_ref().map(|_| &entry.value)
    }

    /// Remove a key, leaving a tombstone so probe chains stay intact.
    /// Returns true when the key was present.
    pub fn delete(&mut self, key: &Value) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = find_slot(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Num(1.0);
        true
    }

    /// Intern-pool lookup: find a string key by content rather than by
    /// reference. This is the one place the table compares string bytes.
    pub fn find_string(&self, text: &str, hash: u32) -> Option<Rc<Obj>> {
        if self.entries.is_empty() {
            return None;
        }
        let mut index = hash as usize % self.entries.len();
        loop {
            let entry = &self.entries[index];
            match &entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(Value::Obj(obj)) => {
                    if let Obj::Str(s) = &**obj
                        && s.hash == hash
                        && s.as_str() == text
                    {
                        return Some(obj.clone());
                    }
                }
                Some(_) => {}
            }
            index = (index + 1) % self.entries.len();
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let old = std::mem::replace(&mut self.entries, vec![Entry::vacant(); capacity]);
        // tombstones are dropped on rebuild, so recount
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = find_slot(&self.entries, &key);
                self.entries[index] = Entry {
                    key: Some(key),
                    value: entry.value,
                };
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Heap;

    fn key(heap: &mut Heap, text: &str) -> Value {
        Value::Obj(heap.intern(text))
    }

    #[test]
    fn test_set_get_overwrite() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let k = key(&mut heap, "x");

        assert!(table.set(k.clone(), Value::Num(1.0)));
        assert_eq!(table.get(&k), Some(&Value::Num(1.0)));

        // overwriting is not a new key
        assert!(!table.set(k.clone(), Value::Num(2.0)));
        assert_eq!(table.get(&k), Some(&Value::Num(2.0)));
    }

    #[test]
    fn test_get_missing() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        assert_eq!(table.get(&key(&mut heap, "nope")), None);

        table.set(key(&mut heap, "x"), Value::Null);
        assert_eq!(table.get(&key(&mut heap, "nope")), None);
        // a stored null value is still "present"
        assert_eq!(table.get(&key(&mut heap, "x")), Some(&Value::Null));
    }

    #[test]
    fn test_delete_leaves_probe_chains_intact() {
        let mut heap = Heap::new();
        let mut table = Table::new();

        // enough keys to force collisions in a small table
        let names: Vec<String> = (0..32).map(|i| format!("key{}", i)).collect();
        for (i, name) in names.iter().enumerate() {
            table.set(key(&mut heap, name), Value::Num(i as f64));
        }

        // delete every other key, then verify the rest still resolve
        for name in names.iter().step_by(2) {
            assert!(table.delete(&key(&mut heap, name)));
        }
        for (i, name) in names.iter().enumerate() {
            let expected = if i % 2 == 0 {
                None
            } else {
                Some(&Value::Num(i as f64))
            };
            assert_eq!(table.get(&key(&mut heap, name)), expected);
        }

        // tombstoned slots are reusable
        assert!(table.set(key(&mut heap, "key0"), Value::Num(100.0)));
        assert_eq!(table.get(&key(&mut heap, "key0")), Some(&Value::Num(100.0)));
    }

    #[test]
    fn test_delete_missing() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        assert!(!table.delete(&key(&mut heap, "x")));
        table.set(key(&mut heap, "y"), Value::Num(1.0));
        assert!(!table.delete(&key(&mut heap, "x")));
    }

    #[test]
    fn test_growth_keeps_entries() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..100 {
            table.set(key(&mut heap, &format!("g{}", i)), Value::Num(i as f64));
        }
        for i in 0..100 {
            assert_eq!(
                table.get(&key(&mut heap, &format!("g{}", i))),
                Some(&Value::Num(i as f64))
            );
        }
    }

    #[test]
    fn test_find_string_by_content() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let k = key(&mut heap, "needle");
        table.set(k.clone(), Value::Num(1.0));

        let hash = fnv1a(b"needle");
        let found = table.find_string("needle", hash).map(Value::Obj);
        assert_eq!(found, Some(k));
        assert!(table.find_string("missing", fnv1a(b"missing")).is_none());
    }
}
