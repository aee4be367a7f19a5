// File: src/table.rs
//
// Open-addressed hash table with linear probing: load factor 0.75,
// capacity doubles (minimum 8), tombstones distinguish a
// deleted slot from one that was never used so probe chains survive
// deletion. Keys are interned-string ObjRefs, so key equality is index
// identity; the one exception is the string-interning path itself
// (`Heap::intern`/`Heap::find_interned`), which must compare by content
// before a candidate has even been turned into an ObjRef. `find_by_hash`
// exposes the table's own probe order for that case, but the content
// comparison itself still happens on `Heap`, since only the heap can
// dereference a string's bytes.
//
// Rather than encode "empty" / "tombstone" as magic `Value`s the way a
// single concrete-`Value`-keyed table would, this generic `Table<V>`
// tags each slot explicitly. Same probing algorithm, clearer invariant.

use crate::object::ObjRef;

enum Slot<V> {
    Empty,
    Tombstone,
    Occupied { key: ObjRef, hash: u32, value: V },
}

pub struct Table<V> {
    slots: Vec<Slot<V>>,
    /// Occupied + tombstone count; drives the 0.75 load-factor growth.
    len: usize,
}

impl<V: Clone> Default for Table<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Table<V> {
    pub fn new() -> Self {
        Table { slots: Vec::new(), len: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.count_occupied() == 0
    }

    fn count_occupied(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Occupied { .. })).count()
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn grow(&mut self) {
        let new_cap = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
        let old = std::mem::replace(&mut self.slots, (0..new_cap).map(|_| Slot::Empty).collect());
        self.len = 0;
        for slot in old {
            if let Slot::Occupied { key, hash, value } = slot {
                self.insert_raw(key, hash, value);
            }
        }
    }

    fn ensure_capacity(&mut self) {
        if self.capacity() == 0 || (self.len + 1) as f64 / self.capacity() as f64 > 0.75 {
            self.grow();
        }
    }

    /// Finds the slot index a (key, hash) belongs in: either its current
    /// occupied slot, the first tombstone seen along the probe chain (so
    /// re-insertion reclaims it), or the first truly empty slot.
    fn find_slot(&self, key: ObjRef, hash: u32) -> usize {
        let cap = self.capacity();
        let mut index = (hash as usize) % cap;
        let mut tombstone: Option<usize> = None;
        loop {
            match &self.slots[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Occupied { key: k, .. } if k.ptr_eq(key) => return index,
                Slot::Occupied { .. } => {}
            }
            index = (index + 1) % cap;
        }
    }

    fn insert_raw(&mut self, key: ObjRef, hash: u32, value: V) -> bool {
        let index = self.find_slot(key, hash);
        let is_new = !matches!(self.slots[index], Slot::Occupied { .. });
        if is_new && !matches!(self.slots[index], Slot::Tombstone) {
            self.len += 1;
        }
        self.slots[index] = Slot::Occupied { key, hash, value };
        is_new
    }

    /// Returns `true` if this inserted a new key (as opposed to overwriting).
    pub fn set(&mut self, key: ObjRef, hash: u32, value: V) -> bool {
        self.ensure_capacity();
        self.insert_raw(key, hash, value)
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<&V> {
        if self.capacity() == 0 {
            return None;
        }
        let index = self.find_slot(key, hash);
        match &self.slots[index] {
            Slot::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: ObjRef, hash: u32) -> Option<&mut V> {
        if self.capacity() == 0 {
            return None;
        }
        let index = self.find_slot(key, hash);
        match &mut self.slots[index] {
            Slot::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: ObjRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Deletes an entry, leaving a tombstone so later probe chains
    /// through this slot remain intact.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let index = self.find_slot(key, hash);
        if matches!(self.slots[index], Slot::Occupied { .. }) {
            self.slots[index] = Slot::Tombstone;
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &V)> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied { key, value, .. } => Some((*key, value)),
            _ => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjRef, &mut V)> {
        self.slots.iter_mut().filter_map(|s| match s {
            Slot::Occupied { key, value, .. } => Some((*key, value)),
            _ => None,
        })
    }

    /// `tableFindKey`: scan linearly for the first key whose value equals
    /// the given predicate — used to recover a global's name for runtime
    /// error messages.
    pub fn find_key_by(&self, mut pred: impl FnMut(&V) -> bool) -> Option<ObjRef> {
        self.iter().find(|(_, v)| pred(v)).map(|(k, _)| k)
    }

    /// `tableFindString`: walks the same linear-probe sequence `find_slot`
    /// would for this hash, calling `pred` on every occupied entry whose
    /// stored hash matches, until it returns `true` or the sequence hits
    /// a truly empty slot (tombstones don't end the chain). Lets a
    /// caller who can't construct the key up front — interning needs to
    /// find a string by content before it has an `ObjRef` for it — reuse
    /// the table's own probe order instead of a full scan.
    pub fn find_by_hash(&self, hash: u32, mut pred: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        let cap = self.capacity();
        if cap == 0 {
            return None;
        }
        let mut index = (hash as usize) % cap;
        loop {
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Occupied { key, hash: h, .. } if *h == hash && pred(*key) => return Some(*key),
                _ => {}
            }
            index = (index + 1) % cap;
        }
    }

    /// Weak-reference sweep: removes entries whose key is not in
    /// `is_marked`. Used to keep the string-interning table from pinning
    /// unreachable strings alive (§4.3 step 3).
    pub fn retain_marked(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for slot in &mut self.slots {
            if let Slot::Occupied { key, .. } = slot {
                if !is_marked(*key) {
                    *slot = Slot::Tombstone;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut t: Table<i32> = Table::new();
        let k1 = ObjRef(1);
        let k2 = ObjRef(2);
        assert!(t.set(k1, 10, 100));
        assert!(t.set(k2, 20, 200));
        assert!(!t.set(k1, 10, 101)); // overwrite, not new
        assert_eq!(t.get(k1, 10), Some(&101));
        assert_eq!(t.get(k2, 20), Some(&200));
        assert!(t.delete(k1, 10));
        assert_eq!(t.get(k1, 10), None);
        // tombstone shouldn't break the probe chain to k2
        assert_eq!(t.get(k2, 20), Some(&200));
    }

    #[test]
    fn find_by_hash_probes_past_tombstones_and_hash_collisions() {
        let mut t: Table<i32> = Table::new();
        let k1 = ObjRef(1);
        let k2 = ObjRef(2);
        let k3 = ObjRef(3);
        t.set(k1, 5, 100);
        t.set(k2, 5, 200); // same hash as k1, lands via probing
        t.set(k3, 5, 300);
        t.delete(k2, 5); // tombstone between k1 and k3's final slots

        assert_eq!(t.find_by_hash(5, |r| r.ptr_eq(k3)), Some(k3));
        assert_eq!(t.find_by_hash(5, |r| r.ptr_eq(k2)), None);
        assert_eq!(t.find_by_hash(99, |_| true), None);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t: Table<i32> = Table::new();
        for i in 0..100u32 {
            t.set(ObjRef(i), i, i as i32);
        }
        for i in 0..100u32 {
            assert_eq!(t.get(ObjRef(i), i), Some(&(i as i32)));
        }
    }
}
