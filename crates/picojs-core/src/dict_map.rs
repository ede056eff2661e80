//! Open-addressing property map for dictionary-mode objects.
//!
//! Plain `FxHashMap` would do the key→slot mapping, but an explicit
//! open-addressing table with quadratic probing and a free-slot list
//! keeps deletions from shrinking or renumbering the descriptor array —
//! an invariant callers can rely on for slot stability across deletes.

use crate::object::{PropertyAttributes, PropertyKey, PropertySlot};

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Deleted,
    Occupied { key_hash: u64, descriptor: u32 },
}

/// One property's storage: its attributes plus the value slot index.
#[derive(Clone)]
struct Descriptor {
    key: PropertyKey,
    attributes: PropertyAttributes,
    /// `None` once the descriptor has been freed and is sitting on the
    /// free list awaiting reuse.
    live: bool,
}

/// Open-addressing hash table, quadratic probing, backing dictionary-mode
/// objects.
pub struct DictPropertyMap {
    table: Vec<Slot>,
    descriptors: Vec<Descriptor>,
    values: Vec<PropertySlot>,
    free_list: Vec<u32>,
    len: usize,
}

impl Default for DictPropertyMap {
    fn default() -> Self {
        Self::new()
    }
}

impl DictPropertyMap {
    pub fn new() -> Self {
        Self::with_capacity(8)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(8);
        Self {
            table: vec![Slot::Empty; capacity],
            descriptors: Vec::new(),
            values: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of descriptor slots ever allocated minus ones freed and
    /// reused — i.e. the live watermark. Exposed so tests can confirm
    /// slot reuse never grows the descriptor array unboundedly.
    pub fn descriptor_capacity_used(&self) -> usize {
        self.descriptors.len()
    }

    fn key_hash(key: &PropertyKey) -> u64 {
        key.fx_hash()
    }

    fn find_slot(&self, key: &PropertyKey, hash: u64) -> (usize, bool) {
        let mask = self.table.len() - 1;
        let mut idx = (hash as usize) & mask;
        let mut probe = 0usize;
        let mut first_deleted: Option<usize> = None;
        loop {
            match &self.table[idx] {
                Slot::Empty => return (first_deleted.unwrap_or(idx), false),
                Slot::Deleted => {
                    if first_deleted.is_none() {
                        first_deleted = Some(idx);
                    }
                }
                Slot::Occupied { key_hash, descriptor } => {
                    if *key_hash == hash && self.descriptors[*descriptor as usize].key == *key {
                        return (idx, true);
                    }
                }
            }
            probe += 1;
            idx = (idx + probe) & mask;
            debug_assert!(probe <= self.table.len(), "dict map probe sequence exhausted capacity");
        }
    }

    fn grow(&mut self) {
        let new_capacity = self.table.len() * 2;
        let mut new_table = vec![Slot::Empty; new_capacity];
        let mask = new_capacity - 1;
        for slot in &self.table {
            if let Slot::Occupied { key_hash, descriptor } = slot {
                let mut idx = (*key_hash as usize) & mask;
                let mut probe = 0usize;
                while matches!(new_table[idx], Slot::Occupied { .. }) {
                    probe += 1;
                    idx = (idx + probe) & mask;
                }
                new_table[idx] = Slot::Occupied { key_hash: *key_hash, descriptor: *descriptor };
            }
        }
        self.table = new_table;
    }

    pub fn insert(&mut self, key: PropertyKey, value: PropertySlot, attributes: PropertyAttributes) {
        let hash = Self::key_hash(&key);
        let (idx, existed) = self.find_slot(&key, hash);
        if existed {
            if let Slot::Occupied { descriptor, .. } = self.table[idx] {
                self.values[descriptor as usize] = value;
                self.descriptors[descriptor as usize].attributes = attributes;
            }
            return;
        }

        if (self.len + 1) * 4 >= self.table.len() * 3 {
            self.grow();
            self.insert(key, value, attributes);
            return;
        }

        let descriptor_index = if let Some(reused) = self.free_list.pop() {
            self.descriptors[reused as usize] = Descriptor { key: key.clone(), attributes, live: true };
            self.values[reused as usize] = value;
            reused
        } else {
            self.descriptors.push(Descriptor { key: key.clone(), attributes, live: true });
            self.values.push(value);
            (self.descriptors.len() - 1) as u32
        };

        let (idx, _) = self.find_slot(&key, hash);
        self.table[idx] = Slot::Occupied { key_hash: hash, descriptor: descriptor_index };
        self.len += 1;
    }

    pub fn get(&self, key: &PropertyKey) -> Option<&PropertySlot> {
        let hash = Self::key_hash(key);
        let (idx, found) = self.find_slot(key, hash);
        if !found {
            return None;
        }
        if let Slot::Occupied { descriptor, .. } = self.table[idx] {
            Some(&self.values[descriptor as usize])
        } else {
            None
        }
    }

    pub fn get_attributes(&self, key: &PropertyKey) -> Option<PropertyAttributes> {
        let hash = Self::key_hash(key);
        let (idx, found) = self.find_slot(key, hash);
        if !found {
            return None;
        }
        if let Slot::Occupied { descriptor, .. } = self.table[idx] {
            Some(self.descriptors[descriptor as usize].attributes)
        } else {
            None
        }
    }

    /// Remove `key`. Pushes its descriptor slot onto the free list so the
    /// next insert reuses it instead of growing `descriptors`/`values`.
    pub fn remove(&mut self, key: &PropertyKey) -> bool {
        let hash = Self::key_hash(key);
        let (idx, found) = self.find_slot(key, hash);
        if !found {
            return false;
        }
        if let Slot::Occupied { descriptor, .. } = self.table[idx] {
            self.descriptors[descriptor as usize].live = false;
            self.values[descriptor as usize] = PropertySlot::Data(crate::value::Value::undefined());
            self.free_list.push(descriptor);
            self.table[idx] = Slot::Deleted;
            self.len -= 1;
            true
        } else {
            false
        }
    }

    pub fn contains(&self, key: &PropertyKey) -> bool {
        self.get(key).is_some()
    }

    /// Own keys in insertion order is not preserved by design (dictionary
    /// mode objects are expected to be the "wide, rarely-iterated" case);
    /// callers that need ordered enumeration must keep their own list.
    pub fn keys(&self) -> impl Iterator<Item = &PropertyKey> {
        self.descriptors.iter().filter(|d| d.live).map(|d| &d.key)
    }
}

impl PropertyKey {
    pub(crate) fn fx_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = rustc_hash::FxHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }
}
