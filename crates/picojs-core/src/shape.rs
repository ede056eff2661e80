//! Hidden classes ("shapes").
//!
//! A `Shape` is a node in an append-only transition tree: objects with an
//! identical property history share the same `Shape`, which is what lets
//! `PropertyCache` key a cache entry on a shape id instead of an object
//! identity. Transitions are cached on the parent (`transitions`) so
//! re-adding the same property in the same order — the common case for
//! objects built by the same constructor — reuses the existing child
//! instead of allocating a new one.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;

use crate::object::{PropertyAttributes, PropertyKey};

/// Objects that accumulate more own properties than this convert to
/// dictionary mode. Mutable at process scope via
/// [`set_dictionary_mode_threshold`] so `RuntimeConfig` can tune it per
/// `Runtime`; shapes have no per-runtime handle to thread a value through
/// instead.
static DICTIONARY_MODE_THRESHOLD: AtomicUsize = AtomicUsize::new(128);

pub fn dictionary_mode_threshold() -> usize {
    DICTIONARY_MODE_THRESHOLD.load(Ordering::Relaxed)
}

pub fn set_dictionary_mode_threshold(threshold: usize) {
    DICTIONARY_MODE_THRESHOLD.store(threshold, Ordering::Relaxed);
}

/// Fixed number of inline property slots an object carries before
/// spilling to the overflow array.
pub const INLINE_PROPERTY_SLOTS: usize = 4;

static NEXT_SHAPE_ID: AtomicU32 = AtomicU32::new(1);

/// Where a property lives and how it may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDescriptorInfo {
    pub slot: u32,
    pub attributes: PropertyAttributes,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct TransitionKey {
    prop: PropertyKey,
    attributes: PropertyAttributes,
}

/// A node in the hidden-class transition tree.
///
/// `Send + Sync` is asserted unsafely: shapes are only ever touched from
/// the single VM thread that owns the `Runtime`, and `RefCell` only
/// needs that confinement, not true thread-safety.
pub struct Shape {
    id: u32,
    parent: Option<Arc<Shape>>,
    added: Option<(PropertyKey, PropertyAttributes)>,
    slot: Option<u32>,
    transitions: RefCell<FxHashMap<TransitionKey, Weak<Shape>>>,
    property_map: FxHashMap<PropertyKey, PropertyDescriptorInfo>,
    keys_ordered: Vec<PropertyKey>,
}

// SAFETY: Shape is only ever accessed from the single VM thread that owns
// the runtime's handle stack; see module docs.
unsafe impl Send for Shape {}
unsafe impl Sync for Shape {}

impl Shape {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SHAPE_ID.fetch_add(1, Ordering::Relaxed),
            parent: None,
            added: None,
            slot: None,
            transitions: RefCell::new(FxHashMap::default()),
            property_map: FxHashMap::default(),
            keys_ordered: Vec::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn own_property_count(&self) -> usize {
        self.keys_ordered.len()
    }

    pub fn find(&self, key: &PropertyKey) -> Option<PropertyDescriptorInfo> {
        self.property_map.get(key).copied()
    }

    pub fn own_keys(&self) -> &[PropertyKey] {
        &self.keys_ordered
    }

    /// Find (or create) the child shape for adding `key` with `attributes`,
    /// exposed here as one method plus a slot-returning wrapper below.
    pub fn transition(self: &Arc<Self>, key: PropertyKey, attributes: PropertyAttributes) -> Arc<Shape> {
        let tkey = TransitionKey { prop: key.clone(), attributes };

        if let Some(existing) = self.transitions.borrow().get(&tkey).and_then(Weak::upgrade) {
            return existing;
        }

        let mut transitions = self.transitions.borrow_mut();
        if let Some(existing) = transitions.get(&tkey).and_then(Weak::upgrade) {
            return existing;
        }

        let next_slot = self.slot.map(|s| s + 1).unwrap_or(0);
        let mut property_map = self.property_map.clone();
        property_map.insert(key.clone(), PropertyDescriptorInfo { slot: next_slot, attributes });
        let mut keys_ordered = self.keys_ordered.clone();
        keys_ordered.push(key.clone());

        let child = Arc::new(Shape {
            id: NEXT_SHAPE_ID.fetch_add(1, Ordering::Relaxed),
            parent: Some(Arc::clone(self)),
            added: Some((key, attributes)),
            slot: Some(next_slot),
            transitions: RefCell::new(FxHashMap::default()),
            property_map,
            keys_ordered,
        });

        transitions.insert(tkey, Arc::downgrade(&child));
        child
    }

    /// Transition and return the new slot directly.
    pub fn add_property(self: &Arc<Self>, key: PropertyKey, attributes: PropertyAttributes) -> (Arc<Shape>, u32) {
        let child = self.transition(key, attributes);
        let slot = child.slot.expect("transition always assigns a slot");
        (child, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolId;

    fn key(name: u32) -> PropertyKey {
        PropertyKey::Symbol(SymbolId(name))
    }

    #[test]
    fn shape_monotonicity() {
        // Along any transition chain, own keys strictly grow.
        let root = Shape::root();
        let (s1, slot_a) = root.add_property(key(1), PropertyAttributes::data());
        let (s2, slot_b) = s1.add_property(key(2), PropertyAttributes::data());

        assert_eq!(slot_a, 0);
        assert_eq!(slot_b, 1);
        assert!(s2.own_keys().len() > s1.own_keys().len());
        for k in s1.own_keys() {
            assert!(s2.own_keys().contains(k));
        }
    }

    #[test]
    fn identical_transitions_share_shape() {
        // Two objects built the same way share a shape.
        let root = Shape::root();
        let (p_a, _) = root.add_property(key(1), PropertyAttributes::data());
        let (p_b, _) = p_a.add_property(key(2), PropertyAttributes::data());

        let (q_a, _) = root.add_property(key(1), PropertyAttributes::data());
        let (q_b, _) = q_a.add_property(key(2), PropertyAttributes::data());

        assert_eq!(p_a.id(), q_a.id());
        assert_eq!(p_b.id(), q_b.id());
    }

    #[test]
    fn slots_never_renumber_on_further_transitions() {
        let root = Shape::root();
        let (s1, slot_a) = root.add_property(key(1), PropertyAttributes::data());
        let (_s2, _) = s1.add_property(key(2), PropertyAttributes::data());
        assert_eq!(s1.find(&key(1)).unwrap().slot, slot_a);
    }
}
