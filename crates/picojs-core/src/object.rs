//! JS objects: property storage, prototype link, shape/dictionary state.

use std::cell::RefCell;
use std::sync::Arc;

use picojs_bytecode::operand::FunctionIndex;
use picojs_bytecode::Module;
use picojs_gc::{CellKind, GcPtr, Heap, Trace, Tracer};

use crate::dict_map::DictPropertyMap;
use crate::runtime::Runtime;
use crate::shape::{dictionary_mode_threshold, Shape, INLINE_PROPERTY_SLOTS};
use crate::symbol::SymbolId;
use crate::value::Value;
use crate::error::VmResult;

/// A host function a `Call`/`New` can dispatch to directly, bypassing the
/// bytecode dispatch loop. Plain function pointers rather than a boxed
/// closure, matching "host trampoline" rather than a capturing callback.
pub type NativeFn = fn(&mut Runtime, Value, &[Value]) -> VmResult<Value>;

/// What a callable object actually runs when invoked.
#[derive(Clone)]
pub enum Callable {
    Native(NativeFn),
    /// An unclosed top-level function — no captured upvalues.
    Bytecode { module: Arc<Module>, function_index: FunctionIndex },
    /// A closure created by `MakeClosure`, carrying its captured upvalues.
    Closure(GcPtr<crate::closure::Closure>),
    /// `Function.prototype.bind` result: calling it calls `target` with
    /// `bound_this` and `bound_args` prepended to the caller's arguments.
    Bound { target: GcPtr<JsObject>, bound_this: Value, bound_args: Vec<Value> },
}

impl Trace for Callable {
    fn trace(&self, tracer: &mut dyn Tracer) {
        match self {
            Callable::Native(_) | Callable::Bytecode { .. } => {}
            Callable::Closure(c) => c.trace(tracer),
            Callable::Bound { target, bound_this, bound_args } => {
                target.trace(tracer);
                bound_this.trace(tracer);
                for a in bound_args {
                    a.trace(tracer);
                }
            }
        }
    }
}

/// A property key: an interned identifier or a dense array index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    Symbol(SymbolId),
    Index(u32),
}

impl From<SymbolId> for PropertyKey {
    fn from(id: SymbolId) -> Self {
        PropertyKey::Symbol(id)
    }
}

impl From<u32> for PropertyKey {
    fn from(i: u32) -> Self {
        PropertyKey::Index(i)
    }
}

/// Data-property attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyAttributes {
    pub writable: bool,
    pub enumerable: bool,
    pub configurable: bool,
}

impl PropertyAttributes {
    pub const fn data() -> Self {
        Self { writable: true, enumerable: true, configurable: true }
    }

    pub const fn frozen() -> Self {
        Self { writable: false, enumerable: false, configurable: false }
    }

    /// Attributes an accessor property is defined with. `writable` has no
    /// meaning for an accessor (writability is instead "does a setter
    /// exist"); kept `false` so a stray `set_own` on the same key without
    /// going through `define_accessor` can't silently clobber it.
    pub const fn accessor() -> Self {
        Self { writable: false, enumerable: true, configurable: true }
    }
}

/// Outcome of a property write that did not simply succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetPropertyError {
    /// Writing to a non-writable data property in strict mode.
    NotWritable,
    /// Adding a property to a non-extensible object.
    NotExtensible,
    /// Writing through an accessor property that has no setter.
    AccessorWithoutSetter,
}

/// What a property slot actually holds: a plain value, or a getter/setter
/// pair. `Value::Undefined` in either half of `Accessor` means "no getter"
/// / "no setter" — matching how `DefineGetter`/`DefineSetter` each only
/// ever supply one half and must preserve whatever the other opcode
/// already installed.
#[derive(Clone, Copy)]
pub enum PropertySlot {
    Data(Value),
    Accessor { get: Value, set: Value },
}

impl PropertySlot {
    pub fn data(value: Value) -> Self {
        PropertySlot::Data(value)
    }

    pub fn as_data(&self) -> Option<Value> {
        match self {
            PropertySlot::Data(v) => Some(*v),
            PropertySlot::Accessor { .. } => None,
        }
    }

    pub fn as_accessor(&self) -> Option<(Value, Value)> {
        match self {
            PropertySlot::Data(_) => None,
            PropertySlot::Accessor { get, set } => Some((*get, *set)),
        }
    }
}

impl Trace for PropertySlot {
    fn trace(&self, tracer: &mut dyn Tracer) {
        match self {
            PropertySlot::Data(v) => v.trace(tracer),
            PropertySlot::Accessor { get, set } => {
                get.trace(tracer);
                set.trace(tracer);
            }
        }
    }
}

enum ShapeState {
    /// Shared, shape-tree-backed storage: property values live in
    /// `inline`/`overflow`, addressed by the slot the current `Shape`
    /// assigns.
    Shared(Arc<Shape>),
    /// One-way dictionary fallback. Owns its property storage directly;
    /// no further shape sharing happens for this object once here, and
    /// it never converts back to shared mode.
    Dictionary(DictPropertyMap),
}

/// A JavaScript object.
pub struct JsObject {
    state: RefCell<ShapeState>,
    prototype: RefCell<Option<GcPtr<JsObject>>>,
    inline: RefCell<[PropertySlot; INLINE_PROPERTY_SLOTS]>,
    overflow: RefCell<Vec<PropertySlot>>,
    extensible: RefCell<bool>,
    callable: RefCell<Option<Callable>>,
}

impl JsObject {
    pub fn new(prototype: Option<GcPtr<JsObject>>) -> Self {
        Self {
            state: RefCell::new(ShapeState::Shared(Shape::root())),
            prototype: RefCell::new(prototype),
            inline: RefCell::new([PropertySlot::Data(Value::empty()); INLINE_PROPERTY_SLOTS]),
            overflow: RefCell::new(Vec::new()),
            extensible: RefCell::new(true),
            callable: RefCell::new(None),
        }
    }

    pub fn new_callable(prototype: Option<GcPtr<JsObject>>, callable: Callable) -> Self {
        let obj = Self::new(prototype);
        *obj.callable.borrow_mut() = Some(callable);
        obj
    }

    pub fn is_callable(&self) -> bool {
        self.callable.borrow().is_some()
    }

    pub fn callable(&self) -> Option<Callable> {
        self.callable.borrow().clone()
    }

    pub fn prototype(&self) -> Option<GcPtr<JsObject>> {
        *self.prototype.borrow()
    }

    pub fn set_prototype(&self, proto: Option<GcPtr<JsObject>>) {
        *self.prototype.borrow_mut() = proto;
    }

    pub fn is_extensible(&self) -> bool {
        *self.extensible.borrow()
    }

    pub fn prevent_extensions(&self) {
        *self.extensible.borrow_mut() = false;
    }

    pub fn is_dictionary_mode(&self) -> bool {
        matches!(&*self.state.borrow(), ShapeState::Dictionary(_))
    }

    /// Current shape, if this object hasn't fallen into dictionary mode.
    /// `PropertyCache` stores this shape's id on a cache hit.
    pub fn shape(&self) -> Option<Arc<Shape>> {
        match &*self.state.borrow() {
            ShapeState::Shared(s) => Some(Arc::clone(s)),
            ShapeState::Dictionary(_) => None,
        }
    }

    fn slot_value(&self, slot: u32) -> PropertySlot {
        let slot = slot as usize;
        if slot < INLINE_PROPERTY_SLOTS {
            self.inline.borrow()[slot]
        } else {
            self.overflow.borrow()[slot - INLINE_PROPERTY_SLOTS]
        }
    }

    fn set_slot_value(&self, slot: u32, value: PropertySlot) {
        let slot = slot as usize;
        if slot < INLINE_PROPERTY_SLOTS {
            self.inline.borrow_mut()[slot] = value;
        } else {
            let mut overflow = self.overflow.borrow_mut();
            let idx = slot - INLINE_PROPERTY_SLOTS;
            if idx >= overflow.len() {
                overflow.resize(idx + 1, PropertySlot::Data(Value::empty()));
            }
            overflow[idx] = value;
        }
    }

    /// Read an *own* property's slot directly, given a shape known (e.g.
    /// from an inline-cache hit) to match this object's current shape.
    /// The caller must have already verified `self.shape()` equals the
    /// cached shape.
    pub fn read_slot(&self, slot: u32) -> PropertySlot {
        self.slot_value(slot)
    }

    /// Look up an own property, walking the shape's property map (shared
    /// mode) or the dictionary map (dictionary mode). `None` both for "no
    /// such own property" and "own property is an accessor" — callers
    /// that need to tell those apart (or invoke the accessor) use
    /// `get_own_slot`.
    pub fn get_own(&self, key: &PropertyKey) -> Option<Value> {
        self.get_own_slot(key).and_then(|s| s.as_data())
    }

    /// Look up an own property's raw slot, data or accessor.
    pub fn get_own_slot(&self, key: &PropertyKey) -> Option<PropertySlot> {
        match &*self.state.borrow() {
            ShapeState::Shared(shape) => shape.find(key).map(|d| self.slot_value(d.slot)),
            ShapeState::Dictionary(map) => map.get(key).copied(),
        }
    }

    pub fn get_own_attributes(&self, key: &PropertyKey) -> Option<PropertyAttributes> {
        match &*self.state.borrow() {
            ShapeState::Shared(shape) => shape.find(key).map(|d| d.attributes),
            ShapeState::Dictionary(map) => map.get_attributes(key),
        }
    }

    pub fn has_own(&self, key: &PropertyKey) -> bool {
        match &*self.state.borrow() {
            ShapeState::Shared(shape) => shape.find(key).is_some(),
            ShapeState::Dictionary(map) => map.contains(key),
        }
    }

    /// Define or overwrite an own data property.
    ///
    /// Returns the slot assigned for a *newly added* property in shared
    /// mode, so `PropertyCache::write_hit` can be populated by the
    /// caller; `None` for an overwrite of an existing property or any
    /// dictionary-mode write (dictionary mode has no cacheable slot).
    pub fn set_own(
        &self,
        key: PropertyKey,
        value: Value,
        attributes: PropertyAttributes,
    ) -> Result<Option<(u32, u32)>, SetPropertyError> {
        self.set_own_slot(key, PropertySlot::Data(value), attributes)
    }

    /// Define (or merge into) an own accessor property. `get`/`set` of
    /// `None` leaves that half untouched if one was already installed —
    /// `DefineSetter` on a key that already has a getter must not drop
    /// that getter, and vice versa.
    pub fn define_accessor(&self, key: PropertyKey, get: Option<Value>, set: Option<Value>) -> Result<(), SetPropertyError> {
        let (prior_get, prior_set) = match self.get_own_slot(&key) {
            Some(PropertySlot::Accessor { get, set }) => (get, set),
            _ => (Value::undefined(), Value::undefined()),
        };
        let slot = PropertySlot::Accessor { get: get.unwrap_or(prior_get), set: set.unwrap_or(prior_set) };
        self.set_own_slot(key, slot, PropertyAttributes::accessor()).map(|_| ())
    }

    fn set_own_slot(
        &self,
        key: PropertyKey,
        value: PropertySlot,
        attributes: PropertyAttributes,
    ) -> Result<Option<(u32, u32)>, SetPropertyError> {
        let existing = self.get_own_slot(&key);

        if let Some(existing) = existing {
            let existing_attrs = self.get_own_attributes(&key).expect("get_own_slot hit implies attributes exist");
            match existing {
                PropertySlot::Data(_) => {
                    if !existing_attrs.writable {
                        return Err(SetPropertyError::NotWritable);
                    }
                }
                PropertySlot::Accessor { set, .. } => {
                    if matches!(value, PropertySlot::Data(_)) && set.is_undefined() {
                        return Err(SetPropertyError::AccessorWithoutSetter);
                    }
                }
            }

            let shared_slot = match &*self.state.borrow() {
                ShapeState::Shared(shape) => shape.find(&key).map(|d| d.slot),
                ShapeState::Dictionary(_) => None,
            };
            match &mut *self.state.borrow_mut() {
                ShapeState::Shared(_) => {
                    self.set_slot_value(shared_slot.expect("shared mode has a slot for an own key"), value)
                }
                ShapeState::Dictionary(map) => map.insert(key, value, existing_attrs),
            }
            return Ok(None);
        }

        if !self.is_extensible() {
            return Err(SetPropertyError::NotExtensible);
        }

        let should_convert = match &*self.state.borrow() {
            ShapeState::Shared(shape) => shape.own_property_count() + 1 > dictionary_mode_threshold(),
            ShapeState::Dictionary(_) => false,
        };
        if should_convert {
            self.convert_to_dictionary();
        }

        match &mut *self.state.borrow_mut() {
            ShapeState::Shared(shape) => {
                let (new_shape, slot) = shape.add_property(key, attributes);
                let new_shape_id = new_shape.id();
                *shape = new_shape;
                drop(shape);
                self.set_slot_value(slot, value);
                Ok(Some((new_shape_id, slot)))
            }
            ShapeState::Dictionary(map) => {
                map.insert(key, value, attributes);
                Ok(None)
            }
        }
    }

    /// Delete an own property. Deletion always forces dictionary mode
    /// (if not already there) — shared shapes never support removing a
    /// property from the middle of the chain.
    pub fn delete_own(&self, key: &PropertyKey) -> bool {
        if !self.has_own(key) {
            return false;
        }
        if !self.is_dictionary_mode() {
            self.convert_to_dictionary();
        }
        match &mut *self.state.borrow_mut() {
            ShapeState::Dictionary(map) => map.remove(key),
            ShapeState::Shared(_) => unreachable!("convert_to_dictionary always switches state"),
        }
    }

    fn convert_to_dictionary(&self) {
        let mut map = DictPropertyMap::new();
        if let ShapeState::Shared(shape) = &*self.state.borrow() {
            for k in shape.own_keys() {
                let desc = shape.find(k).expect("own_keys entries are always findable");
                map.insert(k.clone(), self.slot_value(desc.slot), desc.attributes);
            }
        }
        *self.state.borrow_mut() = ShapeState::Dictionary(map);
    }

    pub fn own_keys(&self) -> Vec<PropertyKey> {
        match &*self.state.borrow() {
            ShapeState::Shared(shape) => shape.own_keys().to_vec(),
            ShapeState::Dictionary(map) => map.keys().cloned().collect(),
        }
    }
}

impl Trace for JsObject {
    fn trace(&self, tracer: &mut dyn Tracer) {
        if let Some(proto) = self.prototype() {
            proto.trace(tracer);
        }
        for v in self.inline.borrow().iter() {
            v.trace(tracer);
        }
        for v in self.overflow.borrow().iter() {
            v.trace(tracer);
        }
        if let ShapeState::Dictionary(map) = &*self.state.borrow() {
            for k in map.keys().cloned().collect::<Vec<_>>() {
                if let Some(v) = map.get(&k) {
                    v.trace(tracer);
                }
            }
        }
        if let Some(callable) = &*self.callable.borrow() {
            callable.trace(tracer);
        }
    }
}

pub fn alloc_object(heap: &mut Heap, prototype: Option<GcPtr<JsObject>>) -> GcPtr<JsObject> {
    heap.alloc(JsObject::new(prototype), CellKind::Object)
}

pub fn alloc_callable(heap: &mut Heap, prototype: Option<GcPtr<JsObject>>, callable: Callable) -> GcPtr<JsObject> {
    heap.alloc(JsObject::new_callable(prototype, callable), CellKind::Function)
}

pub fn alloc_array(heap: &mut Heap, prototype: Option<GcPtr<JsObject>>) -> GcPtr<JsObject> {
    heap.alloc(JsObject::new(prototype), CellKind::Array)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> PropertyKey {
        PropertyKey::Symbol(SymbolId(n))
    }

    #[test]
    fn set_then_get_round_trips() {
        let obj = JsObject::new(None);
        obj.set_own(key(1), Value::number(42.0), PropertyAttributes::data()).unwrap();
        assert_eq!(obj.get_own(&key(1)).unwrap().as_number(), Some(42.0));
    }

    #[test]
    fn non_writable_property_rejects_write() {
        let obj = JsObject::new(None);
        obj.set_own(key(1), Value::number(1.0), PropertyAttributes::frozen()).unwrap();
        let err = obj.set_own(key(1), Value::number(2.0), PropertyAttributes::data()).unwrap_err();
        assert_eq!(err, SetPropertyError::NotWritable);
    }

    #[test]
    fn delete_forces_dictionary_mode() {
        let obj = JsObject::new(None);
        obj.set_own(key(1), Value::number(1.0), PropertyAttributes::data()).unwrap();
        assert!(!obj.is_dictionary_mode());
        assert!(obj.delete_own(&key(1)));
        assert!(obj.is_dictionary_mode());
        assert!(obj.get_own(&key(1)).is_none());
    }

    #[test]
    fn wide_object_converts_to_dictionary_mode() {
        let obj = JsObject::new(None);
        for i in 0..200u32 {
            obj.set_own(key(i), Value::number(i as f64), PropertyAttributes::data()).unwrap();
        }
        assert!(obj.is_dictionary_mode());
        assert_eq!(obj.get_own(&key(199)).unwrap().as_number(), Some(199.0));
    }

    #[test]
    fn shared_objects_same_shape_same_slots() {
        let a = JsObject::new(None);
        let b = JsObject::new(None);
        a.set_own(key(1), Value::number(1.0), PropertyAttributes::data()).unwrap();
        a.set_own(key(2), Value::number(2.0), PropertyAttributes::data()).unwrap();
        b.set_own(key(1), Value::number(10.0), PropertyAttributes::data()).unwrap();
        b.set_own(key(2), Value::number(20.0), PropertyAttributes::data()).unwrap();

        assert_eq!(a.shape().unwrap().id(), b.shape().unwrap().id());
    }

    #[test]
    fn define_getter_then_setter_merges_into_one_accessor() {
        let obj = JsObject::new(None);
        let getter = Value::number(1.0);
        let setter = Value::number(2.0);
        obj.define_accessor(key(1), Some(getter), None).unwrap();
        obj.define_accessor(key(1), None, Some(setter)).unwrap();

        let (g, s) = obj.get_own_slot(&key(1)).unwrap().as_accessor().unwrap();
        assert_eq!(g.as_number(), Some(1.0));
        assert_eq!(s.as_number(), Some(2.0));
        assert!(obj.get_own(&key(1)).is_none());
    }

    #[test]
    fn data_write_over_setterless_accessor_errors() {
        let obj = JsObject::new(None);
        obj.define_accessor(key(1), Some(Value::number(1.0)), None).unwrap();
        let err = obj.set_own(key(1), Value::number(2.0), PropertyAttributes::data()).unwrap_err();
        assert_eq!(err, SetPropertyError::AccessorWithoutSetter);
    }
}
