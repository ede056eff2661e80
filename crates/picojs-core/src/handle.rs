//! Handles and scoped rooting.
//!
//! A [`Handle<T>`] is a typed pointer-to-pointer into a root stack: the
//! only safe way to hold a heap reference across an operation that may
//! allocate (and therefore may collect). A [`GCScope`] is a window on
//! that stack — handles rooted inside it are dropped from the root set
//! when the scope ends, and a [`GCScopeMarker`] lets interpreter loops
//! roll the stack back to a known point without waiting on `Drop`.

use std::cell::RefCell;
use std::marker::PhantomData;

use picojs_gc::GcPtr;

use crate::object::JsObject;
use crate::string::JsString;
use crate::value::Value;

/// A type whose values can be stored on the handle stack as a [`Value`]
/// and recovered from one.
pub trait Rooted: Copy {
    fn into_value(self) -> Value;
    fn from_value(value: Value) -> Self;
}

impl Rooted for Value {
    fn into_value(self) -> Value {
        self
    }
    fn from_value(value: Value) -> Self {
        value
    }
}

impl Rooted for GcPtr<JsObject> {
    fn into_value(self) -> Value {
        Value::Object(self)
    }
    fn from_value(value: Value) -> Self {
        value.as_object().expect("handle slot held a non-object value")
    }
}

impl Rooted for GcPtr<JsString> {
    fn into_value(self) -> Value {
        Value::String(self)
    }
    fn from_value(value: Value) -> Self {
        value.as_string().expect("handle slot held a non-string value")
    }
}

/// The thread's root stack: every live [`Handle`] indexes into this.
///
/// One `HandleStack` is owned by the `Runtime`/`Interpreter` that created
/// it; handles it hands out carry a raw pointer back to it rather than a
/// borrow, which is what makes `Handle<T>` neither `Send` nor `Sync`.
/// Indexing into the stack rather than pointing at an element directly
/// means handles stay valid across the backing `Vec` reallocating.
#[derive(Default)]
pub struct HandleStack {
    slots: RefCell<Vec<Value>>,
}

impl HandleStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    fn push(&self, value: Value) -> u32 {
        let mut slots = self.slots.borrow_mut();
        let index = slots.len() as u32;
        slots.push(value);
        index
    }

    fn get(&self, index: u32) -> Value {
        self.slots.borrow()[index as usize]
    }

    fn set(&self, index: u32, value: Value) {
        self.slots.borrow_mut()[index as usize] = value;
    }

    fn truncate(&self, len: usize) {
        self.slots.borrow_mut().truncate(len);
    }

    /// All currently rooted values, for the collector's root scan.
    pub fn roots(&self) -> Vec<Value> {
        self.slots.borrow().clone()
    }
}

/// A typed handle into a [`HandleStack`] slot.
///
/// `Handle` is deliberately `!Send + !Sync`: the raw pointer back to the
/// owning stack is only ever valid on the thread that pushed it, and
/// carrying a raw pointer field (rather than asserting the bound
/// unsafely) gets that for free from the auto-trait rules.
pub struct Handle<T: Rooted> {
    stack: *const HandleStack,
    index: u32,
    _marker: PhantomData<T>,
}

impl<T: Rooted> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Rooted> Copy for Handle<T> {}

impl<T: Rooted> Handle<T> {
    pub fn get(&self) -> T {
        // SAFETY: a `Handle` only outlives its `GCScope` if the caller
        // bypassed `flush_to_marker`/scope-drop, which this module's API
        // does not expose a way to do.
        T::from_value(unsafe { (*self.stack).get(self.index) })
    }

    pub fn set(&self, value: T) {
        unsafe { (*self.stack).set(self.index, value.into_value()) }
    }
}

/// A saved root-stack depth, for rolling back without waiting on `Drop`.
#[derive(Clone, Copy)]
pub struct GCScopeMarker(usize);

/// A scoped window on a [`HandleStack`]. Handles rooted through this
/// scope are removed from the root set when the scope is dropped, or
/// earlier via [`GCScope::flush_to_marker`].
///
/// Carries a raw pointer rather than a borrow, the same trade [`Handle`]
/// makes: a `GCScope` that borrowed its owning runtime would make it
/// impossible to hold a scope open across a call that also needs to
/// mutate the heap (allocation) on the same runtime.
pub struct GCScope {
    stack: *const HandleStack,
    base: usize,
}

impl GCScope {
    pub fn new(stack: &HandleStack) -> Self {
        Self { stack: stack as *const HandleStack, base: stack.len() }
    }

    fn stack(&self) -> &HandleStack {
        // SAFETY: a `GCScope` only outlives the `HandleStack` it was built
        // from if the caller drops the stack while scopes over it are
        // still live, which this module's API gives no way to do.
        unsafe { &*self.stack }
    }

    pub fn root<T: Rooted>(&self, value: T) -> Handle<T> {
        let index = self.stack().push(value.into_value());
        Handle { stack: self.stack, index, _marker: PhantomData }
    }

    pub fn marker(&self) -> GCScopeMarker {
        GCScopeMarker(self.stack().len())
    }

    /// Drop every handle rooted through this scope since `marker`,
    /// without waiting for `GCScope` itself to go out of scope. Used in
    /// interpreter loops to bound root-set growth across iterations.
    pub fn flush_to_marker(&self, marker: GCScopeMarker) {
        self.stack().truncate(marker.0);
    }
}

impl Drop for GCScope {
    fn drop(&mut self) {
        self.stack().truncate(self.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trips_value() {
        let stack = HandleStack::new();
        let scope = GCScope::new(&stack);
        let h = scope.root(Value::number(7.0));
        assert_eq!(h.get().as_number(), Some(7.0));
    }

    #[test]
    fn scope_drop_truncates_stack() {
        let stack = HandleStack::new();
        {
            let scope = GCScope::new(&stack);
            scope.root(Value::number(1.0));
            scope.root(Value::number(2.0));
            assert_eq!(stack.len(), 2);
        }
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn flush_to_marker_rolls_back_without_dropping_scope() {
        let stack = HandleStack::new();
        let scope = GCScope::new(&stack);
        scope.root(Value::number(1.0));
        let marker = scope.marker();
        scope.root(Value::number(2.0));
        scope.root(Value::number(3.0));
        assert_eq!(stack.len(), 3);
        scope.flush_to_marker(marker);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn nested_scopes_restore_outer_base() {
        let stack = HandleStack::new();
        let outer = GCScope::new(&stack);
        outer.root(Value::number(1.0));
        {
            let inner = GCScope::new(&stack);
            inner.root(Value::number(2.0));
            inner.root(Value::number(3.0));
            assert_eq!(stack.len(), 3);
        }
        assert_eq!(stack.len(), 1);
    }
}
