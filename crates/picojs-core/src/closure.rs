//! Captured-variable cells and the closures built from them.
//!
//! An upvalue is heap-allocated (not a plain `Rc<Cell<Value>>`) so the
//! collector can trace through it the same way it traces any other cell —
//! a captured value can itself be a heap pointer, and nothing outside the
//! GC's root scan would otherwise know to keep it alive.

use std::cell::Cell;
use std::sync::Arc;

use picojs_bytecode::operand::FunctionIndex;
use picojs_bytecode::Module;
use picojs_gc::{CellKind, GcPtr, Heap, Trace, Tracer};

use crate::value::Value;

pub struct Upvalue {
    value: Cell<Value>,
}

impl Upvalue {
    pub fn new(value: Value) -> Self {
        Self { value: Cell::new(value) }
    }

    pub fn get(&self) -> Value {
        self.value.get()
    }

    pub fn set(&self, value: Value) {
        self.value.set(value);
    }
}

impl Trace for Upvalue {
    fn trace(&self, tracer: &mut dyn Tracer) {
        self.value.get().trace(tracer);
    }
}

pub fn alloc_upvalue(heap: &mut Heap, value: Value) -> GcPtr<Upvalue> {
    heap.alloc(Upvalue::new(value), CellKind::Generic)
}

/// A bytecode function plus the upvalue cells it closed over at creation.
pub struct Closure {
    pub module: Arc<Module>,
    pub function_index: FunctionIndex,
    pub upvalues: Vec<GcPtr<Upvalue>>,
}

impl Trace for Closure {
    fn trace(&self, tracer: &mut dyn Tracer) {
        for u in &self.upvalues {
            u.trace(tracer);
        }
    }
}

pub fn alloc_closure(
    heap: &mut Heap,
    module: Arc<Module>,
    function_index: FunctionIndex,
    upvalues: Vec<GcPtr<Upvalue>>,
) -> GcPtr<Closure> {
    heap.alloc(Closure { module, function_index, upvalues }, CellKind::Function)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upvalue_round_trips_through_cell() {
        let mut heap = Heap::new();
        let up = alloc_upvalue(&mut heap, Value::number(1.0));
        assert_eq!(up.get().get().as_number(), Some(1.0));
        up.get().set(Value::number(2.0));
        assert_eq!(up.get().get().as_number(), Some(2.0));
    }
}
