//! Core object model, runtime, and bytecode interpreter for the picojs VM.
//!
//! `picojs-bytecode` defines what a program looks like; this crate
//! defines what running one means — values, hidden classes, the heap's
//! root set, and the dispatch loop itself.

pub mod closure;
pub mod dict_map;
pub mod error;
pub mod frame;
pub mod handle;
pub mod interpreter;
pub mod object;
pub mod runtime;
pub mod shape;
pub mod string;
pub mod symbol;
pub mod value;

pub use closure::{alloc_closure, alloc_upvalue, Closure, Upvalue};
pub use error::{StackFrame, ThrownValue, VmError, VmResult};
pub use frame::{CallFrame, RegisterStack, StackOverflow};
pub use handle::{GCScope, GCScopeMarker, Handle, HandleStack, Rooted};
pub use interpreter::Interpreter;
pub use object::{alloc_array, alloc_callable, alloc_object, Callable, JsObject, NativeFn, PropertyAttributes, PropertyKey, SetPropertyError};
pub use runtime::{Runtime, RuntimeConfig};
pub use shape::Shape;
pub use string::{alloc_string, JsString, StringTable};
pub use symbol::SymbolId;
pub use value::Value;
