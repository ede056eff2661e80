//! The runtime: the heap, interned strings, global object, and loaded
//! modules one `Interpreter` executes bytecode against.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use picojs_bytecode::Module;
use picojs_gc::{Collector, GcHeader, GcPtr, Heap};

use crate::frame::RegisterStack;
use crate::handle::{GCScope, HandleStack};
use crate::object::{alloc_object, JsObject};
use crate::shape::set_dictionary_mode_threshold;
use crate::string::StringTable;
use crate::value::Value;

/// Tunables fixed at runtime construction.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Register-stack capacity; exceeding it raises a stack-overflow
    /// `RangeError` rather than growing unbounded.
    pub max_register_stack: usize,
    /// Bytes allocated before `collect_if_needed` runs a cycle.
    pub gc_threshold_bytes: usize,
    /// Default strictness for top-level code that doesn't opt in itself.
    pub strict_mode: bool,
    /// Own-property count past which an object's shape converts to
    /// dictionary mode. Lowering it trades inline-cache hit rate for a
    /// smaller worst-case shape-transition tree; production JS engines
    /// land around this same order of magnitude.
    pub dictionary_mode_threshold: usize,
    /// After a collection, the next threshold is set to
    /// `bytes_live * gc_growth_ratio`, so the heap grows with its live
    /// set instead of collecting every allocation once a long-lived
    /// program outgrows the initial threshold.
    pub gc_growth_ratio: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_register_stack: 64 * 1024,
            gc_threshold_bytes: 8 * 1024 * 1024,
            strict_mode: false,
            dictionary_mode_threshold: 128,
            gc_growth_ratio: 2.0,
        }
    }
}

/// One JS execution environment.
///
/// Single-threaded by design: the register stack, handle stack, and heap
/// are only ever touched from the thread that owns this `Runtime` (no
/// `Send`/`Sync` impl is provided, unlike a host embedding layer that
/// might serialize access with its own lock around a whole `Runtime`).
pub struct Runtime {
    config: RuntimeConfig,
    heap: Heap,
    collector: Collector,
    strings: StringTable,
    /// Boxed so its address is stable across `Runtime` moves — `GCScope`
    /// and `Handle` hold a raw pointer to it rather than borrowing
    /// `Runtime` itself.
    handles: Box<HandleStack>,
    global: GcPtr<JsObject>,
    modules: FxHashMap<String, Arc<Module>>,
    registers: RegisterStack,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        set_dictionary_mode_threshold(config.dictionary_mode_threshold);
        let mut heap = Heap::with_threshold(config.gc_threshold_bytes);
        let global = alloc_object(&mut heap, None);
        let registers = RegisterStack::new(config.max_register_stack);
        Self {
            heap,
            collector: Collector::new(),
            strings: StringTable::new(),
            handles: Box::new(HandleStack::new()),
            global,
            modules: FxHashMap::default(),
            registers,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn global(&self) -> GcPtr<JsObject> {
        self.global
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub fn strings_mut(&mut self) -> &mut StringTable {
        &mut self.strings
    }

    pub fn handles(&self) -> &HandleStack {
        &self.handles
    }

    pub fn gc_scope(&self) -> GCScope {
        GCScope::new(&self.handles)
    }

    pub fn registers(&self) -> &RegisterStack {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterStack {
        &mut self.registers
    }

    pub fn load_module(&mut self, name: impl Into<String>, module: Module) -> Arc<Module> {
        let module = Arc::new(module);
        self.modules.insert(name.into(), Arc::clone(&module));
        module
    }

    pub fn get_module(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.get(name).cloned()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn collect_if_needed(&mut self, extra_roots: &[Value]) {
        if self.heap.should_collect() {
            self.collect(extra_roots);
        }
    }

    /// Run one mark-sweep cycle. `extra_roots` covers values the caller
    /// holds outside the handle/register stacks (e.g. an in-flight thrown
    /// value an `Interpreter` is unwinding with).
    pub fn collect(&mut self, extra_roots: &[Value]) {
        let _span = tracing::debug_span!("runtime.collect", depth = self.registers.depth()).entered();
        let mut roots: Vec<*const GcHeader> = vec![self.global.header()];
        roots.extend(self.handles.roots().iter().filter_map(Value::gc_header));
        roots.extend(self.registers.roots().iter().filter_map(Value::gc_header));
        roots.extend(
            self.registers
                .frames()
                .iter()
                .filter_map(|f| f.this_value.gc_header()),
        );
        roots.extend(
            self.registers
                .frames()
                .iter()
                .filter_map(|f| f.closure.map(|c| c.header())),
        );
        roots.extend(extra_roots.iter().filter_map(Value::gc_header));
        self.collector.collect(&mut self.heap, &roots);
        self.heap.grow_threshold(self.config.gc_growth_ratio);
    }

    pub fn gc_stats(&self) -> picojs_gc::GcStats {
        self.collector.stats()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use picojs_bytecode::ModuleBuilder;

    #[test]
    fn new_runtime_has_empty_global() {
        let rt = Runtime::new();
        assert_eq!(rt.global().get().own_keys().len(), 0);
        assert_eq!(rt.module_count(), 0);
    }

    #[test]
    fn load_then_get_module_round_trips() {
        let mut rt = Runtime::new();
        rt.load_module("main", ModuleBuilder::default().build());
        assert!(rt.get_module("main").is_some());
        assert!(rt.get_module("other").is_none());
    }

    #[test]
    fn unrooted_allocation_is_collected() {
        let mut rt = Runtime::new();
        {
            let scope = rt.gc_scope();
            let _obj = alloc_object(rt.heap_mut(), None);
            drop(scope);
        }
        let before = rt.heap().cell_count();
        rt.collect(&[]);
        assert!(rt.heap().cell_count() < before);
    }

    #[test]
    fn rooted_allocation_survives_collection() {
        let mut rt = Runtime::new();
        let scope = rt.gc_scope();
        let obj = alloc_object(rt.heap_mut(), None);
        let handle = scope.root(obj);
        rt.collect(&[]);
        assert!(handle.get().ptr_eq(&obj));
    }

    #[test]
    fn dictionary_mode_threshold_config_converts_shape_early() {
        use crate::object::{PropertyAttributes, PropertyKey};

        let mut rt = Runtime::with_config(RuntimeConfig {
            dictionary_mode_threshold: 2,
            ..RuntimeConfig::default()
        });
        let obj = alloc_object(rt.heap_mut(), None);
        for i in 0..4u32 {
            let key = PropertyKey::Symbol(rt.strings_mut().intern(&format!("p{i}")));
            obj.get().set_own(key, Value::number(i as f64), PropertyAttributes::data()).unwrap();
        }
        assert!(obj.get().is_dictionary_mode());

        // Restore the default so later tests in this process see the
        // usual threshold; the global is process-wide by design (see
        // DESIGN.md), not per-`Runtime`.
        crate::shape::set_dictionary_mode_threshold(RuntimeConfig::default().dictionary_mode_threshold);
    }
}
