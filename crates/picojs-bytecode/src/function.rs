//! A function's bytecode: the compiled form the interpreter executes.

use std::cell::Cell;

use serde::{Deserialize, Serialize};

use crate::constant::Constant;
use crate::instruction::Instruction;

/// Per-call-site inline cache state, read and rewritten by the interpreter.
///
/// Each entry is monomorphic — it never stores more than one shape —
/// except `Megamorphic`, which a call site falls into once it has bounced
/// between enough distinct shapes that rewriting the cache each time
/// would cost more than a generic lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheSlot {
    #[default]
    Empty,
    Monomorphic {
        shape_id: u32,
        slot: u32,
    },
    Megamorphic,
}

/// Where a closure's upvalue slot gets its value from when `MakeClosure`
/// runs: a local of the enclosing frame, or an upvalue the enclosing
/// closure already captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpvalueCapture {
    ParentLocal(u16),
    ParentUpvalue(u16),
}

/// One entry in a function's catch table: `[start_offset, end_offset)` in
/// instruction indices maps to a `Catch` opcode at `handler_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchEntry {
    pub start_offset: u32,
    pub end_offset: u32,
    pub handler_offset: u32,
}

/// Function flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFlags {
    pub is_strict: bool,
    pub is_arrow: bool,
    pub is_constructor: bool,
    pub uses_arguments: bool,
}

/// A bytecode function: name, registers, instructions and the tables the
/// interpreter consults while running them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: Option<String>,
    pub param_count: u8,
    /// Registers needed for this frame (locals + temporaries).
    pub frame_size: u16,
    pub flags: FunctionFlags,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    /// Per-function string-id -> runtime symbol-id mapping, resolved once
    /// at module-load time.
    pub symbol_table: Vec<u32>,
    pub catch_table: Vec<CatchEntry>,
    /// In declaration order, where each of this function's upvalue slots
    /// is captured from when a `MakeClosure` for it runs.
    pub upvalue_captures: Vec<UpvalueCapture>,
    /// Per-call-site `GetById`/`TryGetById` read caches. `Cell`-wrapped so
    /// the interpreter can rewrite a cache entry through a shared
    /// `&Function` — functions are reached through `Arc<Module>`, not
    /// `&mut`, once loaded.
    #[serde(skip, default = "Vec::new")]
    pub read_cache: Vec<Cell<CacheSlot>>,
    /// Per-call-site `PutById` write caches.
    #[serde(skip, default = "Vec::new")]
    pub write_cache: Vec<Cell<CacheSlot>>,
    /// Instruction index -> source byte offset, for error stacks.
    pub debug_offsets: Vec<u32>,
}

impl Function {
    pub fn builder() -> FunctionBuilder {
        FunctionBuilder::default()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    /// Innermost catch handler whose range contains `offset`, or `None`.
    ///
    /// Ranges are checked in declaration order, which is innermost-first
    /// because the compiler emits nested try blocks' entries before their
    /// enclosing block's.
    pub fn find_catch_target(&self, offset: u32) -> Option<u32> {
        self.catch_table
            .iter()
            .find(|e| offset >= e.start_offset && offset < e.end_offset)
            .map(|e| e.handler_offset)
    }

    pub fn read_cache(&self, index: crate::operand::CacheIndex) -> CacheSlot {
        self.read_cache[index.index() as usize].get()
    }

    pub fn set_read_cache(&self, index: crate::operand::CacheIndex, slot: CacheSlot) {
        self.read_cache[index.index() as usize].set(slot);
    }

    pub fn write_cache(&self, index: crate::operand::CacheIndex) -> CacheSlot {
        self.write_cache[index.index() as usize].get()
    }

    pub fn set_write_cache(&self, index: crate::operand::CacheIndex, slot: CacheSlot) {
        self.write_cache[index.index() as usize].set(slot);
    }
}

/// Fluent builder for [`Function`].
#[derive(Debug, Default)]
pub struct FunctionBuilder {
    name: Option<String>,
    param_count: u8,
    frame_size: u16,
    flags: FunctionFlags,
    instructions: Vec<Instruction>,
    constants: Vec<Constant>,
    symbol_table: Vec<u32>,
    catch_table: Vec<CatchEntry>,
    upvalue_captures: Vec<UpvalueCapture>,
    read_cache_len: usize,
    write_cache_len: usize,
    debug_offsets: Vec<u32>,
}

impl FunctionBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn param_count(mut self, count: u8) -> Self {
        self.param_count = count;
        self
    }

    pub fn frame_size(mut self, size: u16) -> Self {
        self.frame_size = size;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.flags.is_strict = strict;
        self
    }

    pub fn instruction(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn instructions(mut self, instructions: Vec<Instruction>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn constant(&mut self, constant: Constant) -> usize {
        self.constants.push(constant);
        self.constants.len() - 1
    }

    pub fn catch_entry(mut self, entry: CatchEntry) -> Self {
        self.catch_table.push(entry);
        self
    }

    pub fn upvalue_capture(mut self, capture: UpvalueCapture) -> Self {
        self.upvalue_captures.push(capture);
        self
    }

    /// Reserve `n` empty read/write cache slots (index 0 stays disabled).
    pub fn reserve_caches(mut self, n: usize) -> Self {
        self.read_cache_len = n + 1;
        self.write_cache_len = n + 1;
        self
    }

    pub fn build(self) -> Function {
        Function {
            name: self.name,
            param_count: self.param_count,
            frame_size: self.frame_size,
            flags: self.flags,
            instructions: self.instructions,
            constants: self.constants,
            symbol_table: self.symbol_table,
            catch_table: self.catch_table,
            upvalue_captures: self.upvalue_captures,
            read_cache: vec![Cell::new(CacheSlot::Empty); self.read_cache_len],
            write_cache: vec![Cell::new(CacheSlot::Empty); self.write_cache_len],
            debug_offsets: self.debug_offsets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::Register;

    #[test]
    fn find_catch_target_innermost_wins() {
        let f = Function::builder()
            .name("f")
            .instruction(Instruction::Ret { src: Register(0) })
            .catch_entry(CatchEntry { start_offset: 0, end_offset: 10, handler_offset: 20 })
            .catch_entry(CatchEntry { start_offset: 2, end_offset: 4, handler_offset: 30 })
            .build();

        assert_eq!(f.find_catch_target(3), Some(30));
        assert_eq!(f.find_catch_target(5), Some(20));
        assert_eq!(f.find_catch_target(11), None);
    }

    #[test]
    fn display_name_falls_back() {
        let f = Function::builder().build();
        assert_eq!(f.display_name(), "<anonymous>");
    }

    #[test]
    fn cache_slots_are_mutable_through_shared_reference() {
        use crate::operand::CacheIndex;

        let f = Function::builder().reserve_caches(1).build();
        assert_eq!(f.read_cache(CacheIndex::new(1)), CacheSlot::Empty);
        f.set_read_cache(CacheIndex::new(1), CacheSlot::Monomorphic { shape_id: 7, slot: 2 });
        assert_eq!(f.read_cache(CacheIndex::new(1)), CacheSlot::Monomorphic { shape_id: 7, slot: 2 });
    }
}
