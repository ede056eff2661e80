//! Bytecode operand newtypes.
//!
//! Every operand kind gets its own type so a decode mismatch (a register
//! index read where a constant index was expected) is a compile error in
//! the interpreter rather than a silent bug.

use serde::{Deserialize, Serialize};

/// A register in the current frame's window.
///
/// Register `0` is the first local. Negative offsets (`this`, arguments)
/// are addressed separately by the interpreter; see `picojs_core::frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Register(pub u8);

impl Register {
    #[inline]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> u8 {
        self.0
    }
}

impl From<u8> for Register {
    fn from(index: u8) -> Self {
        Self(index)
    }
}

/// Index into a function's constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ConstantIndex(pub u32);

impl ConstantIndex {
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Index into a function's local variable slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LocalIndex(pub u16);

impl LocalIndex {
    #[inline]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> u16 {
        self.0
    }
}

/// Index into the module's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FunctionIndex(pub u32);

impl FunctionIndex {
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// A signed branch offset, in instructions, relative to the branch opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct JumpOffset(pub i32);

impl JumpOffset {
    #[inline]
    pub const fn new(offset: i32) -> Self {
        Self(offset)
    }

    #[inline]
    pub const fn offset(self) -> i32 {
        self.0
    }
}

/// Index into a function's per-site inline-cache array (0 disables caching).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CacheIndex(pub u16);

impl CacheIndex {
    pub const DISABLED: CacheIndex = CacheIndex(0);

    #[inline]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn is_disabled(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn index(self) -> u16 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_roundtrip() {
        assert_eq!(Register::new(5).index(), 5);
        assert_eq!(Register::from(7u8), Register(7));
    }

    #[test]
    fn cache_index_disabled_is_zero() {
        assert!(CacheIndex::DISABLED.is_disabled());
        assert!(!CacheIndex::new(1).is_disabled());
    }
}
