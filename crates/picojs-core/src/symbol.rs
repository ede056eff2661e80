//! Interned identifiers with stable integer ids.

use std::fmt;

/// A stable integer handle for an interned identifier or property-key
/// string. Cheap to copy, cheap to hash, cheap to compare — this is what
/// shape transition tables and `DictPropertyMap` entries key on instead
/// of comparing string contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
