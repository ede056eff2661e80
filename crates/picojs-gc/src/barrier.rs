//! Write barrier hook.
//!
//! A single-generation, stop-the-world collector needs no write barrier —
//! every store is already visible at the next collection. The hook is
//! kept as a real call site (not deleted) so the mutator's store path
//! (`JSObject` field writes in `picojs-core`) does not need to change if
//! this crate is later swapped for a generational collector, which *would*
//! need to know about old-to-young pointer stores.

use crate::object::GcHeader;

/// Called by the mutator on every pointer store into a heap cell
/// (`x.field = y` where both are heap references).
#[inline]
pub fn write_barrier(_host: *const GcHeader, _stored: *const GcHeader) {
    // No-op: see module docs.
}
