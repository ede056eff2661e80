//! The fixed header every GC cell begins with.

use std::sync::atomic::{AtomicBool, Ordering};

/// What kind of thing a cell holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Object,
    Dictionary,
    String,
    Array,
    Function,
    TypedArray,
    HiddenClass,
    Generic,
}

/// Type-erased trace/drop entry points for a cell.
///
/// A hand-rolled vtable: the heap stores cells behind `*mut GcHeader` and
/// needs to trace/drop them without knowing their concrete type. Storing
/// two function pointers alongside the header is the standard technique
/// (the alternative, `Box<dyn Trace>` fat pointers, would double the
/// per-cell pointer overhead the header is trying to avoid).
pub(crate) struct CellVTable {
    pub(crate) trace: unsafe fn(*const GcHeader, &mut dyn crate::trace::Tracer),
    pub(crate) drop_in_place: unsafe fn(*mut GcHeader),
}

/// Fixed header present at the start of every GC-managed cell.
///
/// Cells are 8-byte aligned; `GcHeader` itself is sized and aligned so
/// that property holds for any `#[repr(C)]` cell that embeds it as its
/// first field.
#[repr(C, align(8))]
pub struct GcHeader {
    pub(crate) kind: CellKind,
    pub(crate) size: u32,
    pub(crate) mark: AtomicBool,
    pub(crate) vtable: &'static CellVTable,
}

impl GcHeader {
    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Relaxed)
    }

    pub(crate) fn set_marked(&self, marked: bool) {
        self.mark.store(marked, Ordering::Relaxed);
    }

    /// Try-and-set: returns `true` if this call transitioned the header
    /// from unmarked to marked (i.e. the caller should push it onto the
    /// mark worklist).
    pub(crate) fn mark_if_unmarked(&self) -> bool {
        !self.mark.swap(true, Ordering::Relaxed)
    }
}
