//! The mutator side of the GC collaborator contract.

use crate::object::GcHeader;

/// Implemented by anything a GC cell can hold. `trace` must call
/// `tracer.mark_header` for every other cell this value references —
/// missing one is a use-after-free, not a leak, so implementations should
/// prefer deriving this over hand-writing it where possible.
pub trait Trace {
    fn trace(&self, tracer: &mut dyn Tracer);
}

/// Passed to `Trace::trace` during the mark phase. A `Tracer` only ever
/// grows the worklist; it never frees anything (that's the sweep phase).
pub trait Tracer {
    /// Mark a cell reachable, given its header pointer. Returns `true` if
    /// this is the first time the cell was marked this cycle (matches
    /// `GcHeader::mark_if_unmarked`, exposed so a `Trace` impl with
    /// cheap-to-recompute structure can skip re-deriving children).
    fn mark_header(&mut self, header: *const GcHeader) -> bool;
}

macro_rules! impl_trace_noop {
    ($($t:ty),* $(,)?) => {
        $(impl Trace for $t {
            fn trace(&self, _tracer: &mut dyn Tracer) {}
        })*
    };
}

impl_trace_noop!(bool, f64, i32, u32, u64, String);

impl<T: Trace> Trace for Option<T> {
    fn trace(&self, tracer: &mut dyn Tracer) {
        if let Some(v) = self {
            v.trace(tracer);
        }
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, tracer: &mut dyn Tracer) {
        for v in self {
            v.trace(tracer);
        }
    }
}
