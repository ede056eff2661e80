//! GC collaborator contract for the picojs VM core.
//!
//! This crate provides the *mutator-facing* half of garbage collection:
//! cell headers, a trace/tracer interface, a write-barrier hook, and a
//! minimal mark-sweep heap that exercises the contract end to end. GC
//! *policy* — generational promotion, concurrent marking, compaction — is
//! explicitly out of scope; `picojs-core` depends only on the traits and
//! the `Heap`/`Collector` pair here, so a production embedder can swap in
//! a different collector behind the same `Trace`/`Tracer` contract.

pub mod barrier;
pub mod collector;
pub mod finalization;
pub mod heap;
pub mod object;
pub mod trace;

pub use barrier::write_barrier;
pub use collector::{Collector, GcStats};
pub use finalization::{Finalize, FinalizationQueue};
pub use heap::{GcPtr, Heap};
pub use object::{CellKind, GcHeader};
pub use trace::{Trace, Tracer};
