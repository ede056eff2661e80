//! Heap-allocated JS string values and the runtime-scoped identifier
//! interner.

use rustc_hash::FxHashMap;

use picojs_gc::{CellKind, Heap, Trace, Tracer};

use crate::symbol::SymbolId;

/// A GC-managed JS string value. Distinct from [`SymbolId`]: this is a
/// user-visible string value, not an interned identifier used as a
/// property key — though a property key's text is, in turn, interned
/// into a `SymbolId` with a `JsString` backing the bytes.
pub struct JsString {
    bytes: String,
}

impl JsString {
    pub fn new(s: impl Into<String>) -> Self {
        Self { bytes: s.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.bytes
    }

    pub fn len_utf16(&self) -> usize {
        self.bytes.encode_utf16().count()
    }
}

impl Trace for JsString {
    fn trace(&self, _tracer: &mut dyn Tracer) {}
}

/// Interns identifier/property-key text into stable [`SymbolId`]s with a
/// cached hash, so repeated shape-transition lookups and
/// `DictPropertyMap` probes never re-hash the same bytes.
///
/// One `StringTable` per `Runtime`.
#[derive(Default)]
pub struct StringTable {
    by_text: FxHashMap<Box<str>, SymbolId>,
    entries: Vec<InternedEntry>,
}

struct InternedEntry {
    text: Box<str>,
    hash: u64,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `text`, returning its stable id. Interning the same text
    /// twice always returns the same id.
    pub fn intern(&mut self, text: &str) -> SymbolId {
        if let Some(&id) = self.by_text.get(text) {
            return id;
        }
        let hash = fxhash_of(text);
        let id = SymbolId(self.entries.len() as u32);
        self.entries.push(InternedEntry { text: text.into(), hash });
        self.by_text.insert(text.into(), id);
        id
    }

    pub fn resolve(&self, id: SymbolId) -> &str {
        &self.entries[id.0 as usize].text
    }

    pub fn cached_hash(&self, id: SymbolId) -> u64 {
        self.entries[id.0 as usize].hash
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn fxhash_of(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Allocate a new JS string value on `heap` and return an unrooted
/// pointer. Callers on the interpreter's allocating paths must root the
/// result before anything else that can allocate runs.
pub fn alloc_string(heap: &mut Heap, s: impl Into<String>) -> picojs_gc::GcPtr<JsString> {
    heap.alloc(JsString::new(s), CellKind::String)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_text_returns_same_id() {
        let mut table = StringTable::new();
        let a = table.intern("length");
        let b = table.intern("length");
        assert_eq!(a, b);
        assert_eq!(table.resolve(a), "length");
    }

    #[test]
    fn distinct_text_gets_distinct_ids() {
        let mut table = StringTable::new();
        let a = table.intern("x");
        let b = table.intern("y");
        assert_ne!(a, b);
    }

    #[test]
    fn cached_hash_is_stable() {
        let mut table = StringTable::new();
        let id = table.intern("foo");
        assert_eq!(table.cached_hash(id), table.cached_hash(id));
    }
}
