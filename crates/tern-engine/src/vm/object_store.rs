//! Object store: the VM's well-known roots
//!
//! A small set of roots the collector and the reload engine both walk: the
//! root library, the global library list, the canonical type-argument table,
//! the megamorphic cache table, and the compile-time constants cache.

use crate::vm::heap::{Heap, ObjRef};
use crate::vm::value::Value;
use rustc_hash::FxHashMap;

/// Canonical type-argument table
///
/// A hashed set of type-argument vectors. Hashes are computed from class ids,
/// so the table must be rehashed whenever ids are reassigned.
#[derive(Debug)]
pub struct CanonicalTypeArguments {
    /// Power-of-two bucket array, open addressed
    buckets: Vec<Option<ObjRef>>,
    used: usize,
}

impl Default for CanonicalTypeArguments {
    fn default() -> Self {
        Self::with_capacity(8)
    }
}

impl CanonicalTypeArguments {
    /// Create a table with the given power-of-two capacity
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        Self {
            buckets: vec![None; capacity],
            used: 0,
        }
    }

    /// Number of vectors in the table
    pub fn len(&self) -> usize {
        self.used
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Insert a type-argument vector, growing when half full
    pub fn insert(&mut self, heap: &Heap, args: ObjRef) {
        if (self.used + 1) * 2 > self.buckets.len() {
            self.grow(heap);
        }
        let mask = self.buckets.len() - 1;
        let mut index = (heap.type_arguments(args).hash() as usize) & mask;
        while let Some(existing) = self.buckets[index] {
            if heap.type_arguments(existing) == heap.type_arguments(args) {
                return;
            }
            index = (index + 1) & mask;
        }
        self.buckets[index] = Some(args);
        self.used += 1;
    }

    /// Look up a vector with the given class ids
    pub fn lookup(&self, heap: &Heap, cids: &[usize]) -> Option<ObjRef> {
        let probe = crate::vm::object::TypeArguments {
            cids: cids.to_vec(),
        };
        let mask = self.buckets.len() - 1;
        let mut index = (probe.hash() as usize) & mask;
        loop {
            let existing = self.buckets[index]?;
            if heap.type_arguments(existing).cids == cids {
                return Some(existing);
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self, heap: &Heap) {
        let entries: Vec<ObjRef> = self.buckets.iter().copied().flatten().collect();
        self.buckets = vec![None; self.buckets.len() * 2];
        self.used = 0;
        for entry in entries {
            self.insert(heap, entry);
        }
    }

    /// Rebuild bucket placement from freshly computed hashes
    ///
    /// Class ids may have been reassigned since the vectors were inserted, so
    /// every hash is recomputed. Replaced classes can collapse two previously
    /// distinct vectors into equal ones; duplicates are dropped.
    pub fn rehash(&mut self, heap: &Heap) {
        let entries: Vec<ObjRef> = self.buckets.iter().copied().flatten().collect();
        for bucket in &mut self.buckets {
            *bucket = None;
        }
        self.used = 0;
        for entry in entries {
            self.insert(heap, entry);
        }
    }

    /// Visit every stored vector reference
    pub fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        for slot in self.buckets.iter_mut().flatten() {
            visitor(slot);
        }
    }
}

/// The VM's well-known roots
#[derive(Debug, Default)]
pub struct ObjectStore {
    /// The program's root library
    pub root_library: Option<ObjRef>,
    /// All live libraries, indexed by their `index` field
    pub libraries: Vec<ObjRef>,
    /// Canonical type-argument table
    pub canonical_type_arguments: CanonicalTypeArguments,
    /// Megamorphic cache table; dropped wholesale on reload
    pub megamorphic_cache_table: Vec<ObjRef>,
    /// Compile-time constants cache, cleared at reload checkpoint
    pub compile_time_constants: FxHashMap<String, Value>,
    /// The runtime integer class, used to re-seed arithmetic fast paths
    pub int_class: Option<ObjRef>,
}

impl ObjectStore {
    /// Create an empty object store
    pub fn new() -> Self {
        Self::default()
    }

    /// Visit every root reference
    pub fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        if let Some(r) = self.root_library.as_mut() {
            visitor(r);
        }
        for r in &mut self.libraries {
            visitor(r);
        }
        self.canonical_type_arguments.visit_pointers(visitor);
        for r in &mut self.megamorphic_cache_table {
            visitor(r);
        }
        for v in self.compile_time_constants.values_mut() {
            v.visit_pointer(visitor);
        }
        if let Some(r) = self.int_class.as_mut() {
            visitor(r);
        }
    }
}
