//! Live program reload
//!
//! Rebinds a running VM to a new version of its program while preserving all
//! reachable instances, static field values, and the call stack. The reload
//! is transactional: parsing or validation can fail at any point, and the
//! runtime either fully advances or is restored to its checkpointed state.
//!
//! The pipeline, driven by [`ReloadContext`]:
//!
//! ```text
//! start_reload:
//!   switch every stack frame to compiled unoptimized code
//!   checkpoint classes and libraries
//!   clear the compile-time-constants cache
//!   invoke the external parser               <- may fail, may suspend
//! finish_reload:
//!   build class and library mappings
//!   finalize the class table (id-stable replacement)
//!   validate -> commit + invalidate world, or rollback
//! ```
//!
//! Commit order is fixed: static-field copy and patch, library bit copy,
//! library reindex, bulk identity forward, canonical-type rehash, class-table
//! compaction. Forwarding precedes rehashing because canonical hashes depend
//! on class ids, and precedes invalidation because the invalidation heap walk
//! must see canonical identities.

pub mod checkpoint;
pub mod forward;
pub mod invalidate;
pub mod map;
pub mod reconcile;

pub use map::{EntityKey, MappedPair};

use crate::vm::context::Vm;
use crate::vm::heap::ObjRef;
use crate::vm::object::ClassId;
use crate::vm::service::ServiceEvent;
use rustc_hash::FxHashMap;

/// Recoverable reload failures
///
/// Every variant funnels through [`ReloadContext::report_error`] and causes a
/// rollback. Internal invariant violations (duplicate mapping targets,
/// forbidden forwards) are not represented here: they panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReloadError {
    /// The external source-load callback failed
    #[error("{0}")]
    Parse(String),

    /// Instance field count differs between the old and new class
    #[error("Number of instance fields changed in {class}")]
    InstanceFieldCountChanged {
        /// The class that failed the compatibility check
        class: String,
    },

    /// A field at a fixed offset changed name
    #[error("Field at offset {offset} changed name from '{old_name}' to '{new_name}' in {class}")]
    InstanceFieldMismatch {
        /// The class that failed the compatibility check
        class: String,
        /// Offset of the mismatched field
        offset: usize,
        /// Field name in the old class
        old_name: String,
        /// Field name in the new class
        new_name: String,
    },

    /// Instance size differs between prefinalized old and new classes
    #[error("Instance size changed in {class}")]
    InstanceSizeChanged {
        /// The class that failed the compatibility check
        class: String,
    },

    /// Native field count differs between the old and new class
    #[error("Number of native fields changed in {class}")]
    NativeFieldCountChanged {
        /// The class that failed the compatibility check
        class: String,
    },

    /// The new class could not be finalized
    #[error("Class finalization failed for {class}: {reason}")]
    FinalizationFailed {
        /// The class that could not be finalized
        class: String,
        /// What went wrong
        reason: String,
    },
}

/// Per-library side data built at commit
#[derive(Debug, Clone, Copy)]
pub(crate) struct LibraryInfo {
    /// Whether the library is in the reloaded set and its functions must
    /// fully recompile
    pub dirty: bool,
}

/// State of one reload transaction
///
/// Constructed at `start_reload` and dropped when `finish_reload` or
/// `abort_reload` completes. While it lives, its saved class table and
/// handles are roots: the GC and the bulk forwarder both visit them.
pub struct ReloadContext {
    /// Root library URL passed to the parser
    pub(crate) script_uri: String,
    /// An error has been reported; at most one per reload
    pub(crate) has_error: bool,
    pub(crate) last_error: Option<ReloadError>,

    /// Class-table size at checkpoint; ids below this existed before reload
    pub(crate) saved_num_cids: usize,
    /// Full copy of the class table at checkpoint
    pub(crate) saved_class_table: Option<Vec<Option<ObjRef>>>,
    /// Number of clean libraries kept in the live list at checkpoint
    pub(crate) num_saved_libs: usize,
    /// Root library at checkpoint
    pub(crate) saved_root_library: Option<ObjRef>,
    /// Full library list at checkpoint
    pub(crate) saved_libraries: Option<Vec<ObjRef>>,

    /// Pre-reload classes by structural identity
    pub(crate) old_classes_set: FxHashMap<EntityKey, ObjRef>,
    /// Pre-reload libraries by structural identity
    pub(crate) old_libraries_set: FxHashMap<EntityKey, ObjRef>,
    /// New class -> (replacement, original) pairs
    pub(crate) class_map: FxHashMap<EntityKey, MappedPair>,
    /// New library -> (replacement, original) pairs
    pub(crate) library_map: FxHashMap<EntityKey, MappedPair>,
    /// Pending identity forwards: old entity -> its replacement
    pub(crate) become_map: FxHashMap<ObjRef, ObjRef>,

    /// Dead class-table slots, kept from finalize until commit compaction
    pub(crate) dead_classes: Option<Vec<bool>>,
    /// Per-library dirty bits, indexed by library index
    pub(crate) library_infos: Vec<LibraryInfo>,
}

impl ReloadContext {
    /// Create the context for one reload of the program rooted at
    /// `script_uri`
    pub fn new(script_uri: String) -> Self {
        Self {
            script_uri,
            has_error: false,
            last_error: None,
            saved_num_cids: 0,
            saved_class_table: None,
            num_saved_libs: 0,
            saved_root_library: None,
            saved_libraries: None,
            old_classes_set: FxHashMap::default(),
            old_libraries_set: FxHashMap::default(),
            class_map: FxHashMap::default(),
            library_map: FxHashMap::default(),
            become_map: FxHashMap::default(),
            dead_classes: None,
            library_infos: Vec::new(),
        }
    }

    /// The root library URL this reload was started with
    pub fn script_uri(&self) -> &str {
        &self.script_uri
    }

    /// Whether an error has been reported for this reload
    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// The reported error, if any
    pub fn last_error(&self) -> Option<&ReloadError> {
        self.last_error.as_ref()
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// Report a recoverable reload error. Only the first error per reload is
    /// published; subsequent validations are skipped once it is set.
    pub fn report_error(&mut self, vm: &mut Vm, error: ReloadError) {
        if self.has_error {
            return;
        }
        self.has_error = true;
        if vm.options.trace_reload {
            tracing::debug!(error = %error, "reload error");
        }
        vm.publish_event(ServiceEvent::reload_error(error.to_string()));
        self.last_error = Some(error);
    }

    /// Report reload success; called exactly once, after post-commit
    pub fn report_success(&mut self, vm: &mut Vm) {
        debug_assert!(!self.has_error);
        if vm.options.trace_reload {
            tracing::debug!(uri = %self.script_uri, "reload succeeded");
        }
        vm.publish_event(ServiceEvent::reload_success());
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    /// Checkpoint classes and libraries so the transaction can roll back
    pub fn checkpoint(&mut self, vm: &mut Vm) {
        self.checkpoint_classes(vm);
        self.checkpoint_libraries(vm);
    }

    /// Finish the reload: build mappings, validate, and commit or roll back.
    /// Returns whether the reload succeeded.
    pub fn finish(&mut self, vm: &mut Vm) -> bool {
        // The background compiler must not observe the intermediate class
        // topology.
        vm.disable_background_compiler();

        self.build_class_mapping(vm);
        self.build_library_mapping(vm);
        self.finalize_class_table(vm);

        let ok = if self.validate_reload(vm) {
            self.commit(vm);
            self.post_commit(vm);
            self.report_success(vm);
            true
        } else {
            self.rollback(vm);
            false
        };

        vm.enable_background_compiler();
        ok
    }

    /// Restore the checkpointed state
    pub fn rollback(&mut self, vm: &mut Vm) {
        self.rollback_classes(vm);
        self.rollback_libraries(vm);
        self.dead_classes = None;
    }

    // ------------------------------------------------------------------
    // Mappings
    // ------------------------------------------------------------------

    /// Pair every class registered since the checkpoint with its predecessor
    pub fn build_class_mapping(&mut self, vm: &mut Vm) {
        let lower = self.saved_num_cids;
        let upper = vm.class_table.num_cids();
        for cid in lower..upper {
            if !vm.class_table.has_valid_class_at(cid) {
                continue;
            }
            let replacement_or_new = vm.class_table.at(cid).unwrap();
            let key = EntityKey::for_class(&vm.heap, replacement_or_new);
            match self.old_classes_set.get(&key).copied() {
                Some(original) => self.add_class_mapping(vm, replacement_or_new, original),
                None => {
                    if vm.options.identity_reload {
                        tracing::warn!(
                            class = %vm.heap.class(replacement_or_new).name,
                            "identity reload: no replacement class found"
                        );
                    }
                    // New class, no predecessor.
                    self.add_class_mapping(vm, replacement_or_new, replacement_or_new);
                }
            }
        }
    }

    /// Pair every live non-clean library with its predecessor
    pub fn build_library_mapping(&mut self, vm: &mut Vm) {
        let libs = vm.object_store.libraries.clone();
        for replacement_or_new in libs {
            if vm.heap.library(replacement_or_new).is_runtime {
                // Clean library: never in any mapping and never forwarded.
                continue;
            }
            let key = EntityKey::for_library(&vm.heap, replacement_or_new);
            match self.old_libraries_set.get(&key).copied() {
                Some(original) => {
                    self.add_library_mapping(vm, replacement_or_new, original);
                    self.add_become_mapping(original, replacement_or_new);
                }
                None => {
                    self.add_library_mapping(vm, replacement_or_new, replacement_or_new);
                }
            }
        }
    }

    /// Replace old classes by their successors at stable class ids and
    /// enqueue the identity forwards. Compaction of the freed tail slots is
    /// deferred to the end of commit.
    pub fn finalize_class_table(&mut self, vm: &mut Vm) {
        debug_assert!(self.dead_classes.is_none());
        self.dead_classes = Some(vec![false; vm.class_table.num_cids()]);

        let pairs: Vec<MappedPair> = self.class_map.values().copied().collect();
        for pair in pairs {
            if !pair.is_replacement() {
                continue;
            }
            let new_cls = pair.replacement;
            let old_cls = pair.original;
            if vm.options.trace_reload {
                tracing::debug!(
                    class = %vm.heap.class(old_cls).name,
                    old_cid = vm.heap.class(old_cls).id,
                    new_cid = vm.heap.class(new_cls).id,
                    "replacing class"
                );
            }
            let former_cid = vm.heap.class(new_cls).id;
            assert!(
                !self.is_dead_class_at(former_cid),
                "class slot {former_cid} already marked dead"
            );
            self.mark_class_dead_at(former_cid);
            vm.class_table.replace_class(&mut vm.heap, old_cls, new_cls);
            self.add_become_mapping(old_cls, new_cls);
        }
    }

    /// Run the per-class compatibility checks. The first failure reports an
    /// error and aborts the transaction.
    pub fn validate_reload(&mut self, vm: &mut Vm) -> bool {
        if self.has_error {
            return false;
        }
        #[cfg(debug_assertions)]
        self.verify_maps(vm);

        let pairs: Vec<MappedPair> = self.class_map.values().copied().collect();
        for pair in pairs {
            if pair.is_replacement()
                && !reconcile::can_reload(self, vm, pair.original, pair.replacement)
            {
                return false;
            }
        }
        true
    }

    /// Apply the transaction. After this point the reload cannot be
    /// cancelled.
    pub fn commit(&mut self, vm: &mut Vm) {
        if vm.options.trace_reload {
            tracing::debug!("committing reload");
        }
        #[cfg(debug_assertions)]
        {
            self.verify_maps(vm);
            self.verify_instance_classes(vm);
        }

        // Copy static field values from the old classes to the new classes,
        // and patch fields and functions in the old classes so they retain
        // the old script.
        let class_pairs: Vec<MappedPair> = self.class_map.values().copied().collect();
        for pair in &class_pairs {
            if !pair.is_replacement() {
                continue;
            }
            let (new_cls, old_cls) = (pair.replacement, pair.original);
            debug_assert_eq!(
                vm.heap.class(new_cls).is_enum,
                vm.heap.class(old_cls).is_enum
            );
            if vm.heap.class(new_cls).is_enum && vm.heap.class(new_cls).is_finalized() {
                reconcile::replace_enum(self, vm, new_cls, old_cls);
            }
            reconcile::copy_static_field_values(self, vm, new_cls, old_cls);
            reconcile::copy_canonical_constants(vm, new_cls, old_cls);
            reconcile::patch_fields_and_functions(vm, old_cls);
        }

        // Copy persistent library properties over to the replacements.
        let library_pairs: Vec<MappedPair> = self.library_map.values().copied().collect();
        for pair in &library_pairs {
            if pair.is_replacement() {
                let debuggable = vm.heap.library(pair.original).debuggable;
                vm.heap.library_mut(pair.replacement).debuggable = debuggable;
            }
        }

        // Reindex the live library list and build the dirty side table.
        let libs = vm.object_store.libraries.clone();
        for (index, &lib) in libs.iter().enumerate() {
            vm.heap.library_mut(lib).index = index as i64;
        }
        self.library_infos = (0..libs.len())
            .map(|index| LibraryInfo {
                dirty: index >= self.num_saved_libs,
            })
            .collect();

        // Drain the become map and apply the bulk identity forward.
        let mut before = Vec::with_capacity(self.become_map.len());
        let mut after = Vec::with_capacity(self.become_map.len());
        for (old, new) in self.become_map.drain() {
            before.push(old);
            after.push(new);
        }
        forward::forward_identity(vm, self, &before, &after);

        // The canonical type arguments were hashed under the old class ids.
        vm.object_store.canonical_type_arguments.rehash(&vm.heap);

        // Free the class-table slots vacated by replaced classes.
        self.compact_class_table(vm);
        self.dead_classes = None;

        if vm.options.identity_reload {
            if self.saved_num_cids != vm.class_table.num_cids() {
                tracing::warn!(
                    before = self.saved_num_cids,
                    after = vm.class_table.num_cids(),
                    "identity reload: class count changed"
                );
            }
            let saved_libs = self.saved_libraries.as_ref().map_or(0, Vec::len);
            if saved_libs != vm.object_store.libraries.len() {
                tracing::warn!(
                    before = saved_libs,
                    after = vm.object_store.libraries.len(),
                    "identity reload: library count changed"
                );
            }
        }
    }

    /// Release the checkpoint and invalidate the world
    pub fn post_commit(&mut self, vm: &mut Vm) {
        self.saved_root_library = None;
        self.saved_libraries = None;
        invalidate::invalidate_world(self, vm);
    }

    /// Compact the class table: move live classes down into dead slots,
    /// updating their ids, then trim the table
    fn compact_class_table(&mut self, vm: &mut Vm) {
        let top = vm.class_table.num_cids();
        let mut new_top = self.saved_num_cids;
        for free_index in self.saved_num_cids..top {
            // Scan forward until we find a dead slot.
            if !self.is_dead_class_at(free_index) {
                new_top += 1;
                continue;
            }
            for cls_index in free_index + 1..top {
                // Scan forward until we find a live class.
                if self.is_dead_class_at(cls_index) {
                    continue;
                }
                vm.class_table.move_class(&mut vm.heap, free_index, cls_index);
                self.mark_class_dead_at(cls_index);
                self.clear_dead_class_at(free_index);
                new_top += 1;
                break;
            }
        }
        vm.class_table.drop_new_classes(new_top);
        if vm.options.trace_reload {
            tracing::debug!(num_cids = new_top, "class table compacted");
        }
    }

    fn is_dead_class_at(&self, index: usize) -> bool {
        self.dead_classes.as_ref().expect("no dead class bitmap")[index]
    }

    fn mark_class_dead_at(&mut self, index: usize) {
        self.dead_classes.as_mut().expect("no dead class bitmap")[index] = true;
    }

    fn clear_dead_class_at(&mut self, index: usize) {
        self.dead_classes.as_mut().expect("no dead class bitmap")[index] = false;
    }

    // ------------------------------------------------------------------
    // Map maintenance
    // ------------------------------------------------------------------

    pub(crate) fn add_class_mapping(
        &mut self,
        vm: &Vm,
        replacement_or_new: ObjRef,
        original: ObjRef,
    ) {
        let key = EntityKey::for_class(&vm.heap, replacement_or_new);
        let previous = self.class_map.insert(
            key,
            MappedPair {
                replacement: replacement_or_new,
                original,
            },
        );
        assert!(previous.is_none(), "class mapped twice");
    }

    pub(crate) fn add_library_mapping(
        &mut self,
        vm: &Vm,
        replacement_or_new: ObjRef,
        original: ObjRef,
    ) {
        let key = EntityKey::for_library(&vm.heap, replacement_or_new);
        let previous = self.library_map.insert(
            key,
            MappedPair {
                replacement: replacement_or_new,
                original,
            },
        );
        assert!(previous.is_none(), "library mapped twice");
    }

    /// Enqueue an identity forward from `old` to `new`
    pub(crate) fn add_become_mapping(&mut self, old: ObjRef, new: ObjRef) {
        let previous = self.become_map.insert(old, new);
        assert!(previous.is_none(), "object forwarded twice");
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The original class a new class replaced (the class itself when it is
    /// new); for debugger/inspector use
    pub fn find_original_class(&self, vm: &Vm, replacement_or_new: ObjRef) -> Option<ObjRef> {
        let key = EntityKey::for_class(&vm.heap, replacement_or_new);
        self.class_map.get(&key).map(|pair| pair.original)
    }

    /// Whether a library is in the reloaded set; its functions must fully
    /// recompile
    pub fn is_dirty(&self, vm: &Vm, library: ObjRef) -> bool {
        let index = vm.heap.library(library).index;
        if index < 0 {
            // Deleted libraries are dirty.
            return true;
        }
        let index = index as usize;
        assert!(index < self.library_infos.len());
        self.library_infos[index].dirty
    }

    /// The pre-reload class at `cid`, while the checkpoint is live
    pub fn saved_class_at(&self, cid: ClassId) -> Option<ObjRef> {
        self.saved_class_table
            .as_ref()
            .and_then(|table| table.get(cid).copied().flatten())
    }

    /// Visit every heap reference held by this context. The saved class
    /// table and handles are roots for the GC and the bulk forwarder.
    pub fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        if let Some(table) = self.saved_class_table.as_mut() {
            for slot in table.iter_mut().flatten() {
                visitor(slot);
            }
        }
        if let Some(r) = self.saved_root_library.as_mut() {
            visitor(r);
        }
        if let Some(libs) = self.saved_libraries.as_mut() {
            for r in libs {
                visitor(r);
            }
        }
        for r in self.old_classes_set.values_mut() {
            visitor(r);
        }
        for r in self.old_libraries_set.values_mut() {
            visitor(r);
        }
        for pair in self.class_map.values_mut() {
            visitor(&mut pair.replacement);
            visitor(&mut pair.original);
        }
        for pair in self.library_map.values_mut() {
            visitor(&mut pair.replacement);
            visitor(&mut pair.original);
        }
        for r in self.become_map.values_mut() {
            visitor(r);
        }
    }

    // ------------------------------------------------------------------
    // Debug verification
    // ------------------------------------------------------------------

    /// Verify the class map is injective on matched pairs: no two new
    /// classes map to the same old class
    #[cfg(debug_assertions)]
    pub(crate) fn verify_maps(&self, vm: &Vm) {
        let mut seen: FxHashMap<ObjRef, ObjRef> = FxHashMap::default();
        for pair in self.class_map.values() {
            if !pair.is_replacement() {
                continue;
            }
            if let Some(&other) = seen.get(&pair.original) {
                if other != pair.replacement {
                    panic!(
                        "classes '{}' and '{}' are distinct but both replace '{}'",
                        vm.heap.class(pair.replacement).name,
                        vm.heap.class(other).name,
                        vm.heap.class(pair.original).name,
                    );
                }
            }
            seen.insert(pair.original, pair.replacement);
        }
    }

    /// Verify every instance in the heap has a class id the class table can
    /// resolve
    #[cfg(debug_assertions)]
    pub(crate) fn verify_instance_classes(&self, vm: &Vm) {
        let limit = vm.class_table.num_cids();
        vm.heap.visit_objects(&mut |_, obj| {
            if let crate::vm::object::HeapObject::Instance(instance) = obj {
                assert!(
                    instance.cid < limit,
                    "instance with class id {} above limit {}",
                    instance.cid,
                    limit
                );
            }
        });
    }
}
