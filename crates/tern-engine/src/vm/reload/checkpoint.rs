//! Checkpoint and rollback of class-table and library state
//!
//! The checkpoint is taken before the external parser runs; rollback restores
//! it bit-for-bit if parsing or validation fails. The saved class table is a
//! GC root for as long as it exists (see [`ReloadContext::visit_pointers`]).

use crate::vm::context::Vm;
use crate::vm::heap::ObjRef;
use crate::vm::reload::{EntityKey, ReloadContext};

impl ReloadContext {
    /// Snapshot the class table and populate the old-classes set
    ///
    /// Copies the table size and contents, and indexes every valid class by
    /// structural identity so new classes can be paired with old ones.
    /// Runtime-internal classes are excluded from the set; they are never
    /// reloaded.
    pub(crate) fn checkpoint_classes(&mut self, vm: &mut Vm) {
        if vm.options.trace_reload {
            tracing::debug!(num_cids = vm.class_table.num_cids(), "checkpointing classes");
        }
        self.saved_num_cids = vm.class_table.num_cids();

        let mut saved_table: Vec<Option<ObjRef>> = Vec::with_capacity(self.saved_num_cids);
        for cid in 0..self.saved_num_cids {
            let entry = if vm.class_table.has_valid_class_at(cid) {
                vm.class_table.at(cid)
            } else {
                None
            };
            saved_table.push(entry);

            if let Some(class) = entry {
                if vm.heap.is_vm_internal(class) {
                    continue;
                }
                let key = EntityKey::for_class(&vm.heap, class);
                let already_present = self.old_classes_set.insert(key, class);
                assert!(already_present.is_none(), "duplicate class in old set");
            }
        }
        // Assigning the field must come after saving the whole table.
        self.saved_class_table = Some(saved_table);
    }

    /// Snapshot the library list and root library, and rebuild the live list
    /// with only clean libraries
    ///
    /// Clean libraries keep their identity across the reload and are
    /// reindexed into the filtered list. Every other library is given the
    /// sentinel index -1: it is no longer in the live list and will either be
    /// replaced by the parser's output or become garbage.
    pub(crate) fn checkpoint_libraries(&mut self, vm: &mut Vm) {
        self.saved_root_library = vm.object_store.root_library;
        self.saved_libraries = Some(vm.object_store.libraries.clone());

        let mut kept: Vec<ObjRef> = Vec::new();
        self.num_saved_libs = 0;
        for &lib in vm.object_store.libraries.clone().iter() {
            if vm.heap.library(lib).is_runtime {
                // Preserve this library across the reload under its new index.
                vm.heap.library_mut(lib).index = kept.len() as i64;
                kept.push(lib);
                self.num_saved_libs += 1;
            } else {
                // This library will be reloaded; drop it from the live list.
                vm.heap.library_mut(lib).index = -1;
            }
            let key = EntityKey::for_library(&vm.heap, lib);
            let already_present = self.old_libraries_set.insert(key, lib);
            assert!(already_present.is_none(), "duplicate library in old set");
        }
        vm.object_store.libraries = kept;
        vm.object_store.root_library = None;

        if vm.options.trace_reload {
            tracing::debug!(
                saved = self.num_saved_libs,
                total = self.saved_libraries.as_ref().map_or(0, Vec::len),
                "checkpointed libraries"
            );
        }
    }

    /// Restore the class table to its checkpointed contents
    pub(crate) fn rollback_classes(&mut self, vm: &mut Vm) {
        if vm.options.trace_reload {
            tracing::debug!("rolling back class table");
        }
        #[cfg(debug_assertions)]
        self.verify_rollback_instances(vm);

        assert!(self.saved_num_cids > 0);
        let saved_table = self
            .saved_class_table
            .take()
            .expect("rollback without checkpoint");
        vm.class_table.drop_new_classes(self.saved_num_cids);
        for (cid, &entry) in saved_table.iter().enumerate() {
            if vm.class_table.is_valid_index(cid) {
                vm.class_table.set_at(cid, entry);
                if let Some(class) = entry {
                    vm.heap.class_mut(class).id = cid;
                }
            }
        }
        self.saved_num_cids = 0;
    }

    /// Restore the library list, per-library indices, and root library
    pub(crate) fn rollback_libraries(&mut self, vm: &mut Vm) {
        if vm.options.trace_reload {
            tracing::debug!("rolling back library changes");
        }
        if let Some(saved_libs) = self.saved_libraries.take() {
            for (index, &lib) in saved_libs.iter().enumerate() {
                // Restore the indices modified at checkpoint.
                vm.heap.library_mut(lib).index = index as i64;
            }
            vm.object_store.libraries = saved_libs;
        }
        if let Some(root) = self.saved_root_library.take() {
            vm.object_store.root_library = Some(root);
        }
    }

    /// No instance of a class registered after the checkpoint may exist when
    /// rolling back: such classes are about to be dropped.
    #[cfg(debug_assertions)]
    fn verify_rollback_instances(&self, vm: &Vm) {
        let limit = self.saved_num_cids;
        vm.heap.visit_objects(&mut |_, obj| {
            if let crate::vm::object::HeapObject::Instance(instance) = obj {
                assert!(
                    instance.cid < limit,
                    "instance of post-checkpoint class {} survives rollback",
                    instance.cid
                );
            }
        });
    }
}
