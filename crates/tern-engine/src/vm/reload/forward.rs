//! Bulk one-way identity forwarding
//!
//! `forward_identity(vm, ctx, before, after)` redirects every pointer in the
//! root set and heap so that references to `before[i]` become references to
//! `after[i]`, in a single atomic step. Each `before[i]` is replaced in place
//! by a forwarding corpse of the same recorded size; the heap remains
//! walkable and the corpse is reclaimed by the next collection once nothing
//! references it.
//!
//! Chained forwards are prohibited, so following a corpse is a single
//! indirection. All validation failures are fatal: the engine must never
//! leave a partial bulk forward behind.

use crate::vm::context::Vm;
use crate::vm::heap::{Generation, ObjRef};
use crate::vm::object::HeapObject;
use crate::vm::reload::ReloadContext;
use crate::vm::safepoint::{NoSafepointScope, SafepointOperationScope, StopReason};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// Redirect all pointers to elements of `before` to the corresponding
/// element of `after`. Every element of `before` is dead after this
/// operation.
pub fn forward_identity(
    vm: &mut Vm,
    ctx: &mut ReloadContext,
    before: &[ObjRef],
    after: &[ObjRef],
) {
    assert_eq!(before.len(), after.len());

    let safepoint = Arc::clone(&vm.safepoint);
    let _operation = SafepointOperationScope::new(&safepoint, StopReason::Reload);
    let _no_safepoint = NoSafepointScope::new(&safepoint);

    if cfg!(debug_assertions) {
        // There should be no pointers to forwarding corpses.
        assert_no_corpse_targets(vm, ctx);
    }

    // Set up forwarding corpses.
    for (&before_obj, &after_obj) in before.iter().zip(after) {
        if before_obj == after_obj {
            panic!("forward: cannot self-forward {before_obj:?}");
        }
        if !vm.heap.contains(before_obj) || !vm.heap.contains(after_obj) {
            panic!("forward: not a heap object");
        }
        if vm.heap.is_vm_internal(before_obj) {
            panic!("forward: cannot forward runtime-internal objects");
        }
        if vm.heap.is_corpse(before_obj) {
            panic!("forward: cannot forward to multiple objects");
        }
        if vm.heap.is_corpse(after_obj) {
            panic!("forward: no indirect chains of forwarding");
        }
        if vm.heap.generation(before_obj) == Generation::Old
            && vm.heap.generation(after_obj) == Generation::Young
        {
            // Would require a store buffer update.
            unimplemented!("forward: old-space to young-space forwarding");
        }

        let size_before = vm.heap.size_of(before_obj);
        vm.heap.make_corpse(before_obj, after_obj);
        // The corpse must still be iterable at the original size.
        let size_after = vm.heap.size_of(before_obj);
        assert_eq!(size_before, size_after);
    }

    // Follow forwarding pointers: every slot targeting a corpse is replaced
    // by the corpse's `next`. Chains are prohibited above, so one indirection
    // suffices.
    let mut forwarding: FxHashMap<ObjRef, ObjRef> = FxHashMap::default();
    vm.heap.visit_objects(&mut |r, obj| {
        if let HeapObject::Corpse(corpse) = obj {
            forwarding.insert(r, corpse.next);
        }
    });
    let mut rewrite = |slot: &mut ObjRef| {
        if let Some(&next) = forwarding.get(slot) {
            *slot = next;
        }
    };
    vm.visit_roots(&mut rewrite);
    ctx.visit_pointers(&mut rewrite);
    vm.heap.visit_object_pointers(&mut rewrite);

    if cfg!(debug_assertions) {
        for (&before_obj, &after_obj) in before.iter().zip(after) {
            assert_eq!(vm.heap.corpse_target(before_obj), Some(after_obj));
        }
        // No reachable pointers to corpses remain.
        assert_no_corpse_targets(vm, ctx);
    }
}

/// Assert that no pointer in the root set or heap targets a corpse
fn assert_no_corpse_targets(vm: &mut Vm, ctx: &mut ReloadContext) {
    let mut corpses: FxHashSet<ObjRef> = FxHashSet::default();
    vm.heap.visit_objects(&mut |r, obj| {
        if obj.is_corpse() {
            corpses.insert(r);
        }
    });
    if corpses.is_empty() {
        return;
    }
    let mut check = |slot: &mut ObjRef| {
        assert!(
            !corpses.contains(slot),
            "pointer to forwarding corpse {slot:?}"
        );
    };
    vm.visit_roots(&mut check);
    ctx.visit_pointers(&mut check);
    vm.heap.visit_object_pointers(&mut check);
}
