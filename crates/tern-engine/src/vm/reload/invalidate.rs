//! World invalidation after a committed reload
//!
//! Compiled code and type feedback encode the old class topology. After the
//! bulk forward, every megamorphic cache is dropped, optimized activations
//! are scheduled for deoptimization, inline caches that will execute again
//! are reset per site, and every function is marked for recompilation.

use crate::vm::context::Vm;
use crate::vm::heap::{HeapIterationScope, ObjRef};
use crate::vm::ic;
use crate::vm::object::{CallSiteKind, HeapObject};
use crate::vm::reload::ReloadContext;
use crate::vm::safepoint::NoSafepointScope;
use std::sync::Arc;

/// Invalidate all compiled state that depends on the old class topology
pub(crate) fn invalidate_world(ctx: &mut ReloadContext, vm: &mut Vm) {
    if vm.options.trace_reload {
        tracing::debug!("invalidating world");
    }

    reset_megamorphic_caches(vm);

    // Deoptimization of optimized activations is delegated to the stack.
    vm.stack.deoptimize_optimized_frames(&mut vm.heap);

    {
        let safepoint = Arc::clone(&vm.safepoint);
        let _no_safepoint = NoSafepointScope::new(&safepoint);
        let _iteration = HeapIterationScope::new(&vm.heap);
        reset_unoptimized_ics_on_stack(vm);
        mark_all_functions_for_recompilation(ctx, vm);
    }
}

/// Drop the megamorphic cache table wholesale
///
/// Current optimized code will not make any more calls, so clearing the
/// table is cheaper than clearing each cache; the caches become garbage and
/// new optimized code allocates fresh ones.
fn reset_megamorphic_caches(vm: &mut Vm) {
    vm.object_store.megamorphic_cache_table.clear();
}

/// Reset the inline caches that will execute once the stack resumes
///
/// For an optimized frame the ICs that matter live in the unoptimized code
/// the activation deoptimizes into; that code is found through the optimized
/// code's object pool, because the function's current unoptimized code may
/// already have been replaced or cleared. Unoptimized frames reset their
/// current code's ICs directly.
fn reset_unoptimized_ics_on_stack(vm: &mut Vm) {
    let frames: Vec<(ObjRef, Option<ObjRef>)> = vm
        .stack
        .frames()
        .map(|frame| (frame.function, frame.code))
        .collect();

    for (function, code) in frames {
        let Some(code) = code else {
            continue;
        };
        if vm.heap.code(code).is_optimized {
            let pool = vm.heap.code(code).object_pool.clone();
            for entry in pool {
                let Some(r) = entry.as_obj() else {
                    continue;
                };
                let owned_by_function = match vm.heap.get(r) {
                    HeapObject::Code(pool_code) => pool_code.owner == function,
                    _ => false,
                };
                if owned_by_function {
                    reset_ics(vm, function, r);
                }
            }
        } else {
            reset_ics(vm, function, code);
        }
    }
}

/// Reset every IC-bearing call site of `code` through the owning function's
/// IC data table
fn reset_ics(vm: &mut Vm, function: ObjRef, code: ObjRef) {
    let Some(table) = vm.heap.function(function).ic_data_table.clone() else {
        // Already cleared in an earlier round.
        return;
    };
    let descriptors = vm.heap.code(code).descriptors.clone();
    for descriptor in descriptors {
        let is_static_call = match descriptor.kind {
            CallSiteKind::IcCall => false,
            CallSiteKind::UnoptStaticCall => true,
            CallSiteKind::Other => continue,
        };
        let Some(Some(ic_ref)) = table.get(descriptor.site_id).copied() else {
            continue;
        };
        ic::reset(vm, ic_ref, is_static_call);
    }
}

/// Heap walk marking every function for recompilation
///
/// Functions in dirty libraries lose their IC data and code entirely;
/// functions in clean libraries keep their unoptimized code, but their IC
/// data is filled with sentinels so no stale type feedback carries over.
fn mark_all_functions_for_recompilation(ctx: &mut ReloadContext, vm: &mut Vm) {
    let mut functions: Vec<ObjRef> = Vec::new();
    vm.heap.visit_objects(&mut |r, obj| {
        if matches!(obj, HeapObject::Function(_)) {
            functions.push(r);
        }
    });

    for function in functions {
        // Switch to unoptimized code or the lazy compilation stub.
        vm.heap
            .function_mut(function)
            .switch_to_lazy_compiled_unoptimized_code();
        let stub_code = vm.heap.function(function).has_stub_code();
        let clear_code = is_from_dirty_library(ctx, vm, function);

        vm.heap.function_mut(function).zero_edge_counters();

        if !stub_code {
            if clear_code {
                let func = vm.heap.function_mut(function);
                func.clear_ic_data_table();
                func.clear_code();
            } else {
                fill_ic_data_with_sentinels(vm, function);
            }
        }

        let func = vm.heap.function_mut(function);
        func.usage_counter = 0;
        func.deoptimization_counter = 0;
        func.optimized_instruction_count = 0;
        func.optimized_call_site_count = 0;
    }
}

fn fill_ic_data_with_sentinels(vm: &mut Vm, function: ObjRef) {
    let Some(table) = vm.heap.function(function).ic_data_table.clone() else {
        return;
    };
    for ic_ref in table.into_iter().flatten() {
        vm.heap.ic_data_mut(ic_ref).fill_with_sentinels();
    }
}

fn is_from_dirty_library(ctx: &ReloadContext, vm: &Vm, function: ObjRef) -> bool {
    match vm.function_owning_library(function) {
        Some(library) => ctx.is_dirty(vm, library),
        // No owning library resolvable: treat as deleted, hence dirty.
        None => true,
    }
}
