//! Class and library reconciliation
//!
//! For each matched (new, old) class pair the reconciler checks reload
//! compatibility, migrates static state from the old class to its
//! replacement, and re-parents the old entities onto a patch record so they
//! stay well-formed for debuggers and surviving closures.

use crate::vm::context::Vm;
use crate::vm::heap::ObjRef;
use crate::vm::object::{HeapObject, PatchClass};
use crate::vm::reload::{EntityKey, ReloadContext, ReloadError};
use rustc_hash::FxHashMap;

/// Whether `old` can be reloaded as `new`
///
/// On a violation, reports a structured error naming the class and the
/// mismatched attribute, and returns false; the reload aborts.
pub(crate) fn can_reload(
    ctx: &mut ReloadContext,
    vm: &mut Vm,
    old: ObjRef,
    new: ObjRef,
) -> bool {
    debug_assert_eq!(
        EntityKey::for_class(&vm.heap, old),
        EntityKey::for_class(&vm.heap, new)
    );
    let class_name = vm.heap.class(old).name.clone();

    if vm.heap.class(old).is_finalized() {
        if let Err(err) = vm.ensure_class_finalized(new) {
            ctx.report_error(
                vm,
                ReloadError::FinalizationFailed {
                    class: class_name,
                    reason: err.to_string(),
                },
            );
            return false;
        }
        // Instances keep their layout across the reload: the offset-to-field
        // maps must agree in length and field names at every offset.
        let old_map = vm.offset_to_field_map(old);
        let new_map = vm.offset_to_field_map(new);
        if old_map.len() != new_map.len() {
            ctx.report_error(vm, ReloadError::InstanceFieldCountChanged { class: class_name });
            return false;
        }
        for (offset, (&old_field, &new_field)) in old_map.iter().zip(&new_map).enumerate() {
            let old_name = &vm.heap.field(old_field).name;
            let new_name = &vm.heap.field(new_field).name;
            if old_name != new_name {
                let error = ReloadError::InstanceFieldMismatch {
                    class: class_name,
                    offset,
                    old_name: old_name.clone(),
                    new_name: new_name.clone(),
                };
                ctx.report_error(vm, error);
                return false;
            }
        }
    } else if vm.heap.class(old).is_prefinalized() {
        let size_matches = vm.heap.class(new).is_prefinalized()
            && vm.heap.class(old).instance_size == vm.heap.class(new).instance_size;
        if !size_matches {
            ctx.report_error(vm, ReloadError::InstanceSizeChanged { class: class_name });
            return false;
        }
    }

    if vm.heap.class(old).num_native_fields != vm.heap.class(new).num_native_fields {
        ctx.report_error(vm, ReloadError::NativeFieldCountChanged { class: class_name });
        return false;
    }
    true
}

/// Copy static field values from `old` to `new`, matching fields by name
///
/// Each copied pair is also enqueued as an identity forward keyed on the old
/// field object, so live closures that captured the old static-field object
/// are retargeted at commit.
pub(crate) fn copy_static_field_values(
    ctx: &mut ReloadContext,
    vm: &mut Vm,
    new_cls: ObjRef,
    old_cls: ObjRef,
) {
    let old_fields: FxHashMap<EntityKey, ObjRef> = vm
        .heap
        .class(old_cls)
        .fields
        .iter()
        .copied()
        .filter(|&f| vm.heap.field(f).is_static)
        .map(|f| (EntityKey::for_field(&vm.heap, f), f))
        .collect();

    for new_field in vm.heap.class(new_cls).fields.clone() {
        if !vm.heap.field(new_field).is_static {
            continue;
        }
        let key = EntityKey::for_field(&vm.heap, new_field);
        if let Some(&old_field) = old_fields.get(&key) {
            let value = vm.heap.field(old_field).static_value;
            vm.heap.field_mut(new_field).static_value = value;
            ctx.add_become_mapping(old_field, new_field);
        }
    }
}

/// Copy canonical constants from `old` to `new`
pub(crate) fn copy_canonical_constants(vm: &mut Vm, new_cls: ObjRef, old_cls: ObjRef) {
    let constants = vm.heap.class(old_cls).canonical_constants.clone();
    vm.heap.class_mut(new_cls).canonical_constants = constants;
}

/// Migrate enum values from `old` to `new`
///
/// Enum constants keep their identity across a reload: the old constant
/// instances survive and the new class's constant fields are rebound to
/// them. Freshly created constant instances for pre-existing names are
/// forwarded to the old instances.
pub(crate) fn replace_enum(
    ctx: &mut ReloadContext,
    vm: &mut Vm,
    new_cls: ObjRef,
    old_cls: ObjRef,
) {
    let old_fields: FxHashMap<String, ObjRef> = vm
        .heap
        .class(old_cls)
        .fields
        .iter()
        .copied()
        .filter(|&f| vm.heap.field(f).is_static)
        .map(|f| (vm.heap.field(f).name.clone(), f))
        .collect();

    for new_field in vm.heap.class(new_cls).fields.clone() {
        if !vm.heap.field(new_field).is_static {
            continue;
        }
        let name = vm.heap.field(new_field).name.clone();
        let Some(&old_field) = old_fields.get(&name) else {
            // A constant added by the new program keeps its new value.
            continue;
        };
        let new_value = vm.heap.field(new_field).static_value;
        let old_value = vm.heap.field(old_field).static_value;
        vm.heap.field_mut(new_field).static_value = old_value;
        if let (Some(new_instance), Some(old_instance)) = (new_value.as_obj(), old_value.as_obj())
        {
            if new_instance != old_instance {
                ctx.add_become_mapping(new_instance, old_instance);
            }
        }
    }
}

/// Re-parent the old class's functions and fields onto a patch record bound
/// to the original script
pub(crate) fn patch_fields_and_functions(vm: &mut Vm, old_cls: ObjRef) {
    let script = vm.heap.class(old_cls).script;
    let patch = vm.heap.allocate_old(HeapObject::Patch(PatchClass {
        wrapped: old_cls,
        script,
    }));

    for func in vm.heap.class(old_cls).functions.clone() {
        vm.heap.function_mut(func).owner = patch;
    }
    for field in vm.heap.class(old_cls).fields.clone() {
        vm.heap.field_mut(field).owner = patch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::Value;

    fn vm_with_lib() -> (Vm, ObjRef) {
        let mut vm = Vm::new();
        let lib = vm.new_library("file:///app.tern");
        vm.set_root_library(lib);
        (vm, lib)
    }

    #[test]
    fn test_can_reload_accepts_same_layout() {
        let (mut vm, lib) = vm_with_lib();
        let old = vm.new_class(lib, "A");
        vm.add_instance_field(old, "f");
        vm.ensure_class_finalized(old).unwrap();

        let new = vm.new_class(lib, "A");
        vm.add_instance_field(new, "f");

        let mut ctx = ReloadContext::new(String::new());
        assert!(can_reload(&mut ctx, &mut vm, old, new));
        assert!(!ctx.has_error());
        // The compatibility check finalizes the replacement.
        assert!(vm.heap.class(new).is_finalized());
    }

    #[test]
    fn test_can_reload_rejects_field_count_change() {
        let (mut vm, lib) = vm_with_lib();
        let old = vm.new_class(lib, "A");
        vm.add_instance_field(old, "f");
        vm.ensure_class_finalized(old).unwrap();

        let new = vm.new_class(lib, "A");
        vm.add_instance_field(new, "f");
        vm.add_instance_field(new, "g");

        let mut ctx = ReloadContext::new(String::new());
        assert!(!can_reload(&mut ctx, &mut vm, old, new));
        assert!(matches!(
            ctx.last_error(),
            Some(ReloadError::InstanceFieldCountChanged { class }) if class == "A"
        ));
    }

    #[test]
    fn test_can_reload_rejects_field_rename() {
        let (mut vm, lib) = vm_with_lib();
        let old = vm.new_class(lib, "A");
        vm.add_instance_field(old, "f");
        vm.ensure_class_finalized(old).unwrap();

        let new = vm.new_class(lib, "A");
        vm.add_instance_field(new, "g");

        let mut ctx = ReloadContext::new(String::new());
        assert!(!can_reload(&mut ctx, &mut vm, old, new));
        assert!(matches!(
            ctx.last_error(),
            Some(ReloadError::InstanceFieldMismatch { offset: 0, .. })
        ));
    }

    #[test]
    fn test_can_reload_rejects_native_field_change() {
        let (mut vm, lib) = vm_with_lib();
        let old = vm.new_class(lib, "A");
        vm.heap.class_mut(old).num_native_fields = 2;
        vm.ensure_class_finalized(old).unwrap();

        let new = vm.new_class(lib, "A");

        let mut ctx = ReloadContext::new(String::new());
        assert!(!can_reload(&mut ctx, &mut vm, old, new));
        assert!(matches!(
            ctx.last_error(),
            Some(ReloadError::NativeFieldCountChanged { .. })
        ));
    }

    #[test]
    fn test_can_reload_prefinalized_requires_same_size() {
        let (mut vm, lib) = vm_with_lib();
        let old = vm.new_class(lib, "A");
        vm.prefinalize_class(old, 4);

        let new = vm.new_class(lib, "A");
        vm.prefinalize_class(new, 5);

        let mut ctx = ReloadContext::new(String::new());
        assert!(!can_reload(&mut ctx, &mut vm, old, new));
        assert!(matches!(
            ctx.last_error(),
            Some(ReloadError::InstanceSizeChanged { .. })
        ));

        let matching = vm.new_class(lib, "A");
        vm.prefinalize_class(matching, 4);
        let mut ctx = ReloadContext::new(String::new());
        assert!(can_reload(&mut ctx, &mut vm, old, matching));
    }

    #[test]
    fn test_copy_static_field_values_matches_by_name() {
        let (mut vm, lib) = vm_with_lib();
        let old = vm.new_class(lib, "A");
        let new = vm.new_class(lib, "A");
        // Give both classes the same id, as finalize_class_table would.
        let shared_id = vm.heap.class(old).id;
        vm.heap.class_mut(new).id = shared_id;

        let old_value = vm.new_string("preserved");
        let old_field = vm.add_static_field(old, "v", old_value);
        let new_field = vm.add_static_field(new, "v", Value::null());
        let unmatched = vm.add_static_field(new, "w", Value::int(3));

        let mut ctx = ReloadContext::new(String::new());
        copy_static_field_values(&mut ctx, &mut vm, new, old);

        assert_eq!(vm.heap.field(new_field).static_value, old_value);
        assert_eq!(vm.heap.field(unmatched).static_value, Value::int(3));
        // The copied pair is enqueued for identity forwarding.
        assert_eq!(ctx.become_map.get(&old_field), Some(&new_field));
    }

    #[test]
    fn test_patch_reparents_functions_and_fields() {
        let (mut vm, lib) = vm_with_lib();
        let cls = vm.new_class(lib, "A");
        let script = vm.new_script("file:///app.tern", "class A {}");
        vm.heap.class_mut(cls).script = Some(script);
        let func = vm.new_method(cls, "m", crate::vm::object::FunctionBody::Unset);
        let field = vm.add_static_field(cls, "v", Value::null());

        patch_fields_and_functions(&mut vm, cls);

        let func_owner = vm.heap.function(func).owner;
        let field_owner = vm.heap.field(field).owner;
        assert_eq!(func_owner, field_owner);
        let patch = vm.heap.patch(func_owner);
        assert_eq!(patch.wrapped, cls);
        assert_eq!(patch.script, Some(script));
        // The patched function still resolves to its declaring class.
        assert_eq!(vm.function_owner_class(func), Some(cls));
    }

    #[test]
    fn test_replace_enum_preserves_constant_identity() {
        let (mut vm, lib) = vm_with_lib();
        let old = vm.new_class(lib, "Color");
        vm.heap.class_mut(old).is_enum = true;
        vm.ensure_class_finalized(old).unwrap();
        let old_red = vm.new_instance(old);
        let old_field = vm.add_static_field(old, "red", Value::obj(old_red));

        let new = vm.new_class(lib, "Color");
        vm.heap.class_mut(new).is_enum = true;
        vm.ensure_class_finalized(new).unwrap();
        let new_red = vm.new_instance(new);
        let old_id = vm.heap.class(old).id;
        vm.heap.class_mut(new).id = old_id;
        let new_field = vm.add_static_field(new, "red", Value::obj(new_red));

        let mut ctx = ReloadContext::new(String::new());
        replace_enum(&mut ctx, &mut vm, new, old);

        // The old constant instance stays the canonical one.
        assert_eq!(vm.heap.field(new_field).static_value, Value::obj(old_red));
        assert_eq!(ctx.become_map.get(&new_red), Some(&old_red));
        let _ = old_field;
    }
}
