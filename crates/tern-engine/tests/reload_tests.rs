//! Live reload integration tests
//!
//! Each test builds a program through the loader API, installs a tag handler
//! that loads the next version, and drives a full reload cycle. Programs are
//! expressed with the micro-invoker bodies (`FunctionBody`), which is enough
//! to observe function replacement, static-state preservation, rollback, and
//! world invalidation.

use tern_engine::vm::object::{CallSiteKind, Code, FunctionBody, HeapObject, PcDescriptor, StrPiece};
use tern_engine::vm::{IcData, Value, Vm, VmError, VmOptions};

const APP_URL: &str = "file:///app.tern";
const MATH_URL: &str = "file:///math.tern";

fn invoke_int(vm: &mut Vm, name: &str) -> i64 {
    let root = vm.root_library().expect("no root library");
    vm.invoke(root, name)
        .expect("invocation failed")
        .as_int()
        .expect("expected integer result")
}

fn invoke_str(vm: &mut Vm, name: &str) -> String {
    let root = vm.root_library().expect("no root library");
    let value = vm.invoke(root, name).expect("invocation failed");
    vm.display(value)
}

// ===== Scenario: function body changed =====

#[test]
fn test_function_replacement() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    vm.new_toplevel_function(lib, "main", FunctionBody::Const(Value::int(4)));
    assert_eq!(invoke_int(&mut vm, "main"), 4);

    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        vm.new_toplevel_function(lib, "main", FunctionBody::Const(Value::int(10)));
        Ok(())
    }));

    assert!(vm.reload_sources());
    assert_eq!(invoke_int(&mut vm, "main"), 10);

    // The old library was forwarded to its replacement.
    assert!(vm.heap.is_corpse(lib));
    assert_eq!(vm.heap.corpse_target(lib), vm.root_library());
}

#[test]
fn test_reload_reports_success_once() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);

    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        Ok(())
    }));

    assert!(vm.reload_sources());
    let events = vm.service.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].is_error());
}

// ===== Scenario: static value preserved =====

fn load_static_value_program(vm: &mut Vm, url: &str, init_value: &str) {
    let lib = vm.new_library(url);
    vm.set_root_library(lib);
    let top = vm.new_class(lib, "::");

    let init_const = vm.new_string(init_value);
    vm.new_toplevel_function(lib, "init", FunctionBody::Const(init_const));

    let field_value = vm.new_string(init_value);
    let field = vm.add_static_field(top, "value", field_value);

    vm.new_toplevel_function(
        lib,
        "main",
        FunctionBody::Concat(vec![
            StrPiece::Lit("init()=".to_string()),
            StrPiece::Call("init".to_string()),
            StrPiece::Lit(",value=".to_string()),
            StrPiece::Static(field),
        ]),
    );
}

#[test]
fn test_static_value_preserved() {
    let mut vm = Vm::new();
    load_static_value_program(&mut vm, APP_URL, "old");
    {
        let root = vm.root_library().unwrap();
        let top = vm.find_class(root, "::").unwrap();
        vm.ensure_class_finalized(top).unwrap();
    }
    assert_eq!(invoke_str(&mut vm, "main"), "init()=old,value=old");

    let old_main = {
        let root = vm.root_library().unwrap();
        vm.resolve_toplevel(root, "main").unwrap()
    };

    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        load_static_value_program(vm, url, "new");
        Ok(())
    }));

    assert!(vm.reload_sources());

    // The function was replaced but the static field kept its value.
    assert_eq!(invoke_str(&mut vm, "main"), "init()=new,value=old");

    // A surviving closure compiled against the old program observes the same
    // state: its captured static-field object was forwarded to the new field
    // and its call re-resolves against the new library.
    let value = vm.invoke_function(old_main).unwrap();
    assert_eq!(vm.display(value), "init()=new,value=old");
}

// ===== Scenario: field count change rejected =====

#[test]
fn test_field_count_change_rejected() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    let a = vm.new_class(lib, "A");
    vm.add_instance_field(a, "f");
    vm.ensure_class_finalized(a).unwrap();
    let a_cid = vm.heap.class(a).id;

    let instance = vm.new_instance(a);
    vm.heap.instance_mut(instance).fields[0] = Value::int(20);

    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        let a = vm.new_class(lib, "A");
        vm.add_instance_field(a, "f");
        vm.add_instance_field(a, "g");
        Ok(())
    }));

    assert!(!vm.reload_sources());

    // The compatibility error names the class and the mismatch.
    let event = vm.service.last().unwrap();
    let message = event.error.as_deref().unwrap();
    assert_eq!(message, "Number of instance fields changed in A");

    // The rollback restored the pre-reload world bit for bit.
    assert_eq!(vm.root_library(), Some(lib));
    assert_eq!(vm.class_table.at(a_cid), Some(a));
    assert!(!vm.heap.is_corpse(a));
    assert_eq!(vm.heap.instance(instance).fields[0], Value::int(20));
    assert!(vm.instance_is(instance, a));
}

#[test]
fn test_parse_error_rolls_back() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    vm.new_toplevel_function(lib, "main", FunctionBody::Const(Value::int(4)));
    let num_cids = vm.class_table.num_cids();

    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        // The parser got partway before failing.
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        vm.new_class(lib, "Partial");
        Err(VmError::LoadError("unexpected token".to_string()))
    }));

    assert!(!vm.reload_sources());
    assert!(vm.service.last().unwrap().is_error());

    // The program executes as if the reload had not been attempted.
    assert_eq!(vm.root_library(), Some(lib));
    assert_eq!(vm.class_table.num_cids(), num_cids);
    assert_eq!(invoke_int(&mut vm, "main"), 4);
}

// ===== Scenario: live-stack reload =====

/// Builds a function with unoptimized and optimized code, an IC-bearing call
/// site, and stale type feedback.
fn function_with_feedback(vm: &mut Vm, lib: tern_engine::ObjRef) -> tern_engine::ObjRef {
    let func = vm.new_toplevel_function(lib, "main", FunctionBody::Const(Value::int(4)));
    let unopt = vm.ensure_unoptimized_code(func);

    let ic = vm
        .heap
        .allocate_old(HeapObject::IcData(IcData::new(func, "frobnicate", 1)));
    vm.heap.ic_data_mut(ic).add_target(func);
    vm.heap.function_mut(func).ic_data_table = Some(vec![Some(ic)]);
    vm.heap.function_mut(func).edge_counters = vec![17, 3];
    vm.heap.function_mut(func).usage_counter = 99;
    vm.heap.code_mut(unopt).descriptors.push(PcDescriptor {
        site_id: 0,
        kind: CallSiteKind::IcCall,
    });

    let opt = vm.heap.allocate_old(HeapObject::Code(Code::optimized(func)));
    vm.heap.code_mut(opt).object_pool.push(Value::obj(unopt));
    vm.heap.function_mut(func).code = Some(opt);
    func
}

#[test]
fn test_live_stack_reload() {
    let mut vm = Vm::with_options(VmOptions {
        reload_every: 1,
        ..VmOptions::default()
    });
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    let func = function_with_feedback(&mut vm, lib);
    let opt = vm.heap.function(func).code.unwrap();

    // The function is mid-execution when the stack-overflow check fires.
    vm.stack
        .push(tern_engine::vm::Frame::new(func, Some(opt)));

    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        vm.new_toplevel_function(lib, "main", FunctionBody::Const(Value::int(10)));
        Ok(())
    }));

    assert!(vm.check_stack_overflow());

    // The optimized activation was scheduled for deoptimization and resumes
    // in unoptimized (or lazily recompiled) code.
    let frame = vm.stack.top().unwrap();
    assert!(frame.pending_deopt);

    // The old function belongs to a reloaded library: its feedback and code
    // are gone, so the next entry recompiles against the new topology.
    assert!(vm.heap.function(func).ic_data_table.is_none());
    assert!(vm.heap.function(func).has_stub_code());
    assert_eq!(vm.heap.function(func).edge_counters, vec![0, 0]);
    assert_eq!(vm.heap.function(func).usage_counter, 0);

    // A subsequent call from the same frame dispatches to the new body.
    assert_eq!(invoke_int(&mut vm, "main"), 10);
}

#[test]
fn test_reload_every_optimized_requires_optimized_frame() {
    let mut vm = Vm::with_options(VmOptions {
        reload_every: 1,
        reload_every_optimized: true,
        ..VmOptions::default()
    });
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    let func = vm.new_toplevel_function(lib, "main", FunctionBody::Const(Value::int(4)));
    let unopt = vm.ensure_unoptimized_code(func);
    vm.stack
        .push(tern_engine::vm::Frame::new(func, Some(unopt)));

    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        Ok(())
    }));

    // The top frame is unoptimized, so the trigger stays quiet.
    assert!(!vm.check_stack_overflow());
    assert!(vm.service.events().is_empty());
}

// ===== Scenario: inheritance rearranged =====

#[test]
fn test_inheritance_rearranged() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    let a = vm.new_class(lib, "A");
    let b = vm.new_class(lib, "B");
    vm.heap.class_mut(b).super_class = Some(a);
    vm.ensure_class_finalized(a).unwrap();
    vm.ensure_class_finalized(b).unwrap();

    let a_instance = vm.new_instance(a);
    let b_instance = vm.new_instance(b);
    assert!(!vm.instance_is(a_instance, b));
    assert!(vm.instance_is(b_instance, a));

    // Reload with the hierarchy flipped: A extends B.
    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        let b = vm.new_class(lib, "B");
        let a = vm.new_class(lib, "A");
        vm.heap.class_mut(a).super_class = Some(b);
        Ok(())
    }));

    assert!(vm.reload_sources());

    let root = vm.root_library().unwrap();
    let new_a = vm.find_class(root, "A").unwrap();
    let new_b = vm.find_class(root, "B").unwrap();

    // Pre-existing instances keep their identity and class id, but type
    // tests now reflect the new supertype.
    assert!(vm.instance_is(a_instance, new_a));
    assert!(vm.instance_is(a_instance, new_b));
    assert!(!vm.instance_is(b_instance, new_a));
}

// ===== Scenario: library added and removed =====

fn load_math_program(vm: &mut Vm, with_import: bool) {
    let app = vm.new_library(APP_URL);
    vm.set_root_library(app);
    vm.new_toplevel_function(app, "main", FunctionBody::CallTopLevel("max2".to_string()));
    if with_import {
        let math = vm.new_library(MATH_URL);
        vm.new_toplevel_function(math, "max2", FunctionBody::Const(Value::int(7)));
        vm.add_import(app, math);
    }
}

fn assert_library_indices_consistent(vm: &Vm) {
    for (index, &lib) in vm.object_store.libraries.iter().enumerate() {
        assert_eq!(vm.heap.library(lib).index, index as i64);
    }
}

#[test]
fn test_library_added_and_removed() {
    let mut vm = Vm::new();
    load_math_program(&mut vm, false);
    {
        let root = vm.root_library().unwrap();
        let err = vm.invoke(root, "main").unwrap_err();
        assert!(matches!(err, VmError::NoSuchMethod(name) if name == "max2"));
    }

    // Reload adding the import.
    vm.set_library_tag_handler(Box::new(|vm, _tag, _url| {
        load_math_program(vm, true);
        Ok(())
    }));
    assert!(vm.reload_sources());
    assert_eq!(invoke_int(&mut vm, "main"), 7);
    assert_library_indices_consistent(&vm);

    // Reload removing it again.
    vm.set_library_tag_handler(Box::new(|vm, _tag, _url| {
        load_math_program(vm, false);
        Ok(())
    }));
    assert!(vm.reload_sources());
    {
        let root = vm.root_library().unwrap();
        let err = vm.invoke(root, "main").unwrap_err();
        assert!(matches!(err, VmError::NoSuchMethod(name) if name == "max2"));
    }
    assert_library_indices_consistent(&vm);
}

// ===== Invariants after commit =====

#[test]
fn test_debuggable_bit_preserved() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    vm.heap.library_mut(lib).debuggable = false;

    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        Ok(())
    }));

    assert!(vm.reload_sources());
    let root = vm.root_library().unwrap();
    assert!(!vm.heap.library(root).debuggable);
}

#[test]
fn test_megamorphic_caches_dropped() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    let func = vm.new_toplevel_function(lib, "main", FunctionBody::Const(Value::int(1)));
    let cache = vm
        .heap
        .allocate_old(HeapObject::MegamorphicCache(
            tern_engine::vm::object::MegamorphicCache {
                selector: "frobnicate".to_string(),
                entries: vec![(1, func)],
            },
        ));
    vm.object_store.megamorphic_cache_table.push(cache);

    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        Ok(())
    }));

    assert!(vm.reload_sources());
    assert!(vm.object_store.megamorphic_cache_table.is_empty());
}

#[test]
fn test_clean_library_functions_keep_code_but_lose_feedback() {
    let mut vm = Vm::new();
    let core = vm.find_library("tern:core").unwrap();
    // Give a runtime function compiled code and feedback, as a warm VM has.
    let int_class = vm.object_store.int_class.unwrap();
    let plus = vm.resolve_dynamic(int_class, "+").unwrap();
    let unopt = vm.ensure_unoptimized_code(plus);
    let ic = vm
        .heap
        .allocate_old(HeapObject::IcData(IcData::new(plus, "+", 2)));
    vm.heap.function_mut(plus).ic_data_table = Some(vec![Some(ic)]);
    vm.heap.function_mut(plus).edge_counters = vec![42];

    let app = vm.new_library(APP_URL);
    vm.set_root_library(app);

    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        Ok(())
    }));

    assert!(vm.reload_sources());

    // Clean-library functions keep their unoptimized code; the feedback is
    // replaced by sentinels and the counters are zeroed.
    let func = vm.heap.function(plus);
    assert_eq!(func.code, Some(unopt));
    assert!(func.ic_data_table.is_some());
    assert!(vm.heap.ic_data(ic).has_sentinels);
    assert_eq!(func.edge_counters, vec![0]);
    let _ = core;
}

#[test]
fn test_class_table_compacted_after_commit() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    vm.new_class(lib, "A");
    vm.new_class(lib, "B");
    let num_cids = vm.class_table.num_cids();

    // An identity-shaped reload: same classes, same library.
    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        vm.new_class(lib, "A");
        vm.new_class(lib, "B");
        Ok(())
    }));

    assert!(vm.reload_sources());
    // Replaced classes reuse their old ids; the vacated tail slots are gone.
    assert_eq!(vm.class_table.num_cids(), num_cids);

    let root = vm.root_library().unwrap();
    let a = vm.find_class(root, "A").unwrap();
    assert_eq!(vm.class_table.at(vm.heap.class(a).id), Some(a));
}

#[test]
fn test_new_class_survives_compaction() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    vm.new_class(lib, "A");
    let num_cids = vm.class_table.num_cids();

    // The new program replaces A and adds a brand-new class C.
    vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        vm.new_class(lib, "A");
        vm.new_class(lib, "C");
        Ok(())
    }));

    assert!(vm.reload_sources());
    assert_eq!(vm.class_table.num_cids(), num_cids + 1);

    let root = vm.root_library().unwrap();
    let c = vm.find_class(root, "C").unwrap();
    let c_cid = vm.heap.class(c).id;
    assert_eq!(vm.class_table.at(c_cid), Some(c));
    assert!(c_cid < vm.class_table.num_cids());
}

#[test]
fn test_pre_reload_classes_resolvable_during_parse() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    let a = vm.new_class(lib, "A");
    let a_cid = vm.heap.class(a).id;

    vm.set_library_tag_handler(Box::new(move |vm, _tag, url| {
        let lib = vm.new_library(url);
        vm.set_root_library(lib);
        vm.new_class(lib, "A");
        // A GC-time heap walk during the parse step must still resolve the
        // pre-reload class for existing instances.
        assert_eq!(vm.get_class_for_heap_walk_at(a_cid), Some(a));
        Ok(())
    }));

    assert!(vm.reload_sources());
    // After the reload the class table serves lookups again.
    assert!(vm.get_class_for_heap_walk_at(a_cid).is_some());
}

// ===== Inline-cache reset policy =====

#[test]
fn test_dynamic_ic_reset_reseeds_int_fast_path() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    let func = vm.new_toplevel_function(lib, "main", FunctionBody::Const(Value::int(1)));

    let ic = vm
        .heap
        .allocate_old(HeapObject::IcData(IcData::new(func, "+", 2)));
    vm.heap.ic_data_mut(ic).add_target(func); // stale feedback

    tern_engine::vm::ic::reset(&mut vm, ic, false);

    let int_class = vm.object_store.int_class.unwrap();
    let int_cid = vm.heap.class(int_class).id;
    let int_plus = vm.resolve_dynamic(int_class, "+").unwrap();
    let entries = &vm.heap.ic_data(ic).entries;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].class_ids.as_slice(), &[int_cid, int_cid]);
    assert_eq!(entries[0].target, int_plus);
}

#[test]
fn test_dynamic_ic_reset_clears_other_selectors() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    let func = vm.new_toplevel_function(lib, "main", FunctionBody::Const(Value::int(1)));

    let ic = vm
        .heap
        .allocate_old(HeapObject::IcData(IcData::new(func, "frobnicate", 2)));
    vm.heap.ic_data_mut(ic).add_target(func);

    tern_engine::vm::ic::reset(&mut vm, ic, false);
    assert!(vm.heap.ic_data(ic).entries.is_empty());
}

#[test]
fn test_static_ic_reset_rebinds_to_current_resolution() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    let cls = vm.new_class(lib, "A");
    let old_target = vm.new_static_method(cls, "helper", FunctionBody::Const(Value::int(1)));
    let ic = vm
        .heap
        .allocate_old(HeapObject::IcData(IcData::new(old_target, "helper", 0)));
    vm.heap.ic_data_mut(ic).add_target(old_target);

    // The class now declares a different function for the selector.
    vm.heap.class_mut(cls).functions.clear();
    let new_target = vm.new_static_method(cls, "helper", FunctionBody::Const(Value::int(2)));

    tern_engine::vm::ic::reset(&mut vm, ic, true);

    let entries = &vm.heap.ic_data(ic).entries;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].target, new_target);
}

#[test]
fn test_static_ic_reset_leaves_missing_target_unbound() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    let cls = vm.new_class(lib, "A");
    let old_target = vm.new_static_method(cls, "helper", FunctionBody::Const(Value::int(1)));
    let ic = vm
        .heap
        .allocate_old(HeapObject::IcData(IcData::new(old_target, "helper", 0)));
    vm.heap.ic_data_mut(ic).add_target(old_target);

    // The selector no longer resolves.
    vm.heap.class_mut(cls).functions.clear();

    tern_engine::vm::ic::reset(&mut vm, ic, true);
    assert!(vm.heap.ic_data(ic).entries.is_empty());
}

#[test]
fn test_super_call_site_left_for_natural_reresolution() {
    let mut vm = Vm::new();
    let lib = vm.new_library(APP_URL);
    vm.set_root_library(lib);
    let cls = vm.new_class(lib, "A");
    // A static-call site whose recorded target is an instance method is a
    // super call.
    let target = vm.new_method(cls, "render", FunctionBody::Const(Value::int(1)));
    let ic = vm
        .heap
        .allocate_old(HeapObject::IcData(IcData::new(target, "render", 0)));
    vm.heap.ic_data_mut(ic).add_target(target);

    tern_engine::vm::ic::reset(&mut vm, ic, true);

    // The site keeps its recorded target until it naturally re-resolves.
    let entries = &vm.heap.ic_data(ic).entries;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].target, target);
}
