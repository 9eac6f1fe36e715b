//! Inline-cache data and the per-site reset policy
//!
//! Unoptimized code records type feedback per call site in [`IcData`]. Across
//! a reload the class topology changes, so the feedback must be discarded;
//! the reset policy decides, per site kind, what survives:
//!
//! - **Static calls** are rebound by re-resolving the selector as a static
//!   function on the same class; an absent or no-longer-static target leaves
//!   the site unbound for natural re-resolution.
//! - **Super calls** (a recorded static target that is not a static function)
//!   cannot be safely rebound and are left alone.
//! - **Dynamic calls** are cleared, then the two-argument integer fast path
//!   for `+`, `-`, and `==` is re-seeded.

use crate::vm::context::Vm;
use crate::vm::heap::ObjRef;
use crate::vm::object::ClassId;
use smallvec::SmallVec;

/// Selectors whose two-argument integer fast path is re-seeded after a reset
const INT_FAST_PATH_SELECTORS: [&str; 3] = ["+", "-", "=="];

/// One resolved entry in an inline cache
#[derive(Debug, Clone)]
pub struct IcEntry {
    /// Class ids of the tested arguments
    pub class_ids: SmallVec<[ClassId; 2]>,
    /// Target function for those classes
    pub target: ObjRef,
}

/// Per-call-site inline cache data
#[derive(Debug, Clone)]
pub struct IcData {
    /// The function this call site belongs to
    pub owner: ObjRef,
    /// The selector called at this site
    pub target_name: String,
    /// Number of arguments whose classes are tested
    pub num_args_tested: usize,
    /// Recorded feedback entries
    pub entries: Vec<IcEntry>,
    /// Whether the entries were replaced by sentinels (no stale feedback)
    pub has_sentinels: bool,
}

impl IcData {
    /// Create empty cache data for a call site
    pub fn new(owner: ObjRef, target_name: impl Into<String>, num_args_tested: usize) -> Self {
        Self {
            owner,
            target_name: target_name.into(),
            num_args_tested,
            entries: Vec::new(),
            has_sentinels: false,
        }
    }

    /// Record a feedback entry
    pub fn add_check(&mut self, class_ids: SmallVec<[ClassId; 2]>, target: ObjRef) {
        self.entries.push(IcEntry { class_ids, target });
    }

    /// Record a target with no tested classes (static call entry)
    pub fn add_target(&mut self, target: ObjRef) {
        self.entries.push(IcEntry {
            class_ids: SmallVec::new(),
            target,
        });
    }

    /// Drop all recorded feedback
    pub fn reset_data(&mut self) {
        self.entries.clear();
        self.has_sentinels = false;
    }

    /// Replace feedback with sentinel values: the site keeps its shape but
    /// carries no type information
    pub fn fill_with_sentinels(&mut self) {
        self.entries.clear();
        self.has_sentinels = true;
    }

    /// Visit owner and entry targets
    pub fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        visitor(&mut self.owner);
        for entry in &mut self.entries {
            visitor(&mut entry.target);
        }
    }
}

/// Reset one call site according to the reload reset policy
pub fn reset(vm: &mut Vm, ic_ref: ObjRef, is_static_call: bool) {
    if is_static_call {
        reset_static_call(vm, ic_ref);
    } else {
        reset_dynamic_call(vm, ic_ref);
    }
}

fn reset_static_call(vm: &mut Vm, ic_ref: ObjRef) {
    let Some(old_target) = vm.heap.ic_data(ic_ref).entries.first().map(|e| e.target) else {
        return;
    };
    if !vm.heap.function(old_target).is_static {
        // A static-call site whose recorded target is an instance function is
        // a super call; it cannot be rebound here.
        if vm.options.trace_reload {
            tracing::debug!(
                selector = %vm.heap.ic_data(ic_ref).target_name,
                "cannot rebind super-call site"
            );
        }
        return;
    }
    let selector = vm.heap.ic_data(ic_ref).target_name.clone();
    let Some(owner_class) = vm.function_owner_class(old_target) else {
        return;
    };
    match vm.lookup_static_function(owner_class, &selector) {
        Some(new_target) => {
            let ic = vm.heap.ic_data_mut(ic_ref);
            ic.reset_data();
            ic.add_target(new_target);
        }
        None => {
            // The selector no longer resolves to a static function; leave
            // the site unbound and let the next invocation re-resolve.
            vm.heap.ic_data_mut(ic_ref).reset_data();
            if vm.options.trace_reload {
                tracing::debug!(selector = %selector, "cannot rebind static call");
            }
        }
    }
}

fn reset_dynamic_call(vm: &mut Vm, ic_ref: ObjRef) {
    vm.heap.ic_data_mut(ic_ref).reset_data();

    // Restore the static prediction that +, -, and == have integer receiver
    // and argument.
    let (num_args, selector) = {
        let ic = vm.heap.ic_data(ic_ref);
        (ic.num_args_tested, ic.target_name.clone())
    };
    if num_args != 2 || !INT_FAST_PATH_SELECTORS.contains(&selector.as_str()) {
        return;
    }
    let Some(int_class) = vm.object_store.int_class else {
        return;
    };
    let Some(int_op_target) = vm.resolve_dynamic(int_class, &selector) else {
        return;
    };
    let int_cid = vm.heap.class(int_class).id;
    let mut class_ids = SmallVec::new();
    class_ids.push(int_cid);
    class_ids.push(int_cid);
    vm.heap
        .ic_data_mut(ic_ref)
        .add_check(class_ids, int_op_target);
}
