//! Heap for runtime objects
//!
//! The heap is slot-indexed: an [`ObjRef`] names a slot, and the object living
//! in that slot can be replaced in place. That is what makes identity
//! forwarding possible: a dead object's slot is overlaid with a forwarding
//! corpse of the same recorded size, the heap stays walkable, and every
//! pointer to the slot can be redirected with a single indirection.
//!
//! Slots carry a generation (young or old) assigned at allocation; program
//! entities are allocated old. Bootstrap objects are additionally marked
//! runtime-internal and are never eligible for forwarding.

use crate::vm::object::{ForwardingCorpse, HeapObject};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A reference to a heap object: an index into the heap's slots
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

impl ObjRef {
    /// Build a reference from a slot index
    #[inline]
    pub fn from_index(index: usize) -> Self {
        ObjRef(index as u32)
    }

    /// The slot index this reference names
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({})", self.0)
    }
}

/// Heap generation of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Young space: freshly allocated instances and strings
    Young,
    /// Old space: program entities and tenured objects
    Old,
}

/// One heap slot
#[derive(Debug, Clone)]
struct Slot {
    object: HeapObject,
    /// Size in words, recorded at allocation and preserved by corpse overlay
    size: usize,
    generation: Generation,
    /// Runtime-internal objects (bootstrap) are never forwarded
    vm_internal: bool,
}

/// The object heap
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    /// Count of open iteration scopes; allocation is forbidden while nonzero
    iterations: Arc<AtomicUsize>,
}

/// RAII scope marking a heap iteration in progress
///
/// Allocation would invalidate the walk, so [`Heap::allocate`] panics while
/// any iteration scope is open.
#[must_use]
pub struct HeapIterationScope {
    iterations: Arc<AtomicUsize>,
}

impl HeapIterationScope {
    /// Open an iteration scope on `heap`
    pub fn new(heap: &Heap) -> Self {
        heap.iterations.fetch_add(1, Ordering::AcqRel);
        Self {
            iterations: Arc::clone(&heap.iterations),
        }
    }
}

impl Drop for HeapIterationScope {
    fn drop(&mut self) {
        let prev = self.iterations.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }
}

impl Heap {
    /// Create an empty heap
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots ever allocated
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the heap has no allocations
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Allocate an object in the young generation
    pub fn allocate(&mut self, object: HeapObject) -> ObjRef {
        self.allocate_in(object, Generation::Young)
    }

    /// Allocate an object in the old generation
    pub fn allocate_old(&mut self, object: HeapObject) -> ObjRef {
        self.allocate_in(object, Generation::Old)
    }

    fn allocate_in(&mut self, object: HeapObject, generation: Generation) -> ObjRef {
        assert_eq!(
            self.iterations.load(Ordering::Acquire),
            0,
            "cannot allocate during a heap iteration"
        );
        let size = object.size_words();
        let r = ObjRef::from_index(self.slots.len());
        self.slots.push(Slot {
            object,
            size,
            generation,
            vm_internal: false,
        });
        r
    }

    /// Mark an object as runtime-internal (never forwarded)
    pub fn mark_vm_internal(&mut self, r: ObjRef) {
        self.slots[r.index()].vm_internal = true;
    }

    /// Whether an object is runtime-internal
    pub fn is_vm_internal(&self, r: ObjRef) -> bool {
        self.slots[r.index()].vm_internal
    }

    /// Generation of an allocation
    pub fn generation(&self, r: ObjRef) -> Generation {
        self.slots[r.index()].generation
    }

    /// Recorded size in words of an allocation
    pub fn size_of(&self, r: ObjRef) -> usize {
        self.slots[r.index()].size
    }

    /// Whether `r` names a valid slot
    pub fn contains(&self, r: ObjRef) -> bool {
        r.index() < self.slots.len()
    }

    /// Borrow the object at `r`
    #[inline]
    pub fn get(&self, r: ObjRef) -> &HeapObject {
        &self.slots[r.index()].object
    }

    /// Mutably borrow the object at `r`
    #[inline]
    pub fn get_mut(&mut self, r: ObjRef) -> &mut HeapObject {
        &mut self.slots[r.index()].object
    }

    /// Whether the object at `r` is a forwarding corpse
    #[inline]
    pub fn is_corpse(&self, r: ObjRef) -> bool {
        self.get(r).is_corpse()
    }

    /// Overlay a forwarding corpse on the object at `r`, preserving its
    /// recorded size so the heap remains iterable
    pub fn make_corpse(&mut self, r: ObjRef, next: ObjRef) {
        let slot = &mut self.slots[r.index()];
        let size = slot.size;
        slot.object = HeapObject::Corpse(ForwardingCorpse { size, next });
        debug_assert_eq!(slot.size, slot.object.size_words());
    }

    /// The forwarding target of the corpse at `r`, if `r` is a corpse
    pub fn corpse_target(&self, r: ObjRef) -> Option<ObjRef> {
        match self.get(r) {
            HeapObject::Corpse(corpse) => Some(corpse.next),
            _ => None,
        }
    }

    /// Visit every object in the heap, corpses included
    pub fn visit_objects(&self, visitor: &mut dyn FnMut(ObjRef, &HeapObject)) {
        for (index, slot) in self.slots.iter().enumerate() {
            visitor(ObjRef::from_index(index), &slot.object);
        }
    }

    /// Visit every pointer slot of every heap object
    pub fn visit_object_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        for slot in &mut self.slots {
            slot.object.visit_pointers(visitor);
        }
    }
}

// Typed accessors. A kind mismatch is an engine invariant violation and
// panics rather than propagating.
macro_rules! typed_accessors {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        impl Heap {
            #[doc = concat!("Borrow the ", stringify!($variant), " at `r`; panics on kind mismatch")]
            #[inline]
            pub fn $get(&self, r: ObjRef) -> &$ty {
                match self.get(r) {
                    HeapObject::$variant(inner) => inner,
                    other => panic!(
                        "expected {} at {:?}, found {}",
                        stringify!($variant),
                        r,
                        other.kind_name()
                    ),
                }
            }

            #[doc = concat!("Mutably borrow the ", stringify!($variant), " at `r`; panics on kind mismatch")]
            #[inline]
            pub fn $get_mut(&mut self, r: ObjRef) -> &mut $ty {
                match self.get_mut(r) {
                    HeapObject::$variant(inner) => inner,
                    other => panic!(
                        "expected {} at {:?}, found {}",
                        stringify!($variant),
                        r,
                        other.kind_name()
                    ),
                }
            }
        }
    };
}

typed_accessors!(class, class_mut, Class, crate::vm::object::Class);
typed_accessors!(library, library_mut, Library, crate::vm::object::Library);
typed_accessors!(field, field_mut, Field, crate::vm::object::Field);
typed_accessors!(function, function_mut, Function, crate::vm::object::Function);
typed_accessors!(code, code_mut, Code, crate::vm::object::Code);
typed_accessors!(ic_data, ic_data_mut, IcData, crate::vm::ic::IcData);
typed_accessors!(instance, instance_mut, Instance, crate::vm::object::Instance);
typed_accessors!(string, string_mut, Str, crate::vm::object::Str);
typed_accessors!(patch, patch_mut, Patch, crate::vm::object::PatchClass);
typed_accessors!(
    type_arguments,
    type_arguments_mut,
    TypeArguments,
    crate::vm::object::TypeArguments
);
