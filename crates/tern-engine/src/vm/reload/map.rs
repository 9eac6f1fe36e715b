//! Structural identity keys for reload mappings
//!
//! Old and new program entities are paired by structural identity, not object
//! identity: a library by its URL, a class by its simple name under its
//! library's URL, a field by its name under its owning class id. The key is a
//! tagged enum whose hashing and equality are defined per variant.

use crate::vm::heap::{Heap, ObjRef};
use crate::vm::object::{ClassId, HeapObject};

/// Structural identity of a reloadable entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// A library, identified by URL
    Library {
        /// The library URL
        url: String,
    },
    /// A class, identified by simple name and owning library URL
    Class {
        /// Simple class name
        name: String,
        /// Owning library URL, empty when the class has no library
        library_url: String,
    },
    /// A field, identified by name and owning class id
    Field {
        /// Field name
        name: String,
        /// Owning class id
        class_id: ClassId,
    },
}

impl EntityKey {
    /// Structural key of a library
    pub fn for_library(heap: &Heap, library: ObjRef) -> Self {
        EntityKey::Library {
            url: heap.library(library).url.clone(),
        }
    }

    /// Structural key of a class
    pub fn for_class(heap: &Heap, class: ObjRef) -> Self {
        let cls = heap.class(class);
        let library_url = cls
            .library
            .map(|lib| heap.library(lib).url.clone())
            .unwrap_or_default();
        EntityKey::Class {
            name: cls.name.clone(),
            library_url,
        }
    }

    /// Structural key of a field, under its owning class id
    pub fn for_field(heap: &Heap, field: ObjRef) -> Self {
        let f = heap.field(field);
        let class_id = match heap.get(f.owner) {
            HeapObject::Class(cls) => cls.id,
            HeapObject::Patch(patch) => heap.class(patch.wrapped).id,
            _ => crate::vm::object::ILLEGAL_CID,
        };
        EntityKey::Field {
            name: f.name.clone(),
            class_id,
        }
    }
}

/// A matched (replacement, original) pair
///
/// `replacement == original` means the entity is new and has no predecessor.
#[derive(Debug, Clone, Copy)]
pub struct MappedPair {
    /// The entity from the new program
    pub replacement: ObjRef,
    /// The entity it replaces, or itself when new
    pub original: ObjRef,
}

impl MappedPair {
    /// Whether this pair actually replaces an old entity
    pub fn is_replacement(&self) -> bool {
        self.replacement != self.original
    }
}
