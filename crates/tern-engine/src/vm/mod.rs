//! Tern VM Core Runtime
//!
//! This module provides the virtual machine runtime including:
//! - Value representation and object model
//! - Slot-indexed heap with object/pointer visitors
//! - Class table and object store (well-known roots)
//! - Call stack and inline-cache data
//! - Safepoint coordination
//! - Transactional live program reload

pub mod class_table;
pub mod context;
pub mod heap;
pub mod ic;
pub mod object;
pub mod object_store;
pub mod reload;
pub mod safepoint;
pub mod service;
pub mod stack;
pub mod value;

pub use class_table::ClassTable;
pub use context::{LibraryTag, LibraryTagHandler, Vm, VmOptions};
pub use heap::{Generation, Heap, HeapIterationScope, ObjRef};
pub use ic::{IcData, IcEntry};
pub use object::{
    Class, Code, Field, Finalization, Function, FunctionBody, HeapObject, Instance, Library,
    PatchClass, Script, StrPiece,
};
pub use object_store::ObjectStore;
pub use reload::{ReloadContext, ReloadError};
pub use safepoint::{NoSafepointScope, SafepointCoordinator, SafepointOperationScope, StopReason};
pub use service::{ServiceEvent, ServiceEventKind};
pub use stack::{Frame, Stack};
pub use value::Value;

/// VM execution errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    /// Lookup of a top-level function failed
    #[error("No such method: {0}")]
    NoSuchMethod(String),

    /// A program load (initial or reload) failed
    #[error("Load error: {0}")]
    LoadError(String),

    /// No library tag handler is installed on the VM
    #[error("No library tag handler installed")]
    NoTagHandler,

    /// Class finalization failed
    #[error("Class finalization failed for {class}: {reason}")]
    FinalizationError {
        /// Name of the class that could not be finalized
        class: String,
        /// What went wrong
        reason: String,
    },

    /// Reload-specific failure
    #[error(transparent)]
    Reload(#[from] reload::ReloadError),
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
