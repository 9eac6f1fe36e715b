//! Tern Runtime Engine
//!
//! This crate provides the Tern virtual machine runtime:
//! - **Object model**: classes, libraries, fields, functions, and compiled code
//!   (`vm::object` module)
//! - **Heap**: slot-indexed heap with object and pointer visitors (`vm::heap` module)
//! - **Reload**: transactional live program reload (`vm::reload` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use tern_engine::vm::{Vm, LibraryTag};
//!
//! let mut vm = Vm::new();
//! let lib = vm.new_library("file:///app.tern");
//! vm.set_root_library(lib);
//!
//! // ... register classes and functions through the loader API ...
//!
//! vm.set_library_tag_handler(Box::new(|vm, _tag, url| {
//!     // load the new version of `url` into the VM
//!     Ok(())
//! }));
//! let ok = vm.reload_sources();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// VM module: heap, object model, class table, stack, and live reload
pub mod vm;

pub use vm::{Vm, VmError, VmOptions, VmResult};
pub use vm::heap::{Generation, Heap, ObjRef};
pub use vm::object::{Class, Field, Function, FunctionBody, Library};
pub use vm::reload::ReloadError;
pub use vm::value::Value;
