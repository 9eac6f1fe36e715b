//! VM context: the isolated runtime instance
//!
//! A [`Vm`] owns one heap, class table, object store, and call stack. It is
//! the surface the external loader calls into when registering libraries,
//! classes, and functions, and it hosts the reload driver entry points
//! (`start_reload` / `finish_reload` / `abort_reload`).

use crate::vm::class_table::ClassTable;
use crate::vm::heap::{Heap, ObjRef};
use crate::vm::object::{
    Class, ClassId, Code, Field, Finalization, Function, FunctionBody, HeapObject, Instance,
    Library, Script, Str, StrPiece,
};
use crate::vm::object_store::ObjectStore;
use crate::vm::reload::{ReloadContext, ReloadError};
use crate::vm::safepoint::SafepointCoordinator;
use crate::vm::service::{ServiceEvent, ServiceEventLog};
use crate::vm::stack::Stack;
use crate::vm::value::Value;
use crate::vm::{VmError, VmResult};
use std::sync::Arc;

/// Tags passed to the library tag handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryTag {
    /// Load the root script
    Script,
}

/// Callback invoked to load program source into the VM
///
/// During a reload this is the external parser: it receives the root library
/// URL and registers the new program through the loader API. It is the only
/// step of a reload that may suspend or fail recoverably.
pub type LibraryTagHandler = Box<dyn FnMut(&mut Vm, LibraryTag, &str) -> VmResult<()>>;

/// VM configuration flags
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Print human-readable reload progress to the runtime log
    pub trace_reload: bool,
    /// Expect an identity reload to preserve class and library counts;
    /// mismatches are logged
    pub identity_reload: bool,
    /// Trigger a reload every N stack-overflow checks (fuzzing aid; 0 = off)
    pub reload_every: usize,
    /// Restrict the `reload_every` trigger to optimized frames
    pub reload_every_optimized: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            trace_reload: false,
            identity_reload: false,
            reload_every: 0,
            reload_every_optimized: false,
        }
    }
}

/// URL of the bootstrap runtime library
pub const CORE_LIBRARY_URL: &str = "tern:core";

/// An isolated runtime instance
pub struct Vm {
    /// The object heap
    pub heap: Heap,
    /// The class table
    pub class_table: ClassTable,
    /// Well-known roots
    pub object_store: ObjectStore,
    /// The call stack
    pub stack: Stack,
    /// Configuration flags
    pub options: VmOptions,
    /// Safepoint coordinator
    pub safepoint: Arc<SafepointCoordinator>,
    /// Service event log
    pub service: ServiceEventLog,

    library_tag_handler: Option<LibraryTagHandler>,
    reload: Option<Box<ReloadContext>>,
    class_finalization_blocked: bool,
    background_compiler_disabled: bool,
    stack_check_count: u64,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Create a VM with default options
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    /// Create a VM with the given options
    pub fn with_options(options: VmOptions) -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            class_table: ClassTable::new(),
            object_store: ObjectStore::new(),
            stack: Stack::new(),
            options,
            safepoint: Arc::new(SafepointCoordinator::new()),
            service: ServiceEventLog::new(),
            library_tag_handler: None,
            reload: None,
            class_finalization_blocked: false,
            background_compiler_disabled: false,
            stack_check_count: 0,
        };
        vm.bootstrap();
        vm
    }

    /// Register the runtime's own library and the integer class. Bootstrap
    /// objects are runtime-internal: clean, never reloaded, never forwarded.
    fn bootstrap(&mut self) {
        let core = self.new_library(CORE_LIBRARY_URL);
        self.heap.mark_vm_internal(core);

        let int_class = self.new_class(core, "Int");
        self.heap.mark_vm_internal(int_class);
        for op in ["+", "-", "==", "<"] {
            let func = self.new_method(int_class, op, FunctionBody::Unset);
            self.heap.mark_vm_internal(func);
        }
        self.ensure_class_finalized(int_class)
            .expect("bootstrap class finalization cannot fail");
        self.object_store.int_class = Some(int_class);
    }

    // ------------------------------------------------------------------
    // Loader API: the surface the external parser registers programs with
    // ------------------------------------------------------------------

    /// Create a library and append it to the live library list
    pub fn new_library(&mut self, url: impl Into<String>) -> ObjRef {
        let mut library = Library::new(url);
        library.index = self.object_store.libraries.len() as i64;
        let r = self.heap.allocate_old(HeapObject::Library(library));
        self.object_store.libraries.push(r);
        r
    }

    /// Set the program's root library
    pub fn set_root_library(&mut self, library: ObjRef) {
        self.object_store.root_library = Some(library);
    }

    /// The program's root library
    pub fn root_library(&self) -> Option<ObjRef> {
        self.object_store.root_library
    }

    /// Create a script object
    pub fn new_script(&mut self, url: impl Into<String>, source: impl Into<String>) -> ObjRef {
        self.heap.allocate_old(HeapObject::Script(Script {
            url: url.into(),
            source: source.into(),
        }))
    }

    /// Create a class in `library` and register it in the class table
    pub fn new_class(&mut self, library: ObjRef, name: impl Into<String>) -> ObjRef {
        let mut class = Class::new(name);
        class.library = Some(library);
        let r = self.heap.allocate_old(HeapObject::Class(class));
        self.class_table.register(&mut self.heap, r);
        self.heap.library_mut(library).classes.push(r);
        r
    }

    /// Declare an instance field on `class`
    pub fn add_instance_field(&mut self, class: ObjRef, name: impl Into<String>) -> ObjRef {
        let field = Field {
            name: name.into(),
            owner: class,
            is_static: false,
            static_value: Value::null(),
        };
        let r = self.heap.allocate_old(HeapObject::Field(field));
        self.heap.class_mut(class).fields.push(r);
        r
    }

    /// Declare a static field on `class` with an initial value
    pub fn add_static_field(
        &mut self,
        class: ObjRef,
        name: impl Into<String>,
        value: Value,
    ) -> ObjRef {
        let field = Field {
            name: name.into(),
            owner: class,
            is_static: true,
            static_value: value,
        };
        let r = self.heap.allocate_old(HeapObject::Field(field));
        self.heap.class_mut(class).fields.push(r);
        r
    }

    /// Create a top-level function in `library`
    pub fn new_toplevel_function(
        &mut self,
        library: ObjRef,
        name: impl Into<String>,
        body: FunctionBody,
    ) -> ObjRef {
        let mut function = Function::new(name, library);
        function.is_static = true;
        function.body = body;
        let r = self.heap.allocate_old(HeapObject::Function(function));
        self.heap.library_mut(library).functions.push(r);
        r
    }

    /// Create an instance method on `class`
    pub fn new_method(
        &mut self,
        class: ObjRef,
        name: impl Into<String>,
        body: FunctionBody,
    ) -> ObjRef {
        let mut function = Function::new(name, class);
        function.body = body;
        let r = self.heap.allocate_old(HeapObject::Function(function));
        self.heap.class_mut(class).functions.push(r);
        r
    }

    /// Create a static method on `class`
    pub fn new_static_method(
        &mut self,
        class: ObjRef,
        name: impl Into<String>,
        body: FunctionBody,
    ) -> ObjRef {
        let r = self.new_method(class, name, body);
        self.heap.function_mut(r).is_static = true;
        r
    }

    /// Add an import edge from `library` to `imported`
    pub fn add_import(&mut self, library: ObjRef, imported: ObjRef) {
        self.heap.library_mut(library).imports.push(imported);
    }

    /// Allocate a string in the young generation
    pub fn new_string(&mut self, value: impl Into<String>) -> Value {
        let r = self.heap.allocate(HeapObject::Str(Str {
            value: value.into(),
        }));
        Value::obj(r)
    }

    /// Allocate an instance of a finalized class
    pub fn new_instance(&mut self, class: ObjRef) -> ObjRef {
        let (cid, field_count) = {
            let cls = self.heap.class(class);
            assert!(
                cls.is_finalized(),
                "cannot allocate instance of unfinalized class {}",
                cls.name
            );
            (cls.id, self.num_instance_fields(class))
        };
        self.heap
            .allocate(HeapObject::Instance(Instance::new(cid, field_count)))
    }

    // ------------------------------------------------------------------
    // Class layout
    // ------------------------------------------------------------------

    /// Block class finalization (held across the reload tag handler)
    pub fn block_class_finalization(&mut self) {
        self.class_finalization_blocked = true;
    }

    /// Unblock class finalization
    pub fn unblock_class_finalization(&mut self) {
        self.class_finalization_blocked = false;
    }

    /// Number of instance fields of `class`, including inherited ones
    pub fn num_instance_fields(&self, class: ObjRef) -> usize {
        let mut count = 0;
        let mut current = Some(class);
        while let Some(c) = current {
            let cls = self.heap.class(c);
            count += cls
                .fields
                .iter()
                .filter(|&&f| !self.heap.field(f).is_static)
                .count();
            current = cls.super_class;
        }
        count
    }

    /// Field at every instance offset, superclass fields first
    pub fn offset_to_field_map(&self, class: ObjRef) -> Vec<ObjRef> {
        let mut chain = Vec::new();
        let mut current = Some(class);
        while let Some(c) = current {
            chain.push(c);
            current = self.heap.class(c).super_class;
        }
        let mut map = Vec::new();
        for &c in chain.iter().rev() {
            for &f in &self.heap.class(c).fields {
                if !self.heap.field(f).is_static {
                    map.push(f);
                }
            }
        }
        map
    }

    /// Finalize `class`: compute its instance layout
    pub fn ensure_class_finalized(&mut self, class: ObjRef) -> VmResult<()> {
        debug_assert!(
            !self.class_finalization_blocked,
            "class finalization is blocked"
        );
        if self.heap.class(class).is_finalized() {
            return Ok(());
        }
        // Guard against a cyclic superclass chain.
        let mut depth = 0;
        let mut current = self.heap.class(class).super_class;
        while let Some(c) = current {
            depth += 1;
            if depth > 256 {
                return Err(VmError::FinalizationError {
                    class: self.heap.class(class).name.clone(),
                    reason: "superclass chain does not terminate".to_string(),
                });
            }
            current = self.heap.class(c).super_class;
        }
        let instance_fields = self.num_instance_fields(class);
        let cls = self.heap.class_mut(class);
        cls.instance_size = 1 + instance_fields + cls.num_native_fields;
        cls.finalization = Finalization::Finalized;
        Ok(())
    }

    /// Mark `class` prefinalized with a fixed instance size
    pub fn prefinalize_class(&mut self, class: ObjRef, instance_size: usize) {
        let cls = self.heap.class_mut(class);
        cls.instance_size = instance_size;
        cls.finalization = Finalization::Prefinalized;
    }

    // ------------------------------------------------------------------
    // Lookup and dispatch
    // ------------------------------------------------------------------

    /// Find a live library by URL
    pub fn find_library(&self, url: &str) -> Option<ObjRef> {
        self.object_store
            .libraries
            .iter()
            .copied()
            .find(|&lib| self.heap.library(lib).url == url)
    }

    /// Find a class by name in `library`
    pub fn find_class(&self, library: ObjRef, name: &str) -> Option<ObjRef> {
        self.heap
            .library(library)
            .classes
            .iter()
            .copied()
            .find(|&c| self.heap.class(c).name == name)
    }

    /// Look up a static function declared directly on `class`
    pub fn lookup_static_function(&self, class: ObjRef, selector: &str) -> Option<ObjRef> {
        self.heap
            .class(class)
            .functions
            .iter()
            .copied()
            .find(|&f| {
                let func = self.heap.function(f);
                func.is_static && func.name == selector
            })
    }

    /// Resolve a dynamic selector on `class`, walking the superclass chain
    pub fn resolve_dynamic(&self, class: ObjRef, selector: &str) -> Option<ObjRef> {
        let mut current = Some(class);
        while let Some(c) = current {
            let cls = self.heap.class(c);
            let found = cls.functions.iter().copied().find(|&f| {
                let func = self.heap.function(f);
                !func.is_static && func.name == selector
            });
            if found.is_some() {
                return found;
            }
            current = cls.super_class;
        }
        None
    }

    /// Resolve a top-level function in `library` or its direct imports
    pub fn resolve_toplevel(&self, library: ObjRef, name: &str) -> Option<ObjRef> {
        let lib = self.heap.library(library);
        let own = lib
            .functions
            .iter()
            .copied()
            .find(|&f| self.heap.function(f).name == name);
        if own.is_some() {
            return own;
        }
        for &import in &lib.imports {
            let found = self
                .heap
                .library(import)
                .functions
                .iter()
                .copied()
                .find(|&f| self.heap.function(f).name == name);
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// The class a function belongs to, resolving through patch records
    pub fn function_owner_class(&self, function: ObjRef) -> Option<ObjRef> {
        let owner = self.heap.function(function).owner;
        match self.heap.get(owner) {
            HeapObject::Class(_) => Some(owner),
            HeapObject::Patch(patch) => Some(patch.wrapped),
            _ => None,
        }
    }

    /// The library a function belongs to, resolving through its owner
    pub fn function_owning_library(&self, function: ObjRef) -> Option<ObjRef> {
        let owner = self.heap.function(function).owner;
        match self.heap.get(owner) {
            HeapObject::Library(_) => Some(owner),
            HeapObject::Class(class) => class.library,
            HeapObject::Patch(patch) => self.heap.class(patch.wrapped).library,
            _ => None,
        }
    }

    /// Whether `instance` satisfies a type test against `class`
    pub fn instance_is(&self, instance: ObjRef, class: ObjRef) -> bool {
        let cid = self.heap.instance(instance).cid;
        let mut current = self.class_table.at(cid);
        while let Some(c) = current {
            if c == class {
                return true;
            }
            current = self.heap.class(c).super_class;
        }
        false
    }

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    /// Invoke a top-level function by name in `library`
    pub fn invoke(&mut self, library: ObjRef, name: &str) -> VmResult<Value> {
        let function = self
            .resolve_toplevel(library, name)
            .ok_or_else(|| VmError::NoSuchMethod(name.to_string()))?;
        self.invoke_function(function)
    }

    /// Invoke a function object directly
    pub fn invoke_function(&mut self, function: ObjRef) -> VmResult<Value> {
        let code = self.heap.function(function).code;
        self.stack.push(crate::vm::stack::Frame::new(function, code));
        let result = self.evaluate_body(function);
        self.stack.pop();
        self.heap.function_mut(function).usage_counter += 1;
        result
    }

    fn evaluate_body(&mut self, function: ObjRef) -> VmResult<Value> {
        let body = self.heap.function(function).body.clone();
        match body {
            FunctionBody::Unset => Ok(Value::null()),
            FunctionBody::Const(v) => Ok(v),
            FunctionBody::StaticField(field) => Ok(self.heap.field(field).static_value),
            FunctionBody::CallTopLevel(name) => {
                let library = self
                    .function_owning_library(function)
                    .ok_or_else(|| VmError::NoSuchMethod(name.clone()))?;
                let target = self
                    .resolve_toplevel(library, &name)
                    .ok_or_else(|| VmError::NoSuchMethod(name.clone()))?;
                self.invoke_function(target)
            }
            FunctionBody::Concat(pieces) => {
                let mut out = String::new();
                for piece in pieces {
                    match piece {
                        StrPiece::Lit(s) => out.push_str(&s),
                        StrPiece::Static(field) => {
                            let v = self.heap.field(field).static_value;
                            out.push_str(&self.display(v));
                        }
                        StrPiece::Call(name) => {
                            let library = self
                                .function_owning_library(function)
                                .ok_or_else(|| VmError::NoSuchMethod(name.clone()))?;
                            let target = self
                                .resolve_toplevel(library, &name)
                                .ok_or_else(|| VmError::NoSuchMethod(name.clone()))?;
                            let v = self.invoke_function(target)?;
                            out.push_str(&self.display(v));
                        }
                    }
                }
                Ok(self.new_string(out))
            }
        }
    }

    /// Human-readable rendering of a value
    pub fn display(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Obj(r) => match self.heap.get(r) {
                HeapObject::Str(s) => s.value.clone(),
                HeapObject::Instance(i) => {
                    let name = self
                        .class_table
                        .at(i.cid)
                        .map(|c| self.heap.class(c).name.clone())
                        .unwrap_or_else(|| "?".to_string());
                    format!("Instance of '{name}'")
                }
                other => format!("<{}>", other.kind_name()),
            },
        }
    }

    // ------------------------------------------------------------------
    // Code management
    // ------------------------------------------------------------------

    /// Ensure `function` has compiled unoptimized code to fall back to
    pub fn ensure_unoptimized_code(&mut self, function: ObjRef) -> ObjRef {
        if let Some(code) = self.heap.function(function).unoptimized_code {
            return code;
        }
        let code = self
            .heap
            .allocate_old(HeapObject::Code(Code::unoptimized(function)));
        let func = self.heap.function_mut(function);
        func.unoptimized_code = Some(code);
        if func.code.is_none() {
            func.code = Some(code);
        }
        code
    }

    /// Switch every frame's function to compiled unoptimized code
    pub fn switch_stack_to_unoptimized_code(&mut self) {
        let functions: Vec<ObjRef> = self.stack.frames().map(|f| f.function).collect();
        for function in functions {
            self.ensure_unoptimized_code(function);
        }
    }

    /// Stack-overflow check hook; drives the `reload_every` fuzzing trigger.
    /// Returns whether a reload was triggered.
    pub fn check_stack_overflow(&mut self) -> bool {
        self.stack_check_count += 1;
        let every = self.options.reload_every as u64;
        if every == 0 || self.stack_check_count % every != 0 {
            return false;
        }
        if self.options.reload_every_optimized {
            let top_optimized = self
                .stack
                .top()
                .map(|f| f.is_optimized(&self.heap))
                .unwrap_or(false);
            if !top_optimized {
                return false;
            }
        }
        if self.reload.is_some() || self.library_tag_handler.is_none() {
            return false;
        }
        self.reload_sources();
        true
    }

    /// Whether the background compiler is currently disabled
    pub fn is_background_compiler_disabled(&self) -> bool {
        self.background_compiler_disabled
    }

    /// Disable the background compiler
    pub(crate) fn disable_background_compiler(&mut self) {
        self.background_compiler_disabled = true;
    }

    /// Re-enable the background compiler
    pub(crate) fn enable_background_compiler(&mut self) {
        self.background_compiler_disabled = false;
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Visit every non-heap root reference: object store, class table, and
    /// stack. The active reload context's roots are visited separately.
    pub fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        self.object_store.visit_pointers(visitor);
        self.class_table.visit_pointers(visitor);
        self.stack.visit_pointers(visitor);
    }

    // ------------------------------------------------------------------
    // Reload entry points
    // ------------------------------------------------------------------

    /// Install the library tag handler
    pub fn set_library_tag_handler(&mut self, handler: LibraryTagHandler) {
        self.library_tag_handler = Some(handler);
    }

    /// Whether a reload is currently in progress
    pub fn reload_in_progress(&self) -> bool {
        self.reload.is_some()
    }

    /// Borrow the active reload context, if any
    pub fn reload_context(&self) -> Option<&ReloadContext> {
        self.reload.as_deref()
    }

    /// Run a closure with the active reload context temporarily taken out of
    /// the VM, so both can be borrowed mutably
    pub(crate) fn with_reload<R>(
        &mut self,
        f: impl FnOnce(&mut ReloadContext, &mut Vm) -> R,
    ) -> R {
        let mut ctx = self.reload.take().expect("no reload in progress");
        let result = f(&mut ctx, self);
        self.reload = Some(ctx);
        result
    }

    /// Begin a reload: checkpoint state and invoke the external parser.
    ///
    /// Only one reload may be active at a time; concurrent requests must be
    /// serialized by the caller.
    pub fn start_reload(&mut self) {
        assert!(
            self.reload.is_none(),
            "only one reload may be active per runtime instance"
        );
        let root_lib_url = self
            .object_store
            .root_library
            .map(|lib| self.heap.library(lib).url.clone())
            .unwrap_or_default();
        if self.options.trace_reload {
            tracing::debug!(url = %root_lib_url, "starting reload");
        }

        // Switch all functions on the stack to compiled, unoptimized code.
        self.switch_stack_to_unoptimized_code();

        let mut ctx = ReloadContext::new(root_lib_url.clone());
        ctx.checkpoint(self);
        // Clear the compile-time constants cache.
        self.object_store.compile_time_constants.clear();
        self.reload = Some(Box::new(ctx));

        // Block class finalization attempts while calling into the library
        // tag handler.
        self.block_class_finalization();
        let result = match self.library_tag_handler.take() {
            Some(mut handler) => {
                let r = handler(self, LibraryTag::Script, &root_lib_url);
                self.library_tag_handler = Some(handler);
                r
            }
            None => Err(VmError::NoTagHandler),
        };
        self.unblock_class_finalization();

        if let Err(err) = result {
            self.with_reload(|ctx, vm| ctx.report_error(vm, ReloadError::Parse(err.to_string())));
        }
    }

    /// Finish the reload started by [`Vm::start_reload`]: build mappings,
    /// validate, and commit or roll back. Returns whether the reload
    /// succeeded.
    pub fn finish_reload(&mut self) -> bool {
        let mut ctx = self.reload.take().expect("finish_reload without start_reload");
        ctx.finish(self)
    }

    /// Abort an in-progress reload with an error
    pub fn abort_reload(&mut self, error: ReloadError) {
        let mut ctx = self.reload.take().expect("abort_reload without start_reload");
        ctx.report_error(self, error);
        ctx.rollback(self);
    }

    /// Run a complete reload cycle; returns whether it succeeded
    pub fn reload_sources(&mut self) -> bool {
        self.start_reload();
        self.finish_reload()
    }

    /// The original class a new class replaced, for debugger/inspector use
    pub fn find_original_class(&self, replacement_or_new: ObjRef) -> Option<ObjRef> {
        self.reload
            .as_ref()
            .and_then(|ctx| ctx.find_original_class(self, replacement_or_new))
    }

    /// Resolve a class id to a class during a heap walk: while a reload is in
    /// progress, resolves to the pre-reload class
    pub fn get_class_for_heap_walk_at(&self, cid: ClassId) -> Option<ObjRef> {
        if let Some(ctx) = self.reload.as_ref() {
            if let Some(saved) = ctx.saved_class_at(cid) {
                return Some(saved);
            }
        }
        self.class_table.at(cid)
    }

    /// Publish a service event
    pub(crate) fn publish_event(&mut self, event: ServiceEvent) {
        self.service.handle_event(event);
    }
}
