//! Object model and class system
//!
//! Every runtime entity lives in the heap as a [`HeapObject`] variant. Program
//! entities (classes, libraries, fields, functions, code) reference each other
//! through [`ObjRef`] slots; those slots are what the garbage collector traces
//! and what identity forwarding rewrites.

use crate::vm::heap::ObjRef;
use crate::vm::ic::IcData;
use crate::vm::value::Value;

/// Numeric class identifier: an index into the class table
pub type ClassId = usize;

/// Reserved class id 0: no valid class
pub const ILLEGAL_CID: ClassId = 0;

/// A heap-allocated runtime object
#[derive(Debug, Clone)]
pub enum HeapObject {
    /// Class metadata
    Class(Class),
    /// Library metadata
    Library(Library),
    /// Field metadata (instance or static)
    Field(Field),
    /// Function metadata
    Function(Function),
    /// Compiled code
    Code(Code),
    /// Per-call-site inline cache data
    IcData(IcData),
    /// An instance of a class
    Instance(Instance),
    /// A source script
    Script(Script),
    /// Synthetic owner for entities displaced by a reload
    Patch(PatchClass),
    /// A heap-allocated string
    Str(Str),
    /// A canonical type-argument vector
    TypeArguments(TypeArguments),
    /// A megamorphic call-site cache
    MegamorphicCache(MegamorphicCache),
    /// A forwarding corpse left behind by identity forwarding
    Corpse(ForwardingCorpse),
}

impl HeapObject {
    /// Short name of the object kind, for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::Class(_) => "Class",
            HeapObject::Library(_) => "Library",
            HeapObject::Field(_) => "Field",
            HeapObject::Function(_) => "Function",
            HeapObject::Code(_) => "Code",
            HeapObject::IcData(_) => "IcData",
            HeapObject::Instance(_) => "Instance",
            HeapObject::Script(_) => "Script",
            HeapObject::Patch(_) => "Patch",
            HeapObject::Str(_) => "Str",
            HeapObject::TypeArguments(_) => "TypeArguments",
            HeapObject::MegamorphicCache(_) => "MegamorphicCache",
            HeapObject::Corpse(_) => "Corpse",
        }
    }

    /// Whether this object is a forwarding corpse
    #[inline]
    pub fn is_corpse(&self) -> bool {
        matches!(self, HeapObject::Corpse(_))
    }

    /// Approximate footprint in words, recorded at allocation time
    pub fn size_words(&self) -> usize {
        match self {
            HeapObject::Class(c) => 8 + c.fields.len() + c.functions.len(),
            HeapObject::Library(l) => {
                6 + l.imports.len() + l.classes.len() + l.functions.len()
            }
            HeapObject::Field(_) => 4,
            HeapObject::Function(_) => 8,
            HeapObject::Code(c) => 4 + c.object_pool.len() + c.descriptors.len(),
            HeapObject::IcData(ic) => 4 + ic.entries.len() * 3,
            HeapObject::Instance(i) => 1 + i.fields.len(),
            HeapObject::Script(_) => 3,
            HeapObject::Patch(_) => 3,
            HeapObject::Str(s) => 1 + s.value.len().div_ceil(8),
            HeapObject::TypeArguments(t) => 1 + t.cids.len(),
            HeapObject::MegamorphicCache(m) => 2 + m.entries.len() * 2,
            HeapObject::Corpse(c) => c.size,
        }
    }

    /// Visit every embedded heap reference
    pub fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        match self {
            HeapObject::Class(c) => c.visit_pointers(visitor),
            HeapObject::Library(l) => l.visit_pointers(visitor),
            HeapObject::Field(f) => f.visit_pointers(visitor),
            HeapObject::Function(f) => f.visit_pointers(visitor),
            HeapObject::Code(c) => c.visit_pointers(visitor),
            HeapObject::IcData(ic) => ic.visit_pointers(visitor),
            HeapObject::Instance(i) => i.visit_pointers(visitor),
            HeapObject::Patch(p) => p.visit_pointers(visitor),
            HeapObject::MegamorphicCache(m) => m.visit_pointers(visitor),
            // Scripts, strings, and type-argument vectors hold no references.
            // A corpse's `next` is the forwarding target itself and is never
            // rewritten.
            HeapObject::Script(_)
            | HeapObject::Str(_)
            | HeapObject::TypeArguments(_)
            | HeapObject::Corpse(_) => {}
        }
    }
}

/// Class finalization state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    /// Freshly loaded, layout not computed
    None,
    /// Layout size fixed ahead of full finalization
    Prefinalized,
    /// Fully finalized: field offsets assigned
    Finalized,
}

/// Class definition metadata
#[derive(Debug, Clone)]
pub struct Class {
    /// Class id (index into the class table)
    pub id: ClassId,
    /// Simple name
    pub name: String,
    /// Owning library
    pub library: Option<ObjRef>,
    /// Super class
    pub super_class: Option<ObjRef>,
    /// Source script
    pub script: Option<ObjRef>,
    /// Declared fields (instance and static)
    pub fields: Vec<ObjRef>,
    /// Declared functions
    pub functions: Vec<ObjRef>,
    /// Canonical constant instances of this class
    pub canonical_constants: Vec<Value>,
    /// Finalization state
    pub finalization: Finalization,
    /// Instance size in words (valid once prefinalized or finalized)
    pub instance_size: usize,
    /// Number of native fields embedded in instances
    pub num_native_fields: usize,
    /// Whether this class is an enum declaration
    pub is_enum: bool,
}

impl Class {
    /// Create a new unfinalized class
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ILLEGAL_CID,
            name: name.into(),
            library: None,
            super_class: None,
            script: None,
            fields: Vec::new(),
            functions: Vec::new(),
            canonical_constants: Vec::new(),
            finalization: Finalization::None,
            instance_size: 0,
            num_native_fields: 0,
            is_enum: false,
        }
    }

    /// Whether this class is finalized
    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalization == Finalization::Finalized
    }

    /// Whether this class is prefinalized
    #[inline]
    pub fn is_prefinalized(&self) -> bool {
        self.finalization == Finalization::Prefinalized
    }

    fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        if let Some(r) = self.library.as_mut() {
            visitor(r);
        }
        if let Some(r) = self.super_class.as_mut() {
            visitor(r);
        }
        if let Some(r) = self.script.as_mut() {
            visitor(r);
        }
        for r in &mut self.fields {
            visitor(r);
        }
        for r in &mut self.functions {
            visitor(r);
        }
        for v in &mut self.canonical_constants {
            v.visit_pointer(visitor);
        }
    }
}

/// Library metadata
#[derive(Debug, Clone)]
pub struct Library {
    /// URL identifying the library
    pub url: String,
    /// Index in the global library list, or -1 when not in the live list
    pub index: i64,
    /// Whether this library belongs to the runtime's own namespace
    pub is_runtime: bool,
    /// Whether the debugger may stop in this library
    pub debuggable: bool,
    /// Imported libraries
    pub imports: Vec<ObjRef>,
    /// Classes declared in this library
    pub classes: Vec<ObjRef>,
    /// Top-level functions declared in this library
    pub functions: Vec<ObjRef>,
}

/// URL scheme marking libraries in the runtime's own namespace
pub const RUNTIME_SCHEME: &str = "tern:";

impl Library {
    /// Create a new library; runtime status is derived from the URL scheme
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let is_runtime = url.starts_with(RUNTIME_SCHEME);
        Self {
            url,
            index: -1,
            is_runtime,
            debuggable: true,
            imports: Vec::new(),
            classes: Vec::new(),
            functions: Vec::new(),
        }
    }

    fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        for r in &mut self.imports {
            visitor(r);
        }
        for r in &mut self.classes {
            visitor(r);
        }
        for r in &mut self.functions {
            visitor(r);
        }
    }
}

/// Field metadata
#[derive(Debug, Clone)]
pub struct Field {
    /// Field name
    pub name: String,
    /// Owning class, library, or patch record
    pub owner: ObjRef,
    /// Whether the field is static
    pub is_static: bool,
    /// Current value, if static
    pub static_value: Value,
}

impl Field {
    fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        visitor(&mut self.owner);
        self.static_value.visit_pointer(visitor);
    }
}

/// A piece of a string-building function body
#[derive(Debug, Clone)]
pub enum StrPiece {
    /// A literal string fragment
    Lit(String),
    /// The result of calling a top-level function, by name
    Call(String),
    /// The value of a captured static field
    Static(ObjRef),
}

/// The executable body of a function
///
/// A tiny evaluable form standing in for compiled bytecode: enough to invoke
/// functions, read static state, and follow calls across libraries. Bodies
/// embed heap references, so a body that captured a static-field object is
/// retargeted by identity forwarding exactly like a live closure.
#[derive(Debug, Clone)]
pub enum FunctionBody {
    /// No body installed yet
    Unset,
    /// Return a constant value
    Const(Value),
    /// Return the value of a static field
    StaticField(ObjRef),
    /// Call a top-level function by name in the owning library (or its
    /// imports) and return its result
    CallTopLevel(String),
    /// Build a string from the given pieces
    Concat(Vec<StrPiece>),
}

impl FunctionBody {
    fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        match self {
            FunctionBody::StaticField(r) => visitor(r),
            FunctionBody::Concat(pieces) => {
                for piece in pieces {
                    if let StrPiece::Static(r) = piece {
                        visitor(r);
                    }
                }
            }
            FunctionBody::Unset | FunctionBody::Const(_) | FunctionBody::CallTopLevel(_) => {}
        }
    }
}

/// Function metadata
#[derive(Debug, Clone)]
pub struct Function {
    /// Function name (its selector)
    pub name: String,
    /// Owning class, library, or patch record
    pub owner: ObjRef,
    /// Whether this is a static function
    pub is_static: bool,
    /// Executable body
    pub body: FunctionBody,
    /// Currently installed code; `None` means the lazy-compile stub
    pub code: Option<ObjRef>,
    /// Compiled unoptimized code, if any
    pub unoptimized_code: Option<ObjRef>,
    /// Inline-cache data, indexed by call-site id
    pub ic_data_table: Option<Vec<Option<ObjRef>>>,
    /// Per-block edge execution counters
    pub edge_counters: Vec<u32>,
    /// Invocation counter driving optimization decisions
    pub usage_counter: u32,
    /// Number of times this function was deoptimized
    pub deoptimization_counter: u32,
    /// Instruction count of the optimized code
    pub optimized_instruction_count: u32,
    /// Call-site count of the optimized code
    pub optimized_call_site_count: u32,
}

impl Function {
    /// Create a new function with an unset body
    pub fn new(name: impl Into<String>, owner: ObjRef) -> Self {
        Self {
            name: name.into(),
            owner,
            is_static: false,
            body: FunctionBody::Unset,
            code: None,
            unoptimized_code: None,
            ic_data_table: None,
            edge_counters: Vec::new(),
            usage_counter: 0,
            deoptimization_counter: 0,
            optimized_instruction_count: 0,
            optimized_call_site_count: 0,
        }
    }

    /// Whether the function is currently bound to the lazy-compile stub
    #[inline]
    pub fn has_stub_code(&self) -> bool {
        self.code.is_none()
    }

    /// Switch to unoptimized code if compiled, else to the lazy-compile stub
    pub fn switch_to_lazy_compiled_unoptimized_code(&mut self) {
        self.code = self.unoptimized_code;
    }

    /// Drop all code so the next invocation recompiles
    pub fn clear_code(&mut self) {
        self.code = None;
        self.unoptimized_code = None;
    }

    /// Drop the inline-cache data table
    pub fn clear_ic_data_table(&mut self) {
        self.ic_data_table = None;
    }

    /// Zero all edge counters
    pub fn zero_edge_counters(&mut self) {
        for counter in &mut self.edge_counters {
            *counter = 0;
        }
    }

    fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        visitor(&mut self.owner);
        if let Some(r) = self.code.as_mut() {
            visitor(r);
        }
        if let Some(r) = self.unoptimized_code.as_mut() {
            visitor(r);
        }
        if let Some(table) = self.ic_data_table.as_mut() {
            for slot in table.iter_mut().flatten() {
                visitor(slot);
            }
        }
        self.body.visit_pointers(visitor);
    }
}

/// Kind of a call site described by a PC descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSiteKind {
    /// Instance call through an inline cache
    IcCall,
    /// Static call from unoptimized code
    UnoptStaticCall,
    /// Any other descriptor kind
    Other,
}

/// A PC descriptor: maps a call site in code to its inline-cache slot
#[derive(Debug, Clone, Copy)]
pub struct PcDescriptor {
    /// Call-site id, an index into the owning function's IC data table
    pub site_id: usize,
    /// Kind of call site
    pub kind: CallSiteKind,
}

/// Compiled code
#[derive(Debug, Clone)]
pub struct Code {
    /// Function this code belongs to
    pub owner: ObjRef,
    /// Whether this is optimized code
    pub is_optimized: bool,
    /// Object pool: constants and code references used by this code.
    /// Optimized code references its unoptimized counterpart here.
    pub object_pool: Vec<Value>,
    /// PC descriptors for the call sites in this code
    pub descriptors: Vec<PcDescriptor>,
}

impl Code {
    /// Create unoptimized code for `owner`
    pub fn unoptimized(owner: ObjRef) -> Self {
        Self {
            owner,
            is_optimized: false,
            object_pool: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    /// Create optimized code for `owner`
    pub fn optimized(owner: ObjRef) -> Self {
        Self {
            owner,
            is_optimized: true,
            object_pool: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        visitor(&mut self.owner);
        for v in &mut self.object_pool {
            v.visit_pointer(visitor);
        }
    }
}

/// An instance of a class
///
/// The class id is embedded in the instance header; the class itself is
/// resolved through the class table, which is what keeps instances valid
/// across an id-stable class replacement.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Class id of this instance
    pub cid: ClassId,
    /// Field values, ordered by field offset
    pub fields: Vec<Value>,
}

impl Instance {
    /// Create an instance with null fields
    pub fn new(cid: ClassId, field_count: usize) -> Self {
        Self {
            cid,
            fields: vec![Value::null(); field_count],
        }
    }

    fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        for v in &mut self.fields {
            v.visit_pointer(visitor);
        }
    }
}

/// A source script
#[derive(Debug, Clone)]
pub struct Script {
    /// Script URL
    pub url: String,
    /// Source text
    pub source: String,
}

/// Synthetic owner attached to old functions and fields during a reload so
/// they retain their original script for debuggers and surviving closures
#[derive(Debug, Clone)]
pub struct PatchClass {
    /// The class these entities were declared in
    pub wrapped: ObjRef,
    /// The script they were compiled from
    pub script: Option<ObjRef>,
}

impl PatchClass {
    fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        visitor(&mut self.wrapped);
        if let Some(r) = self.script.as_mut() {
            visitor(r);
        }
    }
}

/// A heap-allocated string
#[derive(Debug, Clone)]
pub struct Str {
    /// String contents
    pub value: String,
}

/// A canonical type-argument vector, keyed on class ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeArguments {
    /// Class ids of the argument types
    pub cids: Vec<ClassId>,
}

impl TypeArguments {
    /// Hash of the vector; depends on the class ids and must be recomputed
    /// whenever ids are reassigned
    pub fn hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = rustc_hash::FxHasher::default();
        self.cids.hash(&mut hasher);
        hasher.finish()
    }
}

/// A megamorphic call-site cache
#[derive(Debug, Clone)]
pub struct MegamorphicCache {
    /// Selector this cache serves
    pub selector: String,
    /// Resolved (class id, target function) pairs
    pub entries: Vec<(ClassId, ObjRef)>,
}

impl MegamorphicCache {
    fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        for (_, target) in &mut self.entries {
            visitor(target);
        }
    }
}

/// In-place overlay on a dead object: records the size of the original so the
/// heap remains walkable, and the replacement so pointer rewriting is a single
/// indirection
#[derive(Debug, Clone, Copy)]
pub struct ForwardingCorpse {
    /// Size in words of the object this corpse replaced
    pub size: usize,
    /// The replacement object
    pub next: ObjRef,
}
