use super::instruction::Instruction;

/// A parsed module as handed to the core by the external metadata/bytecode
/// parser. The core never mutates this tree; it only walks it.
#[derive(Debug, Clone)]
pub struct ParsedModule {
    pub assembly_name: String,
    pub assembly_version: String,
    pub module_name: String,
    pub types: Vec<TypeDef>,
    pub resources: Vec<Resource>,
    pub module_refs: Vec<String>,
    pub pinvoke_decls: Vec<PInvokeInfo>,
    pub custom_attributes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    pub nested_types: Vec<TypeDef>,
    pub methods: Vec<MethodDef>,
    pub properties: Vec<PropertyDef>,
    pub events: Vec<EventDef>,
    pub custom_attributes: Vec<String>,
}

impl TypeDef {
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub declaring_type: String,
    pub param_count: u16,
    pub has_this: bool,
    pub returns_void: bool,
    /// `None` for abstract/extern/P-Invoke methods with no body.
    pub instructions: Option<Vec<Instruction>>,
    pub locals: Vec<VariableDef>,
    pub exception_handlers: Vec<ExceptionHandler>,
    pub is_static_constructor: bool,
}

impl MethodDef {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.declaring_type, self.name)
    }

    pub fn instructions(&self) -> &[Instruction] {
        self.instructions.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone)]
pub struct VariableDef {
    pub index: u16,
    pub type_name: String,
}

#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    pub kind: ExceptionHandlerKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
    pub catch_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionHandlerKind {
    Catch,
    Finally,
    Filter,
    Fault,
}

#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub getter: Option<usize>,
    pub setter: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct EventDef {
    pub name: String,
    pub add: Option<usize>,
    pub remove: Option<usize>,
    pub invoke: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PInvokeInfo {
    pub declaring_type: String,
    pub method_name: String,
    pub dll_name: String,
    pub entry_point: String,
}

impl PInvokeInfo {
    pub fn method_full_name(&self) -> String {
        format!("{}.{}", self.declaring_type, self.method_name)
    }
}

/// Supplied by the host; yields a parsed module for a given module file.
/// The core never calls this directly — `scan()` is handed an already
/// parsed module — but the type is part of the stable collaborator surface.
pub trait ModuleParser: Send + Sync {
    fn parse(&self, file_name: &str) -> anyhow::Result<ParsedModule>;
}

/// `is_entry_point` classifies a method as a program/lifecycle entry point
/// for call-chain promotion. The default implementation recognizes
/// static constructors and common mod-framework/engine lifecycle hooks.
pub trait EntryPointProvider: Send + Sync {
    fn is_entry_point(&self, method: &MethodDef) -> bool;
}

pub struct DefaultEntryPointProvider;

const LIFECYCLE_METHOD_NAMES: &[&str] = &[
    "OnMelonAwake",
    "OnInitializeMelon",
    "Awake",
    "Start",
    "OnEnable",
];

impl EntryPointProvider for DefaultEntryPointProvider {
    fn is_entry_point(&self, method: &MethodDef) -> bool {
        method.is_static_constructor || LIFECYCLE_METHOD_NAMES.contains(&method.name.as_str())
    }
}

/// Produces a module-level reference resolver handed to the parser.
/// The core passes this through without ever invoking it itself.
pub trait ResolverProvider: Send + Sync {
    fn build_resolver(&self) -> Box<dyn std::any::Any + Send + Sync>;
}
