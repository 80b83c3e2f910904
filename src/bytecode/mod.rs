//! Read-only view over a parsed managed module: instructions, methods, types,
//! resources and P/Invoke info. The concrete parser lives outside this crate;
//! everything here is the narrow interface the analysis pipeline consumes.

mod instruction;
mod module;

pub use instruction::{FieldRef, Instruction, MethodRef, Opcode, Operand, TokenRef, TypeRef};
pub use module::{
    EntryPointProvider, EventDef, ExceptionHandler, ExceptionHandlerKind, MethodDef, ModuleParser,
    ParsedModule, PInvokeInfo, PropertyDef, Resource, ResolverProvider, TypeDef, VariableDef,
};

/// Fully-qualified location of a finding: `Namespace.Type.Method:ILOffset`,
/// `Namespace.Type:0`, or an assembly-level pseudo-location.
pub fn format_location(fq_type: &str, method: &str, offset: u32) -> String {
    format!("{fq_type}.{method}:{offset}")
}

pub fn format_type_location(fq_type: &str) -> String {
    format!("{fq_type}:0")
}
