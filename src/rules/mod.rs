//! The polymorphic rule set: each rule is a value exposing a closed
//! set of optional hooks rather than a deep inheritance hierarchy.

pub mod capability;
pub mod dynamic_load;
pub mod encoding;
pub mod exfil;
pub mod reflection;

use crate::bytecode::{Instruction, MethodDef, MethodRef, ParsedModule};
use crate::context::ScanContext;
use crate::model::{Finding, MethodSignals};
pub use crate::model::Severity;

/// A rule value. Every hook has a no-op default so a rule only overrides the
/// capabilities it actually uses.
pub trait Rule: Send + Sync {
    fn rule_id(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn severity(&self) -> Severity;

    fn requires_companion_finding(&self) -> bool {
        false
    }

    fn developer_guidance(&self) -> Option<&'static str> {
        None
    }

    /// Cheap predicate run during the per-instruction pass to decide whether
    /// `analyze_contextual_pattern` is worth invoking for this call site.
    fn is_suspicious(&self, _call: &MethodRef) -> bool {
        false
    }

    fn analyze_instructions(
        &self,
        _module: &ParsedModule,
        _method: &MethodDef,
        _instructions: &[Instruction],
        _signals: &mut MethodSignals,
        _ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        Vec::new()
    }

    fn analyze_contextual_pattern(
        &self,
        _module: &ParsedModule,
        _method: &MethodDef,
        _instructions: &[Instruction],
        _index: usize,
        _signals: &mut MethodSignals,
        _ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        Vec::new()
    }

    fn analyze_assembly_metadata(&self, _module: &ParsedModule, _ctx: &mut ScanContext) -> Vec<Finding> {
        Vec::new()
    }

    fn post_analysis_refine(
        &self,
        _module: &ParsedModule,
        _existing_findings: &[Finding],
        _ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        Vec::new()
    }
}

/// The fixed, declaration-ordered set of rules applied to every scan. Built
/// once; rules are stateless values, iterated in the same order every time
/// so output stays deterministic.
pub struct RuleRegistry {
    pub rules: Vec<Box<dyn Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(capability::ProcessStartRule),
                Box::new(capability::Shell32Rule),
                Box::new(capability::RegistryRule),
                Box::new(capability::DllImportRule),
                Box::new(capability::EnvironmentPathRule),
                Box::new(capability::PersistenceRule),
                Box::new(encoding::Base64Rule),
                Box::new(encoding::HexStringRule),
                Box::new(encoding::EncodedStringLiteralRule),
                Box::new(encoding::EncodedStringPipelineRule),
                Box::new(encoding::EncodedBlobSplittingRule),
                Box::new(encoding::ByteArrayManipulationRule),
                Box::new(exfil::DataExfiltrationRule),
                Box::new(exfil::DataInfiltrationRule),
                Box::new(reflection::ReflectionRule),
                Box::new(dynamic_load::AssemblyDynamicLoadRule),
                Box::new(dynamic_load::LoadFromStreamRule),
            ],
        }
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Rule ids whose base finding is strong enough to promote a method to deep
/// analysis ("seed rule").
pub const SEED_RULE_IDS: &[&str] = &[
    "DllImportRule",
    "ProcessStartRule",
    "Shell32Rule",
    "AssemblyDynamicLoadRule",
    "ReflectionRule",
    "EnvironmentPathRule",
    "Base64Rule",
    "HexStringRule",
    "EncodedStringLiteralRule",
    "EncodedStringPipelineRule",
    "EncodedBlobSplittingRule",
    "ByteArrayManipulationRule",
    "PersistenceRule",
    "DataExfiltrationRule",
    "DataInfiltrationRule",
];
