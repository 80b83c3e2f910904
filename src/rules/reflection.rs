//! Reflective-dispatch rule. The decision matrix itself lives in
//! [`crate::reflection_detector`]; this rule drives it from the
//! per-instruction pass and stages undecided sites for type-level
//! promotion.

use crate::bytecode::{Instruction, MethodDef, MethodRef, ParsedModule};
use crate::context::ScanContext;
use crate::model::{Finding, MethodSignals, Severity};
use crate::reflection_detector::{self, ReflectionDecision};

use super::Rule;

const REFLECTION_SINKS: &[(&str, &str)] = &[
    ("System.Reflection.MethodInfo", "Invoke"),
    ("System.Reflection.MethodBase", "Invoke"),
    ("System.Delegate", "DynamicInvoke"),
    ("System.Activator", "CreateInstance"),
    ("System.Type", "GetMethod"),
    ("System.Type", "GetProperty"),
    ("System.Type", "GetField"),
    ("System.Type", "InvokeMember"),
    ("System.Type", "GetTypeFromProgID"),
    ("System.Type", "GetTypeFromCLSID"),
    ("System.Reflection.Assembly", "GetType"),
    ("System.Reflection.Assembly", "CreateInstance"),
];

pub struct ReflectionRule;

impl Rule for ReflectionRule {
    fn rule_id(&self) -> &'static str {
        "ReflectionRule"
    }

    fn description(&self) -> &'static str {
        "Reflection-based dispatch"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn requires_companion_finding(&self) -> bool {
        true
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        REFLECTION_SINKS
            .iter()
            .any(|(t, n)| *t == call.declaring_type && *n == call.name)
    }

    fn analyze_contextual_pattern(
        &self,
        module: &ParsedModule,
        method: &MethodDef,
        instructions: &[Instruction],
        index: usize,
        signals: &mut MethodSignals,
        ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        let decision = reflection_detector::analyze_reflection_site(module, method, instructions, index, signals);
        signals.suspicious_reflection = true;

        match decision {
            ReflectionDecision::Bypass(finding) | ReflectionDecision::NonLiteralTarget(finding) => {
                signals.mark_rule_triggered(self.rule_id());
                vec![finding]
            }
            ReflectionDecision::Pending => {
                let offset = instructions[index].offset;
                let pending = Finding::new(
                    format!("{}:{offset}", method.full_name()),
                    "Reflective dispatch with an unresolved target".to_string(),
                    Severity::Low,
                )
                .with_rule_id(self.rule_id());
                ctx.pending_reflection
                    .entry(method.declaring_type.clone())
                    .or_default()
                    .push(pending);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Opcode, Operand};
    use crate::config::ScanConfig;

    fn empty_module() -> ParsedModule {
        ParsedModule {
            assembly_name: "Test".into(),
            assembly_version: "1.0.0.0".into(),
            module_name: "Test.dll".into(),
            types: vec![],
            resources: vec![],
            module_refs: vec![],
            pinvoke_decls: vec![],
            custom_attributes: vec![],
        }
    }

    fn empty_method() -> MethodDef {
        MethodDef {
            name: "M".into(),
            declaring_type: "X.Y".into(),
            param_count: 0,
            has_this: false,
            returns_void: true,
            instructions: None,
            locals: vec![],
            exception_handlers: vec![],
            is_static_constructor: false,
        }
    }

    #[test]
    fn non_literal_target_in_clean_method_is_staged_pending_not_emitted() {
        let module = empty_module();
        let method = empty_method();
        let seq = vec![
            Instruction::new(0, Opcode::LdLoc(0), Operand::None),
            Instruction::new(
                1,
                Opcode::CallVirt,
                Operand::Method(MethodRef {
                    declaring_type: "System.Type".into(),
                    name: "GetMethod".into(),
                    param_count: 1,
                    has_this: true,
                    returns_void: false,
                }),
            ),
        ];
        let mut signals = MethodSignals::default();
        let mut ctx = ScanContext::new(ScanConfig::default());
        let findings = ReflectionRule.analyze_contextual_pattern(&module, &method, &seq, 1, &mut signals, &mut ctx);
        assert!(findings.is_empty());
        assert_eq!(ctx.pending_reflection.get("X.Y").map(Vec::len), Some(1));
        assert!(signals.suspicious_reflection);
    }

    #[test]
    fn pending_reflection_is_staged_on_type_key() {
        let module = empty_module();
        let method = empty_method();
        let seq = vec![
            Instruction::new(0, Opcode::LdStr, Operand::String("ToString".into())),
            Instruction::new(
                1,
                Opcode::CallVirt,
                Operand::Method(MethodRef {
                    declaring_type: "System.Type".into(),
                    name: "GetMethod".into(),
                    param_count: 1,
                    has_this: true,
                    returns_void: false,
                }),
            ),
        ];
        let mut signals = MethodSignals::default();
        let mut ctx = ScanContext::new(ScanConfig::default());
        let findings = ReflectionRule.analyze_contextual_pattern(&module, &method, &seq, 1, &mut signals, &mut ctx);
        assert!(findings.is_empty());
        assert_eq!(ctx.pending_reflection.get("X.Y").map(Vec::len), Some(1));
        assert!(signals.suspicious_reflection);
    }
}
