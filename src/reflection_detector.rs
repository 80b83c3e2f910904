//! Resolves the target of a reflective dispatch call and decides whether it
//! is immediately suspicious, suspicious only in context, or not yet
//! decidable.

use crate::bytecode::{Instruction, MethodDef, ParsedModule};
use crate::model::{Finding, MethodSignals, Severity};
use crate::resolver;
use crate::snippet::build_snippet;
use crate::strings;

const SENSITIVE_TARGET_NAMES: &[&str] = &[
    "Start",
    "ShellExecute",
    "Shell",
    "cmd.exe",
    "powershell.exe",
    "wscript.exe",
    "Shell.Application",
];

pub enum ReflectionDecision {
    /// Literal target name names a sensitive identifier: emit now.
    Bypass(Finding),
    /// Non-literal target, but other signals already indicate suspicion.
    NonLiteralTarget(Finding),
    /// Nothing decidable yet; caller should stage this for later type-level
    /// promotion.
    Pending,
}

pub fn analyze_reflection_site(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    index: usize,
    signals: &MethodSignals,
) -> ReflectionDecision {
    let target = resolver::resolve_argument(module, method, instructions, index, 1);
    let offset = instructions[index].offset;
    let location = format!("{}:{offset}", method.full_name());

    if target.is_concrete_literal {
        let decoded = strings::try_decode(&target.text);
        let candidate = decoded.as_deref().unwrap_or(&target.text);
        let is_sensitive = SENSITIVE_TARGET_NAMES
            .iter()
            .any(|n| candidate.eq_ignore_ascii_case(n))
            || strings::is_shell_host_literal(candidate);
        if is_sensitive {
            return ReflectionDecision::Bypass(
                Finding::new(
                    location,
                    format!("Potential reflection bypass targeting \"{candidate}\""),
                    Severity::High,
                )
                .with_rule_id("ReflectionRule")
                .with_bypass_companion(true)
                .with_snippet(build_snippet(instructions, index, 1)),
            );
        }
        return ReflectionDecision::Pending;
    }

    if signals.signal_count() > 0 {
        return ReflectionDecision::NonLiteralTarget(
            Finding::new(
                location,
                "Reflective dispatch with a non-literal target method name".to_string(),
                Severity::High,
            )
            .with_rule_id("ReflectionRule")
            .with_snippet(build_snippet(instructions, index, 1)),
        );
    }

    ReflectionDecision::Pending
}
