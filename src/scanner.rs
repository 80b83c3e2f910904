//! Drives the rule set over one parsed module: per-method instruction pass,
//! local-variable pass, exception-handler pass, property/event-accessor
//! pass, companion gating, and type-level reflection promotion.
//! The method/type/assembly passes themselves are plain synchronous
//! functions called in order by [`crate::assembly_scanner::scan`]; this
//! module owns none of the scan-scoped state, only the traversal.

use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::bytecode::{
    EventDef, ExceptionHandlerKind, Instruction, MethodDef, Opcode, Operand, ParsedModule,
    PropertyDef, TypeDef,
};
use crate::context::ScanContext;
use crate::model::{Finding, Severity};
use crate::rules::RuleRegistry;
use crate::snippet::build_snippet;

/// Runs the method/type/assembly passes over every type in `module`, in
/// module declaration order, and returns the findings collected along the
/// way. `ctx` accumulates signals, call-graph edges and dataflow chains as
/// a side effect; the assembly-metadata pass is run last by the caller.
pub fn scan_types(module: &ParsedModule, rules: &RuleRegistry, ctx: &mut ScanContext) -> Vec<Finding> {
    let mut findings = Vec::new();
    for ty in &module.types {
        findings.extend(scan_type(module, ty, rules, ctx));
    }
    findings
}

fn scan_type(module: &ParsedModule, ty: &TypeDef, rules: &RuleRegistry, ctx: &mut ScanContext) -> Vec<Finding> {
    let mut findings = Vec::new();
    let type_key = ty.full_name();

    // Accessor methods are scanned exactly once: through the property/event
    // pass (with its "found in ..." prefix) when that pass is enabled,
    // otherwise here alongside every other plain method.
    let accessor_indices = if ctx.config.analyze_property_accessors {
        accessor_method_indices(ty)
    } else {
        Default::default()
    };

    for (idx, method) in ty.methods.iter().enumerate() {
        if accessor_indices.contains(&idx) {
            continue;
        }
        findings.extend(scan_method(module, method, rules, ctx));
    }

    if ctx.config.analyze_property_accessors {
        for prop in &ty.properties {
            findings.extend(scan_property(module, ty, prop, rules, ctx));
        }
        for event in &ty.events {
            findings.extend(scan_event(module, ty, event, rules, ctx));
        }
    }

    for nested in &ty.nested_types {
        findings.extend(scan_type(module, nested, rules, ctx));
    }

    if let Some(pending) = ctx.pending_reflection.remove(&type_key) {
        if ctx
            .signals
            .type_signals(&type_key)
            .map(|t| t.has_non_reflection_trigger())
            .unwrap_or(false)
        {
            for base in pending {
                findings.push(
                    Finding::new(
                        base.location.clone(),
                        format!(
                            "{} — combined with other suspicious patterns detected in this type",
                            base.description
                        ),
                        Severity::High,
                    )
                    .with_rule_id(base.rule_id.clone().unwrap_or_default()),
                );
            }
        }
    }

    findings
}

fn accessor_method_indices(ty: &TypeDef) -> std::collections::HashSet<usize> {
    let mut indices = std::collections::HashSet::new();
    for prop in &ty.properties {
        indices.extend(prop.getter);
        indices.extend(prop.setter);
    }
    for event in &ty.events {
        indices.extend(event.add);
        indices.extend(event.remove);
        indices.extend(event.invoke);
    }
    indices
}

fn scan_property(
    module: &ParsedModule,
    ty: &TypeDef,
    prop: &PropertyDef,
    rules: &RuleRegistry,
    ctx: &mut ScanContext,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    if let Some(idx) = prop.getter {
        if let Some(method) = ty.methods.get(idx) {
            findings.extend(prefix_findings(
                scan_method(module, method, rules, ctx),
                &format!("found in property getter: {}", prop.name),
            ));
        }
    }
    if let Some(idx) = prop.setter {
        if let Some(method) = ty.methods.get(idx) {
            findings.extend(prefix_findings(
                scan_method(module, method, rules, ctx),
                &format!("found in property setter: {}", prop.name),
            ));
        }
    }
    findings
}

fn scan_event(
    module: &ParsedModule,
    ty: &TypeDef,
    event: &EventDef,
    rules: &RuleRegistry,
    ctx: &mut ScanContext,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    let accessors = [
        (event.add, "event add"),
        (event.remove, "event remove"),
        (event.invoke, "event invoke"),
    ];
    for (idx, label) in accessors {
        if let Some(idx) = idx {
            if let Some(method) = ty.methods.get(idx) {
                findings.extend(prefix_findings(
                    scan_method(module, method, rules, ctx),
                    &format!("found in {label}: {}", event.name),
                ));
            }
        }
    }
    findings
}

fn prefix_findings(mut findings: Vec<Finding>, prefix: &str) -> Vec<Finding> {
    for f in &mut findings {
        f.description = format!("{prefix}: {}", f.description);
    }
    findings
}

/// One method's full scan: instruction pass, local-variable pass,
/// exception-handler pass, companion gating, combination findings.
fn scan_method(
    module: &ParsedModule,
    method: &MethodDef,
    rules: &RuleRegistry,
    ctx: &mut ScanContext,
) -> Vec<Finding> {
    let Some(instructions) = method.instructions.as_deref() else {
        return Vec::new();
    };
    let method_key = method.full_name();
    let mut findings = Vec::new();

    for (index, instr) in instructions.iter().enumerate() {
        let Some(call) = call_operand(instr) else {
            continue;
        };
        for rule in &rules.rules {
            if !rule.is_suspicious(call) {
                continue;
            }
            let produced = run_guarded(rule.rule_id(), &method_key, || {
                let mut signals = ctx.signals.method_signals_mut(&method_key).clone();
                let out = rule.analyze_contextual_pattern(module, method, instructions, index, &mut signals, ctx);
                *ctx.signals.method_signals_mut(&method_key) = signals;
                out
            });
            apply_gated(produced, rule.rule_id(), rule.requires_companion_finding(), &method_key, ctx, &mut findings);
        }
    }

    for rule in &rules.rules {
        let produced = run_guarded(rule.rule_id(), &method_key, || {
            let mut signals = ctx.signals.method_signals_mut(&method_key).clone();
            let out = rule.analyze_instructions(module, method, instructions, &mut signals, ctx);
            *ctx.signals.method_signals_mut(&method_key) = signals;
            out
        });
        apply_gated(produced, rule.rule_id(), rule.requires_companion_finding(), &method_key, ctx, &mut findings);
    }

    if ctx.config.analyze_exception_handlers {
        findings.extend(scan_exception_handlers(method, instructions, rules, ctx, &method_key));
    }

    ctx.dataflow.analyze_method(&method_key, &method_key, instructions, &ctx.datasets);

    let type_key = method.declaring_type.clone();
    ctx.signals.finish_method(&method_key, &type_key);

    if let Some(signals) = ctx.signals.method_signals(&method_key).cloned() {
        if signals.is_critical_combination() {
            findings.push(combination_finding(&method_key, &signals, true));
        } else if signals.is_high_risk_combination() {
            findings.push(combination_finding(&method_key, &signals, false));
        }
    }

    findings
}

fn combination_finding(method_key: &str, signals: &crate::model::MethodSignals, critical: bool) -> Finding {
    let joined = signals.active_signal_names().join("+");
    let (description, severity) = if critical {
        (format!("Critical: {joined}"), Severity::Critical)
    } else {
        (format!("High-risk combination detected: {joined}"), Severity::High)
    };
    Finding::new(format!("{method_key}:0"), description, severity).with_rule_id("SignalCombination")
}

fn scan_exception_handlers(
    method: &MethodDef,
    instructions: &[Instruction],
    rules: &RuleRegistry,
    ctx: &mut ScanContext,
    method_key: &str,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    for handler in &method.exception_handlers {
        if handler.kind != ExceptionHandlerKind::Catch {
            continue;
        }
        let block: Vec<&Instruction> = instructions
            .iter()
            .filter(|i| i.offset >= handler.handler_start && i.offset < handler.handler_end)
            .collect();
        let suspicious_call = block.iter().enumerate().find_map(|(i, instr)| {
            let call = call_operand(instr)?;
            rules.rules.iter().any(|r| r.is_suspicious(call)).then_some(i)
        });
        if let Some(i) = suspicious_call {
            let offset = block[i].offset;
            let owned: Vec<Instruction> = block.iter().map(|i| (*i).clone()).collect();
            let snippet = build_snippet(&owned, i, 1);
            ctx.signals.method_signals_mut(method_key).suspicious_exception_handling = true;
            findings.push(
                Finding::new(
                    format!("{method_key}:{offset}"),
                    "Suspicious method call in catch block".to_string(),
                    Severity::Medium,
                )
                .with_rule_id("ExceptionHandlerRule")
                .with_snippet(snippet),
            );
        }
    }
    findings
}

/// Gates a rule's output per the companion rule: a companion-requiring
/// rule's non-Low finding is retained only if some other rule already
/// triggered in this method; Low findings from companion-requiring rules
/// always pass but never count as the trigger themselves.
fn apply_gated(
    produced: Vec<Finding>,
    rule_id: &str,
    requires_companion: bool,
    method_key: &str,
    ctx: &mut ScanContext,
    out: &mut Vec<Finding>,
) {
    for finding in produced {
        if requires_companion && finding.severity != Severity::Low {
            let has_companion = ctx
                .signals
                .method_signals(method_key)
                .map(|s| s.has_triggered_rule_other_than(rule_id))
                .unwrap_or(false);
            if !has_companion {
                continue;
            }
        }
        if !(requires_companion && finding.severity == Severity::Low) {
            ctx.signals.method_signals_mut(method_key).mark_rule_triggered(rule_id);
        }
        out.push(finding);
    }
}

fn call_operand(instr: &Instruction) -> Option<&crate::bytecode::MethodRef> {
    if !matches!(&instr.opcode, Opcode::Call | Opcode::CallVirt | Opcode::NewObj) {
        return None;
    }
    match &instr.operand {
        Operand::Method(m) => Some(m),
        _ => None,
    }
}

/// Runs `f`, catching both a returned `Err`-shaped failure (rules never
/// return `Result` so this only guards panics) and an actual panic; either
/// way the offending rule is skipped and a diagnostic would be recorded by
/// the caller's pass boundary. Rules are `Send + Sync` with no
/// interior non-unwind-safe state, so `AssertUnwindSafe` is sound here.
fn run_guarded(rule_id: &str, location: &str, f: impl FnOnce() -> Vec<Finding>) -> Vec<Finding> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(findings) => findings,
        Err(_) => {
            warn!(rule_id, location, "rule panicked; skipping");
            Vec::new()
        }
    }
}

/// Runs every rule's `analyze_assembly_metadata` hook once; a panicking
/// rule is skipped without aborting the others.
pub fn scan_assembly_metadata(module: &ParsedModule, rules: &RuleRegistry, ctx: &mut ScanContext) -> Vec<Finding> {
    if !ctx.config.detect_assembly_metadata {
        return Vec::new();
    }
    let mut findings = Vec::new();
    for rule in &rules.rules {
        let rule_id = rule.rule_id();
        debug!(rule_id, "running assembly-metadata pass");
        let produced = match panic::catch_unwind(AssertUnwindSafe(|| rule.analyze_assembly_metadata(module, ctx))) {
            Ok(f) => f,
            Err(_) => {
                warn!(rule_id, "assembly-metadata rule panicked; skipping");
                Vec::new()
            }
        };
        findings.extend(produced);
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{MethodRef, Opcode, Operand};
    use crate::config::ScanConfig;

    fn str_instr(offset: u32, s: &str) -> Instruction {
        Instruction::new(offset, Opcode::LdStr, Operand::String(s.to_string()))
    }

    fn call(offset: u32, declaring_type: &str, name: &str, params: u16) -> Instruction {
        Instruction::new(
            offset,
            Opcode::Call,
            Operand::Method(MethodRef {
                declaring_type: declaring_type.into(),
                name: name.into(),
                param_count: params,
                has_this: false,
                returns_void: true,
            }),
        )
    }

    fn method(name: &str, declaring_type: &str, instructions: Vec<Instruction>) -> MethodDef {
        MethodDef {
            name: name.into(),
            declaring_type: declaring_type.into(),
            param_count: 0,
            has_this: false,
            returns_void: true,
            instructions: Some(instructions),
            locals: vec![],
            exception_handlers: vec![],
            is_static_constructor: false,
        }
    }

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

    #[test]
    fn bare_process_start_is_flagged_without_companion_needed() {
        let m = method(
            "Run",
            "X.Y",
            vec![str_instr(0, "notepad.exe"), call(1, "System.Diagnostics.Process", "Start", 1)],
        );
        let ty = TypeDef {
            namespace: "X".into(),
            name: "Y".into(),
            nested_types: vec![],
            methods: vec![m],
            properties: vec![],
            events: vec![],
            custom_attributes: vec![],
        };
        let mut module = empty_module();
        module.types.push(ty);
        let rules = RuleRegistry::new();
        let mut ctx = ScanContext::new(ScanConfig::default());
        let findings = scan_types(&module, &rules, &mut ctx);
        assert!(findings.iter().any(|f| f.rule_id.as_deref() == Some("ProcessStartRule")));
    }

    #[test]
    fn companion_requiring_finding_is_suppressed_without_a_companion() {
        let m = method(
            "Run",
            "X.Y",
            vec![
                str_instr(0, "HKLM"),
                call(1, "Microsoft.Win32.RegistryKey", "SetValue", 2),
            ],
        );
        let ty = TypeDef {
            namespace: "X".into(),
            name: "Y".into(),
            nested_types: vec![],
            methods: vec![m],
            properties: vec![],
            events: vec![],
            custom_attributes: vec![],
        };
        let mut module = empty_module();
        module.types.push(ty);
        let rules = RuleRegistry::new();
        let mut ctx = ScanContext::new(ScanConfig::default());
        let findings = scan_types(&module, &rules, &mut ctx);
        assert!(!findings.iter().any(|f| f.rule_id.as_deref() == Some("RegistryRule")));
    }

    #[test]
    fn companion_requiring_finding_survives_with_a_companion_present() {
        let m = method(
            "Run",
            "X.Y",
            vec![
                str_instr(0, "notepad.exe"),
                call(1, "System.Diagnostics.Process", "Start", 1),
                str_instr(2, "HKLM"),
                call(3, "Microsoft.Win32.RegistryKey", "SetValue", 2),
            ],
        );
        let ty = TypeDef {
            namespace: "X".into(),
            name: "Y".into(),
            nested_types: vec![],
            methods: vec![m],
            properties: vec![],
            events: vec![],
            custom_attributes: vec![],
        };
        let mut module = empty_module();
        module.types.push(ty);
        let rules = RuleRegistry::new();
        let mut ctx = ScanContext::new(ScanConfig::default());
        let findings = scan_types(&module, &rules, &mut ctx);
        assert!(findings.iter().any(|f| f.rule_id.as_deref() == Some("RegistryRule")));
    }

    #[test]
    fn suspicious_call_in_catch_block_is_flagged() {
        let mut m = method(
            "Run",
            "X.Y",
            vec![
                str_instr(10, "notepad.exe"),
                call(11, "System.Diagnostics.Process", "Start", 1),
            ],
        );
        m.exception_handlers.push(crate::bytecode::ExceptionHandler {
            kind: ExceptionHandlerKind::Catch,
            try_start: 0,
            try_end: 10,
            handler_start: 10,
            handler_end: 20,
            catch_type: Some("System.Exception".into()),
        });
        let ty = TypeDef {
            namespace: "X".into(),
            name: "Y".into(),
            nested_types: vec![],
            methods: vec![m],
            properties: vec![],
            events: vec![],
            custom_attributes: vec![],
        };
        let mut module = empty_module();
        module.types.push(ty);
        let rules = RuleRegistry::new();
        let mut ctx = ScanContext::new(ScanConfig::default());
        let findings = scan_types(&module, &rules, &mut ctx);
        assert!(findings
            .iter()
            .any(|f| f.rule_id.as_deref() == Some("ExceptionHandlerRule")));
    }

    #[test]
    fn pending_reflection_is_promoted_when_type_has_a_non_reflection_trigger() {
        let reflective = method(
            "Dispatch",
            "X.Y",
            vec![
                str_instr(0, "ToString"),
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
            ],
        );
        let other = method(
            "Run",
            "X.Y",
            vec![str_instr(0, "notepad.exe"), call(1, "System.Diagnostics.Process", "Start", 1)],
        );
        let ty = TypeDef {
            namespace: "X".into(),
            name: "Y".into(),
            nested_types: vec![],
            methods: vec![reflective, other],
            properties: vec![],
            events: vec![],
            custom_attributes: vec![],
        };
        let mut module = empty_module();
        module.types.push(ty);
        let rules = RuleRegistry::new();
        let mut ctx = ScanContext::new(ScanConfig::default());
        let findings = scan_types(&module, &rules, &mut ctx);
        assert!(findings
            .iter()
            .any(|f| f.description.contains("combined with other suspicious patterns")));
    }

    #[test]
    fn assembly_metadata_pass_runs_even_with_no_pinvoke_decls() {
        let module = empty_module();
        let rules = RuleRegistry::new();
        let mut ctx = ScanContext::new(ScanConfig::default());
        let findings = scan_assembly_metadata(&module, &rules, &mut ctx);
        assert!(findings.is_empty());
    }

    #[test]
    fn disabling_exception_handler_analysis_skips_the_pass() {
        let mut m = method(
            "Run",
            "X.Y",
            vec![
                str_instr(10, "notepad.exe"),
                call(11, "System.Diagnostics.Process", "Start", 1),
            ],
        );
        m.exception_handlers.push(crate::bytecode::ExceptionHandler {
            kind: ExceptionHandlerKind::Catch,
            try_start: 0,
            try_end: 10,
            handler_start: 10,
            handler_end: 20,
            catch_type: Some("System.Exception".into()),
        });
        let ty = TypeDef {
            namespace: "X".into(),
            name: "Y".into(),
            nested_types: vec![],
            methods: vec![m],
            properties: vec![],
            events: vec![],
            custom_attributes: vec![],
        };
        let mut module = empty_module();
        module.types.push(ty);
        let rules = RuleRegistry::new();
        let mut config = ScanConfig::default();
        config.analyze_exception_handlers = false;
        let mut ctx = ScanContext::new(config);
        let findings = scan_types(&module, &rules, &mut ctx);
        assert!(!findings
            .iter()
            .any(|f| f.rule_id.as_deref() == Some("ExceptionHandlerRule")));
    }
}
