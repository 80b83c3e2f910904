//! Specialized correlators run by the orchestrator over a single
//! promoted method. Each analyzer is a pure function: it reads the method's
//! signals, its already-collected findings at method/type/namespace scope,
//! and its instruction sequence, and returns zero or more `Deep*` findings.

use crate::bytecode::{Instruction, Opcode, Operand};
use crate::model::{Finding, Severity};
use crate::snippet::build_snippet;
use crate::strings;

use super::DeepBehaviorContext;

const ENCODED_RULE_IDS: &[&str] = &[
    "Base64Rule",
    "HexStringRule",
    "EncodedStringLiteralRule",
    "EncodedStringPipelineRule",
    "EncodedBlobSplittingRule",
    "ByteArrayManipulationRule",
];

const EXECUTION_SINK_RULE_IDS: &[&str] = &["ProcessStartRule", "Shell32Rule"];

const SCRIPT_HOST_LITERALS: &[&str] = &[
    "powershell", "cmd.exe", "mshta", "wscript", "cscript", "rundll32", "regsvr32",
];

const ENCODED_LAUNCH_MARKERS: &[&str] = &["-enc", "frombase64string", "/c"];

fn location(ctx: &DeepBehaviorContext<'_>) -> String {
    format!("{}:0", ctx.method.full_name())
}

fn has_encoded_trigger(ctx: &DeepBehaviorContext<'_>) -> bool {
    ctx.signals.encoded_strings || ctx.has_any_rule(ENCODED_RULE_IDS)
}

fn has_execution_sink(ctx: &DeepBehaviorContext<'_>) -> bool {
    ctx.signals.process_like || ctx.has_any_rule(EXECUTION_SINK_RULE_IDS)
}

fn string_literals(instructions: &[Instruction]) -> impl Iterator<Item = &str> {
    instructions.iter().filter_map(|i| match &i.operand {
        Operand::String(s) => Some(s.as_str()),
        _ => None,
    })
}

fn calls_named(instructions: &[Instruction], declaring_type: &str, name: &str) -> bool {
    instructions.iter().any(|i| {
        matches!(&i.opcode, Opcode::Call | Opcode::CallVirt)
            && matches!(&i.operand, Operand::Method(m) if m.declaring_type == declaring_type && m.name == name)
    })
}

fn has_manifest_resource_stream(instructions: &[Instruction]) -> bool {
    calls_named(instructions, "System.Reflection.Assembly", "GetManifestResourceStream")
}

fn has_decompression_construction(instructions: &[Instruction]) -> bool {
    instructions.iter().any(|i| {
        matches!(&i.opcode, Opcode::NewObj)
            && matches!(&i.operand, Operand::Method(m)
                if m.declaring_type == "System.IO.Compression.GZipStream"
                    || m.declaring_type == "System.IO.Compression.DeflateStream")
    })
}

/// `(network ∧ file_write ∧ (process_like ∨ AssemblyDynamicLoad))` Critical,
/// `(encoded ∧ reflection ∧ (AssemblyDynamicLoad ∨ process_like))` High, or
/// `(file_write ∧ (AssemblyDynamicLoad ∨ ProcessStart ∨ Shell32))` High.
pub fn execution_chain(ctx: &DeepBehaviorContext<'_>) -> Vec<Finding> {
    let has_dynamic_load = ctx.has_rule("AssemblyDynamicLoadRule");

    let network_branch = ctx.signals.network
        && ctx.signals.file_write
        && (ctx.signals.process_like || has_dynamic_load);
    if network_branch {
        return vec![finding(
            ctx,
            "DeepExecutionChainRule",
            "Network-sourced data is written to disk and then loaded or executed",
            Severity::Critical,
        )];
    }

    let reflection_branch =
        has_encoded_trigger(ctx) && ctx.signals.suspicious_reflection && (has_dynamic_load || ctx.signals.process_like);
    if reflection_branch {
        return vec![finding(
            ctx,
            "DeepExecutionChainRule",
            "Decoded content is dispatched via reflection or dynamic assembly load",
            Severity::High,
        )];
    }

    let stager_branch = ctx.signals.file_write
        && (has_dynamic_load || ctx.has_any_rule(&["ProcessStartRule", "Shell32Rule"]));
    if stager_branch {
        return vec![finding(
            ctx,
            "DeepExecutionChainRule",
            "Method writes a file to disk and then loads or launches it",
            Severity::High,
        )];
    }

    Vec::new()
}

/// Encoded-rule trigger AND a risky sink (execution, or reflection/activation
/// evidence in the IL). Severity Critical if ≥2 distinct sinks, else High.
pub fn string_decode_flow(ctx: &DeepBehaviorContext<'_>) -> Vec<Finding> {
    if !has_encoded_trigger(ctx) {
        return Vec::new();
    }

    let instructions = ctx.instructions();
    let reflection_evidence = ctx.signals.suspicious_reflection
        || calls_named(instructions, "System.Type", "GetMethod")
        || calls_named(instructions, "System.Type", "GetProperty")
        || calls_named(instructions, "System.Activator", "CreateInstance");

    if !(has_execution_sink(ctx) || reflection_evidence) {
        return Vec::new();
    }

    let sinks = ctx.distinct_sink_count();
    let severity = if sinks >= 2 { Severity::Critical } else { Severity::High };

    let decoded: Vec<&str> = string_literals(instructions)
        .filter(|s| strings::is_likely_encoded(s, 10))
        .take(3)
        .collect();
    let summary = if decoded.is_empty() {
        "Decoded string content reaches a reflection or execution sink".to_string()
    } else {
        format!("Decoded string content ({}) reaches a reflection or execution sink", decoded.join(", "))
    };

    vec![finding(ctx, "DeepStringDecodeFlowRule", &summary, severity)]
}

/// Requires `GetManifestResourceStream` plus either AssemblyLoad or
/// (file-write ∧ process-start/shell). Severity High.
pub fn resource_payload(ctx: &DeepBehaviorContext<'_>) -> Vec<Finding> {
    let instructions = ctx.instructions();
    if !has_manifest_resource_stream(instructions) {
        return Vec::new();
    }

    let has_assembly_load = ctx.has_rule("AssemblyDynamicLoadRule");
    let has_write_then_exec = ctx.signals.file_write && (ctx.signals.process_like || ctx.has_any_rule(EXECUTION_SINK_RULE_IDS));
    if !(has_assembly_load || has_write_then_exec) {
        return Vec::new();
    }

    let description = if has_decompression_construction(instructions) {
        "Embedded resource is decompressed and loaded as an assembly or payload"
    } else {
        "Embedded resource is loaded as an assembly or payload"
    };
    vec![finding(ctx, "DeepResourcePayloadRule", description, Severity::High)]
}

/// `AssemblyDynamicLoad ∧ (Reflection ∨ encoded-rule ∨ process-start/shell)`.
/// Critical if reflection and an execution sink are both present, else High.
pub fn dynamic_load_correlation(ctx: &DeepBehaviorContext<'_>) -> Vec<Finding> {
    if !ctx.has_rule("AssemblyDynamicLoadRule") {
        return Vec::new();
    }
    let correlates = ctx.signals.suspicious_reflection || has_encoded_trigger(ctx) || has_execution_sink(ctx);
    if !correlates {
        return Vec::new();
    }

    let severity = if ctx.signals.suspicious_reflection && has_execution_sink(ctx) {
        Severity::Critical
    } else {
        Severity::High
    };
    vec![finding(
        ctx,
        "DeepDynamicLoadCorrelationRule",
        "Dynamically loaded assembly is correlated with reflection or execution signals",
        severity,
    )]
}

/// P/Invoke declaration plus correlating signals (encoded, file_write,
/// resource access, sensitive folder).
pub fn native_interop_correlation(ctx: &DeepBehaviorContext<'_>) -> Vec<Finding> {
    if !ctx.has_rule("DllImportRule") {
        return Vec::new();
    }
    let has_resource_access = has_manifest_resource_stream(ctx.instructions());
    let correlates = has_encoded_trigger(ctx) || ctx.signals.file_write || has_resource_access || ctx.signals.sensitive_folder;
    if !correlates {
        return Vec::new();
    }
    vec![finding(
        ctx,
        "DeepNativeInteropCorrelationRule",
        "Native interop call site correlates with encoded content, file writes, or resource access",
        Severity::High,
    )]
}

/// ProcessStart trigger AND a literal matching a known script-host name;
/// upgraded to Critical when a neighboring literal carries an encoded
/// launch marker.
pub fn script_host_launch(ctx: &DeepBehaviorContext<'_>) -> Vec<Finding> {
    if !ctx.has_rule("ProcessStartRule") {
        return Vec::new();
    }
    let instructions = ctx.instructions();
    let literals: Vec<&str> = string_literals(instructions).collect();
    let has_script_host = literals.iter().any(|s| {
        let lower = s.to_ascii_lowercase();
        SCRIPT_HOST_LITERALS.iter().any(|host| lower.contains(host))
    });
    if !has_script_host {
        return Vec::new();
    }

    let has_encoded_marker = literals.iter().any(|s| {
        let lower = s.to_ascii_lowercase();
        ENCODED_LAUNCH_MARKERS.iter().any(|marker| lower.contains(marker))
    });
    let severity = if has_encoded_marker { Severity::Critical } else { Severity::High };
    vec![finding(
        ctx,
        "DeepScriptHostLaunchRule",
        "Process launch targets a script host with command-line arguments",
        severity,
    )]
}

/// EnvironmentPath trigger AND a follow-up sink (file_write,
/// AssemblyDynamicLoad, ProcessStart, Persistence). High if process-start or
/// persistence is present, else Medium.
pub fn environment_pivot(ctx: &DeepBehaviorContext<'_>) -> Vec<Finding> {
    if !ctx.has_rule("EnvironmentPathRule") {
        return Vec::new();
    }
    let has_persistence = ctx.has_rule("PersistenceRule");
    let has_follow_up = ctx.signals.file_write
        || ctx.has_rule("AssemblyDynamicLoadRule")
        || ctx.has_rule("ProcessStartRule")
        || has_persistence;
    if !has_follow_up {
        return Vec::new();
    }

    let severity = if ctx.has_rule("ProcessStartRule") || has_persistence {
        Severity::High
    } else {
        Severity::Medium
    };
    vec![finding(
        ctx,
        "DeepEnvironmentPivotRule",
        "Sensitive environment path is resolved and then written to, loaded, or executed",
        severity,
    )]
}

fn finding(ctx: &DeepBehaviorContext<'_>, rule_id: &'static str, description: &str, severity: Severity) -> Finding {
    let instructions = ctx.instructions();
    let mut f = Finding::new(location(ctx), description.to_string(), severity).with_rule_id(rule_id);
    if !instructions.is_empty() {
        f = f.with_snippet(build_snippet(instructions, 0, 3));
    }
    f
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{MethodDef, MethodRef};
    use crate::model::MethodSignals;

    fn call(offset: u32, declaring_type: &str, name: &str) -> Instruction {
        Instruction::new(
            offset,
            Opcode::Call,
            Operand::Method(MethodRef {
                declaring_type: declaring_type.into(),
                name: name.into(),
                param_count: 0,
                has_this: false,
                returns_void: true,
            }),
        )
    }

    fn method_with(instructions: Vec<Instruction>) -> MethodDef {
        MethodDef {
            name: "Run".into(),
            declaring_type: "X.Y".into(),
            param_count: 0,
            has_this: false,
            returns_void: true,
            instructions: Some(instructions),
            locals: vec![],
            exception_handlers: vec![],
            is_static_constructor: false,
        }
    }

    #[test]
    fn resource_payload_requires_manifest_stream_and_a_load_or_exec() {
        let method = method_with(vec![call(0, "System.Reflection.Assembly", "GetManifestResourceStream")]);
        let mut signals = MethodSignals::default();
        signals.process_like = true;
        signals.file_write = true;
        let dctx = DeepBehaviorContext {
            method: &method,
            signals: &signals,
            method_findings: &[],
            type_findings: &[],
            namespace_findings: &[],
        };
        let out = resource_payload(&dctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rule_id.as_deref(), Some("DeepResourcePayloadRule"));
    }

    #[test]
    fn resource_payload_is_silent_without_manifest_stream() {
        let method = method_with(vec![]);
        let signals = MethodSignals::default();
        let dctx = DeepBehaviorContext {
            method: &method,
            signals: &signals,
            method_findings: &[],
            type_findings: &[],
            namespace_findings: &[],
        };
        assert!(resource_payload(&dctx).is_empty());
    }

    #[test]
    fn script_host_launch_upgrades_to_critical_with_encoded_marker() {
        let method = method_with(vec![
            Instruction::new(0, Opcode::LdStr, Operand::String("-enc SGVsbG8=".into())),
            call(1, "System.Diagnostics.Process", "Start"),
        ]);
        let signals = MethodSignals::default();
        let base = Finding::new("X.Y.Run:0", "process start", Severity::Critical).with_rule_id("ProcessStartRule");
        let method_findings = vec![base];
        let dctx = DeepBehaviorContext {
            method: &method,
            signals: &signals,
            method_findings: &method_findings,
            type_findings: &[],
            namespace_findings: &[],
        };
        let out = script_host_launch(&dctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::Critical);
    }

    #[test]
    fn environment_pivot_is_medium_without_process_or_persistence() {
        let method = method_with(vec![]);
        let mut signals = MethodSignals::default();
        signals.file_write = true;
        let base = Finding::new("X.Y.Run:0", "env path", Severity::Medium).with_rule_id("EnvironmentPathRule");
        let method_findings = vec![base];
        let dctx = DeepBehaviorContext {
            method: &method,
            signals: &signals,
            method_findings: &method_findings,
            type_findings: &[],
            namespace_findings: &[],
        };
        let out = environment_pivot(&dctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::Medium);
    }
}
