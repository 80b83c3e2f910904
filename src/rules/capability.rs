//! Process/shell execution, registry persistence, native-interop and
//! sensitive-environment-path rules.

use crate::bytecode::{Instruction, MethodDef, MethodRef, Operand, ParsedModule};
use crate::call_graph::{CallSite, SuspiciousDeclaration};
use crate::context::ScanContext;
use crate::model::{Finding, MethodSignals, Severity};
use crate::resolver;
use crate::snippet::build_snippet;

use super::Rule;

const SUSPICIOUS_NATIVE_APIS: &[&str] = &[
    "CreateRemoteThread",
    "VirtualAllocEx",
    "WriteProcessMemory",
    "LoadLibraryA",
    "LoadLibraryW",
    "GetProcAddress",
    "SetWindowsHookExA",
    "SetWindowsHookExW",
    "NtCreateThreadEx",
    "VirtualProtect",
];

pub struct ProcessStartRule;

impl Rule for ProcessStartRule {
    fn rule_id(&self) -> &'static str {
        "ProcessStartRule"
    }

    fn description(&self) -> &'static str {
        "Process execution via Process.Start"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        call.declaring_type == "System.Diagnostics.Process" && call.name == "Start"
    }

    fn analyze_contextual_pattern(
        &self,
        module: &ParsedModule,
        method: &MethodDef,
        instructions: &[Instruction],
        index: usize,
        signals: &mut MethodSignals,
        _ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        signals.process_like = true;
        signals.mark_rule_triggered(self.rule_id());

        let target = resolver::try_resolve_process_target(module, method, instructions, index);
        let target_text = target.as_ref().map(|v| v.text.clone()).unwrap_or_else(|| "<unresolved>".into());
        let shell = resolver::try_resolve_use_shell_execute(module, method, instructions, index);
        let no_window = resolver::try_resolve_create_no_window(module, method, instructions, index);

        let mut description = format!("Process execution: Process.Start(\"{target_text}\")");
        if let Some(s) = &shell {
            description.push_str(&format!(", UseShellExecute={}", s.text));
        }
        if let Some(n) = &no_window {
            description.push_str(&format!(", CreateNoWindow={}", n.text));
        }

        let offset = instructions[index].offset;
        let location = format!("{}:{offset}", method.full_name());
        vec![Finding::new(location, description, self.severity())
            .with_rule_id(self.rule_id())
            .with_snippet(build_snippet(instructions, index, 2))]
    }
}

pub struct Shell32Rule;

impl Rule for Shell32Rule {
    fn rule_id(&self) -> &'static str {
        "Shell32Rule"
    }

    fn description(&self) -> &'static str {
        "Command-shell host invocation"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        call.declaring_type == "System.Diagnostics.Process" && call.name == "Start"
    }

    fn analyze_contextual_pattern(
        &self,
        module: &ParsedModule,
        method: &MethodDef,
        instructions: &[Instruction],
        index: usize,
        signals: &mut MethodSignals,
        _ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        let Some(target) = resolver::try_resolve_process_target(module, method, instructions, index) else {
            return Vec::new();
        };
        if !crate::strings::is_shell_host_literal(&target.text) {
            return Vec::new();
        }
        signals.process_like = true;
        signals.mark_rule_triggered(self.rule_id());

        let args = resolver::try_resolve_process_arguments(module, method, instructions, index)
            .map(|v| v.text)
            .unwrap_or_default();
        let offset = instructions[index].offset;
        let location = format!("{}:{offset}", method.full_name());
        vec![Finding::new(
            location,
            format!("Shell host invocation: {} {}", target.text, args),
            self.severity(),
        )
        .with_rule_id(self.rule_id())
        .with_snippet(build_snippet(instructions, index, 2))]
    }
}

pub struct RegistryRule;

impl Rule for RegistryRule {
    fn rule_id(&self) -> &'static str {
        "RegistryRule"
    }

    fn description(&self) -> &'static str {
        "Registry persistence write"
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn requires_companion_finding(&self) -> bool {
        true
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        call.declaring_type == "Microsoft.Win32.RegistryKey" && call.name.starts_with("Set")
    }

    fn analyze_contextual_pattern(
        &self,
        _module: &ParsedModule,
        method: &MethodDef,
        instructions: &[Instruction],
        index: usize,
        signals: &mut MethodSignals,
        _ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        signals.mark_rule_triggered(self.rule_id());
        let offset = instructions[index].offset;
        let location = format!("{}:{offset}", method.full_name());
        vec![Finding::new(
            location,
            "Registry value write, commonly used for persistence".to_string(),
            self.severity(),
        )
        .with_rule_id(self.rule_id())
        .with_snippet(build_snippet(instructions, index, 1))]
    }
}

pub struct DllImportRule;

impl Rule for DllImportRule {
    fn rule_id(&self) -> &'static str {
        "DllImportRule"
    }

    fn description(&self) -> &'static str {
        "P/Invoke to a process-injection-capable native API"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        SUSPICIOUS_NATIVE_APIS.contains(&call.name.as_str())
    }

    fn analyze_contextual_pattern(
        &self,
        _module: &ParsedModule,
        method: &MethodDef,
        instructions: &[Instruction],
        index: usize,
        signals: &mut MethodSignals,
        ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        let Operand::Method(callee) = &instructions[index].operand else {
            return Vec::new();
        };
        signals.mark_rule_triggered(self.rule_id());
        ctx.call_graph.register_call_site(
            &callee.full_name(),
            CallSite {
                caller_key: method.full_name(),
                caller_location: format!("{}:{}", method.full_name(), instructions[index].offset),
                offset: instructions[index].offset,
                snippet: Some(build_snippet(instructions, index, 1)),
                context: None,
            },
        );
        Vec::new()
    }

    fn analyze_assembly_metadata(&self, module: &ParsedModule, ctx: &mut ScanContext) -> Vec<Finding> {
        for decl in &module.pinvoke_decls {
            if !SUSPICIOUS_NATIVE_APIS.contains(&decl.entry_point.as_str()) {
                continue;
            }
            let method_key = decl.method_full_name();
            ctx.call_graph.register_declaration(SuspiciousDeclaration {
                method_key: method_key.clone(),
                rule_id: self.rule_id().to_string(),
                severity: self.severity(),
                description: format!(
                    "P/Invoke to {}!{} — process-injection-capable native API",
                    decl.dll_name, decl.entry_point
                ),
                developer_guidance: self.developer_guidance().map(str::to_string),
                snippet: Some(format!("pinvoke {}!{}", decl.dll_name, decl.entry_point)),
                location: format!("{method_key}:0"),
            });
        }
        Vec::new()
    }
}

pub struct EnvironmentPathRule;

impl Rule for EnvironmentPathRule {
    fn rule_id(&self) -> &'static str {
        "EnvironmentPathRule"
    }

    fn description(&self) -> &'static str {
        "Sensitive folder access via Environment path APIs"
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        call.declaring_type == "System.Environment"
            && (call.name == "GetFolderPath" || call.name == "GetEnvironmentVariable")
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
        let resolved = resolver::resolve_argument(module, method, instructions, index, 1);
        if !ctx.datasets.is_sensitive_folder_literal(&resolved.text) {
            return Vec::new();
        }
        signals.sensitive_folder = true;
        signals.mark_rule_triggered(self.rule_id());
        let offset = instructions[index].offset;
        let location = format!("{}:{offset}", method.full_name());
        vec![Finding::new(
            location,
            format!("Sensitive folder access: {}", resolved.text),
            self.severity(),
        )
        .with_rule_id(self.rule_id())
        .with_snippet(build_snippet(instructions, index, 1))]
    }
}

pub struct PersistenceRule;

const FILE_WRITE_APIS: &[&str] = &["WriteAllBytes", "WriteAllText", "Create"];

impl Rule for PersistenceRule {
    fn rule_id(&self) -> &'static str {
        "PersistenceRule"
    }

    fn description(&self) -> &'static str {
        "Persistence via file write to a temp-derived path"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        call.declaring_type == "System.IO.File" && FILE_WRITE_APIS.contains(&call.name.as_str())
    }

    fn analyze_contextual_pattern(
        &self,
        _module: &ParsedModule,
        method: &MethodDef,
        instructions: &[Instruction],
        index: usize,
        signals: &mut MethodSignals,
        ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        if ctx.datasets.is_mod_framework_type(&method.declaring_type) {
            return Vec::new();
        }
        let start = index.saturating_sub(50);
        let has_temp_path = instructions[start..index].iter().any(|i| {
            matches!(&i.operand, Operand::Method(m) if m.declaring_type == "System.IO.Path" && m.name == "GetTempPath")
        });
        if !has_temp_path {
            return Vec::new();
        }
        signals.file_write = true;
        signals.mark_rule_triggered(self.rule_id());
        let offset = instructions[index].offset;
        let location = format!("{}:{offset}", method.full_name());
        vec![Finding::new(
            location,
            "Persistence: file written to a temp-derived path".to_string(),
            self.severity(),
        )
        .with_rule_id(self.rule_id())
        .with_snippet(build_snippet(instructions, index, 1))]
    }
}
