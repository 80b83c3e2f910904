//! `AssemblyDynamicLoad` — the most elaborate rule, serving as the
//! reference model for provenance/post-load/correlation scoring —
//! plus the narrower `LoadFromStream` companion rule.

use std::io::Read;

use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::bytecode::{Instruction, MethodDef, MethodRef, Opcode, Operand, ParsedModule, TypeDef};
use crate::context::ScanContext;
use crate::model::{Finding, MethodSignals, Severity};
use crate::resolver;
use crate::snippet::build_snippet;
use crate::strings;

use super::Rule;

const BACKWARD_WINDOW: usize = 200;
const FORWARD_WINDOW: usize = 100;
const MAX_RESOURCE_BYTES: usize = 10 * 1024 * 1024;

static NAME_LIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.]+(,\s*[A-Za-z]+=.*)?$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadOverload {
    LoadBytes,
    LoadBytesWithPdb,
    LoadString,
    LoadFrom,
    LoadFile,
    AlcLoadFromStream,
    AlcLoadFromStreamPdb,
    AlcLoadFromPath,
    Unknown,
}

impl LoadOverload {
    fn base_score(self) -> i32 {
        match self {
            LoadOverload::LoadBytes => 50,
            LoadOverload::LoadBytesWithPdb => 45,
            LoadOverload::LoadString => 10,
            LoadOverload::LoadFrom => 30,
            LoadOverload::LoadFile => 35,
            LoadOverload::AlcLoadFromStream => 45,
            LoadOverload::AlcLoadFromStreamPdb => 50,
            LoadOverload::AlcLoadFromPath => 30,
            LoadOverload::Unknown => 20,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LoadOverload::LoadBytes => "Assembly.Load(byte[])",
            LoadOverload::LoadBytesWithPdb => "Assembly.Load(byte[], byte[])",
            LoadOverload::LoadString => "Assembly.Load(string)",
            LoadOverload::LoadFrom => "Assembly.LoadFrom",
            LoadOverload::LoadFile => "Assembly.LoadFile",
            LoadOverload::AlcLoadFromStream => "AssemblyLoadContext.LoadFromStream",
            LoadOverload::AlcLoadFromStreamPdb => "AssemblyLoadContext.LoadFromStream(with pdb)",
            LoadOverload::AlcLoadFromPath => "AssemblyLoadContext.LoadFromAssemblyPath",
            LoadOverload::Unknown => "assembly load",
        }
    }

    fn is_string_overload(self) -> bool {
        matches!(self, LoadOverload::LoadString)
    }
}

/// Overload classification is inherently approximate: the bytecode
/// abstraction carries `param_count` but not parameter types, so a `Load`
/// call is treated as the byte-array (worst-case) form unless the resolved
/// argument looks like a dotted assembly name literal.
fn classify_overload(m: &MethodRef, primary_arg_is_name_like: bool) -> LoadOverload {
    match m.name.as_str() {
        "Load" if m.param_count >= 2 => LoadOverload::LoadBytesWithPdb,
        "Load" if primary_arg_is_name_like => LoadOverload::LoadString,
        "Load" => LoadOverload::LoadBytes,
        "LoadFrom" => LoadOverload::LoadFrom,
        "LoadFile" => LoadOverload::LoadFile,
        "LoadFromStream" if m.param_count >= 2 => LoadOverload::AlcLoadFromStreamPdb,
        "LoadFromStream" => LoadOverload::AlcLoadFromStream,
        "LoadFromAssemblyPath" => LoadOverload::AlcLoadFromPath,
        _ => LoadOverload::Unknown,
    }
}

fn is_benign_simple_name(text: &str) -> bool {
    text.len() < 40
        && !text.contains('/')
        && !text.contains('\\')
        && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
}

struct Provenance {
    score: i32,
    resource_name: Option<String>,
}

fn backward_provenance(instructions: &[Instruction], index: usize) -> Provenance {
    let start = index.saturating_sub(BACKWARD_WINDOW);
    let window = &instructions[start..index];
    let mut score = 0i32;
    let mut resource_name = None;

    for (offset, instr) in window.iter().enumerate() {
        let Operand::Method(m) = &instr.operand else { continue };
        if !matches!(&instr.opcode, Opcode::Call | Opcode::CallVirt | Opcode::NewObj) {
            continue;
        }
        match (m.declaring_type.as_str(), m.name.as_str()) {
            ("System.Net.WebClient", "DownloadData" | "DownloadString" | "DownloadFile")
            | (
                "System.Net.Http.HttpClient",
                "GetByteArrayAsync" | "GetStringAsync" | "GetStreamAsync" | "PostAsync" | "PutAsync" | "SendAsync",
            ) => {
                score += 25;
            }
            ("System.Convert", "FromBase64String") => score += 15,
            (t, "Create" | "CreateDecryptor" | "TransformFinalBlock" | ".ctor") if is_crypto_type(t) => {
                score += 25;
            }
            (t, ".ctor") if is_compression_type(t) => score += 15,
            ("System.Reflection.Assembly", "GetManifestResourceStream") => {
                score += 10;
                if let Some(prev) = window[..offset].iter().rev().find_map(|i| match &i.operand {
                    Operand::String(s) => Some(s.clone()),
                    _ => None,
                }) {
                    resource_name = Some(prev);
                }
            }
            ("System.IO.Path", "GetTempPath") => score += 10,
            ("System.Environment", "GetFolderPath") => score += 20,
            ("System.IO.File", "WriteAllBytes" | "WriteAllText" | "Create") => score += 15,
            _ => {}
        }
        if let Operand::String(s) = &instr.operand {
            if strings::is_shell_host_literal(s) {
                score += 10;
            }
        }
    }

    Provenance {
        score: score.min(80),
        resource_name,
    }
}

fn is_crypto_type(t: &str) -> bool {
    ["Aes", "Rijndael", "DES", "TripleDES", "RC2"].iter().any(|c| t.ends_with(*c))
}

fn is_compression_type(t: &str) -> bool {
    t.ends_with("GZipStream") || t.ends_with("DeflateStream") || t.ends_with("BrotliStream")
}

fn forward_postload(instructions: &[Instruction], index: usize) -> i32 {
    let end = (index + FORWARD_WINDOW).min(instructions.len());
    let window = &instructions[index..end];
    let mut score = 0;
    for instr in window {
        let Operand::Method(m) = &instr.operand else { continue };
        match (m.declaring_type.as_str(), m.name.as_str()) {
            ("System.Reflection.Assembly", "get_EntryPoint") => score += 10,
            (t, "Invoke") if t == "System.Reflection.MethodInfo" || t == "System.Reflection.MethodBase" => {
                score += 15
            }
            ("System.Reflection.Assembly", "GetType" | "GetTypes") => score += 5,
            ("System.Activator", "CreateInstance") => score += 10,
            _ => {}
        }
    }
    score.min(30)
}

fn correlation_score(signals: &MethodSignals) -> i32 {
    let mut score = 0;
    if signals.process_like {
        score += 30;
    }
    if signals.network {
        score += 20;
    }
    if signals.file_write && signals.sensitive_folder {
        score += 25;
    }
    if signals.encoded_strings {
        score += 10;
    }
    if signals.base64 {
        score += 10;
    }
    score.min(50)
}

fn severity_for_total(total: i32) -> Option<Severity> {
    match total {
        t if t < 15 => None,
        t if t < 25 => Some(Severity::Low),
        t if t < 50 => Some(Severity::Medium),
        t if t < 75 => Some(Severity::High),
        _ => Some(Severity::Critical),
    }
}

pub struct AssemblyDynamicLoadRule;

impl Rule for AssemblyDynamicLoadRule {
    fn rule_id(&self) -> &'static str {
        "AssemblyDynamicLoadRule"
    }

    fn description(&self) -> &'static str {
        "Dynamic assembly load"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        (call.declaring_type == "System.Reflection.Assembly"
            && matches!(call.name.as_str(), "Load" | "LoadFrom" | "LoadFile"))
            || (call.declaring_type == "System.Runtime.Loader.AssemblyLoadContext"
                && matches!(call.name.as_str(), "LoadFromStream" | "LoadFromAssemblyPath"))
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
        let Operand::Method(m) = &instructions[index].operand else {
            return Vec::new();
        };
        let primary = resolver::resolve_argument(module, method, instructions, index, m.param_count.max(1));
        let primary_name_like = primary.is_concrete_literal && NAME_LIKE.is_match(&primary.text);
        let overload = classify_overload(m, primary_name_like);

        if overload.is_string_overload()
            && primary.is_concrete_literal
            && (ctx.datasets.is_safe_assembly_name(&primary.text) || is_benign_simple_name(&primary.text))
        {
            return Vec::new();
        }

        let provenance = backward_provenance(instructions, index);
        let postload = forward_postload(instructions, index);
        let correlation = correlation_score(signals);
        let total = overload.base_score() + provenance.score + postload + correlation;

        let Some(severity) = severity_for_total(total) else {
            return Vec::new();
        };

        if provenance.score >= 25 {
            signals.network = true;
        }
        signals.mark_rule_triggered(self.rule_id());

        let offset = instructions[index].offset;
        let location = format!("{}:{offset}", method.full_name());
        let mut description = format!("Dynamic assembly load via {}", overload.label());
        if primary.is_concrete_literal {
            description.push_str(&format!(" (\"{}\")", primary.text));
        }
        if provenance.score >= 25 {
            description.push_str(", provenance indicates network-sourced bytes");
        }

        let bypass = total >= 75;
        let finding = Finding::new(location, description, severity)
            .with_rule_id(self.rule_id())
            .with_risk_score(total.clamp(0, 100) as u8)
            .with_bypass_companion(bypass)
            .with_snippet(build_snippet(instructions, index, 2));

        if let Some(resource_name) = provenance.resource_name.clone() {
            ctx.pending_resource_loads.push(crate::context::PendingResourceLoad {
                resource_name,
                base_finding: finding.clone(),
                base_total_score: total.max(0) as u32,
            });
        }
        vec![finding]
    }

    fn analyze_instructions(
        &self,
        module: &ParsedModule,
        method: &MethodDef,
        instructions: &[Instruction],
        signals: &mut MethodSignals,
        ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        let mut findings = Vec::new();
        findings.extend(analyze_assembly_resolve_subscriptions(module, method, instructions, ctx));
        findings.extend(analyze_reflective_load_evasion(method, instructions, signals));
        findings
    }
}

fn find_method_by_ref<'a>(module: &'a ParsedModule, target: &MethodRef) -> Option<(&'a TypeDef, &'a MethodDef)> {
    fn walk<'a>(types: &'a [TypeDef], out: &mut Vec<&'a TypeDef>) {
        for t in types {
            out.push(t);
            walk(&t.nested_types, out);
        }
    }
    let mut all = Vec::new();
    walk(&module.types, &mut all);
    for t in all {
        if t.full_name() == target.declaring_type {
            if let Some(method) = t.methods.iter().find(|mm| mm.name == target.name) {
                return Some((t, method));
            }
        }
    }
    None
}

fn analyze_assembly_resolve_subscriptions(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    ctx: &mut ScanContext,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (idx, instr) in instructions.iter().enumerate() {
        let Operand::Method(m) = &instr.operand else { continue };
        if !matches!(&instr.opcode, Opcode::Call | Opcode::CallVirt) {
            continue;
        }
        let is_subscribe = (m.name == "add_AssemblyResolve" || m.name == "add_Resolving")
            && (m.declaring_type.ends_with("AppDomain") || m.declaring_type.ends_with("AssemblyLoadContext"));
        if !is_subscribe {
            continue;
        }
        let handler = instructions[..idx].iter().rev().find_map(|i| match &i.opcode {
            Opcode::LdFtn(h) => Some(h.clone()),
            _ => None,
        });
        let Some(handler) = handler else { continue };
        let Some((_, handler_method)) = find_method_by_ref(module, &handler) else {
            continue;
        };
        let Some(body) = handler_method.instructions.as_deref() else {
            continue;
        };

        let has_loadbytes = body.iter().any(|i| {
            matches!(&i.operand, Operand::Method(hm)
                if hm.declaring_type == "System.Reflection.Assembly" && hm.name == "Load")
        });
        let resource_name = body.iter().enumerate().find_map(|(i, instr)| {
            let Operand::Method(hm) = &instr.operand else { return None };
            if hm.declaring_type != "System.Reflection.Assembly" || hm.name != "GetManifestResourceStream" {
                return None;
            }
            body[..i].iter().rev().find_map(|p| match &p.operand {
                Operand::String(s) => Some(s.clone()),
                _ => None,
            })
        });
        let has_resource_read = resource_name.is_some();
        let has_crypto = body.iter().any(|i| {
            matches!(&i.operand, Operand::Method(hm) if is_crypto_type(&hm.declaring_type))
        });
        let has_network = body.iter().any(|i| {
            matches!(&i.operand, Operand::Method(hm) if hm.declaring_type == "System.Net.WebClient" || hm.declaring_type == "System.Net.Http.HttpClient")
        });

        let is_costura = has_resource_read
            && has_loadbytes
            && !has_crypto
            && !has_network
            && (resource_name.as_deref().map(|n| ctx.datasets.is_costura_resource(n)).unwrap_or(false)
                || handler_method.declaring_type.contains(ctx.datasets.costura_namespace_hint));
        if is_costura {
            continue;
        }
        if !has_loadbytes && !has_resource_read {
            continue;
        }

        let offset = instr.offset;
        findings.push(
            Finding::new(
                format!("{}:{offset}", method.full_name()),
                format!(
                    "AssemblyResolve/Resolving event subscription — Handler: {}",
                    handler_method.full_name()
                ),
                Severity::High,
            )
            .with_rule_id("AssemblyDynamicLoadRule")
            .with_bypass_companion(true)
            .with_snippet(build_snippet(instructions, idx, 1)),
        );
    }
    findings
}

const REFLECTIVE_LOAD_NAMES: &[&str] =
    &["Load", "LoadFrom", "LoadFile", "LoadFromStream", "LoadFromAssemblyPath"];

fn analyze_reflective_load_evasion(
    method: &MethodDef,
    instructions: &[Instruction],
    signals: &mut MethodSignals,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (idx, instr) in instructions.iter().enumerate() {
        let Operand::Method(m) = &instr.operand else { continue };
        if m.declaring_type != "System.Type" || m.name != "GetMethod" {
            continue;
        }
        let start = idx.saturating_sub(3);
        let names_load_method = instructions[start..idx].iter().any(|i| {
            matches!(&i.operand, Operand::String(s) if REFLECTIVE_LOAD_NAMES.contains(&s.as_str()))
        });
        if !names_load_method {
            continue;
        }
        signals.suspicious_reflection = true;
        signals.mark_rule_triggered("AssemblyDynamicLoadRule");
        findings.push(
            Finding::new(
                format!("{}:{}", method.full_name(), instr.offset),
                "Reflection-based assembly-load evasion technique detected".to_string(),
                Severity::High,
            )
            .with_rule_id("AssemblyDynamicLoadRule")
            .with_bypass_companion(true)
            .with_snippet(build_snippet(instructions, idx, 1)),
        );
    }
    findings
}

pub struct LoadFromStreamRule;

impl Rule for LoadFromStreamRule {
    fn rule_id(&self) -> &'static str {
        "LoadFromStreamRule"
    }

    fn description(&self) -> &'static str {
        "In-memory decompressed assembly load"
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn requires_companion_finding(&self) -> bool {
        true
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        call.declaring_type == "System.Runtime.Loader.AssemblyLoadContext" && call.name == "LoadFromStream"
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
        let start = index.saturating_sub(10);
        let decompresses = instructions[start..index].iter().any(|i| {
            matches!(&i.operand, Operand::Method(m) if is_compression_type(&m.declaring_type) && m.name == ".ctor")
        });
        if !decompresses {
            return Vec::new();
        }
        signals.mark_rule_triggered(self.rule_id());
        let offset = instructions[index].offset;
        vec![Finding::new(
            format!("{}:{offset}", method.full_name()),
            "Assembly loaded from a just-decompressed in-memory stream".to_string(),
            self.severity(),
        )
        .with_rule_id(self.rule_id())
        .with_snippet(build_snippet(instructions, index, 2))]
    }

    fn post_analysis_refine(
        &self,
        module: &ParsedModule,
        _existing_findings: &[Finding],
        ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        refine_pending_resource_loads(module, ctx)
    }
}

/// Step 9: confirm embedded PE payloads behind resource-backed dynamic
/// loads and boost their score. A full recursive re-scan would need an
/// actual module parser over the decoded bytes, which is the external
/// metadata/bytecode parser's job, not this crate's — so this records a
/// diagnostic and boosts the existing finding rather than fabricating a
/// nested `ParsedModule`.
fn refine_pending_resource_loads(module: &ParsedModule, ctx: &mut ScanContext) -> Vec<Finding> {
    let pending = std::mem::take(&mut ctx.pending_resource_loads);
    let mut findings = Vec::new();

    for item in pending {
        let Some(resource) = module
            .resources
            .iter()
            .find(|r| r.name == item.resource_name || r.name.eq_ignore_ascii_case(&item.resource_name))
        else {
            continue;
        };
        if resource.data.len() > MAX_RESOURCE_BYTES {
            ctx.record_diagnostic(item.resource_name.as_str(), "embedded resource exceeds size bound, skipped");
            continue;
        }

        let is_pe = starts_with_mz(&resource.data) || gunzip_starts_with_mz(&resource.data);
        if !is_pe {
            continue;
        }

        let boost = match item.base_finding.severity {
            Severity::Critical => 50,
            Severity::High => 30,
            Severity::Medium => 15,
            Severity::Low => 5,
        };
        let boosted_total = (item.base_total_score as i32 + boost).clamp(0, 100);
        let severity = severity_for_total(boosted_total).unwrap_or(Severity::Critical);

        ctx.record_diagnostic(
            item.resource_name.as_str(),
            "embedded PE payload confirmed; recursive rescan requires an external module parser",
        );

        findings.push(
            Finding::new(
                item.base_finding.location.clone(),
                format!(
                    "{} [embedded PE payload confirmed in resource \"{}\"]",
                    item.base_finding.description, item.resource_name
                ),
                severity,
            )
            .with_rule_id("AssemblyDynamicLoadRule")
            .with_risk_score(boosted_total as u8)
            .with_bypass_companion(boosted_total >= 50),
        );
    }

    findings
}

fn starts_with_mz(data: &[u8]) -> bool {
    data.len() >= 2 && &data[0..2] == b"MZ"
}

fn gunzip_starts_with_mz(data: &[u8]) -> bool {
    let mut decoder = GzDecoder::new(data);
    let mut buf = [0u8; 2];
    decoder.read_exact(&mut buf).is_ok() && &buf == b"MZ"
}
