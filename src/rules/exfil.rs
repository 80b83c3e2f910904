//! Data exfiltration and infiltration rules.

use crate::bytecode::{Instruction, MethodDef, MethodRef, Opcode, Operand, ParsedModule};
use crate::context::ScanContext;
use crate::model::{Finding, MethodSignals, Severity};
use crate::resolver;
use crate::snippet::build_snippet;

use super::Rule;

const UPLOAD_APIS: &[(&str, &str)] = &[
    ("System.Net.WebClient", "UploadData"),
    ("System.Net.WebClient", "UploadString"),
    ("System.Net.WebClient", "UploadFile"),
    ("System.Net.Http.HttpClient", "PostAsync"),
    ("System.Net.Http.HttpClient", "PutAsync"),
];

const DOWNLOAD_APIS: &[(&str, &str)] = &[
    ("System.Net.WebClient", "DownloadData"),
    ("System.Net.WebClient", "DownloadString"),
    ("System.Net.WebClient", "DownloadFile"),
];

pub struct DataExfiltrationRule;

impl Rule for DataExfiltrationRule {
    fn rule_id(&self) -> &'static str {
        "DataExfiltrationRule"
    }

    fn description(&self) -> &'static str {
        "Data upload to a remote endpoint"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn requires_companion_finding(&self) -> bool {
        true
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        UPLOAD_APIS
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
        _ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        signals.network = true;
        signals.mark_rule_triggered(self.rule_id());
        let destination = resolver::resolve_argument(module, method, instructions, index, 1);
        let offset = instructions[index].offset;
        vec![Finding::new(
            format!("{}:{offset}", method.full_name()),
            format!("Data exfiltration: upload to {}", destination.text),
            self.severity(),
        )
        .with_rule_id(self.rule_id())
        .with_snippet(build_snippet(instructions, index, 1))]
    }
}

pub struct DataInfiltrationRule;

impl Rule for DataInfiltrationRule {
    fn rule_id(&self) -> &'static str {
        "DataInfiltrationRule"
    }

    fn description(&self) -> &'static str {
        "Remote content downloaded and subsequently written to disk"
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn requires_companion_finding(&self) -> bool {
        true
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        DOWNLOAD_APIS
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
        _ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        signals.network = true;
        signals.mark_rule_triggered(self.rule_id());

        let forward_window = &instructions[index..(index + 30).min(instructions.len())];
        let followed_by_write = forward_window.iter().any(|i| {
            matches!(&i.operand, Operand::Method(m)
                if m.declaring_type == "System.IO.File"
                    && matches!(m.name.as_str(), "WriteAllBytes" | "WriteAllText" | "Create"))
        });
        if !followed_by_write {
            return Vec::new();
        }

        let source = resolver::resolve_argument(module, method, instructions, index, 1);
        vec![Finding::new(
            format!("{}:{}", method.full_name(), instructions[index].offset),
            format!("Remote content downloaded from {} and written to disk", source.text),
            self.severity(),
        )
        .with_rule_id(self.rule_id())
        .with_snippet(build_snippet(instructions, index, 1))]
    }
}
