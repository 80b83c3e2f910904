//! Encoded-literal and obfuscated-byte-array rules.

use crate::bytecode::{Instruction, MethodDef, MethodRef, Operand, ParsedModule};
use crate::context::ScanContext;
use crate::model::{Finding, MethodSignals, Severity};
use crate::snippet::build_snippet;
use crate::strings;

use super::Rule;

pub struct Base64Rule;

impl Rule for Base64Rule {
    fn rule_id(&self) -> &'static str {
        "Base64Rule"
    }

    fn description(&self) -> &'static str {
        "Base64-decoded string literal"
    }

    fn severity(&self) -> Severity {
        Severity::Low
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        call.declaring_type == "System.Convert" && call.name == "FromBase64String"
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
        signals.base64 = true;
        let min_len = ctx.config.minimum_encoded_string_length;
        let literal = nearby_string_literal(instructions, index);
        let Some(literal) = literal else { return Vec::new() };
        if !strings::is_likely_encoded(&literal, min_len) {
            return Vec::new();
        }
        signals.mark_rule_triggered(self.rule_id());
        let offset = instructions[index].offset;
        let location = format!("{}:{offset}", method.full_name());
        vec![Finding::new(
            location,
            "Base64-encoded string literal decoded at runtime".to_string(),
            self.severity(),
        )
        .with_rule_id(self.rule_id())
        .with_snippet(build_snippet(instructions, index, 1))]
    }
}

pub struct HexStringRule;

impl Rule for HexStringRule {
    fn rule_id(&self) -> &'static str {
        "HexStringRule"
    }

    fn description(&self) -> &'static str {
        "Hex-encoded string literal"
    }

    fn severity(&self) -> Severity {
        Severity::Low
    }

    fn analyze_instructions(
        &self,
        _module: &ParsedModule,
        method: &MethodDef,
        instructions: &[Instruction],
        signals: &mut MethodSignals,
        ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        let min_len = ctx.config.minimum_encoded_string_length;
        let mut findings = Vec::new();
        for (idx, instr) in instructions.iter().enumerate() {
            let Operand::String(s) = &instr.operand else { continue };
            if !strings::is_likely_encoded(s, min_len) || strings::try_decode(s).is_none() {
                continue;
            }
            if !is_hex_shaped(s) {
                continue;
            }
            signals.encoded_strings = true;
            signals.mark_rule_triggered(self.rule_id());
            findings.push(
                Finding::new(
                    format!("{}:{}", method.full_name(), instr.offset),
                    "Hex-encoded string literal decoded at runtime".to_string(),
                    self.severity(),
                )
                .with_rule_id(self.rule_id())
                .with_snippet(build_snippet(instructions, idx, 1)),
            );
        }
        findings
    }
}

fn is_hex_shaped(s: &str) -> bool {
    let stripped = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    stripped.len() >= 8 && stripped.len() % 2 == 0 && stripped.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct EncodedStringLiteralRule;

impl Rule for EncodedStringLiteralRule {
    fn rule_id(&self) -> &'static str {
        "EncodedStringLiteralRule"
    }

    fn description(&self) -> &'static str {
        "Tokenized/encoded string literal"
    }

    fn severity(&self) -> Severity {
        Severity::Low
    }

    fn analyze_instructions(
        &self,
        _module: &ParsedModule,
        method: &MethodDef,
        instructions: &[Instruction],
        signals: &mut MethodSignals,
        ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        let min_len = ctx.config.minimum_encoded_string_length;
        let mut findings = Vec::new();
        for (idx, instr) in instructions.iter().enumerate() {
            let Operand::String(s) = &instr.operand else { continue };
            let Some(decoded) = strings::try_decode(s) else { continue };
            if !strings::is_likely_encoded(s, min_len) {
                continue;
            }
            signals.encoded_strings = true;
            signals.mark_rule_triggered(self.rule_id());
            findings.push(
                Finding::new(
                    format!("{}:{}", method.full_name(), instr.offset),
                    format!("Encoded string literal decodes to: {decoded}"),
                    self.severity(),
                )
                .with_rule_id(self.rule_id())
                .with_snippet(build_snippet(instructions, idx, 1)),
            );
        }
        findings
    }
}

pub struct EncodedStringPipelineRule;

impl Rule for EncodedStringPipelineRule {
    fn rule_id(&self) -> &'static str {
        "EncodedStringPipelineRule"
    }

    fn description(&self) -> &'static str {
        "Multi-stage string decode pipeline"
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn requires_companion_finding(&self) -> bool {
        true
    }

    fn analyze_instructions(
        &self,
        _module: &ParsedModule,
        method: &MethodDef,
        instructions: &[Instruction],
        signals: &mut MethodSignals,
        _ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        let decode_indices: Vec<usize> = instructions
            .iter()
            .enumerate()
            .filter_map(|(idx, i)| match &i.operand {
                Operand::Method(m) if is_decode_call(m) => Some(idx),
                _ => None,
            })
            .collect();
        if decode_indices.len() < 2 {
            return Vec::new();
        }
        signals.encoded_strings = true;
        signals.mark_rule_triggered(self.rule_id());
        let first = decode_indices[0];
        vec![Finding::new(
            format!("{}:{}", method.full_name(), instructions[first].offset),
            format!("String decode pipeline: {} chained decode operations", decode_indices.len()),
            self.severity(),
        )
        .with_rule_id(self.rule_id())
        .with_snippet(build_snippet(instructions, first, 2))]
    }
}

fn is_decode_call(m: &MethodRef) -> bool {
    matches!(
        (m.declaring_type.as_str(), m.name.as_str()),
        ("System.Convert", "FromBase64String")
            | ("System.Text.Encoding", "GetString")
            | ("System.Text.Encoding", "GetBytes")
    )
}

pub struct EncodedBlobSplittingRule;

impl Rule for EncodedBlobSplittingRule {
    fn rule_id(&self) -> &'static str {
        "EncodedBlobSplittingRule"
    }

    fn description(&self) -> &'static str {
        "Tokenized/split encoded blob"
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn analyze_instructions(
        &self,
        _module: &ParsedModule,
        method: &MethodDef,
        instructions: &[Instruction],
        signals: &mut MethodSignals,
        ctx: &mut ScanContext,
    ) -> Vec<Finding> {
        let min_len = ctx.config.minimum_encoded_string_length;
        let mut findings = Vec::new();
        for (idx, instr) in instructions.iter().enumerate() {
            let Operand::String(s) = &instr.operand else { continue };
            let separator_count = s.chars().filter(|c| "-`:, ".contains(*c)).count();
            if separator_count <= 3 || !strings::is_likely_encoded(s, min_len) {
                continue;
            }
            let Some(decoded) = strings::try_decode(s) else { continue };
            signals.encoded_strings = true;
            signals.mark_rule_triggered(self.rule_id());
            findings.push(
                Finding::new(
                    format!("{}:{}", method.full_name(), instr.offset),
                    format!("Encoded blob split across separators decodes to: {decoded}"),
                    self.severity(),
                )
                .with_rule_id(self.rule_id())
                .with_snippet(build_snippet(instructions, idx, 1)),
            );
        }
        findings
    }
}

pub struct ByteArrayManipulationRule;

impl Rule for ByteArrayManipulationRule {
    fn rule_id(&self) -> &'static str {
        "ByteArrayManipulationRule"
    }

    fn description(&self) -> &'static str {
        "Byte-array manipulation alongside encoded data"
    }

    fn severity(&self) -> Severity {
        Severity::Low
    }

    fn requires_companion_finding(&self) -> bool {
        true
    }

    fn is_suspicious(&self, call: &MethodRef) -> bool {
        (call.declaring_type == "System.Array" && call.name == "Reverse")
            || (call.declaring_type == "System.Buffer" && call.name == "BlockCopy")
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
        if !signals.encoded_strings && !signals.base64 {
            return Vec::new();
        }
        signals.mark_rule_triggered(self.rule_id());
        let offset = instructions[index].offset;
        vec![Finding::new(
            format!("{}:{offset}", method.full_name()),
            "Byte-array manipulation (reverse/copy) alongside encoded data".to_string(),
            self.severity(),
        )
        .with_rule_id(self.rule_id())
        .with_snippet(build_snippet(instructions, index, 1))]
    }
}

fn nearby_string_literal(instructions: &[Instruction], index: usize) -> Option<String> {
    let start = index.saturating_sub(3);
    instructions[start..index].iter().rev().find_map(|i| match &i.operand {
        Operand::String(s) => Some(s.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;
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

    fn str_instr(offset: u32, s: &str) -> Instruction {
        Instruction::new(offset, Opcode::LdStr, Operand::String(s.to_string()))
    }

    fn call(offset: u32, declaring_type: &str, name: &str) -> Instruction {
        Instruction::new(
            offset,
            Opcode::Call,
            Operand::Method(MethodRef {
                declaring_type: declaring_type.into(),
                name: name.into(),
                param_count: 1,
                has_this: false,
                returns_void: false,
            }),
        )
    }

    #[test]
    fn base64_rule_flags_encoded_literal() {
        let module = empty_module();
        let method = empty_method();
        let seq = vec![
            str_instr(0, "48656C6C6F576F726C64"),
            call(1, "System.Convert", "FromBase64String"),
        ];
        let mut signals = MethodSignals::default();
        let mut ctx = ScanContext::new(ScanConfig::default());
        let findings = Base64Rule.analyze_contextual_pattern(&module, &method, &seq, 1, &mut signals, &mut ctx);
        assert_eq!(findings.len(), 1);
        assert!(signals.base64);
    }

    #[test]
    fn encoded_string_pipeline_requires_two_decode_calls() {
        let module = empty_module();
        let method = empty_method();
        let seq = vec![
            call(0, "System.Convert", "FromBase64String"),
            call(1, "System.Text.Encoding", "GetString"),
        ];
        let mut signals = MethodSignals::default();
        let mut ctx = ScanContext::new(ScanConfig::default());
        let findings = EncodedStringPipelineRule.analyze_instructions(&module, &method, &seq, &mut signals, &mut ctx);
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn byte_array_manipulation_requires_existing_encoded_signal() {
        let module = empty_module();
        let method = empty_method();
        let seq = vec![call(0, "System.Array", "Reverse")];
        let mut signals = MethodSignals::default();
        let mut ctx = ScanContext::new(ScanConfig::default());
        let findings =
            ByteArrayManipulationRule.analyze_contextual_pattern(&module, &method, &seq, 0, &mut signals, &mut ctx);
        assert!(findings.is_empty());

        signals.encoded_strings = true;
        let findings =
            ByteArrayManipulationRule.analyze_contextual_pattern(&module, &method, &seq, 0, &mut signals, &mut ctx);
        assert_eq!(findings.len(), 1);
    }
}
