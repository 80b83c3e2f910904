//! Builds per-method source→transform→sink chains and merges them across
//! call edges where a conservative cross-method match exists.

use rustc_hash::FxHashSet;

use crate::bytecode::{Instruction, MethodRef, Opcode, Operand};
use crate::datasets::RuleDataSets;
use crate::model::{
    DataFlowChain, DataFlowNode, DataFlowNodeKind, DataFlowPattern, Finding, Severity,
};
use crate::snippet::build_snippet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Network,
    FileRead,
    Resource,
    Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransformKind {
    Decode,
    Decrypt,
    Decompress,
    Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkKind {
    Process,
    AssemblyLoad,
    FileWrite,
    NetworkUpload,
    ReflectionInvoke,
    RegistryWrite,
}

fn classify_source(m: &MethodRef) -> Option<SourceKind> {
    match (m.declaring_type.as_str(), m.name.as_str()) {
        ("System.Net.WebClient", "DownloadData" | "DownloadString" | "DownloadFile") => {
            Some(SourceKind::Network)
        }
        ("System.Net.Http.HttpClient", n) if n.starts_with("Get") => Some(SourceKind::Network),
        ("System.IO.File", "ReadAllBytes" | "ReadAllText" | "OpenRead") => Some(SourceKind::FileRead),
        ("System.Reflection.Assembly", "GetManifestResourceStream") => Some(SourceKind::Resource),
        ("System.Environment", "GetEnvironmentVariable" | "GetFolderPath") => {
            Some(SourceKind::Environment)
        }
        _ => None,
    }
}

fn classify_transform(m: &MethodRef) -> Option<TransformKind> {
    match (m.declaring_type.as_str(), m.name.as_str()) {
        ("System.Convert", "FromBase64String") => Some(TransformKind::Decode),
        (t, "TransformFinalBlock" | "CreateDecryptor") if is_crypto_type(t) => {
            Some(TransformKind::Decrypt)
        }
        (t, _) if is_compression_type(t) => Some(TransformKind::Decompress),
        ("System.Text.Encoding", "GetString" | "GetBytes") => Some(TransformKind::Encoding),
        _ => None,
    }
}

fn classify_sink(m: &MethodRef) -> Option<SinkKind> {
    match (m.declaring_type.as_str(), m.name.as_str()) {
        ("System.Diagnostics.Process", "Start") => Some(SinkKind::Process),
        (t, "Load" | "LoadFrom" | "LoadFile") if t == "System.Reflection.Assembly" => {
            Some(SinkKind::AssemblyLoad)
        }
        ("System.IO.File", "WriteAllBytes" | "WriteAllText" | "Create") => Some(SinkKind::FileWrite),
        ("System.Net.WebClient", "UploadData" | "UploadString" | "UploadFile") => {
            Some(SinkKind::NetworkUpload)
        }
        ("System.Net.Http.HttpClient", "PostAsync" | "PutAsync") => Some(SinkKind::NetworkUpload),
        (t, "Invoke") if t == "System.Reflection.MethodInfo" || t == "System.Reflection.MethodBase" => {
            Some(SinkKind::ReflectionInvoke)
        }
        ("Microsoft.Win32.RegistryKey", n) if n.starts_with("Set") => Some(SinkKind::RegistryWrite),
        _ => None,
    }
}

fn is_crypto_type(t: &str) -> bool {
    ["Aes", "Rijndael", "DES", "TripleDES", "RC2"]
        .iter()
        .any(|c| t.ends_with(*c) || t.contains(&format!("{c}CryptoServiceProvider")))
}

fn is_compression_type(t: &str) -> bool {
    t.ends_with("GZipStream") || t.ends_with("DeflateStream") || t.ends_with("BrotliStream")
}

struct SingleMethodChain {
    method_key: String,
    location: String,
    source_offset: u32,
    source_kind: SourceKind,
    source_snippet: String,
    transforms: Vec<TransformKind>,
    sink_kind: SinkKind,
    sink_offset: u32,
    sink_snippet: String,
    has_concrete_literal: bool,
    literals: Vec<String>,
    pending_callee: Option<String>,
}

#[derive(Default)]
pub struct DataflowAnalyzer {
    chains: Vec<DataFlowChain>,
    call_edges: Vec<(String, String)>,
    next_id: usize,
}

impl DataflowAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans one method's instructions for a source→(transform)*→sink
    /// chain, records any call edges observed along the way, and appends a
    /// chain to the internal set when a sink follows a source.
    pub fn analyze_method(
        &mut self,
        method_key: &str,
        location_prefix: &str,
        instructions: &[Instruction],
        datasets: &RuleDataSets,
    ) {
        let mut active: Option<SingleMethodChain> = None;

        for (idx, instr) in instructions.iter().enumerate() {
            if let Operand::String(s) = &instr.operand {
                if let Some(chain) = active.as_mut() {
                    chain.literals.push(s.clone());
                }
                continue;
            }
            let Operand::Method(m) = &instr.operand else {
                continue;
            };
            if !matches!(instr.opcode, Opcode::Call | Opcode::CallVirt) {
                continue;
            }
            self.call_edges.push((method_key.to_string(), m.full_name()));

            if let Some(source_kind) = classify_source(m) {
                active = Some(SingleMethodChain {
                    method_key: method_key.to_string(),
                    location: format!("{location_prefix}:{}", instr.offset),
                    source_offset: instr.offset,
                    source_kind,
                    source_snippet: build_snippet(instructions, idx, 1),
                    transforms: Vec::new(),
                    sink_kind: SinkKind::Process,
                    sink_offset: 0,
                    sink_snippet: String::new(),
                    has_concrete_literal: literal_nearby(instructions, idx),
                    literals: Vec::new(),
                    pending_callee: None,
                });
                continue;
            }

            if let Some(chain) = active.as_mut() {
                if let Some(t) = classify_transform(m) {
                    chain.transforms.push(t);
                    continue;
                }
                if let Some(sink_kind) = classify_sink(m) {
                    chain.sink_kind = sink_kind;
                    chain.sink_offset = instr.offset;
                    chain.sink_snippet = build_snippet(instructions, idx, 1);
                    let finished = active.take().unwrap();
                    if let Some(df) = self.classify_and_build(finished, datasets) {
                        self.chains.push(df);
                    }
                } else if is_user_defined_call(m) {
                    chain.pending_callee = Some(m.full_name());
                }
            }
        }
    }

    /// Conservative cross-method merge: only when call edge A→B is on
    /// record AND B independently produced its own suspicious chain. Either
    /// a merged chain is produced or nothing is — no edge is invented.
    pub fn run_cross_method_pass(&mut self) {
        let edges = self.call_edges.clone();
        let mut merged = Vec::new();
        for (caller, callee) in &edges {
            let callee_chain_idx = self
                .chains
                .iter()
                .position(|c| c.involved_methods.contains(callee) && !c.is_cross_method);
            let Some(callee_idx) = callee_chain_idx else {
                continue;
            };
            let caller_chain_idx = self
                .chains
                .iter()
                .position(|c| c.involved_methods.contains(caller) && !c.is_cross_method);
            let Some(caller_idx) = caller_chain_idx else {
                continue;
            };
            if caller_idx == callee_idx {
                continue;
            }

            let caller_chain = self.chains[caller_idx].clone();
            let callee_chain = self.chains[callee_idx].clone();

            self.next_id += 1;
            let mut nodes = caller_chain.nodes.clone();
            nodes.push(DataFlowNode {
                location: caller_chain.method_location.clone(),
                operation: format!("calls {callee}"),
                kind: DataFlowNodeKind::Intermediate,
                data_description: "cross-method boundary".into(),
                instruction_offset: 0,
                snippet: None,
                method_key: Some(caller.clone()),
                is_method_boundary: true,
                target_method_key: Some(callee.clone()),
            });
            nodes.extend(callee_chain.nodes.clone());

            let mut involved = FxHashSet::default();
            involved.insert(caller.clone());
            involved.insert(callee.clone());

            let pattern = if callee_chain.pattern.is_suspicious() {
                callee_chain.pattern
            } else {
                caller_chain.pattern
            };
            let severity = pattern.severity().unwrap_or(Severity::Low);
            let confidence = (caller_chain.confidence.max(callee_chain.confidence) + 0.1).min(1.0);

            merged.push(DataFlowChain {
                id: format!("dataflow-cross-{}", self.next_id),
                pattern,
                severity,
                confidence,
                summary: format!(
                    "{} continues into {} ({})",
                    caller_chain.summary, callee, callee_chain.summary
                ),
                method_location: caller_chain.method_location.clone(),
                source_variable: caller_chain.source_variable.clone(),
                nodes,
                involved_methods: involved,
                is_cross_method: true,
            });
        }
        self.chains.extend(merged);
    }

    fn classify_and_build(&mut self, chain: SingleMethodChain, datasets: &RuleDataSets) -> Option<DataFlowChain> {
        let (pattern, mut confidence) = classify_pattern(&chain, datasets);
        if chain.has_concrete_literal {
            confidence += 0.2;
        }
        let confidence = confidence.min(1.0);

        let Some(severity) = pattern.severity() else {
            return Some(self.build_chain(chain, pattern, severity_default(), confidence));
        };
        Some(self.build_chain(chain, pattern, severity, confidence))
    }

    fn build_chain(
        &mut self,
        chain: SingleMethodChain,
        pattern: DataFlowPattern,
        severity: Severity,
        confidence: f32,
    ) -> DataFlowChain {
        self.next_id += 1;
        let mut nodes = vec![DataFlowNode {
            location: chain.location.clone(),
            operation: format!("{:?} source", chain.source_kind),
            kind: DataFlowNodeKind::Source,
            data_description: format!("{:?}", chain.source_kind),
            instruction_offset: chain.source_offset,
            snippet: Some(chain.source_snippet.clone()),
            method_key: Some(chain.method_key.clone()),
            is_method_boundary: false,
            target_method_key: None,
        }];
        for t in &chain.transforms {
            nodes.push(DataFlowNode {
                location: chain.location.clone(),
                operation: format!("{t:?} transform"),
                kind: DataFlowNodeKind::Transform,
                data_description: format!("{t:?}"),
                instruction_offset: chain.source_offset,
                snippet: None,
                method_key: Some(chain.method_key.clone()),
                is_method_boundary: false,
                target_method_key: None,
            });
        }
        nodes.push(DataFlowNode {
            location: format!("{}:{}", chain.method_key, chain.sink_offset),
            operation: format!("{:?} sink", chain.sink_kind),
            kind: DataFlowNodeKind::Sink,
            data_description: format!("{:?}", chain.sink_kind),
            instruction_offset: chain.sink_offset,
            snippet: Some(chain.sink_snippet.clone()),
            method_key: Some(chain.method_key.clone()),
            is_method_boundary: false,
            target_method_key: None,
        });

        let mut involved = FxHashSet::default();
        involved.insert(chain.method_key.clone());

        DataFlowChain {
            id: format!("dataflow-{}", self.next_id),
            pattern,
            severity,
            confidence,
            summary: format!(
                "{:?} source reaches {:?} sink in {}",
                chain.source_kind, chain.sink_kind, chain.method_key
            ),
            method_location: chain.location,
            source_variable: None,
            nodes,
            involved_methods: involved,
            is_cross_method: false,
        }
    }

    /// Converts every suspicious recorded chain into a `DataFlowAnalysis`
    /// finding; `Legitimate`/`Unknown` chains never surface.
    pub fn build_dataflow_findings(&self) -> Vec<Finding> {
        self.chains
            .iter()
            .filter(|c| c.pattern.is_suspicious())
            .map(|c| {
                let confidence_pct = (c.confidence * 100.0).round() as i32;
                Finding::new(
                    c.method_location.clone(),
                    format!("{} [{:?}, {confidence_pct}%]", c.summary, c.pattern),
                    c.severity,
                )
                .with_rule_id("DataFlowAnalysis")
                .with_data_flow_chain(c.clone())
            })
            .collect()
    }
}

fn severity_default() -> Severity {
    Severity::Low
}

fn literal_nearby(instructions: &[Instruction], idx: usize) -> bool {
    let start = idx.saturating_sub(2);
    instructions[start..idx]
        .iter()
        .any(|i| matches!(i.operand, Operand::String(_)))
}

fn is_user_defined_call(m: &MethodRef) -> bool {
    classify_source(m).is_none() && classify_transform(m).is_none() && classify_sink(m).is_none()
}

fn classify_pattern(chain: &SingleMethodChain, datasets: &RuleDataSets) -> (DataFlowPattern, f32) {
    use SinkKind::*;
    use SourceKind::*;
    let mut confidence = 0.5f32;
    let has_decode = chain
        .transforms
        .iter()
        .any(|t| matches!(t, TransformKind::Decode | TransformKind::Decrypt));
    let has_credential_literal = chain.literals.iter().any(|l| datasets.looks_like_credential(l));

    let pattern = match (chain.source_kind, chain.sink_kind) {
        (Network, Process) | (Network, AssemblyLoad) => DataFlowPattern::DownloadAndExecute,
        (FileRead, NetworkUpload) if has_credential_literal => DataFlowPattern::CredentialTheft,
        (FileRead, NetworkUpload) | (Environment, NetworkUpload) => DataFlowPattern::DataExfiltration,
        (Resource, AssemblyLoad) if has_decode => DataFlowPattern::DynamicCodeLoading,
        (Network, AssemblyLoad) if has_decode => DataFlowPattern::DynamicCodeLoading,
        (Network, FileWrite) => DataFlowPattern::RemoteConfigLoad,
        (_, RegistryWrite) if chain.source_kind == Environment || has_decode => {
            DataFlowPattern::ObfuscatedPersistence
        }
        _ => DataFlowPattern::Unknown,
    };

    if has_decode {
        confidence += 0.2;
    }
    if matches!(chain.sink_kind, Process | AssemblyLoad | NetworkUpload) {
        confidence += 0.1;
    }
    (pattern, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::MethodRef;

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
    fn network_source_into_process_sink_is_download_and_execute() {
        let mut analyzer = DataflowAnalyzer::new();
        let datasets = RuleDataSets::new();
        let seq = vec![
            call(0, "System.Net.WebClient", "DownloadData"),
            call(1, "System.Diagnostics.Process", "Start"),
        ];
        analyzer.analyze_method("X.Y.Main", "X.Y.Main", &seq, &datasets);
        let findings = analyzer.build_dataflow_findings();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("DownloadAndExecute"));
    }

    #[test]
    fn file_read_into_file_write_with_no_network_is_not_suspicious() {
        let mut analyzer = DataflowAnalyzer::new();
        let datasets = RuleDataSets::new();
        let seq = vec![
            call(0, "System.IO.File", "ReadAllBytes"),
            call(1, "System.IO.File", "WriteAllBytes"),
        ];
        analyzer.analyze_method("X.Y.Main", "X.Y.Main", &seq, &datasets);
        assert!(analyzer.build_dataflow_findings().is_empty());
    }

    #[test]
    fn confidence_is_capped_at_one() {
        let mut analyzer = DataflowAnalyzer::new();
        let datasets = RuleDataSets::new();
        let seq = vec![
            Instruction::new(0, Opcode::LdStr, Operand::String("x".into())),
            call(1, "System.Reflection.Assembly", "GetManifestResourceStream"),
            call(2, "System.Convert", "FromBase64String"),
            call(3, "System.Reflection.Assembly", "Load"),
        ];
        analyzer.analyze_method("X.Y.Main", "X.Y.Main", &seq, &datasets);
        let findings = analyzer.build_dataflow_findings();
        assert_eq!(findings.len(), 1);
        let chain = findings[0].data_flow_chain.as_ref().unwrap();
        assert!(chain.confidence <= 1.0);
    }

    #[test]
    fn file_read_with_credential_literal_into_network_upload_is_credential_theft() {
        let mut analyzer = DataflowAnalyzer::new();
        let datasets = RuleDataSets::new();
        let seq = vec![
            call(0, "System.IO.File", "ReadAllText"),
            Instruction::new(1, Opcode::LdStr, Operand::String("db_password".into())),
            call(2, "System.Net.WebClient", "UploadString"),
        ];
        analyzer.analyze_method("X.Y.Main", "X.Y.Main", &seq, &datasets);
        let findings = analyzer.build_dataflow_findings();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("CredentialTheft"));
    }

    #[test]
    fn file_read_without_credential_literal_into_network_upload_is_data_exfiltration() {
        let mut analyzer = DataflowAnalyzer::new();
        let datasets = RuleDataSets::new();
        let seq = vec![
            call(0, "System.IO.File", "ReadAllText"),
            call(1, "System.Net.WebClient", "UploadString"),
        ];
        analyzer.analyze_method("X.Y.Main", "X.Y.Main", &seq, &datasets);
        let findings = analyzer.build_dataflow_findings();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("DataExfiltration"));
    }
}
