use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use super::finding::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFlowPattern {
    Legitimate,
    Unknown,
    DownloadAndExecute,
    DataExfiltration,
    DynamicCodeLoading,
    CredentialTheft,
    RemoteConfigLoad,
    ObfuscatedPersistence,
}

impl DataFlowPattern {
    /// `Legitimate` and `Unknown` never surface as findings.
    pub fn is_suspicious(&self) -> bool {
        !matches!(self, DataFlowPattern::Legitimate | DataFlowPattern::Unknown)
    }

    pub fn severity(&self) -> Option<Severity> {
        match self {
            DataFlowPattern::Legitimate | DataFlowPattern::Unknown => None,
            DataFlowPattern::RemoteConfigLoad => Some(Severity::Medium),
            DataFlowPattern::CredentialTheft
            | DataFlowPattern::ObfuscatedPersistence
            | DataFlowPattern::DataExfiltration => Some(Severity::High),
            DataFlowPattern::DownloadAndExecute | DataFlowPattern::DynamicCodeLoading => {
                Some(Severity::Critical)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFlowNodeKind {
    Source,
    Transform,
    Sink,
    Intermediate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFlowNode {
    pub location: String,
    pub operation: String,
    pub kind: DataFlowNodeKind,
    pub data_description: String,
    pub instruction_offset: u32,
    pub snippet: Option<String>,
    pub method_key: Option<String>,
    pub is_method_boundary: bool,
    pub target_method_key: Option<String>,
}

/// An ordered source→transform(s)→sink chain within or across methods,
/// classified into a named pattern with a confidence score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFlowChain {
    pub id: String,
    pub pattern: DataFlowPattern,
    pub severity: Severity,
    pub confidence: f32,
    pub summary: String,
    pub method_location: String,
    pub source_variable: Option<String>,
    pub nodes: Vec<DataFlowNode>,
    pub involved_methods: FxHashSet<String>,
    pub is_cross_method: bool,
}

impl DataFlowChain {
    pub fn call_depth(&self) -> usize {
        self.involved_methods.len().max(1)
    }
}
