//! The scan-scoped mutable aggregate that replaces any rule-owned
//! mutable state such as the original `AssemblyDynamicLoad._pending_findings`
//! list. Owned by the Assembly Scanner facade for the duration of one
//! `scan()` call; rule hooks borrow it mutably one call at a time.

use rustc_hash::FxHashMap;

use crate::call_graph::CallGraphBuilder;
use crate::config::ScanConfig;
use crate::dataflow_analyzer::DataflowAnalyzer;
use crate::datasets::RuleDataSets;
use crate::model::{Finding, ScanDiagnostic};
use crate::signal_tracker::SignalTracker;

/// A finding staged by `AssemblyDynamicLoad` while it still needs the
/// resource rescan in `post_analysis_refine` to decide the final severity.
#[derive(Debug, Clone)]
pub struct PendingResourceLoad {
    pub resource_name: String,
    pub base_finding: Finding,
    pub base_total_score: u32,
}

#[derive(Default)]
pub struct ScanContext {
    pub signals: SignalTracker,
    pub call_graph: CallGraphBuilder,
    pub dataflow: DataflowAnalyzer,
    pub diagnostics: Vec<ScanDiagnostic>,
    pub pending_resource_loads: Vec<PendingResourceLoad>,
    /// Reflection findings deferred per-type, awaiting promotion once the
    /// type's full scan confirms a non-reflection rule also triggered.
    pub pending_reflection: FxHashMap<String, Vec<Finding>>,
    pub datasets: RuleDataSets,
    pub config: ScanConfig,
}

impl ScanContext {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            datasets: RuleDataSets::new(),
            ..Default::default()
        }
    }

    pub fn record_diagnostic(&mut self, location: impl Into<String>, message: impl Into<String>) {
        self.diagnostics.push(ScanDiagnostic {
            location: location.into(),
            message: message.into(),
        });
    }
}
