use serde::{Deserialize, Serialize};

use super::call_chain::CallChain;
use super::dataflow::DataFlowChain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single emitted finding. `(rule_id, location, description, severity)` is
/// the dedup key used by the facade's final consolidation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub location: String,
    pub description: String,
    pub severity: Severity,
    pub snippet: Option<String>,
    pub rule_id: Option<String>,
    pub developer_guidance: Option<String>,
    pub risk_score: Option<u8>,
    pub bypass_companion: bool,
    pub call_chain: Option<CallChain>,
    pub data_flow_chain: Option<DataFlowChain>,
}

impl Finding {
    pub fn new(location: impl Into<String>, description: impl Into<String>, severity: Severity) -> Self {
        Self {
            location: location.into(),
            description: description.into(),
            severity,
            snippet: None,
            rule_id: None,
            developer_guidance: None,
            risk_score: None,
            bypass_companion: false,
            call_chain: None,
            data_flow_chain: None,
        }
    }

    pub fn with_rule_id(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.developer_guidance = Some(guidance.into());
        self
    }

    pub fn with_risk_score(mut self, score: u8) -> Self {
        self.risk_score = Some(score.min(100));
        self
    }

    pub fn with_bypass_companion(mut self, bypass: bool) -> Self {
        self.bypass_companion = bypass;
        self
    }

    pub fn with_call_chain(mut self, chain: CallChain) -> Self {
        self.call_chain = Some(chain);
        self
    }

    pub fn with_data_flow_chain(mut self, chain: DataFlowChain) -> Self {
        self.data_flow_chain = Some(chain);
        self
    }

    /// `(rule id, location, description, severity)` — the dedup key.
    pub fn dedup_key(&self) -> (Option<String>, String, String, Severity) {
        (
            self.rule_id.clone(),
            self.location.clone(),
            self.description.clone(),
            self.severity,
        )
    }
}

/// A non-fatal issue observed during a scan (caught rule panic/error,
/// suppressed finding, exhausted budget). Never affects finding correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanDiagnostic {
    pub location: String,
    pub message: String,
}

/// The concrete return value of `scan()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub findings: Vec<Finding>,
    pub diagnostics: Vec<ScanDiagnostic>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_is_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn risk_score_is_clamped_to_100() {
        let f = Finding::new("X.Y:0", "d", Severity::Low).with_risk_score(250);
        assert_eq!(f.risk_score, Some(100));
    }
}
