use serde::{Deserialize, Serialize};

use super::finding::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallChainNodeKind {
    EntryPoint,
    IntermediateCall,
    SuspiciousDeclaration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallChainNode {
    pub location: String,
    pub description: String,
    pub kind: CallChainNodeKind,
    pub snippet: Option<String>,
}

/// A consolidated caller chain from zero or more entry points through
/// intermediate callers to a suspicious declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallChain {
    pub id: String,
    pub rule_id: String,
    pub severity: Severity,
    pub summary: String,
    pub nodes: Vec<CallChainNode>,
}

impl CallChain {
    /// Combined snippet: every node's snippet, blank-line separated, in order.
    pub fn combined_snippet(&self) -> String {
        self.nodes
            .iter()
            .filter_map(|n| n.snippet.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_snippet_joins_with_blank_line() {
        let chain = CallChain {
            id: "chain-0".into(),
            rule_id: "DllImportRule".into(),
            severity: Severity::High,
            summary: "s".into(),
            nodes: vec![
                CallChainNode {
                    location: "A.B:1".into(),
                    description: "caller".into(),
                    kind: CallChainNodeKind::IntermediateCall,
                    snippet: Some("call void A::B()".into()),
                },
                CallChainNode {
                    location: "C.D:0".into(),
                    description: "decl".into(),
                    kind: CallChainNodeKind::SuspiciousDeclaration,
                    snippet: Some("pinvoke kernel32.dll!CreateRemoteThread".into()),
                },
            ],
        };
        assert_eq!(
            chain.combined_snippet(),
            "call void A::B()\n\npinvoke kernel32.dll!CreateRemoteThread"
        );
    }
}
