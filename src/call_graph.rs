//! Consolidates suspicious declarations (P/Invoke imports, reflection
//! targets, etc.) with every recorded caller into call-chain findings.

use rustc_hash::FxHashMap;

use crate::bytecode::EntryPointProvider;
use crate::model::{CallChain, CallChainNode, CallChainNodeKind, Finding, Severity};

#[derive(Debug, Clone)]
pub struct SuspiciousDeclaration {
    pub method_key: String,
    pub rule_id: String,
    pub severity: Severity,
    pub description: String,
    pub developer_guidance: Option<String>,
    pub snippet: Option<String>,
    pub location: String,
}

#[derive(Debug, Clone)]
pub struct CallSite {
    pub caller_key: String,
    pub caller_location: String,
    pub offset: u32,
    pub snippet: Option<String>,
    pub context: Option<String>,
}

#[derive(Default)]
pub struct CallGraphBuilder {
    declarations: FxHashMap<String, SuspiciousDeclaration>,
    call_sites: FxHashMap<String, Vec<CallSite>>,
    next_chain_id: usize,
}

impl CallGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent on `method_key`: a second registration for the same
    /// declaration is ignored.
    pub fn register_declaration(&mut self, decl: SuspiciousDeclaration) {
        self.declarations.entry(decl.method_key.clone()).or_insert(decl);
    }

    /// Idempotent on `(caller_key, offset)` per callee.
    pub fn register_call_site(&mut self, callee_key: &str, site: CallSite) {
        let sites = self.call_sites.entry(callee_key.to_string()).or_default();
        if !sites
            .iter()
            .any(|s| s.caller_key == site.caller_key && s.offset == site.offset)
        {
            sites.push(site);
        }
    }

    pub fn declaration_count(&self) -> usize {
        self.declarations.len()
    }

    /// For every declaration: one consolidated finding listing each distinct
    /// caller as an `IntermediateCall` (promoted to `EntryPoint` when
    /// `entry_points` classifies its caller method as one), followed by the
    /// declaration node. Declarations with no recorded caller get a
    /// standalone "no callers detected" finding instead.
    pub fn build_call_chain_findings(&mut self, is_entry_point: &dyn Fn(&str) -> bool) -> Vec<Finding> {
        let mut findings = Vec::new();
        let mut decls: Vec<_> = self.declarations.values().cloned().collect();
        decls.sort_by(|a, b| a.method_key.cmp(&b.method_key));

        for decl in decls {
            let sites = self.call_sites.get(&decl.method_key).cloned().unwrap_or_default();
            if sites.is_empty() {
                let mut finding = Finding::new(
                    decl.location.clone(),
                    format!("{} — no callers detected for {}", decl.description, decl.method_key),
                    decl.severity,
                )
                .with_rule_id(decl.rule_id.clone());
                if let Some(g) = &decl.developer_guidance {
                    finding = finding.with_guidance(g.clone());
                }
                if let Some(s) = &decl.snippet {
                    finding = finding.with_snippet(s.clone());
                }
                findings.push(finding);
                continue;
            }

            let mut nodes = Vec::new();
            let mut caller_names = Vec::new();
            let mut seen_callers = std::collections::BTreeSet::new();
            for site in &sites {
                if !seen_callers.insert(site.caller_key.clone()) {
                    continue;
                }
                let kind = if is_entry_point(&site.caller_key) {
                    CallChainNodeKind::EntryPoint
                } else {
                    CallChainNodeKind::IntermediateCall
                };
                caller_names.push(site.caller_key.clone());
                nodes.push(CallChainNode {
                    location: site.caller_location.clone(),
                    description: format!("calls {}", decl.method_key),
                    kind,
                    snippet: site.snippet.clone(),
                });
            }
            nodes.push(CallChainNode {
                location: decl.location.clone(),
                description: decl.description.clone(),
                kind: CallChainNodeKind::SuspiciousDeclaration,
                snippet: decl.snippet.clone(),
            });

            let preview: Vec<_> = caller_names.iter().take(3).cloned().collect();
            let mut summary = format!(
                "{} — Hidden in {}, invoked from: {}",
                decl.description,
                decl.method_key,
                preview.join(", "),
            );
            if caller_names.len() > 3 {
                summary.push_str(&format!(" (+{} more)", caller_names.len() - 3));
            }
            let contexts: Vec<_> = sites.iter().filter_map(|s| s.context.clone()).take(2).collect();
            for c in &contexts {
                summary.push_str(&format!(" [{c}]"));
            }

            self.next_chain_id += 1;
            let chain = CallChain {
                id: format!("chain-{}", self.next_chain_id),
                rule_id: decl.rule_id.clone(),
                severity: decl.severity,
                summary: summary.clone(),
                nodes,
            };

            let mut finding = Finding::new(decl.location.clone(), summary, decl.severity)
                .with_rule_id(decl.rule_id.clone())
                .with_call_chain(chain);
            if let Some(g) = &decl.developer_guidance {
                finding = finding.with_guidance(g.clone());
            }
            findings.push(finding);
        }

        findings
    }
}

pub fn default_entry_point_predicate<'a>(
    provider: &'a dyn EntryPointProvider,
    methods_by_key: &'a FxHashMap<String, crate::bytecode::MethodDef>,
) -> impl Fn(&str) -> bool + 'a {
    move |key: &str| {
        methods_by_key
            .get(key)
            .map(|m| provider.is_entry_point(m))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(key: &str) -> SuspiciousDeclaration {
        SuspiciousDeclaration {
            method_key: key.to_string(),
            rule_id: "DllImportRule".into(),
            severity: Severity::High,
            description: "P/Invoke to kernel32!CreateRemoteThread".into(),
            developer_guidance: None,
            snippet: Some("pinvoke kernel32.dll!CreateRemoteThread".into()),
            location: format!("{key}:0"),
        }
    }

    #[test]
    fn declaration_with_no_callers_gets_standalone_finding() {
        let mut builder = CallGraphBuilder::new();
        builder.register_declaration(decl("Native.Kernel32.CreateRemoteThread"));
        let findings = builder.build_call_chain_findings(&|_| false);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("no callers detected"));
    }

    #[test]
    fn declaration_registration_is_idempotent() {
        let mut builder = CallGraphBuilder::new();
        builder.register_declaration(decl("X.Y.Z"));
        builder.register_declaration(decl("X.Y.Z"));
        assert_eq!(builder.declaration_count(), 1);
    }

    #[test]
    fn call_site_dedup_is_per_caller_and_offset() {
        let mut builder = CallGraphBuilder::new();
        let site = CallSite {
            caller_key: "A.B.Main".into(),
            caller_location: "A.B.Main:5".into(),
            offset: 5,
            snippet: None,
            context: None,
        };
        builder.register_call_site("X.Y.Z", site.clone());
        builder.register_call_site("X.Y.Z", site);
        builder.register_declaration(decl("X.Y.Z"));
        let findings = builder.build_call_chain_findings(&|_| false);
        let chain = findings[0].call_chain.as_ref().unwrap();
        // one caller node + one declaration node
        assert_eq!(chain.nodes.len(), 2);
    }

    #[test]
    fn consolidated_summary_lists_up_to_three_callers_and_overflow_count() {
        let mut builder = CallGraphBuilder::new();
        for i in 0..5 {
            builder.register_call_site(
                "X.Y.Z",
                CallSite {
                    caller_key: format!("Caller{i}"),
                    caller_location: format!("Caller{i}:0"),
                    offset: 0,
                    snippet: None,
                    context: None,
                },
            );
        }
        builder.register_declaration(decl("X.Y.Z"));
        let findings = builder.build_call_chain_findings(&|_| false);
        assert!(findings[0].description.contains("+2 more"));
    }
}
