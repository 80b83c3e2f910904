//! The single external entry point: drives the whole pipeline over one
//! already-parsed module in a fixed pass ordering and returns a
//! deterministic, deduplicated, severity-sorted finding list.

use std::panic::{self, AssertUnwindSafe};

use rustc_hash::FxHashMap;
use tracing::{info_span, warn};

use crate::bytecode::{EntryPointProvider, MethodDef, ParsedModule, ResolverProvider, TypeDef};
use crate::call_graph::default_entry_point_predicate;
use crate::config::ScanConfig;
use crate::context::ScanContext;
use crate::deep;
use crate::model::{Finding, ScanOutcome, Severity};
use crate::rules::RuleRegistry;
use crate::scanner;

/// Runs every analysis pass over `module` and returns the consolidated,
/// ordered outcome. `file_name` is carried through only for logging context;
/// the module handed in is already parsed. `resolver_provider` is accepted
/// only to be handed through to collaborators that need it; the core never
/// calls it.
pub fn scan(
    module: &ParsedModule,
    file_name: &str,
    config: ScanConfig,
    rules: &RuleRegistry,
    entry_points: &dyn EntryPointProvider,
    _resolver_provider: &dyn ResolverProvider,
) -> ScanOutcome {
    let _span = info_span!("scan", file_name, assembly = %module.assembly_name).entered();
    let mut ctx = ScanContext::new(config);
    let mut findings = Vec::new();

    findings.extend(scanner::scan_types(module, rules, &mut ctx));
    findings.extend(scanner::scan_assembly_metadata(module, rules, &mut ctx));

    let methods_by_key = index_methods(module);
    let is_entry_point = default_entry_point_predicate(entry_points, &methods_by_key);
    findings.extend(ctx.call_graph.build_call_chain_findings(&is_entry_point));

    ctx.dataflow.run_cross_method_pass();
    findings.extend(ctx.dataflow.build_dataflow_findings());

    findings.extend(deep::run(module, entry_points, &mut ctx, &findings));

    for rule in &rules.rules {
        let rule_id = rule.rule_id();
        let refined = panic::catch_unwind(AssertUnwindSafe(|| rule.post_analysis_refine(module, &findings, &mut ctx)));
        match refined {
            Ok(produced) => findings.extend(produced),
            Err(_) => {
                warn!(rule_id, "post-analysis refine panicked; skipping");
                ctx.record_diagnostic(rule_id, "post-analysis refine panicked and was skipped");
            }
        }
    }

    let findings = dedup_and_sort(findings);

    ScanOutcome {
        findings,
        diagnostics: ctx.diagnostics,
    }
}

fn index_methods(module: &ParsedModule) -> FxHashMap<String, MethodDef> {
    let mut out = FxHashMap::default();
    for ty in &module.types {
        index_type_methods(ty, &mut out);
    }
    out
}

fn index_type_methods(ty: &TypeDef, out: &mut FxHashMap<String, MethodDef>) {
    for method in &ty.methods {
        out.insert(method.full_name(), method.clone());
    }
    for nested in &ty.nested_types {
        index_type_methods(nested, out);
    }
}

fn dedup_and_sort(findings: Vec<Finding>) -> Vec<Finding> {
    let mut seen = std::collections::BTreeSet::new();
    let mut deduped: Vec<Finding> = findings
        .into_iter()
        .filter(|f| seen.insert(f.dedup_key()))
        .collect();

    deduped.sort_by(|a, b| severity_rank(b.severity).cmp(&severity_rank(a.severity)).then(a.location.cmp(&b.location)));
    deduped
}

fn severity_rank(severity: Severity) -> u8 {
    match severity {
        Severity::Low => 0,
        Severity::Medium => 1,
        Severity::High => 2,
        Severity::Critical => 3,
    }
}
