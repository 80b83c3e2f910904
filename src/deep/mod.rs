//! Second-pass correlator: promotes a subset of already-scanned
//! methods and runs specialized analyzers over each one's signals and
//! findings, looking for the multi-signal patterns that a single-rule pass
//! cannot see on its own.

mod analyzers;

use std::time::Instant;

use tracing::debug;

use crate::bytecode::{EntryPointProvider, MethodDef, ParsedModule, TypeDef};
use crate::config::DeepAnalysisConfig;
use crate::context::ScanContext;
use crate::model::{Finding, MethodSignals};
use crate::rules::SEED_RULE_IDS;

/// Everything one specialized analyzer needs: the method under analysis,
/// its folded signals, the findings already collected at method/type/
/// namespace scope (used to detect correlating base findings), and the
/// raw instruction sequence for literal/call-site inspection.
pub struct DeepBehaviorContext<'a> {
    pub method: &'a MethodDef,
    pub signals: &'a MethodSignals,
    pub method_findings: &'a [Finding],
    pub type_findings: &'a [Finding],
    pub namespace_findings: &'a [Finding],
}

impl DeepBehaviorContext<'_> {
    pub fn instructions(&self) -> &[crate::bytecode::Instruction] {
        self.method.instructions()
    }

    fn combined(&self) -> impl Iterator<Item = &Finding> {
        self.method_findings
            .iter()
            .chain(self.type_findings)
            .chain(self.namespace_findings)
    }

    pub fn has_rule(&self, rule_id: &str) -> bool {
        self.combined().any(|f| f.rule_id.as_deref() == Some(rule_id))
    }

    pub fn has_any_rule(&self, rule_ids: &[&str]) -> bool {
        rule_ids.iter().any(|id| self.has_rule(id))
    }

    pub fn distinct_sink_count(&self) -> usize {
        let mut sinks = 0;
        if self.signals.process_like {
            sinks += 1;
        }
        if self.has_rule("AssemblyDynamicLoadRule") {
            sinks += 1;
        }
        if self.signals.network {
            sinks += 1;
        }
        if self.signals.file_write {
            sinks += 1;
        }
        sinks
    }
}

/// Walks every type in module order, promotes eligible methods, and runs
/// the seven specialized analyzers over each one. `findings_so_far` is the
/// combined output of the method/type/assembly passes, used both to find
/// seed-rule triggers and to build each method's correlation scope.
pub fn run(
    module: &ParsedModule,
    entry_points: &dyn EntryPointProvider,
    ctx: &mut ScanContext,
    findings_so_far: &[Finding],
) -> Vec<Finding> {
    let deep = ctx.config.deep_analysis.clone();
    if !deep.enable {
        return Vec::new();
    }

    let mut promoted = 0usize;
    let mut out = Vec::new();

    for ty in &module.types {
        out.extend(scan_type_for_deep_analysis(
            module,
            ty,
            entry_points,
            ctx,
            findings_so_far,
            &deep,
            &mut promoted,
        ));
    }

    if !deep.emit_diagnostic_findings {
        return Vec::new();
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn scan_type_for_deep_analysis(
    module: &ParsedModule,
    ty: &TypeDef,
    entry_points: &dyn EntryPointProvider,
    ctx: &mut ScanContext,
    findings_so_far: &[Finding],
    deep: &DeepAnalysisConfig,
    promoted: &mut usize,
) -> Vec<Finding> {
    let mut out = Vec::new();
    let type_key = ty.full_name();
    let namespace = ty.namespace.clone();

    let type_findings: Vec<Finding> = findings_so_far
        .iter()
        .filter(|f| f.location.starts_with(&format!("{type_key}.")) || f.location == format!("{type_key}:0"))
        .cloned()
        .collect();
    let namespace_findings: Vec<Finding> = findings_so_far
        .iter()
        .filter(|f| !namespace.is_empty() && f.location.starts_with(&format!("{namespace}.")))
        .cloned()
        .collect();

    for method in &ty.methods {
        if *promoted >= deep.max_deep_methods_per_assembly {
            break;
        }
        let method_key = method.full_name();
        let Some(signals) = ctx.signals.method_signals(&method_key).cloned() else {
            continue;
        };
        let method_findings: Vec<Finding> = findings_so_far
            .iter()
            .filter(|f| f.location.starts_with(&format!("{method_key}:")))
            .cloned()
            .collect();

        if !is_promotion_eligible(method, &signals, &method_findings, entry_points, deep) {
            continue;
        }
        *promoted += 1;

        let combined_is_empty = method_findings.is_empty() && type_findings.is_empty() && namespace_findings.is_empty();
        if deep.require_correlated_base_finding && combined_is_empty {
            continue;
        }

        let dctx = DeepBehaviorContext {
            method,
            signals: &signals,
            method_findings: &method_findings,
            type_findings: &type_findings,
            namespace_findings: &namespace_findings,
        };

        out.extend(run_analyzers_with_budget(&dctx, deep));
    }

    for nested in &ty.nested_types {
        out.extend(scan_type_for_deep_analysis(
            module,
            nested,
            entry_points,
            ctx,
            findings_so_far,
            deep,
            promoted,
        ));
    }

    out
}

fn is_promotion_eligible(
    method: &MethodDef,
    signals: &MethodSignals,
    method_findings: &[Finding],
    entry_points: &dyn EntryPointProvider,
    deep: &DeepAnalysisConfig,
) -> bool {
    if method.instructions.is_none() {
        return false;
    }
    if !deep.deep_scan_only_flagged_methods {
        return true;
    }
    let has_seed_finding = method_findings
        .iter()
        .any(|f| f.rule_id.as_deref().map(|id| SEED_RULE_IDS.contains(&id)).unwrap_or(false));
    if has_seed_finding {
        return true;
    }
    if signals.is_critical_combination() || signals.is_high_risk_combination() {
        return true;
    }
    if signals.signal_count() >= 3 {
        return true;
    }
    entry_points.is_entry_point(method) && !method_findings.is_empty()
}

/// Runs each enabled analyzer in turn, aborting the remaining ones for this
/// method once `max_analysis_time_ms_per_method` elapses. Findings already
/// produced before the deadline are kept.
fn run_analyzers_with_budget(ctx: &DeepBehaviorContext<'_>, deep: &DeepAnalysisConfig) -> Vec<Finding> {
    let deadline = Instant::now();
    let budget = std::time::Duration::from_millis(deep.max_analysis_time_ms_per_method);
    let mut out = Vec::new();

    let analyzers: Vec<(bool, fn(&DeepBehaviorContext<'_>) -> Vec<Finding>)> = vec![
        (deep.enable_execution_chain, analyzers::execution_chain as fn(&DeepBehaviorContext<'_>) -> Vec<Finding>),
        (deep.enable_string_decode_flow, analyzers::string_decode_flow),
        (deep.enable_resource_payload, analyzers::resource_payload),
        (deep.enable_dynamic_load_correlation, analyzers::dynamic_load_correlation),
        (deep.enable_native_interop_correlation, analyzers::native_interop_correlation),
        (deep.enable_script_host_launch, analyzers::script_host_launch),
        (deep.enable_environment_pivot, analyzers::environment_pivot),
    ];

    for (enabled, analyzer) in analyzers {
        if !enabled {
            continue;
        }
        if deadline.elapsed() > budget {
            debug!(method = %ctx.method.full_name(), "deep analysis time budget exhausted; skipping remaining analyzers");
            break;
        }
        out.extend(analyzer(ctx));
    }
    out
}
