//! Owns every method/type/assembly signal aggregate produced during one
//! scan. Combination predicates themselves live on
//! [`MethodSignals`]; this module is just the scan-scoped storage.

use rustc_hash::FxHashMap;

use crate::model::{MethodSignals, TypeSignals};

#[derive(Debug, Default)]
pub struct SignalTracker {
    method_signals: FxHashMap<String, MethodSignals>,
    type_signals: FxHashMap<String, TypeSignals>,
    assembly_signals: MethodSignals,
}

impl SignalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method_signals_mut(&mut self, method_key: &str) -> &mut MethodSignals {
        self.method_signals.entry(method_key.to_string()).or_default()
    }

    pub fn method_signals(&self, method_key: &str) -> Option<&MethodSignals> {
        self.method_signals.get(method_key)
    }

    pub fn type_signals_mut(&mut self, type_key: &str) -> &mut TypeSignals {
        self.type_signals.entry(type_key.to_string()).or_default()
    }

    pub fn type_signals(&self, type_key: &str) -> Option<&TypeSignals> {
        self.type_signals.get(type_key)
    }

    pub fn assembly_signals(&self) -> &MethodSignals {
        &self.assembly_signals
    }

    /// Folds a finished method's signals into its owning type and the
    /// assembly-wide aggregate. Called once the method's full pass
    /// (instructions, locals, exception handlers, accessors) has run.
    pub fn finish_method(&mut self, method_key: &str, type_key: &str) {
        let Some(method) = self.method_signals.get(method_key).cloned() else {
            return;
        };
        self.type_signals_mut(type_key).merge_method(&method);
        merge_into(&mut self.assembly_signals, &method);
    }
}

fn merge_into(target: &mut MethodSignals, source: &MethodSignals) {
    target.encoded_strings |= source.encoded_strings;
    target.suspicious_reflection |= source.suspicious_reflection;
    target.sensitive_folder |= source.sensitive_folder;
    target.process_like |= source.process_like;
    target.base64 |= source.base64;
    target.network |= source.network;
    target.file_write |= source.file_write;
    target.suspicious_locals |= source.suspicious_locals;
    target.suspicious_exception_handling |= source.suspicious_exception_handling;
    for rule in &source.triggered_rules {
        target.triggered_rules.insert(rule.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_method_merges_into_type_and_assembly() {
        let mut tracker = SignalTracker::new();
        tracker.method_signals_mut("X.Y.M").network = true;
        tracker.finish_method("X.Y.M", "X.Y");

        assert!(tracker.type_signals("X.Y").unwrap().aggregate.network);
        assert!(tracker.assembly_signals().network);
    }
}
