//! Core analysis pipeline for a static malware-behavior scanner over parsed
//! managed-code (CIL) modules. The crate never parses bytecode itself; it
//! consumes an already-parsed [`bytecode::ParsedModule`] and returns an
//! ordered, deduplicated list of [`model::Finding`]s.
//!
//! The external entry point is [`assembly_scanner::scan`].

pub mod assembly_scanner;
pub mod bytecode;
pub mod call_graph;
pub mod config;
pub mod context;
pub mod dataflow_analyzer;
pub mod datasets;
pub mod deep;
pub mod error;
pub mod model;
pub mod reflection_detector;
pub mod resolver;
pub mod rules;
pub mod scanner;
pub mod signal_tracker;
pub mod snippet;
pub mod strings;

pub use assembly_scanner::scan;
pub use config::{DeepAnalysisConfig, ScanConfig};
pub use error::ScanError;
pub use model::{Finding, ScanDiagnostic, ScanOutcome, Severity};
pub use rules::RuleRegistry;
