use thiserror::Error;

/// Internal fallible-operation error type. Every variant is caught at a pass
/// boundary (Method/Type/Assembly Scanner, Deep Orchestrator, metadata scan)
/// and folded into a [`crate::model::ScanDiagnostic`] — none ever escape
/// [`crate::assembly_scanner::scan`].
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("rule {rule_id} failed at {location}: {reason}")]
    RuleFailed {
        rule_id: String,
        location: String,
        reason: String,
    },

    #[error("rule {rule_id} panicked at {location}")]
    RulePanicked { rule_id: String, location: String },

    #[error("instruction value resolution aborted: {reason}")]
    ResolutionAborted { reason: String },

    #[error("could not decode embedded resource {resource}: {reason}")]
    ResourceDecodeFailed { resource: String, reason: String },

    #[error("recursive assembly rescan failed: {reason}")]
    RescanFailed { reason: String },

    #[error("module parsing failed: {0}")]
    ParseFailed(#[from] anyhow::Error),
}
