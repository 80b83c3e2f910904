use serde::{Deserialize, Serialize};

/// Every scan tunable. Unknown keys are ignored by `serde`'s default
/// deserialization behavior; absent keys fall back to [`Default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub minimum_encoded_string_length: usize,
    pub detect_assembly_metadata: bool,
    pub enable_multi_signal: bool,
    pub analyze_exception_handlers: bool,
    pub analyze_local_variables: bool,
    pub analyze_property_accessors: bool,
    pub developer_mode: bool,
    pub deep_analysis: DeepAnalysisConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            minimum_encoded_string_length: 10,
            detect_assembly_metadata: true,
            enable_multi_signal: true,
            analyze_exception_handlers: true,
            analyze_local_variables: true,
            analyze_property_accessors: true,
            developer_mode: false,
            deep_analysis: DeepAnalysisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepAnalysisConfig {
    pub enable: bool,
    pub emit_diagnostic_findings: bool,
    pub require_correlated_base_finding: bool,
    pub deep_scan_only_flagged_methods: bool,
    pub enable_string_decode_flow: bool,
    pub enable_execution_chain: bool,
    pub enable_resource_payload: bool,
    pub enable_dynamic_load_correlation: bool,
    pub enable_native_interop_correlation: bool,
    pub enable_script_host_launch: bool,
    pub enable_environment_pivot: bool,
    pub enable_network_to_execution: bool,
    pub max_deep_methods_per_assembly: usize,
    pub max_analysis_time_ms_per_method: u64,
}

impl Default for DeepAnalysisConfig {
    fn default() -> Self {
        Self {
            enable: true,
            emit_diagnostic_findings: true,
            require_correlated_base_finding: false,
            deep_scan_only_flagged_methods: true,
            enable_string_decode_flow: true,
            enable_execution_chain: true,
            enable_resource_payload: true,
            enable_dynamic_load_correlation: true,
            enable_native_interop_correlation: true,
            enable_script_host_launch: true,
            enable_environment_pivot: true,
            enable_network_to_execution: true,
            max_deep_methods_per_assembly: 64,
            max_analysis_time_ms_per_method: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_ignored_and_absent_keys_default() {
        let parsed: ScanConfig =
            serde_json::from_str(r#"{"minimum_encoded_string_length": 20, "bogus_key": true}"#)
                .unwrap();
        assert_eq!(parsed.minimum_encoded_string_length, 20);
        assert!(parsed.detect_assembly_metadata);
        assert!(parsed.deep_analysis.enable);
    }
}
