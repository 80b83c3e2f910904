//! Centralized rule datasets: the safe-prefix list, mod-framework
//! allowlist, sensitive-folder literals, and credential-like literal
//! patterns. Built once per [`crate::rules::RuleRegistry::new`] and shared
//! by reference across rule instances — resolving the open question of
//! whether these sets are configurable by keeping them centralized rather
//! than scattered across individual rule implementations.

use once_cell::sync::Lazy;
use regex::Regex;

pub struct RuleDataSets {
    pub safe_assembly_prefixes: &'static [&'static str],
    pub mod_framework_types: &'static [&'static str],
    pub sensitive_folder_literals: &'static [&'static str],
    pub credential_literal_patterns: &'static [&'static str],
    pub costura_namespace_hint: &'static str,
}

impl RuleDataSets {
    pub fn new() -> Self {
        Self {
            safe_assembly_prefixes: SAFE_ASSEMBLY_PREFIXES,
            mod_framework_types: MOD_FRAMEWORK_TYPES,
            sensitive_folder_literals: SENSITIVE_FOLDER_LITERALS,
            credential_literal_patterns: CREDENTIAL_LITERAL_PATTERNS,
            costura_namespace_hint: "Costura",
        }
    }

    pub fn is_safe_assembly_name(&self, literal: &str) -> bool {
        self.safe_assembly_prefixes
            .iter()
            .any(|prefix| literal.starts_with(prefix))
    }

    pub fn is_mod_framework_type(&self, fq_type: &str) -> bool {
        self.mod_framework_types
            .iter()
            .any(|t| fq_type.contains(t))
    }

    pub fn is_sensitive_folder_literal(&self, literal: &str) -> bool {
        let lower = literal.to_ascii_lowercase();
        self.sensitive_folder_literals
            .iter()
            .any(|f| lower.contains(f))
    }

    pub fn looks_like_credential(&self, literal: &str) -> bool {
        CREDENTIAL_REGEX.is_match(literal)
    }

    pub fn is_costura_resource(&self, resource_name: &str) -> bool {
        resource_name.to_ascii_lowercase().starts_with("costura.")
    }
}

impl Default for RuleDataSets {
    fn default() -> Self {
        Self::new()
    }
}

const SAFE_ASSEMBLY_PREFIXES: &[&str] = &[
    "Il2Cpp",
    "Harmony",
    "Newtonsoft.Json",
    "UnityEngine",
    "MelonLoader",
    "BepInEx",
    "System",
    "Microsoft",
    "mscorlib",
    "netstandard",
];

const MOD_FRAMEWORK_TYPES: &[&str] = &["MelonEnvironment", "BepInEx.Paths"];

const SENSITIVE_FOLDER_LITERALS: &[&str] = &[
    "%appdata%",
    "%temp%",
    "%localappdata%",
    "startup",
    "\\windows\\system32",
    "\\programdata\\",
];

const CREDENTIAL_LITERAL_PATTERNS: &[&str] =
    &["password", "passwd", "token", "apikey", "api_key", "secret", "credential"];

static CREDENTIAL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)password|passwd|token|api[_-]?key|secret|credential").unwrap()
});
