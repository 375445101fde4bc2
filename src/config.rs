//! Runtime configuration types.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::runtime::objects::CompressedOops;

/// Runtime configuration for code installation and adapters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Print one line per relocated site and per installed artifact
    pub trace_install: bool,
    /// Print adapter cache misses/hits and native wrapper creation
    pub trace_adapters: bool,
    /// Check call-type tags against the callee's staticness
    pub verify_call_types: bool,
    pub compressed_oops: CompressedOops,
    /// Upper bound on bytes of generated adapter code (None = unlimited)
    pub max_adapter_code: Option<usize>,
    /// Alignment of the data section behind the code
    pub data_alignment: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trace_install: false,
            trace_adapters: false,
            verify_call_types: cfg!(debug_assertions),
            compressed_oops: CompressedOops::default(),
            max_adapter_code: None,
            data_alignment: 16,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let config: RuntimeConfig =
            toml::from_str(content).map_err(|e| format!("failed to parse config: {}", e))?;
        if !config.data_alignment.is_power_of_two() {
            return Err(format!(
                "data_alignment must be a power of two, got {}",
                config.data_alignment
            ));
        }
        config.compressed_oops.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(!config.trace_install);
        assert_eq!(config.verify_call_types, cfg!(debug_assertions));
        assert_eq!(config.data_alignment, 16);
        assert_eq!(config.compressed_oops.shift, 3);
    }

    #[test]
    fn test_parse_partial() {
        let config = RuntimeConfig::parse(
            r#"
trace_adapters = true
max_adapter_code = 4096

[compressed_oops]
base = 0x800000000
"#,
        )
        .unwrap();
        assert!(config.trace_adapters);
        assert_eq!(config.max_adapter_code, Some(4096));
        assert_eq!(config.compressed_oops.base, 0x8_0000_0000);
        assert_eq!(config.compressed_oops.shift, 3);
        assert_eq!(config.data_alignment, 16);
    }

    #[test]
    fn test_parse_rejects_bad_alignment() {
        let err = RuntimeConfig::parse("data_alignment = 12").unwrap_err();
        assert!(err.contains("power of two"));
    }

    #[test]
    fn test_parse_rejects_oversized_shift() {
        let err = RuntimeConfig::parse("[compressed_oops]\nshift = 64\n").unwrap_err();
        assert!(err.contains("shift"), "{}", err);
        assert!(RuntimeConfig::parse("[compressed_oops]\nshift = 32\n").is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jitlink.toml");
        fs::write(&path, "verify_call_types = true\n").unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert!(config.verify_call_types);

        assert!(RuntimeConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
