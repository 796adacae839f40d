use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::capability::Capability;

/// Environment variable naming the extension library to load.
pub const EXTENSION_ENV: &str = "FUSEKIT_EXT_LIB";

/// Where to find a compiled kernel extension and what it must provide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    pub library_path: PathBuf,
    /// Capabilities whose absence fails the load instead of being logged.
    #[serde(default)]
    pub require: Vec<Capability>,
}

impl ExtensionConfig {
    pub fn new(library_path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: library_path.into(),
            require: Vec::new(),
        }
    }

    pub fn require(mut self, caps: &[Capability]) -> Self {
        self.require.extend_from_slice(caps);
        self
    }

    /// Config from `FUSEKIT_EXT_LIB`, or `None` when it is unset or empty.
    pub fn from_env() -> Option<Self> {
        std::env::var_os(EXTENSION_ENV)
            .filter(|v| !v.is_empty())
            .map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_defaults_require() {
        let cfg: ExtensionConfig = serde_json::from_str(r#"{"library_path": "/opt/libfused.so"}"#).unwrap();
        assert_eq!(cfg.library_path, PathBuf::from("/opt/libfused.so"));
        assert!(cfg.require.is_empty());
    }

    #[test]
    fn test_builder() {
        let cfg = ExtensionConfig::new("libx.so").require(&Capability::RMS_NORM);
        assert_eq!(cfg.require, vec![Capability::RmsNorm, Capability::RmsNormBwd]);
    }
}
