use dexop_k8s_util::error::{Error, Result};

use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD: &str = env!("DEX_OPERATOR_BUILD");

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
    pub build: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            version: VERSION,
            build: BUILD,
        }
    }
}

impl VersionInfo {
    pub fn render(&self, format: &OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Text => Ok(format!(
                "dex-operator version: {} (build: {})",
                self.version, self.build
            )),
            OutputFormat::Json => serde_json::to_string(self).map_err(|e| {
                Error::SerializationError("failed to serialize version".to_string(), e)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_text() {
        let info = VersionInfo {
            version: "1.2.3",
            build: "abc1234",
        };
        assert_eq!(
            info.render(&OutputFormat::Text).unwrap(),
            "dex-operator version: 1.2.3 (build: abc1234)"
        );
    }

    #[test]
    fn test_render_json() {
        let info = VersionInfo {
            version: "1.2.3",
            build: "abc1234",
        };
        assert_eq!(
            info.render(&OutputFormat::Json).unwrap(),
            r#"{"version":"1.2.3","build":"abc1234"}"#
        );
    }

    #[test]
    fn test_default_uses_build_info() {
        assert_eq!(VersionInfo::default().version, env!("CARGO_PKG_VERSION"));
    }
}
