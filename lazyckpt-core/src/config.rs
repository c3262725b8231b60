//! Configuration for loading checkpoints and setting up the parallel strategy.
//!
//! Layered with figment: built-in defaults, then the user config file, then
//! the workspace `.lazyckpt/config.toml`, then `LAZYCKPT_` environment
//! variables, then explicit overrides.

use crate::error::{CheckpointError, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LazyckptConfig {
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
}

/// How archives are read and written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Fail on globals that are neither builtins nor tensor rebuild functions.
    #[serde(default)]
    pub strict_globals: bool,
    /// Record holding the object graph.
    #[serde(default = "default_pickle_record")]
    pub pickle_record: String,
    /// Top-level directory name for new archives. Defaults to the file stem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_name: Option<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            strict_globals: false,
            pickle_record: default_pickle_record(),
            archive_name: None,
        }
    }
}

fn default_pickle_record() -> String {
    crate::archive::PICKLE_RECORD.to_string()
}

/// Size of one device-mesh dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MeshSizeRepr", into = "MeshSizeRepr")]
pub enum MeshSize {
    /// Inferred from the cluster layout.
    #[default]
    Auto,
    Fixed(usize),
}

impl fmt::Display for MeshSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshSize::Auto => f.write_str("auto"),
            MeshSize::Fixed(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MeshSizeRepr {
    Fixed(usize),
    Text(String),
}

impl TryFrom<MeshSizeRepr> for MeshSize {
    type Error = String;

    fn try_from(repr: MeshSizeRepr) -> Result<Self, Self::Error> {
        match repr {
            MeshSizeRepr::Fixed(0) => Err("mesh size must be positive".to_string()),
            MeshSizeRepr::Fixed(n) => Ok(MeshSize::Fixed(n)),
            MeshSizeRepr::Text(s) if s.eq_ignore_ascii_case("auto") => Ok(MeshSize::Auto),
            MeshSizeRepr::Text(s) => s
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .map(MeshSize::Fixed)
                .ok_or_else(|| format!("expected \"auto\" or a positive integer, got {s:?}")),
        }
    }
}

impl From<MeshSize> for MeshSizeRepr {
    fn from(size: MeshSize) -> Self {
        match size {
            MeshSize::Auto => MeshSizeRepr::Text("auto".to_string()),
            MeshSize::Fixed(n) => MeshSizeRepr::Fixed(n),
        }
    }
}

/// Data-parallel x tensor-parallel strategy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub data_parallel_size: MeshSize,
    #[serde(default)]
    pub tensor_parallel_size: MeshSize,
    /// Process group initialization timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            data_parallel_size: MeshSize::Auto,
            tensor_parallel_size: MeshSize::Auto,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl StrategyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    1800
}

/// Load configuration from all layers.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&LazyckptConfig>,
) -> Result<LazyckptConfig> {
    let mut figment = Figment::from(Serialized::defaults(LazyckptConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "lazyckpt", "lazyckpt") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".lazyckpt").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // LAZYCKPT_LOADER__STRICT_GLOBALS, LAZYCKPT_STRATEGY__TIMEOUT_SECS, ...
    figment = figment.merge(Env::prefixed("LAZYCKPT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment
        .extract()
        .map_err(|e| CheckpointError::Config(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LazyckptConfig::default();
        assert!(!config.loader.strict_globals);
        assert_eq!(config.loader.pickle_record, "data.pkl");
        assert_eq!(config.strategy.data_parallel_size, MeshSize::Auto);
        assert_eq!(config.strategy.timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = LazyckptConfig::default();
        overrides.strategy.tensor_parallel_size = MeshSize::Fixed(4);
        overrides.loader.strict_globals = true;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.strategy.tensor_parallel_size, MeshSize::Fixed(4));
        assert!(config.loader.strict_globals);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws_dir = dir.path().join(".lazyckpt");
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(
            ws_dir.join("config.toml"),
            r#"
[loader]
archive_name = "archive"

[strategy]
data_parallel_size = 2
tensor_parallel_size = "auto"
timeout_secs = 60
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.loader.archive_name.as_deref(), Some("archive"));
        assert_eq!(config.strategy.data_parallel_size, MeshSize::Fixed(2));
        assert_eq!(config.strategy.tensor_parallel_size, MeshSize::Auto);
        assert_eq!(config.strategy.timeout_secs, 60);
    }

    #[test]
    fn test_invalid_workspace_config_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let ws_dir = dir.path().join(".lazyckpt");
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(ws_dir.join("config.toml"), "[strategy]\ntimeout_secs = \"soon\"\n").unwrap();

        let err = load_config(Some(dir.path()), None).unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn test_mesh_size_rejects_zero_and_garbage() {
        assert!(MeshSize::try_from(MeshSizeRepr::Fixed(0)).is_err());
        assert!(MeshSize::try_from(MeshSizeRepr::Text("many".into())).is_err());
        assert_eq!(
            MeshSize::try_from(MeshSizeRepr::Text("8".into())).unwrap(),
            MeshSize::Fixed(8)
        );
    }
}
