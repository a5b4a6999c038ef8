use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

/// 設定ファイルパスを上書きする環境変数
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// load_config は CONFIG_PATH（未設定なら config/config.yaml）から設定を読み込む。
pub fn load_config<T: DeserializeOwned + Default>() -> Result<T, ConfigError> {
    load_config_from(std::env::var(CONFIG_PATH_ENV).ok().as_deref())
}

/// load_config_from は明示されたパスから設定を読み込む。
/// パスが明示されておらず既定パスにファイルが無い場合はデフォルト値を返す。
/// 明示されたパスのファイルが無い場合はエラーになる。
pub fn load_config_from<T: DeserializeOwned + Default>(
    explicit: Option<&str>,
) -> Result<T, ConfigError> {
    let path = Path::new(explicit.unwrap_or(DEFAULT_CONFIG_PATH));
    if explicit.is_none() && !path.exists() {
        tracing::info!(path = %path.display(), "設定ファイルが無いためデフォルト設定を使用します");
        return Ok(T::default());
    }
    load_yaml(path)
}

/// load_yaml は YAML ファイルを読み込んでデシリアライズする。空のファイルはデフォルト値になる。
pub fn load_yaml<T: DeserializeOwned + Default>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
