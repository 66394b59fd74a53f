//! Configuration loader for weft.
//!
//! Reads `config.toml` from the data directory (`~/.weft/` by default) and
//! deserializes it into [`WeftConfig`]. Falls back to defaults when the file
//! is missing or malformed.

use std::path::Path;

use weft_types::config::WeftConfig;

use crate::sqlite::pool::database_url_in;

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`WeftConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_config(data_dir: &Path) -> WeftConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return WeftConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return WeftConfig::default();
        }
    };

    match toml::from_str::<WeftConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            WeftConfig::default()
        }
    }
}

/// Resolve the checkpoint database URL.
///
/// Priority:
/// 1. `checkpoint.database_url` from `config.toml`
/// 2. `weft.db` inside `data_dir`
pub fn resolve_database_url(config: &WeftConfig, data_dir: &Path) -> String {
    match &config.checkpoint.database_url {
        Some(url) => url.clone(),
        None => database_url_in(data_dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use weft_types::config::ValidationMode;

    #[tokio::test]
    async fn load_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).await;
        assert_eq!(config, WeftConfig::default());
    }

    #[tokio::test]
    async fn load_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[engine]
max_subworkflow_depth = 2
validation = "lenient"

[logging]
json = true
"#,
        )
        .await
        .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.engine.max_subworkflow_depth, 2);
        assert_eq!(config.engine.validation, ValidationMode::Lenient);
        assert_eq!(config.engine.step_timeout_secs, 300);
        assert!(config.logging.json);
    }

    #[tokio::test]
    async fn load_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config, WeftConfig::default());
    }

    #[test]
    fn resolve_database_url_prefers_config() {
        let mut config = WeftConfig::default();
        let dir = Path::new("/srv/weft");
        assert_eq!(resolve_database_url(&config, dir), "sqlite:///srv/weft/weft.db");

        config.checkpoint.database_url = Some("sqlite::memory:".to_string());
        assert_eq!(resolve_database_url(&config, dir), "sqlite::memory:");
    }
}
