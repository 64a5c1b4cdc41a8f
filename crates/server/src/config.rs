use std::path::Path;

use anyhow::{Context, Result};
use tandem_protocol::TandemConfig;

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<TandemConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(TandemConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: TandemConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Path::new("/nonexistent/tandem.toml")).unwrap();
        assert_eq!(config.server.port, 8470);
        assert_eq!(config.mirror.highlight_duration_ms, 2000);
    }

    #[test]
    fn reads_overrides_from_file() {
        let path = std::env::temp_dir().join(format!("tandem-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "[server]\nport = 9000\n\n[mirror]\npointer_throttle_ms = 20\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.mirror.pointer_throttle_ms, 20);
        assert_eq!(config.session.max_active_calls, 256);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("tandem-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[server\nport = ").unwrap();
        let result = load_config(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }
}
