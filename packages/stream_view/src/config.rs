use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use stream_mux::{StreamConfig, StreamFileConfig};

/// Directory holding `config.toml`: `--config-dir`, else `<config dir>/bmview`.
pub fn config_dir(custom: Option<PathBuf>) -> PathBuf {
    custom.unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bmview")
    })
}

/// Build a figment that layers: defaults → config.toml → BMVIEW_* env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(StreamFileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("BMVIEW_").split("__"))
}

/// Extract the layered file config.
pub fn file_config(config_dir: &Path) -> Result<StreamFileConfig> {
    load_config(config_dir)
        .extract()
        .with_context(|| format!("Failed to load configuration from {}", config_dir.display()))
}

/// Validate into the runtime configuration.
pub fn resolve(file: &StreamFileConfig) -> Result<StreamConfig> {
    StreamConfig::from_file(file).context("Invalid stream configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stream_mux::DistributionMode;

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc = file_config(tmp.path()).unwrap();
        assert_eq!(fc.endpoint, "ws://127.0.0.1:8088/video");
        assert_eq!(fc.cycle_interval_ms, 800);
        assert_eq!(fc.mode, DistributionMode::Shared);
        assert!(fc.channels.is_empty());
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "endpoint = \"wss://bm.example/video\"\n\
             mode = \"dedicated\"\n\
             dedicated_endpoint = \"wss://bm.example/video/{channel}\"\n\
             max_retries = 3\n\
             channels = [\"task/1\", \"task/2\"]\n",
        )
        .unwrap();
        let fc = file_config(tmp.path()).unwrap();
        assert_eq!(fc.mode, DistributionMode::Dedicated);
        assert_eq!(fc.max_retries, 3);
        assert_eq!(fc.channels, ["task/1", "task/2"]);
        // Untouched fields keep their defaults
        assert_eq!(fc.settling_period_ms, 200);

        let config = resolve(&fc).unwrap();
        assert!(config.dedicated_endpoint.channel_in_url());
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.mux.cycle_interval, Duration::from_millis(800));
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "endpoint = \"http://bm/video\"\n").unwrap();
        let fc = file_config(tmp.path()).unwrap();
        assert!(resolve(&fc).is_err());
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "cycle_interval_ms = \"soon\"\n").unwrap();
        assert!(file_config(tmp.path()).is_err());
    }

    #[test]
    fn test_config_dir_override() {
        let custom = PathBuf::from("/tmp/bmview-test");
        assert_eq!(config_dir(Some(custom.clone())), custom);
        assert!(config_dir(None).ends_with("bmview"));
    }
}
