//! Orchestrator settings
//!
//! Loaded from a YAML settings file; the command-control URLs and the
//! callback domain have no sensible defaults and must be present.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Runtime settings for the orchestrator.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Base URL command-control posts callbacks to, e.g. `https://ci.example.com`.
    pub domain: String,

    /// Executor zone commands are dispatched into.
    pub zone: String,

    /// Command-control queue endpoint (session commands).
    pub queue_url: String,

    /// Command-control cmd endpoint (step dispatch).
    pub cmd_url: String,

    /// Command-control stop endpoint; the cmd id is appended.
    pub cmd_stop_url: String,

    /// Workers draining the callback queue.
    #[serde(default = "default_callback_workers")]
    pub callback_workers: usize,

    /// Bound of the callback queue; full means back-pressure on the webhook.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Prefix filter for step output envs.
    #[serde(default = "default_output_env_filter")]
    pub output_env_filter: String,
}

fn default_callback_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_output_env_filter() -> String {
    "FLOW_".to_string()
}

impl Settings {
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            domain: "http://orchestrator.test".into(),
            zone: "default".into(),
            queue_url: "http://cc.test/queue".into(),
            cmd_url: "http://cc.test/cmd".into(),
            cmd_stop_url: "http://cc.test/cmd/stop".into(),
            callback_workers: 2,
            queue_capacity: 32,
            output_env_filter: "FLOW_".into(),
        }
    }
}

/// Load settings from a YAML file.
/// This is the I/O boundary - it reads the file and delegates to serde.
pub fn load_settings_file(path: &Path) -> Result<Settings, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let settings = serde_yaml::from_str(&content)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SETTINGS: &str = r#"
domain: https://ci.example.com
zone: default
queue_url: http://cc.internal/queue
cmd_url: http://cc.internal/cmd
cmd_stop_url: http://cc.internal/cmd/stop
"#;

    #[test]
    fn test_load_settings_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SETTINGS.as_bytes()).unwrap();

        let settings = load_settings_file(file.path()).unwrap();
        assert_eq!(settings.domain, "https://ci.example.com");
        assert_eq!(settings.zone, "default");
        // defaults fill in
        assert_eq!(settings.callback_workers, 4);
        assert_eq!(settings.queue_capacity, 256);
        assert_eq!(settings.output_env_filter, "FLOW_");
    }

    #[test]
    fn test_load_settings_missing_required() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"domain: https://ci.example.com\n").unwrap();
        assert!(load_settings_file(file.path()).is_err());
    }

    #[test]
    fn test_load_settings_missing_file() {
        assert!(load_settings_file(Path::new("/nonexistent/settings.yml")).is_err());
    }
}
