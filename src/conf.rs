//! The serializable configuration data structures used for setup, plus the
//! process-wide terminating flag the loop consults on every tick.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_cfg_ver")]
    pub version: u32,

    /// Keep the loop alive until the engine is told to terminate, even once
    /// every remaining source is a dont-count source.
    #[serde(default)]
    pub exit_only_after_terminate: bool,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Where the driver binary writes its JSON run summary, if anywhere.
    #[serde(default)]
    pub summary_log: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_cfg_ver(),
            exit_only_after_terminate: false,
            log_filter: default_log_filter(),
            summary_log: None,
        }
    }
}

fn default_cfg_ver() -> u32 {
    1
}

fn default_log_filter() -> String {
    "info".to_string()
}

static TERMINATING: AtomicBool = AtomicBool::new(false);

/// Marks the engine as terminating. A plain atomic store, so it is safe to
/// call from signal context.
pub fn set_terminating() {
    TERMINATING.store(true, Ordering::SeqCst);
}

pub fn terminating() -> bool {
    TERMINATING.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_apply_to_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.version, 1);
        assert!(!config.exit_only_after_terminate);
        assert_eq!(config.log_filter, "info");
        assert!(config.summary_log.is_none());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config: Config = toml::from_str(
            "version = 2\nexit_only_after_terminate = true\nlog_filter = \"debug\"\nsummary_log = \"run.json\"\n",
        )
        .unwrap();
        assert_eq!(config.version, 2);
        assert!(config.exit_only_after_terminate);
        assert_eq!(config.summary_log, Some(PathBuf::from("run.json")));
    }
}
