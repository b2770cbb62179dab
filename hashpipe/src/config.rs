//! Supervisor startup configuration.
//!
//! Loaded from `$HASHPIPE_CONFIG`, falling back to `/etc/hashpipe/
//! hashpipe.toml`, falling back silently to `Config::default()` if the
//! file is missing or fails to parse. This governs only the supervisor
//! binary's own startup knobs (log level, spawn pacing, default wait
//! timeout); per-worker runtime parameters remain status buffer
//! `-o KEY=VALUE` options as described for the pipeline CLI.

use std::path::PathBuf;

use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/hashpipe/hashpipe.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_spawn_delay_ms")]
    pub spawn_delay_ms: u64,
    #[serde(default = "default_instance_id")]
    pub default_instance_id: i32,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: f32,
}

fn default_spawn_delay_ms() -> u64 {
    50
}

fn default_instance_id() -> i32 {
    0
}

fn default_join_timeout_secs() -> f32 {
    5.0
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            spawn_delay_ms: default_spawn_delay_ms(),
            default_instance_id: default_instance_id(),
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let path = std::env::var("HASHPIPE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Config::default(),
        };

        match toml::from_str(&contents) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("failed to parse {}: {e}; using defaults", path.display());
                Config::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn default_config_has_sane_values() {
        let cfg = Config::default();
        assert_eq!(cfg.runtime.spawn_delay_ms, 50);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn load_reads_overridden_path() {
        let _g = ENV_LOCK.lock().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [runtime]
            spawn_delay_ms = 200

            [logging]
            level = "debug"
            "#
        )
        .unwrap();
        unsafe { std::env::set_var("HASHPIPE_CONFIG", file.path()) };
        let cfg = Config::load();
        assert_eq!(cfg.runtime.spawn_delay_ms, 200);
        assert_eq!(cfg.logging.level, "debug");
        unsafe { std::env::remove_var("HASHPIPE_CONFIG") };
    }

    #[test]
    fn load_falls_back_to_default_on_missing_file() {
        let _g = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("HASHPIPE_CONFIG", "/nonexistent/hashpipe.toml") };
        let cfg = Config::load();
        assert_eq!(cfg.runtime.spawn_delay_ms, 50);
        unsafe { std::env::remove_var("HASHPIPE_CONFIG") };
    }
}
