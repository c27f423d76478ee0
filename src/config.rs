use std::path::{Path, PathBuf};

use anyhow::Context;
use kestrel_tools::ToolsConfig;
use serde::Deserialize;

fn default_filter() -> String {
    "info".into()
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to sensible defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str::<Self>(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("KESTREL_LOG") {
            self.log.filter = v;
        }
        if let Ok(v) = std::env::var("KESTREL_SHELL_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                self.tools.shell.timeout = secs;
            } else {
                tracing::warn!("ignoring invalid KESTREL_SHELL_TIMEOUT value: {v}");
            }
        }
        if let Ok(v) = std::env::var("KESTREL_SHELL_PTY") {
            if let Ok(pty) = v.parse::<bool>() {
                self.tools.shell.pty = pty;
            } else {
                tracing::warn!("ignoring invalid KESTREL_SHELL_PTY value: {v}");
            }
        }
        if let Ok(v) = std::env::var("KESTREL_AUDIT_DESTINATION") {
            self.tools.audit.enabled = true;
            self.tools.audit.destination = v;
        }
        if let Ok(v) = std::env::var("KESTREL_ORCHESTRATOR_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.tools.orchestrator.timeout_ms = ms;
            } else {
                tracing::warn!("ignoring invalid KESTREL_ORCHESTRATOR_TIMEOUT_MS value: {v}");
            }
        }
        if let Ok(v) = std::env::var("KESTREL_MAX_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                self.tools.orchestrator.max_retries = n;
            } else {
                tracing::warn!("ignoring invalid KESTREL_MAX_RETRIES value: {v}");
            }
        }
    }
}

pub fn resolve_config_path() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    if let Some(path) = args.windows(2).find(|w| w[0] == "--config").map(|w| &w[1]) {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("KESTREL_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("kestrel.toml")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use super::*;

    const ENV_VARS: &[&str] = &[
        "KESTREL_LOG",
        "KESTREL_SHELL_TIMEOUT",
        "KESTREL_SHELL_PTY",
        "KESTREL_AUDIT_DESTINATION",
        "KESTREL_ORCHESTRATOR_TIMEOUT_MS",
        "KESTREL_MAX_RETRIES",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn defaults_when_file_missing() {
        clear_env();
        let config = Config::load(Path::new("/nonexistent/kestrel.toml")).unwrap();
        assert_eq!(config.log.filter, "info");
        assert_eq!(config.tools.shell.timeout, 30);
        assert_eq!(config.tools.orchestrator.timeout_ms, 30_000);
        assert!(!config.tools.audit.enabled);
    }

    #[test]
    #[serial]
    fn parses_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[log]
filter = "kestrel_tools=debug"

[tools.shell]
timeout = 5
pty = false

[tools.orchestrator]
max_retries = 0
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.log.filter, "kestrel_tools=debug");
        assert_eq!(config.tools.shell.timeout, 5);
        assert!(!config.tools.shell.pty);
        assert_eq!(config.tools.orchestrator.max_retries, 0);
    }

    #[test]
    #[serial]
    fn invalid_file_is_an_error() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[tools.shell]\ntimeout = \"soon\"\n").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config file"));
    }

    #[test]
    #[serial]
    fn env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var("KESTREL_LOG", "debug");
            std::env::set_var("KESTREL_SHELL_TIMEOUT", "90");
            std::env::set_var("KESTREL_SHELL_PTY", "false");
            std::env::set_var("KESTREL_AUDIT_DESTINATION", "/tmp/kestrel-audit.jsonl");
            std::env::set_var("KESTREL_ORCHESTRATOR_TIMEOUT_MS", "1500");
            std::env::set_var("KESTREL_MAX_RETRIES", "7");
        }
        let config = Config::load(Path::new("/nonexistent/kestrel.toml")).unwrap();
        clear_env();

        assert_eq!(config.log.filter, "debug");
        assert_eq!(config.tools.shell.timeout, 90);
        assert!(!config.tools.shell.pty);
        assert!(config.tools.audit.enabled);
        assert_eq!(config.tools.audit.destination, "/tmp/kestrel-audit.jsonl");
        assert_eq!(config.tools.orchestrator.timeout_ms, 1500);
        assert_eq!(config.tools.orchestrator.max_retries, 7);
    }

    #[test]
    #[serial]
    fn invalid_env_values_are_ignored() {
        clear_env();
        unsafe {
            std::env::set_var("KESTREL_SHELL_TIMEOUT", "forever");
            std::env::set_var("KESTREL_MAX_RETRIES", "-1");
        }
        let config = Config::load(Path::new("/nonexistent/kestrel.toml")).unwrap();
        clear_env();

        assert_eq!(config.tools.shell.timeout, 30);
        assert_eq!(config.tools.orchestrator.max_retries, 3);
    }
}
