use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::buffer::DEFAULT_BUFFER_SIZE;

/// Environment variable overriding [`Config::config_dir`]
pub const ENV_CONFIG_DIR: &str = "NGINX_CUSTOM_CONFIG";
/// Environment variable overriding [`Config::template_dir`]
pub const ENV_TEMPLATE_DIR: &str = "NGINX_CONFIG_TMPL";

/// Configuration for the synchronizer
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Root of the generated configuration tree
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Directory holding nginx.tmpl, servers.tmpl and upstreams-tcp.tmpl
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    /// Capacity of pooled render buffers in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// External configuration validator
    #[serde(default)]
    pub check: CheckConfig,

    /// External normalization filter
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckConfig {
    /// Command line run to validate the whole tree (default: "nginx -t")
    #[serde(default = "default_check_command")]
    pub command: String,

    /// Seconds before a running check counts as failed (0 = no limit)
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
}

impl CheckConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            command: default_check_command(),
            timeout_secs: default_check_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CleanupConfig {
    /// Filter command reading rendered text on stdin, writing it on stdout
    #[serde(default = "default_cleanup_command")]
    pub command: String,

    /// Squeeze blank lines in-process instead of running `command`
    #[serde(default)]
    pub builtin: bool,

    /// Milliseconds before the filter is abandoned (0 = no limit)
    #[serde(default = "default_cleanup_timeout")]
    pub timeout_ms: u64,
}

impl CleanupConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            command: default_cleanup_command(),
            builtin: false,
            timeout_ms: default_cleanup_timeout(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/run/nginx/conf")
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("/run/nginxtmp/tmpl")
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_check_command() -> String {
    "nginx -t".to_string()
}

fn default_check_timeout() -> u64 {
    30
}

fn default_cleanup_command() -> String {
    "/run/ingress-controller/clean-nginx-conf.sh".to_string()
}

fn default_cleanup_timeout() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            template_dir: default_template_dir(),
            buffer_size: default_buffer_size(),
            check: CheckConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `NGINX_CUSTOM_CONFIG` and `NGINX_CONFIG_TMPL`; empty values are ignored
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ENV_CONFIG_DIR).filter(|v| !v.is_empty()) {
            self.config_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_TEMPLATE_DIR).filter(|v| !v.is_empty()) {
            self.template_dir = PathBuf::from(dir);
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.buffer_size == 0 {
            errors.push("'buffer_size' must be greater than 0".to_string());
        }
        if let Err(e) = check_command_line("check.command", &self.check.command) {
            errors.push(e);
        }
        if !self.cleanup.builtin {
            if let Err(e) = check_command_line("cleanup.command", &self.cleanup.command) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn check_command_line(field: &str, line: &str) -> Result<(), String> {
    match shell_words::split(line) {
        Ok(words) if words.is_empty() => Err(format!("'{}' must not be empty", field)),
        Ok(_) => Ok(()),
        Err(e) => Err(format!("'{}' cannot be parsed: {}", field, e)),
    }
}
