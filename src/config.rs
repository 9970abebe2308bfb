//! Orus configuration.
//!
//! Handles parsing and management of `orus.toml` configuration files plus
//! the `ORUS_*` environment overrides. Precedence is file < environment <
//! command-line flags; the binary applies its flags on top of what `load`
//! and `apply_env` produce.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching orus.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrusConfig {
    /// Trace every instruction through the dispatch loop
    #[serde(default)]
    pub trace_execution: bool,

    /// Developer diagnostics in the VM
    #[serde(default)]
    pub debug_mode: bool,

    /// Start the interactive prompt when no input file is given
    #[serde(default)]
    pub repl_mode: bool,

    /// Script to run
    #[serde(default)]
    pub input_file: Option<PathBuf>,

    /// Time compile and execute phases separately
    #[serde(default)]
    pub benchmark_mode: bool,

    /// Stage dumps
    #[serde(default)]
    pub show_ast: bool,
    #[serde(default)]
    pub show_bytecode: bool,
    #[serde(default)]
    pub show_tokens: bool,
    #[serde(default)]
    pub show_optimization_stats: bool,

    /// VM profiling master switch plus per-area flags
    #[serde(default)]
    pub vm_profiling_enabled: bool,
    #[serde(default)]
    pub profiling: ProfilingConfig,

    /// Where profiling output goes (stdout when unset)
    #[serde(default)]
    pub profile_output: Option<PathBuf>,

    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub quiet: bool,

    /// Explicit config path (otherwise orus.toml is searched upward)
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    /// Logging settings, seeded from ORUS_LOG_*
    #[serde(default)]
    pub logging: LogConfig,
}

/// Per-area profiling switches.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfilingConfig {
    #[serde(default)]
    pub instructions: bool,
    #[serde(default)]
    pub hot_paths: bool,
    #[serde(default)]
    pub registers: bool,
    #[serde(default)]
    pub memory_access: bool,
    #[serde(default)]
    pub branches: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `orus::vm=trace`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub timestamp: bool,

    /// Include module path and line in log lines
    #[serde(default)]
    pub location: bool,

    /// `stderr` (default) or a file path
    #[serde(default)]
    pub output: Option<String>,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            colors: true,
            timestamp: false,
            location: false,
            output: None,
        }
    }
}

impl OrusConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: OrusConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join("orus.toml");
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                // Reached root without finding a config file.
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay the `ORUS_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(level) = std::env::var("ORUS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = env_bool("ORUS_LOG_COLORS") {
            self.logging.colors = v;
        }
        if let Some(v) = env_bool("ORUS_LOG_TIMESTAMP") {
            self.logging.timestamp = v;
        }
        if let Some(v) = env_bool("ORUS_LOG_LOCATION") {
            self.logging.location = v;
        }
        if let Ok(output) = std::env::var("ORUS_LOG_OUTPUT") {
            self.logging.output = Some(output);
        }
        if let Some(v) = env_bool("ORUS_DEBUG") {
            self.debug_mode = v;
        }
        if let Some(v) = env_bool("ORUS_TRACE") {
            self.trace_execution = v;
        }
        if let Ok(path) = std::env::var("ORUS_CONFIG_FILE") {
            self.config_file = Some(PathBuf::from(path));
        }
    }
}

/// Parse a boolean-ish environment value: 1/true/yes/on.
fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrusConfig::default();
        assert!(!config.trace_execution);
        assert!(!config.vm_profiling_enabled);
        assert_eq!(config.logging.level, "warn");
        assert!(config.logging.colors);
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
trace_execution = true
show_bytecode = true
vm_profiling_enabled = true

[profiling]
instructions = true
branches = true

[logging]
level = "debug"
colors = false
"#;
        let config: OrusConfig = toml::from_str(toml_str).unwrap();
        assert!(config.trace_execution);
        assert!(config.show_bytecode);
        assert!(config.vm_profiling_enabled);
        assert!(config.profiling.instructions);
        assert!(config.profiling.branches);
        assert!(!config.profiling.hot_paths);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.colors);
    }

    #[test]
    fn test_roundtrip() {
        let mut config = OrusConfig::default();
        config.benchmark_mode = true;
        config.profiling.registers = true;
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: OrusConfig = toml::from_str(&text).unwrap();
        assert!(parsed.benchmark_mode);
        assert!(parsed.profiling.registers);
    }
}
