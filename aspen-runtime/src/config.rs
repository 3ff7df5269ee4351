//! Runtime Configuration
//!
//! Configuration for the Aspen runtime. Settings can be supplied
//! programmatically through the builder or loaded from environment
//! variables. The clone-semantics settings form a strategy record selected
//! once at startup; nothing in the hot paths re-reads the environment.
//!
//! # Environment Variables
//!
//! All environment variables use the `ASPEN_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `ASPEN_CLONE_MODE` | Clone strategy ("lazy"/"eager") | lazy |
//! | `ASPEN_READ_ONLY_OPT` | Resolve ordinary reads without cloning ("true"/"false") | true |
//! | `ASPEN_MEMO_INITIAL_SIZE` | Initial memo table capacity (power of two) | 8 |
//! | `ASPEN_MEMORY_POOL` | Use the pooled bin allocator ("true"/"false") | true |
//! | `ASPEN_MAX_THREADS` | Maximum tracked threads, fixed at start | 4x CPUs, min 64 |
//! | `ASPEN_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use aspen_runtime::config::{RuntimeConfig, CloneMode};
//!
//! let config = RuntimeConfig::builder()
//!     .clone_mode(CloneMode::Lazy)
//!     .initial_memo_size(16)
//!     .build()
//!     .unwrap();
//! aspen_runtime::init_with_config(config);
//! ```

use std::env;
use std::sync::OnceLock;

use thiserror::Error;

use crate::log::{LogFormat, LogLevel};

/// Clone strategy for the pointer family used by generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloneMode {
    /// Deferred copy-on-write cloning through fork contexts (default).
    #[default]
    Lazy,
    /// Immediate deep copy at the point of `clone`.
    Eager,
}

impl CloneMode {
    /// Parse a clone mode from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "lazy" | "cow" => Some(CloneMode::Lazy),
            "eager" | "deep" => Some(CloneMode::Eager),
            _ => None,
        }
    }

    /// String representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloneMode::Lazy => "lazy",
            CloneMode::Eager => "eager",
        }
    }
}

/// Clone-semantics configuration.
#[derive(Debug, Clone)]
pub struct CloneConfig {
    /// Clone strategy.
    /// Default: [`CloneMode::Lazy`].
    pub mode: CloneMode,

    /// Resolve ordinary reads through `pull` (no forced clone) rather
    /// than `get`.
    /// Default: true.
    pub read_only_optimization: bool,

    /// Initial capacity of each memo table. Must be a power of two.
    /// Default: 8.
    pub initial_memo_size: usize,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            mode: CloneMode::Lazy,
            read_only_optimization: true,
            initial_memo_size: 8,
        }
    }
}

/// Memory configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Use the per-thread size-binned pool allocator. When false, every
    /// allocation goes straight to the system allocator.
    /// Default: true.
    pub pooled: bool,

    /// Maximum number of threads the runtime will track. Fixed at process
    /// start; sizes the pool table.
    /// Default: 4x available parallelism, at least 64.
    pub max_threads: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pooled: true,
            max_threads: crate::thread::default_max_threads(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Output format.
    /// Default: plain text.
    pub format: LogFormat,

    /// Include timestamps in log output.
    /// Default: true.
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Plain,
            timestamps: true,
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Clone-semantics configuration.
    pub clone: CloneConfig,

    /// Memory configuration.
    pub memory: MemoryConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for `RuntimeConfig`.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set keep their default values; unparsable
    /// values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("ASPEN_CLONE_MODE") {
            if let Some(mode) = CloneMode::parse(&val) {
                config.clone.mode = mode;
            }
        }

        if let Some(val) = parse_env_bool("ASPEN_READ_ONLY_OPT") {
            config.clone.read_only_optimization = val;
        }

        if let Some(val) = parse_env_usize("ASPEN_MEMO_INITIAL_SIZE") {
            if val.is_power_of_two() {
                config.clone.initial_memo_size = val;
            }
        }

        if let Some(val) = parse_env_bool("ASPEN_MEMORY_POOL") {
            config.memory.pooled = val;
        }

        if let Some(val) = parse_env_usize("ASPEN_MAX_THREADS") {
            if val > 0 {
                config.memory.max_threads = val;
            }
        }

        if let Ok(val) = env::var("ASPEN_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clone.initial_memo_size == 0 || !self.clone.initial_memo_size.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                field: "clone.initial_memo_size",
                message: "must be a nonzero power of two".into(),
            });
        }

        if self.memory.max_threads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.max_threads",
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Error message.
        message: String,
    },
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the clone strategy.
    pub fn clone_mode(mut self, mode: CloneMode) -> Self {
        self.config.clone.mode = mode;
        self
    }

    /// Enable or disable the read-only resolution optimization.
    pub fn read_only_optimization(mut self, enabled: bool) -> Self {
        self.config.clone.read_only_optimization = enabled;
        self
    }

    /// Set the initial memo table capacity (power of two).
    pub fn initial_memo_size(mut self, size: usize) -> Self {
        self.config.clone.initial_memo_size = size;
        self
    }

    /// Enable or disable the pooled bin allocator.
    pub fn memory_pool(mut self, enabled: bool) -> Self {
        self.config.memory.pooled = enabled;
        self
    }

    /// Set the maximum tracked thread count.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.config.memory.max_threads = n;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Global runtime configuration, set once by [`crate::init_with_config`].
static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Store the global configuration. The first store wins; later calls are
/// ignored and return false.
pub(crate) fn set_runtime_config(config: RuntimeConfig) -> bool {
    RUNTIME_CONFIG.set(config).is_ok()
}

/// The current runtime configuration, if one was installed.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}

/// The installed clone configuration, or defaults.
pub(crate) fn clone_config() -> CloneConfig {
    runtime_config()
        .map(|c| c.clone.clone())
        .unwrap_or_default()
}

fn parse_env_usize(var: &str) -> Option<usize> {
    env::var(var).ok()?.trim().parse().ok()
}

fn parse_env_bool(var: &str) -> Option<bool> {
    match env::var(var).ok()?.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.clone.mode, CloneMode::Lazy);
        assert!(config.clone.read_only_optimization);
        assert_eq!(config.clone.initial_memo_size, 8);
        assert!(config.memory.pooled);
        assert!(config.memory.max_threads >= 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .clone_mode(CloneMode::Eager)
            .read_only_optimization(false)
            .initial_memo_size(32)
            .memory_pool(false)
            .build()
            .unwrap();
        assert_eq!(config.clone.mode, CloneMode::Eager);
        assert!(!config.clone.read_only_optimization);
        assert_eq!(config.clone.initial_memo_size, 32);
        assert!(!config.memory.pooled);
    }

    #[test]
    fn test_validate_rejects_non_power_of_two() {
        let result = RuntimeConfig::builder().initial_memo_size(12).build();
        assert!(result.is_err());
        let result = RuntimeConfig::builder().initial_memo_size(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let result = RuntimeConfig::builder().max_threads(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_clone_mode_parse() {
        assert_eq!(CloneMode::parse("lazy"), Some(CloneMode::Lazy));
        assert_eq!(CloneMode::parse("EAGER"), Some(CloneMode::Eager));
        assert_eq!(CloneMode::parse("cow"), Some(CloneMode::Lazy));
        assert_eq!(CloneMode::parse("bogus"), None);
    }

    #[test]
    fn test_from_env_overrides() {
        env::set_var("ASPEN_CLONE_MODE", "eager");
        env::set_var("ASPEN_MEMO_INITIAL_SIZE", "32");
        env::set_var("ASPEN_READ_ONLY_OPT", "false");
        env::set_var("ASPEN_MEMORY_POOL", "off");

        let config = RuntimeConfig::from_env();
        assert_eq!(config.clone.mode, CloneMode::Eager);
        assert_eq!(config.clone.initial_memo_size, 32);
        assert!(!config.clone.read_only_optimization);
        assert!(!config.memory.pooled);

        // A non-power-of-two size is ignored, not an error.
        env::set_var("ASPEN_MEMO_INITIAL_SIZE", "12");
        let config = RuntimeConfig::from_env();
        assert_eq!(config.clone.initial_memo_size, 8);

        env::remove_var("ASPEN_CLONE_MODE");
        env::remove_var("ASPEN_MEMO_INITIAL_SIZE");
        env::remove_var("ASPEN_READ_ONLY_OPT");
        env::remove_var("ASPEN_MEMORY_POOL");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "clone.initial_memo_size",
            message: "must be a nonzero power of two".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("initial_memo_size"));
        assert!(msg.contains("power of two"));
    }
}
