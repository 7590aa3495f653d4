use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from corehound.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct RunnerConfig {
    pub run: RunConfig,
    pub termination: TerminationConfig,
    pub host: HostConfig,
    pub debugger: DebuggerConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Wall-clock timeout for the target process, in seconds.
    pub timeout_secs: u64,
    /// Directory the target runs in and where its dump file is expected.
    pub dump_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerminationConfig {
    /// Wait before sending the quit signal, so in-flight fault handling
    /// inside the target can finish first.
    pub pre_signal_grace_ms: u64,
    /// Initial delay of the dump-file poll; doubles on each attempt.
    pub poll_initial_ms: u64,
    /// Upper bound on the total time spent polling for the dump file.
    pub poll_max_wait_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Dump filename template the kernel must be configured with.
    pub core_pattern: String,
    /// Kernel file holding the dump filename template.
    pub core_pattern_file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Debugger binary name or absolute path.
    pub command: String,
}

// --- Default implementations ---

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            dump_dir: PathBuf::from("."),
        }
    }
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            pre_signal_grace_ms: 1000,
            poll_initial_ms: 100,
            poll_max_wait_ms: 5000,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            core_pattern: "core.%p".to_string(),
            core_pattern_file: PathBuf::from("/proc/sys/kernel/core_pattern"),
        }
    }
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            command: "gdb".to_string(),
        }
    }
}

/// Errors that can occur while loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from the given path.
    ///
    /// A missing file is not an error: all settings have defaults, so the
    /// binary runs with no config file present.
    pub fn load(path: &Path) -> Result<RunnerConfig, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(RunnerConfig::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
