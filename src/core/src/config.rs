use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{KilnError, Result};

/// Capabilities granted to RUN processes unless overridden.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_RAW",
    "CAP_SYS_CHROOT",
    "CAP_MKNOD",
    "CAP_AUDIT_WRITE",
    "CAP_SETFCAP",
];

/// Builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Root directory for images, containers and runtime bundles
    pub data_root: PathBuf,

    /// OCI runtime binary used for RUN (e.g. runc, crun)
    pub runtime: String,

    /// Log level
    pub log_level: LogLevel,

    /// Capacity of the build status channel
    pub status_capacity: usize,

    /// Shell used for shell-form RUN/CMD/ENTRYPOINT until SHELL overrides it
    pub default_shell: Vec<String>,

    /// Capabilities granted to RUN processes
    pub capabilities: Vec<String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            data_root: dirs::home_dir()
                .map(|h| h.join(".kiln"))
                .unwrap_or_else(|| PathBuf::from(".kiln")),
            runtime: "runc".to_string(),
            log_level: LogLevel::Warn,
            status_capacity: 128,
            default_shell: vec!["/bin/sh".to_string(), "-c".to_string()],
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl BuilderConfig {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: BuilderConfig = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        Self::default().data_root.join("config.yaml")
    }

    fn validate(&self) -> Result<()> {
        if self.runtime.trim().is_empty() {
            return Err(KilnError::Config("runtime must not be empty".to_string()));
        }
        if self.status_capacity == 0 {
            return Err(KilnError::Config(
                "status_capacity must be at least 1".to_string(),
            ));
        }
        if self.default_shell.is_empty() {
            return Err(KilnError::Config(
                "default_shell must name an executable".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding committed images.
    pub fn images_dir(&self) -> PathBuf {
        self.data_root.join("images")
    }

    /// Directory holding working containers (stage mountpoints).
    pub fn containers_dir(&self) -> PathBuf {
        self.data_root.join("containers")
    }

    /// Directory holding OCI runtime bundles for RUN.
    pub fn bundles_dir(&self) -> PathBuf {
        self.data_root.join("bundles")
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string for an `EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
