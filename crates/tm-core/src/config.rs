//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the server, storage, workers, retention, queue, plan
//! tiers and tool commands. Every section defaults sensibly so a completely
//! empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::job::ToolId;
use crate::plan::{PlanTier, TierLimits};
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub workers: WorkerConfig,
    pub retention: RetentionConfig,
    pub queue: QueueConfig,
    pub tiers: TiersConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        if self.workers.concurrency == 0 {
            warnings.push("workers.concurrency is 0; it will be raised to 1".into());
        }
        if self.workers.max_attempts == 0 {
            warnings.push("workers.max_attempts is 0; jobs will run once".into());
        }
        if self.workers.rate_limit.max_jobs == 0 || self.workers.rate_limit.window_secs == 0 {
            warnings.push("workers.rate_limit is zero; claims will not be rate limited".into());
        }
        if self.workers.backoff_max_ms < self.workers.backoff_base_ms {
            warnings.push("workers.backoff_max_ms is below backoff_base_ms".into());
        }
        if self.workers.lease_timeout_secs < self.workers.sweep_interval_secs {
            warnings.push(
                "workers.lease_timeout_secs is shorter than sweep_interval_secs".into(),
            );
        }

        for tier in [PlanTier::Free, PlanTier::Pro, PlanTier::Unlimited] {
            let limits = self.tiers.limits(tier);
            if limits.max_file_size > self.server.max_upload_bytes {
                warnings.push(format!(
                    "tiers.{tier}.max_file_size exceeds server.max_upload_bytes ({})",
                    self.server.max_upload_bytes
                ));
            }
            if limits.concurrent_jobs == 0 {
                warnings.push(format!(
                    "tiers.{tier}.concurrent_jobs is 0; every submission will be rejected"
                ));
            }
        }

        for (name, command) in &self.tools.commands {
            if name.parse::<ToolId>().is_err() {
                warnings.push(format!("tools.commands.{name} is not a known tool"));
            }
            if command.program.trim().is_empty() {
                warnings.push(format!("tools.commands.{name}.program is empty"));
            }
            if !command.args.iter().any(|a| a.contains("{input}")) {
                warnings.push(format!(
                    "tools.commands.{name}.args never references {{input}}"
                ));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Upper bound on a whole multipart request body.
    pub max_upload_bytes: u64,
    pub cors_origin: Option<String>,
    /// HTTP requests per minute across all clients; 0 disables the limit.
    pub requests_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3001,
            db_path: PathBuf::from("data/toolmatrix.db"),
            max_upload_bytes: 2 * 1024 * 1024 * 1024,
            cors_origin: None,
            requests_per_minute: 600,
        }
    }
}

/// Where uploaded and produced files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/files"),
        }
    }
}

/// Worker pool, retry, and lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub lease_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub rate_limit: RateLimitConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 300_000,
            lease_timeout_secs: 15 * 60,
            sweep_interval_secs: 30,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Rolling-window cap on job claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_jobs: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_jobs: 50,
            window_secs: 60,
        }
    }
}

/// How long terminal jobs are kept before purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub completed_secs: u64,
    pub failed_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_secs: 2 * 60 * 60,
            failed_secs: 24 * 60 * 60,
        }
    }
}

/// Queue ordering settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Serve higher tiers first; FIFO still holds within a tier.
    pub tier_priority: bool,
}

/// Per-tier admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub free: TierLimits,
    pub pro: TierLimits,
    pub unlimited: TierLimits,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            free: TierLimits::for_tier(PlanTier::Free),
            pro: TierLimits::for_tier(PlanTier::Pro),
            unlimited: TierLimits::for_tier(PlanTier::Unlimited),
        }
    }
}

impl TiersConfig {
    pub fn limits(&self, tier: PlanTier) -> &TierLimits {
        match tier {
            PlanTier::Free => &self.free,
            PlanTier::Pro => &self.pro,
            PlanTier::Unlimited => &self.unlimited,
        }
    }
}

/// External commands backing tools, keyed by tool name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub commands: BTreeMap<String, CommandSpec>,
}

/// Command line template for an external tool.
///
/// `args` may contain `{input}`, `{output}` and `{option:<key>}`
/// placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extension of the produced file; defaults to the input's.
    #[serde(default)]
    pub output_extension: Option<String>,
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    300
}
