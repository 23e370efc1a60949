//! Layered configuration: defaults → `reelsmith.toml` → environment.
//!
//! Loaded once at startup and passed explicitly through the capability
//! context; nothing here mutates at runtime. Secrets are never part of this
//! struct: they stay in environment variables read by the adapters that
//! need them.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Filesystem roots for the queue and per-run workspaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub queue_root: Utf8PathBuf,
    pub runs_root: Utf8PathBuf,
    /// Memory-backed scratch directory for intermediate binary assets, when
    /// the host provides one.
    pub scratch_dir: Option<Utf8PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        Self {
            queue_root: base.join("reelsmith/queue"),
            runs_root: base.join("reelsmith/runs"),
            scratch_dir: None,
        }
    }
}

/// Reflection-loop policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// Maximum generator-critic rounds before best-of-three selection.
    pub max_attempts: u32,
    /// Score floor for accepting a best-of-three candidate.
    pub floor: u8,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            floor: 70,
        }
    }
}

/// Recovery-chain policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Level-1 retries before advancing to fork.
    pub max_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

/// Queue lease policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Age after which a processing lease is considered stale.
    pub stale_lease_secs: u64,
    /// Heartbeat refresh interval while a run is active.
    pub heartbeat_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stale_lease_secs: 300,
            heartbeat_secs: 30,
        }
    }
}

/// Background asset-generation pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    /// Delay between sequential job submissions.
    pub inter_job_delay_secs: u64,
    /// Exponential back-off schedule on resource-exhaustion signals.
    pub backoff_secs: Vec<u64>,
    /// Transient-failure retries per job at the await gate.
    pub max_transient_retries: u32,
    /// Overall deadline for the await gate.
    pub await_timeout_secs: u64,
    /// Clip duration clamp, seconds.
    pub min_clip_secs: f64,
    pub max_clip_secs: f64,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            inter_job_delay_secs: 5,
            backoff_secs: vec![30, 60, 120],
            max_transient_retries: 2,
            await_timeout_secs: 900,
            min_clip_secs: 2.0,
            max_clip_secs: 8.0,
        }
    }
}

/// Resource envelope respected before heavy operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Peak memory envelope in bytes.
    pub max_memory_bytes: u64,
    /// CPU quota in percent.
    pub max_cpu_percent: f32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 3 * 1024 * 1024 * 1024,
            max_cpu_percent: 80.0,
        }
    }
}

/// Delivery limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Deliverables above this size go through the object store.
    pub inline_limit_bytes: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            inline_limit_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Agent backend and model routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Primary backend name wired at the composition root.
    pub primary_backend: String,
    /// Backend used by the level-4 swap handler.
    pub fallback_backend: String,
    /// Primary model routed by the dispatcher.
    pub primary_model: String,
    /// Model used by the level-5 downgrade handler.
    pub downgrade_model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            primary_backend: "agent-cli".to_string(),
            fallback_backend: "agent-cli-alt".to_string(),
            primary_model: "creative-large".to_string(),
            downgrade_model: "creative-small".to_string(),
        }
    }
}

/// The immutable daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub reflection: ReflectionConfig,
    pub recovery: RecoveryConfig,
    pub queue: QueueConfig,
    pub assets: AssetsConfig,
    pub resources: ResourcesConfig,
    pub delivery: DeliveryConfig,
    pub agent: AgentConfig,
}

impl Config {
    /// Load configuration: built-in defaults, then `reelsmith.toml` in the
    /// working directory (or `$REELSMITH_CONFIG`), then environment
    /// overrides for the filesystem roots.
    pub fn load() -> Result<Self> {
        let path = std::env::var("REELSMITH_CONFIG")
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|_| Utf8PathBuf::from("reelsmith.toml"));

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path.as_std_path())
                .with_context(|| format!("failed to read config: {path}"))?;
            toml::from_str(&content).with_context(|| format!("failed to parse config: {path}"))?
        } else {
            Self::default()
        };

        if let Ok(root) = std::env::var("REELSMITH_QUEUE_ROOT") {
            config.paths.queue_root = Utf8PathBuf::from(root);
        }
        if let Ok(root) = std::env::var("REELSMITH_RUNS_ROOT") {
            config.paths.runs_root = Utf8PathBuf::from(root);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot honor.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.reflection.max_attempts >= 1, "reflection.max_attempts must be >= 1");
        anyhow::ensure!(self.reflection.floor <= 100, "reflection.floor must be <= 100");
        anyhow::ensure!(
            self.assets.min_clip_secs > 0.0 && self.assets.min_clip_secs <= self.assets.max_clip_secs,
            "assets clip duration clamp is inverted"
        );
        anyhow::ensure!(!self.assets.backoff_secs.is_empty(), "assets.backoff_secs must not be empty");
        Ok(())
    }

    /// The overall await-gate deadline as a `Duration`.
    #[must_use]
    pub const fn await_deadline(&self) -> Duration {
        Duration::from_secs(self.assets.await_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = Config::default();
        assert_eq!(config.reflection.max_attempts, 3);
        assert_eq!(config.reflection.floor, 70);
        assert_eq!(config.recovery.max_retries, 2);
        assert_eq!(config.queue.stale_lease_secs, 300);
        assert_eq!(config.queue.heartbeat_secs, 30);
        assert_eq!(config.assets.inter_job_delay_secs, 5);
        assert_eq!(config.assets.backoff_secs, vec![30, 60, 120]);
        assert_eq!(config.delivery.inline_limit_bytes, 50 * 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn toml_round_trip_preserves_config() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn partial_toml_fills_from_defaults() {
        let config: Config = toml::from_str(
            r#"
            [reflection]
            floor = 80
            "#,
        )
        .unwrap();
        assert_eq!(config.reflection.floor, 80);
        assert_eq!(config.reflection.max_attempts, 3);
    }

    #[test]
    fn validate_rejects_inverted_clip_clamp() {
        let mut config = Config::default();
        config.assets.min_clip_secs = 9.0;
        config.assets.max_clip_secs = 2.0;
        assert!(config.validate().is_err());
    }
}
