//! Framework configuration.
//!
//! [`KronosConfig`] gathers the tunables of every built-in service. All
//! sections implement `Default` with the firmware's stock values and can be
//! deserialised from a partial document (missing fields keep their default).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KronosError, Result};
use crate::message::Opcode;

/// Whole milliseconds of `duration`, clamped to `u64::MAX`.
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Default base timer interval, in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 50;

/// The environment variable used to override the base timer interval.
pub const TICK_INTERVAL_ENV: &str = "KRONOS_TICK_MS";

/// Name of the worker that fires on every base tick.
pub const WORKER_MAIN: &str = "main";

/// Name of the worker that fires every two seconds at the default interval.
pub const WORKER_2S: &str = "2s";

/// Name of the worker that fires every ten seconds at the default interval.
pub const WORKER_10S: &str = "10s";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KronosConfig {
    /// Message pool behaviour.
    pub pool: PoolConfig,
    /// Default queue settings for queued and active components.
    pub queue: QueueConfig,
    /// Base timer and worker cadences.
    pub scheduler: SchedulerConfig,
    /// Liveness monitoring.
    pub health: HealthConfig,
}

impl KronosConfig {
    /// Default configuration with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Parse a JSON document. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::InvalidConfig`] if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| KronosError::InvalidConfig(err.to_string()))
    }

    /// Apply overrides from the process environment.
    ///
    /// Currently only [`TICK_INTERVAL_ENV`] is read. Unparseable values are
    /// ignored with a warning.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(TICK_INTERVAL_ENV) {
            match raw.parse::<u64>() {
                Ok(ms) => self.scheduler.base_interval_ms = ms,
                Err(_) => tracing::warn!(
                    var = TICK_INTERVAL_ENV,
                    value = %raw,
                    "ignoring unparseable tick interval"
                ),
            }
        }
        self
    }

    /// Override the base timer interval.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.scheduler.base_interval_ms = saturating_millis(interval);
        self
    }

    /// Override the health timeout.
    #[must_use]
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health.timeout_ms = saturating_millis(timeout);
        self
    }

    /// Check every section for out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(KronosError::InvalidConfig(
                "queue capacity must be at least 1".into(),
            ));
        }
        if self.scheduler.base_interval_ms == 0 {
            return Err(KronosError::InvalidConfig(
                "scheduler base interval must be at least 1 ms".into(),
            ));
        }
        for worker in &self.scheduler.workers {
            if worker.tick_rate == 0 {
                return Err(KronosError::InvalidConfig(format!(
                    "worker '{}' has a zero tick rate",
                    worker.name
                )));
            }
        }
        if !self
            .scheduler
            .workers
            .iter()
            .any(|w| w.name == self.health.worker)
        {
            return Err(KronosError::InvalidConfig(format!(
                "health monitor worker '{}' is not configured",
                self.health.worker
            )));
        }
        Ok(())
    }
}

/// Message pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Panic when a stale handle is released. A stale release means a message
    /// was freed twice, so debug builds abort by default.
    pub abort_on_stale_release: bool,
    /// Number of slots reserved up front.
    pub initial_slots: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            abort_on_stale_release: cfg!(debug_assertions),
            initial_slots: 64,
        }
    }
}

/// Queue settings for queued and active components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of pending messages.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 16 }
    }
}

/// Settings for an active component's dedicated task.
///
/// The stack size and priority are hints for the substrate. The tokio
/// substrate schedules tasks cooperatively and only records them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveConfig {
    /// Queue settings.
    pub queue: QueueConfig,
    /// Stack size hint, in bytes.
    pub stack_size: usize,
    /// Priority hint, higher runs first.
    pub priority: u8,
}

impl Default for ActiveConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            stack_size: 4096,
            priority: 2,
        }
    }
}

/// Base timer and worker cadences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between base ticks, in milliseconds.
    pub base_interval_ms: u64,
    /// Workers registered at boot.
    pub workers: Vec<WorkerConfig>,
}

impl SchedulerConfig {
    /// The base tick interval.
    #[must_use]
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    /// Convert a duration to whole base ticks, rounding up, minimum one.
    #[must_use]
    pub fn ticks_for(&self, interval: Duration) -> u64 {
        let base = self.base_interval_ms.max(1);
        let ms = saturating_millis(interval);
        ms.div_ceil(base).max(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            workers: vec![
                WorkerConfig::new(WORKER_MAIN, 1),
                WorkerConfig::new(WORKER_2S, 40),
                WorkerConfig::new(WORKER_10S, 200),
            ],
        }
    }
}

/// One worker cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name, also used to derive its bus name.
    pub name: String,
    /// Number of base ticks between firings.
    pub tick_rate: u16,
    /// Opcode of the tick message.
    #[serde(default = "default_tick_opcode")]
    pub opcode: Opcode,
}

impl WorkerConfig {
    /// A worker publishing [`Opcode::SCHEDULER_TICK`].
    #[must_use]
    pub fn new(name: impl Into<String>, tick_rate: u16) -> Self {
        Self {
            name: name.into(),
            tick_rate,
            opcode: Opcode::SCHEDULER_TICK,
        }
    }
}

fn default_tick_opcode() -> Opcode {
    Opcode::SCHEDULER_TICK
}

/// Liveness monitoring settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Worker whose tick triggers a ping sweep.
    pub worker: String,
    /// A component that has not answered for this long is unresponsive.
    pub timeout_ms: u64,
}

impl HealthConfig {
    /// The response timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            worker: WORKER_2S.to_string(),
            timeout_ms: 5_000,
        }
    }
}
