//! Node and role configuration
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial document
//! only overrides what it names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use collab_core::{
    CollabError, CollabResult, NodeName, DEFAULT_BROADCAST_FREQ, DEFAULT_LOAD_BALANCER_FREQ,
    DEFAULT_MAX_RUNS,
};
use collab_copula::SPARSE;
use collab_state::DEFAULT_RETIRED_CAPACITY;

/// Durations written the way humans read them ("5s", "250ms")
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Which overload policy a node's load balancer applies
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadPolicyConfig {
    #[default]
    NeverOverloaded,
    /// Trip once `high` jobs are registered, release at `low`
    QueueDepth { high: usize, low: usize },
    /// Trip above a global CPU usage percentage
    CpuUsage { threshold: f32 },
}

/// Periodic load check settings. Admin commands may change them at runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadCheckSettings {
    pub enabled: bool,
    #[serde(with = "humantime_duration")]
    pub interval: Duration,
}

impl Default for LoadCheckSettings {
    fn default() -> Self {
        LoadCheckSettings {
            enabled: true,
            interval: Duration::from_secs(DEFAULT_LOAD_BALANCER_FREQ),
        }
    }
}

/// Node configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bus identity
    pub name: NodeName,
    pub load_check: LoadCheckSettings,
    pub load_policy: LoadPolicyConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: NodeName::new("collab"),
            load_check: LoadCheckSettings::default(),
            load_policy: LoadPolicyConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        NodeConfig {
            name: NodeName::new(name),
            ..Default::default()
        }
    }

    /// Config for in-process clusters: fast load checks
    pub fn local_test(name: impl Into<String>) -> Self {
        Self::new(name).with_load_check_interval(Duration::from_millis(50))
    }

    /// Config for a node that never runs the load check
    pub fn always_listening(name: impl Into<String>) -> Self {
        let mut config = Self::new(name);
        config.load_check.enabled = false;
        config
    }

    pub fn with_load_check_interval(mut self, interval: Duration) -> Self {
        self.load_check.interval = interval;
        self
    }

    pub fn with_load_policy(mut self, policy: LoadPolicyConfig) -> Self {
        self.load_policy = policy;
        self
    }
}

/// Simulation worker configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Trials between two partial results
    pub broadcast_freq: u64,
    /// Trials a worker runs per run before it gives up
    pub max_runs: u64,
    /// Trials per inner batch
    pub batch: usize,
    /// Batches per chunk
    pub repeats: usize,
    /// Simulator registry key
    pub simulator: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            broadcast_freq: DEFAULT_BROADCAST_FREQ,
            max_runs: DEFAULT_MAX_RUNS,
            batch: 10,
            repeats: 10,
            simulator: SPARSE.to_string(),
        }
    }
}

impl WorkerConfig {
    /// Small runs for tests and demos
    pub fn quick() -> Self {
        WorkerConfig {
            broadcast_freq: 200,
            max_runs: 1000,
            ..Default::default()
        }
    }

    pub fn with_broadcast_freq(mut self, broadcast_freq: u64) -> Self {
        self.broadcast_freq = broadcast_freq;
        self
    }

    pub fn with_max_runs(mut self, max_runs: u64) -> Self {
        self.max_runs = max_runs;
        self
    }

    pub fn with_chunk(mut self, batch: usize, repeats: usize) -> Self {
        self.batch = batch;
        self.repeats = repeats;
        self
    }

    pub fn with_simulator(mut self, simulator: impl Into<String>) -> Self {
        self.simulator = simulator.into();
        self
    }

    /// Trials run per scheduler step
    pub fn chunk_size(&self) -> u64 {
        (self.batch as u64).saturating_mul(self.repeats as u64)
    }

    pub fn validate(&self) -> CollabResult<()> {
        if self.batch == 0 || self.repeats == 0 {
            return Err(CollabError::InvalidParameters(
                "batch and repeats must be positive".into(),
            ));
        }
        if self.broadcast_freq == 0 {
            return Err(CollabError::InvalidParameters(
                "broadcast_freq must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Aggregation manager configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Stopped runs remembered to drop late results
    pub retired_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            retired_capacity: DEFAULT_RETIRED_CAPACITY,
        }
    }
}

/// Log output configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn production() -> Self {
        LoggingConfig {
            filter: "info,collab::log=warn".to_string(),
            json: true,
        }
    }

    pub fn verbose() -> Self {
        LoggingConfig {
            filter: "debug".to_string(),
            json: false,
        }
    }
}

/// Everything one node process needs
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub node: NodeConfig,
    pub worker: WorkerConfig,
    pub aggregator: AggregatorConfig,
    pub logging: LoggingConfig,
}

impl CollabConfig {
    pub fn from_json(raw: &str) -> CollabResult<Self> {
        let config: CollabConfig = serde_json::from_str(raw)
            .map_err(|e| CollabError::InvalidParameters(format!("config: {}", e)))?;
        config.worker.validate()?;
        Ok(config)
    }
}
