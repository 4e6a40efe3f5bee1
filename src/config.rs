//! Configuration types.

use std::thread;

use crate::error::ConfigError;

/// Default prefix for worker thread names.
pub const DEFAULT_THREAD_PREFIX: &str = "forkpool-worker";

/// Largest admission limit or relay capacity a pool accepts.
pub const MAX_CAPACITY: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Bring an admission limit or relay capacity into `1..=MAX_CAPACITY`.
pub(crate) fn clamp_capacity(n: usize) -> usize {
    n.clamp(1, MAX_CAPACITY)
}

/// How a pool admits workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// One execution context per task, created all at once. `max_threads` is advisory.
    SpawnPerTask,
    /// At most `max` contexts of one pool alive at a time; the rest wait for a slot.
    Bounded { max: usize },
}

/// How worker output travels back to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Workers never wait on the orchestrator.
    Unbounded,
    /// Workers suspend once `capacity` messages are in flight.
    Bounded(usize),
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Recommended maximum parallelism. Informational unless admission is bounded.
    pub max_threads: usize,
    /// Admission control for worker creation.
    pub admission: AdmissionPolicy,
    /// Result relay channel flavour.
    pub relay: RelayMode,
    /// Worker thread stack size (platform default if unset).
    pub stack_size: Option<usize>,
    /// Worker thread name prefix; the worker id is appended.
    pub thread_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            admission: AdmissionPolicy::SpawnPerTask,
            relay: RelayMode::Unbounded,
            stack_size: None,
            thread_prefix: DEFAULT_THREAD_PREFIX.to_string(),
        }
    }
}

impl PoolConfig {
    /// Load from environment, falling back to defaults on missing or bad values.
    pub fn from_env() -> Self {
        Self::try_from_env().unwrap_or_else(|e| {
            tracing::warn!("Ignoring pool configuration from environment: {}", e);
            Self::default()
        })
    }

    /// Load from environment, rejecting values that do not parse.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("FORKPOOL_MAX_THREADS") {
            config.max_threads = parse_capacity("FORKPOOL_MAX_THREADS", &raw)?;
        }

        if let Some(raw) = lookup("FORKPOOL_ADMISSION") {
            config.admission = match raw.trim() {
                "spawn-per-task" => AdmissionPolicy::SpawnPerTask,
                "bounded" => AdmissionPolicy::Bounded {
                    max: config.max_threads,
                },
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "FORKPOOL_ADMISSION".to_string(),
                        message: format!("expected spawn-per-task or bounded, got {other:?}"),
                    });
                }
            };
        }

        if let Some(raw) = lookup("FORKPOOL_RELAY_CAPACITY") {
            config.relay = RelayMode::Bounded(parse_capacity("FORKPOOL_RELAY_CAPACITY", &raw)?);
        }

        if let Some(raw) = lookup("FORKPOOL_STACK_SIZE") {
            config.stack_size = Some(parse_positive("FORKPOOL_STACK_SIZE", &raw)?);
        }

        if let Some(raw) = lookup("FORKPOOL_THREAD_PREFIX") {
            let prefix = raw.trim();
            if !prefix.is_empty() {
                config.thread_prefix = prefix.to_string();
            }
        }

        Ok(config)
    }

    /// Use bounded admission with the given limit, clamped to `1..=MAX_CAPACITY`.
    pub fn with_bounded_admission(mut self, max: usize) -> Self {
        self.admission = AdmissionPolicy::Bounded {
            max: clamp_capacity(max),
        };
        self
    }

    /// Use a bounded relay channel, capacity clamped to `1..=MAX_CAPACITY`.
    pub fn with_relay_capacity(mut self, capacity: usize) -> Self {
        self.relay = RelayMode::Bounded(clamp_capacity(capacity));
        self
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

fn parse_capacity(key: &str, raw: &str) -> Result<usize, ConfigError> {
    let n = parse_positive(key, raw)?;
    if n > MAX_CAPACITY {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be at most {MAX_CAPACITY}"),
        });
    }
    Ok(n)
}
