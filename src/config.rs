// Pool and per-worker resource configuration, per spec.md 4.3.1 / 4.2.4.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn millis(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_step: usize,
    pub scale_down_step: usize,
    #[serde(with = "duration_secs")]
    pub cooldown_period: Duration,
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_millis")]
    pub dispatch_interval: Duration,
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub task_timeout: Duration,
    pub max_task_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 10,
            initial_workers: 2,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_up_step: 1,
            scale_down_step: 1,
            cooldown_period: secs(60),
            health_check_interval: secs(10),
            dispatch_interval: millis(100),
            idle_timeout: secs(60),
            task_timeout: secs(5 * 60),
            max_task_retries: 3,
        }
    }
}

pub fn default_pool_config() -> PoolConfig {
    PoolConfig::default()
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_workers > self.max_workers {
            anyhow::bail!(
                "min_workers ({}) must be <= max_workers ({})",
                self.min_workers,
                self.max_workers
            );
        }
        if self.initial_workers < self.min_workers || self.initial_workers > self.max_workers {
            anyhow::bail!(
                "initial_workers ({}) must be within [{}, {}]",
                self.initial_workers,
                self.min_workers,
                self.max_workers
            );
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read pool config: {}", path.display()))?;

        let config = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&data)?
        } else {
            serde_yaml::from_str(&data)?
        };

        Ok(config)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_percent: f64,
    #[serde(with = "duration_secs")]
    pub spawn_ready_timeout: Duration,
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_percent: 80.0,
            spawn_ready_timeout: secs(60 * 60),
            max_open_files: 256,
        }
    }
}

pub fn default_resource_limits() -> ResourceLimits {
    ResourceLimits::default()
}

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(60);

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.min_workers, 2);
        assert_eq!(cfg.max_workers, 10);
        assert_eq!(cfg.cooldown_period, Duration::from_secs(60));
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_bounds() {
        let cfg = PoolConfig {
            min_workers: 5,
            max_workers: 2,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_trips_through_yaml() {
        let cfg = PoolConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: PoolConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg, parsed);
    }
}
