use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::wait::Backoff;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// Readiness polling policy for new snapshots.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub ready_initial_delay_ms: u64,
    pub ready_factor: f64,
    pub ready_steps: u32,
    /// Optional upper limit of a single delay.
    pub ready_max_delay_ms: Option<u64>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            ready_initial_delay_ms: 1000,
            ready_factor: 1.2,
            ready_steps: 10,
            ready_max_delay_ms: None,
        }
    }
}

impl SnapshotConfig {
    pub fn ready_backoff(&self) -> Backoff {
        let backoff = Backoff::new(
            Duration::from_millis(self.ready_initial_delay_ms),
            self.ready_factor,
            self.ready_steps,
        );
        match self.ready_max_delay_ms {
            Some(cap) => backoff.with_cap(Duration::from_millis(cap)),
            None => backoff,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.ready_factor.is_finite() || self.ready_factor < 1.0 {
            bail!(
                "snapshot.ready_factor must be a finite number >= 1.0, got {}",
                self.ready_factor
            );
        }
        if self.ready_steps == 0 {
            bail!("snapshot.ready_steps must be at least 1");
        }
        let sleeps = self.ready_steps - 1;
        let bounded = match self.ready_max_delay_ms {
            Some(cap) => Duration::from_millis(cap).checked_mul(sleeps).is_some(),
            None => self.ready_backoff().is_representable(),
        };
        if !bounded {
            bail!(
                "snapshot readiness policy overflows: {} steps growing by {} from {}ms",
                self.ready_steps,
                self.ready_factor,
                self.ready_initial_delay_ms
            );
        }
        Ok(())
    }
}

pub fn parse_config(s: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(s).context("Failed to parse YAML config")?;
    cfg.snapshot.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    parse_config(&content).with_context(|| format!("Invalid config {path}"))
}
