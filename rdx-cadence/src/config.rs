//! Defines all configuration structures for the scheduler.
//!
//! These structs are deserialized with `serde`, usually from a TOML file
//! layered with `CADENCE__*` environment variables by `SchedulerConfig::load`.
//! Every field has a default, so an empty file is a valid configuration.

use crate::error::Result;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// The top-level configuration for the `Scheduler`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the `Driver` services the scheduler.
    pub resolution: ClockResolution,

    /// Slots a view grows by when it fills up.
    pub view_step_size: usize,

    /// Released view buffers each registry keeps for reuse.
    pub view_pool_capacity: usize,

    /// Expired timers kept for reuse.
    pub max_free_timers: usize,

    /// Nested error notifications allowed before further errors are dropped.
    pub max_error_depth: u32,

    /// Whether failures of manager jobs become error notifications.
    pub forward_manager_errors: bool,

    pub simulation: SimulationConfig,
}

/// Defines the operational speed of the `Driver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClockResolution {
    /// ~60 ticks per second. Suitable for real-time rendering.
    #[default]
    High,
    /// ~30 ticks per second.
    Medium,
    /// ~1 tick per second. Suitable for inspecting a scheduler by eye.
    Low,
    /// A user-defined speed in ticks per second.
    Custom { ticks_per_second: u64 },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Start with the simulation stopped and let the first tick start it.
    pub autostart: bool,
}

impl ClockResolution {
    pub fn ticks_per_second(&self) -> u64 {
        match self {
            ClockResolution::High => 60,
            ClockResolution::Medium => 30,
            ClockResolution::Low => 1,
            ClockResolution::Custom { ticks_per_second } => (*ticks_per_second).max(1),
        }
    }

    /// Time between two ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.ticks_per_second() as f64)
    }
}

impl SchedulerConfig {
    /// Loads `path` (TOML), then applies `CADENCE__*` environment overrides,
    /// e.g. `CADENCE__SIMULATION__AUTOSTART=false`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix("CADENCE").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resolution: ClockResolution::default(),
            view_step_size: 8,
            view_pool_capacity: 4,
            max_free_timers: 32,
            max_error_depth: 2,
            forward_manager_errors: true,
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { autostart: true }
    }
}
