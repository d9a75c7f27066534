//! Configuration for the Leakforge harness
//!
//! # Configuration File Format
//!
//! TOML, every key optional:
//!
//! ```toml
//! [workload]
//! calls = 1000
//! workers = 16
//! min_payload = 16
//! max_payload = 8192
//! endpoints = 50
//! retain_every = 97
//! purge_every = 13
//! progress_every = 100
//! seed = 42
//!
//! [simulator]
//! min_latency_ms = 5
//! max_latency_ms = 200
//! min_status = 200
//! max_status = 599
//! leak_fallback_size = 64
//! double_release_size = 32
//!
//! [faults]
//! plan = "every_nth"
//! selector = "leak-buffer"
//! every = 97
//!
//! [monitoring]
//! interval_secs = 30
//! ```

use crate::error::{HarnessError, Result};
use crate::simulator::FaultSelector;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete harness configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub workload: WorkloadSettings,

    #[serde(default)]
    pub simulator: SimulatorSettings,

    #[serde(default)]
    pub faults: FaultSettings,

    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

/// Shape of the generated workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSettings {
    /// Number of simulated calls to submit
    #[serde(default = "default_calls")]
    pub calls: usize,

    /// Worker threads in the pool
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Smallest payload in bytes
    #[serde(default = "default_min_payload")]
    pub min_payload: usize,

    /// Largest payload in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,

    /// Distinct endpoints calls are spread over
    #[serde(default = "default_endpoints")]
    pub endpoints: usize,

    /// Every n-th payload is retained forever (0 disables)
    #[serde(default = "default_retain_every")]
    pub retain_every: usize,

    /// Every n-th task triggers a cache purge (0 disables)
    #[serde(default = "default_purge_every")]
    pub purge_every: usize,

    /// Log progress every n completed calls (0 disables)
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    /// Seed for payload sizes, fault selection and simulator draws
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            calls: default_calls(),
            workers: default_workers(),
            min_payload: default_min_payload(),
            max_payload: default_max_payload(),
            endpoints: default_endpoints(),
            retain_every: default_retain_every(),
            purge_every: default_purge_every(),
            progress_every: default_progress_every(),
            seed: None,
        }
    }
}

/// Simulated call behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorSettings {
    #[serde(default = "default_min_latency_ms")]
    pub min_latency_ms: u64,

    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,

    #[serde(default = "default_min_status")]
    pub min_status: u16,

    #[serde(default = "default_max_status")]
    pub max_status: u16,

    /// Size of a leaked buffer when the payload size is zero
    #[serde(default = "default_leak_fallback_size")]
    pub leak_fallback_size: usize,

    /// Size of the buffer released twice
    #[serde(default = "default_double_release_size")]
    pub double_release_size: usize,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            min_latency_ms: default_min_latency_ms(),
            max_latency_ms: default_max_latency_ms(),
            min_status: default_min_status(),
            max_status: default_max_status(),
            leak_fallback_size: default_leak_fallback_size(),
            double_release_size: default_double_release_size(),
        }
    }
}

/// How fault selectors are assigned to calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPlanKind {
    /// Draw 0-10 per call; 1-4 pick a defect, anything else none
    #[default]
    Random,
    /// Never inject
    None,
    /// Inject `selector` into every call
    Always,
    /// Inject `selector` into the `every`-th, `2 * every`-th, ... call
    EveryNth,
}

/// Fault plan settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSettings {
    #[serde(default)]
    pub plan: FaultPlanKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<FaultSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<usize>,
}

/// Periodic statistics logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_calls() -> usize {
    1000
}

fn default_workers() -> usize {
    16
}

fn default_min_payload() -> usize {
    16
}

fn default_max_payload() -> usize {
    8 * 1024
}

fn default_endpoints() -> usize {
    50
}

fn default_retain_every() -> usize {
    97
}

fn default_purge_every() -> usize {
    13
}

fn default_progress_every() -> usize {
    100
}

fn default_min_latency_ms() -> u64 {
    5
}

fn default_max_latency_ms() -> u64 {
    200
}

fn default_min_status() -> u16 {
    200
}

fn default_max_status() -> u16 {
    599
}

fn default_leak_fallback_size() -> usize {
    64
}

fn default_double_release_size() -> usize {
    32
}

fn default_interval_secs() -> u64 {
    30
}

impl SimulatorSettings {
    /// Latency and status ranges must be non-empty; statuses stay in 200..=599
    pub fn validate(&self) -> Result<()> {
        if self.min_latency_ms > self.max_latency_ms {
            return Err(invalid(format!(
                "simulator.min_latency_ms ({}) exceeds max_latency_ms ({})",
                self.min_latency_ms, self.max_latency_ms
            )));
        }
        if self.min_status < 200 || self.max_status > 599 || self.min_status > self.max_status {
            return Err(invalid(format!(
                "simulator status range {}..={} must lie within 200..=599",
                self.min_status, self.max_status
            )));
        }
        Ok(())
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .build()?;
        let config: HarnessConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check that every value is usable
    pub fn validate(&self) -> Result<()> {
        let w = &self.workload;
        if w.workers == 0 {
            return Err(invalid("workload.workers must be at least 1"));
        }
        if w.min_payload > w.max_payload {
            return Err(invalid(format!(
                "workload.min_payload ({}) exceeds max_payload ({})",
                w.min_payload, w.max_payload
            )));
        }
        if w.endpoints == 0 {
            return Err(invalid("workload.endpoints must be at least 1"));
        }

        self.simulator.validate()?;

        if self.monitoring.interval_secs == 0 {
            return Err(invalid("monitoring.interval_secs must be at least 1"));
        }

        let f = &self.faults;
        match f.plan {
            FaultPlanKind::Random | FaultPlanKind::None => {}
            FaultPlanKind::Always => {
                if f.selector.is_none() {
                    return Err(invalid("faults.plan = \"always\" needs a selector"));
                }
            }
            FaultPlanKind::EveryNth => {
                if f.selector.is_none() {
                    return Err(invalid("faults.plan = \"every_nth\" needs a selector"));
                }
                if f.every.unwrap_or(0) == 0 {
                    return Err(invalid("faults.every must be at least 1"));
                }
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> HarnessError {
    HarnessError::InvalidConfig(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_match_reference_workload() {
        let config = HarnessConfig::default();
        assert_eq!(config.workload.calls, 1000);
        assert_eq!(config.workload.workers, 16);
        assert_eq!(config.workload.max_payload, 8192);
        assert_eq!(config.simulator.min_latency_ms, 5);
        assert_eq!(config.simulator.max_latency_ms, 200);
        assert_eq!(config.faults.plan, FaultPlanKind::Random);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[workload]
calls = 200
workers = 4
seed = 9

[faults]
plan = "every_nth"
selector = "leak-buffer"
every = 97
"#
        )
        .unwrap();

        let config = HarnessConfig::from_file(file.path()).unwrap();
        assert_eq!(config.workload.calls, 200);
        assert_eq!(config.workload.workers, 4);
        assert_eq!(config.workload.seed, Some(9));
        assert_eq!(config.workload.max_payload, 8192);
        assert_eq!(config.faults.plan, FaultPlanKind::EveryNth);
        assert_eq!(config.faults.selector, Some(FaultSelector::LeakBuffer));
        assert_eq!(config.faults.every, Some(97));
        assert_eq!(config.simulator, SimulatorSettings::default());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[workload]\nworkers = 0").unwrap();

        let err = HarnessConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = HarnessConfig::default();
        config.workload.min_payload = 10_000;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.simulator.min_latency_ms = 300;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.simulator.max_status = 600;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.faults.plan = FaultPlanKind::Always;
        assert!(config.validate().is_err());
        config.faults.selector = Some(FaultSelector::ReferenceCycle);
        assert!(config.validate().is_ok());

        let mut config = HarnessConfig::default();
        config.faults.plan = FaultPlanKind::EveryNth;
        config.faults.selector = Some(FaultSelector::LeakBuffer);
        config.faults.every = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_rendering_reloads() {
        let mut config = HarnessConfig::default();
        config.workload.seed = Some(1234);
        config.faults.plan = FaultPlanKind::Always;
        config.faults.selector = Some(FaultSelector::DoubleRelease);

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[workload]"));
        assert!(rendered.contains("plan = \"always\""));

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(rendered.as_bytes()).unwrap();
        let reloaded = HarnessConfig::from_file(file.path()).unwrap();
        assert_eq!(reloaded, config);
    }
}
