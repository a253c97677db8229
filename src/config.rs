//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning parameters for the measurement service.
///
/// Defaults mirror the shipped daemon configuration. All fields default
/// individually, so partial configurations deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Interval between measurement cycles.
    pub update_interval: Duration,
    /// Minimum responding hosts required before a measured RTT is trusted.
    pub min_hosts: usize,
    /// Percentage margin added to the chosen RTT before it is applied.
    pub rtt_margin_percent: f64,
    /// RTT used when there are not enough hosts or responders.
    pub default_rtt: Duration,
    /// Per-attempt TCP connect timeout.
    pub probe_timeout: Duration,
    /// Configured ceiling for concurrent probe workers.
    ///
    /// The adaptive controller retunes the live cap between 1 and this value.
    pub max_concurrent_probes: usize,
    /// Base pacing delay a worker waits after each job before pulling the
    /// next one.
    pub worker_pacing: Duration,
    /// Bound on the in-flight probe view.
    pub probes_max_entries: usize,
    /// How long completed probes stay visible to observers.
    pub completed_retention: Duration,
    /// Bound on the completed-probe history.
    pub completed_max_entries: usize,
    /// Bound on the recent-log buffer.
    pub recent_logs_max_entries: usize,
    /// Download-side shaping interface, if any.
    pub dl_interface: Option<String>,
    /// Upload-side shaping interface, if any.
    pub ul_interface: Option<String>,
    /// Adaptive concurrency controller settings.
    pub controller: ControllerConfig,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(5),
            min_hosts: 3,
            rtt_margin_percent: 10.0,
            default_rtt: Duration::from_millis(100),
            probe_timeout: Duration::from_secs(3),
            max_concurrent_probes: 50,
            worker_pacing: Duration::from_millis(10),
            probes_max_entries: 100,
            completed_retention: Duration::from_secs(5),
            completed_max_entries: 50,
            recent_logs_max_entries: 100,
            dl_interface: None,
            ul_interface: None,
            controller: ControllerConfig::default(),
        }
    }
}

/// Adaptive controller loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Whether the adaptive controller runs at all.
    pub enabled: bool,
    /// CPU sampling interval.
    pub sample_interval: Duration,
    /// Threshold policy for retuning the worker cap.
    pub policy: ControllerPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval: Duration::from_secs(2),
            policy: ControllerPolicy::default(),
        }
    }
}

/// Threshold policy for the adaptive worker cap.
///
/// Utilization is expressed in percent (0–100). The defaults are the shipped
/// heuristics; they are exposed as configuration rather than constants, but
/// there is no evidence supporting other values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerPolicy {
    /// Utilization above which the cap shrinks.
    pub high_utilization: f64,
    /// Utilization below which the cap grows.
    pub low_utilization: f64,
    /// Multiplier applied to the cap under high load.
    pub shrink_factor: f64,
    /// Multiplier applied to the cap under low load.
    pub growth_factor: f64,
}

impl Default for ControllerPolicy {
    fn default() -> Self {
        Self {
            high_utilization: 80.0,
            low_utilization: 30.0,
            shrink_factor: 0.7,
            growth_factor: 1.1,
        }
    }
}
