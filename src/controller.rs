//! Adaptive concurrency control driven by CPU utilization sampling.

use tokio::time::sleep;

use crate::{config::ControllerPolicy, engine::Engine, logs::LogLevel, BoxError};

/// Cumulative CPU tick counters.
///
/// Utilization is derived from the delta between two consecutive samples,
/// never from absolute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSample {
    /// Total ticks across all CPU states.
    pub total: u64,
    /// Ticks spent idle.
    pub idle: u64,
}

/// Source of cumulative CPU tick counters.
///
/// Counters are expected to be monotonically non-decreasing between calls.
/// The controller does not validate this; it silently skips a tick whose
/// delta is non-positive.
pub trait CpuSampleSource: Send + Sync {
    /// Read the current counters.
    fn sample(&self) -> Result<CpuSample, BoxError>;
}

/// Reads the aggregate `cpu` line from `/proc/stat`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcStatSource;

impl CpuSampleSource for ProcStatSource {
    fn sample(&self) -> Result<CpuSample, BoxError> {
        let data = std::fs::read_to_string("/proc/stat")?;
        parse_proc_stat(&data)
    }
}

fn parse_proc_stat(data: &str) -> Result<CpuSample, BoxError> {
    let line = data.lines().next().unwrap_or_default();
    let mut fields = line.split_whitespace();
    if fields.next() != Some("cpu") {
        return Err("unexpected /proc/stat format".into());
    }

    let mut total = 0u64;
    let mut idle = 0u64;
    let mut count = 0usize;
    for (i, field) in fields.enumerate() {
        let value: u64 = field.parse()?;
        total += value;
        // The idle counter is the fourth value after the label.
        if i == 3 {
            idle = value;
        }
        count = i + 1;
    }
    if count < 4 {
        return Err("unexpected /proc/stat format".into());
    }

    Ok(CpuSample { total, idle })
}

/// Compute the next worker cap from the current cap, the configured maximum
/// and the sampled utilization (in percent).
pub fn compute_target(
    current: usize,
    cfg_max: usize,
    utilization: f64,
    policy: &ControllerPolicy,
) -> usize {
    if utilization > policy.high_utilization {
        // Floor, so the cap keeps shrinking even for small values.
        let shrunk = (current as f64 * policy.shrink_factor).floor() as usize;
        shrunk.max(1)
    } else if utilization < policy.low_utilization {
        let grown = (current as f64 * policy.growth_factor).floor() as usize + 1;
        grown.min(cfg_max)
    } else {
        current
    }
}

/// Background retuner for the engine's worker cap.
///
/// The controller is the sole writer of the cap. Sampling failures are soft:
/// a failed initial sample disables adaptive sizing for the process lifetime,
/// a failed tick is skipped.
pub struct Controller<S> {
    engine: Engine,
    source: S,
}

impl<S: CpuSampleSource> Controller<S> {
    /// Pair an engine with a CPU sample source.
    pub fn new(engine: Engine, source: S) -> Self {
        Self { engine, source }
    }

    /// Run until the engine's cancellation signal fires.
    pub async fn run(self) {
        let Ok(mut prev) = self.source.sample() else {
            self.engine.log(
                LogLevel::Debug,
                "cpu sampling unavailable, adaptive sizing disabled",
            );
            return;
        };

        let cancel = self.engine.cancellation_token();
        loop {
            let interval = self.engine.config().controller.sample_interval;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(interval) => {}
            }

            let Ok(sample) = self.source.sample() else {
                continue;
            };

            let d_total = sample.total.saturating_sub(prev.total);
            let d_idle = sample.idle.saturating_sub(prev.idle);
            prev = sample;
            if d_total == 0 {
                // Stalled counters; skip rather than divide by zero.
                continue;
            }
            let utilization = (1.0 - d_idle as f64 / d_total as f64) * 100.0;

            let config = self.engine.config();
            let current = self.engine.worker_cap();
            let target = compute_target(
                current,
                config.max_concurrent_probes,
                utilization,
                &config.controller.policy,
            );

            if target != current {
                self.engine.set_worker_cap(target);
                self.engine.log(
                    LogLevel::Info,
                    format!(
                        "adaptive controller adjusted worker cap: {current} -> {target} \
                         (cpu {utilization:.1}%)"
                    ),
                );
            }
        }
    }
}
