//! The measurement engine: shared state, the cycle orchestrator, the history
//! pruner and the read-only observability surface.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::{self, AggregateError},
    config::TunerConfig,
    controller::{Controller, CpuSampleSource},
    dispatcher,
    history::CompletedBuffer,
    logs::{EventLog, LogEntry, LogLevel},
    probe::{CompletedProbe, ProbeError, ProbeExecutor, ProbeStage, ProbeStatus, TcpConnectProbe},
    store::RingStore,
    BoxError,
};

/// Supplies the candidate hosts for one measurement cycle.
///
/// Implementations return a deduplicated list of IP literals. The engine does
/// not deduplicate; duplicates, if present, become independent probe targets.
#[async_trait]
pub trait HostProvider: Send + Sync {
    /// Addresses of currently-active remote hosts.
    async fn hosts(&self) -> Result<Vec<String>, BoxError>;
}

/// Applies a chosen RTT to a traffic-shaping interface.
///
/// Fire-and-forget: the engine logs failures and never retries them; the next
/// measurement cycle naturally tries again.
#[async_trait]
pub trait ShapingAdjuster: Send + Sync {
    /// Apply `rtt_us` (microseconds) to `interface`.
    async fn apply(&self, interface: &str, rtt_us: u64) -> Result<(), BoxError>;
}

/// Which value populated an RTT history slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RttKind {
    /// Aggregated from live probes.
    Measured,
    /// The configured fallback.
    Default,
    /// The margin-adjusted value handed to the shaping adjuster.
    Final,
}

/// Read-only service snapshot for dashboards and CLIs.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// Whether the measurement loop is running.
    pub running: bool,
    /// Completion time of the last cycle.
    pub last_update: DateTime<Utc>,
    /// Most recent RTT per kind, in whole milliseconds.
    pub last_rtt: BTreeMap<RttKind, u64>,
    /// Responding-host count from the last cycle.
    pub active_hosts: usize,
    /// Current configuration snapshot.
    pub config: TunerConfig,
}

/// In-flight probe view plus the completed history, guarded together: every
/// stage transition touches both or either under one critical section.
struct ProbeState {
    current: RingStore<String, ProbeStatus>,
    completed: CompletedBuffer,
}

/// Service-status scope: read far more often than written.
struct ServiceState {
    running: bool,
    last_update: DateTime<Utc>,
    last_rtt: BTreeMap<RttKind, u64>,
    active_hosts: usize,
    worker_cap: usize,
}

struct Shared {
    config: RwLock<TunerConfig>,
    probes: RwLock<ProbeState>,
    service: RwLock<ServiceState>,
    log: EventLog,
    executor: Arc<dyn ProbeExecutor>,
    cancel: CancellationToken,
}

/// The probing engine: all mutable service state plus the background loops
/// that act on it.
///
/// Cheaply cloneable; clones share state. Construct one per process, hand
/// clones to the background loops, and read the observability surface from
/// anywhere.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Create an engine using the production TCP prober.
    pub fn new(config: TunerConfig) -> Self {
        Self::with_executor(config, Arc::new(TcpConnectProbe::default()))
    }

    /// Create an engine with an injected probe executor.
    pub fn with_executor(config: TunerConfig, executor: Arc<dyn ProbeExecutor>) -> Self {
        assert!(config.min_hosts >= 1, "min_hosts must be >= 1");
        assert!(
            config.max_concurrent_probes >= 1,
            "max_concurrent_probes must be >= 1"
        );

        let shared = Shared {
            probes: RwLock::new(ProbeState {
                current: RingStore::new(config.probes_max_entries),
                completed: CompletedBuffer::new(
                    config.completed_retention,
                    config.completed_max_entries,
                ),
            }),
            service: RwLock::new(ServiceState {
                running: false,
                last_update: Utc::now(),
                last_rtt: BTreeMap::new(),
                active_hosts: 0,
                worker_cap: config.max_concurrent_probes,
            }),
            log: EventLog::new(config.recent_logs_max_entries),
            config: RwLock::new(config),
            executor,
            cancel: CancellationToken::new(),
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// A clone of the engine's cancellation token, for embedding into a
    /// larger shutdown tree.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Request cooperative shutdown; every background loop observes the
    /// signal within one tick and exits cleanly.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> TunerConfig {
        self.shared.config.read().clone()
    }

    /// Swap the configuration at runtime.
    ///
    /// Cycles read a fresh snapshot when they start, so a reload never tears
    /// a running cycle. Bounded-store capacities and the cycle interval are
    /// fixed at construction.
    pub fn update_config(&self, config: TunerConfig) {
        let summary = format!(
            "configuration reloaded: min_hosts={} max_concurrent_probes={} margin={}%",
            config.min_hosts, config.max_concurrent_probes, config.rtt_margin_percent
        );
        *self.shared.config.write() = config;
        self.log(LogLevel::Info, summary);
    }

    /// The current adaptive worker cap (always at least 1).
    pub fn worker_cap(&self) -> usize {
        self.shared.service.read().worker_cap.max(1)
    }

    /// Commit a new worker cap. Only the adaptive controller calls this.
    pub(crate) fn set_worker_cap(&self, cap: usize) {
        self.shared.service.write().worker_cap = cap.max(1);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.shared.log.record(level, message);
    }

    pub(crate) fn executor(&self) -> Arc<dyn ProbeExecutor> {
        Arc::clone(&self.shared.executor)
    }

    /// Record a stage transition for `host`, admitting it if new.
    ///
    /// Transitions are monotonic; an attempt to regress a live entry to an
    /// earlier stage is ignored.
    pub(crate) fn advance_probe(&self, host: &str, stage: ProbeStage) {
        let key = host.to_string();
        let mut probes = self.shared.probes.write();
        if let Some(existing) = probes.current.get(&key) {
            if existing.stage.rank() >= stage.rank() {
                return;
            }
        }
        probes.current.put(key, ProbeStatus::new(host, stage));
    }

    /// Record a final result: the entry leaves the in-flight view and a
    /// timestamped snapshot enters the completed history.
    pub(crate) fn finish_probe(&self, host: &str, result: &Result<Duration, ProbeError>) {
        let status = ProbeStatus::finished(host, result);
        let mut probes = self.shared.probes.write();
        probes.current.remove(&host.to_string());
        probes.completed.push(status);
    }

    /// Bounded, deterministically ordered view of in-flight probes.
    pub fn current_probes(&self) -> Vec<ProbeStatus> {
        self.shared.probes.read().current.snapshot()
    }

    /// Completed probes still within the retention window, oldest first.
    pub fn recent_completed(&self) -> Vec<CompletedProbe> {
        self.shared.probes.read().completed.recent()
    }

    /// Recent log entries, sequence-ordered.
    pub fn recent_logs(&self) -> Vec<LogEntry> {
        self.shared.log.recent()
    }

    /// Read-only service snapshot.
    pub fn system_status(&self) -> SystemStatus {
        let config = self.config();
        let service = self.shared.service.read();
        SystemStatus {
            running: service.running,
            last_update: service.last_update,
            last_rtt: service.last_rtt.clone(),
            active_hosts: service.active_hosts,
            config,
        }
    }

    /// Spawn the measurement loop, the history pruner and (when enabled) the
    /// adaptive controller onto the current runtime.
    ///
    /// The handles complete after [shutdown](Self::shutdown).
    pub fn start<P, A, S>(
        &self,
        provider: P,
        adjuster: A,
        cpu: S,
    ) -> Vec<tokio::task::JoinHandle<()>>
    where
        P: HostProvider + 'static,
        A: ShapingAdjuster + 'static,
        S: CpuSampleSource + 'static,
    {
        let mut handles = Vec::with_capacity(3);

        let engine = self.clone();
        handles.push(tokio::spawn(
            async move { engine.run(provider, adjuster).await },
        ));

        let engine = self.clone();
        handles.push(tokio::spawn(async move { engine.run_pruner().await }));

        if self.config().controller.enabled {
            handles.push(tokio::spawn(Controller::new(self.clone(), cpu).run()));
        }

        handles
    }

    /// Drive measurement cycles until cancellation.
    ///
    /// The first cycle runs immediately; afterwards a fixed-interval timer
    /// drives `idle → measuring → idle` transitions. A cycle that overruns
    /// the interval delays the next tick, it is never overlapped or skipped.
    pub async fn run(&self, provider: impl HostProvider, adjuster: impl ShapingAdjuster) {
        self.shared.service.write().running = true;
        self.log(LogLevel::Info, "starting measurement loop");

        let mut ticker = interval(self.config().update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancellation_token();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_cycle(&provider, &adjuster).await;
            self.shared.service.write().last_update = Utc::now();
        }

        self.shared.service.write().running = false;
        self.log(LogLevel::Info, "measurement loop stopped");
    }

    /// Periodically sweep the completed-probe history.
    pub async fn run_pruner(&self) {
        const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

        let cancel = self.cancellation_token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }
            self.shared.probes.write().completed.prune();
        }
    }

    /// Run a single measurement cycle: obtain hosts, probe them under the
    /// current worker cap, aggregate, and hand the margin-adjusted RTT to the
    /// adjuster once per configured interface.
    pub async fn run_cycle(&self, provider: &impl HostProvider, adjuster: &impl ShapingAdjuster) {
        let config = self.config();

        let hosts = match provider.hosts().await {
            Ok(hosts) => hosts,
            Err(err) => {
                // Skip the whole cycle; the next tick retries independently.
                self.log(
                    LogLevel::Error,
                    format!("failed to obtain candidate hosts: {err}"),
                );
                return;
            }
        };
        self.log(
            LogLevel::Debug,
            format!("found {} candidate hosts", hosts.len()),
        );

        let (rtt, kind, active) = if hosts.len() < config.min_hosts {
            self.log(
                LogLevel::Debug,
                format!(
                    "not enough hosts ({} < {}), using default rtt {:.2}ms",
                    hosts.len(),
                    config.min_hosts,
                    millis(config.default_rtt)
                ),
            );
            (config.default_rtt, RttKind::Default, hosts.len())
        } else {
            let cap = self.worker_cap();
            let outcomes = dispatcher::run_probes(self, hosts, cap).await;
            if self.shared.cancel.is_cancelled() {
                // Shutting down; don't adjust from a truncated run.
                return;
            }

            match aggregate::summarize(&outcomes, config.min_hosts) {
                Ok(summary) => {
                    self.log(
                        LogLevel::Debug,
                        format!(
                            "using measured rtt {:.2}ms (mean {:.2}ms, {} live)",
                            millis(summary.worst),
                            millis(summary.mean),
                            summary.live
                        ),
                    );
                    (summary.worst, RttKind::Measured, summary.live)
                }
                Err(err) => {
                    self.log(
                        LogLevel::Debug,
                        format!(
                            "rtt measurement failed: {err}, using default rtt {:.2}ms",
                            millis(config.default_rtt)
                        ),
                    );
                    let AggregateError::InsufficientData { live, .. } = err;
                    (config.default_rtt, RttKind::Default, live)
                }
            }
        };

        let adjusted = rtt.mul_f64(1.0 + config.rtt_margin_percent / 100.0);
        {
            let mut service = self.shared.service.write();
            service.last_rtt.insert(kind, whole_millis(rtt));
            service.last_rtt.insert(RttKind::Final, whole_millis(adjusted));
            service.active_hosts = active;
        }

        // Microseconds only at the shaping boundary.
        let rtt_us = u64::try_from(adjusted.as_micros()).unwrap_or(u64::MAX);
        self.log(
            LogLevel::Info,
            format!("adjusting shaping rtt to {:.2}ms ({rtt_us}us)", millis(adjusted)),
        );

        let targets = [config.dl_interface.as_deref(), config.ul_interface.as_deref()];
        for interface in targets.into_iter().flatten() {
            match adjuster.apply(interface, rtt_us).await {
                Ok(()) => {
                    self.log(LogLevel::Debug, format!("updated rtt on {interface}"));
                }
                Err(err) => {
                    self.log(
                        LogLevel::Error,
                        format!("failed to adjust rtt on {interface}: {err}"),
                    );
                }
            }
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::new(TunerConfig::default())
    }

    #[test]
    fn stage_transitions_never_regress() {
        let engine = engine();

        engine.advance_probe("10.0.0.1", ProbeStage::Queued);
        engine.advance_probe("10.0.0.1", ProbeStage::Probing);
        engine.advance_probe("10.0.0.1", ProbeStage::Queued);

        let probes = engine.current_probes();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].stage, ProbeStage::Probing);
    }

    #[test]
    fn worker_cap_starts_at_the_configured_maximum_and_floors_at_one() {
        let engine = engine();
        assert_eq!(engine.worker_cap(), 50);

        engine.set_worker_cap(0);
        assert_eq!(engine.worker_cap(), 1);
    }

    #[test]
    fn status_snapshot_reflects_initial_state() {
        let status = engine().system_status();
        assert!(!status.running);
        assert!(status.last_rtt.is_empty());
        assert_eq!(status.active_hosts, 0);
        assert_eq!(status.config.min_hosts, 3);
    }

    #[test]
    fn config_reloads_take_effect_and_are_logged() {
        let engine = engine();

        let mut config = engine.config();
        config.min_hosts = 5;
        engine.update_config(config);

        assert_eq!(engine.config().min_hosts, 5);
        assert!(engine
            .recent_logs()
            .iter()
            .any(|entry| entry.message.contains("configuration reloaded")));
    }

    #[test]
    fn current_probes_view_is_bounded_and_sorted() {
        let config = TunerConfig {
            probes_max_entries: 2,
            ..Default::default()
        };
        let engine = Engine::new(config);

        engine.advance_probe("10.0.0.3", ProbeStage::Queued);
        engine.advance_probe("10.0.0.1", ProbeStage::Queued);
        engine.advance_probe("10.0.0.2", ProbeStage::Queued);

        let probes = engine.current_probes();
        let hosts: Vec<&str> = probes.iter().map(|p| p.host.as_str()).collect();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2"]);
    }
}
