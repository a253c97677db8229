//! Bounded-concurrency execution of per-host probes.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinSet, time::sleep};

use crate::{aggregate::ProbeOutcome, engine::Engine, probe::ProbeStage};

/// Hard ceiling on concurrent probe workers, regardless of configuration.
pub(crate) const MAX_WORKERS: usize = 500;

/// Worker-indexed pacing spread in milliseconds, added to the configured base
/// delay so workers don't fire in lockstep against the same remote networks.
const PACING_SPREAD_MS: u64 = 10;

/// Run one bounded-concurrency probe pass over `hosts`.
///
/// Every admitted host yields exactly one outcome: workers hold the only
/// result senders, so the channel drains exactly until the last worker
/// exits, and the pool is joined before returning.
pub(crate) async fn run_probes(
    engine: &Engine,
    hosts: Vec<String>,
    cap: usize,
) -> Vec<ProbeOutcome> {
    if hosts.is_empty() {
        return Vec::new();
    }

    let (timeout, pacing) = {
        let config = engine.config();
        (config.probe_timeout, config.worker_pacing)
    };

    let workers = cap.clamp(1, MAX_WORKERS).min(hosts.len());
    let admitted = hosts.len();

    // Every host is marked queued before any worker starts pulling.
    for host in &hosts {
        engine.advance_probe(host, ProbeStage::Queued);
    }

    let jobs = Arc::new(Mutex::new(hosts.into_iter().collect::<VecDeque<String>>()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut pool = JoinSet::new();
    for index in 0..workers {
        let engine = engine.clone();
        let jobs = Arc::clone(&jobs);
        let tx = tx.clone();
        let cancel = engine.cancellation_token();

        pool.spawn(async move {
            loop {
                // Cooperative cancellation: checked between jobs, never
                // mid-probe.
                if cancel.is_cancelled() {
                    return;
                }
                let Some(host) = jobs.lock().pop_front() else {
                    return;
                };

                engine.advance_probe(&host, ProbeStage::Probing);
                let result = engine.executor().probe(&host, timeout).await;
                engine.finish_probe(&host, &result);

                let _ = tx.send(ProbeOutcome { host, result });

                sleep(pacing + Duration::from_millis(index as u64 % PACING_SPREAD_MS)).await;
            }
        });
    }
    drop(tx);

    let mut outcomes = Vec::with_capacity(admitted);
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }
    // Join barrier: the channel closing means every sender is gone, but the
    // pool is still drained so no worker outlives the cycle.
    while pool.join_next().await.is_some() {}

    outcomes
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use crate::{
        config::TunerConfig,
        probe::{ProbeError, ProbeExecutor},
    };

    use super::*;

    /// Tracks peak concurrency while pretending every host answers in 5 ms.
    #[derive(Default)]
    struct CountingProbe {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ProbeExecutor for CountingProbe {
        async fn probe(&self, _host: &str, _timeout: Duration) -> Result<Duration, ProbeError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Duration::from_millis(5))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn every_admitted_host_yields_exactly_one_outcome() {
        let probe = Arc::new(CountingProbe::default());
        let engine = Engine::with_executor(TunerConfig::default(), probe);

        let hosts: Vec<String> = (1..=6).map(|i| format!("10.0.0.{i}")).collect();
        let outcomes = run_probes(&engine, hosts.clone(), 3).await;

        let seen: BTreeSet<&str> = outcomes.iter().map(|o| o.host.as_str()).collect();
        assert_eq!(outcomes.len(), 6);
        assert_eq!(seen.len(), 6);
        assert!(hosts.iter().all(|h| seen.contains(h.as_str())));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_the_cap() {
        let probe = Arc::new(CountingProbe::default());
        let engine =
            Engine::with_executor(TunerConfig::default(), Arc::clone(&probe) as Arc<dyn ProbeExecutor>);

        let hosts: Vec<String> = (1..=8).map(|i| format!("10.0.0.{i}")).collect();
        run_probes(&engine, hosts, 2).await;

        assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_probes_move_to_the_completed_history() {
        let probe = Arc::new(CountingProbe::default());
        let engine = Engine::with_executor(TunerConfig::default(), probe);

        let hosts: Vec<String> = (1..=4).map(|i| format!("10.0.0.{i}")).collect();
        run_probes(&engine, hosts, 2).await;

        assert!(
            engine.current_probes().is_empty(),
            "nothing should stay in flight"
        );
        assert_eq!(engine.recent_completed().len(), 4);
    }
}
