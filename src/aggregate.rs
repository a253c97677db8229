//! Turning per-host probe outcomes into a single RTT decision.

use std::time::Duration;

use thiserror::Error;

use crate::probe::ProbeError;

/// One host's outcome from a dispatcher run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// The probed host.
    pub host: String,
    /// Elapsed RTT, or why the host was excluded from this cycle.
    pub result: Result<Duration, ProbeError>,
}

/// Aggregate RTT statistics over one cycle's successful probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSummary {
    /// The maximum observed RTT.
    ///
    /// This is the value propagated forward: shaping is tuned to the worst
    /// observed path, not the average.
    pub worst: Duration,
    /// Arithmetic mean over the same successes, for diagnostics only.
    pub mean: Duration,
    /// Number of hosts that produced a valid RTT.
    pub live: usize,
}

/// Why a cycle's outcomes could not produce an RTT.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    /// Fewer hosts responded than the configured minimum.
    ///
    /// The live count is still meaningful to callers for status reporting.
    #[error("not enough responding hosts ({live} < {required})")]
    InsufficientData {
        /// Hosts that produced a valid RTT.
        live: usize,
        /// The configured minimum sample size.
        required: usize,
    },
}

/// Partition outcomes into successes and failures and summarize the
/// successes, gated on a minimum sample size.
///
/// The result does not depend on outcome order: workers race, so admission
/// order never determines completion order.
pub fn summarize(
    outcomes: &[ProbeOutcome],
    min_hosts: usize,
) -> Result<RttSummary, AggregateError> {
    assert!(min_hosts >= 1, "minimum sample size must be >= 1");

    let rtts: Vec<Duration> = outcomes
        .iter()
        .filter_map(|outcome| outcome.result.as_ref().ok().copied())
        .collect();

    let live = rtts.len();
    if live < min_hosts {
        return Err(AggregateError::InsufficientData {
            live,
            required: min_hosts,
        });
    }

    let worst = rtts.iter().copied().max().expect("live >= min_hosts >= 1");
    let sum: Duration = rtts.iter().sum();
    let mean = sum / u32::try_from(live).expect("host count fits in u32");

    Ok(RttSummary { worst, mean, live })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(host: &str, ms: u64) -> ProbeOutcome {
        ProbeOutcome {
            host: host.into(),
            result: Ok(Duration::from_millis(ms)),
        }
    }

    fn failed(host: &str) -> ProbeOutcome {
        ProbeOutcome {
            host: host.into(),
            result: Err(ProbeError::Unreachable {
                last: "connection refused".into(),
            }),
        }
    }

    #[test]
    fn propagates_the_worst_rtt_and_counts_live_hosts() {
        let outcomes = [ok("h1", 10), failed("h2"), ok("h3", 50)];

        let summary = summarize(&outcomes, 1).unwrap();
        assert_eq!(summary.worst, Duration::from_millis(50));
        assert_eq!(summary.mean, Duration::from_millis(30));
        assert_eq!(summary.live, 2);
    }

    #[test]
    fn all_failures_is_insufficient_data_with_a_zero_count() {
        let outcomes = [failed("a"), failed("b")];

        let err = summarize(&outcomes, 1).unwrap_err();
        assert_eq!(
            err,
            AggregateError::InsufficientData {
                live: 0,
                required: 1
            }
        );
    }

    #[test]
    fn partial_success_below_the_gate_reports_the_live_count() {
        let outcomes = [ok("h1", 10), failed("h2"), failed("h3")];

        let err = summarize(&outcomes, 2).unwrap_err();
        assert_eq!(
            err,
            AggregateError::InsufficientData {
                live: 1,
                required: 2
            }
        );
    }
}
