//! Probe lifecycle types and the TCP connect prober.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpStream, time::Instant};

/// Lifecycle stage of a probe.
///
/// Transitions are monotonic: `Queued → Probing → {Done | Failed}`. An entry
/// never regresses to an earlier stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStage {
    /// Admitted to the job queue, not yet claimed by a worker.
    Queued,
    /// Claimed by a worker; a connection attempt is in flight.
    Probing,
    /// A port answered; the RTT was recorded.
    Done,
    /// Every port attempt failed.
    Failed,
}

impl ProbeStage {
    /// Position in the lifecycle, used to reject stage regressions.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Probing => 1,
            Self::Done | Self::Failed => 2,
        }
    }
}

/// Point-in-time state of one host's probe, as shown to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeStatus {
    /// Host address being probed.
    pub host: String,
    /// Current lifecycle stage.
    pub stage: ProbeStage,
    /// Measured round-trip time in whole milliseconds, present once `Done`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<u64>,
    /// Failure description, present once `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeStatus {
    pub(crate) fn new(host: impl Into<String>, stage: ProbeStage) -> Self {
        Self {
            host: host.into(),
            stage,
            rtt_ms: None,
            error: None,
        }
    }

    pub(crate) fn finished(host: impl Into<String>, result: &Result<Duration, ProbeError>) -> Self {
        match result {
            Ok(rtt) => Self {
                host: host.into(),
                stage: ProbeStage::Done,
                rtt_ms: Some(u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX)),
                error: None,
            },
            Err(err) => Self {
                host: host.into(),
                stage: ProbeStage::Failed,
                rtt_ms: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// An immutable snapshot taken at the moment a probe left the in-flight set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedProbe {
    /// Final state of the probe (`Done` or `Failed`).
    #[serde(flatten)]
    pub status: ProbeStatus,
    /// When the result was recorded.
    pub completed_at: DateTime<Utc>,
}

/// Failure to measure a host within one measurement cycle.
///
/// Never fatal and never retried within the cycle: the host is simply
/// excluded from that cycle's statistics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// Every port attempt failed; carries the error from the last attempt.
    #[error("no reachable ports (last: {last})")]
    Unreachable {
        /// Error reported by the final connection attempt.
        last: String,
    },
}

/// Measures round-trip time to a single host.
///
/// There is exactly one production implementation, [TcpConnectProbe]; tests
/// inject doubles to make probe outcomes deterministic.
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    /// Measure one host, bounded by `timeout` per connection attempt.
    async fn probe(&self, host: &str, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Ports attempted, in order, by [TcpConnectProbe].
pub const DEFAULT_PROBE_PORTS: [u16; 6] = [80, 443, 22, 21, 25, 53];

/// TCP connection establishment timed against an ordered list of common
/// ports.
///
/// The first successful connection's elapsed time is the host's RTT; the
/// connection is closed immediately. Each attempt gets the full per-probe
/// timeout.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    ports: Vec<u16>,
}

impl TcpConnectProbe {
    /// Probe a custom port sequence instead of [DEFAULT_PROBE_PORTS].
    pub fn with_ports(ports: Vec<u16>) -> Self {
        assert!(!ports.is_empty(), "at least one port required");
        Self { ports }
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self {
            ports: DEFAULT_PROBE_PORTS.to_vec(),
        }
    }
}

#[async_trait]
impl ProbeExecutor for TcpConnectProbe {
    async fn probe(&self, host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        // Hosts come from the provider as IP literals; parsing up front keeps
        // the resolver out of the measurement.
        let ip: IpAddr = host.parse().map_err(|_| ProbeError::Unreachable {
            last: format!("invalid host address: {host}"),
        })?;

        let mut last = String::from("no ports attempted");
        for &port in &self.ports {
            let start = Instant::now();
            match tokio::time::timeout(timeout, TcpStream::connect(SocketAddr::new(ip, port))).await
            {
                Ok(Ok(_conn)) => return Ok(start.elapsed()),
                Ok(Err(err)) => last = err.to_string(),
                Err(_) => last = format!("port {port}: connect timed out"),
            }
        }

        Err(ProbeError::Unreachable { last })
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    use super::*;

    #[tokio::test]
    async fn measures_rtt_against_a_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpConnectProbe::with_ports(vec![port]);
        let rtt = tokio_test::assert_ok!(probe.probe("127.0.0.1", Duration::from_secs(1)).await);

        assert!(rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn falls_through_to_a_later_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let probe = TcpConnectProbe::with_ports(vec![closed, open]);
        let rtt = probe
            .probe("127.0.0.1", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn reports_the_last_error_when_no_port_answers() {
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let probe = TcpConnectProbe::with_ports(vec![closed]);
        let err = probe
            .probe("127.0.0.1", Duration::from_millis(500))
            .await
            .unwrap_err();

        let ProbeError::Unreachable { last } = err;
        assert!(!last.is_empty());
    }

    #[tokio::test]
    async fn rejects_a_host_that_is_not_an_ip_literal() {
        let probe = TcpConnectProbe::default();
        let err = probe
            .probe("not-an-ip", Duration::from_millis(10))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("invalid host address"));
    }

    #[test]
    fn status_serializes_with_compact_field_shapes() {
        let queued = ProbeStatus::new("10.1.2.3", ProbeStage::Queued);
        assert_eq!(
            serde_json::to_value(&queued).unwrap(),
            serde_json::json!({"host": "10.1.2.3", "stage": "queued"})
        );

        let done = ProbeStatus::finished("10.1.2.3", &Ok(Duration::from_millis(5)));
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            serde_json::json!({"host": "10.1.2.3", "stage": "done", "rtt_ms": 5})
        );
    }
}
