//! Time- and count-bounded history of finished probes.

use std::{collections::VecDeque, time::Duration};

use chrono::{DateTime, Utc};

use crate::probe::{CompletedProbe, ProbeStatus};

/// Recently finished probes, kept for observers until either the retention
/// window or the entry cap trims them, whichever is reached first.
#[derive(Debug)]
pub(crate) struct CompletedBuffer {
    retention: Duration,
    max_entries: usize,
    entries: VecDeque<CompletedProbe>,
}

impl CompletedBuffer {
    pub(crate) fn new(retention: Duration, max_entries: usize) -> Self {
        assert!(max_entries > 0, "capacity must be > 0");
        Self {
            retention,
            max_entries,
            entries: VecDeque::with_capacity(max_entries),
        }
    }

    /// Record a finished probe, trimming to the most recent entries.
    pub(crate) fn push(&mut self, status: ProbeStatus) {
        self.entries.push_back(CompletedProbe {
            status,
            completed_at: Utc::now(),
        });
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// Drop entries past the retention window, then re-apply the entry cap.
    pub(crate) fn prune(&mut self) {
        let now = Utc::now();
        self.entries
            .retain(|entry| is_fresh(entry, now, self.retention));
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// Entries still within the retention window, oldest first.
    pub(crate) fn recent(&self) -> Vec<CompletedProbe> {
        let now = Utc::now();
        let fresh: Vec<CompletedProbe> = self
            .entries
            .iter()
            .filter(|entry| is_fresh(entry, now, self.retention))
            .cloned()
            .collect();

        let skip = fresh.len().saturating_sub(self.max_entries);
        fresh.into_iter().skip(skip).collect()
    }
}

fn is_fresh(entry: &CompletedProbe, now: DateTime<Utc>, retention: Duration) -> bool {
    now.signed_duration_since(entry.completed_at)
        .to_std()
        .map_or(true, |age| age <= retention)
}

#[cfg(test)]
mod tests {
    use crate::probe::ProbeStage;

    use super::*;

    fn done(host: &str) -> ProbeStatus {
        ProbeStatus::finished(host, &Ok(Duration::from_millis(5)))
    }

    #[test]
    fn keeps_only_the_most_recently_completed_entries() {
        let mut buffer = CompletedBuffer::new(Duration::from_secs(60), 2);

        for host in ["h1", "h2", "h3", "h4", "h5"] {
            buffer.push(done(host));
        }

        let recent = buffer.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status.host, "h4");
        assert_eq!(recent[1].status.host, "h5");
    }

    #[test]
    fn prune_drops_entries_past_the_retention_window() {
        let mut buffer = CompletedBuffer::new(Duration::from_secs(5), 10);
        buffer.push(done("old"));
        buffer.push(done("new"));
        buffer.entries[0].completed_at = Utc::now() - chrono::Duration::seconds(60);

        buffer.prune();

        assert_eq!(buffer.entries.len(), 1);
        assert_eq!(buffer.entries[0].status.host, "new");
    }

    #[test]
    fn recent_filters_stale_entries_without_mutating() {
        let mut buffer = CompletedBuffer::new(Duration::from_secs(5), 10);
        buffer.push(done("old"));
        buffer.push(done("new"));
        buffer.entries[0].completed_at = Utc::now() - chrono::Duration::seconds(60);

        let recent = buffer.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status.host, "new");
        assert_eq!(buffer.entries.len(), 2, "read must not prune");
    }

    #[test]
    fn recorded_failures_keep_their_error() {
        let mut buffer = CompletedBuffer::new(Duration::from_secs(5), 10);
        buffer.push(ProbeStatus::finished(
            "h1",
            &Err(crate::probe::ProbeError::Unreachable {
                last: "connection refused".into(),
            }),
        ));

        let recent = buffer.recent();
        assert_eq!(recent[0].status.stage, ProbeStage::Failed);
        assert!(recent[0].status.error.as_deref().unwrap().contains("refused"));
    }
}
