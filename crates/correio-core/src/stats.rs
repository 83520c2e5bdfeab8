use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Running commit-time statistics for one destination. Read-only to
/// callers; updated by the put/get path and the session commit pass.
#[derive(Debug, Default)]
pub struct Stats {
    puts: AtomicU64,
    gets: AtomicU64,
    commits: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

#[derive(Debug, Default)]
struct LatencyWindow {
    min_ns: u64,
    max_ns: u64,
    total_ns: u64,
    count: u64,
}

/// Point-in-time copy of a destination's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub puts: u64,
    pub gets: u64,
    pub commits: u64,
    pub commit_latency_min: Duration,
    pub commit_latency_max: Duration,
    pub commit_latency_avg: Duration,
}

impl Stats {
    pub(crate) fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self, elapsed: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        let ns = elapsed.as_nanos() as u64;
        let mut window = self.latency.lock();
        if window.count == 0 || ns < window.min_ns {
            window.min_ns = ns;
        }
        if ns > window.max_ns {
            window.max_ns = ns;
        }
        window.total_ns += ns;
        window.count += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let window = self.latency.lock();
        let avg_ns = if window.count == 0 {
            0
        } else {
            window.total_ns / window.count
        };
        StatsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_latency_min: Duration::from_nanos(window.min_ns),
            commit_latency_max: Duration::from_nanos(window.max_ns),
            commit_latency_avg: Duration::from_nanos(avg_ns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_window_tracks_min_max_avg() {
        let stats = Stats::default();
        stats.record_commit(Duration::from_nanos(100));
        stats.record_commit(Duration::from_nanos(300));
        stats.record_commit(Duration::from_nanos(200));

        let snap = stats.snapshot();
        assert_eq!(snap.commits, 3);
        assert_eq!(snap.commit_latency_min, Duration::from_nanos(100));
        assert_eq!(snap.commit_latency_max, Duration::from_nanos(300));
        assert_eq!(snap.commit_latency_avg, Duration::from_nanos(200));
    }

    #[test]
    fn empty_snapshot_is_zeroed() {
        let snap = Stats::default().snapshot();
        assert_eq!(snap.puts, 0);
        assert_eq!(snap.commit_latency_avg, Duration::ZERO);
    }
}
