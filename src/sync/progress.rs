use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Pass-scoped progress counters. Workers update them with atomic adds;
/// the reporter reads them without further synchronization, so the printed
/// line may drift by a few units.
#[derive(Debug)]
pub struct Progress {
    repos_total: AtomicU64,
    repos_done: AtomicU64,
    tags_total: AtomicU64,
    tags_done: AtomicU64,
    pass_started_ms: AtomicU64,
    origin: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub repos_done: u64,
    pub repos_total: u64,
    pub tags_done: u64,
    pub tags_total: u64,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            repos_total: AtomicU64::new(0),
            repos_done: AtomicU64::new(0),
            tags_total: AtomicU64::new(0),
            tags_done: AtomicU64::new(0),
            pass_started_ms: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    /// Zeroes the counters at the start of a pass.
    pub fn reset(&self) {
        self.repos_total.store(0, Ordering::Relaxed);
        self.repos_done.store(0, Ordering::Relaxed);
        self.tags_total.store(0, Ordering::Relaxed);
        self.tags_done.store(0, Ordering::Relaxed);
        self.pass_started_ms
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn add_repos_total(&self, count: u64) {
        self.repos_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_repos_done(&self) {
        self.repos_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tags_total(&self, count: u64) {
        self.tags_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_tags_done(&self) {
        self.tags_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            repos_done: self.repos_done.load(Ordering::Relaxed),
            repos_total: self.repos_total.load(Ordering::Relaxed),
            tags_done: self.tags_done.load(Ordering::Relaxed),
            tags_total: self.tags_total.load(Ordering::Relaxed),
        }
    }

    /// Time since the last [`reset`](Self::reset), truncated to seconds.
    pub fn elapsed(&self) -> Duration {
        let since_origin = self.origin.elapsed().as_millis() as u64;
        let started = self.pass_started_ms.load(Ordering::Relaxed);
        Duration::from_secs(since_origin.saturating_sub(started) / 1000)
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the once-a-minute progress line.
pub(crate) fn spawn_reporter(progress: Arc<Progress>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + REPORT_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, REPORT_INTERVAL);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = progress.snapshot();
                    info!(
                        "repos [{}/{}] tags [{}/{}] elapsed={}",
                        snapshot.repos_done,
                        snapshot.repos_total,
                        snapshot.tags_done,
                        snapshot.tags_total,
                        humantime::format_duration(progress.elapsed()),
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let progress = Progress::new();
        progress.add_repos_total(3);
        progress.inc_repos_done();
        progress.add_tags_total(5);
        progress.inc_tags_done();
        progress.inc_tags_done();

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.repos_total, 3);
        assert_eq!(snapshot.repos_done, 1);
        assert_eq!(snapshot.tags_total, 5);
        assert_eq!(snapshot.tags_done, 2);
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let progress = Progress::new();
        progress.add_repos_total(3);
        progress.add_tags_total(5);

        progress.reset();

        assert_eq!(
            progress.snapshot(),
            ProgressSnapshot {
                repos_done: 0,
                repos_total: 0,
                tags_done: 0,
                tags_total: 0,
            }
        );
    }
}
