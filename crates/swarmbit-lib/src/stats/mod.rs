mod buffer;
mod refresher;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub(crate) use refresher::StatsRefresher;

/// Counters of a single session. Updated by the session and the uploader, read once per interval by
/// [StatsRefresher].
#[derive(Debug)]
pub struct SessionMetrics {
    started_at: Instant,
    total_bytes: u64,
    /// Raw payload bytes received, including discarded ones
    downloaded_bytes: AtomicU64,
    uploaded_bytes: AtomicU64,
    /// Bytes of verified pieces
    completed_bytes: AtomicU64,
    downloaded_last_interval: AtomicU64,
    uploaded_last_interval: AtomicU64,
    connected_peers: AtomicUsize,
}

impl SessionMetrics {
    pub fn new(total_bytes: u64) -> Self {
        SessionMetrics {
            started_at: Instant::now(),
            total_bytes,
            downloaded_bytes: AtomicU64::new(0),
            uploaded_bytes: AtomicU64::new(0),
            completed_bytes: AtomicU64::new(0),
            downloaded_last_interval: AtomicU64::new(0),
            uploaded_last_interval: AtomicU64::new(0),
            connected_peers: AtomicUsize::new(0),
        }
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.downloaded_last_interval.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.uploaded_last_interval.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_completed(&self, bytes: u64) {
        self.completed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_connected_peers(&self, peers: usize) {
        self.connected_peers.store(peers, Ordering::Relaxed);
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes.load(Ordering::Relaxed)
    }

    pub fn connected_peers(&self) -> usize {
        self.connected_peers.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Returns the bytes transferred since the previous call as `(downloaded, uploaded)`
    fn take_interval(&self) -> (u64, u64) {
        (
            self.downloaded_last_interval.swap(0, Ordering::Relaxed),
            self.uploaded_last_interval.swap(0, Ordering::Relaxed),
        )
    }
}

/// What a progress observer gets once per refresh interval
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    /// Verified bytes relative to the torrent size, `0..=100`
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    /// Bytes per second over the last interval
    pub download_speed: f64,
    pub upload_speed: f64,
    pub elapsed: Duration,
    /// `None` while nothing is being downloaded
    pub eta: Option<Duration>,
    /// Uploaded bytes relative to the torrent size
    pub seed_ratio: f64,
    pub peers: usize,
}

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &Progress);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_counters_reset() {
        let metrics = SessionMetrics::new(100);
        metrics.add_downloaded(10);
        metrics.add_downloaded(5);
        metrics.add_uploaded(7);

        assert_eq!(metrics.take_interval(), (15, 7));
        assert_eq!(metrics.take_interval(), (0, 0));
        assert_eq!(metrics.downloaded_bytes(), 15);
        assert_eq!(metrics.uploaded_bytes(), 7);
    }
}
