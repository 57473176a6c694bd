use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};

use super::buffer::CircularBuffer;
use super::{Progress, ProgressObserver, SessionMetrics};

const SPEED_SAMPLES: usize = 30;

/// Turns the session counters into a [Progress] snapshot once per interval
pub(crate) struct StatsRefresher {
    metrics: Arc<SessionMetrics>,
    refresh_interval: Duration,
    speed_stats: CircularBuffer<f64>,
    observer: Option<Arc<dyn ProgressObserver>>,
    progress_tx: watch::Sender<Progress>,
}

impl StatsRefresher {
    pub fn new(
        metrics: Arc<SessionMetrics>,
        refresh_interval: Duration,
        observer: Option<Arc<dyn ProgressObserver>>,
        progress_tx: watch::Sender<Progress>,
    ) -> Self {
        StatsRefresher {
            metrics,
            refresh_interval,
            speed_stats: CircularBuffer::new(SPEED_SAMPLES),
            observer,
            progress_tx,
        }
    }

    pub async fn handle(mut self, mut cancellation: oneshot::Receiver<()>) {
        let mut interval = interval(self.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let progress = self.refresh();
                    if let Some(observer) = self.observer.as_ref() {
                        observer.on_progress(&progress);
                    }
                    self.progress_tx.send_replace(progress);
                }
                _ = &mut cancellation => {
                    break;
                }
            }
        }

        // One final snapshot so that readers see the end state
        let progress = self.refresh();
        self.progress_tx.send_replace(progress);
    }

    fn refresh(&mut self) -> Progress {
        let interval_secs = self.refresh_interval.as_secs_f64().max(f64::EPSILON);
        let (downloaded, uploaded) = self.metrics.take_interval();
        let download_speed = downloaded as f64 / interval_secs;
        let upload_speed = uploaded as f64 / interval_secs;

        let completed_bytes = self.metrics.completed_bytes();
        let total_bytes = self.metrics.total_bytes();
        let left = total_bytes.saturating_sub(completed_bytes);

        // Only download samples matter for the ETA, stop collecting once there's nothing left
        if left > 0 {
            self.speed_stats.push_back(download_speed);
        }
        let avg_bytes_per_sec = if self.speed_stats.is_empty() {
            0.
        } else {
            self.speed_stats.iter().sum::<f64>() / self.speed_stats.len() as f64
        };

        let eta = if left == 0 {
            Some(Duration::ZERO)
        } else if avg_bytes_per_sec > 0. {
            Some(Duration::from_secs_f64(left as f64 / avg_bytes_per_sec))
        } else {
            None
        };

        let uploaded_bytes = self.metrics.uploaded_bytes();
        let (percent, seed_ratio) = if total_bytes == 0 {
            (100., 0.)
        } else {
            (
                completed_bytes as f64 * 100. / total_bytes as f64,
                uploaded_bytes as f64 / total_bytes as f64,
            )
        };

        Progress {
            percent,
            downloaded_bytes: self.metrics.downloaded_bytes(),
            uploaded_bytes,
            completed_bytes,
            total_bytes,
            download_speed,
            upload_speed,
            elapsed: self.metrics.elapsed(),
            eta,
            seed_ratio,
            peers: self.metrics.connected_peers(),
        }
    }
}
