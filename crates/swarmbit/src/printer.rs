use swarmbit_lib::{Progress, ProgressObserver};

/// Logs a progress line on every refresh
pub struct ProgressPrinter;

impl ProgressObserver for ProgressPrinter {
    fn on_progress(&self, progress: &Progress) {
        let eta = match progress.eta {
            Some(eta) => format!("{:.0} s", eta.as_secs_f64()),
            None => "∞".to_string(),
        };

        tracing::info!(
            "ETA: {} - {:.2}% - ↓{:.2} MiB/s - ↑{:.2} MiB/s - ratio: {:.2} - peers: {}",
            eta,
            progress.percent,
            progress.download_speed / 1024. / 1024.,
            progress.upload_speed / 1024. / 1024.,
            progress.seed_ratio,
            progress.peers
        );
    }
}
