use std::net::SocketAddrV4;
use std::sync::Arc;

use bittorrent_peer_protocol::PeerMessage;
use tokio::sync::{mpsc, oneshot, watch};

use crate::peer::RequestedBlocks;
use crate::pieces::BlockKey;
use crate::stats::SessionMetrics;
use crate::storage::DiskMapper;

/// A block some peer asked us for
#[derive(Debug)]
pub struct UploadJob {
    pub(crate) key: BlockKey,
    pub(crate) requester: SocketAddrV4,
    pub(crate) sender: mpsc::UnboundedSender<PeerMessage>,
    /// The requester's pending requests. A job whose key is gone from here was cancelled.
    pub(crate) wanted: RequestedBlocks,
}

/// Serves queued requests from disk, one at a time and in arrival order
pub(crate) struct Uploader {
    mapper: DiskMapper,
    metrics: Arc<SessionMetrics>,
    jobs_rx: mpsc::UnboundedReceiver<UploadJob>,
    paused_rx: watch::Receiver<bool>,
}

impl Uploader {
    pub fn new(
        mapper: DiskMapper,
        metrics: Arc<SessionMetrics>,
        jobs_rx: mpsc::UnboundedReceiver<UploadJob>,
        paused_rx: watch::Receiver<bool>,
    ) -> Self {
        Uploader {
            mapper,
            metrics,
            jobs_rx,
            paused_rx,
        }
    }

    #[tracing::instrument(level = "error", skip_all)]
    pub async fn handle(mut self, mut cancellation: oneshot::Receiver<()>) {
        loop {
            let paused = *self.paused_rx.borrow_and_update();
            tokio::select! {
                _ = &mut cancellation => {
                    tracing::debug!("cancellation requested, uploader exiting");
                    break;
                }
                changed = self.paused_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                job = self.jobs_rx.recv(), if !paused => {
                    let Some(job) = job else {
                        tracing::debug!("upload queue closed, uploader exiting");
                        break;
                    };
                    self.serve(job).await;
                }
            }
        }
    }

    async fn serve(&self, job: UploadJob) {
        let UploadJob {
            key,
            requester,
            sender,
            wanted,
        } = job;

        // Could have been cancelled while waiting in the queue
        if !wanted.lock().await.contains(&key) {
            tracing::trace!(peer_addr = %requester, ?key, "skipping a cancelled request");
            return;
        }

        match self.mapper.read(key.piece_index, key.begin, key.length).await {
            Some(block) => {
                let length = block.len() as u64;
                let message = PeerMessage::Piece {
                    index: key.piece_index,
                    begin: key.begin,
                    block,
                };
                if sender.send(message).is_ok() {
                    self.metrics.add_uploaded(length);
                    tracing::trace!(peer_addr = %requester, ?key, "block sent");
                }
            }
            None => {
                tracing::debug!(peer_addr = %requester, ?key, "couldn't read a requested block, skipping it");
            }
        }

        wanted.lock().await.retain(|pending| pending != &key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::sync::Mutex;

    use super::*;
    use crate::storage::{FileInfo, RetryPolicy};

    async fn mapper(temp: &TempDir, content: &[u8]) -> DiskMapper {
        let path = temp.path().join("content.bin");
        tokio::fs::write(&path, content).await.expect("write content");
        DiskMapper::new(
            vec![FileInfo::new(path, content.len() as u64)],
            16,
            RetryPolicy {
                read_attempts: 1,
                write_attempts: 1,
                backoff: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn serves_wanted_blocks_and_skips_cancelled_ones() {
        let temp = TempDir::new().expect("temp dir");
        let content = (0..32u8).collect::<Vec<_>>();
        let metrics = Arc::new(SessionMetrics::new(32));

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (paused_tx, paused_rx) = watch::channel(true);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let uploader = Uploader::new(mapper(&temp, &content).await, metrics.clone(), jobs_rx, paused_rx);
        let task = tokio::spawn(uploader.handle(cancel_rx));

        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let served = BlockKey::new(1, 4, 8);
        let cancelled = BlockKey::new(0, 0, 8);
        let wanted: RequestedBlocks = Arc::new(Mutex::new(vec![cancelled, served]));
        for key in [cancelled, served] {
            jobs_tx
                .send(UploadJob {
                    key,
                    requester: "10.0.0.1:1".parse().expect("addr"),
                    sender: peer_tx.clone(),
                    wanted: wanted.clone(),
                })
                .expect("queue");
        }

        // Nothing is served while paused, the cancel lands in the meantime
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer_rx.try_recv().is_err());
        wanted.lock().await.retain(|key| key != &cancelled);
        paused_tx.send(false).expect("uploader is running");

        let message = peer_rx.recv().await.expect("piece message");
        assert_eq!(
            message,
            PeerMessage::Piece {
                index: 1,
                begin: 4,
                block: content[20..28].to_vec().into(),
            }
        );
        assert_eq!(metrics.uploaded_bytes(), 8);

        cancel_tx.send(()).expect("uploader is running");
        task.await.expect("uploader task");
        assert!(wanted.lock().await.is_empty());
        assert!(peer_rx.try_recv().is_err());
    }
}
