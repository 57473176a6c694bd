use tokio::sync::mpsc;

use super::DiskMapper;
use crate::error::Result;
use crate::pieces::VerifiedPiece;

/// Drains the queue of verified pieces into the files and reports every written piece back.
///
/// Exits once every sender of the queue is gone and all queued pieces are written. A piece that can't
/// be written ends the task with an error.
#[tracing::instrument(level = "debug", err, skip_all)]
pub(crate) async fn write_pieces(
    mapper: DiskMapper,
    mut rx: mpsc::Receiver<VerifiedPiece>,
    written_tx: mpsc::UnboundedSender<u32>,
) -> Result<()> {
    while let Some(VerifiedPiece { index, data }) = rx.recv().await {
        mapper.write(index, 0, &data).await.inspect_err(|e| {
            tracing::error!(piece_index = index, "failed to write a verified piece: {}", e);
        })?;

        tracing::trace!(piece_index = index, "piece written to disk");
        // The session may already be gone when we're draining the queue on shutdown
        let _ = written_tx.send(index);
    }

    tracing::debug!("piece queue closed, disk writer exiting");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::storage::{FileInfo, RetryPolicy};

    #[tokio::test]
    async fn drains_queue_before_exiting() {
        let temp = TempDir::new().expect("temp dir");
        let mapper = DiskMapper::new(
            vec![FileInfo::new(temp.path().join("data.bin"), 12)],
            4,
            RetryPolicy {
                read_attempts: 1,
                write_attempts: 1,
                backoff: Duration::ZERO,
            },
        );
        mapper.prepare().await.expect("prepare");

        let (tx, rx) = mpsc::channel(4);
        let (written_tx, mut written_rx) = mpsc::unbounded_channel();
        for index in [2u32, 0, 1] {
            let data = Bytes::from(vec![index as u8 + 1; 4]);
            tx.send(VerifiedPiece { index, data }).await.expect("queue");
        }
        // Closing the queue before the writer even starts must not lose anything
        drop(tx);

        write_pieces(mapper.clone(), rx, written_tx).await.expect("writer");

        let mut written = vec![];
        while let Some(index) = written_rx.recv().await {
            written.push(index);
        }
        assert_eq!(written, vec![2, 0, 1]);

        let content = tokio::fs::read(temp.path().join("data.bin")).await.expect("read");
        assert_eq!(content, vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
    }
}
