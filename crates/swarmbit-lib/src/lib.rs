#[macro_use]
mod macros;

pub mod config;
pub mod descriptor;
pub mod error;
pub mod peer;
pub mod pieces;
pub mod stats;
pub mod storage;
pub mod util;

mod buffer;
mod peer_connection_manager;
mod state;

use std::future::Future;
use std::time::Duration;

pub use config::SessionConfig;
pub use descriptor::{FileEntry, TorrentDescriptor};
pub use error::{Error, Result};
pub use peer::PeerLink;
pub use pieces::{Block, BlockKey, Piece, PieceStore};
pub use state::{
    BlockRequester, DownloadSession, SessionHandle, SessionState, TickOutcome, TorrentSession, UploadJob,
};
pub use stats::{Progress, ProgressObserver, SessionMetrics};
pub use storage::{DiskMapper, FileInfo, FileSection, PieceHashVerifier, RetryPolicy};

/// Size of the blocks we request and serve
pub const DEFAULT_BLOCK_SIZE: u32 = 16_384;

pub trait WithTimeout<T, E> {
    fn with_timeout(
        self,
        name: &'static str,
        timeout: Duration,
    ) -> impl std::future::Future<Output = anyhow::Result<T>> + Send
    where
        Self: Future<Output = std::result::Result<T, E>>;
}

impl<F, T, E> WithTimeout<T, E> for F
where
    F: Future<Output = std::result::Result<T, E>> + Send,
    anyhow::Error: From<E>,
{
    async fn with_timeout(self, name: &'static str, timeout: Duration) -> anyhow::Result<T> {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => Ok(result?),
            Err(elapsed) => {
                anyhow::bail!("'{}' task timed out: {}", name, elapsed);
            }
        }
    }
}

pub trait Elapsed<T> {
    fn with_elapsed(
        self,
        name: &'static str,
        threshold: Option<Duration>,
    ) -> impl std::future::Future<Output = T> + Send
    where
        Self: Future<Output = T>;
}

impl<F, T> Elapsed<T> for F
where
    F: Future<Output = T> + Send,
{
    async fn with_elapsed(self, name: &'static str, expected: Option<Duration>) -> T
    where
        Self: Future<Output = T>,
    {
        let start = std::time::Instant::now();
        let result = self.await;

        let elapsed = start.elapsed();
        match expected {
            Some(expected) if elapsed > expected => {
                tracing::debug!(?expected, ?elapsed, "'{}' task took more time than expected", name);
            }
            _ => tracing::debug!("'{}' task took {:?}", name, elapsed),
        }

        result
    }
}
