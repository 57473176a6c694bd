use anyhow::Context;
use bittorrent_peer_protocol::{Decode, Frame, Handshake};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

/// Accumulates bytes read from a peer until a whole handshake or frame is available.
///
/// Reading is cancel-safe: a read future that gets dropped never loses bytes.
pub struct ReadBuf {
    inner: Vec<u8>,
    // Filled bytes
    offset: usize,
    // Already processed bytes (i.e. decoded)
    processed: usize,
    // Consecutive reads that returned nothing
    empty_reads: u8,
}

impl ReadBuf {
    const DEFAULT_BUFFER_CAPACITY: usize = 16_384 * 2;
    const MAX_EMPTY_READS: u8 = 3;

    pub fn new() -> Self {
        ReadBuf {
            inner: vec![0; ReadBuf::DEFAULT_BUFFER_CAPACITY],
            offset: 0,
            processed: 0,
            empty_reads: 0,
        }
    }

    #[tracing::instrument(level = "error", err(level = "debug"), skip_all)]
    pub async fn read_handshake<R>(&mut self, stream: &mut R) -> anyhow::Result<Handshake>
    where
        R: AsyncRead + Unpin,
    {
        self.reset_processed();
        while self.offset < Handshake::LENGTH {
            self.fill(stream).await.context("reading handshake message")?;
        }

        let handshake = Handshake::decode(&self.inner[..Handshake::LENGTH]).context("decoding handshake")?;
        self.processed = Handshake::LENGTH;

        Ok(handshake)
    }

    #[tracing::instrument(level = "error", err(level = "debug"), skip_all)]
    pub async fn read_frame<R>(&mut self, stream: &mut R) -> anyhow::Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        self.reset_processed();
        loop {
            if self.offset >= Frame::LENGTH_PREFIX {
                let prefix = try_into!(&self.inner[..Frame::LENGTH_PREFIX], [u8; 4])?;
                let frame_length = Frame::LENGTH_PREFIX + Frame::length_from_prefix(prefix)?;

                if self.offset >= frame_length {
                    let frame = Frame::decode(&self.inner[..frame_length]).context("decoding received frame")?;
                    self.processed = frame_length;
                    return Ok(frame);
                }

                // Account for large messages (e.g. a huge bitfield)
                if frame_length > self.inner.len() {
                    tracing::trace!("resizing the buffer: {} -> {}", self.inner.len(), frame_length);
                    self.inner.resize(frame_length, 0);
                }
            }

            self.fill(stream).await.context("reading message")?;
        }
    }

    /// Performs a single read into the free part of the buffer
    async fn fill<R>(&mut self, stream: &mut R) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        if self.offset == self.inner.len() {
            self.inner.resize(self.inner.len() * 2, 0);
        }

        let read = stream.read(&mut self.inner[self.offset..]).await?;
        if read == 0 {
            self.empty_reads += 1;
            if self.empty_reads >= ReadBuf::MAX_EMPTY_READS {
                return Err(Error::ConnectionClosed.into());
            }
        } else {
            self.empty_reads = 0;
            self.offset += read;
        }

        Ok(())
    }

    fn reset_processed(&mut self) {
        if self.processed > 0 {
            if self.offset > self.processed {
                self.inner.copy_within(self.processed..self.offset, 0);
            }
            self.offset -= self.processed;
            self.processed = 0;
        }
    }
}

impl Default for ReadBuf {
    fn default() -> Self {
        ReadBuf::new()
    }
}
