use tokio::io::AsyncWriteExt;

use super::{MessageId, PeerMessage};
use crate::{Decode, Encode, Error, Result};

/// A single length-prefixed unit read from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A frame with the length prefix set to zero. There is no message ID and no payload.
    ///
    /// Peers may close a connection if they receive no messages for a certain period of time,
    /// which is generally **two minutes**.
    KeepAlive,
    /// A BEP-10 extension message. Its payload is discarded.
    Extended,
    Message(PeerMessage),
}

impl Frame {
    pub const LENGTH_PREFIX: usize = 4;
    /// The largest length prefix we agree to buffer. Big enough for a full 16 KiB piece message or
    /// a bitfield of a torrent with millions of pieces.
    pub const MAX_LENGTH: usize = 2 * 1024 * 1024;

    /// Parses a length prefix and checks it against [Frame::MAX_LENGTH]
    pub fn length_from_prefix(prefix: [u8; 4]) -> Result<usize> {
        let length = usize::try_from(u32::from_be_bytes(prefix))
            .map_err(|_| Error::ConversionError("frame length doesn't fit in a usize"))?;

        if length > Frame::MAX_LENGTH {
            return Err(Error::FrameTooLarge(length, Frame::MAX_LENGTH));
        }

        Ok(length)
    }
}

impl From<PeerMessage> for Frame {
    fn from(message: PeerMessage) -> Self {
        Frame::Message(message)
    }
}

impl Encode for Frame {
    async fn encode<T>(&self, dst: &mut T) -> Result<()>
    where
        T: AsyncWriteExt + Unpin,
    {
        match self {
            Frame::KeepAlive => dst.write_all(&0u32.to_be_bytes()).await?,
            Frame::Extended => {
                dst.write_all(&1u32.to_be_bytes()).await?;
                dst.write_all(&[MessageId::Extended as u8]).await?;
            }
            Frame::Message(message) => message.encode(dst).await?,
        }

        Ok(())
    }
}

impl<'a> Decode<'a> for Frame {
    /// Decodes exactly one frame. `src` must contain the length prefix and nothing past the frame's
    /// end.
    fn decode(src: &'a [u8]) -> Result<Self> {
        check_length!(src.len(), Frame::LENGTH_PREFIX);

        let mut prefix = [0; Frame::LENGTH_PREFIX];
        prefix.copy_from_slice(&src[..Frame::LENGTH_PREFIX]);
        let length = Frame::length_from_prefix(prefix)?;

        let body = &src[Frame::LENGTH_PREFIX..];
        check_exact_length!(body.len(), length);

        if length == 0 {
            return Ok(Frame::KeepAlive);
        }

        let (message_id, payload) = (body[0], &body[1..]);
        if message_id == MessageId::Extended as u8 {
            return Ok(Frame::Extended);
        }

        PeerMessage::from_parts(message_id, payload).map(Frame::Message)
    }
}
