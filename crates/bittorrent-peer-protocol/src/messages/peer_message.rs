use crate::{Encode, Error, Result};
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    /// BEP-10 extension protocol. Recognized so that it can be skipped.
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            20 => Self::Extended,
            _ => return Err(Error::UnknownMessageId(value)),
        })
    }
}

/// Represents all `Peer Wire Protocol` messages that this client acts upon
/// [Source](https://wiki.theory.org/BitTorrentSpecification#Messages)
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// When a peer chokes the client, it is a notification that no requests will be answered until the client is unchoked.
    /// The client should not attempt to send requests for blocks, and it should consider all pending (unanswered) requests
    /// to be discarded by the remote peer.
    Choke,
    Unchoke,
    /// This message is a notification that the remote peer will begin requesting blocks when the client unchokes them.
    Interested,
    NotInterested,
    /// The payload is the zero-based index of a piece that has just been successfully downloaded and verified via the hash.
    Have(u32),
    /// The payload is a bitfield representing the pieces that have been successfully downloaded.
    /// The high bit in the first byte corresponds to piece index 0.
    /// Spare bits at the end are set to zero.
    Bitfield(BitVec<u8, Msb0>),
    /// index: integer specifying the zero-based piece index
    /// begin: integer specifying the zero-based byte offset within the piece
    /// length: integer specifying the requested length.
    Request { index: u32, begin: u32, length: u32 },
    /// A single block of data, which is a subset of the piece specified by index.
    Piece { index: u32, begin: u32, block: Bytes },
    /// Used to cancel block requests. The payload is identical to that of the [PeerMessage::Request] message.
    Cancel { index: u32, begin: u32, length: u32 },
}

impl PeerMessage {
    pub fn message_id(&self) -> MessageId {
        use PeerMessage::*;

        match self {
            Choke => MessageId::Choke,
            Unchoke => MessageId::Unchoke,
            Interested => MessageId::Interested,
            NotInterested => MessageId::NotInterested,
            Have(_) => MessageId::Have,
            Bitfield(_) => MessageId::Bitfield,
            Request { .. } => MessageId::Request,
            Piece { .. } => MessageId::Piece,
            Cancel { .. } => MessageId::Cancel,
        }
    }

    /// Value of the length prefix: message id plus payload
    pub fn length(&self) -> usize {
        use PeerMessage::*;

        match self {
            Choke | Unchoke | Interested | NotInterested => 1,
            Have(_) => 5,
            Bitfield(bitfield) => 1 + bitfield.as_raw_slice().len(),
            Request { .. } | Cancel { .. } => 13,
            Piece { block, .. } => 9 + block.len(),
        }
    }

    /// Builds a typed message out of an already de-framed message id and its payload.
    ///
    /// Extension messages aren't represented here, see [crate::Frame].
    pub fn from_parts(message_id: u8, payload: &[u8]) -> Result<Self> {
        let message_id: MessageId = message_id.try_into()?;
        let mut src = Cursor::new(payload);

        Ok(match message_id {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested | MessageId::NotInterested => {
                check_exact_length!(payload.len(), 0);
                match message_id {
                    MessageId::Choke => Self::Choke,
                    MessageId::Unchoke => Self::Unchoke,
                    MessageId::Interested => Self::Interested,
                    _ => Self::NotInterested,
                }
            }
            MessageId::Have => {
                check_exact_length!(payload.len(), 4);
                Self::Have(src.get_u32())
            }
            MessageId::Bitfield => Self::Bitfield(BitVec::from_slice(payload)),
            MessageId::Request => {
                check_exact_length!(payload.len(), 12);
                Self::Request {
                    index: src.get_u32(),
                    begin: src.get_u32(),
                    length: src.get_u32(),
                }
            }
            MessageId::Piece => {
                check_length!(payload.len(), 8);
                let index = src.get_u32();
                let begin = src.get_u32();
                let block = Bytes::copy_from_slice(&payload[8..]);
                Self::Piece { index, begin, block }
            }
            MessageId::Cancel => {
                check_exact_length!(payload.len(), 12);
                Self::Cancel {
                    index: src.get_u32(),
                    begin: src.get_u32(),
                    length: src.get_u32(),
                }
            }
            MessageId::Extended => {
                return Err(Error::ConversionError("extension messages have no typed representation"))
            }
        })
    }
}

impl Encode for PeerMessage {
    async fn encode<T>(&self, dst: &mut T) -> Result<()>
    where
        T: AsyncWriteExt + Unpin,
    {
        use PeerMessage::*;

        let length = u32::try_from(self.length())
            .map_err(|_| Error::ConversionError("bittorrent message length doesn't fit in a u32"))?;

        let mut header = [0; 5];
        header[..4].copy_from_slice(&length.to_be_bytes());
        header[4] = self.message_id() as u8;
        dst.write_all(&header).await?;

        match self {
            // These message types have no payload
            Choke | Unchoke | Interested | NotInterested => {}
            Have(piece_idx) => {
                dst.write_all(&piece_idx.to_be_bytes()).await?;
            }
            Bitfield(bitfield) => {
                let mut raw = bitfield.as_raw_slice().to_vec();
                // Spare bits must be zero, and bitvec doesn't guarantee that for dead bits
                let spare_bits = raw.len() * 8 - bitfield.len();
                if let Some(last) = raw.last_mut() {
                    *last &= 0xFF << spare_bits;
                }
                dst.write_all(&raw).await?;
            }
            Request { index, begin, length } | Cancel { index, begin, length } => {
                let mut payload = [0; 12];
                payload[..4].copy_from_slice(&index.to_be_bytes());
                payload[4..8].copy_from_slice(&begin.to_be_bytes());
                payload[8..].copy_from_slice(&length.to_be_bytes());
                dst.write_all(&payload).await?;
            }
            Piece { index, begin, block } => {
                dst.write_all(&index.to_be_bytes()).await?;
                dst.write_all(&begin.to_be_bytes()).await?;
                dst.write_all(block).await?;
            }
        };

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bitvec::bitvec;

    use super::*;

    #[test]
    fn unknown_message_id() {
        assert!(matches!(PeerMessage::from_parts(9, &[0, 1]), Err(Error::UnknownMessageId(9))));
        assert!(matches!(PeerMessage::from_parts(42, &[]), Err(Error::UnknownMessageId(42))));
    }

    #[test]
    fn fixed_size_payloads_are_checked() {
        assert!(matches!(PeerMessage::from_parts(0, &[1]), Err(Error::BadLength(1, 0))));
        assert!(matches!(PeerMessage::from_parts(4, &[0, 0, 1]), Err(Error::BadLength(3, 4))));
        assert!(matches!(PeerMessage::from_parts(6, &[0; 13]), Err(Error::BadLength(13, 12))));
        assert!(matches!(PeerMessage::from_parts(8, &[0; 11]), Err(Error::BadLength(11, 12))));
        assert!(matches!(PeerMessage::from_parts(7, &[0; 7]), Err(Error::BadLength(7, 8))));
    }

    #[test]
    fn piece_with_empty_block() {
        let message = PeerMessage::from_parts(7, &[0, 0, 0, 3, 0, 0, 64, 0]).expect("valid piece");
        assert_eq!(
            message,
            PeerMessage::Piece {
                index: 3,
                begin: 16384,
                block: Bytes::new()
            }
        );
    }

    #[tokio::test]
    async fn bitfield_spare_bits_are_zeroed() {
        let mut bitfield: BitVec<u8, Msb0> = bitvec![u8, Msb0; 1; 16];
        bitfield.truncate(10);
        let mut buf = Vec::new();
        PeerMessage::Bitfield(bitfield).encode(&mut buf).await.expect("encode");

        assert_eq!(buf, vec![0, 0, 0, 3, 5, 0xFF, 0b1100_0000]);
    }
}
