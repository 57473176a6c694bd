mod block;
mod piece;

pub use block::{Block, BlockKey};
use bitvec::bitvec;
use bitvec::order::Msb0;
use bitvec::slice::BitSlice;
use bitvec::vec::BitVec;
use bytes::Bytes;
pub use piece::Piece;
use tokio::sync::mpsc;

use crate::descriptor::TorrentDescriptor;
use crate::error::{Error, Result};

/// A piece whose hash matched, on its way to the disk writer
#[derive(Debug)]
pub struct VerifiedPiece {
    pub index: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Not all blocks are there yet
    Incomplete,
    /// Already verified earlier
    AlreadyDownloaded,
    Verified,
    /// Hash mismatch, the piece was cleared
    Corrupted,
}

/// Owns the piece/block table of a torrent and the `downloaded` bit of every piece
#[derive(Debug)]
pub struct PieceStore {
    pieces: Vec<Piece>,
    piece_hashes: Vec<[u8; 20]>,
    downloaded_pieces: BitVec<u8, Msb0>,
    block_size: u32,
    /// Queue of the disk writer. `None` once the store stopped handing out pieces.
    piece_tx: Option<mpsc::Sender<VerifiedPiece>>,
}

impl PieceStore {
    pub fn new(
        piece_length: u32,
        final_piece_length: u32,
        number_of_pieces: usize,
        block_size: u32,
        piece_hashes: Vec<[u8; 20]>,
        piece_tx: mpsc::Sender<VerifiedPiece>,
    ) -> Result<Self> {
        if piece_hashes.len() != number_of_pieces || number_of_pieces == 0 {
            return Err(Error::InvalidDescriptor(format!(
                "expected {} piece hashes, got {}",
                number_of_pieces,
                piece_hashes.len()
            )));
        }

        let number_of_pieces = try_into!(number_of_pieces, u32).map_err(|_| {
            Error::InvalidDescriptor(format!("too many pieces: {}", number_of_pieces))
        })?;
        let pieces = (0..number_of_pieces)
            .map(|idx| {
                let length = if idx + 1 == number_of_pieces {
                    final_piece_length
                } else {
                    piece_length
                };
                Piece::new(idx, length, block_size)
            })
            .collect::<Vec<_>>();

        Ok(PieceStore {
            downloaded_pieces: bitvec![u8, Msb0; 0; pieces.len()],
            pieces,
            piece_hashes,
            block_size,
            piece_tx: Some(piece_tx),
        })
    }

    pub fn from_descriptor(
        descriptor: &TorrentDescriptor,
        block_size: u32,
        piece_tx: mpsc::Sender<VerifiedPiece>,
    ) -> Result<Self> {
        PieceStore::new(
            descriptor.piece_length(),
            descriptor.final_piece_length(),
            descriptor.number_of_pieces(),
            block_size,
            descriptor.piece_hashes().to_vec(),
            piece_tx,
        )
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn piece(&self, piece_index: u32) -> Option<&Piece> {
        self.pieces.get(piece_index as usize)
    }

    pub fn number_of_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Used both as the completion gate and as the payload of outgoing `Bitfield` messages
    pub fn downloaded_pieces(&self) -> &BitSlice<u8, Msb0> {
        &self.downloaded_pieces
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded_pieces.all()
    }

    /// A piece needs no more blocks if it was verified or all its blocks are present
    pub fn is_piece_done(&self, piece_index: u32) -> bool {
        let idx = piece_index as usize;
        self.downloaded_pieces.get(idx).is_some_and(|bit| *bit)
            || self.pieces.get(idx).is_some_and(Piece::is_complete)
    }

    /// Marks a piece that is already on disk, e.g. after the startup check
    pub fn mark_downloaded(&mut self, piece_index: u32) -> Result<()> {
        let number_of_pieces = self.number_of_pieces();
        let piece = self
            .pieces
            .get_mut(piece_index as usize)
            .ok_or(Error::WrongPieceIndex(piece_index, number_of_pieces))?;
        piece.clear();
        self.downloaded_pieces.set(piece_index as usize, true);
        Ok(())
    }

    /// Fills the block starting exactly at `begin`. Anything that doesn't match a missing block is
    /// silently ignored.
    pub fn write_block(&mut self, piece_index: u32, begin: u32, data: Bytes) -> bool {
        if self.is_piece_done(piece_index) {
            return false;
        }

        self.pieces
            .get_mut(piece_index as usize)
            .is_some_and(|piece| piece.write_block(begin, data))
    }

    /// Checks a complete piece against its expected hash. A good piece is queued for the disk writer
    /// and marked as downloaded, a bad one is cleared so that it gets requested again.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn verify_and_handle(&mut self, piece_index: u32) -> anyhow::Result<Verification> {
        let idx = piece_index as usize;
        let number_of_pieces = self.number_of_pieces();

        if self.downloaded_pieces.get(idx).is_some_and(|bit| *bit) {
            return Ok(Verification::AlreadyDownloaded);
        }

        let (piece, expected_hash) = self
            .pieces
            .get_mut(idx)
            .zip(self.piece_hashes.get(idx))
            .ok_or(Error::WrongPieceIndex(piece_index, number_of_pieces))?;

        if !piece.is_complete() {
            return Ok(Verification::Incomplete);
        }

        if &piece.content_hash() != expected_hash {
            tracing::warn!(piece_index, "piece hash mismatch, discarding the piece");
            piece.clear();
            return Ok(Verification::Corrupted);
        }

        let verified = VerifiedPiece {
            index: piece_index,
            data: piece.data(),
        };
        // The `downloaded` bit represents the piece from now on
        piece.clear();
        self.downloaded_pieces.set(idx, true);

        let piece_tx = self
            .piece_tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("piece queue is already closed"))?;
        piece_tx
            .send(verified)
            .await
            .map_err(|_| anyhow::anyhow!("disk writer exited before the piece {} was queued", piece_index))?;

        Ok(Verification::Verified)
    }

    /// Stops handing out pieces so that the disk writer can drain its queue and exit
    pub fn close_queue(&mut self) {
        self.piece_tx = None;
    }
}
