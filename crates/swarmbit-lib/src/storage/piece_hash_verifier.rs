use anyhow::Context;
use bitvec::bitvec;
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use sha1::{Digest, Sha1};
use tokio::task::JoinSet;

use super::DiskMapper;
use crate::descriptor::TorrentDescriptor;

const MAX_VERIFICATION_MEMORY_USAGE_B: usize = 256_000_000;

/// Checks which pieces are already present on disk, so that an interrupted download can be resumed
pub struct PieceHashVerifier {
    mapper: DiskMapper,
    max_parallel_hashing_tasks: usize,
}

impl PieceHashVerifier {
    /// Hashes at most `max_tasks` pieces at once, fewer if that many pieces wouldn't fit in memory
    pub fn new(mapper: DiskMapper, piece_length: u32, max_tasks: usize) -> Self {
        let max_parallel_hashing_tasks = (MAX_VERIFICATION_MEMORY_USAGE_B / piece_length.max(1) as usize)
            .min(max_tasks)
            .max(1);

        PieceHashVerifier {
            mapper,
            max_parallel_hashing_tasks,
        }
    }

    /// Returns a bitfield with a bit set for every piece whose on-disk content matches its hash
    #[tracing::instrument(level = "debug", err, skip_all)]
    pub async fn check_all_pieces(&self, descriptor: &TorrentDescriptor) -> anyhow::Result<BitVec<u8, Msb0>> {
        let number_of_pieces = descriptor.number_of_pieces();
        let mut verified = bitvec![u8, Msb0; 0; number_of_pieces];

        let mut piece_hash_verification_tasks = JoinSet::new();
        let mut next_piece_idx = 0;
        loop {
            while piece_hash_verification_tasks.len() < self.max_parallel_hashing_tasks && next_piece_idx < number_of_pieces
            {
                let piece_idx = try_into!(next_piece_idx, u32)?;
                let expected_hash = descriptor.piece_hashes()[next_piece_idx];
                let piece_length = descriptor.piece_size(piece_idx)?;
                let mapper = self.mapper.clone();

                piece_hash_verification_tasks.spawn(async move {
                    let is_valid = match mapper.read(piece_idx, 0, piece_length).await {
                        Some(piece) => {
                            let calculated_hash: [u8; 20] = Sha1::digest(&piece).into();
                            calculated_hash == expected_hash
                        }
                        None => false,
                    };
                    (piece_idx, is_valid)
                });

                next_piece_idx += 1;
            }

            let Some(result) = piece_hash_verification_tasks.join_next().await else {
                break;
            };
            let (piece_idx, is_valid) = result.context("bug: piece hash verification task panicked?")?;
            verified.set(piece_idx as usize, is_valid);
        }

        tracing::debug!(
            verified = verified.count_ones(),
            total = number_of_pieces,
            "finished checking pieces on disk"
        );

        Ok(verified)
    }
}
