use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::block::{Block, BlockKey};

#[derive(Debug, Clone)]
pub struct Piece {
    index: u32,
    length: u32,
    blocks: Vec<Block>,
}

impl Piece {
    /// Tiles `[0, length)` with blocks of `block_size` bytes, the last one taking the remainder
    pub fn new(index: u32, length: u32, block_size: u32) -> Self {
        let mut blocks = Vec::with_capacity(length.div_ceil(block_size) as usize);
        let mut begin = 0;
        while begin < length {
            let block_length = block_size.min(length - begin);
            blocks.push(Block::new(BlockKey::new(index, begin, block_length)));
            begin += block_length;
        }

        Piece { index, length, blocks }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_at(&self, begin: u32) -> Option<&Block> {
        self.blocks.iter().find(|block| block.begin() == begin)
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(Block::is_complete)
    }

    pub fn is_in_progress(&self) -> bool {
        let completed = self.blocks.iter().filter(|block| block.is_complete()).count();
        completed > 0 && completed < self.blocks.len()
    }

    /// Concatenated payloads of the filled blocks
    pub fn data(&self) -> Bytes {
        let mut data = BytesMut::with_capacity(self.length as usize);
        self.blocks
            .iter()
            .filter_map(Block::data)
            .for_each(|block| data.extend_from_slice(block));
        data.freeze()
    }

    pub fn content_hash(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        self.blocks
            .iter()
            .filter_map(Block::data)
            .for_each(|block| hasher.update(block));
        hasher.finalize().into()
    }

    /// Fills the block starting exactly at `begin`. Returns `false` if there is no such block,
    /// the block is already filled or the size doesn't match.
    pub(crate) fn write_block(&mut self, begin: u32, data: Bytes) -> bool {
        self.blocks
            .iter_mut()
            .find(|block| block.begin() == begin)
            .is_some_and(|block| block.fill(data))
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.iter_mut().for_each(Block::clear);
    }
}
