use bytes::Bytes;

/// Identifies a block by value. Used wherever a block has to be referenced from outside its piece,
/// e.g. in per-peer request lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub piece_index: u32,
    /// Offset within the piece
    pub begin: u32,
    pub length: u32,
}

impl BlockKey {
    pub fn new(piece_index: u32, begin: u32, length: u32) -> Self {
        BlockKey {
            piece_index,
            begin,
            length,
        }
    }

    /// Whether both keys point to the same place in the torrent, ignoring the length
    pub fn same_position(&self, piece_index: u32, begin: u32) -> bool {
        self.piece_index == piece_index && self.begin == begin
    }
}

/// A sub-segment of a piece, the unit of a wire-level request. Complete iff it holds a payload of
/// exactly `key.length` bytes.
#[derive(Debug, Clone)]
pub struct Block {
    key: BlockKey,
    data: Option<Bytes>,
}

impl Block {
    pub fn new(key: BlockKey) -> Self {
        Block { key, data: None }
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn begin(&self) -> u32 {
        self.key.begin
    }

    pub fn length(&self) -> u32 {
        self.key.length
    }

    pub fn is_complete(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// Stores the payload. Refuses a payload of the wrong size and never overwrites a filled block.
    pub(crate) fn fill(&mut self, data: Bytes) -> bool {
        if self.is_complete() || data.len() != self.key.length as usize {
            return false;
        }

        self.data = Some(data);
        true
    }

    pub(crate) fn clear(&mut self) {
        self.data = None;
    }
}
