use std::net::SocketAddrV4;

use bittorrent_peer_protocol::PeerMessage;

use crate::peer::PeerLink;
use crate::pieces::{BlockKey, PieceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every piece is downloaded, nothing left to request
    Downloaded,
    Paused,
    /// Too many requests are in flight, wait for some answers first
    Saturated,
    Requested(BlockKey, SocketAddrV4),
    /// No peer can give us anything right now
    Idle,
}

/// Walks the piece table with a `(piece, block)` cursor and picks the next block to request
#[derive(Debug)]
pub struct BlockRequester {
    piece_cursor: usize,
    block_cursor: usize,
    in_flight: usize,
    max_in_flight: usize,
    paused: bool,
}

impl BlockRequester {
    pub fn new(max_in_flight: usize) -> Self {
        BlockRequester {
            piece_cursor: 0,
            block_cursor: 0,
            in_flight: 0,
            max_in_flight: max_in_flight.max(1),
            paused: false,
        }
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.piece_cursor, self.block_cursor)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Forgets `count` answered, cancelled or abandoned requests
    pub fn release(&mut self, count: usize) {
        self.in_flight = self.in_flight.saturating_sub(count);
    }

    /// One step of the pacing loop: requests at most one block
    pub fn tick(&mut self, store: &PieceStore, peers: &mut [PeerLink]) -> TickOutcome {
        if self.paused {
            return TickOutcome::Paused;
        }
        if store.is_downloaded() {
            return TickOutcome::Downloaded;
        }
        if self.in_flight >= self.max_in_flight {
            return TickOutcome::Saturated;
        }

        let Some((key, peer_idx)) = self.next_block(store, peers) else {
            return TickOutcome::Idle;
        };

        let peer = &mut peers[peer_idx];
        if !peer.send(PeerMessage::Request {
            index: key.piece_index,
            begin: key.begin,
            length: key.length,
        }) {
            return TickOutcome::Idle;
        }

        tracing::trace!(peer_addr = %peer.addr(), piece_index = key.piece_index, begin = key.begin, "requested a block");
        peer.blocks_requested_from_peer.push(key);
        self.in_flight += 1;

        TickOutcome::Requested(key, peer.addr())
    }

    /// Finds the next missing block starting at the cursor together with the index of the peer to
    /// ask. Only the first peer that can serve the current piece is considered. Exhausting the
    /// table resets the cursor to the start.
    pub fn next_block(&mut self, store: &PieceStore, peers: &[PeerLink]) -> Option<(BlockKey, usize)> {
        let pieces = store.pieces();
        while let Some(piece) = pieces.get(self.piece_cursor) {
            if !store.is_piece_done(piece.index()) {
                if let Some(peer_idx) = peers.iter().position(|peer| peer.can_download(piece.index())) {
                    let peer = &peers[peer_idx];
                    while let Some(block) = piece.blocks().get(self.block_cursor) {
                        self.block_cursor += 1;
                        if !block.is_complete() && !peer.has_outstanding_request(&block.key()) {
                            return Some((block.key(), peer_idx));
                        }
                    }
                }
            }

            self.piece_cursor += 1;
            self.block_cursor = 0;
        }

        self.piece_cursor = 0;
        self.block_cursor = 0;
        None
    }
}
