mod connection;

use std::hash::{Hash, Hasher};
use std::net::SocketAddrV4;
use std::sync::Arc;

use bittorrent_peer_protocol::PeerMessage;
use bitvec::bitvec;
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
pub(crate) use connection::{handle_peer, PeerEvent, PeerSettings};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::pieces::BlockKey;

/// Blocks a remote peer asked us for and that we haven't served or seen cancelled yet. Shared with
/// the upload task.
pub type RequestedBlocks = Arc<Mutex<Vec<BlockKey>>>;

/// The session's end of a running peer task
#[derive(Debug)]
pub struct PeerHandle {
    outbound: mpsc::UnboundedSender<PeerMessage>,
    // Dropping it stops the peer task
    _cancellation: oneshot::Sender<()>,
}

impl PeerHandle {
    pub fn new(outbound: mpsc::UnboundedSender<PeerMessage>, cancellation: oneshot::Sender<()>) -> Self {
        PeerHandle {
            outbound,
            _cancellation: cancellation,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queues a message for the peer. Returns `false` if the peer task is already gone.
    pub fn send(&self, message: PeerMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// A cheap sender for tasks that need to talk to the peer without owning the handle
    pub fn sender(&self) -> mpsc::UnboundedSender<PeerMessage> {
        self.outbound.clone()
    }
}

/// Everything the session knows about one remote peer. Two links are the same peer iff their
/// addresses match, no matter what the protocol flags say.
#[derive(Debug)]
pub struct PeerLink {
    addr: SocketAddrV4,
    pub(crate) am_choking_it: bool,
    pub(crate) is_choking_me: bool,
    pub(crate) am_interested_in_it: bool,
    pub(crate) is_interested_in_me: bool,
    pub(crate) available_pieces: BitVec<u8, Msb0>,
    /// Blocks we asked this peer for that are still unanswered
    pub(crate) blocks_requested_from_peer: Vec<BlockKey>,
    pub(crate) blocks_requested_by_peer: RequestedBlocks,
    handle: Option<PeerHandle>,
}

impl PeerLink {
    pub fn new(addr: SocketAddrV4, number_of_pieces: usize, handle: Option<PeerHandle>) -> Self {
        PeerLink {
            addr,
            am_choking_it: true,
            is_choking_me: true,
            am_interested_in_it: false,
            is_interested_in_me: false,
            available_pieces: bitvec![u8, Msb0; 0; number_of_pieces],
            blocks_requested_from_peer: Vec::new(),
            blocks_requested_by_peer: Arc::new(Mutex::new(Vec::new())),
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    pub fn am_choking_it(&self) -> bool {
        self.am_choking_it
    }

    pub fn is_choking_me(&self) -> bool {
        self.is_choking_me
    }

    pub fn am_interested_in_it(&self) -> bool {
        self.am_interested_in_it
    }

    pub fn is_interested_in_me(&self) -> bool {
        self.is_interested_in_me
    }

    pub fn has_piece(&self, piece_index: u32) -> bool {
        self.available_pieces
            .get(piece_index as usize)
            .is_some_and(|bit| *bit)
    }

    pub fn is_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(PeerHandle::is_open)
    }

    /// Whether a block of `piece_index` may be requested from this peer right now
    pub fn can_download(&self, piece_index: u32) -> bool {
        self.is_connected() && !self.is_choking_me && self.am_interested_in_it && self.has_piece(piece_index)
    }

    pub fn has_outstanding_request(&self, key: &BlockKey) -> bool {
        self.blocks_requested_from_peer.contains(key)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.blocks_requested_from_peer.len()
    }

    pub(crate) fn handle(&self) -> Option<&PeerHandle> {
        self.handle.as_ref()
    }

    /// Queues a message for the peer. A closed or missing connection drops the message.
    pub(crate) fn send(&self, message: PeerMessage) -> bool {
        let sent = self.handle.as_ref().is_some_and(|handle| handle.send(message));
        if !sent {
            tracing::trace!(peer_addr = %self.addr, "dropping a message for a disconnected peer");
        }
        sent
    }

    /// Replaces the availability with a received bitfield. Spare bits are cut off and a short
    /// bitfield is padded with zeroes.
    pub(crate) fn set_available_pieces(&mut self, mut bitfield: BitVec<u8, Msb0>) {
        let number_of_pieces = self.available_pieces.len();
        bitfield.resize(number_of_pieces, false);
        self.available_pieces = bitfield;
    }

    pub(crate) fn add_available_piece(&mut self, piece_index: u32) {
        if let Some(mut bit) = self.available_pieces.get_mut(piece_index as usize) {
            *bit = true;
        }
    }

    /// Removes the outstanding request at `(piece_index, begin)`, if any
    pub(crate) fn take_request(&mut self, piece_index: u32, begin: u32) -> Option<BlockKey> {
        let position = self
            .blocks_requested_from_peer
            .iter()
            .position(|key| key.same_position(piece_index, begin))?;
        Some(self.blocks_requested_from_peer.swap_remove(position))
    }

    /// Drops the connection handle, which stops the peer task, and forgets all requests.
    /// Returns how many of our requests were still outstanding.
    pub(crate) async fn close(&mut self) -> usize {
        self.handle = None;
        let outstanding = self.blocks_requested_from_peer.len();
        self.blocks_requested_from_peer.clear();
        self.blocks_requested_by_peer.lock().await.clear();
        outstanding
    }
}

impl PartialEq for PeerLink {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for PeerLink {}

impl Hash for PeerLink {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}
