use std::net::SocketAddrV4;
use std::sync::Arc;

use bittorrent_peer_protocol::PeerMessage;
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::requester::{BlockRequester, TickOutcome};
use super::upload::UploadJob;
use crate::peer::PeerLink;
use crate::pieces::{PieceStore, Verification};
use crate::stats::SessionMetrics;

/// Piece table, peers and request bookkeeping of a session. Every incoming peer message goes
/// through [DownloadSession::handle_message], one at a time.
#[derive(Debug)]
pub struct DownloadSession {
    store: PieceStore,
    peers: Vec<PeerLink>,
    requester: BlockRequester,
    metrics: Arc<SessionMetrics>,
    upload_tx: mpsc::UnboundedSender<UploadJob>,
}

impl DownloadSession {
    pub fn new(
        store: PieceStore,
        requester: BlockRequester,
        metrics: Arc<SessionMetrics>,
        upload_tx: mpsc::UnboundedSender<UploadJob>,
    ) -> Self {
        DownloadSession {
            store,
            peers: Vec::new(),
            requester,
            metrics,
            upload_tx,
        }
    }

    pub fn store(&self) -> &PieceStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut PieceStore {
        &mut self.store
    }

    pub fn peers(&self) -> &[PeerLink] {
        &self.peers
    }

    pub fn peer(&self, addr: SocketAddrV4) -> Option<&PeerLink> {
        self.peers.iter().find(|peer| peer.addr() == addr)
    }

    pub fn requester(&self) -> &BlockRequester {
        &self.requester
    }

    pub fn is_downloaded(&self) -> bool {
        self.store.is_downloaded()
    }

    /// Registers a freshly connected peer. A peer with the same address is never added twice.
    pub fn add_peer(&mut self, peer: PeerLink) -> bool {
        if self.peers.contains(&peer) {
            return false;
        }
        self.peers.push(peer);
        self.metrics.set_connected_peers(self.peers.len());
        true
    }

    /// Closes and forgets a peer. Its unanswered requests stop counting as in flight.
    pub async fn remove_peer(&mut self, addr: SocketAddrV4) -> Option<PeerLink> {
        let position = self.peers.iter().position(|peer| peer.addr() == addr)?;
        let mut peer = self.peers.remove(position);
        let outstanding = peer.close().await;
        self.requester.release(outstanding);
        self.metrics.set_connected_peers(self.peers.len());
        Some(peer)
    }

    /// Handles the end of a peer task. A link whose connection is still open belongs to another
    /// task, e.g. a rejected duplicate connection exiting, and is kept.
    pub async fn peer_disconnected(&mut self, addr: SocketAddrV4) -> Option<PeerLink> {
        if self.peer(addr)?.is_connected() {
            return None;
        }
        self.remove_peer(addr).await
    }

    pub async fn close_all_peers(&mut self) {
        for mut peer in self.peers.drain(..) {
            let outstanding = peer.close().await;
            self.requester.release(outstanding);
        }
        self.metrics.set_connected_peers(0);
    }

    /// Sends a message to every connected peer
    pub fn broadcast(&self, message: PeerMessage) {
        for peer in self.peers.iter().filter(|peer| peer.is_connected()) {
            peer.send(message.clone());
        }
    }

    /// Tells every peer that we'll serve their requests from now on
    pub fn unchoke_all(&mut self) {
        for peer in self.peers.iter_mut() {
            if peer.am_choking_it && peer.send(PeerMessage::Unchoke) {
                peer.am_choking_it = false;
            }
        }
    }

    /// One pacing step
    pub fn request_next_block(&mut self) -> TickOutcome {
        self.requester.tick(&self.store, &mut self.peers)
    }

    pub fn pause(&mut self) {
        self.requester.set_paused(true);
        self.cancel_all_requests();
    }

    pub fn resume(&mut self) {
        self.requester.set_paused(false);
    }

    /// The only failure is the disk writer going away while a verified piece is being queued
    pub async fn handle_message(&mut self, sender: SocketAddrV4, message: PeerMessage) -> anyhow::Result<()> {
        // Borrows only the peer list, the store is still needed below
        let Some(peer) = self.peers.iter_mut().find(|peer| peer.addr() == sender) else {
            tracing::trace!(peer_addr = %sender, "message from an unknown peer");
            return Ok(());
        };

        match message {
            PeerMessage::Choke => peer.is_choking_me = true,
            PeerMessage::Unchoke => peer.is_choking_me = false,
            PeerMessage::Interested => {
                peer.is_interested_in_me = true;
                let bitfield: BitVec<u8, Msb0> = self.store.downloaded_pieces().to_bitvec();
                peer.send(PeerMessage::Bitfield(bitfield));
            }
            PeerMessage::NotInterested => peer.is_interested_in_me = false,
            PeerMessage::Have(piece_index) => peer.add_available_piece(piece_index),
            PeerMessage::Bitfield(bitfield) => peer.set_available_pieces(bitfield),
            PeerMessage::Request { index, begin, length } => self.handle_request(sender, index, begin, length).await,
            PeerMessage::Piece { index, begin, block } => self.handle_piece(sender, index, begin, block).await?,
            PeerMessage::Cancel { index, begin, .. } => self.handle_cancel(sender, index, begin).await,
        }

        Ok(())
    }

    #[tracing::instrument(level = "trace", err(level = "debug"), skip_all, fields(%sender, index = index, begin = begin, block_len = block.len()))]
    async fn handle_piece(&mut self, sender: SocketAddrV4, index: u32, begin: u32, block: Bytes) -> anyhow::Result<()> {
        if index as usize >= self.store.number_of_pieces() {
            tracing::debug!("block of a piece that doesn't exist");
            return Ok(());
        }
        if self.store.is_piece_done(index) {
            tracing::trace!("late block of a finished piece");
            return Ok(());
        }

        // Whoever else was asked for the same block doesn't need to send it anymore
        self.cancel_requests_to_other_peers(sender, index, begin);

        self.metrics.add_downloaded(block.len() as u64);
        if !self.store.write_block(index, begin, block) {
            tracing::trace!("block doesn't match any missing block");
            return Ok(());
        }

        match self.store.verify_and_handle(index).await? {
            Verification::Verified => {
                let piece_length = self.store.piece(index).map_or(0, |piece| piece.length());
                self.metrics.add_completed(piece_length as u64);
                tracing::debug!(piece_index = index, "piece verified");
            }
            Verification::Corrupted => {
                tracing::debug!(piece_index = index, "piece will be downloaded again");
            }
            Verification::Incomplete | Verification::AlreadyDownloaded => {}
        }

        Ok(())
    }

    async fn handle_request(&mut self, sender: SocketAddrV4, index: u32, begin: u32, length: u32) {
        let block_size = self.store.block_size();
        let Some(key) = self
            .store
            .piece(index)
            .and_then(|piece| piece.block_at(begin))
            .map(|block| block.key())
        else {
            tracing::debug!(peer_addr = %sender, index, begin, "request for a block that doesn't exist");
            return;
        };
        if length > block_size {
            tracing::debug!(peer_addr = %sender, length, "requested block is too large");
            return;
        }

        let Some(peer) = self.peer(sender) else {
            return;
        };
        if peer.am_choking_it {
            tracing::trace!(peer_addr = %sender, "ignoring a request from a choked peer");
            return;
        }
        let Some(handle) = peer.handle() else {
            return;
        };

        let wanted = peer.blocks_requested_by_peer.clone();
        {
            let mut requested = wanted.lock().await;
            if requested.contains(&key) {
                tracing::trace!(peer_addr = %sender, "block is already queued for this peer");
                return;
            }
            requested.push(key);
        }

        let job = UploadJob {
            key,
            requester: sender,
            sender: handle.sender(),
            wanted,
        };
        if self.upload_tx.send(job).is_err() {
            tracing::debug!("upload queue is closed, dropping a request");
        }
    }

    async fn handle_cancel(&mut self, sender: SocketAddrV4, index: u32, begin: u32) {
        let Some(peer) = self.peer(sender) else {
            return;
        };
        peer.blocks_requested_by_peer
            .lock()
            .await
            .retain(|key| !key.same_position(index, begin));
    }

    /// Drops every outstanding request for `(index, begin)`. Peers other than `sender` get a
    /// `Cancel`, and every dropped request stops counting as in flight.
    pub(crate) fn cancel_requests_to_other_peers(&mut self, sender: SocketAddrV4, index: u32, begin: u32) {
        let mut cancelled = 0;
        for peer in self.peers.iter_mut() {
            let Some(key) = peer.take_request(index, begin) else {
                continue;
            };
            cancelled += 1;

            if peer.addr() != sender {
                tracing::trace!(peer_addr = %peer.addr(), index, begin, "cancelling a duplicate request");
                peer.send(PeerMessage::Cancel {
                    index,
                    begin,
                    length: key.length,
                });
            }
        }

        self.requester.release(cancelled);
    }

    /// Cancels every outstanding request of every peer
    pub(crate) fn cancel_all_requests(&mut self) {
        let mut cancelled = 0;
        for peer in self.peers.iter_mut() {
            let requests = std::mem::take(&mut peer.blocks_requested_from_peer);
            cancelled += requests.len();
            for key in requests {
                peer.send(PeerMessage::Cancel {
                    index: key.piece_index,
                    begin: key.begin,
                    length: key.length,
                });
            }
        }

        self.requester.release(cancelled);
    }
}

#[cfg(test)]
mod tests {
    use bitvec::bitvec;
    use sha1::{Digest, Sha1};

    use super::*;
    use crate::peer::tests::connected_link;
    use crate::pieces::{BlockKey, VerifiedPiece};

    struct Fixture {
        session: DownloadSession,
        pieces_rx: mpsc::Receiver<VerifiedPiece>,
        upload_rx: mpsc::UnboundedReceiver<UploadJob>,
    }

    fn fixture(content: &[u8], piece_length: u32) -> Fixture {
        let hashes = content
            .chunks(piece_length as usize)
            .map(|piece| Sha1::digest(piece).into())
            .collect::<Vec<[u8; 20]>>();
        let final_piece_length = match content.len() as u32 % piece_length {
            0 => piece_length,
            remainder => remainder,
        };

        let (pieces_tx, pieces_rx) = mpsc::channel(8);
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        let store = PieceStore::new(piece_length, final_piece_length, hashes.len(), 16384, hashes, pieces_tx)
            .expect("valid store");
        let metrics = Arc::new(SessionMetrics::new(content.len() as u64));

        Fixture {
            session: DownloadSession::new(store, BlockRequester::new(2400), metrics, upload_tx),
            pieces_rx,
            upload_rx,
        }
    }

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([10, 0, 0, 1].into(), port)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerMessage>) -> Vec<PeerMessage> {
        let mut messages = vec![];
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn answered_block_cancels_the_duplicate_request() {
        let content = vec![3u8; 32768];
        let mut fixture = fixture(&content, 32768);
        let session = &mut fixture.session;

        let (first, mut first_rx, _c1) = connected_link(addr(1), 1);
        let (second, mut second_rx, _c2) = connected_link(addr(2), 1);
        assert!(session.add_peer(first));
        assert!(session.add_peer(second));
        for peer in [addr(1), addr(2)] {
            session.handle_message(peer, PeerMessage::Bitfield(bitvec![u8, Msb0; 1])).await.expect("bitfield");
            for link in session.peers.iter_mut().filter(|link| link.addr() == peer) {
                link.am_interested_in_it = true;
            }
        }

        // Only the second peer unchoked us so far and gets asked for the first block
        session.handle_message(addr(2), PeerMessage::Unchoke).await.expect("unchoke");
        assert_eq!(
            session.request_next_block(),
            TickOutcome::Requested(BlockKey::new(0, 0, 16384), addr(2))
        );
        // Then the first one takes over and the next pass asks it for the same block
        session.handle_message(addr(1), PeerMessage::Unchoke).await.expect("unchoke");
        assert_eq!(
            session.request_next_block(),
            TickOutcome::Requested(BlockKey::new(0, 16384, 16384), addr(1))
        );
        assert_eq!(session.request_next_block(), TickOutcome::Idle);
        assert_eq!(
            session.request_next_block(),
            TickOutcome::Requested(BlockKey::new(0, 0, 16384), addr(1))
        );
        assert_eq!(session.requester().in_flight(), 3);
        drain(&mut first_rx);
        drain(&mut second_rx);

        session
            .handle_message(
                addr(1),
                PeerMessage::Piece {
                    index: 0,
                    begin: 0,
                    block: Bytes::from(vec![3u8; 16384]),
                },
            )
            .await
            .expect("piece");

        // Both requests for the block are gone, only the other peer is told about it
        assert_eq!(session.requester().in_flight(), 1);
        assert_eq!(session.peer(addr(1)).expect("known peer").outstanding_requests(), 1);
        assert_eq!(session.peer(addr(2)).expect("known peer").outstanding_requests(), 0);
        assert!(drain(&mut first_rx).is_empty());
        assert_eq!(
            drain(&mut second_rx),
            vec![PeerMessage::Cancel {
                index: 0,
                begin: 0,
                length: 16384
            }]
        );
        assert!(session.store().pieces()[0].blocks()[0].is_complete());
    }

    #[tokio::test]
    async fn complete_piece_is_verified_and_queued() {
        let content = (0..20000u32).map(|i| (i % 13) as u8).collect::<Vec<_>>();
        let mut fixture = fixture(&content, 16384);
        let (peer, _rx, _cancel) = connected_link(addr(1), 2);
        fixture.session.add_peer(peer);

        fixture
            .session
            .handle_message(
                addr(1),
                PeerMessage::Piece {
                    index: 1,
                    begin: 0,
                    block: Bytes::copy_from_slice(&content[16384..]),
                },
            )
            .await
            .expect("piece");

        assert!(fixture.session.store().downloaded_pieces()[1]);
        let queued = fixture.pieces_rx.recv().await.expect("queued piece");
        assert_eq!(queued.index, 1);
        assert_eq!(fixture.session.metrics.completed_bytes(), 3616);

        // Out of range or late blocks are ignored
        for (index, begin) in [(7, 0), (1, 0)] {
            fixture
                .session
                .handle_message(
                    addr(1),
                    PeerMessage::Piece {
                        index,
                        begin,
                        block: Bytes::from(vec![0; 3616]),
                    },
                )
                .await
                .expect("ignored piece");
        }
        assert!(fixture.pieces_rx.try_recv().is_err());
        assert_eq!(fixture.session.metrics.downloaded_bytes(), 3616);
    }

    #[tokio::test]
    async fn corrupted_piece_is_requested_again() {
        let content = vec![1u8; 16384];
        let mut fixture = fixture(&content, 16384);
        let (peer, _rx, _cancel) = connected_link(addr(1), 1);
        fixture.session.add_peer(peer);

        fixture
            .session
            .handle_message(
                addr(1),
                PeerMessage::Piece {
                    index: 0,
                    begin: 0,
                    block: Bytes::from(vec![2u8; 16384]),
                },
            )
            .await
            .expect("piece");

        assert!(!fixture.session.store().downloaded_pieces()[0]);
        assert!(!fixture.session.store().pieces()[0].is_complete());
        assert!(fixture.pieces_rx.try_recv().is_err());
        assert_eq!(fixture.session.metrics.completed_bytes(), 0);
    }

    #[tokio::test]
    async fn interested_peer_gets_our_bitfield() {
        let content = vec![1u8; 16384 * 3];
        let mut fixture = fixture(&content, 16384);
        fixture.session.store_mut().mark_downloaded(1).expect("valid index");
        let (peer, mut rx, _cancel) = connected_link(addr(1), 3);
        fixture.session.add_peer(peer);

        fixture.session.handle_message(addr(1), PeerMessage::Interested).await.expect("interested");
        assert!(fixture.session.peer(addr(1)).expect("known peer").is_interested_in_me());
        assert_eq!(drain(&mut rx), vec![PeerMessage::Bitfield(bitvec![u8, Msb0; 0, 1, 0])]);

        fixture.session.handle_message(addr(1), PeerMessage::Have(2)).await.expect("have");
        fixture.session.handle_message(addr(1), PeerMessage::Choke).await.expect("choke");
        let peer = fixture.session.peer(addr(1)).expect("known peer");
        assert!(peer.has_piece(2) && !peer.has_piece(0));
        assert!(peer.is_choking_me());
    }

    #[tokio::test]
    async fn requests_are_queued_once_and_cancellable() {
        let content = vec![1u8; 20000];
        let mut fixture = fixture(&content, 16384);
        let (peer, _rx, _cancel) = connected_link(addr(1), 2);
        fixture.session.add_peer(peer);

        let request = PeerMessage::Request {
            index: 0,
            begin: 0,
            length: 16384,
        };

        // Choked peers get nothing
        fixture.session.handle_message(addr(1), request.clone()).await.expect("request");
        assert!(fixture.upload_rx.try_recv().is_err());

        fixture.session.unchoke_all();
        fixture.session.handle_message(addr(1), request.clone()).await.expect("request");
        fixture.session.handle_message(addr(1), request).await.expect("duplicate request");
        let job = fixture.upload_rx.try_recv().expect("queued job");
        assert_eq!(job.key, BlockKey::new(0, 0, 16384));
        assert_eq!(job.requester, addr(1));
        assert!(fixture.upload_rx.try_recv().is_err());

        // Invalid requests are dropped
        for (index, begin, length) in [(2, 0, 16384), (0, 100, 16384), (0, 0, 32768)] {
            fixture
                .session
                .handle_message(addr(1), PeerMessage::Request { index, begin, length })
                .await
                .expect("request");
        }
        assert!(fixture.upload_rx.try_recv().is_err());

        fixture
            .session
            .handle_message(
                addr(1),
                PeerMessage::Cancel {
                    index: 0,
                    begin: 0,
                    length: 16384,
                },
            )
            .await
            .expect("cancel");
        assert!(job.wanted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn pause_cancels_everything_in_flight() {
        let content = vec![1u8; 16384 * 4];
        let mut fixture = fixture(&content, 16384 * 4);
        let (mut peer, mut rx, _cancel) = connected_link(addr(1), 1);
        peer.set_available_pieces(bitvec![u8, Msb0; 1]);
        peer.is_choking_me = false;
        peer.am_interested_in_it = true;
        fixture.session.add_peer(peer);

        for _ in 0..3 {
            assert!(matches!(fixture.session.request_next_block(), TickOutcome::Requested(..)));
        }
        assert_eq!(drain(&mut rx).len(), 3);

        fixture.session.pause();
        assert_eq!(fixture.session.request_next_block(), TickOutcome::Paused);
        assert_eq!(fixture.session.requester().in_flight(), 0);
        let cancels = drain(&mut rx);
        assert_eq!(cancels.len(), 3);
        assert!(cancels.iter().all(|message| matches!(message, PeerMessage::Cancel { .. })));

        fixture.session.resume();
        assert!(matches!(fixture.session.request_next_block(), TickOutcome::Requested(..)));
    }

    #[tokio::test]
    async fn removed_peer_releases_its_requests() {
        let content = vec![1u8; 16384 * 2];
        let mut fixture = fixture(&content, 16384 * 2);
        let (mut peer, _rx, _cancel) = connected_link(addr(1), 1);
        peer.set_available_pieces(bitvec![u8, Msb0; 1]);
        peer.is_choking_me = false;
        peer.am_interested_in_it = true;
        assert!(fixture.session.add_peer(peer));
        assert!(!fixture.session.add_peer(PeerLink::new(addr(1), 1, None)));

        fixture.session.request_next_block();
        fixture.session.request_next_block();
        assert_eq!(fixture.session.requester().in_flight(), 2);

        let removed = fixture.session.remove_peer(addr(1)).await.expect("known peer");
        assert!(!removed.is_connected());
        assert_eq!(fixture.session.requester().in_flight(), 0);
        assert!(fixture.session.peers().is_empty());
        assert!(fixture.session.remove_peer(addr(1)).await.is_none());
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_the_live_link() {
        let content = vec![1u8; 16384];
        let mut fixture = fixture(&content, 16384);

        let (live, _live_rx, _live_cancel) = connected_link(addr(1), 1);
        let (duplicate, duplicate_rx, _duplicate_cancel) = connected_link(addr(1), 1);
        assert!(fixture.session.add_peer(live));
        assert!(!fixture.session.add_peer(duplicate));

        // The rejected connection's task winds down and reports the shared address
        drop(duplicate_rx);
        assert!(fixture.session.peer_disconnected(addr(1)).await.is_none());
        assert!(fixture.session.peer(addr(1)).is_some_and(PeerLink::is_connected));

        let (gone, gone_rx, _gone_cancel) = connected_link(addr(2), 1);
        assert!(fixture.session.add_peer(gone));
        drop(gone_rx);
        assert!(fixture.session.peer_disconnected(addr(2)).await.is_some());
        assert!(fixture.session.peer(addr(2)).is_none());
        assert!(fixture.session.peer_disconnected(addr(3)).await.is_none());
    }
}
