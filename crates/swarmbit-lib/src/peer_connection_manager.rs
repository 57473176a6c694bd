use std::collections::HashSet;
use std::net::SocketAddrV4;

use anyhow::Context as _;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::instrument;

use crate::peer::{handle_peer, PeerEvent, PeerSettings};

/// Turns candidate addresses into running peer tasks
#[derive(Debug)]
pub(crate) struct PeerConnectionManager {
    number_of_peers: usize,
    max_peers: usize,
    peer_handler_tasks: JoinSet<anyhow::Result<()>>,
    cancel_rx: oneshot::Receiver<()>,
    peer_queue_rx: mpsc::Receiver<SocketAddrV4>,
    peer_event_tx: mpsc::UnboundedSender<PeerEvent>,
    settings: PeerSettings,
    /// Every address that was ever handed to a peer task. A peer is never retried once its task
    /// exits, failed handshakes are final for the session.
    known_peers: HashSet<SocketAddrV4>,
}

impl PeerConnectionManager {
    pub fn new(
        settings: PeerSettings,
        max_peers: usize,
        self_addr: Option<SocketAddrV4>,
        peer_queue_rx: mpsc::Receiver<SocketAddrV4>,
        peer_event_tx: mpsc::UnboundedSender<PeerEvent>,
        cancel_rx: oneshot::Receiver<()>,
    ) -> Self {
        PeerConnectionManager {
            number_of_peers: 0,
            max_peers: max_peers.max(1),
            peer_handler_tasks: JoinSet::new(),
            cancel_rx,
            peer_queue_rx,
            peer_event_tx,
            settings,
            known_peers: self_addr.into_iter().collect(),
        }
    }

    #[instrument(level = "error", err(level = "debug"), skip_all)]
    pub async fn handle(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                Some(next_peer) = self.peer_queue_rx.recv(), if self.number_of_peers < self.max_peers => {
                    if !self.known_peers.insert(next_peer) {
                        tracing::trace!(peer_addr = %next_peer, "skipping a known peer");
                        continue;
                    }
                    self.spawn_peer(next_peer);
                },
                Some(peer_handler_result) = self.peer_handler_tasks.join_next() => {
                    self.number_of_peers -= 1;
                    if let Err(e) = peer_handler_result.context("peer handler task")? {
                        tracing::debug!("an error happened in a peer: {:#}", e);
                    }
                }
                _ = &mut self.cancel_rx => {
                    tracing::debug!("cancellation requested, aborting peer tasks");
                    self.peer_handler_tasks.abort_all();
                    // Wait for all tasks to exit
                    while self.peer_handler_tasks.join_next().await.is_some() {}
                    tracing::debug!("all peers were aborted successfully, shutting down the manager");
                    break;
                }
                else => {
                    tracing::debug!("peer queue sender and all peers exited, shutting down the peer manager");
                    break;
                }
            }
        }

        Ok(())
    }

    fn spawn_peer(&mut self, peer_addr: SocketAddrV4) {
        self.number_of_peers += 1;
        self.peer_handler_tasks
            .spawn(handle_peer(peer_addr, self.settings.clone(), self.peer_event_tx.clone()));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    fn settings() -> PeerSettings {
        PeerSettings {
            info_hash: [0; 20],
            peer_id: [1; 20],
            connect_timeout: Duration::from_millis(200),
            connect_attempts: 1,
            keep_alive_interval: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn skips_self_and_duplicates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = match listener.local_addr().expect("local addr") {
            std::net::SocketAddr::V4(addr) => addr,
            addr => panic!("unexpected address: {}", addr),
        };
        let self_addr: SocketAddrV4 = "127.0.0.1:1".parse().expect("valid address");

        let (queue_tx, queue_rx) = mpsc::channel(8);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let manager = PeerConnectionManager::new(settings(), 4, Some(self_addr), queue_rx, events_tx, cancel_rx);
        let manager = tokio::spawn(manager.handle());

        queue_tx.send(self_addr).await.expect("queue");
        queue_tx.send(addr).await.expect("queue");
        queue_tx.send(addr).await.expect("queue");

        // Exactly one connection attempt reaches the listener
        let (_socket, _) = listener.accept().await.expect("accept");
        assert!(tokio::time::timeout(Duration::from_millis(300), listener.accept())
            .await
            .is_err());

        cancel_tx.send(()).expect("manager is running");
        manager.await.expect("manager task").expect("clean shutdown");
    }
}
