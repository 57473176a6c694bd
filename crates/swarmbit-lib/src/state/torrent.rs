use std::net::SocketAddrV4;
use std::sync::Arc;

use anyhow::Context;
use bittorrent_peer_protocol::PeerMessage;
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::download::DownloadSession;
use super::requester::BlockRequester;
use super::upload::{UploadJob, Uploader};
use crate::config::SessionConfig;
use crate::descriptor::TorrentDescriptor;
use crate::peer::{PeerEvent, PeerLink, PeerSettings};
use crate::peer_connection_manager::PeerConnectionManager;
use crate::pieces::PieceStore;
use crate::stats::{Progress, ProgressObserver, SessionMetrics, StatsRefresher};
use crate::storage::{write_pieces, DiskMapper, PieceHashVerifier};
use crate::{Elapsed, DEFAULT_BLOCK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Hashing whatever is already on disk
    Checking,
    Downloading,
    /// Every piece is on disk, only uploading from now on
    Seeding,
    Stopped,
}

#[derive(Debug)]
enum Command {
    PauseDownload,
    ResumeDownload,
    PauseUpload,
    ResumeUpload,
    Stop,
}

/// Control surface of a running session
#[derive(Debug)]
pub struct SessionHandle {
    commands_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionState>,
    progress_rx: watch::Receiver<Progress>,
    metrics: Arc<SessionMetrics>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl SessionHandle {
    pub fn pause_download(&self) {
        self.command(Command::PauseDownload);
    }

    pub fn resume_download(&self) {
        self.command(Command::ResumeDownload);
    }

    pub fn pause_upload(&self) {
        self.command(Command::PauseUpload);
    }

    pub fn resume_upload(&self) {
        self.command(Command::ResumeUpload);
    }

    /// Stops the session and waits until every verified piece is written. Calling it again is a no-op.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        self.command(Command::Stop);
        task.await.context("bug: session task panicked?")?
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Waits until the session reaches `state`. Returns the state it ended up in, which is
    /// [SessionState::Stopped] if the session stops first.
    pub async fn wait_for(&self, state: SessionState) -> SessionState {
        let mut state_rx = self.state_rx.clone();
        loop {
            let current = *state_rx.borrow_and_update();
            if current == state || current == SessionState::Stopped {
                return current;
            }
            if state_rx.changed().await.is_err() {
                return *state_rx.borrow();
            }
        }
    }

    /// The latest snapshot, refreshed every `metrics_interval`
    pub fn progress(&self) -> Progress {
        self.progress_rx.borrow().clone()
    }

    pub fn metrics(&self) -> Arc<SessionMetrics> {
        self.metrics.clone()
    }

    fn command(&self, command: Command) {
        if self.commands_tx.send(command).is_err() {
            tracing::debug!("session already stopped, ignoring a command");
        }
    }
}

/// Downloads a single torrent and seeds it afterwards
pub struct TorrentSession {
    descriptor: TorrentDescriptor,
    config: SessionConfig,
    mapper: DiskMapper,
    metrics: Arc<SessionMetrics>,
    state_tx: Arc<watch::Sender<SessionState>>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
}

impl TorrentSession {
    /// Spawns the session. Candidate peers are read from `peer_queue_rx` for as long as the session
    /// runs.
    pub fn start(
        descriptor: TorrentDescriptor,
        config: SessionConfig,
        peer_queue_rx: mpsc::Receiver<SocketAddrV4>,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> SessionHandle {
        let metrics = Arc::new(SessionMetrics::new(descriptor.total_length()));
        let (state_tx, state_rx) = watch::channel(SessionState::Checking);
        let (progress_tx, progress_rx) = watch::channel(Progress {
            total_bytes: descriptor.total_length(),
            ..Default::default()
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let session = TorrentSession {
            mapper: DiskMapper::from_descriptor(&descriptor, &config),
            descriptor,
            config,
            metrics: metrics.clone(),
            state_tx: Arc::new(state_tx),
            commands_rx,
        };
        let task = tokio::spawn(session.run(peer_queue_rx, observer, progress_tx));

        SessionHandle {
            commands_tx,
            state_rx,
            progress_rx,
            metrics,
            task: Some(task),
        }
    }

    #[tracing::instrument(level = "error", err(level = "error"), skip_all, fields(torrent = %self.descriptor.name()))]
    async fn run(
        mut self,
        peer_queue_rx: mpsc::Receiver<SocketAddrV4>,
        observer: Option<Arc<dyn ProgressObserver>>,
        progress_tx: watch::Sender<Progress>,
    ) -> anyhow::Result<()> {
        let result = self.download_and_seed(peer_queue_rx, observer, progress_tx).await;
        self.state_tx.send_replace(SessionState::Stopped);
        result
    }

    async fn download_and_seed(
        &mut self,
        peer_queue_rx: mpsc::Receiver<SocketAddrV4>,
        observer: Option<Arc<dyn ProgressObserver>>,
        progress_tx: watch::Sender<Progress>,
    ) -> anyhow::Result<()> {
        self.mapper.prepare().await.context("preparing files")?;

        let (piece_tx, piece_rx) = mpsc::channel(self.config.piece_queue_capacity.max(1));
        let mut store = PieceStore::from_descriptor(&self.descriptor, DEFAULT_BLOCK_SIZE, piece_tx)?;
        let on_disk = self.check_existing_pieces(&mut store).await?;

        let (written_tx, mut written_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_pieces(self.mapper.clone(), piece_rx, written_tx));

        let (peer_event_tx, mut peer_event_rx) = mpsc::unbounded_channel();
        let (manager_cancel_tx, manager_cancel_rx) = oneshot::channel();
        let settings = PeerSettings {
            info_hash: *self.descriptor.info_hash(),
            peer_id: self.config.peer_id,
            connect_timeout: self.config.connect_timeout,
            connect_attempts: self.config.connect_attempts,
            keep_alive_interval: self.config.keep_alive_interval,
        };
        let manager = tokio::spawn(
            PeerConnectionManager::new(
                settings,
                self.config.max_peers,
                self.config.self_addr,
                peer_queue_rx,
                peer_event_tx,
                manager_cancel_rx,
            )
            .handle(),
        );

        let (refresher_cancel_tx, refresher_cancel_rx) = oneshot::channel();
        let refresher = tokio::spawn(
            StatsRefresher::new(self.metrics.clone(), self.config.metrics_interval, observer, progress_tx)
                .handle(refresher_cancel_rx),
        );

        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        let (upload_paused_tx, upload_paused_rx) = watch::channel(false);
        let mut running = Running {
            download: DownloadSession::new(
                store,
                BlockRequester::new(self.config.max_in_flight_requests),
                self.metrics.clone(),
                upload_tx,
            ),
            mapper: self.mapper.clone(),
            metrics: self.metrics.clone(),
            state_tx: self.state_tx.clone(),
            written_pieces: on_disk,
            upload_rx: Some((upload_rx, upload_paused_rx)),
            upload_paused_tx,
            uploader: None,
        };

        if running.written_pieces.all() {
            tracing::info!("all pieces are already on disk");
            running.start_seeding();
        } else {
            self.state_tx.send_replace(SessionState::Downloading);
        }

        let outcome = self
            .event_loop(&mut running, &mut peer_event_rx, &mut written_rx)
            .await;

        tracing::debug!("shutting down the session");
        running.download.cancel_all_requests();
        running.download.close_all_peers().await;

        let _ = manager_cancel_tx.send(());
        match manager.await.context("bug: peer manager panicked?")? {
            Ok(()) => {}
            Err(e) => tracing::debug!("peer manager failed: {:#}", e),
        }

        if let Some((uploader, cancel_tx)) = running.uploader.take() {
            let _ = cancel_tx.send(());
            uploader.await.context("bug: uploader panicked?")?;
        }

        // The writer exits once everything that was queued is on disk
        running.download.store_mut().close_queue();
        drop(running);
        let written = writer.await.context("bug: disk writer panicked?")?;

        let _ = refresher_cancel_tx.send(());
        refresher.await.context("bug: stats refresher panicked?")?;

        match (outcome, written) {
            (_, Err(e)) => Err(e).context("disk writer failed"),
            (outcome, Ok(())) => outcome,
        }
    }

    /// Marks every piece whose data is already on disk. Returns the pieces that don't need to be
    /// written anymore.
    async fn check_existing_pieces(&self, store: &mut PieceStore) -> anyhow::Result<BitVec<u8, Msb0>> {
        let on_disk = PieceHashVerifier::new(
            self.mapper.clone(),
            self.descriptor.piece_length(),
            self.config.max_hashing_tasks,
        )
            .check_all_pieces(&self.descriptor)
            .with_elapsed("check_all_pieces", None)
            .await?;

        for piece_idx in on_disk.iter_ones() {
            let piece_idx = try_into!(piece_idx, u32)?;
            store.mark_downloaded(piece_idx)?;
            self.metrics
                .add_completed(self.descriptor.piece_size(piece_idx)? as u64);
        }

        tracing::info!(
            "{} out of {} pieces are already on disk",
            on_disk.count_ones(),
            on_disk.len()
        );

        Ok(on_disk)
    }

    async fn event_loop(
        &mut self,
        running: &mut Running,
        peer_event_rx: &mut mpsc::UnboundedReceiver<PeerEvent>,
        written_rx: &mut mpsc::UnboundedReceiver<u32>,
    ) -> anyhow::Result<()> {
        let mut pacing = time::interval(self.config.request_interval);
        pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands_rx.recv() => {
                    match command {
                        Some(Command::PauseDownload) => {
                            tracing::debug!("pausing the download");
                            running.download.pause();
                        }
                        Some(Command::ResumeDownload) => {
                            tracing::debug!("resuming the download");
                            running.download.resume();
                        }
                        Some(Command::PauseUpload) => {
                            running.upload_paused_tx.send_replace(true);
                        }
                        Some(Command::ResumeUpload) => {
                            running.upload_paused_tx.send_replace(false);
                        }
                        // A dropped handle can't stop the session anymore, so it stops right away
                        Some(Command::Stop) | None => break,
                    }
                }
                Some(event) = peer_event_rx.recv() => {
                    running.handle_peer_event(event).await?;
                }
                written = written_rx.recv() => {
                    let Some(piece_index) = written else {
                        anyhow::bail!("disk writer exited unexpectedly");
                    };
                    running.on_piece_written(piece_index);
                }
                _ = pacing.tick(), if running.state() == SessionState::Downloading => {
                    running.download.request_next_block();
                }
            }
        }

        Ok(())
    }
}

/// Everything the event loop works with after the startup check
struct Running {
    download: DownloadSession,
    mapper: DiskMapper,
    metrics: Arc<SessionMetrics>,
    state_tx: Arc<watch::Sender<SessionState>>,
    /// Pieces that are on disk, as opposed to just verified
    written_pieces: BitVec<u8, Msb0>,
    /// Kept until seeding starts
    upload_rx: Option<(mpsc::UnboundedReceiver<UploadJob>, watch::Receiver<bool>)>,
    upload_paused_tx: watch::Sender<bool>,
    uploader: Option<(JoinHandle<()>, oneshot::Sender<()>)>,
}

impl Running {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) -> anyhow::Result<()> {
        match event {
            PeerEvent::Connected(peer_addr, handle) => {
                let mut peer = PeerLink::new(peer_addr, self.download.store().number_of_pieces(), Some(handle));
                if self.state() == SessionState::Seeding {
                    peer.send(PeerMessage::Unchoke);
                    peer.am_choking_it = false;
                    peer.send(PeerMessage::Bitfield(self.download.store().downloaded_pieces().to_bitvec()));
                } else {
                    peer.send(PeerMessage::Interested);
                    peer.am_interested_in_it = true;
                }

                if self.download.add_peer(peer) {
                    tracing::debug!(%peer_addr, "new peer");
                } else {
                    tracing::debug!(%peer_addr, "dropping a duplicate connection");
                }
            }
            PeerEvent::Message(peer_addr, message) => {
                self.download.handle_message(peer_addr, message).await?;
            }
            PeerEvent::Disconnected(peer_addr) => {
                if self.download.peer_disconnected(peer_addr).await.is_some() {
                    tracing::debug!(%peer_addr, "peer disconnected");
                }
            }
        }

        Ok(())
    }

    fn on_piece_written(&mut self, piece_index: u32) {
        if let Some(mut bit) = self.written_pieces.get_mut(piece_index as usize) {
            *bit = true;
        }
        self.download.broadcast(PeerMessage::Have(piece_index));

        if self.written_pieces.all() && self.state() == SessionState::Downloading {
            tracing::info!("torrent downloaded");
            self.start_seeding();
        }
    }

    fn start_seeding(&mut self) {
        let Some((upload_rx, upload_paused_rx)) = self.upload_rx.take() else {
            return;
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let uploader = Uploader::new(self.mapper.clone(), self.metrics.clone(), upload_rx, upload_paused_rx);
        self.uploader = Some((tokio::spawn(uploader.handle(cancel_rx)), cancel_tx));

        self.state_tx.send_replace(SessionState::Seeding);
        self.download.unchoke_all();
    }
}
