use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::Context;
use bittorrent_peer_protocol::{Encode, Frame, Handshake, PeerMessage};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use super::PeerHandle;
use crate::buffer::ReadBuf;
use crate::WithTimeout;

/// What peer tasks report to the session
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// Handshake succeeded, the peer is ready to exchange messages
    Connected(SocketAddrV4, PeerHandle),
    Message(SocketAddrV4, PeerMessage),
    /// Sent once after `Connected` when the connection is gone
    Disconnected(SocketAddrV4),
}

#[derive(Debug, Clone)]
pub(crate) struct PeerSettings {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub connect_timeout: Duration,
    pub connect_attempts: usize,
    pub keep_alive_interval: Duration,
}

/// Connects to a peer, performs the handshake and then shuttles messages between the socket and
/// the session until either side goes away.
#[tracing::instrument(level = "error", err(level = "debug"), skip_all, fields(%peer_addr))]
pub(crate) async fn handle_peer(
    peer_addr: SocketAddrV4,
    settings: PeerSettings,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> anyhow::Result<()> {
    let (stream, read_buf) = connect(peer_addr, &settings).await?;
    run_connected(peer_addr, stream, read_buf, settings.keep_alive_interval, events).await
}

/// Runs the message loop over an already handshaked stream
pub(crate) async fn run_connected<S>(
    peer_addr: SocketAddrV4,
    stream: S,
    mut read_buf: ReadBuf,
    keep_alive_interval: Duration,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (cancellation_tx, mut cancellation_rx) = oneshot::channel();
    if events
        .send(PeerEvent::Connected(peer_addr, PeerHandle::new(outbound_tx, cancellation_tx)))
        .is_err()
    {
        tracing::debug!("session is gone, dropping a fresh connection");
        return Ok(());
    }

    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut keep_alive = time::interval(keep_alive_interval);
    // Skip the first tick, as it completes immediately and we just opened a new connection
    keep_alive.tick().await;

    let mut output = Vec::with_capacity(1024);
    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                frame = read_buf.read_frame(&mut reader) => {
                    match frame.context("reading frame")? {
                        Frame::KeepAlive => tracing::trace!("keep-alive"),
                        Frame::Extended => tracing::trace!("skipping an extension message"),
                        Frame::Message(message) => {
                            if events.send(PeerEvent::Message(peer_addr, message)).is_err() {
                                tracing::debug!("session is gone, peer exiting");
                                break;
                            }
                        }
                    }
                }
                message = outbound_rx.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    message.encode(&mut output).await?;
                    // Drain whatever else is already queued to write it in one go
                    while let Ok(message) = outbound_rx.try_recv() {
                        message.encode(&mut output).await?;
                    }
                    writer.write_all(&output).await.context("writing to the stream")?;
                    output.clear();
                }
                _ = keep_alive.tick() => {
                    Frame::KeepAlive.encode(&mut writer).await.context("sending keep-alive")?;
                }
                _ = &mut cancellation_rx => {
                    tracing::trace!("cancellation requested, peer exiting");
                    break;
                }
            }
        }

        Ok(())
    }
    .await;

    // The link must look closed by the time the session hears about it
    drop(outbound_rx);
    let _ = events.send(PeerEvent::Disconnected(peer_addr));

    result
}

/// Opens a connection and exchanges handshakes, retrying a few times before giving up on the peer
async fn connect(peer_addr: SocketAddrV4, settings: &PeerSettings) -> anyhow::Result<(TcpStream, ReadBuf)> {
    let mut last_error = None;
    for attempt in 1..=settings.connect_attempts.max(1) {
        match try_connect(peer_addr, settings).await {
            Ok(connection) => return Ok(connection),
            Err(e) => {
                tracing::debug!(attempt, "failed to connect to a peer: {:#}", e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("no connection attempts were made"))
        .context("giving up on the peer"))
}

async fn try_connect(peer_addr: SocketAddrV4, settings: &PeerSettings) -> anyhow::Result<(TcpStream, ReadBuf)> {
    let mut stream = TcpStream::connect(peer_addr)
        .with_timeout("peer connect", settings.connect_timeout)
        .await
        .context("establishing connection with a peer")?;

    tracing::trace!("connected to a peer");

    Handshake::new(settings.info_hash, settings.peer_id)
        .encode(&mut stream)
        .await
        .context("sending handshake")?;

    let mut read_buf = ReadBuf::new();
    let handshake = read_buf
        .read_handshake(&mut stream)
        .with_timeout("read_handshake", settings.connect_timeout)
        .await
        .context("reading peer handshake")?;
    handshake.validate(&settings.info_hash)?;

    tracing::trace!("handshakes done");

    Ok((stream, read_buf))
}
