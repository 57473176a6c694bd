use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;

use crate::util::generate_peer_id;

/// Knobs of a single torrent session. Passed by value into [crate::TorrentSession::start].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Descriptor paths are resolved relative to this directory
    pub download_root: PathBuf,
    pub peer_id: [u8; 20],
    /// Our own externally visible address. Never connected to.
    pub self_addr: Option<SocketAddrV4>,
    /// Pause between two consecutive block requests
    pub request_interval: Duration,
    /// Requested-but-unanswered blocks across all peers
    pub max_in_flight_requests: usize,
    pub connect_timeout: Duration,
    pub connect_attempts: usize,
    pub max_peers: usize,
    pub keep_alive_interval: Duration,
    pub metrics_interval: Duration,
    pub disk_read_attempts: usize,
    pub disk_write_attempts: usize,
    pub disk_retry_backoff: Duration,
    /// Verified pieces waiting to be written to disk
    pub piece_queue_capacity: usize,
    /// Pieces hashed concurrently by the startup check. Every one of them holds an open file.
    pub max_hashing_tasks: usize,
}

impl SessionConfig {
    pub fn new(download_root: impl Into<PathBuf>) -> Self {
        SessionConfig {
            download_root: download_root.into(),
            ..Default::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            download_root: PathBuf::from("./downloads"),
            peer_id: generate_peer_id(),
            self_addr: None,
            // ~66 requests per second, i.e. ~1 MiB/s with 16 KiB blocks
            request_interval: Duration::from_millis(15),
            max_in_flight_requests: 2400,
            connect_timeout: Duration::from_millis(2500),
            connect_attempts: 2,
            max_peers: 90,
            keep_alive_interval: Duration::from_secs(120),
            metrics_interval: Duration::from_secs(1),
            disk_read_attempts: 2,
            disk_write_attempts: 5,
            disk_retry_backoff: Duration::from_millis(50),
            piece_queue_capacity: 200,
            max_hashing_tasks: 32,
        }
    }
}
