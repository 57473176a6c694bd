use std::fmt::Debug;
use std::path::PathBuf;
use std::result;

use thiserror::Error;

pub type Result<T> = result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("invalid torrent descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("wrong piece index: {0}. Total number of pieces: {1}")]
    WrongPieceIndex(u32, usize),
    #[error("peer closed the connection")]
    ConnectionClosed,
    #[error("failed to write {length} bytes at offset {offset} into {path:?} after {attempts} attempts: {source}")]
    DiskWriteFailed {
        path: PathBuf,
        offset: u64,
        length: u64,
        attempts: usize,
        source: std::io::Error,
    },
    #[error("error while encoding or decoding a bittorrent message: {0}")]
    BittorentProtocolError(#[from] bittorrent_peer_protocol::Error),
}
