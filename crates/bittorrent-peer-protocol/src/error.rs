use std::fmt::Debug;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("an IO error happened: {0}")]
    IoError(#[from] std::io::Error),
    #[error("an error happened when converting a value: {0}")]
    ConversionError(&'static str),
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),
    #[error("bad length: expected {1} bytes while got {0}")]
    BadLength(usize, usize),
    #[error("frame length {0} exceeds the limit of {1} bytes")]
    FrameTooLarge(usize, usize),
    #[error("malformed handshake: {0}")]
    BadHandshake(&'static str),
    #[error("peer answered with a wrong info hash: {0:?}")]
    InfoHashMismatch([u8; 20]),
}
