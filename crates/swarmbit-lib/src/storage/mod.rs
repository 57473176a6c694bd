mod piece_hash_verifier;
mod writer;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
pub use piece_hash_verifier::PieceHashVerifier;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
pub(crate) use writer::write_pieces;

use crate::config::SessionConfig;
use crate::descriptor::TorrentDescriptor;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub length: u64,
}

impl FileInfo {
    pub fn new(path: PathBuf, length: u64) -> Self {
        FileInfo { path, length }
    }
}

/// A contiguous part of a global byte range that lives in a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSection {
    pub file_idx: usize,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub read_attempts: usize,
    pub write_attempts: usize,
    pub backoff: Duration,
}

impl From<&SessionConfig> for RetryPolicy {
    fn from(config: &SessionConfig) -> Self {
        RetryPolicy {
            read_attempts: config.disk_read_attempts.max(1),
            write_attempts: config.disk_write_attempts.max(1),
            backoff: config.disk_retry_backoff,
        }
    }
}

/// Maps piece/block byte ranges onto the files of a torrent, which are treated as one logical
/// byte stream. File handles are opened and closed per operation.
#[derive(Debug, Clone)]
pub struct DiskMapper {
    files: Arc<[FileInfo]>,
    piece_length: u64,
    retry: RetryPolicy,
}

impl DiskMapper {
    pub fn new(files: Vec<FileInfo>, piece_length: u32, retry: RetryPolicy) -> Self {
        DiskMapper {
            files: files.into(),
            piece_length: piece_length as u64,
            retry,
        }
    }

    pub fn from_descriptor(descriptor: &TorrentDescriptor, config: &SessionConfig) -> Self {
        let files = descriptor
            .files()
            .iter()
            .map(|file| FileInfo::new(config.download_root.join(&file.path), file.length))
            .collect();

        DiskMapper::new(files, descriptor.piece_length(), config.into())
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    /// Splits `length` bytes starting at `begin` of piece `piece_index` into per-file sections, in
    /// order. Zero-length files never produce a section.
    pub fn sections(&self, piece_index: u32, begin: u32, length: u64) -> Vec<FileSection> {
        let start = piece_index as u64 * self.piece_length + begin as u64;
        let end = start + length;

        let mut sections = Vec::with_capacity(2);
        let mut file_start = 0;
        for (file_idx, file) in self.files.iter().enumerate() {
            if file_start >= end {
                break;
            }

            let file_end = file_start + file.length;
            // Intersection of [start, end) and [file_start, file_end)
            let from = start.max(file_start);
            let to = end.min(file_end);
            if from < to {
                sections.push(FileSection {
                    file_idx,
                    offset: from - file_start,
                    length: to - from,
                });
            }

            file_start = file_end;
        }

        sections
    }

    /// Creates missing directories and files and sets every file to its final length
    #[tracing::instrument(level = "debug", err, skip(self))]
    pub async fn prepare(&self) -> anyhow::Result<()> {
        for file in self.files.iter() {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent).await.with_context(|| {
                    format!("error while creating parent directories for a file: {:?}", file.path)
                })?;
            }

            let f = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&file.path)
                .await
                .with_context(|| format!("error while opening/creating a file: {:?}", file.path))?;

            f.set_len(file.length)
                .await
                .with_context(|| format!("error while setting the file's length: {:?}, {}", file.path, file.length))?;
        }

        Ok(())
    }

    /// Reads a piece or a block. Returns `None` if some section couldn't be read completely even after
    /// retrying, the caller is expected to try again later.
    pub async fn read(&self, piece_index: u32, begin: u32, length: u32) -> Option<Bytes> {
        let mut data = BytesMut::zeroed(length as usize);
        let mut filled = 0;
        for section in self.sections(piece_index, begin, length as u64) {
            // A section is never longer than the requested `u32` length
            let section_length = section.length as usize;
            let buf = &mut data[filled..filled + section_length];
            if !self.read_section(section, buf).await {
                return None;
            }
            filled += section_length;
        }

        if filled != length as usize {
            tracing::warn!(piece_index, begin, length, filled, "requested range is past the end of the torrent");
            return None;
        }

        Some(data.freeze())
    }

    async fn read_section(&self, section: FileSection, buf: &mut [u8]) -> bool {
        let path = &self.files[section.file_idx].path;
        for attempt in 1..=self.retry.read_attempts {
            match read_exact_at(path, section.offset, buf).await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::debug!(?path, offset = section.offset, attempt, "error while reading a section: {}", e);
                }
            }
        }

        tracing::warn!(
            ?path,
            offset = section.offset,
            length = section.length,
            "giving up on reading a section"
        );
        false
    }

    /// Writes `data` starting at `begin` of piece `piece_index`. Short or failed writes are retried;
    /// after the last attempt the error is returned, data is never dropped silently.
    pub async fn write(&self, piece_index: u32, begin: u32, data: &[u8]) -> Result<()> {
        let mut written = 0;
        for section in self.sections(piece_index, begin, data.len() as u64) {
            let section_length = section.length as usize;
            self.write_section(section, &data[written..written + section_length])
                .await?;
            written += section_length;
        }

        Ok(())
    }

    async fn write_section(&self, section: FileSection, buf: &[u8]) -> Result<()> {
        let path = &self.files[section.file_idx].path;
        let mut attempt = 1;
        loop {
            match write_all_at(path, section.offset, buf).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.retry.write_attempts => {
                    return Err(Error::DiskWriteFailed {
                        path: path.clone(),
                        offset: section.offset,
                        length: section.length,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::debug!(?path, offset = section.offset, attempt, "error while writing a section: {}", e);
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

async fn read_exact_at(path: &Path, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(buf).await?;
    Ok(())
}

async fn write_all_at(path: &Path, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).truncate(false).write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(buf).await?;
    file.flush().await?;
    Ok(())
}
