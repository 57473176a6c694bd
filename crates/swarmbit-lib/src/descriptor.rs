use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative to the download root
    pub path: PathBuf,
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, length: u64) -> Self {
        FileEntry {
            path: path.into(),
            length,
        }
    }
}

/// An already decoded torrent. Immutable for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    name: String,
    piece_length: u32,
    total_length: u64,
    files: Vec<FileEntry>,
    piece_hashes: Vec<[u8; 20]>,
    info_hash: [u8; 20],
}

impl TorrentDescriptor {
    pub fn new(
        name: impl Into<String>,
        piece_length: u32,
        files: Vec<FileEntry>,
        piece_hashes: Vec<[u8; 20]>,
        info_hash: [u8; 20],
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(Error::InvalidDescriptor("piece length is zero".into()));
        }
        if files.is_empty() {
            return Err(Error::InvalidDescriptor("no files".into()));
        }
        if let Some(file) = files.iter().find(|file| !is_safe_relative_path(&file.path)) {
            return Err(Error::InvalidDescriptor(format!(
                "file path escapes the download root: {:?}",
                file.path
            )));
        }

        let total_length: u64 = files.iter().map(|file| file.length).sum();
        let expected_pieces = total_length.div_ceil(piece_length as u64);
        if expected_pieces == 0 || expected_pieces != piece_hashes.len() as u64 {
            return Err(Error::InvalidDescriptor(format!(
                "expected {} piece hashes for {} bytes, got {}",
                expected_pieces,
                total_length,
                piece_hashes.len()
            )));
        }

        Ok(TorrentDescriptor {
            name: name.into(),
            piece_length,
            total_length,
            files,
            piece_hashes,
            info_hash,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn piece_hashes(&self) -> &[[u8; 20]] {
        &self.piece_hashes
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn number_of_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn final_piece_length(&self) -> u32 {
        match self.total_length % self.piece_length as u64 {
            0 => self.piece_length,
            // Smaller than `piece_length`, so it fits
            remainder => remainder as u32,
        }
    }

    pub fn piece_size(&self, idx: u32) -> Result<u32> {
        let number_of_pieces = self.number_of_pieces();
        match idx as usize {
            idx if idx + 1 == number_of_pieces => Ok(self.final_piece_length()),
            idx if idx < number_of_pieces => Ok(self.piece_length),
            _ => Err(Error::WrongPieceIndex(idx, number_of_pieces)),
        }
    }

    /// Parses the JSON form of a decoded descriptor, see [DescriptorFile]
    pub fn from_json(src: &[u8]) -> anyhow::Result<Self> {
        let file: DescriptorFile = serde_json::from_slice(src)?;
        Ok(file.try_into()?)
    }
}

fn is_safe_relative_path(path: &Path) -> bool {
    path.components().next().is_some() && path.components().all(|part| matches!(part, Component::Normal(_)))
}

/// Serialized form of a descriptor produced by an external metainfo decoder
#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
pub struct DescriptorFile {
    pub name: String,
    pub piece_length: u32,
    /// Concatenated piece hashes (20-byte SHA1 hash values). Must be a multiple of 20
    #[serde_as(as = "Hex")]
    pub pieces: Vec<u8>,
    pub files: Vec<DescriptorFileEntry>,
    #[serde_as(as = "Hex")]
    pub info_hash: [u8; 20],
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DescriptorFileEntry {
    /// "dir1/dir2/file.ext" -> ["dir1", "dir2", "file.ext"]
    pub path: Vec<String>,
    pub length: u64,
}

impl TryFrom<DescriptorFile> for TorrentDescriptor {
    type Error = Error;

    fn try_from(file: DescriptorFile) -> Result<Self> {
        if file.pieces.len() % 20 != 0 {
            return Err(Error::InvalidDescriptor(format!(
                "pieces length {} is not a multiple of 20",
                file.pieces.len()
            )));
        }

        let piece_hashes = file
            .pieces
            .chunks_exact(20)
            .map(|hash| {
                let mut piece_hash = [0; 20];
                piece_hash.copy_from_slice(hash);
                piece_hash
            })
            .collect();

        let files = file
            .files
            .into_iter()
            .map(|entry| FileEntry::new(entry.path.iter().collect::<PathBuf>(), entry.length))
            .collect();

        TorrentDescriptor::new(file.name, file.piece_length, files, piece_hashes, file.info_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(piece_length: u32, lengths: &[u64], hashes: usize) -> Result<TorrentDescriptor> {
        let files = lengths
            .iter()
            .enumerate()
            .map(|(idx, length)| FileEntry::new(format!("file-{}", idx), *length))
            .collect();
        TorrentDescriptor::new("test", piece_length, files, vec![[0; 20]; hashes], [1; 20])
    }

    #[test]
    fn derived_sizes() {
        let single = descriptor(16384, &[20000], 2).expect("valid descriptor");
        assert_eq!(single.total_length(), 20000);
        assert_eq!(single.number_of_pieces(), 2);
        assert_eq!(single.final_piece_length(), 3616);
        assert_eq!(single.piece_size(0).expect("first piece"), 16384);
        assert_eq!(single.piece_size(1).expect("last piece"), 3616);
        assert!(matches!(single.piece_size(2), Err(Error::WrongPieceIndex(2, 2))));

        let aligned = descriptor(8, &[10, 25, 5], 5).expect("valid descriptor");
        assert_eq!(aligned.final_piece_length(), 8);
    }

    #[test]
    fn rejects_inconsistent_descriptors() {
        assert!(descriptor(16384, &[20000], 3).is_err());
        assert!(descriptor(0, &[20000], 2).is_err());
        assert!(descriptor(8, &[0], 0).is_err());

        let escaping = TorrentDescriptor::new(
            "test",
            8,
            vec![FileEntry::new("../outside", 8)],
            vec![[0; 20]],
            [0; 20],
        );
        assert!(matches!(escaping, Err(Error::InvalidDescriptor(_))));
    }

    #[test]
    fn parses_json_form() {
        let json = format!(
            r#"{{
                "name": "multi",
                "piece_length": 32,
                "pieces": "{}",
                "files": [
                    {{ "path": ["dir", "a.bin"], "length": 40 }},
                    {{ "path": ["b.bin"], "length": 10 }}
                ],
                "info_hash": "{}"
            }}"#,
            "ab".repeat(40),
            "01".repeat(20)
        );

        let descriptor = TorrentDescriptor::from_json(json.as_bytes()).expect("valid json descriptor");
        assert_eq!(descriptor.name(), "multi");
        assert_eq!(descriptor.number_of_pieces(), 2);
        assert_eq!(descriptor.piece_hashes()[1], [0xab; 20]);
        assert_eq!(descriptor.files()[0].path, PathBuf::from("dir").join("a.bin"));
        assert_eq!(descriptor.info_hash(), &[1; 20]);
        assert_eq!(descriptor.final_piece_length(), 18);
    }
}
