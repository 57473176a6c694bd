use bytes::Buf;
use std::io::Cursor;
use tokio::io::AsyncWriteExt;

use crate::{Decode, Encode, Error, Result};

/// The handshake is a required message and must be the first message transmitted by the client.
///
/// It's always exactly [Handshake::LENGTH] bytes long and isn't prefixed with a length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Eight reserved bytes that are used to specify extensions of the Bittorrent protocol
    pub extension_bytes: u64,
    /// 20-byte SHA1 hash of the info key in the metainfo file.
    pub info_hash: [u8; 20],
    /// 20-byte unique ID of the sending client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub const PSTR: &'static str = "BitTorrent protocol";
    pub const LENGTH: usize = 1 + Handshake::PSTR.len() + 8 + 20 + 20;

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            extension_bytes: 0,
            info_hash,
            peer_id,
        }
    }

    /// Checks that the remote side is talking about the torrent we expect
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<()> {
        if &self.info_hash != expected_info_hash {
            return Err(Error::InfoHashMismatch(self.info_hash));
        }

        Ok(())
    }
}

impl Encode for Handshake {
    async fn encode<T>(&self, dst: &mut T) -> Result<()>
    where
        T: AsyncWriteExt + Unpin,
    {
        let mut buf = Vec::with_capacity(Handshake::LENGTH);
        // `pstr_len` must be a single byte
        buf.push(Handshake::PSTR.len() as u8);
        buf.extend_from_slice(Handshake::PSTR.as_bytes());
        // 8 reserved bytes
        buf.extend_from_slice(&self.extension_bytes.to_be_bytes());
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);

        dst.write_all(&buf).await?;

        Ok(())
    }
}

impl<'a> Decode<'a> for Handshake {
    fn decode(src: &'a [u8]) -> Result<Self> {
        check_length!(src.len(), Handshake::LENGTH);

        let mut src = Cursor::new(&src[..Handshake::LENGTH]);

        let pstr_len = src.get_u8() as usize;
        if pstr_len != Handshake::PSTR.len() {
            return Err(Error::BadHandshake("unexpected protocol string length"));
        }

        let mut pstr = [0; Handshake::PSTR.len()];
        src.copy_to_slice(&mut pstr);
        if pstr != Handshake::PSTR.as_bytes() {
            return Err(Error::BadHandshake("unexpected protocol string"));
        }

        let extension_bytes = src.get_u64();

        let mut info_hash = [0; 20];
        src.copy_to_slice(info_hash.as_mut());

        let mut peer_id = [0; 20];
        src.copy_to_slice(peer_id.as_mut());

        Ok(Handshake {
            extension_bytes,
            info_hash,
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(handshake: &Handshake) -> Vec<u8> {
        let mut buf = Vec::new();
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(handshake.encode(&mut buf))
            .expect("encoding into a vec can't fail");
        buf
    }

    #[test]
    fn handshake_layout() {
        let handshake = Handshake::new([7; 20], [9; 20]);
        let bytes = encoded(&handshake);

        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0; 8]);
        assert_eq!(&bytes[28..48], &[7; 20]);
        assert_eq!(&bytes[48..68], &[9; 20]);

        let decoded = Handshake::decode(&bytes).expect("valid handshake");
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn rejects_foreign_protocol() {
        let mut bytes = encoded(&Handshake::new([1; 20], [2; 20]));
        bytes[0] = 18;
        assert!(matches!(Handshake::decode(&bytes), Err(Error::BadHandshake(_))));

        let mut bytes = encoded(&Handshake::new([1; 20], [2; 20]));
        bytes[5] = b'X';
        assert!(matches!(Handshake::decode(&bytes), Err(Error::BadHandshake(_))));
    }

    #[test]
    fn rejects_truncated_handshake() {
        let bytes = encoded(&Handshake::new([1; 20], [2; 20]));
        assert!(matches!(Handshake::decode(&bytes[..67]), Err(Error::BadLength(67, 68))));
    }

    #[test]
    fn info_hash_is_validated() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        assert!(handshake.validate(&[1; 20]).is_ok());
        assert!(matches!(handshake.validate(&[3; 20]), Err(Error::InfoHashMismatch(_))));
    }
}
