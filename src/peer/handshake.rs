use std::io::{self, Read, Write};
use thiserror::Error;

const PSTR: &str = "BitTorrent protocol";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer sent an empty protocol string")]
    EmptyPstrlen,
    #[error("peer handshake carries a different info hash")]
    InfoHashMismatch,
    #[error("stream ended mid handshake")]
    ShortRead,
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> HandshakeError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            HandshakeError::ShortRead
        } else {
            HandshakeError::Io(err)
        }
    }
}

/// The fixed exchange that opens a peer wire session:
/// `<pstrlen:1><pstr><reserved:8><info_hash:20><peer_id:20>`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Handshake {
    pub pstr: String,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            pstr: PSTR.to_string(),
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.pstr.len() + 49);
        buf.push(self.pstr.len() as u8);
        buf.extend_from_slice(self.pstr.as_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Reads a handshake off the stream. The reserved bytes are ignored.
    pub fn read(r: &mut impl Read) -> Result<Handshake, HandshakeError> {
        let mut len = [0u8; 1];
        r.read_exact(&mut len)?;
        let pstrlen = len[0] as usize;
        if pstrlen == 0 {
            return Err(HandshakeError::EmptyPstrlen);
        }

        let mut buf = vec![0u8; pstrlen + 48];
        r.read_exact(&mut buf)?;

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[pstrlen + 8..pstrlen + 28]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[pstrlen + 28..]);

        Ok(Handshake {
            pstr: String::from_utf8_lossy(&buf[..pstrlen]).into_owned(),
            info_hash,
            peer_id,
        })
    }

    /// Writes our handshake and reads the peer's back. Fails unless the
    /// peer is on the same info hash. The caller bounds the exchange with
    /// a socket deadline.
    pub fn perform<S: Read + Write>(&self, stream: &mut S) -> Result<Handshake, HandshakeError> {
        stream.write_all(&self.serialize())?;
        let reply = Handshake::read(stream)?;
        if reply.info_hash != self.info_hash {
            return Err(HandshakeError::InfoHashMismatch);
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn handshake_roundtrip() {
        let hs = Handshake::new([0xaa; 20], [0x17; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        let parsed = Handshake::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(parsed, hs);
    }

    #[test]
    fn handshake_empty_pstrlen_fails() {
        let err = Handshake::read(&mut Cursor::new(vec![0u8; 68])).unwrap_err();
        assert!(matches!(err, HandshakeError::EmptyPstrlen));
    }

    #[test]
    fn handshake_truncated_fails() {
        let hs = Handshake::new([1; 20], [2; 20]);
        let mut bytes = hs.serialize();
        bytes.truncate(40);
        let err = Handshake::read(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, HandshakeError::ShortRead));
    }

    #[test]
    fn perform_rejects_wrong_info_hash() {
        struct Duplex {
            input: Cursor<Vec<u8>>,
            output: Vec<u8>,
        }
        impl Read for Duplex {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.input.read(buf)
            }
        }
        impl Write for Duplex {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.output.write(buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let theirs = Handshake::new([9; 20], [3; 20]).serialize();
        let mut stream = Duplex {
            input: Cursor::new(theirs),
            output: Vec::new(),
        };
        let ours = Handshake::new([1; 20], [2; 20]);
        let err = ours.perform(&mut stream).unwrap_err();
        assert!(matches!(err, HandshakeError::InfoHashMismatch));
        // our side still went out on the wire before the check
        assert_eq!(stream.output, ours.serialize());
    }
}
