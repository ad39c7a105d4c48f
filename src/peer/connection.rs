use crate::bitfield::Bitfield;
use crate::peer::handshake::{Handshake, HandshakeError};
use crate::peer::message::{self, Message, MessageError};
use crate::tracker::peers::Peer;
use log::{debug, trace};
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Largest block asked for in one Request message.
pub const MAX_BLOCK_SIZE: usize = 16384;
/// Requests allowed in flight before we wait for a Piece.
pub const MAX_BACKLOG: usize = 5;

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);
const PIECE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to dial peer: {0}")]
    Dial(#[source] io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("expected a bitfield as the first frame")]
    ExpectedBitfield,
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("piece download deadline expired")]
    PieceTimeout,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// One open peer wire session. Owns the socket; created by a successful
/// handshake, destroyed on disconnect.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    pub peer: Peer,
    /// peer id the remote side sent in its handshake
    pub peer_id: [u8; 20],
    pub bitfield: Bitfield,
    pub choked: bool,
}

// counters for one download_piece call, scoped to that call only
#[derive(Default)]
struct PieceState {
    buf: Vec<u8>,
    downloaded: usize,
    requested: usize,
    backlog: usize,
}

impl Connection {
    /// Dials the peer and opens the session: handshake, mandatory bitfield
    /// frame, then Unchoke + Interested.
    pub fn connect(
        peer: Peer,
        peer_id: [u8; 20],
        info_hash: [u8; 20],
    ) -> Result<Connection, SessionError> {
        let mut stream =
            TcpStream::connect_timeout(&peer.addr(), DIAL_TIMEOUT).map_err(SessionError::Dial)?;

        stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let reply = Handshake::new(info_hash, peer_id).perform(&mut stream)?;
        debug!("completed handshake with {}", peer);

        stream.set_read_timeout(Some(BITFIELD_TIMEOUT))?;
        let bitfield = match Message::read(&mut stream)? {
            Message::Bitfield(payload) => Bitfield::new(payload),
            _ => return Err(SessionError::ExpectedBitfield),
        };

        let mut conn = Connection {
            stream,
            peer,
            peer_id: reply.peer_id,
            bitfield,
            choked: true,
        };
        conn.send(&Message::Unchoke)?;
        conn.send(&Message::Interested)?;
        Ok(conn)
    }

    fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        self.stream.write_all(&msg.serialize())?;
        trace!("sent {:?} to {}", msg.id(), self.peer);
        Ok(())
    }

    pub fn send_have(&mut self, index: u32) -> Result<(), SessionError> {
        self.send(&Message::Have(index))
    }

    /// Downloads one whole piece, pipelining block requests while the peer
    /// keeps us unchoked. The deadline covers the entire state machine; on
    /// any failure the caller retries the piece from scratch.
    pub fn download_piece(&mut self, index: u32, length: usize) -> Result<Vec<u8>, SessionError> {
        let deadline = Instant::now() + PIECE_TIMEOUT;
        self.stream.set_write_timeout(Some(PIECE_TIMEOUT))?;

        let mut state = PieceState {
            buf: vec![0u8; length],
            ..Default::default()
        };

        while state.downloaded < length {
            if !self.choked {
                while state.backlog < MAX_BACKLOG && state.requested < length {
                    let block = MAX_BLOCK_SIZE.min(length - state.requested);
                    self.send(&Message::Request(
                        index,
                        state.requested as u32,
                        block as u32,
                    ))?;
                    state.backlog += 1;
                    state.requested += block;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::PieceTimeout);
            }
            self.stream.set_read_timeout(Some(remaining))?;
            self.handle_frame(index, &mut state)?;
        }
        Ok(state.buf)
    }

    fn handle_frame(&mut self, index: u32, state: &mut PieceState) -> Result<(), SessionError> {
        match Message::read(&mut self.stream)? {
            Message::KeepAlive => {}
            Message::Unchoke => self.choked = false,
            Message::Choke => self.choked = true,
            Message::Have(i) => self.bitfield.set_piece(i as usize),
            Message::Piece(i, begin, block) => {
                let n = message::copy_piece_into(index, &mut state.buf, i, begin, &block)?;
                state.downloaded += n;
                state.backlog = state.backlog.saturating_sub(1);
            }
            other => trace!("ignoring {:?} from {}", other.id(), self.peer),
        }
        Ok(())
    }

    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    const INFO_HASH: [u8; 20] = [0xab; 20];

    fn local_peer(listener: &TcpListener) -> Peer {
        let addr = listener.local_addr().unwrap();
        Peer {
            ip: Ipv4Addr::LOCALHOST,
            port: addr.port(),
        }
    }

    #[test]
    fn connect_opens_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = local_peer(&listener);

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let theirs = Handshake::read(&mut stream).unwrap();
            assert_eq!(theirs.info_hash, INFO_HASH);
            stream
                .write_all(&Handshake::new(INFO_HASH, [2; 20]).serialize())
                .unwrap();
            stream
                .write_all(&Message::Bitfield(vec![0b10100000]).serialize())
                .unwrap();
            // the client follows up with Unchoke then Interested
            assert_eq!(Message::read(&mut stream).unwrap(), Message::Unchoke);
            assert_eq!(Message::read(&mut stream).unwrap(), Message::Interested);
        });

        let conn = Connection::connect(peer, [1; 20], INFO_HASH).unwrap();
        assert_eq!(conn.peer_id, [2; 20]);
        assert!(conn.choked);
        assert!(conn.bitfield.has_piece(0));
        assert!(!conn.bitfield.has_piece(1));
        assert!(conn.bitfield.has_piece(2));
        server.join().unwrap();
    }

    #[test]
    fn connect_requires_bitfield_first() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = local_peer(&listener);

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            Handshake::read(&mut stream).unwrap();
            stream
                .write_all(&Handshake::new(INFO_HASH, [2; 20]).serialize())
                .unwrap();
            stream.write_all(&Message::Unchoke.serialize()).unwrap();
        });

        let err = Connection::connect(peer, [1; 20], INFO_HASH).unwrap_err();
        assert!(matches!(err, SessionError::ExpectedBitfield));
        server.join().unwrap();
    }

    #[test]
    fn connect_rejects_foreign_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = local_peer(&listener);

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            Handshake::read(&mut stream).unwrap();
            stream
                .write_all(&Handshake::new([0xcd; 20], [2; 20]).serialize())
                .unwrap();
        });

        let err = Connection::connect(peer, [1; 20], INFO_HASH).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(HandshakeError::InfoHashMismatch)
        ));
        server.join().unwrap();
    }

    #[test]
    fn download_piece_pipelines_blocks() {
        let piece: Vec<u8> = (0..40000u32).map(|i| (i % 256) as u8).collect();
        let piece_len = piece.len();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = local_peer(&listener);

        let served = piece.clone();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            Handshake::read(&mut stream).unwrap();
            stream
                .write_all(&Handshake::new(INFO_HASH, [2; 20]).serialize())
                .unwrap();
            stream
                .write_all(&Message::Bitfield(vec![0b10000000]).serialize())
                .unwrap();
            assert_eq!(Message::read(&mut stream).unwrap(), Message::Unchoke);
            assert_eq!(Message::read(&mut stream).unwrap(), Message::Interested);
            stream.write_all(&Message::Unchoke.serialize()).unwrap();

            let mut sent = 0;
            while sent < piece_len {
                match Message::read(&mut stream).unwrap() {
                    Message::Request(0, begin, length) => {
                        let begin = begin as usize;
                        let block = served[begin..begin + length as usize].to_vec();
                        stream
                            .write_all(&Message::Piece(0, begin as u32, block).serialize())
                            .unwrap();
                        sent += length as usize;
                    }
                    other => panic!("unexpected message {:?}", other),
                }
            }
        });

        let mut conn = Connection::connect(peer, [1; 20], INFO_HASH).unwrap();
        let got = conn.download_piece(0, piece_len).unwrap();
        assert!(!conn.choked);
        assert_eq!(got, piece);
        server.join().unwrap();
    }
}
