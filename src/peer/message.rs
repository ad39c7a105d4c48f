use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{self, Read};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("stream ended mid frame")]
    ShortRead,
    #[error("unexpected message id {0}")]
    WrongId(u8),
    #[error("invalid payload length {0}")]
    BadPayload(usize),
    #[error("piece index {got} does not match requested index {expected}")]
    IndexMismatch { expected: u32, got: u32 },
    #[error("piece offset {begin} is outside a {len} byte buffer")]
    BadOffset { begin: usize, len: usize },
    #[error("piece data ends at {end}, past a {len} byte buffer")]
    BadLength { end: usize, len: usize },
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for MessageError {
    fn from(err: io::Error) -> MessageError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            MessageError::ShortRead
        } else {
            MessageError::Io(err)
        }
    }
}

/// A peer-wire frame: `<length:4 BE><id:1><payload>`. A zero length frame
/// is a keep-alive and carries no id.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => vec![0, 0, 0, 0],
            Message::Choke => vec![0, 0, 0, 1, 0],
            Message::Unchoke => vec![0, 0, 0, 1, 1],
            Message::Interested => vec![0, 0, 0, 1, 2],
            Message::NotInterested => vec![0, 0, 0, 1, 3],
            Message::Have(index) => {
                let mut msg = vec![0, 0, 0, 5, 4];
                msg.extend_from_slice(&index.to_be_bytes());
                msg
            }
            Message::Bitfield(bitfield) => {
                let mut msg = Vec::with_capacity(5 + bitfield.len());
                msg.extend_from_slice(&(bitfield.len() as u32 + 1).to_be_bytes());
                msg.push(5);
                msg.extend_from_slice(bitfield);
                msg
            }
            Message::Request(index, begin, length) => {
                let mut msg = vec![0, 0, 0, 13, 6];
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
                msg
            }
            Message::Piece(index, begin, block) => {
                let mut msg = Vec::with_capacity(13 + block.len());
                msg.extend_from_slice(&(block.len() as u32 + 9).to_be_bytes());
                msg.push(7);
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(block);
                msg
            }
            Message::Cancel(index, begin, length) => {
                let mut msg = vec![0, 0, 0, 13, 8];
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
                msg
            }
            Message::Port(port) => {
                let mut msg = vec![0, 0, 0, 3, 9];
                msg.extend_from_slice(&port.to_be_bytes());
                msg
            }
        }
    }

    /// Reads one frame off the stream: exactly four length bytes, then
    /// exactly `length` body bytes. A premature end is a `ShortRead`.
    pub fn read(r: &mut impl Read) -> Result<Message, MessageError> {
        let length = r.read_u32::<BigEndian>()? as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        let mut buf = vec![0u8; length];
        r.read_exact(&mut buf)?;
        Message::decode(buf[0], &buf[1..])
    }

    fn decode(id: u8, payload: &[u8]) -> Result<Message, MessageError> {
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if payload.len() != 4 {
                    return Err(MessageError::BadPayload(payload.len()));
                }
                Message::Have(BigEndian::read_u32(payload))
            }
            5 => Message::Bitfield(payload.to_vec()),
            6 => {
                if payload.len() != 12 {
                    return Err(MessageError::BadPayload(payload.len()));
                }
                Message::Request(
                    BigEndian::read_u32(&payload[0..4]),
                    BigEndian::read_u32(&payload[4..8]),
                    BigEndian::read_u32(&payload[8..12]),
                )
            }
            7 => {
                if payload.len() < 8 {
                    return Err(MessageError::BadPayload(payload.len()));
                }
                Message::Piece(
                    BigEndian::read_u32(&payload[0..4]),
                    BigEndian::read_u32(&payload[4..8]),
                    payload[8..].to_vec(),
                )
            }
            8 => {
                if payload.len() != 12 {
                    return Err(MessageError::BadPayload(payload.len()));
                }
                Message::Cancel(
                    BigEndian::read_u32(&payload[0..4]),
                    BigEndian::read_u32(&payload[4..8]),
                    BigEndian::read_u32(&payload[8..12]),
                )
            }
            9 => {
                if payload.len() != 2 {
                    return Err(MessageError::BadPayload(payload.len()));
                }
                Message::Port(u16::from_be_bytes([payload[0], payload[1]]))
            }
            id => return Err(MessageError::WrongId(id)),
        };
        Ok(msg)
    }

    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(..) => Some(6),
            Message::Piece(..) => Some(7),
            Message::Cancel(..) => Some(8),
            Message::Port(_) => Some(9),
        }
    }
}

/// Copies a Piece block into the piece buffer after validating it against
/// the piece we actually asked for. Returns the number of bytes written.
pub fn copy_piece_into(
    expected_index: u32,
    buf: &mut [u8],
    index: u32,
    begin: u32,
    block: &[u8],
) -> Result<usize, MessageError> {
    if index != expected_index {
        return Err(MessageError::IndexMismatch {
            expected: expected_index,
            got: index,
        });
    }
    let begin = begin as usize;
    if begin >= buf.len() {
        return Err(MessageError::BadOffset {
            begin,
            len: buf.len(),
        });
    }
    let end = begin + block.len();
    if end > buf.len() {
        return Err(MessageError::BadLength { end, len: buf.len() });
    }
    buf[begin..end].copy_from_slice(block);
    Ok(block.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(msg: Message) -> Message {
        Message::read(&mut Cursor::new(msg.serialize())).unwrap()
    }

    #[test]
    fn keep_alive_roundtrip() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
        assert_eq!(roundtrip(Message::KeepAlive), Message::KeepAlive);
    }

    #[test]
    fn request_roundtrip() {
        let msg = Message::Request(4, 567, i32::MAX as u32);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn have_roundtrip() {
        for index in [0u32, 1, 4096, u32::MAX] {
            assert_eq!(roundtrip(Message::Have(index)), Message::Have(index));
        }
    }

    #[test]
    fn piece_roundtrip() {
        let msg = Message::Piece(1, 16384, vec![0xab; 512]);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn bitfield_roundtrip() {
        let msg = Message::Bitfield(vec![0b10100000, 0x01]);
        assert_eq!(msg.serialize(), vec![0, 0, 0, 3, 5, 0b10100000, 0x01]);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn choke_serializes_with_id_only() {
        assert_eq!(Message::Choke.serialize(), vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::Unchoke.serialize(), vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn read_short_stream_fails() {
        // length claims 13 bytes, body has 3
        let buf = vec![0, 0, 0, 13, 6, 0, 0];
        let err = Message::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, MessageError::ShortRead));

        // truncated length prefix
        let err = Message::read(&mut Cursor::new(vec![0, 0])).unwrap_err();
        assert!(matches!(err, MessageError::ShortRead));
    }

    #[test]
    fn read_unknown_id_fails() {
        let buf = vec![0, 0, 0, 2, 42, 0];
        let err = Message::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, MessageError::WrongId(42)));
    }

    #[test]
    fn read_have_with_bad_payload_fails() {
        let buf = vec![0, 0, 0, 3, 4, 0, 0];
        let err = Message::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, MessageError::BadPayload(2)));
    }

    #[test]
    fn copy_piece_happy_path() {
        let mut buf = vec![0u8; 10];
        let n = copy_piece_into(7, &mut buf, 7, 4, &[1, 2, 3]).unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf, vec![0, 0, 0, 0, 1, 2, 3, 0, 0, 0]);
    }

    #[test]
    fn copy_piece_wrong_index() {
        let mut buf = vec![0u8; 10];
        let err = copy_piece_into(7, &mut buf, 8, 0, &[1]).unwrap_err();
        assert!(matches!(
            err,
            MessageError::IndexMismatch { expected: 7, got: 8 }
        ));
    }

    #[test]
    fn copy_piece_offset_past_buffer() {
        let mut buf = vec![0u8; 10];
        let err = copy_piece_into(0, &mut buf, 0, 10, &[1]).unwrap_err();
        assert!(matches!(err, MessageError::BadOffset { begin: 10, len: 10 }));
    }

    #[test]
    fn copy_piece_data_overruns_buffer() {
        let mut buf = vec![0u8; 10];
        let err = copy_piece_into(0, &mut buf, 0, 8, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, MessageError::BadLength { end: 11, len: 10 }));
    }
}
