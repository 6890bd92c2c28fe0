use std::io::{Error, ErrorKind};

/// A length-prefixed peer wire message. All integers are big-endian.
#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    /// piece index, block offset, block length
    Request(u32, u32, u32),
    /// piece index, block offset, block payload
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u32),
}

fn malformed(reason: &str) -> Error {
    Error::new(ErrorKind::InvalidData, reason.to_string())
}

fn read_u32(data: &[u8]) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&data[..4]);
    u32::from_be_bytes(buf)
}

impl Message {
    /// Serializes the message into a full frame, length prefix included.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => vec![0, 0, 0, 0],
            Message::Choke => Self::frame(0, &[]),
            Message::Unchoke => Self::frame(1, &[]),
            Message::Interested => Self::frame(2, &[]),
            Message::NotInterested => Self::frame(3, &[]),
            Message::Have(index) => Self::frame(4, &index.to_be_bytes()),
            Message::Bitfield(bitfield) => Self::frame(5, bitfield),
            Message::Request(index, begin, length) => {
                let mut body = Vec::with_capacity(12);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
                Self::frame(6, &body)
            }
            Message::Piece(index, begin, block) => {
                let mut body = Vec::with_capacity(8 + block.len());
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(block);
                Self::frame(7, &body)
            }
            Message::Cancel(index, begin, length) => {
                let mut body = Vec::with_capacity(12);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
                Self::frame(8, &body)
            }
            Message::Port(listen_port) => Self::frame(9, &listen_port.to_be_bytes()),
        }
    }

    fn frame(id: u8, body: &[u8]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(5 + body.len());
        msg.extend_from_slice(&(1 + body.len() as u32).to_be_bytes());
        msg.push(id);
        msg.extend_from_slice(body);
        msg
    }

    /// Parses one full frame (length prefix included). The caller must hand
    /// over exactly `4 + length` bytes; the session's buffering guarantees
    /// that.
    pub fn deserialize(data: &[u8]) -> Result<Message, Error> {
        if data.len() < 4 {
            return Err(malformed("frame shorter than its length prefix"));
        }
        let length = read_u32(data) as usize;
        if data.len() != 4 + length {
            return Err(malformed("frame length disagrees with its prefix"));
        }
        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        let id = data[4];
        let body = &data[5..];
        let msg = match id {
            0 | 1 | 2 | 3 => {
                if !body.is_empty() {
                    return Err(malformed("state message carries a payload"));
                }
                match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            4 => {
                if body.len() != 4 {
                    return Err(malformed("have message should be 9 bytes long"));
                }
                Message::Have(read_u32(body))
            }
            5 => Message::Bitfield(body.to_vec()),
            6 | 8 => {
                if body.len() != 12 {
                    return Err(malformed("request/cancel message should be 17 bytes long"));
                }
                let index = read_u32(&body[0..4]);
                let begin = read_u32(&body[4..8]);
                let len = read_u32(&body[8..12]);
                if id == 6 {
                    Message::Request(index, begin, len)
                } else {
                    Message::Cancel(index, begin, len)
                }
            }
            7 => {
                if body.len() < 8 {
                    return Err(malformed("piece message should be at least 13 bytes long"));
                }
                Message::Piece(read_u32(&body[0..4]), read_u32(&body[4..8]), body[8..].to_vec())
            }
            9 => {
                if body.len() != 4 {
                    return Err(malformed("port message should be 9 bytes long"));
                }
                Message::Port(read_u32(body))
            }
            _ => return Err(malformed("unknown message id")),
        };
        Ok(msg)
    }

    /// The message id byte; `None` for keep-alive, which has no id.
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(_, _, _) => Some(6),
            Message::Piece(_, _, _) => Some(7),
            Message::Cancel(_, _, _) => Some(8),
            Message::Port(_) => Some(9),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let bytes = msg.serialize();
        let parsed = Message::deserialize(&bytes).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn test_message_keep_alive() {
        let bytes = Message::KeepAlive.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        roundtrip(Message::KeepAlive);
    }

    #[test]
    fn test_state_messages() {
        assert_eq!(Message::Choke.serialize(), vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::Unchoke.serialize(), vec![0, 0, 0, 1, 1]);
        assert_eq!(Message::Interested.serialize(), vec![0, 0, 0, 1, 2]);
        assert_eq!(Message::NotInterested.serialize(), vec![0, 0, 0, 1, 3]);
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            roundtrip(msg);
        }
    }

    #[test]
    fn test_message_have() {
        let bytes = Message::Have(0x01020304).serialize();
        assert_eq!(bytes, vec![0, 0, 0, 5, 4, 1, 2, 3, 4]);
        roundtrip(Message::Have(42));
    }

    #[test]
    fn test_message_bitfield() {
        let bytes = Message::Bitfield(vec![0b10100000, 0b00000001]).serialize();
        assert_eq!(bytes, vec![0, 0, 0, 3, 5, 0b10100000, 0b00000001]);
        roundtrip(Message::Bitfield(vec![0xff; 33]));
    }

    #[test]
    fn test_message_request_and_cancel() {
        let bytes = Message::Request(1, 16384, 16384).serialize();
        assert_eq!(bytes[..5], [0, 0, 0, 13, 6]);
        assert_eq!(bytes.len(), 17);
        roundtrip(Message::Request(7, 32768, 16384));
        roundtrip(Message::Cancel(7, 32768, 16384));
    }

    #[test]
    fn test_message_piece() {
        let payload = vec![9u8; 100];
        let bytes = Message::Piece(3, 16384, payload.clone()).serialize();
        assert_eq!(bytes[..5], [0, 0, 0, 109, 7]);
        roundtrip(Message::Piece(3, 16384, payload));
        // a piece frame larger than one length byte
        roundtrip(Message::Piece(0, 0, vec![1u8; 16384]));
    }

    #[test]
    fn test_message_port() {
        let bytes = Message::Port(8000).serialize();
        assert_eq!(bytes, vec![0, 0, 0, 5, 9, 0, 0, 0x1f, 0x40]);
        roundtrip(Message::Port(6881));
    }

    #[test]
    fn test_unknown_id_rejected() {
        assert!(Message::deserialize(&[0, 0, 0, 1, 17]).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        // have with a 3-byte index
        assert!(Message::deserialize(&[0, 0, 0, 4, 4, 1, 2, 3]).is_err());
        // request with a truncated body
        assert!(Message::deserialize(&[0, 0, 0, 9, 6, 0, 0, 0, 1, 0, 0, 0, 2]).is_err());
        // prefix promising more bytes than handed over
        assert!(Message::deserialize(&[0, 0, 0, 5, 4, 1, 2]).is_err());
    }
}
