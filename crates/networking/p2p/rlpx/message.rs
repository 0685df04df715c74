use std::fmt::Display;

use bytes::{BufMut, Bytes};
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::{RLPDecodeError, RLPEncodeError},
};

use super::p2p::{DisconnectMessage, HelloMessage, PingMessage, PongMessage};

pub trait RLPxMessage: Sized {
    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError>;

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError>;
}

/// One devp2p message: a reserved control message or an opaque subprotocol
/// payload to be resolved against the negotiated offset map.
#[derive(Debug, Clone)]
pub(crate) enum Message {
    Hello(HelloMessage),
    Disconnect(DisconnectMessage),
    Ping(PingMessage),
    Pong(PongMessage),
    Subprotocol { id: u8, data: Bytes },
}

impl Message {
    pub fn decode(msg_id: u8, msg_data: &[u8]) -> Result<Message, RLPDecodeError> {
        match msg_id {
            0x00 => Ok(Message::Hello(HelloMessage::decode(msg_data)?)),
            0x01 => Ok(Message::Disconnect(DisconnectMessage::decode(msg_data)?)),
            0x02 => Ok(Message::Ping(PingMessage::decode(msg_data)?)),
            0x03 => Ok(Message::Pong(PongMessage::decode(msg_data)?)),
            // Everything else belongs to a negotiated subprotocol; which one
            // is decided by the connection's offset map, not here.
            id => Ok(Message::Subprotocol {
                id,
                data: Bytes::copy_from_slice(msg_data),
            }),
        }
    }

    pub fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        match self {
            Message::Hello(msg) => {
                0x00_u8.encode(buf);
                msg.encode(buf)
            }
            Message::Disconnect(msg) => {
                0x01_u8.encode(buf);
                msg.encode(buf)
            }
            Message::Ping(msg) => {
                0x02_u8.encode(buf);
                msg.encode(buf)
            }
            Message::Pong(msg) => {
                0x03_u8.encode(buf);
                msg.encode(buf)
            }
            Message::Subprotocol { id, data } => {
                id.encode(buf);
                buf.put_slice(data);
                Ok(())
            }
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Hello(_) => "p2p:Hello".fmt(f),
            Message::Disconnect(_) => "p2p:Disconnect".fmt(f),
            Message::Ping(_) => "p2p:Ping".fmt(f),
            Message::Pong(_) => "p2p:Pong".fmt(f),
            Message::Subprotocol { id, .. } => write!(f, "subprotocol:{id:#04x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_prefixes_body() {
        let mut buf = Vec::new();
        Message::Ping(PingMessage::new()).encode(&mut buf).unwrap();
        // RLP(0x02) || RLP([])
        assert_eq!(buf, vec![0x02, 0xc0]);

        let mut buf = Vec::new();
        Message::Hello(HelloMessage::new(
            "c".to_string(),
            vec![],
            0,
            ethereum_types::H512([1; 64]),
        ))
        .encode(&mut buf)
        .unwrap();
        // Hello's id 0x00 encodes as the RLP empty string
        assert_eq!(buf[0], 0x80);
    }

    #[test]
    fn subprotocol_messages_stay_opaque() {
        let mut buf = Vec::new();
        Message::Subprotocol {
            id: 0x11,
            data: Bytes::from_static(&[0xc1, 0x05]),
        }
        .encode(&mut buf)
        .unwrap();
        assert_eq!(buf, vec![0x11, 0xc1, 0x05]);

        match Message::decode(0x11, &buf[1..]).unwrap() {
            Message::Subprotocol { id, data } => {
                assert_eq!(id, 0x11);
                assert_eq!(data.as_ref(), &[0xc1, 0x05]);
            }
            other => panic!("expected subprotocol message, got {other}"),
        }
    }
}
