use std::fmt::Display;

use bytes::BufMut;
use ethereum_types::H512;
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::{RLPDecodeError, RLPEncodeError},
    structs::{Decoder, Encoder},
};

use super::message::RLPxMessage;

/// devp2p protocol version advertised in our Hello.
pub const P2P_PROTOCOL_VERSION: u8 = 5;

/// A named, versioned subprotocol advertised in a Hello message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capability {
    pub name: String,
    pub version: u8,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u8) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

impl RLPEncode for Capability {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.name)
            .encode_field(&self.version)
            .finish()
    }
}

impl RLPDecode for Capability {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (name, decoder) = decoder.decode_field("name")?;
        let (version, decoder) = decoder.decode_field("version")?;
        // peers may append fields in future versions
        let rest = decoder.finish_unchecked();
        Ok((Self { name, version }, rest))
    }
}

/// Disconnect reasons with the byte values fixed by the devp2p wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    DisconnectRequested,
    NetworkError,
    ProtocolBreach,
    UselessPeer,
    TooManyPeers,
    AlreadyConnected,
    IncompatibleP2PVersion,
    NullNodeIdentity,
    ClientQuitting,
    UnexpectedIdentity,
    ConnectedToSelf,
    PingTimeout,
    SubprotocolReason,
    Unknown,
}

impl DisconnectReason {
    pub fn code(&self) -> u8 {
        match self {
            DisconnectReason::DisconnectRequested => 0x00,
            DisconnectReason::NetworkError => 0x01,
            DisconnectReason::ProtocolBreach => 0x02,
            DisconnectReason::UselessPeer => 0x03,
            DisconnectReason::TooManyPeers => 0x04,
            DisconnectReason::AlreadyConnected => 0x05,
            DisconnectReason::IncompatibleP2PVersion => 0x06,
            DisconnectReason::NullNodeIdentity => 0x07,
            DisconnectReason::ClientQuitting => 0x08,
            DisconnectReason::UnexpectedIdentity => 0x09,
            DisconnectReason::ConnectedToSelf => 0x0a,
            DisconnectReason::PingTimeout => 0x0b,
            DisconnectReason::SubprotocolReason => 0x10,
            // never sent; placeholder for unrecognized incoming bytes
            DisconnectReason::Unknown => 0xff,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => DisconnectReason::DisconnectRequested,
            0x01 => DisconnectReason::NetworkError,
            0x02 => DisconnectReason::ProtocolBreach,
            0x03 => DisconnectReason::UselessPeer,
            0x04 => DisconnectReason::TooManyPeers,
            0x05 => DisconnectReason::AlreadyConnected,
            0x06 => DisconnectReason::IncompatibleP2PVersion,
            0x07 => DisconnectReason::NullNodeIdentity,
            0x08 => DisconnectReason::ClientQuitting,
            0x09 => DisconnectReason::UnexpectedIdentity,
            0x0a => DisconnectReason::ConnectedToSelf,
            0x0b => DisconnectReason::PingTimeout,
            0x10 => DisconnectReason::SubprotocolReason,
            _ => DisconnectReason::Unknown,
        }
    }
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let description = match self {
            DisconnectReason::DisconnectRequested => "disconnect requested",
            DisconnectReason::NetworkError => "network error",
            DisconnectReason::ProtocolBreach => "breach of protocol",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::AlreadyConnected => "already connected",
            DisconnectReason::IncompatibleP2PVersion => "incompatible p2p protocol version",
            DisconnectReason::NullNodeIdentity => "null node identity",
            DisconnectReason::ClientQuitting => "client quitting",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
            DisconnectReason::ConnectedToSelf => "connected to self",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::SubprotocolReason => "subprotocol reason",
            DisconnectReason::Unknown => "unknown reason",
        };
        description.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct HelloMessage {
    pub p2p_version: u64,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u16,
    pub node_id: H512,
}

impl HelloMessage {
    pub fn new(
        client_id: String,
        capabilities: Vec<Capability>,
        listen_port: u16,
        node_id: H512,
    ) -> Self {
        Self {
            p2p_version: P2P_PROTOCOL_VERSION.into(),
            client_id,
            capabilities,
            listen_port,
            node_id,
        }
    }
}

impl RLPxMessage for HelloMessage {
    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.p2p_version)
            .encode_field(&self.client_id)
            .encode_field(&self.capabilities)
            .encode_field(&self.listen_port)
            .encode_field(&self.node_id)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        // [protocolVersion: P, clientId: B, capabilities, listenPort: P, nodeId: B_64, ...]
        let decoder = Decoder::new(msg_data)?;
        let (p2p_version, decoder) = decoder.decode_field("protocolVersion")?;
        let (client_id, decoder) = decoder.decode_field("clientId")?;
        let (capabilities, decoder) = decoder.decode_field("capabilities")?;
        let (listen_port, decoder) = decoder.decode_field("listenPort")?;
        let (node_id, decoder): (bytes::Bytes, _) = decoder.decode_field("nodeId")?;

        // implementations must ignore any additional list elements
        decoder.finish_unchecked();

        // an absent identity decodes as the zero id so the wire layer can
        // answer it with the proper disconnect reason
        let node_id = match node_id.len() {
            0 => H512::zero(),
            64 => H512::from_slice(&node_id),
            _ => return Err(RLPDecodeError::MalformedData),
        };

        Ok(Self {
            p2p_version,
            client_id,
            capabilities,
            listen_port,
            node_id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DisconnectMessage {
    pub reason: Option<DisconnectReason>,
}

impl DisconnectMessage {
    pub fn new(reason: DisconnectReason) -> Self {
        Self {
            reason: Some(reason),
        }
    }

    /// The reason to report upward; peers that omit it requested the close.
    pub fn reason(&self) -> DisconnectReason {
        self.reason.unwrap_or(DisconnectReason::DisconnectRequested)
    }
}

impl RLPxMessage for DisconnectMessage {
    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        // [reason]
        match self.reason {
            Some(reason) => Encoder::new(buf).encode_field(&reason.code()).finish(),
            None => Vec::<u8>::new().encode(buf),
        }
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        // Peers encode the reason as [reason], as a bare integer, or omit it.
        let code = match msg_data.first() {
            None => None,
            Some(prefix) if *prefix >= 0xc0 => {
                let decoder = Decoder::new(msg_data)?;
                let (code, _) = decoder.decode_optional_field();
                code
            }
            Some(_) => u8::decode(msg_data).ok(),
        };

        Ok(Self {
            reason: code.map(DisconnectReason::from_code),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PingMessage {}

impl PingMessage {
    pub fn new() -> Self {
        Self {}
    }
}

impl RLPxMessage for PingMessage {
    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        // empty payload, encoded as the empty list
        Vec::<u8>::new().encode(buf);
        Ok(())
    }

    fn decode(_msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        Ok(Self::new())
    }
}

#[derive(Debug, Clone)]
pub struct PongMessage {}

impl PongMessage {
    pub fn new() -> Self {
        Self {}
    }
}

impl RLPxMessage for PongMessage {
    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Vec::<u8>::new().encode(buf);
        Ok(())
    }

    fn decode(_msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        Ok(Self::new())
    }
}
