use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, OnceLock, Weak},
};

use aes::cipher::KeyIvInit;
use bytes::{Bytes, BytesMut};
use ethereum_types::{H256, H512};
use ethwire_rlp::decode::RLPDecode;
use k256::{ecdsa::SigningKey, PublicKey, SecretKey};
use rand::Rng;
use sha3::{Digest, Keccak256};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, Mutex},
};
use tracing::{debug, info, warn};

use crate::{subprotocol::SubprotocolRegistry, ConnectionHandle, DisconnectListener};

use super::{
    error::RLPxError,
    frame::{Aes256Ctr64BE, FrameState},
    handshake::{
        decode_ack_message, decode_auth_message, decode_plain_ack_message,
        decode_plain_auth_message, encode_ack_message, encode_auth_message, PLAIN_ACK_SIZE,
        PLAIN_AUTH_SIZE,
    },
    message::Message,
    multiplex::OffsetMap,
    p2p::{
        DisconnectMessage, DisconnectReason, HelloMessage, PingMessage, PongMessage,
        P2P_PROTOCOL_VERSION,
    },
    utils::{ecdh_xchng, id2pubkey},
};

/// Upper bound on one auth/auth-ack packet; EIP-8 messages stay well below.
const MAX_HANDSHAKE_PACKET_SIZE: usize = 1024;

/// The RLPx handshake: auth/auth-ack exchange over a fresh stream, producing
/// the session [`Secrets`].
pub(crate) struct RLPxConnection<S> {
    signer: SigningKey,
    state: RLPxConnectionState,
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RLPxConnection<S> {
    /// Dialing side; the peer's node id is known up front.
    pub fn initiator(signer: SigningKey, remote_node_id: H512, stream: S) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signer,
            stream,
            state: RLPxConnectionState::Initiator(Initiator {
                nonce: H256(rng.gen()),
                ephemeral_key: SecretKey::random(&mut rng),
                remote_node_id,
            }),
        }
    }

    /// Accepting side; the peer's node id is learned from its auth message.
    pub fn receiver(signer: SigningKey, stream: S) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signer,
            stream,
            state: RLPxConnectionState::Receiver(Receiver {
                nonce: H256(rng.gen()),
                ephemeral_key: SecretKey::random(&mut rng),
            }),
        }
    }

    pub async fn handshake(mut self) -> Result<(Secrets, S), RLPxError> {
        let secrets = match &self.state {
            RLPxConnectionState::Initiator(_) => {
                self.send_auth().await?;
                self.receive_ack().await?
            }
            RLPxConnectionState::Receiver(_) => {
                self.receive_auth().await?;
                self.send_ack().await?
            }
            _ => return Err(RLPxError::InvalidState),
        };
        debug!("completed handshake");
        Ok((secrets, self.stream))
    }

    async fn send_auth(&mut self) -> Result<(), RLPxError> {
        let RLPxConnectionState::Initiator(previous_state) = &self.state else {
            return Err(RLPxError::InvalidState);
        };
        let previous_state = previous_state.clone();
        let secret_key: SecretKey = self.signer.clone().into();
        let peer_pk = id2pubkey(previous_state.remote_node_id).ok_or(RLPxError::InvalidPeerId)?;

        let msg = encode_auth_message(
            &secret_key,
            previous_state.nonce,
            &peer_pk,
            &previous_state.ephemeral_key,
        )?;
        self.send_handshake_msg(&msg).await?;

        self.state = RLPxConnectionState::InitiatedAuth(InitiatedAuth {
            remote_node_id: previous_state.remote_node_id,
            local_nonce: previous_state.nonce,
            local_ephemeral_key: previous_state.ephemeral_key,
            local_init_message: msg,
        });
        Ok(())
    }

    async fn receive_auth(&mut self) -> Result<(), RLPxError> {
        let RLPxConnectionState::Receiver(previous_state) = &self.state else {
            return Err(RLPxError::InvalidState);
        };
        let previous_state = previous_state.clone();
        let secret_key: SecretKey = self.signer.clone().into();

        let msg_bytes = self.receive_handshake_msg(PLAIN_AUTH_SIZE).await?;
        let (auth, remote_ephemeral_key) = match decode_plain_auth_message(&secret_key, &msg_bytes)
        {
            Ok(decoded) => decoded,
            // not the fixed pre-EIP-8 layout; the first two bytes are an
            // EIP-8 size prefix
            Err(_) => {
                let msg_bytes = self.finish_eip8_msg(msg_bytes).await?;
                let decoded = decode_auth_message(&secret_key, &msg_bytes[2..], &msg_bytes[..2])?;
                self.state = RLPxConnectionState::ReceivedAuth(ReceivedAuth {
                    local_nonce: previous_state.nonce,
                    local_ephemeral_key: previous_state.ephemeral_key,
                    remote_node_id: decoded.0.node_id,
                    remote_nonce: decoded.0.nonce,
                    remote_ephemeral_key: decoded.1,
                    remote_init_message: msg_bytes,
                });
                return Ok(());
            }
        };

        self.state = RLPxConnectionState::ReceivedAuth(ReceivedAuth {
            local_nonce: previous_state.nonce,
            local_ephemeral_key: previous_state.ephemeral_key,
            remote_node_id: auth.node_id,
            remote_nonce: auth.nonce,
            remote_ephemeral_key,
            remote_init_message: msg_bytes,
        });
        Ok(())
    }

    async fn send_ack(&mut self) -> Result<Secrets, RLPxError> {
        let RLPxConnectionState::ReceivedAuth(previous_state) = &self.state else {
            return Err(RLPxError::InvalidState);
        };
        let previous_state = previous_state.clone();
        let peer_pk = id2pubkey(previous_state.remote_node_id).ok_or(RLPxError::InvalidPeerId)?;

        let msg = encode_ack_message(
            &previous_state.local_ephemeral_key,
            previous_state.local_nonce,
            &peer_pk,
        )?;
        self.send_handshake_msg(&msg).await?;

        Ok(Secrets::for_receiver(previous_state, msg))
    }

    async fn receive_ack(&mut self) -> Result<Secrets, RLPxError> {
        let RLPxConnectionState::InitiatedAuth(previous_state) = &self.state else {
            return Err(RLPxError::InvalidState);
        };
        let previous_state = previous_state.clone();
        let secret_key: SecretKey = self.signer.clone().into();

        let msg_bytes = self.receive_handshake_msg(PLAIN_ACK_SIZE).await?;
        let (ack, msg_bytes) = match decode_plain_ack_message(&secret_key, &msg_bytes) {
            Ok(ack) => (ack, msg_bytes),
            Err(_) => {
                let msg_bytes = self.finish_eip8_msg(msg_bytes).await?;
                let ack = decode_ack_message(&secret_key, &msg_bytes[2..], &msg_bytes[..2])?;
                (ack, msg_bytes)
            }
        };

        let remote_ephemeral_key = ack
            .get_ephemeral_pubkey()
            .ok_or_else(|| RLPxError::InvalidAuth("invalid remote ephemeral key".to_string()))?;
        Ok(Secrets::for_initiator(
            previous_state,
            msg_bytes,
            ack.nonce,
            remote_ephemeral_key,
        ))
    }

    async fn send_handshake_msg(&mut self, msg: &[u8]) -> Result<(), RLPxError> {
        self.stream
            .write_all(msg)
            .await
            .map_err(|_| RLPxError::TransportClosed)?;
        Ok(())
    }

    async fn receive_handshake_msg(&mut self, size: usize) -> Result<Vec<u8>, RLPxError> {
        let mut buf = vec![0; size];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|_| RLPxError::TransportClosed)?;
        Ok(buf)
    }

    /// Extends an already-read plain-sized packet to the full EIP-8 message
    /// announced by its two-byte size prefix.
    async fn finish_eip8_msg(&mut self, mut msg_bytes: Vec<u8>) -> Result<Vec<u8>, RLPxError> {
        let total = u16::from_be_bytes([msg_bytes[0], msg_bytes[1]]) as usize + 2;
        if total < msg_bytes.len() || total > MAX_HANDSHAKE_PACKET_SIZE {
            return Err(RLPxError::InvalidAuth(
                "implausible handshake message size".to_string(),
            ));
        }
        let already_read = msg_bytes.len();
        msg_bytes.resize(total, 0);
        self.stream
            .read_exact(&mut msg_bytes[already_read..])
            .await
            .map_err(|_| RLPxError::TransportClosed)?;
        Ok(msg_bytes)
    }
}

enum RLPxConnectionState {
    Initiator(Initiator),
    Receiver(Receiver),
    InitiatedAuth(InitiatedAuth),
    ReceivedAuth(ReceivedAuth),
}

#[derive(Clone)]
struct Receiver {
    nonce: H256,
    ephemeral_key: SecretKey,
}

#[derive(Clone)]
struct Initiator {
    nonce: H256,
    ephemeral_key: SecretKey,
    remote_node_id: H512,
}

#[derive(Clone)]
struct ReceivedAuth {
    local_nonce: H256,
    local_ephemeral_key: SecretKey,
    remote_node_id: H512,
    remote_nonce: H256,
    remote_ephemeral_key: PublicKey,
    remote_init_message: Vec<u8>,
}

#[derive(Clone)]
struct InitiatedAuth {
    remote_node_id: H512,
    local_nonce: H256,
    local_ephemeral_key: SecretKey,
    local_init_message: Vec<u8>,
}

/// Session secrets derived once per connection, split into the two
/// independently-owned framing directions.
pub(crate) struct Secrets {
    pub remote_node_id: H512,
    pub aes_key: H256,
    pub mac_key: H256,
    /// For session resumption; derived and kept even though resumption is
    /// not offered yet.
    pub token: H256,
    pub egress: FrameState,
    pub ingress: FrameState,
}

impl Secrets {
    fn for_receiver(previous_state: ReceivedAuth, init_message: Vec<u8>) -> Self {
        // keccak256(nonce || initiator-nonce); the remote peer initiated
        let hashed_nonces = Keccak256::digest(
            [previous_state.local_nonce.0, previous_state.remote_nonce.0].concat(),
        )
        .into();

        Self::new(
            previous_state.remote_node_id,
            init_message,
            previous_state.local_nonce,
            previous_state.local_ephemeral_key,
            hashed_nonces,
            previous_state.remote_init_message,
            previous_state.remote_nonce,
            previous_state.remote_ephemeral_key,
        )
    }

    fn for_initiator(
        previous_state: InitiatedAuth,
        remote_init_message: Vec<u8>,
        remote_nonce: H256,
        remote_ephemeral_key: PublicKey,
    ) -> Self {
        // keccak256(nonce || initiator-nonce); the local node initiated
        let hashed_nonces =
            Keccak256::digest([remote_nonce.0, previous_state.local_nonce.0].concat()).into();

        Self::new(
            previous_state.remote_node_id,
            previous_state.local_init_message,
            previous_state.local_nonce,
            previous_state.local_ephemeral_key,
            hashed_nonces,
            remote_init_message,
            remote_nonce,
            remote_ephemeral_key,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        remote_node_id: H512,
        local_init_message: Vec<u8>,
        local_nonce: H256,
        local_ephemeral_key: SecretKey,
        hashed_nonces: [u8; 32],
        remote_init_message: Vec<u8>,
        remote_nonce: H256,
        remote_ephemeral_key: PublicKey,
    ) -> Self {
        let ephemeral_key_secret = ecdh_xchng(&local_ephemeral_key, &remote_ephemeral_key);

        // shared-secret = keccak256(ephemeral-key || keccak256(nonce || initiator-nonce))
        let shared_secret: [u8; 32] =
            Keccak256::digest([ephemeral_key_secret, hashed_nonces].concat()).into();
        // aes-secret = keccak256(ephemeral-key || shared-secret)
        let aes_key =
            H256(Keccak256::digest([ephemeral_key_secret, shared_secret].concat()).into());
        // mac-secret = keccak256(ephemeral-key || aes-secret)
        let mac_key = H256(Keccak256::digest([ephemeral_key_secret, aes_key.0].concat()).into());
        // token = keccak256(shared-secret)
        let token = H256(Keccak256::digest(shared_secret).into());

        // egress-mac = keccak256.init((mac-secret ^ remote-nonce) || own-message)
        let egress_mac = Keccak256::default()
            .chain_update(mac_key ^ remote_nonce)
            .chain_update(&local_init_message);

        // ingress-mac = keccak256.init((mac-secret ^ own-nonce) || remote-message)
        let ingress_mac = Keccak256::default()
            .chain_update(mac_key ^ local_nonce)
            .chain_update(&remote_init_message);

        let ingress_aes = <Aes256Ctr64BE as KeyIvInit>::new(&aes_key.0.into(), &[0; 16].into());
        let egress_aes = ingress_aes.clone();
        Self {
            remote_node_id,
            aes_key,
            mac_key,
            token,
            egress: FrameState::new(mac_key, egress_aes, egress_mac),
            ingress: FrameState::new(mac_key, ingress_aes, ingress_mac),
        }
    }
}

/// Commands accepted by a live connection's actor task.
pub(crate) enum ConnectionCommand {
    /// Write one already-resolved subprotocol frame.
    Send { wire_id: u8, data: Bytes },
    /// Send a Ping; the latch resolves on the next Pong.
    Ping { latch: oneshot::Sender<()> },
    Disconnect { reason: DisconnectReason },
}

/// What the reader task feeds into the actor.
pub(crate) enum InboundEvent {
    Message(Message),
    /// The inbound path is dead: transport EOF or a fatal framing error.
    Closed(RLPxError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireState {
    AwaitHello,
    Active,
    Closed,
}

/// The devp2p wire state machine for one connection.
///
/// Owns the write half and egress framing state, so every outbound frame
/// (application sends, Pong replies, Disconnects) is serialized through this
/// task's mailbox; inbound messages arrive from the reader task in wire
/// order.
pub(crate) struct WireConnection<W> {
    conn_id: String,
    local_node_id: H512,
    peer_node_id: H512,
    client_id: String,
    listen_port: u16,
    initiator: bool,
    registry: SubprotocolRegistry,
    offsets: Arc<OnceLock<OffsetMap>>,
    writer: W,
    egress: FrameState,
    state: WireState,
    hello_sent: bool,
    peer_hello: Option<HelloMessage>,
    awaiting_pong: Option<oneshot::Sender<()>>,
    disconnect_notified: bool,
    on_disconnect: DisconnectListener,
    connections: Weak<Mutex<HashMap<String, ConnectionHandle>>>,
}

impl<W: AsyncWrite + Unpin> WireConnection<W> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conn_id: String,
        local_node_id: H512,
        peer_node_id: H512,
        client_id: String,
        listen_port: u16,
        initiator: bool,
        registry: SubprotocolRegistry,
        offsets: Arc<OnceLock<OffsetMap>>,
        writer: W,
        egress: FrameState,
        on_disconnect: DisconnectListener,
        connections: Weak<Mutex<HashMap<String, ConnectionHandle>>>,
    ) -> Self {
        Self {
            conn_id,
            local_node_id,
            peer_node_id,
            client_id,
            listen_port,
            initiator,
            registry,
            offsets,
            writer,
            egress,
            state: WireState::AwaitHello,
            hello_sent: false,
            peer_hello: None,
            awaiting_pong: None,
            disconnect_notified: false,
            on_disconnect,
            connections,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundEvent>,
        mut commands: mpsc::Receiver<ConnectionCommand>,
    ) {
        debug!(peer = %self.conn_id, "connection task started");
        if self.initiator {
            if let Err(err) = self.send_hello().await {
                self.close_on_error(err).await;
                return;
            }
        }

        while self.state != WireState::Closed {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(InboundEvent::Message(message)) => self.handle_message(message).await,
                    Some(InboundEvent::Closed(err)) => self.close_on_error(err).await,
                    None => self.close_on_error(RLPxError::TransportClosed).await,
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // the service dropped this connection
                    None => self.close(DisconnectReason::ClientQuitting).await,
                },
            }
        }
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Hello(hello) => self.handle_hello(hello).await,
            Message::Disconnect(msg) => {
                debug!(peer = %self.conn_id, reason = %msg.reason(), "received disconnect");
                self.close(msg.reason()).await;
            }
            Message::Ping(_) => {
                if let Err(err) = self.send_message(Message::Pong(PongMessage::new())).await {
                    self.close_on_error(err).await;
                }
            }
            Message::Pong(_) => {
                // resolves the latch of the most recent ping; stray pongs are
                // ignored
                if let Some(latch) = self.awaiting_pong.take() {
                    let _ = latch.send(());
                }
            }
            Message::Subprotocol { id, data } => self.handle_subprotocol_message(id, data).await,
        }
    }

    async fn handle_hello(&mut self, hello: HelloMessage) {
        if self.peer_hello.is_some() {
            return self.disconnect(DisconnectReason::ProtocolBreach).await;
        }
        if hello.node_id.is_zero() {
            return self.disconnect(DisconnectReason::NullNodeIdentity).await;
        }
        if hello.node_id != self.peer_node_id {
            return self.disconnect(DisconnectReason::UnexpectedIdentity).await;
        }
        if hello.node_id == self.local_node_id {
            return self.disconnect(DisconnectReason::ConnectedToSelf).await;
        }
        if hello.p2p_version > P2P_PROTOCOL_VERSION as u64 {
            return self
                .disconnect(DisconnectReason::IncompatibleP2PVersion)
                .await;
        }

        let offsets = match OffsetMap::negotiate(&hello.capabilities, &self.registry) {
            Ok(offsets) => offsets,
            Err(err) => {
                debug!(peer = %self.conn_id, %err, "capability negotiation failed");
                return self.disconnect(DisconnectReason::ProtocolBreach).await;
            }
        };

        // both ends may say Hello at once; only reply if we have not spoken yet
        if !self.hello_sent {
            if let Err(err) = self.send_hello().await {
                return self.close_on_error(err).await;
            }
        }

        info!(peer = %self.conn_id, client = %hello.client_id, "hello exchanged");
        let mut seen = HashSet::new();
        let mut selected: Vec<usize> = offsets.ranges().iter().map(|r| r.subprotocol).collect();
        selected.retain(|index| seen.insert(*index));
        self.peer_hello = Some(hello);
        self.state = WireState::Active;
        let _ = self.offsets.set(offsets);

        for index in selected {
            if let Some(subprotocol) = self.registry.get(index) {
                subprotocol.new_peer_connection(&self.conn_id);
            }
        }
    }

    async fn handle_subprotocol_message(&mut self, wire_id: u8, data: Bytes) {
        if self.state != WireState::Active {
            return self.disconnect(DisconnectReason::ProtocolBreach).await;
        }
        let resolved = self
            .offsets
            .get()
            .and_then(|offsets| offsets.lookup_inbound(wire_id))
            .map(|(range, local_id)| (range.clone(), local_id));
        match resolved {
            Some((range, local_id)) => {
                if let Some(subprotocol) = self.registry.get(range.subprotocol) {
                    subprotocol.handle(&range.capability, local_id, data, &self.conn_id);
                }
            }
            None => {
                debug!(peer = %self.conn_id, wire_id, "message id outside negotiated ranges");
                self.disconnect(DisconnectReason::ProtocolBreach).await;
            }
        }
    }

    async fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Send { wire_id, data } => {
                if self.state != WireState::Active {
                    return;
                }
                if let Err(err) = self
                    .send_message(Message::Subprotocol { id: wire_id, data })
                    .await
                {
                    self.close_on_error(err).await;
                }
            }
            ConnectionCommand::Ping { latch } => {
                if self.state != WireState::Active {
                    // dropping the latch reports the cancellation
                    return;
                }
                match self.send_message(Message::Ping(PingMessage::new())).await {
                    // replaces (and thereby cancels) any previous latch
                    Ok(()) => self.awaiting_pong = Some(latch),
                    Err(err) => self.close_on_error(err).await,
                }
            }
            ConnectionCommand::Disconnect { reason } => self.disconnect(reason).await,
        }
    }

    async fn send_hello(&mut self) -> Result<(), RLPxError> {
        let hello = HelloMessage::new(
            self.client_id.clone(),
            self.registry.capabilities(),
            self.listen_port,
            self.local_node_id,
        );
        self.send_message(Message::Hello(hello)).await?;
        self.hello_sent = true;
        Ok(())
    }

    async fn send_message(&mut self, message: Message) -> Result<(), RLPxError> {
        let mut frame_data = vec![];
        message.encode(&mut frame_data)?;
        let frame = self.egress.encode(frame_data);
        self.writer
            .write_all(&frame)
            .await
            .map_err(|_| RLPxError::TransportClosed)
    }

    /// Sends a Disconnect with `reason`, then tears the connection down.
    async fn disconnect(&mut self, reason: DisconnectReason) {
        if self.state == WireState::Closed {
            return;
        }
        // best effort; the peer may already be gone
        let _ = self
            .send_message(Message::Disconnect(DisconnectMessage::new(reason)))
            .await;
        self.close(reason).await;
    }

    async fn close_on_error(&mut self, err: RLPxError) {
        if self.state == WireState::Closed {
            return;
        }
        warn!(peer = %self.conn_id, %err, "closing connection");
        match err {
            // nothing left to write a Disconnect into
            RLPxError::TransportClosed => self.close(DisconnectReason::NetworkError).await,
            _ => self.disconnect(DisconnectReason::ProtocolBreach).await,
        }
    }

    async fn close(&mut self, reason: DisconnectReason) {
        if self.state == WireState::Closed {
            return;
        }
        self.state = WireState::Closed;
        // dropping the sender cancels an outstanding pong latch
        self.awaiting_pong.take();
        if !self.disconnect_notified {
            self.disconnect_notified = true;
            (self.on_disconnect)(&self.conn_id, reason);
        }
        if let Some(connections) = self.connections.upgrade() {
            connections.lock().await.remove(&self.conn_id);
        }
        let _ = self.writer.shutdown().await;
    }
}

/// Reader half of a connection: stitches raw bytes into frames and feeds
/// decoded messages to the actor, strictly in arrival order.
pub(crate) async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    mut ingress: FrameState,
    events: mpsc::Sender<InboundEvent>,
) {
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        match ingress.try_decode(&mut buffer) {
            Ok(frame_data) => {
                let message = u8::decode_unfinished(&frame_data)
                    .and_then(|(msg_id, msg_data)| Message::decode(msg_id, msg_data));
                match message {
                    Ok(message) => {
                        if events.send(InboundEvent::Message(message)).await.is_err() {
                            // actor is gone; nothing to deliver to
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = events.send(InboundEvent::Closed(err.into())).await;
                        return;
                    }
                }
            }
            Err(RLPxError::ShortFrame) => match reader.read_buf(&mut buffer).await {
                Ok(0) | Err(_) => {
                    let _ = events
                        .send(InboundEvent::Closed(RLPxError::TransportClosed))
                        .await;
                    return;
                }
                Ok(_) => {}
            },
            Err(err) => {
                let _ = events.send(InboundEvent::Closed(err)).await;
                return;
            }
        }
    }
}
