use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use bytes::Bytes;
use ethereum_types::H512;
use k256::{ecdsa::SigningKey, elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, Mutex},
};
use tracing::{debug, info};

use rlpx::{
    connection::{read_loop, ConnectionCommand, RLPxConnection, Secrets, WireConnection},
    multiplex::OffsetMap,
};

pub mod rlpx;
pub mod subprotocol;

pub use rlpx::error::RLPxError;
pub use rlpx::p2p::{Capability, DisconnectReason, HelloMessage};
pub use subprotocol::{Subprotocol, SubprotocolRegistry};

/// Invoked exactly once per connection when it closes, whatever the cause.
pub type DisconnectListener = Arc<dyn Fn(&str, DisconnectReason) + Send + Sync>;

const COMMAND_CHANNEL_SIZE: usize = 32;
const INBOUND_CHANNEL_SIZE: usize = 32;

pub fn node_id_from_signing_key(signer: &SigningKey) -> H512 {
    let public_key = PublicKey::from(signer.verifying_key());
    let encoded = public_key.to_encoded_point(false);
    H512::from_slice(&encoded.as_bytes()[1..])
}

/// Handle kept in the connection registry; shared with application senders.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub(crate) peer_node_id: H512,
    /// Set exactly once, by the connection task, when the peer Hello is in.
    pub(crate) offsets: Arc<OnceLock<OffsetMap>>,
    pub(crate) commands: mpsc::Sender<ConnectionCommand>,
}

/// The RLPx/devp2p service: owns the connection registry and gives
/// applications a uniform way to dial, accept, send and broadcast.
pub struct Network {
    signer: SigningKey,
    local_node_id: H512,
    client_id: String,
    listen_port: u16,
    registry: SubprotocolRegistry,
    on_disconnect: DisconnectListener,
    connections: Arc<Mutex<HashMap<String, ConnectionHandle>>>,
    started: AtomicBool,
    next_conn_seq: AtomicU64,
}

impl Network {
    pub fn new(
        signer: SigningKey,
        client_id: String,
        listen_port: u16,
        registry: SubprotocolRegistry,
    ) -> Self {
        let local_node_id = node_id_from_signing_key(&signer);
        Self {
            signer,
            local_node_id,
            client_id,
            listen_port,
            registry,
            on_disconnect: Arc::new(|conn_id, reason| {
                debug!(peer = %conn_id, %reason, "connection closed");
            }),
            connections: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicBool::new(false),
            next_conn_seq: AtomicU64::new(0),
        }
    }

    pub fn with_disconnect_listener(mut self, listener: DisconnectListener) -> Self {
        self.on_disconnect = listener;
        self
    }

    pub fn node_id(&self) -> H512 {
        self.local_node_id
    }

    /// Starts serving inbound connections on `tcp_addr`. Idempotent.
    pub async fn start(self: &Arc<Self>, tcp_addr: SocketAddr) -> Result<(), RLPxError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = TcpListener::bind(tcp_addr).await.map_err(|err| {
            RLPxError::ConnectionError(format!("could not bind {tcp_addr}: {err}"))
        })?;
        info!("listening for peers at {tcp_addr}");
        tokio::spawn(serve_requests(self.clone(), listener));
        Ok(())
    }

    /// Dials a peer and runs the initiator handshake.
    /// Returns the id of the freshly registered connection.
    pub async fn connect(
        &self,
        peer_node_id: H512,
        addr: SocketAddr,
    ) -> Result<String, RLPxError> {
        self.ensure_started()?;
        let stream = TcpStream::connect(addr).await.map_err(|err| {
            RLPxError::ConnectionError(format!("could not dial {addr}: {err}"))
        })?;
        self.initiate(peer_node_id, stream).await
    }

    /// Runs the initiator handshake over an already-open stream.
    pub async fn initiate<S>(&self, peer_node_id: H512, stream: S) -> Result<String, RLPxError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.ensure_started()?;
        let connection = RLPxConnection::initiator(self.signer.clone(), peer_node_id, stream);
        let (secrets, stream) = connection.handshake().await?;
        self.spawn_connection(secrets, stream, true).await
    }

    /// Runs the responder handshake over an incoming stream.
    pub async fn accept<S>(&self, stream: S) -> Result<String, RLPxError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.ensure_started()?;
        let connection = RLPxConnection::receiver(self.signer.clone(), stream);
        let (secrets, stream) = connection.handshake().await?;
        self.spawn_connection(secrets, stream, false).await
    }

    /// Enqueues one subprotocol message for a specific peer.
    pub async fn send(
        &self,
        conn_id: &str,
        capability: &Capability,
        msg_id: u8,
        data: Bytes,
    ) -> Result<(), RLPxError> {
        self.ensure_started()?;
        let handle = self
            .connections
            .lock()
            .await
            .get(conn_id)
            .cloned()
            .ok_or_else(|| RLPxError::UnknownConnection(conn_id.to_string()))?;
        let wire_id = handle
            .offsets
            .get()
            .and_then(|offsets| offsets.lookup_outbound(&self.registry, capability, msg_id))
            .ok_or(RLPxError::SubprotocolNotNegotiated)?;
        handle
            .commands
            .send(ConnectionCommand::Send { wire_id, data })
            .await
            .map_err(|_| RLPxError::TransportClosed)
    }

    /// Sends one subprotocol message to every connection that negotiated the
    /// capability; peers without it are skipped.
    pub async fn broadcast(
        &self,
        capability: &Capability,
        msg_id: u8,
        data: Bytes,
    ) -> Result<(), RLPxError> {
        self.ensure_started()?;
        let snapshot: Vec<(String, ConnectionHandle)> = self
            .connections
            .lock()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();
        for (conn_id, handle) in snapshot {
            let Some(wire_id) = handle
                .offsets
                .get()
                .and_then(|offsets| offsets.lookup_outbound(&self.registry, capability, msg_id))
            else {
                continue;
            };
            let command = ConnectionCommand::Send {
                wire_id,
                data: data.clone(),
            };
            if handle.commands.send(command).await.is_err() {
                debug!(peer = %conn_id, "skipping broadcast to closing connection");
            }
        }
        Ok(())
    }

    /// Closes a connection with the given reason. Idempotent: disconnecting
    /// an unknown or already-closed connection is a no-op.
    pub async fn disconnect(
        &self,
        conn_id: &str,
        reason: DisconnectReason,
    ) -> Result<(), RLPxError> {
        self.ensure_started()?;
        let handle = self.connections.lock().await.get(conn_id).cloned();
        if let Some(handle) = handle {
            let _ = handle
                .commands
                .send(ConnectionCommand::Disconnect { reason })
                .await;
        }
        Ok(())
    }

    /// Sends a Ping; the returned receiver resolves when the next Pong
    /// arrives, or errors if the connection closes first.
    pub async fn send_ping(&self, conn_id: &str) -> Result<oneshot::Receiver<()>, RLPxError> {
        self.ensure_started()?;
        let handle = self
            .connections
            .lock()
            .await
            .get(conn_id)
            .cloned()
            .ok_or_else(|| RLPxError::UnknownConnection(conn_id.to_string()))?;
        let (latch, resolved) = oneshot::channel();
        handle
            .commands
            .send(ConnectionCommand::Ping { latch })
            .await
            .map_err(|_| RLPxError::TransportClosed)?;
        Ok(resolved)
    }

    /// Snapshot of the live connections: `(connection id, peer node id)`.
    pub async fn peers(&self) -> Vec<(String, H512)> {
        self.connections
            .lock()
            .await
            .iter()
            .map(|(conn_id, handle)| (conn_id.clone(), handle.peer_node_id))
            .collect()
    }

    fn ensure_started(&self) -> Result<(), RLPxError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RLPxError::ServiceNotStarted)
        }
    }

    async fn spawn_connection<S>(
        &self,
        secrets: Secrets,
        stream: S,
        initiator: bool,
    ) -> Result<String, RLPxError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let seq = self.next_conn_seq.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!(
            "{}-{seq}",
            hex::encode(&secrets.remote_node_id.as_bytes()[..4])
        );
        let offsets = Arc::new(OnceLock::new());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let (read_half, write_half) = tokio::io::split(stream);

        let handle = ConnectionHandle {
            peer_node_id: secrets.remote_node_id,
            offsets: offsets.clone(),
            commands: command_tx,
        };
        self.connections
            .lock()
            .await
            .insert(conn_id.clone(), handle);

        let actor = WireConnection::new(
            conn_id.clone(),
            self.local_node_id,
            secrets.remote_node_id,
            self.client_id.clone(),
            self.listen_port,
            initiator,
            self.registry.clone(),
            offsets,
            write_half,
            secrets.egress,
            self.on_disconnect.clone(),
            Arc::downgrade(&self.connections),
        );
        tokio::spawn(read_loop(read_half, secrets.ingress, event_tx));
        tokio::spawn(actor.run(event_rx, command_rx));

        info!(peer = %conn_id, "connection established");
        Ok(conn_id)
    }
}

async fn serve_requests(network: Arc<Network>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("incoming connection from {peer_addr}");
                let network = network.clone();
                tokio::spawn(async move {
                    if let Err(err) = network.accept(stream).await {
                        debug!("inbound handshake with {peer_addr} failed: {err}");
                    }
                });
            }
            Err(err) => debug!("accept failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex as StdMutex, time::Duration};

    use bytes::BytesMut;
    use ethwire_rlp::decode::RLPDecode;
    use k256::ecdsa::SigningKey;
    use rand::rngs::OsRng;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    use crate::rlpx::{
        frame::FrameState,
        message::Message,
        p2p::{DisconnectMessage, PongMessage},
    };

    use super::*;

    struct TestProtocol {
        capability: Capability,
        space: u8,
        connected: StdMutex<Vec<String>>,
        received: StdMutex<Vec<(Capability, u8, Bytes, String)>>,
    }

    impl TestProtocol {
        fn new(name: &str, version: u8, space: u8) -> Arc<Self> {
            Arc::new(Self {
                capability: Capability::new(name, version),
                space,
                connected: StdMutex::new(Vec::new()),
                received: StdMutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<(Capability, u8, Bytes, String)> {
            self.received.lock().unwrap().clone()
        }
    }

    impl Subprotocol for TestProtocol {
        fn capabilities(&self) -> Vec<Capability> {
            vec![self.capability.clone()]
        }

        fn supports(&self, capability: &Capability) -> bool {
            *capability == self.capability
        }

        fn message_space(&self, _version: u8) -> u8 {
            self.space
        }

        fn new_peer_connection(&self, conn_id: &str) {
            self.connected.lock().unwrap().push(conn_id.to_string());
        }

        fn handle(&self, capability: &Capability, msg_id: u8, data: Bytes, conn_id: &str) {
            self.received.lock().unwrap().push((
                capability.clone(),
                msg_id,
                data,
                conn_id.to_string(),
            ));
        }
    }

    // A scripted peer speaking raw devp2p frames, for driving the wire FSM
    // into specific states.
    struct RawPeer {
        stream: DuplexStream,
        egress: FrameState,
        ingress: FrameState,
        buffer: BytesMut,
        node_id: H512,
    }

    impl RawPeer {
        async fn accept(signer: SigningKey, stream: DuplexStream) -> Self {
            let node_id = node_id_from_signing_key(&signer);
            let connection = RLPxConnection::receiver(signer, stream);
            let (secrets, stream) = connection.handshake().await.unwrap();
            Self {
                stream,
                egress: secrets.egress,
                ingress: secrets.ingress,
                buffer: BytesMut::new(),
                node_id,
            }
        }

        async fn send(&mut self, message: Message) {
            let mut frame_data = vec![];
            message.encode(&mut frame_data).unwrap();
            let frame = self.egress.encode(frame_data);
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            loop {
                match self.ingress.try_decode(&mut self.buffer) {
                    Ok(frame_data) => {
                        let (msg_id, msg_data) = u8::decode_unfinished(&frame_data).unwrap();
                        return Message::decode(msg_id, msg_data).unwrap();
                    }
                    Err(RLPxError::ShortFrame) => {
                        let read = self.stream.read_buf(&mut self.buffer).await.unwrap();
                        assert_ne!(read, 0, "peer closed the stream");
                    }
                    Err(err) => panic!("frame decode failed: {err}"),
                }
            }
        }

        fn hello(&self, capabilities: Vec<Capability>) -> Message {
            Message::Hello(HelloMessage::new(
                "rawpeer/0.1.0".to_string(),
                capabilities,
                30303,
                self.node_id,
            ))
        }
    }

    fn test_network(registry: SubprotocolRegistry) -> (Arc<Network>, SigningKey) {
        let signer = SigningKey::random(&mut OsRng);
        let network = Arc::new(Network::new(
            signer.clone(),
            "ethwire/test".to_string(),
            30303,
            registry,
        ));
        (network, signer)
    }

    async fn start(network: &Arc<Network>) {
        network
            .start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_negotiated(network: &Arc<Network>, conn_id: &str) {
        for _ in 0..200 {
            let negotiated = network
                .connections
                .lock()
                .await
                .get(conn_id)
                .is_some_and(|handle| handle.offsets.get().is_some());
            if negotiated {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("connection {conn_id} never negotiated");
    }

    /// Dials `network` through an in-memory stream and returns the raw far
    /// end plus the local connection id.
    async fn dial_raw(network: &Arc<Network>, raw_signer: SigningKey) -> (RawPeer, String) {
        let raw_id = node_id_from_signing_key(&raw_signer);
        let (local, remote) = duplex(64 * 1024);
        let (conn_id, raw) = tokio::join!(
            network.initiate(raw_id, local),
            RawPeer::accept(raw_signer, remote)
        );
        (raw, conn_id.unwrap())
    }

    #[tokio::test]
    async fn calls_before_start_are_rejected() {
        let (network, _) = test_network(SubprotocolRegistry::new());

        assert!(matches!(
            network
                .send(
                    "nope",
                    &Capability::new("eth", 63),
                    0,
                    Bytes::from_static(&[1])
                )
                .await,
            Err(RLPxError::ServiceNotStarted)
        ));
        assert!(matches!(
            network.broadcast(&Capability::new("eth", 63), 0, Bytes::new()).await,
            Err(RLPxError::ServiceNotStarted)
        ));
        assert!(matches!(
            network
                .connect(H512([1; 64]), "127.0.0.1:1".parse().unwrap())
                .await,
            Err(RLPxError::ServiceNotStarted)
        ));
    }

    #[tokio::test]
    async fn hello_exchange_between_two_nodes() {
        let eth_a = TestProtocol::new("eth", 63, 17);
        let mut registry_a = SubprotocolRegistry::new();
        registry_a.register(eth_a.clone());
        let (network_a, _) = test_network(registry_a);
        start(&network_a).await;

        let eth_b = TestProtocol::new("eth", 63, 17);
        let mut registry_b = SubprotocolRegistry::new();
        registry_b.register(eth_b.clone());
        let (network_b, _) = test_network(registry_b);
        start(&network_b).await;

        let (stream_a, stream_b) = duplex(64 * 1024);
        let (conn_a, conn_b) = tokio::join!(
            network_a.initiate(network_b.node_id(), stream_a),
            network_b.accept(stream_b)
        );
        let conn_a = conn_a.unwrap();
        let conn_b = conn_b.unwrap();

        wait_negotiated(&network_a, &conn_a).await;
        wait_negotiated(&network_b, &conn_b).await;
        assert_eq!(eth_a.connected.lock().unwrap().as_slice(), &[conn_a.clone()]);
        assert_eq!(eth_b.connected.lock().unwrap().as_slice(), &[conn_b.clone()]);

        // a's local id 0 must arrive at b as local id 0
        network_a
            .send(
                &conn_a,
                &Capability::new("eth", 63),
                0,
                Bytes::from_static(&[0xc1, 0x0a]),
            )
            .await
            .unwrap();
        wait_for(|| !eth_b.received().is_empty()).await;

        let received = eth_b.received();
        assert_eq!(received.len(), 1);
        let (capability, msg_id, data, conn_id) = &received[0];
        assert_eq!(*capability, Capability::new("eth", 63));
        assert_eq!(*msg_id, 0);
        assert_eq!(data.as_ref(), &[0xc1, 0x0a]);
        assert_eq!(conn_id, &conn_b);
    }

    #[tokio::test]
    async fn self_connect_is_rejected() {
        let (network, signer) = test_network(SubprotocolRegistry::new());
        start(&network).await;

        // a dialed self-connection ends up handshaking with our own key
        let (local, remote) = duplex(64 * 1024);
        let (conn_id, mut raw) = tokio::join!(
            network.initiate(network.node_id(), local),
            RawPeer::accept(signer, remote)
        );
        let _conn_id = conn_id.unwrap();

        assert!(matches!(raw.recv().await, Message::Hello(_)));
        let hello = raw.hello(vec![]);
        raw.send(hello).await;

        match raw.recv().await {
            Message::Disconnect(msg) => {
                assert_eq!(msg.reason(), DisconnectReason::ConnectedToSelf);
                assert_eq!(msg.reason().code(), 10);
            }
            other => panic!("expected disconnect, got {other}"),
        }
    }

    #[tokio::test]
    async fn p2p_version_above_ours_is_rejected() {
        let (network, _) = test_network(SubprotocolRegistry::new());
        start(&network).await;

        let (mut raw, _conn_id) = dial_raw(&network, SigningKey::random(&mut OsRng)).await;
        assert!(matches!(raw.recv().await, Message::Hello(_)));

        let mut hello = HelloMessage::new("future/1.0".to_string(), vec![], 30303, raw.node_id);
        hello.p2p_version = 6;
        raw.send(Message::Hello(hello)).await;

        match raw.recv().await {
            Message::Disconnect(msg) => {
                assert_eq!(msg.reason(), DisconnectReason::IncompatibleP2PVersion);
                assert_eq!(msg.reason().code(), 6);
            }
            other => panic!("expected disconnect, got {other}"),
        }
    }

    #[tokio::test]
    async fn subprotocol_message_before_hello_is_a_breach() {
        let (network, _) = test_network(SubprotocolRegistry::new());
        start(&network).await;

        let (mut raw, _conn_id) = dial_raw(&network, SigningKey::random(&mut OsRng)).await;
        assert!(matches!(raw.recv().await, Message::Hello(_)));

        raw.send(Message::Subprotocol {
            id: 17,
            data: Bytes::from_static(&[0xc0]),
        })
        .await;

        match raw.recv().await {
            Message::Disconnect(msg) => {
                assert_eq!(msg.reason(), DisconnectReason::ProtocolBreach)
            }
            other => panic!("expected disconnect, got {other}"),
        }
    }

    #[tokio::test]
    async fn capability_negotiation_follows_peer_order() {
        let eth = TestProtocol::new("eth", 63, 17);
        let les = TestProtocol::new("les", 2, 21);
        let mut registry = SubprotocolRegistry::new();
        registry.register(eth.clone());
        registry.register(les.clone());
        let (network, _) = test_network(registry);
        start(&network).await;

        let (mut raw, conn_id) = dial_raw(&network, SigningKey::random(&mut OsRng)).await;
        assert!(matches!(raw.recv().await, Message::Hello(_)));
        let hello = raw.hello(vec![Capability::new("les", 2), Capability::new("eth", 63)]);
        raw.send(hello).await;
        wait_negotiated(&network, &conn_id).await;

        // les/2 owns [17, 38], eth/63 owns [39, 56]
        raw.send(Message::Subprotocol {
            id: 20,
            data: Bytes::from_static(&[0xc0]),
        })
        .await;
        raw.send(Message::Subprotocol {
            id: 50,
            data: Bytes::from_static(&[0xc0]),
        })
        .await;
        wait_for(|| !les.received().is_empty() && !eth.received().is_empty()).await;

        let les_received = les.received();
        assert_eq!(les_received[0].0, Capability::new("les", 2));
        assert_eq!(les_received[0].1, 3);
        let eth_received = eth.received();
        assert_eq!(eth_received[0].0, Capability::new("eth", 63));
        assert_eq!(eth_received[0].1, 11);

        // outbound mapping mirrors the inbound one
        network
            .send(
                &conn_id,
                &Capability::new("eth", 63),
                0,
                Bytes::from_static(&[0xc0]),
            )
            .await
            .unwrap();
        match raw.recv().await {
            Message::Subprotocol { id, .. } => assert_eq!(id, 39),
            other => panic!("expected subprotocol message, got {other}"),
        }

        // a send for a capability the peer never advertised fails synchronously
        assert!(matches!(
            network
                .send(&conn_id, &Capability::new("snap", 1), 0, Bytes::new())
                .await,
            Err(RLPxError::SubprotocolNotNegotiated)
        ));

        // an id beyond every negotiated range is a breach
        raw.send(Message::Subprotocol {
            id: 100,
            data: Bytes::from_static(&[0xc0]),
        })
        .await;
        match raw.recv().await {
            Message::Disconnect(msg) => {
                assert_eq!(msg.reason(), DisconnectReason::ProtocolBreach)
            }
            other => panic!("expected disconnect, got {other}"),
        }
    }

    #[tokio::test]
    async fn ping_latch_resolves_on_next_pong_only() {
        let eth = TestProtocol::new("eth", 63, 17);
        let mut registry = SubprotocolRegistry::new();
        registry.register(eth.clone());
        let (network, _) = test_network(registry);
        start(&network).await;

        let (mut raw, conn_id) = dial_raw(&network, SigningKey::random(&mut OsRng)).await;
        assert!(matches!(raw.recv().await, Message::Hello(_)));
        let hello = raw.hello(vec![Capability::new("eth", 63)]);
        raw.send(hello).await;
        wait_negotiated(&network, &conn_id).await;

        let mut resolved = network.send_ping(&conn_id).await.unwrap();
        match raw.recv().await {
            Message::Ping(_) => {}
            other => panic!("expected ping, got {other}"),
        }

        // unrelated traffic must not resolve the latch
        raw.send(Message::Subprotocol {
            id: 17,
            data: Bytes::from_static(&[0xc0]),
        })
        .await;
        wait_for(|| !eth.received().is_empty()).await;
        assert!(matches!(
            resolved.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));

        raw.send(Message::Pong(PongMessage::new())).await;
        resolved.await.unwrap();

        // a stray pong with no outstanding ping is ignored
        raw.send(Message::Pong(PongMessage::new())).await;
        raw.send(Message::Subprotocol {
            id: 18,
            data: Bytes::from_static(&[0xc0]),
        })
        .await;
        wait_for(|| eth.received().len() == 2).await;
    }

    #[tokio::test]
    async fn ping_latch_is_cancelled_when_the_peer_leaves() {
        let eth = TestProtocol::new("eth", 63, 17);
        let mut registry = SubprotocolRegistry::new();
        registry.register(eth);
        let (network, _) = test_network(registry);
        start(&network).await;

        let (mut raw, conn_id) = dial_raw(&network, SigningKey::random(&mut OsRng)).await;
        assert!(matches!(raw.recv().await, Message::Hello(_)));
        let hello = raw.hello(vec![Capability::new("eth", 63)]);
        raw.send(hello).await;
        wait_negotiated(&network, &conn_id).await;

        let resolved = network.send_ping(&conn_id).await.unwrap();
        assert!(matches!(raw.recv().await, Message::Ping(_)));

        raw.send(Message::Disconnect(DisconnectMessage::new(
            DisconnectReason::ClientQuitting,
        )))
        .await;
        assert!(resolved.await.is_err());
    }

    #[tokio::test]
    async fn broadcast_uses_each_connections_ranges() {
        let eth = TestProtocol::new("eth", 63, 17);
        let les = TestProtocol::new("les", 2, 21);
        let mut registry = SubprotocolRegistry::new();
        registry.register(eth);
        registry.register(les);
        let (network, _) = test_network(registry);
        start(&network).await;

        let (mut raw_a, conn_a) = dial_raw(&network, SigningKey::random(&mut OsRng)).await;
        assert!(matches!(raw_a.recv().await, Message::Hello(_)));
        let hello = raw_a.hello(vec![Capability::new("eth", 63)]);
        raw_a.send(hello).await;
        wait_negotiated(&network, &conn_a).await;

        let (mut raw_b, conn_b) = dial_raw(&network, SigningKey::random(&mut OsRng)).await;
        assert!(matches!(raw_b.recv().await, Message::Hello(_)));
        let hello = raw_b.hello(vec![Capability::new("les", 2), Capability::new("eth", 63)]);
        raw_b.send(hello).await;
        wait_negotiated(&network, &conn_b).await;

        network
            .broadcast(&Capability::new("eth", 63), 0, Bytes::from_static(&[0x01]))
            .await
            .unwrap();

        // each peer sees its own eth/63 range base
        match raw_a.recv().await {
            Message::Subprotocol { id, data } => {
                assert_eq!(id, 17);
                assert_eq!(data.as_ref(), &[0x01]);
            }
            other => panic!("expected subprotocol message, got {other}"),
        }
        match raw_b.recv().await {
            Message::Subprotocol { id, data } => {
                assert_eq!(id, 39);
                assert_eq!(data.as_ref(), &[0x01]);
            }
            other => panic!("expected subprotocol message, got {other}"),
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_notifies_once() {
        let notifications = Arc::new(StdMutex::new(Vec::new()));
        let listener: DisconnectListener = {
            let notifications = notifications.clone();
            Arc::new(move |conn_id: &str, reason: DisconnectReason| {
                notifications
                    .lock()
                    .unwrap()
                    .push((conn_id.to_string(), reason));
            })
        };

        let (signer, registry) = (SigningKey::random(&mut OsRng), SubprotocolRegistry::new());
        let network = Arc::new(
            Network::new(signer, "ethwire/test".to_string(), 30303, registry)
                .with_disconnect_listener(listener),
        );
        start(&network).await;

        let (mut raw, conn_id) = dial_raw(&network, SigningKey::random(&mut OsRng)).await;
        assert!(matches!(raw.recv().await, Message::Hello(_)));
        let hello = raw.hello(vec![]);
        raw.send(hello).await;
        wait_negotiated(&network, &conn_id).await;

        network
            .disconnect(&conn_id, DisconnectReason::TooManyPeers)
            .await
            .unwrap();
        match raw.recv().await {
            Message::Disconnect(msg) => {
                assert_eq!(msg.reason(), DisconnectReason::TooManyPeers)
            }
            other => panic!("expected disconnect, got {other}"),
        }

        wait_for(|| notifications.lock().unwrap().len() == 1).await;
        // the registry entry is gone and a second disconnect is a no-op
        for _ in 0..200 {
            if network.peers().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(network.peers().await.is_empty());
        network
            .disconnect(&conn_id, DisconnectReason::TooManyPeers)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(notifications.lock().unwrap().len(), 1);
        assert_eq!(
            notifications.lock().unwrap()[0],
            (conn_id.clone(), DisconnectReason::TooManyPeers)
        );
    }
}
