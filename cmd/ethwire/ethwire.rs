use std::{net::SocketAddr, str::FromStr as _, sync::Arc};

use ethereum_types::H512;
use ethwire_p2p::{node_id_from_signing_key, Network, SubprotocolRegistry};
use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use tracing::{error, info};
use tracing_subscriber::{filter::Directive, EnvFilter, FmtSubscriber};

mod cli;

#[tokio::main]
async fn main() {
    let matches = cli::cli().get_matches();

    let log_level = matches
        .get_one::<String>("log.level")
        .expect("log.level has a default value");
    let log_filter = EnvFilter::builder()
        .with_default_directive(
            Directive::from_str(log_level).expect("not a supported log level"),
        )
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let tcp_addr = matches
        .get_one::<String>("p2p.addr")
        .expect("p2p.addr has a default value");
    let tcp_port = matches
        .get_one::<String>("p2p.port")
        .expect("p2p.port has a default value");
    let client_id = matches
        .get_one::<String>("client.id")
        .expect("client.id has a default value")
        .clone();
    let listen_addr: SocketAddr = format!("{tcp_addr}:{tcp_port}")
        .parse()
        .expect("not a valid p2p address");

    let signer = SigningKey::random(&mut OsRng);
    let node_id = node_id_from_signing_key(&signer);
    info!("local node id: {}", hex::encode(node_id));

    let network = Arc::new(Network::new(
        signer,
        client_id,
        listen_addr.port(),
        SubprotocolRegistry::new(),
    ));
    if let Err(err) = network.start(listen_addr).await {
        error!("could not start p2p service: {err}");
        return;
    }

    if let (Some(peer_id), Some(peer_addr)) = (
        matches.get_one::<String>("peer.id"),
        matches.get_one::<String>("peer.addr"),
    ) {
        let peer_addr: SocketAddr = peer_addr.parse().expect("not a valid peer address");
        let peer_id = parse_node_id(peer_id).expect("not a valid peer node id");
        match network.connect(peer_id, peer_addr).await {
            Ok(conn_id) => info!(peer = %conn_id, "connected to {peer_addr}"),
            Err(err) => error!("could not connect to {peer_addr}: {err}"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .expect("could not listen for shutdown signal");
    info!("shutting down");
}

fn parse_node_id(raw: &str) -> Option<H512> {
    let bytes = hex::decode(raw.trim_start_matches("0x")).ok()?;
    (bytes.len() == 64).then(|| H512::from_slice(&bytes))
}
