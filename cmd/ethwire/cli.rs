use clap::{Arg, ArgAction, Command};
use tracing::Level;

pub fn cli() -> Command {
    Command::new("ethwire")
        .about("devp2p (RLPx) networking node")
        .arg(
            Arg::new("p2p.addr")
                .long("p2p.addr")
                .default_value("0.0.0.0")
                .value_name("ADDRESS")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("p2p.port")
                .long("p2p.port")
                .default_value("30303")
                .value_name("PORT")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("log.level")
                .long("log.level")
                .default_value(Level::INFO.as_str())
                .value_name("LOG_LEVEL")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("client.id")
                .long("client.id")
                .default_value("ethwire/0.1.0")
                .value_name("CLIENT_ID")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("peer.id")
                .long("peer.id")
                .value_name("NODE_ID_HEX")
                .help("Node id (128 hex chars) of a peer to dial on startup")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("peer.addr")
                .long("peer.addr")
                .value_name("ADDRESS:PORT")
                .help("TCP address of the peer to dial on startup")
                .action(ArgAction::Set),
        )
}
