pub mod connection;
pub mod error;
pub(crate) mod frame;
pub(crate) mod handshake;
pub mod message;
pub(crate) mod multiplex;
pub mod p2p;
pub(crate) mod utils;
