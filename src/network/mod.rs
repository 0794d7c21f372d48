//! Network communication layer.
//!
//! Components talk to each other only through the [`Transport`] trait.
//! [`InMemoryNetwork`] connects nodes inside one process (tests, embedded
//! clusters); [`TcpTransport`] and [`NetworkServer`] carry the same
//! [`Message`]s over TCP.

pub mod local;
pub mod rpc;
pub mod server;
pub mod transport;

pub use local::{InMemoryNetwork, LocalTransport};
pub use rpc::{decode_message, encode_message, frame_message, Message};
pub use server::{NetworkServer, TcpTransport};
pub use transport::{MessageHandler, Transport};
