// halink-api: Wire codec and upstream connection for the Home Assistant WebSocket API

pub mod codec;
pub mod connection;
pub mod error;

pub use codec::{Category, EventEnvelope, EventHeader, Inbound, Request, Response, UpstreamError};
pub use connection::{ConnectionState, HandshakeInfo, UpstreamConfig, UpstreamConnection};
pub use error::Error;
