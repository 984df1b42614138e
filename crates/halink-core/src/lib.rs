// halink-core: Multiplexed request/response and event fan-out over one upstream socket.

pub mod config;
pub mod error;
pub mod filter;
pub mod reconnect;
pub mod session;
pub mod stream;

mod correlator;
mod fanout;
mod mailbox;
mod registry;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::SessionConfig;
pub use error::CoreError;
pub use fanout::{ConsumerId, ConsumerInfo};
pub use filter::{EventFilter, Selector};
pub use reconnect::{ReconnectPhase, ReconnectPolicy};
pub use registry::SubscriptionInfo;
pub use session::{Session, SessionStats};
pub use stream::{EventStream, UnsubscribeHandle};

// Wire types callers need alongside the session API.
pub use halink_api::{
    Category, ConnectionState, EventEnvelope, EventHeader, HandshakeInfo, Request,
};
