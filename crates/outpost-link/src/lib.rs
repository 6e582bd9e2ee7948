//! # outpost-link
//!
//! Connection manager for a single game server: websocket transport,
//! correlated requests, broadcast fan-out and a bounded reconnect cycle.

pub mod backoff;
pub mod connector;
pub mod session;
pub mod wire;

pub use backoff::ReconnectPolicy;
pub use connector::{Connector, Frames, WsConnector};
pub use session::{LinkState, Session, SessionConfig};
pub use wire::Credentials;
