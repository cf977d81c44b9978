//! Speech API WebSocket Relay
//!
//! A WebSocket relay that lets browser clients reach a credentialed streaming
//! speech API. The client names the upstream endpoint and credential in its
//! first message; the relay opens the upstream connection with a bearer
//! `Authorization` header and bridges frames both ways, preserving order and
//! the text/binary distinction, and mirroring closure from either side.

pub mod config;
pub mod envelope;
pub mod frame;
pub mod listener;
pub mod pending;
pub mod security;
pub mod session;
pub mod stream;
pub mod tls;
pub mod upstream;

// Re-export commonly used types and functions
pub use config::{Config, ListenConfig, RelayConfig, TlsConfig, load_config};
pub use envelope::{Envelope, ProtocolViolation};
pub use frame::{Event, Frame};
pub use listener::{Listener, handle_connection};
pub use pending::{PendingQueue, QueueFull};
pub use session::{Session, Side, Termination};
pub use stream::ClientStream;
pub use tls::load_tls_acceptor;
pub use upstream::{UpstreamError, UpstreamStream};
