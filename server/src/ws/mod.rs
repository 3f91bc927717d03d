pub mod handler;
pub mod protocol;
pub mod registry;
pub mod scope;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use registry::ConnectionRegistry;
pub use scope::ScopeIndex;
pub use session::{IncomingFrame, IntakeReceiver, SessionId, SessionSettings};
pub use transport::{CloseStatus, Transport, WebSocketTransport};
