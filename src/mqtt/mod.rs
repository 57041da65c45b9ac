//! MQTT module: broker client port, session supervision and payloads.

pub mod client;
pub mod payload;
pub mod session;

// Re-exports for cleaner imports from crate::mqtt
pub use client::BrokerClient;
pub use payload::{OutgoingMessage, PayloadError, ReceivedMessage, ReportKind};
pub use session::{MessagingSession, SessionError, SessionState};
