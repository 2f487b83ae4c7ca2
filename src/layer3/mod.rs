// Layer 3 - Downstream distribution
// Publishes the synchronized book to websocket subscribers

pub mod publisher;
pub mod sessions;
pub mod server;

pub use publisher::{ClientMessage, PublishedView, Publisher, PublisherStats, ServerMessage};
pub use sessions::{run_heartbeat, SessionError, SessionId, SessionInfo, SessionManager, SessionStats};
pub use server::{router, serve, AppState, HealthResponse};
