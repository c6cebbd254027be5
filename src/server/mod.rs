//! WebSocket server module
//!
//! Accepts client connections on the device endpoint and plays back the
//! simulated device's side of the conversation.

mod discovery;
mod handler;
mod protocol;
mod websocket;

pub use discovery::{endpoint_url, local_ip};
pub use protocol::CannedMessages;
pub use websocket::{ServerConfig, WebSocketServer};
