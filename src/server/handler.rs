//! WebSocket connection handler
//!
//! Drives a single upgraded connection: pushes the device status, then answers
//! client commands until the peer goes away.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::error::Elapsed;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::protocol::{CannedMessages, Command};

/// Failures that end a single connection
#[derive(Debug, Error)]
pub enum TransportFault {
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[source] WsError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("No frame received for {0:?}")]
    IdleTimeout(Duration),
}

/// Handles a single WebSocket connection
pub struct ConnectionHandler {
    peer_addr: SocketAddr,
    messages: Arc<CannedMessages>,
    idle_timeout: Option<Duration>,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(peer_addr: SocketAddr, messages: Arc<CannedMessages>) -> Self {
        Self {
            peer_addr,
            messages,
            idle_timeout: None,
        }
    }

    /// Close the connection when the client stays silent this long
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Configured idle timeout
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Run the connection to completion.
    ///
    /// Returns `Ok(())` when the peer closes cleanly or the server shuts down.
    pub async fn run<S>(
        self,
        ws_stream: S,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), TransportFault>
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    {
        let peer_addr = self.peer_addr;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        for text in self.messages.initial_sequence() {
            ws_sender.send(Message::Text(text.to_string())).await?;
            info!("Sent to {}: {}", peer_addr, text);
        }

        loop {
            tokio::select! {
                next = recv_frame(&mut ws_receiver, self.idle_timeout) => {
                    let msg = match next {
                        Ok(msg) => msg,
                        Err(_) => {
                            // Unset limits never produce Elapsed
                            let limit = self.idle_timeout.unwrap_or_default();
                            warn!("Closing idle connection from {} after {:?}", peer_addr, limit);
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Err(TransportFault::IdleTimeout(limit));
                        }
                    };

                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            info!("Received from {}: {}", peer_addr, text);

                            let command = Command::parse(&text);
                            match self.messages.reply_to(&command) {
                                Some(reply) => {
                                    ws_sender.send(Message::Text(reply.to_string())).await?;
                                    info!("Sent to {}: {}", peer_addr, reply);
                                }
                                None => {
                                    debug!("No reply for {:?} from {}", command, peer_addr);
                                }
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!(
                                "Received binary message from {} ({} bytes), ignoring",
                                peer_addr,
                                data.len()
                            );
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            info!("Client {} requested close", peer_addr);
                            break;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            return Err(TransportFault::WebSocket(e));
                        }
                        None => {
                            info!("Connection closed by {}", peer_addr);
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection to {}", peer_addr);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Wait for the next frame, bounded by the idle timeout when one is set
async fn recv_frame<R>(
    receiver: &mut R,
    idle_timeout: Option<Duration>,
) -> Result<Option<Result<Message, WsError>>, Elapsed>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, receiver.next()).await,
        None => Ok(receiver.next().await),
    }
}
