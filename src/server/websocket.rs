//! WebSocket server implementation
//!
//! Listens on a configurable address and upgrades connections on the device
//! path, handing each one to its own [`ConnectionHandler`] task.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use super::handler::{ConnectionHandler, TransportFault};
use super::protocol::CannedMessages;

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Request path the WebSocket endpoint is served on
    pub path: String,
    /// Upper bound on concurrent connections (unlimited when `None`)
    pub max_connections: Option<usize>,
    /// Close connections that send nothing for this long (never when `None`)
    pub idle_timeout: Option<Duration>,
    /// Status payloads reported to clients
    pub messages: CannedMessages,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            path: "/ws".to_string(),
            max_connections: None,
            idle_timeout: None,
            messages: CannedMessages::default(),
        }
    }

    /// Set the endpoint path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the connection limit
    pub fn with_max_connections(mut self, max_connections: Option<usize>) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the canned status messages
    pub fn with_messages(mut self, messages: CannedMessages) -> Self {
        self.messages = messages;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host(), self.port)
    }

    /// URL of the endpoint on the bind address
    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host(), self.port, self.path)
    }

    /// Bind address with IPv6 literals bracketed
    fn host(&self) -> String {
        match self.bind.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
            _ => self.bind.clone(),
        }
    }
}

/// WebSocket server simulating the device endpoint
pub struct WebSocketServer {
    config: ServerConfig,
    messages: Arc<CannedMessages>,
    connection_limit: Option<Arc<Semaphore>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let messages = Arc::new(config.messages.clone());
        let connection_limit = config
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            config,
            messages,
            connection_limit,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and run the WebSocket server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on {}", self.config.url());

        self.serve(listener).await
    }

    /// Accept connections from an already bound listener
    ///
    /// Connections are handled concurrently. The loop ends when a shutdown
    /// signal is received; live connections are told to close.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.dispatch(stream, peer_addr),
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Spawn the handling task for an accepted socket
    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let permit = match &self.connection_limit {
            Some(limit) => match Arc::clone(limit).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(
                        "Connection limit reached, rejecting connection from {}",
                        peer_addr
                    );
                    return;
                }
            },
            None => None,
        };

        let handler = ConnectionHandler::new(peer_addr, Arc::clone(&self.messages))
            .with_idle_timeout(self.config.idle_timeout);
        let path = self.config.path.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let _permit = permit;
            match handle_connection(stream, peer_addr, path, handler, shutdown_rx).await {
                Ok(()) => info!("Connection from {} closed", peer_addr),
                Err(e @ TransportFault::Handshake(_)) => {
                    warn!("Rejected connection from {}: {}", peer_addr, e)
                }
                Err(e) => warn!("Connection from {} ended: {}", peer_addr, e),
            }
        });
    }
}

/// Upgrade a TCP stream on the endpoint path and run its handler
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    path: String,
    handler: ConnectionHandler,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), TransportFault> {
    info!("New connection from {}", peer_addr);

    let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let requested = request.uri().path();
        if requested == path {
            Ok(response)
        } else {
            debug!("Unknown path {} requested by {}", requested, peer_addr);
            let mut rejection = ErrorResponse::new(Some(format!("no endpoint at {}", requested)));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    // The idle timeout also bounds the upgrade, so a silent socket cannot
    // hold a connection slot
    let idle_timeout = handler.idle_timeout();
    let upgrade = async {
        let handshake = accept_hdr_async(stream, check_path);
        let result = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, handshake).await {
                Ok(result) => result,
                Err(_) => return Err(TransportFault::IdleTimeout(limit)),
            },
            None => handshake.await,
        };
        result.map_err(TransportFault::Handshake)
    };

    let ws_stream = tokio::select! {
        result = upgrade => result?,
        _ = shutdown_rx.recv() => {
            info!(
                "Shutdown signal received, dropping connection from {} before upgrade",
                peer_addr
            );
            return Ok(());
        }
    };
    debug!("Upgraded connection from {}", peer_addr);

    handler.run(ws_stream, shutdown_rx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const QUIET_WINDOW: Duration = Duration::from_millis(200);
    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    async fn start(
        config: ServerConfig,
    ) -> (Arc<WebSocketServer>, SocketAddr, JoinHandle<anyhow::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(WebSocketServer::new(config));
        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };
        (server, addr, task)
    }

    fn local_config() -> ServerConfig {
        ServerConfig::new("127.0.0.1".to_string(), 0)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        ws
    }

    async fn read_text(ws: &mut Client) -> String {
        match tokio::time::timeout(READ_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => text.to_string(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    async fn read_initial(ws: &mut Client) -> Vec<String> {
        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(read_text(ws).await);
        }
        frames
    }

    async fn assert_quiet(ws: &mut Client) {
        let next = tokio::time::timeout(QUIET_WINDOW, ws.next()).await;
        assert!(next.is_err(), "Expected no frame, got {:?}", next);
    }

    /// Read until the server closes the connection
    async fn assert_closed_by_server(ws: &mut Client) {
        loop {
            match tokio::time::timeout(READ_TIMEOUT, ws.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return,
                Ok(Some(Ok(_))) => continue,
                Err(_) => panic!("Server did not close the connection"),
            }
        }
    }

    fn initial_literals() -> Vec<String> {
        vec![
            "TEMP:9".to_string(),
            "SETTINGS: DIGITAL, 255,0,255,200".to_string(),
            "SCHEDULE:1,22,0,7,0".to_string(),
        ]
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 81);
        assert_eq!(config.socket_addr(), "127.0.0.1:81");
        assert_eq!(config.url(), "ws://127.0.0.1:81/ws");
        assert_eq!(config.path, "/ws");
        assert!(config.max_connections.is_none());
        assert!(config.idle_timeout.is_none());
    }

    #[test]
    fn test_server_config_builders() {
        let config = ServerConfig::new("0.0.0.0".to_string(), 8081)
            .with_path("/device")
            .with_max_connections(Some(2))
            .with_idle_timeout(Some(Duration::from_secs(30)));
        assert_eq!(config.path, "/device");
        assert_eq!(config.max_connections, Some(2));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_server_config_ipv6_bind() {
        let config = ServerConfig::new("::".to_string(), 81);
        assert_eq!(config.socket_addr(), "[::]:81");
        assert_eq!(config.url(), "ws://[::]:81/ws");

        let config = ServerConfig::new("localhost".to_string(), 8081).with_path("/device");
        assert_eq!(config.url(), "ws://localhost:8081/device");
    }

    #[tokio::test]
    async fn test_initial_sequence_and_commands() {
        let (_server, addr, _task) = start(local_config()).await;
        let mut ws = connect(addr).await;

        assert_eq!(read_initial(&mut ws).await, initial_literals());

        ws.send(Message::Text("GET_SETTINGS".to_string())).await.unwrap();
        assert_eq!(read_text(&mut ws).await, "SETTINGS: DIGITAL, 255,0,255,200");
        assert_quiet(&mut ws).await;

        ws.send(Message::Text("MODE:TEMP".to_string())).await.unwrap();
        assert_eq!(read_text(&mut ws).await, "TEMP:9");
        assert_quiet(&mut ws).await;

        ws.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_unrecognized_commands_get_no_reply() {
        let (_server, addr, _task) = start(local_config()).await;
        let mut ws = connect(addr).await;
        read_initial(&mut ws).await;

        for text in ["foo", "", "   ", "get_settings", "mode:temp", "GET_SETTINGS\n"] {
            ws.send(Message::Text(text.to_string())).await.unwrap();
        }
        assert_quiet(&mut ws).await;

        // Still responsive afterwards
        ws.send(Message::Text("GET_SETTINGS".to_string())).await.unwrap();
        assert_eq!(read_text(&mut ws).await, "SETTINGS: DIGITAL, 255,0,255,200");
    }

    #[tokio::test]
    async fn test_concurrent_clients_are_independent() {
        let (_server, addr, _task) = start(local_config()).await;
        let mut a = connect(addr).await;
        let mut b = connect(addr).await;

        assert_eq!(read_initial(&mut a).await, initial_literals());

        a.send(Message::Text("GET_SETTINGS".to_string())).await.unwrap();
        assert_eq!(read_text(&mut a).await, "SETTINGS: DIGITAL, 255,0,255,200");
        a.send(Message::Text("foo".to_string())).await.unwrap();
        assert_quiet(&mut a).await;

        // B sees only its own sequence despite A's traffic
        assert_eq!(read_initial(&mut b).await, initial_literals());
        assert_quiet(&mut b).await;

        a.close(None).await.unwrap();
        drop(a);

        b.send(Message::Text("MODE:TEMP".to_string())).await.unwrap();
        assert_eq!(read_text(&mut b).await, "TEMP:9");

        // A client connecting after A left still gets the full sequence
        let mut c = connect(addr).await;
        assert_eq!(read_initial(&mut c).await, initial_literals());
    }

    #[tokio::test]
    async fn test_configured_messages_are_sent() {
        let messages = CannedMessages {
            temperature: "TEMP:23".to_string(),
            settings: "SETTINGS: CLOCK, 0,255,0,100".to_string(),
            schedule: "SCHEDULE:0,23,30,6,45".to_string(),
        };
        let (_server, addr, _task) = start(local_config().with_messages(messages.clone())).await;
        let mut ws = connect(addr).await;

        assert_eq!(
            read_initial(&mut ws).await,
            vec![messages.temperature, messages.settings, messages.schedule]
        );
    }

    #[tokio::test]
    async fn test_wrong_path_is_rejected() {
        let (_server, addr, _task) = start(local_config()).await;

        assert!(connect_async(format!("ws://{}/other", addr)).await.is_err());
        assert!(connect_async(format!("ws://{}/", addr)).await.is_err());

        // The listener keeps serving the real endpoint
        let mut ws = connect(addr).await;
        assert_eq!(read_initial(&mut ws).await, initial_literals());
    }

    #[tokio::test]
    async fn test_custom_path() {
        let (_server, addr, _task) = start(local_config().with_path("/device")).await;

        let (mut ws, _) = connect_async(format!("ws://{}/device", addr)).await.unwrap();
        assert_eq!(read_initial(&mut ws).await, initial_literals());
        assert!(connect_async(format!("ws://{}/ws", addr)).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (_server, addr, _task) = start(local_config().with_max_connections(Some(1))).await;

        let mut first = connect(addr).await;
        read_initial(&mut first).await;

        assert!(connect_async(format!("ws://{}/ws", addr)).await.is_err());

        // Slot is released once the first client leaves
        first.close(None).await.unwrap();
        assert_closed_by_server(&mut first).await;
        drop(first);

        let mut retry = None;
        for _ in 0..50 {
            if let Ok((ws, _)) = connect_async(format!("ws://{}/ws", addr)).await {
                retry = Some(ws);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut second = retry.expect("Slot was never released");
        assert_eq!(read_initial(&mut second).await, initial_literals());
    }

    #[tokio::test]
    async fn test_silent_socket_does_not_hold_slot() {
        let config = local_config()
            .with_max_connections(Some(1))
            .with_idle_timeout(Some(Duration::from_millis(100)));
        let (_server, addr, _task) = start(config).await;

        // Plain TCP, never sends an upgrade request
        let _silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut upgraded = None;
        for _ in 0..100 {
            if let Ok((ws, _)) = connect_async(format!("ws://{}/ws", addr)).await {
                upgraded = Some(ws);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut ws = upgraded.expect("Silent socket kept the only slot");
        assert_eq!(read_initial(&mut ws).await, initial_literals());
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_upgrade() {
        let (server, addr, task) = start(local_config()).await;
        let mut silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(READ_TIMEOUT, silent.read(&mut buf))
            .await
            .expect("Pending connection was not dropped");
        assert!(matches!(read, Ok(0) | Err(_)));
        let result = tokio::time::timeout(READ_TIMEOUT, task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_silent_client() {
        let config = local_config().with_idle_timeout(Some(Duration::from_millis(100)));
        let (_server, addr, _task) = start(config).await;
        let mut ws = connect(addr).await;
        read_initial(&mut ws).await;

        assert_closed_by_server(&mut ws).await;
    }

    #[tokio::test]
    async fn test_idle_timeout_resets_on_traffic() {
        let config = local_config().with_idle_timeout(Some(Duration::from_millis(300)));
        let (_server, addr, _task) = start(config).await;
        let mut ws = connect(addr).await;
        read_initial(&mut ws).await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ws.send(Message::Text("MODE:TEMP".to_string())).await.unwrap();
            assert_eq!(read_text(&mut ws).await, "TEMP:9");
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_server_and_closes_clients() {
        let (server, addr, task) = start(local_config()).await;
        let mut ws = connect(addr).await;
        read_initial(&mut ws).await;

        server.shutdown();

        assert_closed_by_server(&mut ws).await;
        let result = tokio::time::timeout(READ_TIMEOUT, task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
