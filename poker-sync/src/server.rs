//! WebSocket transport binding the sync core together.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── RoomRegistry ── Room (state machine)
//!             ├── RoomServer ── EventIngress
//! Client B ──┘        │                        │
//!                     │                 Dispatcher
//!                     │                        │
//!                     └──────── LocalFanout ◄──┘
//!                        (group + direct channels)
//! ```
//!
//! Each connection is attributed at handshake time from the URL query:
//! `?room=<id>&user=<id>&ticket=<uuid>`. When the server is constructed with
//! a [`TicketIssuer`], connections without a valid ticket are rejected
//! during the handshake; otherwise access is open (nicknames are
//! self-declared either way). After the handshake the connection registers a
//! direct channel and subscribes to its room's group, then pumps frames both
//! ways until the socket closes.
//!
//! Disconnects release the fan-out channels only. The participant entry
//! stays in the room so a page refresh can rejoin with state intact.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::fanout::{Fanout, LocalFanout};
use crate::ingress::{EventContext, EventIngress};
use crate::negotiate::TicketIssuer;
use crate::registry::RoomRegistry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room group
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_events: u64,
    pub active_rooms: usize,
}

/// Connection attribution parsed from the handshake URL query.
#[derive(Debug, Clone)]
struct ConnectionParams {
    room_id: Option<String>,
    user_id: String,
    ticket: Option<String>,
}

impl ConnectionParams {
    /// Parse `room`, `user`, and `ticket` from a raw query string.
    ///
    /// Ids are short opaque tokens, so no percent-decoding is applied.
    /// Returns `None` when `user` is missing or empty.
    fn from_query(query: Option<&str>) -> Option<Self> {
        let mut room = None;
        let mut user = None;
        let mut ticket = None;

        for pair in query?.split('&') {
            match pair.split_once('=') {
                Some(("room", v)) => room = Some(v.to_string()),
                Some(("user", v)) => user = Some(v.to_string()),
                Some(("ticket", v)) => ticket = Some(v.to_string()),
                _ => {}
            }
        }

        Some(Self {
            room_id: room.filter(|r| !r.is_empty()),
            user_id: user.filter(|u| !u.is_empty())?,
            ticket,
        })
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}

/// The room synchronization server.
pub struct RoomServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    fanout: Arc<LocalFanout>,
    ingress: Arc<EventIngress>,
    issuer: Option<Arc<TicketIssuer>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RoomServer {
    /// Create a server with open access (no ticket checks).
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let fanout = Arc::new(LocalFanout::new(config.broadcast_capacity));
        let ingress = Arc::new(EventIngress::new(
            registry.clone(),
            fanout.clone() as Arc<dyn Fanout>,
        ));

        Self {
            config,
            registry,
            fanout,
            ingress,
            issuer: None,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration and open access.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create a server that admits only connections presenting a ticket
    /// minted by `issuer` for their (user, room) pair.
    pub fn with_issuer(config: ServerConfig, issuer: Arc<TicketIssuer>) -> Self {
        let mut server = Self::new(config);
        server.issuer = Some(issuer);
        server
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("room sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let ingress = self.ingress.clone();
            let fanout = self.fanout.clone();
            let issuer = self.issuer.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, ingress, fanout, issuer, stats).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ingress: Arc<EventIngress>,
        fanout: Arc<LocalFanout>,
        issuer: Option<Arc<TicketIssuer>>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Attribution happens during the handshake so an unauthorized
        // connection is refused before it ever becomes a WebSocket.
        let mut params: Option<ConnectionParams> = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let parsed = match ConnectionParams::from_query(req.uri().query()) {
                Some(parsed) => parsed,
                None => {
                    return Err(reject(
                        StatusCode::BAD_REQUEST,
                        "user query parameter is required",
                    ))
                }
            };

            if let Some(issuer) = issuer.as_deref() {
                let authorized = match (&parsed.ticket, &parsed.room_id) {
                    (Some(ticket), Some(room)) => {
                        issuer.validate(ticket, &parsed.user_id, room)
                    }
                    _ => false,
                };
                if !authorized {
                    return Err(reject(StatusCode::UNAUTHORIZED, "invalid or missing ticket"));
                }
            }

            params = Some(parsed);
            Ok(resp)
        };

        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let params = match params {
            Some(params) => params,
            None => return Ok(()), // handshake rejected
        };

        log::info!(
            "connection from {addr}: user {} room {}",
            params.user_id,
            params.room_id.as_deref().unwrap_or("-")
        );

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection_id = Uuid::new_v4().to_string();
        let mut direct_rx = fanout.register_connection(&connection_id);
        let mut group_rx = params.room_id.as_deref().map(|room| fanout.subscribe(room));

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let ctx = EventContext {
            room_id: params.room_id.clone(),
            user_id: params.user_id.clone(),
            connection_id: connection_id.clone(),
        };

        loop {
            tokio::select! {
                // Inbound client frame
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(frame))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_events += 1;
                            }
                            if let Err(e) = ingress.handle_event(&ctx, frame.as_str()).await {
                                // Structurally invalid request: answer the
                                // caller, keep the connection open.
                                let err =
                                    serde_json::json!({ "type": "error", "error": e.to_string() });
                                if ws_sender.send(Message::Text(err.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("websocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Direct message addressed to this connection
                payload = direct_rx.recv() => {
                    match payload {
                        Some(payload) => {
                            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                // Group broadcast for this connection's room
                frame = async {
                    match group_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // No room subscription — wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            if frame.exclude_user.as_deref() == Some(params.user_id.as_str()) {
                                continue;
                            }
                            if ws_sender
                                .send(Message::Text(frame.payload.clone().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("connection {connection_id} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Release the transport channels only. The participant entry stays in
        // the room; disconnect handling is an open product question.
        fanout.unregister_connection(&connection_id);

        let active_rooms = ingress.registry().room_count().await;
        let mut s = stats.write().await;
        s.active_connections -= 1;
        s.active_rooms = active_rooms;

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The room registry backing this server.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// The in-process fan-out backing this server.
    pub fn fanout(&self) -> &Arc<LocalFanout> {
        &self.fanout
    }
}
