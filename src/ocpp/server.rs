//! OCPP 1.6 WebSocket server
//!
//! Chargers connect at `ws://<host>:<port>/<charger_id>` with subprotocol
//! `ocpp1.6`; admin clients connect to `/api` with the same subprotocol
//! and framing. Per connection there is a read loop, a write task fed by
//! an unbounded channel, and a silence watchdog.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::api::{self, ApiContext};
use crate::config::AppConfig;
use crate::model::{store, ModelRegistry};
use crate::ocpp::commands::SharedCommandSender;
use crate::ocpp::connections::{RegisterResult, SharedConnectionRegistry};
use crate::ocpp::handler::OcppHandler;
use crate::support::crypto::{generate_authorization_key, sha256_hex};
use crate::support::shutdown::ShutdownSignal;

const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

pub struct OcppServer {
    config: Arc<AppConfig>,
    registry: Arc<ModelRegistry>,
    connections: SharedConnectionRegistry,
    commands: SharedCommandSender,
    api_context: Arc<ApiContext>,
    shutdown: ShutdownSignal,
}

/// Server failures the process maps to exit codes.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl OcppServer {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<ModelRegistry>,
        connections: SharedConnectionRegistry,
        commands: SharedCommandSender,
        api_context: Arc<ApiContext>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            registry,
            connections,
            commands,
            api_context,
            shutdown,
        }
    }

    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!("OCPP server listening on ws://{}", addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = self.shutdown.notified().wait() => {
                    info!("OCPP server shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let config = self.config.clone();
        let registry = self.registry.clone();
        let connections = self.connections.clone();
        let commands = self.commands.clone();
        let api_context = self.api_context.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(
                stream,
                peer,
                config,
                registry,
                connections,
                commands,
                api_context,
                shutdown,
            )
            .await
            {
                warn!(peer = %peer, error = %e, "Connection ended with error");
            }
        });
    }
}

fn extract_path_id(path: &str) -> Option<String> {
    let id = path.trim_matches('/');
    if id.is_empty() || id.contains('/') {
        None
    } else {
        Some(id.to_string())
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<AppConfig>,
    registry: Arc<ModelRegistry>,
    connections: SharedConnectionRegistry,
    commands: SharedCommandSender,
    api_context: Arc<ApiContext>,
    shutdown: ShutdownSignal,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::new();
    let mut authorization: Option<String> = None;
    let mut requested_protocols = String::new();

    let mut ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, mut response: Response| {
            path = req.uri().path().to_string();
            authorization = req
                .headers()
                .get("Authorization")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            requested_protocols = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let supports_ocpp16 = requested_protocols
                .split(',')
                .map(str::trim)
                .any(|p| p == OCPP_SUBPROTOCOL);
            if supports_ocpp16 {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", OCPP_SUBPROTOCOL.parse().unwrap());
            }
            Ok(response)
        },
    )
    .await?;

    debug!(peer = %peer, path = path.as_str(), "WebSocket handshake complete");

    let Some(path_id) = extract_path_id(&path) else {
        close(&mut ws_stream, CloseCode::Invalid, "Missing charger id in path").await;
        return Ok(());
    };

    // Admin clients share the listener on /api.
    if path_id == "api" {
        info!(peer = %peer, "API client connected");
        api::handler::run(ws_stream, api_context, shutdown).await;
        return Ok(());
    }
    let charger_id = path_id;

    // Browser clients cannot set HTTP headers on WebSocket; the
    // development-only escape hatch smuggles the credential through the
    // subprotocol list as hex.
    if config.host.http_auth_via_protocol && authorization.is_none() {
        for protocol in requested_protocols.split(',') {
            let protocol = protocol.trim();
            if !protocol.starts_with("ocpp") {
                if let Ok(raw) = hex::decode(protocol) {
                    let value = format!("Basic {}", BASE64.encode(raw));
                    debug!(charger_id = charger_id.as_str(), "Authorization taken from subprotocol");
                    authorization = Some(value);
                    break;
                }
            }
        }
    }

    // Unknown chargers are auto-registered or turned away.
    if !registry.charger_exists(&charger_id) {
        if let Err(e) = registry.autoregister(&charger_id) {
            warn!(charger_id = charger_id.as_str(), error = %e, "Unknown charger rejected");
            close(&mut ws_stream, CloseCode::Invalid, "Unknown charge point").await;
            return Ok(());
        }
        info!(charger_id = charger_id.as_str(), "Charger auto-registered");
    }

    // HTTP Basic auth against the stored hash. A charger without a stored
    // hash gets a key issued after a grace period.
    let mut issue_new_key = false;
    if config.host.http_auth {
        match registry.charger_auth_sha(&charger_id) {
            Some(expected_sha) => {
                let Some(request_auth) = authorization.as_deref() else {
                    warn!(charger_id = charger_id.as_str(), "Missing Basic Auth");
                    close(&mut ws_stream, CloseCode::Policy, "Missing Basic Auth").await;
                    return Ok(());
                };
                if sha256_hex(request_auth) != expected_sha {
                    error!(charger_id = charger_id.as_str(), "Wrong Basic Auth");
                    close(&mut ws_stream, CloseCode::Policy, "Authentication error").await;
                    return Ok(());
                }
            }
            None => issue_new_key = true,
        }
    }

    info!(charger_id = charger_id.as_str(), peer = %peer, "Charger connected");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let connection_id = match connections.register(&charger_id, tx) {
        RegisterResult::New { connection_id } | RegisterResult::Evicted { connection_id } => {
            connection_id
        }
    };
    registry.mark_connected(&charger_id, Utc::now());

    if issue_new_key {
        tokio::spawn(issue_authorization_key(
            charger_id.clone(),
            registry.clone(),
            commands.clone(),
            config.clone(),
        ));
    }

    let handler = Arc::new(OcppHandler::new(
        charger_id.clone(),
        registry.clone(),
        commands.clone(),
        config.csms.heartbeat_interval,
    ));

    // Outgoing sender task
    let send_id = charger_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            debug!(charger_id = send_id.as_str(), "-> {}", message);
            if let Err(e) = ws_sender.send(Message::Text(message)).await {
                warn!(charger_id = send_id.as_str(), error = %e, "Send failed");
                break;
            }
        }
    });

    // Incoming receiver task
    let recv_id = charger_id.clone();
    let recv_connections = connections.clone();
    let recv_handler = handler.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    debug!(charger_id = recv_id.as_str(), "<- {}", text);
                    recv_connections.touch(&recv_id);
                    match recv_handler.handle(&text).await {
                        Ok(Some(response)) => {
                            if recv_connections.send_to(&recv_id, response).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            // Malformed framing: drop the connection, the
                            // charger reconnects clean.
                            error!(charger_id = recv_id.as_str(), error = %e, "Protocol error");
                            break;
                        }
                    }
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    recv_connections.touch(&recv_id);
                }
                Ok(Message::Close(frame)) => {
                    info!(charger_id = recv_id.as_str(), ?frame, "Close frame received");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(charger_id = recv_id.as_str(), error = %e, "WebSocket error");
                    break;
                }
            }
        }
    });

    // Silence watchdog for this connection
    let watchdog_id = charger_id.clone();
    let watchdog_connections = connections.clone();
    let watchdog_interval = config.host.watchdog_interval;
    let watchdog_stale = config.host.watchdog_stale as i64;
    let watchdog_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(watchdog_interval)).await;
            match watchdog_connections.silence_secs(&watchdog_id) {
                Some(silence) if silence > watchdog_stale => {
                    error!(
                        charger_id = watchdog_id.as_str(),
                        silence, "No traffic, closing connection"
                    );
                    return;
                }
                Some(_) => {}
                None => return,
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
        _ = watchdog_task => {}
        _ = shutdown.notified().wait() => {
            info!(charger_id = charger_id.as_str(), "Closing connection on shutdown");
        }
    }

    connections.unregister(&charger_id, connection_id);
    commands.cleanup_charger(&charger_id);
    registry.mark_disconnected(&charger_id, Utc::now());
    info!(charger_id = charger_id.as_str(), "Charger disconnected");

    Ok(())
}

async fn close(ws: &mut WebSocketStream<TcpStream>, code: CloseCode, reason: &str) {
    let _ = ws
        .close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        }))
        .await;
}

/// Issue a fresh AuthorizationKey after the configured grace (some
/// chargers restart on key change, so this is delayed past boot), store
/// its hash and persist the charger table.
async fn issue_authorization_key(
    charger_id: String,
    registry: Arc<ModelRegistry>,
    commands: SharedCommandSender,
    config: Arc<AppConfig>,
) {
    tokio::time::sleep(std::time::Duration::from_secs(config.host.http_auth_delay)).await;

    let key = generate_authorization_key();
    let payload = serde_json::json!({"key": "AuthorizationKey", "value": key});
    match commands
        .send_call(&charger_id, "ChangeConfiguration", payload)
        .await
    {
        Ok(result) => {
            let status = result["status"].as_str().unwrap_or("");
            if status != "Accepted" && status != "RebootRequired" {
                warn!(
                    charger_id = charger_id.as_str(),
                    status, "AuthorizationKey not accepted"
                );
                return;
            }
        }
        Err(e) => {
            warn!(charger_id = charger_id.as_str(), error = %e, "AuthorizationKey push failed");
            return;
        }
    }

    let auth_value = format!(
        "Basic {}",
        BASE64.encode(format!("{}:{}", charger_id, key))
    );
    registry.set_charger_auth_sha(&charger_id, sha256_hex(&auth_value));
    info!(charger_id = charger_id.as_str(), "AuthorizationKey issued");

    let path = std::path::Path::new(&config.model.chargers_csv);
    let result = registry.with_model(|model| store::write_chargers(path, &model.chargers));
    if let Err(e) = result {
        warn!(error = %e, "Failed to persist chargers after key issuance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_id_extraction() {
        assert_eq!(extract_path_id("/CP-1"), Some("CP-1".to_string()));
        assert_eq!(extract_path_id("/CP-1/"), Some("CP-1".to_string()));
        assert_eq!(extract_path_id("/api"), Some("api".to_string()));
        assert_eq!(extract_path_id("/"), None);
        assert_eq!(extract_path_id("/a/b"), None);
    }
}
