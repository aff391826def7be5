//! Gateway WebSocket server
//!
//! Accepts charge-point connections at
//! `ws://<host>:<port>/ocpp/{version}/{chargePointId}`, runs admission
//! (path, subprotocol, credentials, cluster ownership claim) and then
//! the per-connection receive loop. Each connection is its own task;
//! inside one connection message handling is strictly serialized.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthFailure, Authenticator, ConnectRequest};
use crate::cluster::{ForceDisconnect, SessionControl, SessionDirectory};
use crate::domain::session::ClaimStatus;
use crate::domain::ConnectionMeta;
use crate::events::EventPublisher;
use crate::infrastructure::{FloodControl, FloodKind};
use crate::ocpp::MessageEngine;
use crate::support::ShutdownSignal;

use super::path::{negotiate_subprotocol, parse_connect_path, ConnectPath, PathRejection};
use super::registry::{ConnectionRegistry, OutboundMessage};

/// Close codes used on the OCPP endpoint
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_TOO_LARGE: u16 = 1009;
const CLOSE_TRY_AGAIN: u16 = 1013;

/// Listener and per-connection limits
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_payload_bytes: usize,
    /// Frames buffered while admission is still in flight.
    pub pending_message_limit: usize,
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared dependencies for every connection task
pub struct GatewayServer {
    settings: ServerSettings,
    registry: Arc<ConnectionRegistry>,
    engine: Arc<MessageEngine>,
    authenticator: Arc<Authenticator>,
    sessions: Arc<SessionDirectory>,
    session_control: Arc<SessionControl>,
    publisher: Arc<EventPublisher>,
    flood: Arc<FloodControl>,
    shutdown: ShutdownSignal,
}

impl GatewayServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ServerSettings,
        registry: Arc<ConnectionRegistry>,
        engine: Arc<MessageEngine>,
        authenticator: Arc<Authenticator>,
        sessions: Arc<SessionDirectory>,
        session_control: Arc<SessionControl>,
        publisher: Arc<EventPublisher>,
        flood: Arc<FloodControl>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            settings,
            registry,
            engine,
            authenticator,
            sessions,
            session_control,
            publisher,
            flood,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Bind and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let addr = self.settings.address();
        let listener = TcpListener::bind(&addr).await?;
        info!(
            address = addr.as_str(),
            "OCPP gateway listening (connect at ws://{}/ocpp/{{version}}/{{chargePointId}})",
            addr
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    debug!(peer = %peer, error = %e, "Connection ended with error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Accept failed"),
                    }
                }
                _ = self.shutdown.notified().wait() => {
                    info!("WebSocket server stopping");
                    self.drain_connections();
                    return Ok(());
                }
            }
        }
    }

    /// Ask every live connection to close; entries disappear as their
    /// tasks tear down.
    fn drain_connections(&self) {
        let connected = self.registry.connected_ids();
        if !connected.is_empty() {
            info!(count = connected.len(), "Closing connected charge points");
            for charge_point_id in connected {
                self.registry.close(&charge_point_id, 1001, "server shutting down");
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut connect_path: Option<ConnectPath> = None;
        let mut accepted_protocol: Option<&'static str> = None;
        let mut suspicious_path = false;
        let mut captured = CapturedHeaders::default();

        let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut response: Response| {
            let path = req.uri().path().to_string();

            let parsed = match parse_connect_path(&path) {
                Ok(parsed) => parsed,
                Err(PathRejection::Suspicious) => {
                    suspicious_path = true;
                    return Err(bad_request("not found"));
                }
                Err(PathRejection::Invalid(reason)) => {
                    debug!(peer = %peer, path = path.as_str(), reason = reason.as_str(), "Invalid connect path");
                    return Err(bad_request("invalid path"));
                }
            };

            let offered = header(req, "Sec-WebSocket-Protocol");
            let Some(subprotocol) = negotiate_subprotocol(parsed.version, offered.as_deref()) else {
                debug!(
                    peer = %peer,
                    path = path.as_str(),
                    offered = offered.as_deref().unwrap_or(""),
                    "Subprotocol negotiation failed"
                );
                return Err(bad_request("unsupported subprotocol"));
            };

            captured = CapturedHeaders {
                authorization: header(req, "Authorization"),
                x_api_key: header(req, "X-Api-Key"),
                x_forwarded_for: header(req, "X-Forwarded-For"),
                forwarded: header(req, "Forwarded"),
            };
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                subprotocol.parse().expect("static subprotocol is a valid header value"),
            );
            accepted_protocol = Some(subprotocol);
            connect_path = Some(parsed);
            Ok(response)
        })
        .await;

        let ws_stream = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                if suspicious_path
                    && self.flood.should_log(FloodKind::Suspicious, &peer.ip().to_string()).await
                {
                    warn!(peer = %peer, "Suspicious path probe rejected");
                }
                return Err(Box::new(e));
            }
        };
        // Both set together on the accepted branch of the callback.
        let (Some(path), Some(subprotocol)) = (connect_path, accepted_protocol) else {
            return Ok(());
        };

        info!(
            charge_point_id = path.charge_point_id.as_str(),
            version = %path.version,
            subprotocol,
            peer = %peer,
            "WebSocket established, admission pending"
        );

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // ── Admission (async), buffering early frames ──────────
        let connect = ConnectRequest {
            charge_point_id: path.charge_point_id.clone(),
            version: Some(path.version),
            peer_addr: peer.to_string(),
            authorization: captured.authorization,
            x_api_key: captured.x_api_key,
            x_forwarded_for: captured.x_forwarded_for,
            forwarded: captured.forwarded,
            client_certificate: None,
        };
        let admission = self.admit(&path, connect);
        tokio::pin!(admission);

        let mut buffered: Vec<String> = Vec::new();
        let admitted = loop {
            tokio::select! {
                outcome = &mut admission => break outcome,
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if buffered.len() >= self.settings.pending_message_limit {
                                warn!(
                                    charge_point_id = path.charge_point_id.as_str(),
                                    "Pre-admission buffer overflow"
                                );
                                let _ = ws_sender
                                    .send(close_frame(CLOSE_TRY_AGAIN, "back-pressure"))
                                    .await;
                                return Ok(());
                            }
                            buffered.push(text);
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(Box::new(e)),
                    }
                }
                _ = self.shutdown.notified().wait() => {
                    let _ = ws_sender.send(close_frame(1001, "server shutting down")).await;
                    return Ok(());
                }
            }
        };

        let meta = match admitted {
            Ok(meta) => meta,
            Err(rejection) => {
                let _ = ws_sender
                    .send(close_frame(rejection.code, &rejection.reason))
                    .await;
                return Ok(());
            }
        };

        // ── Register and start the writer ──────────────────────
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        self.registry.register(meta.clone(), outbound_tx);
        self.publisher
            .publish_session(&meta, "SessionConnected", json!({"subprotocol": subprotocol}))
            .await;

        let writer_cp = meta.charge_point_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::Text(text) => {
                        debug!(charge_point_id = writer_cp.as_str(), "-> {}", text);
                        if let Err(e) = ws_sender.send(Message::Text(text)).await {
                            debug!(charge_point_id = writer_cp.as_str(), error = %e, "Send failed");
                            break;
                        }
                    }
                    OutboundMessage::Close { code, reason } => {
                        let _ = ws_sender.send(close_frame(code, &reason)).await;
                        break;
                    }
                }
            }
        });

        // ── Receive loop (strictly in order) ───────────────────
        let mut close_reason = "connection closed";
        for text in buffered {
            if !self.process_text(&meta, text).await {
                close_reason = "payload too large";
                break;
            }
        }
        if close_reason == "connection closed" {
            loop {
                tokio::select! {
                    frame = ws_receiver.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                if !self.process_text(&meta, text).await {
                                    close_reason = "payload too large";
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                            Some(Ok(Message::Binary(data))) => {
                                warn!(
                                    charge_point_id = meta.charge_point_id.as_str(),
                                    bytes = data.len(),
                                    "Binary frame ignored"
                                );
                            }
                            Some(Ok(Message::Close(frame))) => {
                                debug!(charge_point_id = meta.charge_point_id.as_str(), ?frame, "Close received");
                                break;
                            }
                            Some(Ok(Message::Frame(_))) => {}
                            Some(Err(e)) => {
                                debug!(charge_point_id = meta.charge_point_id.as_str(), error = %e, "Socket error");
                                break;
                            }
                            None => break,
                        }
                    }
                    _ = self.shutdown.notified().wait() => {
                        self.registry.close(&meta.charge_point_id, 1001, "server shutting down");
                        close_reason = "server shutdown";
                        break;
                    }
                }
            }
        }

        // ── Teardown ───────────────────────────────────────────
        self.registry
            .unregister(&meta.charge_point_id, &meta.connection_id);
        self.engine
            .tracker()
            .abort_for_connection(&meta.charge_point_id);
        if let Err(e) = self.sessions.release(&meta.charge_point_id).await {
            warn!(charge_point_id = meta.charge_point_id.as_str(), error = %e, "Session release failed");
        }
        self.publisher
            .publish_session(&meta, "SessionClosed", json!({"reason": close_reason}))
            .await;
        // The registry drop closed the outbound channel; give the writer a
        // moment to flush any queued close frame.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
        info!(charge_point_id = meta.charge_point_id.as_str(), "Disconnected");

        Ok(())
    }

    /// Credentials, then ownership. Either failure closes the socket.
    async fn admit(&self, path: &ConnectPath, connect: ConnectRequest) -> Result<ConnectionMeta, AdmissionReject> {
        let identity = self
            .authenticator
            .authenticate(&connect)
            .await
            .map_err(|_: AuthFailure| AdmissionReject {
                code: CLOSE_POLICY_VIOLATION,
                reason: "unauthorized".into(),
            })?;

        let claim = self
            .sessions
            .claim(
                &path.charge_point_id,
                path.version,
                &identity.station_id,
                &identity.tenant_id,
            )
            .await
            .map_err(|e| {
                warn!(charge_point_id = path.charge_point_id.as_str(), error = %e, "Session claim failed");
                AdmissionReject {
                    code: CLOSE_TRY_AGAIN,
                    reason: "session directory unavailable".into(),
                }
            })?;

        match claim.status {
            ClaimStatus::Denied => {
                info!(
                    charge_point_id = path.charge_point_id.as_str(),
                    owner = claim.previous_owner_node_id.as_deref().unwrap_or("?"),
                    "Claim denied, already connected elsewhere"
                );
                return Err(AdmissionReject {
                    code: CLOSE_TRY_AGAIN,
                    reason: "already connected".into(),
                });
            }
            ClaimStatus::Takeover => {
                if let Some(previous_owner) = claim.previous_owner_node_id.as_deref() {
                    self.session_control
                        .publish_force_disconnect(
                            previous_owner,
                            ForceDisconnect {
                                charge_point_id: path.charge_point_id.clone(),
                                new_epoch: claim.epoch,
                                new_owner_node_id: self.sessions.node_id().to_string(),
                                reason: "session transferred".into(),
                            },
                        )
                        .await;
                }
            }
            ClaimStatus::Fresh | ClaimStatus::Refreshed => {}
        }

        Ok(ConnectionMeta {
            connection_id: Uuid::new_v4().to_string(),
            charge_point_id: path.charge_point_id.clone(),
            ocpp_version: path.version,
            station_id: identity.station_id,
            tenant_id: identity.tenant_id,
            session_epoch: claim.epoch,
            ip: connect.peer_addr,
        })
    }

    /// One inbound text frame. Returns `false` when the connection must
    /// close (oversized payload).
    async fn process_text(&self, meta: &ConnectionMeta, text: String) -> bool {
        if text.len() > self.settings.max_payload_bytes {
            warn!(
                charge_point_id = meta.charge_point_id.as_str(),
                bytes = text.len(),
                "Payload over limit"
            );
            self.registry
                .close(&meta.charge_point_id, CLOSE_TOO_LARGE, "payload too large");
            return false;
        }
        debug!(charge_point_id = meta.charge_point_id.as_str(), "<- {}", text);

        if let Err(e) = self.sessions.touch(&meta.charge_point_id).await {
            warn!(charge_point_id = meta.charge_point_id.as_str(), error = %e, "Session touch failed");
        }

        if let Some(reply) = self.engine.handle_text(meta, &text).await {
            if let Err(e) = self.registry.send_text(&meta.charge_point_id, reply) {
                debug!(charge_point_id = meta.charge_point_id.as_str(), error = e.as_str(), "Reply undeliverable");
            }
        }
        true
    }
}

#[derive(Debug)]
struct AdmissionReject {
    code: u16,
    reason: String,
}

#[derive(Default)]
struct CapturedHeaders {
    authorization: Option<String>,
    x_api_key: Option<String>,
    x_forwarded_for: Option<String>,
    forwarded: Option<String>,
}

fn header(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::BAD_REQUEST;
    response
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}
