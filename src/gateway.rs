//! Connection gateway: accepts WebSocket clients, speaks the JSON
//! message protocol, and maintains connection health.
//!
//! All registries (connection map, device block list) are owned by the
//! `Gateway` instance, so independent gateways can coexist in tests.
//! Protocol errors are reported to the offending client and never drop
//! the connection; only liveness timeouts, transport errors, or
//! administrative disconnects do.

use crate::buffer::IngestBuffer;
use crate::config::GatewayConfig;
use crate::model::{Reading, SensorType};
use crate::protocol::{close_code, is_clean_close, ClientMessage, ErrorCode, ServerMessage};
use crate::registry::SessionRegistry;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Frames queued for delivery to one socket
#[derive(Debug, Clone)]
pub enum Outbound {
    /// JSON protocol message
    Message(ServerMessage),
    /// Transport-level ping (liveness probe)
    Ping,
    /// Close the socket with the given code
    Close(u16),
}

/// Identity state of a connection.
///
/// Every handler matches on this explicitly; there is no implicit
/// "device id is set" branching.
#[derive(Debug, Clone)]
pub enum ConnectionIdentity {
    /// Socket open, no device bound yet
    Anonymous,
    /// Device bound and session resolved
    Registered {
        device_id: String,
        session_id: String,
    },
}

struct ConnectionEntry {
    identity: ConnectionIdentity,
    outbound: UnboundedSender<Outbound>,
    connected_at: DateTime<Utc>,
    last_pong_at: Instant,
    message_count: u64,
}

/// A registered connection, as reported by the status API
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedDevice {
    pub client_id: String,
    pub device_id: String,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub message_count: u64,
}

/// Gateway-level counters
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub current_connections: usize,
    pub registered_devices: usize,
    pub failed_messages: u64,
}

/// WebSocket gateway over the session registry and ingestion buffer
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<SessionRegistry>,
    buffer: Arc<IngestBuffer>,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    blocks: RwLock<HashMap<String, DateTime<Utc>>>,
    client_seq: AtomicU64,
    total_connections: AtomicU64,
    failed_messages: AtomicU64,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<SessionRegistry>,
        buffer: Arc<IngestBuffer>,
    ) -> Self {
        Self {
            config,
            registry,
            buffer,
            connections: RwLock::new(HashMap::new()),
            blocks: RwLock::new(HashMap::new()),
            client_seq: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            failed_messages: AtomicU64::new(0),
        }
    }

    /// Accept a new connection: assign a client id, queue the welcome
    /// message, and return the outbound frame stream for the socket.
    pub fn register_connection(&self) -> (String, UnboundedReceiver<Outbound>) {
        let seq = self.client_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let client_id = format!("client-{}-{}", seq, Utc::now().timestamp_millis());

        let (tx, rx) = unbounded_channel();
        let entry = ConnectionEntry {
            identity: ConnectionIdentity::Anonymous,
            outbound: tx.clone(),
            connected_at: Utc::now(),
            last_pong_at: Instant::now(),
            message_count: 0,
        };
        self.connections.write().insert(client_id.clone(), entry);

        self.total_connections.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway.connections.total").increment(1);

        let _ = tx.send(Outbound::Message(ServerMessage::Welcome {
            client_id: client_id.clone(),
        }));

        info!(client_id = %client_id, "Connection accepted");
        (client_id, rx)
    }

    /// Drive one accepted WebSocket until it closes.
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket) {
        let (client_id, mut outbound_rx) = self.register_connection();
        let (mut sink, mut stream) = socket.split();

        let writer = tokio::spawn(async move {
            while let Some(out) = outbound_rx.recv().await {
                let result = match out {
                    Outbound::Message(msg) => match serde_json::to_string(&msg) {
                        Ok(text) => sink.send(Message::Text(text)).await,
                        Err(_) => continue,
                    },
                    Outbound::Ping => sink.send(Message::Ping(Vec::new())).await,
                    Outbound::Close(code) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: "".into(),
                            })))
                            .await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        let mut peer_close_code = None;
        while let Some(Ok(frame)) = stream.next().await {
            match frame {
                Message::Text(text) => self.handle_message(&client_id, &text).await,
                Message::Pong(_) => self.handle_pong(&client_id),
                Message::Close(frame) => {
                    peer_close_code = frame.map(|f| f.code);
                    break;
                }
                // Pings are answered at the transport layer
                _ => {}
            }
        }

        self.handle_close(&client_id, peer_close_code).await;
        writer.abort();
    }

    /// Parse and dispatch one raw frame from a client.
    #[instrument(skip(self, raw))]
    pub async fn handle_message(&self, client_id: &str, raw: &str) {
        {
            let mut connections = self.connections.write();
            match connections.get_mut(client_id) {
                Some(entry) => entry.message_count += 1,
                None => return,
            }
        }

        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "Malformed frame");
                self.protocol_error(client_id, ErrorCode::InvalidJson, "Malformed JSON frame");
                return;
            }
        };

        let msg = match serde_json::from_value::<ClientMessage>(value.clone()) {
            Ok(msg) => msg,
            Err(e) => {
                let code = match value.get("type").and_then(Value::as_str) {
                    Some(t) if !KNOWN_TYPES.contains(&t) => ErrorCode::UnknownType,
                    _ => ErrorCode::InvalidJson,
                };
                debug!(client_id = %client_id, error = %e, "Unparseable message");
                self.protocol_error(client_id, code, &e.to_string());
                return;
            }
        };

        match msg {
            ClientMessage::DeviceRegister { device_id } => {
                self.register_device(client_id, &device_id).await;
            }
            ClientMessage::SensorData {
                device_id,
                sensor_type,
                value,
                timestamp,
            } => {
                self.ingest_sensor_data(client_id, device_id, sensor_type, value, timestamp)
                    .await;
            }
            ClientMessage::DeviceUnregister | ClientMessage::DeviceDisconnect => {
                self.unregister(client_id).await;
            }
            ClientMessage::Ping { timestamp } => {
                self.handle_pong(client_id);
                self.send_to(
                    client_id,
                    ServerMessage::Pong {
                        original_timestamp: timestamp,
                    },
                );
            }
        }
    }

    /// Bind a device identity to a connection and resolve its session.
    async fn register_device(&self, client_id: &str, device_id: &str) {
        if self.refuse_if_blocked(client_id, device_id) {
            return;
        }

        let session = match self.registry.get_or_create_active(device_id).await {
            Ok((session, _)) => session,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Session resolution failed");
                return;
            }
        };

        self.bind_identity(client_id, device_id, &session.session_id);
        self.send_to(
            client_id,
            ServerMessage::DeviceRegistered {
                device_id: device_id.to_string(),
                session_id: session.session_id.clone(),
            },
        );

        info!(
            client_id = %client_id,
            device_id = %device_id,
            session_id = %session.session_id,
            "Device registered"
        );
    }

    /// Ingest one reading, binding identity implicitly when the
    /// connection is still anonymous and the message carries a device
    /// id.
    async fn ingest_sensor_data(
        &self,
        client_id: &str,
        msg_device_id: Option<String>,
        sensor_type: SensorType,
        value: Value,
        timestamp: Option<i64>,
    ) {
        let identity = match self.identity_of(client_id) {
            Some(identity) => identity,
            None => return,
        };

        let (device_id, session_id) = match identity {
            ConnectionIdentity::Registered {
                device_id,
                session_id,
            } => {
                if self.refuse_if_blocked(client_id, &device_id) {
                    return;
                }
                (device_id, session_id)
            }
            ConnectionIdentity::Anonymous => {
                let device_id = match msg_device_id {
                    Some(d) if !d.trim().is_empty() => d,
                    _ => {
                        self.protocol_error(
                            client_id,
                            ErrorCode::ValidationFailed,
                            "sensor_data from an unregistered connection requires device_id",
                        );
                        return;
                    }
                };

                if self.refuse_if_blocked(client_id, &device_id) {
                    return;
                }

                let session = match self.registry.get_or_create_active(&device_id).await {
                    Ok((session, _)) => session,
                    Err(e) => {
                        warn!(device_id = %device_id, error = %e, "Session resolution failed");
                        return;
                    }
                };

                self.bind_identity(client_id, &device_id, &session.session_id);
                (device_id, session.session_id)
            }
        };

        let reading = Reading {
            device_id,
            recorded_at: timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()),
            sensor_type,
            value,
            session_id: Some(session_id),
        };

        if self.buffer.enqueue(reading.clone()).await {
            self.send_to(client_id, ServerMessage::Ack);

            // Fan the accepted reading out to live viewers.
            if let Ok(data) = serde_json::to_value(&reading) {
                self.broadcast_except(client_id, ServerMessage::SensorData { data });
            }
        } else {
            self.protocol_error(
                client_id,
                ErrorCode::ValidationFailed,
                "Reading failed validation and was dropped",
            );
        }
    }

    /// Explicit clean close requested by the client.
    async fn unregister(&self, client_id: &str) {
        let identity = match self.identity_of(client_id) {
            Some(identity) => identity,
            None => return,
        };

        match identity {
            ConnectionIdentity::Registered { session_id, .. } => {
                if let Err(e) = self.registry.end_session(&session_id).await {
                    warn!(session_id = %session_id, error = %e, "Failed to end session");
                }
                // Clear identity so the close path does not end it twice.
                if let Some(entry) = self.connections.write().get_mut(client_id) {
                    entry.identity = ConnectionIdentity::Anonymous;
                }
            }
            ConnectionIdentity::Anonymous => {
                self.protocol_error(
                    client_id,
                    ErrorCode::NotRegistered,
                    "No device registered on this connection",
                );
            }
        }

        self.send_outbound(client_id, Outbound::Close(close_code::NORMAL));
    }

    /// Transport-level close observed for a connection.
    ///
    /// A clean close code completes the bound session; an abnormal
    /// close leaves it active for later resumption by the same device.
    pub async fn handle_close(&self, client_id: &str, peer_close_code: Option<u16>) {
        let entry = self.connections.write().remove(client_id);
        let Some(entry) = entry else { return };

        if let ConnectionIdentity::Registered {
            device_id,
            session_id,
        } = entry.identity
        {
            let clean = peer_close_code.map(is_clean_close).unwrap_or(false);
            if clean {
                if let Err(e) = self.registry.end_session(&session_id).await {
                    warn!(session_id = %session_id, error = %e, "Failed to end session");
                }
            } else {
                debug!(
                    device_id = %device_id,
                    session_id = %session_id,
                    "Abnormal close, session left active for resumption"
                );
            }
        }

        info!(client_id = %client_id, code = ?peer_close_code, "Connection closed");
    }

    /// Refresh liveness for a connection.
    pub fn handle_pong(&self, client_id: &str) {
        if let Some(entry) = self.connections.write().get_mut(client_id) {
            entry.last_pong_at = Instant::now();
        }
    }

    /// One liveness pass: terminate connections whose last pong is
    /// older than the grace period, ping the rest.
    pub fn health_check(&self) {
        let timeout = Duration::from_millis(self.config.pong_timeout_ms);
        let now = Instant::now();

        let mut stale = Vec::new();
        {
            let connections = self.connections.read();
            for (client_id, entry) in connections.iter() {
                if now.duration_since(entry.last_pong_at) > timeout {
                    stale.push(client_id.clone());
                } else {
                    let _ = entry.outbound.send(Outbound::Ping);
                }
            }
        }

        for client_id in stale {
            warn!(client_id = %client_id, "Liveness timeout, terminating connection");
            if let Some(entry) = self.connections.write().remove(&client_id) {
                let _ = entry
                    .outbound
                    .send(Outbound::Close(close_code::LIVENESS_TIMEOUT));
            }
            metrics::counter!("gateway.connections.timed_out").increment(1);
        }
    }

    /// Run periodic liveness checks until cancelled.
    pub async fn run_health_checker(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.health_check_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.health_check_interval_ms,
            timeout_ms = self.config.pong_timeout_ms,
            "Health checker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Health checker stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.health_check();
                }
            }
        }
    }

    /// Administratively disconnect a device and refuse reconnection
    /// for `retry_after` (the configured block duration when absent).
    /// Returns false when the device has no open connection.
    pub fn force_disconnect(&self, device_id: &str, retry_after: Option<Duration>) -> bool {
        let target = {
            let connections = self.connections.read();
            connections.iter().find_map(|(client_id, entry)| {
                match &entry.identity {
                    ConnectionIdentity::Registered { device_id: d, .. } if d == device_id => {
                        Some((client_id.clone(), entry.outbound.clone()))
                    }
                    _ => None,
                }
            })
        };

        let Some((client_id, outbound)) = target else {
            return false;
        };

        let retry_after_ms = retry_after
            .map(|d| d.as_millis() as u64)
            .unwrap_or(self.config.block_duration_ms);
        self.blocks.write().insert(
            device_id.to_string(),
            Utc::now() + chrono::Duration::milliseconds(retry_after_ms as i64),
        );

        let _ = outbound.send(Outbound::Message(ServerMessage::ForceDisconnect {
            retry_after_ms,
        }));

        // Close shortly after so the notice has a chance to flush.
        let grace = Duration::from_millis(self.config.close_grace_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = outbound.send(Outbound::Close(close_code::FORCE_DISCONNECT));
        });

        info!(
            client_id = %client_id,
            device_id = %device_id,
            retry_after_ms,
            "Force disconnect issued"
        );
        metrics::counter!("gateway.devices.force_disconnected").increment(1);
        true
    }

    /// Whether the device is currently denylisted. Expired blocks are
    /// evicted lazily here; there is no background sweep.
    pub fn is_blocked(&self, device_id: &str) -> bool {
        let mut blocks = self.blocks.write();
        match blocks.get(device_id) {
            Some(until) if *until > Utc::now() => true,
            Some(_) => {
                blocks.remove(device_id);
                false
            }
            None => false,
        }
    }

    /// Connections that have completed registration
    pub fn connected_devices(&self) -> Vec<ConnectedDevice> {
        let connections = self.connections.read();
        connections
            .iter()
            .filter_map(|(client_id, entry)| match &entry.identity {
                ConnectionIdentity::Registered {
                    device_id,
                    session_id,
                } => Some(ConnectedDevice {
                    client_id: client_id.clone(),
                    device_id: device_id.clone(),
                    session_id: session_id.clone(),
                    connected_at: entry.connected_at,
                    message_count: entry.message_count,
                }),
                ConnectionIdentity::Anonymous => None,
            })
            .collect()
    }

    /// Send a protocol message to every open connection.
    pub fn broadcast(&self, msg: ServerMessage) {
        let connections = self.connections.read();
        for entry in connections.values() {
            let _ = entry.outbound.send(Outbound::Message(msg.clone()));
        }
    }

    /// Gateway-level counters
    pub fn stats(&self) -> GatewayStats {
        let connections = self.connections.read();
        let registered_devices = connections
            .values()
            .filter(|e| matches!(e.identity, ConnectionIdentity::Registered { .. }))
            .count();
        GatewayStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            current_connections: connections.len(),
            registered_devices,
            failed_messages: self.failed_messages.load(Ordering::Relaxed),
        }
    }

    fn refuse_if_blocked(&self, client_id: &str, device_id: &str) -> bool {
        if !self.is_blocked(device_id) {
            return false;
        }
        warn!(client_id = %client_id, device_id = %device_id, "Blocked device refused");
        self.protocol_error(client_id, ErrorCode::DeviceBlocked, "Device is blocked");
        self.send_outbound(client_id, Outbound::Close(close_code::DEVICE_BLOCKED));
        true
    }

    fn bind_identity(&self, client_id: &str, device_id: &str, session_id: &str) {
        if let Some(entry) = self.connections.write().get_mut(client_id) {
            entry.identity = ConnectionIdentity::Registered {
                device_id: device_id.to_string(),
                session_id: session_id.to_string(),
            };
        }
    }

    fn identity_of(&self, client_id: &str) -> Option<ConnectionIdentity> {
        self.connections
            .read()
            .get(client_id)
            .map(|e| e.identity.clone())
    }

    fn protocol_error(&self, client_id: &str, code: ErrorCode, message: &str) {
        self.failed_messages.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway.messages.failed").increment(1);
        self.send_to(
            client_id,
            ServerMessage::Error {
                error_code: code,
                error_message: message.to_string(),
            },
        );
    }

    fn send_to(&self, client_id: &str, msg: ServerMessage) {
        self.send_outbound(client_id, Outbound::Message(msg));
    }

    fn send_outbound(&self, client_id: &str, out: Outbound) {
        let connections = self.connections.read();
        if let Some(entry) = connections.get(client_id) {
            let _ = entry.outbound.send(out);
        }
    }

    fn broadcast_except(&self, client_id: &str, msg: ServerMessage) {
        let connections = self.connections.read();
        for (other_id, entry) in connections.iter() {
            if other_id != client_id {
                let _ = entry.outbound.send(Outbound::Message(msg.clone()));
            }
        }
    }
}

const KNOWN_TYPES: &[&str] = &[
    "device_register",
    "sensor_data",
    "device_unregister",
    "device_disconnect",
    "ping",
];
