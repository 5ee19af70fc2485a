//! Connection handlers for the Convoy server.
//!
//! This module owns the shared state, the background maintenance tasks and
//! the WebSocket connection lifecycle.

use crate::config::Config;
use crate::http;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use convoy_core::{
    CompletionFeed, CompletionRecord, Convoy, ConvoyError, Coordinates, DirectoryError,
    IdentityVerifier, JourneyId, LocationReport, MemberIdentity, MemoryCacheBackend,
    MemoryDirectory, MemoryStore, Notification, PublishOutcome, Push, RoomSubscription,
    SubscriptionError,
};
use convoy_protocol::{codec, Frame, ProtocolError, PROTOCOL_VERSION};

/// Frames a connection may have queued before its room forwarders wait.
///
/// A waiting forwarder stops draining its room, so a connection that cannot
/// keep up falls behind in the room buffer and is resynced from a snapshot.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Shared server state.
pub struct AppState {
    /// The synchronization engine.
    pub convoy: Convoy,
    /// Resolves session tokens for both HTTP and WebSocket callers.
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Cache backend, kept for periodic purging.
    pub cache_backend: Arc<MemoryCacheBackend>,
    /// Server configuration.
    pub config: Config,
    connections: AtomicUsize,
}

impl AppState {
    /// Create new app state, returning the receiving end of the completion
    /// feed.
    #[must_use]
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<CompletionRecord>) {
        let directory: Arc<MemoryDirectory> = Arc::new(config.build_directory());
        let cache_backend = Arc::new(MemoryCacheBackend::new());
        let (feed, completions) = CompletionFeed::channel();

        let mut engine_config = config.engine_config();
        engine_config.completion_feed = Some(feed);

        let convoy = Convoy::with_config(
            Arc::new(MemoryStore::new()),
            directory.clone(),
            cache_backend.clone(),
            engine_config,
        );

        let state = Self {
            convoy,
            verifier: directory,
            cache_backend,
            config,
            connections: AtomicUsize::new(0),
        };
        (state, completions)
    }

    /// Resolve a session token within the authorization window.
    pub(crate) async fn verify_token(
        &self,
        token: &str,
    ) -> Result<Option<MemberIdentity>, ConvoyError> {
        match tokio::time::timeout(self.config.auth_timeout(), self.verifier.verify(token)).await {
            Ok(Ok(identity)) => Ok(identity),
            Ok(Err(DirectoryError::Unreachable(reason))) => Err(ConvoyError::Unavailable(reason)),
            Err(_) => Err(ConvoyError::Timeout("identity lookup timed out".into())),
        }
    }
}

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(http::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let (state, completions) = AppState::new(config.clone());
    let state = Arc::new(state);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    tokio::spawn(drain_completions(completions));
    tokio::spawn(maintenance_loop(state.clone()));

    let app = app(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Convoy server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Hand completed instances to downstream consumers.
async fn drain_completions(mut completions: mpsc::UnboundedReceiver<CompletionRecord>) {
    while let Some(record) = completions.recv().await {
        metrics::record_completion();
        info!(
            instance = %record.instance_id,
            journey = %record.journey_id,
            user = %record.user_id,
            distance_km = record.distance_km,
            "Instance completed"
        );
    }
    debug!("Completion feed closed");
}

/// Prune silent connections, purge expired cache entries and refresh gauges.
async fn maintenance_loop(state: Arc<AppState>) {
    let timeout = state.config.heartbeat_timeout();
    let mut ticker =
        tokio::time::interval(Duration::from_millis(state.config.heartbeat.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let pruned = state.convoy.hub().prune_stale(timeout);
        if !pruned.is_empty() {
            info!(count = pruned.len(), "Pruned stale connections");
        }

        let purged = state.cache_backend.purge_expired();
        if purged > 0 {
            debug!(count = purged, "Purged expired cache entries");
        }

        metrics::set_engine_stats(state.convoy.hub().stats(), state.convoy.cache().stats());
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.convoy.hub().stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "rooms": stats.room_count,
        "connections": state.connections.load(Ordering::Relaxed),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.connections.load(Ordering::Relaxed) >= state.config.limits.max_connections {
        warn!("Connection limit reached, rejecting upgrade");
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

type WsSender = SplitSink<WebSocket, Message>;

/// Failures while establishing a session.
#[derive(Debug, Error)]
enum HandshakeError {
    #[error("Handshake timed out")]
    Timeout,

    #[error("Connection closed during handshake")]
    Closed,

    #[error("Expected a connect frame")]
    UnexpectedFrame,

    #[error("Malformed frame: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Missing session token")]
    MissingToken,

    #[error("Invalid session token")]
    InvalidToken,

    #[error(transparent)]
    Engine(#[from] ConvoyError),
}

impl HandshakeError {
    fn error_frame(&self) -> Frame {
        let (code, kind) = match self {
            HandshakeError::Timeout | HandshakeError::Closed => (1504, "timeout"),
            HandshakeError::UnexpectedFrame | HandshakeError::Malformed(_) => (1000, "bad_request"),
            HandshakeError::UnsupportedVersion(_) => (1005, "unsupported_version"),
            HandshakeError::MissingToken | HandshakeError::InvalidToken => {
                (1401, "unauthenticated")
            }
            HandshakeError::Engine(e) => (e.kind().code(), e.kind().as_str()),
        };
        Frame::error(0, code, kind, self.to_string())
    }
}

/// Per-connection session.
struct Session {
    connection_id: String,
    identity: MemberIdentity,
    rooms: HashMap<JourneyId, JoinHandle<()>>,
    outbound: mpsc::Sender<Outbound>,
}

/// Work queued for the connection by its room forwarders.
#[derive(Debug)]
enum Outbound {
    Notification(Arc<Notification>),
    /// The forwarder lagged; the client needs a fresh snapshot.
    Resync(JourneyId),
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();
    state.connections.fetch_add(1, Ordering::Relaxed);

    let connection_id = format!("conn_{}", Uuid::new_v4().simple());
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    let identity = match authenticate(&mut receiver, &mut read_buffer, &state).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Handshake failed");
            metrics::record_error("handshake");
            let _ = send_frame(&mut sender, &e.error_frame()).await;
            let _ = sender.close().await;
            state.connections.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };

    let connected = Frame::connected(
        &connection_id,
        &identity.user_id,
        PROTOCOL_VERSION.major,
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        state.connections.fetch_sub(1, Ordering::Relaxed);
        return;
    }

    info!(connection = %connection_id, user = %identity.user_id, "Session established");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_CAPACITY);
    let mut session = Session {
        connection_id,
        identity,
        rooms: HashMap::new(),
        outbound: outbound_tx,
    };

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            Some(outbound) = outbound_rx.recv() => {
                let frame = match outbound {
                    Outbound::Notification(notification) => {
                        match notification_frame(&notification) {
                            Ok(frame) => frame,
                            Err(e) => {
                                error!(
                                    connection = %session.connection_id,
                                    error = %e,
                                    "Failed to encode notification"
                                );
                                continue;
                            }
                        }
                    }
                    Outbound::Resync(journey_id) => {
                        match snapshot_frame(&state, &session, 0, journey_id).await {
                            Ok(frame) => frame,
                            Err(e) => error_frame(0, &e),
                        }
                    }
                };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);
                        state.convoy.hub().touch(&session.connection_id);

                        if process_buffer(&mut read_buffer, &state, &mut session, &mut sender)
                            .await
                            .is_err()
                        {
                            break;
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                        if process_buffer(&mut read_buffer, &state, &mut session, &mut sender)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        state.convoy.hub().touch(&session.connection_id);
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.convoy.hub().touch(&session.connection_id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %session.connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %session.connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %session.connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: stop forwarders, then leave every room
    for (_, handle) in session.rooms.drain() {
        handle.abort();
    }
    let left = state.convoy.disconnect(&session.connection_id);
    state.connections.fetch_sub(1, Ordering::Relaxed);
    metrics::set_engine_stats(state.convoy.hub().stats(), state.convoy.cache().stats());

    debug!(connection = %session.connection_id, rooms = left, "WebSocket disconnected");
}

/// Wait for the Connect frame and resolve its token.
async fn authenticate(
    receiver: &mut SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
    state: &AppState,
) -> Result<MemberIdentity, HandshakeError> {
    let deadline = tokio::time::Instant::now() + state.config.heartbeat_timeout();

    let frame = loop {
        if let Some(frame) = codec::decode_from(read_buffer)? {
            break frame;
        }
        let msg = tokio::time::timeout_at(deadline, receiver.next())
            .await
            .map_err(|_| HandshakeError::Timeout)?;
        match msg {
            Some(Ok(Message::Binary(data))) => read_buffer.extend_from_slice(&data),
            Some(Ok(Message::Text(text))) => read_buffer.extend_from_slice(text.as_bytes()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_)) | Err(_)) | None => return Err(HandshakeError::Closed),
        }
    };

    let Frame::Connect { version, token } = frame else {
        return Err(HandshakeError::UnexpectedFrame);
    };
    if !PROTOCOL_VERSION.accepts_major(version) {
        return Err(HandshakeError::UnsupportedVersion(version));
    }
    let token = token.ok_or(HandshakeError::MissingToken)?;

    state
        .verify_token(&token)
        .await?
        .ok_or(HandshakeError::InvalidToken)
}

/// Decode and handle every complete frame in the buffer.
async fn process_buffer(
    read_buffer: &mut BytesMut,
    state: &Arc<AppState>,
    session: &mut Session,
    sender: &mut WsSender,
) -> Result<()> {
    loop {
        let frame = match codec::decode_from(read_buffer) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(
                    connection = %session.connection_id,
                    error = %e,
                    "Dropping undecodable input"
                );
                metrics::record_error("protocol");
                read_buffer.clear();
                send_frame(sender, &Frame::error(0, 1000, "bad_request", e.to_string())).await?;
                return Ok(());
            }
        };

        if let Err(e) = handle_frame(frame, state, session, sender).await {
            error!(connection = %session.connection_id, error = %e, "Frame handling error");
            return Err(e);
        }
    }
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    state: &Arc<AppState>,
    session: &mut Session,
    sender: &mut WsSender,
) -> Result<()> {
    let response = match frame {
        Frame::Join { id, journey_id } => {
            debug!(connection = %session.connection_id, journey = %journey_id, "Join request");
            match join_room(state, session, id, &journey_id).await {
                Ok(frame) => frame,
                Err(e) => error_frame(id, &e),
            }
        }

        Frame::Leave { id, journey_id } => {
            debug!(connection = %session.connection_id, journey = %journey_id, "Leave request");
            match parse_id(&journey_id, "journey").and_then(|journey_id| {
                if let Some(handle) = session.rooms.remove(&journey_id) {
                    handle.abort();
                }
                state.convoy.leave(journey_id, &session.connection_id)
            }) {
                Ok(()) => Frame::ack(id),
                Err(e) => error_frame(id, &e),
            }
        }

        Frame::UpdateLocation {
            id,
            instance_id,
            latitude,
            longitude,
            speed,
            heading,
            client_distance,
            recorded_at,
        } => {
            let result = async {
                let instance_id = parse_id(&instance_id, "instance")?;
                let mut report = LocationReport::at(Coordinates::new(latitude, longitude));
                report.speed = speed;
                report.heading = heading;
                report.client_distance_km = client_distance;
                if let Some(ms) = recorded_at {
                    report.recorded_at = Some(DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(
                        || ConvoyError::Validation(format!("recorded_at {ms} is out of range")),
                    )?);
                }
                state
                    .convoy
                    .update_location(instance_id, &session.identity.user_id, report)
                    .await
            }
            .await;

            match result {
                Ok(outcome) => {
                    metrics::record_location_update(&outcome);
                    match outcome {
                        PublishOutcome::Throttled { retry_after } => {
                            Frame::throttled(id, retry_after.as_millis() as u64)
                        }
                        PublishOutcome::Accepted { .. } | PublishOutcome::Filtered => {
                            Frame::ack(id)
                        }
                    }
                }
                Err(e) => {
                    metrics::record_location_rejected();
                    error_frame(id, &e)
                }
            }
        }

        Frame::RequestSnapshot { id, journey_id } => {
            metrics::record_snapshot_request();
            match parse_id(&journey_id, "journey") {
                Ok(journey_id) => match snapshot_frame(state, session, id, journey_id).await {
                    Ok(frame) => frame,
                    Err(e) => error_frame(id, &e),
                },
                Err(e) => error_frame(id, &e),
            }
        }

        Frame::Ping { timestamp } => Frame::pong(timestamp),

        Frame::Pong { .. } => return Ok(()),

        Frame::Connect { .. } => {
            debug!(connection = %session.connection_id, "Connect frame (already connected)");
            return Ok(());
        }

        other => {
            warn!(
                connection = %session.connection_id,
                frame_type = ?other.frame_type(),
                "Unexpected frame type"
            );
            metrics::record_error("unexpected_frame");
            return Ok(());
        }
    };

    send_frame(sender, &response).await
}

/// Join a room and start forwarding its notifications to this connection.
async fn join_room(
    state: &Arc<AppState>,
    session: &mut Session,
    request_id: u64,
    journey_id: &str,
) -> Result<Frame, ConvoyError> {
    let journey_id = parse_id(journey_id, "journey")?;
    let (snapshot, subscription) = state
        .convoy
        .join(journey_id, &session.connection_id, &session.identity)
        .await?;

    let handle = spawn_forwarder(subscription, session.outbound.clone());
    session.rooms.insert(journey_id, handle);
    metrics::set_engine_stats(state.convoy.hub().stats(), state.convoy.cache().stats());

    Ok(Frame::Snapshot {
        id: request_id,
        journey_id: journey_id.to_string(),
        snapshot: to_value(&snapshot)?,
    })
}

async fn snapshot_frame(
    state: &AppState,
    session: &Session,
    request_id: u64,
    journey_id: JourneyId,
) -> Result<Frame, ConvoyError> {
    let snapshot = state
        .convoy
        .snapshot(journey_id, &session.identity.user_id)
        .await?;
    Ok(Frame::Snapshot {
        id: request_id,
        journey_id: journey_id.to_string(),
        snapshot: to_value(&snapshot)?,
    })
}

/// Forward a room's notifications into the connection's outbound queue.
///
/// Waits while the queue is full; whatever the room drops meanwhile comes
/// back as a lag and is replaced by a resync.
fn spawn_forwarder(
    mut subscription: RoomSubscription,
    outbound: mpsc::Sender<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let journey_id = subscription.journey_id();
        loop {
            match subscription.recv().await {
                Ok(notification) => {
                    if outbound
                        .send(Outbound::Notification(notification))
                        .await
                        .is_err()
                    {
                        break; // Connection gone
                    }
                }
                Err(SubscriptionError::Lagged(missed)) => {
                    debug!(
                        connection = %subscription.connection_id(),
                        journey = %journey_id,
                        missed,
                        "Forwarder lagged, requesting resync"
                    );
                    if outbound.send(Outbound::Resync(journey_id)).await.is_err() {
                        break;
                    }
                }
                Err(SubscriptionError::Closed) => break,
            }
        }
    })
}

/// Translate a room notification into its wire frame.
fn notification_frame(notification: &Notification) -> Result<Frame, serde_json::Error> {
    let journey_id = notification.journey_id.to_string();
    Ok(match &notification.push {
        Push::LocationUpdated(patch) => Frame::LocationUpdated {
            journey_id,
            patch: serde_json::to_value(patch)?,
        },
        Push::Presence { action, member } => Frame::Presence {
            journey_id,
            action: *action,
            member: serde_json::to_value(member)?,
        },
        Push::StatusChanged(change) => Frame::StatusChanged {
            journey_id,
            instance: serde_json::to_value(change)?,
        },
        Push::EventAppended(event) => Frame::EventAppended {
            journey_id,
            event: serde_json::to_value(event)?,
        },
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ConvoyError> {
    serde_json::to_value(value)
        .map_err(|e| ConvoyError::Unavailable(format!("failed to encode response: {e}")))
}

pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid, ConvoyError> {
    Uuid::parse_str(raw).map_err(|_| ConvoyError::Validation(format!("invalid {what} id: {raw}")))
}

fn error_frame(request_id: u64, error: &ConvoyError) -> Frame {
    let kind = error.kind();
    metrics::record_error(kind.as_str());
    Frame::error(request_id, kind.code(), kind.as_str(), error.to_string())
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::{EventBody, LocationPatch, RideEvent, Room};
    use convoy_protocol::PresenceAction;

    fn notification(push: Push) -> Notification {
        Notification {
            sequence: 1,
            journey_id: Uuid::new_v4(),
            exclude_user: None,
            exclude_connection: None,
            push,
        }
    }

    #[test]
    fn test_parse_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string(), "journey").unwrap(), id);

        let err = parse_id("nope", "journey").unwrap_err();
        assert_eq!(err.kind().as_str(), "validation");
    }

    #[test]
    fn test_error_frame_carries_kind_and_code() {
        let frame = error_frame(7, &ConvoyError::Forbidden("not yours".into()));
        match frame {
            Frame::Error { id, code, kind, .. } => {
                assert_eq!(id, 7);
                assert_eq!(kind, "forbidden");
                assert_eq!(code, ConvoyError::Forbidden(String::new()).kind().code());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_handshake_error_frames() {
        match HandshakeError::InvalidToken.error_frame() {
            Frame::Error { code, kind, .. } => {
                assert_eq!(code, 1401);
                assert_eq!(kind, "unauthenticated");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        match HandshakeError::UnsupportedVersion(9).error_frame() {
            Frame::Error { code, message, .. } => {
                assert_eq!(code, 1005);
                assert!(message.contains('9'));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_notification_frames() {
        let patch = LocationPatch {
            journey_id: Uuid::new_v4(),
            instance_id: Uuid::new_v4(),
            user_id: "alice".into(),
            coordinates: Coordinates::new(48.85, 2.35),
            speed: Some(24.0),
            heading: None,
            distance_km: 1.5,
            moving_seconds: 270.0,
            average_speed_kmh: 20.0,
            top_speed_kmh: 30.0,
            recorded_at: Utc::now(),
        };
        let n = notification(Push::LocationUpdated(patch));
        match notification_frame(&n).unwrap() {
            Frame::LocationUpdated { journey_id, patch } => {
                assert_eq!(journey_id, n.journey_id.to_string());
                assert_eq!(patch["user_id"], "alice");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let member = convoy_core::PresenceState::new("conn_1", &MemberIdentity::new("bob", "Bob"));
        let n = notification(Push::Presence {
            action: PresenceAction::Joined,
            member,
        });
        match notification_frame(&n).unwrap() {
            Frame::Presence { action, member, .. } => {
                assert_eq!(action, PresenceAction::Joined);
                assert_eq!(member["display_name"], "Bob");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let event = RideEvent {
            id: Uuid::new_v4(),
            journey_id: n.journey_id,
            instance_id: Some(Uuid::new_v4()),
            user_id: "bob".into(),
            body: EventBody::Message { text: "flat tyre".into() },
            coordinates: None,
            created_at: Utc::now(),
        };
        let n = notification(Push::EventAppended(event));
        assert!(matches!(
            notification_frame(&n).unwrap(),
            Frame::EventAppended { .. }
        ));
    }

    #[tokio::test]
    async fn test_slow_connection_is_resynced() {
        let journey_id = Uuid::new_v4();
        let mut room = Room::with_capacity(journey_id, 4);
        let (subscription, _) = room.subscribe("conn_a", &MemberIdentity::new("alice", "Alice"));
        let (outbound, mut queue) = mpsc::channel(1);
        let forwarder = spawn_forwarder(subscription, outbound);

        let bob = convoy_core::PresenceState::new("conn_b", &MemberIdentity::new("bob", "Bob"));
        let presence = || Push::Presence {
            action: PresenceAction::Joined,
            member: bob.clone(),
        };
        let settle = || async {
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
        };

        // One notification fills the queue, the next parks the forwarder.
        room.publish(presence(), None, None);
        settle().await;
        room.publish(presence(), None, None);
        settle().await;
        // The room overflows while nobody drains it.
        for _ in 0..8 {
            room.publish(presence(), None, None);
        }

        assert!(matches!(queue.recv().await, Some(Outbound::Notification(_))));
        assert!(matches!(queue.recv().await, Some(Outbound::Notification(_))));
        assert!(matches!(queue.recv().await, Some(Outbound::Resync(id)) if id == journey_id));

        drop(queue);
        room.publish(presence(), None, None);
        forwarder.await.unwrap();
    }

    #[tokio::test]
    async fn test_app_state_wires_directory() {
        let mut config = Config::default();
        config.directory.users.push(crate::config::UserEntry {
            id: "alice".into(),
            name: "Alice".into(),
            avatar: None,
            token: Some("tok-alice".into()),
        });
        let (state, _completions) = AppState::new(config);

        let identity = state.verify_token("tok-alice").await.unwrap().unwrap();
        assert_eq!(identity.user_id, "alice");
        assert!(state.verify_token("tok-nobody").await.unwrap().is_none());
    }
}
