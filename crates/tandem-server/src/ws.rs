//! WebSocket connection handling.
//!
//! The first frame on a socket must be `Connect{token}`; the credential is
//! verified before any presence registration or channel join, and a bad one
//! closes the socket with an `Error` frame. After the handshake the loop
//! relays frames both ways: client Join/Leave/Publish/Ping on one side,
//! live events from joined channels on the other. A malformed frame is
//! answered with an `Error` frame and the connection stays up.

use crate::metrics::{self, ConnectionMetricsGuard};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use bytes::BytesMut;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tandem_core::event::names;
use tandem_core::{user_channel, LiveEvent, PRESENCE_CHANNEL};
use tandem_engine::CredentialVerifier;
use tandem_protocol::{codec, Frame, PROTOCOL_VERSION};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Protocol error codes sent in `Error` frames.
mod codes {
    pub const MALFORMED: u16 = 1001;
    pub const JOIN_FAILED: u16 = 1002;
    pub const AUTH_FAILED: u16 = 1003;
    pub const FORBIDDEN: u16 = 1004;
    pub const HANDSHAKE_EXPECTED: u16 = 1005;
}

type WsSender = SplitSink<WebSocket, Message>;
type EventTx = tokio::sync::mpsc::UnboundedSender<Arc<LiveEvent>>;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = state.next_connection_id();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Handshake: nothing happens before a verified Connect frame.
    let principal = match handshake(
        &state,
        &connection_id,
        &mut sender,
        &mut receiver,
        &mut read_buffer,
    )
    .await
    {
        Some(principal) => principal,
        None => {
            debug!(connection = %connection_id, "Handshake failed, closing");
            return;
        }
    };

    let came_online = state.registry.register(&principal, &connection_id);

    // Merged stream of events from every joined channel.
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<Arc<LiveEvent>>();
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    // Every connection listens on its principal's channel and the global
    // presence channel.
    for channel in [user_channel(&principal), PRESENCE_CHANNEL.to_string()] {
        match state.router.join(&connection_id, &channel) {
            Ok(rx) => {
                forwarders.insert(channel, spawn_forwarder(rx, event_tx.clone()));
            }
            Err(e) => {
                warn!(connection = %connection_id, channel = %channel, error = %e, "Auto-join failed");
            }
        }
    }

    if came_online {
        state.router.publish_to(
            PRESENCE_CHANNEL,
            names::USER_ONLINE,
            serde_json::json!({ "principal": principal }),
        );
    }

    let connected = Frame::connected(
        &connection_id,
        &principal,
        PROTOCOL_VERSION,
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sender, &connected).await.is_err() {
        teardown(&state, &connection_id, forwarders);
        return;
    }

    // Frame loop
    loop {
        tokio::select! {
            biased;

            Some(event) = event_rx.recv() => {
                if !event.deliverable_to(&connection_id) {
                    continue;
                }
                let frame = Frame::event(&event.channel, &event.event, event.payload.clone());
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        if process_buffer(
                            &state,
                            &connection_id,
                            &principal,
                            &mut sender,
                            &mut read_buffer,
                            &mut forwarders,
                            &event_tx,
                        )
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
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    teardown(&state, &connection_id, forwarders);
    debug!(connection = %connection_id, principal = %principal, "WebSocket disconnected");
}

/// Read frames until a `Connect` arrives and its credential verifies.
///
/// Returns the authenticated principal, or `None` when the socket must
/// close (bad credential, wrong first frame, stream ended).
async fn handshake(
    state: &Arc<AppState>,
    connection_id: &str,
    sender: &mut WsSender,
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
) -> Option<String> {
    loop {
        match codec::decode_from(read_buffer) {
            Ok(Some(Frame::Connect { version, token })) => {
                debug!(connection = %connection_id, version, "Connect frame");
                match state.verifier.verify(&token).await {
                    Ok(principal) => return Some(principal),
                    Err(e) => {
                        metrics::record_error("auth");
                        let _ = send_frame(
                            sender,
                            &Frame::error(0, codes::AUTH_FAILED, e.to_string()),
                        )
                        .await;
                        return None;
                    }
                }
            }
            Ok(Some(other)) => {
                warn!(
                    connection = %connection_id,
                    frame_type = ?other.frame_type(),
                    "First frame was not Connect"
                );
                let _ = send_frame(
                    sender,
                    &Frame::error(0, codes::HANDSHAKE_EXPECTED, "Expected Connect frame"),
                )
                .await;
                return None;
            }
            Ok(None) => {
                // Need more bytes
                match receiver.next().await {
                    Some(Ok(Message::Binary(data))) => read_buffer.extend_from_slice(&data),
                    Some(Ok(Message::Text(text))) => read_buffer.extend_from_slice(text.as_bytes()),
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            return None;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error in handshake");
                        return None;
                    }
                }
            }
            Err(e) => {
                metrics::record_error("protocol");
                let _ =
                    send_frame(sender, &Frame::error(0, codes::MALFORMED, e.to_string())).await;
                return None;
            }
        }
    }
}

/// Decode and handle every complete frame in the read buffer.
///
/// A malformed frame is reported with an `Error` frame and skipped; only a
/// dead socket errors out of here.
async fn process_buffer(
    state: &Arc<AppState>,
    connection_id: &str,
    principal: &str,
    sender: &mut WsSender,
    read_buffer: &mut BytesMut,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    event_tx: &EventTx,
) -> Result<()> {
    loop {
        let buffered = read_buffer.len();
        match codec::decode_from(read_buffer) {
            Ok(Some(frame)) => {
                let consumed = buffered - read_buffer.len();
                metrics::record_frame(consumed, "inbound");
                handle_frame(
                    &frame,
                    state,
                    connection_id,
                    principal,
                    sender,
                    forwarders,
                    event_tx,
                )
                .await?;
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                // The offending bytes are consumed; keep the connection.
                warn!(connection = %connection_id, error = %e, "Malformed frame");
                metrics::record_error("protocol");
                send_frame(sender, &Frame::error(0, codes::MALFORMED, e.to_string())).await?;
            }
        }
    }
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: &Frame,
    state: &Arc<AppState>,
    connection_id: &str,
    principal: &str,
    sender: &mut WsSender,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    event_tx: &EventTx,
) -> Result<()> {
    match frame {
        Frame::Join { id, channel } => {
            debug!(connection = %connection_id, channel = %channel, "Join request");

            // Personal channels are not joinable by anyone else.
            if channel.starts_with("user:") && *channel != user_channel(principal) {
                send_frame(
                    sender,
                    &Frame::error(*id, codes::FORBIDDEN, "Cannot join another user's channel"),
                )
                .await?;
                return Ok(());
            }

            let response = match state.router.join(connection_id, channel) {
                Ok(rx) => {
                    if let Some(old) = forwarders.insert(channel.clone(), spawn_forwarder(rx, event_tx.clone())) {
                        old.abort();
                    }
                    metrics::record_join();
                    metrics::set_active_channels(state.router.stats().channel_count);
                    Frame::ack(*id)
                }
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Join failed");
                    Frame::error(*id, codes::JOIN_FAILED, e.to_string())
                }
            };

            send_frame(sender, &response).await?;
        }

        Frame::Leave { id, channel } => {
            debug!(connection = %connection_id, channel = %channel, "Leave request");

            if let Some(handle) = forwarders.remove(channel) {
                handle.abort();
            }
            state.router.leave(connection_id, channel);
            metrics::set_active_channels(state.router.stats().channel_count);

            // Leave is idempotent, always acknowledged
            send_frame(sender, &Frame::ack(*id)).await?;
        }

        Frame::Publish {
            id,
            channel,
            event,
            payload,
            exclude_self,
        } => {
            let count = if *exclude_self {
                state
                    .router
                    .publish_excluding(channel, event.clone(), payload.clone(), connection_id)
            } else {
                state.router.publish(
                    LiveEvent::new(channel, event.clone(), payload.clone())
                        .with_source(connection_id),
                )
            };
            debug!(connection = %connection_id, channel = %channel, recipients = count, "Published");

            if let Some(req_id) = id {
                send_frame(sender, &Frame::ack(*req_id)).await?;
            }
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(*timestamp)).await?;
        }

        Frame::Pong { .. } => {
            // Keepalive only
        }

        Frame::Connect { .. } => {
            debug!(connection = %connection_id, "Connect frame on established connection, ignoring");
        }

        _ => {
            warn!(connection = %connection_id, frame_type = ?frame.frame_type(), "Unexpected frame type");
        }
    }

    Ok(())
}

/// Forward events from a channel's broadcast receiver into the connection's
/// merged event stream.
fn spawn_forwarder(
    mut rx: broadcast::Receiver<Arc<LiveEvent>>,
    tx: EventTx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        break; // Connection gone
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event receiver lagged");
                    continue;
                }
            }
        }
    })
}

/// Tear down presence and memberships for a connection.
fn teardown(
    state: &Arc<AppState>,
    connection_id: &str,
    forwarders: HashMap<String, JoinHandle<()>>,
) {
    for (_, handle) in forwarders {
        handle.abort();
    }

    state.router.leave_all(connection_id);

    if let Some((principal, went_offline)) = state.registry.deregister(connection_id) {
        if went_offline {
            state.router.publish_to(
                PRESENCE_CHANNEL,
                names::USER_OFFLINE,
                serde_json::json!({ "principal": principal }),
            );
        }
    }

    metrics::set_active_channels(state.router.stats().channel_count);
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
