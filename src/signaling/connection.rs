#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::admission;
use super::protocol::{Envelope, ErrorCode, MessageBody};
use crate::metrics::ServerMetrics;
use crate::room::{Outbound, OutboundSender, ParticipantPatch, RegistryError, RoomRegistry};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale — drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close connection if no message received within this duration.
/// Prevents Slowloris-style attacks that hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

const MAX_CHAT_LEN: usize = 4096;

/// What this connection is attached to. One connection is bound to at most
/// one participant or waiting candidate; the registry knows which.
#[derive(Debug, Clone)]
pub struct Binding {
    pub room_id: String,
    pub participant_id: String,
}

/// Serialize an envelope and queue it on this connection's outbound channel.
pub(crate) fn send_envelope(sender: &OutboundSender, envelope: &Envelope) {
    match serde_json::to_string(envelope) {
        Ok(json) => {
            if sender.try_send(Outbound::Frame(Arc::new(json))).is_err() {
                debug!("Dropped outbound message: channel full or closed");
            }
        }
        Err(e) => warn!("Failed to serialize outbound message: {}", e),
    }
}

pub(crate) fn send_error(
    sender: &OutboundSender,
    message: impl Into<String>,
    code: Option<ErrorCode>,
) {
    send_envelope(sender, &Envelope::error(message, code));
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);

    // Clone for the send task
    let connection_id_clone = connection_id.clone();
    let send_metrics = metrics.clone();

    // Spawn task to send messages to client. A Close frame queued by the
    // registry (kick / reject) terminates the socket from here.
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Frame(json) => {
                    send_metrics.inc_messages_sent();
                    if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        debug!("Send task finished for connection: {}", connection_id_clone);
    });

    let mut binding: Option<Binding> = None;

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}", connection_id);
                        send_error(
                            &tx,
                            format!(
                                "Rate limit exceeded: max {} messages/second",
                                RATE_LIMIT_REFILL_RATE
                            ),
                            None,
                        );
                    }
                    continue;
                }

                match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => {
                        let start = Instant::now();
                        dispatch(envelope, &mut binding, &tx, &registry, &metrics).await;
                        metrics.observe_message_handling(start.elapsed());
                    }
                    Err(e) => {
                        debug!("Invalid message format: {}", e);
                        metrics.inc_errors();
                        send_error(&tx, "Invalid message format", None);
                    }
                }
            }
            Message::Close(_) => {
                info!("Client closed connection {}", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type on connection {}", connection_id);
            }
        }
    }

    // On disconnect, whatever this socket was bound to is cleared: an active
    // participant leaves (with fan-out), a waiting candidate is withdrawn.
    if let Some(bound) = binding.take() {
        registry.disconnect(&bound.room_id, &bound.participant_id).await;
    }

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished: {}", connection_id);
}

/// Routes one decoded envelope. `join` is the only message an unbound
/// connection may send; everything else requires a binding and is either
/// relayed, merged into participant state, or applied as moderator policy.
async fn dispatch(
    envelope: Envelope,
    binding: &mut Option<Binding>,
    tx: &OutboundSender,
    registry: &Arc<RoomRegistry>,
    metrics: &ServerMetrics,
) {
    if let MessageBody::Join {
        name,
        password,
        is_host,
        creator_token,
    } = &envelope.body
    {
        admission::handle_join(
            registry,
            tx,
            binding,
            &envelope.room_id,
            name,
            password.as_deref(),
            *is_host,
            creator_token.as_deref(),
        )
        .await;
        return;
    }

    let Some(bound) = binding.as_ref() else {
        metrics.inc_errors();
        send_error(tx, "Not joined to a room", None);
        return;
    };
    let room_id = bound.room_id.clone();
    let participant_id = bound.participant_id.clone();

    // Point-to-point messages are forwarded untouched apart from the sender
    // id; the registry never broadcasts them.
    if envelope.body.relay_target().is_some() {
        let result = registry.relay(&room_id, &participant_id, envelope).await;
        report(result, tx, metrics);
        return;
    }

    if let MessageBody::Chat { text, .. } = &envelope.body {
        if text.is_empty() || text.len() > MAX_CHAT_LEN {
            metrics.inc_errors();
            send_error(tx, "Invalid chat message", None);
            return;
        }
        let result = registry
            .broadcast_chat(&room_id, &participant_id, envelope)
            .await;
        report(result, tx, metrics);
        return;
    }

    let result = match envelope.body {
        MessageBody::Leave => {
            if let Some(bound) = binding.take() {
                registry
                    .disconnect(&bound.room_id, &bound.participant_id)
                    .await;
            }
            Ok(())
        }
        MessageBody::ParticipantUpdated {
            is_muted,
            is_video_off,
            is_hand_raised,
            ..
        } => {
            registry
                .update_participant(
                    &room_id,
                    &participant_id,
                    ParticipantPatch {
                        is_muted,
                        is_video_off,
                        is_hand_raised,
                    },
                )
                .await
        }
        MessageBody::RaiseHand => {
            registry
                .update_participant(
                    &room_id,
                    &participant_id,
                    ParticipantPatch {
                        is_hand_raised: Some(true),
                        ..Default::default()
                    },
                )
                .await
        }
        MessageBody::LowerHand => {
            registry
                .update_participant(
                    &room_id,
                    &participant_id,
                    ParticipantPatch {
                        is_hand_raised: Some(false),
                        ..Default::default()
                    },
                )
                .await
        }
        MessageBody::ModeratorAction { target_id, action } => {
            registry
                .moderate(&room_id, &participant_id, &target_id, action)
                .await
        }
        MessageBody::RoomLocked { .. } => {
            registry.set_locked(&room_id, &participant_id, true).await
        }
        MessageBody::RoomUnlocked { .. } => {
            registry.set_locked(&room_id, &participant_id, false).await
        }
        MessageBody::AdmitUser { target_id } => {
            registry
                .admit_from_waiting_room(&room_id, &participant_id, &target_id)
                .await
        }
        MessageBody::RejectUser { target_id, reason } => {
            registry
                .reject_from_waiting_room(&room_id, &participant_id, &target_id, reason)
                .await
        }
        other => {
            // Server-to-client kinds echoed back by a confused client.
            debug!("Ignoring client message the server does not accept: {other:?}");
            Ok(())
        }
    };

    report(result, tx, metrics);
}

/// Translates a registry failure into the error envelope clients expect.
fn report(result: Result<(), RegistryError>, tx: &OutboundSender, metrics: &ServerMetrics) {
    let Err(e) = result else {
        return;
    };
    metrics.inc_errors();
    let (message, code) = match &e {
        RegistryError::RoomNotFound(_) => {
            ("Room not found".to_string(), Some(ErrorCode::RoomNotFound))
        }
        RegistryError::RoomFull => ("Room is full".to_string(), None),
        RegistryError::NotInRoom => ("Not joined to a room".to_string(), None),
        RegistryError::NotModerator => (
            "Only moderators can perform this action".to_string(),
            None,
        ),
        other => (other.to_string(), None),
    };
    send_error(tx, message, code);
}
