//! Per-connection session core.
//!
//! Owns one duplex WebSocket end to end: the auth phase with its deadline,
//! the dispatch matrix, idle ping/pong, and teardown.  Each authenticated
//! session runs two cooperating loops — the receive loop in this task and a
//! spawned send loop draining the outbound buffer — joined only by the
//! buffer and the session's cancellation scope.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fb_bus::adapter::MessageHandler;
use fb_bus::Subscription;
use fb_core::auth::{extract_bearer, ClientContext};
use fb_protocol::{close_codes, error_codes, Frame, FrameType, ReplayMode, SubscribePayload};

use crate::metrics::GatewayMetrics;
use crate::outbound::OutboundBuffer;
use crate::registry::SessionHandle;
use crate::state::AppState;

/// A client subscription plus whether its consumer is a durable resume
/// cursor.  Durable cursors survive teardown so a reconnecting client can
/// resume from its last ack; everything else is deleted with the session.
struct SessionSubscription {
    subscription: Subscription,
    durable: bool,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(ToOwned::to_owned);
    ws.on_upgrade(move |socket| handle_session(socket, state, bearer))
}

async fn handle_session(mut socket: WebSocket, state: AppState, bearer: Option<String>) {
    state.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
    let Some(context) = authenticate(&mut socket, &state, bearer).await else {
        return;
    };
    run_authenticated(socket, state, Arc::new(context)).await;
}

// ---------------------------------------------------------------------------
// Auth phase
// ---------------------------------------------------------------------------

enum AuthWait {
    Token(String),
    Timeout,
    BadFrame(&'static str, &'static str),
    Gone,
}

/// AWAITING_AUTH: a handshake bearer short-circuits; otherwise only an AUTH
/// frame is accepted before the deadline.
async fn authenticate(
    socket: &mut WebSocket,
    state: &AppState,
    bearer: Option<String>,
) -> Option<ClientContext> {
    let token = match bearer {
        Some(token) => token,
        None => match wait_for_auth_frame(socket, state).await {
            AuthWait::Token(token) => token,
            AuthWait::Timeout => {
                state.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
                reject(socket, error_codes::AUTH_TIMEOUT, "authentication deadline elapsed").await;
                return None;
            }
            AuthWait::BadFrame(code, message) => {
                state.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
                reject(socket, code, message).await;
                return None;
            }
            AuthWait::Gone => return None,
        },
    };

    match state.verifier.verify(&token) {
        Ok(context) => Some(context),
        Err(failure) => {
            state.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
            let _ = send_on(socket, &Frame::auth_failed(&failure.to_string())).await;
            reject(socket, failure.wire_code(), &failure.to_string()).await;
            None
        }
    }
}

async fn wait_for_auth_frame(socket: &mut WebSocket, state: &AppState) -> AuthWait {
    let wait = tokio::time::timeout(state.gateway.authentication_timeout, async {
        loop {
            match socket.recv().await {
                None | Some(Err(_)) => return AuthWait::Gone,
                Some(Ok(Message::Text(text))) => {
                    return match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) if frame.frame_type == FrameType::Auth => {
                            match frame
                                .payload
                                .as_ref()
                                .and_then(|p| p.get("token"))
                                .and_then(|t| t.as_str())
                            {
                                Some(token) => AuthWait::Token(token.to_owned()),
                                None => AuthWait::BadFrame(
                                    error_codes::TOKEN_REQUIRED,
                                    "AUTH payload carries no token",
                                ),
                            }
                        }
                        Ok(_) => AuthWait::BadFrame(
                            error_codes::TOKEN_REQUIRED,
                            "expected AUTH as the first frame",
                        ),
                        Err(_) => AuthWait::BadFrame(
                            error_codes::MALFORMED_FRAME,
                            "first frame is not a valid frame",
                        ),
                    };
                }
                Some(Ok(Message::Close(_))) => return AuthWait::Gone,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    wait.unwrap_or(AuthWait::Timeout)
}

/// ERROR frame plus policy close, for pre-auth failures.
async fn reject(socket: &mut WebSocket, code: &str, message: &str) {
    let _ = send_on(socket, &Frame::error(code, message)).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_codes::POLICY,
            reason: message.to_owned().into(),
        })))
        .await;
}

async fn send_on(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(json.into())).await
}

// ---------------------------------------------------------------------------
// Authenticated phase
// ---------------------------------------------------------------------------

async fn run_authenticated(socket: WebSocket, state: AppState, context: Arc<ClientContext>) {
    let client_id = context.client_id.clone();
    let session_id = Uuid::new_v4();
    let cancel = state.shutdown.child_token();
    let handle = SessionHandle::new(session_id, cancel.clone());

    // Most-recent wins: a previous session for this client is cancelled and
    // closes normally.
    if let Some(evicted) = state
        .registry
        .register(Arc::clone(&context), handle.clone())
        .await
    {
        state.metrics.sessions_evicted.fetch_add(1, Ordering::Relaxed);
        info!(client_id = %client_id, "evicting older session for reconnecting client");
        evicted.cancel.cancel();
    }
    let buffer = state
        .buffers
        .create(&client_id, state.gateway.outgoing_buffer_size)
        .await;
    state.metrics.connections_current.fetch_add(1, Ordering::Relaxed);
    info!(client_id = %client_id, role = %context.role, "session authenticated");

    let (mut sink, mut stream) = socket.split();
    if send_to(&mut sink, &Frame::auth_ok(&client_id, &context.role))
        .await
        .is_err()
    {
        finish(&state, &client_id, session_id, &handle, &buffer).await;
        return;
    }

    let send_task = spawn_send_loop(
        sink,
        Arc::clone(&buffer),
        cancel.clone(),
        Arc::clone(&state.metrics),
        state.gateway.drain_window,
    );

    let mut subscriptions: HashMap<String, SessionSubscription> = HashMap::new();
    let close_code = receive_loop(
        &mut stream,
        &state,
        &context,
        &buffer,
        &cancel,
        &mut subscriptions,
    )
    .await;

    // DRAINING: stop both loops, release every subscription, flush the
    // buffer within the drain window, close the transport.
    handle.mark_closed();
    cancel.cancel();
    for (_, entry) in subscriptions.drain() {
        // Durable resume cursors outlive the session; everything else is
        // deleted with it.
        let _ = state
            .bus
            .unsubscribe(entry.subscription.id, !entry.durable)
            .await;
        state
            .metrics
            .subscriptions_active
            .fetch_sub(1, Ordering::Relaxed);
    }
    buffer.close();

    let drained = tokio::time::timeout(
        state.gateway.drain_window + std::time::Duration::from_secs(1),
        send_task,
    )
    .await;
    if let Ok(Ok(mut sink)) = drained {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code,
                reason: "".into(),
            })))
            .await;
    }

    finish(&state, &client_id, session_id, &handle, &buffer).await;
    info!(client_id = %client_id, code = close_code, "session ended");
}

async fn finish(
    state: &AppState,
    client_id: &str,
    session_id: Uuid,
    handle: &SessionHandle,
    buffer: &Arc<OutboundBuffer>,
) {
    handle.mark_closed();
    state.registry.remove_if(client_id, session_id).await;
    state.buffers.remove_if_same(client_id, buffer).await;
    state.limiter.reset(client_id);
    state
        .metrics
        .connections_current
        .fetch_sub(1, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

/// ACTIVE ⇄ IDLE until drain; returns the close code for the transport.
async fn receive_loop(
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
    context: &Arc<ClientContext>,
    buffer: &Arc<OutboundBuffer>,
    cancel: &CancellationToken,
    subscriptions: &mut HashMap<String, SessionSubscription>,
) -> u16 {
    let mut awaiting_pong = false;
    loop {
        let wait = if awaiting_pong {
            state.gateway.ping_timeout
        } else {
            state.gateway.ping_interval
        };
        tokio::select! {
            () = cancel.cancelled() => return close_codes::NORMAL,
            msg = tokio::time::timeout(wait, stream.next()) => match msg {
                Err(_elapsed) => {
                    if awaiting_pong {
                        info!(client_id = %context.client_id, "no pong within the ping timeout, draining");
                        return close_codes::NORMAL;
                    }
                    // IDLE: probe the client.
                    buffer.enqueue(Frame::ping());
                    state.metrics.pings_sent.fetch_add(1, Ordering::Relaxed);
                    awaiting_pong = true;
                }
                Ok(None) | Ok(Some(Err(_))) => return close_codes::NORMAL,
                Ok(Some(Ok(Message::Close(_)))) => {
                    debug!(client_id = %context.client_id, "client closed");
                    return close_codes::NORMAL;
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    awaiting_pong = false;
                    state.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
                    match serde_json::from_str::<Frame>(&text) {
                        Err(e) => {
                            buffer.enqueue(Frame::error(
                                error_codes::MALFORMED_FRAME,
                                &format!("invalid frame: {e}"),
                            ));
                        }
                        Ok(frame) => {
                            // Expiry is re-checked on every inbound frame.
                            if context.expired() {
                                buffer.enqueue(Frame::error(
                                    error_codes::TOKEN_EXPIRED,
                                    "bearer token expired mid-session",
                                ));
                                return close_codes::POLICY;
                            }
                            if let Some(code) =
                                dispatch(frame, state, context, buffer, subscriptions).await
                            {
                                return code;
                            }
                        }
                    }
                }
                Ok(Some(Ok(_))) => {
                    // Transport ping/pong and binary frames carry no
                    // application meaning; liveness is frame-level.
                    awaiting_pong = false;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch matrix
// ---------------------------------------------------------------------------

/// Handle one inbound frame; Some(code) drains the session.
async fn dispatch(
    frame: Frame,
    state: &AppState,
    context: &Arc<ClientContext>,
    buffer: &Arc<OutboundBuffer>,
    subscriptions: &mut HashMap<String, SessionSubscription>,
) -> Option<u16> {
    if let Err(violation) = state.validator.validate(&frame) {
        state
            .metrics
            .validation_failures
            .fetch_add(1, Ordering::Relaxed);
        buffer.enqueue(Frame::error(violation.code(), &violation.to_string()));
        return None;
    }

    match frame.frame_type {
        // PING is answered synchronously and never rate-limited.
        FrameType::Ping => {
            buffer.enqueue(Frame::pong());
            None
        }
        FrameType::Pong => None,
        FrameType::Publish | FrameType::Request | FrameType::Reply => {
            if !state.limiter.try_acquire(&context.client_id) {
                state.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
                buffer.enqueue(Frame::error(
                    error_codes::RATE_LIMITED,
                    "message rate limit exceeded",
                ));
                return None;
            }
            handle_publish(frame, state, context, buffer).await;
            None
        }
        FrameType::Subscribe => {
            if !state.limiter.try_acquire(&context.client_id) {
                state.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
                buffer.enqueue(Frame::error(
                    error_codes::RATE_LIMITED,
                    "message rate limit exceeded",
                ));
                return None;
            }
            handle_subscribe(frame, state, context, buffer, subscriptions).await;
            None
        }
        FrameType::Unsubscribe => {
            handle_unsubscribe(frame, state, buffer, subscriptions).await;
            None
        }
        FrameType::Auth | FrameType::Delivered | FrameType::Ack | FrameType::Error => {
            buffer.enqueue(Frame::error(
                error_codes::INVALID_MESSAGE_TYPE,
                "frame type not accepted after authentication",
            ));
            None
        }
    }
}

async fn handle_publish(
    frame: Frame,
    state: &AppState,
    context: &Arc<ClientContext>,
    buffer: &Arc<OutboundBuffer>,
) {
    let Some(subject) = frame.subject.clone() else {
        buffer.enqueue(Frame::error(
            error_codes::MALFORMED_FRAME,
            "publish requires a subject",
        ));
        return;
    };
    if !context.can_publish(&subject) {
        state.metrics.not_authorized.fetch_add(1, Ordering::Relaxed);
        buffer.enqueue(Frame::error(
            error_codes::NOT_AUTHORIZED,
            &format!("subject '{subject}' is not in the publish allow-list"),
        ));
        return;
    }

    // Server-stamped identity and time; the client's own values are never
    // forwarded.
    let mut headers = std::collections::HashMap::new();
    headers.insert("device-id".to_owned(), context.client_id.clone());
    headers.insert("published-at".to_owned(), chrono::Utc::now().to_rfc3339());
    if frame.frame_type == FrameType::Request {
        let reply_to = frame
            .payload
            .as_ref()
            .and_then(|p| p.get("replyTo"))
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned)
            .or_else(|| {
                frame
                    .correlation_id
                    .as_ref()
                    .map(|corr| format!("reply.{}.{corr}", context.client_id))
            });
        if let Some(reply_to) = reply_to {
            headers.insert("reply-to".to_owned(), reply_to);
        }
    }

    let payload_bytes =
        serde_json::to_vec(&frame.payload.unwrap_or(serde_json::Value::Null)).unwrap_or_default();

    match state
        .bus
        .publish(
            &subject,
            &payload_bytes,
            headers,
            frame.correlation_id.as_deref(),
        )
        .await
    {
        Ok(receipt) => {
            state.metrics.publishes.fetch_add(1, Ordering::Relaxed);
            buffer.enqueue(Frame::ack(
                frame.correlation_id,
                Some(serde_json::json!({
                    "stream": receipt.stream,
                    "sequence": receipt.sequence,
                    "duplicate": receipt.duplicate,
                })),
            ));
        }
        Err(e) => {
            state.metrics.publish_errors.fetch_add(1, Ordering::Relaxed);
            warn!(client_id = %context.client_id, subject = %subject, error = %e, "publish failed");
            buffer.enqueue(Frame::error(e.wire_code(), &e.to_string()));
        }
    }
}

async fn handle_subscribe(
    frame: Frame,
    state: &AppState,
    context: &Arc<ClientContext>,
    buffer: &Arc<OutboundBuffer>,
    subscriptions: &mut HashMap<String, SessionSubscription>,
) {
    let Some(pattern) = frame.subject.clone() else {
        buffer.enqueue(Frame::error(
            error_codes::MALFORMED_FRAME,
            "subscribe requires a subject",
        ));
        return;
    };
    if !context.can_subscribe(&pattern) {
        state.metrics.not_authorized.fetch_add(1, Ordering::Relaxed);
        buffer.enqueue(Frame::error(
            error_codes::NOT_AUTHORIZED,
            &format!("subject '{pattern}' is not in the subscribe allow-list"),
        ));
        return;
    }
    if subscriptions.contains_key(&pattern) {
        // Re-subscribing to the same pattern is a no-op.
        buffer.enqueue(Frame::ack(frame.correlation_id, None));
        return;
    }

    let stream = match state.bus.resolve_stream(&pattern) {
        Ok(stream) => stream,
        Err(e) => {
            buffer.enqueue(Frame::error(error_codes::NO_STREAM_FOR_SUBJECT, &e.to_string()));
            return;
        }
    };

    let replay = frame
        .payload
        .as_ref()
        .and_then(|p| serde_json::from_value::<SubscribePayload>(p.clone()).ok())
        .and_then(|p| p.replay)
        .unwrap_or(ReplayMode::New);
    let durable = replay == ReplayMode::ResumeFromLastAck;

    // Stable per-client prefix so resume_from_last_ack finds its durable
    // cursor across reconnects.
    let prefix = format!("sub-{}", context.client_id);
    let handler = delivery_handler(Arc::clone(buffer), Arc::clone(&state.metrics));

    match state
        .bus
        .subscribe_with_replay(&stream, &pattern, &prefix, replay, handler)
        .await
    {
        Ok(subscription) => {
            state
                .metrics
                .subscriptions_active
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                client_id = %context.client_id,
                subject = %pattern,
                consumer = %subscription.consumer,
                "subscription created"
            );
            subscriptions.insert(
                pattern.clone(),
                SessionSubscription {
                    subscription,
                    durable,
                },
            );
            buffer.enqueue(Frame::ack(
                frame.correlation_id,
                Some(serde_json::json!({ "subject": pattern })),
            ));
        }
        Err(e) => {
            warn!(client_id = %context.client_id, subject = %pattern, error = %e, "subscribe failed");
            buffer.enqueue(Frame::error(error_codes::BUS_UNAVAILABLE, &e.to_string()));
        }
    }
}

async fn handle_unsubscribe(
    frame: Frame,
    state: &AppState,
    buffer: &Arc<OutboundBuffer>,
    subscriptions: &mut HashMap<String, SessionSubscription>,
) {
    let Some(pattern) = frame.subject.clone() else {
        buffer.enqueue(Frame::error(
            error_codes::MALFORMED_FRAME,
            "unsubscribe requires a subject",
        ));
        return;
    };
    if let Some(entry) = subscriptions.remove(&pattern) {
        let _ = state.bus.unsubscribe(entry.subscription.id, true).await;
        state
            .metrics
            .subscriptions_active
            .fetch_sub(1, Ordering::Relaxed);
    }
    // Unsubscribing twice succeeds with no effect.
    buffer.enqueue(Frame::ack(frame.correlation_id, None));
}

/// Bus delivery → DELIVERED frame → outbound buffer, then ack.
///
/// Always returns Ok: under drop-oldest the enqueue cannot fail, and the
/// adapter acknowledges as soon as the frame is buffered.  Socket delivery
/// past this point is best-effort; drops are visible in the metrics.
fn delivery_handler(buffer: Arc<OutboundBuffer>, metrics: Arc<GatewayMetrics>) -> MessageHandler {
    Arc::new(move |msg| {
        let buffer = Arc::clone(&buffer);
        let metrics = Arc::clone(&metrics);
        Box::pin(async move {
            let payload = serde_json::from_slice(&msg.payload).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&msg.payload).into_owned())
            });
            let mut frame = Frame::delivered(msg.subject.clone(), payload);
            frame.timestamp = Some(msg.timestamp);
            frame.device_id = msg.headers.get("device-id").cloned();

            let outcome = buffer.enqueue(frame);
            metrics.deliveries_enqueued.fetch_add(1, Ordering::Relaxed);
            if outcome.dropped_oldest {
                metrics.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        })
    })
}

// ---------------------------------------------------------------------------
// Send loop
// ---------------------------------------------------------------------------

type WsSink = SplitSink<WebSocket, Message>;

/// Drain the outbound buffer to the socket until the buffer closes or the
/// session is cancelled; flush what is already queued within the drain
/// window, then hand the sink back for the close frame.
fn spawn_send_loop(
    mut sink: WsSink,
    buffer: Arc<OutboundBuffer>,
    cancel: CancellationToken,
    metrics: Arc<GatewayMetrics>,
    drain_window: std::time::Duration,
) -> JoinHandle<WsSink> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let deadline = tokio::time::Instant::now() + drain_window;
                    while let Some(frame) = buffer.try_recv() {
                        if tokio::time::Instant::now() >= deadline {
                            break;
                        }
                        if send_to(&mut sink, &frame).await.is_err() {
                            break;
                        }
                        metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    break;
                }
                frame = buffer.recv() => match frame {
                    Some(frame) => {
                        if send_to(&mut sink, &frame).await.is_err() {
                            cancel.cancel();
                            break;
                        }
                        metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }
        sink
    })
}

async fn send_to(sink: &mut WsSink, frame: &Frame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_default();
    sink.send(Message::Text(json.into())).await
}
