//! Auth phase: handshake bearer, AUTH frame, failure paths and the deadline.

use bridge::AppState;
use fb_bus::{BusAdapter, BusSettings, MemoryBus};
use fb_protocol::{error_codes, Frame, FrameType};
use fb_test_utils as tu;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
[gateway]
max_message_size = 4096
message_rate_limit_per_second = 100
outgoing_buffer_size = 64
authentication_timeout_seconds = 1
ping_interval_seconds = 30
ping_timeout_seconds = 5
drain_window_seconds = 2

[auth]
secret = "fluxbridge-test-secret"

[bus]
url = "memory://test"

[[bus.streams]]
name = "telemetry"
subjects = ["telemetry.>"]

[bus.default_consumer]
default_batch_size = 16
fetch_timeout_ms = 100
"#;

async fn start_bridge() -> (String, AppState) {
    let config = fb_core::config::load_config_from_str(CONFIG).unwrap();
    let adapter = Arc::new(BusAdapter::new(
        Arc::new(MemoryBus::new()),
        BusSettings::from(&config.bus),
    ));
    adapter.initialize().await.unwrap();
    let state = AppState::new(&config, adapter).unwrap();
    let router = bridge::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("ws://{addr}/ws"), state)
}

fn assert_auth_ok(frame: &Frame, client_id: &str, role: &str) {
    assert_eq!(frame.frame_type, FrameType::Auth);
    let payload = frame.payload.as_ref().unwrap();
    assert_eq!(payload["success"], true);
    assert_eq!(payload["clientId"], client_id);
    assert_eq!(payload["role"], role);
}

#[tokio::test]
async fn handshake_bearer_pre_authenticates_the_session() {
    let (url, state) = start_bridge().await;
    let token = tu::sensor_token("sensor-001");
    let mut ws = tu::connect(&url, Some(&token)).await;

    let frame = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_auth_ok(&frame, "sensor-001", "sensor");
    assert!(state.registry.is_connected("sensor-001").await);
}

#[tokio::test]
async fn auth_frame_authenticates_without_a_header() {
    let (url, _state) = start_bridge().await;
    let mut ws = tu::connect(&url, None).await;
    tu::send_frame(&mut ws, &Frame::auth(tu::sensor_token("sensor-002"))).await;

    let frame = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_auth_ok(&frame, "sensor-002", "sensor");
}

#[tokio::test]
async fn bad_signature_gets_auth_failed_then_policy_close() {
    let (url, state) = start_bridge().await;
    let mut ws = tu::connect(&url, None).await;
    tu::send_frame(&mut ws, &Frame::auth("not-a-real-token")).await;

    let auth = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(auth.frame_type, FrameType::Auth);
    assert_eq!(auth.payload.as_ref().unwrap()["success"], false);

    let error = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(error.frame_type, FrameType::Error);
    assert_eq!(error.error_code(), Some(error_codes::TOKEN_INVALID));

    let code = tu::recv_close_code(&mut ws, Duration::from_secs(2)).await;
    assert_eq!(code, Some(1008));
    assert_eq!(state.registry.count().await, 0);
}

#[tokio::test]
async fn expired_token_is_rejected_with_token_expired() {
    let (url, _state) = start_bridge().await;
    let token = tu::mint_token("sensor-003", "sensor", &["telemetry.>"], &[], -60);
    let mut ws = tu::connect(&url, Some(&token)).await;

    let frame = tu::recv_frame_matching(&mut ws, Duration::from_secs(2), |f| {
        f.frame_type == FrameType::Error
    })
    .await
    .unwrap();
    assert_eq!(frame.error_code(), Some(error_codes::TOKEN_EXPIRED));
    let code = tu::recv_close_code(&mut ws, Duration::from_secs(2)).await;
    assert_eq!(code, Some(1008));
}

#[tokio::test]
async fn silence_past_the_deadline_closes_with_auth_timeout() {
    let (url, _state) = start_bridge().await;
    let mut ws = tu::connect(&url, None).await;

    // authentication_timeout_seconds = 1; say nothing.
    let frame = tu::recv_frame(&mut ws, Duration::from_secs(3)).await.unwrap();
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(frame.error_code(), Some(error_codes::AUTH_TIMEOUT));
    let code = tu::recv_close_code(&mut ws, Duration::from_secs(2)).await;
    assert_eq!(code, Some(1008));
}

#[tokio::test]
async fn non_auth_first_frame_is_rejected() {
    let (url, _state) = start_bridge().await;
    let mut ws = tu::connect(&url, None).await;
    tu::send_frame(
        &mut ws,
        &Frame::publish("telemetry.s1.temp", serde_json::json!({ "value": 1 })),
    )
    .await;

    let frame = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(frame.error_code(), Some(error_codes::TOKEN_REQUIRED));
    let code = tu::recv_close_code(&mut ws, Duration::from_secs(2)).await;
    assert_eq!(code, Some(1008));
}

#[tokio::test]
async fn newer_session_evicts_the_older_one() {
    let (url, state) = start_bridge().await;
    let token = tu::sensor_token("sensor-009");

    let mut first = tu::connect(&url, Some(&token)).await;
    let frame = tu::recv_frame(&mut first, Duration::from_secs(2)).await.unwrap();
    assert_auth_ok(&frame, "sensor-009", "sensor");

    let mut second = tu::connect(&url, Some(&token)).await;
    let frame = tu::recv_frame(&mut second, Duration::from_secs(2)).await.unwrap();
    assert_auth_ok(&frame, "sensor-009", "sensor");

    // The older transport closes normally; the newer session stays.
    let code = tu::recv_close_code(&mut first, Duration::from_secs(3)).await;
    assert_eq!(code, Some(1000));
    assert!(state.registry.is_connected("sensor-009").await);
    assert_eq!(state.registry.count().await, 1);
}
