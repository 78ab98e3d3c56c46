//! Idle handling: the server pings quiet sessions and drains on a missed
//! pong.

use bridge::AppState;
use fb_bus::{BusAdapter, BusSettings, MemoryBus};
use fb_protocol::{Frame, FrameType};
use fb_test_utils as tu;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
[gateway]
max_message_size = 4096
message_rate_limit_per_second = 100
outgoing_buffer_size = 64
authentication_timeout_seconds = 5
ping_interval_seconds = 1
ping_timeout_seconds = 1
drain_window_seconds = 1

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

#[tokio::test]
async fn idle_session_receives_a_server_ping() {
    let (url, _state) = start_bridge().await;
    let token = tu::sensor_token("sensor-001");
    let mut ws = tu::connect(&url, Some(&token)).await;
    tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();

    // Stay quiet past the idle threshold.
    let ping = tu::recv_frame_matching(&mut ws, Duration::from_secs(3), |f| {
        f.frame_type == FrameType::Ping
    })
    .await
    .expect("server pings an idle session");
    assert_eq!(ping.frame_type, FrameType::Ping);
}

#[tokio::test]
async fn answering_the_ping_keeps_the_session_alive() {
    let (url, state) = start_bridge().await;
    let token = tu::sensor_token("sensor-002");
    let mut ws = tu::connect(&url, Some(&token)).await;
    tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();

    for _ in 0..2 {
        tu::recv_frame_matching(&mut ws, Duration::from_secs(3), |f| {
            f.frame_type == FrameType::Ping
        })
        .await
        .expect("server ping");
        tu::send_frame(&mut ws, &Frame::pong()).await;
    }
    assert!(state.registry.is_connected("sensor-002").await);
}

#[tokio::test]
async fn missed_pong_drains_the_session() {
    let (url, state) = start_bridge().await;
    let token = tu::sensor_token("sensor-003");
    let mut ws = tu::connect(&url, Some(&token)).await;
    tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();

    // Ignore the ping; the session closes normally after ping_timeout.
    let code = tu::recv_close_code(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(code, Some(1000));

    // Registry entry is gone once teardown completes.
    for _ in 0..50 {
        if state.registry.count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state.registry.count().await, 0);
}
