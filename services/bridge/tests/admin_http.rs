//! Admin surface: /devices, /streams, /health, /metrics.

use bridge::AppState;
use fb_bus::{BusAdapter, BusSettings, MemoryBus};
use fb_protocol::{DeviceInfo, StreamSummary};
use fb_test_utils as tu;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
[gateway]
max_message_size = 4096
message_rate_limit_per_second = 100
outgoing_buffer_size = 64
authentication_timeout_seconds = 5
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

[[bus.streams]]
name = "commands"
subjects = ["commands.>"]

[bus.default_consumer]
default_batch_size = 16
fetch_timeout_ms = 100
"#;

async fn start_bridge() -> (String, String, AppState) {
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
    (format!("http://{addr}"), format!("ws://{addr}/ws"), state)
}

#[tokio::test]
async fn health_reports_ok_while_the_bus_is_ready() {
    let (http, _ws, _state) = start_bridge().await;
    let response = reqwest::get(format!("{http}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn devices_lists_live_sessions_with_identity_context() {
    let (http, ws_url, _state) = start_bridge().await;

    let empty: Vec<DeviceInfo> = reqwest::get(format!("{http}/devices"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(empty.is_empty());

    let token = tu::sensor_token("sensor-001");
    let mut ws = tu::connect(&ws_url, Some(&token)).await;
    tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();

    let devices: Vec<DeviceInfo> = reqwest::get(format!("{http}/devices"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].client_id, "sensor-001");
    assert_eq!(devices[0].role, "sensor");
    assert!(devices[0].expires_at > devices[0].connected_at);
}

#[tokio::test]
async fn streams_reports_names_subjects_and_shape() {
    let (http, _ws, state) = start_bridge().await;
    state
        .bus
        .publish(
            "telemetry.s1.temp",
            b"{\"value\":1}",
            HashMap::new(),
            None,
        )
        .await
        .unwrap();

    let streams: Vec<StreamSummary> = reqwest::get(format!("{http}/streams"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(streams.len(), 2);
    let telemetry = streams.iter().find(|s| s.name == "telemetry").unwrap();
    assert_eq!(telemetry.subjects, vec!["telemetry.>".to_owned()]);
    assert_eq!(telemetry.messages, 1);
    assert_eq!(telemetry.last_sequence, 1);
}

#[tokio::test]
async fn metrics_exposition_is_prometheus_text() {
    let (http, ws_url, _state) = start_bridge().await;
    let token = tu::sensor_token("sensor-001");
    let mut ws = tu::connect(&ws_url, Some(&token)).await;
    tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();

    let response = reqwest::get(format!("{http}/metrics")).await.unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(content_type.starts_with("text/plain"));
    let body = response.text().await.unwrap();
    assert!(body.contains("# TYPE bridge_connections_total counter"));
    assert!(body.contains("bridge_connections_total 1"));
    assert!(body.contains("bridge_connections_current 1"));
}
