//! Subscribe path: delivery ordering, authz, unsubscribe, replay resume.

use bridge::AppState;
use fb_bus::{BusAdapter, BusSettings, MemoryBus};
use fb_protocol::{error_codes, Frame, FrameType, ReplayMode};
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

async fn connected_sensor(url: &str, client_id: &str) -> tu::WsClient {
    let token = tu::sensor_token(client_id);
    let mut ws = tu::connect(url, Some(&token)).await;
    let frame = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame.frame_type, FrameType::Auth);
    ws
}

/// External producer publishing straight to the bus.
async fn produce(state: &AppState, subject: &str, body: serde_json::Value) {
    state
        .bus
        .publish(
            subject,
            &serde_json::to_vec(&body).unwrap(),
            HashMap::new(),
            None,
        )
        .await
        .unwrap();
}

fn subscribe_frame(subject: &str, replay: Option<ReplayMode>) -> Frame {
    let mut frame = Frame::subscribe(subject);
    if let Some(replay) = replay {
        frame.payload = Some(serde_json::json!({
            "replay": serde_json::to_value(&replay).unwrap()
        }));
    }
    frame
}

#[tokio::test]
async fn fanout_delivers_in_stream_sequence_order() {
    let (url, state) = start_bridge().await;
    let mut ws = connected_sensor(&url, "sensor-001").await;

    tu::send_frame(&mut ws, &subscribe_frame("commands.sensor-001.>", None)).await;
    let ack = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(ack.frame_type, FrameType::Ack);

    produce(&state, "commands.sensor-001.restart", serde_json::json!({ "n": 1 })).await;
    produce(&state, "commands.sensor-001.calibrate", serde_json::json!({ "n": 2 })).await;
    produce(
        &state,
        "commands.sensor-001.config.update",
        serde_json::json!({ "n": 3 }),
    )
    .await;

    let mut subjects = Vec::new();
    for _ in 0..3 {
        let frame = tu::recv_frame_matching(&mut ws, Duration::from_secs(3), |f| {
            f.frame_type == FrameType::Delivered
        })
        .await
        .unwrap();
        subjects.push(frame.subject.unwrap());
    }
    assert_eq!(
        subjects,
        vec![
            "commands.sensor-001.restart",
            "commands.sensor-001.calibrate",
            "commands.sensor-001.config.update",
        ]
    );
}

#[tokio::test]
async fn subscribe_outside_the_allow_list_is_denied() {
    let (url, _state) = start_bridge().await;
    let mut ws = connected_sensor(&url, "sensor-001").await;

    tu::send_frame(&mut ws, &subscribe_frame("commands.sensor-002.>", None)).await;
    let error = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(error.frame_type, FrameType::Error);
    assert_eq!(error.error_code(), Some(error_codes::NOT_AUTHORIZED));
}

#[tokio::test]
async fn subscribe_with_no_capturing_stream_is_reported() {
    let (url, _state) = start_bridge().await;
    let token = tu::mint_token("roamer", "dashboard", &[], &["warehouse.>"], 3600);
    let mut ws = tu::connect(&url, Some(&token)).await;
    tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();

    tu::send_frame(&mut ws, &subscribe_frame("warehouse.>", None)).await;
    let error = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(error.error_code(), Some(error_codes::NO_STREAM_FOR_SUBJECT));
}

#[tokio::test]
async fn unsubscribe_stops_deliveries_and_is_idempotent() {
    let (url, state) = start_bridge().await;
    let mut ws = connected_sensor(&url, "sensor-001").await;

    tu::send_frame(&mut ws, &subscribe_frame("commands.sensor-001.>", None)).await;
    tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();

    produce(&state, "commands.sensor-001.step", serde_json::json!({ "n": 1 })).await;
    tu::recv_frame_matching(&mut ws, Duration::from_secs(3), |f| {
        f.frame_type == FrameType::Delivered
    })
    .await
    .unwrap();

    tu::send_frame(&mut ws, &Frame::unsubscribe("commands.sensor-001.>")).await;
    let ack = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(ack.frame_type, FrameType::Ack);

    produce(&state, "commands.sensor-001.step", serde_json::json!({ "n": 2 })).await;
    let nothing = tu::recv_frame_matching(&mut ws, Duration::from_millis(500), |f| {
        f.frame_type == FrameType::Delivered
    })
    .await;
    assert!(nothing.is_none(), "no deliveries after unsubscribe");

    // Second unsubscribe succeeds with no effect.
    tu::send_frame(&mut ws, &Frame::unsubscribe("commands.sensor-001.>")).await;
    let ack = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(ack.frame_type, FrameType::Ack);
}

#[tokio::test]
async fn resume_from_last_ack_replays_only_the_missing_tail() {
    let (url, state) = start_bridge().await;

    {
        let mut ws = connected_sensor(&url, "sensor-001").await;
        tu::send_frame(
            &mut ws,
            &subscribe_frame("commands.sensor-001.>", Some(ReplayMode::ResumeFromLastAck)),
        )
        .await;
        tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();

        for i in 1..=3 {
            produce(
                &state,
                "commands.sensor-001.step",
                serde_json::json!({ "n": i }),
            )
            .await;
        }
        for _ in 0..3 {
            tu::recv_frame_matching(&mut ws, Duration::from_secs(3), |f| {
                f.frame_type == FrameType::Delivered
            })
            .await
            .unwrap();
        }
        // Transport drops without unsubscribing.
    }

    // Give the old session's teardown a moment to settle.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for i in 4..=5 {
        produce(
            &state,
            "commands.sensor-001.step",
            serde_json::json!({ "n": i }),
        )
        .await;
    }

    let mut ws = connected_sensor(&url, "sensor-001").await;
    tu::send_frame(
        &mut ws,
        &subscribe_frame("commands.sensor-001.>", Some(ReplayMode::ResumeFromLastAck)),
    )
    .await;
    tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();

    let mut ns = Vec::new();
    for _ in 0..2 {
        let frame = tu::recv_frame_matching(&mut ws, Duration::from_secs(3), |f| {
            f.frame_type == FrameType::Delivered
        })
        .await
        .unwrap();
        ns.push(frame.payload.unwrap()["n"].as_i64().unwrap());
    }
    assert_eq!(ns, vec![4, 5]);

    let nothing = tu::recv_frame_matching(&mut ws, Duration::from_millis(300), |f| {
        f.frame_type == FrameType::Delivered
    })
    .await;
    assert!(nothing.is_none(), "already-acked messages are not replayed");
}

#[tokio::test]
async fn replay_all_serves_history_to_a_new_subscription() {
    let (url, state) = start_bridge().await;
    produce(&state, "commands.sensor-001.old", serde_json::json!({ "n": 0 })).await;

    let mut ws = connected_sensor(&url, "sensor-001").await;
    tu::send_frame(
        &mut ws,
        &subscribe_frame("commands.sensor-001.>", Some(ReplayMode::All)),
    )
    .await;
    tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();

    let frame = tu::recv_frame_matching(&mut ws, Duration::from_secs(3), |f| {
        f.frame_type == FrameType::Delivered
    })
    .await
    .unwrap();
    assert_eq!(frame.subject.as_deref(), Some("commands.sensor-001.old"));
}

#[tokio::test]
async fn client_ping_gets_a_synchronous_pong() {
    let (url, _state) = start_bridge().await;
    let mut ws = connected_sensor(&url, "sensor-001").await;
    tu::send_frame(&mut ws, &Frame::ping()).await;
    let pong = tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(pong.frame_type, FrameType::Pong);
}

#[tokio::test]
async fn delivered_frames_carry_the_producer_identity_when_stamped() {
    let (url, state) = start_bridge().await;
    let mut ws = connected_sensor(&url, "sensor-001").await;

    tu::send_frame(&mut ws, &subscribe_frame("commands.sensor-001.>", None)).await;
    tu::recv_frame(&mut ws, Duration::from_secs(2)).await.unwrap();

    let mut headers = HashMap::new();
    headers.insert("device-id".to_owned(), "control-room".to_owned());
    state
        .bus
        .publish(
            "commands.sensor-001.restart",
            &serde_json::to_vec(&serde_json::json!({ "go": true })).unwrap(),
            headers,
            None,
        )
        .await
        .unwrap();

    let frame = tu::recv_frame_matching(&mut ws, Duration::from_secs(3), |f| {
        f.frame_type == FrameType::Delivered
    })
    .await
    .unwrap();
    assert_eq!(frame.device_id.as_deref(), Some("control-room"));
    assert!(frame.timestamp.is_some());
}
