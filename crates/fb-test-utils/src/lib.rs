// fb-test-utils: shared helpers for service integration tests.
//
// Token minting for the HS256 test secret and a frame-level WebSocket
// client speaking the bridge wire protocol.

use fb_protocol::Frame;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// The HS256 secret every test config uses.
pub const TEST_SECRET: &[u8] = b"fluxbridge-test-secret";

#[derive(Debug, Serialize)]
struct TestClaims<'a> {
    sub: &'a str,
    role: &'a str,
    #[serde(rename = "pub")]
    allow_publish: &'a [&'a str],
    subscribe: &'a [&'a str],
    exp: i64,
}

/// Mint a signed token for `client_id` with the given allow-lists,
/// expiring `ttl_secs` from now (negative for an already-expired token).
pub fn mint_token(
    client_id: &str,
    role: &str,
    allow_publish: &[&str],
    allow_subscribe: &[&str],
    ttl_secs: i64,
) -> String {
    let claims = TestClaims {
        sub: client_id,
        role,
        allow_publish,
        subscribe: allow_subscribe,
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET),
    )
    .expect("test token encodes")
}

/// Token for the canonical test sensor.
pub fn sensor_token(client_id: &str) -> String {
    let subscribe = format!("commands.{client_id}.>");
    mint_token(
        client_id,
        "sensor",
        &["telemetry.>"],
        &[subscribe.as_str()],
        3600,
    )
}

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect to `url`, optionally carrying a bearer token on the upgrade
/// request.
pub async fn connect(url: &str, bearer: Option<&str>) -> WsClient {
    let mut request = url.into_client_request().expect("valid ws url");
    if let Some(token) = bearer {
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {token}").parse().expect("valid header"),
        );
    }
    let (ws, _response) = connect_async(request).await.expect("ws connect");
    ws
}

/// Send one frame as JSON text.
pub async fn send_frame(ws: &mut WsClient, frame: &Frame) {
    let json = serde_json::to_string(frame).expect("frame serializes");
    ws.send(Message::Text(json.into())).await.expect("ws send");
}

/// Receive the next frame, skipping transport ping/pong, within `timeout`.
/// Returns None on close or timeout.
pub async fn recv_frame(ws: &mut WsClient, timeout: Duration) -> Option<Frame> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        let msg = tokio::time::timeout(remaining, ws.next()).await.ok()??;
        match msg.ok()? {
            Message::Text(text) => {
                return serde_json::from_str(&text).ok();
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Receive frames until one matches `pred` or the timeout elapses.
pub async fn recv_frame_matching(
    ws: &mut WsClient,
    timeout: Duration,
    pred: impl Fn(&Frame) -> bool,
) -> Option<Frame> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        let frame = recv_frame(ws, remaining).await?;
        if pred(&frame) {
            return Some(frame);
        }
    }
}

/// Wait for the close frame and return its code, if any.
pub async fn recv_close_code(ws: &mut WsClient, timeout: Duration) -> Option<u16> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        let msg = tokio::time::timeout(remaining, ws.next()).await.ok()??;
        match msg {
            Ok(Message::Close(Some(frame))) => return Some(frame.code.into()),
            Ok(Message::Close(None)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}
