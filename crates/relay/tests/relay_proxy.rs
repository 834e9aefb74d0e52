//! Relay sessions between a real caller socket and an in-process fake gateway.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    serde_json::{Value, json},
    tokio::{
        net::{TcpListener, TcpStream},
        time::timeout,
    },
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, accept_async, connect_async,
        tungstenite::{
            Message,
            protocol::{CloseFrame, frame::coding::CloseCode},
        },
    },
};

use studio_relay::{RelayLimits, RelayState, StaticSettings, UpstreamSettings, build_relay_app};

type UpstreamWs = WebSocketStream<TcpStream>;
type CallerWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn fake_gateway() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/gateway", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> UpstreamWs {
    let (tcp, _) = timeout(WAIT, listener.accept())
        .await
        .expect("relay never dialed upstream")
        .unwrap();
    accept_async(tcp).await.unwrap()
}

/// Accepts TCP but never completes the WebSocket upgrade.
fn stalled_gateway(listener: TcpListener) {
    tokio::spawn(async move {
        let (_tcp, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
}

fn short_limits() -> RelayLimits {
    RelayLimits {
        connect_timeout: Duration::from_millis(300),
        failure_hold: Duration::from_millis(300),
        max_backlog: 2,
    }
}

async fn start_relay(settings: UpstreamSettings) -> (SocketAddr, Arc<RelayState>) {
    start_relay_with(settings, RelayLimits::default()).await
}

async fn start_relay_with(
    settings: UpstreamSettings,
    limits: RelayLimits,
) -> (SocketAddr, Arc<RelayState>) {
    let state = RelayState::with_limits(Arc::new(StaticSettings(settings)), limits);
    let app = build_relay_app(Arc::clone(&state), "/ws");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state)
}

async fn attach(addr: SocketAddr) -> CallerWs {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

enum Received {
    Json(Value),
    Closed(u16, String),
}

async fn next<S>(ws: &mut WebSocketStream<S>) -> Received
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame");
        match message {
            Some(Ok(Message::Text(text))) => {
                return Received::Json(serde_json::from_str(text.as_str()).unwrap());
            },
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                    .unwrap_or((1005, String::new()));
                return Received::Closed(code, reason);
            },
            Some(Ok(_)) => {},
            Some(Err(_)) | None => return Received::Closed(1006, String::new()),
        }
    }
}

async fn next_json<S>(ws: &mut WebSocketStream<S>) -> Value
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match next(ws).await {
        Received::Json(value) => value,
        Received::Closed(code, reason) => panic!("closed early: {code} {reason}"),
    }
}

async fn next_close<S>(ws: &mut WebSocketStream<S>) -> (u16, String)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        if let Received::Closed(code, reason) = next(ws).await {
            return (code, reason);
        }
    }
}

async fn send_text<S>(ws: &mut WebSocketStream<S>, text: &str)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    ws.send(Message::Text(text.into())).await.unwrap();
}

fn connect_request(id: &str, auth: Value) -> Value {
    json!({
        "type": "req",
        "id": id,
        "method": "connect",
        "params": {
            "minProtocol": 3,
            "maxProtocol": 3,
            "client": {"id": "studio", "version": "1", "platform": "web", "mode": "webchat"},
            "role": "operator",
            "scopes": ["operator.admin"],
            "device": {"id": "dev-1", "publicKey": "pk", "signature": "sig", "signedAt": 42},
            "auth": auth,
        }
    })
}

// ── Forwarding ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn caller_token_frame_is_forwarded_unchanged() {
    let (gateway, url) = fake_gateway().await;
    let (addr, _) = start_relay(UpstreamSettings::new(url, Some("relay-token"))).await;
    let mut caller = attach(addr).await;
    let mut upstream = accept(&gateway).await;

    let connect = connect_request("c-1", json!({"token": "caller-token"}));
    // Extra whitespace is normalized away; the content is untouched.
    let spaced = serde_json::to_string_pretty(&connect).unwrap();
    send_text(&mut caller, &spaced).await;

    match timeout(WAIT, upstream.next()).await.unwrap() {
        Some(Ok(Message::Text(text))) => {
            assert!(!text.as_str().contains('\n'));
            assert_eq!(serde_json::from_str::<Value>(text.as_str()).unwrap(), connect);
        },
        other => panic!("unexpected upstream frame: {other:?}"),
    }

    send_text(
        &mut upstream,
        &json!({"type": "res", "id": "c-1", "ok": true, "payload": {"protocol": 3}}).to_string(),
    )
    .await;
    let res = next_json(&mut caller).await;
    assert_eq!(res["ok"], true);

    send_text(
        &mut upstream,
        &json!({"type": "event", "event": "tick", "seq": 1}).to_string(),
    )
    .await;
    assert_eq!(next_json(&mut caller).await["event"], "tick");
}

#[tokio::test]
async fn relay_token_is_injected_when_caller_has_none() {
    let (gateway, url) = fake_gateway().await;
    let (addr, _) = start_relay(UpstreamSettings::new(url, Some("relay-token"))).await;
    let mut caller = attach(addr).await;
    let mut upstream = accept(&gateway).await;

    send_text(
        &mut caller,
        &connect_request("c-1", json!({"token": ""})).to_string(),
    )
    .await;
    let forwarded = next_json(&mut upstream).await;
    assert_eq!(forwarded["params"]["auth"]["token"], "relay-token");
    assert_eq!(forwarded["params"]["device"]["signature"], "sig");
    assert_eq!(forwarded["params"]["scopes"], json!(["operator.admin"]));
}

#[tokio::test]
async fn frames_sent_before_upstream_opens_arrive_in_order() {
    let (gateway, url) = fake_gateway().await;
    let (addr, _) = start_relay(UpstreamSettings::new(url, Some("relay-token"))).await;
    let mut caller = attach(addr).await;

    send_text(
        &mut caller,
        &connect_request("c-1", json!({"token": "t"})).to_string(),
    )
    .await;
    send_text(
        &mut caller,
        &json!({"type": "req", "id": "r-2", "method": "status"}).to_string(),
    )
    .await;

    let mut upstream = accept(&gateway).await;
    assert_eq!(next_json(&mut upstream).await["id"], "c-1");
    assert_eq!(next_json(&mut upstream).await["id"], "r-2");
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_token_gets_an_error_response_then_close() {
    let (gateway, url) = fake_gateway().await;
    let (addr, _) = start_relay(UpstreamSettings::new(url, None)).await;
    let mut caller = attach(addr).await;
    tokio::spawn(async move {
        let mut upstream = accept(&gateway).await;
        while let Some(Ok(_)) = upstream.next().await {}
    });

    send_text(&mut caller, &connect_request("c-1", json!({})).to_string()).await;
    let res = next_json(&mut caller).await;
    assert_eq!(res["id"], "c-1");
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "studio.gateway_token_missing");
    assert_eq!(next_close(&mut caller).await.0, 1011);
}

#[tokio::test]
async fn missing_url_is_reported_on_the_handshake() {
    let (addr, _) = start_relay(UpstreamSettings::default()).await;
    let mut caller = attach(addr).await;

    send_text(
        &mut caller,
        &connect_request("c-1", json!({"token": "t"})).to_string(),
    )
    .await;
    let res = next_json(&mut caller).await;
    assert_eq!(res["error"]["code"], "studio.gateway_url_missing");
    assert_eq!(next_close(&mut caller).await.0, 1011);
}

#[tokio::test]
async fn malformed_caller_frame_closes_both_sides() {
    let (gateway, url) = fake_gateway().await;
    let (addr, _) = start_relay(UpstreamSettings::new(url, Some("t"))).await;
    let mut caller = attach(addr).await;
    let mut upstream = accept(&gateway).await;

    send_text(&mut caller, "{not json").await;
    assert_eq!(next_close(&mut caller).await.0, 1003);
    // Normal close once open, or a dropped socket if the dial was still settling.
    let (code, _) = next_close(&mut upstream).await;
    assert!(code == 1000 || code == 1006, "unexpected upstream close {code}");
}

#[tokio::test]
async fn upstream_close_before_handshake_is_synthesized() {
    let (gateway, url) = fake_gateway().await;
    let (addr, _) = start_relay(UpstreamSettings::new(url, Some("t"))).await;
    let mut caller = attach(addr).await;
    let mut upstream = accept(&gateway).await;
    upstream
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();

    send_text(
        &mut caller,
        &connect_request("c-9", json!({"token": "t"})).to_string(),
    )
    .await;
    let res = next_json(&mut caller).await;
    assert_eq!(res["id"], "c-9");
    assert_eq!(res["error"]["code"], "studio.upstream_closed");
    assert_eq!(res["error"]["retryable"], true);
    assert_eq!(next_close(&mut caller).await.0, 1012);
}

/// Close the upstream and wait for the relay to acknowledge it.
async fn close_upstream(mut upstream: UpstreamWs) {
    upstream
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();
    timeout(WAIT, async { while let Some(Ok(_)) = upstream.next().await {} })
        .await
        .unwrap();
}

#[tokio::test]
async fn request_after_upstream_failure_is_answered_then_closed() {
    let (gateway, url) = fake_gateway().await;
    let (addr, _) = start_relay(UpstreamSettings::new(url, Some("t"))).await;
    let mut caller = attach(addr).await;
    close_upstream(accept(&gateway).await).await;

    send_text(
        &mut caller,
        &json!({"type": "req", "id": "x", "method": "status"}).to_string(),
    )
    .await;
    let res = next_json(&mut caller).await;
    assert_eq!(res["id"], "x");
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "studio.upstream_closed");
    assert_eq!(next_close(&mut caller).await.0, 1012);
}

#[tokio::test]
async fn silent_caller_is_closed_once_the_failure_hold_expires() {
    let (gateway, url) = fake_gateway().await;
    let (addr, _) = start_relay_with(UpstreamSettings::new(url, Some("t")), short_limits()).await;
    let mut caller = attach(addr).await;
    close_upstream(accept(&gateway).await).await;

    let (code, reason) = next_close(&mut caller).await;
    assert_eq!(code, 1012);
    assert!(reason.contains("upstream gateway closed"), "{reason}");
}

#[tokio::test]
async fn stalled_upstream_upgrade_times_out() {
    let (gateway, url) = fake_gateway().await;
    stalled_gateway(gateway);
    let (addr, _) = start_relay_with(UpstreamSettings::new(url, Some("t")), short_limits()).await;
    let mut caller = attach(addr).await;

    send_text(
        &mut caller,
        &connect_request("c-1", json!({"token": "t"})).to_string(),
    )
    .await;
    let res = next_json(&mut caller).await;
    assert_eq!(res["id"], "c-1");
    assert_eq!(res["error"]["code"], "studio.upstream_error");
    assert_eq!(res["error"]["retryable"], true);
    assert_eq!(next_close(&mut caller).await.0, 1011);
}

#[tokio::test]
async fn backlog_overflow_rejects_the_caller() {
    let (gateway, url) = fake_gateway().await;
    stalled_gateway(gateway);
    let limits = RelayLimits {
        connect_timeout: Duration::from_secs(30),
        ..short_limits()
    };
    let (addr, _) = start_relay_with(UpstreamSettings::new(url, Some("t")), limits).await;
    let mut caller = attach(addr).await;

    send_text(
        &mut caller,
        &connect_request("c-1", json!({"token": "t"})).to_string(),
    )
    .await;
    for id in ["r-2", "r-3"] {
        send_text(
            &mut caller,
            &json!({"type": "req", "id": id, "method": "status"}).to_string(),
        )
        .await;
    }

    let res = next_json(&mut caller).await;
    assert_eq!(res["id"], "c-1");
    assert_eq!(res["error"]["code"], "studio.backlog_full");
    assert_eq!(next_close(&mut caller).await.0, 1008);
}

#[tokio::test]
async fn upstream_connect_failure_close_is_mirrored() {
    let (gateway, url) = fake_gateway().await;
    let (addr, _) = start_relay(UpstreamSettings::new(url, Some("t"))).await;
    let mut caller = attach(addr).await;
    let mut upstream = accept(&gateway).await;

    send_text(
        &mut caller,
        &connect_request("c-1", json!({"token": "t"})).to_string(),
    )
    .await;
    next_json(&mut upstream).await;
    upstream
        .close(Some(CloseFrame {
            code: CloseCode::from(4008),
            reason: "connect failed: UNAUTHORIZED token mismatch".into(),
        }))
        .await
        .unwrap();

    let res = next_json(&mut caller).await;
    assert_eq!(res["id"], "c-1");
    assert_eq!(res["error"]["code"], "UNAUTHORIZED");
    assert_eq!(res["error"]["message"], "token mismatch");
    let (code, reason) = next_close(&mut caller).await;
    assert_eq!(code, 4008);
    assert_eq!(reason, "connect failed: UNAUTHORIZED token mismatch");
}

// ── Health ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_active_sessions() {
    let (gateway, url) = fake_gateway().await;
    let (addr, state) = start_relay(UpstreamSettings::new(url, Some("t"))).await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["protocol"], 3);
    assert_eq!(body["sessions"], 0);

    let _caller = attach(addr).await;
    let _upstream = accept(&gateway).await;
    assert_eq!(state.active_sessions(), 1);
}
