//! One caller ↔ upstream pairing.

use std::{pin::Pin, sync::Arc, time::Duration};

use {
    axum::extract::ws::{self, WebSocket},
    futures::{SinkExt, StreamExt},
    serde_json::Value,
    studio_protocol::{
        ConnectFailure, ErrorShape, Frame, ResponseFrame, close_codes, is_connect_request,
        truncate_close_reason,
    },
    tokio::{net::TcpStream, time::Instant},
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{self, protocol::CloseFrame as UpstreamCloseFrame},
    },
    tracing::{debug, info, instrument, warn},
};

use crate::{
    RelayError, RelayLimits, RelayState,
    inject::{HandshakeAuth, prepare_connect_frame, request_id},
    settings::UpstreamSettings,
};

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<UpstreamStream, RelayError>> + Send>>;

/// How the upstream side currently looks.
enum Upstream {
    Connecting(ConnectFuture),
    Open(UpstreamStream),
    /// Settings could not produce a usable target; report on the next handshake.
    Unavailable,
}

enum UpstreamEvent {
    Opened(Result<UpstreamStream, RelayError>),
    Message(Option<Result<tungstenite::Message, tungstenite::Error>>),
}

impl Upstream {
    /// Next thing that happens upstream. Never resolves while unavailable.
    async fn event(&mut self) -> UpstreamEvent {
        match self {
            Self::Connecting(fut) => UpstreamEvent::Opened(fut.await),
            Self::Open(ws) => UpstreamEvent::Message(ws.next().await),
            Self::Unavailable => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        if let Self::Open(ws) = self {
            let _ = ws
                .close(Some(UpstreamCloseFrame {
                    code: close_codes::NORMAL.into(),
                    reason: "".into(),
                }))
                .await;
        }
        *self = Self::Unavailable;
    }
}

/// Handshake bookkeeping for the caller side.
#[derive(Default)]
struct HandshakeState {
    /// Id of the caller's `connect` request, until the upstream answers it.
    pending_id: Option<String>,
    answered: bool,
}

struct Relay {
    caller: WebSocket,
    upstream: Upstream,
    /// Caller frames waiting for the upstream to open, in arrival order.
    backlog: Vec<String>,
    limits: RelayLimits,
    relay_token: Option<String>,
    handshake: HandshakeState,
    /// Set once the upstream is known to be unusable, until it is reported.
    failure: Option<RelayError>,
    /// When a held failure is reported even if the caller stays silent.
    failure_deadline: Option<Instant>,
}

enum Step {
    Continue,
    Done,
}

#[instrument(skip_all, fields(conn_id = %conn_id))]
pub(crate) async fn run(caller: WebSocket, state: Arc<RelayState>, conn_id: String) {
    let limits = state.limits;
    let (upstream, relay_token, failure) = match state.settings.load() {
        Ok(settings) => open_upstream(&settings, limits.connect_timeout),
        Err(e) => {
            warn!(error = %e, "failed to load gateway settings");
            (
                Upstream::Unavailable,
                None,
                Some(RelayError::SettingsLoad(e.to_string())),
            )
        },
    };

    let failure_deadline = failure
        .as_ref()
        .map(|_| Instant::now() + limits.failure_hold);
    let mut relay = Relay {
        caller,
        upstream,
        backlog: Vec::new(),
        limits,
        relay_token,
        handshake: HandshakeState::default(),
        failure,
        failure_deadline,
    };
    relay.pump().await;
    debug!("relay session finished");
}

fn open_upstream(
    settings: &UpstreamSettings,
    connect_timeout: Duration,
) -> (Upstream, Option<String>, Option<RelayError>) {
    let token = settings.token().map(str::to_string);
    match settings.resolve_url() {
        Ok(url) => {
            debug!(url = %url, "opening upstream");
            let fut: ConnectFuture = Box::pin(async move {
                match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
                    Ok(Ok((ws, _))) => Ok(ws),
                    Ok(Err(e)) => Err(RelayError::Upstream(e.to_string())),
                    Err(_) => Err(RelayError::Upstream(format!(
                        "no websocket upgrade within {} ms",
                        connect_timeout.as_millis()
                    ))),
                }
            });
            (Upstream::Connecting(fut), token, None)
        },
        Err(e) => {
            warn!(error = %e, "gateway target unusable");
            (Upstream::Unavailable, token, Some(e))
        },
    }
}

impl Relay {
    async fn pump(&mut self) {
        loop {
            let deadline = self.failure_deadline;
            let step = tokio::select! {
                message = self.caller.recv() => self.on_caller(message).await,
                event = self.upstream.event() => match event {
                    UpstreamEvent::Opened(opened) => self.on_upstream_open(opened).await,
                    UpstreamEvent::Message(message) => self.on_upstream(message).await,
                },
                () = hold_expired(deadline) => self.release_failure().await,
            };
            if matches!(step, Step::Done) {
                return;
            }
        }
    }

    // ── Caller → upstream ───────────────────────────────────────────────────

    async fn on_caller(&mut self, message: Option<Result<ws::Message, axum::Error>>) -> Step {
        let text = match message {
            Some(Ok(ws::Message::Text(text))) => text.as_str().to_string(),
            Some(Ok(ws::Message::Binary(_))) => {
                return self
                    .reject_caller(close_codes::INVALID_FRAME, "binary frames are not supported")
                    .await;
            },
            Some(Ok(ws::Message::Ping(_) | ws::Message::Pong(_))) => return Step::Continue,
            Some(Ok(ws::Message::Close(_))) | None => {
                debug!("caller closed");
                self.upstream.close().await;
                return Step::Done;
            },
            Some(Err(e)) => {
                debug!(error = %e, "caller transport error");
                self.upstream.close().await;
                return Step::Done;
            },
        };

        let mut frame: Value = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed frame from caller");
                return self
                    .reject_caller(close_codes::INVALID_FRAME, "invalid frame")
                    .await;
            },
        };

        if let Some(failure) = self.failure.take() {
            // Any request is answered with the held failure; other frames just close.
            let id = is_request(&frame).then(|| request_id(&frame)).flatten();
            return self.fail_handshake(id.as_deref(), &failure).await;
        }

        if is_connect_request(&frame) {
            let id = request_id(&frame);
            match prepare_connect_frame(&mut frame, self.relay_token.as_deref()) {
                Ok(HandshakeAuth::Caller) => debug!("forwarding caller credential"),
                Ok(HandshakeAuth::Injected) => debug!("injected relay credential"),
                Err(e) => return self.fail_handshake(id.as_deref(), &e).await,
            }
            self.handshake.pending_id = id;
            self.handshake.answered = false;
        }

        self.send_upstream(frame.to_string()).await
    }

    async fn send_upstream(&mut self, text: String) -> Step {
        match &mut self.upstream {
            Upstream::Open(ws) => {
                if let Err(e) = ws.send(tungstenite::Message::Text(text.into())).await {
                    return self.upstream_failed(RelayError::Upstream(e.to_string())).await;
                }
            },
            Upstream::Connecting(_) if self.backlog.len() >= self.limits.max_backlog => {
                let err = RelayError::BacklogFull(self.limits.max_backlog);
                let id = self.handshake.pending_id.take();
                return self.fail_handshake(id.as_deref(), &err).await;
            },
            Upstream::Connecting(_) => self.backlog.push(text),
            Upstream::Unavailable => {
                // A failed upstream always ends the session first.
                debug!("dropping caller frame, upstream unavailable");
            },
        }
        Step::Continue
    }

    // ── Upstream → caller ───────────────────────────────────────────────────

    async fn on_upstream_open(&mut self, opened: Result<UpstreamStream, RelayError>) -> Step {
        let mut ws = match opened {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "upstream connect failed");
                self.upstream = Upstream::Unavailable;
                return self.upstream_failed(e).await;
            },
        };
        info!(buffered = self.backlog.len(), "upstream open");
        for text in std::mem::take(&mut self.backlog) {
            if let Err(e) = ws.send(tungstenite::Message::Text(text.into())).await {
                self.upstream = Upstream::Unavailable;
                return self.upstream_failed(RelayError::Upstream(e.to_string())).await;
            }
        }
        self.upstream = Upstream::Open(ws);
        Step::Continue
    }

    async fn on_upstream(
        &mut self,
        message: Option<Result<tungstenite::Message, tungstenite::Error>>,
    ) -> Step {
        match message {
            Some(Ok(tungstenite::Message::Text(text))) => {
                self.observe_upstream_text(text.as_str());
                self.send_caller(ws::Message::Text(text.as_str().into())).await
            },
            Some(Ok(tungstenite::Message::Binary(data))) => {
                self.send_caller(ws::Message::Binary(data)).await
            },
            Some(Ok(tungstenite::Message::Close(frame))) => {
                self.upstream = Upstream::Unavailable;
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                    .unwrap_or((close_codes::SERVICE_RESTART, String::new()));
                info!(code, reason = %reason, "upstream closed");
                self.upstream_closed(code, reason).await
            },
            Some(Ok(_)) => Step::Continue,
            Some(Err(e)) => {
                self.upstream = Upstream::Unavailable;
                self.upstream_failed(RelayError::Upstream(e.to_string())).await
            },
            None => {
                self.upstream = Upstream::Unavailable;
                self.upstream_closed(close_codes::SERVICE_RESTART, String::new())
                    .await
            },
        }
    }

    /// Note when the upstream answers the caller's handshake.
    fn observe_upstream_text(&mut self, text: &str) {
        let Some(pending) = self.handshake.pending_id.as_deref() else {
            return;
        };
        if let Ok(Frame::Response(response)) = Frame::parse(text)
            && response.id == pending
        {
            debug!(ok = response.ok, "upstream answered handshake");
            self.handshake.pending_id = None;
            self.handshake.answered = true;
        }
    }

    async fn send_caller(&mut self, message: ws::Message) -> Step {
        if let Err(e) = self.caller.send(message).await {
            debug!(error = %e, "caller send failed");
            self.upstream.close().await;
            return Step::Done;
        }
        Step::Continue
    }

    // ── Failure paths ───────────────────────────────────────────────────────

    async fn upstream_closed(&mut self, code: u16, reason: String) -> Step {
        if code == close_codes::CONNECT_FAILED
            && let Some(failure) = ConnectFailure::parse_close_reason(&reason)
        {
            if let Some(id) = self.handshake.pending_id.take() {
                let shape = ErrorShape::new(failure.code, failure.message);
                let _ = self.send_response(ResponseFrame::err(id, shape)).await;
            }
            return self.close_caller(close_codes::CONNECT_FAILED, &reason).await;
        }
        let err = RelayError::UpstreamClosed(if reason.is_empty() {
            format!("code {code}")
        } else {
            format!("code {code}: {reason}")
        });
        self.upstream_failed(err).await
    }

    /// Report an unusable upstream to the caller.
    ///
    /// With a handshake in flight the caller gets an error response for it,
    /// then the close. Before any handshake the failure is held until the
    /// caller's next frame, so a request can still get a structured answer.
    /// A caller that stays silent is closed once the hold expires.
    async fn upstream_failed(&mut self, err: RelayError) -> Step {
        if let Some(id) = self.handshake.pending_id.take() {
            return self.fail_handshake(Some(&id), &err).await;
        }
        if self.handshake.answered {
            warn!(error = %err, "upstream lost after handshake");
            return self.close_caller(err.close_code(), &err.to_string()).await;
        }
        debug!(error = %err, "upstream failed before handshake, waiting for caller");
        self.failure = Some(err);
        self.failure_deadline = Some(Instant::now() + self.limits.failure_hold);
        Step::Continue
    }

    async fn release_failure(&mut self) -> Step {
        self.failure_deadline = None;
        match self.failure.take() {
            Some(err) => {
                info!(error = %err, "caller sent nothing before the failure hold expired");
                self.fail_handshake(None, &err).await
            },
            None => Step::Continue,
        }
    }

    async fn fail_handshake(&mut self, id: Option<&str>, err: &RelayError) -> Step {
        warn!(code = err.code(), error = %err, "rejecting caller handshake");
        if let Some(id) = id {
            let _ = self.send_response(ResponseFrame::err(id, err.to_error_shape())).await;
        }
        self.upstream.close().await;
        self.close_caller(err.close_code(), &err.to_string()).await
    }

    async fn send_response(&mut self, response: ResponseFrame) -> Result<(), axum::Error> {
        let text = match Frame::from(response).to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode relay response");
                return Ok(());
            },
        };
        self.caller.send(ws::Message::Text(text.into())).await
    }

    async fn reject_caller(&mut self, code: u16, reason: &str) -> Step {
        self.upstream.close().await;
        self.close_caller(code, reason).await
    }

    async fn close_caller(&mut self, code: u16, reason: &str) -> Step {
        let _ = self
            .caller
            .send(ws::Message::Close(Some(ws::CloseFrame {
                code,
                reason: truncate_close_reason(reason).into(),
            })))
            .await;
        Step::Done
    }
}

async fn hold_expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn is_request(frame: &Value) -> bool {
    frame.get("type").and_then(Value::as_str) == Some("req")
}
