//! One gateway transport: handshake, frame pump, and the reconnect loop.

use std::{collections::HashSet, sync::Arc};

use {
    futures::{SinkExt, StreamExt},
    studio_common::sleep,
    studio_identity::{
        DeviceAuthEntry, DeviceIdentity, HandshakeSigningInput, build_signed_handshake_fields,
        clear_credential, record_issued_credential,
    },
    studio_protocol::{
        CONNECT_METHOD, ConnectAuth, ConnectChallenge, ConnectFailure, ConnectParams, ErrorShape,
        Frame, HelloOk, PROTOCOL_VERSION, RequestFrame, close_codes, error_codes, events,
    },
    tokio::{net::TcpStream, sync::mpsc},
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{
            Message,
            protocol::{CloseFrame, frame::coding::CloseCode},
        },
    },
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    Backoff, ConnectError,
    client::{ConnectionStatus, Inner},
};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Commands from the client handle to the transport task.
pub(crate) enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

pub(crate) struct Session {
    pub(crate) ws: WsStream,
    pub(crate) hello: HelloOk,
}

impl Session {
    pub(crate) async fn close_normal(mut self) {
        let _ = self.ws.close(Some(close_frame(close_codes::NORMAL, ""))).await;
    }
}

fn close_frame(code: u16, reason: &str) -> CloseFrame {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }
}

fn validate_url(url: &str) -> Result<(), ConnectError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(ConnectError::rejected(
            error_codes::GATEWAY_URL_MISSING,
            "gateway url is not configured",
        ));
    }
    match Url::parse(trimmed) {
        Ok(parsed) if matches!(parsed.scheme(), "ws" | "wss") => Ok(()),
        Ok(parsed) => Err(ConnectError::rejected(
            error_codes::GATEWAY_URL_INVALID,
            format!("unsupported scheme {}", parsed.scheme()),
        )),
        Err(e) => Err(ConnectError::rejected(
            error_codes::GATEWAY_URL_INVALID,
            e.to_string(),
        )),
    }
}

// ── Handshake ────────────────────────────────────────────────────────────────

struct SentHandshake {
    nonce: Option<String>,
    used_device_token: bool,
}

struct Handshake<'a> {
    inner: &'a Inner,
    url: &'a str,
    identity: Option<DeviceIdentity>,
    sent: Vec<(String, SentHandshake)>,
    outstanding: HashSet<String>,
}

impl<'a> Handshake<'a> {
    fn new(inner: &'a Inner, url: &'a str) -> Self {
        Self {
            inner,
            url,
            identity: inner.load_identity(),
            sent: Vec::new(),
            outstanding: HashSet::new(),
        }
    }

    fn last_nonce(&self) -> Option<Option<&str>> {
        self.sent.last().map(|(_, sent)| sent.nonce.as_deref())
    }

    fn request(&self, nonce: Option<&str>) -> Result<(RequestFrame, SentHandshake), ConnectError> {
        let options = &self.inner.options;
        let caller_token = options.token_str().map(str::to_string);
        let (device, token, used_device_token, scopes) = match &self.identity {
            Some(identity) => {
                let signed = build_signed_handshake_fields(
                    identity,
                    self.inner.store.as_ref(),
                    &HandshakeSigningInput {
                        auth_scope: self.url.to_string(),
                        client_id: options.client.id.clone(),
                        client_mode: options.client.mode.clone(),
                        role: options.role.clone(),
                        scopes: options.scopes.clone(),
                        caller_token: caller_token.clone(),
                        nonce: nonce.map(str::to_string),
                        signed_at_ms: self.inner.scheduler.now_ms(),
                    },
                );
                (
                    Some(signed.device),
                    signed.token,
                    signed.used_device_token,
                    signed.scopes,
                )
            },
            None => (None, caller_token, false, options.scopes.clone()),
        };

        let auth = ConnectAuth {
            token,
            password: options.password_str().map(str::to_string),
        };
        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: options.client.clone(),
            role: options.role.clone(),
            scopes,
            device,
            caps: options.caps.clone(),
            auth: (!auth.is_empty()).then_some(auth),
            user_agent: options.user_agent.clone(),
            locale: options.locale.clone(),
        };
        let params = serde_json::to_value(&params).map_err(studio_protocol::Error::from)?;
        Ok((
            RequestFrame {
                id: uuid::Uuid::new_v4().to_string(),
                method: CONNECT_METHOD.to_string(),
                params: Some(params),
            },
            SentHandshake {
                nonce: nonce.map(str::to_string),
                used_device_token,
            },
        ))
    }

    async fn send(&mut self, ws: &mut WsStream, nonce: Option<&str>) -> Result<(), ConnectError> {
        let (request, sent) = self.request(nonce)?;
        let text = Frame::from(request.clone()).to_json()?;
        ws.send(Message::Text(text.into())).await?;
        debug!(
            id = %request.id,
            signed = self.identity.is_some(),
            nonce = nonce.is_some(),
            "sent connect handshake"
        );
        self.outstanding.insert(request.id.clone());
        self.sent.push((request.id, sent));
        Ok(())
    }

    fn used_device_token(&self, id: &str) -> bool {
        self.sent
            .iter()
            .any(|(sent_id, sent)| sent_id == id && sent.used_device_token)
    }

    fn on_success(&self, hello: &HelloOk) {
        let Some(auth) = &hello.auth else {
            return;
        };
        let Some(token) = auth.device_token.as_deref().filter(|t| !t.trim().is_empty()) else {
            return;
        };
        let options = &self.inner.options;
        let entry = DeviceAuthEntry {
            token: token.to_string(),
            role: auth.role.clone().unwrap_or_else(|| options.role.clone()),
            scopes: auth.scopes.clone().unwrap_or_else(|| options.scopes.clone()),
            updated_at_ms: auth
                .issued_at_ms
                .unwrap_or_else(|| self.inner.scheduler.now_ms()),
        };
        record_issued_credential(self.inner.store.as_ref(), self.url, &entry);
    }

    fn on_rejected(&self, id: &str, err: &ConnectError) {
        let options = &self.inner.options;
        if self.used_device_token(id) && options.token_str().is_some() && err.is_auth_failure() {
            info!(
                code = err.code().unwrap_or_default(),
                "cached device token rejected, falling back to shared token"
            );
            clear_credential(self.inner.store.as_ref(), self.url, &options.role);
        }
    }
}

/// Read one frame during the handshake. `Ok(None)` for control frames.
async fn read_frame(ws: &mut WsStream) -> Result<Option<Frame>, ConnectError> {
    match ws.next().await {
        Some(Ok(Message::Text(text))) => Ok(Some(Frame::parse(text.as_str())?)),
        Some(Ok(Message::Close(frame))) => Err(close_error(frame)),
        Some(Ok(_)) => Ok(None),
        Some(Err(e)) => Err(e.into()),
        None => Err(ConnectError::Closed {
            code: 1006,
            reason: "connection ended".into(),
        }),
    }
}

fn close_error(frame: Option<CloseFrame>) -> ConnectError {
    let Some(frame) = frame else {
        return ConnectError::Closed {
            code: 1005,
            reason: String::new(),
        };
    };
    let code = u16::from(frame.code);
    let reason = frame.reason.as_str().to_string();
    if code == close_codes::CONNECT_FAILED
        && let Some(failure) = ConnectFailure::parse_close_reason(&reason)
    {
        return ConnectError::Rejected(failure);
    }
    ConnectError::Closed { code, reason }
}

fn challenge_nonce(payload: Option<serde_json::Value>) -> Option<String> {
    let challenge: ConnectChallenge = serde_json::from_value(payload?).ok()?;
    let nonce = challenge.nonce.trim();
    (!nonce.is_empty()).then(|| nonce.to_string())
}

/// Open the transport and run the handshake to completion.
///
/// The handshake goes out when the settle delay elapses or as soon as a
/// `connect.challenge` arrives, whichever is first. A challenge arriving after
/// the first handshake triggers a re-send signed over the nonce; the first
/// successful response wins, and a rejection only counts once no other
/// handshake is outstanding.
pub(crate) async fn open_session(inner: &Inner, url: &str) -> Result<Session, ConnectError> {
    validate_url(url)?;
    let (mut ws, _) = connect_async(url.trim()).await?;
    debug!(url, "gateway transport open");
    inner.reset_sequence();

    let mut handshake = Handshake::new(inner, url);
    let settle = sleep(inner.scheduler.as_ref(), inner.options.settle);
    tokio::pin!(settle);
    let mut settled = false;

    loop {
        tokio::select! {
            () = &mut settle, if !settled => {
                settled = true;
                if handshake.sent.is_empty() {
                    handshake.send(&mut ws, None).await?;
                }
            },
            frame = read_frame(&mut ws) => {
                let frame = match frame {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        if let Some((id, _)) = handshake.sent.last() {
                            handshake.on_rejected(id, &e);
                        }
                        return Err(e);
                    },
                };
                match frame {
                    Frame::Event(event) if event.event == events::CONNECT_CHALLENGE => {
                        let Some(nonce) = challenge_nonce(event.payload) else {
                            warn!("connect challenge without nonce");
                            continue;
                        };
                        settled = true;
                        if handshake.last_nonce() != Some(Some(nonce.as_str())) {
                            handshake.send(&mut ws, Some(&nonce)).await?;
                        }
                    },
                    Frame::Event(event) => inner.dispatch_event(event),
                    Frame::Response(response) if handshake.outstanding.remove(&response.id) => {
                        if response.ok {
                            let hello = match response.payload {
                                Some(payload) => serde_json::from_value::<HelloOk>(payload)
                                    .map_err(studio_protocol::Error::from)?,
                                None => HelloOk::default(),
                            };
                            handshake.on_success(&hello);
                            return Ok(Session { ws, hello });
                        }
                        let failure = ConnectFailure::from(response.error.unwrap_or_else(|| {
                            ErrorShape::new(error_codes::UNAVAILABLE, "handshake rejected")
                        }));
                        if !handshake.outstanding.is_empty() {
                            debug!(code = %failure.code, "superseded handshake rejected");
                            continue;
                        }
                        let reason = failure.to_close_reason();
                        let err = ConnectError::Rejected(failure);
                        handshake.on_rejected(&response.id, &err);
                        let _ = ws
                            .close(Some(close_frame(close_codes::CONNECT_FAILED, &reason)))
                            .await;
                        return Err(err);
                    },
                    Frame::Response(response) => {
                        debug!(id = %response.id, "ignoring response during handshake");
                    },
                    Frame::Request(request) => {
                        debug!(method = %request.method, "ignoring request during handshake");
                    },
                }
            },
        }
    }
}

// ── Established session ──────────────────────────────────────────────────────

#[derive(Debug)]
enum SessionEnd {
    /// Closed from our side (`disconnect` or a newer `connect`).
    Local,
    Remote { code: Option<u16>, reason: String },
    Transport(String),
    Protocol(String),
}

async fn run_session(
    inner: &Inner,
    ws: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> SessionEnd {
    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = ws.send(Message::Text(text.into())).await {
                        return SessionEnd::Transport(e.to_string());
                    }
                },
                Some(Outbound::Close { code, reason }) => {
                    let _ = ws.close(Some(close_frame(code, &reason))).await;
                    return SessionEnd::Local;
                },
                None => {
                    let _ = ws.close(None).await;
                    return SessionEnd::Local;
                },
            },
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) => match Frame::parse(text.as_str()) {
                    Ok(frame) => inner.handle_frame(frame),
                    Err(e) => {
                        let _ = ws
                            .close(Some(close_frame(close_codes::INVALID_FRAME, "invalid frame")))
                            .await;
                        return SessionEnd::Protocol(e.to_string());
                    },
                },
                Some(Ok(Message::Close(frame))) => {
                    return SessionEnd::Remote {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame
                            .map(|f| f.reason.as_str().to_string())
                            .unwrap_or_default(),
                    };
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => return SessionEnd::Transport(e.to_string()),
                None => {
                    return SessionEnd::Remote {
                        code: None,
                        reason: String::new(),
                    };
                },
            },
        }
    }
}

/// Pump an established session, then keep reconnecting with backoff until
/// the caller disconnects or the gateway rejects us for good.
pub(crate) async fn drive(
    inner: Arc<Inner>,
    url: String,
    generation: u64,
    session: Session,
    outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut ws = session.ws;
    let mut outbound = outbound;
    let mut backoff = Backoff::new(inner.options.backoff);

    loop {
        let end = run_session(&inner, &mut ws, &mut outbound).await;
        inner.detach(generation);
        inner.fail_pending();
        if !inner.is_current(generation) {
            debug!(?end, "gateway session ended after disconnect");
            return;
        }
        match &end {
            SessionEnd::Local => return,
            SessionEnd::Protocol(error) => {
                warn!(error = %error, "gateway sent an invalid frame, not reconnecting");
                inner.set_status(generation, ConnectionStatus::Disconnected);
                return;
            },
            SessionEnd::Remote { code, reason } => {
                info!(code = ?code, reason = %reason, "gateway connection closed, reconnecting");
            },
            SessionEnd::Transport(error) => {
                warn!(error = %error, "gateway transport failed, reconnecting");
            },
        }
        inner.set_status(generation, ConnectionStatus::Reconnecting);

        loop {
            let delay = backoff.next_delay();
            let shutdown = inner.shutdown.notified();
            if !inner.is_current(generation) {
                return;
            }
            debug!(attempt = backoff.attempt(), delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "reconnect scheduled");
            tokio::select! {
                () = sleep(inner.scheduler.as_ref(), delay) => {},
                () = shutdown => return,
            }

            let shutdown = inner.shutdown.notified();
            if !inner.is_current(generation) {
                return;
            }
            let attempt = tokio::select! {
                result = open_session(&inner, &url) => result,
                () = shutdown => return,
            };
            match attempt {
                Ok(next) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    if !inner.attach(generation, tx, &next.hello) {
                        next.close_normal().await;
                        return;
                    }
                    info!(attempts = backoff.attempt(), "gateway reconnected");
                    backoff.reset();
                    ws = next.ws;
                    outbound = rx;
                    break;
                },
                Err(e) if !e.is_retryable() => {
                    warn!(error = %e, "gateway rejected reconnect, giving up");
                    inner.set_status(generation, ConnectionStatus::Disconnected);
                    return;
                },
                Err(e) => {
                    warn!(attempt = backoff.attempt(), error = %e, "gateway reconnect failed");
                },
            }
        }
    }
}
