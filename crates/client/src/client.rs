use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
    studio_common::SharedScheduler,
    studio_identity::{DeviceIdentity, KeyValueStore, load_or_create_identity},
    studio_protocol::{
        ErrorShape, EventFrame, Frame, HelloOk, RequestFrame, ResponseFrame, close_codes,
        error_codes,
    },
    tokio::sync::{Notify, broadcast, mpsc, oneshot, watch},
    tracing::{debug, info, warn},
};

use crate::{
    ClientError, ClientOptions, ConnectError,
    connection::{self, Outbound},
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What subscribers receive from the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Event(EventFrame),
    /// Sequence numbers skipped between two events. Informational only.
    ///
    /// Sequences are per transport: each new socket starts counting afresh,
    /// so events lost while reconnecting show up as a `Reconnecting` status
    /// rather than as a gap.
    Gap { expected: u64, received: u64 },
    /// The caller disconnected. Nothing follows until the next `connect`.
    Closed,
}

type PendingReply = oneshot::Sender<Result<Value, ClientError>>;

#[derive(Default)]
struct State {
    /// Present only while a handshake-complete transport is open.
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    pending: HashMap<String, PendingReply>,
    last_seq: Option<u64>,
    manual_disconnect: bool,
    /// Bumped by every `connect`/`disconnect`; stale drivers compare against it.
    generation: u64,
    hello: Option<HelloOk>,
}

pub(crate) struct Inner {
    pub(crate) options: ClientOptions,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) scheduler: SharedScheduler,
    pub(crate) shutdown: Notify,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<GatewayEvent>,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.generation == generation && !state.manual_disconnect
    }

    pub(crate) fn set_status(&self, generation: u64, status: ConnectionStatus) {
        let state = self.lock();
        if state.generation == generation {
            self.status.send_replace(status);
        }
    }

    /// Make a freshly handshaken session the live one. Returns `false` when the
    /// session belongs to a superseded `connect`.
    pub(crate) fn attach(
        &self,
        generation: u64,
        outbound: mpsc::UnboundedSender<Outbound>,
        hello: &HelloOk,
    ) -> bool {
        let mut state = self.lock();
        if state.generation != generation || state.manual_disconnect {
            return false;
        }
        state.outbound = Some(outbound);
        state.hello = Some(hello.clone());
        self.status.send_replace(ConnectionStatus::Connected);
        true
    }

    /// A new transport is open; its events start a new sequence.
    pub(crate) fn reset_sequence(&self) {
        self.lock().last_seq = None;
    }

    pub(crate) fn detach(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.outbound = None;
        }
    }

    pub(crate) fn load_identity(&self) -> Option<DeviceIdentity> {
        if !self.options.device_identity {
            return None;
        }
        match load_or_create_identity(self.store.as_ref(), self.scheduler.now_ms()) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!(error = %e, "device identity unavailable, using token-only handshake");
                None
            },
        }
    }

    /// Fail every in-flight call. Calls are never replayed on a new transport.
    pub(crate) fn fail_pending(&self) {
        let pending = std::mem::take(&mut self.lock().pending);
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing in-flight calls");
        }
        for (_, reply) in pending {
            let _ = reply.send(Err(ClientError::Disconnected));
        }
    }

    fn start_call(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<oneshot::Receiver<Result<Value, ClientError>>, ClientError> {
        let mut state = self.lock();
        let Some(outbound) = state.outbound.clone() else {
            return Err(ClientError::NotConnected);
        };
        let id = uuid::Uuid::new_v4().to_string();
        let text = Frame::from(RequestFrame {
            id: id.clone(),
            method: method.to_string(),
            params,
        })
        .to_json()?;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(id.clone(), tx);
        if outbound.send(Outbound::Text(text)).is_err() {
            state.pending.remove(&id);
            return Err(ClientError::NotConnected);
        }
        debug!(id = %id, method, "gateway call sent");
        Ok(rx)
    }

    fn resolve(&self, response: ResponseFrame) {
        let Some(reply) = self.lock().pending.remove(&response.id) else {
            debug!(id = %response.id, "response for unknown request");
            return;
        };
        let result = if response.ok {
            Ok(response.payload.unwrap_or(Value::Null))
        } else {
            Err(ClientError::Call(response.error.unwrap_or_else(|| {
                ErrorShape::new(error_codes::INTERNAL, "request failed")
            })))
        };
        let _ = reply.send(result);
    }

    pub(crate) fn dispatch_event(&self, event: EventFrame) {
        let gap = {
            let mut state = self.lock();
            let gap = match (state.last_seq, event.seq) {
                (Some(last), Some(seq)) if seq > last + 1 => Some(GatewayEvent::Gap {
                    expected: last + 1,
                    received: seq,
                }),
                _ => None,
            };
            if event.seq.is_some() {
                state.last_seq = event.seq;
            }
            gap
        };
        if let Some(gap) = gap {
            warn!(?gap, "gateway event sequence gap");
            let _ = self.events.send(gap);
        }
        let _ = self.events.send(GatewayEvent::Event(event));
    }

    /// Route one text frame received on an established session.
    pub(crate) fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Response(response) => self.resolve(response),
            Frame::Event(event) => self.dispatch_event(event),
            Frame::Request(request) => {
                debug!(method = %request.method, "ignoring gateway-initiated request");
            },
        }
    }
}

/// Connection to a gateway (directly or through the relay).
///
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl GatewayClient {
    pub fn new(
        options: ClientOptions,
        store: Arc<dyn KeyValueStore>,
        scheduler: SharedScheduler,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                options,
                store,
                scheduler,
                shutdown: Notify::new(),
                status,
                events,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    /// Hello payload of the current session.
    pub fn hello(&self) -> Option<HelloOk> {
        self.inner.lock().hello.clone()
    }

    /// Open the transport and complete the handshake.
    ///
    /// Replaces any previous session. A failure here is returned to the caller
    /// and does not start the reconnect loop; only a session that completed
    /// its handshake is re-established automatically after loss.
    pub async fn connect(&self, url: &str) -> Result<HelloOk, ConnectError> {
        let generation = self.begin();
        info!(url, "connecting to gateway");

        let shutdown = self.inner.shutdown.notified();
        let opened = tokio::select! {
            result = connection::open_session(&self.inner, url) => result,
            () = shutdown => Err(ConnectError::Cancelled),
        };

        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                warn!(url, error = %e, "gateway connect failed");
                self.inner
                    .set_status(generation, ConnectionStatus::Disconnected);
                return Err(e);
            },
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if !self.inner.attach(generation, tx, &session.hello) {
            session.close_normal().await;
            return Err(ConnectError::Cancelled);
        }
        info!(url, protocol = session.hello.protocol, "gateway connected");
        let hello = session.hello.clone();
        tokio::spawn(connection::drive(
            Arc::clone(&self.inner),
            url.to_string(),
            generation,
            session,
            rx,
        ));
        Ok(hello)
    }

    /// Send a request and wait for its response.
    ///
    /// Returns [`ClientError::NotConnected`] immediately, without touching the
    /// network, when no session is open. There is no timeout at this layer.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let reply = self.inner.start_call(method, params)?;
        reply.await.unwrap_or(Err(ClientError::Disconnected))
    }

    /// Close the session, fail in-flight calls, and stop reconnecting.
    pub fn disconnect(&self) {
        let outbound = {
            let mut state = self.inner.lock();
            state.manual_disconnect = true;
            state.generation += 1;
            state.hello = None;
            state.outbound.take()
        };
        if let Some(outbound) = outbound {
            let _ = outbound.send(Outbound::Close {
                code: close_codes::NORMAL,
                reason: "client disconnect".into(),
            });
        }
        self.inner.shutdown.notify_waiters();
        self.inner.fail_pending();
        self.inner.status.send_replace(ConnectionStatus::Disconnected);
        let _ = self.inner.events.send(GatewayEvent::Closed);
        info!("gateway disconnected by caller");
    }

    /// Tear down whatever was running and start a new generation.
    fn begin(&self) -> u64 {
        let (generation, previous) = {
            let mut state = self.inner.lock();
            state.generation += 1;
            state.manual_disconnect = false;
            state.hello = None;
            (state.generation, state.outbound.take())
        };
        if let Some(previous) = previous {
            let _ = previous.send(Outbound::Close {
                code: close_codes::NORMAL,
                reason: "reconnecting".into(),
            });
        }
        self.inner.shutdown.notify_waiters();
        self.inner.fail_pending();
        self.inner.set_status(generation, ConnectionStatus::Connecting);
        generation
    }
}
