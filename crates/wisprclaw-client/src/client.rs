//! Connection manager.
//!
//! [`GatewayClient`] owns at most one live connection. Handshakes are
//! serialized by their own async mutex, so concurrent callers of
//! [`GatewayClient::ensure_connected`] queue behind a single attempt and then
//! take the fast path. The connection slot itself is only ever locked
//! briefly, and every pending connect races a disconnect signal, so
//! [`GatewayClient::disconnect`] never waits on a handshake.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;
use wisprclaw_core::message::{self, Frame, RequestFrame};
use wisprclaw_core::{ConnectionState, DeviceIdentity};

use crate::agent::{AgentParams, reply_text};
use crate::handshake::{ConnectParams, verify_hello};
use crate::router::{Reply, ResponseRouter};
use crate::{Error, GatewayConfig, receiver};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// One open socket with its router and receive task.
struct Link {
    generation: u64,
    sink: Arc<Mutex<WsSink>>,
    router: Arc<ResponseRouter>,
    receiver: JoinHandle<()>,
}

impl Link {
    fn is_open(&self) -> bool {
        !self.router.is_closed() && !self.receiver.is_finished()
    }

    fn channel(&self) -> Channel {
        Channel {
            generation: self.generation,
            sink: self.sink.clone(),
            router: self.router.clone(),
        }
    }

    async fn shutdown(&self) {
        self.receiver.abort();
        self.router.fail_all(disconnected());
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::trace!(error = %e, "Socket close failed");
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// What a request needs from a link, without holding the connection slot.
#[derive(Clone)]
struct Channel {
    generation: u64,
    sink: Arc<Mutex<WsSink>>,
    router: Arc<ResponseRouter>,
}

impl Channel {
    /// Register and write one request frame. The receiver resolves with the
    /// final response, or with the write error if the frame never left.
    async fn send(&self, method: &str, params: Value) -> Result<oneshot::Receiver<Reply>, Error> {
        let id = Uuid::new_v4().to_string();
        let frame = Frame::Req(RequestFrame::new(id.as_str(), method, params));
        let text = message::encode(&frame).map_err(|e| Error::Encode(e.to_string()))?;

        let rx = self.router.register(&id);
        let sent = self.sink.lock().await.send(Message::Text(text.into())).await;
        match sent {
            Ok(()) => tracing::trace!(%id, method, "Request sent"),
            Err(e) => self.router.fail(&id, e.into()),
        }
        Ok(rx)
    }

    /// Send one request and wait for its final response.
    async fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        let rx = self.send(method, params).await?;
        rx.await.unwrap_or(Err(Error::Cancelled))
    }
}

/// Long-lived authenticated client for the agent gateway.
pub struct GatewayClient {
    config: GatewayConfig,
    identity: DeviceIdentity,
    link: StdMutex<Option<Link>>,
    handshake_gate: Mutex<()>,
    disconnects: watch::Sender<u64>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, identity: DeviceIdentity) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (disconnects, _) = watch::channel(0);
        Self {
            config,
            identity,
            link: StdMutex::new(None),
            handshake_gate: Mutex::new(()),
            disconnects,
            state,
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Callers must hold the slot lock.
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    fn disconnected_since(&self, epoch: u64) -> bool {
        *self.disconnects.borrow() != epoch
    }

    /// Move to `state` unless the client was disconnected since `epoch`.
    fn enter(&self, epoch: u64, state: ConnectionState) -> Result<(), Error> {
        let _slot = self.slot();
        if self.disconnected_since(epoch) {
            return Err(disconnected());
        }
        self.set_state(state);
        Ok(())
    }

    fn authenticated_channel(&self) -> Option<Channel> {
        let slot = self.slot();
        slot.as_ref()
            .filter(|link| link.is_open() && self.state() == ConnectionState::Authenticated)
            .map(Link::channel)
    }

    /// Make sure an authenticated connection is open.
    ///
    /// Returns immediately when already authenticated; otherwise tears down
    /// any stale connection and runs a full handshake. A [`Self::disconnect`]
    /// while this is pending fails it with [`Error::Closed`].
    pub async fn ensure_connected(&self) -> Result<(), Error> {
        self.connected_channel().await.map(|_| ())
    }

    async fn connected_channel(&self) -> Result<Channel, Error> {
        if let Some(channel) = self.authenticated_channel() {
            return Ok(channel);
        }

        let mut disconnects = self.disconnects.subscribe();
        let epoch = *disconnects.borrow_and_update();
        tokio::select! {
            biased;
            _ = disconnects.changed() => Err(disconnected()),
            result = self.connect(epoch) => result,
        }
    }

    /// Run one handshake at a time. Callers queued behind a successful
    /// attempt take the fast path.
    async fn connect(&self, epoch: u64) -> Result<Channel, Error> {
        let _gate = self.handshake_gate.lock().await;
        if let Some(channel) = self.authenticated_channel() {
            return Ok(channel);
        }

        let stale = self.slot().take();
        if let Some(stale) = stale {
            tracing::debug!(generation = stale.generation, "Discarding stale connection");
            stale.shutdown().await;
        }

        match self.open(epoch).await {
            Ok(link) => self.publish(epoch, link).await,
            Err(e) => {
                let _ = self.enter(epoch, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn publish(&self, epoch: u64, link: Link) -> Result<Channel, Error> {
        let rejected = {
            let mut slot = self.slot();
            if !self.disconnected_since(epoch) {
                let channel = link.channel();
                *slot = Some(link);
                self.set_state(ConnectionState::Authenticated);
                return Ok(channel);
            }
            link
        };
        rejected.shutdown().await;
        Err(disconnected())
    }

    async fn open(&self, epoch: u64) -> Result<Link, Error> {
        let url = self.config.websocket_url()?;
        self.enter(epoch, ConnectionState::Connecting)?;
        tracing::info!(url = %url, "Connecting to gateway");

        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (sink, stream) = ws.split();

        let router = Arc::new(ResponseRouter::new());
        let link = Link {
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            sink: Arc::new(Mutex::new(sink)),
            receiver: receiver::spawn(stream, router.clone()),
            router,
        };

        match self.handshake(epoch, &link).await {
            Ok(()) => {
                tracing::info!(
                    device_id = %self.identity.device_id(),
                    generation = link.generation,
                    "Authenticated with gateway"
                );
                Ok(link)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Gateway handshake failed");
                link.shutdown().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, epoch: u64, link: &Link) -> Result<(), Error> {
        self.enter(epoch, ConnectionState::AwaitingChallenge)?;
        let nonce = tokio::time::timeout(
            self.config.challenge_timeout(),
            link.router.wait_for_challenge(),
        )
        .await
        .map_err(|_| Error::Handshake("connect challenge not received".to_string()))??;

        self.enter(epoch, ConnectionState::SendingConnect)?;
        let params =
            ConnectParams::build(&self.config, &self.identity, now_ms()?, nonce.as_deref())?;
        let rx = link.channel().send("connect", params.to_value()?).await?;

        self.enter(epoch, ConnectionState::AwaitingHelloOk)?;
        let hello = rx.await.unwrap_or(Err(Error::Cancelled)).map_err(|e| match e {
            Error::Agent(message) => Error::Handshake(format!("connect rejected: {message}")),
            other => other,
        })?;
        verify_hello(&hello)
    }

    /// Send `text` to the agent and return its reply text.
    ///
    /// A connection-level failure tears the connection down and the request
    /// is retried once on a fresh connection, with the same idempotency key.
    /// A request failed by [`Self::disconnect`] is not retried.
    pub async fn send_request(&self, text: &str) -> Result<String, Error> {
        let idempotency_key = Uuid::new_v4().to_string();
        let params = AgentParams::new(text, &idempotency_key, &self.config.agent_id);
        let params = serde_json::to_value(params).map_err(|e| Error::Encode(e.to_string()))?;

        let payload = self.call_with_retry("agent", params).await?;
        reply_text(&payload)
    }

    /// Send any gateway method and return its final payload, with the same
    /// two-phase handling and retry policy as [`Self::send_request`].
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        self.call_with_retry(method, params).await
    }

    async fn call_with_retry(&self, method: &str, params: Value) -> Result<Value, Error> {
        let epoch = *self.disconnects.borrow();
        match self.call_once(method, params.clone()).await {
            Err(e) if e.is_connection_level() && !self.disconnected_since(epoch) => {
                tracing::warn!(method, error = %e, "Gateway request failed, reconnecting once");
                self.call_once(method, params).await
            }
            other => other,
        }
    }

    async fn call_once(&self, method: &str, params: Value) -> Result<Value, Error> {
        let channel = self.connected_channel().await?;
        let result = channel.call(method, params).await;
        if let Err(e) = &result {
            if e.is_connection_level() {
                self.invalidate(channel.generation).await;
            }
        }
        result
    }

    /// Tear down the connection if it is still the one that failed.
    async fn invalidate(&self, generation: u64) {
        let failed = {
            let mut slot = self.slot();
            if slot.as_ref().is_some_and(|link| link.generation == generation) {
                self.set_state(ConnectionState::Disconnected);
                slot.take()
            } else {
                None
            }
        };
        if let Some(link) = failed {
            link.shutdown().await;
        }
    }

    /// Close the connection, abandon any handshake in progress and fail
    /// everything still waiting. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let link = {
            let mut slot = self.slot();
            self.disconnects.send_modify(|epoch| *epoch += 1);
            self.set_state(ConnectionState::Disconnected);
            slot.take()
        };
        if let Some(link) = link {
            tracing::info!(generation = link.generation, "Disconnecting from gateway");
            link.shutdown().await;
        }
    }
}

fn disconnected() -> Error {
    Error::Closed("disconnected".to_string())
}

fn now_ms() -> Result<u64, Error> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| Error::Handshake(format!("system clock before epoch: {e}")))
}
