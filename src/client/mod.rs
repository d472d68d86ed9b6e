pub mod events;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};

use crate::client::events::ClientEvent;
use crate::client_data::{ClientData, DefaultClientData, LocalClientData};
use crate::config::ClientConfig;
use crate::messaging::envelope::{DispatchTag, Envelope, ReservedTag};
use crate::messaging::registry::HandlerRegistry;
use crate::messaging::wire;
use crate::util::epoch_nanos;

/// A client-side handler for one user-defined dispatch tag. Each dispatched envelope
///  runs on its own task, concurrently with the listener's next read. Handlers that
///  want to answer do so through [Client::send_message], which opens a fresh
///  connection to the server.
#[async_trait]
pub trait ClientHandler<D: ClientData>: Send + Sync + 'static {
    async fn handle(&self, client: Client<D>, envelope: Envelope);
}

/// State of the one persistent connection a client holds towards the server. Owned
///  exclusively by the connection manager; nothing else mutates it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Repairing = 3,
}

/// The client side of the framework: maintains one persistent connection to the
///  server (established by `login`, watched and repaired by the listener loop with
///  linear backoff) and opens a fresh, independent connection for every outbound
///  message.
///
/// `Client` is a cheap handle; clones share all state.
pub struct Client<D: ClientData = DefaultClientData> {
    shared: Arc<ClientShared<D>>,
}

impl<D: ClientData> Clone for Client<D> {
    fn clone(&self) -> Self {
        Client { shared: self.shared.clone() }
    }
}

struct ClientShared<D: ClientData> {
    config: ClientConfig,
    handlers: HandlerRegistry<dyn ClientHandler<D>>,
    local_data: RwLock<LocalClientData<D>>,
    state: AtomicU8,
    /// freshly logged-in streams are parked here until the listener picks them up
    socket: Mutex<Option<TcpStream>>,
    timeout_millis: AtomicU64,
    errors: AtomicU32,
    stopped: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl<D: ClientData> Client<D> {
    pub fn new(config: ClientConfig) -> Client<D> {
        let (events, _) = broadcast::channel(256);
        let timeout_millis = config.connect_timeout.as_millis() as u64;

        Client {
            shared: Arc::new(ClientShared {
                config,
                handlers: HandlerRegistry::new(vec![ReservedTag::Ping]),
                local_data: RwLock::new(LocalClientData::default()),
                state: AtomicU8::new(ConnectionState::Disconnected.into()),
                socket: Mutex::new(None),
                timeout_millis: AtomicU64::new(timeout_millis),
                errors: AtomicU32::new(0),
                stopped: AtomicBool::new(false),
                listener: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.config.client_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Register a handler for a user-defined dispatch tag. PING is reserved on the
    ///  client; registering it (or a tag twice) fails, leaving the registry untouched.
    pub async fn register_response(&self, tag: &str, handler: Arc<dyn ClientHandler<D>>) -> anyhow::Result<()> {
        self.shared.handlers.register(tag, handler).await
    }

    /// Connect, register with the server, and start the listener.
    pub async fn start(&self) {
        self.shared.stopped.store(false, Ordering::SeqCst);
        self.login().await;
        self.start_listener().await;
    }

    /// Stop the client: best-effort LOGOUT, then tear the listener and socket down.
    ///  I/O failures on this path are deliberately swallowed.
    pub async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);

        info!("disconnecting from {}", self.shared.config.server_addr);
        let mut logout = Envelope::reserved(ReservedTag::Logout, vec![json!(self.client_id())]);
        logout.sign(self.client_id());
        if let Err(e) = self.try_send_message(logout, Duration::from_millis(100), false).await {
            debug!("logout on shutdown failed: {:#}", e);
        }

        if let Some(listener) = self.shared.listener.lock().await.take() {
            listener.abort();
        }
        *self.shared.socket.lock().await = None;
        self.set_state(ConnectionState::Disconnected);
        info!("client stopped");
    }

    /// Open the persistent connection and register with the server. Failures are
    ///  logged and leave the client disconnected - retrying is the listener's job,
    ///  not this method's.
    async fn login(&self) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.state() == ConnectionState::Connected {
            // invariant violation in the embedding application, not an I/O condition
            error!("login requested while already connected - ignoring");
            return;
        }

        self.set_state(ConnectionState::Connecting);
        info!("connecting to {}", self.shared.config.server_addr);

        let connect_timeout = Duration::from_millis(self.shared.timeout_millis.load(Ordering::SeqCst));
        let connected = timeout(connect_timeout, TcpStream::connect(self.shared.config.server_addr)).await
            .map_err(anyhow::Error::from)
            .and_then(|r| r.map_err(anyhow::Error::from));
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                error!("connection failed: {:#}", e);
                self.set_state(ConnectionState::Disconnected);
                self.emit(ClientEvent::ConnectionProblem);
                return;
            }
        };

        let mut register = Envelope::reserved(ReservedTag::RegisterClient, vec![json!(self.client_id())]);
        register.sign(self.client_id());
        if let Err(e) = wire::write_envelope(&mut stream, &register).await {
            error!("login failed: {:#}", e);
            self.set_state(ConnectionState::Disconnected);
            self.emit(ClientEvent::ConnectionProblem);
            return;
        }

        *self.shared.socket.lock().await = Some(stream);
        self.set_state(ConnectionState::Connected);
        info!("logged in as {}", self.client_id());
        self.emit(ClientEvent::LoggedIn);
    }

    /// One repair attempt: bump the error counter, grow the connect timeout by the
    ///  configured increment (linear backoff, capped), force-close the old socket and
    ///  log in again.
    async fn repair_connection(&self) {
        self.shared.errors.fetch_add(1, Ordering::SeqCst);

        let increment = self.shared.config.repair_timeout_increment.as_millis() as u64;
        let max = self.shared.config.max_timeout.as_millis() as u64;
        let current = self.shared.timeout_millis.load(Ordering::SeqCst);
        self.shared.timeout_millis.store((current + increment).min(max), Ordering::SeqCst);

        info!("attempting to repair connection");
        *self.shared.socket.lock().await = None;
        self.set_state(ConnectionState::Repairing);

        self.login().await;
        self.start_listener().await;
    }

    /// Spawn the single listening task if none is alive.
    async fn start_listener(&self) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = self.shared.listener.lock().await;
        if let Some(listener) = slot.as_ref() {
            if !listener.is_finished() {
                return;
            }
        }
        *slot = Some(tokio::spawn(self.clone().listen_loop()));
    }

    fn listen_loop(self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        let mut current: Option<TcpStream> = None;

        while !self.shared.stopped.load(Ordering::SeqCst) {
            if current.is_none() {
                current = self.shared.socket.lock().await.take();
            }
            while current.is_none() && !self.shared.stopped.load(Ordering::SeqCst) {
                self.repair_connection().await;
                current = self.shared.socket.lock().await.take();
                if current.is_some() {
                    break;
                }
                sleep(self.shared.config.repair_retry_delay).await;
            }
            let Some(stream) = current.as_mut() else {
                break;
            };

            self.emit(ClientEvent::ConnectionGood);

            match wire::read_envelope(stream).await {
                Ok(envelope) => {
                    if self.shared.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    self.dispatch(envelope).await;
                }
                Err(e) => {
                    if self.shared.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    error!("connection lost: {:#}", e);
                    self.emit(ClientEvent::ConnectionProblem);
                    current = None;
                    self.repair_connection().await;
                    current = self.shared.socket.lock().await.take();
                }
            }

            self.shared.errors.store(0, Ordering::SeqCst);
        }
        })
    }

    async fn dispatch(&self, envelope: Envelope) {
        if envelope.tag() == &DispatchTag::Reserved(ReservedTag::Ping) {
            let client = self.clone();
            tokio::spawn(async move {
                client.on_ping(envelope).await;
            });
            return;
        }

        match self.shared.handlers.lookup(envelope.tag()).await {
            Some(handler) => {
                let client = self.clone();
                tokio::spawn(async move {
                    handler.handle(client, envelope).await;
                });
            }
            None => {
                debug!("received message with tag {:?} for which there is no handler - ignoring", envelope.tag());
            }
        }
    }

    /// Built-in PING handling: refresh the roster cache and our own RTT from the
    ///  probe's snapshot (if present), then answer with a PONG carrying our current
    ///  clock reading.
    async fn on_ping(&self, envelope: Envelope) {
        if envelope.args().len() > 1 {
            match serde_json::from_value::<Vec<D>>(envelope.args()[1].clone()) {
                Ok(roster) => {
                    let mut local = self.shared.local_data.write().await;
                    for data in &roster {
                        if data.client_id().eq_ignore_ascii_case(self.client_id()) {
                            local.ping_millis = data.ping_millis();
                        }
                    }
                    local.roster = roster;
                }
                Err(e) => {
                    debug!("malformed roster in PING - ignoring it: {:#}", e);
                }
            }
        }
        self.emit(ClientEvent::ClientDataUpdated);

        let pong = Envelope::reserved(ReservedTag::Pong, vec![json!(epoch_nanos())]);
        let send_timeout = Duration::from_millis(self.shared.timeout_millis.load(Ordering::SeqCst));
        self.send_message(pong, send_timeout, false).await;
    }

    /// Send a message over a new, independent connection, signed with this client's
    ///  identity. With `expect_response` the call blocks for exactly one reply
    ///  envelope. Transport failures are logged and yield `None`.
    pub async fn send_message(&self, envelope: Envelope, send_timeout: Duration, expect_response: bool) -> Option<Envelope> {
        match self.try_send_message(envelope, send_timeout, expect_response).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("error while sending message: {:#}", e);
                None
            }
        }
    }

    pub async fn try_send_message(&self, mut envelope: Envelope, send_timeout: Duration, expect_response: bool) -> anyhow::Result<Option<Envelope>> {
        let mut stream = timeout(send_timeout, TcpStream::connect(self.shared.config.server_addr)).await
            .context("connect timed out")?
            .context("connecting for send")?;

        envelope.sign(self.client_id());
        wire::write_envelope(&mut stream, &envelope).await?;

        if expect_response {
            let reply = wire::read_envelope(&mut stream).await
                .context("reading response")?;
            return Ok(Some(reply));
        }
        Ok(None)
    }

    /// Replace this client's labels on the server and in the local cache.
    pub async fn set_tags(&self, tags: Vec<String>) {
        let args = tags.iter().map(|t| json!(t)).collect();
        self.send_label_op(ReservedTag::SetClientTags, args).await;
        self.shared.local_data.write().await.tags = tags;
    }

    /// Add labels to this client's label set on the server and in the local cache.
    pub async fn add_tags(&self, tags: Vec<String>) {
        let args = tags.iter().map(|t| json!(t)).collect();
        self.send_label_op(ReservedTag::AddClientTags, args).await;

        let mut local = self.shared.local_data.write().await;
        for tag in tags {
            if !local.tags.contains(&tag) {
                local.tags.push(tag);
            }
        }
    }

    /// Remove labels from this client's label set on the server and in the local cache.
    pub async fn remove_tags(&self, tags: Vec<String>) {
        let args = tags.iter().map(|t| json!(t)).collect();
        self.send_label_op(ReservedTag::RemoveClientTags, args).await;
        self.shared.local_data.write().await.tags.retain(|t| !tags.contains(t));
    }

    async fn send_label_op(&self, tag: ReservedTag, args: Vec<serde_json::Value>) {
        let envelope = Envelope::reserved(tag, args);
        let send_timeout = Duration::from_millis(self.shared.timeout_millis.load(Ordering::SeqCst));
        self.send_message(envelope, send_timeout, false).await;
    }

    /// Snapshot of the locally cached client data (roster, own RTT, own labels).
    pub async fn local_data(&self) -> LocalClientData<D> {
        self.shared.local_data.read().await.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connected, the listener task is alive, and the error counter is clear.
    pub async fn is_listening(&self) -> bool {
        if !self.is_connected() || self.shared.errors.load(Ordering::SeqCst) != 0 {
            return false;
        }
        match self.shared.listener.lock().await.as_ref() {
            Some(listener) => !listener.is_finished(),
            None => false,
        }
    }

    /// Best-effort probe connection, independent of the persistent one.
    pub async fn is_server_reachable(&self) -> bool {
        matches!(
            timeout(self.shared.config.connect_timeout, TcpStream::connect(self.shared.config.server_addr)).await,
            Ok(Ok(_))
        )
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.shared.state.load(Ordering::SeqCst))
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.state.store(state.into(), Ordering::SeqCst);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.shared.events.send(event);
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    use super::*;

    async fn unreachable_addr() -> SocketAddr {
        // bind-then-drop so the port is very likely refused afterwards
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    fn client(addr: SocketAddr) -> Client {
        let mut config = ClientConfig::new(addr).with_client_id("c1");
        config.connect_timeout = Duration::from_millis(200);
        config.repair_timeout_increment = Duration::from_millis(50);
        config.max_timeout = Duration::from_millis(320);
        Client::new(config)
    }

    #[tokio::test]
    async fn test_repair_applies_linear_backoff() {
        let client = client(unreachable_addr().await);
        // keep repair from spawning the listener or re-logging in
        client.shared.stopped.store(true, Ordering::SeqCst);

        for n in 1..=2u64 {
            client.repair_connection().await;
            assert_eq!(client.shared.errors.load(Ordering::SeqCst), n as u32);
            assert_eq!(client.shared.timeout_millis.load(Ordering::SeqCst), 200 + n * 50);
        }
    }

    #[tokio::test]
    async fn test_repair_backoff_is_capped() {
        let client = client(unreachable_addr().await);
        client.shared.stopped.store(true, Ordering::SeqCst);

        for _ in 0..10 {
            client.repair_connection().await;
        }
        assert_eq!(client.shared.timeout_millis.load(Ordering::SeqCst), 320);
    }

    #[tokio::test]
    async fn test_failed_login_leaves_client_disconnected() {
        let client = client(unreachable_addr().await);
        let mut events = client.subscribe();

        client.login().await;

        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(events.try_recv().unwrap(), ClientEvent::ConnectionProblem);
    }

    #[tokio::test]
    async fn test_register_response_rejects_ping() {
        struct NopHandler;
        #[async_trait]
        impl ClientHandler<DefaultClientData> for NopHandler {
            async fn handle(&self, _client: Client, _envelope: Envelope) {}
        }

        let client = client(unreachable_addr().await);
        assert!(client.register_response("PiNg", Arc::new(NopHandler)).await.is_err());
        assert!(client.register_response("pong", Arc::new(NopHandler)).await.is_ok());
    }

    #[tokio::test]
    async fn test_server_reachability_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = client(addr);
        assert!(client.is_server_reachable().await);

        drop(listener);
        let client = self::client(unreachable_addr().await);
        assert!(!client.is_server_reachable().await);
    }
}
