pub mod events;
pub mod registry;

pub(crate) mod keepalive;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::client_data::{ClientData, DefaultClientData};
use crate::config::ServerConfig;
use crate::messaging::envelope::{DispatchTag, Envelope, ReservedTag};
use crate::messaging::registry::HandlerRegistry;
use crate::messaging::wire;
use crate::server::events::ServerEvent;
use crate::server::registry::{ClientRegistry, RemoteClient};

/// A server-side handler for one user-defined dispatch tag. Each dispatched envelope
///  runs on its own task; the inbound stream is closed as soon as the handler returns
///  (request/response-per-connection), so a synchronous reply must be written to
///  `stream` before returning - see [send_reply].
#[async_trait]
pub trait ServerHandler<D: ClientData>: Send + Sync + 'static {
    async fn handle(&self, server: Server<D>, envelope: Envelope, stream: &mut TcpStream);
}

/// Convenience for handlers that answer the triggering request synchronously: builds
///  an envelope and writes it back over the inbound stream the request arrived on.
pub async fn send_reply(stream: &mut TcpStream, tag: &str, args: Vec<Value>) -> anyhow::Result<()> {
    let envelope = Envelope::new(tag, args)?;
    wire::write_envelope(stream, &envelope).await
}

/// The server side of the framework: accepts connections, reads exactly one envelope
///  per connection, and dispatches it to a built-in or user-registered handler on a
///  fresh task. Registered clients are tracked in a [ClientRegistry] guarded by a
///  single lock; all mutation of that registry goes through this type.
///
/// `Server` is a cheap handle; clones share all state.
pub struct Server<D: ClientData = DefaultClientData> {
    shared: Arc<ServerShared<D>>,
}

impl<D: ClientData> Clone for Server<D> {
    fn clone(&self) -> Self {
        Server { shared: self.shared.clone() }
    }
}

struct ServerShared<D: ClientData> {
    config: ServerConfig,
    handlers: HandlerRegistry<dyn ServerHandler<D>>,
    clients: Mutex<ClientRegistry<D>>,
    last_ping_nanos: AtomicU64,
    stopped: AtomicBool,
    local_addr: StdMutex<Option<SocketAddr>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ServerEvent>,
}

impl<D: ClientData> Server<D> {
    pub fn new(config: ServerConfig) -> Server<D> {
        let mut reserved = vec![
            ReservedTag::RegisterClient,
            ReservedTag::Logout,
            ReservedTag::SetClientTags,
            ReservedTag::AddClientTags,
            ReservedTag::RemoveClientTags,
        ];
        if config.keep_alive {
            reserved.push(ReservedTag::Pong);
        }

        let (events, _) = broadcast::channel(256);

        Server {
            shared: Arc::new(ServerShared {
                config,
                handlers: HandlerRegistry::new(reserved),
                clients: Mutex::new(ClientRegistry::new()),
                last_ping_nanos: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                local_addr: StdMutex::new(None),
                tasks: StdMutex::new(Vec::new()),
                events,
            }),
        }
    }

    /// Register a handler for a user-defined dispatch tag. Fails on reserved and on
    ///  already-registered tags, leaving the registry untouched.
    pub async fn register_response(&self, tag: &str, handler: Arc<dyn ServerHandler<D>>) -> anyhow::Result<()> {
        self.shared.handlers.register(tag, handler).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Like [Self::try_start], but a bind failure is only logged: the server is left
    ///  non-functional and the process keeps running.
    pub async fn start(&self) {
        if let Err(e) = self.try_start().await {
            error!("error starting server: {:#}", e);
        }
    }

    /// Open the listening socket and spawn the accept loop, plus the keepalive task
    ///  if configured.
    pub async fn try_start(&self) -> anyhow::Result<()> {
        self.shared.stopped.store(false, Ordering::SeqCst);

        info!("attempting to open listening socket on {}", self.shared.config.bind_addr);
        let listener = TcpListener::bind(self.shared.config.bind_addr).await
            .context("opening listening socket")?;
        let local_addr = listener.local_addr()?;
        if let Ok(mut slot) = self.shared.local_addr.lock() {
            *slot = Some(local_addr);
        }

        let mut handles = vec![tokio::spawn(self.clone().accept_loop(listener))];
        if self.shared.config.keep_alive {
            info!("starting keepalive task");
            handles.push(tokio::spawn(keepalive::run(self.clone())));
        }
        if let Ok(mut tasks) = self.shared.tasks.lock() {
            tasks.extend(handles);
        }

        info!("server listening on {}", local_addr);
        Ok(())
    }

    /// The address actually bound, once [Self::try_start] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.lock().ok().and_then(|slot| *slot)
    }

    /// Stop accepting connections and tear down the owning tasks. In-flight handler
    ///  tasks are not cancelled; a read blocked on the listening socket surfaces the
    ///  teardown as a transport error.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Ok(mut tasks) = self.shared.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("server stopped");
    }

    async fn accept_loop(self, listener: TcpListener) {
        while !self.shared.stopped.load(Ordering::SeqCst) {
            let result = async {
                let (mut stream, _) = listener.accept().await?;
                let envelope = wire::read_envelope(&mut stream).await?;
                self.dispatch(envelope, stream).await;
                anyhow::Ok(())
            }
            .await;

            // the loop's exit is governed by the stopped flag, not by this branch
            if let Err(e) = result {
                error!("server listener failed: {:#}", e);
                self.emit(ServerEvent::ServerStopped);
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope, stream: TcpStream) {
        let tag = envelope.tag().clone();

        if self.shared.config.log_requests && tag != DispatchTag::Reserved(ReservedTag::Pong) {
            info!("responding to client {:?} request {:?}", envelope.sender(), tag);
        }

        let builtin = match &tag {
            DispatchTag::Reserved(r) => self.builtin(*r),
            DispatchTag::Custom(_) => None,
        };
        if let Some(kind) = builtin {
            let server = self.clone();
            tokio::spawn(async move {
                server.run_builtin(kind, envelope, stream).await;
            });
            return;
        }

        match self.shared.handlers.lookup(&tag).await {
            Some(handler) => {
                let server = self.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    handler.handle(server, envelope, &mut stream).await;
                    // stream drops here: request/response-per-connection
                });
            }
            None => {
                debug!("received request with tag {:?} for which there is no handler - ignoring", tag);
            }
        }
    }

    /// Which reserved tags this server actually treats as built-ins. PING is only ever
    ///  sent by the server, and PONG is only claimed while keepalive is enabled - with
    ///  keepalive off it behaves like a user tag.
    fn builtin(&self, tag: ReservedTag) -> Option<ReservedTag> {
        match tag {
            ReservedTag::Ping => None,
            ReservedTag::Pong if !self.shared.config.keep_alive => None,
            other => Some(other),
        }
    }

    async fn run_builtin(self, kind: ReservedTag, envelope: Envelope, stream: TcpStream) {
        match kind {
            // registration retains the stream for later server-initiated sends
            ReservedTag::RegisterClient => self.on_register(envelope, stream).await,
            ReservedTag::Logout => self.on_logout(&envelope).await,
            ReservedTag::SetClientTags | ReservedTag::AddClientTags | ReservedTag::RemoveClientTags => {
                self.on_client_tags(kind, &envelope).await
            }
            ReservedTag::Pong => self.on_pong(&envelope).await,
            ReservedTag::Ping => {}
        }
    }

    async fn on_register(&self, envelope: Envelope, stream: TcpStream) {
        let Some(client_id) = envelope.sender() else {
            warn!("REGISTER_CLIENT without sender identity - ignoring");
            return;
        };
        let client_id = client_id.to_string();

        let mut data = D::default();
        data.set_client_id(client_id.clone());
        self.shared.clients.lock().await
            .register(RemoteClient::new(client_id.clone(), stream, data));

        info!("registered client {}", client_id);
        self.emit(ServerEvent::ClientRegistered { client_id });
    }

    async fn on_logout(&self, envelope: &Envelope) {
        let Some(client_id) = envelope.sender() else {
            warn!("LOGOUT without sender identity - ignoring");
            return;
        };

        let removed = {
            let mut clients = self.shared.clients.lock().await;
            if clients.contains(client_id) {
                info!("logging out client {}", client_id);
                clients.mark_for_removal(client_id);
                self.emit(ServerEvent::ClientLogout { client_id: client_id.to_string() });
            }
            clients.sweep()
        };
        for client in removed {
            self.emit(ServerEvent::ClientRemoved { client_id: client.id().to_string() });
        }
    }

    async fn on_client_tags(&self, kind: ReservedTag, envelope: &Envelope) {
        let Some(client_id) = envelope.sender() else {
            warn!("client tag operation without sender identity - ignoring");
            return;
        };
        let labels = envelope.string_args();

        let event = {
            let mut clients = self.shared.clients.lock().await;
            let Some(client) = clients.find_mut(client_id) else {
                warn!("client tag operation for unregistered client {} - ignoring", client_id);
                return;
            };
            let client_id = client.id().to_string();
            match kind {
                ReservedTag::SetClientTags => {
                    info!("setting client tags {:?} for client {}", labels, client_id);
                    client.data_mut().set_tags(labels.clone());
                    ServerEvent::TagsSet { client_id, tags: labels }
                }
                ReservedTag::AddClientTags => {
                    info!("adding client tags {:?} for client {}", labels, client_id);
                    client.data_mut().add_tags(&labels);
                    ServerEvent::TagsAdded { client_id, tags: labels }
                }
                ReservedTag::RemoveClientTags => {
                    info!("removing client tags {:?} for client {}", labels, client_id);
                    client.data_mut().remove_tags(&labels);
                    ServerEvent::TagsRemoved { client_id, tags: labels }
                }
                _ => return,
            }
        };
        self.emit(event);
    }

    async fn on_pong(&self, envelope: &Envelope) {
        let Some(client_id) = envelope.sender() else {
            warn!("PONG without sender identity - ignoring");
            return;
        };
        let echoed = match envelope.arg_u64(0) {
            Ok(nanos) => nanos,
            Err(e) => {
                warn!("malformed PONG from client {}: {:#}", client_id, e);
                return;
            }
        };

        let last_ping = self.shared.last_ping_nanos.load(Ordering::SeqCst);
        let rtt_millis = last_ping.abs_diff(echoed) / 1_000_000;

        let mut clients = self.shared.clients.lock().await;
        if let Some(client) = clients.find_mut(client_id) {
            client.data_mut().set_ping_millis(rtt_millis);
            trace!("rtt for client {}: {}ms", client_id, rtt_millis);
        }
    }

    /// Send an envelope to a single registered client over its retained stream. On
    ///  failure the client is queued for removal, never removed inline.
    pub async fn send_message(&self, client_id: &str, envelope: &Envelope) {
        let mut clients = self.shared.clients.lock().await;
        let failure = match clients.find_mut(client_id) {
            None => {
                warn!("send to unregistered client {} - ignoring", client_id);
                return;
            }
            Some(client) => client.send(envelope).await.err(),
        };
        if let Some(e) = failure {
            error!("error sending message to client {}: {:#}", client_id, e);
            clients.mark_for_removal(client_id);
        }
    }

    /// Send to every registered client. Returns the number of clients that were sent
    ///  to successfully this round; failed clients are swept out before returning.
    pub async fn broadcast_message(&self, envelope: &Envelope) -> usize {
        let mut clients = self.shared.clients.lock().await;
        let mut attempted = 0usize;
        let mut failed = Vec::new();
        for client in clients.live() {
            attempted += 1;
            if let Err(e) = client.send(envelope).await {
                error!("error sending message to client {}: {:#}", client.id(), e);
                failed.push(client.id().to_string());
            }
        }
        self.finish_send_round(&mut clients, attempted, failed)
    }

    /// Send to exactly the set of clients whose label set intersects `labels`; a client
    ///  matching several labels is sent to once.
    pub async fn send_message_to_tagged_clients(&self, envelope: &Envelope, labels: &[&str]) -> usize {
        let labels: Vec<String> = labels.iter().map(|s| s.to_string()).collect();

        let mut clients = self.shared.clients.lock().await;
        let selected = clients.tagged_indices(&labels);
        let mut attempted = 0usize;
        let mut failed = Vec::new();
        for idx in selected {
            let client = &clients.live()[idx];
            attempted += 1;
            if let Err(e) = client.send(envelope).await {
                error!("error sending message to client {}: {:#}", client.id(), e);
                failed.push(client.id().to_string());
            }
        }
        self.finish_send_round(&mut clients, attempted, failed)
    }

    fn finish_send_round(&self, clients: &mut ClientRegistry<D>, attempted: usize, failed: Vec<String>) -> usize {
        for client_id in &failed {
            clients.mark_for_removal(client_id);
        }

        let pending = clients.pending_removals();
        let received = attempted.saturating_sub(pending);
        if pending > 0 {
            for removed in clients.sweep() {
                self.emit(ServerEvent::ClientRemoved { client_id: removed.id().to_string() });
            }
        }
        received
    }

    /// Sweep everything queued for removal out of the live registry. Must not be
    ///  called from inside an iteration over the live list.
    pub async fn cleanup_clients(&self) {
        debug!("cleaning up clients");
        let removed = self.shared.clients.lock().await.sweep();
        for client in removed {
            self.emit(ServerEvent::ClientRemoved { client_id: client.id().to_string() });
        }
    }

    pub async fn set_client_tags(&self, client_id: &str, tags: Vec<String>) {
        let event = {
            let mut clients = self.shared.clients.lock().await;
            let Some(client) = clients.find_mut(client_id) else {
                warn!("setting tags for unregistered client {} - ignoring", client_id);
                return;
            };
            client.data_mut().set_tags(tags.clone());
            ServerEvent::TagsSet { client_id: client.id().to_string(), tags }
        };
        self.emit(event);
    }

    pub async fn num_connected_clients(&self) -> usize {
        self.shared.clients.lock().await.len()
    }

    pub async fn is_client_connected(&self, client_id: &str) -> bool {
        self.shared.clients.lock().await.contains(client_id)
    }

    /// Snapshot of one client's data payload.
    pub async fn client_data(&self, client_id: &str) -> Option<D> {
        self.shared.clients.lock().await
            .find_mut(client_id)
            .map(|c| c.data().clone())
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.shared.events.send(event);
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use super::*;

    fn server(keep_alive: bool) -> Server {
        let mut config = ServerConfig::new(SocketAddr::from_str("127.0.0.1:0").unwrap());
        config.keep_alive = keep_alive;
        Server::new(config)
    }

    struct NopHandler;
    #[async_trait]
    impl ServerHandler<DefaultClientData> for NopHandler {
        async fn handle(&self, _server: Server, _envelope: Envelope, _stream: &mut TcpStream) {}
    }

    #[tokio::test]
    async fn test_reserved_tags_rejected_on_registration() {
        let server = server(true);
        for tag in ["REGISTER_CLIENT", "logout", "Set_Client_Tags", "ADD_CLIENT_TAGS", "remove_client_tags", "PONG"] {
            assert!(server.register_response(tag, Arc::new(NopHandler)).await.is_err(), "tag {}", tag);
        }
        assert_eq!(server.shared.handlers.len().await, 0);
    }

    #[tokio::test]
    async fn test_pong_is_registrable_without_keepalive() {
        let server = server(false);
        server.register_response("PONG", Arc::new(NopHandler)).await.unwrap();
        assert!(server.builtin(ReservedTag::Pong).is_none());
    }

    #[tokio::test]
    async fn test_ping_is_never_a_server_builtin() {
        let server = server(true);
        assert!(server.builtin(ReservedTag::Ping).is_none());
        assert!(server.builtin(ReservedTag::Pong).is_some());
        assert!(server.builtin(ReservedTag::RegisterClient).is_some());
    }

    #[tokio::test]
    async fn test_broadcast_to_zero_clients_returns_zero() {
        let server = server(true);
        let envelope = Envelope::new("anything", vec![]).unwrap();
        assert_eq!(server.broadcast_message(&envelope).await, 0);
    }
}
