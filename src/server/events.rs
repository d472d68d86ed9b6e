/// Lifecycle notifications published by the server on a broadcast channel. Consumers
///  subscribe via [crate::server::Server::subscribe]; events replace overridable hook
///  methods as the extension mechanism.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerEvent {
    ClientRegistered { client_id: String },
    /// A client was swept out of the live registry, after LOGOUT or a failed send.
    ClientRemoved { client_id: String },
    ClientLogout { client_id: String },
    /// The accept loop hit a transport failure (including the listening socket being
    ///  closed by `stop`).
    ServerStopped,
    /// A keepalive probe was broadcast.
    Ping,
    TagsSet { client_id: String, tags: Vec<String> },
    TagsAdded { client_id: String, tags: Vec<String> },
    TagsRemoved { client_id: String, tags: Vec<String> },
}
