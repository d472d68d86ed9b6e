/// Lifecycle notifications published by the client on a broadcast channel. Consumers
///  subscribe via [crate::client::Client::subscribe].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientEvent {
    /// A login (initial or after repair) completed: connected and registered.
    LoggedIn,
    /// Connect, register or read failed; the connection manager will repair.
    ConnectionProblem,
    /// The listener is about to block on a healthy connection.
    ConnectionGood,
    /// A keepalive probe arrived and the local client-data cache was refreshed.
    ClientDataUpdated,
}
