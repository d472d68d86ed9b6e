use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// Send periodic PING probes to all registered clients and track their RTT.
    pub keep_alive: bool,

    /// Log each dispatched client request. PONG traffic is never logged to keep the
    ///  keepalive exchange from spamming the log.
    pub log_requests: bool,

    pub ping_interval: Duration,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            bind_addr,
            keep_alive: true,
            log_requests: true,
            ping_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,

    /// Should be unique across all clients of one server; defaults to a random UUID.
    pub client_id: String,

    /// Initial timeout for connect operations. Grows by [Self::repair_timeout_increment]
    ///  on every repair attempt, up to [Self::max_timeout].
    pub connect_timeout: Duration,

    pub repair_timeout_increment: Duration,

    /// Delay between repair attempts while the connection stays down.
    pub repair_retry_delay: Duration,

    pub max_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            server_addr,
            client_id: Uuid::new_v4().to_string(),
            connect_timeout: Duration::from_secs(30),
            repair_timeout_increment: Duration::from_secs(1),
            repair_retry_delay: Duration::from_secs(5),
            max_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_client_id(mut self, client_id: &str) -> ClientConfig {
        self.client_id = client_id.to_string();
        self
    }
}
