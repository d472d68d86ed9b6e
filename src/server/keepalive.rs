use std::sync::atomic::Ordering;

use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::client_data::ClientData;
use crate::messaging::envelope::{Envelope, ReservedTag};
use crate::server::events::ServerEvent;
use crate::server::Server;
use crate::util::epoch_nanos;

/// The keepalive task: periodically broadcast a PING probe carrying the current
///  timestamp so every client answers with a PONG and the server can measure the
///  round trip. With more than one client registered, the probe also carries a
///  snapshot of all client-data payloads so every client learns the roster and
///  its own RTT.
pub(crate) async fn run<D: ClientData>(server: Server<D>) {
    let interval = server.shared.config.ping_interval;

    while !server.shared.stopped.load(Ordering::SeqCst) {
        sleep(interval).await;

        let now = epoch_nanos();
        server.shared.last_ping_nanos.store(now, Ordering::SeqCst);

        let envelope = {
            let clients = server.shared.clients.lock().await;
            if clients.len() > 1 {
                match serde_json::to_value(clients.snapshot_data()) {
                    Ok(snapshot) => Envelope::reserved(ReservedTag::Ping, vec![json!(now), snapshot]),
                    Err(e) => {
                        error!("error serializing client-data snapshot: {:#}", e);
                        Envelope::reserved(ReservedTag::Ping, vec![json!(now)])
                    }
                }
            } else {
                Envelope::reserved(ReservedTag::Ping, vec![json!(now)])
            }
        };

        let received = server.broadcast_message(&envelope).await;
        debug!("pinged {} clients", received);
        server.emit(ServerEvent::Ping);
    }
}
