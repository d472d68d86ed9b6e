use std::time::{SystemTime, UNIX_EPOCH};

use tracing::error;

/// High-resolution wall clock reading, used for the keepalive round-trip
///  measurement. Both sides of a PING/PONG exchange sample this clock.
pub fn epoch_nanos() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as u64,
        Err(e) => {
            error!("system clock is before the Unix epoch - returning 0: {}", e);
            0
        }
    }
}
