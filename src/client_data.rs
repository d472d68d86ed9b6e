use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The per-client payload the server keeps for every registered client and ships to
///  all clients inside keepalive snapshots. The framework is polymorphic over its
///  concrete shape; implementations add whatever application attributes they need
///  on top of the identity / RTT / label minimum required here.
pub trait ClientData: Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn client_id(&self) -> &str;
    fn set_client_id(&mut self, client_id: String);

    /// Round-trip time of the last keepalive exchange, in milliseconds.
    fn ping_millis(&self) -> u64;
    fn set_ping_millis(&mut self, ping_millis: u64);

    /// User-assigned labels used for addressed broadcast. Distinct from dispatch tags.
    fn tags(&self) -> &[String];
    fn set_tags(&mut self, tags: Vec<String>);

    fn add_tags(&mut self, new: &[String]) {
        let mut tags = self.tags().to_vec();
        for t in new {
            if !tags.contains(t) {
                tags.push(t.clone());
            }
        }
        self.set_tags(tags);
    }

    fn remove_tags(&mut self, gone: &[String]) {
        let tags = self.tags().iter()
            .filter(|t| !gone.contains(t))
            .cloned()
            .collect();
        self.set_tags(tags);
    }
}

/// Stock [ClientData] implementation carrying exactly the required minimum.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DefaultClientData {
    client_id: String,
    ping_millis: u64,
    tags: Vec<String>,
}

impl ClientData for DefaultClientData {
    fn client_id(&self) -> &str {
        &self.client_id
    }
    fn set_client_id(&mut self, client_id: String) {
        self.client_id = client_id;
    }

    fn ping_millis(&self) -> u64 {
        self.ping_millis
    }
    fn set_ping_millis(&mut self, ping_millis: u64) {
        self.ping_millis = ping_millis;
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }
    fn set_tags(&mut self, tags: Vec<String>) {
        self.tags = tags;
    }
}

/// Client-side cache of what the server last told us: the roster snapshot from the
///  most recent keepalive, our own measured RTT, and the labels we asked the server
///  to file us under.
#[derive(Clone, Debug, Default)]
pub struct LocalClientData<D> {
    pub roster: Vec<D>,
    pub ping_millis: u64,
    pub tags: Vec<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn tagged(tags: &[&str]) -> DefaultClientData {
        let mut data = DefaultClientData::default();
        data.set_tags(tags.iter().map(|s| s.to_string()).collect());
        data
    }

    #[test]
    fn test_add_tags_deduplicates() {
        let mut data = tagged(&["a", "b"]);
        data.add_tags(&["b".to_string(), "c".to_string()]);
        assert_eq!(data.tags(), &["a", "b", "c"]);
    }

    #[test]
    fn test_remove_tags_removes_named_labels() {
        let mut data = tagged(&["a", "b", "c"]);
        data.remove_tags(&["b".to_string(), "x".to_string()]);
        assert_eq!(data.tags(), &["a", "c"]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut data = tagged(&["ops"]);
        data.set_client_id("c1".to_string());
        data.set_ping_millis(12);

        let serialized = serde_json::to_string(&data).unwrap();
        let actual: DefaultClientData = serde_json::from_str(&serialized).unwrap();
        assert_eq!(actual, data);
    }
}
