use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::client_data::ClientData;
use crate::messaging::envelope::Envelope;
use crate::messaging::wire;

/// Server-side record of one registered client: its identity, the transport stream
///  retained from its registration, and its client-data payload.
///
/// The stream is only ever written to after registration - the client reads
///  server-initiated messages from its end of this very connection.
pub struct RemoteClient<D> {
    id: String,
    stream: Arc<Mutex<TcpStream>>,
    data: D,
}

impl<D: ClientData> RemoteClient<D> {
    pub fn new(id: String, stream: TcpStream, data: D) -> RemoteClient<D> {
        RemoteClient {
            id,
            stream: Arc::new(Mutex::new(stream)),
            data,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub async fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let mut stream = self.stream.lock().await;
        wire::write_envelope(&mut *stream, envelope).await
    }
}

impl<D> Debug for RemoteClient<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteClient{{{}}}", self.id)
    }
}

/// The live client list and its deferred-removal queue, behind one lock (the caller
///  holds the surrounding mutex for the full critical section of every operation).
///
/// Removal is two-phase by design: [Self::mark_for_removal] only queues, and
///  [Self::sweep] is the single place where the live list shrinks. This keeps a send
///  failure discovered while iterating the live list from mutating that same list
///  mid-iteration. `sweep` must never be called from inside such an iteration.
pub struct ClientRegistry<D> {
    live: Vec<RemoteClient<D>>,
    cleanup_queue: Vec<String>,
}

impl<D: ClientData> ClientRegistry<D> {
    pub fn new() -> ClientRegistry<D> {
        ClientRegistry {
            live: Vec::new(),
            cleanup_queue: Vec::new(),
        }
    }

    pub fn register(&mut self, client: RemoteClient<D>) {
        self.live.push(client);
    }

    pub fn live(&self) -> &[RemoteClient<D>] {
        &self.live
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.live.iter().any(|c| c.id().eq_ignore_ascii_case(client_id))
    }

    pub fn find_mut(&mut self, client_id: &str) -> Option<&mut RemoteClient<D>> {
        self.live.iter_mut().find(|c| c.id().eq_ignore_ascii_case(client_id))
    }

    /// Phase one of removal: queue the client. The live list is untouched.
    pub fn mark_for_removal(&mut self, client_id: &str) {
        self.cleanup_queue.push(client_id.to_string());
    }

    pub fn pending_removals(&self) -> usize {
        self.cleanup_queue.len()
    }

    /// Phase two of removal: drop every queued client from the live list and empty
    ///  the queue. Returns the removed records so the caller can publish events.
    pub fn sweep(&mut self) -> Vec<RemoteClient<D>> {
        let mut removed = Vec::new();
        for id in std::mem::take(&mut self.cleanup_queue) {
            while let Some(idx) = self.live.iter().position(|c| c.id().eq_ignore_ascii_case(&id)) {
                removed.push(self.live.remove(idx));
            }
        }
        removed
    }

    pub fn snapshot_data(&self) -> Vec<D> {
        self.live.iter().map(|c| c.data().clone()).collect()
    }

    /// Indices of the clients whose label set intersects `labels`. Each client is
    ///  selected at most once, even if it carries several of the requested labels.
    pub fn tagged_indices(&self, labels: &[String]) -> Vec<usize> {
        self.live.iter().enumerate()
            .filter(|(_, c)| c.data().tags().iter().any(|t| labels.contains(t)))
            .map(|(idx, _)| idx)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::client_data::DefaultClientData;

    use super::*;

    async fn remote(id: &str, tags: &[&str]) -> RemoteClient<DefaultClientData> {
        // a socket pair purely to satisfy the record's transport handle
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let _accepted = listener.accept().await.unwrap();
        let stream = connect.await.unwrap();

        let mut data = DefaultClientData::default();
        data.set_client_id(id.to_string());
        data.set_tags(tags.iter().map(|s| s.to_string()).collect());
        RemoteClient::new(id.to_string(), stream, data)
    }

    #[tokio::test]
    async fn test_mark_does_not_touch_live_list() {
        let mut registry = ClientRegistry::new();
        registry.register(remote("c1", &[]).await);

        registry.mark_for_removal("c1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pending_removals(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_marked_and_clears_queue() {
        let mut registry = ClientRegistry::new();
        registry.register(remote("c1", &[]).await);
        registry.register(remote("c2", &[]).await);

        registry.mark_for_removal("c1");
        let removed = registry.sweep();

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), "c1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pending_removals(), 0);
        assert!(registry.contains("c2"));
        assert!(!registry.contains("c1"));
    }

    #[tokio::test]
    async fn test_sweep_of_unknown_id_is_a_no_op() {
        let mut registry = ClientRegistry::new();
        registry.register(remote("c1", &[]).await);

        registry.mark_for_removal("ghost");
        assert!(registry.sweep().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_lookups_are_case_insensitive() {
        let mut registry = ClientRegistry::new();
        registry.register(remote("Alice", &[]).await);

        assert!(registry.contains("alice"));
        assert!(registry.find_mut("ALICE").is_some());
    }

    #[rstest]
    #[case::both_labels_counted_once(vec!["a", "b"], vec![0, 1])]
    #[case::single_label(vec!["b"], vec![1])]
    #[case::no_match(vec!["z"], vec![])]
    #[tokio::test]
    async fn test_tagged_indices_selects_each_client_at_most_once(
        #[case] labels: Vec<&str>,
        #[case] expected: Vec<usize>,
    ) {
        let mut registry = ClientRegistry::new();
        // c1 carries both labels and must still be selected only once
        registry.register(remote("c1", &["a", "b"]).await);
        registry.register(remote("c2", &["b"]).await);
        registry.register(remote("c3", &["c"]).await);

        let labels: Vec<String> = labels.into_iter().map(|s| s.to_string()).collect();
        assert_eq!(registry.tagged_indices(&labels), expected);
    }
}
