use std::collections::hash_map::Entry;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::messaging::envelope::{DispatchTag, ReservedTag};

/// Maps dispatch tags to handlers, case-insensitively. Client and server share this
///  structure; they differ only in their handler type and in which [ReservedTag]s
///  they refuse to hand over to user code.
///
/// Reserved tags are rejected at registration time, not at dispatch time, because a
///  rejected registration indicates a defect in the embedding application.
pub struct HandlerRegistry<H: ?Sized> {
    handlers: RwLock<FxHashMap<String, Arc<H>>>,
    reserved: Vec<ReservedTag>,
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new(reserved: Vec<ReservedTag>) -> HandlerRegistry<H> {
        HandlerRegistry {
            handlers: Default::default(),
            reserved,
        }
    }

    pub async fn register(&self, tag: &str, handler: Arc<H>) -> anyhow::Result<()> {
        let tag = DispatchTag::parse(tag)?;
        if let DispatchTag::Reserved(r) = &tag {
            if self.reserved.contains(r) {
                bail!("tag {:?} is reserved and cannot be registered", r.as_str());
            }
        }

        match self.handlers.write().await.entry(tag.normalized()) {
            Entry::Occupied(_) => {
                Err(anyhow!("a handler is already registered for tag {:?}", tag))
            }
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub async fn lookup(&self, tag: &DispatchTag) -> Option<Arc<H>> {
        self.handlers.read().await
            .get(&tag.normalized())
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn registry(reserved: Vec<ReservedTag>) -> HandlerRegistry<u32> {
        HandlerRegistry::new(reserved)
    }

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let registry = registry(vec![]);
        registry.register("Foo", Arc::new(1)).await.unwrap();

        let tag = DispatchTag::parse("FOO").unwrap();
        assert_eq!(registry.lookup(&tag).await.as_deref(), Some(&1));

        let tag = DispatchTag::parse("foo").unwrap();
        assert_eq!(registry.lookup(&tag).await.as_deref(), Some(&1));
    }

    #[rstest]
    #[case::canonical("PING")]
    #[case::lower("ping")]
    #[case::mixed("pInG")]
    #[tokio::test]
    async fn test_reserved_tag_rejected_without_mutation(#[case] spelling: &str) {
        let registry = registry(vec![ReservedTag::Ping]);

        assert!(registry.register(spelling, Arc::new(1)).await.is_err());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_non_reserved_builtin_spelling_is_registrable() {
        // a tag that is reserved on the *other* side stays available here
        let registry = registry(vec![ReservedTag::Ping]);

        registry.register("PONG", Arc::new(1)).await.unwrap();
        let tag = DispatchTag::parse("pong").unwrap();
        assert_eq!(registry.lookup(&tag).await.as_deref(), Some(&1));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected_without_mutation() {
        let registry = registry(vec![]);
        registry.register("foo", Arc::new(1)).await.unwrap();

        assert!(registry.register("FOO", Arc::new(2)).await.is_err());

        let tag = DispatchTag::parse("foo").unwrap();
        assert_eq!(registry.lookup(&tag).await.as_deref(), Some(&1));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_tag_rejected() {
        let registry = registry(vec![]);
        assert!(registry.register("", Arc::new(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_tag_resolves_to_none() {
        let registry = registry(vec![]);
        let tag = DispatchTag::parse("nobody-home").unwrap();
        assert!(registry.lookup(&tag).await.is_none());
    }
}
