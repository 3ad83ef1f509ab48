//! Outbound sessions kept open for reuse, keyed by destination.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::service::SessionHandle;
use crate::session::SessionId;

/// Open sessions by key, with at most one connect in flight per key.
pub struct SessionCache<K> {
    links: DashMap<K, SessionHandle>,
    opening: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for SessionCache<K> {
    fn default() -> Self {
        Self {
            links: DashMap::new(),
            opening: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> SessionCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn open_link(&self, key: &K) -> Option<SessionHandle> {
        self.links
            .get(key)
            .map(|link| link.clone())
            .filter(|link| !link.is_closed())
    }

    /// The open session for `key`, or the one `open` establishes.
    ///
    /// Callers racing on the same key wait for a single `open`; a failed
    /// open leaves the key empty for the next caller.
    pub async fn get_or_open<F, Fut>(&self, key: K, open: F) -> Result<SessionHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SessionHandle>>,
    {
        if let Some(link) = self.open_link(&key) {
            return Ok(link);
        }

        let gate = self.opening.entry(key.clone()).or_default().clone();
        let _opening = gate.lock().await;
        if let Some(link) = self.open_link(&key) {
            return Ok(link);
        }

        let link = open().await?;
        self.links.insert(key, link.clone());
        Ok(link)
    }

    /// The cached session with id `id`, and the key it is cached under.
    pub fn find(&self, id: SessionId) -> Option<(K, SessionHandle)> {
        self.links
            .iter()
            .find(|entry| entry.value().id() == id)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    /// Forget `key` only while it still maps to session `id`.
    pub fn evict(&self, key: &K, id: SessionId) -> bool {
        self.links.remove_if(key, |_, link| link.id() == id).is_some()
    }

    pub fn open_count(&self) -> usize {
        self.links.iter().filter(|link| !link.is_closed()).count()
    }

    /// Empty the cache, handing back everything it held.
    pub fn drain(&self) -> Vec<SessionHandle> {
        let links = self.links.iter().map(|e| e.value().clone()).collect();
        self.links.clear();
        links
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ZerolinkError;
    use crate::peer::PeerId;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn handle() -> SessionHandle {
        SessionHandle::new(
            SessionId::new_random(),
            PeerId::new_random(),
            Box::new(tokio::io::sink()),
            1024,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_callers_share_one_session() {
        let cache = Arc::new(SessionCache::<&'static str>::new());
        let opened = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let (cache, opened) = (cache.clone(), opened.clone());
                tokio::spawn(async move {
                    cache
                        .get_or_open("peer", || async {
                            opened.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(handle())
                        })
                        .await
                        .unwrap()
                        .id()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap());
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(cache.open_count(), 1);
    }

    #[tokio::test]
    async fn closed_or_failed_links_are_reopened() {
        let cache = SessionCache::<u8>::new();

        let err = cache
            .get_or_open(1, || async { Err(ZerolinkError::NoRelay) })
            .await
            .unwrap_err();
        assert!(matches!(err, ZerolinkError::NoRelay));
        assert_eq!(cache.open_count(), 0);

        let first = cache.get_or_open(1, || async { Ok(handle()) }).await.unwrap();
        first.close().await.unwrap();
        let second = cache.get_or_open(1, || async { Ok(handle()) }).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(cache.open_count(), 1);
    }

    #[tokio::test]
    async fn evict_only_removes_the_session_it_names() {
        let cache = SessionCache::<u8>::new();
        let a = cache.get_or_open(1, || async { Ok(handle()) }).await.unwrap();
        let b = cache.get_or_open(2, || async { Ok(handle()) }).await.unwrap();

        let (key, found) = cache.find(b.id()).unwrap();
        assert_eq!(key, 2);
        assert_eq!(found.id(), b.id());

        assert!(!cache.evict(&1, b.id()));
        assert_eq!(cache.find(a.id()).unwrap().0, 1);
        assert!(cache.evict(&2, b.id()));
        assert!(cache.find(b.id()).is_none());
        assert_eq!(cache.drain().len(), 1);
        assert_eq!(cache.open_count(), 0);
    }
}
