use derive_more::Constructor;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::{convert::Infallible, future::Future, hash::Hash, time::Duration};
use tokio::time::Instant;

/// Value returned from a [`TtlCache`] lookup, flagged with whether it was served from
/// the cache or freshly fetched.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Constructor)]
pub struct Cached<V> {
    pub value: V,
    pub cached: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < ttl
    }
}

/// Bounded key-value cache whose entries expire a fixed time after insertion.
///
/// Every read re-validates the entry age, so an expired value is never returned even
/// while it is still stored. Inserting into a full cache first drops expired
/// entries, then evicts the oldest remaining entry.
///
/// Concurrent misses for the same key are not coalesced: each caller runs its own
/// fetch and the last successful result wins.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<FnvHashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Return the value for `key` if an entry exists and is younger than the TTL.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| entry.is_fresh(self.ttl, now))
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            entries.retain(|_, entry| entry.is_fresh(self.ttl, now));

            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(key, _)| key.clone());

                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
            },
        );
    }

    /// Serve a fresh entry, or run `fetch` and store its successful result.
    ///
    /// Failed fetches are returned to the caller and never stored.
    pub async fn get_or_try_fetch<F, Fut, E>(&self, key: K, fetch: F) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(Cached::new(value, true));
        }

        // Lock is not held across the fetch
        let value = fetch().await?;
        self.insert(key, value.clone());
        Ok(Cached::new(value, false))
    }

    /// Infallible variant of [`Self::get_or_try_fetch`].
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Cached<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let result = self
            .get_or_try_fetch(key, move || async move { Ok::<V, Infallible>(fetch().await) })
            .await;

        match result {
            Ok(cached) => cached,
            Err(never) => match never {},
        }
    }
}
