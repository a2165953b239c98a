//! Memoization of computed Carbon paths.
//!
//! Rendering rule templates for every sample of every write is wasted work:
//! the same series show up in every scrape. [`PathsCache`] keeps the paths
//! of each `(prefix, metric)` for a fixed TTL and sweeps expired entries at
//! most once per purge interval, on the write path itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::model::Metric;

/// Paths computed for one metric.
pub type Paths = Arc<[Vec<u8>]>;

#[derive(Debug)]
struct Entry {
    paths: Paths,
    /// `None` when the TTL overflows `Instant`.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<(String, Metric), Entry>,
    last_purge: Instant,
}

/// A TTL cache of metric paths, safe to share between writers.
#[derive(Debug)]
pub struct PathsCache {
    ttl: Duration,
    purge_interval: Duration,
    inner: Mutex<Inner>,
}

impl PathsCache {
    /// Creates an empty cache.
    pub fn new(ttl: Duration, purge_interval: Duration) -> Self {
        Self {
            ttl,
            purge_interval,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                last_purge: Instant::now(),
            }),
        }
    }

    /// Returns the cached paths for `(prefix, metric)`, computing and storing
    /// them with `compute` on a miss or after expiry.
    pub fn get_or_insert_with<F>(&self, prefix: &str, metric: &Metric, compute: F) -> Paths
    where
        F: FnOnce() -> Vec<Vec<u8>>,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if now.duration_since(inner.last_purge) >= self.purge_interval {
            inner.entries.retain(|_, entry| entry.is_live(now));
            inner.last_purge = now;
        }

        let key = (prefix.to_string(), metric.clone());
        if let Some(entry) = inner.entries.get(&key)
            && entry.is_live(now)
        {
            return Arc::clone(&entry.paths);
        }

        let paths: Paths = compute().into();
        inner.entries.insert(
            key,
            Entry {
                paths: Arc::clone(&paths),
                expires_at: now.checked_add(self.ttl),
            },
        );
        paths
    }

    /// Number of stored entries, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}
