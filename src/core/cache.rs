//! Context-keyed cache of possibly pending values.
//!
//! Entries live in an arena-backed linked list in insertion order. Readers
//! stream the list through index cursors while writers append, overwrite and
//! remove. A cursor pins the node it sits on. A removed node that is pinned
//! keeps its forward link, always to a live node, so the cursor can find its
//! way back into the list; it is freed as soon as the last cursor leaves it.

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{ConfidenceError, ErrorCode, Result};

/// State of a [`Deferred`] value.
#[derive(Debug, Clone)]
pub enum Settlement<V> {
    Pending,
    Ready(V),
    Failed(ConfidenceError),
}

impl<V> Settlement<V> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Settlement::Pending)
    }
}

/// A value that settles at most once, shared by every holder of a clone.
#[derive(Debug)]
pub struct Deferred<V> {
    state: Arc<watch::Sender<Settlement<V>>>,
}

impl<V> Clone for Deferred<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<V: Clone + Send + Sync> Deferred<V> {
    pub fn pending() -> Self {
        let (state, _) = watch::channel(Settlement::Pending);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn ready(value: V) -> Self {
        let (state, _) = watch::channel(Settlement::Ready(value));
        Self {
            state: Arc::new(state),
        }
    }

    pub fn failed(error: ConfidenceError) -> Self {
        let (state, _) = watch::channel(Settlement::Failed(error));
        Self {
            state: Arc::new(state),
        }
    }

    /// Returns false if the value had already settled.
    pub fn settle(&self, outcome: Settlement<V>) -> bool {
        if outcome.is_pending() {
            return false;
        }
        let mut outcome = Some(outcome);
        self.state.send_if_modified(|state| match (state.is_pending(), outcome.take()) {
            (true, Some(settled)) => {
                *state = settled;
                true
            }
            _ => false,
        })
    }

    pub fn peek(&self) -> Settlement<V> {
        self.state.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.state.borrow().is_pending()
    }

    /// The settled value, waiting for it if necessary.
    pub async fn unwrap_or_suspend(&self) -> Result<V> {
        let mut settled = self.state.subscribe();
        let state = settled
            .wait_for(|state| !state.is_pending())
            .await
            .map_err(|_| ConfidenceError::cancelled())?;
        match &*state {
            Settlement::Ready(value) => Ok(value.clone()),
            Settlement::Failed(error) => Err(error.clone()),
            Settlement::Pending => Err(ConfidenceError::new(ErrorCode::General, "Value never settled")),
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Evicts and fails the entry if the task producing it panics or is
/// dropped before settling it.
struct SupplierGuard<V: Clone + Send + Sync + 'static> {
    cache: StreamingCache<V>,
    key: String,
    deferred: Deferred<V>,
}

impl<V: Clone + Send + Sync + 'static> Drop for SupplierGuard<V> {
    fn drop(&mut self) {
        if !self.deferred.is_pending() {
            return;
        }
        self.cache.remove_entry(&self.key, &self.deferred);
        self.deferred.settle(Settlement::Failed(ConfidenceError::new(
            ErrorCode::General,
            "Value supplier ended without a result",
        )));
    }
}

type Supplier<V> = Box<dyn FnOnce() -> BoxFuture<'static, Result<V>> + Send>;

#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Oldest entries are evicted beyond this size.
    pub max_entries: Option<usize>,
    /// Entries older than this are dropped on lookup.
    pub ttl: Option<Duration>,
}

struct Node<V> {
    key: String,
    value: Deferred<V>,
    inserted_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
    live: bool,
    // Cursors currently positioned on this node.
    pins: usize,
}

struct Inner<V> {
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    // Removed nodes kept because a cursor sits on them.
    graveyard: Vec<usize>,
    // Removed nodes without a successor; they adopt the next appended node.
    dangling: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<String, usize>,
    refs: usize,
    loads: usize,
    deferred: Vec<(String, Deferred<V>, Supplier<V>)>,
}

impl<V> Inner<V> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            graveyard: Vec::new(),
            dangling: Vec::new(),
            head: None,
            tail: None,
            index: HashMap::new(),
            refs: 0,
            loads: 0,
            deferred: Vec::new(),
        }
    }

    fn node(&self, slot: usize) -> Option<&Node<V>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<V>> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    fn set_next(&mut self, slot: usize, next: Option<usize>) {
        if let Some(node) = self.node_mut(slot) {
            node.next = next;
        }
    }

    fn append(&mut self, key: String, value: Deferred<V>) -> usize {
        let node = Node {
            key: key.clone(),
            value,
            inserted_at: Instant::now(),
            prev: self.tail,
            next: None,
            live: true,
            pins: 0,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => self.set_next(tail, Some(slot)),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);

        for dead in std::mem::take(&mut self.dangling) {
            self.set_next(dead, Some(slot));
        }

        self.index.insert(key, slot);
        slot
    }

    fn unlink(&mut self, slot: usize) {
        let Some((key, prev, next)) = self
            .node(slot)
            .filter(|node| node.live)
            .map(|node| (node.key.clone(), node.prev, node.next))
        else {
            return;
        };

        match prev {
            Some(prev) => self.set_next(prev, next),
            None => self.head = next,
        }
        match next {
            Some(next) => {
                if let Some(node) = self.node_mut(next) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if self.index.get(&key) == Some(&slot) {
            self.index.remove(&key);
        }

        // Pinned dead nodes skip over this one so they never lead to a freed slot.
        let redirected: Vec<usize> = self
            .graveyard
            .iter()
            .copied()
            .filter(|&dead| self.node(dead).is_some_and(|node| node.next == Some(slot)))
            .collect();
        for dead in redirected {
            self.set_next(dead, next);
            if next.is_none() && !self.dangling.contains(&dead) {
                self.dangling.push(dead);
            }
        }

        let pinned = self.node(slot).map_or(0, |node| node.pins);
        if pinned == 0 {
            self.slots[slot] = None;
            self.free.push(slot);
        } else {
            if let Some(node) = self.node_mut(slot) {
                node.live = false;
                node.prev = None;
            }
            self.graveyard.push(slot);
            if next.is_none() {
                self.dangling.push(slot);
            }
        }
    }

    fn pin(&mut self, slot: usize) {
        if let Some(node) = self.node_mut(slot) {
            node.pins += 1;
        }
    }

    /// Releases a cursor's pin, freeing the node if it is dead and unpinned.
    fn unpin(&mut self, slot: usize) {
        let Some(node) = self.node_mut(slot) else {
            return;
        };
        node.pins = node.pins.saturating_sub(1);
        if node.pins > 0 || node.live {
            return;
        }
        self.slots[slot] = None;
        self.free.push(slot);
        self.graveyard.retain(|&dead| dead != slot);
        self.dangling.retain(|&dead| dead != slot);
    }

    /// The first live node after `position`, or the head when there is none.
    fn advance(&self, position: Option<usize>) -> Option<usize> {
        let mut candidate = match position {
            None => self.head,
            Some(slot) => self.node(slot).and_then(|node| node.next),
        };
        while let Some(slot) = candidate {
            let node = self.node(slot)?;
            if node.live {
                return Some(slot);
            }
            candidate = node.next;
        }
        None
    }

    fn is_expired(&self, slot: usize, ttl: Option<Duration>) -> bool {
        match (ttl, self.node(slot)) {
            (Some(ttl), Some(node)) => node.inserted_at.elapsed() >= ttl,
            _ => false,
        }
    }

    /// Live slot for `key`, dropping it first if it has expired.
    fn lookup(&mut self, key: &str, ttl: Option<Duration>) -> Option<usize> {
        let slot = *self.index.get(key)?;
        if self.is_expired(slot, ttl) {
            tracing::debug!("Cache entry expired");
            self.unlink(slot);
            return None;
        }
        Some(slot)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// A cache of [`Deferred`] values keyed by string.
///
/// Cloning is cheap and every clone shares the same entries. Suppliers run on
/// spawned Tokio tasks, so a runtime must be available when they are started.
pub struct StreamingCache<V> {
    inner: Arc<Mutex<Inner<V>>>,
    changes: Arc<watch::Sender<u64>>,
    options: CacheOptions,
}

impl<V> Clone for StreamingCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            changes: Arc::clone(&self.changes),
            options: self.options.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for StreamingCache<V> {
    fn default() -> Self {
        Self::new(CacheOptions::default())
    }
}

impl<V: Clone + Send + Sync + 'static> StreamingCache<V> {
    pub fn new(options: CacheOptions) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
            changes: Arc::new(changes),
            options,
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn evict_overflow(&self, inner: &mut Inner<V>) {
        let Some(max) = self.options.max_entries else {
            return;
        };
        while inner.len() > max {
            let Some(head) = inner.head else { break };
            tracing::debug!("Evicting oldest cache entry, {} entries over limit", inner.len() - max);
            inner.unlink(head);
        }
    }

    /// Returns the entry for `key`, starting `supplier` if there is none.
    ///
    /// Concurrent callers for the same key share one supplier run. A failed
    /// supplier leaves its error with current waiters and drops the entry, so
    /// the next call starts over.
    pub fn get_or_insert_with<F, Fut>(&self, key: &str, supplier: F) -> Deferred<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.lookup(key, self.options.ttl) {
            if let Some(node) = inner.node(slot) {
                return node.value.clone();
            }
        }

        let deferred = Deferred::pending();
        inner.append(key.to_string(), deferred.clone());
        self.evict_overflow(&mut inner);

        let supplier: Supplier<V> = Box::new(move || supplier().boxed());
        if inner.loads > 0 {
            tracing::debug!("Cache load in progress, deferring supplier");
            inner.deferred.push((key.to_string(), deferred.clone(), supplier));
        } else {
            self.spawn_supplier(key.to_string(), deferred.clone(), supplier);
        }
        drop(inner);

        self.notify();
        deferred
    }

    fn spawn_supplier(&self, key: String, deferred: Deferred<V>, supplier: Supplier<V>) {
        let cache = self.clone();
        let guard = SupplierGuard {
            cache: self.clone(),
            key: key.clone(),
            deferred: deferred.clone(),
        };
        tokio::spawn(async move {
            let _guard = guard;
            match supplier().await {
                Ok(value) => {
                    deferred.settle(Settlement::Ready(value));
                }
                Err(error) => {
                    cache.remove_entry(&key, &deferred);
                    deferred.settle(Settlement::Failed(error));
                }
            }
        });
    }

    /// Removes `key` only while it still maps to `deferred`.
    fn remove_entry(&self, key: &str, deferred: &Deferred<V>) {
        let mut inner = self.inner.lock();
        let Some(&slot) = inner.index.get(key) else {
            return;
        };
        if inner.node(slot).is_some_and(|node| node.value.ptr_eq(deferred)) {
            inner.unlink(slot);
            drop(inner);
            self.notify();
        }
    }

    pub fn get(&self, key: &str) -> Option<Deferred<V>> {
        let mut inner = self.inner.lock();
        let slot = inner.lookup(key, self.options.ttl)?;
        inner.node(slot).map(|node| node.value.clone())
    }

    /// Stores a settled value. Overwriting keeps the key's position in the list.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut inner = self.inner.lock();
        match inner.lookup(&key, self.options.ttl) {
            Some(slot) => {
                if let Some(node) = inner.node_mut(slot) {
                    node.value = Deferred::ready(value);
                    node.inserted_at = Instant::now();
                }
            }
            None => {
                inner.append(key, Deferred::ready(value));
                self.evict_overflow(&mut inner);
            }
        }
        drop(inner);
        self.notify();
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(&slot) = inner.index.get(key) else {
            return false;
        };
        inner.unlink(slot);
        drop(inner);
        self.notify();
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keys = Vec::with_capacity(inner.len());
        let mut position = None;
        while let Some(slot) = inner.advance(position) {
            if let Some(node) = inner.node(slot) {
                keys.push(node.key.clone());
            }
            position = Some(slot);
        }
        keys
    }

    /// Keeps streams open until the returned handle is dropped.
    pub fn hold(&self) -> CacheRef<V> {
        self.inner.lock().refs += 1;
        CacheRef {
            cache: self.clone(),
        }
    }

    /// Streams entries in insertion order, including ones added while streaming.
    ///
    /// The stream ends when it reaches the tail and no [`CacheRef`] is held.
    pub fn stream(&self) -> impl Stream<Item = (String, Deferred<V>)> + Send + 'static {
        let cursor = Cursor {
            cache: self.clone(),
            position: None,
        };
        futures::stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next().await?;
            Some((item, cursor))
        })
    }

    /// Ready entries at this moment, serialized.
    pub fn snapshot(&self) -> Vec<(String, serde_json::Value)>
    where
        V: Serialize,
    {
        let inner = self.inner.lock();
        let mut entries = Vec::with_capacity(inner.len());
        let mut position = None;
        while let Some(slot) = inner.advance(position) {
            position = Some(slot);
            let Some(node) = inner.node(slot) else { continue };
            if let Settlement::Ready(value) = node.value.peek() {
                match serde_json::to_value(&value) {
                    Ok(json) => entries.push((node.key.clone(), json)),
                    Err(e) => tracing::warn!("Skipping unserializable cache entry: {}", e),
                }
            }
        }
        entries
    }

    /// Lazily serializes entries, waiting for pending ones. Failed entries are skipped.
    pub fn serialize(&self) -> impl Stream<Item = (String, serde_json::Value)> + Send + 'static
    where
        V: Serialize,
    {
        self.stream().filter_map(|(key, value)| async move {
            let value = value.unwrap_or_suspend().await.ok()?;
            match serde_json::to_value(&value) {
                Ok(json) => Some((key, json)),
                Err(e) => {
                    tracing::warn!("Skipping unserializable cache entry: {}", e);
                    None
                }
            }
        })
    }

    /// Ingests serialized entries.
    ///
    /// Pending local entries with a matching key are settled with the loaded
    /// value; ready ones are kept. Suppliers started while a load runs wait for
    /// it to finish and only run if their entry is still pending.
    pub async fn load<S>(&self, entries: S) -> Result<usize>
    where
        S: Stream<Item = (String, serde_json::Value)>,
        V: DeserializeOwned,
    {
        let _hold = self.hold();
        self.inner.lock().loads += 1;
        let _loading = LoadGuard { cache: self };

        let mut entries = std::pin::pin!(entries);
        let mut loaded = 0;
        while let Some((key, raw)) = entries.next().await {
            let value: V = serde_json::from_value(raw).map_err(|e| {
                ConfidenceError::with_source(
                    ErrorCode::CacheInvalidData,
                    format!("Invalid cache entry for key {}", key),
                    e,
                )
            })?;
            self.load_entry(key, value);
            loaded += 1;
        }
        tracing::debug!("Loaded {} cache entries", loaded);
        Ok(loaded)
    }

    fn load_entry(&self, key: String, value: V) {
        let mut inner = self.inner.lock();
        match inner.lookup(&key, self.options.ttl) {
            Some(slot) => {
                if let Some(node) = inner.node(slot) {
                    node.value.settle(Settlement::Ready(value));
                }
            }
            None => {
                inner.append(key, Deferred::ready(value));
                self.evict_overflow(&mut inner);
            }
        }
        drop(inner);
        self.notify();
    }

    fn finish_load(&self) {
        let deferred = {
            let mut inner = self.inner.lock();
            inner.loads -= 1;
            if inner.loads > 0 {
                return;
            }
            std::mem::take(&mut inner.deferred)
        };
        for (key, value, supplier) in deferred {
            if value.is_pending() {
                self.spawn_supplier(key, value, supplier);
            }
        }
    }
}

struct LoadGuard<'a, V: Clone + Send + Sync + 'static> {
    cache: &'a StreamingCache<V>,
}

impl<V: Clone + Send + Sync + 'static> Drop for LoadGuard<'_, V> {
    fn drop(&mut self) {
        self.cache.finish_load();
    }
}

/// Holds a cache's streams open. See [`StreamingCache::hold`].
pub struct CacheRef<V> {
    cache: StreamingCache<V>,
}

impl<V> Drop for CacheRef<V> {
    fn drop(&mut self) {
        self.cache.inner.lock().refs -= 1;
        self.cache
            .changes
            .send_modify(|version| *version = version.wrapping_add(1));
    }
}

struct Cursor<V> {
    cache: StreamingCache<V>,
    position: Option<usize>,
}

impl<V: Clone + Send + Sync + 'static> Cursor<V> {
    async fn next(&mut self) -> Option<(String, Deferred<V>)> {
        loop {
            let mut changes = self.cache.changes.subscribe();
            {
                let mut inner = self.cache.inner.lock();
                if let Some(slot) = inner.advance(self.position) {
                    let item = inner.node(slot).map(|node| (node.key.clone(), node.value.clone()));
                    inner.pin(slot);
                    if let Some(previous) = self.position.replace(slot) {
                        inner.unpin(previous);
                    }
                    return item;
                }
                if inner.refs == 0 {
                    return None;
                }
            }
            if changes.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl<V> Drop for Cursor<V> {
    fn drop(&mut self) {
        if let Some(position) = self.position {
            self.cache.inner.lock().unpin(position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_deferred_settles_once() {
        let deferred = Deferred::pending();
        assert!(deferred.settle(Settlement::Ready(1)));
        assert!(!deferred.settle(Settlement::Ready(2)));
        assert_eq!(deferred.unwrap_or_suspend().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_fails_and_evicts_value() {
        let cache: StreamingCache<u32> = StreamingCache::default();
        let deferred = Deferred::pending();
        cache.inner.lock().append("k".to_string(), deferred.clone());

        drop(SupplierGuard {
            cache: cache.clone(),
            key: "k".to_string(),
            deferred: deferred.clone(),
        });

        assert!(matches!(deferred.peek(), Settlement::Failed(_)));
        assert!(cache.get("k").is_none());
    }

    #[tokio::test]
    async fn test_panicking_supplier_evicts_entry() {
        let cache: StreamingCache<u32> = StreamingCache::default();
        let panicked = cache.get_or_insert_with("k", || async {
            if true {
                panic!("supplier failed");
            }
            Ok::<u32, ConfidenceError>(0)
        });

        let err = panicked.unwrap_or_suspend().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::General);
        assert!(cache.get("k").is_none());

        let retried = cache.get_or_insert_with("k", || async { Ok::<_, ConfidenceError>(3) });
        assert_eq!(retried.unwrap_or_suspend().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let cache: StreamingCache<u32> = StreamingCache::default();
        let calls = Arc::new(AtomicU32::new(0));

        let supplier = |calls: Arc<AtomicU32>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok::<_, ConfidenceError>(7)
            }
        };
        let a = cache.get_or_insert_with("k", supplier(calls.clone()));
        let b = cache.get_or_insert_with("k", supplier(calls.clone()));

        assert!(a.ptr_eq(&b));
        assert_eq!(a.unwrap_or_suspend().await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_supplier_evicts_entry() {
        let cache: StreamingCache<u32> = StreamingCache::default();
        let failed = cache.get_or_insert_with("k", || async {
            Err::<u32, _>(ConfidenceError::network_error("down"))
        });
        assert!(failed.unwrap_or_suspend().await.is_err());
        tokio::task::yield_now().await;

        assert!(cache.get("k").is_none());
        let retried = cache.get_or_insert_with("k", || async { Ok::<_, ConfidenceError>(3) });
        assert_eq!(retried.unwrap_or_suspend().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expires_on_lookup() {
        let cache = StreamingCache::new(CacheOptions {
            max_entries: None,
            ttl: Some(Duration::from_secs(60)),
        });
        cache.insert("k", 1u32);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("k").is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_max_entries_evicts_oldest() {
        let cache = StreamingCache::new(CacheOptions {
            max_entries: Some(2),
            ttl: None,
        });
        cache.insert("a", 1u32);
        cache.insert("b", 2);
        cache.insert("c", 3);
        assert_eq!(cache.keys(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_held_stream_does_not_leak_slots() {
        let cache = StreamingCache::new(CacheOptions {
            max_entries: Some(10),
            ttl: None,
        });
        let _hold = cache.hold();
        let mut stream = Box::pin(cache.stream());

        for i in 0..1000u32 {
            cache.insert(format!("k{}", i), i);
            let (key, _) = stream.next().await.unwrap();
            assert_eq!(key, format!("k{}", i));
        }

        let inner = cache.inner.lock();
        assert_eq!(inner.len(), 10);
        assert!(inner.slots.len() <= 11);
        assert!(inner.graveyard.is_empty());
    }

    #[tokio::test]
    async fn test_dead_node_freed_when_cursor_leaves() {
        let cache = StreamingCache::default();
        cache.insert("a", 1u32);
        cache.insert("b", 2);
        let _hold = cache.hold();
        let mut stream = Box::pin(cache.stream());

        stream.next().await.unwrap();
        cache.remove("a");
        assert_eq!(cache.inner.lock().graveyard.len(), 1);

        let (key, _) = stream.next().await.unwrap();
        assert_eq!(key, "b");
        let inner = cache.inner.lock();
        assert!(inner.graveyard.is_empty());
        assert_eq!(inner.free.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_dead_node() {
        let cache = StreamingCache::default();
        cache.insert("a", 1u32);
        let mut stream = Box::pin(cache.stream());

        stream.next().await.unwrap();
        cache.remove("a");
        assert_eq!(cache.inner.lock().graveyard.len(), 1);

        drop(stream);
        let inner = cache.inner.lock();
        assert!(inner.graveyard.is_empty());
        assert!(inner.dangling.is_empty());
    }

    #[test]
    fn test_slots_reused_without_cursors() {
        let cache = StreamingCache::default();
        cache.insert("a", 1u32);
        cache.remove("a");
        cache.insert("b", 2);
        assert_eq!(cache.inner.lock().slots.len(), 1);
    }
}
