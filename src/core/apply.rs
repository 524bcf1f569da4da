//! Apply batching.
//!
//! Flag uses are deduplicated per resolve token and sent in batches when
//! the debounce window closes, when a token's buffer fills up, or when
//! `flush()` is called. Batches that fail to send go back to the front of
//! the buffer so nothing is dropped.

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};

use super::config::{DEFAULT_APPLY_DEBOUNCE, DEFAULT_APPLY_MAX_BUFFER_SIZE};
use super::resolver::PendingApply;
use crate::error::{ErrorCode, Result};

/// Default number of resolve tokens whose applied flags are remembered.
pub const DEFAULT_MAX_TRACKED_TOKENS: usize = 256;

/// Configuration for apply batching.
#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Quiet period after the last apply before a flush. Default: 10ms
    pub debounce: Duration,

    /// Pending applies per token that trigger an immediate flush. Default: 100
    pub max_buffer_size: usize,

    /// Resolve tokens remembered for deduplication. Default: 256
    pub max_tracked_tokens: usize,

    /// Whether applies are recorded at all. Default: true
    pub enabled: bool,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_APPLY_DEBOUNCE,
            max_buffer_size: DEFAULT_APPLY_MAX_BUFFER_SIZE,
            max_tracked_tokens: DEFAULT_MAX_TRACKED_TOKENS,
            enabled: true,
        }
    }
}

impl ApplyConfig {
    pub fn builder() -> ApplyConfigBuilder {
        ApplyConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ApplyConfigBuilder {
    debounce: Option<Duration>,
    max_buffer_size: Option<usize>,
    max_tracked_tokens: Option<usize>,
    enabled: Option<bool>,
}

impl ApplyConfigBuilder {
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = Some(size);
        self
    }

    pub fn max_tracked_tokens(mut self, max: usize) -> Self {
        self.max_tracked_tokens = Some(max);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn build(self) -> ApplyConfig {
        let defaults = ApplyConfig::default();
        ApplyConfig {
            debounce: self.debounce.unwrap_or(defaults.debounce),
            max_buffer_size: self.max_buffer_size.unwrap_or(defaults.max_buffer_size).max(1),
            max_tracked_tokens: self
                .max_tracked_tokens
                .unwrap_or(defaults.max_tracked_tokens)
                .max(1),
            enabled: self.enabled.unwrap_or(defaults.enabled),
        }
    }
}

/// Sends one batch of applies for a resolve token.
pub type ApplySender =
    Arc<dyn Fn(String, Vec<PendingApply>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Default)]
struct TokenApplies {
    seen: HashSet<String>,
    pending: Vec<PendingApply>,
}

#[derive(Default)]
struct ApplyState {
    tokens: HashMap<String, TokenApplies>,
    order: VecDeque<String>,
    deadline: Option<Instant>,
    /// Tokens whose buffer filled up, waiting for the background task.
    full: Vec<String>,
}

impl ApplyState {
    fn token(&mut self, token: &str, max_tracked: usize) -> &mut TokenApplies {
        if !self.tokens.contains_key(token) {
            self.forget_oldest(max_tracked.saturating_sub(1));
            self.order.push_back(token.to_string());
        }
        self.tokens.entry(token.to_string()).or_default()
    }

    /// Forgets the oldest idle tokens until at most `max_tracked` are known.
    fn forget_oldest(&mut self, max_tracked: usize) {
        let mut kept = VecDeque::with_capacity(self.order.len());
        while self.order.len() + kept.len() > max_tracked {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            let idle = self
                .tokens
                .get(&oldest)
                .map_or(true, |applies| applies.pending.is_empty());
            if idle {
                self.tokens.remove(&oldest);
            } else {
                kept.push_back(oldest);
            }
        }
        while let Some(token) = kept.pop_back() {
            self.order.push_front(token);
        }
    }

    fn drain(&mut self, token: &str) -> Vec<PendingApply> {
        self.tokens
            .get_mut(token)
            .map(|applies| std::mem::take(&mut applies.pending))
            .unwrap_or_default()
    }

    fn drain_all(&mut self) -> Vec<(String, Vec<PendingApply>)> {
        self.tokens
            .iter_mut()
            .filter(|(_, applies)| !applies.pending.is_empty())
            .map(|(token, applies)| (token.clone(), std::mem::take(&mut applies.pending)))
            .collect()
    }

    fn requeue(&mut self, token: &str, batch: Vec<PendingApply>, max_tracked: usize) {
        let applies = self.token(token, max_tracked);
        for pending in &batch {
            applies.seen.insert(pending.flag.clone());
        }
        applies.pending.splice(0..0, batch);
    }
}

/// Batches flag applies and sends them in the background.
///
/// Cloning shares the same buffers and background task.
#[derive(Clone)]
pub struct ApplyManager {
    config: ApplyConfig,
    state: Arc<Mutex<ApplyState>>,
    sender: ApplySender,
    wake: Arc<Notify>,
    shutdown_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
    is_running: Arc<AtomicBool>,
}

impl ApplyManager {
    pub fn new(config: ApplyConfig, sender: ApplySender) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ApplyState::default())),
            sender,
            wake: Arc::new(Notify::new()),
            shutdown_tx: Arc::new(Mutex::new(None)),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ApplyConfig {
        &self.config
    }

    /// Records that `flag` from `resolve_token` was used.
    ///
    /// Repeated applies of the same flag and token are ignored. Must be
    /// called from within a Tokio runtime.
    pub fn apply(&self, resolve_token: &str, flag: &str) {
        if !self.config.enabled {
            return;
        }

        let buffer_full = {
            let mut state = self.state.lock();
            let applies = state.token(resolve_token, self.config.max_tracked_tokens);
            if !applies.seen.insert(flag.to_string()) {
                return;
            }
            applies.pending.push(PendingApply {
                flag: flag.to_string(),
                apply_time: Utc::now(),
            });
            let full = applies.pending.len() >= self.config.max_buffer_size;
            state.deadline = Some(Instant::now() + self.config.debounce);
            if full {
                state.full.push(resolve_token.to_string());
            }
            full
        };
        if buffer_full {
            tracing::debug!("Apply buffer full for one token, flushing it");
        }

        self.start();
        self.wake.notify_one();
    }

    /// Pending applies for one token.
    pub fn pending_count(&self, resolve_token: &str) -> usize {
        self.state
            .lock()
            .tokens
            .get(resolve_token)
            .map_or(0, |applies| applies.pending.len())
    }

    /// Pending applies across all tokens.
    pub fn pending_total(&self) -> usize {
        self.state
            .lock()
            .tokens
            .values()
            .map(|applies| applies.pending.len())
            .sum()
    }

    /// Sends everything pending, one request per token, concurrently.
    pub async fn flush(&self) {
        let batches = {
            let mut state = self.state.lock();
            state.deadline = None;
            state.drain_all()
        };
        join_all(
            batches
                .into_iter()
                .map(|(token, batch)| self.send(token, batch)),
        )
        .await;
    }

    pub async fn flush_token(&self, resolve_token: &str) {
        let batch = self.state.lock().drain(resolve_token);
        self.send(resolve_token.to_string(), batch).await;
    }

    async fn send(&self, token: String, batch: Vec<PendingApply>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        match (self.sender)(token.clone(), batch.clone()).await {
            Ok(()) => tracing::debug!("Sent {} applies", count),
            Err(e) if e.code == ErrorCode::PublishPartialFailure => {
                tracing::warn!("Some applies were rejected: {}", e);
            }
            Err(e) => {
                tracing::warn!("Failed to send {} applies: {}", count, e);
                self.state
                    .lock()
                    .requeue(&token, batch, self.config.max_tracked_tokens);
            }
        }
    }

    fn dispatch(&self, in_flight: &mut JoinSet<()>, batches: Vec<(String, Vec<PendingApply>)>) {
        for (token, batch) in batches {
            if batch.is_empty() {
                continue;
            }
            let this = self.clone();
            in_flight.spawn(async move { this.send(token, batch).await });
        }
    }

    /// Starts the background flush task if it is not running yet.
    ///
    /// The task never awaits a send itself: every batch runs as its own
    /// task, so a token stuck in retries does not hold back the others.
    fn start(&self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let this = self.clone();
        tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            loop {
                let deadline = this.state.lock().deadline;
                let idle = Instant::now() + Duration::from_secs(3600);

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Apply manager shutting down");
                        let batches = {
                            let mut state = this.state.lock();
                            state.deadline = None;
                            state.full.clear();
                            state.drain_all()
                        };
                        this.dispatch(&mut in_flight, batches);
                        while in_flight.join_next().await.is_some() {}
                        break;
                    }
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                    _ = this.wake.notified() => {
                        let batches: Vec<(String, Vec<PendingApply>)> = {
                            let mut state = this.state.lock();
                            let full = std::mem::take(&mut state.full);
                            full.into_iter()
                                .map(|token| {
                                    let batch = state.drain(&token);
                                    (token, batch)
                                })
                                .collect()
                        };
                        this.dispatch(&mut in_flight, batches);
                    }
                    _ = sleep_until(deadline.unwrap_or(idle)), if deadline.is_some() => {
                        let batches = {
                            let mut state = this.state.lock();
                            match state.deadline {
                                Some(at) if at <= Instant::now() => {
                                    state.deadline = None;
                                    state.full.clear();
                                    state.drain_all()
                                }
                                _ => Vec::new(),
                            }
                        };
                        this.dispatch(&mut in_flight, batches);
                    }
                }
            }
            this.is_running.store(false, Ordering::SeqCst);
        });
    }

    /// Stops the background task after a final flush. Sends already in
    /// flight are awaited.
    pub async fn stop(&self) {
        let shutdown_tx = self.shutdown_tx.lock().take();
        match shutdown_tx {
            Some(tx) => {
                let _ = tx.send(()).await;
                tx.closed().await;
            }
            None => self.flush().await,
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}
