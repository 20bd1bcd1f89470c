//! The availability directory cache
//!
//! A single background task owns the feed subscription and performs every
//! refresh. Readers only ever touch the published snapshot through an
//! `ArcSwap`, so `get()` never blocks and never waits on the store.
//!
//! Refreshes are full reloads. At most one is in flight; feed events that
//! arrive meanwhile set a pending flag that produces exactly one follow-up.
//! Failed refreshes keep the previous snapshot and retry with backoff. A lost
//! subscription is re-established with backoff, followed by one forced
//! refresh since events may have been missed while disconnected.
//!
//! Subscribe attempts run alongside everything else. A feed that is slow to
//! connect delays nothing but its own events; the snapshot keeps loading and
//! `refresh_now` keeps being served in the meantime.

use crate::directory::backoff::ExponentialBackoff;
use crate::directory::state::CacheState;
use crate::error::{DirectoryError, Result};
use crate::feed::{ChangeFeed, FeedSignal, FeedSubscription};
use crate::metrics::MetricsCollector;
use crate::store::ProviderStore;
use crate::types::{DirectoryEntry, DirectorySnapshot, IdentityRecord, UserId};
use crate::utils::duration_ms;
use arc_swap::ArcSwap;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing knobs for the directory cache
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// First retry delay after a failed refresh
    pub refresh_backoff_base: Duration,
    /// Longest retry delay after repeated failures
    pub refresh_backoff_cap: Duration,
    /// Deadline for each store call
    pub store_timeout: Duration,
    pub resubscribe_backoff_base: Duration,
    pub resubscribe_backoff_cap: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            refresh_backoff_base: Duration::from_secs(1),
            refresh_backoff_cap: Duration::from_secs(30),
            store_timeout: Duration::from_secs(10),
            resubscribe_backoff_base: Duration::from_secs(1),
            resubscribe_backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Counters describing cache activity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryStats {
    pub state: CacheState,
    pub version: u64,
    pub providers: usize,
    pub refreshes_started: u64,
    pub refreshes_succeeded: u64,
    pub refreshes_failed: u64,
    /// Failures since the last successful refresh
    pub consecutive_failures: u64,
    pub events_received: u64,
    pub events_coalesced: u64,
    pub feed_disconnects: u64,
    pub resubscriptions: u64,
}

#[derive(Default)]
struct Counters {
    refreshes_started: AtomicU64,
    refreshes_succeeded: AtomicU64,
    refreshes_failed: AtomicU64,
    consecutive_failures: AtomicU64,
    events_received: AtomicU64,
    events_coalesced: AtomicU64,
    feed_disconnects: AtomicU64,
    resubscriptions: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared between the cache handle and its worker
struct Shared {
    snapshot: ArcSwap<DirectorySnapshot>,
    state: AtomicU8,
    version_tx: watch::Sender<u64>,
    counters: Counters,
}

type Responder = oneshot::Sender<Result<Arc<DirectorySnapshot>>>;

enum Command {
    Refresh(Responder),
}

/// Cache of available providers kept current by a change feed
pub struct DirectoryCache {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DirectoryCache {
    /// Start the cache with its own metrics collector
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        store: Arc<dyn ProviderStore>,
        feed: Arc<dyn ChangeFeed>,
        config: DirectoryConfig,
    ) -> Self {
        Self::start_with_metrics(store, feed, config, Arc::new(MetricsCollector::default()))
    }

    /// Start the cache, reporting into `metrics`
    pub fn start_with_metrics(
        store: Arc<dyn ProviderStore>,
        feed: Arc<dyn ChangeFeed>,
        config: DirectoryConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        // Leaves `Uninitialized` before the handle is returned, so callers
        // observe `Loading` at the earliest.
        let (version_tx, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            snapshot: ArcSwap::from_pointee(DirectorySnapshot::empty()),
            state: AtomicU8::new(CacheState::Loading as u8),
            version_tx,
            counters: Counters::default(),
        });
        metrics.record_cache_state(CacheState::Loading);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        info!(
            "Starting directory cache (feed: {}, store timeout: {:?})",
            feed.describe(),
            config.store_timeout
        );

        let worker = Worker {
            shared: shared.clone(),
            store,
            feed,
            metrics,
            commands: command_rx,
            cancel: cancel.clone(),
            subscription: None,
            subscribing: None,
            ever_subscribed: false,
            in_flight: None,
            pending: true,
            loaded: false,
            retry_at: None,
            resubscribe_at: None,
            refresh_backoff: ExponentialBackoff::new(
                config.refresh_backoff_base,
                config.refresh_backoff_cap,
            ),
            feed_backoff: ExponentialBackoff::new(
                config.resubscribe_backoff_base,
                config.resubscribe_backoff_cap,
            ),
            waiting: Vec::new(),
            in_flight_waiters: Vec::new(),
            config,
        };
        let task = tokio::spawn(worker.run());

        Self {
            shared,
            commands,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// The latest published snapshot
    ///
    /// Before the first successful load this is the empty version-0 snapshot.
    pub fn get(&self) -> Arc<DirectorySnapshot> {
        self.shared.snapshot.load_full()
    }

    pub fn state(&self) -> CacheState {
        CacheState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Ask for a full refresh and wait for its outcome
    ///
    /// The request coalesces with pending feed events. The result is that of
    /// the first refresh started after the request.
    pub async fn refresh_now(&self) -> Result<Arc<DirectorySnapshot>> {
        let (responder, outcome) = oneshot::channel();
        self.commands
            .send(Command::Refresh(responder))
            .map_err(|_| stopped())?;

        outcome.await.map_err(|_| stopped())?
    }

    /// Receiver notified with each newly published version
    pub fn subscribe_versions(&self) -> watch::Receiver<u64> {
        self.shared.version_tx.subscribe()
    }

    /// Wait until a snapshot with at least `version` is published
    pub async fn wait_for_version(
        &self,
        version: u64,
        timeout: Duration,
    ) -> Result<Arc<DirectorySnapshot>> {
        let mut versions = self.subscribe_versions();
        let waited = tokio::time::timeout(timeout, versions.wait_for(|current| *current >= version))
            .await
            .map(|result| result.map(|_| ()));

        match waited {
            Ok(Ok(())) => Ok(self.get()),
            Ok(Err(_)) => Err(stopped()),
            Err(_) => Err(DirectoryError::InternalError {
                message: format!(
                    "Timed out after {:?} waiting for snapshot version {}",
                    timeout, version
                ),
            }
            .into()),
        }
    }

    pub fn stats(&self) -> DirectoryStats {
        let snapshot = self.get();
        let counters = &self.shared.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        DirectoryStats {
            state: self.state(),
            version: snapshot.version(),
            providers: snapshot.len(),
            refreshes_started: load(&counters.refreshes_started),
            refreshes_succeeded: load(&counters.refreshes_succeeded),
            refreshes_failed: load(&counters.refreshes_failed),
            consecutive_failures: load(&counters.consecutive_failures),
            events_received: load(&counters.events_received),
            events_coalesced: load(&counters.events_coalesced),
            feed_disconnects: load(&counters.feed_disconnects),
            resubscriptions: load(&counters.resubscriptions),
        }
    }

    /// Whether the background task is still alive
    pub fn is_running(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the background task and wait for it to finish
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Directory cache task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for DirectoryCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn stopped() -> anyhow::Error {
    DirectoryError::InternalError {
        message: "Directory cache is stopped".to_string(),
    }
    .into()
}

type Task<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type RefreshFuture = Task<(Result<Vec<DirectoryEntry>>, Duration)>;
type SubscribeFuture = Task<Result<FeedSubscription>>;

/// The background task. Sole mutator of the published snapshot.
struct Worker {
    shared: Arc<Shared>,
    store: Arc<dyn ProviderStore>,
    feed: Arc<dyn ChangeFeed>,
    config: DirectoryConfig,
    metrics: Arc<MetricsCollector>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    subscription: Option<FeedSubscription>,
    /// Subscribe attempt in progress
    subscribing: Option<SubscribeFuture>,
    ever_subscribed: bool,
    in_flight: Option<RefreshFuture>,
    pending: bool,
    loaded: bool,
    retry_at: Option<Instant>,
    resubscribe_at: Option<Instant>,
    refresh_backoff: ExponentialBackoff,
    feed_backoff: ExponentialBackoff,
    /// Callers waiting for a refresh that has not started yet
    waiting: Vec<Responder>,
    /// Callers waiting for the refresh in flight
    in_flight_waiters: Vec<Responder>,
}

impl Worker {
    async fn run(mut self) {
        // A feed that subscribes at once is in place before the initial load.
        // Otherwise the load goes ahead and the subscription forces another
        // refresh when it lands.
        self.start_subscribe();
        if let Some(attempt) = self.subscribing.as_mut().and_then(|s| s.now_or_never()) {
            self.subscribing = None;
            self.finish_subscribe(attempt);
        }

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.maybe_start_refresh();
            self.settle_state();

            let retry_at = self.retry_at;
            let resubscribe_at = self.resubscribe_at;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                (result, elapsed) = poll_task(&mut self.in_flight) => {
                    self.finish_refresh(result, elapsed);
                }
                attempt = poll_task(&mut self.subscribing) => {
                    self.subscribing = None;
                    self.finish_subscribe(attempt);
                }
                signal = next_signal(&mut self.subscription) => self.on_signal(signal),
                _ = sleep_until_opt(retry_at) => {
                    self.retry_at = None;
                }
                _ = sleep_until_opt(resubscribe_at) => {
                    self.resubscribe_at = None;
                    self.start_subscribe();
                }
                command = self.commands.recv() => match command {
                    Some(Command::Refresh(responder)) => {
                        self.waiting.push(responder);
                        self.request_refresh();
                    }
                    None => break,
                },
            }
        }

        info!(
            "Directory cache stopped at snapshot version {}",
            self.shared.snapshot.load().version()
        );
    }

    fn maybe_start_refresh(&mut self) {
        if !self.pending || self.in_flight.is_some() || self.retry_at.is_some() {
            return;
        }

        self.pending = false;
        self.in_flight_waiters.append(&mut self.waiting);
        bump(&self.shared.counters.refreshes_started);

        debug!(
            "Starting refresh from snapshot version {}",
            self.shared.snapshot.load().version()
        );
        self.in_flight = Some(Box::pin(run_refresh(
            self.store.clone(),
            self.metrics.clone(),
            self.config.store_timeout,
        )));
    }

    fn finish_refresh(&mut self, result: Result<Vec<DirectoryEntry>>, elapsed: Duration) {
        self.in_flight = None;
        let waiters = std::mem::take(&mut self.in_flight_waiters);
        let counters = &self.shared.counters;

        match result {
            Ok(entries) => {
                let version = self.shared.snapshot.load().version() + 1;
                let snapshot = Arc::new(DirectorySnapshot::build(version, entries));

                self.shared.snapshot.store(snapshot.clone());
                self.shared.version_tx.send_replace(version);

                bump(&counters.refreshes_succeeded);
                counters.consecutive_failures.store(0, Ordering::Relaxed);
                self.refresh_backoff.reset();
                self.loaded = true;

                let unknown = snapshot.unknown_identity_count();
                if unknown > 0 {
                    self.metrics.record_unknown_identities(unknown);
                }
                self.metrics.record_refresh(true, elapsed);
                self.metrics.record_snapshot(version, snapshot.len());

                info!(
                    "Published snapshot version {} with {} providers in {:.2}ms",
                    version,
                    snapshot.len(),
                    duration_ms(elapsed)
                );

                for waiter in waiters {
                    let _ = waiter.send(Ok(snapshot.clone()));
                }
            }
            Err(e) => {
                bump(&counters.refreshes_failed);
                let failures = counters.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let delay = self.refresh_backoff.next_delay();
                self.retry_at = Some(Instant::now() + delay);
                self.pending = true;

                self.metrics.record_refresh(false, elapsed);
                warn!(
                    "Refresh failed ({} in a row), keeping snapshot version {}; retrying in {:?}: {}",
                    failures,
                    self.shared.snapshot.load().version(),
                    delay,
                    e
                );

                let message = match e.downcast_ref::<DirectoryError>() {
                    Some(DirectoryError::StoreUnavailable { message }) => message.clone(),
                    _ => e.to_string(),
                };
                for waiter in waiters {
                    let _ = waiter.send(Err(DirectoryError::StoreUnavailable {
                        message: message.clone(),
                    }
                    .into()));
                }
            }
        }
    }

    fn on_signal(&mut self, signal: Option<FeedSignal>) {
        match signal {
            Some(FeedSignal::Changed(event)) => {
                bump(&self.shared.counters.events_received);
                self.metrics.record_feed_event(event.kind.as_str());
                debug!("Provider '{}' changed ({})", event.provider_id, event.kind);
                self.request_refresh();
            }
            Some(FeedSignal::Lagged(missed)) => {
                self.metrics.record_feed_event("lagged");
                warn!("Change feed dropped {} events, forcing a refresh", missed);
                self.request_refresh();
            }
            None => {
                self.subscription = None;
                bump(&self.shared.counters.feed_disconnects);
                self.metrics.record_feed_disconnect();
                warn!(
                    "Change feed disconnected, serving snapshot version {} until resubscribed",
                    self.shared.snapshot.load().version()
                );
                self.resubscribe_at = Some(Instant::now());
            }
        }
    }

    fn request_refresh(&mut self) {
        if self.pending {
            bump(&self.shared.counters.events_coalesced);
            self.metrics.record_coalesced_event();
        }
        self.pending = true;
    }

    fn start_subscribe(&mut self) {
        if self.subscribing.is_some() {
            return;
        }

        debug!("Subscribing to change feed {}", self.feed.describe());
        let feed = self.feed.clone();
        self.subscribing = Some(Box::pin(async move { feed.subscribe().await }));
    }

    fn finish_subscribe(&mut self, attempt: Result<FeedSubscription>) {
        match attempt {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.resubscribe_at = None;
                self.feed_backoff.reset();

                if self.ever_subscribed {
                    bump(&self.shared.counters.resubscriptions);
                    self.metrics.record_resubscription(true);
                    info!("Resubscribed to change feed {}", self.feed.describe());
                } else {
                    info!("Subscribed to change feed {}", self.feed.describe());
                }
                self.ever_subscribed = true;

                // Anything loaded before this point may have missed changes.
                if self.shared.counters.refreshes_started.load(Ordering::Relaxed) > 0 {
                    self.pending = true;
                }
            }
            Err(e) => {
                let delay = self.feed_backoff.next_delay();
                self.resubscribe_at = Some(Instant::now() + delay);
                if self.ever_subscribed {
                    self.metrics.record_resubscription(false);
                }
                warn!(
                    "Failed to subscribe to change feed {}; retrying in {:?}: {}",
                    self.feed.describe(),
                    delay,
                    e
                );
            }
        }
    }

    fn settle_state(&mut self) {
        let state = if !self.loaded {
            CacheState::Loading
        } else if self.subscription.is_none() {
            CacheState::Disconnected
        } else if self.in_flight.is_some() {
            CacheState::Refreshing
        } else {
            CacheState::Ready
        };

        let previous = self.shared.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!(
                "Directory cache {} -> {}",
                CacheState::from_u8(previous),
                state
            );
            self.metrics.record_cache_state(state);
        }
    }
}

/// Output of the task in `slot`; pending forever when there is none
async fn poll_task<T>(slot: &mut Option<Task<T>>) -> T {
    match slot {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

/// Next signal from the subscription; `None` once it has ended
async fn next_signal(subscription: &mut Option<FeedSubscription>) -> Option<FeedSignal> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_refresh(
    store: Arc<dyn ProviderStore>,
    metrics: Arc<MetricsCollector>,
    deadline: Duration,
) -> (Result<Vec<DirectoryEntry>>, Duration) {
    let timer = metrics.start_timer();
    let result = load_entries(store.as_ref(), &metrics, deadline).await;
    (result, timer.stop())
}

/// One full reload: available providers joined with their identities
async fn load_entries(
    store: &dyn ProviderStore,
    metrics: &MetricsCollector,
    deadline: Duration,
) -> Result<Vec<DirectoryEntry>> {
    let providers = timed_store_call(
        "list_available",
        deadline,
        metrics,
        store.list_available(),
    )
    .await?;

    let total = providers.len();
    let providers: Vec<_> = providers.into_iter().filter(|p| p.available).collect();
    if providers.len() < total {
        debug!(
            "Dropped {} unavailable records from the store result",
            total - providers.len()
        );
    }

    let user_ids: HashSet<UserId> = providers.iter().map(|p| p.user_id.clone()).collect();
    let identities = if user_ids.is_empty() {
        HashMap::new()
    } else {
        timed_store_call(
            "list_identities",
            deadline,
            metrics,
            store.list_identities(&user_ids),
        )
        .await?
    };

    Ok(providers
        .into_iter()
        .map(|provider| {
            let identity = match identities.get(&provider.user_id) {
                Some(identity) => identity.clone(),
                None => {
                    debug!(
                        "No identity for user '{}' of provider '{}'",
                        provider.user_id, provider.id
                    );
                    IdentityRecord::unknown()
                }
            };
            DirectoryEntry { provider, identity }
        })
        .collect())
}

async fn timed_store_call<T, F>(
    operation: &str,
    deadline: Duration,
    metrics: &MetricsCollector,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let timer = metrics.start_timer();
    let result = match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(DirectoryError::StoreUnavailable {
            message: format!("{} timed out after {:?}", operation, deadline),
        }
        .into()),
    };

    metrics.record_store_operation(operation, result.is_ok(), timer.stop());
    result
}
