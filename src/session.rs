//! Request surface for the display layer.
//!
//! Each call spawns one worker and returns its request id right away. The
//! worker posts exactly one [`SessionEvent`] for that id to the session's
//! channel, whether it succeeds, fails, or panics. Requests cannot be
//! cancelled once started.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::{DecodedImage, ResultCache};
use crate::config::Config;
use crate::error::{panic_message, FeedError};
use crate::feed::{FeedItems, HttpFetcher};

/// Tells the session whether the device currently has a usable network.
pub trait Connectivity: Send + Sync {
    fn is_available(&self) -> bool;
}

/// Connectivity signal the host flips as its network state changes.
#[derive(Debug, Clone)]
pub struct NetworkFlag(Arc<AtomicBool>);

impl NetworkFlag {
    pub fn new(available: bool) -> Self {
        Self(Arc::new(AtomicBool::new(available)))
    }

    pub fn set(&self, available: bool) {
        self.0.store(available, Ordering::Release);
    }
}

impl Default for NetworkFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for NetworkFlag {
    fn is_available(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Outcome of one session request.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Result of [`Session::load_feed`] or [`Session::refresh_feed`]
    FeedLoaded {
        request_id: u64,
        refreshed: bool,
        result: Result<FeedItems, FeedError>,
    },
    /// Result of [`Session::load_image`]
    ImageLoaded {
        request_id: u64,
        url: String,
        result: Result<DecodedImage, FeedError>,
    },
}

impl SessionEvent {
    pub fn request_id(&self) -> u64 {
        match self {
            SessionEvent::FeedLoaded { request_id, .. }
            | SessionEvent::ImageLoaded { request_id, .. } => *request_id,
        }
    }
}

/// One feed, its cache, and the channel results are posted to.
pub struct Session {
    cache: ResultCache,
    feed_url: Arc<str>,
    network: Arc<dyn Connectivity>,
    events: mpsc::Sender<SessionEvent>,
    next_request: AtomicU64,
}

impl Session {
    pub fn new(
        cache: ResultCache,
        feed_url: impl Into<String>,
        network: Arc<dyn Connectivity>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            cache,
            feed_url: Arc::from(feed_url.into()),
            network,
            events,
            next_request: AtomicU64::new(1),
        }
    }

    /// Builds a session over an [`HttpFetcher`] configured from `config`.
    pub fn from_config(
        config: &Config,
        network: Arc<dyn Connectivity>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, FeedError> {
        let fetcher = HttpFetcher::new(config)?;
        Ok(Self::new(
            ResultCache::new(Arc::new(fetcher)),
            config.feed_url.clone(),
            network,
            events,
        ))
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Requests the feed items, from the cache when present.
    pub fn load_feed(&self) -> u64 {
        self.spawn_feed(false)
    }

    /// Requests a fresh copy of the feed, replacing the cached items on
    /// success.
    pub fn refresh_feed(&self) -> u64 {
        self.spawn_feed(true)
    }

    /// Requests the thumbnail at `url`, from the cache when present.
    pub fn load_image(&self, url: &str) -> u64 {
        let request_id = self.next_request_id();
        let cache = self.cache.clone();
        let network = Arc::clone(&self.network);
        let tx = self.events.clone();
        let url = url.to_string();

        tokio::spawn(async move {
            let outcome = catch_task_panic(async {
                if network.is_available() {
                    cache.get_image(&url).await
                } else {
                    cache.cached_image(&url).ok_or_else(offline)
                }
            })
            .await;
            let result = outcome.unwrap_or_else(|panic_msg| Err(worker_panicked(panic_msg)));
            deliver(
                &tx,
                SessionEvent::ImageLoaded {
                    request_id,
                    url,
                    result,
                },
            )
            .await;
        });

        request_id
    }

    fn spawn_feed(&self, refreshed: bool) -> u64 {
        let request_id = self.next_request_id();
        let cache = self.cache.clone();
        let feed_url = Arc::clone(&self.feed_url);
        let network = Arc::clone(&self.network);
        let tx = self.events.clone();

        tokio::spawn(async move {
            let outcome = catch_task_panic(async {
                match (network.is_available(), refreshed) {
                    (true, false) => cache.get_feed(&feed_url).await,
                    (true, true) => cache.refresh_feed(&feed_url).await,
                    // Offline: a plain load may still be answered from memory
                    (false, false) => cache.cached_feed(&feed_url).ok_or_else(offline),
                    (false, true) => Err(offline()),
                }
            })
            .await;
            let result = outcome.unwrap_or_else(|panic_msg| Err(worker_panicked(panic_msg)));
            deliver(
                &tx,
                SessionEvent::FeedLoaded {
                    request_id,
                    refreshed,
                    result,
                },
            )
            .await;
        });

        request_id
    }

    fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }
}

fn offline() -> FeedError {
    FeedError::Network("network unavailable".into())
}

fn worker_panicked(panic_msg: String) -> FeedError {
    tracing::error!(error = %panic_msg, "Request worker panicked");
    FeedError::Io(format!("request worker panicked: {panic_msg}"))
}

async fn deliver(tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    let request_id = event.request_id();
    if let Err(e) = tx.send(event).await {
        tracing::warn!(request_id, error = %e, "Event channel send failed (receiver dropped)");
    }
}

/// Runs `future`, turning a panic into `Err` with the panic message.
async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(panic.as_ref()))
}
