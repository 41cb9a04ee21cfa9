use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::thumbnail::{decode_image, DecodedImage};
use crate::error::{panic_message, FeedError};
use crate::feed::{parse_feed, FeedItems, Fetcher};

type PendingLoad<T> = Shared<BoxFuture<'static, Result<T, FeedError>>>;

/// A value that landed in the cache, tagged with the load that produced it.
struct Stored<T> {
    generation: u64,
    value: T,
}

/// A load in progress. Every caller that misses on the same key awaits the
/// same shared future.
struct Pending<T> {
    generation: u64,
    load: PendingLoad<T>,
}

struct Slot<T> {
    ready: HashMap<String, Stored<T>>,
    pending: HashMap<String, Pending<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            ready: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

struct Inner {
    fetcher: Arc<dyn Fetcher>,
    feeds: Mutex<Slot<FeedItems>>,
    images: Mutex<Slot<DecodedImage>>,
    generation: AtomicU64,
}

/// Kinds of value the cache can hold, each with its own map and decoder.
trait Entry: Clone + Send + Sync + Sized + 'static {
    const KIND: &'static str;

    fn slot(inner: &Inner) -> &Mutex<Slot<Self>>;

    fn decode(body: Vec<u8>) -> Result<Self, FeedError>;

    /// Error reported when the decode worker dies without a result.
    fn worker_failed(message: String) -> FeedError;
}

impl Entry for FeedItems {
    const KIND: &'static str = "feed";

    fn slot(inner: &Inner) -> &Mutex<Slot<Self>> {
        &inner.feeds
    }

    fn decode(body: Vec<u8>) -> Result<Self, FeedError> {
        parse_feed(body.as_slice())
    }

    fn worker_failed(message: String) -> FeedError {
        FeedError::Format(message)
    }
}

impl Entry for DecodedImage {
    const KIND: &'static str = "image";

    fn slot(inner: &Inner) -> &Mutex<Slot<Self>> {
        &inner.images
    }

    fn decode(body: Vec<u8>) -> Result<Self, FeedError> {
        decode_image(&body)
    }

    fn worker_failed(message: String) -> FeedError {
        FeedError::Decode(message)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lookup {
    CacheFirst,
    Refresh,
}

/// In-memory cache of decoded feeds and images with fetch-on-miss.
///
/// Keys are URLs. A miss fetches the URL through the [`Fetcher`], decodes the
/// body, stores the value and returns it; failures are returned without
/// touching the cache. Concurrent misses on one key share a single fetch.
/// Entries live until the cache is dropped.
///
/// Cloning is cheap and every clone sees the same entries.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Inner>,
}

impl ResultCache {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                feeds: Mutex::new(Slot::default()),
                images: Mutex::new(Slot::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the cached items for `key`, loading them on a miss.
    pub async fn get_feed(&self, key: &str) -> Result<FeedItems, FeedError> {
        self.get::<FeedItems>(key, Lookup::CacheFirst).await
    }

    /// Fetches and parses `key` even if it is cached, replacing the stored
    /// items on success.
    pub async fn refresh_feed(&self, key: &str) -> Result<FeedItems, FeedError> {
        self.get::<FeedItems>(key, Lookup::Refresh).await
    }

    /// Returns the cached image for `key`, loading it on a miss.
    pub async fn get_image(&self, key: &str) -> Result<DecodedImage, FeedError> {
        self.get::<DecodedImage>(key, Lookup::CacheFirst).await
    }

    /// Stored items for `key`, without fetching.
    pub fn cached_feed(&self, key: &str) -> Option<FeedItems> {
        self.peek::<FeedItems>(key)
    }

    /// Stored image for `key`, without fetching.
    pub fn cached_image(&self, key: &str) -> Option<DecodedImage> {
        self.peek::<DecodedImage>(key)
    }

    fn peek<T: Entry>(&self, key: &str) -> Option<T> {
        lock(T::slot(&self.inner))
            .ready
            .get(key)
            .map(|stored| stored.value.clone())
    }

    async fn get<T: Entry>(&self, key: &str, lookup: Lookup) -> Result<T, FeedError> {
        let load = {
            let mut slot = lock(T::slot(&self.inner));
            match lookup {
                Lookup::CacheFirst => {
                    if let Some(stored) = slot.ready.get(key) {
                        tracing::debug!(kind = T::KIND, key = %key, "Cache hit");
                        return Ok(stored.value.clone());
                    }
                    let in_flight = slot.pending.get(key).map(|pending| pending.load.clone());
                    match in_flight {
                        Some(load) => {
                            tracing::debug!(kind = T::KIND, key = %key, "Joining in-flight load");
                            load
                        }
                        None => self.start_load(&mut slot, key),
                    }
                }
                Lookup::Refresh => self.start_load(&mut slot, key),
            }
        };
        load.await
    }

    /// Registers a new load for `key` and returns it. Must be called with the
    /// slot locked so the check and the insert are one step.
    fn start_load<T: Entry>(&self, slot: &mut Slot<T>, key: &str) -> PendingLoad<T> {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();

        // The load runs on its own task so it completes even if every caller
        // stops waiting for it
        let task = tokio::spawn(async move {
            // A panic must still complete the load, or the pending entry would never clear
            let result =
                AssertUnwindSafe(fetch_and_decode::<T>(inner.fetcher.as_ref(), &owned_key))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(
                            kind = T::KIND,
                            key = %owned_key,
                            error = %message,
                            "Load panicked"
                        );
                        Err(T::worker_failed(format!("load panicked: {message}")))
                    });

            let mut slot = lock(T::slot(&inner));
            match &result {
                Ok(value) => {
                    // Last load to start wins, whatever order they finish in
                    let superseded = slot
                        .ready
                        .get(&owned_key)
                        .is_some_and(|existing| existing.generation > generation);
                    if superseded {
                        tracing::debug!(
                            kind = T::KIND,
                            key = %owned_key,
                            "Newer load already stored, keeping it"
                        );
                    } else {
                        slot.ready.insert(
                            owned_key.clone(),
                            Stored {
                                generation,
                                value: value.clone(),
                            },
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        kind = T::KIND,
                        key = %owned_key,
                        error = %e,
                        "Load failed, nothing cached"
                    );
                }
            }
            if slot
                .pending
                .get(&owned_key)
                .is_some_and(|pending| pending.generation == generation)
            {
                slot.pending.remove(&owned_key);
            }
            result
        });

        let load = async move {
            task.await
                .unwrap_or_else(|e| Err(T::worker_failed(format!("load task failed: {e}"))))
        }
        .boxed()
        .shared();

        tracing::debug!(kind = T::KIND, key = %key, generation, "Starting load");
        slot.pending.insert(
            key.to_string(),
            Pending {
                generation,
                load: load.clone(),
            },
        );
        load
    }
}

async fn fetch_and_decode<T: Entry>(fetcher: &dyn Fetcher, key: &str) -> Result<T, FeedError> {
    let body = fetcher.fetch(key).await?;
    let size = body.len();
    let value = tokio::task::spawn_blocking(move || T::decode(body))
        .await
        .map_err(|e| T::worker_failed(format!("decode worker failed: {e}")))??;
    tracing::info!(kind = T::KIND, key = %key, bytes = size, "Loaded");
    Ok(value)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::thumbnail::png_bytes;
    use crate::error::ErrorKind;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const FEED_URL: &str = "https://blog.example.com/feed/";

    fn rss(titles: &[&str]) -> Vec<u8> {
        let mut xml = String::from("<rss version=\"2.0\"><channel>");
        for title in titles {
            xml.push_str(&format!("<item><title>{title}</title></item>"));
        }
        xml.push_str("</channel></rss>");
        xml.into_bytes()
    }

    /// Replays queued responses in call order and counts calls.
    #[derive(Default)]
    struct ScriptedFetcher {
        responses: Mutex<VecDeque<(Duration, Result<Vec<u8>, FeedError>)>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn then(self, body: Result<Vec<u8>, FeedError>) -> Self {
            self.then_after(Duration::ZERO, body)
        }

        fn then_after(self, delay: Duration, body: Result<Vec<u8>, FeedError>) -> Self {
            lock(&self.responses).push_back((delay, body));
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = lock(&self.responses).pop_front();
            let (delay, result) = next
                .unwrap_or_else(|| (Duration::ZERO, Err(FeedError::Network("no response".into()))));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }

    fn cache_with(fetcher: ScriptedFetcher) -> (ResultCache, Arc<ScriptedFetcher>) {
        let fetcher = Arc::new(fetcher);
        (ResultCache::new(fetcher.clone()), fetcher)
    }

    fn titles(items: &FeedItems) -> Vec<&str> {
        items.iter().map(|item| item.title()).collect()
    }

    #[tokio::test]
    async fn test_second_get_is_served_from_cache() {
        let (cache, fetcher) = cache_with(ScriptedFetcher::default().then(Ok(rss(&["a", "b"]))));

        let first = cache.get_feed(FEED_URL).await.unwrap();
        let second = cache.get_feed(FEED_URL).await.unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(titles(&first), vec!["a", "b"]);
        assert!(first.ptr_eq(&second));
    }

    #[tokio::test]
    async fn test_refresh_always_fetches_and_replaces() {
        let (cache, fetcher) = cache_with(
            ScriptedFetcher::default()
                .then(Ok(rss(&["old"])))
                .then(Ok(rss(&["new", "newer"]))),
        );

        cache.get_feed(FEED_URL).await.unwrap();
        let refreshed = cache.refresh_feed(FEED_URL).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(titles(&refreshed), vec!["new", "newer"]);

        let after = cache.get_feed(FEED_URL).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert!(after.ptr_eq(&refreshed));
    }

    #[tokio::test]
    async fn test_refresh_on_empty_cache_stores_result() {
        let (cache, fetcher) = cache_with(ScriptedFetcher::default().then(Ok(rss(&["x"]))));

        cache.refresh_feed(FEED_URL).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
        assert!(cache.cached_feed(FEED_URL).is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_items() {
        let (cache, _fetcher) = cache_with(
            ScriptedFetcher::default()
                .then(Ok(rss(&["kept"])))
                .then(Err(FeedError::Network("timed out".into()))),
        );

        cache.get_feed(FEED_URL).await.unwrap();
        let err = cache.refresh_feed(FEED_URL).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);

        let cached = cache.cached_feed(FEED_URL).unwrap();
        assert_eq!(titles(&cached), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_not_cached_and_next_call_retries() {
        let (cache, fetcher) = cache_with(
            ScriptedFetcher::default()
                .then(Err(FeedError::Network("connection refused".into())))
                .then(Ok(rss(&["recovered"]))),
        );

        let err = cache.get_feed(FEED_URL).await.unwrap_err();
        assert_eq!(err, FeedError::Network("connection refused".into()));
        assert!(cache.cached_feed(FEED_URL).is_none());

        let items = cache.get_feed(FEED_URL).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(titles(&items), vec!["recovered"]);
    }

    #[tokio::test]
    async fn test_parse_failure_is_not_cached() {
        let (cache, _fetcher) = cache_with(
            ScriptedFetcher::default().then(Ok(b"<html><body>Not Found</body></html>".to_vec())),
        );

        let err = cache.get_feed(FEED_URL).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(cache.cached_feed(FEED_URL).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let (cache, fetcher) = cache_with(
            ScriptedFetcher::default().then_after(Duration::from_millis(50), Ok(rss(&["once"]))),
        );

        let (a, b, c) = tokio::join!(
            cache.get_feed(FEED_URL),
            cache.get_feed(FEED_URL),
            cache.get_feed(FEED_URL)
        );

        assert_eq!(fetcher.calls(), 1);
        let a = a.unwrap();
        assert!(a.ptr_eq(&b.unwrap()));
        assert!(a.ptr_eq(&c.unwrap()));
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_failure() {
        let (cache, fetcher) = cache_with(ScriptedFetcher::default().then_after(
            Duration::from_millis(20),
            Err(FeedError::Network("unreachable".into())),
        ));

        let (a, b) = tokio::join!(cache.get_feed(FEED_URL), cache.get_feed(FEED_URL));

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(a.unwrap_err().kind(), ErrorKind::Network);
        assert_eq!(b.unwrap_err().kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_stale_load_does_not_overwrite_newer_refresh() {
        let (cache, fetcher) = cache_with(
            ScriptedFetcher::default()
                .then_after(Duration::from_millis(150), Ok(rss(&["stale"])))
                .then_after(Duration::from_millis(10), Ok(rss(&["fresh"]))),
        );

        let (slow, fast) = tokio::join!(cache.get_feed(FEED_URL), cache.refresh_feed(FEED_URL));

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(titles(&slow.unwrap()), vec!["stale"]);
        assert_eq!(titles(&fast.unwrap()), vec!["fresh"]);

        let cached = cache.cached_feed(FEED_URL).unwrap();
        assert_eq!(titles(&cached), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_distinct_keys_fetch_separately() {
        let (cache, fetcher) = cache_with(
            ScriptedFetcher::default()
                .then(Ok(rss(&["one"])))
                .then(Ok(rss(&["two"]))),
        );

        let one = cache.get_feed("https://a.example.com/feed").await.unwrap();
        let two = cache.get_feed("https://b.example.com/feed").await.unwrap();

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(titles(&one), vec!["one"]);
        assert_eq!(titles(&two), vec!["two"]);
    }

    #[tokio::test]
    async fn test_image_is_decoded_and_cached() {
        let (cache, fetcher) = cache_with(ScriptedFetcher::default().then(Ok(png_bytes(4, 3))));
        let url = "https://cdn.example.com/thumb.png";

        let first = cache.get_image(url).await.unwrap();
        let second = cache.get_image(url).await.unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert_eq!((first.width(), first.height()), (4, 3));
        assert!(first.ptr_eq(&second));
    }

    #[tokio::test]
    async fn test_undecodable_image_is_not_cached() {
        let (cache, fetcher) = cache_with(
            ScriptedFetcher::default()
                .then(Ok(b"definitely not a png".to_vec()))
                .then(Ok(png_bytes(1, 1))),
        );
        let url = "https://cdn.example.com/broken.png";

        let err = cache.get_image(url).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(cache.cached_image(url).is_none());

        cache.get_image(url).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_image_fetch_failure_is_not_cached_and_next_call_retries() {
        let (cache, fetcher) = cache_with(
            ScriptedFetcher::default()
                .then(Err(FeedError::Network("connection reset".into())))
                .then(Ok(png_bytes(1, 1))),
        );
        let url = "https://cdn.example.com/flaky.png";

        let err = cache.get_image(url).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(cache.cached_image(url).is_none());

        let image = cache.get_image(url).await.unwrap();
        assert_eq!((image.width(), image.height()), (1, 1));
        assert_eq!(fetcher.calls(), 2);
        assert!(cache.cached_image(url).is_some());
    }

    #[tokio::test]
    async fn test_load_completes_after_caller_gives_up() {
        let (cache, fetcher) = cache_with(
            ScriptedFetcher::default().then_after(Duration::from_millis(100), Ok(rss(&["late"]))),
        );

        let gave_up =
            tokio::time::timeout(Duration::from_millis(20), cache.get_feed(FEED_URL)).await;
        assert!(gave_up.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let cached = cache.cached_feed(FEED_URL).unwrap();
        assert_eq!(titles(&cached), vec!["late"]);

        // Served from the finished load, not a second fetch
        cache.get_feed(FEED_URL).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_feed_and_image_entries_are_kept_apart() {
        let (cache, fetcher) = cache_with(
            ScriptedFetcher::default()
                .then(Ok(rss(&["feed"])))
                .then(Ok(png_bytes(2, 2))),
        );
        let key = "https://example.com/shared-key";

        cache.get_feed(key).await.unwrap();
        assert!(cache.cached_image(key).is_none());

        cache.get_image(key).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert!(cache.cached_feed(key).is_some());
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let (cache, fetcher) = cache_with(ScriptedFetcher::default().then(Ok(rss(&["a"]))));
        let other = cache.clone();

        cache.get_feed(FEED_URL).await.unwrap();
        other.get_feed(FEED_URL).await.unwrap();

        assert_eq!(fetcher.calls(), 1);
    }
}
