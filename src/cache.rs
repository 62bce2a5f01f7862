//! Contains the stream-state cache: a keyed store of `(token, state)` pairs
//! with supersede-guarded updates and sliding or fixed expiration, plus the
//! [`CachingStrategy`] variants a [Category][crate::category::Category] can
//! be wired with.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::token::StreamToken;

/// Lifetime policy for one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// The entry expires at the given instant, however often it is read.
    Absolute(Instant),

    /// The entry expires when it has not been read for the given window;
    /// every read slides the deadline forward.
    Sliding(Duration),
}

impl Expiration {
    fn deadline(self, now: Instant) -> Instant {
        match self {
            Expiration::Absolute(at) => at,
            Expiration::Sliding(window) => now + window,
        }
    }
}

#[derive(Debug)]
struct Slot<S> {
    token: StreamToken,
    state: S,
    expiration: Expiration,
    deadline: Instant,
    touched: Instant,
}

struct Entry<S> {
    slot: Mutex<Slot<S>>,
}

/// A bounded, thread-safe store of `(token, state)` pairs keyed by stream.
///
/// Entries are optional and reconstructible: eviction or expiration only
/// costs a reload. Mutation goes through [`update_if_newer`], which keeps
/// cache writes ordered by [`StreamToken::supersedes`] so that an older pair
/// can never overwrite a newer one, even under concurrent completion.
///
/// Each entry carries its own lock; readers of one stream never contend with
/// writers of another.
///
/// [`update_if_newer`]: StateCache::update_if_newer
pub struct StateCache<S> {
    entries: Mutex<HashMap<String, Arc<Entry<S>>>>,
    max_entries: usize,
}

impl<S> fmt::Debug for StateCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCache")
            .field("len", &self.entries.lock().len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl<S> Default for StateCache<S> {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl<S> StateCache<S> {
    /// Creates a cache holding at most `max_entries` streams; values below 1
    /// are clamped to 1.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }
}

impl<S> StateCache<S>
where
    S: Clone,
{
    /// Returns the cached `(token, state)` pair for `key`, unless the entry
    /// has expired. Reading an entry under a sliding policy pushes its
    /// deadline forward.
    pub fn try_get(&self, key: &str) -> Option<(StreamToken, S)> {
        let entry = self.entries.lock().get(key).cloned()?;

        let now = Instant::now();
        let mut slot = entry.slot.lock();

        if now >= slot.deadline {
            return None;
        }

        slot.touched = now;
        if let Expiration::Sliding(window) = slot.expiration {
            slot.deadline = now + window;
        }

        Some((slot.token, slot.state.clone()))
    }

    /// Inserts or refreshes the entry for `key`.
    ///
    /// An absent entry is inserted with the given expiration policy. A
    /// present entry is replaced only when `token` supersedes the incumbent
    /// token; otherwise the update is discarded.
    pub fn update_if_newer(&self, key: &str, expiration: Expiration, token: StreamToken, state: S) {
        let now = Instant::now();

        let entry = {
            let mut entries = self.entries.lock();

            if let Some(entry) = entries.get(key) {
                entry.clone()
            } else {
                if entries.len() >= self.max_entries {
                    Self::evict_one(&mut entries, now);
                }

                entries.insert(
                    key.to_owned(),
                    Arc::new(Entry {
                        slot: Mutex::new(Slot {
                            token,
                            state,
                            expiration,
                            deadline: expiration.deadline(now),
                            touched: now,
                        }),
                    }),
                );

                return;
            }
        };

        let mut slot = entry.slot.lock();

        if token.supersedes(&slot.token) || now >= slot.deadline {
            *slot = Slot {
                token,
                state,
                expiration,
                deadline: expiration.deadline(now),
                touched: now,
            };
        }
    }

    /// Drops one entry to make room: an expired one when available,
    /// otherwise the least recently touched.
    fn evict_one(entries: &mut HashMap<String, Arc<Entry<S>>>, now: Instant) {
        let mut expired: Option<String> = None;
        let mut oldest: Option<(String, Instant)> = None;

        for (key, entry) in entries.iter() {
            let slot = entry.slot.lock();

            if now >= slot.deadline {
                expired = Some(key.clone());
                break;
            }

            match &oldest {
                Some((_, touched)) if slot.touched >= *touched => {},
                _ => oldest = Some((key.clone(), slot.touched)),
            }
        }

        if let Some(key) = expired.or_else(|| oldest.map(|(key, _)| key)) {
            entries.remove(&key);
        }
    }
}

/// Caching strategy wired into a [Category][crate::category::Category],
/// binding a shared [`StateCache`] to an expiration policy.
#[derive(Clone)]
pub enum CachingStrategy<S> {
    /// Each access refreshes the entry's time-to-live; expiration triggers a
    /// full reload.
    SlidingWindow {
        cache: Arc<StateCache<S>>,
        window: Duration,
    },

    /// Entries expire a fixed period after insertion, however often they are
    /// read.
    FixedTimeSpan {
        cache: Arc<StateCache<S>>,
        period: Duration,
    },

    /// Identical to [`SlidingWindow`][CachingStrategy::SlidingWindow], but
    /// keys are prefixed to permit multiple folds over the same stream.
    SlidingWindowPrefixed {
        cache: Arc<StateCache<S>>,
        window: Duration,
        prefix: String,
    },
}

impl<S> fmt::Debug for CachingStrategy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachingStrategy::SlidingWindow { window, .. } => f
                .debug_struct("SlidingWindow")
                .field("window", window)
                .finish_non_exhaustive(),
            CachingStrategy::FixedTimeSpan { period, .. } => f
                .debug_struct("FixedTimeSpan")
                .field("period", period)
                .finish_non_exhaustive(),
            CachingStrategy::SlidingWindowPrefixed { window, prefix, .. } => f
                .debug_struct("SlidingWindowPrefixed")
                .field("window", window)
                .field("prefix", prefix)
                .finish_non_exhaustive(),
        }
    }
}

impl<S> CachingStrategy<S> {
    pub(crate) fn cache(&self) -> &StateCache<S> {
        match self {
            CachingStrategy::SlidingWindow { cache, .. }
            | CachingStrategy::FixedTimeSpan { cache, .. }
            | CachingStrategy::SlidingWindowPrefixed { cache, .. } => cache,
        }
    }

    pub(crate) fn key(&self, stream: &str) -> String {
        match self {
            CachingStrategy::SlidingWindowPrefixed { prefix, .. } => format!("{prefix}{stream}"),
            _ => stream.to_owned(),
        }
    }

    /// The expiration policy to apply on the next insert or refresh.
    pub(crate) fn expiration(&self) -> Expiration {
        match self {
            CachingStrategy::SlidingWindow { window, .. }
            | CachingStrategy::SlidingWindowPrefixed { window, .. } => Expiration::Sliding(*window),
            CachingStrategy::FixedTimeSpan { period, .. } => {
                Expiration::Absolute(Instant::now() + *period)
            },
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    fn sliding(window_ms: u64) -> Expiration {
        Expiration::Sliding(Duration::from_millis(window_ms))
    }

    #[test]
    fn missing_keys_are_cache_misses() {
        let cache = StateCache::<u64>::default();
        assert_eq!(None, cache.try_get("Counter-1"));
    }

    #[test]
    fn newer_tokens_replace_older_entries() {
        let cache = StateCache::<u64>::default();

        cache.update_if_newer("Counter-1", sliding(1_000), StreamToken::new(2), 3);
        cache.update_if_newer("Counter-1", sliding(1_000), StreamToken::new(4), 5);

        let (token, state) = cache.try_get("Counter-1").unwrap();
        assert_eq!(5, token.version());
        assert_eq!(5, state);
    }

    #[test]
    fn older_tokens_never_overwrite_newer_entries() {
        let cache = StateCache::<u64>::default();

        cache.update_if_newer("Counter-1", sliding(1_000), StreamToken::new(4), 5);
        cache.update_if_newer("Counter-1", sliding(1_000), StreamToken::new(2), 3);

        let (token, state) = cache.try_get("Counter-1").unwrap();
        assert_eq!(5, token.version());
        assert_eq!(5, state);
    }

    #[test]
    fn concurrent_updates_settle_on_the_superseding_entry() {
        let cache = Arc::new(StateCache::<u64>::default());

        for _ in 0..100 {
            let a = {
                let cache = cache.clone();
                thread::spawn(move || {
                    cache.update_if_newer("Counter-1", sliding(1_000), StreamToken::new(1), 10);
                })
            };
            let b = {
                let cache = cache.clone();
                thread::spawn(move || {
                    cache.update_if_newer("Counter-1", sliding(1_000), StreamToken::new(2), 20);
                })
            };

            a.join().unwrap();
            b.join().unwrap();

            let (token, state) = cache.try_get("Counter-1").unwrap();
            assert_eq!(3, token.version());
            assert_eq!(20, state);
        }
    }

    #[test]
    fn absolute_entries_expire_regardless_of_reads() {
        let cache = StateCache::<u64>::default();
        let expiration = Expiration::Absolute(Instant::now() + Duration::from_millis(30));

        cache.update_if_newer("Counter-1", expiration, StreamToken::new(0), 1);
        assert!(cache.try_get("Counter-1").is_some());

        thread::sleep(Duration::from_millis(50));
        assert_eq!(None, cache.try_get("Counter-1"));
    }

    #[test]
    fn sliding_entries_stay_alive_while_read() {
        let cache = StateCache::<u64>::default();

        cache.update_if_newer("Counter-1", sliding(60), StreamToken::new(0), 1);

        for _ in 0..4 {
            thread::sleep(Duration::from_millis(30));
            assert!(cache.try_get("Counter-1").is_some());
        }

        thread::sleep(Duration::from_millis(90));
        assert_eq!(None, cache.try_get("Counter-1"));
    }

    #[test]
    fn expired_entries_accept_non_superseding_updates() {
        let cache = StateCache::<u64>::default();
        let expired = Expiration::Absolute(Instant::now() - Duration::from_millis(1));

        cache.update_if_newer("Counter-1", expired, StreamToken::new(5), 6);
        cache.update_if_newer("Counter-1", sliding(1_000), StreamToken::new(5), 7);

        let (_, state) = cache.try_get("Counter-1").unwrap();
        assert_eq!(7, state);
    }

    #[test]
    fn the_cache_stays_within_its_size_bound() {
        let cache = StateCache::<u64>::new(2);

        cache.update_if_newer("Counter-1", sliding(1_000), StreamToken::new(0), 1);
        thread::sleep(Duration::from_millis(5));
        cache.update_if_newer("Counter-2", sliding(1_000), StreamToken::new(0), 2);
        thread::sleep(Duration::from_millis(5));

        // Touch the oldest entry so the middle one becomes the eviction
        // candidate.
        cache.try_get("Counter-1");
        cache.update_if_newer("Counter-3", sliding(1_000), StreamToken::new(0), 3);

        assert!(cache.try_get("Counter-1").is_some());
        assert_eq!(None, cache.try_get("Counter-2"));
        assert!(cache.try_get("Counter-3").is_some());
    }

    #[test]
    fn prefixed_strategies_scope_their_keys() {
        let cache = Arc::new(StateCache::<u64>::default());

        let plain = CachingStrategy::SlidingWindow {
            cache: cache.clone(),
            window: Duration::from_secs(1),
        };
        let prefixed = CachingStrategy::SlidingWindowPrefixed {
            cache: cache.clone(),
            window: Duration::from_secs(1),
            prefix: "totals:".to_owned(),
        };

        assert_eq!("Counter-1", plain.key("Counter-1"));
        assert_eq!("totals:Counter-1", prefixed.key("Counter-1"));
    }
}
