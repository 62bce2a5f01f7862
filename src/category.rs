//! Contains the [`Category`] type: the per-stream-category policy binding a
//! codec, a fold, an access strategy and an optional caching strategy to a
//! [Backend][crate::store::Backend], and selecting the load algorithm used
//! to reconstitute stream state.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::CachingStrategy;
use crate::codec::Codec;
use crate::compaction::CompactionContext;
use crate::store::{Backend, EventData, RecordedEvent, SyncResult, WrittenPredicate};
use crate::token::StreamToken;
use crate::Error;

/// The left-fold reconstituting a category's state from its Domain Events.
pub trait Fold: Send + Sync {
    /// The state produced by folding; cloned on every decision attempt.
    type State: Clone + Send + Sync;

    /// The category's Domain Event type.
    type Event: Send + Sync + 'static;

    /// State of a stream with no events.
    fn initial(&self) -> Self::State;

    /// Folds the given events, in stream order, onto `state`.
    fn fold(&self, state: Self::State, events: Vec<Self::Event>) -> Self::State;
}

/// Identifier of an Event Stream.
///
/// The core treats stream names as opaque; [`StreamName::compose`] builds the
/// conventional category-prefixed composite form for applications that want
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamName(String);

impl StreamName {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Builds a `Category-id1_id2` composite name.
    pub fn compose(category: &str, ids: &[&str]) -> Self {
        Self(format!("{}-{}", category, ids.join("_")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a category reads its streams and whether it compacts them.
pub enum AccessStrategy<F>
where
    F: Fold,
{
    /// Forward scan from the stream start; no compaction.
    Unrestricted,

    /// Only the single most recent event is required to reconstitute state:
    /// loads scan backward and stop at the newest decodable event.
    ///
    /// Incompatible with caching -- the short-circuit read is strictly
    /// cheaper than a cache probe would be.
    LatestKnownEvent,

    /// Forward reads short-circuit at the most recent event for which
    /// `is_origin` holds; syncs that would outrun the stream's batch window
    /// fold an extra `to_snapshot` event into the write batch, keeping a
    /// snapshot within the last `batch_size` events.
    RollingSnapshots {
        is_origin: Arc<dyn Fn(&F::Event) -> bool + Send + Sync>,
        to_snapshot: Arc<dyn Fn(&F::State) -> F::Event + Send + Sync>,
    },
}

impl<F> Clone for AccessStrategy<F>
where
    F: Fold,
{
    fn clone(&self) -> Self {
        match self {
            AccessStrategy::Unrestricted => AccessStrategy::Unrestricted,
            AccessStrategy::LatestKnownEvent => AccessStrategy::LatestKnownEvent,
            AccessStrategy::RollingSnapshots {
                is_origin,
                to_snapshot,
            } => AccessStrategy::RollingSnapshots {
                is_origin: is_origin.clone(),
                to_snapshot: to_snapshot.clone(),
            },
        }
    }
}

impl<F> fmt::Debug for AccessStrategy<F>
where
    F: Fold,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessStrategy::Unrestricted => f.write_str("Unrestricted"),
            AccessStrategy::LatestKnownEvent => f.write_str("LatestKnownEvent"),
            AccessStrategy::RollingSnapshots { .. } => f.write_str("RollingSnapshots"),
        }
    }
}

/// Outcome of a [`Category::sync`] attempt, consumed by the decision loop.
#[derive(Debug)]
pub(crate) enum SyncOutcome<S> {
    Written { token: StreamToken, state: S },
    Conflict { actual: Option<StreamToken> },
}

/// A stream category: all the streams sharing one event type, fold, access
/// strategy and caching policy.
///
/// The category selects the load algorithm from its access strategy, decodes
/// tolerantly (events the codec does not understand are skipped), and keeps
/// the bound cache coherent across loads and syncs.
pub struct Category<F, B>
where
    F: Fold,
    B: Backend,
{
    name: String,
    backend: Arc<B>,
    codec: Arc<dyn Codec<F::Event>>,
    fold: F,
    access: AccessStrategy<F>,
    caching: Option<CachingStrategy<F::State>>,
}

impl<F, B> Category<F, B>
where
    F: Fold,
    B: Backend,
{
    /// Creates a category with the [`Unrestricted`][AccessStrategy::Unrestricted]
    /// access strategy and no cache.
    pub fn new(
        name: impl Into<String>,
        backend: Arc<B>,
        codec: Arc<dyn Codec<F::Event>>,
        fold: F,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            codec,
            fold,
            access: AccessStrategy::Unrestricted,
            caching: None,
        }
    }

    /// Replaces the access strategy.
    ///
    /// # Errors
    ///
    /// Rejects [`AccessStrategy::LatestKnownEvent`] when a caching strategy
    /// is already bound.
    pub fn with_access(mut self, access: AccessStrategy<F>) -> Result<Self, Error> {
        if self.caching.is_some() && matches!(access, AccessStrategy::LatestKnownEvent) {
            return Err(Error::InvalidConfig {
                reason: "LatestKnownEvent cannot be combined with a cache".to_owned(),
            });
        }

        self.access = access;
        Ok(self)
    }

    /// Binds a caching strategy.
    ///
    /// # Errors
    ///
    /// Rejects any cache when the access strategy is
    /// [`AccessStrategy::LatestKnownEvent`].
    pub fn with_caching(mut self, caching: CachingStrategy<F::State>) -> Result<Self, Error> {
        if matches!(self.access, AccessStrategy::LatestKnownEvent) {
            return Err(Error::InvalidConfig {
                reason: "LatestKnownEvent cannot be combined with a cache".to_owned(),
            });
        }

        self.caching = Some(caching);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn initial_state(&self) -> F::State {
        self.fold.initial()
    }

    pub(crate) fn empty_token(&self) -> StreamToken {
        self.backend.empty_token(self.is_compacting())
    }

    fn is_compacting(&self) -> bool {
        matches!(self.access, AccessStrategy::RollingSnapshots { .. })
    }

    /// Append headroom only exists under a compaction strategy;
    /// `LatestKnownEvent` shares the backward-scan load path, so headroom
    /// reported by the backend is cleared from its tokens here.
    fn finish_token(&self, mut token: StreamToken) -> StreamToken {
        if !self.is_compacting() {
            token.batch_capacity_limit = None;
        }
        token
    }

    fn decode_all(&self, events: &[RecordedEvent]) -> Vec<F::Event> {
        events
            .iter()
            .filter_map(|event| self.codec.try_decode(event.as_raw()))
            .collect()
    }

    /// Origin predicate over persisted events, for the forward load paths.
    fn load_predicate(
        &self,
    ) -> Option<Box<dyn Fn(&RecordedEvent) -> bool + Send + Sync + 'static>> {
        match &self.access {
            AccessStrategy::Unrestricted => None,
            AccessStrategy::LatestKnownEvent => {
                let codec = self.codec.clone();
                Some(Box::new(move |event| {
                    codec.try_decode(event.as_raw()).is_some()
                }))
            },
            AccessStrategy::RollingSnapshots { is_origin, .. } => {
                let codec = self.codec.clone();
                let is_origin = is_origin.clone();
                Some(Box::new(move |event| {
                    codec
                        .try_decode(event.as_raw())
                        .map_or(false, |event| (*is_origin)(&event))
                }))
            },
        }
    }

    /// Origin predicate over just-written events, for post-sync token
    /// derivation.
    fn written_predicate(&self) -> Option<Box<WrittenPredicate<'static>>> {
        match &self.access {
            AccessStrategy::Unrestricted => None,
            AccessStrategy::LatestKnownEvent => Some(Box::new(|_| true)),
            AccessStrategy::RollingSnapshots { is_origin, .. } => {
                let codec = self.codec.clone();
                let is_origin = is_origin.clone();
                Some(Box::new(move |event: &EventData| {
                    codec
                        .try_decode(event.as_raw())
                        .map_or(false, |event| (*is_origin)(&event))
                }))
            },
        }
    }

    /// Loads `(token, state)` per the category's policy.
    ///
    /// With a cache bound: a hit is returned as-is when `allow_stale`,
    /// otherwise only the tail past the cached token is replayed; a miss
    /// falls back to the full load and seeds the cache.
    #[tracing::instrument(level = "debug", skip_all, fields(category = %self.name, stream = %stream, allow_stale = allow_stale))]
    pub(crate) async fn load(
        &self,
        stream: &str,
        allow_stale: bool,
    ) -> Result<(StreamToken, F::State), Error> {
        let Some(caching) = &self.caching else {
            return self.load_fresh(stream).await;
        };

        let key = caching.key(stream);

        match caching.cache().try_get(&key) {
            Some((token, state)) if allow_stale => Ok((token, state)),
            Some((token, state)) => {
                let (token, state) = self.load_from_token(false, stream, token, state).await?;
                caching
                    .cache()
                    .update_if_newer(&key, caching.expiration(), token, state.clone());
                Ok((token, state))
            },
            None => {
                let (token, state) = self.load_fresh(stream).await?;
                caching
                    .cache()
                    .update_if_newer(&key, caching.expiration(), token, state.clone());
                Ok((token, state))
            },
        }
    }

    /// Full load through the access strategy's algorithm, bypassing the
    /// cache.
    async fn load_fresh(&self, stream: &str) -> Result<(StreamToken, F::State), Error> {
        match &self.access {
            AccessStrategy::Unrestricted => {
                let (token, events) = self.backend.load_batched(stream, 0, None).await?;
                let decoded = self.decode_all(&events);

                Ok((token, self.fold.fold(self.fold.initial(), decoded)))
            },
            AccessStrategy::LatestKnownEvent => {
                let try_decode =
                    |event: &RecordedEvent| self.codec.try_decode(event.as_raw());
                let is_origin = |_: &F::Event| true;

                let (token, events) = self
                    .backend
                    .load_backwards_until_origin(stream, &try_decode, &is_origin)
                    .await?;

                let decoded = events.into_iter().filter_map(|(_, event)| event).collect();

                Ok((
                    self.finish_token(token),
                    self.fold.fold(self.fold.initial(), decoded),
                ))
            },
            AccessStrategy::RollingSnapshots { is_origin, .. } => {
                let try_decode =
                    |event: &RecordedEvent| self.codec.try_decode(event.as_raw());
                let matches_origin = |event: &F::Event| (**is_origin)(event);

                let (token, events) = self
                    .backend
                    .load_backwards_until_origin(stream, &try_decode, &matches_origin)
                    .await?;

                let decoded = events.into_iter().filter_map(|(_, event)| event).collect();

                Ok((token, self.fold.fold(self.fold.initial(), decoded)))
            },
        }
    }

    /// Replays the tail past `token` and folds it onto `state`.
    #[tracing::instrument(level = "debug", skip_all, fields(category = %self.name, stream = %stream))]
    pub(crate) async fn load_from_token(
        &self,
        use_write_conn: bool,
        stream: &str,
        token: StreamToken,
        state: F::State,
    ) -> Result<(StreamToken, F::State), Error> {
        let predicate = self.load_predicate();

        let (token, tail) = self
            .backend
            .load_from_token(use_write_conn, stream, &token, predicate.as_deref())
            .await?;

        let decoded = self.decode_all(&tail);

        Ok((self.finish_token(token), self.fold.fold(state, decoded)))
    }

    /// Encodes and appends the decision's events under `token`'s version
    /// precondition, folding in a rolling snapshot when the batch outruns
    /// the stream's compaction headroom.
    ///
    /// On a successful write the bound cache is refreshed in-band.
    #[tracing::instrument(level = "debug", skip_all, fields(category = %self.name, stream = %stream, count = events.len()))]
    pub(crate) async fn sync(
        &self,
        stream: &str,
        token: StreamToken,
        state: F::State,
        events: Vec<F::Event>,
    ) -> Result<SyncOutcome<F::State>, Error> {
        let mut encoded: Vec<EventData> = events.iter().map(|e| self.codec.encode(e)).collect();
        let mut new_state = self.fold.fold(state, events);

        if let AccessStrategy::RollingSnapshots { to_snapshot, .. } = &self.access {
            let due = CompactionContext::from_token(encoded.len(), &token)
                .map_or(false, |ctx| ctx.is_compaction_due());

            if due {
                let snapshot = (**to_snapshot)(&new_state);
                encoded.push(self.codec.encode(&snapshot));
                new_state = self.fold.fold(new_state, vec![snapshot]);
            }
        }

        let predicate = self.written_predicate();

        match self
            .backend
            .try_sync(stream, &token, encoded, predicate.as_deref())
            .await?
        {
            SyncResult::Written(token) => {
                let token = self.finish_token(token);

                if let Some(caching) = &self.caching {
                    let key = caching.key(stream);
                    caching.cache().update_if_newer(
                        &key,
                        caching.expiration(),
                        token,
                        new_state.clone(),
                    );
                }

                Ok(SyncOutcome::Written {
                    token,
                    state: new_state,
                })
            },
            SyncResult::ConflictUnknown(actual) => Ok(SyncOutcome::Conflict { actual }),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::cache::StateCache;
    use crate::codec::{EventType, Json};
    use crate::memory::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    enum CounterEvent {
        Incremented,
    }

    impl EventType for CounterEvent {
        fn event_type(&self) -> &'static str {
            "Incremented"
        }
    }

    struct CounterFold;

    impl Fold for CounterFold {
        type State = u64;
        type Event = CounterEvent;

        fn initial(&self) -> u64 {
            0
        }

        fn fold(&self, state: u64, events: Vec<CounterEvent>) -> u64 {
            state + events.len() as u64
        }
    }

    fn category() -> Category<CounterFold, MemoryStore> {
        Category::new(
            "Counter",
            Arc::new(MemoryStore::default()),
            Arc::new(Json::<CounterEvent>::default()),
            CounterFold,
        )
    }

    fn caching() -> CachingStrategy<u64> {
        CachingStrategy::SlidingWindow {
            cache: Arc::new(StateCache::default()),
            window: Duration::from_secs(60),
        }
    }

    #[test]
    fn stream_names_compose_the_category_prefixed_form() {
        assert_eq!(
            "Counter-a1_b2",
            StreamName::compose("Counter", &["a1", "b2"]).as_str()
        );
        assert_eq!("Counter-a1", StreamName::compose("Counter", &["a1"]).as_str());
    }

    #[test]
    fn latest_known_event_rejects_an_existing_cache() {
        let result = category()
            .with_caching(caching())
            .unwrap()
            .with_access(AccessStrategy::LatestKnownEvent);

        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn caching_rejects_an_existing_latest_known_event_strategy() {
        let result = category()
            .with_access(AccessStrategy::LatestKnownEvent)
            .unwrap()
            .with_caching(caching());

        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
