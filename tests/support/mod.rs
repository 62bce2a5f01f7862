//! Shared fixtures for the integration suites: a small value-assignment
//! domain and a call-counting [`Backend`] decorator.

#![allow(dead_code)] // Each integration suite uses its own slice of this module.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use steadily::category::{AccessStrategy, Category, Fold};
use steadily::codec::{EventType, Json};
use steadily::memory::MemoryStore;
use steadily::store::{
    Backend, EventData, OriginPredicate, RecordedEvent, StoreError, SyncResult, WrittenPredicate,
};
use steadily::token::StreamToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueEvent {
    Assigned { value: i64 },
    Snapshotted { value: Option<i64> },
}

impl EventType for ValueEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ValueEvent::Assigned { .. } => "ValueAssigned",
            ValueEvent::Snapshotted { .. } => "ValueSnapshotted",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueState {
    pub value: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValueFold;

impl Fold for ValueFold {
    type State = ValueState;
    type Event = ValueEvent;

    fn initial(&self) -> ValueState {
        ValueState::default()
    }

    fn fold(&self, state: ValueState, events: Vec<ValueEvent>) -> ValueState {
        events.into_iter().fold(state, |_, event| match event {
            ValueEvent::Assigned { value } => ValueState { value: Some(value) },
            ValueEvent::Snapshotted { value } => ValueState { value },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    Set(i64),
    AlreadySet(i64),
}

/// Assigns `value` unless the state already holds it.
pub fn decide_assign(
    value: i64,
) -> impl Fn(&ValueState) -> (AssignOutcome, Vec<ValueEvent>) + Send + Sync {
    move |state| match state.value {
        Some(current) if current == value => (AssignOutcome::AlreadySet(current), Vec::new()),
        _ => (
            AssignOutcome::Set(value),
            vec![ValueEvent::Assigned { value }],
        ),
    }
}

pub fn interpret_assign(value: i64) -> impl Fn(&ValueState) -> Vec<ValueEvent> + Send + Sync {
    move |_| vec![ValueEvent::Assigned { value }]
}

/// The rolling-snapshots access strategy of the value domain.
pub fn snapshot_access() -> AccessStrategy<ValueFold> {
    AccessStrategy::RollingSnapshots {
        is_origin: Arc::new(|event| matches!(event, ValueEvent::Snapshotted { .. })),
        to_snapshot: Arc::new(|state: &ValueState| ValueEvent::Snapshotted { value: state.value }),
    }
}

pub fn value_category(store: &CountingStore) -> Category<ValueFold, CountingStore> {
    Category::new(
        "Value",
        Arc::new(store.clone()),
        Arc::new(Json::<ValueEvent>::default()),
        ValueFold,
    )
}

/// Number of calls observed per [`Backend`] operation.
#[derive(Debug, Clone, Default)]
pub struct Counts {
    load_batched: Arc<AtomicUsize>,
    load_backwards: Arc<AtomicUsize>,
    load_from_token: Arc<AtomicUsize>,
    try_sync: Arc<AtomicUsize>,
}

impl Counts {
    pub fn load_batched(&self) -> usize {
        self.load_batched.load(Ordering::SeqCst)
    }

    pub fn load_backwards(&self) -> usize {
        self.load_backwards.load(Ordering::SeqCst)
    }

    pub fn load_from_token(&self) -> usize {
        self.load_from_token.load(Ordering::SeqCst)
    }

    pub fn try_sync(&self) -> usize {
        self.try_sync.load(Ordering::SeqCst)
    }
}

/// Decorator over [`MemoryStore`] counting the calls made through the
/// [`Backend`] contract, so suites can assert on the I/O a load strategy
/// actually performed.
#[derive(Clone)]
pub struct CountingStore {
    inner: MemoryStore,
    pub counts: Counts,
}

impl Default for CountingStore {
    fn default() -> Self {
        Self::new(MemoryStore::default())
    }
}

impl CountingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            counts: Counts::default(),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl Backend for CountingStore {
    async fn load_batched(
        &self,
        stream: &str,
        from_version: i64,
        is_origin: Option<&OriginPredicate<'_>>,
    ) -> Result<(StreamToken, Vec<RecordedEvent>), StoreError> {
        self.counts.load_batched.fetch_add(1, Ordering::SeqCst);
        self.inner.load_batched(stream, from_version, is_origin).await
    }

    async fn load_backwards_until_origin<'s, 'b, E>(
        &'s self,
        stream: &str,
        try_decode: &'b (dyn for<'r> Fn(&'r RecordedEvent) -> Option<E> + Send + Sync),
        is_origin: &'b (dyn for<'r> Fn(&'r E) -> bool + Send + Sync),
    ) -> Result<(StreamToken, Vec<(RecordedEvent, Option<E>)>), StoreError>
    where
        E: Send + 'async_trait,
        's: 'b,
    {
        self.counts.load_backwards.fetch_add(1, Ordering::SeqCst);
        self.inner
            .load_backwards_until_origin(stream, try_decode, is_origin)
            .await
    }

    async fn load_from_token(
        &self,
        use_write_conn: bool,
        stream: &str,
        token: &StreamToken,
        is_origin: Option<&OriginPredicate<'_>>,
    ) -> Result<(StreamToken, Vec<RecordedEvent>), StoreError> {
        self.counts.load_from_token.fetch_add(1, Ordering::SeqCst);
        self.inner
            .load_from_token(use_write_conn, stream, token, is_origin)
            .await
    }

    async fn try_sync(
        &self,
        stream: &str,
        expected: &StreamToken,
        events: Vec<EventData>,
        is_origin: Option<&WrittenPredicate<'_>>,
    ) -> Result<SyncResult, StoreError> {
        self.counts.try_sync.fetch_add(1, Ordering::SeqCst);
        self.inner.try_sync(stream, expected, events, is_origin).await
    }

    fn empty_token(&self, compacting: bool) -> StreamToken {
        self.inner.empty_token(compacting)
    }
}
