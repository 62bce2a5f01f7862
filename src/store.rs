//! Contains the [`Backend`] trait, the per-store contract the decision core
//! consumes, together with the event record types and error taxonomy shared
//! by all backend adapters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::token::StreamToken;

/// An encoded Domain Event ready to be appended to a stream.
///
/// The payload is opaque to the core: a [Codec][crate::codec::Codec] produced
/// it and only a codec can read it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    /// Unique identifier of the event.
    pub id: Uuid,

    /// Domain name of the event, e.g. `"OrderWasPlaced"`.
    pub event_type: String,

    /// The encoded payload.
    pub data: Vec<u8>,

    /// Optional identifier correlating this event with others produced by
    /// the same logical operation.
    pub correlation_id: Option<String>,

    /// Optional identifier of the event or command that caused this one.
    pub causation_id: Option<String>,
}

impl EventData {
    pub fn new(event_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            correlation_id: None,
            causation_id: None,
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    #[must_use]
    pub fn with_causation_id(mut self, causation_id: String) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Borrowed view used by codecs to decode without caring whether the
    /// event has been persisted yet.
    pub fn as_raw(&self) -> RawEvent<'_> {
        RawEvent {
            event_type: &self.event_type,
            data: &self.data,
        }
    }

    pub(crate) fn size_in_bytes(&self) -> usize {
        self.event_type.len() + self.data.len()
    }
}

/// An [`EventData`] that has been persisted to a stream, stamped with its
/// backend event number and recording time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Zero-based backend event number; the stream version is the number of
    /// its last recorded event.
    pub event_number: i64,

    pub id: Uuid,
    pub event_type: String,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

impl RecordedEvent {
    /// Borrowed view used by codecs.
    pub fn as_raw(&self) -> RawEvent<'_> {
        RawEvent {
            event_type: &self.event_type,
            data: &self.data,
        }
    }

    pub(crate) fn size_in_bytes(&self) -> usize {
        self.event_type.len() + self.data.len()
    }
}

/// Borrowed view over an encoded event, persisted or not.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent<'a> {
    pub event_type: &'a str,
    pub data: &'a [u8],
}

/// Predicate over persisted events used to recognise origin (snapshot or
/// compaction marker) events during loads.
pub type OriginPredicate<'a> = dyn Fn(&RecordedEvent) -> bool + Send + Sync + 'a;

/// Predicate over just-written events used to recognise origin events while
/// deriving the post-sync token.
pub type WrittenPredicate<'a> = dyn Fn(&EventData) -> bool + Send + Sync + 'a;

/// Outcome of a [`Backend::try_sync`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    /// The events were appended; the token reflects the new stream tail.
    Written(StreamToken),

    /// The version precondition did not hold. The observed token is carried
    /// when the backend knows it cheaply, letting a resync policy shortcut
    /// the reload; adapters may always pass `None`.
    ConflictUnknown(Option<StreamToken>),
}

/// All possible error types returned by [`Backend`] operations.
///
/// Conflicts are not errors: they are reported through
/// [`SyncResult::ConflictUnknown`] and consumed by the decision loop.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream has been hard-deleted; no retry will succeed.
    #[error("stream {stream} has been deleted")]
    StreamDeleted { stream: String },

    /// A scan exceeded the configured page cap. Treated as fatal so that
    /// pathological streams cannot drive unbounded reads.
    #[error("reading stream {stream} exceeded the maximum of {max_batches} batches")]
    BatchLimitExceeded { stream: String, max_batches: u32 },

    /// A transport failure that outlived the adapter's internal retry
    /// budget.
    #[error("transient store failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// A protocol violation or unknown backend status.
    #[error("unexpected store failure: {0}")]
    Unexpected(#[from] anyhow::Error),
}

/// Pagination settings for a backend adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingPolicy {
    batch_size: usize,
    max_batches: Option<u32>,
}

impl Default for BatchingPolicy {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_batches: None,
        }
    }
}

impl BatchingPolicy {
    /// Creates a policy reading `batch_size` events per page; values below 1
    /// are clamped to 1.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_batches: None,
        }
    }

    /// Caps the number of pages a single scan may read before it fails with
    /// [`StoreError::BatchLimitExceeded`].
    #[must_use]
    pub fn with_max_batches(mut self, max_batches: u32) -> Self {
        self.max_batches = Some(max_batches);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_batches(&self) -> Option<u32> {
        self.max_batches
    }
}

/// The per-store contract consumed by a [Category][crate::category::Category].
///
/// Implementations translate [`StreamToken`] versions to their wire
/// protocol's expected-version field, paginate scans according to their
/// [`BatchingPolicy`], retry transient transport failures internally, and
/// emit [telemetry][crate::telemetry::Observer] records for every slice read
/// and write attempt.
///
/// All operations are cancellable by dropping the returned future; an append
/// that is in flight when the future is dropped is left to the adapter's
/// semantics.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Forward scan from `from_version` to the stream tail.
    ///
    /// When `is_origin` is supplied the returned token records the number of
    /// the last matching event in the scan as its snapshot, and carries the
    /// compaction headroom derived from the adapter's batch size.
    ///
    /// A missing stream yields an empty list and the empty-stream token.
    async fn load_batched(
        &self,
        stream: &str,
        from_version: i64,
        is_origin: Option<&OriginPredicate<'_>>,
    ) -> Result<(StreamToken, Vec<RecordedEvent>), StoreError>;

    /// Backward paged scan until the first event whose decoded form is an
    /// origin (inclusive), or the stream start.
    ///
    /// Events are returned in forward order, each paired with its decoded
    /// form when `try_decode` accepted it. The token records the origin
    /// event's number when one was found.
    async fn load_backwards_until_origin<'s, 'b, E>(
        &'s self,
        stream: &str,
        try_decode: &'b (dyn for<'r> Fn(&'r RecordedEvent) -> Option<E> + Send + Sync),
        is_origin: &'b (dyn for<'r> Fn(&'r E) -> bool + Send + Sync),
    ) -> Result<(StreamToken, Vec<(RecordedEvent, Option<E>)>), StoreError>
    where
        E: Send + 'async_trait,
        's: 'b;

    /// Forward scan of the tail written after `token`, starting at
    /// `token.stream_version + 1`.
    ///
    /// `use_write_conn` requests the leader connection on adapters that
    /// split read and write handles, so that a conflict-driven reload
    /// observes the freshest tail.
    async fn load_from_token(
        &self,
        use_write_conn: bool,
        stream: &str,
        token: &StreamToken,
        is_origin: Option<&OriginPredicate<'_>>,
    ) -> Result<(StreamToken, Vec<RecordedEvent>), StoreError>;

    /// Appends `events` under the version precondition carried by
    /// `expected`.
    ///
    /// On success the returned token records the new tail; when `is_origin`
    /// is supplied, the just-written batch is searched backward for an
    /// origin event to update the snapshot number, otherwise the previous
    /// snapshot is carried forward with its capacity reduced by the batch
    /// length.
    async fn try_sync(
        &self,
        stream: &str,
        expected: &StreamToken,
        events: Vec<EventData>,
        is_origin: Option<&WrittenPredicate<'_>>,
    ) -> Result<SyncResult, StoreError>;

    /// Token for a stream assumed to be empty, synthesized without I/O.
    ///
    /// `compacting` requests the compaction headroom metadata used by
    /// snapshot-aware access strategies.
    fn empty_token(&self, compacting: bool) -> StreamToken;
}
