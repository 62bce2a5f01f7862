//! Contains the [`StreamToken`] type, the opaque position handle that travels
//! between loads and syncs for Optimistic Locking through versioning.

use serde::{Deserialize, Serialize};

/// Backend-native version of the empty stream.
pub(crate) const EMPTY_STREAM_VERSION: i64 = -1;

/// Marker value used by backends that do not measure stream sizes.
pub(crate) const UNMEASURED_BYTES: i64 = -1;

/// An opaque handle to a position in an Event Stream.
///
/// A token is produced by a [Backend][crate::store::Backend] on every load and
/// successful sync, and is passed back on the next sync as the optimistic
/// concurrency precondition. Besides the stream version it carries
/// backend-derived metadata: the number of the most recent snapshot (origin)
/// event, the remaining append headroom before another compaction snapshot is
/// warranted, and a stream size hint.
///
/// Tokens are serialisable so that a memento obtained from a
/// [SyncContext][crate::decider::SyncContext] can outlive the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamToken {
    /// Backend-native version: the number of the last persisted event,
    /// or -1 for the empty stream.
    pub(crate) stream_version: i64,

    /// Backend event number of the most recent event acting as an origin
    /// (snapshot or compaction marker) for this stream.
    pub(crate) snapshot_event_number: Option<i64>,

    /// Remaining events that can be appended before another compaction
    /// snapshot is warranted. Only present when the stream is accessed
    /// through a compaction strategy.
    pub(crate) batch_capacity_limit: Option<i64>,

    /// Size hint for the stream, or [`UNMEASURED_BYTES`] when the backend
    /// does not measure sizes.
    pub(crate) stream_bytes: i64,
}

impl StreamToken {
    pub(crate) fn new(stream_version: i64) -> Self {
        Self {
            stream_version,
            snapshot_event_number: None,
            batch_capacity_limit: None,
            stream_bytes: UNMEASURED_BYTES,
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(EMPTY_STREAM_VERSION)
    }

    pub(crate) fn with_snapshot(mut self, snapshot_event_number: Option<i64>) -> Self {
        self.snapshot_event_number = snapshot_event_number;
        self
    }

    /// Computes the remaining append headroom for a compaction strategy.
    ///
    /// The capacity counts the events appended since the last known origin
    /// event (the whole stream when none is known) against `batch_size`,
    /// minus any events the caller holds but has not stored yet.
    pub(crate) fn with_capacity(mut self, batch_size: usize, unstored_pending: usize) -> Self {
        let origin = self.snapshot_event_number.unwrap_or(EMPTY_STREAM_VERSION);
        let stored_since_origin = self.stream_version - origin + 1;
        let capacity = batch_size as i64 - unstored_pending as i64 - stored_since_origin;

        self.batch_capacity_limit = Some(capacity.max(0));
        self
    }

    pub(crate) fn with_bytes(mut self, stream_bytes: i64) -> Self {
        self.stream_bytes = stream_bytes;
        self
    }

    /// The monotonic count of events persisted in the stream; 0 for the
    /// empty stream.
    pub fn version(&self) -> u64 {
        (self.stream_version + 1) as u64
    }

    /// Size of the stream in bytes, when the backend measures it.
    pub fn stream_bytes(&self) -> Option<i64> {
        (self.stream_bytes != UNMEASURED_BYTES).then_some(self.stream_bytes)
    }

    /// Whether this token refers to a strictly more recent stream position
    /// than `other`.
    ///
    /// The relation arbitrates concurrent cache updates: an older
    /// `(token, state)` pair can never overwrite a newer one.
    pub fn supersedes(&self, other: &StreamToken) -> bool {
        self.stream_version > other.stream_version
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_counts_persisted_events() {
        assert_eq!(0, StreamToken::empty().version());
        assert_eq!(1, StreamToken::new(0).version());
        assert_eq!(42, StreamToken::new(41).version());
    }

    #[test]
    fn capacity_without_a_known_snapshot_counts_the_whole_stream() {
        // batch_size 4, stream holds events 0..=2: the next snapshot is
        // already overdue.
        let token = StreamToken::new(2).with_capacity(4, 0);
        assert_eq!(Some(0), token.batch_capacity_limit);

        let token = StreamToken::empty().with_capacity(4, 0);
        assert_eq!(Some(3), token.batch_capacity_limit);
    }

    #[test]
    fn capacity_counts_from_the_snapshot_event() {
        // Snapshot at event 2, stream tail at event 4: three of the four
        // batch slots are used by events 2..=4.
        let token = StreamToken::new(4)
            .with_snapshot(Some(2))
            .with_capacity(4, 0);
        assert_eq!(Some(1), token.batch_capacity_limit);

        let token = StreamToken::new(3)
            .with_snapshot(Some(2))
            .with_capacity(4, 0);
        assert_eq!(Some(2), token.batch_capacity_limit);
    }

    #[test]
    fn capacity_subtracts_unstored_pending_events_and_never_goes_negative() {
        let token = StreamToken::new(1).with_capacity(8, 3);
        assert_eq!(Some(2), token.batch_capacity_limit);

        let token = StreamToken::new(6).with_capacity(4, 5);
        assert_eq!(Some(0), token.batch_capacity_limit);
    }

    #[test]
    fn supersedes_is_ordered_by_stream_version() {
        let older = StreamToken::new(3);
        let newer = StreamToken::new(5);

        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        assert!(!older.supersedes(&older));
    }

    #[test]
    fn token_round_trips_through_serde() {
        let token = StreamToken::new(7)
            .with_snapshot(Some(4))
            .with_capacity(10, 0)
            .with_bytes(2048);

        let raw = serde_json::to_vec(&token).unwrap();
        let decoded: StreamToken = serde_json::from_slice(&raw).unwrap();

        assert_eq!(token, decoded);
    }
}
