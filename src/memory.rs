//! In-memory implementation of the [`Backend`] trait, backed by a
//! thread-safe [`std::collections::HashMap`].
//!
//! The store paginates scans exactly like a networked adapter would,
//! including the `max_batches` page cap, so that load strategies and
//! telemetry can be exercised without a real event store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use crate::store::{
    Backend, BatchingPolicy, EventData, OriginPredicate, RecordedEvent, StoreError, SyncResult,
    WrittenPredicate,
};
use crate::telemetry::{BatchMetric, Direction, Noop, Observer, SliceMetric, WriteMetric};
use crate::token::StreamToken;

#[derive(Debug, Default)]
struct MemoryStream {
    events: Vec<RecordedEvent>,
    deleted: bool,
    bytes: i64,
}

impl MemoryStream {
    fn version(&self) -> i64 {
        self.events
            .last()
            .map(|event| event.event_number)
            .unwrap_or(-1)
    }
}

/// In-memory [`Backend`] implementation.
///
/// Cloning the store clones a handle to the same shared streams.
#[derive(Clone)]
pub struct MemoryStore {
    streams: Arc<RwLock<HashMap<String, MemoryStream>>>,
    batching: BatchingPolicy,
    observer: Arc<dyn Observer>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(BatchingPolicy::default())
    }
}

impl MemoryStore {
    pub fn new(batching: BatchingPolicy) -> Self {
        Self {
            streams: Arc::default(),
            batching,
            observer: Arc::new(Noop),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Marks the stream as hard-deleted; every subsequent operation on it
    /// fails with [`StoreError::StreamDeleted`].
    pub fn delete_stream(&self, stream: &str) {
        let mut streams = self
            .streams
            .write()
            .expect("acquire write lock on memory store");

        streams.entry(stream.to_owned()).or_default().deleted = true;
    }

    fn batch_guard(
        &self,
        stream: &str,
        batches_read: u32,
    ) -> Result<(), StoreError> {
        match self.batching.max_batches() {
            Some(max) if batches_read > max => Err(StoreError::BatchLimitExceeded {
                stream: stream.to_owned(),
                max_batches: max,
            }),
            _ => Ok(()),
        }
    }

    /// Forward paged scan from `from_version` to the stream tail.
    fn read_forward(
        &self,
        stream: &str,
        from_version: i64,
    ) -> Result<(Vec<RecordedEvent>, i64, i64), StoreError> {
        let started = Instant::now();
        let streams = self
            .streams
            .read()
            .expect("acquire read lock on memory store");

        let source = match streams.get(stream) {
            None => return Ok((Vec::new(), -1, 0)),
            Some(source) if source.deleted => {
                return Err(StoreError::StreamDeleted {
                    stream: stream.to_owned(),
                })
            },
            Some(source) => source,
        };

        let batch_size = self.batching.batch_size();
        let mut events = Vec::new();
        let mut cursor = from_version.max(0) as usize;
        let mut batches: u32 = 0;
        let mut total_bytes = 0usize;

        loop {
            batches += 1;
            self.batch_guard(stream, batches)?;

            let page_started = Instant::now();
            let page: Vec<RecordedEvent> = source
                .events
                .iter()
                .skip(cursor)
                .take(batch_size)
                .cloned()
                .collect();

            let page_bytes: usize = page.iter().map(RecordedEvent::size_in_bytes).sum();
            total_bytes += page_bytes;

            self.observer.slice_read(&SliceMetric {
                stream,
                elapsed: page_started.elapsed(),
                bytes: page_bytes,
                count: page.len(),
                direction: Direction::Forward,
            });

            let full_page = page.len() == batch_size;
            cursor += page.len();
            events.extend(page);

            if !full_page {
                break;
            }
        }

        self.observer.batch_rollup(&BatchMetric {
            stream,
            elapsed: started.elapsed(),
            bytes: total_bytes,
            count: events.len(),
            batches,
            direction: Direction::Forward,
        });

        Ok((events, source.version(), source.bytes))
    }

    fn forward_token(
        &self,
        stream_version: i64,
        bytes: i64,
        snapshot: Option<i64>,
        compacting: bool,
    ) -> StreamToken {
        let token = StreamToken::new(stream_version)
            .with_snapshot(snapshot)
            .with_bytes(bytes);

        if compacting {
            token.with_capacity(self.batching.batch_size(), 0)
        } else {
            token
        }
    }
}

#[async_trait]
impl Backend for MemoryStore {
    async fn load_batched(
        &self,
        stream: &str,
        from_version: i64,
        is_origin: Option<&OriginPredicate<'_>>,
    ) -> Result<(StreamToken, Vec<RecordedEvent>), StoreError> {
        let (events, stream_version, bytes) = self.read_forward(stream, from_version)?;

        let snapshot = is_origin.and_then(|is_origin| {
            events
                .iter()
                .rev()
                .find(|event| is_origin(event))
                .map(|event| event.event_number)
        });

        let token = self.forward_token(stream_version, bytes, snapshot, is_origin.is_some());

        Ok((token, events))
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
        let started = Instant::now();
        let streams = self
            .streams
            .read()
            .expect("acquire read lock on memory store");

        let source = match streams.get(stream) {
            None => {
                return Ok((self.forward_token(-1, 0, None, true), Vec::new()));
            },
            Some(source) if source.deleted => {
                return Err(StoreError::StreamDeleted {
                    stream: stream.to_owned(),
                })
            },
            Some(source) => source,
        };

        let batch_size = self.batching.batch_size();
        let mut collected: Vec<(RecordedEvent, Option<E>)> = Vec::new();
        let mut origin: Option<i64> = None;
        let mut remaining = source.events.len();
        let mut batches: u32 = 0;
        let mut total_bytes = 0usize;

        'scan: while remaining > 0 {
            batches += 1;
            self.batch_guard(stream, batches)?;

            let page_started = Instant::now();
            let page_start = remaining.saturating_sub(batch_size);
            let page = &source.events[page_start..remaining];

            let page_bytes: usize = page.iter().map(RecordedEvent::size_in_bytes).sum();
            total_bytes += page_bytes;

            self.observer.slice_read(&SliceMetric {
                stream,
                elapsed: page_started.elapsed(),
                bytes: page_bytes,
                count: page.len(),
                direction: Direction::Backward,
            });

            for event in page.iter().rev() {
                let decoded = try_decode(event);
                let found = decoded.as_ref().map_or(false, |event| is_origin(event));

                collected.push((event.clone(), decoded));

                if found {
                    origin = Some(event.event_number);
                    break 'scan;
                }
            }

            remaining = page_start;
        }

        self.observer.batch_rollup(&BatchMetric {
            stream,
            elapsed: started.elapsed(),
            bytes: total_bytes,
            count: collected.len(),
            batches,
            direction: Direction::Backward,
        });

        collected.reverse();

        let token = self.forward_token(source.version(), source.bytes, origin, true);

        Ok((token, collected))
    }

    async fn load_from_token(
        &self,
        _use_write_conn: bool,
        stream: &str,
        token: &StreamToken,
        is_origin: Option<&OriginPredicate<'_>>,
    ) -> Result<(StreamToken, Vec<RecordedEvent>), StoreError> {
        let (events, stream_version, bytes) =
            self.read_forward(stream, token.stream_version + 1)?;

        // An origin in the tail moves the snapshot forward; otherwise the
        // one recorded by the previous token still holds.
        let snapshot = match is_origin {
            Some(is_origin) => events
                .iter()
                .rev()
                .find(|event| is_origin(event))
                .map(|event| event.event_number)
                .or(token.snapshot_event_number),
            None => token.snapshot_event_number,
        };

        let new_token = self.forward_token(stream_version, bytes, snapshot, is_origin.is_some());

        Ok((new_token, events))
    }

    async fn try_sync(
        &self,
        stream: &str,
        expected: &StreamToken,
        events: Vec<EventData>,
        is_origin: Option<&WrittenPredicate<'_>>,
    ) -> Result<SyncResult, StoreError> {
        let started = Instant::now();
        let mut streams = self
            .streams
            .write()
            .expect("acquire write lock on memory store");

        let entry = streams.entry(stream.to_owned()).or_default();

        if entry.deleted {
            return Err(StoreError::StreamDeleted {
                stream: stream.to_owned(),
            });
        }

        let current_version = entry.version();
        let count = events.len();
        let bytes: usize = events.iter().map(EventData::size_in_bytes).sum();

        if current_version != expected.stream_version {
            self.observer.write_conflict(&WriteMetric {
                stream,
                elapsed: started.elapsed(),
                bytes,
                count,
            });

            let actual = StreamToken::new(current_version).with_bytes(entry.bytes);

            return Ok(SyncResult::ConflictUnknown(Some(actual)));
        }

        let snapshot = match is_origin {
            Some(is_origin) => events
                .iter()
                .rposition(|event| is_origin(event))
                .map(|index| expected.stream_version + 1 + index as i64)
                .or(expected.snapshot_event_number),
            None => expected.snapshot_event_number,
        };

        for (i, event) in events.into_iter().enumerate() {
            entry.events.push(RecordedEvent {
                event_number: current_version + 1 + i as i64,
                id: event.id,
                event_type: event.event_type,
                data: event.data,
                timestamp: Utc::now(),
                correlation_id: event.correlation_id,
                causation_id: event.causation_id,
            });
        }

        entry.bytes += bytes as i64;

        let token = self.forward_token(
            current_version + count as i64,
            entry.bytes,
            snapshot,
            is_origin.is_some(),
        );

        self.observer.write_success(&WriteMetric {
            stream,
            elapsed: started.elapsed(),
            bytes,
            count,
        });

        Ok(SyncResult::Written(token))
    }

    fn empty_token(&self, compacting: bool) -> StreamToken {
        self.forward_token(-1, 0, None, compacting)
    }
}
