//! Contains the policy deciding when a rolling snapshot event must be folded
//! into a write batch.

use crate::token::StreamToken;

/// The inputs consulted before a sync under a compaction access strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionContext {
    /// Number of events the decision produced for this sync.
    pub events_len: usize,

    /// Remaining append headroom recorded by the stream's token.
    pub capacity_before_compaction: usize,
}

impl CompactionContext {
    /// Builds the context from a token, when the token carries compaction
    /// headroom metadata.
    pub(crate) fn from_token(events_len: usize, token: &StreamToken) -> Option<Self> {
        token
            .batch_capacity_limit
            .map(|capacity| CompactionContext {
                events_len,
                capacity_before_compaction: capacity.max(0) as usize,
            })
    }

    /// Whether appending the batch as-is would leave the stream without a
    /// snapshot within its batch window.
    pub fn is_compaction_due(&self) -> bool {
        self.events_len > self.capacity_before_compaction
    }
}
