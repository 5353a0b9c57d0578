//! Storage engine configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::Log`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Segment sizing and placement.
    pub segment: SegmentConfig,
}

/// Segment sizing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Cap on a segment's store file. A segment whose store reaches this is
    /// maxed and becomes immutable.
    pub max_store_bytes: u64,

    /// Cap on a segment's index file. Also the size the index file is
    /// preallocated to for memory-mapping.
    pub max_index_bytes: u64,

    /// Offset assigned to the first record of an empty log. Zero for record
    /// logs; one when the log serves as the consensus engine's log store.
    pub initial_offset: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }
}
