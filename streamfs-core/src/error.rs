//! Error types for the demux core.
//!
//! Parse-level anomalies (truncated headers, irrelevant messages,
//! duplicate fragments) never surface as errors; they are absorbed as
//! [`TableStatus::Discarded`](crate::demux::TableStatus). Only resource
//! exhaustion and spill-file I/O propagate.

use thiserror::Error;

/// Hard failures that may escape [`Demux::handle_table`](crate::Demux::handle_table).
#[derive(Error, Debug)]
pub enum DemuxError {
    /// The identity cache has no free slot; the caller decides whether
    /// to grow the capacity or drop the table.
    #[error("table cache is full (capacity {0})")]
    CacheFull(usize),

    /// Writing a carousel block to the spill directory failed.
    #[error("carousel spill I/O: {0}")]
    Spill(#[from] std::io::Error),
}
