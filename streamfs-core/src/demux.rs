//! Demux context and the table-handling entry point.
//!
//! The front end delivers complete demultiplexed sections here;
//! [`Demux::handle_table`] routes them to the concrete table parser by
//! table id. Parse-level anomalies never propagate past this point —
//! they come back as [`TableStatus::Discarded`].

use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::cache::TableCache;
use crate::dentry::Dentry;
use crate::error::DemuxError;
use crate::version::CachedTable;
use crate::{ddb, pat, table_id};

/// Demultiplexer-supplied per-packet context.
#[derive(Debug, Clone, Copy)]
pub struct TsHeader {
    /// Stream identifier the section arrived on.
    pub pid: u16,
}

/// Outcome of handling one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    /// The section mutated the tree (or legitimately accreted nothing).
    Handled,
    /// Non-fatal discard: malformed, irrelevant, duplicate, or gated by
    /// current_next_indicator.
    Discarded,
}

/// Tunables for a demux instance.
#[derive(Debug, Clone)]
pub struct DemuxOptions {
    /// Directory where reconstructed carousel objects spill to disk.
    pub tmpdir: PathBuf,
    /// Identity cache capacity; sized up front for the expected table
    /// cardinality.
    pub cache_capacity: usize,
    /// Carousel block size used when no DII metadata has been seen.
    pub default_block_size: u16,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        DemuxOptions {
            tmpdir: std::env::temp_dir(),
            cache_capacity: 64,
            default_block_size: 4096,
        }
    }
}

/// Shared demux state: the exposed tree root, the table identity cache,
/// and the options every parser consults.
pub struct Demux {
    root: Arc<Dentry>,
    tables: TableCache<CachedTable>,
    options: DemuxOptions,
}

impl Demux {
    pub fn new(options: DemuxOptions) -> Self {
        let tables = TableCache::new(options.cache_capacity);
        Demux {
            root: Dentry::directory("/"),
            tables,
            options,
        }
    }

    /// Root of the exposed tree.
    pub fn root(&self) -> &Arc<Dentry> {
        &self.root
    }

    /// The table identity cache.
    pub fn tables(&self) -> &TableCache<CachedTable> {
        &self.tables
    }

    pub fn options(&self) -> &DemuxOptions {
        &self.options
    }

    /// Integrate one complete section. `payload` starts at the PSI
    /// table id byte.
    pub fn handle_table(&self, header: &TsHeader, payload: &[u8]) -> Result<TableStatus, DemuxError> {
        let Some(&table) = payload.first() else {
            return Ok(TableStatus::Discarded);
        };
        match table {
            table_id::PAT => pat::parse(self, header, payload),
            table_id::DSMCC_MESSAGE | table_id::DSMCC_DATA => ddb::parse(self, header, payload),
            other => {
                debug!("no parser for table_id {:#04x} on pid {:#04x}", other, header.pid);
                Ok(TableStatus::Discarded)
            }
        }
    }

    /// Detach every cached table without disposing of the subtrees.
    /// Used when tearing the whole demux down while readers may still
    /// hold node references.
    pub fn invalidate(&self) {
        self.tables.lock().invalidate();
    }
}
