//! streamfs-core: versioned filesystem-tree core for demultiplexed
//! MPEG-TS protocol tables.
//!
//! The crate turns a sequence of demultiplexed, versioned PSI/DSM-CC
//! sections into a concurrently-mutable in-memory filesystem tree:
//!
//! - [`cache::TableCache`] recognizes "new version of a known table"
//!   versus "brand-new table" versus "duplicate fragment" through a
//!   packet-derived 64-bit identity.
//! - [`ddb`] reassembles DSM-CC Download Data Block carousels from
//!   per-module, per-block fragments scattered across the stream,
//!   writing each block at its exact byte offset.
//! - [`dentry`] and [`tree`] provide the directory/file/symlink node
//!   model with version subdirectories and a "Current" symlink that is
//!   repointed on every accepted table generation.
//!
//! The demultiplexer front end feeds complete sections into
//! [`demux::Demux::handle_table`]; everything below that entry point is
//! synchronous and lock-scoped per table identity.

pub mod cache;
pub mod ddb;
pub mod demux;
pub mod dentry;
pub mod dsmcc;
pub mod error;
pub mod pat;
pub mod psi;
pub mod tree;
pub mod version;

pub use demux::{Demux, DemuxOptions, TableStatus, TsHeader};
pub use dentry::{Dentry, FormatHint, NodeBody, NodeKind};
pub use error::DemuxError;
pub use version::{CachedTable, TableIdentity, VersionPolicy};

/// Well-known names in the exposed tree.
pub mod names {
    /// Root directory for Download Data Block carousels.
    pub const DDB: &str = "DDB";
    /// Root directory for Download Info Indication tables.
    pub const DII: &str = "DII";
    /// Root directory for the Program Association Table.
    pub const PAT: &str = "PAT";
    /// Symlink pointing at the active version directory.
    pub const CURRENT: &str = "Current";
    /// Program list directory under a PAT version.
    pub const PROGRAMS: &str = "Programs";
    /// Placeholder filename for carousel objects with no DII name.
    pub const UNNAMED_OBJECT: &str = "file.bin";
}

/// Table IDs handled by the dispatch in [`demux`].
pub mod table_id {
    /// Program Association Section.
    pub const PAT: u8 = 0x00;
    /// DSM-CC User-to-Network messages (DII/DSI).
    pub const DSMCC_MESSAGE: u8 = 0x3B;
    /// DSM-CC Download Data Messages (DDB).
    pub const DSMCC_DATA: u8 = 0x3C;
}
