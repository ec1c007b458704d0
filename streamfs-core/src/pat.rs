//! Program Association Table.
//!
//! The weakest table body in the system, kept as the reference shape
//! every non-carousel parser follows: common header, identity lookup,
//! version decision, then a small materialization loop. On a version
//! bump the old generation's children migrate onto the new root so
//! paths into earlier versions stay resolvable.

use std::sync::Arc;

use log::debug;

use crate::demux::{Demux, TableStatus, TsHeader};
use crate::dentry::Dentry;
use crate::error::DemuxError;
use crate::names;
use crate::psi::{PsiHeader, LONG_HEADER_LEN};
use crate::table_id;
use crate::tree;
use crate::version::{self, CachedTable, TableIdentity, VersionDecision, VersionPolicy};

/// One entry of the program loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatEntry {
    pub program_number: u16,
    /// PMT PID for ordinary programs, network PID for program 0.
    pub pid: u16,
}

/// Integrate one PAT section.
pub fn parse(demux: &Demux, header: &TsHeader, payload: &[u8]) -> Result<TableStatus, DemuxError> {
    let Some(psi) = PsiHeader::parse(payload) else {
        return Ok(TableStatus::Discarded);
    };
    if psi.table_id != table_id::PAT {
        return Ok(TableStatus::Discarded);
    }
    let identity = TableIdentity::new(header.pid, psi.table_id);

    let mut guard = demux.tables().lock();
    match version::decide(&guard, identity, &psi) {
        VersionDecision::Ignore => {
            debug!("pat has current_next_indicator clear, skipping");
            Ok(TableStatus::Discarded)
        }
        VersionDecision::Continuation(_) => Ok(TableStatus::Discarded),
        VersionDecision::New => {
            let table = materialize_generation(identity, &psi, payload);
            version::install(&mut guard, table.clone())?;
            tree::attach_child(demux.root(), table.root());
            Ok(TableStatus::Handled)
        }
        VersionDecision::Replace(old) => {
            let table = materialize_generation(identity, &psi, payload);
            version::replace(&mut guard, &old, table.clone(), VersionPolicy::MigrateChildren)?;
            tree::attach_child(demux.root(), table.root());
            Ok(TableStatus::Handled)
        }
    }
}

fn materialize_generation(
    identity: TableIdentity,
    psi: &PsiHeader,
    payload: &[u8],
) -> Arc<CachedTable> {
    let root = Dentry::directory(names::PAT);
    let version_dir = tree::create_version_dir(&root, psi.version_number);
    psi.populate(&version_dir);

    let programs = tree::create_directory(&version_dir, names::PROGRAMS);
    for entry in program_loop(psi, payload) {
        if entry.program_number == 0 {
            tree::create_file_number(&version_dir, "nit_pid", entry.pid as u64);
            continue;
        }
        let program_dir = tree::create_directory_tagged(
            &programs,
            &entry.program_number.to_string(),
            entry.program_number as u64,
        );
        tree::create_file_number(&program_dir, "program_number", entry.program_number as u64);
        tree::create_file_number(&program_dir, "pmt_pid", entry.pid as u64);
    }

    CachedTable::new(identity, psi.version_number, root)
}

/// Iterate the (program_number, PID) pairs between the long header and
/// the CRC.
fn program_loop<'a>(psi: &PsiHeader, payload: &'a [u8]) -> impl Iterator<Item = PatEntry> + 'a {
    let end = psi.total_length().saturating_sub(4).min(payload.len());
    let body = &payload[LONG_HEADER_LEN.min(end)..end];
    body.chunks_exact(4).map(|chunk| PatEntry {
        program_number: ((chunk[0] as u16) << 8) | chunk[1] as u16,
        pid: ((chunk[2] as u16 & 0x1F) << 8) | chunk[3] as u16,
    })
}
