//! DSM-CC Download Data Block reassembly.
//!
//! A carousel module is delivered as numbered blocks scattered across
//! the stream in arbitrary order, possibly repeated. Each accepted
//! block materializes twice: as a `block_NN.bin` leaf under the
//! module's directory in the tree, and at its exact
//! `block_number * block_size` offset inside a spill file on disk so
//! large carousel objects never live wholly in memory.
//!
//! The target filename and block size come from the companion DII
//! table, resolved by walking the already-materialized `/DII` subtree.
//! Blocks arriving before that metadata fall back to a placeholder
//! name and the configured default block size rather than blocking.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};

use crate::demux::{Demux, TableStatus, TsHeader};
use crate::dentry::Dentry;
use crate::dsmcc::{DownloadDataHeader, DDB_FIXED_LEN};
use crate::error::DemuxError;
use crate::names;
use crate::psi::{PsiHeader, LONG_HEADER_LEN};
use crate::tree;
use crate::version::{
    self, module_phase, CachedTable, ModulePhase, TableIdentity, VersionDecision, VersionPolicy,
};

struct DdbFields {
    module_id: u16,
    module_version: u8,
    block_number: u16,
}

/// Integrate one DSM-CC section. Returns `Discarded` for everything
/// that is not an acceptable new Download Data Block.
pub fn parse(demux: &Demux, header: &TsHeader, payload: &[u8]) -> Result<TableStatus, DemuxError> {
    let Some(psi) = PsiHeader::parse(payload) else {
        return Ok(TableStatus::Discarded);
    };
    let identity = TableIdentity::new(header.pid, psi.table_id);

    let mut guard = demux.tables().lock();
    let decision = version::decide(&guard, identity, &psi);
    if matches!(decision, VersionDecision::Ignore) {
        debug!("ddb on pid {:#04x} has current_next_indicator clear, skipping", header.pid);
        return Ok(TableStatus::Discarded);
    }

    let Some((dd_header, data_offset)) = DownloadDataHeader::parse(payload, LONG_HEADER_LEN) else {
        return Ok(TableStatus::Discarded);
    };
    if !dd_header.is_download_data_block() {
        return Ok(TableStatus::Discarded);
    }
    if dd_header.message_length < DDB_FIXED_LEN {
        if dd_header.message_length > 0 {
            debug!("skipping ddb message with len={}", dd_header.message_length);
        }
        return Ok(TableStatus::Discarded);
    }
    if payload.len() < data_offset + DDB_FIXED_LEN as usize {
        return Ok(TableStatus::Discarded);
    }

    let fields = DdbFields {
        module_id: ((payload[data_offset] as u16) << 8) | payload[data_offset + 1] as u16,
        module_version: payload[data_offset + 2],
        block_number: ((payload[data_offset + 4] as u16) << 8) | payload[data_offset + 5] as u16,
    };

    let declared = dd_header.payload_length().saturating_sub(DDB_FIXED_LEN) as usize;
    if declared == 0 {
        return Ok(TableStatus::Discarded);
    }
    let block_start = data_offset + DDB_FIXED_LEN as usize;
    let available = payload
        .len()
        .saturating_sub(block_start)
        .saturating_sub(4); // trailing CRC
    let block_len = declared.min(available);
    if block_len == 0 {
        return Ok(TableStatus::Discarded);
    }
    if block_len < declared {
        debug!(
            "ddb block data truncated by section: {} of {} bytes",
            block_len, declared
        );
    }

    if let VersionDecision::Continuation(current) = &decision {
        let seen = current
            .with_carousel(|state| {
                state.is_duplicate(fields.module_id, fields.module_version, fields.block_number)
            })
            .unwrap_or(false);
        if seen || block_already_materialized(current.root(), fields.module_id, fields.block_number)
        {
            debug!(
                "ddb module {} block {} already materialized, skipping",
                fields.module_id, fields.block_number
            );
            return Ok(TableStatus::Discarded);
        }
    }

    // Resolve the generation this block accretes into.
    let (table, version_dir) = match decision {
        VersionDecision::Continuation(current) => {
            let version_dir = tree::current_version_dir(current.root())
                .unwrap_or_else(|| tree::create_version_dir(current.root(), psi.version_number));
            (current, version_dir)
        }
        VersionDecision::New => {
            let (table, version_dir) = materialize_generation(identity, &psi, header.pid);
            version::install(&mut guard, table.clone())?;
            let ddb_dir = tree::create_directory(demux.root(), names::DDB);
            tree::attach_child(&ddb_dir, table.root());
            (table, version_dir)
        }
        VersionDecision::Replace(old) => {
            let (table, version_dir) = materialize_generation(identity, &psi, header.pid);
            version::replace(&mut guard, &old, table.clone(), VersionPolicy::Discard)?;
            let ddb_dir = tree::create_directory(demux.root(), names::DDB);
            tree::attach_child(&ddb_dir, table.root());
            (table, version_dir)
        }
        VersionDecision::Ignore => unreachable!("gated above"),
    };

    // Individual block file under the module directory.
    let module_dir = tree::create_directory(&version_dir, &format!("module_{:02}", fields.module_id));
    let block_data = Bytes::copy_from_slice(&payload[block_start..block_start + block_len]);
    tree::create_file(
        &module_dir,
        &format!("block_{:02}.bin", fields.block_number),
        block_data.clone(),
    );
    table.with_carousel(|state| {
        state.record(fields.module_id, fields.module_version, fields.block_number)
    });

    // Offset-exact write into the reconstructed object's spill file.
    let metadata = find_module_info(demux.root(), fields.module_id, fields.module_version);
    let block_size = metadata.block_size.unwrap_or(demux.options().default_block_size);
    let object_name = metadata
        .name
        .as_deref()
        .and_then(|name| name.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or(names::UNNAMED_OBJECT);
    let spill_path = demux.options().tmpdir.join(object_name);
    write_block_at(&spill_path, fields.block_number, block_size, &block_data)?;
    let spill_len = std::fs::metadata(&spill_path)?.len();

    let object = tree::create_stream(&module_dir, object_name, spill_path);
    object.set_size(spill_len);
    if module_phase(spill_len, metadata.declared_size) == ModulePhase::Complete {
        info!(
            "carousel module {} complete: {} ({} bytes)",
            fields.module_id, object_name, spill_len
        );
    }

    Ok(TableStatus::Handled)
}

fn materialize_generation(
    identity: TableIdentity,
    psi: &PsiHeader,
    pid: u16,
) -> (Arc<CachedTable>, Arc<Dentry>) {
    let root = Dentry::directory(&format!("{:#04x}", pid));
    let version_dir = tree::create_version_dir(&root, psi.version_number);
    let table = CachedTable::new_carousel(identity, psi.version_number, root);
    (table, version_dir)
}

/// Whether the current version directory already holds a file for this
/// (module, block) pair.
fn block_already_materialized(root: &Arc<Dentry>, module_id: u16, block_number: u16) -> bool {
    let Some(current) = tree::current_version_dir(root) else {
        return false;
    };
    current
        .get_child(&format!("module_{:02}", module_id))
        .and_then(|module_dir| module_dir.get_child(&format!("block_{:02}.bin", block_number)))
        .is_some()
}

#[derive(Debug, Default)]
struct ModuleInfo {
    block_size: Option<u16>,
    declared_size: Option<u64>,
    name: Option<String>,
}

/// Walk the materialized `/DII` subtree for the metadata governing a
/// module: negotiated block size, declared total size, and the target
/// filename carried in the module's name descriptor.
fn find_module_info(fs_root: &Arc<Dentry>, module_id: u16, module_version: u8) -> ModuleInfo {
    let mut info = ModuleInfo::default();
    let Some(dii) = fs_root.get_child(names::DII) else {
        debug!("no /{} subtree found", names::DII);
        return info;
    };

    for table_dir in dii.children() {
        let Some(current) = tree::current_version_dir(&table_dir) else {
            continue;
        };
        if let Some(size) = current.get_child("block_size").and_then(|f| number_contents(&f)) {
            info.block_size = Some(size as u16);
        }

        let Some(module_dir) = current.get_child(&format!("module_{:02}", module_id)) else {
            continue;
        };
        let found_id = module_dir.get_child("module_id").and_then(|f| number_contents(&f));
        let found_version = module_dir
            .get_child("module_version")
            .and_then(|f| number_contents(&f));
        if found_id != Some(module_id as u64) || found_version != Some(module_version as u64) {
            continue;
        }

        info.declared_size = module_dir.get_child("module_size").and_then(|f| number_contents(&f));
        info.name = module_dir
            .get_child("NAME")
            .and_then(|name_dir| name_dir.get_child("text_char"))
            .and_then(|text| text.contents())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        break;
    }
    info
}

/// Parse the hex rendering produced by numeric leaves.
fn number_contents(file: &Arc<Dentry>) -> Option<u64> {
    let contents = file.contents()?;
    let text = std::str::from_utf8(&contents).ok()?;
    let digits = text.trim().trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).ok()
}

fn write_block_at(
    path: &Path,
    block_number: u16,
    block_size: u16,
    data: &[u8],
) -> Result<(), DemuxError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    file.seek(SeekFrom::Start(block_number as u64 * block_size as u64))?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::DemuxOptions;
    use crate::table_id;

    /// Build a complete DDB section carrying one block.
    fn ddb_section(
        version: u8,
        current: bool,
        module_id: u16,
        module_version: u8,
        block_number: u16,
        data: &[u8],
    ) -> Vec<u8> {
        let message_length = (DDB_FIXED_LEN as usize + data.len()) as u16;
        // The 12-bit field saturates for oversized synthetic blocks;
        // the parser bounds block data by the buffer, not this field.
        let section_length = (5 + 12 + DDB_FIXED_LEN as usize + data.len() + 4).min(0xFFF);

        let mut section = vec![table_id::DSMCC_MESSAGE];
        section.push(0x80 | ((section_length >> 8) as u8 & 0x0F));
        section.push(section_length as u8);
        section.extend_from_slice(&module_id.to_be_bytes()); // table_id_extension
        section.push(0xC0 | (version << 1) | current as u8);
        section.push(0x00);
        section.push(0x00);

        // dsmccDownloadDataHeader
        section.push(0x11); // protocolDiscriminator
        section.push(0x03); // dsmccType: download
        section.extend_from_slice(&0x1003u16.to_be_bytes()); // messageId: DDB
        section.extend_from_slice(&0x0000_0001u32.to_be_bytes()); // downloadId
        section.push(0xFF); // reserved
        section.push(0x00); // adaptationLength
        section.extend_from_slice(&message_length.to_be_bytes());

        section.extend_from_slice(&module_id.to_be_bytes());
        section.push(module_version);
        section.push(0xFF); // reserved
        section.extend_from_slice(&block_number.to_be_bytes());
        section.extend_from_slice(data);
        section.extend_from_slice(&[0; 4]); // CRC placeholder
        section
    }

    fn demux_in(dir: &std::path::Path) -> Demux {
        Demux::new(DemuxOptions {
            tmpdir: dir.to_path_buf(),
            cache_capacity: 16,
            default_block_size: 4096,
        })
    }

    const HEADER: TsHeader = TsHeader { pid: 0x30 };

    #[test]
    fn test_out_of_order_reassembly() {
        let tmp = tempfile::tempdir().unwrap();
        let demux = demux_in(tmp.path());

        let block0 = vec![0xAA; 4096];
        let block1 = vec![0xBB; 1500];

        // Block 1 lands before block 0; offsets are authoritative.
        let status = demux
            .handle_table(&HEADER, &ddb_section(1, true, 7, 1, 1, &block1))
            .unwrap();
        assert_eq!(status, TableStatus::Handled);
        demux
            .handle_table(&HEADER, &ddb_section(1, true, 7, 1, 0, &block0))
            .unwrap();

        let object = tmp.path().join(names::UNNAMED_OBJECT);
        let written = std::fs::read(&object).unwrap();
        assert_eq!(written.len(), 5596);
        assert_eq!(&written[..4096], &block0[..]);
        assert_eq!(&written[4096..], &block1[..]);

        // Both block leaves exist under the module directory.
        let module_dir =
            tree::lookup_path(demux.root(), "/DDB/0x30/1/module_07").unwrap();
        assert!(module_dir.get_child("block_00.bin").is_some());
        assert!(module_dir.get_child("block_01.bin").is_some());

        // The reconstructed object is a stream node tracking the spill.
        let stream = module_dir.get_child(names::UNNAMED_OBJECT).unwrap();
        assert_eq!(stream.size(), 5596);
        assert!(stream.is_stream());
    }

    #[test]
    fn test_block_order_is_immaterial() {
        let tmp = tempfile::tempdir().unwrap();
        let mut in_order = None;
        for (label, order) in [("sequential", [0u16, 1, 2]), ("shuffled", [2u16, 0, 1])] {
            let dir = tmp.path().join(label);
            std::fs::create_dir(&dir).unwrap();
            let demux = Demux::new(DemuxOptions {
                tmpdir: dir.clone(),
                cache_capacity: 16,
                default_block_size: 4,
            });
            let blocks: [&[u8]; 3] = [b"aaaa", b"bbbb", b"cc"];
            for number in order {
                demux
                    .handle_table(
                        &HEADER,
                        &ddb_section(1, true, 5, 1, number, blocks[number as usize]),
                    )
                    .unwrap();
            }
            let written = std::fs::read(dir.join(names::UNNAMED_OBJECT)).unwrap();
            match &in_order {
                None => in_order = Some(written),
                Some(expected) => assert_eq!(&written, expected),
            }
        }
        assert_eq!(in_order.unwrap(), b"aaaabbbbcc");
    }

    #[test]
    fn test_duplicate_block_suppressed() {
        let tmp = tempfile::tempdir().unwrap();
        let demux = demux_in(tmp.path());

        let section = ddb_section(1, true, 3, 1, 0, b"payload-bytes");
        assert_eq!(demux.handle_table(&HEADER, &section).unwrap(), TableStatus::Handled);
        assert_eq!(demux.handle_table(&HEADER, &section).unwrap(), TableStatus::Discarded);

        let module_dir = tree::lookup_path(demux.root(), "/DDB/0x30/1/module_03").unwrap();
        let blocks: Vec<_> = module_dir
            .children()
            .into_iter()
            .filter(|c| c.name().starts_with("block_"))
            .collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].contents().unwrap().as_ref(), b"payload-bytes");

        let spill = std::fs::read(tmp.path().join(names::UNNAMED_OBJECT)).unwrap();
        assert_eq!(&spill, b"payload-bytes");
    }

    #[test]
    fn test_version_bump_discards_previous_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let demux = demux_in(tmp.path());

        demux
            .handle_table(&HEADER, &ddb_section(1, true, 7, 1, 0, b"gen-one"))
            .unwrap();
        demux
            .handle_table(&HEADER, &ddb_section(2, true, 7, 2, 0, b"gen-two"))
            .unwrap();

        let table_root = tree::lookup_path(demux.root(), "/DDB/0x30").unwrap();
        // The old version directory did not migrate.
        assert!(table_root.get_child("1").is_none());
        let current = tree::current_version_dir(&table_root).unwrap();
        assert_eq!(current.name(), "2");
        let block = tree::lookup_path(&current, "module_07/block_00.bin").unwrap();
        assert_eq!(block.contents().unwrap().as_ref(), b"gen-two");
    }

    #[test]
    fn test_current_next_gating_leaves_no_trace() {
        let tmp = tempfile::tempdir().unwrap();
        let demux = demux_in(tmp.path());

        let status = demux
            .handle_table(&HEADER, &ddb_section(1, false, 7, 1, 0, b"preview"))
            .unwrap();
        assert_eq!(status, TableStatus::Discarded);
        assert!(demux.root().children().is_empty());
        assert!(demux.tables().lock().is_empty());
    }

    #[test]
    fn test_non_ddb_message_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let demux = demux_in(tmp.path());

        // Same section layout with a DII messageId.
        let mut section = ddb_section(1, true, 7, 1, 0, b"not-a-block");
        section[10] = 0x10;
        section[11] = 0x02;
        let status = demux.handle_table(&HEADER, &section).unwrap();
        assert_eq!(status, TableStatus::Discarded);
        assert!(demux.root().children().is_empty());
    }

    #[test]
    fn test_empty_block_data_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let demux = demux_in(tmp.path());
        let status = demux
            .handle_table(&HEADER, &ddb_section(1, true, 7, 1, 0, b""))
            .unwrap();
        assert_eq!(status, TableStatus::Discarded);
        assert!(demux.root().children().is_empty());
    }

    #[test]
    fn test_dii_metadata_names_the_object() {
        let tmp = tempfile::tempdir().unwrap();
        let demux = demux_in(tmp.path());

        // Materialize the companion DII subtree the way its parser
        // would: block size, module identity, and a name descriptor.
        let dii = tree::create_directory(demux.root(), names::DII);
        let dii_table = tree::create_directory(&dii, "0x31");
        let dii_version = tree::create_version_dir(&dii_table, 1);
        tree::create_file_number(&dii_version, "block_size", 8);
        let module_dir = tree::create_directory(&dii_version, "module_07");
        tree::create_file_number(&module_dir, "module_id", 7);
        tree::create_file_number(&module_dir, "module_version", 1);
        tree::create_file_number(&module_dir, "module_size", 11);
        let name_dir = tree::create_directory(&module_dir, "NAME");
        tree::create_file_string(&name_dir, "text_char", "logo.png");

        demux
            .handle_table(&HEADER, &ddb_section(1, true, 7, 1, 1, b"tail"))
            .unwrap();
        demux
            .handle_table(&HEADER, &ddb_section(1, true, 7, 1, 0, b"headbyte"))
            .unwrap();

        let written = std::fs::read(tmp.path().join("logo.png")).unwrap();
        assert_eq!(written.len(), 12);
        assert_eq!(&written[..8], b"headbyte");
        assert_eq!(&written[8..], b"tail");
    }

    #[test]
    fn test_accretion_keeps_single_version_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let demux = demux_in(tmp.path());

        demux
            .handle_table(&HEADER, &ddb_section(1, true, 7, 1, 0, b"one"))
            .unwrap();
        demux
            .handle_table(&HEADER, &ddb_section(1, true, 8, 1, 0, b"two"))
            .unwrap();

        let table_root = tree::lookup_path(demux.root(), "/DDB/0x30").unwrap();
        let versions: Vec<_> = table_root
            .children()
            .into_iter()
            .filter(|c| c.name() != names::CURRENT)
            .collect();
        assert_eq!(versions.len(), 1);
        assert!(tree::lookup_path(&table_root, "1/module_07").is_some());
        assert!(tree::lookup_path(&table_root, "1/module_08").is_some());
    }
}
