//! PSI common-header handling.
//!
//! Every table parser starts here: the common header carries the fields
//! the version controller keys on (table id, version number,
//! current/next indicator). A header that cannot be parsed aborts the
//! table with no state change.

use std::sync::Arc;

use crate::dentry::Dentry;
use crate::tree;

/// Byte offset of the table body after a long-format header.
pub const LONG_HEADER_LEN: usize = 8;

/// Common PSI section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsiHeader {
    /// Table ID.
    pub table_id: u8,
    /// Section syntax indicator; set for long-format sections.
    pub section_syntax_indicator: bool,
    /// Section length (12 bits), counted from the byte after it.
    pub section_length: u16,
    /// Table ID extension (long sections only).
    pub extension: u16,
    /// Version number (5 bits).
    pub version_number: u8,
    /// Current/next indicator; clear means the table is a "next"
    /// announcement and must not mutate any state.
    pub current_next_indicator: bool,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
}

impl PsiHeader {
    /// Parse the common header from a complete section. Returns `None`
    /// on truncation — the caller discards the fragment with no state
    /// change.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 3 {
            return None;
        }

        let table_id = payload[0];
        let section_syntax_indicator = payload[1] & 0x80 != 0;
        let section_length = ((payload[1] as u16 & 0x0F) << 8) | payload[2] as u16;

        let total = 3 + section_length as usize;
        if payload.len() < total {
            return None;
        }

        if section_syntax_indicator {
            if payload.len() < LONG_HEADER_LEN || section_length < 5 {
                return None;
            }
            Some(PsiHeader {
                table_id,
                section_syntax_indicator,
                section_length,
                extension: ((payload[3] as u16) << 8) | payload[4] as u16,
                version_number: (payload[5] >> 1) & 0x1F,
                current_next_indicator: payload[5] & 0x01 != 0,
                section_number: payload[6],
                last_section_number: payload[7],
            })
        } else {
            Some(PsiHeader {
                table_id,
                section_syntax_indicator,
                section_length,
                extension: 0,
                version_number: 0,
                current_next_indicator: true,
                section_number: 0,
                last_section_number: 0,
            })
        }
    }

    /// Total section length including the 3 fixed header bytes.
    pub fn total_length(&self) -> usize {
        3 + self.section_length as usize
    }

    /// Materialize the header fields as numeric leaves under a version
    /// directory.
    pub fn populate(&self, dir: &Arc<Dentry>) {
        tree::create_file_number(dir, "table_id", self.table_id as u64);
        tree::create_file_number(dir, "section_length", self.section_length as u64);
        tree::create_file_number(dir, "table_id_extension", self.extension as u64);
        tree::create_file_number(dir, "version_number", self.version_number as u64);
        tree::create_file_number(
            dir,
            "current_next_indicator",
            self.current_next_indicator as u64,
        );
        tree::create_file_number(dir, "section_number", self.section_number as u64);
        tree::create_file_number(dir, "last_section_number", self.last_section_number as u64);
    }
}
