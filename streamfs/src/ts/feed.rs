//! Feed loop: packets in, demultiplexed sections out to the core.

use std::collections::{HashMap, HashSet};

use log::debug;

use streamfs_core::{Demux, DemuxError, TableStatus, TsHeader};

use super::collector::SectionCollector;
use super::packet::{Packet, PACKET_SIZE, SYNC_BYTE};
use super::pid;

/// Counters for one feed run.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedStats {
    /// Packets parsed, including skipped ones.
    pub packets: usize,
    /// Complete sections assembled and handed to the core.
    pub sections: usize,
    /// Sections the core integrated.
    pub handled: usize,
    /// Sections the core discarded as irrelevant, duplicate, or gated.
    pub discarded: usize,
}

/// Demultiplexes a capture buffer into the core.
pub struct Feeder<'a> {
    demux: &'a Demux,
    carousel_pids: HashSet<u16>,
    collectors: HashMap<u16, SectionCollector>,
}

impl<'a> Feeder<'a> {
    /// A feeder watching the PAT PID and the given carousel PIDs.
    pub fn new(demux: &'a Demux, carousel_pids: impl IntoIterator<Item = u16>) -> Self {
        Feeder {
            demux,
            carousel_pids: carousel_pids.into_iter().collect(),
            collectors: HashMap::new(),
        }
    }

    /// Scan `data` for packets, assemble sections per PID, and hand
    /// each complete section to the core.
    pub fn feed(&mut self, data: &[u8]) -> Result<FeedStats, DemuxError> {
        let mut stats = FeedStats::default();
        let mut offset = 0;

        while offset + PACKET_SIZE <= data.len() {
            if data[offset] != SYNC_BYTE {
                offset += 1;
                continue;
            }
            let Some(packet) = Packet::parse(&data[offset..]) else {
                offset += 1;
                continue;
            };
            offset += PACKET_SIZE;
            stats.packets += 1;

            if let Some(section) = self.collect(&packet) {
                stats.sections += 1;
                let header = TsHeader { pid: packet.header.pid };
                match self.demux.handle_table(&header, &section)? {
                    TableStatus::Handled => stats.handled += 1,
                    TableStatus::Discarded => stats.discarded += 1,
                }
            }
        }

        debug!(
            "feed: {} packets, {} sections ({} handled)",
            stats.packets, stats.sections, stats.handled
        );
        Ok(stats)
    }

    fn collect(&mut self, packet: &Packet<'_>) -> Option<Vec<u8>> {
        let header = &packet.header;
        if header.pid == pid::NULL || header.transport_error || header.is_scrambled() {
            return None;
        }
        if !header.has_payload() || packet.payload.is_empty() {
            return None;
        }
        let watched = header.pid == pid::PAT || self.carousel_pids.contains(&header.pid);
        if !watched {
            return None;
        }

        let collector = self.collectors.entry(header.pid).or_default();
        if collector.push(packet.payload, header.continuity_counter, header.payload_unit_start) {
            collector.take_section()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamfs_core::{tree, DemuxOptions};

    /// Wrap a section into minimal single-section packets.
    fn packetize(pid: u16, section: &[u8]) -> Vec<u8> {
        let mut packets = Vec::new();
        let mut remaining = section;
        let mut cc = 0u8;
        let mut first = true;
        while !remaining.is_empty() || first {
            let mut packet = vec![0u8; PACKET_SIZE];
            packet[0] = SYNC_BYTE;
            packet[1] = ((pid >> 8) as u8 & 0x1F) | if first { 0x40 } else { 0x00 };
            packet[2] = pid as u8;
            packet[3] = 0x10 | (cc & 0x0F);
            let mut cursor = 4;
            if first {
                packet[cursor] = 0; // pointer field
                cursor += 1;
            }
            let take = remaining.len().min(PACKET_SIZE - cursor);
            packet[cursor..cursor + take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            packets.extend_from_slice(&packet);
            cc = cc.wrapping_add(1);
            first = false;
        }
        packets
    }

    fn pat_section(version: u8, entries: &[(u16, u16)]) -> Vec<u8> {
        let section_length = 5 + entries.len() * 4 + 4;
        let mut section = vec![0x00];
        section.push(0x80 | ((section_length >> 8) as u8 & 0x0F));
        section.push(section_length as u8);
        section.extend_from_slice(&0x7FE1u16.to_be_bytes());
        section.push(0xC0 | (version << 1) | 0x01);
        section.push(0x00);
        section.push(0x00);
        for (program_number, pmt_pid) in entries {
            section.extend_from_slice(&program_number.to_be_bytes());
            section.extend_from_slice(&(0xE000 | pmt_pid).to_be_bytes());
        }
        section.extend_from_slice(&[0; 4]);
        section
    }

    #[test]
    fn test_feed_materializes_pat() {
        let demux = Demux::new(DemuxOptions::default());
        let capture = packetize(pid::PAT, &pat_section(0, &[(0x0101, 0x0100)]));

        let mut feeder = Feeder::new(&demux, []);
        let stats = feeder.feed(&capture).unwrap();
        assert_eq!(stats.sections, 1);
        assert_eq!(stats.handled, 1);

        let pat_root = demux.root().get_child("PAT").unwrap();
        let current = tree::current_version_dir(&pat_root).unwrap();
        assert!(tree::lookup_path(&current, "Programs/257").is_some());
    }

    #[test]
    fn test_unwatched_pid_ignored() {
        let demux = Demux::new(DemuxOptions::default());
        let capture = packetize(0x0042, &pat_section(0, &[(0x0101, 0x0100)]));

        let mut feeder = Feeder::new(&demux, []);
        let stats = feeder.feed(&capture).unwrap();
        assert_eq!(stats.sections, 0);
        assert!(demux.root().children().is_empty());
    }

    #[test]
    fn test_resync_after_garbage() {
        let demux = Demux::new(DemuxOptions::default());
        let mut capture = vec![0xDE, 0xAD, 0xBE, 0xEF];
        capture.extend(packetize(pid::PAT, &pat_section(0, &[(0x0101, 0x0100)])));

        let mut feeder = Feeder::new(&demux, []);
        let stats = feeder.feed(&capture).unwrap();
        assert_eq!(stats.handled, 1);
    }

    #[test]
    fn test_duplicate_section_counts_discarded() {
        let demux = Demux::new(DemuxOptions::default());
        let section = pat_section(0, &[(0x0101, 0x0100)]);
        let mut capture = packetize(pid::PAT, &section);
        capture.extend(packetize(pid::PAT, &section));

        let mut feeder = Feeder::new(&demux, []);
        let stats = feeder.feed(&capture).unwrap();
        assert_eq!(stats.sections, 2);
        assert_eq!(stats.handled, 1);
        assert_eq!(stats.discarded, 1);
    }
}
