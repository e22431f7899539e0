//! Stream selector: reshapes a transport stream down to one service (and/or certain
//! stream types), rewriting the PAT to match.
//!
//! Grounded on `LibISDB::StreamSelector`: the target PID set is recomputed whenever PAT,
//! PMT, or CAT updates arrive; filtering to one service additionally rewrites the PAT to
//! contain only the NIT pointer and the target program entry (spec section 4.8).

use crate::table::{Cat, Pat, Pmt};
use crc::{Crc, CRC_32_MPEG_2};
use std::collections::HashSet;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Stream-type classification bitmask, supplementing spec.md's unenumerated "certain
/// stream types" with the original's concrete `StreamFlag` set (SPEC_FULL.md §5.9).
/// Hand-rolled rather than pulled from a bitflags crate: the set is small, fixed, and used
/// only internally by the selector's filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamKind(u32);

impl StreamKind {
    /// MPEG-1/2 video (`stream_type` 0x01/0x02).
    pub const MPEG1_2_VIDEO: StreamKind = StreamKind(1 << 0);
    /// MPEG-1/2 audio (`stream_type` 0x03/0x04).
    pub const MPEG1_2_AUDIO: StreamKind = StreamKind(1 << 1);
    /// AAC audio (`stream_type` 0x0F/0x11).
    pub const AAC: StreamKind = StreamKind(1 << 2);
    /// MPEG-4 visual (`stream_type` 0x10).
    pub const MPEG4_VISUAL: StreamKind = StreamKind(1 << 3);
    /// MPEG-4 audio, non-AAC (`stream_type` 0x0E).
    pub const MPEG4_AUDIO: StreamKind = StreamKind(1 << 4);
    /// H.264/AVC video (`stream_type` 0x1B).
    pub const H264: StreamKind = StreamKind(1 << 5);
    /// H.265/HEVC video (`stream_type` 0x24).
    pub const H265: StreamKind = StreamKind(1 << 6);
    /// AC-3/E-AC-3 (`stream_type` 0x81, 0x87).
    pub const AC3: StreamKind = StreamKind(1 << 7);
    /// DTS audio (`stream_type` 0x82).
    pub const DTS: StreamKind = StreamKind(1 << 8);
    /// Dolby TrueHD (`stream_type` 0x83).
    pub const TRUEHD: StreamKind = StreamKind(1 << 9);
    /// Dolby Digital Plus (`stream_type` 0x84).
    pub const DOLBY_DIGITAL_PLUS: StreamKind = StreamKind(1 << 10);
    /// ARIB STD-B24 closed caption (`stream_type` 0x06 with a data-component descriptor).
    pub const CAPTION: StreamKind = StreamKind(1 << 11);
    /// ARIB data carrousel (`stream_type` 0x0D / 0x06 data-carrousel variants).
    pub const DATA_CARROUSEL: StreamKind = StreamKind(1 << 12);

    /// Every kind set.
    pub const ALL: StreamKind = StreamKind(0x1FFF);
    /// No kind set.
    pub const NONE: StreamKind = StreamKind(0);

    /// Classifies a raw MPEG-TS `stream_type` byte into its [`StreamKind`] flag, or
    /// [`StreamKind::NONE`] if unrecognized.
    pub fn from_stream_type(stream_type: u8) -> StreamKind {
        match stream_type {
            0x01 | 0x02 => StreamKind::MPEG1_2_VIDEO,
            0x03 | 0x04 => StreamKind::MPEG1_2_AUDIO,
            0x0E => StreamKind::MPEG4_AUDIO,
            0x0D => StreamKind::DATA_CARROUSEL,
            0x0F | 0x11 => StreamKind::AAC,
            0x10 => StreamKind::MPEG4_VISUAL,
            0x1B => StreamKind::H264,
            0x24 => StreamKind::H265,
            0x81 | 0x87 => StreamKind::AC3,
            0x82 => StreamKind::DTS,
            0x83 => StreamKind::TRUEHD,
            0x84 => StreamKind::DOLBY_DIGITAL_PLUS,
            0x06 => StreamKind::CAPTION,
            _ => StreamKind::NONE,
        }
    }

    /// Whether `self` has every bit set in `other`.
    pub fn contains(&self, other: StreamKind) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Whether `self` shares any bit with `other`.
    pub fn intersects(&self, other: StreamKind) -> bool {
        (self.0 & other.0) != 0
    }
}

impl std::ops::BitOr for StreamKind {
    type Output = StreamKind;
    fn bitor(self, rhs: StreamKind) -> StreamKind {
        StreamKind(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for StreamKind {
    fn bitor_assign(&mut self, rhs: StreamKind) {
        self.0 |= rhs.0;
    }
}

/// System PIDs always retained regardless of the target service (PAT, CAT, NIT, SDT,
/// EIT, TOT, and the rest of the `< 0x0030` reserved range), per spec section 4.8.
pub const SYSTEM_PID_CEILING: u16 = 0x0030;

/// Target service selection. `None` for either field means "no restriction".
#[derive(Debug, Clone, Default)]
pub struct SelectorTarget {
    /// Service (program_number) to retain, if filtering to one service.
    pub service_id: Option<u16>,
    /// Stream-type kinds to retain among the target service's elementary streams, if
    /// restricting by type. `None` retains every ES of the target service.
    pub stream_kinds: Option<StreamKind>,
}

/// Recomputes the retained-PID set on PAT/PMT/CAT changes and rewrites the PAT to match
/// a single-service selection, per spec section 4.8.
#[derive(Debug, Default)]
pub struct StreamSelector {
    target: SelectorTarget,
    nit_pid: Option<u16>,
    upstream_pat_version: Option<u8>,
    last_pmt_pid: Option<u16>,
    rewritten_version: u8,
    retained_pids: HashSet<u16>,
    target_pmt_pid: Option<u16>,
}

impl StreamSelector {
    /// A selector with no target configured (passes every packet through).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the selection target, forcing the next PAT/PMT observation to recompute the
    /// retained-PID set from scratch.
    pub fn set_target(&mut self, target: SelectorTarget) {
        self.target = target;
        self.retained_pids.clear();
        self.target_pmt_pid = None;
    }

    /// Feeds an updated PAT. Recomputes the system/NIT/target-PMT PID set.
    pub fn on_pat(&mut self, pat: &Pat) {
        self.nit_pid = pat.nit_pid();
        self.upstream_pat_version = Some(pat.version_number);
        self.target_pmt_pid = self
            .target
            .service_id
            .and_then(|sid| pat.pmt_pid(sid));
        self.recompute_retained(pat, None, &[]);
    }

    /// Feeds an updated PMT for the target service. ECM PIDs are extracted from the
    /// program-level CA descriptors; ES PIDs are filtered by `stream_kinds` if set.
    pub fn on_pmt(&mut self, pmt_pid: u16, pmt: &Pmt) {
        if Some(pmt_pid) != self.target_pmt_pid {
            return;
        }
        self.retained_pids.insert(pmt_pid);
        self.retained_pids.insert(pmt.pcr_pid);
        if let Some(ecm) = pmt.ecm_pid() {
            self.retained_pids.insert(ecm);
        }
        for es in &pmt.es {
            let kind = StreamKind::from_stream_type(es.stream_type);
            let retain = match self.target.stream_kinds {
                Some(kinds) => kinds.intersects(kind) || kind == StreamKind::NONE,
                None => true,
            };
            if retain {
                self.retained_pids.insert(es.pid);
            }
        }
    }

    /// Feeds an updated CAT. EMM PIDs are always retained for the target service.
    pub fn on_cat(&mut self, cat: &Cat) {
        for emm_pid in cat.descriptors.iter().filter_map(|d| match d {
            crate::descriptor::Descriptor::Ca { ca_pid, .. } => Some(*ca_pid),
            _ => None,
        }) {
            self.retained_pids.insert(emm_pid);
        }
    }

    fn recompute_retained(&mut self, pat: &Pat, _pmt: Option<&Pmt>, _extra: &[u16]) {
        self.retained_pids
            .retain(|&pid| pid < SYSTEM_PID_CEILING || Some(pid) == self.nit_pid);
        if let Some(nit_pid) = self.nit_pid {
            self.retained_pids.insert(nit_pid);
        }
        if self.target.service_id.is_none() {
            // No service restriction: every PAT-listed PMT PID passes.
            for entry in &pat.entries {
                self.retained_pids.insert(entry.pid);
            }
        }
    }

    /// Whether `pid` should be retained in the output stream, per the PID set computed
    /// from the most recent PAT/PMT/CAT observations.
    pub fn retains(&self, pid: u16) -> bool {
        pid < SYSTEM_PID_CEILING || self.retained_pids.contains(&pid)
    }

    /// Rewrites `pat` to contain only the NIT pointer entry and the target service's
    /// program entry, bumping `version_number` whenever the target PMT PID or the
    /// upstream PAT's version changed since the last rewrite. Returns `None` if no
    /// service target is configured (nothing to rewrite) or the target service isn't
    /// listed in `pat`.
    pub fn rewrite_pat(&mut self, pat: &Pat) -> Option<[u8; 188]> {
        let service_id = self.target.service_id?;
        let pmt_pid = pat.pmt_pid(service_id)?;

        let pmt_pid_changed = self.last_pmt_pid != Some(pmt_pid);
        let pat_version_changed = self.upstream_pat_version != Some(pat.version_number);
        if pmt_pid_changed || pat_version_changed || self.last_pmt_pid.is_none() {
            self.rewritten_version = self.rewritten_version.wrapping_add(1) & 0x1F;
        }
        self.last_pmt_pid = Some(pmt_pid);
        self.upstream_pat_version = Some(pat.version_number);

        let mut entries = Vec::with_capacity(2);
        if let Some(nit_pid) = pat.nit_pid() {
            entries.push((0u16, nit_pid));
        }
        entries.push((service_id, pmt_pid));

        Some(build_pat_packet(
            pat.transport_stream_id,
            self.rewritten_version,
            &entries,
        ))
    }
}

fn build_pat_packet(transport_stream_id: u16, version_number: u8, entries: &[(u16, u16)]) -> [u8; 188] {
    let mut body = Vec::with_capacity(4 * entries.len());
    for &(program_number, pid) in entries {
        body.extend_from_slice(&program_number.to_be_bytes());
        body.extend_from_slice(&(0xE000u16 | pid).to_be_bytes());
    }

    let section_length = 5 + body.len() + 4;
    let mut section = Vec::with_capacity(3 + section_length);
    section.push(0x00);
    section.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    section.push((section_length & 0xFF) as u8);
    section.extend_from_slice(&transport_stream_id.to_be_bytes());
    section.push(0xC0 | (version_number << 1) | 0x01);
    section.push(0x00);
    section.push(0x00);
    section.extend_from_slice(&body);
    let crc = CRC.checksum(&section);
    section.extend_from_slice(&crc.to_be_bytes());

    let mut packet = [0xFFu8; 188];
    packet[0] = 0x47;
    packet[1] = 0x40;
    packet[2] = 0x00;
    packet[3] = 0x10;
    packet[4] = 0x00;
    packet[5..5 + section.len()].copy_from_slice(&section);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorBlock;
    use crate::section::Reassembler;
    use crate::table::{parse_pat, PatEntry, PmtEsEntry};

    fn make_pat(entries: &[(u16, u16)], version: u8) -> Pat {
        Pat {
            transport_stream_id: 1,
            version_number: version,
            entries: entries
                .iter()
                .map(|&(program_number, pid)| PatEntry { program_number, pid })
                .collect(),
        }
    }

    #[test]
    fn scenario_e_retains_only_target_service_system_pids_and_nit() {
        let pat = make_pat(&[(0, 0x0010), (1, 0x100), (2, 0x200), (3, 0x300)], 0);
        let mut selector = StreamSelector::new();
        selector.set_target(SelectorTarget {
            service_id: Some(2),
            stream_kinds: None,
        });
        selector.on_pat(&pat);

        let pmt = Pmt {
            program_number: 2,
            version_number: 0,
            pcr_pid: 0x201,
            program_descriptors: DescriptorBlock::parse(&[]),
            es: vec![PmtEsEntry {
                stream_type: 0x02,
                pid: 0x202,
                descriptors: DescriptorBlock::parse(&[]),
            }],
        };
        selector.on_pmt(0x200, &pmt);

        assert!(selector.retains(0x0000)); // PAT itself
        assert!(selector.retains(0x0010)); // NIT
        assert!(selector.retains(0x200)); // target PMT
        assert!(selector.retains(0x201)); // target PCR
        assert!(selector.retains(0x202)); // target ES
        assert!(!selector.retains(0x100));
        assert!(!selector.retains(0x300));

        let rewritten = selector.rewrite_pat(&pat).expect("target is listed");
        let mut r = Reassembler::new();
        let sections = r.store_packet(&rewritten[4..], true);
        assert_eq!(sections.len(), 1);
        let decoded = parse_pat(&sections[0]).unwrap();
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.nit_pid(), Some(0x0010));
        assert_eq!(decoded.pmt_pid(2), Some(0x200));
        assert!(r.crc_error_count() == 0);
    }

    #[test]
    fn pat_version_bump_on_pmt_pid_change() {
        let pat_a = make_pat(&[(0, 0x0010), (2, 0x200)], 0);
        let mut selector = StreamSelector::new();
        selector.set_target(SelectorTarget {
            service_id: Some(2),
            stream_kinds: None,
        });
        selector.on_pat(&pat_a);
        let first = selector.rewrite_pat(&pat_a).unwrap();

        let pat_b = make_pat(&[(0, 0x0010), (2, 0x210)], 0);
        selector.on_pat(&pat_b);
        let second = selector.rewrite_pat(&pat_b).unwrap();
        assert_ne!(first[5..first.len() - 4], second[5..second.len() - 4]);
    }

    #[test]
    fn stream_kind_filter_excludes_non_matching_es() {
        let mut k = StreamKind::NONE;
        k |= StreamKind::MPEG1_2_AUDIO;
        assert!(k.contains(StreamKind::MPEG1_2_AUDIO));
        assert!(!k.contains(StreamKind::H264));
        assert_eq!(StreamKind::from_stream_type(0x1B), StreamKind::H264);
    }
}
