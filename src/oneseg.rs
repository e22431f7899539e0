//! One-segment PAT synthesizer: fabricates a PAT for ISDB-T one-seg streams that never
//! carry one of their own.
//!
//! Grounded on `LibISDB::OneSegPATGenerator`: a one-seg receiver may only ever see PMTs on
//! the reserved one-seg PMT PID range plus the NIT; no PAT PID is transmitted at all. This
//! component watches for that pattern and, once satisfied, emits a synthesized PAT packet
//! in-band (spec section 4.6).

use crate::descriptor::Descriptor;
use crate::table::{Nit, Pmt};
use crc::{Crc, CRC_32_MPEG_2};
use std::collections::BTreeMap;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// First PID of the reserved one-seg PMT range (`LibISDB::ONESEG_PMT_PID_FIRST`).
pub const ONESEG_PMT_PID_FIRST: u16 = 0x1FC8;
/// Last PID of the reserved one-seg PMT range (`LibISDB::ONESEG_PMT_PID_LAST`).
pub const ONESEG_PMT_PID_LAST: u16 = 0x1FCF;

/// PMT observations required on a one-seg PMT PID, with no PAT arriving, before
/// synthesis is considered (`LibISDB::PAT_GEN_PMT_COUNT`).
pub const PAT_GEN_PMT_COUNT: u32 = 5;

/// Whether `pid` falls within the reserved one-seg PMT PID range.
pub fn is_oneseg_pmt_pid(pid: u16) -> bool {
    (ONESEG_PMT_PID_FIRST..=ONESEG_PMT_PID_LAST).contains(&pid)
}

#[derive(Debug, Clone, Copy, Default)]
struct PmtObservation {
    seen_count: u32,
    program_number: u16,
    version_number: u8,
}

/// Watches PMT/NIT arrivals on a one-seg stream and synthesizes a PAT once the gate
/// conditions in spec section 4.6 are satisfied.
#[derive(Debug, Default)]
pub struct OneSegPatGenerator {
    pat_seen: bool,
    pmt_pids: BTreeMap<u16, PmtObservation>,
    transport_stream_id: Option<u16>,
    nit_gate_satisfied: bool,
    version_number: u8,
    continuity_counter: u8,
    last_synthesized_key: Option<(u16, Vec<(u16, u16)>)>,
}

impl OneSegPatGenerator {
    /// A fresh generator with no observations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Informs the generator that a real PAT has arrived. Synthesis is disabled until
    /// [`reset`](Self::reset) is called (e.g. on a stream resync), matching the source's
    /// "never fabricate a PAT if one is actually present" rule.
    pub fn note_pat_seen(&mut self) {
        self.pat_seen = true;
    }

    /// Resets all accumulated observations, re-enabling synthesis. Called on a tuner
    /// resync or PID map rebuild.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feeds a PMT observed on `pid`. Only PIDs in the one-seg PMT range
    /// ([`is_oneseg_pmt_pid`]) are tracked; others are ignored.
    pub fn observe_pmt(&mut self, pid: u16, pmt: &Pmt) {
        if !is_oneseg_pmt_pid(pid) {
            return;
        }
        let entry = self.pmt_pids.entry(pid).or_default();
        if entry.program_number != pmt.program_number || entry.version_number != pmt.version_number
        {
            entry.program_number = pmt.program_number;
            entry.version_number = pmt.version_number;
        }
        entry.seen_count += 1;
    }

    /// Feeds an NIT section. The NIT gate is satisfied once any transport stream entry
    /// carries a [`Descriptor::PartialReception`] descriptor with a non-empty service
    /// list; the transport_stream_id of that entry is remembered for the synthesized PAT.
    pub fn observe_nit(&mut self, nit: &Nit) {
        for ts in &nit.transport_streams {
            let has_partial_reception = ts.descriptors.iter().any(|d| {
                matches!(d, Descriptor::PartialReception { service_ids } if !service_ids.is_empty())
            });
            if has_partial_reception {
                self.transport_stream_id = Some(ts.transport_stream_id);
                self.nit_gate_satisfied = true;
                return;
            }
        }
    }

    fn ready_pmt_pids(&self) -> Vec<(u16, u16)> {
        self.pmt_pids
            .iter()
            .filter(|(_, obs)| obs.seen_count >= PAT_GEN_PMT_COUNT && obs.program_number != 0)
            .map(|(&pid, obs)| (pid, obs.program_number))
            .collect()
    }

    /// Attempts to synthesize a PAT packet per the current observations. Returns `None`
    /// until every gate in spec section 4.6 is satisfied: a real PAT hasn't been seen, the
    /// NIT gate is satisfied, and at least one one-seg PMT PID has been observed
    /// [`PAT_GEN_PMT_COUNT`] times with a non-zero program number.
    ///
    /// `version_number` is bumped (and a new packet synthesized) whenever the included PMT
    /// PID/program-number set changes from the last synthesis; otherwise this returns the
    /// same packet bytes (modulo continuity_counter) on every call so callers may re-emit
    /// periodically without forcing a version churn.
    pub fn synthesize(&mut self) -> Option<[u8; 188]> {
        if self.pat_seen || !self.nit_gate_satisfied {
            return None;
        }
        let transport_stream_id = self.transport_stream_id?;
        let entries = self.ready_pmt_pids();
        if entries.is_empty() {
            return None;
        }

        let key = (transport_stream_id, entries.clone());
        if self.last_synthesized_key.as_ref() != Some(&key) {
            self.version_number = self.version_number.wrapping_add(1) & 0x1F;
            self.last_synthesized_key = Some(key);
        }

        let packet = build_pat_packet(
            transport_stream_id,
            self.version_number,
            &entries,
            self.continuity_counter,
        );
        self.continuity_counter = self.continuity_counter.wrapping_add(1) & 0x0F;
        Some(packet)
    }
}

/// Builds one byte-exact 188-byte PAT packet carrying a single section: the NIT pointer
/// entry (program_number `0` -> PID `0x0010`) plus one entry per `(pid, program_number)`
/// in `entries`, CRC-32/MPEG-2 appended, stuffed with `0xFF` to 188 bytes.
fn build_pat_packet(
    transport_stream_id: u16,
    version_number: u8,
    entries: &[(u16, u16)],
    continuity_counter: u8,
) -> [u8; 188] {
    let mut body = Vec::with_capacity(4 * (entries.len() + 1));
    body.extend_from_slice(&[0x00, 0x00]); // program_number 0 -> NIT
    body.extend_from_slice(&(0xE000u16 | crate::packet::PID_NIT).to_be_bytes());
    for &(pid, program_number) in entries {
        body.extend_from_slice(&program_number.to_be_bytes());
        body.extend_from_slice(&(0xE000u16 | pid).to_be_bytes());
    }

    let section_length = 5 + body.len() + 4;
    let mut section = Vec::with_capacity(3 + section_length);
    section.push(0x00); // table_id: PAT
    section.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    section.push((section_length & 0xFF) as u8);
    section.extend_from_slice(&transport_stream_id.to_be_bytes());
    section.push(0xC0 | (version_number << 1) | 0x01); // reserved=11, current_next=1
    section.push(0x00); // section_number
    section.push(0x00); // last_section_number
    section.extend_from_slice(&body);
    let crc = CRC.checksum(&section);
    section.extend_from_slice(&crc.to_be_bytes());

    let mut packet = [0xFFu8; 188];
    packet[0] = 0x47;
    packet[1] = 0x40; // pusi=1, pid hi = 0
    packet[2] = 0x00;
    packet[3] = 0x10 | (continuity_counter & 0x0F); // payload only
    packet[4] = 0x00; // pointer_field
    packet[5..5 + section.len()].copy_from_slice(&section);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorBlock;
    use crate::table::{NitTsEntry, PmtEsEntry};

    fn make_pmt(program_number: u16, version_number: u8) -> Pmt {
        Pmt {
            program_number,
            version_number,
            pcr_pid: 0x100,
            program_descriptors: DescriptorBlock::parse(&[]),
            es: Vec::<PmtEsEntry>::new(),
        }
    }

    fn make_nit_with_partial_reception(ts_id: u16, service_ids: &[u16]) -> Nit {
        let mut body = Vec::new();
        body.push(0xFB); // tag
        body.push((service_ids.len() * 2) as u8);
        for &sid in service_ids {
            body.extend_from_slice(&sid.to_be_bytes());
        }
        Nit {
            network_id: 1,
            version_number: 0,
            actual: true,
            network_descriptors: DescriptorBlock::parse(&[]),
            transport_streams: vec![NitTsEntry {
                transport_stream_id: ts_id,
                original_network_id: 1,
                descriptors: DescriptorBlock::parse(&body),
            }],
        }
    }

    #[test]
    fn synthesizes_nothing_until_pmt_count_and_nit_gate_satisfied() {
        let mut gen = OneSegPatGenerator::new();
        let pmt = make_pmt(0x30, 0);
        for _ in 0..4 {
            gen.observe_pmt(ONESEG_PMT_PID_FIRST, &pmt);
        }
        assert!(gen.synthesize().is_none());

        gen.observe_pmt(ONESEG_PMT_PID_FIRST, &pmt);
        assert!(gen.synthesize().is_none()); // still missing NIT gate

        gen.observe_nit(&make_nit_with_partial_reception(0x7DB0, &[0x30]));
        let packet = gen.synthesize().expect("gate satisfied");
        assert_eq!(packet[0], 0x47);
        assert_eq!(&packet[1..3], &[0x40, 0x00]);
    }

    #[test]
    fn ignores_pmts_outside_oneseg_range() {
        let mut gen = OneSegPatGenerator::new();
        let pmt = make_pmt(0x30, 0);
        for _ in 0..10 {
            gen.observe_pmt(0x1F00, &pmt);
        }
        gen.observe_nit(&make_nit_with_partial_reception(0x7DB0, &[0x30]));
        assert!(gen.synthesize().is_none());
    }

    #[test]
    fn real_pat_disables_synthesis_until_reset() {
        let mut gen = OneSegPatGenerator::new();
        let pmt = make_pmt(0x30, 0);
        for _ in 0..5 {
            gen.observe_pmt(ONESEG_PMT_PID_FIRST, &pmt);
        }
        gen.observe_nit(&make_nit_with_partial_reception(0x7DB0, &[0x30]));
        gen.note_pat_seen();
        assert!(gen.synthesize().is_none());
        gen.reset();
        for _ in 0..5 {
            gen.observe_pmt(ONESEG_PMT_PID_FIRST, &pmt);
        }
        gen.observe_nit(&make_nit_with_partial_reception(0x7DB0, &[0x30]));
        assert!(gen.synthesize().is_some());
    }

    #[test]
    fn version_bumps_only_when_pmt_set_changes() {
        let mut gen = OneSegPatGenerator::new();
        let pmt = make_pmt(0x30, 0);
        for _ in 0..5 {
            gen.observe_pmt(ONESEG_PMT_PID_FIRST, &pmt);
        }
        gen.observe_nit(&make_nit_with_partial_reception(0x7DB0, &[0x30]));
        let first = gen.synthesize().unwrap();
        let second = gen.synthesize().unwrap();
        // version_number lives in byte 10 (bits 1-5); continuity_counter differs but the
        // section bytes (up to the CRC) should be identical across unchanged calls.
        assert_eq!(&first[5..first.len() - 4], &second[5..second.len() - 4]);

        let pmt2 = make_pmt(0x31, 0);
        gen.observe_pmt(ONESEG_PMT_PID_FIRST + 1, &pmt2);
        for _ in 0..5 {
            gen.observe_pmt(ONESEG_PMT_PID_FIRST + 1, &pmt2);
        }
        let third = gen.synthesize().unwrap();
        assert_ne!(&first[5..first.len() - 4], &third[5..third.len() - 4]);
    }
}
