//! Resynchronizes an arbitrary byte stream to 188-byte TS packets and tracks continuity.
//!
//! Grounded on `LibISDB::TSPacketParserFilter::SyncPacket`: bytes are dropped until a
//! `0x47` sync byte is found, packets are accumulated to [`TS_PACKET_SIZE`], and a short
//! run of format/transport errors immediately after a resync triggers a forward search
//! for another sync byte within the buffered packet, rather than committing to a false
//! lock.

use crate::packet::{parse_packet, ParseResult, Packet, TS_PACKET_SIZE, PID_NULL};
use std::collections::HashMap;

/// Margin (in bytes) of slack allowed before a format/transport error triggers a
/// forward resync search. Matches the source's `TS_PACKET_SIZE_MAX - TS_PACKET_SIZE`
/// threshold collapsed to one packet's worth of margin, since this crate does not
/// support the 192/204-byte packet variants (callers must strip that framing first
/// per spec section 6).
const RESYNC_MARGIN: usize = TS_PACKET_SIZE;

/// Aggregate and per-PID packet counters, per spec section 4.1's "Observable side
/// effects" and section 7's `get_packet_count`/`get_crc_error_count`/
/// `get_scrambled_packet_count` surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCounters {
    /// Packets fed into the framer (post-resync).
    pub input: u64,
    /// Packets the framer emitted to its caller.
    pub output: u64,
    /// Packets rejected for structural reasons.
    pub format_error: u64,
    /// Packets flagged by the upstream transport_error_indicator bit.
    pub transport_error: u64,
    /// Packets whose continuity_counter did not advance as expected.
    pub continuity_error: u64,
    /// Packets whose scrambling_control indicated a scrambled payload.
    pub scrambled: u64,
}

/// Sentinel meaning "no counter observed yet for this PID".
const NO_COUNTER: u8 = 0x10;

/// Byte-stream framer: finds packet boundaries, validates headers, and tracks
/// continuity per PID.
pub struct Framer {
    buffer: Vec<u8>,
    out_of_sync_count: usize,
    continuity: HashMap<u16, u8>,
    total: PacketCounters,
    per_pid: HashMap<u16, PacketCounters>,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    /// Creates an empty framer with no buffered bytes and no continuity history.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(TS_PACKET_SIZE),
            out_of_sync_count: 0,
            continuity: HashMap::new(),
            total: PacketCounters::default(),
            per_pid: HashMap::new(),
        }
    }

    /// Aggregate counters across all PIDs.
    pub fn counters(&self) -> &PacketCounters {
        &self.total
    }

    /// Counters for a single PID, if any packet on it has been observed.
    pub fn pid_counters(&self, pid: u16) -> Option<&PacketCounters> {
        self.per_pid.get(&pid)
    }

    /// Number of stray bytes skipped since the last successful packet lock.
    pub fn out_of_sync_count(&self) -> usize {
        self.out_of_sync_count
    }

    fn check_continuity(&mut self, header_pid: u16, has_payload: bool, discontinuity: bool, cc: u8) -> bool {
        if header_pid == PID_NULL {
            return true;
        }
        let slot = self.continuity.entry(header_pid).or_insert(NO_COUNTER);
        let new_counter = if has_payload { cc } else { NO_COUNTER };
        let ok = if discontinuity || *slot >= NO_COUNTER || new_counter >= NO_COUNTER {
            true
        } else {
            (slot.wrapping_add(1) & 0x0F) == new_counter
        };
        *slot = new_counter;
        ok
    }

    fn account(&mut self, pid: u16, result: ParseResult, scrambled: bool) {
        self.total.input += 1;
        let entry = self.per_pid.entry(pid).or_default();
        entry.input += 1;
        match result {
            ParseResult::Ok => {}
            ParseResult::FormatError => {
                self.total.format_error += 1;
                entry.format_error += 1;
            }
            ParseResult::TransportError => {
                self.total.transport_error += 1;
                entry.transport_error += 1;
            }
            ParseResult::ContinuityError => {
                self.total.continuity_error += 1;
                entry.continuity_error += 1;
            }
        }
        if scrambled {
            self.total.scrambled += 1;
            entry.scrambled += 1;
        }
    }

    fn note_output(&mut self, pid: u16) {
        self.total.output += 1;
        self.per_pid.entry(pid).or_default().output += 1;
    }

    /// Feeds an arbitrary chunk of bytes and returns every packet recovered from it, in
    /// arrival order. Packets spanning a previous and the current call are handled via
    /// internal buffering.
    ///
    /// `output_null_packets` / `output_error_packets` mirror the identically named
    /// [`crate::config::RuntimeConfig`] options: when false, packets on [`PID_NULL`] or
    /// packets with `FormatError`/`TransportError` are consumed (counted) but not
    /// returned to the caller.
    pub fn feed(
        &mut self,
        bytes: &[u8],
        output_null_packets: bool,
        output_error_packets: bool,
    ) -> Vec<(ParseResult, [u8; TS_PACKET_SIZE])> {
        let mut out = Vec::new();
        let mut input = bytes;

        while !input.is_empty() {
            if self.buffer.is_empty() {
                // SearchSync: drop bytes until 0x47.
                match input.iter().position(|&b| b == 0x47) {
                    Some(idx) => {
                        self.out_of_sync_count += idx;
                        input = &input[idx..];
                    }
                    None => {
                        self.out_of_sync_count += input.len();
                        return out;
                    }
                }
            }

            let need = TS_PACKET_SIZE - self.buffer.len();
            let take = need.min(input.len());
            self.buffer.extend_from_slice(&input[..take]);
            input = &input[take..];

            if self.buffer.len() < TS_PACKET_SIZE {
                continue;
            }

            let mut packet_bytes = [0u8; TS_PACKET_SIZE];
            packet_bytes.copy_from_slice(&self.buffer);

            let parsed = parse_packet(&packet_bytes);

            let is_bad = matches!(
                parsed.result,
                ParseResult::FormatError | ParseResult::TransportError
            );
            if is_bad && self.out_of_sync_count > RESYNC_MARGIN {
                // Search within the buffered packet (skipping the confirmed-bad first
                // byte) for another sync byte and restart collection from there.
                if let Some(rel) = packet_bytes[1..].iter().position(|&b| b == 0x47) {
                    let idx = rel + 1;
                    self.out_of_sync_count += idx;
                    self.buffer.drain(0..idx);
                    continue;
                }
            }

            self.out_of_sync_count = 0;
            self.buffer.clear();

            let (result, cc_ok) = self.finalize(&parsed);
            let scrambled =
                parsed.header.tsc() != crate::packet::TransportScramblingControl::NotScrambled;
            self.account(parsed.header.pid(), result, scrambled);

            let _ = cc_ok;
            let suppress = (parsed.header.pid() == PID_NULL && !output_null_packets)
                || (matches!(result, ParseResult::FormatError | ParseResult::TransportError)
                    && !output_error_packets);

            if !suppress {
                self.note_output(parsed.header.pid());
                out.push((result, packet_bytes));
            }
        }

        out
    }

    fn finalize(&mut self, parsed: &Packet) -> (ParseResult, bool) {
        if matches!(
            parsed.result,
            ParseResult::FormatError | ParseResult::TransportError
        ) {
            return (parsed.result, true);
        }
        let discontinuity = parsed
            .adaptation_field
            .as_ref()
            .map(|af| af.header.discontinuity())
            .unwrap_or(false);
        let ok = self.check_continuity(
            parsed.header.pid(),
            parsed.header.has_payload(),
            discontinuity,
            parsed.header.continuity_counter(),
        );
        if ok {
            (ParseResult::Ok, true)
        } else {
            (ParseResult::ContinuityError, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_packet(pid: u16, cc: u8) -> [u8; TS_PACKET_SIZE] {
        let mut p = [0xFFu8; TS_PACKET_SIZE];
        p[0] = 0x47;
        p[1] = (pid >> 8) as u8 & 0x1F;
        p[2] = (pid & 0xFF) as u8;
        p[3] = 0x10 | (cc & 0x0F);
        p
    }

    #[test]
    fn scenario_a_sync_recovery() {
        let mut framer = Framer::new();
        let mut stream = vec![0x00u8; 50];
        stream.extend_from_slice(&valid_packet(0x100, 5));
        stream.extend_from_slice(&valid_packet(0x100, 6));

        let out = framer.feed(&stream, false, false);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, ParseResult::Ok);
        assert_eq!(out[1].0, ParseResult::Ok);
        assert_eq!(framer.out_of_sync_count(), 0);
    }

    #[test]
    fn scenario_b_continuity_error() {
        let mut framer = Framer::new();
        let mut stream = valid_packet(0x200, 3).to_vec();
        stream.extend_from_slice(&valid_packet(0x200, 5));

        let out = framer.feed(&stream, false, false);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, ParseResult::Ok);
        assert_eq!(out[1].0, ParseResult::ContinuityError);
        assert_eq!(framer.pid_counters(0x200).unwrap().continuity_error, 1);
    }

    #[test]
    fn packets_are_188_bytes_and_contiguous() {
        let mut framer = Framer::new();
        let mut stream = Vec::new();
        for i in 0..5u8 {
            stream.extend_from_slice(&valid_packet(0x100, i));
        }
        let out = framer.feed(&stream, false, false);
        assert_eq!(out.len(), 5);
        for (_, bytes) in &out {
            assert_eq!(bytes.len(), TS_PACKET_SIZE);
        }
    }

    #[test]
    fn small_out_of_sync_count_does_not_trigger_false_resync_on_bad_packet() {
        let mut framer = Framer::new();
        // A handful of junk bytes, leaving `out_of_sync_count` small but nonzero once
        // resynced — well under the one-packet margin.
        let mut stream = vec![0x00u8; 5];
        // A structurally invalid packet (PID in the reserved 0x0002..=0x000F range, so
        // `parse_packet` reports `FormatError`) that happens to carry an embedded 0x47
        // byte in its payload. The old (broken) threshold collapsed to "any nonzero
        // out_of_sync_count", so it would search this byte out and wrongly resync mid
        // packet; the fixed ~188-byte margin must leave this packet alone.
        let mut bad = valid_packet(0x0005, 0);
        bad[50] = 0x47;
        stream.extend_from_slice(&bad);
        stream.extend_from_slice(&valid_packet(0x100, 0));

        let out = framer.feed(&stream, false, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, ParseResult::FormatError);
        assert_eq!(out[0].1, bad);
        assert_eq!(out[1].0, ParseResult::Ok);
    }

    #[test]
    fn null_packets_suppressed_by_default() {
        let mut framer = Framer::new();
        let out = framer.feed(&valid_packet(PID_NULL, 0), false, false);
        assert!(out.is_empty());
        assert_eq!(framer.counters().input, 1);
    }
}
