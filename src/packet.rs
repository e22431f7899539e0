//! The 188-byte transport packet: header, adaptation field, and payload framing.

use crate::error::{Error, Result};
use crate::slice_reader::SliceReader;
use crate::read_bitfield;
use modular_bitfield_msb::prelude::*;
use std::fmt::{Debug, Formatter};

/// Size in bytes of one MPEG-2 TS packet.
pub const TS_PACKET_SIZE: usize = 188;

/// Reserved/null PID carrying stuffing packets.
pub const PID_NULL: u16 = 0x1FFF;

/// PID carrying the Program Association Table.
pub const PID_PAT: u16 = 0x0000;

/// PID carrying the Conditional Access Table.
pub const PID_CAT: u16 = 0x0001;

/// PID carrying the actual-network NIT (and, by convention, the 1-seg synthesized NIT pointer).
pub const PID_NIT: u16 = 0x0010;

/// PID carrying SDT/BAT.
pub const PID_SDT: u16 = 0x0011;

/// PID carrying EIT/ST/CDT.
pub const PID_EIT: u16 = 0x0012;

/// PID carrying TOT/ST.
pub const PID_TOT: u16 = 0x0014;

/// PID carrying SDTT.
pub const PID_SDTT: u16 = 0x0023;

/// PID carrying BIT.
pub const PID_BIT: u16 = 0x0024;

/// Outcome of parsing one transport packet, per spec section 3 / 7.
///
/// `ContinuityError` and `TransportError` packets still propagate to the caller; only
/// `FormatError` may suppress propagation upstream (gated by `output_error_packets`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParseResult {
    /// Packet parsed with no anomalies.
    Ok,
    /// The packet's header was structurally invalid (bad sync byte, reserved field set,
    /// invalid adaptation field length, and so on).
    FormatError,
    /// The transport_error_indicator bit was set by the demodulator/tuner.
    TransportError,
    /// The continuity_counter did not advance as expected for its PID.
    ContinuityError,
}

/// Scrambling state of a packet's payload.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    /// Payload is not scrambled.
    NotScrambled,
    /// Reserved value; treated as a format error by [`crate::framer`].
    Reserved,
    /// Scrambled with the even-numbered key.
    ScrambledEvenKey,
    /// Scrambled with the odd-numbered key.
    ScrambledOddKey,
}

/// Link-layer header found at the start of every 188-byte TS packet.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PacketHeader {
    pub sync_byte: B8,
    pub tei: bool,
    pub pusi: bool,
    pub priority: bool,
    pub pid: B13,
    pub tsc: TransportScramblingControl,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: B4,
}

/// Header of the optional adaptation field.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct AdaptationFieldHeader {
    pub length: B8,
    pub discontinuity: bool,
    pub random_access: bool,
    pub priority: bool,
    pub has_pcr: bool,
    pub has_opcr: bool,
    pub has_splice_countdown: bool,
    pub has_transport_private_data: bool,
    pub has_adaptation_field_extension: bool,
}

/// Expands to [`format_args`] for a 90kHz timestamp.
///
/// Format is `<hours>:<minutes>:<seconds>:<90kHz-ticks>`.
#[macro_export]
macro_rules! pts_format_args {
    ($pts:expr) => {
        format_args!(
            "{}:{}:{}:{}",
            $pts / (90000 * 60 * 60),
            $pts / (90000 * 60) % 60,
            $pts / 90000 % 60,
            $pts % 90000
        )
    };
}

/// Program Clock Reference: 90kHz base plus a 27MHz extension.
#[derive(Default, Copy, Clone)]
pub struct PcrTimestamp {
    /// 33-bit base counted at 90kHz.
    pub base: u64,
    /// 9-bit extension counted at 27MHz, rolling over into `base` every 300 counts.
    pub extension: u16,
}

impl PcrTimestamp {
    /// Total value in 27MHz ticks, combining base and extension.
    pub fn as_27mhz_ticks(&self) -> u64 {
        self.base * 300 + self.extension as u64
    }
}

impl Debug for PcrTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcrTimestamp")
            .field("base", &pts_format_args!(self.base))
            .field("extension", &self.extension)
            .finish()
    }
}

/// Non-payload packet metadata carried by the adaptation field.
#[derive(Debug)]
pub struct AdaptationField {
    /// Header describing which optional fields are present.
    pub header: AdaptationFieldHeader,
    /// Program Clock Reference, if present.
    pub pcr: Option<PcrTimestamp>,
    /// Original Program Clock Reference, if present.
    pub opcr: Option<PcrTimestamp>,
}

/// Top-level parsed structure for one TS packet.
#[derive(Debug)]
pub struct Packet<'a> {
    /// Link-layer header.
    pub header: PacketHeader,
    /// Adaptation field, if present.
    pub adaptation_field: Option<AdaptationField>,
    /// Raw payload bytes, if a payload is present. PSI/PES reassembly happens downstream
    /// in [`crate::section`], not here.
    pub payload: Option<&'a [u8]>,
    /// Outcome of validating this packet.
    pub result: ParseResult,
}

fn parse_pcr(b: &[u8; 6]) -> PcrTimestamp {
    let mut base: u64 = (b[0] as u64) << 25;
    base |= (b[1] as u64) << 17;
    base |= (b[2] as u64) << 9;
    base |= (b[3] as u64) << 1;
    base |= (b[4] as u64) >> 7;

    let mut extension: u16 = ((b[4] & 0x1) as u16) << 8;
    extension |= b[5] as u16;
    PcrTimestamp { base, extension }
}

fn read_adaptation_field(reader: &mut SliceReader) -> Result<Option<AdaptationField>> {
    let header = read_bitfield!(reader, AdaptationFieldHeader);
    let length = header.length() as usize;
    if length == 0 {
        return Ok(Some(AdaptationField {
            header,
            pcr: None,
            opcr: None,
        }));
    }
    if length > 183 {
        return Err(Error::BadAdaptationHeader);
    }
    let mut a_reader = reader.new_sub_reader(length - 1)?;
    let mut out = AdaptationField {
        header,
        pcr: None,
        opcr: None,
    };
    if out.header.has_pcr() {
        if a_reader.remaining_len() < 6 {
            return Err(Error::BadAdaptationHeader);
        }
        out.pcr = Some(parse_pcr(&a_reader.read_array_ref::<6>()?));
    }
    if out.header.has_opcr() {
        if a_reader.remaining_len() < 6 {
            return Err(Error::BadAdaptationHeader);
        }
        out.opcr = Some(parse_pcr(&a_reader.read_array_ref::<6>()?));
    }
    // Splice countdown, transport private data, and adaptation field extension are
    // flagged but not decoded: no consumer in this crate needs their contents.
    Ok(Some(out))
}

/// Parses exactly one 188-byte packet, validating reserved fields per
/// `LibISDB::TSPacket::ParsePacket`.
///
/// Returns the parsed [`Packet`] with its [`ParseResult`] set to `FormatError` or
/// `TransportError` as appropriate; continuity is not checked here (that is the
/// [`crate::framer::Framer`]'s job, since it requires per-PID history).
pub fn parse_packet(bytes: &[u8; TS_PACKET_SIZE]) -> Packet<'_> {
    let mut reader = SliceReader::new(bytes);
    let header = match reader.read_array_ref::<4>() {
        Ok(b) => PacketHeader::from_bytes(b),
        Err(_) => unreachable!("fixed 188-byte input always has 4 header bytes"),
    };

    if header.sync_byte() != 0x47 {
        return Packet {
            header,
            adaptation_field: None,
            payload: None,
            result: ParseResult::FormatError,
        };
    }

    let mut result = ParseResult::Ok;
    if header.tei() {
        result = ParseResult::TransportError;
    }

    let pid = header.pid();
    if (0x0002..=0x000F).contains(&pid) {
        result = ParseResult::FormatError;
    }
    if header.tsc() == TransportScramblingControl::Reserved {
        result = ParseResult::FormatError;
    }

    let has_af = header.has_adaptation_field();
    let has_payload = header.has_payload();
    if !has_af && !has_payload {
        result = ParseResult::FormatError;
    }

    let mut adaptation_field = None;
    if has_af {
        match read_adaptation_field(&mut reader) {
            Ok(af) => {
                if let Some(ref f) = af {
                    let len = f.header.length() as usize;
                    if has_payload && len > 182 {
                        result = ParseResult::FormatError;
                    } else if !has_payload && len > 183 {
                        result = ParseResult::FormatError;
                    }
                }
                adaptation_field = af;
            }
            Err(_) => result = ParseResult::FormatError,
        }
    }

    let payload = if has_payload && result != ParseResult::FormatError {
        Some(reader.read_to_end())
    } else if has_payload {
        Some(reader.read_to_end())
    } else {
        None
    };

    Packet {
        header,
        adaptation_field,
        payload,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(pid: u16, cc: u8, pusi: bool) -> [u8; TS_PACKET_SIZE] {
        let mut p = [0xFFu8; TS_PACKET_SIZE];
        p[0] = 0x47;
        p[1] = if pusi { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1F);
        p[2] = (pid & 0xFF) as u8;
        p[3] = 0x10 | (cc & 0x0F); // payload only, no adaptation field
        p
    }

    #[test]
    fn parses_basic_header() {
        let bytes = make_packet(0x100, 5, true);
        let packet = parse_packet(&bytes);
        assert_eq!(packet.result, ParseResult::Ok);
        assert_eq!(packet.header.pid(), 0x100);
        assert_eq!(packet.header.continuity_counter(), 5);
        assert!(packet.header.pusi());
        assert!(packet.payload.is_some());
    }

    #[test]
    fn rejects_bad_sync_byte() {
        let mut bytes = make_packet(0x100, 0, false);
        bytes[0] = 0x00;
        let packet = parse_packet(&bytes);
        assert_eq!(packet.result, ParseResult::FormatError);
    }

    #[test]
    fn reserved_pid_range_is_format_error() {
        let bytes = make_packet(0x0005, 0, false);
        let packet = parse_packet(&bytes);
        assert_eq!(packet.result, ParseResult::FormatError);
    }

    #[test]
    fn transport_error_indicator_propagates_result() {
        let mut bytes = make_packet(0x100, 0, false);
        bytes[1] |= 0x80;
        let packet = parse_packet(&bytes);
        assert_eq!(packet.result, ParseResult::TransportError);
    }
}
