//! PSI/SI table decoders: turns a verified [`crate::section::Section`] into a typed table.
//!
//! Grounded on `LibISDB::PSISingleTable`/`PSITableSet`/segmented multi-section tables
//! (`TS/PSITable.hpp`, `TS/Tables.hpp`). Three update shapes, named in spec section 4.4:
//!
//! - **Single** (PAT/CAT/TOT/PMT): one slot, retained only if its content differs from
//!   what's already stored.
//! - **Keyed set** (SDT actual/other, NIT, BIT): one slot per `(table_id, unique_id)`.
//! - **Segmented multi-section** (EIT): slots keyed by `(unique_id, section_number)`,
//!   grouped into 8-section segments for schedule completeness tracking
//!   ([`crate::epg`]).

use crate::descriptor::{Descriptor, DescriptorBlock};
use crate::section::Section;
use crate::slice_reader::SliceReader;
use smallvec::SmallVec;
use std::collections::HashMap;

/// `PATTable::PATItem` — one program_number/PID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatEntry {
    /// `program_number` (service_id for non-NIT-pointer entries; `0` marks the NIT PID).
    pub program_number: u16,
    /// `network_PID` (when `program_number == 0`) or `program_map_PID` otherwise.
    pub pid: u16,
}

/// Decoded Program Association Table.
#[derive(Debug, Clone, Default)]
pub struct Pat {
    /// `transport_stream_id`.
    pub transport_stream_id: u16,
    /// `version_number`.
    pub version_number: u8,
    /// Every program_number/PID entry, NIT pointer (program_number `0`) included.
    pub entries: Vec<PatEntry>,
}

impl Pat {
    /// PID of the Network Information Table, if a NIT pointer entry is present.
    pub fn nit_pid(&self) -> Option<u16> {
        self.entries
            .iter()
            .find(|e| e.program_number == 0)
            .map(|e| e.pid)
    }

    /// PMT PID for `program_number`, if listed.
    pub fn pmt_pid(&self, program_number: u16) -> Option<u16> {
        self.entries
            .iter()
            .find(|e| e.program_number == program_number && program_number != 0)
            .map(|e| e.pid)
    }

    /// Whether `pid` is listed as a PMT PID (excludes the NIT pointer entry).
    pub fn is_pmt_pid(&self, pid: u16) -> bool {
        self.entries
            .iter()
            .any(|e| e.program_number != 0 && e.pid == pid)
    }
}

/// Parses a PAT section payload (after the 8-byte extended header, before the CRC).
pub fn parse_pat(section: &Section) -> Option<Pat> {
    if section.header.table_id != 0x00 {
        return None;
    }
    let payload = section.payload();
    let mut entries = Vec::with_capacity(payload.len() / 4);
    let mut r = SliceReader::new(payload);
    while r.remaining_len() >= 4 {
        let program_number = r.read_be_u16().ok()?;
        let pid = r.read_be_u16().ok()? & 0x1FFF;
        entries.push(PatEntry { program_number, pid });
    }
    Some(Pat {
        transport_stream_id: section.header.table_id_extension,
        version_number: section.header.version_number,
        entries,
    })
}

/// Decoded Conditional Access Table.
#[derive(Debug, Clone, Default)]
pub struct Cat {
    /// `version_number`.
    pub version_number: u8,
    /// Top-level descriptor loop, normally a list of [`Descriptor::Ca`] entries.
    pub descriptors: DescriptorBlock,
}

impl Cat {
    /// EMM PID for the first CA descriptor found, if any.
    pub fn emm_pid(&self) -> Option<u16> {
        self.emm_pid_for_system(None)
    }

    /// EMM PID for a specific `ca_system_id`, or the first CA descriptor if `None`.
    pub fn emm_pid_for_system(&self, ca_system_id: Option<u16>) -> Option<u16> {
        self.descriptors.iter().find_map(|d| match d {
            Descriptor::Ca {
                ca_system_id: id,
                ca_pid,
                ..
            } if ca_system_id.is_none() || ca_system_id == Some(*id) => Some(*ca_pid),
            _ => None,
        })
    }
}

/// Parses a CAT section payload.
pub fn parse_cat(section: &Section) -> Option<Cat> {
    if section.header.table_id != 0x01 {
        return None;
    }
    Some(Cat {
        version_number: section.header.version_number,
        descriptors: DescriptorBlock::parse(section.payload()),
    })
}

/// `PMTTable::PMTItem` — one elementary stream entry.
#[derive(Debug, Clone)]
pub struct PmtEsEntry {
    /// `stream_type`.
    pub stream_type: u8,
    /// `elementary_PID`.
    pub pid: u16,
    /// `ES_info` descriptor loop.
    pub descriptors: DescriptorBlock,
}

/// Decoded Program Map Table.
#[derive(Debug, Clone)]
pub struct Pmt {
    /// `program_number` (service_id this PMT describes).
    pub program_number: u16,
    /// `version_number`.
    pub version_number: u8,
    /// `PCR_PID`.
    pub pcr_pid: u16,
    /// `program_info` descriptor loop.
    pub program_descriptors: DescriptorBlock,
    /// One entry per elementary stream, in section order.
    pub es: Vec<PmtEsEntry>,
}

impl Pmt {
    /// ECM PID for the first CA descriptor found among the program-level descriptors.
    pub fn ecm_pid(&self) -> Option<u16> {
        self.ecm_pid_for_system(None)
    }

    /// ECM PID for a specific `ca_system_id`, or the first found if `None`.
    pub fn ecm_pid_for_system(&self, ca_system_id: Option<u16>) -> Option<u16> {
        self.program_descriptors.iter().find_map(|d| match d {
            Descriptor::Ca {
                ca_system_id: id,
                ca_pid,
                ..
            } if ca_system_id.is_none() || ca_system_id == Some(*id) => Some(*ca_pid),
            _ => None,
        })
    }
}

/// Parses a PMT section payload.
pub fn parse_pmt(section: &Section) -> Option<Pmt> {
    if section.header.table_id != 0x02 {
        return None;
    }
    let payload = section.payload();
    let mut r = SliceReader::new(payload);
    let pcr_pid = r.read_be_u16().ok()? & 0x1FFF;
    let program_info_length = (r.read_be_u16().ok()? & 0x0FFF) as usize;
    let program_descriptors = DescriptorBlock::parse(r.read(program_info_length).ok()?);

    let mut es = Vec::new();
    while r.remaining_len() >= 5 {
        let stream_type = r.read_u8().ok()?;
        let pid = r.read_be_u16().ok()? & 0x1FFF;
        let es_info_length = (r.read_be_u16().ok()? & 0x0FFF) as usize;
        let descriptors = DescriptorBlock::parse(r.read(es_info_length).ok()?);
        es.push(PmtEsEntry {
            stream_type,
            pid,
            descriptors,
        });
    }

    Some(Pmt {
        program_number: section.header.table_id_extension,
        version_number: section.header.version_number,
        pcr_pid,
        program_descriptors,
        es,
    })
}

/// `SDTTable::TABLE_ID_ACTUAL` / `TABLE_ID_OTHER`.
pub const TABLE_ID_SDT_ACTUAL: u8 = 0x42;
/// See [`TABLE_ID_SDT_ACTUAL`].
pub const TABLE_ID_SDT_OTHER: u8 = 0x46;

/// `SDTTable::SDTItem` — one service entry.
#[derive(Debug, Clone)]
pub struct SdtEntry {
    /// `service_id`.
    pub service_id: u16,
    /// `EIT_schedule_flag`.
    pub eit_schedule_flag: bool,
    /// `EIT_present_following_flag`.
    pub eit_present_following_flag: bool,
    /// `running_status`.
    pub running_status: u8,
    /// `free_CA_mode`.
    pub free_ca_mode: bool,
    /// Per-service descriptor loop, typically carrying [`Descriptor::Service`].
    pub descriptors: DescriptorBlock,
}

/// Decoded Service Description Table (one of actual or other).
#[derive(Debug, Clone)]
pub struct Sdt {
    /// Whether this section is `SDT[actual]` (`true`) or `SDT[other]` (`false`).
    pub actual: bool,
    /// `transport_stream_id`.
    pub transport_stream_id: u16,
    /// `original_network_id`.
    pub network_id: u16,
    /// `version_number`.
    pub version_number: u8,
    /// Every service entry in this section.
    pub services: Vec<SdtEntry>,
}

/// Parses an SDT section payload (actual or other).
pub fn parse_sdt(section: &Section) -> Option<Sdt> {
    let actual = match section.header.table_id {
        TABLE_ID_SDT_ACTUAL => true,
        TABLE_ID_SDT_OTHER => false,
        _ => return None,
    };
    let payload = section.payload();
    let mut r = SliceReader::new(payload);
    let network_id = r.read_be_u16().ok()?;
    let _reserved_future_use = r.read_u8().ok()?;

    let mut services = Vec::new();
    while r.remaining_len() >= 5 {
        let service_id = r.read_be_u16().ok()?;
        let b = r.read_u8().ok()?;
        let eit_schedule_flag = b & 0x02 != 0;
        let eit_present_following_flag = b & 0x01 != 0;
        let b2 = r.read_be_u16().ok()?;
        let running_status = ((b2 >> 13) & 0x07) as u8;
        let free_ca_mode = b2 & 0x1000 != 0;
        let descriptors_loop_length = (b2 & 0x0FFF) as usize;
        let descriptors = DescriptorBlock::parse(r.read(descriptors_loop_length).ok()?);
        services.push(SdtEntry {
            service_id,
            eit_schedule_flag,
            eit_present_following_flag,
            running_status,
            free_ca_mode,
            descriptors,
        });
    }

    Some(Sdt {
        actual,
        transport_stream_id: section.header.table_id_extension,
        network_id,
        version_number: section.header.version_number,
        services,
    })
}

/// `NITTable::NITItem` — one transport stream entry.
#[derive(Debug, Clone)]
pub struct NitTsEntry {
    /// `transport_stream_id`.
    pub transport_stream_id: u16,
    /// `original_network_id`.
    pub original_network_id: u16,
    /// Per-transport-stream descriptor loop.
    pub descriptors: DescriptorBlock,
}

/// Decoded Network Information Table section.
#[derive(Debug, Clone)]
pub struct Nit {
    /// `network_id`, which doubles as this table's unique id per spec section 4.4.
    pub network_id: u16,
    /// `version_number`.
    pub version_number: u8,
    /// Whether this is the actual network (`table_id == 0x40`) or other (`0x41`).
    pub actual: bool,
    /// Network-level descriptor loop, typically carrying [`Descriptor::NetworkName`].
    pub network_descriptors: DescriptorBlock,
    /// One entry per transport stream listed.
    pub transport_streams: Vec<NitTsEntry>,
}

/// Parses an NIT section payload.
pub fn parse_nit(section: &Section) -> Option<Nit> {
    let actual = match section.header.table_id {
        0x40 => true,
        0x41 => false,
        _ => return None,
    };
    let payload = section.payload();
    let mut r = SliceReader::new(payload);
    let network_descriptors_length = (r.read_be_u16().ok()? & 0x0FFF) as usize;
    let network_descriptors = DescriptorBlock::parse(r.read(network_descriptors_length).ok()?);
    let ts_loop_length = (r.read_be_u16().ok()? & 0x0FFF) as usize;
    let mut ts_reader = r.new_sub_reader(ts_loop_length).ok()?;

    let mut transport_streams = Vec::new();
    while ts_reader.remaining_len() >= 6 {
        let transport_stream_id = ts_reader.read_be_u16().ok()?;
        let original_network_id = ts_reader.read_be_u16().ok()?;
        let descriptors_loop_length = (ts_reader.read_be_u16().ok()? & 0x0FFF) as usize;
        let descriptors = DescriptorBlock::parse(ts_reader.read(descriptors_loop_length).ok()?);
        transport_streams.push(NitTsEntry {
            transport_stream_id,
            original_network_id,
            descriptors,
        });
    }

    Some(Nit {
        network_id: section.header.table_id_extension,
        version_number: section.header.version_number,
        actual,
        network_descriptors,
        transport_streams,
    })
}

/// `EITTable::EventInfo` — one event entry, pre-ARIB-string-decode.
#[derive(Debug, Clone)]
pub struct EitEventEntry {
    /// `event_id`.
    pub event_id: u16,
    /// `start_time`: raw 16-bit MJD + 24-bit BCD h:m:s, decoded by [`crate::time`].
    pub start_time_raw: (u16, u32),
    /// `duration`: raw 24-bit BCD h:m:s.
    pub duration_raw: u32,
    /// `running_status`.
    pub running_status: u8,
    /// `free_CA_mode`.
    pub free_ca_mode: bool,
    /// Per-event descriptor loop (short/extended event, component, content, ...).
    pub descriptors: DescriptorBlock,
}

/// Decoded Event Information Table section.
#[derive(Debug, Clone)]
pub struct Eit {
    /// `service_id`.
    pub service_id: u16,
    /// `transport_stream_id`.
    pub transport_stream_id: u16,
    /// `original_network_id`.
    pub network_id: u16,
    /// `version_number`.
    pub version_number: u8,
    /// `table_id`: `0x4E`/`0x4F` (p/f actual/other), `0x50`-`0x57` (schedule basic),
    /// `0x58`-`0x5F` (schedule extended), `0x60`-`0x6F` (schedule other).
    pub table_id: u8,
    /// `section_number`.
    pub section_number: u8,
    /// `segment_last_section_number`.
    pub segment_last_section_number: u8,
    /// `last_table_id`.
    pub last_table_id: u8,
    /// Every event in this section, in document order.
    pub events: Vec<EitEventEntry>,
}

impl Eit {
    /// Whether this table_id range denotes present/following (as opposed to schedule).
    pub fn is_present_following(&self) -> bool {
        matches!(self.table_id, 0x4E | 0x4F)
    }

    /// Whether this is the actual-TS EIT (as opposed to an "other" EIT).
    pub fn is_actual(&self) -> bool {
        matches!(self.table_id, 0x4E | 0x50..=0x57 | 0x58..=0x5F)
    }

    /// Whether `table_id` falls in the extended schedule range (`0x58..=0x5F` for
    /// actual, `0x68..=0x6F` for other) per spec section 6's two-bank resolution.
    pub fn is_extended_schedule(&self) -> bool {
        matches!(self.table_id, 0x58..=0x5F | 0x68..=0x6F)
    }

    /// `0..8`: this section's position within its 8-section schedule segment.
    pub fn segment_index(&self) -> u8 {
        self.section_number % 8
    }
}

/// `EITMultiTable::MakeTableUniqueID`: packs network/transport-stream/service ids into
/// one key for the segmented multi-section slot table.
pub fn eit_unique_id(network_id: u16, transport_stream_id: u16, service_id: u16) -> u64 {
    ((network_id as u64) << 32) | ((transport_stream_id as u64) << 16) | service_id as u64
}

/// Parses an EIT section payload.
pub fn parse_eit(section: &Section) -> Option<Eit> {
    if !matches!(section.header.table_id, 0x4E..=0x6F) {
        return None;
    }
    let payload = section.payload();
    let mut r = SliceReader::new(payload);
    let transport_stream_id = r.read_be_u16().ok()?;
    let network_id = r.read_be_u16().ok()?;
    let segment_last_section_number = r.read_u8().ok()?;
    let last_table_id = r.read_u8().ok()?;

    let mut events = Vec::new();
    while r.remaining_len() >= 12 {
        let event_id = r.read_be_u16().ok()?;
        let mjd = r.read_be_u16().ok()?;
        let start_bcd = r.read_array_ref::<3>().ok()?;
        let start_time_raw = (
            mjd,
            ((start_bcd[0] as u32) << 16) | ((start_bcd[1] as u32) << 8) | start_bcd[2] as u32,
        );
        let dur_bcd = r.read_array_ref::<3>().ok()?;
        let duration_raw =
            ((dur_bcd[0] as u32) << 16) | ((dur_bcd[1] as u32) << 8) | dur_bcd[2] as u32;
        let b = r.read_be_u16().ok()?;
        let running_status = ((b >> 13) & 0x07) as u8;
        let free_ca_mode = b & 0x1000 != 0;
        let descriptors_loop_length = (b & 0x0FFF) as usize;
        let descriptors = DescriptorBlock::parse(r.read(descriptors_loop_length).ok()?);
        events.push(EitEventEntry {
            event_id,
            start_time_raw,
            duration_raw,
            running_status,
            free_ca_mode,
            descriptors,
        });
    }

    Some(Eit {
        service_id: section.header.table_id_extension,
        transport_stream_id,
        network_id,
        version_number: section.header.version_number,
        table_id: section.header.table_id,
        section_number: section.header.section_number,
        segment_last_section_number,
        last_table_id,
        events,
    })
}

/// Decoded Time Offset Table section.
#[derive(Debug, Clone)]
pub struct Tot {
    /// `JST_time`: raw 16-bit MJD + 24-bit BCD h:m:s, decoded by [`crate::time`].
    pub jst_time_raw: (u16, u32),
    /// Descriptor loop, typically carrying one or more [`Descriptor::LocalTimeOffset`].
    pub descriptors: DescriptorBlock,
}

/// Parses a TOT section payload. TOT sections are never extended-syntax, so there is no
/// `table_id_extension`/CRC to verify at this layer beyond what the reassembler already did.
pub fn parse_tot(section: &Section) -> Option<Tot> {
    if section.header.table_id != 0x73 {
        return None;
    }
    let payload = section.payload();
    let mut r = SliceReader::new(payload);
    let mjd = r.read_be_u16().ok()?;
    let bcd = r.read_array_ref::<3>().ok()?;
    let jst_time_raw = (
        mjd,
        ((bcd[0] as u32) << 16) | ((bcd[1] as u32) << 8) | bcd[2] as u32,
    );
    let descriptors_loop_length = (r.read_be_u16().ok()? & 0x0FFF) as usize;
    let descriptors = DescriptorBlock::parse(r.read(descriptors_loop_length).ok()?);
    Some(Tot {
        jst_time_raw,
        descriptors,
    })
}

/// `BITTable::BroadcasterInfo` — one broadcaster entry.
#[derive(Debug, Clone)]
pub struct BitBroadcasterEntry {
    /// `broadcaster_id`.
    pub broadcaster_id: u8,
    /// Per-broadcaster descriptor loop.
    pub descriptors: DescriptorBlock,
}

/// Decoded Broadcaster Information Table section.
#[derive(Debug, Clone)]
pub struct Bit {
    /// `original_network_id`.
    pub network_id: u16,
    /// `version_number`.
    pub version_number: u8,
    /// `broadcast_view_propriety`.
    pub broadcast_view_propriety: bool,
    /// BIT-level descriptor loop.
    pub descriptors: DescriptorBlock,
    /// One entry per broadcaster listed.
    pub broadcasters: Vec<BitBroadcasterEntry>,
}

/// Parses a BIT section payload.
pub fn parse_bit(section: &Section) -> Option<Bit> {
    if section.header.table_id != 0xC4 {
        return None;
    }
    let payload = section.payload();
    let mut r = SliceReader::new(payload);
    let b = r.read_u8().ok()?;
    let broadcast_view_propriety = b & 0x08 != 0;
    let descriptors_loop_length = (r.read_be_u16().ok()? & 0x0FFF) as usize;
    let descriptors = DescriptorBlock::parse(r.read(descriptors_loop_length).ok()?);

    let mut broadcasters = Vec::new();
    while r.remaining_len() >= 3 {
        let broadcaster_id = r.read_u8().ok()?;
        let bcast_descriptors_loop_length = (r.read_be_u16().ok()? & 0x0FFF) as usize;
        let bcast_descriptors =
            DescriptorBlock::parse(r.read(bcast_descriptors_loop_length).ok()?);
        broadcasters.push(BitBroadcasterEntry {
            broadcaster_id,
            descriptors: bcast_descriptors,
        });
    }

    Some(Bit {
        network_id: section.header.table_id_extension,
        version_number: section.header.version_number,
        broadcast_view_propriety,
        descriptors,
        broadcasters,
    })
}

/// `CDTTable::DATA_TYPE_LOGO`.
pub const CDT_DATA_TYPE_LOGO: u8 = 0x01;

/// Decoded Common Data Table section (carries, e.g., channel logo bitmaps).
#[derive(Debug, Clone)]
pub struct Cdt {
    /// `original_network_id`.
    pub network_id: u16,
    /// `data_type`.
    pub data_type: u8,
    /// Descriptor loop preceding the data module.
    pub descriptors: DescriptorBlock,
    /// Raw `data_module_byte` payload (e.g. a PNG-compressed logo bitmap).
    pub data_module: SmallVec<[u8; 16]>,
}

/// Parses a CDT section payload. CDT is a `PSIStreamTable` in the source (each section
/// stands alone with no table_id_extension versioning); `table_id_extension` here is
/// unused since CDT doesn't carry one.
pub fn parse_cdt(section: &Section) -> Option<Cdt> {
    if section.header.table_id != 0xC8 {
        return None;
    }
    let payload = section.payload();
    let mut r = SliceReader::new(payload);
    let network_id = r.read_be_u16().ok()?;
    let data_type = r.read_u8().ok()?;
    let descriptors_loop_length = (r.read_be_u16().ok()? & 0x0FFF) as usize;
    let descriptors = DescriptorBlock::parse(r.read(descriptors_loop_length).ok()?);
    let data_module = SmallVec::from_slice(r.read_to_end());
    Some(Cdt {
        network_id,
        data_type,
        descriptors,
        data_module,
    })
}

/// `SDTTTable::ScheduleDescription` — one update-window entry.
#[derive(Debug, Clone, Copy)]
pub struct SdttScheduleEntry {
    /// `start_time`, raw MJD+BCD.
    pub start_time_raw: (u16, u32),
    /// `duration`, raw BCD h:m:s.
    pub duration_raw: u32,
}

/// `SDTTTable::ContentInfo` — one downloadable content entry.
#[derive(Debug, Clone)]
pub struct SdttContentEntry {
    /// `group`.
    pub group_id: u8,
    /// `target_version`.
    pub target_version: u16,
    /// `new_version`.
    pub new_version: u16,
    /// `download_level`.
    pub download_level: u8,
    /// `version_indicator`.
    pub version_indicator: u8,
    /// Update schedule windows, if `schedule_timeshift_information != 0xF` (no schedule).
    pub schedule: SmallVec<[SdttScheduleEntry; 2]>,
    /// Per-content descriptor loop.
    pub descriptors: DescriptorBlock,
}

/// Decoded Software Download Trigger Table section.
#[derive(Debug, Clone)]
pub struct Sdtt {
    /// `table_id_extension` high byte: `maker_id`.
    pub maker_id: u8,
    /// `table_id_extension` low byte: `model_id`.
    pub model_id: u8,
    /// `transport_stream_id`.
    pub transport_stream_id: u16,
    /// `original_network_id`.
    pub network_id: u16,
    /// `service_id`.
    pub service_id: u16,
    /// One entry per `num_of_contents`.
    pub contents: Vec<SdttContentEntry>,
}

/// Parses an SDTT section payload.
pub fn parse_sdtt(section: &Section) -> Option<Sdtt> {
    if section.header.table_id != 0xC3 {
        return None;
    }
    let maker_id = (section.header.table_id_extension >> 8) as u8;
    let model_id = (section.header.table_id_extension & 0xFF) as u8;
    let payload = section.payload();
    let mut r = SliceReader::new(payload);
    let transport_stream_id = r.read_be_u16().ok()?;
    let network_id = r.read_be_u16().ok()?;
    let service_id = r.read_be_u16().ok()?;
    let num_of_contents = r.read_u8().ok()?;

    let mut contents = Vec::with_capacity(num_of_contents as usize);
    for _ in 0..num_of_contents {
        let b0 = r.read_u8().ok()?;
        let group_id = b0 >> 5;
        let b1 = r.read_u8().ok()?;
        let target_version = (((b0 & 0x1F) as u16) << 7) | (b1 >> 1) as u16;
        let new_version = r.read_be_u16().ok()? >> 4;
        let b3 = r.read_u8().ok()?;
        let download_level = b3 >> 6;
        let version_indicator = (b3 >> 4) & 0x03;
        let schedule_timeshift_information = b3 & 0x0F;
        let content_descriptor_length = (r.read_be_u16().ok()? & 0x0FFF) as usize;
        let descriptors = DescriptorBlock::parse(r.read(content_descriptor_length).ok()?);

        let mut schedule = SmallVec::new();
        if schedule_timeshift_information == 0x0 {
            let schedule_description_length = (r.read_be_u16().ok()? & 0x0FFF) as usize;
            let mut sched_reader = r.new_sub_reader(schedule_description_length).ok()?;
            while sched_reader.remaining_len() >= 8 {
                let mjd = sched_reader.read_be_u16().ok()?;
                let start_bcd = sched_reader.read_array_ref::<3>().ok()?;
                let dur_bcd = sched_reader.read_array_ref::<3>().ok()?;
                schedule.push(SdttScheduleEntry {
                    start_time_raw: (
                        mjd,
                        ((start_bcd[0] as u32) << 16)
                            | ((start_bcd[1] as u32) << 8)
                            | start_bcd[2] as u32,
                    ),
                    duration_raw: ((dur_bcd[0] as u32) << 16)
                        | ((dur_bcd[1] as u32) << 8)
                        | dur_bcd[2] as u32,
                });
            }
        }

        contents.push(SdttContentEntry {
            group_id,
            target_version,
            new_version,
            download_level,
            version_indicator,
            schedule,
            descriptors,
        });
    }

    Some(Sdtt {
        maker_id,
        model_id,
        transport_stream_id,
        network_id,
        service_id,
        contents,
    })
}

/// `PSISingleTable`'s retention rule: holds the latest section's raw bytes and decoded
/// value, and only reports a change when the new section's content differs byte-for-byte
/// from what's already stored. Used for PAT, CAT, TOT, and per-PID PMT.
#[derive(Debug, Default)]
pub struct SingleTableSlot<T> {
    raw: Option<Vec<u8>>,
    value: Option<T>,
}

impl<T> SingleTableSlot<T> {
    /// Empty slot, nothing retained yet.
    pub fn new() -> Self {
        Self {
            raw: None,
            value: None,
        }
    }

    /// Feeds a newly reassembled section and its decode. Returns `Some(&T)` only when the
    /// section's content bytes differ from whatever was previously retained (including the
    /// very first section seen); returns `None` on a byte-identical repeat, matching
    /// `PSISingleTable::OnSectionUpdated`'s `memcmp` gate.
    pub fn update(&mut self, section: &Section, value: T) -> Option<&T> {
        let raw = section.raw();
        let changed = self.raw.as_deref() != Some(raw);
        if changed {
            self.raw = Some(raw.to_vec());
            self.value = Some(value);
        }
        if changed {
            self.value.as_ref()
        } else {
            None
        }
    }

    /// The most recently retained value, regardless of whether the last `update` call
    /// reported a change.
    pub fn current(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

/// One entry of a [`MultiTableSet`]: a version-gated vector of per-section slots.
#[derive(Debug, Default)]
struct MultiTableEntry<T> {
    version_number: Option<u8>,
    sections: Vec<Option<T>>,
}

/// `PSITableSet`/segmented multi-section table retention: a map of
/// `(table_id, unique_id) -> {version_number, Vec<Option<T>>}`, one vector slot per
/// `section_number` up to `last_section_number`. A `version_number` change clears the
/// slot vector before the new section repopulates it, per spec section 4.4.
#[derive(Debug, Default)]
pub struct MultiTableSet<T> {
    entries: HashMap<(u8, u64), MultiTableEntry<T>>,
}

impl<T> MultiTableSet<T> {
    /// Empty set.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Feeds one section's decode into the slot keyed by `(table_id, unique_id)`. Returns
    /// `true` if the value at `section_number` changed (new version, or first time this
    /// section_number was populated in the current version).
    pub fn update(
        &mut self,
        table_id: u8,
        unique_id: u64,
        version_number: u8,
        section_number: u8,
        last_section_number: u8,
        value: T,
    ) -> bool {
        let entry = self
            .entries
            .entry((table_id, unique_id))
            .or_insert_with(MultiTableEntry::default);

        if entry.version_number != Some(version_number) {
            entry.version_number = Some(version_number);
            entry.sections = Vec::new();
        }

        let needed_len = last_section_number as usize + 1;
        if entry.sections.len() < needed_len {
            entry.sections.resize_with(needed_len, || None);
        }

        let slot = &mut entry.sections[section_number as usize];
        let was_empty = slot.is_none();
        *slot = Some(value);
        was_empty
    }

    /// Whether every section slot for `(table_id, unique_id)` up to its last known
    /// `last_section_number` has been populated.
    pub fn is_complete(&self, table_id: u8, unique_id: u64) -> bool {
        self.entries
            .get(&(table_id, unique_id))
            .map(|e| !e.sections.is_empty() && e.sections.iter().all(Option::is_some))
            .unwrap_or(false)
    }

    /// All populated section values for `(table_id, unique_id)`, in `section_number` order.
    pub fn sections(&self, table_id: u8, unique_id: u64) -> impl Iterator<Item = &T> {
        self.entries
            .get(&(table_id, unique_id))
            .into_iter()
            .flat_map(|e| e.sections.iter().filter_map(Option::as_ref))
    }

    /// Removes the slot for `(table_id, unique_id)` entirely, e.g. on service removal.
    pub fn remove(&mut self, table_id: u8, unique_id: u64) {
        self.entries.remove(&(table_id, unique_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crc::{Crc, CRC_32_MPEG_2};

    fn build_section(table_id: u8, table_id_ext: u16, version: u8, body: &[u8]) -> Section {
        const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);
        let section_length = 5 + body.len() + 4;
        let mut bytes = Vec::new();
        bytes.push(table_id);
        bytes.push(0xF0 | ((section_length >> 8) as u8 & 0x0F));
        bytes.push((section_length & 0xFF) as u8);
        bytes.push((table_id_ext >> 8) as u8);
        bytes.push((table_id_ext & 0xFF) as u8);
        bytes.push(0xC0 | (version << 1) | 0x01);
        bytes.push(0x00);
        bytes.push(0x00);
        bytes.extend_from_slice(body);
        let crc = CRC.checksum(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());

        let mut packet = vec![0x00];
        packet.extend_from_slice(&bytes);
        packet.resize(184, 0xFF);
        let mut r = crate::section::Reassembler::new();
        r.store_packet(&packet, true).remove(0)
    }

    #[test]
    fn pat_exposes_nit_and_pmt_pids() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x00, 0x00, 0xE0, 0x10]); // program 0 -> NIT PID 0x10
        body.extend_from_slice(&[0x00, 0x01, 0xE1, 0x00]); // program 1 -> PMT PID 0x100
        let section = build_section(0x00, 0x0001, 0, &body);
        let pat = parse_pat(&section).unwrap();
        assert_eq!(pat.nit_pid(), Some(0x10));
        assert_eq!(pat.pmt_pid(1), Some(0x100));
        assert!(pat.is_pmt_pid(0x100));
        assert!(!pat.is_pmt_pid(0x10));
    }

    #[test]
    fn pmt_decodes_pcr_pid_and_es_list() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0xE1, 0x00]); // PCR PID 0x100
        body.extend_from_slice(&[0xF0, 0x00]); // no program descriptors
        body.extend_from_slice(&[0x02, 0xE1, 0x01, 0xF0, 0x00]); // video ES on 0x101
        let section = build_section(0x02, 0x0001, 0, &body);
        let pmt = parse_pmt(&section).unwrap();
        assert_eq!(pmt.pcr_pid, 0x100);
        assert_eq!(pmt.es.len(), 1);
        assert_eq!(pmt.es[0].pid, 0x101);
        assert_eq!(pmt.es[0].stream_type, 0x02);
    }

    #[test]
    fn sdt_decodes_service_running_status() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x00, 0x01]); // network_id
        body.push(0xFF); // reserved_future_use
        body.extend_from_slice(&[0x00, 0x64]); // service_id
        body.push(0xFC); // reserved_future_use + EIT flags both 0
        body.extend_from_slice(&[0b0110_0000, 0x00]); // running_status=3, free_ca=0, dll=0
        let section = build_section(TABLE_ID_SDT_ACTUAL, 0x0001, 0, &body);
        let sdt = parse_sdt(&section).unwrap();
        assert!(sdt.actual);
        assert_eq!(sdt.services.len(), 1);
        assert_eq!(sdt.services[0].service_id, 0x64);
        assert_eq!(sdt.services[0].running_status, 3);
    }

    #[test]
    fn eit_unique_id_packs_three_identifiers() {
        let id = eit_unique_id(1, 2, 3);
        assert_eq!(id, (1u64 << 32) | (2u64 << 16) | 3u64);
    }

    #[test]
    fn eit_schedule_segment_index_wraps_every_eight_sections() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x00, 0x01]); // transport_stream_id
        body.extend_from_slice(&[0x00, 0x02]); // original_network_id
        body.push(0x07); // segment_last_section_number
        body.push(0x50); // last_table_id
        let mut section = build_section(0x50, 0x1234, 0, &body);
        section.header.section_number = 9;
        let eit = Eit {
            service_id: 0,
            transport_stream_id: 0,
            network_id: 0,
            version_number: 0,
            table_id: 0x50,
            section_number: 9,
            segment_last_section_number: 7,
            last_table_id: 0x50,
            events: Vec::new(),
        };
        assert_eq!(eit.segment_index(), 1);
        assert!(!eit.is_extended_schedule());
        assert!(!eit.is_present_following());
    }

    #[test]
    fn tot_table_id_gate_rejects_other_tables() {
        let section = build_section(0x00, 0, 0, &[0, 0, 0, 0, 0, 0xF0, 0x00]);
        assert!(parse_tot(&section).is_none());
    }

    #[test]
    fn single_table_slot_only_reports_changed_content() {
        let section_a = build_section(0x00, 1, 0, &[1, 2, 3]);
        let section_b = build_section(0x00, 1, 0, &[4, 5, 6]);
        let mut slot = SingleTableSlot::new();
        assert!(slot.update(&section_a, "a").is_some());
        assert!(slot.update(&section_a, "a-repeat").is_none());
        assert_eq!(slot.current(), Some(&"a"));
        assert_eq!(slot.update(&section_b, "b"), Some(&"b"));
        assert_eq!(slot.current(), Some(&"b"));
    }

    #[test]
    fn cat_finds_emm_pid_by_ca_system_id() {
        let mut body = Vec::new();
        body.push(0x09); // CA descriptor tag
        body.push(4);
        body.extend_from_slice(&[0x00, 0x05]); // ca_system_id
        body.extend_from_slice(&[0xE0, 0x30]); // ca_pid 0x030
        let section = build_section(0x01, 0, 0, &body);
        let cat = parse_cat(&section).unwrap();
        assert_eq!(cat.emm_pid(), Some(0x030));
        assert_eq!(cat.emm_pid_for_system(Some(0x05)), Some(0x030));
        assert_eq!(cat.emm_pid_for_system(Some(0x99)), None);
    }

    #[test]
    fn nit_decodes_network_and_transport_stream_loops() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0xF0, 0x00]); // no network descriptors
        body.extend_from_slice(&[0xF0, 0x06]); // ts_loop_length = 6
        body.extend_from_slice(&[0x00, 0x01]); // transport_stream_id
        body.extend_from_slice(&[0x00, 0x02]); // original_network_id
        body.extend_from_slice(&[0xF0, 0x00]); // no per-ts descriptors
        let section = build_section(0x40, 0x0003, 0, &body);
        let nit = parse_nit(&section).unwrap();
        assert!(nit.actual);
        assert_eq!(nit.network_id, 0x0003);
        assert_eq!(nit.transport_streams.len(), 1);
        assert_eq!(nit.transport_streams[0].transport_stream_id, 1);
        assert_eq!(nit.transport_streams[0].original_network_id, 2);
    }

    #[test]
    fn bit_decodes_broadcaster_loop() {
        let mut body = Vec::new();
        body.push(0x00); // broadcast_view_propriety=0
        body.extend_from_slice(&[0xF0, 0x00]); // no BIT-level descriptors
        body.push(0x7F); // broadcaster_id
        body.extend_from_slice(&[0xF0, 0x00]); // no per-broadcaster descriptors
        let section = build_section(0xC4, 0x0001, 0, &body);
        let bit = parse_bit(&section).unwrap();
        assert_eq!(bit.broadcasters.len(), 1);
        assert_eq!(bit.broadcasters[0].broadcaster_id, 0x7F);
    }

    #[test]
    fn cdt_preserves_trailing_data_module() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x00, 0x01]); // network_id
        body.push(CDT_DATA_TYPE_LOGO);
        body.extend_from_slice(&[0xF0, 0x00]); // no descriptors
        body.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]); // data_module
        let section = build_section(0xC8, 0, 0, &body);
        let cdt = parse_cdt(&section).unwrap();
        assert_eq!(cdt.data_type, CDT_DATA_TYPE_LOGO);
        assert_eq!(&cdt.data_module[..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn sdtt_decodes_one_content_with_no_schedule() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x00, 0x01]); // transport_stream_id
        body.extend_from_slice(&[0x00, 0x02]); // original_network_id
        body.extend_from_slice(&[0x00, 0x64]); // service_id
        body.push(1); // num_of_contents
        body.push(0b001_00000); // group=1, target_version hi bits 0
        body.push(0b0000_0001); // target_version lo bits 0, reserved=1
        body.extend_from_slice(&[0x00, 0x00]); // new_version=0 (+reserved)
        body.push(0b01_01_1111); // download_level=1, version_indicator=1, sched_ts=0xF (no schedule)
        body.extend_from_slice(&[0xF0, 0x00]); // content_descriptor_length=0
        let section = build_section(0xC3, 0x1234, 0, &body);
        let sdtt = parse_sdtt(&section).unwrap();
        assert_eq!(sdtt.maker_id, 0x12);
        assert_eq!(sdtt.model_id, 0x34);
        assert_eq!(sdtt.contents.len(), 1);
        assert_eq!(sdtt.contents[0].group_id, 1);
        assert!(sdtt.contents[0].schedule.is_empty());
    }

    #[test]
    fn multi_table_set_tracks_completeness_and_resets_on_version_bump() {
        let mut set = MultiTableSet::new();
        assert!(!set.update(0x42, 7, 0, 0, 1, "s0-v0"));
        assert!(!set.is_complete(0x42, 7));
        assert!(!set.update(0x42, 7, 0, 1, 1, "s1-v0"));
        assert!(set.is_complete(0x42, 7));

        // version bump clears the segment before repopulating.
        assert!(!set.update(0x42, 7, 1, 0, 1, "s0-v1"));
        assert!(!set.is_complete(0x42, 7));
        let sections: Vec<_> = set.sections(0x42, 7).copied().collect();
        assert_eq!(sections, vec!["s0-v1"]);
    }
}
