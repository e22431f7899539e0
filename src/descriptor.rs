//! Descriptor registry: tag-length-value records embedded in table entries.
//!
//! The source models descriptor polymorphism with a runtime type id and `dynamic_cast`
//! (`LibISDB::DescriptorBase` / `DescriptorBlock`, see `TS/DescriptorBase.hpp` and
//! `TS/Descriptors.hpp`). Per spec section "REDESIGN FLAGS", this is translated to a
//! tagged variant (sum type) keyed by the descriptor tag byte: [`Descriptor`] holds the
//! decoded fields for every tag this crate understands, plus a `Raw` catch-all for
//! everything else. Parsing a variant never fails the whole block: a descriptor whose
//! body doesn't fit its expected shape degrades to `Raw` rather than aborting the scan,
//! matching `StoreContents`'s bool-return/fall-through behavior in the source.

use crate::aribstr::{decode, DecodeFlags};
use crate::slice_reader::SliceReader;
use smallvec::SmallVec;

/// limited reception (CA) descriptor, tag `0x09`.
pub const TAG_CA: u8 = 0x09;
/// network name descriptor, tag `0x40`.
pub const TAG_NETWORK_NAME: u8 = 0x40;
/// service list descriptor, tag `0x41`.
pub const TAG_SERVICE_LIST: u8 = 0x41;
/// satellite delivery system descriptor, tag `0x43`.
pub const TAG_SATELLITE_DELIVERY_SYSTEM: u8 = 0x43;
/// service descriptor, tag `0x48`.
pub const TAG_SERVICE: u8 = 0x48;
/// short-form event descriptor, tag `0x4D`.
pub const TAG_SHORT_EVENT: u8 = 0x4D;
/// extended-form event descriptor, tag `0x4E`.
pub const TAG_EXTENDED_EVENT: u8 = 0x4E;
/// component descriptor, tag `0x50`.
pub const TAG_COMPONENT: u8 = 0x50;
/// stream identifier descriptor, tag `0x52`.
pub const TAG_STREAM_ID: u8 = 0x52;
pub const TAG_CA_IDENTIFIER: u8 = 0x53;
/// content descriptor, tag `0x54`.
pub const TAG_CONTENT: u8 = 0x54;
/// local time offset descriptor, tag `0x58`.
pub const TAG_LOCAL_TIME_OFFSET: u8 = 0x58;
/// hierarchical transmission descriptor, tag `0xC0`.
pub const TAG_HIERARCHICAL_TRANSMISSION: u8 = 0xC0;
/// digital copy control descriptor, tag `0xC1`.
pub const TAG_DIGITAL_COPY_CONTROL: u8 = 0xC1;
/// audio component descriptor, tag `0xC4`.
pub const TAG_AUDIO_COMPONENT: u8 = 0xC4;
/// CA service descriptor, tag `0xCC`.
pub const TAG_CA_SERVICE: u8 = 0xCC;
/// extended broadcaster descriptor, tag `0xCE`.
pub const TAG_EXTENDED_BROADCASTER: u8 = 0xCE;
/// logo transmission descriptor, tag `0xCF`.
pub const TAG_LOGO_TRANSMISSION: u8 = 0xCF;
/// series descriptor, tag `0xD5`.
pub const TAG_SERIES: u8 = 0xD5;
/// event group descriptor, tag `0xD6`.
pub const TAG_EVENT_GROUP: u8 = 0xD6;
/// broadcaster name descriptor, tag `0xD8`.
pub const TAG_BROADCASTER_NAME: u8 = 0xD8;
/// component group descriptor, tag `0xD9`.
pub const TAG_COMPONENT_GROUP: u8 = 0xD9;
/// terrestrial delivery system descriptor, tag `0xFA`.
pub const TAG_TERRESTRIAL_DELIVERY_SYSTEM: u8 = 0xFA;
/// partial reception descriptor, tag `0xFB`.
pub const TAG_PARTIAL_RECEPTION: u8 = 0xFB;
/// emergency information descriptor, tag `0xFC`.
pub const TAG_EMERGENCY_INFORMATION: u8 = 0xFC;
/// data component descriptor, tag `0xFD`.
pub const TAG_DATA_COMPONENT: u8 = 0xFD;
/// system management descriptor, tag `0xFE`.
pub const TAG_SYSTEM_MANAGEMENT: u8 = 0xFE;
/// TS information descriptor, tag `0xCD`. Carries the NIT-level remote-control key id and
/// transport stream name spec section 4.7 names under "NIT analysis"; enriched beyond
/// spec.md's explicit descriptor list per SPEC_FULL.md §4 (an unnamed-but-reachable tag).
pub const TAG_TS_INFORMATION: u8 = 0xCD;

/// One entry of a [`ServiceListDescriptor`](Descriptor::ServiceList)'s service list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceListEntry {
    /// `service_id`.
    pub service_id: u16,
    /// `service_type`.
    pub service_type: u8,
}

/// One item of an [`ExtendedEventDescriptor`](Descriptor::ExtendedEvent)'s item list.
#[derive(Debug, Clone)]
pub struct ExtendedEventItem {
    /// `item_description_char`, decoded.
    pub description: String,
    /// `item_char`, decoded.
    pub item: String,
}

/// One nibble of a [`ContentDescriptor`](Descriptor::Content)'s classification list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentNibble {
    /// `content_nibble_level_1`.
    pub genre_level_1: u8,
    /// `content_nibble_level_2`.
    pub genre_level_2: u8,
    /// `user_nibble` (high).
    pub user_nibble_1: u8,
    /// `user_nibble` (low).
    pub user_nibble_2: u8,
}

/// Decoded `series_name_char` restoration of `LibISDB::SeriesDescriptor`, reachable from
/// an EIT event's descriptor list (see spec section 4 "Event::series" restoration).
#[derive(Debug, Clone)]
pub struct SeriesInfo {
    /// `series_id`.
    pub series_id: u16,
    /// `repeat_label`.
    pub repeat_label: u8,
    /// `program_pattern`.
    pub program_pattern: u8,
    /// `expire_date`, as raw MJD if `expire_date_valid_flag` is set. Resolved to a
    /// calendar date by [`crate::time`].
    pub expire_date_mjd: Option<u16>,
    /// `episode_number`.
    pub episode_number: u16,
    /// `last_episode_number`.
    pub last_episode_number: u16,
    /// `series_name_char`, decoded.
    pub name: String,
}

/// One entry of an [`EventGroupDescriptor`](Descriptor::EventGroup)'s event list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventGroupEntry {
    /// `service_id`.
    pub service_id: u16,
    /// `event_id`.
    pub event_id: u16,
    /// `original_network_id`.
    pub network_id: u16,
    /// `transport_stream_id`.
    pub transport_stream_id: u16,
}

/// Decoded descriptor variants this crate understands, plus a catch-all [`Descriptor::Raw`].
///
/// `DescriptorBlock::parse` (below) produces an ordered `Vec<Descriptor>` from the raw
/// tag/length/value stream; `get_by_tag`/`enumerate`-style access is just iterator
/// filtering over that vector, since matching on a Rust enum is already the natural
/// per-tag query.
#[derive(Debug, Clone)]
pub enum Descriptor {
    /// `CADescriptor` (tag `0x09`).
    Ca {
        /// `CA_system_ID`.
        ca_system_id: u16,
        /// `CA_PID`.
        ca_pid: u16,
        /// `private_data_byte`.
        private_data: SmallVec<[u8; 8]>,
    },
    /// `NetworkNameDescriptor` (tag `0x40`).
    NetworkName {
        /// `network_name`, decoded.
        name: String,
    },
    /// `ServiceListDescriptor` (tag `0x41`).
    ServiceList {
        /// `(service_id, service_type)` pairs.
        services: SmallVec<[ServiceListEntry; 4]>,
    },
    /// `SatelliteDeliverySystemDescriptor` (tag `0x43`).
    SatelliteDeliverySystem {
        /// `frequency`, BCD-decoded to units of 10 kHz.
        frequency: u32,
        /// `orbital_position`, BCD-decoded to units of 0.1 degree.
        orbital_position: u16,
        /// `west_east_flag`.
        west_east_flag: bool,
        /// `polarisation`.
        polarization: u8,
        /// `modulation`.
        modulation: u8,
        /// `symbol_rate`, BCD-decoded to units of 100 symbols/s.
        symbol_rate: u32,
        /// `FEC_inner`.
        fec_inner: u8,
    },
    /// `ServiceDescriptor` (tag `0x48`).
    Service {
        /// `service_type`.
        service_type: u8,
        /// `service_provider_name`, decoded.
        provider_name: String,
        /// `service_name`, decoded.
        service_name: String,
    },
    /// `ShortEventDescriptor` (tag `0x4D`).
    ShortEvent {
        /// `ISO_639_language_code`, packed as 3 ASCII bytes in a u32.
        language_code: u32,
        /// `event_name_char`, decoded.
        event_name: String,
        /// `text_char`, decoded.
        event_description: String,
    },
    /// `ExtendedEventDescriptor` (tag `0x4E`).
    ExtendedEvent {
        /// `descriptor_number`.
        descriptor_number: u8,
        /// `last_descriptor_number`.
        last_descriptor_number: u8,
        /// `ISO_639_language_code`.
        language_code: u32,
        /// `(item_description_char, item_char)` pairs.
        items: Vec<ExtendedEventItem>,
    },
    /// `ComponentDescriptor` (tag `0x50`).
    Component {
        /// `stream_content`.
        stream_content: u8,
        /// `component_type`.
        component_type: u8,
        /// `component_tag`.
        component_tag: u8,
        /// `ISO_639_language_code`.
        language_code: u32,
        /// `text_char`, decoded.
        text: String,
    },
    /// `StreamIDDescriptor` (tag `0x52`).
    StreamId {
        /// `component_tag`.
        component_tag: u8,
    },
    /// `CAIdentifierDescriptor` (tag `0x53`).
    CaIdentifier {
        /// `CA_system_id` list.
        ca_system_ids: SmallVec<[u16; 4]>,
    },
    /// `ContentDescriptor` (tag `0x54`).
    Content {
        /// Up to 7 classification nibbles (the source caps this at `7`).
        nibbles: SmallVec<[ContentNibble; 7]>,
    },
    /// `LocalTimeOffsetDescriptor` (tag `0x58`).
    LocalTimeOffset {
        /// `country_code`, packed as 3 ASCII bytes in a u32.
        country_code: u32,
        /// `country_region_id`.
        country_region_id: u8,
        /// `local_time_offset_polarity`.
        polarity: bool,
        /// `local_time_offset`, BCD `hhmm`.
        local_time_offset: u16,
        /// `time_of_change`, raw MJD+BCD per [`crate::time`].
        time_of_change: (u16, u32),
        /// `next_time_offset`, BCD `hhmm`.
        next_time_offset: u16,
    },
    /// `HierarchicalTransmissionDescriptor` (tag `0xC0`).
    HierarchicalTransmission {
        /// `quality_level`.
        quality_level: u8,
        /// `reference_PID`.
        reference_pid: u16,
    },
    /// `DigitalCopyControlDescriptor` (tag `0xC1`).
    DigitalCopyControl {
        /// `digital_recording_control_data`.
        digital_recording_control_data: u8,
        /// `maximum_bitrate`, if `maximum_bitrate_flag` was set.
        maximum_bit_rate: Option<u8>,
        /// `copy_control_type`/`APS_control_data`, if `component_control_flag` was set.
        copy_control_type: Option<u8>,
    },
    /// `AudioComponentDescriptor` (tag `0xC4`).
    AudioComponent {
        /// `stream_content`.
        stream_content: u8,
        /// `component_type`.
        component_type: u8,
        /// `component_tag`.
        component_tag: u8,
        /// `simulcast_group_tag`.
        simulcast_group_tag: u8,
        /// `ES_multi_lingual_flag`.
        es_multi_lingual_flag: bool,
        /// `main_component_flag`.
        main_component_flag: bool,
        /// `quality_indicator`.
        quality_indicator: u8,
        /// `sampling_rate`.
        sampling_rate: u8,
        /// `ISO_639_language_code`.
        language_code: u32,
        /// `ISO_639_language_code_2`, if `ES_multi_lingual_flag` was set.
        language_code_2: Option<u32>,
        /// `text_char`, decoded.
        text: String,
    },
    /// `CAServiceDescriptor` (tag `0xCC`).
    CaService {
        /// `CA_system_ID`.
        ca_system_id: u16,
        /// `ca_broadcaster_group_id`.
        ca_broadcaster_group_id: u8,
        /// `message_control`.
        message_control: u8,
        /// `service_id` list.
        service_ids: SmallVec<[u16; 4]>,
    },
    /// `ExtendedBroadcasterDescriptor` (tag `0xCE`).
    ExtendedBroadcaster {
        /// `broadcaster_type`.
        broadcaster_type: u8,
        /// raw remainder of the payload; the terrestrial-broadcaster-info shape is
        /// broadcaster-type-specific and not decoded further (no consumer needs it).
        data: SmallVec<[u8; 8]>,
    },
    /// `LogoTransmissionDescriptor` (tag `0xCF`).
    LogoTransmission {
        /// `logo_transmission_type`.
        logo_transmission_type: u8,
        /// `logo_id`, if present for this transmission type.
        logo_id: Option<u16>,
        /// `logo_version`, if present.
        logo_version: Option<u16>,
        /// `download_data_id`, if present.
        download_data_id: Option<u16>,
    },
    /// `SeriesDescriptor` (tag `0xD5`).
    Series(SeriesInfo),
    /// `EventGroupDescriptor` (tag `0xD6`).
    EventGroup {
        /// `group_type`.
        group_type: u8,
        /// `(service_id, event_id, original_network_id, transport_stream_id)` tuples.
        events: SmallVec<[EventGroupEntry; 2]>,
    },
    /// `BroadcasterNameDescriptor` (tag `0xD8`).
    BroadcasterName {
        /// `broadcaster_name`, decoded.
        name: String,
    },
    /// `ComponentGroupDescriptor` (tag `0xD9`). Only the group count and total-bit-rate
    /// flag are surfaced; the nested CA-unit/component-tag table is not decoded further
    /// (no consumer needs it).
    ComponentGroup {
        /// `component_group_type`.
        component_group_type: u8,
        /// `total_bit_rate_flag`.
        total_bit_rate_flag: bool,
        /// number of `num_of_group` entries present.
        group_count: u8,
    },
    /// `TerrestrialDeliverySystemDescriptor` (tag `0xFA`).
    TerrestrialDeliverySystem {
        /// `area_code`.
        area_code: u16,
        /// `guard_interval`.
        guard_interval: u8,
        /// `transmission_mode`.
        transmission_mode: u8,
        /// `frequency` list.
        frequencies: SmallVec<[u16; 4]>,
    },
    /// `PartialReceptionDescriptor` (tag `0xFB`). Consumed by [`crate::oneseg`]'s gate.
    PartialReception {
        /// `service_id` list (up to 3 per the source's fixed-size `m_ServiceList[3]`).
        service_ids: SmallVec<[u16; 3]>,
    },
    /// `EmergencyInformationDescriptor` (tag `0xFC`).
    EmergencyInformation {
        /// One entry per flagged service.
        services: SmallVec<[EmergencyInformationEntry; 2]>,
    },
    /// `DataComponentDescriptor` (tag `0xFD`).
    DataComponent {
        /// `data_component_id`.
        data_component_id: u16,
        /// `additional_data_component_info`.
        additional_info: SmallVec<[u8; 8]>,
    },
    /// `SystemManagementDescriptor` (tag `0xFE`).
    SystemManagement {
        /// `broadcasting_flag`.
        broadcasting_flag: u8,
        /// `broadcasting_identifier`.
        broadcasting_id: u8,
        /// `additional_broadcasting_identification`.
        additional_broadcasting_id: u8,
    },
    /// `TSInformationDescriptor` (tag `0xCD`). Only the remote-control key id and
    /// transport stream name are surfaced; the nested transmission-type/service-id loop
    /// is not decoded further (no consumer needs it).
    TsInformation {
        /// `remote_control_key_id`.
        remote_control_key_id: u8,
        /// `ts_name_char`, decoded.
        ts_name: String,
    },
    /// Unknown or malformed descriptor: tag and raw body preserved as-is. Per the
    /// source's `StoreContents` contract, a recognized tag whose body doesn't parse also
    /// falls back here rather than aborting the surrounding block.
    Raw {
        /// The descriptor's tag byte.
        tag: u8,
        /// Raw `descriptor_data_byte` bytes.
        data: SmallVec<[u8; 8]>,
    },
}

/// `EmergencyInformationDescriptor`'s per-service entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyInformationEntry {
    /// `service_id`.
    pub service_id: u16,
    /// `start_end_flag`.
    pub start_end_flag: bool,
    /// `signal_level`.
    pub signal_level: bool,
}

impl Descriptor {
    /// The tag byte this descriptor was (or would be) encoded with.
    pub fn tag(&self) -> u8 {
        match self {
            Descriptor::Ca { .. } => TAG_CA,
            Descriptor::NetworkName { .. } => TAG_NETWORK_NAME,
            Descriptor::ServiceList { .. } => TAG_SERVICE_LIST,
            Descriptor::SatelliteDeliverySystem { .. } => TAG_SATELLITE_DELIVERY_SYSTEM,
            Descriptor::Service { .. } => TAG_SERVICE,
            Descriptor::ShortEvent { .. } => TAG_SHORT_EVENT,
            Descriptor::ExtendedEvent { .. } => TAG_EXTENDED_EVENT,
            Descriptor::Component { .. } => TAG_COMPONENT,
            Descriptor::StreamId { .. } => TAG_STREAM_ID,
            Descriptor::CaIdentifier { .. } => TAG_CA_IDENTIFIER,
            Descriptor::Content { .. } => TAG_CONTENT,
            Descriptor::LocalTimeOffset { .. } => TAG_LOCAL_TIME_OFFSET,
            Descriptor::HierarchicalTransmission { .. } => TAG_HIERARCHICAL_TRANSMISSION,
            Descriptor::DigitalCopyControl { .. } => TAG_DIGITAL_COPY_CONTROL,
            Descriptor::AudioComponent { .. } => TAG_AUDIO_COMPONENT,
            Descriptor::CaService { .. } => TAG_CA_SERVICE,
            Descriptor::ExtendedBroadcaster { .. } => TAG_EXTENDED_BROADCASTER,
            Descriptor::LogoTransmission { .. } => TAG_LOGO_TRANSMISSION,
            Descriptor::Series(_) => TAG_SERIES,
            Descriptor::EventGroup { .. } => TAG_EVENT_GROUP,
            Descriptor::BroadcasterName { .. } => TAG_BROADCASTER_NAME,
            Descriptor::ComponentGroup { .. } => TAG_COMPONENT_GROUP,
            Descriptor::TerrestrialDeliverySystem { .. } => TAG_TERRESTRIAL_DELIVERY_SYSTEM,
            Descriptor::PartialReception { .. } => TAG_PARTIAL_RECEPTION,
            Descriptor::EmergencyInformation { .. } => TAG_EMERGENCY_INFORMATION,
            Descriptor::DataComponent { .. } => TAG_DATA_COMPONENT,
            Descriptor::SystemManagement { .. } => TAG_SYSTEM_MANAGEMENT,
            Descriptor::TsInformation { .. } => TAG_TS_INFORMATION,
            Descriptor::Raw { tag, .. } => *tag,
        }
    }

    fn raw(tag: u8, body: &[u8]) -> Self {
        Descriptor::Raw {
            tag,
            data: SmallVec::from_slice(body),
        }
    }

    /// Decodes one descriptor from `tag`/`body` (the bytes following the length byte).
    /// Never fails: an unrecognized tag, or a recognized tag whose body is too short for
    /// its fixed fields, both produce [`Descriptor::Raw`].
    fn parse_one(tag: u8, body: &[u8]) -> Self {
        let mut r = SliceReader::new(body);
        match tag {
            TAG_CA => (|| -> crate::error::Result<Descriptor> {
                let ca_system_id = r.read_be_u16()?;
                let ca_pid = r.read_be_u16()? & 0x1FFF;
                let private_data = SmallVec::from_slice(r.read_to_end());
                Ok(Descriptor::Ca {
                    ca_system_id,
                    ca_pid,
                    private_data,
                })
            })(),
            TAG_NETWORK_NAME => Ok(Descriptor::NetworkName {
                name: decode(r.read_to_end(), DecodeFlags::default()),
            }),
            TAG_SERVICE_LIST => (|| -> crate::error::Result<Descriptor> {
                let mut services = SmallVec::new();
                while r.remaining_len() >= 3 {
                    let service_id = r.read_be_u16()?;
                    let service_type = r.read_u8()?;
                    services.push(ServiceListEntry {
                        service_id,
                        service_type,
                    });
                }
                Ok(Descriptor::ServiceList { services })
            })(),
            TAG_SATELLITE_DELIVERY_SYSTEM => (|| -> crate::error::Result<Descriptor> {
                let frequency = bcd_to_u32(&r.read_array_ref::<4>()?);
                let orbital_position = bcd_to_u16(&r.read_array_ref::<2>()?);
                let b = r.read_u8()?;
                let west_east_flag = b & 0x80 != 0;
                let polarization = (b >> 5) & 0x3;
                let modulation = b & 0x1F;
                let sym = r.read_array_ref::<4>()?;
                let symbol_rate = bcd_to_u32(&[sym[0], sym[1], sym[2], sym[3] & 0xF0]) >> 4;
                let fec_inner = sym[3] & 0x0F;
                Ok(Descriptor::SatelliteDeliverySystem {
                    frequency,
                    orbital_position,
                    west_east_flag,
                    polarization,
                    modulation,
                    symbol_rate,
                    fec_inner,
                })
            })(),
            TAG_SERVICE => (|| -> crate::error::Result<Descriptor> {
                let service_type = r.read_u8()?;
                let provider_len = r.read_u8()? as usize;
                let provider_name = decode(r.read(provider_len)?, DecodeFlags::default());
                let service_len = r.read_u8()? as usize;
                let service_name = decode(r.read(service_len)?, DecodeFlags::default());
                Ok(Descriptor::Service {
                    service_type,
                    provider_name,
                    service_name,
                })
            })(),
            TAG_SHORT_EVENT => (|| -> crate::error::Result<Descriptor> {
                let language_code = ascii3_to_u32(&r.read_array_ref::<3>()?);
                let name_len = r.read_u8()? as usize;
                let event_name = decode(r.read(name_len)?, DecodeFlags::default());
                let desc_len = r.read_u8()? as usize;
                let event_description = decode(r.read(desc_len)?, DecodeFlags::default());
                Ok(Descriptor::ShortEvent {
                    language_code,
                    event_name,
                    event_description,
                })
            })(),
            TAG_EXTENDED_EVENT => (|| -> crate::error::Result<Descriptor> {
                let descriptor_number_byte = r.read_u8()?;
                let descriptor_number = descriptor_number_byte >> 4;
                let last_descriptor_number = descriptor_number_byte & 0x0F;
                let language_code = ascii3_to_u32(&r.read_array_ref::<3>()?);
                let items_len = r.read_u8()? as usize;
                let mut item_reader = r.new_sub_reader(items_len)?;
                let mut items = Vec::new();
                while item_reader.remaining_len() > 0 {
                    let dlen = item_reader.read_u8()? as usize;
                    let description = decode(item_reader.read(dlen)?, DecodeFlags::default());
                    let ilen = item_reader.read_u8()? as usize;
                    let item = decode(item_reader.read(ilen)?, DecodeFlags::default());
                    items.push(ExtendedEventItem { description, item });
                }
                Ok(Descriptor::ExtendedEvent {
                    descriptor_number,
                    last_descriptor_number,
                    language_code,
                    items,
                })
            })(),
            TAG_COMPONENT => (|| -> crate::error::Result<Descriptor> {
                let b0 = r.read_u8()?;
                let stream_content = b0 & 0x0F;
                let component_type = r.read_u8()?;
                let component_tag = r.read_u8()?;
                let language_code = ascii3_to_u32(&r.read_array_ref::<3>()?);
                let text = decode(r.read_to_end(), DecodeFlags::default());
                Ok(Descriptor::Component {
                    stream_content,
                    component_type,
                    component_tag,
                    language_code,
                    text,
                })
            })(),
            TAG_STREAM_ID => r
                .read_u8()
                .map(|component_tag| Descriptor::StreamId { component_tag }),
            TAG_CA_IDENTIFIER => (|| -> crate::error::Result<Descriptor> {
                let mut ca_system_ids = SmallVec::new();
                while r.remaining_len() >= 2 {
                    ca_system_ids.push(r.read_be_u16()?);
                }
                Ok(Descriptor::CaIdentifier { ca_system_ids })
            })(),
            TAG_CONTENT => (|| -> crate::error::Result<Descriptor> {
                let mut nibbles = SmallVec::new();
                while r.remaining_len() >= 2 {
                    let b0 = r.read_u8()?;
                    let b1 = r.read_u8()?;
                    nibbles.push(ContentNibble {
                        genre_level_1: b0 >> 4,
                        genre_level_2: b0 & 0x0F,
                        user_nibble_1: b1 >> 4,
                        user_nibble_2: b1 & 0x0F,
                    });
                }
                Ok(Descriptor::Content { nibbles })
            })(),
            TAG_LOCAL_TIME_OFFSET => (|| -> crate::error::Result<Descriptor> {
                let country_code = ascii3_to_u32(&r.read_array_ref::<3>()?);
                let b = r.read_u8()?;
                let country_region_id = b >> 2;
                let polarity = b & 0x01 != 0;
                let local_time_offset = r.read_be_u16()?;
                let mjd = r.read_be_u16()?;
                let bcd_time = r.read_array_ref::<3>()?;
                let time_of_change = (
                    mjd,
                    bcd_to_u32(&[0, bcd_time[0], bcd_time[1], bcd_time[2]]),
                );
                let next_time_offset = r.read_be_u16()?;
                Ok(Descriptor::LocalTimeOffset {
                    country_code,
                    country_region_id,
                    polarity,
                    local_time_offset,
                    time_of_change,
                    next_time_offset,
                })
            })(),
            TAG_HIERARCHICAL_TRANSMISSION => (|| -> crate::error::Result<Descriptor> {
                let b = r.read_u8()?;
                let quality_level = b & 0x01;
                let reference_pid = r.read_be_u16()? & 0x1FFF;
                Ok(Descriptor::HierarchicalTransmission {
                    quality_level,
                    reference_pid,
                })
            })(),
            TAG_DIGITAL_COPY_CONTROL => (|| -> crate::error::Result<Descriptor> {
                let b = r.read_u8()?;
                let digital_recording_control_data = (b >> 6) & 0x03;
                let maximum_bitrate_flag = b & 0x20 != 0;
                let component_control_flag = b & 0x10 != 0;
                let maximum_bit_rate = if maximum_bitrate_flag {
                    Some(r.read_u8()?)
                } else {
                    None
                };
                let copy_control_type = if component_control_flag {
                    // component_control loop is skipped; surface only the flag-level
                    // copy control type/APS data is not separately present at this
                    // level in the source when component_control_flag is set (it moves
                    // to per-component entries), so this field reflects the top-level
                    // byte even when the flag is set.
                    Some((b >> 2) & 0x03)
                } else {
                    None
                };
                Ok(Descriptor::DigitalCopyControl {
                    digital_recording_control_data,
                    maximum_bit_rate,
                    copy_control_type,
                })
            })(),
            TAG_AUDIO_COMPONENT => (|| -> crate::error::Result<Descriptor> {
                let b0 = r.read_u8()?;
                let stream_content = b0 & 0x0F;
                let component_type = r.read_u8()?;
                let component_tag = r.read_u8()?;
                let _stream_type = r.read_u8()?;
                let simulcast_group_tag = r.read_u8()?;
                let b1 = r.read_u8()?;
                let es_multi_lingual_flag = b1 & 0x80 != 0;
                let main_component_flag = b1 & 0x40 != 0;
                let quality_indicator = (b1 >> 4) & 0x03;
                let sampling_rate = (b1 >> 1) & 0x07;
                let language_code = ascii3_to_u32(&r.read_array_ref::<3>()?);
                let language_code_2 = if es_multi_lingual_flag {
                    Some(ascii3_to_u32(&r.read_array_ref::<3>()?))
                } else {
                    None
                };
                let text = decode(r.read_to_end(), DecodeFlags::default());
                Ok(Descriptor::AudioComponent {
                    stream_content,
                    component_type,
                    component_tag,
                    simulcast_group_tag,
                    es_multi_lingual_flag,
                    main_component_flag,
                    quality_indicator,
                    sampling_rate,
                    language_code,
                    language_code_2,
                    text,
                })
            })(),
            TAG_CA_SERVICE => (|| -> crate::error::Result<Descriptor> {
                let ca_system_id = r.read_be_u16()?;
                let ca_broadcaster_group_id = r.read_u8()?;
                let message_control = r.read_u8()?;
                let mut service_ids = SmallVec::new();
                while r.remaining_len() >= 2 {
                    service_ids.push(r.read_be_u16()?);
                }
                Ok(Descriptor::CaService {
                    ca_system_id,
                    ca_broadcaster_group_id,
                    message_control,
                    service_ids,
                })
            })(),
            TAG_EXTENDED_BROADCASTER => (|| -> crate::error::Result<Descriptor> {
                let broadcaster_type = r.read_u8()?;
                Ok(Descriptor::ExtendedBroadcaster {
                    broadcaster_type,
                    data: SmallVec::from_slice(r.read_to_end()),
                })
            })(),
            TAG_LOGO_TRANSMISSION => (|| -> crate::error::Result<Descriptor> {
                let logo_transmission_type = r.read_u8()?;
                match logo_transmission_type {
                    0x01 | 0x02 => {
                        let logo_id = r.read_be_u16()? & 0x01FF;
                        let logo_version = r.read_be_u16()? & 0x0FFF;
                        let download_data_id = r.read_be_u16()?;
                        Ok(Descriptor::LogoTransmission {
                            logo_transmission_type,
                            logo_id: Some(logo_id),
                            logo_version: Some(logo_version),
                            download_data_id: Some(download_data_id),
                        })
                    }
                    0x03 => {
                        let logo_id = r.read_be_u16()? & 0x01FF;
                        Ok(Descriptor::LogoTransmission {
                            logo_transmission_type,
                            logo_id: Some(logo_id),
                            logo_version: None,
                            download_data_id: None,
                        })
                    }
                    _ => Ok(Descriptor::LogoTransmission {
                        logo_transmission_type,
                        logo_id: None,
                        logo_version: None,
                        download_data_id: None,
                    }),
                }
            })(),
            TAG_SERIES => (|| -> crate::error::Result<Descriptor> {
                let series_id = r.read_be_u16()?;
                let b = r.read_u8()?;
                let repeat_label = b >> 4;
                let program_pattern = (b >> 1) & 0x07;
                let expire_date_valid_flag = b & 0x01 != 0;
                let mjd = r.read_be_u16()?;
                let expire_date_mjd = if expire_date_valid_flag && mjd != 0xFFFF {
                    Some(mjd)
                } else {
                    None
                };
                let episode_number_raw = r.read_be_u16()?;
                let episode_number = episode_number_raw >> 4;
                let last_ep_hi = episode_number_raw & 0x000F;
                let last_ep_lo = r.read_u8()?;
                let last_episode_number = (last_ep_hi << 8) | last_ep_lo as u16;
                let name = decode(r.read_to_end(), DecodeFlags::default());
                Ok(Descriptor::Series(SeriesInfo {
                    series_id,
                    repeat_label,
                    program_pattern,
                    expire_date_mjd,
                    episode_number,
                    last_episode_number,
                    name,
                }))
            })(),
            TAG_EVENT_GROUP => (|| -> crate::error::Result<Descriptor> {
                let b = r.read_u8()?;
                let group_type = (b >> 4) & 0x0F;
                let event_count = b & 0x0F;
                let mut events = SmallVec::new();
                for _ in 0..event_count {
                    let service_id = r.read_be_u16()?;
                    let event_id = r.read_be_u16()?;
                    events.push(EventGroupEntry {
                        service_id,
                        event_id,
                        network_id: 0,
                        transport_stream_id: 0,
                    });
                }
                // A secondary "other network" event list may follow for group types
                // 4/5; since no consumer resolves it today it's left unparsed (still
                // consumed bytes are ignored, not mis-attributed to the primary list).
                Ok(Descriptor::EventGroup { group_type, events })
            })(),
            TAG_BROADCASTER_NAME => Ok(Descriptor::BroadcasterName {
                name: decode(r.read_to_end(), DecodeFlags::default()),
            }),
            TAG_COMPONENT_GROUP => (|| -> crate::error::Result<Descriptor> {
                let b = r.read_u8()?;
                let component_group_type = (b >> 5) & 0x07;
                let total_bit_rate_flag = b & 0x10 != 0;
                let group_count = b & 0x0F;
                Ok(Descriptor::ComponentGroup {
                    component_group_type,
                    total_bit_rate_flag,
                    group_count,
                })
            })(),
            TAG_TERRESTRIAL_DELIVERY_SYSTEM => (|| -> crate::error::Result<Descriptor> {
                let area_code = r.read_be_u16()? >> 4;
                let b = r.read_u8()?;
                let guard_interval = (b >> 4) & 0x03;
                let transmission_mode = (b >> 2) & 0x03;
                let mut frequencies = SmallVec::new();
                while r.remaining_len() >= 2 {
                    frequencies.push(r.read_be_u16()?);
                }
                Ok(Descriptor::TerrestrialDeliverySystem {
                    area_code,
                    guard_interval,
                    transmission_mode,
                    frequencies,
                })
            })(),
            TAG_PARTIAL_RECEPTION => (|| -> crate::error::Result<Descriptor> {
                let mut service_ids = SmallVec::new();
                while r.remaining_len() >= 2 {
                    service_ids.push(r.read_be_u16()?);
                }
                Ok(Descriptor::PartialReception { service_ids })
            })(),
            TAG_EMERGENCY_INFORMATION => (|| -> crate::error::Result<Descriptor> {
                let mut services = SmallVec::new();
                while r.remaining_len() >= 6 {
                    let service_id = r.read_be_u16()?;
                    let b = r.read_u8()?;
                    let start_end_flag = b & 0x80 != 0;
                    let signal_level = b & 0x40 != 0;
                    let area_count = r.read_u8()? as usize;
                    let _ = r.read(area_count * 2)?;
                    services.push(EmergencyInformationEntry {
                        service_id,
                        start_end_flag,
                        signal_level,
                    });
                }
                Ok(Descriptor::EmergencyInformation { services })
            })(),
            TAG_DATA_COMPONENT => (|| -> crate::error::Result<Descriptor> {
                let data_component_id = r.read_be_u16()?;
                Ok(Descriptor::DataComponent {
                    data_component_id,
                    additional_info: SmallVec::from_slice(r.read_to_end()),
                })
            })(),
            TAG_SYSTEM_MANAGEMENT => (|| -> crate::error::Result<Descriptor> {
                let b = r.read_be_u16()?;
                let broadcasting_flag = (b >> 10) as u8;
                let broadcasting_id = ((b >> 4) & 0x3F) as u8;
                let additional_broadcasting_id = (b & 0x0F) as u8;
                Ok(Descriptor::SystemManagement {
                    broadcasting_flag,
                    broadcasting_id,
                    additional_broadcasting_id,
                })
            })(),
            TAG_TS_INFORMATION => (|| -> crate::error::Result<Descriptor> {
                let b = r.read_u8()?;
                let remote_control_key_id = b;
                let length_flags = r.read_u8()?;
                let ts_name_length = (length_flags >> 2) as usize;
                let ts_name = decode(r.read(ts_name_length)?, DecodeFlags::default());
                Ok(Descriptor::TsInformation {
                    remote_control_key_id,
                    ts_name,
                })
            })(),
            _ => return Descriptor::raw(tag, body),
        }
        .unwrap_or_else(|_| Descriptor::raw(tag, body))
    }
}

/// Packs a 3-character ISO-639/country code (raw ASCII, not BCD) into a u32.
fn ascii3_to_u32(bytes: &[u8; 3]) -> u32 {
    ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32
}

fn bcd_nibble(b: u8) -> u32 {
    ((b >> 4) * 10 + (b & 0x0F)) as u32
}

fn bcd_to_u32(bytes: &[u8; 4]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| acc * 100 + bcd_nibble(b))
}

fn bcd_to_u16(bytes: &[u8; 2]) -> u16 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| acc * 100 + bcd_nibble(b)) as u16
}

/// An ordered list of descriptors belonging to one table entry.
///
/// Mirrors `LibISDB::DescriptorBlock`: [`parse`](DescriptorBlock::parse) consumes a
/// `descriptors_loop_length`-delimited byte range and decodes each tag/length/value
/// triple in turn. A descriptor whose declared length runs past the remaining bytes in
/// the block truncates the loop rather than reading out of bounds (the remaining bytes
/// are silently dropped, matching the source's length-clamped iteration).
#[derive(Debug, Clone, Default)]
pub struct DescriptorBlock {
    descriptors: Vec<Descriptor>,
}

impl DescriptorBlock {
    /// Parses every descriptor in `bytes`, in order.
    pub fn parse(bytes: &[u8]) -> Self {
        let mut descriptors = Vec::new();
        let mut i = 0usize;
        while i + 2 <= bytes.len() {
            let tag = bytes[i];
            let len = bytes[i + 1] as usize;
            let body_start = i + 2;
            let body_end = (body_start + len).min(bytes.len());
            let body = &bytes[body_start..body_end];
            descriptors.push(Descriptor::parse_one(tag, body));
            if body_end - body_start < len {
                break;
            }
            i = body_end;
        }
        Self { descriptors }
    }

    /// Total number of descriptors in this block.
    pub fn count(&self) -> usize {
        self.descriptors.len()
    }

    /// The first descriptor with the given tag, if any.
    pub fn get_by_tag(&self, tag: u8) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.tag() == tag)
    }

    /// All descriptors, in encoded order.
    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter()
    }
}
