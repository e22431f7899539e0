//! EPG database: merges EIT present/following and schedule sections into a time-sorted
//! per-service event index, tracking schedule completeness per ARIB STD-B10's segmented
//! table layout.
//!
//! Grounded on `LibISDB::EPGDatabase`/`EventInfo.hpp`: events are keyed by
//! `(network_id, transport_stream_id, service_id, event_id)`, merged from whichever EIT
//! sections arrive in whatever order, and the database tracks two independent schedule
//! completeness bitfields (basic `0x50`-`0x57`, extended `0x58`-`0x5F`) per
//! SPEC_FULL.md §6's resolution of the schedule-completeness open question. A
//! `ReentrantMutex` guards the database so a listener callback may re-query it without
//! deadlocking (spec section 4.9).

use crate::descriptor::{Descriptor, SeriesInfo};
use crate::table::{Eit, EitEventEntry};
use crate::time::{self, TotAnchor};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the epoch, used as [`Event::updated_at_ms`]'s source —
/// unlike [`Inner::sequence_counter`] (a per-[`EpgDatabase`]-instance counter, meaningless
/// across two separate databases), this is comparable between the two sides of
/// [`EpgDatabase::merge`].
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Genre/classification nibble pair, as decoded from a [`Descriptor::Content`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentGenre {
    /// `content_nibble_level_1`.
    pub level_1: u8,
    /// `content_nibble_level_2`.
    pub level_2: u8,
}

/// Where an event's data came from, and whether it's a schedule placeholder or a fully
/// described event (spec section 4.9's "event type flags").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Derived from a present/following EIT section (`table_id` `0x4E`/`0x4F`).
    PresentFollowing,
    /// Derived from a basic schedule EIT section (`table_id` `0x50`-`0x5F` range, basic
    /// half).
    ScheduleBasic,
    /// Derived from an extended schedule EIT section.
    ScheduleExtended,
}

/// One merged program event.
#[derive(Debug, Clone)]
pub struct Event {
    /// `original_network_id`.
    pub network_id: u16,
    /// `transport_stream_id`.
    pub transport_stream_id: u16,
    /// `service_id`.
    pub service_id: u16,
    /// `event_id`.
    pub event_id: u16,
    /// `start_time`, decoded to JST, if the BCD time-of-day portion was valid.
    pub start_time: Option<chrono::DateTime<chrono::FixedOffset>>,
    /// `duration`, if valid BCD.
    pub duration: Option<chrono::Duration>,
    /// `running_status`.
    pub running_status: u8,
    /// `free_CA_mode`.
    pub free_ca: bool,
    /// `event_name_char`, decoded, from [`Descriptor::ShortEvent`].
    pub event_name: String,
    /// `text_char` (short description), decoded.
    pub short_text: String,
    /// Extended event items, concatenated across however many [`Descriptor::ExtendedEvent`]
    /// fragments (`descriptor_number` `0..=last_descriptor_number`) have been merged in.
    pub extended_items: Vec<crate::descriptor::ExtendedEventItem>,
    /// Content genre nibbles, from [`Descriptor::Content`].
    pub genres: Vec<ContentGenre>,
    /// Series info, from [`Descriptor::Series`], restored per SPEC_FULL.md's
    /// `Event::series` field.
    pub series: Option<SeriesInfo>,
    /// Which EIT flavor most recently contributed to this event.
    pub source: EventSource,
    /// Local monotonic update counter, used to order `on_service_completed`/age-based
    /// eviction without depending on wall-clock `Instant::now()`.
    pub update_sequence: u64,
    /// Wall-clock milliseconds since the epoch at which this event was last merged,
    /// used by [`EpgDatabase::merge`] to decide which of two databases' copies of the
    /// same event is newer (spec section 4.9 step 3).
    pub updated_at_ms: u64,
    /// `(network_id, transport_stream_id, service_id, event_id)` of the "common event"
    /// this one redirects to, from an [`Descriptor::EventGroup`] entry with `group_type`
    /// `4` (spec section 4.9 step 4). `None` for an ordinary, self-contained event.
    pub common_event_source: Option<(u16, u16, u16, u16)>,
}

impl Event {
    fn key(&self) -> EventKey {
        EventKey {
            network_id: self.network_id,
            transport_stream_id: self.transport_stream_id,
            service_id: self.service_id,
            event_id: self.event_id,
        }
    }

    /// Whether this event's extended text should be resolved through
    /// [`EpgDatabase::resolve_extended_text`] rather than read directly off
    /// `extended_items`.
    pub fn is_common_event(&self) -> bool {
        self.common_event_source.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct EventKey {
    network_id: u16,
    transport_stream_id: u16,
    service_id: u16,
    event_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimeIndexKey {
    // `start_time` as JST epoch seconds, `None` sorted last via `i64::MAX`.
    start_time_secs: i64,
    event_id: u16,
}

/// Controls how [`EpgDatabase::merge_eit`] reconciles an incoming section against
/// whatever is already stored, spec section 4.9's five merge flags.
#[derive(Debug, Clone, Copy)]
pub struct MergeFlags {
    /// Drop any stored event whose `start_time + duration` is already in the past,
    /// relative to the current TOT anchor, before merging new data in.
    pub discard_ended_events: bool,
    /// Drop stored events with no current TOT anchor to judge "ended" against (a
    /// conservative companion to `discard_ended_events`).
    pub discard_events_without_anchor: bool,
    /// When both a database (user-supplied) and a freshly decoded entry exist for the
    /// same key, prefer the database entry's text fields over the freshly decoded ones.
    pub prefer_database_entries: bool,
    /// Merge extended-event text fragments from basic events that predate receiving the
    /// extended set, rather than requiring both to arrive before exposing any text.
    pub merge_basic_extended: bool,
    /// Mark the owning service "updated" (bumping a per-service sequence number queryable
    /// via [`EpgDatabase::service_sequence`]) whenever any event under it changes.
    pub set_service_updated: bool,
    /// For [`EpgDatabase::merge`] only: skip importing an incoming event whose end time
    /// (`start_time + duration`) is already more than 4 hours in the past relative to the
    /// current TOT anchor (spec section 4.9 step 5's `DiscardOldEvents`). A no-op without
    /// an anchor. Distinct from `discard_ended_events`, which [`EpgDatabase::merge_eit`]
    /// applies to *already-stored* events with no 4-hour grace period.
    pub discard_old_events: bool,
}

impl Default for MergeFlags {
    fn default() -> Self {
        Self {
            discard_ended_events: true,
            discard_events_without_anchor: false,
            prefer_database_entries: false,
            merge_basic_extended: true,
            set_service_updated: true,
            discard_old_events: false,
        }
    }
}

/// Per-(table_id, service) schedule completeness tracker: ARIB STD-B10 splits an EIT
/// schedule into 8 sub-tables (`table_id` offset `0..8`), each covering 32 three-hour
/// segments of 8 sections, for 256 sections total spanning 8 days. Basic (`0x50`-`0x57`)
/// and extended (`0x58`-`0x5F`) are tracked as two independent banks, per
/// SPEC_FULL.md §6's resolution.
#[derive(Debug, Clone)]
struct ScheduleBank {
    // bit i*32*8 + segment*8 + section set once that section has been seen.
    seen: [u8; 32], // 32 segments * 8 sections = 256 bits = 32 bytes
    last_table_id: Option<u8>,
}

impl Default for ScheduleBank {
    fn default() -> Self {
        Self {
            seen: [0u8; 32],
            last_table_id: None,
        }
    }
}

impl ScheduleBank {
    fn mark(&mut self, table_id_offset: u8, section_number: u8) {
        let segment = section_number / 8;
        let bit_in_segment = section_number % 8;
        let bit_index = table_id_offset as usize * 32 * 8 + segment as usize * 8 + bit_in_segment as usize;
        let byte = bit_index / 8;
        let bit = bit_index % 8;
        if byte < self.seen.len() {
            self.seen[byte] |= 1 << bit;
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether every section covering the next `hours_ahead` hours (rounded up to whole
    /// 3-hour segments, each segment needing all 8 of its sections) has been observed.
    fn is_complete(&self, hours_ahead: u32) -> bool {
        let segments_needed = ((hours_ahead + 2) / 3).max(1).min(32 * 8) as usize;
        for segment in 0..segments_needed {
            for section in 0..8u8 {
                let bit_index = segment * 8 + section as usize;
                let byte = bit_index / 8;
                let bit = bit_index % 8;
                if byte >= self.seen.len() || self.seen[byte] & (1 << bit) == 0 {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct ServiceSchedule {
    basic: ScheduleBank,
    extended: ScheduleBank,
    sequence: u64,
    // Whether `is_complete(24)` last evaluated true for each bank, so `ServiceCompleted`
    // fires only on the incomplete -> complete transition (spec section 4.9), not on
    // every subsequent section that arrives while already complete.
    basic_complete_24h: bool,
    extended_complete_24h: bool,
}

/// Events fanned out to [`EpgDatabase`] listeners (spec section 4.9's "listener
/// notification").
#[derive(Debug, Clone)]
pub enum EpgEvent {
    /// `service_id`'s schedule now satisfies whatever completeness query triggered this
    /// (basic or extended, distinguished by `extended`).
    ServiceCompleted { service_id: u16, extended: bool },
    /// `service_id`'s schedule tracking was reset (e.g. on a version bump).
    ScheduleStatusReset { service_id: u16 },
    /// One event under `service_id` was added or updated.
    EventUpdated { service_id: u16, event_id: u16 },
}

type Listener = Arc<dyn Fn(&EpgEvent) + Send + Sync>;

struct Inner {
    events: BTreeMap<EventKey, Event>,
    // per-service time-sorted index: service_id -> (start_time_secs, event_id) -> event key
    time_index: BTreeMap<u16, BTreeMap<TimeIndexKey, EventKey>>,
    schedules: std::collections::HashMap<u16, ServiceSchedule>,
    tot_anchor: Option<TotAnchor>,
    merge_flags: MergeFlags,
    sequence_counter: u64,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            events: BTreeMap::new(),
            time_index: BTreeMap::new(),
            schedules: std::collections::HashMap::new(),
            tot_anchor: None,
            merge_flags: MergeFlags::default(),
            sequence_counter: 0,
        }
    }
}

/// Time-sorted per-service event index with schedule completeness tracking, merge
/// policy, and listener notification.
///
/// Guarded by a [`ReentrantMutex`] (rather than a plain [`parking_lot::Mutex`]) so a
/// listener invoked during `merge_eit` may call back into any query method without
/// deadlocking; the notification itself still happens with the lock released, matching
/// [`crate::analyzer::AnalyzerFilter`]'s pattern, but a re-entrant lock is cheap
/// insurance against a listener holding a reference across calls.
pub struct EpgDatabase {
    inner: ReentrantMutex<RefCell<Inner>>,
    listeners: parking_lot::Mutex<Vec<Listener>>,
}

impl Default for EpgDatabase {
    fn default() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(Inner::default())),
            listeners: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl EpgDatabase {
    /// A fresh, empty database using [`MergeFlags::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the merge policy used by subsequent [`merge_eit`](Self::merge_eit) calls.
    pub fn set_merge_flags(&self, flags: MergeFlags) {
        self.inner.lock().borrow_mut().merge_flags = flags;
    }

    /// Registers a listener invoked for every [`EpgEvent`].
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&EpgEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    fn notify(&self, events: Vec<EpgEvent>) {
        if events.is_empty() {
            return;
        }
        let snapshot: Vec<Listener> = self.listeners.lock().clone();
        for event in &events {
            for listener in &snapshot {
                listener(event);
            }
        }
    }

    /// Records a fresh TOT anchor, used to judge "ended" events for
    /// [`MergeFlags::discard_ended_events`].
    pub fn on_tot(&self, anchor: TotAnchor) {
        self.inner.lock().borrow_mut().tot_anchor = Some(anchor);
    }

    /// Resets `service_id`'s schedule completeness tracking (both banks), e.g. after a
    /// version_number bump invalidates everything previously seen.
    pub fn reset_schedule_status(&self, service_id: u16) {
        {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            let schedule = inner.schedules.entry(service_id).or_default();
            schedule.basic.reset();
            schedule.extended.reset();
            schedule.basic_complete_24h = false;
            schedule.extended_complete_24h = false;
        }
        self.notify(vec![EpgEvent::ScheduleStatusReset { service_id }]);
    }

    /// Merges one EIT section's events into the database, applying the five-step
    /// algorithm from spec section 4.9:
    ///
    /// 1. For each event entry, compute its key and decode descriptors.
    /// 2. If [`MergeFlags::discard_ended_events`] and a TOT anchor exists, drop any
    ///    stored event under this service whose end time has already passed.
    /// 3. Merge each entry: new events are inserted outright; existing events have their
    ///    present/following or schedule fields refreshed (short-form fields always
    ///    overwritten, extended-event text fragments accumulated by
    ///    `descriptor_number`).
    /// 4. Update the time-sorted index for changed/inserted events.
    /// 5. For schedule sections, mark the corresponding bit in the basic/extended
    ///    completeness bank and fire `ServiceCompleted` if that bank just became
    ///    complete for a 24-hour lookahead.
    pub fn merge_eit(&self, eit: &Eit) {
        let mut fired = Vec::new();
        {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            inner.sequence_counter += 1;
            let sequence = inner.sequence_counter;

            if inner.merge_flags.discard_ended_events {
                if let Some(anchor) = inner.tot_anchor {
                    self.discard_ended(&mut inner, eit.service_id, anchor, &mut fired);
                } else if inner.merge_flags.discard_events_without_anchor {
                    self.discard_all(&mut inner, eit.service_id, &mut fired);
                }
            }

            for entry in &eit.events {
                let source = if eit.is_present_following() {
                    EventSource::PresentFollowing
                } else if eit.is_extended_schedule() {
                    EventSource::ScheduleExtended
                } else {
                    EventSource::ScheduleBasic
                };
                self.merge_event_entry(&mut inner, eit, entry, source, sequence, &mut fired);
            }

            if !eit.is_present_following() {
                let table_id_offset = if eit.is_extended_schedule() {
                    eit.table_id - 0x58
                } else {
                    eit.table_id - 0x50
                };
                let schedule = inner.schedules.entry(eit.service_id).or_default();
                let bank = if eit.is_extended_schedule() {
                    &mut schedule.extended
                } else {
                    &mut schedule.basic
                };
                // A table_id change within a bank (e.g. a version roll) is not treated as an
                // implicit reset here; callers drive that explicitly via
                // `reset_schedule_status` so a reordered section stream can't wipe progress.
                bank.last_table_id = Some(eit.table_id);
                bank.mark(table_id_offset, eit.section_number);

                let is_complete_24h = bank.is_complete(24);
                let was_complete_24h = if eit.is_extended_schedule() {
                    std::mem::replace(&mut schedule.extended_complete_24h, is_complete_24h)
                } else {
                    std::mem::replace(&mut schedule.basic_complete_24h, is_complete_24h)
                };
                if is_complete_24h && !was_complete_24h {
                    fired.push(EpgEvent::ServiceCompleted {
                        service_id: eit.service_id,
                        extended: eit.is_extended_schedule(),
                    });
                }
            }
        }
        self.notify(fired);
    }

    fn discard_ended(
        &self,
        inner: &mut Inner,
        service_id: u16,
        anchor: TotAnchor,
        _fired: &mut Vec<EpgEvent>,
    ) {
        let now = anchor.wall_time();
        let stale: Vec<EventKey> = inner
            .events
            .values()
            .filter(|e| e.service_id == service_id)
            .filter_map(|e| {
                let start = e.start_time?;
                let duration = e.duration.unwrap_or_else(chrono::Duration::zero);
                if start + duration < now {
                    Some(e.key())
                } else {
                    None
                }
            })
            .collect();
        for key in stale {
            self.remove_event(inner, key);
        }
    }

    fn discard_all(&self, inner: &mut Inner, service_id: u16, _fired: &mut Vec<EpgEvent>) {
        let keys: Vec<EventKey> = inner
            .events
            .values()
            .filter(|e| e.service_id == service_id)
            .map(|e| e.key())
            .collect();
        for key in keys {
            self.remove_event(inner, key);
        }
    }

    fn remove_event(&self, inner: &mut Inner, key: EventKey) {
        if let Some(event) = inner.events.remove(&key) {
            if let Some(index) = inner.time_index.get_mut(&event.service_id) {
                let time_key = time_index_key(&event);
                index.remove(&time_key);
            }
        }
    }

    fn merge_event_entry(
        &self,
        inner: &mut Inner,
        eit: &Eit,
        entry: &EitEventEntry,
        source: EventSource,
        sequence: u64,
        fired: &mut Vec<EpgEvent>,
    ) {
        let key = EventKey {
            network_id: eit.network_id,
            transport_stream_id: eit.transport_stream_id,
            service_id: eit.service_id,
            event_id: entry.event_id,
        };

        let start_time = time::decode_jst(entry.start_time_raw);
        let duration = time::decode_duration(entry.duration_raw);

        let mut event_name = String::new();
        let mut short_text = String::new();
        let mut genres = Vec::new();
        let mut series = None;
        let mut new_extended_items: Option<Vec<crate::descriptor::ExtendedEventItem>> = None;

        for d in entry.descriptors.iter() {
            match d {
                Descriptor::ShortEvent {
                    event_name: name,
                    event_description,
                    ..
                } => {
                    event_name = name.clone();
                    short_text = event_description.clone();
                }
                Descriptor::ExtendedEvent { items, .. } => {
                    new_extended_items
                        .get_or_insert_with(Vec::new)
                        .extend(items.iter().cloned());
                }
                Descriptor::Content { nibbles } => {
                    genres = nibbles
                        .iter()
                        .map(|n| ContentGenre {
                            level_1: n.genre_level_1,
                            level_2: n.genre_level_2,
                        })
                        .collect();
                }
                Descriptor::Series(info) => {
                    series = Some(info.clone());
                }
                _ => {}
            }
        }

        let common_event_source = entry.descriptors.iter().find_map(|d| match d {
            Descriptor::EventGroup { group_type, events } if *group_type == 4 => {
                events.first().map(|e| {
                    (
                        e.network_id,
                        e.transport_stream_id,
                        e.service_id,
                        e.event_id,
                    )
                })
            }
            _ => None,
        });

        let old_index_key = inner.events.get(&key).map(time_index_key);

        let merged = if let Some(existing) = inner.events.get_mut(&key) {
            if !event_name.is_empty() {
                existing.event_name = event_name;
            }
            if !short_text.is_empty() {
                existing.short_text = short_text;
            }
            if let Some(items) = new_extended_items {
                if inner.merge_flags.merge_basic_extended || existing.extended_items.is_empty() {
                    existing.extended_items = items;
                }
            }
            if !genres.is_empty() {
                existing.genres = genres;
            }
            if series.is_some() {
                existing.series = series;
            }
            existing.start_time = start_time.or(existing.start_time);
            existing.duration = duration.or(existing.duration);
            existing.running_status = entry.running_status;
            existing.free_ca = entry.free_ca_mode;
            existing.source = source;
            existing.update_sequence = sequence;
            existing.updated_at_ms = now_ms();
            existing.common_event_source = common_event_source.or(existing.common_event_source);
            true
        } else {
            inner.events.insert(
                key,
                Event {
                    network_id: eit.network_id,
                    transport_stream_id: eit.transport_stream_id,
                    service_id: eit.service_id,
                    event_id: entry.event_id,
                    start_time,
                    duration,
                    running_status: entry.running_status,
                    free_ca: entry.free_ca_mode,
                    event_name,
                    short_text,
                    extended_items: new_extended_items.unwrap_or_default(),
                    genres,
                    series,
                    source,
                    update_sequence: sequence,
                    updated_at_ms: now_ms(),
                    common_event_source,
                },
            );
            false
        };
        let _ = merged;

        let new_index_key = inner.events.get(&key).map(time_index_key).unwrap();
        let index = inner.time_index.entry(eit.service_id).or_default();
        if let Some(old_key) = old_index_key {
            if old_key != new_index_key {
                index.remove(&old_key);
            }
        }
        index.insert(new_index_key, key);

        if inner.merge_flags.set_service_updated {
            inner.schedules.entry(eit.service_id).or_default().sequence = sequence;
        }

        fired.push(EpgEvent::EventUpdated {
            service_id: eit.service_id,
            event_id: entry.event_id,
        });
    }

    /// Every event currently stored for `service_id`, in ascending start-time order
    /// (events with no decodable start time sort last).
    pub fn service_events(&self, service_id: u16) -> Vec<Event> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        match inner.time_index.get(&service_id) {
            Some(index) => index
                .values()
                .filter_map(|key| inner.events.get(key).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Looks up one event by its full key.
    pub fn event(
        &self,
        network_id: u16,
        transport_stream_id: u16,
        service_id: u16,
        event_id: u16,
    ) -> Option<Event> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .events
            .get(&EventKey {
                network_id,
                transport_stream_id,
                service_id,
                event_id,
            })
            .cloned()
    }

    /// Whether `service_id`'s schedule is complete for at least `hours_ahead` hours, in
    /// the `extended` (`true`) or `basic` (`false`) bank.
    pub fn is_complete(&self, service_id: u16, hours_ahead: u32, extended: bool) -> bool {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        match inner.schedules.get(&service_id) {
            Some(schedule) => {
                if extended {
                    schedule.extended.is_complete(hours_ahead)
                } else {
                    schedule.basic.is_complete(hours_ahead)
                }
            }
            None => false,
        }
    }

    /// Monotonic counter bumped every time any event under `service_id` changes, while
    /// [`MergeFlags::set_service_updated`] is enabled.
    pub fn service_sequence(&self, service_id: u16) -> u64 {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.schedules.get(&service_id).map(|s| s.sequence).unwrap_or(0)
    }

    /// Total number of events currently stored, across all services.
    pub fn event_count(&self) -> usize {
        self.inner.lock().borrow().events.len()
    }

    /// Bulk-imports every event currently stored in `other` into `self` (spec section
    /// 4.9's database-to-database merge, distinct from [`merge_eit`](Self::merge_eit)'s
    /// per-section merge).
    ///
    /// For a key present in both databases, the side with the larger
    /// [`Event::updated_at_ms`] wins; ties keep `self`'s copy untouched, including its
    /// time-index position. [`MergeFlags::discard_old_events`] additionally skips any
    /// incoming event whose `start_time + duration` is already more than 4 hours behind
    /// `self`'s current TOT anchor.
    pub fn merge(&self, other: &EpgDatabase, flags: MergeFlags) {
        let incoming: Vec<Event> = {
            let guard = other.inner.lock();
            let inner = guard.borrow();
            inner.events.values().cloned().collect()
        };

        let mut fired = Vec::new();
        {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            let anchor = inner.tot_anchor;

            for event in incoming {
                if flags.discard_old_events {
                    if let (Some(anchor), Some(start), Some(duration)) =
                        (anchor, event.start_time, event.duration)
                    {
                        if start + duration + chrono::Duration::hours(4) < anchor.wall_time() {
                            continue;
                        }
                    }
                }

                let key = event.key();
                if let Some(existing) = inner.events.get(&key) {
                    if existing.updated_at_ms >= event.updated_at_ms {
                        continue;
                    }
                }

                let old_index_key = inner.events.get(&key).map(time_index_key);
                let service_id = event.service_id;
                let event_id = event.event_id;
                inner.events.insert(key, event);

                let new_index_key = inner.events.get(&key).map(time_index_key).unwrap();
                let index = inner.time_index.entry(service_id).or_default();
                if let Some(old_key) = old_index_key {
                    if old_key != new_index_key {
                        index.remove(&old_key);
                    }
                }
                index.insert(new_index_key, key);

                fired.push(EpgEvent::EventUpdated { service_id, event_id });
            }
        }
        self.notify(fired);
    }

    /// Invokes `callback` once for every event stored under `service_id`, in ascending
    /// start-time order, optionally restricted to the half-open window `[from, until)`.
    /// `None` bounds are unbounded; events with no decodable `start_time` are skipped
    /// whenever either bound is given, since there's no way to know if they fall inside
    /// the window.
    pub fn enum_events<F>(
        &self,
        service_id: u16,
        from: Option<chrono::DateTime<chrono::FixedOffset>>,
        until: Option<chrono::DateTime<chrono::FixedOffset>>,
        mut callback: F,
    ) where
        F: FnMut(&Event),
    {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let Some(index) = inner.time_index.get(&service_id) else {
            return;
        };
        for key in index.values() {
            let Some(event) = inner.events.get(key) else {
                continue;
            };
            if from.is_some() || until.is_some() {
                let Some(start) = event.start_time else {
                    continue;
                };
                if from.is_some_and(|from| start < from) {
                    continue;
                }
                if until.is_some_and(|until| start >= until) {
                    continue;
                }
            }
            callback(event);
        }
    }

    /// The event under `service_id` whose `[start_time, start_time + duration)` window
    /// contains `at`, if any.
    pub fn event_at_time(
        &self,
        service_id: u16,
        at: chrono::DateTime<chrono::FixedOffset>,
    ) -> Option<Event> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let index = inner.time_index.get(&service_id)?;
        index.values().find_map(|key| {
            let event = inner.events.get(key)?;
            let start = event.start_time?;
            let duration = event.duration.unwrap_or_else(chrono::Duration::zero);
            if start <= at && at < start + duration {
                Some(event.clone())
            } else {
                None
            }
        })
    }

    /// The earliest event under `service_id` starting strictly after `at`, if any. The
    /// time index is ascending, so the first match is the earliest.
    pub fn next_event_after(
        &self,
        service_id: u16,
        at: chrono::DateTime<chrono::FixedOffset>,
    ) -> Option<Event> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let index = inner.time_index.get(&service_id)?;
        index.values().find_map(|key| {
            let event = inner.events.get(key)?;
            let start = event.start_time?;
            if start > at {
                Some(event.clone())
            } else {
                None
            }
        })
    }

    /// Resolves `event`'s extended text: if it redirects to a common event
    /// ([`Event::is_common_event`]), returns that target's `extended_items` instead of
    /// `event`'s own (normally empty) list.
    pub fn resolve_extended_text(&self, event: &Event) -> Vec<crate::descriptor::ExtendedEventItem> {
        match event.common_event_source {
            Some((network_id, transport_stream_id, service_id, event_id)) => self
                .event(network_id, transport_stream_id, service_id, event_id)
                .map(|target| target.extended_items)
                .unwrap_or_default(),
            None => event.extended_items.clone(),
        }
    }
}

fn time_index_key(event: &Event) -> TimeIndexKey {
    TimeIndexKey {
        start_time_secs: event.start_time.map(|t| t.timestamp()).unwrap_or(i64::MAX),
        event_id: event.event_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorBlock;
    use chrono::TimeZone;
    use crate::table::EitEventEntry;

    fn short_event_descriptors(name: &str, text: &str) -> DescriptorBlock {
        let mut body = Vec::new();
        body.extend_from_slice(b"jpn");
        let name_bytes = name.as_bytes();
        body.push(name_bytes.len() as u8);
        body.extend_from_slice(name_bytes);
        let text_bytes = text.as_bytes();
        body.push(text_bytes.len() as u8);
        body.extend_from_slice(text_bytes);

        let mut raw = Vec::new();
        raw.push(0x4D); // TAG_SHORT_EVENT
        raw.push(body.len() as u8);
        raw.extend_from_slice(&body);
        DescriptorBlock::parse(&raw)
    }

    fn make_eit(table_id: u8, section_number: u8, event_id: u16, name: &str) -> Eit {
        Eit {
            service_id: 100,
            transport_stream_id: 1,
            network_id: 1,
            version_number: 0,
            table_id,
            section_number,
            segment_last_section_number: 7,
            last_table_id: table_id,
            events: vec![EitEventEntry {
                event_id,
                start_time_raw: (58849, 0x120000), // 12:00:00
                duration_raw: 0x010000,            // 1h
                running_status: 4,
                free_ca_mode: false,
                descriptors: short_event_descriptors(name, "desc"),
            }],
        }
    }

    #[test]
    fn merge_inserts_and_indexes_event() {
        let db = EpgDatabase::new();
        db.merge_eit(&make_eit(0x4E, 0, 1, "Program A"));
        let events = db.service_events(100);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "Program A");
    }

    #[test]
    fn time_index_stays_sorted_after_update() {
        let db = EpgDatabase::new();
        db.merge_eit(&make_eit(0x4E, 0, 1, "First"));
        db.merge_eit(&make_eit(0x4E, 0, 1, "First Updated"));
        let events = db.service_events(100);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "First Updated");
    }

    #[test]
    fn schedule_completeness_needs_every_section_in_bank() {
        let db = EpgDatabase::new();
        for table_id in 0x50..=0x57u8 {
            for section in 0..8u8 {
                db.merge_eit(&make_eit(table_id, section, 1, "x"));
            }
        }
        assert!(db.is_complete(100, 24, false));
        assert!(!db.is_complete(100, 24, true));
    }

    #[test]
    fn partial_schedule_is_incomplete() {
        let db = EpgDatabase::new();
        db.merge_eit(&make_eit(0x50, 0, 1, "x"));
        assert!(!db.is_complete(100, 24, false));
    }

    #[test]
    fn service_completed_fires_once_on_transition() {
        let db = Arc::new(EpgDatabase::new());
        let completions = Arc::new(parking_lot::Mutex::new(0usize));
        let completions2 = completions.clone();
        db.add_listener(move |event| {
            if matches!(
                event,
                EpgEvent::ServiceCompleted {
                    extended: false,
                    ..
                }
            ) {
                *completions2.lock() += 1;
            }
        });

        for table_id in 0x50..=0x57u8 {
            for section in 0..8u8 {
                db.merge_eit(&make_eit(table_id, section, 1, "x"));
            }
        }
        assert_eq!(*completions.lock(), 1);

        // Re-observing the last section again, still complete, must not re-fire.
        db.merge_eit(&make_eit(0x57, 7, 1, "x"));
        assert_eq!(*completions.lock(), 1);

        // A reset followed by re-completion fires again.
        db.reset_schedule_status(100);
        for table_id in 0x50..=0x57u8 {
            for section in 0..8u8 {
                db.merge_eit(&make_eit(table_id, section, 1, "x"));
            }
        }
        assert_eq!(*completions.lock(), 2);
    }

    #[test]
    fn listener_can_requery_without_deadlock() {
        let db = Arc::new(EpgDatabase::new());
        let d2 = db.clone();
        let seen = Arc::new(parking_lot::Mutex::new(0usize));
        let seen2 = seen.clone();
        db.add_listener(move |_event| {
            *seen2.lock() += d2.event_count();
        });
        db.merge_eit(&make_eit(0x4E, 0, 1, "Program"));
        assert!(*seen.lock() > 0);
    }

    fn stub_event(event_id: u16, name: &str, updated_at_ms: u64) -> Event {
        Event {
            network_id: 1,
            transport_stream_id: 1,
            service_id: 100,
            event_id,
            start_time: time::decode_jst((58849, 0x120000)),
            duration: time::decode_duration(0x010000),
            running_status: 4,
            free_ca: false,
            event_name: name.to_string(),
            short_text: String::new(),
            extended_items: Vec::new(),
            genres: Vec::new(),
            series: None,
            source: EventSource::PresentFollowing,
            update_sequence: 1,
            updated_at_ms,
            common_event_source: None,
        }
    }

    fn insert_raw(db: &EpgDatabase, event: Event) {
        let guard = db.inner.lock();
        let mut inner = guard.borrow_mut();
        let key = event.key();
        let index_key = time_index_key(&event);
        inner.events.insert(key, event);
        inner.time_index.entry(100).or_default().insert(index_key, key);
    }

    #[test]
    fn merge_imports_event_absent_from_self() {
        let db_a = EpgDatabase::new();
        let db_b = EpgDatabase::new();
        insert_raw(&db_b, stub_event(1, "Only in B", 10));

        db_a.merge(&db_b, MergeFlags::default());

        let events = db_a.service_events(100);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "Only in B");
    }

    #[test]
    fn merge_prefers_newer_updated_at_ms_from_other() {
        let db_a = EpgDatabase::new();
        let db_b = EpgDatabase::new();
        insert_raw(&db_a, stub_event(1, "A's stale copy", 10));
        insert_raw(&db_b, stub_event(1, "B's fresher copy", 20));

        db_a.merge(&db_b, MergeFlags::default());

        let events = db_a.service_events(100);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "B's fresher copy");
    }

    #[test]
    fn merge_keeps_self_copy_when_it_is_not_older() {
        let db_a = EpgDatabase::new();
        let db_b = EpgDatabase::new();
        insert_raw(&db_a, stub_event(1, "A's fresher copy", 20));
        insert_raw(&db_b, stub_event(1, "B's stale copy", 10));

        db_a.merge(&db_b, MergeFlags::default());

        let events = db_a.service_events(100);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "A's fresher copy");
    }

    #[test]
    fn enum_events_respects_time_window() {
        let db = EpgDatabase::new();
        db.merge_eit(&make_eit(0x4E, 0, 1, "Noon Program"));

        let before = time::jst().with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let noon = time::jst().with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap();
        let after = time::jst().with_ymd_and_hms(2020, 1, 1, 23, 0, 0).unwrap();

        let mut seen = Vec::new();
        db.enum_events(100, Some(before), Some(noon), |e| seen.push(e.event_id));
        assert!(seen.is_empty(), "noon event starts exactly at the upper bound, excluded");

        seen.clear();
        db.enum_events(100, Some(before), Some(after), |e| seen.push(e.event_id));
        assert_eq!(seen, vec![1]);

        seen.clear();
        db.enum_events(100, None, None, |e| seen.push(e.event_id));
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn event_at_time_finds_event_covering_instant() {
        let db = EpgDatabase::new();
        db.merge_eit(&make_eit(0x4E, 0, 1, "Noon Program"));
        let during = time::jst().with_ymd_and_hms(2020, 1, 1, 12, 30, 0).unwrap();
        let before = time::jst().with_ymd_and_hms(2020, 1, 1, 11, 0, 0).unwrap();

        assert_eq!(
            db.event_at_time(100, during).map(|e| e.event_id),
            Some(1)
        );
        assert_eq!(db.event_at_time(100, before), None);
    }

    #[test]
    fn next_event_after_finds_earliest_future_event() {
        let db = EpgDatabase::new();
        insert_raw(&db, stub_event(1, "Earlier", 10));
        let mut later = stub_event(2, "Later", 10);
        later.start_time = later.start_time.map(|t| t + chrono::Duration::hours(2));
        insert_raw(&db, later);

        let at = time::jst().with_ymd_and_hms(2020, 1, 1, 11, 0, 0).unwrap();
        let next = db.next_event_after(100, at).expect("an event follows `at`");
        assert_eq!(next.event_id, 1);

        let after_first = time::jst().with_ymd_and_hms(2020, 1, 1, 12, 30, 0).unwrap();
        let next = db
            .next_event_after(100, after_first)
            .expect("a second event follows");
        assert_eq!(next.event_id, 2);
    }

    #[test]
    fn resolve_extended_text_follows_common_event_redirect() {
        let db = EpgDatabase::new();
        let mut common = stub_event(1, "Common", 10);
        common.extended_items = vec![crate::descriptor::ExtendedEventItem {
            description: "desc".to_string(),
            item: "shared text".to_string(),
        }];
        insert_raw(&db, common);

        let mut redirecting = stub_event(2, "Redirecting", 10);
        redirecting.common_event_source = Some((1, 1, 100, 1));
        assert!(redirecting.is_common_event());
        insert_raw(&db, redirecting.clone());

        let items = db.resolve_extended_text(&redirecting);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item, "shared text");
    }
}
