//! Analyzer filter: aggregates decoded PSI/SI tables into a queryable service model.
//!
//! Grounded on `LibISDB::AnalyzerFilter`: service list rebuilt on PAT, ES list rebuilt and
//! component-tag-sorted on PMT, SDT-derived names merged in, NIT network/TS metadata, CAT
//! EMM PIDs, TOT anchor capture, EIT update fan-out deferred until a PAT has been seen
//! (spec section 4.7). All queries and mutations share one lock; listener callbacks are
//! invoked with that lock released so re-entrant query calls from a listener cannot
//! deadlock (spec section 5 / SPEC_FULL.md §5.8).

use crate::descriptor::Descriptor;
use crate::table::{Cat, Eit, Nit, Pat, Pmt, Sdt};
use crate::time::TotAnchor;
use parking_lot::Mutex;
use std::sync::Arc;

/// One elementary stream slot within a [`ServiceInfo`].
#[derive(Debug, Clone)]
pub struct EsInfo {
    /// `elementary_PID`.
    pub pid: u16,
    /// `stream_type`.
    pub stream_type: u8,
    /// `component_tag`, from a [`Descriptor::Component`]/[`Descriptor::AudioComponent`]
    /// attached to this ES, if present.
    pub component_tag: Option<u8>,
    /// `quality_level`, from a [`Descriptor::HierarchicalTransmission`], if present.
    pub quality_level: Option<u8>,
    /// `reference_PID`, from the same hierarchical descriptor.
    pub hierarchical_reference_pid: Option<u16>,
}

fn es_info_from_pmt_entry(es: &crate::table::PmtEsEntry) -> EsInfo {
    let mut info = EsInfo {
        pid: es.pid,
        stream_type: es.stream_type,
        component_tag: None,
        quality_level: None,
        hierarchical_reference_pid: None,
    };
    for d in es.descriptors.iter() {
        match d {
            Descriptor::Component { component_tag, .. } => {
                info.component_tag = Some(*component_tag);
            }
            Descriptor::AudioComponent { component_tag, .. } => {
                info.component_tag = Some(*component_tag);
            }
            Descriptor::StreamId { component_tag } => {
                info.component_tag = Some(*component_tag);
            }
            Descriptor::HierarchicalTransmission {
                quality_level,
                reference_pid,
            } => {
                info.quality_level = Some(*quality_level);
                info.hierarchical_reference_pid = Some(*reference_pid);
            }
            _ => {}
        }
    }
    info
}

/// Stable insertion sort of a service's ES list by `component_tag`, entries with no
/// component tag sorting after those with one, per spec section 4.7's "sort video/audio/
/// caption/data ES slots by component_tag via insertion sort (stable)".
fn sort_es_by_component_tag(es: &mut Vec<EsInfo>) {
    for i in 1..es.len() {
        let mut j = i;
        while j > 0 && key(&es[j - 1]) > key(&es[j]) {
            es.swap(j - 1, j);
            j -= 1;
        }
    }
    fn key(e: &EsInfo) -> u16 {
        e.component_tag.map(|t| t as u16).unwrap_or(0x100)
    }
}

/// Per-service aggregated state, spec section 3's "Service state".
#[derive(Debug, Clone, Default)]
pub struct ServiceInfo {
    /// `service_id` (PAT `program_number`).
    pub service_id: u16,
    /// PMT PID, from the PAT entry.
    pub pmt_pid: Option<u16>,
    /// `PCR_PID`, from the PMT.
    pub pcr_pid: Option<u16>,
    /// Elementary streams, sorted by component_tag.
    pub es: Vec<EsInfo>,
    /// ECM PIDs found in the PMT's program-level CA descriptors.
    pub ecm_pids: Vec<u16>,
    /// `running_status`, from the actual-TS SDT.
    pub running_status: u8,
    /// `free_CA_mode`, from the actual-TS SDT.
    pub free_ca: bool,
    /// `service_provider_name`, decoded from the Service descriptor.
    pub provider_name: String,
    /// `service_name`, decoded from the Service descriptor.
    pub service_name: String,
    /// `service_type`, from the Service descriptor.
    pub service_type: u8,
    /// `logo_id`, from a [`Descriptor::LogoTransmission`], if present.
    pub logo_id: Option<u16>,
}

/// Cross-transport-stream service summary kept for SDT[other] entries (spec section 4.7's
/// "for other TS, maintain a cross-TS service map").
#[derive(Debug, Clone)]
pub struct OtherServiceInfo {
    /// `transport_stream_id` this entry belongs to.
    pub transport_stream_id: u16,
    /// `original_network_id`.
    pub network_id: u16,
    /// `service_id`.
    pub service_id: u16,
    /// `service_provider_name`, decoded.
    pub provider_name: String,
    /// `service_name`, decoded.
    pub service_name: String,
    /// `service_type`.
    pub service_type: u8,
    /// `running_status`.
    pub running_status: u8,
}

/// Network-level state aggregated from NIT sections, spec section 4.7's "On NIT" rules.
#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    /// `network_id`.
    pub network_id: u16,
    /// `network_name`, decoded from [`Descriptor::NetworkName`].
    pub network_name: Option<String>,
    /// `remote_control_key_id`, from [`Descriptor::TsInformation`] on the actual TS entry.
    pub remote_control_key_id: Option<u8>,
    /// `ts_name_char`, decoded, from the same descriptor.
    pub ts_name: Option<String>,
    /// `broadcasting_id`, from a [`Descriptor::SystemManagement`] on the actual TS entry.
    pub broadcaster_id: Option<u8>,
    /// `(transport_stream_id, original_network_id)` for every TS listed.
    pub transport_streams: Vec<(u16, u16)>,
}

/// Events fanned out to registered listeners, per spec section 4.7's notification surface.
#[derive(Debug, Clone)]
pub enum AnalyzerEvent {
    /// The service list was rebuilt from a new PAT.
    ServiceListUpdated,
    /// `service_id`'s state changed (PMT or SDT update).
    ServiceUpdated(u16),
    /// The network info was refreshed from a new NIT.
    NetworkUpdated,
    /// The TOT anchor was refreshed.
    TotUpdated,
    /// An EIT section updated `service_id`'s schedule or present/following data. Only
    /// fired once a PAT has been observed (spec section 4.7's deferral rule).
    EitUpdated {
        /// The service the EIT section concerns.
        service_id: u16,
    },
    /// CAT-derived EMM PID list changed.
    EmmPidsUpdated,
}

type Listener = Arc<dyn Fn(&AnalyzerEvent) + Send + Sync>;

#[derive(Default)]
struct AnalyzerState {
    services: std::collections::HashMap<u16, ServiceInfo>,
    other_services: std::collections::HashMap<(u16, u16), OtherServiceInfo>,
    pat_transport_stream_id: Option<u16>,
    pat_version: Option<u8>,
    has_seen_pat: bool,
    network: Option<NetworkInfo>,
    emm_pids: Vec<u16>,
    tot_anchor: Option<TotAnchor>,
}

/// Aggregates PAT/PMT/SDT/NIT/CAT/TOT/EIT updates into a queryable service model.
///
/// All query methods and `on_*` mutators lock the same internal mutex; listener
/// callbacks are invoked after that lock is released, so they may safely re-enter any
/// query method.
#[derive(Default)]
pub struct AnalyzerFilter {
    state: Mutex<AnalyzerState>,
    listeners: Mutex<Vec<Listener>>,
}

impl AnalyzerFilter {
    /// A fresh analyzer with no services, network info, or listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener invoked for every [`AnalyzerEvent`]. Returns nothing useful to
    /// unregister by identity; callers that need removal should wrap their closure in a
    /// condition checked inside the closure itself (matching the source's borrow-only
    /// listener model — see spec.md design note 3).
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&AnalyzerEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    fn notify(&self, events: Vec<AnalyzerEvent>) {
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

    /// Replaces the service list from a new PAT. Services no longer listed are dropped;
    /// each remaining/new entry's `pmt_pid` is (re)populated so the caller can (re)map the
    /// corresponding PMT PID in its [`crate::pidmap::PidMap`].
    pub fn on_pat(&self, pat: &Pat) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.has_seen_pat = true;
            state.pat_transport_stream_id = Some(pat.transport_stream_id);
            state.pat_version = Some(pat.version_number);

            let wanted: std::collections::HashSet<u16> = pat
                .entries
                .iter()
                .filter(|e| e.program_number != 0)
                .map(|e| e.program_number)
                .collect();
            state.services.retain(|sid, _| wanted.contains(sid));

            for entry in pat.entries.iter().filter(|e| e.program_number != 0) {
                let svc = state.services.entry(entry.program_number).or_insert_with(|| {
                    ServiceInfo {
                        service_id: entry.program_number,
                        ..Default::default()
                    }
                });
                svc.pmt_pid = Some(entry.pid);
            }
        }
        events.push(AnalyzerEvent::ServiceListUpdated);
        self.notify(events);
    }

    /// Rebuilds `service_id`'s ES list, PCR PID, and ECM PIDs from a PMT observed on
    /// `pmt_pid`. A no-op if `service_id` isn't in the current service list (a stale PMT
    /// arriving after a PAT update already dropped it).
    pub fn on_pmt(&self, service_id: u16, pmt: &Pmt) {
        let mut fired = false;
        {
            let mut state = self.state.lock();
            if let Some(svc) = state.services.get_mut(&service_id) {
                svc.pcr_pid = Some(pmt.pcr_pid);
                svc.ecm_pids = pmt
                    .program_descriptors
                    .iter()
                    .filter_map(|d| match d {
                        Descriptor::Ca { ca_pid, .. } => Some(*ca_pid),
                        _ => None,
                    })
                    .collect();
                svc.es = pmt.es.iter().map(es_info_from_pmt_entry).collect();
                sort_es_by_component_tag(&mut svc.es);
                for d in pmt.program_descriptors.iter() {
                    if let Descriptor::LogoTransmission { logo_id, .. } = d {
                        svc.logo_id = *logo_id;
                    }
                }
                fired = true;
            }
        }
        if fired {
            self.notify(vec![AnalyzerEvent::ServiceUpdated(service_id)]);
        }
    }

    /// Merges an SDT section. For the actual TS, refreshes per-service names/type/running
    /// status on the matching service (by `service_id`, already present via the PAT).
    /// For other TS, populates the cross-TS [`OtherServiceInfo`] map instead.
    pub fn on_sdt(&self, sdt: &Sdt) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            for entry in &sdt.services {
                let service_desc = entry.descriptors.iter().find_map(|d| match d {
                    Descriptor::Service {
                        service_type,
                        provider_name,
                        service_name,
                    } => Some((*service_type, provider_name.clone(), service_name.clone())),
                    _ => None,
                });
                if sdt.actual {
                    if let Some(svc) = state.services.get_mut(&entry.service_id) {
                        svc.running_status = entry.running_status;
                        svc.free_ca = entry.free_ca_mode;
                        if let Some((service_type, provider_name, service_name)) = service_desc {
                            svc.service_type = service_type;
                            svc.provider_name = provider_name;
                            svc.service_name = service_name;
                        }
                        events.push(AnalyzerEvent::ServiceUpdated(entry.service_id));
                    }
                } else {
                    let (service_type, provider_name, service_name) =
                        service_desc.unwrap_or_default();
                    state.other_services.insert(
                        (sdt.transport_stream_id, entry.service_id),
                        OtherServiceInfo {
                            transport_stream_id: sdt.transport_stream_id,
                            network_id: sdt.network_id,
                            service_id: entry.service_id,
                            provider_name,
                            service_name,
                            service_type,
                            running_status: entry.running_status,
                        },
                    );
                }
            }
        }
        self.notify(events);
    }

    /// Refreshes network info from an NIT section. Only the `table_id == 0x40` (actual
    /// network) case updates [`NetworkInfo`]'s per-TS remote-control-key/broadcaster
    /// fields; `0x41` (other) only contributes to `transport_streams`' enumeration when no
    /// actual-network NIT has been seen yet, matching "best info available" behavior.
    pub fn on_nit(&self, nit: &Nit) {
        {
            let mut state = self.state.lock();
            let info = state.network.get_or_insert_with(NetworkInfo::default);
            info.network_id = nit.network_id;
            for d in nit.network_descriptors.iter() {
                if let Descriptor::NetworkName { name } = d {
                    info.network_name = Some(name.clone());
                }
            }
            info.transport_streams = nit
                .transport_streams
                .iter()
                .map(|ts| (ts.transport_stream_id, ts.original_network_id))
                .collect();
            if nit.actual {
                for ts in &nit.transport_streams {
                    for d in ts.descriptors.iter() {
                        match d {
                            Descriptor::TsInformation {
                                remote_control_key_id,
                                ts_name,
                            } => {
                                info.remote_control_key_id = Some(*remote_control_key_id);
                                info.ts_name = Some(ts_name.clone());
                            }
                            Descriptor::SystemManagement {
                                broadcasting_id, ..
                            } => {
                                info.broadcaster_id = Some(*broadcasting_id);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        self.notify(vec![AnalyzerEvent::NetworkUpdated]);
    }

    /// Extracts EMM PIDs from a CAT section.
    pub fn on_cat(&self, cat: &Cat) {
        {
            let mut state = self.state.lock();
            state.emm_pids = cat
                .descriptors
                .iter()
                .filter_map(|d| match d {
                    Descriptor::Ca { ca_pid, .. } => Some(*ca_pid),
                    _ => None,
                })
                .collect();
        }
        self.notify(vec![AnalyzerEvent::EmmPidsUpdated]);
    }

    /// Remembers current wall time and the then-current PCR on the preferred PCR PID.
    pub fn on_tot(&self, anchor: TotAnchor) {
        {
            self.state.lock().tot_anchor = Some(anchor);
        }
        self.notify(vec![AnalyzerEvent::TotUpdated]);
    }

    /// Fans out an EIT update for `eit.service_id`. Deferred entirely (no event fired,
    /// no state touched) if a PAT has not yet been seen, per spec section 4.7.
    pub fn on_eit(&self, eit: &Eit) {
        let should_fire = self.state.lock().has_seen_pat;
        if should_fire {
            self.notify(vec![AnalyzerEvent::EitUpdated {
                service_id: eit.service_id,
            }]);
        }
    }

    /// Current services, keyed by `service_id`.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.state.lock().services.values().cloned().collect()
    }

    /// Looks up one service by id.
    pub fn service(&self, service_id: u16) -> Option<ServiceInfo> {
        self.state.lock().services.get(&service_id).cloned()
    }

    /// Number of currently known services.
    pub fn service_count(&self) -> usize {
        self.state.lock().services.len()
    }

    /// Cross-TS service info for `(transport_stream_id, service_id)`, if an SDT[other]
    /// section has ever mentioned it.
    pub fn other_service(&self, transport_stream_id: u16, service_id: u16) -> Option<OtherServiceInfo> {
        self.state
            .lock()
            .other_services
            .get(&(transport_stream_id, service_id))
            .cloned()
    }

    /// Current network info, if any NIT has been observed.
    pub fn network(&self) -> Option<NetworkInfo> {
        self.state.lock().network.clone()
    }

    /// Current EMM PID list, from the last CAT observed.
    pub fn emm_pids(&self) -> Vec<u16> {
        self.state.lock().emm_pids.clone()
    }

    /// Current TOT anchor, if any TOT has been observed.
    pub fn tot_anchor(&self) -> Option<TotAnchor> {
        self.state.lock().tot_anchor
    }
}
