//! End-to-end lettered scenarios (spec section 8), exercised through the crate's public
//! API with the same literal inputs the scenarios specify.

use isdb_core::analyzer::AnalyzerFilter;
use isdb_core::descriptor::DescriptorBlock;
use isdb_core::epg::{EpgDatabase, MergeFlags};
use isdb_core::framer::Framer;
use isdb_core::packet::{ParseResult, TS_PACKET_SIZE};
use isdb_core::section::Reassembler;
use isdb_core::selector::{SelectorTarget, StreamSelector};
use isdb_core::table::{self, Eit, EitEventEntry, Pat, PatEntry, Pmt, PmtEsEntry};
use isdb_core::time::TotAnchor;
use chrono::TimeZone;

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
    assert_eq!(framer.out_of_sync_count(), 50);
}

#[test]
fn scenario_b_continuity_error() {
    let mut framer = Framer::new();
    let mut stream = valid_packet(0x200, 3).to_vec();
    stream.extend_from_slice(&valid_packet(0x200, 5));

    let out = framer.feed(&stream, false, false);

    assert_eq!(out.len(), 2);
    assert_eq!(out[1].0, ParseResult::ContinuityError);
    assert_eq!(framer.pid_counters(0x200).unwrap().continuity_error, 1);
}

#[test]
fn scenario_c_pat_then_pmt_registers_service() {
    let analyzer = AnalyzerFilter::new();

    let pat = Pat {
        transport_stream_id: 1,
        version_number: 0,
        entries: vec![PatEntry {
            program_number: 0x0400,
            pid: 0x1F0,
        }],
    };
    analyzer.on_pat(&pat);

    let pmt = Pmt {
        program_number: 0x0400,
        version_number: 0,
        pcr_pid: 0x100,
        program_descriptors: DescriptorBlock::parse(&[]),
        es: vec![
            PmtEsEntry {
                stream_type: 0x02,
                pid: 0x100,
                descriptors: DescriptorBlock::parse(&[]),
            },
            PmtEsEntry {
                stream_type: 0x0F,
                pid: 0x110,
                descriptors: DescriptorBlock::parse(&[]),
            },
        ],
    };
    analyzer.on_pmt(0x0400, &pmt);

    assert_eq!(analyzer.service_count(), 1);
    let service = analyzer.service(0x0400).expect("service 0x0400 registered");
    assert_eq!(service.pmt_pid, Some(0x1F0));
    assert_eq!(service.pcr_pid, Some(0x100));
    let video_es: Vec<u16> = service
        .es
        .iter()
        .filter(|e| e.stream_type == 0x02)
        .map(|e| e.pid)
        .collect();
    let audio_es: Vec<u16> = service
        .es
        .iter()
        .filter(|e| e.stream_type == 0x0F)
        .map(|e| e.pid)
        .collect();
    assert_eq!(video_es, vec![0x100]);
    assert_eq!(audio_es, vec![0x110]);
}

fn short_event_descriptors(text: &str) -> DescriptorBlock {
    let mut body = Vec::new();
    body.extend_from_slice(b"jpn");
    body.push(0);
    let text_bytes = text.as_bytes();
    body.push(text_bytes.len() as u8);
    body.extend_from_slice(text_bytes);

    let mut raw = Vec::new();
    raw.push(0x4D); // ShortEventDescriptor tag
    raw.push(body.len() as u8);
    raw.extend_from_slice(&body);
    DescriptorBlock::parse(&raw)
}

fn make_present_following_eit(extended_text: &str) -> Eit {
    Eit {
        service_id: 0x0401,
        transport_stream_id: 0x0400,
        network_id: 4,
        version_number: 0,
        table_id: 0x4E,
        section_number: 0,
        segment_last_section_number: 0,
        last_table_id: 0x4E,
        events: vec![EitEventEntry {
            event_id: 1,
            start_time_raw: (58849, 0x120000), // 2020-01-01 12:00:00 JST
            duration_raw: 0x003000,            // 30 minutes
            running_status: 0,
            free_ca_mode: false,
            descriptors: short_event_descriptors(extended_text),
        }],
    }
}

#[test]
fn scenario_d_epg_merge() {
    let db_a = EpgDatabase::new();
    let db_b = EpgDatabase::new();

    db_a.merge_eit(&make_present_following_eit("short text"));
    // Give database B's copy a strictly later `updated_at_ms` than A's, so the merge
    // below picks it up as the newer side per spec section 4.9 step 3.
    std::thread::sleep(std::time::Duration::from_millis(5));
    db_b.merge_eit(&make_present_following_eit("longer extended text from B"));

    let anchor = TotAnchor::new(
        isdb_core::time::jst()
            .with_ymd_and_hms(2020, 1, 1, 11, 0, 0)
            .unwrap(),
        0,
    );
    db_a.on_tot(anchor);

    let before = db_a
        .event(4, 0x0400, 0x0401, 1)
        .expect("event present before merge");
    let before_index_position = db_a.service_events(0x0401)[0].event_id;

    let reset_fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let reset_fired2 = reset_fired.clone();
    db_a.add_listener(move |event| {
        if matches!(event, isdb_core::epg::EpgEvent::ScheduleStatusReset { .. }) {
            reset_fired2.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    db_a.merge(
        &db_b,
        MergeFlags {
            discard_old_events: true,
            merge_basic_extended: true,
            ..MergeFlags::default()
        },
    );

    let after = db_a
        .event(4, 0x0400, 0x0401, 1)
        .expect("event present after merge");
    assert_eq!(after.short_text, "longer extended text from B");
    assert_ne!(before.short_text, after.short_text);
    assert_eq!(db_a.service_events(0x0401)[0].event_id, before_index_position);
    assert!(!reset_fired.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn scenario_e_stream_selector_pat_rewrite() {
    let pat = Pat {
        transport_stream_id: 1,
        version_number: 0,
        entries: vec![
            PatEntry {
                program_number: 0,
                pid: 0x0010,
            },
            PatEntry {
                program_number: 0x01,
                pid: 0x100,
            },
            PatEntry {
                program_number: 0x02,
                pid: 0x200,
            },
            PatEntry {
                program_number: 0x03,
                pid: 0x300,
            },
        ],
    };

    let mut selector = StreamSelector::new();
    selector.set_target(SelectorTarget {
        service_id: Some(0x02),
        stream_kinds: None,
    });
    selector.on_pat(&pat);

    let pmt = Pmt {
        program_number: 0x02,
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

    let rewritten = selector.rewrite_pat(&pat).expect("target service is listed");
    let mut reassembler = Reassembler::new();
    let sections = reassembler.store_packet(&rewritten[4..], true);
    assert_eq!(sections.len(), 1);
    let decoded = table::parse_pat(&sections[0]).expect("rewritten PAT decodes");
    assert_eq!(decoded.entries.len(), 2);
    assert!(decoded.entries.iter().any(|e| e.program_number == 0 && e.pid == 0x0010));
    assert!(decoded
        .entries
        .iter()
        .any(|e| e.program_number == 0x02 && e.pid == 0x200));

    assert!(selector.retains(0x0000));
    assert!(selector.retains(0x0010));
    assert!(selector.retains(0x200));
    assert!(!selector.retains(0x100));
    assert!(!selector.retains(0x300));
}

#[test]
fn scenario_f_tot_interpolation() {
    let t0 = isdb_core::time::jst()
        .with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
        .unwrap();
    let p0 = 1_000_000u64;
    let anchor = TotAnchor::new(t0, p0);

    let five_seconds_later = anchor.interpolate(p0 + 5 * 90_000 * 300);
    assert!(five_seconds_later.interpolated);
    assert_eq!(five_seconds_later.time, t0 + chrono::Duration::seconds(5));

    let twenty_seconds_later = anchor.interpolate(p0 + 20 * 90_000 * 300);
    assert!(!twenty_seconds_later.interpolated);
    assert_eq!(twenty_seconds_later.time, t0);
}
