//! PAT, NIT and SDT delivered as raw transport stream packets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use neumo_protocol::{sat_pos, AnyMux, ConfirmedBy, DvbsMux, KeySrc, MuxKey, Polarisation};
use neumo_receiver::config::SiPolicy;
use neumo_receiver::database::{prelude::*, Database, DatabaseHandle};
use neumo_receiver::engine::{ActiveSiStream, AdapterView, BatchOutcome, SiControl, SiTable};
use neumo_receiver::si::packet::packetize_section;
use neumo_receiver::si::psi::SectionBuilder;
use neumo_receiver::si::{pid, table_id, PatEntry, PatSection, SdtSection, SdtService};
use neumo_receiver::tuner::stream::MemoryReader;
use neumo_receiver::tuner::TuneOptions;

struct View;

impl AdapterView for View {
    fn adapter_no(&self) -> u32 {
        0
    }

    fn can_be_tuned(&self, mux: &AnyMux) -> bool {
        sat_pos::is_sat(mux.key().sat_pos)
    }

    fn is_locked(&self) -> bool {
        true
    }
}

fn tuned() -> AnyMux {
    AnyMux::Dvbs(DvbsMux {
        k: MuxKey {
            sat_pos: 1920,
            ..Default::default()
        },
        frequency: 11_778_000,
        pol: Polarisation::V,
        symbol_rate: 27_500_000,
        ..Default::default()
    })
}

/// Pushes sections with a running continuity counter per PID.
struct Feed {
    reader: MemoryReader,
    cc: HashMap<u16, u8>,
}

impl Feed {
    fn new() -> Self {
        Self {
            reader: MemoryReader::new(tuned(), TuneOptions::default()),
            cc: HashMap::new(),
        }
    }

    fn send(&mut self, pid: u16, section: &[u8]) {
        let cc = self.cc.entry(pid).or_insert(0);
        let packets = packetize_section(pid, *cc, section);
        *cc = (*cc + packets.len() as u8) & 0x0F;
        self.reader.push_packets(packets.iter());
    }

    fn run(&mut self, s: &mut ActiveSiStream, now: Instant) -> BatchOutcome {
        s.process_batch(&mut self.reader, now)
    }
}

fn pat_section() -> Vec<u8> {
    let entries = [
        PatEntry { service_id: 101, pmt_pid: 0x100 },
        PatEntry { service_id: 102, pmt_pid: 0x200 },
    ];
    SectionBuilder::new(table_id::PAT, 1051, 0).build(&PatSection::encode_body(&entries))
}

/// NIT_ACTUAL of network 1 with one satellite carrier: 11778 V 27500 3/4 at 19.2E.
fn nit_section() -> Vec<u8> {
    let delivery = [
        0x43, 11, // satellite delivery system descriptor
        0x01, 0x17, 0x78, 0x00, // 11.77800 GHz
        0x01, 0x92, // 19.2
        0xA1, // east, vertical, DVB-S, QPSK
        0x02, 0x75, 0x00, 0x03, // 27.5000 Msym/s, FEC 3/4
    ];
    let mut body = vec![0xF0, 0x00];
    let entry_len = 6 + delivery.len();
    body.push(0xF0 | ((entry_len >> 8) as u8 & 0x0F));
    body.push(entry_len as u8);
    body.extend_from_slice(&1051u16.to_be_bytes());
    body.extend_from_slice(&1u16.to_be_bytes());
    body.push(0xF0);
    body.push(delivery.len() as u8);
    body.extend_from_slice(&delivery);
    SectionBuilder::new(table_id::NIT_ACTUAL, 1, 0).build(&body)
}

fn sdt_section() -> Vec<u8> {
    let services: Vec<SdtService> = [101u16, 102]
        .iter()
        .map(|&service_id| SdtService {
            service_id,
            service_type: 1,
            name: format!("Channel {service_id}"),
            provider: "Provider".to_string(),
            ..Default::default()
        })
        .collect();
    SectionBuilder::new(table_id::SDT_ACTUAL, 1051, 0).build(&SdtSection::encode_body(1, &services))
}

fn setup() -> (DatabaseHandle, ActiveSiStream, Feed, Instant) {
    let db = Database::open_in_memory().unwrap().into_handle();
    let mut s = ActiveSiStream::new(db.clone(), SiPolicy::default(), Arc::new(View));
    let t0 = Instant::now();
    s.activate(&tuned(), None, t0);
    (db, s, Feed::new(), t0)
}

/// Three identical PATs, three seconds apart.
fn stabilise_pat(s: &mut ActiveSiStream, feed: &mut Feed, t0: Instant) -> Instant {
    for n in 0..3u64 {
        feed.send(pid::PAT, &pat_section());
        let outcome = feed.run(s, t0 + Duration::from_secs(3 * n));
        assert!(matches!(outcome, BatchOutcome::Processed { .. }));
    }
    assert!(s.pat_data().stable_pat());
    t0 + Duration::from_secs(6)
}

#[test]
fn pat_nit_sdt_confirm_the_tuned_mux() {
    let (db, mut s, mut feed, t0) = setup();

    feed.send(pid::PAT, &pat_section());
    feed.run(&mut s, t0);
    assert_eq!(s.pat_data().ts_id(), Some(1051));
    assert!(!s.pat_data().stable_pat());

    let t = stabilise_pat(&mut s, &mut feed, t0);
    assert_eq!(s.confirmation().ts_id_by, ConfirmedBy::Pat);
    assert!(s.scan_state().is_completed(SiTable::Pat));

    feed.send(pid::NIT, &nit_section());
    feed.run(&mut s, t);
    assert_eq!(s.confirmation().sat_by, ConfirmedBy::Nit);
    assert_eq!(s.confirmation().network_id_by, ConfirmedBy::Nit);
    let si_mux = s.si_mux().cloned().unwrap();
    assert_eq!(si_mux.common().key_src, KeySrc::NitTuned);
    assert_eq!(si_mux.common().ts_id, 1051);

    feed.send(pid::SDT_BAT, &sdt_section());
    feed.run(&mut s, t + Duration::from_secs(1));
    assert!(s.confirmation().sdt_actual_done);
    assert_eq!(s.confirmation().sat_by, ConfirmedBy::Nit);

    let mut db = db.lock();
    let txn = db.read_txn().unwrap();
    let muxes = txn.muxes_on_sat(1920).unwrap();
    assert_eq!(muxes.len(), 1);
    let services = txn.services_for_mux(muxes[0].key()).unwrap();
    let mut names: Vec<_> = services.iter().map(|s| s.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["Channel 101", "Channel 102"]);
}

#[test]
fn nit_before_stable_pat_is_redelivered() {
    let (db, mut s, mut feed, t0) = setup();

    feed.send(pid::PAT, &pat_section());
    feed.send(pid::NIT, &nit_section());
    feed.run(&mut s, t0);
    // held back by the stability gate
    assert_eq!(s.confirmation().sat_by, ConfirmedBy::None);
    assert!(db.lock().read_txn().unwrap().muxes_on_sat(1920).unwrap().is_empty());

    let t = stabilise_pat(&mut s, &mut feed, t0);
    feed.send(pid::NIT, &nit_section());
    feed.run(&mut s, t);
    assert_eq!(s.confirmation().sat_by, ConfirmedBy::Nit);
    assert_eq!(db.lock().read_txn().unwrap().muxes_on_sat(1920).unwrap().len(), 1);
}

#[test]
fn changed_pat_aborts() {
    let (_db, mut s, mut feed, t0) = setup();
    feed.send(pid::PAT, &pat_section());
    feed.run(&mut s, t0);

    let other = [PatEntry { service_id: 103, pmt_pid: 0x300 }];
    let changed = SectionBuilder::new(table_id::PAT, 1051, 0).build(&PatSection::encode_body(&other));
    feed.send(pid::PAT, &changed);
    assert_eq!(feed.run(&mut s, t0 + Duration::from_secs(1)), BatchOutcome::Abort);
    assert!(!s.pat_data().stable_pat());
}
