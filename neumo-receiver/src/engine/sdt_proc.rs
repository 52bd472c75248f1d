//! SDT processing: service lists of the tuned and of other muxes.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use log::{debug, error, info, warn};
use neumo_protocol::{
    AnyMux, ConfirmedBy, KeySrc, MediaMode, MuxPreserve, Notification, SdtActualReport, Service,
    ServiceKey,
};

use super::{unix_now, with_write_txn, ActiveSiStream, SectionAction, SiTable, SubtableInfo, SubtableKey};
use crate::database::prelude::*;
use crate::database::WriteTxn;
use crate::si::{table_id, SdtSection, SdtService};

/// Stream level data of one service learnt from PAT and PMT.
#[derive(Debug, Clone, Copy, Default)]
struct ServicePids {
    pmt_pid: u16,
    video_pid: u16,
    encrypted: bool,
}

/// Write the services of `mux`, touching only records that changed.
fn store_services(
    txn: &WriteTxn<'_>,
    mux: &AnyMux,
    services: &[SdtService],
    pids: &HashMap<u16, ServicePids>,
    now: i64,
) -> crate::database::Result<Vec<Service>> {
    let c = mux.common();
    let existing: HashMap<u16, Service> = txn
        .services_for_mux(mux.key())?
        .into_iter()
        .map(|s| (s.k.service_id, s))
        .collect();

    let mut stored = Vec::with_capacity(services.len());
    for s in services {
        let p = pids.get(&s.service_id).copied().unwrap_or_default();
        let old = existing.get(&s.service_id);
        let mut service = Service {
            k: ServiceKey {
                mux: *mux.key(),
                network_id: c.network_id,
                ts_id: c.ts_id,
                service_id: s.service_id,
            },
            name: s.name.clone(),
            provider: s.provider.clone(),
            service_type: s.service_type,
            media_mode: MediaMode::from_service_type(s.service_type),
            encrypted: s.free_ca_mode || p.encrypted,
            // PAT and PMT are only seen on the tuned mux
            pmt_pid: if p.pmt_pid != 0 { p.pmt_pid } else { old.map_or(0, |o| o.pmt_pid) },
            video_pid: if p.video_pid != 0 { p.video_pid } else { old.map_or(0, |o| o.video_pid) },
            frequency: mux.frequency(),
            pol: mux.pol(),
            expired: false,
            mtime: old.map_or(now, |o| o.mtime),
        };
        if old != Some(&service) {
            service.mtime = now;
            txn.put_service(&service)?;
        }
        stored.push(service);
    }
    Ok(stored)
}

impl ActiveSiStream {
    pub fn on_sdt_section(
        &mut self,
        sdt: &SdtSection,
        info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        let table = if sdt.is_actual {
            SiTable::SdtActual
        } else {
            SiTable::SdtOther
        };
        self.scan_state.set_active(table, now);
        let (network_id, ts_id) = (sdt.original_network_id, sdt.ts_id);
        let sub = self.sdt_data.subtable(info.table_id, network_id, ts_id);
        sub.add_section(info, sdt.services.iter().cloned());
        if !sub.is_complete(info) {
            return SectionAction::NoReset;
        }
        self.sdt_subtable_complete(info.table_id, network_id, ts_id, now)
    }

    pub(super) fn sdt_subtable_timeout(
        &mut self,
        key: SubtableKey,
        _info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        let (network_id, ts_id) = (key.extra as u16, key.extension);
        let sub = self.sdt_data.subtable(key.table_id, network_id, ts_id);
        if sub.num_sections_processed() == 0 {
            return SectionAction::Reset;
        }
        warn!(
            "[SiStream] SDT 0x{:02x} {}:{} incomplete, using {} sections",
            key.table_id,
            network_id,
            ts_id,
            sub.num_sections_processed()
        );
        self.sdt_subtable_complete(key.table_id, network_id, ts_id, now)
    }

    fn sdt_subtable_complete(
        &mut self,
        tid: u8,
        network_id: u16,
        ts_id: u16,
        now: Instant,
    ) -> SectionAction {
        if !self.si_writes_allowed() {
            debug!("[SiStream] SDT {}:{} deferred until PAT is stable", network_id, ts_id);
            self.sdt_data.reset_subtable(tid, network_id, ts_id);
            return SectionAction::Reset;
        }
        let sub = self.sdt_data.subtable(tid, network_id, ts_id);
        let services = sub.entries().to_vec();
        sub.restart();

        let action = if tid == table_id::SDT_ACTUAL {
            self.process_sdt_actual(network_id, ts_id, &services, now)
        } else {
            self.process_sdt_other(network_id, ts_id, &services, now)
        };
        if action == SectionAction::Reset {
            self.sdt_data.reset_subtable(tid, network_id, ts_id);
        }
        action
    }

    fn service_pids(&self) -> HashMap<u16, ServicePids> {
        let mut pids: HashMap<u16, ServicePids> = HashMap::new();
        for e in self.pat_data.entries() {
            pids.entry(e.service_id).or_default().pmt_pid = e.pmt_pid;
        }
        for (service_id, pmt) in &self.pmt_data.by_service {
            let p = pids.entry(*service_id).or_default();
            p.video_pid = pmt.video_pid().unwrap_or(0);
            p.encrypted = pmt.is_encrypted();
        }
        pids
    }

    fn process_sdt_actual(
        &mut self,
        network_id: u16,
        ts_id: u16,
        services: &[SdtService],
        now: Instant,
    ) -> SectionAction {
        let Some(base) = self
            .si_mux
            .clone()
            .or_else(|| self.db_mux.clone())
            .or_else(|| self.tuned.clone())
        else {
            return SectionAction::NoReset;
        };
        if let Some(pat_ts_id) = self.pat_data.ts_id() {
            if pat_ts_id != ts_id {
                warn!(
                    "[SiStream] SDT_ACTUAL ts_id={} differs from PAT ts_id={}",
                    ts_id, pat_ts_id
                );
            }
        }
        // a known mux which now claims other ids is not the one we know
        let key_changed = self.db_mux.as_ref().map_or(false, |m| {
            let c = m.common();
            c.key_src != KeySrc::None && (c.network_id != network_id || c.ts_id != ts_id)
        });
        let persist = !self.confirmation.on_wrong_sat;
        let pids = self.service_pids();
        let num_services = services.len().min(u16::MAX as usize) as u16;

        let result = with_write_txn(&self.db, |txn| {
            let existing: HashSet<u16> = if base.key().mux_id != 0 {
                txn.services_for_mux(base.key())?
                    .into_iter()
                    .map(|s| s.k.service_id)
                    .collect()
            } else {
                HashSet::new()
            };
            let matches = services
                .iter()
                .filter(|s| existing.contains(&s.service_id))
                .count();
            let mut mux = base;
            if !persist {
                return Ok((mux, matches, Vec::new()));
            }
            let now_secs = unix_now();
            {
                let c = mux.common_mut();
                c.network_id = network_id;
                c.ts_id = ts_id;
                c.key_src = KeySrc::SdtTuned;
                c.num_services = num_services;
                c.mtime = now_secs;
            }
            txn.update_mux(&mut mux, MuxPreserve::SDT)?;
            let stored = store_services(txn, &mux, services, &pids, now_secs)?;
            let present: HashSet<u16> = services.iter().map(|s| s.service_id).collect();
            let expired = txn.mark_expired_services(mux.key(), &present, now_secs)?;
            if expired > 0 {
                info!("[SiStream] {} services of {} expired", expired, mux);
            }
            Ok((mux, matches, stored))
        });
        let (mux, matches, stored) = match result {
            Ok(r) => r,
            Err(e) => {
                error!("[SiStream] SDT_ACTUAL {}:{} write failed: {}", network_id, ts_id, e);
                return SectionAction::Reset;
            }
        };

        let c = &mut self.confirmation;
        if matches > 2 && !key_changed && !c.on_wrong_sat && !c.unstable_sat && !c.nit_actual_failed {
            c.confirm_sat(ConfirmedBy::Sdt);
        }
        c.confirm_ts_id(ConfirmedBy::Sdt);
        c.confirm_network_id(ConfirmedBy::Sdt);
        c.sdt_actual_done = true;
        if c.nit_actual_empty && !c.on_wrong_sat {
            c.confirm_sat(ConfirmedBy::Timeout);
        }
        if key_changed {
            info!(
                "[SiStream] adapter {} {} now carries {}:{}",
                self.view.adapter_no(),
                mux,
                network_id,
                ts_id
            );
        }
        debug!(
            "[SiStream] SDT_ACTUAL {}:{} with {} services ({} known)",
            network_id, ts_id, num_services, matches
        );

        self.num_services = num_services;
        self.sdt_data.completed.insert((network_id, ts_id));
        let entry = self.mux_cache.upsert(network_id, ts_id, mux.clone());
        entry.seen_in_sdt = true;
        entry.sdt_completed = true;
        if persist {
            self.mux_cache.set_reader_mux(mux.clone());
            self.si_mux = Some(mux.clone());
            self.notifications.push(Notification::SdtActual(SdtActualReport {
                mux_key: *mux.key(),
                network_id,
                ts_id,
                services: stored,
            }));
        }
        self.scan_state.set_completed(SiTable::SdtActual, now);
        SectionAction::NoReset
    }

    fn process_sdt_other(
        &mut self,
        network_id: u16,
        ts_id: u16,
        services: &[SdtService],
        now: Instant,
    ) -> SectionAction {
        if self.confirmation.on_wrong_sat {
            return SectionAction::NoReset;
        }
        let Some(sat) = self.tuned_sat_pos() else {
            return SectionAction::NoReset;
        };
        let cached = self.mux_cache.get(network_id, ts_id).map(|d| d.mux.clone());
        let mux = match cached {
            Some(m) => Some(m),
            None => {
                let mut db = self.db.lock();
                match db
                    .read_txn()
                    .and_then(|txn| txn.find_muxes_by_network_ts(sat, network_id, ts_id))
                {
                    Ok(found) => found.into_iter().next(),
                    Err(e) => {
                        error!("[SiStream] mux lookup {}:{} failed: {}", network_id, ts_id, e);
                        None
                    }
                }
            }
        };

        let Some(mux) = mux else {
            if self.scan_state.is_completed(SiTable::NitActual)
                && self.scan_state.settled(SiTable::NitOther, now)
            {
                debug!("[SiStream] SDT_OTHER {}:{} for an unknown mux", network_id, ts_id);
                return SectionAction::NoReset;
            }
            // the NIT may still describe this mux
            return SectionAction::Reset;
        };

        let pids = HashMap::new();
        let result = with_write_txn(&self.db, |txn| {
            let now_secs = unix_now();
            let stored = store_services(txn, &mux, services, &pids, now_secs)?;
            let present: HashSet<u16> = services.iter().map(|s| s.service_id).collect();
            txn.mark_expired_services(mux.key(), &present, now_secs)?;
            Ok(stored.len())
        });
        match result {
            Ok(n) => debug!("[SiStream] SDT_OTHER {}:{} on {} with {} services", network_id, ts_id, mux, n),
            Err(e) => {
                error!("[SiStream] SDT_OTHER {}:{} write failed: {}", network_id, ts_id, e);
                return SectionAction::Reset;
            }
        }

        self.sdt_data.completed.insert((network_id, ts_id));
        let entry = self.mux_cache.upsert(network_id, ts_id, mux);
        entry.seen_in_sdt = true;
        entry.sdt_completed = true;
        self.scan_state.set_completed(SiTable::SdtOther, now);
        SectionAction::NoReset
    }
}
