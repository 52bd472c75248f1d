//! NIT processing: mux discovery and satellite confirmation.

use std::time::Instant;

use log::{debug, error, info, warn};
use neumo_protocol::{sat_pos, AnyMux, ConfirmedBy, KeySrc, MuxPreserve, ScanStatus, TuneSrc};

use super::fixups::FIXUP_RULES;
use super::{
    apply_fixups, fix_mux, with_write_txn, ActiveSiStream, FixContext, SatPosCheck,
    SectionAction, SiTable, SubtableInfo, SubtableKey,
};
use crate::config::RetuneMode;
use crate::database::prelude::*;
use crate::si::{table_id, NitEntry, NitSection};

/// What the entries of one NIT subtable said about the tuned mux.
#[derive(Debug, Default)]
struct NitVerdict {
    /// Entries on the tuned delivery technology.
    on_tuned_tech: usize,
    /// Of those, entries too far from the tuned satellite.
    off_sat: usize,
    /// Index in the stored muxes of the entry describing the tuned carrier.
    tuned: Option<usize>,
}

impl ActiveSiStream {
    pub fn on_nit_section(
        &mut self,
        nit: &NitSection,
        info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        let table = if nit.is_actual {
            SiTable::NitActual
        } else {
            SiTable::NitOther
        };
        self.scan_state.set_active(table, now);
        if nit.is_actual && self.nit_data.actual_network_id.is_none() {
            self.nit_data.actual_network_id = Some(nit.network_id);
        }
        if let Some(name) = &nit.network_name {
            self.nit_data
                .network_names
                .insert(nit.network_id, name.clone());
        }

        let sub = self.nit_data.subtable(info.table_id, nit.network_id);
        sub.add_section(info, nit.entries.iter().cloned());
        if !sub.is_complete(info) {
            return SectionAction::NoReset;
        }
        self.nit_subtable_complete(info.table_id, nit.network_id, now)
    }

    pub(super) fn nit_subtable_timeout(
        &mut self,
        key: SubtableKey,
        _info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        let sub = self.nit_data.subtable(key.table_id, key.extension);
        if sub.num_sections_processed() == 0 {
            return SectionAction::Reset;
        }
        warn!(
            "[SiStream] NIT 0x{:02x} network_id={} incomplete, using {} sections",
            key.table_id,
            key.extension,
            sub.num_sections_processed()
        );
        self.nit_subtable_complete(key.table_id, key.extension, now)
    }

    fn nit_subtable_complete(&mut self, tid: u8, network_id: u16, now: Instant) -> SectionAction {
        if !self.si_writes_allowed() {
            debug!("[SiStream] NIT network_id={} deferred until PAT is stable", network_id);
            self.nit_data.reset_subtable(tid, network_id);
            return SectionAction::Reset;
        }
        let sub = self.nit_data.subtable(tid, network_id);
        let entries = sub.entries().to_vec();
        sub.restart();

        let action = self.process_nit_entries(network_id, tid == table_id::NIT_ACTUAL, &entries, now);
        if action == SectionAction::Reset {
            self.nit_data.reset_subtable(tid, network_id);
        }
        action
    }

    fn process_nit_entries(
        &mut self,
        network_id: u16,
        is_actual: bool,
        entries: &[NitEntry],
        now: Instant,
    ) -> SectionAction {
        let Some(tuned) = self.tuned.clone() else {
            return SectionAction::NoReset;
        };
        let tuned_sat = tuned.key().sat_pos;
        let tolerance = self.policy.sat_pos_tolerance;
        let ctx = FixContext {
            tuned: &tuned,
            pat_ts_id: self.pat_data.ts_id(),
            is_actual,
            sat_pos_tolerance: tolerance,
            polarisation_fixes: &self.policy.polarisation_fixes,
        };

        let mut verdict = NitVerdict::default();
        let mut muxes: Vec<AnyMux> = Vec::new();
        for entry in entries {
            let Some(mut mux) = entry.mux.clone() else {
                continue;
            };
            if mux.kind() != tuned.kind() {
                continue;
            }
            verdict.on_tuned_tech += 1;
            apply_fixups(&mut mux, &ctx, FIXUP_RULES);
            if fix_mux(&mut mux, tuned_sat, tolerance) == SatPosCheck::OutOfTolerance {
                debug!(
                    "[SiStream] NIT entry {} is not on {}",
                    mux,
                    sat_pos::to_str(tuned_sat)
                );
                verdict.off_sat += 1;
                continue;
            }
            if !mux.is_tunable() || !self.view.can_be_tuned(&mux) {
                debug!("[SiStream] NIT entry {} cannot be tuned here", mux);
                continue;
            }
            if is_actual && !self.embedded && verdict.tuned.is_none() && mux.matches_physical(&tuned) {
                let c = mux.common_mut();
                c.tune_src = TuneSrc::NitTuned;
                c.key_src = KeySrc::NitTuned;
                verdict.tuned = Some(muxes.len());
            }
            muxes.push(mux);
        }

        if is_actual
            && !self.embedded
            && verdict.on_tuned_tech > 0
            && verdict.off_sat == verdict.on_tuned_tech
        {
            return self.on_sat_mismatch(network_id, now);
        }

        let scan_id = self.scan_id;
        let tuned_idx = verdict.tuned;
        let stored = with_write_txn(&self.db, |txn| {
            let mut stored = Vec::with_capacity(muxes.len());
            for (idx, mut mux) in muxes.into_iter().enumerate() {
                txn.update_mux(&mut mux, MuxPreserve::NIT)?;
                // newly found muxes join the running scan
                if let Some(id) = scan_id {
                    let status = mux.common().scan_status;
                    if Some(idx) != tuned_idx && matches!(status, ScanStatus::None | ScanStatus::Idle) {
                        if let Some(m) = txn.set_mux_scan_status(mux.key(), ScanStatus::Pending, id)? {
                            mux = m;
                        }
                    }
                }
                stored.push(mux);
            }
            Ok(stored)
        });
        let stored = match stored {
            Ok(s) => s,
            Err(e) => {
                error!("[SiStream] NIT network_id={} write failed: {}", network_id, e);
                return SectionAction::Reset;
            }
        };
        for mux in &stored {
            self.mux_cache.add_from_nit(mux.clone());
        }

        if let Some(m) = tuned_idx.and_then(|i| stored.get(i)) {
            let c = &mut self.confirmation;
            c.confirm_sat(ConfirmedBy::Nit);
            c.confirm_ts_id(ConfirmedBy::Nit);
            c.confirm_network_id(ConfirmedBy::Nit);
            info!(
                "[SiStream] adapter {} NIT_ACTUAL network_id={} confirms {}",
                self.view.adapter_no(),
                network_id,
                m
            );
            self.mux_cache.set_reader_mux(m.clone());
            self.si_mux = Some(m.clone());
        } else if is_actual && !self.embedded {
            let c = &mut self.confirmation;
            if verdict.on_tuned_tech == 0 {
                c.nit_actual_empty = true;
                if c.sdt_actual_done && !c.on_wrong_sat {
                    c.confirm_sat(ConfirmedBy::Timeout);
                }
            } else {
                c.nit_actual_failed = true;
                debug!(
                    "[SiStream] NIT_ACTUAL network_id={} does not list the tuned mux",
                    network_id
                );
            }
        }

        let table = if is_actual {
            SiTable::NitActual
        } else {
            SiTable::NitOther
        };
        self.scan_state.set_completed(table, now);
        SectionAction::NoReset
    }

    /// NIT_ACTUAL places the stream on another satellite.
    fn on_sat_mismatch(&mut self, network_id: u16, now: Instant) -> SectionAction {
        let adapter_no = self.view.adapter_no();
        if self.wrong_sat_resets < self.policy.max_wrong_sat_resets {
            self.wrong_sat_resets += 1;
            self.confirmation.unstable_sat = true;
            info!(
                "[SiStream] adapter {} NIT_ACTUAL network_id={} is for another satellite; dish may still be moving",
                adapter_no, network_id
            );
            return SectionAction::Reset;
        }

        self.confirmation.on_wrong_sat = true;
        let retune = match self.policy.retune_mode {
            RetuneMode::Auto => true,
            RetuneMode::Never => false,
            RetuneMode::IfNotLocked => !self.view.is_locked(),
        };
        if retune && self.policy.abort_on_wrong_sat {
            warn!(
                "[SiStream] adapter {} tuned to the wrong satellite; retuning",
                adapter_no
            );
            return SectionAction::Abort;
        }
        warn!(
            "[SiStream] adapter {} SI reports another satellite; keeping tuned position",
            adapter_no
        );
        self.confirmation.confirm_sat(ConfirmedBy::Timeout);
        self.scan_state.set_completed(SiTable::NitActual, now);
        SectionAction::NoReset
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::test_util::*;
    use crate::engine::SiControl;
    use crate::si::{PatEntry, PatSection};
    use neumo_protocol::{DvbsMux, MuxKey, Polarisation};

    fn pat() -> PatSection {
        PatSection {
            ts_id: 1051,
            entries: vec![PatEntry { service_id: 101, pmt_pid: 0x100 }],
            nit_pid: Some(0x10),
        }
    }

    fn entry(sat: i16, frequency: u32, network_id: u16, ts_id: u16) -> NitEntry {
        let mut m = DvbsMux {
            k: MuxKey {
                sat_pos: sat,
                ..Default::default()
            },
            frequency,
            pol: Polarisation::V,
            symbol_rate: 27_500_000,
            ..Default::default()
        };
        m.c.network_id = network_id;
        m.c.ts_id = ts_id;
        m.c.key_src = KeySrc::Nit;
        m.c.tune_src = TuneSrc::NitActual;
        NitEntry {
            ts_id,
            original_network_id: network_id,
            mux: Some(AnyMux::Dvbs(m)),
            services: Vec::new(),
            lcns: Vec::new(),
        }
    }

    fn nit_actual(entries: Vec<NitEntry>) -> NitSection {
        NitSection {
            network_id: 1,
            is_actual: true,
            network_name: Some("Test network".to_string()),
            entries,
        }
    }

    fn all_muxes(db: &crate::database::DatabaseHandle) -> Vec<AnyMux> {
        db.lock().read_txn().unwrap().muxes_on_sat(1920).unwrap()
    }

    #[test]
    fn test_nit_confirms_tuned_mux() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        let t = make_pat_stable(&mut s, &pat(), t0);

        let nit = nit_actual(vec![entry(1920, 11_778_000, 1, 1051), entry(1920, 12_000_000, 1, 1052)]);
        let action = s.on_nit_section(&nit, &info(table_id::NIT_ACTUAL, 0), t);
        assert_eq!(action, SectionAction::NoReset);

        let c = s.confirmation();
        assert_eq!(c.sat_by, ConfirmedBy::Nit);
        assert_eq!(c.network_id_by, ConfirmedBy::Nit);
        // PAT got there first
        assert_eq!(c.ts_id_by, ConfirmedBy::Pat);
        assert!(s.scan_state().is_completed(SiTable::NitActual));

        let si_mux = s.si_mux().unwrap();
        assert_eq!(si_mux.common().key_src, KeySrc::NitTuned);
        assert_eq!(si_mux.common().tune_src, TuneSrc::NitTuned);
        assert_eq!(all_muxes(&db).len(), 2);
        assert_eq!(s.mux_cache().reader_mux().unwrap().mux.common().ts_id, 1051);
    }

    #[test]
    fn test_nit_waits_for_stable_pat() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        s.on_pat_section(&pat(), &info(table_id::PAT, 0), t0);

        let nit = nit_actual(vec![entry(1920, 11_778_000, 1, 1051)]);
        let action = s.on_nit_section(&nit, &info(table_id::NIT_ACTUAL, 0), t0);
        assert_eq!(action, SectionAction::Reset);
        assert!(all_muxes(&db).is_empty());
        assert_eq!(s.confirmation().sat_by, ConfirmedBy::None);
    }

    #[test]
    fn test_failed_write_asks_for_nit_again() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        let t = make_pat_stable(&mut s, &pat(), t0);

        let nit = nit_actual(vec![entry(1920, 11_778_000, 1, 1051)]);
        let i = info(table_id::NIT_ACTUAL, 0);
        db.lock().set_query_only(true).unwrap();
        assert_eq!(s.on_nit_section(&nit, &i, t), SectionAction::Reset);
        assert!(all_muxes(&db).is_empty());
        assert_eq!(s.confirmation().sat_by, ConfirmedBy::None);
        assert!(!s.scan_state().is_completed(SiTable::NitActual));

        db.lock().set_query_only(false).unwrap();
        assert_eq!(s.on_nit_section(&nit, &i, t), SectionAction::NoReset);
        assert_eq!(all_muxes(&db).len(), 1);
        assert_eq!(s.confirmation().sat_by, ConfirmedBy::Nit);
    }

    #[test]
    fn test_wrong_satellite_resets_then_aborts() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        let t = make_pat_stable(&mut s, &pat(), t0);

        let nit = nit_actual(vec![entry(2820, 11_778_000, 2, 2041)]);
        let i = info(table_id::NIT_ACTUAL, 0);
        assert_eq!(s.on_nit_section(&nit, &i, t), SectionAction::Reset);
        assert!(s.confirmation().unstable_sat);
        assert!(!s.confirmation().on_wrong_sat);

        let t = t + Duration::from_secs(2);
        assert_eq!(s.on_nit_section(&nit, &i, t), SectionAction::Abort);
        assert!(s.confirmation().on_wrong_sat);
        assert!(all_muxes(&db).is_empty());

        s.relisten(t);
        assert!(s.confirmation().on_wrong_sat);
        assert!(!s.confirmation().unstable_sat);
    }

    #[test]
    fn test_wrong_satellite_accepted_without_retune() {
        let db = memory_db();
        let policy = crate::config::SiPolicy {
            retune_mode: RetuneMode::Never,
            max_wrong_sat_resets: 0,
            ..Default::default()
        };
        let mut s = ActiveSiStream::new(
            db.clone(),
            policy,
            std::sync::Arc::new(FakeView { locked: true }),
        );
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        let t = make_pat_stable(&mut s, &pat(), t0);

        let nit = nit_actual(vec![entry(2820, 11_778_000, 2, 2041)]);
        assert_eq!(
            s.on_nit_section(&nit, &info(table_id::NIT_ACTUAL, 0), t),
            SectionAction::NoReset
        );
        assert!(s.confirmation().on_wrong_sat);
        assert_eq!(s.confirmation().sat_by, ConfirmedBy::Timeout);
    }

    #[test]
    fn test_same_carrier_keeps_one_mux_id() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        let t = make_pat_stable(&mut s, &pat(), t0);

        // two networks claim the same carrier with different ids
        let first = nit_actual(vec![entry(1920, 11_778_000, 1, 1051)]);
        s.on_nit_section(&first, &info(table_id::NIT_ACTUAL, 0), t);
        let mut other = nit_actual(vec![entry(1920, 11_779_000, 9, 77)]);
        other.network_id = 9;
        other.is_actual = false;
        s.on_nit_section(&other, &info(table_id::NIT_OTHER, 0), t);

        let muxes = all_muxes(&db);
        assert_eq!(muxes.len(), 1);
        // the tuned stream's ids are better founded than those of another network
        assert_eq!(muxes[0].common().ts_id, 1051);
    }

    #[test]
    fn test_nit_muxes_join_running_scan() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), Some(3), t0);
        let t = make_pat_stable(&mut s, &pat(), t0);

        let nit = nit_actual(vec![entry(1920, 11_778_000, 1, 1051), entry(1920, 12_000_000, 1, 1052)]);
        s.on_nit_section(&nit, &info(table_id::NIT_ACTUAL, 0), t);
        let pending = db
            .lock()
            .read_txn()
            .unwrap()
            .muxes_with_scan_status(ScanStatus::Pending)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].frequency(), 12_000_000);
        assert_eq!(pending[0].common().scan_id, 3);
    }
}
