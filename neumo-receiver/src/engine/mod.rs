//! SI stream engine.
//!
//! An [`ActiveSiStream`] consumes the transport stream of one tuned mux,
//! decodes its SI tables, decides whether the stream is the one that was
//! asked for and writes what it learns to the database.
//!
//! Table callbacks return a [`SectionAction`]:
//! - `NoReset`: the section was consumed
//! - `Reset`: forget the subtable so that the next broadcast cycle delivers it again
//! - `Abort`: the stream cannot be trusted as is; the adapter must retune
//!
//! BAT and EPG sections are queued until the tuned mux is fully confirmed.

pub mod accumulators;
mod bat_proc;
pub mod confirmation;
mod eit_proc;
pub mod fixups;
pub mod mux_cache;
mod nit_proc;
pub mod parsers;
mod pat_proc;
mod pmt_proc;
pub mod scan_state;
mod sdt_proc;

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, trace, warn};
use neumo_protocol::{AnyMux, ConfirmedBy, EpgType, Notification, SatPos, ScanResult};

pub use accumulators::{
    BatData, EitData, NitData, PatData, PatUpdate, PmtData, SdtData, Subtable, SubtableInfo,
};
pub use confirmation::TuneConfirmation;
pub use fixups::{apply_fixups, fix_mux, FixContext, FixupRule, PolarisationFix, SatPosCheck};
pub use mux_cache::{MuxCache, MuxData};
pub use parsers::{ParserKind, ParserRegistry, SectionParser, SubtableKey};
pub use scan_state::{ScanState, SiTable};

use crate::config::SiPolicy;
use crate::database::{self, prelude::*, DatabaseHandle, WriteTxn};
use crate::si::{
    packet, pid, table_id, BatSection, EitSection, Mhw2SummarySection, Mhw2TitleSection,
    NitSection, PatSection, PmtSection, PsiSection, SdtSection, SkySummarySection,
    SkyTitleSection, TsHeader, SYNC_BYTE, TS_PACKET_SIZE,
};
use crate::tuner::stream::{is_overflow, StreamReader};

/// What a table callback wants done with the subtable it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionAction {
    NoReset,
    Reset,
    Abort,
}

/// Result of one [`SiControl::process_batch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Processed { packets: usize },
    Abort,
}

/// What the SI stream may ask about the adapter it runs on.
pub trait AdapterView: Send + Sync {
    fn adapter_no(&self) -> u32;
    /// True if some LNB connected to the adapter can receive `mux`.
    fn can_be_tuned(&self, mux: &AnyMux) -> bool;
    fn is_locked(&self) -> bool;
}

/// Operations the adapter performs on its SI stream.
pub trait SiControl: Send {
    /// Start a fresh session for `tuned`. `scan_id` is set when the tune is part of a scan.
    fn activate(&mut self, tuned: &AnyMux, scan_id: Option<i32>, now: Instant);
    /// Start over on the same mux, keeping only the wrong-satellite verdict.
    fn relisten(&mut self, now: Instant);
    fn deactivate(&mut self);
    fn is_active(&self) -> bool;
    /// Consume what the reader has, up to the batch deadline.
    fn process_batch(&mut self, reader: &mut dyn StreamReader, now: Instant) -> BatchOutcome;
    fn confirmation(&self) -> &TuneConfirmation;
    fn scan_done(&self, now: Instant) -> bool;
    fn scan_result(&self, now: Instant) -> ScanResult;
    /// The tuned mux as confirmed by SI.
    fn si_mux(&self) -> Option<&AnyMux>;
    fn num_services(&self) -> u16;
    fn take_notifications(&mut self) -> Vec<Notification>;
    /// Embedded streams found in PMTs which should be tuned next.
    fn take_embedded_requests(&mut self) -> Vec<AnyMux>;
}

/// A decoded fragment held back until the mux is confirmed.
#[derive(Debug)]
enum Fragment {
    Bat(BatSection),
    Eit(EpgType, EitSection),
    SkyTitles(EpgType, SkyTitleSection),
    SkySummaries(EpgType, SkySummarySection),
    Mhw2Titles(Mhw2TitleSection),
    Mhw2Summaries(Mhw2SummarySection),
}

#[derive(Debug)]
struct PendingFragment {
    pid: u16,
    key: SubtableKey,
    info: SubtableInfo,
    fragment: Fragment,
}

/// SI processing for one tuned stream.
pub struct ActiveSiStream {
    db: DatabaseHandle,
    policy: SiPolicy,
    view: Arc<dyn AdapterView>,
    registry: ParserRegistry,
    scan_state: ScanState,
    confirmation: TuneConfirmation,
    pat_data: PatData,
    nit_data: NitData,
    sdt_data: SdtData,
    bat_data: BatData,
    eit_data: EitData,
    pmt_data: PmtData,
    mux_cache: MuxCache,
    /// Mux handed to the tuner.
    tuned: Option<AnyMux>,
    /// Database record of the tuned carrier when the session started.
    db_mux: Option<AnyMux>,
    embedded: bool,
    scan_id: Option<i32>,
    si_mux: Option<AnyMux>,
    pending: VecDeque<PendingFragment>,
    wrong_sat_resets: u32,
    notifications: Vec<Notification>,
    embedded_requests: Vec<AnyMux>,
    num_services: u16,
    registered_pids: Vec<u16>,
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Run `f` in one write transaction and commit it.
pub(crate) fn with_write_txn<T>(
    db: &DatabaseHandle,
    f: impl FnOnce(&WriteTxn<'_>) -> database::Result<T>,
) -> database::Result<T> {
    let mut db = db.lock();
    let txn = db.write_txn()?;
    let out = f(&txn)?;
    txn.commit()?;
    Ok(out)
}

impl ActiveSiStream {
    pub fn new(db: DatabaseHandle, policy: SiPolicy, view: Arc<dyn AdapterView>) -> Self {
        Self {
            registry: ParserRegistry::new(policy.subtable_timeout()),
            scan_state: ScanState::new(policy.table_not_present(), policy.table_stalled()),
            confirmation: TuneConfirmation::default(),
            pat_data: PatData::new(policy.pat_stable_hold()),
            nit_data: NitData::default(),
            sdt_data: SdtData::default(),
            bat_data: BatData::default(),
            eit_data: EitData::default(),
            pmt_data: PmtData::default(),
            mux_cache: MuxCache::default(),
            tuned: None,
            db_mux: None,
            embedded: false,
            scan_id: None,
            si_mux: None,
            pending: VecDeque::new(),
            wrong_sat_resets: 0,
            notifications: Vec::new(),
            embedded_requests: Vec::new(),
            num_services: 0,
            registered_pids: Vec::new(),
            db,
            policy,
            view,
        }
    }

    pub fn scan_state(&self) -> &ScanState {
        &self.scan_state
    }

    pub fn pat_data(&self) -> &PatData {
        &self.pat_data
    }

    pub fn mux_cache(&self) -> &MuxCache {
        &self.mux_cache
    }

    pub fn registry(&self) -> &ParserRegistry {
        &self.registry
    }

    /// SI derived database writes are only allowed on a stable stream.
    fn si_writes_allowed(&self) -> bool {
        self.embedded || self.pat_data.stable_pat()
    }

    fn tuned_sat_pos(&self) -> Option<SatPos> {
        self.tuned.as_ref().map(|m| m.key().sat_pos)
    }

    fn clear_session(&mut self, preserve_wrong_sat: bool) {
        self.registry.clear();
        self.scan_state.reset();
        self.confirmation.clear(preserve_wrong_sat);
        self.pat_data.reset();
        self.nit_data = NitData::default();
        self.sdt_data = SdtData::default();
        self.bat_data = BatData::default();
        self.eit_data = EitData::default();
        self.pmt_data = PmtData::default();
        self.mux_cache.clear();
        self.pending.clear();
        self.si_mux = None;
        self.num_services = 0;
    }

    fn start_session(&mut self, now: Instant) {
        let Some(sat) = self.tuned_sat_pos() else {
            return;
        };
        self.registry.register(pid::PAT, ParserKind::Pat);
        self.registry.register(pid::NIT, ParserKind::Nit);
        self.registry.register(pid::SDT_BAT, ParserKind::SdtBat);

        self.scan_state.start(SiTable::Pat, true, now);
        self.scan_state.start(SiTable::NitActual, true, now);
        self.scan_state.start(SiTable::SdtActual, true, now);
        self.scan_state.start(SiTable::NitOther, false, now);
        self.scan_state.start(SiTable::SdtOther, false, now);
        self.scan_state.start(SiTable::Bat, false, now);

        if self.policy.scan_epg || self.scan_id.is_none() {
            self.register_epg(sat, now);
        }
    }

    fn register_epg(&mut self, sat: SatPos, now: Instant) {
        let mut parsers = vec![(pid::EIT, ParserKind::Eit(EpgType::Dvb))];
        match sat {
            282 => {
                parsers.push((pid::FREESAT_EIT, ParserKind::Eit(EpgType::Freesat)));
                parsers.push((pid::FREESAT_EIT_PF, ParserKind::Eit(EpgType::Freesat)));
                for p in pid::SKY_TITLES.iter().chain(pid::SKY_SUMMARIES.iter()) {
                    parsers.push((*p, ParserKind::Sky(EpgType::SkyUk)));
                }
            }
            130 => {
                for p in pid::SKY_TITLES.iter().chain(pid::SKY_SUMMARIES.iter()) {
                    parsers.push((*p, ParserKind::Sky(EpgType::SkyIt)));
                }
            }
            49 | 50 => parsers.push((pid::VIASAT_EIT, ParserKind::Eit(EpgType::Viasat))),
            -300 | 190 => {
                parsers.push((pid::MHW2_TITLES, ParserKind::Mhw2));
                parsers.push((pid::MHW2_SUMMARIES, ParserKind::Mhw2));
            }
            _ => {}
        }

        let required = self.policy.scan_epg && self.scan_id.is_some();
        for (p, kind) in parsers {
            self.registry.register(p, kind);
            let epg_type = match kind {
                ParserKind::Eit(t) | ParserKind::Sky(t) => t,
                _ => EpgType::Mhw2,
            };
            if self.scan_state.get(SiTable::Epg(epg_type)).is_none() {
                self.scan_state.start(SiTable::Epg(epg_type), required, now);
            }
        }
    }

    /// A PAT changed under us: everything decided from NIT and SDT is void.
    fn withdraw_si_decisions(&mut self) {
        self.nit_data = NitData::default();
        self.sdt_data = SdtData::default();
        self.bat_data = BatData::default();
        self.mux_cache.clear();
        self.pending.clear();
        self.si_mux = None;
        self.confirmation.clear(true);
        for p in [pid::NIT, pid::SDT_BAT] {
            if let Some(parser) = self.registry.get_mut(p) {
                parser.forget_all();
            }
        }
    }

    fn lookup_tuned_in_db(&self, tuned: &AnyMux) -> database::Result<Option<AnyMux>> {
        let mut db = self.db.lock();
        let txn = db.read_txn()?;
        txn.find_mux_by_freq(tuned)
    }

    fn process_packet(&mut self, data: &[u8], now: Instant, sections: &mut Vec<Vec<u8>>) -> bool {
        let Ok(h) = TsHeader::parse(data) else {
            return false;
        };
        if h.transport_error {
            return false;
        }
        let Some(parser) = self.registry.get_mut(h.pid) else {
            return false;
        };
        let Some(payload) = packet::payload(&h, data) else {
            return false;
        };
        parser.push_packet(&h, payload, sections);
        for raw in sections.drain(..) {
            if self.process_section(h.pid, &raw, now) == SectionAction::Abort {
                return true;
            }
        }
        false
    }

    fn process_section(&mut self, pid: u16, raw: &[u8], now: Instant) -> SectionAction {
        let section = match PsiSection::parse(raw) {
            Ok(s) => s,
            Err(e) => {
                trace!("[SiStream] pid={} bad section: {}", pid, e);
                return SectionAction::NoReset;
            }
        };
        if section.header.section_syntax_indicator && !section.verify_crc(raw) {
            debug!(
                "[SiStream] pid={} table 0x{:02x} crc error",
                pid, section.header.table_id
            );
            return SectionAction::NoReset;
        }
        let Some(parser) = self.registry.get_mut(pid) else {
            return SectionAction::NoReset;
        };
        let kind = parser.kind;
        let Some(info) = parser.accept(&section, now) else {
            return SectionAction::NoReset;
        };
        let key = SubtableKey::of(&section);
        let action = self.dispatch(pid, kind, key, &section, info, now);
        self.apply_action(pid, key, action)
    }

    fn dispatch(
        &mut self,
        pid: u16,
        kind: ParserKind,
        key: SubtableKey,
        section: &PsiSection,
        info: SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        let tid = section.header.table_id;
        let parsed = match kind {
            ParserKind::Pat => {
                PatSection::parse(section).map(|pat| self.on_pat_section(&pat, &info, now))
            }
            ParserKind::Pmt => {
                PmtSection::parse(section).map(|pmt| self.on_pmt_section(pid, &pmt, &info, now))
            }
            ParserKind::Nit => {
                NitSection::parse(section).map(|nit| self.on_nit_section(&nit, &info, now))
            }
            ParserKind::SdtBat if tid == table_id::BAT => BatSection::parse(section)
                .map(|bat| self.deliver_or_queue(pid, key, info, Fragment::Bat(bat), now)),
            ParserKind::SdtBat => {
                SdtSection::parse(section).map(|sdt| self.on_sdt_section(&sdt, &info, now))
            }
            ParserKind::Eit(t) => EitSection::parse(section)
                .map(|eit| self.deliver_or_queue(pid, key, info, Fragment::Eit(t, eit), now)),
            ParserKind::Sky(t) if (table_id::SKY_TITLES_FIRST..=table_id::SKY_TITLES_LAST).contains(&tid) => {
                SkyTitleSection::parse(section)
                    .map(|s| self.deliver_or_queue(pid, key, info, Fragment::SkyTitles(t, s), now))
            }
            ParserKind::Sky(t) => SkySummarySection::parse(section)
                .map(|s| self.deliver_or_queue(pid, key, info, Fragment::SkySummaries(t, s), now)),
            ParserKind::Mhw2 if tid == table_id::MHW2_TITLES => Mhw2TitleSection::parse(section)
                .map(|s| self.deliver_or_queue(pid, key, info, Fragment::Mhw2Titles(s), now)),
            ParserKind::Mhw2 => Mhw2SummarySection::parse(section)
                .map(|s| self.deliver_or_queue(pid, key, info, Fragment::Mhw2Summaries(s), now)),
        };
        parsed.unwrap_or_else(|e| {
            debug!("[SiStream] pid={} table 0x{:02x}: {}", pid, tid, e);
            SectionAction::NoReset
        })
    }

    fn apply_action(&mut self, pid: u16, key: SubtableKey, action: SectionAction) -> SectionAction {
        if action == SectionAction::Reset {
            if let Some(parser) = self.registry.get_mut(pid) {
                parser.forget(&key);
            }
        }
        action
    }

    fn deliver_or_queue(
        &mut self,
        pid: u16,
        key: SubtableKey,
        info: SubtableInfo,
        fragment: Fragment,
        now: Instant,
    ) -> SectionAction {
        if self.embedded || self.confirmation.all_confirmed() {
            return self.deliver(fragment, key, &info, now);
        }
        if self.pending.len() >= self.policy.pending_queue_limit {
            if let Some(old) = self.pending.pop_front() {
                // the dropped subtable must be delivered again in full
                self.pending.retain(|f| !(f.pid == old.pid && f.key == old.key));
                if let Some(parser) = self.registry.get_mut(old.pid) {
                    parser.forget(&old.key);
                }
                debug!(
                    "[SiStream] pending queue full, dropped table 0x{:02x}/{}",
                    old.key.table_id, old.key.extension
                );
            }
        }
        self.pending.push_back(PendingFragment {
            pid,
            key,
            info,
            fragment,
        });
        SectionAction::NoReset
    }

    fn deliver(
        &mut self,
        fragment: Fragment,
        key: SubtableKey,
        info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        match fragment {
            Fragment::Bat(bat) => self.on_bat_section(&bat, info, now),
            Fragment::Eit(t, eit) => self.on_eit_section(t, &eit, key, info, now),
            Fragment::SkyTitles(t, s) => self.on_sky_titles(t, &s, key, info, now),
            Fragment::SkySummaries(t, s) => self.on_sky_summaries(t, &s, key, info, now),
            Fragment::Mhw2Titles(s) => self.on_mhw2_titles(&s, key, info, now),
            Fragment::Mhw2Summaries(s) => self.on_mhw2_summaries(&s, key, info, now),
        }
    }

    fn release_pending(&mut self, now: Instant) -> SectionAction {
        if self.pending.is_empty() || !(self.embedded || self.confirmation.all_confirmed()) {
            return SectionAction::NoReset;
        }
        debug!("[SiStream] releasing {} queued sections", self.pending.len());
        while let Some(p) = self.pending.pop_front() {
            let action = self.deliver(p.fragment, p.key, &p.info, now);
            if self.apply_action(p.pid, p.key, action) == SectionAction::Abort {
                return SectionAction::Abort;
            }
        }
        SectionAction::NoReset
    }

    fn poll_timeouts(&mut self, now: Instant) -> SectionAction {
        let mut expired = Vec::new();
        for p in self.registry.pids() {
            if let Some(parser) = self.registry.get_mut(p) {
                let kind = parser.kind;
                for (key, info) in parser.poll_timeouts(now) {
                    expired.push((p, kind, key, info));
                }
            }
        }
        for (p, kind, key, info) in expired {
            debug!(
                "[SiStream] pid={} table 0x{:02x}/{} timed out",
                p, key.table_id, key.extension
            );
            let action = self.on_subtable_timeout(kind, key, &info, now);
            if self.apply_action(p, key, action) == SectionAction::Abort {
                return SectionAction::Abort;
            }
        }
        SectionAction::NoReset
    }

    fn on_subtable_timeout(
        &mut self,
        kind: ParserKind,
        key: SubtableKey,
        info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        match kind {
            ParserKind::Nit => self.nit_subtable_timeout(key, info, now),
            ParserKind::SdtBat if key.table_id == table_id::BAT => {
                if self.embedded || self.confirmation.all_confirmed() {
                    self.bat_subtable_timeout(key, info, now)
                } else {
                    SectionAction::Reset
                }
            }
            ParserKind::SdtBat => self.sdt_subtable_timeout(key, info, now),
            ParserKind::Eit(t) | ParserKind::Sky(t) => {
                self.eit_progress(t, key, info, now);
                SectionAction::NoReset
            }
            ParserKind::Mhw2 => {
                self.eit_progress(EpgType::Mhw2, key, info, now);
                SectionAction::NoReset
            }
            ParserKind::Pat | ParserKind::Pmt => SectionAction::NoReset,
        }
    }

    /// Accept the satellite position once SDT_ACTUAL is in and NIT_ACTUAL
    /// had its chance to contradict it.
    fn check_confirmation_timeout(&mut self, now: Instant) {
        let c = &self.confirmation;
        if c.sat_by.is_confirmed() || c.on_wrong_sat || c.nit_actual_failed || !c.sdt_actual_done {
            return;
        }
        if self.scan_state.is_completed(SiTable::NitActual)
            || !self.scan_state.done(SiTable::NitActual, now)
        {
            return;
        }
        info!(
            "[SiStream] adapter {} no NIT_ACTUAL; accepting tuned sat_pos",
            self.view.adapter_no()
        );
        self.confirmation.confirm_sat(ConfirmedBy::Timeout);
    }

    fn housekeeping(&mut self, now: Instant) -> SectionAction {
        if self.poll_timeouts(now) == SectionAction::Abort {
            return SectionAction::Abort;
        }
        self.check_confirmation_timeout(now);
        self.release_pending(now)
    }

    fn update_reader_pids(&mut self, reader: &mut dyn StreamReader) {
        let pids = self.registry.pids();
        if pids == self.registered_pids {
            return;
        }
        match reader.set_pids(&pids) {
            Ok(()) => self.registered_pids = pids,
            Err(e) => warn!("[SiStream] failed to set pids {:?}: {}", pids, e),
        }
    }
}

impl SiControl for ActiveSiStream {
    fn activate(&mut self, tuned: &AnyMux, scan_id: Option<i32>, now: Instant) {
        self.clear_session(false);
        self.wrong_sat_resets = 0;
        self.registered_pids.clear();
        self.embedded = tuned.key().t2mi_pid != 0;
        self.scan_id = scan_id;
        self.db_mux = self.lookup_tuned_in_db(tuned).unwrap_or_else(|e| {
            warn!("[SiStream] mux lookup failed: {}", e);
            None
        });
        self.tuned = Some(tuned.clone());
        info!(
            "[SiStream] adapter {} activate {}{}",
            self.view.adapter_no(),
            tuned,
            if scan_id.is_some() { " (scan)" } else { "" }
        );
        self.start_session(now);
    }

    fn relisten(&mut self, now: Instant) {
        info!(
            "[SiStream] adapter {} relisten (wrong_sat={})",
            self.view.adapter_no(),
            self.confirmation.on_wrong_sat
        );
        self.clear_session(true);
        self.start_session(now);
    }

    fn deactivate(&mut self) {
        if self.tuned.is_some() {
            debug!("[SiStream] adapter {} deactivate", self.view.adapter_no());
        }
        self.clear_session(false);
        self.registered_pids.clear();
        self.tuned = None;
        self.db_mux = None;
    }

    fn is_active(&self) -> bool {
        self.tuned.is_some()
    }

    fn process_batch(&mut self, reader: &mut dyn StreamReader, now: Instant) -> BatchOutcome {
        if self.tuned.is_none() {
            return BatchOutcome::Processed { packets: 0 };
        }
        self.update_reader_pids(reader);
        let deadline = Instant::now() + self.policy.batch_deadline();
        let mut sections = Vec::new();
        let mut packets = 0usize;
        let mut abort = false;

        while !abort {
            let consumed = match reader.read() {
                Ok([]) => break,
                Ok(data) => {
                    let mut offset = 0;
                    while offset + TS_PACKET_SIZE <= data.len() {
                        if data[offset] != SYNC_BYTE {
                            offset += data[offset + 1..]
                                .iter()
                                .position(|&b| b == SYNC_BYTE)
                                .map_or(data.len() - offset, |p| p + 1);
                            continue;
                        }
                        packets += 1;
                        let packet = &data[offset..offset + TS_PACKET_SIZE];
                        offset += TS_PACKET_SIZE;
                        if self.process_packet(packet, now, &mut sections) {
                            abort = true;
                            break;
                        }
                    }
                    offset
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted || is_overflow(&e) => {
                    debug!("[SiStream] read: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!("[SiStream] read failed: {}", e);
                    break;
                }
            };
            if consumed == 0 {
                break;
            }
            reader.discard(consumed);
            if Instant::now() >= deadline {
                break;
            }
        }

        if !abort && self.housekeeping(now) == SectionAction::Abort {
            abort = true;
        }
        self.update_reader_pids(reader);
        if abort {
            BatchOutcome::Abort
        } else {
            BatchOutcome::Processed { packets }
        }
    }

    fn confirmation(&self) -> &TuneConfirmation {
        &self.confirmation
    }

    fn scan_done(&self, now: Instant) -> bool {
        self.scan_state.scan_done(now)
    }

    fn scan_result(&self, _now: Instant) -> ScanResult {
        if !self.scan_state.get(SiTable::Pat).map_or(false, |s| s.active) {
            return ScanResult::NoData;
        }
        if self.confirmation.on_wrong_sat {
            return ScanResult::Bad;
        }
        if self.scan_state.is_completed(SiTable::Pat)
            && self.scan_state.is_completed(SiTable::SdtActual)
            && self.confirmation.sat_by.is_confirmed()
        {
            ScanResult::Ok
        } else {
            ScanResult::Partial
        }
    }

    fn si_mux(&self) -> Option<&AnyMux> {
        self.si_mux.as_ref()
    }

    fn num_services(&self) -> u16 {
        self.num_services
    }

    fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    fn take_embedded_requests(&mut self) -> Vec<AnyMux> {
        std::mem::take(&mut self.embedded_requests)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::time::Duration;

    use super::*;
    use crate::database::Database;
    use crate::si::SdtService;
    use neumo_protocol::{DvbsMux, MuxKey, Polarisation};

    pub struct FakeView {
        pub locked: bool,
    }

    impl AdapterView for FakeView {
        fn adapter_no(&self) -> u32 {
            0
        }

        fn can_be_tuned(&self, mux: &AnyMux) -> bool {
            neumo_protocol::sat_pos::is_sat(mux.key().sat_pos)
        }

        fn is_locked(&self) -> bool {
            self.locked
        }
    }

    pub fn tuned_mux() -> AnyMux {
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

    pub fn stream(db: &DatabaseHandle) -> ActiveSiStream {
        let policy = SiPolicy {
            scan_epg: true,
            ..Default::default()
        };
        ActiveSiStream::new(db.clone(), policy, Arc::new(FakeView { locked: true }))
    }

    pub fn memory_db() -> DatabaseHandle {
        Database::open_in_memory().unwrap().into_handle()
    }

    pub fn info(table_id: u8, version: u8) -> SubtableInfo {
        SubtableInfo {
            table_id,
            version_number: version,
            pid: 0,
            section_number: 0,
            num_sections_present: 1,
            timedout: false,
            complete: true,
        }
    }

    pub fn sdt_service(service_id: u16) -> SdtService {
        SdtService {
            service_id,
            service_type: 1,
            name: format!("Service {}", service_id),
            provider: "Provider".to_string(),
            ..Default::default()
        }
    }

    /// Deliver the same PAT three times over six seconds so that it is stable.
    pub fn make_pat_stable(s: &mut ActiveSiStream, pat: &PatSection, t0: Instant) -> Instant {
        let i = info(table_id::PAT, 0);
        for n in 0..3u64 {
            s.on_pat_section(pat, &i, t0 + Duration::from_secs(3 * n));
        }
        assert!(s.pat_data().stable_pat());
        t0 + Duration::from_secs(6)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::test_util::*;
    use super::*;
    use crate::si::packet::packetize_section;
    use crate::si::psi::SectionBuilder;
    use crate::si::PatEntry;
    use crate::tuner::stream::MemoryReader;
    use crate::tuner::TuneOptions;

    fn pat_section(ts_id: u16, version: u8) -> Vec<u8> {
        let entries = [
            PatEntry { service_id: 101, pmt_pid: 0x100 },
            PatEntry { service_id: 102, pmt_pid: 0x200 },
        ];
        SectionBuilder::new(table_id::PAT, ts_id, version).build(&PatSection::encode_body(&entries))
    }

    #[test]
    fn test_activate_registers_base_parsers() {
        let db = memory_db();
        let mut s = stream(&db);
        let now = Instant::now();
        s.activate(&tuned_mux(), Some(1), now);
        assert!(s.is_active());
        for p in [pid::PAT, pid::NIT, pid::SDT_BAT, pid::EIT] {
            assert!(s.registry().contains(p), "pid {} missing", p);
        }
        assert!(!s.scan_done(now));

        s.deactivate();
        assert!(!s.is_active());
        assert!(s.registry().pids().is_empty());
    }

    #[test]
    fn test_batch_reads_whole_packets_and_sets_pids() {
        let db = memory_db();
        let mut s = stream(&db);
        let now = Instant::now();
        s.activate(&tuned_mux(), None, now);

        let mut reader = MemoryReader::new(tuned_mux(), TuneOptions::default());
        let packets = packetize_section(pid::PAT, 0, &pat_section(1051, 0));
        // garbage before the first sync byte is skipped
        reader.push(&[0x00, 0x12]);
        reader.push_packets(packets.iter());
        let outcome = s.process_batch(&mut reader, now);
        assert_eq!(outcome, BatchOutcome::Processed { packets: 1 });
        assert_eq!(reader.pending(), 0);
        assert_eq!(s.pat_data().ts_id(), Some(1051));
        assert!(reader.pids().contains(&pid::PAT));
    }

    #[test]
    fn test_pat_change_aborts_batch() {
        let db = memory_db();
        let mut s = stream(&db);
        let now = Instant::now();
        s.activate(&tuned_mux(), None, now);

        let mut reader = MemoryReader::new(tuned_mux(), TuneOptions::default());
        reader.push_packets(packetize_section(pid::PAT, 0, &pat_section(1051, 0)).iter());
        assert!(matches!(s.process_batch(&mut reader, now), BatchOutcome::Processed { .. }));

        let other = [PatEntry { service_id: 103, pmt_pid: 0x300 }];
        let changed =
            SectionBuilder::new(table_id::PAT, 1051, 0).build(&PatSection::encode_body(&other));
        reader.push_packets(packetize_section(pid::PAT, 1, &changed).iter());
        assert_eq!(s.process_batch(&mut reader, now), BatchOutcome::Abort);
    }

    #[test]
    fn test_relisten_keeps_only_wrong_sat() {
        let db = memory_db();
        let mut s = stream(&db);
        let now = Instant::now();
        s.activate(&tuned_mux(), None, now);
        s.confirmation.confirm_sat(ConfirmedBy::Nit);
        s.confirmation.confirm_ts_id(ConfirmedBy::Pat);
        s.confirmation.unstable_sat = true;
        s.confirmation.on_wrong_sat = true;

        s.relisten(now + Duration::from_secs(1));
        assert_eq!(
            *s.confirmation(),
            TuneConfirmation {
                on_wrong_sat: true,
                ..Default::default()
            }
        );
        assert!(s.registry().contains(pid::PAT));

        s.activate(&tuned_mux(), None, now);
        assert_eq!(*s.confirmation(), TuneConfirmation::default());
    }

    #[test]
    fn test_bat_and_eit_wait_for_confirmation() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);

        let eit = EitSection {
            table_id: table_id::EIT_PF_ACTUAL,
            service_id: 101,
            ts_id: 1051,
            original_network_id: 1,
            ..Default::default()
        };
        let key = SubtableKey {
            table_id: table_id::EIT_PF_ACTUAL,
            extension: 101,
            extra: (1 << 16) | 1051,
        };
        let action = s.deliver_or_queue(
            pid::EIT,
            key,
            info(table_id::EIT_PF_ACTUAL, 0),
            Fragment::Eit(EpgType::Dvb, eit),
            t0,
        );
        assert_eq!(action, SectionAction::NoReset);
        assert_eq!(s.pending.len(), 1);

        s.confirmation.confirm_sat(ConfirmedBy::Sdt);
        s.confirmation.confirm_ts_id(ConfirmedBy::Pat);
        s.confirmation.confirm_network_id(ConfirmedBy::Sdt);
        assert_eq!(s.release_pending(t0), SectionAction::NoReset);
        assert!(s.pending.is_empty());
    }

    #[test]
    fn test_pending_queue_is_bounded() {
        let db = memory_db();
        let policy = SiPolicy {
            pending_queue_limit: 2,
            ..Default::default()
        };
        let mut s = ActiveSiStream::new(db, policy, Arc::new(FakeView { locked: true }));
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        for sid in 0..5u16 {
            let key = SubtableKey {
                table_id: table_id::EIT_PF_ACTUAL,
                extension: sid,
                extra: 0,
            };
            let eit = EitSection {
                service_id: sid,
                ..Default::default()
            };
            s.deliver_or_queue(
                pid::EIT,
                key,
                info(table_id::EIT_PF_ACTUAL, 0),
                Fragment::Eit(EpgType::Dvb, eit),
                t0,
            );
        }
        assert_eq!(s.pending.len(), 2);
        assert_eq!(s.pending[0].key.extension, 3);
    }

    #[test]
    fn test_missing_nit_accepts_sat_after_window() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        let pat = PatSection {
            ts_id: 1051,
            entries: vec![PatEntry { service_id: 101, pmt_pid: 0x100 }],
            nit_pid: None,
        };
        let t = make_pat_stable(&mut s, &pat, t0);
        let sdt = SdtSection {
            ts_id: 1051,
            original_network_id: 1,
            is_actual: true,
            services: vec![sdt_service(101)],
        };
        s.on_sdt_section(&sdt, &info(table_id::SDT_ACTUAL, 0), t);
        assert!(!s.confirmation().sat_by.is_confirmed());

        s.check_confirmation_timeout(t);
        assert!(!s.confirmation().sat_by.is_confirmed());

        s.check_confirmation_timeout(t0 + Duration::from_secs(21));
        assert_eq!(s.confirmation().sat_by, ConfirmedBy::Timeout);
    }
}
