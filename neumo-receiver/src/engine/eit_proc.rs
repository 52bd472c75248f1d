//! EPG processing for DVB EIT and the Sky and MHW2 variants.

use std::time::Instant;

use log::{debug, error};
use neumo_protocol::{EpgKey, EpgRecord, EpgServiceKey, EpgSource, EpgType};

use super::{unix_now, with_write_txn, ActiveSiStream, SectionAction, SiTable, SubtableInfo, SubtableKey};
use crate::database::prelude::*;
use crate::si::{EitSection, Mhw2SummarySection, Mhw2TitleSection, SkySummarySection, SkyTitleSection};

impl ActiveSiStream {
    /// EPG is stored only for a stream whose satellite is known.
    fn epg_writes_allowed(&self) -> bool {
        self.si_writes_allowed() && (self.embedded || self.confirmation.sat_by.is_confirmed())
    }

    /// False when the records could not be written.
    fn store_epg(&mut self, records: &[EpgRecord]) -> bool {
        if records.is_empty() {
            return true;
        }
        let result = with_write_txn(&self.db, |txn| {
            for r in records {
                txn.put_epg(r)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                self.eit_data.events_saved += records.len();
                true
            }
            Err(e) => {
                error!("[SiStream] storing {} EPG records failed: {}", records.len(), e);
                false
            }
        }
    }

    /// Service key for EPG of the tuned stream, by service_id.
    fn tuned_epg_service(&self, service_id: u16) -> Option<EpgServiceKey> {
        let sat_pos = self.tuned_sat_pos()?;
        let (network_id, ts_id) = match &self.si_mux {
            Some(m) => (m.common().network_id, m.common().ts_id),
            None => (0, self.pat_data.ts_id()?),
        };
        Some(EpgServiceKey {
            sat_pos,
            network_id,
            ts_id,
            service_id,
        })
    }

    pub(super) fn on_eit_section(
        &mut self,
        epg_type: EpgType,
        eit: &EitSection,
        key: SubtableKey,
        info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        if !self.epg_writes_allowed() {
            return SectionAction::Reset;
        }
        let Some(sat_pos) = self.tuned_sat_pos() else {
            return SectionAction::NoReset;
        };
        let service = EpgServiceKey {
            sat_pos,
            network_id: eit.original_network_id,
            ts_id: eit.ts_id,
            service_id: eit.service_id,
        };
        let mtime = unix_now();
        let records: Vec<EpgRecord> = eit
            .events
            .iter()
            .map(|e| EpgRecord {
                k: EpgKey {
                    service,
                    start_time: e.start_time,
                    event_id: e.event_id as u32,
                },
                end_time: e.start_time + e.duration as i64,
                event_name: e.event_name.clone(),
                story: e.story.clone(),
                content_codes: e.content_codes.clone(),
                source: EpgSource {
                    epg_type,
                    table_id: eit.table_id,
                    version: info.version_number,
                },
                mtime,
            })
            .collect();
        if !self.store_epg(&records) {
            return SectionAction::Reset;
        }
        self.eit_progress(epg_type, key, info, now);
        SectionAction::NoReset
    }

    pub(super) fn eit_progress(
        &mut self,
        epg_type: EpgType,
        key: SubtableKey,
        info: &SubtableInfo,
        now: Instant,
    ) {
        let table = SiTable::Epg(epg_type);
        self.scan_state.set_active(table, now);
        if self.eit_data.track(key, info) && !self.scan_state.is_completed(table) {
            debug!(
                "[SiStream] {:?} EPG complete, {} events stored",
                epg_type, self.eit_data.events_saved
            );
            self.scan_state.set_completed(table, now);
        }
    }

    pub(super) fn on_sky_titles(
        &mut self,
        epg_type: EpgType,
        section: &SkyTitleSection,
        key: SubtableKey,
        info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        if !self.epg_writes_allowed() {
            return SectionAction::Reset;
        }
        let mtime = unix_now();
        for t in &section.titles {
            let record = EpgRecord {
                k: EpgKey {
                    service: EpgServiceKey::default(),
                    start_time: t.start_time,
                    event_id: t.event_id as u32,
                },
                end_time: t.start_time + t.duration as i64,
                event_name: t.title.clone(),
                story: String::new(),
                content_codes: vec![t.theme],
                source: EpgSource {
                    epg_type,
                    table_id: info.table_id,
                    version: info.version_number,
                },
                mtime,
            };
            self.eit_data
                .sky_titles
                .insert((section.channel_id, t.event_id), record);
        }
        self.eit_progress(epg_type, key, info, now);
        SectionAction::NoReset
    }

    pub(super) fn on_sky_summaries(
        &mut self,
        epg_type: EpgType,
        section: &SkySummarySection,
        key: SubtableKey,
        info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        if !self.epg_writes_allowed() {
            return SectionAction::Reset;
        }
        // channels are resolved through the BAT
        let Some(service) = self
            .bat_data
            .channel_services
            .get(&(section.channel_id as u32))
            .copied()
        else {
            return SectionAction::Reset;
        };
        let mut records = Vec::with_capacity(section.summaries.len());
        for (event_id, summary) in &section.summaries {
            let Some(title) = self.eit_data.sky_titles.get(&(section.channel_id, *event_id)) else {
                return SectionAction::Reset;
            };
            let mut record = title.clone();
            record.k.service = EpgServiceKey {
                sat_pos: service.mux.sat_pos,
                network_id: service.network_id,
                ts_id: service.ts_id,
                service_id: service.service_id,
            };
            record.story = summary.clone();
            records.push(record);
        }
        if !self.store_epg(&records) {
            return SectionAction::Reset;
        }
        self.eit_progress(epg_type, key, info, now);
        SectionAction::NoReset
    }

    pub(super) fn on_mhw2_titles(
        &mut self,
        section: &Mhw2TitleSection,
        key: SubtableKey,
        info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        if !self.epg_writes_allowed() {
            return SectionAction::Reset;
        }
        let mtime = unix_now();
        let mut records = Vec::with_capacity(section.titles.len());
        for t in &section.titles {
            let Some(service) = self.tuned_epg_service(t.service_id) else {
                return SectionAction::Reset;
            };
            let record = EpgRecord {
                k: EpgKey {
                    service,
                    start_time: t.start_time,
                    event_id: t.event_id,
                },
                end_time: t.start_time + t.duration as i64,
                event_name: t.title.clone(),
                story: String::new(),
                content_codes: Vec::new(),
                source: EpgSource {
                    epg_type: EpgType::Mhw2,
                    table_id: info.table_id,
                    version: info.version_number,
                },
                mtime,
            };
            self.eit_data.mhw2_titles.insert(t.event_id, record.clone());
            records.push(record);
        }
        if !self.store_epg(&records) {
            return SectionAction::Reset;
        }
        self.eit_progress(EpgType::Mhw2, key, info, now);
        SectionAction::NoReset
    }

    pub(super) fn on_mhw2_summaries(
        &mut self,
        section: &Mhw2SummarySection,
        key: SubtableKey,
        info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        if !self.epg_writes_allowed() {
            return SectionAction::Reset;
        }
        let mut records = Vec::with_capacity(section.summaries.len());
        for (event_id, summary) in &section.summaries {
            let Some(title) = self.eit_data.mhw2_titles.get(event_id) else {
                return SectionAction::Reset;
            };
            let mut record = title.clone();
            record.story = summary.clone();
            records.push(record);
        }
        if !self.store_epg(&records) {
            return SectionAction::Reset;
        }
        self.eit_progress(EpgType::Mhw2, key, info, now);
        SectionAction::NoReset
    }
}
