//! BAT processing: bouquets and their channel lists.

use std::collections::HashSet;
use std::time::Instant;

use log::{debug, error, info, warn};
use neumo_protocol::{Chg, ChgKey, ChgType, Chgm, ChgmKey, Service, ServiceKey};

use super::{unix_now, with_write_txn, ActiveSiStream, SectionAction, SiTable, SubtableInfo, SubtableKey};
use crate::database::prelude::*;
use crate::si::{BatSection, BatTransportStream};

/// A bouquet entry resolved to a stored service.
struct ResolvedChannel {
    channel_id: u32,
    order: u16,
    service: Service,
}

impl ActiveSiStream {
    pub fn on_bat_section(
        &mut self,
        bat: &BatSection,
        info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        self.scan_state.set_active(SiTable::Bat, now);
        if let Some(name) = &bat.name {
            self.bat_data.names.insert(bat.bouquet_id, name.clone());
        }
        let sub = self.bat_data.subtable(bat.bouquet_id);
        sub.add_section(info, bat.transport_streams.iter().cloned());
        if !sub.is_complete(info) {
            return SectionAction::NoReset;
        }
        self.bat_subtable_complete(bat.bouquet_id, now)
    }

    pub(super) fn bat_subtable_timeout(
        &mut self,
        key: SubtableKey,
        _info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        let bouquet_id = key.extension;
        if self.bat_data.subtable(bouquet_id).num_sections_processed() == 0 {
            return SectionAction::Reset;
        }
        warn!("[SiStream] BAT bouquet_id={} incomplete", bouquet_id);
        self.bat_subtable_complete(bouquet_id, now)
    }

    fn bat_subtable_complete(&mut self, bouquet_id: u16, now: Instant) -> SectionAction {
        if !self.si_writes_allowed() {
            self.bat_data.subtable(bouquet_id).reset();
            return SectionAction::Reset;
        }
        let sub = self.bat_data.subtable(bouquet_id);
        let streams = sub.entries().to_vec();
        sub.restart();

        let action = self.process_bat(bouquet_id, &streams, now);
        if action == SectionAction::Reset {
            self.bat_data.subtable(bouquet_id).reset();
        }
        action
    }

    /// Look up the services of a bouquet. `None` when a transport stream
    /// could still be described by an SDT not yet received.
    fn resolve_bouquet(
        &self,
        sat: i16,
        streams: &[BatTransportStream],
        now: Instant,
    ) -> crate::database::Result<Option<Vec<ResolvedChannel>>> {
        let sdt_settled = self.scan_state.settled(SiTable::SdtActual, now)
            && self.scan_state.settled(SiTable::SdtOther, now);
        let mut db = self.db.lock();
        let txn = db.read_txn()?;
        let mut channels = Vec::new();
        for ts in streams {
            let ids = (ts.original_network_id, ts.ts_id);
            let mut unresolved = 0;
            for (idx, bs) in ts.services.iter().enumerate() {
                let found = txn
                    .find_services_by_ids(sat, ts.original_network_id, ts.ts_id, bs.service_id)?
                    .into_iter()
                    .find(|s| !s.expired);
                let Some(service) = found else {
                    unresolved += 1;
                    continue;
                };
                channels.push(ResolvedChannel {
                    channel_id: if bs.channel_id != 0 {
                        bs.channel_id
                    } else {
                        bs.service_id as u32
                    },
                    order: if bs.lcn != 0 { bs.lcn } else { (idx + 1) as u16 },
                    service,
                });
            }
            if unresolved > 0 && !self.sdt_data.completed.contains(&ids) && !sdt_settled {
                debug!(
                    "[SiStream] BAT waits for SDT of {}:{} ({} services unknown)",
                    ids.0, ids.1, unresolved
                );
                return Ok(None);
            }
        }
        Ok(Some(channels))
    }

    fn process_bat(
        &mut self,
        bouquet_id: u16,
        streams: &[BatTransportStream],
        now: Instant,
    ) -> SectionAction {
        let Some(sat) = self.tuned_sat_pos() else {
            return SectionAction::NoReset;
        };
        let channels = match self.resolve_bouquet(sat, streams, now) {
            Ok(Some(c)) => c,
            Ok(None) => return SectionAction::Reset,
            Err(e) => {
                error!("[SiStream] BAT bouquet_id={} lookup failed: {}", bouquet_id, e);
                return SectionAction::Reset;
            }
        };

        let chg_key = ChgKey {
            group_type: ChgType::Bouquet,
            bouquet_id,
            sat_pos: sat,
        };
        let name = self
            .bat_data
            .names
            .get(&bouquet_id)
            .cloned()
            .unwrap_or_else(|| format!("Bouquet {}", bouquet_id));
        let result = with_write_txn(&self.db, |txn| {
            let now_secs = unix_now();
            let chg = Chg {
                k: chg_key,
                name,
                num_channels: channels.len() as u32,
                mtime: now_secs,
            };
            txn.put_chg(&chg)?;

            let old: Vec<Chgm> = txn.chgms_for_bouquet(&chg_key)?;
            let mut present = HashSet::new();
            for ch in &channels {
                let k = ChgmKey {
                    chg: chg_key,
                    channel_id: ch.channel_id,
                };
                present.insert(ch.channel_id);
                let previous = old.iter().find(|c| c.k == k);
                let mut chgm = Chgm {
                    k,
                    service: ch.service.k,
                    chgm_order: ch.order,
                    name: ch.service.name.clone(),
                    media_mode: ch.service.media_mode,
                    encrypted: ch.service.encrypted,
                    expired: false,
                    mtime: previous.map_or(now_secs, |p| p.mtime),
                };
                if previous != Some(&chgm) {
                    chgm.mtime = now_secs;
                    txn.put_chgm(&chgm)?;
                }
            }
            for mut gone in old.into_iter().filter(|c| !c.expired && !present.contains(&c.k.channel_id)) {
                gone.expired = true;
                gone.mtime = now_secs;
                txn.put_chgm(&gone)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            error!("[SiStream] BAT bouquet_id={} write failed: {}", bouquet_id, e);
            return SectionAction::Reset;
        }

        info!(
            "[SiStream] adapter {} bouquet {} with {} channels",
            self.view.adapter_no(),
            bouquet_id,
            channels.len()
        );
        for ch in &channels {
            let k: ServiceKey = ch.service.k;
            self.bat_data.channel_services.insert(ch.channel_id, k);
        }
        self.scan_state.set_completed(SiTable::Bat, now);
        SectionAction::NoReset
    }
}
