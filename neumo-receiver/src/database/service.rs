//! Services, bouquets, EPG, spectra and signal statistics.

use std::collections::HashSet;

use neumo_protocol::{
    Chg, ChgKey, Chgm, EpgRecord, EpgServiceKey, MuxKey, Service, ServiceKey, SignalStat,
    SpectrumRecord,
};

use super::records::{service_network_index, KeyWriter};
use super::{KvRead, KvWrite, Result};

pub trait ServiceRead: KvRead {
    fn find_service(&self, key: &ServiceKey) -> Result<Option<Service>> {
        self.get::<Service>(key)
    }

    /// All services stored under one mux, expired ones included.
    fn services_for_mux(&self, mux: &MuxKey) -> Result<Vec<Service>> {
        self.range_prefix(&KeyWriter::new().mux_key(mux).finish())
    }

    /// Services with the given SI identifiers on one satellite.
    fn find_services_by_ids(
        &self,
        sat_pos: i16,
        network_id: u16,
        ts_id: u16,
        service_id: u16,
    ) -> Result<Vec<Service>> {
        self.find_by_index(&service_network_index(sat_pos, network_id, ts_id, service_id))
    }

    fn chgms_for_bouquet(&self, chg: &ChgKey) -> Result<Vec<Chgm>> {
        self.range_prefix(&KeyWriter::new().chg_key(chg).finish())
    }

    fn epg_for_service(&self, service: &EpgServiceKey) -> Result<Vec<EpgRecord>> {
        self.range_prefix(&KeyWriter::new().epg_service(service).finish())
    }
}

impl<T: KvRead + ?Sized> ServiceRead for T {}

pub trait ServiceWrite: KvWrite {
    fn put_service(&self, service: &Service) -> Result<()> {
        self.put(service)
    }

    /// Mark services of `mux` that are not in `present` as expired.
    ///
    /// Services are never removed because bouquets and recordings may still
    /// refer to them. Returns the number of services newly expired.
    fn mark_expired_services(&self, mux: &MuxKey, present: &HashSet<u16>, now: i64) -> Result<usize> {
        let mut count = 0;
        for mut s in self.services_for_mux(mux)? {
            if !s.expired && !present.contains(&s.k.service_id) {
                s.expired = true;
                s.mtime = now;
                self.put(&s)?;
                count += 1;
            }
        }
        Ok(count)
    }

    fn put_chg(&self, chg: &Chg) -> Result<()> {
        self.put(chg)
    }

    fn put_chgm(&self, chgm: &Chgm) -> Result<()> {
        self.put(chgm)
    }

    fn put_epg(&self, record: &EpgRecord) -> Result<()> {
        self.put(record)
    }

    fn put_spectrum(&self, spectrum: &SpectrumRecord) -> Result<()> {
        self.put(spectrum)
    }

    fn put_signal_stat(&self, stat: &SignalStat) -> Result<()> {
        self.put(stat)
    }
}

impl<T: KvWrite + ?Sized> ServiceWrite for T {}
