//! Mux lookups and the canonical mux update.

use log::debug;
use neumo_protocol::{AnyMux, MuxKey, MuxPreserve, ScanStatus};

use super::records::{mux_network_index, KeyWriter};
use super::{KvRead, KvWrite, Result};

/// Outcome of [`MuxWrite::update_mux`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMuxResult {
    /// An identical record already existed.
    Unchanged,
    /// An existing record for the same carrier was updated.
    Updated,
    /// No record existed; a new one was created.
    New,
}

fn carrier_prefix(k: &MuxKey) -> Vec<u8> {
    KeyWriter::new()
        .i16(k.sat_pos)
        .i16(k.stream_id)
        .u16(k.t2mi_pid)
        .finish()
}

pub trait MuxRead: KvRead {
    fn find_mux_by_key(&self, key: &MuxKey) -> Result<Option<AnyMux>> {
        self.get::<AnyMux>(key)
    }

    /// Mux describing the same physical carrier, regardless of its network_id/ts_id.
    fn find_mux_by_freq(&self, mux: &AnyMux) -> Result<Option<AnyMux>> {
        let candidates: Vec<AnyMux> = self.range_prefix(&carrier_prefix(mux.key()))?;
        let best = candidates
            .into_iter()
            .filter(|m| m.matches_physical(mux))
            .min_by_key(|m| m.frequency().abs_diff(mux.frequency()));
        Ok(best)
    }

    /// Muxes on `sat_pos` carrying the given network_id/ts_id.
    fn find_muxes_by_network_ts(&self, sat_pos: i16, network_id: u16, ts_id: u16) -> Result<Vec<AnyMux>> {
        self.find_by_index(&mux_network_index(sat_pos, network_id, ts_id))
    }

    /// Muxes on one satellite (or pseudo position).
    fn muxes_on_sat(&self, sat_pos: i16) -> Result<Vec<AnyMux>> {
        self.range_prefix(&KeyWriter::new().i16(sat_pos).finish())
    }

    fn muxes_with_scan_status(&self, status: ScanStatus) -> Result<Vec<AnyMux>> {
        Ok(self
            .all::<AnyMux>()?
            .into_iter()
            .filter(|m| m.common().scan_status == status)
            .collect())
    }

    /// Smallest unused mux_id for the carrier prefix of `key`.
    fn allocate_mux_id(&self, key: &MuxKey) -> Result<u16> {
        let existing: Vec<AnyMux> = self.range_prefix(&carrier_prefix(key))?;
        let max = existing.iter().map(|m| m.key().mux_id).max().unwrap_or(0);
        Ok(max.saturating_add(1))
    }
}

impl<T: KvRead + ?Sized> MuxRead for T {}

pub trait MuxWrite: KvWrite {
    /// Store `mux` as the single canonical record of its physical carrier.
    ///
    /// An existing record for the same carrier (same key, or same frequency,
    /// polarisation and stream within tolerance) keeps its mux_id. The fields in
    /// `preserve` are taken from the existing record. network_id/ts_id are also
    /// kept when the existing record's key source is more authoritative.
    /// `mux` is updated in place to what was stored.
    fn update_mux(&self, mux: &mut AnyMux, preserve: MuxPreserve) -> Result<UpdateMuxResult> {
        let by_key = if mux.key().mux_id != 0 {
            self.get::<AnyMux>(mux.key())?
                .filter(|old| old.matches_physical(mux))
        } else {
            None
        };
        let existing = match by_key {
            Some(old) => Some(old),
            None => self.find_mux_by_freq(mux)?,
        };

        match existing {
            Some(old) => {
                let mut preserve = preserve;
                if old.common().key_src > mux.common().key_src {
                    preserve |= MuxPreserve::NETWORK_ID_TS_ID;
                }
                *mux.key_mut() = *old.key();
                mux.common_mut().preserve_from(old.common(), preserve);
                if *mux == old {
                    return Ok(UpdateMuxResult::Unchanged);
                }
                debug!("[Database] update mux {} ({:?})", mux, mux.key());
                self.put(mux)?;
                Ok(UpdateMuxResult::Updated)
            }
            None => {
                if mux.key().mux_id == 0 {
                    mux.key_mut().mux_id = self.allocate_mux_id(mux.key())?;
                }
                debug!("[Database] new mux {} ({:?})", mux, mux.key());
                self.put(mux)?;
                Ok(UpdateMuxResult::New)
            }
        }
    }

    /// Set scan status of a stored mux.
    fn set_mux_scan_status(&self, key: &MuxKey, status: ScanStatus, scan_id: i32) -> Result<Option<AnyMux>> {
        let Some(mut mux) = self.get::<AnyMux>(key)? else {
            return Ok(None);
        };
        mux.common_mut().set_scan_status(status, scan_id)?;
        self.put(&mux)?;
        Ok(Some(mux))
    }
}

impl<T: KvWrite + ?Sized> MuxWrite for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use neumo_protocol::{DvbsMux, KeySrc, Polarisation, TuneSrc};

    fn mux(freq: u32, network_id: u16, ts_id: u16, key_src: KeySrc) -> AnyMux {
        let mut m = DvbsMux {
            k: MuxKey {
                sat_pos: 1920,
                ..Default::default()
            },
            frequency: freq,
            pol: Polarisation::V,
            symbol_rate: 27_500_000,
            ..Default::default()
        };
        m.c.network_id = network_id;
        m.c.ts_id = ts_id;
        m.c.key_src = key_src;
        AnyMux::Dvbs(m)
    }

    #[test]
    fn test_same_carrier_keeps_one_mux_id() {
        let mut db = Database::open_in_memory().unwrap();
        let txn = db.write_txn().unwrap();

        let mut from_nit = mux(11_778_000, 1, 1051, KeySrc::NitTuned);
        assert_eq!(txn.update_mux(&mut from_nit, MuxPreserve::NIT).unwrap(), UpdateMuxResult::New);

        // SDT disagrees about the key of the same carrier
        let mut from_sdt = mux(11_778_500, 1, 1052, KeySrc::SdtTuned);
        assert_eq!(txn.update_mux(&mut from_sdt, MuxPreserve::SDT).unwrap(), UpdateMuxResult::Updated);
        assert_eq!(from_sdt.key().mux_id, from_nit.key().mux_id);

        // A later NIT write must not undo the SDT key
        let mut again = mux(11_778_000, 1, 1051, KeySrc::NitTuned);
        txn.update_mux(&mut again, MuxPreserve::NIT).unwrap();
        assert_eq!(again.common().ts_id, 1052);

        let all: Vec<AnyMux> = txn.muxes_on_sat(1920).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].common().key_src, KeySrc::SdtTuned);
    }

    #[test]
    fn test_distinct_carriers_get_distinct_ids() {
        let mut db = Database::open_in_memory().unwrap();
        let txn = db.write_txn().unwrap();
        let mut a = mux(11_778_000, 1, 1051, KeySrc::Nit);
        let mut b = mux(11_817_000, 1, 1053, KeySrc::Nit);
        txn.update_mux(&mut a, MuxPreserve::NIT).unwrap();
        txn.update_mux(&mut b, MuxPreserve::NIT).unwrap();
        assert_ne!(a.key().mux_id, b.key().mux_id);

        let found = txn.find_muxes_by_network_ts(1920, 1, 1053).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].frequency(), 11_817_000);
    }

    #[test]
    fn test_unchanged_and_scan_status() {
        let mut db = Database::open_in_memory().unwrap();
        let txn = db.write_txn().unwrap();
        let mut a = mux(11_778_000, 1, 1051, KeySrc::Nit);
        a.common_mut().tune_src = TuneSrc::NitActual;
        txn.update_mux(&mut a, MuxPreserve::NIT).unwrap();
        let mut same = a.clone();
        assert_eq!(txn.update_mux(&mut same, MuxPreserve::NIT).unwrap(), UpdateMuxResult::Unchanged);

        assert!(txn.set_mux_scan_status(a.key(), ScanStatus::Pending, 0).is_err());
        txn.set_mux_scan_status(a.key(), ScanStatus::Pending, 5).unwrap();
        assert_eq!(txn.muxes_with_scan_status(ScanStatus::Pending).unwrap().len(), 1);
    }
}
