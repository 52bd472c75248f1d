//! Key encoding and the mapping of record types to tables.
//!
//! Keys are encoded big-endian with the sign bit of signed integers flipped,
//! so SQLite's memcmp ordering of BLOBs equals the numeric ordering of the
//! key fields. A prefix of a key is therefore a valid range-scan start.

use neumo_protocol::{
    AnyMux, Chg, ChgKey, Chgm, ChgmKey, EpgKey, EpgRecord, EpgServiceKey, Lnb, LnbKey, MuxKey,
    RfPath, Service, ServiceKey, SignalStat, SignalStatKey, SpectrumKey, SpectrumRecord,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Builder for order-preserving binary keys.
#[derive(Debug, Default, Clone)]
pub struct KeyWriter {
    buf: Vec<u8>,
}

impl KeyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i16(self, v: i16) -> Self {
        self.u16((v as u16) ^ 0x8000)
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i32(self, v: i32) -> Self {
        self.u32((v as u32) ^ 0x8000_0000)
    }

    pub fn i64(mut self, v: i64) -> Self {
        self.buf
            .extend_from_slice(&((v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
        self
    }

    pub fn mux_key(self, k: &MuxKey) -> Self {
        self.i16(k.sat_pos).i16(k.stream_id).u16(k.t2mi_pid).u16(k.mux_id)
    }

    pub fn lnb_key(self, k: &LnbKey) -> Self {
        self.i16(k.dish_id as i16).i16(k.lnb_id).u8(k.lnb_type as u8)
    }

    pub fn rf_path(self, k: &RfPath) -> Self {
        self.lnb_key(&k.lnb).i64(k.card_mac_address).i32(k.rf_input)
    }

    pub fn chg_key(self, k: &ChgKey) -> Self {
        self.u8(k.group_type as u8).u16(k.bouquet_id).i16(k.sat_pos)
    }

    pub fn epg_service(self, k: &EpgServiceKey) -> Self {
        self.i16(k.sat_pos).u16(k.network_id).u16(k.ts_id).u16(k.service_id)
    }

    pub fn service_key(self, k: &ServiceKey) -> Self {
        self.mux_key(&k.mux).u16(k.network_id).u16(k.ts_id).u16(k.service_id)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// A record stored in one table of the database.
pub trait Record: Serialize + DeserializeOwned {
    /// Table name.
    const TABLE: &'static str;
    /// Primary key type.
    type Key;

    fn key(&self) -> Self::Key;

    fn encode_key(key: &Self::Key) -> Vec<u8>;

    /// Value of the secondary index column, if the table has one.
    fn secondary_key(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Secondary index value of a mux: sat_pos, network_id, ts_id.
pub fn mux_network_index(sat_pos: i16, network_id: u16, ts_id: u16) -> Vec<u8> {
    KeyWriter::new().i16(sat_pos).u16(network_id).u16(ts_id).finish()
}

/// Secondary index value of a service: sat_pos, network_id, ts_id, service_id.
pub fn service_network_index(sat_pos: i16, network_id: u16, ts_id: u16, service_id: u16) -> Vec<u8> {
    KeyWriter::new()
        .i16(sat_pos)
        .u16(network_id)
        .u16(ts_id)
        .u16(service_id)
        .finish()
}

impl Record for AnyMux {
    const TABLE: &'static str = "muxes";
    type Key = MuxKey;

    fn key(&self) -> MuxKey {
        *AnyMux::key(self)
    }

    fn encode_key(key: &MuxKey) -> Vec<u8> {
        KeyWriter::new().mux_key(key).finish()
    }

    fn secondary_key(&self) -> Option<Vec<u8>> {
        let c = self.common();
        Some(mux_network_index(AnyMux::key(self).sat_pos, c.network_id, c.ts_id))
    }
}

impl Record for Service {
    const TABLE: &'static str = "services";
    type Key = ServiceKey;

    fn key(&self) -> ServiceKey {
        self.k
    }

    fn encode_key(key: &ServiceKey) -> Vec<u8> {
        KeyWriter::new().service_key(key).finish()
    }

    fn secondary_key(&self) -> Option<Vec<u8>> {
        Some(service_network_index(
            self.k.mux.sat_pos,
            self.k.network_id,
            self.k.ts_id,
            self.k.service_id,
        ))
    }
}

impl Record for Chg {
    const TABLE: &'static str = "chgs";
    type Key = ChgKey;

    fn key(&self) -> ChgKey {
        self.k
    }

    fn encode_key(key: &ChgKey) -> Vec<u8> {
        KeyWriter::new().chg_key(key).finish()
    }
}

impl Record for Chgm {
    const TABLE: &'static str = "chgms";
    type Key = ChgmKey;

    fn key(&self) -> ChgmKey {
        self.k
    }

    fn encode_key(key: &ChgmKey) -> Vec<u8> {
        KeyWriter::new().chg_key(&key.chg).u32(key.channel_id).finish()
    }

    fn secondary_key(&self) -> Option<Vec<u8>> {
        Some(KeyWriter::new().service_key(&self.service).finish())
    }
}

impl Record for EpgRecord {
    const TABLE: &'static str = "epg";
    type Key = EpgKey;

    fn key(&self) -> EpgKey {
        self.k
    }

    fn encode_key(key: &EpgKey) -> Vec<u8> {
        KeyWriter::new()
            .epg_service(&key.service)
            .i64(key.start_time)
            .u32(key.event_id)
            .finish()
    }
}

impl Record for Lnb {
    const TABLE: &'static str = "lnbs";
    type Key = LnbKey;

    fn key(&self) -> LnbKey {
        self.k
    }

    fn encode_key(key: &LnbKey) -> Vec<u8> {
        KeyWriter::new().lnb_key(key).finish()
    }
}

impl Record for SpectrumRecord {
    const TABLE: &'static str = "spectra";
    type Key = SpectrumKey;

    fn key(&self) -> SpectrumKey {
        self.k
    }

    fn encode_key(key: &SpectrumKey) -> Vec<u8> {
        KeyWriter::new()
            .rf_path(&key.rf_path)
            .i16(key.sat_pos)
            .u8(key.pol as u8)
            .u8(key.band as u8)
            .i64(key.start_time)
            .finish()
    }
}

impl Record for SignalStat {
    const TABLE: &'static str = "signal_stats";
    type Key = SignalStatKey;

    fn key(&self) -> SignalStatKey {
        self.k
    }

    fn encode_key(key: &SignalStatKey) -> Vec<u8> {
        KeyWriter::new()
            .mux_key(&key.mux)
            .rf_path(&key.rf_path)
            .i64(key.time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_keys_sort_numerically() {
        let west = KeyWriter::new().i16(-3000).finish();
        let zero = KeyWriter::new().i16(0).finish();
        let east = KeyWriter::new().i16(1920).finish();
        assert!(west < zero);
        assert!(zero < east);

        let early = KeyWriter::new().i64(-5).finish();
        let late = KeyWriter::new().i64(1_700_000_000).finish();
        assert!(early < late);
    }

    #[test]
    fn test_mux_key_prefix() {
        let k = MuxKey {
            sat_pos: 1920,
            stream_id: -1,
            t2mi_pid: 0,
            mux_id: 12,
        };
        let full = AnyMux::encode_key(&k);
        let prefix = KeyWriter::new().i16(1920).i16(-1).u16(0).finish();
        assert!(full.starts_with(&prefix));
        assert_eq!(full.len(), 8);
    }
}
