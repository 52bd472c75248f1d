//! Session cache of muxes referenced by NIT and SDT.

use std::collections::HashMap;

use neumo_protocol::AnyMux;

/// What one SI session learnt about a `(network_id, ts_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxData {
    /// Best known description, as last stored in the database.
    pub mux: AnyMux,
    pub seen_in_nit: bool,
    pub seen_in_sdt: bool,
    /// The SDT of this mux completed during the session.
    pub sdt_completed: bool,
    /// The mux is the one the session reads from.
    pub is_reader_mux: bool,
}

impl MuxData {
    fn new(mux: AnyMux) -> Self {
        Self {
            mux,
            seen_in_nit: false,
            seen_in_sdt: false,
            sdt_completed: false,
            is_reader_mux: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MuxCache {
    by_ids: HashMap<(u16, u16), MuxData>,
}

impl MuxCache {
    pub fn clear(&mut self) {
        self.by_ids.clear();
    }

    pub fn get(&self, network_id: u16, ts_id: u16) -> Option<&MuxData> {
        self.by_ids.get(&(network_id, ts_id))
    }

    pub fn get_mut(&mut self, network_id: u16, ts_id: u16) -> Option<&mut MuxData> {
        self.by_ids.get_mut(&(network_id, ts_id))
    }

    /// Entry for `(network_id, ts_id)`, created from `mux` if absent. An
    /// existing entry gets `mux` as its new description.
    pub fn upsert(&mut self, network_id: u16, ts_id: u16, mux: AnyMux) -> &mut MuxData {
        let entry = self
            .by_ids
            .entry((network_id, ts_id))
            .or_insert_with(|| MuxData::new(mux.clone()));
        entry.mux = mux;
        entry
    }

    pub fn add_from_nit(&mut self, mux: AnyMux) -> &mut MuxData {
        let c = mux.common();
        let (network_id, ts_id) = (c.network_id, c.ts_id);
        let entry = self.upsert(network_id, ts_id, mux);
        entry.seen_in_nit = true;
        entry
    }

    /// Record the reader mux. Any previous reader flag is dropped.
    pub fn set_reader_mux(&mut self, mux: AnyMux) {
        for d in self.by_ids.values_mut() {
            d.is_reader_mux = false;
        }
        let c = mux.common();
        let (network_id, ts_id) = (c.network_id, c.ts_id);
        self.upsert(network_id, ts_id, mux).is_reader_mux = true;
    }

    pub fn reader_mux(&self) -> Option<&MuxData> {
        self.by_ids.values().find(|d| d.is_reader_mux)
    }

    pub fn sdt_completed(&self, network_id: u16, ts_id: u16) -> bool {
        self.get(network_id, ts_id).map_or(false, |d| d.sdt_completed)
    }

    pub fn len(&self) -> usize {
        self.by_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neumo_protocol::DvbsMux;

    fn mux(network_id: u16, ts_id: u16, frequency: u32) -> AnyMux {
        let mut m = DvbsMux {
            frequency,
            ..Default::default()
        };
        m.c.network_id = network_id;
        m.c.ts_id = ts_id;
        AnyMux::Dvbs(m)
    }

    #[test]
    fn test_reader_mux_is_unique() {
        let mut cache = MuxCache::default();
        cache.add_from_nit(mux(1, 10, 11_000_000));
        cache.set_reader_mux(mux(1, 10, 11_000_000));
        cache.set_reader_mux(mux(1, 11, 12_000_000));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.reader_mux().unwrap().mux.common().ts_id, 11);
        assert!(cache.get(1, 10).unwrap().seen_in_nit);
        assert!(!cache.get(1, 10).unwrap().is_reader_mux);
    }

    #[test]
    fn test_upsert_replaces_description() {
        let mut cache = MuxCache::default();
        cache.add_from_nit(mux(7, 99, 10_714_000));
        cache.upsert(7, 99, mux(7, 99, 10_715_000)).seen_in_sdt = true;
        let d = cache.get(7, 99).unwrap();
        assert_eq!(d.mux.frequency(), 10_715_000);
        assert!(d.seen_in_nit && d.seen_in_sdt);
        assert!(!cache.sdt_completed(7, 99));
    }
}
