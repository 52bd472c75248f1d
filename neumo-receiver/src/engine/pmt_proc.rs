//! PMT processing: elementary stream pids and embedded T2MI streams.

use std::time::Instant;

use log::{debug, error, info};
use neumo_protocol::{KeySrc, MuxPreserve, ScanStatus, ServiceKey, TuneSrc};

use super::{unix_now, with_write_txn, ActiveSiStream, SectionAction, SubtableInfo};
use crate::database::prelude::*;
use crate::si::descriptors::T2miDescriptor;
use crate::si::PmtSection;

impl ActiveSiStream {
    pub fn on_pmt_section(
        &mut self,
        pid: u16,
        pmt: &PmtSection,
        _info: &SubtableInfo,
        _now: Instant,
    ) -> SectionAction {
        if !pmt.current_next {
            return SectionAction::NoReset;
        }
        let service_id = pmt.service_id;
        if self.pmt_data.by_service.contains_key(&service_id) {
            return SectionAction::NoReset;
        }
        self.pmt_data.by_service.insert(service_id, pmt.clone());

        if let Some((t2mi_pid, desc)) = pmt.t2mi_stream() {
            self.on_t2mi_stream(t2mi_pid, &desc);
        }
        if self.si_writes_allowed() {
            if let Err(e) = self.update_service_pids(pmt) {
                error!("[SiStream] PMT service {} update failed: {}", service_id, e);
            }
        }
        // the parser goes away once every program on this pid was seen
        self.registry.unregister(pid);
        SectionAction::NoReset
    }

    fn update_service_pids(&self, pmt: &PmtSection) -> crate::database::Result<()> {
        let Some(mux) = self.si_mux.as_ref() else {
            return Ok(());
        };
        let c = mux.common();
        let key = ServiceKey {
            mux: *mux.key(),
            network_id: c.network_id,
            ts_id: c.ts_id,
            service_id: pmt.service_id,
        };
        let pmt_pid = self
            .pat_data
            .entries()
            .iter()
            .find(|e| e.service_id == pmt.service_id)
            .map(|e| e.pmt_pid);
        with_write_txn(&self.db, |txn| {
            let Some(mut service) = txn.find_service(&key)? else {
                return Ok(());
            };
            let old = service.clone();
            if let Some(p) = pmt_pid {
                service.pmt_pid = p;
            }
            service.video_pid = pmt.video_pid().unwrap_or(0);
            service.encrypted |= pmt.is_encrypted();
            if service != old {
                service.mtime = unix_now();
                txn.put_service(&service)?;
            }
            Ok(())
        })
    }

    /// Record the embedded stream announced by a PMT and ask for it to be tuned.
    fn on_t2mi_stream(&mut self, t2mi_pid: u16, desc: &T2miDescriptor) {
        if self.embedded || !self.pmt_data.t2mi_pids.insert(t2mi_pid) {
            return;
        }
        let Some(tuned) = self.tuned.as_ref() else {
            return;
        };
        let mut mux = tuned.clone();
        {
            let k = mux.key_mut();
            k.t2mi_pid = t2mi_pid;
            k.stream_id = desc.t2mi_stream_id as i16;
            k.mux_id = 0;
        }
        {
            let c = mux.common_mut();
            c.network_id = 0;
            c.ts_id = 0;
            c.nit_network_id = 0;
            c.nit_ts_id = 0;
            c.key_src = KeySrc::None;
            c.tune_src = TuneSrc::Auto;
            c.num_services = 0;
            c.scan_status = ScanStatus::Idle;
            c.scan_id = 0;
            c.mtime = unix_now();
        }

        let scan_id = self.scan_id;
        let stored = with_write_txn(&self.db, |txn| {
            let preserve = match scan_id {
                Some(id) => {
                    mux.common_mut().set_scan_status(ScanStatus::Pending, id)?;
                    MuxPreserve::NETWORK_ID_TS_ID
                }
                None => MuxPreserve::NETWORK_ID_TS_ID | MuxPreserve::SCAN_DATA,
            };
            txn.update_mux(&mut mux, preserve)?;
            Ok(mux)
        });
        match stored {
            Ok(mux) => {
                info!(
                    "[SiStream] adapter {} embedded stream {} (plp {})",
                    self.view.adapter_no(),
                    mux,
                    desc.t2mi_stream_id
                );
                if scan_id.is_none() {
                    self.embedded_requests.push(mux);
                } else {
                    debug!("[SiStream] embedded stream queued for scan");
                }
            }
            Err(e) => error!("[SiStream] storing embedded stream failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_util::*;
    use crate::engine::SiControl;
    use crate::si::descriptor_tag;
    use crate::si::{PatEntry, PatSection, PmtStream};
    use neumo_protocol::AnyMux;

    fn t2mi_pmt(service_id: u16) -> PmtSection {
        // extension descriptor: tag 0x7F, length 3, T2MI, stream id 2, one stream
        let descriptors = vec![descriptor_tag::EXTENSION, 3, descriptor_tag::ext::T2MI, 0x02, 0x00];
        PmtSection {
            service_id,
            version_number: 0,
            current_next: true,
            pcr_pid: 0x1FFF,
            program_descriptors: Vec::new(),
            streams: vec![PmtStream {
                stream_type: 0x06,
                pid: 0x1000,
                descriptors,
            }],
        }
    }

    #[test]
    fn test_t2mi_pmt_requests_embedded_stream() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        let pat = PatSection {
            ts_id: 1,
            entries: vec![PatEntry { service_id: 1, pmt_pid: 0x20 }],
            nit_pid: None,
        };
        make_pat_stable(&mut s, &pat, t0);
        assert_eq!(s.registry().use_count(0x20), 1);

        let i = info(crate::si::table_id::PMT, 0);
        assert_eq!(s.on_pmt_section(0x20, &t2mi_pmt(1), &i, t0), SectionAction::NoReset);
        assert!(!s.registry().contains(0x20));

        let requests = s.take_embedded_requests();
        assert_eq!(requests.len(), 1);
        let k = requests[0].key();
        assert_eq!(k.t2mi_pid, 0x1000);
        assert_eq!(k.stream_id, 2);
        assert_ne!(k.mux_id, 0);
        assert!(matches!(requests[0], AnyMux::Dvbs(_)));

        // the same stream is announced only once
        s.on_t2mi_stream(0x1000, &T2miDescriptor {
            t2mi_stream_id: 2,
            num_t2mi_streams: 1,
            pcr_iscr_common_clock: false,
        });
        assert!(s.take_embedded_requests().is_empty());
    }

    #[test]
    fn test_t2mi_during_scan_is_queued_in_database() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), Some(7), t0);
        s.on_t2mi_stream(0x1000, &T2miDescriptor {
            t2mi_stream_id: 0,
            num_t2mi_streams: 1,
            pcr_iscr_common_clock: false,
        });
        assert!(s.take_embedded_requests().is_empty());
        let pending = db
            .lock()
            .read_txn()
            .unwrap()
            .muxes_with_scan_status(ScanStatus::Pending)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].common().scan_id, 7);
    }
}
