//! PAT processing: stream stability and PMT registration.

use std::time::Instant;

use log::{debug, info, warn};
use neumo_protocol::ConfirmedBy;

use super::{ActiveSiStream, ParserKind, PatUpdate, SectionAction, SiTable, SubtableInfo};
use crate::si::PatSection;

impl ActiveSiStream {
    pub fn on_pat_section(
        &mut self,
        pat: &PatSection,
        info: &SubtableInfo,
        now: Instant,
    ) -> SectionAction {
        self.scan_state.set_active(SiTable::Pat, now);
        match self.pat_data.add_section(pat.ts_id, info, &pat.entries, now) {
            PatUpdate::Incomplete => SectionAction::NoReset,
            PatUpdate::Changed => {
                warn!(
                    "[SiStream] adapter {} PAT ts_id={} changed between reads",
                    self.view.adapter_no(),
                    pat.ts_id
                );
                self.pat_data.reset();
                self.withdraw_si_decisions();
                SectionAction::Abort
            }
            PatUpdate::Completed { first, became_stable } => {
                if first {
                    debug!(
                        "[SiStream] PAT ts_id={} version {} with {} services",
                        pat.ts_id,
                        info.version_number,
                        self.pat_data.entries().len()
                    );
                }
                if became_stable {
                    self.on_pat_stable(pat.ts_id, now);
                }
                SectionAction::NoReset
            }
        }
    }

    fn on_pat_stable(&mut self, ts_id: u16, now: Instant) {
        info!(
            "[SiStream] adapter {} PAT ts_id={} stable",
            self.view.adapter_no(),
            ts_id
        );
        self.scan_state.set_completed(SiTable::Pat, now);
        self.confirmation.confirm_ts_id(ConfirmedBy::Pat);

        // one registration per service; programs may share a PMT pid
        let pmt_pids: Vec<u16> = self.pat_data.entries().iter().map(|e| e.pmt_pid).collect();
        for pid in pmt_pids {
            self.registry.register(pid, ParserKind::Pmt);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::test_util::*;
    use crate::engine::SiControl;
    use crate::si::{table_id, PatEntry};

    fn pat(ts_id: u16, services: &[(u16, u16)]) -> PatSection {
        PatSection {
            ts_id,
            entries: services
                .iter()
                .map(|&(service_id, pmt_pid)| PatEntry { service_id, pmt_pid })
                .collect(),
            nit_pid: Some(0x10),
        }
    }

    #[test]
    fn test_pat_becomes_stable_after_hold_time() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        let p = pat(1051, &[(101, 0x100), (102, 0x200)]);
        let i = info(table_id::PAT, 3);

        assert_eq!(s.on_pat_section(&p, &i, t0), SectionAction::NoReset);
        assert!(!s.pat_data().stable_pat());
        s.on_pat_section(&p, &i, t0 + Duration::from_secs(2));
        assert!(!s.pat_data().stable_pat());
        assert!(!s.registry().contains(0x100));

        s.on_pat_section(&p, &i, t0 + Duration::from_secs(5));
        assert!(s.pat_data().stable_pat());
        assert!(s.scan_state().is_completed(SiTable::Pat));
        assert_eq!(s.confirmation().ts_id_by, ConfirmedBy::Pat);
        assert!(s.registry().contains(0x100));
        assert!(s.registry().contains(0x200));
    }

    #[test]
    fn test_changed_pat_aborts() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        let i = info(table_id::PAT, 0);

        let first = pat(1051, &[(101, 0x100), (102, 0x200)]);
        assert_eq!(s.on_pat_section(&first, &i, t0), SectionAction::NoReset);
        let second = pat(1051, &[(101, 0x100), (103, 0x300)]);
        assert_eq!(
            s.on_pat_section(&second, &i, t0 + Duration::from_secs(1)),
            SectionAction::Abort
        );
        assert!(!s.pat_data().stable_pat());
        assert_eq!(s.pat_data().ts_id(), None);
    }

    #[test]
    fn test_shared_pmt_pid_is_refcounted() {
        let db = memory_db();
        let mut s = stream(&db);
        let t0 = Instant::now();
        s.activate(&tuned_mux(), None, t0);
        make_pat_stable(&mut s, &pat(1051, &[(101, 0x100), (102, 0x100)]), t0);
        assert_eq!(s.registry().use_count(0x100), 2);
    }
}
