//! Multi-mux scan bookkeeping.
//!
//! A scan owns its muxes through their `scan_status` and `scan_id` in the
//! database:
//!
//! 1. Requested muxes are stored and marked `Pending` with a fresh scan id
//! 2. Idle adapters pick up pending muxes; the adapter marks them `Active`
//! 3. SI may add further muxes (NIT, T2MI) as `Pending` with the same id
//! 4. A temporary tune failure marks the mux `Retry` and queues it once more
//! 5. At the end the mux goes back to `Idle` with its scan result

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};
use neumo_protocol::{AnyMux, MuxKey, MuxPreserve, ScanMuxEndReport, ScanResult, ScanStatus};

use crate::database::{self, prelude::*, DatabaseHandle};
use crate::engine::{unix_now, with_write_txn};
use crate::tuner::{Reservation, TuneOptions};

/// Store `muxes` if they are new and mark them pending for `scan_id`.
pub fn mark_pending(db: &DatabaseHandle, muxes: &[AnyMux], scan_id: i32) -> database::Result<Vec<AnyMux>> {
    with_write_txn(db, |txn| {
        let mut marked = Vec::with_capacity(muxes.len());
        for mux in muxes {
            let key = match txn.find_mux_by_freq(mux)? {
                Some(existing) => *existing.key(),
                None => {
                    let mut new = mux.clone();
                    txn.update_mux(&mut new, MuxPreserve::empty())?;
                    *new.key()
                }
            };
            if let Some(m) = txn.set_mux_scan_status(&key, ScanStatus::Pending, scan_id)? {
                marked.push(m);
            }
        }
        Ok(marked)
    })
}

/// Record the outcome of one scanned mux and release it from the scan.
///
/// SI may have corrected the key of the mux, so the reported mux is looked
/// up first and the requested one second.
pub fn finish_mux(
    db: &DatabaseHandle,
    requested: &AnyMux,
    report: &ScanMuxEndReport,
    duration_secs: u32,
) -> database::Result<Option<AnyMux>> {
    with_write_txn(db, |txn| {
        let mut found = None;
        for key in [report.mux.key(), requested.key()] {
            if let Some(m) = txn.find_mux_by_key(key)? {
                found = Some(m);
                break;
            }
        }
        let Some(mut mux) = found else {
            return Ok(None);
        };
        let common = mux.common_mut();
        common.set_scan_status(ScanStatus::Idle, 0)?;
        common.scan_result = report.scan_result;
        common.scan_lock_result = report.lock_result;
        common.scan_time = unix_now();
        common.scan_duration = duration_secs;
        if report.scan_result != ScanResult::NoLock {
            common.num_services = report.num_services;
        }
        txn.put(&mux)?;
        if mux.key() != requested.key() {
            // the requested record was superseded; do not leave it pending
            if let Some(mut old) = txn.find_mux_by_key(requested.key())? {
                if old.common().scan_status.requires_scan_id() {
                    old.common_mut().set_scan_status(ScanStatus::Idle, 0)?;
                    txn.put(&old)?;
                }
            }
        }
        Ok(Some(mux))
    })
}

/// Give up on a mux which could not be scanned at all.
pub fn abandon_mux(db: &DatabaseHandle, mux: &AnyMux, result: ScanResult) -> database::Result<()> {
    with_write_txn(db, |txn| {
        if let Some(mut m) = txn.find_mux_by_key(mux.key())? {
            m.common_mut().set_scan_status(ScanStatus::Idle, 0)?;
            m.common_mut().scan_result = result;
            m.common_mut().scan_time = unix_now();
            txn.put(&m)?;
        }
        Ok(())
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub finished: u32,
    pub locked: u32,
    pub failed: u32,
    pub retried: u32,
}

/// A mux being scanned on one adapter.
pub struct ActiveScan {
    pub mux: AnyMux,
    pub reservation: Reservation,
    pub started: std::time::Instant,
}

/// One running scan.
pub struct ScanJob {
    pub scan_id: i32,
    pub options: TuneOptions,
    pub stats: ScanStats,
    pending: VecDeque<AnyMux>,
    active: HashMap<u32, ActiveScan>,
    retried: HashSet<MuxKey>,
    /// Everything ever queued, so SI discoveries are queued once.
    seen: HashSet<MuxKey>,
}

impl ScanJob {
    pub fn new(scan_id: i32, muxes: Vec<AnyMux>, mut options: TuneOptions) -> Self {
        options.scan = true;
        let seen = muxes.iter().map(|m| *m.key()).collect();
        Self {
            scan_id,
            options,
            stats: ScanStats::default(),
            pending: muxes.into(),
            active: HashMap::new(),
            retried: HashSet::new(),
            seen,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    pub fn pop_pending(&mut self) -> Option<AnyMux> {
        self.pending.pop_front()
    }

    /// Put a mux back at the front, when no adapter was free.
    pub fn push_front(&mut self, mux: AnyMux) {
        self.pending.push_front(mux);
    }

    pub fn start(&mut self, adapter_no: u32, mux: AnyMux, reservation: Reservation) {
        self.active.insert(
            adapter_no,
            ActiveScan {
                mux,
                reservation,
                started: std::time::Instant::now(),
            },
        );
    }

    pub fn take_active(&mut self, adapter_no: u32) -> Option<ActiveScan> {
        self.active.remove(&adapter_no)
    }

    /// Queue a mux for a second attempt. Only the first temporary failure
    /// of a mux leads to a retry.
    pub fn requeue(&mut self, db: &DatabaseHandle, mux: AnyMux) -> database::Result<bool> {
        if !self.retried.insert(*mux.key()) {
            return Ok(false);
        }
        let key = *mux.key();
        with_write_txn(db, |txn| txn.set_mux_scan_status(&key, ScanStatus::Retry, self.scan_id))?;
        self.stats.retried += 1;
        self.pending.push_back(mux);
        Ok(true)
    }

    /// Queue muxes that SI marked pending for this scan.
    pub fn refill(&mut self, db: &DatabaseHandle) -> database::Result<usize> {
        let found = {
            let mut db = db.lock();
            let txn = db.read_txn()?;
            let pending = txn.muxes_with_scan_status(ScanStatus::Pending)?;
            pending
        };
        let mut added = 0;
        for mux in found {
            if mux.common().scan_id == self.scan_id && self.seen.insert(*mux.key()) {
                debug!("[Receiver] scan {} discovered {}", self.scan_id, mux);
                self.pending.push_back(mux);
                added += 1;
            }
        }
        if added > 0 {
            info!("[Receiver] scan {} added {} muxes found by SI", self.scan_id, added);
        }
        Ok(added)
    }

    pub fn record(&mut self, report: &ScanMuxEndReport) {
        self.stats.finished += 1;
        match report.scan_result {
            ScanResult::Ok | ScanResult::Partial | ScanResult::NoData => self.stats.locked += 1,
            _ => self.stats.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::engine::test_util::tuned_mux;
    use crate::tuner::TunerReservations;
    use neumo_protocol::{ConfirmationSummary, LockResult};

    fn db() -> DatabaseHandle {
        Database::open_in_memory().unwrap().into_handle()
    }

    fn report(scan_id: i32, mux: AnyMux, scan_result: ScanResult) -> ScanMuxEndReport {
        ScanMuxEndReport {
            scan_id,
            mux,
            scan_result,
            lock_result: LockResult::Locked,
            num_services: 12,
            confirmation: ConfirmationSummary::default(),
        }
    }

    #[test]
    fn test_mark_pending_stores_new_muxes() {
        let db = db();
        let marked = mark_pending(&db, &[tuned_mux()], 4).unwrap();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].common().scan_status, ScanStatus::Pending);
        assert_eq!(marked[0].common().scan_id, 4);
        assert_ne!(marked[0].key().mux_id, 0);

        // a second scan reuses the stored record
        let again = mark_pending(&db, &[tuned_mux()], 5).unwrap();
        assert_eq!(again[0].key(), marked[0].key());
        assert_eq!(again[0].common().scan_id, 5);
    }

    #[test]
    fn test_finish_mux_clears_status() {
        let db = db();
        let marked = mark_pending(&db, &[tuned_mux()], 4).unwrap();
        let mux = marked[0].clone();
        let stored = finish_mux(&db, &mux, &report(4, mux.clone(), ScanResult::Ok), 7)
            .unwrap()
            .unwrap();
        assert_eq!(stored.common().scan_status, ScanStatus::Idle);
        assert_eq!(stored.common().scan_id, 0);
        assert_eq!(stored.common().scan_result, ScanResult::Ok);
        assert_eq!(stored.common().scan_lock_result, LockResult::Locked);
        assert_eq!(stored.common().num_services, 12);
        assert_eq!(stored.common().scan_duration, 7);

        let mut db_ = db.lock();
        let txn = db_.read_txn().unwrap();
        assert!(txn.muxes_with_scan_status(ScanStatus::Pending).unwrap().is_empty());
    }

    #[test]
    fn test_abandon_mux() {
        let db = db();
        let mux = mark_pending(&db, &[tuned_mux()], 2).unwrap().remove(0);
        abandon_mux(&db, &mux, ScanResult::Bad).unwrap();
        let mut db_ = db.lock();
        let txn = db_.read_txn().unwrap();
        let stored = txn.find_mux_by_key(mux.key()).unwrap().unwrap();
        assert_eq!(stored.common().scan_status, ScanStatus::Idle);
        assert_eq!(stored.common().scan_result, ScanResult::Bad);
    }

    #[tokio::test]
    async fn test_job_retries_once_and_refills() {
        let db = db();
        let mux = mark_pending(&db, &[tuned_mux()], 9).unwrap().remove(0);
        let mut job = ScanJob::new(9, vec![mux.clone()], TuneOptions::default());
        assert!(job.options.scan);
        assert_eq!(job.pending_len(), 1);

        let res = TunerReservations::new([0]);
        let m = job.pop_pending().unwrap();
        job.start(0, m, res.try_reserve_exclusive(0).unwrap());
        assert!(!job.is_finished());
        let active = job.take_active(0).unwrap();
        drop(active.reservation);

        assert!(job.requeue(&db, mux.clone()).unwrap());
        assert!(!job.requeue(&db, mux.clone()).unwrap());
        assert_eq!(job.pending_len(), 1);
        assert_eq!(job.stats.retried, 1);
        {
            let mut db_ = db.lock();
            let txn = db_.read_txn().unwrap();
            let stored = txn.find_mux_by_key(mux.key()).unwrap().unwrap();
            assert_eq!(stored.common().scan_status, ScanStatus::Retry);
        }

        // a mux discovered by NIT during the scan
        let mut found = tuned_mux();
        found.set_frequency(12_188_000);
        mark_pending(&db, &[found], 9).unwrap();
        assert_eq!(job.refill(&db).unwrap(), 1);
        assert_eq!(job.refill(&db).unwrap(), 0);
        assert_eq!(job.pending_len(), 2);
    }
}
