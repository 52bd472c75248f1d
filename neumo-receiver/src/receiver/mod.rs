//! Receiver: subscriptions, scans and notification dispatch.
//!
//! The receiver owns one [`TunerThread`] per adapter and talks to them only
//! through their task queues. Adapter events come back over a channel and are
//! handled by [`Receiver::handle_event`], either from [`Receiver::run`] or by
//! a caller driving [`Receiver::next_event`] itself.

pub mod scan;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use neumo_protocol::{AnyMux, Notification, ScanResult, Subscriber, SubscriberHandle};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::TuningConfig;
use crate::database::{DatabaseError, DatabaseHandle};
use crate::engine::AdapterView;
use crate::tuner::adapter::{AdapterEvent, AdapterState};
use crate::tuner::tuner_thread::{TunerEvent, TunerThread, TunerThreadError};
use crate::tuner::{
    ActiveAdapter, Reservation, ReservationError, TuneOptions, TuneState, TunerHandle,
    TunerReservations,
};

use scan::{abandon_mux, finish_mux, mark_pending, ScanJob, ScanStats};

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Reservation failed: {0}")]
    Reservation(#[from] ReservationError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Tuner(#[from] TunerThreadError),

    #[error("Tune on adapter {adapter_no} failed: {state:?}")]
    TuneFailed { adapter_no: u32, state: TuneState },

    #[error("No subscription {0}")]
    UnknownSubscription(u64),

    #[error("Failed to start tuner thread: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ReceiverError>;

/// Fans notifications out to every registered subscriber.
#[derive(Default)]
pub struct NotificationHub {
    subscribers: RwLock<Vec<(u64, SubscriberHandle)>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn add(&self, subscriber: SubscriberHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers.write().push((id, subscriber));
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(i, _)| *i != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Subscriber for NotificationHub {
    fn notify(&self, notification: &Notification) {
        for (_, s) in self.subscribers.read().iter() {
            s.notify(notification);
        }
    }
}

struct TunerEntry {
    thread: TunerThread,
    view: Arc<AdapterState>,
}

struct Subscription {
    reservation: Reservation,
    mux: AnyMux,
}

pub struct Receiver {
    db: DatabaseHandle,
    tuning: TuningConfig,
    tuners: Vec<TunerEntry>,
    reservations: TunerReservations,
    hub: Arc<NotificationHub>,
    subscriptions: HashMap<u64, Subscription>,
    next_subscription: u64,
    scans: Vec<ScanJob>,
    events: mpsc::UnboundedReceiver<TunerEvent>,
}

impl Receiver {
    /// Start a tuner thread for every adapter.
    pub fn new(db: DatabaseHandle, tuning: TuningConfig, adapters: Vec<ActiveAdapter>) -> Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let hub = Arc::new(NotificationHub::default());
        let tick = Duration::from_millis(tuning.tick_ms.max(1));
        let mut tuners = Vec::with_capacity(adapters.len());
        for mut adapter in adapters {
            adapter.set_notifier(hub.clone());
            let view = adapter.view().clone();
            let thread = TunerThread::spawn(adapter, tx.clone(), tick)?;
            info!("[Receiver] adapter {} ready", view.adapter_no());
            tuners.push(TunerEntry { thread, view });
        }
        let reservations = TunerReservations::new(tuners.iter().map(|t| t.view.adapter_no()));
        Ok(Self {
            db,
            tuning,
            tuners,
            reservations,
            hub,
            subscriptions: HashMap::new(),
            next_subscription: 0,
            scans: Vec::new(),
            events,
        })
    }

    pub fn db(&self) -> &DatabaseHandle {
        &self.db
    }

    pub fn reservations(&self) -> &TunerReservations {
        &self.reservations
    }

    pub fn add_subscriber(&self, subscriber: SubscriberHandle) -> u64 {
        self.hub.add(subscriber)
    }

    pub fn remove_subscriber(&self, id: u64) -> bool {
        self.hub.remove(id)
    }

    fn tuner(&self, adapter_no: u32) -> Option<&TunerEntry> {
        self.tuners.iter().find(|t| t.view.adapter_no() == adapter_no)
    }

    fn handle(&self, adapter_no: u32) -> Result<TunerHandle> {
        self.tuner(adapter_no)
            .map(|t| t.thread.handle())
            .ok_or(ReceiverError::Reservation(ReservationError::UnknownAdapter(adapter_no)))
    }

    fn can_tune(&self, adapter_no: u32, mux: &AnyMux) -> bool {
        self.tuner(adapter_no).map_or(false, |t| t.view.can_be_tuned(mux))
    }

    /// Watch `mux`. Joins an adapter already tuned to it, or tunes a free one.
    pub async fn subscribe_mux(&mut self, mux: AnyMux, options: TuneOptions) -> Result<u64> {
        let reservation = self.reservations.reserve_for(&mux, |a| self.can_tune(a, &mux))?;
        let adapter_no = reservation.adapter_no();
        let reservation = if reservation.is_exclusive() {
            reservation.set_mux(Some(mux.clone()));
            let handle = self.handle(adapter_no)?;
            let reply = handle.tune(mux.clone(), options, None)?;
            let state = reply
                .await
                .map_err(|_| TunerThreadError::Stopped(adapter_no))?;
            // TuneInit: cancelled or superseded before the tune command went out
            if matches!(state, TuneState::TuneFailed | TuneState::TuneFailedTemp | TuneState::TuneInit) {
                reservation.set_mux(None);
                let _ = handle.end_tune();
                drop(reservation);
                self.dispatch_scans();
                return Err(ReceiverError::TuneFailed { adapter_no, state });
            }
            reservation.downgrade(mux.clone())
        } else {
            debug!("[Receiver] sharing adapter {} for {}", adapter_no, mux);
            reservation
        };
        self.next_subscription += 1;
        let id = self.next_subscription;
        info!("[Receiver] subscription {} on adapter {}: {}", id, adapter_no, mux);
        self.subscriptions.insert(id, Subscription { reservation, mux });
        Ok(id)
    }

    /// Drop a subscription. The last user of an adapter ends its tune.
    pub fn unsubscribe(&mut self, id: u64) -> Result<()> {
        let sub = self
            .subscriptions
            .remove(&id)
            .ok_or(ReceiverError::UnknownSubscription(id))?;
        let adapter_no = sub.reservation.adapter_no();
        let last = self.reservations.shared_count(adapter_no) <= 1;
        if last {
            // the abort is queued before the reservation goes
            let handle = self.handle(adapter_no)?;
            handle.cancel_tune();
            handle.end_tune()?;
        }
        drop(sub.reservation);
        if last {
            self.reservations.forget_mux(adapter_no);
        }
        info!("[Receiver] subscription {} ended ({})", id, sub.mux);
        // scans blocked by this subscription may go on now
        self.dispatch_scans();
        Ok(())
    }

    /// Scan `muxes`; returns the scan id.
    pub fn start_scan(&mut self, muxes: &[AnyMux], options: TuneOptions) -> Result<i32> {
        let scan_id = self.db.lock().new_scan_id()?;
        let marked = mark_pending(&self.db, muxes, scan_id)?;
        info!("[Receiver] scan {} of {} muxes", scan_id, marked.len());
        self.scans.push(ScanJob::new(scan_id, marked, options));
        self.dispatch_scans();
        Ok(scan_id)
    }

    pub fn scan_stats(&self, scan_id: i32) -> Option<ScanStats> {
        self.scans.iter().find(|j| j.scan_id == scan_id).map(|j| j.stats)
    }

    pub fn is_scanning(&self) -> bool {
        !self.scans.is_empty()
    }

    fn active_scans(&self) -> usize {
        self.scans.iter().map(|j| j.active_len()).sum()
    }

    /// Hand pending muxes to idle adapters.
    fn dispatch_scans(&mut self) {
        let limit = self.tuning.max_concurrent_scans.max(1);
        let mut index = 0;
        while index < self.scans.len() {
            if let Err(e) = self.scans[index].refill(&self.db) {
                warn!("[Receiver] scan {}: {}", self.scans[index].scan_id, e);
            }
            let mut blocked = Vec::new();
            while self.active_scans() < limit {
                let Some(mux) = self.scans[index].pop_pending() else {
                    break;
                };
                let usable: Vec<u32> = self
                    .tuners
                    .iter()
                    .filter(|t| t.view.can_be_tuned(&mux))
                    .map(|t| t.view.adapter_no())
                    .collect();
                if usable.is_empty() {
                    warn!("[Receiver] no adapter can tune {}", mux);
                    if let Err(e) = abandon_mux(&self.db, &mux, ScanResult::Bad) {
                        warn!("[Receiver] {}", e);
                    }
                    continue;
                }
                let reservation = usable
                    .iter()
                    .find_map(|&a| self.reservations.try_reserve_exclusive(a).ok());
                let Some(reservation) = reservation else {
                    blocked.push(mux);
                    continue;
                };
                let adapter_no = reservation.adapter_no();
                let job = &mut self.scans[index];
                match self.tuners.iter().find(|t| t.view.adapter_no() == adapter_no) {
                    Some(t) => {
                        reservation.set_mux(Some(mux.clone()));
                        let handle = t.thread.handle();
                        let options = job.options.clone();
                        let scan_id = job.scan_id;
                        let tune = mux.clone();
                        match handle.request_tune(tune, options, Some(scan_id)) {
                            Ok(()) => job.start(adapter_no, mux, reservation),
                            Err(e) => {
                                error!("[Receiver] {}", e);
                                blocked.push(mux);
                            }
                        }
                    }
                    None => blocked.push(mux),
                }
            }
            // muxes waiting for a busy adapter keep their place
            for mux in blocked.into_iter().rev() {
                self.scans[index].push_front(mux);
            }
            if self.scans[index].is_finished() {
                let job = self.scans.remove(index);
                info!(
                    "[Receiver] scan {} done: {} muxes, {} locked, {} failed, {} retried",
                    job.scan_id, job.stats.finished, job.stats.locked, job.stats.failed, job.stats.retried
                );
            } else {
                index += 1;
            }
        }
    }

    /// Process one adapter event.
    pub fn handle_event(&mut self, event: TunerEvent) {
        match event.event {
            AdapterEvent::Notification(n) => self.hub.notify(&n),
            AdapterEvent::ScanMuxEnd { report, retry } => {
                let Some(job) = self.scans.iter_mut().find(|j| j.scan_id == report.scan_id) else {
                    debug!("[Receiver] end of unknown scan {}", report.scan_id);
                    return;
                };
                let Some(active) = job.take_active(event.adapter_no) else {
                    debug!("[Receiver] adapter {} was not scanning", event.adapter_no);
                    return;
                };
                let requeued = retry
                    && match job.requeue(&self.db, active.mux.clone()) {
                        Ok(requeued) => requeued,
                        Err(e) => {
                            warn!("[Receiver] retry of {}: {}", active.mux, e);
                            false
                        }
                    };
                if !requeued {
                    job.record(&report);
                    let secs = active.started.elapsed().as_secs().min(u32::MAX as u64) as u32;
                    if let Err(e) = finish_mux(&self.db, &active.mux, &report, secs) {
                        warn!("[Receiver] storing scan result of {}: {}", active.mux, e);
                    }
                }
                drop(active.reservation);
                self.reservations.forget_mux(event.adapter_no);
                self.hub.notify(&Notification::ScanMuxEnd(report));
                self.dispatch_scans();
            }
        }
    }

    pub async fn next_event(&mut self) -> Option<TunerEvent> {
        self.events.recv().await
    }

    /// Handle events until `shutdown` resolves.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = &mut shutdown => break,
            }
        }
    }

    /// Stop all tuner threads.
    pub fn shutdown(mut self) {
        self.subscriptions.clear();
        self.scans.clear();
        for t in self.tuners.drain(..) {
            t.thread.join();
        }
        info!("[Receiver] stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::config::{SecTiming, SiPolicy};
    use crate::database::{prelude::*, Database};
    use crate::engine::test_util::tuned_mux;
    use crate::tuner::adapter::ReaderFactory;
    use crate::tuner::frontend::testing::RecordingFrontend;
    use crate::tuner::monitor::{poll_once, snapshot_channel, SnapshotWriter};
    use crate::tuner::stream::{MemoryReader, StreamReader};
    use neumo_protocol::{Lnb, LnbConnection, LnbKey, LnbNetwork, LnbType, ScanStatus};

    struct Harness {
        receiver: Receiver,
        fe: Arc<RecordingFrontend>,
        writer: SnapshotWriter,
        seen: Arc<Mutex<Vec<Notification>>>,
    }

    fn lnb() -> Lnb {
        Lnb {
            k: LnbKey {
                dish_id: 0,
                lnb_id: 1,
                lnb_type: LnbType::Universal,
            },
            networks: vec![LnbNetwork {
                sat_pos: 1920,
                usals_pos: 1920,
                diseqc12: -1,
                enabled: true,
            }],
            connections: vec![LnbConnection {
                card_mac_address: 1,
                diseqc_10: -1,
                diseqc_11: -1,
                enabled: true,
                ..Default::default()
            }],
            enabled: true,
            ..Default::default()
        }
    }

    fn harness(tuning: TuningConfig) -> Harness {
        let db = Database::open_in_memory().unwrap().into_handle();
        let fe = Arc::new(RecordingFrontend::new());
        let (writer, reader) = snapshot_channel();
        let view = Arc::new(AdapterState::new(0, 1, 30, reader));
        view.set_lnbs(vec![lnb()]);
        let factory: ReaderFactory = Box::new(|mux, options| {
            Ok(Box::new(MemoryReader::new(mux.clone(), options.clone())) as Box<dyn StreamReader>)
        });
        let adapter = ActiveAdapter::new(
            view,
            fe.clone(),
            db.clone(),
            SiPolicy::default(),
            SecTiming::immediate(),
            tuning.clone(),
            factory,
        );
        let receiver = Receiver::new(db, tuning, vec![adapter]).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        receiver.add_subscriber(Arc::new(move |n: &Notification| sink.lock().push(n.clone())));
        Harness {
            receiver,
            fe,
            writer,
            seen,
        }
    }

    async fn wait_for_scan_end(receiver: &mut Receiver) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), receiver.next_event())
                .await
                .unwrap()
                .unwrap();
            let end = matches!(event.event, AdapterEvent::ScanMuxEnd { .. });
            receiver.handle_event(event);
            if end {
                break;
            }
        }
    }

    #[test]
    fn test_hub_fans_out() {
        let hub = NotificationHub::default();
        let count = Arc::new(AtomicU64::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        let a = hub.add(Arc::new(move |_: &Notification| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        hub.add(Arc::new(move |_: &Notification| {
            c2.fetch_add(1, Ordering::SeqCst);
        }));
        let n = Notification::SpectrumAcquired(Default::default());
        hub.notify(&n);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(hub.remove(a));
        assert!(!hub.remove(a));
        hub.notify(&n);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_subscriptions_share_adapter() {
        let mut h = harness(TuningConfig::default());
        let first = h
            .receiver
            .subscribe_mux(tuned_mux(), TuneOptions::default())
            .await
            .unwrap();
        assert_eq!(h.receiver.reservations().shared_count(0), 1);
        let second = h
            .receiver
            .subscribe_mux(tuned_mux(), TuneOptions::default())
            .await
            .unwrap();
        assert_eq!(h.receiver.reservations().shared_count(0), 2);

        let mut other = tuned_mux();
        other.set_frequency(12_188_000);
        let err = h
            .receiver
            .subscribe_mux(other, TuneOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReceiverError::Reservation(ReservationError::NoFreeAdapter)
        ));

        let extra = h.receiver.add_subscriber(Arc::new(|_: &Notification| {}));
        assert!(h.receiver.remove_subscriber(extra));
        assert!(!h.receiver.remove_subscriber(extra));

        h.receiver.unsubscribe(first).unwrap();
        assert_eq!(h.receiver.reservations().current_mux(0), Some(tuned_mux()));
        h.receiver.unsubscribe(second).unwrap();
        assert!(!h.receiver.reservations().is_reserved(0));
        assert_eq!(h.receiver.reservations().current_mux(0), None);
        assert!(matches!(
            h.receiver.unsubscribe(second),
            Err(ReceiverError::UnknownSubscription(_))
        ));
        h.receiver.shutdown();
    }

    #[tokio::test]
    async fn test_scan_of_unlocked_mux() {
        let tuning = TuningConfig {
            lock_timeout_ms: 10,
            ..TuningConfig::default()
        };
        let mut h = harness(tuning);
        let scan_id = h.receiver.start_scan(&[tuned_mux()], TuneOptions::default()).unwrap();
        assert!(h.receiver.is_scanning());
        assert_eq!(h.receiver.reservations().idle_adapters(), Vec::<u32>::new());
        assert_eq!(h.receiver.scan_stats(scan_id), Some(ScanStats::default()));

        // the monitor reports no lock
        h.fe.set_locked(false);
        let fe: crate::tuner::frontend::FrontendHandle = h.fe.clone();
        poll_once(&fe, &h.writer).unwrap();

        wait_for_scan_end(&mut h.receiver).await;
        assert!(!h.receiver.is_scanning());
        assert_eq!(h.receiver.reservations().idle_adapters(), vec![0]);

        {
            let mut db = h.receiver.db().lock();
            let txn = db.read_txn().unwrap();
            let muxes = txn.muxes_on_sat(1920).unwrap();
            assert_eq!(muxes.len(), 1);
            assert_eq!(muxes[0].common().scan_status, ScanStatus::Idle);
            assert_eq!(muxes[0].common().scan_result, ScanResult::NoLock);
        }
        let seen = h.seen.lock().clone();
        assert!(seen.iter().any(|n| matches!(
            n,
            Notification::ScanMuxEnd(r) if r.scan_id == scan_id && r.scan_result == ScanResult::NoLock
        )));
        h.receiver.shutdown();
    }

    #[tokio::test]
    async fn test_scan_resumes_when_subscription_ends() {
        let tuning = TuningConfig {
            lock_timeout_ms: 10,
            ..TuningConfig::default()
        };
        let mut h = harness(tuning);
        let sub = h
            .receiver
            .subscribe_mux(tuned_mux(), TuneOptions::default())
            .await
            .unwrap();

        let mut other = tuned_mux();
        other.set_frequency(12_188_000);
        let scan_id = h.receiver.start_scan(&[other], TuneOptions::default()).unwrap();
        // the only adapter is taken
        assert!(h.receiver.is_scanning());
        assert_eq!(h.receiver.scan_stats(scan_id), Some(ScanStats::default()));

        h.receiver.unsubscribe(sub).unwrap();
        assert_eq!(h.receiver.reservations().idle_adapters(), Vec::<u32>::new());
        h.fe.set_locked(false);
        let fe: crate::tuner::frontend::FrontendHandle = h.fe.clone();
        poll_once(&fe, &h.writer).unwrap();

        wait_for_scan_end(&mut h.receiver).await;
        assert!(!h.receiver.is_scanning());
        assert_eq!(h.receiver.reservations().idle_adapters(), vec![0]);
        let seen = h.seen.lock().clone();
        assert!(seen.iter().any(|n| matches!(
            n,
            Notification::ScanMuxEnd(r) if r.scan_id == scan_id && r.mux.frequency() == 12_188_000
        )));
        h.receiver.shutdown();
    }

    #[tokio::test]
    async fn test_scan_without_usable_adapter() {
        let mut h = harness(TuningConfig::default());
        let mut far = tuned_mux();
        far.key_mut().sat_pos = -3000;
        h.receiver.start_scan(&[far], TuneOptions::default()).unwrap();
        assert!(!h.receiver.is_scanning());
        let mut db = h.receiver.db().lock();
        let txn = db.read_txn().unwrap();
        let muxes = txn.muxes_on_sat(-3000).unwrap();
        assert_eq!(muxes[0].common().scan_result, ScanResult::Bad);
        drop(txn);
        drop(db);
        h.receiver.shutdown();
    }
}
