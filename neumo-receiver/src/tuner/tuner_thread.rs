//! Tuner thread: the run loop that owns one [`ActiveAdapter`].
//!
//! Other threads never touch the adapter. They post [`TunerTask`]s, small
//! closures which run on the tuner thread between SI batches. Tunes and
//! spectrum sweeps are queued by a task and started by the loop itself. One
//! that must wait for the positioner stays pending in the adapter while the
//! loop keeps serving tasks; its reply goes out once a tick finished it.
//!
//! Every request takes a [`CancelFlag`] ticket when it is made, so
//! [`TunerHandle::cancel_tune`] also aborts requests still in the queue.

use std::collections::VecDeque;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use neumo_protocol::{AnyMux, Band, Polarisation, SatPos, SpectrumRecord};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::adapter::{ActiveAdapter, AdapterEvent, TuneState};
use super::sequencer::CancelFlag;
use super::{FailureClass, TuneOptions};

/// A closure run on the tuner thread.
pub type TunerTask = Box<dyn FnOnce(&mut TunerContext) + Send>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TunerThreadError {
    #[error("Tuner thread of adapter {0} has stopped")]
    Stopped(u32),
}

/// Event of one adapter, as seen by the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct TunerEvent {
    pub adapter_no: u32,
    pub event: AdapterEvent,
}

type SpectrumReply = oneshot::Sender<Result<SpectrumRecord, FailureClass>>;

enum Work {
    Tune {
        mux: AnyMux,
        options: TuneOptions,
        scan_id: Option<i32>,
        ticket: u64,
        reply: Option<oneshot::Sender<TuneState>>,
    },
    Spectrum {
        sat_pos: SatPos,
        pol: Polarisation,
        band: Band,
        options: TuneOptions,
        ticket: u64,
        reply: SpectrumReply,
    },
}

/// What a [`TunerTask`] gets to work with.
pub struct TunerContext {
    pub adapter: ActiveAdapter,
    work: VecDeque<Work>,
    /// Reply of a tune still waiting for the positioner.
    tune_reply: Option<oneshot::Sender<TuneState>>,
    spectrum_reply: Option<SpectrumReply>,
    stop: bool,
}

impl TunerContext {
    fn new(adapter: ActiveAdapter) -> Self {
        Self {
            adapter,
            work: VecDeque::new(),
            tune_reply: None,
            spectrum_reply: None,
            stop: false,
        }
    }

    /// Queue a tune. A later request replaces an earlier one not yet started.
    pub fn request_tune(
        &mut self,
        mux: AnyMux,
        options: TuneOptions,
        scan_id: Option<i32>,
        ticket: u64,
        reply: Option<oneshot::Sender<TuneState>>,
    ) {
        let mut replaced = Vec::new();
        self.work.retain_mut(|w| match w {
            Work::Tune { reply, .. } => {
                replaced.extend(reply.take());
                false
            }
            Work::Spectrum { .. } => true,
        });
        for reply in replaced {
            let _ = reply.send(TuneState::TuneInit);
        }
        self.work.push_back(Work::Tune {
            mux,
            options,
            scan_id,
            ticket,
            reply,
        });
    }

    pub fn request_spectrum(
        &mut self,
        sat_pos: SatPos,
        pol: Polarisation,
        band: Band,
        options: TuneOptions,
        ticket: u64,
        reply: SpectrumReply,
    ) {
        self.work.push_back(Work::Spectrum {
            sat_pos,
            pol,
            band,
            options,
            ticket,
            reply,
        });
    }

    async fn start_work(&mut self, work: Work) {
        match work {
            Work::Tune {
                mux,
                options,
                scan_id,
                ticket,
                reply,
            } => {
                if let Some(old) = self.tune_reply.take() {
                    let _ = old.send(TuneState::TuneInit);
                }
                self.adapter.tune_ticket(mux, options, scan_id, ticket).await;
                self.tune_reply = reply;
            }
            Work::Spectrum {
                sat_pos,
                pol,
                band,
                options,
                ticket,
                reply,
            } => {
                if let Some(old) = self.spectrum_reply.take() {
                    let _ = old.send(Err(FailureClass::Cancelled));
                }
                match self
                    .adapter
                    .acquire_spectrum_ticket(sat_pos, pol, band, &options, ticket)
                    .await
                {
                    Ok(Some(record)) => {
                        let _ = reply.send(Ok(record));
                    }
                    Ok(None) => self.spectrum_reply = Some(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e.class()));
                    }
                }
            }
        }
    }

    /// Answer requests the adapter has finished.
    fn deliver_replies(&mut self) {
        if self.adapter.state() != TuneState::TuneRequested {
            if let Some(reply) = self.tune_reply.take() {
                let _ = reply.send(self.adapter.state());
            }
        }
        if let Some(result) = self.adapter.take_spectrum() {
            if let Some(reply) = self.spectrum_reply.take() {
                let _ = reply.send(result.map_err(|e| e.class()));
            }
        }
    }

    /// Leave the run loop after the current task.
    pub fn stop(&mut self) {
        self.stop = true;
    }
}

/// Sending side of a tuner thread. Cheap to clone.
#[derive(Clone)]
pub struct TunerHandle {
    adapter_no: u32,
    tasks: mpsc::UnboundedSender<TunerTask>,
    cancel: CancelFlag,
}

impl TunerHandle {
    pub fn adapter_no(&self) -> u32 {
        self.adapter_no
    }

    /// Run `f` on the tuner thread.
    pub fn post<F>(&self, f: F) -> Result<(), TunerThreadError>
    where
        F: FnOnce(&mut TunerContext) + Send + 'static,
    {
        self.tasks
            .send(Box::new(f))
            .map_err(|_| TunerThreadError::Stopped(self.adapter_no))
    }

    /// Ask for a tune; the receiver resolves once the tune command was
    /// issued, after any dish move. TuneInit means the request was cancelled
    /// or replaced by a later one.
    pub fn tune(
        &self,
        mux: AnyMux,
        options: TuneOptions,
        scan_id: Option<i32>,
    ) -> Result<oneshot::Receiver<TuneState>, TunerThreadError> {
        let (tx, rx) = oneshot::channel();
        let ticket = self.cancel.issue();
        self.post(move |ctx| ctx.request_tune(mux, options, scan_id, ticket, Some(tx)))?;
        Ok(rx)
    }

    /// Ask for a tune without waiting for its outcome.
    pub fn request_tune(
        &self,
        mux: AnyMux,
        options: TuneOptions,
        scan_id: Option<i32>,
    ) -> Result<(), TunerThreadError> {
        let ticket = self.cancel.issue();
        self.post(move |ctx| ctx.request_tune(mux, options, scan_id, ticket, None))
    }

    pub fn acquire_spectrum(
        &self,
        sat_pos: SatPos,
        pol: Polarisation,
        band: Band,
        options: TuneOptions,
    ) -> Result<oneshot::Receiver<Result<SpectrumRecord, FailureClass>>, TunerThreadError> {
        let (tx, rx) = oneshot::channel();
        let ticket = self.cancel.issue();
        self.post(move |ctx| ctx.request_spectrum(sat_pos, pol, band, options, ticket, tx))?;
        Ok(rx)
    }

    /// End the current tune and store its signal statistics.
    pub fn end_tune(&self) -> Result<(), TunerThreadError> {
        self.post(|ctx| ctx.adapter.end_tune())
    }

    /// Abort the tune or sweep in progress and those still queued. A dish
    /// move is abandoned at the next tick.
    pub fn cancel_tune(&self) {
        self.cancel.cancel();
    }

    pub fn shutdown(&self) -> Result<(), TunerThreadError> {
        self.cancel.cancel();
        self.post(|ctx| ctx.stop())
    }
}

impl std::fmt::Debug for TunerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunerHandle")
            .field("adapter_no", &self.adapter_no)
            .finish()
    }
}

/// A running tuner thread.
pub struct TunerThread {
    handle: TunerHandle,
    join: Option<JoinHandle<()>>,
}

impl TunerThread {
    /// Start the run loop. Events go to `events`; `tick` is the SI batch period.
    pub fn spawn(
        adapter: ActiveAdapter,
        events: mpsc::UnboundedSender<TunerEvent>,
        tick: Duration,
    ) -> io::Result<Self> {
        let adapter_no = adapter.adapter_no();
        let cancel = adapter.cancel_flag();
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let join = thread::Builder::new()
            .name(format!("tuner-{adapter_no}"))
            .spawn(move || {
                runtime.block_on(run(TunerContext::new(adapter), rx, events, tick));
            })?;
        Ok(Self {
            handle: TunerHandle {
                adapter_no,
                tasks: tx,
                cancel,
            },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> TunerHandle {
        self.handle.clone()
    }

    /// Stop the loop and wait for the thread to end.
    pub fn join(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let _ = self.handle.shutdown();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("[TunerThread] adapter {} panicked", self.handle.adapter_no);
            }
        }
    }
}

impl Drop for TunerThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn forward(events: &mpsc::UnboundedSender<TunerEvent>, adapter_no: u32, list: Vec<AdapterEvent>) {
    for event in list {
        // the receiver may already be gone at shutdown
        let _ = events.send(TunerEvent { adapter_no, event });
    }
}

async fn run(
    mut ctx: TunerContext,
    mut tasks: mpsc::UnboundedReceiver<TunerTask>,
    events: mpsc::UnboundedSender<TunerEvent>,
    tick: Duration,
) {
    let adapter_no = ctx.adapter.adapter_no();
    info!("[TunerThread] adapter {} running", adapter_no);
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !ctx.stop {
        tokio::select! {
            task = tasks.recv() => match task {
                Some(task) => task(&mut ctx),
                None => break,
            },
            _ = ticker.tick() => {
                let list = ctx.adapter.tick(Instant::now()).await;
                forward(&events, adapter_no, list);
            }
        }
        ctx.deliver_replies();
        while let Some(work) = ctx.work.pop_front() {
            if ctx.stop {
                break;
            }
            ctx.start_work(work).await;
            ctx.deliver_replies();
            let list = ctx.adapter.take_events();
            forward(&events, adapter_no, list);
        }
    }

    ctx.adapter.release();
    debug!("[TunerThread] adapter {} stopped", adapter_no);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{SecTiming, SiPolicy, TuningConfig};
    use crate::database::Database;
    use crate::engine::test_util::tuned_mux;
    use crate::tuner::adapter::{AdapterState, ReaderFactory};
    use crate::tuner::frontend::testing::{FeCommand, RecordingFrontend};
    use crate::tuner::monitor::{poll_once, snapshot_channel};
    use crate::tuner::stream::{MemoryReader, StreamReader};
    use neumo_protocol::{Lnb, LnbConnection, LnbKey, LnbNetwork, LnbType, Notification, RotorControl};

    fn adapter(fe: &Arc<RecordingFrontend>) -> (ActiveAdapter, crate::tuner::monitor::SnapshotWriter) {
        adapter_with(fe, fixed_lnb(), SecTiming::immediate())
    }

    fn fixed_lnb() -> Lnb {
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

    /// USALS dish pointing at 19.2E that can turn to 28.2E.
    fn rotor_lnb() -> Lnb {
        let mut lnb = fixed_lnb();
        lnb.usals_pos = 1920;
        lnb.networks.push(LnbNetwork {
            sat_pos: 2820,
            usals_pos: 2820,
            diseqc12: -1,
            enabled: true,
        });
        lnb.connections[0].rotor_control = RotorControl::MasterUsals;
        lnb.connections[0].tune_string = "X".into();
        lnb
    }

    fn adapter_with(
        fe: &Arc<RecordingFrontend>,
        lnb: Lnb,
        timing: SecTiming,
    ) -> (ActiveAdapter, crate::tuner::monitor::SnapshotWriter) {
        let (writer, reader) = snapshot_channel();
        let view = Arc::new(AdapterState::new(3, 1, 30, reader));
        view.set_lnbs(vec![lnb]);
        let factory: ReaderFactory = Box::new(|mux, options| {
            Ok(Box::new(MemoryReader::new(mux.clone(), options.clone())) as Box<dyn StreamReader>)
        });
        let adapter = ActiveAdapter::new(
            view,
            fe.clone(),
            Database::open_in_memory().unwrap().into_handle(),
            SiPolicy::default(),
            timing,
            TuningConfig::default(),
            factory,
        );
        (adapter, writer)
    }

    #[tokio::test]
    async fn test_tasks_run_on_tuner_thread() {
        let fe = Arc::new(RecordingFrontend::new());
        let (adapter, writer) = adapter(&fe);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let thread = TunerThread::spawn(adapter, events_tx, Duration::from_millis(5)).unwrap();
        let handle = thread.handle();
        assert_eq!(handle.adapter_no(), 3);

        let state = handle
            .tune(tuned_mux(), TuneOptions::default(), None)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(state, TuneState::WaitingForLock);

        let (tx, rx) = oneshot::channel();
        handle
            .post(move |ctx| {
                let _ = tx.send((ctx.adapter.state(), ctx.adapter.current_mux().cloned()));
            })
            .unwrap();
        let (state, mux) = rx.await.unwrap();
        assert_eq!(state, TuneState::WaitingForLock);
        assert_eq!(mux, Some(tuned_mux()));

        // the monitor publishes a lock; the loop reports signal info
        fe.set_locked(true);
        let fe_handle: crate::tuner::frontend::FrontendHandle = fe.clone();
        poll_once(&fe_handle, &writer).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.adapter_no, 3);
        assert!(matches!(
            event.event,
            AdapterEvent::Notification(Notification::SignalInfo(_))
        ));

        thread.join();
        assert!(handle.end_tune().is_err());
        assert!(fe.commands().contains(&FeCommand::Stop));
    }

    #[tokio::test]
    async fn test_later_tune_replaces_queued_one() {
        let fe = Arc::new(RecordingFrontend::new());
        let (adapter, _writer) = adapter(&fe);
        let mut ctx = TunerContext::new(adapter);
        let mut other = tuned_mux();
        other.set_frequency(12_188_000);
        let (first_tx, first_rx) = oneshot::channel();
        ctx.request_tune(tuned_mux(), TuneOptions::default(), None, 1, Some(first_tx));
        ctx.request_tune(other.clone(), TuneOptions::default(), None, 2, None);
        assert_eq!(ctx.work.len(), 1);
        match ctx.work.front() {
            Some(Work::Tune { mux, .. }) => assert_eq!(mux, &other),
            _ => panic!("expected a tune"),
        }
        assert_eq!(first_rx.await.unwrap(), TuneState::TuneInit);
    }

    fn tuned(fe: &RecordingFrontend) -> bool {
        fe.commands()
            .iter()
            .any(|c| matches!(c, FeCommand::SetProperties(p) if p.iter().any(|x| x.0 == crate::tuner::dtv::DTV_TUNE)))
    }

    #[tokio::test]
    async fn test_thread_serves_tasks_while_dish_moves() {
        let fe = Arc::new(RecordingFrontend::new());
        let timing = SecTiming {
            rotor_margin_ms: 60_000,
            ..SecTiming::immediate()
        };
        let (adapter, _writer) = adapter_with(&fe, rotor_lnb(), timing);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let thread = TunerThread::spawn(adapter, events_tx, Duration::from_millis(5)).unwrap();
        let handle = thread.handle();

        let mut mux = tuned_mux();
        mux.key_mut().sat_pos = 2820;
        let mut reply = handle.tune(mux, TuneOptions::default(), None).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let (tx, rx) = oneshot::channel();
        handle
            .post(move |ctx| {
                let _ = tx.send((ctx.adapter.state(), ctx.adapter.is_positioning()));
            })
            .unwrap();
        let (state, positioning) = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, TuneState::TuneRequested);
        assert!(positioning);
        assert!(reply.try_recv().is_err());

        handle.cancel_tune();
        let state = tokio::time::timeout(Duration::from_secs(1), reply)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, TuneState::TuneInit);
        assert!(!tuned(&fe));
        thread.join();
    }

    #[tokio::test]
    async fn test_tune_reply_follows_dish_arrival() {
        let fe = Arc::new(RecordingFrontend::new());
        let timing = SecTiming {
            rotor_speed_centideg_per_s: 90_000,
            rotor_margin_ms: 50,
            ..SecTiming::immediate()
        };
        let (adapter, _writer) = adapter_with(&fe, rotor_lnb(), timing);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let thread = TunerThread::spawn(adapter, events_tx, Duration::from_millis(5)).unwrap();
        let handle = thread.handle();

        let mut mux = tuned_mux();
        mux.key_mut().sat_pos = 2820;
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            handle.tune(mux, TuneOptions::default(), None).unwrap(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(state, TuneState::WaitingForLock);
        assert!(tuned(&fe));
        thread.join();
    }

    #[tokio::test]
    async fn test_cancel_reaches_queued_tune() {
        let fe = Arc::new(RecordingFrontend::new());
        let (adapter, _writer) = adapter(&fe);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let thread = TunerThread::spawn(adapter, events_tx, Duration::from_millis(5)).unwrap();
        let handle = thread.handle();

        // hold the thread so the tune stays queued
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        handle
            .post(move |_| {
                let _ = gate_rx.recv();
            })
            .unwrap();
        let reply = handle.tune(tuned_mux(), TuneOptions::default(), None).unwrap();
        handle.cancel_tune();
        gate_tx.send(()).unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), reply)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, TuneState::TuneInit);
        assert!(fe.commands().is_empty());

        // later requests are not affected
        let state = handle
            .tune(tuned_mux(), TuneOptions::default(), None)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(state, TuneState::WaitingForLock);
        thread.join();
    }
}
