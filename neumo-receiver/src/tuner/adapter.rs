//! Tune state machine of one adapter.
//!
//! ```text
//! TuneInit -> TuneRequested -> WaitingForLock -> Locked
//!                  |                 |
//!                  |                 +-> LockTimedout
//!                  +-> TuneFailed | TuneFailedTemp
//! ```
//!
//! A tune that moves the dish stays in TuneRequested until the move time
//! elapsed; [`ActiveAdapter::tick`] then sends the tune command. The tuner
//! thread keeps serving requests meanwhile.
//!
//! Once locked the adapter opens a stream reader and feeds it to its SI
//! stream. An SI abort leads to a retune of the same mux, up to
//! `max_retunes` times. When a tune ends its signal history is stored.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use neumo_protocol::{
    AnyMux, Band, Lnb, LnbConnection, LockResult, Notification, Polarisation, RfPath, SatPos,
    ScanMuxEndReport, ScanResult, ScanStatus, SignalInfo, SignalSample, SignalStat, SignalStatKey,
    SpectrumRecord, SubscriberHandle,
};
use parking_lot::RwLock;

use super::frontend::FrontendHandle;
use super::monitor::SnapshotReader;
use super::sec;
use super::sequencer::{CancelFlag, LnbSetup, LnbTarget, Sequencer, Step, TuneOutcome};
use super::spectrum::{store_spectrum, PeakDetector, ThresholdPeakDetector};
use super::stream::StreamReader;
use super::{FailureClass, TuneError, TuneOptions};
use crate::config::{SecTiming, SiPolicy, TuningConfig};
use crate::database::{prelude::*, DatabaseHandle};
use crate::engine::{unix_now, with_write_txn, ActiveSiStream, AdapterView, BatchOutcome, SiControl};

/// Signal samples kept per tune; older ones are thinned out.
const MAX_SAMPLES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TuneState {
    #[default]
    TuneInit,
    TuneRequested,
    WaitingForLock,
    Locked,
    LockTimedout,
    /// Permanent failure, not retried.
    TuneFailed,
    /// Driver resources were exhausted; the mux may be retried.
    TuneFailedTemp,
}

impl TuneState {
    fn from_failure(class: FailureClass) -> Self {
        match class {
            FailureClass::Permanent => TuneState::TuneFailed,
            FailureClass::Temporary => TuneState::TuneFailedTemp,
            FailureClass::Cancelled => TuneState::TuneInit,
        }
    }
}

/// Opens the transport stream of a locked mux.
pub type ReaderFactory =
    Box<dyn FnMut(&AnyMux, &TuneOptions) -> io::Result<Box<dyn StreamReader>> + Send>;

/// What the SI stream and the receiver may know about an adapter.
pub struct AdapterState {
    adapter_no: u32,
    card_mac_address: i64,
    sat_tolerance: i16,
    lnbs: RwLock<Vec<Lnb>>,
    signal: SnapshotReader,
}

impl AdapterState {
    pub fn new(adapter_no: u32, card_mac_address: i64, sat_tolerance: u16, signal: SnapshotReader) -> Self {
        Self {
            adapter_no,
            card_mac_address,
            sat_tolerance: sat_tolerance.min(i16::MAX as u16) as i16,
            lnbs: RwLock::new(Vec::new()),
            signal,
        }
    }

    pub fn set_lnbs(&self, lnbs: Vec<Lnb>) {
        *self.lnbs.write() = lnbs;
    }

    pub fn card_mac_address(&self) -> i64 {
        self.card_mac_address
    }

    pub fn signal(&self) -> &SnapshotReader {
        &self.signal
    }

    /// LNBs cabled to this card which can receive `mux`, best first.
    fn candidate_lnbs(&self, mux: &AnyMux, current: Option<RfPath>) -> Vec<(Lnb, LnbConnection)> {
        let lnbs = self.lnbs.read();
        let mut found: Vec<(Lnb, LnbConnection)> = lnbs
            .iter()
            .filter(|lnb| sec::lnb_can_tune(lnb, mux, self.sat_tolerance))
            .filter_map(|lnb| {
                sec::connection_for(lnb, self.card_mac_address).map(|c| (lnb.clone(), c.clone()))
            })
            .collect();
        // keep the current path, then avoid moving a dish
        found.sort_by_key(|(lnb, conn)| {
            let same_path = current == Some(sec::rf_path(lnb, conn));
            let moves = conn.rotor_control.is_master()
                && sec::network_for(lnb, mux.key().sat_pos, self.sat_tolerance)
                    .map_or(true, |n| n.usals_pos != 0 && n.usals_pos != lnb.usals_pos);
            (!same_path, moves)
        });
        found
    }

    /// LNB and connection for a spectrum of `sat_pos` and `pol`.
    fn spectrum_lnb(&self, sat_pos: SatPos, pol: Polarisation) -> Option<(Lnb, LnbConnection)> {
        let lnbs = self.lnbs.read();
        lnbs.iter()
            .filter(|lnb| lnb.enabled && sec::can_receive_pol(lnb, pol))
            .filter(|lnb| sec::network_for(lnb, sat_pos, self.sat_tolerance).is_some())
            .find_map(|lnb| sec::connection_for(lnb, self.card_mac_address).map(|c| (lnb.clone(), c.clone())))
    }
}

impl AdapterView for AdapterState {
    fn adapter_no(&self) -> u32 {
        self.adapter_no
    }

    fn can_be_tuned(&self, mux: &AnyMux) -> bool {
        match mux {
            AnyMux::Dvbs(_) => !self.candidate_lnbs(mux, None).is_empty(),
            _ => true,
        }
    }

    fn is_locked(&self) -> bool {
        self.signal.is_locked()
    }
}

/// Something the tuner thread must pass on to the receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Notification(Notification),
    /// The scan of one mux is over. `retry` is set after a temporary failure.
    ScanMuxEnd { report: ScanMuxEndReport, retry: bool },
}

struct CurrentTune {
    mux: AnyMux,
    options: TuneOptions,
    scan_id: Option<i32>,
    lnb: Option<(Lnb, LnbConnection)>,
    rf_path: RfPath,
    start: Instant,
    start_unix: i64,
    /// Monitor generation when the tune command was sent.
    generation: u64,
    /// Cancel ticket of the request.
    ticket: u64,
    lock_time: Option<Duration>,
    samples: Vec<SignalSample>,
    retunes: u32,
    /// Next lock restarts SI with [`SiControl::relisten`].
    relisten: bool,
    /// Scan result decided before SI could finish.
    forced_result: Option<ScanResult>,
    reported: bool,
}

/// Work left to do once the dish arrived.
enum Suspended {
    Tune,
    Spectrum {
        sat_pos: SatPos,
        pol: Polarisation,
        band: Band,
        options: TuneOptions,
    },
}

struct PositionerWait {
    until: Instant,
    setup: LnbSetup,
    work: Suspended,
}

struct EmbeddedSession {
    si: ActiveSiStream,
    reader: Box<dyn StreamReader>,
}

pub struct ActiveAdapter {
    view: Arc<AdapterState>,
    sequencer: Sequencer,
    si: ActiveSiStream,
    db: DatabaseHandle,
    policy: SiPolicy,
    tuning: TuningConfig,
    state: TuneState,
    current: Option<CurrentTune>,
    reader: Option<Box<dyn StreamReader>>,
    reader_factory: ReaderFactory,
    embedded: Vec<EmbeddedSession>,
    detector: Arc<dyn PeakDetector>,
    positioning: Option<PositionerWait>,
    /// Outcome of a spectrum acquisition that waited for the dish.
    spectrum_result: Option<Result<SpectrumRecord, TuneError>>,
    last_generation: u64,
    events: Vec<AdapterEvent>,
}

impl ActiveAdapter {
    pub fn new(
        view: Arc<AdapterState>,
        fe: FrontendHandle,
        db: DatabaseHandle,
        policy: SiPolicy,
        timing: SecTiming,
        tuning: TuningConfig,
        reader_factory: ReaderFactory,
    ) -> Self {
        let sequencer = Sequencer::new(fe, timing, policy.sat_pos_tolerance);
        let si = ActiveSiStream::new(db.clone(), policy.clone(), view.clone());
        Self {
            view,
            sequencer,
            si,
            db,
            policy,
            tuning,
            state: TuneState::TuneInit,
            current: None,
            reader: None,
            reader_factory,
            embedded: Vec::new(),
            detector: Arc::new(ThresholdPeakDetector::default()),
            positioning: None,
            spectrum_result: None,
            last_generation: 0,
            events: Vec::new(),
        }
    }

    pub fn adapter_no(&self) -> u32 {
        self.view.adapter_no
    }

    pub fn state(&self) -> TuneState {
        self.state
    }

    pub fn view(&self) -> &Arc<AdapterState> {
        &self.view
    }

    pub fn current_mux(&self) -> Option<&AnyMux> {
        self.current.as_ref().map(|c| &c.mux)
    }

    pub fn si(&self) -> &ActiveSiStream {
        &self.si
    }

    /// The dish is moving for a tune or a spectrum.
    pub fn is_positioning(&self) -> bool {
        self.positioning.is_some()
    }

    /// Flag that aborts a tune waiting for the positioner.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.sequencer.cancel_flag()
    }

    pub fn set_notifier(&mut self, notifier: SubscriberHandle) {
        self.sequencer.set_notifier(notifier);
    }

    pub fn set_peak_detector(&mut self, detector: Arc<dyn PeakDetector>) {
        self.detector = detector;
    }

    /// Tune `mux`, ending the previous tune first.
    pub async fn tune(&mut self, mux: AnyMux, options: TuneOptions, scan_id: Option<i32>) -> TuneState {
        let ticket = self.cancel_flag().issue();
        self.tune_ticket(mux, options, scan_id, ticket).await
    }

    /// [`ActiveAdapter::tune`] for a request that took its cancel ticket
    /// when it was queued.
    pub async fn tune_ticket(
        &mut self,
        mux: AnyMux,
        options: TuneOptions,
        scan_id: Option<i32>,
        ticket: u64,
    ) -> TuneState {
        self.end_tune();
        let lnb = match &mux {
            AnyMux::Dvbs(_) => self
                .view
                .candidate_lnbs(&mux, self.sequencer.sec_state().rf_path)
                .into_iter()
                .next(),
            _ => None,
        };
        let rf_path = lnb
            .as_ref()
            .map(|(l, c)| sec::rf_path(l, c))
            .unwrap_or_default();
        info!("[Adapter] adapter {} tune {}", self.adapter_no(), mux);

        if let Some(id) = scan_id {
            let key = *mux.key();
            if let Err(e) = with_write_txn(&self.db, |txn| txn.set_mux_scan_status(&key, ScanStatus::Active, id)) {
                warn!("[Adapter] adapter {} scan status: {}", self.adapter_no(), e);
            }
        }

        self.current = Some(CurrentTune {
            mux,
            options,
            scan_id,
            lnb,
            rf_path,
            start: Instant::now(),
            start_unix: unix_now(),
            generation: self.view.signal.generation(),
            ticket,
            lock_time: None,
            samples: Vec::new(),
            retunes: 0,
            relisten: false,
            forced_result: None,
            reported: false,
        });
        self.issue_tune().await
    }

    /// Send the tune command for the current mux, or start the dish move
    /// that has to come first.
    async fn issue_tune(&mut self) -> TuneState {
        let Some(cur) = self.current.as_mut() else {
            return self.state;
        };
        self.state = TuneState::TuneRequested;
        cur.generation = self.view.signal.generation();
        cur.start = Instant::now();
        let target = cur.lnb.as_ref().map(|(lnb, connection)| LnbTarget { lnb, connection });
        let step = self
            .sequencer
            .start_tune(&cur.mux, target, &cur.options, cur.ticket)
            .await;
        match step {
            Ok(Step::Positioning(setup)) => {
                let wait = setup.positioner_wait.unwrap_or_default();
                debug!(
                    "[Adapter] adapter {} tune resumes in {} ms",
                    self.view.adapter_no,
                    wait.as_millis()
                );
                self.positioning = Some(PositionerWait {
                    until: Instant::now() + wait,
                    setup,
                    work: Suspended::Tune,
                });
            }
            Ok(Step::Done(outcome)) => self.on_tune_result(Ok(outcome)),
            Err(e) => self.on_tune_result(Err(e)),
        }
        self.state
    }

    fn on_tune_result(&mut self, result: Result<TuneOutcome, TuneError>) {
        let Some(cur) = self.current.as_mut() else {
            return;
        };
        match result {
            Ok(outcome) => {
                debug!(
                    "[Adapter] adapter {} tuned to {} kHz{}",
                    self.view.adapter_no,
                    outcome.driver_frequency,
                    if outcome.blind { " (blind)" } else { "" }
                );
                self.state = TuneState::WaitingForLock;
            }
            Err(e) => {
                self.state = TuneState::from_failure(e.class());
                if self.state == TuneState::TuneFailed {
                    cur.forced_result = Some(ScanResult::Bad);
                }
                warn!("[Adapter] adapter {} {:?}: {}", self.view.adapter_no, self.state, e);
            }
        }
    }

    /// Finish the work waiting for the dish once it arrived or the request
    /// was cancelled.
    fn resume_positioner(&mut self, now: Instant) {
        let due = match &self.positioning {
            Some(wait) => now >= wait.until || self.sequencer.is_cancelled(),
            None => false,
        };
        if !due {
            return;
        }
        let Some(PositionerWait { setup, work, .. }) = self.positioning.take() else {
            return;
        };
        match work {
            Suspended::Tune => {
                let Some(cur) = self.current.as_mut() else {
                    self.sequencer.abort_positioner();
                    return;
                };
                cur.generation = self.view.signal.generation();
                cur.start = now;
                let result = self.sequencer.finish_tune(&cur.mux, setup, &cur.options);
                self.on_tune_result(result);
            }
            Suspended::Spectrum {
                sat_pos,
                pol,
                band,
                options,
            } => {
                let detector = self.detector.clone();
                let result = self
                    .sequencer
                    .finish_spectrum(sat_pos, pol, band, &options, setup, detector.as_ref())
                    .map(|record| self.spectrum_acquired(record));
                self.spectrum_result = Some(result);
            }
        }
    }

    /// Advance the state machine. Called periodically by the tuner thread.
    pub async fn tick(&mut self, now: Instant) -> Vec<AdapterEvent> {
        self.resume_positioner(now);
        match self.state {
            TuneState::WaitingForLock => self.check_lock(now),
            TuneState::Locked => self.run_si(now).await,
            _ => {}
        }
        self.sample_signal();
        for n in self.si.take_notifications() {
            self.events.push(AdapterEvent::Notification(n));
        }
        for session in &mut self.embedded {
            for n in session.si.take_notifications() {
                self.events.push(AdapterEvent::Notification(n));
            }
        }
        self.check_scan_end(now);
        std::mem::take(&mut self.events)
    }

    fn check_lock(&mut self, now: Instant) {
        let Some(cur) = self.current.as_mut() else {
            return;
        };
        let snapshot = self.view.signal.get();
        if snapshot.is_locked() && snapshot.generation > cur.generation {
            let elapsed = now.saturating_duration_since(cur.start);
            cur.lock_time.get_or_insert(elapsed);
            info!(
                "[Adapter] adapter {} locked after {} ms",
                self.view.adapter_no,
                elapsed.as_millis()
            );
            match (self.reader_factory)(&cur.mux, &cur.options) {
                Ok(reader) => {
                    self.reader = Some(reader);
                    if cur.relisten {
                        cur.relisten = false;
                        self.si.relisten(now);
                    } else {
                        self.si.activate(&cur.mux, cur.scan_id, now);
                    }
                    self.state = TuneState::Locked;
                }
                Err(e) => {
                    error!("[Adapter] adapter {} opening stream: {}", self.view.adapter_no, e);
                    cur.forced_result = Some(ScanResult::NotTs);
                    self.state = TuneState::TuneFailed;
                }
            }
        } else if now.saturating_duration_since(cur.start) > Duration::from_millis(self.tuning.lock_timeout_ms) {
            info!("[Adapter] adapter {} lock timed out", self.view.adapter_no);
            self.state = TuneState::LockTimedout;
        }
    }

    async fn run_si(&mut self, now: Instant) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        let outcome = self.si.process_batch(reader.as_mut(), now);
        if let Some(si_mux) = self.si.si_mux() {
            if si_mux != reader.stream_mux() {
                reader.on_stream_mux_change(si_mux);
            }
        }
        if outcome == BatchOutcome::Abort {
            self.retune().await;
            return;
        }

        let scanning = self.current.as_ref().map_or(false, |c| c.options.scan);
        for mux in self.si.take_embedded_requests() {
            if scanning {
                continue;
            }
            match (self.reader_factory)(&mux, &TuneOptions::default()) {
                Ok(reader) => {
                    let mut si = ActiveSiStream::new(self.db.clone(), self.policy.clone(), self.view.clone());
                    si.activate(&mux, None, now);
                    self.embedded.push(EmbeddedSession { si, reader });
                }
                Err(e) => warn!("[Adapter] adapter {} embedded stream {}: {}", self.view.adapter_no, mux, e),
            }
        }
        for session in &mut self.embedded {
            if session.si.process_batch(session.reader.as_mut(), now) == BatchOutcome::Abort {
                session.si.relisten(now);
            }
        }
    }

    /// SI asked for a retune of the current mux.
    async fn retune(&mut self) {
        self.reader = None;
        self.embedded.clear();
        let max_retunes = self.tuning.max_retunes;
        let Some(cur) = self.current.as_mut() else {
            return;
        };
        cur.retunes += 1;
        if cur.retunes > max_retunes {
            warn!(
                "[Adapter] adapter {} giving up on {} after {} retunes",
                self.view.adapter_no, cur.mux, max_retunes
            );
            cur.forced_result = Some(if self.si.confirmation().on_wrong_sat {
                ScanResult::Bad
            } else {
                ScanResult::Partial
            });
            self.si.deactivate();
            self.state = TuneState::TuneFailed;
            return;
        }
        info!("[Adapter] adapter {} retune {} ({})", self.view.adapter_no, cur.mux, cur.retunes);
        cur.relisten = true;
        self.issue_tune().await;
    }

    fn sample_signal(&mut self) {
        let generation = self.view.signal.generation();
        if generation == self.last_generation {
            return;
        }
        self.last_generation = generation;
        let Some(cur) = self.current.as_mut() else {
            return;
        };
        let snapshot = self.view.signal.get();
        if cur.samples.len() >= MAX_SAMPLES {
            let mut i = 0;
            cur.samples.retain(|_| {
                i += 1;
                i % 2 == 0
            });
        }
        cur.samples.push(snapshot.sample);
        let info = SignalInfo {
            adapter_no: self.view.adapter_no,
            tuned_mux: Some(cur.mux.clone()),
            si_mux: self.si.si_mux().cloned(),
            lock_result: snapshot.lock_result,
            fe_status: snapshot.fe_status.0,
            sample: snapshot.sample,
            matype: snapshot.matype,
            isi_list: snapshot.isi_list,
            bitrate: snapshot.bitrate,
            confirmation: self.si.confirmation().summary(),
        };
        self.events.push(AdapterEvent::Notification(Notification::SignalInfo(info)));
    }

    fn check_scan_end(&mut self, now: Instant) {
        let Some(cur) = self.current.as_ref() else {
            return;
        };
        let Some(scan_id) = cur.scan_id else {
            return;
        };
        if cur.reported {
            return;
        }
        let lock_result = self.view.signal.get().lock_result;
        let (scan_result, lock_result, retry) = match self.state {
            TuneState::TuneFailed => (cur.forced_result.unwrap_or(ScanResult::Bad), lock_result, false),
            TuneState::TuneFailedTemp => (ScanResult::NoLock, LockResult::None, true),
            TuneState::LockTimedout => (ScanResult::NoLock, lock_result, false),
            TuneState::Locked if self.si.scan_done(now) => (self.si.scan_result(now), LockResult::Locked, false),
            _ => return,
        };
        let report = ScanMuxEndReport {
            scan_id,
            mux: self.si.si_mux().cloned().unwrap_or_else(|| cur.mux.clone()),
            scan_result,
            lock_result,
            num_services: self.si.num_services(),
            confirmation: self.si.confirmation().summary(),
        };
        info!(
            "[Adapter] adapter {} scan of {} ended: {:?}",
            self.view.adapter_no, report.mux, scan_result
        );
        self.events.push(AdapterEvent::ScanMuxEnd { report, retry });
        if let Some(cur) = self.current.as_mut() {
            cur.reported = true;
        }
        self.end_tune();
    }

    /// Stop SI processing and store the signal history of the current tune.
    /// A pending dish move is abandoned.
    pub fn end_tune(&mut self) {
        if let Some(wait) = self.positioning.take() {
            self.sequencer.abort_positioner();
            if let Suspended::Spectrum { .. } = wait.work {
                self.spectrum_result = Some(Err(TuneError::Cancelled));
            }
        }
        let Some(cur) = self.current.take() else {
            return;
        };
        self.reader = None;
        self.embedded.clear();
        self.si.deactivate();
        self.state = TuneState::TuneInit;

        let stat = SignalStat {
            k: SignalStatKey {
                mux: *cur.mux.key(),
                rf_path: cur.rf_path,
                time: cur.start_unix,
            },
            frequency: cur.mux.frequency(),
            pol: cur.mux.pol(),
            lock_time_ms: cur.lock_time.map_or(-1, |d| d.as_millis().min(i32::MAX as u128) as i32),
            stats: cur.samples,
        };
        if stat.stats.is_empty() {
            return;
        }
        match with_write_txn(&self.db, |txn| txn.put_signal_stat(&stat)) {
            Ok(()) => debug!(
                "[Adapter] adapter {} stored {} signal samples",
                self.view.adapter_no,
                stat.stats.len()
            ),
            Err(e) => warn!("[Adapter] adapter {} storing signal stats: {}", self.view.adapter_no, e),
        }
    }

    /// Acquire and store the spectrum of one band, ending any tune first.
    ///
    /// `Ok(None)` means the dish is moving; the record shows up in
    /// [`ActiveAdapter::take_spectrum`] after a later tick.
    pub async fn acquire_spectrum(
        &mut self,
        sat_pos: SatPos,
        pol: Polarisation,
        band: Band,
        options: &TuneOptions,
    ) -> Result<Option<SpectrumRecord>, TuneError> {
        let ticket = self.cancel_flag().issue();
        self.acquire_spectrum_ticket(sat_pos, pol, band, options, ticket).await
    }

    pub async fn acquire_spectrum_ticket(
        &mut self,
        sat_pos: SatPos,
        pol: Polarisation,
        band: Band,
        options: &TuneOptions,
        ticket: u64,
    ) -> Result<Option<SpectrumRecord>, TuneError> {
        self.end_tune();
        self.spectrum_result = None;
        let (lnb, connection) = self
            .view
            .spectrum_lnb(sat_pos, pol)
            .ok_or_else(|| TuneError::NoLnb(format!("no LNB for {} {}", sat_pos, pol)))?;
        let target = LnbTarget {
            lnb: &lnb,
            connection: &connection,
        };
        let detector = self.detector.clone();
        let step = self
            .sequencer
            .start_spectrum(target, sat_pos, pol, band, options, ticket, detector.as_ref())
            .await?;
        match step {
            Step::Done(record) => Ok(Some(self.spectrum_acquired(record))),
            Step::Positioning(setup) => {
                let wait = setup.positioner_wait.unwrap_or_default();
                self.positioning = Some(PositionerWait {
                    until: Instant::now() + wait,
                    setup,
                    work: Suspended::Spectrum {
                        sat_pos,
                        pol,
                        band,
                        options: options.clone(),
                    },
                });
                Ok(None)
            }
        }
    }

    /// Spectrum acquired after a dish move, or its failure.
    pub fn take_spectrum(&mut self) -> Option<Result<SpectrumRecord, TuneError>> {
        self.spectrum_result.take()
    }

    fn spectrum_acquired(&mut self, record: SpectrumRecord) -> SpectrumRecord {
        if let Err(e) = store_spectrum(&self.db, &record) {
            warn!("[Adapter] adapter {} storing spectrum: {}", self.view.adapter_no, e);
        }
        self.events
            .push(AdapterEvent::Notification(Notification::SpectrumAcquired(record.k)));
        record
    }

    /// Events produced outside [`ActiveAdapter::tick`].
    pub fn take_events(&mut self) -> Vec<AdapterEvent> {
        std::mem::take(&mut self.events)
    }

    /// End the tune, stop the frontend and power down the LNB.
    pub fn release(&mut self) {
        self.end_tune();
        self.sequencer.stop();
        self.sequencer.release_lnb();
        info!("[Adapter] adapter {} released", self.view.adapter_no);
    }
}
