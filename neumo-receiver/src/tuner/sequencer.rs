//! Tune sequence of one frontend.
//!
//! A satellite tune runs these steps in order:
//! 1. select the RF input
//! 2. decide whether DiSEqC is needed at all
//! 3. send the DiSEqC string of the LNB connection
//! 4. set voltage, then tone
//! 5. wait for the positioner
//! 6. issue the tune or blind scan command
//!
//! Step 5 is the only long suspension. [`Sequencer::start_tune`] stops in
//! front of it and returns the pending [`LnbSetup`]; the owner of the
//! sequencer keeps running its event loop and calls
//! [`Sequencer::finish_tune`] once the move time elapsed, unless the tune's
//! [`CancelFlag`] ticket was cancelled in between. [`Sequencer::tune`] runs
//! all steps in one go for callers without an event loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use neumo_protocol::{
    AnyMux, Band, DeliverySystem, DvbcMux, DvbsMux, DvbtMux, Lnb, LnbConnection, Notification,
    Polarisation, PositionerMotionReport, RfPath, SatPos, SubscriberHandle,
};
use tokio::sync::Notify;

use super::diseqc::{self, DiseqcContext, DiseqcStep};
use super::dtv::{self, algorithm, PropertyList, Tone};
use super::frontend::FrontendHandle;
use super::sec::{self, settle, LnbPlan, SecState};
use super::{TuneError, TuneMode, TuneOptions};
use crate::config::SecTiming;

/// Abort signal for tunes, shared between the tuner thread and its callers.
///
/// Every tune request takes a ticket with [`CancelFlag::issue`].
/// [`CancelFlag::cancel`] aborts all tickets issued so far, including those
/// of requests still waiting in a queue, but none issued afterwards.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    issued: AtomicU64,
    cancelled: AtomicU64,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticket for a new tune.
    pub fn issue(&self) -> u64 {
        self.inner.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn cancel(&self) {
        let issued = self.inner.issued.load(Ordering::SeqCst);
        self.inner.cancelled.fetch_max(issued, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self, ticket: u64) -> bool {
        ticket <= self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `ticket` was cancelled.
    pub async fn cancelled(&self, ticket: u64) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled(ticket) {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelFlag")
            .field("issued", &self.inner.issued.load(Ordering::SeqCst))
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}

/// Result of the first half of a tune or sweep.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    Done(T),
    /// The dish is moving; resume with the setup after
    /// [`LnbSetup::positioner_wait`].
    Positioning(LnbSetup),
}

/// Where a satellite tune goes.
#[derive(Debug, Clone, Copy)]
pub struct LnbTarget<'a> {
    pub lnb: &'a Lnb,
    pub connection: &'a LnbConnection,
}

/// LNB side of a completed sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct LnbSetup {
    pub rf_path: RfPath,
    pub band: Band,
    pub plan: LnbPlan,
    pub usals_pos: SatPos,
    /// Number of DiSEqC messages and bursts sent.
    pub diseqc_sent: usize,
    pub positioner_wait: Option<Duration>,
}

/// Outcome of a successful tune command.
#[derive(Debug, Clone, PartialEq)]
pub struct TuneOutcome {
    pub lnb: Option<LnbSetup>,
    /// Frequency handed to the driver: intermediate frequency in kHz for
    /// satellite, Hz otherwise.
    pub driver_frequency: u32,
    pub blind: bool,
}

pub struct Sequencer {
    fe: FrontendHandle,
    timing: SecTiming,
    sat_tolerance: i16,
    state: SecState,
    cancel: CancelFlag,
    /// Ticket of the tune or sweep in progress.
    ticket: u64,
    notifier: Option<SubscriberHandle>,
}

impl Sequencer {
    pub fn new(fe: FrontendHandle, timing: SecTiming, sat_tolerance: u16) -> Self {
        Self {
            fe,
            timing,
            sat_tolerance: sat_tolerance.min(i16::MAX as u16) as i16,
            state: SecState::default(),
            cancel: CancelFlag::new(),
            ticket: 0,
            notifier: None,
        }
    }

    /// Subscriber for positioner motion reports.
    pub fn set_notifier(&mut self, notifier: SubscriberHandle) {
        self.notifier = Some(notifier);
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn frontend(&self) -> &FrontendHandle {
        &self.fe
    }

    pub fn sec_state(&self) -> &SecState {
        &self.state
    }

    pub fn timing(&self) -> &SecTiming {
        &self.timing
    }

    pub(crate) fn set_ticket(&mut self, ticket: u64) {
        self.ticket = ticket;
    }

    /// The tune or sweep in progress was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled(self.ticket)
    }

    /// Tune `mux`, waiting for the positioner if the dish must move.
    /// Satellite muxes need an LNB.
    pub async fn tune(
        &mut self,
        mux: &AnyMux,
        target: Option<LnbTarget<'_>>,
        options: &TuneOptions,
    ) -> Result<TuneOutcome, TuneError> {
        let ticket = self.cancel.issue();
        match self.start_tune(mux, target, options, ticket).await? {
            Step::Done(outcome) => Ok(outcome),
            Step::Positioning(setup) => {
                self.wait_for_positioner(setup.positioner_wait.unwrap_or_default())
                    .await?;
                self.finish_tune(mux, setup, options)
            }
        }
    }

    /// Steps 1 to 4, then either step 6 or a pending positioner wait.
    pub async fn start_tune(
        &mut self,
        mux: &AnyMux,
        target: Option<LnbTarget<'_>>,
        options: &TuneOptions,
        ticket: u64,
    ) -> Result<Step<TuneOutcome>, TuneError> {
        self.set_ticket(ticket);
        if self.is_cancelled() {
            return Err(TuneError::Cancelled);
        }
        let result = match mux {
            AnyMux::Dvbs(m) => match target {
                Some(target) => self.start_sat(m, target, options).await,
                None => Err(TuneError::NoLnb(format!("{mux}"))),
            },
            AnyMux::Dvbc(m) => self.tune_cable(m).map(Step::Done),
            AnyMux::Dvbt(m) => self.tune_terrestrial(m).map(Step::Done),
        };
        if let Err(e) = &result {
            warn!("[Sequencer] adapter {} tune {} failed: {}", self.fe.adapter_no(), mux, e);
        }
        result
    }

    /// Step 6 of a satellite tune after the dish arrived.
    pub fn finish_tune(
        &mut self,
        mux: &AnyMux,
        setup: LnbSetup,
        options: &TuneOptions,
    ) -> Result<TuneOutcome, TuneError> {
        if self.is_cancelled() {
            self.abort_positioner();
            return Err(TuneError::Cancelled);
        }
        let result = match mux {
            AnyMux::Dvbs(m) => self.command_sat(m, setup, options),
            _ => Err(TuneError::BadParameters(format!("{mux} needs no positioner"))),
        };
        if let Err(e) = &result {
            warn!("[Sequencer] adapter {} tune {} failed: {}", self.fe.adapter_no(), mux, e);
        }
        result
    }

    /// A positioner wait ended early; the dish position is unknown now.
    pub fn abort_positioner(&mut self) {
        info!("[Sequencer] adapter {} positioner wait cancelled", self.fe.adapter_no());
        self.state.usals_pos = None;
    }

    /// Abort a tune in progress and stop the driver.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Err(e) = self.fe.stop() {
            debug!("[Sequencer] adapter {} stop: {}", self.fe.adapter_no(), e);
        }
    }

    /// Power down the LNB and forget the bus state.
    pub fn release_lnb(&mut self) {
        if let Err(e) = self.fe.set_voltage(dtv::Voltage::Off) {
            debug!("[Sequencer] adapter {} voltage off: {}", self.fe.adapter_no(), e);
        }
        self.state.invalidate();
        self.state.voltage = Some(dtv::Voltage::Off);
    }

    async fn start_sat(
        &mut self,
        m: &DvbsMux,
        target: LnbTarget<'_>,
        options: &TuneOptions,
    ) -> Result<Step<TuneOutcome>, TuneError> {
        let setup = self
            .prepare_lnb(target, m.k.sat_pos, m.pol, m.frequency, options)
            .await?;
        if setup.positioner_wait.is_some() {
            return Ok(Step::Positioning(setup));
        }
        self.command_sat(m, setup, options).map(Step::Done)
    }

    fn command_sat(&mut self, m: &DvbsMux, setup: LnbSetup, options: &TuneOptions) -> Result<TuneOutcome, TuneError> {
        let driver_frequency = setup
            .plan
            .driver_frequency(m.frequency, setup.band)
            .ok_or_else(|| TuneError::BadParameters(format!("{} kHz outside LNB range", m.frequency)))?;
        if options.tune_mode == TuneMode::PositionerOnly {
            return Ok(TuneOutcome {
                lnb: Some(setup),
                driver_frequency,
                blind: false,
            });
        }
        if self.is_cancelled() {
            return Err(TuneError::Cancelled);
        }

        let blind = options.tune_mode == TuneMode::Blind;
        let mut props = if blind {
            blind_properties(m, driver_frequency, options)
        } else {
            sat_properties(m, driver_frequency)?
        };
        self.fe
            .set_properties(&mut props)
            .map_err(|e| TuneError::io("FE_SET_PROPERTY", e))?;
        info!(
            "[Sequencer] adapter {} tuned {} (if={} kHz{})",
            self.fe.adapter_no(),
            m.frequency,
            driver_frequency,
            if blind { ", blind" } else { "" }
        );
        Ok(TuneOutcome {
            lnb: Some(setup),
            driver_frequency,
            blind,
        })
    }

    fn tune_cable(&mut self, m: &DvbcMux) -> Result<TuneOutcome, TuneError> {
        if m.frequency == 0 || m.symbol_rate == 0 {
            return Err(TuneError::BadParameters("cable mux without frequency or symbol rate".into()));
        }
        let frequency = m.frequency.saturating_mul(1000);
        let mut props = PropertyList::cleared();
        props
            .add(dtv::DTV_DELIVERY_SYSTEM, dtv::delivery_system_code(DeliverySystem::DvbC))
            .add(dtv::DTV_FREQUENCY, frequency)
            .add(dtv::DTV_SYMBOL_RATE, m.symbol_rate)
            .add(dtv::DTV_MODULATION, dtv::modulation_code(m.modulation))
            .add(dtv::DTV_INNER_FEC, dtv::code_rate_code(m.fec_inner))
            .add(dtv::DTV_INVERSION, 2)
            .tune();
        self.fe
            .set_properties(&mut props)
            .map_err(|e| TuneError::io("FE_SET_PROPERTY", e))?;
        Ok(TuneOutcome {
            lnb: None,
            driver_frequency: frequency,
            blind: false,
        })
    }

    fn tune_terrestrial(&mut self, m: &DvbtMux) -> Result<TuneOutcome, TuneError> {
        if m.frequency == 0 {
            return Err(TuneError::BadParameters("terrestrial mux without frequency".into()));
        }
        let frequency = m.frequency.saturating_mul(1000);
        let system = match m.delivery_system {
            DeliverySystem::DvbT2 => DeliverySystem::DvbT2,
            _ => DeliverySystem::DvbT,
        };
        let mut props = PropertyList::cleared();
        props
            .add(dtv::DTV_DELIVERY_SYSTEM, dtv::delivery_system_code(system))
            .add(dtv::DTV_FREQUENCY, frequency)
            .add(dtv::DTV_BANDWIDTH_HZ, m.bandwidth)
            .add(dtv::DTV_MODULATION, dtv::modulation_code(m.modulation))
            .add(dtv::DTV_TRANSMISSION_MODE, dtv::transmission_mode_code(m.transmission_mode))
            .add(dtv::DTV_GUARD_INTERVAL, dtv::guard_interval_code(m.guard_interval))
            .add(dtv::DTV_CODE_RATE_HP, dtv::code_rate_code(m.hp_code_rate))
            .add(dtv::DTV_CODE_RATE_LP, dtv::code_rate_code(m.lp_code_rate))
            .add(dtv::DTV_INVERSION, 2);
        if system == DeliverySystem::DvbT2 {
            let plp = if m.k.stream_id >= 0 {
                m.k.stream_id as u32
            } else {
                dtv::NO_STREAM_ID_FILTER
            };
            props.add(dtv::DTV_STREAM_ID, plp);
        }
        props.tune();
        self.fe
            .set_properties(&mut props)
            .map_err(|e| TuneError::io("FE_SET_PROPERTY", e))?;
        Ok(TuneOutcome {
            lnb: None,
            driver_frequency: frequency,
            blind: false,
        })
    }

    /// Steps 1 to 5 of a satellite tune. Shared with spectrum acquisition.
    ///
    /// A dish move is only started here; the caller waits for
    /// [`LnbSetup::positioner_wait`] before tuning.
    pub(crate) async fn prepare_lnb(
        &mut self,
        target: LnbTarget<'_>,
        sat_pos: SatPos,
        pol: Polarisation,
        frequency: u32,
        options: &TuneOptions,
    ) -> Result<LnbSetup, TuneError> {
        let LnbTarget { lnb, connection } = target;
        let adapter_no = self.fe.adapter_no();
        let network = sec::network_for(lnb, sat_pos, self.sat_tolerance)
            .ok_or_else(|| TuneError::NoLnb(format!("LNB {:?} has no network for {}", lnb.k, sat_pos)))?;
        if !sec::can_receive_pol(lnb, pol) && pol != Polarisation::None {
            return Err(TuneError::BadParameters(format!("LNB {:?} cannot receive {}", lnb.k, pol)));
        }
        let plan = LnbPlan::of(lnb);
        let band = plan.band(frequency);
        let rf_path = sec::rf_path(lnb, connection);

        // 1. rf input
        let rf_input = options.rf_input.unwrap_or(connection.rf_input);
        if self.state.rf_input != Some(rf_input) {
            let mut props = PropertyList::new();
            props.add(dtv::DTV_RF_INPUT, rf_input.max(0) as u32);
            if let Err(e) = self.fe.set_properties(&mut props) {
                self.state.invalidate();
                self.state.rf_input = None;
                return Err(TuneError::io("DTV_RF_INPUT", e));
            }
            debug!("[Sequencer] adapter {} rf input {}", adapter_no, rf_input);
            self.state.rf_input = Some(rf_input);
        }

        // 2. is DiSEqC needed
        let target_usals = if network.usals_pos != 0 {
            network.usals_pos
        } else {
            network.sat_pos
        };
        let dish_pos = self.state.usals_pos.unwrap_or(lnb.usals_pos);
        let master = connection.rotor_control.is_master();
        let must_move = master && dish_pos != target_usals;
        if must_move && !options.may_move_dish {
            return Err(TuneError::BadParameters(format!(
                "dish at {} must move to {}",
                dish_pos, target_usals
            )));
        }
        let unchanged = self.state.rf_path == Some(rf_path) && self.state.sat_pos == Some(network.sat_pos);
        let need_diseqc = !unchanged || must_move;

        let voltage = sec::voltage_for(lnb, pol);
        let tone = sec::tone_for(band);
        let mut diseqc_sent = 0;
        if need_diseqc {
            // 3. DiSEqC with the bus powered and the tone off
            let ops = diseqc::parse_tune_string(&connection.tune_string)?;
            let ctx = DiseqcContext {
                committed: connection.diseqc_10,
                uncommitted: connection.diseqc_11,
                high_voltage: voltage == dtv::Voltage::V18,
                band,
                preset: network.diseqc12,
                usals_angle: (connection.rotor_control == neumo_protocol::RotorControl::MasterUsals).then(|| {
                    diseqc::usals_angle(target_usals, self.timing.site_latitude, self.timing.site_longitude)
                }),
                move_rotor: must_move,
                pause_ms: self.timing.pause_ms,
                repeats: self.timing.diseqc_repeats,
            };
            let steps = diseqc::plan(&ops, &ctx);
            if !steps.is_empty() {
                self.state
                    .set_voltage(self.fe.as_ref(), voltage, &self.timing)
                    .await
                    .map_err(|e| TuneError::io("FE_SET_VOLTAGE", e))?;
                self.state
                    .set_tone(self.fe.as_ref(), Tone::Off, &self.timing)
                    .await
                    .map_err(|e| TuneError::io("FE_SET_TONE", e))?;
            }
            for step in &steps {
                let sent = match step {
                    DiseqcStep::Message(msg) => self
                        .fe
                        .send_diseqc(msg)
                        .map_err(|e| TuneError::io("FE_DISEQC_SEND_MASTER_CMD", e)),
                    DiseqcStep::Burst(b) => self
                        .fe
                        .send_burst(*b)
                        .map_err(|e| TuneError::io("FE_DISEQC_SEND_BURST", e)),
                    DiseqcStep::PauseMs(ms) => {
                        settle(*ms).await;
                        continue;
                    }
                };
                if let Err(e) = sent {
                    self.state.invalidate();
                    return Err(e);
                }
                diseqc_sent += 1;
                settle(self.timing.diseqc_settle_ms).await;
            }
            debug!(
                "[Sequencer] adapter {} sent {} DiSEqC commands for {}",
                adapter_no, diseqc_sent, network.sat_pos
            );
        } else {
            debug!("[Sequencer] adapter {} LNB unchanged, no DiSEqC", adapter_no);
        }

        // 4. voltage before tone
        self.state
            .set_voltage(self.fe.as_ref(), voltage, &self.timing)
            .await
            .map_err(|e| TuneError::io("FE_SET_VOLTAGE", e))?;
        self.state
            .set_tone(self.fe.as_ref(), tone, &self.timing)
            .await
            .map_err(|e| TuneError::io("FE_SET_TONE", e))?;
        self.state.rf_path = Some(rf_path);
        self.state.sat_pos = Some(network.sat_pos);

        // 5. positioner
        let mut positioner_wait = None;
        if must_move {
            let wait = self.move_duration(dish_pos, target_usals);
            self.state.usals_pos = Some(target_usals);
            self.report_motion(dish_pos, target_usals, wait);
            positioner_wait = Some(wait);
        } else if master {
            self.state.usals_pos = Some(dish_pos);
        }

        Ok(LnbSetup {
            rf_path,
            band,
            plan,
            usals_pos: target_usals,
            diseqc_sent,
            positioner_wait,
        })
    }

    /// Time the dish needs from `from` to `to`.
    pub fn move_duration(&self, from: SatPos, to: SatPos) -> Duration {
        let delta = (from as i32 - to as i32).unsigned_abs() as u64;
        let speed = self.timing.rotor_speed_centideg_per_s.max(1) as u64;
        Duration::from_millis(delta * 1000 / speed + self.timing.rotor_margin_ms)
    }

    fn report_motion(&self, from: SatPos, to: SatPos, wait: Duration) {
        let adapter_no = self.fe.adapter_no();
        info!(
            "[Sequencer] adapter {} dish moving {} -> {} ({} ms)",
            adapter_no,
            from,
            to,
            wait.as_millis()
        );
        if let Some(n) = &self.notifier {
            n.notify(&Notification::PositionerMotion(PositionerMotionReport {
                adapter_no,
                from_usals_pos: from,
                to_usals_pos: to,
                start_time_ms: chrono::Utc::now().timestamp_millis(),
                expected_duration_ms: wait.as_millis() as u64,
            }));
        }
    }

    /// Sleep through a dish move unless the tune is cancelled first.
    pub(crate) async fn wait_for_positioner(&mut self, wait: Duration) -> Result<(), TuneError> {
        let cancel = self.cancel.clone();
        let ticket = self.ticket;
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(wait) => false,
            _ = cancel.cancelled(ticket) => true,
        };
        if cancelled {
            self.abort_positioner();
            return Err(TuneError::Cancelled);
        }
        Ok(())
    }
}

fn sat_properties(m: &DvbsMux, driver_frequency: u32) -> Result<PropertyList, TuneError> {
    if m.symbol_rate == 0 {
        return Err(TuneError::BadParameters("satellite mux without symbol rate".into()));
    }
    let system = match m.delivery_system {
        DeliverySystem::DvbS => DeliverySystem::DvbS,
        _ => DeliverySystem::DvbS2,
    };
    let mut props = PropertyList::cleared();
    props
        .add(dtv::DTV_DELIVERY_SYSTEM, dtv::delivery_system_code(system))
        .add(dtv::DTV_ALGORITHM, algorithm::COLD)
        .add(dtv::DTV_FREQUENCY, driver_frequency)
        .add(dtv::DTV_SYMBOL_RATE, m.symbol_rate)
        .add(dtv::DTV_MODULATION, dtv::modulation_code(m.modulation))
        .add(dtv::DTV_INNER_FEC, dtv::code_rate_code(m.fec))
        .add(dtv::DTV_INVERSION, 2);
    if system == DeliverySystem::DvbS2 {
        props
            .add(dtv::DTV_ROLLOFF, dtv::rolloff_code(m.rolloff))
            .add(dtv::DTV_PILOT, dtv::pilot_code(m.pilot));
        let stream_id = if m.k.stream_id >= 0 {
            m.k.stream_id as u32
        } else {
            dtv::NO_STREAM_ID_FILTER
        };
        props.add(dtv::DTV_STREAM_ID, stream_id);
        if m.k.stream_id >= 0 {
            let gold = dtv::pls_gold_code(m.pls_mode, m.pls_code).ok_or_else(|| {
                TuneError::BadParameters(format!("invalid PLS root code {}", m.pls_code))
            })?;
            props.add(dtv::DTV_SCRAMBLING_SEQUENCE_INDEX, gold);
        }
    }
    props.tune();
    Ok(props)
}

fn blind_properties(m: &DvbsMux, driver_frequency: u32, options: &TuneOptions) -> PropertyList {
    let mut props = PropertyList::cleared();
    props
        .add(dtv::DTV_DELIVERY_SYSTEM, dtv::delivery_system_code(DeliverySystem::DvbS2))
        .add(dtv::DTV_ALGORITHM, algorithm::BLIND)
        .add(dtv::DTV_FREQUENCY, driver_frequency)
        .add(dtv::DTV_SEARCH_RANGE, options.search_range_khz)
        .add(dtv::DTV_SYMBOL_RATE, m.symbol_rate)
        .add(
            dtv::DTV_STREAM_ID,
            if m.k.stream_id >= 0 {
                m.k.stream_id as u32
            } else {
                dtv::NO_STREAM_ID_FILTER
            },
        );
    let mut codes = options.pls_codes.clone();
    if m.pls_code != 0 || m.pls_mode != neumo_protocol::PlsMode::Root {
        if let Some(gold) = dtv::pls_gold_code(m.pls_mode, m.pls_code) {
            if !codes.contains(&gold) {
                codes.insert(0, gold);
            }
        }
    }
    for p in dtv::pls_search_list(&codes) {
        props.push(p);
    }
    if let Some((start, end)) = options.pls_search_range {
        let mut range = start.to_ne_bytes().to_vec();
        range.extend_from_slice(&end.to_ne_bytes());
        props.add_buffer(dtv::DTV_PLS_SEARCH_RANGE, &range);
    }
    props.scan();
    props
}
