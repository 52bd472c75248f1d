//! Spectrum acquisition.
//!
//! Uses the same LNB and DiSEqC setup as a tune, then asks the driver for a
//! sweep or FFT spectrum instead of a lock. Candidate carriers come from the
//! driver when asked for and available, otherwise from a [`PeakDetector`].

use std::time::Duration;

use log::{debug, info, warn};
use neumo_protocol::{Band, DeliverySystem, PolKey, Polarisation, SatPos, SpectralPeak, SpectrumKey, SpectrumRecord};

use super::dtv::{self, spectrum_method, PropertyList};
use super::sequencer::{LnbSetup, LnbTarget, Sequencer, Step};
use super::{TuneError, TuneOptions};
use crate::database::{self, prelude::*, DatabaseHandle};
use crate::engine::{unix_now, with_write_txn};

const MAX_CANDIDATES: usize = 512;
const DEFAULT_MAX_POINTS: usize = 65_536;
/// Time the driver gets to finish a sweep.
const SPECTRUM_TIMEOUT: Duration = Duration::from_secs(20);

/// Finds candidate carriers in a spectrum.
pub trait PeakDetector: Send + Sync {
    /// `freq` in kHz, `rf_level` in 0.001 dB, both of equal length and ascending
    /// in frequency. Returns (frequency in kHz, symbol rate) pairs.
    fn find_peaks(&self, freq: &[u32], rf_level: &[i32]) -> Vec<(u32, u32)>;
}

/// Plateau detector: a carrier is a run of points above the noise floor.
#[derive(Debug, Clone)]
pub struct ThresholdPeakDetector {
    /// Margin above the noise floor in 0.001 dB.
    pub threshold: i32,
    /// Narrowest carrier in kHz.
    pub min_bandwidth: u32,
}

impl Default for ThresholdPeakDetector {
    fn default() -> Self {
        Self {
            threshold: 3_000,
            min_bandwidth: 1_000,
        }
    }
}

impl PeakDetector for ThresholdPeakDetector {
    fn find_peaks(&self, freq: &[u32], rf_level: &[i32]) -> Vec<(u32, u32)> {
        let n = freq.len().min(rf_level.len());
        if n < 3 {
            return Vec::new();
        }
        let mut sorted = rf_level[..n].to_vec();
        sorted.sort_unstable();
        let floor = sorted[n / 4];
        let limit = floor + self.threshold;

        let mut peaks = Vec::new();
        let mut start = None;
        for i in 0..=n {
            let above = i < n && rf_level[i] > limit;
            match (above, start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    let (lo, hi) = (freq[s], freq[i - 1]);
                    let bandwidth = hi - lo;
                    if bandwidth >= self.min_bandwidth {
                        // symbol rate for a rolloff of 0.35
                        let symbol_rate = (bandwidth as u64 * 1000 * 100 / 135) as u32;
                        peaks.push(((lo + hi) / 2, symbol_rate));
                    }
                    start = None;
                }
                _ => {}
            }
        }
        peaks
    }
}

/// Sky frequency range of one band of an LNB.
fn band_range(plan: &super::sec::LnbPlan, band: Band) -> (u32, u32) {
    match band {
        Band::Low => (plan.freq_low, plan.freq_mid.min(plan.freq_high)),
        Band::High => (plan.freq_mid, plan.freq_high),
    }
}

/// Requested sweep range clamped to one band.
fn sweep_range(plan: &super::sec::LnbPlan, band: Band, options: &TuneOptions) -> Result<(u32, u32), TuneError> {
    let (band_lo, band_hi) = band_range(plan, band);
    let start = options.spectrum.start_frequency.clamp(band_lo, band_hi);
    let end = options.spectrum.end_frequency.clamp(band_lo, band_hi);
    if start >= end {
        return Err(TuneError::BadParameters(format!(
            "empty spectrum range {}-{} kHz in {:?} band",
            start, end, band
        )));
    }
    Ok((start, end))
}

impl Sequencer {
    /// Acquire the spectrum of one band and polarisation, waiting for the
    /// positioner if the dish must move.
    pub async fn acquire_spectrum(
        &mut self,
        target: LnbTarget<'_>,
        sat_pos: SatPos,
        pol: Polarisation,
        band: Band,
        options: &TuneOptions,
        detector: &dyn PeakDetector,
    ) -> Result<SpectrumRecord, TuneError> {
        let ticket = self.cancel_flag().issue();
        match self
            .start_spectrum(target, sat_pos, pol, band, options, ticket, detector)
            .await?
        {
            Step::Done(record) => Ok(record),
            Step::Positioning(setup) => {
                self.wait_for_positioner(setup.positioner_wait.unwrap_or_default())
                    .await?;
                self.finish_spectrum(sat_pos, pol, band, options, setup, detector)
            }
        }
    }

    /// Set up the LNB for a sweep; sweeps at once unless the dish must move.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_spectrum(
        &mut self,
        target: LnbTarget<'_>,
        sat_pos: SatPos,
        pol: Polarisation,
        band: Band,
        options: &TuneOptions,
        ticket: u64,
        detector: &dyn PeakDetector,
    ) -> Result<Step<SpectrumRecord>, TuneError> {
        self.set_ticket(ticket);
        if self.is_cancelled() {
            return Err(TuneError::Cancelled);
        }
        let plan = super::sec::LnbPlan::of(target.lnb);
        let (start, _) = sweep_range(&plan, band, options)?;
        let setup = self.prepare_lnb(target, sat_pos, pol, start, options).await?;
        if setup.band != band {
            return Err(TuneError::BadParameters(format!("{start} kHz is not in the {band:?} band")));
        }
        if setup.positioner_wait.is_some() {
            return Ok(Step::Positioning(setup));
        }
        self.finish_spectrum(sat_pos, pol, band, options, setup, detector)
            .map(Step::Done)
    }

    /// Sweep with the LNB already set up by [`Sequencer::start_spectrum`].
    pub fn finish_spectrum(
        &mut self,
        sat_pos: SatPos,
        pol: Polarisation,
        band: Band,
        options: &TuneOptions,
        setup: LnbSetup,
        detector: &dyn PeakDetector,
    ) -> Result<SpectrumRecord, TuneError> {
        if self.is_cancelled() {
            if setup.positioner_wait.is_some() {
                self.abort_positioner();
            }
            return Err(TuneError::Cancelled);
        }
        let plan = setup.plan;
        let (start, end) = sweep_range(&plan, band, options)?;
        let if_a = plan.driver_frequency(start, band).unwrap_or(0);
        let if_b = plan.driver_frequency(end, band).unwrap_or(0);
        let (if_start, if_end) = (if_a.min(if_b), if_a.max(if_b));
        let method = if options.spectrum.fft_size > 0 {
            spectrum_method::FFT
        } else {
            spectrum_method::SWEEP
        };
        let mut props = PropertyList::cleared();
        props
            .add(dtv::DTV_DELIVERY_SYSTEM, dtv::delivery_system_code(DeliverySystem::DvbS2))
            .add(dtv::DTV_SCAN_START_FREQUENCY, if_start)
            .add(dtv::DTV_SCAN_END_FREQUENCY, if_end)
            .add(dtv::DTV_SCAN_RESOLUTION, options.spectrum.resolution)
            .add(dtv::DTV_SCAN_FFT_SIZE, options.spectrum.fft_size)
            .spectrum(method);
        let fe = self.frontend().clone();
        fe.set_properties(&mut props)
            .map_err(|e| TuneError::io("FE_SET_PROPERTY", e))?;
        if !fe.wait_event(SPECTRUM_TIMEOUT).map_err(|e| TuneError::io("poll", e))? {
            warn!("[Spectrum] adapter {} no completion event", fe.adapter_no());
        }

        let max_points = match options.spectrum.resolution {
            0 => DEFAULT_MAX_POINTS,
            r => ((if_end - if_start) / r) as usize + 1,
        };
        let data = fe
            .read_spectrum(max_points, MAX_CANDIDATES)
            .map_err(|e| TuneError::io("FE_GET_PROPERTY", e))?;

        let mut points: Vec<(u32, i32)> = data
            .freq
            .iter()
            .zip(&data.rf_level)
            .map(|(&f, &l)| (plan.sky_frequency(f, band), l))
            .collect();
        points.sort_by_key(|p| p.0);
        let (freq, rf_level): (Vec<u32>, Vec<i32>) = points.into_iter().unzip();

        let candidates: Vec<(u32, u32)> = if options.spectrum.use_driver_peaks && !data.candidates.is_empty() {
            data.candidates
                .iter()
                .map(|&(f, sr)| (plan.sky_frequency(f, band), sr))
                .collect()
        } else {
            detector.find_peaks(&freq, &rf_level)
        };
        let mut peaks: Vec<SpectralPeak> = candidates
            .into_iter()
            .map(|(frequency, symbol_rate)| SpectralPeak {
                frequency,
                symbol_rate,
                pol,
            })
            .collect();
        peaks.sort_by_key(|p| p.frequency);

        info!(
            "[Spectrum] adapter {} {} {} {:?}: {} points, {} peaks",
            fe.adapter_no(),
            neumo_protocol::sat_pos::to_str(sat_pos),
            pol,
            band,
            freq.len(),
            peaks.len()
        );
        Ok(SpectrumRecord {
            k: SpectrumKey {
                rf_path: setup.rf_path,
                sat_pos,
                pol: PolKey::from(pol),
                band,
                start_time: unix_now(),
            },
            start_frequency: start,
            end_frequency: end,
            resolution: options.spectrum.resolution,
            usals_pos: setup.usals_pos,
            freq,
            rf_level,
            peaks,
        })
    }
}

pub fn store_spectrum(db: &DatabaseHandle, record: &SpectrumRecord) -> database::Result<()> {
    with_write_txn(db, |txn| txn.put_spectrum(record))?;
    debug!("[Spectrum] stored {:?}", record.k);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SecTiming;
    use crate::database::Database;
    use crate::tuner::frontend::testing::{FeCommand, RecordingFrontend};
    use crate::tuner::frontend::{FrontendHandle, SpectrumData};
    use crate::tuner::SpectrumOptions;
    use neumo_protocol::{Lnb, LnbConnection, LnbKey, LnbNetwork, LnbType};

    fn lnb() -> Lnb {
        Lnb {
            k: LnbKey {
                dish_id: 0,
                lnb_id: 2,
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
                tune_string: "C".into(),
                diseqc_10: 0,
                diseqc_11: -1,
                enabled: true,
                ..Default::default()
            }],
            enabled: true,
            ..Default::default()
        }
    }

    /// Flat noise at -60 dB with one carrier 20 MHz wide around `center` (IF, kHz).
    fn synthetic(center: u32) -> SpectrumData {
        let freq: Vec<u32> = (950_000..=1_450_000).step_by(500).collect();
        let rf_level = freq
            .iter()
            .map(|&f| if f.abs_diff(center) <= 10_000 { -50_000 } else { -60_000 })
            .collect();
        SpectrumData {
            freq,
            rf_level,
            candidates: Vec::new(),
        }
    }

    #[test]
    fn test_threshold_detector() {
        let data = synthetic(1_100_000);
        let peaks = ThresholdPeakDetector::default().find_peaks(&data.freq, &data.rf_level);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].0, 1_100_000);
        // 20 MHz occupied bandwidth
        assert!((14_000_000..=15_500_000).contains(&peaks[0].1), "{}", peaks[0].1);
    }

    #[tokio::test]
    async fn test_spectrum_uses_lnb_setup_and_detector() {
        let fe = Arc::new(RecordingFrontend::new());
        *fe.spectrum.lock() = synthetic(1_100_000);
        let handle: FrontendHandle = fe.clone();
        let mut seq = Sequencer::new(handle, SecTiming::immediate(), 30);
        let lnb = lnb();
        let options = TuneOptions {
            spectrum: SpectrumOptions {
                start_frequency: 10_700_000,
                end_frequency: 11_700_000,
                resolution: 500,
                fft_size: 0,
                use_driver_peaks: false,
            },
            ..Default::default()
        };
        let target = LnbTarget {
            lnb: &lnb,
            connection: &lnb.connections[0],
        };
        let record = seq
            .acquire_spectrum(target, 1920, Polarisation::H, Band::Low, &options, &ThresholdPeakDetector::default())
            .await
            .unwrap();

        assert_eq!(fe.diseqc_messages().len(), 1);
        let cmds = fe.commands();
        match cmds.last().unwrap() {
            FeCommand::SetProperties(props) => {
                assert_eq!(props.last().unwrap(), &(dtv::DTV_SPECTRUM, spectrum_method::SWEEP));
                assert!(props.contains(&(dtv::DTV_SCAN_START_FREQUENCY, 950_000)));
                assert!(props.contains(&(dtv::DTV_SCAN_END_FREQUENCY, 1_950_000)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(record.k.band, Band::Low);
        assert_eq!(record.k.pol, PolKey::H);
        assert_eq!(record.freq.first(), Some(&10_700_000));
        assert_eq!(record.peaks.len(), 1);
        assert_eq!(record.peaks[0].frequency, 10_850_000);

        let db = Database::open_in_memory().unwrap().into_handle();
        store_spectrum(&db, &record).unwrap();
        let stored: Vec<SpectrumRecord> = db.lock().read_txn().unwrap().all().unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_driver_peaks_preferred_when_asked() {
        let fe = Arc::new(RecordingFrontend::new());
        let mut data = synthetic(1_100_000);
        data.candidates = vec![(1_200_000, 30_000_000)];
        *fe.spectrum.lock() = data;
        let handle: FrontendHandle = fe.clone();
        let mut seq = Sequencer::new(handle, SecTiming::immediate(), 30);
        let lnb = lnb();
        let mut options = TuneOptions::default();
        options.spectrum.end_frequency = 11_700_000;
        options.spectrum.use_driver_peaks = true;
        let target = LnbTarget {
            lnb: &lnb,
            connection: &lnb.connections[0],
        };
        let record = seq
            .acquire_spectrum(target, 1920, Polarisation::V, Band::Low, &options, &ThresholdPeakDetector::default())
            .await
            .unwrap();
        assert_eq!(record.peaks.len(), 1);
        assert_eq!(record.peaks[0].frequency, 10_950_000);
        assert_eq!(record.peaks[0].symbol_rate, 30_000_000);
    }
}
