//! Satellite equipment control: LNB frequency plan, voltage and tone.

use std::io;
use std::time::Duration;

use log::debug;
use neumo_protocol::{
    AnyMux, Band, Lnb, LnbConnection, LnbNetwork, LnbPolType, LnbType, Polarisation, RfPath, SatPos,
};

use super::dtv::{Tone, Voltage};
use super::FrontendChannel;
use crate::config::SecTiming;

/// Frequency plan of an LNB in kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LnbPlan {
    pub lof_low: i32,
    pub lof_high: i32,
    pub freq_low: u32,
    pub freq_mid: u32,
    pub freq_high: u32,
}

impl LnbPlan {
    /// The configured plan, with the usual values of the LNB type for unset fields.
    pub fn of(lnb: &Lnb) -> Self {
        let default = match lnb.k.lnb_type {
            LnbType::C => LnbPlan {
                lof_low: 5_150_000,
                lof_high: 5_150_000,
                freq_low: 3_400_000,
                freq_mid: 4_200_000,
                freq_high: 4_200_000,
            },
            LnbType::Ku => LnbPlan {
                lof_low: 10_750_000,
                lof_high: 10_750_000,
                freq_low: 11_450_000,
                freq_mid: 12_750_000,
                freq_high: 12_750_000,
            },
            _ => LnbPlan {
                lof_low: 9_750_000,
                lof_high: 10_600_000,
                freq_low: 10_700_000,
                freq_mid: 11_700_000,
                freq_high: 12_750_000,
            },
        };
        let pick_i = |v: i32, d: i32| if v != 0 { v } else { d };
        let pick_u = |v: u32, d: u32| if v != 0 { v } else { d };
        LnbPlan {
            lof_low: pick_i(lnb.lof_low, default.lof_low),
            lof_high: pick_i(lnb.lof_high, default.lof_high),
            freq_low: pick_u(lnb.freq_low, default.freq_low),
            freq_mid: pick_u(lnb.freq_mid, default.freq_mid),
            freq_high: pick_u(lnb.freq_high, default.freq_high),
        }
    }

    pub fn band(&self, frequency: u32) -> Band {
        if frequency >= self.freq_mid && self.freq_mid < self.freq_high {
            Band::High
        } else {
            Band::Low
        }
    }

    fn lof(&self, band: Band) -> i32 {
        match band {
            Band::Low => self.lof_low,
            Band::High => self.lof_high,
        }
    }

    /// Intermediate frequency the tuner must be set to, `None` outside the LNB range.
    pub fn driver_frequency(&self, frequency: u32, band: Band) -> Option<u32> {
        if frequency < self.freq_low || frequency > self.freq_high {
            return None;
        }
        Some((frequency as i64 - self.lof(band) as i64).unsigned_abs() as u32)
    }

    /// Inverse of [`LnbPlan::driver_frequency`].
    pub fn sky_frequency(&self, driver_frequency: u32, band: Band) -> u32 {
        let lof = self.lof(band) as i64;
        if lof > self.freq_high as i64 {
            (lof - driver_frequency as i64).max(0) as u32
        } else {
            (lof + driver_frequency as i64).max(0) as u32
        }
    }
}

pub fn can_receive_pol(lnb: &Lnb, pol: Polarisation) -> bool {
    use Polarisation::*;
    match lnb.pol_type {
        LnbPolType::Hv | LnbPolType::Vh => matches!(pol, H | V),
        LnbPolType::Lr | LnbPolType::Rl => matches!(pol, L | R),
        LnbPolType::H => pol == H,
        LnbPolType::V => pol == V,
        LnbPolType::L => pol == L,
        LnbPolType::R => pol == R,
    }
}

pub fn voltage_for(lnb: &Lnb, pol: Polarisation) -> Voltage {
    let high = pol.wants_high_voltage();
    let high = match lnb.pol_type {
        LnbPolType::Vh | LnbPolType::Rl => !high,
        _ => high,
    };
    if high {
        Voltage::V18
    } else {
        Voltage::V13
    }
}

pub fn tone_for(band: Band) -> Tone {
    match band {
        Band::Low => Tone::Off,
        Band::High => Tone::On,
    }
}

/// The enabled network of `lnb` closest to `sat_pos` within `tolerance`.
pub fn network_for(lnb: &Lnb, sat_pos: SatPos, tolerance: i16) -> Option<&LnbNetwork> {
    lnb.networks
        .iter()
        .filter(|n| n.enabled && (n.sat_pos as i32 - sat_pos as i32).abs() <= tolerance as i32)
        .min_by_key(|n| (n.sat_pos as i32 - sat_pos as i32).abs())
}

/// The enabled connection of `lnb` to the card `card_mac_address`.
pub fn connection_for(lnb: &Lnb, card_mac_address: i64) -> Option<&LnbConnection> {
    lnb.connections
        .iter()
        .find(|c| c.enabled && c.card_mac_address == card_mac_address)
}

pub fn rf_path(lnb: &Lnb, conn: &LnbConnection) -> RfPath {
    RfPath {
        lnb: lnb.k,
        card_mac_address: conn.card_mac_address,
        rf_input: conn.rf_input,
    }
}

/// True if `lnb` can receive the satellite mux `mux`.
pub fn lnb_can_tune(lnb: &Lnb, mux: &AnyMux, tolerance: i16) -> bool {
    let AnyMux::Dvbs(m) = mux else {
        return false;
    };
    if !lnb.enabled || !can_receive_pol(lnb, m.pol) {
        return false;
    }
    if network_for(lnb, m.k.sat_pos, tolerance).is_none() {
        return false;
    }
    let plan = LnbPlan::of(lnb);
    plan.driver_frequency(m.frequency, plan.band(m.frequency)).is_some()
}

/// What the sequencer last set up on the LNB side.
///
/// `None` fields are unknown and must be sent again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecState {
    pub voltage: Option<Voltage>,
    pub tone: Option<Tone>,
    pub rf_input: Option<i32>,
    pub rf_path: Option<RfPath>,
    pub sat_pos: Option<SatPos>,
    /// Dish position after the last rotor command.
    pub usals_pos: Option<SatPos>,
}

impl SecState {
    /// Forget everything after a failed command.
    pub fn invalidate(&mut self) {
        let rf_input = self.rf_input;
        *self = Self {
            rf_input,
            ..Default::default()
        };
    }

    /// Set voltage then tone, skipping what is already in place.
    pub async fn apply(
        &mut self,
        fe: &dyn FrontendChannel,
        voltage: Voltage,
        tone: Tone,
        timing: &SecTiming,
    ) -> io::Result<()> {
        self.set_voltage(fe, voltage, timing).await?;
        self.set_tone(fe, tone, timing).await
    }

    pub async fn set_voltage(
        &mut self,
        fe: &dyn FrontendChannel,
        voltage: Voltage,
        timing: &SecTiming,
    ) -> io::Result<()> {
        if self.voltage == Some(voltage) {
            return Ok(());
        }
        let powering_up = matches!(self.voltage, None | Some(Voltage::Off)) && voltage != Voltage::Off;
        if let Err(e) = fe.set_voltage(voltage) {
            self.invalidate();
            return Err(e);
        }
        debug!("[Sec] adapter {} voltage {:?}", fe.adapter_no(), voltage);
        self.voltage = Some(voltage);
        if powering_up {
            settle(timing.power_up_settle_ms).await;
        }
        Ok(())
    }

    pub async fn set_tone(&mut self, fe: &dyn FrontendChannel, tone: Tone, timing: &SecTiming) -> io::Result<()> {
        if self.tone == Some(tone) {
            return Ok(());
        }
        if let Err(e) = fe.set_tone(tone) {
            self.invalidate();
            return Err(e);
        }
        debug!("[Sec] adapter {} tone {:?}", fe.adapter_no(), tone);
        self.tone = Some(tone);
        settle(timing.diseqc_settle_ms).await;
        Ok(())
    }
}

/// Pause between bus commands. Other tasks of the tuner thread keep running.
pub(crate) async fn settle(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::frontend::testing::{FeCommand, RecordingFrontend};
    use neumo_protocol::{DvbsMux, LnbKey, MuxKey};

    fn universal() -> Lnb {
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
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_universal_plan() {
        let plan = LnbPlan::of(&universal());
        assert_eq!(plan.band(11_778_000), Band::High);
        assert_eq!(plan.band(10_832_000), Band::Low);
        assert_eq!(plan.driver_frequency(11_778_000, Band::High), Some(1_178_000));
        assert_eq!(plan.driver_frequency(10_832_000, Band::Low), Some(1_082_000));
        assert_eq!(plan.driver_frequency(13_000_000, Band::High), None);
        assert_eq!(plan.sky_frequency(1_178_000, Band::High), 11_778_000);
    }

    #[test]
    fn test_c_band_is_inverted() {
        let mut lnb = universal();
        lnb.k.lnb_type = LnbType::C;
        let plan = LnbPlan::of(&lnb);
        assert_eq!(plan.band(4_000_000), Band::Low);
        assert_eq!(plan.driver_frequency(4_000_000, Band::Low), Some(1_150_000));
        assert_eq!(plan.sky_frequency(1_150_000, Band::Low), 4_000_000);
    }

    #[test]
    fn test_voltage_and_pol() {
        let mut lnb = universal();
        assert_eq!(voltage_for(&lnb, Polarisation::H), Voltage::V18);
        assert_eq!(voltage_for(&lnb, Polarisation::V), Voltage::V13);
        lnb.pol_type = LnbPolType::Vh;
        assert_eq!(voltage_for(&lnb, Polarisation::H), Voltage::V13);
        assert!(!can_receive_pol(&lnb, Polarisation::L));
    }

    #[test]
    fn test_lnb_can_tune() {
        let lnb = universal();
        let mux = AnyMux::Dvbs(DvbsMux {
            k: MuxKey {
                sat_pos: 1925,
                ..Default::default()
            },
            frequency: 11_778_000,
            pol: Polarisation::V,
            symbol_rate: 27_500_000,
            ..Default::default()
        });
        assert!(lnb_can_tune(&lnb, &mux, 30));
        assert!(!lnb_can_tune(&lnb, &mux, 2));
    }

    #[tokio::test]
    async fn test_voltage_before_tone_and_no_repeats() {
        let fe = RecordingFrontend::new();
        let timing = SecTiming::immediate();
        let mut state = SecState::default();
        state.apply(&fe, Voltage::V18, Tone::On, &timing).await.unwrap();
        state.apply(&fe, Voltage::V18, Tone::On, &timing).await.unwrap();
        assert_eq!(
            fe.commands(),
            vec![FeCommand::Voltage(Voltage::V18), FeCommand::Tone(Tone::On)]
        );

        fe.fail_next("set_tone", 5);
        assert!(state.apply(&fe, Voltage::V13, Tone::Off, &timing).await.is_err());
        assert_eq!(state.voltage, None);
    }

    #[tokio::test]
    async fn test_settle_lets_other_tasks_run() {
        let ticks = std::rc::Rc::new(std::cell::Cell::new(0));
        let counter = ticks.clone();
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                tokio::task::spawn_local(async move {
                    loop {
                        counter.set(counter.get() + 1);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                });
                settle(50).await;
            })
            .await;
        assert!(ticks.get() > 1);
    }
}
