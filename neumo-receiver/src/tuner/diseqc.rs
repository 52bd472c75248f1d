//! DiSEqC command strings.
//!
//! An LNB connection carries a tune string such as `"UCW"`. Each letter is one
//! bus operation:
//!
//! | letter | operation |
//! |---|---|
//! | `M` | mini DiSEqC tone burst |
//! | `C` | committed switch (DiSEqC 1.0) |
//! | `U` | uncommitted switch (DiSEqC 1.1) |
//! | `P` | rotor goto stored position (DiSEqC 1.2) |
//! | `X` | rotor goto angle (USALS) |
//! | `W` | fixed pause |
//!
//! [`plan`] expands a string into the concrete [`DiseqcStep`]s to send.

use neumo_protocol::{Band, SatPos};

use super::dtv::Burst;
use super::TuneError;

const FRAMING_FIRST: u8 = 0xE0;
const FRAMING_REPEAT: u8 = 0xE1;
const ADDR_ANY_LNB: u8 = 0x10;
const ADDR_POSITIONER: u8 = 0x31;
const CMD_WRITE_N0: u8 = 0x38;
const CMD_WRITE_N1: u8 = 0x39;
const CMD_GOTO_NN: u8 = 0x6B;
const CMD_GOTO_X: u8 = 0x6E;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiseqcOp {
    MiniBurst,
    Committed,
    Uncommitted,
    Preset,
    Usals,
    Pause,
}

impl DiseqcOp {
    pub fn is_rotor(self) -> bool {
        matches!(self, DiseqcOp::Preset | DiseqcOp::Usals)
    }
}

pub fn parse_tune_string(s: &str) -> Result<Vec<DiseqcOp>, TuneError> {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c.to_ascii_uppercase() {
            'M' => Ok(DiseqcOp::MiniBurst),
            'C' => Ok(DiseqcOp::Committed),
            'U' => Ok(DiseqcOp::Uncommitted),
            'P' => Ok(DiseqcOp::Preset),
            'X' => Ok(DiseqcOp::Usals),
            'W' => Ok(DiseqcOp::Pause),
            other => Err(TuneError::BadParameters(format!(
                "unknown letter '{other}' in DiSEqC string \"{s}\""
            ))),
        })
        .collect()
}

/// One action on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiseqcStep {
    Message(Vec<u8>),
    Burst(Burst),
    PauseMs(u64),
}

/// Everything needed to turn letters into messages.
#[derive(Debug, Clone, Default)]
pub struct DiseqcContext {
    /// Committed switch port, negative when absent.
    pub committed: i8,
    /// Uncommitted switch port, negative when absent.
    pub uncommitted: i8,
    pub high_voltage: bool,
    pub band: Band,
    /// Stored positioner slot, negative when absent.
    pub preset: i16,
    /// Rotor angle in degrees, when the dish must move.
    pub usals_angle: Option<f64>,
    /// Send rotor commands at all.
    pub move_rotor: bool,
    pub pause_ms: u64,
    /// Extra repetitions of switch commands.
    pub repeats: u8,
}

pub fn committed_cmd(port: u8, high_voltage: bool, band: Band) -> Vec<u8> {
    let mut data = 0xF0 | ((port & 0x03) << 2);
    if high_voltage {
        data |= 0x02;
    }
    if band == Band::High {
        data |= 0x01;
    }
    vec![FRAMING_FIRST, ADDR_ANY_LNB, CMD_WRITE_N0, data]
}

pub fn uncommitted_cmd(port: u8) -> Vec<u8> {
    vec![FRAMING_FIRST, ADDR_ANY_LNB, CMD_WRITE_N1, 0xF0 | (port & 0x0F)]
}

pub fn goto_preset_cmd(slot: u8) -> Vec<u8> {
    vec![FRAMING_FIRST, ADDR_POSITIONER, CMD_GOTO_NN, slot]
}

/// USALS goto; positive angles turn east.
pub fn usals_goto_cmd(angle: f64) -> Vec<u8> {
    const TENTHS: [u8; 10] = [0x00, 0x02, 0x03, 0x05, 0x06, 0x08, 0x0A, 0x0B, 0x0D, 0x0E];
    let abs = angle.abs().min(90.0);
    let mut whole = abs.trunc() as u16;
    let mut tenth = ((abs - abs.trunc()) * 10.0).round() as usize;
    if tenth >= 10 {
        whole += 1;
        tenth = 0;
    }
    let direction = if angle < 0.0 { 0xD0 } else { 0xE0 };
    let hi = direction | ((whole >> 4) as u8 & 0x0F);
    let lo = (((whole & 0x0F) as u8) << 4) | TENTHS[tenth];
    vec![FRAMING_FIRST, ADDR_POSITIONER, CMD_GOTO_X, hi, lo]
}

/// Polar mount hour angle for a satellite at `sat_pos`, seen from the site.
/// All positions in 1/100 degree, east and north positive.
pub fn usals_angle(sat_pos: SatPos, site_latitude: i32, site_longitude: i32) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6378.14;
    const ORBIT_RADIUS_KM: f64 = 42164.2;
    let lat = (site_latitude as f64 / 100.0).to_radians();
    let dlong = ((sat_pos as f64 - site_longitude as f64) / 100.0).to_radians();
    let angle = dlong
        .sin()
        .atan2(dlong.cos() - EARTH_RADIUS_KM / ORBIT_RADIUS_KM * lat.cos());
    angle.to_degrees()
}

fn with_repeats(steps: &mut Vec<DiseqcStep>, msg: Vec<u8>, repeats: u8) {
    let mut repeated = msg.clone();
    steps.push(DiseqcStep::Message(msg));
    repeated[0] = FRAMING_REPEAT;
    for _ in 0..repeats {
        steps.push(DiseqcStep::Message(repeated.clone()));
    }
}

/// Expand `ops` into bus steps.
///
/// Switch letters without a configured port are skipped, rotor letters are
/// skipped unless the dish must move, and a step equal to the one just
/// before it is dropped.
pub fn plan(ops: &[DiseqcOp], ctx: &DiseqcContext) -> Vec<DiseqcStep> {
    let mut steps: Vec<DiseqcStep> = Vec::new();
    for op in ops {
        let mut next = Vec::new();
        match op {
            DiseqcOp::MiniBurst => {
                let burst = if ctx.committed > 0 && ctx.committed % 2 == 1 {
                    Burst::B
                } else {
                    Burst::A
                };
                next.push(DiseqcStep::Burst(burst));
            }
            DiseqcOp::Committed if ctx.committed >= 0 => with_repeats(
                &mut next,
                committed_cmd(ctx.committed as u8, ctx.high_voltage, ctx.band),
                ctx.repeats,
            ),
            DiseqcOp::Uncommitted if ctx.uncommitted >= 0 => {
                with_repeats(&mut next, uncommitted_cmd(ctx.uncommitted as u8), ctx.repeats)
            }
            DiseqcOp::Preset if ctx.move_rotor && ctx.preset >= 0 => {
                next.push(DiseqcStep::Message(goto_preset_cmd(ctx.preset as u8)))
            }
            DiseqcOp::Usals if ctx.move_rotor => {
                if let Some(angle) = ctx.usals_angle {
                    next.push(DiseqcStep::Message(usals_goto_cmd(angle)));
                }
            }
            DiseqcOp::Pause => next.push(DiseqcStep::PauseMs(ctx.pause_ms)),
            _ => {}
        }
        if let (Some(first), Some(last)) = (next.first(), steps.last()) {
            if first == last {
                continue;
            }
        }
        steps.extend(next);
    }
    steps
}

/// True if `ops` contains a rotor letter.
pub fn moves_rotor(ops: &[DiseqcOp]) -> bool {
    ops.iter().any(|op| op.is_rotor())
}
