//! Corrections for known broadcaster errors in NIT mux entries.
//!
//! Each rule is a `(predicate, correction)` pair. Rules run in table order on
//! every NIT entry before it is compared with the tuned mux.

use log::debug;
use neumo_protocol::{sat_pos, AnyMux, Polarisation, SatPos};
use serde::{Deserialize, Serialize};

/// Facts a rule may consult.
#[derive(Debug, Clone, Copy)]
pub struct FixContext<'a> {
    pub tuned: &'a AnyMux,
    /// ts_id of the stable PAT, if any.
    pub pat_ts_id: Option<u16>,
    pub is_actual: bool,
    pub sat_pos_tolerance: u16,
    pub polarisation_fixes: &'a [PolarisationFix],
}

pub struct FixupRule {
    pub name: &'static str,
    pub applies: fn(&AnyMux, &FixContext) -> bool,
    pub fix: fn(&mut AnyMux, &FixContext),
}

/// A transponder whose NIT entry carries the wrong polarisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolarisationFix {
    pub sat_pos: SatPos,
    pub network_id: u16,
    pub ts_id: u16,
    /// kHz, matched within 1 MHz.
    pub frequency: u32,
    pub declared: Polarisation,
    pub actual: Polarisation,
}

pub const BUILTIN_POLARISATION_FIXES: &[PolarisationFix] = &[
    PolarisationFix {
        sat_pos: 3000,
        network_id: 2,
        ts_id: 5,
        frequency: 11_137_000,
        declared: Polarisation::H,
        actual: Polarisation::V,
    },
    PolarisationFix {
        sat_pos: -3000,
        network_id: 49,
        ts_id: 1010,
        frequency: 12_092_000,
        declared: Polarisation::H,
        actual: Polarisation::V,
    },
];

pub static FIXUP_RULES: &[FixupRule] = &[
    FixupRule {
        name: "sat_pos_sign_flip",
        applies: sign_flip_applies,
        fix: sign_flip_fix,
    },
    FixupRule {
        name: "sat_pos_missing",
        applies: missing_sat_pos_applies,
        fix: copy_tuned_sat_pos,
    },
    FixupRule {
        name: "zero_frequency",
        applies: zero_frequency_applies,
        fix: copy_tuned_carrier,
    },
    FixupRule {
        name: "stream_id_missing",
        applies: missing_stream_id_applies,
        fix: copy_tuned_stream_id,
    },
    FixupRule {
        name: "mislabelled_polarisation",
        applies: polarisation_applies,
        fix: polarisation_fix,
    },
];

fn sat_pos_of(mux: &AnyMux) -> Option<SatPos> {
    let p = mux.key().sat_pos;
    sat_pos::is_sat(p).then_some(p)
}

fn sat_distance(a: SatPos, b: SatPos) -> u32 {
    (a as i32 - b as i32).unsigned_abs()
}

/// The tuned stream itself, recognised by the ts_id of the stable PAT.
fn describes_tuned_stream(mux: &AnyMux, ctx: &FixContext) -> bool {
    ctx.is_actual && ctx.pat_ts_id == Some(mux.common().ts_id)
}

fn sign_flip_applies(mux: &AnyMux, ctx: &FixContext) -> bool {
    let (Some(p), Some(tuned)) = (sat_pos_of(mux), sat_pos_of(ctx.tuned)) else {
        return false;
    };
    let tol = ctx.sat_pos_tolerance as u32;
    p != 0 && sat_distance(p, tuned) > tol && sat_distance(p.saturating_neg(), tuned) <= tol
}

fn sign_flip_fix(mux: &mut AnyMux, _ctx: &FixContext) {
    let k = mux.key_mut();
    k.sat_pos = k.sat_pos.saturating_neg();
}

fn missing_sat_pos_applies(mux: &AnyMux, ctx: &FixContext) -> bool {
    matches!(mux, AnyMux::Dvbs(_))
        && sat_pos_of(ctx.tuned).is_some()
        && (mux.key().sat_pos == 0 || mux.key().sat_pos == sat_pos::NONE)
        && describes_tuned_stream(mux, ctx)
}

fn copy_tuned_sat_pos(mux: &mut AnyMux, ctx: &FixContext) {
    mux.key_mut().sat_pos = ctx.tuned.key().sat_pos;
}

fn zero_frequency_applies(mux: &AnyMux, ctx: &FixContext) -> bool {
    mux.frequency() == 0 && mux.kind() == ctx.tuned.kind() && describes_tuned_stream(mux, ctx)
}

fn copy_tuned_carrier(mux: &mut AnyMux, ctx: &FixContext) {
    match (mux, ctx.tuned) {
        (AnyMux::Dvbs(m), AnyMux::Dvbs(t)) => {
            m.frequency = t.frequency;
            m.pol = t.pol;
            if m.symbol_rate == 0 {
                m.symbol_rate = t.symbol_rate;
            }
        }
        (AnyMux::Dvbc(m), AnyMux::Dvbc(t)) => {
            m.frequency = t.frequency;
            if m.symbol_rate == 0 {
                m.symbol_rate = t.symbol_rate;
            }
        }
        (AnyMux::Dvbt(m), AnyMux::Dvbt(t)) => m.frequency = t.frequency,
        _ => {}
    }
}

fn missing_stream_id_applies(mux: &AnyMux, ctx: &FixContext) -> bool {
    matches!(mux, AnyMux::Dvbs(_))
        && mux.key().stream_id < 0
        && ctx.tuned.key().stream_id >= 0
        && describes_tuned_stream(mux, ctx)
}

fn copy_tuned_stream_id(mux: &mut AnyMux, ctx: &FixContext) {
    mux.key_mut().stream_id = ctx.tuned.key().stream_id;
}

fn find_polarisation_fix<'a>(mux: &AnyMux, ctx: &FixContext<'a>) -> Option<&'a PolarisationFix> {
    let m = mux.as_dvbs()?;
    ctx.polarisation_fixes
        .iter()
        .chain(BUILTIN_POLARISATION_FIXES.iter())
        .find(|f| {
            sat_distance(f.sat_pos, m.k.sat_pos) <= ctx.sat_pos_tolerance as u32
                && f.network_id == m.c.network_id
                && f.ts_id == m.c.ts_id
                && f.frequency.abs_diff(m.frequency) <= 1000
                && f.declared == m.pol
        })
}

fn polarisation_applies(mux: &AnyMux, ctx: &FixContext) -> bool {
    find_polarisation_fix(mux, ctx).is_some()
}

fn polarisation_fix(mux: &mut AnyMux, ctx: &FixContext) {
    let Some(actual) = find_polarisation_fix(mux, ctx).map(|f| f.actual) else {
        return;
    };
    if let Some(m) = mux.as_dvbs_mut() {
        m.pol = actual;
    }
}

/// Run every rule of `rules` whose predicate holds. Returns the names of the applied rules.
pub fn apply_fixups(mux: &mut AnyMux, ctx: &FixContext, rules: &[FixupRule]) -> Vec<&'static str> {
    let mut applied = Vec::new();
    for rule in rules {
        if (rule.applies)(mux, ctx) {
            (rule.fix)(mux, ctx);
            debug!("[SiStream] fixup {} applied: {}", rule.name, mux);
            applied.push(rule.name);
        }
    }
    applied
}

/// Outcome of comparing an entry's sat_pos with the tuned one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatPosCheck {
    /// Same position, or not a satellite mux.
    Exact,
    /// Within tolerance; the entry now carries the tuned position.
    Adjusted,
    /// Too far away; the entry must not be used as tunable.
    OutOfTolerance,
}

/// Snap `mux` to `tuned_sat_pos` when it is within `tolerance`.
pub fn fix_mux(mux: &mut AnyMux, tuned_sat_pos: SatPos, tolerance: u16) -> SatPosCheck {
    let AnyMux::Dvbs(m) = mux else {
        return SatPosCheck::Exact;
    };
    if !sat_pos::is_sat(tuned_sat_pos) || m.k.sat_pos == tuned_sat_pos {
        return SatPosCheck::Exact;
    }
    if !sat_pos::is_sat(m.k.sat_pos) || sat_distance(m.k.sat_pos, tuned_sat_pos) > tolerance as u32 {
        return SatPosCheck::OutOfTolerance;
    }
    m.k.sat_pos = tuned_sat_pos;
    SatPosCheck::Adjusted
}

#[cfg(test)]
mod tests {
    use super::*;
    use neumo_protocol::{DvbsMux, DvbtMux, MuxKey};

    fn dvbs(sat: SatPos, frequency: u32, pol: Polarisation, network_id: u16, ts_id: u16) -> AnyMux {
        let mut m = DvbsMux {
            k: MuxKey {
                sat_pos: sat,
                ..Default::default()
            },
            frequency,
            pol,
            symbol_rate: 27_500_000,
            ..Default::default()
        };
        m.c.network_id = network_id;
        m.c.ts_id = ts_id;
        AnyMux::Dvbs(m)
    }

    fn ctx<'a>(tuned: &'a AnyMux, pat_ts_id: Option<u16>) -> FixContext<'a> {
        FixContext {
            tuned,
            pat_ts_id,
            is_actual: true,
            sat_pos_tolerance: 30,
            polarisation_fixes: &[],
        }
    }

    #[test]
    fn test_fix_mux_tolerance() {
        let mut near = dvbs(1910, 11_778_000, Polarisation::V, 1, 1);
        assert_eq!(fix_mux(&mut near, 1920, 30), SatPosCheck::Adjusted);
        assert_eq!(near.key().sat_pos, 1920);
        assert_eq!(fix_mux(&mut near, 1920, 30), SatPosCheck::Exact);

        let mut far = dvbs(2350, 11_778_000, Polarisation::V, 1, 1);
        assert_eq!(fix_mux(&mut far, 1920, 30), SatPosCheck::OutOfTolerance);
        assert_eq!(far.key().sat_pos, 2350);

        let mut terrestrial = AnyMux::Dvbt(DvbtMux::default());
        assert_eq!(fix_mux(&mut terrestrial, 1920, 30), SatPosCheck::Exact);
    }

    #[test]
    fn test_sign_flip() {
        let tuned = dvbs(-3000, 12_092_000, Polarisation::V, 49, 1010);
        let mut entry = dvbs(3000, 11_000_000, Polarisation::H, 49, 1011);
        let applied = apply_fixups(&mut entry, &ctx(&tuned, None), FIXUP_RULES);
        assert_eq!(applied, vec!["sat_pos_sign_flip"]);
        assert_eq!(entry.key().sat_pos, -3000);
    }

    #[test]
    fn test_zero_frequency_recovered_from_pat() {
        let tuned = dvbs(1920, 11_778_000, Polarisation::V, 1, 1051);
        let mut entry = dvbs(1920, 0, Polarisation::None, 1, 1051);
        entry.as_dvbs_mut().unwrap().symbol_rate = 0;

        // without a stable PAT nothing is known about the entry
        let mut untouched = entry.clone();
        assert!(apply_fixups(&mut untouched, &ctx(&tuned, None), FIXUP_RULES).is_empty());

        let applied = apply_fixups(&mut entry, &ctx(&tuned, Some(1051)), FIXUP_RULES);
        assert_eq!(applied, vec!["zero_frequency"]);
        assert!(entry.matches_physical(&tuned));
    }

    #[test]
    fn test_mislabelled_polarisation() {
        let tuned = dvbs(-3000, 12_092_000, Polarisation::V, 49, 1010);
        let mut entry = dvbs(-3000, 12_092_000, Polarisation::H, 49, 1010);
        apply_fixups(&mut entry, &ctx(&tuned, None), FIXUP_RULES);
        assert_eq!(entry.pol(), Polarisation::V);

        let extra = [PolarisationFix {
            sat_pos: 1920,
            network_id: 1,
            ts_id: 1051,
            frequency: 11_778_000,
            declared: Polarisation::H,
            actual: Polarisation::V,
        }];
        let tuned = dvbs(1920, 11_778_000, Polarisation::V, 1, 1051);
        let mut entry = dvbs(1920, 11_778_000, Polarisation::H, 1, 1051);
        let c = FixContext {
            polarisation_fixes: &extra,
            ..ctx(&tuned, None)
        };
        assert_eq!(apply_fixups(&mut entry, &c, FIXUP_RULES), vec!["mislabelled_polarisation"]);
        assert_eq!(entry.pol(), Polarisation::V);
    }

    #[test]
    fn test_stream_id_copied_for_tuned_stream() {
        let mut tuned = dvbs(50, 11_881_000, Polarisation::V, 318, 5);
        tuned.key_mut().stream_id = 4;
        let mut entry = dvbs(50, 11_881_000, Polarisation::V, 318, 5);
        let applied = apply_fixups(&mut entry, &ctx(&tuned, Some(5)), FIXUP_RULES);
        assert_eq!(applied, vec!["stream_id_missing"]);
        assert!(entry.matches_physical(&tuned));

        let mut other = dvbs(50, 11_900_000, Polarisation::V, 318, 6);
        assert!(apply_fixups(&mut other, &ctx(&tuned, Some(5)), FIXUP_RULES).is_empty());
        assert_eq!(other.key().stream_id, -1);
    }
}
