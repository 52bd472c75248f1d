//! Which facts about the tuned mux have been confirmed by SI, and by whom.

use neumo_protocol::{ConfirmationSummary, ConfirmedBy};

/// Confirmation state of one tune attempt.
///
/// Each fact moves from `None` to a source at most once per session. Only
/// [`TuneConfirmation::clear`] returns it to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuneConfirmation {
    pub sat_by: ConfirmedBy,
    pub ts_id_by: ConfirmedBy,
    pub network_id_by: ConfirmedBy,
    /// SI repeatedly placed the tuned mux on another satellite.
    pub on_wrong_sat: bool,
    /// A sat_pos mismatch was seen once; the dish may still be moving.
    pub unstable_sat: bool,
    /// NIT_ACTUAL completed without any mux entry on a tuned-technology delivery system.
    pub nit_actual_empty: bool,
    /// NIT_ACTUAL completed but never matched the tuned carrier.
    pub nit_actual_failed: bool,
    /// SDT_ACTUAL of the tuned stream completed.
    pub sdt_actual_done: bool,
}

impl TuneConfirmation {
    /// Forget everything, optionally keeping the wrong-sat verdict across a relisten.
    pub fn clear(&mut self, preserve_wrong_sat: bool) {
        let on_wrong_sat = preserve_wrong_sat && self.on_wrong_sat;
        *self = Self {
            on_wrong_sat,
            ..Default::default()
        };
    }

    pub fn confirm_sat(&mut self, by: ConfirmedBy) -> bool {
        confirm(&mut self.sat_by, by)
    }

    pub fn confirm_ts_id(&mut self, by: ConfirmedBy) -> bool {
        confirm(&mut self.ts_id_by, by)
    }

    pub fn confirm_network_id(&mut self, by: ConfirmedBy) -> bool {
        confirm(&mut self.network_id_by, by)
    }

    pub fn all_confirmed(&self) -> bool {
        self.sat_by.is_confirmed() && self.ts_id_by.is_confirmed() && self.network_id_by.is_confirmed()
    }

    pub fn summary(&self) -> ConfirmationSummary {
        ConfirmationSummary {
            sat_by: self.sat_by,
            ts_id_by: self.ts_id_by,
            network_id_by: self.network_id_by,
            on_wrong_sat: self.on_wrong_sat,
            unstable_sat: self.unstable_sat,
        }
    }
}

fn confirm(slot: &mut ConfirmedBy, by: ConfirmedBy) -> bool {
    if slot.is_confirmed() || !by.is_confirmed() {
        return false;
    }
    *slot = by;
    true
}
