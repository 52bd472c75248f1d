//! Completion bookkeeping of the SI tables of one tuning session.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use neumo_protocol::EpgType;

/// Logical table classes tracked for scan completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiTable {
    Pat,
    NitActual,
    NitOther,
    SdtActual,
    SdtOther,
    /// SDT_OTHER entries for muxes on the tuned network.
    SdtNetwork,
    Bat,
    Epg(EpgType),
}

#[derive(Debug, Clone)]
pub struct CompletionState {
    pub required_for_scan: bool,
    pub active: bool,
    pub timedout: bool,
    pub completed: bool,
    pub start_time: Instant,
    pub last_active: Option<Instant>,
    pub done_time: Option<Instant>,
}

impl CompletionState {
    fn new(required_for_scan: bool, now: Instant) -> Self {
        Self {
            required_for_scan,
            active: false,
            timedout: false,
            completed: false,
            start_time: now,
            last_active: None,
            done_time: None,
        }
    }
}

/// Per-table completion tracker.
///
/// `completed` is latched for the session: re-arming a table after it
/// completed only refreshes its activity time.
#[derive(Debug, Clone)]
pub struct ScanState {
    tables: HashMap<SiTable, CompletionState>,
    not_present: Duration,
    stalled: Duration,
}

impl ScanState {
    pub fn new(not_present: Duration, stalled: Duration) -> Self {
        Self {
            tables: HashMap::new(),
            not_present,
            stalled,
        }
    }

    pub fn reset(&mut self) {
        self.tables.clear();
    }

    /// Arm `table`. A table that is never started is irrelevant for [`Self::scan_done`].
    pub fn start(&mut self, table: SiTable, required_for_scan: bool, now: Instant) {
        self.tables
            .insert(table, CompletionState::new(required_for_scan, now));
    }

    /// Data arrived for `table`. Returns the previous active flag.
    pub fn set_active(&mut self, table: SiTable, now: Instant) -> bool {
        let st = self
            .tables
            .entry(table)
            .or_insert_with(|| CompletionState::new(false, now));
        let was_active = st.active;
        st.active = true;
        st.timedout = false;
        st.last_active = Some(now);
        was_active
    }

    pub fn set_timedout(&mut self, table: SiTable, now: Instant) {
        let st = self
            .tables
            .entry(table)
            .or_insert_with(|| CompletionState::new(false, now));
        st.timedout = true;
        st.active = true;
        st.last_active = Some(now);
    }

    /// Latch completion. Repeated calls keep the first `done_time`.
    pub fn set_completed(&mut self, table: SiTable, now: Instant) {
        let st = self
            .tables
            .entry(table)
            .or_insert_with(|| CompletionState::new(false, now));
        st.active = true;
        st.last_active = Some(now);
        if !st.completed {
            st.completed = true;
            st.done_time = Some(now);
        }
    }

    pub fn get(&self, table: SiTable) -> Option<&CompletionState> {
        self.tables.get(&table)
    }

    pub fn is_completed(&self, table: SiTable) -> bool {
        self.tables.get(&table).map_or(false, |st| st.completed)
    }

    pub fn done(&self, table: SiTable, now: Instant) -> bool {
        self.tables
            .get(&table)
            .map_or(true, |st| !st.required_for_scan || self.settled(table, now))
    }

    /// True once `table` completed, timed out, never showed up or went silent,
    /// whether or not the scan needs it.
    pub fn settled(&self, table: SiTable, now: Instant) -> bool {
        let Some(st) = self.tables.get(&table) else {
            return true;
        };
        if st.completed || st.timedout {
            return true;
        }
        match st.last_active {
            None => now.saturating_duration_since(st.start_time) > self.not_present,
            Some(last) => now.saturating_duration_since(last) > self.stalled,
        }
    }

    pub fn scan_done(&self, now: Instant) -> bool {
        self.tables
            .iter()
            .filter(|(_, st)| st.required_for_scan)
            .all(|(table, _)| self.done(*table, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ScanState {
        ScanState::new(Duration::from_secs(20), Duration::from_secs(50))
    }

    #[test]
    fn test_set_completed_is_idempotent() {
        let t0 = Instant::now();
        let mut s = state();
        s.start(SiTable::Pat, true, t0);
        s.set_completed(SiTable::Pat, t0 + Duration::from_secs(1));
        let first = s.get(SiTable::Pat).unwrap().done_time;
        assert!(s.scan_done(t0 + Duration::from_secs(1)));

        s.set_completed(SiTable::Pat, t0 + Duration::from_secs(9));
        assert_eq!(s.get(SiTable::Pat).unwrap().done_time, first);

        // re-arming never makes a completed scan undone
        s.set_active(SiTable::Pat, t0 + Duration::from_secs(10));
        assert!(s.scan_done(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_not_present_and_stalled() {
        let t0 = Instant::now();
        let mut s = state();
        s.start(SiTable::NitActual, true, t0);
        s.start(SiTable::SdtActual, true, t0);
        assert!(!s.done(SiTable::NitActual, t0 + Duration::from_secs(19)));
        assert!(s.done(SiTable::NitActual, t0 + Duration::from_secs(21)));

        s.set_active(SiTable::SdtActual, t0 + Duration::from_secs(1));
        assert!(!s.done(SiTable::SdtActual, t0 + Duration::from_secs(30)));
        assert!(s.done(SiTable::SdtActual, t0 + Duration::from_secs(52)));
    }

    #[test]
    fn test_timedout_rearms() {
        let t0 = Instant::now();
        let mut s = state();
        s.start(SiTable::Bat, true, t0);
        assert!(!s.set_active(SiTable::Bat, t0));
        s.set_timedout(SiTable::Bat, t0);
        assert!(s.done(SiTable::Bat, t0));
        assert!(s.set_active(SiTable::Bat, t0));
        assert!(!s.done(SiTable::Bat, t0));
        s.set_timedout(SiTable::Bat, t0);
        s.set_timedout(SiTable::Bat, t0);
        assert!(s.done(SiTable::Bat, t0));
    }

    #[test]
    fn test_unrequired_and_unstarted_tables_are_done() {
        let t0 = Instant::now();
        let mut s = state();
        assert!(s.done(SiTable::SdtOther, t0));
        s.start(SiTable::NitOther, false, t0);
        assert!(s.done(SiTable::NitOther, t0));
        assert!(!s.settled(SiTable::NitOther, t0));
        assert!(s.settled(SiTable::NitOther, t0 + Duration::from_secs(21)));
        assert!(s.scan_done(t0));
    }
}
