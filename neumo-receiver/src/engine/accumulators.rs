//! Per-table accumulation of versioned subtables.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use neumo_protocol::{EpgRecord, ServiceKey};

use super::parsers::SubtableKey;
use crate::si::{BatTransportStream, NitEntry, PatEntry, PmtSection, SdtService};

/// What the section parser knows about the subtable a section belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubtableInfo {
    pub table_id: u8,
    pub version_number: u8,
    pub pid: u16,
    pub section_number: u8,
    /// Sections the subtable consists of, minus those skipped by EIT segment gaps.
    pub num_sections_present: u32,
    /// The subtable did not complete within its window.
    pub timedout: bool,
    /// Every present section has now been delivered.
    pub complete: bool,
}

/// Fragments of one subtable, collected for the current version.
#[derive(Debug, Clone)]
pub struct Subtable<T> {
    version: Option<u8>,
    entries: Vec<T>,
    num_sections_processed: u32,
}

impl<T> Default for Subtable<T> {
    fn default() -> Self {
        Self {
            version: None,
            entries: Vec::new(),
            num_sections_processed: 0,
        }
    }
}

impl<T> Subtable<T> {
    /// Add the entries of one section. Returns true when a version change
    /// discarded what was collected before.
    pub fn add_section<I: IntoIterator<Item = T>>(&mut self, info: &SubtableInfo, entries: I) -> bool {
        let bumped = matches!(self.version, Some(v) if v != info.version_number);
        if bumped {
            self.restart();
        }
        self.version = Some(info.version_number);
        self.entries.extend(entries);
        self.num_sections_processed += 1;
        bumped
    }

    /// Start collecting the same version again.
    pub fn restart(&mut self) {
        self.entries.clear();
        self.num_sections_processed = 0;
    }

    pub fn reset(&mut self) {
        self.restart();
        self.version = None;
    }

    pub fn is_complete(&self, info: &SubtableInfo) -> bool {
        info.timedout
            || (self.num_sections_processed > 0
                && self.num_sections_processed >= info.num_sections_present)
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn version(&self) -> Option<u8> {
        self.version
    }

    pub fn num_sections_processed(&self) -> u32 {
        self.num_sections_processed
    }
}

/// Result of adding a PAT section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatUpdate {
    /// More sections are needed.
    Incomplete,
    /// A complete read matched the previous one or was the first one.
    Completed { first: bool, became_stable: bool },
    /// Two complete reads of the same version differ.
    Changed,
}

#[derive(Debug, Clone, Default)]
struct PatTable {
    sub: Subtable<PatEntry>,
    sections: BTreeSet<u8>,
    last_complete: Option<Vec<PatEntry>>,
    stable_since: Option<Instant>,
    stable: bool,
}

/// PAT reads per ts_id and their stability.
#[derive(Debug, Clone)]
pub struct PatData {
    tables: HashMap<u16, PatTable>,
    current_ts_id: Option<u16>,
    hold: Duration,
}

impl PatData {
    pub fn new(hold: Duration) -> Self {
        Self {
            tables: HashMap::new(),
            current_ts_id: None,
            hold,
        }
    }

    pub fn reset(&mut self) {
        self.tables.clear();
        self.current_ts_id = None;
    }

    pub fn add_section(
        &mut self,
        ts_id: u16,
        info: &SubtableInfo,
        entries: &[PatEntry],
        now: Instant,
    ) -> PatUpdate {
        let t = self.tables.entry(ts_id).or_default();
        // a repeated section number starts a new read of the table
        if t.sections.contains(&info.section_number) {
            t.sub.restart();
            t.sections.clear();
        }
        if t.sub.add_section(info, entries.iter().copied()) {
            t.sections.clear();
            t.last_complete = None;
            t.stable_since = None;
            t.stable = false;
        }
        t.sections.insert(info.section_number);
        if !t.sub.is_complete(info) {
            return PatUpdate::Incomplete;
        }

        let mut content = t.sub.entries().to_vec();
        content.sort();
        content.dedup();
        t.sub.restart();
        t.sections.clear();

        let first = match &t.last_complete {
            None => {
                t.last_complete = Some(content);
                t.stable_since = Some(now);
                true
            }
            Some(prev) if *prev == content => false,
            Some(_) => return PatUpdate::Changed,
        };
        self.current_ts_id = Some(ts_id);

        let mut became_stable = false;
        if !t.stable {
            let since = t.stable_since.unwrap_or(now);
            if now.saturating_duration_since(since) >= self.hold {
                t.stable = true;
                became_stable = true;
            }
        }
        PatUpdate::Completed { first, became_stable }
    }

    /// True once the PAT of the current stream was unchanged for the hold time.
    pub fn stable_pat(&self) -> bool {
        self.current()
            .map_or(false, |t| t.stable)
    }

    /// ts_id of the most recently completed PAT.
    pub fn ts_id(&self) -> Option<u16> {
        self.current_ts_id
    }

    /// Entries of the last complete read of the current PAT.
    pub fn entries(&self) -> &[PatEntry] {
        self.current()
            .and_then(|t| t.last_complete.as_deref())
            .unwrap_or(&[])
    }

    fn current(&self) -> Option<&PatTable> {
        self.current_ts_id.and_then(|ts_id| self.tables.get(&ts_id))
    }
}

/// NIT subtables keyed by `(table_id, network_id)`.
#[derive(Debug, Clone, Default)]
pub struct NitData {
    pub subtables: HashMap<(u8, u16), Subtable<NitEntry>>,
    pub network_names: HashMap<u16, String>,
    /// network_id of the first NIT_ACTUAL seen.
    pub actual_network_id: Option<u16>,
}

impl NitData {
    pub fn subtable(&mut self, table_id: u8, network_id: u16) -> &mut Subtable<NitEntry> {
        self.subtables.entry((table_id, network_id)).or_default()
    }

    pub fn reset_subtable(&mut self, table_id: u8, network_id: u16) {
        if let Some(s) = self.subtables.get_mut(&(table_id, network_id)) {
            s.reset();
        }
    }
}

/// SDT subtables keyed by `(table_id, network_id, ts_id)`.
#[derive(Debug, Clone, Default)]
pub struct SdtData {
    pub subtables: HashMap<(u8, u16, u16), Subtable<SdtService>>,
    /// `(network_id, ts_id)` whose SDT completed this session.
    pub completed: HashSet<(u16, u16)>,
}

impl SdtData {
    pub fn subtable(&mut self, table_id: u8, network_id: u16, ts_id: u16) -> &mut Subtable<SdtService> {
        self.subtables.entry((table_id, network_id, ts_id)).or_default()
    }

    pub fn reset_subtable(&mut self, table_id: u8, network_id: u16, ts_id: u16) {
        if let Some(s) = self.subtables.get_mut(&(table_id, network_id, ts_id)) {
            s.reset();
        }
    }
}

/// BAT subtables keyed by bouquet_id.
#[derive(Debug, Clone, Default)]
pub struct BatData {
    pub subtables: HashMap<u16, Subtable<BatTransportStream>>,
    pub names: HashMap<u16, String>,
    /// Broadcaster channel ids resolved to services, used by Sky EPG.
    pub channel_services: HashMap<u32, ServiceKey>,
}

impl BatData {
    pub fn subtable(&mut self, bouquet_id: u16) -> &mut Subtable<BatTransportStream> {
        self.subtables.entry(bouquet_id).or_default()
    }
}

/// EPG bookkeeping of all variants.
#[derive(Debug, Clone, Default)]
pub struct EitData {
    /// EIT subtables with sections still missing.
    pub incomplete: HashSet<SubtableKey>,
    pub any_completed: bool,
    pub events_saved: usize,
    /// Sky titles by `(channel_id, event_id)` waiting for their summary.
    pub sky_titles: HashMap<(u16, u16), EpgRecord>,
    /// MHW2 titles by event_id.
    pub mhw2_titles: HashMap<u32, EpgRecord>,
}

impl EitData {
    /// Record the completion state of one subtable. Returns true when no
    /// subtable seen so far is missing sections.
    pub fn track(&mut self, key: SubtableKey, info: &SubtableInfo) -> bool {
        if info.complete || info.timedout {
            self.incomplete.remove(&key);
            self.any_completed = true;
        } else {
            self.incomplete.insert(key);
        }
        self.any_completed && self.incomplete.is_empty()
    }
}

/// PMTs received this session.
#[derive(Debug, Clone, Default)]
pub struct PmtData {
    pub by_service: HashMap<u16, PmtSection>,
    /// PIDs carrying T2MI found in PMTs.
    pub t2mi_pids: HashSet<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(version: u8, section: u8, present: u32) -> SubtableInfo {
        SubtableInfo {
            table_id: 0,
            version_number: version,
            section_number: section,
            num_sections_present: present,
            ..Default::default()
        }
    }

    #[test]
    fn test_version_bump_clears_accumulation() {
        let mut sub: Subtable<u16> = Subtable::default();
        assert!(!sub.add_section(&info(3, 0, 2), [1, 2]));
        assert_eq!(sub.num_sections_processed(), 1);
        assert!(!sub.is_complete(&info(3, 0, 2)));

        assert!(sub.add_section(&info(4, 1, 2), [7]));
        assert_eq!(sub.entries(), &[7]);
        assert_eq!(sub.num_sections_processed(), 1);
        assert_eq!(sub.version(), Some(4));

        sub.add_section(&info(4, 0, 2), [8]);
        assert!(sub.is_complete(&info(4, 0, 2)));
    }

    #[test]
    fn test_timedout_subtable_is_complete() {
        let sub: Subtable<u16> = Subtable::default();
        let mut i = info(1, 0, 4);
        assert!(!sub.is_complete(&i));
        i.timedout = true;
        assert!(sub.is_complete(&i));
    }

    fn pat_entries(ids: &[u16]) -> Vec<PatEntry> {
        ids.iter()
            .map(|&service_id| PatEntry {
                service_id,
                pmt_pid: 0x100 + service_id,
            })
            .collect()
    }

    #[test]
    fn test_pat_becomes_stable_after_hold() {
        let t0 = Instant::now();
        let mut pat = PatData::new(Duration::from_secs(5));
        let entries = pat_entries(&[1, 2]);

        let u = pat.add_section(1051, &info(0, 0, 1), &entries, t0);
        assert_eq!(u, PatUpdate::Completed { first: true, became_stable: false });
        assert!(!pat.stable_pat());

        pat.add_section(1051, &info(0, 0, 1), &entries, t0 + Duration::from_secs(2));
        assert!(!pat.stable_pat());

        let u = pat.add_section(1051, &info(0, 0, 1), &entries, t0 + Duration::from_secs(6));
        assert_eq!(u, PatUpdate::Completed { first: false, became_stable: true });
        assert!(pat.stable_pat());
        assert_eq!(pat.ts_id(), Some(1051));
        assert_eq!(pat.entries().len(), 2);
    }

    #[test]
    fn test_pat_change_and_version_bump() {
        let t0 = Instant::now();
        let mut pat = PatData::new(Duration::from_secs(5));
        pat.add_section(1, &info(0, 0, 1), &pat_entries(&[1, 2]), t0);
        assert_eq!(
            pat.add_section(1, &info(0, 0, 1), &pat_entries(&[1, 3]), t0),
            PatUpdate::Changed
        );

        let mut pat = PatData::new(Duration::from_secs(5));
        pat.add_section(1, &info(0, 0, 1), &pat_entries(&[1, 2]), t0);
        let u = pat.add_section(1, &info(1, 0, 1), &pat_entries(&[1, 3]), t0 + Duration::from_secs(6));
        assert_eq!(u, PatUpdate::Completed { first: true, became_stable: false });
    }

    #[test]
    fn test_pat_multi_section_read() {
        let t0 = Instant::now();
        let mut pat = PatData::new(Duration::ZERO);
        assert_eq!(
            pat.add_section(1, &info(0, 0, 2), &pat_entries(&[1]), t0),
            PatUpdate::Incomplete
        );
        // section 0 again before section 1: start over
        assert_eq!(
            pat.add_section(1, &info(0, 0, 2), &pat_entries(&[1]), t0),
            PatUpdate::Incomplete
        );
        let u = pat.add_section(1, &info(0, 1, 2), &pat_entries(&[2]), t0);
        assert_eq!(u, PatUpdate::Completed { first: true, became_stable: true });
        assert_eq!(pat.entries(), pat_entries(&[1, 2]).as_slice());
    }
}
