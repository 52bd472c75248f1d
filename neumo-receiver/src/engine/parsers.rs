//! Section parsers and the PID registry.
//!
//! A [`SectionParser`] assembles the sections of one PID and filters out
//! sections it already delivered. The [`ParserRegistry`] maps PIDs to parsers
//! with a use count; removal happens synchronously when the count drops to
//! zero.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use log::debug;
use neumo_protocol::EpgType;

use super::accumulators::SubtableInfo;
use crate::si::{table_id, PsiHeader, PsiSection, SectionAssembler, TsHeader};

/// Identifies one subtable: table_id, table_id_extension and a table
/// specific discriminator (original_network_id for SDT, onid/ts_id for EIT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubtableKey {
    pub table_id: u8,
    pub extension: u16,
    pub extra: u32,
}

impl SubtableKey {
    pub fn of(section: &PsiSection) -> Self {
        let h = &section.header;
        let d = section.data;
        let be16 = |o: usize| {
            d.get(o..o + 2)
                .map_or(0, |b| u16::from_be_bytes([b[0], b[1]]) as u32)
        };
        let extra = match h.table_id {
            table_id::SDT_ACTUAL | table_id::SDT_OTHER => be16(0),
            t if table_id::is_dvb_eit(t) => (be16(2) << 16) | be16(0),
            _ => 0,
        };
        Self {
            table_id: h.table_id,
            extension: h.table_id_extension,
            extra,
        }
    }
}

/// Which tables a PID carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserKind {
    Pat,
    Pmt,
    Nit,
    SdtBat,
    Eit(EpgType),
    /// Sky OpenTV titles or summaries.
    Sky(EpgType),
    Mhw2,
}

#[derive(Debug, Clone)]
struct SubtableState {
    version: u8,
    last_section_number: u8,
    delivered: BTreeSet<u8>,
    /// Sections that EIT segmentation says will never be sent.
    skipped: BTreeSet<u8>,
    first_seen: Instant,
    completed: bool,
    timedout_delivered: bool,
}

impl SubtableState {
    fn new(h: &PsiHeader, now: Instant) -> Self {
        Self {
            version: h.version_number,
            last_section_number: h.last_section_number,
            delivered: BTreeSet::new(),
            skipped: BTreeSet::new(),
            first_seen: now,
            completed: false,
            timedout_delivered: false,
        }
    }

    fn num_sections_present(&self) -> u32 {
        (self.last_section_number as u32 + 1).saturating_sub(self.skipped.len() as u32)
    }

    fn is_complete(&self) -> bool {
        self.delivered.len() + self.skipped.len() >= self.last_section_number as usize + 1
    }
}

/// Assembles and filters the sections of one PID.
#[derive(Debug)]
pub struct SectionParser {
    pub pid: u16,
    pub kind: ParserKind,
    assembler: SectionAssembler,
    subtables: HashMap<SubtableKey, SubtableState>,
    /// Deliver every section, also repeats of complete subtables.
    deliver_repeats: bool,
    timeout: Duration,
}

impl SectionParser {
    pub fn new(pid: u16, kind: ParserKind, timeout: Duration) -> Self {
        Self {
            pid,
            kind,
            assembler: SectionAssembler::new(),
            subtables: HashMap::new(),
            deliver_repeats: kind == ParserKind::Pat,
            timeout,
        }
    }

    /// Feed one packet of this PID; complete raw sections are appended to `out`.
    pub fn push_packet(&mut self, header: &TsHeader, payload: &[u8], out: &mut Vec<Vec<u8>>) {
        self.assembler.push(header, payload, out);
    }

    /// Decide whether `section` must be delivered. Returns its subtable info if so.
    pub fn accept(&mut self, section: &PsiSection, now: Instant) -> Option<SubtableInfo> {
        let h = &section.header;
        if !h.current_next_indicator || h.section_number > h.last_section_number {
            return None;
        }
        let key = SubtableKey::of(section);
        let st = self
            .subtables
            .entry(key)
            .or_insert_with(|| SubtableState::new(h, now));
        if st.version != h.version_number || st.last_section_number != h.last_section_number {
            if st.version != h.version_number {
                debug!(
                    "[SiStream] pid={} table 0x{:02x}/{} version {} -> {}",
                    self.pid, h.table_id, h.table_id_extension, st.version, h.version_number
                );
            }
            *st = SubtableState::new(h, now);
        }
        if st.delivered.contains(&h.section_number) && !self.deliver_repeats {
            return None;
        }
        st.delivered.insert(h.section_number);
        st.skipped.remove(&h.section_number);

        if table_id::is_dvb_eit(h.table_id) {
            if let Some(&segment_last) = section.data.get(4) {
                let segment_end = (h.section_number | 0x07).min(h.last_section_number);
                if segment_last >= h.section_number && segment_last < segment_end {
                    for n in segment_last + 1..=segment_end {
                        if !st.delivered.contains(&n) {
                            st.skipped.insert(n);
                        }
                    }
                }
            }
        }

        let complete = st.is_complete();
        if complete {
            st.completed = true;
        }
        Some(SubtableInfo {
            table_id: h.table_id,
            version_number: h.version_number,
            pid: self.pid,
            section_number: h.section_number,
            num_sections_present: st.num_sections_present(),
            timedout: false,
            complete,
        })
    }

    /// Forget what was delivered for `key` so that it is delivered again.
    pub fn forget(&mut self, key: &SubtableKey) {
        self.subtables.remove(key);
    }

    pub fn forget_all(&mut self) {
        self.subtables.clear();
        self.assembler.clear();
    }

    /// Subtables that did not complete within the window. Each is reported once.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<(SubtableKey, SubtableInfo)> {
        if self.deliver_repeats {
            return Vec::new();
        }
        let mut out = Vec::new();
        for (key, st) in self.subtables.iter_mut() {
            if st.completed
                || st.timedout_delivered
                || now.saturating_duration_since(st.first_seen) < self.timeout
            {
                continue;
            }
            st.timedout_delivered = true;
            out.push((
                *key,
                SubtableInfo {
                    table_id: key.table_id,
                    version_number: st.version,
                    pid: self.pid,
                    section_number: st.delivered.iter().next_back().copied().unwrap_or(0),
                    num_sections_present: st.num_sections_present(),
                    timedout: true,
                    complete: false,
                },
            ));
        }
        out.sort_by_key(|(k, _)| *k);
        out
    }
}

struct Registered {
    parser: SectionParser,
    use_count: u32,
}

/// Parsers by PID, reference counted.
pub struct ParserRegistry {
    parsers: HashMap<u16, Registered>,
    timeout: Duration,
}

impl ParserRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            parsers: HashMap::new(),
            timeout,
        }
    }

    /// Register a user of `pid`. Returns the new use count.
    pub fn register(&mut self, pid: u16, kind: ParserKind) -> u32 {
        let timeout = self.timeout;
        let r = self.parsers.entry(pid).or_insert_with(|| {
            debug!("[SiStream] add parser pid={} {:?}", pid, kind);
            Registered {
                parser: SectionParser::new(pid, kind, timeout),
                use_count: 0,
            }
        });
        r.use_count += 1;
        r.use_count
    }

    /// Drop one user of `pid`. Returns true if the parser was removed.
    pub fn unregister(&mut self, pid: u16) -> bool {
        let Some(r) = self.parsers.get_mut(&pid) else {
            return false;
        };
        r.use_count = r.use_count.saturating_sub(1);
        if r.use_count == 0 {
            self.parsers.remove(&pid);
            debug!("[SiStream] removed parser pid={}", pid);
            return true;
        }
        false
    }

    pub fn get_mut(&mut self, pid: u16) -> Option<&mut SectionParser> {
        self.parsers.get_mut(&pid).map(|r| &mut r.parser)
    }

    pub fn contains(&self, pid: u16) -> bool {
        self.parsers.contains_key(&pid)
    }

    pub fn use_count(&self, pid: u16) -> u32 {
        self.parsers.get(&pid).map_or(0, |r| r.use_count)
    }

    pub fn pids(&self) -> Vec<u16> {
        let mut pids: Vec<u16> = self.parsers.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn clear(&mut self) {
        self.parsers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::si::psi::SectionBuilder;

    fn accept(p: &mut SectionParser, raw: &[u8], now: Instant) -> Option<SubtableInfo> {
        p.accept(&PsiSection::parse(raw).unwrap(), now)
    }

    #[test]
    fn test_repeats_are_filtered_until_forgotten() {
        let now = Instant::now();
        let mut p = SectionParser::new(0x11, ParserKind::SdtBat, Duration::from_secs(15));
        let s0 = SectionBuilder::new(table_id::SDT_ACTUAL, 1051, 3).section(0, 1).build(&[0, 1, 0xFF]);
        let s1 = SectionBuilder::new(table_id::SDT_ACTUAL, 1051, 3).section(1, 1).build(&[0, 1, 0xFF]);

        let info = accept(&mut p, &s0, now).unwrap();
        assert_eq!(info.num_sections_present, 2);
        assert!(!info.complete);
        assert!(accept(&mut p, &s0, now).is_none());
        assert!(accept(&mut p, &s1, now).unwrap().complete);
        assert!(accept(&mut p, &s1, now).is_none());

        p.forget(&SubtableKey::of(&PsiSection::parse(&s0).unwrap()));
        assert!(accept(&mut p, &s1, now).is_some());

        // a new version is always delivered
        let v4 = SectionBuilder::new(table_id::SDT_ACTUAL, 1051, 4).section(0, 1).build(&[0, 1, 0xFF]);
        assert_eq!(accept(&mut p, &v4, now).unwrap().version_number, 4);
    }

    #[test]
    fn test_sdt_subtables_differ_by_network() {
        let now = Instant::now();
        let mut p = SectionParser::new(0x11, ParserKind::SdtBat, Duration::from_secs(15));
        let a = SectionBuilder::new(table_id::SDT_OTHER, 99, 0).build(&[0, 7, 0xFF]);
        let b = SectionBuilder::new(table_id::SDT_OTHER, 99, 0).build(&[0, 8, 0xFF]);
        assert!(accept(&mut p, &a, now).is_some());
        assert!(accept(&mut p, &b, now).is_some());
    }

    #[test]
    fn test_eit_segment_gaps_count_as_present() {
        let now = Instant::now();
        let mut p = SectionParser::new(0x12, ParserKind::Eit(EpgType::Dvb), Duration::from_secs(15));
        // sections 0 and 8 of 0..=15, each segment holds only its first section
        let body = |seg_last: u8| [0x04, 0x1B, 0x00, 0x01, seg_last, 0x50];
        let s0 = SectionBuilder::new(0x50, 100, 1).section(0, 15).build(&body(0));
        let s8 = SectionBuilder::new(0x50, 100, 1).section(8, 15).build(&body(8));

        let info = accept(&mut p, &s0, now).unwrap();
        assert_eq!(info.num_sections_present, 9);
        assert!(!info.complete);
        let info = accept(&mut p, &s8, now).unwrap();
        assert_eq!(info.num_sections_present, 2);
        assert!(info.complete);
    }

    #[test]
    fn test_pat_parser_delivers_repeats() {
        let now = Instant::now();
        let mut p = SectionParser::new(0, ParserKind::Pat, Duration::from_secs(15));
        let pat = SectionBuilder::new(table_id::PAT, 1, 0).build(&[0, 1, 0xE1, 0x00]);
        assert!(accept(&mut p, &pat, now).is_some());
        assert!(accept(&mut p, &pat, now).is_some());
        assert!(p.poll_timeouts(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_timeout_is_reported_once() {
        let t0 = Instant::now();
        let mut p = SectionParser::new(0x10, ParserKind::Nit, Duration::from_secs(15));
        let s0 = SectionBuilder::new(table_id::NIT_ACTUAL, 1, 0).section(0, 2).build(&[0xF0, 0, 0xF0, 0]);
        accept(&mut p, &s0, t0);
        assert!(p.poll_timeouts(t0 + Duration::from_secs(5)).is_empty());
        let timed = p.poll_timeouts(t0 + Duration::from_secs(16));
        assert_eq!(timed.len(), 1);
        assert!(timed[0].1.timedout);
        assert!(p.poll_timeouts(t0 + Duration::from_secs(17)).is_empty());
    }

    #[test]
    fn test_registry_use_counts() {
        let mut r = ParserRegistry::new(Duration::from_secs(15));
        assert_eq!(r.register(0x100, ParserKind::Pmt), 1);
        assert_eq!(r.register(0x100, ParserKind::Pmt), 2);
        assert!(!r.unregister(0x100));
        assert!(r.contains(0x100));
        assert!(r.unregister(0x100));
        assert!(!r.contains(0x100));
        assert!(!r.unregister(0x100));
        assert_eq!(r.use_count(0x100), 0);
    }
}
