//! PAT (Program Association Table) parsing.
//!
//! The PAT is transmitted on PID 0x0000 and contains a list of programs
//! with their PMT PIDs.

use super::psi::PsiSection;
use super::table_id;

/// A single PAT entry (service id and PMT PID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatEntry {
    pub service_id: u16,
    pub pmt_pid: u16,
}

/// One decoded PAT section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatSection {
    pub ts_id: u16,
    pub entries: Vec<PatEntry>,
    /// NIT PID (if present in PAT).
    pub nit_pid: Option<u16>,
}

impl PatSection {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        if section.header.table_id != table_id::PAT {
            return Err("Not a PAT section");
        }

        let mut pat = PatSection {
            ts_id: section.header.table_id_extension,
            entries: Vec::new(),
            nit_pid: None,
        };

        // Each program entry is 4 bytes
        let data = section.data;
        if data.len() % 4 != 0 {
            return Err("Invalid PAT data length");
        }

        for chunk in data.chunks(4) {
            let program_number = ((chunk[0] as u16) << 8) | chunk[1] as u16;
            let pid = ((chunk[2] as u16 & 0x1F) << 8) | chunk[3] as u16;

            if program_number == 0 {
                pat.nit_pid = Some(pid);
            } else {
                pat.entries.push(PatEntry {
                    service_id: program_number,
                    pmt_pid: pid,
                });
            }
        }

        Ok(pat)
    }

    pub fn pmt_pid(&self, service_id: u16) -> Option<u16> {
        self.entries
            .iter()
            .find(|p| p.service_id == service_id)
            .map(|p| p.pmt_pid)
    }

    /// Section body for `entries`, used to build test streams.
    pub fn encode_body(entries: &[PatEntry]) -> Vec<u8> {
        let mut body = Vec::with_capacity(entries.len() * 4);
        for e in entries {
            body.extend_from_slice(&e.service_id.to_be_bytes());
            body.push(0xE0 | ((e.pmt_pid >> 8) as u8 & 0x1F));
            body.push(e.pmt_pid as u8);
        }
        body
    }
}
