//! PMT (Program Map Table) parsing.

use super::descriptors::{descriptors, find_extension, T2miDescriptor};
use super::psi::PsiSection;
use super::{descriptor_tag, table_id};

/// One elementary stream of a program.
#[derive(Debug, Clone, PartialEq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub pid: u16,
    /// ES info descriptors (raw).
    pub descriptors: Vec<u8>,
}

impl PmtStream {
    pub fn is_video(&self) -> bool {
        matches!(self.stream_type, 0x01 | 0x02 | 0x10 | 0x1B | 0x24 | 0x42)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PmtSection {
    pub service_id: u16,
    pub version_number: u8,
    /// False for a "next" PMT which is not yet applicable.
    pub current_next: bool,
    pub pcr_pid: u16,
    pub program_descriptors: Vec<u8>,
    pub streams: Vec<PmtStream>,
}

impl PmtSection {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        if section.header.table_id != table_id::PMT {
            return Err("Not a PMT section");
        }
        let data = section.data;
        if data.len() < 4 {
            return Err("PMT data too short");
        }
        let pcr_pid = ((data[0] as u16 & 0x1F) << 8) | data[1] as u16;
        let program_info_length = ((data[2] as usize & 0x0F) << 8) | data[3] as usize;
        if data.len() < 4 + program_info_length {
            return Err("Invalid program info length");
        }
        let program_descriptors = data[4..4 + program_info_length].to_vec();

        let mut streams = Vec::new();
        let mut offset = 4 + program_info_length;
        while offset + 5 <= data.len() {
            let stream_type = data[offset];
            let pid = ((data[offset + 1] as u16 & 0x1F) << 8) | data[offset + 2] as u16;
            let es_info_length = ((data[offset + 3] as usize & 0x0F) << 8) | data[offset + 4] as usize;
            offset += 5;
            if offset + es_info_length > data.len() {
                return Err("Invalid ES info length");
            }
            streams.push(PmtStream {
                stream_type,
                pid,
                descriptors: data[offset..offset + es_info_length].to_vec(),
            });
            offset += es_info_length;
        }

        Ok(PmtSection {
            service_id: section.header.table_id_extension,
            version_number: section.header.version_number,
            current_next: section.header.current_next_indicator,
            pcr_pid,
            program_descriptors,
            streams,
        })
    }

    /// PID and parameters of an embedded T2MI stream, if the program carries one.
    pub fn t2mi_stream(&self) -> Option<(u16, T2miDescriptor)> {
        self.streams.iter().find_map(|s| {
            let ext = find_extension(&s.descriptors, descriptor_tag::ext::T2MI)?;
            T2miDescriptor::parse(ext).ok().map(|d| (s.pid, d))
        })
    }

    pub fn video_pid(&self) -> Option<u16> {
        self.streams.iter().find(|s| s.is_video()).map(|s| s.pid)
    }

    /// True if any CA descriptor is present.
    pub fn is_encrypted(&self) -> bool {
        let has_ca = |d: &[u8]| descriptors(d).any(|(t, _)| t == descriptor_tag::CA);
        has_ca(&self.program_descriptors) || self.streams.iter().any(|s| has_ca(&s.descriptors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::si::psi::SectionBuilder;

    #[test]
    fn test_parse_pmt_with_t2mi() {
        let body = [
            0xE1, 0x00, // PCR PID 0x100
            0xF0, 0x06, // program info length
            0x09, 0x04, 0x01, 0x00, 0xE5, 0x00, // CA descriptor
            0x1B, 0xE1, 0x00, 0xF0, 0x00, // H.264 video on 0x100
            0x06, 0xE1, 0x0F, 0xF0, 0x06, // private data on 0x10F
            0x7F, 0x04, 0x11, 0x01, 0x00, 0x00, // T2MI descriptor, stream id 1
        ];
        let raw = SectionBuilder::new(table_id::PMT, 4, 0).build(&body);
        let section = PsiSection::parse(&raw).unwrap();
        let pmt = PmtSection::parse(&section).unwrap();

        assert_eq!(pmt.service_id, 4);
        assert_eq!(pmt.pcr_pid, 0x100);
        assert_eq!(pmt.streams.len(), 2);
        assert_eq!(pmt.video_pid(), Some(0x100));
        assert!(pmt.is_encrypted());
        let (pid, d) = pmt.t2mi_stream().unwrap();
        assert_eq!(pid, 0x10F);
        assert_eq!(d.t2mi_stream_id, 1);
        assert_eq!(d.num_t2mi_streams, 1);
    }

    #[test]
    fn test_pmt_without_t2mi() {
        let body = [0xE1, 0x00, 0xF0, 0x00, 0x04, 0xE1, 0x01, 0xF0, 0x00];
        let raw = SectionBuilder::new(table_id::PMT, 9, 2).build(&body);
        let pmt = PmtSection::parse(&PsiSection::parse(&raw).unwrap()).unwrap();
        assert!(pmt.t2mi_stream().is_none());
        assert!(!pmt.is_encrypted());
        assert_eq!(pmt.video_pid(), None);
    }
}
