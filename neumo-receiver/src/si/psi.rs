//! PSI section header parsing, CRC validation and section assembly.

use super::packet::TsHeader;

/// PSI section header (common to all PSI tables).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsiHeader {
    pub table_id: u8,
    pub section_syntax_indicator: bool,
    /// Section length (12 bits).
    pub section_length: u16,
    /// Table ID extension (for long sections).
    pub table_id_extension: u16,
    /// Version number (5 bits).
    pub version_number: u8,
    pub current_next_indicator: bool,
    pub section_number: u8,
    pub last_section_number: u8,
}

/// A parsed PSI section.
#[derive(Debug, Clone)]
pub struct PsiSection<'a> {
    pub header: PsiHeader,
    /// Section data (after header, before CRC).
    pub data: &'a [u8],
    pub crc32: u32,
}

impl<'a> PsiSection<'a> {
    /// Parse a PSI section starting at the table_id byte.
    pub fn parse(data: &'a [u8]) -> Result<Self, &'static str> {
        if data.len() < 3 {
            return Err("Section too short for header");
        }

        let table_id = data[0];
        let section_syntax_indicator = data[1] & 0x80 != 0;
        let section_length = ((data[1] as u16 & 0x0F) << 8) | data[2] as u16;

        if section_length < 5 {
            return Err("Section length too small");
        }

        let total_length = 3 + section_length as usize;
        if data.len() < total_length {
            return Err("Incomplete section data");
        }

        let header = if section_syntax_indicator {
            if total_length < 12 {
                return Err("Section too short for extended header");
            }
            PsiHeader {
                table_id,
                section_syntax_indicator,
                section_length,
                table_id_extension: ((data[3] as u16) << 8) | data[4] as u16,
                version_number: (data[5] >> 1) & 0x1F,
                current_next_indicator: data[5] & 0x01 != 0,
                section_number: data[6],
                last_section_number: data[7],
            }
        } else {
            PsiHeader {
                table_id,
                section_syntax_indicator,
                section_length,
                table_id_extension: 0,
                version_number: 0,
                current_next_indicator: true,
                section_number: 0,
                last_section_number: 0,
            }
        };

        let data_start = if section_syntax_indicator { 8 } else { 3 };
        let data_end = total_length - 4;
        if data_end < data_start {
            return Err("No data in section");
        }

        let crc_offset = total_length - 4;
        let crc32 = u32::from_be_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);

        Ok(PsiSection {
            header,
            data: &data[data_start..data_end],
            crc32,
        })
    }

    /// Verify CRC32 of the section.
    pub fn verify_crc(&self, full_data: &[u8]) -> bool {
        let total_length = self.total_length();
        if full_data.len() < total_length {
            return false;
        }
        crc32_mpeg2(&full_data[..total_length - 4]) == self.crc32
    }

    /// Total section length including header and CRC.
    pub fn total_length(&self) -> usize {
        3 + self.header.section_length as usize
    }
}

/// Reassembles sections of one PID from TS packet payloads.
///
/// Handles pointer fields, several sections in one packet, stuffing bytes
/// and continuity errors (the partial section is dropped).
#[derive(Debug, Default)]
pub struct SectionAssembler {
    buffer: Vec<u8>,
    last_cc: Option<u8>,
    /// True while `buffer` starts at a section boundary.
    synced: bool,
}

impl SectionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_cc = None;
        self.synced = false;
    }

    /// Feed one packet payload; complete raw sections are appended to `out`.
    pub fn push(&mut self, header: &TsHeader, payload: &[u8], out: &mut Vec<Vec<u8>>) {
        let cc = header.continuity_counter;
        if let Some(last) = self.last_cc {
            if cc == last {
                // duplicate packet
                return;
            }
            if cc != (last + 1) & 0x0F {
                self.buffer.clear();
                self.synced = false;
            }
        }
        self.last_cc = Some(cc);

        let mut data = payload;
        if header.payload_unit_start {
            if data.is_empty() {
                return;
            }
            let pointer = data[0] as usize;
            data = &data[1..];
            if pointer > data.len() {
                self.buffer.clear();
                self.synced = false;
                return;
            }
            if self.synced && !self.buffer.is_empty() {
                self.buffer.extend_from_slice(&data[..pointer]);
                self.drain(out);
            }
            self.buffer.clear();
            data = &data[pointer..];
            self.synced = true;
        } else if !self.synced {
            return;
        }

        self.buffer.extend_from_slice(data);
        self.drain(out);
    }

    fn drain(&mut self, out: &mut Vec<Vec<u8>>) {
        loop {
            if self.buffer.is_empty() {
                return;
            }
            if self.buffer[0] == 0xFF {
                // stuffing until the end of the packet
                self.buffer.clear();
                self.synced = false;
                return;
            }
            if self.buffer.len() < 3 {
                return;
            }
            let len = 3 + (((self.buffer[1] as usize) & 0x0F) << 8 | self.buffer[2] as usize);
            if self.buffer.len() < len {
                return;
            }
            out.push(self.buffer[..len].to_vec());
            self.buffer.drain(..len);
        }
    }
}

/// Calculate CRC32 for MPEG-2 (polynomial 0x04C11DB7).
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    static CRC_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = (i as u32) << 24;
            let mut j = 0;
            while j < 8 {
                if crc & 0x80000000 != 0 {
                    crc = (crc << 1) ^ 0x04C11DB7;
                } else {
                    crc <<= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        let index = ((crc >> 24) ^ byte as u32) as usize;
        crc = (crc << 8) ^ CRC_TABLE[index];
    }
    crc
}

/// Builder for long-form sections, used to produce test streams.
#[derive(Debug, Clone)]
pub struct SectionBuilder {
    pub table_id: u8,
    pub table_id_extension: u16,
    pub version_number: u8,
    pub section_number: u8,
    pub last_section_number: u8,
}

impl SectionBuilder {
    pub fn new(table_id: u8, table_id_extension: u16, version_number: u8) -> Self {
        Self {
            table_id,
            table_id_extension,
            version_number,
            section_number: 0,
            last_section_number: 0,
        }
    }

    pub fn section(mut self, section_number: u8, last_section_number: u8) -> Self {
        self.section_number = section_number;
        self.last_section_number = last_section_number;
        self
    }

    /// Complete section bytes including CRC.
    pub fn build(&self, body: &[u8]) -> Vec<u8> {
        let section_length = 5 + body.len() + 4;
        let mut s = Vec::with_capacity(3 + section_length);
        s.push(self.table_id);
        s.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
        s.push(section_length as u8);
        s.extend_from_slice(&self.table_id_extension.to_be_bytes());
        s.push(0xC1 | ((self.version_number & 0x1F) << 1));
        s.push(self.section_number);
        s.push(self.last_section_number);
        s.extend_from_slice(body);
        let crc = crc32_mpeg2(&s);
        s.extend_from_slice(&crc.to_be_bytes());
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::si::packet::{build_packet, packetize_section, payload};

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32_mpeg2(&[]), 0xFFFFFFFF);
    }

    #[test]
    fn test_built_section_verifies() {
        let raw = SectionBuilder::new(0x00, 1051, 3).build(&[0x00, 0x01, 0xE1, 0x00]);
        let section = PsiSection::parse(&raw).unwrap();
        assert!(section.verify_crc(&raw));
        assert_eq!(section.header.table_id_extension, 1051);
        assert_eq!(section.header.version_number, 3);
        assert_eq!(section.data, &[0x00, 0x01, 0xE1, 0x00]);
    }

    #[test]
    fn test_assembler_multi_packet_and_stuffing() {
        let raw = SectionBuilder::new(0x42, 1, 0).build(&vec![0x55; 300]);
        let mut asm = SectionAssembler::new();
        let mut out = Vec::new();
        for pkt in packetize_section(0x11, 0, &raw) {
            let h = TsHeader::parse(&pkt).unwrap();
            asm.push(&h, payload(&h, &pkt).unwrap(), &mut out);
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], raw);
    }

    #[test]
    fn test_assembler_two_sections_in_one_packet() {
        let a = SectionBuilder::new(0x00, 1, 0).build(&[0, 1, 0xE1, 0]);
        let b = SectionBuilder::new(0x00, 1, 0).section(1, 1).build(&[0, 2, 0xE2, 0]);
        let mut body = vec![0u8];
        body.extend_from_slice(&a);
        body.extend_from_slice(&b);
        let pkt = build_packet(0, true, 0, &body);
        let h = TsHeader::parse(&pkt).unwrap();
        let mut out = Vec::new();
        SectionAssembler::new().push(&h, payload(&h, &pkt).unwrap(), &mut out);
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn test_assembler_drops_section_on_cc_error() {
        let raw = SectionBuilder::new(0x42, 1, 0).build(&vec![0x55; 300]);
        let pkts = packetize_section(0x11, 0, &raw);
        let mut asm = SectionAssembler::new();
        let mut out = Vec::new();
        for pkt in pkts.iter().step_by(2) {
            let h = TsHeader::parse(pkt).unwrap();
            asm.push(&h, payload(&h, pkt).unwrap(), &mut out);
        }
        assert!(out.is_empty());
    }
}
