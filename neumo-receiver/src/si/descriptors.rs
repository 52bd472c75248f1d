//! Descriptor parsing for PSI/SI tables.
//!
//! This module handles parsing of the descriptors found in NIT, SDT, BAT,
//! EIT and PMT loops.

use neumo_protocol::{CodeRate, GuardInterval, Modulation, Polarisation, RollOff, TransmissionMode};

use super::descriptor_tag;
use super::text::decode_dvb_string;

/// Iterate over a descriptor loop as `(tag, payload)` pairs.
///
/// A truncated trailing descriptor ends the iteration.
pub fn descriptors(data: &[u8]) -> DescriptorIter<'_> {
    DescriptorIter { data }
}

pub struct DescriptorIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 2 {
            return None;
        }
        let tag = self.data[0];
        let len = self.data[1] as usize;
        if self.data.len() < 2 + len {
            self.data = &[];
            return None;
        }
        let payload = &self.data[2..2 + len];
        self.data = &self.data[2 + len..];
        Some((tag, payload))
    }
}

/// Find the first descriptor with `tag`.
pub fn find_descriptor(data: &[u8], tag: u8) -> Option<&[u8]> {
    descriptors(data).find(|(t, _)| *t == tag).map(|(_, d)| d)
}

/// Find the first extension descriptor (0x7F) with `ext_tag`. Returns the bytes after the extension tag.
pub fn find_extension(data: &[u8], ext_tag: u8) -> Option<&[u8]> {
    descriptors(data)
        .filter(|(t, d)| *t == descriptor_tag::EXTENSION && !d.is_empty() && d[0] == ext_tag)
        .map(|(_, d)| &d[1..])
        .next()
}

/// Service descriptor (0x48).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceDescriptor {
    pub service_type: u8,
    pub provider_name: String,
    pub service_name: String,
}

impl ServiceDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < 3 {
            return Err("Service descriptor too short");
        }

        let service_type = data[0];
        let provider_name_length = data[1] as usize;

        if data.len() < 2 + provider_name_length + 1 {
            return Err("Invalid provider name length");
        }

        let provider_name = decode_dvb_string(&data[2..2 + provider_name_length]);

        let service_name_offset = 2 + provider_name_length;
        let service_name_length = data[service_name_offset] as usize;

        if data.len() < service_name_offset + 1 + service_name_length {
            return Err("Invalid service name length");
        }

        let service_name = decode_dvb_string(
            &data[service_name_offset + 1..service_name_offset + 1 + service_name_length],
        );

        Ok(ServiceDescriptor {
            service_type,
            provider_name,
            service_name,
        })
    }
}

/// Network name (0x40) and bouquet name (0x47) descriptors.
pub fn parse_name(data: &[u8]) -> String {
    decode_dvb_string(data)
}

/// Service list descriptor (0x41): `(service_id, service_type)` pairs.
pub fn parse_service_list(data: &[u8]) -> Vec<(u16, u8)> {
    data.chunks_exact(3)
        .map(|c| (((c[0] as u16) << 8) | c[1] as u16, c[2]))
        .collect()
}

/// Satellite delivery system descriptor (0x43).
#[derive(Debug, Clone, PartialEq)]
pub struct SatelliteDelivery {
    /// kHz.
    pub frequency: u32,
    /// 1/100 degree, west negative.
    pub sat_pos: i16,
    pub pol: Polarisation,
    pub rolloff: RollOff,
    pub is_s2: bool,
    pub modulation: Modulation,
    /// symbols/s.
    pub symbol_rate: u32,
    pub fec: CodeRate,
}

impl SatelliteDelivery {
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < 11 {
            return Err("Satellite delivery descriptor too short");
        }
        // 8 BCD digits in 10 kHz units
        let frequency = bcd_to_u32(&data[0..4]) * 10;
        // 4 BCD digits in 0.1 degree units
        let orbital = bcd_to_u32(&data[4..6]) as i32 * 10;
        let west = data[6] & 0x80 == 0;
        let sat_pos = if west { -orbital } else { orbital } as i16;
        let pol = match (data[6] >> 5) & 0x03 {
            0 => Polarisation::H,
            1 => Polarisation::V,
            2 => Polarisation::L,
            _ => Polarisation::R,
        };
        let is_s2 = data[6] & 0x04 != 0;
        let rolloff = if is_s2 {
            match (data[6] >> 3) & 0x03 {
                0 => RollOff::R35,
                1 => RollOff::R25,
                2 => RollOff::R20,
                _ => RollOff::Auto,
            }
        } else {
            RollOff::R35
        };
        let modulation = match data[6] & 0x03 {
            1 => Modulation::Qpsk,
            2 => Modulation::Psk8,
            3 => Modulation::Apsk16,
            _ => Modulation::Auto,
        };
        let symbol_rate = bcd_symbol_rate(&data[7..11]);
        let fec = sat_fec(data[10] & 0x0F);
        Ok(SatelliteDelivery {
            frequency,
            sat_pos,
            pol,
            rolloff,
            is_s2,
            modulation,
            symbol_rate,
            fec,
        })
    }
}

fn sat_fec(code: u8) -> CodeRate {
    match code {
        1 => CodeRate::Fec1_2,
        2 => CodeRate::Fec2_3,
        3 => CodeRate::Fec3_4,
        4 => CodeRate::Fec5_6,
        5 => CodeRate::Fec7_8,
        6 => CodeRate::Fec8_9,
        7 => CodeRate::Fec3_5,
        8 => CodeRate::Fec4_5,
        9 => CodeRate::Fec9_10,
        15 => CodeRate::None,
        _ => CodeRate::Auto,
    }
}

/// Cable delivery system descriptor (0x44).
#[derive(Debug, Clone, PartialEq)]
pub struct CableDelivery {
    /// kHz.
    pub frequency: u32,
    pub modulation: Modulation,
    pub symbol_rate: u32,
    pub fec_inner: CodeRate,
}

impl CableDelivery {
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < 11 {
            return Err("Cable delivery descriptor too short");
        }
        // 8 BCD digits in 100 Hz units
        let frequency = bcd_to_u32(&data[0..4]) / 10;
        let modulation = match data[6] {
            1 => Modulation::Qam16,
            2 => Modulation::Qam32,
            3 => Modulation::Qam64,
            4 => Modulation::Qam128,
            5 => Modulation::Qam256,
            _ => Modulation::Auto,
        };
        let symbol_rate = bcd_symbol_rate(&data[7..11]);
        Ok(CableDelivery {
            frequency,
            modulation,
            symbol_rate,
            fec_inner: sat_fec(data[10] & 0x0F),
        })
    }
}

/// Terrestrial delivery system descriptor (0x5A) or T2 delivery descriptor (0x7F/0x04).
#[derive(Debug, Clone, PartialEq)]
pub struct TerrestrialDelivery {
    /// kHz, 0 when a T2 descriptor carries no cell loop.
    pub frequency: u32,
    /// Hz.
    pub bandwidth: u32,
    pub modulation: Modulation,
    pub hp_code_rate: CodeRate,
    pub lp_code_rate: CodeRate,
    pub guard_interval: GuardInterval,
    pub transmission_mode: TransmissionMode,
    pub is_t2: bool,
    /// PLP id for T2, -1 otherwise.
    pub plp_id: i16,
}

fn terrestrial_code_rate(code: u8) -> CodeRate {
    match code {
        0 => CodeRate::Fec1_2,
        1 => CodeRate::Fec2_3,
        2 => CodeRate::Fec3_4,
        3 => CodeRate::Fec5_6,
        4 => CodeRate::Fec7_8,
        _ => CodeRate::Auto,
    }
}

fn terrestrial_bandwidth(code: u8) -> u32 {
    match code {
        0 => 8_000_000,
        1 => 7_000_000,
        2 => 6_000_000,
        3 => 5_000_000,
        4 => 10_000_000,
        5 => 1_712_000,
        _ => 0,
    }
}

impl TerrestrialDelivery {
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < 7 {
            return Err("Terrestrial delivery descriptor too short");
        }
        let centre = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let modulation = match data[5] >> 6 {
            0 => Modulation::Qpsk,
            1 => Modulation::Qam16,
            2 => Modulation::Qam64,
            _ => Modulation::Auto,
        };
        let guard_interval = match (data[6] >> 3) & 0x03 {
            0 => GuardInterval::G1_32,
            1 => GuardInterval::G1_16,
            2 => GuardInterval::G1_8,
            _ => GuardInterval::G1_4,
        };
        let transmission_mode = match (data[6] >> 1) & 0x03 {
            0 => TransmissionMode::Mode2k,
            1 => TransmissionMode::Mode8k,
            2 => TransmissionMode::Mode4k,
            _ => TransmissionMode::Auto,
        };
        Ok(TerrestrialDelivery {
            // 10 Hz units
            frequency: centre / 100,
            bandwidth: terrestrial_bandwidth(data[4] >> 5),
            modulation,
            hp_code_rate: terrestrial_code_rate(data[5] & 0x07),
            lp_code_rate: terrestrial_code_rate(data[6] >> 5),
            guard_interval,
            transmission_mode,
            is_t2: false,
            plp_id: -1,
        })
    }

    /// Parse the payload of a T2 delivery extension descriptor (after the extension tag).
    pub fn parse_t2(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < 3 {
            return Err("T2 delivery descriptor too short");
        }
        let plp_id = data[0] as i16;
        let mut d = TerrestrialDelivery {
            frequency: 0,
            bandwidth: 0,
            modulation: Modulation::Auto,
            hp_code_rate: CodeRate::Auto,
            lp_code_rate: CodeRate::Auto,
            guard_interval: GuardInterval::Auto,
            transmission_mode: TransmissionMode::Auto,
            is_t2: true,
            plp_id,
        };
        if data.len() < 5 {
            return Ok(d);
        }
        d.bandwidth = terrestrial_bandwidth((data[3] >> 2) & 0x0F);
        d.guard_interval = match data[4] >> 5 {
            0 => GuardInterval::G1_32,
            1 => GuardInterval::G1_16,
            2 => GuardInterval::G1_8,
            3 => GuardInterval::G1_4,
            4 => GuardInterval::G1_128,
            5 => GuardInterval::G19_128,
            6 => GuardInterval::G19_256,
            _ => GuardInterval::Auto,
        };
        d.transmission_mode = match (data[4] >> 2) & 0x07 {
            0 => TransmissionMode::Mode2k,
            1 => TransmissionMode::Mode8k,
            2 => TransmissionMode::Mode4k,
            3 => TransmissionMode::Mode1k,
            4 => TransmissionMode::Mode16k,
            5 => TransmissionMode::Mode32k,
            _ => TransmissionMode::Auto,
        };
        let tfs = data[4] & 0x01 != 0;
        // first cell: cell_id, then either a frequency loop (tfs) or one centre frequency
        let cell = &data[5..];
        let freq_bytes = if tfs {
            if cell.len() >= 7 { Some(&cell[3..7]) } else { None }
        } else if cell.len() >= 6 {
            Some(&cell[2..6])
        } else {
            None
        };
        if let Some(b) = freq_bytes {
            d.frequency = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) / 100;
        }
        Ok(d)
    }
}

/// S2 satellite delivery system descriptor (0x79).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct S2SatelliteDelivery {
    /// Physical layer scrambling index (gold code), if signalled.
    pub pls_code: Option<u32>,
    /// Input stream id, if this is a multistream.
    pub stream_id: Option<u8>,
}

impl S2SatelliteDelivery {
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.is_empty() {
            return Err("S2 delivery descriptor too short");
        }
        let scrambling = data[0] & 0x80 != 0;
        let multistream = data[0] & 0x40 != 0;
        let mut offset = 1;
        let mut out = S2SatelliteDelivery::default();
        if scrambling {
            if data.len() < offset + 3 {
                return Err("S2 delivery descriptor truncated");
            }
            out.pls_code = Some(
                ((data[offset] as u32 & 0x03) << 16)
                    | ((data[offset + 1] as u32) << 8)
                    | data[offset + 2] as u32,
            );
            offset += 3;
        }
        if multistream {
            if data.len() < offset + 1 {
                return Err("S2 delivery descriptor truncated");
            }
            out.stream_id = Some(data[offset]);
        }
        Ok(out)
    }
}

/// Logical channel descriptor (0x83): `(service_id, visible, lcn)`.
pub fn parse_logical_channels(data: &[u8]) -> Vec<(u16, bool, u16)> {
    data.chunks_exact(4)
        .map(|c| {
            let service_id = ((c[0] as u16) << 8) | c[1] as u16;
            let visible = c[2] & 0x80 != 0;
            let lcn = ((c[2] as u16 & 0x03) << 8) | c[3] as u16;
            (service_id, visible, lcn)
        })
        .collect()
}

/// Entry of the Sky bouquet channel descriptor (0xB1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkyChannel {
    pub service_id: u16,
    pub service_type: u8,
    pub channel_id: u16,
    pub lcn: u16,
}

/// Sky channel descriptor: region id followed by 9 byte entries.
pub fn parse_sky_channels(data: &[u8]) -> Vec<SkyChannel> {
    if data.len() < 2 {
        return Vec::new();
    }
    data[2..]
        .chunks_exact(9)
        .map(|c| SkyChannel {
            service_id: ((c[0] as u16) << 8) | c[1] as u16,
            service_type: c[2],
            channel_id: ((c[3] as u16) << 8) | c[4] as u16,
            lcn: ((c[5] as u16) << 8) | c[6] as u16,
        })
        .collect()
}

/// Short event descriptor (0x4D).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShortEvent {
    pub language: [u8; 3],
    pub event_name: String,
    pub text: String,
}

impl ShortEvent {
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < 5 {
            return Err("Short event descriptor too short");
        }
        let name_len = data[3] as usize;
        if data.len() < 4 + name_len + 1 {
            return Err("Invalid event name length");
        }
        let event_name = decode_dvb_string(&data[4..4 + name_len]);
        let text_offset = 4 + name_len;
        let text_len = data[text_offset] as usize;
        if data.len() < text_offset + 1 + text_len {
            return Err("Invalid event text length");
        }
        let text = decode_dvb_string(&data[text_offset + 1..text_offset + 1 + text_len]);
        Ok(ShortEvent {
            language: [data[0], data[1], data[2]],
            event_name,
            text,
        })
    }
}

/// Text part of an extended event descriptor (0x4E).
pub fn parse_extended_event_text(data: &[u8]) -> Result<String, &'static str> {
    if data.len() < 5 {
        return Err("Extended event descriptor too short");
    }
    let items_len = data[4] as usize;
    let text_offset = 5 + items_len;
    if data.len() < text_offset + 1 {
        return Err("Invalid extended event items length");
    }
    let text_len = data[text_offset] as usize;
    if data.len() < text_offset + 1 + text_len {
        return Err("Invalid extended event text length");
    }
    Ok(decode_dvb_string(&data[text_offset + 1..text_offset + 1 + text_len]))
}

/// Content descriptor (0x54): the content nibble bytes.
pub fn parse_content(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(2).map(|c| c[0]).collect()
}

/// T2MI descriptor (0x7F/0x11) payload after the extension tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct T2miDescriptor {
    pub t2mi_stream_id: u8,
    pub num_t2mi_streams: u8,
    pub pcr_iscr_common_clock: bool,
}

impl T2miDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < 2 {
            return Err("T2MI descriptor too short");
        }
        Ok(T2miDescriptor {
            t2mi_stream_id: data[0] & 0x07,
            num_t2mi_streams: (data[1] & 0x07) + 1,
            pcr_iscr_common_clock: data.len() > 2 && data[2] & 0x01 != 0,
        })
    }
}

/// 7 BCD digits in 100 symbols/s units; the last nibble is the FEC code.
fn bcd_symbol_rate(data: &[u8]) -> u32 {
    (bcd_to_u32(&data[0..3]) * 10 + (data[3] >> 4) as u32) * 100
}

/// Convert BCD bytes to u32.
pub(crate) fn bcd_to_u32(data: &[u8]) -> u32 {
    let mut result = 0u32;
    for &byte in data {
        let high = (byte >> 4) as u32;
        let low = (byte & 0x0F) as u32;
        result = result * 100 + high * 10 + low;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_descriptor() {
        let data = [
            0x01, // service_type = Digital TV
            0x04, // provider_name_length = 4
            b'T', b'E', b'S', b'T',
            0x07, // service_name_length = 7
            b'C', b'H', b' ', b'N', b'A', b'M', b'E',
        ];

        let desc = ServiceDescriptor::parse(&data).unwrap();
        assert_eq!(desc.service_type, 0x01);
        assert_eq!(desc.provider_name, "TEST");
        assert_eq!(desc.service_name, "CH NAME");
    }

    #[test]
    fn test_descriptor_loop_and_find() {
        let data = [
            0x48, 0x02, 0xAA, 0xBB,
            0x40, 0x03, 0xCC, 0xDD, 0xEE,
            0x41, 0x09, 0x00, // truncated
        ];
        let all: Vec<_> = descriptors(&data).collect();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1], (0x40, &[0xCC, 0xDD, 0xEE][..]));
        assert_eq!(find_descriptor(&data, 0x40), Some(&[0xCC, 0xDD, 0xEE][..]));
        assert!(find_descriptor(&data, 0x99).is_none());
    }

    #[test]
    fn test_satellite_delivery() {
        // 11.778 GHz, 19.2E, V, DVB-S2 8PSK rolloff 0.35, 27.5 Msym/s, FEC 2/3
        let data = [0x01, 0x17, 0x78, 0x00, 0x01, 0x92, 0xA6, 0x02, 0x75, 0x00, 0x02];
        let d = SatelliteDelivery::parse(&data).unwrap();
        assert_eq!(d.frequency, 11_778_000);
        assert_eq!(d.sat_pos, 1920);
        assert_eq!(d.pol, Polarisation::V);
        assert!(d.is_s2);
        assert_eq!(d.modulation, Modulation::Psk8);
        assert_eq!(d.rolloff, RollOff::R35);
        assert_eq!(d.symbol_rate, 27_500_000);
        assert_eq!(d.fec, CodeRate::Fec2_3);
    }

    #[test]
    fn test_satellite_delivery_west() {
        let data = [0x01, 0x20, 0x00, 0x00, 0x03, 0x00, 0x01, 0x00, 0x30, 0x00, 0x03];
        let d = SatelliteDelivery::parse(&data).unwrap();
        assert_eq!(d.sat_pos, -3000);
        assert_eq!(d.pol, Polarisation::H);
        assert_eq!(d.symbol_rate, 3_000_000);
    }

    #[test]
    fn test_cable_delivery() {
        // 346 MHz, QAM256, 6.9 Msym/s
        let data = [0x03, 0x46, 0x00, 0x00, 0xFF, 0xF2, 0x05, 0x00, 0x69, 0x00, 0x0F];
        let d = CableDelivery::parse(&data).unwrap();
        assert_eq!(d.frequency, 346_000);
        assert_eq!(d.modulation, Modulation::Qam256);
        assert_eq!(d.symbol_rate, 6_900_000);
    }

    #[test]
    fn test_terrestrial_delivery() {
        // 474 MHz in 10 Hz units, 8 MHz, 64QAM, HP 2/3, GI 1/4, 8k
        let f = (474_000_000u32 / 10).to_be_bytes();
        let data = [f[0], f[1], f[2], f[3], 0x1F, 0x81, 0x1A, 0xFF, 0xFF, 0xFF, 0xFF];
        let d = TerrestrialDelivery::parse(&data).unwrap();
        assert_eq!(d.frequency, 474_000);
        assert_eq!(d.bandwidth, 8_000_000);
        assert_eq!(d.modulation, Modulation::Qam64);
        assert_eq!(d.hp_code_rate, CodeRate::Fec2_3);
        assert_eq!(d.guard_interval, GuardInterval::G1_4);
        assert_eq!(d.transmission_mode, TransmissionMode::Mode8k);
    }

    #[test]
    fn test_s2_delivery_pls_and_stream() {
        let data = [0xC0, 0x01, 0x23, 0x45, 0x05];
        let d = S2SatelliteDelivery::parse(&data).unwrap();
        assert_eq!(d.pls_code, Some(0x12345));
        assert_eq!(d.stream_id, Some(5));
    }

    #[test]
    fn test_logical_channels() {
        let data = [0x00, 0x65, 0xFC, 0x01, 0x00, 0x66, 0x7C, 0x02];
        assert_eq!(
            parse_logical_channels(&data),
            vec![(0x65, true, 1), (0x66, false, 2)]
        );
    }

    #[test]
    fn test_short_event() {
        let data = [b'e', b'n', b'g', 4, b'N', b'e', b'w', b's', 3, b'a', b'b', b'c'];
        let e = ShortEvent::parse(&data).unwrap();
        assert_eq!(e.event_name, "News");
        assert_eq!(e.text, "abc");
    }

    #[test]
    fn test_bcd_to_u32() {
        assert_eq!(bcd_to_u32(&[0x12, 0x34]), 1234);
        assert_eq!(bcd_to_u32(&[0x99, 0x99]), 9999);
    }
}
