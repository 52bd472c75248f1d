//! BAT (Bouquet Association Table) parsing.
//!
//! The BAT shares PID 0x0011 with the SDT. Its layout mirrors the NIT: a
//! bouquet descriptor loop followed by a transport stream loop.

use std::collections::BTreeMap;

use super::descriptors::{
    descriptors, find_descriptor, parse_logical_channels, parse_name, parse_service_list,
    parse_sky_channels,
};
use super::psi::PsiSection;
use super::{descriptor_tag, table_id};

/// A channel of a bouquet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatService {
    pub service_id: u16,
    pub service_type: u8,
    /// Logical channel number, 0 when not signalled.
    pub lcn: u16,
    /// Broadcaster channel id; the service id when no private descriptor gives one.
    pub channel_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatTransportStream {
    pub ts_id: u16,
    pub original_network_id: u16,
    pub services: Vec<BatService>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatSection {
    pub bouquet_id: u16,
    pub name: Option<String>,
    pub transport_streams: Vec<BatTransportStream>,
}

impl BatSection {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        if section.header.table_id != table_id::BAT {
            return Err("Not a BAT section");
        }
        let data = section.data;
        if data.len() < 2 {
            return Err("BAT data too short");
        }

        let bouquet_descriptors_length = ((data[0] as usize & 0x0F) << 8) | data[1] as usize;
        if data.len() < 2 + bouquet_descriptors_length + 2 {
            return Err("Invalid bouquet descriptors length");
        }
        let name = find_descriptor(
            &data[2..2 + bouquet_descriptors_length],
            descriptor_tag::BOUQUET_NAME,
        )
        .map(parse_name);

        let mut bat = BatSection {
            bouquet_id: section.header.table_id_extension,
            name,
            transport_streams: Vec::new(),
        };

        let loop_offset = 2 + bouquet_descriptors_length;
        let loop_length =
            ((data[loop_offset] as usize & 0x0F) << 8) | data[loop_offset + 1] as usize;
        let mut offset = loop_offset + 2;
        let loop_end = (offset + loop_length).min(data.len());

        while offset + 6 <= loop_end {
            let ts_id = ((data[offset] as u16) << 8) | data[offset + 1] as u16;
            let original_network_id = ((data[offset + 2] as u16) << 8) | data[offset + 3] as u16;
            let len = ((data[offset + 4] as usize & 0x0F) << 8) | data[offset + 5] as usize;
            offset += 6;
            if offset + len > data.len() {
                return Err("Invalid transport descriptors length");
            }
            let services = parse_services(&data[offset..offset + len]);
            offset += len;
            bat.transport_streams.push(BatTransportStream {
                ts_id,
                original_network_id,
                services,
            });
        }

        Ok(bat)
    }
}

/// Merge service list, logical channel and Sky channel descriptors per service id.
fn parse_services(descs: &[u8]) -> Vec<BatService> {
    fn entry(by_id: &mut BTreeMap<u16, BatService>, service_id: u16) -> &mut BatService {
        by_id.entry(service_id).or_insert(BatService {
            service_id,
            service_type: 0,
            lcn: 0,
            channel_id: service_id as u32,
        })
    }

    let mut by_id: BTreeMap<u16, BatService> = BTreeMap::new();

    for (tag, payload) in descriptors(descs) {
        match tag {
            descriptor_tag::SERVICE_LIST => {
                for (service_id, service_type) in parse_service_list(payload) {
                    entry(&mut by_id, service_id).service_type = service_type;
                }
            }
            descriptor_tag::LOGICAL_CHANNEL => {
                for (service_id, _visible, lcn) in parse_logical_channels(payload) {
                    entry(&mut by_id, service_id).lcn = lcn;
                }
            }
            descriptor_tag::SKY_CHANNEL => {
                for ch in parse_sky_channels(payload) {
                    let s = entry(&mut by_id, ch.service_id);
                    s.service_type = ch.service_type;
                    s.channel_id = ch.channel_id as u32;
                    s.lcn = ch.lcn;
                }
            }
            _ => {}
        }
    }
    by_id.into_values().collect()
}
