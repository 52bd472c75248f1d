//! NIT (Network Information Table) parsing.
//!
//! The NIT is transmitted on PID 0x0010 and describes the transport streams
//! of a network, including their physical tuning parameters.

use neumo_protocol::{
    sat_pos, AnyMux, DeliverySystem, DvbcMux, DvbsMux, DvbtMux, KeySrc, MuxCommon, MuxKey, PlsMode,
    TuneSrc,
};

use super::descriptors::{
    descriptors, find_descriptor, parse_logical_channels, parse_name, parse_service_list,
    CableDelivery, S2SatelliteDelivery, SatelliteDelivery, TerrestrialDelivery,
};
use super::psi::PsiSection;
use super::{descriptor_tag, table_id};

/// Transport stream entry of a NIT section.
#[derive(Debug, Clone, PartialEq)]
pub struct NitEntry {
    pub ts_id: u16,
    pub original_network_id: u16,
    /// Tuning parameters from the delivery descriptor, if any.
    pub mux: Option<AnyMux>,
    /// `(service_id, service_type)` from the service list descriptor.
    pub services: Vec<(u16, u8)>,
    /// `(service_id, visible, lcn)` from the logical channel descriptor.
    pub lcns: Vec<(u16, bool, u16)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NitSection {
    pub network_id: u16,
    pub is_actual: bool,
    pub network_name: Option<String>,
    pub entries: Vec<NitEntry>,
}

impl NitSection {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        let is_actual = match section.header.table_id {
            table_id::NIT_ACTUAL => true,
            table_id::NIT_OTHER => false,
            _ => return Err("Not a NIT section"),
        };

        let data = section.data;
        if data.len() < 2 {
            return Err("NIT data too short");
        }

        let network_descriptors_length = ((data[0] as usize & 0x0F) << 8) | data[1] as usize;
        if data.len() < 2 + network_descriptors_length + 2 {
            return Err("Invalid network descriptors length");
        }

        let network_descriptors = &data[2..2 + network_descriptors_length];
        let network_name =
            find_descriptor(network_descriptors, descriptor_tag::NETWORK_NAME).map(parse_name);

        let mut nit = NitSection {
            network_id: section.header.table_id_extension,
            is_actual,
            network_name,
            entries: Vec::new(),
        };

        let ts_loop_offset = 2 + network_descriptors_length;
        let ts_loop_length =
            ((data[ts_loop_offset] as usize & 0x0F) << 8) | data[ts_loop_offset + 1] as usize;

        let mut offset = ts_loop_offset + 2;
        let ts_loop_end = (offset + ts_loop_length).min(data.len());

        while offset + 6 <= ts_loop_end {
            let ts_id = ((data[offset] as u16) << 8) | data[offset + 1] as u16;
            let original_network_id = ((data[offset + 2] as u16) << 8) | data[offset + 3] as u16;
            let ts_descriptors_length =
                ((data[offset + 4] as usize & 0x0F) << 8) | data[offset + 5] as usize;

            offset += 6;

            if offset + ts_descriptors_length > data.len() {
                return Err("Invalid transport descriptors length");
            }

            let descs = &data[offset..offset + ts_descriptors_length];
            offset += ts_descriptors_length;

            nit.entries
                .push(parse_entry(ts_id, original_network_id, is_actual, descs));
        }

        Ok(nit)
    }

    pub fn find_entry(&self, network_id: u16, ts_id: u16) -> Option<&NitEntry> {
        self.entries
            .iter()
            .find(|e| e.original_network_id == network_id && e.ts_id == ts_id)
    }
}

fn parse_entry(
    ts_id: u16,
    original_network_id: u16,
    is_actual: bool,
    descs: &[u8],
) -> NitEntry {
    let mut sat = None;
    let mut s2 = None;
    let mut cable = None;
    let mut terrestrial = None;
    let mut services = Vec::new();
    let mut lcns = Vec::new();

    for (tag, payload) in descriptors(descs) {
        match tag {
            descriptor_tag::SATELLITE_DELIVERY => sat = SatelliteDelivery::parse(payload).ok(),
            descriptor_tag::S2_SATELLITE_DELIVERY => s2 = S2SatelliteDelivery::parse(payload).ok(),
            descriptor_tag::CABLE_DELIVERY => cable = CableDelivery::parse(payload).ok(),
            descriptor_tag::TERRESTRIAL_DELIVERY => {
                terrestrial = TerrestrialDelivery::parse(payload).ok()
            }
            descriptor_tag::EXTENSION
                if payload.first() == Some(&descriptor_tag::ext::T2_DELIVERY) =>
            {
                terrestrial = TerrestrialDelivery::parse_t2(&payload[1..]).ok()
            }
            descriptor_tag::SERVICE_LIST => services.extend(parse_service_list(payload)),
            descriptor_tag::LOGICAL_CHANNEL => lcns.extend(parse_logical_channels(payload)),
            _ => {}
        }
    }

    let c = MuxCommon {
        network_id: original_network_id,
        ts_id,
        nit_network_id: original_network_id,
        nit_ts_id: ts_id,
        tune_src: if is_actual { TuneSrc::NitActual } else { TuneSrc::NitOther },
        key_src: KeySrc::Nit,
        ..Default::default()
    };

    let mux = if let Some(d) = sat {
        let s2 = s2.unwrap_or_default();
        Some(AnyMux::Dvbs(DvbsMux {
            k: MuxKey {
                sat_pos: d.sat_pos,
                stream_id: s2.stream_id.map_or(-1, |id| id as i16),
                ..Default::default()
            },
            frequency: d.frequency,
            pol: d.pol,
            symbol_rate: d.symbol_rate,
            delivery_system: if d.is_s2 { DeliverySystem::DvbS2 } else { DeliverySystem::DvbS },
            modulation: d.modulation,
            fec: d.fec,
            rolloff: d.rolloff,
            pls_mode: if s2.pls_code.is_some() { PlsMode::Gold } else { PlsMode::Root },
            pls_code: s2.pls_code.unwrap_or(1),
            matype: -1,
            c,
            ..Default::default()
        }))
    } else if let Some(d) = cable {
        Some(AnyMux::Dvbc(DvbcMux {
            k: MuxKey {
                sat_pos: sat_pos::DVBC,
                ..Default::default()
            },
            frequency: d.frequency,
            symbol_rate: d.symbol_rate,
            delivery_system: DeliverySystem::DvbC,
            modulation: d.modulation,
            fec_inner: d.fec_inner,
            c,
        }))
    } else {
        terrestrial.map(|d| {
            AnyMux::Dvbt(DvbtMux {
                k: MuxKey {
                    sat_pos: sat_pos::DVBT,
                    stream_id: d.plp_id,
                    ..Default::default()
                },
                frequency: d.frequency,
                bandwidth: d.bandwidth,
                delivery_system: if d.is_t2 { DeliverySystem::DvbT2 } else { DeliverySystem::DvbT },
                modulation: d.modulation,
                transmission_mode: d.transmission_mode,
                guard_interval: d.guard_interval,
                hp_code_rate: d.hp_code_rate,
                lp_code_rate: d.lp_code_rate,
                c,
            })
        })
    };

    NitEntry {
        ts_id,
        original_network_id,
        mux,
        services,
        lcns,
    }
}
