//! SDT (Service Description Table) parsing.
//!
//! The SDT is transmitted on PID 0x0011 and contains information about
//! services (channels) in a transport stream.

use super::descriptors::{find_descriptor, ServiceDescriptor};
use super::psi::PsiSection;
use super::{descriptor_tag, table_id};

/// Service entry in the SDT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdtService {
    pub service_id: u16,
    pub eit_schedule_flag: bool,
    pub eit_present_following_flag: bool,
    pub running_status: u8,
    pub free_ca_mode: bool,
    pub service_type: u8,
    pub name: String,
    pub provider: String,
}

/// One decoded SDT section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdtSection {
    pub ts_id: u16,
    pub original_network_id: u16,
    pub is_actual: bool,
    pub services: Vec<SdtService>,
}

impl SdtSection {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        let is_actual = match section.header.table_id {
            table_id::SDT_ACTUAL => true,
            table_id::SDT_OTHER => false,
            _ => return Err("Not a SDT section"),
        };

        let data = section.data;
        if data.len() < 3 {
            return Err("SDT data too short");
        }

        let original_network_id = ((data[0] as u16) << 8) | data[1] as u16;
        // data[2] is reserved

        let mut sdt = SdtSection {
            ts_id: section.header.table_id_extension,
            original_network_id,
            is_actual,
            services: Vec::new(),
        };

        let mut offset = 3;
        while offset + 5 <= data.len() {
            let service_id = ((data[offset] as u16) << 8) | data[offset + 1] as u16;
            let eit_schedule_flag = data[offset + 2] & 0x02 != 0;
            let eit_present_following_flag = data[offset + 2] & 0x01 != 0;
            let running_status = (data[offset + 3] >> 5) & 0x07;
            let free_ca_mode = data[offset + 3] & 0x10 != 0;
            let descriptors_length =
                ((data[offset + 3] as usize & 0x0F) << 8) | data[offset + 4] as usize;

            offset += 5;

            if offset + descriptors_length > data.len() {
                return Err("Invalid service descriptors length");
            }

            let descriptors = &data[offset..offset + descriptors_length];
            offset += descriptors_length;

            let desc = find_descriptor(descriptors, descriptor_tag::SERVICE)
                .and_then(|d| ServiceDescriptor::parse(d).ok())
                .unwrap_or_default();

            sdt.services.push(SdtService {
                service_id,
                eit_schedule_flag,
                eit_present_following_flag,
                running_status,
                free_ca_mode,
                service_type: desc.service_type,
                name: desc.service_name,
                provider: desc.provider_name,
            });
        }

        Ok(sdt)
    }

    /// Section body for `services`, used to build test streams.
    pub fn encode_body(original_network_id: u16, services: &[SdtService]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&original_network_id.to_be_bytes());
        body.push(0xFF);
        for s in services {
            let mut desc = vec![descriptor_tag::SERVICE, 0, s.service_type];
            desc.push(s.provider.len() as u8);
            desc.extend_from_slice(s.provider.as_bytes());
            desc.push(s.name.len() as u8);
            desc.extend_from_slice(s.name.as_bytes());
            desc[1] = (desc.len() - 2) as u8;

            body.extend_from_slice(&s.service_id.to_be_bytes());
            let eit_flags = (if s.eit_schedule_flag { 0x02 } else { 0 })
                | (if s.eit_present_following_flag { 0x01 } else { 0 });
            body.push(0xFC | eit_flags);
            let flags = ((s.running_status & 0x07) << 5) | (if s.free_ca_mode { 0x10 } else { 0 });
            body.push(flags | ((desc.len() >> 8) as u8 & 0x0F));
            body.push(desc.len() as u8);
            body.extend_from_slice(&desc);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::si::psi::SectionBuilder;

    #[test]
    fn test_parse_sdt() {
        let services = vec![
            SdtService {
                service_id: 0x6FF,
                eit_present_following_flag: true,
                running_status: 4,
                service_type: 0x19,
                name: "Das Erste HD".into(),
                provider: "ARD".into(),
                ..Default::default()
            },
            SdtService {
                service_id: 0x700,
                running_status: 4,
                free_ca_mode: true,
                service_type: 0x02,
                name: "Radio".into(),
                provider: "ARD".into(),
                ..Default::default()
            },
        ];
        let body = SdtSection::encode_body(1, &services);
        let raw = SectionBuilder::new(table_id::SDT_ACTUAL, 1019, 5).build(&body);
        let sdt = SdtSection::parse(&PsiSection::parse(&raw).unwrap()).unwrap();

        assert!(sdt.is_actual);
        assert_eq!(sdt.ts_id, 1019);
        assert_eq!(sdt.original_network_id, 1);
        assert_eq!(sdt.services, services);
    }

    #[test]
    fn test_sdt_other_without_service_descriptor() {
        let body = [0x00, 0x07, 0xFF, 0x00, 0x01, 0xFC, 0x80, 0x00];
        let raw = SectionBuilder::new(table_id::SDT_OTHER, 99, 0).build(&body);
        let sdt = SdtSection::parse(&PsiSection::parse(&raw).unwrap()).unwrap();
        assert!(!sdt.is_actual);
        assert_eq!(sdt.original_network_id, 7);
        assert_eq!(sdt.services[0].service_id, 1);
        assert_eq!(sdt.services[0].running_status, 4);
        assert!(sdt.services[0].name.is_empty());
    }
}
