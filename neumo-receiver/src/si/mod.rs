//! DVB Service Information decoding.
//!
//! This module turns TS packets into sections and sections into decoded
//! table fragments. It keeps no state about what the fragments mean; that is
//! the job of [`crate::engine`].
//!
//! # Supported Tables
//! - PAT (PID 0x0000), PMT (PIDs from PAT)
//! - NIT actual/other (PID 0x0010)
//! - SDT actual/other and BAT (PID 0x0011)
//! - EIT in DVB, Freesat, Viasat, Sky OpenTV and MediaHighway 2 flavours

pub mod bat;
pub mod descriptors;
pub mod eit;
pub mod nit;
pub mod packet;
pub mod pat;
pub mod pmt;
pub mod psi;
pub mod sdt;
pub mod text;

pub use bat::{BatSection, BatService, BatTransportStream};
pub use eit::{
    EitEvent, EitSection, Mhw2SummarySection, Mhw2Title, Mhw2TitleSection, SkySummarySection, SkyTitle,
    SkyTitleSection,
};
pub use nit::{NitEntry, NitSection};
pub use packet::{TsHeader, SYNC_BYTE, TS_PACKET_SIZE};
pub use pat::{PatEntry, PatSection};
pub use pmt::{PmtSection, PmtStream};
pub use psi::{crc32_mpeg2, PsiHeader, PsiSection, SectionAssembler};
pub use sdt::{SdtSection, SdtService};

/// Well-known PIDs.
pub mod pid {
    pub const PAT: u16 = 0x0000;
    pub const NIT: u16 = 0x0010;
    /// SDT and BAT share this PID.
    pub const SDT_BAT: u16 = 0x0011;
    pub const EIT: u16 = 0x0012;
    pub const NULL: u16 = 0x1FFF;
    /// Freesat EIT (schedule and present/following).
    pub const FREESAT_EIT: u16 = 3842;
    pub const FREESAT_EIT_PF: u16 = 3843;
    /// Freesat SDT/BAT.
    pub const FREESAT_SDT_BAT: u16 = 3841;
    /// Viasat EPG.
    pub const VIASAT_EIT: u16 = 0x39;
    /// Sky OpenTV titles and summaries.
    pub const SKY_TITLES: [u16; 8] = [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37];
    pub const SKY_SUMMARIES: [u16; 8] = [0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47];
    /// MediaHighway 2 titles and summaries.
    pub const MHW2_TITLES: u16 = 0x234;
    pub const MHW2_SUMMARIES: u16 = 0x236;
}

/// Table IDs.
pub mod table_id {
    pub const PAT: u8 = 0x00;
    pub const PMT: u8 = 0x02;
    pub const NIT_ACTUAL: u8 = 0x40;
    pub const NIT_OTHER: u8 = 0x41;
    pub const SDT_ACTUAL: u8 = 0x42;
    pub const SDT_OTHER: u8 = 0x46;
    pub const BAT: u8 = 0x4A;
    pub const EIT_PF_ACTUAL: u8 = 0x4E;
    pub const EIT_PF_OTHER: u8 = 0x4F;
    pub const EIT_SCHEDULE_ACTUAL_FIRST: u8 = 0x50;
    pub const EIT_SCHEDULE_ACTUAL_LAST: u8 = 0x5F;
    pub const EIT_SCHEDULE_OTHER_FIRST: u8 = 0x60;
    pub const EIT_SCHEDULE_OTHER_LAST: u8 = 0x6F;
    pub const SKY_TITLES_FIRST: u8 = 0xA0;
    pub const SKY_TITLES_LAST: u8 = 0xA3;
    pub const SKY_SUMMARIES_FIRST: u8 = 0xA8;
    pub const SKY_SUMMARIES_LAST: u8 = 0xAB;
    pub const MHW2_TITLES: u8 = 0xE6;
    pub const MHW2_SUMMARIES: u8 = 0x96;

    pub fn is_dvb_eit(table_id: u8) -> bool {
        (EIT_PF_ACTUAL..=EIT_SCHEDULE_OTHER_LAST).contains(&table_id)
    }
}

/// Descriptor tags.
pub mod descriptor_tag {
    pub const CA: u8 = 0x09;
    pub const NETWORK_NAME: u8 = 0x40;
    pub const SERVICE_LIST: u8 = 0x41;
    pub const SATELLITE_DELIVERY: u8 = 0x43;
    pub const CABLE_DELIVERY: u8 = 0x44;
    pub const BOUQUET_NAME: u8 = 0x47;
    pub const SERVICE: u8 = 0x48;
    pub const SHORT_EVENT: u8 = 0x4D;
    pub const EXTENDED_EVENT: u8 = 0x4E;
    pub const CONTENT: u8 = 0x54;
    pub const TERRESTRIAL_DELIVERY: u8 = 0x5A;
    pub const S2_SATELLITE_DELIVERY: u8 = 0x79;
    pub const EXTENSION: u8 = 0x7F;
    pub const LOGICAL_CHANNEL: u8 = 0x83;
    /// Sky bouquet channel descriptor (private).
    pub const SKY_CHANNEL: u8 = 0xB1;

    /// Extension tags inside [`EXTENSION`].
    pub mod ext {
        pub const T2_DELIVERY: u8 = 0x04;
        pub const T2MI: u8 = 0x11;
    }
}
