//! Linux DVB v5 property ABI.
//!
//! [`DtvProperty`] matches `struct dtv_property` bit for bit (76 bytes,
//! packed). A [`PropertyList`] collects properties and ends with one of the
//! trigger commands ([`PropertyList::tune`], [`PropertyList::scan`],
//! [`PropertyList::spectrum`]); a [`super::FrontendChannel`] executes it.

use neumo_protocol::{
    CodeRate, DeliverySystem, GuardInterval, Modulation, Pilot, PlsMode, RollOff, TransmissionMode,
};

// Standard property commands.
pub const DTV_TUNE: u32 = 1;
pub const DTV_CLEAR: u32 = 2;
pub const DTV_FREQUENCY: u32 = 3;
pub const DTV_MODULATION: u32 = 4;
pub const DTV_BANDWIDTH_HZ: u32 = 5;
pub const DTV_INVERSION: u32 = 6;
pub const DTV_SYMBOL_RATE: u32 = 8;
pub const DTV_INNER_FEC: u32 = 9;
pub const DTV_VOLTAGE: u32 = 10;
pub const DTV_TONE: u32 = 11;
pub const DTV_PILOT: u32 = 12;
pub const DTV_ROLLOFF: u32 = 13;
pub const DTV_DELIVERY_SYSTEM: u32 = 17;
pub const DTV_CODE_RATE_HP: u32 = 36;
pub const DTV_CODE_RATE_LP: u32 = 37;
pub const DTV_GUARD_INTERVAL: u32 = 38;
pub const DTV_TRANSMISSION_MODE: u32 = 39;
pub const DTV_HIERARCHY: u32 = 40;
pub const DTV_STREAM_ID: u32 = 42;
pub const DTV_ENUM_DELSYS: u32 = 44;
pub const DTV_STAT_SIGNAL_STRENGTH: u32 = 62;
pub const DTV_STAT_CNR: u32 = 63;
pub const DTV_STAT_PRE_ERROR_BIT_COUNT: u32 = 64;
pub const DTV_STAT_PRE_TOTAL_BIT_COUNT: u32 = 65;
pub const DTV_STAT_POST_ERROR_BIT_COUNT: u32 = 66;
pub const DTV_STAT_POST_TOTAL_BIT_COUNT: u32 = 67;
pub const DTV_SCRAMBLING_SEQUENCE_INDEX: u32 = 70;

// Blind scan extension of the neumo driver family.
pub const DTV_ALGORITHM: u32 = 71;
pub const DTV_SEARCH_RANGE: u32 = 72;
pub const DTV_SCAN: u32 = 73;
pub const DTV_SPECTRUM: u32 = 74;
pub const DTV_SCAN_START_FREQUENCY: u32 = 75;
pub const DTV_SCAN_END_FREQUENCY: u32 = 76;
pub const DTV_SCAN_RESOLUTION: u32 = 77;
pub const DTV_SCAN_FFT_SIZE: u32 = 78;
pub const DTV_PLS_SEARCH_LIST: u32 = 79;
pub const DTV_PLS_SEARCH_RANGE: u32 = 80;
pub const DTV_RF_INPUT: u32 = 81;
pub const DTV_MATYPE: u32 = 82;
pub const DTV_ISI_LIST: u32 = 83;
pub const DTV_BITRATE: u32 = 84;
pub const DTV_CONSTELLATION: u32 = 85;

/// Values of `DTV_ALGORITHM`.
pub mod algorithm {
    pub const WARM: u32 = 0;
    pub const COLD: u32 = 1;
    pub const BLIND: u32 = 2;
}

/// Values of `DTV_SPECTRUM`.
pub mod spectrum_method {
    pub const SWEEP: u32 = 0;
    pub const FFT: u32 = 1;
}

pub const NO_STREAM_ID_FILTER: u32 = !0;

/// `enum fe_sec_voltage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Voltage {
    V13 = 0,
    V18 = 1,
    Off = 2,
}

/// `enum fe_sec_tone_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Tone {
    On = 0,
    Off = 1,
}

/// `enum fe_sec_mini_cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Burst {
    A = 0,
    B = 1,
}

/// `fe_status_t` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeStatus(pub u32);

impl FeStatus {
    pub const HAS_SIGNAL: u32 = 0x01;
    pub const HAS_CARRIER: u32 = 0x02;
    pub const HAS_VITERBI: u32 = 0x04;
    pub const HAS_SYNC: u32 = 0x08;
    pub const HAS_LOCK: u32 = 0x10;
    pub const TIMEDOUT: u32 = 0x20;

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn has_lock(self) -> bool {
        self.has(Self::HAS_LOCK)
    }
}

/// `struct dtv_property`.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DtvProperty {
    cmd: u32,
    reserved: [u32; 3],
    u: [u8; 56],
    result: i32,
}

/// `struct dtv_properties`.
#[repr(C)]
pub struct DtvProperties {
    pub num: u32,
    pub props: *mut DtvProperty,
}

/// Size of the data part of a buffer property.
pub const BUFFER_LEN: usize = 32;
const BUFFER_LEN_OFFSET: usize = 32;
const MAX_DTV_STATS: usize = 4;

/// `enum fecap_scale_params`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatScale {
    NotAvailable,
    Decibel,
    Relative,
    Counter,
}

/// One entry of `struct dtv_fe_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtvStat {
    pub scale: StatScale,
    /// `svalue` for decibel scales, `uvalue` otherwise.
    pub value: i64,
}

impl DtvProperty {
    pub fn new(cmd: u32, data: u32) -> Self {
        let mut u = [0u8; 56];
        u[..4].copy_from_slice(&data.to_ne_bytes());
        Self {
            cmd,
            reserved: [0; 3],
            u,
            result: 0,
        }
    }

    /// A buffer property; at most [`BUFFER_LEN`] bytes are kept.
    pub fn with_buffer(cmd: u32, data: &[u8]) -> Self {
        let mut p = Self::new(cmd, 0);
        let len = data.len().min(BUFFER_LEN);
        p.u[..len].copy_from_slice(&data[..len]);
        p.u[BUFFER_LEN_OFFSET..BUFFER_LEN_OFFSET + 4].copy_from_slice(&(len as u32).to_ne_bytes());
        p
    }

    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    pub fn data(&self) -> u32 {
        u32::from_ne_bytes([self.u[0], self.u[1], self.u[2], self.u[3]])
    }

    pub fn result(&self) -> i32 {
        self.result
    }

    pub fn buffer(&self) -> &[u8] {
        let off = BUFFER_LEN_OFFSET;
        let len = u32::from_ne_bytes([self.u[off], self.u[off + 1], self.u[off + 2], self.u[off + 3]]);
        &self.u[..(len as usize).min(BUFFER_LEN)]
    }

    /// Decode the union as `struct dtv_fe_stats`.
    pub fn stats(&self) -> Vec<DtvStat> {
        let len = (self.u[0] as usize).min(MAX_DTV_STATS);
        (0..len)
            .map(|i| {
                let base = 1 + i * 9;
                let scale = match self.u[base] {
                    1 => StatScale::Decibel,
                    2 => StatScale::Relative,
                    3 => StatScale::Counter,
                    _ => StatScale::NotAvailable,
                };
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.u[base + 1..base + 9]);
                DtvStat {
                    scale,
                    value: i64::from_ne_bytes(raw),
                }
            })
            .collect()
    }

    /// Store a `struct dtv_fe_stats` in the union, as a driver would.
    pub fn set_stats(&mut self, stats: &[DtvStat]) {
        let len = stats.len().min(MAX_DTV_STATS);
        self.u = [0; 56];
        self.u[0] = len as u8;
        for (i, s) in stats.iter().take(len).enumerate() {
            let base = 1 + i * 9;
            self.u[base] = match s.scale {
                StatScale::NotAvailable => 0,
                StatScale::Decibel => 1,
                StatScale::Relative => 2,
                StatScale::Counter => 3,
            };
            self.u[base + 1..base + 9].copy_from_slice(&s.value.to_ne_bytes());
        }
    }

    /// Store a raw pointer in the union at `offset`, for driver extensions
    /// that read or fill user memory.
    pub(crate) fn set_pointer(&mut self, offset: usize, ptr: usize) {
        self.u[offset..offset + 8].copy_from_slice(&(ptr as u64).to_ne_bytes());
    }

    pub(crate) fn word(&self, offset: usize) -> u32 {
        u32::from_ne_bytes([self.u[offset], self.u[offset + 1], self.u[offset + 2], self.u[offset + 3]])
    }

    pub(crate) fn set_word(&mut self, offset: usize, value: u32) {
        self.u[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }
}

impl std::fmt::Debug for DtvProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cmd = self.cmd;
        f.debug_struct("DtvProperty")
            .field("cmd", &cmd)
            .field("data", &self.data())
            .finish()
    }
}

/// A list of properties for one `FE_SET_PROPERTY` or `FE_GET_PROPERTY` call.
#[derive(Debug, Clone, Default)]
pub struct PropertyList {
    props: Vec<DtvProperty>,
}

impl PropertyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a tune: the driver forgets the previous parameters first.
    pub fn cleared() -> Self {
        let mut list = Self::new();
        list.add(DTV_CLEAR, 0);
        list
    }

    pub fn add(&mut self, cmd: u32, value: u32) -> &mut Self {
        self.props.push(DtvProperty::new(cmd, value));
        self
    }

    pub fn add_buffer(&mut self, cmd: u32, data: &[u8]) -> &mut Self {
        self.props.push(DtvProperty::with_buffer(cmd, data));
        self
    }

    pub fn push(&mut self, prop: DtvProperty) -> &mut Self {
        self.props.push(prop);
        self
    }

    pub fn tune(&mut self) -> &mut Self {
        self.add(DTV_TUNE, 0)
    }

    pub fn scan(&mut self) -> &mut Self {
        self.add(DTV_SCAN, 0)
    }

    pub fn spectrum(&mut self, method: u32) -> &mut Self {
        self.add(DTV_SPECTRUM, method)
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DtvProperty> {
        self.props.iter()
    }

    pub fn get(&self, cmd: u32) -> Option<&DtvProperty> {
        self.props.iter().find(|p| p.cmd() == cmd)
    }

    pub fn get_mut(&mut self, cmd: u32) -> Option<&mut DtvProperty> {
        self.props.iter_mut().find(|p| p.cmd() == cmd)
    }

    /// Value of the first property with `cmd`.
    pub fn value(&self, cmd: u32) -> Option<u32> {
        self.get(cmd).map(|p| p.data())
    }

    pub fn commands(&self) -> Vec<u32> {
        self.props.iter().map(|p| p.cmd()).collect()
    }

    /// The kernel view of the list. Valid while `self` is neither moved nor changed.
    pub fn as_raw(&mut self) -> DtvProperties {
        DtvProperties {
            num: self.props.len() as u32,
            props: self.props.as_mut_ptr(),
        }
    }
}

/// `enum fe_delivery_system`.
pub fn delivery_system_code(d: DeliverySystem) -> u32 {
    match d {
        DeliverySystem::None => 0,
        DeliverySystem::DvbC => 1,
        DeliverySystem::DvbT => 3,
        DeliverySystem::DvbS => 5,
        DeliverySystem::DvbS2 => 6,
        DeliverySystem::DvbT2 => 16,
    }
}

/// `enum fe_modulation`.
pub fn modulation_code(m: Modulation) -> u32 {
    match m {
        Modulation::Qpsk => 0,
        Modulation::Qam16 => 1,
        Modulation::Qam32 => 2,
        Modulation::Qam64 => 3,
        Modulation::Qam128 => 4,
        Modulation::Qam256 => 5,
        Modulation::Auto => 6,
        Modulation::Psk8 => 9,
        Modulation::Apsk16 => 10,
        Modulation::Apsk32 => 11,
    }
}

/// `enum fe_code_rate`.
pub fn code_rate_code(c: CodeRate) -> u32 {
    match c {
        CodeRate::None => 0,
        CodeRate::Fec1_2 => 1,
        CodeRate::Fec2_3 => 2,
        CodeRate::Fec3_4 => 3,
        CodeRate::Fec4_5 => 4,
        CodeRate::Fec5_6 => 5,
        CodeRate::Fec7_8 => 7,
        CodeRate::Fec8_9 => 8,
        CodeRate::Auto => 9,
        CodeRate::Fec3_5 => 10,
        CodeRate::Fec9_10 => 11,
    }
}

/// `enum fe_rolloff`.
pub fn rolloff_code(r: RollOff) -> u32 {
    match r {
        RollOff::R35 => 0,
        RollOff::R20 => 1,
        RollOff::R25 => 2,
        RollOff::Auto => 3,
    }
}

/// `enum fe_pilot`.
pub fn pilot_code(p: Pilot) -> u32 {
    match p {
        Pilot::On => 0,
        Pilot::Off => 1,
        Pilot::Auto => 2,
    }
}

/// `enum fe_transmit_mode`.
pub fn transmission_mode_code(t: TransmissionMode) -> u32 {
    match t {
        TransmissionMode::Mode2k => 0,
        TransmissionMode::Mode8k => 1,
        TransmissionMode::Auto => 2,
        TransmissionMode::Mode4k => 3,
        TransmissionMode::Mode1k => 4,
        TransmissionMode::Mode16k => 5,
        TransmissionMode::Mode32k => 6,
    }
}

/// `enum fe_guard_interval`.
pub fn guard_interval_code(g: GuardInterval) -> u32 {
    match g {
        GuardInterval::G1_32 => 0,
        GuardInterval::G1_16 => 1,
        GuardInterval::G1_8 => 2,
        GuardInterval::G1_4 => 3,
        GuardInterval::Auto => 4,
        GuardInterval::G1_128 => 5,
        GuardInterval::G19_128 => 6,
        GuardInterval::G19_256 => 7,
    }
}

/// Gold code of a PLS root code, `None` for an invalid root.
pub fn root_to_gold(root: u32) -> Option<u32> {
    let mut x: u32 = 1;
    for gold in 0..0x3FFFF {
        if x == root {
            return Some(gold);
        }
        x = (((x ^ (x >> 7)) & 1) << 17) | (x >> 1);
    }
    None
}

/// Gold code to put in `DTV_SCRAMBLING_SEQUENCE_INDEX`.
pub fn pls_gold_code(mode: PlsMode, code: u32) -> Option<u32> {
    match mode {
        PlsMode::Root => root_to_gold(code),
        PlsMode::Gold | PlsMode::Combo => Some(code),
    }
}

/// Value of the 16 bit `DTV_STREAM_ID` with the PLS in the upper bits, the
/// encoding drivers without `DTV_SCRAMBLING_SEQUENCE_INDEX` expect.
pub fn stream_id_with_pls(stream_id: i16, mode: PlsMode, code: u32) -> u32 {
    if stream_id < 0 {
        return NO_STREAM_ID_FILTER;
    }
    let mode_bits = match mode {
        PlsMode::Root => 0,
        PlsMode::Gold => 1,
        PlsMode::Combo => 2,
    };
    (stream_id as u32 & 0xFF) | ((code & 0x3FFFF) << 8) | (mode_bits << 26)
}

/// Pack PLS codes into buffer properties, eight codes per property.
pub fn pls_search_list(codes: &[u32]) -> Vec<DtvProperty> {
    codes
        .chunks(BUFFER_LEN / 4)
        .map(|chunk| {
            let bytes: Vec<u8> = chunk.iter().flat_map(|c| c.to_ne_bytes()).collect();
            DtvProperty::with_buffer(DTV_PLS_SEARCH_LIST, &bytes)
        })
        .collect()
}

/// Decode the stream ids of a `DTV_ISI_LIST` bitmap.
pub fn isi_list(bitmap: &[u8]) -> Vec<u8> {
    let mut ids = Vec::new();
    for (byte_idx, byte) in bitmap.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                ids.push((byte_idx * 8 + bit) as u8);
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_abi_size() {
        assert_eq!(std::mem::size_of::<DtvProperty>(), 76);
    }

    #[test]
    fn test_property_list_builder() {
        let mut list = PropertyList::cleared();
        list.add(DTV_DELIVERY_SYSTEM, delivery_system_code(DeliverySystem::DvbS2))
            .add(DTV_FREQUENCY, 2_028_000)
            .add(DTV_SYMBOL_RATE, 27_500_000)
            .tune();
        assert_eq!(
            list.commands(),
            vec![DTV_CLEAR, DTV_DELIVERY_SYSTEM, DTV_FREQUENCY, DTV_SYMBOL_RATE, DTV_TUNE]
        );
        assert_eq!(list.value(DTV_DELIVERY_SYSTEM), Some(6));
        assert_eq!(list.value(DTV_FREQUENCY), Some(2_028_000));
        let raw = list.as_raw();
        assert_eq!(raw.num, 5);
    }

    #[test]
    fn test_buffer_and_stats() {
        let p = DtvProperty::with_buffer(DTV_ISI_LIST, &[0b0000_0101, 0, 0b1000_0000]);
        assert_eq!(p.buffer(), &[0b0000_0101, 0, 0b1000_0000]);
        assert_eq!(isi_list(p.buffer()), vec![0, 2, 23]);

        let mut p = DtvProperty::new(DTV_STAT_CNR, 0);
        p.set_stats(&[DtvStat {
            scale: StatScale::Decibel,
            value: 12_500,
        }]);
        assert_eq!(
            p.stats(),
            vec![DtvStat {
                scale: StatScale::Decibel,
                value: 12_500
            }]
        );
    }

    #[test]
    fn test_pls_codes() {
        assert_eq!(root_to_gold(1), Some(0));
        assert_eq!(root_to_gold(0), None);
        assert_eq!(pls_gold_code(PlsMode::Gold, 8), Some(8));
        assert_eq!(stream_id_with_pls(-1, PlsMode::Root, 1), NO_STREAM_ID_FILTER);
        assert_eq!(stream_id_with_pls(5, PlsMode::Gold, 3) & 0xFF, 5);

        let list = pls_search_list(&(0..10).collect::<Vec<_>>());
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].buffer().len(), 32);
        assert_eq!(list[1].buffer().len(), 8);
    }
}
