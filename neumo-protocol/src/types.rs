//! Record types exchanged between the SI engine, the tuner and the database.
//!
//! Frequencies are in kHz, symbol rates in symbols/s, satellite positions in
//! 1/100 degree with east positive.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Satellite position in 1/100 degree.
pub type SatPos = i16;

/// Pseudo satellite positions for non-satellite delivery systems.
pub mod sat_pos {
    /// Cable muxes.
    pub const DVBC: i16 = 0x7FFA;
    /// Terrestrial muxes.
    pub const DVBT: i16 = 0x7FFB;
    /// Unknown / not set.
    pub const NONE: i16 = 0x7FFF;

    /// True for real orbital positions.
    pub fn is_sat(sat_pos: i16) -> bool {
        sat_pos != DVBC && sat_pos != DVBT && sat_pos != NONE
    }

    /// Human readable position, e.g. `19.2E` or `30.0W`.
    pub fn to_str(sat_pos: i16) -> String {
        match sat_pos {
            DVBC => "DVBC".to_string(),
            DVBT => "DVBT".to_string(),
            NONE => "----".to_string(),
            p => {
                let dir = if p < 0 { 'W' } else { 'E' };
                let abs = (p as i32).abs();
                format!("{}.{}{}", abs / 100, (abs % 100) / 10, dir)
            }
        }
    }

    /// Inverse of [`to_str`] for orbital positions: `19.2E`, `30W`, `-5.0`.
    pub fn parse(s: &str) -> Option<i16> {
        let s = s.trim();
        let (num, sign) = match s.chars().last()? {
            'E' | 'e' => (&s[..s.len() - 1], 1.0),
            'W' | 'w' => (&s[..s.len() - 1], -1.0),
            _ => (s, 1.0),
        };
        let deg: f64 = num.parse().ok()?;
        let v = (sign * deg * 100.0).round();
        if !(-18000.0..=18000.0).contains(&v) {
            return None;
        }
        Some(v as i16)
    }
}

/// Primary key of a mux. `mux_id` disambiguates carriers that share the other fields.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MuxKey {
    pub sat_pos: SatPos,
    /// Multistream id, -1 when not a multistream.
    pub stream_id: i16,
    /// PID carrying the T2MI stream, 0 for ordinary muxes.
    pub t2mi_pid: u16,
    pub mux_id: u16,
}

impl Default for MuxKey {
    fn default() -> Self {
        Self {
            sat_pos: sat_pos::NONE,
            stream_id: -1,
            t2mi_pid: 0,
            mux_id: 0,
        }
    }
}

impl fmt::Display for MuxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", sat_pos::to_str(self.sat_pos))?;
        if self.stream_id >= 0 {
            write!(f, "-{}", self.stream_id)?;
        }
        if self.t2mi_pid > 0 {
            write!(f, "-T{}", self.t2mi_pid)?;
        }
        write!(f, "#{}", self.mux_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Polarisation {
    H,
    V,
    L,
    R,
    #[default]
    None,
}

impl Polarisation {
    /// Horizontal and left circular are selected with the high LNB voltage.
    pub fn wants_high_voltage(self) -> bool {
        matches!(self, Polarisation::H | Polarisation::L)
    }
}

impl std::str::FromStr for Polarisation {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "H" | "h" => Ok(Polarisation::H),
            "V" | "v" => Ok(Polarisation::V),
            "L" | "l" => Ok(Polarisation::L),
            "R" | "r" => Ok(Polarisation::R),
            other => Err(RecordError::Invalid(format!("polarisation {other:?}"))),
        }
    }
}

impl fmt::Display for Polarisation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Polarisation::H => "H",
            Polarisation::V => "V",
            Polarisation::L => "L",
            Polarisation::R => "R",
            Polarisation::None => "-",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeliverySystem {
    #[default]
    None,
    DvbS,
    DvbS2,
    DvbC,
    DvbT,
    DvbT2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Modulation {
    #[default]
    Auto,
    Qpsk,
    Psk8,
    Apsk16,
    Apsk32,
    Qam16,
    Qam32,
    Qam64,
    Qam128,
    Qam256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CodeRate {
    #[default]
    Auto,
    None,
    Fec1_2,
    Fec2_3,
    Fec3_4,
    Fec3_5,
    Fec4_5,
    Fec5_6,
    Fec7_8,
    Fec8_9,
    Fec9_10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RollOff {
    R35,
    R25,
    R20,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Pilot {
    On,
    Off,
    #[default]
    Auto,
}

/// Physical layer scrambling sequence family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlsMode {
    #[default]
    Root,
    Gold,
    Combo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransmissionMode {
    #[default]
    Auto,
    Mode2k,
    Mode8k,
    Mode4k,
    Mode1k,
    Mode16k,
    Mode32k,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GuardInterval {
    #[default]
    Auto,
    G1_32,
    G1_16,
    G1_8,
    G1_4,
    G1_128,
    G19_128,
    G19_256,
}

/// Where the tuning parameters of a mux came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TuneSrc {
    #[default]
    Unknown,
    /// Created as a placeholder before any confirmation.
    Template,
    /// Reported by the driver after lock.
    Driver,
    /// NIT_ACTUAL entry that matched the tuned carrier.
    NitTuned,
    /// NIT_ACTUAL entry for another carrier of the same network.
    NitActual,
    /// NIT_OTHER entry.
    NitOther,
    /// Entered by the user.
    User,
    /// Found by blind scan.
    Auto,
}

/// Where the identifying network_id/ts_id of a mux came from.
///
/// The ordering reflects authority: a source may only overwrite the key of a
/// mux whose current source is not more authoritative.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum KeySrc {
    #[default]
    None,
    /// NIT entry for a carrier other than the tuned one.
    Nit,
    NitTuned,
    PatTuned,
    SdtTuned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScanStatus {
    #[default]
    None,
    Idle,
    Pending,
    Active,
    Retry,
}

impl ScanStatus {
    /// Statuses which only make sense while a scan owns the mux.
    pub fn requires_scan_id(self) -> bool {
        matches!(self, ScanStatus::Pending | ScanStatus::Active | ScanStatus::Retry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScanResult {
    #[default]
    None,
    NoLock,
    /// Locked but not all SI tables were received.
    Partial,
    Ok,
    /// Locked but no SI data at all.
    NoData,
    /// Locked but the stream is not a transport stream.
    NotTs,
    /// Parameters cannot be tuned.
    Bad,
    Aborted,
    /// Tuner was busy, eligible for retry.
    Temporary,
}

/// How far the demodulator got on the last scan attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockResult {
    #[default]
    None,
    NoLock,
    Carrier,
    Fec,
    Sync,
    Locked,
}

/// Source which confirmed one of sat_pos, ts_id or network_id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConfirmedBy {
    #[default]
    None,
    Pat,
    Sdt,
    Nit,
    Timeout,
    Auto,
    Fake,
}

impl ConfirmedBy {
    pub fn is_confirmed(self) -> bool {
        self != ConfirmedBy::None
    }
}

bitflags! {
    /// Fields of a mux which must be kept when a record is overwritten.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MuxPreserve: u32 {
        const NETWORK_ID_TS_ID = 1 << 0;
        const NIT_IDS = 1 << 1;
        const TUNE_DATA = 1 << 2;
        const SCAN_DATA = 1 << 3;
        const NUM_SERVICES = 1 << 4;
        const EPG_TYPES = 1 << 5;
    }
}

impl MuxPreserve {
    /// Mask for writes based on SDT_ACTUAL: keys are authoritative, tuning data is not.
    pub const SDT: Self = Self::TUNE_DATA.union(Self::SCAN_DATA).union(Self::NIT_IDS);
    /// Mask for writes based on NIT: tuning data is authoritative.
    pub const NIT: Self = Self::SCAN_DATA.union(Self::NUM_SERVICES).union(Self::EPG_TYPES);
    /// Mask for writes based on what the driver reports after lock.
    pub const DRIVER: Self = Self::NETWORK_ID_TS_ID
        .union(Self::NIT_IDS)
        .union(Self::SCAN_DATA)
        .union(Self::NUM_SERVICES)
        .union(Self::EPG_TYPES);
}

/// Fields shared by all mux variants.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MuxCommon {
    pub network_id: u16,
    pub ts_id: u16,
    /// Values reported by NIT, kept apart from SDT/driver confirmed ones.
    pub nit_network_id: u16,
    pub nit_ts_id: u16,
    pub tune_src: TuneSrc,
    pub key_src: KeySrc,
    pub scan_status: ScanStatus,
    pub scan_id: i32,
    pub scan_result: ScanResult,
    pub scan_lock_result: LockResult,
    /// Unix time of the last scan.
    pub scan_time: i64,
    /// Seconds spent on the last scan.
    pub scan_duration: u32,
    pub num_services: u16,
    pub epg_scan: bool,
    /// Unix time of the last modification.
    pub mtime: i64,
}

impl MuxCommon {
    /// Change scan status, refusing active statuses without a valid scan id.
    pub fn set_scan_status(&mut self, status: ScanStatus, scan_id: i32) -> Result<(), RecordError> {
        if status.requires_scan_id() && scan_id <= 0 {
            return Err(RecordError::InvalidScanId { status, scan_id });
        }
        self.scan_status = status;
        self.scan_id = if status.requires_scan_id() { scan_id } else { 0 };
        Ok(())
    }

    pub fn scan_status_is_consistent(&self) -> bool {
        !self.scan_status.requires_scan_id() || self.scan_id > 0
    }

    /// Copy the fields selected by `preserve` from `old` into `self`.
    pub fn preserve_from(&mut self, old: &MuxCommon, preserve: MuxPreserve) {
        if preserve.contains(MuxPreserve::NETWORK_ID_TS_ID) {
            self.network_id = old.network_id;
            self.ts_id = old.ts_id;
            self.key_src = old.key_src;
        }
        if preserve.contains(MuxPreserve::NIT_IDS) {
            self.nit_network_id = old.nit_network_id;
            self.nit_ts_id = old.nit_ts_id;
        }
        if preserve.contains(MuxPreserve::TUNE_DATA) {
            self.tune_src = old.tune_src;
        }
        if preserve.contains(MuxPreserve::SCAN_DATA) {
            self.scan_status = old.scan_status;
            self.scan_id = old.scan_id;
            self.scan_result = old.scan_result;
            self.scan_lock_result = old.scan_lock_result;
            self.scan_time = old.scan_time;
            self.scan_duration = old.scan_duration;
        }
        if preserve.contains(MuxPreserve::NUM_SERVICES) {
            self.num_services = old.num_services;
        }
        if preserve.contains(MuxPreserve::EPG_TYPES) {
            self.epg_scan = old.epg_scan;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DvbsMux {
    pub k: MuxKey,
    pub frequency: u32,
    pub pol: Polarisation,
    pub symbol_rate: u32,
    pub delivery_system: DeliverySystem,
    pub modulation: Modulation,
    pub fec: CodeRate,
    pub rolloff: RollOff,
    pub pilot: Pilot,
    pub pls_mode: PlsMode,
    pub pls_code: u32,
    /// Last matype reported by the demodulator, -1 when unknown.
    pub matype: i16,
    pub c: MuxCommon,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DvbcMux {
    pub k: MuxKey,
    pub frequency: u32,
    pub symbol_rate: u32,
    pub delivery_system: DeliverySystem,
    pub modulation: Modulation,
    pub fec_inner: CodeRate,
    pub c: MuxCommon,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DvbtMux {
    pub k: MuxKey,
    pub frequency: u32,
    /// Channel bandwidth in Hz.
    pub bandwidth: u32,
    pub delivery_system: DeliverySystem,
    pub modulation: Modulation,
    pub transmission_mode: TransmissionMode,
    pub guard_interval: GuardInterval,
    pub hp_code_rate: CodeRate,
    pub lp_code_rate: CodeRate,
    pub c: MuxCommon,
}

/// Which family of delivery systems a mux belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryKind {
    Sat,
    Cable,
    Terrestrial,
}

/// A tunable carrier of any delivery system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnyMux {
    Dvbs(DvbsMux),
    Dvbc(DvbcMux),
    Dvbt(DvbtMux),
}

impl Default for AnyMux {
    fn default() -> Self {
        AnyMux::Dvbs(DvbsMux::default())
    }
}

impl From<DvbsMux> for AnyMux {
    fn from(m: DvbsMux) -> Self {
        AnyMux::Dvbs(m)
    }
}

impl From<DvbcMux> for AnyMux {
    fn from(m: DvbcMux) -> Self {
        AnyMux::Dvbc(m)
    }
}

impl From<DvbtMux> for AnyMux {
    fn from(m: DvbtMux) -> Self {
        AnyMux::Dvbt(m)
    }
}

impl AnyMux {
    pub fn kind(&self) -> DeliveryKind {
        match self {
            AnyMux::Dvbs(_) => DeliveryKind::Sat,
            AnyMux::Dvbc(_) => DeliveryKind::Cable,
            AnyMux::Dvbt(_) => DeliveryKind::Terrestrial,
        }
    }

    pub fn key(&self) -> &MuxKey {
        match self {
            AnyMux::Dvbs(m) => &m.k,
            AnyMux::Dvbc(m) => &m.k,
            AnyMux::Dvbt(m) => &m.k,
        }
    }

    pub fn key_mut(&mut self) -> &mut MuxKey {
        match self {
            AnyMux::Dvbs(m) => &mut m.k,
            AnyMux::Dvbc(m) => &mut m.k,
            AnyMux::Dvbt(m) => &mut m.k,
        }
    }

    pub fn common(&self) -> &MuxCommon {
        match self {
            AnyMux::Dvbs(m) => &m.c,
            AnyMux::Dvbc(m) => &m.c,
            AnyMux::Dvbt(m) => &m.c,
        }
    }

    pub fn common_mut(&mut self) -> &mut MuxCommon {
        match self {
            AnyMux::Dvbs(m) => &mut m.c,
            AnyMux::Dvbc(m) => &mut m.c,
            AnyMux::Dvbt(m) => &mut m.c,
        }
    }

    pub fn frequency(&self) -> u32 {
        match self {
            AnyMux::Dvbs(m) => m.frequency,
            AnyMux::Dvbc(m) => m.frequency,
            AnyMux::Dvbt(m) => m.frequency,
        }
    }

    pub fn set_frequency(&mut self, frequency: u32) {
        match self {
            AnyMux::Dvbs(m) => m.frequency = frequency,
            AnyMux::Dvbc(m) => m.frequency = frequency,
            AnyMux::Dvbt(m) => m.frequency = frequency,
        }
    }

    pub fn pol(&self) -> Polarisation {
        match self {
            AnyMux::Dvbs(m) => m.pol,
            AnyMux::Dvbc(_) | AnyMux::Dvbt(_) => Polarisation::None,
        }
    }

    /// Symbol rate, or 0 for OFDM based systems.
    pub fn symbol_rate(&self) -> u32 {
        match self {
            AnyMux::Dvbs(m) => m.symbol_rate,
            AnyMux::Dvbc(m) => m.symbol_rate,
            AnyMux::Dvbt(_) => 0,
        }
    }

    pub fn delivery_system(&self) -> DeliverySystem {
        match self {
            AnyMux::Dvbs(m) => m.delivery_system,
            AnyMux::Dvbc(m) => m.delivery_system,
            AnyMux::Dvbt(m) => m.delivery_system,
        }
    }

    pub fn as_dvbs(&self) -> Option<&DvbsMux> {
        match self {
            AnyMux::Dvbs(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_dvbs_mut(&mut self) -> Option<&mut DvbsMux> {
        match self {
            AnyMux::Dvbs(m) => Some(m),
            _ => None,
        }
    }

    /// Frequency window within which two descriptions denote the same carrier.
    pub fn frequency_tolerance(&self) -> u32 {
        match self {
            AnyMux::Dvbs(m) => ((m.symbol_rate / 1000) / 4).max(1000),
            AnyMux::Dvbc(_) | AnyMux::Dvbt(_) => 1000,
        }
    }

    /// True if `other` describes the same physical carrier, ignoring its claimed key.
    pub fn matches_physical(&self, other: &AnyMux) -> bool {
        if self.kind() != other.kind() {
            return false;
        }
        let (a, b) = (self.key(), other.key());
        if a.sat_pos != b.sat_pos || a.stream_id != b.stream_id || a.t2mi_pid != b.t2mi_pid {
            return false;
        }
        if self.pol() != other.pol() {
            return false;
        }
        let tolerance = self.frequency_tolerance().max(other.frequency_tolerance());
        self.frequency().abs_diff(other.frequency()) <= tolerance
    }

    /// True if the mux has enough parameters to be handed to a tuner.
    pub fn is_tunable(&self) -> bool {
        match self {
            AnyMux::Dvbs(m) => m.frequency > 0 && m.symbol_rate > 0 && m.pol != Polarisation::None,
            AnyMux::Dvbc(m) => m.frequency > 0 && m.symbol_rate > 0,
            AnyMux::Dvbt(m) => m.frequency > 0,
        }
    }
}

impl fmt::Display for AnyMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyMux::Dvbs(m) => {
                write!(f, "{} {}.{:03}{}", sat_pos::to_str(m.k.sat_pos), m.frequency / 1000, m.frequency % 1000, m.pol)?;
                if m.k.stream_id >= 0 {
                    write!(f, "-{}", m.k.stream_id)?;
                }
                if m.k.t2mi_pid > 0 {
                    write!(f, "-T{}", m.k.t2mi_pid)?;
                }
                Ok(())
            }
            AnyMux::Dvbc(m) => write!(f, "C{}.{:03}", m.frequency / 1000, m.frequency % 1000),
            AnyMux::Dvbt(m) => write!(f, "T{}.{:03}", m.frequency / 1000, m.frequency % 1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MediaMode {
    #[default]
    Unknown,
    Tv,
    Radio,
    Data,
}

impl MediaMode {
    /// Classification of the DVB service_type byte.
    pub fn from_service_type(service_type: u8) -> Self {
        match service_type {
            0x01 | 0x11 | 0x16 | 0x17 | 0x18 | 0x19 | 0x1A | 0x1B | 0x1C | 0x1D | 0x1E | 0x1F => {
                MediaMode::Tv
            }
            0x02 | 0x07 | 0x0A => MediaMode::Radio,
            0x00 => MediaMode::Unknown,
            _ => MediaMode::Data,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ServiceKey {
    pub mux: MuxKey,
    pub network_id: u16,
    pub ts_id: u16,
    pub service_id: u16,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Service {
    pub k: ServiceKey,
    pub name: String,
    pub provider: String,
    pub service_type: u8,
    pub media_mode: MediaMode,
    pub encrypted: bool,
    pub pmt_pid: u16,
    pub video_pid: u16,
    /// Copied from the mux for queries.
    pub frequency: u32,
    pub pol: Polarisation,
    /// Set when the service vanished from a complete SDT cycle.
    pub expired: bool,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum ChgType {
    #[default]
    Bouquet,
    Fav,
}

/// Key of a channel group (bouquet).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ChgKey {
    pub group_type: ChgType,
    pub bouquet_id: u16,
    pub sat_pos: SatPos,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Chg {
    pub k: ChgKey,
    pub name: String,
    pub num_channels: u32,
    pub mtime: i64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ChgmKey {
    pub chg: ChgKey,
    pub channel_id: u32,
}

/// A channel inside a bouquet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Chgm {
    pub k: ChgmKey,
    pub service: ServiceKey,
    /// Logical channel number.
    pub chgm_order: u16,
    pub name: String,
    pub media_mode: MediaMode,
    pub encrypted: bool,
    pub expired: bool,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum EpgType {
    #[default]
    Dvb,
    Freesat,
    Viasat,
    SkyUk,
    SkyIt,
    Mhw2,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct EpgServiceKey {
    pub sat_pos: SatPos,
    pub network_id: u16,
    pub ts_id: u16,
    pub service_id: u16,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct EpgKey {
    pub service: EpgServiceKey,
    /// Unix time.
    pub start_time: i64,
    pub event_id: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EpgSource {
    pub epg_type: EpgType,
    pub table_id: u8,
    pub version: u8,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EpgRecord {
    pub k: EpgKey,
    pub end_time: i64,
    pub event_name: String,
    pub story: String,
    pub content_codes: Vec<u8>,
    pub source: EpgSource,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum LnbType {
    #[default]
    Universal,
    C,
    Ku,
    KaA,
    KaB,
    KaC,
    KaD,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct LnbKey {
    pub dish_id: i8,
    pub lnb_id: i16,
    pub lnb_type: LnbType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LnbPolType {
    #[default]
    Hv,
    Vh,
    Lr,
    Rl,
    H,
    V,
    L,
    R,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RotorControl {
    #[default]
    FixedDish,
    /// This connection moves the dish with USALS commands.
    MasterUsals,
    /// This connection moves the dish with stored DiSEqC 1.2 positions.
    MasterDiseqc12,
    /// The dish is moved by another connection.
    Slave,
}

impl RotorControl {
    pub fn is_master(self) -> bool {
        matches!(self, RotorControl::MasterUsals | RotorControl::MasterDiseqc12)
    }
}

/// A satellite reachable through an LNB.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LnbNetwork {
    pub sat_pos: SatPos,
    /// Dish position to use for this satellite (may differ for offset LNBs).
    pub usals_pos: SatPos,
    /// DiSEqC 1.2 preset slot, -1 when not stored.
    pub diseqc12: i16,
    pub enabled: bool,
}

/// How an LNB is cabled to a card input.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LnbConnection {
    pub card_mac_address: i64,
    pub rf_input: i32,
    pub rotor_control: RotorControl,
    /// DiSEqC command string, one letter per operation.
    pub tune_string: String,
    /// Committed switch port, -1 when absent.
    pub diseqc_10: i8,
    /// Uncommitted switch port, -1 when absent.
    pub diseqc_11: i8,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Lnb {
    pub k: LnbKey,
    pub pol_type: LnbPolType,
    /// Local oscillator frequencies in kHz.
    pub lof_low: i32,
    pub lof_high: i32,
    /// Input frequency range and band switch point in kHz.
    pub freq_low: u32,
    pub freq_mid: u32,
    pub freq_high: u32,
    /// Current dish position.
    pub usals_pos: SatPos,
    pub networks: Vec<LnbNetwork>,
    pub connections: Vec<LnbConnection>,
    pub enabled: bool,
}

/// Identifies the signal path from an LNB to a card input.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct RfPath {
    pub lnb: LnbKey,
    pub card_mac_address: i64,
    pub rf_input: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Band {
    #[default]
    Low,
    High,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SpectrumKey {
    pub rf_path: RfPath,
    pub sat_pos: SatPos,
    pub pol: PolKey,
    pub band: Band,
    pub start_time: i64,
}

/// Orderable mirror of [`Polarisation`] for use inside keys.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum PolKey {
    H,
    V,
    L,
    R,
    #[default]
    None,
}

impl From<Polarisation> for PolKey {
    fn from(p: Polarisation) -> Self {
        match p {
            Polarisation::H => PolKey::H,
            Polarisation::V => PolKey::V,
            Polarisation::L => PolKey::L,
            Polarisation::R => PolKey::R,
            Polarisation::None => PolKey::None,
        }
    }
}

/// Candidate carrier found in a spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpectralPeak {
    pub frequency: u32,
    pub symbol_rate: u32,
    pub pol: Polarisation,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpectrumRecord {
    pub k: SpectrumKey,
    pub start_frequency: u32,
    pub end_frequency: u32,
    pub resolution: u32,
    pub usals_pos: SatPos,
    pub freq: Vec<u32>,
    /// Levels in 0.001 dB.
    pub rf_level: Vec<i32>,
    pub peaks: Vec<SpectralPeak>,
}

/// One signal measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalSample {
    pub time: i64,
    /// 0.001 dBm.
    pub signal_strength: i32,
    /// 0.001 dB.
    pub snr: i32,
    pub ber: f32,
    pub locked: bool,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SignalStatKey {
    pub mux: MuxKey,
    pub rf_path: RfPath,
    pub time: i64,
}

/// Signal history of one tune, written when the tune ends.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalStat {
    pub k: SignalStatKey,
    pub frequency: u32,
    pub pol: Polarisation,
    /// Milliseconds from tune start to lock, -1 if never locked.
    pub lock_time_ms: i32,
    pub stats: Vec<SignalSample>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dvbs(freq: u32, pol: Polarisation, sr: u32) -> AnyMux {
        AnyMux::Dvbs(DvbsMux {
            k: MuxKey {
                sat_pos: 1920,
                ..Default::default()
            },
            frequency: freq,
            pol,
            symbol_rate: sr,
            ..Default::default()
        })
    }

    #[test]
    fn test_sat_pos_str() {
        assert_eq!(sat_pos::to_str(1920), "19.2E");
        assert_eq!(sat_pos::to_str(-3000), "30.0W");
        assert_eq!(sat_pos::to_str(sat_pos::DVBT), "DVBT");
        assert!(!sat_pos::is_sat(sat_pos::DVBC));
    }

    #[test]
    fn test_sat_pos_parse() {
        assert_eq!(sat_pos::parse("19.2E"), Some(1920));
        assert_eq!(sat_pos::parse("30W"), Some(-3000));
        assert_eq!(sat_pos::parse("-0.8"), Some(-80));
        assert_eq!(sat_pos::parse("200E"), None);
        assert_eq!(sat_pos::parse(""), None);
        assert_eq!("h".parse::<Polarisation>(), Ok(Polarisation::H));
        assert!("X".parse::<Polarisation>().is_err());
    }

    #[test]
    fn test_matches_physical_tolerance() {
        let a = dvbs(11_778_000, Polarisation::V, 27_500_000);
        assert!(a.matches_physical(&dvbs(11_779_000, Polarisation::V, 27_500_000)));
        assert!(!a.matches_physical(&dvbs(11_778_000, Polarisation::H, 27_500_000)));
        assert!(!a.matches_physical(&dvbs(11_817_000, Polarisation::V, 27_500_000)));
    }

    #[test]
    fn test_scan_status_requires_scan_id() {
        let mut c = MuxCommon::default();
        assert!(c.set_scan_status(ScanStatus::Pending, 0).is_err());
        assert!(c.scan_status_is_consistent());
        c.set_scan_status(ScanStatus::Active, 3).unwrap();
        assert_eq!(c.scan_id, 3);
        c.set_scan_status(ScanStatus::Idle, 3).unwrap();
        assert_eq!(c.scan_id, 0);
    }

    #[test]
    fn test_preserve_masks() {
        let mut old = MuxCommon::default();
        old.network_id = 1;
        old.ts_id = 1051;
        old.key_src = KeySrc::SdtTuned;
        old.scan_result = ScanResult::Ok;

        let mut new = MuxCommon::default();
        new.network_id = 2;
        new.ts_id = 7;
        new.tune_src = TuneSrc::NitActual;
        new.preserve_from(&old, MuxPreserve::NIT | MuxPreserve::NETWORK_ID_TS_ID);

        assert_eq!(new.network_id, 1);
        assert_eq!(new.ts_id, 1051);
        assert_eq!(new.key_src, KeySrc::SdtTuned);
        assert_eq!(new.scan_result, ScanResult::Ok);
        assert_eq!(new.tune_src, TuneSrc::NitActual);
    }

    #[test]
    fn test_media_mode() {
        assert_eq!(MediaMode::from_service_type(0x19), MediaMode::Tv);
        assert_eq!(MediaMode::from_service_type(0x02), MediaMode::Radio);
        assert_eq!(MediaMode::from_service_type(0x0C), MediaMode::Data);
    }
}
