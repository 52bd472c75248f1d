//! Receiver configuration.
//!
//! Loaded from a TOML file where every section is optional:
//!
//! ```toml
//! [database]
//! path = "neumo.db"
//!
//! [logging]
//! log_dir = "logs"
//! retention_days = 7
//!
//! [si]
//! sat_pos_tolerance = 30
//! pat_stable_hold_ms = 5000
//! retune_mode = "auto"
//!
//! [[adapter]]
//! adapter_no = 0
//! frontend_no = 0
//! ```

use std::path::Path;
use std::time::Duration;

use neumo_protocol::Lnb;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::fixups::PolarisationFix;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What to do when SI shows the dish points at another satellite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RetuneMode {
    /// Retune whenever confirmation fails.
    #[default]
    Auto,
    /// Never retune on SI evidence.
    Never,
    /// Retune only when the demodulator lost lock.
    IfNotLocked,
}

/// Tolerances and timeouts of the SI engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiPolicy {
    /// Maximal sat_pos difference (1/100 degree) still treated as the tuned satellite.
    pub sat_pos_tolerance: u16,
    /// A PAT must be unchanged this long before it is stable.
    pub pat_stable_hold_ms: u64,
    /// A table that never produced data for this long is not present.
    pub table_not_present_ms: u64,
    /// A table that produced no data for this long since its last activity is stalled.
    pub table_stalled_ms: u64,
    /// Window for receiving all sections of one subtable.
    pub subtable_timeout_ms: u64,
    pub retune_mode: RetuneMode,
    pub abort_on_wrong_sat: bool,
    /// Relisten cycles before a sat_pos mismatch counts as a wrong satellite.
    pub max_wrong_sat_resets: u32,
    /// Maximal number of EIT/BAT fragments held back before confirmation.
    pub pending_queue_limit: usize,
    /// Maximal duration of one processing batch.
    pub batch_deadline_ms: u64,
    /// Include EPG tables in the scan completion criterion.
    pub scan_epg: bool,
    /// Transponders with a wrong polarisation in their NIT entry, in addition
    /// to the built-in list.
    pub polarisation_fixes: Vec<PolarisationFix>,
}

impl Default for SiPolicy {
    fn default() -> Self {
        Self {
            sat_pos_tolerance: 30,
            pat_stable_hold_ms: 5_000,
            table_not_present_ms: 20_000,
            table_stalled_ms: 50_000,
            subtable_timeout_ms: 15_000,
            retune_mode: RetuneMode::Auto,
            abort_on_wrong_sat: true,
            max_wrong_sat_resets: 1,
            pending_queue_limit: 4096,
            batch_deadline_ms: 500,
            scan_epg: false,
            polarisation_fixes: Vec::new(),
        }
    }
}

impl SiPolicy {
    pub fn pat_stable_hold(&self) -> Duration {
        Duration::from_millis(self.pat_stable_hold_ms)
    }

    pub fn table_not_present(&self) -> Duration {
        Duration::from_millis(self.table_not_present_ms)
    }

    pub fn table_stalled(&self) -> Duration {
        Duration::from_millis(self.table_stalled_ms)
    }

    pub fn subtable_timeout(&self) -> Duration {
        Duration::from_millis(self.subtable_timeout_ms)
    }

    pub fn batch_deadline(&self) -> Duration {
        Duration::from_millis(self.batch_deadline_ms)
    }

    /// PAT hold < not-present < stalled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pat_stable_hold_ms >= self.table_not_present_ms {
            return Err(ConfigError::Invalid(format!(
                "pat_stable_hold_ms ({}) must be smaller than table_not_present_ms ({})",
                self.pat_stable_hold_ms, self.table_not_present_ms
            )));
        }
        if self.table_not_present_ms >= self.table_stalled_ms {
            return Err(ConfigError::Invalid(format!(
                "table_not_present_ms ({}) must be smaller than table_stalled_ms ({})",
                self.table_not_present_ms, self.table_stalled_ms
            )));
        }
        if self.batch_deadline_ms == 0 {
            return Err(ConfigError::Invalid("batch_deadline_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Delays of the satellite equipment control sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecTiming {
    /// Pause after each DiSEqC message and tone change.
    pub diseqc_settle_ms: u64,
    /// Pause after switching LNB power on.
    pub power_up_settle_ms: u64,
    /// Duration of the `W` letter in a DiSEqC string.
    pub pause_ms: u64,
    /// Dish speed in 1/100 degree per second.
    pub rotor_speed_centideg_per_s: u32,
    /// Added to every computed rotor move.
    pub rotor_margin_ms: u64,
    /// Extra repetitions of each switch command.
    pub diseqc_repeats: u8,
    /// Dish location for USALS, in 1/100 degree (north and east positive).
    pub site_latitude: i32,
    pub site_longitude: i32,
}

impl Default for SecTiming {
    fn default() -> Self {
        Self {
            diseqc_settle_ms: 15,
            power_up_settle_ms: 200,
            pause_ms: 200,
            rotor_speed_centideg_per_s: 150,
            rotor_margin_ms: 1_000,
            diseqc_repeats: 0,
            site_latitude: 5_100,
            site_longitude: 400,
        }
    }
}

impl SecTiming {
    /// No delays at all, for tests.
    pub fn immediate() -> Self {
        Self {
            diseqc_settle_ms: 0,
            power_up_settle_ms: 0,
            pause_ms: 0,
            rotor_margin_ms: 0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Time allowed for the demodulator to lock.
    pub lock_timeout_ms: u64,
    /// Automatic retunes of the same mux after an SI abort.
    pub max_retunes: u32,
    /// Poll interval of the frontend monitor.
    pub monitor_interval_ms: u64,
    /// Frequency search range for blind tunes in kHz.
    pub blind_search_range_khz: u32,
    /// Maximal number of muxes scanned in parallel.
    pub max_concurrent_scans: usize,
    /// Period of the tuner thread loop.
    pub tick_ms: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 3_000,
            max_retunes: 3,
            monitor_interval_ms: 300,
            blind_search_range_khz: 10_000,
            max_concurrent_scans: 4,
            tick_ms: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub adapter_no: u32,
    pub frontend_no: u32,
    pub card_mac_address: i64,
    /// RF inputs selectable on this frontend.
    pub rf_inputs: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

/// Complete configuration file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub database: DatabaseSection,
    pub logging: LoggingSection,
    pub si: SiPolicy,
    pub sec: SecTiming,
    pub tuning: TuningConfig,
    pub adapter: Vec<AdapterConfig>,
    pub lnb: Vec<Lnb>,
}

impl ReceiverConfig {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ReceiverConfig = toml::from_str(contents)?;
        config.si.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ReceiverConfig::from_toml("").unwrap();
        assert_eq!(config.si, SiPolicy::default());
        assert!(config.adapter.is_empty());
    }

    #[test]
    fn test_sections() {
        let config = ReceiverConfig::from_toml(
            r#"
            [si]
            sat_pos_tolerance = 50
            retune_mode = "if_not_locked"

            [[adapter]]
            adapter_no = 1
            rf_inputs = [0, 1]
            "#,
        )
        .unwrap();
        assert_eq!(config.si.sat_pos_tolerance, 50);
        assert_eq!(config.si.retune_mode, RetuneMode::IfNotLocked);
        assert_eq!(config.si.pat_stable_hold_ms, 5_000);
        assert_eq!(config.adapter[0].adapter_no, 1);
        assert_eq!(config.adapter[0].rf_inputs, vec![0, 1]);
    }

    #[test]
    fn test_timeout_order_is_enforced() {
        let err = ReceiverConfig::from_toml(
            r#"
            [si]
            pat_stable_hold_ms = 30000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut policy = SiPolicy::default();
        policy.table_stalled_ms = policy.table_not_present_ms;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neumo.toml");
        std::fs::write(&path, "[tuning]\nmax_retunes = 7\n").unwrap();
        let config = ReceiverConfig::load(&path).unwrap();
        assert_eq!(config.tuning.max_retunes, 7);
    }
}
