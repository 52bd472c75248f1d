use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;

use neumo_protocol::{sat_pos, DeliverySystem, LnbType, Modulation, PlsMode, Polarisation};

#[derive(Debug, Parser)]
#[clap(name = "neumo-tune")]
#[clap(about = "neumo-tune drives a single DVB frontend through the tuning sequencer. ", long_about = None)]
#[clap(version)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Tune and report lock status.{n}
    /// Signal strength and SNR are printed once per second
    /// until the duration elapsed or Ctrl-C is pressed.
    Tune {
        #[clap(flatten)]
        target: TuneArgs,

        /// How long to keep reporting, in seconds.{n}
        /// If the duration is not specified or is not positive,
        /// reporting continues until the user stops it.
        #[clap(short, long, value_name = "seconds")]
        time: Option<f64>,
    },
    /// Tune and capture raw constellation samples.{n}
    /// The samples are written as `re,im` lines.
    Iq {
        #[clap(flatten)]
        target: TuneArgs,

        /// Number of samples to read.
        #[clap(short = 'n', long, default_value_t = 1024)]
        samples: usize,

        /// Output file; stdout when omitted.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum DelSys {
    DvbS,
    #[default]
    DvbS2,
}

impl From<DelSys> for DeliverySystem {
    fn from(d: DelSys) -> Self {
        match d {
            DelSys::DvbS => DeliverySystem::DvbS,
            DelSys::DvbS2 => DeliverySystem::DvbS2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum ModArg {
    #[default]
    Auto,
    Qpsk,
    #[value(name = "8psk")]
    Psk8,
    #[value(name = "16apsk")]
    Apsk16,
    #[value(name = "32apsk")]
    Apsk32,
}

impl From<ModArg> for Modulation {
    fn from(m: ModArg) -> Self {
        match m {
            ModArg::Auto => Modulation::Auto,
            ModArg::Qpsk => Modulation::Qpsk,
            ModArg::Psk8 => Modulation::Psk8,
            ModArg::Apsk16 => Modulation::Apsk16,
            ModArg::Apsk32 => Modulation::Apsk32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum PlsModeArg {
    #[default]
    Root,
    Gold,
    Combo,
}

impl From<PlsModeArg> for PlsMode {
    fn from(m: PlsModeArg) -> Self {
        match m {
            PlsModeArg::Root => PlsMode::Root,
            PlsModeArg::Gold => PlsMode::Gold,
            PlsModeArg::Combo => PlsMode::Combo,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum LnbArg {
    #[default]
    Universal,
    C,
    Ku,
}

impl From<LnbArg> for LnbType {
    fn from(l: LnbArg) -> Self {
        match l {
            LnbArg::Universal => LnbType::Universal,
            LnbArg::C => LnbType::C,
            LnbArg::Ku => LnbType::Ku,
        }
    }
}

/// Frontend selection and the mux to tune.
#[derive(Debug, Clone, Args)]
pub(crate) struct TuneArgs {
    /// Adapter number, as in `/dev/dvb/adapterN`.
    #[clap(short, long, default_value_t = 0)]
    pub adapter: u32,

    /// Frontend number on the adapter.
    #[clap(short = 'F', long, default_value_t = 0)]
    pub frontend: u32,

    /// RF input of the card the LNB cable is connected to.
    #[clap(short, long, default_value_t = 0)]
    pub rf_input: i32,

    /// Frequency in kHz, e.g. 11778000.
    #[clap(short, long = "freq", value_name = "kHz", required = true)]
    pub frequency: u32,

    /// Symbol rate in symbols per second.
    #[clap(short, long = "sr", default_value_t = 27_500_000)]
    pub symbol_rate: u32,

    /// Polarisation: H, V, L or R.
    #[clap(short, long = "pol", value_parser = parse_pol, default_value = "V")]
    pub pol: Polarisation,

    /// Satellite position, e.g. 19.2E or 30.0W.
    #[clap(long, value_parser = parse_sat, default_value = "19.2E")]
    pub sat: i16,

    #[clap(value_enum, long = "delsys", default_value_t = DelSys::DvbS2)]
    pub delivery_system: DelSys,

    #[clap(value_enum, short, long, default_value_t = ModArg::Auto)]
    pub modulation: ModArg,

    /// DVB-S2 input stream id; -1 receives all streams.
    #[clap(long, default_value_t = -1, allow_negative_numbers = true)]
    pub stream_id: i16,

    #[clap(value_enum, long, default_value_t = PlsModeArg::Root)]
    pub pls_mode: PlsModeArg,

    /// PLS code of the stream (decimal or 0x-prefixed hex).
    #[clap(long, value_parser = maybe_hex::<u32>, default_value_t = 1)]
    pub pls_code: u32,

    /// Additional PLS codes tried by a blind tune. May be repeated.
    #[clap(long = "pls-search", value_parser = maybe_hex::<u32>)]
    pub pls_search: Vec<u32>,

    /// Range of gold codes searched by a blind tune, as START-END.
    #[clap(long, value_parser = parse_range)]
    pub pls_range: Option<(u32, u32)>,

    /// Let the demodulator search symbol rate, modulation and PLS code.
    #[clap(long)]
    pub blind: bool,

    /// DiSEqC command string, one letter per operation (M, C, U, P, X, W).
    #[clap(short, long, default_value = "")]
    pub diseqc: String,

    /// Committed switch port (DiSEqC 1.0), -1 for none.
    #[clap(short, long, default_value_t = -1, allow_negative_numbers = true)]
    pub committed: i8,

    /// Uncommitted switch port (DiSEqC 1.1), -1 for none.
    #[clap(short, long, default_value_t = -1, allow_negative_numbers = true)]
    pub uncommitted: i8,

    #[clap(value_enum, long, default_value_t = LnbArg::Universal)]
    pub lnb: LnbArg,

    /// How long to wait for lock, in milliseconds.
    #[clap(long, default_value_t = 5000)]
    pub lock_timeout: u64,
}

fn parse_pol(s: &str) -> Result<Polarisation, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn parse_sat(s: &str) -> Result<i16, String> {
    sat_pos::parse(s).ok_or_else(|| format!("invalid satellite position {s:?}"))
}

fn parse_range(s: &str) -> Result<(u32, u32), String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| "expected START-END".to_string())?;
    let start = maybe_hex::<u32>(start.trim())?;
    let end = maybe_hex::<u32>(end.trim())?;
    if start > end {
        return Err(format!("empty range {start}-{end}"));
    }
    Ok((start, end))
}
