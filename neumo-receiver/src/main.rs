//! neumo-receiver: DVB receiver daemon.
//!
//! Starts one tuner thread and one frontend monitor per configured adapter,
//! optionally scans muxes given on the command line, and runs until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use neumo_protocol::{sat_pos, AnyMux, DvbsMux, Lnb, MuxKey, Polarisation};
use neumo_receiver::config::{AdapterConfig, ReceiverConfig, RetuneMode};
use neumo_receiver::database::{prelude::*, Database, DatabaseHandle};
use neumo_receiver::logging;
use neumo_receiver::receiver::Receiver;
use neumo_receiver::tuner::adapter::ReaderFactory;
use neumo_receiver::tuner::{ActiveAdapter, FrontendMonitor, TuneOptions};

/// neumo-receiver - DVB receiver daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Path to the database file
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the retune policy of the SI engine
    #[arg(long, value_enum)]
    retune_mode: Option<RetuneMode>,

    /// Mux to scan, as FREQ_KHZ:POL:SYMBOL_RATE@SAT, e.g. 11778000:V:27500000@19.2E
    #[arg(long = "scan", value_parser = parse_scan_mux)]
    scan: Vec<AnyMux>,

    /// Rescan every stored mux of a satellite, e.g. 19.2E
    #[arg(long, value_parser = parse_sat)]
    scan_sat: Option<i16>,
}

fn parse_sat(s: &str) -> Result<i16, String> {
    sat_pos::parse(s).ok_or_else(|| format!("invalid satellite position {s:?}"))
}

fn parse_scan_mux(s: &str) -> Result<AnyMux, String> {
    let (tuning, sat) = s
        .split_once('@')
        .ok_or_else(|| "expected FREQ:POL:SR@SAT".to_string())?;
    let sat = parse_sat(sat)?;
    let mut parts = tuning.split(':');
    let (Some(freq), Some(pol), Some(sr), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err("expected FREQ:POL:SR@SAT".to_string());
    };
    let frequency: u32 = freq.parse().map_err(|e| format!("frequency: {e}"))?;
    let pol: Polarisation = pol.parse().map_err(|e| format!("{e}"))?;
    let symbol_rate: u32 = sr.parse().map_err(|e| format!("symbol rate: {e}"))?;
    Ok(AnyMux::Dvbs(DvbsMux {
        k: MuxKey {
            sat_pos: sat,
            ..Default::default()
        },
        frequency,
        pol,
        symbol_rate,
        matype: -1,
        ..Default::default()
    }))
}

/// LNBs of the config file are stored; without any, the stored ones are used.
fn load_lnbs(db: &DatabaseHandle, configured: &[Lnb]) -> Result<Vec<Lnb>, Box<dyn std::error::Error>> {
    let mut db = db.lock();
    if !configured.is_empty() {
        let txn = db.write_txn()?;
        for lnb in configured {
            txn.put(lnb)?;
        }
        txn.commit()?;
        return Ok(configured.to_vec());
    }
    let txn = db.read_txn()?;
    let stored = txn.all::<Lnb>()?;
    Ok(stored)
}

#[cfg(target_os = "linux")]
fn reader_factory(adapter_no: u32) -> ReaderFactory {
    use neumo_receiver::tuner::stream::{DvrReader, EmbeddedReader, StreamReader};

    Box::new(move |mux: &AnyMux, options: &TuneOptions| {
        let dvr = DvrReader::open(adapter_no, mux.clone(), options.clone())?;
        if mux.key().t2mi_pid != 0 {
            let embedded = EmbeddedReader::new(dvr, mux.clone())?;
            Ok(Box::new(embedded) as Box<dyn StreamReader>)
        } else {
            Ok(Box::new(dvr) as Box<dyn StreamReader>)
        }
    })
}

#[cfg(target_os = "linux")]
fn open_adapter(
    cfg: &AdapterConfig,
    config: &ReceiverConfig,
    db: &DatabaseHandle,
    lnbs: &[Lnb],
) -> std::io::Result<(ActiveAdapter, FrontendMonitor)> {
    use neumo_receiver::tuner::adapter::AdapterState;
    use neumo_receiver::tuner::frontend::{DvbFrontend, FrontendHandle};

    let fe: FrontendHandle = Arc::new(DvbFrontend::open(cfg.adapter_no, cfg.frontend_no)?);
    let monitor = FrontendMonitor::spawn(
        fe.clone(),
        Duration::from_millis(config.tuning.monitor_interval_ms),
    )?;
    let view = Arc::new(AdapterState::new(
        cfg.adapter_no,
        cfg.card_mac_address,
        config.si.sat_pos_tolerance,
        monitor.reader(),
    ));
    view.set_lnbs(lnbs.to_vec());
    let adapter = ActiveAdapter::new(
        view,
        fe,
        db.clone(),
        config.si.clone(),
        config.sec.clone(),
        config.tuning.clone(),
        reader_factory(cfg.adapter_no),
    );
    Ok((adapter, monitor))
}

#[cfg(not(target_os = "linux"))]
fn open_adapter(
    cfg: &AdapterConfig,
    _config: &ReceiverConfig,
    _db: &DatabaseHandle,
    _lnbs: &[Lnb],
) -> std::io::Result<(ActiveAdapter, FrontendMonitor)> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("adapter {}: DVB frontends are only supported on Linux", cfg.adapter_no),
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("neumo.toml");
        default_path.exists().then_some(default_path)
    });
    let mut config = match &config_path {
        Some(path) => match ReceiverConfig::load(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => ReceiverConfig::default(),
    };
    if let Some(mode) = args.retune_mode {
        config.si.retune_mode = mode;
    }

    // command line takes precedence
    let log_dir = args
        .log_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(config.logging.log_dir.as_deref().unwrap_or("logs")));
    let retention_days = args
        .log_retention_days
        .unwrap_or_else(|| config.logging.retention_days.unwrap_or(7));
    let _log_guard = logging::init_logging(
        &log_dir,
        retention_days,
        args.verbose,
        config.logging.level.as_deref(),
    )?;

    let db_path = args
        .database
        .clone()
        .unwrap_or_else(|| PathBuf::from(config.database.path.as_deref().unwrap_or("neumo.db")));
    info!("Opening database: {:?}", db_path);
    let db = match Database::open(&db_path) {
        Ok(db) => db.into_handle(),
        Err(e) => {
            error!("Failed to open database: {}", e);
            return Err(e.into());
        }
    };

    let lnbs = load_lnbs(&db, &config.lnb)?;
    info!("{} LNBs configured", lnbs.len());

    let mut adapters = Vec::new();
    let mut monitors = Vec::new();
    for cfg in &config.adapter {
        match open_adapter(cfg, &config, &db, &lnbs) {
            Ok((adapter, monitor)) => {
                adapters.push(adapter);
                monitors.push(monitor);
            }
            Err(e) => warn!("Adapter {} unavailable: {}", cfg.adapter_no, e),
        }
    }
    if adapters.is_empty() {
        warn!("No usable adapters; only the database is available");
    }

    let mut receiver = Receiver::new(db.clone(), config.tuning.clone(), adapters)?;

    let mut to_scan = args.scan.clone();
    if let Some(sat) = args.scan_sat {
        let mut db = db.lock();
        let txn = db.read_txn()?;
        let stored = txn.muxes_on_sat(sat)?;
        info!("Rescanning {} muxes on {}", stored.len(), sat_pos::to_str(sat));
        to_scan.extend(stored);
    }
    if !to_scan.is_empty() {
        let scan_id = receiver.start_scan(&to_scan, TuneOptions::default())?;
        info!("Scan {} started", scan_id);
    }

    receiver
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to wait for Ctrl-C: {}", e);
            }
        })
        .await;

    info!("Shutting down");
    receiver.shutdown();
    drop(monitors);
    Ok(())
}
