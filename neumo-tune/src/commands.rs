//! Tune and IQ capture on one frontend.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{info, warn};
use thiserror::Error;

use neumo_protocol::{
    sat_pos, AnyMux, DvbsMux, Lnb, LnbConnection, LnbKey, LnbNetwork, MuxKey, RotorControl,
};
use neumo_receiver::config::{SecTiming, SiPolicy};
use neumo_receiver::tuner::frontend::{FrontendHandle, IqSample};
use neumo_receiver::tuner::monitor::{poll_once, snapshot_channel, SnapshotReader, SnapshotWriter};
use neumo_receiver::tuner::sequencer::LnbTarget;
use neumo_receiver::tuner::{Sequencer, SignalSnapshot, TuneError, TuneMode, TuneOptions};

use crate::context::{Commands, TuneArgs};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub(crate) enum ToolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Tune(#[from] TuneError),

    #[error("No lock within {0} ms")]
    NoLock(u64),

    #[error("Interrupted")]
    Interrupted,
}

pub(crate) fn build_mux(args: &TuneArgs) -> AnyMux {
    AnyMux::Dvbs(DvbsMux {
        k: MuxKey {
            sat_pos: args.sat,
            stream_id: args.stream_id,
            ..Default::default()
        },
        frequency: args.frequency,
        pol: args.pol,
        symbol_rate: args.symbol_rate,
        delivery_system: args.delivery_system.into(),
        modulation: args.modulation.into(),
        pls_mode: args.pls_mode.into(),
        pls_code: args.pls_code,
        matype: -1,
        ..Default::default()
    })
}

/// A single fixed LNB on the selected input, pointing at the requested satellite.
pub(crate) fn build_lnb(args: &TuneArgs) -> Lnb {
    Lnb {
        k: LnbKey {
            dish_id: 0,
            lnb_id: 0,
            lnb_type: args.lnb.into(),
        },
        usals_pos: args.sat,
        networks: vec![LnbNetwork {
            sat_pos: args.sat,
            usals_pos: args.sat,
            diseqc12: -1,
            enabled: true,
        }],
        connections: vec![LnbConnection {
            card_mac_address: 0,
            rf_input: args.rf_input,
            rotor_control: RotorControl::FixedDish,
            tune_string: args.diseqc.clone(),
            diseqc_10: args.committed,
            diseqc_11: args.uncommitted,
            enabled: true,
        }],
        enabled: true,
        ..Default::default()
    }
}

pub(crate) fn build_options(args: &TuneArgs) -> TuneOptions {
    TuneOptions {
        tune_mode: if args.blind {
            TuneMode::Blind
        } else {
            TuneMode::Normal
        },
        may_move_dish: false,
        pls_codes: args.pls_search.clone(),
        pls_search_range: args.pls_range,
        rf_input: Some(args.rf_input),
        ..Default::default()
    }
}

/// Write samples as `re,im` lines.
pub(crate) fn write_samples<W: Write>(out: W, samples: &[IqSample]) -> io::Result<()> {
    let mut out = BufWriter::new(out);
    for s in samples {
        writeln!(out, "{},{}", s.re, s.im)?;
    }
    out.flush()
}

fn print_snapshot(s: &SignalSnapshot) {
    println!(
        "{:?} signal {:.1} dBm snr {:.1} dB ber {:.2e}{}",
        s.lock_result,
        s.sample.signal_strength as f64 / 1000.0,
        s.sample.snr as f64 / 1000.0,
        s.sample.ber,
        if s.bitrate > 0 {
            format!(" {:.2} Mbit/s", s.bitrate as f64 / 1e6)
        } else {
            String::new()
        }
    );
}

struct Session {
    fe: FrontendHandle,
    seq: Sequencer,
    writer: SnapshotWriter,
    reader: SnapshotReader,
}

impl Session {
    fn new(fe: FrontendHandle) -> Self {
        let seq = Sequencer::new(fe.clone(), SecTiming::default(), SiPolicy::default().sat_pos_tolerance);
        let (writer, reader) = snapshot_channel();
        Self {
            fe,
            seq,
            writer,
            reader,
        }
    }

    async fn tune(&mut self, args: &TuneArgs) -> Result<(), ToolError> {
        let mux = build_mux(args);
        let lnb = build_lnb(args);
        let options = build_options(args);
        let target = LnbTarget {
            lnb: &lnb,
            connection: &lnb.connections[0],
        };
        info!(
            "Tuning adapter {} to {} on {}",
            args.adapter,
            mux,
            sat_pos::to_str(args.sat)
        );
        let outcome = self.seq.tune(&mux, Some(target), &options).await?;
        info!(
            "Tune command sent (driver frequency {} kHz{})",
            outcome.driver_frequency,
            if outcome.blind { ", blind" } else { "" }
        );
        Ok(())
    }

    async fn wait_for_lock(&self, timeout_ms: u64, stop: &AtomicBool) -> Result<SignalSnapshot, ToolError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            poll_once(&self.fe, &self.writer)?;
            let snapshot = self.reader.get();
            if snapshot.is_locked() {
                return Ok(snapshot);
            }
            if stop.load(Ordering::SeqCst) {
                return Err(ToolError::Interrupted);
            }
            if Instant::now() >= deadline {
                return Err(ToolError::NoLock(timeout_ms));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn close(&mut self) {
        self.seq.stop();
        self.seq.release_lnb();
    }
}

async fn run_tune(fe: FrontendHandle, args: &TuneArgs, time: Option<f64>, stop: &AtomicBool) -> Result<(), ToolError> {
    let mut session = Session::new(fe);
    let result = async {
        session.tune(args).await?;
        let locked = session.wait_for_lock(args.lock_timeout, stop).await?;
        print_snapshot(&locked);
        if locked.matype >= 0 {
            println!("matype 0x{:02x} streams {:?}", locked.matype, locked.isi_list);
        }

        let until = time
            .filter(|t| *t > 0.0)
            .map(|t| Instant::now() + Duration::from_secs_f64(t));
        while !stop.load(Ordering::SeqCst) && until.map_or(true, |u| Instant::now() < u) {
            tokio::time::sleep(REPORT_INTERVAL).await;
            poll_once(&session.fe, &session.writer)?;
            print_snapshot(&session.reader.get());
        }
        Ok::<(), ToolError>(())
    }
    .await;
    session.close();
    result
}

async fn run_iq(
    fe: FrontendHandle,
    args: &TuneArgs,
    samples: usize,
    output: Option<&Path>,
    stop: &AtomicBool,
) -> Result<(), ToolError> {
    let mut session = Session::new(fe);
    let result = async {
        session.tune(args).await?;
        match session.wait_for_lock(args.lock_timeout, stop).await {
            Ok(s) => print_snapshot(&s),
            // constellations of unlocked carriers are still worth a look
            Err(ToolError::NoLock(ms)) => warn!("No lock within {} ms, capturing anyway", ms),
            Err(e) => return Err(e),
        }
        let iq = session.fe.capture_iq(samples)?;
        info!("Captured {} samples", iq.len());
        match output {
            Some(path) => write_samples(File::create(path)?, &iq)?,
            None => write_samples(io::stdout().lock(), &iq)?,
        }
        Ok::<(), ToolError>(())
    }
    .await;
    session.close();
    result
}

#[cfg(target_os = "linux")]
fn open_frontend(args: &TuneArgs) -> Result<FrontendHandle, ToolError> {
    use std::sync::Arc;

    use neumo_receiver::tuner::frontend::DvbFrontend;

    Ok(Arc::new(DvbFrontend::open(args.adapter, args.frontend)?))
}

#[cfg(not(target_os = "linux"))]
fn open_frontend(args: &TuneArgs) -> Result<FrontendHandle, ToolError> {
    Err(ToolError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("adapter {}: DVB frontends are only supported on Linux", args.adapter),
    )))
}

pub(crate) async fn run(command: Commands, stop: &AtomicBool) -> Result<(), ToolError> {
    match command {
        Commands::Tune { target, time } => {
            let fe = open_frontend(&target)?;
            run_tune(fe, &target, time, stop).await
        }
        Commands::Iq {
            target,
            samples,
            output,
        } => {
            let fe = open_frontend(&target)?;
            run_iq(fe, &target, samples, output.as_deref(), stop).await
        }
    }
}
