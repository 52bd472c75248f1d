//! Tuner side of the receiver.
//!
//! This module provides:
//! - [`stream`]: the stream reader boundary (real demux, memory, embedded T2MI)
//! - [`frontend`] and [`dtv`]: the hardware command channel and its property ABI
//! - [`sec`], [`diseqc`], [`sequencer`]: LNB control and the tune sequence
//! - [`spectrum`]: spectrum sweeps and the peak detector boundary
//! - [`monitor`]: the frontend monitor and its guarded signal snapshot
//! - [`adapter`]: the tune state machine of one adapter
//! - [`tuner_thread`]: the run loop that owns an adapter and its SI stream
//! - [`reservation`]: exclusive and shared use of a tuner

pub mod adapter;
pub mod diseqc;
pub mod dtv;
pub mod frontend;
pub mod monitor;
pub mod reservation;
pub mod sec;
pub mod sequencer;
pub mod spectrum;
pub mod stream;
pub mod t2mi;
pub mod tuner_thread;

use std::io;

use thiserror::Error;

pub use adapter::{ActiveAdapter, TuneState};
pub use frontend::FrontendChannel;
pub use monitor::{FrontendMonitor, SignalSnapshot};
pub use reservation::{Reservation, ReservationError, TunerReservations};
pub use sequencer::{CancelFlag, Sequencer};
pub use stream::StreamReader;
pub use tuner_thread::{TunerHandle, TunerTask};

/// How a tune request should be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum TuneMode {
    /// Tune with the given parameters.
    #[default]
    Normal,
    /// Let the demodulator search symbol rate, modulation and PLS code.
    Blind,
    /// Acquire a spectrum instead of tuning.
    Spectrum,
    /// Only move the dish.
    PositionerOnly,
}

/// Parameters of a spectrum sweep, frequencies in kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SpectrumOptions {
    pub start_frequency: u32,
    pub end_frequency: u32,
    pub resolution: u32,
    pub fft_size: u32,
    /// Ask the driver for candidate peaks instead of running the local detector.
    pub use_driver_peaks: bool,
}

impl Default for SpectrumOptions {
    fn default() -> Self {
        Self {
            start_frequency: 10_700_000,
            end_frequency: 12_750_000,
            resolution: 0,
            fft_size: 512,
            use_driver_peaks: false,
        }
    }
}

/// Options that travel with a tune request down to the stream reader.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TuneOptions {
    pub tune_mode: TuneMode,
    /// The tune is part of a multi-mux scan; embedded streams are scanned by
    /// the scan itself rather than by a nested SI session.
    pub scan: bool,
    /// Allow the sequencer to move a rotor.
    pub may_move_dish: bool,
    /// Physical layer scrambling codes tried during a blind tune.
    pub pls_codes: Vec<u32>,
    /// Inclusive range of gold codes searched during a blind tune.
    pub pls_search_range: Option<(u32, u32)>,
    /// Frequency search range for blind tunes in kHz.
    pub search_range_khz: u32,
    /// Forced RF input, otherwise the one of the LNB connection.
    pub rf_input: Option<i32>,
    pub spectrum: SpectrumOptions,
}

impl Default for TuneOptions {
    fn default() -> Self {
        Self {
            tune_mode: TuneMode::Normal,
            scan: false,
            may_move_dish: true,
            pls_codes: Vec::new(),
            pls_search_range: None,
            search_range_khz: 10_000,
            rf_input: None,
            spectrum: SpectrumOptions::default(),
        }
    }
}

/// How a failed tune must be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Bad parameters or a fundamental driver failure; not retried.
    Permanent,
    /// Driver resources are exhausted; the mux is eligible for retry.
    Temporary,
    /// The tune was aborted from outside.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum TuneError {
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Mux cannot be tuned: {0}")]
    BadParameters(String),

    #[error("No usable LNB connection: {0}")]
    NoLnb(String),

    #[error("Tune cancelled")]
    Cancelled,
}

impl TuneError {
    pub fn io(op: &'static str, source: io::Error) -> Self {
        TuneError::Io { op, source }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            TuneError::Io { source, .. } if is_resource_exhaustion(source) => FailureClass::Temporary,
            TuneError::Io { .. } | TuneError::BadParameters(_) | TuneError::NoLnb(_) => {
                FailureClass::Permanent
            }
            TuneError::Cancelled => FailureClass::Cancelled,
        }
    }
}

/// Errors a shared frontend reports when another user holds the hardware.
#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    use nix::errno::Errno;
    matches!(
        e.raw_os_error().map(Errno::from_raw),
        Some(Errno::EBUSY | Errno::ENOSPC | Errno::EAGAIN | Errno::EUSERS | Errno::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_failure_classes() {
        let busy = TuneError::io("FE_SET_PROPERTY", io::Error::from_raw_os_error(nix::libc::EBUSY));
        assert_eq!(busy.class(), FailureClass::Temporary);
        let inval = TuneError::io("FE_SET_PROPERTY", io::Error::from_raw_os_error(nix::libc::EINVAL));
        assert_eq!(inval.class(), FailureClass::Permanent);
        assert_eq!(TuneError::Cancelled.class(), FailureClass::Cancelled);
        assert_eq!(TuneError::BadParameters("sr=0".into()).class(), FailureClass::Permanent);
    }
}
