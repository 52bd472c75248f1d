//! Shared record and notification types for the neumo DVB receiver core.
//!
//! The crate holds the data model that the SI engine, the tuner threads and
//! the database exchange:
//!
//! - [`AnyMux`]: a tunable carrier, one of [`DvbsMux`], [`DvbcMux`], [`DvbtMux`]
//! - [`Service`], [`Chg`]/[`Chgm`] (bouquets), [`EpgRecord`]
//! - [`Lnb`] and [`RfPath`] for the satellite equipment
//! - [`SpectrumRecord`] and [`SignalStat`] for measurements
//! - [`Notification`] for subscribers
//!
//! # Example
//!
//! ```rust
//! use neumo_protocol::{AnyMux, DvbsMux, MuxKey, Polarisation};
//!
//! let tuned = AnyMux::Dvbs(DvbsMux {
//!     k: MuxKey { sat_pos: 1920, ..Default::default() },
//!     frequency: 11_778_000,
//!     pol: Polarisation::V,
//!     symbol_rate: 27_500_000,
//!     ..Default::default()
//! });
//! let from_nit = AnyMux::Dvbs(DvbsMux {
//!     k: MuxKey { sat_pos: 1920, mux_id: 7, ..Default::default() },
//!     frequency: 11_777_500,
//!     pol: Polarisation::V,
//!     symbol_rate: 27_500_000,
//!     ..Default::default()
//! });
//! assert!(tuned.matches_physical(&from_nit));
//! ```

pub mod error;
pub mod notify;
pub mod types;

pub use error::RecordError;
pub use notify::{
    ConfirmationSummary, Notification, PositionerMotionReport, ScanMuxEndReport, SdtActualReport,
    SignalInfo, Subscriber, SubscriberHandle,
};
pub use types::*;
