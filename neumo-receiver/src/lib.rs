//! DVB receiver core.
//!
//! - [`si`]: transport stream packets, PSI sections and SI table decoders
//! - [`engine`]: the SI stream engine with scan state and tune confirmation
//! - [`tuner`]: frontend control, tune sequencing, adapters and tuner threads
//! - [`receiver`]: subscriptions, scans and notification dispatch
//! - [`database`]: transactional record store
//! - [`config`], [`logging`]: daemon configuration and log setup

pub mod config;
pub mod database;
pub mod engine;
pub mod logging;
pub mod receiver;
pub mod si;
pub mod tuner;

pub use config::ReceiverConfig;
pub use database::{Database, DatabaseHandle};
pub use receiver::{Receiver, ReceiverError};
