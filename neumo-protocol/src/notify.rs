//! Messages pushed to subscribers.
//!
//! Every notification is an immutable value. Delivery is fire-and-forget:
//! the receiver never waits for a subscriber to consume a message.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{
    AnyMux, ConfirmedBy, LockResult, MuxKey, SatPos, ScanResult, Service, SignalSample,
    SpectrumKey,
};

/// Which facts of the tuned mux are confirmed, and by whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfirmationSummary {
    pub sat_by: ConfirmedBy,
    pub ts_id_by: ConfirmedBy,
    pub network_id_by: ConfirmedBy,
    pub on_wrong_sat: bool,
    pub unstable_sat: bool,
}

/// Snapshot of the demodulator state of one adapter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalInfo {
    pub adapter_no: u32,
    pub tuned_mux: Option<AnyMux>,
    /// Mux as confirmed by SI, possibly with a corrected key.
    pub si_mux: Option<AnyMux>,
    pub lock_result: LockResult,
    pub fe_status: u32,
    pub sample: SignalSample,
    pub matype: i16,
    pub isi_list: Vec<u8>,
    pub bitrate: u32,
    pub confirmation: ConfirmationSummary,
}

/// Services found in a complete SDT_ACTUAL.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SdtActualReport {
    pub mux_key: MuxKey,
    pub network_id: u16,
    pub ts_id: u16,
    pub services: Vec<Service>,
}

/// End of the scan of one mux.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMuxEndReport {
    pub scan_id: i32,
    pub mux: AnyMux,
    pub scan_result: ScanResult,
    pub lock_result: LockResult,
    pub num_services: u16,
    pub confirmation: ConfirmationSummary,
}

/// The dish starts moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PositionerMotionReport {
    pub adapter_no: u32,
    pub from_usals_pos: SatPos,
    pub to_usals_pos: SatPos,
    /// Unix time in milliseconds.
    pub start_time_ms: i64,
    pub expected_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    SignalInfo(SignalInfo),
    SdtActual(SdtActualReport),
    ScanMuxEnd(ScanMuxEndReport),
    PositionerMotion(PositionerMotionReport),
    SpectrumAcquired(SpectrumKey),
}

/// Receives notifications. Implementations must not block.
pub trait Subscriber: Send + Sync {
    fn notify(&self, notification: &Notification);
}

impl<F> Subscriber for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn notify(&self, notification: &Notification) {
        self(notification)
    }
}

pub type SubscriberHandle = Arc<dyn Subscriber>;
