//! Error types for record validation.

use thiserror::Error;

use crate::types::ScanStatus;

/// Errors raised when a record would violate one of its invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Active scan statuses need a positive scan id.
    #[error("Scan status {status:?} requires a positive scan id, got {scan_id}")]
    InvalidScanId { status: ScanStatus, scan_id: i32 },

    /// Record belongs to a different delivery system than expected.
    #[error("Delivery system mismatch: {0}")]
    DeliverySystemMismatch(String),

    /// Key cannot be encoded.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid value: {0}")]
    Invalid(String),
}
