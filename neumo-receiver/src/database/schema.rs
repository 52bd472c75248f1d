//! Database schema definitions.

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 2;

/// Tables holding records. Every table is a key/value store with one optional
/// secondary index column.
pub const RECORD_TABLES: &[&str] = &[
    "muxes",
    "services",
    "chgs",
    "chgms",
    "epg",
    "lnbs",
    "spectra",
    "signal_stats",
];

/// SQL schema for the SI database.
pub const SCHEMA_SQL: &str = r#"
-- Muxes of all delivery systems. Key: sat_pos, stream_id, t2mi_pid, mux_id.
-- idx: sat_pos, network_id, ts_id
CREATE TABLE IF NOT EXISTS muxes (
    key BLOB PRIMARY KEY,
    idx BLOB,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS muxes_idx ON muxes(idx);

-- Services. Key: mux key, network_id, ts_id, service_id.
-- idx: sat_pos, network_id, ts_id, service_id
CREATE TABLE IF NOT EXISTS services (
    key BLOB PRIMARY KEY,
    idx BLOB,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS services_idx ON services(idx);

-- Channel groups (bouquets). Key: group_type, bouquet_id, sat_pos.
CREATE TABLE IF NOT EXISTS chgs (
    key BLOB PRIMARY KEY,
    idx BLOB,
    data TEXT NOT NULL
);

-- Channels in a bouquet. Key: chg key, channel_id. idx: service key.
CREATE TABLE IF NOT EXISTS chgms (
    key BLOB PRIMARY KEY,
    idx BLOB,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS chgms_idx ON chgms(idx);

-- EPG records. Key: sat_pos, network_id, ts_id, service_id, start_time, event_id.
CREATE TABLE IF NOT EXISTS epg (
    key BLOB PRIMARY KEY,
    idx BLOB,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lnbs (
    key BLOB PRIMARY KEY,
    idx BLOB,
    data TEXT NOT NULL
);

-- Spectra. Key: rf_path, sat_pos, pol, band, start_time.
CREATE TABLE IF NOT EXISTS spectra (
    key BLOB PRIMARY KEY,
    idx BLOB,
    data TEXT NOT NULL
);

-- Signal statistics. Key: mux key, rf_path, time.
CREATE TABLE IF NOT EXISTS signal_stats (
    key BLOB PRIMARY KEY,
    idx BLOB,
    data TEXT NOT NULL
);

-- Scan bookkeeping
CREATE TABLE IF NOT EXISTS scan_ids (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER DEFAULT (strftime('%s', 'now'))
);
"#;
