//! Frontend monitor.
//!
//! One thread per frontend waits for driver events and polls lock status and
//! signal statistics. Results go into a [`SignalSnapshot`] that has exactly
//! one writer (the monitor) and any number of readers (the tuner thread, the
//! receiver). Readers get a guarded reference or a copy.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use neumo_protocol::{LockResult, SignalSample};
use parking_lot::{RwLock, RwLockReadGuard};

use super::dtv::{self, DtvStat, FeStatus, PropertyList, StatScale};
use super::frontend::FrontendHandle;
use crate::engine::unix_now;

/// Latest demodulator state of one frontend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalSnapshot {
    pub fe_status: FeStatus,
    pub lock_result: LockResult,
    pub sample: SignalSample,
    pub matype: i16,
    pub isi_list: Vec<u8>,
    pub bitrate: u32,
    /// Incremented on every update.
    pub generation: u64,
}

impl SignalSnapshot {
    pub fn is_locked(&self) -> bool {
        self.fe_status.has_lock()
    }
}

pub fn lock_result(status: FeStatus) -> LockResult {
    if status.has(FeStatus::HAS_LOCK) {
        LockResult::Locked
    } else if status.has(FeStatus::HAS_SYNC) {
        LockResult::Sync
    } else if status.has(FeStatus::HAS_VITERBI) {
        LockResult::Fec
    } else if status.has(FeStatus::HAS_CARRIER) {
        LockResult::Carrier
    } else {
        LockResult::NoLock
    }
}

/// Create a snapshot with its single writer.
pub fn snapshot_channel() -> (SnapshotWriter, SnapshotReader) {
    let inner = Arc::new(RwLock::new(SignalSnapshot::default()));
    (
        SnapshotWriter {
            inner: inner.clone(),
        },
        SnapshotReader { inner },
    )
}

/// Write half. Not `Clone`, so there is only ever one writer.
pub struct SnapshotWriter {
    inner: Arc<RwLock<SignalSnapshot>>,
}

impl SnapshotWriter {
    pub fn update(&self, f: impl FnOnce(&mut SignalSnapshot)) {
        let mut guard = self.inner.write();
        f(&mut guard);
        guard.generation += 1;
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SnapshotReader {
    inner: Arc<RwLock<SignalSnapshot>>,
}

impl SnapshotReader {
    /// Guarded reference; hold it briefly.
    pub fn read(&self) -> RwLockReadGuard<'_, SignalSnapshot> {
        self.inner.read()
    }

    pub fn get(&self) -> SignalSnapshot {
        self.inner.read().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.read().is_locked()
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }
}

impl std::fmt::Debug for SnapshotReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SnapshotReader").field(&*self.inner.read()).finish()
    }
}

fn first_stat(stats: &[DtvStat], scale: StatScale) -> Option<i64> {
    stats.iter().find(|s| s.scale == scale).map(|s| s.value)
}

/// Read status and statistics once and publish them.
pub fn poll_once(fe: &FrontendHandle, writer: &SnapshotWriter) -> io::Result<()> {
    let status = fe.read_status()?;
    let locked = status.has_lock();
    let mut props = PropertyList::new();
    props
        .add(dtv::DTV_STAT_SIGNAL_STRENGTH, 0)
        .add(dtv::DTV_STAT_CNR, 0);
    if locked {
        props
            .add(dtv::DTV_STAT_PRE_ERROR_BIT_COUNT, 0)
            .add(dtv::DTV_STAT_PRE_TOTAL_BIT_COUNT, 0)
            .add(dtv::DTV_MATYPE, 0)
            .add(dtv::DTV_ISI_LIST, 0)
            .add(dtv::DTV_BITRATE, 0);
    }
    fe.get_properties(&mut props)?;

    let stat = |cmd, scale| props.get(cmd).and_then(|p| first_stat(&p.stats(), scale));
    let signal_strength = stat(dtv::DTV_STAT_SIGNAL_STRENGTH, StatScale::Decibel).unwrap_or(0);
    let snr = stat(dtv::DTV_STAT_CNR, StatScale::Decibel).unwrap_or(0);
    let errors = stat(dtv::DTV_STAT_PRE_ERROR_BIT_COUNT, StatScale::Counter);
    let total = stat(dtv::DTV_STAT_PRE_TOTAL_BIT_COUNT, StatScale::Counter);
    let ber = match (errors, total) {
        (Some(e), Some(t)) if t > 0 => e as f32 / t as f32,
        _ => 0.0,
    };
    let sample = SignalSample {
        time: unix_now(),
        signal_strength: signal_strength.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        snr: snr.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        ber,
        locked,
    };
    let matype = if locked {
        props.value(dtv::DTV_MATYPE).map_or(-1, |v| v as i16)
    } else {
        -1
    };
    let isi_list = props
        .get(dtv::DTV_ISI_LIST)
        .filter(|_| locked)
        .map(|p| dtv::isi_list(p.buffer()))
        .unwrap_or_default();
    let bitrate = if locked {
        props.value(dtv::DTV_BITRATE).unwrap_or(0)
    } else {
        0
    };

    writer.update(|s| {
        s.fe_status = status;
        s.lock_result = lock_result(status);
        s.sample = sample;
        s.matype = matype;
        s.isi_list = isi_list;
        s.bitrate = bitrate;
    });
    Ok(())
}

/// The monitor thread of one frontend. Stops when dropped.
pub struct FrontendMonitor {
    stop: Arc<AtomicBool>,
    reader: SnapshotReader,
    handle: Option<JoinHandle<()>>,
}

impl FrontendMonitor {
    pub fn spawn(fe: FrontendHandle, interval: Duration) -> io::Result<Self> {
        let (writer, reader) = snapshot_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let adapter_no = fe.adapter_no();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("fe-monitor-{adapter_no}"))
            .spawn(move || {
                info!("[Monitor] adapter {} started", adapter_no);
                let mut failing = false;
                while !thread_stop.load(Ordering::Acquire) {
                    match fe.wait_event(interval) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => debug!("[Monitor] adapter {} poll: {}", adapter_no, e),
                    }
                    match poll_once(&fe, &writer) {
                        Ok(()) => failing = false,
                        Err(e) => {
                            if !failing {
                                warn!("[Monitor] adapter {} status read failed: {}", adapter_no, e);
                            }
                            failing = true;
                            thread::sleep(interval);
                        }
                    }
                }
                info!("[Monitor] adapter {} stopped", adapter_no);
            })?;
        Ok(Self {
            stop,
            reader,
            handle: Some(handle),
        })
    }

    pub fn reader(&self) -> SnapshotReader {
        self.reader.clone()
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("[Monitor] thread panicked");
            }
        }
    }
}

impl Drop for FrontendMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::frontend::testing::RecordingFrontend;

    #[test]
    fn test_lock_result_mapping() {
        assert_eq!(lock_result(FeStatus(0)), LockResult::NoLock);
        assert_eq!(lock_result(FeStatus(0x03)), LockResult::Carrier);
        assert_eq!(lock_result(FeStatus(0x0F)), LockResult::Sync);
        assert_eq!(lock_result(FeStatus(0x1F)), LockResult::Locked);
    }

    #[test]
    fn test_poll_once_publishes_snapshot() {
        let fe = Arc::new(RecordingFrontend::new());
        fe.set_locked(true);
        *fe.snr.lock() = 12_500;
        *fe.strength.lock() = -45_000;
        let handle: FrontendHandle = fe.clone();
        let (writer, reader) = snapshot_channel();
        poll_once(&handle, &writer).unwrap();

        let snap = reader.get();
        assert!(snap.is_locked());
        assert_eq!(snap.lock_result, LockResult::Locked);
        assert_eq!(snap.sample.snr, 12_500);
        assert_eq!(snap.sample.signal_strength, -45_000);
        assert_eq!(snap.generation, 1);

        fe.set_locked(false);
        poll_once(&handle, &writer).unwrap();
        assert!(!reader.is_locked());
        assert_eq!(reader.read().matype, -1);
        assert_eq!(reader.generation(), 2);
    }

    #[test]
    fn test_monitor_thread_runs_and_stops() {
        let fe = Arc::new(RecordingFrontend::new());
        fe.set_locked(true);
        let mut monitor = FrontendMonitor::spawn(fe.clone(), Duration::from_millis(1)).unwrap();
        let reader = monitor.reader();
        for _ in 0..200 {
            if reader.generation() > 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(reader.is_locked());
        monitor.shutdown();
        let frozen = reader.generation();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(reader.generation(), frozen);
    }
}
