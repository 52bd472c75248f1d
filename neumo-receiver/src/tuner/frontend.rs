//! Hardware command channel of one frontend.
//!
//! The sequencer and the monitor only talk to the hardware through
//! [`FrontendChannel`]. On Linux, [`DvbFrontend`] maps every call onto the
//! frontend ioctls; tests use a recording fake.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use super::dtv::{Burst, FeStatus, PropertyList, Tone, Voltage};

/// Result of a spectrum sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpectrumData {
    /// Frequencies in kHz, as seen by the tuner (before LNB translation).
    pub freq: Vec<u32>,
    /// Levels in 0.001 dB.
    pub rf_level: Vec<i32>,
    /// Driver-suggested carriers as (frequency, symbol rate).
    pub candidates: Vec<(u32, u32)>,
}

/// One constellation sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IqSample {
    pub re: i8,
    pub im: i8,
}

pub trait FrontendChannel: Send + Sync {
    fn adapter_no(&self) -> u32;

    /// `FE_SET_PROPERTY`.
    fn set_properties(&self, props: &mut PropertyList) -> io::Result<()>;

    /// `FE_GET_PROPERTY`; values are filled into `props`.
    fn get_properties(&self, props: &mut PropertyList) -> io::Result<()>;

    fn set_voltage(&self, voltage: Voltage) -> io::Result<()>;

    fn set_tone(&self, tone: Tone) -> io::Result<()>;

    /// Send one DiSEqC master command of 3 to 6 bytes.
    fn send_diseqc(&self, msg: &[u8]) -> io::Result<()>;

    fn send_burst(&self, burst: Burst) -> io::Result<()>;

    fn read_status(&self) -> io::Result<FeStatus>;

    /// Wait up to `timeout` for a frontend event. Returns true if one arrived.
    fn wait_event(&self, timeout: Duration) -> io::Result<bool>;

    /// Abort whatever the driver is doing.
    fn stop(&self) -> io::Result<()>;

    /// Read back the result of a spectrum command.
    fn read_spectrum(&self, max_points: usize, max_candidates: usize) -> io::Result<SpectrumData>;

    /// Read raw constellation samples.
    fn capture_iq(&self, num_samples: usize) -> io::Result<Vec<IqSample>>;
}

pub type FrontendHandle = Arc<dyn FrontendChannel>;

#[cfg(target_os = "linux")]
pub use self::linux::DvbFrontend;

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::fd::AsFd;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    use log::{debug, trace};
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    use super::{FrontendChannel, IqSample, SpectrumData};
    use crate::tuner::dtv::{
        Burst, DtvProperties, DtvProperty, FeStatus, PropertyList, Tone, Voltage, DTV_CLEAR,
        DTV_CONSTELLATION, DTV_SPECTRUM,
    };

    #[repr(C)]
    pub struct DiseqcMasterCmd {
        msg: [u8; 6],
        msg_len: u8,
    }

    #[repr(C)]
    pub struct DvbFrontendEvent {
        status: u32,
        parameters: [u32; 9],
    }

    nix::ioctl_write_ptr!(fe_diseqc_send_master_cmd, b'o', 63, DiseqcMasterCmd);
    nix::ioctl_write_int_bad!(fe_diseqc_send_burst, nix::request_code_none!(b'o', 65));
    nix::ioctl_write_int_bad!(fe_set_tone, nix::request_code_none!(b'o', 66));
    nix::ioctl_write_int_bad!(fe_set_voltage, nix::request_code_none!(b'o', 67));
    nix::ioctl_read!(fe_read_status, b'o', 69, u32);
    nix::ioctl_read!(fe_get_event, b'o', 78, DvbFrontendEvent);
    nix::ioctl_write_ptr!(fe_set_property, b'o', 82, DtvProperties);
    nix::ioctl_read!(fe_get_property, b'o', 83, DtvProperties);

    /// Offsets inside the union of the spectrum and constellation extensions.
    const SPECTRUM_FREQ_PTR: usize = 0;
    const SPECTRUM_LEVEL_PTR: usize = 8;
    const SPECTRUM_CANDIDATES_PTR: usize = 16;
    const SPECTRUM_NUM_FREQ: usize = 24;
    const SPECTRUM_NUM_CANDIDATES: usize = 28;
    const CONSTELLATION_SAMPLES_PTR: usize = 0;
    const CONSTELLATION_NUM_SAMPLES: usize = 8;

    /// A `/dev/dvb/adapterN/frontendM` device.
    pub struct DvbFrontend {
        file: File,
        adapter_no: u32,
        frontend_no: u32,
    }

    impl DvbFrontend {
        pub fn open(adapter_no: u32, frontend_no: u32) -> io::Result<Self> {
            let path = format!("/dev/dvb/adapter{adapter_no}/frontend{frontend_no}");
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(nix::libc::O_NONBLOCK)
                .open(&path)?;
            debug!("[Frontend] opened {}", path);
            Ok(Self {
                file,
                adapter_no,
                frontend_no,
            })
        }

        pub fn frontend_no(&self) -> u32 {
            self.frontend_no
        }

        fn fd(&self) -> i32 {
            self.file.as_raw_fd()
        }
    }

    impl FrontendChannel for DvbFrontend {
        fn adapter_no(&self) -> u32 {
            self.adapter_no
        }

        fn set_properties(&self, props: &mut PropertyList) -> io::Result<()> {
            trace!("[Frontend] adapter {} set {:?}", self.adapter_no, props);
            let raw = props.as_raw();
            // SAFETY: raw points into props, which is alive and unchanged during the call.
            unsafe { fe_set_property(self.fd(), &raw) }.map_err(io::Error::from)?;
            Ok(())
        }

        fn get_properties(&self, props: &mut PropertyList) -> io::Result<()> {
            let mut raw = props.as_raw();
            // SAFETY: as above; the kernel writes only inside the property array.
            unsafe { fe_get_property(self.fd(), &mut raw) }.map_err(io::Error::from)?;
            Ok(())
        }

        fn set_voltage(&self, voltage: Voltage) -> io::Result<()> {
            // SAFETY: integer argument.
            unsafe { fe_set_voltage(self.fd(), voltage as i32) }.map_err(io::Error::from)?;
            Ok(())
        }

        fn set_tone(&self, tone: Tone) -> io::Result<()> {
            // SAFETY: integer argument.
            unsafe { fe_set_tone(self.fd(), tone as i32) }.map_err(io::Error::from)?;
            Ok(())
        }

        fn send_diseqc(&self, msg: &[u8]) -> io::Result<()> {
            if !(3..=6).contains(&msg.len()) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("DiSEqC message of {} bytes", msg.len()),
                ));
            }
            let mut cmd = DiseqcMasterCmd {
                msg: [0; 6],
                msg_len: msg.len() as u8,
            };
            cmd.msg[..msg.len()].copy_from_slice(msg);
            // SAFETY: cmd outlives the call.
            unsafe { fe_diseqc_send_master_cmd(self.fd(), &cmd) }.map_err(io::Error::from)?;
            Ok(())
        }

        fn send_burst(&self, burst: Burst) -> io::Result<()> {
            // SAFETY: integer argument.
            unsafe { fe_diseqc_send_burst(self.fd(), burst as i32) }.map_err(io::Error::from)?;
            Ok(())
        }

        fn read_status(&self) -> io::Result<FeStatus> {
            let mut status = 0u32;
            // SAFETY: status outlives the call.
            unsafe { fe_read_status(self.fd(), &mut status) }.map_err(io::Error::from)?;
            Ok(FeStatus(status))
        }

        fn wait_event(&self, timeout: Duration) -> io::Result<bool> {
            let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLPRI)];
            let n = poll(&mut fds, PollTimeout::from(ms)).map_err(io::Error::from)?;
            if n == 0 {
                return Ok(false);
            }
            let mut event = DvbFrontendEvent {
                status: 0,
                parameters: [0; 9],
            };
            // drain the event queue; an empty queue reports EWOULDBLOCK
            // SAFETY: event outlives the call.
            while unsafe { fe_get_event(self.fd(), &mut event) }.is_ok() {
                trace!("[Frontend] adapter {} event status={:#x}", self.adapter_no, event.status);
            }
            Ok(true)
        }

        fn stop(&self) -> io::Result<()> {
            let mut props = PropertyList::new();
            props.add(DTV_CLEAR, 0);
            self.set_properties(&mut props)
        }

        fn read_spectrum(&self, max_points: usize, max_candidates: usize) -> io::Result<SpectrumData> {
            let mut freq = vec![0u32; max_points];
            let mut rf_level = vec![0i32; max_points];
            let mut candidates = vec![[0u32; 2]; max_candidates];
            let mut prop = DtvProperty::new(DTV_SPECTRUM, 0);
            prop.set_pointer(SPECTRUM_FREQ_PTR, freq.as_mut_ptr() as usize);
            prop.set_pointer(SPECTRUM_LEVEL_PTR, rf_level.as_mut_ptr() as usize);
            prop.set_pointer(SPECTRUM_CANDIDATES_PTR, candidates.as_mut_ptr() as usize);
            prop.set_word(SPECTRUM_NUM_FREQ, max_points as u32);
            prop.set_word(SPECTRUM_NUM_CANDIDATES, max_candidates as u32);
            let mut props = PropertyList::new();
            props.push(prop);
            // the buffers stay alive and unmoved until the call returns
            self.get_properties(&mut props)?;

            let (num_freq, num_candidates) = props
                .get(DTV_SPECTRUM)
                .map(|p| (p.word(SPECTRUM_NUM_FREQ) as usize, p.word(SPECTRUM_NUM_CANDIDATES) as usize))
                .unwrap_or((0, 0));
            freq.truncate(num_freq.min(max_points));
            rf_level.truncate(num_freq.min(max_points));
            candidates.truncate(num_candidates.min(max_candidates));
            Ok(SpectrumData {
                freq,
                rf_level,
                candidates: candidates.into_iter().map(|[f, sr]| (f, sr)).collect(),
            })
        }

        fn capture_iq(&self, num_samples: usize) -> io::Result<Vec<IqSample>> {
            let mut raw = vec![[0i8; 2]; num_samples];
            let mut prop = DtvProperty::new(DTV_CONSTELLATION, 0);
            prop.set_pointer(CONSTELLATION_SAMPLES_PTR, raw.as_mut_ptr() as usize);
            prop.set_word(CONSTELLATION_NUM_SAMPLES, num_samples as u32);
            let mut props = PropertyList::new();
            props.push(prop);
            self.get_properties(&mut props)?;
            let n = props
                .get(DTV_CONSTELLATION)
                .map_or(0, |p| p.word(CONSTELLATION_NUM_SAMPLES) as usize);
            raw.truncate(n.min(num_samples));
            Ok(raw.into_iter().map(|[re, im]| IqSample { re, im }).collect())
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording fake of the command channel.

    use std::io;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::{FrontendChannel, IqSample, SpectrumData};
    use crate::tuner::dtv::{
        Burst, DtvStat, FeStatus, PropertyList, StatScale, Tone, Voltage, DTV_STAT_CNR,
        DTV_STAT_SIGNAL_STRENGTH,
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum FeCommand {
        Voltage(Voltage),
        Tone(Tone),
        Diseqc(Vec<u8>),
        Burst(Burst),
        /// (cmd, data) pairs of one `FE_SET_PROPERTY`.
        SetProperties(Vec<(u32, u32)>),
        Stop,
    }

    #[derive(Default)]
    pub struct RecordingFrontend {
        pub log: Mutex<Vec<FeCommand>>,
        pub status: Mutex<FeStatus>,
        /// errno returned by the next call of the named operation.
        pub fail: Mutex<Option<(&'static str, i32)>>,
        pub spectrum: Mutex<SpectrumData>,
        pub snr: Mutex<i64>,
        pub strength: Mutex<i64>,
    }

    impl RecordingFrontend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_locked(&self, locked: bool) {
            *self.status.lock() = FeStatus(if locked { 0x1F } else { 0x01 });
        }

        pub fn fail_next(&self, op: &'static str, errno: i32) {
            *self.fail.lock() = Some((op, errno));
        }

        pub fn commands(&self) -> Vec<FeCommand> {
            self.log.lock().clone()
        }

        pub fn clear(&self) {
            self.log.lock().clear();
        }

        pub fn diseqc_messages(&self) -> Vec<Vec<u8>> {
            self.commands()
                .into_iter()
                .filter_map(|c| match c {
                    FeCommand::Diseqc(m) => Some(m),
                    _ => None,
                })
                .collect()
        }

        fn check(&self, op: &'static str) -> io::Result<()> {
            let mut fail = self.fail.lock();
            match *fail {
                Some((name, errno)) if name == op => {
                    *fail = None;
                    Err(io::Error::from_raw_os_error(errno))
                }
                _ => Ok(()),
            }
        }

        fn record(&self, cmd: FeCommand) {
            self.log.lock().push(cmd);
        }
    }

    impl FrontendChannel for RecordingFrontend {
        fn adapter_no(&self) -> u32 {
            0
        }

        fn set_properties(&self, props: &mut PropertyList) -> io::Result<()> {
            self.check("set_properties")?;
            self.record(FeCommand::SetProperties(
                props.iter().map(|p| (p.cmd(), p.data())).collect(),
            ));
            Ok(())
        }

        fn get_properties(&self, props: &mut PropertyList) -> io::Result<()> {
            self.check("get_properties")?;
            let snr = *self.snr.lock();
            let strength = *self.strength.lock();
            if let Some(p) = props.get_mut(DTV_STAT_CNR) {
                p.set_stats(&[DtvStat {
                    scale: StatScale::Decibel,
                    value: snr,
                }]);
            }
            if let Some(p) = props.get_mut(DTV_STAT_SIGNAL_STRENGTH) {
                p.set_stats(&[DtvStat {
                    scale: StatScale::Decibel,
                    value: strength,
                }]);
            }
            Ok(())
        }

        fn set_voltage(&self, voltage: Voltage) -> io::Result<()> {
            self.check("set_voltage")?;
            self.record(FeCommand::Voltage(voltage));
            Ok(())
        }

        fn set_tone(&self, tone: Tone) -> io::Result<()> {
            self.check("set_tone")?;
            self.record(FeCommand::Tone(tone));
            Ok(())
        }

        fn send_diseqc(&self, msg: &[u8]) -> io::Result<()> {
            self.check("send_diseqc")?;
            self.record(FeCommand::Diseqc(msg.to_vec()));
            Ok(())
        }

        fn send_burst(&self, burst: Burst) -> io::Result<()> {
            self.check("send_burst")?;
            self.record(FeCommand::Burst(burst));
            Ok(())
        }

        fn read_status(&self) -> io::Result<FeStatus> {
            self.check("read_status")?;
            Ok(*self.status.lock())
        }

        fn wait_event(&self, timeout: Duration) -> io::Result<bool> {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            Ok(true)
        }

        fn stop(&self) -> io::Result<()> {
            self.record(FeCommand::Stop);
            Ok(())
        }

        fn read_spectrum(&self, _max_points: usize, _max_candidates: usize) -> io::Result<SpectrumData> {
            self.check("read_spectrum")?;
            Ok(self.spectrum.lock().clone())
        }

        fn capture_iq(&self, num_samples: usize) -> io::Result<Vec<IqSample>> {
            Ok(vec![IqSample::default(); num_samples])
        }
    }
}
