//! Stream reader boundary.
//!
//! A [`StreamReader`] hands out buffered transport stream bytes. The SI engine
//! calls [`StreamReader::read`], processes whole packets and then
//! [`StreamReader::discard`]s what it consumed, so partial packets stay in the
//! reader until more data arrives.

use std::io;

use bytes::{Buf, BytesMut};
use neumo_protocol::AnyMux;

use super::t2mi::T2miDemux;
use super::TuneOptions;
use crate::si::{packet, TsHeader, TS_PACKET_SIZE};

/// Bytes requested from the device per read.
pub const READ_CHUNK_SIZE: usize = 188 * 512;

pub trait StreamReader: Send {
    /// Buffered bytes, reading more from the source first.
    ///
    /// `WouldBlock` means nothing is available right now.
    fn read(&mut self) -> io::Result<&[u8]>;

    /// Drop the first `n` bytes of what [`StreamReader::read`] returned.
    fn discard(&mut self, n: usize);

    /// Mux the stream comes from.
    fn stream_mux(&self) -> &AnyMux;

    /// SI found a better description of the mux.
    fn on_stream_mux_change(&mut self, mux: &AnyMux);

    fn tune_options(&self) -> &TuneOptions;

    /// PID carrying the embedded stream, for T2MI sub-streams.
    fn embedded_stream_pid(&self) -> Option<u16> {
        None
    }

    /// Restrict the stream to `pids`.
    fn set_pids(&mut self, pids: &[u16]) -> io::Result<()>;

    /// True when the source has been silent since the last tune.
    fn no_data(&self) -> bool;
}

impl<R: StreamReader + ?Sized> StreamReader for Box<R> {
    fn read(&mut self) -> io::Result<&[u8]> {
        (**self).read()
    }

    fn discard(&mut self, n: usize) {
        (**self).discard(n)
    }

    fn stream_mux(&self) -> &AnyMux {
        (**self).stream_mux()
    }

    fn on_stream_mux_change(&mut self, mux: &AnyMux) {
        (**self).on_stream_mux_change(mux)
    }

    fn tune_options(&self) -> &TuneOptions {
        (**self).tune_options()
    }

    fn embedded_stream_pid(&self) -> Option<u16> {
        (**self).embedded_stream_pid()
    }

    fn set_pids(&mut self, pids: &[u16]) -> io::Result<()> {
        (**self).set_pids(pids)
    }

    fn no_data(&self) -> bool {
        (**self).no_data()
    }
}

/// True for the overflow error the demux reports after dropping data.
pub fn is_overflow(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(nix::libc::EOVERFLOW)
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

/// Reader over bytes pushed by the caller. Used for recorded streams and tests.
pub struct MemoryReader {
    buf: BytesMut,
    mux: AnyMux,
    options: TuneOptions,
    pids: Vec<u16>,
    received_any: bool,
}

impl MemoryReader {
    pub fn new(mux: AnyMux, options: TuneOptions) -> Self {
        Self {
            buf: BytesMut::new(),
            mux,
            options,
            pids: Vec::new(),
            received_any: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.received_any |= !data.is_empty();
        self.buf.extend_from_slice(data);
    }

    pub fn push_packets<'a, I>(&mut self, packets: I)
    where
        I: IntoIterator<Item = &'a [u8; TS_PACKET_SIZE]>,
    {
        for p in packets {
            self.push(p);
        }
    }

    /// Bytes not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// PIDs last requested by the engine.
    pub fn pids(&self) -> &[u16] {
        &self.pids
    }
}

impl StreamReader for MemoryReader {
    fn read(&mut self) -> io::Result<&[u8]> {
        if self.buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(&self.buf[..])
    }

    fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    fn stream_mux(&self) -> &AnyMux {
        &self.mux
    }

    fn on_stream_mux_change(&mut self, mux: &AnyMux) {
        self.mux = mux.clone();
    }

    fn tune_options(&self) -> &TuneOptions {
        &self.options
    }

    fn set_pids(&mut self, pids: &[u16]) -> io::Result<()> {
        self.pids = pids.to_vec();
        Ok(())
    }

    fn no_data(&self) -> bool {
        !self.received_any
    }
}

/// Embedded stream decapsulated from T2MI packets on one PID of an outer stream.
pub struct EmbeddedReader<R: StreamReader> {
    outer: R,
    demux: T2miDemux,
    out: BytesMut,
    mux: AnyMux,
    received_any: bool,
}

impl<R: StreamReader> EmbeddedReader<R> {
    /// `mux` is the embedded mux; its key carries the T2MI PID and PLP id.
    pub fn new(mut outer: R, mux: AnyMux) -> io::Result<Self> {
        let pid = mux.key().t2mi_pid;
        let plp_id = mux.key().stream_id.max(0) as u8;
        outer.set_pids(&[pid])?;
        Ok(Self {
            outer,
            demux: T2miDemux::new(pid, plp_id),
            out: BytesMut::new(),
            mux,
            received_any: false,
        })
    }

    fn pump(&mut self) -> io::Result<()> {
        let data = self.outer.read()?;
        let whole = data.len() / TS_PACKET_SIZE * TS_PACKET_SIZE;
        for pkt in data[..whole].chunks_exact(TS_PACKET_SIZE) {
            let Ok(h) = TsHeader::parse(pkt) else {
                continue;
            };
            if h.pid != self.demux.pid() {
                continue;
            }
            if let Some(payload) = packet::payload(&h, pkt) {
                self.demux.push(&h, payload, &mut self.out);
            }
        }
        self.outer.discard(whole);
        Ok(())
    }
}

impl<R: StreamReader> StreamReader for EmbeddedReader<R> {
    fn read(&mut self) -> io::Result<&[u8]> {
        match self.pump() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && !self.out.is_empty() => {}
            Err(e) => return Err(e),
        }
        if self.out.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.received_any = true;
        Ok(&self.out[..])
    }

    fn discard(&mut self, n: usize) {
        let n = n.min(self.out.len());
        self.out.advance(n);
    }

    fn stream_mux(&self) -> &AnyMux {
        &self.mux
    }

    fn on_stream_mux_change(&mut self, mux: &AnyMux) {
        self.mux = mux.clone();
    }

    fn tune_options(&self) -> &TuneOptions {
        self.outer.tune_options()
    }

    fn embedded_stream_pid(&self) -> Option<u16> {
        Some(self.demux.pid())
    }

    /// All PIDs of the embedded stream pass; the outer stream keeps only the T2MI PID.
    fn set_pids(&mut self, _pids: &[u16]) -> io::Result<()> {
        Ok(())
    }

    fn no_data(&self) -> bool {
        !self.received_any
    }
}

#[cfg(target_os = "linux")]
pub use self::linux::DvrReader;

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    use bytes::{Buf, BytesMut};
    use log::{debug, warn};
    use neumo_protocol::AnyMux;

    use super::{StreamReader, READ_CHUNK_SIZE};
    use crate::tuner::TuneOptions;

    const DMX_IN_FRONTEND: u32 = 0;
    const DMX_OUT_TS_TAP: u32 = 2;
    const DMX_PES_OTHER: u32 = 20;
    const DMX_IMMEDIATE_START: u32 = 4;
    /// Kernel demux buffer, large enough to ride out short stalls of the tuner thread.
    const DMX_BUFFER_SIZE: u64 = 32 * 1024 * 1024;

    #[repr(C)]
    pub struct DmxPesFilterParams {
        pub pid: u16,
        pub input: u32,
        pub output: u32,
        pub pes_type: u32,
        pub flags: u32,
    }

    nix::ioctl_none!(dmx_stop, b'o', 42);
    nix::ioctl_write_ptr!(dmx_set_pes_filter, b'o', 44, DmxPesFilterParams);
    nix::ioctl_write_int_bad!(dmx_set_buffer_size, nix::request_code_none!(b'o', 45));
    nix::ioctl_write_ptr!(dmx_add_pid, b'o', 51, u16);
    nix::ioctl_write_ptr!(dmx_remove_pid, b'o', 52, u16);

    /// Transport stream from the DVR device, filtered by a TS tap on the demux.
    pub struct DvrReader {
        demux: File,
        dvr: File,
        buf: BytesMut,
        pids: Vec<u16>,
        mux: AnyMux,
        options: TuneOptions,
        received_any: bool,
    }

    impl DvrReader {
        pub fn open(adapter_no: u32, mux: AnyMux, options: TuneOptions) -> io::Result<Self> {
            let base = format!("/dev/dvb/adapter{adapter_no}");
            let demux = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(nix::libc::O_NONBLOCK)
                .open(format!("{base}/demux0"))?;
            let dvr = OpenOptions::new()
                .read(true)
                .custom_flags(nix::libc::O_NONBLOCK)
                .open(format!("{base}/dvr0"))?;
            // SAFETY: plain integer argument on an open demux fd.
            if let Err(e) = unsafe { dmx_set_buffer_size(demux.as_raw_fd(), DMX_BUFFER_SIZE as i32) } {
                warn!("[DvrReader] DMX_SET_BUFFER_SIZE failed: {}", e);
            }
            debug!("[DvrReader] opened {}", base);
            Ok(Self {
                demux,
                dvr,
                buf: BytesMut::with_capacity(READ_CHUNK_SIZE * 2),
                pids: Vec::new(),
                mux,
                options,
                received_any: false,
            })
        }

        fn start_filter(&mut self, first_pid: u16) -> io::Result<()> {
            let params = DmxPesFilterParams {
                pid: first_pid,
                input: DMX_IN_FRONTEND,
                output: DMX_OUT_TS_TAP,
                pes_type: DMX_PES_OTHER,
                flags: DMX_IMMEDIATE_START,
            };
            // SAFETY: params outlives the call and matches struct dmx_pes_filter_params.
            unsafe { dmx_set_pes_filter(self.demux.as_raw_fd(), &params) }.map_err(io::Error::from)?;
            Ok(())
        }
    }

    impl StreamReader for DvrReader {
        fn read(&mut self) -> io::Result<&[u8]> {
            let len = self.buf.len();
            self.buf.resize(len + READ_CHUNK_SIZE, 0);
            match self.dvr.read(&mut self.buf[len..]) {
                Ok(n) => {
                    self.buf.truncate(len + n);
                    self.received_any |= n > 0;
                }
                Err(e) => {
                    self.buf.truncate(len);
                    if self.buf.is_empty() || e.kind() != io::ErrorKind::WouldBlock {
                        return Err(e);
                    }
                }
            }
            if self.buf.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            Ok(&self.buf[..])
        }

        fn discard(&mut self, n: usize) {
            let n = n.min(self.buf.len());
            self.buf.advance(n);
        }

        fn stream_mux(&self) -> &AnyMux {
            &self.mux
        }

        fn on_stream_mux_change(&mut self, mux: &AnyMux) {
            self.mux = mux.clone();
        }

        fn tune_options(&self) -> &TuneOptions {
            &self.options
        }

        fn set_pids(&mut self, pids: &[u16]) -> io::Result<()> {
            let fd = self.demux.as_raw_fd();
            if self.pids.is_empty() {
                let Some(&first) = pids.first() else {
                    return Ok(());
                };
                self.start_filter(first)?;
                self.pids.push(first);
            }
            for pid in self.pids.clone() {
                if !pids.contains(&pid) && pid != self.pids[0] {
                    // SAFETY: pid outlives the call.
                    unsafe { dmx_remove_pid(fd, &pid) }.map_err(io::Error::from)?;
                    self.pids.retain(|p| *p != pid);
                }
            }
            for &pid in pids {
                if !self.pids.contains(&pid) {
                    // SAFETY: pid outlives the call.
                    unsafe { dmx_add_pid(fd, &pid) }.map_err(io::Error::from)?;
                    self.pids.push(pid);
                }
            }
            Ok(())
        }

        fn no_data(&self) -> bool {
            !self.received_any
        }
    }

    impl Drop for DvrReader {
        fn drop(&mut self) {
            // SAFETY: no argument.
            let _ = unsafe { dmx_stop(self.demux.as_raw_fd()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_reader_keeps_partial_packets() {
        let mut r = MemoryReader::new(AnyMux::default(), TuneOptions::default());
        assert!(r.no_data());
        assert_eq!(r.read().unwrap_err().kind(), io::ErrorKind::WouldBlock);

        r.push(&[0x47; 300]);
        assert_eq!(r.read().unwrap().len(), 300);
        r.discard(188);
        assert_eq!(r.pending(), 112);
        r.discard(1000);
        assert_eq!(r.pending(), 0);
        assert!(!r.no_data());
    }

    #[test]
    #[cfg(unix)]
    fn test_overflow_detection() {
        assert!(is_overflow(&io::Error::from_raw_os_error(nix::libc::EOVERFLOW)));
        assert!(!is_overflow(&io::Error::from(io::ErrorKind::WouldBlock)));
    }
}
