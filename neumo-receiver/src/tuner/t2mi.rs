//! T2MI decapsulation.
//!
//! T2MI packets travel on one PID of the outer stream, packed like sections
//! (pointer field on payload unit start). Baseband frames of the selected PLP
//! carry the user packets of the embedded transport stream with their sync
//! byte removed.

use bytes::{BufMut, BytesMut};
use log::trace;

use crate::si::{crc32_mpeg2, TsHeader, SYNC_BYTE};

const T2MI_HEADER_LEN: usize = 6;
const T2MI_CRC_LEN: usize = 4;
const BBHEADER_LEN: usize = 10;
const PACKET_TYPE_BASEBAND_FRAME: u8 = 0x00;
/// User packet length without the sync byte.
const UP_LEN: usize = 187;

/// Rebuilds the embedded transport stream of one PLP.
#[derive(Debug)]
pub struct T2miDemux {
    pid: u16,
    plp_id: u8,
    packet: Vec<u8>,
    packet_synced: bool,
    last_cc: Option<u8>,
    /// Partial user packet carried across baseband frames.
    up: Vec<u8>,
    up_synced: bool,
}

impl T2miDemux {
    pub fn new(pid: u16, plp_id: u8) -> Self {
        Self {
            pid,
            plp_id,
            packet: Vec::new(),
            packet_synced: false,
            last_cc: None,
            up: Vec::new(),
            up_synced: false,
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Feed the payload of one TS packet of the T2MI PID. Rebuilt TS packets
    /// are appended to `out`.
    pub fn push(&mut self, header: &TsHeader, payload: &[u8], out: &mut BytesMut) {
        let cc = header.continuity_counter;
        if let Some(last) = self.last_cc {
            if cc == last {
                return;
            }
            if cc != (last + 1) & 0x0F {
                self.packet.clear();
                self.packet_synced = false;
                self.up_synced = false;
            }
        }
        self.last_cc = Some(cc);

        let mut data = payload;
        if header.payload_unit_start {
            let Some((&pointer, rest)) = data.split_first() else {
                return;
            };
            let pointer = pointer as usize;
            if pointer > rest.len() {
                self.packet.clear();
                self.packet_synced = false;
                return;
            }
            if self.packet_synced {
                self.packet.extend_from_slice(&rest[..pointer]);
                self.drain(out);
            }
            self.packet.clear();
            data = &rest[pointer..];
            self.packet_synced = true;
        } else if !self.packet_synced {
            return;
        }
        self.packet.extend_from_slice(data);
        self.drain(out);
    }

    fn drain(&mut self, out: &mut BytesMut) {
        while self.packet.len() >= T2MI_HEADER_LEN {
            if self.packet[0] == 0xFF {
                self.packet.clear();
                self.packet_synced = false;
                return;
            }
            let payload_bits = u16::from_be_bytes([self.packet[4], self.packet[5]]) as usize;
            let total = T2MI_HEADER_LEN + payload_bits.div_ceil(8) + T2MI_CRC_LEN;
            if self.packet.len() < total {
                return;
            }
            let pkt: Vec<u8> = self.packet.drain(..total).collect();
            self.handle_packet(&pkt, out);
        }
    }

    fn handle_packet(&mut self, pkt: &[u8], out: &mut BytesMut) {
        let crc_at = pkt.len() - T2MI_CRC_LEN;
        let crc = u32::from_be_bytes([pkt[crc_at], pkt[crc_at + 1], pkt[crc_at + 2], pkt[crc_at + 3]]);
        if crc32_mpeg2(&pkt[..crc_at]) != crc {
            trace!("[T2mi] pid={} crc error", self.pid);
            self.up_synced = false;
            return;
        }
        if pkt[0] != PACKET_TYPE_BASEBAND_FRAME {
            return;
        }
        let payload = &pkt[T2MI_HEADER_LEN..crc_at];
        // frame_idx, plp_id, interleaving frame start
        if payload.len() < 3 + BBHEADER_LEN || payload[1] != self.plp_id {
            return;
        }
        let bb = &payload[3..];
        let npd = bb[0] & 0x04 != 0;
        let dfl = u16::from_be_bytes([bb[4], bb[5]]) as usize / 8;
        let syncd = u16::from_be_bytes([bb[7], bb[8]]);
        let field = &bb[BBHEADER_LEN..];
        let field = &field[..dfl.min(field.len())];
        // a deleted null packet counter follows each user packet
        let up_len = UP_LEN + npd as usize;

        if syncd == 0xFFFF {
            if self.up_synced {
                self.up.extend_from_slice(field);
                if self.up.len() > up_len {
                    self.up.clear();
                    self.up_synced = false;
                }
            }
            return;
        }

        let head = (syncd as usize / 8).min(field.len());
        if self.up_synced {
            self.up.extend_from_slice(&field[..head]);
            if self.up.len() == up_len {
                emit(&self.up, out);
            }
        }
        self.up.clear();
        self.up_synced = true;

        let mut rest = &field[head..];
        while rest.len() >= up_len {
            emit(&rest[..up_len], out);
            rest = &rest[up_len..];
        }
        self.up.extend_from_slice(rest);
    }
}

fn emit(up: &[u8], out: &mut BytesMut) {
    out.put_u8(SYNC_BYTE);
    out.put_slice(&up[..UP_LEN]);
}
