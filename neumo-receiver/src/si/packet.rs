//! MPEG-TS packet header parsing.

/// TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte (0x47).
pub const SYNC_BYTE: u8 = 0x47;

/// Parsed TS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    /// Packet Identifier (13 bits).
    pub pid: u16,
    pub scrambling_control: u8,
    pub adaptation_field_control: u8,
    pub continuity_counter: u8,
}

impl TsHeader {
    /// Parse the 4 byte header of a packet.
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < TS_PACKET_SIZE {
            return Err("Packet too short");
        }
        if data[0] != SYNC_BYTE {
            return Err("Invalid sync byte");
        }
        Ok(TsHeader {
            transport_error: data[1] & 0x80 != 0,
            payload_unit_start: data[1] & 0x40 != 0,
            pid: ((data[1] as u16 & 0x1F) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_control: (data[3] >> 4) & 0x03,
            continuity_counter: data[3] & 0x0F,
        })
    }

    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }

    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }
}

/// Payload of a packet, skipping the adaptation field.
pub fn payload<'a>(header: &TsHeader, data: &'a [u8]) -> Option<&'a [u8]> {
    if !header.has_payload() {
        return None;
    }
    let mut offset = 4;
    if header.has_adaptation_field() {
        offset += 1 + data[4] as usize;
    }
    if offset >= TS_PACKET_SIZE {
        return None;
    }
    Some(&data[offset..TS_PACKET_SIZE])
}

/// Build a TS packet carrying `payload` on `pid`, padded with 0xFF.
pub fn build_packet(pid: u16, payload_unit_start: bool, cc: u8, payload: &[u8]) -> [u8; TS_PACKET_SIZE] {
    let mut pkt = [0xFFu8; TS_PACKET_SIZE];
    pkt[0] = SYNC_BYTE;
    pkt[1] = ((pid >> 8) as u8 & 0x1F) | if payload_unit_start { 0x40 } else { 0 };
    pkt[2] = pid as u8;
    pkt[3] = 0x10 | (cc & 0x0F);
    let n = payload.len().min(TS_PACKET_SIZE - 4);
    pkt[4..4 + n].copy_from_slice(&payload[..n]);
    pkt
}

/// Split a section into TS packets, starting with a pointer field of 0.
pub fn packetize_section(pid: u16, first_cc: u8, section: &[u8]) -> Vec<[u8; TS_PACKET_SIZE]> {
    let mut out = Vec::new();
    let mut cc = first_cc;
    let mut first = Vec::with_capacity(TS_PACKET_SIZE - 4);
    first.push(0);
    let take = section.len().min(TS_PACKET_SIZE - 5);
    first.extend_from_slice(&section[..take]);
    out.push(build_packet(pid, true, cc, &first));
    let mut rest = &section[take..];
    while !rest.is_empty() {
        cc = (cc + 1) & 0x0F;
        let take = rest.len().min(TS_PACKET_SIZE - 4);
        out.push(build_packet(pid, false, cc, &rest[..take]));
        rest = &rest[take..];
    }
    out
}
