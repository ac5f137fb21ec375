//! Ethernet II frame parsing/building (`SPEC_FULL.md` §4.7, §6).
//!
//! The router works on a parsed [`EthernetHeader`] rather than raw bytes so
//! its forwarding logic never re-derives offsets into the frame.

use endian_num::be16;

pub const MAC_LEN: usize = 6;
pub const HEADER_LEN: usize = 14;
pub const BROADCAST_MAC: [u8; MAC_LEN] = [0xFF; MAC_LEN];

pub type Mac = [u8; MAC_LEN];

pub fn is_broadcast(mac: &Mac) -> bool {
    *mac == BROADCAST_MAC
}

pub fn is_multicast(mac: &Mac) -> bool {
    mac[0] & 0x01 != 0
}

/// A parsed Ethernet II header. Payload is borrowed from the original
/// frame buffer, never copied. `ethertype` keeps its network byte order
/// wrapper rather than a bare `u16` so a future switch to a zero-copy,
/// memory-mapped header never silently reinterprets the wire bytes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EthernetHeader {
    pub dst: Mac,
    pub src: Mac,
    pub ethertype: be16,
}

impl EthernetHeader {
    pub fn ethertype(self) -> u16 {
        self.ethertype.get()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WireError {
    /// Frame shorter than the 14-byte header (`§4.7` step 1).
    Short,
}

/// Parses the header out of `frame`. Rejects anything under
/// [`HEADER_LEN`] bytes; does not validate the payload beyond that.
pub fn parse_header(frame: &[u8]) -> Result<EthernetHeader, WireError> {
    if frame.len() < HEADER_LEN {
        return Err(WireError::Short);
    }
    let mut dst = [0u8; MAC_LEN];
    let mut src = [0u8; MAC_LEN];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);
    let ethertype = be16::new(u16::from_be_bytes([frame[12], frame[13]]));
    Ok(EthernetHeader { dst, src, ethertype })
}

/// Writes `header` followed by `payload` into `out`, returning the total
/// frame length. `out` must be at least `HEADER_LEN + payload.len()`.
pub fn build_frame(header: &EthernetHeader, payload: &[u8], out: &mut [u8]) -> Result<usize, WireError> {
    let total = HEADER_LEN + payload.len();
    if out.len() < total {
        return Err(WireError::Short);
    }
    out[0..6].copy_from_slice(&header.dst);
    out[6..12].copy_from_slice(&header.src);
    out[12..14].copy_from_slice(&header.ethertype.get().to_be_bytes());
    out[14..total].copy_from_slice(payload);
    Ok(total)
}

/// Common ethertypes referenced by the router's IGMP special case
/// (`§4.7` step 4).
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
}

/// Minimal check for "this IPv4 payload carries IGMP" (protocol number 2),
/// used only for the router's broadcast-fallthrough special case — not a
/// general IP parser.
pub fn is_igmp(ethertype: u16, payload: &[u8]) -> bool {
    const IGMP_PROTOCOL: u8 = 2;
    const IHL_MASK: u8 = 0x0F;
    if ethertype != self::ethertype::IPV4 || payload.len() < 10 {
        return false;
    }
    let version = payload[0] >> 4;
    if version != 4 {
        return false;
    }
    payload[9] == IGMP_PROTOCOL && (payload[0] & IHL_MASK) >= 5
}
