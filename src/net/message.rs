// Wire protocol: every message is a 24-byte header followed by its payload:
//   [4 magic][12 message type, NUL padded][4 LE payload length][4 checksum]
//
// The checksum is the first 4 bytes of sha256d(payload). Lists inside payloads
// are prefixed with a compact-size count.

use crate::crypto::hash::checksum;

pub const MESSAGE_START_SIZE: usize = 4;
pub const MESSAGE_TYPE_SIZE: usize = 12;
pub const MESSAGE_SIZE_SIZE: usize = 4;
pub const CHECKSUM_SIZE: usize = 4;
pub const HEADER_SIZE: usize = MESSAGE_START_SIZE + MESSAGE_TYPE_SIZE + MESSAGE_SIZE_SIZE + CHECKSUM_SIZE;

pub const MSG_TX: u32 = 1;

const INVENTORY_SIZE: usize = 4 + 32;
const BLOCK_HEADER_SIZE: usize = 80;
const NET_ADDRESS_SIZE: usize = 8 + 16 + 2;
const TIMED_ADDRESS_SIZE: usize = 4 + NET_ADDRESS_SIZE;
const MAX_USER_AGENT_LENGTH: u64 = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of data at offset {0}")]
    UnexpectedEnd(usize),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
    #[error("non-canonical compact size")]
    NonCanonicalCompactSize,
    #[error("string length {0} exceeds limit")]
    StringTooLong(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub msgtype: [u8; MESSAGE_TYPE_SIZE],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn new(magic: [u8; 4], msgtype: &str, payload: &[u8]) -> Self {
        let mut field = [0u8; MESSAGE_TYPE_SIZE];
        let n = msgtype.len().min(MESSAGE_TYPE_SIZE);
        field[..n].copy_from_slice(&msgtype.as_bytes()[..n]);
        MessageHeader {
            magic,
            msgtype: field,
            length: payload.len() as u32,
            checksum: checksum(payload),
        }
    }

    pub fn from_bytes(b: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&b[0..4]);
        let mut msgtype = [0u8; MESSAGE_TYPE_SIZE];
        msgtype.copy_from_slice(&b[4..16]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&b[16..20]);
        let mut sum = [0u8; 4];
        sum.copy_from_slice(&b[20..24]);
        MessageHeader {
            magic,
            msgtype,
            length: u32::from_le_bytes(len),
            checksum: sum,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4..16].copy_from_slice(&self.msgtype);
        out[16..20].copy_from_slice(&self.length.to_le_bytes());
        out[20..24].copy_from_slice(&self.checksum);
        out
    }

    /// Printable ASCII up to the first NUL, followed only by NUL padding
    pub fn is_msgtype_valid(&self) -> bool {
        let end = self
            .msgtype
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(MESSAGE_TYPE_SIZE);
        self.msgtype[..end].iter().all(|&c| (b' '..=0x7e).contains(&c))
            && self.msgtype[end..].iter().all(|&c| c == 0)
    }

    /// Exact message type of a header that passed `is_msgtype_valid`
    pub fn msgtype_str(&self) -> Option<&str> {
        if !self.is_msgtype_valid() {
            return None;
        }
        let end = self
            .msgtype
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(MESSAGE_TYPE_SIZE);
        std::str::from_utf8(&self.msgtype[..end]).ok()
    }

    /// Message type for logging: bytes up to the first NUL, with anything
    /// outside the safe character set removed
    pub fn msgtype_lossy(&self) -> String {
        self.msgtype
            .iter()
            .take_while(|&&c| c != 0)
            .filter(|&&c| c.is_ascii_alphanumeric() || b" .,;-_/:?@()".contains(&c))
            .map(|&c| c as char)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inventory {
    pub kind: u32,
    pub hash: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: [u8; 32],
    pub merkle_root: [u8; 32],
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimedAddress {
    pub time: u32,
    pub addr: NetAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    Headers(Vec<BlockHeader>),
    Addr(Vec<TimedAddress>),
    GetAddr,
    SendHeaders,
    /// Well-formed frame of a type this node does not interpret
    Unknown { msgtype: String, payload: Vec<u8> },
}

pub fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_net_address(buf: &mut Vec<u8>, a: &NetAddress) {
    write_u64(buf, a.services);
    buf.extend_from_slice(&a.ip);
    buf.extend_from_slice(&a.port.to_be_bytes());
}

fn write_inventory(buf: &mut Vec<u8>, inv: &[Inventory]) {
    write_compact_size(buf, inv.len() as u64);
    for i in inv {
        write_u32(buf, i.kind);
        buf.extend_from_slice(&i.hash);
    }
}

fn take<const N: usize>(d: &[u8], off: &mut usize) -> Result<[u8; N], DecodeError> {
    let end = off.checked_add(N).ok_or(DecodeError::UnexpectedEnd(*off))?;
    if d.len() < end {
        return Err(DecodeError::UnexpectedEnd(*off));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&d[*off..end]);
    *off = end;
    Ok(out)
}

fn read_u8(d: &[u8], off: &mut usize) -> Result<u8, DecodeError> {
    Ok(take::<1>(d, off)?[0])
}

fn read_u16(d: &[u8], off: &mut usize) -> Result<u16, DecodeError> {
    Ok(u16::from_le_bytes(take(d, off)?))
}

fn read_u32(d: &[u8], off: &mut usize) -> Result<u32, DecodeError> {
    Ok(u32::from_le_bytes(take(d, off)?))
}

fn read_u64(d: &[u8], off: &mut usize) -> Result<u64, DecodeError> {
    Ok(u64::from_le_bytes(take(d, off)?))
}

/// Read a compact-size integer, rejecting non-minimal encodings
pub fn read_compact_size(d: &[u8], off: &mut usize) -> Result<u64, DecodeError> {
    let (v, min) = match read_u8(d, off)? {
        0xfd => (read_u16(d, off)? as u64, 0xfd),
        0xfe => (read_u32(d, off)? as u64, 0x1_0000),
        0xff => (read_u64(d, off)?, 0x1_0000_0000),
        b => return Ok(b as u64),
    };
    if v < min {
        return Err(DecodeError::NonCanonicalCompactSize);
    }
    Ok(v)
}

/// Number of list entries announced at the start of a payload
pub fn peek_list_len(payload: &[u8]) -> Result<u64, DecodeError> {
    let mut off = 0usize;
    read_compact_size(payload, &mut off)
}

fn read_net_address(d: &[u8], off: &mut usize) -> Result<NetAddress, DecodeError> {
    let services = read_u64(d, off)?;
    let ip = take::<16>(d, off)?;
    let port = u16::from_be_bytes(take(d, off)?);
    Ok(NetAddress { services, ip, port })
}

/// Capacity hint that never exceeds what the remaining bytes could hold
fn bounded_capacity(count: u64, d: &[u8], off: usize, entry_size: usize) -> usize {
    let fit = d.len().saturating_sub(off) / entry_size;
    (count as usize).min(fit)
}

fn read_inventory(d: &[u8], off: &mut usize) -> Result<Vec<Inventory>, DecodeError> {
    let count = read_compact_size(d, off)?;
    let mut out = Vec::with_capacity(bounded_capacity(count, d, *off, INVENTORY_SIZE));
    for _ in 0..count {
        let kind = read_u32(d, off)?;
        let hash = take::<32>(d, off)?;
        out.push(Inventory { kind, hash });
    }
    Ok(out)
}

fn read_headers(d: &[u8], off: &mut usize) -> Result<Vec<BlockHeader>, DecodeError> {
    let count = read_compact_size(d, off)?;
    let mut out = Vec::with_capacity(bounded_capacity(count, d, *off, BLOCK_HEADER_SIZE + 1));
    for _ in 0..count {
        let header = BlockHeader {
            version: read_u32(d, off)? as i32,
            prev_block: take(d, off)?,
            merkle_root: take(d, off)?,
            time: read_u32(d, off)?,
            bits: read_u32(d, off)?,
            nonce: read_u32(d, off)?,
        };
        // headers messages carry a (always empty) transaction count per header
        read_compact_size(d, off)?;
        out.push(header);
    }
    Ok(out)
}

fn read_addrs(d: &[u8], off: &mut usize) -> Result<Vec<TimedAddress>, DecodeError> {
    let count = read_compact_size(d, off)?;
    let mut out = Vec::with_capacity(bounded_capacity(count, d, *off, TIMED_ADDRESS_SIZE));
    for _ in 0..count {
        let time = read_u32(d, off)?;
        let addr = read_net_address(d, off)?;
        out.push(TimedAddress { time, addr });
    }
    Ok(out)
}

fn read_version(d: &[u8], off: &mut usize) -> Result<VersionMessage, DecodeError> {
    let version = read_u32(d, off)? as i32;
    let services = read_u64(d, off)?;
    let timestamp = read_u64(d, off)? as i64;
    let addr_recv = read_net_address(d, off)?;
    let addr_from = read_net_address(d, off)?;
    let nonce = read_u64(d, off)?;
    let ua_len = read_compact_size(d, off)?;
    if ua_len > MAX_USER_AGENT_LENGTH {
        return Err(DecodeError::StringTooLong(ua_len));
    }
    let ua_end = *off + ua_len as usize;
    if d.len() < ua_end {
        return Err(DecodeError::UnexpectedEnd(*off));
    }
    let user_agent = String::from_utf8_lossy(&d[*off..ua_end]).into_owned();
    *off = ua_end;
    let start_height = read_u32(d, off)? as i32;
    // relay flag is optional for old peers
    let relay = if *off < d.len() { read_u8(d, off)? != 0 } else { true };
    Ok(VersionMessage {
        version,
        services,
        timestamp,
        addr_recv,
        addr_from,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

impl NetworkMessage {
    pub fn msgtype(&self) -> &str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::SendHeaders => "sendheaders",
            NetworkMessage::Unknown { msgtype, .. } => msgtype,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            NetworkMessage::Version(v) => {
                write_u32(&mut payload, v.version as u32);
                write_u64(&mut payload, v.services);
                write_u64(&mut payload, v.timestamp as u64);
                write_net_address(&mut payload, &v.addr_recv);
                write_net_address(&mut payload, &v.addr_from);
                write_u64(&mut payload, v.nonce);
                write_compact_size(&mut payload, v.user_agent.len() as u64);
                payload.extend_from_slice(v.user_agent.as_bytes());
                write_u32(&mut payload, v.start_height as u32);
                payload.push(v.relay as u8);
            }
            NetworkMessage::Verack | NetworkMessage::GetAddr | NetworkMessage::SendHeaders => {}
            NetworkMessage::Ping(n) | NetworkMessage::Pong(n) => write_u64(&mut payload, *n),
            NetworkMessage::Inv(inv) | NetworkMessage::GetData(inv) | NetworkMessage::NotFound(inv) => {
                write_inventory(&mut payload, inv);
            }
            NetworkMessage::Headers(headers) => {
                write_compact_size(&mut payload, headers.len() as u64);
                for h in headers {
                    write_u32(&mut payload, h.version as u32);
                    payload.extend_from_slice(&h.prev_block);
                    payload.extend_from_slice(&h.merkle_root);
                    write_u32(&mut payload, h.time);
                    write_u32(&mut payload, h.bits);
                    write_u32(&mut payload, h.nonce);
                    payload.push(0);
                }
            }
            NetworkMessage::Addr(addrs) => {
                write_compact_size(&mut payload, addrs.len() as u64);
                for a in addrs {
                    write_u32(&mut payload, a.time);
                    write_net_address(&mut payload, &a.addr);
                }
            }
            NetworkMessage::Unknown { payload: raw, .. } => payload.extend_from_slice(raw),
        }
        payload
    }

    /// Full frame: header (with checksum) followed by the payload
    pub fn to_frame(&self, magic: [u8; 4]) -> Vec<u8> {
        let payload = self.encode_payload();
        let header = MessageHeader::new(magic, self.msgtype(), &payload);
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decode a validated payload. Unrecognised types never fail.
    pub fn decode(msgtype: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let d = payload;
        let mut off = 0usize;
        let msg = match msgtype {
            "version" => NetworkMessage::Version(read_version(d, &mut off)?),
            "verack" => NetworkMessage::Verack,
            "getaddr" => NetworkMessage::GetAddr,
            "sendheaders" => NetworkMessage::SendHeaders,
            "ping" => NetworkMessage::Ping(read_u64(d, &mut off)?),
            "pong" => NetworkMessage::Pong(read_u64(d, &mut off)?),
            "inv" => NetworkMessage::Inv(read_inventory(d, &mut off)?),
            "getdata" => NetworkMessage::GetData(read_inventory(d, &mut off)?),
            "notfound" => NetworkMessage::NotFound(read_inventory(d, &mut off)?),
            "headers" => NetworkMessage::Headers(read_headers(d, &mut off)?),
            "addr" => NetworkMessage::Addr(read_addrs(d, &mut off)?),
            other => {
                return Ok(NetworkMessage::Unknown {
                    msgtype: other.to_string(),
                    payload: payload.to_vec(),
                });
            }
        };
        if off != d.len() {
            return Err(DecodeError::TrailingBytes(d.len() - off));
        }
        Ok(msg)
    }
}

/// Build a frame for an arbitrary type and payload, e.g. for junk messages
pub fn build_raw_frame(magic: [u8; 4], msgtype: &str, payload: &[u8]) -> Vec<u8> {
    let header = MessageHeader::new(magic, msgtype, payload);
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    frame
}
