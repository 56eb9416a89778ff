//! Hub wire protocol implementation.
//! Handles packet framing, checksums, payload encryption and the discovery layout.

use crate::crypto::{BroadlinkCipher, DEFAULT_KEY};
use crate::error::{BroadlinkError, Result};
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Datelike, Local, Offset, TimeZone, Timelike};
use serde::{Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Every command packet starts with this magic.
pub const MAGIC: [u8; 8] = [0x5a, 0xa5, 0xaa, 0x55, 0x5a, 0xa5, 0xaa, 0x55];
/// Seed of both additive checksums.
pub const CHECKSUM_SEED: u16 = 0xBEAF;

/// Command packet header length; the encrypted payload follows.
pub const HEADER_LEN: usize = 0x38;
/// Discovery request length.
pub const DISCOVERY_LEN: usize = 0x30;
/// Shortest discovery reply that still carries type code and MAC.
pub const DISCOVERY_REPLY_MIN_LEN: usize = 0x40;

const OFF_PAYLOAD_LEN: usize = 0x1e;
const OFF_CHECKSUM: usize = 0x20;
const OFF_ERROR: usize = 0x22;
const OFF_DEVTYPE: usize = 0x24;
const OFF_COMMAND: usize = 0x26;
const OFF_COUNTER: usize = 0x28;
const OFF_MAC: usize = 0x2a;
const OFF_DEVICE_ID: usize = 0x30;
const OFF_PAYLOAD_CHECKSUM: usize = 0x34;

const OFF_HELLO_TZ: usize = 0x08;
const OFF_HELLO_YEAR: usize = 0x0c;
const OFF_HELLO_IP: usize = 0x18;
const OFF_HELLO_PORT: usize = 0x1c;
const OFF_REPLY_DEVTYPE: usize = 0x34;
const OFF_REPLY_MAC: usize = 0x3a;
const OFF_REPLY_NAME: usize = 0x40;
const REPLY_NAME_END: usize = 0x5c;
const OFF_REPLY_LOCK: usize = 0x7f;

define_command_type! {
    Hello = 0x06,
    HelloReply = 0x07,
    Auth = 0x65,
    Sp1Power = 0x66,
    Command = 0x6a,
    AuthReply = 0x3e9,
    CommandReply = 0x3ee,
}

impl CommandType {
    /// Discovery travels in clear; everything on the command channel is encrypted.
    pub fn requires_encryption(self) -> bool {
        !matches!(self, CommandType::Hello | CommandType::HelloReply)
    }
}

/// Vendor-assigned 16-bit hardware model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceTypeCode(pub u16);

impl DeviceTypeCode {
    /// Upper-case hex rendering without prefix, e.g. `4EB5`.
    pub fn type_name(self) -> String {
        format!("{:X}", self.0)
    }
}

impl fmt::Display for DeviceTypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u16> for DeviceTypeCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

/// A device MAC address in display order.
///
/// The wire carries MACs reversed; [`MacAddress::from_wire`] and
/// [`MacAddress::to_wire`] convert at the packet boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 6 {
            return Err(BroadlinkError::InvalidPacket("MAC field too short".into()));
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[..6]);
        mac.reverse();
        Ok(Self(mac))
    }

    pub fn to_wire(self) -> [u8; 6] {
        let mut mac = self.0;
        mac.reverse();
        mac
    }

    /// Stable identifier used by hosts: twelve upper-case hex digits.
    pub fn to_id(self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl FromStr for MacAddress {
    type Err = BroadlinkError;

    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.chars().filter(|c| !matches!(c, ':' | '-')).collect();
        let bytes = hex::decode(&digits)
            .map_err(|e| BroadlinkError::InvalidArgument(format!("bad MAC '{}': {}", s, e)))?;
        if bytes.len() != 6 {
            return Err(BroadlinkError::InvalidArgument(format!(
                "MAC '{}' must have 6 bytes",
                s
            )));
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes);
        Ok(Self(mac))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Per-session identity and key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub mac: MacAddress,
    /// Device-assigned id; zero until authenticated
    pub device_id: u32,
    /// Session key; the device default until exchanged
    pub key: [u8; 16],
    /// Wraps mod 65536
    pub counter: u16,
}

impl SessionCredentials {
    /// Fresh credentials with the default key and a random starting counter.
    pub fn new(mac: MacAddress) -> Self {
        Self {
            mac,
            device_id: 0,
            key: DEFAULT_KEY,
            counter: rand::random::<u16>(),
        }
    }

    /// Advances the counter and returns the value to stamp on the next packet.
    pub fn next_counter(&mut self) -> u16 {
        self.counter = self.counter.wrapping_add(1);
        self.counter
    }

    /// Drops any exchanged key so the next handshake starts from the default.
    pub fn reset(&mut self) {
        self.device_id = 0;
        self.key = DEFAULT_KEY;
    }
}

/// Decoded command-channel packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw command code; replies use codes outside [`CommandType`]'s request set
    pub command: u16,
    pub device_type: DeviceTypeCode,
    pub counter: u16,
    pub mac: MacAddress,
    pub device_id: u32,
    /// Non-zero when the device rejected the request
    pub error_code: u16,
    /// Decrypted payload (padding stripped when the length is known)
    pub payload: Vec<u8>,
}

/// Additive 16-bit checksum seeded with [`CHECKSUM_SEED`].
pub fn checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(CHECKSUM_SEED, |acc, &b| acc.wrapping_add(b as u16))
}

fn packet_checksum(packet: &[u8]) -> u16 {
    checksum(&packet[..OFF_CHECKSUM]).wrapping_add(
        packet[OFF_CHECKSUM + 2..]
            .iter()
            .fold(0u16, |acc, &b| acc.wrapping_add(b as u16)),
    )
}

/// Stateless packet codec for one device model.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    device_type: DeviceTypeCode,
}

impl Codec {
    pub fn new(device_type: DeviceTypeCode) -> Self {
        Self { device_type }
    }

    /// Pack a command into a wire packet using the current credentials.
    ///
    /// The caller owns counter discipline: the packet carries
    /// `credentials.counter` as-is.
    pub fn encode(
        &self,
        command: CommandType,
        payload: &[u8],
        credentials: &SessionCredentials,
    ) -> Result<Vec<u8>> {
        let payload_len = u16::try_from(payload.len()).map_err(|_| {
            BroadlinkError::InvalidArgument(format!("payload of {} bytes", payload.len()))
        })?;

        let mut packet = vec![0u8; HEADER_LEN];
        packet[..MAGIC.len()].copy_from_slice(&MAGIC);
        LittleEndian::write_u16(&mut packet[OFF_PAYLOAD_LEN..], payload_len);
        LittleEndian::write_u16(&mut packet[OFF_DEVTYPE..], self.device_type.0);
        LittleEndian::write_u16(&mut packet[OFF_COMMAND..], command.code());
        LittleEndian::write_u16(&mut packet[OFF_COUNTER..], credentials.counter);
        packet[OFF_MAC..OFF_MAC + 6].copy_from_slice(&credentials.mac.to_wire());
        LittleEndian::write_u32(&mut packet[OFF_DEVICE_ID..], credentials.device_id);
        LittleEndian::write_u16(&mut packet[OFF_PAYLOAD_CHECKSUM..], checksum(payload));

        if command.requires_encryption() {
            let cipher = BroadlinkCipher::new(&credentials.key)?;
            packet.extend_from_slice(&cipher.encrypt(payload));
        } else {
            packet.extend_from_slice(payload);
        }

        let sum = packet_checksum(&packet);
        LittleEndian::write_u16(&mut packet[OFF_CHECKSUM..], sum);
        Ok(packet)
    }

    /// Unpack a wire packet, verifying its checksum and decrypting the payload.
    pub fn decode(&self, data: &[u8], credentials: &SessionCredentials) -> Result<Packet> {
        if data.len() < HEADER_LEN {
            return Err(BroadlinkError::InvalidPacket(format!(
                "packet of {} bytes is shorter than the header",
                data.len()
            )));
        }
        if data[..MAGIC.len()] != MAGIC {
            return Err(BroadlinkError::InvalidPacket("missing magic".into()));
        }

        let nominal = LittleEndian::read_u16(&data[OFF_CHECKSUM..]);
        if nominal != packet_checksum(data) {
            return Err(BroadlinkError::ChecksumMismatch);
        }

        let command = LittleEndian::read_u16(&data[OFF_COMMAND..]);
        let declared_len = LittleEndian::read_u16(&data[OFF_PAYLOAD_LEN..]) as usize;
        let body = &data[HEADER_LEN..];

        let encrypted = CommandType::from_u16(command)
            .map(CommandType::requires_encryption)
            .unwrap_or(true);
        let mut payload = if encrypted && !body.is_empty() {
            BroadlinkCipher::new(&credentials.key)?.decrypt(body)?
        } else {
            body.to_vec()
        };

        if declared_len > 0 {
            if declared_len > payload.len() {
                return Err(BroadlinkError::InvalidPacket(format!(
                    "declared payload length {} exceeds body of {} bytes",
                    declared_len,
                    payload.len()
                )));
            }
            payload.truncate(declared_len);
            // Garbage from a stale key will not sum to the sender's checksum.
            if checksum(&payload) != LittleEndian::read_u16(&data[OFF_PAYLOAD_CHECKSUM..]) {
                return Err(BroadlinkError::AuthFailure);
            }
        }

        Ok(Packet {
            command,
            device_type: DeviceTypeCode(LittleEndian::read_u16(&data[OFF_DEVTYPE..])),
            counter: LittleEndian::read_u16(&data[OFF_COUNTER..]),
            mac: MacAddress::from_wire(&data[OFF_MAC..OFF_MAC + 6])?,
            device_id: LittleEndian::read_u32(&data[OFF_DEVICE_ID..]),
            error_code: LittleEndian::read_u16(&data[OFF_ERROR..]),
            payload,
        })
    }
}

/// Wall-clock fields stamped into a discovery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloClock {
    /// Offset from UTC in whole hours
    pub timezone: i32,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    /// 1 = Monday .. 7 = Sunday
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
}

impl HelloClock {
    /// Current local time and offset of the host.
    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    pub fn from_datetime<Tz: TimeZone>(at: &DateTime<Tz>) -> Self {
        Self {
            timezone: at.offset().fix().local_minus_utc() / 3600,
            year: at.year() as u16,
            month: at.month() as u8,
            day: at.day() as u8,
            weekday: at.weekday().number_from_monday() as u8,
            hour: at.hour() as u8,
            minute: at.minute() as u8,
        }
    }
}

/// Build the clear-text discovery request.
///
/// `session` is echoed back implicitly through the reply's destination port,
/// so callers put the local port of the receiving socket here.
pub fn encode_hello(local_ip: Ipv4Addr, session: u16, clock: HelloClock) -> Vec<u8> {
    let mut packet = vec![0u8; DISCOVERY_LEN];
    LittleEndian::write_i32(&mut packet[OFF_HELLO_TZ..], clock.timezone);
    LittleEndian::write_u16(&mut packet[OFF_HELLO_YEAR..], clock.year);
    packet[0x0e] = clock.minute;
    packet[0x0f] = clock.hour;
    packet[0x10] = (clock.year % 100) as u8;
    packet[0x11] = clock.weekday;
    packet[0x12] = clock.day;
    packet[0x13] = clock.month;

    let mut ip = local_ip.octets();
    ip.reverse();
    packet[OFF_HELLO_IP..OFF_HELLO_IP + 4].copy_from_slice(&ip);
    LittleEndian::write_u16(&mut packet[OFF_HELLO_PORT..], session);
    LittleEndian::write_u16(&mut packet[OFF_COMMAND..], CommandType::Hello.code());

    let sum = checksum(&packet);
    LittleEndian::write_u16(&mut packet[OFF_CHECKSUM..], sum);
    packet
}

/// Identity fields announced by a device in its discovery reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloReply {
    pub device_type: DeviceTypeCode,
    pub mac: MacAddress,
    pub name: Option<String>,
    pub is_locked: bool,
}

/// Parse a discovery reply.
pub fn decode_hello_reply(data: &[u8]) -> Result<HelloReply> {
    if data.len() < DISCOVERY_REPLY_MIN_LEN {
        return Err(BroadlinkError::InvalidPacket(format!(
            "discovery reply of {} bytes",
            data.len()
        )));
    }

    let nominal = LittleEndian::read_u16(&data[OFF_CHECKSUM..]);
    if nominal != packet_checksum(data) {
        return Err(BroadlinkError::ChecksumMismatch);
    }

    let name = data.get(OFF_REPLY_NAME..REPLY_NAME_END.min(data.len())).and_then(|raw| {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let s = String::from_utf8_lossy(&raw[..end]).trim().to_string();
        (!s.is_empty()).then_some(s)
    });

    Ok(HelloReply {
        device_type: DeviceTypeCode(LittleEndian::read_u16(&data[OFF_REPLY_DEVTYPE..])),
        mac: MacAddress::from_wire(&data[OFF_REPLY_MAC..OFF_REPLY_MAC + 6])?,
        name,
        is_locked: data.get(OFF_REPLY_LOCK).is_some_and(|&b| b != 0),
    })
}

/// Build a discovery reply as a device would send it.
#[doc(hidden)]
pub fn encode_hello_reply(reply: &HelloReply) -> Vec<u8> {
    let mut packet = vec![0u8; 0x80];
    LittleEndian::write_u16(&mut packet[OFF_COMMAND..], CommandType::HelloReply.code());
    LittleEndian::write_u16(&mut packet[OFF_REPLY_DEVTYPE..], reply.device_type.0);
    packet[OFF_REPLY_MAC..OFF_REPLY_MAC + 6].copy_from_slice(&reply.mac.to_wire());
    if let Some(name) = &reply.name {
        let bytes = name.as_bytes();
        let n = bytes.len().min(REPLY_NAME_END - OFF_REPLY_NAME - 1);
        packet[OFF_REPLY_NAME..OFF_REPLY_NAME + n].copy_from_slice(&bytes[..n]);
    }
    packet[OFF_REPLY_LOCK] = reply.is_locked as u8;

    let sum = checksum(&packet);
    LittleEndian::write_u16(&mut packet[OFF_CHECKSUM..], sum);
    packet
}

/// Reads the raw command code of a packet without validating it.
#[doc(hidden)]
pub fn peek_command(data: &[u8]) -> Option<u16> {
    (data.len() >= OFF_COMMAND + 2).then(|| LittleEndian::read_u16(&data[OFF_COMMAND..]))
}

/// Reads the clear-text counter of a command-channel packet.
pub fn peek_counter(data: &[u8]) -> Option<u16> {
    (data.len() >= HEADER_LEN).then(|| LittleEndian::read_u16(&data[OFF_COUNTER..]))
}

/// Build a command-channel reply as a device would send it.
///
/// Devices do not fill in the payload length field; `declare_len` lets tests
/// produce both shapes.
#[doc(hidden)]
pub fn encode_device_reply(
    request: &Packet,
    error_code: u16,
    payload: &[u8],
    key: &[u8; 16],
    declare_len: bool,
) -> Result<Vec<u8>> {
    let reply_command = match CommandType::from_u16(request.command) {
        Some(CommandType::Auth) => CommandType::AuthReply,
        _ => CommandType::CommandReply,
    };
    let credentials = SessionCredentials {
        mac: request.mac,
        device_id: request.device_id,
        key: *key,
        counter: request.counter,
    };
    let mut packet = Codec::new(request.device_type).encode(reply_command, payload, &credentials)?;
    if !declare_len {
        LittleEndian::write_u16(&mut packet[OFF_PAYLOAD_LEN..], 0);
    }
    LittleEndian::write_u16(&mut packet[OFF_ERROR..], error_code);
    let sum = packet_checksum(&packet);
    LittleEndian::write_u16(&mut packet[OFF_CHECKSUM..], sum);
    Ok(packet)
}
