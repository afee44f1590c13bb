//! The RakNet offline message subset used by Bedrock Edition before a session
//! exists: status pings and the open-connection handshake. Connected RakNet
//! (reliability layers, fragmentation) is out of scope; those datagrams are
//! relayed opaquely.

/// Offline messages embed this 16-byte marker so stray UDP traffic can be
/// told apart from RakNet.
pub const OFFLINE_MESSAGE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe,
    0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

pub const ID_UNCONNECTED_PING: u8 = 0x01;
pub const ID_OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
pub const ID_OPEN_CONNECTION_REPLY_1: u8 = 0x06;
pub const ID_OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
pub const ID_OPEN_CONNECTION_REPLY_2: u8 = 0x08;
pub const ID_UNCONNECTED_PONG: u8 = 0x1c;

/// `0x01 | time u64 | magic | client guid u64`
#[derive(Debug, PartialEq, Eq)]
pub struct UnconnectedPing {
    pub time: u64,
    pub client_guid: u64,
}

/// `0x1c | time u64 | server guid u64 | magic | u16 len | payload`
#[derive(Debug, PartialEq, Eq)]
pub struct UnconnectedPong {
    pub time: u64,
    pub server_guid: u64,
    pub payload: Vec<u8>,
}

/// Offset of the magic within an offline message, per message id. Datagrams
/// with ids outside the offline set have no magic and return None.
fn magic_offset(id: u8) -> Option<usize> {
    match id {
        ID_UNCONNECTED_PING => Some(9),
        ID_UNCONNECTED_PONG => Some(17),
        ID_OPEN_CONNECTION_REQUEST_1 => Some(1),
        ID_OPEN_CONNECTION_REPLY_1 => Some(1),
        ID_OPEN_CONNECTION_REQUEST_2 => Some(1),
        ID_OPEN_CONNECTION_REPLY_2 => Some(1),
        _ => None,
    }
}

/// True when the datagram is a well-formed offline message: a known id with
/// the magic at the id's expected offset.
pub fn is_offline_message(datagram: &[u8]) -> bool {
    let Some(&id) = datagram.first() else {
        return false;
    };
    let Some(offset) = magic_offset(id) else {
        return false;
    };
    datagram.len() >= offset + OFFLINE_MESSAGE_MAGIC.len()
        && datagram[offset..offset + OFFLINE_MESSAGE_MAGIC.len()] == OFFLINE_MESSAGE_MAGIC
}

pub fn parse_unconnected_ping(datagram: &[u8]) -> Option<UnconnectedPing> {
    if datagram.len() < 33 || datagram[0] != ID_UNCONNECTED_PING || !is_offline_message(datagram) {
        return None;
    }
    Some(UnconnectedPing {
        time: u64::from_be_bytes(datagram[1..9].try_into().ok()?),
        client_guid: u64::from_be_bytes(datagram[25..33].try_into().ok()?),
    })
}

pub fn parse_unconnected_pong(datagram: &[u8]) -> Option<UnconnectedPong> {
    if datagram.len() < 35 || datagram[0] != ID_UNCONNECTED_PONG || !is_offline_message(datagram) {
        return None;
    }
    let payload_len = u16::from_be_bytes(datagram[33..35].try_into().ok()?) as usize;
    if datagram.len() < 35 + payload_len {
        return None;
    }
    Some(UnconnectedPong {
        time: u64::from_be_bytes(datagram[1..9].try_into().ok()?),
        server_guid: u64::from_be_bytes(datagram[9..17].try_into().ok()?),
        payload: datagram[35..35 + payload_len].to_vec(),
    })
}

pub fn build_unconnected_ping(time: u64, client_guid: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(33);
    out.push(ID_UNCONNECTED_PING);
    out.extend_from_slice(&time.to_be_bytes());
    out.extend_from_slice(&OFFLINE_MESSAGE_MAGIC);
    out.extend_from_slice(&client_guid.to_be_bytes());
    out
}

pub fn build_unconnected_pong(time: u64, server_guid: u64, payload: &str) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let mut out = Vec::with_capacity(35 + bytes.len());
    out.push(ID_UNCONNECTED_PONG);
    out.extend_from_slice(&time.to_be_bytes());
    out.extend_from_slice(&server_guid.to_be_bytes());
    out.extend_from_slice(&OFFLINE_MESSAGE_MAGIC);
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

/// The semicolon-separated server description inside an Unconnected Pong.
/// Field order is fixed: edition, MOTD, protocol, version, online, max, guid,
/// level name, gamemode, gamemode id, and the port twice (IPv4 and IPv6).
pub fn motd_payload(
    motd: &str,
    protocol: i32,
    version_name: &str,
    online: u32,
    max: u32,
    server_guid: u64,
    level_name: &str,
    port: u16,
) -> String {
    format!(
        "MCPE;{};{};{};{};{};{};{};Survival;1;{};{};",
        sanitize(motd),
        protocol,
        version_name,
        online,
        max,
        server_guid,
        sanitize(level_name),
        port,
        port,
    )
}

/// Semicolons are the field separator, so they cannot appear inside fields.
fn sanitize(value: &str) -> String {
    value.replace(';', ":")
}
