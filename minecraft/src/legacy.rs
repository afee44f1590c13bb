//! Pre-1.7 server list ping.
//!
//! Clients from the 1.4-1.6 era open a connection and send a single 0xFE byte
//! (1.6 appends 0x01 and a plugin-message tail). The server answers with a
//! 0xFF "kick" whose payload is a UTF-16BE string of null-separated fields:
//! `§1`, protocol, version name, MOTD, online count, max count.

/// First byte of a legacy ping.
pub const LEGACY_PING_ID: u8 = 0xFE;

const LEGACY_KICK_ID: u8 = 0xFF;

/// Protocol number advertised in the legacy reply. 1.6.4 clients compare it
/// against their own and show "out of date" either way, which is accurate for
/// a server they cannot join before waking it.
const LEGACY_PROTOCOL: &str = "127";

pub fn build_legacy_kick(version_name: &str, motd: &str, online: u32, max: u32) -> Vec<u8> {
    let online = online.to_string();
    let max = max.to_string();
    let fields = ["\u{a7}1", LEGACY_PROTOCOL, version_name, motd, &online, &max];
    let payload = fields.join("\0");

    let units: Vec<u16> = payload.encode_utf16().collect();
    let mut out = Vec::with_capacity(3 + units.len() * 2);
    out.push(LEGACY_KICK_ID);
    out.extend_from_slice(&(units.len() as u16).to_be_bytes());
    for unit in units {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}
