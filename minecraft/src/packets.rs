use minecraft_macros::{PacketDeserializer, PacketSerializer};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::buffer::Buffer;
use crate::serialization::FieldWriter;

use super::serialization::{MinecraftStream, ReadingError};

/// Packet ids for the handshake/status/login phases. Both the handshake and
/// the status request/response reuse id 0x00, the ping/pong pair is 0x01, and
/// the login-phase disconnect is 0x00 again.
pub const HANDSHAKE_PACKET_ID: i32 = 0x00;
pub const STATUS_REQUEST_PACKET_ID: i32 = 0x00;
pub const STATUS_RESPONSE_PACKET_ID: i32 = 0x00;
pub const PING_PACKET_ID: i32 = 0x01;
pub const LOGIN_DISCONNECT_PACKET_ID: i32 = 0x00;

pub const NEXT_STATE_STATUS: i32 = 1;
pub const NEXT_STATE_LOGIN: i32 = 2;
pub const NEXT_STATE_TRANSFER: i32 = 3;

pub trait PacketDeserializer {
    fn from_raw<RW>(stream: &mut MinecraftStream<RW>) -> Result<Self, ReadingError>
    where
        Self : Sized,
        RW : AsyncRead + AsyncWrite + Unpin;
}

pub trait PacketSerializer {
    fn to_raw(&self, stream: &mut Buffer) -> Option<()> where Self : Sized;
}

pub struct MinecraftPacket {
}

impl MinecraftPacket {
    pub fn make_raw<T>(id: i32, packet: &T) -> Option<Vec<u8>> where T: PacketSerializer {
        let mut data_buffer = Buffer::new(1024);
        T::to_raw(packet, &mut data_buffer)?;
        let mut packet_id_buffer = Buffer::new(5);
        id.write(&mut packet_id_buffer);
        let mut packet_length_buffer = Buffer::new(5);

        let d2 = packet_id_buffer.take();
        let d3 = data_buffer.take();
        (d2.len() as i32 + d3.len() as i32).write(&mut packet_length_buffer);

        let d1 = packet_length_buffer.take();
        let array = [d1, d2, d3].concat();
        Some(array)
    }
}

#[derive(PacketDeserializer, PacketSerializer)]
pub struct HandshakeC2SPacket {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32
}

#[derive(PacketSerializer)]
pub struct LoginStartC2SPacket {
    pub name: String,
    pub player_uuid: Uuid
}

/// The uuid trailer changed shape across protocol revisions (1.19 prefixes it
/// with a presence flag, 1.20.2+ sends it bare, older versions omit it), so
/// only the name is read strictly.
impl PacketDeserializer for LoginStartC2SPacket {
    fn from_raw<RW: AsyncRead + AsyncWrite + Unpin>(stream: &mut MinecraftStream<RW>) -> Result<Self, ReadingError> {
        let name = stream.read_field::<String>()?;
        let player_uuid = stream.read_field::<Uuid>().unwrap_or_else(|_| Uuid::nil());
        Ok(LoginStartC2SPacket { name, player_uuid })
    }
}

#[derive(PacketDeserializer, PacketSerializer)]
pub struct StatusRequestC2SPacket {
}

#[derive(PacketDeserializer, PacketSerializer)]
pub struct StatusResponseS2CPacket {
    /// Status JSON, see [`crate::status::StatusResponse`].
    pub payload: String
}

/// Ping and pong carry the same 8-byte payload in both directions; the server
/// echoes whatever the client sent.
#[derive(PacketDeserializer, PacketSerializer)]
pub struct PingPacket {
    pub payload: i64
}

#[derive(PacketSerializer)]
pub struct LoginDisconnectS2CPacket {
    /// JSON chat component, e.g. `{"text":"..."}`.
    pub reason: String
}
