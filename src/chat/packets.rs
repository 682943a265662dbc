//! Chat packets.
//!
//! | Opcode | Direction | Packet     | Payload                          |
//! |--------|-----------|------------|----------------------------------|
//! | 0x01   | C -> S    | Login      | name (30 bytes, NUL padded)      |
//! | 0x02   | C -> S    | Say        | text (i32 length + UTF-8)        |
//! | 0x03   | C -> S    | Ping       | u32 token                        |
//! | 0x73   | C -> S    | KeepAlive  | u8 sequence, never handled       |
//! | 0x81   | S -> C    | Welcome    | u32 connection id, u16 members   |
//! | 0x82   | S -> C    | Message    | from (30 bytes) + text           |
//! | 0x83   | S -> C    | Joined     | name (30 bytes)                  |
//! | 0x84   | S -> C    | Left       | name (30 bytes)                  |
//! | 0x85   | S -> C    | Pong       | u32 token                        |

use super::{ChatProtocol, ChatState, ChatWorld, Member};
use crate::connection::Connection;
use crate::engine::HandlerError;
use crate::group::{GroupKind, PacketGroup};
use crate::protocol::{
    CodecError, IncomingPacket, OutgoingPacket, PacketReader, PacketWriter, ReadPacketResult,
};
use anyhow::anyhow;
use std::sync::Arc;
use tracing::{debug, info};

/// Fixed width of a name on the wire.
pub const NAME_LEN: usize = 30;

/// Longest accepted chat line.
pub const MAX_TEXT_LEN: usize = 512;

type ChatConn = Arc<Connection<ChatProtocol>>;

// Client to server

#[derive(Debug, Default)]
pub struct Login {
    name: String,
}

impl IncomingPacket<ChatProtocol> for Login {
    fn name(&self) -> &'static str {
        "Login"
    }

    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        self.name = reader.read_ascii(NAME_LEN)?.trim().to_string();
        Ok(ReadPacketResult::Success)
    }

    fn handle(
        self: Box<Self>,
        conn: &ChatConn,
        state: &mut ChatState,
        world: &mut ChatWorld,
    ) -> Result<(), HandlerError> {
        if state.name.is_some() {
            return Err(anyhow!("already logged in").into());
        }
        if self.name.is_empty() || world.is_taken(&self.name) {
            conn.close(format!("Name {:?} is not available", self.name));
            return Ok(());
        }

        info!(conn = %conn.id(), name = %self.name, "Member joined");
        world.broadcast(Joined {
            name: self.name.clone(),
        });
        world.members.insert(
            conn.id(),
            Member {
                name: self.name.clone(),
                conn: Arc::downgrade(conn),
            },
        );
        state.name = Some(self.name);

        conn.set_packet_groups_joining(true);
        conn.send_single_packet(Welcome {
            id: conn.id().as_u64() as u32,
            members: world.members.len() as u16,
        })
        .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Say {
    text: String,
}

impl IncomingPacket<ChatProtocol> for Say {
    fn name(&self) -> &'static str {
        "Say"
    }

    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        let text = reader.read_utf8_prefixed()?;
        if text.len() > MAX_TEXT_LEN {
            return Ok(ReadPacketResult::DiscardSingle);
        }
        self.text = text;
        Ok(ReadPacketResult::Success)
    }

    fn handle(
        self: Box<Self>,
        _conn: &ChatConn,
        state: &mut ChatState,
        world: &mut ChatWorld,
    ) -> Result<(), HandlerError> {
        let Some(from) = state.name.clone() else {
            return Err(anyhow!("not logged in").into());
        };
        debug!(from = %from, bytes = self.text.len(), "Chat message");
        world.broadcast(Message {
            from,
            text: self.text,
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Ping {
    token: u32,
}

impl IncomingPacket<ChatProtocol> for Ping {
    fn name(&self) -> &'static str {
        "Ping"
    }

    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        self.token = reader.read_u32()?;
        Ok(ReadPacketResult::Success)
    }

    fn handle(
        self: Box<Self>,
        conn: &ChatConn,
        _state: &mut ChatState,
        _world: &mut ChatWorld,
    ) -> Result<(), HandlerError> {
        conn.send_single_packet(Pong { token: self.token })
            .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct KeepAlive;

impl IncomingPacket<ChatProtocol> for KeepAlive {
    fn name(&self) -> &'static str {
        "KeepAlive"
    }

    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        reader.read_u8()?;
        Ok(ReadPacketResult::Success)
    }

    fn handle(
        self: Box<Self>,
        _conn: &ChatConn,
        _state: &mut ChatState,
        _world: &mut ChatWorld,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

// Server to client

#[derive(Debug, Clone)]
pub struct Welcome {
    pub id: u32,
    pub members: u16,
}

impl OutgoingPacket for Welcome {
    fn id(&self) -> u8 {
        0x81
    }

    fn name(&self) -> &'static str {
        "Welcome"
    }

    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<(), CodecError> {
        writer.write_u32(self.id)?;
        writer.write_u16(self.members)
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub from: String,
    pub text: String,
}

impl OutgoingPacket for Message {
    fn id(&self) -> u8 {
        0x82
    }

    fn name(&self) -> &'static str {
        "Message"
    }

    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<(), CodecError> {
        writer.write_ascii_fixed(&self.from, NAME_LEN)?;
        writer.write_utf8_prefixed(&self.text)
    }
}

#[derive(Debug, Clone)]
pub struct Joined {
    pub name: String,
}

impl OutgoingPacket for Joined {
    fn id(&self) -> u8 {
        0x83
    }

    fn name(&self) -> &'static str {
        "Joined"
    }

    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<(), CodecError> {
        writer.write_ascii_fixed(&self.name, NAME_LEN)
    }
}

#[derive(Debug, Clone)]
pub struct Left {
    pub name: String,
}

impl OutgoingPacket for Left {
    fn id(&self) -> u8 {
        0x84
    }

    fn name(&self) -> &'static str {
        "Left"
    }

    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<(), CodecError> {
        writer.write_ascii_fixed(&self.name, NAME_LEN)
    }
}

#[derive(Debug, Clone)]
pub struct Pong {
    pub token: u32,
}

impl OutgoingPacket for Pong {
    fn id(&self) -> u8 {
        0x85
    }

    fn name(&self) -> &'static str {
        "Pong"
    }

    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<(), CodecError> {
        writer.write_u32(self.token)
    }
}

/// Wraps `packet` in a Free group for broadcasting.
pub(super) fn broadcast_group(packet: impl OutgoingPacket + 'static) -> Arc<PacketGroup> {
    let group = PacketGroup::new(GroupKind::Free);
    group.add_packet(packet);
    group
}
