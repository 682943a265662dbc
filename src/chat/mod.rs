//! Chat Protocol
//!
//! A small chat server protocol built on the engine, used by the `shardlink`
//! binary. Members log in with a name, then everything they say is broadcast
//! to every member with one Free packet group.
//!
//! ## Session
//!
//! ```text
//! client                                  server
//!   │ seed (4 bytes, 0 = plain)             │  encryption handshake
//!   │──────────────────────────────────────>│
//!   │ Login "alice"                         │
//!   │──────────────────────────────────────>│  Joined "alice" to others
//!   │                      Welcome id, n    │  joining enabled
//!   │<──────────────────────────────────────│
//!   │ Say "hi"                              │
//!   │──────────────────────────────────────>│  Message to everyone
//!   │                   Message alice: hi   │
//!   │<──────────────────────────────────────│
//! ```

pub mod cipher;
pub mod packets;

pub use cipher::SeededXor;
pub use packets::{Joined, Left, Login, Message, Ping, Pong, Say, Welcome};

use crate::connection::{Connection, ConnectionId};
use crate::protocol::{ConnectionState, Encryption, PacketDecoder, Protocol, Strategies};
use packets::{broadcast_group, KeepAlive};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// The chat protocol.
#[derive(Debug, Clone, Default)]
pub struct ChatProtocol {
    /// Expect the 4-byte seed handshake from every client
    pub encryption: bool,
}

/// Per-connection chat state.
#[derive(Debug, Default)]
pub struct ChatState {
    /// Set once the client logged in
    pub name: Option<String>,
    cipher: Option<SeededXor>,
}

impl ConnectionState for ChatState {
    fn strategies(&mut self) -> Strategies<'_> {
        Strategies {
            encryption: self.cipher.as_mut().map(|c| c as &mut dyn Encryption),
            compression: None,
        }
    }
}

#[derive(Debug)]
pub struct Member {
    pub name: String,
    pub conn: Weak<Connection<ChatProtocol>>,
}

/// Everyone who is logged in.
#[derive(Debug, Default)]
pub struct ChatWorld {
    pub members: HashMap<ConnectionId, Member>,
}

impl ChatWorld {
    pub fn is_taken(&self, name: &str) -> bool {
        self.members
            .values()
            .any(|member| member.name.eq_ignore_ascii_case(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.members.values().map(|m| m.name.clone()).collect();
        names.sort();
        names
    }

    /// Sends `packet` to every member, serialized once.
    pub fn broadcast(&self, packet: impl crate::protocol::OutgoingPacket + 'static) {
        let group = broadcast_group(packet);
        let mut sent = 0;
        for member in self.members.values() {
            let Some(conn) = member.conn.upgrade() else {
                continue;
            };
            if conn.send_packet_group(Arc::clone(&group)).is_ok() {
                sent += 1;
            }
        }
        debug!(recipients = sent, "Broadcast packet group");
    }
}

impl Protocol for ChatProtocol {
    type State = ChatState;
    type World = ChatWorld;

    fn init_state(&self, _id: ConnectionId, _endpoint: Option<SocketAddr>) -> ChatState {
        ChatState {
            name: None,
            cipher: self.encryption.then(SeededXor::new),
        }
    }

    fn decoder(
        &self,
        opcode: u8,
        _conn: &Arc<Connection<Self>>,
        _state: &ChatState,
    ) -> Option<PacketDecoder<Self>> {
        match opcode {
            0x01 => Some(PacketDecoder::handle(Box::<Login>::default())),
            0x02 => Some(PacketDecoder::handle(Box::<Say>::default())),
            0x03 => Some(PacketDecoder::handle(Box::<Ping>::default())),
            0x73 => Some(PacketDecoder::discard(Box::new(KeepAlive))),
            _ => None,
        }
    }

    fn on_close(
        &self,
        conn: &Arc<Connection<Self>>,
        state: &mut ChatState,
        world: &mut ChatWorld,
        reason: &str,
    ) {
        let Some(name) = state.name.take() else {
            return;
        };
        world.members.remove(&conn.id());
        info!(conn = %conn.id(), name = %name, reason = %reason, "Member left");
        world.broadcast(Left { name });
    }
}

#[cfg(test)]
mod tests {
    use super::packets::NAME_LEN;
    use super::*;
    use crate::buffer::BufferPool;
    use crate::connection::handle_connection;
    use crate::engine::{ConnectionEngine, EngineConfig};
    use crate::lock;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    type Engine = Arc<ConnectionEngine<ChatProtocol>>;

    fn start(encryption: bool) -> (Engine, Arc<Mutex<ChatWorld>>) {
        let world = Arc::new(Mutex::new(ChatWorld::default()));
        let config = EngineConfig {
            join_flush_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let engine = ConnectionEngine::start_with_pool(
            ChatProtocol { encryption },
            Arc::clone(&world),
            config,
            BufferPool::new(),
        );
        (engine, world)
    }

    fn connect(engine: &Engine) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let conn = Connection::open(engine, writer, None);
        tokio::spawn(handle_connection(conn, reader));
        client
    }

    fn login_frame(name: &str) -> Vec<u8> {
        let mut frame = vec![0x01];
        frame.extend(name.as_bytes());
        frame.resize(1 + NAME_LEN, 0);
        frame
    }

    fn say_frame(text: &str) -> Vec<u8> {
        let mut frame = vec![0x02];
        frame.extend((text.len() as i32).to_be_bytes());
        frame.extend(text.as_bytes());
        frame
    }

    fn name_field(name: &str) -> Vec<u8> {
        let mut field = name.as_bytes().to_vec();
        field.resize(NAME_LEN, 0);
        field
    }

    async fn read(client: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_login_and_broadcast() {
        let (engine, world) = start(false);
        let mut alice = connect(&engine);
        let mut bob = connect(&engine);

        alice.write_all(&login_frame("alice")).await.unwrap();
        let welcome = read(&mut alice, 7).await;
        assert_eq!(welcome[0], 0x81);
        assert_eq!(&welcome[5..], &[0, 1]);

        bob.write_all(&login_frame("bob")).await.unwrap();
        let welcome = read(&mut bob, 7).await;
        assert_eq!(&welcome[5..], &[0, 2]);

        let mut joined = vec![0x83];
        joined.extend(name_field("bob"));
        assert_eq!(read(&mut alice, 31).await, joined);

        alice.write_all(&say_frame("hi")).await.unwrap();
        let mut message = vec![0x82];
        message.extend(name_field("alice"));
        message.extend(2i32.to_be_bytes());
        message.extend(b"hi");
        assert_eq!(read(&mut alice, message.len()).await, message);
        assert_eq!(read(&mut bob, message.len()).await, message);

        assert_eq!(lock(&world).names(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_leaving_member_is_announced() {
        let (engine, world) = start(false);
        let mut alice = connect(&engine);
        let mut bob = connect(&engine);

        alice.write_all(&login_frame("alice")).await.unwrap();
        read(&mut alice, 7).await;
        bob.write_all(&login_frame("bob")).await.unwrap();
        read(&mut bob, 7).await;
        read(&mut alice, 31).await;

        drop(bob);
        let mut left = vec![0x84];
        left.extend(name_field("bob"));
        assert_eq!(read(&mut alice, 31).await, left);
        assert_eq!(lock(&world).names(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_taken_name_closes_connection() {
        let (engine, _world) = start(false);
        let mut alice = connect(&engine);
        let mut impostor = connect(&engine);

        alice.write_all(&login_frame("alice")).await.unwrap();
        read(&mut alice, 7).await;

        impostor.write_all(&login_frame("ALICE")).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), impostor.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_encrypted_ping() {
        let (engine, _world) = start(true);
        let mut client = connect(&engine);
        let seed: u32 = 0x0BAD_F00D;
        let mut cipher = SeededXor::client(seed);

        let plain = [0x03, 0, 0, 0, 0x2A];
        let mut wire = [0u8; 5];
        cipher.encrypt(&plain, &mut wire).unwrap();
        let mut data = seed.to_be_bytes().to_vec();
        data.extend(wire);
        client.write_all(&data).await.unwrap();

        let reply = read(&mut client, 5).await;
        let mut pong = [0u8; 5];
        cipher.decrypt(&reply, &mut pong).unwrap();
        assert_eq!(pong, [0x85, 0, 0, 0, 0x2A]);
    }

    #[tokio::test]
    async fn test_say_before_login_is_ignored() {
        let (engine, world) = start(false);
        let mut client = connect(&engine);

        client.write_all(&say_frame("hello?")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            engine
                .stats()
                .handler_faults
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert!(lock(&world).members.is_empty());
    }
}
