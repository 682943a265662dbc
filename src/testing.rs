//! Fixtures shared by the unit tests: a small protocol with one opcode per
//! pipeline behavior, toy strategies and helpers to wire connections to an
//! in-memory transport.

use crate::buffer::{BufferPool, BUFFER_LEN};
use crate::connection::{Connection, ConnectionError, ConnectionId, ReceivePipeline};
use crate::engine::{ConnectionEngine, EngineConfig, HandlerError};
use crate::protocol::{
    CodecError, Compression, ConnectionState, Encryption, EncryptionInitResult, IncomingPacket,
    OutgoingPacket, PacketDecoder, PacketReader, PacketWriter, Protocol, ReadPacketResult,
    Strategies, StrategyError,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf};

// Outgoing packets

/// Opcode 0x01 carrying a u32.
pub(crate) struct TestValue(pub u32);

impl OutgoingPacket for TestValue {
    fn id(&self) -> u8 {
        0x01
    }

    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<(), CodecError> {
        writer.write_u32(self.0)
    }
}

/// Opcode plus u32 length plus filler, `len` bytes in total.
pub(crate) struct Blob {
    id: u8,
    len: usize,
}

impl Blob {
    pub(crate) fn new(id: u8, len: usize) -> Self {
        Self { id, len }
    }
}

impl OutgoingPacket for Blob {
    fn id(&self) -> u8 {
        self.id
    }

    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<(), CodecError> {
        let payload = self.len.saturating_sub(5);
        writer.write_u32(payload as u32)?;
        writer.write_zeros(payload)
    }
}

pub(crate) fn frame_value(value: u32) -> Vec<u8> {
    let mut frame = vec![0x01];
    frame.extend(value.to_be_bytes());
    frame
}

pub(crate) fn text_frame(text: &str) -> Vec<u8> {
    let mut frame = vec![0x02];
    frame.extend((text.len() as i32).to_be_bytes());
    frame.extend(text.as_bytes());
    frame
}

pub(crate) fn blob_frame(len: usize) -> Vec<u8> {
    let payload = len - 5;
    let mut frame = vec![0x09];
    frame.extend((payload as u32).to_be_bytes());
    frame.resize(len, 0xEE);
    frame
}

// Strategies

/// Adds `shift` to every byte and inverts it; counts compress calls.
///
/// With a nonzero shift it does not commute with [`XorEncryption`], so the
/// order of the two stages shows in the bytes.
#[derive(Default)]
pub(crate) struct InvertCompression {
    compress_calls: usize,
    shift: u8,
}

impl InvertCompression {
    pub(crate) fn with_shift(shift: u8) -> Self {
        Self {
            compress_calls: 0,
            shift,
        }
    }

    pub(crate) fn compress_calls(&self) -> usize {
        self.compress_calls
    }

    /// What `compress` turns `byte` into.
    pub(crate) fn compressed_byte(shift: u8, byte: u8) -> u8 {
        !byte.wrapping_add(shift)
    }

    fn apply(
        src: &[u8],
        dst: &mut [u8],
        f: impl Fn(u8) -> u8,
    ) -> Result<usize, StrategyError> {
        if src.len() > dst.len() {
            return Err(StrategyError::OutputTooSmall {
                needed: src.len(),
                available: dst.len(),
            });
        }
        for (d, s) in dst.iter_mut().zip(src) {
            *d = f(*s);
        }
        Ok(src.len())
    }
}

impl Compression for InvertCompression {
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError> {
        self.compress_calls += 1;
        let shift = self.shift;
        Self::apply(src, dst, |b| Self::compressed_byte(shift, b))
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError> {
        let shift = self.shift;
        Self::apply(src, dst, |b| (!b).wrapping_sub(shift))
    }
}

/// XOR cipher keyed by the first handshake byte.
///
/// Seed byte 0x00 means no encryption, 0xFF is an invalid handshake.
pub(crate) struct XorEncryption {
    seed_len: usize,
    key: u8,
}

impl XorEncryption {
    pub(crate) fn with_seed_len(seed_len: usize) -> Self {
        Self { seed_len, key: 0 }
    }

    fn apply(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError> {
        if src.len() > dst.len() {
            return Err(StrategyError::OutputTooSmall {
                needed: src.len(),
                available: dst.len(),
            });
        }
        for (d, s) in dst.iter_mut().zip(src) {
            *d = s ^ self.key;
        }
        Ok(src.len())
    }
}

impl Default for XorEncryption {
    fn default() -> Self {
        Self::with_seed_len(1)
    }
}

impl Encryption for XorEncryption {
    fn init(&mut self, buf: &[u8]) -> (EncryptionInitResult, usize) {
        if buf.len() < self.seed_len {
            return (EncryptionInitResult::NotEnoughData, 0);
        }
        match buf[0] {
            0x00 => (EncryptionInitResult::SuccessNoEncryption, self.seed_len),
            0xFF => (EncryptionInitResult::InvalidData, 0),
            key => {
                self.key = key;
                (EncryptionInitResult::SuccessUseEncryption, self.seed_len)
            }
        }
    }

    fn decrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError> {
        self.apply(src, dst)
    }

    fn encrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError> {
        self.apply(src, dst)
    }
}

// Protocol

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TestEvent {
    Value(ConnectionId, u32),
    Text(ConnectionId, String),
    Blob(ConnectionId, usize),
    Closed(ConnectionId, String),
}

#[derive(Debug, Default)]
pub(crate) struct TestWorld {
    pub(crate) events: Vec<TestEvent>,
}

/// Shift used by [`TestState::with_cipher_and_compression`].
pub(crate) const TEST_SHIFT: u8 = 3;

#[derive(Default)]
pub(crate) struct TestState {
    encryption: Option<XorEncryption>,
    compression: Option<InvertCompression>,
}

impl TestState {
    pub(crate) fn with_encryption() -> Self {
        Self::with_cipher(XorEncryption::default())
    }

    pub(crate) fn with_cipher(cipher: XorEncryption) -> Self {
        Self {
            encryption: Some(cipher),
            compression: None,
        }
    }

    pub(crate) fn with_compression() -> Self {
        Self {
            encryption: None,
            compression: Some(InvertCompression::default()),
        }
    }

    /// One-byte XOR handshake plus [`InvertCompression`] shifting by
    /// [`TEST_SHIFT`].
    pub(crate) fn with_cipher_and_compression() -> Self {
        Self {
            encryption: Some(XorEncryption::default()),
            compression: Some(InvertCompression::with_shift(TEST_SHIFT)),
        }
    }
}

impl ConnectionState for TestState {
    fn strategies(&mut self) -> Strategies<'_> {
        Strategies {
            encryption: self.encryption.as_mut().map(|e| e as &mut dyn Encryption),
            compression: self.compression.as_mut().map(|c| c as &mut dyn Compression),
        }
    }
}

pub(crate) struct TestProtocol {
    make_state: fn() -> TestState,
}

impl Protocol for TestProtocol {
    type State = TestState;
    type World = TestWorld;

    fn init_state(&self, _id: ConnectionId, _endpoint: Option<SocketAddr>) -> TestState {
        (self.make_state)()
    }

    fn decoder(
        &self,
        opcode: u8,
        _conn: &Arc<Connection<Self>>,
        _state: &TestState,
    ) -> Option<PacketDecoder<Self>> {
        let decoder: PacketDecoder<Self> = match opcode {
            0x01 => PacketDecoder::handle(Box::new(ValuePacket(0))),
            0x02 => PacketDecoder::handle(Box::new(TextPacket(String::new()))),
            0x03 => PacketDecoder::handle(Box::new(PingPacket(0))),
            0x04 => PacketDecoder::handle(Box::new(SkipPacket)),
            0x05 => PacketDecoder::handle(Box::new(GarbagePacket)),
            0x06 => PacketDecoder::handle(Box::new(FailingPacket)),
            0x07 => PacketDecoder::handle(Box::new(FatalPacket)),
            0x08 => PacketDecoder::discard(Box::new(ValuePacket(0))),
            0x09 => PacketDecoder::handle(Box::new(BlobPacket(0))),
            0x0A => PacketDecoder::handle(Box::new(OverreachingPacket)),
            _ => return None,
        };
        Some(decoder)
    }

    fn on_close(
        &self,
        conn: &Arc<Connection<Self>>,
        _state: &mut TestState,
        world: &mut TestWorld,
        reason: &str,
    ) {
        world.events.push(TestEvent::Closed(conn.id(), reason.to_string()));
    }
}

type Conn = Arc<Connection<TestProtocol>>;

struct ValuePacket(u32);

impl IncomingPacket<TestProtocol> for ValuePacket {
    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        self.0 = reader.read_u32()?;
        Ok(ReadPacketResult::Success)
    }

    fn handle(
        self: Box<Self>,
        conn: &Conn,
        _state: &mut TestState,
        world: &mut TestWorld,
    ) -> Result<(), HandlerError> {
        world.events.push(TestEvent::Value(conn.id(), self.0));
        Ok(())
    }
}

struct TextPacket(String);

impl IncomingPacket<TestProtocol> for TextPacket {
    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        self.0 = reader.read_utf8_prefixed()?;
        Ok(ReadPacketResult::Success)
    }

    fn handle(
        self: Box<Self>,
        conn: &Conn,
        _state: &mut TestState,
        world: &mut TestWorld,
    ) -> Result<(), HandlerError> {
        world.events.push(TestEvent::Text(conn.id(), self.0));
        Ok(())
    }
}

/// Answers with a [`TestValue`] echoing the payload.
struct PingPacket(u32);

impl IncomingPacket<TestProtocol> for PingPacket {
    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        self.0 = reader.read_u32()?;
        Ok(ReadPacketResult::Success)
    }

    fn handle(
        self: Box<Self>,
        conn: &Conn,
        _state: &mut TestState,
        _world: &mut TestWorld,
    ) -> Result<(), HandlerError> {
        conn.send_single_packet(TestValue(self.0))
            .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

/// One payload byte, never handled.
struct SkipPacket;

impl IncomingPacket<TestProtocol> for SkipPacket {
    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        reader.read_u8()?;
        Ok(ReadPacketResult::DiscardSingle)
    }

    fn handle(
        self: Box<Self>,
        _conn: &Conn,
        _state: &mut TestState,
        _world: &mut TestWorld,
    ) -> Result<(), HandlerError> {
        unreachable!("discarded packets are never handled")
    }
}

struct GarbagePacket;

impl IncomingPacket<TestProtocol> for GarbagePacket {
    fn decode(&mut self, _reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        Err(CodecError::InvalidData("garbage".into()))
    }

    fn handle(
        self: Box<Self>,
        _conn: &Conn,
        _state: &mut TestState,
        _world: &mut TestWorld,
    ) -> Result<(), HandlerError> {
        unreachable!("undecodable packets are never handled")
    }
}

struct FailingPacket;

impl IncomingPacket<TestProtocol> for FailingPacket {
    fn decode(&mut self, _reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        Ok(ReadPacketResult::Success)
    }

    fn handle(
        self: Box<Self>,
        _conn: &Conn,
        _state: &mut TestState,
        _world: &mut TestWorld,
    ) -> Result<(), HandlerError> {
        Err(anyhow::anyhow!("handler failed").into())
    }
}

struct FatalPacket;

impl IncomingPacket<TestProtocol> for FatalPacket {
    fn decode(&mut self, _reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        Ok(ReadPacketResult::Success)
    }

    fn handle(
        self: Box<Self>,
        _conn: &Conn,
        _state: &mut TestState,
        _world: &mut TestWorld,
    ) -> Result<(), HandlerError> {
        Err(HandlerError::fatal("world is corrupted"))
    }
}

/// Claims to have consumed more bytes than it was given.
struct OverreachingPacket;

impl IncomingPacket<TestProtocol> for OverreachingPacket {
    fn decode(&mut self, _reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        Ok(ReadPacketResult::Success)
    }

    fn read(&mut self, buf: &[u8]) -> (ReadPacketResult, usize) {
        (ReadPacketResult::Success, buf.len() + 10)
    }

    fn handle(
        self: Box<Self>,
        _conn: &Conn,
        _state: &mut TestState,
        _world: &mut TestWorld,
    ) -> Result<(), HandlerError> {
        unreachable!("a frame that never completes is never handled")
    }
}

struct BlobPacket(usize);

impl IncomingPacket<TestProtocol> for BlobPacket {
    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError> {
        let len = reader.read_u32()? as usize;
        reader.read_bytes(len)?;
        self.0 = len;
        Ok(ReadPacketResult::Success)
    }

    fn handle(
        self: Box<Self>,
        conn: &Conn,
        _state: &mut TestState,
        world: &mut TestWorld,
    ) -> Result<(), HandlerError> {
        world.events.push(TestEvent::Blob(conn.id(), self.0));
        Ok(())
    }
}

// Wiring

pub(crate) type TestEngine = Arc<ConnectionEngine<TestProtocol>>;
pub(crate) type TestWorldRef = Arc<Mutex<TestWorld>>;

fn build(
    make_state: fn() -> TestState,
    config: EngineConfig,
    pool: Arc<BufferPool>,
) -> (TestEngine, TestWorldRef) {
    let world = Arc::new(Mutex::new(TestWorld::default()));
    let engine = ConnectionEngine::start_with_pool(
        TestProtocol { make_state },
        Arc::clone(&world),
        config,
        pool,
    );
    (engine, world)
}

pub(crate) fn start_engine() -> (TestEngine, TestWorldRef) {
    build(TestState::default, EngineConfig::default(), BufferPool::new())
}

pub(crate) fn start_engine_with(make_state: fn() -> TestState) -> (TestEngine, TestWorldRef) {
    build(make_state, EngineConfig::default(), BufferPool::new())
}

pub(crate) fn start_engine_on(pool: Arc<BufferPool>) -> (TestEngine, TestWorldRef) {
    build(TestState::default, EngineConfig::default(), pool)
}

pub(crate) fn start_engine_config(config: EngineConfig) -> (TestEngine, TestWorldRef) {
    build(TestState::default, config, BufferPool::new())
}

/// Opens a connection over an in-memory pipe.
///
/// Returns the connection, the server-side read half for a handler and the
/// client end of the pipe.
pub(crate) fn open_connection(
    engine: &TestEngine,
) -> (Conn, ReadHalf<DuplexStream>, DuplexStream) {
    let (client, server) = tokio::io::duplex(4 * BUFFER_LEN);
    let (reader, writer) = tokio::io::split(server);
    let conn = Connection::open(engine, writer, None);
    (conn, reader, client)
}

/// Reads exactly `len` bytes from the client end of a pipe.
pub(crate) async fn read_frames(client: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .expect("timed out waiting for data")
        .expect("pipe closed");
    buf
}

/// Looks up and decodes one packet as the receive pipeline would.
pub(crate) fn decoded(
    engine: &TestEngine,
    conn: &Conn,
    opcode: u8,
    payload: &[u8],
) -> Box<dyn IncomingPacket<TestProtocol>> {
    let decoder = {
        let state = conn.lock_state();
        engine.protocol().decoder(opcode, conn, &state)
    };
    let mut packet = decoder.expect("known opcode").packet;
    assert_eq!(packet.read(payload).0, ReadPacketResult::Success);
    packet
}

/// Copies `data` into the pipeline's receive space and processes it.
pub(crate) fn feed(
    pipeline: &mut ReceivePipeline<TestProtocol>,
    data: &[u8],
) -> Result<(), ConnectionError> {
    let space = pipeline.receive_space()?;
    space[..data.len()].copy_from_slice(data);
    pipeline.process_received_data(data.len())
}
