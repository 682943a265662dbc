//! Seeded XOR stream cipher used by the chat protocol.
//!
//! A client opens with a 4-byte big-endian seed. Seed 0 selects plain
//! traffic; any other seed keys two independent keystreams, one per
//! direction. This obfuscates traffic, it does not secure it.

use crate::protocol::{Encryption, EncryptionInitResult, StrategyError};

/// Length of the handshake seed.
pub const SEED_LEN: usize = 4;

#[derive(Debug, Clone)]
struct Keystream {
    state: u32,
}

impl Keystream {
    fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// xorshift32
    fn next_byte(&mut self) -> u8 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        (x >> 24) as u8
    }

    fn apply(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError> {
        if src.len() > dst.len() {
            return Err(StrategyError::OutputTooSmall {
                needed: src.len(),
                available: dst.len(),
            });
        }
        for (d, s) in dst.iter_mut().zip(src) {
            *d = s ^ self.next_byte();
        }
        Ok(src.len())
    }
}

/// Per-connection cipher state.
#[derive(Debug, Clone, Default)]
pub struct SeededXor {
    /// Client to server
    incoming: Option<Keystream>,
    /// Server to client
    outgoing: Option<Keystream>,
}

impl SeededXor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The client side of a connection keyed with `seed`.
    ///
    /// Its outgoing stream matches the server's incoming one.
    pub fn client(seed: u32) -> Self {
        Self {
            incoming: Some(Keystream::new(seed.rotate_left(16))),
            outgoing: Some(Keystream::new(seed)),
        }
    }
}

impl Encryption for SeededXor {
    fn name(&self) -> &'static str {
        "seeded-xor"
    }

    fn init(&mut self, buf: &[u8]) -> (EncryptionInitResult, usize) {
        let Some(seed) = buf.get(..SEED_LEN) else {
            return (EncryptionInitResult::NotEnoughData, 0);
        };
        let seed = u32::from_be_bytes([seed[0], seed[1], seed[2], seed[3]]);
        if seed == 0 {
            return (EncryptionInitResult::SuccessNoEncryption, SEED_LEN);
        }

        self.incoming = Some(Keystream::new(seed));
        self.outgoing = Some(Keystream::new(seed.rotate_left(16)));
        (EncryptionInitResult::SuccessUseEncryption, SEED_LEN)
    }

    fn decrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError> {
        match self.incoming.as_mut() {
            Some(stream) => stream.apply(src, dst),
            None => Err(StrategyError::Corrupt("cipher not keyed".into())),
        }
    }

    fn encrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError> {
        match self.outgoing.as_mut() {
            Some(stream) => stream.apply(src, dst),
            None => Err(StrategyError::Corrupt("cipher not keyed".into())),
        }
    }
}
