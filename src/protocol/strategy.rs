//! Pluggable encryption and compression strategies.
//!
//! The engine never knows which algorithm a connection uses. A connection
//! state may expose an [`Encryption`] and/or a [`Compression`]; when one is
//! absent the corresponding stage is a plain byte copy.
//!
//! Both strategies work on slices: they read `src` and write to the front of
//! `dst`, returning the number of bytes produced. `dst` is the free part of
//! a pooled buffer, so a strategy that cannot fit its output must report
//! [`StrategyError::OutputTooSmall`] rather than truncate.

use thiserror::Error;

/// Errors reported by encryption or compression strategies.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StrategyError {
    /// The produced bytes do not fit the destination buffer
    #[error("output too small: needed {needed} bytes, {available} available")]
    OutputTooSmall { needed: usize, available: usize },

    /// The input cannot be transformed
    #[error("corrupt input: {0}")]
    Corrupt(String),
}

/// Result of inspecting the first bytes of a connection for a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionInitResult {
    /// The peer encrypts; decrypt everything after the handshake
    SuccessUseEncryption,
    /// The peer does not encrypt; pass everything through
    SuccessNoEncryption,
    /// The handshake bytes are not recognised
    InvalidData,
    /// Not enough bytes yet to decide
    NotEnoughData,
}

/// A per-connection encryption strategy.
pub trait Encryption: Send {
    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Inspects the handshake at the start of `buf`.
    ///
    /// Returns the outcome and how many handshake bytes were consumed.
    fn init(&mut self, buf: &[u8]) -> (EncryptionInitResult, usize);

    fn decrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError>;

    fn encrypt(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError>;
}

/// A per-connection compression strategy.
pub trait Compression: Send {
    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError>;

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError>;
}

/// The pass-through stage used when no strategy is configured.
pub(crate) fn copy_bytes(src: &[u8], dst: &mut [u8]) -> Result<usize, StrategyError> {
    if src.len() > dst.len() {
        return Err(StrategyError::OutputTooSmall {
            needed: src.len(),
            available: dst.len(),
        });
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(src.len())
}
