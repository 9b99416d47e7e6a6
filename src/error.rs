//! Error taxonomy shared across the crate.

use thiserror::Error;

/// Failures surfaced by identity, event, relay, and zap handling.
///
/// Per-event verification and decryption failures are swallowed at the
/// subscription boundary (logged, event dropped); everything else propagates
/// to the caller that initiated the operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed encoded input: nsec strings, peer keys, envelopes.
    #[error("malformed input: {0}")]
    Decode(String),
    /// A decoded secret key is not a valid curve scalar.
    #[error("invalid secret key")]
    InvalidKey,
    /// Event signing failed.
    #[error("signing failed: {0}")]
    Signing(String),
    /// Event id or signature did not check out.
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    /// NIP-04 envelope could not be decrypted.
    #[error("decryption failed: {0}")]
    Decryption(String),
    /// Relay connection failed or is no longer usable.
    #[error("relay connection: {0}")]
    Connection(String),
    /// A one-shot query saw no EOSE within its deadline.
    #[error("relay query timed out")]
    QueryTimeout,
    /// The LNURL callback refused or returned no invoice.
    #[error("invoice request failed: {0}")]
    InvoiceRequest(String),
    /// A payment executor reported failure.
    #[error("payment failed: {0}")]
    Payment(String),
}

pub type Result<T> = std::result::Result<T, Error>;
