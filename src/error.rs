//! Error types for lite card secure channel operations.

use thiserror::Error;

use crate::apdu::StatusWord;

/// Result type for lite card operations
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for lite card operations
#[derive(Debug, Error)]
pub enum Error {
    /// TLV tag or length field extends past the end of the input
    #[error("truncated TLV input")]
    TlvTruncated,

    /// Declared TLV value length would run past the end of the buffer
    #[error("TLV length overruns buffer")]
    TlvLengthOverflow,

    /// A mandatory TLV tag was missing or a different tag was found
    #[error("unexpected TLV tag: expected {expected:#06x}, got {actual:#06x}")]
    UnexpectedTag {
        /// Expected tag value
        expected: u16,
        /// Tag actually present
        actual: u16,
    },

    /// Wrong data length
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// A certificate field exceeds its maximum permitted size
    #[error("certificate field {tag:#06x} too long: {actual} bytes (max {max})")]
    FieldTooLong {
        /// Tag of the offending field
        tag: u16,
        /// Encoded field length
        actual: usize,
        /// Maximum permitted length
        max: usize,
    },

    /// Encoded certificate exceeds the maximum supported size
    #[error("certificate too large: {0} bytes")]
    CertificateTooLarge(usize),

    /// A required certificate field was not present
    #[error("certificate missing required field {0:#06x}")]
    MissingField(u16),

    /// Certificate signature did not verify against the trust anchor
    #[error("certificate signature verification failed")]
    CertificateSignatureInvalid,

    /// Invalid or unsupported data format
    #[error("invalid data format: {0}")]
    InvalidFormat(&'static str),

    /// Elliptic-curve point or scalar was rejected by the curve implementation
    #[error("invalid elliptic curve key material")]
    InvalidKeyMaterial,

    /// Receipt MAC mismatch during mutual authentication
    #[error("mutual authentication receipt mismatch")]
    ReceiptMismatch,

    /// Response MAC did not verify
    #[error("response MAC verification failed")]
    ResponseMacMismatch,

    /// Decrypted response carried invalid padding
    #[error("invalid ISO 7816 padding")]
    InvalidPadding,

    /// Secure channel is not open
    #[error("secure channel not established")]
    ChannelClosed,

    /// Command counter exhausted; the channel must be reopened
    #[error("secure messaging command counter exhausted")]
    CounterExhausted,

    /// Card returned an error status during channel establishment
    #[error("card returned error status: {0}")]
    CardStatus(StatusWord),

    /// Transport-level failure (timeout, card removed)
    #[error("transport error: {0}")]
    Transport(&'static str),
}
