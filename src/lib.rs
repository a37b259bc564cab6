//! Secure channel protocol for NFC lite cards
//!
//! This crate implements channel establishment and secure messaging against
//! a smart-card-class secure element reached over an untrusted transport:
//! a minimal BER-TLV decoder, certificate parsing and ECDSA verification,
//! an SCP11-style mutual authentication deriving four AES-128 session keys,
//! and SCP03-style authenticated encryption of APDU traffic.
//!
//! The main entry point is [`LiteCardChannel`], which sequences the
//! certificate exchange, the handshake and the wrapped traffic over a
//! [`CardTransport`] implementation provided by the caller.

pub mod agreement;
pub mod apdu;
pub mod certificate;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod secure_channel;
pub mod session;
pub mod tlv;
pub mod transport;

// Re-exports
pub use agreement::{KeyAgreement, SoftwareKeyAgreement};
pub use apdu::{Command, Response, StatusWord};
pub use certificate::Certificate;
pub use error::{Error, Result};
pub use handshake::Handshake;
pub use secure_channel::{LiteCardChannel, Scp03Wrapper};
pub use session::{Keys, Session};
pub use transport::CardTransport;
