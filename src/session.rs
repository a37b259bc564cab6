//! Session keys and secure-messaging state.
//!
//! A [`Session`] is produced by a successful mutual authentication and holds
//! the four derived AES-128 keys together with the SCP03 command counter and
//! MAC chaining value. The keys live and die together; closing the channel
//! drops the session and zeroizes them.

use cipher::{Iv, Key};
use zeroize::Zeroize;

use crate::crypto::{IcvDirection, Scp03, generate_icv};
use crate::{Error, Result};

/// The four session keys derived by the handshake.
#[derive(Debug, Clone, Zeroize)]
#[zeroize(drop)]
pub struct Keys {
    /// Command confidentiality key
    enc: [u8; 16],
    /// Command authentication key
    mac: [u8; 16],
    /// Response authentication key
    rmac: [u8; 16],
    /// Key-derivation / receipt authentication key
    dek: [u8; 16],
}

impl Keys {
    /// Create a key set from the four derived keys
    pub const fn new(enc: [u8; 16], mac: [u8; 16], rmac: [u8; 16], dek: [u8; 16]) -> Self {
        Self {
            enc,
            mac,
            rmac,
            dek,
        }
    }

    /// Encryption key
    pub fn enc(&self) -> &Key<Scp03> {
        Key::<Scp03>::from_slice(&self.enc)
    }

    /// Command MAC key
    pub fn mac(&self) -> &Key<Scp03> {
        Key::<Scp03>::from_slice(&self.mac)
    }

    /// Response MAC key
    pub fn rmac(&self) -> &Key<Scp03> {
        Key::<Scp03>::from_slice(&self.rmac)
    }

    /// Data encryption / receipt key
    pub fn dek(&self) -> &Key<Scp03> {
        Key::<Scp03>::from_slice(&self.dek)
    }
}

/// Secure-messaging state for one open channel.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session keys derived during mutual authentication
    keys: Keys,
    /// Command counter, starts at 1
    counter: u32,
    /// Running MAC chaining value, seeded from the handshake receipt
    mac_chain: [u8; 16],
}

impl Session {
    /// Create a session from freshly derived keys and the handshake receipt
    pub(crate) const fn new(keys: Keys, receipt: [u8; 16]) -> Self {
        Self {
            keys,
            counter: 1,
            mac_chain: receipt,
        }
    }

    /// Create a session from raw state. Intended for tests and for callers
    /// resuming a vetted fixture; normal code paths go through the handshake.
    pub const fn from_raw(keys: Keys, mac_chain: [u8; 16], counter: u32) -> Self {
        Self {
            keys,
            counter,
            mac_chain,
        }
    }

    /// The session keys
    pub const fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Current command counter value
    pub const fn counter(&self) -> u32 {
        self.counter
    }

    /// Current MAC chaining value
    pub const fn mac_chain(&self) -> &[u8; 16] {
        &self.mac_chain
    }

    pub(crate) const fn set_mac_chain(&mut self, chain: [u8; 16]) {
        self.mac_chain = chain;
    }

    /// ICV for encrypting the next command body
    pub(crate) fn command_icv(&self) -> Iv<Scp03> {
        generate_icv(self.keys.enc(), self.counter, IcvDirection::Command)
    }

    /// Advance the command counter once per completed round trip, so the
    /// next command never reuses an ICV. Exhaustion is a hard error.
    pub(crate) fn advance_counter(&mut self) -> Result<()> {
        self.counter = self.counter.checked_add(1).ok_or(Error::CounterExhausted)?;
        Ok(())
    }

    /// ICV for decrypting a response body. Advances the command counter
    /// before derivation.
    pub(crate) fn response_icv(&mut self) -> Result<Iv<Scp03>> {
        self.advance_counter()?;
        Ok(generate_icv(
            self.keys.enc(),
            self.counter,
            IcvDirection::Response,
        ))
    }
}
