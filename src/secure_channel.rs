//! Secure messaging and channel orchestration.
//!
//! [`Scp03Wrapper`] applies SCP03-style protection to individual APDUs:
//! command bodies are AES-128-CBC encrypted under a counter-derived ICV and
//! authenticated with an 8-byte truncated AES-CMAC that chains from exchange
//! to exchange. [`LiteCardChannel`] drives the whole protocol against a
//! transport: certificate exchange, mutual authentication, then wrapped
//! APDU traffic. Any secure-messaging failure closes the channel; there is
//! no fallback to unauthenticated traffic.

use bytes::{Bytes, BytesMut};
use p256::ecdsa::VerifyingKey;
use subtle::ConstantTimeEq;
use tracing::{debug, trace, warn};

use crate::agreement::KeyAgreement;
use crate::apdu::{Command, Response};
use crate::certificate::Certificate;
use crate::constants::{GET_DATA_CERT_P1P2, PSO_CERT_P1P2, cla, ins};
use crate::crypto::{cmac_full, decrypt_data, encrypt_data};
use crate::handshake::Handshake;
use crate::session::Session;
use crate::transport::CardTransport;
use crate::{Error, Result};

/// Maximum wrapped body length for a short APDU
const MAX_WRAPPED_LEN: usize = 255;

/// Leading bytes of an application SELECT, which invalidates the channel
const SELECT_HEADER: [u8; 4] = [cla::ISO7816, ins::SELECT, 0x04, 0x00];

/// SCP03-style wrapper protecting APDU commands and responses.
#[derive(Debug, Clone)]
pub struct Scp03Wrapper {
    session: Session,
}

impl Scp03Wrapper {
    /// Wrap a freshly authenticated session
    pub const fn new(session: Session) -> Self {
        Self { session }
    }

    /// The underlying session state
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Encrypt and authenticate a command.
    ///
    /// The body is padded and encrypted under the command ICV, the CLA byte
    /// gains the secure-messaging bit, and an 8-byte truncated CMAC over the
    /// chaining value, the new header and the ciphertext is appended. The
    /// chaining value advances to the full 16-byte CMAC output.
    pub fn wrap_command(&mut self, command: &Command) -> Result<Command> {
        let icv = self.session.command_icv();

        let mut data = BytesMut::from(command.data());
        let encrypted = encrypt_data(&mut data, self.session.keys().enc(), &icv);

        let lc = encrypted.len() + 8;
        if lc > MAX_WRAPPED_LEN {
            return Err(Error::InvalidFormat("wrapped command exceeds short APDU"));
        }

        let cla = command.cla | cla::SECURE_MESSAGING;
        let header = [cla, command.ins, command.p1, command.p2, lc as u8];
        let mac = cmac_full(
            self.session.keys().mac(),
            &[self.session.mac_chain(), &header, &encrypted],
        );
        self.session.set_mac_chain(mac);

        let mut body = BytesMut::with_capacity(lc);
        body.extend_from_slice(&encrypted);
        body.extend_from_slice(&mac[..8]);

        trace!(counter = self.session.counter(), "wrapped command");
        let mut wrapped =
            Command::new_with_data(cla, command.ins, command.p1, command.p2, body.freeze());
        wrapped.le = command.le;
        Ok(wrapped)
    }

    /// Verify and decrypt a response.
    ///
    /// An empty body carries no secure data and passes through without any
    /// crypto; the caller decides what its status word means. The command
    /// counter still advances so the next command encrypts under a fresh
    /// ICV. For a non-empty body the trailing 8 bytes must match a
    /// truncated CMAC over the chaining value, the ciphertext and the
    /// status word, after which the chaining value advances and the body is
    /// decrypted under the response ICV.
    pub fn unwrap_response(&mut self, response: &Response) -> Result<Response> {
        let payload = match response.payload() {
            Some(payload) => payload.clone(),
            None => {
                self.session.advance_counter()?;
                return Ok(response.clone());
            }
        };

        if payload.len() < 24 || (payload.len() - 8) % 16 != 0 {
            return Err(Error::InvalidLength {
                expected: 24,
                actual: payload.len(),
            });
        }

        let (ciphertext, tag) = payload.split_at(payload.len() - 8);
        let status = response.status();
        let expected = cmac_full(
            self.session.keys().rmac(),
            &[
                self.session.mac_chain(),
                ciphertext,
                &[status.sw1, status.sw2],
            ],
        );
        if !bool::from(expected[..8].ct_eq(tag)) {
            return Err(Error::ResponseMacMismatch);
        }
        self.session.set_mac_chain(expected);

        let icv = self.session.response_icv()?;
        let mut buf = BytesMut::from(ciphertext);
        let plaintext = decrypt_data(&mut buf, self.session.keys().enc(), &icv)?;

        trace!(counter = self.session.counter(), "unwrapped response");
        let payload = if plaintext.is_empty() {
            None
        } else {
            Some(plaintext)
        };
        Ok(Response::new(payload, status))
    }
}

/// One logical secure session to one lite card.
///
/// The channel owns the transport and the device-side credentials. It starts
/// closed; [`LiteCardChannel::open_secure_channel`] runs the certificate
/// exchange and mutual authentication, after which wrapped traffic flows
/// through [`LiteCardChannel::send_safe_apdu`]. Closing drops the session
/// keys and the verified card certificate together.
#[derive(Debug)]
pub struct LiteCardChannel<T, K> {
    transport: T,
    agreement: K,
    trust_anchor: VerifyingKey,
    device_certificate: Bytes,
    card_certificate: Option<Certificate>,
    wrapper: Option<Scp03Wrapper>,
}

impl<T: CardTransport, K: KeyAgreement> LiteCardChannel<T, K> {
    /// Create a closed channel over the given transport.
    ///
    /// `device_certificate` is the encoded certificate pushed to the card
    /// during channel establishment; `trust_anchor` verifies the card's.
    pub fn new(
        transport: T,
        agreement: K,
        trust_anchor: VerifyingKey,
        device_certificate: impl Into<Bytes>,
    ) -> Self {
        Self {
            transport,
            agreement,
            trust_anchor,
            device_certificate: device_certificate.into(),
            card_certificate: None,
            wrapper: None,
        }
    }

    /// Whether a secure channel is currently open
    pub const fn is_open(&self) -> bool {
        self.wrapper.is_some()
    }

    /// The card certificate verified during the last successful open
    pub const fn card_certificate(&self) -> Option<&Certificate> {
        self.card_certificate.as_ref()
    }

    /// Establish the secure channel. Succeeds trivially if already open.
    ///
    /// Fetches and verifies the card certificate, pushes the device
    /// certificate, then runs the mutual authentication and installs the
    /// derived session. Every step failing leaves the channel closed.
    pub fn open_secure_channel(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        debug!("opening secure channel");

        let (p1, p2) = GET_DATA_CERT_P1P2;
        let response = self.transmit(&Command::new(cla::GP, ins::GET_DATA, p1, p2))?;
        let raw_certificate = response
            .payload()
            .clone()
            .ok_or(Error::InvalidFormat("certificate response has no payload"))?;
        let certificate = Certificate::parse_and_verify(&raw_certificate, &self.trust_anchor)?;
        debug!("card certificate verified");

        let (p1, p2) = PSO_CERT_P1P2;
        self.transmit(&Command::new_with_data(
            cla::GP,
            ins::PERFORM_SECURITY_OPERATION,
            p1,
            p2,
            self.device_certificate.clone(),
        ))?;

        let handshake = Handshake::new();
        let response = self.transmit(&Command::new_with_data(
            cla::GP,
            ins::MUTUAL_AUTHENTICATE,
            0x00,
            0x00,
            Bytes::copy_from_slice(handshake.auth_data()),
        ))?;
        let card_response = response.payload().clone().ok_or(Error::InvalidFormat(
            "mutual authenticate response has no payload",
        ))?;

        let session = handshake.open(&card_response, &certificate, &self.agreement)?;
        self.card_certificate = Some(certificate);
        self.wrapper = Some(Scp03Wrapper::new(session));
        debug!("secure channel open");
        Ok(())
    }

    /// Close the channel, dropping the session keys and card certificate.
    /// Idempotent.
    pub fn close(&mut self) {
        if self.wrapper.take().is_some() {
            debug!("secure channel closed");
        }
        self.card_certificate = None;
    }

    /// Send a command through the secure channel.
    ///
    /// Requires an open channel. Any wrap, transport or unwrap failure
    /// closes the channel before propagating; reopening is a caller
    /// decision since retrying with stale counters is unsafe.
    pub fn send_safe_apdu(&mut self, command: &Command) -> Result<Response> {
        if self.wrapper.is_none() {
            return Err(Error::ChannelClosed);
        }
        match self.send_wrapped(command) {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(%err, "secure messaging failure, closing channel");
                self.close();
                Err(err)
            }
        }
    }

    /// Exchange a raw APDU.
    ///
    /// An application SELECT invalidates any open channel first. With
    /// `safe`, the channel is opened if needed and the command travels
    /// wrapped; otherwise it goes to the transport as-is.
    pub fn apdu(&mut self, command: &[u8], safe: bool) -> Result<Bytes> {
        if command.starts_with(&SELECT_HEADER) {
            self.close();
        }

        if safe {
            self.open_secure_channel()?;
            let command = Command::from_bytes(command)?;
            Ok(self.send_safe_apdu(&command)?.to_bytes())
        } else {
            self.transport.transmit_raw(command)
        }
    }

    fn send_wrapped(&mut self, command: &Command) -> Result<Response> {
        let wrapper = match self.wrapper.as_mut() {
            Some(wrapper) => wrapper,
            None => return Err(Error::ChannelClosed),
        };
        let wrapped = wrapper.wrap_command(command)?;
        let raw = self.transport.transmit_raw(&wrapped.to_bytes()?)?;
        let response = Response::from_bytes(&raw)?;
        wrapper.unwrap_response(&response)
    }

    /// Transmit a plain command during establishment, requiring success
    fn transmit(&mut self, command: &Command) -> Result<Response> {
        let raw = self.transport.transmit_raw(&command.to_bytes()?)?;
        let response = Response::from_bytes(&raw)?;
        if !response.is_success() {
            return Err(Error::CardStatus(response.status()));
        }
        Ok(response)
    }
}
