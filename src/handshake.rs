//! Mutual authentication and session key agreement.
//!
//! The handshake generates a fresh ephemeral keypair per attempt, sends the
//! mutual-authentication payload to the card, and derives the four session
//! keys from two ECDH results: ephemeral-private x card-static-public, and
//! device-static-private x card-static-public. The second operation goes
//! through the [`KeyAgreement`] provider so the device's static key can stay
//! inside a secure element. The card proves it derived the same keys with a
//! 16-byte receipt CMAC, which also seeds the messaging MAC chain.

use bytes::{Bytes, BytesMut};
use p256::SecretKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use subtle::ConstantTimeEq;
use tracing::{debug, trace};

use crate::agreement::{KeyAgreement, ecdh_x};
use crate::certificate::Certificate;
use crate::constants::{SHARED_INFO, limits, tags};
use crate::crypto::{cmac_full, derive_session_material, derive_z};
use crate::session::{Keys, Session};
use crate::tlv::{self, TlvReader};
use crate::{Error, Result};

/// One mutual-authentication attempt.
///
/// Created with a fresh ephemeral key, consumed by [`Handshake::open`]. The
/// ephemeral private key is erased when the value drops.
pub struct Handshake {
    ephemeral: SecretKey,
    auth_data: Bytes,
}

impl core::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handshake")
            .field("auth_data", &hex::encode(&self.auth_data))
            .finish_non_exhaustive()
    }
}

impl Handshake {
    /// Start a handshake attempt with a freshly generated ephemeral key
    pub fn new() -> Self {
        Self::with_ephemeral(SecretKey::random(&mut rand::thread_rng()))
    }

    /// Start a handshake attempt with a caller-supplied ephemeral key.
    /// Intended for deterministic tests.
    pub fn with_ephemeral(ephemeral: SecretKey) -> Self {
        let point = ephemeral.public_key().to_encoded_point(false);

        let mut auth_data = BytesMut::new();
        tlv::encode(tags::CONTROL_REFERENCE, &SHARED_INFO, &mut auth_data);
        tlv::encode(tags::PUBLIC_KEY, point.as_bytes(), &mut auth_data);

        Self {
            ephemeral,
            auth_data: auth_data.freeze(),
        }
    }

    /// The mutual-authentication payload to send to the card
    pub fn auth_data(&self) -> &[u8] {
        &self.auth_data
    }

    /// Process the card's mutual-authentication response and derive the
    /// session. Any parse failure or receipt mismatch leaves no session.
    pub fn open(
        self,
        card_response: &[u8],
        card_certificate: &Certificate,
        agreement: &dyn KeyAgreement,
    ) -> Result<Session> {
        let mut reader = TlvReader::new(card_response);

        let card_point = reader.expect_field(tags::PUBLIC_KEY)?;
        if card_point.value.len() != limits::EC_POINT_LEN {
            return Err(Error::InvalidLength {
                expected: limits::EC_POINT_LEN,
                actual: card_point.value.len(),
            });
        }

        let receipt_field = reader.expect_field(tags::RECEIPT)?;
        if receipt_field.value.len() != limits::RECEIPT_LEN {
            return Err(Error::InvalidLength {
                expected: limits::RECEIPT_LEN,
                actual: receipt_field.value.len(),
            });
        }
        let receipt_start = receipt_field.value_range.start;
        let mut receipt = [0u8; 16];
        receipt.copy_from_slice(receipt_field.value);

        // Both ECDH operations run against the card's certified static key
        let card_static = card_certificate.subject_public_key()?;
        let ephemeral_x = ecdh_x(&self.ephemeral, &card_static);
        let static_x = agreement.static_ecdh_x(&card_static)?;

        let z = derive_z(&ephemeral_x, &static_x);
        let ca_key_locator = card_certificate
            .ca_key_locator()
            .ok_or(Error::MissingField(tags::CERT_CA_KLOC))?;
        let [dek, enc, mac, rmac] = derive_session_material(&z, &SHARED_INFO, ca_key_locator);
        let keys = Keys::new(enc, mac, rmac, dek);

        // The receipt covers our payload plus the card response up to the
        // receipt bytes themselves.
        let expected = cmac_full(
            keys.dek(),
            &[&self.auth_data, &card_response[..receipt_start]],
        );
        if !bool::from(expected.ct_eq(&receipt)) {
            debug!("mutual authentication receipt mismatch");
            return Err(Error::ReceiptMismatch);
        }

        trace!("mutual authentication receipt verified");
        Ok(Session::new(keys, receipt))
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use p256::ecdsa::SigningKey;

    use crate::agreement::SoftwareKeyAgreement;

    fn fixed_secret(fill: u8) -> SecretKey {
        SecretKey::from_slice(&[fill; 32]).unwrap()
    }

    fn card_certificate(root: &SigningKey, card_public: &p256::PublicKey) -> Certificate {
        use p256::ecdsa::signature::DigestSigner;
        use sha2::{Digest, Sha256};

        let point = card_public.to_encoded_point(false);
        let mut body = BytesMut::new();
        tlv::encode(tags::CERT_CA_KLOC, &hex!("AABB"), &mut body);
        tlv::encode(tags::CERT_PUBLIC_KEY, point.as_bytes(), &mut body);

        let mut hasher = Sha256::new();
        hasher.update(&body);
        let signature: p256::ecdsa::Signature = root.sign_digest(hasher);
        let mut raw = BytesMut::from(&body[..]);
        tlv::encode(tags::CERT_SIGNATURE, signature.to_der().as_bytes(), &mut raw);

        Certificate::parse_and_verify(&raw, root.verifying_key()).unwrap()
    }

    /// Build the card side of a response: its public key field, the receipt
    /// field header, then the receipt CMAC computed the way the card does.
    fn card_response(
        handshake: &Handshake,
        card_secret: &SecretKey,
        device_public: &p256::PublicKey,
        ca_key_locator: &[u8],
    ) -> Vec<u8> {
        let mut reader = TlvReader::new(handshake.auth_data());
        reader.expect_field(tags::CONTROL_REFERENCE).unwrap();
        let eph_field = reader.expect_field(tags::PUBLIC_KEY).unwrap();
        let eph_public = p256::PublicKey::from_sec1_bytes(eph_field.value).unwrap();

        let ephemeral_x = ecdh_x(card_secret, &eph_public);
        let static_x = ecdh_x(card_secret, device_public);
        let z = derive_z(&ephemeral_x, &static_x);
        let [dek, ..] = derive_session_material(&z, &SHARED_INFO, ca_key_locator);

        let card_point = card_secret.public_key().to_encoded_point(false);
        let mut response = BytesMut::new();
        tlv::encode(tags::PUBLIC_KEY, card_point.as_bytes(), &mut response);
        // Receipt header, value appended after MAC computation
        response.extend_from_slice(&[0x86, 0x10]);

        let receipt = cmac_full(
            cipher::Key::<crate::crypto::Scp03>::from_slice(&dek),
            &[handshake.auth_data(), &response],
        );
        response.extend_from_slice(&receipt);
        response.to_vec()
    }

    #[test]
    fn test_open_derives_matching_session() {
        let root = SigningKey::from_bytes(&[0x77u8; 32].into()).unwrap();
        let card_secret = fixed_secret(0x42);
        let device_secret = fixed_secret(0x43);

        let cert = card_certificate(&root, &card_secret.public_key());
        let agreement = SoftwareKeyAgreement::new(device_secret.clone());

        let handshake = Handshake::with_ephemeral(fixed_secret(0x44));
        let response = card_response(
            &handshake,
            &card_secret,
            &device_secret.public_key(),
            &hex!("AABB"),
        );

        let session = handshake.open(&response, &cert, &agreement).unwrap();
        assert_eq!(session.counter(), 1);

        // Determinism: the same inputs derive the same session
        let handshake = Handshake::with_ephemeral(fixed_secret(0x44));
        let again = handshake.open(&response, &cert, &agreement).unwrap();
        assert_eq!(session.mac_chain(), again.mac_chain());
        assert_eq!(session.keys().enc(), again.keys().enc());
        assert_eq!(session.keys().rmac(), again.keys().rmac());
    }

    #[test]
    fn test_receipt_mismatch_fails() {
        let root = SigningKey::from_bytes(&[0x77u8; 32].into()).unwrap();
        let card_secret = fixed_secret(0x42);
        let device_secret = fixed_secret(0x43);

        let cert = card_certificate(&root, &card_secret.public_key());
        let agreement = SoftwareKeyAgreement::new(device_secret.clone());

        let handshake = Handshake::with_ephemeral(fixed_secret(0x44));
        let mut response = card_response(
            &handshake,
            &card_secret,
            &device_secret.public_key(),
            &hex!("AABB"),
        );
        let last = response.len() - 1;
        response[last] ^= 0x01;

        assert!(matches!(
            handshake.open(&response, &cert, &agreement),
            Err(Error::ReceiptMismatch)
        ));
    }

    #[test]
    fn test_wrong_tags_fail() {
        let root = SigningKey::from_bytes(&[0x77u8; 32].into()).unwrap();
        let card_secret = fixed_secret(0x42);
        let cert = card_certificate(&root, &card_secret.public_key());
        let agreement = SoftwareKeyAgreement::new(fixed_secret(0x43));

        // Response leading with the receipt tag instead of the public key
        let handshake = Handshake::with_ephemeral(fixed_secret(0x44));
        let mut response = BytesMut::new();
        tlv::encode(tags::RECEIPT, &[0u8; 16], &mut response);
        assert!(matches!(
            handshake.open(&response, &cert, &agreement),
            Err(Error::UnexpectedTag { .. })
        ));

        // Receipt with the wrong length
        let handshake = Handshake::with_ephemeral(fixed_secret(0x44));
        let card_point = card_secret.public_key().to_encoded_point(false);
        let mut response = BytesMut::new();
        tlv::encode(tags::PUBLIC_KEY, card_point.as_bytes(), &mut response);
        tlv::encode(tags::RECEIPT, &[0u8; 8], &mut response);
        assert!(matches!(
            handshake.open(&response, &cert, &agreement),
            Err(Error::InvalidLength { expected: 16, .. })
        ));
    }

    #[test]
    fn test_auth_data_layout() {
        let handshake = Handshake::with_ephemeral(fixed_secret(0x44));
        let data = handshake.auth_data();

        // A6 03 shared-info || 5F49 41 point
        assert_eq!(&data[..5], &[0xA6, 0x03, 0x3C, 0x88, 0x10]);
        assert_eq!(&data[5..8], &[0x5F, 0x49, 0x41]);
        assert_eq!(data.len(), 5 + 3 + 65);
        assert_eq!(data[8], 0x04);
    }
}
