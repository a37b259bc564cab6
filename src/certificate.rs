//! Card certificate parsing and verification.
//!
//! A certificate is a flat sequence of BER-TLV fields. Parsing walks the
//! fields in document order, records recognized tags into named slots, and
//! feeds every encoded field except the signature into a running SHA-256
//! digest. The embedded ECDSA P-256 signature is then verified over that
//! digest against a fixed trust anchor. A certificate either verifies in
//! full or is rejected; there is no partially trusted state.

use core::ops::Range;

use bytes::Bytes;
use p256::ecdsa::{Signature, VerifyingKey, signature::DigestVerifier};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::constants::{limits, tags};
use crate::tlv::TlvReader;
use crate::{Error, Result};

/// A parsed and signature-verified card certificate.
///
/// Owns the raw encoded bytes; the named fields are byte ranges into that
/// buffer. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Certificate {
    raw: Bytes,
    entity: Option<Range<usize>>,
    serial: Option<Range<usize>>,
    ca_key_locator: Option<Range<usize>>,
    subject: Option<Range<usize>>,
    key_usage: Option<Range<usize>>,
    effective_date: Option<Range<usize>>,
    expiry_date: Option<Range<usize>>,
    discretionary_1: Option<Range<usize>>,
    discretionary_2: Option<Range<usize>>,
    restriction: Option<Range<usize>>,
    public_key: Range<usize>,
    signature: Range<usize>,
}

impl Certificate {
    /// Parse `raw` and verify its signature against `trust_anchor`.
    ///
    /// Unrecognized tags are hashed and skipped, not rejected. Any length
    /// violation, missing mandatory field, or signature mismatch fails the
    /// whole certificate.
    pub fn parse_and_verify(raw: &[u8], trust_anchor: &VerifyingKey) -> Result<Self> {
        if raw.len() > limits::MAX_CERTIFICATE_LEN {
            return Err(Error::CertificateTooLarge(raw.len()));
        }

        let mut entity = None;
        let mut serial = None;
        let mut ca_key_locator = None;
        let mut subject = None;
        let mut key_usage = None;
        let mut effective_date = None;
        let mut expiry_date = None;
        let mut discretionary_1 = None;
        let mut discretionary_2 = None;
        let mut restriction = None;
        let mut public_key = None;
        let mut signature = None;

        let mut hasher = Sha256::new();
        let mut reader = TlvReader::new(raw);

        while let Some(field) = reader.next_field() {
            let field = field?;

            if field.tag == tags::CERT_SIGNATURE {
                // The signature authenticates all other fields and is
                // excluded from the digest.
                check_field_len(&field, limits::MAX_SIGNATURE_LEN)?;
                signature = Some(field.value_range.clone());
                continue;
            }

            hasher.update(&raw[field.encoded.clone()]);

            let slot = match field.tag {
                tags::CERT_ENTITY => &mut entity,
                tags::CERT_SERIAL => &mut serial,
                tags::CERT_CA_KLOC => &mut ca_key_locator,
                tags::CERT_SUBJECT => &mut subject,
                tags::CERT_KEY_USAGE => &mut key_usage,
                tags::CERT_EFFECTIVE_DATE => &mut effective_date,
                tags::CERT_EXPIRY_DATE => &mut expiry_date,
                tags::CERT_DISCRETIONARY_1 => &mut discretionary_1,
                tags::CERT_DISCRETIONARY_2 => &mut discretionary_2,
                tags::CERT_RESTRICTION => &mut restriction,
                tags::CERT_PUBLIC_KEY => {
                    if field.value.len() != limits::EC_POINT_LEN {
                        return Err(Error::InvalidLength {
                            expected: limits::EC_POINT_LEN,
                            actual: field.value.len(),
                        });
                    }
                    if field.value[0] != 0x04 {
                        return Err(Error::InvalidFormat(
                            "certificate public key is not an uncompressed point",
                        ));
                    }
                    public_key = Some(field.value_range.clone());
                    continue;
                }
                _ => {
                    trace!(tag = field.tag, "skipping unrecognized certificate field");
                    continue;
                }
            };

            check_field_len(&field, limits::MAX_FIELD_LEN)?;
            *slot = Some(field.value_range.clone());
        }

        let public_key = public_key.ok_or(Error::MissingField(tags::CERT_PUBLIC_KEY))?;
        let signature = signature.ok_or(Error::MissingField(tags::CERT_SIGNATURE))?;

        let (r, s) = parse_der_signature(&raw[signature.clone()])?;
        let signature_value = Signature::from_scalars(r, s)
            .map_err(|_| Error::CertificateSignatureInvalid)?;

        trust_anchor
            .verify_digest(hasher, &signature_value)
            .map_err(|_| {
                debug!("certificate signature verification failed");
                Error::CertificateSignatureInvalid
            })?;

        Ok(Self {
            raw: Bytes::copy_from_slice(raw),
            entity,
            serial,
            ca_key_locator,
            subject,
            key_usage,
            effective_date,
            expiry_date,
            discretionary_1,
            discretionary_2,
            restriction,
            public_key,
            signature,
        })
    }

    /// Raw encoded certificate bytes
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Subject public key as an uncompressed SEC1 point (65 bytes)
    pub fn public_key(&self) -> &[u8] {
        &self.raw[self.public_key.clone()]
    }

    /// Subject public key as a curve point
    pub fn subject_public_key(&self) -> Result<p256::PublicKey> {
        p256::PublicKey::from_sec1_bytes(self.public_key())
            .map_err(|_| Error::InvalidKeyMaterial)
    }

    /// DER-encoded ECDSA signature field
    pub fn signature(&self) -> &[u8] {
        &self.raw[self.signature.clone()]
    }

    /// Entity identifier
    pub fn entity(&self) -> Option<&[u8]> {
        self.field(&self.entity)
    }

    /// Serial number
    pub fn serial(&self) -> Option<&[u8]> {
        self.field(&self.serial)
    }

    /// CA key locator identifier, mixed into the session key derivation
    pub fn ca_key_locator(&self) -> Option<&[u8]> {
        self.field(&self.ca_key_locator)
    }

    /// Subject identifier
    pub fn subject(&self) -> Option<&[u8]> {
        self.field(&self.subject)
    }

    /// Key usage
    pub fn key_usage(&self) -> Option<&[u8]> {
        self.field(&self.key_usage)
    }

    /// Effective date
    pub fn effective_date(&self) -> Option<&[u8]> {
        self.field(&self.effective_date)
    }

    /// Expiry date
    pub fn expiry_date(&self) -> Option<&[u8]> {
        self.field(&self.expiry_date)
    }

    /// First discretionary field
    pub fn discretionary_1(&self) -> Option<&[u8]> {
        self.field(&self.discretionary_1)
    }

    /// Second discretionary field
    pub fn discretionary_2(&self) -> Option<&[u8]> {
        self.field(&self.discretionary_2)
    }

    /// Restriction bitfield
    pub fn restriction(&self) -> Option<&[u8]> {
        self.field(&self.restriction)
    }

    fn field(&self, range: &Option<Range<usize>>) -> Option<&[u8]> {
        range.as_ref().map(|r| &self.raw[r.clone()])
    }
}

fn check_field_len(field: &crate::tlv::TlvField<'_>, max: usize) -> Result<()> {
    if field.value.len() > max {
        return Err(Error::FieldTooLong {
            tag: field.tag,
            actual: field.value.len(),
            max,
        });
    }
    Ok(())
}

/// Parse a DER `SEQUENCE` of two `INTEGER`s into fixed 32-byte r and s
/// components, stripping the sign-padding byte where present.
fn parse_der_signature(der: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    if der.len() < 8 || der[0] != 0x30 || der[1] as usize != der.len() - 2 {
        return Err(Error::InvalidFormat("malformed DER signature"));
    }

    let (r, rest) = parse_der_integer(&der[2..])?;
    let (s, rest) = parse_der_integer(rest)?;
    if !rest.is_empty() {
        return Err(Error::InvalidFormat("trailing bytes after DER signature"));
    }

    Ok((r, s))
}

fn parse_der_integer(buf: &[u8]) -> Result<([u8; 32], &[u8])> {
    if buf.len() < 2 || buf[0] != 0x02 {
        return Err(Error::InvalidFormat("malformed DER integer"));
    }

    let len = buf[1] as usize;
    let bytes = buf
        .get(2..2 + len)
        .ok_or(Error::InvalidFormat("truncated DER integer"))?;

    // A leading zero is sign padding when the high bit of the next byte is
    // set; strip it so the component fits 32 bytes.
    let bytes = match bytes {
        [0x00, rest @ ..] if rest.len() == 32 => rest,
        _ => bytes,
    };
    if bytes.is_empty() || bytes.len() > 32 {
        return Err(Error::InvalidFormat("DER integer out of range"));
    }

    let mut component = [0u8; 32];
    component[32 - bytes.len()..].copy_from_slice(bytes);
    Ok((component, &buf[2 + len..]))
}
