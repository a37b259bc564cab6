//! Key-agreement provider seam.
//!
//! The handshake performs two ECDH operations: one with the per-attempt
//! ephemeral key (done in-crate) and one with the device's long-term static
//! key. The latter goes through [`KeyAgreement`] so that production builds
//! can delegate to a secure element that never exposes the static private
//! key, while tests bind a software implementation.

use p256::{PublicKey, SecretKey};

use crate::Result;

/// ECDH with the device's long-term static key.
pub trait KeyAgreement {
    /// Multiply the card's static public key by the device's static private
    /// scalar and return the x-coordinate of the resulting point.
    fn static_ecdh_x(&self, card_public: &PublicKey) -> Result<[u8; 32]>;
}

impl<K: KeyAgreement + ?Sized> KeyAgreement for &K {
    fn static_ecdh_x(&self, card_public: &PublicKey) -> Result<[u8; 32]> {
        (**self).static_ecdh_x(card_public)
    }
}

/// Software key agreement holding the static private key in memory.
///
/// Intended for tests and development; production devices keep the static
/// key inside the secure element.
pub struct SoftwareKeyAgreement {
    secret: SecretKey,
}

impl core::fmt::Debug for SoftwareKeyAgreement {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SoftwareKeyAgreement").finish_non_exhaustive()
    }
}

impl SoftwareKeyAgreement {
    /// Wrap an existing static private key
    pub const fn new(secret: SecretKey) -> Self {
        Self { secret }
    }

    /// The corresponding static public key
    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }
}

impl KeyAgreement for SoftwareKeyAgreement {
    fn static_ecdh_x(&self, card_public: &PublicKey) -> Result<[u8; 32]> {
        Ok(ecdh_x(&self.secret, card_public))
    }
}

/// ECDH scalar multiplication returning the shared point's x-coordinate.
pub(crate) fn ecdh_x(private: &SecretKey, public: &PublicKey) -> [u8; 32] {
    let shared =
        p256::ecdh::diffie_hellman(private.to_nonzero_scalar(), public.as_affine());
    let mut x = [0u8; 32];
    x.copy_from_slice(shared.raw_secret_bytes());
    x
}
