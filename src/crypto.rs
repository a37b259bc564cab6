//! Cryptographic operations for the lite card secure channel.
//!
//! This module provides the symmetric primitives shared by the handshake and
//! the secure messaging engine: AES-128-CBC with ISO 7816 padding, AES-CMAC,
//! ICV derivation from the command counter, and the SHA-based session key
//! derivation.

use aes::Aes128;
use bytes::{Bytes, BytesMut};
use cipher::{
    BlockDecryptMut, BlockEncrypt, BlockEncryptMut, Iv, IvSizeUser, Key, KeyInit, KeyIvInit,
    KeySizeUser, block_padding::Iso7816, consts::U16,
};
use cmac::{Cmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

type Encryptor = cbc::Encryptor<Aes128>;
type Decryptor = cbc::Decryptor<Aes128>;

/// Cipher parameters for the SCP03-style messaging layer
#[allow(missing_debug_implementations)]
pub struct Scp03;

impl KeySizeUser for Scp03 {
    type KeySize = U16;
}

impl IvSizeUser for Scp03 {
    type IvSize = U16;
}

/// Direction a derived ICV protects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcvDirection {
    /// Device to card
    Command,
    /// Card to device
    Response,
}

/// Derive the ICV for the next encryption or decryption in one direction.
///
/// The input block is all zero except the last four bytes, which hold the
/// command counter big-endian; the response direction additionally sets the
/// top bit of the first byte. CBC with a zero IV over a single block reduces
/// to a bare block encryption.
pub fn generate_icv(key: &Key<Scp03>, counter: u32, direction: IcvDirection) -> Iv<Scp03> {
    let mut block = Iv::<Scp03>::default();
    block[12..].copy_from_slice(&counter.to_be_bytes());
    if direction == IcvDirection::Response {
        block[0] = 0x80;
    }

    Aes128::new(key).encrypt_block(&mut block);
    block
}

/// Encrypt data using the provided key and IV, padding it in ISO 7816 format
/// (one `0x80` byte then zeros up to the block boundary, minimum one byte).
pub fn encrypt_data(data: &mut BytesMut, key: &Key<Scp03>, icv: &Iv<Scp03>) -> Bytes {
    let msg_len = prepare_padding(data);
    // prepare_padding grew the buffer to a block multiple, so padding fits
    let encrypted = Encryptor::new(key, icv)
        .encrypt_padded_mut::<Iso7816>(data, msg_len)
        .unwrap();
    Bytes::copy_from_slice(encrypted)
}

/// Decrypt data using the provided key and IV and strip the ISO 7816
/// padding. A final block without a valid `0x80` terminator fails closed.
pub fn decrypt_data(data: &mut BytesMut, key: &Key<Scp03>, icv: &Iv<Scp03>) -> Result<Bytes> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(Error::InvalidLength {
            expected: 16,
            actual: data.len(),
        });
    }

    let decrypted = Decryptor::new(key, icv)
        .decrypt_padded_mut::<Iso7816>(data)
        .map_err(|_| Error::InvalidPadding)?;

    Ok(Bytes::copy_from_slice(decrypted))
}

/// Compute a full 16-byte AES-CMAC over the concatenation of `chunks`.
pub fn cmac_full(key: &Key<Scp03>, chunks: &[&[u8]]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new(key);
    for chunk in chunks {
        mac.update(chunk);
    }
    mac.finalize().into_bytes().into()
}

/// Combine the two ECDH x-coordinates into the 40-byte shared secret `Z`
/// by hashing each independently with SHA-1 and concatenating.
pub fn derive_z(ephemeral_x: &[u8; 32], static_x: &[u8; 32]) -> [u8; 40] {
    let mut z = [0u8; 40];
    z[..20].copy_from_slice(&Sha1::digest(ephemeral_x));
    z[20..].copy_from_slice(&Sha1::digest(static_x));
    z
}

/// Derive the four session keys from `Z`.
///
/// For each counter value the digest is
/// `SHA256(Z || counter_be32 || shared_info || ca_key_locator)`;
/// counter 1 yields DEK and ENC, counter 2 yields MAC and RMAC.
/// Returned in order `[DEK, ENC, MAC, RMAC]`.
pub fn derive_session_material(
    z: &[u8; 40],
    shared_info: &[u8],
    ca_key_locator: &[u8],
) -> [[u8; 16]; 4] {
    let mut material = [[0u8; 16]; 4];
    for counter in 1u32..=2 {
        let mut hasher = Sha256::new();
        hasher.update(z);
        hasher.update(counter.to_be_bytes());
        hasher.update(shared_info);
        hasher.update(ca_key_locator);
        let digest = hasher.finalize();

        let slot = ((counter - 1) * 2) as usize;
        material[slot].copy_from_slice(&digest[..16]);
        material[slot + 1].copy_from_slice(&digest[16..32]);
    }
    material
}

// Grow the buffer so that ISO 7816 padding always fits, returning the
// original message length.
fn prepare_padding(data: &mut BytesMut) -> usize {
    let len = data.len();
    data.resize(len + 16 - len % 16, 0);
    len
}
