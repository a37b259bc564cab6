//! Constants for the lite card secure channel protocol.

/// Class bytes
pub mod cla {
    /// ISO 7816-4 interindustry class
    pub const ISO7816: u8 = 0x00;
    /// GlobalPlatform proprietary class
    pub const GP: u8 = 0x80;
    /// Secure-messaging indicator bit, OR-ed into CLA by the wrapper
    pub const SECURE_MESSAGING: u8 = 0x04;
}

/// Instruction bytes
pub mod ins {
    /// SELECT file or application
    pub const SELECT: u8 = 0xA4;
    /// GET DATA, used to fetch the card certificate
    pub const GET_DATA: u8 = 0xCA;
    /// PERFORM SECURITY OPERATION, used to push the device certificate
    pub const PERFORM_SECURITY_OPERATION: u8 = 0x2A;
    /// MUTUAL AUTHENTICATE
    pub const MUTUAL_AUTHENTICATE: u8 = 0x82;
}

/// TLV tags used by the handshake and certificate encodings.
///
/// These values must match the target card population bit-exactly.
pub mod tags {
    /// Control reference template carrying the shared info bytes
    pub const CONTROL_REFERENCE: u16 = 0xA6;
    /// Public key field (two-byte tag)
    pub const PUBLIC_KEY: u16 = 0x5F49;
    /// Receipt field in the mutual-authentication response
    pub const RECEIPT: u16 = 0x86;

    /// Certificate: entity identifier
    pub const CERT_ENTITY: u16 = 0x4F;
    /// Certificate: serial number
    pub const CERT_SERIAL: u16 = 0x93;
    /// Certificate: CA key locator identifier
    pub const CERT_CA_KLOC: u16 = 0x42;
    /// Certificate: subject identifier
    pub const CERT_SUBJECT: u16 = 0x5F20;
    /// Certificate: key usage
    pub const CERT_KEY_USAGE: u16 = 0x95;
    /// Certificate: effective date
    pub const CERT_EFFECTIVE_DATE: u16 = 0x5F25;
    /// Certificate: expiry date
    pub const CERT_EXPIRY_DATE: u16 = 0x5F24;
    /// Certificate: first discretionary field
    pub const CERT_DISCRETIONARY_1: u16 = 0x53;
    /// Certificate: second discretionary field
    pub const CERT_DISCRETIONARY_2: u16 = 0x73;
    /// Certificate: restriction bitfield
    pub const CERT_RESTRICTION: u16 = 0xBF20;
    /// Certificate: public key
    pub const CERT_PUBLIC_KEY: u16 = 0x7F49;
    /// Certificate: ECDSA signature
    pub const CERT_SIGNATURE: u16 = 0x5F37;
}

/// Status words
pub mod status {
    /// Success
    pub const SUCCESS: u16 = 0x9000;
}

/// Maximum sizes for attacker-influenced fields.
///
/// Anything larger is rejected outright; there is no truncation path.
pub mod limits {
    /// Uncompressed SEC1 point on P-256 (format byte + two coordinates)
    pub const EC_POINT_LEN: usize = 65;
    /// DER ECDSA signature over P-256 (SEQUENCE of two padded INTEGERs)
    pub const MAX_SIGNATURE_LEN: usize = 72;
    /// Any other certificate field
    pub const MAX_FIELD_LEN: usize = 64;
    /// Whole encoded certificate
    pub const MAX_CERTIFICATE_LEN: usize = 512;
    /// Receipt length in the mutual-authentication response
    pub const RECEIPT_LEN: usize = 16;
}

/// Shared info bytes carried in the control reference template and mixed
/// into the session key derivation: key usage, key type (AES), key length.
pub const SHARED_INFO: [u8; 3] = [0x3C, 0x88, 0x10];

/// P1/P2 for fetching the card certificate via GET DATA
pub const GET_DATA_CERT_P1P2: (u8, u8) = (0x7F, 0x21);

/// P1/P2 for pushing the device certificate via PERFORM SECURITY OPERATION
pub const PSO_CERT_P1P2: (u8, u8) = (0x00, 0xBE);
