//! End-to-end secure channel tests against a simulated lite card.
//!
//! The simulator terminates the protocol with the crate's own primitives:
//! it serves its certificate, runs the card side of the mutual
//! authentication, and unwraps/echoes wrapped commands, so every exchange
//! exercises both directions of the key derivation and secure messaging.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use hex_literal::hex;
use p256::ecdsa::{Signature, SigningKey, signature::DigestSigner};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use litecard::constants::{SHARED_INFO, tags};
use litecard::crypto::{
    IcvDirection, cmac_full, decrypt_data, derive_session_material, derive_z, encrypt_data,
    generate_icv,
};
use litecard::tlv::{self, TlvReader};
use litecard::{
    CardTransport, Certificate, Command, Error, Handshake, KeyAgreement, Keys, LiteCardChannel,
    Response, Result, Scp03Wrapper, SoftwareKeyAgreement,
};

const CA_KEY_LOCATOR: [u8; 2] = hex!("AABB");

struct CardSession {
    keys: Keys,
    counter: u32,
    chain: [u8; 16],
}

struct CardSim {
    secret: SecretKey,
    certificate: Bytes,
    device_public: PublicKey,
    session: Option<CardSession>,
    tamper_next_mac: bool,
}

impl CardSim {
    fn transmit(&mut self, raw: &[u8]) -> Result<Bytes> {
        let command = Command::from_bytes(raw)?;
        match (command.cla, command.ins) {
            (0x00, 0xA4) => Ok(Bytes::from_static(&hex!("9000"))),
            (0x80, 0xCA) => {
                let mut out = BytesMut::from(self.certificate.as_ref());
                out.extend_from_slice(&hex!("9000"));
                Ok(out.freeze())
            }
            (0x80, 0x2A) => Ok(Bytes::from_static(&hex!("9000"))),
            (0x80, 0x82) => self.mutual_authenticate(command.data()),
            (cla, _) if cla & 0x04 != 0 => self.wrapped(&command),
            _ => Ok(Bytes::from_static(&hex!("6D00"))),
        }
    }

    fn mutual_authenticate(&mut self, auth_data: &[u8]) -> Result<Bytes> {
        let mut reader = TlvReader::new(auth_data);
        reader.expect_field(tags::CONTROL_REFERENCE)?;
        let ephemeral = reader.expect_field(tags::PUBLIC_KEY)?;
        let ephemeral_public =
            PublicKey::from_sec1_bytes(ephemeral.value).map_err(|_| Error::InvalidKeyMaterial)?;

        let card = SoftwareKeyAgreement::new(self.secret.clone());
        let ephemeral_x = card.static_ecdh_x(&ephemeral_public)?;
        let static_x = card.static_ecdh_x(&self.device_public)?;
        let z = derive_z(&ephemeral_x, &static_x);
        let [dek, enc, mac, rmac] = derive_session_material(&z, &SHARED_INFO, &CA_KEY_LOCATOR);
        let keys = Keys::new(enc, mac, rmac, dek);

        let point = self.secret.public_key().to_encoded_point(false);
        let mut response = BytesMut::new();
        tlv::encode(tags::PUBLIC_KEY, point.as_bytes(), &mut response);
        response.extend_from_slice(&[0x86, 0x10]);
        let receipt = cmac_full(keys.dek(), &[auth_data, &response]);
        response.extend_from_slice(&receipt);

        self.session = Some(CardSession {
            keys,
            counter: 1,
            chain: receipt,
        });

        response.extend_from_slice(&hex!("9000"));
        Ok(response.freeze())
    }

    /// Verify, decrypt and echo back a wrapped command.
    fn wrapped(&mut self, command: &Command) -> Result<Bytes> {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Ok(Bytes::from_static(&hex!("6985"))),
        };

        let body = command.data();
        assert!(body.len() >= 24 && (body.len() - 8) % 16 == 0);
        let (ciphertext, tag) = body.split_at(body.len() - 8);

        let header = [
            command.cla,
            command.ins,
            command.p1,
            command.p2,
            body.len() as u8,
        ];
        let mac = cmac_full(session.keys.mac(), &[&session.chain, &header, ciphertext]);
        assert_eq!(&mac[..8], tag, "command MAC mismatch");
        session.chain = mac;

        let icv = generate_icv(session.keys.enc(), session.counter, IcvDirection::Command);
        let mut buf = BytesMut::from(ciphertext);
        let plaintext = decrypt_data(&mut buf, session.keys.enc(), &icv)?;

        let response_icv = generate_icv(
            session.keys.enc(),
            session.counter + 1,
            IcvDirection::Response,
        );
        let mut buf = BytesMut::from(plaintext.as_ref());
        let ciphertext = encrypt_data(&mut buf, session.keys.enc(), &response_icv);

        let sw = hex!("9000");
        let rmac = cmac_full(session.keys.rmac(), &[&session.chain, &ciphertext, &sw]);
        session.chain = rmac;
        session.counter += 1;

        let mut tag = [0u8; 8];
        tag.copy_from_slice(&rmac[..8]);
        if self.tamper_next_mac {
            tag[0] ^= 0x01;
            self.tamper_next_mac = false;
        }

        let mut payload = BytesMut::from(ciphertext.as_ref());
        payload.extend_from_slice(&tag);
        payload.extend_from_slice(&sw);
        Ok(payload.freeze())
    }
}

#[derive(Clone)]
struct SharedCard(Rc<RefCell<CardSim>>);

impl CardTransport for SharedCard {
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes> {
        self.0.borrow_mut().transmit(command)
    }
}

fn build_certificate(root: &SigningKey, subject: &[u8], public_key: &PublicKey) -> Bytes {
    let point = public_key.to_encoded_point(false);
    let mut body = BytesMut::new();
    tlv::encode(tags::CERT_ENTITY, &hex!("A000000151"), &mut body);
    tlv::encode(tags::CERT_CA_KLOC, &CA_KEY_LOCATOR, &mut body);
    tlv::encode(tags::CERT_SUBJECT, subject, &mut body);
    tlv::encode(tags::CERT_PUBLIC_KEY, point.as_bytes(), &mut body);

    let mut hasher = Sha256::new();
    hasher.update(&body);
    let signature: Signature = root.sign_digest(hasher);

    let mut raw = BytesMut::from(&body[..]);
    tlv::encode(tags::CERT_SIGNATURE, signature.to_der().as_bytes(), &mut raw);
    raw.freeze()
}

fn setup() -> (
    LiteCardChannel<SharedCard, SoftwareKeyAgreement>,
    Rc<RefCell<CardSim>>,
) {
    let root = SigningKey::from_bytes(&[0x11u8; 32].into()).unwrap();
    let card_secret = SecretKey::from_slice(&[0x22; 32]).unwrap();
    let device_secret = SecretKey::from_slice(&[0x33; 32]).unwrap();

    let card_certificate = build_certificate(&root, b"lite-card-01", &card_secret.public_key());
    let device_certificate = build_certificate(&root, b"device-01", &device_secret.public_key());

    let sim = Rc::new(RefCell::new(CardSim {
        secret: card_secret,
        certificate: card_certificate,
        device_public: device_secret.public_key(),
        session: None,
        tamper_next_mac: false,
    }));

    let channel = LiteCardChannel::new(
        SharedCard(Rc::clone(&sim)),
        SoftwareKeyAgreement::new(device_secret),
        *root.verifying_key(),
        device_certificate,
    );
    (channel, sim)
}

#[test]
fn test_open_secure_channel() {
    let (mut channel, sim) = setup();
    assert!(!channel.is_open());

    channel.open_secure_channel().unwrap();
    assert!(channel.is_open());
    assert!(sim.borrow().session.is_some());

    let cert = channel.card_certificate().unwrap();
    assert_eq!(cert.subject(), Some(b"lite-card-01".as_slice()));
    assert_eq!(cert.ca_key_locator(), Some(CA_KEY_LOCATOR.as_slice()));

    // Idempotent
    channel.open_secure_channel().unwrap();
    assert!(channel.is_open());
}

#[test]
fn test_wrapped_echo_exchange() {
    let (mut channel, _sim) = setup();
    channel.open_secure_channel().unwrap();

    for payload in [
        hex!("C0FFEE").as_slice(),
        hex!("0102030405060708090A0B0C0D0E0F10").as_slice(),
        hex!("FF").as_slice(),
    ] {
        let command = Command::new_with_data(0x00, 0xD6, 0x00, 0x00, payload.to_vec());
        let response = channel.send_safe_apdu(&command).unwrap();
        assert!(response.is_success());
        assert_eq!(response.payload().as_deref(), Some(payload));
    }
    assert!(channel.is_open());
}

#[test]
fn test_empty_command_roundtrip() {
    let (mut channel, _sim) = setup();
    channel.open_secure_channel().unwrap();

    let response = channel
        .send_safe_apdu(&Command::new(0x00, 0xD6, 0x00, 0x00))
        .unwrap();
    assert!(response.is_success());
    assert!(response.payload().is_none());
}

#[test]
fn test_response_tamper_closes_channel() {
    let (mut channel, sim) = setup();
    channel.open_secure_channel().unwrap();

    sim.borrow_mut().tamper_next_mac = true;
    let command = Command::new_with_data(0x00, 0xD6, 0x00, 0x00, hex!("C0FFEE").to_vec());
    assert!(matches!(
        channel.send_safe_apdu(&command),
        Err(Error::ResponseMacMismatch)
    ));
    assert!(!channel.is_open());

    // The channel stays closed until explicitly reopened
    assert!(matches!(
        channel.send_safe_apdu(&command),
        Err(Error::ChannelClosed)
    ));

    // Reopening derives fresh keys and traffic flows again
    channel.open_secure_channel().unwrap();
    let response = channel.send_safe_apdu(&command).unwrap();
    assert_eq!(
        response.payload().as_deref(),
        Some(hex!("C0FFEE").as_slice())
    );
}

#[test]
fn test_select_invalidates_channel() {
    let (mut channel, _sim) = setup();
    channel.open_secure_channel().unwrap();

    channel
        .apdu(&hex!("00A4040005A000000151"), false)
        .unwrap();
    assert!(!channel.is_open());

    // A safe APDU transparently reopens the channel
    let response = channel.apdu(&hex!("00D6000003C0FFEE"), true).unwrap();
    assert_eq!(response.as_ref(), hex!("C0FFEE9000"));
    assert!(channel.is_open());
}

/// Known-answer scenario with every input pinned: fixed static and
/// ephemeral keys, a fixed card response, and expected byte constants for
/// the derived keys, one wrapped command, the unwrapped response, and the
/// chain value after the exchange. Catches systematic derivation errors
/// that dual-side tests cannot see.
#[test]
fn test_known_answer_exchange() {
    let root = SigningKey::from_bytes(&[0x11u8; 32].into()).unwrap();
    let card_secret = SecretKey::from_slice(&[0x22; 32]).unwrap();
    let device_secret = SecretKey::from_slice(&[0x33; 32]).unwrap();

    let raw = build_certificate(&root, b"lite-card-01", &card_secret.public_key());
    let certificate = Certificate::parse_and_verify(&raw, root.verifying_key()).unwrap();
    let agreement = SoftwareKeyAgreement::new(device_secret);

    let handshake = Handshake::with_ephemeral(SecretKey::from_slice(&[0x44; 32]).unwrap());
    let card_response = hex!(
        "5F494104D65A93977CAA3D1B081852FF57A79E465F1660577304BAEAD505DD3A"
        "48589CF350185E895372DF6221EA3A137557E473FDDB6755F05BD507C3C533FC"
        "E9C9128586104D86D1A5EC880B6E878A72EF87D964F0"
    );
    let session = handshake.open(&card_response, &certificate, &agreement).unwrap();

    assert_eq!(
        session.keys().dek().as_slice(),
        hex!("7D072BC996B1E5E8CEE43ED02242BAE8").as_slice()
    );
    assert_eq!(
        session.keys().enc().as_slice(),
        hex!("831202B143E864D860A1AA6DD24FDC59").as_slice()
    );
    assert_eq!(
        session.keys().mac().as_slice(),
        hex!("C9853766A4336735314F1F68B91C46BF").as_slice()
    );
    assert_eq!(
        session.keys().rmac().as_slice(),
        hex!("AB127F0373DBE1237DA63CB77C36C8A5").as_slice()
    );
    assert_eq!(
        session.mac_chain(),
        &hex!("4D86D1A5EC880B6E878A72EF87D964F0")
    );

    let mut wrapper = Scp03Wrapper::new(session);
    let command = Command::new_with_data(0x00, 0xD6, 0x00, 0x00, hex!("C0FFEE").to_vec());
    let wrapped = wrapper.wrap_command(&command).unwrap();
    assert_eq!(
        wrapped.to_bytes().unwrap().as_ref(),
        hex!("04D6000018242C82838AC06D671EF303B3D9A1EC7A58DB3AFF4E1E4C97")
    );

    let response = Response::from_bytes(&hex!(
        "B54A62B44DF00DFB19E00F95835FF7BCC31DD5AC92E0A1C09000"
    ))
    .unwrap();
    let unwrapped = wrapper.unwrap_response(&response).unwrap();
    assert!(unwrapped.is_success());
    assert_eq!(unwrapped.payload().as_deref(), Some(hex!("C0FFEE").as_slice()));
    assert_eq!(
        wrapper.session().mac_chain(),
        &hex!("C31DD5AC92E0A1C069E877772170C016")
    );
    assert_eq!(wrapper.session().counter(), 2);
}

#[test]
fn test_plain_apdu_does_not_open_channel() {
    let (mut channel, _sim) = setup();

    let response = channel.apdu(&hex!("80CA7F21"), false).unwrap();
    assert!(response.ends_with(&hex!("9000")));
    assert!(!channel.is_open());
}
