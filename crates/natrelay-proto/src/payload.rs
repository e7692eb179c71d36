//! Optional payload hardening: key exchange, GZip compression and AES-128-GCM
//!
//! Every non-HANDSHAKE message with a non-empty payload is wrapped in a
//! one-byte envelope:
//!
//! ```text
//! [flags: u8][content]
//!   bit0 = content is GZip-compressed
//!   bit1 = content is AES-128-GCM encrypted, content = nonce(12) ++ ciphertext
//! ```
//!
//! On send the payload is compressed first, then encrypted. The settings are
//! fixed once per control connection by the HANDSHAKE exchange.

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::MAX_FRAME_SIZE;

const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_ENCRYPTED: u8 = 0b10;
const KNOWN_FLAGS: u8 = FLAG_COMPRESSED | FLAG_ENCRYPTED;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 16;
const PUBLIC_KEY_SIZE: usize = 32;
const WRAP_INFO: &[u8] = b"natrelay handshake key wrap";

/// Upper bound for a decompressed payload
const MAX_DECOMPRESSED_SIZE: usize = 4 * MAX_FRAME_SIZE;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Decompressed payload exceeds {0} bytes")]
    DecompressedTooLarge(usize),

    #[error("Payload cipher failure")]
    Cipher,

    #[error("Encrypted payload received but no session key was negotiated")]
    MissingKey,

    #[error("Unencrypted payload on an encrypted connection")]
    Unencrypted,

    #[error("Unknown payload flags: {0:#04x}")]
    UnknownFlags(u8),

    #[error("Encrypted payload shorter than its nonce")]
    Truncated,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Malformed handshake: {0}")]
    Malformed(String),

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Session key unwrap failed")]
    Cipher,
}

/// Feature bits negotiated during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features {
    pub compress: bool,
    pub encrypt: bool,
}

impl Features {
    fn to_byte(self) -> u8 {
        let mut bits = 0;
        if self.compress {
            bits |= FLAG_COMPRESSED;
        }
        if self.encrypt {
            bits |= FLAG_ENCRYPTED;
        }
        bits
    }

    fn from_byte(bits: u8) -> Self {
        Self {
            compress: bits & FLAG_COMPRESSED != 0,
            encrypt: bits & FLAG_ENCRYPTED != 0,
        }
    }
}

/// Per-connection payload transform
#[derive(Clone, Default)]
pub struct PayloadCodec {
    compress: bool,
    cipher: Option<Aes128Gcm>,
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("compress", &self.compress)
            .field("encrypt", &self.cipher.is_some())
            .finish()
    }
}

impl PayloadCodec {
    /// No compression, no encryption
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn new(compress: bool, key: Option<[u8; KEY_SIZE]>) -> Self {
        Self {
            compress,
            cipher: key.map(|k| Aes128Gcm::new(&k.into())),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compress
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Wrap an outbound payload in the envelope
    pub fn seal(&self, data: Bytes) -> Result<Bytes, PayloadError> {
        if data.is_empty() {
            return Ok(data);
        }

        let mut flags = 0u8;
        let mut content = data.to_vec();

        if self.compress {
            let mut encoder = GzEncoder::new(Vec::with_capacity(content.len()), Compression::fast());
            encoder.write_all(&content)?;
            content = encoder.finish()?;
            flags |= FLAG_COMPRESSED;
        }

        if let Some(cipher) = &self.cipher {
            let mut nonce = [0u8; NONCE_SIZE];
            OsRng.fill_bytes(&mut nonce);
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce), content.as_slice())
                .map_err(|_| PayloadError::Cipher)?;

            content = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
            content.extend_from_slice(&nonce);
            content.extend_from_slice(&ciphertext);
            flags |= FLAG_ENCRYPTED;
        }

        let mut out = BytesMut::with_capacity(1 + content.len());
        out.put_u8(flags);
        out.extend_from_slice(&content);
        Ok(out.freeze())
    }

    /// Unwrap an inbound envelope. Flags are read per message, so a peer
    /// that chose not to compress a small payload is still understood.
    /// Once a key is negotiated every non-empty payload must be encrypted.
    pub fn open(&self, data: Bytes) -> Result<Bytes, PayloadError> {
        if data.is_empty() {
            return Ok(data);
        }

        let flags = data[0];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(PayloadError::UnknownFlags(flags));
        }
        if self.cipher.is_some() && flags & FLAG_ENCRYPTED == 0 {
            return Err(PayloadError::Unencrypted);
        }
        let mut content = data.slice(1..);

        if flags & FLAG_ENCRYPTED != 0 {
            let cipher = self.cipher.as_ref().ok_or(PayloadError::MissingKey)?;
            if content.len() < NONCE_SIZE {
                return Err(PayloadError::Truncated);
            }
            let (nonce, ciphertext) = content.split_at(NONCE_SIZE);
            let plaintext = cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| PayloadError::Cipher)?;
            content = Bytes::from(plaintext);
        }

        if flags & FLAG_COMPRESSED != 0 {
            let mut decoded = Vec::new();
            let mut decoder = GzDecoder::new(&content[..]).take(MAX_DECOMPRESSED_SIZE as u64 + 1);
            decoder.read_to_end(&mut decoded)?;
            if decoded.len() > MAX_DECOMPRESSED_SIZE {
                return Err(PayloadError::DecompressedTooLarge(MAX_DECOMPRESSED_SIZE));
            }
            content = Bytes::from(decoded);
        }

        Ok(content)
    }
}

fn wrap_cipher(
    secret: EphemeralSecret,
    peer: &PublicKey,
    client_pub: &PublicKey,
    server_pub: &PublicKey,
) -> Result<Aes128Gcm, HandshakeError> {
    let shared = secret.diffie_hellman(peer);

    let mut salt = [0u8; 2 * PUBLIC_KEY_SIZE];
    salt[..PUBLIC_KEY_SIZE].copy_from_slice(client_pub.as_bytes());
    salt[PUBLIC_KEY_SIZE..].copy_from_slice(server_pub.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut wrap_key = [0u8; KEY_SIZE];
    hk.expand(WRAP_INFO, &mut wrap_key)
        .map_err(|_| HandshakeError::KeyDerivation)?;

    Ok(Aes128Gcm::new(&wrap_key.into()))
}

fn read_public_key(data: &[u8]) -> Result<PublicKey, HandshakeError> {
    let bytes: [u8; PUBLIC_KEY_SIZE] = data
        .get(..PUBLIC_KEY_SIZE)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| HandshakeError::Malformed("public key truncated".to_string()))?;
    Ok(PublicKey::from(bytes))
}

/// Client half of the handshake.
///
/// `hello()` is sent as HANDSHAKE data; the server's HANDSHAKE reply is then
/// passed to [`ClientHandshake::finish`].
pub struct ClientHandshake {
    features: Features,
    secret: EphemeralSecret,
    public: PublicKey,
}

impl ClientHandshake {
    pub fn new(compress: bool, encrypt: bool) -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            features: Features { compress, encrypt },
            secret,
            public,
        }
    }

    pub fn features(&self) -> Features {
        self.features
    }

    /// `[features][x25519 public key]`
    pub fn hello(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + PUBLIC_KEY_SIZE);
        buf.put_u8(self.features.to_byte());
        buf.extend_from_slice(self.public.as_bytes());
        buf.freeze()
    }

    pub fn finish(self, reply: &[u8]) -> Result<PayloadCodec, HandshakeError> {
        let (&bits, rest) = reply
            .split_first()
            .ok_or_else(|| HandshakeError::Malformed("empty reply".to_string()))?;
        let features = Features::from_byte(bits);

        if !features.encrypt {
            return Ok(PayloadCodec::new(features.compress, None));
        }

        let server_pub = read_public_key(rest)?;
        let rest = &rest[PUBLIC_KEY_SIZE..];
        if rest.len() < NONCE_SIZE {
            return Err(HandshakeError::Malformed("nonce truncated".to_string()));
        }
        let (nonce, wrapped) = rest.split_at(NONCE_SIZE);

        let client_pub = self.public;
        let wrap = wrap_cipher(self.secret, &server_pub, &client_pub, &server_pub)?;
        let key = wrap
            .decrypt(Nonce::from_slice(nonce), wrapped)
            .map_err(|_| HandshakeError::Cipher)?;
        let key: [u8; KEY_SIZE] = key
            .as_slice()
            .try_into()
            .map_err(|_| HandshakeError::Malformed("session key length".to_string()))?;

        Ok(PayloadCodec::new(features.compress, Some(key)))
    }
}

/// Server half of the handshake
pub struct ServerHandshake;

impl ServerHandshake {
    /// Answer a client hello.
    ///
    /// Returns the codec to use for the rest of the connection and the
    /// HANDSHAKE reply data. The server generates the AES-128 session key.
    pub fn respond(hello: &[u8]) -> Result<(PayloadCodec, Bytes), HandshakeError> {
        let (&bits, rest) = hello
            .split_first()
            .ok_or_else(|| HandshakeError::Malformed("empty hello".to_string()))?;
        if bits & !KNOWN_FLAGS != 0 {
            return Err(HandshakeError::Malformed(format!(
                "unknown feature bits {:#04x}",
                bits
            )));
        }
        let features = Features::from_byte(bits);
        let client_pub = read_public_key(rest)?;

        if !features.encrypt {
            let reply = Bytes::copy_from_slice(&[features.to_byte()]);
            return Ok((PayloadCodec::new(features.compress, None), reply));
        }

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let server_pub = PublicKey::from(&secret);
        let wrap = wrap_cipher(secret, &client_pub, &client_pub, &server_pub)?;

        let mut session_key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut session_key);
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let wrapped = wrap
            .encrypt(Nonce::from_slice(&nonce), session_key.as_slice())
            .map_err(|_| HandshakeError::Cipher)?;

        let mut reply = BytesMut::with_capacity(1 + PUBLIC_KEY_SIZE + NONCE_SIZE + wrapped.len());
        reply.put_u8(features.to_byte());
        reply.extend_from_slice(server_pub.as_bytes());
        reply.extend_from_slice(&nonce);
        reply.extend_from_slice(&wrapped);

        Ok((
            PayloadCodec::new(features.compress, Some(session_key)),
            reply.freeze(),
        ))
    }
}
