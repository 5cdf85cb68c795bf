//! # Chunked Asymmetric Encryption
//!
//! Encrypts a payload to the peer's public key in fixed-size blocks.
//!
//! A key block holds `key_block_bits / 8` bytes. Each block carries a 4-byte
//! random salt, leaving `key_block_bits / 8 - 4` bytes of plaintext per chunk.
//! A 1024-bit key block therefore carries 124 plaintext bytes: a 300-byte
//! payload becomes three chunks of 124, 124 and 52 bytes.
//!
//! ## Chunk Format
//! ```text
//! [Length(2, BE)] [EphemeralPublic(32)] [Sealed(Salt(4) + Plain(<= block)) + Tag(16)]
//! ```
//! Each chunk is sealed with a fresh X25519 key agreement against the
//! recipient's static key; the SHA-256 of the shared secret and both public
//! keys keys a ChaCha20-Poly1305 AEAD. Every chunk has its own key, so the
//! nonce is fixed.
//!
//! ## Failure
//! A length header that runs past the buffer, a chunk too short to hold its
//! overhead, or a chunk that fails authentication yields
//! [`ProtocolError::Garbled`]. Nothing is recovered from a garbled payload.

use crate::error::{constants, ProtocolError, Result};
use crate::translator::{Translator, TranslatorFactory};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Salt bytes prefixed to every block before sealing
pub const SALT_LEN: usize = 4;
/// Length header in front of every chunk
pub const HEADER_LEN: usize = 2;
const EPHEMERAL_LEN: usize = 32;
const TAG_LEN: usize = 16;
const FIXED_NONCE: [u8; 12] = [0u8; 12];

/// Plaintext bytes carried per chunk for a key block size
pub fn block_size(key_block_bits: usize) -> Result<usize> {
    let block_bytes = key_block_bits / 8;
    if key_block_bits % 8 != 0 || block_bytes <= SALT_LEN {
        return Err(ProtocolError::ConfigError(format!(
            "key block of {key_block_bits} bits leaves no room for payload"
        )));
    }
    if block_bytes + EPHEMERAL_LEN + TAG_LEN > usize::from(u16::MAX) {
        return Err(ProtocolError::ConfigError(format!(
            "key block of {key_block_bits} bits overflows the chunk length header"
        )));
    }
    Ok(block_bytes - SALT_LEN)
}

/// A static X25519 key pair
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(mut bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }
}

fn chunk_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"peerlink-chunk");
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

pub struct EncryptionTranslator {
    block_size: usize,
    local: Arc<KeyPair>,
    remote_public: PublicKey,
    /// Salted block being sealed; reused between chunks
    scratch: Vec<u8>,
}

impl EncryptionTranslator {
    /// `local` opens inbound chunks, `remote_public` seals outbound ones
    pub fn new(key_block_bits: usize, local: Arc<KeyPair>, remote_public: PublicKey) -> Result<Self> {
        let block_size = block_size(key_block_bits)?;
        Ok(Self {
            block_size,
            local,
            remote_public,
            scratch: Vec::with_capacity(block_size + SALT_LEN),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn seal(&mut self, block: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.scratch.clear();
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        self.scratch.extend_from_slice(&salt);
        self.scratch.extend_from_slice(block);

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.remote_public);
        let mut key = chunk_key(shared.as_bytes(), &ephemeral_public, &self.remote_public);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();

        let sealed = cipher
            .encrypt(Nonce::from_slice(&FIXED_NONCE), self.scratch.as_slice())
            .map_err(|_| ProtocolError::EncryptionFailure)?;
        self.scratch.zeroize();

        let chunk_len = EPHEMERAL_LEN + sealed.len();
        // block_size() guarantees this fits.
        out.extend_from_slice(&(chunk_len as u16).to_be_bytes());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&sealed);
        Ok(())
    }

    fn open(&self, chunk: &[u8]) -> Result<Vec<u8>> {
        if chunk.len() < EPHEMERAL_LEN + TAG_LEN + SALT_LEN {
            return Err(ProtocolError::Garbled(constants::ERR_CHUNK_SALT.to_string()));
        }
        let (ephemeral_bytes, sealed) = chunk.split_at(EPHEMERAL_LEN);
        let mut ephemeral = [0u8; EPHEMERAL_LEN];
        ephemeral.copy_from_slice(ephemeral_bytes);
        let ephemeral_public = PublicKey::from(ephemeral);

        let shared = self.local.secret.diffie_hellman(&ephemeral_public);
        let mut key = chunk_key(shared.as_bytes(), &ephemeral_public, &self.local.public);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();

        let mut salted = cipher
            .decrypt(Nonce::from_slice(&FIXED_NONCE), sealed)
            .map_err(|_| ProtocolError::Garbled(constants::ERR_CHUNK_OPEN.to_string()))?;
        let plain = salted[SALT_LEN..].to_vec();
        salted.zeroize();
        Ok(plain)
    }
}

impl Translator for EncryptionTranslator {
    fn name(&self) -> &'static str {
        "encryption"
    }

    fn outbound(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let chunks = data.len().div_ceil(self.block_size);
        let per_chunk = HEADER_LEN + EPHEMERAL_LEN + SALT_LEN + TAG_LEN;
        let mut out = Vec::with_capacity(data.len() + chunks * per_chunk);
        for block in data.chunks(self.block_size) {
            self.seal(block, &mut out)?;
        }
        Ok(out)
    }

    fn inbound(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len());
        let mut pos = 0;
        while pos < data.len() {
            let header = data
                .get(pos..pos + HEADER_LEN)
                .ok_or_else(|| ProtocolError::Garbled(constants::ERR_CHUNK_OVERRUN.to_string()))?;
            let len = usize::from(u16::from_be_bytes([header[0], header[1]]));
            pos += HEADER_LEN;
            let chunk = data
                .get(pos..pos + len)
                .ok_or_else(|| ProtocolError::Garbled(constants::ERR_CHUNK_OVERRUN.to_string()))?;
            pos += len;
            out.extend_from_slice(&self.open(chunk)?);
        }
        Ok(out)
    }
}

/// Builds [`EncryptionTranslator`]s sharing one key configuration
#[derive(Debug, Clone)]
pub struct EncryptionFactory {
    key_block_bits: usize,
    local: Arc<KeyPair>,
    remote_public: PublicKey,
}

impl EncryptionFactory {
    pub fn new(key_block_bits: usize, local: Arc<KeyPair>, remote_public: PublicKey) -> Result<Self> {
        block_size(key_block_bits)?;
        Ok(Self {
            key_block_bits,
            local,
            remote_public,
        })
    }
}

impl TranslatorFactory for EncryptionFactory {
    fn create(&self) -> Result<Box<dyn Translator>> {
        Ok(Box::new(EncryptionTranslator::new(
            self.key_block_bits,
            self.local.clone(),
            self.remote_public,
        )?))
    }
}
