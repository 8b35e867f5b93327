//! Public key encryption used for the sub-payloads of a mixed packet and for
//! the transport envelopes between nodes
//!
//! Both schemes run an x25519 key agreement, derive a symmetric key with
//! SHA3-256 and seal with ChaCha20-Poly1305. Anonymous encryption uses a fresh
//! ephemeral key per message, so its nonce is fixed; authenticated encryption
//! uses the two static keys and a random nonce

use std::fmt::{Debug, Formatter, Result as FmtResult};

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use digest::Digest;
use rand::{CryptoRng, RngCore};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use sha3::Sha3_256;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::error::MixError;

/// The number of bytes in a key
pub const KEY_BYTES: usize = 32;
/// The number of bytes in an AEAD nonce
const NONCE_BYTES: usize = 12;
/// The number of bytes in an AEAD tag
const TAG_BYTES: usize = 16;
/// The ciphertext expansion of anonymous encryption
pub const ANON_OVERHEAD: usize = KEY_BYTES + TAG_BYTES;
/// The ciphertext expansion of authenticated encryption
pub const AUTH_OVERHEAD: usize = NONCE_BYTES + TAG_BYTES;

/// Domain separator for anonymous encryption keys
const ANON_LABEL: &[u8] = b"carma-anon-encrypt-v1";
/// Domain separator for authenticated encryption keys
const AUTH_LABEL: &[u8] = b"carma-auth-encrypt-v1";

/// Error message emitted when sealing fails
const ERR_SEAL: &str = "failed to seal payload";
/// Error message emitted when opening fails
const ERR_OPEN: &str = "failed to open payload";

// --------
// | Keys |
// --------

/// Raw key material, serialized as a hex string
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct KeyBytes(pub [u8; KEY_BYTES]);

impl Debug for KeyBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "KeyBytes({})", hex::encode(self.0))
    }
}

impl From<PublicKey> for KeyBytes {
    fn from(key: PublicKey) -> Self {
        KeyBytes(key.to_bytes())
    }
}

impl From<KeyBytes> for PublicKey {
    fn from(key: KeyBytes) -> Self {
        PublicKey::from(key.0)
    }
}

impl Serialize for KeyBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for KeyBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut bytes = [0u8; KEY_BYTES];
        hex::decode_to_slice(s, &mut bytes).map_err(DeError::custom)?;
        Ok(KeyBytes(bytes))
    }
}

/// A static x25519 keypair
#[derive(Clone)]
pub struct Keypair {
    /// The secret scalar
    secret: StaticSecret,
    /// The matching public key
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a keypair from its secret half
    pub fn from_secret(secret: KeyBytes) -> Self {
        let secret = StaticSecret::from(secret.0);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half of the keypair
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Export the secret half, used when writing configuration
    pub fn secret_bytes(&self) -> KeyBytes {
        KeyBytes(self.secret.to_bytes())
    }
}

impl Debug for Keypair {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Keypair").field("public", &hex::encode(self.public.as_bytes())).finish()
    }
}

// ------------------------
// | Anonymous Encryption |
// ------------------------

/// The size of an anonymous ciphertext for a plaintext of `n` bytes
pub const fn anon_encrypt_size(n: usize) -> usize {
    n + ANON_OVERHEAD
}

/// Encrypt to a recipient without revealing the sender
///
/// The output is the ephemeral public key followed by the sealed plaintext
pub fn anon_encrypt<R: RngCore + CryptoRng>(
    recipient: &PublicKey,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, MixError> {
    let ephemeral = EphemeralSecret::random_from_rng(rng);
    let ephemeral_pk = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let key = derive_key(ANON_LABEL, &shared, &ephemeral_pk, recipient);
    let ciphertext = seal(&key, &[0u8; NONCE_BYTES], plaintext)?;

    let mut out = Vec::with_capacity(anon_encrypt_size(plaintext.len()));
    out.extend_from_slice(ephemeral_pk.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an anonymous ciphertext addressed to `keypair`
pub fn anon_decrypt(keypair: &Keypair, ciphertext: &[u8]) -> Result<Vec<u8>, MixError> {
    if ciphertext.len() < ANON_OVERHEAD {
        return Err(MixError::Crypto("anonymous ciphertext too short".to_string()));
    }

    let (epk_bytes, sealed) = ciphertext.split_at(KEY_BYTES);
    let mut epk = [0u8; KEY_BYTES];
    epk.copy_from_slice(epk_bytes);
    let ephemeral_pk = PublicKey::from(epk);

    let shared = keypair.secret.diffie_hellman(&ephemeral_pk);
    if !shared.was_contributory() {
        return Err(MixError::Crypto("non-contributory ephemeral key".to_string()));
    }

    let key = derive_key(ANON_LABEL, &shared, &ephemeral_pk, &keypair.public);
    open(&key, &[0u8; NONCE_BYTES], sealed)
}

// ----------------------------
// | Authenticated Encryption |
// ----------------------------

/// The size of an authenticated ciphertext for a plaintext of `n` bytes
pub const fn auth_encrypt_size(n: usize) -> usize {
    n + AUTH_OVERHEAD
}

/// Encrypt from `sender` to `recipient`, binding both static keys
///
/// The output is the nonce followed by the sealed plaintext
pub fn auth_encrypt<R: RngCore + CryptoRng>(
    sender: &Keypair,
    recipient: &PublicKey,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, MixError> {
    let shared = sender.secret.diffie_hellman(recipient);
    let key = derive_key(AUTH_LABEL, &shared, &sender.public, recipient);

    let mut nonce = [0u8; NONCE_BYTES];
    rng.fill_bytes(&mut nonce);
    let ciphertext = seal(&key, &nonce, plaintext)?;

    let mut out = Vec::with_capacity(auth_encrypt_size(plaintext.len()));
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a ciphertext that `sender` addressed to `receiver`
pub fn auth_decrypt(
    receiver: &Keypair,
    sender: &PublicKey,
    ciphertext: &[u8],
) -> Result<Vec<u8>, MixError> {
    if ciphertext.len() < AUTH_OVERHEAD {
        return Err(MixError::Crypto("authenticated ciphertext too short".to_string()));
    }

    let shared = receiver.secret.diffie_hellman(sender);
    if !shared.was_contributory() {
        return Err(MixError::Crypto("non-contributory sender key".to_string()));
    }

    let key = derive_key(AUTH_LABEL, &shared, sender, &receiver.public);
    let (nonce, sealed) = ciphertext.split_at(NONCE_BYTES);
    open(&key, nonce, sealed)
}

// -----------
// | Helpers |
// -----------

/// Derive a symmetric key from an agreement and the two public keys involved
fn derive_key(
    label: &[u8],
    shared: &SharedSecret,
    first: &PublicKey,
    second: &PublicKey,
) -> Zeroizing<[u8; KEY_BYTES]> {
    let digest = Sha3_256::new()
        .chain_update(label)
        .chain_update(shared.as_bytes())
        .chain_update(first.as_bytes())
        .chain_update(second.as_bytes())
        .finalize();

    let mut key = Zeroizing::new([0u8; KEY_BYTES]);
    key.copy_from_slice(&digest);
    key
}

/// Seal a plaintext under the given key and nonce
fn seal(key: &[u8; KEY_BYTES], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, MixError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| MixError::Crypto(ERR_SEAL.to_string()))
}

/// Open a sealed payload under the given key and nonce
fn open(key: &[u8; KEY_BYTES], nonce: &[u8], sealed: &[u8]) -> Result<Vec<u8>, MixError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| MixError::Crypto(ERR_OPEN.to_string()))
}
