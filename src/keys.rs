//! Keys, signatures and the process-wide key store.
//!
//! Signatures are ECDSA over P-384 with a SHA-512 prehash. Nonces are derived
//! deterministically (RFC 6979), so signing the same bytes with the same key
//! always yields the same signature.

use std::{cmp::Ordering, collections::BTreeMap, fmt, hash::Hash, str::FromStr, sync::Arc};

use p384::ecdsa::{
    self,
    signature::hazmat::{PrehashSigner, PrehashVerifier},
};
use parking_lot::RwLock;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use tracing::debug;

/// Size of a serialized signature: `r || s`, each a P-384 scalar.
pub const SIGNATURE_LENGTH: usize = 96;

/// Errors from parsing or using keys and signatures.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid hex encoding: {0}")]
    Encoding(#[from] data_encoding::DecodeError),
    #[error("invalid key material")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("key {0} is already present")]
    Duplicate(KeyHash),
    #[error("signing failed")]
    Signing,
    #[error("no private key for {0}")]
    UnknownKey(KeyHash),
}

fn digest(msg: &[u8]) -> impl AsRef<[u8]> {
    Sha512::digest(msg)
}

/// A private signing key.
#[derive(Clone)]
pub struct PrivateKey(ecdsa::SigningKey);

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({})", self.public_key().fmt_short())
    }
}

impl PrivateKey {
    /// Generate a new key from the operating system's random source.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand_core::OsRng)
    }

    /// Generate a new key from `rng`.
    pub fn generate_with<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self(ecdsa::SigningKey::random(rng))
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(ecdsa::VerifyingKey::from(&self.0))
    }

    /// Sign `msg`.
    pub fn sign(&self, msg: &[u8]) -> Result<Signature, KeyError> {
        let digest = digest(msg);
        let signature: ecdsa::Signature = self
            .0
            .sign_prehash(digest.as_ref())
            .map_err(|_| KeyError::Signing)?;
        Ok(Signature::from_ecdsa(&signature))
    }

    /// The secret scalar as bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    /// Parse a secret scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        ecdsa::SigningKey::from_slice(bytes)
            .map(Self)
            .map_err(|_| KeyError::InvalidKey)
    }

    /// Hex text of the secret scalar.
    pub fn to_text(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.to_bytes())
    }
}

impl FromStr for PrivateKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE.decode(s.as_bytes())?;
        Self::from_bytes(&bytes)
    }
}

/// A public verifying key.
///
/// Printed as the hex of its compressed SEC1 encoding. Equality, ordering
/// and hashing all go through that encoding.
#[derive(Clone)]
pub struct PublicKey(ecdsa::VerifyingKey);

impl PublicKey {
    /// Compressed SEC1 encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }

    /// Parse a SEC1 encoded point, compressed or not.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| KeyError::InvalidKey)
    }

    /// Returns true iff `signature` is a valid signature over `msg` by this key.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> bool {
        let Ok(signature) = ecdsa::Signature::from_slice(&signature.0) else {
            return false;
        };
        let digest = digest(msg);
        self.0.verify_prehash(digest.as_ref(), &signature).is_ok()
    }

    /// Content hash of the public key, used to address it in the [`KeyStore`].
    pub fn key_hash(&self) -> KeyHash {
        KeyHash(*blake3::hash(&self.to_bytes()).as_bytes())
    }

    /// Hex text of the compressed encoding.
    pub fn to_text(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.to_bytes())
    }

    /// The first 10 hex characters of the key hash.
    pub fn fmt_short(&self) -> String {
        let mut text = self.key_hash().to_string();
        text.truncate(10);
        text
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fmt_short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE.decode(s.as_bytes())?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_text())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A detached signature, `r || s`.
///
/// Signatures compare by their printed text. The printed text is fixed-width
/// lowercase hex of the raw bytes, so byte order and text order agree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature([u8; SIGNATURE_LENGTH]);

impl Signature {
    fn from_ecdsa(signature: &ecdsa::Signature) -> Self {
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes.copy_from_slice(&signature.to_bytes());
        Self(bytes)
    }

    /// Parse raw `r || s` bytes. Fails unless both scalars are in range.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let signature =
            ecdsa::Signature::from_slice(bytes).map_err(|_| KeyError::InvalidSignature)?;
        Ok(Self::from_ecdsa(&signature))
    }

    /// Raw `r || s` bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    /// The printed text this signature is ordered by.
    pub fn to_text(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_text();
        write!(f, "Signature({})", &text[..10])
    }
}

impl FromStr for Signature {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE.decode(s.as_bytes())?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_text())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Sort by printed text and remove duplicates.
pub fn order_signatures(mut signatures: Vec<Signature>) -> Vec<Signature> {
    signatures.sort_unstable();
    unique_signatures(&mut signatures);
    signatures
}

/// Remove adjacent duplicates from an already sorted list.
pub fn unique_signatures(signatures: &mut Vec<Signature>) {
    signatures.dedup();
}

/// Content hash of a [`PublicKey`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyHash([u8; 32]);

impl KeyHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({self})")
    }
}

/// Keys as they appear in the configuration file, as hex text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    pub private_keys: Vec<String>,
    pub public_keys: Vec<String>,
}

/// Private and public keys shared by all components of a node.
///
/// Every public key in the store is trusted. Adding a private key also adds
/// its public key.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    inner: Arc<RwLock<KeyStoreInner>>,
}

#[derive(Debug, Default)]
struct KeyStoreInner {
    private: BTreeMap<KeyHash, PrivateKey>,
    public: BTreeMap<KeyHash, PublicKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from configured key text.
    ///
    /// A public key listed after its private key is accepted silently.
    pub fn from_config(config: &KeyStoreConfig) -> Result<Self, KeyError> {
        let store = Self::new();
        for text in &config.private_keys {
            store.put_private_key(text.parse()?)?;
        }
        for text in &config.public_keys {
            match store.put_public_key(text.parse()?) {
                Ok(_) => {}
                Err(KeyError::Duplicate(hash)) => debug!(%hash, "public key already in store"),
                Err(err) => return Err(err),
            }
        }
        Ok(store)
    }

    /// Add a private key and its public key. Rejects keys already present.
    pub fn put_private_key(&self, key: PrivateKey) -> Result<KeyHash, KeyError> {
        let public = key.public_key();
        let hash = public.key_hash();
        let mut inner = self.inner.write();
        if inner.private.contains_key(&hash) {
            return Err(KeyError::Duplicate(hash));
        }
        inner.private.insert(hash, key);
        inner.public.entry(hash).or_insert(public);
        Ok(hash)
    }

    /// Add a public key to the trust set. Rejects keys already present.
    pub fn put_public_key(&self, key: PublicKey) -> Result<KeyHash, KeyError> {
        let hash = key.key_hash();
        let mut inner = self.inner.write();
        if inner.public.contains_key(&hash) {
            return Err(KeyError::Duplicate(hash));
        }
        inner.public.insert(hash, key);
        Ok(hash)
    }

    pub fn private_key(&self, hash: &KeyHash) -> Option<PrivateKey> {
        self.inner.read().private.get(hash).cloned()
    }

    pub fn public_key(&self, hash: &KeyHash) -> Option<PublicKey> {
        self.inner.read().public.get(hash).cloned()
    }

    /// All private keys, ordered by key hash.
    pub fn private_keys(&self) -> Vec<PrivateKey> {
        self.inner.read().private.values().cloned().collect()
    }

    /// The trust set: all public keys, ordered by key hash.
    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.inner.read().public.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify() {
        let key = PrivateKey::generate();
        let other = PrivateKey::generate();
        let sig = key.sign(b"hello").unwrap();
        assert!(key.public_key().verify(b"hello", &sig));
        assert!(!key.public_key().verify(b"hullo", &sig));
        assert!(!other.public_key().verify(b"hello", &sig));
    }

    #[test]
    fn signatures_are_deterministic() {
        let key = PrivateKey::generate();
        assert_eq!(key.sign(b"a").unwrap(), key.sign(b"a").unwrap());
        assert_ne!(key.sign(b"a").unwrap(), key.sign(b"b").unwrap());
    }

    #[test]
    fn seeded_generation() {
        use rand::{SeedableRng, rngs::StdRng};

        let a = PrivateKey::generate_with(&mut StdRng::seed_from_u64(7));
        let b = PrivateKey::generate_with(&mut StdRng::seed_from_u64(7));
        let c = PrivateKey::generate_with(&mut StdRng::seed_from_u64(8));
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn text_roundtrip() {
        let key = PrivateKey::generate();
        let restored: PrivateKey = key.to_text().parse().unwrap();
        assert_eq!(key.public_key(), restored.public_key());

        let public = key.public_key();
        let restored: PublicKey = public.to_text().parse().unwrap();
        assert_eq!(public, restored);

        let sig = key.sign(b"text").unwrap();
        let restored: Signature = sig.to_text().parse().unwrap();
        assert_eq!(sig, restored);
        assert_eq!(sig.to_text().len(), SIGNATURE_LENGTH * 2);
    }

    #[test]
    fn malformed_signature_text() {
        assert!("zz".parse::<Signature>().is_err());
        assert!("abcd".parse::<Signature>().is_err());
        let zeros = "0".repeat(SIGNATURE_LENGTH * 2);
        assert!(zeros.parse::<Signature>().is_err());
    }

    #[test]
    fn order_signatures_sorts_by_text() {
        let key = PrivateKey::generate();
        let sigs: Vec<_> = ["a", "b", "c", "a", "b"]
            .iter()
            .map(|m| key.sign(m.as_bytes()).unwrap())
            .collect();
        let ordered = order_signatures(sigs);
        assert_eq!(ordered.len(), 3);
        let texts: Vec<_> = ordered.iter().map(|s| s.to_text()).collect();
        let mut sorted = texts.clone();
        sorted.sort();
        assert_eq!(texts, sorted);
    }

    #[test]
    fn key_store_rejects_duplicates() {
        let store = KeyStore::new();
        let key = PrivateKey::generate();
        let hash = store.put_private_key(key.clone()).unwrap();
        assert!(matches!(
            store.put_private_key(key.clone()),
            Err(KeyError::Duplicate(h)) if h == hash
        ));
        assert!(matches!(
            store.put_public_key(key.public_key()),
            Err(KeyError::Duplicate(_))
        ));
        assert_eq!(store.public_key(&hash), Some(key.public_key()));
        assert!(store.private_key(&hash).is_some());
        assert_eq!(store.public_keys().len(), 1);
    }

    #[test]
    fn key_store_from_config() {
        let private = PrivateKey::generate();
        let trusted = PrivateKey::generate().public_key();
        let config = KeyStoreConfig {
            private_keys: vec![private.to_text()],
            public_keys: vec![trusted.to_text(), private.public_key().to_text()],
        };
        let store = KeyStore::from_config(&config).unwrap();
        assert_eq!(store.private_keys().len(), 1);
        assert_eq!(store.public_keys().len(), 2);
        assert!(store.public_key(&trusted.key_hash()).is_some());

        let bad = KeyStoreConfig {
            private_keys: vec!["not hex".into()],
            public_keys: vec![],
        };
        assert!(KeyStore::from_config(&bad).is_err());
    }
}
