//! Terminal identity: Ed25519 key pairs, challenge signatures, derived terminal ids.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Message signed by a terminal to prove possession of its realm key at admission.
pub const CHALLENGE: &[u8] = b"";

/// Realm admin public key (32 bytes, Ed25519). Hex on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex_bytes")] [u8; 32]);

/// Detached Ed25519 signature (64 bytes). Hex on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex_bytes")] [u8; 64]);

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        v: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(d)?;
        super::decode_fixed::<N>(&s).map_err(serde::de::Error::custom)
    }
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], KeyError> {
    let buf = hex::decode(s.trim()).map_err(|_| KeyError::InvalidHex)?;
    buf.try_into().map_err(|_| KeyError::InvalidLength(N))
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<32>(s).map(PublicKey)
    }
}

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Signature {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<64>(s).map(Signature)
    }
}

/// Ed25519 keypair. The secret half never leaves the owning process.
pub struct Keypair {
    signing: SigningKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restore a keypair from its 32-byte secret seed, hex encoded.
    pub fn from_secret_hex(secret: &str) -> Result<Self, KeyError> {
        let seed = decode_fixed::<32>(secret)?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Hex of the secret seed, for writing into configuration.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }

    /// Signature presented in the admission handshake.
    pub fn sign_challenge(&self) -> Signature {
        self.sign(CHALLENGE)
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self::from_signing_key(self.signing.clone())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public.to_string())
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `message` by `public_key`. Malformed keys verify as false.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key.as_bytes()) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    key.verify(message, &sig).is_ok()
}

/// Stable id for the `generation`-th standby instance of `base`.
/// Distinct generations never collide with each other or with `base` itself.
pub fn derive_terminal_id(base: &str, generation: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base.as_bytes());
    hasher.update(generation.to_le_bytes());
    let digest = hasher.finalize();
    format!("{}/{}", base, hex::encode(&digest[..4]))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid hex")]
    InvalidHex,
    #[error("expected {0} bytes")]
    InvalidLength(usize),
}
