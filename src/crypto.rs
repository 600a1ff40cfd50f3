use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{RegistryError, RegistryResult};
use crate::types::Hash256;

/// Magic prefix mixed into legacy string-preimage signatures so they can
/// never collide with transaction or block signatures.
const MESSAGE_MAGIC: &[u8] = b"Service Node Signed Message:\n";

/// Which preimage a signature commits to. The chain-level switch picks the
/// scheme; the choice is recorded next to cached verifications so replays
/// stay bit-exact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureScheme {
    /// Sign the 32-byte digest directly.
    #[default]
    Hash,
    /// Sign the double-SHA256 of a magic-prefixed readable preimage.
    Message,
}

/// Double SHA-256, the canonical hash of every wire payload and score.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Hash256(out)
}

/// Hash of a bincode-encoded value; message identities on the wire.
pub fn hash_payload<T: Serialize>(value: &T) -> RegistryResult<Hash256> {
    let encoded = bincode::serialize(value)?;
    Ok(sha256d(&encoded))
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn public_key_from_bytes(bytes: &[u8; 32]) -> RegistryResult<PublicKey> {
    PublicKey::from_bytes(bytes)
        .map_err(|err| RegistryError::InvalidSignature(format!("invalid public key: {err}")))
}

pub fn sign_hash(keypair: &Keypair, hash: &Hash256) -> Vec<u8> {
    keypair.sign(hash.as_bytes()).to_bytes().to_vec()
}

pub fn verify_hash(pubkey: &[u8; 32], hash: &Hash256, signature: &[u8]) -> RegistryResult<()> {
    let public = public_key_from_bytes(pubkey)?;
    let signature = Signature::from_bytes(signature)
        .map_err(|err| RegistryError::InvalidSignature(format!("malformed signature: {err}")))?;
    public
        .verify(hash.as_bytes(), &signature)
        .map_err(|err| RegistryError::InvalidSignature(format!("hash signature: {err}")))
}

fn legacy_digest(message: &str) -> Hash256 {
    let mut preimage = Vec::with_capacity(MESSAGE_MAGIC.len() + message.len());
    preimage.extend_from_slice(MESSAGE_MAGIC);
    preimage.extend_from_slice(message.as_bytes());
    sha256d(&preimage)
}

pub fn sign_message(keypair: &Keypair, message: &str) -> Vec<u8> {
    let digest = legacy_digest(message);
    keypair.sign(digest.as_bytes()).to_bytes().to_vec()
}

pub fn verify_message(pubkey: &[u8; 32], message: &str, signature: &[u8]) -> RegistryResult<()> {
    let digest = legacy_digest(message);
    let public = public_key_from_bytes(pubkey)?;
    let signature = Signature::from_bytes(signature)
        .map_err(|err| RegistryError::InvalidSignature(format!("malformed signature: {err}")))?;
    public
        .verify(digest.as_bytes(), &signature)
        .map_err(|err| RegistryError::InvalidSignature(format!("message signature: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_signatures_verify_and_reject_tampering() {
        let keypair = generate_keypair();
        let hash = sha256d(b"challenge");
        let sig = sign_hash(&keypair, &hash);
        verify_hash(&keypair.public.to_bytes(), &hash, &sig).expect("valid signature");

        let other = sha256d(b"different");
        assert!(verify_hash(&keypair.public.to_bytes(), &other, &sig).is_err());
    }

    #[test]
    fn message_signatures_use_the_magic_prefix() {
        let keypair = generate_keypair();
        let sig = sign_message(&keypair, "10.1.2.3:10001 42");
        verify_message(&keypair.public.to_bytes(), "10.1.2.3:10001 42", &sig)
            .expect("valid signature");
        assert!(verify_message(&keypair.public.to_bytes(), "10.1.2.3:10001 43", &sig).is_err());
        // a raw hash signature over the same bytes must not verify
        let raw = sign_hash(&keypair, &sha256d(b"10.1.2.3:10001 42"));
        assert!(verify_message(&keypair.public.to_bytes(), "10.1.2.3:10001 42", &raw).is_err());
    }
}
