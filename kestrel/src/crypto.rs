// Copyright (c) 2025 Kestrel Foundation

//! Hashing and Schnorr signatures.
//!
//! Every protocol hash is a 64-byte SHA-512 digest with an explicit
//! domain-separation prefix. Signatures are Schnorr over Ristretto;
//! block headers additionally use an aggregatable variant whose
//! challenge binds the signed content so shares add component-wise.

use curve25519_dalek::{
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
    traits::Identity,
};
use rand::RngCore;
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};
use sha2::{Digest, Sha512};
use std::fmt;

/// Size in bytes of every protocol hash.
pub const HASH_SIZE: usize = 64;

// Domain separation prefixes.
const DOMAIN_GENERIC: &[u8] = b"kestrel.hash.v1";
const DOMAIN_NONCE: &[u8] = b"kestrel.sig.nonce.v1";
const DOMAIN_CHALLENGE: &[u8] = b"kestrel.sig.challenge.v1";
const DOMAIN_MULTISIG: &[u8] = b"kestrel.block.multisig.v1";

/// A 64-byte SHA-512 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    /// Hash raw bytes under the generic domain.
    pub fn digest(data: &[u8]) -> Self {
        Self::digest_with_domain(DOMAIN_GENERIC, data)
    }

    /// Hash raw bytes under an explicit domain prefix.
    pub fn digest_with_domain(domain: &[u8], data: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update((domain.len() as u32).to_le_bytes());
        hasher.update(domain);
        hasher.update(data);
        Self::from_digest(hasher)
    }

    /// Hash the concatenation of several length-prefixed parts.
    pub fn digest_parts(domain: &[u8], parts: &[&[u8]]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update((domain.len() as u32).to_le_bytes());
        hasher.update(domain);
        for part in parts {
            hasher.update((part.len() as u32).to_le_bytes());
            hasher.update(part);
        }
        Self::from_digest(hasher)
    }

    fn from_digest(hasher: Sha512) -> Self {
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&hasher.finalize());
        Hash(out)
    }

    /// One step of a pre-image chain: `H(self)`.
    pub fn rehash(&self) -> Self {
        Self::digest(&self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    /// XOR-fold another digest into this one.
    pub fn fold(&mut self, other: &Hash) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl Default for Hash {
    fn default() -> Self {
        Hash::ZERO
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

// 64-byte arrays are past serde's derive limit, so Hash serialises as a
// plain byte string.
impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct HashVisitor;

impl<'de> Visitor<'de> for HashVisitor {
    type Value = Hash;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{HASH_SIZE} bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Hash, E> {
        Hash::from_slice(v).ok_or_else(|| E::invalid_length(v.len(), &self))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Hash, A::Error> {
        let mut bytes = [0u8; HASH_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(Hash(bytes))
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        deserializer.deserialize_bytes(HashVisitor)
    }
}

/// A compressed Ristretto public key.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Validate that the bytes decode to a curve point.
    pub fn is_valid_point(&self) -> bool {
        CompressedRistretto(self.0).decompress().is_some()
    }

    fn point(&self) -> Option<RistrettoPoint> {
        CompressedRistretto(self.0).decompress()
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// A Schnorr signature: compressed nonce point `R` and scalar `s`.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl Signature {
    pub fn is_zero(&self) -> bool {
        self.r == [0u8; 32] && self.s == [0u8; 32]
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.r[..4]))
    }
}

/// A signing key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: Scalar,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Derive a key pair deterministically from seed bytes.
    pub fn from_seed(seed: &[u8]) -> Self {
        let digest = Hash::digest_with_domain(b"kestrel.keypair.v1", seed);
        let secret = Scalar::from_bytes_mod_order_wide(digest.as_bytes());
        let public = PublicKey(RistrettoPoint::mul_base(&secret).compress().to_bytes());
        Self { secret, public }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Expose the secret as seed material for deterministic derivations
    /// (pre-image seeds survive restarts this way).
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Plain Schnorr signature with a deterministic nonce.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        let r = self.nonce(DOMAIN_NONCE, msg);
        let big_r = RistrettoPoint::mul_base(&r).compress();
        let c = challenge_scalar(&big_r.to_bytes(), &self.public.0, msg);
        let s = r + c * self.secret;
        Signature {
            r: big_r.to_bytes(),
            s: s.to_bytes(),
        }
    }

    /// One share of an aggregate header signature.
    ///
    /// The challenge binds only the message, so shares from different
    /// validators over the same message aggregate by addition.
    pub fn sign_share(&self, msg: &[u8]) -> Signature {
        let r = self.nonce(DOMAIN_MULTISIG, msg);
        let big_r = RistrettoPoint::mul_base(&r).compress();
        let c = multisig_challenge(msg);
        let s = r + c * self.secret;
        Signature {
            r: big_r.to_bytes(),
            s: s.to_bytes(),
        }
    }

    fn nonce(&self, domain: &[u8], msg: &[u8]) -> Scalar {
        let digest = Hash::digest_parts(domain, &[&self.secret.to_bytes(), msg]);
        Scalar::from_bytes_mod_order_wide(digest.as_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({})", self.public.short())
    }
}

fn challenge_scalar(r: &[u8; 32], public: &[u8; 32], msg: &[u8]) -> Scalar {
    let digest = Hash::digest_parts(DOMAIN_CHALLENGE, &[r, public, msg]);
    Scalar::from_bytes_mod_order_wide(digest.as_bytes())
}

fn multisig_challenge(msg: &[u8]) -> Scalar {
    let digest = Hash::digest_with_domain(DOMAIN_MULTISIG, msg);
    Scalar::from_bytes_mod_order_wide(digest.as_bytes())
}

fn decode_scalar(bytes: &[u8; 32]) -> Option<Scalar> {
    Option::from(Scalar::from_canonical_bytes(*bytes))
}

/// Verify a plain Schnorr signature.
pub fn verify(public: &PublicKey, msg: &[u8], sig: &Signature) -> bool {
    let Some(point) = public.point() else {
        return false;
    };
    let Some(big_r) = CompressedRistretto(sig.r).decompress() else {
        return false;
    };
    let Some(s) = decode_scalar(&sig.s) else {
        return false;
    };
    let c = challenge_scalar(&sig.r, &public.0, msg);
    RistrettoPoint::mul_base(&s) == big_r + c * point
}

/// Verify one aggregate-signature share against a single key.
pub fn verify_share(public: &PublicKey, msg: &[u8], sig: &Signature) -> bool {
    verify_multisig(std::slice::from_ref(public), msg, sig)
}

/// Verify an aggregated header signature against a set of keys.
pub fn verify_multisig(publics: &[PublicKey], msg: &[u8], sig: &Signature) -> bool {
    if publics.is_empty() {
        return false;
    }
    let mut sum = RistrettoPoint::identity();
    for pk in publics {
        let Some(point) = pk.point() else {
            return false;
        };
        sum += point;
    }
    let Some(big_r) = CompressedRistretto(sig.r).decompress() else {
        return false;
    };
    let Some(s) = decode_scalar(&sig.s) else {
        return false;
    };
    let c = multisig_challenge(msg);
    RistrettoPoint::mul_base(&s) == big_r + c * sum
}

/// Fold a share into an aggregate: both components add.
pub fn aggregate_signatures(a: &Signature, b: &Signature) -> Option<Signature> {
    if a.is_zero() {
        return Some(*b);
    }
    if b.is_zero() {
        return Some(*a);
    }
    let ra = CompressedRistretto(a.r).decompress()?;
    let rb = CompressedRistretto(b.r).decompress()?;
    let sa = decode_scalar(&a.s)?;
    let sb = decode_scalar(&b.s)?;
    Some(Signature {
        r: (ra + rb).compress().to_bytes(),
        s: (sa + sb).to_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_domain_separated() {
        let a = Hash::digest_with_domain(b"domain-a", b"payload");
        let b = Hash::digest_with_domain(b"domain-b", b"payload");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_serde_round_trip() {
        let h = Hash::digest(b"round trip");
        let bytes = bincode::serialize(&h).unwrap();
        let back: Hash = bincode::deserialize(&bytes).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn sign_and_verify() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"hello");
        assert!(verify(&kp.public(), b"hello", &sig));
        assert!(!verify(&kp.public(), b"tampered", &sig));

        let other = KeyPair::generate();
        assert!(!verify(&other.public(), b"hello", &sig));
    }

    #[test]
    fn deterministic_from_seed() {
        let a = KeyPair::from_seed(b"seed");
        let b = KeyPair::from_seed(b"seed");
        assert_eq!(a.public(), b.public());
        assert_eq!(a.sign(b"m").r, b.sign(b"m").r);
    }

    #[test]
    fn point_validation() {
        let kp = KeyPair::generate();
        assert!(kp.public().is_valid_point());
        // Not every 32-byte string is a valid encoding.
        let junk = PublicKey([0xFF; 32]);
        assert!(!junk.is_valid_point());
    }

    #[test]
    fn multisig_aggregation() {
        let msg = b"block header";
        let signers: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();

        let mut agg = Signature::default();
        for kp in &signers {
            let share = kp.sign_share(msg);
            assert!(verify_share(&kp.public(), msg, &share));
            agg = aggregate_signatures(&agg, &share).unwrap();
        }

        let publics: Vec<PublicKey> = signers.iter().map(|kp| kp.public()).collect();
        assert!(verify_multisig(&publics, msg, &agg));

        // Dropping a signer breaks verification.
        assert!(!verify_multisig(&publics[..3], msg, &agg));
    }

    #[test]
    fn xor_fold() {
        let a = Hash::digest(b"a");
        let mut folded = a;
        folded.fold(&a);
        assert!(folded.is_zero());
    }
}
