//! End-to-end content signatures for chat payloads.
//!
//! The transport signature on an envelope only covers one hop; a direct
//! message is additionally bound to its sender across hops by a signature
//! over `sha256(ciphertext || from || to || ts)`. Servers check it at the
//! ingress edge and never need to see the plaintext.

use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::crypto::{b64, pss};

/// Digest bound by a direct-message content signature.
pub fn direct_digest(ciphertext: &[u8], from: &str, to: &str, ts: i64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(ciphertext);
    hasher.update(from.as_bytes());
    hasher.update(to.as_bytes());
    hasher.update(ts.to_string().as_bytes());
    hasher.finalize().into()
}

/// Public-channel variant: no single recipient, so the digest omits `to`.
pub fn public_digest(ciphertext: &[u8], from: &str, ts: i64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(ciphertext);
    hasher.update(from.as_bytes());
    hasher.update(ts.to_string().as_bytes());
    hasher.finalize().into()
}

pub fn sign_direct(private: &RsaPrivateKey, ciphertext: &[u8], from: &str, to: &str, ts: i64) -> String {
    b64::encode(pss::sign(private, &direct_digest(ciphertext, from, to, ts)))
}

pub fn sign_public(private: &RsaPrivateKey, ciphertext: &[u8], from: &str, ts: i64) -> String {
    b64::encode(pss::sign(private, &public_digest(ciphertext, from, ts)))
}

pub fn verify_direct(
    public: &RsaPublicKey,
    sig_b64u: &str,
    ciphertext: &[u8],
    from: &str,
    to: &str,
    ts: i64,
) -> bool {
    let Ok(sig) = b64::decode(sig_b64u) else {
        return false;
    };
    pss::verify(public, &direct_digest(ciphertext, from, to, ts), &sig)
}

pub fn verify_public(public: &RsaPublicKey, sig_b64u: &str, ciphertext: &[u8], from: &str, ts: i64) -> bool {
    let Ok(sig) = b64::decode(sig_b64u) else {
        return false;
    };
    pss::verify(public, &public_digest(ciphertext, from, ts), &sig)
}
