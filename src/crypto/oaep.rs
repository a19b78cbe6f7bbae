use anyhow::{bail, Context, Result};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

const HASH_LEN: usize = 32;

/// Largest plaintext a single OAEP block can carry: k − 2·hLen − 2,
/// with k the modulus size in bytes and hLen the SHA-256 output size.
pub fn max_plaintext_len(public: &RsaPublicKey) -> usize {
    public.size() - 2 * HASH_LEN - 2
}

/// Ciphertext block size for a given key; `decrypt_large` splits on this.
pub fn block_len(key_size: usize) -> usize {
    key_size
}

pub fn encrypt(public: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let max = max_plaintext_len(public);
    if plaintext.len() > max {
        bail!("plaintext too long for OAEP: {} > {max}", plaintext.len());
    }
    let mut rng = rand::thread_rng();
    public
        .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
        .context("OAEP encryption failed")
}

pub fn decrypt(private: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    private
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .context("OAEP decryption failed")
}

/// Split `data` into maximum-size chunks and OAEP-encrypt each one. Every
/// output block is exactly the modulus size; order is significant.
pub fn encrypt_large(public: &RsaPublicKey, data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let max = max_plaintext_len(public);
    data.chunks(max).map(|chunk| encrypt(public, chunk)).collect()
}

/// Decrypt blocks produced by `encrypt_large` and concatenate in order.
pub fn decrypt_large(private: &RsaPrivateKey, blocks: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for block in blocks {
        out.extend_from_slice(&decrypt(private, block)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_keypair;

    #[test]
    fn round_trip() {
        let (private, public) = generate_keypair(2048).unwrap();
        let ct = encrypt(&public, b"attack at dawn").unwrap();
        assert_eq!(ct.len(), public.size());
        assert_eq!(decrypt(&private, &ct).unwrap(), b"attack at dawn");
    }

    #[test]
    fn rejects_oversized_plaintext() {
        let (_, public) = generate_keypair(2048).unwrap();
        let too_long = vec![0u8; max_plaintext_len(&public) + 1];
        assert!(encrypt(&public, &too_long).is_err());
    }

    #[test]
    fn large_round_trip_across_chunk_boundaries() {
        let (private, public) = generate_keypair(2048).unwrap();
        let max = max_plaintext_len(&public);
        for len in [0, 1, max - 1, max, max + 1, 3 * max + 7] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let blocks = encrypt_large(&public, &data).unwrap();
            assert_eq!(decrypt_large(&private, &blocks).unwrap(), data);
        }
    }

    #[test]
    fn tampered_block_fails() {
        let (private, public) = generate_keypair(2048).unwrap();
        let mut blocks = encrypt_large(&public, b"secret").unwrap();
        blocks[0][7] ^= 0x01;
        assert!(decrypt_large(&private, &blocks).is_err());
    }
}
