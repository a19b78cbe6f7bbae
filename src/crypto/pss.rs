use rsa::traits::PublicKeyParts;
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// RSASSA-PSS with SHA-256 and the maximum salt length the modulus allows
/// (k − hLen − 2). The padding is built explicitly so signatures interoperate
/// with any other max-salt implementation.
fn padding(key_bytes: usize) -> Pss {
    Pss::new_with_salt::<Sha256>(key_bytes - Sha256::output_size() - 2)
}

pub fn sign(private: &RsaPrivateKey, message: &[u8]) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let digest = Sha256::digest(message);
    private
        .sign_with_rng(&mut rng, padding(private.size()), &digest)
        .expect("PSS signing failed")
}

/// Total verification: any malformed signature or key mismatch is `false`,
/// never an error.
pub fn verify(public: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let digest = Sha256::digest(message);
    public
        .verify(padding(public.size()), &digest, signature)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_keypair;

    #[test]
    fn sign_verify_round_trip() {
        let (private, public) = generate_keypair(2048).unwrap();
        let sig = sign(&private, b"payload bytes");
        assert_eq!(sig.len(), public.size());
        assert!(verify(&public, b"payload bytes", &sig));
    }

    #[test]
    fn flipping_any_message_byte_fails() {
        let (private, public) = generate_keypair(2048).unwrap();
        let msg = b"short message".to_vec();
        let sig = sign(&private, &msg);
        for i in 0..msg.len() {
            let mut tampered = msg.clone();
            tampered[i] ^= 0x01;
            assert!(!verify(&public, &tampered, &sig), "byte {i} accepted");
        }
    }

    #[test]
    fn wrong_key_fails() {
        let (private, _) = generate_keypair(2048).unwrap();
        let (_, other_public) = generate_keypair(2048).unwrap();
        let sig = sign(&private, b"msg");
        assert!(!verify(&other_public, b"msg", &sig));
    }

    #[test]
    fn garbage_signature_is_false_not_panic() {
        let (_, public) = generate_keypair(2048).unwrap();
        assert!(!verify(&public, b"msg", b"not a signature"));
        assert!(!verify(&public, b"msg", &[]));
    }

    #[test]
    fn signatures_are_salted() {
        let (private, _) = generate_keypair(2048).unwrap();
        // PSS with a fresh salt never produces the same signature twice
        assert_ne!(sign(&private, b"msg"), sign(&private, b"msg"));
    }
}
