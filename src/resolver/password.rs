//! Password verification collaborator for protected links.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub trait PasswordVerifier: Send + Sync {
    fn verify(&self, plaintext: &str, hash: &str) -> bool;
}

/// SHA-256 hex digests compared in constant time.
pub struct Sha256Verifier;

impl Sha256Verifier {
    pub fn hash(plaintext: &str) -> String {
        let digest = Sha256::digest(plaintext.as_bytes());
        hex_encode(&digest)
    }
}

impl PasswordVerifier for Sha256Verifier {
    fn verify(&self, plaintext: &str, hash: &str) -> bool {
        let computed = Self::hash(plaintext);
        computed.as_bytes().ct_eq(hash.as_bytes()).into()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_password() {
        let hash = Sha256Verifier::hash("open sesame");
        assert!(Sha256Verifier.verify("open sesame", &hash));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let hash = Sha256Verifier::hash("open sesame");
        assert!(!Sha256Verifier.verify("open says me", &hash));
        assert!(!Sha256Verifier.verify("", &hash));
    }
}
