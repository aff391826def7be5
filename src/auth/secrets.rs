//! Salted-hash credential verification
//!
//! Stored credentials are lowercase hex digests of `salt || secret`,
//! under sha256 or scrypt. Comparison is constant-time.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::domain::HashAlgorithm;

/// scrypt cost parameters (N = 2^14, r = 8, p = 1, 32-byte output)
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_LEN: usize = 32;

/// Hash a secret with the identity's salt. Returns lowercase hex.
pub fn hash_secret(algorithm: HashAlgorithm, secret: &str, salt: &str) -> Option<String> {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(salt.as_bytes());
            hasher.update(secret.as_bytes());
            Some(hex::encode(hasher.finalize()))
        }
        HashAlgorithm::Scrypt => {
            let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_LEN).ok()?;
            let mut output = [0u8; SCRYPT_LEN];
            scrypt::scrypt(secret.as_bytes(), salt.as_bytes(), &params, &mut output).ok()?;
            Some(hex::encode(output))
        }
    }
}

/// Constant-time comparison of a presented secret against a stored hash.
pub fn verify_secret(
    algorithm: HashAlgorithm,
    presented: &str,
    salt: &str,
    expected_hex: &str,
) -> bool {
    let Some(computed) = hash_secret(algorithm, presented, salt) else {
        return false;
    };
    let expected = expected_hex.to_ascii_lowercase();
    computed.as_bytes().ct_eq(expected.as_bytes()).into()
}
