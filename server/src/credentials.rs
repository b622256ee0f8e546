//! Password hashing
//!
//! Salted, iterated SHA-256. Callers treat the output as opaque strings
//! stored next to the account.

use rand::RngCore;
use sha2::{Digest, Sha256};

const SALT_LEN: usize = 16;
const ROUNDS: u32 = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedPassword {
    /// Hex-encoded digest
    pub hash: String,
    /// Hex-encoded salt
    pub salt: String,
}

fn digest(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    let mut out: [u8; 32] = hasher.finalize().into();
    for _ in 1..ROUNDS {
        let mut hasher = Sha256::new();
        hasher.update(out);
        hasher.update(salt);
        out = hasher.finalize().into();
    }
    out
}

pub fn hash_password(password: &str) -> HashedPassword {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    HashedPassword {
        hash: hex::encode(digest(password, &salt)),
        salt: hex::encode(salt),
    }
}

/// False for a wrong password and for malformed stored values.
pub fn verify_password(password: &str, hash: &str, salt: &str) -> bool {
    let (Ok(salt), Ok(expected)) = (hex::decode(salt), hex::decode(hash)) else {
        return false;
    };
    let actual = digest(password, &salt);
    if expected.len() != actual.len() {
        return false;
    }
    expected
        .iter()
        .zip(actual.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
