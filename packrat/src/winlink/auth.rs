//! Winlink secure login.
//!
//! The server's banner carries an 8-digit challenge (`;PQ: 12345678`); the client proves
//! knowledge of the account password by hashing challenge, password and a fixed salt and sending
//! back 8 decimal digits (`;PR: ...`). Passwords are case-sensitive.

use core::fmt::Write;
use md5::{Digest, Md5};
use rand_core::RngCore;

/// The fixed 64-byte salt mixed into every secure-login response.
const SECURE_SALT: [u8; 64] = [
    0x4D, 0xC5, 0x65, 0xCE, 0xBE, 0xF9, 0x5D, 0xC8, 0x33, 0xF3, 0x5D, 0xED, 0x47, 0x5E, 0xEF,
    0x8A, 0x44, 0x6C, 0x46, 0xB9, 0xE1, 0x89, 0xD9, 0x10, 0x33, 0x7A, 0xC1, 0x30, 0xC2, 0xC3,
    0xC6, 0xAF, 0xAC, 0xA9, 0x46, 0x54, 0x3D, 0x3E, 0x68, 0xBA, 0x72, 0x34, 0x3D, 0xA8, 0x42,
    0x81, 0xC0, 0xD0, 0xBB, 0xF9, 0xE8, 0xC1, 0x29, 0x71, 0x29, 0x2D, 0xF0, 0x10, 0x1D, 0xE4,
    0xD0, 0xE4, 0x3D, 0x14,
];

/// An 8-decimal-digit login string (challenge or response).
pub type LoginDigits = heapless::String<8>;

/// Draws a fresh 8-digit challenge.
pub fn generate_challenge<R: RngCore>(rng: &mut R) -> LoginDigits {
    let mut out = LoginDigits::new();
    let value = rng.next_u32() % 100_000_000;
    let _ = write!(out, "{:08}", value);
    out
}

/// Computes the response for `challenge` under `password`.
///
/// MD5 over challenge ‖ password ‖ salt; the first 4 digest bytes as a little-endian integer,
/// masked to 30 bits, rendered as zero-padded decimal, last 8 digits kept.
pub fn challenge_response(challenge: &str, password: &str) -> LoginDigits {
    let mut hasher = Md5::new();
    hasher.update(challenge.as_bytes());
    hasher.update(password.as_bytes());
    hasher.update(&SECURE_SALT[..]);
    let digest = hasher.finalize();

    let value = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x3FFF_FFFF;
    let mut decimal = heapless::String::<10>::new();
    let _ = write!(decimal, "{:08}", value);
    let tail = &decimal[decimal.len() - 8..];
    let mut out = LoginDigits::new();
    let _ = out.push_str(tail);
    out
}

/// Checks a client's response against the issued challenge.
pub fn verify_response(challenge: &str, password: &str, response: &str) -> bool {
    challenge_response(challenge, password).as_str() == response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::NullRng;

    #[test]
    fn known_responses() {
        assert_eq!(challenge_response("23753528", "FOOBAR").as_str(), "72768415");
        assert_eq!(challenge_response("23753528", "FooBar").as_str(), "95074758");
    }

    #[test]
    fn verification() {
        assert!(verify_response("23753528", "FOOBAR", "72768415"));
        assert!(!verify_response("23753528", "FOOBAR", "95074758"));
        assert!(!verify_response("23753529", "FOOBAR", "72768415"));
    }

    #[test]
    fn challenge_shape() {
        let mut rng = NullRng(42);
        let c = generate_challenge(&mut rng);
        assert_eq!(c.len(), 8);
        assert!(c.bytes().all(|b| b.is_ascii_digit()));
    }
}
