use hmac::{Hmac, Mac};
use md5::Md5;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;

/// PBKDF2 rounds applied to passwords on both ends of the wire.
pub const PBKDF2_ROUNDS: u32 = 10_000;
/// Raw size of the derived password key (SHA-512 output).
pub const DERIVED_KEY_SIZE: usize = 64;
/// Raw size of the authentication challenge.
pub const CHALLENGE_SIZE: usize = 64;
/// Size of a challenge answer (MD5 digest).
pub const ANSWER_SIZE: usize = 16;

type HmacMd5 = Hmac<Md5>;

/// Derives the stored password hash: PBKDF2-HMAC-SHA512 with the lowercase
/// login as salt, rendered as lowercase hex. The hex string itself keys the
/// challenge HMAC.
pub fn password_hash(password: &str, login: &str) -> String {
    let salt = login.to_lowercase();
    let mut derived = [0u8; DERIVED_KEY_SIZE];

    pbkdf2_hmac::<Sha512>(
        password.as_bytes(),
        salt.as_bytes(),
        PBKDF2_ROUNDS,
        &mut derived,
    );

    hex::encode(derived)
}

/// Generates a fresh hex-encoded random challenge.
pub fn challenge() -> String {
    let mut raw = [0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

fn answer_mac(password_hash: &str, challenge: &str) -> HmacMd5 {
    let mut mac =
        HmacMd5::new_from_slice(password_hash.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge.as_bytes());
    mac
}

/// Computes the answer to a challenge: HMAC-MD5 over the challenge's ASCII
/// bytes, keyed with the password hash string.
pub fn challenge_answer(password_hash: &str, challenge: &str) -> [u8; ANSWER_SIZE] {
    answer_mac(password_hash, challenge).finalize().into_bytes().into()
}

/// Verifies a claimed answer in constant time.
pub fn verify_answer(password_hash: &str, challenge: &str, answer: &[u8]) -> bool {
    answer_mac(password_hash, challenge).verify_slice(answer).is_ok()
}
