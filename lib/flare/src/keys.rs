use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use std::fs;
use std::path::Path;

use crate::error::KeyError;

/// Bit size for keys generated on a client's first run.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// A client's RSA key pair, persisted as PKCS#8 PEM in `<login>.key`.
///
/// Message bodies are encrypted to the recipient's public key with
/// RSA-OAEP over SHA-1, so the server only ever routes opaque ciphertext.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    pub fn generate(bits: usize) -> Result<KeyPair, KeyError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)?;
        let public = RsaPublicKey::from(&private);

        Ok(KeyPair { private, public })
    }

    pub fn load(path: &Path) -> Result<KeyPair, KeyError> {
        let pem = fs::read_to_string(path)?;
        let private = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|err| KeyError::Encoding(err.to_string()))?;
        let public = RsaPublicKey::from(&private);

        Ok(KeyPair { private, public })
    }

    /// Loads the key pair stored at `path`, generating and persisting a
    /// fresh one if the file does not exist yet.
    pub fn load_or_generate(path: &Path, bits: usize) -> Result<KeyPair, KeyError> {
        if path.exists() {
            return KeyPair::load(path);
        }

        let pair = KeyPair::generate(bits)?;
        let pem = pair
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| KeyError::Encoding(err.to_string()))?;
        fs::write(path, pem.as_bytes())?;

        Ok(pair)
    }

    /// Public half as the SPKI PEM submitted during presence.
    pub fn public_pem(&self) -> Result<String, KeyError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| KeyError::Encoding(err.to_string()))
    }

    /// Encrypts a message body for the peer owning `recipient_pem`.
    pub fn encrypt_for(recipient_pem: &str, plain: &[u8]) -> Result<Vec<u8>, KeyError> {
        let public = RsaPublicKey::from_public_key_pem(recipient_pem)
            .map_err(|err| KeyError::Encoding(err.to_string()))?;

        Ok(public.encrypt(&mut OsRng, Oaep::new::<Sha1>(), plain)?)
    }

    /// Decrypts a message body addressed to this key pair.
    pub fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, KeyError> {
        Ok(self.private.decrypt(Oaep::new::<Sha1>(), cipher)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Unit tests run on short keys; production key generation uses
    // DEFAULT_KEY_BITS.
    const TEST_KEY_BITS: usize = 512;

    #[test]
    fn test_public_pem_shape() {
        let pair = KeyPair::generate(TEST_KEY_BITS).unwrap();
        let pem = pair.public_pem().unwrap();

        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert!(pem.trim_end().ends_with("-----END PUBLIC KEY-----"));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let pair = KeyPair::generate(TEST_KEY_BITS).unwrap();
        let pem = pair.public_pem().unwrap();

        let cipher = KeyPair::encrypt_for(&pem, b"hello").unwrap();

        assert_ne!(cipher.as_slice(), b"hello".as_slice());
        assert_eq!(pair.decrypt(&cipher).unwrap(), b"hello");
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        let pair = KeyPair::generate(TEST_KEY_BITS).unwrap();

        assert!(pair.decrypt(&[0u8; 64]).is_err());
    }

    #[test]
    fn test_decrypt_rejects_foreign_ciphertext() {
        let ours = KeyPair::generate(TEST_KEY_BITS).unwrap();
        let theirs = KeyPair::generate(TEST_KEY_BITS).unwrap();

        let cipher = KeyPair::encrypt_for(&theirs.public_pem().unwrap(), b"hello").unwrap();

        assert!(ours.decrypt(&cipher).is_err());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let path = env::temp_dir().join(format!("flare-keys-{}.key", std::process::id()));
        let _ = fs::remove_file(&path);

        let generated = KeyPair::load_or_generate(&path, TEST_KEY_BITS).unwrap();
        let reloaded = KeyPair::load_or_generate(&path, TEST_KEY_BITS).unwrap();

        let cipher = KeyPair::encrypt_for(&generated.public_pem().unwrap(), b"persist").unwrap();
        assert_eq!(reloaded.decrypt(&cipher).unwrap(), b"persist");

        let _ = fs::remove_file(&path);
    }
}
