//! Payload encryption for captured key text.
//!
//! ChaCha20-Poly1305 with a random 96-bit nonce prepended to each
//! ciphertext. The key is either derived from a passphrase (PBKDF2-SHA256)
//! or expanded with HKDF from random material stored next to the database.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 16;
const PBKDF2_ROUNDS: u32 = 100_000;

const SALT_FILE: &str = "payload.salt";
const CHECK_FILE: &str = "payload.check";
const KEY_FILE: &str = "payload.key";

/// Plaintext of the passphrase verification token.
const CHECK_MARKER: &[u8] = b"footprint-passphrase-check-v1";

/// Errors from key setup and payload encryption.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("key material I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("ciphertext too short")]
    Truncated,
    #[error("passphrase does not match the one this database was created with")]
    WrongPassphrase,
    #[error("this database is passphrase protected; set FOOTPRINT_PASSPHRASE")]
    PassphraseRequired,
}

/// Anything that can seal a key payload before it is buffered.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError>;
}

/// Authenticated symmetric encryptor for key payloads.
pub struct Encryptor {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl Encryptor {
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Derive the key from a passphrase and salt.
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Self {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key[..]);
        Self { key }
    }

    /// Open (or create) the key material stored in `data_dir`.
    ///
    /// With a passphrase, the salt and a verification token are kept in the
    /// directory and a wrong passphrase is rejected. Without one, a random key
    /// file is created on first use.
    pub fn open(data_dir: &Path, passphrase: Option<&str>) -> Result<Self, EncryptionError> {
        fs::create_dir_all(data_dir)?;
        match passphrase {
            Some(passphrase) => Self::open_with_passphrase(data_dir, passphrase),
            None => {
                if data_dir.join(SALT_FILE).exists() {
                    return Err(EncryptionError::PassphraseRequired);
                }
                Self::open_with_key_file(data_dir)
            }
        }
    }

    fn open_with_passphrase(data_dir: &Path, passphrase: &str) -> Result<Self, EncryptionError> {
        let salt_path = data_dir.join(SALT_FILE);
        let salt = if salt_path.exists() {
            fs::read(&salt_path)?
        } else {
            let mut salt = vec![0u8; SALT_SIZE];
            rand::rng().fill_bytes(&mut salt);
            write_private(&salt_path, &salt)?;
            salt
        };

        let encryptor = Self::from_passphrase(passphrase, &salt);

        let check_path = data_dir.join(CHECK_FILE);
        if check_path.exists() {
            let token = fs::read(&check_path)?;
            match encryptor.decrypt(&token) {
                Ok(marker) if marker == CHECK_MARKER => {}
                _ => return Err(EncryptionError::WrongPassphrase),
            }
        } else {
            write_private(&check_path, &encryptor.encrypt(CHECK_MARKER)?)?;
        }

        Ok(encryptor)
    }

    fn open_with_key_file(data_dir: &Path) -> Result<Self, EncryptionError> {
        let key_path = data_dir.join(KEY_FILE);
        let material = if key_path.exists() {
            Zeroizing::new(fs::read(&key_path)?)
        } else {
            let mut material = Zeroizing::new(vec![0u8; KEY_SIZE]);
            rand::rng().fill_bytes(&mut material[..]);
            write_private(&key_path, &material)?;
            material
        };

        let hk = Hkdf::<Sha256>::new(Some(b"footprint-payload-v1"), &material);
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(b"key-payload-encryption", &mut key[..])
            .map_err(|_| EncryptionError::KeyDerivation)?;
        Ok(Self { key })
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key[..])
            .map_err(|_| EncryptionError::KeyDerivation)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| EncryptionError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt data produced by [`Encryptor::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if data.len() < NONCE_SIZE {
            return Err(EncryptionError::Truncated);
        }

        let cipher = ChaCha20Poly1305::new_from_slice(&self.key[..])
            .map_err(|_| EncryptionError::KeyDerivation)?;
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::Decrypt)
    }
}

impl PayloadCipher for Encryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        Encryptor::encrypt(self, plaintext)
    }
}

impl fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encryptor").finish_non_exhaustive()
    }
}

/// Write key material readable by the owner only.
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    fs::write(path, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
