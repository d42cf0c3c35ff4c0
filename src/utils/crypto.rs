//! Encryption of analysis detail blobs at rest.
//!
//! The primary AES-256 key is random and never stored in plaintext: it is
//! wrapped with a key derived from the admin password via
//! PBKDF2-HMAC-SHA256. The first 32 bytes of the 64-byte derivation wrap
//! the primary key, the second 32 bytes verify the password.
//!
//! Encrypted stream format:
//!   IV(16)
//!   CHUNK, CHUNK, ...
//! where each CHUNK is
//!   original_size (u64, little endian)
//!   padded_size   (u64, little endian)
//!   padded_size bytes of AES-256-CBC ciphertext
//! Plaintext chunks are at most 64 KiB and padded with spaces to a 16 byte
//! multiple.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha2::Sha256;

use crate::utils::{CoreError, CoreResult};

type Aes256CbcEncryptor = cbc::Encryptor<Aes256>;
type Aes256CbcDecryptor = cbc::Decryptor<Aes256>;

pub const CHUNK_SIZE: usize = 64 * 1024;
const BLOCK_SIZE: usize = 16;
const DEFAULT_SALT_SIZE: usize = 32;
const DEFAULT_ITERATIONS: u32 = 8192;

pub const ENV_CRYPTO_VERIFICATION_KEY: &str = "ACE_CRYPTO_VERIFICATION_KEY";
pub const ENV_CRYPTO_SALT: &str = "ACE_CRYPTO_SALT";
pub const ENV_CRYPTO_SALT_SIZE: &str = "ACE_CRYPTO_SALT_SIZE";
pub const ENV_CRYPTO_ITERATIONS: &str = "ACE_CRYPTO_ITERATIONS";
pub const ENV_CRYPTO_ENCRYPTED_KEY: &str = "ACE_CRYPTO_ENCRYPTED_KEY";

/// Key material for analysis detail encryption. The `aes_key` field is only
/// populated after the password has been verified.
#[derive(Debug, Clone, Default)]
pub struct EncryptionSettings {
    pub verification_key: Option<Vec<u8>>,
    pub salt: Option<Vec<u8>>,
    pub salt_size: usize,
    pub iterations: u32,
    pub encrypted_key: Option<Vec<u8>>,
    pub aes_key: Option<Vec<u8>>,
}

impl EncryptionSettings {
    /// Loads the settings from the `ACE_CRYPTO_*` environment variables
    /// (base64 encoded except the numeric values). Returns None when the
    /// required variables are absent.
    pub fn from_env() -> CoreResult<Option<Self>> {
        let verification_key = match std::env::var(ENV_CRYPTO_VERIFICATION_KEY) {
            Ok(value) => decode_base64(&value)?,
            Err(_) => return Ok(None),
        };

        let salt = match std::env::var(ENV_CRYPTO_SALT) {
            Ok(value) => decode_base64(&value)?,
            Err(_) => return Ok(None),
        };

        let encrypted_key = match std::env::var(ENV_CRYPTO_ENCRYPTED_KEY) {
            Ok(value) => decode_base64(&value)?,
            Err(_) => return Ok(None),
        };

        let salt_size = std::env::var(ENV_CRYPTO_SALT_SIZE)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SALT_SIZE);

        let iterations = std::env::var(ENV_CRYPTO_ITERATIONS)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_ITERATIONS);

        Ok(Some(Self {
            verification_key: Some(verification_key),
            salt: Some(salt),
            salt_size,
            iterations,
            encrypted_key: Some(encrypted_key),
            aes_key: None,
        }))
    }

    /// The `export` lines printed by `ace initialize` so the settings can be
    /// carried in the environment.
    pub fn export_env(&self) -> Vec<(String, String)> {
        let mut exports = Vec::new();
        if let Some(verification_key) = &self.verification_key {
            exports.push((ENV_CRYPTO_VERIFICATION_KEY.to_string(), BASE64.encode(verification_key)));
        }
        if let Some(salt) = &self.salt {
            exports.push((ENV_CRYPTO_SALT.to_string(), BASE64.encode(salt)));
        }
        exports.push((ENV_CRYPTO_SALT_SIZE.to_string(), self.salt_size.to_string()));
        exports.push((ENV_CRYPTO_ITERATIONS.to_string(), self.iterations.to_string()));
        if let Some(encrypted_key) = &self.encrypted_key {
            exports.push((ENV_CRYPTO_ENCRYPTED_KEY.to_string(), BASE64.encode(encrypted_key)));
        }
        exports
    }

    /// Unwraps the primary AES key with the given password, making
    /// encryption available.
    pub fn load_aes_key(&mut self, password: &str) -> CoreResult<()> {
        self.aes_key = Some(get_aes_key(password, self)?);
        Ok(())
    }
}

fn decode_base64(value: &str) -> CoreResult<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| CoreError::Internal(format!("invalid base64 in encryption settings: {}", e)))
}

/// Creates a fresh set of encryption settings protected by the given
/// password: a random 32 byte primary key wrapped with the password-derived
/// key.
pub fn initialize_encryption_settings(password: &str) -> CoreResult<EncryptionSettings> {
    let mut primary_key = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut primary_key);

    let mut salt = vec![0u8; DEFAULT_SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut derived = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, DEFAULT_ITERATIONS, &mut derived);

    let wrap_key = &derived[..32];
    let verification_key = derived[32..].to_vec();
    let encrypted_key = encrypt_chunk(wrap_key, &primary_key)?;

    Ok(EncryptionSettings {
        verification_key: Some(verification_key),
        salt: Some(salt),
        salt_size: DEFAULT_SALT_SIZE,
        iterations: DEFAULT_ITERATIONS,
        encrypted_key: Some(encrypted_key),
        aes_key: Some(primary_key),
    })
}

/// Derives the key-wrapping key from the password, verifying the password
/// against the stored verification key.
pub fn get_decryption_key(password: &str, settings: &EncryptionSettings) -> CoreResult<Vec<u8>> {
    let salt = settings.salt.as_ref().ok_or(CoreError::MissingEncryptionSettings)?;
    let verification_key = settings
        .verification_key
        .as_ref()
        .ok_or(CoreError::MissingEncryptionSettings)?;

    let mut derived = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, settings.iterations, &mut derived);

    if derived[32..] != verification_key[..] {
        return Err(CoreError::InvalidPassword);
    }

    Ok(derived[..32].to_vec())
}

pub fn is_valid_password(password: &str, settings: &EncryptionSettings) -> bool {
    get_decryption_key(password, settings).is_ok()
}

/// Returns the unwrapped 32 byte primary encryption key.
pub fn get_aes_key(password: &str, settings: &EncryptionSettings) -> CoreResult<Vec<u8>> {
    let wrap_key = get_decryption_key(password, settings)?;
    let encrypted_key = settings
        .encrypted_key
        .as_ref()
        .ok_or(CoreError::MissingEncryptionSettings)?;
    decrypt_chunk(&wrap_key, encrypted_key)
}

/// Encrypts a complete buffer into the chunked stream format.
pub fn encrypt_chunk(key: &[u8], plaintext: &[u8]) -> CoreResult<Vec<u8>> {
    let mut iv = [0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut encryptor = Aes256CbcEncryptor::new_from_slices(key, &iv)
        .map_err(|e| CoreError::Internal(format!("invalid encryption key: {}", e)))?;

    let mut output = Vec::with_capacity(plaintext.len() + BLOCK_SIZE * 4);
    output.extend_from_slice(&iv);

    for chunk in plaintext.chunks(CHUNK_SIZE) {
        let original_size = chunk.len();
        let mut padded = chunk.to_vec();
        if padded.len() % BLOCK_SIZE != 0 {
            padded.resize(padded.len() + BLOCK_SIZE - padded.len() % BLOCK_SIZE, b' ');
        }

        output.extend_from_slice(&(original_size as u64).to_le_bytes());
        output.extend_from_slice(&(padded.len() as u64).to_le_bytes());

        for block in padded.chunks_mut(BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(block);
            encryptor.encrypt_block_mut(block);
        }

        output.extend_from_slice(&padded);
    }

    Ok(output)
}

/// Decrypts a buffer produced by [`encrypt_chunk`].
pub fn decrypt_chunk(key: &[u8], ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
    if ciphertext.len() < BLOCK_SIZE {
        return Err(CoreError::Internal("encrypted stream is truncated".to_string()));
    }

    let (iv, mut remaining) = ciphertext.split_at(BLOCK_SIZE);
    let mut decryptor = Aes256CbcDecryptor::new_from_slices(key, iv)
        .map_err(|e| CoreError::Internal(format!("invalid decryption key: {}", e)))?;

    let mut output = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        if remaining.len() < 16 {
            return Err(CoreError::Internal("encrypted chunk header is truncated".to_string()));
        }

        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&remaining[..8]);
        let original_size = u64::from_le_bytes(size_bytes) as usize;
        size_bytes.copy_from_slice(&remaining[8..16]);
        let padded_size = u64::from_le_bytes(size_bytes) as usize;
        remaining = &remaining[16..];

        if padded_size % BLOCK_SIZE != 0 || original_size > padded_size {
            return Err(CoreError::Internal("encrypted chunk header is invalid".to_string()));
        }

        if remaining.len() < padded_size {
            return Err(CoreError::Internal("encrypted chunk is truncated".to_string()));
        }

        let mut padded = remaining[..padded_size].to_vec();
        remaining = &remaining[padded_size..];

        for block in padded.chunks_mut(BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(block);
            decryptor.decrypt_block_mut(block);
        }

        padded.truncate(original_size);
        output.extend_from_slice(&padded);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> Vec<u8> {
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key = random_key();
        let plaintext = b"the quick brown fox jumps over the lazy dog";

        let ciphertext = encrypt_chunk(&key, plaintext).unwrap();
        assert_ne!(&ciphertext[BLOCK_SIZE..], plaintext.as_slice());

        let decrypted = decrypt_chunk(&key, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_decrypt_empty_and_block_aligned() {
        let key = random_key();

        let ciphertext = encrypt_chunk(&key, b"").unwrap();
        assert_eq!(decrypt_chunk(&key, &ciphertext).unwrap(), b"");

        let aligned = vec![0x41u8; 64];
        let ciphertext = encrypt_chunk(&key, &aligned).unwrap();
        assert_eq!(decrypt_chunk(&key, &ciphertext).unwrap(), aligned);
    }

    #[test]
    fn test_encrypt_decrypt_multi_chunk() {
        let key = random_key();
        let plaintext: Vec<u8> = (0..CHUNK_SIZE * 2 + 777).map(|i| (i % 251) as u8).collect();

        let ciphertext = encrypt_chunk(&key, &plaintext).unwrap();
        assert_eq!(decrypt_chunk(&key, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_iv_makes_ciphertext_unique() {
        let key = random_key();
        let a = encrypt_chunk(&key, b"same plaintext").unwrap();
        let b = encrypt_chunk(&key, b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_or_garbles() {
        let key = random_key();
        let other = random_key();
        let ciphertext = encrypt_chunk(&key, b"secret analysis details").unwrap();

        match decrypt_chunk(&other, &ciphertext) {
            Ok(decrypted) => assert_ne!(decrypted, b"secret analysis details"),
            Err(_) => {},
        }
    }

    #[test]
    fn test_initialize_and_unwrap_key() {
        let settings = initialize_encryption_settings("hunter2").unwrap();
        assert!(settings.aes_key.is_some());

        let unwrapped = get_aes_key("hunter2", &settings).unwrap();
        assert_eq!(Some(unwrapped), settings.aes_key);
    }

    #[test]
    fn test_invalid_password() {
        let settings = initialize_encryption_settings("correct horse").unwrap();
        assert!(is_valid_password("correct horse", &settings));
        assert!(!is_valid_password("battery staple", &settings));
        assert!(matches!(get_aes_key("battery staple", &settings), Err(CoreError::InvalidPassword)));
    }

    #[test]
    fn test_missing_settings() {
        let settings = EncryptionSettings::default();
        assert!(matches!(
            get_decryption_key("anything", &settings),
            Err(CoreError::MissingEncryptionSettings)
        ));
    }

    #[test]
    fn test_export_env_round_trip_via_base64() {
        let settings = initialize_encryption_settings("secret").unwrap();
        let exports = settings.export_env();

        let salt = exports
            .iter()
            .find(|(name, _)| name == ENV_CRYPTO_SALT)
            .map(|(_, value)| BASE64.decode(value).unwrap())
            .unwrap();
        assert_eq!(Some(salt), settings.salt);
    }
}
