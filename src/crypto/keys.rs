//! Symmetric key lifecycle backed by the platform secure key store.

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use tracing::info;
use zeroize::Zeroizing;

use crate::config::StoreConfig;
use crate::error::{VaultError, VaultResult};

/// AES-256 key size.
pub const KEY_SIZE: usize = 32;

/// Key material that zeroes itself on drop.
pub type SecretKey = Zeroizing<[u8; KEY_SIZE]>;

/// Generate a fresh key from the OS CSPRNG. An unavailable secure RNG is
/// fatal here — the engine refuses to fabricate a key from anything weaker.
pub fn generate_key() -> VaultResult<SecretKey> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng
        .try_fill_bytes(&mut key[..])
        .map_err(|e| VaultError::Crypto(format!("secure RNG unavailable: {e}")))?;
    Ok(key)
}

/// The key lifecycle seam. The platform implementation below is the real
/// one; tests substitute an in-memory store.
pub trait KeyStore {
    /// Fetch the existing key, generating and persisting one if none exists.
    fn load_or_create_key(&self) -> impl Future<Output = VaultResult<SecretKey>> + Send;

    /// Create and persist a new key. Records sealed under the old key become
    /// undecryptable by design; callers wanting to keep old data must re-seal
    /// it under the returned key.
    fn rotate_key(&self) -> impl Future<Output = VaultResult<SecretKey>> + Send;
}

/// Key storage in the platform-backed secure enclave (Keychain, Secret
/// Service, Credential Manager) under a fixed service/account pair, with the
/// key material base64-encoded. Keyring calls block, so they run on the
/// blocking pool.
pub struct PlatformKeyStore {
    service: String,
    account: String,
}

impl PlatformKeyStore {
    pub fn new(service: &str, account: &str) -> Self {
        PlatformKeyStore {
            service: service.to_string(),
            account: account.to_string(),
        }
    }

    pub fn for_config(config: &StoreConfig) -> Self {
        Self::new(&config.keyring_service, &config.keyring_account)
    }

    fn entry(service: &str, account: &str) -> VaultResult<keyring::Entry> {
        keyring::Entry::new(service, account)
            .map_err(|e| VaultError::KeyStore(e.to_string()))
    }
}

impl KeyStore for PlatformKeyStore {
    async fn load_or_create_key(&self) -> VaultResult<SecretKey> {
        let service = self.service.clone();
        let account = self.account.clone();
        tokio::task::spawn_blocking(move || {
            let entry = Self::entry(&service, &account)?;
            match entry.get_password() {
                Ok(encoded) => decode_key(&encoded),
                Err(keyring::Error::NoEntry) => {
                    let key = generate_key()?;
                    entry
                        .set_password(&BASE64.encode(&key[..]))
                        .map_err(|e| VaultError::KeyStore(e.to_string()))?;
                    info!(%service, "generated new at-rest encryption key");
                    Ok(key)
                }
                Err(e) => Err(VaultError::KeyStore(e.to_string())),
            }
        })
        .await
        .map_err(|e| VaultError::Task(e.to_string()))?
    }

    async fn rotate_key(&self) -> VaultResult<SecretKey> {
        let service = self.service.clone();
        let account = self.account.clone();
        tokio::task::spawn_blocking(move || {
            let entry = Self::entry(&service, &account)?;
            let key = generate_key()?;
            entry
                .set_password(&BASE64.encode(&key[..]))
                .map_err(|e| VaultError::KeyStore(e.to_string()))?;
            info!(%service, "rotated at-rest encryption key");
            Ok(key)
        })
        .await
        .map_err(|e| VaultError::Task(e.to_string()))?
    }
}

fn decode_key(encoded: &str) -> VaultResult<SecretKey> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| VaultError::KeyStore(format!("stored key is not valid base64: {e}")))?;
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    if bytes.len() != KEY_SIZE {
        return Err(VaultError::KeyStore(format!(
            "stored key has wrong length {}",
            bytes.len()
        )));
    }
    key.copy_from_slice(&bytes);
    Ok(key)
}
