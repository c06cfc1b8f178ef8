//! AEAD-encrypted dataset storage with generational backups.
//!
//! Each record on disk is base64 of `nonce ‖ ciphertext`, AES-256-GCM sealed
//! under the install key with an associated-data string binding the record to
//! its application/schema/user context. Three generations are kept
//! (`events.json.enc`, `.bak1`, `.bak2`); reads fall through the chain and
//! heal the primary forward.

use std::path::{Path, PathBuf};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, OsRng, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::Value;
use tracing::{debug, warn};

use crate::crypto::hash::content_hash;
use crate::crypto::keys::SecretKey;
use crate::error::{VaultError, VaultResult};

const PRIMARY_FILE: &str = "events.json.enc";
const BACKUP1_FILE: &str = "events.json.enc.bak1";
const BACKUP2_FILE: &str = "events.json.enc.bak2";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

pub struct EncryptedStore {
    dir: PathBuf,
    key: SecretKey,
    context: String,
}

impl EncryptedStore {
    pub fn new(dir: &Path, key: SecretKey, context: String) -> Self {
        EncryptedStore {
            dir: dir.to_path_buf(),
            key,
            context,
        }
    }

    fn cipher(&self) -> VaultResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key[..])
            .map_err(|_| VaultError::Crypto("invalid key length".into()))
    }

    /// AEAD-seal a plaintext under a fresh random nonce. Output is
    /// `nonce ‖ ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| VaultError::Crypto(format!("secure RNG unavailable: {e}")))?;

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: self.context.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Crypto("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open a `nonce ‖ ciphertext` blob. A wrong key, tampered bytes, or a
    /// wrong context all surface as the same typed decryption failure.
    pub fn open(&self, blob: &[u8]) -> VaultResult<Vec<u8>> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::Crypto("encrypted record too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        self.cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: self.context.as_bytes(),
                },
            )
            .map_err(|_| {
                VaultError::Crypto(
                    "decryption failed (wrong key, tampered data, or wrong context)".into(),
                )
            })
    }

    /// Durable write: rotate the two prior generations, then land the new
    /// primary via temp-file-then-rename, so a crash mid-write never loses
    /// all three generations at once.
    pub async fn save_events_json(&self, value: &Value) -> VaultResult<()> {
        let plaintext =
            serde_json::to_vec(value).map_err(|e| VaultError::Serialization(e.to_string()))?;
        let encoded = BASE64.encode(self.seal(&plaintext)?);

        tokio::fs::create_dir_all(&self.dir).await?;
        let primary = self.dir.join(PRIMARY_FILE);
        let bak1 = self.dir.join(BACKUP1_FILE);
        let bak2 = self.dir.join(BACKUP2_FILE);

        if tokio::fs::metadata(&bak1).await.is_ok() {
            tokio::fs::rename(&bak1, &bak2).await?;
        }
        if tokio::fs::metadata(&primary).await.is_ok() {
            tokio::fs::rename(&primary, &bak1).await?;
        }

        let temp = self.dir.join(format!("{PRIMARY_FILE}.tmp"));
        tokio::fs::write(&temp, encoded).await?;
        tokio::fs::rename(&temp, &primary).await?;
        Ok(())
    }

    /// Durable read with self-healing: primary, then each backup, in order.
    /// The first generation that opens is adopted; if it was not the primary,
    /// it is immediately re-sealed and rewritten as the new primary. All
    /// three failing means "no valid local data", not an error.
    pub async fn load_events_json(&self) -> VaultResult<Option<Value>> {
        for (generation, name) in [PRIMARY_FILE, BACKUP1_FILE, BACKUP2_FILE]
            .iter()
            .enumerate()
        {
            let Some(value) = self.try_generation(name).await else {
                continue;
            };
            if generation > 0 {
                warn!(recovered_from = name, "primary encrypted record invalid, healing from backup");
                self.save_events_json(&value).await?;
            }
            return Ok(Some(value));
        }
        Ok(None)
    }

    async fn try_generation(&self, name: &str) -> Option<Value> {
        let path = self.dir.join(name);
        let encoded = match tokio::fs::read_to_string(&path).await {
            Ok(encoded) => encoded,
            Err(e) => {
                debug!(file = name, error = %e, "encrypted generation unreadable");
                return None;
            }
        };
        let blob = match BASE64.decode(encoded.trim()) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(file = name, error = %e, "encrypted generation is not valid base64");
                return None;
            }
        };
        let plaintext = match self.open(&blob) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(file = name, error = %e, "encrypted generation failed to open");
                return None;
            }
        };
        match serde_json::from_slice(&plaintext) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(file = name, error = %e, "decrypted payload is not valid JSON");
                None
            }
        }
    }

    /// Decide whether a sync round-trip is needed, purely from content
    /// hashes — an optimization to skip network calls, never a substitute
    /// for AEAD integrity.
    pub async fn sync_needed(&self, server_hash: Option<&str>) -> VaultResult<bool> {
        let local = self.load_events_json().await?;
        let server = server_hash.filter(|h| !h.is_empty());
        Ok(match (local, server) {
            // Nothing anywhere: no point in a round-trip.
            (None, None) => false,
            // Server has data we lack: must fetch.
            (None, Some(_)) => true,
            // We have data the server lacks: must push.
            (Some(_), None) => true,
            (Some(local), Some(server)) => content_hash(&local) != server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_key;
    use serde_json::json;

    fn store_with(dir: &Path, key: SecretKey, context: &str) -> EncryptedStore {
        EncryptedStore::new(dir, key, context.to_string())
    }

    fn store(dir: &Path) -> EncryptedStore {
        store_with(dir, generate_key().unwrap(), "calvault:v1:test")
    }

    #[test]
    fn seal_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let blob = store.seal(b"{\"hello\":1}").unwrap();
        assert_eq!(store.open(&blob).unwrap(), b"{\"hello\":1}");
    }

    #[test]
    fn nonces_are_fresh_per_seal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let a = store.seal(b"same").unwrap();
        let b = store.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn open_rejects_tampering_wrong_key_and_wrong_context() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_key().unwrap();
        let store = store_with(dir.path(), key.clone(), "calvault:v1:alice");
        let mut blob = store.seal(b"secret").unwrap();

        // Wrong context.
        let other_context = store_with(dir.path(), key, "calvault:v1:bob");
        assert!(other_context.open(&blob).is_err());

        // Wrong key.
        let other_key = store_with(dir.path(), generate_key().unwrap(), "calvault:v1:alice");
        assert!(other_key.open(&blob).is_err());

        // Tampered ciphertext.
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(store.open(&blob).is_err());

        // Truncated record.
        assert!(store.open(&blob[..NONCE_SIZE]).is_err());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.load_events_json().await.unwrap(), None);

        let value = json!({"instances": [{"instance_id": "i1"}]});
        store.save_events_json(&value).await.unwrap();
        assert_eq!(store.load_events_json().await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn generations_rotate_oldest_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        for n in 1..=4 {
            store.save_events_json(&json!({ "gen": n })).await.unwrap();
        }

        // Primary holds 4; killing it surfaces 3, then 2; 1 rotated away.
        tokio::fs::write(dir.path().join(PRIMARY_FILE), "garbage")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(BACKUP1_FILE), "garbage")
            .await
            .unwrap();
        assert_eq!(
            store.load_events_json().await.unwrap(),
            Some(json!({ "gen": 2 }))
        );
    }

    #[tokio::test]
    async fn corrupt_primary_heals_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save_events_json(&json!({ "gen": 1 })).await.unwrap();
        store.save_events_json(&json!({ "gen": 2 })).await.unwrap();

        tokio::fs::write(dir.path().join(PRIMARY_FILE), "corrupted")
            .await
            .unwrap();

        // Recovered from bak1 (gen 1) and healed forward.
        assert_eq!(
            store.load_events_json().await.unwrap(),
            Some(json!({ "gen": 1 }))
        );

        // The primary now opens on its own: remove both backups and re-read.
        tokio::fs::remove_file(dir.path().join(BACKUP1_FILE))
            .await
            .unwrap();
        tokio::fs::remove_file(dir.path().join(BACKUP2_FILE))
            .await
            .unwrap();
        assert_eq!(
            store.load_events_json().await.unwrap(),
            Some(json!({ "gen": 1 }))
        );
    }

    #[tokio::test]
    async fn all_generations_invalid_means_no_local_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save_events_json(&json!({ "gen": 1 })).await.unwrap();

        for name in [PRIMARY_FILE, BACKUP1_FILE, BACKUP2_FILE] {
            tokio::fs::write(dir.path().join(name), "junk").await.unwrap();
        }
        assert_eq!(store.load_events_json().await.unwrap(), None);
    }

    #[tokio::test]
    async fn sync_needed_truth_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        // No local data.
        assert!(!store.sync_needed(None).await.unwrap());
        assert!(!store.sync_needed(Some("")).await.unwrap());
        assert!(store.sync_needed(Some("b3:abc")).await.unwrap());

        let value = json!({"instances": []});
        store.save_events_json(&value).await.unwrap();
        let local_hash = content_hash(&value);

        // Local data present.
        assert!(store.sync_needed(None).await.unwrap());
        assert!(!store.sync_needed(Some(&local_hash)).await.unwrap());
        assert!(store.sync_needed(Some("b3:different")).await.unwrap());
    }
}
