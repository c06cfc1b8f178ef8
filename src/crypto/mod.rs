//! At-rest encryption: content hashing, key lifecycle, and the encrypted
//! store with generational backups.

pub mod hash;
pub mod keys;
pub mod store;

pub use hash::content_hash;
pub use keys::{KeyStore, PlatformKeyStore, SecretKey, generate_key};
pub use store::EncryptedStore;
