//! Credential protection
//!
//! Secrets stored with VPN configurations are sealed with AES-256-GCM under a
//! per-user key held by a [`KeyVault`]. Key material never leaves the vault
//! boundary except to build a cipher instance for one operation.

mod cipher;
mod vault;

pub use cipher::{CredentialCipher, EncryptedData, ENCRYPTED_SEPARATOR, VPN_KEY_ALIAS};
pub use vault::{FileKeyVault, KeyVault, MemoryKeyVault, KEY_LEN};
