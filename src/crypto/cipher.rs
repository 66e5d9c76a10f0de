use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error};

use super::vault::KeyVault;
use crate::error::{VpnError, VpnResult};

/// Alias of the key protecting stored system VPN secrets
pub const VPN_KEY_ALIAS: &str = concat!("EncryHksAes", "SysVpn");

/// Separates ciphertext and nonce in the stored form
pub const ENCRYPTED_SEPARATOR: char = ',';

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const AAD: [u8; 16] = [0u8; 16];

/// Sealed secret: hex ciphertext (tag included) and hex nonce
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncryptedData {
    pub ciphertext: String,
    pub iv: String,
}

impl EncryptedData {
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

impl fmt::Display for EncryptedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{}{}{}", self.ciphertext, ENCRYPTED_SEPARATOR, self.iv)
    }
}

impl FromStr for EncryptedData {
    type Err = VpnError;

    fn from_str(s: &str) -> VpnResult<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        let (ciphertext, iv) = s
            .split_once(ENCRYPTED_SEPARATOR)
            .ok_or_else(|| VpnError::Crypto("Encrypted value is missing its nonce".to_string()))?;
        Ok(Self {
            ciphertext: ciphertext.to_string(),
            iv: iv.to_string(),
        })
    }
}

/// AES-256-GCM sealing of credential strings with per-user keys
#[derive(Clone)]
pub struct CredentialCipher {
    vault: Arc<dyn KeyVault>,
}

impl CredentialCipher {
    pub fn new(vault: Arc<dyn KeyVault>) -> Self {
        Self { vault }
    }

    fn cipher_for(&self, alias: &str, user_id: i32) -> VpnResult<Aes256Gcm> {
        let key = self.vault.load_key(alias, user_id)?;
        Aes256Gcm::new_from_slice(&key)
            .map_err(|e| VpnError::Crypto(format!("Failed to create cipher: {}", e)))
    }

    fn ensure_key(&self, alias: &str, user_id: i32) -> VpnResult<()> {
        if self.vault.ensure_key(alias, user_id)? {
            debug!("Created key {} for user {}", alias, user_id);
        }
        Ok(())
    }

    /// Seal `plaintext`. The empty string stays empty.
    pub fn encrypt(&self, alias: &str, user_id: i32, plaintext: &str) -> VpnResult<EncryptedData> {
        if plaintext.is_empty() {
            return Ok(EncryptedData::default());
        }
        self.ensure_key(alias, user_id)?;
        let cipher = self.cipher_for(alias, user_id)?;

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload { msg: plaintext.as_bytes(), aad: &AAD },
            )
            .map_err(|e| {
                error!("Encryption failed for user {}: {}", user_id, e);
                VpnError::Crypto(format!("Encryption failed: {}", e))
            })?;

        Ok(EncryptedData {
            ciphertext: hex::encode(sealed),
            iv: hex::encode(nonce_bytes),
        })
    }

    /// Open a value produced by [`encrypt`](Self::encrypt). Empty input stays empty.
    pub fn decrypt(&self, alias: &str, user_id: i32, data: &EncryptedData) -> VpnResult<String> {
        if data.is_empty() {
            return Ok(String::new());
        }
        if !self.vault.key_exists(alias, user_id)? {
            return Err(VpnError::Crypto(format!("Key {} does not exist for user {}", alias, user_id)));
        }
        let cipher = self.cipher_for(alias, user_id)?;

        let sealed = hex::decode(&data.ciphertext)
            .map_err(|e| VpnError::Crypto(format!("Failed to decode ciphertext: {}", e)))?;
        let nonce_bytes = hex::decode(&data.iv)
            .map_err(|e| VpnError::Crypto(format!("Failed to decode nonce: {}", e)))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(VpnError::Crypto(format!("Invalid nonce length {}", nonce_bytes.len())));
        }

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload { msg: &sealed, aad: &AAD },
            )
            .map_err(|_| VpnError::Crypto("Authentication failed, data corrupted or tampered".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| VpnError::Crypto(format!("Decrypted value is not UTF-8: {}", e)))
    }

    /// Seal a field into its stored `ciphertext,iv` form
    pub fn seal_field(&self, user_id: i32, value: &str) -> VpnResult<String> {
        Ok(self.encrypt(VPN_KEY_ALIAS, user_id, value)?.to_string())
    }

    /// Open a stored field. Values not shaped like `ciphertext,iv` predate
    /// encryption and are returned unchanged.
    pub fn open_field(&self, user_id: i32, stored: &str) -> VpnResult<String> {
        if !looks_sealed(stored) {
            return Ok(stored.to_string());
        }
        let data: EncryptedData = stored.parse()?;
        self.decrypt(VPN_KEY_ALIAS, user_id, &data)
    }
}

/// Lowercase hex ciphertext holding at least the GCM tag, then a hex nonce
fn looks_sealed(stored: &str) -> bool {
    let is_hex = |s: &str| s.len() % 2 == 0 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    match stored.split_once(ENCRYPTED_SEPARATOR) {
        Some((ciphertext, iv)) => {
            iv.len() == NONCE_LEN * 2 && is_hex(iv) && ciphertext.len() >= TAG_LEN * 2 && is_hex(ciphertext)
        }
        None => false,
    }
}
