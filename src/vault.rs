//! Encryption at rest for bot access tokens.
//!
//! Tokens are sealed with AES-256-GCM under a key derived from the configured
//! secret. Ciphertext (tag appended) and the 96-bit nonce are stored hex-encoded
//! in separate columns.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use sqlx::AnyPool;

use crate::db::{self, DbKind};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct Vault {
    key: [u8; 32],
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    fn sealing_key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| anyhow!("failed to create AES-256-GCM key"))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Returns `(ciphertext_hex, nonce_hex)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<(String, String)> {
        let key = self.sealing_key()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow!("failed to generate random nonce"))?;

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("AES-256-GCM encryption failed"))?;
        Ok((hex::encode(in_out), hex::encode(nonce_bytes)))
    }

    pub fn decrypt(&self, ciphertext_hex: &str, nonce_hex: &str) -> Result<String> {
        let nonce: [u8; NONCE_LEN] = hex::decode(nonce_hex)?
            .try_into()
            .map_err(|_| anyhow!("nonce must be {NONCE_LEN} bytes"))?;
        let mut in_out = hex::decode(ciphertext_hex)?;
        let key = self.sealing_key()?;
        let plaintext = key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("AES-256-GCM decryption failed, wrong key or corrupted data"))?;
        Ok(String::from_utf8(plaintext.to_vec())?)
    }
}

/// Source of decrypted outbound credentials for a bot.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` means the bot has no usable token; that is not an error.
    async fn access_token(&self, bot_id: &str) -> Result<Option<String>>;
}

pub struct VaultCredentialStore {
    pool: AnyPool,
    kind: DbKind,
    vault: Option<Vault>,
}

impl VaultCredentialStore {
    pub fn new(pool: AnyPool, kind: DbKind, vault: Option<Vault>) -> Self {
        Self { pool, kind, vault }
    }
}

#[async_trait]
impl CredentialStore for VaultCredentialStore {
    async fn access_token(&self, bot_id: &str) -> Result<Option<String>> {
        let Some(bot) = db::get_bot(&self.pool, self.kind, bot_id).await? else {
            return Ok(None);
        };
        let (Some(ciphertext), Some(iv)) = (bot.access_token_ciphertext, bot.access_token_iv) else {
            return Ok(None);
        };
        let Some(vault) = self.vault.as_ref() else {
            tracing::warn!(bot_id, "bot has a stored token but no encryption key is configured");
            return Ok(None);
        };
        match vault.decrypt(&ciphertext, &iv) {
            Ok(token) => Ok(Some(token)),
            Err(err) => {
                tracing::error!(bot_id, "cannot decrypt access token: {err:#}");
                Ok(None)
            }
        }
    }
}
