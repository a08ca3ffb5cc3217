use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM wrapper for panel passwords at rest. The key is derived from
/// APP_SECRET; blobs are base64(nonce || ciphertext || tag).
#[derive(Clone)]
pub struct CryptoService {
    key: [u8; 32],
}

impl CryptoService {
    pub fn new(app_secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(app_secret.as_bytes());
        let digest = hasher.finalize();

        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = rand::random::<[u8; NONCE_LEN]>();
        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &self.key,
            Some(&nonce),
            &[],
            plaintext.as_bytes(),
            &mut tag,
        )
        .context("Failed to encrypt panel password")?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len() + TAG_LEN);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        blob.extend_from_slice(&tag);
        Ok(STANDARD.encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let blob = STANDARD
            .decode(encoded.trim())
            .context("Stored password is not valid base64")?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(anyhow!("Stored password blob is truncated"));
        }

        let (nonce, rest) = blob.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        let plaintext = decrypt_aead(Cipher::aes_256_gcm(), &self.key, Some(nonce), &[], ciphertext, tag)
            .map_err(|_| anyhow!("Stored password failed authentication"))?;

        String::from_utf8(plaintext).context("Decrypted password is not UTF-8")
    }
}
