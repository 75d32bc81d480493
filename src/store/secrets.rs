use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::path::Path;

const NONCE_LEN: usize = 12;
const KEY_FILE: &str = "secret.key";

/// Encrypts mirror credentials at rest. The key is derived from an
/// operator-supplied secret when one is configured; otherwise a random key
/// is generated under the data directory on first start and reused after.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Load the generated key from `data_dir`, creating it on first use.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(KEY_FILE);
        let raw = if path.exists() {
            let encoded = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            BASE64
                .decode(encoded.trim())
                .with_context(|| format!("decoding {}", path.display()))?
        } else {
            let mut key = vec![0u8; 32];
            use rand::RngCore;
            rand::rngs::OsRng.fill_bytes(&mut key);
            std::fs::write(&path, BASE64.encode(&key))
                .with_context(|| format!("writing {}", path.display()))?;
            restrict_permissions(&path)?;
            tracing::info!("store: generated credential key at {}", path.display());
            key
        };
        anyhow::ensure!(raw.len() == 32, "credential key must be 32 bytes, got {}", raw.len());
        let key = Key::<Aes256Gcm>::from_slice(&raw);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt `plaintext` into `base64(nonce || ciphertext)`.
    pub fn seal(&self, plaintext: &str) -> String {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .expect("aes-gcm encryption is infallible for in-memory buffers");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        BASE64.encode(out)
    }

    pub fn open(&self, sealed: &str) -> Result<String> {
        let raw = BASE64.decode(sealed).context("sealed credential is not base64")?;
        anyhow::ensure!(raw.len() > NONCE_LEN, "sealed credential too short");
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("credential decryption failed (wrong key?)"))?;
        String::from_utf8(plaintext).context("decrypted credential is not utf-8")
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let secrets = SecretBox::from_secret("operator-secret");
        let sealed = secrets.seal("s3cret");
        assert_ne!(sealed, "s3cret");
        assert_eq!(secrets.open(&sealed).unwrap(), "s3cret");
    }

    #[test]
    fn nonce_makes_ciphertexts_differ() {
        let secrets = SecretBox::from_secret("operator-secret");
        assert_ne!(secrets.seal("same"), secrets.seal("same"));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = SecretBox::from_secret("key-a").seal("s3cret");
        assert!(SecretBox::from_secret("key-b").open(&sealed).is_err());
    }

    #[test]
    fn generated_key_is_stable_across_loads() {
        let dir = std::env::temp_dir().join(format!("mirrorgate-keytest-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let first = SecretBox::load_or_generate(&dir).unwrap();
        let sealed = first.seal("s3cret");
        let second = SecretBox::load_or_generate(&dir).unwrap();
        assert_eq!(second.open(&sealed).unwrap(), "s3cret");
        std::fs::remove_dir_all(&dir).ok();
    }
}
