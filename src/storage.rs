use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64;
use pbkdf2::pbkdf2_hmac;
use rand_core::OsRng;
use rand_core::TryRngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const APP_DIR: &str = "sftp-share";
const SECRET_FILE: &str = "secret.key";
const KDF_ROUNDS: u32 = 100_000;

pub(crate) mod keys {
    pub(crate) const SERVER: &str = "server";
    pub(crate) const PORT: &str = "port";
    pub(crate) const USERNAME: &str = "username";
    pub(crate) const DESTINATION: &str = "destination";
    pub(crate) const AUTH_METHOD: &str = "auth_method";
    pub(crate) const REMEMBER_PASSWORD: &str = "remember_password";
    pub(crate) const PASSWORD: &str = "password";
    pub(crate) const KEY_ALGORITHM: &str = "key_algorithm";
    pub(crate) const HOST_FINGERPRINT: &str = "host_fingerprint";

    pub(crate) const DEFAULT_PORT: &str = "22";
    pub(crate) const DEFAULT_AUTH_METHOD: &str = "password";
    pub(crate) const DEFAULT_KEY_ALGORITHM: &str = "dsa";

    pub(crate) const BOOL_KEYS: &[&str] = &[REMEMBER_PASSWORD];
    pub(crate) const SECRET_KEYS: &[&str] = &[PASSWORD];
    pub(crate) const ALL: &[&str] = &[
        SERVER,
        PORT,
        USERNAME,
        DESTINATION,
        AUTH_METHOD,
        REMEMBER_PASSWORD,
        PASSWORD,
        KEY_ALGORITHM,
        HOST_FINGERPRINT,
    ];
}

/// Key/value preferences the transfer flow reads and writes.
pub(crate) trait Settings {
    fn get_string(&self, key: &str, default: &str) -> String;
    fn get_bool(&self, key: &str, default: bool) -> bool;
    fn set_string(&mut self, key: &str, value: &str) -> Result<()>;
    fn set_bool(&mut self, key: &str, value: bool) -> Result<()>;
}

pub(crate) fn config_path() -> Result<PathBuf> {
    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_DIR);
        dir.push("settings.json");
        return Ok(dir);
    }
    let mut fallback = std::env::current_dir().context("current dir")?;
    fallback.push("sftp-share-settings.json");
    Ok(fallback)
}

fn data_dir() -> Result<PathBuf> {
    if let Some(mut dir) = dirs::data_local_dir() {
        dir.push(APP_DIR);
        return Ok(dir);
    }
    let mut fallback = std::env::current_dir().context("current dir")?;
    fallback.push(".sftp-share");
    Ok(fallback)
}

pub(crate) fn log_path() -> Result<PathBuf> {
    let mut path = data_dir()?;
    path.push("sftp-share.log");
    Ok(path)
}

pub(crate) fn keys_dir() -> Result<PathBuf> {
    let mut path = data_dir()?;
    path.push("keys");
    Ok(path)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EncryptedBlob {
    pub(crate) nonce: String,
    pub(crate) ciphertext: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    salt_b64: String,
    #[serde(default)]
    values: BTreeMap<String, String>,
    #[serde(default)]
    flags: BTreeMap<String, bool>,
    #[serde(default)]
    secrets: BTreeMap<String, EncryptedBlob>,
}

/// Settings persisted as JSON. Loaded once, written back on every change.
pub(crate) struct JsonSettings {
    path: PathBuf,
    file: SettingsFile,
    key: Vec<u8>,
}

impl JsonSettings {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let mut file = if path.exists() {
            let content = fs::read_to_string(path).context("read settings file")?;
            serde_json::from_str(&content).context("parse settings file")?
        } else {
            SettingsFile::default()
        };
        let fresh_salt = file.salt_b64.is_empty();
        if fresh_salt {
            let mut salt = [0u8; 16];
            OsRng
                .try_fill_bytes(&mut salt)
                .map_err(|err| anyhow::anyhow!("random salt failed: {err:?}"))?;
            file.salt_b64 = Base64.encode(salt);
        }
        let salt = Base64.decode(&file.salt_b64).context("decode salt")?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let secret = load_or_init_secret(&dir.join(SECRET_FILE))?;
        let key = derive_key(&secret, &salt);
        let settings = Self {
            path: path.to_path_buf(),
            file,
            key,
        };
        if fresh_salt {
            settings.save()?;
        }
        Ok(settings)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create settings dir")?;
        }
        let content = serde_json::to_string_pretty(&self.file).context("serialize settings")?;
        fs::write(&self.path, content).context("write settings file")?;
        Ok(())
    }
}

impl Settings for JsonSettings {
    fn get_string(&self, key: &str, default: &str) -> String {
        if keys::SECRET_KEYS.contains(&key) {
            return self
                .file
                .secrets
                .get(key)
                .and_then(|blob| decrypt_string(blob, &self.key).ok())
                .unwrap_or_else(|| default.to_string());
        }
        self.file
            .values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.file.flags.get(key).copied().unwrap_or(default)
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        if keys::SECRET_KEYS.contains(&key) {
            let blob = encrypt_string(value, &self.key)?;
            self.file.secrets.insert(key.to_string(), blob);
        } else {
            self.file.values.insert(key.to_string(), value.to_string());
        }
        self.save()
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.file.flags.insert(key.to_string(), value);
        self.save()
    }
}

/// Parses `true`/`false` style input for boolean settings.
pub(crate) fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => anyhow::bail!("'{other}' is not a boolean"),
    }
}

fn load_or_init_secret(path: &Path) -> Result<String> {
    if path.exists() {
        let content = fs::read_to_string(path).context("read secret file")?;
        return Ok(content.trim().to_string());
    }
    let mut secret = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut secret)
        .map_err(|err| anyhow::anyhow!("random secret failed: {err:?}"))?;
    let encoded = Base64.encode(secret);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create settings dir")?;
    }
    write_private(path, encoded.as_bytes()).context("write secret file")?;
    Ok(encoded)
}

/// Writes a file readable only by the owner.
pub(crate) fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()
}

pub(crate) fn derive_key(password: &str, salt: &[u8]) -> Vec<u8> {
    let mut key = vec![0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KDF_ROUNDS, &mut key);
    key
}

pub(crate) fn encrypt_string(plaintext: &str, key: &[u8]) -> Result<EncryptedBlob> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; 12];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|err| anyhow::anyhow!("random nonce failed: {err:?}"))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|err| anyhow::anyhow!("encrypt failed: {err:?}"))?;
    Ok(EncryptedBlob {
        nonce: Base64.encode(nonce_bytes),
        ciphertext: Base64.encode(ciphertext),
    })
}

pub(crate) fn decrypt_string(blob: &EncryptedBlob, key: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce_bytes = Base64.decode(&blob.nonce).context("decode nonce")?;
    let ciphertext = Base64
        .decode(&blob.ciphertext)
        .context("decode ciphertext")?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|err| anyhow::anyhow!("decrypt failed: {err:?}"))?;
    let text = String::from_utf8(plaintext).context("decode utf8")?;
    Ok(text)
}

#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemorySettings {
    strings: BTreeMap<String, String>,
    bools: BTreeMap<String, bool>,
    pub(crate) writes: Vec<String>,
}

#[cfg(test)]
impl MemorySettings {
    /// Seeds a value without counting it as a write.
    pub(crate) fn put(&mut self, key: &str, value: &str) {
        self.strings.insert(key.to_string(), value.to_string());
    }

    pub(crate) fn put_bool(&mut self, key: &str, value: bool) {
        self.bools.insert(key.to_string(), value);
    }
}

#[cfg(test)]
impl Settings for MemorySettings {
    fn get_string(&self, key: &str, default: &str) -> String {
        self.strings
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.bools.get(key).copied().unwrap_or(default)
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.writes.push(key.to_string());
        self.put(key, value);
        Ok(())
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.writes.push(key.to_string());
        self.put_bool(key, value);
        Ok(())
    }
}
