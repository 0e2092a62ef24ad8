//! Per-domain session persistence: cookies, headers, and auth tokens with a
//! TTL, cached in memory and encrypted at rest.
//!
//! The at-rest key is derived from a process-level secret via PBKDF2-SHA256;
//! without the secret the store falls back to a random ephemeral key and
//! persisted records will not survive a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

const KEY_DERIVATION_ROUNDS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

/// Errors surfaced by the session store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("session cipher error: {0}")]
    Cipher(String),
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_dir: PathBuf,
    pub ttl: Duration,
    pub encryption_enabled: bool,
    pub auto_refresh: bool,
    pub refresh_threshold: Duration,
    pub secret_env: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from("data/sessions"),
            ttl: Duration::from_secs(3600),
            encryption_enabled: true,
            auto_refresh: true,
            refresh_threshold: Duration::from_secs(300),
            secret_env: "SESSION_SECRET".to_string(),
        }
    }
}

/// One domain's session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub domain: String,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth_tokens: HashMap<String, String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub is_authenticated: bool,
    #[serde(default)]
    pub csrf_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            domain: domain.into(),
            cookies: HashMap::new(),
            headers: HashMap::new(),
            auth_tokens: HashMap::new(),
            user_agent: None,
            is_authenticated: false,
            csrf_token: None,
            created_at: now,
            last_accessed: now,
            expires_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(expires) if Utc::now() > expires)
    }

    /// Valid means unexpired and carrying something worth reusing.
    pub fn is_valid(&self) -> bool {
        !self.is_expired() && (!self.cookies.is_empty() || !self.auth_tokens.is_empty())
    }

    fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }
}

/// Partial update applied onto an existing (or fresh) record.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub cookies: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub auth_tokens: HashMap<String, String>,
    pub user_agent: Option<String>,
    pub csrf_token: Option<String>,
}

impl SessionUpdate {
    pub fn with_cookies(cookies: HashMap<String, String>) -> Self {
        Self {
            cookies,
            ..Self::default()
        }
    }
}

/// AES-256-GCM cipher for at-rest records.
struct SessionCipher {
    key: [u8; 32],
}

impl SessionCipher {
    /// Derive the key from the configured secret and a salt persisted next
    /// to the session files, or fall back to an ephemeral random key when
    /// the secret is absent.
    fn from_env(secret_env: &str, session_dir: &Path) -> Self {
        match std::env::var(secret_env) {
            Ok(secret) if !secret.is_empty() => Self {
                key: derive_key(secret.as_bytes(), &load_or_create_salt(session_dir)),
            },
            _ => {
                log::warn!(
                    "session secret {secret_env} not set; using ephemeral key, \
                     persisted sessions will not be readable after restart"
                );
                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                Self { key }
            }
        }
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, SessionError> {
        let cipher = Aes256Gcm::new(&self.key.into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|err| SessionError::Cipher(err.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(payload))
    }

    fn decrypt(&self, encoded: &str) -> Result<String, SessionError> {
        let payload = BASE64
            .decode(encoded.trim())
            .map_err(|err| SessionError::Cipher(err.to_string()))?;
        if payload.len() < NONCE_LEN {
            return Err(SessionError::Cipher("payload too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new(&self.key.into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|err| SessionError::Cipher(err.to_string()))?;
        String::from_utf8(plaintext).map_err(|err| SessionError::Cipher(err.to_string()))
    }
}

/// Read the key-derivation salt stored beside the session files, creating
/// it on first use so the derived key is stable across restarts.
fn load_or_create_salt(session_dir: &Path) -> [u8; SALT_LEN] {
    let path = session_dir.join(".session_salt");
    if let Ok(bytes) = std::fs::read(&path)
        && bytes.len() == SALT_LEN
    {
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes);
        return salt;
    }

    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    if std::fs::create_dir_all(session_dir).is_ok() {
        if let Err(err) = std::fs::write(&path, salt) {
            log::warn!("failed to persist session salt: {err}");
        } else {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
            }
        }
    }
    salt
}

fn derive_key(secret: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(secret, salt, KEY_DERIVATION_ROUNDS, &mut key);
    key
}

/// Session store: in-memory cache plus encrypted per-domain files.
pub struct SessionStore {
    config: SessionConfig,
    cipher: SessionCipher,
    cache: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        let cipher = SessionCipher::from_env(&config.secret_env, &config.session_dir);
        Self {
            config,
            cipher,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load a domain's session. Expired records are dropped, never returned.
    pub async fn load(&self, domain: &str) -> Option<SessionRecord> {
        let key = sanitize_domain(domain);

        let mut cache = self.cache.lock().await;
        match cache.get(&key).cloned() {
            Some(record) if record.is_expired() => {
                cache.remove(&key);
                drop(cache);
                let _ = self.delete_file(domain).await;
                return None;
            }
            Some(mut record) => {
                record.touch();
                cache.insert(key, record.clone());
                drop(cache);
                self.maybe_refresh(domain, &record).await;
                return Some(record);
            }
            None => drop(cache),
        }

        let record = self.load_file(domain).await?;
        if record.is_expired() {
            let _ = self.delete_file(domain).await;
            return None;
        }

        let mut cache = self.cache.lock().await;
        let entry = cache.entry(key).or_insert(record);
        entry.touch();
        Some(entry.clone())
    }

    /// Save a full record, stamping TTL and access time.
    pub async fn save(&self, domain: &str, mut record: SessionRecord) -> Result<(), SessionError> {
        if record.expires_at.is_none() {
            record.expires_at = Some(Utc::now() + chrono_duration(self.config.ttl));
        }
        record.touch();

        {
            let mut cache = self.cache.lock().await;
            cache.insert(sanitize_domain(domain), record.clone());
        }
        self.save_file(domain, &record).await?;
        log::debug!("session saved for domain: {domain}");
        Ok(())
    }

    /// Merge a partial update into the domain's session, extending its TTL.
    pub async fn update(&self, domain: &str, update: SessionUpdate) -> Result<(), SessionError> {
        let mut record = self
            .load(domain)
            .await
            .unwrap_or_else(|| SessionRecord::new(domain));

        record.cookies.extend(update.cookies);
        record.headers.extend(update.headers);
        record.auth_tokens.extend(update.auth_tokens);
        if update.user_agent.is_some() {
            record.user_agent = update.user_agent;
        }
        if update.csrf_token.is_some() {
            record.csrf_token = update.csrf_token;
        }
        record.expires_at = Some(Utc::now() + chrono_duration(self.config.ttl));

        self.save(domain, record).await
    }

    pub async fn delete(&self, domain: &str) -> Result<(), SessionError> {
        self.cache.lock().await.remove(&sanitize_domain(domain));
        self.delete_file(domain).await
    }

    /// Drop every expired record from cache and disk.
    pub async fn clear_expired(&self) -> usize {
        let mut cleared = 0usize;

        {
            let mut cache = self.cache.lock().await;
            let expired: Vec<String> = cache
                .iter()
                .filter(|(_, record)| record.is_expired())
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                cache.remove(&key);
                cleared += 1;
            }
        }

        if let Ok(mut entries) = tokio::fs::read_dir(&self.config.session_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(record) = self.read_record(&path).await
                    && record.is_expired()
                {
                    if tokio::fs::remove_file(&path).await.is_ok() {
                        cleared += 1;
                    }
                }
            }
        }

        if cleared > 0 {
            log::info!("cleared {cleared} expired sessions");
        }
        cleared
    }

    /// Cookies for a domain, empty when no valid session exists.
    pub async fn cookies(&self, domain: &str) -> HashMap<String, String> {
        match self.load(domain).await {
            Some(record) if record.is_valid() => record.cookies,
            _ => HashMap::new(),
        }
    }

    pub async fn headers(&self, domain: &str) -> HashMap<String, String> {
        match self.load(domain).await {
            Some(record) if record.is_valid() => record.headers,
            _ => HashMap::new(),
        }
    }

    async fn maybe_refresh(&self, domain: &str, record: &SessionRecord) {
        if !self.config.auto_refresh {
            return;
        }
        let Some(expires) = record.expires_at else {
            return;
        };
        let remaining = expires - Utc::now();
        if remaining < chrono_duration(self.config.refresh_threshold) {
            let mut refreshed = record.clone();
            refreshed.expires_at = Some(Utc::now() + chrono_duration(self.config.ttl));
            if let Err(err) = self.save(domain, refreshed).await {
                log::warn!("failed to refresh session for {domain}: {err}");
            }
        }
    }

    fn session_path(&self, domain: &str) -> PathBuf {
        self.config
            .session_dir
            .join(format!("{}.json", sanitize_domain(domain)))
    }

    async fn save_file(&self, domain: &str, record: &SessionRecord) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.config.session_dir).await?;
        set_permissions(&self.config.session_dir, 0o700).await;

        let json = serde_json::to_string_pretty(record)?;
        let payload = if self.config.encryption_enabled {
            self.cipher.encrypt(&json)?
        } else {
            json
        };

        let path = self.session_path(domain);
        tokio::fs::write(&path, payload).await?;
        set_permissions(&path, 0o600).await;
        Ok(())
    }

    async fn load_file(&self, domain: &str) -> Option<SessionRecord> {
        self.read_record(&self.session_path(domain)).await
    }

    async fn read_record(&self, path: &Path) -> Option<SessionRecord> {
        let raw = tokio::fs::read_to_string(path).await.ok()?;
        let json = if self.config.encryption_enabled {
            match self.cipher.decrypt(&raw) {
                Ok(json) => json,
                Err(err) => {
                    log::warn!("failed to decrypt session file {}: {err}", path.display());
                    let _ = tokio::fs::remove_file(path).await;
                    return None;
                }
            }
        } else {
            raw
        };

        match serde_json::from_str(&json) {
            Ok(record) => Some(record),
            Err(err) => {
                log::warn!("corrupt session file {}: {err}", path.display());
                let _ = tokio::fs::remove_file(path).await;
                None
            }
        }
    }

    async fn delete_file(&self, domain: &str) -> Result<(), SessionError> {
        let path = self.session_path(domain);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

fn sanitize_domain(domain: &str) -> String {
    let normalized = domain
        .trim()
        .to_lowercase()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .replace(['/', ':'], "_");
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| {
        let millis = duration.as_millis().min(i64::MAX as u128);
        chrono::Duration::milliseconds(millis as i64)
    })
}

#[cfg(unix)]
async fn set_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await;
}

#[cfg(not(unix))]
async fn set_permissions(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> SessionStore {
        let config = SessionConfig {
            session_dir: dir.path().to_path_buf(),
            ..SessionConfig::default()
        };
        SessionStore::new(config)
    }

    fn cookie_update() -> SessionUpdate {
        let mut cookies = HashMap::new();
        cookies.insert("sid".to_string(), "abc123".to_string());
        SessionUpdate::with_cookies(cookies)
    }

    #[test]
    fn cipher_round_trip() {
        let cipher = SessionCipher {
            key: derive_key(b"test secret", b"0123456789abcdef"),
        };
        let plaintext = "{\"domain\":\"shop.example\"}";
        let encrypted = cipher.encrypt(plaintext).unwrap();
        assert_ne!(encrypted, plaintext);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn derive_key_is_deterministic() {
        let a = derive_key(b"secret", b"salt");
        let b = derive_key(b"secret", b"salt");
        let c = derive_key(b"other", b"salt");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.update("shop.example", cookie_update()).await.unwrap();
        let record = store.load("shop.example").await.unwrap();
        assert_eq!(record.cookies.get("sid"), Some(&"abc123".to_string()));
        assert!(record.is_valid());
    }

    #[tokio::test]
    async fn expired_sessions_are_never_returned() {
        let dir = TempDir::new().unwrap();
        let config = SessionConfig {
            session_dir: dir.path().to_path_buf(),
            ttl: Duration::ZERO,
            auto_refresh: false,
            ..SessionConfig::default()
        };
        let store = SessionStore::new(config);

        store.update("shop.example", cookie_update()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.load("shop.example").await.is_none());
        assert!(store.cookies("shop.example").await.is_empty());
    }

    #[tokio::test]
    async fn persisted_file_is_not_plaintext() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.update("shop.example", cookie_update()).await.unwrap();

        let path = store.session_path("shop.example");
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!raw.contains("abc123"));
        assert!(!raw.contains("cookies"));
    }

    #[tokio::test]
    async fn update_merges_and_extends_ttl() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.update("shop.example", cookie_update()).await.unwrap();
        let first = store.load("shop.example").await.unwrap();

        let mut more = SessionUpdate::default();
        more.cookies.insert("cart".to_string(), "42".to_string());
        more.user_agent = Some("Mozilla/5.0".to_string());
        store.update("shop.example", more).await.unwrap();

        let second = store.load("shop.example").await.unwrap();
        assert_eq!(second.cookies.len(), 2);
        assert_eq!(second.user_agent.as_deref(), Some("Mozilla/5.0"));
        assert!(second.expires_at >= first.expires_at);
    }

    #[tokio::test]
    async fn delete_removes_cache_and_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.update("shop.example", cookie_update()).await.unwrap();

        store.delete("shop.example").await.unwrap();
        assert!(store.load("shop.example").await.is_none());
        assert!(!store.session_path("shop.example").exists());
    }

    #[tokio::test]
    async fn clear_expired_reports_count() {
        let dir = TempDir::new().unwrap();
        let config = SessionConfig {
            session_dir: dir.path().to_path_buf(),
            ttl: Duration::ZERO,
            auto_refresh: false,
            ..SessionConfig::default()
        };
        let store = SessionStore::new(config);
        store.update("a.example", cookie_update()).await.unwrap();
        store.update("b.example", cookie_update()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let cleared = store.clear_expired().await;
        assert!(cleared >= 2);
    }

    #[test]
    fn sanitize_domain_is_stable_hex() {
        let a = sanitize_domain("shop.example");
        let b = sanitize_domain("https://shop.example");
        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
