//! Long-lived secret material with at-most-once generation
//!
//! A secret lives in `<secrets_dir>/<name>` with mode 0600. Once it exists it
//! is returned as-is on every later run; generation only happens when the file
//! is absent, and a freshly generated value is handed out only after it has
//! been persisted and read back.

use crate::fsutil::{self, MODE_PRIVATE_DIR, MODE_SECRET};
use crate::{Error, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use x25519_dalek::{PublicKey, StaticSecret};

/// Canonical secret names
pub mod names {
    pub const API_TOKEN: &str = "api-token";
    pub const DB_PASSWORD: &str = "db-password";
    pub const TUNNEL_PRIVATE_KEY: &str = "tunnel-private-key";
    pub const AWG_OBFUSCATION: &str = "awg-obfuscation";
    pub const REALITY_PRIVATE_KEY: &str = "reality-private-key";
    pub const REALITY_SHORT_ID: &str = "reality-short-id";
    pub const OPENVPN_CA: &str = "openvpn-ca";
    pub const OPENVPN_SERVER_CERT: &str = "openvpn-server-cert";
    pub const TLS_CRYPT_V2_SERVER: &str = "tls-crypt-v2-server";
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,63}$").expect("static regex"))
}

/// Owner of every persisted secret on the host
#[derive(Debug)]
pub struct SecretStore {
    dir: PathBuf,
    generated: Vec<String>,
}

impl SecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            generated: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        if !name_regex().is_match(name) {
            return Err(Error::secret(format!("invalid secret name '{}'", name)));
        }
        Ok(self.dir.join(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Names generated (not loaded) through this store instance
    pub fn generated(&self) -> &[String] {
        &self.generated
    }

    /// The persisted secret `name`, if there is one. Never generates.
    pub fn load(&self, name: &str) -> Result<Option<String>> {
        let path = self.path(name)?;
        if !path.is_file() {
            return Ok(None);
        }
        let value = fs::read_to_string(&path)
            .map_err(|e| Error::secret(format!("reading {}: {}", path.display(), e)))?;
        if value.is_empty() {
            return Err(Error::secret(format!(
                "secret '{}' exists but is empty; remove it or regenerate explicitly",
                name
            )));
        }
        Ok(Some(value))
    }

    /// Load the persisted secret `name`, or generate, persist and verify it
    pub fn obtain(
        &mut self,
        name: &str,
        generator: impl FnOnce() -> Result<String>,
    ) -> Result<String> {
        if let Some(value) = self.load(name)? {
            return Ok(value);
        }
        let path = self.path(name)?;

        let value = generator()?;
        if value.is_empty() {
            return Err(Error::secret(format!("generator for '{}' produced nothing", name)));
        }

        fsutil::ensure_dir(&self.dir, MODE_PRIVATE_DIR)
            .and_then(|_| fsutil::write_atomic(&path, value.as_bytes(), MODE_SECRET))
            .map_err(|e| Error::secret(format!("persisting '{}': {}", name, e)))?;

        let persisted = fs::read_to_string(&path)
            .map_err(|e| Error::secret(format!("verifying '{}': {}", name, e)))?;
        if persisted != value {
            return Err(Error::secret(format!(
                "secret '{}' did not read back as written",
                name
            )));
        }

        log::info!("generated secret '{}'", name);
        self.generated.push(name.to_string());
        Ok(value)
    }

    /// Remove a persisted secret so the next `obtain` regenerates it.
    /// Only called for explicit operator requests.
    pub fn discard(&mut self, name: &str) -> Result<bool> {
        let path = self.path(name)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)
            .map_err(|e| Error::secret(format!("removing '{}': {}", name, e)))?;
        log::warn!("discarded secret '{}' on operator request", name);
        Ok(true)
    }
}

/// Read-only view over the secrets one backend needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretBundle {
    values: BTreeMap<String, String>,
}

impl SecretBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: String) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Result<&str> {
        self.values
            .get(name)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::secret(format!("secret '{}' is not part of this bundle", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }
}

// ==================== Generators ====================

/// `bytes` random bytes from the OS, hex encoded
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Tokens and passwords: 32 random bytes
pub fn token() -> Result<String> {
    Ok(random_hex(32))
}

/// Protocol discriminator (Reality short id): 8 bytes, 16 hex chars
pub fn short_id() -> Result<String> {
    Ok(random_hex(8))
}

/// Text encoding of a 32-byte X25519 key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    /// Standard padded base64 (`wg genkey`)
    Standard,
    /// URL-safe base64 without padding (`xray x25519`)
    UrlSafe,
}

impl KeyEncoding {
    fn encode(&self, bytes: &[u8]) -> String {
        match self {
            KeyEncoding::Standard => STANDARD.encode(bytes),
            KeyEncoding::UrlSafe => URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    fn decode(&self, text: &str) -> Result<[u8; 32]> {
        let bytes = match self {
            KeyEncoding::Standard => STANDARD.decode(text.trim()),
            KeyEncoding::UrlSafe => URL_SAFE_NO_PAD.decode(text.trim()),
        }
        .map_err(|e| Error::secret(format!("invalid key encoding: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| Error::secret("X25519 keys must be 32 bytes"))
    }
}

/// New clamped X25519 private key
pub fn x25519_private_key(encoding: KeyEncoding) -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
    Ok(encoding.encode(&bytes))
}

/// Public half of an encoded X25519 private key, in the same encoding
pub fn x25519_public_key(private: &str, encoding: KeyEncoding) -> Result<String> {
    let secret = StaticSecret::from(encoding.decode(private)?);
    let public = PublicKey::from(&secret);
    Ok(encoding.encode(public.as_bytes()))
}
