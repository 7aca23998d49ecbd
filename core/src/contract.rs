//! Environment contract consumed by the profile API
//!
//! A flat `KEY=value` file loaded by systemd through `EnvironmentFile=`.
//! It is replaced atomically so the API never reads a half-written file.

use crate::fsutil::{self, MODE_SECRET};
use crate::{Error, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").expect("static regex"))
}

/// Ordered set of contract fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contract {
    fields: Vec<(String, String)>,
}

/// Outcome of publishing a contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractWrite {
    pub path: PathBuf,
    pub changed: bool,
}

impl Contract {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing an earlier value in place
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(field) => field.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn extend(&mut self, fields: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in fields {
            self.set(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn validate(&self) -> Result<()> {
        for (key, value) in &self.fields {
            if !key_regex().is_match(key) {
                return Err(Error::contract(format!("invalid key '{}'", key)));
            }
            if value.contains('\n') || value.contains('\r') {
                return Err(Error::contract(format!("value of {} contains a newline", key)));
            }
        }
        Ok(())
    }

    /// Generate the file content
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Validate and atomically replace the contract at `path` (mode 0600)
    pub fn write(&self, path: &Path) -> Result<ContractWrite> {
        self.validate()?;
        let content = self.render();
        let changed = fsutil::write_if_changed(path, content.as_bytes(), MODE_SECRET)
            .map_err(|e| Error::contract(format!("{}: {}", path.display(), e)))?;
        if changed {
            log::info!("published environment contract {}", path.display());
        } else {
            log::debug!("environment contract {} unchanged", path.display());
        }
        Ok(ContractWrite {
            path: path.to_path_buf(),
            changed,
        })
    }

    /// Parse a previously written contract
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut contract = Self::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                contract.set(key.trim(), value);
            }
        }
        Ok(contract)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Contract {
        let mut contract = Contract::new();
        contract.set("API_TOKEN", "0123abcd");
        contract.set("API_PORT", 8080);
        contract.set("SERVER_PUBLIC_KEY", "abc+/def=");
        contract
    }

    #[test]
    fn test_render_in_insertion_order() {
        let mut contract = sample();
        contract.set("API_PORT", 9090);
        assert_eq!(
            contract.render(),
            "API_TOKEN=0123abcd\nAPI_PORT=9090\nSERVER_PUBLIC_KEY=abc+/def=\n"
        );
    }

    #[test]
    fn test_write_is_owner_only_and_reports_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etc/api.env");

        let first = sample().write(&path).unwrap();
        assert!(first.changed);
        assert_eq!(fsutil::file_mode(&path).unwrap(), 0o600);

        let second = sample().write(&path).unwrap();
        assert!(!second.changed);

        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["api.env".to_string()]);
    }

    #[test]
    fn test_invalid_contract_leaves_previous_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("api.env");
        sample().write(&path).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        let mut bad = sample();
        bad.set("lower_case", "x");
        assert!(matches!(bad.write(&path), Err(Error::ContractWrite(_))));

        let mut bad = sample();
        bad.set("MULTI", "a\nb");
        assert!(matches!(bad.write(&path), Err(Error::ContractWrite(_))));

        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("api.env");
        sample().write(&path).unwrap();
        let read = Contract::read(&path).unwrap();
        assert_eq!(read, sample());
        assert_eq!(read.get("SERVER_PUBLIC_KEY"), Some("abc+/def="));
    }

    #[test]
    fn test_loads_as_dotenv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("api.env");
        sample().write(&path).unwrap();

        let parsed: Vec<(String, String)> = dotenvy::from_path_iter(&path)
            .unwrap()
            .map(|item| item.unwrap())
            .collect();
        assert_eq!(parsed, sample().fields().to_vec());
    }
}
