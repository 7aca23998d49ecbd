//! Configuration management: provisioner settings, host filesystem layout
//! and the install record that pins a host to one backend

use crate::{BackendKind, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Current config version for migration support
pub const CONFIG_VERSION: u32 = 1;

/// Provisioner settings loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub version: u32,
    pub layout: LayoutSection,
    pub api: ApiSection,
    pub readiness: ReadinessPolicy,
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutSection {
    /// Filesystem root every well-known path is resolved against
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    /// Directory holding the profile API sources
    pub install_dir: PathBuf,
    /// uvicorn executable used to serve the API module
    pub uvicorn: PathBuf,
    /// systemd unit name for the API process
    pub unit_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Client binary used to run the bootstrap SQL as the local admin
    pub client: String,
    /// systemd unit of the database server, ordered before the API
    pub unit_name: String,
}

/// Bounded wait used for daemon readiness probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval_ms: 1000,
        }
    }
}

impl ReadinessPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            layout: LayoutSection {
                root: PathBuf::from("/"),
            },
            api: ApiSection {
                install_dir: PathBuf::from("/opt/vpn-api"),
                uvicorn: PathBuf::from("/opt/vpn-api/venv/bin/uvicorn"),
                unit_name: "vpn-api.service".to_string(),
            },
            readiness: ReadinessPolicy::default(),
            database: DatabaseSection {
                client: "mysql".to_string(),
                unit_name: "mysql.service".to_string(),
            },
        }
    }
}

impl ProvisionConfig {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/vpn-provision/provision.toml")
    }

    /// Load config from `path` if it exists, otherwise use built-in defaults.
    /// Unlike state files, a missing config is not written back.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn layout(&self) -> HostLayout {
        HostLayout::new(&self.layout.root)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.readiness.attempts == 0 {
            return Err(Error::validation("readiness attempts must be at least 1"));
        }
        if !self.api.unit_name.ends_with(".service") {
            return Err(Error::validation(format!(
                "API unit name '{}' must end in .service",
                self.api.unit_name
            )));
        }
        if !self.api.uvicorn.is_absolute() || !self.api.install_dir.is_absolute() {
            return Err(Error::validation("API paths must be absolute"));
        }
        Ok(())
    }
}

/// Well-known host locations. Paths are kept as the daemons see them
/// (absolute) and resolved under `root` only when touching the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub const SECRETS_DIR: &'static str = "/etc/vpn-provision/secrets";
    pub const CONTRACT: &'static str = "/etc/vpn-provision/api.env";
    pub const INSTALL_RECORD: &'static str = "/var/lib/vpn-provision/install.toml";
    pub const LOCK: &'static str = "/run/vpn-provision.lock";
    pub const SYSTEMD_DIR: &'static str = "/etc/systemd/system";
    pub const SYSCTL_CONF: &'static str = "/etc/sysctl.d/99-vpn-provision.conf";
    pub const AWG_CONF_DIR: &'static str = "/etc/amnezia/amneziawg";
    pub const XRAY_CONFIG: &'static str = "/usr/local/etc/xray/config.json";
    pub const EASYRSA_DIR: &'static str = "/etc/openvpn/easy-rsa";
    pub const OPENVPN_SERVER_DIR: &'static str = "/etc/openvpn/server";
    pub const CLIENT_KEYS_DIR: &'static str = "/etc/openvpn/clients";
    pub const STATUS_LOG: &'static str = "/var/log/openvpn-status.log";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a host-absolute path under the layout root
    pub fn resolve(&self, host_path: impl AsRef<Path>) -> PathBuf {
        let p = host_path.as_ref();
        let relative = p.strip_prefix("/").unwrap_or(p);
        self.root.join(relative)
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.resolve(Self::SECRETS_DIR)
    }

    pub fn contract_path(&self) -> PathBuf {
        self.resolve(Self::CONTRACT)
    }

    pub fn install_record_path(&self) -> PathBuf {
        self.resolve(Self::INSTALL_RECORD)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.resolve(Self::LOCK)
    }

    pub fn unit_path(&self, unit: &str) -> PathBuf {
        self.resolve(Path::new(Self::SYSTEMD_DIR).join(unit))
    }

    pub fn sysctl_conf(&self) -> PathBuf {
        self.resolve(Self::SYSCTL_CONF)
    }

    /// Host path of the AmneziaWG interface config
    pub fn awg_conf(iface: &str) -> PathBuf {
        Path::new(Self::AWG_CONF_DIR).join(format!("{}.conf", iface))
    }

    pub fn pki_dir() -> PathBuf {
        Path::new(Self::EASYRSA_DIR).join("pki")
    }

    pub fn tls_crypt_server_key() -> PathBuf {
        Path::new(Self::OPENVPN_SERVER_DIR).join("tc_v2_server.key")
    }

    pub fn openvpn_server_conf() -> PathBuf {
        Path::new(Self::OPENVPN_SERVER_DIR).join("server.conf")
    }
}

/// Marker recording which backend a host was provisioned for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub version: u32,
    pub backend: BackendKind,
    pub first_provisioned: DateTime<Utc>,
    pub last_provisioned: DateTime<Utc>,
}

impl InstallRecord {
    pub fn new(backend: BackendKind) -> Self {
        let now = Utc::now();
        Self {
            version: CONFIG_VERSION,
            backend,
            first_provisioned: now,
            last_provisioned: now,
        }
    }

    /// Load the record, `None` on a host that was never provisioned
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let record: Self = toml::from_str(&content)?;
        Ok(Some(record))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Refuse to provision a second, different backend on the same host
    pub fn check_exclusive(existing: Option<&Self>, requested: BackendKind) -> Result<()> {
        match existing {
            Some(record) if record.backend != requested => Err(Error::validation(format!(
                "host is already provisioned for {} (since {}); refusing to add {}",
                record.backend,
                record.first_provisioned.format("%Y-%m-%d"),
                requested
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = ProvisionConfig::default();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.api.unit_name, "vpn-api.service");
        assert_eq!(config.readiness.attempts, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provision.toml");

        let mut config = ProvisionConfig::default();
        config.readiness.attempts = 5;
        config.save_to(&path).unwrap();

        let loaded = ProvisionConfig::load(&path).unwrap();
        assert_eq!(loaded.readiness.attempts, 5);
        assert_eq!(loaded.api.uvicorn, config.api.uvicorn);
    }

    #[test]
    fn test_missing_config_is_not_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = ProvisionConfig::load_or_default(&path).unwrap();
        assert_eq!(config.layout.root, PathBuf::from("/"));
        assert!(!path.exists());
    }

    #[test]
    fn test_layout_resolves_under_root() {
        let layout = HostLayout::new("/tmp/host");
        assert_eq!(
            layout.contract_path(),
            PathBuf::from("/tmp/host/etc/vpn-provision/api.env")
        );
        assert_eq!(
            layout.resolve(HostLayout::awg_conf("awg0")),
            PathBuf::from("/tmp/host/etc/amnezia/amneziawg/awg0.conf")
        );
        assert_eq!(
            HostLayout::new("/").unit_path("vpn-api.service"),
            PathBuf::from("/etc/systemd/system/vpn-api.service")
        );
    }

    #[test]
    fn test_install_record_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("install.toml");
        assert!(InstallRecord::load(&path).unwrap().is_none());

        InstallRecord::new(BackendKind::Amnezia).save(&path).unwrap();
        let loaded = InstallRecord::load(&path).unwrap().unwrap();
        assert_eq!(loaded.backend, BackendKind::Amnezia);

        assert!(InstallRecord::check_exclusive(Some(&loaded), BackendKind::Amnezia).is_ok());
        assert!(InstallRecord::check_exclusive(Some(&loaded), BackendKind::OpenVpn).is_err());
        assert!(InstallRecord::check_exclusive(None, BackendKind::Reality).is_ok());
    }
}
