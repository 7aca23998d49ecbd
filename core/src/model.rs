//! Domain model types for VPN host provisioning

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

/// Tunnel technology provisioned on the host. Exactly one per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// AmneziaWG obfuscated UDP tunnel
    Amnezia,
    /// Xray VLESS + Reality TLS camouflage
    Reality,
    /// OpenVPN with a private CA and tls-crypt-v2
    OpenVpn,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Amnezia => "amnezia",
            BackendKind::Reality => "reality",
            BackendKind::OpenVpn => "openvpn",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::Amnezia => "AmneziaWG",
            BackendKind::Reality => "Xray VLESS Reality",
            BackendKind::OpenVpn => "OpenVPN (tls-crypt-v2)",
        }
    }

    pub fn default_listen_port(&self) -> u16 {
        match self {
            BackendKind::Amnezia => 51830,
            BackendKind::Reality => 443,
            BackendKind::OpenVpn => 21,
        }
    }

    /// Tunnel subnet handed to clients; Xray proxies in userspace and has none.
    pub fn default_subnet(&self) -> Option<Ipv4Network> {
        let net = match self {
            BackendKind::Amnezia => Ipv4Network::new([10, 100, 10, 0].into(), 24),
            BackendKind::Reality => return None,
            BackendKind::OpenVpn => Ipv4Network::new([10, 8, 0, 0].into(), 24),
        };
        net.ok()
    }

    /// Database and user names the profile API expects by default
    pub fn default_database(&self) -> (&'static str, &'static str) {
        match self {
            BackendKind::Amnezia => ("wg_panel", "wg_user"),
            BackendKind::Reality => ("xray_panel", "xray_user"),
            BackendKind::OpenVpn => ("ovpn_panel", "ovpn_user"),
        }
    }

    /// Python module served by uvicorn for the profile API
    pub fn api_module(&self) -> &'static str {
        match self {
            BackendKind::Amnezia => "wg_service:app",
            BackendKind::Reality => "xray_service:app",
            BackendKind::OpenVpn => "ovpn_service:app",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amnezia" | "awg" | "amneziawg" => Ok(BackendKind::Amnezia),
            "reality" | "xray" => Ok(BackendKind::Reality),
            "openvpn" | "ovpn" => Ok(BackendKind::OpenVpn),
            other => Err(format!(
                "unknown backend '{}', expected amnezia, reality or openvpn",
                other
            )),
        }
    }
}

/// Orchestrator progress. Each stage is reached only after the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Uninitialized,
    SecretsReady,
    ConfigRendered,
    NetworkReady,
    BackendActive,
    DatabaseReady,
    ContractPublished,
    ServicesEnabled,
}

impl Stage {
    pub const SEQUENCE: [Stage; 8] = [
        Stage::Uninitialized,
        Stage::SecretsReady,
        Stage::ConfigRendered,
        Stage::NetworkReady,
        Stage::BackendActive,
        Stage::DatabaseReady,
        Stage::ContractPublished,
        Stage::ServicesEnabled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Uninitialized => "Uninitialized",
            Stage::SecretsReady => "SecretsReady",
            Stage::ConfigRendered => "ConfigRendered",
            Stage::NetworkReady => "NetworkReady",
            Stage::BackendActive => "BackendActive",
            Stage::DatabaseReady => "DatabaseReady",
            Stage::ContractPublished => "ContractPublished",
            Stage::ServicesEnabled => "ServicesEnabled",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        let idx = Self::SEQUENCE.iter().position(|s| s == self)?;
        Self::SEQUENCE.get(idx + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    At(Stage),
    Failed(Stage),
}

/// AmneziaWG obfuscation knobs supplied by the operator. Unset values are
/// filled from the persisted random set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationOverrides {
    pub jc: Option<u16>,
    pub jmin: Option<u16>,
    pub jmax: Option<u16>,
    pub s1: Option<u16>,
    pub s2: Option<u16>,
    pub h1: Option<u32>,
    pub h2: Option<u32>,
    pub h3: Option<u32>,
    pub h4: Option<u32>,
}

impl ObfuscationOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Range checks that can be decided from the overrides alone
    pub fn validate(&self) -> Result<()> {
        if let Some(jc) = self.jc {
            check_range("Jc", jc as u32, JC_MIN, JC_MAX)?;
        }
        if let Some(jmin) = self.jmin {
            check_range("Jmin", jmin as u32, 0, JUNK_MAX)?;
        }
        if let Some(jmax) = self.jmax {
            check_range("Jmax", jmax as u32, 0, JUNK_MAX)?;
        }
        if let (Some(jmin), Some(jmax)) = (self.jmin, self.jmax) {
            if jmin > jmax {
                return Err(Error::validation(format!(
                    "Jmin ({}) must not exceed Jmax ({})",
                    jmin, jmax
                )));
            }
        }
        if let Some(s1) = self.s1 {
            check_range("S1", s1 as u32, 0, S1_MAX)?;
        }
        if let Some(s2) = self.s2 {
            check_range("S2", s2 as u32, 0, S2_MAX)?;
        }
        if let (Some(s1), Some(s2)) = (self.s1, self.s2) {
            if s1 as u32 + 56 == s2 as u32 {
                return Err(Error::validation("S1 + 56 must not equal S2"));
            }
        }
        let headers: Vec<u32> = [self.h1, self.h2, self.h3, self.h4]
            .into_iter()
            .flatten()
            .collect();
        for h in &headers {
            if *h < HEADER_MIN {
                return Err(Error::validation(format!(
                    "magic header {} collides with standard message types (must be >= {})",
                    h, HEADER_MIN
                )));
            }
        }
        let unique: BTreeSet<_> = headers.iter().collect();
        if unique.len() != headers.len() {
            return Err(Error::validation("magic headers H1..H4 must be distinct"));
        }
        Ok(())
    }
}

pub(crate) const JC_MIN: u32 = 1;
pub(crate) const JC_MAX: u32 = 128;
pub(crate) const JUNK_MAX: u32 = 1280;
pub(crate) const S1_MAX: u32 = 1132;
pub(crate) const S2_MAX: u32 = 1188;
pub(crate) const HEADER_MIN: u32 = 5;

fn check_range(name: &str, value: u32, min: u32, max: u32) -> Result<()> {
    if value < min || value > max {
        return Err(Error::validation(format!(
            "{} = {} is outside the valid range {}..={}",
            name, value, min, max
        )));
    }
    Ok(())
}

/// Complete, validated AmneziaWG obfuscation set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationParams {
    pub jc: u16,
    pub jmin: u16,
    pub jmax: u16,
    pub s1: u16,
    pub s2: u16,
    pub h1: u32,
    pub h2: u32,
    pub h3: u32,
    pub h4: u32,
}

impl ObfuscationParams {
    /// Apply operator overrides on top of this set
    pub fn merged(&self, overrides: &ObfuscationOverrides) -> Self {
        Self {
            jc: overrides.jc.unwrap_or(self.jc),
            jmin: overrides.jmin.unwrap_or(self.jmin),
            jmax: overrides.jmax.unwrap_or(self.jmax),
            s1: overrides.s1.unwrap_or(self.s1),
            s2: overrides.s2.unwrap_or(self.s2),
            h1: overrides.h1.unwrap_or(self.h1),
            h2: overrides.h2.unwrap_or(self.h2),
            h3: overrides.h3.unwrap_or(self.h3),
            h4: overrides.h4.unwrap_or(self.h4),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ObfuscationOverrides {
            jc: Some(self.jc),
            jmin: Some(self.jmin),
            jmax: Some(self.jmax),
            s1: Some(self.s1),
            s2: Some(self.s2),
            h1: Some(self.h1),
            h2: Some(self.h2),
            h3: Some(self.h3),
            h4: Some(self.h4),
        }
        .validate()
    }

    /// `(key, value)` pairs in config file order
    pub fn pairs(&self) -> [(&'static str, String); 9] {
        [
            ("Jc", self.jc.to_string()),
            ("Jmin", self.jmin.to_string()),
            ("Jmax", self.jmax.to_string()),
            ("S1", self.s1.to_string()),
            ("S2", self.s2.to_string()),
            ("H1", self.h1.to_string()),
            ("H2", self.h2.to_string()),
            ("H3", self.h3.to_string()),
            ("H4", self.h4.to_string()),
        ]
    }
}

/// Client fingerprints accepted by Xray's uTLS integration
pub const REALITY_FINGERPRINTS: &[&str] = &[
    "chrome", "firefox", "safari", "ios", "android", "edge", "360", "qq", "random",
    "randomized",
];

/// Reality camouflage parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealityParams {
    /// Server name the handshake impersonates
    pub sni: String,
    /// Upstream the camouflage forwards unauthenticated probes to. Defaults to `<sni>:443`.
    pub dest: Option<String>,
    pub fingerprint: String,
    /// Loopback port of the Xray API inbound, used as the readiness signal
    pub admin_port: u16,
}

impl Default for RealityParams {
    fn default() -> Self {
        Self {
            sni: "vk.com".to_string(),
            dest: None,
            fingerprint: "chrome".to_string(),
            admin_port: 10085,
        }
    }
}

impl RealityParams {
    pub fn dest(&self) -> String {
        self.dest
            .clone()
            .unwrap_or_else(|| format!("{}:443", self.sni))
    }
}

/// Certificate authority parameters for the OpenVPN backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertParams {
    pub ca_common_name: String,
    pub server_common_name: String,
    /// Explicit operator request to replace the CA. Every previously issued
    /// client certificate stops being trusted.
    pub reset_ca: bool,
}

impl Default for CertParams {
    fn default() -> Self {
        Self {
            ca_common_name: "VPN Provision CA".to_string(),
            server_common_name: "server".to_string(),
            reset_ca: false,
        }
    }
}

/// Naming of the profile database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    pub host: String,
    pub name: String,
    pub user: String,
}

impl DatabaseSpec {
    pub fn for_backend(kind: BackendKind) -> Self {
        let (name, user) = kind.default_database();
        Self {
            host: "127.0.0.1".to_string(),
            name: name.to_string(),
            user: user.to_string(),
        }
    }
}

/// Everything a single run is asked to do. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    pub backend: BackendKind,
    /// Public address (IP or domain) clients connect to
    pub endpoint: String,
    pub listen_port: u16,
    pub subnet: Option<Ipv4Network>,
    pub dns_servers: String,
    pub obfuscation: ObfuscationOverrides,
    pub reality: RealityParams,
    pub cert: CertParams,
    pub database: DatabaseSpec,
    pub api_port: u16,
    /// Skips default-route detection when set
    pub egress_interface: Option<String>,
    /// Secret names the operator explicitly asked to regenerate
    pub regenerate: BTreeSet<String>,
}

impl ProvisioningRequest {
    pub fn new(backend: BackendKind, endpoint: impl Into<String>) -> Self {
        Self {
            backend,
            endpoint: endpoint.into(),
            listen_port: backend.default_listen_port(),
            subnet: backend.default_subnet(),
            dns_servers: "8.8.8.8".to_string(),
            obfuscation: ObfuscationOverrides::default(),
            reality: RealityParams::default(),
            cert: CertParams::default(),
            database: DatabaseSpec::for_backend(backend),
            api_port: 8080,
            egress_interface: None,
            regenerate: BTreeSet::new(),
        }
    }

    /// Checks that need nothing but the request itself. Runs before any
    /// secret is generated.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_endpoint(&self.endpoint) {
            return Err(Error::validation(format!(
                "endpoint '{}' is neither an IP address nor a domain name",
                self.endpoint
            )));
        }
        if self.listen_port == 0 {
            return Err(Error::validation("listen port must be greater than 0"));
        }
        if self.api_port == 0 {
            return Err(Error::validation("API port must be greater than 0"));
        }
        if self.api_port == self.listen_port {
            return Err(Error::validation(format!(
                "API port {} collides with the tunnel listen port",
                self.api_port
            )));
        }

        match self.backend {
            BackendKind::Amnezia | BackendKind::OpenVpn => {
                let subnet = self.subnet.ok_or_else(|| {
                    Error::validation(format!("{} requires a tunnel subnet", self.backend))
                })?;
                if subnet.prefix() > 30 {
                    return Err(Error::validation(format!(
                        "subnet {} is too small for a server and clients",
                        subnet
                    )));
                }
            }
            BackendKind::Reality => {
                if self.reality.admin_port == self.listen_port
                    || self.reality.admin_port == self.api_port
                {
                    return Err(Error::validation(
                        "Xray admin port collides with another listener",
                    ));
                }
            }
        }

        if self.backend != BackendKind::Amnezia && !self.obfuscation.is_empty() {
            return Err(Error::validation(format!(
                "obfuscation parameters apply to amnezia only, not {}",
                self.backend
            )));
        }
        self.obfuscation.validate()?;

        if self.backend == BackendKind::Reality {
            if !is_valid_domain(&self.reality.sni) {
                return Err(Error::validation(format!(
                    "SNI '{}' is not a domain name",
                    self.reality.sni
                )));
            }
            if !REALITY_FINGERPRINTS.contains(&self.reality.fingerprint.as_str()) {
                return Err(Error::validation(format!(
                    "unknown client fingerprint '{}'",
                    self.reality.fingerprint
                )));
            }
        }

        if let Some(iface) = &self.egress_interface {
            if !is_valid_iface(iface) {
                return Err(Error::validation(format!(
                    "invalid egress interface name '{}'",
                    iface
                )));
            }
        }

        for (what, value) in [
            ("database name", &self.database.name),
            ("database user", &self.database.user),
        ] {
            if !is_valid_sql_ident(value) {
                return Err(Error::validation(format!("invalid {} '{}'", what, value)));
            }
        }

        if self.regenerate.contains(crate::secrets::names::OPENVPN_CA) {
            return Err(Error::validation(
                "the CA is only replaced through the explicit reset-CA request",
            ));
        }
        if self.cert.reset_ca && self.backend != BackendKind::OpenVpn {
            return Err(Error::validation("reset-CA only applies to the openvpn backend"));
        }

        if self.dns_servers.trim().is_empty() || self.dns_servers.contains('\n') {
            return Err(Error::validation("DNS servers must be a single non-empty line"));
        }

        Ok(())
    }
}

fn domain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?i)([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$")
            .expect("static regex")
    })
}

fn iface_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.@-]{1,15}$").expect("static regex"))
}

fn sql_ident_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{1,32}$").expect("static regex"))
}

pub fn is_valid_domain(s: &str) -> bool {
    s.len() <= 253 && domain_regex().is_match(s)
}

pub fn is_valid_endpoint(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok() || is_valid_domain(s)
}

pub fn is_valid_iface(s: &str) -> bool {
    iface_regex().is_match(s)
}

pub fn is_valid_sql_ident(s: &str) -> bool {
    sql_ident_regex().is_match(s)
}

/// Connection parameters meant for external consumption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointDescriptor {
    Amnezia {
        endpoint: String,
        port: u16,
        public_key: String,
        server_address: String,
        obfuscation: ObfuscationParams,
    },
    Reality {
        endpoint: String,
        port: u16,
        public_key: String,
        sni: String,
        short_id: String,
        fingerprint: String,
    },
    OpenVpn {
        endpoint: String,
        port: u16,
        ca_fingerprint: String,
        tls_crypt_key: PathBuf,
    },
}

impl EndpointDescriptor {
    pub fn endpoint(&self) -> &str {
        match self {
            EndpointDescriptor::Amnezia { endpoint, .. }
            | EndpointDescriptor::Reality { endpoint, .. }
            | EndpointDescriptor::OpenVpn { endpoint, .. } => endpoint,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            EndpointDescriptor::Amnezia { port, .. }
            | EndpointDescriptor::Reality { port, .. }
            | EndpointDescriptor::OpenVpn { port, .. } => *port,
        }
    }

    /// Human readable lines for the final summary
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Endpoint: {}:{}", self.endpoint(), self.port())];
        match self {
            EndpointDescriptor::Amnezia {
                public_key,
                server_address,
                obfuscation,
                ..
            } => {
                lines.push(format!("Server public key: {}", public_key));
                lines.push(format!("Tunnel address: {}", server_address));
                let knobs: Vec<String> = obfuscation
                    .pairs()
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                lines.push(format!("Obfuscation: {}", knobs.join(" ")));
            }
            EndpointDescriptor::Reality {
                public_key,
                sni,
                short_id,
                fingerprint,
                ..
            } => {
                lines.push(format!("Reality public key: {}", public_key));
                lines.push(format!("SNI: {}", sni));
                lines.push(format!("Short ID: {}", short_id));
                lines.push(format!("Fingerprint: {}", fingerprint));
            }
            EndpointDescriptor::OpenVpn {
                ca_fingerprint,
                tls_crypt_key,
                ..
            } => {
                lines.push(format!("CA fingerprint (SHA-256): {}", ca_fingerprint));
                lines.push(format!("tls-crypt-v2 server key: {}", tls_crypt_key.display()));
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_defaults() {
        let req = ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5");
        assert_eq!(req.listen_port, 51830);
        assert_eq!(req.subnet.unwrap().to_string(), "10.100.10.0/24");
        assert_eq!(req.database.name, "wg_panel");
        assert!(req.validate().is_ok());

        let req = ProvisioningRequest::new(BackendKind::Reality, "vpn.example.com");
        assert_eq!(req.listen_port, 443);
        assert!(req.subnet.is_none());
        assert_eq!(req.reality.dest(), "vk.com:443");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("AWG".parse::<BackendKind>().unwrap(), BackendKind::Amnezia);
        assert_eq!("xray".parse::<BackendKind>().unwrap(), BackendKind::Reality);
        assert!("ipsec".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_jitter_range_rejected() {
        let mut req = ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5");
        req.obfuscation.jmin = Some(900);
        req.obfuscation.jmax = Some(100);
        let err = req.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));
    }

    #[test]
    fn test_header_constraints() {
        let overrides = ObfuscationOverrides {
            h1: Some(3),
            ..Default::default()
        };
        assert!(overrides.validate().is_err());

        let overrides = ObfuscationOverrides {
            h1: Some(100),
            h2: Some(100),
            ..Default::default()
        };
        assert!(overrides.validate().is_err());

        let overrides = ObfuscationOverrides {
            s1: Some(20),
            s2: Some(76),
            ..Default::default()
        };
        assert!(overrides.validate().is_err());
    }

    #[test]
    fn test_invalid_endpoint_and_ports() {
        let req = ProvisioningRequest::new(BackendKind::Amnezia, "not a host");
        assert!(req.validate().is_err());

        let mut req = ProvisioningRequest::new(BackendKind::Reality, "vpn.example.com");
        req.api_port = 443;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_obfuscation_only_for_amnezia() {
        let mut req = ProvisioningRequest::new(BackendKind::OpenVpn, "203.0.113.5");
        req.obfuscation.jc = Some(4);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_ca_regeneration_needs_reset_flag() {
        let mut req = ProvisioningRequest::new(BackendKind::OpenVpn, "203.0.113.5");
        req.regenerate.insert("openvpn-ca".to_string());
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_stage_sequence() {
        assert_eq!(Stage::Uninitialized.next(), Some(Stage::SecretsReady));
        assert_eq!(Stage::ContractPublished.next(), Some(Stage::ServicesEnabled));
        assert_eq!(Stage::ServicesEnabled.next(), None);
        assert!(Stage::NetworkReady < Stage::BackendActive);
    }
}
