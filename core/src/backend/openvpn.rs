//! OpenVPN with a private CA and tls-crypt-v2 anti-probing
//!
//! The PKI is laid out the way easy-rsa expects it, because the profile API
//! issues client certificates with `easyrsa build-client-full`.

use super::{bring_up, field, Artifact, BackendProvisioner, Prerequisite, RenderedConfig};
use crate::config::{HostLayout, ReadinessPolicy};
use crate::fsutil::{MODE_PRIVATE_DIR, MODE_PUBLIC, MODE_SECRET};
use crate::host::Host;
use crate::model::{BackendKind, CertParams, EndpointDescriptor, ProvisioningRequest};
use crate::secrets::{names, SecretBundle, SecretStore};
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use sha2::{Digest, Sha256};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

const TUN_IFACE: &str = "tun0";
const MODE_PUBLIC_DIR: u32 = 0o755;
const CA_VALIDITY_DAYS: i64 = 3650;
const SERVER_VALIDITY_DAYS: i64 = 825;
const TLS_CRYPT_V2_LABEL: &str = "OpenVPN tls-crypt-v2 server key";
/// tls-crypt-v2 server keys carry 1024 bits of key material
const TLS_CRYPT_V2_KEY_BYTES: usize = 128;

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenVpnBackend;

/// Certificate and private key stored together as one secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

impl PemBundle {
    /// Both blocks must be present; anything less is a half-initialized PKI
    pub fn parse(what: &str, text: &str) -> Result<Self> {
        let cert_pem = pem_block(text, "CERTIFICATE");
        let key_pem = pem_block(text, "PRIVATE KEY");
        match (cert_pem, key_pem) {
            (Some(cert_pem), Some(key_pem)) => Ok(Self { cert_pem, key_pem }),
            (cert, key) => Err(Error::certificate(format!(
                "stored {} is incomplete (certificate {}, key {}); \
                 refusing to continue with a half-initialized PKI",
                what,
                if cert.is_some() { "present" } else { "missing" },
                if key.is_some() { "present" } else { "missing" },
            ))),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}{}", self.cert_pem, self.key_pem)
    }
}

fn pem_block(text: &str, label: &str) -> Option<String> {
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);
    let start = text.find(&begin)?;
    let rest = &text[start..];
    let stop = rest.find(&end)? + end.len();
    Some(format!("{}\n", &rest[..stop]))
}

/// SHA-256 over the certificate DER, colon separated upper-case hex
pub fn fingerprint(cert_pem: &str) -> Result<String> {
    let body: String = cert_pem
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with("-----"))
        .collect();
    let der = STANDARD
        .decode(body)
        .map_err(|e| Error::certificate(format!("certificate is not valid PEM: {}", e)))?;
    let digest = Sha256::digest(&der);
    Ok(digest
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":"))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Self-signed ECDSA P-256 CA
pub fn generate_ca(cert: &CertParams) -> Result<String> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(&cert.ca_common_name);
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let ca = params.self_signed(&key)?;
    log::info!("generated CA '{}'", cert.ca_common_name);
    Ok(PemBundle {
        cert_pem: ca.pem(),
        key_pem: key.serialize_pem(),
    }
    .encode())
}

/// Server certificate issued by `ca`
pub fn issue_server_cert(ca: &PemBundle, common_name: &str) -> Result<String> {
    let ca_key = KeyPair::from_pem(&ca.key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)?;

    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
    let mut params = CertificateParams::new(vec![common_name.to_string()])?;
    params.distinguished_name = distinguished_name(common_name);
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(SERVER_VALIDITY_DAYS);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params.signed_by(&key, &issuer)?;
    Ok(PemBundle {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    }
    .encode())
}

/// Server key in the format `openvpn --genkey tls-crypt-v2-server` writes
pub fn tls_crypt_v2_server_key() -> Result<String> {
    let mut material = [0u8; TLS_CRYPT_V2_KEY_BYTES];
    OsRng.fill_bytes(&mut material);
    let encoded = STANDARD.encode(material);

    let mut out = format!("-----BEGIN {}-----\n", TLS_CRYPT_V2_LABEL);
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", TLS_CRYPT_V2_LABEL));
    Ok(out)
}

/// Client certificates previously issued from the PKI
pub fn issued_client_certs(layout: &HostLayout) -> Vec<String> {
    let issued = layout.resolve(HostLayout::pki_dir().join("issued"));
    let Ok(entries) = fs::read_dir(&issued) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter_map(|name| name.strip_suffix(".crt").map(str::to_string))
        .filter(|name| name != "server")
        .collect();
    names.sort();
    names
}

fn dns_servers(request: &ProvisioningRequest) -> Vec<&str> {
    request
        .dns_servers
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect()
}

fn pki_path(relative: &str) -> PathBuf {
    HostLayout::pki_dir().join(relative)
}

/// Directories easy-rsa's `build-client-full` expects under the PKI
const PKI_DIRS: [(&str, u32); 4] = [
    ("private", MODE_PRIVATE_DIR),
    ("reqs", MODE_PUBLIC_DIR),
    ("issued", MODE_PUBLIC_DIR),
    ("certs_by_serial", MODE_PUBLIC_DIR),
];

/// A CA on disk that the secret store does not know about can only be
/// replaced on an explicit reset, and nothing may be generated before that
/// is established.
fn check_pki_state(
    request: &ProvisioningRequest,
    ca_stored: bool,
    layout: &HostLayout,
) -> Result<()> {
    if ca_stored || request.cert.reset_ca {
        return Ok(());
    }
    let existing: Vec<PathBuf> = ["ca.crt", "private/ca.key"]
        .into_iter()
        .map(pki_path)
        .filter(|p| layout.resolve(p).exists())
        .collect();
    if existing.is_empty() {
        return Ok(());
    }
    Err(Error::certificate(format!(
        "{} exist(s) but the stored CA is missing; request a CA reset to replace the PKI",
        existing
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

impl OpenVpnBackend {
    fn render_server_conf(request: &ProvisioningRequest) -> Result<String> {
        let subnet = request
            .subnet
            .ok_or_else(|| Error::validation("openvpn requires a tunnel subnet"))?;

        let mut lines = vec![
            format!("port {}", request.listen_port),
            "proto udp".to_string(),
            format!("dev {}", TUN_IFACE),
            format!("ca {}", pki_path("ca.crt").display()),
            format!("cert {}", pki_path("issued/server.crt").display()),
            format!("key {}", pki_path("private/server.key").display()),
            "dh none".to_string(),
            "ecdh-curve prime256v1".to_string(),
            format!("tls-crypt-v2 {}", HostLayout::tls_crypt_server_key().display()),
            format!("server {} {}", subnet.network(), subnet.mask()),
            "topology subnet".to_string(),
            "push \"redirect-gateway def1 bypass-dhcp\"".to_string(),
        ];
        for dns in dns_servers(request) {
            lines.push(format!("push \"dhcp-option DNS {}\"", dns));
        }
        lines.extend(
            [
                "keepalive 10 120",
                "cipher AES-256-GCM",
                "data-ciphers AES-256-GCM:CHACHA20-POLY1305",
                "user nobody",
                "group nogroup",
                "persist-key",
                "persist-tun",
            ]
            .map(str::to_string),
        );
        lines.push(format!("status {}", HostLayout::STATUS_LOG));
        lines.push("verb 3".to_string());

        let mut out = lines.join("\n");
        out.push('\n');
        Ok(out)
    }
}

impl BackendProvisioner for OpenVpnBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenVpn
    }

    fn unit(&self) -> String {
        "openvpn-server@server.service".to_string()
    }

    fn dependencies(&self, request: &ProvisioningRequest) -> Vec<Prerequisite> {
        let mut deps = vec![
            Prerequisite::Binary("openvpn"),
            Prerequisite::Executable(Path::new(HostLayout::EASYRSA_DIR).join("easyrsa")),
            Prerequisite::Forwarding,
        ];
        if let Some(subnet) = request.subnet {
            deps.push(Prerequisite::Masquerade {
                subnet,
                iface: TUN_IFACE.to_string(),
            });
        }
        deps
    }

    fn validate(&self, request: &ProvisioningRequest) -> Result<()> {
        if request.subnet.is_none() {
            return Err(Error::validation("openvpn requires a tunnel subnet"));
        }
        let servers = dns_servers(request);
        if servers.is_empty() {
            return Err(Error::validation("at least one DNS server is required"));
        }
        for dns in servers {
            if dns.parse::<IpAddr>().is_err() {
                return Err(Error::validation(format!(
                    "DNS server '{}' is not an IP address",
                    dns
                )));
            }
        }
        if request.cert.ca_common_name.trim().is_empty()
            || request.cert.server_common_name.trim().is_empty()
        {
            return Err(Error::validation("certificate common names must not be empty"));
        }
        Ok(())
    }

    fn preflight(
        &self,
        request: &ProvisioningRequest,
        store: &SecretStore,
        layout: &HostLayout,
    ) -> Result<()> {
        check_pki_state(request, store.exists(names::OPENVPN_CA), layout)
    }

    fn secrets(
        &self,
        request: &ProvisioningRequest,
        store: &mut SecretStore,
        layout: &HostLayout,
    ) -> Result<SecretBundle> {
        check_pki_state(request, store.exists(names::OPENVPN_CA), layout)?;

        if request.cert.reset_ca {
            let dangling = issued_client_certs(layout);
            if !dangling.is_empty() {
                log::warn!(
                    "resetting the CA invalidates {} issued client certificate(s): {}",
                    dangling.len(),
                    dangling.join(", ")
                );
            }
            store.discard(names::OPENVPN_CA)?;
            store.discard(names::OPENVPN_SERVER_CERT)?;
        }

        // A new CA cannot vouch for a server certificate signed by an old one
        if !store.exists(names::OPENVPN_CA) && store.exists(names::OPENVPN_SERVER_CERT) {
            log::warn!("CA is being created; reissuing the server certificate");
            store.discard(names::OPENVPN_SERVER_CERT)?;
        }

        let ca_text = store.obtain(names::OPENVPN_CA, || generate_ca(&request.cert))?;
        let ca = PemBundle::parse("CA", &ca_text)?;

        if !request.cert.reset_ca {
            let on_disk = layout.resolve(pki_path("ca.crt"));
            if let Ok(existing) = fs::read_to_string(&on_disk) {
                if existing.trim() != ca.cert_pem.trim() {
                    return Err(Error::certificate(format!(
                        "{} does not match the stored CA; request a CA reset to replace it",
                        on_disk.display()
                    )));
                }
            }
        }

        let server_text = store.obtain(names::OPENVPN_SERVER_CERT, || {
            issue_server_cert(&ca, &request.cert.server_common_name)
        })?;
        PemBundle::parse("server certificate", &server_text)?;

        let tls_key = store.obtain(names::TLS_CRYPT_V2_SERVER, tls_crypt_v2_server_key)?;

        let mut bundle = SecretBundle::new();
        bundle.insert(names::OPENVPN_CA, ca_text);
        bundle.insert(names::OPENVPN_SERVER_CERT, server_text);
        bundle.insert(names::TLS_CRYPT_V2_SERVER, tls_key);
        Ok(bundle)
    }

    fn render(
        &self,
        request: &ProvisioningRequest,
        secrets: &SecretBundle,
        _layout: &HostLayout,
    ) -> Result<RenderedConfig> {
        let ca = PemBundle::parse("CA", secrets.get(names::OPENVPN_CA)?)?;
        let server = PemBundle::parse(
            "server certificate",
            secrets.get(names::OPENVPN_SERVER_CERT)?,
        )?;
        let tls_key = secrets.get(names::TLS_CRYPT_V2_SERVER)?;

        let artifacts = vec![
            Artifact::new(pki_path("ca.crt"), ca.cert_pem.clone(), MODE_PUBLIC),
            Artifact::new(pki_path("private/ca.key"), ca.key_pem, MODE_SECRET),
            Artifact::new(pki_path("issued/server.crt"), server.cert_pem, MODE_PUBLIC),
            Artifact::new(pki_path("private/server.key"), server.key_pem, MODE_SECRET),
            Artifact::new(pki_path("index.txt"), String::new(), MODE_PUBLIC).create_only(),
            Artifact::new(pki_path("index.txt.attr"), "unique_subject = no\n".to_string(), MODE_PUBLIC)
                .create_only(),
            Artifact::new(pki_path("serial"), "01\n".to_string(), MODE_PUBLIC).create_only(),
            Artifact::new(HostLayout::tls_crypt_server_key(), tls_key.to_string(), MODE_SECRET),
            Artifact::new(
                HostLayout::openvpn_server_conf(),
                Self::render_server_conf(request)?,
                MODE_PUBLIC,
            ),
        ];

        Ok(RenderedConfig {
            artifacts,
            directories: PKI_DIRS
                .iter()
                .map(|(dir, mode)| (pki_path(dir), *mode))
                .collect(),
            unit: self.unit(),
            endpoint: EndpointDescriptor::OpenVpn {
                endpoint: request.endpoint.clone(),
                port: request.listen_port,
                ca_fingerprint: fingerprint(&ca.cert_pem)?,
                tls_crypt_key: HostLayout::tls_crypt_server_key(),
            },
        })
    }

    fn activate(
        &self,
        host: &dyn Host,
        layout: &HostLayout,
        rendered: &RenderedConfig,
        changed: bool,
        policy: &ReadinessPolicy,
    ) -> Result<EndpointDescriptor> {
        bring_up(
            host,
            layout,
            rendered,
            changed,
            policy,
            &format!("interface {}", TUN_IFACE),
            |h| {
                h.run("ip", &["link", "show", TUN_IFACE])
                    .map(|o| o.success())
                    .unwrap_or(false)
            },
        )?;
        Ok(rendered.endpoint.clone())
    }

    fn contract_fields(
        &self,
        request: &ProvisioningRequest,
        endpoint: &EndpointDescriptor,
    ) -> Vec<(String, String)> {
        let mut fields = vec![
            field("DNS_SERVERS", &request.dns_servers),
            field("EASYRSA_DIR", HostLayout::EASYRSA_DIR),
            field(
                "TLS_CRYPT_V2_SERVER_KEY",
                HostLayout::tls_crypt_server_key().display(),
            ),
            field("CLIENT_KEYS_DIR", HostLayout::CLIENT_KEYS_DIR),
            field("STATUS_LOG", HostLayout::STATUS_LOG),
        ];
        if let EndpointDescriptor::OpenVpn { ca_fingerprint, .. } = endpoint {
            fields.push(field("CA_FINGERPRINT", ca_fingerprint));
        }
        fields
    }
}
