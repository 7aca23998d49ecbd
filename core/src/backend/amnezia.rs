//! AmneziaWG: WireGuard with junk packets, padded handshakes and custom
//! message headers

use super::{bring_up, field, Artifact, BackendProvisioner, Prerequisite, RenderedConfig};
use crate::config::{HostLayout, ReadinessPolicy};
use crate::fsutil::MODE_SECRET;
use crate::host::Host;
use crate::model::{
    BackendKind, EndpointDescriptor, ObfuscationOverrides, ObfuscationParams, ProvisioningRequest,
    HEADER_MIN, JUNK_MAX,
};
use crate::secrets::{self, names, KeyEncoding, SecretBundle, SecretStore};
use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use rand::rngs::OsRng;
use rand::Rng;
use std::collections::BTreeSet;
use std::fs;

#[derive(Debug, Clone)]
pub struct AmneziaBackend {
    pub iface: String,
}

impl Default for AmneziaBackend {
    fn default() -> Self {
        Self {
            iface: "awg0".to_string(),
        }
    }
}

/// Fresh random obfuscation set. Persisted once and reused afterwards, so
/// existing client profiles keep matching the server. Values the operator
/// overrides bound the random ones, so the merged set is always valid.
pub fn random_obfuscation(overrides: &ObfuscationOverrides) -> ObfuscationParams {
    let mut rng = OsRng;

    let jmax_floor = overrides.jmin.unwrap_or(0).max(500);
    let jmax = overrides.jmax.unwrap_or_else(|| {
        rng.gen_range(jmax_floor..=jmax_floor.max(1000).min(JUNK_MAX as u16))
    });
    let jmin = rng.gen_range(40u16.min(jmax)..=80u16.min(jmax));

    let (s1, s2) = loop {
        let s1 = overrides.s1.unwrap_or_else(|| rng.gen_range(15..=150));
        let s2 = overrides.s2.unwrap_or_else(|| rng.gen_range(15..=150));
        let both_fixed = overrides.s1.is_some() && overrides.s2.is_some();
        if s1 + 56 != s2 || both_fixed {
            break (s1, s2);
        }
    };

    let fixed = [overrides.h1, overrides.h2, overrides.h3, overrides.h4];
    let mut taken: BTreeSet<u32> = fixed.iter().flatten().copied().collect();
    let mut headers = [0u32; 4];
    for (slot, value) in headers.iter_mut().zip(fixed) {
        *slot = match value {
            Some(h) => h,
            None => loop {
                let h = rng.gen_range(HEADER_MIN..=i32::MAX as u32);
                if taken.insert(h) {
                    break h;
                }
            },
        };
    }

    ObfuscationParams {
        jc: rng.gen_range(3..=10),
        jmin,
        jmax,
        s1,
        s2,
        h1: headers[0],
        h2: headers[1],
        h3: headers[2],
        h4: headers[3],
    }
}

/// `[Peer]` blocks of an existing config, verbatim. Comment lines directly
/// above a `[Peer]` header travel with it.
pub fn existing_peers(content: &str) -> Vec<String> {
    let mut peers = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    let mut comments: Vec<&str> = Vec::new();

    let finish = |block: Vec<&str>, peers: &mut Vec<String>| {
        let mut end = block.len();
        while end > 0 && block[end - 1].trim().is_empty() {
            end -= 1;
        }
        peers.push(block[..end].join("\n"));
    };

    for line in content.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('[') {
            if let Some(block) = current.take() {
                finish(block, &mut peers);
            }
            if trimmed.eq_ignore_ascii_case("[peer]") {
                let mut block = std::mem::take(&mut comments);
                block.push(line);
                current = Some(block);
            } else {
                comments.clear();
            }
            continue;
        }

        if trimmed.starts_with('#') {
            comments.push(line);
            continue;
        }

        match current.as_mut() {
            Some(block) => {
                block.append(&mut comments);
                block.push(line);
            }
            None => comments.clear(),
        }
    }

    if let Some(mut block) = current.take() {
        block.append(&mut comments);
        finish(block, &mut peers);
    }
    peers
}

/// Server address: first host of the subnet, with the subnet prefix
fn server_address(subnet: &Ipv4Network) -> Result<String> {
    let host = subnet.nth(1).ok_or_else(|| {
        Error::validation(format!("subnet {} has no usable host address", subnet))
    })?;
    Ok(format!("{}/{}", host, subnet.prefix()))
}

impl AmneziaBackend {
    fn subnet(request: &ProvisioningRequest) -> Result<Ipv4Network> {
        request
            .subnet
            .ok_or_else(|| Error::validation("amnezia requires a tunnel subnet"))
    }

    fn obfuscation(request: &ProvisioningRequest, stored: &str) -> Result<ObfuscationParams> {
        let persisted: ObfuscationParams = serde_json::from_str(stored).map_err(|e| {
            Error::secret(format!("stored obfuscation set is unreadable: {}", e))
        })?;
        let params = persisted.merged(&request.obfuscation);
        params.validate()?;
        Ok(params)
    }

    fn render_interface(
        private_key: &str,
        address: &str,
        port: u16,
        obfuscation: &ObfuscationParams,
    ) -> String {
        let mut out = String::from("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", private_key));
        out.push_str(&format!("Address = {}\n", address));
        out.push_str(&format!("ListenPort = {}\n", port));
        for (key, value) in obfuscation.pairs() {
            out.push_str(&format!("{} = {}\n", key, value));
        }
        out
    }
}

impl BackendProvisioner for AmneziaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Amnezia
    }

    fn unit(&self) -> String {
        format!("awg-quick@{}.service", self.iface)
    }

    fn dependencies(&self, request: &ProvisioningRequest) -> Vec<Prerequisite> {
        let mut deps = vec![
            Prerequisite::Binary("awg"),
            Prerequisite::Binary("awg-quick"),
            Prerequisite::KernelModule("amneziawg"),
            Prerequisite::Forwarding,
        ];
        if let Some(subnet) = request.subnet {
            deps.push(Prerequisite::Masquerade {
                subnet,
                iface: self.iface.clone(),
            });
        }
        deps
    }

    fn validate(&self, request: &ProvisioningRequest) -> Result<()> {
        let subnet = Self::subnet(request)?;
        server_address(&subnet)?;
        request.obfuscation.validate()
    }

    fn preflight(
        &self,
        request: &ProvisioningRequest,
        store: &SecretStore,
        _layout: &HostLayout,
    ) -> Result<()> {
        if request.regenerate.contains(names::AWG_OBFUSCATION) {
            return Ok(());
        }
        // Overrides must agree with a set persisted by an earlier run
        match store.load(names::AWG_OBFUSCATION)? {
            Some(stored) => Self::obfuscation(request, &stored).map(|_| ()),
            None => Ok(()),
        }
    }

    fn secrets(
        &self,
        request: &ProvisioningRequest,
        store: &mut SecretStore,
        _layout: &HostLayout,
    ) -> Result<SecretBundle> {
        let mut bundle = SecretBundle::new();
        let private = store.obtain(names::TUNNEL_PRIVATE_KEY, || {
            secrets::x25519_private_key(KeyEncoding::Standard)
        })?;
        bundle.insert(names::TUNNEL_PRIVATE_KEY, private);

        let obfuscation = store.obtain(names::AWG_OBFUSCATION, || {
            serde_json::to_string(&random_obfuscation(&request.obfuscation))
                .map_err(|e| Error::secret(format!("encoding obfuscation set: {}", e)))
        })?;
        bundle.insert(names::AWG_OBFUSCATION, obfuscation);
        Ok(bundle)
    }

    fn render(
        &self,
        request: &ProvisioningRequest,
        secrets: &SecretBundle,
        layout: &HostLayout,
    ) -> Result<RenderedConfig> {
        let private_key = secrets.get(names::TUNNEL_PRIVATE_KEY)?.trim();
        let public_key = secrets::x25519_public_key(private_key, KeyEncoding::Standard)?;
        let obfuscation = Self::obfuscation(request, secrets.get(names::AWG_OBFUSCATION)?)?;
        let address = server_address(&Self::subnet(request)?)?;

        let conf_path = HostLayout::awg_conf(&self.iface);
        let mut content =
            Self::render_interface(private_key, &address, request.listen_port, &obfuscation);

        // Peers are owned by the API; carry them over untouched
        let existing = match fs::read(layout.resolve(&conf_path)) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(Error::validation(format!(
                    "reading existing {}: {}; refusing to drop its peers",
                    conf_path.display(),
                    e
                )));
            }
        };
        let peers = existing_peers(&existing);
        if !peers.is_empty() {
            log::debug!("preserving {} peer block(s) in {}", peers.len(), conf_path.display());
        }
        for peer in peers {
            content.push('\n');
            content.push_str(&peer);
            content.push('\n');
        }

        Ok(RenderedConfig {
            artifacts: vec![Artifact::new(conf_path, content, MODE_SECRET)],
            directories: Vec::new(),
            unit: self.unit(),
            endpoint: EndpointDescriptor::Amnezia {
                endpoint: request.endpoint.clone(),
                port: request.listen_port,
                public_key,
                server_address: address,
                obfuscation,
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
        let iface = self.iface.as_str();
        bring_up(
            host,
            layout,
            rendered,
            changed,
            policy,
            &format!("interface {}", iface),
            |h| {
                h.run("awg", &["show", iface])
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
        let mut fields = vec![field("WG_INTERFACE", &self.iface)];
        if let EndpointDescriptor::Amnezia {
            public_key,
            obfuscation,
            ..
        } = endpoint
        {
            fields.push(field("SERVER_PUBLIC_KEY", public_key));
            if let Some(subnet) = request.subnet {
                fields.push(field("VPN_NETWORK", subnet));
            }
            fields.push(field("DNS_SERVERS", &request.dns_servers));
            fields.push(field("WG_CLI", "awg"));
            fields.push(field("WG_CONF_DIR", HostLayout::AWG_CONF_DIR));
            for (key, value) in obfuscation.pairs() {
                fields.push(field(&format!("WG_{}", key.to_ascii_uppercase()), value));
            }
        }
        fields
    }
}
