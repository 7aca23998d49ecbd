//! Xray VLESS with Reality: TLS camouflage borrowing a real site's handshake

use super::{bring_up, field, Artifact, BackendProvisioner, Prerequisite, RenderedConfig};
use crate::config::{HostLayout, ReadinessPolicy};
use crate::fsutil::MODE_PUBLIC;
use crate::host::Host;
use crate::model::{BackendKind, EndpointDescriptor, ProvisioningRequest};
use crate::secrets::{self, names, KeyEncoding, SecretBundle, SecretStore};
use crate::{Error, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::time::Duration;

const VLESS_TAG: &str = "vless-in";
const API_TAG: &str = "api";
const FLOW: &str = "xtls-rprx-vision";

#[derive(Debug, Clone, Copy, Default)]
pub struct RealityBackend;

#[derive(Serialize)]
struct XrayConfig {
    log: Value,
    api: ApiConfig,
    stats: Value,
    policy: Value,
    inbounds: Vec<Inbound>,
    outbounds: Vec<Value>,
    routing: Value,
}

#[derive(Serialize)]
struct ApiConfig {
    tag: &'static str,
    services: [&'static str; 2],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Inbound {
    tag: &'static str,
    listen: String,
    port: u16,
    protocol: &'static str,
    settings: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_settings: Option<StreamSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sniffing: Option<Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamSettings {
    network: &'static str,
    security: &'static str,
    reality_settings: RealitySettings,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealitySettings {
    show: bool,
    dest: String,
    xver: u8,
    server_names: Vec<String>,
    private_key: String,
    short_ids: Vec<String>,
}

/// Clients and short ids the API added to a previous config
#[derive(Debug, Default, PartialEq)]
struct ApiManaged {
    clients: Vec<Value>,
    short_ids: Vec<String>,
}

impl ApiManaged {
    /// Clients and short ids from every inbound of a previous config. The
    /// profile API edits `inbounds[0]`, which older layouts put on the API
    /// inbound, so nothing is keyed on the tag.
    fn from_existing(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Value = serde_json::from_str(content)?;
        let mut managed = Self::default();
        let Some(inbounds) = config["inbounds"].as_array() else {
            return Ok(managed);
        };

        for inbound in inbounds {
            for client in inbound["settings"]["clients"].as_array().into_iter().flatten() {
                let duplicate = client.get("id").is_some()
                    && managed.clients.iter().any(|c| c.get("id") == client.get("id"));
                if !duplicate {
                    managed.clients.push(client.clone());
                }
            }
            let ids = inbound["streamSettings"]["realitySettings"]["shortIds"].as_array();
            for id in ids.into_iter().flatten().filter_map(Value::as_str) {
                if !managed.short_ids.iter().any(|known| known == id) {
                    managed.short_ids.push(id.to_string());
                }
            }
        }
        Ok(managed)
    }
}

impl RealityBackend {
    fn render_config(
        request: &ProvisioningRequest,
        private_key: &str,
        short_id: &str,
        managed: ApiManaged,
    ) -> Result<String> {
        let mut short_ids = vec![short_id.to_string()];
        for id in managed.short_ids {
            if !short_ids.contains(&id) {
                short_ids.push(id);
            }
        }

        let reality = &request.reality;
        let config = XrayConfig {
            log: json!({ "loglevel": "warning" }),
            api: ApiConfig {
                tag: API_TAG,
                services: ["HandlerService", "StatsService"],
            },
            stats: json!({}),
            policy: json!({
                "levels": { "0": { "statsUserUplink": true, "statsUserDownlink": true } },
                "system": { "statsInboundUplink": true, "statsInboundDownlink": true }
            }),
            // The profile API adds clients to inbounds[0]
            inbounds: vec![
                Inbound {
                    tag: VLESS_TAG,
                    listen: "0.0.0.0".to_string(),
                    port: request.listen_port,
                    protocol: "vless",
                    settings: json!({ "clients": managed.clients, "decryption": "none" }),
                    stream_settings: Some(StreamSettings {
                        network: "tcp",
                        security: "reality",
                        reality_settings: RealitySettings {
                            show: false,
                            dest: reality.dest(),
                            xver: 0,
                            server_names: vec![reality.sni.clone()],
                            private_key: private_key.to_string(),
                            short_ids,
                        },
                    }),
                    sniffing: Some(json!({
                        "enabled": true,
                        "destOverride": ["http", "tls", "quic"]
                    })),
                },
                Inbound {
                    tag: API_TAG,
                    listen: "127.0.0.1".to_string(),
                    port: reality.admin_port,
                    protocol: "dokodemo-door",
                    settings: json!({ "address": "127.0.0.1" }),
                    stream_settings: None,
                    sniffing: None,
                },
            ],
            outbounds: vec![
                json!({ "protocol": "freedom", "tag": "direct" }),
                json!({ "protocol": "blackhole", "tag": "block" }),
            ],
            routing: json!({
                "rules": [
                    { "type": "field", "inboundTag": [API_TAG], "outboundTag": API_TAG }
                ]
            }),
        };

        let mut out = serde_json::to_string_pretty(&config)?;
        out.push('\n');
        Ok(out)
    }
}

impl BackendProvisioner for RealityBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Reality
    }

    fn unit(&self) -> String {
        "xray.service".to_string()
    }

    fn dependencies(&self, _request: &ProvisioningRequest) -> Vec<Prerequisite> {
        vec![Prerequisite::Binary("xray")]
    }

    fn validate(&self, request: &ProvisioningRequest) -> Result<()> {
        let dest = request.reality.dest();
        let valid_dest = dest
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().map_or(false, |p| p > 0))
            .unwrap_or(false);
        if !valid_dest {
            return Err(Error::validation(format!(
                "camouflage destination '{}' must be host:port",
                dest
            )));
        }
        Ok(())
    }

    fn secrets(
        &self,
        _request: &ProvisioningRequest,
        store: &mut SecretStore,
        _layout: &HostLayout,
    ) -> Result<SecretBundle> {
        let mut bundle = SecretBundle::new();
        let private = store.obtain(names::REALITY_PRIVATE_KEY, || {
            secrets::x25519_private_key(KeyEncoding::UrlSafe)
        })?;
        bundle.insert(names::REALITY_PRIVATE_KEY, private);
        let short_id = store.obtain(names::REALITY_SHORT_ID, secrets::short_id)?;
        bundle.insert(names::REALITY_SHORT_ID, short_id);
        Ok(bundle)
    }

    fn render(
        &self,
        request: &ProvisioningRequest,
        secrets: &SecretBundle,
        layout: &HostLayout,
    ) -> Result<RenderedConfig> {
        let private_key = secrets.get(names::REALITY_PRIVATE_KEY)?.trim();
        let short_id = secrets.get(names::REALITY_SHORT_ID)?.trim();
        let public_key = secrets::x25519_public_key(private_key, KeyEncoding::UrlSafe)?;

        let existing = match fs::read_to_string(layout.resolve(HostLayout::XRAY_CONFIG)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(Error::validation(format!(
                    "reading existing {}: {}; refusing to drop its clients",
                    HostLayout::XRAY_CONFIG,
                    e
                )));
            }
        };
        let managed = ApiManaged::from_existing(&existing).map_err(|e| {
            Error::validation(format!(
                "existing {} is not valid JSON ({}); refusing to drop its clients",
                HostLayout::XRAY_CONFIG,
                e
            ))
        })?;
        if !managed.clients.is_empty() {
            log::debug!("preserving {} Reality client(s)", managed.clients.len());
        }

        let content = Self::render_config(request, private_key, short_id, managed)?;
        Ok(RenderedConfig {
            // The packaged unit runs xray as an unprivileged user
            artifacts: vec![Artifact::new(HostLayout::XRAY_CONFIG, content, MODE_PUBLIC)],
            directories: Vec::new(),
            unit: self.unit(),
            endpoint: EndpointDescriptor::Reality {
                endpoint: request.endpoint.clone(),
                port: request.listen_port,
                public_key,
                sni: request.reality.sni.clone(),
                short_id: short_id.to_string(),
                fingerprint: request.reality.fingerprint.clone(),
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
        let admin_port = admin_port(rendered)?;
        bring_up(
            host,
            layout,
            rendered,
            changed,
            policy,
            &format!("xray API on 127.0.0.1:{}", admin_port),
            |h| h.tcp_reachable("127.0.0.1", admin_port, Duration::from_secs(1)),
        )?;
        Ok(rendered.endpoint.clone())
    }

    fn contract_fields(
        &self,
        request: &ProvisioningRequest,
        endpoint: &EndpointDescriptor,
    ) -> Vec<(String, String)> {
        let mut fields = vec![
            field("SERVER_DOMAIN", endpoint.endpoint()),
            field("SERVER_PORT", endpoint.port()),
        ];
        if let EndpointDescriptor::Reality {
            public_key,
            sni,
            short_id,
            fingerprint,
            ..
        } = endpoint
        {
            fields.push(field("SERVER_PUBLIC_KEY", public_key));
            fields.push(field("XRAY_CONFIG", HostLayout::XRAY_CONFIG));
            fields.push(field("XRAY_API_PORT", request.reality.admin_port));
            fields.push(field("XRAY_INBOUND_TAG", VLESS_TAG));
            fields.push(field("XRAY_FLOW", FLOW));
            fields.push(field("REALITY_SNI", sni));
            fields.push(field("REALITY_SHORT_ID", short_id));
            fields.push(field("REALITY_FINGERPRINT", fingerprint));
        }
        fields
    }
}

/// Admin port as rendered, read back from the API inbound
fn admin_port(rendered: &RenderedConfig) -> Result<u16> {
    let config = rendered
        .artifacts
        .iter()
        .find(|a| a.host_path.as_path() == std::path::Path::new(HostLayout::XRAY_CONFIG))
        .ok_or_else(|| Error::activation("rendered Xray config is missing"))?;
    let value: Value = serde_json::from_str(&config.content)?;
    value["inbounds"]
        .as_array()
        .and_then(|list| list.iter().find(|i| i["tag"] == API_TAG))
        .and_then(|i| i["port"].as_u64())
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| Error::activation("rendered Xray config has no API inbound"))
}
