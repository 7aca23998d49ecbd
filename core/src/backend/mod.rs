//! Tunnel backends
//!
//! One trait, three variants. Each variant knows its prerequisites, the
//! secrets it needs, how to render its daemon configuration, how to bring
//! the daemon up and what the profile API must be told about it.

mod amnezia;
mod openvpn;
mod reality;

pub use amnezia::AmneziaBackend;
pub use openvpn::OpenVpnBackend;
pub use reality::RealityBackend;

use crate::config::{HostLayout, ReadinessPolicy};
use crate::fsutil;
use crate::host::{wait_until, Host};
use crate::model::{BackendKind, EndpointDescriptor, ProvisioningRequest};
use crate::secrets::{SecretBundle, SecretStore};
use crate::units::{self, UnitSpec};
use crate::Result;
use ipnetwork::Ipv4Network;
use std::path::PathBuf;

/// Something the host must provide before a backend can run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prerequisite {
    /// Executable that must be on PATH
    Binary(&'static str),
    /// Executable expected at a fixed host path rather than on PATH
    Executable(PathBuf),
    /// Kernel module loaded with modprobe
    KernelModule(&'static str),
    /// NAT for the tunnel subnet, plus FORWARD accept rules for `iface`
    Masquerade { subnet: Ipv4Network, iface: String },
    /// IPv4 forwarding switched on
    Forwarding,
}

/// A file the backend wants on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Path as the daemon sees it
    pub host_path: PathBuf,
    pub content: String,
    pub mode: u32,
    /// Written only when absent; later content belongs to other tools
    pub create_only: bool,
}

impl Artifact {
    pub fn new(host_path: impl Into<PathBuf>, content: String, mode: u32) -> Self {
        Self {
            host_path: host_path.into(),
            content,
            mode,
            create_only: false,
        }
    }

    pub fn create_only(mut self) -> Self {
        self.create_only = true;
        self
    }
}

/// Output of `render`. Nothing here has touched the host yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub artifacts: Vec<Artifact>,
    /// Directories that must exist even while empty, with their modes
    pub directories: Vec<(PathBuf, u32)>,
    /// Tunnel systemd unit
    pub unit: String,
    /// What clients will be told once the daemon is up
    pub endpoint: EndpointDescriptor,
}

pub trait BackendProvisioner {
    fn kind(&self) -> BackendKind;

    /// Tunnel systemd unit name
    fn unit(&self) -> String;

    fn dependencies(&self, request: &ProvisioningRequest) -> Vec<Prerequisite>;

    /// Backend-specific checks. Runs before any secret is generated.
    fn validate(&self, request: &ProvisioningRequest) -> Result<()>;

    /// Checks against state already on the host (persisted secrets,
    /// existing files). Also runs before any secret is generated.
    fn preflight(
        &self,
        _request: &ProvisioningRequest,
        _store: &SecretStore,
        _layout: &HostLayout,
    ) -> Result<()> {
        Ok(())
    }

    /// Obtain every secret the backend needs through the store
    fn secrets(
        &self,
        request: &ProvisioningRequest,
        store: &mut SecretStore,
        layout: &HostLayout,
    ) -> Result<SecretBundle>;

    /// Produce the daemon configuration. Reads existing artifacts under
    /// `layout` to carry over entries the API added, and writes nothing.
    fn render(
        &self,
        request: &ProvisioningRequest,
        secrets: &SecretBundle,
        layout: &HostLayout,
    ) -> Result<RenderedConfig>;

    /// Bring the daemon up and wait until it is ready
    fn activate(
        &self,
        host: &dyn Host,
        layout: &HostLayout,
        rendered: &RenderedConfig,
        changed: bool,
        policy: &ReadinessPolicy,
    ) -> Result<EndpointDescriptor>;

    /// Backend-specific `KEY=value` pairs for the environment contract
    fn contract_fields(
        &self,
        request: &ProvisioningRequest,
        endpoint: &EndpointDescriptor,
    ) -> Vec<(String, String)>;
}

pub fn for_kind(kind: BackendKind) -> Box<dyn BackendProvisioner> {
    match kind {
        BackendKind::Amnezia => Box::new(AmneziaBackend::default()),
        BackendKind::Reality => Box::new(RealityBackend),
        BackendKind::OpenVpn => Box::new(OpenVpnBackend),
    }
}

/// Create the rendered directories and write the artifacts. Returns whether
/// anything was created or any content changed.
pub fn install_artifacts(layout: &HostLayout, rendered: &RenderedConfig) -> Result<bool> {
    let mut changed = false;
    for (dir, mode) in &rendered.directories {
        let path = layout.resolve(dir);
        if !path.is_dir() {
            log::info!("created {}", dir.display());
            changed = true;
        }
        fsutil::ensure_dir(&path, *mode)?;
    }
    for artifact in &rendered.artifacts {
        let path = layout.resolve(&artifact.host_path);
        if artifact.create_only && path.exists() {
            continue;
        }
        if fsutil::write_if_changed(&path, artifact.content.as_bytes(), artifact.mode)? {
            log::info!("wrote {}", artifact.host_path.display());
            changed = true;
        }
    }
    Ok(changed)
}

/// Enable and (re)start the packaged tunnel unit, then poll `probe` under
/// the readiness policy
pub(crate) fn bring_up(
    host: &dyn Host,
    layout: &HostLayout,
    rendered: &RenderedConfig,
    changed: bool,
    policy: &ReadinessPolicy,
    what: &str,
    mut probe: impl FnMut(&dyn Host) -> bool,
) -> Result<()> {
    let handle = units::write_unit(host, layout, &UnitSpec::vendor(rendered.unit.clone()))?;
    units::activate(host, &handle, changed)?;
    wait_until(host, what, policy, |h| probe(h))
}

/// Shorthand for building contract fields
pub(crate) fn field(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}
