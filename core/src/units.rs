//! systemd unit management
//!
//! Tunnel units ship with their packages and are only enabled and started.
//! The profile API unit is rendered here, ordered after its tunnel, and is
//! never started while that tunnel is down.

use crate::config::{ApiSection, HostLayout};
use crate::fsutil::{self, MODE_PUBLIC};
use crate::host::Host;
use crate::model::BackendKind;
use crate::{Error, Result};

/// Where a unit file comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSource {
    /// Installed by the distribution package; restart policy is inherited
    Vendor,
    /// Written to `/etc/systemd/system/<name>` with this content
    Rendered(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub name: String,
    pub source: UnitSource,
}

impl UnitSpec {
    pub fn vendor(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: UnitSource::Vendor,
        }
    }

    pub fn rendered(name: impl Into<String>, content: String) -> Self {
        Self {
            name: name.into(),
            source: UnitSource::Rendered(content),
        }
    }
}

/// A unit known to systemd after `write_unit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHandle {
    pub name: String,
    /// Whether the unit file content changed on this run
    pub changed: bool,
}

/// Install the unit file if it is rendered. `daemon-reload` only runs when
/// the file content actually changed.
pub fn write_unit(host: &dyn Host, layout: &HostLayout, spec: &UnitSpec) -> Result<UnitHandle> {
    let changed = match &spec.source {
        UnitSource::Vendor => false,
        UnitSource::Rendered(content) => {
            let path = layout.unit_path(&spec.name);
            let changed = fsutil::write_if_changed(&path, content.as_bytes(), MODE_PUBLIC)?;
            if changed {
                log::info!("wrote unit file {}", path.display());
                host.run_checked("systemctl", &["daemon-reload"], Error::Activation)?;
            }
            changed
        }
    };
    Ok(UnitHandle {
        name: spec.name.clone(),
        changed,
    })
}

pub fn is_enabled(host: &dyn Host, unit: &str) -> Result<bool> {
    let output = host.run("systemctl", &["is-enabled", unit])?;
    Ok(output.stdout.trim() == "enabled")
}

pub fn is_active(host: &dyn Host, unit: &str) -> Result<bool> {
    let output = host.run("systemctl", &["is-active", unit])?;
    Ok(output.stdout.trim() == "active")
}

/// Enable the unit unless systemd already reports it enabled
pub fn enable(host: &dyn Host, handle: &UnitHandle) -> Result<bool> {
    if is_enabled(host, &handle.name)? {
        return Ok(false);
    }
    host.run_checked("systemctl", &["enable", &handle.name], Error::Activation)?;
    log::info!("enabled {}", handle.name);
    Ok(true)
}

/// Enable, then start if inactive or restart if the unit or its inputs
/// changed. Returns whether anything was done.
pub fn activate(host: &dyn Host, handle: &UnitHandle, inputs_changed: bool) -> Result<bool> {
    let mut changed = enable(host, handle)?;

    if !is_active(host, &handle.name)? {
        host.run_checked("systemctl", &["start", &handle.name], Error::Activation)?;
        log::info!("started {}", handle.name);
        changed = true;
    } else if handle.changed || inputs_changed {
        // Replace the running config rather than merging into it
        host.run_checked("systemctl", &["restart", &handle.name], Error::Activation)?;
        log::info!("restarted {} to pick up new configuration", handle.name);
        changed = true;
    } else {
        log::debug!("{} already active and unchanged", handle.name);
    }

    Ok(changed)
}

/// Activate a unit that hard-depends on `required`. Refuses to start it
/// while `required` is not active.
pub fn activate_dependent(
    host: &dyn Host,
    handle: &UnitHandle,
    required: &str,
    inputs_changed: bool,
) -> Result<bool> {
    if !is_active(host, required)? {
        return Err(Error::activation(format!(
            "{} is not active; refusing to start {} which requires it",
            required, handle.name
        )));
    }
    activate(host, handle, inputs_changed)
}

/// Render the profile API unit for `kind`
pub fn render_api_unit(
    api: &ApiSection,
    kind: BackendKind,
    tunnel_unit: &str,
    database_unit: &str,
    api_port: u16,
) -> String {
    format!(
        "[Unit]\n\
         Description=VPN profile API ({display})\n\
         Wants=network-online.target\n\
         Requires={tunnel} {db}\n\
         After=network-online.target {tunnel} {db}\n\
         \n\
         [Service]\n\
         Type=simple\n\
         EnvironmentFile={contract}\n\
         WorkingDirectory={workdir}\n\
         ExecStart={uvicorn} {module} --host 0.0.0.0 --port {port}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        display = kind.display_name(),
        tunnel = tunnel_unit,
        db = database_unit,
        contract = HostLayout::CONTRACT,
        workdir = api.install_dir.display(),
        uvicorn = api.uvicorn.display(),
        module = kind.api_module(),
        port = api_port,
    )
}
