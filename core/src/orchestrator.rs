//! Provisioning state machine
//!
//! Drives one backend through
//! `Uninitialized → SecretsReady → ConfigRendered → NetworkReady →
//! BackendActive → DatabaseReady → ContractPublished → ServicesEnabled`.
//! Stages run strictly in order and the first error stops the run; whatever
//! was applied before it stays applied. Re-running on a provisioned host
//! re-renders everything and skips side effects that are already in place.

use crate::backend::{self, BackendProvisioner, Prerequisite};
use crate::config::{HostLayout, InstallRecord, ProvisionConfig};
use crate::contract::Contract;
use crate::database;
use crate::error::ProvisionError;
use crate::host::Host;
use crate::lock::RunLock;
use crate::model::{EndpointDescriptor, ProvisioningRequest, RunState, Stage};
use crate::network;
use crate::secrets::{self, names, SecretBundle, SecretStore};
use crate::units::{self, UnitHandle, UnitSpec};
use crate::{Error, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// What one stage did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: Stage,
    pub changed: bool,
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub state: RunState,
    pub outcomes: Vec<StageOutcome>,
    pub endpoint: EndpointDescriptor,
    pub contract_path: PathBuf,
    pub api_token: String,
    /// Secrets created on this run (empty on an idempotent re-run)
    pub secrets_generated: Vec<String>,
}

impl ProvisionReport {
    pub fn changed(&self) -> bool {
        self.outcomes.iter().any(|o| o.changed)
    }
}

pub struct Orchestrator<H: Host> {
    host: H,
    config: ProvisionConfig,
    layout: HostLayout,
}

/// Bookkeeping for the stage currently being entered
struct Progress {
    at: Stage,
    outcomes: Vec<StageOutcome>,
}

impl Progress {
    fn new() -> Self {
        Self {
            at: Stage::Uninitialized,
            outcomes: Vec::new(),
        }
    }

    /// Stage the run is trying to reach
    fn entering(&self) -> Stage {
        self.at.next().unwrap_or(self.at)
    }

    fn fail(&self) -> impl Fn(Error) -> ProvisionError {
        let stage = self.entering();
        move |e| ProvisionError::new(stage, e)
    }

    fn reached(&mut self, changed: bool) {
        let stage = self.entering();
        log::info!(
            "reached {} ({})",
            stage,
            if changed { "changed" } else { "unchanged" }
        );
        self.outcomes.push(StageOutcome { stage, changed });
        self.at = stage;
    }
}

impl<H: Host> Orchestrator<H> {
    pub fn new(host: H, config: ProvisionConfig) -> Self {
        let layout = config.layout();
        Self {
            host,
            config,
            layout,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Provision the host for `request`
    pub fn run(
        &self,
        request: &ProvisioningRequest,
    ) -> std::result::Result<ProvisionReport, ProvisionError> {
        let backend = backend::for_kind(request.backend);
        let mut progress = Progress::new();
        log::info!(
            "provisioning {} for {}",
            request.backend.display_name(),
            request.endpoint
        );

        let _lock = RunLock::acquire(&self.layout.lock_path()).map_err(progress.fail())?;
        let record = self
            .check_preconditions(backend.as_ref(), request)
            .map_err(progress.fail())?;

        // SecretsReady
        let mut store = SecretStore::new(self.layout.secrets_dir());
        let (api_token, db_password, bundle) = self
            .obtain_secrets(backend.as_ref(), request, &mut store)
            .map_err(progress.fail())?;
        let secrets_generated = store.generated().to_vec();
        progress.reached(!secrets_generated.is_empty());

        // ConfigRendered
        let rendered = backend
            .render(request, &bundle, &self.layout)
            .and_then(|rendered| {
                let changed = backend::install_artifacts(&self.layout, &rendered)?;
                Ok((rendered, changed))
            });
        let (rendered, config_changed) = rendered.map_err(progress.fail())?;
        progress.reached(config_changed);

        // NetworkReady
        let changed = self
            .apply_network(request, &backend.dependencies(request))
            .map_err(progress.fail())?;
        progress.reached(changed);

        // BackendActive
        let was_active =
            units::is_active(&self.host, &rendered.unit).map_err(progress.fail())?;
        let endpoint = backend
            .activate(
                &self.host,
                &self.layout,
                &rendered,
                config_changed,
                &self.config.readiness,
            )
            .map_err(progress.fail())?;
        progress.reached(!was_active || config_changed);

        // DatabaseReady
        let changed = self
            .prepare_database(request, &db_password)
            .map_err(progress.fail())?;
        progress.reached(changed);

        // ContractPublished
        let contract = self.build_contract(
            backend.as_ref(),
            request,
            &endpoint,
            &api_token,
            &db_password,
        );
        let written = contract
            .write(&self.layout.contract_path())
            .map_err(progress.fail())?;
        progress.reached(written.changed);

        // ServicesEnabled
        let changed = self
            .enable_api(request, &rendered.unit, written.changed)
            .and_then(|changed| {
                self.save_record(record, request)?;
                Ok(changed)
            })
            .map_err(progress.fail())?;
        progress.reached(changed);

        Ok(ProvisionReport {
            state: RunState::At(progress.at),
            outcomes: progress.outcomes,
            endpoint,
            contract_path: written.path,
            api_token,
            secrets_generated,
        })
    }

    /// Everything that must hold before the first secret is generated
    fn check_preconditions(
        &self,
        backend: &dyn BackendProvisioner,
        request: &ProvisioningRequest,
    ) -> Result<Option<InstallRecord>> {
        if !self.host.is_privileged() {
            return Err(Error::precondition(
                "provisioning changes firewall, sysctl and systemd state; run as root",
            ));
        }

        request.validate()?;
        backend.validate(request)?;

        let record = InstallRecord::load(&self.layout.install_record_path())?;
        InstallRecord::check_exclusive(record.as_ref(), request.backend)?;

        let mut missing: Vec<String> = self
            .required_binaries(backend, request)
            .into_iter()
            .filter(|bin| !self.host.has_binary(bin))
            .collect();
        for dep in backend.dependencies(request) {
            if let Prerequisite::Executable(path) = dep {
                if !is_executable(&self.layout.resolve(&path)) {
                    missing.push(path.display().to_string());
                }
            }
        }
        if !missing.is_empty() {
            return Err(Error::precondition(format!(
                "required programs not found: {}",
                missing.join(", ")
            )));
        }

        let store = SecretStore::new(self.layout.secrets_dir());
        backend.preflight(request, &store, &self.layout)?;
        Ok(record)
    }

    fn required_binaries(
        &self,
        backend: &dyn BackendProvisioner,
        request: &ProvisioningRequest,
    ) -> BTreeSet<String> {
        let mut bins: BTreeSet<String> = ["systemctl", self.config.database.client.as_str()]
            .into_iter()
            .map(str::to_string)
            .collect();
        for dep in backend.dependencies(request) {
            match dep {
                Prerequisite::Binary(name) => {
                    bins.insert(name.to_string());
                }
                Prerequisite::Executable(_) => {}
                Prerequisite::KernelModule(_) => {
                    bins.insert("modprobe".to_string());
                }
                Prerequisite::Masquerade { .. } => {
                    bins.insert("iptables".to_string());
                    if request.egress_interface.is_none() {
                        bins.insert("ip".to_string());
                    }
                }
                Prerequisite::Forwarding => {
                    bins.insert("sysctl".to_string());
                }
            }
        }
        bins
    }

    fn obtain_secrets(
        &self,
        backend: &dyn BackendProvisioner,
        request: &ProvisioningRequest,
        store: &mut SecretStore,
    ) -> Result<(String, String, SecretBundle)> {
        for name in &request.regenerate {
            store.discard(name)?;
        }
        let api_token = store.obtain(names::API_TOKEN, secrets::token)?;
        let db_password = store.obtain(names::DB_PASSWORD, secrets::token)?;
        let bundle = backend.secrets(request, store, &self.layout)?;
        Ok((api_token, db_password, bundle))
    }

    fn apply_network(&self, request: &ProvisioningRequest, deps: &[Prerequisite]) -> Result<bool> {
        let mut changed = false;
        // Detected lazily, only when some rule needs it
        let mut egress = request.egress_interface.clone();

        for dep in deps {
            match dep {
                Prerequisite::Binary(_) | Prerequisite::Executable(_) => {}
                Prerequisite::KernelModule(module) => {
                    self.host
                        .run_checked("modprobe", &[*module], Error::NetworkSideEffect)?;
                }
                Prerequisite::Forwarding => {
                    changed |= network::ensure_forwarding(&self.host, &self.layout)?;
                }
                Prerequisite::Masquerade { subnet, iface } => {
                    let out = match egress.take() {
                        Some(out) => out,
                        None => network::detect_egress(&self.host)?,
                    };
                    changed |= network::ensure_masquerade(&self.host, subnet, &out)?;
                    changed |= network::ensure_forward_accept(&self.host, iface)?;
                    egress = Some(out);
                }
            }
        }
        Ok(changed)
    }

    fn prepare_database(&self, request: &ProvisioningRequest, password: &str) -> Result<bool> {
        let db_unit = UnitHandle {
            name: self.config.database.unit_name.clone(),
            changed: false,
        };
        let started = units::activate(&self.host, &db_unit, false)
            .map_err(|e| Error::database(e.to_string()))?;
        database::ensure_database(
            &self.host,
            &self.config.database.client,
            &request.database,
            password,
        )?;
        Ok(started)
    }

    fn build_contract(
        &self,
        backend: &dyn BackendProvisioner,
        request: &ProvisioningRequest,
        endpoint: &EndpointDescriptor,
        api_token: &str,
        db_password: &str,
    ) -> Contract {
        let mut contract = Contract::new();
        contract.set("API_TOKEN", api_token);
        contract.set("API_PORT", request.api_port);
        contract.set("MYSQL_HOST", &request.database.host);
        contract.set("MYSQL_DB", &request.database.name);
        contract.set("MYSQL_USER", &request.database.user);
        contract.set("MYSQL_PASSWORD", db_password);
        contract.set("SERVER_ENDPOINT_IP", endpoint.endpoint());
        contract.set("SERVER_ENDPOINT_PORT", endpoint.port());
        contract.extend(backend.contract_fields(request, endpoint));
        contract
    }

    fn enable_api(
        &self,
        request: &ProvisioningRequest,
        tunnel_unit: &str,
        contract_changed: bool,
    ) -> Result<bool> {
        let content = units::render_api_unit(
            &self.config.api,
            request.backend,
            tunnel_unit,
            &self.config.database.unit_name,
            request.api_port,
        );
        let spec = UnitSpec::rendered(self.config.api.unit_name.clone(), content);
        let handle = units::write_unit(&self.host, &self.layout, &spec)?;
        let changed = units::activate_dependent(&self.host, &handle, tunnel_unit, contract_changed)?;
        Ok(changed || handle.changed)
    }

    fn save_record(
        &self,
        existing: Option<InstallRecord>,
        request: &ProvisioningRequest,
    ) -> Result<()> {
        let record = match existing {
            Some(mut record) => {
                record.last_provisioned = Utc::now();
                record
            }
            None => InstallRecord::new(request.backend),
        };
        record.save(&self.layout.install_record_path())
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadinessPolicy;
    use crate::host::fake::FakeHost;
    use crate::model::BackendKind;
    use crate::fsutil;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn orchestrator(root: &Path) -> Orchestrator<FakeHost> {
        let mut config = ProvisionConfig::default();
        config.layout.root = root.to_path_buf();
        config.readiness = ReadinessPolicy {
            attempts: 3,
            interval_ms: 1,
        };
        let orch = Orchestrator::new(FakeHost::new(), config);
        // easy-rsa ships its script inside the directory it manages
        let easyrsa = orch.layout().resolve("/etc/openvpn/easy-rsa/easyrsa");
        fs::create_dir_all(easyrsa.parent().unwrap()).unwrap();
        fs::write(&easyrsa, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&easyrsa, fs::Permissions::from_mode(0o755)).unwrap();
        orch
    }

    fn secret_files(layout: &HostLayout) -> BTreeMap<String, Vec<u8>> {
        fs::read_dir(layout.secrets_dir())
            .unwrap()
            .map(|e| e.unwrap())
            .map(|e| (e.file_name().to_string_lossy().to_string(), fs::read(e.path()).unwrap()))
            .collect()
    }

    #[test]
    fn test_fresh_host_amnezia() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let request = ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5");

        let report = orch.run(&request).unwrap();
        assert_eq!(report.state, RunState::At(Stage::ServicesEnabled));
        assert_eq!(report.outcomes.len(), 7);
        assert!(report.outcomes.iter().all(|o| o.changed));
        assert_eq!(
            report.outcomes.iter().map(|o| o.stage).collect::<Vec<_>>(),
            Stage::SEQUENCE[1..].to_vec()
        );
        assert_eq!(report.secrets_generated.len(), 4);

        let contract = Contract::read(&report.contract_path).unwrap();
        assert_eq!(contract.get("SERVER_ENDPOINT_IP"), Some("203.0.113.5"));
        assert_eq!(contract.get("SERVER_ENDPOINT_PORT"), Some("51830"));
        assert_eq!(contract.get("VPN_NETWORK"), Some("10.100.10.0/24"));
        assert_eq!(contract.get("API_TOKEN"), Some(report.api_token.as_str()));
        assert_eq!(contract.get("MYSQL_DB"), Some("wg_panel"));
        assert_eq!(fsutil::file_mode(&report.contract_path).unwrap(), 0o600);

        let private = fs::read_to_string(orch.layout().secrets_dir().join("tunnel-private-key")).unwrap();
        assert!(!fs::read_to_string(&report.contract_path).unwrap().contains(&private));

        let host = orch.host();
        assert_eq!(host.rule_count("nat", "POSTROUTING"), 1);
        assert_eq!(host.with(|s| s.ip_forward.clone()), "1");
        assert!(host.with(|s| s.loaded_modules.contains("amneziawg")));
        let api = host.unit("vpn-api.service");
        assert!(api.enabled && api.active);

        let record = InstallRecord::load(&orch.layout().install_record_path()).unwrap().unwrap();
        assert_eq!(record.backend, BackendKind::Amnezia);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let request = ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5");

        let first = orch.run(&request).unwrap();
        let contract_before = fs::read(&first.contract_path).unwrap();
        let secrets_before = secret_files(orch.layout());

        let second = orch.run(&request).unwrap();
        assert!(second.secrets_generated.is_empty());
        assert!(!second.changed(), "{:?}", second.outcomes);
        assert_eq!(second.api_token, first.api_token);
        assert_eq!(second.endpoint, first.endpoint);
        assert_eq!(fs::read(&second.contract_path).unwrap(), contract_before);
        assert_eq!(secret_files(orch.layout()), secrets_before);

        let host = orch.host();
        assert_eq!(host.rule_count("nat", "POSTROUTING"), 1);
        assert_eq!(host.rule_count("filter", "FORWARD"), 2);
        assert_eq!(host.unit("awg-quick@awg0.service").restarts, 0);
        assert_eq!(host.unit("vpn-api.service").restarts, 0);
        assert_eq!(host.with(|s| s.daemon_reloads), 1);
    }

    #[test]
    fn test_dependency_ordering() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let request = ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5");
        orch.run(&request).unwrap();

        let host = orch.host();
        assert_eq!(
            host.with(|s| s.start_log.clone()),
            vec![
                "awg-quick@awg0.service".to_string(),
                "mysql.service".to_string(),
                "vpn-api.service".to_string(),
            ]
        );
        let commands = host.with(|s| s.commands.clone());
        let pos = |prefix: &str| commands.iter().position(|c| c.starts_with(prefix)).unwrap();
        assert!(pos("iptables -t nat -A POSTROUTING") < pos("systemctl start awg-quick@awg0.service"));
        assert!(pos("mysql") < pos("systemctl start vpn-api.service"));
    }

    #[test]
    fn test_activation_timeout() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        orch.host()
            .with(|s| s.never_ready.insert("awg-quick@awg0.service".to_string()));
        let request = ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5");

        let err = orch.run(&request).unwrap_err();
        assert_eq!(err.stage, Stage::BackendActive);
        assert_eq!(err.state(), RunState::Failed(Stage::BackendActive));
        assert!(matches!(err.source, Error::Activation(_)));
        assert!(err.to_string().starts_with("stage BackendActive failed:"));

        let api = orch.host().unit("vpn-api.service");
        assert!(!api.enabled && !api.active);
        assert!(!orch.layout().contract_path().exists());
        // Earlier stages stay applied
        assert_eq!(orch.host().rule_count("nat", "POSTROUTING"), 1);
    }

    #[test]
    fn test_invalid_jitter_rejected_before_secrets() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let mut request = ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5");
        request.obfuscation.jmin = Some(900);
        request.obfuscation.jmax = Some(100);

        let err = orch.run(&request).unwrap_err();
        assert_eq!(err.stage, Stage::SecretsReady);
        assert!(matches!(err.source, Error::ConfigValidation(_)));
        assert!(!orch.layout().secrets_dir().exists());
    }

    #[test]
    fn test_second_backend_refused() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        orch.run(&ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5"))
            .unwrap();

        let err = orch
            .run(&ProvisioningRequest::new(BackendKind::OpenVpn, "203.0.113.5"))
            .unwrap_err();
        assert_eq!(err.stage, Stage::SecretsReady);
        assert!(matches!(err.source, Error::ConfigValidation(_)));
        assert!(!orch.layout().secrets_dir().join("openvpn-ca").exists());
    }

    #[test]
    fn test_preconditions() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let request = ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5");

        orch.host().with(|s| s.privileged = false);
        let err = orch.run(&request).unwrap_err();
        assert!(matches!(err.source, Error::Precondition(_)));

        orch.host().with(|s| {
            s.privileged = true;
            s.missing_binaries.insert("awg".to_string());
        });
        let err = orch.run(&request).unwrap_err();
        assert!(matches!(&err.source, Error::Precondition(msg) if msg.contains("awg")));
        assert!(!orch.layout().secrets_dir().exists());
    }

    #[test]
    fn test_concurrent_run_rejected() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let _held = RunLock::acquire(&orch.layout().lock_path()).unwrap();

        let err = orch
            .run(&ProvisioningRequest::new(BackendKind::Reality, "vpn.example.com"))
            .unwrap_err();
        assert_eq!(err.stage, Stage::SecretsReady);
        assert!(matches!(err.source, Error::Precondition(_)));
    }

    #[test]
    fn test_reality_run() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let request = ProvisioningRequest::new(BackendKind::Reality, "vpn.example.com");

        let report = orch.run(&request).unwrap();
        let contract = Contract::read(&report.contract_path).unwrap();
        assert_eq!(contract.get("SERVER_DOMAIN"), Some("vpn.example.com"));
        assert_eq!(contract.get("REALITY_SNI"), Some("vk.com"));
        assert_eq!(contract.get("REALITY_SHORT_ID").map(str::len), Some(16));

        // Userspace proxy: no NAT, no forwarding
        assert_eq!(orch.host().rule_count("nat", "POSTROUTING"), 0);
        assert_eq!(orch.host().with(|s| s.ip_forward.clone()), "0");
        let unit = fs::read_to_string(orch.layout().unit_path("vpn-api.service")).unwrap();
        assert!(unit.contains("Requires=xray.service mysql.service"));
    }

    #[test]
    fn test_openvpn_ca_reset() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let request = ProvisioningRequest::new(BackendKind::OpenVpn, "203.0.113.5");

        let first = orch.run(&request).unwrap();
        let fp_before = Contract::read(&first.contract_path)
            .unwrap()
            .get("CA_FINGERPRINT")
            .unwrap()
            .to_string();
        let issued = orch
            .layout()
            .resolve("/etc/openvpn/easy-rsa/pki/issued/alice.crt");
        fs::write(&issued, "client cert").unwrap();

        let mut reset = request.clone();
        reset.cert.reset_ca = true;
        let second = orch.run(&reset).unwrap();
        let fp_after = Contract::read(&second.contract_path)
            .unwrap()
            .get("CA_FINGERPRINT")
            .unwrap()
            .to_string();

        assert_ne!(fp_before, fp_after);
        assert!(second.secrets_generated.contains(&"openvpn-ca".to_string()));
        assert!(!second.secrets_generated.contains(&"tls-crypt-v2-server".to_string()));
        assert_eq!(second.api_token, first.api_token);
        assert!(issued.exists());

        let host = orch.host();
        assert_eq!(host.unit("openvpn-server@server.service").restarts, 1);
        // Contract changed, so the API picks it up
        assert_eq!(host.unit("vpn-api.service").restarts, 1);
    }

    #[test]
    fn test_explicit_regeneration() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let request = ProvisioningRequest::new(BackendKind::Reality, "vpn.example.com");
        let first = orch.run(&request).unwrap();

        let mut again = request.clone();
        again.regenerate.insert("api-token".to_string());
        let second = orch.run(&again).unwrap();
        assert_ne!(second.api_token, first.api_token);
        assert_eq!(second.secrets_generated, vec!["api-token".to_string()]);
        assert_eq!(second.endpoint, first.endpoint);
    }

    #[test]
    fn test_jmax_override_on_fresh_host() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let mut request = ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5");
        request.obfuscation.jmax = Some(30);

        let report = orch.run(&request).unwrap();
        let contract = Contract::read(&report.contract_path).unwrap();
        assert_eq!(contract.get("WG_JMAX"), Some("30"));
        let jmin: u16 = contract.get("WG_JMIN").unwrap().parse().unwrap();
        assert!(jmin <= 30);
    }

    #[test]
    fn test_override_conflicting_with_persisted_set() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let request = ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5");
        orch.run(&request).unwrap();
        let secrets_before = secret_files(orch.layout());

        let mut conflicting = request.clone();
        conflicting.obfuscation.jmin = Some(1200);
        let err = orch.run(&conflicting).unwrap_err();
        assert_eq!(err.stage, Stage::SecretsReady);
        assert!(matches!(err.source, Error::ConfigValidation(_)));
        assert_eq!(secret_files(orch.layout()), secrets_before);
    }

    #[test]
    fn test_egress_change_keeps_one_masquerade_rule() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let request = ProvisioningRequest::new(BackendKind::Amnezia, "203.0.113.5");
        orch.run(&request).unwrap();

        let mut moved = request.clone();
        moved.egress_interface = Some("ens4".to_string());
        let report = orch.run(&moved).unwrap();
        assert!(report
            .outcomes
            .iter()
            .any(|o| o.stage == Stage::NetworkReady && o.changed));

        let rules = orch
            .host()
            .with(|s| s.rules[&("nat".to_string(), "POSTROUTING".to_string())].clone());
        assert_eq!(
            rules,
            vec![vec!["-s", "10.100.10.0/24", "-o", "ens4", "-j", "MASQUERADE"]]
        );
    }

    #[test]
    fn test_openvpn_pki_ready_for_easyrsa() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        orch.run(&ProvisioningRequest::new(BackendKind::OpenVpn, "203.0.113.5"))
            .unwrap();

        let pki = orch.layout().resolve("/etc/openvpn/easy-rsa/pki");
        for sub in ["private", "reqs", "issued", "certs_by_serial"] {
            assert!(pki.join(sub).is_dir(), "{} missing", sub);
        }
        assert_eq!(fsutil::file_mode(&pki.join("private")).unwrap(), 0o700);
        assert!(pki.join("index.txt").is_file());
        assert_eq!(fs::read_to_string(pki.join("serial")).unwrap(), "01\n");
    }

    #[test]
    fn test_openvpn_requires_easyrsa_script() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        fs::remove_file(orch.layout().resolve("/etc/openvpn/easy-rsa/easyrsa")).unwrap();

        let err = orch
            .run(&ProvisioningRequest::new(BackendKind::OpenVpn, "203.0.113.5"))
            .unwrap_err();
        assert!(matches!(&err.source, Error::Precondition(msg) if msg.contains("easy-rsa/easyrsa")));
        assert!(!orch.layout().secrets_dir().exists());
    }

    #[test]
    fn test_missing_ca_secret_with_pki_on_disk() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let request = ProvisioningRequest::new(BackendKind::OpenVpn, "203.0.113.5");
        orch.run(&request).unwrap();

        fs::remove_file(orch.layout().secrets_dir().join("openvpn-ca")).unwrap();
        let secrets_before = secret_files(orch.layout());

        let err = orch.run(&request).unwrap_err();
        assert_eq!(err.stage, Stage::SecretsReady);
        assert!(matches!(err.source, Error::Certificate(_)));
        assert_eq!(secret_files(orch.layout()), secrets_before);
        assert!(secrets_before.contains_key("openvpn-server-cert"));
    }
}
