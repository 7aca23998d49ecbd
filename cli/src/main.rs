//! vpn-provision - command line front end
//!
//! Provisions the local host for one tunnel backend and prints the
//! connection summary. Exits 0 when every stage was reached, 1 otherwise.

use clap::Parser;
use ipnetwork::Ipv4Network;
use std::path::PathBuf;
use std::process::ExitCode;
use vpn_provision_core::{
    BackendKind, Orchestrator, ProvisionConfig, ProvisioningRequest, SystemHost,
};

#[derive(Parser)]
#[command(name = "vpn-provision")]
#[command(version, about = "Provision this host as a VPN endpoint")]
struct Cli {
    /// Public IP address or domain clients connect to
    #[arg(env = "SERVER_ENDPOINT_IP")]
    endpoint: String,

    /// amnezia, reality or openvpn
    #[arg(short, long, env = "VPN_BACKEND")]
    backend: BackendKind,

    /// Provisioner settings (TOML)
    #[arg(short, long, default_value_os_t = ProvisionConfig::default_path())]
    config: PathBuf,

    /// Resolve every host path under this directory instead of /
    #[arg(long)]
    root: Option<PathBuf>,

    #[arg(long, env = "LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Tunnel subnet (amnezia, openvpn)
    #[arg(long, env = "VPN_NETWORK")]
    subnet: Option<Ipv4Network>,

    #[arg(long, env = "DNS_SERVERS")]
    dns: Option<String>,

    #[arg(long, env = "API_PORT")]
    api_port: Option<u16>,

    /// Skip default route detection
    #[arg(long, env = "EGRESS_IFACE")]
    egress: Option<String>,

    #[arg(long, env = "WG_JC")]
    jc: Option<u16>,
    #[arg(long, env = "WG_JMIN")]
    jmin: Option<u16>,
    #[arg(long, env = "WG_JMAX")]
    jmax: Option<u16>,
    #[arg(long, env = "WG_S1")]
    s1: Option<u16>,
    #[arg(long, env = "WG_S2")]
    s2: Option<u16>,
    #[arg(long, env = "WG_H1")]
    h1: Option<u32>,
    #[arg(long, env = "WG_H2")]
    h2: Option<u32>,
    #[arg(long, env = "WG_H3")]
    h3: Option<u32>,
    #[arg(long, env = "WG_H4")]
    h4: Option<u32>,

    /// Server name the Reality handshake impersonates
    #[arg(long, env = "REALITY_SNI")]
    sni: Option<String>,

    /// Camouflage upstream, host:port (defaults to <sni>:443)
    #[arg(long)]
    dest: Option<String>,

    #[arg(long, env = "REALITY_FINGERPRINT")]
    fingerprint: Option<String>,

    /// Replace the OpenVPN CA. Every issued client certificate stops working.
    #[arg(long)]
    reset_ca: bool,

    /// Regenerate a named secret (repeatable)
    #[arg(long, value_name = "SECRET")]
    regenerate: Vec<String>,
}

impl Cli {
    fn request(&self) -> ProvisioningRequest {
        let mut request = ProvisioningRequest::new(self.backend, self.endpoint.clone());
        if let Some(port) = self.listen_port {
            request.listen_port = port;
        }
        if self.subnet.is_some() {
            request.subnet = self.subnet;
        }
        if let Some(dns) = &self.dns {
            request.dns_servers = dns.clone();
        }
        if let Some(port) = self.api_port {
            request.api_port = port;
        }
        request.egress_interface = self.egress.clone();

        let o = &mut request.obfuscation;
        o.jc = self.jc;
        o.jmin = self.jmin;
        o.jmax = self.jmax;
        o.s1 = self.s1;
        o.s2 = self.s2;
        o.h1 = self.h1;
        o.h2 = self.h2;
        o.h3 = self.h3;
        o.h4 = self.h4;

        if let Some(sni) = &self.sni {
            request.reality.sni = sni.clone();
        }
        request.reality.dest = self.dest.clone();
        if let Some(fp) = &self.fingerprint {
            request.reality.fingerprint = fp.clone();
        }

        request.cert.reset_ca = self.reset_ca;
        request.regenerate = self.regenerate.iter().cloned().collect();
        request
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match ProvisionConfig::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: loading {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(root) = &cli.root {
        config.layout.root = root.clone();
    }

    let request = cli.request();
    let orchestrator = Orchestrator::new(SystemHost::new(), config);

    match orchestrator.run(&request) {
        Ok(report) => {
            println!("{} provisioned ({:?})", request.backend.display_name(), report.state);
            for outcome in &report.outcomes {
                println!(
                    "  {:<18} {}",
                    outcome.stage.as_str(),
                    if outcome.changed { "changed" } else { "ok" }
                );
            }
            for line in report.endpoint.summary_lines() {
                println!("{}", line);
            }
            println!("API token: {}", report.api_token);
            println!("Contract: {}", report.contract_path.display());
            if !report.secrets_generated.is_empty() {
                println!("Generated: {}", report.secrets_generated.join(", "));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            eprintln!("State: {:?}", e.state());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_builds_request() {
        let cli = Cli::try_parse_from([
            "vpn-provision",
            "203.0.113.5",
            "--backend",
            "awg",
            "--jc",
            "5",
            "--subnet",
            "10.9.0.0/24",
            "--regenerate",
            "api-token",
        ])
        .unwrap();
        let request = cli.request();
        assert_eq!(request.backend, BackendKind::Amnezia);
        assert_eq!(request.obfuscation.jc, Some(5));
        assert_eq!(request.subnet.unwrap().to_string(), "10.9.0.0/24");
        assert!(request.regenerate.contains("api-token"));
        assert_eq!(request.listen_port, 51830);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Cli::try_parse_from(["vpn-provision", "1.2.3.4", "--backend", "ipsec"]).is_err());
    }
}
