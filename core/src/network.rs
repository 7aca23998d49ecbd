//! Host-global network side effects: NAT masquerade, forwarding rules and
//! the IPv4 forwarding switch
//!
//! Every operation checks before it acts, so applying it twice leaves the
//! host exactly as applying it once.

use crate::config::HostLayout;
use crate::host::Host;
use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use std::fs;

const FORWARDING_KEY: &str = "net.ipv4.ip_forward";

/// Interface carrying the default route
pub fn detect_egress(host: &dyn Host) -> Result<String> {
    let output = host.run_checked("ip", &["route", "show", "default"], Error::NetworkSideEffect)?;
    for line in output.stdout.lines() {
        let mut parts = line.split_whitespace();
        while let Some(tok) = parts.next() {
            if tok == "dev" {
                if let Some(iface) = parts.next() {
                    return Ok(iface.to_string());
                }
            }
        }
    }
    Err(Error::network(
        "no default route found; pass the egress interface explicitly",
    ))
}

/// Append `spec` to `chain` unless an identical rule is already there
fn ensure_rule(host: &dyn Host, table: &str, chain: &str, spec: &[&str]) -> Result<bool> {
    let with_op = |op: &'static str| {
        let mut args = vec!["-t", table, op, chain];
        args.extend_from_slice(spec);
        args
    };

    let check = host.run("iptables", &with_op("-C"))?;
    if check.success() {
        log::debug!("iptables {} {} rule already present: {}", table, chain, spec.join(" "));
        return Ok(false);
    }

    host.run_checked("iptables", &with_op("-A"), Error::NetworkSideEffect)?;
    log::info!("added iptables {} {} rule: {}", table, chain, spec.join(" "));
    Ok(true)
}

/// Rule specs currently in `chain`, as printed by `iptables -S`
fn list_rules(host: &dyn Host, table: &str, chain: &str) -> Result<Vec<Vec<String>>> {
    let output = host.run_checked(
        "iptables",
        &["-t", table, "-S", chain],
        Error::NetworkSideEffect,
    )?;
    let prefix = format!("-A {} ", chain);
    Ok(output
        .stdout
        .lines()
        .filter_map(|line| line.strip_prefix(&prefix))
        .map(|spec| spec.split_whitespace().map(str::to_string).collect())
        .collect())
}

fn option_value<'a>(spec: &'a [String], flag: &str) -> Option<&'a str> {
    spec.iter()
        .position(|tok| tok == flag)
        .and_then(|i| spec.get(i + 1))
        .map(String::as_str)
}

/// Masquerade traffic from `subnet` leaving through `egress`. A masquerade
/// rule for the same subnet through another interface is replaced, so the
/// subnet keeps exactly one.
pub fn ensure_masquerade(host: &dyn Host, subnet: &Ipv4Network, egress: &str) -> Result<bool> {
    let source = subnet.to_string();
    let mut changed = false;

    for spec in list_rules(host, "nat", "POSTROUTING")? {
        let stale = option_value(&spec, "-s") == Some(source.as_str())
            && option_value(&spec, "-j") == Some("MASQUERADE")
            && option_value(&spec, "-o") != Some(egress);
        if !stale {
            continue;
        }
        let mut args = vec!["-t", "nat", "-D", "POSTROUTING"];
        args.extend(spec.iter().map(String::as_str));
        host.run_checked("iptables", &args, Error::NetworkSideEffect)?;
        log::info!("removed stale iptables nat POSTROUTING rule: {}", spec.join(" "));
        changed = true;
    }

    let added = ensure_rule(
        host,
        "nat",
        "POSTROUTING",
        &["-s", &source, "-o", egress, "-j", "MASQUERADE"],
    )?;
    Ok(changed || added)
}

/// Accept forwarded traffic entering and leaving the tunnel interface
pub fn ensure_forward_accept(host: &dyn Host, iface: &str) -> Result<bool> {
    let inbound = ensure_rule(host, "filter", "FORWARD", &["-i", iface, "-j", "ACCEPT"])?;
    let outbound = ensure_rule(host, "filter", "FORWARD", &["-o", iface, "-j", "ACCEPT"])?;
    Ok(inbound || outbound)
}

/// Turn on IPv4 forwarding now and persist it across reboots
pub fn ensure_forwarding(host: &dyn Host, layout: &HostLayout) -> Result<bool> {
    let mut changed = false;

    let current = host.run_checked("sysctl", &["-n", FORWARDING_KEY], Error::NetworkSideEffect)?;
    if current.stdout.trim() != "1" {
        let setting = format!("{}=1", FORWARDING_KEY);
        host.run_checked("sysctl", &["-w", &setting], Error::NetworkSideEffect)?;
        log::info!("enabled IPv4 forwarding");
        changed = true;
    }

    if persist_forwarding(layout)? {
        changed = true;
    }
    Ok(changed)
}

fn persist_forwarding(layout: &HostLayout) -> Result<bool> {
    let path = layout.sysctl_conf();
    let existing = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(Error::network(format!("reading {}: {}", path.display(), e)));
        }
    };

    let present = existing.lines().any(|line| {
        line.split_once('=')
            .map(|(k, v)| k.trim() == FORWARDING_KEY && v.trim() == "1")
            .unwrap_or(false)
    });
    if present {
        return Ok(false);
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&format!("{}=1\n", FORWARDING_KEY));
    crate::fsutil::write_atomic(&path, content.as_bytes(), crate::fsutil::MODE_PUBLIC)
        .map_err(|e| Error::network(format!("persisting forwarding: {}", e)))?;
    log::info!("persisted IPv4 forwarding in {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;
    use tempfile::tempdir;

    fn subnet() -> Ipv4Network {
        "10.100.10.0/24".parse().unwrap()
    }

    #[test]
    fn test_detect_egress() {
        let host = FakeHost::new();
        assert_eq!(detect_egress(&host).unwrap(), "eth0");

        host.with(|s| s.default_route = None);
        let err = detect_egress(&host).unwrap_err();
        assert!(matches!(err, Error::NetworkSideEffect(_)));
    }

    #[test]
    fn test_masquerade_applied_once() {
        let host = FakeHost::new();
        assert!(ensure_masquerade(&host, &subnet(), "eth0").unwrap());
        assert!(!ensure_masquerade(&host, &subnet(), "eth0").unwrap());
        assert_eq!(host.rule_count("nat", "POSTROUTING"), 1);

        let rule = host.with(|s| s.rules[&("nat".to_string(), "POSTROUTING".to_string())][0].clone());
        assert_eq!(
            rule,
            vec!["-s", "10.100.10.0/24", "-o", "eth0", "-j", "MASQUERADE"]
        );
    }

    #[test]
    fn test_masquerade_follows_egress_change() {
        let host = FakeHost::new();
        let other: Ipv4Network = "10.8.0.0/24".parse().unwrap();
        assert!(ensure_masquerade(&host, &other, "eth0").unwrap());
        assert!(ensure_masquerade(&host, &subnet(), "eth0").unwrap());

        assert!(ensure_masquerade(&host, &subnet(), "ens4").unwrap());
        assert!(!ensure_masquerade(&host, &subnet(), "ens4").unwrap());

        let rules = host.with(|s| s.rules[&("nat".to_string(), "POSTROUTING".to_string())].clone());
        assert_eq!(
            rules,
            vec![
                vec!["-s", "10.8.0.0/24", "-o", "eth0", "-j", "MASQUERADE"],
                vec!["-s", "10.100.10.0/24", "-o", "ens4", "-j", "MASQUERADE"],
            ]
        );
    }

    #[test]
    fn test_forward_accept_rules() {
        let host = FakeHost::new();
        assert!(ensure_forward_accept(&host, "awg0").unwrap());
        assert!(!ensure_forward_accept(&host, "awg0").unwrap());
        assert_eq!(host.rule_count("filter", "FORWARD"), 2);
    }

    #[test]
    fn test_forwarding_enabled_and_persisted() {
        let dir = tempdir().unwrap();
        let layout = HostLayout::new(dir.path());
        let host = FakeHost::new();

        assert!(ensure_forwarding(&host, &layout).unwrap());
        assert_eq!(host.with(|s| s.ip_forward.clone()), "1");
        let persisted = fs::read_to_string(layout.sysctl_conf()).unwrap();
        assert_eq!(persisted, "net.ipv4.ip_forward=1\n");

        assert!(!ensure_forwarding(&host, &layout).unwrap());
        assert_eq!(fs::read_to_string(layout.sysctl_conf()).unwrap(), persisted);
    }

    #[test]
    fn test_existing_sysctl_lines_kept() {
        let dir = tempdir().unwrap();
        let layout = HostLayout::new(dir.path());
        fs::create_dir_all(layout.sysctl_conf().parent().unwrap()).unwrap();
        fs::write(layout.sysctl_conf(), "vm.swappiness=10").unwrap();

        let host = FakeHost::new();
        host.with(|s| s.ip_forward = "1".to_string());
        assert!(ensure_forwarding(&host, &layout).unwrap());
        assert_eq!(
            fs::read_to_string(layout.sysctl_conf()).unwrap(),
            "vm.swappiness=10\nnet.ipv4.ip_forward=1\n"
        );
        // sysctl -w is skipped when the flag is already on
        assert!(!host.with(|s| s.commands.iter().any(|c| c.starts_with("sysctl -w"))));
    }
}
