//! Host integration: command execution and readiness probes
//!
//! Everything that mutates host-global state (iptables, sysctl, systemd,
//! the database) goes through [`Host`], so the rest of the crate can be run
//! against a simulated machine.

use crate::{Error, Result};
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::process::{Command, Output, Stdio};
use std::time::Duration;

/// Output from a command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// The machine being provisioned
pub trait Host {
    /// Run a command and capture output. A non-zero exit is not an error here.
    fn run(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a command feeding `input` on stdin
    fn run_with_input(&self, cmd: &str, args: &[&str], input: &str) -> Result<CommandOutput>;

    /// Whether a TCP listener accepts connections at `host:port`
    fn tcp_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool;

    /// Whether the current process may mutate system state
    fn is_privileged(&self) -> bool;

    fn sleep(&self, duration: Duration);

    /// Run a command and turn a non-zero exit into an error built by `on_fail`
    fn run_checked(
        &self,
        cmd: &str,
        args: &[&str],
        on_fail: fn(String) -> Error,
    ) -> Result<CommandOutput> {
        let output = self.run(cmd, args)?;
        if !output.success() {
            return Err(on_fail(format!(
                "`{} {}` exited with {}: {}",
                cmd,
                args.join(" "),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Check whether a binary is on PATH
    fn has_binary(&self, name: &str) -> bool {
        self.run("which", &[name])
            .map(|o| o.success())
            .unwrap_or(false)
    }
}

/// The real host, driven through std::process
#[derive(Debug, Clone)]
pub struct SystemHost {
    /// Timeout for TCP readiness probes in seconds
    pub connect_timeout_secs: u64,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 2,
        }
    }
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn_error(cmd: &str, args: &[&str], e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::CommandNotFound(cmd.to_string())
        } else {
            Error::Command {
                cmd: format!("{} {}", cmd, args.join(" ")),
                message: e.to_string(),
            }
        }
    }

    fn parse_output(output: Output) -> CommandOutput {
        CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

impl Host for SystemHost {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput> {
        log::debug!("exec: {} {}", cmd, args.join(" "));
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Self::spawn_error(cmd, args, e))?;
        Ok(Self::parse_output(output))
    }

    fn run_with_input(&self, cmd: &str, args: &[&str], input: &str) -> Result<CommandOutput> {
        log::debug!("exec (stdin): {} {}", cmd, args.join(" "));
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_error(cmd, args, e))?;

        // Reap the child even when it stops reading early
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(input.as_bytes()),
            None => Ok(()),
        };
        let output = child
            .wait_with_output()
            .map_err(|e| Self::spawn_error(cmd, args, e))?;

        written.map_err(|e| Error::Command {
            cmd: format!("{} {}", cmd, args.join(" ")),
            message: format!("writing stdin: {} (exit code {:?})", e, output.status.code()),
        })?;
        Ok(Self::parse_output(output))
    }

    fn tcp_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                log::debug!("resolving {}:{} failed: {}", host, port, e);
                return false;
            }
        };
        addrs
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, timeout).is_ok())
    }

    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Poll `probe` until it returns true or the policy's attempts run out
pub fn wait_until<H: Host + ?Sized>(
    host: &H,
    what: &str,
    policy: &crate::ReadinessPolicy,
    mut probe: impl FnMut(&H) -> bool,
) -> Result<()> {
    for attempt in 1..=policy.attempts {
        if probe(host) {
            log::debug!("{} ready after {} attempt(s)", what, attempt);
            return Ok(());
        }
        if attempt < policy.attempts {
            host.sleep(policy.interval());
        }
    }
    Err(Error::activation(format!(
        "{} did not become ready after {} attempts ({} ms apart)",
        what, policy.attempts, policy.interval_ms
    )))
}


#[cfg(test)]
mod tests {
    use super::fake::FakeHost;
    use super::*;
    use crate::ReadinessPolicy;

    #[test]
    fn test_command_output_success() {
        assert!(CommandOutput::ok("x").success());
        assert!(!CommandOutput::failed(3, "inactive").success());
    }

    #[test]
    fn test_run_checked_maps_failure() {
        let host = FakeHost::new();
        let err = host
            .run_checked("systemctl", &["frobnicate", "x"], Error::Activation)
            .unwrap_err();
        assert!(matches!(err, Error::Activation(msg) if msg.contains("frobnicate")));
    }

    #[test]
    fn test_wait_until_bounded() {
        let host = FakeHost::new();
        let policy = ReadinessPolicy {
            attempts: 4,
            interval_ms: 10,
        };
        let mut calls = 0;
        let err = wait_until(&host, "never", &policy, |_| {
            calls += 1;
            false
        })
        .unwrap_err();
        assert!(matches!(err, Error::Activation(_)));
        assert_eq!(calls, 4);
        assert_eq!(host.with(|s| s.sleeps), 3);

        let mut calls = 0;
        wait_until(&host, "third time", &policy, |_| {
            calls += 1;
            calls == 3
        })
        .unwrap();
    }

    #[test]
    fn test_system_host_runs_commands() {
        let host = SystemHost::new();
        let output = host.run("sh", &["-c", "echo hello; exit 3"]).unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "hello");

        let output = host.run_with_input("cat", &[], "piped").unwrap();
        assert_eq!(output.stdout, "piped");

        assert!(matches!(
            host.run("definitely-not-a-real-binary-xyz", &[]),
            Err(Error::CommandNotFound(_))
        ));
    }

    #[test]
    fn test_stdin_write_failure_still_reaps_child() {
        let host = SystemHost::new();
        // `true` exits without reading, so a payload larger than the pipe
        // buffer hits a broken pipe
        let input = "x".repeat(1 << 20);
        let err = host.run_with_input("true", &[], &input).unwrap_err();
        assert!(matches!(err, Error::Command { ref message, .. }
            if message.contains("writing stdin") && message.contains("Some(0)")));
    }
}
