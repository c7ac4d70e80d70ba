//! Host-command seam for the network reconcilers.
//!
//! Everything the worker does to the host — `ip`, `iptables` — goes
//! through [`Shell`] so the reconcilers can run against a scripted fake.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to spawn {command}: {err}")]
    Spawn { command: String, err: std::io::Error },

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

pub type ShellResult<T> = Result<T, ShellError>;

#[async_trait]
pub trait Shell: Send + Sync {
    /// Run `argv`, returning stdout. Non-zero exit is an error.
    async fn run(&self, argv: &[String]) -> ShellResult<String>;
}

/// Build and run an `ip` invocation, optionally inside a namespace.
pub async fn ip_exec(shell: &dyn Shell, namespace: &str, args: &[&str]) -> ShellResult<String> {
    let mut argv: Vec<String> = Vec::new();
    if !namespace.is_empty() {
        argv.extend(["ip", "netns", "exec", namespace].map(str::to_string));
    }
    argv.push("ip".to_string());
    argv.extend(args.iter().map(|a| a.to_string()));
    shell.run(&argv).await
}

/// Runs commands on the host.
#[derive(Default)]
pub struct HostShell;

#[async_trait]
impl Shell for HostShell {
    async fn run(&self, argv: &[String]) -> ShellResult<String> {
        let command = argv.join(" ");
        debug!(%command, "sh");
        let out = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .map_err(|err| ShellError::Spawn { command: command.clone(), err })?;
        if !out.status.success() {
            return Err(ShellError::Command {
                command,
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Scripted shell for tests: canned stdout per exact command line, every
/// invocation recorded.
#[derive(Default)]
pub struct FakeShell {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    outputs: HashMap<String, String>,
    failures: std::collections::HashSet<String>,
    commands: Vec<String>,
}

impl FakeShell {
    pub fn new() -> FakeShell {
        FakeShell::default()
    }

    /// Script stdout for one exact command line.
    pub fn on(&self, command: &str, stdout: &str) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .outputs
            .insert(command.to_string(), stdout.to_string());
    }

    /// Make one exact command line fail.
    pub fn fail(&self, command: &str) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .failures
            .insert(command.to_string());
    }

    /// Every command line run so far.
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .commands
            .clone()
    }

    pub fn ran(&self, command: &str) -> bool {
        self.commands().iter().any(|c| c == command)
    }
}

#[async_trait]
impl Shell for FakeShell {
    async fn run(&self, argv: &[String]) -> ShellResult<String> {
        let command = argv.join(" ");
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.commands.push(command.clone());
        if state.failures.contains(&command) {
            return Err(ShellError::Command { command, stderr: "scripted failure".to_string() });
        }
        Ok(state.outputs.get(&command).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_scripts_and_records() {
        let shell = FakeShell::new();
        shell.on("ip link show eth0", "2: eth0: <UP>");

        let out = ip_exec(&shell, "", &["link", "show", "eth0"]).await.unwrap();
        assert_eq!(out, "2: eth0: <UP>");
        assert!(shell.ran("ip link show eth0"));
    }

    #[tokio::test]
    async fn namespaced_invocations_wrap_with_netns_exec() {
        let shell = FakeShell::new();
        ip_exec(&shell, "abc_ns", &["route", "show"]).await.unwrap();
        assert!(shell.ran("ip netns exec abc_ns ip route show"));
    }

    #[tokio::test]
    async fn scripted_failures_error() {
        let shell = FakeShell::new();
        shell.fail("iptables -t nat -S");
        let err = shell
            .run(&["iptables", "-t", "nat", "-S"].map(str::to_string))
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::Command { .. }));
    }
}
