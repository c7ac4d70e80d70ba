//! Thin interface to the container runtime.
//!
//! Everything goes through the `docker` CLI so the runtime stays an
//! external collaborator; the [`Fake`] implementation backs the unit tests
//! with the same surface.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Label every application container carries; the value is its stable
/// stitch ID from the blueprint.
pub const STITCH_LABEL: &str = "loom.stitch-id";

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("failed to invoke docker: {0}")]
    Spawn(std::io::Error),

    #[error("docker {command:?} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("no such container: {0}")]
    NoSuchContainer(String),
}

pub type DockerResult<T> = Result<T, DockerError>;

/// A container as the runtime reports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub pid: u32,
    pub labels: BTreeMap<String, String>,
}

/// Options for starting a container.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Container name; empty for runtime-assigned.
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// e.g. "host"; empty for the default network.
    pub network_mode: String,
    pub privileged: bool,
    pub volumes_from: Vec<String>,
    pub binds: Vec<String>,
}

#[async_trait]
pub trait Docker: Send + Sync {
    async fn run(&self, opts: RunOptions) -> DockerResult<()>;

    /// Containers matching every `key=value` label filter (a bare key
    /// filters on label presence).
    async fn list(&self, label_filters: &[(&str, &str)]) -> DockerResult<Vec<Container>>;

    /// Remove (force) by name or ID. Succeeds if already gone.
    async fn remove(&self, name_or_id: &str) -> DockerResult<()>;

    async fn pull(&self, image: &str) -> DockerResult<()>;

    /// Run a command inside a container, returning stdout.
    async fn exec(&self, container: &str, cmd: &[&str]) -> DockerResult<String>;

    async fn read_file(&self, container: &str, path: &str) -> DockerResult<String>;

    async fn write_file(&self, container: &str, path: &str, content: &str) -> DockerResult<()>;
}

// ── CLI-backed implementation ──────────────────────────────────────

/// Drives a Docker (or Swarm) endpoint through the CLI.
pub struct Cli {
    /// `-H` argument; empty for the local daemon.
    host: String,
}

impl Cli {
    /// Talk to the local daemon.
    pub fn local() -> Cli {
        Cli { host: String::new() }
    }

    /// Talk to a remote endpoint, e.g. `tcp://10.0.0.1:2377` for a swarm.
    pub fn remote(host: &str) -> Cli {
        Cli { host: host.to_string() }
    }

    fn base(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("docker");
        if !self.host.is_empty() {
            cmd.arg("-H").arg(&self.host);
        }
        cmd
    }

    async fn output(&self, mut cmd: tokio::process::Command) -> DockerResult<String> {
        let rendered = format!("{:?}", cmd.as_std());
        debug!(command = %rendered, "docker");
        let out = cmd.output().await.map_err(DockerError::Spawn)?;
        if !out.status.success() {
            return Err(DockerError::Command {
                command: rendered,
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[async_trait]
impl Docker for Cli {
    async fn run(&self, opts: RunOptions) -> DockerResult<()> {
        let mut cmd = self.base();
        cmd.arg("run").arg("-d");
        if !opts.name.is_empty() {
            cmd.arg("--name").arg(&opts.name);
        }
        if !opts.network_mode.is_empty() {
            cmd.arg("--net").arg(&opts.network_mode);
        }
        if opts.privileged {
            cmd.arg("--privileged");
        }
        for (k, v) in &opts.env {
            cmd.arg("-e").arg(format!("{k}={v}"));
        }
        for (k, v) in &opts.labels {
            cmd.arg("--label").arg(format!("{k}={v}"));
        }
        for from in &opts.volumes_from {
            cmd.arg("--volumes-from").arg(from);
        }
        for bind in &opts.binds {
            cmd.arg("-v").arg(bind);
        }
        cmd.arg(&opts.image);
        cmd.args(&opts.args);
        self.output(cmd).await?;
        Ok(())
    }

    async fn list(&self, label_filters: &[(&str, &str)]) -> DockerResult<Vec<Container>> {
        let mut cmd = self.base();
        cmd.arg("ps").arg("-q").arg("--no-trunc");
        for (k, v) in label_filters {
            let filter = if v.is_empty() {
                format!("label={k}")
            } else {
                format!("label={k}={v}")
            };
            cmd.arg("--filter").arg(filter);
        }
        let ids: Vec<String> = self
            .output(cmd)
            .await?
            .lines()
            .map(str::to_string)
            .collect();

        let mut containers = Vec::new();
        for id in ids {
            let mut cmd = self.base();
            cmd.arg("inspect")
                .arg("--format")
                .arg("{{.Id}}\t{{.State.Pid}}\t{{.Config.Image}}\t{{.Name}}\t{{json .Config.Labels}}\t{{json .Config.Cmd}}")
                .arg(&id);
            let line = self.output(cmd).await?;
            if let Some(container) = parse_inspect_line(line.trim_end()) {
                containers.push(container);
            }
        }
        Ok(containers)
    }

    async fn remove(&self, name_or_id: &str) -> DockerResult<()> {
        let mut cmd = self.base();
        cmd.arg("rm").arg("-f").arg(name_or_id);
        match self.output(cmd).await {
            Ok(_) => Ok(()),
            // Already gone is success for a reconciler.
            Err(DockerError::Command { stderr, .. }) if stderr.contains("No such container") => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn pull(&self, image: &str) -> DockerResult<()> {
        let mut cmd = self.base();
        cmd.arg("pull").arg(image);
        self.output(cmd).await?;
        Ok(())
    }

    async fn exec(&self, container: &str, cmd_args: &[&str]) -> DockerResult<String> {
        let mut cmd = self.base();
        cmd.arg("exec").arg(container).args(cmd_args);
        self.output(cmd).await
    }

    async fn read_file(&self, container: &str, path: &str) -> DockerResult<String> {
        self.exec(container, &["cat", path]).await
    }

    async fn write_file(&self, container: &str, path: &str, content: &str) -> DockerResult<()> {
        let mut cmd = self.base();
        cmd.arg("exec")
            .arg("-i")
            .arg(container)
            .arg("sh")
            .arg("-c")
            .arg(format!("cat > {path}"));
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let rendered = format!("{:?}", cmd.as_std());
        let mut child = cmd.spawn().map_err(DockerError::Spawn)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(content.as_bytes())
                .await
                .map_err(DockerError::Spawn)?;
        }
        let out = child.wait_with_output().await.map_err(DockerError::Spawn)?;
        if !out.status.success() {
            return Err(DockerError::Command {
                command: rendered,
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

fn parse_inspect_line(line: &str) -> Option<Container> {
    let mut parts = line.split('\t');
    let id = parts.next()?.to_string();
    let pid: u32 = parts.next()?.parse().ok()?;
    let image = parts.next()?.to_string();
    let name = parts.next()?.trim_start_matches('/').to_string();
    let labels: BTreeMap<String, String> =
        serde_json::from_str(parts.next()?).unwrap_or_default();
    let command: Vec<String> = serde_json::from_str(parts.next()?).unwrap_or_default();
    Some(Container { id, name, image, command, pid, labels })
}

// ── In-memory implementation ───────────────────────────────────────

#[derive(Default)]
struct FakeState {
    containers: Vec<Container>,
    files: BTreeMap<(String, String), String>,
    pulled: Vec<String>,
    execs: Vec<(String, Vec<String>)>,
    next_id: u64,
}

/// An in-memory runtime with the same surface as the CLI.
#[derive(Default)]
pub struct Fake {
    state: Mutex<FakeState>,
}

impl Fake {
    pub fn new() -> Fake {
        Fake::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Images pulled so far.
    pub fn pulled(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }

    /// Every `exec` issued so far, as (container, argv).
    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.lock().execs.clone()
    }

    /// Names of running containers.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.lock().containers.iter().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    /// A file's content inside a container, if written.
    pub fn file(&self, container: &str, path: &str) -> Option<String> {
        self.lock().files.get(&(container.to_string(), path.to_string())).cloned()
    }
}

#[async_trait]
impl Docker for Fake {
    async fn run(&self, opts: RunOptions) -> DockerResult<()> {
        let mut state = self.lock();
        if !opts.name.is_empty() && state.containers.iter().any(|c| c.name == opts.name) {
            // Same-name container already running; runtime refuses, the
            // supervisor treats that as already satisfied.
            return Ok(());
        }
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        let pid = 10_000 + state.next_id as u32;
        state.containers.push(Container {
            id,
            name: opts.name,
            image: opts.image,
            command: opts.args,
            pid,
            labels: opts.labels,
        });
        Ok(())
    }

    async fn list(&self, label_filters: &[(&str, &str)]) -> DockerResult<Vec<Container>> {
        let state = self.lock();
        Ok(state
            .containers
            .iter()
            .filter(|c| {
                label_filters.iter().all(|(k, v)| {
                    c.labels
                        .get(*k)
                        .is_some_and(|have| v.is_empty() || have == v)
                })
            })
            .cloned()
            .collect())
    }

    async fn remove(&self, name_or_id: &str) -> DockerResult<()> {
        let mut state = self.lock();
        state
            .containers
            .retain(|c| c.name != name_or_id && c.id != name_or_id);
        Ok(())
    }

    async fn pull(&self, image: &str) -> DockerResult<()> {
        self.lock().pulled.push(image.to_string());
        Ok(())
    }

    async fn exec(&self, container: &str, cmd: &[&str]) -> DockerResult<String> {
        self.lock()
            .execs
            .push((container.to_string(), cmd.iter().map(|s| s.to_string()).collect()));
        Ok(String::new())
    }

    async fn read_file(&self, container: &str, path: &str) -> DockerResult<String> {
        let state = self.lock();
        if !state
            .containers
            .iter()
            .any(|c| c.id == container || c.name == container)
        {
            return Err(DockerError::NoSuchContainer(container.to_string()));
        }
        Ok(state
            .files
            .get(&(container.to_string(), path.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn write_file(&self, container: &str, path: &str, content: &str) -> DockerResult<()> {
        self.lock()
            .files
            .insert((container.to_string(), path.to_string()), content.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_line_parses() {
        let line = "abc123\t4242\tnginx\t/web-1\t{\"loom.stitch-id\":\"c1\"}\t[\"nginx\",\"-g\",\"daemon off;\"]";
        let c = parse_inspect_line(line).unwrap();
        assert_eq!(c.id, "abc123");
        assert_eq!(c.pid, 4242);
        assert_eq!(c.name, "web-1");
        assert_eq!(c.labels[STITCH_LABEL], "c1");
        assert_eq!(c.command, vec!["nginx", "-g", "daemon off;"]);
    }

    #[test]
    fn inspect_line_with_null_labels() {
        let line = "abc\t1\timg\t/n\tnull\tnull";
        let c = parse_inspect_line(line).unwrap();
        assert!(c.labels.is_empty());
        assert!(c.command.is_empty());
    }

    #[tokio::test]
    async fn fake_run_list_remove() {
        let fake = Fake::new();
        fake.run(RunOptions {
            name: "etcd".to_string(),
            image: "etcd:v2".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let all = fake.list(&[]).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].image, "etcd:v2");
        assert_eq!(all[0].id.len(), 64);

        fake.remove("etcd").await.unwrap();
        assert!(fake.list(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fake_label_filters() {
        let fake = Fake::new();
        let mut labels = BTreeMap::new();
        labels.insert(STITCH_LABEL.to_string(), "c1".to_string());
        fake.run(RunOptions { labels, image: "x".to_string(), ..Default::default() })
            .await
            .unwrap();
        fake.run(RunOptions { image: "y".to_string(), ..Default::default() })
            .await
            .unwrap();

        let app = fake.list(&[(STITCH_LABEL, "")]).await.unwrap();
        assert_eq!(app.len(), 1);
        let miss = fake.list(&[(STITCH_LABEL, "c2")]).await.unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn fake_duplicate_name_is_satisfied() {
        let fake = Fake::new();
        let opts = RunOptions { name: "ovsdb".to_string(), image: "a".to_string(), ..Default::default() };
        fake.run(opts.clone()).await.unwrap();
        fake.run(opts).await.unwrap();
        assert_eq!(fake.list(&[]).await.unwrap().len(), 1);
    }
}
