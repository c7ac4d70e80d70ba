//! Master-leader OVN northbound sync.
//!
//! The leader keeps one logical switch with a logical port per addressed
//! container, so OVN can answer ARP for the whole deployment. Ports are
//! named by container IP; addresses carry the derived MAC.

use std::convert::Infallible;

use tracing::{error, info};

use loom_db::{Conn, Container, Table};
use loom_join::hash_join;

use crate::docker::Docker;
use crate::supervisor::OVN_NORTHD;

/// The deployment's single logical switch.
pub const LOGICAL_SWITCH: &str = "loom";

/// One northbound sync pass.
pub async fn run_once(conn: &Conn, docker: &dyn Docker) {
    let containers = conn
        .txn(&[Table::Container])
        .run(|view| {
            Ok::<_, Infallible>(view.select(|c: &Container| !c.ip.is_empty() && !c.mac.is_empty()))
        })
        .unwrap_or_else(|e| match e {});

    if let Err(err) = nbctl(docker, &["--may-exist", "ls-add", LOGICAL_SWITCH]).await {
        error!(%err, "failed to ensure the logical switch");
        return;
    }

    let current = match nbctl(docker, &["lsp-list", LOGICAL_SWITCH]).await {
        Ok(out) => parse_lsp_list(&out),
        Err(err) => {
            error!(%err, "failed to list logical ports");
            return;
        }
    };

    let expected: Vec<(String, String)> = containers
        .iter()
        .map(|c| (c.ip.clone(), format!("{} {}", c.mac, c.ip)))
        .collect();

    let (_, stale, missing) =
        hash_join(current, expected, |name| name.clone(), |(name, _)| name.clone());

    for name in stale {
        if let Err(err) = nbctl(docker, &["lsp-del", &name]).await {
            error!(port = %name, %err, "failed to delete logical port");
        }
    }
    for (name, addresses) in missing {
        let added = nbctl(docker, &["lsp-add", LOGICAL_SWITCH, &name]).await;
        if let Err(err) = added {
            error!(port = %name, %err, "failed to add logical port");
            continue;
        }
        if let Err(err) = nbctl(docker, &["lsp-set-addresses", &name, &addresses]).await {
            error!(port = %name, %err, "failed to set logical port addresses");
            continue;
        }
        info!(port = %name, "new logical port");
    }
}

/// Port names out of `ovn-nbctl lsp-list` output (`uuid (name)` lines).
fn parse_lsp_list(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| {
            let open = line.find('(')?;
            let close = line.rfind(')')?;
            (open < close).then(|| line[open + 1..close].to_string())
        })
        .collect()
}

async fn nbctl(docker: &dyn Docker, args: &[&str]) -> Result<String, crate::docker::DockerError> {
    let mut argv = vec!["ovn-nbctl"];
    argv.extend(args);
    docker.exec(OVN_NORTHD, &argv).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::Fake;

    #[test]
    fn lsp_list_parses_names() {
        let out = "5af1e1a3-... (10.0.0.2)\n91c200f1-... (10.0.0.3)\n";
        assert_eq!(parse_lsp_list(out), vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[tokio::test]
    async fn sync_creates_switch_and_ports() {
        let conn = Conn::new();
        conn.txn(&[Table::Container])
            .run(|view| {
                let mut c: Container = view.insert();
                c.ip = "10.0.0.2".to_string();
                c.mac = "02:00:0a:00:00:02".to_string();
                view.commit(c);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});
        let docker = Fake::new();

        run_once(&conn, &docker).await;

        let execs = docker.execs();
        assert!(execs.iter().any(|(c, argv)| {
            c == OVN_NORTHD && argv[..3] == ["ovn-nbctl", "--may-exist", "ls-add"].map(str::to_string)
        }));
        assert!(execs.iter().any(|(_, argv)| {
            argv.len() == 4 && argv[1] == "lsp-add" && argv[3] == "10.0.0.2"
        }));
        assert!(execs.iter().any(|(_, argv)| {
            argv.get(1).map(String::as_str) == Some("lsp-set-addresses")
                && argv.get(3).map(String::as_str) == Some("02:00:0a:00:00:02 10.0.0.2")
        }));
    }

    #[tokio::test]
    async fn unaddressed_containers_are_skipped() {
        let conn = Conn::new();
        conn.txn(&[Table::Container])
            .run(|view| {
                let _: Container = view.insert();
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});
        let docker = Fake::new();

        run_once(&conn, &docker).await;

        assert!(!docker
            .execs()
            .iter()
            .any(|(_, argv)| argv.get(1).map(String::as_str) == Some("lsp-add")));
    }
}
