//! The container scheduler.
//!
//! Runs only on the master that holds the policy leadership. Each pass
//! lists the swarm's containers, pairs them against the Container table,
//! records runtime IDs on the pairs, boots what the table wants but the
//! swarm lacks, and terminates what the swarm runs but the table dropped.
//! Because boots and terminations change the next observation, a tick
//! makes up to three passes to stabilize.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use loom_db::{Conn, Container as DbContainer, Placement, Role, Table};
use loom_join::join;

use crate::docker::{Cli, Container, Docker, RunOptions, STITCH_LABEL};
use crate::supervisor::stitch_labels;

/// The swarm manager's endpoint on the leader.
pub const SWARM_PORT: u16 = 2377;

/// Passes per tick before giving the cloud time to settle.
const MAX_PASSES: usize = 3;

/// Drive scheduling until the process exits.
pub async fn run(conn: Conn) {
    run_with(conn, |ip| {
        Arc::new(Cli::remote(&format!("tcp://{ip}:{SWARM_PORT}"))) as Arc<dyn Docker>
    })
    .await
}

/// As [`run`], with an injectable swarm-client factory.
pub async fn run_with(conn: Conn, swarm_factory: impl Fn(&str) -> Arc<dyn Docker>) {
    let mut swarm: Option<Arc<dyn Docker>> = None;
    let mut trigger = conn.trigger_tick(30, &[Table::Minion, Table::Etcd, Table::Container]);

    while trigger.c.recv().await.is_some() {
        let minion = conn.minion_self().unwrap_or_default();
        let leading = conn.etcd_leader();
        if minion.role != Role::Master || minion.private_ip.is_empty() || !leading {
            swarm = None;
            continue;
        }

        let docker = match &swarm {
            Some(docker) => docker.clone(),
            None => {
                let fresh = swarm_factory(&minion.private_ip);
                swarm = Some(fresh.clone());
                // Give the swarm manager a moment after we take over.
                tokio::time::sleep(Duration::from_secs(60)).await;
                fresh
            }
        };

        run_passes(&conn, docker.as_ref()).await;
    }
}

/// Up to [`MAX_PASSES`] sync passes against one inventory source.
pub async fn run_passes(conn: &Conn, docker: &dyn Docker) {
    for _ in 0..MAX_PASSES {
        let inventory = match docker.list(&[(STITCH_LABEL, "")]).await {
            Ok(list) => list,
            Err(err) => {
                warn!(%err, "failed to list swarm containers");
                break;
            }
        };

        let (boot, terminate, placements) = conn
            .txn(&[Table::Container, Table::Placement])
            .run(|view| {
                let (boot, terminate) = sync_txn(view, inventory.clone());
                Ok::<_, Infallible>((boot, terminate, view.all::<Placement>()))
            })
            .unwrap_or_else(|e| match e {});

        if boot.is_empty() && terminate.is_empty() {
            break;
        }

        for id in terminate {
            if let Err(err) = docker.remove(&id).await {
                warn!(%id, %err, "failed to terminate container");
            }
        }
        for dbc in boot {
            let opts = boot_options(&dbc, &placements);
            info!(stitch_id = %dbc.stitch_id, image = %dbc.image, "booting container");
            if let Err(err) = docker.run(opts).await {
                warn!(stitch_id = %dbc.stitch_id, %err, "failed to boot container");
            }
        }
    }
}

/// One database pass: pairs record their runtime ID; the returned sets are
/// the rows to boot and the runtime IDs to terminate.
pub fn sync_txn(
    view: &mut loom_db::View,
    inventory: Vec<Container>,
) -> (Vec<DbContainer>, Vec<String>) {
    let (pairs, unbooted, orphaned) =
        join(view.all::<DbContainer>(), inventory, |dbc, dkc| {
            if dkc.image != dbc.image || dkc.command != dbc.command {
                -1
            } else if dkc.id == dbc.docker_id {
                0
            } else {
                1
            }
        });

    for pair in pairs {
        let mut dbc = pair.l;
        dbc.docker_id = pair.r.id;
        view.commit(dbc);
    }

    let terminate = orphaned.into_iter().map(|dkc| dkc.id).collect();
    (unbooted, terminate)
}

/// The docker label carrying a loom label membership: `loom.label.<name>`.
pub fn member_label(name: &str) -> String {
    format!("loom.label.{name}")
}

/// Boot options for a desired container, with swarm affinity derived from
/// the Placement table.
pub fn boot_options(dbc: &DbContainer, placements: &[Placement]) -> RunOptions {
    let mut env = dbc.env.clone();
    for constraint in affinity(dbc, placements) {
        // Swarm reads scheduling constraints out of the environment.
        env.insert(constraint, "1".to_string());
    }

    let mut labels = stitch_labels(&dbc.stitch_id);
    for name in &dbc.labels {
        labels.insert(member_label(name), "1".to_string());
    }

    RunOptions {
        image: dbc.image.clone(),
        args: dbc.command.clone(),
        env,
        labels,
        ..Default::default()
    }
}

/// Swarm affinity/constraint strings applying to this container. Label
/// placement keys off the membership labels boots carry; machine-attribute
/// placement becomes node constraints.
pub fn affinity(dbc: &DbContainer, placements: &[Placement]) -> Vec<String> {
    let mut constraints = Vec::new();
    for p in placements {
        if !dbc.labels.contains(&p.target_label) {
            continue;
        }
        let op = if p.exclusive { "!=" } else { "==" };
        if !p.other_label.is_empty() {
            constraints.push(format!("affinity:{}{}1", member_label(&p.other_label), op));
        }
        if !p.provider.is_empty() {
            constraints.push(format!("constraint:provider{}{}", op, p.provider));
        }
        if !p.size.is_empty() {
            constraints.push(format!("constraint:size{}{}", op, p.size));
        }
        if !p.region.is_empty() {
            constraints.push(format!("constraint:region{}{}", op, p.region));
        }
    }
    constraints.sort();
    constraints
}
