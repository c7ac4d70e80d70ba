//! The policy engine: blueprint in, desired rows out.
//!
//! Two halves. The master half turns the Cluster row's blueprint into
//! Machine rows and the ACL row for the cluster loop to act on. The minion
//! half turns the spec the foreman pushed into Connection rows everywhere
//! and, on masters, Container / Placement rows for the scheduler. Both
//! halves are plain diffs over the store; re-running them against an
//! unchanged blueprint commits nothing.

use std::collections::BTreeMap;
use std::convert::Infallible;

use tracing::{info, warn};

use loom_blueprint::Blueprint;
use loom_db::{
    Acl, Cluster, Conn, Connection, Container, Machine, Minion, Placement, PortRange,
    ProviderKind, Role, Table, View,
};
use loom_join::{hash_join, join};
use loom_provider::{default_region, sizes};

const DEFAULT_DISK_GB: u32 = 32;

/// Master-side loop: re-materialize machines and ACLs whenever the
/// deployment blueprint changes.
pub async fn run_master(conn: Conn) {
    let mut trigger = conn.trigger_tick(30, &[Table::Cluster]);
    while trigger.c.recv().await.is_some() {
        conn.txn(&[Table::Cluster, Table::Machine, Table::Acl])
            .run(|view| {
                let Some(cluster) = view.cluster() else {
                    return Ok::<_, Infallible>(());
                };
                if cluster.spec.is_empty() {
                    return Ok(());
                }
                match Blueprint::from_json(&cluster.spec) {
                    Ok(blueprint) => update_cluster(view, &blueprint),
                    Err(err) => warn!(%err, "ignoring unparsable blueprint"),
                }
                Ok(())
            })
            .unwrap_or_else(|e| match e {});
    }
}

/// Minion-side loop: apply the spec the foreman pushed into our row.
pub async fn run_minion(conn: Conn) {
    let mut trigger = conn.trigger_tick(60, &[Table::Minion]);
    while trigger.c.recv().await.is_some() {
        conn.txn(&[Table::Minion, Table::Container, Table::Connection, Table::Placement])
            .run(|view| {
                let Some(minion) = view.minion_self() else {
                    return Ok::<_, Infallible>(());
                };
                if minion.spec.is_empty() {
                    return Ok(());
                }
                update_policy(view, minion.role, &minion.spec);
                Ok(())
            })
            .unwrap_or_else(|e| match e {});
    }
}

/// Reconcile Machine rows and the ACL row against `blueprint`.
pub fn update_cluster(view: &mut View, blueprint: &Blueprint) {
    update_machines(view, blueprint);
    update_acl_row(view, blueprint);
}

fn update_machines(view: &mut View, blueprint: &Blueprint) {
    let desired: Vec<Machine> = blueprint
        .machines
        .iter()
        .filter_map(|bm| {
            let provider: ProviderKind = match bm.provider.parse() {
                Ok(p) => p,
                Err(err) => {
                    warn!(%err, "skipping machine with unknown provider");
                    return None;
                }
            };
            let role = match bm.role.as_str() {
                "Master" => Role::Master,
                "Worker" => Role::Worker,
                _ => Role::None,
            };
            let size = if bm.size.is_empty() {
                let chosen = sizes::choose_size(provider, bm.ram, bm.cpu, blueprint.max_price);
                if chosen.is_empty() {
                    warn!(provider = %provider, "no size satisfies the blueprint constraints");
                    return None;
                }
                chosen
            } else {
                bm.size.clone()
            };
            let region = if bm.region.is_empty() {
                default_region(provider).to_string()
            } else {
                bm.region.clone()
            };
            let disk_size = if bm.disk_size == 0 { DEFAULT_DISK_GB } else { bm.disk_size };

            Some(Machine {
                provider,
                role,
                size,
                region,
                disk_size,
                ssh_keys: bm.ssh_keys.clone(),
                ..Default::default()
            })
        })
        .collect();

    // Pair existing rows with still-desired machines; prefer keeping rows
    // the cloud already knows about so boots aren't repeated needlessly.
    let score = |db: &Machine, want: &Machine| -> i32 {
        if db.provider != want.provider
            || db.role != want.role
            || db.region != want.region
            || db.size != want.size
            || db.disk_size != want.disk_size
        {
            return -1;
        }
        if db.cloud_id.is_empty() {
            1
        } else {
            0
        }
    };

    let (pairs, stale, missing) = join(view.all::<Machine>(), desired, score);

    for (mut db, want) in pairs.into_iter().map(|p| (p.l, p.r)) {
        if db.ssh_keys != want.ssh_keys {
            db.ssh_keys = want.ssh_keys;
            view.commit(db);
        }
    }
    for machine in stale {
        view.remove(&machine);
    }
    for want in missing {
        let mut row: Machine = view.insert();
        let id = row.id;
        row = want;
        row.id = id;
        info!(provider = %row.provider, size = %row.size, "new machine requested");
        view.commit(row);
    }
}

fn update_acl_row(view: &mut View, blueprint: &Blueprint) {
    let mut acl = view.all::<Acl>().into_iter().next().unwrap_or_else(|| view.insert());

    let mut admin = blueprint.admin_acls.clone();
    admin.sort();
    admin.dedup();

    let mut ports: Vec<PortRange> = blueprint
        .public_ports()
        .into_iter()
        .map(|(min, max)| PortRange { min, max })
        .collect();
    ports.sort_by_key(|p| (p.min, p.max));
    ports.dedup();

    acl.admin = admin;
    acl.application_ports = ports;
    view.commit(acl);
}

/// Apply the pushed spec to this minion's desired-state tables.
///
/// Connections are materialized on every minion; Containers and Placements
/// only on masters (workers learn containers from the runtime inventory and
/// labels from the consensus store).
pub fn update_policy(view: &mut View, role: Role, spec_json: &str) {
    let blueprint = match Blueprint::from_json(spec_json) {
        Ok(b) => b,
        Err(err) => {
            warn!(%err, "ignoring unparsable spec");
            return;
        }
    };

    update_connections(view, &blueprint);
    if role == Role::Master {
        update_containers(view, &blueprint);
        update_placements(view, &blueprint);
    }
}

fn update_connections(view: &mut View, blueprint: &Blueprint) {
    let desired: Vec<(String, String, u16, u16)> = blueprint
        .connections
        .iter()
        .map(|c| (c.from.clone(), c.to.clone(), c.min_port, c.max_port))
        .collect();

    let (_, stale, missing) = hash_join(
        view.all::<Connection>(),
        desired,
        |c| (c.from.clone(), c.to.clone(), c.min_port, c.max_port),
        |d| d.clone(),
    );

    for conn in stale {
        view.remove(&conn);
    }
    for (from, to, min_port, max_port) in missing {
        let mut row: Connection = view.insert();
        row.from = from;
        row.to = to;
        row.min_port = min_port;
        row.max_port = max_port;
        view.commit(row);
    }
}

fn update_containers(view: &mut View, blueprint: &Blueprint) {
    // Label membership inverted: container id -> sorted label names.
    let mut memberships: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for label in &blueprint.labels {
        for id in &label.ids {
            memberships.entry(id.as_str()).or_default().push(label.name.clone());
        }
    }
    for labels in memberships.values_mut() {
        labels.sort();
    }

    let (pairs, stale, missing) = hash_join(
        view.all::<Container>(),
        blueprint.containers.clone(),
        |c| c.stitch_id.clone(),
        |b| b.id.clone(),
    );

    for pair in pairs {
        let mut db = pair.l;
        let want = pair.r;
        db.image = want.image;
        db.command = want.command;
        db.env = want.env;
        db.labels = memberships.get(want.id.as_str()).cloned().unwrap_or_default();
        view.commit(db);
    }
    for container in stale {
        view.remove(&container);
    }
    for want in missing {
        let mut row: Container = view.insert();
        row.stitch_id = want.id.clone();
        row.image = want.image;
        row.command = want.command;
        row.env = want.env;
        row.labels = memberships.get(want.id.as_str()).cloned().unwrap_or_default();
        view.commit(row);
    }
}

fn update_placements(view: &mut View, blueprint: &Blueprint) {
    let desired: Vec<Placement> = blueprint
        .placements
        .iter()
        .map(|p| Placement {
            target_label: p.target_label.clone(),
            exclusive: p.exclusive,
            other_label: p.other_label.clone(),
            provider: p.provider.clone(),
            size: p.size.clone(),
            region: p.region.clone(),
            ..Default::default()
        })
        .collect();

    let key = |p: &Placement| {
        (
            p.target_label.clone(),
            p.exclusive,
            p.other_label.clone(),
            p.provider.clone(),
            p.size.clone(),
            p.region.clone(),
        )
    };
    let (_, stale, missing) = hash_join(view.all::<Placement>(), desired, key, key);

    for placement in stale {
        view.remove(&placement);
    }
    for want in missing {
        let mut row: Placement = view.insert();
        let id = row.id;
        row = want;
        row.id = id;
        view.commit(row);
    }
}

/// Bootstrap or update this process's `is_self` Minion row.
pub fn set_self(conn: &Conn, minion_id: &str, role: Role, private_ip: &str) {
    conn.txn(&[Table::Minion])
        .run(|view| {
            let mut row = view.minion_self().unwrap_or_else(|| {
                let mut m: Minion = view.insert();
                m.is_self = true;
                m
            });
            row.minion_id = minion_id.to_string();
            row.role = role;
            row.private_ip = private_ip.to_string();
            view.commit(row);
            Ok::<_, Infallible>(())
        })
        .unwrap_or_else(|e| match e {});
}

/// Store a freshly deployed blueprint in the Cluster row.
pub fn commit_blueprint(view: &mut View, blueprint: &Blueprint) {
    let mut cluster = view.cluster().unwrap_or_else(|| view.insert::<Cluster>());
    cluster.namespace = blueprint.namespace.clone();
    cluster.spec = blueprint.to_json();
    view.commit(cluster);
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_blueprint::{
        BlueprintConnection, BlueprintContainer, BlueprintLabel, BlueprintMachine,
        BlueprintPlacement,
    };

    fn blueprint() -> Blueprint {
        Blueprint {
            namespace: "test".to_string(),
            machines: vec![
                BlueprintMachine {
                    provider: "Amazon".to_string(),
                    role: "Master".to_string(),
                    size: "m4.large".to_string(),
                    ..Default::default()
                },
                BlueprintMachine {
                    provider: "Amazon".to_string(),
                    role: "Worker".to_string(),
                    size: "m4.large".to_string(),
                    ..Default::default()
                },
            ],
            containers: vec![
                BlueprintContainer {
                    id: "c1".to_string(),
                    image: "nginx".to_string(),
                    ..Default::default()
                },
                BlueprintContainer {
                    id: "c2".to_string(),
                    image: "redis".to_string(),
                    ..Default::default()
                },
            ],
            labels: vec![
                BlueprintLabel { name: "web".to_string(), ids: vec!["c1".to_string()] },
                BlueprintLabel { name: "cache".to_string(), ids: vec!["c2".to_string()] },
            ],
            connections: vec![BlueprintConnection {
                from: "web".to_string(),
                to: "cache".to_string(),
                min_port: 6379,
                max_port: 6379,
            }],
            placements: vec![BlueprintPlacement {
                target_label: "cache".to_string(),
                exclusive: true,
                other_label: "web".to_string(),
                ..Default::default()
            }],
            admin_acls: vec!["192.0.2.1/32".to_string()],
            ..Default::default()
        }
    }

    fn with_cluster_view<T>(
        conn: &Conn,
        f: impl FnOnce(&mut View) -> T,
    ) -> T {
        conn.txn(&[Table::Cluster, Table::Machine, Table::Acl])
            .run(|view| Ok::<_, Infallible>(f(view)))
            .unwrap_or_else(|e| match e {})
    }

    fn with_policy_view<T>(conn: &Conn, f: impl FnOnce(&mut View) -> T) -> T {
        conn.txn(&[Table::Minion, Table::Container, Table::Connection, Table::Placement])
            .run(|view| Ok::<_, Infallible>(f(view)))
            .unwrap_or_else(|e| match e {})
    }

    #[test]
    fn machines_materialize_with_defaults() {
        let conn = Conn::new();
        with_cluster_view(&conn, |view| update_cluster(view, &blueprint()));

        let machines = conn.all::<Machine>();
        assert_eq!(machines.len(), 2);
        assert!(machines.iter().all(|m| m.region == "us-west-1"));
        assert!(machines.iter().all(|m| m.disk_size == DEFAULT_DISK_GB));
        assert!(machines.iter().any(|m| m.role == Role::Master));
        assert!(machines.iter().any(|m| m.role == Role::Worker));
    }

    #[test]
    fn update_is_idempotent() {
        let conn = Conn::new();
        let bp = blueprint();
        with_cluster_view(&conn, |view| update_cluster(view, &bp));
        let first = conn.all::<Machine>();
        with_cluster_view(&conn, |view| update_cluster(view, &bp));
        assert_eq!(conn.all::<Machine>(), first);
    }

    #[test]
    fn removed_machines_are_dropped() {
        let conn = Conn::new();
        let mut bp = blueprint();
        with_cluster_view(&conn, |view| update_cluster(view, &bp));

        bp.machines.truncate(1);
        with_cluster_view(&conn, |view| update_cluster(view, &bp));
        assert_eq!(conn.all::<Machine>().len(), 1);
    }

    #[test]
    fn booted_machines_survive_a_shrink() {
        let conn = Conn::new();
        let bp = blueprint();
        with_cluster_view(&conn, |view| update_cluster(view, &bp));

        // Pretend the cloud booted the worker.
        conn.txn(&[Table::Machine])
            .run(|view| {
                let mut m = view
                    .select(|m: &Machine| m.role == Role::Worker)
                    .remove(0);
                m.cloud_id = "i-1".to_string();
                view.commit(m);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        // Two identical workers requested, one already booted: the booted
        // row must be the one kept when only one remains desired.
        let mut shrunk = bp.clone();
        shrunk.machines = vec![bp.machines[1].clone()];
        with_cluster_view(&conn, |view| update_cluster(view, &shrunk));

        let machines = conn.all::<Machine>();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].cloud_id, "i-1");
    }

    #[test]
    fn size_chosen_from_ram_constraints() {
        let conn = Conn::new();
        let mut bp = blueprint();
        bp.machines.truncate(1);
        bp.machines[0].size = String::new();
        bp.machines[0].ram = loom_blueprint::Range { min: 8.0, max: 0.0 };
        with_cluster_view(&conn, |view| update_cluster(view, &bp));

        assert_eq!(conn.all::<Machine>()[0].size, "m4.large");
    }

    #[test]
    fn acl_row_gathers_admin_and_public_ports() {
        let conn = Conn::new();
        let mut bp = blueprint();
        bp.connections.push(BlueprintConnection {
            from: loom_blueprint::PUBLIC.to_string(),
            to: "web".to_string(),
            min_port: 80,
            max_port: 80,
        });
        with_cluster_view(&conn, |view| update_cluster(view, &bp));

        let acls = conn.all::<Acl>();
        assert_eq!(acls.len(), 1);
        assert_eq!(acls[0].admin, vec!["192.0.2.1/32".to_string()]);
        assert_eq!(acls[0].application_ports, vec![PortRange { min: 80, max: 80 }]);
    }

    #[test]
    fn master_policy_materializes_everything() {
        let conn = Conn::new();
        let spec = blueprint().to_json();
        with_policy_view(&conn, |view| update_policy(view, Role::Master, &spec));

        assert_eq!(conn.all::<Container>().len(), 2);
        assert_eq!(conn.all::<Connection>().len(), 1);
        assert_eq!(conn.all::<Placement>().len(), 1);

        let c1 = conn
            .select(|c: &Container| c.stitch_id == "c1")
            .remove(0);
        assert_eq!(c1.labels, vec!["web".to_string()]);
    }

    #[test]
    fn worker_policy_only_touches_connections() {
        let conn = Conn::new();
        let spec = blueprint().to_json();
        with_policy_view(&conn, |view| update_policy(view, Role::Worker, &spec));

        assert!(conn.all::<Container>().is_empty());
        assert!(conn.all::<Placement>().is_empty());
        assert_eq!(conn.all::<Connection>().len(), 1);
    }

    #[test]
    fn container_identity_survives_image_change() {
        let conn = Conn::new();
        let mut bp = blueprint();
        let spec = bp.to_json();
        with_policy_view(&conn, |view| update_policy(view, Role::Master, &spec));
        let before = conn.select(|c: &Container| c.stitch_id == "c1").remove(0);

        bp.containers[0].image = "nginx:1.25".to_string();
        let spec = bp.to_json();
        with_policy_view(&conn, |view| update_policy(view, Role::Master, &spec));
        let after = conn.select(|c: &Container| c.stitch_id == "c1").remove(0);

        assert_eq!(before.id, after.id);
        assert_eq!(after.image, "nginx:1.25");
    }

    #[test]
    fn set_self_creates_then_updates() {
        let conn = Conn::new();
        set_self(&conn, "m-1", Role::Worker, "10.0.0.9");
        set_self(&conn, "m-1", Role::Master, "10.0.0.9");

        let minions = conn.all::<Minion>();
        assert_eq!(minions.len(), 1);
        assert!(minions[0].is_self);
        assert_eq!(minions[0].role, Role::Master);
    }
}
