//! The supervisor: system containers per role.
//!
//! Masters run an etcd member, ovsdb, and swarm's manager (plus ovn-northd
//! while they hold the leadership); workers run an etcd proxy, ovsdb,
//! ovs-vswitchd, swarm's join agent, and ovn-controller. The desired set is
//! recomputed from `{role, etcd_ips, leader_ip, private_ip, leader}`
//! whenever the Minion or Etcd rows change, and a role change tears every
//! system container down before the new set comes up.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use tracing::{info, warn};

use loom_db::{Conn, Container as DbContainer, Etcd, Minion, Role, Table};
use loom_join::hash_join;

use crate::docker::{Container, Docker, RunOptions, STITCH_LABEL};

pub const ETCD: &str = "etcd";
pub const OVN_CONTROLLER: &str = "ovn-controller";
pub const OVN_NORTHD: &str = "ovn-northd";
pub const OVSDB: &str = "ovsdb-server";
pub const OVS_VSWITCHD: &str = "ovs-vswitchd";
pub const SWARM: &str = "swarm";

/// Every system container and its image.
pub const IMAGES: [(&str, &str); 6] = [
    (ETCD, "quay.io/coreos/etcd:v2.2.4"),
    (OVN_CONTROLLER, "quay.io/loom/ovn-controller"),
    (OVN_NORTHD, "quay.io/loom/ovn-northd"),
    (OVSDB, "quay.io/loom/ovsdb-server"),
    (OVS_VSWITCHD, "quay.io/loom/ovs-vswitchd"),
    (SWARM, "swarm:1.0.1"),
];

const ETCD_HEARTBEAT_MS: &str = "500";
const ETCD_ELECTION_MS: &str = "5000";

/// The integration bridge every container's outer veth attaches to.
pub const INTEGRATION_BRIDGE: &str = "loom-int";

fn image(name: &str) -> &'static str {
    IMAGES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, img)| *img)
        .unwrap_or_else(|| panic!("unknown system container {name}"))
}

pub struct Supervisor {
    conn: Conn,
    docker: Arc<dyn Docker>,

    role: Role,
    etcd_ips: Vec<String>,
    leader_ip: String,
    ip: String,
    leader: bool,
}

impl Supervisor {
    pub fn new(conn: Conn, docker: Arc<dyn Docker>) -> Supervisor {
        Supervisor {
            conn,
            docker,
            role: Role::None,
            etcd_ips: Vec::new(),
            leader_ip: String::new(),
            ip: String::new(),
            leader: false,
        }
    }

    /// Run the system-container loop and the app-inventory loop forever.
    pub async fn run(mut self) {
        for (_, img) in IMAGES {
            let docker = self.docker.clone();
            tokio::spawn(async move {
                if let Err(err) = docker.pull(img).await {
                    warn!(image = img, %err, "failed to pull system image");
                }
            });
        }

        let conn = self.conn.clone();
        let docker = self.docker.clone();
        tokio::spawn(async move { run_app(conn, docker).await });

        let mut trigger = self.conn.trigger(&[Table::Minion, Table::Etcd]);
        while trigger.c.recv().await.is_some() {
            self.run_system_once().await;
        }
    }

    /// Re-derive the system container set if any input changed.
    pub async fn run_system_once(&mut self) {
        let minion = self.conn.minion_self().unwrap_or_default();
        let etcd = self.conn.all::<Etcd>().into_iter().next().unwrap_or_default();

        if self.role == minion.role
            && self.etcd_ips == etcd.etcd_ips
            && self.leader_ip == etcd.leader_ip
            && self.ip == minion.private_ip
            && self.leader == etcd.leader
        {
            return;
        }

        if minion.role != self.role {
            info!(from = %self.role, to = %minion.role, "role changed; removing system containers");
            self.remove_all().await;
        }

        match minion.role {
            Role::Master => {
                self.update_master(&minion.private_ip, &etcd.etcd_ips, etcd.leader)
                    .await
            }
            Role::Worker => {
                self.update_worker(&minion, &etcd.leader_ip, &etcd.etcd_ips)
                    .await
            }
            Role::None => {}
        }

        self.role = minion.role;
        self.etcd_ips = etcd.etcd_ips;
        self.leader_ip = etcd.leader_ip;
        self.ip = minion.private_ip;
        self.leader = etcd.leader;
    }

    async fn update_master(&self, ip: &str, etcd_ips: &[String], leader: bool) {
        if self.ip != ip || self.etcd_ips != etcd_ips {
            self.remove(ETCD).await;
        }
        if self.ip != ip {
            self.remove(SWARM).await;
        }
        if ip.is_empty() || etcd_ips.is_empty() {
            return;
        }

        self.run_container(
            ETCD,
            &[
                &format!("--name=master-{ip}"),
                &format!("--initial-cluster={}", initial_cluster(etcd_ips)),
                &format!("--advertise-client-urls=http://{ip}:2379"),
                &format!("--listen-peer-urls=http://{ip}:2380"),
                &format!("--initial-advertise-peer-urls=http://{ip}:2380"),
                "--listen-client-urls=http://0.0.0.0:2379",
                &format!("--heartbeat-interval={ETCD_HEARTBEAT_MS}"),
                "--initial-cluster-state=new",
                &format!("--election-timeout={ETCD_ELECTION_MS}"),
            ],
        )
        .await;
        self.run_container(OVSDB, &[]).await;

        let swarm_addr = format!("{ip}:2377");
        self.run_container(
            SWARM,
            &[
                "manage",
                "--replication",
                &format!("--addr={swarm_addr}"),
                &format!("--host={swarm_addr}"),
                "etcd://127.0.0.1:2379",
            ],
        )
        .await;

        if leader {
            self.run_container(OVN_NORTHD, &[]).await;
        } else {
            self.remove(OVN_NORTHD).await;
        }
    }

    async fn update_worker(&self, minion: &Minion, leader_ip: &str, etcd_ips: &[String]) {
        let ip = minion.private_ip.as_str();
        if self.etcd_ips != etcd_ips {
            self.remove(ETCD).await;
        }
        if self.leader_ip != leader_ip || self.ip != ip {
            self.remove(SWARM).await;
        }

        self.run_container(
            ETCD,
            &[
                &format!("--initial-cluster={}", initial_cluster(etcd_ips)),
                &format!("--heartbeat-interval={ETCD_HEARTBEAT_MS}"),
                &format!("--election-timeout={ETCD_ELECTION_MS}"),
                "--proxy=on",
            ],
        )
        .await;
        self.run_container(OVSDB, &[]).await;
        self.run_container(OVS_VSWITCHD, &[]).await;

        if leader_ip.is_empty() || ip.is_empty() {
            return;
        }

        self.run_container(
            SWARM,
            &["join", &format!("--addr={ip}:2375"), "etcd://127.0.0.1:2379"],
        )
        .await;

        let result = self
            .docker
            .exec(
                OVS_VSWITCHD,
                &[
                    "ovs-vsctl",
                    "set",
                    "Open_vSwitch",
                    ".",
                    &format!("external_ids:ovn-remote=\"tcp:{leader_ip}:6640\""),
                    &format!("external_ids:ovn-encap-ip={ip}"),
                    "external_ids:ovn-encap-type=\"geneve\"",
                    &format!("external_ids:system-id=\"loom-{}\"", minion.minion_id),
                    "--",
                    "add-br",
                    INTEGRATION_BRIDGE,
                    "--",
                    "set",
                    "bridge",
                    INTEGRATION_BRIDGE,
                    "fail_mode=secure",
                ],
            )
            .await;
        if let Err(err) = result {
            warn!(%err, "failed to configure the vswitch");
        }

        // ovn-controller can't re-target its remote at runtime; replace it
        // whenever the leader moves.
        self.remove(OVN_CONTROLLER).await;
        self.run_container(OVN_CONTROLLER, &[]).await;
    }

    async fn run_container(&self, name: &str, args: &[&str]) {
        let mut opts = RunOptions {
            name: name.to_string(),
            image: image(name).to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            network_mode: "host".to_string(),
            ..Default::default()
        };

        match name {
            OVS_VSWITCHD => {
                opts.privileged = true;
                opts.volumes_from = vec![OVSDB.to_string()];
            }
            OVN_NORTHD | OVN_CONTROLLER => {
                opts.volumes_from = vec![OVSDB.to_string()];
            }
            ETCD | OVSDB => {
                opts.binds = vec!["/usr/share/ca-certificates:/etc/ssl/certs".to_string()];
            }
            _ => {}
        }

        if let Err(err) = self.docker.run(opts).await {
            warn!(container = name, %err, "failed to run system container");
        }
    }

    async fn remove(&self, name: &str) {
        if let Err(err) = self.docker.remove(name).await {
            warn!(container = name, %err, "failed to remove system container");
        }
    }

    async fn remove_all(&self) {
        for (name, _) in IMAGES {
            self.remove(name).await;
        }
    }
}

fn initial_cluster(etcd_ips: &[String]) -> String {
    etcd_ips
        .iter()
        .map(|ip| format!("master-{ip}=http://{ip}:2380"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Worker-side inventory loop: mirror the runtime's application containers
/// into the Container table.
pub async fn run_app(conn: Conn, docker: Arc<dyn Docker>) {
    let mut trigger = conn.trigger_tick(10, &[Table::Minion, Table::Container]);
    while trigger.c.recv().await.is_some() {
        let Some(minion) = conn.minion_self() else {
            continue;
        };
        if minion.role != Role::Worker {
            continue;
        }
        let inventory = match docker.list(&[(STITCH_LABEL, "")]).await {
            Ok(list) => list,
            Err(err) => {
                warn!(%err, "failed to list application containers");
                continue;
            }
        };

        conn.txn(&[Table::Container])
            .run(|view| {
                run_app_txn(view, &minion.private_ip, inventory);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});
    }
}

/// Sync the Container table to the runtime inventory: stale rows go, new
/// containers get rows, pairs pick up pid/image/command and record which
/// minion they run on.
pub fn run_app_txn(view: &mut loom_db::View, minion_ip: &str, inventory: Vec<Container>) {
    let (mut pairs, stale, fresh) = hash_join(
        view.all::<DbContainer>(),
        inventory,
        |dbc| dbc.docker_id.clone(),
        |dkc| dkc.id.clone(),
    );

    for dbc in stale {
        view.remove(&dbc);
    }
    for dkc in fresh {
        let row: DbContainer = view.insert();
        pairs.push(loom_join::Pair { l: row, r: dkc });
    }
    for pair in pairs {
        let mut dbc = pair.l;
        let dkc = pair.r;
        dbc.docker_id = dkc.id;
        dbc.pid = dkc.pid;
        dbc.image = dkc.image;
        dbc.command = dkc.command;
        dbc.minion = minion_ip.to_string();
        if let Some(stitch_id) = dkc.labels.get(STITCH_LABEL) {
            dbc.stitch_id = stitch_id.clone();
        }
        view.commit(dbc);
    }
}

/// Environment map for application boots; exposed for the scheduler.
pub fn stitch_labels(stitch_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(STITCH_LABEL.to_string(), stitch_id.to_string());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::Fake;

    fn setup(role: Role, ip: &str, etcd_ips: &[&str], leader_ip: &str, leader: bool) -> Conn {
        let conn = Conn::new();
        conn.txn(&[Table::Minion, Table::Etcd])
            .run(|view| {
                let mut m: Minion = view.insert();
                m.is_self = true;
                m.role = role;
                m.private_ip = ip.to_string();
                m.minion_id = "m-1".to_string();
                view.commit(m);

                let mut e: Etcd = view.insert();
                e.etcd_ips = etcd_ips.iter().map(|s| s.to_string()).collect();
                e.leader_ip = leader_ip.to_string();
                e.leader = leader;
                view.commit(e);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});
        conn
    }

    #[tokio::test]
    async fn master_runs_quorum_and_manager() {
        let conn = setup(Role::Master, "10.0.0.1", &["10.0.0.1"], "", false);
        let docker = Arc::new(Fake::new());
        let mut sv = Supervisor::new(conn, docker.clone());

        sv.run_system_once().await;

        assert_eq!(docker.names(), vec![ETCD, OVSDB, SWARM]);
    }

    #[tokio::test]
    async fn master_leader_adds_northd() {
        let conn = setup(Role::Master, "10.0.0.1", &["10.0.0.1"], "10.0.0.1", true);
        let docker = Arc::new(Fake::new());
        let mut sv = Supervisor::new(conn, docker.clone());

        sv.run_system_once().await;

        assert!(docker.names().contains(&OVN_NORTHD.to_string()));
    }

    #[tokio::test]
    async fn worker_runs_dataplane_set() {
        let conn = setup(Role::Worker, "10.0.0.2", &["10.0.0.1"], "10.0.0.1", false);
        let docker = Arc::new(Fake::new());
        let mut sv = Supervisor::new(conn, docker.clone());

        sv.run_system_once().await;

        assert_eq!(
            docker.names(),
            vec![ETCD, OVN_CONTROLLER, OVSDB, OVS_VSWITCHD, SWARM]
        );
        // The vswitch got its OVN remote and the integration bridge.
        let execs = docker.execs();
        assert!(execs.iter().any(|(c, argv)| {
            c == OVS_VSWITCHD && argv.iter().any(|a| a.contains("ovn-remote"))
        }));
        assert!(execs
            .iter()
            .any(|(_, argv)| argv.iter().any(|a| a == INTEGRATION_BRIDGE)));
    }

    #[tokio::test]
    async fn role_change_tears_down_first() {
        let conn = setup(Role::Master, "10.0.0.1", &["10.0.0.1"], "", false);
        let docker = Arc::new(Fake::new());
        let mut sv = Supervisor::new(conn.clone(), docker.clone());
        sv.run_system_once().await;
        assert!(docker.names().contains(&SWARM.to_string()));

        conn.txn(&[Table::Minion])
            .run(|view| {
                let mut m = view.minion_self().unwrap();
                m.role = Role::Worker;
                view.commit(m);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        sv.run_system_once().await;
        // The worker set is present; master-only containers are gone.
        let names = docker.names();
        assert!(names.contains(&OVS_VSWITCHD.to_string()));
        assert!(!names.contains(&OVN_NORTHD.to_string()));
    }

    #[tokio::test]
    async fn unchanged_inputs_do_nothing() {
        let conn = setup(Role::Worker, "10.0.0.2", &["10.0.0.1"], "10.0.0.1", false);
        let docker = Arc::new(Fake::new());
        let mut sv = Supervisor::new(conn, docker.clone());
        sv.run_system_once().await;
        let execs_before = docker.execs().len();

        sv.run_system_once().await;
        assert_eq!(docker.execs().len(), execs_before);
    }

    #[tokio::test]
    async fn leader_move_restarts_ovn_controller() {
        let conn = setup(Role::Worker, "10.0.0.2", &["10.0.0.1"], "10.0.0.1", false);
        let docker = Arc::new(Fake::new());
        let mut sv = Supervisor::new(conn.clone(), docker.clone());
        sv.run_system_once().await;
        let first_id = id_of(&docker, OVN_CONTROLLER).await;

        conn.txn(&[Table::Etcd])
            .run(|view| {
                let mut e = view.etcd().unwrap();
                e.leader_ip = "10.0.0.9".to_string();
                view.commit(e);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        sv.run_system_once().await;
        let second_id = id_of(&docker, OVN_CONTROLLER).await;
        assert_ne!(first_id, second_id);
    }

    #[test]
    fn initial_cluster_formats_members() {
        let ips = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        assert_eq!(
            initial_cluster(&ips),
            "master-10.0.0.1=http://10.0.0.1:2380,master-10.0.0.2=http://10.0.0.2:2380"
        );
    }

    #[tokio::test]
    async fn app_inventory_round_trips() {
        let conn = Conn::new();
        let mut labels = BTreeMap::new();
        labels.insert(STITCH_LABEL.to_string(), "c1".to_string());
        let inventory = vec![Container {
            id: "d1".to_string(),
            image: "nginx".to_string(),
            command: vec!["nginx".to_string()],
            pid: 4242,
            labels,
            ..Default::default()
        }];

        conn.txn(&[Table::Container])
            .run(|view| {
                run_app_txn(view, "10.0.0.2", inventory.clone());
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        let rows = conn.all::<DbContainer>();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].docker_id, "d1");
        assert_eq!(rows[0].stitch_id, "c1");
        assert_eq!(rows[0].pid, 4242);
        assert_eq!(rows[0].minion, "10.0.0.2");

        // A vanished container drops its row.
        conn.txn(&[Table::Container])
            .run(|view| {
                run_app_txn(view, "10.0.0.2", Vec::new());
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});
        assert!(conn.all::<DbContainer>().is_empty());
    }

    async fn id_of(docker: &Fake, name: &str) -> String {
        docker
            .list(&[])
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.id)
            .unwrap_or_default()
    }
}
