//! The foreman: per-minion configuration over gRPC.
//!
//! For every machine with a public address, the foreman keeps a cached
//! client, asks the minion what it currently believes (role, addresses),
//! and pushes the configuration the database says it should have. Calls
//! fan out in parallel with a hard deadline each, and the results land in
//! `Machine.status` so operators can see which minions are reachable.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use tokio::task::JoinSet;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use loom_db::{Conn, Machine, Role, Table};
use loom_proto::minion::minion_client::MinionClient;
use loom_proto::minion::{GetConfigRequest, MinionConfig, Role as ProtoRole};

/// Port every minion's config server listens on.
pub const MINION_PORT: u16 = 9999;

/// Per-RPC deadline.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Machine status strings surfaced to `Query machine`.
pub const STATUS_CONNECTED: &str = "connected";
pub const STATUS_CONNECTING: &str = "connecting";

pub struct Foreman {
    conn: Conn,
    clients: HashMap<String, MinionClient<Channel>>,
}

impl Foreman {
    pub fn new(conn: Conn) -> Foreman {
        Foreman { conn, clients: HashMap::new() }
    }

    /// Learn the state of already-running minions without pushing config;
    /// run after a controller restart so assignments aren't flapped before
    /// we know what's out there.
    pub async fn init(&mut self) {
        self.sync(false).await;
    }

    /// One full query-and-write pass.
    pub async fn run_once(&mut self) {
        self.sync(true).await;
    }

    async fn sync(&mut self, write: bool) {
        let machines = self
            .conn
            .select(|m: &Machine| !m.public_ip.is_empty());
        let spec = self
            .conn
            .all::<loom_db::Cluster>()
            .into_iter()
            .next()
            .map(|c| c.spec)
            .unwrap_or_default();
        let etcd_members = etcd_members(&machines);

        // Forget clients for machines that no longer exist.
        let live: std::collections::HashSet<&str> =
            machines.iter().map(|m| m.public_ip.as_str()).collect();
        self.clients.retain(|ip, _| live.contains(ip.as_str()));

        let mut tasks: JoinSet<(String, Option<MinionClient<Channel>>, bool)> = JoinSet::new();
        for machine in machines {
            let ip = machine.public_ip.clone();
            let cached = self.clients.get(&ip).cloned();
            let config = minion_config_for(&machine, &spec, &etcd_members);
            tasks.spawn(async move {
                let mut client = match cached {
                    Some(client) => client,
                    None => match connect(&ip).await {
                        Ok(client) => client,
                        Err(err) => {
                            debug!(%ip, %err, "failed to reach minion");
                            return (ip, None, false);
                        }
                    },
                };

                let reported = match client.get_minion_config(GetConfigRequest {}).await {
                    Ok(reply) => Some(reply.into_inner()),
                    Err(status) => {
                        debug!(%ip, %status, "minion config query failed");
                        None
                    }
                };
                // A minion is connected once it reports the role we
                // assigned it.
                let connected = reported.is_some_and(|r| r.role == config.role);

                if write && !config.private_ip.is_empty() {
                    match client.set_minion_config(config).await {
                        Ok(reply) => {
                            let reply = reply.into_inner();
                            if !reply.success {
                                warn!(%ip, error = %reply.error, "minion rejected its config");
                            }
                        }
                        Err(status) => warn!(%ip, %status, "failed to push minion config"),
                    }
                }

                (ip, Some(client), connected)
            });
        }

        let mut statuses: HashMap<String, bool> = HashMap::new();
        while let Some(result) = tasks.join_next().await {
            let Ok((ip, client, connected)) = result else {
                continue;
            };
            if let Some(client) = client {
                self.clients.insert(ip.clone(), client);
            } else {
                self.clients.remove(&ip);
            }
            statuses.insert(ip, connected);
        }

        self.conn
            .txn(&[Table::Machine])
            .run(|view| {
                for mut machine in view.all::<Machine>() {
                    let Some(&connected) = statuses.get(&machine.public_ip) else {
                        continue;
                    };
                    machine.status =
                        if connected { STATUS_CONNECTED } else { STATUS_CONNECTING }.to_string();
                    view.commit(machine);
                }
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});
    }
}

async fn connect(ip: &str) -> Result<MinionClient<Channel>, tonic::transport::Error> {
    let endpoint = Endpoint::from_shared(format!("http://{ip}:{MINION_PORT}"))?
        .connect_timeout(RPC_TIMEOUT)
        .timeout(RPC_TIMEOUT);
    Ok(MinionClient::new(endpoint.connect().await?))
}

/// The etcd member list: every master's private address.
pub fn etcd_members(machines: &[Machine]) -> Vec<String> {
    let mut members: Vec<String> = machines
        .iter()
        .filter(|m| m.role == Role::Master && !m.private_ip.is_empty())
        .map(|m| m.private_ip.clone())
        .collect();
    members.sort();
    members
}

/// The configuration a machine's minion should be running with.
pub fn minion_config_for(machine: &Machine, spec: &str, etcd_members: &[String]) -> MinionConfig {
    MinionConfig {
        minion_id: machine.id.to_string(),
        role: role_to_proto(machine.role) as i32,
        private_ip: machine.private_ip.clone(),
        spec: spec.to_string(),
        provider: machine.provider.to_string(),
        size: machine.size.clone(),
        region: machine.region.clone(),
        etcd_members: etcd_members.to_vec(),
    }
}

pub fn role_to_proto(role: Role) -> ProtoRole {
    match role {
        Role::None => ProtoRole::None,
        Role::Worker => ProtoRole::Worker,
        Role::Master => ProtoRole::Master,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(role: Role, public_ip: &str, private_ip: &str) -> Machine {
        Machine {
            role,
            public_ip: public_ip.to_string(),
            private_ip: private_ip.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn etcd_members_are_master_private_ips_sorted() {
        let machines = vec![
            machine(Role::Worker, "1.1.1.1", "10.0.0.3"),
            machine(Role::Master, "1.1.1.2", "10.0.0.2"),
            machine(Role::Master, "1.1.1.3", "10.0.0.1"),
            machine(Role::Master, "1.1.1.4", ""),
        ];
        assert_eq!(
            etcd_members(&machines),
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
        );
    }

    #[test]
    fn config_carries_identity_and_membership() {
        let mut m = machine(Role::Worker, "1.1.1.1", "10.0.0.3");
        m.id = 7;
        m.size = "m4.large".to_string();
        m.region = "us-west-1".to_string();

        let config = minion_config_for(&m, "{}", &["10.0.0.1".to_string()]);
        assert_eq!(config.minion_id, "7");
        assert_eq!(config.role, ProtoRole::Worker as i32);
        assert_eq!(config.private_ip, "10.0.0.3");
        assert_eq!(config.spec, "{}");
        assert_eq!(config.etcd_members, vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn role_mapping_is_total() {
        assert_eq!(role_to_proto(Role::None), ProtoRole::None);
        assert_eq!(role_to_proto(Role::Worker), ProtoRole::Worker);
        assert_eq!(role_to_proto(Role::Master), ProtoRole::Master);
    }
}
