//! The cluster loop: desired machines vs. cloud inventory.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use loom_db::{Acl as AclRow, Conn, Machine as DbMachine, ProviderKind, Table};
use loom_join::join;
use loom_provider::{group_by, Acl, Machine, Provider, Registry};

use crate::foreman::Foreman;

/// Minimum spacing between iterations, to stay friendly with cloud APIs.
const RATE_LIMIT: Duration = Duration::from_secs(5);

/// Back-off after a failed boot/terminate round.
const FAILURE_SLEEP: Duration = Duration::from_secs(60);

/// Drive cloud reconciliation until the process exits.
///
/// `my_ip` is this controller's address; it is always allowed through the
/// cloud firewall so the foreman can reach its minions.
pub async fn run(conn: Conn, registry: Arc<Registry>, my_ip: String) {
    let mut cluster: Option<Cluster> = None;
    let mut trigger = conn.trigger_tick(30, &[Table::Cluster, Table::Machine, Table::Acl]);

    while trigger.c.recv().await.is_some() {
        // Only the policy leader manipulates the cloud. A process with no
        // Etcd row at all is a standalone controller and always acts.
        let etcd = conn.all::<loom_db::Etcd>();
        if etcd.first().is_some_and(|e| !e.leader) {
            continue;
        }

        let Some(namespace) = conn.namespace() else {
            continue;
        };

        let mut current = match cluster.take() {
            Some(existing) if existing.namespace == namespace => existing,
            _ => {
                info!(%namespace, "(re)connecting cloud providers");
                let mut fresh = Cluster::new(conn.clone(), &namespace, &registry, &my_ip);
                fresh.run_once().await;
                fresh.foreman.init().await;
                fresh
            }
        };

        current.run_once().await;
        current.foreman.run_once().await;
        cluster = Some(current);

        tokio::time::sleep(RATE_LIMIT).await;
    }
}

/// One namespace's view of the clouds.
pub struct Cluster {
    pub(crate) namespace: String,
    conn: Conn,
    my_ip: String,
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
    pub(crate) foreman: Foreman,
}

impl Cluster {
    pub fn new(conn: Conn, namespace: &str, registry: &Registry, my_ip: &str) -> Cluster {
        let mut providers: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();
        for kind in registry.kinds() {
            match registry.connect(kind, namespace) {
                Ok(provider) => {
                    providers.insert(kind, Arc::from(provider));
                }
                Err(err) => debug!(%kind, %err, "provider unavailable"),
            }
        }
        Cluster {
            namespace: namespace.to_string(),
            conn: conn.clone(),
            my_ip: my_ip.to_string(),
            providers,
            foreman: Foreman::new(conn),
        }
    }

    /// One reconciliation pass: up to two machine syncs (so a boot's
    /// database effects are observed within the same pass), then the ACL
    /// sync, which must come last so fresh machines' addresses are allowed
    /// through before anything else changes.
    pub async fn run_once(&mut self) {
        for _ in 0..2 {
            let (boot_set, terminate_set) = self.sync_machines().await;
            if boot_set.is_empty() && terminate_set.is_empty() {
                break;
            }
            self.update_cloud(boot_set, true).await;
            self.update_cloud(terminate_set, false).await;
        }

        let (admin, app_ports, machines) = self
            .conn
            .txn(&[Table::Machine, Table::Acl])
            .run(|view| {
                let acl = view.all::<AclRow>().into_iter().next().unwrap_or_default();
                Ok::<_, Infallible>((
                    acl.admin,
                    acl.application_ports,
                    view.all::<DbMachine>(),
                ))
            })
            .unwrap_or_else(|e| match e {});
        self.sync_acls(admin, app_ports, machines).await;
    }

    /// Pair database machines with cloud machines, patch the pairs'
    /// database rows with cloud attributes, and return what's left: DB-only
    /// machines to boot and cloud-only machines to terminate.
    async fn sync_machines(&self) -> (Vec<Machine>, Vec<Machine>) {
        let cloud_machines = match self.list_cloud().await {
            Ok(machines) => machines,
            Err(err) => {
                error!(%err, "failed to list cloud machines");
                return (Vec::new(), Vec::new());
            }
        };

        self.conn
            .txn(&[Table::Machine])
            .run(|view| {
                let (pairs, unbooted, orphaned) =
                    sync_db(view.all::<DbMachine>(), cloud_machines.clone());

                for pair in pairs {
                    let mut dbm = pair.l;
                    let m = pair.r;
                    dbm.cloud_id = m.id;
                    dbm.public_ip = m.public_ip;
                    dbm.private_ip = m.private_ip;
                    // Don't overwrite requested attributes with blanks the
                    // cloud hasn't reported yet.
                    if !m.size.is_empty() {
                        dbm.size = m.size;
                    }
                    if m.disk_size != 0 {
                        dbm.disk_size = m.disk_size;
                    }
                    view.commit(dbm);
                }

                let boot_set: Vec<Machine> = unbooted
                    .into_iter()
                    .map(|dbm| Machine {
                        size: dbm.size,
                        provider: dbm.provider,
                        region: dbm.region,
                        disk_size: dbm.disk_size,
                        ssh_keys: dbm.ssh_keys,
                        ..Default::default()
                    })
                    .collect();

                Ok::<_, Infallible>((boot_set, orphaned))
            })
            .unwrap_or_else(|e| match e {})
    }

    async fn list_cloud(&self) -> Result<Vec<Machine>, loom_provider::ProviderError> {
        let mut all = Vec::new();
        for provider in self.providers.values() {
            all.extend(provider.list().await?);
        }
        Ok(all)
    }

    /// Boot or terminate `machines`, fanning out per provider. Sleeps after
    /// failures so a flapping cloud API isn't hammered.
    async fn update_cloud(&self, machines: Vec<Machine>, boot: bool) {
        if machines.is_empty() {
            return;
        }
        let action = if boot { "boot" } else { "terminate" };
        info!(count = machines.len(), action, "updating cloud");

        let mut tasks: JoinSet<bool> = JoinSet::new();
        for (kind, group) in group_by(machines) {
            let Some(provider) = self.providers.get(&kind).cloned() else {
                warn!(%kind, "provider is unavailable");
                tokio::time::sleep(FAILURE_SLEEP).await;
                continue;
            };
            tasks.spawn(async move {
                let result = if boot {
                    provider.boot(group).await
                } else {
                    provider.stop(group).await
                };
                match result {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(%kind, %err, action = if boot { "boot" } else { "terminate" },
                              "cloud update failed");
                        false
                    }
                }
            });
        }

        let mut all_ok = true;
        while let Some(result) = tasks.join_next().await {
            all_ok &= result.unwrap_or(false);
        }

        if all_ok {
            info!(action, "cloud update succeeded");
        } else {
            info!("cloud update failed; backing off");
            tokio::time::sleep(FAILURE_SLEEP).await;
        }
    }

    /// Make each cloud's firewall match the deployment's ACL intent.
    async fn sync_acls(
        &self,
        admin: Vec<String>,
        app_ports: Vec<loom_db::PortRange>,
        machines: Vec<DbMachine>,
    ) {
        let mut acls = Vec::new();
        for cidr in admin.iter().chain([&format!("{}/32", self.my_ip)]) {
            acls.push(Acl { cidr_ip: cidr.clone(), min_port: 1, max_port: 65535 });
        }
        for range in &app_ports {
            acls.push(Acl {
                cidr_ip: "0.0.0.0/0".to_string(),
                min_port: range.min,
                max_port: range.max,
            });
        }

        let mut active_kinds = HashSet::new();
        for m in &machines {
            if !m.public_ip.is_empty() {
                acls.push(Acl {
                    cidr_ip: format!("{}/32", m.public_ip),
                    min_port: 1,
                    max_port: 65535,
                });
            }
            active_kinds.insert(m.provider);
        }

        for (kind, provider) in &self.providers {
            let set = if active_kinds.contains(kind) { acls.clone() } else { Vec::new() };
            if let Err(err) = provider.set_acls(set).await {
                warn!(%kind, %err, "failed to update cloud ACLs");
            }
        }
    }
}

/// The machine-matching score: forbid cross-provider or mismatched-shape
/// pairs, then prefer cloud-ID, public-IP, private-IP matches in that order.
fn sync_db(
    db_machines: Vec<DbMachine>,
    cloud_machines: Vec<Machine>,
) -> (Vec<loom_join::Pair<DbMachine, Machine>>, Vec<DbMachine>, Vec<Machine>) {
    join(db_machines, cloud_machines, |dbm, m| {
        if dbm.provider != m.provider {
            return -1;
        }
        if !m.region.is_empty() && dbm.region != m.region {
            return -1;
        }
        if !m.size.is_empty() && dbm.size != m.size {
            return -1;
        }
        if m.disk_size != 0 && dbm.disk_size != m.disk_size {
            return -1;
        }
        if dbm.cloud_id == m.id {
            0
        } else if !dbm.public_ip.is_empty() && dbm.public_ip == m.public_ip {
            1
        } else if !dbm.private_ip.is_empty() && dbm.private_ip == m.private_ip {
            2
        } else {
            3
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_provider::inmem::InMemProvider;

    fn registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        registry.register(
            ProviderKind::Amazon,
            Box::new(|ns| {
                Ok(Box::new(InMemProvider::new(ProviderKind::Amazon, ns)) as Box<dyn Provider>)
            }),
        );
        Arc::new(registry)
    }

    fn insert_machine(conn: &Conn, size: &str) {
        conn.txn(&[Table::Machine])
            .run(|view| {
                let mut m: DbMachine = view.insert();
                m.provider = ProviderKind::Amazon;
                m.region = "us-west-1".to_string();
                m.size = size.to_string();
                m.disk_size = 32;
                view.commit(m);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});
    }

    fn cluster(conn: &Conn) -> Cluster {
        Cluster::new(conn.clone(), "test-ns", &registry(), "198.51.100.1")
    }

    #[tokio::test]
    async fn initial_boot_patches_db_from_cloud() {
        let conn = Conn::new();
        insert_machine(&conn, "m4.large");
        let mut cluster = cluster(&conn);

        cluster.run_once().await;

        let machines = conn.all::<DbMachine>();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].cloud_id, "i-1");
        assert!(!machines[0].public_ip.is_empty());
        assert!(!machines[0].private_ip.is_empty());
    }

    #[tokio::test]
    async fn partial_boot_only_boots_the_missing_size() {
        let conn = Conn::new();
        insert_machine(&conn, "m4.large");
        insert_machine(&conn, "m4.xlarge");
        let mut cluster = cluster(&conn);

        // Seed the cloud with a large instance that should be adopted.
        let provider = cluster.providers[&ProviderKind::Amazon].clone();
        provider
            .boot(vec![Machine {
                size: "m4.large".to_string(),
                region: "us-west-1".to_string(),
                ..Default::default()
            }])
            .await
            .unwrap();

        cluster.run_once().await;

        let machines = conn.all::<DbMachine>();
        assert_eq!(machines.len(), 2);
        assert!(machines.iter().all(|m| !m.cloud_id.is_empty()));
        // The seeded instance was adopted, not duplicated: exactly two in
        // the cloud.
        assert_eq!(provider.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn extra_cloud_machines_are_terminated() {
        let conn = Conn::new();
        insert_machine(&conn, "m4.large");
        let mut cluster = cluster(&conn);

        let provider = cluster.providers[&ProviderKind::Amazon].clone();
        for _ in 0..2 {
            provider
                .boot(vec![Machine {
                    size: "m4.large".to_string(),
                    region: "us-west-1".to_string(),
                    ..Default::default()
                }])
                .await
                .unwrap();
        }

        cluster.run_once().await;

        assert_eq!(provider.list().await.unwrap().len(), 1);
        assert_eq!(conn.all::<DbMachine>().len(), 1);
    }

    #[tokio::test]
    async fn reconciliation_is_stable_once_converged() {
        let conn = Conn::new();
        insert_machine(&conn, "m4.large");
        let mut cluster = cluster(&conn);

        cluster.run_once().await;
        let converged = conn.all::<DbMachine>();
        cluster.run_once().await;
        assert_eq!(conn.all::<DbMachine>(), converged);
    }

    /// Delegating wrapper so a test can keep a handle on the in-memory
    /// cloud the cluster is driving.
    #[derive(Debug)]
    struct SharedProvider(Arc<InMemProvider>);

    #[async_trait::async_trait]
    impl Provider for SharedProvider {
        async fn list(&self) -> Result<Vec<Machine>, loom_provider::ProviderError> {
            self.0.list().await
        }
        async fn boot(&self, machines: Vec<Machine>) -> Result<(), loom_provider::ProviderError> {
            self.0.boot(machines).await
        }
        async fn stop(&self, machines: Vec<Machine>) -> Result<(), loom_provider::ProviderError> {
            self.0.stop(machines).await
        }
        async fn set_acls(&self, acls: Vec<Acl>) -> Result<(), loom_provider::ProviderError> {
            self.0.set_acls(acls).await
        }
    }

    #[tokio::test]
    async fn acls_cover_controller_machines_and_app_ports() {
        let inner = Arc::new(InMemProvider::new(ProviderKind::Amazon, "test-ns"));
        let mut registry = Registry::new();
        let shared = inner.clone();
        registry.register(
            ProviderKind::Amazon,
            Box::new(move |_| Ok(Box::new(SharedProvider(shared.clone())) as Box<dyn Provider>)),
        );

        let conn = Conn::new();
        insert_machine(&conn, "m4.large");
        conn.txn(&[Table::Acl])
            .run(|view| {
                let mut acl: AclRow = view.insert();
                acl.admin = vec!["192.0.2.7/32".to_string()];
                acl.application_ports = vec![loom_db::PortRange { min: 80, max: 80 }];
                view.commit(acl);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        let mut cluster = Cluster::new(conn.clone(), "test-ns", &registry, "198.51.100.1");
        cluster.run_once().await;

        let machine_ip = conn.all::<DbMachine>()[0].public_ip.clone();
        let acls = inner.acls();

        let full = |cidr: &str| Acl { cidr_ip: cidr.to_string(), min_port: 1, max_port: 65535 };
        assert!(acls.contains(&full("192.0.2.7/32")), "admin ACL missing");
        assert!(acls.contains(&full("198.51.100.1/32")), "controller ACL missing");
        assert!(acls.contains(&full(&format!("{machine_ip}/32"))), "machine ACL missing");
        assert!(
            acls.contains(&Acl {
                cidr_ip: "0.0.0.0/0".to_string(),
                min_port: 80,
                max_port: 80
            }),
            "application port missing"
        );
    }

    #[test]
    fn score_forbids_cross_provider_pairs() {
        let dbm = DbMachine { provider: ProviderKind::Amazon, ..Default::default() };
        let m = Machine { provider: ProviderKind::Google, ..Default::default() };
        let (pairs, lefts, rights) = sync_db(vec![dbm], vec![m]);
        assert!(pairs.is_empty());
        assert_eq!(lefts.len(), 1);
        assert_eq!(rights.len(), 1);
    }

    #[test]
    fn score_prefers_cloud_id_over_addresses() {
        let dbm = DbMachine {
            provider: ProviderKind::Amazon,
            cloud_id: "i-1".to_string(),
            public_ip: "1.1.1.1".to_string(),
            ..Default::default()
        };
        let by_ip = Machine {
            provider: ProviderKind::Amazon,
            id: "i-9".to_string(),
            public_ip: "1.1.1.1".to_string(),
            ..Default::default()
        };
        let by_id = Machine {
            provider: ProviderKind::Amazon,
            id: "i-1".to_string(),
            ..Default::default()
        };
        let (pairs, _, _) = sync_db(vec![dbm], vec![by_ip, by_id]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].r.id, "i-1");
    }
}
