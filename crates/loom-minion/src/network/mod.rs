//! The software-defined network.
//!
//! Workers wire every scheduled container into the dataplane (namespaces,
//! veths, OVS ports, NAT, routes, OpenFlow, DNS, hosts); the master leader
//! maintains the OVN northbound picture (one logical port per container).
//! Every sub-reconciler derives its target set from the database, observes
//! the live state, joins the two, and applies the difference — nothing
//! assumes its previous pass succeeded.

pub mod master;
pub mod shell;
pub mod worker;

use std::sync::Arc;

use loom_db::{Conn, Role, Table};

use crate::docker::Docker;
use shell::Shell;
use worker::Paths;

/// The OVN-managed bridge; patch ports link it to the integration bridge.
pub const OVN_BRIDGE: &str = "br-int";

/// Drive the network reconcilers until the process exits.
pub async fn run(conn: Conn, docker: Arc<dyn Docker>, shell: Arc<dyn Shell>) {
    let paths = Paths::default();
    let mut trigger = conn.trigger_tick(
        30,
        &[Table::Minion, Table::Container, Table::Label, Table::Connection, Table::Etcd],
    );

    while trigger.c.recv().await.is_some() {
        let Some(minion) = conn.minion_self() else {
            continue;
        };
        match minion.role {
            Role::Worker => {
                worker::run_once(&conn, docker.as_ref(), shell.as_ref(), &paths).await
            }
            Role::Master => {
                if conn.etcd_leader() {
                    master::run_once(&conn, docker.as_ref()).await;
                }
            }
            Role::None => {}
        }
    }
}
