//! Row schemas.
//!
//! Rows are plain values: callers get copies inside a transaction and must
//! `commit` to persist a mutation. Empty strings and zero values mean
//! "unset", mirroring how the reconcilers fill fields in incrementally
//! (e.g. a Machine's `cloud_id` is empty until the cluster loop pairs it
//! with a cloud instance).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::table::Table;

/// The role a minion takes within the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[default]
    None,
    Worker,
    Master,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::None => "None",
            Role::Worker => "Worker",
            Role::Master => "Master",
        };
        f.write_str(s)
    }
}

/// A cloud on which machines may be instantiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[default]
    Amazon,
    Google,
    Vagrant,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] =
        [ProviderKind::Amazon, ProviderKind::Google, ProviderKind::Vagrant];
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderKind::Amazon => "Amazon",
            ProviderKind::Google => "Google",
            ProviderKind::Vagrant => "Vagrant",
        };
        f.write_str(s)
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Amazon" => Ok(ProviderKind::Amazon),
            "Google" => Ok(ProviderKind::Google),
            "Vagrant" => Ok(ProviderKind::Vagrant),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// An inclusive TCP/UDP port range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// A VM the policy wants (or the cloud has).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: u64,
    pub cloud_id: String,
    pub provider: ProviderKind,
    pub region: String,
    pub size: String,
    pub disk_size: u32,
    pub role: Role,
    pub public_ip: String,
    pub private_ip: String,
    pub ssh_keys: Vec<String>,
    pub status: String,
}

/// A container specified by the policy. `stitch_id` is the stable identity;
/// `docker_id` and `pid` are filled by the scheduler and runtime inventory,
/// `ip`/`mac` by the consensus store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: u64,
    pub stitch_id: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: std::collections::BTreeMap<String, String>,
    pub labels: Vec<String>,
    pub ip: String,
    pub mac: String,
    pub minion: String,
    pub pid: u32,
    pub docker_id: String,
}

/// A named set of containers. `container_ips` is the fan-out set used for
/// load balancing; `ip` is the label's own virtual address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: u64,
    pub name: String,
    pub ip: String,
    pub container_ips: Vec<String>,
    pub multi_host: bool,
}

/// Directed permission for `from` to open connections to `to` within the
/// port range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: u64,
    pub from: String,
    pub to: String,
    pub min_port: u16,
    pub max_port: u16,
}

/// A scheduling constraint on the containers of `target_label`. Exactly one
/// of the subject fields (`other_label`, `provider`, `size`, `region`) is
/// set; empty strings mean unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: u64,
    pub target_label: String,
    pub exclusive: bool,
    pub other_label: String,
    pub provider: String,
    pub size: String,
    pub region: String,
}

/// Replicated master-quorum state. Exactly one row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Etcd {
    pub id: u64,
    pub etcd_ips: Vec<String>,
    pub leader_ip: String,
    pub leader: bool,
}

/// The minion process's own configuration. Exactly one row with
/// `is_self = true` per minion process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Minion {
    pub id: u64,
    pub is_self: bool,
    pub minion_id: String,
    pub role: Role,
    pub private_ip: String,
    pub spec: String,
    pub provider: String,
    pub size: String,
    pub region: String,
}

/// The deployment as a whole. Exactly one row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: u64,
    pub namespace: String,
    pub spec: String,
}

/// Cloud firewall intent. Exactly one row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acl {
    pub id: u64,
    pub admin: Vec<String>,
    pub application_ports: Vec<PortRange>,
}

/// A typed row belonging to a fixed table.
pub trait Row: Clone + Send + Serialize + 'static {
    const TABLE: Table;

    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
    fn into_data(self) -> RowData;
    fn from_data(data: RowData) -> Option<Self>;
}

/// Type-erased row storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RowData {
    Cluster(Cluster),
    Machine(Machine),
    Acl(Acl),
    Container(Container),
    Connection(Connection),
    Label(Label),
    Placement(Placement),
    Etcd(Etcd),
    Minion(Minion),
}

impl RowData {
    pub(crate) fn id(&self) -> u64 {
        match self {
            RowData::Cluster(r) => r.id,
            RowData::Machine(r) => r.id,
            RowData::Acl(r) => r.id,
            RowData::Container(r) => r.id,
            RowData::Connection(r) => r.id,
            RowData::Label(r) => r.id,
            RowData::Placement(r) => r.id,
            RowData::Etcd(r) => r.id,
            RowData::Minion(r) => r.id,
        }
    }
}

macro_rules! impl_row {
    ($ty:ident, $table:expr) => {
        impl Row for $ty {
            const TABLE: Table = $table;

            fn id(&self) -> u64 {
                self.id
            }

            fn set_id(&mut self, id: u64) {
                self.id = id;
            }

            fn into_data(self) -> RowData {
                RowData::$ty(self)
            }

            fn from_data(data: RowData) -> Option<Self> {
                match data {
                    RowData::$ty(row) => Some(row),
                    _ => None,
                }
            }
        }
    };
}

impl_row!(Cluster, Table::Cluster);
impl_row!(Machine, Table::Machine);
impl_row!(Acl, Table::Acl);
impl_row!(Container, Table::Container);
impl_row!(Connection, Table::Connection);
impl_row!(Label, Table::Label);
impl_row!(Placement, Table::Placement);
impl_row!(Etcd, Table::Etcd);
impl_row!(Minion, Table::Minion);
