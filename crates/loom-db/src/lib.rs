//! The in-process relational store.
//!
//! Every control loop in the system shares one [`Conn`]. State lives in a
//! fixed set of typed tables; all reads and writes go through short
//! transactions ([`Conn::txn`]) which stage their mutations and promote them
//! atomically on clean return. Components coordinate exclusively through the
//! tables and their change [`Trigger`]s — there is no other backchannel.
//!
//! The store is process-local and deliberately non-durable: on restart it is
//! rebuilt from external observation (cloud inventory, the consensus store,
//! the container runtime).

mod rows;
mod store;
mod table;
mod trigger;

pub use rows::{
    Acl, Cluster, Connection, Container, Etcd, Label, Machine, Minion, Placement, PortRange,
    ProviderKind, Role, Row, RowData,
};
pub use store::{Conn, Txn, View};
pub use table::Table;
pub use trigger::Trigger;

use thiserror::Error;

/// Errors surfaced by the store itself. Closure errors from transactions are
/// propagated verbatim and never wrapped in these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("row not found: {0}")]
    RowNotFound(u64),
}
