//! Table identifiers.

use std::fmt;
use std::str::FromStr;

use crate::DbError;

/// The fixed set of tables held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Cluster,
    Machine,
    Acl,
    Container,
    Connection,
    Label,
    Placement,
    Etcd,
    Minion,
}

impl Table {
    /// Every table, in canonical (lock-ordering) order.
    pub const ALL: [Table; 9] = [
        Table::Cluster,
        Table::Machine,
        Table::Acl,
        Table::Container,
        Table::Connection,
        Table::Label,
        Table::Placement,
        Table::Etcd,
        Table::Minion,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Table::Cluster => "Cluster",
            Table::Machine => "Machine",
            Table::Acl => "ACL",
            Table::Container => "Container",
            Table::Connection => "Connection",
            Table::Label => "Label",
            Table::Placement => "Placement",
            Table::Etcd => "Etcd",
            Table::Minion => "Minion",
        };
        f.write_str(name)
    }
}

impl FromStr for Table {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cluster" => Ok(Table::Cluster),
            "machine" => Ok(Table::Machine),
            "acl" => Ok(Table::Acl),
            "container" => Ok(Table::Container),
            "connection" => Ok(Table::Connection),
            "label" => Ok(Table::Label),
            "placement" => Ok(Table::Placement),
            "etcd" => Ok(Table::Etcd),
            "minion" => Ok(Table::Minion),
            other => Err(DbError::UnknownTable(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_display() {
        for t in Table::ALL {
            assert_eq!(t.to_string().parse::<Table>().unwrap(), t);
        }
    }

    #[test]
    fn unknown_table_is_an_error() {
        assert_eq!(
            "nonsense".parse::<Table>(),
            Err(DbError::UnknownTable("nonsense".to_string()))
        );
    }
}
