//! Leader election over the consensus store.
//!
//! Masters race to create `/leader` with a TTL; the winner refreshes it at
//! half the TTL and holds the policy leadership (cluster-wide scheduling,
//! directory writes, OVN northbound). Everyone watches the key and mirrors
//! the current leader's IP into the Etcd row.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tracing::{info, warn};

use loom_db::{Conn, Etcd, Role, Table};

use crate::{Store, StoreError};

/// Where the leader's IP lives.
pub const LEADER_KEY: &str = "/leader";

/// Leadership lease; refreshed at half this interval.
pub const ELECTION_TTL: Duration = Duration::from_secs(30);

/// Grace period after a fresh master boots, so the etcd quorum can form
/// before the first campaign.
pub const BOOT_DELAY: Duration = Duration::from_secs(30);

/// Run both election halves until the process exits.
pub async fn run(conn: Conn, store: Arc<dyn Store>) {
    tokio::join!(campaign(conn.clone(), store.clone()), watch_leader(conn, store));
}

/// Contend for the leadership while this minion is a master.
pub async fn campaign(conn: Conn, store: Arc<dyn Store>) {
    let mut trigger = conn.trigger_tick(ELECTION_TTL.as_secs() / 2, &[Table::Minion]);
    let mut watch = store.watch(LEADER_KEY, Duration::from_secs(1));
    let mut was_master = false;

    loop {
        select! {
            msg = trigger.c.recv() => if msg.is_none() { return },
            msg = watch.recv() => if msg.is_none() { return },
        }

        let mut minion = conn.minion_self();
        let mut master = minion.as_ref().is_some_and(|m| m.role == Role::Master);

        if was_master && !master {
            commit_leader(&conn, false, None);
        } else if !was_master && master {
            info!(delay = ?BOOT_DELAY, "new master; delaying first campaign for quorum formation");
            tokio::time::sleep(BOOT_DELAY).await;
            // Things may have moved while we slept.
            minion = conn.minion_self();
            master = minion.as_ref().is_some_and(|m| m.role == Role::Master);
        }
        was_master = master;

        if !master {
            continue;
        }
        let ip = minion.map(|m| m.private_ip).unwrap_or_default();
        if ip.is_empty() {
            continue;
        }

        let currently_leader = conn.etcd_leader();
        let result = if currently_leader {
            store.update(LEADER_KEY, &ip, Some(ELECTION_TTL)).await
        } else {
            store.create(LEADER_KEY, &ip, Some(ELECTION_TTL)).await
        };

        match result {
            Ok(()) => commit_leader(&conn, true, Some(&ip)),
            Err(StoreError::KeyExists) => commit_leader(&conn, false, None),
            Err(err) => {
                warn!(%err, "failed to write the leader key");
                commit_leader(&conn, false, None);
                // Give the quorum a chance to settle down.
                tokio::time::sleep(ELECTION_TTL).await;
            }
        }
    }
}

/// Mirror the current leader's IP into the Etcd row.
pub async fn watch_leader(conn: Conn, store: Arc<dyn Store>) {
    let mut trigger = conn.trigger_tick(ELECTION_TTL.as_secs(), &[Table::Minion]);
    let mut watch = store.watch(LEADER_KEY, Duration::from_secs(1));

    loop {
        let leader_ip = match store.get(LEADER_KEY).await {
            Ok(ip) => ip,
            Err(StoreError::NotFound) => String::new(),
            Err(err) => {
                warn!(%err, "failed to read the leader key");
                String::new()
            }
        };

        conn.txn(&[Table::Etcd])
            .run(|view| {
                let mut etcd = view.etcd().unwrap_or_else(|| view.insert::<Etcd>());
                etcd.leader_ip = leader_ip.clone();
                view.commit(etcd);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        select! {
            msg = trigger.c.recv() => if msg.is_none() { return },
            msg = watch.recv() => if msg.is_none() { return },
        }
    }
}

fn commit_leader(conn: &Conn, leader: bool, ip: Option<&str>) {
    conn.txn(&[Table::Etcd])
        .run(|view| {
            let mut etcd = view.etcd().unwrap_or_else(|| view.insert::<Etcd>());
            etcd.leader = leader;
            if let Some(ip) = ip {
                etcd.leader_ip = ip.to_string();
            }
            view.commit(etcd);
            Ok::<_, Infallible>(())
        })
        .unwrap_or_else(|e| match e {});
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;
    use loom_db::Minion;

    fn master_conn(ip: &str) -> Conn {
        let conn = Conn::new();
        conn.txn(&[Table::Minion])
            .run(|view| {
                let mut m: Minion = view.insert();
                m.is_self = true;
                m.role = Role::Master;
                m.private_ip = ip.to_string();
                view.commit(m);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});
        conn
    }

    // These run under a paused clock; sleeping in the test lets the runtime
    // auto-advance through the campaign's boot delay and refresh timers in
    // deadline order, deterministically.

    #[tokio::test(start_paused = true)]
    async fn first_master_wins_and_refreshes() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let conn = master_conn("10.0.0.1");

        let campaign_conn = conn.clone();
        let campaign_store = store.clone();
        tokio::spawn(async move { campaign(campaign_conn, campaign_store).await });

        // Boot delay plus one campaign round.
        tokio::time::sleep(BOOT_DELAY + Duration::from_secs(2)).await;

        assert_eq!(store.get(LEADER_KEY).await.unwrap(), "10.0.0.1");
        assert!(conn.etcd_leader());

        // Well past the original TTL, the refresh keeps the key alive.
        tokio::time::sleep(ELECTION_TTL * 2).await;
        assert_eq!(store.get(LEADER_KEY).await.unwrap(), "10.0.0.1");
        assert!(conn.etcd_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn second_master_loses_and_records_it() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        // A holder that keeps its lease refreshed, as a live leader would.
        store.create(LEADER_KEY, "10.0.0.1", None).await.unwrap();

        let conn = master_conn("10.0.0.2");
        let campaign_conn = conn.clone();
        let campaign_store = store.clone();
        tokio::spawn(async move { campaign(campaign_conn, campaign_store).await });

        tokio::time::sleep(BOOT_DELAY + Duration::from_secs(2)).await;

        assert_eq!(store.get(LEADER_KEY).await.unwrap(), "10.0.0.1");
        assert!(!conn.etcd_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_mirrors_leader_ip() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        store.create(LEADER_KEY, "10.0.0.9", None).await.unwrap();

        let conn = Conn::new();
        let watch_conn = conn.clone();
        let watch_store = store.clone();
        tokio::spawn(async move { watch_leader(watch_conn, watch_store).await });

        tokio::time::sleep(Duration::from_secs(2)).await;

        let etcd = conn.all::<Etcd>();
        assert_eq!(etcd.len(), 1);
        assert_eq!(etcd[0].leader_ip, "10.0.0.9");
    }

    #[tokio::test(start_paused = true)]
    async fn worker_never_campaigns() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let conn = Conn::new();
        conn.txn(&[Table::Minion])
            .run(|view| {
                let mut m: Minion = view.insert();
                m.is_self = true;
                m.role = Role::Worker;
                m.private_ip = "10.0.0.3".to_string();
                view.commit(m);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        let campaign_store = store.clone();
        tokio::spawn(async move { campaign(conn, campaign_store).await });

        tokio::time::sleep(BOOT_DELAY + ELECTION_TTL).await;
        assert!(matches!(store.get(LEADER_KEY).await, Err(StoreError::NotFound)));
    }
}
