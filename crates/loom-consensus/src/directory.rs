//! Replicated container and label directories.
//!
//! The consensus store holds the authoritative record of which container
//! owns which IP and which labels it carries:
//!
//! ```text
//! /minion/containers/<stitch-id>/IP       dotted address in 10.0/16
//! /minion/containers/<stitch-id>/Labels   JSON array of label names
//! /minion/labels/<name>/IP                dotted address in 10.1/16
//! /minion/labels/<name>/MultiHost         "true" | "false"
//! ```
//!
//! The policy leader writes both directories from its database, allocating
//! addresses for newcomers; every minion reads them back, which is how
//! workers learn the IPs and labels of the containers scheduled onto them.

use std::collections::{BTreeMap, HashSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, warn};

use loom_db::{Conn, Container, Label, Role, Table, View};
use loom_join::hash_join;

use crate::ipdef;
use crate::{Store, StoreResult, Tree};

pub const CONTAINER_DIR: &str = "/minion/containers";
pub const LABEL_DIR: &str = "/minion/labels";

const WATCH_RATE_LIMIT: Duration = Duration::from_secs(10);
const SETTLE_DELAY: Duration = Duration::from_secs(30);

/// The first two levels of a directory subtree: id -> child key -> value.
pub type Directory = BTreeMap<String, BTreeMap<String, String>>;

/// Flatten a [`Tree`] into a [`Directory`].
pub fn tree_to_directory(tree: &Tree) -> Directory {
    tree.children
        .iter()
        .map(|(id, node)| {
            let children = node
                .children
                .iter()
                .map(|(k, child)| (k.clone(), child.value.clone()))
                .collect();
            (id.clone(), children)
        })
        .collect()
}

async fn get_directory(store: &dyn Store, path: &str) -> StoreResult<Directory> {
    Ok(tree_to_directory(&store.get_tree(path).await?))
}

/// Collapse directory watches and table triggers into one coalesced wake
/// channel.
fn wake_chan(conn: &Conn, store: &dyn Store) -> mpsc::Receiver<()> {
    let mut label_watch = store.watch(LABEL_DIR, WATCH_RATE_LIMIT);
    let mut container_watch = store.watch(CONTAINER_DIR, WATCH_RATE_LIMIT);
    let mut trigger = conn.trigger_tick(
        30,
        &[Table::Minion, Table::Container, Table::Label, Table::Etcd],
    );

    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = label_watch.recv() => if msg.is_none() { return },
                msg = container_watch.recv() => if msg.is_none() { return },
                msg = trigger.c.recv() => if msg.is_none() { return },
            }
            if tx.try_send(()).is_err() && tx.is_closed() {
                return;
            }
        }
    });
    rx
}

/// Mirror the directories into the local database, forever.
pub async fn run_read(conn: Conn, store: Arc<dyn Store>) {
    let mut wake = wake_chan(&conn, store.as_ref());

    // Wait for a leader before reading; on a fresh cluster the directories
    // don't exist yet and reads just spray errors.
    while wake.recv().await.is_some() {
        let has_leader = conn
            .all::<loom_db::Etcd>()
            .first()
            .is_some_and(|e| !e.leader_ip.is_empty());
        if has_leader {
            tokio::time::sleep(SETTLE_DELAY).await;
            break;
        }
    }

    while wake.recv().await.is_some() {
        let containers = match get_directory(store.as_ref(), CONTAINER_DIR).await {
            Ok(dir) => dir,
            Err(err) => {
                warn!(%err, "failed to read the container directory");
                continue;
            }
        };
        let labels = match get_directory(store.as_ref(), LABEL_DIR).await {
            Ok(dir) => dir,
            Err(err) => {
                warn!(%err, "failed to read the label directory");
                continue;
            }
        };

        conn.txn(&[Table::Minion, Table::Container, Table::Label])
            .run(|view| {
                let worker =
                    view.minion_self().is_some_and(|m| m.role == Role::Worker);
                read_containers_txn(view, &containers, worker);
                read_labels_txn(view, &labels);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});
    }
}

/// Fill container rows with their replicated IP, MAC, and (on workers)
/// label set.
pub fn read_containers_txn(view: &mut View, dir: &Directory, worker: bool) {
    for mut container in view.all::<Container>() {
        container.ip = String::new();
        container.mac = String::new();
        let mut labels: Vec<String> = Vec::new();

        if let Some(children) = dir.get(&container.stitch_id) {
            if let Some(ip) = children.get("IP") {
                container.ip = ip.clone();
                container.mac = ipdef::mac_from_ip(ip);
            }
            if let Some(raw) = children.get("Labels") {
                labels = serde_json::from_str(raw).unwrap_or_default();
            }
        }

        // Masters take label membership from the policy; workers from the
        // directory.
        if worker {
            container.labels = labels;
        }
        view.commit(container);
    }
}

/// Sync Label rows to the label directory and recompute each label's
/// fan-out set from the local container rows.
pub fn read_labels_txn(view: &mut View, dir: &Directory) {
    let names: Vec<String> = dir.keys().cloned().collect();
    let (mut pairs, stale, missing) =
        hash_join(view.all::<Label>(), names, |l| l.name.clone(), |n| n.clone());

    for label in stale {
        view.remove(&label);
    }
    for name in missing {
        let mut row: Label = view.insert();
        row.name = name.clone();
        pairs.push(loom_join::Pair { l: row, r: name });
    }

    let containers = view.all::<Container>();
    for pair in pairs {
        let mut label = pair.l;
        let children = dir.get(&pair.r);
        label.ip = children
            .and_then(|c| c.get("IP"))
            .cloned()
            .unwrap_or_default();
        label.multi_host = children
            .and_then(|c| c.get("MultiHost"))
            .is_some_and(|v| v == "true");
        label.container_ips = containers
            .iter()
            .filter(|c| !c.ip.is_empty() && c.labels.contains(&label.name))
            .map(|c| c.ip.clone())
            .collect();
        view.commit(label);
    }
}

/// Publish the database into the directories, forever. Only acts while this
/// process holds the leadership.
pub async fn run_write(conn: Conn, store: Arc<dyn Store>) {
    let mut wake = wake_chan(&conn, store.as_ref());
    while wake.recv().await.is_some() {
        if !conn.etcd_leader() {
            continue;
        }
        let containers = conn.all::<Container>();
        if let Err(err) = write_containers(store.as_ref(), &containers).await {
            warn!(%err, "failed to publish the container directory");
        }
        if let Err(err) = write_labels(store.as_ref(), &containers).await {
            warn!(%err, "failed to publish the label directory");
        }
    }
}

/// One write pass over `/minion/containers`.
pub async fn write_containers(store: &dyn Store, containers: &[Container]) -> StoreResult<()> {
    let ids: Vec<String> = containers
        .iter()
        .filter(|c| !c.stitch_id.is_empty())
        .map(|c| c.stitch_id.clone())
        .collect();

    let _ = store.mkdir(CONTAINER_DIR).await;
    let mut dir = get_directory(store, CONTAINER_DIR).await?;

    sync_dir(store, &mut dir, CONTAINER_DIR, &ids).await;
    sync_ips(store, &mut dir, CONTAINER_DIR, ipdef::CONTAINER_PREFIX).await;
    sync_container_labels(store, &mut dir, containers).await;
    Ok(())
}

/// One write pass over `/minion/labels`.
pub async fn write_labels(store: &dyn Store, containers: &[Container]) -> StoreResult<()> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for container in containers {
        for label in &container.labels {
            *counts.entry(label.as_str()).or_default() += 1;
        }
    }
    let names: Vec<String> = counts.keys().map(|n| n.to_string()).collect();

    let _ = store.mkdir(LABEL_DIR).await;
    let mut dir = get_directory(store, LABEL_DIR).await?;

    sync_dir(store, &mut dir, LABEL_DIR, &names).await;
    sync_ips(store, &mut dir, LABEL_DIR, ipdef::LABEL_PREFIX).await;

    for (name, count) in counts {
        let multi_host = if count > 1 { "true" } else { "false" };
        if dir.get(name).and_then(|c| c.get("MultiHost")).map(String::as_str)
            == Some(multi_host)
        {
            continue;
        }
        let path = format!("{LABEL_DIR}/{name}/MultiHost");
        if let Err(err) = store.set(&path, multi_host).await {
            error!(%err, %path, "failed to set multi-host flag");
        }
    }
    Ok(())
}

/// Make the directory's entry set exactly `ids`.
async fn sync_dir(store: &dyn Store, dir: &mut Directory, path: &str, ids: &[String]) {
    let current: Vec<String> = dir.keys().cloned().collect();
    let (_, stale, missing) =
        hash_join(current, ids.to_vec(), |c| c.clone(), |i| i.clone());

    for id in stale {
        let key = format!("{path}/{id}");
        if let Err(err) = store.delete(&key).await {
            error!(%err, %key, "failed to delete directory entry");
        }
        dir.remove(&id);
    }

    for id in missing {
        if dir.contains_key(&id) {
            continue;
        }
        let key = format!("{path}/{id}");
        if let Err(err) = store.mkdir(&key).await {
            error!(%err, %key, "failed to create directory entry");
            continue;
        }
        dir.insert(id, BTreeMap::new());
    }
}

/// Give every entry lacking one an address from the pool.
async fn sync_ips(store: &dyn Store, dir: &mut Directory, path: &str, prefix: u32) {
    let mut taken: HashSet<u32> = HashSet::new();
    // The gateway's address must never be handed out.
    taken.insert(ipdef::parse_pool_ip(ipdef::GATEWAY_IP, prefix, ipdef::POOL_MASK));

    let mut unassigned = Vec::new();
    for (id, children) in dir.iter() {
        let ip = children
            .get("IP")
            .map(|s| ipdef::parse_pool_ip(s, prefix, ipdef::POOL_MASK))
            .unwrap_or(0);
        if ip != 0 {
            taken.insert(ip);
        } else {
            unassigned.push(id.clone());
        }
    }

    let mut rng = rand::random::<u32>;
    for id in unassigned {
        let ip32 = ipdef::random_pool_ip(&taken, prefix, ipdef::POOL_MASK, &mut rng);
        let key = format!("{path}/{id}/IP");
        if ip32 == 0 {
            error!(%id, "address pool exhausted");
            let _ = store.delete(&key).await;
            dir.entry(id).or_default().remove("IP");
            continue;
        }

        let ip = ipdef::format_ip(ip32);
        if let Err(err) = store.set(&key, &ip).await {
            error!(%err, %key, "failed to assign address");
            continue;
        }
        dir.entry(id).or_default().insert("IP".to_string(), ip);
        taken.insert(ip32);
    }
}

/// Keep each container entry's Labels child current.
async fn sync_container_labels(store: &dyn Store, dir: &mut Directory, containers: &[Container]) {
    let mut by_id: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for container in containers {
        if !container.stitch_id.is_empty() {
            let mut labels = container.labels.clone();
            labels.sort();
            by_id.insert(container.stitch_id.as_str(), labels);
        }
    }

    for (id, children) in dir.iter_mut() {
        let Some(labels) = by_id.get(id.as_str()) else {
            // An entry sync_dir just created for a container we were handed;
            // absence here means the two views raced, caught next pass.
            continue;
        };
        let encoded =
            serde_json::to_string(labels).unwrap_or_else(|_| "[]".to_string());
        if children.get("Labels") == Some(&encoded) {
            continue;
        }
        let key = format!("{CONTAINER_DIR}/{id}/Labels");
        if let Err(err) = store.set(&key, &encoded).await {
            error!(%err, %key, "failed to set labels");
            continue;
        }
        children.insert("Labels".to_string(), encoded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;

    fn container(stitch_id: &str, labels: &[&str]) -> Container {
        Container {
            stitch_id: stitch_id.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn write_allocates_container_ips_and_labels() {
        let store = MemStore::new();
        let containers = vec![container("c1", &["web"]), container("c2", &["web", "db"])];

        write_containers(&store, &containers).await.unwrap();
        let dir = get_directory(&store, CONTAINER_DIR).await.unwrap();

        assert_eq!(dir.len(), 2);
        for children in dir.values() {
            let ip = children.get("IP").expect("assigned IP");
            assert_ne!(
                ipdef::parse_pool_ip(ip, ipdef::CONTAINER_PREFIX, ipdef::POOL_MASK),
                0
            );
        }
        assert_eq!(dir["c1"]["Labels"], r#"["web"]"#);
        assert_eq!(dir["c2"]["Labels"], r#"["db","web"]"#);
    }

    #[tokio::test]
    async fn write_is_stable_across_passes() {
        let store = MemStore::new();
        let containers = vec![container("c1", &["web"])];

        write_containers(&store, &containers).await.unwrap();
        let first = get_directory(&store, CONTAINER_DIR).await.unwrap();
        write_containers(&store, &containers).await.unwrap();
        let second = get_directory(&store, CONTAINER_DIR).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn write_drops_departed_containers() {
        let store = MemStore::new();
        write_containers(&store, &[container("c1", &[]), container("c2", &[])])
            .await
            .unwrap();
        write_containers(&store, &[container("c1", &[])]).await.unwrap();

        let dir = get_directory(&store, CONTAINER_DIR).await.unwrap();
        assert_eq!(dir.len(), 1);
        assert!(dir.contains_key("c1"));
    }

    #[tokio::test]
    async fn labels_get_pool_addresses_and_multi_host() {
        let store = MemStore::new();
        let containers = vec![
            container("c1", &["web"]),
            container("c2", &["web"]),
            container("c3", &["db"]),
        ];
        write_labels(&store, &containers).await.unwrap();

        let dir = get_directory(&store, LABEL_DIR).await.unwrap();
        assert_eq!(dir.len(), 2);
        assert_eq!(dir["web"]["MultiHost"], "true");
        assert_eq!(dir["db"]["MultiHost"], "false");
        assert_ne!(
            ipdef::parse_pool_ip(&dir["web"]["IP"], ipdef::LABEL_PREFIX, ipdef::POOL_MASK),
            0
        );
    }

    #[tokio::test]
    async fn read_fills_container_rows() {
        let store = MemStore::new();
        store.set("/minion/containers/c1/IP", "10.0.0.2").await.unwrap();
        store
            .set("/minion/containers/c1/Labels", r#"["web"]"#)
            .await
            .unwrap();
        let dir = get_directory(&store, CONTAINER_DIR).await.unwrap();

        let conn = Conn::new();
        conn.txn(&[Table::Container, Table::Label])
            .run(|view| {
                let mut c: Container = view.insert();
                c.stitch_id = "c1".to_string();
                view.commit(c);
                read_containers_txn(view, &dir, true);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        let c = conn.all::<Container>().remove(0);
        assert_eq!(c.ip, "10.0.0.2");
        assert_eq!(c.mac, "02:00:0a:00:00:02");
        assert_eq!(c.labels, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn read_master_keeps_policy_labels() {
        let store = MemStore::new();
        store.set("/minion/containers/c1/IP", "10.0.0.2").await.unwrap();
        store
            .set("/minion/containers/c1/Labels", r#"["directory"]"#)
            .await
            .unwrap();
        let dir = get_directory(&store, CONTAINER_DIR).await.unwrap();

        let conn = Conn::new();
        conn.txn(&[Table::Container])
            .run(|view| {
                let mut c: Container = view.insert();
                c.stitch_id = "c1".to_string();
                c.labels = vec!["policy".to_string()];
                view.commit(c);
                read_containers_txn(view, &dir, false);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        assert_eq!(conn.all::<Container>()[0].labels, vec!["policy".to_string()]);
    }

    #[tokio::test]
    async fn read_syncs_label_rows() {
        let store = MemStore::new();
        store.set("/minion/labels/web/IP", "10.1.0.2").await.unwrap();
        store.set("/minion/labels/web/MultiHost", "true").await.unwrap();
        let dir = get_directory(&store, LABEL_DIR).await.unwrap();

        let conn = Conn::new();
        conn.txn(&[Table::Container, Table::Label])
            .run(|view| {
                let mut c: Container = view.insert();
                c.stitch_id = "c1".to_string();
                c.ip = "10.0.0.2".to_string();
                c.labels = vec!["web".to_string()];
                view.commit(c);

                let mut gone: Label = view.insert();
                gone.name = "stale".to_string();
                view.commit(gone);

                read_labels_txn(view, &dir);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        let labels = conn.all::<Label>();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].name, "web");
        assert_eq!(labels[0].ip, "10.1.0.2");
        assert!(labels[0].multi_host);
        assert_eq!(labels[0].container_ips, vec!["10.0.0.2".to_string()]);
    }
}
