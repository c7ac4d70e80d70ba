//! etcd-backed store.
//!
//! Talks the etcd v2 keys API over HTTP on localhost (every minion runs
//! either an etcd member or an etcd proxy, so the local endpoint is always
//! the right one). Values, TTLs, `prevExist`, recursive gets, and long-poll
//! watches map one-to-one onto the [`Store`] trait.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Store, StoreError, StoreResult, Tree};

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";
const OP_TIMEOUT: Duration = Duration::from_secs(5);
const WATCH_TIMEOUT: Duration = Duration::from_secs(60);

// etcd v2 error codes we act on.
const CODE_KEY_NOT_FOUND: u32 = 100;
const CODE_NODE_EXIST: u32 = 105;

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdReply {
    node: Option<EtcdNode>,
    #[serde(rename = "errorCode")]
    error_code: Option<u32>,
    message: Option<String>,
}

pub struct EtcdStore {
    endpoint: String,
    client: reqwest::Client,
    watch_client: reqwest::Client,
}

impl Default for EtcdStore {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl EtcdStore {
    pub fn new(endpoint: &str) -> EtcdStore {
        let client = reqwest::Client::builder()
            .timeout(OP_TIMEOUT)
            .build()
            .unwrap_or_default();
        let watch_client = reqwest::Client::builder()
            .timeout(WATCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        EtcdStore { endpoint: endpoint.to_string(), client, watch_client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/keys{}", self.endpoint, path)
    }

    async fn request(&self, req: reqwest::RequestBuilder) -> StoreResult<EtcdReply> {
        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let reply: EtcdReply = resp
            .json()
            .await
            .map_err(|e| StoreError::Api(e.to_string()))?;

        match reply.error_code {
            Some(CODE_NODE_EXIST) => Err(StoreError::KeyExists),
            Some(CODE_KEY_NOT_FOUND) => Err(StoreError::NotFound),
            Some(code) => Err(StoreError::Api(format!(
                "etcd error {code}: {}",
                reply.message.unwrap_or_default()
            ))),
            None => Ok(reply),
        }
    }

    async fn put(&self, path: &str, form: &[(&str, String)]) -> StoreResult<()> {
        self.request(self.client.put(self.url(path)).form(form)).await?;
        Ok(())
    }
}

fn ttl_secs(ttl: Option<Duration>) -> Option<(&'static str, String)> {
    ttl.map(|t| ("ttl", t.as_secs().to_string()))
}

fn node_to_tree(node: &EtcdNode) -> Tree {
    let key = node
        .key
        .as_deref()
        .and_then(|k| k.rsplit('/').next())
        .unwrap_or_default()
        .to_string();
    let mut children = BTreeMap::new();
    for child in &node.nodes {
        let tree = node_to_tree(child);
        children.insert(tree.key.clone(), tree);
    }
    Tree { key, value: node.value.clone().unwrap_or_default(), children }
}

#[async_trait::async_trait]
impl Store for EtcdStore {
    async fn mkdir(&self, dir: &str) -> StoreResult<()> {
        self.put(dir, &[("dir", "true".to_string()), ("prevExist", "false".to_string())])
            .await
    }

    async fn get_tree(&self, dir: &str) -> StoreResult<Tree> {
        let reply = self
            .request(self.client.get(self.url(dir)).query(&[
                ("recursive", "true"),
                ("quorum", "true"),
            ]))
            .await?;
        let node = reply.node.ok_or_else(|| StoreError::Api("reply without node".into()))?;
        Ok(node_to_tree(&node))
    }

    async fn get(&self, path: &str) -> StoreResult<String> {
        let reply = self
            .request(self.client.get(self.url(path)).query(&[("quorum", "true")]))
            .await?;
        Ok(reply.node.and_then(|n| n.value).unwrap_or_default())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.request(
            self.client
                .delete(self.url(path))
                .query(&[("recursive", "true")]),
        )
        .await?;
        Ok(())
    }

    async fn create(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut form = vec![
            ("value", value.to_string()),
            ("prevExist", "false".to_string()),
        ];
        form.extend(ttl_secs(ttl));
        self.put(path, &form).await
    }

    async fn update(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut form = vec![
            ("value", value.to_string()),
            ("prevExist", "true".to_string()),
        ];
        form.extend(ttl_secs(ttl));
        self.put(path, &form).await
    }

    async fn set(&self, path: &str, value: &str) -> StoreResult<()> {
        self.put(path, &[("value", value.to_string())]).await
    }

    fn watch(&self, prefix: &str, rate_limit: Duration) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let client = self.watch_client.clone();
        let url = self.url(prefix);
        tokio::spawn(async move {
            // Startup tick.
            if tx.send(()).await.is_err() {
                return;
            }
            loop {
                let poll = client
                    .get(&url)
                    .query(&[("wait", "true"), ("recursive", "true")])
                    .send()
                    .await;
                match poll {
                    Ok(resp) => {
                        // Drain the body; the tick is the only payload we need.
                        let _ = resp.bytes().await;
                        if tx.try_send(()).is_err() && tx.is_closed() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(%err, "etcd watch poll failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(rate_limit).await;
            }
        });
        rx
    }
}
