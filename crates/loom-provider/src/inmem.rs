//! An in-memory cloud.
//!
//! Behaves like a well-behaved provider: booted machines show up in `list`
//! with cloud IDs and addresses, `stop` is idempotent, `set_acls` replaces
//! the firewall state wholesale. Used by the cluster-loop tests and by the
//! daemon's dev mode.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use loom_blueprint::Range;
use loom_db::ProviderKind;

use crate::{acl, sizes, Acl, Machine, Provider, ProviderError};

#[derive(Default, Debug)]
struct CloudState {
    machines: Vec<Machine>,
    acls: Vec<Acl>,
}

#[derive(Debug)]
pub struct InMemProvider {
    kind: ProviderKind,
    namespace: String,
    next_id: AtomicU64,
    state: Mutex<CloudState>,
}

impl InMemProvider {
    pub fn new(kind: ProviderKind, namespace: &str) -> InMemProvider {
        InMemProvider {
            kind,
            namespace: namespace.to_string(),
            next_id: AtomicU64::new(1),
            state: Mutex::new(CloudState::default()),
        }
    }

    /// The firewall state as the cloud currently holds it.
    pub fn acls(&self) -> Vec<Acl> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).acls.clone()
    }

    /// Pre-populate the cloud with a machine, as if booted out of band.
    pub fn seed(&self, machine: Machine) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).machines.push(machine);
    }
}

#[async_trait]
impl Provider for InMemProvider {
    async fn list(&self) -> Result<Vec<Machine>, ProviderError> {
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).machines.clone())
    }

    async fn boot(&self, machines: Vec<Machine>) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for mut m in machines {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            m.id = format!("i-{n}");
            m.public_ip = format!("203.0.113.{n}");
            m.private_ip = format!("10.10.0.{n}");
            m.provider = self.kind;
            debug!(namespace = %self.namespace, id = %m.id, size = %m.size, "booted machine");
            state.machines.push(m);
        }
        Ok(())
    }

    async fn stop(&self, machines: Vec<Machine>) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for m in &machines {
            state.machines.retain(|existing| existing.id != m.id);
        }
        Ok(())
    }

    async fn set_acls(&self, acls: Vec<Acl>) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = acl::expand(&state.acls);
        let (authorize, revoke) = acl::sync(current, &acls);
        debug!(
            namespace = %self.namespace,
            authorize = authorize.len(),
            revoke = revoke.len(),
            "acls synced"
        );
        state.acls = acls;
        Ok(())
    }

    fn choose_size(&self, ram: Range, cpu: Range, max_price: f64) -> String {
        sizes::choose_size(self.kind, ram, cpu, max_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> InMemProvider {
        InMemProvider::new(ProviderKind::Amazon, "test-ns")
    }

    #[tokio::test]
    async fn boot_assigns_ids_and_addresses() {
        let p = provider();
        p.boot(vec![Machine { size: "m4.large".to_string(), ..Default::default() }])
            .await
            .unwrap();

        let machines = p.list().await.unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].id, "i-1");
        assert!(!machines[0].public_ip.is_empty());
        assert!(!machines[0].private_ip.is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let p = provider();
        p.boot(vec![Machine::default()]).await.unwrap();
        let machines = p.list().await.unwrap();

        p.stop(machines.clone()).await.unwrap();
        p.stop(machines).await.unwrap();
        assert!(p.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_acls_replaces_state() {
        let p = provider();
        let first = vec![Acl { cidr_ip: "1.2.3.4/32".to_string(), min_port: 1, max_port: 65535 }];
        p.set_acls(first.clone()).await.unwrap();
        assert_eq!(p.acls(), first);

        let second = vec![Acl { cidr_ip: "5.6.7.8/32".to_string(), min_port: 80, max_port: 80 }];
        p.set_acls(second.clone()).await.unwrap();
        assert_eq!(p.acls(), second);
    }
}
