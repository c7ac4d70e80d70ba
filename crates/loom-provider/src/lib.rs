//! The cloud-provider abstraction.
//!
//! Every cloud binding implements the same five operations; the cluster loop
//! is oblivious to which clouds are in play. Bindings must scope `list` and
//! `set_acls` to the deployment namespace (via instance tags, descriptions,
//! or security-group names) so several deployments coexist in one account.
//!
//! The real SDK-backed bindings are linked in by the embedding binary and
//! registered with a [`Registry`]; this crate ships the interface, the size
//! tables, the security-group diff logic, and an in-memory cloud used by
//! tests and dev mode.

pub mod acl;
pub mod inmem;
pub mod sizes;

use async_trait::async_trait;
use thiserror::Error;

use loom_blueprint::Range;
use loom_db::ProviderKind;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {0} is unavailable: {1}")]
    Unavailable(ProviderKind, String),

    #[error("cloud API error: {0}")]
    Api(String),
}

/// A machine as the cloud reports it (or as we ask the cloud for it).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Machine {
    /// Cloud-side identifier; empty until booted.
    pub id: String,
    pub public_ip: String,
    pub private_ip: String,
    pub size: String,
    pub disk_size: u32,
    pub ssh_keys: Vec<String>,
    pub provider: ProviderKind,
    pub region: String,
}

/// Allowed ingress to the deployment's machines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Acl {
    pub cidr_ip: String,
    pub min_port: u16,
    pub max_port: u16,
}

/// The four-operation cloud interface, plus size selection.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Enumerate this namespace's machines, filling `id`, `public_ip`,
    /// `private_ip`, `size`, `region`, and `provider`.
    async fn list(&self) -> Result<Vec<Machine>, ProviderError>;

    /// Request the given machines. May return before they are reachable,
    /// but a subsequent `list` must report them in the same region.
    async fn boot(&self, machines: Vec<Machine>) -> Result<(), ProviderError>;

    /// Terminate. Idempotent on already-gone IDs.
    async fn stop(&self, machines: Vec<Machine>) -> Result<(), ProviderError>;

    /// Make the cloud-side firewall state exactly equal to `acls`: add
    /// what's missing, revoke what's extra, leave the rest untouched.
    async fn set_acls(&self, acls: Vec<Acl>) -> Result<(), ProviderError>;

    /// Best-fit cheapest size meeting the constraints; empty if none.
    fn choose_size(&self, _ram: Range, _cpu: Range, _max_price: f64) -> String {
        String::new()
    }
}

/// Constructor for one cloud binding, keyed by namespace.
pub type Constructor =
    Box<dyn Fn(&str) -> Result<Box<dyn Provider>, ProviderError> + Send + Sync>;

/// The set of cloud bindings available to this process.
#[derive(Default)]
pub struct Registry {
    constructors: std::collections::HashMap<ProviderKind, Constructor>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register(&mut self, kind: ProviderKind, constructor: Constructor) {
        self.constructors.insert(kind, constructor);
    }

    /// Instantiate the binding for `kind`, scoped to `namespace`.
    pub fn connect(
        &self,
        kind: ProviderKind,
        namespace: &str,
    ) -> Result<Box<dyn Provider>, ProviderError> {
        match self.constructors.get(&kind) {
            Some(constructor) => constructor(namespace),
            None => Err(ProviderError::Unavailable(
                kind,
                "no binding registered".to_string(),
            )),
        }
    }

    /// Kinds with a registered binding.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.constructors.keys().copied().collect();
        kinds.sort_by_key(|k| format!("{k}"));
        kinds
    }
}

/// The region machines land in when the blueprint doesn't care.
pub fn default_region(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Amazon => "us-west-1",
        ProviderKind::Google => "us-east1-b",
        ProviderKind::Vagrant => "",
    }
}

/// Group machines by their provider.
pub fn group_by(
    machines: Vec<Machine>,
) -> std::collections::HashMap<ProviderKind, Vec<Machine>> {
    let mut grouped: std::collections::HashMap<ProviderKind, Vec<Machine>> =
        std::collections::HashMap::new();
    for m in machines {
        grouped.entry(m.provider).or_default().push(m);
    }
    grouped
}
