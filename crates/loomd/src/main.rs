//! loomd — the loom daemon.
//!
//! One binary, two modes:
//!
//! - **master** — the controller: control API, policy engine, cloud
//!   reconciliation, and the foreman driving each minion.
//! - **minion** — the per-VM agent: config RPC, system-container
//!   supervisor, leader election, container scheduler, and the network
//!   worker.
//!
//! # Usage
//!
//! ```text
//! loomd master --listen 0.0.0.0:9000 --my-ip 198.51.100.1
//! loomd master --dev          # in-memory cloud, for local hacking
//! loomd minion --private-ip 10.0.0.5
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use loom_db::{Conn, ProviderKind};
use loom_provider::inmem::InMemProvider;
use loom_provider::{Provider, Registry};

#[derive(Parser)]
#[command(name = "loomd", about = "loom daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the cluster controller.
    Master {
        /// Control API listen address.
        #[arg(long, default_value = "0.0.0.0:9000")]
        listen: SocketAddr,

        /// This controller's public IP, kept reachable through cloud ACLs.
        #[arg(long, default_value = "127.0.0.1")]
        my_ip: String,

        /// Use an in-memory cloud instead of real providers.
        #[arg(long)]
        dev: bool,
    },

    /// Run the per-VM agent.
    Minion {
        /// Config RPC listen address.
        #[arg(long, default_value = "0.0.0.0:9999")]
        listen: SocketAddr,

        /// This VM's private IP.
        #[arg(long, default_value = "")]
        private_ip: String,

        /// The local etcd endpoint.
        #[arg(long, default_value = "http://127.0.0.1:2379")]
        etcd: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,loomd=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Master { listen, my_ip, dev } => run_master(listen, my_ip, dev).await,
        Command::Minion { listen, private_ip, etcd } => {
            run_minion(listen, private_ip, etcd).await
        }
    }
}

async fn run_master(listen: SocketAddr, my_ip: String, dev: bool) -> anyhow::Result<()> {
    info!(%listen, dev, "loomd starting as master");
    let conn = Conn::new();

    let mut registry = Registry::new();
    if dev {
        for kind in ProviderKind::ALL {
            registry.register(
                kind,
                Box::new(move |namespace| {
                    Ok(Box::new(InMemProvider::new(kind, namespace)) as Box<dyn Provider>)
                }),
            );
        }
    }
    let registry = Arc::new(registry);

    tokio::spawn(loom_engine::run_master(conn.clone()));
    tokio::spawn(loom_cluster::run(conn.clone(), registry, my_ip));

    loom_api::serve(conn, listen).await?;
    Ok(())
}

async fn run_minion(
    listen: SocketAddr,
    private_ip: String,
    etcd: String,
) -> anyhow::Result<()> {
    info!(%listen, %private_ip, "loomd starting as minion");
    let conn = Conn::new();

    let minion_id = format!("minion-{:08x}", rand::random::<u32>());
    loom_engine::set_self(&conn, &minion_id, loom_db::Role::None, &private_ip);

    let docker: Arc<dyn loom_minion::docker::Docker> =
        Arc::new(loom_minion::docker::Cli::local());
    let shell: Arc<dyn loom_minion::network::shell::Shell> =
        Arc::new(loom_minion::network::shell::HostShell);
    let store: Arc<dyn loom_consensus::Store> =
        Arc::new(loom_consensus::EtcdStore::new(&etcd));

    let supervisor = loom_minion::supervisor::Supervisor::new(conn.clone(), docker.clone());
    tokio::spawn(supervisor.run());
    tokio::spawn(loom_engine::run_minion(conn.clone()));
    tokio::spawn(loom_minion::scheduler::run(conn.clone()));
    tokio::spawn(loom_consensus::elector::run(conn.clone(), store.clone()));
    tokio::spawn(loom_consensus::directory::run_read(conn.clone(), store.clone()));
    tokio::spawn(loom_consensus::directory::run_write(conn.clone(), store));
    tokio::spawn(loom_minion::network::run(conn.clone(), docker, shell));

    loom_minion::server::serve(conn, listen).await?;
    Ok(())
}
