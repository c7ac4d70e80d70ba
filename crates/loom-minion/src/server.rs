//! The minion config RPC.
//!
//! The foreman reads this minion's current belief with `GetMinionConfig`
//! and assigns role, addresses, spec, and etcd membership with
//! `SetMinionConfig`. Both operate only on the single `is_self` Minion row
//! (plus the Etcd row's member list).

use std::convert::Infallible;
use std::net::SocketAddr;

use tonic::{Request, Response, Status};
use tracing::info;

use loom_db::{Conn, Etcd, Minion, Role, Table};
use loom_proto::minion::minion_server::{Minion as MinionService, MinionServer};
use loom_proto::minion::{GetConfigRequest, MinionConfig, Role as ProtoRole, SetConfigReply};

pub struct ConfigServer {
    conn: Conn,
}

impl ConfigServer {
    pub fn new(conn: Conn) -> ConfigServer {
        ConfigServer { conn }
    }
}

/// Serve the config RPC on `addr` until the process exits.
pub async fn serve(conn: Conn, addr: SocketAddr) -> Result<(), tonic::transport::Error> {
    info!(%addr, "minion config server listening");
    tonic::transport::Server::builder()
        .add_service(MinionServer::new(ConfigServer::new(conn)))
        .serve(addr)
        .await
}

#[tonic::async_trait]
impl MinionService for ConfigServer {
    async fn get_minion_config(
        &self,
        _request: Request<GetConfigRequest>,
    ) -> Result<Response<MinionConfig>, Status> {
        let minion = self.conn.minion_self().unwrap_or_default();
        let etcd_members = self
            .conn
            .all::<Etcd>()
            .into_iter()
            .next()
            .map(|e| e.etcd_ips)
            .unwrap_or_default();

        Ok(Response::new(MinionConfig {
            minion_id: minion.minion_id,
            role: role_to_proto(minion.role) as i32,
            private_ip: minion.private_ip,
            spec: minion.spec,
            provider: minion.provider,
            size: minion.size,
            region: minion.region,
            etcd_members,
        }))
    }

    async fn set_minion_config(
        &self,
        request: Request<MinionConfig>,
    ) -> Result<Response<SetConfigReply>, Status> {
        let config = request.into_inner();
        self.conn
            .txn(&[Table::Minion, Table::Etcd])
            .run(|view| {
                let mut minion = view.minion_self().unwrap_or_else(|| {
                    let mut m: Minion = view.insert();
                    m.is_self = true;
                    m
                });
                minion.minion_id = config.minion_id.clone();
                minion.role = role_from_proto(config.role);
                minion.private_ip = config.private_ip.clone();
                minion.spec = config.spec.clone();
                minion.provider = config.provider.clone();
                minion.size = config.size.clone();
                minion.region = config.region.clone();
                view.commit(minion);

                let mut etcd = view.etcd().unwrap_or_else(|| view.insert::<Etcd>());
                etcd.etcd_ips = config.etcd_members.clone();
                view.commit(etcd);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        Ok(Response::new(SetConfigReply { success: true, error: String::new() }))
    }
}

pub fn role_to_proto(role: Role) -> ProtoRole {
    match role {
        Role::None => ProtoRole::None,
        Role::Worker => ProtoRole::Worker,
        Role::Master => ProtoRole::Master,
    }
}

pub fn role_from_proto(role: i32) -> Role {
    match ProtoRole::try_from(role) {
        Ok(ProtoRole::Worker) => Role::Worker,
        Ok(ProtoRole::Master) => Role::Master,
        _ => Role::None,
    }
}
