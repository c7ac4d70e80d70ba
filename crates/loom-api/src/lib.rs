//! The control API.
//!
//! Two unary RPCs: `Query` returns a table's rows as JSON, `Deploy`
//! validates a blueprint and replaces the Cluster row's spec. Constraint
//! violations (unknown table, malformed blueprint, machine cap) come back
//! as error statuses; reconciliation failures never surface here — the
//! user sees them as desired state not converging.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;

use tonic::{Request, Response, Status};
use tracing::info;

use loom_blueprint::Blueprint;
use loom_db::{
    Acl, Cluster, Connection, Container, Etcd, Label, Machine, Minion, Placement, Row, Table,
};
use loom_proto::api::api_server::{Api, ApiServer};
use loom_proto::api::{DeployReply, DeployRequest, QueryReply, QueryRequest};

pub struct ControlServer {
    conn: loom_db::Conn,
}

impl ControlServer {
    pub fn new(conn: loom_db::Conn) -> ControlServer {
        ControlServer { conn }
    }
}

/// Serve the control API on `addr` until the process exits.
pub async fn serve(
    conn: loom_db::Conn,
    addr: SocketAddr,
) -> Result<(), tonic::transport::Error> {
    info!(%addr, "control API listening");
    tonic::transport::Server::builder()
        .add_service(ApiServer::new(ControlServer::new(conn)))
        .serve(addr)
        .await
}

fn rows_json<R: Row>(conn: &loom_db::Conn) -> Result<String, Status> {
    serde_json::to_string(&conn.all::<R>())
        .map_err(|e| Status::internal(format!("failed to encode rows: {e}")))
}

#[tonic::async_trait]
impl Api for ControlServer {
    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<QueryReply>, Status> {
        let name = request.into_inner().table;
        let table = Table::from_str(&name)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let rows = match table {
            Table::Cluster => rows_json::<Cluster>(&self.conn)?,
            Table::Machine => rows_json::<Machine>(&self.conn)?,
            Table::Acl => rows_json::<Acl>(&self.conn)?,
            Table::Container => rows_json::<Container>(&self.conn)?,
            Table::Connection => rows_json::<Connection>(&self.conn)?,
            Table::Label => rows_json::<Label>(&self.conn)?,
            Table::Placement => rows_json::<Placement>(&self.conn)?,
            Table::Etcd => rows_json::<Etcd>(&self.conn)?,
            Table::Minion => rows_json::<Minion>(&self.conn)?,
        };

        Ok(Response::new(QueryReply { rows }))
    }

    async fn deploy(
        &self,
        request: Request<DeployRequest>,
    ) -> Result<Response<DeployReply>, Status> {
        let blueprint = Blueprint::from_json(&request.into_inner().blueprint)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        self.conn
            .txn(&[Table::Cluster])
            .run(|view| {
                loom_engine::commit_blueprint(view, &blueprint);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        info!(
            namespace = %blueprint.namespace,
            machines = blueprint.machines.len(),
            containers = blueprint.containers.len(),
            "blueprint deployed"
        );
        Ok(Response::new(DeployReply {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_blueprint::{BlueprintConnection, BlueprintMachine, MAX_MACHINES};

    fn blueprint_json() -> String {
        Blueprint {
            namespace: "test".to_string(),
            machines: vec![BlueprintMachine {
                provider: "Amazon".to_string(),
                size: "m4.large".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
        .to_json()
    }

    #[tokio::test]
    async fn deploy_stores_the_blueprint() {
        let conn = loom_db::Conn::new();
        let server = ControlServer::new(conn.clone());

        server
            .deploy(Request::new(DeployRequest { blueprint: blueprint_json() }))
            .await
            .unwrap();

        let cluster = conn.all::<Cluster>().remove(0);
        assert_eq!(cluster.namespace, "test");
        assert!(cluster.spec.contains("m4.large"));
    }

    #[tokio::test]
    async fn deploy_replaces_rather_than_duplicates() {
        let conn = loom_db::Conn::new();
        let server = ControlServer::new(conn.clone());
        for _ in 0..2 {
            server
                .deploy(Request::new(DeployRequest { blueprint: blueprint_json() }))
                .await
                .unwrap();
        }
        assert_eq!(conn.all::<Cluster>().len(), 1);
    }

    #[tokio::test]
    async fn deploy_rejects_malformed_blueprints() {
        let server = ControlServer::new(loom_db::Conn::new());
        let status = server
            .deploy(Request::new(DeployRequest { blueprint: "{nope".to_string() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn deploy_enforces_the_machine_cap() {
        let server = ControlServer::new(loom_db::Conn::new());
        let blueprint = Blueprint {
            machines: vec![
                BlueprintMachine { provider: "Amazon".to_string(), ..Default::default() };
                MAX_MACHINES + 1
            ],
            ..Default::default()
        };
        let status = server
            .deploy(Request::new(DeployRequest { blueprint: blueprint.to_json() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("maximum"));
    }

    #[tokio::test]
    async fn deploy_rejects_bad_port_ranges() {
        let server = ControlServer::new(loom_db::Conn::new());
        let blueprint = Blueprint {
            connections: vec![BlueprintConnection {
                from: "public".to_string(),
                to: "public".to_string(),
                min_port: 100,
                max_port: 1,
            }],
            ..Default::default()
        };
        let status = server
            .deploy(Request::new(DeployRequest { blueprint: blueprint.to_json() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn query_returns_rows_as_json() {
        let conn = loom_db::Conn::new();
        conn.txn(&[Table::Machine])
            .run(|view| {
                let mut m: Machine = view.insert();
                m.size = "m4.large".to_string();
                view.commit(m);
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|e| match e {});

        let server = ControlServer::new(conn);
        let reply = server
            .query(Request::new(QueryRequest { table: "machine".to_string() }))
            .await
            .unwrap()
            .into_inner();

        let rows: serde_json::Value = serde_json::from_str(&reply.rows).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["size"], "m4.large");
    }

    #[tokio::test]
    async fn query_unknown_table_is_invalid() {
        let server = ControlServer::new(loom_db::Conn::new());
        let status = server
            .query(Request::new(QueryRequest { table: "nonsense".to_string() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
