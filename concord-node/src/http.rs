//! The node's HTTP surface: the KV API, Raft RPC endpoints, async
//! replication intake, and the topology service API.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hyper::service::make_service_fn;
use hyper::service::service_fn;
use hyper::Body;
use hyper::Method;
use hyper::Request;
use hyper::Response;
use hyper::Server;
use hyper::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tokio::time::timeout;
use tracing::error;
use tracing::info;

use concordkv::config::ReplicaRole;
use concordkv::error::MembershipError;
use concordkv::error::ReadError;
use concordkv::error::WriteError;
use concordkv::multidc::replicator::decode_payload;
use concordkv::multidc::replicator::Replicator;
use concordkv::network::BatchAck;
use concordkv::network::BatchEnvelope;
use concordkv::raft::AppendEntriesRequest;
use concordkv::raft::InstallSnapshotRequest;
use concordkv::raft::RaftNode;
use concordkv::raft::VoteRequest;
use concordkv::raft::WriteRequest;
use concordkv::storage::LogStore;
use concordkv::storage::SnapshotData;
use concordkv::storage::StateMachine;
use concordkv::topology::NodeHealth;
use concordkv::topology::NodeStatus;
use concordkv::topology::TopologyEventType;
use concordkv::topology::TopologyService;
use concordkv::NodeId;
use concordkv::Role;

use crate::net::HttpNetwork;
use crate::store::KvCommand;
use crate::store::MemKv;
use crate::store::MemLog;

/// Everything the HTTP handlers need, shared per node.
pub struct NodeContext {
    pub node_id: NodeId,
    pub raft: RaftNode<HttpNetwork, MemLog, MemKv>,
    pub store: Arc<MemKv>,
    pub log: Arc<MemLog>,
    pub network: Arc<HttpNetwork>,
    pub replicator: Option<Arc<Replicator<HttpNetwork>>>,
    pub topology: Option<Arc<TopologyService>>,
}

#[derive(Deserialize)]
struct SetBody {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct SubscribeBody {
    client_id: String,
    types: Option<Vec<TopologyEventType>>,
    wait_ms: Option<u64>,
}

#[derive(Deserialize)]
struct AddServerBody {
    id: String,
    address: String,
    dc: Option<String>,
}

#[derive(Deserialize)]
struct RemoveServerBody {
    id: String,
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_default()
}

fn ok_json<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_string(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap_or_default(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("encode error: {err}"),
            false,
            None,
        ),
    }
}

fn error_response(
    status: StatusCode,
    reason: &str,
    retryable: bool,
    leader_hint: Option<NodeId>,
) -> Response<Body> {
    json_response(
        status,
        json!({
            "ok": false,
            "reason": reason,
            "retryable": retryable,
            "leader_hint": leader_hint,
        }),
    )
}

fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == name).then(|| v.to_string())
        })
    })
}

async fn read_body<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, &format!("bad body: {err}"), false, None))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, &format!("bad json: {err}"), false, None))
}

fn write_error_response(err: WriteError) -> Response<Body> {
    match err {
        WriteError::ForwardToLeader(hint) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "not_leader", true, hint)
        }
        WriteError::Raft(err) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string(), true, None)
        }
    }
}

/// Serve the node API. Resolves only on server error or shutdown.
pub async fn serve(ctx: Arc<NodeContext>, addr: SocketAddr) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ctx = ctx.clone();
                async move { Ok::<_, Infallible>(handle(req, ctx).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(%addr, "node API listening");
    server.await?;
    Ok(())
}

async fn handle(req: Request<Body>, ctx: Arc<NodeContext>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (method, path.as_str()) {
        (Method::POST, "/api/set") => handle_set(req, &ctx).await,
        (Method::GET, "/api/get") => handle_get(req, &ctx).await,
        (Method::DELETE, "/api/delete") => handle_delete(req, &ctx).await,
        (Method::GET, "/api/keys") => ok_json(&ctx.store.keys().await),
        (Method::GET, "/api/status") => handle_status(&ctx),
        (Method::GET, "/api/metrics") => handle_metrics(&ctx).await,

        (Method::POST, "/raft/vote") => handle_vote(req, &ctx).await,
        (Method::POST, "/raft/append") => handle_append(req, &ctx).await,
        (Method::POST, "/raft/snapshot") => handle_raft_snapshot(req, &ctx).await,

        (Method::POST, "/replication/batch") => handle_replication_batch(req, &ctx).await,
        (Method::POST, "/replication/snapshot") => handle_replication_snapshot(req, &ctx).await,

        (Method::GET, "/api/topology/snapshot") => handle_topology_snapshot(&ctx),
        (Method::GET, "/api/topology/nodes") => handle_topology_nodes(&ctx),
        (Method::GET, "/api/topology/health") => handle_topology_health(&ctx),
        (Method::POST, "/api/topology/subscribe") => handle_topology_subscribe(req, &ctx).await,

        (Method::POST, "/api/cluster/add") => handle_cluster_add(req, &ctx).await,
        (Method::POST, "/api/cluster/remove") => handle_cluster_remove(req, &ctx).await,
        (Method::GET, "/api/cluster/config") => handle_cluster_config(&ctx),

        _ => error_response(StatusCode::NOT_FOUND, "not_found", false, None),
    }
}

async fn handle_set(req: Request<Body>, ctx: &NodeContext) -> Response<Body> {
    let body: SetBody = match read_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let command = KvCommand::Set {
        key: body.key,
        value: body.value,
    };
    match ctx
        .raft
        .client_write(WriteRequest {
            data: command.encode(),
        })
        .await
    {
        Ok(response) => json_response(
            StatusCode::OK,
            json!({"ok": true, "index": response.index}),
        ),
        Err(err) => write_error_response(err),
    }
}

async fn handle_get(req: Request<Body>, ctx: &NodeContext) -> Response<Body> {
    let key = match query_param(&req, "key") {
        Some(key) => key,
        None => return error_response(StatusCode::BAD_REQUEST, "missing key", false, None),
    };
    // `consistency=strong` routes through the leader's read guard; the
    // default serves the local applied state.
    if query_param(&req, "consistency").as_deref() == Some("strong") {
        match ctx.raft.client_read().await {
            Ok(()) => {}
            Err(ReadError::ForwardToLeader(hint)) => {
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "not_leader", true, hint)
            }
            Err(err) => {
                return error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string(), true, None)
            }
        }
    }
    match ctx.store.get(&key).await {
        Some(value) => json_response(StatusCode::OK, json!({ "value": value })),
        None => json_response(
            StatusCode::NOT_FOUND,
            json!({"ok": false, "reason": "not_found"}),
        ),
    }
}

async fn handle_delete(req: Request<Body>, ctx: &NodeContext) -> Response<Body> {
    let key = match query_param(&req, "key") {
        Some(key) => key,
        None => return error_response(StatusCode::BAD_REQUEST, "missing key", false, None),
    };
    match ctx
        .raft
        .client_write(WriteRequest {
            data: KvCommand::Delete { key }.encode(),
        })
        .await
    {
        Ok(_) => json_response(StatusCode::OK, json!({"ok": true})),
        Err(err) => write_error_response(err),
    }
}

fn handle_status(ctx: &NodeContext) -> Response<Body> {
    let metrics = ctx.raft.metrics().borrow().clone();
    json_response(
        StatusCode::OK,
        json!({
            "node_id": ctx.node_id,
            "role": metrics.role,
            "term": metrics.current_term,
            "is_leader": metrics.role == Role::Leader,
            "commit_index": metrics.commit_index,
            "applied_index": metrics.last_applied,
            "leader": metrics.current_leader,
        }),
    )
}

async fn handle_metrics(ctx: &NodeContext) -> Response<Body> {
    let raft = ctx.raft.metrics().borrow().clone();
    let applied = ctx.store.last_applied().await.unwrap_or_default();
    let checksum = ctx.store.checksum().await.unwrap_or(0);
    let replication = ctx.replicator.as_ref().map(|r| r.get_metrics());
    json_response(
        StatusCode::OK,
        json!({
            "node_id": ctx.node_id,
            "keys": ctx.store.len().await,
            "memory_usage_bytes": ctx.store.memory_usage(),
            "applied_index": applied.index,
            "applied_term": applied.term,
            "checksum": checksum,
            "raft": raft,
            "replication": replication,
        }),
    )
}

async fn handle_vote(req: Request<Body>, ctx: &NodeContext) -> Response<Body> {
    let rpc: VoteRequest = match read_body(req).await {
        Ok(rpc) => rpc,
        Err(response) => return response,
    };
    match ctx.raft.vote(rpc).await {
        Ok(response) => ok_json(&response),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string(), true, None),
    }
}

async fn handle_append(req: Request<Body>, ctx: &NodeContext) -> Response<Body> {
    let rpc: AppendEntriesRequest = match read_body(req).await {
        Ok(rpc) => rpc,
        Err(response) => return response,
    };
    match ctx.raft.append_entries(rpc).await {
        Ok(response) => ok_json(&response),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string(), true, None),
    }
}

async fn handle_raft_snapshot(req: Request<Body>, ctx: &NodeContext) -> Response<Body> {
    let rpc: InstallSnapshotRequest = match read_body(req).await {
        Ok(rpc) => rpc,
        Err(response) => return response,
    };
    match ctx.raft.install_snapshot(rpc).await {
        Ok(response) => ok_json(&response),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string(), true, None),
    }
}

/// Async replication intake: apply the batch in order and acknowledge with
/// the applied index. Entries at or below the applied index deduplicate;
/// a gap stops the batch so the sender's ordered retry covers it.
async fn handle_replication_batch(req: Request<Body>, ctx: &NodeContext) -> Response<Body> {
    let envelope: BatchEnvelope = match read_body(req).await {
        Ok(envelope) => envelope,
        Err(response) => return response,
    };
    let entries = match decode_payload(&envelope.payload, envelope.compressed) {
        Ok(entries) => entries,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("bad payload: {err}"), false, None)
        }
    };

    for entry in &entries {
        let applied = ctx.store.last_applied().await.unwrap_or_default();
        if entry.index <= applied.index {
            continue;
        }
        if entry.index != applied.index + 1 {
            tracing::warn!(
                entry = entry.index,
                applied = applied.index,
                "replication gap, deferring to retry"
            );
            break;
        }
        if let Err(err) = ctx.store.apply(entry).await {
            error!(error = %err, "failed to apply replicated entry");
            break;
        }
    }
    if let Err(err) = ctx.log.append(&entries).await {
        error!(error = %err, "failed to append replicated entries to log");
    }

    let applied = ctx.store.last_applied().await.unwrap_or_default();
    ok_json(&BatchAck {
        batch_id: envelope.batch_id,
        last_applied_index: applied.index,
    })
}

async fn handle_replication_snapshot(req: Request<Body>, ctx: &NodeContext) -> Response<Body> {
    let snapshot: SnapshotData = match read_body(req).await {
        Ok(snapshot) => snapshot,
        Err(response) => return response,
    };
    if let Err(err) = ctx
        .store
        .install(snapshot.meta.last_included, &snapshot.data)
        .await
    {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string(), true, None);
    }
    if let Err(err) = ctx.log.save_snapshot(&snapshot).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string(), true, None);
    }
    json_response(StatusCode::OK, json!({"ok": true}))
}

fn topology_or_missing(ctx: &NodeContext) -> Result<&Arc<TopologyService>, Response<Body>> {
    ctx.topology.as_ref().ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            "topology service not hosted on this node",
            false,
            None,
        )
    })
}

fn handle_topology_snapshot(ctx: &NodeContext) -> Response<Body> {
    let topology = match topology_or_missing(ctx) {
        Ok(topology) => topology,
        Err(response) => return response,
    };
    let snapshot = topology.get_snapshot();
    json_response(
        StatusCode::OK,
        json!({
            "success": true,
            "version": snapshot.version,
            "nodes": snapshot.nodes,
            "shards": snapshot.shards,
            "dcs": snapshot.dcs,
        }),
    )
}

fn handle_topology_nodes(ctx: &NodeContext) -> Response<Body> {
    let topology = match topology_or_missing(ctx) {
        Ok(topology) => topology,
        Err(response) => return response,
    };
    let nodes: Vec<NodeStatus> = topology.get_snapshot().nodes.into_values().collect();
    ok_json(&nodes)
}

fn handle_topology_health(ctx: &NodeContext) -> Response<Body> {
    let topology = match topology_or_missing(ctx) {
        Ok(topology) => topology,
        Err(response) => return response,
    };
    let snapshot = topology.get_snapshot();
    let healthy = snapshot
        .nodes
        .values()
        .filter(|n| n.health == NodeHealth::Healthy)
        .count();
    json_response(
        StatusCode::OK,
        json!({
            "success": true,
            "version": snapshot.version,
            "nodes_total": snapshot.nodes.len(),
            "nodes_healthy": healthy,
        }),
    )
}

/// Long-poll subscription: waits up to `wait_ms` for events, then returns
/// whatever arrived.
async fn handle_topology_subscribe(req: Request<Body>, ctx: &NodeContext) -> Response<Body> {
    let topology = match topology_or_missing(ctx) {
        Ok(topology) => topology.clone(),
        Err(response) => return response,
    };
    let body: SubscribeBody = match read_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let mut subscription = topology.subscribe(body.client_id, body.types);
    let wait = Duration::from_millis(body.wait_ms.unwrap_or(25_000).min(60_000));
    let mut events = Vec::new();
    if let Ok(Some(event)) = timeout(wait, subscription.events.recv()).await {
        events.push(event);
        while let Ok(event) = subscription.events.try_recv() {
            events.push(event);
        }
    }
    json_response(
        StatusCode::OK,
        json!({
            "success": true,
            "version": topology.version(),
            "events": events,
        }),
    )
}

async fn handle_cluster_add(req: Request<Body>, ctx: &NodeContext) -> Response<Body> {
    let body: AddServerBody = match read_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let id = NodeId::new(body.id);
    ctx.network.set_address(id.clone(), body.address.clone());

    match ctx.raft.add_server(id.clone()).await {
        Ok(()) => {
            if let Some(topology) = &ctx.topology {
                topology.add_node(NodeStatus {
                    id: id.clone(),
                    address: body.address,
                    dc: body.dc.unwrap_or_else(|| "default".to_string()).into(),
                    role: ReplicaRole::Primary,
                    health: NodeHealth::Unknown,
                    last_seen: Utc::now(),
                });
            }
            json_response(StatusCode::OK, json!({"ok": true, "id": id}))
        }
        Err(err) => membership_error_response(err),
    }
}

async fn handle_cluster_remove(req: Request<Body>, ctx: &NodeContext) -> Response<Body> {
    let body: RemoveServerBody = match read_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let id = NodeId::new(body.id);
    match ctx.raft.remove_server(id.clone()).await {
        Ok(()) => {
            if let Some(topology) = &ctx.topology {
                topology.remove_node(&id);
            }
            json_response(StatusCode::OK, json!({"ok": true}))
        }
        Err(err) => membership_error_response(err),
    }
}

fn membership_error_response(err: MembershipError) -> Response<Body> {
    match err {
        MembershipError::ForwardToLeader(hint) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "not_leader", true, hint)
        }
        MembershipError::AlreadyMember(id) => error_response(
            StatusCode::CONFLICT,
            &format!("node {id} is already a member"),
            false,
            None,
        ),
        MembershipError::NotMember(id) => error_response(
            StatusCode::NOT_FOUND,
            &format!("node {id} is not a member"),
            false,
            None,
        ),
        MembershipError::ChangeInProgress => error_response(
            StatusCode::CONFLICT,
            "membership change in progress",
            true,
            None,
        ),
        MembershipError::Raft(err) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string(), true, None)
        }
    }
}

fn handle_cluster_config(ctx: &NodeContext) -> Response<Body> {
    let metrics = ctx.raft.metrics().borrow().clone();
    let members: HashMap<String, bool> = metrics
        .membership
        .voters
        .iter()
        .map(|id| (id.to_string(), true))
        .chain(metrics.membership.learners.iter().map(|id| (id.to_string(), false)))
        .collect();
    json_response(
        StatusCode::OK,
        json!({
            "ok": true,
            "term": metrics.current_term,
            "members": members,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_parses_pairs() {
        let req = Request::builder()
            .uri("http://localhost/api/get?key=k1&consistency=strong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(query_param(&req, "key"), Some("k1".to_string()));
        assert_eq!(query_param(&req, "consistency"), Some("strong".to_string()));
        assert_eq!(query_param(&req, "missing"), None);
    }

    #[test]
    fn error_body_shape() {
        let response = error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_leader",
            true,
            Some(NodeId::new("n1")),
        );
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
