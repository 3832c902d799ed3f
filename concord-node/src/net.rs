//! HTTP transport implementing the core's network contracts.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper::Client;
use hyper::Method;
use hyper::Request;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::timeout;
use tokio::time::Instant;

use concordkv::config::Config;
use concordkv::network::BatchAck;
use concordkv::network::BatchEnvelope;
use concordkv::network::BatchTransport;
use concordkv::network::ProbeError;
use concordkv::network::Prober;
use concordkv::network::RaftNetwork;
use concordkv::raft::AppendEntriesRequest;
use concordkv::raft::AppendEntriesResponse;
use concordkv::raft::InstallSnapshotRequest;
use concordkv::raft::InstallSnapshotResponse;
use concordkv::raft::VoteRequest;
use concordkv::raft::VoteResponse;
use concordkv::storage::SnapshotData;
use concordkv::NodeId;

const PROBE_TIMEOUT: Duration = Duration::from_millis(1_000);

/// hyper-backed transport for Raft RPCs, replication batches and probes.
pub struct HttpNetwork {
    client: Client<HttpConnector>,
    addresses: RwLock<HashMap<NodeId, String>>,
}

impl HttpNetwork {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            addresses: RwLock::new(HashMap::new()),
        }
    }

    /// Seed the address book from the config's server table.
    pub fn from_config(config: &Config) -> Self {
        let network = Self::new();
        {
            let mut addresses = network.addresses.write().unwrap();
            for server in &config.servers {
                addresses.insert(server.id.clone(), server.address.clone());
            }
        }
        network
    }

    pub fn set_address(&self, node: NodeId, address: String) {
        self.addresses.write().unwrap().insert(node, address);
    }

    fn address_of(&self, node: &NodeId) -> Result<String> {
        self.addresses
            .read()
            .unwrap()
            .get(node)
            .cloned()
            .ok_or_else(|| anyhow!("no address known for node {node}"))
    }

    /// GET a JSON document from a peer.
    pub async fn get_json<R: DeserializeOwned>(&self, node: &NodeId, path: &str) -> Result<R> {
        let address = self.address_of(node)?;
        let uri = format!("http://{address}{path}");
        let response = self
            .client
            .get(uri.parse().context("invalid uri")?)
            .await
            .with_context(|| format!("request to {uri} failed"))?;
        if !response.status().is_success() {
            return Err(anyhow!("{uri} returned status {}", response.status()));
        }
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        serde_json::from_slice(&bytes).with_context(|| format!("malformed response from {uri}"))
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        node: &NodeId,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let address = self.address_of(node)?;
        let uri = format!("http://{address}{path}");
        let request = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body)?))
            .context("failed to build request")?;

        let response = self
            .client
            .request(request)
            .await
            .with_context(|| format!("request to {uri} failed"))?;
        if !response.status().is_success() {
            return Err(anyhow!("{uri} returned status {}", response.status()));
        }
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        serde_json::from_slice(&bytes).with_context(|| format!("malformed response from {uri}"))
    }
}

impl Default for HttpNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RaftNetwork for HttpNetwork {
    async fn send_vote(&self, target: &NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.post_json(target, "/raft/vote", &rpc).await
    }

    async fn send_append_entries(
        &self,
        target: &NodeId,
        rpc: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.post_json(target, "/raft/append", &rpc).await
    }

    async fn send_install_snapshot(
        &self,
        target: &NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.post_json(target, "/raft/snapshot", &rpc).await
    }
}

#[async_trait]
impl BatchTransport for HttpNetwork {
    async fn send_batch(&self, target: &NodeId, batch: BatchEnvelope) -> Result<BatchAck> {
        self.post_json(target, "/replication/batch", &batch).await
    }

    async fn send_snapshot(&self, target: &NodeId, snapshot: SnapshotData) -> Result<()> {
        let _: serde_json::Value = self
            .post_json(target, "/replication/snapshot", &snapshot)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Prober for HttpNetwork {
    async fn probe(&self, target: &NodeId) -> Result<Duration, ProbeError> {
        let address = self.address_of(target).map_err(|_| ProbeError::Unreachable)?;
        let uri = format!("http://{address}/api/status");
        let started = Instant::now();
        let request = self.client.get(uri.parse().map_err(|_| ProbeError::Unreachable)?);
        match timeout(PROBE_TIMEOUT, request).await {
            Ok(Ok(_response)) => Ok(started.elapsed()),
            Ok(Err(err)) => {
                if err.is_connect() {
                    Err(ProbeError::Refused)
                } else if err.is_timeout() {
                    Err(ProbeError::Timeout)
                } else {
                    Err(ProbeError::Unreachable)
                }
            }
            Err(_) => Err(ProbeError::Timeout),
        }
    }
}
