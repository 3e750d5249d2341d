//! Client for the serving runtime's dashboard HTTP API.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("dashboard returned {status} for {path}")]
    Status { status: u16, path: String },

    #[error("node {0} not found")]
    NotFound(String),

    #[error("dashboard request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, DashboardError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Raylet {
    #[serde(rename = "nodeId", default)]
    pub node_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(rename = "isHeadNode", default)]
    pub is_head: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NodeSummary {
    pub ip: String,
    #[serde(default)]
    pub raylet: Raylet,
}

impl NodeSummary {
    pub fn is_alive(&self) -> bool {
        self.raylet.state == "ALIVE"
    }
}

#[derive(Debug, Deserialize)]
struct NodesData {
    #[serde(default)]
    summary: Vec<NodeSummary>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// One entry of `GET /api/serve/applications/`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServeApplicationStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub route_prefix: Option<String>,
    #[serde(default)]
    pub deployed_app_config: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServeApplications {
    #[serde(default)]
    pub applications: BTreeMap<String, ServeApplicationStatus>,
}

/// One application of the declarative serve config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServeApplication {
    pub name: String,
    pub route_prefix: String,
    pub import_path: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServeApplicationsRequest {
    pub applications: Vec<Value>,
}

pub struct DashboardClient {
    http: Client,
    base_url: String,
    // serialises calls made through one manager
    gate: Mutex<()>,
}

impl DashboardClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            gate: Mutex::new(()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let _gate = self.gate.lock().await;
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(DashboardError::Status {
                status: resp.status().as_u16(),
                path: path.to_string(),
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn cluster_metadata(&self) -> Result<Value> {
        self.get("/api/v0/cluster_metadata").await
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeSummary>> {
        let env: Envelope<NodesData> = self.get("/nodes?view=summary").await?;
        Ok(env.data.summary)
    }

    pub async fn alive_nodes(&self) -> Result<Vec<NodeSummary>> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .filter(NodeSummary::is_alive)
            .collect())
    }

    /// The node with `ip`; prefers an alive entry when the ip was reused.
    pub async fn node_by_ip(&self, ip: &str) -> Result<NodeSummary> {
        let mut matching: Vec<NodeSummary> = self
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.ip == ip)
            .collect();
        matching.sort_by_key(|n| !n.is_alive());
        matching
            .into_iter()
            .next()
            .ok_or_else(|| DashboardError::NotFound(ip.to_string()))
    }

    /// Autoscaler report.
    pub async fn cluster_status(&self) -> Result<Value> {
        let env: Envelope<Value> = self.get("/api/cluster_status?format=0").await?;
        Ok(env.data)
    }

    pub async fn serve_applications(&self) -> Result<ServeApplications> {
        self.get("/api/serve/applications/").await
    }

    pub async fn update_serve_applications(&self, req: &ServeApplicationsRequest) -> Result<()> {
        let _gate = self.gate.lock().await;
        let path = "/api/serve/applications/";
        let resp = self
            .http
            .put(format!("{}{path}", self.base_url))
            .json(req)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(DashboardError::Status {
                status: resp.status().as_u16(),
                path: path.to_string(),
            });
        }
        Ok(())
    }
}
