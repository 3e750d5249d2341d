use serde::Serialize;
use serde_json::json;

use crate::dashboard::NodeSummary;
use crate::manager::{AUTOSCALER_METRICS_PORT, DASHBOARD_METRICS_PORT, RAYLET_METRICS_PORT};

use super::apply::{ObjectApi, ObjectKey};
use super::objects::{SCRAPE_FILE, VMAGENT_SCRAPE_CONFIG};

/// One file_sd entry.
#[derive(Debug, Serialize, PartialEq)]
pub struct ScrapeTarget {
    pub targets: Vec<String>,
    pub labels: std::collections::BTreeMap<String, String>,
}

/// The head exposes dashboard, autoscaler and raylet metrics; every other
/// alive node only raylet metrics.
pub fn scrape_targets(cluster: &str, nodes: &[NodeSummary]) -> Vec<ScrapeTarget> {
    nodes
        .iter()
        .filter(|n| n.is_alive())
        .map(|n| {
            let ports: &[u16] = if n.raylet.is_head {
                &[DASHBOARD_METRICS_PORT, AUTOSCALER_METRICS_PORT, RAYLET_METRICS_PORT]
            } else {
                &[RAYLET_METRICS_PORT]
            };
            ScrapeTarget {
                targets: ports.iter().map(|p| format!("{}:{p}", n.ip)).collect(),
                labels: [
                    ("ray_io_cluster".to_string(), cluster.to_string()),
                    ("node_id".to_string(), n.raylet.node_id.clone()),
                ]
                .into(),
            }
        })
        .collect()
}

/// Writes the scrape targets into the scrape config map when they changed.
/// Returns whether an update was made.
pub async fn sync_scrape_config(
    api: &dyn ObjectApi,
    namespace: &str,
    cluster: &str,
    nodes: &[NodeSummary],
) -> anyhow::Result<bool> {
    let rendered = serde_json::to_string(&scrape_targets(cluster, nodes))?;
    let key = ObjectKey {
        api_version: "v1".into(),
        kind: "ConfigMap".into(),
        namespace: Some(namespace.to_string()),
        name: VMAGENT_SCRAPE_CONFIG.into(),
    };
    let current = api.get(&key).await?;
    let existing = current
        .as_ref()
        .and_then(|cm| cm.pointer("/data"))
        .and_then(|d| d.get(SCRAPE_FILE))
        .and_then(|v| v.as_str());
    if existing == Some(rendered.as_str()) {
        return Ok(false);
    }
    api.patch(&key, &json!({"data": {SCRAPE_FILE: rendered}})).await?;
    tracing::info!(%cluster, targets = nodes.len(), "scrape config updated");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::Raylet;
    use crate::manager::kubernetes::apply::fake::MemoryObjectApi;

    fn node(ip: &str, head: bool, state: &str) -> NodeSummary {
        NodeSummary {
            ip: ip.into(),
            raylet: Raylet {
                node_id: format!("id-{ip}"),
                state: state.into(),
                is_head: head,
            },
        }
    }

    #[test]
    fn test_scrape_targets() {
        let nodes = [
            node("10.0.0.1", true, "ALIVE"),
            node("10.0.0.2", false, "ALIVE"),
            node("10.0.0.3", false, "DEAD"),
        ];
        let targets = scrape_targets("prod", &nodes);
        assert_eq!(targets.len(), 2);
        assert_eq!(
            targets[0].targets,
            ["10.0.0.1:44227", "10.0.0.1:44217", "10.0.0.1:54311"]
        );
        assert_eq!(targets[1].targets, ["10.0.0.2:54311"]);
        assert_eq!(targets[1].labels["ray_io_cluster"], "prod");
    }

    #[tokio::test]
    async fn test_sync_updates_only_on_change() {
        let api = MemoryObjectApi::default();
        api.insert(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": VMAGENT_SCRAPE_CONFIG, "namespace": "ns"},
            "data": {SCRAPE_FILE: "[]"},
        }));
        let nodes = [node("10.0.0.1", true, "ALIVE")];

        assert!(sync_scrape_config(&api, "ns", "prod", &nodes).await.unwrap());
        assert!(!sync_scrape_config(&api, "ns", "prod", &nodes).await.unwrap());
        assert_eq!(api.mutations().len(), 1);

        let cm = api.object("ConfigMap/ns/vmagent-scrape-config").unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(cm["data"][SCRAPE_FILE].as_str().unwrap()).unwrap();
        assert_eq!(parsed[0]["targets"][2], "10.0.0.1:54311");
    }
}
