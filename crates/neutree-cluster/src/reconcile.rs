//! One lifecycle step of a cluster, driven by an external reconcile loop.

use anyhow::bail;

use neutree_common::{Cluster, ClusterError, ClusterPhase, ClusterStatus, ImageRegistry};

use crate::manager::{new_cluster_manager, ClusterManager, ManagerOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileResult {
    pub status: ClusterStatus,
    /// Run the step again later.
    pub requeue: bool,
}

fn advance(status: &mut ClusterStatus, next: ClusterPhase) -> anyhow::Result<()> {
    if !status.phase.can_transition_to(next) {
        bail!(ClusterError::Validation(format!(
            "illegal phase transition {:?} -> {next:?}",
            status.phase
        )));
    }
    status.phase = next;
    Ok(())
}

/// Builds a fresh manager for the cluster and runs one step.
pub async fn reconcile(
    cluster: &Cluster,
    registry: &ImageRegistry,
    opts: ManagerOptions,
) -> anyhow::Result<ReconcileResult> {
    let manager = new_cluster_manager(cluster, registry, opts).await?;
    reconcile_cluster(cluster, manager.as_ref()).await
}

/// Advances the cluster one step. Manager failures are recorded on the
/// returned status and requeued; illegal transitions are errors.
pub async fn reconcile_cluster(
    cluster: &Cluster,
    manager: &dyn ClusterManager,
) -> anyhow::Result<ReconcileResult> {
    let mut status = cluster.status.clone().unwrap_or_default();
    let key = cluster.key();

    if cluster.metadata.is_deleting() {
        if status.phase == ClusterPhase::Deleted {
            return Ok(ReconcileResult { status, requeue: false });
        }
        advance(&mut status, ClusterPhase::Draining)?;
        return Ok(match manager.down_cluster().await {
            Ok(()) => {
                advance(&mut status, ClusterPhase::Deleted)?;
                status.initialized = false;
                status.dashboard_url = None;
                status.error_message = None;
                tracing::info!(cluster = %key, "cluster deleted");
                ReconcileResult { status, requeue: false }
            }
            Err(e) if ClusterError::is_wait_for_deletion(&e) => {
                tracing::debug!(cluster = %key, "waiting for cluster resources to be deleted");
                ReconcileResult { status, requeue: true }
            }
            Err(e) => {
                tracing::warn!(cluster = %key, error = %e, "down cluster failed");
                status.error_message = Some(format!("{e:#}"));
                ReconcileResult { status, requeue: true }
            }
        });
    }

    match status.phase {
        ClusterPhase::Pending | ClusterPhase::Provisioning => {
            advance(&mut status, ClusterPhase::Provisioning)?;
            let up = async {
                let head = manager.up_cluster(false).await?;
                let dashboard = manager.dashboard_service().await?;
                anyhow::Ok((head, dashboard))
            };
            match up.await {
                Ok((head, dashboard)) => {
                    advance(&mut status, ClusterPhase::Running)?;
                    status.initialized = true;
                    status.dashboard_url = Some(dashboard);
                    status.error_message = None;
                    tracing::info!(cluster = %key, %head, "cluster running");
                }
                Err(e) => {
                    tracing::warn!(cluster = %key, error = %e, "up cluster failed");
                    status.error_message = Some(format!("{e:#}"));
                    return Ok(ReconcileResult { status, requeue: true });
                }
            }
            Ok(ReconcileResult { status, requeue: false })
        }
        ClusterPhase::Running => match manager.sync().await {
            Ok(()) => {
                status.error_message = None;
                Ok(ReconcileResult { status, requeue: false })
            }
            Err(e) => {
                tracing::warn!(cluster = %key, error = %e, "sync cluster failed");
                status.error_message = Some(format!("{e:#}"));
                Ok(ReconcileResult { status, requeue: true })
            }
        },
        phase @ (ClusterPhase::Draining | ClusterPhase::Deleted) => {
            bail!(ClusterError::Validation(format!(
                "cluster {key} is {phase:?} but not being deleted"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use neutree_common::{ClusterSpec, ClusterType, Endpoint, Metadata, ModelRegistry};

    /// Manager whose operations succeed unless told otherwise.
    #[derive(Default)]
    struct FakeManager {
        calls: Mutex<Vec<&'static str>>,
        up_fails: bool,
        waits: Mutex<u32>,
    }

    impl FakeManager {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClusterManager for FakeManager {
        async fn up_cluster(&self, _restart: bool) -> anyhow::Result<String> {
            self.calls.lock().unwrap().push("up");
            if self.up_fails {
                bail!(ClusterError::DependencyUnavailable("image x not found".into()));
            }
            Ok("10.0.0.1".into())
        }
        async fn down_cluster(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("down");
            let mut waits = self.waits.lock().unwrap();
            if *waits > 0 {
                *waits -= 1;
                bail!(ClusterError::WaitForDeletion("ws/prod".into()));
            }
            Ok(())
        }
        async fn sync(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("sync");
            Ok(())
        }
        async fn start_node(&self, _ip: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop_node(&self, _ip: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn connect_endpoint_model(&self, _: &Endpoint, _: &ModelRegistry) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect_endpoint_model(&self, _: &Endpoint, _: &ModelRegistry) -> anyhow::Result<()> {
            Ok(())
        }
        async fn dashboard_service(&self) -> anyhow::Result<String> {
            Ok("http://10.0.0.1:8265".into())
        }
        async fn serve_endpoint(&self) -> anyhow::Result<String> {
            Ok("http://10.0.0.1:8000".into())
        }
        fn desired_static_workers_ip(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn cluster(phase: Option<ClusterPhase>) -> Cluster {
        Cluster {
            metadata: Metadata::new("ws", "prod"),
            spec: ClusterSpec {
                cluster_type: ClusterType::Ssh,
                version: "v1".into(),
                image_registry: "hub".into(),
                config: serde_json::Value::Null,
            },
            status: phase.map(|phase| ClusterStatus {
                phase,
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_pending_to_running_then_sync() {
        let m = FakeManager::default();
        let mut c = cluster(None);
        let r = reconcile_cluster(&c, &m).await.unwrap();
        assert_eq!(r.status.phase, ClusterPhase::Running);
        assert!(r.status.initialized);
        assert_eq!(r.status.dashboard_url.as_deref(), Some("http://10.0.0.1:8265"));
        assert!(!r.requeue);

        c.status = Some(r.status);
        let r = reconcile_cluster(&c, &m).await.unwrap();
        assert_eq!(r.status.phase, ClusterPhase::Running);
        assert_eq!(m.calls(), ["up", "sync"]);
    }

    #[tokio::test]
    async fn test_up_failure_stays_provisioning() {
        let m = FakeManager {
            up_fails: true,
            ..Default::default()
        };
        let r = reconcile_cluster(&cluster(None), &m).await.unwrap();
        assert_eq!(r.status.phase, ClusterPhase::Provisioning);
        assert!(r.requeue);
        assert!(r.status.error_message.unwrap().contains("image x not found"));
    }

    #[tokio::test]
    async fn test_deletion_requeues_until_swept() {
        let m = FakeManager {
            waits: Mutex::new(1),
            ..Default::default()
        };
        let mut c = cluster(Some(ClusterPhase::Running));
        c.metadata.deletion_timestamp = Some(Utc::now());

        let r = reconcile_cluster(&c, &m).await.unwrap();
        assert_eq!(r.status.phase, ClusterPhase::Draining);
        assert!(r.requeue);

        c.status = Some(r.status);
        let r = reconcile_cluster(&c, &m).await.unwrap();
        assert_eq!(r.status.phase, ClusterPhase::Deleted);
        assert!(!r.requeue);
        assert!(!r.status.initialized);

        c.status = Some(r.status);
        let r = reconcile_cluster(&c, &m).await.unwrap();
        assert_eq!(r.status.phase, ClusterPhase::Deleted);
        assert_eq!(m.calls(), ["down", "down"]);
    }

    #[tokio::test]
    async fn test_draining_without_deletion_is_rejected() {
        let m = FakeManager::default();
        let err = reconcile_cluster(&cluster(Some(ClusterPhase::Draining)), &m)
            .await
            .unwrap_err();
        assert!(matches!(ClusterError::find(&err), Some(ClusterError::Validation(_))));
        assert!(m.calls().is_empty());
    }
}
