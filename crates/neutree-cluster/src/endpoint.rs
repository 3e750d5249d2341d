//! Wiring endpoints onto the runtime's serve applications.

use anyhow::Context;
use serde_json::{json, Map, Value};

use neutree_common::{ClusterError, Endpoint, Engine, ModelRegistry, ModelRegistryType};

use crate::dashboard::{DashboardClient, ServeApplication, ServeApplicationsRequest};
use crate::manager::model_mount_path;

/// `serve.<engine>.<version>.app:app_builder`.
pub fn import_path(engine: &str, version: &str) -> String {
    format!("serve.{engine}.{version}.app:app_builder")
}

/// Renders the serve application for an endpoint.
pub fn build_serve_application(
    endpoint: &Endpoint,
    engine: &Engine,
    model_registry: &ModelRegistry,
) -> anyhow::Result<ServeApplication> {
    let spec = &endpoint.spec;
    if engine.version(&spec.engine.version).is_none() {
        anyhow::bail!(ClusterError::NotFound(format!(
            "engine {} version {}",
            spec.engine.engine, spec.engine.version
        )));
    }
    let tasks = &engine.spec.supported_tasks;
    if !spec.model.task.is_empty() && !tasks.is_empty() && !tasks.contains(&spec.model.task) {
        anyhow::bail!(ClusterError::Validation(format!(
            "engine {} does not support task {}",
            spec.engine.engine, spec.model.task
        )));
    }

    let path = match model_registry.spec.registry_type {
        ModelRegistryType::BentoMl => model_mount_path(endpoint, model_registry),
        ModelRegistryType::HuggingFace => spec.model.name.clone(),
    };
    let model = json!({
        "registry_type": model_registry.spec.registry_type,
        "name": spec.model.name,
        "version": spec.model.version,
        "file": spec.model.file,
        "task": spec.model.task,
        "path": path,
    });

    let mut backend = Map::new();
    backend.insert("num_replicas".into(), json!(spec.replicas.num));
    if let Some(cpu) = spec.resources.cpu {
        backend.insert("num_cpus".into(), json!(cpu));
    }
    if let Some(gpu) = spec.resources.gpu {
        backend.insert("num_gpus".into(), json!(gpu));
    }
    if let Some(memory) = spec.resources.memory {
        // GiB in the record, bytes for the runtime
        backend.insert("memory".into(), json!((memory * 1024.0 * 1024.0 * 1024.0) as u64));
    }
    if !spec.resources.accelerator.is_empty() {
        backend.insert("resources".into(), json!(spec.resources.accelerator));
    }

    let options = endpoint.deployment_options();
    let mut deployment_options = json!({ "backend": backend });
    if let Some(mode) = options.deploy_mode {
        deployment_options["deploy_mode"] = json!(mode);
    }
    if let Some(scheduler) = options.scheduler_type {
        deployment_options["scheduler"] = json!({ "type": scheduler });
    }

    Ok(ServeApplication {
        name: endpoint.app_name(),
        route_prefix: endpoint.route_prefix(),
        import_path: import_path(&spec.engine.engine, &spec.engine.version),
        args: json!({
            "model": model,
            "deployment_options": deployment_options,
            "engine_args": endpoint.engine_args(),
            "env": spec.env,
        }),
    })
}

/// Deployed configs of every application except `skip`.
async fn current_apps(dashboard: &DashboardClient, skip: &str) -> anyhow::Result<(Vec<Value>, bool)> {
    let current = dashboard
        .serve_applications()
        .await
        .context("get serve applications")?;
    let mut found = false;
    let mut apps = Vec::new();
    for (name, status) in current.applications {
        if name == skip {
            found = true;
            continue;
        }
        match status.deployed_app_config {
            Some(cfg) => apps.push(cfg),
            None => tracing::warn!(app = %name, "serve application without deployed config, dropping"),
        }
    }
    Ok((apps, found))
}

/// Upserts the endpoint's application into the serve app set.
pub async fn deploy_endpoint(dashboard: &DashboardClient, app: &ServeApplication) -> anyhow::Result<()> {
    let (mut apps, _) = current_apps(dashboard, &app.name).await?;
    apps.push(serde_json::to_value(app)?);
    dashboard
        .update_serve_applications(&ServeApplicationsRequest { applications: apps })
        .await
        .with_context(|| format!("deploy serve application {}", app.name))?;
    tracing::info!(app = %app.name, route = %app.route_prefix, "serve application deployed");
    Ok(())
}

/// Drops the endpoint's application from the serve app set. Absent apps are
/// left alone.
pub async fn remove_endpoint(dashboard: &DashboardClient, endpoint: &Endpoint) -> anyhow::Result<()> {
    let name = endpoint.app_name();
    let (apps, found) = current_apps(dashboard, &name).await?;
    if !found {
        tracing::debug!(app = %name, "serve application not deployed");
        return Ok(());
    }
    dashboard
        .update_serve_applications(&ServeApplicationsRequest { applications: apps })
        .await
        .with_context(|| format!("remove serve application {name}"))?;
    tracing::info!(app = %name, "serve application removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutree_common::{EngineSpec, EngineVersion, Metadata};

    use crate::dashboard::tests::FakeDashboard;
    use crate::manager::tests::{endpoint, model_registry};

    fn engine() -> Engine {
        Engine {
            metadata: Metadata::new("ws", "vllm"),
            spec: EngineSpec {
                versions: vec![EngineVersion {
                    version: "v0.8.5".into(),
                    ..Default::default()
                }],
                supported_tasks: vec!["text-generation".into()],
            },
        }
    }

    fn chat_endpoint() -> Endpoint {
        let mut ep = endpoint();
        ep.spec.engine.engine = "vllm".into();
        ep.spec.engine.version = "v0.8.5".into();
        ep.spec.model.task = "text-generation".into();
        ep.spec.replicas.num = 2;
        ep.spec.resources.gpu = Some(1.0);
        ep.spec.deployment_options = json!({
            "deploy_mode": "default",
            "scheduler": {"type": "consistent_hash"},
            "unknown": 1,
        })
        .as_object()
        .unwrap()
        .clone();
        ep.spec.variables = json!({"engine_args": {"max_model_len": 4096}})
            .as_object()
            .unwrap()
            .clone();
        ep
    }

    #[test]
    fn test_build_serve_application() {
        let mr = model_registry(ModelRegistryType::BentoMl, "nfs://nas/export");
        let app = build_serve_application(&chat_endpoint(), &engine(), &mr).unwrap();

        assert_eq!(app.name, "ws_chat");
        assert_eq!(app.route_prefix, "/ws/chat");
        assert_eq!(app.import_path, "serve.vllm.v0.8.5.app:app_builder");
        assert_eq!(app.args["model"]["path"], "/mnt/ws/chat/ws/models/qwen");
        assert_eq!(app.args["model"]["registry_type"], "bentoml");
        let opts = &app.args["deployment_options"];
        assert_eq!(opts["backend"]["num_replicas"], 2);
        assert_eq!(opts["backend"]["num_gpus"], 1.0);
        assert_eq!(opts["scheduler"]["type"], "consistent_hash");
        assert_eq!(opts["deploy_mode"], "default");
        assert!(opts.get("unknown").is_none());
        assert_eq!(app.args["engine_args"]["max_model_len"], 4096);
    }

    #[test]
    fn test_build_rejects_unknown_version_and_task() {
        let mr = model_registry(ModelRegistryType::HuggingFace, "https://huggingface.co");
        let mut ep = chat_endpoint();
        ep.spec.engine.version = "v9".into();
        let err = build_serve_application(&ep, &engine(), &mr).unwrap_err();
        assert!(ClusterError::is_not_found(&err));

        let mut ep = chat_endpoint();
        ep.spec.model.task = "embedding".into();
        let err = build_serve_application(&ep, &engine(), &mr).unwrap_err();
        assert!(matches!(ClusterError::find(&err), Some(ClusterError::Validation(_))));

        let app = build_serve_application(&chat_endpoint(), &engine(), &mr).unwrap();
        assert_eq!(app.args["model"]["path"], "qwen");
    }

    #[tokio::test]
    async fn test_deploy_and_remove() {
        let fake = FakeDashboard::default();
        fake.apps.lock().unwrap().push(json!({
            "name": "ws_other",
            "route_prefix": "/ws/other",
            "import_path": "serve.vllm.v0.8.5.app:app_builder",
            "args": {},
        }));
        let client = DashboardClient::new(fake.serve().await).unwrap();
        let mr = model_registry(ModelRegistryType::HuggingFace, "https://huggingface.co");
        let ep = chat_endpoint();
        let app = build_serve_application(&ep, &engine(), &mr).unwrap();

        deploy_endpoint(&client, &app).await.unwrap();
        deploy_endpoint(&client, &app).await.unwrap();
        let names: Vec<String> = fake
            .apps
            .lock()
            .unwrap()
            .iter()
            .map(|a| a["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["ws_other", "ws_chat"]);

        remove_endpoint(&client, &ep).await.unwrap();
        let apps = fake.apps.lock().unwrap().clone();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0]["name"], "ws_other");

        // Removing again does not touch the app set.
        fake.apps.lock().unwrap().clear();
        remove_endpoint(&client, &ep).await.unwrap();
    }
}
