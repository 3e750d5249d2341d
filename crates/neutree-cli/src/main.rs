mod args;
mod wait;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

use neutree_cluster::{
    build_serve_application, deploy_endpoint, new_cluster_manager, reconcile, remove_endpoint,
    ClusterManager, DashboardClient, ManagerOptions,
};
use neutree_common::{
    Cluster, ClusterError, Endpoint, Engine, ImageRegistry, ModelRegistry, ProcessExecutor,
};
use neutree_importer::{ImportOptions, Importer};
use neutree_meta::{EtcdMetaStore, ResourceKind, ResourceStore, Stored};

use crate::args::{Args, ClusterCommand, Command, EndpointCommand, ImportArgs};
use crate::wait::{wait_for, WaitCondition};

type Store = ResourceStore<EtcdMetaStore>;

fn parse_kind(kind: &str) -> Result<ResourceKind> {
    Ok(match kind.to_ascii_lowercase().as_str() {
        "cluster" | "clusters" => ResourceKind::Cluster,
        "endpoint" | "endpoints" => ResourceKind::Endpoint,
        "engine" | "engines" => ResourceKind::Engine,
        "imageregistry" | "image_registry" | "image_registries" => ResourceKind::ImageRegistry,
        "modelregistry" | "model_registry" | "model_registries" => ResourceKind::ModelRegistry,
        other => bail!("unknown resource kind {other:?}"),
    })
}

async fn load_cluster(store: &Store, ws: &str, name: &str) -> Result<(Stored<Cluster>, ImageRegistry)> {
    let cluster = store
        .get_cluster(ws, name)
        .await?
        .ok_or_else(|| anyhow!(ClusterError::NotFound(format!("cluster {ws}/{name}"))))?;
    let registry_name = &cluster.object.spec.image_registry;
    let registry = store
        .get_image_registry(ws, registry_name)
        .await?
        .ok_or_else(|| anyhow!(ClusterError::NotFound(format!("image registry {ws}/{registry_name}"))))?;
    Ok((cluster, registry))
}

async fn manager_for(store: &Store, ws: &str, name: &str) -> Result<Box<dyn ClusterManager>> {
    let (cluster, registry) = load_cluster(store, ws, name).await?;
    new_cluster_manager(&cluster.object, &registry, ManagerOptions::default()).await
}

async fn run_import(store: Store, ws: &str, args: ImportArgs) -> Result<()> {
    let mut opts = ImportOptions::new(args.package, ws);
    opts.image_registry = args.registry;
    opts.mirror_registry = args.mirror_registry;
    opts.registry_user = args.registry_user;
    opts.registry_password = args.registry_password;
    opts.skip_image_load = args.skip_image_load;
    opts.skip_image_push = args.skip_image_push;
    opts.force = args.force;
    opts.extract_dir = args.extract_dir;
    opts.push_retries = args.retries;

    let importer = Importer::new(store, Arc::new(ProcessExecutor));
    let result = importer.import(&opts).await?;
    if let Some(meta) = &result.manifest.metadata {
        println!("✓ Package {} {}", meta.name, meta.version);
    }
    for image in &result.images_imported {
        println!("  image  {image}");
    }
    for engine in &result.engines_imported {
        println!("  engine {engine}");
    }
    Ok(())
}

async fn run_cluster(store: Store, ws: &str, cmd: ClusterCommand) -> Result<()> {
    match cmd {
        ClusterCommand::Up { name, restart } => {
            let manager = manager_for(&store, ws, &name).await?;
            let head = manager.up_cluster(restart).await?;
            println!("✓ Cluster {ws}/{name} is up, head {head}");
        }
        ClusterCommand::Down { name } => {
            let manager = manager_for(&store, ws, &name).await?;
            match manager.down_cluster().await {
                Ok(()) => println!("✓ Cluster {ws}/{name} is down"),
                Err(e) if ClusterError::is_wait_for_deletion(&e) => {
                    println!("… Cluster {ws}/{name} resources are being deleted, run down again to confirm")
                }
                Err(e) => return Err(e),
            }
        }
        ClusterCommand::Sync { name } => {
            let manager = manager_for(&store, ws, &name).await?;
            manager.sync().await?;
            println!("✓ Cluster {ws}/{name} synced");
        }
        ClusterCommand::Reconcile { name } => {
            let (mut cluster, registry) = load_cluster(&store, ws, &name).await?;
            let result = reconcile(&cluster.object, &registry, ManagerOptions::default()).await?;
            cluster.object.status = Some(result.status.clone());
            store
                .update(ResourceKind::Cluster, ws, &name, &cluster.object, cluster.revision)
                .await
                .context("store cluster status")?;
            println!("{:?}", result.status.phase);
            if let Some(msg) = &result.status.error_message {
                eprintln!("  error: {msg}");
            }
            if result.requeue {
                println!("  requeue");
            }
        }
    }
    Ok(())
}

struct EndpointContext {
    endpoint: Endpoint,
    manager: Box<dyn ClusterManager>,
    model_registry: ModelRegistry,
}

async fn endpoint_context(store: &Store, ws: &str, name: &str) -> Result<EndpointContext> {
    let endpoint = store
        .get_endpoint(ws, name)
        .await?
        .ok_or_else(|| anyhow!(ClusterError::NotFound(format!("endpoint {ws}/{name}"))))?;
    let manager = manager_for(store, ws, &endpoint.spec.cluster).await?;
    let registry_name = &endpoint.spec.model.registry;
    let model_registry = store
        .get_model_registry(ws, registry_name)
        .await?
        .ok_or_else(|| anyhow!(ClusterError::NotFound(format!("model registry {ws}/{registry_name}"))))?;
    Ok(EndpointContext {
        endpoint,
        manager,
        model_registry,
    })
}

async fn run_endpoint(store: Store, ws: &str, cmd: EndpointCommand) -> Result<()> {
    match cmd {
        EndpointCommand::Deploy { name } => {
            let ctx = endpoint_context(&store, ws, &name).await?;
            let engine_name = &ctx.endpoint.spec.engine.engine;
            let engine: Engine = store
                .get::<Engine>(ResourceKind::Engine, ws, engine_name)
                .await?
                .map(|s| s.object)
                .ok_or_else(|| anyhow!(ClusterError::NotFound(format!("engine {ws}/{engine_name}"))))?;

            let app = build_serve_application(&ctx.endpoint, &engine, &ctx.model_registry)?;
            ctx.manager
                .connect_endpoint_model(&ctx.endpoint, &ctx.model_registry)
                .await?;
            let dashboard = DashboardClient::new(ctx.manager.dashboard_service().await?)?;
            deploy_endpoint(&dashboard, &app).await?;
            let serve = ctx.manager.serve_endpoint().await?;
            println!("✓ Endpoint {ws}/{name} deployed at {serve}{}", app.route_prefix);
        }
        EndpointCommand::Remove { name } => {
            let ctx = endpoint_context(&store, ws, &name).await?;
            let dashboard = DashboardClient::new(ctx.manager.dashboard_service().await?)?;
            remove_endpoint(&dashboard, &ctx.endpoint).await?;
            ctx.manager
                .disconnect_endpoint_model(&ctx.endpoint, &ctx.model_registry)
                .await?;
            println!("✓ Endpoint {ws}/{name} removed");
        }
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let ws = args.workspace;
    let meta = EtcdMetaStore::connect(&args.etcd_endpoints)
        .await
        .context("connect metadata store")?;
    tracing::debug!(endpoints = ?args.etcd_endpoints, workspace = %ws, "metadata store connected");

    match args.command {
        Command::Import(import) => run_import(ResourceStore::new(meta), &ws, import).await,
        Command::Cluster { subcommand } => run_cluster(ResourceStore::new(meta), &ws, subcommand).await,
        Command::Endpoint { subcommand } => run_endpoint(ResourceStore::new(meta), &ws, subcommand).await,
        Command::Wait {
            resource,
            condition,
            timeout,
        } => {
            let (kind, name) = resource
                .split_once('/')
                .ok_or_else(|| anyhow!("resource must be <kind>/<name>, got {resource:?}"))?;
            let key = parse_kind(kind)?.key(&ws, name);
            let cond: WaitCondition = condition.parse()?;
            wait_for(&meta, &key, &cond, Duration::from_secs(timeout)).await?;
            println!("✓ {resource} condition met");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let provider = neutree_common::telemetry::init_tracing(
        "neutree-cli",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );

    let result = run(args).await;

    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("tracer shutdown: {e}");
        }
    }
    if let Err(e) = result {
        eprintln!("✗ {e:#}");
        std::process::exit(1);
    }
}
