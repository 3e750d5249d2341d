use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "neutree")]
#[command(about = "Neutree control plane CLI", long_about = None)]
pub struct Args {
    /// etcd endpoints of the metadata store
    #[arg(
        long,
        env = "NEUTREE_ETCD_ENDPOINTS",
        default_value = "http://127.0.0.1:2379",
        value_delimiter = ','
    )]
    pub etcd_endpoints: Vec<String>,

    /// Workspace of the resources addressed by name
    #[arg(long, short = 'w', global = true, default_value = "default")]
    pub workspace: String,

    /// OTLP collector base URL
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP collector
    #[arg(long, env = "OTEL_EXPORTER_OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Import an offline package
    Import(ImportArgs),
    /// Cluster lifecycle
    Cluster {
        #[command(subcommand)]
        subcommand: ClusterCommand,
    },
    /// Endpoint deployment
    Endpoint {
        #[command(subcommand)]
        subcommand: EndpointCommand,
    },
    /// Wait for a condition on a resource
    Wait {
        /// `<kind>/<name>`, e.g. `cluster/prod`
        resource: String,
        /// `jsonpath=<path>=<value>`, `condition=<type>` or `delete`
        #[arg(long = "for")]
        condition: String,
        /// Seconds to wait before giving up
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
}

#[derive(Debug, clap::Args)]
pub struct ImportArgs {
    /// Package archive (tar or tar.gz)
    #[arg(long, short = 'p')]
    pub package: PathBuf,

    /// ImageRegistry record to push images to
    #[arg(long)]
    pub registry: Option<String>,

    /// Push to this registry host instead of an ImageRegistry record
    #[arg(long)]
    pub mirror_registry: Option<String>,

    #[arg(long, env = "NEUTREE_REGISTRY_USER")]
    pub registry_user: Option<String>,

    #[arg(long, env = "NEUTREE_REGISTRY_PASSWORD", hide_env_values = true)]
    pub registry_password: Option<String>,

    #[arg(long)]
    pub skip_image_load: bool,

    #[arg(long)]
    pub skip_image_push: bool,

    /// Replace engine versions that already exist
    #[arg(long)]
    pub force: bool,

    /// Keep the extracted package here
    #[arg(long)]
    pub extract_dir: Option<PathBuf>,

    #[arg(long, default_value_t = neutree_importer::DEFAULT_PUSH_RETRIES)]
    pub retries: u32,
}

#[derive(Debug, Subcommand)]
pub enum ClusterCommand {
    /// Bring a cluster up
    Up {
        name: String,
        /// Restart the runtime on running nodes
        #[arg(long)]
        restart: bool,
    },
    /// Tear a cluster down
    Down { name: String },
    /// Reconcile a running cluster once
    Sync { name: String },
    /// Run one lifecycle step and store the resulting status
    Reconcile { name: String },
}

#[derive(Debug, Subcommand)]
pub enum EndpointCommand {
    /// Mount the model and deploy the serve application
    Deploy { name: String },
    /// Remove the serve application and unmount the model
    Remove { name: String },
}
