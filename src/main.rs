//! Sonde binary entry point.
//!
//! Runs a collector or collector group once against a node described by
//! flags, or runs the cron scheduler from a YAML job file. Emitted events
//! stream to stdout as JSON lines.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sonde::collector::local;
use sonde::{AppConfig, Collector, Node, Registry, RegistryError, Scheduler, Session, SledStore, Store};

/// Sonde - Pluggable Telemetry-Collection Runtime
#[derive(Parser, Debug)]
#[command(name = "sonde", version, about, long_about = None)]
struct Cli {
    /// Collector or group path to run (one-shot mode)
    #[arg(short, long)]
    collector: Option<String>,

    /// Target hostname
    #[arg(short = 'n', long)]
    hostname: Option<String>,

    /// Network address (defaults to hostname)
    #[arg(short = 'a', long)]
    netaddr: Option<String>,

    /// SSH user
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// SSH password
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// SSH/SFTP key file path
    #[arg(short = 'k', long)]
    key: Option<PathBuf>,

    /// Log files, format name:path,name:path
    #[arg(short = 'l', long)]
    log_files: Option<String>,

    /// Database user
    #[arg(long)]
    db_user: Option<String>,

    /// Database password
    #[arg(long)]
    db_password: Option<String>,

    /// Database port
    #[arg(long)]
    db_port: Option<u16>,

    /// Per-run timeout
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Path for state data
    #[arg(long, default_value = "./statedb", env = "SONDE_DATA_PATH")]
    data_path: PathBuf,

    /// Run under the cron scheduler with jobs from --config
    #[arg(long)]
    sched: bool,

    /// Scheduler job file (YAML)
    #[arg(long, env = "SONDE_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    fn node(&self) -> Result<Node, Box<dyn std::error::Error>> {
        let hostname = self
            .hostname
            .clone()
            .ok_or("one-shot mode requires --hostname")?;
        let mut node = Node::new(hostname);
        if let Some(netaddr) = &self.netaddr {
            node.netaddr = netaddr.clone();
        }
        node.ssh_user = self.user.clone();
        node.ssh_password = self.password.clone();
        if let Some(path) = &self.key {
            node.ssh_key = Some(std::fs::read_to_string(path)?);
        }
        node.db_user = self.db_user.clone();
        node.db_password = self.db_password.clone();
        node.db_port = self.db_port;
        if let Some(raw) = &self.log_files {
            node.files = parse_log_files(raw)?;
        }
        Ok(node)
    }
}

fn parse_log_files(raw: &str) -> Result<HashMap<String, String>, Box<dyn std::error::Error>> {
    let mut files = HashMap::new();
    for pair in raw.split(',').filter(|p| !p.is_empty()) {
        let (name, path) = pair
            .split_once(':')
            .ok_or_else(|| format!("bad log file spec: {pair}"))?;
        files.insert(name.to_string(), path.to_string());
    }
    Ok(files)
}

/// Resolve a path to a single collector or all members of a group.
fn resolve(registry: &Registry, path: &str) -> Result<Vec<Arc<Collector>>, RegistryError> {
    match registry.get(path) {
        Ok(collector) => Ok(vec![collector]),
        Err(RegistryError::NotFound(_)) => registry.group(path),
        Err(e) => Err(e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut registry = Registry::new();
    local::register(&mut registry)?;
    let registry = Arc::new(registry);

    let store: Arc<dyn Store> = Arc::new(SledStore::open(&cli.data_path)?);

    // Stdout sink for emitted events.
    let (tx, mut rx) = mpsc::channel::<sonde::Event>(64);
    let sink = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{}", serde_json::Value::Object(event));
        }
    });

    if cli.sched {
        let config_path = cli.config.as_ref().ok_or("--sched requires --config")?;
        let config = AppConfig::load(config_path)?;
        config.validate(&registry)?;

        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            store,
            config.scheduler.max_tasks,
            config.scheduler.grace,
            tx,
        )
        .await?;

        for job in &config.jobs {
            let node = Arc::new(
                config
                    .node(&job.node)
                    .cloned()
                    .ok_or_else(|| format!("unknown node {}", job.node))?,
            );
            for collector in resolve(&registry, &job.collector)? {
                scheduler
                    .add_job(&job.cron, collector.name(), Arc::clone(&node), job.timeout)
                    .await?;
            }
        }

        scheduler.start().await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");
        scheduler.stop().await?;
        // The cron engine may keep sender clones alive internally.
        sink.abort();
        return Ok(());
    } else {
        let path = cli
            .collector
            .as_ref()
            .ok_or("either --collector or --sched is required")?;
        let collectors = resolve(&registry, path)?;
        let node = Arc::new(cli.node()?);
        let root = CancellationToken::new();

        let mut runs = tokio::task::JoinSet::new();
        for collector in collectors {
            let session = Arc::new(Session::new(
                collector.name(),
                Arc::clone(&node),
                Arc::clone(&store),
                cli.timeout,
                &root,
            )?);
            let registry = Arc::clone(&registry);
            let out = tx.clone();
            runs.spawn(async move {
                collector.start(&registry, &session, out).await;
            });
        }
        drop(tx);
        while runs.join_next().await.is_some() {}
    }

    sink.await?;
    Ok(())
}
