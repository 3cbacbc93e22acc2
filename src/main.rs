use anyhow::{Context, bail};
use kos_coherency::api;
use kos_coherency::coherency::{ClusterCoherencyEngine, MemoryBackingStore};
use kos_coherency::config::KosConfig;
use kos_coherency::dispatcher::{DeviceRegistry, HostBackend, KernelDispatcher};
use kos_coherency::membership::types::{DeviceInfo, MembershipEvent, NodeId};
use kos_coherency::membership::MembershipService;
use kos_coherency::migration::PageMigrationManager;
use kos_coherency::transport::udp::UdpTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(30);
const HOST_LANGUAGE: &str = "host";

struct Args {
    config: Option<String>,
    node_id: Option<String>,
    bind: Option<SocketAddr>,
    seeds: Vec<SocketAddr>,
    http: Option<SocketAddr>,
}

fn usage(program: &str) {
    eprintln!(
        "Usage: {} [--config <file>] [--node-id <id>] [--bind <addr:port>] [--seed <addr:port>]... [--http <addr:port>]",
        program
    );
    eprintln!("Example: {} --bind 127.0.0.1:7400", program);
    eprintln!(
        "Example: {} --bind 127.0.0.1:7401 --seed 127.0.0.1:7400",
        program
    );
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut parsed = Args {
        config: None,
        node_id: None,
        bind: None,
        seeds: Vec::new(),
        http: None,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = || {
            args.get(i + 1)
                .map(String::as_str)
                .with_context(|| format!("{} needs a value", flag))
        };

        match flag {
            "--config" => parsed.config = Some(value()?.to_string()),
            "--node-id" => parsed.node_id = Some(value()?.to_string()),
            "--bind" => parsed.bind = Some(value()?.parse()?),
            "--seed" => parsed.seeds.push(value()?.parse()?),
            "--http" => parsed.http = Some(value()?.parse()?),
            other => bail!("unknown argument {}", other),
        }
        i += 2;
    }

    Ok(parsed)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("kos-node");

    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            usage(program);
            std::process::exit(1);
        }
    };

    let mut config = match &args.config {
        Some(path) => KosConfig::from_file(path)?,
        None => KosConfig::default(),
    };
    if let Some(node_id) = args.node_id {
        config.node.node_id = Some(node_id);
    }
    if let Some(bind) = args.bind {
        config.node.bind = bind;
    }
    if !args.seeds.is_empty() {
        config.node.seeds = args.seeds;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.node.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let node_id: NodeId = config.node.resolved_node_id();
    let bind_addr = config.node.bind;

    tracing::info!("Starting node {} on {}", node_id, bind_addr);
    if !config.node.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", config.node.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Transport:
    let transport = UdpTransport::bind(
        node_id.clone(),
        bind_addr,
        config.node.seeds.clone(),
        config.transport.clone(),
    )
    .await?;
    transport.start();

    // 2. Coherency engine and page migration:
    let engine = ClusterCoherencyEngine::new(
        config.coherency.clone(),
        Arc::new(MemoryBackingStore::new()),
    );
    engine.attach_node(transport.clone());

    let migration = PageMigrationManager::new(engine.clone());
    migration.attach_node(transport.clone());

    // 3. Kernel dispatcher with the host backend:
    let devices = DeviceRegistry::new();
    devices.register_backend(Arc::new(HostBackend::with_builtins(HOST_LANGUAGE)));
    devices.register_device(DeviceInfo {
        id: "cpu0".to_string(),
        kind: "cpu".to_string(),
        languages: vec![HOST_LANGUAGE.to_string()],
    });

    let dispatcher = KernelDispatcher::new(
        transport.clone(),
        devices.clone(),
        config.dispatcher.clone(),
    );
    dispatcher.start();

    // 4. Membership:
    let membership = MembershipService::new(
        transport.clone(),
        bind_addr.to_string(),
        devices.devices(),
        config.membership.clone(),
    );
    dispatcher.follow_membership(membership.subscribe());

    let mut departures = membership.subscribe();
    let departed_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            match departures.recv().await {
                Ok(MembershipEvent::Departed(node)) => departed_engine.drop_node(&node),
                Ok(MembershipEvent::Joined(_)) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Engine missed {} membership events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    membership.start().await;

    // 5. Spawn stats reporter:
    let stats_engine = engine.clone();
    let stats_membership = membership.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);

        loop {
            interval.tick().await;
            let stats = stats_engine.stats();
            tracing::info!(
                "Cluster stats: {} active nodes, {} lines cached, {} pending transactions",
                stats_membership.active_members().len(),
                stats.cached_lines,
                stats.pending_transactions
            );
            tracing::info!(
                "  reads {}/{} (hit/miss), writes {}/{}, invalidations {}, writebacks {}, timeouts {}",
                stats.read_hits,
                stats.read_misses,
                stats.write_hits,
                stats.write_misses,
                stats.invalidations_sent,
                stats.writebacks,
                stats.timeouts
            );
        }
    });

    // 6. Start HTTP server:
    let app = api::router(
        node_id.clone(),
        engine.clone(),
        migration,
        dispatcher,
        membership.clone(),
    );
    let http_addr = args.http.unwrap_or_else(|| config.node.http_addr());

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 7. Leave cleanly:
    match engine.flush(&node_id).await {
        Ok(flushed) => tracing::info!("Flushed {} dirty lines", flushed),
        Err(e) => tracing::error!("Flush on shutdown failed: {}", e),
    }
    membership.shutdown().await;

    Ok(())
}
