use cluster_cache::cluster::{ClusterClient, HashRing, HintedHandoff, LocalNode};
use cluster_cache::config::NodeConfig;
use cluster_cache::storage::CacheEngine;
use cluster_cache::transport::{NodeServer, RemoteNode};
use std::sync::Arc;
use std::time::Duration;

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        eprintln!(
            "Usage: {} [--config <file.json>] [--bind <addr:port>] [--node-id <id>] \
             [--peer <id=addr:port>]... [--rf <n>] [--capacity <n>] [--segments <n>] \
             [--eviction lru|lfu]",
            args[0]
        );
        eprintln!(
            "Example: {} --bind 127.0.0.1:11311 --node-id a --peer b=127.0.0.1:11312",
            args[0]
        );
        std::process::exit(1);
    }

    let config = NodeConfig::from_args(&args)?;

    tracing::info!("Starting node {} on {}", config.node_id, config.bind);
    tracing::info!(
        "Engine: capacity={} segments={} eviction={:?}",
        config.engine.capacity,
        config.engine.segments,
        config.engine.eviction
    );

    // 1. Storage engine and expiry reaper:
    let engine = Arc::new(CacheEngine::new(&config.engine));
    let _reaper = engine.spawn_reaper(config.engine.reaper_interval());

    // 2. Cluster view (local node plus static peers):
    let ring = Arc::new(HashRing::new(config.virtual_nodes));
    let handoff = Arc::new(HintedHandoff::new());
    let cluster = Arc::new(ClusterClient::new(
        ring,
        config.replication_factor,
        handoff,
    )?);

    cluster.add_node(Arc::new(LocalNode::new(
        config.node_id.clone(),
        engine.clone(),
    )));

    for peer in &config.peers {
        let remote = RemoteNode::from_config(peer, &config);
        match remote.ping().await {
            Ok(()) => tracing::info!("Peer {} reachable at {}", peer.id, peer.addr),
            Err(e) => tracing::warn!("Peer {} not reachable yet: {:#}", peer.id, e),
        }
        cluster.add_node(Arc::new(remote));
    }

    if cluster.ring().node_count() < config.replication_factor {
        tracing::warn!(
            "Only {} nodes for replication factor {}, writes use a reduced quorum",
            cluster.ring().node_count(),
            config.replication_factor
        );
    }

    // 3. Spawn hinted handoff replay:
    let replay_cluster = cluster.clone();
    let handoff_interval = config.handoff_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(handoff_interval);

        loop {
            interval.tick().await;
            let pending = replay_cluster.handoff().total_pending();
            if pending == 0 {
                continue;
            }
            let applied = replay_cluster.replay_pending_hints().await;
            tracing::info!("Handoff pass: {} of {} hints delivered", applied, pending);
        }
    });

    // 4. Spawn stats reporter:
    let stats_engine = engine.clone();
    let stats_cluster = cluster.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);

        loop {
            interval.tick().await;
            let stats = stats_engine.stats();
            tracing::info!(
                "Cache stats: {} entries, hits={} misses={} hit_ratio={:.2} sets={} evictions={} expirations={}",
                stats_engine.len(),
                stats.hits,
                stats.misses,
                stats.hit_ratio(),
                stats.sets,
                stats.evictions,
                stats.expirations
            );
            for node_id in stats_cluster.handoff().pending_nodes() {
                tracing::info!(
                    "  - {} hints pending for {}",
                    stats_cluster.handoff().pending_count(&node_id),
                    node_id
                );
            }
        }
    });

    // 5. Start node server (peer traffic and routed client requests):
    let server = NodeServer::bind(config.bind, engine.clone())
        .await?
        .with_cluster(cluster.clone());
    tracing::info!("Press Ctrl+C to shutdown");

    tokio::select! {
        _ = server.serve() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
