mod commands;
mod logging;

use anyhow::Result;
use chrono::Utc;
use commands::Command;
use database::{DurableStore, MemoryStore, PgStore};
use mesh_relay::{NodeHello, RelayEngine, RelayNode, RetentionPolicy, TcpTransport, Transport};
use shared::config::{Config, NodeConfig};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (also loads .env, so it comes before logging)
    let config = Config::from_env()?;
    logging::init(logging::LogFormat::from_env())?;

    info!(
        device_id = %config.node.device_id,
        nickname = %config.node.nickname,
        listen_addr = %config.node.listen_addr,
        scan = config.node.scan_frequency.display_name(),
        "Starting mesh relay node"
    );

    let store: Arc<dyn DurableStore> = match &config.database {
        Some(db) => {
            let store = PgStore::connect(&db.url, db.max_connections).await?;
            info!("Postgres store ready");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let cancel = CancellationToken::new();

    let hello = NodeHello {
        device_id: config.node.device_id.clone(),
        name: config.node.nickname.clone(),
        group_id: config.node.group_id.clone(),
    };
    let (transport, events) = TcpTransport::bind(
        &config.node.listen_addr,
        hello,
        config.node.seed_peers.clone(),
        cancel.clone(),
    )
    .await?;

    let engine = Arc::new(RelayEngine::new(
        config.node.device_id.clone(),
        config.relay.clone(),
        store,
        transport.clone(),
    ));
    engine.restore().await?;
    info!(
        seen_ids = engine.ledger().len(),
        messages = engine.message_count().await?,
        "Relay engine restored"
    );

    transport
        .start_scanning(config.node.scan_frequency.interval())
        .await?;

    let retention = Arc::new(RetentionPolicy::new(engine.clone(), config.retention.clone()));
    let retention_task = retention.clone().spawn(cancel.clone());

    let node = RelayNode::new(engine.clone(), config.node.shutdown_timeout());
    let node_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { node.run(events, cancel).await })
    };

    let console_task = tokio::spawn(read_console(
        engine.clone(),
        retention,
        config.node.clone(),
        cancel.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    cancel.cancel();

    node_task.await??;
    retention_task.await?;
    console_task.abort();

    info!("Mesh relay node stopped");
    Ok(())
}

async fn read_console(
    engine: Arc<RelayEngine>,
    retention: Arc<RetentionPolicy>,
    node: NodeConfig,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(command) = commands::parse(&line) else {
                        continue;
                    };
                    if let Err(e) = run_command(command, &engine, &retention, &node).await {
                        warn!(error = %e, "Command failed");
                    }
                }
                Ok(None) => {
                    info!("Console input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read console input");
                    break;
                }
            }
        }
    }
}

async fn run_command(
    command: Command,
    engine: &RelayEngine,
    retention: &RetentionPolicy,
    node: &NodeConfig,
) -> Result<()> {
    match command {
        Command::Send(content) => {
            let message = engine
                .originate(content, node.nickname.clone(), node.group_id.clone(), Utc::now())
                .await?;
            println!("sent {} (ttl {})", message.id, message.ttl);
        }
        Command::Peers => {
            let peers = engine.registry().all();
            println!(
                "{} peers, {} connected",
                peers.len(),
                engine.registry().connected_count()
            );
            for peer in peers {
                println!(
                    "  {:<36} {:<16} {:<12} {}",
                    peer.device_id,
                    peer.name,
                    peer.status,
                    peer.last_seen.to_rfc3339()
                );
            }
        }
        Command::Messages { group_id } => {
            let messages = engine.messages(group_id.as_deref()).await?;
            println!("{} messages", messages.len());
            for message in messages {
                println!(
                    "  [{}] {}{}: {}",
                    message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    message.sender_name,
                    if message.is_local { " (me)" } else { "" },
                    message.content
                );
            }
        }
        Command::Stats => {
            let stats = engine.stats();
            println!(
                "accepted {} duplicates {} forwarded {} terminal {} send_failures {} store_failures {} relay {}",
                stats.accepted,
                stats.duplicates,
                stats.forwarded,
                stats.terminal,
                stats.send_failures,
                stats.store_failures,
                if engine.relay_enabled() { "on" } else { "off" }
            );
        }
        Command::Relay(enabled) => {
            engine.set_relay_enabled(enabled);
            println!("relay {}", if enabled { "on" } else { "off" });
        }
        Command::Sweep => {
            let report = retention.sweep(Utc::now()).await?;
            println!(
                "removed {} messages, {} seen ids, {} peers",
                report.messages_removed, report.seen_removed, report.peers_removed
            );
        }
        Command::Help => println!("{}", commands::HELP),
    }
    Ok(())
}
