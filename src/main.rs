use anyhow::{Context, Result};
use open_music_nodes::{Config, Manager, ManagerEvent};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_nodes=debug".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Nodes v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    let user_id = std::env::var("BOT_USER_ID").context("BOT_USER_ID must be set")?;

    // Without a gateway shard attached, voice frames are only logged.
    let gateway = Arc::new(|guild_id: &str, payload: Value| {
        info!("🎙️ Voice update para guild {}: {}", guild_id, payload);
    });
    let manager = Manager::new(config, user_id, gateway);

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&manager).await;
    }

    manager.init()?;

    let mut events = manager.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("⚠️ Señal de shutdown recibida, cerrando...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Se perdieron {} eventos", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.shutdown().await;
    info!("👋 Hasta luego");
    Ok(())
}

fn log_event(event: &ManagerEvent) {
    match event {
        ManagerEvent::NodeConnect { node } => info!("✅ Nodo {} conectado", node),
        ManagerEvent::NodeReconnect { node, attempt } => {
            info!("🔄 Nodo {} reintentando (intento {})", node, attempt)
        }
        ManagerEvent::NodeDisconnect { node, code } => {
            warn!("Nodo {} desconectado ({:?})", node, code)
        }
        ManagerEvent::NodeError { node, error, fatal: true } => {
            error!("❌ Nodo {} abandonado: {}", node, error)
        }
        ManagerEvent::NodeError { node, error, .. } => warn!("Nodo {}: {}", node, error),
        ManagerEvent::TrackStart { guild_id, track } => {
            if let Some(track) = track {
                info!("🎵 {} en guild {}", track, guild_id);
            }
        }
        other => info!("{:?}", other),
    }
}

/// Prints `OK` when every configured node answers its info endpoint.
async fn health_check(manager: &Manager) -> Result<()> {
    let mut healthy = true;

    for descriptor in &manager.config().nodes {
        let node = manager.add_node(descriptor.clone())?;
        match manager.get_node_info(node.name()).await {
            Ok(info) => info!("Nodo {}: Lavalink {}", node.name(), info.version.semver),
            Err(e) => {
                error!("Nodo {} no responde: {}", node.name(), e);
                healthy = false;
            }
        }
    }

    manager.shutdown().await;
    if healthy {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Nodos sin respuesta");
    }
}
