use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use worldcast_server::client::snapshot_buffer::{
    AckQueue, SharedSnapshotBuffer, SnapshotBuffer, SnapshotBufferConfig,
};
use worldcast_server::client::world::ClientWorld;
use worldcast_server::config::ReplicationConfig;
use worldcast_server::game::components::{ComponentState, MetaData, Visibility};
use worldcast_server::game::ids::{EntityId, GridId, MapId, SessionId};
use worldcast_server::game::map::Tile;
use worldcast_server::game::world::MemoryWorld;
use worldcast_server::metrics::{self, ReplicationMetrics};
use worldcast_server::net::replication::{submit, ClientEnvelope, ReplicationServer};
use worldcast_server::util::vec2::Vec2;

/// Simulated link conditions between the server and each demo client
#[derive(Debug, Clone, Copy)]
struct LinkProfile {
    loss: f64,
    duplicate: f64,
    max_delay: Duration,
}

impl LinkProfile {
    fn from_env() -> Self {
        let loss = std::env::var("DEMO_LOSS")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|p| (0.0..1.0).contains(p))
            .unwrap_or(0.05);
        let max_delay_ms = std::env::var("DEMO_MAX_DELAY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60);
        Self {
            loss,
            duplicate: 0.02,
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }
}

fn env_count(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Forward encoded snapshots with random loss, delay and duplication
fn spawn_link(profile: LinkProfile, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, buffer: SharedSnapshotBuffer) {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let (dropped, copies, delay) = {
                let mut rng = rand::thread_rng();
                let delay_ms = rng.gen_range(0..=profile.max_delay.as_millis() as u64);
                (
                    rng.gen_bool(profile.loss),
                    if rng.gen_bool(profile.duplicate) { 2 } else { 1 },
                    Duration::from_millis(delay_ms),
                )
            };
            if dropped {
                continue;
            }
            let buffer = buffer.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for _ in 0..copies {
                    if let Err(e) = buffer.ingest_bytes(&bytes) {
                        warn!("Dropping undecodable snapshot: {}", e);
                    }
                }
            });
        }
    });
}

/// Client tick loop: apply buffered snapshots and send acks back
fn spawn_client(
    session: SessionId,
    interval: Duration,
    buffer: SharedSnapshotBuffer,
    acks: AckQueue,
    inbound: crossbeam_channel::Sender<ClientEnvelope>,
) {
    tokio::spawn(async move {
        let mut world = ClientWorld::new();
        let mut ticker = tokio::time::interval(interval);
        let mut ticks: u64 = 0;
        loop {
            ticker.tick().await;
            ticks += 1;

            if let Some(states) = buffer.tick() {
                if let Err(e) = world.apply(&states.current) {
                    error!("Client {} failed to apply snapshot: {}", session, e);
                    buffer.reset();
                    world.clear();
                }
            }
            for message in acks.drain() {
                submit(&inbound, session, message);
            }

            if ticks % 150 == 0 {
                info!(
                    "Client {}: tick {} ({:?}), {} entities, {} grids",
                    &session.to_string()[..8],
                    world.applied_tick(),
                    buffer.mode(),
                    world.entity_count(),
                    world.maps().grids().count()
                );
            }
        }
    });
}

/// Hand encoded bytes to a session's link. False once the link is gone.
fn deliver(links: &[(SessionId, mpsc::UnboundedSender<Vec<u8>>)], session: SessionId, bytes: Vec<u8>) -> bool {
    match links.iter().find(|(id, _)| *id == session) {
        Some((_, tx)) => tx.send(bytes).is_ok(),
        None => true,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Worldcast replication demo v{}", env!("CARGO_PKG_VERSION"));

    let config = ReplicationConfig::load_or_default();
    if let Err(e) = config.validate() {
        anyhow::bail!("Invalid configuration: {}", e);
    }
    info!(
        "Configuration loaded: {} Hz, view size {}, culling {}",
        config.tick_rate, config.view_size, config.culling_enabled
    );

    let metrics = Arc::new(ReplicationMetrics::new());
    if let Some(port) = config.metrics_port {
        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_clone, port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let world = Arc::new(MemoryWorld::new());
    let mut server = ReplicationServer::new(&config, world.clone(), world.clone(), metrics.clone());

    // Populate one map with drifting props and a tiled default grid
    let tick = server.advance_tick();
    let map = MapId(1);
    world.create_map(map, tick)?;
    server.maps_mut().create_map(map, GridId(1), tick)?;
    server.maps_mut().with_tile_events_suppressed(|maps| -> anyhow::Result<()> {
        for x in -24..24 {
            for y in -24..24 {
                maps.set_tile(GridId(1), (x, y), Tile::new(1 + ((x + y).rem_euclid(3)) as u16), tick)?;
            }
        }
        Ok(())
    })?;

    let prop_count = env_count("DEMO_ENTITIES", 500);
    let mut props: Vec<EntityId> = Vec::with_capacity(prop_count);
    {
        let mut rng = rand::thread_rng();
        for i in 0..prop_count {
            let position = Vec2::new(rng.gen_range(-200.0..200.0), rng.gen_range(-200.0..200.0));
            let id = world.spawn(map, None, position, tick)?;
            world.set_component(
                id,
                ComponentState::MetaData(MetaData {
                    name: format!("prop-{}", i),
                    prototype: "prop".into(),
                }),
                tick,
            )?;
            if i % 10 == 0 {
                // Only visible to eyes with the second mask bit
                world.set_component(id, ComponentState::Visibility(Visibility { layer: 2 }), tick)?;
            }
            props.push(id);
        }
    }

    // Demo clients, each with its own lossy link
    let profile = LinkProfile::from_env();
    let client_count = env_count("DEMO_CLIENTS", 4);
    let mut links: Vec<(SessionId, mpsc::UnboundedSender<Vec<u8>>)> = Vec::with_capacity(client_count);
    for i in 0..client_count {
        let session = Uuid::new_v4();
        let spawn_at = Vec2::new(i as f32 * 20.0 - 30.0, 0.0);
        let eye = world.spawn(map, None, spawn_at, tick)?;
        server.connect(session, format!("client-{}", i))?;
        server.enter_game(session, Some(eye))?;

        let acks = AckQueue::default();
        let buffer = SharedSnapshotBuffer::new(
            SnapshotBuffer::new(SnapshotBufferConfig::from(&config), acks.sender()).with_metrics(metrics.clone()),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_link(profile, rx, buffer.clone());
        spawn_client(session, config.tick_interval(), buffer, acks, server.inbound());
        links.push((session, tx));
    }
    info!(
        "Running {} clients over {} entities ({:.0}% loss, up to {:?} delay)",
        client_count,
        world.entity_count(),
        profile.loss * 100.0,
        profile.max_delay
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(config.tick_interval());

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
        }

        let tick = server.advance_tick();
        {
            let mut rng = rand::thread_rng();
            for id in &props {
                if rng.gen_bool(0.1) {
                    let position = Vec2::new(rng.gen_range(-200.0..200.0), rng.gen_range(-200.0..200.0));
                    if let Err(e) = world.set_position(*id, position, tick) {
                        debug!("Move failed: {}", e);
                    }
                }
            }
            if !props.is_empty() && rng.gen_bool(0.05) {
                let victim = props.swap_remove(rng.gen_range(0..props.len()));
                let removed = world.despawn(victim);
                server.record_entity_deletions(&removed);
                let position = Vec2::new(rng.gen_range(-200.0..200.0), rng.gen_range(-200.0..200.0));
                props.push(world.spawn(map, None, position, tick)?);
            }
        }

        let mut closed: Vec<SessionId> = Vec::new();
        for (session, snapshot) in server.build_snapshots() {
            let bytes = match server.encode_snapshot(snapshot) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Failed to encode snapshot for {}: {}", session, e);
                    continue;
                }
            };
            if !deliver(&links, session, bytes) {
                warn!("Link to {} closed, dropping session", session);
                closed.push(session);
            }
        }
        for session in closed {
            links.retain(|(id, _)| *id != session);
            server.disconnect(session);
        }

        if tick.0 % (config.tick_rate * 10) == 0 {
            for expired in server.cleanup_expired() {
                links.retain(|(id, _)| *id != expired);
            }
            info!("Server tick {}, {} entities, ledger {}", tick, world.entity_count(), server.ledger().len());
        }
    }

    info!("{}", metrics.to_json());
    info!("Server stopped");
    Ok(())
}
