//! Mesh maintenance: keep dialing the configured bootstrap peers until they
//! stick, heartbeat the mesh, and reap the silent.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::net;
use crate::node::Ctx;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEAD_AFTER: Duration = Duration::from_secs(45);
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

pub fn spawn_maintenance(ctx: Ctx) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(reconnect_loop(ctx.clone())),
        tokio::spawn(liveness_loop(ctx)),
    ]
}

/// Dial `host:port` unless a dial to that address is already in flight.
/// The spawned task lives as long as the resulting connection.
pub fn dial_if_idle(ctx: &Ctx, host: String, port: u16) {
    let addr = format!("{host}:{port}");
    if ctx.dialing.insert(addr.clone(), ()).is_some() {
        return;
    }
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = net::dial_peer(ctx.clone(), host, port).await {
            debug!("dial to {addr} failed: {e}");
        }
        ctx.dialing.remove(&addr);
    });
}

/// Every listed bootstrap peer we are not currently connected to gets
/// re-dialed on a fixed interval. No backoff: the list is small and static.
async fn reconnect_loop(ctx: Ctx) {
    let bootstrap = ctx.cfg.bootstrap_addrs();
    if bootstrap.is_empty() {
        return;
    }
    info!("bootstrap peers: {bootstrap:?}");
    let mut interval = tokio::time::interval(RECONNECT_INTERVAL);
    loop {
        interval.tick().await;
        for (host, port) in &bootstrap {
            if connected_to(&ctx, host, *port) {
                continue;
            }
            dial_if_idle(&ctx, host.clone(), *port);
        }
    }
}

fn connected_to(ctx: &Ctx, host: &str, port: u16) -> bool {
    ctx.dir.server_addrs.iter().any(|entry| {
        entry.value().0 == host && entry.value().1 == port && ctx.dir.peers.contains_key(entry.key())
    })
}

async fn liveness_loop(ctx: Ctx) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.tick().await; // the immediate first tick; nobody to greet yet
    loop {
        interval.tick().await;
        ctx.router.broadcast_heartbeat();
        let gone = ctx.router.reap_peers(DEAD_AFTER);
        for sid in gone {
            info!("peer {sid} reaped after silence");
        }
    }
}
