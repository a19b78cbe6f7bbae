//! Peer-link handlers: mesh membership, address gossip, liveness.

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info};

use crate::crypto::keys;
use crate::directory::{Link, PeerInfo};
use crate::envelope::{frame, verify_payload, Envelope, ErrorCode};
use crate::handlers::send_error;
use crate::node::Ctx;

/// A peer connected to us and wants into the mesh. Resolve duplicate
/// connections deterministically, register it, welcome it with the peer
/// list, tell the rest of the mesh, and seed it with known presence.
pub async fn hello_join(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    let sid = env.from.clone();
    if sid == ctx.server_id {
        link.close("self-connection");
        return Ok(());
    }

    // duplicate connection tie-break: the node with the lexicographically
    // smaller id keeps its outgoing link and refuses the incoming one
    let duplicate = ctx
        .dir
        .peers
        .get(&sid)
        .map(|existing| existing.conn_id != link.conn_id)
        .unwrap_or(false);
    if duplicate {
        if ctx.server_id < sid {
            debug!("tie-break against {sid}: dropping their incoming link");
            link.close("tie-break");
            return Ok(());
        }
        debug!("tie-break against {sid}: replacing our older link");
        if let Some(old) = ctx.dir.peers.get(&sid) {
            old.close("tie-break");
        }
    }

    let (Some(host), Some(port), Some(pubkey_pem)) = (
        env.payload_str("host"),
        env.payload_u16("port"),
        env.payload_str("pubkey"),
    ) else {
        send_error(ctx, link, ErrorCode::UnknownType, "bad join payload");
        return Ok(());
    };
    let pubkey = match keys::public_key_from_pem(pubkey_pem) {
        Ok(key) => key,
        Err(_) => {
            send_error(ctx, link, ErrorCode::BadKey, "unparseable peer pubkey");
            return Ok(());
        }
    };

    ctx.dir.peer_pubkeys.insert(sid.clone(), pubkey);
    ctx.dir
        .attach_peer(&sid, link.clone(), Some((host.to_string(), port)));
    info!("peer joined: {sid} at {host}:{port}");

    let welcome = Envelope::signed(
        frame::SERVER_WELCOME,
        &ctx.server_id,
        &sid,
        json!({
            "assigned_id": sid,
            "peers": ctx.dir.snapshot_peers(),
            "pubkey": ctx.public_pem,
        }),
        &ctx.signing_key,
    );
    let _ = link.send(&welcome);

    // tell everyone else where we are reachable
    let announce = Envelope::signed(
        frame::SERVER_ANNOUNCE,
        &ctx.server_id,
        frame::BROADCAST,
        json!({"host": ctx.cfg.advertised_host(), "port": ctx.listen_port}),
        &ctx.signing_key,
    );
    for peer in ctx.dir.peers.iter() {
        if peer.key() != &sid {
            let _ = peer.value().send(&announce);
        }
    }

    // state transfer: everything we know about user presence, oldest first
    for advertise in ctx.dir.known_user_advertises() {
        let _ = link.send(&advertise);
    }
    Ok(())
}

/// The far side of our own join. Self-certifying: the signature is checked
/// against the key enclosed in the payload, which we then pin for the peer.
pub async fn welcome(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    let sid = env.from.clone();
    let Some(pubkey_pem) = env.payload_str("pubkey") else {
        send_error(ctx, link, ErrorCode::BadKey, "welcome without pubkey");
        return Ok(());
    };
    let pubkey = match keys::public_key_from_pem(pubkey_pem) {
        Ok(key) => key,
        Err(_) => {
            send_error(ctx, link, ErrorCode::BadKey, "unparseable peer pubkey");
            return Ok(());
        }
    };
    if !verify_payload(&pubkey, &env.payload, &env.sig) {
        send_error(ctx, link, ErrorCode::InvalidSig, "bad server signature");
        return Ok(());
    }

    // mutual-dial race: their join may already hold the peer slot. Same
    // tie-break as the inbound path, from the outbound side: the smaller id
    // keeps its outgoing link, the larger id yields to the incoming one.
    let duplicate = ctx
        .dir
        .peers
        .get(&sid)
        .map(|existing| existing.conn_id != link.conn_id)
        .unwrap_or(false);
    if duplicate {
        if ctx.server_id > sid {
            debug!("tie-break against {sid}: keeping their incoming link");
            link.close("tie-break");
            return Ok(());
        }
        debug!("tie-break against {sid}: replacing our older link");
        if let Some(old) = ctx.dir.peers.get(&sid) {
            old.close("tie-break");
        }
    }

    ctx.dir.peer_pubkeys.insert(sid.clone(), pubkey);
    ctx.dir.attach_peer(&sid, link.clone(), None);
    info!("welcomed into mesh by {sid}");

    // dial any mesh member we have not met yet so the mesh stays full
    if let Some(peers) = env.payload.get("peers").and_then(|v| v.as_array()) {
        for value in peers {
            let Ok(info) = serde_json::from_value::<PeerInfo>(value.clone()) else {
                continue;
            };
            if info.id == ctx.server_id || info.id == sid || ctx.dir.peers.contains_key(&info.id) {
                continue;
            }
            debug!("learned mesh member {} at {}:{}", info.id, info.host, info.port);
            ctx.dir
                .server_addrs
                .insert(info.id.clone(), (info.host.clone(), info.port));
            crate::mesh::dial_if_idle(ctx, info.host, info.port);
        }
    }
    Ok(())
}

/// Address refresh from an established peer; must carry that peer's own
/// signature, verified against the key pinned at join time.
pub async fn announce(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    let sid = env.from.clone();
    let verified = ctx
        .dir
        .peer_pubkeys
        .get(&sid)
        .map(|key| verify_payload(key.value(), &env.payload, &env.sig))
        .unwrap_or(false);
    if !verified {
        send_error(ctx, link, ErrorCode::InvalidSig, "bad server signature");
        return Ok(());
    }
    if let (Some(host), Some(port)) = (env.payload_str("host"), env.payload_u16("port")) {
        ctx.dir
            .server_addrs
            .insert(sid.clone(), (host.to_string(), port));
        ctx.dir.note_peer_seen(&sid);
    }
    Ok(())
}

pub async fn heartbeat(ctx: &Ctx, _link: &Link, env: Envelope) -> Result<()> {
    if ctx.dir.peers.contains_key(&env.from) {
        ctx.router.note_peer_seen(&env.from);
    }
    Ok(())
}
