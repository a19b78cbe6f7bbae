//! User-link handlers: attachment, presence gossip, and the small local
//! directory queries.

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info};

use crate::crypto::keys;
use crate::directory::{Link, Location, Role};
use crate::envelope::{frame, verify_payload, Envelope, ErrorCode};
use crate::handlers::{send_ack, send_error};
use crate::node::Ctx;
use crate::storage::{UserRecord, PUBLIC_GROUP};

/// A user connected. Policy for a duplicate id is configurable: strict
/// deployments refuse the newcomer, everyone else replaces the older link.
pub async fn hello(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    let uid = env.from.clone();

    let old = ctx.dir.local_users.get(&uid).map(|l| l.value().clone());
    if let Some(old) = old {
        if old.conn_id != link.conn_id {
            if ctx.cfg.strict_user_hello {
                send_error(ctx, link, ErrorCode::NameInUse, "user id already connected");
                link.close("name in use");
                return Ok(());
            }
            info!("user {uid} reconnected, replacing older link");
            old.close("replaced");
        }
    }

    if let Some(pem) = env.payload_str("pubkey") {
        match keys::public_key_from_pem(pem) {
            Ok(key) => {
                ctx.dir.user_pubkeys.insert(uid.clone(), key);
            }
            Err(_) => {
                send_error(ctx, link, ErrorCode::BadKey, "unparseable user pubkey");
                link.close("bad key");
                return Ok(());
            }
        }
    }

    ctx.dir.attach_user(&uid, link.clone());
    ctx.router.record_presence(&uid, Location::Local);
    info!("user connected: {uid}");
    send_ack(ctx, link, frame::USER_HELLO);

    // seed the newcomer with everyone else we know about
    for advertise in ctx.dir.known_user_advertises() {
        if advertise.payload_str("user_id") != Some(uid.as_str()) {
            let _ = link.send(&advertise);
        }
    }
    Ok(())
}

/// Presence gossip. The envelope is self-certifying: its signature verifies
/// against the key carried in its own payload, so it can cross the mesh
/// unchanged and dedupe on its fingerprint. Where the user lives is derived
/// from the ingress link, not from the envelope.
pub async fn advertise(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    if ctx.router.already_seen(&env) {
        return Ok(());
    }

    let (Some(user_id), Some(pubkey_pem)) =
        (env.payload_str("user_id"), env.payload_str("pubkey"))
    else {
        send_error(ctx, link, ErrorCode::BadKey, "missing fields");
        return Ok(());
    };
    let user_id = user_id.to_string();
    if env.sig.is_empty() {
        send_error(ctx, link, ErrorCode::BadKey, "missing fields");
        return Ok(());
    }
    if link.role == Role::User && user_id != link.id {
        send_error(ctx, link, ErrorCode::BadKey, "advertise for another user");
        return Ok(());
    }
    let pubkey = match keys::public_key_from_pem(pubkey_pem) {
        Ok(key) => key,
        Err(_) => {
            send_error(ctx, link, ErrorCode::BadKey, "unparseable user pubkey");
            return Ok(());
        }
    };
    if !verify_payload(&pubkey, &env.payload, &env.sig) {
        send_error(ctx, link, ErrorCode::InvalidSig, "bad signature");
        return Ok(());
    }

    ctx.dir.user_pubkeys.insert(user_id.clone(), pubkey);
    ctx.dir.cache_advertise(&user_id, env.clone());
    persist_user(ctx, &user_id, &env);

    match link.role {
        Role::User => {
            ctx.router.record_presence(&user_id, Location::Local);
        }
        Role::Server => {
            // the user roamed: a link we still hold for them is stale
            let stale = ctx.dir.local_users.get(&user_id).map(|l| l.value().clone());
            if let Some(stale) = stale {
                info!("user {user_id} now lives on {}, replacing local link", link.id);
                ctx.dir.detach_user(&user_id, stale.conn_id);
                stale.close("replaced");
            }
            ctx.router
                .record_presence(&user_id, Location::Remote(link.id.clone()));
        }
    }

    send_ack(ctx, link, frame::USER_ADVERTISE);

    // local users need the key material to encrypt to the newcomer
    for user in ctx.dir.local_users.iter() {
        if user.value().conn_id != link.conn_id {
            let _ = user.value().send(&env);
        }
    }
    // gossip onward, never back out the ingress
    for peer in ctx.dir.peers.iter() {
        if peer.value().conn_id != link.conn_id {
            let _ = peer.value().send(&env);
        }
    }
    Ok(())
}

fn persist_user(ctx: &Ctx, user_id: &str, env: &Envelope) {
    let record = UserRecord {
        pubkey: env.payload_str("pubkey").unwrap_or_default().to_string(),
        privkey_store: env.payload_str("privkey_store").unwrap_or_default().to_string(),
        pake_password: env.payload_str("pake_password").unwrap_or_default().to_string(),
        meta: env.payload.get("meta").cloned().unwrap_or(json!({})),
        version: env
            .payload
            .get("version")
            .and_then(|v| v.as_u64())
            .unwrap_or(1),
    };
    if let Err(e) = ctx.store.upsert_user(user_id, record) {
        debug!("could not persist user {user_id}: {e}");
    }
    if !ctx.store.list_group_members(PUBLIC_GROUP).contains(&user_id.to_string()) {
        if let Err(e) = ctx.store.add_member(PUBLIC_GROUP, user_id, "member", "") {
            debug!("could not add {user_id} to {PUBLIC_GROUP}: {e}");
        }
    }
}

/// Departure gossip. A `location` of "local" is relative to whoever sent the
/// frame, so over a server link it means that peer. Removal only happens
/// (and only propagates) when the advertised location matches what we hold,
/// which also stops the gossip from cycling.
pub async fn remove(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    let (Some(user_id), Some(location)) =
        (env.payload_str("user_id"), env.payload_str("location"))
    else {
        send_error(ctx, link, ErrorCode::BadKey, "missing fields");
        return Ok(());
    };
    let user_id = user_id.to_string();

    // the user's own signature is required no matter who relayed the frame;
    // an unsigned remove from a peer is dropped like any other forgery
    if env.sig.is_empty() {
        send_error(ctx, link, ErrorCode::InvalidSig, "signature required");
        return Ok(());
    }
    let known = ctx.dir.user_pubkeys.get(&user_id).map(|k| k.value().clone());
    let Some(key) = known else {
        send_error(ctx, link, ErrorCode::BadKey, "unknown user");
        return Ok(());
    };
    if !verify_payload(&key, &env.payload, &env.sig) {
        send_error(ctx, link, ErrorCode::InvalidSig, "bad signature");
        return Ok(());
    }

    let advertised = match (location, link.role) {
        (Location::LOCAL_WIRE, Role::Server) => Location::Remote(link.id.clone()),
        (wire, _) => Location::from_wire(wire),
    };

    let matches = ctx
        .dir
        .user_locations
        .get(&user_id)
        .map(|loc| *loc.value() == advertised)
        .unwrap_or(false);
    if !matches {
        return Ok(());
    }

    info!("user departed: {user_id} (was {})", advertised.as_wire());
    ctx.dir.user_locations.remove(&user_id);
    ctx.dir.remove_advertise(&user_id);
    if advertised == Location::Local {
        if let Some((_, old)) = ctx.dir.local_users.remove(&user_id) {
            old.close("removed");
        }
    }

    for peer in ctx.dir.peers.iter() {
        if peer.value().conn_id != link.conn_id {
            let _ = peer.value().send(&env);
        }
    }
    Ok(())
}

/// Who is connected to this node right now. Local-only.
pub async fn cmd_list(ctx: &Ctx, link: &Link, _env: Envelope) -> Result<()> {
    let mut users: Vec<String> = ctx.dir.local_users.iter().map(|u| u.key().clone()).collect();
    users.sort();
    let reply = Envelope::signed(
        frame::USER_LIST,
        &ctx.server_id,
        &link.id,
        json!({"users": users}),
        &ctx.signing_key,
    );
    let _ = link.send(&reply);
    Ok(())
}

pub async fn dir_get_pubkey(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    let Some(user_id) = env.payload_str("user_id") else {
        send_error(ctx, link, ErrorCode::UserNotFound, "missing user_id");
        return Ok(());
    };
    let pem = ctx.store.get_pubkey(user_id).or_else(|| {
        ctx.dir
            .user_pubkeys
            .get(user_id)
            .and_then(|k| keys::public_key_to_pem(k.value()).ok())
    });
    match pem {
        Some(pubkey) => {
            let reply = Envelope::signed(
                frame::DIR_PUBKEY,
                &ctx.server_id,
                &link.id,
                json!({"user_id": user_id, "pubkey": pubkey}),
                &ctx.signing_key,
            );
            let _ = link.send(&reply);
        }
        None => send_error(ctx, link, ErrorCode::UserNotFound, user_id),
    }
    Ok(())
}

pub async fn dir_get_wrapped_key(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    let Some(user_id) = env.payload_str("user_id") else {
        send_error(ctx, link, ErrorCode::UserNotFound, "missing user_id");
        return Ok(());
    };
    match ctx.store.get_wrapped_key(PUBLIC_GROUP, user_id) {
        Some(wrapped_key) => {
            let reply = Envelope::signed(
                frame::DIR_WRAPPED_PUBLIC_KEY,
                &ctx.server_id,
                &link.id,
                json!({"group": PUBLIC_GROUP, "user_id": user_id, "wrapped_key": wrapped_key}),
                &ctx.signing_key,
            );
            let _ = link.send(&reply);
        }
        None => send_error(ctx, link, ErrorCode::UserNotFound, user_id),
    }
    Ok(())
}
