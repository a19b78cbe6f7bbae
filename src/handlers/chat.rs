//! Message routing handlers. Ciphertext is opaque here; the server verifies
//! bindings at the ingress edge and moves bytes, nothing more.

use anyhow::Result;
use serde_json::Value;
use tracing::debug;

use crate::crypto::{b64, content_sig};
use crate::directory::{Link, Role};
use crate::envelope::{frame, Envelope, ErrorCode};
use crate::handlers::send_error;
use crate::node::Ctx;

/// MSG_DIRECT and the FILE_* family: route to one recipient wherever they
/// live. At the sender's edge a direct message must also carry a valid
/// content signature binding the ciphertext to its addressing; file frames
/// carry per-type bindings that the receiving client verifies end-to-end.
pub async fn direct(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    if env.kind == frame::MSG_DIRECT && link.role == Role::User {
        if !content_signature_ok(ctx, &env) {
            send_error(ctx, link, ErrorCode::InvalidSig, "bad content signature");
            return Ok(());
        }
    }
    if !ctx.router.route_to_user(&env.to, &env, true) {
        debug!("{} for {} parked or dropped", env.kind, env.to);
    }
    Ok(())
}

fn content_signature_ok(ctx: &Ctx, env: &Envelope) -> bool {
    let Some(key) = ctx.dir.user_pubkeys.get(&env.from).map(|k| k.value().clone()) else {
        return false;
    };
    let payload = &env.payload;
    // addressing inside the payload must agree with the envelope
    if let Some(inner_from) = payload.get("from").and_then(Value::as_str) {
        if inner_from != env.from {
            return false;
        }
    }
    let Some(sig) = payload.get("content_sig").and_then(Value::as_str) else {
        return false;
    };
    let Ok(ciphertext) = b64::decode(payload.get("ciphertext").and_then(Value::as_str).unwrap_or(""))
    else {
        return false;
    };
    let from = payload.get("from").and_then(Value::as_str).unwrap_or(env.from.as_str());
    let to = payload.get("to").and_then(Value::as_str).unwrap_or(env.to.as_str());
    let ts = payload.get("ts").and_then(Value::as_i64).unwrap_or(env.ts);
    content_sig::verify_direct(&key, sig, &ciphertext, from, to, ts)
}

/// Broadcast fan-out: every local user except the sender, then every peer
/// except the one it came in on. The fingerprint cache keeps a cyclic mesh
/// from echoing it forever.
pub async fn public_channel(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    if ctx.router.already_seen(&env) {
        return Ok(());
    }

    // the content signature is optional on the public channel; check it when
    // present and the sender's key is known
    if let Some(sig) = env.payload.get("content_sig").and_then(Value::as_str) {
        let key = ctx.dir.user_pubkeys.get(&env.from).map(|k| k.value().clone());
        if let Some(key) = key {
            let ct = b64::decode(env.payload.get("ciphertext").and_then(Value::as_str).unwrap_or(""))
                .unwrap_or_default();
            let from = env.payload.get("from").and_then(Value::as_str).unwrap_or(env.from.as_str());
            let ts = env.payload.get("ts").and_then(Value::as_i64).unwrap_or(env.ts);
            if !content_sig::verify_public(&key, sig, &ct, from, ts) {
                send_error(ctx, link, ErrorCode::InvalidSig, "bad content signature");
                return Ok(());
            }
        }
    }

    for user in ctx.dir.local_users.iter() {
        if user.key() != &env.from && user.value().conn_id != link.conn_id {
            let _ = user.value().send(&env);
        }
    }
    for peer in ctx.dir.peers.iter() {
        if peer.value().conn_id != link.conn_id {
            let _ = peer.value().send(&env);
        }
    }
    Ok(())
}

/// A peer forwarded us a frame for a user it believes is ours. Unwrap the
/// routing key and deliver; the inner ciphertext is never inspected.
pub async fn peer_deliver(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    if ctx.router.already_seen(&env) {
        return Ok(());
    }
    let Some(target) = env.payload_str("user_id").map(str::to_string) else {
        debug!("peer-deliver from {} without user_id", link.id);
        return Ok(());
    };
    let mut inner = env;
    if let Value::Object(map) = &mut inner.payload {
        map.remove("user_id");
    }
    if !ctx.router.route_to_user(&target, &inner, true) {
        debug!("peer-delivered frame for {target} parked or dropped");
    }
    Ok(())
}
