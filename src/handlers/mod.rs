//! One handler per frame type. Handlers are the only network-side mutators
//! of the directory; the transport hands them structure-checked, policy-
//! verified envelopes and reports their failures without dropping the link.

mod chat;
mod server;
mod user;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, trace};

use crate::directory::Link;
use crate::envelope::{frame, Envelope, ErrorCode};
use crate::node::Ctx;

pub async fn dispatch(ctx: &Ctx, link: &Link, env: Envelope) -> Result<()> {
    match env.kind.as_str() {
        frame::SERVER_HELLO_JOIN => server::hello_join(ctx, link, env).await,
        frame::SERVER_WELCOME => server::welcome(ctx, link, env).await,
        frame::SERVER_ANNOUNCE => server::announce(ctx, link, env).await,
        frame::HEARTBEAT => server::heartbeat(ctx, link, env).await,
        frame::USER_HELLO => user::hello(ctx, link, env).await,
        frame::USER_ADVERTISE => user::advertise(ctx, link, env).await,
        frame::USER_REMOVE => user::remove(ctx, link, env).await,
        frame::CMD_LIST => user::cmd_list(ctx, link, env).await,
        frame::DIR_GET_PUBKEY => user::dir_get_pubkey(ctx, link, env).await,
        frame::DIR_GET_WRAPPED_PUBLIC_KEY => user::dir_get_wrapped_key(ctx, link, env).await,
        frame::MSG_DIRECT | frame::FILE_START | frame::FILE_CHUNK | frame::FILE_END => {
            chat::direct(ctx, link, env).await
        }
        frame::MSG_PUBLIC_CHANNEL => chat::public_channel(ctx, link, env).await,
        frame::PEER_DELIVER => chat::peer_deliver(ctx, link, env).await,
        frame::ACK => {
            trace!("ack from {}: {:?}", env.from, env.payload.get("msg_ref"));
            Ok(())
        }
        frame::ERROR => {
            debug!(
                "error frame from {}: {} ({})",
                env.from,
                env.payload_str("code").unwrap_or("?"),
                env.payload_str("detail").unwrap_or("")
            );
            Ok(())
        }
        other => {
            send_error(ctx, link, ErrorCode::UnknownType, &format!("no_handler:{other}"));
            Ok(())
        }
    }
}

/// Best-effort ERROR reply to the offending link.
pub fn send_error(ctx: &Ctx, link: &Link, code: ErrorCode, detail: &str) {
    let env = Envelope::signed(
        frame::ERROR,
        &ctx.server_id,
        &link.id,
        json!({"code": code.as_str(), "detail": detail}),
        &ctx.signing_key,
    );
    let _ = link.send(&env);
}

pub fn send_ack(ctx: &Ctx, link: &Link, msg_ref: &str) {
    let env = Envelope::signed(
        frame::ACK,
        &ctx.server_id,
        &link.id,
        json!({"msg_ref": msg_ref}),
        &ctx.signing_key,
    );
    let _ = link.send(&env);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{build, ClientIdentity};
    use crate::config::Config;
    use crate::directory::{Link, Location, Role};
    use crate::node::{self, Ctx};
    use crate::storage::{NodeIdentity, Store};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio_tungstenite::tungstenite::Message;

    fn test_ctx() -> Ctx {
        let dir = std::env::temp_dir().join(format!("socp-handlers-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let identity = NodeIdentity::load_or_create(&dir, None, 2048).unwrap();
        let store = Store::open(&dir).unwrap();
        let cfg = Config {
            storage_dir: dir,
            key_bits: 2048,
            ..Config::default()
        };
        node::build(cfg, identity, store, 0)
    }

    fn test_link(role: Role, id: &str) -> (Link, UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        (Link::new(role, id, tx), rx)
    }

    fn drain_kinds(rx: &mut UnboundedReceiver<Message>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                kinds.push(Envelope::parse(&text).unwrap().kind);
            }
        }
        kinds
    }

    #[tokio::test]
    async fn repeated_advertise_is_idempotent() {
        let ctx = test_ctx();

        let (peer, mut peer_rx) = test_link(Role::Server, "peer-1");
        ctx.dir.attach_peer("peer-1", peer, None);
        let (ingress, _ingress_rx) = test_link(Role::Server, "peer-2");
        ctx.dir.attach_peer("peer-2", ingress.clone(), None);

        let user = ClientIdentity::generate(2048).unwrap();
        let adv = build::user_advertise(
            &user.user_id,
            &user.public_pem,
            "",
            "",
            serde_json::json!({}),
            1,
            &user.private,
        );

        dispatch(&ctx, &ingress, adv.clone()).await.unwrap();
        assert_eq!(
            *ctx.dir.user_locations.get(&user.user_id).unwrap(),
            Location::Remote("peer-2".into())
        );
        assert_eq!(ctx.dir.known_user_advertises().len(), 1);
        let first_gossip = drain_kinds(&mut peer_rx);
        assert_eq!(first_gossip, [frame::USER_ADVERTISE]);

        // the identical envelope again: directory unchanged, no second gossip
        dispatch(&ctx, &ingress, adv).await.unwrap();
        assert_eq!(
            *ctx.dir.user_locations.get(&user.user_id).unwrap(),
            Location::Remote("peer-2".into())
        );
        assert_eq!(ctx.dir.known_user_advertises().len(), 1);
        assert!(drain_kinds(&mut peer_rx).is_empty());
    }

    #[tokio::test]
    async fn tampered_advertise_is_rejected() {
        let ctx = test_ctx();
        let (ingress, mut rx) = test_link(Role::Server, "peer-1");
        ctx.dir.attach_peer("peer-1", ingress.clone(), None);

        let user = ClientIdentity::generate(2048).unwrap();
        let mut adv = build::user_advertise(
            &user.user_id,
            &user.public_pem,
            "",
            "",
            serde_json::json!({}),
            1,
            &user.private,
        );
        adv.payload["meta"] = serde_json::json!({"name": "mallory"});

        dispatch(&ctx, &ingress, adv).await.unwrap();
        assert!(!ctx.dir.user_locations.contains_key(&user.user_id));
        let kinds = drain_kinds(&mut rx);
        assert_eq!(kinds, [frame::ERROR]);
    }

    #[tokio::test]
    async fn unsigned_remove_from_a_peer_is_rejected() {
        let ctx = test_ctx();
        let (peer, mut peer_rx) = test_link(Role::Server, "peer-1");
        ctx.dir.attach_peer("peer-1", peer, None);
        let (ingress, mut ingress_rx) = test_link(Role::Server, "peer-2");
        ctx.dir.attach_peer("peer-2", ingress.clone(), None);

        let user = ClientIdentity::generate(2048).unwrap();
        let adv = build::user_advertise(
            &user.user_id,
            &user.public_pem,
            "",
            "",
            serde_json::json!({}),
            1,
            &user.private,
        );
        dispatch(&ctx, &ingress, adv).await.unwrap();
        drain_kinds(&mut peer_rx);
        drain_kinds(&mut ingress_rx);

        // forged: no signature, but the location matches the directory
        let forged = Envelope::new(
            frame::USER_REMOVE,
            &user.user_id,
            "",
            serde_json::json!({"user_id": user.user_id, "location": "local"}),
        );
        dispatch(&ctx, &ingress, forged).await.unwrap();
        assert!(ctx.dir.user_locations.contains_key(&user.user_id));
        assert_eq!(drain_kinds(&mut ingress_rx), [frame::ERROR]);
        assert!(drain_kinds(&mut peer_rx).is_empty());

        // the user's own signed removal is honoured and gossiped
        let signed = build::user_remove(&user.user_id, "local", &user.private);
        dispatch(&ctx, &ingress, signed).await.unwrap();
        assert!(!ctx.dir.user_locations.contains_key(&user.user_id));
        assert_eq!(drain_kinds(&mut peer_rx), [frame::USER_REMOVE]);
    }

    fn welcome_from(ctx: &Ctx, sid: &str) -> Envelope {
        let (private, public) = crate::crypto::keys::generate_keypair(2048).unwrap();
        let pem = crate::crypto::keys::public_key_to_pem(&public).unwrap();
        Envelope::signed(
            frame::SERVER_WELCOME,
            sid,
            &ctx.server_id,
            serde_json::json!({"assigned_id": ctx.server_id, "peers": [], "pubkey": pem}),
            &private,
        )
    }

    #[tokio::test]
    async fn welcome_resolves_duplicate_links_deterministically() {
        let ctx = test_ctx();

        // peer id sorts above ours ("~" > any uuid char): our outbound wins
        let big = "~peer";
        let (standing, _standing_rx) = test_link(Role::Server, big);
        ctx.dir.attach_peer(big, standing, None);
        let (outbound, _outbound_rx) = test_link(Role::Server, big);
        dispatch(&ctx, &outbound, welcome_from(&ctx, big)).await.unwrap();
        assert_eq!(ctx.dir.peers.get(big).unwrap().conn_id, outbound.conn_id);

        // peer id sorts below ours ("!" < any uuid char): their incoming wins
        let small = "!peer";
        let (standing, _standing_rx) = test_link(Role::Server, small);
        let standing_conn = standing.conn_id;
        ctx.dir.attach_peer(small, standing, None);
        let (outbound, _outbound_rx) = test_link(Role::Server, small);
        dispatch(&ctx, &outbound, welcome_from(&ctx, small)).await.unwrap();
        assert_eq!(ctx.dir.peers.get(small).unwrap().conn_id, standing_conn);
    }

    #[tokio::test]
    async fn unknown_type_answers_error_but_keeps_link() {
        let ctx = test_ctx();
        let (link, mut rx) = test_link(Role::User, "u-1");
        let env = Envelope::new("NOT_A_TYPE", "u-1", "", serde_json::json!({}));
        dispatch(&ctx, &link, env).await.unwrap();
        let kinds = drain_kinds(&mut rx);
        assert_eq!(kinds, [frame::ERROR]);
    }
}
