//! Multi-node integration tests: real nodes on ephemeral ports inside one
//! process, driven through the reference client.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, timeout, Instant};

use socp::client::{build, Client, ClientIdentity, Event};
use socp::config::Config;
use socp::crypto::{b64, oaep};
use socp::directory::Location;
use socp::node::{self, NodeHandle};

const KEY_BITS: usize = 2048;
const DEADLINE: Duration = Duration::from_secs(15);
const QUIET: Duration = Duration::from_millis(400);

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("socp-net-{tag}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn spawn_node(tag: &str, bootstrap: Vec<String>) -> NodeHandle {
    let cfg = Config {
        listen_host: "127.0.0.1".into(),
        listen_port: 0,
        storage_dir: scratch_dir(tag),
        bootstrap_peers: bootstrap,
        key_bits: KEY_BITS,
        ..Config::default()
    };
    node::spawn(cfg).await.expect("node failed to start")
}

async fn connect_client(node: &NodeHandle) -> Client {
    let identity = ClientIdentity::generate(KEY_BITS).unwrap();
    Client::connect("127.0.0.1", node.local_addr.port(), identity)
        .await
        .expect("client failed to connect")
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Drain events until the predicate picks one; everything else is dropped.
async fn event_matching<T>(client: &mut Client, mut pick: impl FnMut(Event) -> Option<T>) -> T {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        let remaining = deadline - Instant::now();
        let Ok(Some(event)) = timeout(remaining, client.recv_event()).await else {
            break;
        };
        if let Some(found) = pick(event) {
            return found;
        }
    }
    panic!("timed out waiting for a matching event");
}

/// Assert no event matching the predicate arrives within the quiet window.
async fn assert_quiet(client: &mut Client, mut unwanted: impl FnMut(&Event) -> bool, what: &str) {
    let deadline = Instant::now() + QUIET;
    while Instant::now() < deadline {
        let remaining = deadline - Instant::now();
        match timeout(remaining, client.recv_event()).await {
            Ok(Some(event)) => {
                assert!(!unwanted(&event), "unexpected {what}: {event:?}");
            }
            _ => return,
        }
    }
}

async fn await_peered(a: &NodeHandle, b: &NodeHandle) {
    let (actx, bctx) = (a.ctx.clone(), b.ctx.clone());
    let (aid, bid) = (a.server_id().to_string(), b.server_id().to_string());
    wait_until("nodes to peer with each other", move || {
        actx.dir.peers.contains_key(&bid) && bctx.dir.peers.contains_key(&aid)
    })
    .await;
}

#[tokio::test]
async fn direct_delivery_between_two_users_on_one_node() {
    let node = spawn_node("direct", vec![]).await;
    let alice = connect_client(&node).await;
    let mut bob = connect_client(&node).await;
    let bob_id = bob.user_id().to_string();

    // alice learns bob's key from the advertise fan-out
    {
        let alice_ref = &alice;
        let bob_uid = bob_id.clone();
        wait_until("alice to learn bob's key", move || alice_ref.knows_user(&bob_uid)).await;
    }

    alice.send_direct(&bob_id, b"hello bob").unwrap();
    let plaintext = event_matching(&mut bob, |event| match event {
        Event::Delivered { plaintext, .. } => Some(plaintext),
        _ => None,
    })
    .await;
    assert_eq!(plaintext, b"hello bob");

    // exactly once: nothing else lands in the quiet window
    assert_quiet(&mut bob, |e| matches!(e, Event::Delivered { .. }), "second delivery").await;

    node.shutdown().await;
}

#[tokio::test]
async fn public_broadcast_reaches_everyone_but_the_sender() {
    let node = spawn_node("public", vec![]).await;
    let mut alice = connect_client(&node).await;
    let mut bob = connect_client(&node).await;

    {
        let (a, b) = (&alice, &bob);
        let (aid, bid) = (alice.user_id().to_string(), bob.user_id().to_string());
        wait_until("clients to learn each other", move || {
            a.knows_user(&bid) && b.knows_user(&aid)
        })
        .await;
    }

    bob.send_public(b"hi").unwrap();
    let payload = event_matching(&mut alice, |event| match event {
        Event::Public { payload, .. } => Some(payload),
        _ => None,
    })
    .await;
    assert_eq!(payload["ciphertext"], Value::from(b64::encode(b"hi")));

    assert_quiet(&mut bob, |e| matches!(e, Event::Public { .. }), "echo to the sender").await;

    node.shutdown().await;
}

#[tokio::test]
async fn presence_gossip_and_delivery_across_two_nodes() {
    let n1 = spawn_node("gossip-1", vec![]).await;
    let n2 = spawn_node(
        "gossip-2",
        vec![format!("127.0.0.1:{}", n1.local_addr.port())],
    )
    .await;
    await_peered(&n1, &n2).await;

    let alice = connect_client(&n1).await;
    let mut carol = connect_client(&n2).await;
    let carol_id = carol.user_id().to_string();

    // n1 must learn carol's home node through the advertise gossip
    {
        let ctx = n1.ctx.clone();
        let carol_uid = carol_id.clone();
        let n2_sid = n2.server_id().to_string();
        wait_until("carol's location on n1", move || {
            ctx.dir
                .user_locations
                .get(&carol_uid)
                .map(|loc| *loc.value() == Location::Remote(n2_sid.clone()))
                .unwrap_or(false)
        })
        .await;
    }
    {
        let alice_ref = &alice;
        let carol_uid = carol_id.clone();
        wait_until("alice to learn carol's key", move || alice_ref.knows_user(&carol_uid)).await;
    }

    alice.send_direct(&carol_id, b"across the mesh").unwrap();
    let plaintext = event_matching(&mut carol, |event| match event {
        Event::Delivered { plaintext, .. } => Some(plaintext),
        _ => None,
    })
    .await;
    assert_eq!(plaintext, b"across the mesh");
    assert_quiet(&mut carol, |e| matches!(e, Event::Delivered { .. }), "second delivery").await;

    // carol leaving must eventually clear her presence on n1
    carol.close();
    {
        let ctx = n1.ctx.clone();
        wait_until("carol's departure to reach n1", move || {
            !ctx.dir.user_locations.contains_key(&carol_id)
        })
        .await;
    }

    drop(alice);
    n2.shutdown().await;
    n1.shutdown().await;
}

#[tokio::test]
async fn held_frames_flush_when_presence_arrives() {
    let n1 = spawn_node("hold-1", vec![]).await;
    let n2 = spawn_node("hold-2", vec![format!("127.0.0.1:{}", n1.local_addr.port())]).await;
    await_peered(&n1, &n2).await;

    let alice = connect_client(&n1).await;
    let dave = ClientIdentity::generate(KEY_BITS).unwrap();
    let dave_id = dave.user_id.clone();

    // alice writes to dave before anyone has seen him: the frame must park
    let sealed = oaep::encrypt_large(&dave.public, b"early bird")
        .unwrap()
        .concat();
    let env = build::msg_direct(alice.user_id(), &dave_id, &sealed, &alice.identity().private);
    alice.send_frame(&env).unwrap();
    {
        let ctx = n1.ctx.clone();
        let uid = dave_id.clone();
        wait_until("the frame to be parked", move || ctx.router.held_count(&uid) == 1).await;
    }

    // dave appears on n2; the advertise flushes the queue through the mesh
    let mut dave = Client::connect("127.0.0.1", n2.local_addr.port(), dave)
        .await
        .unwrap();
    let plaintext = event_matching(&mut dave, |event| match event {
        Event::Delivered { plaintext, .. } => Some(plaintext),
        _ => None,
    })
    .await;
    assert_eq!(plaintext, b"early bird");
    assert_eq!(n1.ctx.router.held_count(&dave_id), 0);

    drop(alice);
    n2.shutdown().await;
    n1.shutdown().await;
}

#[tokio::test]
async fn duplicate_frames_are_suppressed() {
    let node = spawn_node("dedupe", vec![]).await;
    let alice = connect_client(&node).await;
    let mut bob = connect_client(&node).await;

    {
        let (a, b) = (&alice, &bob);
        let (aid, bid) = (alice.user_id().to_string(), bob.user_id().to_string());
        wait_until("clients to learn each other", move || {
            a.knows_user(&bid) && b.knows_user(&aid)
        })
        .await;
    }

    // the same envelope injected back-to-back: identical fingerprint
    let env = build::msg_public(alice.user_id(), None, b"once only", &alice.identity().private);
    alice.send_frame(&env).unwrap();
    alice.send_frame(&env).unwrap();

    let first = event_matching(&mut bob, |event| match event {
        Event::Public { payload, .. } => Some(payload),
        _ => None,
    })
    .await;
    assert_eq!(first["ciphertext"], Value::from(b64::encode(b"once only")));
    assert_quiet(&mut bob, |e| matches!(e, Event::Public { .. }), "duplicate broadcast").await;

    node.shutdown().await;
}

#[tokio::test]
async fn strict_policy_rejects_a_second_hello() {
    let storage = scratch_dir("strict");
    let cfg = Config {
        listen_host: "127.0.0.1".into(),
        listen_port: 0,
        storage_dir: storage,
        strict_user_hello: true,
        key_bits: KEY_BITS,
        ..Config::default()
    };
    let node = node::spawn(cfg).await.unwrap();

    let identity = ClientIdentity::generate(KEY_BITS).unwrap();
    let first = Client::connect("127.0.0.1", node.local_addr.port(), identity.clone())
        .await
        .unwrap();

    let mut second = Client::connect("127.0.0.1", node.local_addr.port(), identity)
        .await
        .unwrap();
    let code = event_matching(&mut second, |event| match event {
        Event::ProtocolError { code, .. } => Some(code),
        _ => None,
    })
    .await;
    assert_eq!(code, "NAME_IN_USE");

    drop(first);
    node.shutdown().await;
}

#[tokio::test]
async fn last_login_wins_by_default() {
    let node = spawn_node("replace", vec![]).await;
    let identity = ClientIdentity::generate(KEY_BITS).unwrap();
    let uid = identity.user_id.clone();

    let mut first = Client::connect("127.0.0.1", node.local_addr.port(), identity.clone())
        .await
        .unwrap();
    event_matching(&mut first, |event| match event {
        Event::Ack { msg_ref } if msg_ref == "USER_HELLO" => Some(()),
        _ => None,
    })
    .await;

    let mut second = Client::connect("127.0.0.1", node.local_addr.port(), identity)
        .await
        .unwrap();
    event_matching(&mut second, |event| match event {
        Event::Ack { msg_ref } if msg_ref == "USER_HELLO" => Some(()),
        _ => None,
    })
    .await;

    // the older link is shut down, the newer one owns the id
    event_matching(&mut first, |event| match event {
        Event::Disconnected => Some(()),
        _ => None,
    })
    .await;
    assert!(node.ctx.dir.local_users.contains_key(&uid));

    node.shutdown().await;
}

#[tokio::test]
async fn file_transfer_end_to_end() {
    let node = spawn_node("file", vec![]).await;
    let alice = connect_client(&node).await;
    let mut bob = connect_client(&node).await;
    let bob_id = bob.user_id().to_string();

    {
        let alice_ref = &alice;
        let bob_uid = bob_id.clone();
        wait_until("alice to learn bob's key", move || alice_ref.knows_user(&bob_uid)).await;
    }

    let content: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
    let file_id = alice.send_file(&bob_id, "notes.txt", &content).unwrap();

    // bob sees start, the chunks (decrypted), then end, in order
    let mut received = Vec::new();
    let mut started = false;
    loop {
        let (payload, plaintext) = event_matching(&mut bob, |event| match event {
            Event::Delivered { payload, plaintext, .. } => Some((payload, plaintext)),
            _ => None,
        })
        .await;
        if payload.get("name").is_some() {
            assert_eq!(payload["file_id"], Value::from(file_id.clone()));
            assert_eq!(payload["name"], "notes.txt");
            assert_eq!(payload["size"], Value::from(content.len() as u64));
            started = true;
        } else if payload.get("index").is_some() {
            assert!(started, "chunk before start");
            received.extend_from_slice(&plaintext);
        } else {
            // FILE_END closes the stream
            assert_eq!(payload["file_id"], Value::from(file_id.clone()));
            break;
        }
    }
    assert_eq!(received, content);

    drop(alice);
    node.shutdown().await;
}

#[tokio::test]
async fn user_list_names_local_users_only() {
    let n1 = spawn_node("list-1", vec![]).await;
    let n2 = spawn_node("list-2", vec![format!("127.0.0.1:{}", n1.local_addr.port())]).await;
    await_peered(&n1, &n2).await;

    let mut alice = connect_client(&n1).await;
    let carol = connect_client(&n2).await;
    let (alice_id, carol_id) = (alice.user_id().to_string(), carol.user_id().to_string());

    {
        let alice_ref = &alice;
        let carol_uid = carol_id.clone();
        wait_until("alice to learn carol", move || alice_ref.knows_user(&carol_uid)).await;
    }

    alice.list_users().unwrap();
    let users = event_matching(&mut alice, |event| match event {
        Event::UserList { users } => Some(users),
        _ => None,
    })
    .await;
    assert!(users.contains(&alice_id));
    assert!(!users.contains(&carol_id), "remote users are not local");

    drop(carol);
    n2.shutdown().await;
    n1.shutdown().await;
}
