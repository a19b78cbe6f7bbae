//! Node assembly: wire the directory, router, verifier and storage together,
//! bind the listener, and start the maintenance tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use rsa::RsaPrivateKey;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::crypto::keys;
use crate::directory::Directory;
use crate::envelope::{make_verifier, PubKeyLookup, Verifier};
use crate::mesh;
use crate::net;
use crate::router::{Router, SendFn};
use crate::storage::{NodeIdentity, Store};

/// Shared node state, one per process. Handlers, the transport and the
/// maintenance tasks all hold it behind an `Arc`.
pub struct Node {
    pub cfg: Config,
    pub server_id: String,
    pub signing_key: Arc<RsaPrivateKey>,
    pub public_pem: String,
    /// Actual bound port, which differs from the configured one when that
    /// was 0 (ephemeral).
    pub listen_port: u16,
    pub dir: Directory,
    pub router: Router,
    pub store: Store,
    pub verifier: Verifier,
    /// Addresses with a dial in flight, so the reconnector and the mesh
    /// formation path do not race duplicate connections.
    pub dialing: DashMap<String, ()>,
}

pub type Ctx = Arc<Node>;

/// A running node: the listener task, the maintenance tasks, and the shared
/// state. Dropping the handle does not stop the node; call `shutdown`.
pub struct NodeHandle {
    pub ctx: Ctx,
    pub local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn server_id(&self) -> &str {
        &self.ctx.server_id
    }

    /// Close every link with a normal close and stop all tasks.
    pub async fn shutdown(self) {
        info!("{}: shutting down", self.ctx.server_id);
        for peer in self.ctx.dir.peers.iter() {
            peer.value().close("server shutting down");
        }
        for user in self.ctx.dir.local_users.iter() {
            user.value().close("server shutting down");
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Load (or mint) the node identity, open storage, bind the listener and
/// start everything.
pub async fn spawn(cfg: Config) -> Result<NodeHandle> {
    let identity = NodeIdentity::load_or_create(
        &cfg.storage_dir,
        cfg.server_id.as_deref(),
        cfg.key_bits,
    )?;
    let store = Store::open(&cfg.storage_dir)?;

    let listener = TcpListener::bind((cfg.listen_host.as_str(), cfg.listen_port)).await?;
    let local_addr = listener.local_addr()?;

    let ctx = build(cfg, identity, store, local_addr.port());
    info!(
        "node {} listening on {local_addr} (public group v{})",
        ctx.server_id,
        ctx.store.public_group_version()
    );

    let mut tasks = Vec::new();
    {
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = net::listen(ctx, listener).await {
                warn!("listener stopped: {e}");
            }
        }));
    }
    tasks.extend(mesh::spawn_maintenance(ctx.clone()));

    Ok(NodeHandle {
        ctx,
        local_addr,
        tasks,
    })
}

/// Pure assembly, separated so tests can build a node around a listener they
/// already hold.
pub fn build(cfg: Config, identity: NodeIdentity, store: Store, listen_port: u16) -> Ctx {
    let dir = Directory::new();

    let send_to_peer: SendFn = {
        let dir = dir.clone();
        Arc::new(move |sid, env| dir.send_to_peer(sid, env))
    };
    let send_to_local: SendFn = {
        let dir = dir.clone();
        Arc::new(move |uid, env| dir.send_to_local(uid, env))
    };
    let router = Router::new(
        &identity.server_id,
        Some(identity.private.clone()),
        send_to_peer,
        send_to_local,
        &dir,
    );

    // signature policy: peers first (pinned at join), then users learned from
    // advertises, then the durable directory
    let lookup: PubKeyLookup = {
        let dir = dir.clone();
        let store = store.clone();
        Arc::new(move |id: &str| {
            if let Some(key) = dir.peer_pubkeys.get(id) {
                return Some(key.value().clone());
            }
            if let Some(key) = dir.user_pubkeys.get(id) {
                return Some(key.value().clone());
            }
            store
                .get_pubkey(id)
                .and_then(|pem| keys::public_key_from_pem(&pem).ok())
        })
    };
    let verifier = make_verifier(lookup);

    Arc::new(Node {
        cfg,
        server_id: identity.server_id.clone(),
        signing_key: identity.private.clone(),
        public_pem: identity.public_pem.clone(),
        listen_port,
        dir,
        router,
        store,
        verifier,
        dialing: DashMap::new(),
    })
}
