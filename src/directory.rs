use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::envelope::Envelope;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    User,
}

/// Where a user currently lives: attached to this node, or homed on a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local,
    Remote(String),
}

impl Location {
    pub const LOCAL_WIRE: &'static str = "local";

    pub fn as_wire(&self) -> &str {
        match self {
            Location::Local => Self::LOCAL_WIRE,
            Location::Remote(sid) => sid,
        }
    }

    pub fn from_wire(s: &str) -> Location {
        if s == Self::LOCAL_WIRE {
            Location::Local
        } else {
            Location::Remote(s.to_string())
        }
    }
}

/// Handle to one live connection: the outbound mailbox plus identity.
/// Cloning shares the mailbox. `conn_id` distinguishes two connections that
/// claim the same id, so a stale task can never detach its replacement.
#[derive(Clone)]
pub struct Link {
    pub role: Role,
    pub id: String,
    pub conn_id: u64,
    sender: UnboundedSender<Message>,
}

impl Link {
    pub fn new(role: Role, id: impl Into<String>, sender: UnboundedSender<Message>) -> Self {
        Link {
            role,
            id: id.into(),
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            sender,
        }
    }

    pub fn send(&self, env: &Envelope) -> Result<()> {
        let text = serde_json::to_string(env)?;
        self.sender
            .send(Message::Text(text))
            .map_err(|_| anyhow!("connection to {} is gone", self.id))
    }

    /// Normal close (1000) with a reason; the writer task shuts the socket.
    pub fn close(&self, reason: &str) {
        let _ = self.sender.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        })));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Default)]
struct AdvertiseCache {
    order: Vec<String>,
    by_user: HashMap<String, Envelope>,
}

/// In-memory tables shared by the router, the transport and the handlers.
/// All mutation goes through these operations; the invariant is that
/// `local_users` holds a link for `uid` iff `user_locations[uid] == Local`.
#[derive(Clone)]
pub struct Directory {
    pub peers: Arc<DashMap<String, Link>>,
    pub server_addrs: Arc<DashMap<String, (String, u16)>>,
    pub peer_last_seen: Arc<DashMap<String, Instant>>,
    pub peer_pubkeys: Arc<DashMap<String, RsaPublicKey>>,
    pub local_users: Arc<DashMap<String, Link>>,
    pub user_locations: Arc<DashMap<String, Location>>,
    pub user_pubkeys: Arc<DashMap<String, RsaPublicKey>>,
    advertises: Arc<Mutex<AdvertiseCache>>,
}

impl Directory {
    pub fn new() -> Self {
        Directory {
            peers: Arc::new(DashMap::new()),
            server_addrs: Arc::new(DashMap::new()),
            peer_last_seen: Arc::new(DashMap::new()),
            peer_pubkeys: Arc::new(DashMap::new()),
            local_users: Arc::new(DashMap::new()),
            user_locations: Arc::new(DashMap::new()),
            user_pubkeys: Arc::new(DashMap::new()),
            advertises: Arc::new(Mutex::new(AdvertiseCache::default())),
        }
    }

    pub fn attach_peer(&self, sid: &str, link: Link, addr: Option<(String, u16)>) {
        self.peers.insert(sid.to_string(), link);
        if let Some(addr) = addr {
            self.server_addrs.insert(sid.to_string(), addr);
        }
        self.peer_last_seen.insert(sid.to_string(), Instant::now());
    }

    /// Detach a peer, but only if the registered connection is the caller's.
    pub fn detach_peer(&self, sid: &str, conn_id: u64) -> bool {
        let removed = self
            .peers
            .remove_if(sid, |_, link| link.conn_id == conn_id)
            .is_some();
        if removed {
            self.peer_last_seen.remove(sid);
        }
        removed
    }

    pub fn attach_user(&self, uid: &str, link: Link) {
        self.local_users.insert(uid.to_string(), link);
        self.user_locations.insert(uid.to_string(), Location::Local);
    }

    pub fn detach_user(&self, uid: &str, conn_id: u64) -> bool {
        let removed = self
            .local_users
            .remove_if(uid, |_, link| link.conn_id == conn_id)
            .is_some();
        if removed {
            self.user_locations
                .remove_if(uid, |_, loc| *loc == Location::Local);
        }
        removed
    }

    pub fn set_user_location(&self, uid: &str, location: Location) {
        self.user_locations.insert(uid.to_string(), location);
    }

    /// Peer list for the SERVER_WELCOME reply.
    pub fn snapshot_peers(&self) -> Vec<PeerInfo> {
        self.server_addrs
            .iter()
            .map(|entry| PeerInfo {
                id: entry.key().clone(),
                host: entry.value().0.clone(),
                port: entry.value().1,
            })
            .collect()
    }

    pub fn note_peer_seen(&self, sid: &str) {
        self.peer_last_seen.insert(sid.to_string(), Instant::now());
    }

    /// Cache the latest valid advertise for a user. First-insertion order is
    /// preserved so state transfer replays in the order it was learned.
    pub fn cache_advertise(&self, uid: &str, env: Envelope) {
        let mut cache = self.advertises.lock().expect("advertise cache poisoned");
        if !cache.by_user.contains_key(uid) {
            cache.order.push(uid.to_string());
        }
        cache.by_user.insert(uid.to_string(), env);
    }

    pub fn remove_advertise(&self, uid: &str) {
        let mut cache = self.advertises.lock().expect("advertise cache poisoned");
        if cache.by_user.remove(uid).is_some() {
            cache.order.retain(|u| u != uid);
        }
    }

    /// All cached advertises in insertion order, for seeding a new peer or a
    /// newly connected user.
    pub fn known_user_advertises(&self) -> Vec<Envelope> {
        let cache = self.advertises.lock().expect("advertise cache poisoned");
        cache
            .order
            .iter()
            .filter_map(|uid| cache.by_user.get(uid).cloned())
            .collect()
    }

    pub fn send_to_peer(&self, sid: &str, env: &Envelope) -> Result<()> {
        let link = self
            .peers
            .get(sid)
            .ok_or_else(|| anyhow!("no such peer: {sid}"))?;
        link.send(env)
    }

    pub fn send_to_local(&self, uid: &str, env: &Envelope) -> Result<()> {
        let link = self
            .local_users
            .get(uid)
            .ok_or_else(|| anyhow!("no such local user: {uid}"))?;
        link.send(env)
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_link(role: Role, id: &str) -> Link {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Link::new(role, id, tx)
    }

    #[test]
    fn local_user_invariant_holds_through_attach_detach() {
        let dir = Directory::new();
        let link = test_link(Role::User, "u1");
        let conn_id = link.conn_id;

        dir.attach_user("u1", link);
        assert!(dir.local_users.contains_key("u1"));
        assert_eq!(*dir.user_locations.get("u1").unwrap(), Location::Local);

        assert!(dir.detach_user("u1", conn_id));
        assert!(!dir.local_users.contains_key("u1"));
        assert!(!dir.user_locations.contains_key("u1"));
    }

    #[test]
    fn stale_detach_is_a_noop() {
        let dir = Directory::new();
        let old = test_link(Role::User, "u1");
        let old_conn = old.conn_id;
        dir.attach_user("u1", old);

        let new = test_link(Role::User, "u1");
        dir.attach_user("u1", new);

        // the replaced connection's cleanup must not detach the new one
        assert!(!dir.detach_user("u1", old_conn));
        assert!(dir.local_users.contains_key("u1"));
        assert_eq!(*dir.user_locations.get("u1").unwrap(), Location::Local);
    }

    #[test]
    fn remote_location_survives_stale_user_detach() {
        let dir = Directory::new();
        let link = test_link(Role::User, "u1");
        let conn_id = link.conn_id;
        dir.attach_user("u1", link);
        dir.local_users.remove("u1");
        dir.set_user_location("u1", Location::Remote("s2".into()));

        dir.detach_user("u1", conn_id);
        assert_eq!(
            *dir.user_locations.get("u1").unwrap(),
            Location::Remote("s2".into())
        );
    }

    #[test]
    fn peer_attach_detach() {
        let dir = Directory::new();
        let link = test_link(Role::Server, "s1");
        let conn_id = link.conn_id;
        dir.attach_peer("s1", link, Some(("10.0.0.1".into(), 8765)));
        assert!(dir.peers.contains_key("s1"));
        assert!(dir.peer_last_seen.contains_key("s1"));
        assert_eq!(dir.snapshot_peers().len(), 1);

        assert!(dir.detach_peer("s1", conn_id));
        assert!(!dir.peers.contains_key("s1"));
        assert!(!dir.peer_last_seen.contains_key("s1"));
        // the address survives for reconnection
        assert!(dir.server_addrs.contains_key("s1"));
    }

    #[test]
    fn advertise_cache_keeps_insertion_order() {
        let dir = Directory::new();
        for uid in ["u1", "u2", "u3"] {
            dir.cache_advertise(uid, Envelope::new("USER_ADVERTISE", uid, "*", json!({})));
        }
        // re-advertising u1 keeps its original slot
        dir.cache_advertise("u1", Envelope::new("USER_ADVERTISE", "u1", "*", json!({"v": 2})));
        let order: Vec<String> = dir
            .known_user_advertises()
            .into_iter()
            .map(|e| e.from)
            .collect();
        assert_eq!(order, ["u1", "u2", "u3"]);

        dir.remove_advertise("u2");
        let order: Vec<String> = dir
            .known_user_advertises()
            .into_iter()
            .map(|e| e.from)
            .collect();
        assert_eq!(order, ["u1", "u3"]);
    }

    #[test]
    fn location_wire_round_trip() {
        assert_eq!(Location::from_wire("local"), Location::Local);
        assert_eq!(Location::from_wire("abc"), Location::Remote("abc".into()));
        assert_eq!(Location::Remote("abc".into()).as_wire(), "abc");
        assert_eq!(Location::Local.as_wire(), "local");
    }
}
