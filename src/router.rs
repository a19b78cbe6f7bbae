use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::dedupe::{SeenCache, DEDUPE_CAPACITY};
use crate::directory::{Directory, Link, Location};
use crate::envelope::{frame, Envelope};

pub const HOLD_QUEUE_PER_USER: usize = 100;

/// Send port wired at construction. The router never touches sockets; it
/// hands envelopes to these and lets the transport own the I/O.
pub type SendFn = Arc<dyn Fn(&str, &Envelope) -> Result<()> + Send + Sync>;

/// The routing engine: decides local vs remote delivery, suppresses loops,
/// parks frames for users whose location is not yet known, and keeps peer
/// liveness.
pub struct Router {
    server_id: String,
    signing_key: Option<Arc<RsaPrivateKey>>,
    send_to_peer: SendFn,
    send_to_local: SendFn,
    peers: Arc<DashMap<String, Link>>,
    user_locations: Arc<DashMap<String, Location>>,
    peer_last_seen: Arc<DashMap<String, Instant>>,
    seen: Mutex<SeenCache>,
    held: Mutex<HashMap<String, VecDeque<Envelope>>>,
    hold_capacity: usize,
}

impl Router {
    pub fn new(
        server_id: impl Into<String>,
        signing_key: Option<Arc<RsaPrivateKey>>,
        send_to_peer: SendFn,
        send_to_local: SendFn,
        dir: &Directory,
    ) -> Self {
        Router {
            server_id: server_id.into(),
            signing_key,
            send_to_peer,
            send_to_local,
            peers: dir.peers.clone(),
            user_locations: dir.user_locations.clone(),
            peer_last_seen: dir.peer_last_seen.clone(),
            seen: Mutex::new(SeenCache::new(DEDUPE_CAPACITY)),
            held: Mutex::new(HashMap::new()),
            hold_capacity: HOLD_QUEUE_PER_USER,
        }
    }

    pub fn with_hold_capacity(mut self, capacity: usize) -> Self {
        self.hold_capacity = capacity;
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// True if this fingerprint was seen within the cache window; remembers
    /// it otherwise. At-most-once delivery across the mesh hangs on this.
    pub fn already_seen(&self, env: &Envelope) -> bool {
        let key = env.fingerprint();
        self.seen
            .lock()
            .expect("dedupe cache poisoned")
            .check_and_remember(&key)
    }

    /// Install a user's location, then drain any frames parked for them.
    /// Drained frames that still cannot be routed are dropped rather than
    /// re-queued, so a bad location cannot cycle frames forever.
    pub fn record_presence(&self, uid: &str, location: Location) {
        self.user_locations.insert(uid.to_string(), location);
        let parked = self
            .held
            .lock()
            .expect("hold queue poisoned")
            .remove(uid)
            .unwrap_or_default();
        if !parked.is_empty() {
            debug!("draining {} held frame(s) for {uid}", parked.len());
        }
        for env in parked {
            if !self.route_to_user(uid, &env, false) {
                debug!("dropping undeliverable held frame for {uid}");
            }
        }
    }

    /// Deliver a frame to a user wherever they live. Local users get a fresh
    /// `USER_DELIVER`; remote users get a `PEER_DELIVER` hop-wrapped for their
    /// home node. Unknown destinations are parked when `allow_queue` is set.
    /// Returns whether the frame was handed to a send port.
    pub fn route_to_user(&self, uid: &str, env: &Envelope, allow_queue: bool) -> bool {
        if uid.is_empty() {
            return false;
        }
        let location = self.user_locations.get(uid).map(|loc| loc.value().clone());
        match location {
            Some(Location::Local) => {
                let deliver = self.wrap(frame::USER_DELIVER, uid, env.payload.clone());
                if let Err(e) = (self.send_to_local)(uid, &deliver) {
                    warn!("local delivery to {uid} failed: {e}");
                }
                true
            }
            Some(Location::Remote(sid)) if self.peers.contains_key(&sid) => {
                let mut payload = env.payload.clone();
                if let Value::Object(map) = &mut payload {
                    map.insert("user_id".to_string(), json!(uid));
                }
                let forward = self.wrap(frame::PEER_DELIVER, &sid, payload);
                if let Err(e) = (self.send_to_peer)(&sid, &forward) {
                    warn!("forward to peer {sid} failed: {e}");
                }
                true
            }
            _ => {
                if allow_queue {
                    self.park(uid, env.clone());
                }
                false
            }
        }
    }

    fn wrap(&self, kind: &str, to: &str, payload: Value) -> Envelope {
        let mut env = Envelope::new(kind, &self.server_id, to, payload);
        if let Some(key) = &self.signing_key {
            env.sign(key);
        }
        env
    }

    fn park(&self, uid: &str, env: Envelope) {
        let mut held = self.held.lock().expect("hold queue poisoned");
        let queue = held.entry(uid.to_string()).or_default();
        if queue.len() >= self.hold_capacity {
            queue.pop_front();
        }
        queue.push_back(env);
    }

    pub fn held_count(&self, uid: &str) -> usize {
        self.held
            .lock()
            .expect("hold queue poisoned")
            .get(uid)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// One HEARTBEAT fanned out to every peer; failures are the reaper's
    /// problem, not ours.
    pub fn broadcast_heartbeat(&self) {
        let hb = self.wrap(frame::HEARTBEAT, frame::BROADCAST, json!({}));
        for entry in self.peers.iter() {
            if let Err(e) = (self.send_to_peer)(entry.key(), &hb) {
                debug!("heartbeat to {} failed: {e}", entry.key());
            }
        }
    }

    pub fn note_peer_seen(&self, sid: &str) {
        self.peer_last_seen.insert(sid.to_string(), Instant::now());
    }

    /// Drop every peer not heard from within `dead_after`, returning their
    /// ids. Removal covers both the link table and the last-seen table.
    pub fn reap_peers(&self, dead_after: Duration) -> Vec<String> {
        let dead: Vec<String> = self
            .peer_last_seen
            .iter()
            .filter(|entry| entry.value().elapsed() > dead_after)
            .map(|entry| entry.key().clone())
            .collect();
        for sid in &dead {
            self.peer_last_seen.remove(sid);
            if let Some((_, link)) = self.peers.remove(sid) {
                link.close("reaped");
            }
            warn!("reaped dead peer {sid}");
        }
        dead
    }
}
