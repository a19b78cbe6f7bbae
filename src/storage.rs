//! Durable state under the storage directory: the node keypair and id, and
//! the small JSON-file directory of users, groups and wrapped group keys that
//! the routing core consumes through a narrow interface.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::crypto::keys;
use crate::envelope::now_ms;

const PRIVATE_KEY_FILE: &str = "node_key.pem";
const PUBLIC_KEY_FILE: &str = "node_key.pub.pem";
const SERVER_ID_FILE: &str = "server_id";

pub const PUBLIC_GROUP: &str = "public";

/// This node's stable identity: created on first boot, immutable after.
pub struct NodeIdentity {
    pub server_id: String,
    pub private: Arc<RsaPrivateKey>,
    pub public: RsaPublicKey,
    pub public_pem: String,
}

impl NodeIdentity {
    /// Load the persisted keypair and id, or create and persist fresh ones.
    /// `server_id` overrides (and re-persists) the stored id when set.
    pub fn load_or_create(
        storage_dir: &Path,
        server_id: Option<&str>,
        key_bits: usize,
    ) -> Result<Self> {
        fs::create_dir_all(storage_dir)
            .with_context(|| format!("cannot create {}", storage_dir.display()))?;
        let priv_path = storage_dir.join(PRIVATE_KEY_FILE);
        let pub_path = storage_dir.join(PUBLIC_KEY_FILE);
        let id_path = storage_dir.join(SERVER_ID_FILE);

        let (private, public_pem) = if priv_path.exists() {
            let pem = fs::read_to_string(&priv_path)?;
            let private = keys::private_key_from_pem(&pem)?;
            let public_pem = if pub_path.exists() {
                fs::read_to_string(&pub_path)?
            } else {
                keys::public_key_to_pem(&RsaPublicKey::from(&private))?
            };
            (private, public_pem)
        } else {
            info!("generating {key_bits}-bit node keypair (first boot)");
            let (private, public) = keys::generate_keypair(key_bits)?;
            let priv_pem = keys::private_key_to_pem(&private)?;
            let public_pem = keys::public_key_to_pem(&public)?;
            fs::write(&priv_path, priv_pem)?;
            fs::write(&pub_path, &public_pem)?;
            (private, public_pem)
        };

        let server_id = match server_id {
            Some(id) => {
                fs::write(&id_path, id)?;
                id.to_string()
            }
            None => {
                if id_path.exists() {
                    fs::read_to_string(&id_path)?.trim().to_string()
                } else {
                    let id = Uuid::new_v4().to_string();
                    fs::write(&id_path, &id)?;
                    id
                }
            }
        };

        let public = keys::public_key_from_pem(&public_pem)?;
        Ok(NodeIdentity {
            server_id,
            private: Arc::new(private),
            public,
            public_pem,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub pubkey: String,
    #[serde(default)]
    pub privkey_store: String,
    #[serde(default)]
    pub pake_password: String,
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupRecord {
    creator_id: String,
    created_at: i64,
    meta: Value,
    version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemberRecord {
    role: String,
    #[serde(default)]
    wrapped_key: String,
}

type UsersFile = HashMap<String, UserRecord>;
type GroupsFile = HashMap<String, GroupRecord>;
type MembersFile = HashMap<String, HashMap<String, MemberRecord>>;

/// JSON-file "database". Every write rewrites the file atomically
/// (temp file + rename) under a process-wide lock; readers re-read from disk
/// so external edits are picked up between calls.
#[derive(Clone)]
pub struct Store {
    base: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Store {
    pub fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base).with_context(|| format!("cannot create {}", base.display()))?;
        let store = Store {
            base,
            lock: Arc::new(Mutex::new(())),
        };
        store.ensure_public_group()?;
        Ok(store)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    fn read_file<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        match fs::read_to_string(self.path(name)) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => T::default(),
        }
    }

    fn write_file<T: Serialize>(&self, name: &str, data: &T) -> Result<()> {
        let path = self.path(name);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(data)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn update<T, F>(&self, name: &str, mutate: F) -> Result<()>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T),
    {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let mut data: T = self.read_file(name);
        mutate(&mut data);
        self.write_file(name, &data)
    }

    // ---- groups ----

    pub fn ensure_public_group(&self) -> Result<()> {
        self.update::<GroupsFile, _>("groups.json", |groups| {
            groups.entry(PUBLIC_GROUP.to_string()).or_insert(GroupRecord {
                creator_id: "system".to_string(),
                created_at: now_ms(),
                meta: serde_json::json!({"desc": "default broadcast group"}),
                version: 1,
            });
        })
    }

    pub fn public_group_version(&self) -> u64 {
        let groups: GroupsFile = self.read_file("groups.json");
        groups.get(PUBLIC_GROUP).map(|g| g.version).unwrap_or(0)
    }

    /// Monotonic bump, for key-rotation bookkeeping. Returns the new version.
    pub fn bump_public_group_version(&self) -> Result<u64> {
        let mut bumped = 0;
        self.update::<GroupsFile, _>("groups.json", |groups| {
            if let Some(group) = groups.get_mut(PUBLIC_GROUP) {
                group.version += 1;
                bumped = group.version;
            }
        })?;
        Ok(bumped)
    }

    // ---- users ----

    pub fn upsert_user(&self, user_id: &str, record: UserRecord) -> Result<()> {
        self.update::<UsersFile, _>("users.json", |users| {
            users.insert(user_id.to_string(), record);
        })
    }

    pub fn get_user(&self, user_id: &str) -> Option<UserRecord> {
        let users: UsersFile = self.read_file("users.json");
        users.get(user_id).cloned()
    }

    pub fn get_pubkey(&self, user_id: &str) -> Option<String> {
        self.get_user(user_id).map(|u| u.pubkey)
    }

    pub fn user_exists(&self, user_id: &str) -> bool {
        self.get_user(user_id).is_some()
    }

    // ---- memberships & wrapped keys ----

    pub fn add_member(&self, group: &str, user_id: &str, role: &str, wrapped_key: &str) -> Result<()> {
        self.update::<MembersFile, _>("group_members.json", |members| {
            members.entry(group.to_string()).or_default().insert(
                user_id.to_string(),
                MemberRecord {
                    role: role.to_string(),
                    wrapped_key: wrapped_key.to_string(),
                },
            );
        })
    }

    pub fn list_group_members(&self, group: &str) -> Vec<String> {
        let members: MembersFile = self.read_file("group_members.json");
        let mut out: Vec<String> = members
            .get(group)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn get_wrapped_key(&self, group: &str, user_id: &str) -> Option<String> {
        let members: MembersFile = self.read_file("group_members.json");
        members
            .get(group)
            .and_then(|m| m.get(user_id))
            .map(|m| m.wrapped_key.clone())
            .filter(|k| !k.is_empty())
    }

    pub fn put_wrapped_key(&self, group: &str, user_id: &str, wrapped_key: &str) -> Result<()> {
        self.update::<MembersFile, _>("group_members.json", |members| {
            let entry = members
                .entry(group.to_string())
                .or_default()
                .entry(user_id.to_string())
                .or_insert(MemberRecord {
                    role: "member".to_string(),
                    wrapped_key: String::new(),
                });
            entry.wrapped_key = wrapped_key.to_string();
        })
    }
}
