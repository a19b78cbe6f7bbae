//! Reference client: connects to one node, announces itself, learns peer
//! keys from advertises, encrypts outgoing direct messages and decrypts
//! inbound deliveries on a background read task.

pub mod build;

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use futures::StreamExt;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use uuid::Uuid;

use crate::crypto::{b64, keys, oaep};
use crate::envelope::{frame, Envelope};
use crate::net::conn::{recv_frame, send_envelope, spawn_writer};

/// A user's keypair and id, generated fresh or loaded by the caller.
#[derive(Clone)]
pub struct ClientIdentity {
    pub user_id: String,
    pub private: Arc<RsaPrivateKey>,
    pub public: RsaPublicKey,
    pub public_pem: String,
}

impl ClientIdentity {
    pub fn generate(bits: usize) -> Result<Self> {
        let (private, public) = keys::generate_keypair(bits)?;
        let public_pem = keys::public_key_to_pem(&public)?;
        Ok(ClientIdentity {
            user_id: Uuid::new_v4().to_string(),
            private: Arc::new(private),
            public,
            public_pem,
        })
    }
}

/// What the background listener surfaces to the application.
#[derive(Debug)]
pub enum Event {
    /// A direct delivery, decrypted with our key.
    Delivered {
        from: String,
        plaintext: Vec<u8>,
        payload: Value,
    },
    /// A public-channel message (content left as the sender shipped it).
    Public { from: String, payload: Value },
    /// Another user's advertise; their key is now usable for `send_direct`.
    Advertise { user_id: String },
    UserList { users: Vec<String> },
    Ack { msg_ref: String },
    ProtocolError { code: String, detail: String },
    Pubkey { user_id: String, pubkey_pem: String },
    WrappedKey { user_id: String, wrapped_key: String },
    Disconnected,
}

pub struct Client {
    identity: ClientIdentity,
    tx: UnboundedSender<Message>,
    events: UnboundedReceiver<Event>,
    peer_keys: Arc<DashMap<String, RsaPublicKey>>,
    reader: JoinHandle<()>,
}

impl Client {
    /// Connect, say hello, advertise, and start the background listener.
    pub async fn connect(host: &str, port: u16, identity: ClientIdentity) -> Result<Self> {
        let url = format!("ws://{host}:{port}");
        let (ws, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("connect to {url}"))?;
        let (sink, ws_reader) = ws.split();
        let tx = spawn_writer(sink);

        send_envelope(
            &tx,
            &build::user_hello(&identity.user_id, "", &identity.public_pem, &identity.private),
        )?;
        send_envelope(
            &tx,
            &build::user_advertise(
                &identity.user_id,
                &identity.public_pem,
                "",
                "",
                json!({}),
                1,
                &identity.private,
            ),
        )?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let peer_keys: Arc<DashMap<String, RsaPublicKey>> = Arc::new(DashMap::new());
        let reader = tokio::spawn(listen_loop(
            identity.private.clone(),
            peer_keys.clone(),
            event_tx,
            ws_reader,
        ));

        Ok(Client {
            identity,
            tx,
            events,
            peer_keys,
            reader,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub async fn recv_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// True once we can encrypt to this user.
    pub fn knows_user(&self, user_id: &str) -> bool {
        self.peer_keys.contains_key(user_id)
    }

    /// OAEP-encrypt (chunked) to the recipient's advertised key and send.
    pub fn send_direct(&self, to: &str, plaintext: &[u8]) -> Result<()> {
        let key = self
            .peer_keys
            .get(to)
            .map(|k| k.value().clone())
            .ok_or_else(|| anyhow!("no public key known for {to}"))?;
        let ciphertext = seal(&key, plaintext)?;
        let env = build::msg_direct(&self.identity.user_id, to, &ciphertext, &self.identity.private);
        send_envelope(&self.tx, &env)
    }

    /// Post to the public channel. Encryption of the broadcast content is
    /// out of band (shared channel key); this reference sends it sealed by
    /// the caller or plain.
    pub fn send_public(&self, content: &[u8]) -> Result<()> {
        let env = build::msg_public(&self.identity.user_id, None, content, &self.identity.private);
        send_envelope(&self.tx, &env)
    }

    /// Ship a file as FILE_START / FILE_CHUNK* / FILE_END, each chunk
    /// OAEP-encrypted to the recipient.
    pub fn send_file(&self, to: &str, name: &str, bytes: &[u8]) -> Result<String> {
        let key = self
            .peer_keys
            .get(to)
            .map(|k| k.value().clone())
            .ok_or_else(|| anyhow!("no public key known for {to}"))?;
        let file_id = Uuid::new_v4().to_string();
        let digest = hex::encode(Sha256::digest(bytes));
        send_envelope(
            &self.tx,
            &build::file_start(
                &self.identity.user_id,
                to,
                &file_id,
                name,
                bytes.len() as u64,
                &digest,
                "e2e",
                &self.identity.private,
            ),
        )?;
        for (index, chunk) in bytes.chunks(oaep::max_plaintext_len(&key)).enumerate() {
            let sealed = oaep::encrypt(&key, chunk)?;
            send_envelope(
                &self.tx,
                &build::file_chunk(
                    &self.identity.user_id,
                    to,
                    &file_id,
                    index as u64,
                    &sealed,
                    &self.identity.private,
                ),
            )?;
        }
        send_envelope(
            &self.tx,
            &build::file_end(&self.identity.user_id, to, &file_id, &self.identity.private),
        )?;
        Ok(file_id)
    }

    /// Escape hatch: ship a frame built by hand (or one built twice, for
    /// callers probing retransmission behaviour).
    pub fn send_frame(&self, env: &Envelope) -> Result<()> {
        send_envelope(&self.tx, env)
    }

    pub fn list_users(&self) -> Result<()> {
        send_envelope(&self.tx, &build::cmd_list(&self.identity.user_id, &self.identity.private))
    }

    pub fn request_pubkey(&self, user_id: &str) -> Result<()> {
        send_envelope(
            &self.tx,
            &build::dir_get_pubkey(&self.identity.user_id, user_id, &self.identity.private),
        )
    }

    /// Announce departure with a signed USER_REMOVE, then close. Peers only
    /// honour removals carrying the user's own signature, so a clean logout
    /// must say goodbye itself.
    pub fn close(self) {
        let _ = send_envelope(
            &self.tx,
            &build::user_remove(&self.identity.user_id, "local", &self.identity.private),
        );
        let _ = self.tx.send(Message::Close(None));
        self.reader.abort();
    }
}

/// Concatenated OAEP blocks for one logical ciphertext.
fn seal(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let blocks = oaep::encrypt_large(key, plaintext)?;
    Ok(blocks.concat())
}

/// Inverse of `seal`: split on the modulus size and decrypt in order.
fn open(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let block = key.size();
    if ciphertext.len() % block != 0 {
        bail!("ciphertext is not a whole number of blocks");
    }
    let blocks: Vec<Vec<u8>> = ciphertext.chunks(block).map(|c| c.to_vec()).collect();
    oaep::decrypt_large(key, &blocks)
}

async fn listen_loop(
    private: Arc<RsaPrivateKey>,
    peer_keys: Arc<DashMap<String, RsaPublicKey>>,
    events: UnboundedSender<Event>,
    mut reader: crate::net::conn::WsReader,
) {
    loop {
        let Some(text) = recv_frame(&mut reader).await else {
            let _ = events.send(Event::Disconnected);
            return;
        };
        let Ok(env) = Envelope::parse(&text) else {
            debug!("client: dropping malformed frame");
            continue;
        };
        if let Some(event) = translate(&private, &peer_keys, env) {
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

fn translate(
    private: &RsaPrivateKey,
    peer_keys: &DashMap<String, RsaPublicKey>,
    env: Envelope,
) -> Option<Event> {
    match env.kind.as_str() {
        frame::USER_DELIVER => {
            let ct_b64 = env.payload_str("ciphertext").unwrap_or_default();
            let plaintext = b64::decode(ct_b64)
                .ok()
                .and_then(|ct| open(private, &ct).ok())
                .unwrap_or_default();
            let from = env
                .payload_str("from")
                .unwrap_or(env.from.as_str())
                .to_string();
            Some(Event::Delivered {
                from,
                plaintext,
                payload: env.payload,
            })
        }
        frame::MSG_PUBLIC_CHANNEL => Some(Event::Public {
            from: env.from,
            payload: env.payload,
        }),
        frame::USER_ADVERTISE => {
            let user_id = env.payload_str("user_id")?.to_string();
            let pem = env.payload_str("pubkey")?;
            if let Ok(key) = keys::public_key_from_pem(pem) {
                peer_keys.insert(user_id.clone(), key);
            }
            Some(Event::Advertise { user_id })
        }
        frame::USER_LIST => {
            let users = env
                .payload
                .get("users")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(Event::UserList { users })
        }
        frame::ACK => Some(Event::Ack {
            msg_ref: env.payload_str("msg_ref").unwrap_or_default().to_string(),
        }),
        frame::ERROR => Some(Event::ProtocolError {
            code: env.payload_str("code").unwrap_or_default().to_string(),
            detail: env.payload_str("detail").unwrap_or_default().to_string(),
        }),
        frame::DIR_PUBKEY => {
            let user_id = env.payload_str("user_id")?.to_string();
            let pubkey_pem = env.payload_str("pubkey")?.to_string();
            if let Ok(key) = keys::public_key_from_pem(&pubkey_pem) {
                peer_keys.insert(user_id.clone(), key);
            }
            Some(Event::Pubkey { user_id, pubkey_pem })
        }
        frame::DIR_WRAPPED_PUBLIC_KEY => Some(Event::WrappedKey {
            user_id: env.payload_str("user_id").unwrap_or_default().to_string(),
            wrapped_key: env.payload_str("wrapped_key").unwrap_or_default().to_string(),
        }),
        frame::USER_REMOVE => {
            if let Some(user_id) = env.payload_str("user_id") {
                peer_keys.remove(user_id);
            }
            None
        }
        other => {
            debug!("client: ignoring {other} frame");
            None
        }
    }
}
