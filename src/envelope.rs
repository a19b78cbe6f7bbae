use std::sync::Arc;

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::crypto::{b64, canonical, pss};

/// Wire frame type names.
pub mod frame {
    pub const SERVER_HELLO_JOIN: &str = "SERVER_HELLO_JOIN";
    pub const SERVER_WELCOME: &str = "SERVER_WELCOME";
    pub const SERVER_ANNOUNCE: &str = "SERVER_ANNOUNCE";
    pub const USER_HELLO: &str = "USER_HELLO";
    pub const USER_ADVERTISE: &str = "USER_ADVERTISE";
    pub const USER_REMOVE: &str = "USER_REMOVE";
    pub const MSG_DIRECT: &str = "MSG_DIRECT";
    pub const MSG_PUBLIC_CHANNEL: &str = "MSG_PUBLIC_CHANNEL";
    pub const PEER_DELIVER: &str = "PEER_DELIVER";
    pub const USER_DELIVER: &str = "USER_DELIVER";
    pub const FILE_START: &str = "FILE_START";
    pub const FILE_CHUNK: &str = "FILE_CHUNK";
    pub const FILE_END: &str = "FILE_END";
    pub const HEARTBEAT: &str = "HEARTBEAT";
    pub const ACK: &str = "ACK";
    pub const ERROR: &str = "ERROR";
    pub const CMD_LIST: &str = "CMD_LIST";
    pub const USER_LIST: &str = "USER_LIST";
    pub const DIR_GET_PUBKEY: &str = "DIR_GET_PUBKEY";
    pub const DIR_PUBKEY: &str = "DIR_PUBKEY";
    pub const DIR_GET_WRAPPED_PUBLIC_KEY: &str = "DIR_GET_WRAPPED_PUBLIC_KEY";
    pub const DIR_WRAPPED_PUBLIC_KEY: &str = "DIR_WRAPPED_PUBLIC_KEY";

    /// Any SERVER_HELLO_* classifies the connection as a peer link.
    pub const SERVER_HELLO_PREFIX: &str = "SERVER_HELLO";
    pub const BOOTSTRAP_PREFIX: &str = "BOOTSTRAP";

    pub const BROADCAST: &str = "*";
}

pub const ALG_PSS_SHA256: &str = "PS256";

/// Wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("USER_NOT_FOUND")]
    UserNotFound,
    #[error("INVALID_SIG")]
    InvalidSig,
    #[error("BAD_KEY")]
    BadKey,
    #[error("TIMEOUT")]
    Timeout,
    #[error("UNKNOWN_TYPE")]
    UnknownType,
    #[error("NAME_IN_USE")]
    NameInUse,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UserNotFound => "USER_NOT_FOUND",
            ErrorCode::InvalidSig => "INVALID_SIG",
            ErrorCode::BadKey => "BAD_KEY",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::UnknownType => "UNKNOWN_TYPE",
            ErrorCode::NameInUse => "NAME_IN_USE",
        }
    }
}

/// Why an inbound frame failed the structure check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructureError {
    #[error("invalid_json")]
    BadJson,
    #[error("missing:{0}")]
    MissingField(&'static str),
    #[error("{0}:not_string")]
    NotAString(&'static str),
    #[error("ts:not_number")]
    TsNotNumber,
    #[error("payload:not_object")]
    PayloadNotObject,
}

/// The outer frame: exactly one of these per websocket text message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub to: String,
    pub ts: i64,
    pub payload: Value,
    #[serde(default)]
    pub sig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

impl Envelope {
    /// Unsigned envelope with a fresh timestamp.
    pub fn new(kind: &str, from: &str, to: &str, payload: Value) -> Self {
        Envelope {
            kind: kind.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            ts: now_ms(),
            payload,
            sig: String::new(),
            alg: None,
        }
    }

    pub fn signed(kind: &str, from: &str, to: &str, payload: Value, key: &RsaPrivateKey) -> Self {
        let mut env = Self::new(kind, from, to, payload);
        env.sign(key);
        env
    }

    /// Attach the transport-hop signature over the canonical payload bytes.
    pub fn sign(&mut self, key: &RsaPrivateKey) {
        self.sig = sign_payload(&self.payload, key);
        self.alg = Some(ALG_PSS_SHA256.to_string());
    }

    /// Parse and structure-check one inbound frame. Signature policy is the
    /// caller's business; this only guarantees the required fields exist with
    /// the right shapes.
    pub fn parse(text: &str) -> Result<Self, StructureError> {
        let value: Value = serde_json::from_str(text).map_err(|_| StructureError::BadJson)?;
        let obj = value.as_object().ok_or(StructureError::BadJson)?;
        for field in ["type", "from", "to", "ts", "payload"] {
            if !obj.contains_key(field) {
                return Err(StructureError::MissingField(field));
            }
        }
        let kind = obj["type"].as_str().ok_or(StructureError::NotAString("type"))?;
        let from = obj["from"].as_str().ok_or(StructureError::NotAString("from"))?;
        let to = obj["to"].as_str().ok_or(StructureError::NotAString("to"))?;
        let ts = match &obj["ts"] {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or(StructureError::TsNotNumber)?,
            _ => return Err(StructureError::TsNotNumber),
        };
        if !obj["payload"].is_object() {
            return Err(StructureError::PayloadNotObject);
        }
        let sig = obj.get("sig").and_then(Value::as_str).unwrap_or_default();
        let alg = obj.get("alg").and_then(Value::as_str).map(str::to_string);
        Ok(Envelope {
            kind: kind.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            ts,
            payload: obj["payload"].clone(),
            sig: sig.to_string(),
            alg,
        })
    }

    /// Dedupe key: `ts|from|to|hex(sha256(canonical(payload)))`.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(canonical(&self.payload));
        format!("{}|{}|{}|{}", self.ts, self.from, self.to, hex::encode(digest))
    }

    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    pub fn payload_u16(&self, field: &str) -> Option<u16> {
        self.payload
            .get(field)
            .and_then(Value::as_u64)
            .and_then(|n| u16::try_from(n).ok())
    }
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_millis() as i64
}

/// Canonical-form version-4 UUID check, for `from` fields.
pub fn is_uuid4(s: &str) -> bool {
    match uuid::Uuid::parse_str(s) {
        Ok(id) => id.get_version_num() == 4 && id.to_string() == s,
        Err(_) => false,
    }
}

pub fn sign_payload(payload: &Value, key: &RsaPrivateKey) -> String {
    b64::encode(pss::sign(key, &canonical(payload)))
}

/// Total: any decode or key error is `false`.
pub fn verify_payload(public: &RsaPublicKey, payload: &Value, sig_b64u: &str) -> bool {
    let Ok(sig) = b64::decode(sig_b64u) else {
        return false;
    };
    pss::verify(public, &canonical(payload), &sig)
}

/// Frame types that may travel unsigned. Handshake frames arrive before any
/// key exchange; advertise/remove are self-certifying and checked inside
/// their handlers against the advertised or cached user key.
pub fn signature_optional(kind: &str) -> bool {
    kind.starts_with(frame::USER_HELLO)
        || kind.starts_with(frame::SERVER_HELLO_PREFIX)
        || kind.starts_with(frame::BOOTSTRAP_PREFIX)
        || matches!(kind, frame::HEARTBEAT | frame::USER_ADVERTISE | frame::USER_REMOVE)
}

pub type PubKeyLookup = Arc<dyn Fn(&str) -> Option<RsaPublicKey> + Send + Sync>;
pub type Verifier = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Build the transport's signature policy as a total function over envelopes.
pub fn make_verifier(lookup: PubKeyLookup) -> Verifier {
    Arc::new(move |env: &Envelope| {
        if signature_optional(&env.kind) {
            return true;
        }
        if env.sig.is_empty() {
            return false;
        }
        let Some(public) = lookup(&env.from) else {
            return false;
        };
        verify_payload(&public, &env.payload, &env.sig)
    })
}
