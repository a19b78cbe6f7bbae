//! Builders for every user-originated frame. Each attaches the transport
//! signature over the canonical payload; chat and file frames additionally
//! carry the end-to-end content signature.

use rsa::RsaPrivateKey;
use serde_json::{json, Map, Value};

use crate::crypto::{b64, content_sig};
use crate::envelope::{frame, now_ms, Envelope};

pub fn user_hello(user_id: &str, server_id: &str, pubkey_pem: &str, key: &RsaPrivateKey) -> Envelope {
    Envelope::signed(
        frame::USER_HELLO,
        user_id,
        server_id,
        json!({
            "client": "cli-v1",
            "pubkey": pubkey_pem,
            "enc_pubkey": pubkey_pem,
        }),
        key,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn user_advertise(
    user_id: &str,
    pubkey_pem: &str,
    privkey_store: &str,
    pake_password: &str,
    meta: Value,
    version: u64,
    key: &RsaPrivateKey,
) -> Envelope {
    Envelope::signed(
        frame::USER_ADVERTISE,
        user_id,
        frame::BROADCAST,
        json!({
            "user_id": user_id,
            "pubkey": pubkey_pem,
            "privkey_store": privkey_store,
            "pake_password": pake_password,
            "meta": meta,
            "version": version,
        }),
        key,
    )
}

pub fn user_remove(user_id: &str, location: &str, key: &RsaPrivateKey) -> Envelope {
    Envelope::signed(
        frame::USER_REMOVE,
        user_id,
        "",
        json!({"user_id": user_id, "location": location}),
        key,
    )
}

/// Direct message: the ciphertext travels base64url-encoded; addressing is
/// repeated inside the payload so the content signature can bind it.
pub fn msg_direct(from: &str, to: &str, ciphertext: &[u8], key: &RsaPrivateKey) -> Envelope {
    let ts = now_ms();
    let payload = json!({
        "ciphertext": b64::encode(ciphertext),
        "from": from,
        "to": to,
        "ts": ts,
        "content_sig": content_sig::sign_direct(key, ciphertext, from, to, ts),
    });
    let mut env = Envelope::new(frame::MSG_DIRECT, from, to, payload);
    env.ts = ts;
    env.sign(key);
    env
}

pub fn msg_public(from: &str, nonce: Option<&str>, ciphertext: &[u8], key: &RsaPrivateKey) -> Envelope {
    let ts = now_ms();
    let mut payload = Map::new();
    if let Some(nonce) = nonce {
        payload.insert("nonce".into(), json!(nonce));
    }
    payload.insert("ciphertext".into(), json!(b64::encode(ciphertext)));
    payload.insert("from".into(), json!(from));
    payload.insert("to".into(), json!(frame::BROADCAST));
    payload.insert("ts".into(), json!(ts));
    payload.insert(
        "content_sig".into(),
        json!(content_sig::sign_public(key, ciphertext, from, ts)),
    );
    let mut env = Envelope::new(frame::MSG_PUBLIC_CHANNEL, from, frame::BROADCAST, Value::Object(payload));
    env.ts = ts;
    env.sign(key);
    env
}

pub fn file_start(
    from: &str,
    to: &str,
    file_id: &str,
    name: &str,
    size: u64,
    sha256_hex: &str,
    mode: &str,
    key: &RsaPrivateKey,
) -> Envelope {
    let ts = now_ms();
    let payload = json!({
        "file_id": file_id,
        "name": name,
        "size": size,
        "sha256": sha256_hex,
        "mode": mode,
        "content_sig": content_sig::sign_direct(key, b"", from, to, ts),
    });
    let mut env = Envelope::new(frame::FILE_START, from, to, payload);
    env.ts = ts;
    env.sign(key);
    env
}

pub fn file_chunk(
    from: &str,
    to: &str,
    file_id: &str,
    index: u64,
    ciphertext: &[u8],
    key: &RsaPrivateKey,
) -> Envelope {
    let ts = now_ms();
    let payload = json!({
        "file_id": file_id,
        "index": index,
        "ciphertext": b64::encode(ciphertext),
        "content_sig": content_sig::sign_direct(key, ciphertext, from, to, ts),
    });
    let mut env = Envelope::new(frame::FILE_CHUNK, from, to, payload);
    env.ts = ts;
    env.sign(key);
    env
}

pub fn file_end(from: &str, to: &str, file_id: &str, key: &RsaPrivateKey) -> Envelope {
    let ts = now_ms();
    let payload = json!({
        "file_id": file_id,
        "content_sig": content_sig::sign_direct(key, b"", from, to, ts),
    });
    let mut env = Envelope::new(frame::FILE_END, from, to, payload);
    env.ts = ts;
    env.sign(key);
    env
}

pub fn cmd_list(from: &str, key: &RsaPrivateKey) -> Envelope {
    Envelope::signed(frame::CMD_LIST, from, "", json!({}), key)
}

pub fn dir_get_pubkey(from: &str, user_id: &str, key: &RsaPrivateKey) -> Envelope {
    Envelope::signed(frame::DIR_GET_PUBKEY, from, "", json!({"user_id": user_id}), key)
}

pub fn dir_get_wrapped_key(from: &str, user_id: &str, key: &RsaPrivateKey) -> Envelope {
    Envelope::signed(
        frame::DIR_GET_WRAPPED_PUBLIC_KEY,
        from,
        "",
        json!({"user_id": user_id}),
        key,
    )
}
