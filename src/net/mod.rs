//! The transport: one websocket listener for users and peers alike. The
//! first frame on a connection classifies it (SERVER_HELLO_* or USER_HELLO);
//! every later frame is structure-checked, signature-checked and dispatched.

pub mod conn;

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use futures::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream};
use tracing::{debug, info, warn};

use crate::directory::{Link, Role};
use crate::envelope::{frame, is_uuid4, Envelope, ErrorCode};
use crate::handlers;
use crate::node::Ctx;
use conn::{recv_frame, send_envelope, spawn_writer, WsReader};

/// Deadline for the websocket upgrade and the first (HELLO) frame.
pub const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection that stays silent this long is closed; any inbound frame
/// resets the clock.
pub const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-connection protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    New,
    HelloReceived,
    Active,
    Closed,
}

pub async fn listen(ctx: Ctx, listener: TcpListener) -> Result<()> {
    info!("listening on {}", listener.local_addr()?);
    loop {
        match listener.accept().await {
            Err(e) => {
                warn!("error accepting connection: {e}");
            }
            Ok((stream, socket_addr)) => {
                debug!("got connection from {socket_addr}");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(ctx, stream).await {
                        debug!("connection from {socket_addr} ended: {e}");
                    }
                });
            }
        }
    }
}

async fn handle_inbound(ctx: Ctx, stream: tokio::net::TcpStream) -> Result<()> {
    let ws = timeout(FIRST_FRAME_TIMEOUT, accept_async(MaybeTlsStream::Plain(stream)))
        .await
        .map_err(|_| anyhow!("websocket upgrade timed out"))??;
    let (sink, mut reader) = ws.split();
    let tx = spawn_writer(sink);

    let mut state = ConnState::New;
    debug!("inbound connection: {state:?}");

    // first frame decides whether this is a peer link or a user link
    let Ok(Some(text)) = timeout(FIRST_FRAME_TIMEOUT, recv_frame(&mut reader)).await else {
        bail!("no hello frame before deadline");
    };
    let env = match Envelope::parse(&text) {
        Ok(env) => env,
        Err(e) => {
            let err = error_frame(&ctx, "", ErrorCode::UnknownType, &format!("bad_first_frame:{e}"));
            let _ = send_envelope(&tx, &err);
            bail!("malformed first frame: {e}");
        }
    };
    if !is_uuid4(&env.from) {
        let err = error_frame(&ctx, &env.from, ErrorCode::BadKey, "from:not_uuid4");
        let _ = send_envelope(&tx, &err);
        bail!("first frame with invalid sender id");
    }
    let role = if env.kind.starts_with(frame::SERVER_HELLO_PREFIX) {
        Role::Server
    } else if env.kind == frame::USER_HELLO {
        Role::User
    } else {
        let err = error_frame(&ctx, &env.from, ErrorCode::UnknownType, "first frame must be HELLO");
        let _ = send_envelope(&tx, &err);
        bail!("first frame was {}, not a hello", env.kind);
    };
    state = ConnState::HelloReceived;
    let link = Link::new(role, env.from.clone(), tx);
    debug!("connection {} ({role:?}): {state:?}", link.id);
    dispatch(&ctx, &link, env).await;

    state = ConnState::Active;
    debug!("connection {}: {state:?}", link.id);
    active_loop(&ctx, &link, &mut reader).await;

    state = ConnState::Closed;
    debug!("connection {}: {state:?}", link.id);
    cleanup(&ctx, &link);
    Ok(())
}

/// Read frames until the connection closes or goes idle past the deadline.
pub async fn active_loop(ctx: &Ctx, link: &Link, reader: &mut WsReader) {
    loop {
        match timeout(CONNECTION_IDLE_TIMEOUT, recv_frame(reader)).await {
            Err(_) => {
                debug!("connection {} idle past deadline", link.id);
                link.close("idle timeout");
                return;
            }
            Ok(None) => return,
            Ok(Some(text)) => {
                if !handle_frame(ctx, link, &text).await {
                    link.close("protocol error");
                    return;
                }
            }
        }
    }
}

/// One frame: structure check, signature policy, dispatch. Returns false
/// when the link should be torn down.
async fn handle_frame(ctx: &Ctx, link: &Link, text: &str) -> bool {
    let env = match Envelope::parse(text) {
        Ok(env) => env,
        Err(e) => {
            handlers::send_error(ctx, link, ErrorCode::UnknownType, &e.to_string());
            return false;
        }
    };

    if link.role == Role::Server {
        ctx.router.note_peer_seen(&link.id);
    }

    if !(ctx.verifier)(&env) {
        debug!("dropping {} from {} with bad signature", env.kind, env.from);
        handlers::send_error(ctx, link, ErrorCode::InvalidSig, "verification_failed");
        return true;
    }

    dispatch(ctx, link, env).await;
    true
}

/// Handler faults are reported to the link but never tear it down.
async fn dispatch(ctx: &Ctx, link: &Link, env: Envelope) {
    let kind = env.kind.clone();
    if let Err(e) = handlers::dispatch(ctx, link, env).await {
        warn!("handler for {kind} failed: {e}");
        handlers::send_error(ctx, link, ErrorCode::Timeout, &format!("handler_exception:{kind}"));
    }
}

/// Detach a closed connection from the directory. A user link additionally
/// gossips its departure to every connected peer.
pub fn cleanup(ctx: &Ctx, link: &Link) {
    match link.role {
        Role::Server => {
            if ctx.dir.detach_peer(&link.id, link.conn_id) {
                info!("peer disconnected: {}", link.id);
            }
        }
        Role::User => {
            if ctx.dir.detach_user(&link.id, link.conn_id) {
                info!("user disconnected: {}", link.id);
                ctx.dir.remove_advertise(&link.id);
                let remove = Envelope::new(
                    frame::USER_REMOVE,
                    &link.id,
                    "",
                    json!({"user_id": link.id, "location": "local"}),
                );
                for peer in ctx.dir.peers.iter() {
                    let _ = peer.value().send(&remove);
                }
            }
        }
    }
}

fn error_frame(ctx: &Ctx, to: &str, code: ErrorCode, detail: &str) -> Envelope {
    Envelope::signed(
        frame::ERROR,
        &ctx.server_id,
        to,
        json!({"code": code.as_str(), "detail": detail}),
        &ctx.signing_key,
    )
}

pub fn make_conn_url(host: &str, port: u16) -> Result<url::Url> {
    Ok(url::Url::parse(&format!("ws://{host}:{port}"))?)
}

/// Open an outbound peer connection: send our signed SERVER_HELLO_JOIN,
/// expect a SERVER_WELCOME back, then fall into the ordinary frame loop.
/// Returns when the connection dies.
pub async fn dial_peer(ctx: Ctx, host: String, port: u16) -> Result<()> {
    let url = make_conn_url(&host, port)?;
    let (ws, _response) = timeout(FIRST_FRAME_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| anyhow!("connect to {host}:{port} timed out"))??;
    let (sink, mut reader) = ws.split();
    let tx = spawn_writer(sink);

    let join = Envelope::signed(
        frame::SERVER_HELLO_JOIN,
        &ctx.server_id,
        "",
        json!({
            "host": ctx.cfg.advertised_host(),
            "port": ctx.listen_port,
            "pubkey": ctx.public_pem,
        }),
        &ctx.signing_key,
    );
    send_envelope(&tx, &join)?;

    let Ok(Some(text)) = timeout(FIRST_FRAME_TIMEOUT, recv_frame(&mut reader)).await else {
        bail!("no reply from {host}:{port} before deadline");
    };
    let env = Envelope::parse(&text).map_err(|e| anyhow!("malformed welcome: {e}"))?;
    if env.kind != frame::SERVER_WELCOME {
        bail!("expected SERVER_WELCOME from {host}:{port}, got {}", env.kind);
    }
    let sid = env.from.clone();
    if !is_uuid4(&sid) {
        bail!("peer at {host}:{port} has invalid server id");
    }

    // the dialer knows the peer's address; the handler records the rest
    ctx.dir.server_addrs.insert(sid.clone(), (host.clone(), port));

    let link = Link::new(Role::Server, sid.clone(), tx);
    dispatch(&ctx, &link, env).await;
    if !ctx.dir.peers.contains_key(&sid) {
        bail!("peer {sid} rejected during welcome");
    }
    info!("joined mesh peer {sid} at {host}:{port}");

    active_loop(&ctx, &link, &mut reader).await;
    cleanup(&ctx, &link);
    Ok(())
}
