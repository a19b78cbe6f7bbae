use anyhow::Result;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::envelope::Envelope;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsReader = SplitStream<WsStream>;

/// Spawn the writer task for one connection. All outbound traffic goes
/// through the returned mailbox, which serialises concurrent writers; the
/// task drains until the mailbox closes or a Close frame goes out.
pub fn spawn_writer(mut sink: SplitSink<WsStream, Message>) -> UnboundedSender<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });
    tx
}

/// Next text frame off the wire, skipping control frames. `None` means the
/// connection is done (closed, errored, or sent non-UTF-8 binary).
pub async fn recv_frame(reader: &mut WsReader) -> Option<String> {
    loop {
        match reader.next().await? {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Binary(bin)) => return String::from_utf8(bin).ok(),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Err(_) => return None,
        }
    }
}

/// Send an envelope through a raw mailbox, for the window before a `Link`
/// exists (outbound handshakes, first-frame errors).
pub fn send_envelope(tx: &UnboundedSender<Message>, env: &Envelope) -> Result<()> {
    let text = serde_json::to_string(env)?;
    tx.send(Message::Text(text))
        .map_err(|_| anyhow::anyhow!("connection is gone"))
}
