//! WebSocket streaming surface: every connection receives the full snapshot
//! on connect and after every tick.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::api::{accepted, GovernorHandle};
use crate::logging::{log, obj, v_str, Domain, Level};

async fn stream_connection(stream: TcpStream, handle: GovernorHandle) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();
    let mut sub = handle.subscribe();
    let id = sub.id();
    log(Level::Info, Domain::Api, "ws_subscribed", obj(&[("subscriber", serde_json::json!(id))]));

    let result = async {
        write.send(Message::Text(handle.snapshot().to_json())).await?;
        loop {
            tokio::select! {
                next = sub.recv() => match next {
                    Some(snapshot) => write.send(Message::Text(snapshot.to_json())).await?,
                    None => break,
                },
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                },
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    handle.unsubscribe(id);
    log(Level::Info, Domain::Api, "ws_unsubscribed", obj(&[("subscriber", serde_json::json!(id))]));
    result
}

/// Accept WebSocket subscribers until the listener fails.
pub async fn serve_ws(listener: TcpListener, handle: GovernorHandle) -> Result<()> {
    loop {
        let Some((stream, peer)) = accepted(listener.accept().await, "ws_accept_failed").await else {
            continue;
        };
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(err) = stream_connection(stream, handle).await {
                log(
                    Level::Debug,
                    Domain::Api,
                    "ws_connection_closed",
                    obj(&[("peer", v_str(&peer.to_string())), ("error", v_str(&err.to_string()))]),
                );
            }
        });
    }
}
