use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::envelope::{level_from_update, ClientEnvelope, ServerEnvelope};
use crate::{BridgeHub, ClientSnapshot, IncomingCommand};

const PING_EVERY: Duration = Duration::from_secs(30);

pub async fn start_ws_server(hub: BridgeHub, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind websocket server to {addr}"))?;
    info!(addr = %addr, "ws_server.listening");
    serve(hub, listener).await
}

pub async fn serve(hub: BridgeHub, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .with_context(|| "failed to accept websocket connection")?;
        let hub = hub.clone();
        tokio::spawn(async move {
            handle_client(hub, stream, peer.to_string()).await;
        });
    }
}

async fn handle_client(hub: BridgeHub, stream: TcpStream, peer_addr: String) {
    let ws_stream = match accept_async(stream).await {
        Ok(stream) => stream,
        Err(err) => {
            error!(peer = %peer_addr, error = %err, "ws_server.accept_failed");
            return;
        }
    };
    let (mut sink, mut source) = ws_stream.split();
    let client_id = hub.next_client_id();
    hub.register_client(ClientSnapshot {
        id: client_id,
        last_ping: Instant::now(),
        connected_at: Instant::now(),
        addr: peer_addr.clone(),
    });
    info!(client = client_id, peer = %peer_addr, "ws_server.client_connected");

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    let event_rx = hub.subscribe_events();
    let metrics_rx = hub.subscribe_metrics();
    let cmd_tx = hub.command_sender();

    let welcome = ServerEnvelope::Welcome { client_id };
    let _ = out_tx.send(Message::Text(welcome.to_text())).await;

    let send_loop = async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    };
    let mut send_task = tokio::spawn(send_loop);
    let mut events_task = tokio::spawn(pump(event_rx, out_tx.clone()));
    let mut metrics_task = tokio::spawn(pump(metrics_rx, out_tx.clone()));

    let mut ping_interval = time::interval_at(time::Instant::now() + PING_EVERY, PING_EVERY);

    loop {
        tokio::select! {
            biased;
            _ = ping_interval.tick() => {
                if out_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_text(&hub, &cmd_tx, client_id, &text) {
                            if out_tx.send(Message::Text(reply.to_text())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => hub.update_ping(client_id),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(client = client_id, error = %err, "ws_server.recv_error");
                        break;
                    }
                }
            }
            _ = &mut send_task => break,
            _ = &mut events_task => break,
            _ = &mut metrics_task => break,
        }
    }

    send_task.abort();
    events_task.abort();
    metrics_task.abort();
    hub.remove_client(client_id);
    info!(client = client_id, "ws_server.client_disconnected");
}

async fn pump(mut rx: broadcast::Receiver<ServerEnvelope>, out: mpsc::Sender<Message>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if out.send(Message::Text(envelope.to_text())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "ws_server.lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn handle_text(
    hub: &BridgeHub,
    cmd_tx: &mpsc::Sender<IncomingCommand>,
    client_id: u64,
    text: &str,
) -> Option<ServerEnvelope> {
    let value: JsonValue = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(client = client_id, error = %err, "ws_server.decode_failed");
            return Some(ServerEnvelope::Error {
                message: format!("invalid json: {err}"),
            });
        }
    };
    let envelope = match serde_json::from_value::<ClientEnvelope>(value.clone()) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(client = client_id, error = %err, "ws_server.unknown_message");
            forward(cmd_tx, IncomingCommand::Raw { client_id, value });
            return Some(ServerEnvelope::Error {
                message: format!("unsupported message: {err}"),
            });
        }
    };
    match envelope {
        ClientEnvelope::Ping => {
            hub.update_ping(client_id);
            Some(ServerEnvelope::Pong {
                timestamp: unix_ms(),
            })
        }
        ClientEnvelope::ConsciousnessUpdate { data } => {
            let (level, weight) = level_from_update(&data);
            forward(
                cmd_tx,
                IncomingCommand::ConsciousnessUpdate {
                    client_id,
                    level,
                    weight,
                    data: data.clone(),
                },
            );
            hub.broadcast(ServerEnvelope::ConsciousnessUpdate { data });
            None
        }
        ClientEnvelope::Chat { message } => {
            forward(
                cmd_tx,
                IncomingCommand::Chat {
                    client_id,
                    message: message.clone(),
                },
            );
            hub.broadcast(ServerEnvelope::Chat { client_id, message });
            None
        }
    }
}

/// A full queue means the host is not draining commands; the frame is still
/// rebroadcast.
fn forward(cmd_tx: &mpsc::Sender<IncomingCommand>, command: IncomingCommand) {
    if let Err(err) = cmd_tx.try_send(command) {
        debug!(error = %err, "ws_server.command_dropped");
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
