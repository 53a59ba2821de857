pub mod envelope;
pub mod ws_server;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use qci_core::{Event, SyncMetrics};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

pub use envelope::{ClientEnvelope, ServerEnvelope};
pub use ws_server::{serve, start_ws_server};

const EVENTS_CAPACITY: usize = 1024;
const METRICS_CAPACITY: usize = 32;
const COMMAND_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub enum IncomingCommand {
    ConsciousnessUpdate {
        client_id: u64,
        level: Option<f32>,
        weight: Option<f32>,
        data: JsonValue,
    },
    Chat {
        client_id: u64,
        message: String,
    },
    Raw {
        client_id: u64,
        value: JsonValue,
    },
}

#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub id: u64,
    pub last_ping: Instant,
    pub connected_at: Instant,
    pub addr: String,
}

struct HubInner {
    events_tx: broadcast::Sender<ServerEnvelope>,
    metrics_tx: broadcast::Sender<ServerEnvelope>,
    command_tx: mpsc::Sender<IncomingCommand>,
    command_rx: Mutex<Option<mpsc::Receiver<IncomingCommand>>>,
    clients: Mutex<Vec<ClientSnapshot>>,
    next_client_id: AtomicU64,
}

#[derive(Clone)]
pub struct BridgeHub {
    inner: Arc<HubInner>,
}

impl BridgeHub {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);
        let (metrics_tx, _) = broadcast::channel(METRICS_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        BridgeHub {
            inner: Arc::new(HubInner {
                events_tx,
                metrics_tx,
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
                clients: Mutex::new(Vec::new()),
                next_client_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn publish_event(&self, event: &Event) {
        match serde_json::to_value(event) {
            Ok(event) => self.broadcast(ServerEnvelope::Event { event }),
            Err(err) => debug!(error = %err, "bridge.event_encode_failed"),
        }
    }

    pub fn publish_metrics(&self, metrics: &SyncMetrics) {
        match serde_json::to_value(metrics) {
            Ok(metrics) => {
                let _ = self.inner.metrics_tx.send(ServerEnvelope::Metrics { metrics });
            }
            Err(err) => debug!(error = %err, "bridge.metrics_encode_failed"),
        }
    }

    pub fn broadcast(&self, envelope: ServerEnvelope) {
        let _ = self.inner.events_tx.send(envelope);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEnvelope> {
        self.inner.events_tx.subscribe()
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<ServerEnvelope> {
        self.inner.metrics_tx.subscribe()
    }

    pub fn command_sender(&self) -> mpsc::Sender<IncomingCommand> {
        self.inner.command_tx.clone()
    }

    /// The single consumer end of the command queue; `None` once taken.
    pub fn take_command_receiver(&self) -> Option<mpsc::Receiver<IncomingCommand>> {
        self.inner.command_rx.lock().take()
    }

    pub fn next_client_id(&self) -> u64 {
        self.inner.next_client_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn list_clients(&self) -> Vec<ClientSnapshot> {
        self.inner.clients.lock().clone()
    }

    pub fn register_client(&self, snapshot: ClientSnapshot) {
        self.inner.clients.lock().push(snapshot);
    }

    pub fn update_ping(&self, id: u64) {
        let mut guard = self.inner.clients.lock();
        if let Some(client) = guard.iter_mut().find(|c| c.id == id) {
            client.last_ping = Instant::now();
        }
    }

    pub fn remove_client(&self, id: u64) {
        self.inner.clients.lock().retain(|c| c.id != id);
    }
}

impl Default for BridgeHub {
    fn default() -> Self {
        Self::new()
    }
}

pub fn age_since(instant: Instant) -> Duration {
    instant.elapsed()
}

pub fn format_clients(clients: &[ClientSnapshot]) -> Vec<String> {
    clients
        .iter()
        .map(|client| {
            format!(
                "id={} addr={} connected={}s ago last_ping={}s ago",
                client.id,
                client.addr,
                age_since(client.connected_at).as_secs(),
                age_since(client.last_ping).as_secs()
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use qci_core::{EventPayload, EventSystem, CONSCIOUSNESS_SHIFT};

    #[tokio::test]
    async fn events_reach_subscribers_as_envelopes() {
        let hub = BridgeHub::new();
        let mut rx = hub.subscribe_events();
        let events = EventSystem::default();
        let captured = std::sync::Arc::new(Mutex::new(None));
        let sink = captured.clone();
        events
            .subscribe(
                CONSCIOUSNESS_SHIFT,
                move |event: &Event| {
                    *sink.lock() = Some(event.clone());
                    Ok(())
                },
                Default::default(),
            )
            .unwrap();
        events.emit(CONSCIOUSNESS_SHIFT, EventPayload::LevelUpdate { level: 0.7 }, 0.7);
        let event = captured.lock().clone().unwrap();
        hub.publish_event(&event);
        match rx.recv().await.unwrap() {
            ServerEnvelope::Event { event } => {
                assert_eq!(event["channel"], CONSCIOUSNESS_SHIFT);
                assert_eq!(event["payload"]["type"], "level_update");
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn command_receiver_is_taken_once() {
        let hub = BridgeHub::new();
        assert!(hub.take_command_receiver().is_some());
        assert!(hub.clone().take_command_receiver().is_none());
    }

    #[test]
    fn clients_are_tracked() {
        let hub = BridgeHub::new();
        let id = hub.next_client_id();
        hub.register_client(ClientSnapshot {
            id,
            last_ping: Instant::now(),
            connected_at: Instant::now(),
            addr: "127.0.0.1:9".into(),
        });
        hub.update_ping(id);
        assert_eq!(format_clients(&hub.list_clients()).len(), 1);
        hub.remove_client(id);
        assert!(hub.list_clients().is_empty());
        assert_eq!(hub.next_client_id(), id + 1);
    }
}
