// WebSocket broadcast hub
//
// Fans every gaze event out to all connected subscribers. Each accepted
// connection gets an outbound queue and its own task; a failed socket
// send ends that task and removes the subscriber, without affecting
// delivery to anyone else. Subscribers receive only events published
// after they join, in publish order.

use crate::types::GazeEvent;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type SubscriberId = u64;

/// Connection metadata for the status surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub peer: Option<String>,
    pub connected_at: DateTime<Utc>,
}

struct Subscriber {
    sender: mpsc::UnboundedSender<Message>,
    peer: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
}

pub struct BroadcastHub {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    events_published: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            events_published: AtomicU64::new(0),
        }
    }

    /// Add a subscriber and hand back its outbound queue.
    ///
    /// Returns `None` once the hub has shut down.
    pub fn subscribe(
        &self,
        peer: Option<SocketAddr>,
    ) -> Option<(SubscriberId, mpsc::UnboundedReceiver<Message>)> {
        if !self.accepting.load(Ordering::Relaxed) {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.subscribers.write().insert(
            id,
            Subscriber {
                sender: tx,
                peer,
                connected_at: Utc::now(),
            },
        );

        Some((id, rx))
    }

    /// Remove a subscriber. Removing an absent id is a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.write().remove(&id);
    }

    /// Serialize `event` and send it to every subscriber.
    ///
    /// A subscriber whose queue has gone away is removed; the rest are
    /// unaffected. Returns the number of successful deliveries.
    pub fn publish(&self, event: &GazeEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize gaze event: {}", e);
                return 0;
            }
        };

        let mut dropped = Vec::new();
        let mut delivered = 0;

        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if subscriber
                    .sender
                    .send(Message::Text(payload.clone().into()))
                    .is_err()
                {
                    dropped.push(*id);
                } else {
                    delivered += 1;
                }
            }
        }

        if !dropped.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in dropped {
                debug!("Pruning dead subscriber {}", id);
                subscribers.remove(&id);
            }
        }

        self.events_published.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Stop accepting subscribers, notify the current ones of closure,
    /// and clear the set.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Relaxed);

        let mut subscribers = self.subscribers.write();
        for (id, subscriber) in subscribers.drain() {
            debug!("Closing subscriber {}", id);
            let _ = subscriber.sender.send(Message::Close(None));
        }
    }

    /// Re-arm the hub for a new streaming session
    pub fn reset(&self) {
        self.accepting.store(true, Ordering::Relaxed);
        self.events_published.store(0, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn subscriber_info(&self) -> Vec<SubscriberInfo> {
        self.subscribers
            .read()
            .iter()
            .map(|(id, s)| SubscriberInfo {
                id: *id,
                peer: s.peer.map(|p| p.to_string()),
                connected_at: s.connected_at,
            })
            .collect()
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept subscriber connections on `listener` until cancelled
pub async fn serve(listener: TcpListener, hub: Arc<BroadcastHub>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Broadcast listener closed");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_subscriber(stream, Arc::clone(&hub)));
                }
                Err(e) => {
                    warn!("Failed to accept subscriber connection: {}", e);
                }
            }
        }
    }
}

/// Drive one subscriber connection: forward published events to the
/// socket, answer pings, and leave on close or send failure.
async fn handle_subscriber(stream: TcpStream, hub: Arc<BroadcastHub>) {
    let peer = stream.peer_addr().ok();

    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let Some((id, mut outbound)) = hub.subscribe(peer) else {
        debug!("Rejecting subscriber, hub is shutting down");
        return;
    };

    info!(
        "Subscriber {} connected{}",
        id,
        peer.map(|p| format!(" from {}", p)).unwrap_or_default()
    );

    let (mut sender, mut receiver) = ws.split();

    loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(msg) => {
                        let closing = matches!(msg, Message::Close(_));
                        if sender.send(msg).await.is_err() {
                            // Send failure is how a silent disconnect is
                            // detected; drop this subscriber only.
                            debug!("Send to subscriber {} failed", id);
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    None => break,
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Subscribers are listen-only; anything else is ignored
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    hub.unsubscribe(id);
    info!("Subscriber {} disconnected", id);
}
