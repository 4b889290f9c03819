//! Connected clients and reply routing
//!
//! Each client gets an outbound channel drained by its socket task. A call
//! is tracked under (client, id, tool) from dispatch until its reply is
//! delivered, so replies reach only the client that asked even when two
//! clients pick the same id. Delivered replies are kept for a short window
//! to suppress redelivery and to answer `retry` requests. Records carry a
//! fingerprint of the call's params: only a call with the same params counts
//! as a redelivery.

use crate::core::protocol::RequestId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub type ClientId = Uuid;

/// Identity of one call from one client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub client: ClientId,
    pub id: RequestId,
    pub tool: String,
}

impl CallKey {
    pub fn new(client: ClientId, id: &RequestId, tool: &str) -> Self {
        Self {
            client,
            id: id.clone(),
            tool: tool.to_string(),
        }
    }
}

/// What to do with an incoming call
#[derive(Debug, Clone, PartialEq)]
pub enum CallStart {
    /// Not seen before; dispatch it
    New,
    /// The same call is still running
    InFlight,
    /// Already answered within the dedup window; holds the sent frame
    Delivered(String),
    /// The id is still running with different params
    Conflict,
}

/// How a reply left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct,
    /// No caller record; sent to every client
    Broadcast,
    /// Already delivered within the window
    Duplicate,
    /// The originating client has disconnected
    Dropped,
}

#[derive(Debug, Clone)]
struct CallerRecord {
    fingerprint: String,
    started: Instant,
}

#[derive(Debug, Clone)]
struct DeliveredReply {
    fingerprint: String,
    frame: String,
    at: Instant,
}

pub struct ClientRegistry {
    clients: DashMap<ClientId, mpsc::UnboundedSender<String>>,
    callers: DashMap<CallKey, CallerRecord>,
    delivered: DashMap<CallKey, DeliveredReply>,
    dedup_window: Duration,
    caller_ttl: Duration,
}

impl ClientRegistry {
    pub fn new(dedup_window: Duration, caller_ttl: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            callers: DashMap::new(),
            delivered: DashMap::new(),
            dedup_window,
            caller_ttl,
        }
    }

    /// Register a client and hand back the receiver its socket task drains
    pub fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.clients.insert(id, tx);
        debug!(client = %id, "Client registered ({} connected)", self.clients.len());
        (id, rx)
    }

    /// Forget a client along with its call records
    pub fn unregister(&self, client: ClientId) {
        self.clients.remove(&client);
        self.delivered.retain(|key, _| key.client != client);
        debug!(client = %client, "Client unregistered ({} connected)", self.clients.len());
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn in_flight(&self) -> usize {
        self.callers.len()
    }

    pub fn send_to(&self, client: ClientId, frame: String) -> bool {
        match self.clients.get(&client) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn broadcast(&self, frame: &str) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.value().send(frame.to_string()).is_ok())
            .count()
    }

    /// Record a call as in flight unless it is running or was just answered.
    /// `fingerprint` identifies the call's params.
    pub fn begin_call(&self, key: &CallKey, fingerprint: &str) -> CallStart {
        if let Some(reply) = self.delivered.get(key) {
            if reply.at.elapsed() <= self.dedup_window {
                if reply.fingerprint == fingerprint {
                    return CallStart::Delivered(reply.frame.clone());
                }
                warn!(client = %key.client, id = %key.id, tool = %key.tool, "Id reused with different params, running it as a new call");
            }
        }
        match self.callers.entry(key.clone()) {
            Entry::Occupied(entry) if entry.get().fingerprint == fingerprint => CallStart::InFlight,
            Entry::Occupied(_) => {
                warn!(client = %key.client, id = %key.id, tool = %key.tool, "Id already in flight with different params");
                CallStart::Conflict
            }
            Entry::Vacant(slot) => {
                slot.insert(CallerRecord {
                    fingerprint: fingerprint.to_string(),
                    started: Instant::now(),
                });
                CallStart::New
            }
        }
    }

    /// Route a finished call's reply back to its caller
    pub fn complete(&self, key: &CallKey, frame: String) -> Delivery {
        let Some((_, caller)) = self.callers.remove(key) else {
            if let Some(reply) = self.delivered.get(key) {
                if reply.at.elapsed() <= self.dedup_window {
                    debug!(client = %key.client, id = %key.id, tool = %key.tool, "Dropping duplicate reply");
                    return Delivery::Duplicate;
                }
            }
            warn!(id = %key.id, tool = %key.tool, "No caller recorded, broadcasting reply");
            self.broadcast(&frame);
            return Delivery::Broadcast;
        };

        // Recorded before sending so a redelivery racing the reply is caught
        self.delivered.insert(
            key.clone(),
            DeliveredReply {
                fingerprint: caller.fingerprint,
                frame: frame.clone(),
                at: Instant::now(),
            },
        );
        if !self.send_to(key.client, frame) {
            self.delivered.remove(key);
            debug!(client = %key.client, id = %key.id, "Caller disconnected, reply dropped");
            return Delivery::Dropped;
        }
        Delivery::Direct
    }

    /// Expire caller records and delivered replies
    pub fn sweep(&self) -> usize {
        let before = self.callers.len() + self.delivered.len();
        let caller_ttl = self.caller_ttl;
        let dedup_window = self.dedup_window;
        self.callers.retain(|_, caller| caller.started.elapsed() <= caller_ttl);
        self.delivered.retain(|_, reply| reply.at.elapsed() <= dedup_window);
        before.saturating_sub(self.callers.len() + self.delivered.len())
    }
}
