//! Connection registry and broadcast coordination.
//!
//! The hub owns the set of live connections. All membership changes and
//! fan-out go through one control-loop task fed by three bounded request
//! queues, so admits, evicts and broadcasts are applied strictly one at a
//! time and a presence snapshot can never observe a half-applied change.
//!
//! Delivery into a connection's mailbox is best-effort: a full mailbox
//! drops that one recipient's copy rather than stalling the loop.

use std::collections::HashMap;

use axum::extract::ws::Utf8Bytes;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use ephemera_protocol::{PresenceUser, ServerMessage};

/// Capacity of a connection's outbound mailbox.
pub const MAILBOX_CAPACITY: usize = 256;

const ADMIT_QUEUE_SIZE: usize = 64;
const EVICT_QUEUE_SIZE: usize = 64;
const BROADCAST_QUEUE_SIZE: usize = 256;

/// Producer half of a connection's outbound mailbox. Serialized frames go
/// in from any task; only that connection's outbound pump takes them out.
pub type Mailbox = mpsc::Sender<Utf8Bytes>;

struct Admission {
    id: String,
    mailbox: Mailbox,
}

struct Fanout {
    frame: Utf8Bytes,
    exclude: Option<String>,
}

/// Handle to the hub control loop. Cheap to clone; connection tasks talk
/// to the registry only through it, never by sharing the map.
#[derive(Clone)]
pub struct Hub {
    admit_tx: mpsc::Sender<Admission>,
    evict_tx: mpsc::Sender<String>,
    broadcast_tx: mpsc::Sender<Fanout>,
}

impl Hub {
    /// Create a hub and spawn its control loop.
    pub fn new() -> Self {
        let (admit_tx, admit_rx) = mpsc::channel(ADMIT_QUEUE_SIZE);
        let (evict_tx, evict_rx) = mpsc::channel(EVICT_QUEUE_SIZE);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE_SIZE);

        tokio::spawn(run(admit_rx, evict_rx, broadcast_rx));

        Self {
            admit_tx,
            evict_tx,
            broadcast_tx,
        }
    }

    /// Add a connection to the registry and redistribute presence.
    pub async fn admit(&self, id: &str, mailbox: Mailbox) {
        let admission = Admission {
            id: id.to_string(),
            mailbox,
        };
        if self.admit_tx.send(admission).await.is_err() {
            warn!("hub is gone, cannot admit connection {id}");
        }
    }

    /// Remove a connection and close its mailbox. Evicting an id that is
    /// not registered is a no-op.
    pub async fn evict(&self, id: &str) {
        if self.evict_tx.send(id.to_string()).await.is_err() {
            warn!("hub is gone, cannot evict connection {id}");
        }
    }

    /// Fan a payload out to every registered connection except `exclude`.
    ///
    /// The payload is serialized to its wire form exactly once; a
    /// serialization failure aborts this one broadcast with zero
    /// deliveries and leaves the registry untouched.
    pub async fn broadcast<T: Serialize>(&self, payload: &T, exclude: Option<&str>) {
        let frame = match serde_json::to_string(payload) {
            Ok(frame) => Utf8Bytes::from(frame),
            Err(err) => {
                warn!("failed to encode broadcast payload: {err}");
                return;
            }
        };
        let fanout = Fanout {
            frame,
            exclude: exclude.map(str::to_string),
        };
        if self.broadcast_tx.send(fanout).await.is_err() {
            warn!("hub is gone, dropping broadcast");
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// The control loop. Exits once every [`Hub`] handle has been dropped.
async fn run(
    mut admit_rx: mpsc::Receiver<Admission>,
    mut evict_rx: mpsc::Receiver<String>,
    mut broadcast_rx: mpsc::Receiver<Fanout>,
) {
    let mut registry = Registry::default();

    loop {
        tokio::select! {
            admission = admit_rx.recv() => match admission {
                Some(admission) => registry.admit(admission),
                None => break,
            },
            id = evict_rx.recv() => match id {
                Some(id) => registry.evict(&id),
                None => break,
            },
            fanout = broadcast_rx.recv() => match fanout {
                Some(fanout) => registry.fan_out(&fanout.frame, fanout.exclude.as_deref()),
                None => break,
            },
        }
    }

    debug!(
        "hub control loop stopped ({} connections)",
        registry.connections.len()
    );
}

/// Live connection set. Owned exclusively by the control-loop task.
#[derive(Default)]
struct Registry {
    connections: HashMap<String, Mailbox>,
}

impl Registry {
    fn admit(&mut self, admission: Admission) {
        self.connections.insert(admission.id.clone(), admission.mailbox);
        info!(
            "connection admitted: {} (total: {})",
            admission.id,
            self.connections.len()
        );
        self.disseminate_presence();
    }

    fn evict(&mut self, id: &str) {
        // Removing the entry drops the mailbox sender; once the connection's
        // own reply handle is gone too, the outbound pump observes closure
        // as its signal to send a close frame and stop.
        if self.connections.remove(id).is_none() {
            return;
        }
        info!(
            "connection evicted: {id} (total: {})",
            self.connections.len()
        );
        self.disseminate_presence();
    }

    fn fan_out(&self, frame: &Utf8Bytes, exclude: Option<&str>) {
        for (id, mailbox) in &self.connections {
            if exclude == Some(id.as_str()) {
                continue;
            }
            offer(id, mailbox, frame.clone());
        }
    }

    /// Deliver a tailored presence snapshot to every connection: each
    /// recipient gets the list of all ids other than its own.
    fn disseminate_presence(&self) {
        for (id, mailbox) in &self.connections {
            let users = self
                .connections
                .keys()
                .filter(|other| *other != id)
                .map(|other| PresenceUser { id: other.clone() })
                .collect();
            let snapshot = ServerMessage::Presence { users };
            match serde_json::to_string(&snapshot) {
                Ok(frame) => offer(id, mailbox, Utf8Bytes::from(frame)),
                Err(err) => warn!("failed to encode presence for {id}: {err}"),
            }
        }
    }
}

fn offer(id: &str, mailbox: &Mailbox, frame: Utf8Bytes) {
    match mailbox.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!("mailbox full for connection {id}, dropping message");
        }
        Err(TrySendError::Closed(_)) => {
            debug!("mailbox closed for connection {id}, dropping message");
        }
    }
}
