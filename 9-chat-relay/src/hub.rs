//! The hub: one control loop that owns session membership and fan-out.
//!
//! Sessions never touch the membership map. They talk to the hub through a
//! [`HubHandle`], whose three unbounded channels (register, unregister,
//! broadcast) feed [`Hub::run`]. Because only that loop mutates the map, every
//! broadcast sees one consistent membership and needs no lock.
//!
//! Delivery into a session's bounded outbound queue never waits. A session
//! whose queue is full is evicted on the spot, so a stalled reader cannot hold
//! up everyone else.

use std::collections::HashMap;

use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    protocol::{Payload, default_nickname},
};

pub type SessionId = u64;

/// What a session learns from the hub when it joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: SessionId,
    pub default_name: String,
}

struct RegisterRequest {
    outbound: mpsc::Sender<Payload>,
    reply: oneshot::Sender<Registration>,
}

struct BroadcastRequest {
    origin: Option<SessionId>,
    payload: Payload,
}

/// Cloneable entry point into a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::UnboundedSender<RegisterRequest>,
    unregister_tx: mpsc::UnboundedSender<SessionId>,
    broadcast_tx: mpsc::UnboundedSender<BroadcastRequest>,
}

impl HubHandle {
    /// Adds a session whose outbound queue is `outbound`. The hub keeps the
    /// only long-lived sender; dropping it is how the session is told to stop
    /// writing.
    pub async fn register(
        &self,
        outbound: mpsc::Sender<Payload>,
    ) -> Result<Registration, SessionError> {
        let (reply, registered) = oneshot::channel();
        self.register_tx
            .send(RegisterRequest { outbound, reply })
            .map_err(|_| SessionError::HubClosed)?;
        registered.await.map_err(|_| SessionError::HubClosed)
    }

    /// Removes a session. Safe to call more than once for the same id.
    pub fn unregister(&self, id: SessionId) {
        if self.unregister_tx.send(id).is_err() {
            debug!(session = id, "hub already stopped; nothing to unregister");
        }
    }

    /// Queues `payload` for every member except `origin`.
    pub fn broadcast(
        &self,
        origin: Option<SessionId>,
        payload: Payload,
    ) -> Result<(), SessionError> {
        self.broadcast_tx
            .send(BroadcastRequest { origin, payload })
            .map_err(|_| SessionError::HubClosed)
    }
}

pub struct Hub {
    members: HashMap<SessionId, mpsc::Sender<Payload>>,
    next_id: SessionId,
    register_rx: mpsc::UnboundedReceiver<RegisterRequest>,
    unregister_rx: mpsc::UnboundedReceiver<SessionId>,
    broadcast_rx: mpsc::UnboundedReceiver<BroadcastRequest>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();

        let hub = Self {
            members: HashMap::new(),
            next_id: 1,
            register_rx,
            unregister_rx,
            broadcast_rx,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
        };
        (hub, handle)
    }

    /// Starts a hub on the current runtime.
    pub fn spawn() -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new();
        (handle, tokio::spawn(hub.run()))
    }

    /// Services one request per iteration until every [`HubHandle`] is gone.
    pub async fn run(mut self) {
        loop {
            select! {
                Some(request) = self.register_rx.recv() => self.handle_register(request),
                Some(id) = self.unregister_rx.recv() => self.handle_unregister(id),
                Some(request) = self.broadcast_rx.recv() => {
                    self.handle_broadcast(request.origin, request.payload);
                }
                else => break,
            }
        }
        debug!(members = self.members.len(), "hub stopped");
    }

    fn handle_register(&mut self, request: RegisterRequest) {
        let registration = self.insert(request.outbound);
        let id = registration.id;
        if request.reply.send(registration).is_err() {
            // The session went away before it learned its id.
            self.members.remove(&id);
        }
    }

    fn insert(&mut self, outbound: mpsc::Sender<Payload>) -> Registration {
        let id = self.next_id;
        self.next_id += 1;
        self.members.insert(id, outbound);

        let registration = Registration {
            id,
            default_name: default_nickname(self.members.len()),
        };
        debug!(session = id, members = self.members.len(), "session registered");
        registration
    }

    fn handle_unregister(&mut self, id: SessionId) {
        // Dropping the sender closes the session's queue.
        match self.members.remove(&id) {
            Some(_) => debug!(
                session = id,
                members = self.members.len(),
                "session unregistered"
            ),
            None => debug!(session = id, "unregister for unknown session ignored"),
        }
    }

    fn handle_broadcast(&mut self, origin: Option<SessionId>, payload: Payload) {
        if let Some(origin) = origin.filter(|id| !self.members.contains_key(id)) {
            debug!(session = origin, "broadcast from departed session dropped");
            return;
        }

        self.members.retain(|&id, outbound| {
            if Some(id) == origin {
                return true;
            }
            match outbound.try_send(Payload::clone(&payload)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(session = id, "outbound queue full; evicting session");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    info!(session = id, "outbound queue closed; dropping session");
                    false
                }
            }
        });
    }

    #[cfg(test)]
    fn is_member(&self, id: SessionId) -> bool {
        self.members.contains_key(&id)
    }
}
