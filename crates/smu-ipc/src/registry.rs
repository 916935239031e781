use std::{collections::BTreeMap, fmt, net::SocketAddr};

use tokio::sync::{mpsc, oneshot};

const REGISTRY_QUEUE: usize = 64;

/// Identifies one accepted client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(
    /// Monotonic numeric session identifier.
    pub u64,
);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Registration handed to a session task.
#[derive(Debug)]
pub struct SessionTicket {
    /// Assigned session identifier.
    pub id: SessionId,
    /// Resolves when the registry asks the session to stop.
    pub shutdown: oneshot::Receiver<()>,
}

struct SessionEntry {
    peer: SocketAddr,
    stop: oneshot::Sender<()>,
}

enum RegistryMsg {
    Register {
        peer: SocketAddr,
        reply: oneshot::Sender<Option<SessionTicket>>,
    },
    Deregister {
        id: SessionId,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Peers {
        reply: oneshot::Sender<Vec<(SessionId, SocketAddr)>>,
    },
    CloseAll {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the actor that owns the set of live sessions.
///
/// Every mutation and traversal of the set is a message processed in order by a
/// single task, so connect, disconnect, and close-all never interleave.
#[derive(Clone)]
pub struct SessionRegistry {
    tx: mpsc::Sender<RegistryMsg>,
}

impl SessionRegistry {
    /// Spawns the registry actor on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(REGISTRY_QUEUE);
        tokio::spawn(run_registry(rx));
        Self { tx }
    }

    /// Adds a session; returns `None` once the registry is closing.
    pub async fn register(&self, peer: SocketAddr) -> Option<SessionTicket> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryMsg::Register { peer, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Removes a session. Unknown ids are ignored.
    pub async fn deregister(&self, id: SessionId) {
        let _ = self.tx.send(RegistryMsg::Deregister { id }).await;
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryMsg::Count { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Live sessions and their peer addresses, ordered by id.
    pub async fn peers(&self) -> Vec<(SessionId, SocketAddr)> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryMsg::Peers { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Signals every live session to stop and refuses new registrations.
    ///
    /// Returns the number of sessions that were signalled.
    pub async fn close_all(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryMsg::CloseAll { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn run_registry(mut rx: mpsc::Receiver<RegistryMsg>) {
    let mut sessions: BTreeMap<SessionId, SessionEntry> = BTreeMap::new();
    let mut next_id = 1_u64;
    let mut closing = false;

    while let Some(msg) = rx.recv().await {
        match msg {
            RegistryMsg::Register { peer, reply } => {
                if closing {
                    let _ = reply.send(None);
                    continue;
                }
                let id = SessionId(next_id);
                next_id = next_id.saturating_add(1);
                let (stop, shutdown) = oneshot::channel();
                sessions.insert(id, SessionEntry { peer, stop });
                if reply.send(Some(SessionTicket { id, shutdown })).is_err() {
                    sessions.remove(&id);
                }
            }
            RegistryMsg::Deregister { id } => {
                sessions.remove(&id);
            }
            RegistryMsg::Count { reply } => {
                let _ = reply.send(sessions.len());
            }
            RegistryMsg::Peers { reply } => {
                let peers = sessions
                    .iter()
                    .map(|(id, entry)| (*id, entry.peer))
                    .collect();
                let _ = reply.send(peers);
            }
            RegistryMsg::CloseAll { reply } => {
                closing = true;
                let closed = sessions.len();
                for (id, entry) in std::mem::take(&mut sessions) {
                    tracing::debug!(session = %id, peer = %entry.peer, "closing session");
                    let _ = entry.stop.send(());
                }
                let _ = reply.send(closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionRegistry;
    use std::net::SocketAddr;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn register_and_deregister_track_count() {
        let registry = SessionRegistry::spawn();
        let first = registry.register(peer(4000)).await.expect("register first");
        let second = registry.register(peer(4001)).await.expect("register second");
        assert_ne!(first.id, second.id);
        assert_eq!(registry.count().await, 2);

        registry.deregister(first.id).await;
        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.peers().await, vec![(second.id, peer(4001))]);
    }

    #[tokio::test]
    async fn close_all_signals_sessions_and_refuses_new_ones() {
        let registry = SessionRegistry::spawn();
        let ticket = registry.register(peer(4000)).await.expect("register");

        assert_eq!(registry.close_all().await, 1);
        ticket
            .shutdown
            .await
            .expect("session should receive stop signal");
        assert_eq!(registry.count().await, 0);
        assert!(registry.register(peer(4002)).await.is_none());
    }
}
