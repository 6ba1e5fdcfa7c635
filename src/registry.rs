//! ==============================================================================
//! registry.rs - directory of live client connections
//! ==============================================================================
//!
//! purpose:
//!     tracks every accepted connection: its outbound sink, its correlation id
//!     and its chart subscription. one lock guards the whole directory.
//!
//! ownership rules:
//!     - a connection's reader inserts/removes it and records its own
//!       correlation id on subscribe.
//!     - the broadcast writer changes subscriptions (metric, scale, ready)
//!       and is the only task that writes to sinks (bulk exports aside).
//!     - callers never hold the registry lock while locking a sink: snapshot
//!       first, then write.
//!
//! ==============================================================================

use crate::domain::{Metric, Scale};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// membership token of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// write half of a client connection, shared by the writer and export tasks
pub type ClientSink = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub fn client_sink<W: AsyncWrite + Send + Unpin + 'static>(writer: W) -> ClientSink {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// write a whole frame and flush it
pub async fn send(sink: &ClientSink, bytes: &[u8]) -> std::io::Result<()> {
    let mut sink = sink.lock().await;
    sink.write_all(bytes).await?;
    sink.flush().await
}

/// per-connection chart state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Subscription {
    pub metric: Metric,
    pub scale: Scale,
    /// bootstrap done, receives broadcasts
    pub ready: bool,
}

struct ClientEntry {
    sink: ClientSink,
    correlation_id: Option<u32>,
    subscription: Subscription,
}

/// point-in-time copy of one client, taken under the registry lock
#[derive(Clone)]
pub struct ClientView {
    pub conn: ConnId,
    pub sink: ClientSink,
    pub subscription: Subscription,
}

#[derive(Default)]
struct Directory {
    next: u64,
    clients: HashMap<ConnId, ClientEntry>,
}

#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<Directory>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, sink: ClientSink) -> ConnId {
        let mut dir = self.inner.lock().await;
        dir.next += 1;
        let conn = ConnId(dir.next);
        dir.clients.insert(
            conn,
            ClientEntry { sink, correlation_id: None, subscription: Subscription::default() },
        );
        conn
    }

    /// drop a connection; returns its sink so the caller can close it
    pub async fn remove(&self, conn: ConnId) -> Option<ClientSink> {
        self.inner.lock().await.clients.remove(&conn).map(|entry| entry.sink)
    }

    pub async fn find_by_correlation(&self, id: u32) -> Option<ConnId> {
        let dir = self.inner.lock().await;
        dir.clients
            .iter()
            .find(|(_, entry)| entry.correlation_id == Some(id))
            .map(|(conn, _)| *conn)
    }

    pub async fn set_correlation(&self, conn: ConnId, id: u32) -> bool {
        let mut dir = self.inner.lock().await;
        match dir.clients.get_mut(&conn) {
            Some(entry) => {
                entry.correlation_id = Some(id);
                true
            }
            None => false,
        }
    }

    /// apply a change to one client's subscription and return the result
    pub async fn update_subscription<F>(&self, conn: ConnId, change: F) -> Option<Subscription>
    where
        F: FnOnce(&mut Subscription),
    {
        let mut dir = self.inner.lock().await;
        let entry = dir.clients.get_mut(&conn)?;
        change(&mut entry.subscription);
        Some(entry.subscription)
    }

    pub async fn get(&self, conn: ConnId) -> Option<ClientView> {
        let dir = self.inner.lock().await;
        dir.clients.get(&conn).map(|entry| view(conn, entry))
    }

    /// every client that finished its bootstrap
    pub async fn ready_clients(&self) -> Vec<ClientView> {
        let dir = self.inner.lock().await;
        let mut ready: Vec<ClientView> = dir
            .clients
            .iter()
            .filter(|(_, entry)| entry.subscription.ready)
            .map(|(conn, entry)| view(*conn, entry))
            .collect();
        ready.sort_by_key(|c| c.conn);
        ready
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// remove every client, returning their sinks
    pub async fn drain(&self) -> Vec<ClientSink> {
        let mut dir = self.inner.lock().await;
        dir.clients.drain().map(|(_, entry)| entry.sink).collect()
    }
}

fn view(conn: ConnId, entry: &ClientEntry) -> ClientView {
    ClientView {
        conn,
        sink: Arc::clone(&entry.sink),
        subscription: entry.subscription,
    }
}
