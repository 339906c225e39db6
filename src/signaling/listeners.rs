//! Fan-out of relayed messages to the handlers sharing one connection
//!
//! A client has a single signaling connection, so every driver for every
//! remote peer listens on the same stream of `relayed` pushes and filters for
//! its own traffic. Each handler is a [`RelaySubscription`]; dropping it
//! removes the handler from the table.

use peerlink_relay::SignalMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// A relayed message stamped with its dispatch sequence number
#[derive(Debug, Clone)]
pub struct Relayed {
    pub seq: u64,
    pub message: SignalMessage,
}

#[derive(Default)]
struct ListenerTable {
    next_listener: u64,
    next_seq: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<Relayed>>,
}

#[derive(Clone, Default)]
pub struct RelayListeners {
    inner: Arc<Mutex<ListenerTable>>,
}

impl RelayListeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, ListenerTable> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a handler. It sees every message dispatched after this call.
    pub fn subscribe(&self) -> RelaySubscription {
        let mut table = self.table();
        let id = table.next_listener;
        table.next_listener += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        table.senders.insert(id, tx);
        RelaySubscription {
            id,
            since: table.next_seq,
            rx,
            listeners: self.clone(),
        }
    }

    /// Deliver a message to every installed handler. Returns the handler count reached.
    pub fn dispatch(&self, message: SignalMessage) -> usize {
        let mut table = self.table();
        let seq = table.next_seq;
        table.next_seq += 1;
        table.senders.retain(|_, tx| {
            tx.send(Relayed {
                seq,
                message: message.clone(),
            })
            .is_ok()
        });
        table.senders.len()
    }

    /// Number of installed handlers
    pub fn len(&self) -> usize {
        self.table().senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.table().senders.remove(&id);
    }
}

/// One installed handler; removed from the table on drop
pub struct RelaySubscription {
    id: u64,
    since: u64,
    rx: mpsc::UnboundedReceiver<Relayed>,
    listeners: RelayListeners,
}

impl RelaySubscription {
    /// Sequence number of the first message this handler receives
    pub fn since(&self) -> u64 {
        self.since
    }

    pub async fn recv(&mut self) -> Option<Relayed> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Relayed> {
        self.rx.try_recv().ok()
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.listeners.remove(self.id);
    }
}

impl std::fmt::Debug for RelaySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySubscription")
            .field("id", &self.id)
            .field("since", &self.since)
            .finish()
    }
}
