//! Bounded in-memory flow ledger with a subscription stream.
//!
//! Appends go into a capacity-bounded map (oldest evicted first) and are
//! broadcast to subscribers. Each subscriber has its own bounded queue: a
//! slow subscriber loses events, surfaced as [`FlowEvent::Dropped`] with a
//! count, rather than ever blocking a publisher.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::flow::Flow;

/// Default number of retained flows.
pub const DEFAULT_FLOW_CAPACITY: usize = 4096;

/// Default per-subscriber queue length.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

/// One item of a subscription stream.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// A flow was appended to the store.
    Appended(Arc<Flow>),
    /// This subscriber was too slow; the payload counts the flows dropped
    /// from its queue.
    Dropped(u64),
}

struct Inner {
    flows: HashMap<Uuid, Arc<Flow>>,
    order: VecDeque<Uuid>,
    /// `None` once the store is closed; appends still retain, but nothing is
    /// broadcast and subscription streams end.
    tx: Option<broadcast::Sender<Arc<Flow>>>,
}

pub struct FlowStore {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl FlowStore {
    pub fn new(capacity: usize, subscriber_queue: usize) -> Self {
        let (tx, _) = broadcast::channel(subscriber_queue.max(1));
        FlowStore {
            inner: Mutex::new(Inner {
                flows: HashMap::new(),
                order: VecDeque::new(),
                tx: Some(tx),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Insert a flow, evicting the oldest entry when over capacity, and
    /// broadcast it. The map lock is held across the send so subscribers
    /// observe flows in global append order.
    pub fn append(&self, flow: Flow) -> Arc<Flow> {
        let flow = Arc::new(flow);
        let mut inner = self.inner.lock().expect("flow store lock poisoned");
        inner.flows.insert(flow.id, flow.clone());
        inner.order.push_back(flow.id);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.flows.remove(&oldest);
            }
        }
        if let Some(tx) = &inner.tx {
            // Send fails only when there are no subscribers, which is fine.
            let _ = tx.send(flow.clone());
        }
        flow
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Flow>> {
        self.inner
            .lock()
            .expect("flow store lock poisoned")
            .flows
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("flow store lock poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe to flows appended from this point on. There is no backlog:
    /// earlier flows are only reachable through [`FlowStore::get`].
    pub fn subscribe(&self) -> FlowSubscription {
        let inner = self.inner.lock().expect("flow store lock poisoned");
        FlowSubscription {
            rx: inner.tx.as_ref().map(|tx| tx.subscribe()),
        }
    }

    /// Close the store: every subscription stream ends after draining.
    pub fn close(&self) {
        self.inner.lock().expect("flow store lock poisoned").tx = None;
    }
}

/// A lazy stream of flow events. Finite once the store is closed.
pub struct FlowSubscription {
    rx: Option<broadcast::Receiver<Arc<Flow>>>,
}

impl FlowSubscription {
    /// Next event, or `None` once the store has been closed and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<FlowEvent> {
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Ok(flow) => Some(FlowEvent::Appended(flow)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(FlowEvent::Dropped(n)),
            Err(broadcast::error::RecvError::Closed) => {
                self.rx = None;
                None
            }
        }
    }

    /// Next appended flow, transparently counting past drop notices.
    pub async fn recv_flow(&mut self) -> Option<Arc<Flow>> {
        loop {
            match self.recv().await? {
                FlowEvent::Appended(flow) => return Some(flow),
                FlowEvent::Dropped(_) => continue,
            }
        }
    }
}
