//! Hand-off of pending-notification keys to the external delivery worker.
//!
//! # Contract
//! A batch names `(client_id, fake user_id)` keys only. Callers append the matching
//! envelopes to the notification store before enqueueing, so a worker woken by a batch
//! always finds its payloads. Delivery, retries and signing belong to the worker.
use crate::model::DeliveryKey;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery queue is full")]
    Full,
    #[error("delivery queue is closed")]
    Closed,
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn enqueue(&self, batch: Vec<DeliveryKey>) -> Result<(), DeliveryError>;
}

/// A batch as recorded by [`InMemoryDeliveryQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedBatch {
    pub seq: u64,
    pub keys: Vec<DeliveryKey>,
}

#[derive(Debug)]
struct BatchLog {
    next_seq: u64,
    capacity: usize,
    items: VecDeque<QueuedBatch>,
}

impl BatchLog {
    fn new(capacity: usize) -> Self {
        Self {
            next_seq: 0,
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    fn record(&mut self, keys: Vec<DeliveryKey>) -> Result<u64, DeliveryError> {
        if self.items.len() >= self.capacity {
            return Err(DeliveryError::Full);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push_back(QueuedBatch { seq, keys });
        Ok(seq)
    }
}

/// Bounded in-process queue. Used by tests and single-node setups where the worker
/// polls with [`InMemoryDeliveryQueue::drain`].
#[derive(Debug, Clone)]
pub struct InMemoryDeliveryQueue {
    log: Arc<RwLock<BatchLog>>,
}

impl InMemoryDeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            log: Arc::new(RwLock::new(BatchLog::new(capacity.max(1)))),
        }
    }

    /// Take every queued batch, oldest first.
    pub async fn drain(&self) -> Vec<QueuedBatch> {
        self.log.write().await.items.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.log.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn enqueue(&self, batch: Vec<DeliveryKey>) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }
        let size = batch.len() as u64;
        let mut log = self.log.write().await;
        log.record(batch)?;
        metrics::counter!("masque_delivery_enqueued_total").increment(size);
        metrics::gauge!("masque_delivery_queue_depth").set(log.items.len() as f64);
        Ok(())
    }
}

/// Queue backed by a bounded tokio channel; the receiver belongs to the delivery worker.
#[derive(Debug, Clone)]
pub struct ChannelDeliveryQueue {
    sender: mpsc::Sender<Vec<DeliveryKey>>,
}

impl ChannelDeliveryQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<DeliveryKey>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeliveryQueue for ChannelDeliveryQueue {
    async fn enqueue(&self, batch: Vec<DeliveryKey>) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }
        let size = batch.len() as u64;
        self.sender.try_send(batch).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })?;
        metrics::counter!("masque_delivery_enqueued_total").increment(size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use masque_common::{ClientId, FakeId};

    fn key() -> DeliveryKey {
        DeliveryKey::new(ClientId::new(), FakeId::new())
    }

    #[tokio::test]
    async fn in_memory_queue_is_bounded_and_ordered() {
        let queue = InMemoryDeliveryQueue::new(2);
        let (a, b) = (key(), key());
        queue.enqueue(vec![a]).await.expect("first");
        queue.enqueue(vec![b]).await.expect("second");
        let err = queue.enqueue(vec![key()]).await.expect_err("full");
        assert!(matches!(err, DeliveryError::Full));

        let drained = queue.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].keys, vec![a]);
        assert_eq!(drained[1].seq, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn empty_batches_are_ignored() {
        let queue = InMemoryDeliveryQueue::new(1);
        queue.enqueue(Vec::new()).await.expect("empty");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn channel_queue_reports_closed_receiver() {
        let (queue, mut receiver) = ChannelDeliveryQueue::new(4);
        let k = key();
        queue.enqueue(vec![k]).await.expect("send");
        assert_eq!(receiver.recv().await, Some(vec![k]));
        drop(receiver);
        let err = queue.enqueue(vec![key()]).await.expect_err("closed");
        assert!(matches!(err, DeliveryError::Closed));
    }
}
