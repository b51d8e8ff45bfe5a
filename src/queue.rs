//! Bounded FIFO action queue.
//!
//! Many producers, one consumer. A full queue makes producers wait; nothing
//! is dropped or overwritten. Both waits can be cancelled.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::DispatchConfig;
use crate::error::{Result, StateError};

/// Future produced by a [`WorkItem`].
pub type WorkFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// A deferred unit of work, consumed exactly once by the executor.
///
/// The token is the executor's shutdown token.
pub type WorkItem = Box<dyn FnOnce(CancellationToken) -> WorkFuture + Send + 'static>;

/// Box an async closure as a [`WorkItem`].
pub fn work_item<F, Fut>(f: F) -> WorkItem
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |token| Box::pin(f(token)))
}

/// Queue seam between the dispatcher and the executor.
#[async_trait]
pub trait ActionQueuer: Send + Sync {
    /// Append `item` at the tail, waiting for capacity.
    ///
    /// Fails with [`StateError::Cancelled`] if `cancel` fires first; the
    /// item is then not enqueued.
    async fn enqueue(&self, item: WorkItem, cancel: &CancellationToken) -> Result<()>;

    /// Remove and return the head, waiting for an item.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<WorkItem>;

    /// Close the queue.
    ///
    /// Pending and later enqueue/dequeue calls fail with
    /// [`StateError::AlreadyDisposed`]. Queued items are dropped unrun.
    /// Returns how many items were dropped, or `None` if a consumer held the
    /// receiver and the items are dropped with the queue instead.
    fn close(&self) -> Option<usize>;
}

/// Default [`ActionQueuer`] backed by a bounded tokio channel.
pub struct ActionQueue {
    sender: mpsc::Sender<WorkItem>,
    receiver: Mutex<mpsc::Receiver<WorkItem>>,
    closed: CancellationToken,
    enqueued_count: AtomicU64,
    dequeued_count: AtomicU64,
}

impl ActionQueue {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(StateError::InvalidArgument(
                "queue capacity must be positive".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::channel(capacity);
        Ok(Self {
            sender,
            receiver: Mutex::new(receiver),
            closed: CancellationToken::new(),
            enqueued_count: 0.into(),
            dequeued_count: 0.into(),
        })
    }

    /// Create a queue sized by `config`.
    pub fn from_config(config: &DispatchConfig) -> Result<Self> {
        Self::new(config.queue_capacity)
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    /// Number of queued items, including slots reserved by producers.
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total items enqueued.
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued_count.load(Ordering::Relaxed)
    }

    /// Total items dequeued.
    pub fn dequeued_count(&self) -> u64 {
        self.dequeued_count.load(Ordering::Relaxed)
    }

    /// Whether [`close`](ActionQueuer::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn disposed() -> StateError {
        StateError::AlreadyDisposed("action queue".to_string())
    }
}

#[async_trait]
impl ActionQueuer for ActionQueue {
    async fn enqueue(&self, item: WorkItem, cancel: &CancellationToken) -> Result<()> {
        if self.is_closed() {
            return Err(Self::disposed());
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(StateError::Cancelled("enqueue wait cancelled".to_string()));
            }
            _ = self.closed.cancelled() => return Err(Self::disposed()),
            permit = self.sender.reserve() => permit.map_err(|_| Self::disposed())?,
        };

        permit.send(item);
        self.enqueued_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<WorkItem> {
        let mut receiver = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(StateError::Cancelled("dequeue wait cancelled".to_string()));
            }
            _ = self.closed.cancelled() => return Err(Self::disposed()),
            receiver = self.receiver.lock() => receiver,
        };

        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(StateError::Cancelled("dequeue wait cancelled".to_string()));
            }
            _ = self.closed.cancelled() => return Err(Self::disposed()),
            item = receiver.recv() => item.ok_or_else(Self::disposed)?,
        };

        self.dequeued_count.fetch_add(1, Ordering::Relaxed);
        Ok(item)
    }

    fn close(&self) -> Option<usize> {
        self.closed.cancel();

        let mut receiver = self.receiver.try_lock().ok()?;
        receiver.close();
        let mut abandoned = 0;
        while receiver.try_recv().is_ok() {
            abandoned += 1;
        }
        debug!(abandoned, "action queue closed");
        Some(abandoned)
    }
}

impl fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;
    use std::time::Duration;

    type Log = Arc<SyncMutex<Vec<u32>>>;

    fn labelled(id: u32, log: &Log) -> WorkItem {
        let log = Arc::clone(log);
        work_item(move |_| async move {
            log.lock().push(id);
            Ok::<(), StateError>(())
        })
    }

    async fn run_next(queue: &ActionQueue) {
        let item = queue.dequeue(&CancellationToken::new()).await.unwrap();
        item(CancellationToken::new()).await.unwrap();
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = ActionQueue::new(0).unwrap_err();
        assert!(matches!(err, StateError::InvalidArgument(_)));
    }

    #[test]
    fn test_from_config() {
        let queue = ActionQueue::from_config(&DispatchConfig::default()).unwrap();
        assert_eq!(queue.capacity(), 100);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = ActionQueue::new(10).unwrap();
        let log: Log = Arc::default();
        let token = CancellationToken::new();

        for id in 0..5 {
            queue.enqueue(labelled(id, &log), &token).await.unwrap();
        }
        assert_eq!(queue.len(), 5);

        for _ in 0..5 {
            run_next(&queue).await;
        }

        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.enqueued_count(), 5);
        assert_eq!(queue.dequeued_count(), 5);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_dequeue() {
        let queue = Arc::new(ActionQueue::new(2).unwrap());
        let log: Log = Arc::default();
        let token = CancellationToken::new();

        queue.enqueue(labelled(1, &log), &token).await.unwrap();
        queue.enqueue(labelled(2, &log), &token).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            let item = labelled(3, &log);
            tokio::spawn(async move { queue.enqueue(item, &CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        run_next(&queue).await;
        tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .expect("producer still blocked")
            .unwrap()
            .unwrap();

        run_next(&queue).await;
        run_next(&queue).await;
        assert_eq!(*log.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_enqueue_leaves_queue_unchanged() {
        let queue = Arc::new(ActionQueue::new(2).unwrap());
        let log: Log = Arc::default();
        let token = CancellationToken::new();

        queue.enqueue(labelled(1, &log), &token).await.unwrap();
        queue.enqueue(labelled(2, &log), &token).await.unwrap();

        let cancel = CancellationToken::new();
        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            let item = labelled(3, &log);
            tokio::spawn(async move { queue.enqueue(item, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = producer.await.unwrap();
        assert!(matches!(result, Err(StateError::Cancelled(_))));
        assert_eq!(queue.len(), 2);

        run_next(&queue).await;
        run_next(&queue).await;
        assert_eq!(*log.lock(), vec![1, 2]);
        assert!(queue.is_empty());
        assert_eq!(queue.enqueued_count(), 2);
    }

    #[tokio::test]
    async fn test_dequeue_cancellation() {
        let queue = ActionQueue::new(1).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = queue.dequeue(&cancel).await;
        assert!(matches!(result, Err(StateError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_item() {
        let queue = Arc::new(ActionQueue::new(4).unwrap());
        let log: Log = Arc::default();

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let item = queue.dequeue(&CancellationToken::new()).await?;
                item(CancellationToken::new()).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .enqueue(labelled(7, &log), &CancellationToken::new())
            .await
            .unwrap();

        consumer.await.unwrap().unwrap();
        assert_eq!(*log.lock(), vec![7]);
    }

    #[tokio::test]
    async fn test_close_rejects_and_abandons() {
        let queue = ActionQueue::new(4).unwrap();
        let log: Log = Arc::default();
        let token = CancellationToken::new();

        queue.enqueue(labelled(1, &log), &token).await.unwrap();
        queue.enqueue(labelled(2, &log), &token).await.unwrap();

        assert_eq!(queue.close(), Some(2));
        assert!(queue.is_closed());

        let err = queue.enqueue(labelled(3, &log), &token).await.unwrap_err();
        assert!(err.is_disposed());
        assert!(matches!(queue.dequeue(&token).await, Err(e) if e.is_disposed()));
        assert!(log.lock().is_empty());
    }
}
