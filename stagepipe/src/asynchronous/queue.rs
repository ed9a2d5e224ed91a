//! Stage boundary queues for tokio workers.

use crate::errors::StagepipeError;
use crate::queue::{Message, Transport};
use crate::task::Task;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, Mutex};

enum Payload {
    Local(Value),
    Isolated(Vec<u8>),
}

enum Sender {
    Bounded(mpsc::Sender<Message<Payload>>),
    Unbounded(mpsc::UnboundedSender<Message<Payload>>),
}

enum Receiver {
    Bounded(mpsc::Receiver<Message<Payload>>),
    Unbounded(mpsc::UnboundedReceiver<Message<Payload>>),
}

impl Receiver {
    async fn recv(&mut self) -> Option<Message<Payload>> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// A FIFO of [`Message`]s between two async stages.
///
/// Every worker of the consuming stage shares the one receiver, so each
/// message is read by exactly one of them. A full bounded queue suspends
/// the writer until a reader makes room.
pub struct AsyncStageQueue {
    tx: Sender,
    rx: Mutex<Receiver>,
    transport: Transport,
    capacity: usize,
    len: AtomicUsize,
    high_water: AtomicUsize,
}

impl AsyncStageQueue {
    /// Creates a queue; `capacity == 0` means unbounded.
    #[must_use]
    pub fn new(capacity: usize, transport: Transport) -> Self {
        let (tx, rx) = if capacity == 0 {
            let (tx, rx) = mpsc::unbounded_channel();
            (Sender::Unbounded(tx), Receiver::Unbounded(rx))
        } else {
            let (tx, rx) = mpsc::channel(capacity);
            (Sender::Bounded(tx), Receiver::Bounded(rx))
        };
        Self {
            tx,
            rx: Mutex::new(rx),
            transport,
            capacity,
            len: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    /// Creates the output queue of `task`, bounded by its throttle.
    #[must_use]
    pub fn for_boundary(task: &Task, next_task: Option<&Task>) -> Self {
        Self::new(task.throttle(), Transport::between(task, next_task))
    }

    /// Writes a payload, waiting while the queue is full.
    pub async fn put(&self, value: Value) -> Result<(), StagepipeError> {
        let payload = match self.transport {
            Transport::Local => Payload::Local(value),
            Transport::Isolated => Payload::Isolated(serde_json::to_vec(&value)?),
        };
        self.send(Message::Data(payload)).await
    }

    /// Writes the end-of-stream sentinel, waiting while the queue is full.
    pub async fn put_stop(&self) -> Result<(), StagepipeError> {
        self.send(Message::Stop).await
    }

    async fn send(&self, message: Message<Payload>) -> Result<(), StagepipeError> {
        let closed = || StagepipeError::Runtime("stage queue closed".to_string());
        match &self.tx {
            Sender::Bounded(tx) => {
                let permit = tx.reserve().await.map_err(|_| closed())?;
                self.track_put();
                permit.send(message);
            }
            Sender::Unbounded(tx) => {
                self.track_put();
                tx.send(message).map_err(|_| closed())?;
            }
        }
        Ok(())
    }

    fn track_put(&self) {
        self.len.fetch_add(1, Ordering::SeqCst);
        self.high_water.fetch_max(self.len(), Ordering::SeqCst);
    }

    /// Reads the next message, waiting while the queue is empty.
    pub async fn get(&self) -> Result<Message, StagepipeError> {
        let message = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| StagepipeError::Runtime("stage queue closed".to_string()))?;
        self.len.fetch_sub(1, Ordering::SeqCst);

        match message {
            Message::Data(Payload::Local(value)) => Ok(Message::Data(value)),
            Message::Data(Payload::Isolated(bytes)) => {
                Ok(Message::Data(serde_json::from_slice(&bytes)?))
            }
            Message::Stop => Ok(Message::Stop),
        }
    }

    /// Returns the transport chosen at construction.
    #[must_use]
    pub const fn transport(&self) -> Transport {
        self.transport
    }

    /// Returns the configured bound (0 = unbounded).
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of queued messages, sentinels included.
    #[must_use]
    pub fn len(&self) -> usize {
        // A reader frees its slot just before it decrements the count.
        let len = self.len.load(Ordering::SeqCst);
        if self.capacity == 0 {
            len
        } else {
            len.min(self.capacity)
        }
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the largest number of messages ever queued at once.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for AsyncStageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncStageQueue")
            .field("transport", &self.transport)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_with_sentinel() {
        let queue = AsyncStageQueue::new(0, Transport::Local);
        queue.put(json!(1)).await.unwrap();
        queue.put(json!(2)).await.unwrap();
        queue.put_stop().await.unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.get().await.unwrap(), Message::Data(json!(1)));
        assert_eq!(queue.get().await.unwrap(), Message::Data(json!(2)));
        assert!(queue.get().await.unwrap().is_stop());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_isolated_payload_round_trips() {
        let queue = AsyncStageQueue::new(4, Transport::Isolated);
        queue.put(json!({"k": [1, 2]})).await.unwrap();
        assert_eq!(queue.get().await.unwrap(), Message::Data(json!({"k": [1, 2]})));
        assert_eq!(queue.capacity(), 4);
    }

    #[tokio::test]
    async fn test_full_queue_suspends_writer() {
        let queue = Arc::new(AsyncStageQueue::new(2, Transport::Local));
        let writer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for i in 0..5 {
                    queue.put(json!(i)).await.unwrap();
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 2);
        assert!(!writer.is_finished());

        for i in 0..5 {
            assert_eq!(queue.get().await.unwrap(), Message::Data(json!(i)));
        }
        writer.await.unwrap();
        assert_eq!(queue.high_water_mark(), 2);
    }
}
