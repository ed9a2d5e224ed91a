//! Stage boundary queues and the end-of-stream sentinel.
//!
//! One [`StageQueue`] sits between each pair of adjacent stages. It is
//! written by every worker of the producing stage and read by every worker
//! of the consuming stage.

mod io;

pub use io::{Dequeue, Enqueue};

use crate::errors::StagepipeError;
use crate::task::Task;
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::error;

/// An item travelling through a stage boundary queue.
///
/// `Stop` is the end-of-stream sentinel. Payloads are always wrapped in
/// `Data`, so no payload can ever be mistaken for the sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message<T = Value> {
    /// A payload.
    Data(T),
    /// No more data will come from one upstream writer.
    Stop,
}

impl<T> Message<T> {
    /// Returns true for the sentinel.
    #[must_use]
    pub const fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }

    /// Returns the payload, if any.
    pub fn into_data(self) -> Option<T> {
        match self {
            Self::Data(value) => Some(value),
            Self::Stop => None,
        }
    }
}

/// How payloads cross a stage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Payloads are moved between in-process workers as-is.
    #[default]
    Local,
    /// Payloads are serialized into owned byte buffers on write and decoded
    /// on read, so an isolated worker shares nothing but bytes.
    Isolated,
}

impl Transport {
    /// Picks the stricter transport required by two neighbouring tasks.
    #[must_use]
    pub fn between(task: &Task, next_task: Option<&Task>) -> Self {
        if task.multiprocess() || next_task.is_some_and(Task::multiprocess) {
            Self::Isolated
        } else {
            Self::Local
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}

enum Channel {
    Local(Sender<Message>, Receiver<Message>),
    Isolated(Sender<Message<Vec<u8>>>, Receiver<Message<Vec<u8>>>),
}

fn open_channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    if capacity == 0 {
        crossbeam_channel::unbounded()
    } else {
        crossbeam_channel::bounded(capacity)
    }
}

fn closed() -> StagepipeError {
    StagepipeError::Runtime("stage queue closed".to_string())
}

/// A bounded FIFO of [`Message`]s between two stages.
///
/// Every worker of the producing stage writes it and every worker of the
/// consuming stage reads it; each message is read by exactly one reader.
/// `put` blocks while the queue holds `capacity` messages and `get` blocks
/// while it is empty.
pub struct StageQueue {
    channel: Channel,
    capacity: usize,
    high_water: AtomicUsize,
}

impl StageQueue {
    /// Creates a queue; `capacity == 0` means unbounded.
    #[must_use]
    pub fn new(capacity: usize, transport: Transport) -> Self {
        let channel = match transport {
            Transport::Local => {
                let (tx, rx) = open_channel(capacity);
                Channel::Local(tx, rx)
            }
            Transport::Isolated => {
                let (tx, rx) = open_channel(capacity);
                Channel::Isolated(tx, rx)
            }
        };
        Self {
            channel,
            capacity,
            high_water: AtomicUsize::new(0),
        }
    }

    /// Creates the output queue of `task`, bounded by its throttle.
    #[must_use]
    pub fn for_boundary(task: &Task, next_task: Option<&Task>) -> Self {
        Self::new(task.throttle(), Transport::between(task, next_task))
    }

    /// Writes a payload, blocking while the queue is full.
    pub fn put(&self, value: Value) -> Result<(), StagepipeError> {
        match &self.channel {
            Channel::Local(tx, _) => tx.send(Message::Data(value)).map_err(|_| closed())?,
            Channel::Isolated(tx, _) => tx
                .send(Message::Data(serde_json::to_vec(&value)?))
                .map_err(|_| closed())?,
        }
        self.track_put();
        Ok(())
    }

    /// Writes the end-of-stream sentinel, blocking while the queue is full.
    pub fn put_stop(&self) {
        let sent = match &self.channel {
            Channel::Local(tx, _) => tx.send(Message::Stop).is_ok(),
            Channel::Isolated(tx, _) => tx.send(Message::Stop).is_ok(),
        };
        if sent {
            self.track_put();
        } else {
            error!("Stage queue closed before its sentinel was written");
        }
    }

    fn track_put(&self) {
        self.high_water.fetch_max(self.len(), Ordering::SeqCst);
    }

    /// Reads the next message, blocking while the queue is empty.
    pub fn get(&self) -> Result<Message, StagepipeError> {
        match &self.channel {
            Channel::Local(_, rx) => rx.recv().map_err(|_| closed()),
            Channel::Isolated(_, rx) => decode(rx.recv().map_err(|_| closed())?),
        }
    }

    /// Reads the next message if one is queued.
    pub fn try_get(&self) -> Option<Result<Message, StagepipeError>> {
        match &self.channel {
            Channel::Local(_, rx) => rx.try_recv().ok().map(Ok),
            Channel::Isolated(_, rx) => rx.try_recv().ok().map(decode),
        }
    }

    /// Returns the transport chosen at construction.
    #[must_use]
    pub const fn transport(&self) -> Transport {
        match self.channel {
            Channel::Local(..) => Transport::Local,
            Channel::Isolated(..) => Transport::Isolated,
        }
    }

    /// Returns the configured bound (0 = unbounded).
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of queued messages, sentinels included.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.channel {
            Channel::Local(_, rx) => rx.len(),
            Channel::Isolated(_, rx) => rx.len(),
        }
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the largest number of messages seen queued at once.
    ///
    /// Sampled after each write, so it never exceeds the capacity of a
    /// bounded queue.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

fn decode(message: Message<Vec<u8>>) -> Result<Message, StagepipeError> {
    match message {
        Message::Data(bytes) => Ok(Message::Data(serde_json::from_slice(&bytes)?)),
        Message::Stop => Ok(Message::Stop),
    }
}

impl fmt::Debug for StageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageQueue")
            .field("transport", &self.transport())
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskFn;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn task(multiprocess: bool, throttle: i64) -> Task {
        Task::builder(TaskFn::sync(Ok))
            .multiprocess(multiprocess)
            .throttle(throttle)
            .build()
            .unwrap()
    }

    #[test]
    fn test_sentinel_never_equals_payload() {
        let stop: Message = Message::Stop;
        assert!(stop.is_stop());
        assert_ne!(Message::Data(Value::Null), stop);
        assert_ne!(Message::Data(json!("Stop")), stop);
        assert_eq!(Message::Data(json!(1)).into_data(), Some(json!(1)));
    }

    #[test]
    fn test_transport_takes_stricter_neighbour() {
        let local = task(false, 0);
        let isolated = task(true, 0);

        assert_eq!(Transport::between(&local, None), Transport::Local);
        assert_eq!(Transport::between(&local, Some(&local)), Transport::Local);
        assert_eq!(Transport::between(&isolated, Some(&local)), Transport::Isolated);
        assert_eq!(Transport::between(&local, Some(&isolated)), Transport::Isolated);
    }

    #[test]
    fn test_for_boundary_uses_throttle() {
        let queue = StageQueue::for_boundary(&task(false, 4), None);
        assert_eq!(queue.capacity(), 4);
        assert_eq!(queue.transport(), Transport::Local);
    }

    #[test]
    fn test_isolated_round_trip_keeps_order() {
        let queue = StageQueue::new(0, Transport::Isolated);
        queue.put(json!({"id": 1, "tags": ["a"]})).unwrap();
        queue.put_stop();

        assert_eq!(
            queue.get().unwrap(),
            Message::Data(json!({"id": 1, "tags": ["a"]}))
        );
        assert!(queue.get().unwrap().is_stop());
        assert!(queue.try_get().is_none());
    }

    #[test]
    fn test_len_counts_sentinels() {
        let queue = StageQueue::new(0, Transport::Local);
        queue.put(json!(1)).unwrap();
        queue.put_stop();
        assert_eq!(queue.len(), 2);
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_unbounded_never_blocks() {
        let queue = StageQueue::new(0, Transport::Local);
        for i in 0..1000 {
            queue.put(json!(i)).unwrap();
        }
        assert_eq!(queue.len(), 1000);
        assert_eq!(queue.high_water_mark(), 1000);
        assert_eq!(queue.get().unwrap(), Message::Data(json!(0)));
    }

    #[test]
    fn test_put_blocks_when_full() {
        let queue = Arc::new(StageQueue::new(2, Transport::Local));
        queue.put(json!(1)).unwrap();
        queue.put(json!(2)).unwrap();

        let writer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.put_stop())
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 2);
        assert!(!writer.is_finished());

        assert_eq!(queue.get().unwrap(), Message::Data(json!(1)));
        writer.join().unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.high_water_mark(), 2);
    }

    #[test]
    fn test_get_blocks_until_put() {
        let queue = Arc::new(StageQueue::new(1, Transport::Isolated));
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get())
        };

        thread::sleep(Duration::from_millis(20));
        queue.put(json!("late")).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), Message::Data(json!("late")));
    }

    #[test]
    fn test_many_readers_many_writers() {
        let queue = Arc::new(StageQueue::new(3, Transport::Local));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..25 {
                        queue.put(json!(w * 100 + i)).unwrap();
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    (0..25)
                        .map(|_| queue.get().unwrap().into_data().unwrap().as_i64().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        let mut seen: Vec<i64> = readers.into_iter().flat_map(|r| r.join().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen.len(), 100);
        seen.dedup();
        assert_eq!(seen.len(), 100);
        assert!(queue.high_water_mark() <= 3);
    }
}
