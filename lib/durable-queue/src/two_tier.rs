//! Two-tier buffer: a fast bounded in-memory primary plus an overflow tier.
//!
//! Producers append batches to the primary ring; a single consumer drains
//! the primary first and the overflow only when the primary is empty. What
//! happens on a full primary depends on the mode: `HiLow` blocks the
//! producer until the consumer makes space, `HighCapacity` spills to the
//! overflow immediately and never blocks. FIFO holds within each tier, but
//! once the overflow is in play cross-tier ordering is not preserved; the
//! requeue path relies on exactly that relaxation.

use std::collections::VecDeque;

use snafu::Snafu;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

use crate::queue::{PersistentQueue, QueueError};

#[derive(Debug, Snafu)]
pub enum AddError {
    #[snafu(display("buffer is closed"))]
    Closed,
    #[snafu(display("overflow tier is full; item dropped"))]
    Dropped,
    #[snafu(display("overflow queue failure: {source}"))]
    Overflow { source: QueueError },
}

/// Producer-side behavior when the primary tier is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Block the producer until the consumer frees a primary slot.
    HiLow,
    /// Spill to the overflow tier immediately; never block.
    HighCapacity,
}

/// The slower second tier backing the primary ring.
pub enum Overflow<T> {
    /// Bounded in-memory queue.
    Memory { capacity: usize },
    /// Durable on-disk queue; survives restarts.
    Durable(PersistentQueue<T>),
}

struct Inner<T> {
    primary: VecDeque<T>,
    overflow_memory: VecDeque<T>,
    overflow_durable: Option<PersistentQueue<T>>,
    overflow_capacity: usize,
    dropped: u64,
    closed: bool,
}

impl<T> Inner<T> {
    fn overflow_len(&self) -> u64 {
        match &self.overflow_durable {
            Some(queue) => queue.len(),
            None => self.overflow_memory.len() as u64,
        }
    }

    fn overflow_push(&mut self, item: T) -> Result<(), AddError> {
        match &mut self.overflow_durable {
            Some(queue) => {
                let accepted = queue
                    .try_enqueue(&item)
                    .map_err(|source| AddError::Overflow { source })?;
                if accepted {
                    Ok(())
                } else {
                    self.dropped += 1;
                    Err(AddError::Dropped)
                }
            }
            None => {
                if self.overflow_memory.len() < self.overflow_capacity {
                    self.overflow_memory.push_back(item);
                    Ok(())
                } else {
                    self.dropped += 1;
                    Err(AddError::Dropped)
                }
            }
        }
    }

    fn overflow_pop(&mut self) -> Option<T> {
        match &mut self.overflow_durable {
            Some(queue) => loop {
                match queue.dequeue() {
                    Ok(item) => return item,
                    Err(error) => {
                        // A corrupt persisted item was skipped; keep draining.
                        warn!(message = "Discarded corrupt overflow item.", %error);
                    }
                }
            },
            None => self.overflow_memory.pop_front(),
        }
    }
}

/// Bounded primary ring + overflow queue with a single consumer.
pub struct TwoTierBuffer<T> {
    mode: BufferMode,
    primary_capacity: usize,
    inner: Mutex<Inner<T>>,
    data_ready: Notify,
    space_ready: Notify,
}

impl<T> TwoTierBuffer<T> {
    /// `primary_capacity` is clamped to the supported 1..=100 ring sizes.
    pub fn new(mode: BufferMode, primary_capacity: usize, overflow: Overflow<T>) -> Self {
        let primary_capacity = primary_capacity.clamp(1, 100);
        let (overflow_durable, overflow_capacity) = match overflow {
            Overflow::Memory { capacity } => (None, capacity),
            Overflow::Durable(queue) => {
                let capacity = queue.max_items() as usize;
                (Some(queue), capacity)
            }
        };
        TwoTierBuffer {
            mode,
            primary_capacity,
            inner: Mutex::new(Inner {
                primary: VecDeque::with_capacity(primary_capacity),
                overflow_memory: VecDeque::new(),
                overflow_durable,
                overflow_capacity,
                dropped: 0,
                closed: false,
            }),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    /// Append an item. In `HiLow` mode this waits for primary space; in
    /// `HighCapacity` mode a full primary spills to the overflow and a full
    /// overflow drops the item (recorded in [`dropped`](Self::dropped)).
    pub async fn add(&self, item: T) -> Result<(), AddError> {
        match self.mode {
            BufferMode::HiLow => {
                let mut item = Some(item);
                loop {
                    let notified = self.space_ready.notified();
                    tokio::pin!(notified);
                    {
                        let mut inner = self.inner.lock().await;
                        if inner.closed {
                            return Err(AddError::Closed);
                        }
                        if inner.primary.len() < self.primary_capacity {
                            inner
                                .primary
                                .push_back(item.take().expect("item present until pushed"));
                            self.data_ready.notify_one();
                            return Ok(());
                        }
                        // Register for the wakeup before the lock drops so a
                        // consumer pop between unlock and await cannot be lost.
                        notified.as_mut().enable();
                    }
                    notified.await;
                }
            }
            BufferMode::HighCapacity => {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(AddError::Closed);
                }
                if inner.primary.len() < self.primary_capacity {
                    inner.primary.push_back(item);
                } else {
                    inner.overflow_push(item)?;
                }
                self.data_ready.notify_one();
                Ok(())
            }
        }
    }

    /// Put an item on the overflow tier directly. Used to requeue a batch
    /// whose upload failed without letting it overtake fresher primary
    /// traffic or block the producer side.
    pub async fn enqueue_low_priority(&self, item: T) -> Result<(), AddError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(AddError::Closed);
        }
        inner.overflow_push(item)?;
        self.data_ready.notify_one();
        Ok(())
    }

    /// Take the next item, primary tier first. Waits while the buffer is
    /// empty; returns `None` once the buffer is closed and fully drained.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.data_ready.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.inner.lock().await;
                if let Some(item) = inner.primary.pop_front() {
                    self.space_ready.notify_one();
                    return Some(item);
                }
                if let Some(item) = inner.overflow_pop() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`next`](Self::next) for drain loops.
    pub async fn try_next(&self) -> Option<T> {
        let mut inner = self.inner.lock().await;
        if let Some(item) = inner.primary.pop_front() {
            self.space_ready.notify_one();
            return Some(item);
        }
        inner.overflow_pop()
    }

    /// Close the producer side. The consumer still drains whatever is
    /// buffered; blocked producers give up with [`AddError::Closed`].
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        self.data_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    pub async fn len(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.primary.len() as u64 + inner.overflow_len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Items dropped because the overflow tier was full.
    pub async fn dropped(&self) -> u64 {
        self.inner.lock().await.dropped
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use tempfile::tempdir;

    use super::{AddError, BufferMode, Overflow, TwoTierBuffer};
    use crate::queue::{ItemCodec, PersistentQueue};

    struct StringCodec;

    impl ItemCodec<String> for StringCodec {
        fn encode(&self, item: &String) -> Result<Vec<u8>, crate::queue::CodecError> {
            Ok(item.clone().into_bytes())
        }

        fn decode(&self, bytes: &[u8]) -> Result<String, crate::queue::CodecError> {
            Ok(String::from_utf8(bytes.to_vec())?)
        }
    }

    fn memory_buffer(mode: BufferMode, primary: usize, overflow: usize) -> TwoTierBuffer<String> {
        TwoTierBuffer::new(mode, primary, Overflow::Memory { capacity: overflow })
    }

    #[tokio::test]
    async fn primary_drains_before_overflow() {
        let buffer = memory_buffer(BufferMode::HiLow, 2, 8);

        buffer.add("a".to_owned()).await.unwrap();
        buffer.add("b".to_owned()).await.unwrap();
        buffer.enqueue_low_priority("c".to_owned()).await.unwrap();

        assert_eq!(buffer.next().await, Some("a".to_owned()));
        assert_eq!(buffer.next().await, Some("b".to_owned()));
        assert_eq!(buffer.next().await, Some("c".to_owned()));
    }

    #[tokio::test]
    async fn hilow_add_blocks_until_consumer_frees_space() {
        let buffer = Arc::new(memory_buffer(BufferMode::HiLow, 1, 8));
        buffer.add("first".to_owned()).await.unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.add("second".to_owned()).await })
        };

        // The producer cannot finish while the primary slot is taken.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(buffer.next().await, Some("first".to_owned()));
        producer.await.unwrap().unwrap();
        assert_eq!(buffer.next().await, Some("second".to_owned()));
    }

    #[tokio::test]
    async fn high_capacity_spills_and_never_blocks() {
        let buffer = memory_buffer(BufferMode::HighCapacity, 1, 2);

        buffer.add("a".to_owned()).await.unwrap();
        buffer.add("b".to_owned()).await.unwrap();
        buffer.add("c".to_owned()).await.unwrap();
        assert_eq!(buffer.len().await, 3);

        // Overflow full: the add drops instead of blocking.
        assert!(matches!(
            buffer.add("d".to_owned()).await,
            Err(AddError::Dropped)
        ));
        assert_eq!(buffer.dropped().await, 1);

        assert_eq!(buffer.next().await, Some("a".to_owned()));
        assert_eq!(buffer.next().await, Some("b".to_owned()));
        assert_eq!(buffer.next().await, Some("c".to_owned()));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let buffer = memory_buffer(BufferMode::HiLow, 4, 4);
        buffer.add("x".to_owned()).await.unwrap();
        buffer.close().await;

        assert!(matches!(
            buffer.add("y".to_owned()).await,
            Err(AddError::Closed)
        ));
        assert_eq!(buffer.next().await, Some("x".to_owned()));
        assert_eq!(buffer.next().await, None);
    }

    #[tokio::test]
    async fn durable_overflow_round_trips() {
        let dir = tempdir().unwrap();
        let queue: PersistentQueue<String> =
            PersistentQueue::open(dir.path(), 8, Box::new(StringCodec)).unwrap();
        let buffer = TwoTierBuffer::new(BufferMode::HighCapacity, 1, Overflow::Durable(queue));

        buffer.add("mem".to_owned()).await.unwrap();
        buffer.add("disk1".to_owned()).await.unwrap();
        buffer.add("disk2".to_owned()).await.unwrap();

        assert_eq!(buffer.next().await, Some("mem".to_owned()));
        assert_eq!(buffer.next().await, Some("disk1".to_owned()));
        assert_eq!(buffer.next().await, Some("disk2".to_owned()));
        assert_eq!(buffer.try_next().await, None);
    }
}
