#![deny(clippy::all)]

//! Durable FIFO buffering for batch pipelines.
//!
//! Two pieces: a bounded file-backed queue whose contents survive a crash
//! ([`PersistentQueue`]), and the [`TwoTierBuffer`] that pairs a fast
//! bounded in-memory tier with a slower overflow tier for backpressure.

mod queue;
mod two_tier;

pub use self::queue::{CodecError, ItemCodec, PersistentQueue, QueueError};
pub use self::two_tier::{AddError, BufferMode, Overflow, TwoTierBuffer};
