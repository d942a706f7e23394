//! Count/bytes/age batching with explicit flush reasons.
//!
//! `add` and the periodic age check are serialized through one async mutex,
//! and the flush callback runs while that lock is held, so batches reach
//! the buffer in the exact order they were cut.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Mutex;

/// Why a batch was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The incoming item would have pushed the batch over a limit, so the
    /// batch was flushed before adding it.
    BeforeAdd,
    /// The incoming item itself filled the batch to a limit.
    AfterAdd,
    /// The oldest item aged past `max_age`.
    Timer,
    /// The sink is stopping.
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct BatcherSettings {
    pub max_count: usize,
    pub max_bytes: usize,
    pub max_age: Duration,
    /// Cap on the earliest-to-latest event-timestamp span inside a batch,
    /// for destinations that reject wide batches.
    pub max_timestamp_span: Option<chrono::Duration>,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        BatcherSettings {
            max_count: 500,
            max_bytes: 1024 * 1024,
            max_age: Duration::from_secs(1),
            max_timestamp_span: None,
        }
    }
}

type FlushFn<T> = Box<dyn Fn(Vec<T>, FlushReason) -> BoxFuture<'static, ()> + Send + Sync>;

struct State<T> {
    items: Vec<T>,
    bytes: usize,
    oldest_at: Option<Instant>,
    earliest_ts: Option<DateTime<Utc>>,
    latest_ts: Option<DateTime<Utc>>,
}

impl<T> State<T> {
    fn reset(&mut self) -> Vec<T> {
        self.bytes = 0;
        self.oldest_at = None;
        self.earliest_ts = None;
        self.latest_ts = None;
        std::mem::take(&mut self.items)
    }
}

/// Groups items into batches bounded by count, bytes, age, and timestamp
/// span. The flush callback receives each completed batch with its reason.
pub struct Batcher<T> {
    settings: BatcherSettings,
    state: Mutex<State<T>>,
    flush: FlushFn<T>,
}

impl<T: Send> Batcher<T> {
    pub fn new(settings: BatcherSettings, flush: FlushFn<T>) -> Self {
        Batcher {
            settings,
            state: Mutex::new(State {
                items: Vec::new(),
                bytes: 0,
                oldest_at: None,
                earliest_ts: None,
                latest_ts: None,
            }),
            flush,
        }
    }

    /// Add one item of `size` bytes, carrying an optional event timestamp
    /// for the span cap.
    pub async fn add(&self, item: T, size: usize, timestamp: Option<DateTime<Utc>>) {
        let mut state = self.state.lock().await;

        if !state.items.is_empty() && self.would_exceed(&state, size, timestamp) {
            let batch = state.reset();
            (self.flush)(batch, FlushReason::BeforeAdd).await;
        }

        if state.items.is_empty() {
            state.oldest_at = Some(Instant::now());
        }
        state.items.push(item);
        state.bytes += size;
        if let Some(ts) = timestamp {
            state.earliest_ts = Some(state.earliest_ts.map_or(ts, |e| e.min(ts)));
            state.latest_ts = Some(state.latest_ts.map_or(ts, |l| l.max(ts)));
        }

        if state.items.len() >= self.settings.max_count || state.bytes >= self.settings.max_bytes {
            let batch = state.reset();
            (self.flush)(batch, FlushReason::AfterAdd).await;
        }
    }

    fn would_exceed(&self, state: &State<T>, size: usize, timestamp: Option<DateTime<Utc>>) -> bool {
        if state.items.len() + 1 > self.settings.max_count {
            return true;
        }
        if state.bytes + size > self.settings.max_bytes {
            return true;
        }
        if let (Some(max_span), Some(ts)) = (self.settings.max_timestamp_span, timestamp) {
            let earliest = state.earliest_ts.map_or(ts, |e| e.min(ts));
            let latest = state.latest_ts.map_or(ts, |l| l.max(ts));
            if latest - earliest > max_span {
                return true;
            }
        }
        false
    }

    /// Cut the current batch if its oldest item has aged out. Driven by
    /// the sink's timer task.
    pub async fn flush_aged(&self) {
        let mut state = self.state.lock().await;
        let aged = state
            .oldest_at
            .map_or(false, |at| at.elapsed() >= self.settings.max_age);
        if aged && !state.items.is_empty() {
            let batch = state.reset();
            (self.flush)(batch, FlushReason::Timer).await;
        }
    }

    /// Flush whatever is pending on shutdown.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.items.is_empty() {
            let batch = state.reset();
            (self.flush)(batch, FlushReason::Stop).await;
        }
    }

    pub fn max_age(&self) -> Duration {
        self.settings.max_age
    }
}
