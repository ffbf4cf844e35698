//! Records consensus transition events and latencies as newline-delimited
//! JSON, e.g.:
//!
//! ```json
//! {"ts_ms":1234,"event":"promotion_succeeded","rank":0,"duration_ms":38}
//! ```
//!
//! Timestamps are milliseconds since process start, on the monotonic clock.
//! Recording is best-effort: a failed write is logged and dropped, never
//! propagated into consensus state.

use crate::error::Result;

use log::warn;
use serde_derive::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A recorded event. Serialized with an "event" tag naming the variant.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A classical election started.
    ElectionStarted { term: u64 },
    /// A classical election was won.
    ElectionWon { term: u64, duration_ms: u64 },
    /// A sub-leader began an instant promotion.
    PromotionStarted { rank: u8, term: u64 },
    /// An instant promotion reached quorum.
    PromotionSucceeded { rank: u8, term: u64, duration_ms: u64 },
    /// An instant promotion failed.
    PromotionFailed { rank: u8, term: u64, reason: String },
    /// The leader assigned a sub-leader rank to a peer.
    SubleaderAssigned { rank: u8, peer: u8 },
    /// A leader or promotion candidate stepped down.
    StepDown { reason: String },
    /// A heartbeat round-trip sample for a peer.
    HeartbeatRtt { peer: u8, rtt_ms: f64 },
}

/// A metrics sink handle. Cheap to clone; all clones share the sink. A
/// disabled sink makes recording a no-op.
#[derive(Clone)]
pub struct Metrics {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    /// The process start, used as the timestamp epoch.
    start: Instant,
    /// The record sink.
    sink: Mutex<Box<dyn Write + Send>>,
}

/// A single sink record: the event plus a timestamp.
#[derive(Serialize)]
struct Record<'a> {
    ts_ms: u64,
    #[serde(flatten)]
    event: &'a Event,
}

impl Metrics {
    /// Creates a disabled sink that discards all events.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Creates a sink appending to the given file.
    pub fn file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        if let Some(dir) = path.as_ref().parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::writer(Box::new(file)))
    }

    /// Creates a sink writing to the given writer.
    pub fn writer(sink: Box<dyn Write + Send>) -> Self {
        Self { inner: Some(Arc::new(Inner { start: Instant::now(), sink: Mutex::new(sink) })) }
    }

    /// Records an event. Write failures are logged and dropped.
    pub fn record(&self, event: Event) {
        let Some(inner) = &self.inner else {
            return;
        };
        let record = Record { ts_ms: inner.start.elapsed().as_millis() as u64, event: &event };
        let result = serde_json::to_string(&record).map_err(crate::error::Error::from).and_then(
            |line| match inner.sink.lock() {
                Ok(mut sink) => {
                    writeln!(sink, "{line}")?;
                    Ok(sink.flush()?)
                }
                Err(poisoned) => crate::errdata!("metrics sink poisoned: {poisoned}"),
            },
        );
        if let Err(err) = result {
            warn!("Failed to record metric {event:?}: {err}");
        }
    }
}
