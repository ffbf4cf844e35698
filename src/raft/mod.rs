//! The consensus engine: a Raft variant where the leader pre-designates
//! RTT-ranked sub-leaders (Primary and Secondary) that can take over
//! without a vote round when the leader vanishes, falling back to classical
//! Raft elections when instant promotion fails.

mod log;
mod message;
mod node;
mod state;

pub use self::log::{Entry, Index, Log};
pub use message::{Envelope, Message, Rank};
pub use node::{Node, NodeID, Options, Term, Ticks};
pub use state::{NoopState, State};

use std::time::Duration;

/// The interval between driver ticks, the unit of logical time. All role
/// timeouts are counted in ticks; millisecond knobs quantize to this.
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// The number of ticks between leader heartbeats.
pub const HEARTBEAT_INTERVAL: Ticks = 5;

/// The randomized election timeout range for followers and candidates, in
/// ticks. Sampled half-open, i.e. this covers 300-1000 ms.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 30..101;

/// The randomized timeout range for the Primary sub-leader (150-200 ms).
/// Also used as the promotion deadline of an in-flight instant promotion.
pub const PRIMARY_TIMEOUT_RANGE: std::ops::Range<Ticks> = 15..21;

/// The randomized timeout range for the Secondary sub-leader (250-350 ms).
pub const SECONDARY_TIMEOUT_RANGE: std::ops::Range<Ticks> = 25..36;

/// The number of heartbeat rounds between sub-leader re-rankings.
pub const RERANK_INTERVAL: u8 = 5;

/// The weight of a new sample in the RTT estimate's moving average.
pub const RTT_ALPHA: f64 = 0.3;

/// The age beyond which an RTT estimate no longer qualifies a peer for
/// sub-leader ranking.
pub const RTT_STALE: Duration = Duration::from_secs(5);

/// The cap on the number of sub-leaders, as a fraction of cluster size.
pub const SUBLEADER_RATIO: f64 = 0.4;

/// The number of heartbeat intervals without quorum acknowledgement after
/// which a leader steps down (it is likely partitioned from the majority).
pub const LEASE_INTERVALS: u16 = 30;

/// The maximum number of entries in a single AppendEntries message.
pub const MAX_APPEND_ENTRIES: usize = 64;
