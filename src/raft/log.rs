use super::{NodeID, Term};
use crate::encoding::{bincode, Value as _};
use crate::error::{Error, Result};
use crate::storage;

use serde_derive::{Deserialize, Serialize};

/// A log index. Starts at 1, with 0 meaning no entry.
pub type Index = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The position of the entry in the log.
    pub index: Index,
    /// The term under which the leader proposed the entry.
    pub term: Term,
    /// The replicated command. The payload is opaque to the consensus engine.
    /// None is a noop, appended when a leader assumes leadership to commit
    /// entries from earlier terms (see section 5.4.2 in the Raft paper).
    pub command: Option<Vec<u8>>,
}

impl crate::encoding::Value for Entry {}

/// A log storage key. Entries sort by index under a common prefix, so a range
/// scan over entry keys yields them in log order.
#[derive(Clone, Debug, PartialEq)]
enum Key {
    /// A log entry, keyed by index.
    Entry(Index),
    /// The current term and vote (if any).
    TermVote,
    /// The current commit index and term.
    CommitIndex,
}

impl Key {
    fn encode(&self) -> Vec<u8> {
        match self {
            Key::Entry(index) => {
                let mut key = Vec::with_capacity(9);
                key.push(0x00);
                key.extend(index.to_be_bytes());
                key
            }
            Key::TermVote => vec![0x01],
            Key::CommitIndex => vec![0x02],
        }
    }
}

/// The replicated Raft log, backed by a key/value storage engine. Besides the
/// entries themselves it persists the node's term and vote, which must
/// survive restarts for the one-vote-per-term rule to hold.
///
/// Entries are written by the leader via [`Log::append`] and copied to
/// followers via [`Log::splice`]. An index replicated to a majority becomes
/// committed and immutable; everything above the commit index is provisional
/// and may still be replaced if leadership changes before it reaches a
/// majority.
///
/// The log guarantees that:
///
/// * indexes are contiguous from 1, with terms non-decreasing along the log
///   and never above the node's current term,
/// * the node's term never decreases, and its vote within a term is final,
/// * entries and term/vote changes are flushed to disk before being relied
///   on (the commit index is the one exception, see [`Log::commit`]),
/// * nothing at or below the commit index is ever rewritten.
///
/// Violations of these are reported as [`Error::Internal`]: they indicate a
/// bug, and the node aborts rather than risk diverging from its peers.
pub struct Log {
    /// The underlying storage engine. A trait object allows runtime selection
    /// of the engine without propagating generics through the Raft node.
    engine: Box<dyn storage::Engine>,
    /// The node's current term.
    term: Term,
    /// Who we voted for in the current term, if anyone.
    vote: Option<NodeID>,
    /// Cached index of the final log entry.
    last_index: Index,
    /// Cached term of the final log entry.
    last_term: Term,
    /// Cached index of the newest committed entry.
    commit_index: Index,
    /// Cached term of the newest committed entry.
    commit_term: Term,
}

impl Log {
    /// Opens the log in the given storage engine, recovering the cached
    /// term/vote, commit, and last-entry state from it.
    pub fn new(mut engine: Box<dyn storage::Engine>) -> Result<Self> {
        use std::ops::Bound;
        let (term, vote) = match engine.get(&Key::TermVote.encode())? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => (0, None),
        };
        let (commit_index, commit_term) = match engine.get(&Key::CommitIndex.encode())? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => (0, 0),
        };
        // The last entry is whatever sorts highest in the entry keyspace.
        let range = (
            Bound::Included(Key::Entry(0).encode()),
            Bound::Included(Key::Entry(Index::MAX).encode()),
        );
        let (last_index, last_term) = match engine.scan(range).next_back().transpose()? {
            Some((_, bytes)) => {
                let entry = Entry::decode(&bytes)?;
                (entry.index, entry.term)
            }
            None => (0, 0),
        };
        Ok(Self { engine, term, vote, last_index, last_term, commit_index, commit_term })
    }

    /// Returns the newest committed entry's index and term, or zeroes if
    /// nothing has been committed.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the last entry's index and term, or zeroes if the log is
    /// empty.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the node's term (0 before the first election) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeID>) {
        (self.term, self.vote)
    }

    /// Persists a new term and vote. The term only ever grows, and a vote
    /// cast within a term is final: revoting is how you end up with two
    /// leaders.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        if term == 0 {
            return Err(Error::Internal("term 0 is reserved".to_string()));
        }
        if term < self.term {
            return Err(Error::Internal(format!(
                "term went backwards from {} to {term}",
                self.term
            )));
        }
        if term == self.term {
            if (term, vote) == (self.term, self.vote) {
                return Ok(());
            }
            if let Some(cast) = self.vote {
                return Err(Error::Internal(format!(
                    "already voted for {cast} in term {term}"
                )));
            }
        }
        self.engine.set(&Key::TermVote.encode(), bincode::serialize(&(term, vote))?)?;
        self.engine.flush()?;
        (self.term, self.vote) = (term, vote);
        Ok(())
    }

    /// Appends a command with the current term, flushes it to disk, and
    /// returns its index. A None command is a noop entry.
    pub fn append(&mut self, command: Option<Vec<u8>>) -> Result<Index> {
        if self.term == 0 {
            return Err(Error::Internal("cannot append before the first term".to_string()));
        }
        let entry = Entry { index: self.last_index + 1, term: self.term, command };
        self.engine.set(&Key::Entry(entry.index).encode(), entry.encode()?)?;
        self.engine.flush()?;
        (self.last_index, self.last_term) = (entry.index, entry.term);
        Ok(entry.index)
    }

    /// Marks the log as committed up to and including the given index, which
    /// must exist. Commits are monotonic.
    ///
    /// The commit index is written without a flush: the entries it covers are
    /// already durable, and a commit index lost in a crash is recovered from
    /// a log quorum.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        if index == self.commit_index {
            return Ok(index);
        }
        if index < self.commit_index {
            return Err(Error::Internal(format!(
                "commit went backwards from {} to {index}",
                self.commit_index
            )));
        }
        let entry = self
            .get(index)?
            .ok_or_else(|| Error::Internal(format!("no entry to commit at index {index}")))?;
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, entry.term))?)?;
        (self.commit_index, self.commit_term) = (index, entry.term);
        Ok(index)
    }

    /// Looks up the entry at the given index, if any.
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        match self.engine.get(&Key::Entry(index).encode())? {
            Some(bytes) => Ok(Some(Entry::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns true if the log contains the given index/term pair.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        // Followers mostly probe the head of the log when processing
        // heartbeats, so answer from the cached last entry when possible.
        if (index, term) == (self.last_index, self.last_term) {
            return Ok(index != 0);
        }
        if index == 0 || index > self.last_index {
            return Ok(false);
        }
        Ok(self.get(index)?.is_some_and(|entry| entry.term == term))
    }

    /// Iterates over log entries in the given index range.
    pub fn scan(&mut self, range: impl std::ops::RangeBounds<Index>) -> Iterator<'_> {
        use std::ops::Bound::{Excluded, Included, Unbounded};
        let key = |index: &Index| Key::Entry(*index).encode();
        let start = match range.start_bound() {
            Included(index) => Included(key(index)),
            Excluded(index) => Excluded(key(index)),
            Unbounded => Included(key(&0)),
        };
        let end = match range.end_bound() {
            Included(index) => Included(key(index)),
            Excluded(index) => Excluded(key(index)),
            Unbounded => Included(key(&Index::MAX)),
        };
        Iterator::new(self.engine.scan((start, end)))
    }

    /// Iterates over the committed entries that are ready to apply: those
    /// above the given applied index, up to and including the commit index.
    /// Yields nothing if the applied index is already caught up, including
    /// the restart case where the unflushed commit index lags behind it.
    pub fn scan_apply(&mut self, applied_index: Index) -> Iterator<'_> {
        if applied_index >= self.commit_index {
            return Iterator::new(Box::new(std::iter::empty()));
        }
        self.scan(applied_index + 1..=self.commit_index)
    }

    /// Merges a batch of replicated entries into the log and flushes them to
    /// disk. The batch must be contiguous, connect to the existing log, and
    /// stay at or below the current term.
    ///
    /// Entries the log already holds (same index and term) are left alone.
    /// At the first index where the incoming term disagrees with the local
    /// one, the local suffix is discarded and replaced with the rest of the
    /// batch; the commit index fences this off, since committed entries must
    /// never change.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let Some(last) = entries.last().cloned() else {
            return Ok(self.last_index); // nothing to do
        };
        self.check_splice(&entries)?;

        // Skip ahead to the first entry that differs from the local log.
        let mut incoming = entries.as_slice();
        let mut scan = self.scan(incoming[0].index..=last.index);
        while let Some(have) = scan.next().transpose()? {
            if have.index != incoming[0].index {
                return Err(Error::Internal(format!(
                    "scan returned index {} instead of {}",
                    have.index, incoming[0].index
                )));
            }
            if have.term != incoming[0].term {
                break;
            }
            if have.command != incoming[0].command {
                return Err(Error::Internal(format!(
                    "commands differ for entry {}@{}",
                    have.index, have.term
                )));
            }
            incoming = &incoming[1..];
        }
        drop(scan);

        let Some(first) = incoming.first() else {
            return Ok(self.last_index); // everything was already present
        };
        if first.index <= self.commit_index {
            return Err(Error::Internal(format!(
                "refusing to replace committed entry {}",
                first.index
            )));
        }

        // Write the remaining entries, and drop any stale local suffix
        // beyond the batch.
        for entry in incoming {
            self.engine.set(&Key::Entry(entry.index).encode(), entry.encode()?)?;
        }
        for index in last.index + 1..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;

        (self.last_index, self.last_term) = (last.index, last.term);
        Ok(self.last_index)
    }

    /// Validates a non-empty entry batch before splicing it.
    fn check_splice(&mut self, entries: &[Entry]) -> Result<()> {
        let first = &entries[0];
        if first.index == 0 || first.term == 0 {
            return Err(Error::Internal("entry batch starts at index or term 0".to_string()));
        }
        for pair in entries.windows(2) {
            if pair[1].index != pair[0].index + 1 || pair[1].term < pair[0].term {
                return Err(Error::Internal(format!(
                    "entry batch is malformed at index {}",
                    pair[1].index
                )));
            }
        }
        let last = &entries[entries.len() - 1];
        if last.term > self.term {
            return Err(Error::Internal(format!(
                "entry term {} is ahead of current term {}",
                last.term, self.term
            )));
        }
        if first.index > self.last_index + 1 {
            return Err(Error::Internal(format!(
                "entry batch starts at {} but the log ends at {}",
                first.index, self.last_index
            )));
        }
        if first.index > 1 {
            // The entry before the batch is the base it builds on; its term
            // can't be above the batch's.
            let base = self.get(first.index - 1)?.ok_or_else(|| {
                Error::Internal(format!("no base entry at index {}", first.index - 1))
            })?;
            if base.term > first.term {
                return Err(Error::Internal(format!(
                    "entry term {} is below base term {}",
                    first.term, base.term
                )));
            }
        }
        Ok(())
    }

    /// Returns log engine status.
    pub fn status(&mut self) -> Result<storage::Status> {
        self.engine.status()
    }
}

/// An iterator over a range of log entries.
pub struct Iterator<'a> {
    inner: Box<dyn storage::ScanIterator + 'a>,
}

impl<'a> Iterator<'a> {
    fn new(inner: Box<dyn storage::ScanIterator + 'a>) -> Self {
        Self { inner }
    }
}

impl std::iter::Iterator for Iterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}
