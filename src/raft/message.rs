use super::{Entry, Index, NodeID, Term};
use crate::encoding::bincode;
use crate::errdata;
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};

/// The maximum length of an encoded message frame, in bytes. Longer frames
/// are considered malformed.
const MAX_FRAME_LEN: u32 = 4 << 20;

/// The maximum valid term. Terms beyond this are considered malformed.
const MAX_TERM: Term = i64::MAX as Term;

/// A message envelope sent between Raft nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeID,
    /// The recipient.
    pub to: NodeID,
    /// The sender's current term.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

/// A message between Raft nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Leaders replicate log entries and assert leadership with periodic
    /// AppendEntries messages, which double as heartbeats when empty. Each
    /// message carries an RTT probe that the receiver echoes back.
    AppendEntries {
        /// The index of the entry immediately before the submitted entries.
        prev_index: Index,
        /// The term of the entry immediately before the submitted entries.
        prev_term: Term,
        /// Entries to append. Empty for a pure heartbeat.
        entries: Vec<Entry>,
        /// The leader's commit index.
        leader_commit: Index,
        /// The probe id of this heartbeat round, echoed in the reply.
        probe_id: u64,
        /// The leader's send timestamp. Opaque to the receiver, echoed back.
        sent_at: u64,
    },
    /// Followers accept or reject AppendEntries from their leader.
    AppendEntriesReply {
        /// Whether the entries matched and were appended.
        success: bool,
        /// On success, the index of the last matching entry. On rejection, a
        /// retry hint: the highest index worth probing next.
        match_index: Index,
        /// The echoed probe id.
        probe_id: u64,
        /// The echoed send timestamp.
        sent_at: u64,
    },
    /// Candidates solicit votes when campaigning for leadership.
    RequestVote {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },
    /// Voters may grant a single vote per term, on a first-come basis.
    RequestVoteReply {
        /// Whether the vote was granted.
        granted: bool,
    },
    /// The leader designates a follower as a ranked sub-leader.
    SubLeaderAssign {
        /// The assigned rank.
        rank: Rank,
    },
    /// The leader revokes a previous sub-leader designation.
    SubLeaderRevoke,
    /// A sub-leader that lost its leader claims leadership of a new term
    /// without a vote round.
    PromoteLeader {
        /// The claimant's sub-leader rank in the previous term.
        rank: Rank,
        /// The index of the claimant's last log entry.
        last_index: Index,
        /// The term of the claimant's last log entry.
        last_term: Term,
    },
    /// Peers accept or refuse a leadership claim.
    PromoteAck {
        /// Whether the claim was accepted. Acceptance counts as the peer's
        /// vote in the claimed term.
        accept: bool,
    },
}

/// A sub-leader rank. The Primary reacts to leader loss first, the Secondary
/// after the Primary's window has passed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Rank {
    Primary,
    Secondary,
}

impl Rank {
    /// Returns the rank for a position in the RTT ranking, 0 being closest.
    pub fn from_position(position: usize) -> Self {
        match position {
            0 => Rank::Primary,
            1 => Rank::Secondary,
            position => panic!("no rank for position {position}"),
        }
    }
}

impl From<Rank> for u8 {
    fn from(rank: Rank) -> Self {
        match rank {
            Rank::Primary => 0,
            Rank::Secondary => 1,
        }
    }
}

impl Envelope {
    /// Writes the envelope to a writer as a length-prefixed frame. The caller
    /// is responsible for flushing.
    pub fn write_into<W: std::io::Write>(&self, writer: &mut W) -> Result<()> {
        let frame = bincode::serialize(self)?;
        if frame.len() > MAX_FRAME_LEN as usize {
            return errdata!("message of {} bytes exceeds maximum frame length", frame.len());
        }
        writer.write_all(&(frame.len() as u32).to_be_bytes())?;
        writer.write_all(&frame)?;
        Ok(())
    }

    /// Reads a length-prefixed envelope frame from a reader, or None if the
    /// reader is cleanly closed. Malformed frames (oversized, undecodable, or
    /// carrying an out-of-bounds term) are errors; the caller is expected to
    /// drop the frame and reset the connection.
    pub fn read_from<R: std::io::Read>(reader: &mut R) -> Result<Option<Envelope>> {
        let mut lenbuf = [0u8; 4];
        if let Err(err) = reader.read_exact(&mut lenbuf) {
            return match err.kind() {
                std::io::ErrorKind::UnexpectedEof => Ok(None),
                std::io::ErrorKind::ConnectionReset => Ok(None),
                _ => Err(err.into()),
            };
        }
        let len = u32::from_be_bytes(lenbuf);
        if len > MAX_FRAME_LEN {
            return errdata!("frame length {len} exceeds maximum");
        }
        let mut frame = vec![0; len as usize];
        reader.read_exact(&mut frame)?;
        let envelope: Envelope = bincode::deserialize(&frame)?;
        if envelope.term > MAX_TERM {
            return errdata!("term {} out of bounds", envelope.term);
        }
        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One envelope of each message type.
    fn envelopes() -> Vec<Envelope> {
        let messages = vec![
            Message::AppendEntries {
                prev_index: 4,
                prev_term: 2,
                entries: vec![
                    Entry { index: 5, term: 3, command: None },
                    Entry { index: 6, term: 3, command: Some(vec![0xff, 0x00]) },
                ],
                leader_commit: 4,
                probe_id: 7,
                sent_at: 123_456,
            },
            Message::AppendEntriesReply {
                success: true,
                match_index: 6,
                probe_id: 7,
                sent_at: 123_456,
            },
            Message::RequestVote { last_index: 6, last_term: 3 },
            Message::RequestVoteReply { granted: false },
            Message::SubLeaderAssign { rank: Rank::Secondary },
            Message::SubLeaderRevoke,
            Message::PromoteLeader { rank: Rank::Primary, last_index: 6, last_term: 3 },
            Message::PromoteAck { accept: true },
        ];
        messages
            .into_iter()
            .enumerate()
            .map(|(i, message)| Envelope { from: 1, to: 2, term: 3 + i as Term, message })
            .collect()
    }

    /// Encode-then-decode of every message type yields the original.
    #[test]
    fn frame_roundtrip() -> Result<()> {
        let envelopes = envelopes();
        let mut buffer = Vec::new();
        for envelope in &envelopes {
            envelope.write_into(&mut buffer)?;
        }

        let mut reader = buffer.as_slice();
        for expect in &envelopes {
            assert_eq!(Envelope::read_from(&mut reader)?.as_ref(), Some(expect));
        }
        assert_eq!(Envelope::read_from(&mut reader)?, None);
        Ok(())
    }

    #[test]
    fn read_rejects_oversized_frame() {
        let mut buffer = Vec::new();
        buffer.extend((MAX_FRAME_LEN + 1).to_be_bytes());
        assert!(Envelope::read_from(&mut buffer.as_slice()).is_err());
    }

    #[test]
    fn read_rejects_garbage() {
        let mut buffer = Vec::new();
        buffer.extend(4u32.to_be_bytes());
        buffer.extend([0xde, 0xad, 0xbe, 0xef]);
        assert!(Envelope::read_from(&mut buffer.as_slice()).is_err());
    }

    #[test]
    fn read_rejects_out_of_bounds_term() -> Result<()> {
        let envelope = Envelope {
            from: 1,
            to: 2,
            term: MAX_TERM + 1,
            message: Message::RequestVoteReply { granted: true },
        };
        let mut buffer = Vec::new();
        envelope.write_into(&mut buffer)?;
        assert!(Envelope::read_from(&mut buffer.as_slice()).is_err());
        Ok(())
    }

    /// A frame truncated mid-payload is an error, not a clean EOF.
    #[test]
    fn read_rejects_truncated_frame() -> Result<()> {
        let mut buffer = Vec::new();
        envelopes()[0].write_into(&mut buffer)?;
        buffer.truncate(buffer.len() - 1);
        assert!(Envelope::read_from(&mut buffer.as_slice()).is_err());
        Ok(())
    }
}
