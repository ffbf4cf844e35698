use super::{Entry, Envelope, Index, Log, Message, Rank, State};
use crate::errinput;
use crate::error::{Error, Result};
use crate::metrics::{Event, Metrics};

use itertools::Itertools as _;
use log::{debug, info, warn};
use rand::Rng as _;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// A node ID. IDs start at 1; 0 is never a valid node.
pub type NodeID = u8;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as a number of driver ticks.
pub type Ticks = u8;

/// Raft node options.
#[derive(Clone, Debug)]
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The randomized election timeout range for plain followers and
    /// candidates, in ticks.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// The randomized timeout range for the Primary sub-leader. Also used as
    /// the promotion deadline, regardless of the promoter's rank.
    pub primary_timeout_range: std::ops::Range<Ticks>,
    /// The randomized timeout range for the Secondary sub-leader.
    pub secondary_timeout_range: std::ops::Range<Ticks>,
    /// Whether the sub-leader extension is enabled. When false the node runs
    /// classical Raft: leaders assign no sub-leaders, and this node neither
    /// accepts a rank nor attempts instant promotion.
    pub enable_subleader: bool,
    /// The cap on sub-leader count, as a fraction of cluster size.
    pub subleader_ratio: f64,
    /// The number of heartbeat rounds between sub-leader re-rankings.
    pub rerank_interval: u8,
    /// The weight of a new sample in the RTT moving average.
    pub rtt_alpha: f64,
    /// The age beyond which an RTT estimate no longer qualifies a peer for
    /// sub-leader ranking.
    pub rtt_stale: Duration,
    /// The maximum number of entries in a single AppendEntries message.
    pub max_append_entries: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            election_timeout_range: super::ELECTION_TIMEOUT_RANGE,
            primary_timeout_range: super::PRIMARY_TIMEOUT_RANGE,
            secondary_timeout_range: super::SECONDARY_TIMEOUT_RANGE,
            enable_subleader: true,
            subleader_ratio: super::SUBLEADER_RATIO,
            rerank_interval: super::RERANK_INTERVAL,
            rtt_alpha: super::RTT_ALPHA,
            rtt_stale: super::RTT_STALE,
            max_append_entries: super::MAX_APPEND_ENTRIES,
        }
    }
}

impl Options {
    /// Validates the options. In particular, the timeout ladder must satisfy
    /// primary.max < secondary.min < follower.min, so that when a leader
    /// vanishes the Primary reacts strictly before the Secondary, which
    /// reacts strictly before any plain follower.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval == 0 {
            return errinput!("heartbeat interval must be positive");
        }
        for (name, range) in [
            ("primary", &self.primary_timeout_range),
            ("secondary", &self.secondary_timeout_range),
            ("follower", &self.election_timeout_range),
        ] {
            if range.is_empty() {
                return errinput!("{name} timeout range {range:?} is empty");
            }
        }
        if self.primary_timeout_range.end > self.secondary_timeout_range.start {
            return errinput!("primary timeout must end before secondary timeout begins");
        }
        if self.secondary_timeout_range.start >= self.election_timeout_range.start {
            return errinput!("secondary timeout must begin before follower timeout");
        }
        if !(self.subleader_ratio > 0.0 && self.subleader_ratio <= 1.0) {
            return errinput!("sub-leader ratio must be in (0, 1]");
        }
        if !(self.rtt_alpha > 0.0 && self.rtt_alpha <= 1.0) {
            return errinput!("RTT smoothing weight must be in (0, 1]");
        }
        if self.rerank_interval == 0 {
            return errinput!("re-rank interval must be positive");
        }
        if self.max_append_entries == 0 {
            return errinput!("max append entries must be positive");
        }
        Ok(())
    }
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a
/// possibly different role. Outbound messages are sent via the given node_tx
/// channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Follower(RawNode<Follower>),
    Candidate(RawNode<Candidate>),
    Promoter(RawNode<Promoter>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower, or leader
    /// if there are no peers.
    pub fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
        metrics: Metrics,
    ) -> Result<Self> {
        opts.validate()?;
        let node = RawNode::new(id, peers, log, state, node_tx, opts, metrics)?;
        if node.peers.is_empty() {
            // If there are no peers, become leader immediately.
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        match self {
            Node::Follower(n) => n.id,
            Node::Candidate(n) => n.id,
            Node::Promoter(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Follower(n) => n.term(),
            Node::Candidate(n) => n.term(),
            Node::Promoter(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Processes a message from a peer.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Follower(n) => n.step(msg),
            Node::Candidate(n) => n.step(msg),
            Node::Promoter(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Follower(n) => n.tick(),
            Node::Candidate(n) => n.tick(),
            Node::Promoter(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Promoter>> for Node {
    fn from(n: RawNode<Promoter>) -> Self {
        Node::Promoter(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: follower, candidate, promoter, or leader.
pub trait Role {}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: HashSet<NodeID>,
    log: Log,
    state: Box<dyn State>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    metrics: Metrics,
    /// The origin of the node's monotonic clock, used to stamp RTT probes.
    /// Stamps are only ever compared on the node that generated them.
    epoch: Instant,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            metrics: self.metrics,
            epoch: self.epoch,
            role,
        }
    }

    /// Returns the node's current term. Convenience wrapper for Log.get_term().
    fn term(&self) -> Term {
        self.log.get_term().0
    }

    /// Returns the cluster size as number of nodes.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The slice must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message to a peer.
    fn send(&self, to: NodeID, message: Message) -> Result<()> {
        let msg = Envelope { from: self.id, to, term: self.term(), message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to all peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        // Sort for test determinism.
        for id in self.peers.iter().copied().sorted() {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout for a plain follower or
    /// candidate.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Generates a randomized timeout for a sub-leader of the given rank.
    fn gen_rank_timeout(&self, rank: Rank) -> Ticks {
        let range = match rank {
            Rank::Primary => self.opts.primary_timeout_range.clone(),
            Rank::Secondary => self.opts.secondary_timeout_range.clone(),
        };
        rand::thread_rng().gen_range(range)
    }

    /// Returns microseconds elapsed on the node's own clock, for RTT probe
    /// stamps.
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Checks whether a claimant's last log index/term is at least as
    /// up-to-date as the local log (the standard Raft vote rule).
    fn log_up_to_date(&self, last_index: Index, last_term: Term) -> bool {
        let (log_index, log_term) = self.log.get_last_index();
        last_term > log_term || (last_term == log_term && last_index >= log_index)
    }

    /// Adopts a leadership claim: votes for the claimant in its term, follows
    /// it as leader, and acknowledges the claim.
    fn follow_claim(mut self, from: NodeID, term: Term) -> Result<RawNode<Follower>> {
        info!("Accepting leadership claim by {from} in term {term}");
        self.log.set_term(term, Some(from))?;
        let election_timeout = self.gen_election_timeout();
        let node = self.into_role(Follower::new(Some(from), election_timeout));
        node.send(from, Message::PromoteAck { accept: true })?;
        Ok(node)
    }

    /// Applies any pending committed log entries to the state machine.
    fn maybe_apply(&mut self) -> Result<()> {
        let applied_index = self.state.get_applied_index();
        let mut iter = self.log.scan_apply(applied_index);
        while let Some(entry) = iter.next().transpose()? {
            debug!("Applying {entry:?}");
            self.state.apply(entry)?;
        }
        Ok(())
    }

    /// Rejects a past-term request, with a reply carrying our current term so
    /// a stale leader, candidate, or promoter discovers it and steps down.
    /// Past-term replies and sub-leader control messages are dropped silently.
    fn reject_past_term(&self, msg: &Envelope) -> Result<()> {
        let reply = match msg.message {
            Message::AppendEntries { probe_id, sent_at, .. } => {
                Message::AppendEntriesReply { success: false, match_index: 0, probe_id, sent_at }
            }
            Message::RequestVote { .. } => Message::RequestVoteReply { granted: false },
            Message::PromoteLeader { .. } => Message::PromoteAck { accept: false },
            _ => return Ok(()),
        };
        self.send(msg.from, reply)
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        // Messages must be addressed to the local node, from a known sender.
        assert_eq!(msg.to, self.id, "message to other node");
        assert!(
            msg.from == self.id || self.peers.contains(&msg.from),
            "unknown sender {}",
            msg.from
        );
    }
}

/// A follower replicates state from a leader, and may hold a sub-leader rank
/// that makes it a pre-designated successor.
pub struct Follower {
    /// The leader, or None if just initialized.
    leader: Option<NodeID>,
    /// The number of ticks since the last message from the leader.
    leader_seen: Ticks,
    /// The leader_seen timeout before triggering an election or promotion.
    election_timeout: Ticks,
    /// The sub-leader rank assigned by the current leader, if any. Cleared
    /// implicitly on any term change, since the role is rebuilt.
    rank: Option<Rank>,
}

impl Follower {
    fn new(leader: Option<NodeID>, election_timeout: Ticks) -> Self {
        Self { leader, leader_seen: 0, election_timeout, rank: None }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower.
    fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
        metrics: Metrics,
    ) -> Result<Self> {
        assert_ne!(id, 0, "node ID 0 is reserved");
        let role = Follower::new(None, 0);
        let mut node = Self {
            id,
            peers,
            log,
            state,
            node_tx,
            opts,
            metrics,
            epoch: Instant::now(),
            role,
        };
        node.role.election_timeout = node.gen_election_timeout();
        Ok(node)
    }

    /// Asserts internal invariants.
    fn assert(&mut self) -> Result<()> {
        if let Some(leader) = self.role.leader {
            assert_ne!(leader, self.id, "can't follow self");
            assert!(self.peers.contains(&leader), "leader not in peers");
            assert_ne!(self.term(), 0, "followers with leaders can't have term 0");
        } else {
            assert_eq!(self.role.rank, None, "leaderless follower has sub-leader rank");
        }
        assert!(self.role.leader_seen < self.role.election_timeout, "election timeout passed");
        Ok(())
    }

    /// Transitions the follower into a candidate, by campaigning for
    /// leadership in a new term.
    fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        // Apply any pending entries, so that we're caught up if we win.
        self.maybe_apply()?;

        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Transitions the follower into a promoter, claiming leadership of the
    /// next term without a vote round. Only sub-leaders do this, when their
    /// (short) timeout expires without leader contact.
    fn into_promoter(mut self) -> Result<RawNode<Promoter>> {
        let rank = self
            .role
            .rank
            .ok_or_else(|| Error::Internal("only sub-leaders can promote".to_string()))?;
        let term = self.term() + 1;
        info!("Leader {:?} lost, attempting instant promotion to term {term}", self.role.leader);

        // Apply any pending entries, so that we're caught up if we win.
        self.maybe_apply()?;

        // Claim the new term with our own vote, so no competing candidate or
        // promoter can win it without us.
        self.log.set_term(term, Some(self.id))?;
        self.metrics.record(Event::PromotionStarted { rank: rank.into(), term });

        // The promotion deadline uses the Primary window regardless of rank:
        // it only bounds how long we wait for acks before giving up.
        let timeout = self.gen_rank_timeout(Rank::Primary);
        let mut node = self.into_role(Promoter::new(rank, timeout));
        node.role.acks.insert(node.id);

        let (last_index, last_term) = node.log.get_last_index();
        node.broadcast(Message::PromoteLeader { rank, last_index, last_term })?;
        Ok(node)
    }

    /// Transitions the follower into a follower, either a leaderless follower
    /// in a new term (e.g. if someone holds a new election) or following a
    /// leader in the current term once someone wins the election.
    fn into_follower(mut self, leader: Option<NodeID>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have leader in term");
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader), self.role.election_timeout);
        } else {
            // We found a new term, but we don't necessarily know who the
            // leader is yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term(), "can't be leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            self.role = Follower::new(None, self.gen_election_timeout());
        }
        Ok(self)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert()?;
        self.assert_step(&msg);

        // Reject requests from past terms, so stale senders discover our
        // term; drop anything else from past terms.
        if msg.term < self.term() {
            debug!("Dropping message from past term ({msg:?})");
            self.reject_past_term(&msg)?;
            return Ok(self.into());
        }

        // A leadership claim for a future term is evaluated against our
        // current state: unlike other future-term messages, rejecting it does
        // not adopt the claimed term.
        if msg.term > self.term() {
            if let Message::PromoteLeader { last_index, last_term, .. } = msg.message {
                // The previous leader must be silent: either we never had
                // one, or we haven't heard from it for at least the shortest
                // window in which a legitimate promotion can fire.
                let leader_silent = self.role.leader.is_none()
                    || self.role.leader_seen >= self.opts.primary_timeout_range.start;
                if leader_silent && self.log_up_to_date(last_index, last_term) {
                    return Ok(self.follow_claim(msg.from, msg.term)?.into());
                }
                debug!("Rejecting leadership claim by {} in term {}", msg.from, msg.term);
                self.send(msg.from, Message::PromoteAck { accept: false })?;
                return Ok(self.into());
            }
            // Become a leaderless follower in the future term and step the
            // message. If it is an AppendEntries from the new leader,
            // stepping it will follow the leader.
            return self.into_follower(None, msg.term)?.step(msg);
        }

        // Record when we last saw a message from the leader (if any).
        if self.is_leader(msg.from) {
            self.role.leader_seen = 0;
        }

        match msg.message {
            // The leader replicates entries and asserts leadership. If we
            // don't have a leader in this term yet, follow it.
            Message::AppendEntries { prev_index, prev_term, entries, leader_commit, probe_id, sent_at } => {
                if let Some(first) = entries.first() {
                    assert_eq!(prev_index, first.index - 1, "base index mismatch");
                }
                match self.role.leader {
                    Some(leader) => assert_eq!(msg.from, leader, "multiple leaders in term"),
                    None => self = self.into_follower(Some(msg.from), msg.term)?,
                }

                // If the base entry matches our log, splice the entries.
                // Otherwise reject, hinting at the highest index worth
                // probing next so the leader can skip entries we don't have.
                let (success, match_index) =
                    if prev_index == 0 || self.log.has(prev_index, prev_term)? {
                        let last_new = entries.last().map(|e| e.index).unwrap_or(prev_index);
                        self.log.splice(entries)?;
                        (true, last_new)
                    } else {
                        let hint =
                            std::cmp::min(prev_index - 1, self.log.get_last_index().0);
                        (false, hint)
                    };

                // Advance the commit index and apply entries. This can't move
                // past the last index known to match the leader's log.
                if success {
                    let commit_index = std::cmp::min(leader_commit, match_index);
                    if commit_index > self.log.get_commit_index().0 {
                        self.log.commit(commit_index)?;
                        self.maybe_apply()?;
                    }
                }
                self.send(
                    msg.from,
                    Message::AppendEntriesReply { success, match_index, probe_id, sent_at },
                )?;
            }

            // A candidate in this term is requesting our vote.
            Message::RequestVote { last_index, last_term } => {
                // Don't vote if we already voted for someone else in this term.
                if let (_, Some(vote)) = self.log.get_term() {
                    if msg.from != vote {
                        self.send(msg.from, Message::RequestVoteReply { granted: false })?;
                        return Ok(self.into());
                    }
                }
                // Don't vote if our log is newer than the candidate's log.
                if !self.log_up_to_date(last_index, last_term) {
                    self.send(msg.from, Message::RequestVoteReply { granted: false })?;
                    return Ok(self.into());
                }
                info!("Voting for {} in term {} election", msg.from, msg.term);
                self.log.set_term(msg.term, Some(msg.from))?;
                // Granting a vote rearms the election deadline, giving the
                // candidate a chance to win before we campaign ourselves.
                self.role.leader_seen = 0;
                self.send(msg.from, Message::RequestVoteReply { granted: true })?;
            }

            // We may receive a vote after we lost an election and followed a
            // different leader. Ignore it.
            Message::RequestVoteReply { .. } => {}

            // The leader designates us as a sub-leader. Accept only from the
            // current leader, and only when the extension is enabled locally.
            Message::SubLeaderAssign { rank } => {
                if !self.opts.enable_subleader || !self.is_leader(msg.from) {
                    debug!("Ignoring sub-leader assignment from {}", msg.from);
                    return Ok(self.into());
                }
                if self.role.rank != Some(rank) {
                    info!("Assigned sub-leader rank {rank:?} by leader {}", msg.from);
                    self.role.rank = Some(rank);
                    self.role.election_timeout = self.gen_rank_timeout(rank);
                    self.role.leader_seen = 0;
                }
            }

            // The leader revokes our sub-leader rank, e.g. because another
            // peer now has a lower RTT.
            Message::SubLeaderRevoke => {
                if self.is_leader(msg.from) && self.role.rank.take().is_some() {
                    info!("Sub-leader rank revoked by leader {}", msg.from);
                    self.role.election_timeout = self.gen_election_timeout();
                    self.role.leader_seen = 0;
                }
            }

            // A sub-leader claims leadership of our current term. This only
            // succeeds if nobody has won the term yet: no vote cast, no
            // leader known.
            Message::PromoteLeader { last_index, last_term, .. } => {
                let free = self.log.get_term().1.is_none() && self.role.leader.is_none();
                if free && self.log_up_to_date(last_index, last_term) {
                    return Ok(self.follow_claim(msg.from, msg.term)?.into());
                }
                self.send(msg.from, Message::PromoteAck { accept: false })?;
            }

            // Stale replies to a role we no longer hold, e.g. after a leader
            // lease expiry in the same term. Ignore them.
            Message::AppendEntriesReply { .. } | Message::PromoteAck { .. } => {
                debug!("Dropping stale reply from {}", msg.from);
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. When the election timeout expires, a
    /// sub-leader attempts instant promotion while a plain follower starts a
    /// classical election. The sub-leader timeout ranges are strictly shorter,
    /// so promotion is attempted before any election can begin.
    fn tick(mut self) -> Result<Node> {
        self.assert()?;

        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            if self.opts.enable_subleader && self.role.rank.is_some() {
                return Ok(self.into_promoter()?.into());
            }
            return Ok(self.into_candidate()?.into());
        }
        Ok(self.into())
    }

    /// Checks if an address is the current leader.
    fn is_leader(&self, from: NodeID) -> bool {
        self.role.leader == Some(from)
    }
}

/// A candidate is campaigning to become a leader via a classical vote round.
pub struct Candidate {
    /// Votes received (including ourself).
    votes: HashSet<NodeID>,
    /// Ticks elapsed since election start.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
    /// When the election started, for the election duration metric.
    started: Instant,
}

impl Candidate {
    fn new(election_timeout: Ticks) -> Self {
        Self {
            votes: HashSet::new(),
            election_duration: 0,
            election_timeout,
            started: Instant::now(),
        }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&mut self) -> Result<()> {
        assert_ne!(self.term(), 0, "candidates can't have term 0");
        assert!(self.role.votes.contains(&self.id), "candidate did not vote for self");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
        assert!(
            self.role.election_duration < self.role.election_timeout,
            "election timeout passed"
        );
        Ok(())
    }

    /// Transitions the candidate to a follower. We either lost the election
    /// and follow the winner, or we discovered a new term in which case we
    /// step into it as a leaderless follower.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            Ok(self.into_role(Follower::new(Some(leader), election_timeout)))
        } else {
            // We found a new term, but we don't necessarily know who the
            // leader is yet.
            assert_ne!(term, self.term(), "can't be leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            Ok(self.into_role(Follower::new(None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader. We won the election.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        let (term, duration) = (self.term(), self.role.started.elapsed());
        info!("Won election for term {term}, becoming leader");
        self.metrics
            .record(Event::ElectionWon { term, duration_ms: duration.as_millis() as u64 });

        let peers = self.peers.clone();
        let (last_index, _) = self.log.get_last_index();
        let mut node = self.into_role(Leader::new(peers, last_index));

        // Propose an empty command when assuming leadership, to commit and
        // disambiguate entries from previous terms (see section 5.4.2 in the
        // Raft paper). Do this before the initial heartbeat, to avoid a
        // wasted replication roundtrip if a peer is behind.
        node.propose(None)?;
        node.maybe_commit_and_apply()?;
        node.heartbeat()?;
        Ok(node)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert()?;
        self.assert_step(&msg);

        // Reject requests from past terms, so stale senders discover our
        // term; drop anything else from past terms.
        if msg.term < self.term() {
            debug!("Dropping message from past term ({msg:?})");
            self.reject_past_term(&msg)?;
            return Ok(self.into());
        }

        if msg.term > self.term() {
            // A candidate is by definition leaderless and past its timeout,
            // so a future-term leadership claim only needs the log check.
            if let Message::PromoteLeader { last_index, last_term, .. } = msg.message {
                if self.log_up_to_date(last_index, last_term) {
                    return Ok(self.follow_claim(msg.from, msg.term)?.into());
                }
                self.send(msg.from, Message::PromoteAck { accept: false })?;
                return Ok(self.into());
            }
            return self.into_follower(msg.term, None)?.step(msg);
        }

        match msg.message {
            // Don't grant votes to other candidates who also campaign, nor to
            // same-term promotion claims: we already voted for ourself.
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteReply { granted: false })?;
            }
            Message::PromoteLeader { .. } => {
                self.send(msg.from, Message::PromoteAck { accept: false })?;
            }

            // If we received a vote, record it. If the vote gives us quorum,
            // assume leadership.
            Message::RequestVoteReply { granted: true } => {
                self.role.votes.insert(msg.from);
                if self.role.votes.len() >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }

            // We didn't get a vote. :(
            Message::RequestVoteReply { granted: false } => {}

            // If we receive entries in this term, we lost the election and
            // have a new leader. Follow it and step the message.
            Message::AppendEntries { .. } => {
                return self.into_follower(msg.term, Some(msg.from))?.step(msg);
            }

            // Sub-leader control messages require a known leader; we have
            // none. Stale replies can linger from an earlier role.
            Message::SubLeaderAssign { .. }
            | Message::SubLeaderRevoke
            | Message::AppendEntriesReply { .. }
            | Message::PromoteAck { .. } => {
                debug!("Ignoring message {msg:?} as candidate");
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. On timeout, start a new election for
    /// the next term.
    fn tick(mut self) -> Result<Node> {
        self.assert()?;

        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
        }
        Ok(self.into())
    }

    /// Campaigns for leadership by increasing the term, voting for ourself,
    /// and soliciting votes from all peers.
    fn campaign(&mut self) -> Result<()> {
        let term = self.term() + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id); // vote for ourself
        self.log.set_term(term, Some(self.id))?;
        self.metrics.record(Event::ElectionStarted { term });

        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast(Message::RequestVote { last_index, last_term })?;
        Ok(())
    }
}

/// A promoter is a sub-leader claiming leadership of a new term without a
/// vote round, after losing contact with its leader. It needs a strict
/// majority of accepted claims (its own included) before its deadline, and
/// otherwise returns to a plain follower.
pub struct Promoter {
    /// The sub-leader rank held when the promotion started.
    rank: Rank,
    /// Peers that accepted the claim (including ourself).
    acks: HashSet<NodeID>,
    /// Ticks elapsed since the promotion started.
    promotion_duration: Ticks,
    /// The promotion deadline, in ticks.
    promotion_timeout: Ticks,
    /// When the promotion started, for the promotion latency metric.
    started: Instant,
}

impl Promoter {
    fn new(rank: Rank, promotion_timeout: Ticks) -> Self {
        Self {
            rank,
            acks: HashSet::new(),
            promotion_duration: 0,
            promotion_timeout,
            started: Instant::now(),
        }
    }
}

impl Role for Promoter {}

impl RawNode<Promoter> {
    /// Asserts internal invariants.
    fn assert(&mut self) -> Result<()> {
        assert_ne!(self.term(), 0, "promoters can't have term 0");
        assert!(self.role.acks.contains(&self.id), "promoter did not accept own claim");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
        assert!(
            self.role.promotion_duration < self.role.promotion_timeout,
            "promotion timeout passed"
        );
        Ok(())
    }

    /// Transitions the promoter to a leader: a majority accepted the claim.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        let (term, rank) = (self.term(), self.role.rank);
        let duration = self.role.started.elapsed();
        info!("Instant promotion to leader succeeded in term {term} ({duration:?})");
        self.metrics.record(Event::PromotionSucceeded {
            rank: rank.into(),
            term,
            duration_ms: duration.as_millis() as u64,
        });

        let peers = self.peers.clone();
        let (last_index, _) = self.log.get_last_index();
        let mut node = self.into_role(Leader::new(peers, last_index));
        node.propose(None)?;
        node.maybe_commit_and_apply()?;
        node.heartbeat()?;
        Ok(node)
    }

    /// Abandons the promotion and becomes a follower. When a new term is
    /// given, it is adopted; otherwise we keep the current term and our own
    /// vote in it (we can't unvote), as a leaderless follower.
    fn into_follower(mut self, term: Option<Term>, reason: &str) -> Result<RawNode<Follower>> {
        info!("Instant promotion for term {} failed: {reason}", self.term());
        self.metrics.record(Event::PromotionFailed {
            rank: self.role.rank.into(),
            term: self.term(),
            reason: reason.to_string(),
        });
        if let Some(term) = term {
            assert!(term > self.term(), "can only adopt a later term");
            self.log.set_term(term, None)?;
        }
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_timeout)))
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert()?;
        self.assert_step(&msg);

        // Reject requests from past terms, so stale senders discover our
        // term; drop anything else from past terms.
        if msg.term < self.term() {
            debug!("Dropping message from past term ({msg:?})");
            self.reject_past_term(&msg)?;
            return Ok(self.into());
        }

        if msg.term > self.term() {
            // A higher-term claim supersedes ours; we're leaderless, so only
            // the log check applies.
            if let Message::PromoteLeader { last_index, last_term, .. } = msg.message {
                if self.log_up_to_date(last_index, last_term) {
                    let node = self.into_follower(None, "superseded by higher term")?;
                    return Ok(node.follow_claim(msg.from, msg.term)?.into());
                }
                self.send(msg.from, Message::PromoteAck { accept: false })?;
                return Ok(self.into());
            }
            return self.into_follower(Some(msg.term), "discovered higher term")?.step(msg);
        }

        match msg.message {
            // A peer accepted our claim. On majority, assume leadership.
            Message::PromoteAck { accept: true } => {
                self.role.acks.insert(msg.from);
                if self.role.acks.len() >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }

            // A peer refused our claim. The deadline decides the outcome.
            Message::PromoteAck { accept: false } => {}

            // Someone else won our claimed term (it gathered a majority that
            // excludes us). Follow it and step the message.
            Message::AppendEntries { .. } => {
                let mut node = self.into_follower(None, "another leader won the term")?;
                node = node.into_follower(Some(msg.from), msg.term)?;
                return node.step(msg);
            }

            // We already voted for ourself in this term.
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteReply { granted: false })?;
            }
            Message::PromoteLeader { .. } => {
                self.send(msg.from, Message::PromoteAck { accept: false })?;
            }

            Message::RequestVoteReply { .. }
            | Message::AppendEntriesReply { .. }
            | Message::SubLeaderAssign { .. }
            | Message::SubLeaderRevoke => {
                debug!("Ignoring message {msg:?} during promotion");
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. If the deadline passes without a
    /// majority, the promotion failed: return to a plain follower. If a
    /// lower-ranked sub-leader survives, its own (longer) timeout fires next
    /// and it makes its own attempt; otherwise classical elections take over.
    fn tick(mut self) -> Result<Node> {
        self.assert()?;

        self.role.promotion_duration += 1;
        if self.role.promotion_duration >= self.role.promotion_timeout {
            return Ok(self.into_follower(None, "timeout")?.into());
        }
        Ok(self.into())
    }
}

/// An exponentially weighted RTT estimate for a peer.
struct Rtt {
    /// The smoothed estimate, in milliseconds.
    estimate: f64,
    /// When the last sample was recorded. Estimates beyond a configured age
    /// no longer qualify the peer for sub-leader ranking.
    updated: Instant,
}

/// Follower replication progress.
struct Progress {
    /// The next index to replicate to the peer.
    next_index: Index,
    /// The last index where the peer's log matches the leader.
    match_index: Index,
    /// The RTT estimate for the peer, if any samples have been recorded.
    rtt: Option<Rtt>,
    /// The highest probe id sampled for RTT, to discard duplicate or
    /// reordered echoes.
    sampled_probe: u64,
}

impl Progress {
    /// Attempts to advance the peer's match index, returning true if it did.
    /// If next_index is below it, it is advanced to the following index, but
    /// is otherwise left as is to avoid regressing it unnecessarily.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Regresses the next index to the given index, if it's currently
    /// greater. Can't regress below match_index + 1. Returns true if
    /// next_index changed.
    fn regress_next(&mut self, next_index: Index) -> bool {
        if next_index >= self.next_index || self.next_index <= self.match_index + 1 {
            return false;
        }
        self.next_index = std::cmp::max(next_index, self.match_index + 1);
        true
    }
}

/// A leader replicates the log to followers, and ranks them by heartbeat RTT
/// to designate the closest ones as sub-leaders.
pub struct Leader {
    /// Follower replication progress and RTT estimates.
    progress: HashMap<NodeID, Progress>,
    /// Number of ticks since the last periodic heartbeat.
    since_heartbeat: Ticks,
    /// The probe id of the current heartbeat round, incremented per round and
    /// echoed by followers for RTT measurement.
    probe_seq: u64,
    /// Heartbeat rounds since the last sub-leader re-ranking.
    rounds: u8,
    /// The current sub-leader assignments, position = rank.
    subleaders: Vec<NodeID>,
    /// Peers heard from since the last quorum acknowledgement, for the leader
    /// lease.
    acked: HashSet<NodeID>,
    /// Ticks since a quorum of peers acknowledged our leadership. When this
    /// exceeds the lease, we're likely partitioned from the majority and step
    /// down rather than keep claiming leadership.
    since_quorum: u16,
}

impl Leader {
    fn new(peers: HashSet<NodeID>, last_index: Index) -> Self {
        let next_index = last_index + 1;
        let progress = peers
            .into_iter()
            .map(|p| (p, Progress { next_index, match_index: 0, rtt: None, sampled_probe: 0 }))
            .collect();
        Self {
            progress,
            since_heartbeat: 0,
            probe_seq: 0,
            rounds: 0,
            subleaders: Vec::new(),
            acked: HashSet::new(),
            since_quorum: 0,
        }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&mut self) -> Result<()> {
        assert_ne!(self.term(), 0, "leaders can't have term 0");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
        Ok(())
    }

    /// Transitions the leader into a leaderless follower in a later term.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "can only become follower in later term");
        info!("Discovered new term {term}, stepping down");
        self.metrics.record(Event::StepDown { reason: "higher term".to_string() });
        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_timeout)))
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert()?;
        self.assert_step(&msg);

        // Reject requests from past terms, so stale senders discover our
        // term; drop anything else from past terms.
        if msg.term < self.term() {
            debug!("Dropping message from past term ({msg:?})");
            self.reject_past_term(&msg)?;
            return Ok(self.into());
        }

        if msg.term > self.term() {
            // Refuse leadership claims while we're an active leader: our
            // recent heartbeats mean no legitimate promotion window can have
            // expired, and a rejected claim doesn't adopt the claimed term.
            if let Message::PromoteLeader { .. } = msg.message {
                self.send(msg.from, Message::PromoteAck { accept: false })?;
                return Ok(self.into());
            }
            return self.into_follower(msg.term)?.step(msg);
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::AppendEntries { .. } => {
                panic!("saw other leader {} in term {}", msg.from, msg.term);
            }

            // A follower accepted our entries. Record its progress, attempt
            // to commit, and record the echoed RTT probe.
            Message::AppendEntriesReply { success: true, match_index, probe_id, sent_at } => {
                let (last_index, _) = self.log.get_last_index();
                assert!(match_index <= last_index, "follower matched unknown index");

                self.role.acked.insert(msg.from);
                self.sample_rtt(msg.from, probe_id, sent_at)?;
                if self.progress(msg.from)?.advance(match_index) {
                    self.maybe_commit_and_apply()?;
                }
                // Eagerly send any further pending entries, e.g. when
                // catching a lagging peer up one batch at a time.
                self.maybe_send_append(msg.from)?;
            }

            // A follower rejected our entries because the base entry didn't
            // match its log. Regress towards its hint and retry.
            Message::AppendEntriesReply { success: false, match_index: hint, .. } => {
                self.role.acked.insert(msg.from);
                if self.progress(msg.from)?.regress_next(hint + 1) {
                    self.send_append(msg.from)?;
                }
            }

            // Don't grant other votes or claims in this term.
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteReply { granted: false })?;
            }
            Message::PromoteLeader { .. } => {
                self.send(msg.from, Message::PromoteAck { accept: false })?;
            }

            // Votes and claim acks can come in after we won, ignore them.
            Message::RequestVoteReply { .. } | Message::PromoteAck { .. } => {}

            // Only leaders send these, and there is exactly one leader per
            // term.
            Message::SubLeaderAssign { .. } | Message::SubLeaderRevoke => {
                panic!("saw sub-leader control from {} in term {}", msg.from, msg.term);
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert()?;

        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.role.since_heartbeat = 0;
            self.heartbeat()?;
        }

        // Leader lease: track how long it's been since a quorum of nodes
        // (ourself included) acknowledged our leadership. If it exceeds the
        // lease we're likely partitioned from the majority, which will elect
        // or promote its own leader; step down instead of limping along.
        if self.role.acked.len() + 1 >= self.quorum_size() {
            self.role.acked.clear();
            self.role.since_quorum = 0;
        } else {
            self.role.since_quorum += 1;
            let lease = super::LEASE_INTERVALS * self.opts.heartbeat_interval as u16;
            if self.role.since_quorum >= lease {
                warn!("Leader lease expired without quorum contact, stepping down");
                self.metrics.record(Event::StepDown { reason: "lease expired".to_string() });
                // Keep the current term and our vote in it; we just stop
                // acting as leader.
                let election_timeout = self.gen_election_timeout();
                return Ok(self.into_role(Follower::new(None, election_timeout)).into());
            }
        }
        Ok(self.into())
    }

    /// Broadcasts AppendEntries to all peers: pending log entries for peers
    /// that are behind, empty heartbeats otherwise. Each message probes the
    /// peer's RTT, and every rerank_interval rounds the sub-leader ranking is
    /// refreshed from the estimates.
    fn heartbeat(&mut self) -> Result<()> {
        self.role.probe_seq += 1;
        for peer in self.peers.iter().copied().sorted() {
            self.send_append(peer)?;
        }

        self.role.rounds += 1;
        if self.role.rounds >= self.opts.rerank_interval {
            self.role.rounds = 0;
            self.maybe_assign_subleaders()?;
        }
        Ok(())
    }

    /// Proposes a command for consensus by appending it to our log and
    /// replicating it to peers. If successful, it will eventually be
    /// committed and applied on all nodes.
    pub fn propose(&mut self, command: Option<Vec<u8>>) -> Result<Index> {
        let index = self.log.append(command)?;
        for peer in self.peers.iter().copied().sorted() {
            // Eagerly send the entry to peers that are in steady state, i.e.
            // where we've already sent all previous entries. Lagging or
            // divergent peers catch up via their reply cadence instead.
            if index == self.progress(peer)?.next_index {
                self.send_append(peer)?;
            }
        }
        Ok(index)
    }

    /// Sends an AppendEntries to a peer, with pending entries according to
    /// its next_index (empty if it's caught up).
    fn send_append(&mut self, peer: NodeID) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let (commit_index, _) = self.log.get_commit_index();
        let next_index = self.progress(peer)?.next_index;
        assert_ne!(next_index, 0, "invalid next_index");
        assert!(next_index <= last_index + 1, "next_index beyond last_index + 1");

        let (prev_index, prev_term) = match next_index - 1 {
            0 => (0, 0),
            prev => {
                let base = self.log.get(prev)?.ok_or_else(|| {
                    Error::Internal(format!("no base entry at index {prev}"))
                })?;
                (prev, base.term)
            }
        };
        let entries: Vec<Entry> = if next_index <= last_index {
            self.log.scan(next_index..).take(self.opts.max_append_entries).try_collect()?
        } else {
            Vec::new()
        };

        // Optimistically assume the entries will be accepted by the peer, to
        // avoid re-sending them on every heartbeat until a reply arrives. A
        // rejection regresses next_index again.
        if let Some(last) = entries.last() {
            self.progress(peer)?.next_index = last.index + 1;
        }

        let (probe_id, sent_at) = (self.role.probe_seq, self.now_us());
        debug!("Replicating {} entries with base {prev_index} to {peer}", entries.len());
        self.send(
            peer,
            Message::AppendEntries {
                prev_index,
                prev_term,
                entries,
                leader_commit: commit_index,
                probe_id,
                sent_at,
            },
        )
    }

    /// Sends pending log entries to a peer if there are any.
    fn maybe_send_append(&mut self, peer: NodeID) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        if self.progress(peer)?.next_index <= last_index {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// Commits any new log entries that have been replicated to a quorum, and
    /// applies them to the state machine.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        // Determine the new commit index.
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.get_last_index().0))
                .collect(),
        );

        // If the commit index doesn't advance, do nothing. We don't assert on
        // this, since the quorum value may regress e.g. following a restart
        // or leader change where peers are initialized with log index 0.
        let (commit_index, _) = self.log.get_commit_index();
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }

        // We can only safely commit an entry from our own term (see figure 8
        // in the Raft paper).
        match self.log.get(quorum_index)? {
            Some(entry) if entry.term == self.term() => {}
            Some(_) => return Ok(commit_index),
            None => {
                return Err(Error::Internal(format!("no entry at quorum index {quorum_index}")))
            }
        };

        let commit_index = self.log.commit(quorum_index)?;
        self.maybe_apply()?;
        Ok(commit_index)
    }

    /// Records an RTT sample for a peer from an echoed heartbeat probe, and
    /// folds it into the peer's moving average.
    fn sample_rtt(&mut self, peer: NodeID, probe_id: u64, sent_at: u64) -> Result<()> {
        // Discard echoes of probes we never sent, and duplicate or reordered
        // echoes of probes we already sampled.
        if probe_id > self.role.probe_seq {
            debug!("Ignoring echo of unknown probe {probe_id} from {peer}");
            return Ok(());
        }
        let now_us = self.now_us();
        let alpha = self.opts.rtt_alpha;

        let progress = self
            .role
            .progress
            .get_mut(&peer)
            .ok_or_else(|| Error::Internal(format!("unknown peer {peer}")))?;
        if probe_id <= progress.sampled_probe {
            return Ok(());
        }
        progress.sampled_probe = probe_id;

        let sample = now_us.saturating_sub(sent_at) as f64 / 1000.0;
        let estimate = match &progress.rtt {
            Some(rtt) => alpha * sample + (1.0 - alpha) * rtt.estimate,
            None => sample,
        };
        progress.rtt = Some(Rtt { estimate, updated: Instant::now() });
        self.metrics.record(Event::HeartbeatRtt { peer, rtt_ms: sample });
        Ok(())
    }

    /// Re-ranks peers by RTT estimate and, if the ranking changed, assigns
    /// the new sub-leaders and revokes demoted ones. Assignments are
    /// best-effort: a lost assignment only means that peer won't attempt
    /// instant promotion, and the next ranking round re-sends current state
    /// if it changed.
    fn maybe_assign_subleaders(&mut self) -> Result<()> {
        if !self.opts.enable_subleader {
            return Ok(());
        }
        // The wire protocol defines two ranks; the ratio knob can only lower
        // the cap below that.
        let cap = ((self.cluster_size() as f64 * self.opts.subleader_ratio) as usize).clamp(1, 2);
        let rtt_stale = self.opts.rtt_stale;

        // Rank peers with fresh RTT estimates ascending, ties by id.
        let mut estimates: Vec<(NodeID, f64)> = self
            .role
            .progress
            .iter()
            .filter_map(|(id, p)| {
                let rtt = p.rtt.as_ref()?;
                (rtt.updated.elapsed() <= rtt_stale).then_some((*id, rtt.estimate))
            })
            .collect();
        estimates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        let ranked: Vec<NodeID> = estimates.into_iter().take(cap).map(|(id, _)| id).collect();

        if ranked == self.role.subleaders {
            return Ok(());
        }
        info!("Sub-leaders changed: {:?} → {ranked:?}", self.role.subleaders);
        let old = std::mem::replace(&mut self.role.subleaders, ranked.clone());

        for (position, peer) in ranked.iter().copied().enumerate() {
            if old.get(position) == Some(&peer) {
                continue; // same rank as before
            }
            let rank = Rank::from_position(position);
            self.send(peer, Message::SubLeaderAssign { rank })?;
            self.metrics.record(Event::SubleaderAssigned { rank: rank.into(), peer });
        }
        for peer in old {
            if !ranked.contains(&peer) {
                self.send(peer, Message::SubLeaderRevoke)?;
            }
        }
        Ok(())
    }

    /// Returns a mutable borrow of a peer's progress.
    fn progress(&mut self, id: NodeID) -> Result<&mut Progress> {
        self.role.progress.get_mut(&id).ok_or_else(|| Error::Internal(format!("unknown peer {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::NoopState;
    use crate::storage::Memory;

    use crossbeam::channel::Receiver;
    use std::cell::RefCell;
    use test_case::test_case;

    /// Deterministic options for tests: all randomized ranges are singletons,
    /// so every timeout is exact.
    fn test_opts() -> Options {
        Options {
            heartbeat_interval: 2,
            election_timeout_range: 10..11,
            primary_timeout_range: 3..4,
            secondary_timeout_range: 5..6,
            rerank_interval: 1,
            ..Options::default()
        }
    }

    /// Test helpers for RawNode.
    impl RawNode<Follower> {
        /// Creates a noop node, with a noop state machine and transport.
        fn new_noop(id: NodeID, peers: HashSet<NodeID>) -> Self {
            let log = Log::new(Box::new(Memory::new())).expect("log failed");
            let state = Box::new(NoopState::new());
            let (node_tx, _) = crossbeam::channel::unbounded();
            RawNode::new(id, peers, log, state, node_tx, test_opts(), Metrics::disabled())
                .expect("node failed")
        }
    }

    /// Test accessors for Node.
    impl Node {
        fn log_mut(&mut self) -> &mut Log {
            match self {
                Node::Follower(n) => &mut n.log,
                Node::Candidate(n) => &mut n.log,
                Node::Promoter(n) => &mut n.log,
                Node::Leader(n) => &mut n.log,
            }
        }
    }

    /// A state machine that forwards applied entries to a channel.
    struct EmitState {
        applied_index: Index,
        tx: crossbeam::channel::Sender<Entry>,
    }

    impl State for EmitState {
        fn get_applied_index(&self) -> Index {
            self.applied_index
        }

        fn apply(&mut self, entry: Entry) -> Result<()> {
            self.applied_index = entry.index;
            self.tx.send(entry).ok();
            Ok(())
        }
    }

    /// An in-process cluster of nodes connected via channels, with messages
    /// delivered synchronously by the test.
    struct Cluster {
        ids: Vec<NodeID>,
        nodes: HashMap<NodeID, Node>,
        node_rx: HashMap<NodeID, Receiver<Envelope>>,
        applied_rx: HashMap<NodeID, Receiver<Entry>>,
        /// Nodes cut off from the rest of the cluster. Any message from or to
        /// these nodes is dropped on delivery.
        disconnected: HashSet<NodeID>,
    }

    impl Cluster {
        fn new(nodes: u8) -> Result<Self> {
            Self::new_with(nodes, |_| test_opts())
        }

        fn new_with(n: u8, opts_for: impl Fn(NodeID) -> Options) -> Result<Self> {
            let ids: Vec<NodeID> = (1..=n).collect();
            let mut cluster = Self {
                ids: ids.clone(),
                nodes: HashMap::new(),
                node_rx: HashMap::new(),
                applied_rx: HashMap::new(),
                disconnected: HashSet::new(),
            };
            for &id in &ids {
                let (node_tx, node_rx) = crossbeam::channel::unbounded();
                let (applied_tx, applied_rx) = crossbeam::channel::unbounded();
                let peers = ids.iter().copied().filter(|p| *p != id).collect();
                let log = Log::new(Box::new(Memory::new()))?;
                let state = Box::new(EmitState { applied_index: 0, tx: applied_tx });
                let node =
                    Node::new(id, peers, log, state, node_tx, opts_for(id), Metrics::disabled())?;
                cluster.nodes.insert(id, node);
                cluster.node_rx.insert(id, node_rx);
                cluster.applied_rx.insert(id, applied_rx);
            }
            Ok(cluster)
        }

        /// Elects the given node as leader, by campaigning and delivering all
        /// resulting messages.
        fn elect(&mut self, id: NodeID) -> Result<()> {
            self.campaign(id)?;
            self.deliver()?;
            assert_eq!(self.leader_id(), Some(id), "election failed");
            Ok(())
        }

        /// Transitions the given node to campaigning candidate.
        fn campaign(&mut self, id: NodeID) -> Result<()> {
            let node = match self.nodes.remove(&id).expect("unknown node") {
                Node::Follower(n) => n.into_candidate()?.into(),
                Node::Candidate(mut n) => {
                    n.campaign()?;
                    n.into()
                }
                _ => panic!("{id} can't campaign"),
            };
            self.nodes.insert(id, node);
            Ok(())
        }

        /// Delivers all in-flight messages, and any messages generated while
        /// doing so, until the cluster is quiescent.
        fn deliver(&mut self) -> Result<()> {
            self.deliver_map(Some)
        }

        /// Like deliver(), but passes each message through the given function
        /// first, which may rewrite or drop (None) it.
        fn deliver_map(&mut self, f: impl Fn(Envelope) -> Option<Envelope>) -> Result<()> {
            for _ in 0..1000 {
                let mut pending = Vec::new();
                for id in &self.ids {
                    while let Ok(envelope) = self.node_rx[id].try_recv() {
                        if self.disconnected.contains(&envelope.from)
                            || self.disconnected.contains(&envelope.to)
                        {
                            continue;
                        }
                        if let Some(envelope) = f(envelope) {
                            pending.push(envelope);
                        }
                    }
                }
                if pending.is_empty() {
                    return Ok(());
                }
                for envelope in pending {
                    let to = envelope.to;
                    let node = self.nodes.remove(&to).expect("unknown node");
                    self.nodes.insert(to, node.step(envelope)?);
                }
            }
            panic!("messages did not quiesce")
        }

        /// Discards all in-flight messages.
        fn drop_pending(&mut self) {
            for id in &self.ids {
                while self.node_rx[id].try_recv().is_ok() {}
            }
        }

        /// Ticks a single node.
        fn tick(&mut self, id: NodeID) -> Result<()> {
            let node = self.nodes.remove(&id).expect("unknown node");
            self.nodes.insert(id, node.tick()?);
            Ok(())
        }

        /// Ticks the given nodes the given number of rounds, interleaved.
        fn tick_many(&mut self, ids: &[NodeID], rounds: u16) -> Result<()> {
            for _ in 0..rounds {
                for &id in ids {
                    self.tick(id)?;
                }
            }
            Ok(())
        }

        /// Returns the single current leader, if any. Panics on multiple
        /// leaders (election safety violation).
        fn leader_id(&self) -> Option<NodeID> {
            let leaders: Vec<NodeID> = self
                .nodes
                .iter()
                .filter(|(_, n)| matches!(n, Node::Leader(_)))
                .map(|(id, _)| *id)
                .collect();
            assert!(leaders.len() <= 1, "multiple leaders: {leaders:?}");
            leaders.first().copied()
        }

        /// Returns the sub-leader rank of a node, if it is a follower.
        fn rank_of(&self, id: NodeID) -> Option<Rank> {
            match &self.nodes[&id] {
                Node::Follower(n) => n.role.rank,
                _ => None,
            }
        }

        /// Returns the leader a follower currently follows.
        fn leader_of(&self, id: NodeID) -> Option<NodeID> {
            match &self.nodes[&id] {
                Node::Follower(n) => n.role.leader,
                _ => None,
            }
        }

        fn term_of(&self, id: NodeID) -> Term {
            self.nodes[&id].term()
        }

        /// Proposes a command on the given node, which must be leader.
        fn propose(&mut self, id: NodeID, command: &[u8]) -> Result<Index> {
            match self.nodes.get_mut(&id).expect("unknown node") {
                Node::Leader(n) => n.propose(Some(command.to_vec())),
                _ => panic!("{id} is not leader"),
            }
        }

        /// Returns all log entries of a node.
        fn log_entries(&mut self, id: NodeID) -> Vec<Entry> {
            let node = self.nodes.get_mut(&id).expect("unknown node");
            node.log_mut().scan(..).collect::<Result<_>>().expect("scan failed")
        }

        /// Drains and returns entries applied on a node since the last call.
        fn applied(&self, id: NodeID) -> Vec<Entry> {
            self.applied_rx[&id].try_iter().collect()
        }

        /// Steps a crafted message on a node.
        fn step(&mut self, envelope: Envelope) -> Result<()> {
            let to = envelope.to;
            let node = self.nodes.remove(&to).expect("unknown node");
            self.nodes.insert(to, node.step(envelope)?);
            Ok(())
        }

        /// Drains and returns a node's outbound messages.
        fn sent_by(&self, id: NodeID) -> Vec<Envelope> {
            self.node_rx[&id].try_iter().collect()
        }
    }

    /// Rewrites echoed RTT probes so that each peer appears to have an RTT of
    /// scale_us * factor(id) microseconds, for deterministic rankings.
    fn with_rtt(scale_us: u64, factor: impl Fn(NodeID) -> u64) -> impl Fn(Envelope) -> Option<Envelope> {
        move |mut envelope| {
            if let Message::AppendEntriesReply { sent_at, .. } = &mut envelope.message {
                *sent_at = sent_at.saturating_sub(scale_us * factor(envelope.from));
            }
            Some(envelope)
        }
    }

    #[test_case(1 => 1)]
    #[test_case(2 => 2)]
    #[test_case(3 => 2)]
    #[test_case(4 => 3)]
    #[test_case(5 => 3)]
    #[test_case(6 => 4)]
    #[test_case(7 => 4)]
    fn quorum_size(size: usize) -> usize {
        let node = RawNode::new_noop(1, (2..=size as NodeID).collect());
        assert_eq!(node.cluster_size(), size);
        node.quorum_size()
    }

    #[test_case(vec![1] => 1)]
    #[test_case(vec![1,3,2] => 2)]
    #[test_case(vec![4,1,3,2] => 2)]
    #[test_case(vec![1,1,1,2,2] => 1)]
    #[test_case(vec![1,1,2,2,2] => 2)]
    fn quorum_value(values: Vec<i8>) -> i8 {
        let size = values.len();
        let node = RawNode::new_noop(1, (2..=size as NodeID).collect());
        node.quorum_value(values)
    }

    #[test]
    fn default_options_are_valid() {
        Options::default().validate().expect("default options invalid");
    }

    #[test]
    fn options_reject_broken_timeout_ladder() {
        // Primary overlapping secondary.
        let mut opts = Options::default();
        opts.primary_timeout_range = 15..30;
        assert!(opts.validate().is_err());

        // Secondary starting at or after the follower window.
        let mut opts = Options::default();
        opts.secondary_timeout_range = 30..40;
        assert!(opts.validate().is_err());

        // Empty range.
        let mut opts = Options::default();
        opts.election_timeout_range = 50..50;
        assert!(opts.validate().is_err());

        // Out-of-range knobs.
        let mut opts = Options::default();
        opts.subleader_ratio = 0.0;
        assert!(opts.validate().is_err());
        let mut opts = Options::default();
        opts.rtt_alpha = 1.5;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn initial_election_picks_single_leader() -> Result<()> {
        let mut c = Cluster::new(3)?;
        c.elect(1)?;

        assert_eq!(c.leader_id(), Some(1));
        for id in [2, 3] {
            assert_eq!(c.leader_of(id), Some(1));
            assert_eq!(c.term_of(id), 1);
        }

        // The leader commits and applies its initial noop entry once a quorum
        // has appended it.
        assert_eq!(c.applied(1), vec![Entry { index: 1, term: 1, command: None }]);

        // Followers commit it when the next heartbeat propagates the commit
        // index.
        c.tick_many(&[1], 2)?;
        c.deliver()?;
        for id in [2, 3] {
            assert_eq!(c.applied(id), vec![Entry { index: 1, term: 1, command: None }]);
        }
        Ok(())
    }

    #[test]
    fn follower_campaigns_on_election_timeout() -> Result<()> {
        let mut c = Cluster::new(3)?;
        c.tick_many(&[2], 10)?;
        assert!(matches!(c.nodes[&2], Node::Candidate(_)));

        let sent = c.sent_by(2);
        assert_eq!(sent.len(), 2);
        for envelope in &sent {
            assert_eq!(envelope.term, 1);
            assert_eq!(envelope.message, Message::RequestVote { last_index: 0, last_term: 0 });
        }

        // Re-inject the drained messages and finish the election.
        for envelope in sent {
            c.step(envelope)?;
        }
        c.deliver()?;
        assert_eq!(c.leader_id(), Some(2));
        Ok(())
    }

    #[test]
    fn vote_granted_once_per_term() -> Result<()> {
        let mut c = Cluster::new(3)?;

        let request = Message::RequestVote { last_index: 0, last_term: 0 };
        c.step(Envelope { from: 1, to: 3, term: 1, message: request.clone() })?;
        c.step(Envelope { from: 2, to: 3, term: 1, message: request })?;

        let replies = c.sent_by(3);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].to, 1);
        assert_eq!(replies[0].message, Message::RequestVoteReply { granted: true });
        assert_eq!(replies[1].to, 2);
        assert_eq!(replies[1].message, Message::RequestVoteReply { granted: false });
        Ok(())
    }

    #[test]
    fn vote_rejected_for_stale_log() -> Result<()> {
        let mut c = Cluster::new(3)?;
        c.elect(1)?;

        // Replicate a command while node 3 is cut off.
        c.disconnected.insert(3);
        c.propose(1, b"x")?;
        c.deliver()?;
        c.disconnected.remove(&3);

        // Node 3 campaigns with its stale log and gets no votes. The others
        // adopt the new term, so the old leader is deposed.
        c.campaign(3)?;
        c.deliver()?;
        assert!(matches!(c.nodes[&3], Node::Candidate(_)));
        assert_eq!(c.leader_id(), None);

        // A node holding the committed entry wins the next election, and the
        // entry survives (leader completeness).
        c.tick_many(&[1], 10)?;
        c.deliver()?;
        assert_eq!(c.leader_id(), Some(1));
        let expect = vec![
            Entry { index: 1, term: 1, command: None },
            Entry { index: 2, term: 1, command: Some(b"x".to_vec()) },
            Entry { index: 3, term: 3, command: None },
        ];
        assert_eq!(c.log_entries(1), expect);
        Ok(())
    }

    #[test]
    fn replication_commits_on_quorum() -> Result<()> {
        let mut c = Cluster::new(5)?;
        c.elect(1)?;
        c.applied(1); // drain the noop

        let index = c.propose(1, b"write")?;
        assert_eq!(index, 2);
        c.deliver()?;

        let expect = Entry { index: 2, term: 1, command: Some(b"write".to_vec()) };
        assert_eq!(c.applied(1), vec![expect.clone()]);

        // Followers apply after the commit index propagates.
        c.tick_many(&[1], 2)?;
        c.deliver()?;
        for id in [2, 3, 4, 5] {
            let applied = c.applied(id);
            assert_eq!(applied.last(), Some(&expect));
        }
        Ok(())
    }

    /// Re-delivering an already-applied AppendEntries is a no-op that still
    /// reports success with an unchanged log.
    #[test]
    fn append_entries_idempotent() -> Result<()> {
        let mut c = Cluster::new(3)?;
        c.elect(1)?;

        c.propose(1, b"x")?;
        let append = c
            .sent_by(1)
            .into_iter()
            .find(|e| e.to == 2 && matches!(e.message, Message::AppendEntries { .. }))
            .expect("no append to 2");
        c.drop_pending();

        c.step(append.clone())?;
        let reply1 = c.sent_by(2).pop().expect("no reply");
        let log1 = c.log_entries(2);

        c.step(append)?;
        let reply2 = c.sent_by(2).pop().expect("no reply");
        let log2 = c.log_entries(2);

        assert_eq!(reply1.message, reply2.message);
        assert!(matches!(
            reply1.message,
            Message::AppendEntriesReply { success: true, match_index: 2, .. }
        ));
        assert_eq!(log1, log2);
        Ok(())
    }

    #[test]
    fn higher_term_deposes_leader() -> Result<()> {
        let mut c = Cluster::new(3)?;
        c.elect(1)?;
        c.drop_pending();

        c.step(Envelope {
            from: 2,
            to: 1,
            term: 5,
            message: Message::RequestVote { last_index: 1, last_term: 1 },
        })?;

        assert!(matches!(c.nodes[&1], Node::Follower(_)));
        assert_eq!(c.term_of(1), 5);
        let replies = c.sent_by(1);
        assert_eq!(replies.last().map(|e| &e.message), Some(&Message::RequestVoteReply { granted: true }));
        Ok(())
    }

    /// The two peers with the smallest RTT estimates become Primary and
    /// Secondary, and a ranking change reassigns and revokes.
    #[test]
    fn subleaders_follow_rtt_ranking() -> Result<()> {
        let mut c = Cluster::new(5)?;

        // Peer RTTs of 10ms * id: peers 2 and 3 are closest.
        let slow_by_id = with_rtt(10_000, |id| id as u64);
        c.campaign(1)?;
        c.deliver_map(&slow_by_id)?;
        assert_eq!(c.leader_id(), Some(1));

        // The next heartbeat round ranks the samples and assigns.
        c.tick_many(&[1], 2)?;
        c.deliver_map(&slow_by_id)?;
        assert_eq!(c.rank_of(2), Some(Rank::Primary));
        assert_eq!(c.rank_of(3), Some(Rank::Secondary));
        assert_eq!(c.rank_of(4), None);
        assert_eq!(c.rank_of(5), None);

        // Invert the RTT order with large deltas (100ms * (10 - id)): peers 5
        // and 4 are now closest, and take over after a sample + rank round.
        let slow_by_inverse = with_rtt(100_000, |id| 10 - id as u64);
        c.tick_many(&[1], 2)?;
        c.deliver_map(&slow_by_inverse)?;
        c.tick_many(&[1], 2)?;
        c.deliver_map(&slow_by_inverse)?;

        assert_eq!(c.rank_of(5), Some(Rank::Primary));
        assert_eq!(c.rank_of(4), Some(Rank::Secondary));
        assert_eq!(c.rank_of(2), None);
        assert_eq!(c.rank_of(3), None);
        Ok(())
    }

    /// Sub-leader assignments are only accepted from the current leader.
    #[test]
    fn assignment_requires_current_leader() -> Result<()> {
        let mut c = Cluster::new(3)?;
        c.elect(1)?;

        c.step(Envelope {
            from: 3,
            to: 2,
            term: 1,
            message: Message::SubLeaderAssign { rank: Rank::Primary },
        })?;
        assert_eq!(c.rank_of(2), None);

        c.step(Envelope {
            from: 1,
            to: 2,
            term: 1,
            message: Message::SubLeaderAssign { rank: Rank::Primary },
        })?;
        assert_eq!(c.rank_of(2), Some(Rank::Primary));
        Ok(())
    }

    /// With the sub-leader extension disabled, the leader never assigns and
    /// followers don't accept ranks.
    #[test]
    fn original_mode_has_no_subleaders() -> Result<()> {
        let mut c = Cluster::new_with(5, |_| Options {
            enable_subleader: false,
            ..test_opts()
        })?;

        let assigns = RefCell::new(0);
        let count_assigns = |envelope: Envelope| {
            if matches!(envelope.message, Message::SubLeaderAssign { .. }) {
                *assigns.borrow_mut() += 1;
            }
            Some(envelope)
        };

        c.campaign(1)?;
        c.deliver_map(&count_assigns)?;
        for _ in 0..5 {
            c.tick_many(&[1], 2)?;
            c.deliver_map(&count_assigns)?;
        }
        assert_eq!(*assigns.borrow(), 0);

        // A crafted assignment is ignored locally too.
        c.step(Envelope {
            from: 1,
            to: 2,
            term: 1,
            message: Message::SubLeaderAssign { rank: Rank::Primary },
        })?;
        assert_eq!(c.rank_of(2), None);
        Ok(())
    }

    /// When the leader dies, the Primary is promoted without a vote round.
    #[test]
    fn primary_promotes_on_leader_loss() -> Result<()> {
        let mut c = Cluster::new(5)?;
        let rtt = with_rtt(10_000, |id| id as u64);
        c.campaign(1)?;
        c.deliver_map(&rtt)?;
        c.tick_many(&[1], 2)?;
        c.deliver_map(&rtt)?;
        assert_eq!(c.rank_of(2), Some(Rank::Primary));
        assert_eq!(c.rank_of(3), Some(Rank::Secondary));

        // Kill the leader. The Primary's 30ms timeout fires first, while
        // everyone else is still waiting.
        c.disconnected.insert(1);
        c.drop_pending();
        c.tick_many(&[2, 3, 4, 5], 3)?;
        assert!(matches!(c.nodes[&2], Node::Promoter(_)));
        c.deliver()?;

        assert_eq!(c.leader_id(), Some(2));
        assert_eq!(c.term_of(2), 2);
        for id in [3, 4, 5] {
            assert_eq!(c.leader_of(id), Some(2));
            assert_eq!(c.rank_of(id), None); // assignments died with the term
        }
        Ok(())
    }

    /// A leadership claim is refused while the leader is still heartbeating.
    #[test]
    fn claim_rejected_while_leader_alive() -> Result<()> {
        let mut c = Cluster::new(5)?;
        c.elect(1)?;
        c.drop_pending();

        c.step(Envelope {
            from: 2,
            to: 4,
            term: 2,
            message: Message::PromoteLeader { rank: Rank::Primary, last_index: 1, last_term: 1 },
        })?;

        let replies = c.sent_by(4);
        assert_eq!(replies.last().map(|e| &e.message), Some(&Message::PromoteAck { accept: false }));
        // The claimed term was not adopted.
        assert_eq!(c.term_of(4), 1);
        assert_eq!(c.leader_of(4), Some(1));
        Ok(())
    }

    /// If the Primary's promotion goes nowhere, the Secondary's longer
    /// timeout fires next and it promotes itself.
    #[test]
    fn secondary_promotes_when_primary_fails() -> Result<()> {
        let mut c = Cluster::new(5)?;
        let rtt = with_rtt(10_000, |id| id as u64);
        c.campaign(1)?;
        c.deliver_map(&rtt)?;
        c.tick_many(&[1], 2)?;
        c.deliver_map(&rtt)?;
        assert_eq!(c.rank_of(2), Some(Rank::Primary));
        assert_eq!(c.rank_of(3), Some(Rank::Secondary));

        // Kill the leader. The Primary starts promoting, then dies too: its
        // claim reaches nobody.
        c.disconnected.insert(1);
        c.drop_pending();
        c.tick_many(&[2, 3, 4, 5], 3)?;
        assert!(matches!(c.nodes[&2], Node::Promoter(_)));
        c.disconnected.insert(2);
        c.drop_pending();

        // The Secondary's timeout fires two rounds later and it claims the
        // term itself, reaching a majority with nodes 4 and 5.
        c.tick_many(&[3, 4, 5], 2)?;
        c.deliver()?;
        assert_eq!(c.leader_id(), Some(3));
        assert_eq!(c.term_of(3), 2);
        Ok(())
    }

    /// A failed promotion falls back to a plain follower, and the classical
    /// election path takes over.
    #[test]
    fn failed_promotion_falls_back_to_election() -> Result<()> {
        let mut c = Cluster::new(5)?;
        let rtt = with_rtt(10_000, |id| id as u64);
        c.campaign(1)?;
        c.deliver_map(&rtt)?;
        c.tick_many(&[1], 2)?;
        c.deliver_map(&rtt)?;
        assert_eq!(c.rank_of(2), Some(Rank::Primary));

        // The leader dies, the Primary promotes into the void (all its
        // messages are dropped), and its promotion deadline passes.
        c.disconnected.insert(1);
        c.drop_pending();
        c.tick_many(&[2], 3)?;
        assert!(matches!(c.nodes[&2], Node::Promoter(_)));
        c.drop_pending();
        c.tick_many(&[2], 3)?;
        assert!(matches!(c.nodes[&2], Node::Follower(_)));
        assert_eq!(c.term_of(2), 2); // kept the claimed term and its self-vote
        c.drop_pending();

        // Its next timeout starts a classical election in term 3, which the
        // other nodes grant.
        c.tick_many(&[2], 10)?;
        assert!(matches!(c.nodes[&2], Node::Candidate(_)));
        c.deliver()?;
        assert_eq!(c.leader_id(), Some(2));
        assert_eq!(c.term_of(2), 3);
        Ok(())
    }

    /// A peer that hasn't voted and has no leader accepts a same-term claim.
    #[test]
    fn same_term_claim_accepted_when_unvoted() -> Result<()> {
        let mut c = Cluster::new(5)?;
        c.elect(1)?;
        c.drop_pending();

        // Push node 4 into term 2 leaderless without casting a vote, via a
        // vote request from a candidate with a stale log.
        c.step(Envelope {
            from: 5,
            to: 4,
            term: 2,
            message: Message::RequestVote { last_index: 0, last_term: 0 },
        })?;
        assert_eq!(c.term_of(4), 2);
        c.drop_pending();

        c.step(Envelope {
            from: 2,
            to: 4,
            term: 2,
            message: Message::PromoteLeader { rank: Rank::Primary, last_index: 1, last_term: 1 },
        })?;
        let replies = c.sent_by(4);
        assert_eq!(replies.last().map(|e| &e.message), Some(&Message::PromoteAck { accept: true }));
        assert_eq!(c.leader_of(4), Some(2));

        // And refuses a second claim for the same term: the vote is spent.
        c.step(Envelope {
            from: 3,
            to: 4,
            term: 2,
            message: Message::PromoteLeader { rank: Rank::Secondary, last_index: 1, last_term: 1 },
        })?;
        let replies = c.sent_by(4);
        assert_eq!(replies.last().map(|e| &e.message), Some(&Message::PromoteAck { accept: false }));
        Ok(())
    }

    /// A leader cut off from all peers steps down once its lease runs out,
    /// without giving up its term or vote.
    #[test]
    fn leader_lease_expires_without_quorum() -> Result<()> {
        let mut c = Cluster::new(3)?;
        c.elect(1)?;

        c.disconnected.insert(2);
        c.disconnected.insert(3);
        c.drop_pending();

        // One tick of slack: the first tick after the cut still sees the
        // acknowledgements from the election round.
        let lease = super::super::LEASE_INTERVALS * test_opts().heartbeat_interval as u16;
        c.tick_many(&[1], lease + 2)?;

        assert!(matches!(c.nodes[&1], Node::Follower(_)));
        assert_eq!(c.term_of(1), 1);
        let node = c.nodes.get_mut(&1).expect("unknown node");
        assert_eq!(node.log_mut().get_term(), (1, Some(1)));
        Ok(())
    }

    /// Nodes rejoining after a partition truncate their speculative suffix
    /// and converge on the majority's log.
    #[test]
    fn partition_heals_and_truncates() -> Result<()> {
        let mut c = Cluster::new(5)?;
        c.elect(1)?;

        // Cut the leader and node 2 off. The leader appends a command that
        // can't reach a quorum.
        c.disconnected.extend([1, 2]);
        c.propose(1, b"lost")?;
        c.drop_pending();

        // The majority elects a new leader and commits new entries.
        c.campaign(3)?;
        c.deliver()?;
        assert_eq!(c.leader_id(), Some(3));
        c.propose(3, b"won")?;
        c.deliver()?;

        // Heal the partition; the next heartbeats catch everyone up and
        // replace the old leader's uncommitted suffix.
        c.disconnected.clear();
        c.drop_pending();
        c.tick_many(&[3], 2)?;
        c.deliver()?;
        c.tick_many(&[3], 2)?;
        c.deliver()?;

        assert!(matches!(c.nodes[&1], Node::Follower(_)));
        assert_eq!(c.term_of(1), 2);
        let expect = vec![
            Entry { index: 1, term: 1, command: None },
            Entry { index: 2, term: 2, command: None },
            Entry { index: 3, term: 2, command: Some(b"won".to_vec()) },
        ];
        for id in [1, 2, 3, 4, 5] {
            assert_eq!(c.log_entries(id), expect, "node {id} has diverging log");
        }
        Ok(())
    }

    /// The timeout ladder orders reactions: with the default options, any
    /// Primary timeout fires before any possible Secondary timeout, which
    /// fires before any possible follower or candidate timeout.
    #[test]
    fn timeout_ladder_is_ordered() {
        let opts = Options::default();
        assert!(opts.primary_timeout_range.end <= opts.secondary_timeout_range.start);
        assert!(opts.secondary_timeout_range.start < opts.election_timeout_range.start);
        opts.validate().expect("default ladder invalid");
    }
}
