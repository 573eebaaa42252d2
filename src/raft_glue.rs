//! The Raft collaborator boundary: everything this crate needs from "a Raft subsystem
//! exposing commit, apply, snapshot, compact, and publish-to-session primitives" is expressed
//! as the [`RaftLog`] trait. Raft consensus itself — elections, replication, network transport —
//! remains an external collaborator; [`InProcessRaftLog`] only wires the single-process `raft`
//! crate behind that trait for embedding an engine directly against an in-memory log, the same
//! way the `raft` crate's own test fixtures drive a `Node` by hand.

use std::io::{self, Read, Write};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, info};
use protocol::{ClientId, EventIndex, ResourceId, Sequence, SessionId, TypeId};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use raft::log::memory::InMemoryLog;
use raft::log::Log as RaftLogStorage;
use raft::message::LogIndex;
use raft::node::{Config as RaftConfig, Node};
use thiserror::Error;

/// A session-relevant Raft log entry (§3 "Log Entry"), the only kinds this layer submits.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEntry {
    Register {
        client_id: ClientId,
        timeout: Duration,
    },
    KeepAlive {
        session_id: SessionId,
        command_sequence_ack: Sequence,
        event_index_ack: EventIndex,
    },
    Command {
        session_id: SessionId,
        sequence: Sequence,
        resource_id: ResourceId,
        type_id: TypeId,
        payload: Vec<u8>,
    },
    Unregister {
        session_id: SessionId,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RaftGlueError {
    #[error("this replica is not the Raft leader")]
    NotLeader,
    #[error("malformed log entry payload")]
    MalformedEntry,
    #[error("Raft log storage error")]
    LogError,
}

/// A committed entry paired with the commit index the Raft layer assigned it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedEntry {
    pub index: LogIndex,
    pub entry: SessionEntry,
}

/// The interface the session layer consumes from whatever Raft subsystem backs it.
pub trait RaftLog {
    /// Proposes a new session-relevant entry. Only the leader can propose; followers return
    /// `NotLeader` so the caller can redirect the client.
    fn propose(&mut self, entry: SessionEntry) -> Result<(), RaftGlueError>;

    /// Ticks the underlying consensus algorithm and drains newly committed entries in
    /// commit order. Intended to be called from a dedicated driving loop (§5 suspension point
    /// (ii)); returns an empty vec if nothing has committed since the last call.
    fn drive(&mut self) -> Vec<CommittedEntry>;

    /// Blocks until this replica can confirm it is still the leader at or after `index`,
    /// returning the confirmed commit index to read at (§5 suspension point (iii),
    /// `LINEARIZABLE` consistency). Returns `NotLeader` if leadership cannot be confirmed.
    fn read_index(&mut self) -> Result<LogIndex, RaftGlueError>;

    fn is_leader(&self) -> bool;

    fn last_committed_index(&self) -> LogIndex;

    /// Advisory: reports the lowest log index still referenced by any session's result cache or
    /// any state machine's retained state. The `raft` crate's log already discards
    /// `take_next`-returned entries unconditionally (see `raft::log::Log::take_next`), so this
    /// does not gate head-truncation here — it exists for observability and for a future Raft
    /// backend that does condition compaction on it.
    fn register_compaction_watermark(&mut self, index: LogIndex);

    fn snapshot_now(&self, writer: &mut dyn Write) -> io::Result<()>;
    fn restore(&mut self, reader: &mut dyn Read) -> io::Result<()>;
}

/// A single-node, in-process `RaftLog` built on the `raft` crate. Suitable for embedding an
/// engine directly (no network peers) or for driving a hand-simulated multi-node group in tests,
/// exactly as the `raft` crate's own examples do; a networked, persistent-storage implementation
/// is out of scope.
pub struct InProcessRaftLog {
    node: Node<InMemoryLog, ChaCha8Rng, u64>,
    compaction_watermark: LogIndex,
}

impl InProcessRaftLog {
    pub fn new(node_id: u64, seed: u64) -> Self {
        let config = RaftConfig {
            election_timeout_ticks: 10,
            heartbeat_interval_ticks: 3,
            replication_chunk_size: 64 * 1024,
        };
        let node = Node::new(
            node_id,
            Default::default(),
            InMemoryLog::new_unbounded(),
            ChaCha8Rng::seed_from_u64(seed),
            config,
        );
        let mut log = InProcessRaftLog {
            node,
            compaction_watermark: LogIndex::default(),
        };
        log.elect_self();
        log
    }

    /// Drives timer ticks until this (peer-less) node becomes leader. With no peers, the node's
    /// own `become_leader` check (`votes_granted >= quorum_size(0)`) is satisfied by the node's
    /// self-vote alone, so this always converges within `election_timeout_ticks * 2` ticks.
    fn elect_self(&mut self) {
        let max_ticks = self.node.config().election_timeout_ticks as u64 * 2 + 1;
        for _ in 0..max_ticks {
            if self.node.is_leader() {
                info!("in-process Raft node {} elected itself leader", self.node.node_id());
                return;
            }
            let _ = self.node.timer_tick().count();
        }
        debug!("in-process Raft node did not self-elect within the expected tick budget");
    }
}

impl RaftLog for InProcessRaftLog {
    fn propose(&mut self, entry: SessionEntry) -> Result<(), RaftGlueError> {
        if !self.node.is_leader() {
            return Err(RaftGlueError::NotLeader);
        }
        let data: Bytes = encode_entry(&entry);
        self.node
            .append(data)
            .map(|_| ())
            .map_err(|_| RaftGlueError::NotLeader)
    }

    fn drive(&mut self) -> Vec<CommittedEntry> {
        let _ = self.node.timer_tick().count();
        let start = self.node.log().last_taken_index();
        let committed: Vec<_> = self.node.take_committed().collect();
        committed
            .into_iter()
            .enumerate()
            .filter_map(|(offset, log_entry)| {
                let index = start + (offset as u64 + 1);
                match decode_entry(&log_entry.data) {
                    Ok(entry) => Some(CommittedEntry { index, entry }),
                    Err(_) => {
                        debug!("dropping unparseable committed log entry at offset {}", offset);
                        None
                    }
                }
            })
            .collect()
    }

    fn read_index(&mut self) -> Result<LogIndex, RaftGlueError> {
        if self.node.is_leader() {
            Ok(self.node.last_committed_log_index())
        } else {
            Err(RaftGlueError::NotLeader)
        }
    }

    fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    fn last_committed_index(&self) -> LogIndex {
        self.node.last_committed_log_index()
    }

    fn register_compaction_watermark(&mut self, index: LogIndex) {
        self.compaction_watermark = index;
    }

    fn snapshot_now(&self, writer: &mut dyn Write) -> io::Result<()> {
        writer.write_all(&self.node.last_committed_log_index().id.to_le_bytes())
    }

    fn restore(&mut self, reader: &mut dyn Read) -> io::Result<()> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        self.compaction_watermark = LogIndex {
            id: u64::from_le_bytes(buf),
        };
        Ok(())
    }
}

const TAG_REGISTER: u8 = 1;
const TAG_KEEP_ALIVE: u8 = 2;
const TAG_COMMAND: u8 = 3;
const TAG_UNREGISTER: u8 = 4;

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_bytes(buf: &mut Bytes) -> Result<Vec<u8>, RaftGlueError> {
    if buf.remaining() < 4 {
        return Err(RaftGlueError::MalformedEntry);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(RaftGlueError::MalformedEntry);
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

fn encode_entry(entry: &SessionEntry) -> Bytes {
    let mut buf = BytesMut::new();
    match entry {
        SessionEntry::Register { client_id, timeout } => {
            buf.put_u8(TAG_REGISTER);
            buf.put_u64(client_id.get());
            buf.put_u64(timeout.as_millis() as u64);
        }
        SessionEntry::KeepAlive {
            session_id,
            command_sequence_ack,
            event_index_ack,
        } => {
            buf.put_u8(TAG_KEEP_ALIVE);
            buf.put_u64(session_id.get());
            buf.put_u64(command_sequence_ack.get());
            buf.put_u64(event_index_ack.get());
        }
        SessionEntry::Command {
            session_id,
            sequence,
            resource_id,
            type_id,
            payload,
        } => {
            buf.put_u8(TAG_COMMAND);
            buf.put_u64(session_id.get());
            buf.put_u64(sequence.get());
            buf.put_u64(resource_id.get());
            buf.put_u32(type_id.get());
            put_bytes(&mut buf, payload);
        }
        SessionEntry::Unregister { session_id } => {
            buf.put_u8(TAG_UNREGISTER);
            buf.put_u64(session_id.get());
        }
    }
    buf.freeze()
}

fn decode_entry(data: &[u8]) -> Result<SessionEntry, RaftGlueError> {
    let mut buf = Bytes::copy_from_slice(data);
    if !buf.has_remaining() {
        return Err(RaftGlueError::MalformedEntry);
    }
    let tag = buf.get_u8();
    match tag {
        TAG_REGISTER => {
            if buf.remaining() < 16 {
                return Err(RaftGlueError::MalformedEntry);
            }
            let client_id = ClientId::from(buf.get_u64());
            let timeout = Duration::from_millis(buf.get_u64());
            Ok(SessionEntry::Register { client_id, timeout })
        }
        TAG_KEEP_ALIVE => {
            if buf.remaining() < 24 {
                return Err(RaftGlueError::MalformedEntry);
            }
            let session_id = SessionId::from(buf.get_u64());
            let command_sequence_ack = Sequence::from(buf.get_u64());
            let event_index_ack = EventIndex::from(buf.get_u64());
            Ok(SessionEntry::KeepAlive {
                session_id,
                command_sequence_ack,
                event_index_ack,
            })
        }
        TAG_COMMAND => {
            if buf.remaining() < 28 {
                return Err(RaftGlueError::MalformedEntry);
            }
            let session_id = SessionId::from(buf.get_u64());
            let sequence = Sequence::from(buf.get_u64());
            let resource_id = ResourceId::from(buf.get_u64());
            let type_id = TypeId::from(buf.get_u32());
            let payload = get_bytes(&mut buf)?;
            Ok(SessionEntry::Command {
                session_id,
                sequence,
                resource_id,
                type_id,
                payload,
            })
        }
        TAG_UNREGISTER => {
            if buf.remaining() < 8 {
                return Err(RaftGlueError::MalformedEntry);
            }
            let session_id = SessionId::from(buf.get_u64());
            Ok(SessionEntry::Unregister { session_id })
        }
        _ => Err(RaftGlueError::MalformedEntry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_log_self_elects_and_commits_immediately() {
        let mut log = InProcessRaftLog::new(0, 42);
        assert!(log.is_leader());

        log.propose(SessionEntry::Register {
            client_id: ClientId(7),
            timeout: Duration::from_secs(30),
        })
        .unwrap();

        let committed = log.drive();
        assert_eq!(committed.len(), 1);
        match &committed[0].entry {
            SessionEntry::Register { client_id, .. } => assert_eq!(*client_id, ClientId(7)),
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn every_entry_kind_round_trips_through_the_log_encoding() {
        let entries = vec![
            SessionEntry::Register {
                client_id: ClientId(1),
                timeout: Duration::from_secs(10),
            },
            SessionEntry::KeepAlive {
                session_id: SessionId(2),
                command_sequence_ack: Sequence(5),
                event_index_ack: EventIndex(9),
            },
            SessionEntry::Command {
                session_id: SessionId(2),
                sequence: Sequence(6),
                resource_id: ResourceId(3),
                type_id: TypeId(1),
                payload: b"inc".to_vec(),
            },
            SessionEntry::Unregister {
                session_id: SessionId(2),
            },
        ];

        for entry in entries {
            let encoded = encode_entry(&entry);
            let decoded = decode_entry(&encoded).unwrap();
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn read_index_fails_when_not_leader() {
        // A node with a peer it can never hear from never wins an election.
        let config = RaftConfig {
            election_timeout_ticks: 3,
            heartbeat_interval_ticks: 3,
            replication_chunk_size: 1024,
        };
        let mut peers = std::collections::BTreeSet::new();
        peers.insert(1u64);
        let node = Node::new(
            0u64,
            peers,
            InMemoryLog::new_unbounded(),
            ChaCha8Rng::seed_from_u64(1),
            config,
        );
        let mut log = InProcessRaftLog {
            node,
            compaction_watermark: LogIndex::default(),
        };
        assert_eq!(log.read_index(), Err(RaftGlueError::NotLeader));
    }
}
