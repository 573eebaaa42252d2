//! Session-oriented replication and event layer sitting on top of a Raft log.
//!
//! This crate owns the part of a Raft-replicated coordination service that isn't Raft itself:
//! client session lifecycle, the command/query/event protocol's ordering guarantees, resource
//! multiplexing over one session, and the pooled buffers requests and log entries travel
//! through. Concrete resource state machines, wire framing, and the Raft consensus mechanics
//! themselves are external collaborators — see [`raft_glue::RaftLog`] for the latter's
//! boundary.
//!
//! [`Engine`] is the facade: it owns a [`raft_glue::RaftLog`], a [`session::SessionManager`],
//! and a [`resource::ResourceMultiplexer`], and is the entry point a host process embeds.

pub mod config;
pub mod driver;
pub mod error;
pub mod raft_glue;
pub mod resource;
pub mod session;

pub use buffer::{Buffer, BufferPool, PoolConfig, PoolError};
pub use protocol::{
    ClientId, Consistency, CorrelationId, EventIndex, ResourceId, Sequence, SessionId, TypeId,
};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, warn};

use config::EngineConfig;
use error::{EngineError, FatalError, SessionError};
use raft_glue::{RaftLog, SessionEntry};
use resource::{ResourceMultiplexer, TypeRegistry};
use session::{CommandError, PublishNotification, SessionManager};

/// The outcome of applying one committed [`SessionEntry`], tagged by the kind of entry it came
/// from so [`Engine`]'s public operations can extract their own result out of a drive cycle.
#[derive(Debug, Clone)]
enum ApplyOutcome {
    Registered(SessionId),
    KeptAlive(Result<(), SessionError>),
    Unregistered(Result<(), SessionError>),
    Command(Result<Vec<u8>, CommandError>),
}

/// Ties a [`raft_glue::RaftLog`], [`session::SessionManager`], and
/// [`resource::ResourceMultiplexer`] together into the single object a host process embeds.
///
/// `Engine` drives its `RaftLog` synchronously: each public operation proposes an entry, then
/// drives the log until that entry (and anything committed alongside it) has been applied. This
/// is correct for the single-writer `InProcessRaftLog` this crate ships — every proposal is
/// serialized behind the same lock that drives application, so no concurrent proposer can ever
/// interleave a foreign entry between a caller's propose and its own apply. A networked,
/// multi-writer Raft backend would instead need a background driving loop decoupled from
/// proposal (§5 suspension point (ii)); that wiring is the out-of-scope deployment collaborator.
pub struct Engine {
    config: EngineConfig,
    raft: Mutex<Box<dyn RaftLog + Send>>,
    sessions: Arc<SessionManager>,
    multiplexer: Arc<ResourceMultiplexer>,
    fatal_tx: crossbeam_channel::Sender<FatalError>,
    fatal_rx: crossbeam_channel::Receiver<FatalError>,
}

impl Engine {
    /// Builds an engine over a sealed resource-type registry and a concrete Raft log.
    pub fn new<R>(config: EngineConfig, registry: TypeRegistry, raft: R) -> Self
    where
        R: RaftLog + Send + 'static,
    {
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .thread_name(|i| format!("state-machine-{}", i))
                .build()
                .expect("failed to build the state-machine driver thread pool"),
        );
        let (fatal_tx, fatal_rx) = crossbeam_channel::unbounded();
        let multiplexer = Arc::new(ResourceMultiplexer::new(
            registry.seal(),
            pool,
            fatal_tx.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(config, multiplexer.clone()));

        Engine {
            config,
            raft: Mutex::new(Box::new(raft)),
            sessions,
            multiplexer,
            fatal_tx,
            fatal_rx,
        }
    }

    /// Receives [`error::FatalError`]s surfaced by embedded state machines (panics, divergence).
    /// A supervisor is expected to restart the process from its last snapshot in response;
    /// this crate never calls `std::process::abort` itself (§7).
    pub fn fatal_errors(&self) -> crossbeam_channel::Receiver<FatalError> {
        self.fatal_rx.clone()
    }

    /// Subscribes to every [`PublishNotification`] this engine's sessions emit.
    pub fn subscribe_events(&self) -> crossbeam_channel::Receiver<PublishNotification> {
        self.sessions.subscribe()
    }

    /// Apply path for a new client: proposes a `RegisterEntry` and returns the assigned session.
    pub fn register(&self, client_id: ClientId, timeout: Duration) -> Result<SessionId, EngineError> {
        match self.submit(SessionEntry::Register { client_id, timeout })? {
            ApplyOutcome::Registered(session_id) => Ok(session_id),
            other => unreachable!("Register entry applied to unexpected outcome: {:?}", other),
        }
    }

    /// Apply path for `KeepAliveEntry`.
    pub fn keep_alive(
        &self,
        session_id: SessionId,
        command_sequence_ack: Sequence,
        event_index_ack: EventIndex,
    ) -> Result<(), EngineError> {
        match self.submit(SessionEntry::KeepAlive {
            session_id,
            command_sequence_ack,
            event_index_ack,
        })? {
            ApplyOutcome::KeptAlive(result) => Ok(result?),
            other => unreachable!("KeepAlive entry applied to unexpected outcome: {:?}", other),
        }
    }

    /// Apply path for `UnregisterEntry`.
    pub fn unregister(&self, session_id: SessionId) -> Result<(), EngineError> {
        match self.submit(SessionEntry::Unregister { session_id })? {
            ApplyOutcome::Unregistered(result) => Ok(result?),
            other => unreachable!("Unregister entry applied to unexpected outcome: {:?}", other),
        }
    }

    /// Apply path for `CommandEntry`: a linearizable mutation against one resource. Implicitly
    /// opens the addressed `(resource_id, type_id)` the first time it is seen.
    pub fn command(
        &self,
        session_id: SessionId,
        sequence: Sequence,
        resource_id: ResourceId,
        type_id: TypeId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, EngineError> {
        self.sessions.note_resource_opened(session_id, resource_id);
        match self.submit(SessionEntry::Command {
            session_id,
            sequence,
            resource_id,
            type_id,
            payload,
        })? {
            ApplyOutcome::Command(result) => Ok(result?),
            other => unreachable!("Command entry applied to unexpected outcome: {:?}", other),
        }
    }

    /// Evaluates a query at the given consistency level (§4.3). Queries are not themselves
    /// replicated Raft entries; `LINEARIZABLE` and `BOUNDED_LINEARIZABLE` instead confirm
    /// leadership via [`RaftLog::read_index`] before dispatch.
    pub fn query(
        &self,
        session_id: SessionId,
        resource_id: ResourceId,
        type_id: TypeId,
        payload: Vec<u8>,
        consistency: Consistency,
    ) -> Result<Vec<u8>, EngineError> {
        if matches!(
            consistency,
            Consistency::Linearizable | Consistency::BoundedLinearizable
        ) {
            self.raft
                .lock()
                .unwrap()
                .read_index()
                .map_err(|_| error::LeadershipError { leader_hint: None })?;
        }
        self.sessions.note_resource_opened(session_id, resource_id);
        self.sessions
            .apply_query(session_id, resource_id, type_id, payload, consistency)
            .map_err(EngineError::from)
    }

    /// Runs one maintenance pass: reaps quiescent resource instances. Intended to be called
    /// periodically by the host process (the out-of-scope deployment/CLI collaborator owns the
    /// actual schedule).
    pub fn reap_resources(&self) -> usize {
        self.multiplexer.reap()
    }

    fn submit(&self, entry: SessionEntry) -> Result<ApplyOutcome, EngineError> {
        let mut raft = self.raft.lock().unwrap();
        raft.propose(entry.clone())
            .map_err(|_| error::LeadershipError { leader_hint: None })?;
        let committed = raft.drive();
        drop(raft);

        let mut outcome = None;
        for committed_entry in committed {
            let applied =
                self.apply_committed(committed_entry.index, committed_entry.entry.clone());
            if committed_entry.entry == entry {
                outcome = Some(applied);
            }
        }
        outcome.ok_or_else(|| {
            warn!("proposed entry did not appear in its own drive cycle");
            EngineError::Leadership(error::LeadershipError { leader_hint: None })
        })
    }

    fn apply_committed(&self, commit_index: raft::message::LogIndex, entry: SessionEntry) -> ApplyOutcome {
        match entry {
            SessionEntry::Register { client_id, timeout } => {
                let session_id = self.sessions.register(client_id, timeout);
                self.sessions.tick_other_gaps(None);
                ApplyOutcome::Registered(session_id)
            }
            SessionEntry::KeepAlive {
                session_id,
                command_sequence_ack,
                event_index_ack,
            } => {
                let result = self.sessions.keep_alive(
                    session_id,
                    commit_index,
                    command_sequence_ack,
                    event_index_ack,
                );
                if let Err(ref err) = result {
                    warn!("keep_alive for unknown session {}: {}", session_id, err);
                }
                self.sessions.tick_other_gaps(None);
                ApplyOutcome::KeptAlive(result)
            }
            SessionEntry::Unregister { session_id } => {
                let result = self.sessions.unregister(session_id);
                if let Err(ref err) = result {
                    warn!("unregister for unknown session {}: {}", session_id, err);
                }
                self.sessions.tick_other_gaps(None);
                ApplyOutcome::Unregistered(result)
            }
            SessionEntry::Command {
                session_id,
                sequence,
                resource_id,
                type_id,
                payload,
            } => {
                let before = self.sessions.command_sequence(session_id);
                let result = self
                    .sessions
                    .apply_command(session_id, sequence, resource_id, type_id, payload);
                let after = self.sessions.command_sequence(session_id);
                let advanced = if before != after { Some(session_id) } else { None };
                self.sessions.tick_other_gaps(advanced);
                ApplyOutcome::Command(result)
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Nothing to flush: sessions and resources live only in memory for this embedded engine;
        // persistence is the out-of-scope Raft storage collaborator's responsibility.
    }
}

#[allow(dead_code)]
fn report_fatal(tx: &crossbeam_channel::Sender<FatalError>, err: FatalError) {
    error!("fatal replica error: {}", err);
    let _ = tx.send(err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::CounterMachine;
    use crate::driver::StateMachine;
    use crate::raft_glue::InProcessRaftLog;

    fn engine() -> Engine {
        let mut registry = TypeRegistry::new();
        registry.register(
            TypeId(1),
            Box::new(|| Box::new(CounterMachine::default()) as Box<dyn StateMachine>),
        );
        Engine::new(EngineConfig::default(), registry, InProcessRaftLog::new(0, 7))
    }

    #[test]
    fn register_then_command_round_trips_through_the_log() {
        let engine = engine();
        let session_id = engine.register(ClientId(1), Duration::from_secs(30)).unwrap();

        let result = engine
            .command(session_id, Sequence(1), ResourceId(1), TypeId(1), b"inc".to_vec())
            .unwrap();
        assert_eq!(result, b"1");

        let result = engine
            .query(
                session_id,
                ResourceId(1),
                TypeId(1),
                b"get".to_vec(),
                Consistency::Linearizable,
            )
            .unwrap();
        assert_eq!(result, b"1");
    }

    #[test]
    fn unregister_releases_the_session() {
        let engine = engine();
        let session_id = engine.register(ClientId(1), Duration::from_secs(30)).unwrap();
        engine.command(session_id, Sequence(1), ResourceId(1), TypeId(1), b"inc".to_vec())
            .unwrap();
        engine.unregister(session_id).unwrap();

        let err = engine
            .command(session_id, Sequence(2), ResourceId(1), TypeId(1), b"inc".to_vec())
            .unwrap_err();
        assert!(matches!(err, EngineError::Session(_)));
    }

    #[test]
    fn keep_alive_on_unknown_session_is_rejected() {
        let engine = engine();
        let err = engine
            .keep_alive(SessionId(999), Sequence(0), EventIndex(0))
            .unwrap_err();
        assert!(matches!(err, EngineError::Session(_)));
    }
}
