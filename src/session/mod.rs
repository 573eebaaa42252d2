//! The Session Manager (§4.3): owns the table of live sessions, enforces exactly-once
//! in-order command application, and publishes events to their originating session.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{info, warn};
use protocol::{ClientId, Consistency, EventIndex, ResourceId, Sequence, SessionId};
use raft::message::LogIndex;

use crate::config::EngineConfig;
use crate::error::{ApplicationError, SessionError};
use crate::resource::ResourceMultiplexer;

/// A notification fanned out over the shared [`mpb::MPB`] broadcast whenever a session's
/// pending-event buffer gains new entries. Delivery to the actual client connection is the
/// out-of-scope transport layer (§1); this is only the hand-off point.
#[derive(Debug, Clone)]
pub struct PublishNotification {
    pub session_id: SessionId,
    pub event_index: EventIndex,
    pub previous_index: EventIndex,
    pub events: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Suspended,
    Expired,
    Closed,
}

struct QueuedCommand {
    resource_id: ResourceId,
    type_id: protocol::TypeId,
    payload: Vec<u8>,
}

/// A single client session and all per-session bookkeeping from §3/§4.3.
pub struct Session {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub timeout: Duration,
    pub last_keepalive: LogIndex,
    pub command_sequence: Sequence,
    pub event_index: EventIndex,
    pending_events: VecDeque<(EventIndex, Vec<u8>)>,
    pub state: SessionState,
    pub resources: BTreeSet<ResourceId>,
    result_cache: BTreeMap<u64, Result<Vec<u8>, ApplicationError>>,
    gap_queue: BTreeMap<u64, QueuedCommand>,
    gap_age: u64,
}

impl Session {
    fn new(session_id: SessionId, client_id: ClientId, timeout: Duration) -> Self {
        Session {
            session_id,
            client_id,
            timeout,
            last_keepalive: LogIndex::default(),
            command_sequence: Sequence::default(),
            event_index: EventIndex::default(),
            pending_events: VecDeque::new(),
            state: SessionState::Open,
            resources: BTreeSet::new(),
            result_cache: BTreeMap::new(),
            gap_queue: BTreeMap::new(),
            gap_age: 0,
        }
    }

    /// Drops acknowledged events and cached results; called from `keep_alive`.
    fn release_up_to(&mut self, command_seq_ack: Sequence, event_idx_ack: EventIndex) {
        self.result_cache
            .retain(|&seq, _| seq > command_seq_ack.get());
        while let Some((index, _)) = self.pending_events.front() {
            if index.get() <= event_idx_ack.get() {
                self.pending_events.pop_front();
            } else {
                break;
            }
        }
    }

    fn enqueue_event(
        &mut self,
        payload: Vec<u8>,
        event_buffer_bound: usize,
    ) -> PublishNotification {
        let previous_index = self.event_index;
        self.event_index = self.event_index.next();
        self.pending_events.push_back((self.event_index, payload.clone()));
        while self.pending_events.len() > event_buffer_bound {
            self.pending_events.pop_front();
        }
        PublishNotification {
            session_id: self.session_id,
            event_index: self.event_index,
            previous_index,
            events: vec![payload],
        }
    }
}

/// Owns every live [`Session`] and arbitrates command/query/event traffic against them.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Mutex<Session>>>,
    next_session_id: AtomicU64,
    config: EngineConfig,
    multiplexer: Arc<ResourceMultiplexer>,
    events: mpb::MPB<PublishNotification>,
}

impl SessionManager {
    pub fn new(config: EngineConfig, multiplexer: Arc<ResourceMultiplexer>) -> Self {
        SessionManager {
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            config,
            multiplexer,
            events: mpb::MPB::new(),
        }
    }

    /// Subscribes to every [`PublishNotification`] this manager emits, across all sessions; the
    /// out-of-scope transport layer filters by `session_id` to route events to connections.
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<PublishNotification> {
        self.events.receiver()
    }

    /// Apply path for `RegisterEntry`: creates a new session in state `OPEN`.
    pub fn register(&self, client_id: ClientId, timeout: Duration) -> SessionId {
        let session_id = SessionId::from(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let session = Session::new(session_id, client_id, timeout);
        self.sessions
            .write()
            .unwrap()
            .insert(session_id, Mutex::new(session));
        info!("session {} registered for client {}", session_id, client_id);
        session_id
    }

    fn with_session<R>(
        &self,
        session_id: SessionId,
        f: impl FnOnce(&mut Session) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let sessions = self.sessions.read().unwrap();
        let session = sessions
            .get(&session_id)
            .ok_or(SessionError::UnknownSession(session_id.get()))?;
        let mut session = session.lock().unwrap();
        if session.state == SessionState::Expired || session.state == SessionState::Closed {
            return Err(SessionError::UnknownSession(session_id.get()));
        }
        f(&mut session)
    }

    /// Apply path for `KeepAliveEntry`: renews liveness and releases acknowledged state.
    pub fn keep_alive(
        &self,
        session_id: SessionId,
        commit_index: LogIndex,
        command_seq_ack: Sequence,
        event_idx_ack: EventIndex,
    ) -> Result<(), SessionError> {
        self.with_session(session_id, |session| {
            session.last_keepalive = commit_index;
            session.release_up_to(command_seq_ack, event_idx_ack);
            Ok(())
        })
    }

    /// Apply path for `CommandEntry`. Enforces the exactly-once in-order contract: replays a
    /// cached result for an already-applied sequence, queues an out-of-order arrival until its
    /// gap fills, or dispatches in-order arrivals to the [`ResourceMultiplexer`] immediately.
    ///
    /// `on_commit_not_filling_gap` is invoked by the caller once per commit that this session's
    /// gap queue does not resolve, advancing `gap_age`; see [`Self::note_gap_tick`].
    pub fn apply_command(
        &self,
        session_id: SessionId,
        sequence: Sequence,
        resource_id: ResourceId,
        type_id: protocol::TypeId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, CommandError> {
        let expected = self.dispatch_or_queue(session_id, sequence, resource_id, type_id, payload)?;
        match expected {
            DispatchOutcome::Cached(Ok(bytes)) => Ok(bytes),
            DispatchOutcome::Cached(Err(err)) => Err(CommandError::Application(err)),
            DispatchOutcome::Queued => Ok(Vec::new()),
            DispatchOutcome::Apply {
                resource_id,
                type_id,
                payload,
            } => {
                let result = self
                    .multiplexer
                    .dispatch_command(resource_id, type_id, session_id, payload);
                self.finish_command(session_id, sequence, result)
            }
        }
    }

    fn dispatch_or_queue(
        &self,
        session_id: SessionId,
        sequence: Sequence,
        resource_id: ResourceId,
        type_id: protocol::TypeId,
        payload: Vec<u8>,
    ) -> Result<DispatchOutcome, SessionError> {
        self.with_session(session_id, |session| {
            if sequence.get() <= session.command_sequence.get() {
                let cached = session
                    .result_cache
                    .get(&sequence.get())
                    .cloned()
                    .unwrap_or_else(|| Ok(Vec::new()));
                return Ok(DispatchOutcome::Cached(cached));
            }
            if sequence.get() > session.command_sequence.get() + 1 {
                session.gap_queue.insert(
                    sequence.get(),
                    QueuedCommand {
                        resource_id,
                        type_id,
                        payload,
                    },
                );
                return Ok(DispatchOutcome::Queued);
            }
            Ok(DispatchOutcome::Apply {
                resource_id,
                type_id,
                payload,
            })
        })
    }

    /// Commits the outcome of a dispatched command: advances `command_sequence` and caches the
    /// result — success bytes or the application error itself — so a later replay of this
    /// sequence reproduces it byte-for-byte without re-invoking the state machine. The Raft entry
    /// is consumed and the sequence advances either way; re-application is never permitted.
    fn finish_command(
        &self,
        session_id: SessionId,
        sequence: Sequence,
        result: Result<(Vec<u8>, Vec<(SessionId, Vec<u8>)>), ApplicationError>,
    ) -> Result<Vec<u8>, CommandError> {
        let (bytes, published) = match result {
            Ok(value) => value,
            Err(err) => {
                self.with_session(session_id, |session| {
                    session.command_sequence = sequence;
                    session
                        .result_cache
                        .insert(sequence.get(), Err(err.clone()));
                    session.gap_age = 0;
                    Ok(())
                })?;
                return Err(CommandError::Application(err));
            }
        };

        self.with_session(session_id, |session| {
            session.command_sequence = sequence;
            session
                .result_cache
                .insert(sequence.get(), Ok(bytes.clone()));
            session.gap_age = 0;
            Ok(())
        })?;

        for (target, payload) in published {
            self.publish(target, payload);
        }

        self.drain_gap_queue(session_id)?;
        Ok(bytes)
    }

    fn drain_gap_queue(&self, session_id: SessionId) -> Result<(), CommandError> {
        loop {
            let next = self.with_session(session_id, |session| {
                let expected = session.command_sequence.get() + 1;
                Ok(session.gap_queue.remove(&expected))
            })?;
            let queued = match next {
                Some(queued) => queued,
                None => return Ok(()),
            };
            let next_sequence = self
                .with_session(session_id, |session| {
                    Ok(Sequence::from(session.command_sequence.get() + 1))
                })?;
            let result = self.multiplexer.dispatch_command(
                queued.resource_id,
                queued.type_id,
                session_id,
                queued.payload,
            );
            self.finish_command(session_id, next_sequence, result)?;
        }
    }

    /// Evaluates a query against the addressed resource. Ordering against `command_sequence` per
    /// consistency level is the caller's (Raft-glue) responsibility to arrange — e.g. by waiting
    /// for the relevant commit before invoking this — since only the glue layer knows the
    /// current commit/read index (§4.3).
    pub fn apply_query(
        &self,
        session_id: SessionId,
        resource_id: ResourceId,
        type_id: protocol::TypeId,
        payload: Vec<u8>,
        consistency: Consistency,
    ) -> Result<Vec<u8>, SessionError> {
        self.with_session(session_id, |_| Ok(()))?;
        self.multiplexer
            .dispatch_query(resource_id, type_id, session_id, payload, consistency)
            .map_err(|err| {
                warn!("query failed for session {}: {}", session_id, err);
                SessionError::UnknownSession(session_id.get())
            })
    }

    /// Publishes an event to `session_id`'s pending buffer and broadcasts a notification.
    /// Silently dropped if the session is not `OPEN`/`SUSPENDED` — in particular, dropped
    /// whenever it races an `expire()` that has already flipped the session to `EXPIRED`.
    pub fn publish(&self, session_id: SessionId, payload: Vec<u8>) {
        let notification = self.with_session(session_id, |session| {
            Ok(session.enqueue_event(payload, self.config.event_buffer_bound))
        });
        if let Ok(notification) = notification {
            let _ = self.events.sender().send(notification);
        }
    }

    /// Every commit the Raft glue applies that does not fill `session_id`'s gap queue calls
    /// this; exceeding `command_gap_threshold` expires the session with `SequenceGap`.
    pub fn note_gap_tick(&self, session_id: SessionId) -> Result<(), SessionError> {
        let exceeded = self.with_session(session_id, |session| {
            if session.gap_queue.is_empty() {
                return Ok(false);
            }
            session.gap_age += 1;
            Ok(session.gap_age > self.config.command_gap_threshold)
        })?;
        if exceeded {
            self.expire(session_id, SessionError::SequenceGap(session_id.get()))?;
            return Err(SessionError::SequenceGap(session_id.get()));
        }
        Ok(())
    }

    /// Moves a session to `EXPIRED`, releasing its resources. §4.3's "expire flips state before
    /// any in-flight Publish is dispatched" ordering holds because `publish` re-reads the
    /// session's state under the same per-session lock `expire` takes here.
    pub fn expire(&self, session_id: SessionId, _cause: SessionError) -> Result<(), SessionError> {
        let resources = self.with_session(session_id, |session| {
            session.state = SessionState::Expired;
            Ok(std::mem::take(&mut session.resources))
        })?;
        for resource_id in resources {
            self.multiplexer.on_session_expire(resource_id, session_id);
        }
        info!("session {} expired", session_id);
        Ok(())
    }

    /// Graceful close: apply path for `UnregisterEntry`.
    pub fn unregister(&self, session_id: SessionId) -> Result<(), SessionError> {
        let resources = self.with_session(session_id, |session| {
            session.state = SessionState::Closed;
            Ok(std::mem::take(&mut session.resources))
        })?;
        for resource_id in resources {
            self.multiplexer
                .on_session_unregister(resource_id, session_id);
        }
        self.sessions.write().unwrap().remove(&session_id);
        Ok(())
    }

    /// Records that `session_id` now holds `resource_id` open.
    ///
    /// The multiplexer itself delivers `on_register` to the resource's state machine, exactly
    /// once, the first time it sees this session open the resource.
    pub fn note_resource_opened(&self, session_id: SessionId, resource_id: ResourceId) {
        let _ = self.with_session(session_id, |session| {
            session.resources.insert(resource_id);
            Ok(())
        });
    }

    pub fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        let sessions = self.sessions.read().unwrap();
        sessions.get(&session_id).map(|s| s.lock().unwrap().state)
    }

    pub fn command_sequence(&self, session_id: SessionId) -> Option<u64> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .get(&session_id)
            .map(|s| s.lock().unwrap().command_sequence.get())
    }

    /// Ages every session's gap queue except `just_advanced`, per §4.3: a commit that advances
    /// one session's `command_sequence` is, from every *other* session's perspective, a commit
    /// that did not fill its gap.
    pub fn tick_other_gaps(&self, just_advanced: Option<SessionId>) {
        let holders: Vec<SessionId> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .filter(|(&id, _)| Some(id) != just_advanced)
                .filter(|(_, session)| !session.lock().unwrap().gap_queue.is_empty())
                .map(|(&id, _)| id)
                .collect()
        };
        for session_id in holders {
            if let Err(err) = self.note_gap_tick(session_id) {
                warn!("session {} expired while aging its gap queue: {}", session_id, err);
            }
        }
    }
}

enum DispatchOutcome {
    /// A replay of an already-applied sequence: the original outcome, success or application
    /// error, reproduced without re-invoking the state machine.
    Cached(Result<Vec<u8>, ApplicationError>),
    /// An out-of-order arrival buffered in the gap queue; nothing to hand back yet.
    Queued,
    Apply {
        resource_id: ResourceId,
        type_id: protocol::TypeId,
        payload: Vec<u8>,
    },
}

/// Either a session-manager-level error (unknown/expired session, sequence gap bookkeeping) or
/// an application-level error the embedded state machine returned while applying a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl From<CommandError> for crate::error::EngineError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Session(err) => crate::error::EngineError::Session(err),
            CommandError::Application(err) => crate::error::EngineError::Application(err),
        }
    }
}
