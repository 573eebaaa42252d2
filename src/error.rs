//! Error categories from §7: protocol, session, leadership, application, fatal.
//!
//! Each category maps onto a [`protocol::ErrorKind`] for inclusion in a response envelope.
//! `FatalError` is never sent to a client — see [`Engine::fatal_errors`](crate::Engine::fatal_errors).

use protocol::ErrorKind;

/// A malformed envelope or unrecognized request type. The connection should be terminated.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed request envelope: {0}")]
    Malformed(String),
    #[error("unrecognized request type")]
    UnknownRequestType,
}

impl ProtocolError {
    pub fn to_wire(&self) -> ErrorKind {
        ErrorKind::ProtocolError
    }
}

/// Session-lifecycle errors, surfaced to the client; the affected session is closed.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} does not exist or has expired")]
    UnknownSession(u64),
    #[error("session {0} expired: a command sequence gap exceeded the configured threshold")]
    SequenceGap(u64),
    #[error("session {0} is suspended")]
    Suspended(u64),
}

impl SessionError {
    pub fn to_wire(&self) -> ErrorKind {
        ErrorKind::UnknownSession
    }

    pub fn session_id(&self) -> u64 {
        match self {
            SessionError::UnknownSession(id)
            | SessionError::SequenceGap(id)
            | SessionError::Suspended(id) => *id,
        }
    }
}

/// The request was correctly formed and addressed, but could not be routed because this
/// replica is not (or is no longer confident it is) the Raft leader.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("no confirmed leader; last known leader hint: {leader_hint:?}")]
pub struct LeadershipError {
    pub leader_hint: Option<u64>,
}

impl LeadershipError {
    pub fn to_wire(&self) -> ErrorKind {
        ErrorKind::NoLeader
    }
}

/// The embedded state machine itself returned an error for a command or query; the session is
/// unaffected.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("resource {0} does not exist")]
    UnknownResource(u64),
    #[error("resource type {0} is not registered")]
    UnknownType(u32),
    #[error("state machine error: {0}")]
    StateMachineError(String),
    #[error("query timed out")]
    Timeout,
}

impl ApplicationError {
    pub fn to_wire(&self) -> ErrorKind {
        match self {
            ApplicationError::UnknownResource(_) => ErrorKind::UnknownResource,
            ApplicationError::UnknownType(_) => ErrorKind::ApplicationError,
            ApplicationError::StateMachineError(_) => ErrorKind::ApplicationError,
            ApplicationError::Timeout => ErrorKind::QueryFailure,
        }
    }
}

/// A determinism violation: a state machine panicked, or its result diverged from its peers.
/// Fatal to the replica; it must recover from its last snapshot. Never sent to a client.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("state machine for resource {resource_id} panicked: {message}")]
    StateMachinePanic { resource_id: u64, message: String },
    #[error("result divergence detected for resource {resource_id} at commit {commit_index}")]
    Divergence { resource_id: u64, commit_index: u64 },
}

/// The top-level error returned from engine-facing operations (`apply_command`,
/// `apply_query`, `open`, ...). `Fatal` errors are routed to
/// [`Engine::fatal_errors`](crate::Engine::fatal_errors) rather than surfaced this way in
/// practice, but the variant exists so callers deep in the call stack can propagate one with
/// `?` before the engine intercepts it.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Leadership(#[from] LeadershipError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl EngineError {
    pub fn to_wire(&self) -> ErrorKind {
        match self {
            EngineError::Protocol(e) => e.to_wire(),
            EngineError::Session(e) => e.to_wire(),
            EngineError::Leadership(e) => e.to_wire(),
            EngineError::Application(e) => e.to_wire(),
        }
    }
}
