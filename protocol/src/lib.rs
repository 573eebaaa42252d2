//! The client/server request-response envelope, independent of wire encoding.
//!
//! Two wire encodings exist in the wider system this crate is extracted from (WebSocket JSON
//! and a compact binary form); both are out of scope here. What's specified is the logical
//! envelope every encoding must round-trip: a correlation id, a type tag, and type-specific
//! fields. [`codec`] provides one concrete binary encoding so the envelope has a testable,
//! round-trippable representation.

pub mod codec;
mod ids;

pub use ids::{ClientId, CorrelationId, EventIndex, ResourceId, Sequence, SessionId, TypeId};

use std::time::Duration;

/// The consistency level a [`QueryRequest`] is evaluated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Executed at the state observed after all commands with `seq <= sequence - 1` from the
    /// issuing session; may reflect later commands from other sessions.
    Causal,
    /// Executed at a state at least as recent as the latest command seen by the issuing session
    /// across all sessions, not necessarily at the leader's latest commit.
    Sequential,
    /// Executed at the leader after a round-trip confirming leadership; reflects all commits
    /// whose index is at most the read index captured at dispatch.
    Linearizable,
    /// Linearizable using a cached leader lease; may be served from a follower while the lease
    /// is valid.
    BoundedLinearizable,
}

/// A request sent from client to server, or a `Publish` sent from server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Opens a transport-level handshake. `client_id` is `0` for a brand new client.
    Connect { client_id: ClientId },
    /// Registers a new session for `client_id`.
    Register { client_id: ClientId, timeout: Duration },
    /// Renews a session's liveness and acknowledges progress.
    KeepAlive {
        session_id: SessionId,
        command_sequence_ack: Sequence,
        event_index_ack: EventIndex,
    },
    /// Gracefully closes a session.
    Unregister { session_id: SessionId },
    /// A linearizable mutation against one resource.
    Command {
        session_id: SessionId,
        sequence: Sequence,
        resource_id: ResourceId,
        bytes: Vec<u8>,
    },
    /// A read against one resource at a chosen consistency level.
    Query {
        session_id: SessionId,
        sequence: Sequence,
        resource_id: ResourceId,
        bytes: Vec<u8>,
        consistency: Consistency,
    },
    /// Server-to-client delivery of events published to a session.
    Publish {
        session_id: SessionId,
        event_index: EventIndex,
        previous_index: EventIndex,
        events: Vec<Vec<u8>>,
    },
}

/// The outcome of a request: either `Ok` or a tagged error.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Ok,
    Error(ErrorKind),
}

/// The server-side error categories a [`Status::Error`] may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoLeader,
    UnknownSession,
    UnknownResource,
    CommandFailure,
    QueryFailure,
    ApplicationError,
    ProtocolError,
    IllegalMemberState,
}

/// A cluster member hint, returned alongside `NoLeader` and in membership responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub node_id: u64,
    pub address: String,
}

/// A response sent from server to client, or a `PublishResponse` acknowledging a `Publish`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Connect {
        status: Status,
        leader: Option<u64>,
        members: Vec<Member>,
    },
    Register {
        status: Status,
        session_id: SessionId,
        leader: Option<u64>,
        members: Vec<Member>,
        timeout: Duration,
    },
    KeepAlive {
        status: Status,
        leader: Option<u64>,
        members: Vec<Member>,
    },
    Unregister {
        status: Status,
    },
    Command {
        status: Status,
        index: u64,
        event_index: EventIndex,
        result: Vec<u8>,
    },
    Query {
        status: Status,
        index: u64,
        event_index: EventIndex,
        result: Vec<u8>,
    },
    /// Client-to-server acknowledgement of a `Publish`.
    Publish {
        status: Status,
        index: u64,
    },
}

/// A request or response, tagged with a per-connection monotonically increasing correlation id.
///
/// Responses echo the `id` of the request they answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub id: CorrelationId,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(id: CorrelationId, body: T) -> Self {
        Envelope { id, body }
    }
}

pub type Request = Envelope<RequestBody>;
pub type Response = Envelope<ResponseBody>;
