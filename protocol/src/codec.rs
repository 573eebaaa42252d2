//! A reference binary encoding for [`Request`](crate::Request) and
//! [`Response`](crate::Response) envelopes.
//!
//! This is *not* the production wire format (that remains an out-of-scope collaborator, see
//! the crate's top-level docs) — it exists so the envelope has one concrete, round-trippable
//! representation to test against.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    ClientId, Consistency, CorrelationId, Envelope, ErrorKind, EventIndex, Member, RequestBody,
    ResourceId, ResponseBody, Sequence, SessionId, Status,
};

/// Errors decoding a byte stream into an envelope.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unknown request/response tag {0}")]
    InvalidTag(u8),
    #[error("invalid utf-8 in encoded string")]
    InvalidUtf8,
    #[error("invalid consistency tag {0}")]
    InvalidConsistency(u8),
    #[error("invalid error-kind tag {0}")]
    InvalidErrorKind(u8),
}

fn need(buf: &Bytes, n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        Err(CodecError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn put_bytes_field(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_bytes_field(buf: &mut Bytes) -> Result<Vec<u8>, CodecError> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    let out = buf.copy_to_bytes(len).to_vec();
    Ok(out)
}

fn put_str_field(buf: &mut BytesMut, s: &str) {
    put_bytes_field(buf, s.as_bytes());
}

fn get_str_field(buf: &mut Bytes) -> Result<String, CodecError> {
    let bytes = get_bytes_field(buf)?;
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
}

fn put_duration(buf: &mut BytesMut, d: Duration) {
    buf.put_u64(d.as_millis() as u64);
}

fn get_duration(buf: &mut Bytes) -> Result<Duration, CodecError> {
    need(buf, 8)?;
    Ok(Duration::from_millis(buf.get_u64()))
}

fn put_members(buf: &mut BytesMut, members: &[Member]) {
    buf.put_u32(members.len() as u32);
    for m in members {
        buf.put_u64(m.node_id);
        put_str_field(buf, &m.address);
    }
}

fn get_members(buf: &mut Bytes) -> Result<Vec<Member>, CodecError> {
    need(buf, 4)?;
    let count = buf.get_u32() as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        need(buf, 8)?;
        let node_id = buf.get_u64();
        let address = get_str_field(buf)?;
        out.push(Member { node_id, address });
    }
    Ok(out)
}

fn put_leader(buf: &mut BytesMut, leader: Option<u64>) {
    match leader {
        Some(id) => {
            buf.put_u8(1);
            buf.put_u64(id);
        }
        None => buf.put_u8(0),
    }
}

fn get_leader(buf: &mut Bytes) -> Result<Option<u64>, CodecError> {
    need(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(None),
        _ => {
            need(buf, 8)?;
            Ok(Some(buf.get_u64()))
        }
    }
}

fn put_status(buf: &mut BytesMut, status: &Status) {
    match status {
        Status::Ok => buf.put_u8(0),
        Status::Error(kind) => {
            buf.put_u8(1);
            buf.put_u8(*kind as u8);
        }
    }
}

fn get_status(buf: &mut Bytes) -> Result<Status, CodecError> {
    need(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(Status::Ok),
        1 => {
            need(buf, 1)?;
            let tag = buf.get_u8();
            Ok(Status::Error(decode_error_kind(tag)?))
        }
        other => Err(CodecError::InvalidTag(other)),
    }
}

fn decode_error_kind(tag: u8) -> Result<ErrorKind, CodecError> {
    Ok(match tag {
        0 => ErrorKind::NoLeader,
        1 => ErrorKind::UnknownSession,
        2 => ErrorKind::UnknownResource,
        3 => ErrorKind::CommandFailure,
        4 => ErrorKind::QueryFailure,
        5 => ErrorKind::ApplicationError,
        6 => ErrorKind::ProtocolError,
        7 => ErrorKind::IllegalMemberState,
        other => return Err(CodecError::InvalidErrorKind(other)),
    })
}

fn put_consistency(buf: &mut BytesMut, c: Consistency) {
    buf.put_u8(match c {
        Consistency::Causal => 0,
        Consistency::Sequential => 1,
        Consistency::Linearizable => 2,
        Consistency::BoundedLinearizable => 3,
    });
}

fn get_consistency(buf: &mut Bytes) -> Result<Consistency, CodecError> {
    need(buf, 1)?;
    Ok(match buf.get_u8() {
        0 => Consistency::Causal,
        1 => Consistency::Sequential,
        2 => Consistency::Linearizable,
        3 => Consistency::BoundedLinearizable,
        other => return Err(CodecError::InvalidConsistency(other)),
    })
}

/// Encodes a [`Request`](crate::Request) envelope as a self-describing binary blob.
pub fn encode_request(req: &Envelope<RequestBody>) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u64(req.id.get());
    match &req.body {
        RequestBody::Connect { client_id } => {
            buf.put_u8(1);
            buf.put_u64(client_id.get());
        }
        RequestBody::Register { client_id, timeout } => {
            buf.put_u8(2);
            buf.put_u64(client_id.get());
            put_duration(&mut buf, *timeout);
        }
        RequestBody::KeepAlive {
            session_id,
            command_sequence_ack,
            event_index_ack,
        } => {
            buf.put_u8(3);
            buf.put_u64(session_id.get());
            buf.put_u64(command_sequence_ack.get());
            buf.put_u64(event_index_ack.get());
        }
        RequestBody::Unregister { session_id } => {
            buf.put_u8(4);
            buf.put_u64(session_id.get());
        }
        RequestBody::Command {
            session_id,
            sequence,
            resource_id,
            bytes,
        } => {
            buf.put_u8(5);
            buf.put_u64(session_id.get());
            buf.put_u64(sequence.get());
            buf.put_u64(resource_id.get());
            put_bytes_field(&mut buf, bytes);
        }
        RequestBody::Query {
            session_id,
            sequence,
            resource_id,
            bytes,
            consistency,
        } => {
            buf.put_u8(6);
            buf.put_u64(session_id.get());
            buf.put_u64(sequence.get());
            buf.put_u64(resource_id.get());
            put_bytes_field(&mut buf, bytes);
            put_consistency(&mut buf, *consistency);
        }
        RequestBody::Publish {
            session_id,
            event_index,
            previous_index,
            events,
        } => {
            buf.put_u8(7);
            buf.put_u64(session_id.get());
            buf.put_u64(event_index.get());
            buf.put_u64(previous_index.get());
            buf.put_u32(events.len() as u32);
            for event in events {
                put_bytes_field(&mut buf, event);
            }
        }
    }
    buf
}

/// Decodes a [`Request`](crate::Request) envelope previously produced by [`encode_request`].
pub fn decode_request(mut buf: Bytes) -> Result<Envelope<RequestBody>, CodecError> {
    need(&buf, 9)?;
    let id = CorrelationId(buf.get_u64());
    let tag = buf.get_u8();
    let body = match tag {
        1 => {
            need(&buf, 8)?;
            RequestBody::Connect {
                client_id: ClientId(buf.get_u64()),
            }
        }
        2 => {
            need(&buf, 8)?;
            let client_id = ClientId(buf.get_u64());
            let timeout = get_duration(&mut buf)?;
            RequestBody::Register { client_id, timeout }
        }
        3 => {
            need(&buf, 24)?;
            RequestBody::KeepAlive {
                session_id: SessionId(buf.get_u64()),
                command_sequence_ack: Sequence(buf.get_u64()),
                event_index_ack: EventIndex(buf.get_u64()),
            }
        }
        4 => {
            need(&buf, 8)?;
            RequestBody::Unregister {
                session_id: SessionId(buf.get_u64()),
            }
        }
        5 => {
            need(&buf, 24)?;
            let session_id = SessionId(buf.get_u64());
            let sequence = Sequence(buf.get_u64());
            let resource_id = ResourceId(buf.get_u64());
            let bytes = get_bytes_field(&mut buf)?;
            RequestBody::Command {
                session_id,
                sequence,
                resource_id,
                bytes,
            }
        }
        6 => {
            need(&buf, 24)?;
            let session_id = SessionId(buf.get_u64());
            let sequence = Sequence(buf.get_u64());
            let resource_id = ResourceId(buf.get_u64());
            let bytes = get_bytes_field(&mut buf)?;
            let consistency = get_consistency(&mut buf)?;
            RequestBody::Query {
                session_id,
                sequence,
                resource_id,
                bytes,
                consistency,
            }
        }
        7 => {
            need(&buf, 24)?;
            let session_id = SessionId(buf.get_u64());
            let event_index = EventIndex(buf.get_u64());
            let previous_index = EventIndex(buf.get_u64());
            need(&buf, 4)?;
            let count = buf.get_u32() as usize;
            let mut events = Vec::with_capacity(count);
            for _ in 0..count {
                events.push(get_bytes_field(&mut buf)?);
            }
            RequestBody::Publish {
                session_id,
                event_index,
                previous_index,
                events,
            }
        }
        other => return Err(CodecError::InvalidTag(other)),
    };
    Ok(Envelope { id, body })
}

/// Encodes a [`Response`](crate::Response) envelope as a self-describing binary blob.
pub fn encode_response(resp: &Envelope<ResponseBody>) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u64(resp.id.get());
    match &resp.body {
        ResponseBody::Connect {
            status,
            leader,
            members,
        } => {
            buf.put_u8(1);
            put_status(&mut buf, status);
            put_leader(&mut buf, *leader);
            put_members(&mut buf, members);
        }
        ResponseBody::Register {
            status,
            session_id,
            leader,
            members,
            timeout,
        } => {
            buf.put_u8(2);
            put_status(&mut buf, status);
            buf.put_u64(session_id.get());
            put_leader(&mut buf, *leader);
            put_members(&mut buf, members);
            put_duration(&mut buf, *timeout);
        }
        ResponseBody::KeepAlive {
            status,
            leader,
            members,
        } => {
            buf.put_u8(3);
            put_status(&mut buf, status);
            put_leader(&mut buf, *leader);
            put_members(&mut buf, members);
        }
        ResponseBody::Unregister { status } => {
            buf.put_u8(4);
            put_status(&mut buf, status);
        }
        ResponseBody::Command {
            status,
            index,
            event_index,
            result,
        } => {
            buf.put_u8(5);
            put_status(&mut buf, status);
            buf.put_u64(*index);
            buf.put_u64(event_index.get());
            put_bytes_field(&mut buf, result);
        }
        ResponseBody::Query {
            status,
            index,
            event_index,
            result,
        } => {
            buf.put_u8(6);
            put_status(&mut buf, status);
            buf.put_u64(*index);
            buf.put_u64(event_index.get());
            put_bytes_field(&mut buf, result);
        }
        ResponseBody::Publish { status, index } => {
            buf.put_u8(7);
            put_status(&mut buf, status);
            buf.put_u64(*index);
        }
    }
    buf
}

/// Decodes a [`Response`](crate::Response) envelope previously produced by [`encode_response`].
pub fn decode_response(mut buf: Bytes) -> Result<Envelope<ResponseBody>, CodecError> {
    need(&buf, 9)?;
    let id = CorrelationId(buf.get_u64());
    let tag = buf.get_u8();
    let body = match tag {
        1 => {
            let status = get_status(&mut buf)?;
            let leader = get_leader(&mut buf)?;
            let members = get_members(&mut buf)?;
            ResponseBody::Connect {
                status,
                leader,
                members,
            }
        }
        2 => {
            let status = get_status(&mut buf)?;
            need(&buf, 8)?;
            let session_id = SessionId(buf.get_u64());
            let leader = get_leader(&mut buf)?;
            let members = get_members(&mut buf)?;
            let timeout = get_duration(&mut buf)?;
            ResponseBody::Register {
                status,
                session_id,
                leader,
                members,
                timeout,
            }
        }
        3 => {
            let status = get_status(&mut buf)?;
            let leader = get_leader(&mut buf)?;
            let members = get_members(&mut buf)?;
            ResponseBody::KeepAlive {
                status,
                leader,
                members,
            }
        }
        4 => {
            let status = get_status(&mut buf)?;
            ResponseBody::Unregister { status }
        }
        5 => {
            let status = get_status(&mut buf)?;
            need(&buf, 16)?;
            let index = buf.get_u64();
            let event_index = EventIndex(buf.get_u64());
            let result = get_bytes_field(&mut buf)?;
            ResponseBody::Command {
                status,
                index,
                event_index,
                result,
            }
        }
        6 => {
            let status = get_status(&mut buf)?;
            need(&buf, 16)?;
            let index = buf.get_u64();
            let event_index = EventIndex(buf.get_u64());
            let result = get_bytes_field(&mut buf)?;
            ResponseBody::Query {
                status,
                index,
                event_index,
                result,
            }
        }
        7 => {
            let status = get_status(&mut buf)?;
            need(&buf, 8)?;
            let index = buf.get_u64();
            ResponseBody::Publish { status, index }
        }
        other => return Err(CodecError::InvalidTag(other)),
    };
    Ok(Envelope { id, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn roundtrip_request(body: RequestBody) {
        let req = Envelope::new(CorrelationId(42), body);
        let encoded = encode_request(&req).freeze();
        let decoded = decode_request(encoded).expect("decode");
        assert_eq!(decoded, req);
    }

    fn roundtrip_response(body: ResponseBody) {
        let resp = Envelope::new(CorrelationId(7), body);
        let encoded = encode_response(&resp).freeze();
        let decoded = decode_response(encoded).expect("decode");
        assert_eq!(decoded, resp);
    }

    #[test]
    fn every_request_kind_round_trips() {
        roundtrip_request(RequestBody::Connect {
            client_id: ClientId(0),
        });
        roundtrip_request(RequestBody::Register {
            client_id: ClientId(9),
            timeout: Duration::from_secs(5),
        });
        roundtrip_request(RequestBody::KeepAlive {
            session_id: SessionId(1),
            command_sequence_ack: Sequence(3),
            event_index_ack: EventIndex(7),
        });
        roundtrip_request(RequestBody::Unregister {
            session_id: SessionId(1),
        });
        roundtrip_request(RequestBody::Command {
            session_id: SessionId(1),
            sequence: Sequence(2),
            resource_id: ResourceId(7),
            bytes: b"inc".to_vec(),
        });
        roundtrip_request(RequestBody::Query {
            session_id: SessionId(1),
            sequence: Sequence(2),
            resource_id: ResourceId(7),
            bytes: b"get".to_vec(),
            consistency: Consistency::Linearizable,
        });
        roundtrip_request(RequestBody::Publish {
            session_id: SessionId(1),
            event_index: EventIndex(8),
            previous_index: EventIndex(7),
            events: vec![b"a".to_vec(), b"b".to_vec()],
        });
    }

    #[test]
    fn every_response_kind_round_trips() {
        roundtrip_response(ResponseBody::Connect {
            status: Status::Ok,
            leader: Some(3),
            members: vec![Member {
                node_id: 3,
                address: "10.0.0.1:8000".into(),
            }],
        });
        roundtrip_response(ResponseBody::Register {
            status: Status::Ok,
            session_id: SessionId(55),
            leader: None,
            members: vec![],
            timeout: Duration::from_secs(30),
        });
        roundtrip_response(ResponseBody::KeepAlive {
            status: Status::Error(ErrorKind::UnknownSession),
            leader: Some(1),
            members: vec![],
        });
        roundtrip_response(ResponseBody::Unregister { status: Status::Ok });
        roundtrip_response(ResponseBody::Command {
            status: Status::Ok,
            index: 10,
            event_index: EventIndex(4),
            result: b"3".to_vec(),
        });
        roundtrip_response(ResponseBody::Query {
            status: Status::Ok,
            index: 10,
            event_index: EventIndex(4),
            result: b"42".to_vec(),
        });
        roundtrip_response(ResponseBody::Publish {
            status: Status::Ok,
            index: 10,
        });
    }

    #[test]
    fn truncated_input_is_an_error_not_a_panic() {
        let req = Envelope::new(
            CorrelationId(1),
            RequestBody::Connect {
                client_id: ClientId(1),
            },
        );
        let mut encoded = encode_request(&req).freeze();
        encoded.truncate(encoded.len() - 2);
        assert_eq!(decode_request(encoded), Err(CodecError::UnexpectedEof));
    }
}
