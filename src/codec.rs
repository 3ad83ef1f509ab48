//! Session protocol messages carried inside frames.
//!
//! Layout of every message:
//! `[type:1][hasSessionId:1][sessionId:16 if present][timestamp:8][payload]`.
//! Integers are little-endian; strings are `[len:4][utf8]`; ids are the 16
//! UUID bytes in RFC 4122 order. The timestamp is unix milliseconds at
//! encode time and is not interpreted by the engine.

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{Result, ZerolinkError};
use crate::peer::PeerId;
use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ServiceRequest = 1,
    ServiceResponse = 2,
    SessionData = 3,
    SessionClose = 4,
    RoutedSessionData = 5,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::ServiceRequest),
            2 => Ok(Self::ServiceResponse),
            3 => Ok(Self::SessionData),
            4 => Ok(Self::SessionClose),
            5 => Ok(Self::RoutedSessionData),
            other => Err(ZerolinkError::UnknownMessageType(other as u32)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ServiceRequest => "ServiceRequest",
            Self::ServiceResponse => "ServiceResponse",
            Self::SessionData => "SessionData",
            Self::SessionClose => "SessionClose",
            Self::RoutedSessionData => "RoutedSessionData",
        }
    }
}

/// Decoded fields common to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageType,
    pub session_id: Option<SessionId>,
    pub timestamp: i64,
}

/// Serialize one message: header fields, then whatever `write_payload` appends.
pub fn serialize<F>(kind: MessageType, session_id: Option<SessionId>, write_payload: F) -> Vec<u8>
where
    F: FnOnce(&mut BytesMut),
{
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(kind as u8);
    match session_id {
        Some(id) => {
            buf.put_u8(1);
            buf.put_slice(id.as_bytes());
        }
        None => buf.put_u8(0),
    }
    buf.put_i64_le(crate::peer::unix_millis() as i64);
    write_payload(&mut buf);
    buf.to_vec()
}

/// Parse the header; the returned buffer is positioned at the type-specific payload.
pub fn deserialize(bytes: impl Into<Bytes>) -> Result<(MessageHeader, Bytes)> {
    let mut buf: Bytes = bytes.into();

    ensure(&buf, 2, "message header")?;
    let kind = MessageType::from_tag(buf.get_u8())?;
    let session_id = match buf.get_u8() {
        0 => None,
        1 => Some(SessionId(get_uuid(&mut buf, "session id")?)),
        other => {
            return Err(ZerolinkError::InvalidMessage(format!(
                "session id flag must be 0 or 1, got {}",
                other
            )))
        }
    };
    ensure(&buf, 8, "timestamp")?;
    let timestamp = buf.get_i64_le();

    Ok((
        MessageHeader {
            kind,
            session_id,
            timestamp,
        },
        buf,
    ))
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub fn get_string(buf: &mut impl Buf, field: &'static str) -> Result<String> {
    let raw = get_bytes(buf, field)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| ZerolinkError::InvalidMessage(format!("{} is not valid utf-8", field)))
}

pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

pub fn get_bytes(buf: &mut impl Buf, field: &'static str) -> Result<Bytes> {
    ensure(&*buf, 4, field)?;
    let len = buf.get_u32_le() as usize;
    ensure(&*buf, len, field)?;
    Ok(buf.copy_to_bytes(len))
}

pub fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

pub fn get_uuid(buf: &mut impl Buf, field: &'static str) -> Result<Uuid> {
    ensure(&*buf, 16, field)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

pub(crate) fn ensure(buf: &impl Buf, needed: usize, field: &'static str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(ZerolinkError::Truncated {
            field,
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

/// Opening message of a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub request_id: Uuid,
    pub source: PeerId,
    pub destination: PeerId,
    pub service: String,
}

/// Payload of a RoutedSessionData message; only the relay unwraps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEnvelope {
    pub route_id: Uuid,
    pub source: PeerId,
    pub destination: PeerId,
    pub service: String,
    pub payload: Bytes,
}

impl RoutingEnvelope {
    fn write(&self, buf: &mut BytesMut) {
        put_uuid(buf, &self.route_id);
        put_uuid(buf, &self.source.0);
        put_uuid(buf, &self.destination.0);
        put_string(buf, &self.service);
        put_bytes(buf, &self.payload);
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            route_id: get_uuid(buf, "route id")?,
            source: PeerId(get_uuid(buf, "source peer")?),
            destination: PeerId(get_uuid(buf, "destination peer")?),
            service: get_string(buf, "service name")?,
            payload: get_bytes(buf, "routed payload")?,
        })
    }
}

/// A fully decoded session protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ServiceRequest(ServiceRequest),
    ServiceResponse {
        session_id: SessionId,
        /// Unix milliseconds after which the server forgets an idle session.
        expires_at: i64,
    },
    SessionData {
        session_id: Option<SessionId>,
        payload: Bytes,
    },
    SessionClose {
        session_id: Option<SessionId>,
    },
    RoutedSessionData {
        session_id: Option<SessionId>,
        envelope: RoutingEnvelope,
    },
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::ServiceRequest(_) => MessageType::ServiceRequest,
            Message::ServiceResponse { .. } => MessageType::ServiceResponse,
            Message::SessionData { .. } => MessageType::SessionData,
            Message::SessionClose { .. } => MessageType::SessionClose,
            Message::RoutedSessionData { .. } => MessageType::RoutedSessionData,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::ServiceRequest(req) => serialize(MessageType::ServiceRequest, None, |buf| {
                put_uuid(buf, &req.request_id);
                put_uuid(buf, &req.source.0);
                put_uuid(buf, &req.destination.0);
                put_string(buf, &req.service);
            }),
            Message::ServiceResponse {
                session_id,
                expires_at,
            } => serialize(MessageType::ServiceResponse, Some(*session_id), |buf| {
                buf.put_i64_le(*expires_at);
            }),
            // Data runs to the end of the frame, no inner length
            Message::SessionData {
                session_id,
                payload,
            } => serialize(MessageType::SessionData, *session_id, |buf| {
                buf.put_slice(payload);
            }),
            Message::SessionClose { session_id } => {
                serialize(MessageType::SessionClose, *session_id, |_| {})
            }
            Message::RoutedSessionData {
                session_id,
                envelope,
            } => serialize(MessageType::RoutedSessionData, *session_id, |buf| {
                envelope.write(buf)
            }),
        }
    }

    pub fn decode(bytes: impl Into<Bytes>) -> Result<Self> {
        let (header, mut body) = deserialize(bytes)?;
        let session_id = header.session_id;

        let message = match header.kind {
            MessageType::ServiceRequest => Message::ServiceRequest(ServiceRequest {
                request_id: get_uuid(&mut body, "request id")?,
                source: PeerId(get_uuid(&mut body, "source peer")?),
                destination: PeerId(get_uuid(&mut body, "destination peer")?),
                service: get_string(&mut body, "service name")?,
            }),
            MessageType::ServiceResponse => {
                let session_id = session_id.ok_or_else(|| {
                    ZerolinkError::InvalidMessage("ServiceResponse without session id".into())
                })?;
                ensure(&body, 8, "expiry")?;
                Message::ServiceResponse {
                    session_id,
                    expires_at: body.get_i64_le(),
                }
            }
            MessageType::SessionData => Message::SessionData {
                session_id,
                payload: body,
            },
            MessageType::SessionClose => Message::SessionClose { session_id },
            MessageType::RoutedSessionData => Message::RoutedSessionData {
                session_id,
                envelope: RoutingEnvelope::read(&mut body)?,
            },
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_with_and_without_session() {
        let sid = SessionId::new_random();
        for (kind, session_id) in [
            (MessageType::SessionData, Some(sid)),
            (MessageType::SessionClose, None),
            (MessageType::RoutedSessionData, Some(sid)),
            (MessageType::ServiceRequest, None),
        ] {
            let bytes = serialize(kind, session_id, |buf| buf.put_slice(b"tail"));
            let (header, rest) = deserialize(bytes).unwrap();
            assert_eq!(header.kind, kind);
            assert_eq!(header.session_id, session_id);
            assert_eq!(&rest[..], b"tail");
        }
    }

    #[test]
    fn header_layout_matches_wire_format() {
        let sid = SessionId::new_random();
        let bytes = serialize(MessageType::SessionData, Some(sid), |buf| buf.put_u8(0xaa));
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..18], sid.as_bytes());
        assert_eq!(bytes.len(), 1 + 1 + 16 + 8 + 1);

        let bytes = serialize(MessageType::SessionClose, None, |_| {});
        assert_eq!(&bytes[..2], &[4, 0]);
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn messages_decode_to_what_was_encoded() {
        let sid = SessionId::new_random();
        let messages = vec![
            Message::ServiceRequest(ServiceRequest {
                request_id: Uuid::new_v4(),
                source: PeerId::new_random(),
                destination: PeerId::new_random(),
                service: "Chat".into(),
            }),
            Message::ServiceResponse {
                session_id: sid,
                expires_at: 1_700_000_000_000,
            },
            Message::SessionData {
                session_id: Some(sid),
                payload: Bytes::from_static(b"ping"),
            },
            Message::SessionData {
                session_id: None,
                payload: Bytes::new(),
            },
            Message::SessionClose { session_id: None },
            Message::RoutedSessionData {
                session_id: Some(sid),
                envelope: RoutingEnvelope {
                    route_id: Uuid::new_v4(),
                    source: PeerId::new_random(),
                    destination: PeerId::new_random(),
                    service: "Chat".into(),
                    payload: Bytes::from_static(b"P"),
                },
            },
        ];

        for msg in messages {
            assert_eq!(Message::decode(msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = deserialize(vec![9u8, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, ZerolinkError::UnknownMessageType(9)));
    }

    #[test]
    fn truncated_request_is_rejected() {
        let mut bytes = Message::ServiceRequest(ServiceRequest {
            request_id: Uuid::new_v4(),
            source: PeerId::new_random(),
            destination: PeerId::new_random(),
            service: "Echo".into(),
        })
        .encode();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            Message::decode(bytes),
            Err(ZerolinkError::Truncated { .. })
        ));
    }

    #[test]
    fn response_requires_session_id() {
        let bytes = serialize(MessageType::ServiceResponse, None, |buf| buf.put_i64_le(0));
        assert!(matches!(
            Message::decode(bytes),
            Err(ZerolinkError::InvalidMessage(_))
        ));
    }

    #[test]
    fn strings_reject_invalid_utf8() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, &[0xff, 0xfe]);
        let mut bytes = buf.freeze();
        assert!(get_string(&mut bytes, "name").is_err());
    }
}
