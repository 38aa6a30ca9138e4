//! Wire envelopes exchanged over the signaling WebSocket.
//!
//! Every frame is one JSON object `{ "kind": <string>, "payload": <any> }`.
//! Inbound frames go through a two-stage decode: a raw parse of the envelope
//! shape, then a per-kind payload check. Anything that fails either stage is
//! answered with an `error` envelope and never reaches dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RelayError;
use crate::ids::ConnectionId;

/// An envelope whose `kind` has been read but whose payload is not yet
/// validated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Messages sent from client to server.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum ClientEnvelope {
    /// Enter a room, leaving any previous one. A missing room name falls
    /// back to the default room.
    Join { room: Option<String> },

    /// Leave the current room.
    LeaveRoom,

    /// SDP offer addressed to one peer in the same room.
    Offer { to: Option<ConnectionId>, sdp: Value },

    /// SDP answer addressed to one peer in the same room.
    Answer { to: Option<ConnectionId>, sdp: Value },

    /// ICE candidate addressed to one peer in the same room.
    IceCandidate {
        to: Option<ConnectionId>,
        candidate: Value,
    },

    /// Keep-alive probe.
    Ping,
}

/// Messages sent from server to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum ServerEnvelope {
    /// Sent once, immediately after the connection is accepted.
    Welcome(String),

    /// Reply to `join`: the peers already in the room, excluding the joiner.
    ExistingUsers { peers: Vec<ConnectionId> },

    /// Broadcast to a room when a peer joins it.
    NewUser {
        #[serde(rename = "peerId")]
        peer_id: ConnectionId,
    },

    /// Broadcast to a room when a peer leaves it or disconnects.
    UserLeft {
        #[serde(rename = "peerId")]
        peer_id: ConnectionId,
    },

    /// Forwarded offer, `from` stamped by the relay.
    Offer { from: ConnectionId, sdp: Value },

    /// Forwarded answer, `from` stamped by the relay.
    Answer { from: ConnectionId, sdp: Value },

    /// Forwarded ICE candidate, `from` stamped by the relay.
    IceCandidate {
        from: ConnectionId,
        candidate: Value,
    },

    /// Validation or routing failure, addressed to the offending sender.
    Error { message: String },

    /// Keep-alive, both as a `ping` reply and as the periodic heartbeat.
    Pong,

    /// Diagnostic fallback for unrecognized kinds: the original envelope
    /// plus a server timestamp.
    Echo(Value),
}

/// Result of decoding one inbound text frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Known(ClientEnvelope),
    /// Syntactically valid envelope with a kind outside the client
    /// enumeration. Answered with `echo`.
    Unknown(RawEnvelope),
}

#[derive(Deserialize)]
struct JoinPayload {
    #[serde(default)]
    room: Option<String>,
}

#[derive(Deserialize)]
struct SessionDescPayload {
    #[serde(default)]
    to: Option<ConnectionId>,
    sdp: Value,
}

#[derive(Deserialize)]
struct CandidatePayload {
    #[serde(default)]
    to: Option<ConnectionId>,
    candidate: Value,
}

/// Decode one inbound text frame into a typed envelope.
///
/// A frame that is not a JSON object with a string `kind` is a
/// [`RelayError::MalformedFrame`]; a known kind whose payload lacks required
/// fields is a [`RelayError::SchemaViolation`].
pub fn decode_client(text: &str) -> Result<Decoded, RelayError> {
    let raw: RawEnvelope =
        serde_json::from_str(text).map_err(|e| RelayError::MalformedFrame(e.to_string()))?;

    // A null/absent payload is treated as an empty object so that kinds
    // without required fields ("join", "ping") accept bare envelopes.
    let payload = if raw.payload.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        raw.payload.clone()
    };

    let envelope = match raw.kind.as_str() {
        "join" => {
            let p: JoinPayload = typed(payload)?;
            ClientEnvelope::Join { room: p.room }
        }
        "leave-room" => ClientEnvelope::LeaveRoom,
        "offer" => {
            let p: SessionDescPayload = typed(payload)?;
            ClientEnvelope::Offer { to: p.to, sdp: p.sdp }
        }
        "answer" => {
            let p: SessionDescPayload = typed(payload)?;
            ClientEnvelope::Answer { to: p.to, sdp: p.sdp }
        }
        "ice-candidate" => {
            let p: CandidatePayload = typed(payload)?;
            ClientEnvelope::IceCandidate {
                to: p.to,
                candidate: p.candidate,
            }
        }
        "ping" => ClientEnvelope::Ping,
        _ => return Ok(Decoded::Unknown(raw)),
    };

    Ok(Decoded::Known(envelope))
}

fn typed<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, RelayError> {
    serde_json::from_value(payload).map_err(|e| RelayError::SchemaViolation(e.to_string()))
}

impl ServerEnvelope {
    pub fn welcome() -> Self {
        Self::Welcome("Connected to server".to_string())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Echo an unrecognized envelope back with a server timestamp (ms).
    pub fn echo(raw: &RawEnvelope, timestamp_ms: i64) -> Self {
        Self::Echo(serde_json::json!({
            "kind": raw.kind,
            "payload": raw.payload,
            "timestamp": timestamp_ms,
        }))
    }

    /// Wire kind string, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome(_) => "welcome",
            Self::ExistingUsers { .. } => "existing-users",
            Self::NewUser { .. } => "new-user",
            Self::UserLeft { .. } => "user-left",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
            Self::Echo(_) => "echo",
        }
    }
}
