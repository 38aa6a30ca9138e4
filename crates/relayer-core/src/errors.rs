use crate::ids::ConnectionId;

/// Typed error hierarchy for relay operations.
/// Classifies errors by how they are recovered: validation and routing
/// failures are answered to the sending client and the connection stays
/// open; transport and invariant failures close the offending connection.
/// No class is ever fatal to the process.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RelayError {
    // Validation: malformed inbound frames, rejected before dispatch
    #[error("Invalid JSON message")]
    MalformedFrame(String),
    #[error("Validation failed: {0}")]
    SchemaViolation(String),

    // Routing: valid envelope, unsatisfiable target
    #[error("Not in any room")]
    NotInAnyRoom,
    #[error("Must join a room first")]
    NotJoined,
    #[error("Recipient ID required for signaling")]
    MissingRecipient,
    #[error("Recipient not in same room")]
    RecipientNotInRoom,
    #[error("Recipient not connected")]
    RecipientNotConnected,

    // Transport: write failure, equivalent to a disconnect of that connection
    #[error("transport write failed: {0}")]
    Transport(String),

    // Invariant: internal bug; the offending connection is force-closed
    #[error("connection already registered: {0}")]
    DuplicateRegistration(ConnectionId),
}

/// Recovery class of a [`RelayError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Routing,
    Transport,
    Invariant,
}

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MalformedFrame(_) | Self::SchemaViolation(_) => ErrorClass::Validation,
            Self::NotInAnyRoom
            | Self::NotJoined
            | Self::MissingRecipient
            | Self::RecipientNotInRoom
            | Self::RecipientNotConnected => ErrorClass::Routing,
            Self::Transport(_) => ErrorClass::Transport,
            Self::DuplicateRegistration(_) => ErrorClass::Invariant,
        }
    }

    /// Whether the sender should receive an `error` envelope. Transport and
    /// invariant failures are logged and close the connection instead.
    pub fn is_reportable(&self) -> bool {
        matches!(self.class(), ErrorClass::Validation | ErrorClass::Routing)
    }

    /// Whether this error must tear down the offending connection.
    pub fn closes_connection(&self) -> bool {
        matches!(self.class(), ErrorClass::Transport | ErrorClass::Invariant)
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "malformed_frame",
            Self::SchemaViolation(_) => "schema_violation",
            Self::NotInAnyRoom => "not_in_any_room",
            Self::NotJoined => "not_joined",
            Self::MissingRecipient => "missing_recipient",
            Self::RecipientNotInRoom => "recipient_not_in_room",
            Self::RecipientNotConnected => "recipient_not_connected",
            Self::Transport(_) => "transport",
            Self::DuplicateRegistration(_) => "duplicate_registration",
        }
    }
}
