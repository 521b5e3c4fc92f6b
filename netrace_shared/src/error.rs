//! Error taxonomy.
//!
//! Configuration and connectivity failures surface to the caller. Consistency
//! races (duplicate joins, despawn of an absent record, stale authority) are
//! not errors at all; they come back as no-op outcomes from the lifecycle
//! manager.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fatal misconfiguration of the operation attempted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("vehicle template '{0}' is not known to the physics backend")]
    MissingVehicleTemplate(String),

    #[error("spawn capacity exceeded: {requested} participants, record capacity {capacity}")]
    RecordCapacityExceeded { requested: usize, capacity: usize },

    #[error("room runs in {room:?} mode but this node is configured for {configured:?}")]
    AuthorityModeMismatch {
        room: crate::config::SessionMode,
        configured: crate::config::SessionMode,
    },

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Why the fabric could not be reached or a session was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectReason {
    /// The fabric endpoint did not answer.
    Unreachable,
    /// The open did not complete within the connect timeout.
    TimedOut,
    /// `join` named a room that does not exist.
    RoomNotFound,
    /// The local node is no longer connected.
    Disconnected,
}

impl fmt::Display for ConnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectReason::Unreachable => "unreachable",
            ConnectReason::TimedOut => "timed out",
            ConnectReason::RoomNotFound => "room not found",
            ConnectReason::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Session control surface errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("a session is already active on this node")]
    AlreadyActive,

    #[error("connectivity failure: {reason}")]
    ConnectivityFailure { reason: ConnectReason },

    #[error("capacity exceeded: room holds {max} participants")]
    CapacityExceeded { max: usize },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SessionError {
    pub fn connectivity(reason: ConnectReason) -> Self {
        SessionError::ConnectivityFailure { reason }
    }
}

/// Lifecycle failures that are not idempotency races.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("record capacity {capacity} exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("failed to replicate record: {0}")]
    Replication(String),
}

/// Input wire decoding errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WireError {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("non-finite axis value")]
    NonFinite,
}
