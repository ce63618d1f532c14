use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    message::{ContextId, Handle},
    CallError,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("latch timed out")]
    LatchTimeout,
    #[error("latch is closed")]
    LatchClosed,
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("no route to context {0}")]
    Routing(ContextId),
    #[error("channel is dead: {0}")]
    Dead(DeadReason),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("broker has shut down")]
    BrokerShutdown,
}

impl Error {
    /// True for failures caused by a peer going away, as opposed to a local
    /// timeout or a remote exception.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Dead(_) | Error::BrokerShutdown)
    }
}

/// Why a dead message was synthesized. Carried as the payload of every dead
/// message so waiters can report something better than "it died".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    /// The respondent context disconnected.
    Disconnected,
    /// No stream leads to the destination.
    NoRoute(ContextId),
    /// The local broker shut down.
    Shutdown,
    /// No handler was registered for the addressed handle.
    InvalidHandle(Handle),
}

impl fmt::Display for DeadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadReason::Disconnected => f.write_str("the respondent context has disconnected"),
            DeadReason::NoRoute(id) => write!(f, "no route to context {id}"),
            DeadReason::Shutdown => f.write_str("broker shut down"),
            DeadReason::InvalidHandle(h) => write!(f, "invalid handle {h}"),
        }
    }
}

impl From<DeadReason> for Error {
    fn from(reason: DeadReason) -> Self {
        match reason {
            DeadReason::NoRoute(id) => Error::Routing(id),
            reason => Error::Dead(reason),
        }
    }
}
