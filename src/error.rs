// Error taxonomy for the subscription engine.
//
// One flat enum, mirroring the reserved return-code taxonomy of the
// datastore's callback contract (ok / invalid-argument / not-found / ...):
// every non-`ok` code a callback or the engine itself can report has a
// matching variant here.

use thiserror::Error;

use crate::common::{EventId, GroupId, SubscriptionId, TransactionId};

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("no memory: {0}")]
    NoMemory(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("locked: {0}")]
    Locked(String),

    #[error("system error: {0}")]
    System(String),

    #[error("no space in event store for group {group}")]
    NoSpace { group: GroupId },

    #[error("subscription {0:?} not found")]
    UnknownSubscription(SubscriptionId),

    #[error("group {0:?} not found")]
    UnknownGroup(GroupId),

    #[error("event {event:?} not found in group {group:?}")]
    UnknownEvent { group: GroupId, event: EventId },

    #[error("transaction {0:?} not found")]
    UnknownTransaction(TransactionId),

    #[error("no subscriber matches the requested xpath")]
    NoMatchingSubscriber,

    #[error("io error: {0}")]
    Io(String),
}

/// The reserved callback return-code taxonomy: a callback answers with one
/// of exactly these three shapes. `Shelve` never reaches a caller as an
/// error; the event store consumes it internally as a re-queue signal that
/// preserves the event's original deadline. `Fail` carries the error the
/// callback reported, which the multiplexer/dispatcher then propagates or
/// aborts on depending on phase.
#[derive(Debug, Clone)]
pub enum CallbackVerdict {
    Ok,
    Fail(EngineError),
    Shelve,
}

impl CallbackVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, CallbackVerdict::Ok)
    }

    pub fn is_shelve(&self) -> bool {
        matches!(self, CallbackVerdict::Shelve)
    }

    pub fn into_result(self) -> EngineResult<()> {
        match self {
            CallbackVerdict::Ok => Ok(()),
            CallbackVerdict::Fail(e) => Err(e),
            CallbackVerdict::Shelve => {
                Err(EngineError::OperationFailed("callback shelved".to_string()))
            }
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Validation(e.to_string())
    }
}
