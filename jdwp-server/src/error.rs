// Debug-session error taxonomy
//
// Every variant maps onto a JDWP error code that is placed in the reply packet.
// None of these close the connection; transport failures live in `JdwpError`.

use crate::bridge::BridgeError;
use crate::commands::error_codes;
use thiserror::Error;

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebugError {
    #[error("unknown or null thread id")]
    InvalidThread,

    #[error("invalid object id")]
    InvalidObject,

    #[error("thread is not suspended")]
    ThreadNotSuspended,

    #[error("stale or unknown frame id")]
    InvalidFrameId,

    #[error("location cannot be resolved")]
    UnknownLocation,

    #[error("request kind does not match")]
    InvalidEventType,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("an invocation is already pending on this thread")]
    AlreadyInvoking,

    #[error("the debuggee has terminated")]
    VmDead,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DebugError {
    /// JDWP error code reported to the client
    pub fn error_code(&self) -> u16 {
        match self {
            DebugError::InvalidThread => error_codes::INVALID_THREAD,
            DebugError::InvalidObject => error_codes::INVALID_OBJECT,
            DebugError::ThreadNotSuspended => error_codes::THREAD_NOT_SUSPENDED,
            DebugError::InvalidFrameId => error_codes::INVALID_FRAMEID,
            DebugError::UnknownLocation => error_codes::INVALID_LOCATION,
            DebugError::InvalidEventType => error_codes::INVALID_EVENT_TYPE,
            DebugError::NotImplemented(_) => error_codes::NOT_IMPLEMENTED,
            DebugError::IllegalArgument(_) => error_codes::ILLEGAL_ARGUMENT,
            DebugError::AlreadyInvoking => error_codes::ALREADY_INVOKING,
            DebugError::VmDead => error_codes::VM_DEAD,
            DebugError::Internal(_) => error_codes::INTERNAL,
        }
    }
}

impl From<BridgeError> for DebugError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::UnknownThread(_) => DebugError::InvalidThread,
            BridgeError::Disposed => DebugError::VmDead,
            BridgeError::Jdwp(code) => match code {
                error_codes::INVALID_THREAD => DebugError::InvalidThread,
                error_codes::INVALID_OBJECT => DebugError::InvalidObject,
                error_codes::THREAD_NOT_SUSPENDED => DebugError::ThreadNotSuspended,
                error_codes::INVALID_LOCATION => DebugError::UnknownLocation,
                error_codes::NOT_IMPLEMENTED => DebugError::NotImplemented(format!("bridge code {code}")),
                error_codes::VM_DEAD => DebugError::VmDead,
                _ => DebugError::Internal(format!("bridge reported error code {code}")),
            },
            BridgeError::Failed(msg) => DebugError::Internal(msg),
        }
    }
}
