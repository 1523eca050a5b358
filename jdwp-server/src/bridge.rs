// Debuggee bridge
//
// The server never touches the managed runtime directly. Everything it needs
// from the debuggee goes through `DebuggeeBridge`, and symbolic metadata
// comes from `SymbolLookup`.

use crate::commands::{error_codes, step_depths, step_sizes};
use crate::protocol::CommandPacket;
use crate::types::{ClassId, Location, MethodId, ObjectId, ThreadId, ThreadStatus, Value};
use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("unknown thread {0:#x}")]
    UnknownThread(ThreadId),

    #[error("debuggee is disposed")]
    Disposed,

    #[error("debuggee reported JDWP error {0}")]
    Jdwp(u16),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSize {
    Min,
    Line,
}

impl StepSize {
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            step_sizes::MIN => Some(StepSize::Min),
            step_sizes::LINE => Some(StepSize::Line),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDepth {
    Into,
    Over,
    Out,
}

impl StepDepth {
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            step_depths::INTO => Some(StepDepth::Into),
            step_depths::OVER => Some(StepDepth::Over),
            step_depths::OUT => Some(StepDepth::Out),
            _ => None,
        }
    }
}

/// Arguments of a client-requested method invocation
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    /// Receiver object, `NULL_OBJECT` for static and interface-static calls
    pub receiver: ObjectId,
    pub class_id: ClassId,
    pub method_id: MethodId,
    pub args: Vec<Value>,
    pub options: i32,
}

/// Result of an invocation: either a value or a thrown exception object
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    pub value: Value,
    pub exception: ObjectId,
}

/// Capability interface onto the debuggee runtime.
///
/// All methods may be called from any thread. `invoke_method` is only ever
/// called on the debuggee thread that performs the invocation, while it is
/// parked inside the server.
pub trait DebuggeeBridge: Send + Sync {
    /// Every live application thread.
    fn all_threads(&self) -> Vec<ThreadId>;

    /// Ask the runtime to stop `thread` at its next safe point.
    fn suspend_thread(&self, thread: ThreadId) -> BridgeResult<()>;

    fn resume_thread(&self, thread: ThreadId) -> BridgeResult<()>;

    /// Batched suspension. Returns the threads that were actually stopped by
    /// this call; only those need a matching `vm_resume`.
    fn vm_suspend(&self, threads: &[ThreadId]) -> BridgeResult<Vec<ThreadId>>;

    fn vm_resume(&self, threads: &[ThreadId]) -> BridgeResult<()>;

    /// Stack of a stopped thread, innermost frame first.
    fn stack_frames(&self, thread: ThreadId) -> BridgeResult<Vec<Location>>;

    fn thread_status(&self, thread: ThreadId) -> BridgeResult<ThreadStatus>;

    fn toggle_breakpoint(&self, method_id: MethodId, index: u64, enabled: bool) -> BridgeResult<()>;

    fn toggle_method_enter(&self, class_id: ClassId, enabled: bool) -> BridgeResult<()>;

    fn toggle_method_exit(&self, class_id: ClassId, enabled: bool) -> BridgeResult<()>;

    /// Arm single stepping for `thread` starting at `location`.
    fn set_stepping_from_location(
        &self,
        thread: ThreadId,
        depth: StepDepth,
        size: StepSize,
        location: Option<Location>,
    ) -> BridgeResult<()>;

    fn clear_stepping(&self, thread: ThreadId) -> BridgeResult<()>;

    fn invoke_method(&self, thread: ThreadId, request: &InvokeRequest) -> BridgeResult<InvokeOutcome>;

    /// Handle a command the server does not interpret itself and return the
    /// reply payload. StackFrame commands arrive with the frame id replaced
    /// by the frame depth.
    fn dispatch(&self, packet: &CommandPacket) -> BridgeResult<Vec<u8>> {
        let _ = packet;
        Err(BridgeError::Jdwp(error_codes::NOT_IMPLEMENTED))
    }
}

/// Symbolic reference resolution
pub trait SymbolLookup: Send + Sync {
    /// Binary name with dots, e.g. `java.lang.String`
    fn class_name(&self, class_id: ClassId) -> Option<String>;

    /// Whether `class_id` is `to` or a subtype of it
    fn is_assignable(&self, class_id: ClassId, to: ClassId) -> bool;

    fn loaded_classes(&self) -> Vec<ClassId>;

    fn line_number(&self, location: &Location) -> Option<i32>;

    fn is_valid_location(&self, location: &Location) -> bool;

    fn is_virtual_thread(&self, thread: ThreadId) -> bool {
        let _ = thread;
        false
    }
}
