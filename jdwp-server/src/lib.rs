// JDWP server library for debuggee-side debugging support
//
// Implements the debuggee half of the JDWP protocol:
// - Connection management (listen/attach, handshake, packet transport)
// - Per-thread suspension and the process-wide suspend/resume coordination
// - Event requests, filters and breakpoint registration
// - Event delivery and method invocation on suspended threads
//
// The debuggee itself is reached through the `DebuggeeBridge` and
// `SymbolLookup` traits.

pub mod bridge;
pub mod breakpoints;
pub mod commands;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod eventloop;
pub mod eventrequest;
pub mod events;
pub mod filter;
pub mod handlers;
pub mod invoke;
pub mod protocol;
pub mod reader;
pub mod server;
pub mod session;
pub mod stackframe;
pub mod thread;
pub mod threads;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use bridge::{BridgeError, BridgeResult, DebuggeeBridge, InvokeOutcome, InvokeRequest, StepDepth, StepSize, SymbolLookup};
pub use config::{ConfigError, JdwpOptions};
pub use connection::{JdwpConnection, JdwpListener};
pub use dispatcher::{EventDispatcher, EventMask};
pub use error::{DebugError, DebugResult};
pub use eventrequest::SuspendPolicy;
pub use protocol::{JdwpError, JdwpResult};
pub use server::{start, JdwpServer, ServerHandle};
pub use session::DebugSession;
