// In-memory debuggee used by the test suites
//
// `FakeDebuggee` implements both `DebuggeeBridge` and `SymbolLookup`, keeps a
// configurable class and thread model, and records every state-changing
// bridge call in order.

use crate::bridge::{
    BridgeError, BridgeResult, DebuggeeBridge, InvokeOutcome, InvokeRequest, StepDepth, StepSize,
    SymbolLookup,
};
use crate::protocol::CommandPacket;
use crate::types::{ClassId, Location, MethodId, ThreadId, ThreadStatus, Value, NULL_OBJECT};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A recorded bridge call
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCall {
    SuspendThread(ThreadId),
    ResumeThread(ThreadId),
    VmSuspend(Vec<ThreadId>),
    VmResume(Vec<ThreadId>),
    ToggleBreakpoint(MethodId, u64, bool),
    ToggleMethodEnter(ClassId, bool),
    ToggleMethodExit(ClassId, bool),
    SetStepping(ThreadId, StepDepth, StepSize, Option<Location>),
    ClearStepping(ThreadId),
    Invoke(ThreadId, InvokeRequest),
    Dispatch(u8, u8),
}

type InvokeHook = Arc<dyn Fn(ThreadId, &InvokeRequest) -> BridgeResult<InvokeOutcome> + Send + Sync>;

#[derive(Default)]
struct FakeState {
    threads: Vec<ThreadId>,
    stopped: HashSet<ThreadId>,
    frames: HashMap<ThreadId, Vec<Location>>,
    statuses: HashMap<ThreadId, ThreadStatus>,
    virtual_threads: HashSet<ThreadId>,
    classes: HashMap<ClassId, (String, Option<ClassId>)>,
    lines: HashMap<(MethodId, u64), i32>,
    invalid_methods: HashSet<MethodId>,
    failing_toggles: HashSet<MethodId>,
    replies: HashMap<(u8, u8), Vec<u8>>,
    invoke_hook: Option<InvokeHook>,
    disposed: bool,
}

/// Deterministic, in-memory debuggee test double.
#[derive(Default)]
pub struct FakeDebuggee {
    state: Mutex<FakeState>,
    calls: Mutex<Vec<BridgeCall>>,
    forwarded: Mutex<Vec<CommandPacket>>,
}

impl FakeDebuggee {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_thread(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        if !state.threads.contains(&thread) {
            state.threads.push(thread);
        }
    }

    pub fn remove_thread(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        state.threads.retain(|t| *t != thread);
        state.stopped.remove(&thread);
    }

    pub fn set_frames(&self, thread: ThreadId, frames: Vec<Location>) {
        self.state.lock().frames.insert(thread, frames);
    }

    pub fn set_status(&self, thread: ThreadId, status: ThreadStatus) {
        self.state.lock().statuses.insert(thread, status);
    }

    pub fn set_virtual(&self, thread: ThreadId) {
        self.state.lock().virtual_threads.insert(thread);
    }

    /// Register a loaded class with an optional superclass
    pub fn add_class(&self, class: ClassId, name: &str, superclass: Option<ClassId>) {
        self.state.lock().classes.insert(class, (name.to_string(), superclass));
    }

    pub fn set_line(&self, location: Location, line: i32) {
        self.state.lock().lines.insert(location.method_key(), line);
    }

    /// Locations in `method` no longer resolve
    pub fn invalidate_method(&self, method: MethodId) {
        self.state.lock().invalid_methods.insert(method);
    }

    /// Enabling a breakpoint in `method` fails
    pub fn fail_toggles_in(&self, method: MethodId) {
        self.state.lock().failing_toggles.insert(method);
    }

    pub fn set_reply(&self, command_set: u8, command: u8, data: Vec<u8>) {
        self.state.lock().replies.insert((command_set, command), data);
    }

    pub fn on_invoke<F>(&self, hook: F)
    where
        F: Fn(ThreadId, &InvokeRequest) -> BridgeResult<InvokeOutcome> + Send + Sync + 'static,
    {
        self.state.lock().invoke_hook = Some(Arc::new(hook));
    }

    pub fn set_disposed(&self, disposed: bool) {
        self.state.lock().disposed = disposed;
    }

    pub fn is_stopped(&self, thread: ThreadId) -> bool {
        self.state.lock().stopped.contains(&thread)
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<BridgeCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn count_calls(&self, filter: impl Fn(&BridgeCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| filter(c)).count()
    }

    /// Every packet handed to `dispatch`, payload included
    pub fn forwarded(&self) -> Vec<CommandPacket> {
        self.forwarded.lock().clone()
    }

    /// Toggle calls for one breakpoint key, in order
    pub fn breakpoint_toggles(&self, method: MethodId, index: u64) -> Vec<bool> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                BridgeCall::ToggleBreakpoint(m, i, enabled) if *m == method && *i == index => Some(*enabled),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: BridgeCall) {
        self.calls.lock().push(call);
    }

    fn check_alive(&self) -> BridgeResult<()> {
        if self.state.lock().disposed {
            Err(BridgeError::Disposed)
        } else {
            Ok(())
        }
    }

    fn check_thread(&self, thread: ThreadId) -> BridgeResult<()> {
        self.check_alive()?;
        if self.state.lock().threads.contains(&thread) {
            Ok(())
        } else {
            Err(BridgeError::UnknownThread(thread))
        }
    }
}

impl DebuggeeBridge for FakeDebuggee {
    fn all_threads(&self) -> Vec<ThreadId> {
        self.state.lock().threads.clone()
    }

    fn suspend_thread(&self, thread: ThreadId) -> BridgeResult<()> {
        self.check_thread(thread)?;
        self.record(BridgeCall::SuspendThread(thread));
        self.state.lock().stopped.insert(thread);
        Ok(())
    }

    fn resume_thread(&self, thread: ThreadId) -> BridgeResult<()> {
        self.check_thread(thread)?;
        self.record(BridgeCall::ResumeThread(thread));
        self.state.lock().stopped.remove(&thread);
        Ok(())
    }

    fn vm_suspend(&self, threads: &[ThreadId]) -> BridgeResult<Vec<ThreadId>> {
        self.check_alive()?;
        self.record(BridgeCall::VmSuspend(threads.to_vec()));

        let mut state = self.state.lock();
        let stopped = threads
            .iter()
            .copied()
            .filter(|t| state.threads.contains(t))
            .filter(|t| !state.stopped.contains(t))
            .collect::<Vec<_>>();
        state.stopped.extend(stopped.iter().copied());
        Ok(stopped)
    }

    fn vm_resume(&self, threads: &[ThreadId]) -> BridgeResult<()> {
        self.check_alive()?;
        self.record(BridgeCall::VmResume(threads.to_vec()));

        let mut state = self.state.lock();
        for thread in threads {
            state.stopped.remove(thread);
        }
        Ok(())
    }

    fn stack_frames(&self, thread: ThreadId) -> BridgeResult<Vec<Location>> {
        self.check_thread(thread)?;
        Ok(self.state.lock().frames.get(&thread).cloned().unwrap_or_default())
    }

    fn thread_status(&self, thread: ThreadId) -> BridgeResult<ThreadStatus> {
        self.check_thread(thread)?;
        Ok(self
            .state
            .lock()
            .statuses
            .get(&thread)
            .copied()
            .unwrap_or(ThreadStatus::Running))
    }

    fn toggle_breakpoint(&self, method_id: MethodId, index: u64, enabled: bool) -> BridgeResult<()> {
        self.check_alive()?;
        if enabled && self.state.lock().failing_toggles.contains(&method_id) {
            return Err(BridgeError::Failed(format!("cannot instrument method {method_id}")));
        }
        self.record(BridgeCall::ToggleBreakpoint(method_id, index, enabled));
        Ok(())
    }

    fn toggle_method_enter(&self, class_id: ClassId, enabled: bool) -> BridgeResult<()> {
        self.check_alive()?;
        self.record(BridgeCall::ToggleMethodEnter(class_id, enabled));
        Ok(())
    }

    fn toggle_method_exit(&self, class_id: ClassId, enabled: bool) -> BridgeResult<()> {
        self.check_alive()?;
        self.record(BridgeCall::ToggleMethodExit(class_id, enabled));
        Ok(())
    }

    fn set_stepping_from_location(
        &self,
        thread: ThreadId,
        depth: StepDepth,
        size: StepSize,
        location: Option<Location>,
    ) -> BridgeResult<()> {
        self.check_thread(thread)?;
        self.record(BridgeCall::SetStepping(thread, depth, size, location));
        Ok(())
    }

    fn clear_stepping(&self, thread: ThreadId) -> BridgeResult<()> {
        self.check_alive()?;
        self.record(BridgeCall::ClearStepping(thread));
        Ok(())
    }

    fn invoke_method(&self, thread: ThreadId, request: &InvokeRequest) -> BridgeResult<InvokeOutcome> {
        self.check_thread(thread)?;
        self.record(BridgeCall::Invoke(thread, request.clone()));

        let hook = self.state.lock().invoke_hook.clone();
        match hook {
            Some(hook) => hook(thread, request),
            None => Ok(InvokeOutcome {
                value: Value::void(),
                exception: NULL_OBJECT,
            }),
        }
    }

    fn dispatch(&self, packet: &CommandPacket) -> BridgeResult<Vec<u8>> {
        self.check_alive()?;
        self.record(BridgeCall::Dispatch(packet.command_set, packet.command));
        self.forwarded.lock().push(packet.clone());

        match self.state.lock().replies.get(&(packet.command_set, packet.command)) {
            Some(data) => Ok(data.clone()),
            None => Err(BridgeError::Jdwp(crate::commands::error_codes::NOT_IMPLEMENTED)),
        }
    }
}

impl SymbolLookup for FakeDebuggee {
    fn class_name(&self, class_id: ClassId) -> Option<String> {
        self.state.lock().classes.get(&class_id).map(|(name, _)| name.clone())
    }

    fn is_assignable(&self, class_id: ClassId, to: ClassId) -> bool {
        let state = self.state.lock();
        let mut current = Some(class_id);
        while let Some(class) = current {
            if class == to {
                return true;
            }
            current = state.classes.get(&class).and_then(|(_, superclass)| *superclass);
        }
        false
    }

    fn loaded_classes(&self) -> Vec<ClassId> {
        let mut classes: Vec<ClassId> = self.state.lock().classes.keys().copied().collect();
        classes.sort_unstable();
        classes
    }

    fn line_number(&self, location: &Location) -> Option<i32> {
        self.state.lock().lines.get(&location.method_key()).copied()
    }

    fn is_valid_location(&self, location: &Location) -> bool {
        !self.state.lock().invalid_methods.contains(&location.method_id)
    }

    fn is_virtual_thread(&self, thread: ThreadId) -> bool {
        self.state.lock().virtual_threads.contains(&thread)
    }
}
