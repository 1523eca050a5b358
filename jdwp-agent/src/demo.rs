// Simulated debuggee
//
// A tiny "program" of one class with two methods, run by a main thread and a
// few worker threads. Each thread walks the bytecode indices of its methods,
// stops when the debugger suspended it, and reports breakpoints, steps and
// method entry/exit through the session's `EventDispatcher`.

use jdwp_server::commands::{command_sets, error_codes, thread_commands, vm_commands};
use jdwp_server::protocol::CommandPacket;
use jdwp_server::types::{ClassId, Location, MethodId, ThreadId, ThreadStatus, Value, ValueData, NULL_OBJECT};
use jdwp_server::{
    BridgeError, BridgeResult, DebuggeeBridge, EventDispatcher, EventMask, InvokeOutcome, InvokeRequest, StepDepth,
    StepSize, SymbolLookup,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const WORKER_CLASS: ClassId = 100;
pub const MAIN_THREAD: ThreadId = 1;

pub const RUN: MethodId = 1;
pub const COMPUTE: MethodId = 2;

struct MethodDef {
    id: MethodId,
    name: &'static str,
    first_line: i32,
    length: u64,
    /// Index at which `COMPUTE` is called
    calls_compute_at: Option<u64>,
}

const METHODS: [MethodDef; 2] = [
    MethodDef {
        id: RUN,
        name: "run",
        first_line: 10,
        length: 5,
        calls_compute_at: Some(2),
    },
    MethodDef {
        id: COMPUTE,
        name: "compute",
        first_line: 20,
        length: 3,
        calls_compute_at: None,
    },
];

fn method(id: MethodId) -> Option<&'static MethodDef> {
    METHODS.iter().find(|m| m.id == id)
}

fn location(method: MethodId, index: u64) -> Location {
    Location::new(WORKER_CLASS, method, index)
}

#[derive(Debug, Clone, Copy)]
struct Stepping {
    depth: StepDepth,
    start_depth: usize,
}

#[derive(Default)]
struct DemoThread {
    name: String,
    /// Innermost frame first
    stack: Vec<Location>,
    stepping: Option<Stepping>,
    iterations: i32,
}

#[derive(Default)]
struct DemoState {
    threads: HashMap<ThreadId, DemoThread>,
    stopped: HashSet<ThreadId>,
    breakpoints: HashSet<(MethodId, u64)>,
    entry_classes: HashSet<ClassId>,
    exit_classes: HashSet<ClassId>,
    dispatcher: Option<EventDispatcher>,
    started: bool,
    shutdown: bool,
}

/// In-process debuggee driven by OS threads
pub struct DemoVm {
    state: Mutex<DemoState>,
    resumed: Condvar,
    workers: usize,
    tick: Duration,
}

impl DemoVm {
    pub fn new(workers: usize, tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DemoState::default()),
            resumed: Condvar::new(),
            workers,
            tick,
        })
    }

    /// Route events to a freshly connected debugger. The first attach starts
    /// the program; with `suspend` the main thread is held at VM start.
    pub fn attach(self: &Arc<Self>, dispatcher: EventDispatcher, suspend: bool) {
        let start = {
            let mut state = self.state.lock();
            state.dispatcher = Some(dispatcher.clone());
            !std::mem::replace(&mut state.started, true)
        };

        if start {
            self.spawn_main(suspend);
        } else {
            // Already running: just announce the VM to the new debugger
            thread::spawn(move || dispatcher.on_vm_start(MAIN_THREAD, false));
        }
    }

    /// Start running without a debugger
    pub fn start(self: &Arc<Self>) {
        let start = !std::mem::replace(&mut self.state.lock().started, true);
        if start {
            self.spawn_main(false);
        }
    }

    /// Forget the debugger and drop all instrumentation
    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.dispatcher = None;
        state.breakpoints.clear();
        state.entry_classes.clear();
        state.exit_classes.clear();
        state.stopped.clear();
        for thread in state.threads.values_mut() {
            thread.stepping = None;
        }
        self.resumed.notify_all();
        info!("Debugger detached from demo VM");
    }

    /// Stop every thread at its next checkpoint
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.stopped.clear();
        self.resumed.notify_all();
    }

    fn dispatcher(&self) -> Option<EventDispatcher> {
        self.state.lock().dispatcher.clone()
    }

    fn spawn_main(self: &Arc<Self>, suspend: bool) {
        self.register(MAIN_THREAD, "main".to_string());
        let vm = Arc::clone(self);
        thread::spawn(move || {
            if let Some(dispatcher) = vm.dispatcher() {
                dispatcher.on_vm_start(MAIN_THREAD, suspend);
            }
            for n in 0..vm.workers {
                vm.spawn_worker(MAIN_THREAD + 1 + n as ThreadId, format!("worker-{}", n + 1));
            }
            vm.run_thread(MAIN_THREAD);
        });
    }

    fn spawn_worker(self: &Arc<Self>, id: ThreadId, name: String) {
        self.register(id, name);
        let vm = Arc::clone(self);
        thread::spawn(move || {
            if let Some(dispatcher) = vm.dispatcher() {
                dispatcher.on_thread_start(id);
            }
            vm.run_thread(id);
        });
    }

    fn register(&self, id: ThreadId, name: String) {
        self.state.lock().threads.insert(
            id,
            DemoThread {
                name,
                ..DemoThread::default()
            },
        );
    }

    fn run_thread(&self, id: ThreadId) {
        debug!(thread = id, "Demo thread running");
        while !self.state.lock().shutdown {
            self.execute(id, RUN);
        }

        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.on_thread_death(id);
        }
        let mut state = self.state.lock();
        state.threads.remove(&id);
        state.stopped.remove(&id);
        debug!(thread = id, "Demo thread finished");
    }

    /// Walk one method, returning its result
    fn execute(&self, id: ThreadId, method_id: MethodId) -> i32 {
        let Some(def) = method(method_id) else {
            return 0;
        };
        let this = (WORKER_CLASS << 16) | id;

        self.push_frame(id, location(def.id, 0));
        let mut result = 0;
        for index in 0..def.length {
            let here = location(def.id, index);
            self.set_top(id, here);

            let mut mask = EventMask::BREAKPOINT | EventMask::STEP;
            if index == 0 {
                mask = mask | EventMask::METHOD_ENTRY;
            }
            self.checkpoint(id, here, mask, this, None);

            if def.calls_compute_at == Some(index) {
                result = self.execute(id, COMPUTE);
            }
            if self.state.lock().shutdown {
                break;
            }
            thread::sleep(self.tick);
        }

        if def.id == COMPUTE {
            result = self.bump_iterations(id) * 2;
        }
        let last = location(def.id, def.length - 1);
        self.checkpoint(id, last, EventMask::METHOD_EXIT, this, Some(Value::int(result)));
        self.pop_frame(id);
        result
    }

    fn push_frame(&self, id: ThreadId, at: Location) {
        if let Some(thread) = self.state.lock().threads.get_mut(&id) {
            thread.stack.insert(0, at);
        }
    }

    fn pop_frame(&self, id: ThreadId) {
        if let Some(thread) = self.state.lock().threads.get_mut(&id) {
            if !thread.stack.is_empty() {
                thread.stack.remove(0);
            }
        }
    }

    fn set_top(&self, id: ThreadId, at: Location) {
        if let Some(top) = self.state.lock().threads.get_mut(&id).and_then(|t| t.stack.first_mut()) {
            *top = at;
        }
    }

    fn bump_iterations(&self, id: ThreadId) -> i32 {
        match self.state.lock().threads.get_mut(&id) {
            Some(thread) => {
                thread.iterations += 1;
                thread.iterations
            }
            None => 0,
        }
    }

    /// Honour a pending suspension, then report whatever is instrumented at
    /// `at`
    fn checkpoint(&self, id: ThreadId, at: Location, candidates: EventMask, this: u64, value: Option<Value>) {
        let (mask, dispatcher) = {
            let mut state = self.state.lock();
            while state.stopped.contains(&id) && !state.shutdown {
                self.resumed.wait(&mut state);
            }
            let Some(dispatcher) = state.dispatcher.clone() else {
                return;
            };
            (Self::instrumented(&state, id, at, candidates), dispatcher)
        };

        if mask != EventMask::default() {
            dispatcher.on_location_event(id, at, mask, this, value);
        }
    }

    fn instrumented(state: &DemoState, id: ThreadId, at: Location, candidates: EventMask) -> EventMask {
        let mut mask = EventMask::default();
        if candidates.contains(EventMask::BREAKPOINT) && state.breakpoints.contains(&at.method_key()) {
            mask = mask | EventMask::BREAKPOINT;
        }
        if candidates.contains(EventMask::METHOD_ENTRY) && state.entry_classes.contains(&at.class_id) {
            mask = mask | EventMask::METHOD_ENTRY;
        }
        if candidates.contains(EventMask::METHOD_EXIT) && state.exit_classes.contains(&at.class_id) {
            mask = mask | EventMask::METHOD_EXIT;
        }
        if candidates.contains(EventMask::STEP) {
            if let Some(thread) = state.threads.get(&id) {
                let depth = thread.stack.len();
                let due = match thread.stepping {
                    Some(Stepping {
                        depth: StepDepth::Into, ..
                    }) => true,
                    Some(Stepping {
                        depth: StepDepth::Over,
                        start_depth,
                    }) => depth <= start_depth,
                    Some(Stepping {
                        depth: StepDepth::Out,
                        start_depth,
                    }) => depth < start_depth,
                    None => false,
                };
                if due {
                    mask = mask | EventMask::STEP;
                }
            }
        }
        mask
    }

    fn known_thread(&self, thread: ThreadId) -> BridgeResult<()> {
        if self.state.lock().threads.contains_key(&thread) {
            Ok(())
        } else {
            Err(BridgeError::UnknownThread(thread))
        }
    }
}

impl DebuggeeBridge for DemoVm {
    fn all_threads(&self) -> Vec<ThreadId> {
        let mut threads: Vec<ThreadId> = self.state.lock().threads.keys().copied().collect();
        threads.sort_unstable();
        threads
    }

    fn suspend_thread(&self, thread: ThreadId) -> BridgeResult<()> {
        self.known_thread(thread)?;
        self.state.lock().stopped.insert(thread);
        Ok(())
    }

    fn resume_thread(&self, thread: ThreadId) -> BridgeResult<()> {
        self.known_thread(thread)?;
        self.state.lock().stopped.remove(&thread);
        self.resumed.notify_all();
        Ok(())
    }

    fn vm_suspend(&self, threads: &[ThreadId]) -> BridgeResult<Vec<ThreadId>> {
        let mut state = self.state.lock();
        let mut stopped = Vec::new();
        for thread in threads {
            if state.threads.contains_key(thread) && state.stopped.insert(*thread) {
                stopped.push(*thread);
            }
        }
        Ok(stopped)
    }

    fn vm_resume(&self, threads: &[ThreadId]) -> BridgeResult<()> {
        let mut state = self.state.lock();
        for thread in threads {
            state.stopped.remove(thread);
        }
        self.resumed.notify_all();
        Ok(())
    }

    fn stack_frames(&self, thread: ThreadId) -> BridgeResult<Vec<Location>> {
        self.state
            .lock()
            .threads
            .get(&thread)
            .map(|t| t.stack.clone())
            .ok_or(BridgeError::UnknownThread(thread))
    }

    fn thread_status(&self, thread: ThreadId) -> BridgeResult<ThreadStatus> {
        let state = self.state.lock();
        if !state.threads.contains_key(&thread) {
            return Err(BridgeError::UnknownThread(thread));
        }
        Ok(if state.stopped.contains(&thread) {
            ThreadStatus::Wait
        } else {
            ThreadStatus::Sleeping
        })
    }

    fn toggle_breakpoint(&self, method_id: MethodId, index: u64, enabled: bool) -> BridgeResult<()> {
        let mut state = self.state.lock();
        if enabled {
            state.breakpoints.insert((method_id, index));
        } else {
            state.breakpoints.remove(&(method_id, index));
        }
        debug!(method = method_name(method_id), index, enabled, "Breakpoint toggled");
        Ok(())
    }

    fn toggle_method_enter(&self, class_id: ClassId, enabled: bool) -> BridgeResult<()> {
        let mut state = self.state.lock();
        if enabled {
            state.entry_classes.insert(class_id);
        } else {
            state.entry_classes.remove(&class_id);
        }
        Ok(())
    }

    fn toggle_method_exit(&self, class_id: ClassId, enabled: bool) -> BridgeResult<()> {
        let mut state = self.state.lock();
        if enabled {
            state.exit_classes.insert(class_id);
        } else {
            state.exit_classes.remove(&class_id);
        }
        Ok(())
    }

    fn set_stepping_from_location(
        &self,
        thread: ThreadId,
        depth: StepDepth,
        _size: StepSize,
        _location: Option<Location>,
    ) -> BridgeResult<()> {
        let mut state = self.state.lock();
        let target = state
            .threads
            .get_mut(&thread)
            .ok_or(BridgeError::UnknownThread(thread))?;
        target.stepping = Some(Stepping {
            depth,
            start_depth: target.stack.len(),
        });
        Ok(())
    }

    fn clear_stepping(&self, thread: ThreadId) -> BridgeResult<()> {
        if let Some(target) = self.state.lock().threads.get_mut(&thread) {
            target.stepping = None;
        }
        Ok(())
    }

    /// `compute(int)` doubles its argument; other methods return void
    fn invoke_method(&self, thread: ThreadId, request: &InvokeRequest) -> BridgeResult<InvokeOutcome> {
        self.known_thread(thread)?;
        if request.class_id != WORKER_CLASS || method(request.method_id).is_none() {
            return Err(BridgeError::Jdwp(error_codes::INVALID_OBJECT));
        }

        let value = match (request.method_id, request.args.first()) {
            (COMPUTE, Some(arg)) => match arg.data {
                ValueData::Int(n) => Value::int(n.wrapping_mul(2)),
                _ => return Err(BridgeError::Jdwp(error_codes::ILLEGAL_ARGUMENT)),
            },
            _ => Value::void(),
        };
        Ok(InvokeOutcome {
            value,
            exception: NULL_OBJECT,
        })
    }

    fn dispatch(&self, packet: &CommandPacket) -> BridgeResult<Vec<u8>> {
        let mut data = Vec::new();
        match (packet.command_set, packet.command) {
            (command_sets::VIRTUAL_MACHINE, vm_commands::VERSION) => {
                put_string(&mut data, "jdwp-agent demo VM");
                data.extend_from_slice(&1i32.to_be_bytes());
                data.extend_from_slice(&8i32.to_be_bytes());
                put_string(&mut data, env!("CARGO_PKG_VERSION"));
                put_string(&mut data, "DemoVM");
            }
            (command_sets::VIRTUAL_MACHINE, vm_commands::ID_SIZES) => {
                for _ in 0..5 {
                    data.extend_from_slice(&8i32.to_be_bytes());
                }
            }
            (command_sets::VIRTUAL_MACHINE, vm_commands::ALL_THREADS) => {
                let threads = self.all_threads();
                data.extend_from_slice(&(threads.len() as i32).to_be_bytes());
                for thread in threads {
                    data.extend_from_slice(&thread.to_be_bytes());
                }
            }
            (command_sets::THREAD_REFERENCE, thread_commands::NAME) => {
                let bytes: [u8; 8] = packet
                    .data
                    .get(..8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(BridgeError::Jdwp(error_codes::ILLEGAL_ARGUMENT))?;
                let thread = ThreadId::from_be_bytes(bytes);
                let state = self.state.lock();
                let name = state
                    .threads
                    .get(&thread)
                    .map(|t| t.name.clone())
                    .ok_or(BridgeError::UnknownThread(thread))?;
                put_string(&mut data, &name);
            }
            (set, command) => {
                warn!(set, command, "Unsupported command");
                return Err(BridgeError::Jdwp(error_codes::NOT_IMPLEMENTED));
            }
        }
        Ok(data)
    }
}

impl SymbolLookup for DemoVm {
    fn class_name(&self, class_id: ClassId) -> Option<String> {
        (class_id == WORKER_CLASS).then(|| "demo.Worker".to_string())
    }

    fn is_assignable(&self, class_id: ClassId, to: ClassId) -> bool {
        class_id == to
    }

    fn loaded_classes(&self) -> Vec<ClassId> {
        vec![WORKER_CLASS]
    }

    fn line_number(&self, location: &Location) -> Option<i32> {
        let def = method(location.method_id)?;
        (location.class_id == WORKER_CLASS && location.index < def.length).then(|| def.first_line + location.index as i32)
    }

    fn is_valid_location(&self, location: &Location) -> bool {
        self.line_number(location).is_some()
    }
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Method names, for log output
pub fn method_name(id: MethodId) -> &'static str {
    method(id).map_or("<unknown>", |m| m.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jdwp_server::commands::event_kinds;
    use jdwp_server::eventloop::PacketSender;
    use jdwp_server::eventrequest::{EventModifier, EventRequest};
    use jdwp_server::events::{parse_event_packet, EventKind, EventSet};
    use jdwp_server::protocol::Packet;
    use jdwp_server::{DebugSession, SuspendPolicy};
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn next_event(rx: &mut mpsc::Receiver<Packet>) -> EventSet {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match rx.try_recv() {
                Ok(Packet::Command(command)) => return parse_event_packet(&command.data).unwrap(),
                Ok(other) => panic!("unexpected packet {:?}", other),
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        }
        panic!("no event within 5s");
    }

    #[test]
    fn test_line_table() {
        let vm = DemoVm::new(0, Duration::ZERO);
        assert_eq!(vm.line_number(&location(RUN, 3)), Some(13));
        assert_eq!(vm.line_number(&location(COMPUTE, 0)), Some(20));
        assert!(!vm.is_valid_location(&location(COMPUTE, 3)));
        assert!(!vm.is_valid_location(&Location::new(7, RUN, 0)));
        assert_eq!(vm.class_name(WORKER_CLASS).as_deref(), Some("demo.Worker"));
        assert_eq!(method_name(COMPUTE), "compute");
    }

    #[test]
    fn test_forwarded_commands() {
        let vm = DemoVm::new(0, Duration::ZERO);
        vm.register(MAIN_THREAD, "main".to_string());

        let sizes = vm
            .dispatch(&CommandPacket::new(1, command_sets::VIRTUAL_MACHINE, vm_commands::ID_SIZES))
            .unwrap();
        assert_eq!(sizes.len(), 20);

        let name = vm
            .dispatch(&CommandPacket::with_data(
                2,
                command_sets::THREAD_REFERENCE,
                thread_commands::NAME,
                MAIN_THREAD.to_be_bytes().to_vec(),
            ))
            .unwrap();
        assert_eq!(name, [&[0, 0, 0, 4][..], b"main"].concat());

        assert_eq!(
            vm.dispatch(&CommandPacket::new(3, 2, 1)),
            Err(BridgeError::Jdwp(error_codes::NOT_IMPLEMENTED))
        );
    }

    #[test]
    fn test_invoke_compute() {
        let vm = DemoVm::new(0, Duration::ZERO);
        vm.register(MAIN_THREAD, "main".to_string());

        let request = InvokeRequest {
            receiver: NULL_OBJECT,
            class_id: WORKER_CLASS,
            method_id: COMPUTE,
            args: vec![Value::int(21)],
            options: 0,
        };
        assert_eq!(vm.invoke_method(MAIN_THREAD, &request).unwrap().value, Value::int(42));
        assert!(vm.invoke_method(9, &request).is_err());
    }

    #[test]
    fn test_breakpoint_parks_worker_until_dispose() {
        let vm = DemoVm::new(1, Duration::from_millis(1));
        let (outbound, mut rx) = PacketSender::new(64);
        let session = DebugSession::new(vm.clone(), vm.clone(), outbound);

        let target = location(COMPUTE, 1);
        session
            .set_event_request(
                EventRequest::new(event_kinds::BREAKPOINT, SuspendPolicy::EventThread)
                    .with_modifier(EventModifier::LocationOnly(target)),
            )
            .unwrap();
        vm.attach(session.dispatcher(), false);

        let start = next_event(&mut rx);
        assert_eq!(start.events[0].details, EventKind::VMStart { thread: MAIN_THREAD });

        let hit = next_event(&mut rx);
        let thread = match hit.events[0].details {
            EventKind::Breakpoint { thread, location } => {
                assert_eq!(location, target);
                thread
            }
            ref other => panic!("expected breakpoint, got {:?}", other),
        };
        assert_eq!(session.threads().suspend_count(thread), Ok(1));
        // compute() called from run()
        assert_eq!(session.threads().frame_count(thread), Ok(2));

        session.dispose();
        vm.detach();
        vm.shutdown();
        assert!(session.is_disposed());
    }
}
