// Debug session
//
// One `DebugSession` per debugger connection. It owns the thread registry,
// the breakpoint registry, the request filters and the outbound queue.

use crate::bridge::{DebuggeeBridge, SymbolLookup};
use crate::breakpoints::BreakpointRegistry;
use crate::dispatcher::EventDispatcher;
use crate::eventloop::PacketSender;
use crate::events::EventSet;
use crate::filter::FilterIndex;
use crate::protocol::Packet;
use crate::threads::ThreadRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct DebugSession {
    pub(crate) bridge: Arc<dyn DebuggeeBridge>,
    pub(crate) symbols: Arc<dyn SymbolLookup>,
    pub(crate) threads: Arc<ThreadRegistry>,
    pub(crate) breakpoints: BreakpointRegistry,
    pub(crate) filters: FilterIndex,
    pub(crate) outbound: PacketSender,
    vm_dead: AtomicBool,
}

impl DebugSession {
    pub fn new(
        bridge: Arc<dyn DebuggeeBridge>,
        symbols: Arc<dyn SymbolLookup>,
        outbound: PacketSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            threads: Arc::new(ThreadRegistry::new(bridge.clone())),
            breakpoints: BreakpointRegistry::new(bridge.clone(), symbols.clone()),
            filters: FilterIndex::new(),
            bridge,
            symbols,
            outbound,
            vm_dead: AtomicBool::new(false),
        })
    }

    /// Entry points for debuggee threads
    pub fn dispatcher(self: &Arc<Self>) -> EventDispatcher {
        EventDispatcher::new(self.clone())
    }

    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    pub fn breakpoints(&self) -> &BreakpointRegistry {
        &self.breakpoints
    }

    pub fn filters(&self) -> &FilterIndex {
        &self.filters
    }

    pub fn outbound(&self) -> &PacketSender {
        &self.outbound
    }

    pub fn is_disposed(&self) -> bool {
        self.threads.is_disposed()
    }

    pub fn is_vm_dead(&self) -> bool {
        self.vm_dead.load(Ordering::SeqCst)
    }

    /// Returns false if the VM was already marked dead
    pub(crate) fn mark_vm_dead(&self) -> bool {
        !self.vm_dead.swap(true, Ordering::SeqCst)
    }

    /// Queue an event set as an Event.Composite command
    pub(crate) fn send_event(&self, events: EventSet) {
        let count = events.events.len();
        let packet = events.into_packet(self.outbound.next_id());
        match self.outbound.send_blocking(Packet::Command(packet)) {
            Ok(()) => debug!(events = count, "Event queued"),
            Err(e) => warn!("Dropping event set: {}", e),
        }
    }

    /// Detach the debugger: cancel every request and let every thread run
    pub fn dispose(&self) {
        if self.is_disposed() {
            return;
        }

        let filters = self.filters.clear();
        for step in filters.iter().filter_map(|f| f.step()) {
            if let Err(e) = self.bridge.clear_stepping(step.thread) {
                debug!(thread = step.thread, "Clearing step failed: {}", e);
            }
        }
        self.breakpoints.dispose();
        self.threads.release_all_threads_and_dispose();

        info!(requests = filters.len(), "Debug session disposed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::commands::event_kinds;
    use crate::eventrequest::{EventModifier, EventRequest, SuspendPolicy};
    use crate::mock::{BridgeCall, FakeDebuggee};
    use crate::types::Location;
    use tokio::sync::mpsc;

    pub(crate) fn session_with(vm: Arc<FakeDebuggee>) -> (Arc<DebugSession>, mpsc::Receiver<Packet>) {
        let (outbound, rx) = PacketSender::new(64);
        (DebugSession::new(vm.clone(), vm, outbound), rx)
    }

    #[test]
    fn test_dispose_clears_requests_and_threads() {
        let vm = Arc::new(FakeDebuggee::new());
        vm.add_thread(1);
        let (session, _rx) = session_with(vm.clone());

        let location = Location::new(1, 2, 3);
        session
            .set_event_request(
                EventRequest::new(event_kinds::BREAKPOINT, SuspendPolicy::All)
                    .with_modifier(EventModifier::LocationOnly(location)),
            )
            .unwrap();
        session
            .set_event_request(EventRequest::new(event_kinds::SINGLE_STEP, SuspendPolicy::All).with_modifier(
                EventModifier::Step {
                    thread: 1,
                    size: 0,
                    depth: 0,
                },
            ))
            .unwrap();
        session.threads.suspend_thread(1).unwrap();

        session.dispose();

        assert!(session.is_disposed());
        assert!(session.filters.is_empty());
        assert!(!session.breakpoints.is_line_enabled(&location));
        assert!(vm.calls().contains(&BridgeCall::ClearStepping(1)));
        assert!(!vm.is_stopped(1));

        // A second dispose is a no-op
        let before = vm.calls().len();
        session.dispose();
        assert_eq!(vm.calls().len(), before);
    }

    #[test]
    fn test_events_are_dropped_after_disconnect() {
        let vm = Arc::new(FakeDebuggee::new());
        let (session, rx) = session_with(vm);
        drop(rx);

        session.send_event(EventSet::new(0, vec![]));
        assert!(session.outbound.is_closed());
    }
}
