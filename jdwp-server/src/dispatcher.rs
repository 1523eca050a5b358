// Event dispatcher
//
// Debuggee threads report what they are doing through `EventDispatcher`.
// The dispatcher matches the occurrence against the live requests, builds a
// single composite event set from every hit, and suspends according to the
// strongest suspend policy among the hits. The event set is queued only
// after the suspension is recorded.

use crate::bridge::StepSize;
use crate::breakpoints::{BreakpointInfo, BreakpointTarget};
use crate::commands::event_kinds;
use crate::eventrequest::SuspendPolicy;
use crate::events::{Event, EventKind, EventSet};
use crate::filter::{Occurrence, RequestFilter, StepDescriptor};
use crate::session::DebugSession;
use crate::stackframe::SuspendedSnapshot;
use crate::types::{Location, ObjectId, RequestId, ThreadId, Value, NULL_OBJECT};
use std::collections::HashSet;
use std::ops::BitOr;
use std::sync::Arc;
use tracing::{debug, info};

/// Kinds of location-based occurrence reported together
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    pub const STEP: EventMask = EventMask(1);
    pub const BREAKPOINT: EventMask = EventMask(1 << 1);
    pub const METHOD_ENTRY: EventMask = EventMask(1 << 2);
    pub const METHOD_EXIT: EventMask = EventMask(1 << 3);

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// Hits collected for one occurrence
#[derive(Default)]
struct Hits {
    seen: HashSet<RequestId>,
    events: Vec<Event>,
    policy: Option<SuspendPolicy>,
}

impl Hits {
    fn already_reported(&self, filter: &RequestFilter) -> bool {
        self.seen.contains(&filter.request_id())
    }

    fn add(&mut self, filter: &RequestFilter, details: EventKind) {
        self.seen.insert(filter.request_id());
        self.events.push(Event::new(filter.request_id(), details));
        self.policy = self.policy.max(Some(filter.suspend_policy()));
    }
}

#[derive(Clone)]
pub struct EventDispatcher {
    session: Arc<DebugSession>,
}

impl EventDispatcher {
    pub fn new(session: Arc<DebugSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<DebugSession> {
        &self.session
    }

    fn is_active(&self) -> bool {
        !self.session.is_disposed() && !self.session.is_vm_dead()
    }

    pub fn on_breakpoint(&self, thread: ThreadId, location: Location, this: ObjectId) -> bool {
        self.on_location_event(thread, location, EventMask::BREAKPOINT, this, None)
    }

    pub fn on_single_step(&self, thread: ThreadId, location: Location) -> bool {
        self.on_location_event(thread, location, EventMask::STEP, NULL_OBJECT, None)
    }

    pub fn on_method_entry(&self, thread: ThreadId, location: Location, this: ObjectId) -> bool {
        self.on_location_event(thread, location, EventMask::METHOD_ENTRY, this, None)
    }

    pub fn on_method_exit(&self, thread: ThreadId, location: Location, this: ObjectId, return_value: Value) -> bool {
        self.on_location_event(thread, location, EventMask::METHOD_EXIT, this, Some(return_value))
    }

    /// Report everything `thread` hit at `location`. Returns whether an event
    /// was sent. With a suspending policy this blocks until the debugger
    /// resumes the thread.
    pub fn on_location_event(
        &self,
        thread: ThreadId,
        location: Location,
        mask: EventMask,
        this: ObjectId,
        return_value: Option<Value>,
    ) -> bool {
        if !self.is_active() {
            return false;
        }

        let occurrence = Occurrence::at(thread, location, this);
        let mut hits = Hits::default();

        if mask.contains(EventMask::STEP) {
            self.match_step(&occurrence, location, &mut hits);
        }

        let breakpoints = &self.session.breakpoints;
        let mut candidates: Vec<Arc<BreakpointInfo>> = Vec::new();
        if mask.contains(EventMask::BREAKPOINT) {
            candidates.extend(breakpoints.lines_at(&location));
        }
        if mask.contains(EventMask::METHOD_ENTRY) {
            candidates.extend(breakpoints.method_entries(location.class_id));
        }
        if mask.contains(EventMask::METHOD_EXIT) {
            candidates.extend(breakpoints.method_exits(location.class_id));
        }

        for info in candidates {
            let filter = info.filter();
            if hits.already_reported(filter) || !filter.is_hit(&occurrence, self.session.symbols.as_ref()) {
                continue;
            }

            let details = match info.target() {
                BreakpointTarget::Line(_) => EventKind::Breakpoint { thread, location },
                BreakpointTarget::MethodEntry(_) => EventKind::MethodEntry { thread, location },
                BreakpointTarget::MethodExit(_) if filter.event_kind() == event_kinds::METHOD_EXIT_WITH_RETURN_VALUE => {
                    EventKind::MethodExitWithReturnValue {
                        thread,
                        location,
                        value: return_value.clone().unwrap_or_else(Value::void),
                    }
                }
                BreakpointTarget::MethodExit(_) => EventKind::MethodExit { thread, location },
            };
            hits.add(filter, details);
        }

        self.report(thread, Some(location), hits)
    }

    fn match_step(&self, occurrence: &Occurrence, location: Location, hits: &mut Hits) {
        let Some(filter) = self.session.filters.step_for(occurrence.thread) else {
            return;
        };
        let Some(step) = filter.step() else {
            return;
        };

        if self.on_start_line(&step, &location) {
            debug!(thread = step.thread, "Step still on its starting line");
            self.arm_step(&step, step.start_location);
            return;
        }

        if filter.is_hit(occurrence, self.session.symbols.as_ref()) {
            hits.add(
                &filter,
                EventKind::Step {
                    thread: occurrence.thread,
                    location,
                },
            );
        }
        filter.set_step_start(location);
        self.arm_step(&step, Some(location));
    }

    /// LINE steps ignore code on the line they started from
    fn on_start_line(&self, step: &StepDescriptor, location: &Location) -> bool {
        if step.size != StepSize::Line {
            return false;
        }
        let Some(start) = step.start_location else {
            return false;
        };
        if start.method_id != location.method_id {
            return false;
        }

        let symbols = self.session.symbols.as_ref();
        match (symbols.line_number(&start), symbols.line_number(location)) {
            (Some(from), Some(now)) => from == now,
            _ => false,
        }
    }

    fn arm_step(&self, step: &StepDescriptor, from: Option<Location>) {
        if let Err(e) = self
            .session
            .bridge
            .set_stepping_from_location(step.thread, step.depth, step.size, from)
        {
            debug!(thread = step.thread, "Re-arming step failed: {}", e);
        }
    }

    /// Send the collected hits and suspend per policy
    fn report(&self, thread: ThreadId, location: Option<Location>, hits: Hits) -> bool {
        let Some(policy) = hits.policy else {
            return false;
        };

        let events = EventSet::new(policy as u8, hits.events);
        let snapshot = match location {
            Some(location) => SuspendedSnapshot::at(thread, location),
            None => SuspendedSnapshot::unknown(thread),
        };
        let session = &self.session;
        let send = move || session.send_event(events);

        match policy {
            SuspendPolicy::None => send(),
            SuspendPolicy::EventThread => session.threads.suspended_at(thread, snapshot, send),
            SuspendPolicy::All => session.threads.suspend_all_at(thread, snapshot, send),
        }
        true
    }

    fn subscription_hit(&self, filter: Option<Arc<RequestFilter>>, occurrence: &Occurrence, details: EventKind) -> Hits {
        let mut hits = Hits::default();
        if let Some(filter) = filter {
            if filter.is_hit(occurrence, self.session.symbols.as_ref()) {
                hits.add(&filter, details);
            }
        }
        hits
    }

    /// Called on a new thread before it runs application code
    pub fn on_thread_start(&self, thread: ThreadId) {
        if !self.is_active() {
            return;
        }
        let threads = &self.session.threads;
        threads.thread(thread);

        let hits = self.subscription_hit(
            self.session.filters.thread_start(),
            &Occurrence::thread_only(thread),
            EventKind::ThreadStart { thread },
        );
        self.report(thread, None, hits);
        threads.block_if_vm_suspended(thread);
    }

    pub fn on_thread_death(&self, thread: ThreadId) {
        if !self.is_active() {
            return;
        }
        let hits = self.subscription_hit(
            self.session.filters.thread_death(),
            &Occurrence::thread_only(thread),
            EventKind::ThreadDeath { thread },
        );
        self.report(thread, None, hits);
    }

    /// Automatic VM start event, sent once the debugger is attached. With
    /// `suspend` the whole VM stops until the debugger resumes it.
    pub fn on_vm_start(&self, thread: ThreadId, suspend: bool) {
        if !self.is_active() {
            return;
        }
        let policy = if suspend {
            SuspendPolicy::All
        } else {
            SuspendPolicy::None
        };
        info!(thread, suspend, "VM started");

        let hits = Hits {
            seen: HashSet::new(),
            events: vec![Event::new(0, EventKind::VMStart { thread })],
            policy: Some(policy),
        };
        self.report(thread, None, hits);
    }

    /// VM death always carries the automatic (request id 0) event. A
    /// suspending request tears the session down instead of parking.
    pub fn on_vm_death(&self) {
        if self.session.is_disposed() || !self.session.mark_vm_dead() {
            return;
        }

        let mut hits = self.subscription_hit(
            self.session.filters.vm_death(),
            &Occurrence::thread_only(NULL_OBJECT),
            EventKind::VMDeath,
        );
        hits.events.insert(0, Event::new(0, EventKind::VMDeath));
        let policy = hits.policy.unwrap_or(SuspendPolicy::None);

        info!("VM died");
        self.session.send_event(EventSet::new(policy as u8, hits.events));
        if policy != SuspendPolicy::None {
            self.session.dispose();
        }
    }
}
