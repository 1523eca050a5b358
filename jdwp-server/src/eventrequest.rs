// EventRequest command implementations
//
// Set up and tear down event requests (breakpoints, steps, method
// entry/exit, thread and VM lifecycle subscriptions)

use crate::bridge::{StepDepth, StepSize};
use crate::commands::{event_kinds, modifier_kinds};
use crate::error::{DebugError, DebugResult};
use crate::filter::{ClassPattern, Predicate, RequestFilter, StepDescriptor};
use crate::reader::{read_i32, read_location, read_string, read_u64, read_u8};
use crate::session::DebugSession;
use crate::types::{ClassId, Location, ObjectId, RequestId, ThreadId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Suspend policy for events, ordered by strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SuspendPolicy {
    None = 0,
    EventThread = 1,
    All = 2,
}

impl SuspendPolicy {
    pub fn from_wire(value: u8) -> DebugResult<Self> {
        match value {
            0 => Ok(SuspendPolicy::None),
            1 => Ok(SuspendPolicy::EventThread),
            2 => Ok(SuspendPolicy::All),
            other => Err(DebugError::IllegalArgument(format!("suspend policy {}", other))),
        }
    }
}

// Event request modifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventModifier {
    Count(i32),
    ThreadOnly(ThreadId),
    ClassOnly(ClassId),
    ClassMatch(String),
    ClassExclude(String),
    LocationOnly(Location),
    Step {
        thread: ThreadId,
        size: i32,
        depth: i32,
    },
    InstanceOnly(ObjectId),
    PlatformThreadsOnly,
}

/// Decoded EventRequest.Set payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRequest {
    pub event_kind: u8,
    pub suspend_policy: SuspendPolicy,
    pub modifiers: Vec<EventModifier>,
}

impl EventRequest {
    pub fn new(event_kind: u8, suspend_policy: SuspendPolicy) -> Self {
        Self {
            event_kind,
            suspend_policy,
            modifiers: Vec::new(),
        }
    }

    pub fn with_modifier(mut self, modifier: EventModifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    pub fn parse(data: &[u8]) -> DebugResult<Self> {
        let mut buf = data;

        let event_kind = read_u8(&mut buf)?;
        let suspend_policy = SuspendPolicy::from_wire(read_u8(&mut buf)?)?;
        let count = read_i32(&mut buf)?;

        let mut modifiers = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let kind = read_u8(&mut buf)?;
            let modifier = match kind {
                modifier_kinds::COUNT => EventModifier::Count(read_i32(&mut buf)?),
                modifier_kinds::THREAD_ONLY => EventModifier::ThreadOnly(read_u64(&mut buf)?),
                modifier_kinds::CLASS_ONLY => EventModifier::ClassOnly(read_u64(&mut buf)?),
                modifier_kinds::CLASS_MATCH => EventModifier::ClassMatch(read_string(&mut buf)?),
                modifier_kinds::CLASS_EXCLUDE => EventModifier::ClassExclude(read_string(&mut buf)?),
                modifier_kinds::LOCATION_ONLY => EventModifier::LocationOnly(read_location(&mut buf)?),
                modifier_kinds::STEP => EventModifier::Step {
                    thread: read_u64(&mut buf)?,
                    size: read_i32(&mut buf)?,
                    depth: read_i32(&mut buf)?,
                },
                modifier_kinds::INSTANCE_ONLY => EventModifier::InstanceOnly(read_u64(&mut buf)?),
                modifier_kinds::PLATFORM_THREADS_ONLY => EventModifier::PlatformThreadsOnly,
                modifier_kinds::CONDITIONAL
                | modifier_kinds::EXCEPTION_ONLY
                | modifier_kinds::FIELD_ONLY
                | modifier_kinds::SOURCE_NAME_MATCH => {
                    return Err(DebugError::NotImplemented(format!("event modifier {}", kind)));
                }
                other => return Err(DebugError::IllegalArgument(format!("event modifier {}", other))),
            };
            modifiers.push(modifier);
        }

        Ok(Self {
            event_kind,
            suspend_policy,
            modifiers,
        })
    }

    /// EventRequest.Set payload
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.put_u8(self.event_kind);
        data.put_u8(self.suspend_policy as u8);
        data.put_i32(self.modifiers.len() as i32);

        for modifier in &self.modifiers {
            match modifier {
                EventModifier::Count(count) => {
                    data.put_u8(modifier_kinds::COUNT);
                    data.put_i32(*count);
                }
                EventModifier::ThreadOnly(thread) => {
                    data.put_u8(modifier_kinds::THREAD_ONLY);
                    data.put_u64(*thread);
                }
                EventModifier::ClassOnly(class) => {
                    data.put_u8(modifier_kinds::CLASS_ONLY);
                    data.put_u64(*class);
                }
                EventModifier::ClassMatch(pattern) | EventModifier::ClassExclude(pattern) => {
                    data.put_u8(if matches!(modifier, EventModifier::ClassMatch(_)) {
                        modifier_kinds::CLASS_MATCH
                    } else {
                        modifier_kinds::CLASS_EXCLUDE
                    });
                    data.put_u32(pattern.len() as u32);
                    data.put_slice(pattern.as_bytes());
                }
                EventModifier::LocationOnly(location) => {
                    data.put_u8(modifier_kinds::LOCATION_ONLY);
                    location.write_to(&mut data);
                }
                EventModifier::Step { thread, size, depth } => {
                    data.put_u8(modifier_kinds::STEP);
                    data.put_u64(*thread);
                    data.put_i32(*size);
                    data.put_i32(*depth);
                }
                EventModifier::InstanceOnly(object) => {
                    data.put_u8(modifier_kinds::INSTANCE_ONLY);
                    data.put_u64(*object);
                }
                EventModifier::PlatformThreadsOnly => data.put_u8(modifier_kinds::PLATFORM_THREADS_ONLY),
            }
        }
        data
    }
}

impl DebugSession {
    /// EventRequest.Set. Returns the new request id.
    pub fn set_event_request(&self, request: EventRequest) -> DebugResult<RequestId> {
        let request_id = self.filters.next_request_id();
        let mut filter = RequestFilter::new(request_id, request.event_kind, request.suspend_policy);
        let mut location = None;
        let mut step = None;

        for modifier in request.modifiers {
            match modifier {
                EventModifier::Count(count) => {
                    if count <= 0 {
                        return Err(DebugError::IllegalArgument(format!("count {}", count)));
                    }
                    filter.set_count(count);
                }
                EventModifier::ThreadOnly(thread) => {
                    self.threads.checked_thread(thread)?;
                    filter.add_predicate(Predicate::ThreadOnly(thread));
                }
                EventModifier::ClassOnly(class) => filter.add_predicate(Predicate::ClassOnly(class)),
                EventModifier::ClassMatch(pattern) => {
                    filter.add_predicate(Predicate::ClassMatch(ClassPattern::parse(&pattern)))
                }
                EventModifier::ClassExclude(pattern) => {
                    filter.add_predicate(Predicate::ClassExclude(ClassPattern::parse(&pattern)))
                }
                EventModifier::LocationOnly(at) => {
                    location = Some(at);
                    filter.add_predicate(Predicate::LocationOnly(at));
                }
                EventModifier::Step { thread, size, depth } => {
                    let size = StepSize::from_wire(size)
                        .ok_or_else(|| DebugError::IllegalArgument(format!("step size {}", size)))?;
                    let depth = StepDepth::from_wire(depth)
                        .ok_or_else(|| DebugError::IllegalArgument(format!("step depth {}", depth)))?;
                    step = Some((thread, size, depth));
                }
                EventModifier::InstanceOnly(object) => filter.add_predicate(Predicate::InstanceOnly(object)),
                EventModifier::PlatformThreadsOnly => filter.add_predicate(Predicate::PlatformThreadsOnly),
            }
        }

        match request.event_kind {
            event_kinds::BREAKPOINT => {
                let location = location
                    .ok_or_else(|| DebugError::IllegalArgument("breakpoint without location".to_string()))?;
                let filter = Arc::new(filter);
                self.breakpoints.add_line(&filter, location)?;
                self.filters.insert(filter);
                info!(request_id, method = location.method_id, index = location.index, "Breakpoint set");
            }
            event_kinds::METHOD_ENTRY | event_kinds::METHOD_EXIT | event_kinds::METHOD_EXIT_WITH_RETURN_VALUE => {
                let classes: Vec<ClassId> = self
                    .symbols
                    .loaded_classes()
                    .into_iter()
                    .filter(|class| filter.matches_type(*class, self.symbols.as_ref()))
                    .collect();
                let filter = Arc::new(filter);
                let registered = self.breakpoints.add_methods(&filter, &classes)?;
                self.filters.insert(filter);
                info!(request_id, kind = request.event_kind, classes = registered, "Method request set");
            }
            event_kinds::SINGLE_STEP => {
                let (thread, size, depth) =
                    step.ok_or_else(|| DebugError::IllegalArgument("single step without step modifier".to_string()))?;
                let target = self.threads.checked_thread(thread)?;
                let start_location = target
                    .frames()
                    .ok()
                    .and_then(|frames| frames.first().map(|f| f.location))
                    .or_else(|| target.stopped_location());

                self.bridge
                    .set_stepping_from_location(thread, depth, size, start_location)
                    .map_err(DebugError::from)?;
                filter.set_step(StepDescriptor {
                    thread,
                    size,
                    depth,
                    start_location,
                });
                if let Some(old) = self.filters.insert(Arc::new(filter)) {
                    debug!(thread, replaced = old.request_id(), "Step request replaced");
                }
                info!(request_id, thread, "Step request set");
            }
            event_kinds::THREAD_START | event_kinds::THREAD_DEATH | event_kinds::VM_DEATH => {
                if let Some(old) = self.filters.insert(Arc::new(filter)) {
                    debug!(replaced = old.request_id(), "Subscription replaced");
                }
                info!(request_id, kind = request.event_kind, "Subscription set");
            }
            other => return Err(DebugError::NotImplemented(format!("event kind {}", other))),
        }

        Ok(request_id)
    }

    /// EventRequest.Clear. Unknown request ids are ignored.
    pub fn clear_event_request(&self, event_kind: u8, request_id: RequestId) -> DebugResult<()> {
        let Some(filter) = self.filters.get(request_id) else {
            debug!(request_id, "Clear of unknown request ignored");
            return Ok(());
        };
        if filter.event_kind() != event_kind {
            return Err(DebugError::InvalidEventType);
        }

        self.filters.remove(request_id);
        self.breakpoints.remove(request_id);
        if let Some(step) = filter.step() {
            if let Err(err) = self.bridge.clear_stepping(step.thread) {
                debug!(thread = step.thread, "Clearing step failed: {}", err);
            }
        }
        info!(request_id, kind = event_kind, "Event request cleared");
        Ok(())
    }

    /// EventRequest.ClearAllBreakpoints
    pub fn clear_all_breakpoints(&self) {
        let removed = self.filters.remove_kind(event_kinds::BREAKPOINT);
        for filter in &removed {
            self.breakpoints.remove(filter.request_id());
        }
        info!(count = removed.len(), "All breakpoints cleared");
    }
}
