// Event request filters
//
// Every accepted EventRequest.Set becomes a `RequestFilter`: the event kind,
// its suspend policy and the conjunction of its modifiers. `FilterIndex`
// owns all live filters of a session.

use crate::bridge::{StepDepth, StepSize, SymbolLookup};
use crate::commands::event_kinds;
use crate::eventrequest::SuspendPolicy;
use crate::types::{ClassId, Location, ObjectId, RequestId, ThreadId, NULL_OBJECT};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Class name pattern: exact, `prefix*` or `*suffix`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassPattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
}

impl ClassPattern {
    pub fn parse(pattern: &str) -> Self {
        if let Some(prefix) = pattern.strip_suffix('*') {
            ClassPattern::Prefix(prefix.to_string())
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            ClassPattern::Suffix(suffix.to_string())
        } else {
            ClassPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            ClassPattern::Exact(exact) => name == exact,
            ClassPattern::Prefix(prefix) => name.starts_with(prefix.as_str()),
            ClassPattern::Suffix(suffix) => name.ends_with(suffix.as_str()),
        }
    }
}

/// Something that happened in the debuggee, as seen by the filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub thread: ThreadId,
    pub location: Option<Location>,
    /// Receiver of the executing method, `NULL_OBJECT` for static code
    pub this_object: ObjectId,
}

impl Occurrence {
    pub fn at(thread: ThreadId, location: Location, this_object: ObjectId) -> Self {
        Self {
            thread,
            location: Some(location),
            this_object,
        }
    }

    pub fn thread_only(thread: ThreadId) -> Self {
        Self {
            thread,
            location: None,
            this_object: NULL_OBJECT,
        }
    }

    fn class_id(&self) -> Option<ClassId> {
        self.location.map(|l| l.class_id)
    }
}

/// One non-count modifier of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    ClassMatch(ClassPattern),
    ClassExclude(ClassPattern),
    ThreadOnly(ThreadId),
    ClassOnly(ClassId),
    LocationOnly(Location),
    InstanceOnly(ObjectId),
    PlatformThreadsOnly,
}

impl Predicate {
    fn matches(&self, occurrence: &Occurrence, symbols: &dyn SymbolLookup) -> bool {
        match self {
            Predicate::ThreadOnly(thread) => occurrence.thread == *thread,
            Predicate::LocationOnly(location) => occurrence
                .location
                .is_some_and(|l| l.class_id == location.class_id && l.method_key() == location.method_key()),
            Predicate::InstanceOnly(object) => occurrence.this_object == *object,
            Predicate::PlatformThreadsOnly => !symbols.is_virtual_thread(occurrence.thread),
            Predicate::ClassMatch(_) | Predicate::ClassExclude(_) | Predicate::ClassOnly(_) => {
                match occurrence.class_id() {
                    Some(class_id) => self.matches_type(class_id, symbols),
                    // Thread and VM events carry no class
                    None => true,
                }
            }
        }
    }

    fn matches_type(&self, class_id: ClassId, symbols: &dyn SymbolLookup) -> bool {
        match self {
            Predicate::ClassMatch(pattern) => symbols
                .class_name(class_id)
                .is_some_and(|name| pattern.matches(&name)),
            Predicate::ClassExclude(pattern) => !symbols
                .class_name(class_id)
                .is_some_and(|name| pattern.matches(&name)),
            Predicate::ClassOnly(class) => symbols.is_assignable(class_id, *class),
            Predicate::LocationOnly(location) => location.class_id == class_id,
            Predicate::ThreadOnly(_) | Predicate::InstanceOnly(_) | Predicate::PlatformThreadsOnly => true,
        }
    }
}

/// Step parameters of a single-step request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDescriptor {
    pub thread: ThreadId,
    pub size: StepSize,
    pub depth: StepDepth,
    /// Where the current step started, moved on every reported step
    pub start_location: Option<Location>,
}

#[derive(Debug)]
pub struct RequestFilter {
    request_id: RequestId,
    event_kind: u8,
    suspend_policy: SuspendPolicy,
    predicates: Vec<Predicate>,
    count: Option<AtomicI32>,
    step: Option<Mutex<StepDescriptor>>,
    expired: AtomicBool,
}

impl RequestFilter {
    pub fn new(request_id: RequestId, event_kind: u8, suspend_policy: SuspendPolicy) -> Self {
        Self {
            request_id,
            event_kind,
            suspend_policy,
            predicates: Vec::new(),
            count: None,
            step: None,
            expired: AtomicBool::new(false),
        }
    }

    pub fn add_predicate(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    /// Report only the `count`th matching occurrence
    pub fn set_count(&mut self, count: i32) {
        self.count = Some(AtomicI32::new(count));
    }

    pub fn set_step(&mut self, step: StepDescriptor) {
        self.step = Some(Mutex::new(step));
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn event_kind(&self) -> u8 {
        self.event_kind
    }

    pub fn suspend_policy(&self) -> SuspendPolicy {
        self.suspend_policy
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    pub fn step(&self) -> Option<StepDescriptor> {
        self.step.as_ref().map(|step| *step.lock())
    }

    pub fn set_step_start(&self, location: Location) {
        if let Some(step) = &self.step {
            step.lock().start_location = Some(location);
        }
    }

    /// Whether `occurrence` satisfies every modifier. The count modifier is
    /// consulted last, and only when everything else matched.
    pub fn is_hit(&self, occurrence: &Occurrence, symbols: &dyn SymbolLookup) -> bool {
        if self.is_expired() {
            return false;
        }
        if !self.predicates.iter().all(|p| p.matches(occurrence, symbols)) {
            return false;
        }

        match &self.count {
            None => true,
            Some(remaining) => {
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.expired.store(true, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Whether the class-scoped modifiers admit `class_id`
    pub fn matches_type(&self, class_id: ClassId, symbols: &dyn SymbolLookup) -> bool {
        self.predicates.iter().all(|p| p.matches_type(class_id, symbols))
    }
}

#[derive(Default)]
struct FilterTables {
    by_id: HashMap<RequestId, Arc<RequestFilter>>,
    steps: HashMap<ThreadId, Arc<RequestFilter>>,
    thread_start: Option<Arc<RequestFilter>>,
    thread_death: Option<Arc<RequestFilter>>,
    vm_death: Option<Arc<RequestFilter>>,
}

impl FilterTables {
    fn subscription_slot(&mut self, kind: u8) -> Option<&mut Option<Arc<RequestFilter>>> {
        match kind {
            event_kinds::THREAD_START => Some(&mut self.thread_start),
            event_kinds::THREAD_DEATH => Some(&mut self.thread_death),
            event_kinds::VM_DEATH => Some(&mut self.vm_death),
            _ => None,
        }
    }

    fn unlink(&mut self, filter: &RequestFilter) {
        if let Some(step) = filter.step() {
            if self
                .steps
                .get(&step.thread)
                .is_some_and(|f| f.request_id() == filter.request_id())
            {
                self.steps.remove(&step.thread);
            }
        }
        if let Some(slot) = self.subscription_slot(filter.event_kind()) {
            if slot.as_ref().is_some_and(|f| f.request_id() == filter.request_id()) {
                *slot = None;
            }
        }
    }
}

/// All live request filters of a session
#[derive(Default)]
pub struct FilterIndex {
    next_id: AtomicI32,
    tables: Mutex<FilterTables>,
}

impl FilterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request ids start at 1; 0 is reserved for automatic events
    pub fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a filter. A single-step filter replaces the thread's previous
    /// one, and thread start/death and VM death filters replace the previous
    /// subscription of their kind; the replaced filter is returned.
    pub fn insert(&self, filter: Arc<RequestFilter>) -> Option<Arc<RequestFilter>> {
        let mut tables = self.tables.lock();

        let replaced = if let Some(step) = filter.step() {
            tables.steps.insert(step.thread, filter.clone())
        } else if let Some(slot) = tables.subscription_slot(filter.event_kind()) {
            slot.replace(filter.clone())
        } else {
            None
        };

        if let Some(old) = &replaced {
            tables.by_id.remove(&old.request_id());
        }
        tables.by_id.insert(filter.request_id(), filter);
        replaced
    }

    pub fn get(&self, request_id: RequestId) -> Option<Arc<RequestFilter>> {
        self.tables.lock().by_id.get(&request_id).cloned()
    }

    pub fn remove(&self, request_id: RequestId) -> Option<Arc<RequestFilter>> {
        let mut tables = self.tables.lock();
        let filter = tables.by_id.remove(&request_id)?;
        tables.unlink(&filter);
        Some(filter)
    }

    /// Remove every filter of `event_kind`
    pub fn remove_kind(&self, event_kind: u8) -> Vec<Arc<RequestFilter>> {
        let mut tables = self.tables.lock();
        let ids: Vec<RequestId> = tables
            .by_id
            .values()
            .filter(|f| f.event_kind() == event_kind)
            .map(|f| f.request_id())
            .collect();

        ids.into_iter()
            .filter_map(|id| {
                let filter = tables.by_id.remove(&id)?;
                tables.unlink(&filter);
                Some(filter)
            })
            .collect()
    }

    pub fn step_for(&self, thread: ThreadId) -> Option<Arc<RequestFilter>> {
        self.tables.lock().steps.get(&thread).cloned()
    }

    pub fn thread_start(&self) -> Option<Arc<RequestFilter>> {
        self.tables.lock().thread_start.clone()
    }

    pub fn thread_death(&self) -> Option<Arc<RequestFilter>> {
        self.tables.lock().thread_death.clone()
    }

    pub fn vm_death(&self) -> Option<Arc<RequestFilter>> {
        self.tables.lock().vm_death.clone()
    }

    pub fn clear(&self) -> Vec<Arc<RequestFilter>> {
        let mut tables = self.tables.lock();
        let filters = tables.by_id.drain().map(|(_, f)| f).collect();
        *tables = FilterTables::default();
        filters
    }

    pub fn len(&self) -> usize {
        self.tables.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FakeDebuggee;

    fn symbols() -> FakeDebuggee {
        let vm = FakeDebuggee::new();
        vm.add_class(1, "java.lang.Object", None);
        vm.add_class(2, "com.example.Service", Some(1));
        vm.add_class(3, "com.example.ServiceImpl", Some(2));
        vm.add_class(4, "org.other.Helper", Some(1));
        vm
    }

    fn breakpoint_filter(id: RequestId) -> RequestFilter {
        RequestFilter::new(id, event_kinds::BREAKPOINT, SuspendPolicy::EventThread)
    }

    #[test]
    fn test_class_patterns() {
        assert!(ClassPattern::parse("com.example.*").matches("com.example.Service"));
        assert!(ClassPattern::parse("*Impl").matches("com.example.ServiceImpl"));
        assert!(ClassPattern::parse("java.lang.Object").matches("java.lang.Object"));
        assert!(!ClassPattern::parse("java.lang.Object").matches("java.lang.ObjectX"));
        assert!(ClassPattern::parse("*").matches("anything"));
    }

    #[test]
    fn test_predicates_are_conjunctive() {
        let vm = symbols();
        let mut filter = breakpoint_filter(1);
        filter.add_predicate(Predicate::ClassMatch(ClassPattern::parse("com.example.*")));
        filter.add_predicate(Predicate::ThreadOnly(7));

        assert!(filter.is_hit(&Occurrence::at(7, Location::new(2, 1, 0), 0), &vm));
        assert!(!filter.is_hit(&Occurrence::at(8, Location::new(2, 1, 0), 0), &vm));
        assert!(!filter.is_hit(&Occurrence::at(7, Location::new(4, 1, 0), 0), &vm));
    }

    #[test]
    fn test_count_reports_only_nth_hit() {
        let vm = symbols();
        let mut filter = breakpoint_filter(1);
        filter.set_count(3);

        let occurrence = Occurrence::at(1, Location::new(2, 1, 0), 0);
        let hits: Vec<bool> = (0..5).map(|_| filter.is_hit(&occurrence, &vm)).collect();

        assert_eq!(hits, vec![false, false, true, false, false]);
        assert!(filter.is_expired());
    }

    #[test]
    fn test_count_only_consumed_by_matching_occurrences() {
        let vm = symbols();
        let mut filter = breakpoint_filter(1);
        filter.add_predicate(Predicate::ThreadOnly(1));
        filter.set_count(2);

        let other = Occurrence::at(2, Location::new(2, 1, 0), 0);
        let mine = Occurrence::at(1, Location::new(2, 1, 0), 0);

        assert!(!filter.is_hit(&other, &vm));
        assert!(!filter.is_hit(&other, &vm));
        assert!(!filter.is_hit(&mine, &vm));
        assert!(filter.is_hit(&mine, &vm));
    }

    #[test]
    fn test_class_only_uses_assignability() {
        let vm = symbols();
        let mut filter = breakpoint_filter(1);
        filter.add_predicate(Predicate::ClassOnly(2));

        assert!(filter.matches_type(3, &vm));
        assert!(filter.matches_type(2, &vm));
        assert!(!filter.matches_type(4, &vm));
    }

    #[test]
    fn test_exclude_and_instance_predicates() {
        let vm = symbols();
        vm.set_virtual(9);
        let mut filter = breakpoint_filter(1);
        filter.add_predicate(Predicate::ClassExclude(ClassPattern::parse("org.*")));
        filter.add_predicate(Predicate::InstanceOnly(0x55));
        filter.add_predicate(Predicate::PlatformThreadsOnly);

        assert!(filter.is_hit(&Occurrence::at(1, Location::new(3, 1, 0), 0x55), &vm));
        assert!(!filter.is_hit(&Occurrence::at(1, Location::new(3, 1, 0), 0x56), &vm));
        assert!(!filter.is_hit(&Occurrence::at(1, Location::new(4, 1, 0), 0x55), &vm));
        assert!(!filter.is_hit(&Occurrence::at(9, Location::new(3, 1, 0), 0x55), &vm));
    }

    #[test]
    fn test_request_ids_start_at_one() {
        let index = FilterIndex::new();
        assert_eq!(index.next_request_id(), 1);
        assert_eq!(index.next_request_id(), 2);
    }

    #[test]
    fn test_subscription_replaces_previous() {
        let index = FilterIndex::new();
        let first = Arc::new(RequestFilter::new(1, event_kinds::THREAD_START, SuspendPolicy::None));
        let second = Arc::new(RequestFilter::new(2, event_kinds::THREAD_START, SuspendPolicy::All));

        assert!(index.insert(first).is_none());
        let replaced = index.insert(second).unwrap();

        assert_eq!(replaced.request_id(), 1);
        assert!(index.get(1).is_none());
        assert_eq!(index.thread_start().unwrap().request_id(), 2);
        assert_eq!(index.len(), 1);

        index.remove(2);
        assert!(index.thread_start().is_none());
    }

    #[test]
    fn test_step_filters_are_per_thread() {
        let index = FilterIndex::new();
        let step = |id, thread| {
            let mut filter = RequestFilter::new(id, event_kinds::SINGLE_STEP, SuspendPolicy::EventThread);
            filter.set_step(StepDescriptor {
                thread,
                size: StepSize::Line,
                depth: StepDepth::Over,
                start_location: None,
            });
            Arc::new(filter)
        };

        index.insert(step(1, 10));
        index.insert(step(2, 20));
        let replaced = index.insert(step(3, 10)).unwrap();

        assert_eq!(replaced.request_id(), 1);
        assert_eq!(index.step_for(10).unwrap().request_id(), 3);
        assert_eq!(index.step_for(20).unwrap().request_id(), 2);

        let removed = index.remove_kind(event_kinds::SINGLE_STEP);
        assert_eq!(removed.len(), 2);
        assert!(index.step_for(10).is_none());
        assert!(index.is_empty());
    }
}
