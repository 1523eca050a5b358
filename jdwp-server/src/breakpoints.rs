// Breakpoint registry
//
// Indexes line breakpoints by (method, code index) and method entry/exit
// requests by class. The debuggee instrumentation for a key is switched on
// when its list becomes non-empty and off when it empties, exactly once per
// transition.

use crate::bridge::{BridgeResult, DebuggeeBridge, SymbolLookup};
use crate::commands::event_kinds;
use crate::error::{DebugError, DebugResult};
use crate::filter::RequestFilter;
use crate::types::{ClassId, Location, MethodId, RequestId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointTarget {
    Line(Location),
    MethodEntry(ClassId),
    MethodExit(ClassId),
}

#[derive(Debug)]
pub struct BreakpointInfo {
    filter: Arc<RequestFilter>,
    target: BreakpointTarget,
}

impl BreakpointInfo {
    pub fn new(filter: Arc<RequestFilter>, target: BreakpointTarget) -> Self {
        Self { filter, target }
    }

    pub fn filter(&self) -> &Arc<RequestFilter> {
        &self.filter
    }

    pub fn target(&self) -> BreakpointTarget {
        self.target
    }

    pub fn request_id(&self) -> RequestId {
        self.filter.request_id()
    }

    /// Event kind this entry reports
    pub fn event_kind(&self) -> u8 {
        self.filter.event_kind()
    }
}

type Entries = Vec<Arc<BreakpointInfo>>;

#[derive(Default)]
struct Indices {
    lines: HashMap<(MethodId, u64), Entries>,
    entries: HashMap<ClassId, Entries>,
    exits: HashMap<ClassId, Entries>,
}

pub struct BreakpointRegistry {
    bridge: Arc<dyn DebuggeeBridge>,
    symbols: Arc<dyn SymbolLookup>,
    indices: Mutex<Indices>,
}

/// Push `info` under `key`, enabling the key first if it was empty. A failed
/// enable leaves the index untouched.
fn insert_entry<K, F>(index: &mut HashMap<K, Entries>, key: K, info: Arc<BreakpointInfo>, enable: F) -> BridgeResult<()>
where
    K: Eq + Hash,
    F: FnOnce() -> BridgeResult<()>,
{
    if index.get(&key).map_or(true, Vec::is_empty) {
        enable()?;
    }
    index.entry(key).or_default().push(info);
    Ok(())
}

/// Drop every entry of `request_id`, disabling keys that become empty.
/// Returns the number of entries removed.
fn remove_entries<K, F>(index: &mut HashMap<K, Entries>, request_id: RequestId, mut disable: F) -> usize
where
    K: Eq + Hash + Copy,
    F: FnMut(K),
{
    let mut removed = 0;
    index.retain(|key, entries| {
        let before = entries.len();
        entries.retain(|info| info.request_id() != request_id);
        removed += before - entries.len();

        if entries.is_empty() {
            if before > 0 {
                disable(*key);
            }
            false
        } else {
            true
        }
    });
    removed
}

impl BreakpointRegistry {
    pub fn new(bridge: Arc<dyn DebuggeeBridge>, symbols: Arc<dyn SymbolLookup>) -> Self {
        Self {
            bridge,
            symbols,
            indices: Mutex::new(Indices::default()),
        }
    }

    /// Register a line breakpoint for `filter` at `location`
    pub fn add_line(&self, filter: &Arc<RequestFilter>, location: Location) -> DebugResult<()> {
        self.add_lines(filter, &[location])
    }

    /// Register line breakpoints at every location, all or nothing
    pub fn add_lines(&self, filter: &Arc<RequestFilter>, locations: &[Location]) -> DebugResult<()> {
        if let Some(bad) = locations.iter().find(|l| !self.symbols.is_valid_location(l)) {
            debug!(method = bad.method_id, index = bad.index, "Breakpoint location does not resolve");
            return Err(DebugError::UnknownLocation);
        }

        let mut indices = self.indices.lock();
        for location in locations {
            let info = Arc::new(BreakpointInfo::new(filter.clone(), BreakpointTarget::Line(*location)));
            let (method, index) = location.method_key();
            let added = insert_entry(&mut indices.lines, (method, index), info, || {
                self.bridge.toggle_breakpoint(method, index, true)
            });

            if let Err(err) = added {
                warn!(method, index, "Enabling breakpoint failed: {}", err);
                self.remove_locked(&mut indices, filter.request_id());
                return Err(DebugError::UnknownLocation);
            }
        }
        Ok(())
    }

    /// Register method entry or exit instrumentation for `filter` on each
    /// class. Returns the number of classes registered.
    pub fn add_methods(&self, filter: &Arc<RequestFilter>, classes: &[ClassId]) -> DebugResult<usize> {
        let mut indices = self.indices.lock();

        for class in classes {
            let (target, added) = match filter.event_kind() {
                event_kinds::METHOD_ENTRY => {
                    let info = Arc::new(BreakpointInfo::new(filter.clone(), BreakpointTarget::MethodEntry(*class)));
                    let added = insert_entry(&mut indices.entries, *class, info, || {
                        self.bridge.toggle_method_enter(*class, true)
                    });
                    ("entry", added)
                }
                event_kinds::METHOD_EXIT | event_kinds::METHOD_EXIT_WITH_RETURN_VALUE => {
                    let info = Arc::new(BreakpointInfo::new(filter.clone(), BreakpointTarget::MethodExit(*class)));
                    let added = insert_entry(&mut indices.exits, *class, info, || {
                        self.bridge.toggle_method_exit(*class, true)
                    });
                    ("exit", added)
                }
                other => {
                    return Err(DebugError::Internal(format!("event kind {} is not method based", other)));
                }
            };

            if let Err(err) = added {
                warn!(class = *class, "Enabling method {} events failed: {}", target, err);
                self.remove_locked(&mut indices, filter.request_id());
                return Err(DebugError::from(err));
            }
        }
        Ok(classes.len())
    }

    /// Remove every entry owned by `request_id`. Returns the number removed.
    pub fn remove(&self, request_id: RequestId) -> usize {
        let mut indices = self.indices.lock();
        self.remove_locked(&mut indices, request_id)
    }

    fn remove_locked(&self, indices: &mut Indices, request_id: RequestId) -> usize {
        let bridge = &self.bridge;
        let lines = remove_entries(&mut indices.lines, request_id, |(method, index)| {
            if let Err(err) = bridge.toggle_breakpoint(method, index, false) {
                warn!(method, index, "Disabling breakpoint failed: {}", err);
            }
        });
        let entries = remove_entries(&mut indices.entries, request_id, |class| {
            if let Err(err) = bridge.toggle_method_enter(class, false) {
                warn!(class, "Disabling method entry events failed: {}", err);
            }
        });
        let exits = remove_entries(&mut indices.exits, request_id, |class| {
            if let Err(err) = bridge.toggle_method_exit(class, false) {
                warn!(class, "Disabling method exit events failed: {}", err);
            }
        });
        lines + entries + exits
    }

    /// Drop every line breakpoint. Returns the request ids that owned them.
    pub fn remove_all_lines(&self) -> Vec<RequestId> {
        let mut indices = self.indices.lock();
        let mut owners: Vec<RequestId> = Vec::new();

        for ((method, index), entries) in indices.lines.drain() {
            owners.extend(entries.iter().map(|info| info.request_id()));
            if let Err(err) = self.bridge.toggle_breakpoint(method, index, false) {
                warn!(method, index, "Disabling breakpoint failed: {}", err);
            }
        }

        owners.sort_unstable();
        owners.dedup();
        owners
    }

    /// Disable and forget everything
    pub fn dispose(&self) {
        self.remove_all_lines();

        let mut indices = self.indices.lock();
        for class in indices.entries.drain().map(|(class, _)| class) {
            if let Err(err) = self.bridge.toggle_method_enter(class, false) {
                debug!(class, "Disabling method entry events failed: {}", err);
            }
        }
        for class in indices.exits.drain().map(|(class, _)| class) {
            if let Err(err) = self.bridge.toggle_method_exit(class, false) {
                debug!(class, "Disabling method exit events failed: {}", err);
            }
        }
    }

    pub fn lines_at(&self, location: &Location) -> Vec<Arc<BreakpointInfo>> {
        self.indices
            .lock()
            .lines
            .get(&location.method_key())
            .cloned()
            .unwrap_or_default()
    }

    pub fn method_entries(&self, class: ClassId) -> Vec<Arc<BreakpointInfo>> {
        self.indices.lock().entries.get(&class).cloned().unwrap_or_default()
    }

    pub fn method_exits(&self, class: ClassId) -> Vec<Arc<BreakpointInfo>> {
        self.indices.lock().exits.get(&class).cloned().unwrap_or_default()
    }

    pub fn is_line_enabled(&self, location: &Location) -> bool {
        self.indices.lock().lines.contains_key(&location.method_key())
    }
}
