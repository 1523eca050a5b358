// Thread registry
//
// Owns every `DebuggeeThread` of a session and implements the VM-wide
// operations: global suspend/resume sweeps, the ALL suspend policy, blocking
// new threads while the VM is suspended, and invocation brackets.

use crate::bridge::{BridgeError, DebuggeeBridge};
use crate::error::{DebugError, DebugResult};
use crate::stackframe::{CallFrame, SuspendedSnapshot};
use crate::thread::{Completion, DebuggeeThread, ThreadContext};
use crate::types::{FrameId, SuspendStatus, ThreadId, ThreadStatus, NULL_OBJECT};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ThreadRegistry {
    ctx: Arc<ThreadContext>,
    threads: Mutex<HashMap<ThreadId, Arc<DebuggeeThread>>>,
    /// Outstanding VM-wide suspensions. Written under the exclusive
    /// coordination lock.
    vm_suspensions: AtomicU32,
}

impl ThreadRegistry {
    pub fn new(bridge: Arc<dyn DebuggeeBridge>) -> Self {
        Self {
            ctx: Arc::new(ThreadContext::new(bridge)),
            threads: Mutex::new(HashMap::new()),
            vm_suspensions: AtomicU32::new(0),
        }
    }

    pub fn bridge(&self) -> &Arc<dyn DebuggeeBridge> {
        &self.ctx.bridge
    }

    pub fn is_disposed(&self) -> bool {
        self.ctx.is_disposed()
    }

    pub fn vm_suspensions(&self) -> u32 {
        self.vm_suspensions.load(Ordering::SeqCst)
    }

    /// Lookup-or-create, for ids that come from the debuggee itself
    pub fn thread(&self, id: ThreadId) -> Arc<DebuggeeThread> {
        let mut threads = self.threads.lock();
        threads
            .entry(id)
            .or_insert_with(|| Arc::new(DebuggeeThread::new(id, self.ctx.clone())))
            .clone()
    }

    /// Lookup-or-create for ids supplied by the client. Ids the registry has
    /// never seen are checked with the bridge first.
    pub fn checked_thread(&self, id: ThreadId) -> DebugResult<Arc<DebuggeeThread>> {
        if id == NULL_OBJECT {
            return Err(DebugError::InvalidThread);
        }
        if let Some(thread) = self.threads.lock().get(&id) {
            return Ok(thread.clone());
        }

        match self.ctx.bridge.thread_status(id) {
            Ok(_) => Ok(self.thread(id)),
            Err(BridgeError::Disposed) => Err(DebugError::VmDead),
            Err(_) => Err(DebugError::InvalidThread),
        }
    }

    pub fn known_threads(&self) -> Vec<Arc<DebuggeeThread>> {
        self.threads.lock().values().cloned().collect()
    }

    fn seed_from_bridge(&self) -> Vec<Arc<DebuggeeThread>> {
        for id in self.ctx.bridge.all_threads() {
            self.thread(id);
        }
        self.known_threads()
    }

    pub fn suspend_thread(&self, id: ThreadId) -> DebugResult<()> {
        if self.is_disposed() {
            return Ok(());
        }
        self.checked_thread(id)?.suspend()
    }

    pub fn resume_thread(&self, id: ThreadId) -> DebugResult<()> {
        if self.is_disposed() {
            return Ok(());
        }
        self.checked_thread(id)?.resume(false)
    }

    pub fn suspend_count(&self, id: ThreadId) -> DebugResult<u32> {
        Ok(self.checked_thread(id)?.suspend_count())
    }

    pub fn thread_status(&self, id: ThreadId) -> DebugResult<(ThreadStatus, SuspendStatus)> {
        let thread = self.checked_thread(id)?;
        let status = if thread.is_parked() {
            // Blocked inside the server, the runtime sees it as running
            ThreadStatus::Running
        } else {
            self.ctx.bridge.thread_status(id).map_err(|err| match err {
                BridgeError::UnknownThread(_) => DebugError::InvalidThread,
                other => DebugError::from(other),
            })?
        };

        let suspended = if thread.is_suspended() {
            SuspendStatus::Suspended
        } else {
            SuspendStatus::Running
        };
        Ok((status, suspended))
    }

    /// Frames `start..start+length`; a negative length means all remaining
    pub fn frames(&self, id: ThreadId, start: i32, length: i32) -> DebugResult<Vec<CallFrame>> {
        let frames = self.checked_thread(id)?.frames()?;

        let start = usize::try_from(start)
            .ok()
            .filter(|s| *s <= frames.len())
            .ok_or_else(|| DebugError::IllegalArgument(format!("invalid start frame {}", start)))?;
        let available = frames.len() - start;
        let length = if length < 0 {
            available
        } else {
            (length as usize).min(available)
        };

        Ok(frames[start..start + length].to_vec())
    }

    pub fn frame_count(&self, id: ThreadId) -> DebugResult<usize> {
        Ok(self.checked_thread(id)?.frames()?.len())
    }

    /// Resolve a client frame id to its depth on `id`'s current stack
    pub fn validate_frame(&self, id: ThreadId, frame_id: FrameId) -> DebugResult<u32> {
        self.checked_thread(id)?.frame_depth(frame_id)
    }

    pub fn suspend_all(&self) {
        if self.is_disposed() {
            return;
        }
        let _exclusive = self.ctx.coordination.write();
        self.vm_suspensions.fetch_add(1, Ordering::SeqCst);

        let threads = self.seed_from_bridge();
        self.suspend_sweep(&threads);
        info!(threads = threads.len(), "VM suspended");
    }

    pub fn resume_all(&self) {
        if self.is_disposed() {
            return;
        }
        let _exclusive = self.ctx.coordination.write();
        let _ = self
            .vm_suspensions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        let threads = self.known_threads();
        self.resume_sweep(&threads);
        info!(threads = threads.len(), "VM resumed");
    }

    /// Count one suspension on every thread, stopping the running ones with a
    /// single batched bridge call. Caller holds the coordination lock
    /// exclusively.
    fn suspend_sweep(&self, threads: &[Arc<DebuggeeThread>]) {
        let running: Vec<&Arc<DebuggeeThread>> = threads
            .iter()
            .filter(|t| !t.notify_suspended_if_stopped())
            .collect();
        if running.is_empty() {
            return;
        }

        let ids: Vec<ThreadId> = running.iter().map(|t| t.id()).collect();
        match self.ctx.bridge.vm_suspend(&ids) {
            Ok(stopped) => {
                for thread in running {
                    thread.notify_suspended(stopped.contains(&thread.id()));
                }
            }
            Err(BridgeError::Disposed) => debug!("Debuggee disposed during suspend sweep"),
            Err(err) => warn!("Batched suspend failed: {}", err),
        }
    }

    /// Drop one suspension on every thread. Caller holds the coordination
    /// lock exclusively.
    fn resume_sweep(&self, threads: &[Arc<DebuggeeThread>]) {
        let owed: Vec<ThreadId> = threads
            .iter()
            .filter(|t| t.notify_resumed())
            .map(|t| t.id())
            .collect();
        if owed.is_empty() {
            return;
        }

        match self.ctx.bridge.vm_resume(&owed) {
            Ok(()) => {}
            Err(BridgeError::Disposed) => debug!("Debuggee disposed during resume sweep"),
            Err(err) => warn!("Batched resume failed: {}", err),
        }
    }

    /// EVENT_THREAD policy: park only the event thread
    pub fn suspended_at<F: FnOnce()>(&self, target: ThreadId, snapshot: SuspendedSnapshot, event_sender: F) {
        self.thread(target).suspended_at(snapshot, event_sender);
    }

    /// ALL policy: stop every other thread, then park the event thread. The
    /// event is handed to `event_sender` only after all of that is recorded.
    pub fn suspend_all_at<F: FnOnce()>(&self, target: ThreadId, snapshot: SuspendedSnapshot, event_sender: F) {
        if self.is_disposed() {
            event_sender();
            return;
        }
        let thread = self.thread(target);
        {
            let _exclusive = self.ctx.coordination.write();
            self.vm_suspensions.fetch_add(1, Ordering::SeqCst);

            let others: Vec<Arc<DebuggeeThread>> = self
                .seed_from_bridge()
                .into_iter()
                .filter(|t| t.id() != target)
                .collect();
            self.suspend_sweep(&others);
            thread.mark_parked(1, Some(snapshot));
        }
        event_sender();
        thread.park();
    }

    /// Called on a freshly started thread. Parks it when the VM is
    /// suspended, carrying one suspension per outstanding VM suspend.
    pub fn block_if_vm_suspended(&self, id: ThreadId) {
        if self.is_disposed() {
            return;
        }
        let thread = self.thread(id);
        {
            let _shared = self.ctx.coordination.read();
            let outstanding = self.vm_suspensions.load(Ordering::SeqCst);
            if outstanding == 0 {
                return;
            }
            thread.mark_parked_for_vm(outstanding);
        }
        debug!(thread = id, "New thread blocked by VM suspension");
        thread.park();
    }

    /// Run `call` on the parked thread `id` and hand its result to `reply`.
    /// Unless `single_threaded`, every other suspended thread is resumed
    /// once for the duration of the call and suspended again afterwards.
    /// `reply` runs once the invoking thread is back at its original
    /// suspension.
    pub fn invoke<T, C, R>(self: &Arc<Self>, id: ThreadId, single_threaded: bool, call: C, reply: R) -> DebugResult<()>
    where
        T: Send + 'static,
        C: FnOnce() -> T + Send + 'static,
        R: FnOnce(T) + Send + 'static,
    {
        let thread = self.checked_thread(id)?;
        let registry = Arc::clone(self);

        thread.post_invocation(Box::new(move || {
            let resumed = if single_threaded {
                Vec::new()
            } else {
                registry.resume_others(id)
            };
            let result = call();
            registry.suspend_again(&resumed);
            Box::new(move || reply(result)) as Completion
        }))
    }

    /// Leaves `vm_suspensions` raised. A thread starting during the call
    /// stays blocked in `block_if_vm_suspended` until the VM is resumed.
    fn resume_others(&self, except: ThreadId) -> Vec<Arc<DebuggeeThread>> {
        if self.is_disposed() {
            return Vec::new();
        }
        let _exclusive = self.ctx.coordination.write();
        let touched: Vec<Arc<DebuggeeThread>> = self
            .known_threads()
            .into_iter()
            .filter(|t| t.id() != except && t.is_suspended())
            .collect();
        self.resume_sweep(&touched);
        touched
    }

    fn suspend_again(&self, threads: &[Arc<DebuggeeThread>]) {
        if self.is_disposed() || threads.is_empty() {
            return;
        }
        let _exclusive = self.ctx.coordination.write();
        self.suspend_sweep(threads);
    }

    /// Session teardown: release every thread, forget them all and turn
    /// later suspend/resume calls into no-ops.
    pub fn release_all_threads_and_dispose(&self) {
        let _exclusive = self.ctx.coordination.write();
        if self.ctx.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.vm_suspensions.store(0, Ordering::SeqCst);

        let threads: Vec<Arc<DebuggeeThread>> = self.threads.lock().drain().map(|(_, t)| t).collect();
        let owed: Vec<ThreadId> = threads
            .iter()
            .filter(|t| t.force_release())
            .map(|t| t.id())
            .collect();

        if !owed.is_empty() {
            if let Err(err) = self.ctx.bridge.vm_resume(&owed) {
                debug!("Resume during dispose failed: {}", err);
            }
        }
        info!(threads = threads.len(), "Released all threads");
    }
}
