// Per-thread suspension state
//
// A debuggee thread is in one of four states:
//   running          suspend_count == 0
//   remote           suspend_count > 0, stopped by the bridge
//   parked           suspend_count > 0, blocked inside `park`
//   invoking         running a client invocation while logically suspended
//
// Lock order: `ThreadContext::coordination` (shared or exclusive) before the
// per-thread state mutex. The coordination lock is never held while parked.

use crate::bridge::{BridgeError, DebuggeeBridge};
use crate::error::{DebugError, DebugResult};
use crate::stackframe::{CallFrame, FrameGenerations, SuspendedSnapshot};
use crate::types::{FrameId, Location, ThreadId};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs after the invoking thread's suspension is restored
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Work executed on a parked thread on behalf of the client
pub type InvocationTask = Box<dyn FnOnce() -> Completion + Send + 'static>;

/// State shared by every thread of one session
pub(crate) struct ThreadContext {
    pub(crate) bridge: Arc<dyn DebuggeeBridge>,
    pub(crate) coordination: RwLock<()>,
    pub(crate) generations: FrameGenerations,
    pub(crate) disposed: AtomicBool,
}

impl ThreadContext {
    pub(crate) fn new(bridge: Arc<dyn DebuggeeBridge>) -> Self {
        Self {
            bridge,
            coordination: RwLock::new(()),
            generations: FrameGenerations::default(),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ThreadState {
    suspend_count: u32,
    /// Suspensions in `suspend_count` that came from VM-wide sweeps
    vm_counted: u32,
    parked: bool,
    remote: bool,
    invoking: bool,
    snapshot: Option<SuspendedSnapshot>,
    pending: Option<InvocationTask>,
}

/// Bookkeeping saved while a parked thread runs an invocation
struct SavedSuspension {
    suspend_count: u32,
    snapshot: Option<SuspendedSnapshot>,
}

pub struct DebuggeeThread {
    id: ThreadId,
    ctx: Arc<ThreadContext>,
    state: Mutex<ThreadState>,
    wake: Condvar,
}

impl fmt::Debug for DebuggeeThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DebuggeeThread")
            .field("id", &self.id)
            .field("suspend_count", &state.suspend_count)
            .field("parked", &state.parked)
            .field("remote", &state.remote)
            .field("invoking", &state.invoking)
            .finish()
    }
}

impl DebuggeeThread {
    pub(crate) fn new(id: ThreadId, ctx: Arc<ThreadContext>) -> Self {
        Self {
            id,
            ctx,
            state: Mutex::new(ThreadState::default()),
            wake: Condvar::new(),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn suspend_count(&self) -> u32 {
        self.state.lock().suspend_count
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_count() > 0
    }

    pub fn is_parked(&self) -> bool {
        self.state.lock().parked
    }

    pub fn is_invoking(&self) -> bool {
        self.state.lock().invoking
    }

    /// Location the thread is stopped at, if it stopped at one
    pub fn stopped_location(&self) -> Option<Location> {
        self.state.lock().snapshot.as_ref().and_then(SuspendedSnapshot::location)
    }

    /// Client-requested suspension
    pub fn suspend(&self) -> DebugResult<()> {
        if self.ctx.is_disposed() {
            return Ok(());
        }
        let _shared = self.ctx.coordination.read();
        let mut state = self.state.lock();

        if state.suspend_count == 0 && !state.parked {
            match self.ctx.bridge.suspend_thread(self.id) {
                Ok(()) => state.remote = true,
                Err(BridgeError::UnknownThread(_)) => return Err(DebugError::InvalidThread),
                Err(BridgeError::Disposed) => return Ok(()),
                Err(err) => {
                    warn!(thread = self.id, "Bridge failed to suspend thread: {}", err);
                    return Err(DebugError::InvalidObject);
                }
            }
        }

        state.suspend_count += 1;
        debug!(thread = self.id, count = state.suspend_count, "Thread suspended");
        Ok(())
    }

    /// Client-requested resume. `force_release` drops every outstanding
    /// suspension at once.
    pub fn resume(&self, force_release: bool) -> DebugResult<()> {
        if self.ctx.is_disposed() {
            return Ok(());
        }
        let _shared = self.ctx.coordination.read();
        let mut state = self.state.lock();

        if state.suspend_count == 0 {
            return Ok(());
        }
        if force_release {
            state.suspend_count = 1;
        }

        let owes_bridge = self.release_one(&mut state);
        debug!(thread = self.id, count = state.suspend_count, "Thread resumed");
        if owes_bridge {
            match self.ctx.bridge.resume_thread(self.id) {
                Ok(()) | Err(BridgeError::Disposed) => {}
                Err(BridgeError::UnknownThread(_)) => return Err(DebugError::InvalidThread),
                Err(err) => return Err(DebugError::Internal(err.to_string())),
            }
        }
        Ok(())
    }

    /// Drop one suspension. Returns true when the count reached zero on a
    /// thread the bridge stopped, so the caller owes the bridge a resume.
    fn release_one(&self, state: &mut ThreadState) -> bool {
        state.suspend_count -= 1;
        state.vm_counted = state.vm_counted.min(state.suspend_count);
        if state.suspend_count > 0 {
            return false;
        }

        state.snapshot = None;
        if state.parked {
            self.wake.notify_all();
            false
        } else {
            std::mem::take(&mut state.remote)
        }
    }

    /// Sweep bookkeeping: count the suspension if the thread is already
    /// stopped. Returns false when the bridge still has to stop it. Caller
    /// holds the coordination lock exclusively.
    pub(crate) fn notify_suspended_if_stopped(&self) -> bool {
        let mut state = self.state.lock();
        if state.suspend_count > 0 || state.parked {
            state.suspend_count += 1;
            state.vm_counted += 1;
            true
        } else {
            false
        }
    }

    /// Sweep bookkeeping after a batched bridge suspension
    pub(crate) fn notify_suspended(&self, stopped_by_bridge: bool) {
        let mut state = self.state.lock();
        state.suspend_count += 1;
        state.vm_counted += 1;
        state.remote |= stopped_by_bridge;
    }

    /// Sweep bookkeeping for a global resume. Returns true when the bridge
    /// must resume the thread.
    pub(crate) fn notify_resumed(&self) -> bool {
        let mut state = self.state.lock();
        if state.suspend_count == 0 {
            return false;
        }
        state.vm_counted = state.vm_counted.saturating_sub(1);
        self.release_one(&mut state)
    }

    /// Drop every suspension and any queued invocation. Returns true when
    /// the bridge must resume the thread.
    pub(crate) fn force_release(&self) -> bool {
        let mut state = self.state.lock();
        state.pending = None;
        if state.suspend_count == 0 {
            return false;
        }
        state.suspend_count = 1;
        self.release_one(&mut state)
    }

    /// Record that the thread is about to park itself with `count` extra
    /// suspensions. Caller holds the coordination lock.
    pub(crate) fn mark_parked(&self, count: u32, snapshot: Option<SuspendedSnapshot>) {
        let mut state = self.state.lock();
        self.park_locked(&mut state, count, snapshot);
    }

    /// Bring the thread up to `outstanding` VM-wide suspensions and mark it
    /// parked. Sweeps that ran before the thread was known did not count it.
    /// Caller holds the coordination lock.
    pub(crate) fn mark_parked_for_vm(&self, outstanding: u32) {
        let mut state = self.state.lock();
        let missing = outstanding.saturating_sub(state.vm_counted);
        state.vm_counted += missing;
        self.park_locked(&mut state, missing, None);
    }

    fn park_locked(&self, state: &mut ThreadState, count: u32, snapshot: Option<SuspendedSnapshot>) {
        if state.remote {
            // The thread blocks in `park` now, the runtime must let it go
            if let Err(err) = self.ctx.bridge.resume_thread(self.id) {
                debug!(thread = self.id, "Cancelling remote suspension failed: {}", err);
            }
            state.remote = false;
        }
        state.suspend_count += count;
        state.parked = true;
        if snapshot.is_some() {
            state.snapshot = snapshot;
        }
    }

    /// Park on an event: mark suspended, hand the event out, then block until
    /// resumed.
    pub fn suspended_at<F>(&self, snapshot: SuspendedSnapshot, event_sender: F)
    where
        F: FnOnce(),
    {
        if self.ctx.is_disposed() {
            event_sender();
            return;
        }
        {
            let _shared = self.ctx.coordination.read();
            self.mark_parked(1, Some(snapshot));
        }
        event_sender();
        self.park();
    }

    /// Block the calling debuggee thread until its suspend count is zero,
    /// running invocations posted to it in the meantime.
    pub(crate) fn park(&self) {
        loop {
            {
                let mut state = self.state.lock();
                while state.suspend_count > 0 && state.pending.is_none() {
                    self.wake.wait(&mut state);
                }
                if state.pending.is_none() {
                    state.parked = false;
                    state.snapshot = None;
                    return;
                }
            }

            let (task, saved) = {
                let _shared = self.ctx.coordination.read();
                let mut state = self.state.lock();
                match state.pending.take() {
                    Some(task) => (task, self.begin_invocation(&mut state)),
                    None => continue,
                }
            };

            debug!(thread = self.id, "Running invocation");
            let complete = task();
            self.end_invocation(saved);
            complete();
        }
    }

    fn begin_invocation(&self, state: &mut ThreadState) -> SavedSuspension {
        let saved = SavedSuspension {
            suspend_count: state.suspend_count,
            snapshot: state.snapshot.take(),
        };
        state.suspend_count = 0;
        state.parked = false;
        state.invoking = true;
        saved
    }

    fn end_invocation(&self, saved: SavedSuspension) {
        let _shared = self.ctx.coordination.read();
        let mut state = self.state.lock();

        if self.ctx.is_disposed() {
            state.invoking = false;
            return;
        }
        if state.remote {
            if let Err(err) = self.ctx.bridge.resume_thread(self.id) {
                debug!(thread = self.id, "Cancelling remote suspension failed: {}", err);
            }
            state.remote = false;
        }
        state.suspend_count += saved.suspend_count;
        state.parked = true;
        state.invoking = false;
        state.snapshot = saved.snapshot;
    }

    /// Queue an invocation for the parked thread and wake it
    pub(crate) fn post_invocation(&self, task: InvocationTask) -> DebugResult<()> {
        let _shared = self.ctx.coordination.read();
        let mut state = self.state.lock();

        if state.invoking || state.pending.is_some() {
            return Err(DebugError::AlreadyInvoking);
        }
        if !state.parked || state.suspend_count == 0 {
            return Err(DebugError::ThreadNotSuspended);
        }

        state.pending = Some(task);
        self.wake.notify_all();
        Ok(())
    }

    /// Call frames of the suspended thread
    pub fn frames(&self) -> DebugResult<Vec<CallFrame>> {
        let mut state = self.state.lock();
        if state.suspend_count == 0 {
            return Err(DebugError::ThreadNotSuspended);
        }

        let id = self.id;
        let snapshot = state
            .snapshot
            .get_or_insert_with(|| SuspendedSnapshot::unknown(id));
        let frames = snapshot.frames(self.ctx.bridge.as_ref(), &self.ctx.generations)?;
        Ok(frames.to_vec())
    }

    /// Depth of a frame handed out during the current suspension
    pub fn frame_depth(&self, frame_id: FrameId) -> DebugResult<u32> {
        let state = self.state.lock();
        match &state.snapshot {
            Some(snapshot) if state.suspend_count > 0 => snapshot.depth_of(frame_id),
            _ => Err(DebugError::InvalidFrameId),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{BridgeCall, FakeDebuggee};
    use std::thread;
    use std::time::Duration;

    fn setup() -> (Arc<FakeDebuggee>, Arc<DebuggeeThread>) {
        let vm = Arc::new(FakeDebuggee::new());
        vm.add_thread(1);
        vm.set_frames(1, vec![Location::new(1, 10, 0), Location::new(1, 11, 4)]);
        let ctx = Arc::new(ThreadContext::new(vm.clone()));
        (vm, Arc::new(DebuggeeThread::new(1, ctx)))
    }

    fn noop() -> InvocationTask {
        Box::new(|| Box::new(|| {}) as Completion)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_resume_when_running_is_noop() {
        let (vm, thread) = setup();

        thread.resume(false).unwrap();
        thread.resume(true).unwrap();

        assert_eq!(thread.suspend_count(), 0);
        assert!(vm.calls().is_empty());
    }

    #[test]
    fn test_nested_suspend_needs_matching_resumes() {
        let (vm, thread) = setup();

        for _ in 0..3 {
            thread.suspend().unwrap();
        }
        assert_eq!(vm.count_calls(|c| matches!(c, BridgeCall::SuspendThread(1))), 1);

        thread.resume(false).unwrap();
        thread.resume(false).unwrap();
        assert!(thread.is_suspended());
        assert_eq!(vm.count_calls(|c| matches!(c, BridgeCall::ResumeThread(1))), 0);

        thread.resume(false).unwrap();
        assert!(!thread.is_suspended());
        assert_eq!(vm.count_calls(|c| matches!(c, BridgeCall::ResumeThread(1))), 1);
    }

    #[test]
    fn test_force_release_drops_all_suspensions() {
        let (vm, thread) = setup();

        thread.suspend().unwrap();
        thread.suspend().unwrap();
        thread.resume(true).unwrap();

        assert_eq!(thread.suspend_count(), 0);
        assert_eq!(vm.count_calls(|c| matches!(c, BridgeCall::ResumeThread(1))), 1);
    }

    #[test]
    fn test_suspend_unknown_thread_is_invalid_thread() {
        let vm = Arc::new(FakeDebuggee::new());
        let ctx = Arc::new(ThreadContext::new(vm));
        let thread = DebuggeeThread::new(42, ctx);

        assert_eq!(thread.suspend(), Err(DebugError::InvalidThread));
        assert_eq!(thread.suspend_count(), 0);
    }

    #[test]
    fn test_suspend_after_bridge_disposed_is_silent() {
        let (vm, thread) = setup();
        vm.set_disposed(true);

        assert_eq!(thread.suspend(), Ok(()));
        assert_eq!(thread.suspend_count(), 0);
    }

    #[test]
    fn test_frames_require_suspension() {
        let (_vm, thread) = setup();
        assert_eq!(thread.frames(), Err(DebugError::ThreadNotSuspended));

        thread.suspend().unwrap();
        let frames = thread.frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(thread.frame_depth(frames[1].frame_id), Ok(1));
    }

    #[test]
    fn test_frame_ids_expire_with_suspension() {
        let (_vm, thread) = setup();

        thread.suspend().unwrap();
        let old = thread.frames().unwrap()[0].frame_id;
        thread.resume(false).unwrap();

        thread.suspend().unwrap();
        let new = thread.frames().unwrap()[0].frame_id;

        assert_ne!(old, new);
        assert_eq!(thread.frame_depth(old), Err(DebugError::InvalidFrameId));
        assert_eq!(thread.frame_depth(new), Ok(0));
    }

    #[test]
    fn test_parked_thread_wakes_on_resume() {
        let (vm, thread) = setup();
        let location = Location::new(1, 10, 0);

        let parked = thread.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            parked.suspended_at(SuspendedSnapshot::at(1, location), || tx.send(()).unwrap());
        });

        rx.recv().unwrap();
        assert!(thread.is_parked());
        assert_eq!(thread.stopped_location(), Some(location));

        // A client suspension on a parked thread is bookkeeping only
        thread.suspend().unwrap();
        thread.resume(false).unwrap();
        assert!(thread.is_parked());

        thread.resume(false).unwrap();
        handle.join().unwrap();

        assert!(!thread.is_parked());
        assert_eq!(thread.stopped_location(), None);
        assert_eq!(vm.count_calls(|c| matches!(c, BridgeCall::SuspendThread(_))), 0);
    }

    #[test]
    fn test_parking_cancels_remote_suspension() {
        let (vm, thread) = setup();
        thread.suspend().unwrap();

        let parked = thread.clone();
        let handle = thread::spawn(move || {
            parked.suspended_at(SuspendedSnapshot::unknown(1), || {});
        });

        wait_until(|| thread.is_parked());
        assert_eq!(thread.suspend_count(), 2);
        assert_eq!(vm.count_calls(|c| matches!(c, BridgeCall::ResumeThread(1))), 1);

        thread.resume(false).unwrap();
        thread.resume(false).unwrap();
        handle.join().unwrap();

        // The thread left on its own, no second bridge resume
        assert_eq!(vm.count_calls(|c| matches!(c, BridgeCall::ResumeThread(1))), 1);
    }

    #[test]
    fn test_invocation_runs_on_parked_thread() {
        let (_vm, thread) = setup();
        assert!(matches!(
            thread.post_invocation(noop()),
            Err(DebugError::ThreadNotSuspended)
        ));

        let parked = thread.clone();
        let handle = thread::spawn(move || {
            parked.suspended_at(SuspendedSnapshot::unknown(1), || {});
        });
        wait_until(|| thread.is_parked());

        let (tx, rx) = std::sync::mpsc::channel();
        let observer = thread.clone();
        thread
            .post_invocation(Box::new(move || {
                tx.send((observer.suspend_count(), observer.is_invoking())).unwrap();
                Box::new(|| {}) as Completion
            }))
            .unwrap();

        let (count_during, invoking) = rx.recv().unwrap();
        assert_eq!(count_during, 0);
        assert!(invoking);

        wait_until(|| thread.is_parked() && !thread.is_invoking());
        assert_eq!(thread.suspend_count(), 1);

        thread.resume(false).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_second_invocation_is_rejected() {
        let (_vm, thread) = setup();
        let parked = thread.clone();
        let handle = thread::spawn(move || {
            parked.suspended_at(SuspendedSnapshot::unknown(1), || {});
        });
        wait_until(|| thread.is_parked());

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        thread
            .post_invocation(Box::new(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Box::new(|| {}) as Completion
            }))
            .unwrap();
        started_rx.recv().unwrap();

        assert_eq!(thread.post_invocation(noop()), Err(DebugError::AlreadyInvoking));

        release_tx.send(()).unwrap();
        wait_until(|| thread.is_parked() && !thread.is_invoking());
        thread.resume(false).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_completion_sees_restored_suspension() {
        let (_vm, thread) = setup();
        let parked = thread.clone();
        let handle = thread::spawn(move || {
            parked.suspended_at(SuspendedSnapshot::unknown(1), || {});
        });
        wait_until(|| thread.is_parked());

        let (tx, rx) = std::sync::mpsc::channel();
        let observer = thread.clone();
        thread
            .post_invocation(Box::new(move || {
                Box::new(move || {
                    tx.send((observer.suspend_count(), observer.frames().is_ok())).unwrap();
                    // A resume arriving right after the reply must release the thread
                    observer.resume(false).unwrap();
                }) as Completion
            }))
            .unwrap();

        assert_eq!(rx.recv().unwrap(), (1, true));
        handle.join().unwrap();
        assert!(!thread.is_parked());
        assert_eq!(thread.suspend_count(), 0);
    }
}
