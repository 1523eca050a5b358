// Call frames of suspended threads
//
// Frame ids are (generation, depth) pairs rather than references: the high
// 32 bits carry the generation the frame list was materialized under, the low
// 32 bits the depth. A frame id is only honoured while the owning thread is
// still inside the same suspension.
//
// Generations come from one session-wide counter, but a frame id is checked
// against its own thread's snapshot only. Resuming one thread therefore does
// not invalidate the frame ids of another thread that stays suspended.

use crate::bridge::{BridgeError, DebuggeeBridge};
use crate::error::{DebugError, DebugResult};
use crate::types::{FrameId, Location, ThreadId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Stack frame information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    pub frame_id: FrameId,
    pub thread: ThreadId,
    pub location: Location,
}

impl CallFrame {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_u64(self.frame_id);
        self.location.write_to(buf);
    }
}

pub fn frame_id(generation: u32, depth: u32) -> FrameId {
    ((generation as u64) << 32) | depth as u64
}

/// Split a frame id into (generation, depth)
pub fn split_frame_id(frame_id: FrameId) -> (u32, u32) {
    ((frame_id >> 32) as u32, frame_id as u32)
}

/// Session-wide source of frame generations. Zero is never handed out, so a
/// zero frame id is always invalid.
#[derive(Debug)]
pub struct FrameGenerations(AtomicU32);

impl Default for FrameGenerations {
    fn default() -> Self {
        Self(AtomicU32::new(1))
    }
}

impl FrameGenerations {
    pub fn next(&self) -> u32 {
        loop {
            let generation = self.0.fetch_add(1, Ordering::SeqCst);
            if generation != 0 {
                return generation;
            }
        }
    }
}

/// What the engine knows about a thread while it is suspended
#[derive(Debug, Clone)]
pub struct SuspendedSnapshot {
    thread: ThreadId,
    location: Option<Location>,
    frames: Option<Vec<CallFrame>>,
    generation: u32,
}

impl SuspendedSnapshot {
    /// Snapshot for a thread stopped at a known code location
    pub fn at(thread: ThreadId, location: Location) -> Self {
        Self {
            thread,
            location: Some(location),
            frames: None,
            generation: 0,
        }
    }

    /// Snapshot for a thread that is not stopped because of a location (thread
    /// start, remote suspension)
    pub fn unknown(thread: ThreadId) -> Self {
        Self {
            thread,
            location: None,
            frames: None,
            generation: 0,
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn location(&self) -> Option<Location> {
        self.location
    }

    /// Frames of the suspended thread, fetched from the bridge on first use
    pub(crate) fn frames(
        &mut self,
        bridge: &dyn DebuggeeBridge,
        generations: &FrameGenerations,
    ) -> DebugResult<&[CallFrame]> {
        if self.frames.is_none() {
            let stack = bridge.stack_frames(self.thread).map_err(|err| match err {
                BridgeError::UnknownThread(_) => DebugError::InvalidThread,
                other => DebugError::from(other),
            })?;

            let generation = generations.next();
            let thread = self.thread;
            let frames = stack
                .into_iter()
                .enumerate()
                .map(|(depth, location)| CallFrame {
                    frame_id: frame_id(generation, depth as u32),
                    thread,
                    location,
                })
                .collect();

            self.generation = generation;
            self.frames = Some(frames);
        }

        Ok(self.frames.as_deref().unwrap_or_default())
    }

    /// Resolve a frame id handed out for this suspension to its depth
    pub(crate) fn depth_of(&self, id: FrameId) -> DebugResult<u32> {
        let (generation, depth) = split_frame_id(id);
        match &self.frames {
            Some(frames) if generation == self.generation && (depth as usize) < frames.len() => Ok(depth),
            _ => Err(DebugError::InvalidFrameId),
        }
    }
}
