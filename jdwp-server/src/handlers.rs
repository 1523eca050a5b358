// Command router
//
// Handles the command sets that touch thread, request or session state and
// forwards the rest of the protocol to the debuggee bridge.

use crate::commands::{command_sets, event_commands, thread_commands, vm_commands};
use crate::error::{DebugError, DebugResult};
use crate::eventrequest::EventRequest;
use crate::protocol::{CommandPacket, Packet, ReplyPacket};
use crate::reader::{read_i32, read_u64, read_u8};
use crate::session::DebugSession;
use bytes::BufMut;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a handler produced for one command
enum Handled {
    Reply(Vec<u8>),
    /// The reply has been, or will be, queued by someone else
    Deferred,
}

impl DebugSession {
    /// Run one command. Returns the reply to queue, or None when the reply
    /// is sent elsewhere (Dispose, InvokeMethod).
    pub fn handle_command(self: &Arc<Self>, packet: &CommandPacket) -> Option<ReplyPacket> {
        debug!(
            id = packet.id,
            set = packet.command_set,
            cmd = packet.command,
            "Handling command"
        );

        match self.route(packet) {
            Ok(Handled::Reply(data)) => Some(ReplyPacket::new(packet.id, data)),
            Ok(Handled::Deferred) => None,
            Err(e) => {
                debug!(id = packet.id, "Command failed: {}", e);
                Some(ReplyPacket::error(packet.id, e.error_code()))
            }
        }
    }

    fn route(self: &Arc<Self>, packet: &CommandPacket) -> DebugResult<Handled> {
        let is_dispose = packet.command_set == command_sets::VIRTUAL_MACHINE && packet.command == vm_commands::DISPOSE;
        if self.is_vm_dead() && !is_dispose {
            return Err(DebugError::VmDead);
        }

        match packet.command_set {
            command_sets::VIRTUAL_MACHINE => self.handle_vm(packet),
            command_sets::THREAD_REFERENCE => self.handle_thread(packet),
            command_sets::EVENT_REQUEST => self.handle_event_request(packet),
            command_sets::CLASS_TYPE | command_sets::INTERFACE_TYPE | command_sets::OBJECT_REFERENCE
                if crate::invoke::is_invoke(packet) =>
            {
                self.invoke_method(packet)?;
                Ok(Handled::Deferred)
            }
            command_sets::STACK_FRAME => self.handle_stack_frame(packet),
            _ => self.forward(packet),
        }
    }

    fn handle_vm(self: &Arc<Self>, packet: &CommandPacket) -> DebugResult<Handled> {
        match packet.command {
            vm_commands::DISPOSE => {
                // The debugger must see the reply before threads start running
                let reply = ReplyPacket::new(packet.id, Vec::new());
                if let Err(e) = self.outbound.send_blocking(Packet::Reply(reply)) {
                    warn!("Failed to queue Dispose reply: {}", e);
                }
                info!("Debugger requested dispose");
                self.dispose();
                Ok(Handled::Deferred)
            }
            vm_commands::SUSPEND => {
                self.threads.suspend_all();
                Ok(Handled::Reply(Vec::new()))
            }
            vm_commands::RESUME => {
                self.threads.resume_all();
                Ok(Handled::Reply(Vec::new()))
            }
            _ => self.forward(packet),
        }
    }

    fn handle_thread(&self, packet: &CommandPacket) -> DebugResult<Handled> {
        let mut buf = packet.data();
        let threads = &self.threads;

        let mut data = Vec::new();
        match packet.command {
            thread_commands::SUSPEND => threads.suspend_thread(read_u64(&mut buf)?)?,
            thread_commands::RESUME => threads.resume_thread(read_u64(&mut buf)?)?,
            thread_commands::STATUS => {
                let (status, suspend_status) = threads.thread_status(read_u64(&mut buf)?)?;
                data.put_i32(status as i32);
                data.put_i32(suspend_status as i32);
            }
            thread_commands::FRAMES => {
                let thread = read_u64(&mut buf)?;
                let start = read_i32(&mut buf)?;
                let length = read_i32(&mut buf)?;
                let frames = threads.frames(thread, start, length)?;
                data.put_i32(frames.len() as i32);
                for frame in &frames {
                    frame.write_to(&mut data);
                }
            }
            thread_commands::FRAME_COUNT => {
                let count = threads.frame_count(read_u64(&mut buf)?)?;
                data.put_i32(count as i32);
            }
            thread_commands::SUSPEND_COUNT => {
                let count = threads.suspend_count(read_u64(&mut buf)?)?;
                data.put_i32(count as i32);
            }
            _ => return self.forward(packet),
        }
        Ok(Handled::Reply(data))
    }

    fn handle_event_request(&self, packet: &CommandPacket) -> DebugResult<Handled> {
        let mut data = Vec::new();
        match packet.command {
            event_commands::SET => {
                let request = EventRequest::parse(packet.data())?;
                let request_id = self.set_event_request(request)?;
                data.put_i32(request_id);
            }
            event_commands::CLEAR => {
                let mut buf = packet.data();
                let event_kind = read_u8(&mut buf)?;
                let request_id = read_i32(&mut buf)?;
                self.clear_event_request(event_kind, request_id)?;
            }
            event_commands::CLEAR_ALL_BREAKPOINTS => self.clear_all_breakpoints(),
            _ => return self.forward(packet),
        }
        Ok(Handled::Reply(data))
    }

    /// Every StackFrame command starts with (thread, frame). The frame id is
    /// checked against the thread's current suspension and replaced by its
    /// depth before the bridge sees it.
    fn handle_stack_frame(&self, packet: &CommandPacket) -> DebugResult<Handled> {
        let mut buf = packet.data();
        let thread = read_u64(&mut buf)?;
        let frame_id = read_u64(&mut buf)?;
        let depth = self.threads.validate_frame(thread, frame_id)?;

        let mut rewritten = packet.clone();
        rewritten.data[8..16].copy_from_slice(&u64::from(depth).to_be_bytes());
        self.forward(&rewritten)
    }

    fn forward(&self, packet: &CommandPacket) -> DebugResult<Handled> {
        let data = self.bridge.dispatch(packet)?;
        Ok(Handled::Reply(data))
    }
}
