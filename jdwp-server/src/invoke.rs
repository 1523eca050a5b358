// Method invocation on a suspended thread
//
// ClassType.InvokeMethod, InterfaceType.InvokeMethod and
// ObjectReference.InvokeMethod all run on the target thread itself. The
// command task only posts the work; the reply is queued by the debuggee
// thread once the call has returned.

use crate::bridge::{InvokeOutcome, InvokeRequest};
use crate::commands::{
    class_type_commands, command_sets, interface_type_commands, invoke_options, object_reference_commands,
};
use crate::error::{DebugError, DebugResult};
use crate::protocol::{CommandPacket, Packet, ReplyPacket};
use crate::reader::{read_i32, read_tagged_value, read_u64};
use crate::session::DebugSession;
use crate::types::{ThreadId, TypeTag, Value, NULL_OBJECT};
use bytes::BufMut;
use std::sync::Arc;
use tracing::{debug, warn};

pub fn is_invoke(packet: &CommandPacket) -> bool {
    matches!(
        (packet.command_set, packet.command),
        (command_sets::CLASS_TYPE, class_type_commands::INVOKE_METHOD)
            | (command_sets::INTERFACE_TYPE, interface_type_commands::INVOKE_METHOD)
            | (command_sets::OBJECT_REFERENCE, object_reference_commands::INVOKE_METHOD)
    )
}

/// A decoded InvokeMethod command
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeCommand {
    pub thread: ThreadId,
    pub request: InvokeRequest,
}

impl InvokeCommand {
    pub fn single_threaded(&self) -> bool {
        self.request.options & invoke_options::INVOKE_SINGLE_THREADED != 0
    }

    /// Static and interface invocations carry (class, thread, method).
    /// Instance invocations carry (object, thread, class, method).
    pub fn parse(packet: &CommandPacket) -> DebugResult<Self> {
        let mut buf = packet.data();

        let (receiver, class_id, thread, method_id) = match packet.command_set {
            command_sets::OBJECT_REFERENCE => {
                let object = read_u64(&mut buf)?;
                let thread = read_u64(&mut buf)?;
                let class = read_u64(&mut buf)?;
                let method = read_u64(&mut buf)?;
                (object, class, thread, method)
            }
            command_sets::CLASS_TYPE | command_sets::INTERFACE_TYPE => {
                let class = read_u64(&mut buf)?;
                let thread = read_u64(&mut buf)?;
                let method = read_u64(&mut buf)?;
                (NULL_OBJECT, class, thread, method)
            }
            other => {
                return Err(DebugError::IllegalArgument(format!(
                    "command set {} has no InvokeMethod",
                    other
                )))
            }
        };

        let arg_count = read_i32(&mut buf)?;
        if arg_count < 0 {
            return Err(DebugError::IllegalArgument(format!("negative argument count {}", arg_count)));
        }
        let args = (0..arg_count)
            .map(|_| read_tagged_value(&mut buf))
            .collect::<DebugResult<Vec<Value>>>()?;
        let options = read_i32(&mut buf)?;

        Ok(Self {
            thread,
            request: InvokeRequest {
                receiver,
                class_id,
                method_id,
                args,
                options,
            },
        })
    }
}

/// Reply body: the tagged return value followed by the tagged exception
pub fn encode_outcome(outcome: &InvokeOutcome) -> Vec<u8> {
    let mut data = Vec::new();
    outcome.value.write_to(&mut data);
    data.put_u8(TypeTag::Object as u8);
    data.put_u64(outcome.exception);
    data
}

impl DebugSession {
    /// Post an invocation to its thread. On success the reply is queued
    /// later from the debuggee thread; on failure the caller replies.
    pub(crate) fn invoke_method(self: &Arc<Self>, packet: &CommandPacket) -> DebugResult<()> {
        let command = InvokeCommand::parse(packet)?;
        let single_threaded = command.single_threaded();
        let InvokeCommand { thread, request } = command;
        let reply_id = packet.id;

        debug!(
            thread,
            method = request.method_id,
            single_threaded,
            "Posting method invocation"
        );

        let bridge = self.bridge.clone();
        let outbound = self.outbound.clone();
        self.threads.invoke(
            thread,
            single_threaded,
            move || bridge.invoke_method(thread, &request),
            move |result| {
                let reply = match result {
                    Ok(outcome) => {
                        debug!(thread, "Invocation returned {}", outcome.value);
                        ReplyPacket::new(reply_id, encode_outcome(&outcome))
                    }
                    Err(e) => ReplyPacket::error(reply_id, DebugError::from(e).error_code()),
                };
                if let Err(e) = outbound.send_blocking(Packet::Reply(reply)) {
                    warn!("Dropping invoke reply id={}: {}", reply_id, e);
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{error_codes, event_kinds};
    use crate::eventrequest::{EventModifier, EventRequest, SuspendPolicy};
    use crate::mock::{BridgeCall, FakeDebuggee};
    use crate::session::tests::session_with;
    use crate::types::Location;
    use std::thread;
    use tokio::sync::mpsc;

    fn invoke_packet(id: u32, thread: ThreadId, options: i32) -> CommandPacket {
        let mut data = Vec::new();
        data.put_u64(7); // class
        data.put_u64(thread);
        data.put_u64(8); // method
        data.put_i32(1);
        Value::int(5).write_to(&mut data);
        data.put_i32(options);
        CommandPacket::with_data(id, command_sets::CLASS_TYPE, class_type_commands::INVOKE_METHOD, data)
    }

    fn next_packet(rx: &mut mpsc::Receiver<Packet>) -> Packet {
        rx.blocking_recv().expect("outbound queue closed")
    }

    /// Park `thread` at a breakpoint with EVENT_THREAD policy
    fn park_at_breakpoint(
        session: &Arc<DebugSession>,
        rx: &mut mpsc::Receiver<Packet>,
        thread: ThreadId,
    ) -> thread::JoinHandle<bool> {
        let location = Location::new(1, 2, 3);
        session
            .set_event_request(
                EventRequest::new(event_kinds::BREAKPOINT, SuspendPolicy::EventThread)
                    .with_modifier(EventModifier::LocationOnly(location))
                    .with_modifier(EventModifier::ThreadOnly(thread)),
            )
            .unwrap();
        let dispatcher = session.dispatcher();
        let handle = thread::spawn(move || dispatcher.on_breakpoint(thread, location, NULL_OBJECT));
        assert!(matches!(next_packet(rx), Packet::Command(_)));
        handle
    }

    #[test]
    fn test_parse_instance_invocation() {
        let mut data = Vec::new();
        data.put_u64(40); // object
        data.put_u64(2); // thread
        data.put_u64(7); // class
        data.put_u64(8); // method
        data.put_i32(0);
        data.put_i32(invoke_options::INVOKE_NONVIRTUAL);
        let packet = CommandPacket::with_data(1, command_sets::OBJECT_REFERENCE, object_reference_commands::INVOKE_METHOD, data);

        let command = InvokeCommand::parse(&packet).unwrap();
        assert_eq!(command.thread, 2);
        assert_eq!(command.request.receiver, 40);
        assert_eq!(command.request.class_id, 7);
        assert_eq!(command.request.method_id, 8);
        assert!(command.request.args.is_empty());
        assert!(!command.single_threaded());
    }

    #[test]
    fn test_parse_rejects_truncated_arguments() {
        let mut packet = invoke_packet(1, 2, 0);
        packet.data.truncate(packet.data.len() - 6);
        assert!(matches!(InvokeCommand::parse(&packet), Err(DebugError::IllegalArgument(_))));
    }

    #[test]
    fn test_invoke_requires_parked_thread() {
        let vm = Arc::new(FakeDebuggee::new());
        vm.add_thread(2);
        let (session, _rx) = session_with(vm);

        assert_eq!(session.invoke_method(&invoke_packet(5, 2, 0)), Err(DebugError::ThreadNotSuspended));

        // A client suspension alone does not park the thread
        session.threads.suspend_thread(2).unwrap();
        assert_eq!(session.invoke_method(&invoke_packet(5, 2, 0)), Err(DebugError::ThreadNotSuspended));
    }

    #[test]
    fn test_invoke_runs_on_parked_thread_and_replies() {
        let vm = Arc::new(FakeDebuggee::new());
        vm.add_thread(2);
        vm.add_thread(3);
        vm.on_invoke(|_, request| {
            Ok(InvokeOutcome {
                value: request.args[0].clone(),
                exception: NULL_OBJECT,
            })
        });
        let (session, mut rx) = session_with(vm.clone());
        let parked = park_at_breakpoint(&session, &mut rx, 2);
        session.threads.suspend_thread(3).unwrap();

        session.invoke_method(&invoke_packet(11, 2, 0)).unwrap();

        match next_packet(&mut rx) {
            Packet::Reply(reply) => {
                assert_eq!(reply.id, 11);
                assert_eq!(reply.data(), &[b'I', 0, 0, 0, 5, b'L', 0, 0, 0, 0, 0, 0, 0, 0]);
            }
            other => panic!("expected reply, got {:?}", other),
        }

        // Other threads ran during the call and are suspended again
        let calls = vm.calls();
        let invoke_at = calls.iter().position(|c| matches!(c, BridgeCall::Invoke(2, _))).unwrap();
        assert!(calls[..invoke_at].contains(&BridgeCall::VmResume(vec![3])));
        assert!(calls[invoke_at..].contains(&BridgeCall::VmSuspend(vec![3])));
        assert_eq!(session.threads.suspend_count(3), Ok(1));
        assert_eq!(session.threads.suspend_count(2), Ok(1));

        session.threads.resume_thread(2).unwrap();
        assert!(parked.join().unwrap());
    }

    #[test]
    fn test_single_threaded_invoke_leaves_others_alone() {
        let vm = Arc::new(FakeDebuggee::new());
        vm.add_thread(2);
        vm.add_thread(3);
        let (session, mut rx) = session_with(vm.clone());
        let parked = park_at_breakpoint(&session, &mut rx, 2);
        session.threads.suspend_thread(3).unwrap();
        vm.take_calls();

        session
            .invoke_method(&invoke_packet(12, 2, invoke_options::INVOKE_SINGLE_THREADED))
            .unwrap();
        assert!(matches!(next_packet(&mut rx), Packet::Reply(reply) if reply.id == 12 && !reply.is_error()));

        assert_eq!(vm.count_calls(|c| matches!(c, BridgeCall::VmResume(_) | BridgeCall::VmSuspend(_))), 0);

        session.threads.resume_thread(2).unwrap();
        parked.join().unwrap();
    }

    #[test]
    fn test_failed_invoke_replies_with_error() {
        let vm = Arc::new(FakeDebuggee::new());
        vm.add_thread(2);
        vm.on_invoke(|_, _| Err(crate::bridge::BridgeError::Jdwp(error_codes::INVALID_OBJECT)));
        let (session, mut rx) = session_with(vm);
        let parked = park_at_breakpoint(&session, &mut rx, 2);

        session.invoke_method(&invoke_packet(13, 2, 0)).unwrap();
        match next_packet(&mut rx) {
            Packet::Reply(reply) => assert_eq!(reply.error_code, error_codes::INVALID_OBJECT),
            other => panic!("expected reply, got {:?}", other),
        }

        session.threads.resume_thread(2).unwrap();
        parked.join().unwrap();
    }
}
