// JDWP event composition
//
// Events reach the debugger as one Event.Composite command packet per
// occurrence, carrying every request that matched it.

use crate::commands::{command_sets, composite_commands, event_kinds};
use crate::error::DebugResult;
use crate::protocol::CommandPacket;
use crate::reader::{read_i32, read_location, read_tagged_value, read_u64, read_u8};
use crate::types::*;
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Every event reported for one occurrence, with the strongest policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSet {
    pub suspend_policy: u8,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: u8,
    pub request_id: RequestId,
    pub details: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    VMStart {
        thread: ThreadId,
    },
    VMDeath,
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    Breakpoint {
        thread: ThreadId,
        location: Location,
    },
    Step {
        thread: ThreadId,
        location: Location,
    },
    MethodEntry {
        thread: ThreadId,
        location: Location,
    },
    MethodExit {
        thread: ThreadId,
        location: Location,
    },
    MethodExitWithReturnValue {
        thread: ThreadId,
        location: Location,
        value: Value,
    },
    Unknown {
        kind: u8,
    },
}

impl EventKind {
    pub fn kind(&self) -> u8 {
        match self {
            EventKind::VMStart { .. } => event_kinds::VM_START,
            EventKind::VMDeath => event_kinds::VM_DEATH,
            EventKind::ThreadStart { .. } => event_kinds::THREAD_START,
            EventKind::ThreadDeath { .. } => event_kinds::THREAD_DEATH,
            EventKind::Breakpoint { .. } => event_kinds::BREAKPOINT,
            EventKind::Step { .. } => event_kinds::SINGLE_STEP,
            EventKind::MethodEntry { .. } => event_kinds::METHOD_ENTRY,
            EventKind::MethodExit { .. } => event_kinds::METHOD_EXIT,
            EventKind::MethodExitWithReturnValue { .. } => event_kinds::METHOD_EXIT_WITH_RETURN_VALUE,
            EventKind::Unknown { kind } => *kind,
        }
    }
}

impl Event {
    pub fn new(request_id: RequestId, details: EventKind) -> Self {
        Self {
            kind: details.kind(),
            request_id,
            details,
        }
    }

    fn read_from(buf: &mut &[u8]) -> DebugResult<Self> {
        let kind = read_u8(buf)?;
        let request_id = read_i32(buf)?;

        let details = match kind {
            event_kinds::VM_DEATH => EventKind::VMDeath,
            event_kinds::VM_START | event_kinds::THREAD_START | event_kinds::THREAD_DEATH => {
                let thread = read_u64(buf)?;
                match kind {
                    event_kinds::VM_START => EventKind::VMStart { thread },
                    event_kinds::THREAD_START => EventKind::ThreadStart { thread },
                    _ => EventKind::ThreadDeath { thread },
                }
            }
            event_kinds::BREAKPOINT
            | event_kinds::SINGLE_STEP
            | event_kinds::METHOD_ENTRY
            | event_kinds::METHOD_EXIT
            | event_kinds::METHOD_EXIT_WITH_RETURN_VALUE => {
                let thread = read_u64(buf)?;
                let location = read_location(buf)?;
                match kind {
                    event_kinds::BREAKPOINT => EventKind::Breakpoint { thread, location },
                    event_kinds::SINGLE_STEP => EventKind::Step { thread, location },
                    event_kinds::METHOD_ENTRY => EventKind::MethodEntry { thread, location },
                    event_kinds::METHOD_EXIT => EventKind::MethodExit { thread, location },
                    _ => EventKind::MethodExitWithReturnValue {
                        thread,
                        location,
                        value: read_tagged_value(buf)?,
                    },
                }
            }
            other => {
                warn!("Unsupported event kind: {}", other);
                EventKind::Unknown { kind: other }
            }
        };

        Ok(Self {
            kind,
            request_id,
            details,
        })
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.kind);
        buf.put_i32(self.request_id);

        match &self.details {
            EventKind::VMDeath | EventKind::Unknown { .. } => {}
            EventKind::VMStart { thread }
            | EventKind::ThreadStart { thread }
            | EventKind::ThreadDeath { thread } => buf.put_u64(*thread),
            EventKind::Breakpoint { thread, location }
            | EventKind::Step { thread, location }
            | EventKind::MethodEntry { thread, location }
            | EventKind::MethodExit { thread, location } => {
                buf.put_u64(*thread);
                location.write_to(buf);
            }
            EventKind::MethodExitWithReturnValue {
                thread,
                location,
                value,
            } => {
                buf.put_u64(*thread);
                location.write_to(buf);
                value.write_to(buf);
            }
        }
    }
}

impl EventSet {
    pub fn new(suspend_policy: u8, events: Vec<Event>) -> Self {
        Self {
            suspend_policy,
            events,
        }
    }

    /// Payload of an Event.Composite command
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(self.suspend_policy);
        buf.put_i32(self.events.len() as i32);
        for event in &self.events {
            event.write_to(&mut buf);
        }
        buf
    }

    pub fn into_packet(self, id: u32) -> CommandPacket {
        CommandPacket::with_data(id, command_sets::EVENT, composite_commands::COMPOSITE, self.encode())
    }
}

/// Decode an Event.Composite payload, as a debugger would
pub fn parse_event_packet(data: &[u8]) -> DebugResult<EventSet> {
    let mut buf = data;
    let suspend_policy = read_u8(&mut buf)?;
    let count = read_i32(&mut buf)?.max(0) as usize;

    let events = (0..count)
        .map(|_| Event::read_from(&mut buf))
        .collect::<DebugResult<Vec<_>>>()?;
    Ok(EventSet::new(suspend_policy, events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HEADER_SIZE;

    #[test]
    fn test_composite_packet_header() {
        let set = EventSet::new(2, vec![Event::new(0, EventKind::VMDeath)]);
        let packet = set.into_packet(9);
        let encoded = packet.encode();

        assert_eq!(encoded[9], 64);
        assert_eq!(encoded[10], 100);
        // policy, count, kind, request id
        assert_eq!(&encoded[HEADER_SIZE..], &[2, 0, 0, 0, 1, 99, 0, 0, 0, 0]);
    }

    #[test]
    fn test_composite_with_several_events() {
        let location = Location::new(3, 4, 5);
        let set = EventSet::new(
            1,
            vec![
                Event::new(7, EventKind::Step { thread: 11, location }),
                Event::new(8, EventKind::Breakpoint { thread: 11, location }),
                Event::new(
                    9,
                    EventKind::MethodExitWithReturnValue {
                        thread: 11,
                        location,
                        value: Value::int(3),
                    },
                ),
            ],
        );

        let parsed = parse_event_packet(&set.encode()).unwrap();
        assert_eq!(parsed, set);
        assert_eq!(parsed.events[2].kind, event_kinds::METHOD_EXIT_WITH_RETURN_VALUE);
    }

    #[test]
    fn test_truncated_event_is_rejected() {
        let set = EventSet::new(0, vec![Event::new(1, EventKind::ThreadStart { thread: 5 })]);
        let encoded = set.encode();

        assert!(parse_event_packet(&encoded[..encoded.len() - 1]).is_err());
    }
}
