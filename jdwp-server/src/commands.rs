// JDWP command and constant tables
//
// Command Sets handled by the server itself:
// 1 = VirtualMachine (Dispose, Suspend, Resume)
// 3 = ClassType (InvokeMethod)
// 5 = InterfaceType (InvokeMethod)
// 9 = ObjectReference (InvokeMethod)
// 11 = ThreadReference
// 15 = EventRequest
// 16 = StackFrame (frame id validation before forwarding)
// 64 = Event (outbound Composite)
//
// Anything else is forwarded to the debuggee bridge.

// Command set IDs
pub mod command_sets {
    pub const VIRTUAL_MACHINE: u8 = 1;
    pub const CLASS_TYPE: u8 = 3;
    pub const INTERFACE_TYPE: u8 = 5;
    pub const OBJECT_REFERENCE: u8 = 9;
    pub const THREAD_REFERENCE: u8 = 11;
    pub const EVENT_REQUEST: u8 = 15;
    pub const STACK_FRAME: u8 = 16;
    pub const EVENT: u8 = 64;
}

// VirtualMachine commands (set 1)
pub mod vm_commands {
    pub const VERSION: u8 = 1;
    pub const ALL_THREADS: u8 = 4;
    pub const DISPOSE: u8 = 6;
    pub const ID_SIZES: u8 = 7;
    pub const SUSPEND: u8 = 8;
    pub const RESUME: u8 = 9;
}

// ClassType commands (set 3)
pub mod class_type_commands {
    pub const INVOKE_METHOD: u8 = 3;
}

// InterfaceType commands (set 5)
pub mod interface_type_commands {
    pub const INVOKE_METHOD: u8 = 1;
}

// ObjectReference commands (set 9)
pub mod object_reference_commands {
    pub const INVOKE_METHOD: u8 = 6;
}

// ThreadReference commands (set 11)
pub mod thread_commands {
    pub const NAME: u8 = 1;
    pub const SUSPEND: u8 = 2;
    pub const RESUME: u8 = 3;
    pub const STATUS: u8 = 4;
    pub const FRAMES: u8 = 6;
    pub const FRAME_COUNT: u8 = 7;
    pub const SUSPEND_COUNT: u8 = 12;
}

// EventRequest commands (set 15)
pub mod event_commands {
    pub const SET: u8 = 1;
    pub const CLEAR: u8 = 2;
    pub const CLEAR_ALL_BREAKPOINTS: u8 = 3;
}

// StackFrame commands (set 16), all addressed by (thread, frame)
pub mod stack_frame_commands {
    pub const GET_VALUES: u8 = 1;
    pub const SET_VALUES: u8 = 2;
    pub const THIS_OBJECT: u8 = 3;
    pub const POP_FRAMES: u8 = 4;
}

// Event commands (set 64)
pub mod composite_commands {
    pub const COMPOSITE: u8 = 100;
}

// Event kinds for EventRequest.Set
pub mod event_kinds {
    pub const SINGLE_STEP: u8 = 1;
    pub const BREAKPOINT: u8 = 2;
    pub const THREAD_START: u8 = 6;
    pub const THREAD_DEATH: u8 = 7;
    pub const METHOD_ENTRY: u8 = 40;
    pub const METHOD_EXIT: u8 = 41;
    pub const METHOD_EXIT_WITH_RETURN_VALUE: u8 = 42;
    pub const VM_START: u8 = 90;
    pub const VM_DEATH: u8 = 99;
}

// Modifier kinds for EventRequest.Set
pub mod modifier_kinds {
    pub const COUNT: u8 = 1;
    pub const CONDITIONAL: u8 = 2;
    pub const THREAD_ONLY: u8 = 3;
    pub const CLASS_ONLY: u8 = 4;
    pub const CLASS_MATCH: u8 = 5;
    pub const CLASS_EXCLUDE: u8 = 6;
    pub const LOCATION_ONLY: u8 = 7;
    pub const EXCEPTION_ONLY: u8 = 8;
    pub const FIELD_ONLY: u8 = 9;
    pub const STEP: u8 = 10;
    pub const INSTANCE_ONLY: u8 = 11;
    pub const SOURCE_NAME_MATCH: u8 = 12;
    pub const PLATFORM_THREADS_ONLY: u8 = 13;
}

// Step sizes
pub mod step_sizes {
    pub const MIN: i32 = 0;
    pub const LINE: i32 = 1;
}

// Step depths
pub mod step_depths {
    pub const INTO: i32 = 0;
    pub const OVER: i32 = 1;
    pub const OUT: i32 = 2;
}

// Options for the InvokeMethod commands
pub mod invoke_options {
    pub const INVOKE_SINGLE_THREADED: i32 = 0x01;
    pub const INVOKE_NONVIRTUAL: i32 = 0x02;
}

// Error codes placed in reply packets
pub mod error_codes {
    pub const NONE: u16 = 0;
    pub const INVALID_THREAD: u16 = 10;
    pub const THREAD_NOT_SUSPENDED: u16 = 13;
    pub const INVALID_OBJECT: u16 = 20;
    pub const INVALID_LOCATION: u16 = 24;
    pub const INVALID_FRAMEID: u16 = 30;
    pub const NOT_IMPLEMENTED: u16 = 99;
    pub const INVALID_EVENT_TYPE: u16 = 102;
    pub const ILLEGAL_ARGUMENT: u16 = 103;
    pub const VM_DEAD: u16 = 112;
    pub const INTERNAL: u16 = 113;
    pub const ALREADY_INVOKING: u16 = 502;
}
