// JDWP type definitions
//
// Common types used across the JDWP protocol

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;

// All ids use the 8-byte sizes reported by VirtualMachine.IDSizes
pub type ObjectId = u64;
pub type ThreadId = ObjectId;

pub type ReferenceTypeId = u64;
pub type ClassId = ReferenceTypeId;

pub type MethodId = u64;
pub type FrameId = u64;

/// Identifier handed out for every accepted EventRequest.Set
pub type RequestId = i32;

/// The null object reference
pub const NULL_OBJECT: ObjectId = 0;

/// Class, method and bytecode index of an executable position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

impl Location {
    pub fn new(class_id: ReferenceTypeId, method_id: MethodId, index: u64) -> Self {
        Self {
            type_tag: 1,
            class_id,
            method_id,
            index,
        }
    }

    /// Key used by the line breakpoint index
    pub fn method_key(&self) -> (MethodId, u64) {
        (self.method_id, self.index)
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.type_tag);
        buf.put_u64(self.class_id);
        buf.put_u64(self.method_id);
        buf.put_u64(self.index);
    }
}

/// Values of ThreadReference.Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ThreadStatus {
    Zombie = 0,
    Running = 1,
    Sleeping = 2,
    Monitor = 3,
    Wait = 4,
}

/// Suspend status flag returned next to the thread status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum SuspendStatus {
    Running = 0,
    Suspended = 1,
}

/// Signature tags of JDWP tagged values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Array = 91,      // '['
    Byte = 66,       // 'B'
    Char = 67,       // 'C'
    Object = 76,     // 'L'
    Float = 70,      // 'F'
    Double = 68,     // 'D'
    Int = 73,        // 'I'
    Long = 74,       // 'J'
    Short = 83,      // 'S'
    Void = 86,       // 'V'
    Boolean = 90,    // 'Z'
    String = 115,    // 's'
    Thread = 116,    // 't'
    ThreadGroup = 103, // 'g'
    ClassLoader = 108, // 'l'
    ClassObject = 99,  // 'c'
}

/// A value prefixed with its signature tag on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub tag: u8,
    pub data: ValueData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueData {
    Byte(i8),
    Char(u16),
    Float(f32),
    Double(f64),
    Int(i32),
    Long(i64),
    Short(i16),
    Boolean(bool),
    Object(ObjectId),
    Void,
}

impl Value {
    pub fn void() -> Self {
        Self {
            tag: TypeTag::Void as u8,
            data: ValueData::Void,
        }
    }

    pub fn int(v: i32) -> Self {
        Self {
            tag: TypeTag::Int as u8,
            data: ValueData::Int(v),
        }
    }

    pub fn object(tag: TypeTag, id: ObjectId) -> Self {
        Self {
            tag: tag as u8,
            data: ValueData::Object(id),
        }
    }

    /// Write as a JDWP tagged value (tag byte followed by the payload)
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.tag);
        match self.data {
            ValueData::Byte(v) => buf.put_i8(v),
            ValueData::Char(v) => buf.put_u16(v),
            ValueData::Float(v) => buf.put_f32(v),
            ValueData::Double(v) => buf.put_f64(v),
            ValueData::Int(v) => buf.put_i32(v),
            ValueData::Long(v) => buf.put_i64(v),
            ValueData::Short(v) => buf.put_i16(v),
            ValueData::Boolean(v) => buf.put_u8(v as u8),
            ValueData::Object(id) => buf.put_u64(id),
            ValueData::Void => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data {
            ValueData::Byte(v) => write!(f, "(byte) {}", v),
            ValueData::Char(v) => write!(f, "(char) {:?}", char::from_u32(u32::from(v)).unwrap_or('?')),
            ValueData::Float(v) => write!(f, "(float) {}", v),
            ValueData::Double(v) => write!(f, "(double) {}", v),
            ValueData::Int(v) => write!(f, "(int) {}", v),
            ValueData::Long(v) => write!(f, "(long) {}", v),
            ValueData::Short(v) => write!(f, "(short) {}", v),
            ValueData::Boolean(v) => write!(f, "(boolean) {}", v),
            ValueData::Object(NULL_OBJECT) => write!(f, "(object) null"),
            ValueData::Object(id) => write!(f, "({}) @{:x}", self.tag as char, id),
            ValueData::Void => write!(f, "(void)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_wire_layout() {
        let mut buf = Vec::new();
        Location::new(0x10, 0x20, 7).write_to(&mut buf);

        assert_eq!(buf.len(), 25);
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[17..25], &[0, 0, 0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::int(42).to_string(), "(int) 42");
        assert_eq!(Value::object(TypeTag::Object, 0).to_string(), "(object) null");
        assert_eq!(Value::object(TypeTag::Thread, 0x2a).to_string(), "(t) @2a");
        assert_eq!(Value::void().to_string(), "(void)");
    }
}
