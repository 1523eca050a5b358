// Helper functions for reading JDWP data types from command payloads

use crate::error::{DebugError, DebugResult};
use crate::types::{Location, Value, ValueData};
use bytes::Buf;

/// Read a JDWP string (4-byte length prefix + UTF-8 bytes)
pub fn read_string(buf: &mut &[u8]) -> DebugResult<String> {
    let len = read_u32(buf)? as usize;

    if buf.remaining() < len {
        return Err(DebugError::IllegalArgument(format!(
            "Not enough data for string: expected {}, got {}",
            len,
            buf.remaining()
        )));
    }

    let bytes = &buf[..len];
    buf.advance(len);

    String::from_utf8(bytes.to_vec())
        .map_err(|e| DebugError::IllegalArgument(format!("Invalid UTF-8 in string: {}", e)))
}

/// Read a u32
pub fn read_u32(buf: &mut &[u8]) -> DebugResult<u32> {
    if buf.remaining() < 4 {
        return Err(DebugError::IllegalArgument("Not enough data for u32".to_string()));
    }
    Ok(buf.get_u32())
}

/// Read a i32
pub fn read_i32(buf: &mut &[u8]) -> DebugResult<i32> {
    if buf.remaining() < 4 {
        return Err(DebugError::IllegalArgument("Not enough data for i32".to_string()));
    }
    Ok(buf.get_i32())
}

/// Read a u8
pub fn read_u8(buf: &mut &[u8]) -> DebugResult<u8> {
    if buf.remaining() < 1 {
        return Err(DebugError::IllegalArgument("Not enough data for u8".to_string()));
    }
    Ok(buf.get_u8())
}

/// Read a boolean (one byte, non-zero is true)
pub fn read_bool(buf: &mut &[u8]) -> DebugResult<bool> {
    Ok(read_u8(buf)? != 0)
}

/// Read a u64
pub fn read_u64(buf: &mut &[u8]) -> DebugResult<u64> {
    if buf.remaining() < 8 {
        return Err(DebugError::IllegalArgument("Not enough data for u64".to_string()));
    }
    Ok(buf.get_u64())
}

/// Read a location (type tag, class, method, index)
pub fn read_location(buf: &mut &[u8]) -> DebugResult<Location> {
    let type_tag = read_u8(buf)?;
    let class_id = read_u64(buf)?;
    let method_id = read_u64(buf)?;
    let index = read_u64(buf)?;

    Ok(Location {
        type_tag,
        class_id,
        method_id,
        index,
    })
}

/// Read a tagged value (tag byte + payload)
pub fn read_tagged_value(buf: &mut &[u8]) -> DebugResult<Value> {
    let tag = read_u8(buf)?;
    let data = read_value_by_tag(tag, buf)?;
    Ok(Value { tag, data })
}

/// Read a value based on its type tag
pub fn read_value_by_tag(tag: u8, buf: &mut &[u8]) -> DebugResult<ValueData> {
    let width = match tag {
        66 | 90 => 1,
        67 | 83 => 2,
        70 | 73 => 4,
        68 | 74 => 8,
        86 => 0,
        76 | 115 | 116 | 103 | 108 | 99 | 91 => 8,
        _ => return Err(DebugError::IllegalArgument(format!("Unknown value tag: {}", tag))),
    };

    if buf.remaining() < width {
        return Err(DebugError::IllegalArgument(format!(
            "Not enough data for value with tag {}",
            tag
        )));
    }

    Ok(match tag {
        // 'B' = byte
        66 => ValueData::Byte(buf.get_i8()),
        // 'C' = char
        67 => ValueData::Char(buf.get_u16()),
        // 'D' = double
        68 => ValueData::Double(buf.get_f64()),
        // 'F' = float
        70 => ValueData::Float(buf.get_f32()),
        // 'I' = int
        73 => ValueData::Int(buf.get_i32()),
        // 'J' = long
        74 => ValueData::Long(buf.get_i64()),
        // 'S' = short
        83 => ValueData::Short(buf.get_i16()),
        // 'Z' = boolean
        90 => ValueData::Boolean(buf.get_u8() != 0),
        // 'V' = void
        86 => ValueData::Void,
        // Object types (L, s, t, g, l, c, [)
        _ => ValueData::Object(buf.get_u64()),
    })
}
