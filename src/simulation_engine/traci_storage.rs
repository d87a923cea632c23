//! Typed values and command framing of the TraCI wire format.

use crate::simulation_engine::traci_constants::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unknown data type 0x{0:02x}")]
    UnknownType(u8),
    #[error("string is not valid utf-8")]
    Utf8,
    #[error("invalid length {0}")]
    InvalidLength(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraciValue {
    Ubyte(u8),
    Byte(i8),
    Int(i32),
    Double(f64),
    String(String),
    StringList(Vec<String>),
    Position2D(f64, f64),
    Position3D(f64, f64, f64),
    BoundingBox(f64, f64, f64, f64),
    Polygon(Vec<(f64, f64)>),
    Color([u8; 4]),
    Compound(Vec<TraciValue>),
}

impl TraciValue {
    pub fn type_id(&self) -> u8 {
        match self {
            TraciValue::Ubyte(_) => TYPE_UBYTE,
            TraciValue::Byte(_) => TYPE_BYTE,
            TraciValue::Int(_) => TYPE_INTEGER,
            TraciValue::Double(_) => TYPE_DOUBLE,
            TraciValue::String(_) => TYPE_STRING,
            TraciValue::StringList(_) => TYPE_STRINGLIST,
            TraciValue::Position2D(..) => POSITION_2D,
            TraciValue::Position3D(..) => POSITION_3D,
            TraciValue::BoundingBox(..) => TYPE_BOUNDINGBOX,
            TraciValue::Polygon(_) => TYPE_POLYGON,
            TraciValue::Color(_) => TYPE_COLOR,
            TraciValue::Compound(_) => TYPE_COMPOUND,
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        TraciValue::String(value.into())
    }

    /// Write type id and value.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_id());
        match self {
            TraciValue::Ubyte(v) => buf.put_u8(*v),
            TraciValue::Byte(v) => buf.put_i8(*v),
            TraciValue::Int(v) => buf.put_i32(*v),
            TraciValue::Double(v) => buf.put_f64(*v),
            TraciValue::String(v) => put_string(buf, v),
            TraciValue::StringList(v) => put_string_list(buf, v),
            TraciValue::Position2D(x, y) => {
                buf.put_f64(*x);
                buf.put_f64(*y);
            }
            TraciValue::Position3D(x, y, z) => {
                buf.put_f64(*x);
                buf.put_f64(*y);
                buf.put_f64(*z);
            }
            TraciValue::BoundingBox(x1, y1, x2, y2) => {
                for v in [x1, y1, x2, y2] {
                    buf.put_f64(*v);
                }
            }
            TraciValue::Polygon(points) => {
                match u8::try_from(points.len()) {
                    Ok(count) if count > 0 => buf.put_u8(count),
                    _ => {
                        buf.put_u8(0);
                        buf.put_i32(points.len() as i32);
                    }
                }
                for (x, y) in points {
                    buf.put_f64(*x);
                    buf.put_f64(*y);
                }
            }
            TraciValue::Color(rgba) => buf.put_slice(rgba),
            TraciValue::Compound(items) => {
                buf.put_i32(items.len() as i32);
                for item in items {
                    item.write(buf);
                }
            }
        }
    }

    /// Read type id and value.
    pub fn read(buf: &mut Bytes) -> Result<TraciValue, StorageError> {
        let type_id = get_u8(buf)?;
        Self::read_typed(type_id, buf)
    }

    pub fn read_typed(type_id: u8, buf: &mut Bytes) -> Result<TraciValue, StorageError> {
        let value = match type_id {
            TYPE_UBYTE => TraciValue::Ubyte(get_u8(buf)?),
            TYPE_BYTE => TraciValue::Byte(get_u8(buf)? as i8),
            TYPE_INTEGER => TraciValue::Int(get_i32(buf)?),
            TYPE_DOUBLE => TraciValue::Double(get_f64(buf)?),
            TYPE_STRING => TraciValue::String(get_string(buf)?),
            TYPE_STRINGLIST => TraciValue::StringList(get_string_list(buf)?),
            POSITION_2D => TraciValue::Position2D(get_f64(buf)?, get_f64(buf)?),
            POSITION_3D => TraciValue::Position3D(get_f64(buf)?, get_f64(buf)?, get_f64(buf)?),
            TYPE_BOUNDINGBOX => TraciValue::BoundingBox(
                get_f64(buf)?,
                get_f64(buf)?,
                get_f64(buf)?,
                get_f64(buf)?,
            ),
            TYPE_POLYGON => {
                // a zero count byte is followed by the real count as int
                let count = match get_u8(buf)? {
                    0 => get_length(buf)?,
                    short => short as usize,
                };
                let mut points = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    points.push((get_f64(buf)?, get_f64(buf)?));
                }
                TraciValue::Polygon(points)
            }
            TYPE_COLOR => {
                ensure(buf, 4)?;
                let mut rgba = [0u8; 4];
                buf.copy_to_slice(&mut rgba);
                TraciValue::Color(rgba)
            }
            TYPE_COMPOUND => {
                let count = get_length(buf)?;
                let mut items = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    items.push(TraciValue::read(buf)?);
                }
                TraciValue::Compound(items)
            }
            other => return Err(StorageError::UnknownType(other)),
        };
        Ok(value)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TraciValue::Double(v) => Some(*v),
            TraciValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            TraciValue::Int(v) => Some(*v),
            TraciValue::Ubyte(v) => Some(*v as i32),
            TraciValue::Byte(v) => Some(*v as i32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TraciValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            TraciValue::StringList(v) => Some(v),
            _ => None,
        }
    }

    /// Points of a polygon, a bounding box (two corners) or a single position.
    pub fn as_points(&self) -> Option<Vec<(f64, f64)>> {
        match self {
            TraciValue::Polygon(points) => Some(points.clone()),
            TraciValue::BoundingBox(x1, y1, x2, y2) => Some(vec![(*x1, *y1), (*x2, *y2)]),
            TraciValue::Position2D(x, y) => Some(vec![(*x, *y)]),
            _ => None,
        }
    }

    pub fn as_position3d(&self) -> Option<(f64, f64, f64)> {
        match self {
            TraciValue::Position3D(x, y, z) => Some((*x, *y, *z)),
            TraciValue::Position2D(x, y) => Some((*x, *y, 0.0)),
            _ => None,
        }
    }
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), StorageError> {
    if buf.remaining() < needed {
        return Err(StorageError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8, StorageError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_i32(buf: &mut Bytes) -> Result<i32, StorageError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_f64(buf: &mut Bytes) -> Result<f64, StorageError> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

fn get_length(buf: &mut Bytes) -> Result<usize, StorageError> {
    let length = get_i32(buf)?;
    usize::try_from(length).map_err(|_| StorageError::InvalidLength(length as i64))
}

pub fn get_string(buf: &mut Bytes) -> Result<String, StorageError> {
    let length = get_length(buf)?;
    ensure(buf, length)?;
    let raw = buf.split_to(length);
    String::from_utf8(raw.to_vec()).map_err(|_| StorageError::Utf8)
}

pub fn get_string_list(buf: &mut Bytes) -> Result<Vec<String>, StorageError> {
    let count = get_length(buf)?;
    let mut strings = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        strings.push(get_string(buf)?);
    }
    Ok(strings)
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_i32(value.len() as i32);
    buf.put_slice(value.as_bytes());
}

pub fn put_string_list(buf: &mut BytesMut, values: &[String]) {
    buf.put_i32(values.len() as i32);
    for value in values {
        put_string(buf, value);
    }
}

/// Append one command: length (short or extended form), id, content.
pub fn put_command(buf: &mut BytesMut, command_id: u8, content: &[u8]) {
    let short_length = 1 + 1 + content.len();
    if short_length <= u8::MAX as usize {
        buf.put_u8(short_length as u8);
    } else {
        buf.put_u8(0);
        buf.put_i32((short_length + 4) as i32);
    }
    buf.put_u8(command_id);
    buf.put_slice(content);
}

/// Split the next command off `buf`, returning its id and content.
pub fn take_command(buf: &mut Bytes) -> Result<(u8, Bytes), StorageError> {
    let short_length = get_u8(buf)? as usize;
    let (length, header) = if short_length == 0 {
        (get_length(buf)?, 1 + 4 + 1)
    } else {
        (short_length, 1 + 1)
    };
    if length < header {
        return Err(StorageError::InvalidLength(length as i64));
    }
    let command_id = get_u8(buf)?;
    let content_length = length - header;
    ensure(buf, content_length)?;
    Ok((command_id, buf.split_to(content_length)))
}
