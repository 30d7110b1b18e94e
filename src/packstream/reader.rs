use log::trace;

use super::{MAX_DEPTH, PackstreamError, StructHeader, Structure, Type, Value, ValueMap, marker::*};

/// Cursor decoding PackStream values from a borrowed buffer.
#[derive(Debug, Clone)]
pub struct PackstreamReader<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> PackstreamReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            depth: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the next marker byte without advancing.
    pub fn peek_marker(&self) -> Result<u8, PackstreamError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(PackstreamError::BufferUnderflow {
                needed: 1,
                remaining: 0,
            })
    }

    pub fn peek_type(&self) -> Result<Type, PackstreamError> {
        let m = self.peek_marker()?;
        Type::of_marker(m).ok_or_else(|| malformed_marker(m))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PackstreamError> {
        if self.remaining() < n {
            return Err(PackstreamError::BufferUnderflow {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PackstreamError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, PackstreamError> {
        Ok(self.take_array::<1>()?[0])
    }

    fn read_u16(&mut self) -> Result<u16, PackstreamError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    fn read_u32(&mut self) -> Result<u32, PackstreamError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    /// Reads a marker and checks it belongs to the `expected` type family.
    fn read_marker_of(&mut self, expected: Type) -> Result<u8, PackstreamError> {
        let m = self.peek_marker()?;
        let actual = Type::of_marker(m).ok_or_else(|| malformed_marker(m))?;
        if actual != expected {
            return Err(PackstreamError::UnexpectedType { expected, actual });
        }
        self.pos += 1;
        Ok(m)
    }

    /// Resolves the length of a sized value from its marker.
    fn read_length(&mut self, m: u8, tiny: u8, sized: [u8; 3]) -> Result<usize, PackstreamError> {
        if m & 0xF0 == tiny {
            return Ok((m & 0x0F) as usize);
        }
        match m {
            m if m == sized[0] => Ok(self.read_u8()? as usize),
            m if m == sized[1] => Ok(self.read_u16()? as usize),
            m if m == sized[2] => Ok(self.read_u32()? as usize),
            m => Err(malformed_marker(m)),
        }
    }

    /// Runs `read` one nesting level deeper, failing past [`MAX_DEPTH`].
    fn nested<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> Result<T, PackstreamError>,
    ) -> Result<T, PackstreamError> {
        if self.depth >= MAX_DEPTH {
            return Err(PackstreamError::MalformedValue(format!(
                "values nested deeper than {MAX_DEPTH} levels"
            )));
        }
        self.depth += 1;
        let out = read(self);
        self.depth -= 1;
        out
    }

    pub fn read_null(&mut self) -> Result<(), PackstreamError> {
        self.read_marker_of(Type::Null).map(|_| ())
    }

    pub fn read_bool(&mut self) -> Result<bool, PackstreamError> {
        Ok(self.read_marker_of(Type::Boolean)? == TRUE)
    }

    pub fn read_int(&mut self) -> Result<i64, PackstreamError> {
        let m = self.read_marker_of(Type::Integer)?;
        Ok(match m {
            INT_8 => self.read_u8()? as i8 as i64,
            INT_16 => self.read_u16()? as i16 as i64,
            INT_32 => self.read_u32()? as i32 as i64,
            INT_64 => i64::from_be_bytes(self.take_array()?),
            tiny => tiny as i8 as i64,
        })
    }

    pub fn read_float(&mut self) -> Result<f64, PackstreamError> {
        self.read_marker_of(Type::Float)?;
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, PackstreamError> {
        let m = self.read_marker_of(Type::Bytes)?;
        let len = match m {
            BYTES_8 => self.read_u8()? as usize,
            BYTES_16 => self.read_u16()? as usize,
            _ => self.read_u32()? as usize,
        };
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String, PackstreamError> {
        let m = self.read_marker_of(Type::String)?;
        let len = self.read_length(m, TINY_STRING, [STRING_8, STRING_16, STRING_32])?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| PackstreamError::InvalidUtf8)
    }

    /// Reads a list header and returns the number of elements.
    pub fn read_list_header(&mut self) -> Result<usize, PackstreamError> {
        let m = self.read_marker_of(Type::List)?;
        self.read_length(m, TINY_LIST, [LIST_8, LIST_16, LIST_32])
    }

    /// Reads a map header and returns the number of entries.
    pub fn read_map_header(&mut self) -> Result<usize, PackstreamError> {
        let m = self.read_marker_of(Type::Map)?;
        self.read_length(m, TINY_MAP, [MAP_8, MAP_16, MAP_32])
    }

    pub fn read_list(&mut self) -> Result<Vec<Value>, PackstreamError> {
        self.nested(|r| {
            let len = r.read_list_header()?;
            let mut out = Vec::with_capacity(len.min(r.remaining()));
            for _ in 0..len {
                out.push(r.read_value()?);
            }
            Ok(out)
        })
    }

    pub fn read_map(&mut self) -> Result<ValueMap, PackstreamError> {
        self.nested(|r| {
            let len = r.read_map_header()?;
            let mut out = ValueMap::new();
            for _ in 0..len {
                let key = match r.peek_type()? {
                    Type::String => r.read_string()?,
                    other => {
                        return Err(PackstreamError::MalformedValue(format!(
                            "map keys must be strings, found {other}"
                        )));
                    }
                };
                let value = r.read_value()?;
                out.insert(key, value);
            }
            Ok(out)
        })
    }

    /// Reads a struct header.
    ///
    /// The header is parsed from a scratch cursor; on failure the position of `self` is
    /// left untouched.
    pub fn read_struct_header(&mut self) -> Result<StructHeader, PackstreamError> {
        let mut scratch = self.clone();
        let m = scratch.read_marker_of(Type::Struct)?;
        let size = match m {
            STRUCT_8 => scratch.read_u8()? as usize,
            STRUCT_16 => scratch.read_u16()? as usize,
            tiny => (tiny & 0x0F) as usize,
        };
        let tag = scratch.read_u8()?;

        self.pos = scratch.pos;
        trace!("struct header tag={tag:#04x} size={size}");
        Ok(StructHeader { tag, size })
    }

    pub fn read_struct(&mut self) -> Result<Structure, PackstreamError> {
        self.nested(|r| {
            let header = r.read_struct_header()?;
            let mut fields = Vec::with_capacity(header.size.min(r.remaining()));
            for _ in 0..header.size {
                fields.push(r.read_value()?);
            }
            Ok(Structure {
                tag: header.tag,
                fields,
            })
        })
    }

    /// Reads the next value of any type.
    pub fn read_value(&mut self) -> Result<Value, PackstreamError> {
        Ok(match self.peek_type()? {
            Type::Null => {
                self.read_null()?;
                Value::Null
            }
            Type::Boolean => Value::Boolean(self.read_bool()?),
            Type::Integer => Value::Integer(self.read_int()?),
            Type::Float => Value::Float(self.read_float()?),
            Type::Bytes => Value::Bytes(self.read_bytes()?),
            Type::String => Value::String(self.read_string()?),
            Type::List => Value::List(self.read_list()?),
            Type::Map => Value::Map(self.read_map()?),
            Type::Struct => Value::Struct(self.read_struct()?),
        })
    }
}

fn malformed_marker(m: u8) -> PackstreamError {
    PackstreamError::MalformedValue(format!("unknown marker {m:#04x}"))
}
