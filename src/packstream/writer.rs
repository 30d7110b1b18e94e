use super::{PackstreamError, StructHeader, Value, marker::*};

/// Growable buffer encoding PackStream values.
#[derive(Debug, Default, Clone)]
pub struct PackstreamWriter {
    buf: Vec<u8>,
}

impl PackstreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_null(&mut self) {
        self.buf.push(NULL);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(if value { TRUE } else { FALSE });
    }

    pub fn write_int(&mut self, value: i64) {
        if (TINY_INT_MIN..=TINY_INT_MAX).contains(&value) {
            self.buf.push(value as i8 as u8);
        } else if (i8::MIN as i64..TINY_INT_MIN).contains(&value) {
            self.buf.push(INT_8);
            self.buf.push(value as i8 as u8);
        } else if (i16::MIN as i64..=i16::MAX as i64).contains(&value) {
            self.buf.push(INT_16);
            self.buf.extend_from_slice(&(value as i16).to_be_bytes());
        } else if (i32::MIN as i64..=i32::MAX as i64).contains(&value) {
            self.buf.push(INT_32);
            self.buf.extend_from_slice(&(value as i32).to_be_bytes());
        } else {
            self.buf.push(INT_64);
            self.buf.extend_from_slice(&value.to_be_bytes());
        }
    }

    pub fn write_float(&mut self, value: f64) {
        self.buf.push(FLOAT_64);
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> Result<(), PackstreamError> {
        self.write_sized(value.len(), None, [BYTES_8, BYTES_16, BYTES_32], "byte array")?;
        self.buf.extend_from_slice(value);
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), PackstreamError> {
        self.write_sized(
            value.len(),
            Some(TINY_STRING),
            [STRING_8, STRING_16, STRING_32],
            "string",
        )?;
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_list_header(&mut self, len: usize) -> Result<(), PackstreamError> {
        self.write_sized(len, Some(TINY_LIST), [LIST_8, LIST_16, LIST_32], "list")
    }

    pub fn write_map_header(&mut self, len: usize) -> Result<(), PackstreamError> {
        self.write_sized(len, Some(TINY_MAP), [MAP_8, MAP_16, MAP_32], "map")
    }

    pub fn write_struct_header(&mut self, header: StructHeader) -> Result<(), PackstreamError> {
        match header.size {
            n if n < 0x10 => self.buf.push(TINY_STRUCT | n as u8),
            n if n <= u8::MAX as usize => {
                self.buf.push(STRUCT_8);
                self.buf.push(n as u8);
            }
            n if n <= u16::MAX as usize => {
                self.buf.push(STRUCT_16);
                self.buf.extend_from_slice(&(n as u16).to_be_bytes());
            }
            _ => return Err(PackstreamError::Oversized("struct")),
        }
        self.buf.push(header.tag);
        Ok(())
    }

    /// Writes a map whose entries keep the iteration order of `entries`.
    pub fn write_map_entries<'v, I>(&mut self, entries: I) -> Result<(), PackstreamError>
    where
        I: ExactSizeIterator<Item = (&'v str, &'v Value)>,
    {
        self.write_map_header(entries.len())?;
        for (key, value) in entries {
            self.write_string(key)?;
            self.write_value(value)?;
        }
        Ok(())
    }

    pub fn write_value(&mut self, value: &Value) -> Result<(), PackstreamError> {
        match value {
            Value::Null => self.write_null(),
            Value::Boolean(b) => self.write_bool(*b),
            Value::Integer(i) => self.write_int(*i),
            Value::Float(f) => self.write_float(*f),
            Value::Bytes(b) => self.write_bytes(b)?,
            Value::String(s) => self.write_string(s)?,
            Value::List(items) => {
                self.write_list_header(items.len())?;
                for item in items {
                    self.write_value(item)?;
                }
            }
            Value::Map(map) => {
                self.write_map_entries(map.iter().map(|(k, v)| (k.as_str(), v)))?;
            }
            Value::Struct(s) => {
                self.write_struct_header(StructHeader {
                    tag: s.tag,
                    size: s.fields.len(),
                })?;
                for field in &s.fields {
                    self.write_value(field)?;
                }
            }
        }
        Ok(())
    }

    fn write_sized(
        &mut self,
        len: usize,
        tiny: Option<u8>,
        sized: [u8; 3],
        what: &'static str,
    ) -> Result<(), PackstreamError> {
        match (tiny, len) {
            (Some(tiny), n) if n < 0x10 => self.buf.push(tiny | n as u8),
            (_, n) if n <= u8::MAX as usize => {
                self.buf.push(sized[0]);
                self.buf.push(n as u8);
            }
            (_, n) if n <= u16::MAX as usize => {
                self.buf.push(sized[1]);
                self.buf.extend_from_slice(&(n as u16).to_be_bytes());
            }
            (_, n) if n <= u32::MAX as usize => {
                self.buf.push(sized[2]);
                self.buf.extend_from_slice(&(n as u32).to_be_bytes());
            }
            _ => return Err(PackstreamError::Oversized(what)),
        }
        Ok(())
    }
}
