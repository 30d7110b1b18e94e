use crate::packstream::{PackstreamError, PackstreamWriter, StructHeader, Value};

pub const SUCCESS: u8 = 0x70;
pub const RECORD: u8 = 0x71;
pub const IGNORED: u8 = 0x7E;
pub const FAILURE: u8 = 0x7F;

/// Ordered response metadata.
pub type Metadata = Vec<(String, Value)>;

/// Message sent from the server to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success { metadata: Metadata },
    Record { fields: Vec<Value> },
    Ignored,
    Failure { code: String, message: String },
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>, PackstreamError> {
        let mut writer = PackstreamWriter::new();
        match self {
            Response::Success { metadata } => {
                writer.write_struct_header(StructHeader {
                    tag: SUCCESS,
                    size: 1,
                })?;
                writer.write_map_entries(metadata.iter().map(|(k, v)| (k.as_str(), v)))?;
            }
            Response::Record { fields } => {
                writer.write_struct_header(StructHeader {
                    tag: RECORD,
                    size: 1,
                })?;
                writer.write_list_header(fields.len())?;
                for field in fields {
                    writer.write_value(field)?;
                }
            }
            Response::Ignored => {
                writer.write_struct_header(StructHeader {
                    tag: IGNORED,
                    size: 0,
                })?;
            }
            Response::Failure { code, message } => {
                writer.write_struct_header(StructHeader {
                    tag: FAILURE,
                    size: 1,
                })?;
                let code = Value::from(code.as_str());
                let message = Value::from(message.as_str());
                writer.write_map_entries([("code", &code), ("message", &message)].into_iter())?;
            }
        }
        Ok(writer.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use crate::packstream::PackstreamReader;

    use super::*;

    #[test]
    fn ignored_is_empty_struct() {
        assert_eq!(Response::Ignored.encode().unwrap(), vec![0xB0, IGNORED]);
    }

    #[test]
    fn success_keeps_metadata_order() {
        let resp = Response::Success {
            metadata: vec![
                ("server".into(), Value::from("tether/0.1.0")),
                ("connection_id".into(), Value::from("bolt-1")),
            ],
        };

        let bytes = resp.encode().unwrap();
        let mut reader = PackstreamReader::new(&bytes);
        let header = reader.read_struct_header().unwrap();
        assert_eq!(header, StructHeader { tag: SUCCESS, size: 1 });
        assert_eq!(reader.read_map_header().unwrap(), 2);
        assert_eq!(reader.read_string().unwrap(), "server");
    }

    #[test]
    fn failure_carries_code_and_message() {
        let resp = Response::Failure {
            code: "Neo.ClientError.Statement.SyntaxError".into(),
            message: "bad".into(),
        };

        let bytes = resp.encode().unwrap();
        let mut reader = PackstreamReader::new(&bytes);
        let value = reader.read_struct().unwrap();
        assert_eq!(value.tag, FAILURE);
        let Value::Map(map) = &value.fields[0] else {
            panic!("expected map");
        };
        assert_eq!(
            map.get("code"),
            Some(&Value::from("Neo.ClientError.Statement.SyntaxError"))
        );
        assert_eq!(map.get("message"), Some(&Value::from("bad")));
    }

    #[test]
    fn record_is_list_of_values() {
        let resp = Response::Record {
            fields: vec![Value::Integer(1), Value::from("a")],
        };

        let bytes = resp.encode().unwrap();
        assert_eq!(bytes, vec![0xB1, RECORD, 0x92, 0x01, 0x81, b'a']);
    }
}
