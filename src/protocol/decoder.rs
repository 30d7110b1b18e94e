//! Request message decoding.
//!
//! Every request is a PackStream struct. The struct tag selects a [`MessageKind`] through a
//! per-version [`SignatureTable`]; the kind fixes the expected arity and the decoder used for
//! its fields. Field failures are reported as [`DecodeError::IllegalStructArgument`] naming the
//! offending field, never as raw codec errors.
use std::{collections::BTreeMap, time::Duration};

use log::trace;
use thiserror::Error;

use crate::packstream::{PackstreamError, PackstreamReader, StructHeader, Value, ValueMap};

use super::message::{
    AccessMode, AuthToken, BeginMessage, BookmarkParser, HelloMessage, MessageKind,
    RequestMessage, RoutingContext, RunMessage, SENSITIVE_KEYS, StatementRef, StreamLimit,
    StreamMessage, TransactionParams,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("illegal struct size: expected {expected} fields, got {actual}")]
    IllegalStructSize { expected: usize, actual: usize },

    #[error("illegal value for field \"{field}\": {reason}")]
    IllegalStructArgument { field: String, reason: String },

    #[error("unknown message signature {0:#04x}")]
    UnknownSignature(u8),

    #[error("malformed message: {0}")]
    Malformed(#[from] PackstreamError),

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

fn argument(field: &str, reason: impl Into<String>) -> DecodeError {
    DecodeError::IllegalStructArgument {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Attributes a codec failure to the field being read.
fn field<T>(name: &str, result: Result<T, PackstreamError>) -> Result<T, DecodeError> {
    result.map_err(|e| argument(name, e.to_string()))
}

/// Lookup table from struct tag to message kind for one protocol version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureTable {
    kinds: BTreeMap<u8, MessageKind>,
}

impl SignatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag assignments used by the 4.x protocol family.
    pub fn v4() -> Self {
        Self::new()
            .with(0x01, MessageKind::Hello)
            .with(0x02, MessageKind::Goodbye)
            .with(0x0F, MessageKind::Reset)
            .with(0x10, MessageKind::Run)
            .with(0x11, MessageKind::Begin)
            .with(0x12, MessageKind::Commit)
            .with(0x13, MessageKind::Rollback)
            .with(0x2F, MessageKind::Discard)
            .with(0x3F, MessageKind::Pull)
    }

    pub fn with(mut self, tag: u8, kind: MessageKind) -> Self {
        self.kinds.insert(tag, kind);
        self
    }

    pub fn kind(&self, tag: u8) -> Option<MessageKind> {
        self.kinds.get(&tag).copied()
    }

    pub fn tag(&self, kind: MessageKind) -> Option<u8> {
        self.kinds
            .iter()
            .find_map(|(tag, k)| (*k == kind).then_some(*tag))
    }
}

/// Decodes whole request frames.
pub struct MessageDecoder<'a> {
    signatures: &'a SignatureTable,
    bookmarks: &'a dyn BookmarkParser,
}

impl<'a> MessageDecoder<'a> {
    pub fn new(signatures: &'a SignatureTable, bookmarks: &'a dyn BookmarkParser) -> Self {
        Self {
            signatures,
            bookmarks,
        }
    }

    pub fn decode(&self, frame: &[u8]) -> Result<RequestMessage, DecodeError> {
        let mut reader = PackstreamReader::new(frame);
        let header = reader.read_struct_header()?;
        let kind = self
            .signatures
            .kind(header.tag)
            .ok_or(DecodeError::UnknownSignature(header.tag))?;
        trace!("decoding {} ({} fields)", kind.name(), header.size);

        check_arity(kind, header)?;
        let message = match kind {
            MessageKind::Hello => RequestMessage::Hello(read_hello(&mut reader)?),
            MessageKind::Run => RequestMessage::Run(self.read_run(&mut reader)?),
            MessageKind::Begin => RequestMessage::Begin(self.read_begin(&mut reader)?),
            MessageKind::Discard => RequestMessage::Discard(read_stream(&mut reader)?),
            MessageKind::Pull => RequestMessage::Pull(read_stream(&mut reader)?),
            MessageKind::Commit => RequestMessage::Commit,
            MessageKind::Rollback => RequestMessage::Rollback,
            MessageKind::Reset => RequestMessage::Reset,
            MessageKind::Goodbye => RequestMessage::Goodbye,
        };

        if !reader.is_empty() {
            return Err(DecodeError::TrailingBytes(reader.remaining()));
        }
        Ok(message)
    }

    fn read_run(&self, reader: &mut PackstreamReader<'_>) -> Result<RunMessage, DecodeError> {
        let statement = field("statement", reader.read_string())?;
        let parameters = field("parameters", reader.read_map())?;
        let metadata = field("metadata", reader.read_map())?;

        Ok(RunMessage {
            statement,
            parameters,
            transaction: self.transaction_params(metadata)?,
        })
    }

    fn read_begin(&self, reader: &mut PackstreamReader<'_>) -> Result<BeginMessage, DecodeError> {
        let metadata = field("metadata", reader.read_map())?;

        Ok(BeginMessage {
            transaction: self.transaction_params(metadata)?,
        })
    }

    fn transaction_params(&self, mut meta: ValueMap) -> Result<TransactionParams, DecodeError> {
        let bookmarks = match meta.remove("bookmarks") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => self
                .bookmarks
                .parse(&value)
                .map_err(|reason| argument("bookmarks", reason))?,
        };

        let timeout = match meta.remove("tx_timeout") {
            None | Some(Value::Null) => None,
            Some(Value::Integer(ms)) if ms >= 0 => Some(Duration::from_millis(ms as u64)),
            Some(other) => {
                return Err(argument(
                    "tx_timeout",
                    format!("expected a non-negative integer, found {other:?}"),
                ));
            }
        };

        let mode = match meta.remove("mode") {
            None | Some(Value::Null) => AccessMode::Write,
            Some(Value::String(m)) if m == "r" => AccessMode::Read,
            Some(Value::String(m)) if m == "w" => AccessMode::Write,
            Some(other) => {
                return Err(argument(
                    "mode",
                    format!("expected \"r\" or \"w\", found {other:?}"),
                ));
            }
        };

        let metadata = match meta.remove("tx_metadata") {
            None | Some(Value::Null) => ValueMap::new(),
            Some(Value::Map(m)) => m,
            Some(other) => {
                return Err(argument(
                    "tx_metadata",
                    format!("expected a map, found {}", other.value_type()),
                ));
            }
        };

        let database = match meta.remove("db") {
            None | Some(Value::Null) => None,
            Some(Value::String(db)) if db.is_empty() => None,
            Some(Value::String(db)) => Some(db),
            Some(other) => {
                return Err(argument(
                    "db",
                    format!("expected a string, found {}", other.value_type()),
                ));
            }
        };

        Ok(TransactionParams {
            bookmarks,
            timeout,
            mode,
            metadata,
            database,
        })
    }
}

fn check_arity(kind: MessageKind, header: StructHeader) -> Result<(), DecodeError> {
    if header.size != kind.arity() {
        return Err(DecodeError::IllegalStructSize {
            expected: kind.arity(),
            actual: header.size,
        });
    }
    Ok(())
}

fn read_hello(reader: &mut PackstreamReader<'_>) -> Result<HelloMessage, DecodeError> {
    let mut meta = field("metadata", reader.read_map())?;

    let user_agent = match meta.remove("user_agent") {
        Some(Value::String(agent)) => agent,
        Some(other) => {
            return Err(argument(
                "user_agent",
                format!("expected a string, found {}", other.value_type()),
            ));
        }
        None => return Err(argument("user_agent", "expected a value")),
    };

    let routing = match meta.remove("routing") {
        None | Some(Value::Null) => RoutingContext::default(),
        Some(Value::Map(entries)) => {
            let mut parameters = BTreeMap::new();
            for (key, value) in entries {
                match value {
                    Value::String(s) => {
                        parameters.insert(key, s);
                    }
                    other => {
                        return Err(argument(
                            "routing",
                            format!(
                                "expected string values, found {} for \"{key}\"",
                                other.value_type()
                            ),
                        ));
                    }
                }
            }
            RoutingContext {
                enabled: true,
                parameters,
            }
        }
        Some(other) => {
            return Err(argument(
                "routing",
                format!("expected a map, found {}", other.value_type()),
            ));
        }
    };

    let mut token = ValueMap::new();
    for (key, value) in meta {
        let value = if SENSITIVE_KEYS.contains(&key.as_str()) {
            match value {
                Value::String(s) => Value::Bytes(s.into_bytes()),
                Value::Bytes(b) => Value::Bytes(b),
                Value::Null => Value::Null,
                other => {
                    return Err(argument(
                        &key,
                        format!("expected a string, found {}", other.value_type()),
                    ));
                }
            }
        } else {
            value
        };
        token.insert(key, value);
    }

    Ok(HelloMessage {
        user_agent,
        auth_token: AuthToken(token),
        routing,
    })
}

fn read_stream(reader: &mut PackstreamReader<'_>) -> Result<StreamMessage, DecodeError> {
    let meta = field("metadata", reader.read_map())?;

    let limit = match meta.get("n") {
        Some(Value::Integer(-1)) => StreamLimit::All,
        Some(Value::Integer(n)) if *n >= 0 => StreamLimit::Rows(*n as u64),
        Some(other) => {
            return Err(argument(
                "n",
                format!("expected -1 or a non-negative integer, found {other:?}"),
            ));
        }
        None => return Err(argument("n", "expected a value")),
    };

    let statement = match meta.get("qid") {
        None | Some(Value::Null) | Some(Value::Integer(-1)) => StatementRef::Latest,
        Some(Value::Integer(id)) if *id >= 0 => StatementRef::Id(*id as u64),
        Some(other) => {
            return Err(argument(
                "qid",
                format!("expected -1 or a non-negative integer, found {other:?}"),
            ));
        }
    };

    Ok(StreamMessage { limit, statement })
}

#[cfg(test)]
mod tests {
    use crate::{
        packstream::PackstreamWriter,
        protocol::message::{Bookmark, StringBookmarkParser},
    };

    use super::*;

    fn frame(tag: u8, fields: &[Value]) -> Vec<u8> {
        let mut writer = PackstreamWriter::new();
        writer
            .write_struct_header(StructHeader {
                tag,
                size: fields.len(),
            })
            .unwrap();
        for f in fields {
            writer.write_value(f).unwrap();
        }
        writer.into_bytes()
    }

    fn map(entries: &[(&str, Value)]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn decode(bytes: &[u8]) -> Result<RequestMessage, DecodeError> {
        let table = SignatureTable::v4();
        MessageDecoder::new(&table, &StringBookmarkParser).decode(bytes)
    }

    #[test]
    fn hello_splits_agent_token_and_routing() {
        let bytes = frame(
            0x01,
            &[map(&[
                ("user_agent", Value::from("drv/1.0")),
                ("scheme", Value::from("basic")),
                ("principal", Value::from("neo")),
                ("credentials", Value::from("secret")),
                ("routing", map(&[("address", Value::from("db:7687"))])),
            ])],
        );

        let RequestMessage::Hello(hello) = decode(&bytes).unwrap() else {
            panic!("expected hello");
        };
        assert_eq!(hello.user_agent, "drv/1.0");
        assert_eq!(hello.auth_token.scheme(), Some("basic"));
        assert_eq!(hello.auth_token.principal(), Some("neo"));
        assert_eq!(hello.auth_token.credentials(), Some(&b"secret"[..]));
        assert!(hello.auth_token.get("user_agent").is_none());
        assert!(hello.auth_token.get("routing").is_none());
        assert!(hello.routing.enabled);
        assert_eq!(
            hello.routing.parameters.get("address").map(String::as_str),
            Some("db:7687")
        );
    }

    #[test]
    fn hello_without_routing_is_disabled() {
        let bytes = frame(
            0x01,
            &[map(&[
                ("user_agent", Value::from("drv/1.0")),
                ("scheme", Value::from("none")),
            ])],
        );

        let RequestMessage::Hello(hello) = decode(&bytes).unwrap() else {
            panic!("expected hello");
        };
        assert_eq!(hello.routing, RoutingContext::default());
    }

    #[test]
    fn hello_with_empty_routing_is_enabled() {
        let bytes = frame(
            0x01,
            &[map(&[
                ("user_agent", Value::from("drv/1.0")),
                ("routing", map(&[])),
            ])],
        );

        let RequestMessage::Hello(hello) = decode(&bytes).unwrap() else {
            panic!("expected hello");
        };
        assert!(hello.routing.enabled);
        assert!(hello.routing.parameters.is_empty());
    }

    #[test]
    fn hello_requires_user_agent() {
        let bytes = frame(0x01, &[map(&[("scheme", Value::from("none"))])]);

        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::IllegalStructArgument { field, .. }) if field == "user_agent"
        ));
    }

    #[test]
    fn hello_rejects_non_string_routing_values() {
        let bytes = frame(
            0x01,
            &[map(&[
                ("user_agent", Value::from("drv/1.0")),
                ("routing", map(&[("port", Value::Integer(7687))])),
            ])],
        );

        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::IllegalStructArgument { field, .. }) if field == "routing"
        ));
    }

    #[test]
    fn hello_rejects_routing_list() {
        let bytes = frame(
            0x01,
            &[map(&[
                ("user_agent", Value::from("drv/1.0")),
                ("routing", Value::List(vec![])),
            ])],
        );

        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::IllegalStructArgument { field, .. }) if field == "routing"
        ));
    }

    #[test]
    fn run_parses_transaction_params() {
        let bytes = frame(
            0x10,
            &[
                Value::from("RETURN $x"),
                map(&[("x", Value::Integer(1))]),
                map(&[
                    ("bookmarks", Value::List(vec![Value::from("bm:7")])),
                    ("tx_timeout", Value::Integer(1500)),
                    ("mode", Value::from("r")),
                    ("tx_metadata", map(&[("app", Value::from("test"))])),
                    ("db", Value::from("movies")),
                ]),
            ],
        );

        let RequestMessage::Run(run) = decode(&bytes).unwrap() else {
            panic!("expected run");
        };
        assert_eq!(run.statement, "RETURN $x");
        assert_eq!(run.parameters.get("x"), Some(&Value::Integer(1)));
        assert_eq!(run.transaction.bookmarks, vec![Bookmark("bm:7".into())]);
        assert_eq!(run.transaction.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(run.transaction.mode, AccessMode::Read);
        assert_eq!(
            run.transaction.metadata.get("app"),
            Some(&Value::from("test"))
        );
        assert_eq!(run.transaction.database.as_deref(), Some("movies"));
    }

    #[test]
    fn begin_defaults() {
        let bytes = frame(0x11, &[map(&[("db", Value::from(""))])]);

        let RequestMessage::Begin(begin) = decode(&bytes).unwrap() else {
            panic!("expected begin");
        };
        assert_eq!(begin.transaction, TransactionParams::default());
        assert_eq!(begin.transaction.mode, AccessMode::Write);
    }

    #[test]
    fn begin_rejects_unknown_mode() {
        let bytes = frame(0x11, &[map(&[("mode", Value::from("x"))])]);

        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::IllegalStructArgument { field, .. }) if field == "mode"
        ));
    }

    #[test]
    fn run_field_errors_name_the_field() {
        let bytes = frame(0x10, &[Value::Integer(1), map(&[]), map(&[])]);

        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::IllegalStructArgument { field, .. }) if field == "statement"
        ));
    }

    #[test]
    fn deeply_nested_parameters_are_rejected() {
        // RUN "x" {"p": [[[...]]]} {}
        let mut bytes = vec![0xB3, 0x10, 0x81, b'x', 0xA1, 0x81, b'p'];
        bytes.extend(std::iter::repeat_n(0x91, 200_000));
        bytes.push(0x90);
        bytes.push(0xA0);

        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::IllegalStructArgument { field, .. }) if field == "parameters"
        ));
    }

    #[test]
    fn pull_limits_and_qid() {
        let bytes = frame(
            0x3F,
            &[map(&[("n", Value::Integer(1000)), ("qid", Value::Integer(-1))])],
        );
        assert_eq!(
            decode(&bytes).unwrap(),
            RequestMessage::Pull(StreamMessage {
                limit: StreamLimit::Rows(1000),
                statement: StatementRef::Latest,
            })
        );

        let bytes = frame(
            0x2F,
            &[map(&[("n", Value::Integer(-1)), ("qid", Value::Integer(3))])],
        );
        assert_eq!(
            decode(&bytes).unwrap(),
            RequestMessage::Discard(StreamMessage {
                limit: StreamLimit::All,
                statement: StatementRef::Id(3),
            })
        );
    }

    #[test]
    fn pull_rejects_negative_n() {
        let bytes = frame(0x3F, &[map(&[("n", Value::Integer(-5))])]);

        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::IllegalStructArgument { field, .. }) if field == "n"
        ));
    }

    #[test]
    fn arity_is_validated() {
        let inputs = vec![
            (0x01, 2, 1),
            (0x11, 0, 1),
            (0x2F, 2, 1),
            (0x3F, 0, 1),
            (0x10, 1, 3),
            (0x12, 1, 0),
            (0x13, 2, 0),
            (0x0F, 1, 0),
        ];

        for (tag, size, expected) in inputs {
            let fields = vec![Value::Null; size];
            assert_eq!(
                decode(&frame(tag, &fields)),
                Err(DecodeError::IllegalStructSize {
                    expected,
                    actual: size
                }),
                "tag {tag:#04x}"
            );
        }
    }

    #[test]
    fn zero_field_messages() {
        assert_eq!(decode(&frame(0x12, &[])).unwrap(), RequestMessage::Commit);
        assert_eq!(decode(&frame(0x13, &[])).unwrap(), RequestMessage::Rollback);
        assert_eq!(decode(&frame(0x0F, &[])).unwrap(), RequestMessage::Reset);
        assert_eq!(decode(&frame(0x02, &[])).unwrap(), RequestMessage::Goodbye);
    }

    #[test]
    fn unknown_signature() {
        assert_eq!(
            decode(&frame(0x66, &[])),
            Err(DecodeError::UnknownSignature(0x66))
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = frame(0x12, &[]);
        bytes.push(0xC0);

        assert_eq!(decode(&bytes), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn custom_table() {
        let table = SignatureTable::new().with(0x77, MessageKind::Commit);

        assert_eq!(table.kind(0x77), Some(MessageKind::Commit));
        assert_eq!(table.tag(MessageKind::Commit), Some(0x77));
        assert_eq!(table.kind(0x12), None);
    }
}
