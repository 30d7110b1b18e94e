use std::{collections::BTreeMap, fmt, time::Duration};

use crate::packstream::{Value, ValueMap};

/// Metadata keys whose values are credentials. These are kept as raw bytes and never
/// printed.
pub const SENSITIVE_KEYS: &[&str] = &["credentials"];

/// Request message kinds understood by the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageKind {
    Hello,
    Goodbye,
    Reset,
    Run,
    Begin,
    Commit,
    Rollback,
    Discard,
    Pull,
}

impl MessageKind {
    /// Number of positional fields the message struct carries.
    pub fn arity(self) -> usize {
        match self {
            MessageKind::Run => 3,
            MessageKind::Hello | MessageKind::Begin | MessageKind::Discard | MessageKind::Pull => 1,
            MessageKind::Goodbye | MessageKind::Reset | MessageKind::Commit | MessageKind::Rollback => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Hello => "HELLO",
            MessageKind::Goodbye => "GOODBYE",
            MessageKind::Reset => "RESET",
            MessageKind::Run => "RUN",
            MessageKind::Begin => "BEGIN",
            MessageKind::Commit => "COMMIT",
            MessageKind::Rollback => "ROLLBACK",
            MessageKind::Discard => "DISCARD",
            MessageKind::Pull => "PULL",
        }
    }
}

/// Opaque causal consistency token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bookmark(pub String);

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Turns the client supplied `bookmarks` value into bookmark tokens.
pub trait BookmarkParser: Send + Sync {
    fn parse(&self, value: &Value) -> Result<Vec<Bookmark>, String>;
}

/// Accepts a list of strings, keeping their order.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringBookmarkParser;

impl BookmarkParser for StringBookmarkParser {
    fn parse(&self, value: &Value) -> Result<Vec<Bookmark>, String> {
        match value {
            Value::List(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(Bookmark(s.clone())),
                    other => Err(format!(
                        "expected a list of strings, found a {} element",
                        other.value_type()
                    )),
                })
                .collect(),
            other => Err(format!("expected a list, found {}", other.value_type())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    #[default]
    Write,
}

/// Transaction parameters shared by RUN and BEGIN.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionParams {
    pub bookmarks: Vec<Bookmark>,
    pub timeout: Option<Duration>,
    pub mode: AccessMode,
    pub metadata: ValueMap,
    pub database: Option<String>,
}

/// Authentication token sent with HELLO. Sensitive entries hold raw bytes.
#[derive(Clone, Default, PartialEq)]
pub struct AuthToken(pub ValueMap);

impl AuthToken {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn scheme(&self) -> Option<&str> {
        self.get("scheme").and_then(Value::as_str)
    }

    pub fn principal(&self) -> Option<&str> {
        self.get("principal").and_then(Value::as_str)
    }

    /// Raw credential bytes, if any were supplied.
    pub fn credentials(&self) -> Option<&[u8]> {
        match self.get("credentials") {
            Some(Value::Bytes(b)) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.0 {
            if SENSITIVE_KEYS.contains(&key.as_str()) {
                map.entry(key, &"******");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

/// Client routing hints. Opaque to the session layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingContext {
    pub enabled: bool,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HelloMessage {
    pub user_agent: String,
    pub auth_token: AuthToken,
    pub routing: RoutingContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunMessage {
    pub statement: String,
    pub parameters: ValueMap,
    pub transaction: TransactionParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginMessage {
    pub transaction: TransactionParams,
}

/// How many records a PULL or DISCARD covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLimit {
    All,
    Rows(u64),
}

impl StreamLimit {
    pub fn is_zero(self) -> bool {
        self == StreamLimit::Rows(0)
    }
}

/// Which open statement a PULL or DISCARD targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementRef {
    Latest,
    Id(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMessage {
    pub limit: StreamLimit,
    pub statement: StatementRef,
}

impl StreamMessage {
    pub fn all() -> Self {
        Self {
            limit: StreamLimit::All,
            statement: StatementRef::Latest,
        }
    }
}

/// A decoded client request.
///
/// `Interrupt` never arrives on the wire; it is raised out of band when the transport sees a
/// RESET queued behind other messages.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestMessage {
    Hello(HelloMessage),
    Goodbye,
    Run(RunMessage),
    Begin(BeginMessage),
    Commit,
    Rollback,
    Discard(StreamMessage),
    Pull(StreamMessage),
    Reset,
    Interrupt,
}

impl RequestMessage {
    pub fn name(&self) -> &'static str {
        match self {
            RequestMessage::Hello(_) => "HELLO",
            RequestMessage::Goodbye => "GOODBYE",
            RequestMessage::Run(_) => "RUN",
            RequestMessage::Begin(_) => "BEGIN",
            RequestMessage::Commit => "COMMIT",
            RequestMessage::Rollback => "ROLLBACK",
            RequestMessage::Discard(_) => "DISCARD",
            RequestMessage::Pull(_) => "PULL",
            RequestMessage::Reset => "RESET",
            RequestMessage::Interrupt => "INTERRUPT",
        }
    }
}
