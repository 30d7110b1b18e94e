//! Collaborator contracts and the context handed to state logic.
//!
//! States never reach the execution engine, the authentication backend or the clock
//! directly; every call goes through [`StateMachineContext`], which also owns the
//! per-message metadata sink and the single failure reporting hook.
use std::{
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, error};

use crate::{
    packstream::{Value, ValueMap},
    protocol::{
        Metadata,
        message::{AuthToken, Bookmark, BookmarkParser, StringBookmarkParser, TransactionParams},
    },
};

use super::{
    ConnectionState, InterruptSignal, MachineProfile,
    error::{SessionError, Status},
};

/// Identifier of an explicit transaction, assigned by the [`TransactionManager`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub String);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a statement within a connection; reported to clients as `qid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatementId(pub u64);

/// Identity established by HELLO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginContext {
    pub scheme: String,
    pub username: Option<String>,
}

impl LoginContext {
    pub fn anonymous() -> Self {
        Self {
            scheme: "none".into(),
            username: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub login: LoginContext,
    pub credentials_expired: bool,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &AuthToken, user_agent: &str)
    -> Result<AuthOutcome, SessionError>;
}

/// Records produced by a running statement.
pub trait RecordStream: Send {
    /// Column names, reported as `fields` when the statement starts.
    fn fields(&self) -> &[String];

    /// Whether another record is available, without consuming it.
    fn has_next(&mut self) -> Result<bool, SessionError>;

    fn next_record(&mut self) -> Result<Option<Vec<Value>>, SessionError>;

    /// Completion metadata reported once the stream is exhausted (bookmark, statement type...).
    fn summary(&mut self) -> Result<Metadata, SessionError>;
}

/// Statement and transaction execution engine.
pub trait TransactionManager: Send + Sync {
    fn begin(
        &self,
        login: &LoginContext,
        params: &TransactionParams,
        connection_id: &str,
    ) -> Result<TransactionId, SessionError>;

    /// Runs a statement in its own implicit transaction.
    fn run_program(
        &self,
        statement_id: StatementId,
        login: &LoginContext,
        statement: &str,
        parameters: &ValueMap,
        params: &TransactionParams,
        connection_id: &str,
    ) -> Result<Box<dyn RecordStream>, SessionError>;

    /// Runs a statement inside an explicit transaction.
    fn run_query(
        &self,
        transaction: &TransactionId,
        statement_id: StatementId,
        statement: &str,
        parameters: &ValueMap,
    ) -> Result<Box<dyn RecordStream>, SessionError>;

    fn commit(&self, transaction: &TransactionId) -> Result<Option<Bookmark>, SessionError>;

    fn rollback(&self, transaction: &TransactionId) -> Result<(), SessionError>;
}

pub trait Clock: Send + Sync {
    fn millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Receives records streamed by PULL.
pub trait RecordSink {
    fn on_record(&mut self, fields: Vec<Value>) -> Result<(), SessionError>;
}

impl RecordSink for Vec<Vec<Value>> {
    fn on_record(&mut self, fields: Vec<Value>) -> Result<(), SessionError> {
        self.push(fields);
        Ok(())
    }
}

/// Connector level configuration shared by every connection it accepts.
pub struct Connector {
    pub server_agent: String,
    pub hints: ValueMap,
    pub authenticator: Arc<dyn Authenticator>,
    pub bookmark_parser: Arc<dyn BookmarkParser>,
}

impl Connector {
    pub fn new(server_agent: impl Into<String>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            server_agent: server_agent.into(),
            hints: ValueMap::new(),
            authenticator,
            bookmark_parser: Arc::new(StringBookmarkParser),
        }
    }

    pub fn with_hint(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.hints.insert(key.to_string(), value.into());
        self
    }

    pub fn bookmark_parser(&self) -> &dyn BookmarkParser {
        &*self.bookmark_parser
    }
}

/// Collaborators shared by all state machines of a server.
pub struct Services {
    pub connector: Connector,
    pub transactions: Arc<dyn TransactionManager>,
    pub clock: Arc<dyn Clock>,
}

/// Everything a state may touch while handling one message.
pub struct StateMachineContext<'a> {
    services: &'a Services,
    profile: &'a MachineProfile,
    connection_id: &'a str,
    interrupts: &'a InterruptSignal,
    state: &'a mut ConnectionState,
    records: &'a mut dyn RecordSink,
}

impl<'a> StateMachineContext<'a> {
    pub(crate) fn new(
        services: &'a Services,
        profile: &'a MachineProfile,
        connection_id: &'a str,
        interrupts: &'a InterruptSignal,
        state: &'a mut ConnectionState,
        records: &'a mut dyn RecordSink,
    ) -> Self {
        Self {
            services,
            profile,
            connection_id,
            interrupts,
            state,
            records,
        }
    }

    pub fn transactions(&self) -> &'a dyn TransactionManager {
        &*self.services.transactions
    }

    pub fn connector(&self) -> &'a Connector {
        &self.services.connector
    }

    pub fn clock(&self) -> &'a dyn Clock {
        &*self.services.clock
    }

    pub fn profile(&self) -> &'a MachineProfile {
        self.profile
    }

    pub fn connection_id(&self) -> &'a str {
        self.connection_id
    }

    pub fn interrupts(&self) -> &'a InterruptSignal {
        self.interrupts
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &*self.state
    }

    pub fn connection_state_mut(&mut self) -> &mut ConnectionState {
        &mut *self.state
    }

    /// Login established by HELLO. Its absence after HELLO is a protocol violation.
    pub fn login(&self) -> Result<LoginContext, SessionError> {
        self.state
            .login()
            .cloned()
            .ok_or_else(|| SessionError::Protocol("session has not been authenticated".into()))
    }

    pub fn on_metadata(&mut self, key: &str, value: impl Into<Value>) {
        self.state.on_metadata(key, value.into());
    }

    pub fn on_record(&mut self, fields: Vec<Value>) -> Result<(), SessionError> {
        self.records.on_record(fields)
    }

    /// Reports a failure. Called exactly once per failed transition.
    pub fn handle_failure(&mut self, err: &SessionError, fatal: bool) {
        self.state.record_failure();
        match err.status() {
            Status::UnknownError => error!(
                "[{}] unexpected failure (fatal: {fatal}): {err}",
                self.connection_id
            ),
            status if fatal => error!(
                "[{}] fatal {}: {err}",
                self.connection_id,
                status.code()
            ),
            status => debug!("[{}] {}: {err}", self.connection_id, status.code()),
        }
    }
}
