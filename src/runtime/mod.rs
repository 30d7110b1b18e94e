//! Session runtime.
//!
//! This module holds the per-connection state machine that sits between the transport and
//! the execution engine. A connection starts in [`State::Connected`], authenticates with
//! HELLO, and then runs statements either as auto-commit programs or inside explicit
//! transactions. Results are streamed back with PULL or dropped with DISCARD.
//!
//! # Failure handling
//!
//! State logic returns `Result<State, SessionError>`. The [`StateMachine`] turns every error
//! into one of two outcomes:
//!
//! - recoverable failures (statement errors, terminated transactions, authorization expiry
//!   after login) send FAILURE and move the session to [`State::Failed`], where requests are
//!   IGNORED until RESET;
//! - protocol violations, transport failures and anything that fails before login close the
//!   connection.
//!
//! # Interrupts
//!
//! The transport peeks at queued frames and raises an [`InterruptSignal`] for every RESET it
//! sees. Pending interrupts move the session to [`State::Interrupted`] before the next
//! message is handled, which stops long running streams from blocking the RESET behind them.
mod connection;
mod consumer;
mod context;
mod error;
mod machine;
mod state;

pub use connection::{ConnectionState, InterruptSignal, OpenStatement};
pub use consumer::{DiscardResultConsumer, PullResultConsumer, ResultConsumer};
pub use context::{
    AuthOutcome, Authenticator, Clock, Connector, LoginContext, RecordSink, RecordStream, Services,
    StateMachineContext, StatementId, SystemClock, TransactionId, TransactionManager,
};
pub use error::{ErrorClass, SessionError, Status};
pub use machine::{
    Disconnect, InterruptPolicy, MachineProfile, ProfileRegistry, StateMachine, Transition,
};
pub use state::State;

/// Collaborator fakes shared by the runtime tests.
#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Arc, Mutex,
            atomic::{AtomicU64, Ordering},
        },
    };

    use crate::{
        packstream::{Value, ValueMap},
        protocol::{
            Metadata,
            message::{AuthToken, Bookmark, TransactionParams},
        },
    };

    use super::*;

    pub struct VecStream {
        fields: Vec<String>,
        records: VecDeque<Vec<Value>>,
    }

    impl VecStream {
        pub fn rows(n: i64) -> Self {
            Self {
                fields: vec!["n".into()],
                records: (0..n).map(|i| vec![Value::Integer(i)]).collect(),
            }
        }
    }

    impl RecordStream for VecStream {
        fn fields(&self) -> &[String] {
            &self.fields
        }

        fn has_next(&mut self) -> Result<bool, SessionError> {
            Ok(!self.records.is_empty())
        }

        fn next_record(&mut self) -> Result<Option<Vec<Value>>, SessionError> {
            Ok(self.records.pop_front())
        }

        fn summary(&mut self) -> Result<Metadata, SessionError> {
            Ok(vec![("type".into(), Value::from("r"))])
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Begin,
        RunProgram(String),
        RunQuery(String, String),
        Commit(String),
        Rollback(String),
    }

    /// Understands `rows <n>`, which streams `n` integers, and `expired`, which fails
    /// authorization. Anything else is a syntax error.
    #[derive(Default)]
    pub struct FakeTransactions {
        calls: Mutex<Vec<Call>>,
        next: AtomicU64,
    }

    impl FakeTransactions {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn execute(statement: &str) -> Result<Box<dyn RecordStream>, SessionError> {
            match statement.strip_prefix("rows ") {
                Some(n) => Ok(Box::new(VecStream::rows(n.parse().unwrap()))),
                None if statement == "expired" => Err(SessionError::AuthorizationExpired(
                    "token expired".into(),
                )),
                None => Err(SessionError::execution(
                    Status::SyntaxError,
                    format!("cannot run '{statement}'"),
                )),
            }
        }
    }

    impl TransactionManager for FakeTransactions {
        fn begin(
            &self,
            _login: &LoginContext,
            _params: &TransactionParams,
            _connection_id: &str,
        ) -> Result<TransactionId, SessionError> {
            self.record(Call::Begin);
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TransactionId(format!("tx-{n}")))
        }

        fn run_program(
            &self,
            _statement_id: StatementId,
            _login: &LoginContext,
            statement: &str,
            _parameters: &ValueMap,
            _params: &TransactionParams,
            _connection_id: &str,
        ) -> Result<Box<dyn RecordStream>, SessionError> {
            self.record(Call::RunProgram(statement.into()));
            Self::execute(statement)
        }

        fn run_query(
            &self,
            transaction: &TransactionId,
            _statement_id: StatementId,
            statement: &str,
            _parameters: &ValueMap,
        ) -> Result<Box<dyn RecordStream>, SessionError> {
            self.record(Call::RunQuery(transaction.0.clone(), statement.into()));
            Self::execute(statement)
        }

        fn commit(&self, transaction: &TransactionId) -> Result<Option<Bookmark>, SessionError> {
            self.record(Call::Commit(transaction.0.clone()));
            Ok(Some(Bookmark(format!("bm:{transaction}"))))
        }

        fn rollback(&self, transaction: &TransactionId) -> Result<(), SessionError> {
            self.record(Call::Rollback(transaction.0.clone()));
            Ok(())
        }
    }

    /// Accepts every principal except `intruder`.
    pub struct FakeAuthenticator;

    impl Authenticator for FakeAuthenticator {
        fn authenticate(
            &self,
            token: &AuthToken,
            _user_agent: &str,
        ) -> Result<AuthOutcome, SessionError> {
            match token.principal() {
                Some("intruder") => Err(SessionError::Authentication("unknown user".into())),
                principal => Ok(AuthOutcome {
                    login: LoginContext {
                        scheme: token.scheme().unwrap_or("none").into(),
                        username: principal.map(str::to_string),
                    },
                    credentials_expired: false,
                }),
            }
        }
    }

    /// Advances one millisecond per reading.
    #[derive(Default)]
    pub struct TickClock(AtomicU64);

    impl Clock for TickClock {
        fn millis(&self) -> u64 {
            self.0.fetch_add(1, Ordering::SeqCst)
        }
    }

    pub fn services_with(transactions: Arc<FakeTransactions>) -> Services {
        Services {
            connector: Connector::new("tether/test", Arc::new(FakeAuthenticator))
                .with_hint("connection.recv_timeout_seconds", 30i64),
            transactions,
            clock: Arc::new(TickClock::default()),
        }
    }

    pub fn services() -> Services {
        services_with(Arc::new(FakeTransactions::default()))
    }
}
