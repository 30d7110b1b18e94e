//! In-memory reference backend.
//!
//! Implements the runtime collaborator traits on top of [`Statement`] so that a server can run
//! end to end without a storage engine. Every commit, explicit or auto-commit, advances a
//! global sequence number that is handed out as a `memdb:tx<N>` bookmark; transactions
//! started with a bookmark from the future fail instead of waiting.
use std::{
    collections::{HashMap, VecDeque},
    iter::Peekable,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, info};

use crate::{
    packstream::{Value, ValueMap},
    protocol::{
        Metadata,
        message::{AccessMode, AuthToken, Bookmark, TransactionParams},
    },
    runtime::{
        AuthOutcome, Authenticator, LoginContext, RecordStream, SessionError,
        StatementId, Status, TransactionId, TransactionManager,
    },
    statement::{Rows, Statement, StatementError},
};

const BOOKMARK_PREFIX: &str = "memdb:tx";

pub const DEFAULT_DATABASE: &str = "neo4j";

impl From<StatementError> for SessionError {
    fn from(err: StatementError) -> Self {
        let status = match err {
            StatementError::MissingParameter(_) => Status::ParameterMissing,
            StatementError::NotAList(_) => Status::TypeError,
            _ => Status::SyntaxError,
        };
        SessionError::execution(status, err.to_string())
    }
}

fn parse_bookmark(bookmark: &Bookmark) -> Result<u64, SessionError> {
    bookmark
        .0
        .strip_prefix(BOOKMARK_PREFIX)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| {
            SessionError::execution(
                Status::InvalidBookmark,
                format!("'{bookmark}' is not a valid bookmark"),
            )
        })
}

fn bookmark(sequence: u64) -> Bookmark {
    Bookmark(format!("{BOOKMARK_PREFIX}{sequence}"))
}

/// Records of one statement.
pub struct MemoryStream {
    fields: Vec<String>,
    rows: Peekable<Rows>,
    summary: VecDeque<(String, Value)>,
}

impl RecordStream for MemoryStream {
    fn fields(&self) -> &[String] {
        &self.fields
    }

    fn has_next(&mut self) -> Result<bool, SessionError> {
        Ok(self.rows.peek().is_some())
    }

    fn next_record(&mut self) -> Result<Option<Vec<Value>>, SessionError> {
        Ok(self.rows.next())
    }

    fn summary(&mut self) -> Result<Metadata, SessionError> {
        Ok(self.summary.drain(..).collect())
    }
}

#[derive(Debug)]
struct OpenTransaction {
    connection_id: String,
    mode: AccessMode,
    statements: u64,
}

/// Transaction manager over an in-memory statement evaluator.
#[derive(Debug)]
pub struct MemoryDatabase {
    name: String,
    transactions: Mutex<HashMap<TransactionId, OpenTransaction>>,
    next_transaction: AtomicU64,
    commits: AtomicU64,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new(DEFAULT_DATABASE)
    }
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transactions: Mutex::new(HashMap::new()),
            next_transaction: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequence number of the latest commit.
    pub fn last_commit(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn open_transactions(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<TransactionId, OpenTransaction>> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, params: &TransactionParams) -> Result<(), SessionError> {
        if let Some(database) = &params.database {
            if *database != self.name {
                return Err(SessionError::execution(
                    Status::DatabaseNotFound,
                    format!("database '{database}' does not exist"),
                ));
            }
        }

        let last = self.last_commit();
        for bookmark in &params.bookmarks {
            if parse_bookmark(bookmark)? > last {
                return Err(SessionError::execution(
                    Status::BookmarkTimeout,
                    format!("database has not caught up with bookmark '{bookmark}'"),
                ));
            }
        }
        Ok(())
    }

    fn commit_sequence(&self) -> u64 {
        self.commits.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn prepare(
        &self,
        statement: &str,
        parameters: &ValueMap,
    ) -> Result<(Vec<String>, Rows), SessionError> {
        let parsed = Statement::try_from(statement)?;
        let rows = parsed.rows(parameters.clone())?;
        Ok((parsed.fields(), rows))
    }

    fn result(
        &self,
        fields: Vec<String>,
        rows: Rows,
        bookmark: Option<Bookmark>,
    ) -> Box<dyn RecordStream> {
        let mut summary = VecDeque::new();
        if let Some(bookmark) = bookmark {
            summary.push_back(("bookmark".to_string(), Value::String(bookmark.0)));
        }
        summary.push_back(("type".to_string(), Value::from("r")));
        summary.push_back(("db".to_string(), Value::from(self.name.as_str())));

        Box::new(MemoryStream {
            fields,
            rows: rows.peekable(),
            summary,
        })
    }
}

impl TransactionManager for MemoryDatabase {
    fn begin(
        &self,
        login: &LoginContext,
        params: &TransactionParams,
        connection_id: &str,
    ) -> Result<TransactionId, SessionError> {
        self.check(params)?;

        let n = self.next_transaction.fetch_add(1, Ordering::SeqCst) + 1;
        let id = TransactionId(format!("{}-{n}", self.name));
        debug!(
            "[{connection_id}] {} began {id} ({:?}, timeout {:?})",
            login.username.as_deref().unwrap_or("<anonymous>"),
            params.mode,
            params.timeout
        );
        self.registry().insert(
            id.clone(),
            OpenTransaction {
                connection_id: connection_id.to_string(),
                mode: params.mode,
                statements: 0,
            },
        );
        Ok(id)
    }

    fn run_program(
        &self,
        statement_id: StatementId,
        _login: &LoginContext,
        statement: &str,
        parameters: &ValueMap,
        params: &TransactionParams,
        connection_id: &str,
    ) -> Result<Box<dyn RecordStream>, SessionError> {
        self.check(params)?;
        let (fields, rows) = self.prepare(statement, parameters)?;
        let sequence = self.commit_sequence();
        debug!(
            "[{connection_id}] auto-commit statement {} committed as {sequence}",
            statement_id.0
        );
        Ok(self.result(fields, rows, Some(bookmark(sequence))))
    }

    fn run_query(
        &self,
        transaction: &TransactionId,
        statement_id: StatementId,
        statement: &str,
        parameters: &ValueMap,
    ) -> Result<Box<dyn RecordStream>, SessionError> {
        {
            let mut registry = self.registry();
            let open = registry.get_mut(transaction).ok_or_else(|| {
                SessionError::execution(
                    Status::TransactionNotFound,
                    format!("transaction {transaction} does not exist"),
                )
            })?;
            open.statements += 1;
            debug!(
                "[{}] statement {} in {transaction} ({:?})",
                open.connection_id, statement_id.0, open.mode
            );
        }
        let (fields, rows) = self.prepare(statement, parameters)?;
        Ok(self.result(fields, rows, None))
    }

    fn commit(&self, transaction: &TransactionId) -> Result<Option<Bookmark>, SessionError> {
        let open = self.registry().remove(transaction).ok_or_else(|| {
            SessionError::execution(
                Status::TransactionNotFound,
                format!("transaction {transaction} does not exist"),
            )
        })?;
        let sequence = self.commit_sequence();
        info!(
            "[{}] committed {transaction} after {} statement(s)",
            open.connection_id, open.statements
        );
        Ok(Some(bookmark(sequence)))
    }

    fn rollback(&self, transaction: &TransactionId) -> Result<(), SessionError> {
        match self.registry().remove(transaction) {
            Some(open) => {
                debug!("[{}] rolled back {transaction}", open.connection_id);
                Ok(())
            }
            None => Err(SessionError::execution(
                Status::TransactionNotFound,
                format!("transaction {transaction} does not exist"),
            )),
        }
    }
}

/// Authenticates against a single configured user, or accepts everyone when none is set.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    credentials: Option<(String, String)>,
}

impl StaticAuthenticator {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Some((user.into(), password.into())),
        }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(
        &self,
        token: &AuthToken,
        user_agent: &str,
    ) -> Result<AuthOutcome, SessionError> {
        let scheme = token.scheme().unwrap_or("none");
        let Some((user, password)) = &self.credentials else {
            return Ok(AuthOutcome {
                login: LoginContext {
                    scheme: scheme.to_string(),
                    username: token.principal().map(str::to_string),
                },
                credentials_expired: false,
            });
        };

        if scheme != "basic" {
            return Err(SessionError::Authentication(format!(
                "unsupported authentication scheme '{scheme}'"
            )));
        }
        let principal = token.principal().unwrap_or_default();
        let credentials = token.credentials().unwrap_or_default();
        if principal != user.as_str() || credentials != password.as_bytes() {
            debug!("rejected login for '{principal}' from {user_agent}");
            return Err(SessionError::Authentication(
                "the client is unauthorized due to authentication failure".into(),
            ));
        }
        Ok(AuthOutcome {
            login: LoginContext {
                scheme: scheme.to_string(),
                username: Some(principal.to_string()),
            },
            credentials_expired: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login() -> LoginContext {
        LoginContext::anonymous()
    }

    fn drain(mut stream: Box<dyn RecordStream>) -> (Vec<Vec<Value>>, Metadata) {
        let mut rows = Vec::new();
        while let Some(row) = stream.next_record().unwrap() {
            rows.push(row);
        }
        assert!(!stream.has_next().unwrap());
        (rows, stream.summary().unwrap())
    }

    #[test]
    fn auto_commit_reports_bookmark() {
        let db = MemoryDatabase::default();
        let result = db
            .run_program(
                StatementId(0),
                &login(),
                "UNWIND range(1, 3) AS n RETURN n",
                &ValueMap::new(),
                &TransactionParams::default(),
                "bolt-1",
            )
            .unwrap();

        assert_eq!(result.fields(), ["n"]);
        let (rows, summary) = drain(result);
        assert_eq!(rows.len(), 3);
        assert_eq!(
            summary,
            vec![
                ("bookmark".to_string(), Value::from("memdb:tx1")),
                ("type".to_string(), Value::from("r")),
                ("db".to_string(), Value::from("neo4j")),
            ]
        );
    }

    #[test]
    fn explicit_transaction_lifecycle() {
        let db = MemoryDatabase::default();
        let id = db
            .begin(&login(), &TransactionParams::default(), "bolt-1")
            .unwrap();
        assert_eq!(db.open_transactions(), 1);

        let result = db
            .run_query(&id, StatementId(0), "RETURN 1 AS x", &ValueMap::new())
            .unwrap();
        let (rows, _) = drain(result);
        assert_eq!(rows, vec![vec![Value::Integer(1)]]);

        assert_eq!(db.commit(&id).unwrap(), Some(Bookmark("memdb:tx1".into())));
        assert_eq!(db.open_transactions(), 0);
        assert!(db.commit(&id).is_err());
    }

    #[test]
    fn rollback_forgets_transaction() {
        let db = MemoryDatabase::default();
        let id = db
            .begin(&login(), &TransactionParams::default(), "bolt-1")
            .unwrap();

        db.rollback(&id).unwrap();
        assert_eq!(db.last_commit(), 0);
        assert!(
            db.run_query(&id, StatementId(0), "RETURN 1", &ValueMap::new())
                .is_err()
        );
    }

    #[test]
    fn statement_errors_map_to_status() {
        let db = MemoryDatabase::default();
        let inputs = vec![
            ("MATCH (n) RETURN n", Status::SyntaxError),
            ("RETURN $missing", Status::ParameterMissing),
            ("UNWIND $missing AS x RETURN x", Status::ParameterMissing),
        ];

        for (statement, status) in inputs {
            let err = db
                .run_program(
                    StatementId(0),
                    &login(),
                    statement,
                    &ValueMap::new(),
                    &TransactionParams::default(),
                    "bolt-1",
                )
                .err()
                .expect("expected run_program to fail");
            assert_eq!(err.status(), status, "{statement}");
        }
    }

    #[test]
    fn bookmarks_and_databases_are_checked() {
        let db = MemoryDatabase::default();
        let inputs = vec![
            (
                TransactionParams {
                    bookmarks: vec![Bookmark("memdb:tx5".into())],
                    ..Default::default()
                },
                Status::BookmarkTimeout,
            ),
            (
                TransactionParams {
                    bookmarks: vec![Bookmark("garbage".into())],
                    ..Default::default()
                },
                Status::InvalidBookmark,
            ),
            (
                TransactionParams {
                    database: Some("system".into()),
                    ..Default::default()
                },
                Status::DatabaseNotFound,
            ),
        ];

        for (params, status) in inputs {
            let err = db.begin(&login(), &params, "bolt-1").unwrap_err();
            assert_eq!(err.status(), status);
        }
    }

    fn token(scheme: &str, principal: &str, credentials: &str) -> AuthToken {
        let mut map = ValueMap::new();
        map.insert("scheme".into(), Value::from(scheme));
        map.insert("principal".into(), Value::from(principal));
        map.insert(
            "credentials".into(),
            Value::Bytes(credentials.as_bytes().to_vec()),
        );
        AuthToken(map)
    }

    #[test]
    fn basic_authentication() {
        let auth = StaticAuthenticator::basic("neo4j", "secret");

        let outcome = auth
            .authenticate(&token("basic", "neo4j", "secret"), "test/1.0")
            .unwrap();
        assert_eq!(outcome.login.username.as_deref(), Some("neo4j"));

        assert!(
            auth.authenticate(&token("basic", "neo4j", "wrong"), "test/1.0")
                .is_err()
        );
        assert!(
            auth.authenticate(&token("none", "", ""), "test/1.0")
                .is_err()
        );
    }

    #[test]
    fn open_authentication_accepts_anyone() {
        let auth = StaticAuthenticator::open();
        let outcome = auth
            .authenticate(&AuthToken::default(), "test/1.0")
            .unwrap();

        assert_eq!(outcome.login.scheme, "none");
        assert_eq!(outcome.login.username, None);
    }
}
