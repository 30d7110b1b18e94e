use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::debug;

use crate::{
    packstream::Value,
    protocol::{Metadata, message::StatementRef},
};

use super::{
    context::{LoginContext, RecordStream, StatementId, TransactionId},
    error::SessionError,
};

/// Counter of interrupts raised out of band, shared with the transport reader.
///
/// Every interrupt must be matched by one RESET before the session leaves INTERRUPTED.
#[derive(Debug, Clone, Default)]
pub struct InterruptSignal(Arc<AtomicUsize>);

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Matches one interrupt with a RESET and returns how many remain outstanding.
    pub fn acknowledge(&self) -> usize {
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or_default();
        previous.saturating_sub(1)
    }
}

/// A statement whose records have not been fully consumed.
pub struct OpenStatement {
    pub id: StatementId,
    pub stream: Box<dyn RecordStream>,
}

/// Mutable per-connection session data. States themselves hold none.
#[derive(Default)]
pub struct ConnectionState {
    transaction: Option<TransactionId>,
    metadata: Metadata,
    ignored: bool,
    pending_termination: bool,
    login: Option<LoginContext>,
    statements: BTreeMap<StatementId, Box<dyn RecordStream>>,
    next_statement: u64,
    failures: u64,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds outgoing metadata for the current message. Keys are write-once per message.
    pub fn on_metadata(&mut self, key: &str, value: Value) {
        if self.metadata.iter().any(|(k, _)| k == key) {
            debug!("metadata key '{key}' already set for this message; keeping the first value");
            return;
        }
        self.metadata.push((key.to_string(), value));
    }

    /// Starts a new request cycle: metadata and the ignored flag belong to one message.
    pub fn begin_cycle(&mut self) {
        self.metadata.clear();
        self.ignored = false;
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn take_metadata(&mut self) -> Metadata {
        std::mem::take(&mut self.metadata)
    }

    pub fn clear_metadata(&mut self) {
        self.metadata.clear();
    }

    pub fn mark_ignored(&mut self) {
        self.ignored = true;
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    pub fn transaction(&self) -> Option<&TransactionId> {
        self.transaction.as_ref()
    }

    pub fn set_transaction(&mut self, id: TransactionId) {
        self.transaction = Some(id);
    }

    pub fn take_transaction(&mut self) -> Option<TransactionId> {
        self.transaction.take()
    }

    pub fn login(&self) -> Option<&LoginContext> {
        self.login.as_ref()
    }

    pub fn set_login(&mut self, login: LoginContext) {
        self.login = Some(login);
    }

    pub fn mark_for_termination(&mut self) {
        self.pending_termination = true;
    }

    pub fn has_pending_termination(&self) -> bool {
        self.pending_termination
    }

    pub fn next_statement_id(&mut self) -> StatementId {
        let id = StatementId(self.next_statement);
        self.next_statement += 1;
        id
    }

    pub fn open_statement(&mut self, id: StatementId, stream: Box<dyn RecordStream>) {
        self.statements.insert(id, stream);
    }

    /// Removes an open statement so it can be consumed; see [`Self::restore_statement`].
    pub fn take_statement(&mut self, target: StatementRef) -> Result<OpenStatement, SessionError> {
        let id = match target {
            StatementRef::Latest => self
                .statements
                .keys()
                .next_back()
                .copied()
                .ok_or_else(|| SessionError::Protocol("no open statement".into()))?,
            StatementRef::Id(id) => StatementId(id),
        };
        let stream = self
            .statements
            .remove(&id)
            .ok_or(SessionError::StatementNotFound(id.0))?;
        Ok(OpenStatement { id, stream })
    }

    pub fn restore_statement(&mut self, statement: OpenStatement) {
        self.statements.insert(statement.id, statement.stream);
    }

    pub fn has_open_statements(&self) -> bool {
        !self.statements.is_empty()
    }

    pub fn open_statement_ids(&self) -> Vec<StatementId> {
        self.statements.keys().copied().collect()
    }

    pub(crate) fn record_failure(&mut self) {
        self.failures += 1;
    }

    /// Number of failures reported on this connection.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Drops open results and clears flags. The transaction id is left for the caller to
    /// roll back.
    pub fn reset(&mut self) {
        self.statements.clear();
        self.metadata.clear();
        self.ignored = false;
        self.pending_termination = false;
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("transaction", &self.transaction)
            .field("metadata", &self.metadata)
            .field("ignored", &self.ignored)
            .field("pending_termination", &self.pending_termination)
            .field("login", &self.login)
            .field("statements", &self.open_statement_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::tests::VecStream;

    use super::*;

    #[test]
    fn metadata_is_write_once() {
        let mut state = ConnectionState::new();
        state.on_metadata("server", Value::from("a"));
        state.on_metadata("server", Value::from("b"));
        state.on_metadata("connection_id", Value::from("bolt-1"));

        assert_eq!(
            state.take_metadata(),
            vec![
                ("server".to_string(), Value::from("a")),
                ("connection_id".to_string(), Value::from("bolt-1")),
            ]
        );
        assert!(state.metadata().is_empty());
    }

    #[test]
    fn statement_ids_increase() {
        let mut state = ConnectionState::new();

        assert_eq!(state.next_statement_id(), StatementId(0));
        assert_eq!(state.next_statement_id(), StatementId(1));
    }

    #[test]
    fn latest_statement_is_most_recent() {
        let mut state = ConnectionState::new();
        state.open_statement(StatementId(0), Box::new(VecStream::rows(1)));
        state.open_statement(StatementId(1), Box::new(VecStream::rows(1)));

        let open = state.take_statement(StatementRef::Latest).unwrap();
        assert_eq!(open.id, StatementId(1));
        assert_eq!(state.open_statement_ids(), vec![StatementId(0)]);

        state.restore_statement(open);
        assert_eq!(state.open_statement_ids(), vec![StatementId(0), StatementId(1)]);
    }

    #[test]
    fn unknown_statement() {
        let mut state = ConnectionState::new();

        assert!(matches!(
            state.take_statement(StatementRef::Id(9)),
            Err(SessionError::StatementNotFound(9))
        ));
    }

    #[test]
    fn reset_clears_flags() {
        let mut state = ConnectionState::new();
        state.mark_ignored();
        state.mark_for_termination();
        state.on_metadata("fields", Value::List(vec![]));
        state.open_statement(StatementId(0), Box::new(VecStream::rows(1)));
        state.set_transaction(TransactionId("tx-1".into()));

        state.reset();
        assert!(!state.is_ignored());
        assert!(!state.has_pending_termination());
        assert!(state.metadata().is_empty());
        assert!(!state.has_open_statements());
        assert!(state.transaction().is_some());
    }

    #[test]
    fn interrupt_signal_counts() {
        let signal = InterruptSignal::new();
        let shared = signal.clone();
        shared.interrupt();
        shared.interrupt();

        assert_eq!(signal.pending(), 2);
        assert_eq!(signal.acknowledge(), 1);
        assert_eq!(signal.acknowledge(), 0);
        assert_eq!(signal.acknowledge(), 0);
    }
}
