//! Session states and their transition logic.
//!
//! A [`State`] carries no data of its own. Every handler reads and writes the connection
//! through the [`StateMachineContext`] and returns the state the session moves to, or the
//! error that stopped it. Deciding whether an error is fatal is left to the machine.
use log::{debug, warn};

use crate::{
    packstream::Value,
    protocol::message::{BeginMessage, HelloMessage, RequestMessage, RunMessage, StreamMessage},
};

use super::{
    InterruptPolicy,
    consumer::{DiscardResultConsumer, PullResultConsumer, ResultConsumer},
    context::StateMachineContext,
    error::SessionError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// Waiting for HELLO.
    #[default]
    Connected,
    Ready,
    /// An auto-commit statement has records left to pull or discard.
    Streaming,
    /// Inside an explicit transaction with no open results.
    TxReady,
    TxStreaming,
    /// A recoverable failure occurred; requests are ignored until RESET.
    Failed,
    /// A RESET is queued; requests are ignored until it is processed.
    Interrupted,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            State::Connected => "CONNECTED",
            State::Ready => "READY",
            State::Streaming => "STREAMING",
            State::TxReady => "TX_READY",
            State::TxStreaming => "TX_STREAMING",
            State::Failed => "FAILED",
            State::Interrupted => "INTERRUPTED",
        }
    }

    /// Applies `message` to this state.
    pub fn process(
        self,
        message: RequestMessage,
        ctx: &mut StateMachineContext<'_>,
    ) -> Result<State, SessionError> {
        use RequestMessage as M;

        match (self, message) {
            (_, M::Interrupt) => Ok(State::Interrupted),

            (State::Connected, M::Hello(hello)) => authenticate(ctx, hello),

            (State::Ready, M::Run(run)) => run_program(ctx, run),
            (State::Ready, M::Begin(begin)) => begin_transaction(ctx, begin),

            (State::Streaming, M::Pull(pull)) => stream(
                ctx,
                PullResultConsumer::new(pull.limit),
                pull,
                State::Streaming,
                State::Ready,
            ),
            (State::Streaming, M::Discard(discard)) => stream(
                ctx,
                DiscardResultConsumer::new(discard.limit),
                discard,
                State::Streaming,
                State::Ready,
            ),

            (State::TxReady | State::TxStreaming, M::Run(run)) => run_query(ctx, run),
            (State::TxReady, M::Commit) => commit(ctx),
            (State::TxReady, M::Rollback) => rollback(ctx),
            (State::TxStreaming, M::Pull(pull)) => stream(
                ctx,
                PullResultConsumer::new(pull.limit),
                pull,
                State::TxStreaming,
                State::TxReady,
            ),
            (State::TxStreaming, M::Discard(discard)) => stream(
                ctx,
                DiscardResultConsumer::new(discard.limit),
                discard,
                State::TxStreaming,
                State::TxReady,
            ),

            (
                State::Failed,
                M::Run(_) | M::Pull(_) | M::Discard(_) | M::Commit | M::Rollback,
            ) => {
                ctx.connection_state_mut().mark_ignored();
                Ok(State::Failed)
            }

            (
                State::Ready
                | State::Streaming
                | State::TxReady
                | State::TxStreaming
                | State::Failed,
                M::Reset,
            ) => reset(ctx),

            (State::Interrupted, M::Reset) => {
                if ctx.interrupts().acknowledge() > 0 {
                    ctx.connection_state_mut().mark_ignored();
                    return Ok(State::Interrupted);
                }
                if ctx.connection_state().login().is_none() {
                    ctx.connection_state_mut().reset();
                    return Ok(State::Connected);
                }
                reset(ctx)
            }
            (State::Interrupted, message) => match ctx.profile().interrupted_policy {
                InterruptPolicy::Ignore => {
                    ctx.connection_state_mut().mark_ignored();
                    Ok(State::Interrupted)
                }
                InterruptPolicy::Fatal => Err(SessionError::IllegalMessage {
                    message: message.name(),
                    state: State::Interrupted.name(),
                }),
            },

            (state, message) => Err(SessionError::IllegalMessage {
                message: message.name(),
                state: state.name(),
            }),
        }
    }
}

fn authenticate(
    ctx: &mut StateMachineContext<'_>,
    hello: HelloMessage,
) -> Result<State, SessionError> {
    let connector = ctx.connector();
    let outcome = connector
        .authenticator
        .authenticate(&hello.auth_token, &hello.user_agent)?;

    debug!(
        "[{}] authenticated {} via '{}' ({})",
        ctx.connection_id(),
        outcome.login.username.as_deref().unwrap_or("<anonymous>"),
        outcome.login.scheme,
        hello.user_agent
    );

    if outcome.credentials_expired {
        ctx.on_metadata("credentials_expired", true);
    }
    let connection_id = ctx.connection_id();
    ctx.on_metadata("server", connector.server_agent.as_str());
    ctx.on_metadata("connection_id", connection_id);
    if ctx.profile().emit_hints && !connector.hints.is_empty() {
        ctx.on_metadata("hints", connector.hints.clone());
    }
    ctx.connection_state_mut().set_login(outcome.login);
    Ok(State::Ready)
}

fn fields_value(fields: &[String]) -> Value {
    Value::List(fields.iter().cloned().map(Value::String).collect())
}

fn run_program(ctx: &mut StateMachineContext<'_>, run: RunMessage) -> Result<State, SessionError> {
    let login = ctx.login()?;
    let start = ctx.clock().millis();
    let id = ctx.connection_state_mut().next_statement_id();
    let stream = ctx.transactions().run_program(
        id,
        &login,
        &run.statement,
        &run.parameters,
        &run.transaction,
        ctx.connection_id(),
    )?;
    let end = ctx.clock().millis();

    ctx.on_metadata("fields", fields_value(stream.fields()));
    ctx.on_metadata("t_first", end.saturating_sub(start) as i64);
    ctx.connection_state_mut().open_statement(id, stream);
    Ok(State::Streaming)
}

fn begin_transaction(
    ctx: &mut StateMachineContext<'_>,
    begin: BeginMessage,
) -> Result<State, SessionError> {
    let login = ctx.login()?;
    let id = ctx
        .transactions()
        .begin(&login, &begin.transaction, ctx.connection_id())?;

    debug!("[{}] began transaction {id}", ctx.connection_id());
    ctx.connection_state_mut().set_transaction(id);
    Ok(State::TxReady)
}

fn run_query(ctx: &mut StateMachineContext<'_>, run: RunMessage) -> Result<State, SessionError> {
    let transaction = ctx
        .connection_state()
        .transaction()
        .cloned()
        .ok_or_else(|| SessionError::Protocol("no open transaction".into()))?;
    let start = ctx.clock().millis();
    let id = ctx.connection_state_mut().next_statement_id();
    let stream = ctx
        .transactions()
        .run_query(&transaction, id, &run.statement, &run.parameters)?;
    let end = ctx.clock().millis();

    ctx.on_metadata("fields", fields_value(stream.fields()));
    ctx.on_metadata("t_first", end.saturating_sub(start) as i64);
    ctx.on_metadata("qid", id.0 as i64);
    ctx.connection_state_mut().open_statement(id, stream);
    Ok(State::TxStreaming)
}

fn commit(ctx: &mut StateMachineContext<'_>) -> Result<State, SessionError> {
    let transaction = ctx
        .connection_state_mut()
        .take_transaction()
        .ok_or_else(|| SessionError::Protocol("no open transaction".into()))?;
    if let Some(bookmark) = ctx.transactions().commit(&transaction)? {
        ctx.on_metadata("bookmark", bookmark.0);
    }
    Ok(State::Ready)
}

fn rollback(ctx: &mut StateMachineContext<'_>) -> Result<State, SessionError> {
    let transaction = ctx
        .connection_state_mut()
        .take_transaction()
        .ok_or_else(|| SessionError::Protocol("no open transaction".into()))?;
    ctx.transactions().rollback(&transaction)?;
    Ok(State::Ready)
}

fn stream<C: ResultConsumer>(
    ctx: &mut StateMachineContext<'_>,
    mut consumer: C,
    message: StreamMessage,
    current: State,
    exhausted: State,
) -> Result<State, SessionError> {
    if ctx.connection_state().has_pending_termination() {
        return Err(SessionError::TransactionTerminated);
    }

    let mut open = ctx.connection_state_mut().take_statement(message.statement)?;
    if consumer.consume(&mut *open.stream, ctx)? {
        ctx.connection_state_mut().restore_statement(open);
    } else {
        debug!("[{}] statement {} exhausted", ctx.connection_id(), open.id.0);
    }

    if ctx.connection_state().has_open_statements() {
        Ok(current)
    } else {
        Ok(exhausted)
    }
}

fn reset(ctx: &mut StateMachineContext<'_>) -> Result<State, SessionError> {
    if let Some(transaction) = ctx.connection_state_mut().take_transaction() {
        if let Err(err) = ctx.transactions().rollback(&transaction) {
            warn!(
                "[{}] rollback of {transaction} during reset failed: {err}",
                ctx.connection_id()
            );
        }
    }
    ctx.connection_state_mut().reset();
    Ok(State::Ready)
}
