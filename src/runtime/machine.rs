use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    packstream::Value,
    protocol::{
        DecodeError, MessageDecoder, ProtocolVersion, Response, SignatureTable,
        message::RequestMessage,
    },
};

use super::{
    connection::{ConnectionState, InterruptSignal},
    context::{RecordSink, Services, StateMachineContext},
    error::{ErrorClass, SessionError},
    state::State,
};

/// What happens to requests that arrive while the session is INTERRUPTED.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InterruptPolicy {
    /// Answer IGNORED and wait for the RESET.
    #[default]
    Ignore,
    /// Treat anything but RESET as a protocol violation.
    Fatal,
}

/// Per protocol version configuration of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineProfile {
    pub version: ProtocolVersion,
    pub signatures: SignatureTable,
    /// Whether HELLO reports connector capability hints.
    pub emit_hints: bool,
    pub interrupted_policy: InterruptPolicy,
}

impl MachineProfile {
    pub fn v4(minor: u8) -> Self {
        Self {
            version: ProtocolVersion::new(4, minor),
            signatures: SignatureTable::v4(),
            emit_hints: minor >= 3,
            interrupted_policy: InterruptPolicy::default(),
        }
    }

    pub fn with_interrupted_policy(mut self, policy: InterruptPolicy) -> Self {
        self.interrupted_policy = policy;
        self
    }
}

/// Profiles available to the server, highest version first.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<Arc<MachineProfile>>,
}

impl ProfileRegistry {
    pub fn new(mut profiles: Vec<MachineProfile>) -> Self {
        profiles.sort_by(|a, b| b.version.cmp(&a.version));
        Self {
            profiles: profiles.into_iter().map(Arc::new).collect(),
        }
    }

    /// Every 4.x minor version this crate speaks.
    pub fn v4(policy: InterruptPolicy) -> Self {
        Self::new(
            (0..=4)
                .map(|minor| MachineProfile::v4(minor).with_interrupted_policy(policy))
                .collect(),
        )
    }

    pub fn get(&self, version: ProtocolVersion) -> Option<Arc<MachineProfile>> {
        self.profiles
            .iter()
            .find(|p| p.version == version)
            .cloned()
    }

    /// Picks the highest supported version from the first proposal that matches any.
    pub fn negotiate(&self, proposals: &[u32]) -> Option<Arc<MachineProfile>> {
        proposals.iter().find_map(|&proposal| {
            self.profiles
                .iter()
                .find(|p| p.version.matches(proposal))
                .cloned()
        })
    }

    pub fn versions(&self) -> impl Iterator<Item = ProtocolVersion> + '_ {
        self.profiles.iter().map(|p| p.version)
    }
}

/// Outcome of applying a message to the current state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Next(State),
    /// Recoverable failure; the session moves to FAILED.
    Failed(SessionError),
    /// The connection must be closed.
    Fatal(SessionError),
}

/// The session has ended and the connection must be closed.
///
/// `response`, when present, is written to the client before closing.
#[derive(Debug, Error)]
#[error("session closed")]
pub struct Disconnect {
    pub reason: Option<SessionError>,
    pub response: Option<Response>,
}

impl Disconnect {
    fn clean() -> Self {
        Self {
            reason: None,
            response: None,
        }
    }
}

fn failure(err: &SessionError) -> Response {
    Response::Failure {
        code: err.status().code().to_string(),
        message: err.to_string(),
    }
}

/// Per-connection session state machine.
///
/// Owns the [`ConnectionState`] and drives the current [`State`] with each request. Errors
/// never escape a transition: they become FAILED or a [`Disconnect`].
pub struct StateMachine {
    services: Arc<Services>,
    profile: Arc<MachineProfile>,
    connection_id: String,
    interrupts: InterruptSignal,
    state: State,
    connection: ConnectionState,
    closed: bool,
}

impl StateMachine {
    pub fn new(
        services: Arc<Services>,
        profile: Arc<MachineProfile>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            services,
            profile,
            connection_id: connection_id.into(),
            interrupts: InterruptSignal::new(),
            state: State::Connected,
            connection: ConnectionState::new(),
            closed: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn profile(&self) -> &MachineProfile {
        &self.profile
    }

    /// Handle for raising interrupts from outside the processing thread.
    pub fn interrupt_signal(&self) -> InterruptSignal {
        self.interrupts.clone()
    }

    /// Raises an interrupt; takes effect before the next message is processed.
    pub fn interrupt(&self) {
        self.interrupts.interrupt();
    }

    /// Asks the running transaction to stop. The next PULL or DISCARD fails.
    pub fn mark_for_termination(&mut self) {
        self.connection.mark_for_termination();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn decode(&self, frame: &[u8]) -> Result<RequestMessage, DecodeError> {
        MessageDecoder::new(
            &self.profile.signatures,
            self.services.connector.bookmark_parser(),
        )
        .decode(frame)
    }

    /// Ends the session because a frame could not be decoded.
    pub fn reject(&mut self, err: DecodeError) -> Disconnect {
        let err = SessionError::from(err);
        let mut records: Vec<Vec<Value>> = Vec::new();
        let mut ctx = StateMachineContext::new(
            &self.services,
            &self.profile,
            &self.connection_id,
            &self.interrupts,
            &mut self.connection,
            &mut records,
        );
        ctx.handle_failure(&err, true);
        self.disconnect(err)
    }

    /// Processes one request and returns the response to send.
    ///
    /// Records streamed by PULL are handed to `records` before the response is returned.
    pub fn process(
        &mut self,
        message: RequestMessage,
        records: &mut dyn RecordSink,
    ) -> Result<Response, Disconnect> {
        if self.closed {
            return Err(Disconnect {
                reason: Some(SessionError::Transport("session already closed".into())),
                response: None,
            });
        }
        if let RequestMessage::Goodbye = message {
            debug!("[{}] client said goodbye", self.connection_id);
            self.close();
            return Err(Disconnect::clean());
        }

        let interrupt = matches!(message, RequestMessage::Interrupt);
        if interrupt {
            self.interrupts.interrupt();
        }
        if self.interrupts.pending() > 0 && self.state != State::Interrupted {
            debug!(
                "[{}] interrupted in {}",
                self.connection_id,
                self.state.name()
            );
            self.apply(RequestMessage::Interrupt, records)?;
        }
        if interrupt {
            return Ok(Response::Ignored);
        }
        self.apply(message, records)
    }

    fn apply(
        &mut self,
        message: RequestMessage,
        records: &mut dyn RecordSink,
    ) -> Result<Response, Disconnect> {
        self.connection.begin_cycle();
        let name = message.name();
        match self.transition(message, records) {
            Transition::Next(next) => {
                if next != self.state {
                    debug!(
                        "[{}] {name}: {} -> {}",
                        self.connection_id,
                        self.state.name(),
                        next.name()
                    );
                }
                self.state = next;
                if self.connection.is_ignored() {
                    self.connection.clear_metadata();
                    Ok(Response::Ignored)
                } else {
                    Ok(Response::Success {
                        metadata: self.connection.take_metadata(),
                    })
                }
            }
            Transition::Failed(err) => {
                self.state = State::Failed;
                self.connection.clear_metadata();
                Ok(failure(&err))
            }
            Transition::Fatal(err) => Err(self.disconnect(err)),
        }
    }

    /// Runs the current state's logic and classifies its outcome.
    fn transition(&mut self, message: RequestMessage, records: &mut dyn RecordSink) -> Transition {
        let current = self.state;
        let mut ctx = StateMachineContext::new(
            &self.services,
            &self.profile,
            &self.connection_id,
            &self.interrupts,
            &mut self.connection,
            records,
        );
        match current.process(message, &mut ctx) {
            Ok(next) => Transition::Next(next),
            Err(err) => {
                let fatal = current == State::Connected
                    || matches!(
                        err.class(),
                        ErrorClass::ProtocolViolation | ErrorClass::Transport
                    );
                ctx.handle_failure(&err, fatal);
                if fatal {
                    Transition::Fatal(err)
                } else {
                    Transition::Failed(err)
                }
            }
        }
    }

    fn disconnect(&mut self, err: SessionError) -> Disconnect {
        let response = self.connection.login().map(|_| failure(&err));
        self.close();
        Disconnect {
            reason: Some(err),
            response,
        }
    }

    /// Rolls back any open transaction and releases the session.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(transaction) = self.connection.take_transaction() {
            if let Err(err) = self.services.transactions.rollback(&transaction) {
                warn!(
                    "[{}] rollback of {transaction} on close failed: {err}",
                    self.connection_id
                );
            }
        }
        self.connection.reset();
        self.closed = true;
        info!("[{}] session closed", self.connection_id);
    }
}

impl Drop for StateMachine {
    fn drop(&mut self) {
        self.close();
    }
}
