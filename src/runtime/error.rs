use thiserror::Error;

use crate::protocol::DecodeError;

/// Status codes reported to clients in FAILURE messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    RequestInvalid,
    InvalidFormat,
    Unauthorized,
    AuthorizationExpired,
    SyntaxError,
    ParameterMissing,
    TypeError,
    TransactionNotFound,
    TransactionTerminated,
    InvalidBookmark,
    BookmarkTimeout,
    StatementNotFound,
    DatabaseNotFound,
    ConnectionClosed,
    UnknownError,
}

impl Status {
    pub fn code(self) -> &'static str {
        match self {
            Status::RequestInvalid => "Neo.ClientError.Request.Invalid",
            Status::InvalidFormat => "Neo.ClientError.Request.InvalidFormat",
            Status::Unauthorized => "Neo.ClientError.Security.Unauthorized",
            Status::AuthorizationExpired => "Neo.ClientError.Security.AuthorizationExpired",
            Status::SyntaxError => "Neo.ClientError.Statement.SyntaxError",
            Status::ParameterMissing => "Neo.ClientError.Statement.ParameterMissing",
            Status::TypeError => "Neo.ClientError.Statement.TypeError",
            Status::TransactionNotFound => "Neo.ClientError.Transaction.TransactionNotFound",
            Status::TransactionTerminated => "Neo.TransientError.Transaction.Terminated",
            Status::InvalidBookmark => "Neo.ClientError.Transaction.InvalidBookmark",
            Status::BookmarkTimeout => "Neo.TransientError.Transaction.BookmarkTimeout",
            Status::StatementNotFound => "Neo.ClientError.Request.Invalid",
            Status::DatabaseNotFound => "Neo.ClientError.Database.DatabaseNotFound",
            Status::ConnectionClosed => "Neo.TransientError.General.ConnectionClosed",
            Status::UnknownError => "Neo.DatabaseError.General.UnknownError",
        }
    }
}

/// How an error affects the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or out of order request. Always closes the connection.
    ProtocolViolation,
    Authentication,
    AuthorizationExpired,
    /// Statement or transaction failure. The session moves to FAILED.
    Execution,
    /// The connection itself is broken.
    Transport,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("invalid request: {0}")]
    Decode(#[from] DecodeError),

    #[error("message {message} cannot be handled by a session in the {state} state")]
    IllegalMessage {
        message: &'static str,
        state: &'static str,
    },

    #[error("{0}")]
    Protocol(String),

    #[error("authentication failure: {0}")]
    Authentication(String),

    #[error("authorization expired: {0}")]
    AuthorizationExpired(String),

    #[error("{message}")]
    Execution { status: Status, message: String },

    #[error("transaction has been terminated")]
    TransactionTerminated,

    #[error("no open statement with id {0}")]
    StatementNotFound(u64),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn execution(status: Status, message: impl Into<String>) -> Self {
        SessionError::Execution {
            status,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::Decode(_)
            | SessionError::IllegalMessage { .. }
            | SessionError::Protocol(_) => ErrorClass::ProtocolViolation,
            SessionError::Authentication(_) => ErrorClass::Authentication,
            SessionError::AuthorizationExpired(_) => ErrorClass::AuthorizationExpired,
            SessionError::Execution { .. }
            | SessionError::TransactionTerminated
            | SessionError::StatementNotFound(_) => ErrorClass::Execution,
            SessionError::Transport(_) => ErrorClass::Transport,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            SessionError::Decode(_) => Status::InvalidFormat,
            SessionError::IllegalMessage { .. } | SessionError::Protocol(_) => {
                Status::RequestInvalid
            }
            SessionError::Authentication(_) => Status::Unauthorized,
            SessionError::AuthorizationExpired(_) => Status::AuthorizationExpired,
            SessionError::Execution { status, .. } => *status,
            SessionError::TransactionTerminated => Status::TransactionTerminated,
            SessionError::StatementNotFound(_) => Status::StatementNotFound,
            SessionError::Transport(_) => Status::ConnectionClosed,
        }
    }
}
