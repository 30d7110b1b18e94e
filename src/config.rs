use std::{net::SocketAddr, sync::Arc, time::Duration};

use crate::{
    memory::{DEFAULT_DATABASE, MemoryDatabase, StaticAuthenticator},
    protocol::MAX_MESSAGE_SIZE,
    runtime::{Connector, InterruptPolicy, Services, SystemClock},
};

/// Runtime configuration of a tether server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: SocketAddr,
    /// Connections served concurrently.
    pub workers: usize,
    /// Agent string reported to clients in HELLO.
    pub server_agent: String,
    /// Advertised to clients as the `connection.recv_timeout_seconds` hint.
    pub recv_timeout: Option<Duration>,
    pub interrupted_policy: InterruptPolicy,
    pub database: String,
    /// Single `basic` user; without one every client is accepted.
    pub credentials: Option<(String, String)>,
    /// Largest request message in bytes; bigger ones close the connection.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 7687)),
            workers: 15,
            server_agent: format!("tether/{}", env!("CARGO_PKG_VERSION")),
            recv_timeout: None,
            interrupted_policy: InterruptPolicy::Ignore,
            database: DEFAULT_DATABASE.to_string(),
            credentials: None,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn connector(&self) -> Connector {
        let authenticator = match &self.credentials {
            Some((user, password)) => StaticAuthenticator::basic(user, password),
            None => StaticAuthenticator::open(),
        };
        let connector = Connector::new(&self.server_agent, Arc::new(authenticator));
        match self.recv_timeout {
            Some(timeout) => {
                connector.with_hint("connection.recv_timeout_seconds", timeout.as_secs() as i64)
            }
            None => connector,
        }
    }

    /// Collaborators backed by the in-memory database.
    pub fn memory_services(&self) -> Services {
        Services {
            connector: self.connector(),
            transactions: Arc::new(MemoryDatabase::new(&self.database)),
            clock: Arc::new(SystemClock),
        }
    }
}
