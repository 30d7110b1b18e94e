pub mod config;
pub mod memory;
pub mod packstream;
pub mod protocol;
pub mod runtime;
pub mod statement;

pub use config::ServerConfig;
pub use memory::{MemoryDatabase, StaticAuthenticator};
pub use protocol::TetherServer;
pub use runtime::{MachineProfile, SessionError, State, StateMachine};
pub use statement::Statement;
