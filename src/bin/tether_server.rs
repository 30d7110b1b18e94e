use std::{error::Error, net::SocketAddr, time::Duration};

use clap::{Parser, ValueEnum};
use log::info;
use tether::{ServerConfig, TetherServer, runtime::InterruptPolicy};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnInterrupted {
    /// Answer IGNORED until the pending RESET arrives
    Ignore,
    /// Close the connection
    Close,
}

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Listen for new connection at address
    #[arg(default_value = "127.0.0.1:7687")]
    address: SocketAddr,
    /// Number of connections served concurrently
    #[arg(short, long, default_value_t = 15)]
    workers: usize,
    /// Receive timeout advertised to clients, in seconds
    #[arg(long)]
    recv_timeout: Option<u64>,
    /// Handling of requests queued behind an interrupting RESET
    #[arg(long, value_enum, default_value_t = OnInterrupted::Ignore)]
    on_interrupted: OnInterrupted,
    /// Largest request message accepted, in bytes
    #[arg(long, default_value_t = tether::protocol::MAX_MESSAGE_SIZE)]
    max_message_size: usize,
    /// Name of the in-memory database
    #[arg(long, default_value = tether::memory::DEFAULT_DATABASE)]
    database: String,
    /// Require basic authentication as this user
    #[arg(long, requires = "password")]
    user: Option<String>,
    /// Password of --user
    #[arg(long)]
    password: Option<String>,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        Self {
            address: cli.address,
            workers: cli.workers,
            recv_timeout: cli.recv_timeout.map(Duration::from_secs),
            interrupted_policy: match cli.on_interrupted {
                OnInterrupted::Ignore => InterruptPolicy::Ignore,
                OnInterrupted::Close => InterruptPolicy::Fatal,
            },
            database: cli.database,
            credentials: cli.user.zip(cli.password),
            max_message_size: cli.max_message_size,
            ..Default::default()
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = ServerConfig::from(Cli::parse());
    let server = TetherServer::bind(&config, config.memory_services())?;

    let handle = server.shutdown_handle()?;
    ctrlc::set_handler(move || handle.shutdown())?;

    server.listen()?;
    info!("server stopped");
    Ok(())
}
