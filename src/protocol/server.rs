use std::{
    io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread,
};

use log::{debug, error, info, trace, warn};
use thiserror::Error;

use crate::{
    config::ServerConfig,
    packstream::{PackstreamReader, Value},
    runtime::{
        InterruptSignal, ProfileRegistry, RecordSink, SessionError, Services, StateMachine,
    },
};

use super::{
    Response, ThreadPool,
    message::MessageKind,
    transport::{ProtocolTransport, TransportError},
};

/// Frames read ahead of the one being processed.
const FRAME_QUEUE: usize = 8;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("server IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Stops a running [`TetherServer`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    address: SocketAddr,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown requested");
        // Wake the accept loop so it observes the flag.
        if let Err(e) = TcpStream::connect(self.address) {
            debug!("failed to wake listener: {e}");
        }
    }
}

pub struct TetherServer {
    listener: TcpListener,
    registry: Arc<ProfileRegistry>,
    services: Arc<Services>,
    pool: ThreadPool,
    max_message_size: usize,
    connections: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl TetherServer {
    pub fn bind(config: &ServerConfig, services: Services) -> Result<Self, ServerError> {
        if config.workers == 0 {
            return Err(ServerError::Config("at least one worker is required".into()));
        }
        let listener = TcpListener::bind(config.address)?;
        Ok(Self {
            listener,
            registry: Arc::new(ProfileRegistry::v4(config.interrupted_policy)),
            services: Arc::new(services),
            pool: ThreadPool::new(config.workers),
            max_message_size: config.max_message_size,
            connections: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> Result<ShutdownHandle, ServerError> {
        Ok(ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            address: self.local_addr()?,
        })
    }

    pub fn listen(self) -> Result<(), ServerError> {
        let versions: Vec<String> = self.registry.versions().map(|v| v.to_string()).collect();
        info!(
            "listening at {} (protocol {})",
            self.local_addr()?,
            versions.join(", ")
        );

        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let n = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
                    let connection_id = format!("bolt-{n}");
                    let registry = Arc::clone(&self.registry);
                    let services = Arc::clone(&self.services);
                    let max_message_size = self.max_message_size;
                    self.pool.execute(move || {
                        if let Err(e) = handle_connection(
                            stream,
                            &registry,
                            services,
                            &connection_id,
                            max_message_size,
                        ) {
                            warn!("[{connection_id}] connection failed: {e}");
                        }
                    });
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        info!("stopped accepting connections");
        Ok(())
    }
}

/// Writes PULL records straight to the client as RECORD messages.
struct RecordWriter<'t> {
    transport: &'t mut ProtocolTransport<TcpStream>,
}

impl RecordSink for RecordWriter<'_> {
    fn on_record(&mut self, fields: Vec<Value>) -> Result<(), SessionError> {
        self.transport
            .write_response(&Response::Record { fields })
            .map_err(|e| SessionError::Transport(e.to_string()))
    }
}

fn handle_connection(
    stream: TcpStream,
    registry: &ProfileRegistry,
    services: Arc<Services>,
    connection_id: &str,
    max_message_size: usize,
) -> Result<(), TransportError> {
    let peer = stream.peer_addr()?;
    let mut transport = ProtocolTransport::new(stream);

    let proposals = transport.read_handshake()?;
    let Some(profile) = registry.negotiate(&proposals) else {
        warn!("[{connection_id}] {peer} proposed no supported version: {proposals:08x?}");
        transport.write_version(0)?;
        return Ok(());
    };
    transport.write_version(profile.version.encode())?;
    info!(
        "[{connection_id}] {peer} connected with protocol {}",
        profile.version
    );

    let reset_tag = profile.signatures.tag(MessageKind::Reset);
    let reader = ProtocolTransport::new(transport.get_ref().try_clone()?)
        .with_max_message_size(max_message_size);
    let mut machine = StateMachine::new(services, profile, connection_id);
    let signal = machine.interrupt_signal();
    let (sender, receiver) = mpsc::sync_channel(FRAME_QUEUE);

    thread::scope(|scope| {
        scope.spawn(move || read_frames(reader, sender, signal, reset_tag));

        let result = process_frames(&mut transport, &mut machine, receiver);
        machine.close();
        if let Err(e) = transport.get_ref().shutdown(Shutdown::Both) {
            trace!("[{connection_id}] socket already closed: {e}");
        }
        result
    })
}

/// Splits frames off the socket, raising an interrupt for every RESET before queueing it.
fn read_frames(
    mut reader: ProtocolTransport<TcpStream>,
    sender: mpsc::SyncSender<Result<Vec<u8>, TransportError>>,
    signal: InterruptSignal,
    reset_tag: Option<u8>,
) {
    loop {
        let frame = reader.read_frame();
        if let Ok(frame) = &frame {
            let tag = PackstreamReader::new(frame)
                .read_struct_header()
                .ok()
                .map(|h| h.tag);
            if tag.is_some() && tag == reset_tag {
                signal.interrupt();
            }
        }
        let failed = frame.is_err();
        if sender.send(frame).is_err() || failed {
            break;
        }
    }
}

fn process_frames(
    transport: &mut ProtocolTransport<TcpStream>,
    machine: &mut StateMachine,
    frames: mpsc::Receiver<Result<Vec<u8>, TransportError>>,
) -> Result<(), TransportError> {
    let connection_id = machine.connection_id().to_string();

    for frame in frames {
        let frame = match frame {
            Ok(frame) => frame,
            Err(TransportError::Closed) => {
                debug!("[{connection_id}] client hung up");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let outcome = {
            let mut records = RecordWriter {
                transport: &mut *transport,
            };
            match machine.decode(&frame) {
                Ok(message) => {
                    trace!("[{connection_id}] received {message:?}");
                    machine.process(message, &mut records)
                }
                Err(e) => Err(machine.reject(e)),
            }
        };

        match outcome {
            Ok(response) => {
                transport.write_response(&response)?;
                transport.flush()?;
            }
            Err(disconnect) => {
                if let Some(response) = &disconnect.response {
                    transport.write_response(response)?;
                    transport.flush()?;
                }
                match disconnect.reason {
                    Some(SessionError::Transport(reason)) => {
                        error!("[{connection_id}] transport failure: {reason}")
                    }
                    Some(reason) => debug!("[{connection_id}] closing: {reason}"),
                    None => debug!("[{connection_id}] closing on request"),
                }
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        packstream::{PackstreamWriter, StructHeader},
        protocol::{FAILURE, IGNORED, ProtocolVersion, RECORD, SUCCESS},
    };

    use super::*;

    fn start() -> (SocketAddr, ShutdownHandle, thread::JoinHandle<()>) {
        start_with(ServerConfig::default())
    }

    fn start_with(config: ServerConfig) -> (SocketAddr, ShutdownHandle, thread::JoinHandle<()>) {
        let config = ServerConfig {
            address: SocketAddr::from(([127, 0, 0, 1], 0)),
            workers: 2,
            ..config
        };
        let server = TetherServer::bind(&config, config.memory_services()).unwrap();
        let address = server.local_addr().unwrap();
        let handle = server.shutdown_handle().unwrap();
        let join = thread::spawn(move || server.listen().unwrap());
        (address, handle, join)
    }

    fn message(tag: u8, fields: Vec<Value>) -> Vec<u8> {
        let mut writer = PackstreamWriter::new();
        writer
            .write_struct_header(StructHeader {
                tag,
                size: fields.len(),
            })
            .unwrap();
        for field in &fields {
            writer.write_value(field).unwrap();
        }
        writer.into_bytes()
    }

    fn map(entries: &[(&str, Value)]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn tag(frame: &[u8]) -> u8 {
        PackstreamReader::new(frame).read_struct_header().unwrap().tag
    }

    fn connect(address: SocketAddr) -> ProtocolTransport<TcpStream> {
        let mut client = ProtocolTransport::new(TcpStream::connect(address).unwrap());
        client.write_handshake([0x0000_0404, 0, 0, 0]).unwrap();
        assert_eq!(
            ProtocolVersion::negotiated(client.read_version().unwrap()),
            Some(ProtocolVersion::new(4, 4))
        );
        client
    }

    #[test]
    fn session_over_tcp() {
        let (address, handle, join) = start();
        let mut client = connect(address);

        client
            .write_frame(&message(
                0x01,
                vec![map(&[
                    ("user_agent", Value::from("test/1.0")),
                    ("scheme", Value::from("none")),
                ])],
            ))
            .unwrap();
        assert_eq!(tag(&client.read_frame().unwrap()), SUCCESS);

        client
            .write_frame(&message(
                0x10,
                vec![
                    Value::from("UNWIND range(1, 2) AS n RETURN n"),
                    map(&[]),
                    map(&[]),
                ],
            ))
            .unwrap();
        client
            .write_frame(&message(0x3F, vec![map(&[("n", Value::Integer(-1))])]))
            .unwrap();
        assert_eq!(tag(&client.read_frame().unwrap()), SUCCESS);
        assert_eq!(tag(&client.read_frame().unwrap()), RECORD);
        assert_eq!(tag(&client.read_frame().unwrap()), RECORD);
        assert_eq!(tag(&client.read_frame().unwrap()), SUCCESS);

        client
            .write_frame(&message(0x10, vec![Value::from("nonsense"), map(&[]), map(&[])]))
            .unwrap();
        assert_eq!(tag(&client.read_frame().unwrap()), FAILURE);
        client
            .write_frame(&message(0x3F, vec![map(&[("n", Value::Integer(-1))])]))
            .unwrap();
        assert_eq!(tag(&client.read_frame().unwrap()), IGNORED);
        client.write_frame(&message(0x0F, vec![])).unwrap();
        assert_eq!(tag(&client.read_frame().unwrap()), SUCCESS);

        client.write_frame(&message(0x02, vec![])).unwrap();
        assert!(matches!(client.read_frame(), Err(TransportError::Closed)));

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn oversized_message_closes_connection() {
        let (address, handle, join) = start_with(ServerConfig {
            max_message_size: 64,
            ..Default::default()
        });
        let mut client = connect(address);

        let hello = message(
            0x01,
            vec![map(&[
                ("user_agent", Value::from("test/1.0")),
                ("scheme", Value::from("none")),
            ])],
        );
        assert!(hello.len() <= 64);
        client.write_frame(&hello).unwrap();
        assert_eq!(tag(&client.read_frame().unwrap()), SUCCESS);

        let statement = Value::from("x".repeat(100));
        client
            .write_frame(&message(0x10, vec![statement, map(&[]), map(&[])]))
            .unwrap();
        // the peer may see either a clean close or a reset
        assert!(client.read_frame().is_err());

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn unsupported_versions_are_refused() {
        let (address, handle, join) = start();
        let mut client = ProtocolTransport::new(TcpStream::connect(address).unwrap());

        client.write_handshake([0x0000_0003, 0, 0, 0]).unwrap();
        assert_eq!(ProtocolVersion::negotiated(client.read_version().unwrap()), None);

        handle.shutdown();
        join.join().unwrap();
    }
}
