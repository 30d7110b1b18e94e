use std::io::{self, Read, Write};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_into_std_write,
};
use log::trace;
use thiserror::Error;

use crate::packstream::PackstreamError;

use super::Response;

/// Preamble that opens every connection.
pub const MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Largest reassembled message accepted by default.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const MAX_CHUNK: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("failed to encode response: {0}")]
    Packstream(#[from] PackstreamError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid handshake preamble {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("message exceeds {0} bytes")]
    MessageTooLarge(usize),
    #[error("connection closed by peer")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
struct Handshake {
    magic: [u8; 4],
    proposals: [u32; 4],
}

/// Handshake and chunked message framing over a byte stream.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    config: Configuration<BigEndian, Fixint>,
    max_message: usize,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self {
            stream,
            config,
            max_message: MAX_MESSAGE_SIZE,
        }
    }

    /// Caps the size of a reassembled message read by [`Self::read_frame`].
    pub fn with_max_message_size(mut self, max_message: usize) -> Self {
        self.max_message = max_message;
        self
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Reads the client preamble and returns its four version proposals.
    pub fn read_handshake(&mut self) -> Result<[u32; 4], TransportError> {
        let handshake: Handshake = decode_from_std_read(&mut self.stream, self.config)
            .map_err(closed_on_eof)?;
        if handshake.magic != MAGIC {
            return Err(TransportError::BadMagic(handshake.magic));
        }
        Ok(handshake.proposals)
    }

    pub fn write_handshake(&mut self, proposals: [u32; 4]) -> Result<(), TransportError> {
        let handshake = Handshake {
            magic: MAGIC,
            proposals,
        };
        encode_into_std_write(handshake, &mut self.stream, self.config)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Answers the handshake. Zero means no proposal was acceptable.
    pub fn write_version(&mut self, version: u32) -> Result<(), TransportError> {
        encode_into_std_write(version, &mut self.stream, self.config)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn read_version(&mut self) -> Result<u32, TransportError> {
        let version: u32 = decode_from_std_read(&mut self.stream, self.config)?;
        Ok(version)
    }

    /// Reads one chunked message. Empty messages (keep-alive no-ops) are skipped.
    pub fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut frame = Vec::new();
        loop {
            let size: u16 = decode_from_std_read(&mut self.stream, self.config)
                .map_err(closed_on_eof)?;
            if size == 0 {
                if frame.is_empty() {
                    trace!("skipping empty frame");
                    continue;
                }
                return Ok(frame);
            }
            let start = frame.len();
            if start + size as usize > self.max_message {
                return Err(TransportError::MessageTooLarge(self.max_message));
            }
            frame.resize(start + size as usize, 0);
            self.stream.read_exact(&mut frame[start..])?;
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        for chunk in payload.chunks(MAX_CHUNK) {
            encode_into_std_write(chunk.len() as u16, &mut self.stream, self.config)?;
            self.stream.write_all(chunk)?;
        }
        encode_into_std_write(0u16, &mut self.stream, self.config)?;
        Ok(())
    }

    pub fn write_response(&mut self, resp: &Response) -> Result<(), TransportError> {
        self.write_frame(&resp.encode()?)
    }

    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.stream.flush()?;
        Ok(())
    }
}

fn closed_on_eof(err: bincode::error::DecodeError) -> TransportError {
    match err {
        bincode::error::DecodeError::Io { inner, .. }
            if inner.kind() == io::ErrorKind::UnexpectedEof =>
        {
            TransportError::Closed
        }
        bincode::error::DecodeError::UnexpectedEnd { .. } => TransportError::Closed,
        other => TransportError::Deserialize(other),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek, SeekFrom};

    use crate::packstream::Value;

    use super::*;

    #[test]
    fn read_write_handshake() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport
            .write_handshake([0x0002_0404, 0x0000_0104, 0, 0])
            .unwrap();
        assert_eq!(
            &transport.get_ref().get_ref()[..8],
            &[0x60, 0x60, 0xB0, 0x17, 0x00, 0x02, 0x04, 0x04]
        );

        transport.stream.seek(SeekFrom::Start(0)).unwrap();
        let proposals = transport.read_handshake().unwrap();
        assert_eq!(proposals, [0x0002_0404, 0x0000_0104, 0, 0]);
    }

    #[test]
    #[should_panic(expected = "BadMagic")]
    fn rejects_bad_magic() {
        let mut bytes = vec![0x47, 0x45, 0x54, 0x20];
        bytes.extend_from_slice(&[0; 16]);
        let mut transport = ProtocolTransport::new(Cursor::new(bytes));

        transport.read_handshake().unwrap();
    }

    #[test]
    fn version_reply() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));

        transport.write_version(0x0000_0404).unwrap();
        assert_eq!(transport.get_ref().get_ref(), &vec![0, 0, 4, 4]);
    }

    #[test]
    fn read_write_frame() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport.write_frame(&[0xB0, 0x0F]).unwrap();
        assert_eq!(
            transport.get_ref().get_ref(),
            &vec![0x00, 0x02, 0xB0, 0x0F, 0x00, 0x00]
        );

        transport.stream.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(transport.read_frame().unwrap(), vec![0xB0, 0x0F]);
    }

    #[test]
    fn large_frames_are_chunked() {
        let payload = vec![7u8; MAX_CHUNK + 10];
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));

        transport.write_frame(&payload).unwrap();
        assert_eq!(
            transport.get_ref().get_ref().len(),
            payload.len() + 3 * 2
        );

        transport.stream.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(transport.read_frame().unwrap(), payload);
    }

    #[test]
    fn noop_chunks_are_skipped() {
        let bytes = vec![0x00, 0x00, 0x00, 0x02, 0xB0, 0x02, 0x00, 0x00];
        let mut transport = ProtocolTransport::new(Cursor::new(bytes));

        assert_eq!(transport.read_frame().unwrap(), vec![0xB0, 0x02]);
    }

    #[test]
    fn message_size_limit() {
        let cases: &[(&[u8], bool)] = &[
            (&[0x00, 0x04, 1, 2, 3, 4, 0x00, 0x00], true),
            (&[0x00, 0x02, 1, 2, 0x00, 0x02, 3, 4, 0x00, 0x00], true),
            (&[0x00, 0x05, 1, 2, 3, 4, 5, 0x00, 0x00], false),
            (&[0x00, 0x03, 1, 2, 3, 0x00, 0x02, 4, 5, 0x00, 0x00], false),
            (&[0xFF, 0xFF], false),
        ];

        for (bytes, accepted) in cases {
            let mut transport =
                ProtocolTransport::new(Cursor::new(bytes.to_vec())).with_max_message_size(4);
            let result = transport.read_frame();
            if *accepted {
                assert_eq!(result.unwrap().len(), 4, "{bytes:?}");
            } else {
                assert!(
                    matches!(result, Err(TransportError::MessageTooLarge(4))),
                    "{bytes:?}"
                );
            }
        }
    }

    #[test]
    fn eof_reports_closed() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));

        assert!(matches!(
            transport.read_frame(),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn write_response_frames_message() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        let resp = Response::Record {
            fields: vec![Value::Integer(1)],
        };

        transport.write_response(&resp).unwrap();
        transport.stream.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(transport.read_frame().unwrap(), resp.encode().unwrap());
    }
}
